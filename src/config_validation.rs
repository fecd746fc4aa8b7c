//! Configuration validation
//!
//! Checks a loaded [`Config`] before the listener binds. Errors make the
//! configuration unusable; warnings and suggestions are only reported.

use crate::config::{Config, LogOutputType};

/// Header caps beyond this are accepted but flagged.
const LARGE_HEADER_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub suggestions: Vec<String>,
}

impl ValidationResult {
    pub fn success() -> Self {
        Self {
            is_valid: true,
            errors: vec![],
            warnings: vec![],
            suggestions: vec![],
        }
    }

    pub fn add_error(&mut self, error: String) {
        self.errors.push(error);
        self.is_valid = false;
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn add_suggestion(&mut self, suggestion: String) {
        self.suggestions.push(suggestion);
    }
}

pub fn validate(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::success();

    validate_limits(config, &mut result);
    validate_timeouts(config, &mut result);
    validate_logging(config, &mut result);

    if config.listen_addr.ip().is_unspecified() {
        result.add_warning(format!(
            "Listening on {}: the proxy is reachable from every interface",
            config.listen_addr
        ));
    }

    result
}

fn validate_limits(config: &Config, result: &mut ValidationResult) {
    if config.max_header_size == 0 {
        result.add_error("max_header_size must be greater than 0".to_string());
    } else if config.max_header_size > LARGE_HEADER_SIZE {
        result.add_warning(format!(
            "max_header_size of {} bytes lets each client buffer a large request head",
            config.max_header_size
        ));
    }

    if config.relay_buffer_size == 0 {
        result.add_error("relay_buffer_size must be greater than 0".to_string());
    }

    match config.max_connections {
        Some(0) => result.add_error("max_connections must be greater than 0".to_string()),
        None => result.add_suggestion(
            "Set max_connections to bound the number of concurrent sessions".to_string(),
        ),
        Some(_) => {}
    }
}

fn validate_timeouts(config: &Config, result: &mut ValidationResult) {
    if config.connect_timeout_secs == Some(0) {
        result.add_error("connect_timeout_secs must be greater than 0".to_string());
    }
    if config.header_timeout_secs == Some(0) {
        result.add_error("header_timeout_secs must be greater than 0".to_string());
    }
    if config.connect_timeout_secs.is_none() && config.header_timeout_secs.is_none() {
        result.add_warning(
            "No timeouts configured: stalled clients and upstreams hold sessions open".to_string(),
        );
    }
}

fn validate_logging(config: &Config, result: &mut ValidationResult) {
    let Some(targets) = config.logging.as_ref().and_then(|l| l.targets.as_ref()) else {
        return;
    };
    for (i, target) in targets.iter().enumerate() {
        if target.output_type == LogOutputType::File && target.path.is_none() {
            result.add_error(format!("Log target {} has type file but no path", i));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LogTarget, LoggingConfig};

    #[test]
    fn test_validation_success() {
        let mut config = Config::default();
        config.max_connections = Some(256);
        config.connect_timeout_secs = Some(10);

        let result = validate(&config);
        assert!(result.is_valid);
        assert!(result.errors.is_empty());
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_defaults_warn_about_timeouts() {
        let result = validate(&Config::default());
        assert!(result.is_valid);
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.suggestions.len(), 1);
    }

    #[test]
    fn test_zero_limits_are_errors() {
        let mut config = Config::default();
        config.max_header_size = 0;
        config.relay_buffer_size = 0;
        config.max_connections = Some(0);
        config.connect_timeout_secs = Some(0);
        config.header_timeout_secs = Some(0);

        let result = validate(&config);
        assert!(!result.is_valid);
        assert_eq!(result.errors.len(), 5);
    }

    #[test]
    fn test_large_header_cap_warns() {
        let mut config = Config::default();
        config.max_header_size = 8 * 1024 * 1024;
        config.header_timeout_secs = Some(5);

        let result = validate(&config);
        assert!(result.is_valid);
        assert!(result.warnings.iter().any(|w| w.contains("max_header_size")));
    }

    #[test]
    fn test_file_target_without_path() {
        let mut config = Config::default();
        config.logging = Some(LoggingConfig {
            level: None,
            format: None,
            targets: Some(vec![LogTarget {
                output_type: LogOutputType::File,
                path: None,
                level: None,
            }]),
        });

        let result = validate(&config);
        assert!(!result.is_valid);
        assert!(result.errors[0].contains("no path"));
    }
}
