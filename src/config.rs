use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8080";
pub const DEFAULT_MAX_HEADER_SIZE: usize = 16 * 1024;
pub const DEFAULT_RELAY_BUFFER_SIZE: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

impl From<LogLevel> for log::LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => log::LevelFilter::Trace,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Error => log::LevelFilter::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutputType {
    Stdout,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogTarget {
    #[serde(rename = "type")]
    pub output_type: LogOutputType,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub level: Option<LogLevel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: Option<LogLevel>,
    #[serde(default)]
    pub format: Option<LogFormat>,
    #[serde(default)]
    pub targets: Option<Vec<LogTarget>>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Some(LogLevel::Info),
            format: Some(LogFormat::Text),
            targets: Some(vec![LogTarget {
                output_type: LogOutputType::Stdout,
                path: None,
                level: None,
            }]),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    /// Concurrent session cap. Unlimited when absent.
    #[serde(default)]
    pub max_connections: Option<usize>,
    #[serde(default)]
    pub connect_timeout_secs: Option<u64>,
    /// Bounds the time a client may take to deliver its request head.
    #[serde(default)]
    pub header_timeout_secs: Option<u64>,
    #[serde(default = "default_max_header_size")]
    pub max_header_size: usize,
    #[serde(default = "default_relay_buffer_size")]
    pub relay_buffer_size: usize,
    /// Write a minimal HTTP error response before closing a failed session.
    #[serde(default)]
    pub error_responses: bool,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_max_header_size() -> usize {
    DEFAULT_MAX_HEADER_SIZE
}

fn default_relay_buffer_size() -> usize {
    DEFAULT_RELAY_BUFFER_SIZE
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            max_connections: None,
            connect_timeout_secs: None,
            header_timeout_secs: None,
            max_header_size: DEFAULT_MAX_HEADER_SIZE,
            relay_buffer_size: DEFAULT_RELAY_BUFFER_SIZE,
            error_responses: false,
            logging: None,
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> Result<(), Box<dyn std::error::Error>> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_secs.map(Duration::from_secs)
    }

    pub fn header_timeout(&self) -> Option<Duration> {
        self.header_timeout_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_reproduce_plain_proxy() {
        let config = Config::default();
        assert_eq!(config.listen_addr.to_string(), DEFAULT_LISTEN_ADDR);
        assert_eq!(config.max_header_size, 16 * 1024);
        assert!(config.connect_timeout().is_none());
        assert!(config.header_timeout().is_none());
        assert!(!config.error_responses);
    }

    #[test]
    fn missing_fields_take_defaults() {
        let config: Config = serde_json::from_str(r#"{"connect_timeout_secs": 3}"#).unwrap();
        assert_eq!(config.connect_timeout(), Some(Duration::from_secs(3)));
        assert_eq!(config.relay_buffer_size, DEFAULT_RELAY_BUFFER_SIZE);
        assert_eq!(config.listen_addr, default_listen_addr());
    }

    #[test]
    fn file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gangway.json");
        let path = path.to_str().unwrap();

        let mut config = Config::default();
        config.listen_addr = "0.0.0.0:3128".parse().unwrap();
        config.max_connections = Some(64);
        config.logging = Some(LoggingConfig::default());
        config.to_file(path).unwrap();

        let loaded = Config::from_file(path).unwrap();
        assert_eq!(loaded.listen_addr.port(), 3128);
        assert_eq!(loaded.max_connections, Some(64));
        assert_eq!(loaded.logging.unwrap().format, Some(LogFormat::Text));
    }

    #[test]
    fn log_targets_parse_lowercase_names() {
        let logging: LoggingConfig = serde_json::from_str(
            r#"{"level":"debug","format":"json","targets":[{"type":"file","path":"/tmp/g.log","level":"warn"}]}"#,
        )
        .unwrap();
        assert_eq!(logging.level, Some(LogLevel::Debug));
        let targets = logging.targets.unwrap();
        assert_eq!(targets[0].output_type, LogOutputType::File);
        assert_eq!(log::LevelFilter::from(targets[0].level.unwrap()), log::LevelFilter::Warn);
    }
}
