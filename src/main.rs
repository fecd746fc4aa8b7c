use clap::Parser;
use gangway::config::{Config, LoggingConfig};
use gangway::config_validation;
use gangway::error::ProxyError;
use gangway::listener::Listener;
use gangway::logging::{self, CustomLogger};
use log::{error, info, warn};
use std::path::Path;
use tokio::signal;

#[derive(Parser)]
#[clap(
    version,
    about = "Forward HTTP proxy: rewrites absolute-URI requests and tunnels CONNECT"
)]
struct Args {
    #[clap(short, long, value_name = "ADDR", help = "Listen address (e.g., 127.0.0.1:8080)")]
    listen: Option<String>,

    #[clap(short, long, value_name = "FILE", help = "Configuration file path")]
    config: Option<String>,

    #[clap(long, value_name = "SECONDS", help = "Upstream connect timeout in seconds")]
    connect_timeout: Option<u64>,

    #[clap(long, value_name = "SECONDS", help = "Time allowed for a client to send its request head")]
    header_timeout: Option<u64>,

    #[clap(long, value_name = "BYTES", help = "Maximum buffered request head size in bytes")]
    max_header_size: Option<usize>,

    #[clap(long, value_name = "NUM", help = "Maximum concurrent sessions")]
    max_connections: Option<usize>,

    #[clap(long, help = "Answer failed requests with a minimal HTTP error before closing")]
    error_responses: bool,

    #[clap(long, value_name = "LEVEL", help = "Log level: trace, debug, info, warn, error")]
    log_level: Option<String>,

    #[clap(long, value_name = "FORMAT", help = "Log format: text or json")]
    log_format: Option<String>,

    #[clap(long, value_name = "FILE", help = "Generate a sample configuration file")]
    generate_config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if let Some(config_file) = &args.generate_config {
        generate_sample_config(config_file)?;
        println!("Sample configuration file generated: {}", config_file);
        return Ok(());
    }

    let mut config = if let Some(config_file) = &args.config {
        if !Path::new(config_file).exists() {
            return Err(format!("Configuration file not found: {}", config_file).into());
        }
        Config::from_file(config_file)?
    } else {
        Config::default()
    };
    apply_args(&mut config, &args)?;

    init_logging(&config, &args)?;

    let validation = config_validation::validate(&config);
    for warning in &validation.warnings {
        warn!("{}", warning);
    }
    for suggestion in &validation.suggestions {
        info!("{}", suggestion);
    }
    if !validation.is_valid {
        for err in &validation.errors {
            error!("{}", err);
        }
        return Err(ProxyError::Config(validation.errors.join("; ")).into());
    }

    let handle = Listener::bind(&config).await?.spawn()?;
    info!("Proxy ready on {}", handle.local_addr());

    signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down ({} active sessions)", handle.active_sessions());
    handle.shutdown().await?;
    info!("Proxy stopped");
    Ok(())
}

fn init_logging(config: &Config, args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    match &config.logging {
        Some(logging) => CustomLogger::init(logging.clone()),
        None => logging::init_fallback(args.log_level.as_deref(), args.log_format.as_deref()),
    }
}

/// Command-line flags override whatever the config file set.
fn apply_args(config: &mut Config, args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(listen) = &args.listen {
        config.listen_addr = listen.parse()?;
    }
    if args.connect_timeout.is_some() {
        config.connect_timeout_secs = args.connect_timeout;
    }
    if args.header_timeout.is_some() {
        config.header_timeout_secs = args.header_timeout;
    }
    if let Some(size) = args.max_header_size {
        config.max_header_size = size;
    }
    if args.max_connections.is_some() {
        config.max_connections = args.max_connections;
    }
    if args.error_responses {
        config.error_responses = true;
    }

    let level = args.log_level.as_deref().map(logging::parse_log_level).transpose()?;
    let format = args.log_format.as_deref().map(logging::parse_log_format).transpose()?;
    // Without a logging section the flags go straight to the env_logger fallback
    if let Some(section) = config.logging.as_mut() {
        if level.is_some() {
            section.level = level;
        }
        if format.is_some() {
            section.format = format;
        }
    }
    Ok(())
}

fn generate_sample_config(file_path: &str) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config {
        max_connections: Some(1024),
        connect_timeout_secs: Some(10),
        header_timeout_secs: Some(30),
        logging: Some(LoggingConfig::default()),
        ..Config::default()
    };
    config.to_file(file_path)
}
