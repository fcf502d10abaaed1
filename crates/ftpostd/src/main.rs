//! ftpostd: write-only FTP/FTPS to HTTP upload gateway
//!
//! Usage:
//!   ftpostd [--config /etc/ftpost/config.toml] [--check]
//!
//! Every file a client stores is relayed to `relay.url` as one
//! multipart/form-data POST. Nothing is kept on local disk past the upload.
//!
//! Exit codes:
//!   0  clean shutdown, or `--check` passed
//!   1  configuration file not found
//!   2  TLS certificate or key file not found
//!   3  configuration unreadable or invalid
//!   4  TLS material present but unusable
//!   5  FTP listener could not be bound

mod daemon;
mod metrics;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use ftpost_core::config::FtpostConfig;
use tracing::{error, info};

use crate::daemon::StartupError;

#[derive(Parser, Debug)]
#[command(name = "ftpostd", version, about = "Write-only FTP to HTTP upload gateway")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(
        long,
        short = 'c',
        env = "FTPOST_CONFIG",
        default_value = "/etc/ftpost/config.toml"
    )]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides daemon.log_level
    #[arg(long, env = "FTPOST_LOG")]
    log: Option<String>,

    /// Log format (json, text); overrides daemon.log_format
    #[arg(long, env = "FTPOST_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    /// Validate configuration, accounts and TLS material, then exit
    #[arg(long)]
    check: bool,
}

#[derive(Clone, Debug, ValueEnum, PartialEq)]
enum LogFormat {
    Json,
    Text,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // The config file may set the log level, so read it before logging is up
    // and report any failure once the subscriber exists.
    let loaded = load_config(&cli.config).await;

    let level = cli
        .log
        .clone()
        .or_else(|| loaded.as_ref().ok().map(|c| c.daemon.log_level.clone()))
        .unwrap_or_else(|| "info".into());
    let format = cli.log_format.clone().unwrap_or_else(|| {
        match loaded.as_ref().map(|c| c.daemon.log_format.as_str()) {
            Ok("json") => LogFormat::Json,
            _ => LogFormat::Text,
        }
    });
    init_logging(&level, &format);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "ftpostd starting"
    );

    let result = match loaded {
        Ok(config) => daemon::run(config, cli.check).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(exit_code = e.exit_code(), "{e}");
            ExitCode::from(e.exit_code())
        }
    }
}

async fn load_config(path: &Path) -> Result<FtpostConfig, StartupError> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(StartupError::ConfigNotFound(path.to_path_buf()))
        }
        Err(e) => {
            return Err(StartupError::InvalidConfig(format!(
                "reading config {}: {e}",
                path.display()
            )))
        }
    };
    let config: FtpostConfig = toml::from_str(&content).map_err(|e| {
        StartupError::InvalidConfig(format!("parsing config {}: {e}", path.display()))
    })?;
    config
        .validate()
        .map_err(|e| StartupError::InvalidConfig(format!("{}: {e}", path.display())))?;
    Ok(config)
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .init();
        }
    }
}
