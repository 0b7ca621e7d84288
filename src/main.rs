//! OCPP charging station
//!
//! ```sh
//! # Run with default config (~/.config/ocpp-station/config.toml)
//! ocpp-station
//!
//! # Custom config path and CSMS
//! ocpp-station --config /etc/ocpp-station/config.toml --csms-url wss://csms.example.com/ocpp
//!
//! # Validate config without starting
//! ocpp-station --check
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info};

use texnouz_station::support::errors::{AppError, ConfigError};
use texnouz_station::{default_config_path, init_tracing, AppConfig, StationHandle};

/// OCPP 1.6 / 2.0.1 charging station.
#[derive(Parser, Debug)]
#[command(
    name = "ocpp-station",
    version,
    about = "OCPP charging station with a reliable message queue and smart charging"
)]
struct Cli {
    /// Path to the configuration file (TOML).
    #[arg(short, long, env = "OCPP_STATION_CONFIG")]
    config: Option<PathBuf>,

    /// Override the log level (trace, debug, info, warn, error).
    #[arg(short, long)]
    log_level: Option<String>,

    /// Override the CSMS base URL.
    #[arg(long)]
    csms_url: Option<String>,

    /// Validate the configuration file and exit without starting.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let cli = Cli::parse();

    // ── Load configuration ─────────────────────────────────────
    let config_path = cli.config.unwrap_or_else(default_config_path);
    let (mut config, load_error) = match AppConfig::load(&config_path) {
        Ok(cfg) => (cfg, None),
        Err(e) => (AppConfig::default(), Some(e)),
    };

    // ── Apply CLI overrides ────────────────────────────────────
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if let Some(url) = cli.csms_url {
        config.csms.url = url;
    }

    init_tracing(&config);
    match load_error {
        None => info!("Configuration loaded from {}", config_path.display()),
        Some(ConfigError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("No configuration at {}, using defaults", config_path.display());
        }
        Some(e) => {
            error!("Failed to load config from {}: {}", config_path.display(), e);
            return Err(e.into());
        }
    }
    config.validate()?;

    // ── Config validation mode ─────────────────────────────────
    if cli.check {
        println!("✅ Configuration is valid");
        println!("   Config file : {}", config_path.display());
        println!("   Station     : {} (OCPP {})", config.station.id, config.station.ocpp_version);
        println!("   CSMS        : {}", config.csms.url);
        println!("   Database    : {}", config.database.url);
        println!("   Log level   : {}", config.logging.level);
        return Ok(());
    }

    // ── Start station ──────────────────────────────────────────
    let handle = StationHandle::start(config).await?;
    handle.install_signal_handler();
    info!("🚀 Press Ctrl+C to shutdown gracefully.");

    handle.shutdown_signal().notified().wait().await;
    handle.wait().await;
    Ok(())
}
