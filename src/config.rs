//! Station configuration
//!
//! Loaded from a TOML file, by default `~/.config/ocpp-station/config.toml`.
//! Every section has defaults, so a partial file (or none at all) works.
//!
//! ```toml
//! [station]
//! id = "CP-0001"
//! ocpp_version = "2.0.1"
//! number_of_evses = 2
//!
//! [csms]
//! url = "wss://csms.example.com/ocpp"
//!
//! [message_queue]
//! message_timeout = 30
//! transaction_message_attempts = 3
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::application::queue::MessageQueueConfig;
use crate::application::smart_charging::SmartChargingConfig;
use crate::domain::ocpp::OcppVersion;
use crate::infrastructure::database::DatabaseConfig;
use crate::support::errors::ConfigError;
use crate::support::retry::RetryConfig;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub station: StationConfig,
    pub csms: CsmsConfig,
    pub message_queue: MessageQueueConfig,
    pub smart_charging: SmartChargingConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

/// Identity reported in BootNotification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StationConfig {
    pub id: String,
    pub vendor: String,
    pub model: String,
    pub serial_number: Option<String>,
    pub firmware_version: Option<String>,
    pub ocpp_version: OcppVersion,
    /// EVSEs 1..=n. EVSE 0 is the station itself.
    pub number_of_evses: i32,
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            id: "CP-0001".to_string(),
            vendor: "Texnouz".to_string(),
            model: "AC-22".to_string(),
            serial_number: None,
            firmware_version: Some(env!("CARGO_PKG_VERSION").to_string()),
            ocpp_version: OcppVersion::V201,
            number_of_evses: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CsmsConfig {
    /// Base URL; the station id is appended as the last path segment.
    pub url: String,
    /// Security profile 1: HTTP Basic auth with the station id as user.
    pub basic_auth_password: Option<String>,
    /// Backoff between reconnect attempts. `max_attempts = 0` retries forever.
    pub reconnect: RetryConfig,
    /// Wait after a (re)connect before the message queue dispatches again.
    #[serde(with = "duration_secs")]
    pub queue_resume_delay: Duration,
}

impl Default for CsmsConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:9000/ocpp".to_string(),
            basic_auth_password: None,
            reconnect: RetryConfig {
                max_attempts: 0,
                ..RetryConfig::default()
            },
            queue_resume_delay: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    pub level: String,
    /// `plain` or `json`.
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "plain".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Address of the Prometheus scrape endpoint, e.g. `0.0.0.0:9100`.
    /// Metrics are not exported when unset.
    pub prometheus_listen: Option<String>,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.station.id.trim().is_empty() {
            return Err(ConfigError::Invalid("station.id must not be empty".into()));
        }
        if self.station.number_of_evses < 1 {
            return Err(ConfigError::Invalid(
                "station.number_of_evses must be at least 1".into(),
            ));
        }
        if !(self.csms.url.starts_with("ws://") || self.csms.url.starts_with("wss://")) {
            return Err(ConfigError::Invalid(format!(
                "csms.url must be a ws:// or wss:// URL, got '{}'",
                self.csms.url
            )));
        }
        if self.message_queue.message_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "message_queue.message_timeout must be positive".into(),
            ));
        }
        if self.smart_charging.supply_voltage <= 0.0 {
            return Err(ConfigError::Invalid(
                "smart_charging.supply_voltage must be positive".into(),
            ));
        }
        if self.smart_charging.supported_rate_units.is_empty() {
            return Err(ConfigError::Invalid(
                "smart_charging.supported_rate_units must name at least one unit".into(),
            ));
        }
        Ok(())
    }
}

pub fn default_config_path() -> PathBuf {
    dirs_next::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ocpp-station")
        .join("config.toml")
}

/// `Duration` as (fractional) seconds in config files.
pub mod duration_secs {
    use std::time::Duration;

    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        if value.subsec_nanos() == 0 {
            serializer.serialize_u64(value.as_secs())
        } else {
            serializer.serialize_f64(value.as_secs_f64())
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs)
            .map_err(|_| D::Error::custom(format!("invalid duration: {secs} seconds")))
    }
}
