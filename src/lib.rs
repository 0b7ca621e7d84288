//! # Texnouz OCPP Charging Station
//!
//! Charging-station side of OCPP 1.6 and 2.0.1: a reliable outbound message
//! queue and smart charging (profile validation and composite schedules).
//!
//! ## Architecture
//!
//! - **domain**: protocol types, charging profiles, repository traits
//! - **application**: message queue, Call routing, smart charging, registration
//! - **infrastructure**: SQLite persistence and the WebSocket link to the CSMS
//! - **runtime**: wiring and lifecycle of a running station

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod runtime;
pub mod support;

pub use config::{default_config_path, AppConfig};
pub use infrastructure::{init_database, DatabaseConfig};
pub use runtime::{init_tracing, StationHandle};
