//! Infrastructure layer - persistence and the CSMS connection

pub mod database;
pub mod storage;
pub mod transport;

pub use database::{connect_and_migrate, init_database, DatabaseConfig};
pub use transport::{
    ChannelTransport, ConnectionEvent, ConnectivityManager, CsmsConnectionConfig,
    SwitchableTransport, Transport, TransportError,
};
