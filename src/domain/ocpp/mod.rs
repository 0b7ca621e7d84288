//! OCPP protocol value objects shared by the queue and the handlers.

pub mod message_type;
pub mod version;

pub use message_type::{MessageType, UnknownMessageType};
pub use version::OcppVersion;
