pub mod charging_profile;
pub mod evse;
pub mod message;
pub mod ocpp;

pub use evse::{ActiveTransaction, EvseManager};
pub use message::{ControlMessage, TransactionMessageRepository};
pub use ocpp::{MessageType, OcppVersion};
