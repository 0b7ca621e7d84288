pub mod control_message;
pub mod priority;
pub mod repository;

pub use control_message::{ControlMessage, StoredFrameError};
pub use priority::{get_message_transmission_priority, MessageTransmissionPriority};
pub use repository::TransactionMessageRepository;
