//! Non-durable repository implementations

mod memory;

pub use memory::{InMemoryChargingProfileRepository, InMemoryTransactionMessageRepository};
