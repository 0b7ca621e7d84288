//! Durable store for transaction-related ControlMessages

use async_trait::async_trait;

use super::ControlMessage;
use crate::support::errors::StorageResult;

#[async_trait]
pub trait TransactionMessageRepository: Send + Sync {
    /// Store a message. Re-inserting an existing unique id overwrites it.
    async fn insert(&self, message: &ControlMessage) -> StorageResult<()>;

    /// Remove a message by unique id. Removing an unknown id is not an error.
    async fn remove(&self, unique_id: &str) -> StorageResult<()>;

    /// All stored messages, oldest first.
    async fn get_all(&self) -> StorageResult<Vec<ControlMessage>>;
}
