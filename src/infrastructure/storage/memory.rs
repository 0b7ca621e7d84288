//! In-memory repositories for development and testing

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::domain::charging_profile::{ChargingProfile, ChargingProfileRepository};
use crate::domain::message::{ControlMessage, TransactionMessageRepository};
use crate::support::errors::{StorageError, StorageResult};

/// Transaction messages keyed by unique id, ordered by insertion.
#[derive(Default)]
pub struct InMemoryTransactionMessageRepository {
    messages: DashMap<String, (u64, ControlMessage)>,
    sequence: AtomicU64,
}

impl InMemoryTransactionMessageRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn contains(&self, unique_id: &str) -> bool {
        self.messages.contains_key(unique_id)
    }
}

#[async_trait]
impl TransactionMessageRepository for InMemoryTransactionMessageRepository {
    async fn insert(&self, message: &ControlMessage) -> StorageResult<()> {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        self.messages
            .entry(message.unique_id.clone())
            .and_modify(|(_, stored)| *stored = message.clone())
            .or_insert_with(|| (seq, message.clone()));
        Ok(())
    }

    async fn remove(&self, unique_id: &str) -> StorageResult<()> {
        self.messages.remove(unique_id);
        Ok(())
    }

    async fn get_all(&self) -> StorageResult<Vec<ControlMessage>> {
        let mut all: Vec<(u64, ControlMessage)> =
            self.messages.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|(seq, _)| *seq);
        Ok(all.into_iter().map(|(_, m)| m).collect())
    }
}

/// Charging profiles keyed by profile id. `fail_writes` simulates a broken store.
#[derive(Default)]
pub struct InMemoryChargingProfileRepository {
    profiles: DashMap<i32, (i32, ChargingProfile)>,
    fail_writes: AtomicBool,
}

impl InMemoryChargingProfileRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    fn check_writable(&self, key: i32) -> StorageResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Corrupt {
                entity: "charging_profile",
                key: key.to_string(),
                reason: "store is read-only".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ChargingProfileRepository for InMemoryChargingProfileRepository {
    async fn insert_or_update(&self, evse_id: i32, profile: &ChargingProfile) -> StorageResult<()> {
        self.check_writable(profile.id)?;
        self.profiles.insert(profile.id, (evse_id, profile.clone()));
        Ok(())
    }

    async fn delete(&self, profile_id: i32) -> StorageResult<bool> {
        self.check_writable(profile_id)?;
        Ok(self.profiles.remove(&profile_id).is_some())
    }

    async fn get_all(&self) -> StorageResult<Vec<(i32, ChargingProfile)>> {
        let mut all: Vec<(i32, ChargingProfile)> =
            self.profiles.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|(evse_id, profile)| (*evse_id, profile.id));
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ocpp::{MessageType, OcppVersion};
    use serde_json::json;

    fn meter_values(tx: i64) -> ControlMessage {
        ControlMessage::new(
            MessageType::MeterValues,
            json!({"connectorId": 1, "transactionId": tx, "meterValue": []}),
            OcppVersion::V16,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn transaction_messages_keep_insertion_order() {
        let repo = InMemoryTransactionMessageRepository::new();
        let first = meter_values(1);
        let second = meter_values(2);
        repo.insert(&first).await.unwrap();
        repo.insert(&second).await.unwrap();

        // Re-insert keeps the original position.
        repo.insert(&first).await.unwrap();

        let ids: Vec<String> = repo
            .get_all()
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.unique_id)
            .collect();
        assert_eq!(ids, vec![first.unique_id.clone(), second.unique_id.clone()]);

        repo.remove(&first.unique_id).await.unwrap();
        repo.remove("unknown").await.unwrap();
        assert_eq!(repo.len(), 1);
        repo.remove(&second.unique_id).await.unwrap();
        assert!(repo.is_empty());
    }
}
