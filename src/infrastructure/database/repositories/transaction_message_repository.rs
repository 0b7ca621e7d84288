//! SeaORM implementation of TransactionMessageRepository

use async_trait::async_trait;
use sea_orm::sea_query::OnConflict;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, NotSet, QueryFilter, QueryOrder, Set};
use tracing::{info, warn};

use crate::domain::message::{ControlMessage, TransactionMessageRepository};
use crate::infrastructure::database::entities::transaction_message;
use crate::support::errors::StorageResult;

pub struct SeaOrmTransactionMessageRepository {
    db: DatabaseConnection,
}

impl SeaOrmTransactionMessageRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

#[async_trait]
impl TransactionMessageRepository for SeaOrmTransactionMessageRepository {
    async fn insert(&self, message: &ControlMessage) -> StorageResult<()> {
        let model = transaction_message::ActiveModel {
            id: NotSet,
            unique_id: Set(message.unique_id.clone()),
            message_type: Set(message.message_type.as_str().to_string()),
            message: Set(message.message.clone()),
            enqueued_at: Set(message.enqueued_at),
        };

        // Re-inserting keeps the original row (and so the replay position).
        transaction_message::Entity::insert(model)
            .on_conflict(
                OnConflict::column(transaction_message::Column::UniqueId)
                    .update_columns([
                        transaction_message::Column::MessageType,
                        transaction_message::Column::Message,
                    ])
                    .to_owned(),
            )
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn remove(&self, unique_id: &str) -> StorageResult<()> {
        transaction_message::Entity::delete_many()
            .filter(transaction_message::Column::UniqueId.eq(unique_id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn get_all(&self) -> StorageResult<Vec<ControlMessage>> {
        let models = transaction_message::Entity::find()
            .order_by_asc(transaction_message::Column::Id)
            .all(&self.db)
            .await?;

        let mut messages = Vec::with_capacity(models.len());
        let mut unreadable = Vec::new();
        for model in models {
            match ControlMessage::from_stored_frame(model.message, model.enqueued_at) {
                Ok(message) => messages.push(message),
                Err(e) => {
                    warn!(
                        unique_id = model.unique_id.as_str(),
                        error = %e,
                        "Dropping unreadable stored transaction message"
                    );
                    unreadable.push(model.id);
                }
            }
        }

        // Unreadable rows would otherwise come back on every restore.
        if !unreadable.is_empty() {
            let result = transaction_message::Entity::delete_many()
                .filter(transaction_message::Column::Id.is_in(unreadable))
                .exec(&self.db)
                .await;
            match result {
                Ok(deleted) => info!(
                    deleted = deleted.rows_affected,
                    "Deleted unreadable stored transaction messages"
                ),
                Err(e) => warn!(
                    error = %e,
                    "Failed to delete unreadable stored transaction messages"
                ),
            }
        }
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::domain::ocpp::{MessageType, OcppVersion};
    use crate::infrastructure::database::test_database;

    fn meter_values(tx: &str) -> ControlMessage {
        ControlMessage::new(
            MessageType::TransactionEvent,
            json!({
                "eventType": "Updated",
                "timestamp": "2024-01-01T00:00:00Z",
                "triggerReason": "MeterValuePeriodic",
                "seqNo": 1,
                "transactionInfo": {"transactionId": tx}
            }),
            OcppVersion::V201,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn stored_messages_come_back_in_order_with_same_frame() {
        let repo = SeaOrmTransactionMessageRepository::new(test_database().await);
        let first = meter_values("tx-1");
        let second = meter_values("tx-2");

        repo.insert(&first).await.unwrap();
        repo.insert(&second).await.unwrap();
        repo.insert(&first).await.unwrap();

        let restored = repo.get_all().await.unwrap();
        assert_eq!(restored.len(), 2);
        assert_eq!(restored[0].unique_id, first.unique_id);
        assert_eq!(restored[0].message, first.message);
        assert_eq!(restored[0].message_type, MessageType::TransactionEvent);
        assert_eq!(restored[0].attempts, 0);
        assert_eq!(restored[1].transaction_id().as_deref(), Some("tx-2"));

        repo.remove(&first.unique_id).await.unwrap();
        repo.remove("unknown").await.unwrap();
        assert_eq!(repo.get_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unreadable_rows_are_deleted_on_load() {
        let db = test_database().await;
        let repo = SeaOrmTransactionMessageRepository::new(db.clone());
        let good = meter_values("tx-3");
        repo.insert(&good).await.unwrap();

        let corrupt = transaction_message::ActiveModel {
            id: NotSet,
            unique_id: Set("broken-1".into()),
            message_type: Set("TransactionEvent".into()),
            message: Set("[2,\"broken-1\",".into()),
            enqueued_at: Set(chrono::Utc::now()),
        };
        transaction_message::Entity::insert(corrupt)
            .exec(&db)
            .await
            .unwrap();

        let restored = repo.get_all().await.unwrap();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].unique_id, good.unique_id);

        let rows = transaction_message::Entity::find().all(&db).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].unique_id, good.unique_id);
    }
}
