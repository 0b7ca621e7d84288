//! Queued transaction message awaiting delivery to the CSMS

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "transaction_messages")]
pub struct Model {
    /// Insertion order; restored messages are replayed by ascending id.
    #[sea_orm(primary_key)]
    pub id: i64,

    #[sea_orm(unique)]
    pub unique_id: String,

    pub message_type: String,

    /// Serialized OCPP-J Call frame, resent verbatim.
    #[sea_orm(column_type = "Text")]
    pub message: String,

    pub enqueued_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
