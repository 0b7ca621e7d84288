//! Create transaction_messages table
//!
//! Transaction-related Calls (meter values, transaction events) are kept
//! here until the CSMS answered them, so they survive a restart.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(TransactionMessages::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(TransactionMessages::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(TransactionMessages::UniqueId)
                            .string()
                            .not_null()
                            .unique_key(),
                    )
                    .col(
                        ColumnDef::new(TransactionMessages::MessageType)
                            .string()
                            .not_null(),
                    )
                    .col(ColumnDef::new(TransactionMessages::Message).text().not_null())
                    .col(
                        ColumnDef::new(TransactionMessages::EnqueuedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(TransactionMessages::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
pub enum TransactionMessages {
    Table,
    Id,
    UniqueId,
    MessageType,
    Message,
    EnqueuedAt,
}
