//! Create charging_profiles table
//!
//! Profiles installed through SetChargingProfile (and local external
//! constraints), reloaded into the smart charging store at start-up.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(ChargingProfiles::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ChargingProfiles::ProfileId)
                            .integer()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(ChargingProfiles::EvseId)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(ChargingProfiles::StackLevel)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(ChargingProfiles::Purpose).string().not_null())
                    .col(ColumnDef::new(ChargingProfiles::ProfileJson).text().not_null())
                    .col(
                        ColumnDef::new(ChargingProfiles::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_charging_profiles_evse")
                    .table(ChargingProfiles::Table)
                    .col(ChargingProfiles::EvseId)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(ChargingProfiles::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
pub enum ChargingProfiles {
    Table,
    ProfileId,
    EvseId,
    StackLevel,
    Purpose,
    ProfileJson,
    UpdatedAt,
}
