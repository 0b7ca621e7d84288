//! SeaORM implementation of ChargingProfileRepository

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::sea_query::OnConflict;
use sea_orm::{DatabaseConnection, EntityTrait, QueryOrder, Set};
use tracing::{debug, warn};

use crate::domain::charging_profile::{ChargingProfile, ChargingProfileRepository};
use crate::infrastructure::database::entities::charging_profile;
use crate::support::errors::{StorageError, StorageResult};

pub struct SeaOrmChargingProfileRepository {
    db: DatabaseConnection,
}

impl SeaOrmChargingProfileRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

// ── Conversion helpers ──────────────────────────────────────────

fn model_to_domain(m: charging_profile::Model) -> StorageResult<(i32, ChargingProfile)> {
    let profile: ChargingProfile =
        serde_json::from_str(&m.profile_json).map_err(|e| StorageError::Corrupt {
            entity: "charging_profile",
            key: m.profile_id.to_string(),
            reason: e.to_string(),
        })?;
    Ok((m.evse_id, profile))
}

// ── ChargingProfileRepository impl ─────────────────────────────

#[async_trait]
impl ChargingProfileRepository for SeaOrmChargingProfileRepository {
    async fn insert_or_update(&self, evse_id: i32, profile: &ChargingProfile) -> StorageResult<()> {
        debug!(
            profile_id = profile.id,
            evse_id,
            purpose = profile.charging_profile_purpose.as_str(),
            "Saving charging profile"
        );

        let model = charging_profile::ActiveModel {
            profile_id: Set(profile.id),
            evse_id: Set(evse_id),
            stack_level: Set(profile.stack_level),
            purpose: Set(profile.charging_profile_purpose.as_str().to_string()),
            profile_json: Set(serde_json::to_string(profile)?),
            updated_at: Set(Utc::now()),
        };

        charging_profile::Entity::insert(model)
            .on_conflict(
                OnConflict::column(charging_profile::Column::ProfileId)
                    .update_columns([
                        charging_profile::Column::EvseId,
                        charging_profile::Column::StackLevel,
                        charging_profile::Column::Purpose,
                        charging_profile::Column::ProfileJson,
                        charging_profile::Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn delete(&self, profile_id: i32) -> StorageResult<bool> {
        let result = charging_profile::Entity::delete_by_id(profile_id)
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected > 0)
    }

    async fn get_all(&self) -> StorageResult<Vec<(i32, ChargingProfile)>> {
        let models = charging_profile::Entity::find()
            .order_by_asc(charging_profile::Column::EvseId)
            .order_by_asc(charging_profile::Column::ProfileId)
            .all(&self.db)
            .await?;

        let mut profiles = Vec::with_capacity(models.len());
        for model in models {
            match model_to_domain(model) {
                Ok(entry) => profiles.push(entry),
                Err(e) => warn!(error = %e, "Skipping unreadable charging profile"),
            }
        }
        Ok(profiles)
    }
}
