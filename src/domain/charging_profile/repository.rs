//! ChargingProfile repository interface

use async_trait::async_trait;

use super::model::ChargingProfile;
use crate::support::errors::StorageResult;

#[async_trait]
pub trait ChargingProfileRepository: Send + Sync {
    /// Store a profile for an EVSE, replacing any profile with the same id.
    async fn insert_or_update(&self, evse_id: i32, profile: &ChargingProfile) -> StorageResult<()>;

    /// Delete by profile id. Returns whether a row was removed.
    async fn delete(&self, profile_id: i32) -> StorageResult<bool>;

    /// All stored profiles as `(evse_id, profile)`, ordered by EVSE then id.
    async fn get_all(&self) -> StorageResult<Vec<(i32, ChargingProfile)>>;
}
