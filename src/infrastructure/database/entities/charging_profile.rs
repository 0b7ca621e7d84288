//! Installed charging profile

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "charging_profiles")]
pub struct Model {
    /// Profile id from the OCPP ChargingProfile object. Unique per station.
    #[sea_orm(primary_key, auto_increment = false)]
    pub profile_id: i32,

    /// EVSE the profile is installed on (0 = station-wide).
    pub evse_id: i32,

    pub stack_level: i32,

    /// ChargingProfilePurpose, kept for inspection with plain SQL.
    pub purpose: String,

    /// Complete ChargingProfile as JSON (camelCase).
    #[sea_orm(column_type = "Text")]
    pub profile_json: String,

    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
