//! Charging profile value types
//!
//! Field names follow the OCPP 2.0.1 JSON schema (camelCase) so request
//! payloads deserialize directly. The 1.6 purpose name
//! `ChargePointMaxProfile` is accepted as an alias.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChargingProfilePurpose {
    ChargingStationExternalConstraints,
    #[serde(alias = "ChargePointMaxProfile")]
    ChargingStationMaxProfile,
    TxDefaultProfile,
    TxProfile,
}

impl ChargingProfilePurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ChargingStationExternalConstraints => "ChargingStationExternalConstraints",
            Self::ChargingStationMaxProfile => "ChargingStationMaxProfile",
            Self::TxDefaultProfile => "TxDefaultProfile",
            Self::TxProfile => "TxProfile",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChargingProfileKind {
    Absolute,
    Recurring,
    Relative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecurrencyKind {
    Daily,
    Weekly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChargingRateUnit {
    #[serde(rename = "A")]
    Amps,
    #[serde(rename = "W")]
    Watts,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargingSchedulePeriod {
    /// Offset in seconds from the start of the schedule.
    pub start_period: i32,
    pub limit: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number_phases: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_to_use: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargingSchedule {
    pub id: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_schedule: Option<DateTime<Utc>>,
    /// Seconds. Absent means the last period lasts indefinitely.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<i32>,
    pub charging_rate_unit: ChargingRateUnit,
    pub charging_schedule_period: Vec<ChargingSchedulePeriod>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_charging_rate: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargingProfile {
    pub id: i32,
    pub stack_level: i32,
    pub charging_profile_purpose: ChargingProfilePurpose,
    pub charging_profile_kind: ChargingProfileKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recurrency_kind: Option<RecurrencyKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_from: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_to: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    pub charging_schedule: Vec<ChargingSchedule>,
}

impl ChargingProfile {
    /// Validity window with absent bounds treated as unbounded.
    pub fn validity(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        (
            self.valid_from.unwrap_or(DateTime::<Utc>::MIN_UTC),
            self.valid_to.unwrap_or_else(far_future),
        )
    }

    /// Whether the validity window intersects `[from, to)`.
    pub fn is_valid_within(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> bool {
        let (valid_from, valid_to) = self.validity();
        valid_from < to && from < valid_to
    }

    /// Only the first schedule drives limits; further schedules are ISO 15118 offers.
    pub fn primary_schedule(&self) -> Option<&ChargingSchedule> {
        self.charging_schedule.first()
    }
}

/// Who imposed a limit. Reported in ReportChargingProfiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChargingLimitSource {
    #[serde(rename = "EMS")]
    Ems,
    Other,
    #[serde(rename = "SO")]
    So,
    #[serde(rename = "CSO")]
    Cso,
}

/// A profile as installed on a specific EVSE (0 = station-wide).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvseChargingProfile {
    pub evse_id: i32,
    pub profile: ChargingProfile,
}

impl EvseChargingProfile {
    /// External constraints come from a local energy manager, everything
    /// else from the CSMS.
    pub fn source(&self) -> ChargingLimitSource {
        match self.profile.charging_profile_purpose {
            ChargingProfilePurpose::ChargingStationExternalConstraints => ChargingLimitSource::Ems,
            _ => ChargingLimitSource::Cso,
        }
    }
}

/// One period of a composite schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositeSchedulePeriod {
    pub start_period: i32,
    pub limit: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number_phases: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_to_use: Option<i32>,
    /// Stack level of the profile that produced the limit. `None` for the
    /// default limit. Local only.
    #[serde(skip)]
    pub stack_level: Option<i32>,
}

/// Merged limit schedule for one EVSE over a requested window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositeSchedule {
    pub evse_id: i32,
    pub duration: i32,
    pub schedule_start: DateTime<Utc>,
    pub charging_rate_unit: ChargingRateUnit,
    pub charging_schedule_period: Vec<CompositeSchedulePeriod>,
}

/// Sentinel used for an open-ended validity window.
pub fn far_future() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(9999, 12, 31, 23, 59, 59)
        .single()
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deserializes_v201_profile() {
        let profile: ChargingProfile = serde_json::from_value(json!({
            "id": 7,
            "stackLevel": 2,
            "chargingProfilePurpose": "TxDefaultProfile",
            "chargingProfileKind": "Recurring",
            "recurrencyKind": "Daily",
            "chargingSchedule": [{
                "id": 1,
                "startSchedule": "2024-01-01T08:00:00Z",
                "chargingRateUnit": "W",
                "chargingSchedulePeriod": [
                    {"startPeriod": 0, "limit": 11000.0},
                    {"startPeriod": 3600, "limit": 7400.0, "numberPhases": 1, "phaseToUse": 2}
                ]
            }]
        }))
        .unwrap();

        assert_eq!(profile.stack_level, 2);
        assert_eq!(profile.recurrency_kind, Some(RecurrencyKind::Daily));
        let schedule = &profile.charging_schedule[0];
        assert_eq!(schedule.charging_rate_unit, ChargingRateUnit::Watts);
        assert_eq!(schedule.charging_schedule_period[1].phase_to_use, Some(2));
        assert!(profile.valid_from.is_none());
    }

    #[test]
    fn accepts_v16_purpose_alias() {
        let purpose: ChargingProfilePurpose =
            serde_json::from_value(json!("ChargePointMaxProfile")).unwrap();
        assert_eq!(purpose, ChargingProfilePurpose::ChargingStationMaxProfile);
    }

    #[test]
    fn composite_schedule_serializes_camel_case() {
        let schedule = CompositeSchedule {
            evse_id: 1,
            duration: 600,
            schedule_start: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            charging_rate_unit: ChargingRateUnit::Amps,
            charging_schedule_period: vec![CompositeSchedulePeriod {
                start_period: 0,
                limit: 16.0,
                number_phases: Some(3),
                phase_to_use: None,
                stack_level: Some(2),
            }],
        };
        let value = serde_json::to_value(&schedule).unwrap();
        assert_eq!(value["evseId"], 1);
        assert_eq!(value["chargingRateUnit"], "A");
        assert_eq!(value["chargingSchedulePeriod"][0]["numberPhases"], 3);
        assert!(value["chargingSchedulePeriod"][0].get("phaseToUse").is_none());
        assert!(value["chargingSchedulePeriod"][0].get("stackLevel").is_none());
    }
}
