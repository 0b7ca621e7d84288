//! Smart charging: installed charging profiles and composite schedules
//!
//! [`SmartChargingHandler`] owns the station's profile store. Profiles are
//! validated against the EVSE state before they are persisted and become
//! visible to the composite schedule calculation.

pub mod composite;
pub mod handlers;
pub mod profile;
pub mod validation;


use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

pub use composite::{CompositeParams, DEFAULT_LIMIT_AMPS, DEFAULT_LIMIT_WATTS, LOW_VOLTAGE};
pub use handlers::register_smart_charging_handlers;
pub use validation::ProfileValidationResult;

use crate::domain::charging_profile::{
    ChargingProfile, ChargingProfilePurpose, ChargingProfileRepository, ChargingRateUnit,
    ClearChargingProfileRequest, ClearChargingProfileResponse, ClearChargingProfileStatus,
    CompositeSchedule, EvseChargingProfile, GetChargingProfilesRequest,
    SetChargingProfileResponse, StatusInfo,
};
use crate::domain::evse::EvseManager;
use crate::support::errors::StorageResult;
use validation::{
    conform_validity_period, validate_charging_station_max_profile, validate_evse_exists,
    validate_profile_schedules, validate_tx_default_profile, validate_tx_profile,
    validate_validity_period,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmartChargingConfig {
    /// Inbound smart charging Calls are answered with `NotSupported` when off.
    pub enabled: bool,
    pub supported_rate_units: Vec<ChargingRateUnit>,
    pub ac_phase_switching_supported: bool,
    /// Volts per phase, for converting between A and W.
    pub supply_voltage: f64,
    /// Purposes left out of composite schedules while the CSMS is unreachable.
    pub ignored_profile_purposes_offline: Vec<ChargingProfilePurpose>,
}

impl Default for SmartChargingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            supported_rate_units: vec![ChargingRateUnit::Amps, ChargingRateUnit::Watts],
            ac_phase_switching_supported: false,
            supply_voltage: LOW_VOLTAGE,
            ignored_profile_purposes_offline: Vec::new(),
        }
    }
}

pub type SharedSmartChargingHandler = Arc<SmartChargingHandler>;

pub struct SmartChargingHandler {
    config: SmartChargingConfig,
    evses: Arc<dyn EvseManager>,
    repository: Arc<dyn ChargingProfileRepository>,
    profiles: RwLock<Vec<EvseChargingProfile>>,
    online: AtomicBool,
}

impl SmartChargingHandler {
    pub fn new(
        config: SmartChargingConfig,
        evses: Arc<dyn EvseManager>,
        repository: Arc<dyn ChargingProfileRepository>,
    ) -> Self {
        Self {
            config,
            evses,
            repository,
            profiles: RwLock::new(Vec::new()),
            online: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &SmartChargingConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Replace the in-memory store with the persisted profiles.
    pub async fn load_profiles(&self) -> StorageResult<usize> {
        let stored = self.repository.get_all().await?;
        let count = stored.len();
        *self.profiles.write().await = stored
            .into_iter()
            .map(|(evse_id, profile)| EvseChargingProfile { evse_id, profile })
            .collect();
        info!(count, "Charging profiles loaded");
        Ok(count)
    }

    pub fn set_online(&self, online: bool) {
        if self.online.swap(online, Ordering::SeqCst) != online {
            debug!(online, "Smart charging connectivity changed");
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Purposes the composite calculation currently skips.
    pub fn purposes_to_ignore(&self) -> Vec<ChargingProfilePurpose> {
        if self.is_online() {
            Vec::new()
        } else {
            self.config.ignored_profile_purposes_offline.clone()
        }
    }

    // ── Installing profiles ────────────────────────────────────

    fn validate_purpose(
        &self,
        profile: &ChargingProfile,
        evse_id: i32,
        installed: &[EvseChargingProfile],
    ) -> Result<(), ProfileValidationResult> {
        match profile.charging_profile_purpose {
            ChargingProfilePurpose::ChargingStationMaxProfile => {
                validate_charging_station_max_profile(profile, evse_id).into_result()
            }
            ChargingProfilePurpose::TxProfile => {
                validate_tx_profile(profile, evse_id, self.evses.as_ref(), installed).into_result()
            }
            ChargingProfilePurpose::TxDefaultProfile => {
                validate_tx_default_profile(profile, evse_id, installed).into_result()
            }
            ChargingProfilePurpose::ChargingStationExternalConstraints => {
                Err(ProfileValidationResult::InvalidProfileType)
            }
        }
    }

    fn validate_content(
        &self,
        profile: &mut ChargingProfile,
        evse_id: i32,
        installed: &[EvseChargingProfile],
    ) -> Result<(), ProfileValidationResult> {
        validate_profile_schedules(profile, &self.config).into_result()?;
        validate_validity_period(profile, evse_id, installed).into_result()
    }

    /// Validation of a profile received from the CSMS.
    fn conform_and_validate(
        &self,
        profile: &mut ChargingProfile,
        evse_id: i32,
        installed: &[EvseChargingProfile],
        now: DateTime<Utc>,
    ) -> Result<(), ProfileValidationResult> {
        conform_validity_period(profile, now);
        validate_evse_exists(self.evses.as_ref(), evse_id).into_result()?;
        self.validate_purpose(profile, evse_id, installed)?;

        let replaces_external = installed.iter().any(|existing| {
            existing.profile.id == profile.id
                && existing.profile.charging_profile_purpose
                    == ChargingProfilePurpose::ChargingStationExternalConstraints
        });
        if replaces_external {
            return Err(ProfileValidationResult::ExistingChargingStationExternalConstraints);
        }

        self.validate_content(profile, evse_id, installed)
    }

    /// Fill in the validity window and run every check against the installed
    /// profiles. The profile is not stored.
    pub async fn conform_and_validate_profile(
        &self,
        profile: &mut ChargingProfile,
        evse_id: i32,
    ) -> ProfileValidationResult {
        let installed = self.profiles.read().await;
        match self.conform_and_validate(profile, evse_id, &installed, Utc::now()) {
            Ok(()) => ProfileValidationResult::Valid,
            Err(result) => result,
        }
    }

    /// Handle a SetChargingProfile request: validate, persist, then install.
    pub async fn conform_validate_and_add_profile(
        &self,
        mut profile: ChargingProfile,
        evse_id: i32,
    ) -> SetChargingProfileResponse {
        let mut installed = self.profiles.write().await;

        if let Err(result) =
            self.conform_and_validate(&mut profile, evse_id, &installed, Utc::now())
        {
            warn!(
                profile_id = profile.id,
                evse_id,
                result = %result,
                reason_code = result.reason_code(),
                "Charging profile rejected"
            );
            return SetChargingProfileResponse::rejected(result.status_info());
        }

        match self.store(&mut installed, evse_id, profile).await {
            Ok(()) => SetChargingProfileResponse::accepted(),
            Err(status_info) => SetChargingProfileResponse::rejected(status_info),
        }
    }

    /// Install a ChargingStationExternalConstraints profile from a local
    /// energy manager. Skips the purpose checks that apply to CSMS requests.
    pub async fn add_external_constraints_profile(
        &self,
        mut profile: ChargingProfile,
        evse_id: i32,
    ) -> SetChargingProfileResponse {
        let mut installed = self.profiles.write().await;

        let validated = if profile.charging_profile_purpose
            == ChargingProfilePurpose::ChargingStationExternalConstraints
        {
            conform_validity_period(&mut profile, Utc::now());
            validate_evse_exists(self.evses.as_ref(), evse_id)
                .into_result()
                .and_then(|()| self.validate_content(&mut profile, evse_id, &installed))
        } else {
            Err(ProfileValidationResult::InvalidProfileType)
        };
        if let Err(result) = validated {
            warn!(
                profile_id = profile.id,
                evse_id,
                result = %result,
                "External constraints rejected"
            );
            return SetChargingProfileResponse::rejected(result.status_info());
        }

        match self.store(&mut installed, evse_id, profile).await {
            Ok(()) => SetChargingProfileResponse::accepted(),
            Err(status_info) => SetChargingProfileResponse::rejected(status_info),
        }
    }

    async fn store(
        &self,
        installed: &mut Vec<EvseChargingProfile>,
        evse_id: i32,
        profile: ChargingProfile,
    ) -> Result<(), StatusInfo> {
        if let Err(e) = self.repository.insert_or_update(evse_id, &profile).await {
            error!(
                profile_id = profile.id,
                evse_id,
                error = %e,
                "Failed to persist charging profile"
            );
            return Err(StatusInfo::new("InternalError", "Charging profile could not be stored"));
        }

        installed.retain(|existing| existing.profile.id != profile.id);
        info!(
            profile_id = profile.id,
            evse_id,
            purpose = profile.charging_profile_purpose.as_str(),
            stack_level = profile.stack_level,
            "Charging profile installed"
        );
        installed.push(EvseChargingProfile { evse_id, profile });
        Ok(())
    }

    // ── Removing profiles ──────────────────────────────────────

    /// Handle a ClearChargingProfile request. ExternalConstraints profiles
    /// are never removed.
    pub async fn clear_profiles(
        &self,
        request: &ClearChargingProfileRequest,
    ) -> ClearChargingProfileResponse {
        let mut installed = self.profiles.write().await;

        let criteria = request.charging_profile_criteria.as_ref();
        let targets_external = criteria.and_then(|c| c.charging_profile_purpose)
            == Some(ChargingProfilePurpose::ChargingStationExternalConstraints)
            || request.charging_profile_id.is_some_and(|id| {
                installed.iter().any(|p| {
                    p.profile.id == id
                        && p.profile.charging_profile_purpose
                            == ChargingProfilePurpose::ChargingStationExternalConstraints
                })
            });
        if targets_external {
            warn!("Refusing to clear ChargingStationExternalConstraints profiles");
            return ClearChargingProfileResponse {
                status: ClearChargingProfileStatus::Unknown,
                status_info: Some(StatusInfo::new(
                    "InvalidValue",
                    "ChargingStationExternalConstraints profiles cannot be cleared",
                )),
            };
        }

        let matches = |entry: &EvseChargingProfile| {
            if entry.profile.charging_profile_purpose
                == ChargingProfilePurpose::ChargingStationExternalConstraints
            {
                return false;
            }
            if let Some(id) = request.charging_profile_id {
                return entry.profile.id == id;
            }
            criteria.map_or(true, |c| {
                c.evse_id.map_or(true, |evse_id| entry.evse_id == evse_id)
                    && c.charging_profile_purpose
                        .map_or(true, |purpose| entry.profile.charging_profile_purpose == purpose)
                    && c.stack_level
                        .map_or(true, |level| entry.profile.stack_level == level)
            })
        };

        let doomed: Vec<i32> = installed
            .iter()
            .filter(|entry| matches(entry))
            .map(|entry| entry.profile.id)
            .collect();

        let mut removed = 0;
        for profile_id in doomed {
            match self.repository.delete(profile_id).await {
                Ok(_) => {
                    installed.retain(|entry| entry.profile.id != profile_id);
                    removed += 1;
                }
                Err(e) => {
                    error!(profile_id, error = %e, "Failed to delete charging profile, keeping it");
                }
            }
        }

        info!(removed, "ClearChargingProfile handled");
        ClearChargingProfileResponse {
            status: if removed > 0 {
                ClearChargingProfileStatus::Accepted
            } else {
                ClearChargingProfileStatus::Unknown
            },
            status_info: None,
        }
    }

    /// Drop the TxProfiles of a finished transaction.
    pub async fn delete_transaction_tx_profiles(&self, transaction_id: &str) -> usize {
        let mut installed = self.profiles.write().await;
        let doomed: Vec<i32> = installed
            .iter()
            .filter(|entry| {
                entry.profile.charging_profile_purpose == ChargingProfilePurpose::TxProfile
                    && entry.profile.transaction_id.as_deref() == Some(transaction_id)
            })
            .map(|entry| entry.profile.id)
            .collect();

        for profile_id in &doomed {
            if let Err(e) = self.repository.delete(*profile_id).await {
                error!(profile_id, error = %e, "Failed to delete TxProfile from storage");
            }
        }
        installed.retain(|entry| !doomed.contains(&entry.profile.id));

        if !doomed.is_empty() {
            info!(transaction_id, count = doomed.len(), "TxProfiles removed");
        }
        doomed.len()
    }

    // ── Queries ────────────────────────────────────────────────

    /// Installed profiles matching a GetChargingProfiles request, ordered
    /// by EVSE then id.
    pub async fn get_reported_profiles(
        &self,
        request: &GetChargingProfilesRequest,
    ) -> Vec<EvseChargingProfile> {
        let criterion = &request.charging_profile;
        let installed = self.profiles.read().await;

        let mut reported: Vec<EvseChargingProfile> = installed
            .iter()
            .filter(|entry| request.evse_id.map_or(true, |evse_id| entry.evse_id == evse_id))
            .filter(|entry| {
                criterion
                    .charging_profile_purpose
                    .map_or(true, |purpose| entry.profile.charging_profile_purpose == purpose)
            })
            .filter(|entry| {
                criterion
                    .stack_level
                    .map_or(true, |level| entry.profile.stack_level == level)
            })
            .filter(|entry| {
                criterion
                    .charging_profile_id
                    .as_ref()
                    .map_or(true, |ids| ids.contains(&entry.profile.id))
            })
            .filter(|entry| {
                criterion
                    .charging_limit_source
                    .as_ref()
                    .map_or(true, |sources| sources.contains(&entry.source()))
            })
            .cloned()
            .collect();
        reported.sort_by_key(|entry| (entry.evse_id, entry.profile.id));
        reported
    }

    /// Profiles that apply to `evse_id` and are valid somewhere in `[from, to)`.
    ///
    /// EVSE 0 only sees station-wide profiles. Other EVSEs see station-wide
    /// and their own profiles, with TxProfiles limited to the active transaction.
    pub async fn get_valid_profiles(
        &self,
        evse_id: i32,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        purposes_to_ignore: &[ChargingProfilePurpose],
    ) -> Vec<ChargingProfile> {
        let active_transaction = if evse_id > 0 {
            self.evses.active_transaction(evse_id).map(|tx| tx.transaction_id)
        } else {
            None
        };
        let installed = self.profiles.read().await;

        installed
            .iter()
            .filter(|entry| entry.evse_id == 0 || entry.evse_id == evse_id)
            .map(|entry| &entry.profile)
            .filter(|profile| !purposes_to_ignore.contains(&profile.charging_profile_purpose))
            .filter(|profile| {
                profile.charging_profile_purpose != ChargingProfilePurpose::TxProfile
                    || (profile.transaction_id.is_some()
                        && profile.transaction_id == active_transaction)
            })
            .filter(|profile| profile.is_valid_within(from, to))
            .cloned()
            .collect()
    }

    /// Composite schedule for `evse_id` starting now.
    pub async fn get_composite_schedule(
        &self,
        evse_id: i32,
        duration: i32,
        unit: Option<ChargingRateUnit>,
    ) -> Result<CompositeSchedule, ProfileValidationResult> {
        self.get_composite_schedule_at(evse_id, Utc::now(), duration, unit)
            .await
    }

    /// Composite schedule for `evse_id` over `[start, start + duration)`.
    /// Without a unit the first supported one is used.
    pub async fn get_composite_schedule_at(
        &self,
        evse_id: i32,
        start: DateTime<Utc>,
        duration: i32,
        unit: Option<ChargingRateUnit>,
    ) -> Result<CompositeSchedule, ProfileValidationResult> {
        let supported = &self.config.supported_rate_units;
        let unit = match unit {
            Some(unit) if supported.contains(&unit) => unit,
            Some(_) => {
                return Err(ProfileValidationResult::ChargingScheduleChargingRateUnitUnsupported)
            }
            None => supported
                .first()
                .copied()
                .ok_or(ProfileValidationResult::ChargingScheduleChargingRateUnitUnsupported)?,
        };
        validate_evse_exists(self.evses.as_ref(), evse_id).into_result()?;

        let end = start + Duration::seconds(i64::from(duration.max(0)));
        let profiles = self
            .get_valid_profiles(evse_id, start, end, &self.purposes_to_ignore())
            .await;
        let session_start = if evse_id > 0 {
            self.evses.active_transaction(evse_id).map(|tx| tx.started_at)
        } else {
            None
        };

        let params = CompositeParams {
            evse_id,
            start,
            duration,
            unit,
            session_start,
            supply_voltage: self.config.supply_voltage,
        };
        debug!(evse_id, duration, profiles = profiles.len(), "Calculating composite schedule");
        Ok(composite::calculate_composite_schedule(&profiles, &params))
    }

    /// Composite schedules for the station (EVSE 0) and every EVSE. EVSEs
    /// whose calculation fails are skipped.
    pub async fn get_all_composite_schedules(
        &self,
        duration: i32,
        unit: Option<ChargingRateUnit>,
    ) -> Vec<CompositeSchedule> {
        let start = Utc::now();
        let mut schedules = Vec::new();
        for evse_id in 0..=self.evses.number_of_evses() {
            match self
                .get_composite_schedule_at(evse_id, start, duration, unit)
                .await
            {
                Ok(schedule) => schedules.push(schedule),
                Err(result) => warn!(evse_id, result = %result, "Skipping composite schedule"),
            }
        }
        schedules
    }

    pub async fn installed_profiles(&self) -> Vec<EvseChargingProfile> {
        self.profiles.read().await.clone()
    }
}
