//! Charging profile validation
//!
//! Each check returns the first violation it finds. [`ProfileValidationResult`]
//! maps every violation to the reason code reported back to the CSMS.

use std::fmt;

use chrono::{DateTime, SubsecRound, Utc};

use super::SmartChargingConfig;
use crate::domain::charging_profile::{
    far_future, ChargingProfile, ChargingProfileKind, ChargingProfilePurpose, EvseChargingProfile,
    StatusInfo,
};
use crate::domain::evse::EvseManager;

/// Number of phases assumed when a period does not say.
pub const DEFAULT_AND_MAX_NUMBER_PHASES: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProfileValidationResult {
    Valid,
    EvseDoesNotExist,
    ExistingChargingStationExternalConstraints,
    InvalidProfileType,
    TxProfileMissingTransactionId,
    TxProfileEvseIdNotGreaterThanZero,
    TxProfileTransactionNotOnEvse,
    TxProfileEvseHasNoActiveTransaction,
    TxProfileConflictingStackLevel,
    ChargingProfileNoChargingSchedulePeriods,
    ChargingProfileFirstStartScheduleIsNotZero,
    ChargingProfileMissingRequiredStartSchedule,
    ChargingProfileExtraneousStartSchedule,
    ChargingProfileMissingRecurrencyKind,
    ChargingSchedulePeriodsOutOfOrder,
    ChargingSchedulePeriodInvalidPhaseToUse,
    ChargingSchedulePeriodUnsupportedNumberPhases,
    ChargingSchedulePeriodNumberPhasesChanged,
    ChargingSchedulePeriodPhaseToUseACPhaseSwitchingUnsupported,
    ChargingScheduleChargingRateUnitUnsupported,
    ChargingStationMaxProfileCannotBeRelative,
    ChargingStationMaxProfileEvseIdGreaterThanZero,
    DuplicateTxDefaultProfileFound,
    DuplicateProfileValidityPeriod,
}

impl ProfileValidationResult {
    pub fn is_valid(&self) -> bool {
        *self == Self::Valid
    }

    /// `Ok` for [`Valid`](Self::Valid), so checks chain with `?`.
    pub fn into_result(self) -> Result<(), Self> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(self)
        }
    }

    /// OCPP `statusInfo.reasonCode`.
    pub fn reason_code(&self) -> &'static str {
        use ProfileValidationResult::*;
        match self {
            Valid => "NoError",
            EvseDoesNotExist => "UnknownEVSE",
            ExistingChargingStationExternalConstraints
            | InvalidProfileType
            | TxProfileEvseIdNotGreaterThanZero => "InvalidValue",
            TxProfileMissingTransactionId => "MissingParam",
            TxProfileTransactionNotOnEvse => "TxNotFound",
            TxProfileEvseHasNoActiveTransaction => "NoTransaction",
            TxProfileConflictingStackLevel => "InvalidStackLevel",
            ChargingProfileNoChargingSchedulePeriods
            | ChargingProfileFirstStartScheduleIsNotZero
            | ChargingProfileMissingRequiredStartSchedule
            | ChargingProfileExtraneousStartSchedule
            | ChargingProfileMissingRecurrencyKind
            | ChargingSchedulePeriodsOutOfOrder
            | ChargingSchedulePeriodInvalidPhaseToUse
            | ChargingSchedulePeriodUnsupportedNumberPhases
            | ChargingSchedulePeriodNumberPhasesChanged
            | ChargingSchedulePeriodPhaseToUseACPhaseSwitchingUnsupported => "InvalidSchedule",
            ChargingScheduleChargingRateUnitUnsupported => "UnsupportedRateUnit",
            ChargingStationMaxProfileCannotBeRelative
            | ChargingStationMaxProfileEvseIdGreaterThanZero => "InvalidProfile",
            DuplicateTxDefaultProfileFound | DuplicateProfileValidityPeriod => "DuplicateProfile",
        }
    }

    /// Variant name, sent as `statusInfo.additionalInfo`.
    pub fn as_str(&self) -> &'static str {
        use ProfileValidationResult::*;
        match self {
            Valid => "Valid",
            EvseDoesNotExist => "EvseDoesNotExist",
            ExistingChargingStationExternalConstraints => {
                "ExistingChargingStationExternalConstraints"
            }
            InvalidProfileType => "InvalidProfileType",
            TxProfileMissingTransactionId => "TxProfileMissingTransactionId",
            TxProfileEvseIdNotGreaterThanZero => "TxProfileEvseIdNotGreaterThanZero",
            TxProfileTransactionNotOnEvse => "TxProfileTransactionNotOnEvse",
            TxProfileEvseHasNoActiveTransaction => "TxProfileEvseHasNoActiveTransaction",
            TxProfileConflictingStackLevel => "TxProfileConflictingStackLevel",
            ChargingProfileNoChargingSchedulePeriods => "ChargingProfileNoChargingSchedulePeriods",
            ChargingProfileFirstStartScheduleIsNotZero => {
                "ChargingProfileFirstStartScheduleIsNotZero"
            }
            ChargingProfileMissingRequiredStartSchedule => {
                "ChargingProfileMissingRequiredStartSchedule"
            }
            ChargingProfileExtraneousStartSchedule => "ChargingProfileExtraneousStartSchedule",
            ChargingProfileMissingRecurrencyKind => "ChargingProfileMissingRecurrencyKind",
            ChargingSchedulePeriodsOutOfOrder => "ChargingSchedulePeriodsOutOfOrder",
            ChargingSchedulePeriodInvalidPhaseToUse => "ChargingSchedulePeriodInvalidPhaseToUse",
            ChargingSchedulePeriodUnsupportedNumberPhases => {
                "ChargingSchedulePeriodUnsupportedNumberPhases"
            }
            ChargingSchedulePeriodNumberPhasesChanged => {
                "ChargingSchedulePeriodNumberPhasesChanged"
            }
            ChargingSchedulePeriodPhaseToUseACPhaseSwitchingUnsupported => {
                "ChargingSchedulePeriodPhaseToUseACPhaseSwitchingUnsupported"
            }
            ChargingScheduleChargingRateUnitUnsupported => {
                "ChargingScheduleChargingRateUnitUnsupported"
            }
            ChargingStationMaxProfileCannotBeRelative => {
                "ChargingStationMaxProfileCannotBeRelative"
            }
            ChargingStationMaxProfileEvseIdGreaterThanZero => {
                "ChargingStationMaxProfileEvseIdGreaterThanZero"
            }
            DuplicateTxDefaultProfileFound => "DuplicateTxDefaultProfileFound",
            DuplicateProfileValidityPeriod => "DuplicateProfileValidityPeriod",
        }
    }

    pub fn status_info(&self) -> StatusInfo {
        StatusInfo::new(self.reason_code(), self.as_str())
    }
}

impl fmt::Display for ProfileValidationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::error::Error for ProfileValidationResult {}

pub fn validate_evse_exists(evses: &dyn EvseManager, evse_id: i32) -> ProfileValidationResult {
    if evse_id == 0 || evses.does_evse_exist(evse_id) {
        ProfileValidationResult::Valid
    } else {
        ProfileValidationResult::EvseDoesNotExist
    }
}

pub fn validate_charging_station_max_profile(
    profile: &ChargingProfile,
    evse_id: i32,
) -> ProfileValidationResult {
    if profile.charging_profile_purpose != ChargingProfilePurpose::ChargingStationMaxProfile {
        return ProfileValidationResult::InvalidProfileType;
    }
    if profile.charging_profile_kind == ChargingProfileKind::Relative {
        return ProfileValidationResult::ChargingStationMaxProfileCannotBeRelative;
    }
    if evse_id > 0 {
        return ProfileValidationResult::ChargingStationMaxProfileEvseIdGreaterThanZero;
    }
    ProfileValidationResult::Valid
}

pub fn validate_tx_profile(
    profile: &ChargingProfile,
    evse_id: i32,
    evses: &dyn EvseManager,
    installed: &[EvseChargingProfile],
) -> ProfileValidationResult {
    let Some(transaction_id) = profile.transaction_id.as_deref() else {
        return ProfileValidationResult::TxProfileMissingTransactionId;
    };
    if evse_id <= 0 {
        return ProfileValidationResult::TxProfileEvseIdNotGreaterThanZero;
    }
    let Some(active) = evses.active_transaction(evse_id) else {
        return ProfileValidationResult::TxProfileEvseHasNoActiveTransaction;
    };
    if active.transaction_id != transaction_id {
        return ProfileValidationResult::TxProfileTransactionNotOnEvse;
    }

    let conflicting = installed.iter().any(|other| {
        other.evse_id == evse_id
            && other.profile.id != profile.id
            && other.profile.charging_profile_purpose == ChargingProfilePurpose::TxProfile
            && other.profile.stack_level == profile.stack_level
    });
    if conflicting {
        return ProfileValidationResult::TxProfileConflictingStackLevel;
    }
    ProfileValidationResult::Valid
}

/// One TxDefaultProfile per stack level across the station-wide and
/// EVSE-specific scopes.
pub fn validate_tx_default_profile(
    profile: &ChargingProfile,
    evse_id: i32,
    installed: &[EvseChargingProfile],
) -> ProfileValidationResult {
    let duplicate = installed.iter().any(|other| {
        other.profile.charging_profile_purpose == ChargingProfilePurpose::TxDefaultProfile
            && other.profile.id != profile.id
            && other.profile.stack_level == profile.stack_level
            && ((evse_id == 0) != (other.evse_id == 0))
    });
    if duplicate {
        ProfileValidationResult::DuplicateTxDefaultProfileFound
    } else {
        ProfileValidationResult::Valid
    }
}

/// Checks the schedules and fills in the default number of phases.
pub fn validate_profile_schedules(
    profile: &mut ChargingProfile,
    config: &SmartChargingConfig,
) -> ProfileValidationResult {
    use ProfileValidationResult::*;

    if profile.charging_schedule.is_empty() {
        return ChargingProfileNoChargingSchedulePeriods;
    }
    if profile.charging_profile_kind == ChargingProfileKind::Recurring
        && profile.recurrency_kind.is_none()
    {
        return ChargingProfileMissingRecurrencyKind;
    }

    let kind = profile.charging_profile_kind;
    for schedule in &mut profile.charging_schedule {
        if !config.supported_rate_units.contains(&schedule.charging_rate_unit) {
            return ChargingScheduleChargingRateUnitUnsupported;
        }

        let periods = &mut schedule.charging_schedule_period;
        let Some(first) = periods.first() else {
            return ChargingProfileNoChargingSchedulePeriods;
        };
        if first.start_period != 0 {
            return ChargingProfileFirstStartScheduleIsNotZero;
        }
        if periods.windows(2).any(|w| w[0].start_period >= w[1].start_period) {
            return ChargingSchedulePeriodsOutOfOrder;
        }

        let mut schedule_phases: Option<i32> = None;
        for period in periods.iter_mut() {
            if let Some(phases) = period.number_phases {
                if !(1..=DEFAULT_AND_MAX_NUMBER_PHASES).contains(&phases) {
                    return ChargingSchedulePeriodUnsupportedNumberPhases;
                }
            }
            if let Some(phase) = period.phase_to_use {
                if !config.ac_phase_switching_supported {
                    return ChargingSchedulePeriodPhaseToUseACPhaseSwitchingUnsupported;
                }
                if period.number_phases != Some(1) || !(1..=3).contains(&phase) {
                    return ChargingSchedulePeriodInvalidPhaseToUse;
                }
            }

            let phases = *period
                .number_phases
                .get_or_insert(DEFAULT_AND_MAX_NUMBER_PHASES);
            if !config.ac_phase_switching_supported {
                match schedule_phases {
                    Some(previous) if previous != phases => {
                        return ChargingSchedulePeriodNumberPhasesChanged;
                    }
                    _ => schedule_phases = Some(phases),
                }
            }
        }

        match (kind, schedule.start_schedule.is_some()) {
            (ChargingProfileKind::Absolute | ChargingProfileKind::Recurring, false) => {
                return ChargingProfileMissingRequiredStartSchedule;
            }
            (ChargingProfileKind::Relative, true) => {
                return ChargingProfileExtraneousStartSchedule;
            }
            _ => {}
        }
    }

    Valid
}

/// Fill in an open validity window: `validFrom` becomes now, `validTo` the far future.
pub fn conform_validity_period(profile: &mut ChargingProfile, now: DateTime<Utc>) {
    if profile.valid_from.is_none() {
        profile.valid_from = Some(now.trunc_subsecs(0));
    }
    if profile.valid_to.is_none() {
        profile.valid_to = Some(far_future());
    }
}

/// No two profiles with the same EVSE, purpose and stack level may be valid at the same time.
pub fn validate_validity_period(
    profile: &ChargingProfile,
    evse_id: i32,
    installed: &[EvseChargingProfile],
) -> ProfileValidationResult {
    let (from, to) = profile.validity();
    let overlapping = installed.iter().any(|other| {
        other.evse_id == evse_id
            && other.profile.id != profile.id
            && other.profile.charging_profile_purpose == profile.charging_profile_purpose
            && other.profile.stack_level == profile.stack_level
            && other.profile.is_valid_within(from, to)
    });
    if overlapping {
        ProfileValidationResult::DuplicateProfileValidityPeriod
    } else {
        ProfileValidationResult::Valid
    }
}
