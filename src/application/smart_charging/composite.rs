//! Composite schedule calculation
//!
//! 1. Expand every applicable profile into [`PeriodEntry`]s.
//! 2. Per purpose, walk the entry boundaries: at each instant the highest
//!    stack level wins; gaps carry [`NO_LIMIT_SPECIFIED`]. Every period
//!    remembers the stack level it came from.
//! 3. Combine purposes: TxProfile over TxDefaultProfile, capped by the lower
//!    of ChargingStationMaxProfile and ChargingStationExternalConstraints.
//! 4. Fill remaining gaps with the defaults and collapse repeats.

use chrono::{DateTime, Duration, SubsecRound, Utc};

use super::profile::{calculate_profile, PeriodEntry};
use super::validation::DEFAULT_AND_MAX_NUMBER_PHASES;
use crate::domain::charging_profile::{
    ChargingProfile, ChargingProfilePurpose, ChargingRateUnit, CompositeSchedule,
    CompositeSchedulePeriod,
};

pub const DEFAULT_LIMIT_AMPS: f64 = 48.0;
pub const DEFAULT_LIMIT_WATTS: f64 = 33_120.0;
pub const LOW_VOLTAGE: f64 = 230.0;
pub const NO_LIMIT_SPECIFIED: f64 = -1.0;

pub fn default_limit(unit: ChargingRateUnit) -> f64 {
    match unit {
        ChargingRateUnit::Amps => DEFAULT_LIMIT_AMPS,
        ChargingRateUnit::Watts => DEFAULT_LIMIT_WATTS,
    }
}

/// Inputs that are not profiles.
#[derive(Debug, Clone, Copy)]
pub struct CompositeParams {
    pub evse_id: i32,
    pub start: DateTime<Utc>,
    pub duration: i32,
    pub unit: ChargingRateUnit,
    /// Start of the EVSE's transaction, for relative profiles.
    pub session_start: Option<DateTime<Utc>>,
    pub supply_voltage: f64,
}

fn no_limit(start_period: i32) -> CompositeSchedulePeriod {
    CompositeSchedulePeriod {
        start_period,
        limit: NO_LIMIT_SPECIFIED,
        number_phases: None,
        phase_to_use: None,
        stack_level: None,
    }
}

fn has_limit(period: &CompositeSchedulePeriod) -> bool {
    period.limit != NO_LIMIT_SPECIFIED
}

/// Equal on the wire. A repeat keeps the stack level of the first period.
fn same_limit(a: &CompositeSchedulePeriod, b: &CompositeSchedulePeriod) -> bool {
    a.limit == b.limit && a.number_phases == b.number_phases && a.phase_to_use == b.phase_to_use
}

/// Limit of `entry` expressed in `unit`.
fn convert_limit(entry: &PeriodEntry, unit: ChargingRateUnit, supply_voltage: f64) -> (f64, i32) {
    let phases = entry.number_phases.unwrap_or(DEFAULT_AND_MAX_NUMBER_PHASES);
    let factor = supply_voltage * f64::from(phases);
    let limit = match (entry.charging_rate_unit, unit) {
        (ChargingRateUnit::Amps, ChargingRateUnit::Watts) => entry.limit * factor,
        (ChargingRateUnit::Watts, ChargingRateUnit::Amps) => entry.limit / factor,
        _ => entry.limit,
    };
    (limit, phases)
}

fn offset_secs(from: DateTime<Utc>, to: DateTime<Utc>) -> i32 {
    i32::try_from((to - from).num_seconds()).unwrap_or(i32::MAX)
}

/// Merge one purpose's entries into contiguous periods over `[start, end)`,
/// relative to `start`. The highest stack level wins; gaps carry no limit.
pub fn calculate_intermediate_schedule(
    entries: &[PeriodEntry],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    unit: ChargingRateUnit,
    supply_voltage: f64,
) -> Vec<CompositeSchedulePeriod> {
    let mut points = vec![start, end];
    for entry in entries {
        for point in [entry.start, entry.end] {
            if point > start && point < end {
                points.push(point);
            }
        }
    }
    points.sort();
    points.dedup();

    let mut periods: Vec<CompositeSchedulePeriod> = Vec::new();
    for window in points.windows(2) {
        let at = window[0];
        let offset = offset_secs(start, at);

        let chosen = entries
            .iter()
            .filter(|entry| entry.is_active_at(at))
            .max_by(|a, b| a.stack_level.cmp(&b.stack_level).then(a.start.cmp(&b.start)));

        let period = match chosen {
            Some(entry) => {
                let (limit, phases) = convert_limit(entry, unit, supply_voltage);
                CompositeSchedulePeriod {
                    start_period: offset,
                    limit,
                    number_phases: Some(phases),
                    phase_to_use: entry.phase_to_use,
                    stack_level: Some(entry.stack_level),
                }
            }
            None => no_limit(offset),
        };

        if periods.last().map_or(true, |last| !same_limit(last, &period)) {
            periods.push(period);
        }
    }
    periods
}

/// Period of a contiguous schedule in force at `offset`.
fn period_at(periods: &[CompositeSchedulePeriod], offset: i32) -> CompositeSchedulePeriod {
    periods
        .iter()
        .rev()
        .find(|p| p.start_period <= offset)
        .cloned()
        .unwrap_or_else(|| no_limit(offset))
}

/// Lower `period` to `ceiling`. In watts the ceiling is compared per phase.
/// The stack level follows whichever side set the limit.
fn apply_ceiling(
    period: &mut CompositeSchedulePeriod,
    ceiling: &CompositeSchedulePeriod,
    unit: ChargingRateUnit,
) {
    let ceiling_phases = ceiling.number_phases.unwrap_or(DEFAULT_AND_MAX_NUMBER_PHASES);
    let period_phases = period.number_phases.unwrap_or(DEFAULT_AND_MAX_NUMBER_PHASES);
    let phases = ceiling_phases.min(period_phases);

    let ceiling_wins = match unit {
        ChargingRateUnit::Watts if ceiling_phases != period_phases => {
            ceiling.limit / f64::from(ceiling_phases) < period.limit / f64::from(period_phases)
        }
        _ => ceiling.limit < period.limit,
    };
    if ceiling_wins {
        period.stack_level = ceiling.stack_level;
    }

    period.limit = match unit {
        ChargingRateUnit::Watts if ceiling_phases != period_phases => {
            let per_phase = (ceiling.limit / f64::from(ceiling_phases))
                .min(period.limit / f64::from(period_phases));
            (per_phase * f64::from(phases)).floor()
        }
        _ => period.limit.min(ceiling.limit),
    };
    period.number_phases = Some(phases);
}

/// Combine the per-purpose schedules of one window.
pub fn combine_schedules(
    ceilings: &[&[CompositeSchedulePeriod]],
    tx_default: &[CompositeSchedulePeriod],
    tx: &[CompositeSchedulePeriod],
    duration: i32,
    unit: ChargingRateUnit,
) -> Vec<CompositeSchedulePeriod> {
    let mut points: Vec<i32> = ceilings
        .iter()
        .flat_map(|schedule| schedule.iter())
        .chain(tx_default)
        .chain(tx)
        .map(|p| p.start_period)
        .filter(|offset| (0..duration).contains(offset))
        .collect();
    points.push(0);
    points.sort_unstable();
    points.dedup();

    let mut combined: Vec<CompositeSchedulePeriod> = Vec::new();
    for offset in points {
        let tx_period = period_at(tx, offset);
        let mut period = if has_limit(&tx_period) {
            tx_period
        } else {
            period_at(tx_default, offset)
        };

        for ceiling in ceilings {
            let ceiling = period_at(ceiling, offset);
            if !has_limit(&ceiling) {
                continue;
            }
            if has_limit(&period) {
                apply_ceiling(&mut period, &ceiling, unit);
            } else {
                period = ceiling;
            }
        }

        if !has_limit(&period) {
            period.limit = default_limit(unit);
            period.stack_level = None;
        }
        period.number_phases.get_or_insert(DEFAULT_AND_MAX_NUMBER_PHASES);
        period.start_period = offset;

        if combined.last().map_or(true, |last| !same_limit(last, &period)) {
            combined.push(period);
        }
    }
    combined
}

/// Composite schedule of `profiles` (already filtered for the EVSE) over
/// `[params.start, params.start + params.duration)`.
pub fn calculate_composite_schedule(
    profiles: &[ChargingProfile],
    params: &CompositeParams,
) -> CompositeSchedule {
    let start = params.start.trunc_subsecs(0);
    let end = start + Duration::seconds(i64::from(params.duration.max(0)));

    let intermediate = |purpose: ChargingProfilePurpose| {
        let entries: Vec<PeriodEntry> = profiles
            .iter()
            .filter(|p| p.charging_profile_purpose == purpose)
            .flat_map(|p| calculate_profile(start, end, params.session_start, p))
            .collect();
        calculate_intermediate_schedule(&entries, start, end, params.unit, params.supply_voltage)
    };

    let external = intermediate(ChargingProfilePurpose::ChargingStationExternalConstraints);
    let station_max = intermediate(ChargingProfilePurpose::ChargingStationMaxProfile);
    let tx_default = intermediate(ChargingProfilePurpose::TxDefaultProfile);
    let tx = intermediate(ChargingProfilePurpose::TxProfile);

    let periods = if params.duration > 0 {
        combine_schedules(
            &[&station_max, &external],
            &tx_default,
            &tx,
            params.duration,
            params.unit,
        )
    } else {
        Vec::new()
    };

    CompositeSchedule {
        evse_id: params.evse_id,
        duration: params.duration,
        schedule_start: start,
        charging_rate_unit: params.unit,
        charging_schedule_period: periods,
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::domain::charging_profile::{
        ChargingProfileKind, ChargingSchedule, ChargingSchedulePeriod, RecurrencyKind,
    };

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn params(duration: i32, unit: ChargingRateUnit) -> CompositeParams {
        CompositeParams {
            evse_id: 1,
            start: now(),
            duration,
            unit,
            session_start: None,
            supply_voltage: LOW_VOLTAGE,
        }
    }

    fn period(start_period: i32, limit: f64) -> ChargingSchedulePeriod {
        ChargingSchedulePeriod {
            start_period,
            limit,
            number_phases: Some(3),
            phase_to_use: None,
        }
    }

    fn absolute(
        id: i32,
        purpose: ChargingProfilePurpose,
        stack_level: i32,
        unit: ChargingRateUnit,
        duration: Option<i32>,
        periods: Vec<ChargingSchedulePeriod>,
    ) -> ChargingProfile {
        ChargingProfile {
            id,
            stack_level,
            charging_profile_purpose: purpose,
            charging_profile_kind: ChargingProfileKind::Absolute,
            recurrency_kind: None,
            valid_from: None,
            valid_to: None,
            transaction_id: None,
            charging_schedule: vec![ChargingSchedule {
                id,
                start_schedule: Some(now()),
                duration,
                charging_rate_unit: unit,
                charging_schedule_period: periods,
                min_charging_rate: None,
            }],
        }
    }

    fn limits(schedule: &CompositeSchedule) -> Vec<(i32, f64)> {
        schedule
            .charging_schedule_period
            .iter()
            .map(|p| (p.start_period, p.limit))
            .collect()
    }

    fn assert_contiguous(schedule: &CompositeSchedule) {
        let periods = &schedule.charging_schedule_period;
        assert_eq!(periods.first().map(|p| p.start_period), Some(0));
        assert!(periods.windows(2).all(|w| w[0].start_period < w[1].start_period));
        assert!(periods.iter().all(|p| p.start_period < schedule.duration));
        assert!(periods.iter().all(|p| p.limit >= 0.0 && p.number_phases.is_some()));
    }

    #[test]
    fn tx_default_below_station_max_then_station_max() {
        let profiles = vec![
            absolute(
                1,
                ChargingProfilePurpose::ChargingStationMaxProfile,
                0,
                ChargingRateUnit::Watts,
                None,
                vec![period(0, 11_000.0)],
            ),
            absolute(
                2,
                ChargingProfilePurpose::TxDefaultProfile,
                0,
                ChargingRateUnit::Watts,
                Some(1020),
                vec![period(0, 2_000.0)],
            ),
        ];

        let schedule =
            calculate_composite_schedule(&profiles, &params(3600, ChargingRateUnit::Watts));
        assert_eq!(limits(&schedule), vec![(0, 2_000.0), (1020, 11_000.0)]);
        assert_eq!(schedule.schedule_start, now());
        assert_eq!(schedule.duration, 3600);
        assert_contiguous(&schedule);
    }

    #[test]
    fn no_profiles_yields_default_limit() {
        let schedule = calculate_composite_schedule(&[], &params(600, ChargingRateUnit::Amps));
        assert_eq!(limits(&schedule), vec![(0, DEFAULT_LIMIT_AMPS)]);
        assert_eq!(schedule.charging_schedule_period[0].number_phases, Some(3));

        let schedule = calculate_composite_schedule(&[], &params(600, ChargingRateUnit::Watts));
        assert_eq!(limits(&schedule), vec![(0, DEFAULT_LIMIT_WATTS)]);
    }

    #[test]
    fn tx_profile_wins_over_tx_default_regardless_of_stack_level() {
        let profiles = vec![
            absolute(
                1,
                ChargingProfilePurpose::TxDefaultProfile,
                9,
                ChargingRateUnit::Amps,
                None,
                vec![period(0, 32.0)],
            ),
            absolute(
                2,
                ChargingProfilePurpose::TxProfile,
                0,
                ChargingRateUnit::Amps,
                Some(600),
                vec![period(0, 40.0)],
            ),
        ];

        let schedule =
            calculate_composite_schedule(&profiles, &params(1200, ChargingRateUnit::Amps));
        // After the TxProfile ends the TxDefaultProfile takes over.
        assert_eq!(limits(&schedule), vec![(0, 40.0), (600, 32.0)]);
    }

    #[test]
    fn highest_stack_level_wins_within_a_purpose() {
        let profiles = vec![
            absolute(
                1,
                ChargingProfilePurpose::TxDefaultProfile,
                0,
                ChargingRateUnit::Amps,
                None,
                vec![period(0, 16.0)],
            ),
            absolute(
                2,
                ChargingProfilePurpose::TxDefaultProfile,
                5,
                ChargingRateUnit::Amps,
                None,
                vec![period(0, 6.0), period(300, 25.0)],
            ),
        ];

        let schedule =
            calculate_composite_schedule(&profiles, &params(900, ChargingRateUnit::Amps));
        assert_eq!(limits(&schedule), vec![(0, 6.0), (300, 25.0)]);
    }

    #[test]
    fn external_constraints_and_station_max_cap_together() {
        let profiles = vec![
            absolute(
                1,
                ChargingProfilePurpose::ChargingStationMaxProfile,
                0,
                ChargingRateUnit::Amps,
                None,
                vec![period(0, 32.0)],
            ),
            absolute(
                2,
                ChargingProfilePurpose::ChargingStationExternalConstraints,
                0,
                ChargingRateUnit::Amps,
                Some(600),
                vec![period(0, 10.0)],
            ),
            absolute(
                3,
                ChargingProfilePurpose::TxDefaultProfile,
                0,
                ChargingRateUnit::Amps,
                None,
                vec![period(0, 20.0), period(900, 40.0)],
            ),
        ];

        let schedule =
            calculate_composite_schedule(&profiles, &params(1800, ChargingRateUnit::Amps));
        assert_eq!(limits(&schedule), vec![(0, 10.0), (600, 20.0), (900, 32.0)]);
        assert_contiguous(&schedule);
    }

    #[test]
    fn gap_between_profiles_gets_default() {
        let profiles = vec![absolute(
            1,
            ChargingProfilePurpose::TxDefaultProfile,
            0,
            ChargingRateUnit::Amps,
            Some(300),
            vec![period(0, 16.0)],
        )];

        let schedule =
            calculate_composite_schedule(&profiles, &params(900, ChargingRateUnit::Amps));
        assert_eq!(limits(&schedule), vec![(0, 16.0), (300, DEFAULT_LIMIT_AMPS)]);
    }

    #[test]
    fn amps_are_converted_to_watts() {
        let profiles = vec![absolute(
            1,
            ChargingProfilePurpose::TxDefaultProfile,
            0,
            ChargingRateUnit::Amps,
            None,
            vec![
                period(0, 16.0),
                ChargingSchedulePeriod {
                    number_phases: Some(1),
                    ..period(600, 16.0)
                },
            ],
        )];

        let schedule =
            calculate_composite_schedule(&profiles, &params(1200, ChargingRateUnit::Watts));
        assert_eq!(
            limits(&schedule),
            vec![(0, 16.0 * 230.0 * 3.0), (600, 16.0 * 230.0)]
        );
        assert_eq!(schedule.charging_schedule_period[1].number_phases, Some(1));
    }

    #[test]
    fn watt_ceiling_with_fewer_phases_is_compared_per_phase() {
        let mut single_phase = CompositeSchedulePeriod {
            number_phases: Some(1),
            stack_level: Some(4),
            ..no_limit(0)
        };
        single_phase.limit = 7_000.0;
        let ceiling = CompositeSchedulePeriod {
            limit: 11_000.0,
            number_phases: Some(3),
            stack_level: Some(1),
            ..no_limit(0)
        };
        apply_ceiling(&mut single_phase, &ceiling, ChargingRateUnit::Watts);
        // 11000 W over 3 phases allows 3666 W on the single phase.
        assert_eq!(single_phase.limit, 3_666.0);
        assert_eq!(single_phase.number_phases, Some(1));
        assert_eq!(single_phase.stack_level, Some(1));
    }

    #[test]
    fn periods_keep_the_stack_level_that_set_them() {
        let profiles = vec![
            absolute(
                1,
                ChargingProfilePurpose::TxDefaultProfile,
                0,
                ChargingRateUnit::Amps,
                Some(1200),
                vec![period(0, 16.0)],
            ),
            absolute(
                2,
                ChargingProfilePurpose::TxDefaultProfile,
                5,
                ChargingRateUnit::Amps,
                Some(600),
                vec![period(0, 6.0), period(300, 25.0)],
            ),
            absolute(
                3,
                ChargingProfilePurpose::ChargingStationMaxProfile,
                2,
                ChargingRateUnit::Amps,
                None,
                vec![period(0, 20.0)],
            ),
        ];

        let schedule =
            calculate_composite_schedule(&profiles, &params(1800, ChargingRateUnit::Amps));
        assert_eq!(
            limits(&schedule),
            vec![(0, 6.0), (300, 20.0), (600, 16.0), (1200, 20.0)]
        );
        let levels: Vec<Option<i32>> = schedule
            .charging_schedule_period
            .iter()
            .map(|p| p.stack_level)
            .collect();
        assert_eq!(levels, vec![Some(5), Some(2), Some(0), Some(2)]);

        let default = calculate_composite_schedule(&[], &params(600, ChargingRateUnit::Amps));
        assert_eq!(default.charging_schedule_period[0].stack_level, None);
    }

    fn recurring(
        kind: RecurrencyKind,
        anchor: DateTime<Utc>,
        periods: Vec<ChargingSchedulePeriod>,
    ) -> ChargingProfile {
        let mut profile = absolute(
            1,
            ChargingProfilePurpose::TxDefaultProfile,
            0,
            ChargingRateUnit::Amps,
            None,
            periods,
        );
        profile.charging_profile_kind = ChargingProfileKind::Recurring;
        profile.recurrency_kind = Some(kind);
        profile.charging_schedule[0].start_schedule = Some(anchor);
        profile
    }

    #[test]
    fn daily_window_crossing_the_cycle_start() {
        let anchor = Utc.with_ymd_and_hms(2024, 1, 1, 8, 0, 0).unwrap();
        // 16 A from 08:00, 6 A from 18:00 until the next 08:00.
        let profile = recurring(
            RecurrencyKind::Daily,
            anchor,
            vec![period(0, 16.0), period(36_000, 6.0)],
        );

        let mut p = params(7200, ChargingRateUnit::Amps);
        p.start = Utc.with_ymd_and_hms(2024, 1, 3, 7, 0, 0).unwrap();
        let schedule = calculate_composite_schedule(&[profile], &p);
        assert_eq!(limits(&schedule), vec![(0, 6.0), (3600, 16.0)]);
        assert_contiguous(&schedule);
    }

    #[test]
    fn weekly_window_crossing_the_cycle_start() {
        // Monday midnight: 10 A on weekdays, 20 A from Saturday.
        let anchor = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let profile = recurring(
            RecurrencyKind::Weekly,
            anchor,
            vec![period(0, 10.0), period(5 * 86_400, 20.0)],
        );

        // Sunday 23:00 of the second week, for two hours.
        let mut p = params(7200, ChargingRateUnit::Amps);
        p.start = Utc.with_ymd_and_hms(2024, 1, 14, 23, 0, 0).unwrap();
        let schedule = calculate_composite_schedule(&[profile], &p);
        assert_eq!(limits(&schedule), vec![(0, 20.0), (3600, 10.0)]);
        assert_contiguous(&schedule);
    }

    #[test]
    fn relative_profile_follows_session_start() {
        let mut profile = absolute(
            1,
            ChargingProfilePurpose::TxProfile,
            0,
            ChargingRateUnit::Amps,
            None,
            vec![period(0, 8.0), period(1800, 24.0)],
        );
        profile.charging_profile_kind = ChargingProfileKind::Relative;
        profile.charging_schedule[0].start_schedule = None;

        let mut p = params(3600, ChargingRateUnit::Amps);
        p.session_start = Some(now() - Duration::seconds(600));
        let schedule = calculate_composite_schedule(&[profile], &p);
        assert_eq!(limits(&schedule), vec![(0, 8.0), (1200, 24.0)]);
    }
}
