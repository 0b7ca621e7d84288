//! Expanding a charging profile into absolute periods
//!
//! A profile's schedule is relative to a start time that depends on its
//! kind. [`calculate_profile`] resolves that start (once, or once per
//! recurrence for recurring profiles) and turns every schedule period into a
//! [`PeriodEntry`] with absolute bounds, clipped to the profile's validity.

use chrono::{DateTime, Duration, SubsecRound, Utc};
use tracing::warn;

use crate::domain::charging_profile::{
    ChargingProfile, ChargingProfileKind, ChargingRateUnit, RecurrencyKind,
};

pub const SECONDS_PER_DAY: i64 = 86_400;
pub const DAYS_PER_WEEK: i64 = 7;

/// Stand-in for a period without an end.
const FOREVER_SECS: i64 = i32::MAX as i64;

/// One schedule period placed on the timeline: active in `[start, end)`.
#[derive(Debug, Clone, PartialEq)]
pub struct PeriodEntry {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub limit: f64,
    pub number_phases: Option<i32>,
    pub phase_to_use: Option<i32>,
    pub stack_level: i32,
    pub charging_rate_unit: ChargingRateUnit,
    pub min_charging_rate: Option<f64>,
}

impl PeriodEntry {
    pub fn is_active_at(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }
}

/// Start times of the profile's schedule that can affect `[now, end]`.
///
/// - Absolute: `startSchedule`, falling back to `validFrom`, then `now`.
/// - Recurring: the most recent cycle start at or before `now`, then every
///   following cycle up to `end`. Cycles are anchored at `startSchedule`.
/// - Relative: the session start, or `now` without a session.
pub fn calculate_start(
    now: DateTime<Utc>,
    end: DateTime<Utc>,
    session_start: Option<DateTime<Utc>>,
    profile: &ChargingProfile,
) -> Vec<DateTime<Utc>> {
    let now = now.trunc_subsecs(0);
    let Some(schedule) = profile.primary_schedule() else {
        return Vec::new();
    };

    match profile.charging_profile_kind {
        ChargingProfileKind::Absolute => {
            let start = match (schedule.start_schedule, profile.valid_from) {
                (Some(start), _) => start,
                (None, Some(valid_from)) => {
                    warn!(
                        profile_id = profile.id,
                        "Absolute profile without startSchedule, using validFrom"
                    );
                    valid_from
                }
                (None, None) => {
                    warn!(
                        profile_id = profile.id,
                        "Absolute profile without startSchedule, using now"
                    );
                    now
                }
            };
            vec![start.trunc_subsecs(0)]
        }
        ChargingProfileKind::Recurring => {
            let (Some(kind), Some(anchor)) = (profile.recurrency_kind, schedule.start_schedule)
            else {
                warn!(
                    profile_id = profile.id,
                    "Recurring profile without recurrencyKind or startSchedule"
                );
                return Vec::new();
            };
            let cycle = match kind {
                RecurrencyKind::Daily => SECONDS_PER_DAY,
                RecurrencyKind::Weekly => SECONDS_PER_DAY * DAYS_PER_WEEK,
            };
            let anchor = anchor.trunc_subsecs(0);
            let end = end.trunc_subsecs(0);

            let into_cycle = (now - anchor).num_seconds().rem_euclid(cycle);
            let mut start = now - Duration::seconds(into_cycle);
            let mut starts = Vec::new();
            while start <= end {
                starts.push(start);
                start += Duration::seconds(cycle);
            }
            starts
        }
        ChargingProfileKind::Relative => {
            vec![session_start.map(|s| s.trunc_subsecs(0)).unwrap_or(now)]
        }
    }
}

/// Absolute entries of one period of the profile, one per schedule start.
///
/// A period ends at the earliest of: the next period's start, the schedule
/// duration, the next recurrence and `validTo`.
fn calculate_period_entries(
    now: DateTime<Utc>,
    starts: &[DateTime<Utc>],
    profile: &ChargingProfile,
    period_index: usize,
) -> Vec<PeriodEntry> {
    let Some(schedule) = profile.primary_schedule() else {
        return Vec::new();
    };
    let periods = &schedule.charging_schedule_period;
    let Some(period) = periods.get(period_index) else {
        return Vec::new();
    };

    let mut entries = Vec::new();
    for (i, cycle_start) in starts.iter().enumerate() {
        let mut duration = periods
            .get(period_index + 1)
            .map_or(FOREVER_SECS, |next| i64::from(next.start_period));

        if let Some(schedule_duration) = schedule.duration {
            duration = duration.min(i64::from(schedule_duration));
        }
        if let Some(next_cycle) = starts.get(i + 1) {
            duration = duration.min((*next_cycle - *cycle_start).num_seconds());
        }
        if let Some(valid_to) = profile.valid_to {
            // May be negative: the whole cycle lies past validTo.
            duration = duration.min((valid_to.trunc_subsecs(0) - *cycle_start).num_seconds());
        }

        let mut entry = PeriodEntry {
            start: *cycle_start + Duration::seconds(i64::from(period.start_period)),
            end: *cycle_start + Duration::seconds(duration),
            limit: period.limit,
            number_phases: period.number_phases,
            phase_to_use: period.phase_to_use,
            stack_level: profile.stack_level,
            charging_rate_unit: schedule.charging_rate_unit,
            min_charging_rate: schedule.min_charging_rate,
        };

        if let Some(valid_from) = profile.valid_from {
            let valid_from = valid_from.trunc_subsecs(0);
            if valid_from > entry.start {
                entry.start = valid_from;
            }
        }

        // Drop empty and already expired entries.
        if entry.end > entry.start && entry.end > now {
            entries.push(entry);
        }
    }
    entries
}

/// Every period of `profile` that is active somewhere in `[now, end]`, sorted by start.
pub fn calculate_profile(
    now: DateTime<Utc>,
    end: DateTime<Utc>,
    session_start: Option<DateTime<Utc>>,
    profile: &ChargingProfile,
) -> Vec<PeriodEntry> {
    let now = now.trunc_subsecs(0);
    let starts = calculate_start(now, end, session_start, profile);
    let period_count = profile
        .primary_schedule()
        .map_or(0, |s| s.charging_schedule_period.len());

    let mut entries: Vec<PeriodEntry> = (0..period_count)
        .flat_map(|index| calculate_period_entries(now, &starts, profile, index))
        .filter(|entry| entry.start <= end)
        .collect();
    entries.sort_by_key(|entry| entry.start);
    entries
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::domain::charging_profile::{
        ChargingProfilePurpose, ChargingSchedule, ChargingSchedulePeriod,
    };

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 5, h, m, 0).unwrap()
    }

    fn period(start_period: i32, limit: f64) -> ChargingSchedulePeriod {
        ChargingSchedulePeriod {
            start_period,
            limit,
            number_phases: Some(3),
            phase_to_use: None,
        }
    }

    fn profile(
        kind: ChargingProfileKind,
        start_schedule: Option<DateTime<Utc>>,
        periods: Vec<ChargingSchedulePeriod>,
    ) -> ChargingProfile {
        ChargingProfile {
            id: 1,
            stack_level: 2,
            charging_profile_purpose: ChargingProfilePurpose::TxDefaultProfile,
            charging_profile_kind: kind,
            recurrency_kind: None,
            valid_from: None,
            valid_to: None,
            transaction_id: None,
            charging_schedule: vec![ChargingSchedule {
                id: 1,
                start_schedule,
                duration: None,
                charging_rate_unit: ChargingRateUnit::Amps,
                charging_schedule_period: periods,
                min_charging_rate: None,
            }],
        }
    }

    #[test]
    fn absolute_periods_run_back_to_back() {
        let p = profile(
            ChargingProfileKind::Absolute,
            Some(at(8, 0)),
            vec![period(0, 32.0), period(3600, 16.0)],
        );
        let entries = calculate_profile(at(8, 30), at(12, 0), None, &p);

        assert_eq!(entries.len(), 2);
        assert_eq!((entries[0].start, entries[0].end), (at(8, 0), at(9, 0)));
        assert_eq!(entries[0].limit, 32.0);
        assert_eq!(entries[1].start, at(9, 0));
        assert_eq!(entries[1].stack_level, 2);
    }

    #[test]
    fn schedule_duration_and_valid_to_cut_the_last_period() {
        let mut p = profile(
            ChargingProfileKind::Absolute,
            Some(at(8, 0)),
            vec![period(0, 32.0)],
        );
        p.charging_schedule[0].duration = Some(7200);
        let entries = calculate_profile(at(8, 0), at(12, 0), None, &p);
        assert_eq!(entries[0].end, at(10, 0));

        p.valid_to = Some(at(9, 0));
        let entries = calculate_profile(at(8, 0), at(12, 0), None, &p);
        assert_eq!(entries[0].end, at(9, 0));
    }

    #[test]
    fn valid_from_delays_the_start() {
        let mut p = profile(
            ChargingProfileKind::Absolute,
            Some(at(8, 0)),
            vec![period(0, 32.0), period(3600, 16.0)],
        );
        p.valid_from = Some(at(9, 30));
        let entries = calculate_profile(at(8, 0), at(12, 0), None, &p);

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].start, at(9, 30));
        assert_eq!(entries[0].limit, 16.0);
    }

    #[test]
    fn expired_periods_are_dropped() {
        let p = profile(
            ChargingProfileKind::Absolute,
            Some(at(6, 0)),
            vec![period(0, 32.0), period(3600, 16.0)],
        );
        let entries = calculate_profile(at(8, 0), at(12, 0), None, &p);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].limit, 16.0);
    }

    #[test]
    fn relative_profile_starts_with_the_session() {
        let p = profile(ChargingProfileKind::Relative, None, vec![period(0, 10.0)]);

        let with_session = calculate_start(at(10, 0), at(11, 0), Some(at(9, 15)), &p);
        assert_eq!(with_session, vec![at(9, 15)]);

        let without_session = calculate_start(at(10, 0), at(11, 0), None, &p);
        assert_eq!(without_session, vec![at(10, 0)]);
    }

    #[test]
    fn daily_recurrence_is_anchored_at_start_schedule() {
        let mut p = profile(
            ChargingProfileKind::Recurring,
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 8, 0, 0).unwrap()),
            vec![period(0, 16.0), period(3600, 10.0)],
        );
        p.recurrency_kind = Some(RecurrencyKind::Daily);

        // 07:30 still belongs to yesterday's cycle.
        let starts = calculate_start(at(7, 30), at(9, 30), None, &p);
        assert_eq!(
            starts,
            vec![Utc.with_ymd_and_hms(2024, 1, 4, 8, 0, 0).unwrap(), at(8, 0)]
        );

        let entries = calculate_profile(at(7, 30), at(9, 30), None, &p);
        let spans: Vec<_> = entries.iter().map(|e| (e.start, e.limit)).collect();
        assert_eq!(
            spans,
            vec![
                (Utc.with_ymd_and_hms(2024, 1, 4, 9, 0, 0).unwrap(), 10.0),
                (at(8, 0), 16.0),
                (at(9, 0), 10.0),
            ]
        );
        // Yesterday's last period stops where today's cycle begins.
        assert_eq!(entries[0].end, at(8, 0));
        assert_eq!(entries[1].end, at(9, 0));
        assert!(entries[2].end > at(9, 30));
    }

    #[test]
    fn weekly_recurrence_steps_a_week() {
        let mut p = profile(
            ChargingProfileKind::Recurring,
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
            vec![period(0, 16.0)],
        );
        p.recurrency_kind = Some(RecurrencyKind::Weekly);

        let now = Utc.with_ymd_and_hms(2024, 1, 10, 12, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 1, 20, 0, 0, 0).unwrap();
        let starts = calculate_start(now, end, None, &p);
        assert_eq!(
            starts,
            vec![
                Utc.with_ymd_and_hms(2024, 1, 8, 0, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap(),
            ]
        );
    }
}
