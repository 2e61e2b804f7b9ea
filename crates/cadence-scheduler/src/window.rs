use chrono::{
    DateTime, Datelike, Days, Duration, LocalResult, Months, NaiveDateTime, TimeZone, Timelike, Utc,
};
use chrono_tz::Tz;

use cadence_core::types::IntervalCode;

use crate::interval::{CustomSchedule, ScheduleExpression};

/// How far back from "now" the window search starts.
///
/// Fixed and crontab schedules have minute resolution, so starting one minute
/// back finds the window that is currently open for the whole of that minute.
pub const WINDOW_LOOKBACK_SECS: i64 = 60;

/// One due occurrence of a schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Occurrence {
    /// Canonical instant identifying the window, independent of delay.
    pub window_start: DateTime<Utc>,
    /// `window_start + delay_seconds`.
    pub fire_at: DateTime<Utc>,
}

impl Occurrence {
    pub fn delay(&self) -> Duration {
        self.fire_at - self.window_start
    }
}

/// Computes next occurrences and window starts in a fixed time zone.
///
/// Stateless apart from the zone: identical inputs always give identical output.
#[derive(Debug, Clone, Copy)]
pub struct WindowCalculator {
    tz: Tz,
}

impl Default for WindowCalculator {
    fn default() -> Self {
        Self::new(Tz::UTC)
    }
}

impl WindowCalculator {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }

    /// First instant matching `expr` at or after `reference` (`allow_current`)
    /// or strictly after it. `None` for `Never` or an exhausted expression.
    pub fn next_occurrence(
        &self,
        expr: &ScheduleExpression,
        reference: DateTime<Utc>,
        allow_current: bool,
    ) -> Option<DateTime<Utc>> {
        match expr {
            ScheduleExpression::Never => None,
            ScheduleExpression::Fixed(fixed) => {
                self.next_fixed(fixed.interval, reference, allow_current)
            }
            ScheduleExpression::Custom(custom) => {
                self.next_custom(custom, reference, allow_current)
            }
        }
    }

    /// Start of the window `now` belongs to: the first occurrence at or after
    /// `now - 1 minute`. This is either the window that is currently open or,
    /// when none is, the next one.
    pub fn window_start(
        &self,
        expr: &ScheduleExpression,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        self.next_occurrence(expr, now - Duration::seconds(WINDOW_LOOKBACK_SECS), true)
    }

    /// Window start plus the template's delay.
    pub fn occurrence(
        &self,
        expr: &ScheduleExpression,
        now: DateTime<Utc>,
        delay_seconds: u32,
    ) -> Option<Occurrence> {
        let window_start = self.window_start(expr, now)?;
        Some(Occurrence {
            window_start,
            fire_at: window_start + Duration::seconds(i64::from(delay_seconds)),
        })
    }

    /// Whether a window of `expr` is open at `instant`.
    pub fn is_due(&self, expr: &ScheduleExpression, instant: DateTime<Utc>) -> bool {
        self.window_start(expr, instant)
            .is_some_and(|start| start <= instant)
    }

    fn next_custom(
        &self,
        custom: &CustomSchedule,
        reference: DateTime<Utc>,
        allow_current: bool,
    ) -> Option<DateTime<Utc>> {
        // the evaluator only yields instants strictly after its argument
        let start = if allow_current {
            ceil_to_second(reference) - Duration::seconds(1)
        } else {
            reference
        };
        custom
            .next_after(&start.with_timezone(&self.tz))
            .map(|dt| dt.with_timezone(&Utc))
    }

    fn next_fixed(
        &self,
        interval: IntervalCode,
        reference: DateTime<Utc>,
        allow_current: bool,
    ) -> Option<DateTime<Utc>> {
        let local = reference.with_timezone(&self.tz).naive_local();
        let floor = floor_boundary(interval, local)?;
        let mut candidate = if floor < local || !allow_current {
            next_boundary(interval, floor)?
        } else {
            floor
        };

        // A local boundary can fall into a DST gap or map to an instant before
        // `reference` inside a repeated hour; move on to the next boundary.
        for _ in 0..8 {
            let mapped = match self.tz.from_local_datetime(&candidate) {
                LocalResult::Single(at) => [Some(at), None],
                LocalResult::Ambiguous(first, second) => [Some(first), Some(second)],
                LocalResult::None => [None, None],
            };
            let hit = mapped
                .into_iter()
                .flatten()
                .map(|at| at.with_timezone(&Utc))
                .find(|utc| *utc > reference || (allow_current && *utc == reference));
            if hit.is_some() {
                return hit;
            }
            candidate = next_boundary(interval, candidate)?;
        }
        None
    }
}

/// Latest boundary of `interval` at or before `local`.
fn floor_boundary(interval: IntervalCode, local: NaiveDateTime) -> Option<NaiveDateTime> {
    let date = local.date();
    match interval {
        IntervalCode::Minute => local.with_second(0)?.with_nanosecond(0),
        IntervalCode::Hour => local.with_minute(0)?.with_second(0)?.with_nanosecond(0),
        IntervalCode::Day => date.and_hms_opt(0, 0, 0),
        IntervalCode::Week => {
            let since_sunday = u64::from(date.weekday().num_days_from_sunday());
            date.checked_sub_days(Days::new(since_sunday))?
                .and_hms_opt(0, 0, 0)
        }
        IntervalCode::Month => date.with_day(1)?.and_hms_opt(0, 0, 0),
        IntervalCode::Year => date.with_day(1)?.with_month(1)?.and_hms_opt(0, 0, 0),
        IntervalCode::Custom | IntervalCode::None => None,
    }
}

/// The boundary following `boundary`, which must itself be a boundary.
fn next_boundary(interval: IntervalCode, boundary: NaiveDateTime) -> Option<NaiveDateTime> {
    match interval {
        IntervalCode::Minute => boundary.checked_add_signed(Duration::minutes(1)),
        IntervalCode::Hour => boundary.checked_add_signed(Duration::hours(1)),
        IntervalCode::Day => boundary.checked_add_days(Days::new(1)),
        IntervalCode::Week => boundary.checked_add_days(Days::new(7)),
        IntervalCode::Month => boundary.checked_add_months(Months::new(1)),
        IntervalCode::Year => boundary.checked_add_months(Months::new(12)),
        IntervalCode::Custom | IntervalCode::None => None,
    }
}

fn ceil_to_second(at: DateTime<Utc>) -> DateTime<Utc> {
    if at.nanosecond() == 0 {
        at
    } else {
        at.with_nanosecond(0).unwrap_or(at) + Duration::seconds(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interval::IntervalResolver;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    fn fixed(code: IntervalCode) -> ScheduleExpression {
        IntervalResolver::new().resolve(code, None).unwrap()
    }

    fn custom(expr: &str) -> ScheduleExpression {
        IntervalResolver::new()
            .resolve(IntervalCode::Custom, Some(expr))
            .unwrap()
    }

    #[test]
    fn hourly_window_start_is_top_of_hour() {
        let calc = WindowCalculator::default();
        let start = calc.window_start(&fixed(IntervalCode::Hour), utc(2024, 3, 5, 10, 0, 7));
        assert_eq!(start, Some(utc(2024, 3, 5, 10, 0, 0)));
    }

    #[test]
    fn daily_window_ahead_of_midnight() {
        let calc = WindowCalculator::default();
        let expr = fixed(IntervalCode::Day);
        assert_eq!(
            calc.window_start(&expr, utc(2024, 1, 31, 23, 0, 0)),
            Some(utc(2024, 2, 1, 0, 0, 0))
        );
        // still the same window half a minute in
        assert_eq!(
            calc.window_start(&expr, utc(2024, 2, 1, 0, 0, 30)),
            Some(utc(2024, 2, 1, 0, 0, 0))
        );
        // once the lookback has passed the boundary, the next day is returned
        assert_eq!(
            calc.window_start(&expr, utc(2024, 2, 1, 0, 1, 1)),
            Some(utc(2024, 2, 2, 0, 0, 0))
        );
    }

    #[test]
    fn weekly_windows_start_on_sunday() {
        let calc = WindowCalculator::default();
        // Wednesday 2024-03-06
        let start = calc
            .window_start(&fixed(IntervalCode::Week), utc(2024, 3, 6, 12, 0, 0))
            .unwrap();
        assert_eq!(start, utc(2024, 3, 10, 0, 0, 0));
        assert_eq!(start.weekday(), chrono::Weekday::Sun);
    }

    #[test]
    fn monthly_and_yearly_windows() {
        let calc = WindowCalculator::default();
        assert_eq!(
            calc.window_start(&fixed(IntervalCode::Month), utc(2024, 1, 31, 8, 0, 0)),
            Some(utc(2024, 2, 1, 0, 0, 0))
        );
        assert_eq!(
            calc.window_start(&fixed(IntervalCode::Year), utc(2024, 6, 15, 8, 0, 0)),
            Some(utc(2025, 1, 1, 0, 0, 0))
        );
    }

    #[test]
    fn allow_current_controls_boundary_inclusion() {
        let calc = WindowCalculator::default();
        let at = utc(2024, 3, 5, 10, 0, 0);
        for expr in [fixed(IntervalCode::Hour), custom("0 * * * *")] {
            assert_eq!(calc.next_occurrence(&expr, at, true), Some(at));
            assert_eq!(
                calc.next_occurrence(&expr, at, false),
                Some(utc(2024, 3, 5, 11, 0, 0))
            );
        }
    }

    #[test]
    fn never_has_no_occurrence() {
        let calc = WindowCalculator::default();
        let now = utc(2024, 3, 5, 10, 0, 0);
        assert_eq!(calc.next_occurrence(&ScheduleExpression::Never, now, true), None);
        assert_eq!(calc.occurrence(&ScheduleExpression::Never, now, 0), None);
        assert!(!calc.is_due(&ScheduleExpression::Never, now));
    }

    #[test]
    fn delay_offsets_fire_time_only() {
        let calc = WindowCalculator::default();
        let expr = fixed(IntervalCode::Hour);
        let now = utc(2024, 3, 5, 10, 0, 7);
        for delay in [0u32, 1, 59, 3_600, 86_400] {
            let occ = calc.occurrence(&expr, now, delay).unwrap();
            assert_eq!(occ.window_start, utc(2024, 3, 5, 10, 0, 0));
            assert_eq!(occ.delay(), Duration::seconds(i64::from(delay)));
        }
    }

    #[test]
    fn identical_inputs_give_identical_windows() {
        let calc = WindowCalculator::new(chrono_tz::Europe::Prague);
        let now = utc(2024, 10, 27, 0, 59, 31);
        for expr in [
            fixed(IntervalCode::Minute),
            fixed(IntervalCode::Day),
            custom("*/7 * * * *"),
        ] {
            assert_eq!(calc.occurrence(&expr, now, 30), calc.occurrence(&expr, now, 30));
        }
    }

    #[test]
    fn custom_expression_windows() {
        let calc = WindowCalculator::default();
        let expr = custom("*/15 * * * *");
        assert_eq!(
            calc.window_start(&expr, utc(2024, 3, 5, 10, 15, 40)),
            Some(utc(2024, 3, 5, 10, 15, 0))
        );
        assert_eq!(
            calc.window_start(&expr, utc(2024, 3, 5, 10, 17, 0)),
            Some(utc(2024, 3, 5, 10, 30, 0))
        );
        assert!(calc.is_due(&expr, utc(2024, 3, 5, 10, 15, 40)));
        assert!(!calc.is_due(&expr, utc(2024, 3, 5, 10, 17, 0)));
    }

    #[test]
    fn weekday_expression_skips_weekend() {
        let calc = WindowCalculator::default();
        let expr = custom("0 9 * * 1-5");
        // Friday 2024-03-08
        assert_eq!(
            calc.window_start(&expr, utc(2024, 3, 8, 9, 0, 30)),
            Some(utc(2024, 3, 8, 9, 0, 0))
        );
        assert_eq!(
            calc.next_occurrence(&expr, utc(2024, 3, 8, 10, 0, 0), false),
            Some(utc(2024, 3, 11, 9, 0, 0))
        );
        assert!(!calc.is_due(&expr, utc(2024, 3, 9, 9, 0, 10)));
        assert!(calc.is_due(&expr, utc(2024, 3, 11, 9, 0, 10)));
    }

    #[test]
    fn day_of_month_or_day_of_week() {
        let calc = WindowCalculator::default();
        for expr in [custom("0 0 13 * 5"), custom("0 0 0 13 * FRI")] {
            // Wednesday 2024-03-06: Friday the 8th comes first
            assert_eq!(
                calc.next_occurrence(&expr, utc(2024, 3, 6, 12, 0, 0), false),
                Some(utc(2024, 3, 8, 0, 0, 0))
            );
            // then Wednesday the 13th, ahead of Friday the 15th
            assert_eq!(
                calc.next_occurrence(&expr, utc(2024, 3, 8, 0, 0, 0), false),
                Some(utc(2024, 3, 13, 0, 0, 0))
            );
            // Friday the 13th fires once
            assert_eq!(
                calc.next_occurrence(&expr, utc(2024, 9, 12, 1, 0, 0), false),
                Some(utc(2024, 9, 13, 0, 0, 0))
            );
            assert_eq!(
                calc.next_occurrence(&expr, utc(2024, 9, 13, 0, 0, 0), false),
                Some(utc(2024, 9, 20, 0, 0, 0))
            );
        }
    }

    #[test]
    fn single_restricted_day_field_is_not_split() {
        let calc = WindowCalculator::default();
        assert_eq!(
            calc.next_occurrence(&custom("0 0 13 * *"), utc(2024, 3, 6, 12, 0, 0), false),
            Some(utc(2024, 3, 13, 0, 0, 0))
        );
        assert_eq!(
            calc.next_occurrence(&custom("0 0 * * 5"), utc(2024, 3, 6, 12, 0, 0), false),
            Some(utc(2024, 3, 8, 0, 0, 0))
        );
    }

    #[test]
    fn subsecond_reference_keeps_current_window() {
        let calc = WindowCalculator::default();
        let at = utc(2024, 3, 5, 10, 0, 0) + Duration::milliseconds(250);
        let expected = Some(utc(2024, 3, 5, 10, 0, 0));
        assert_eq!(calc.window_start(&fixed(IntervalCode::Hour), at), expected);
        assert_eq!(calc.window_start(&custom("0 * * * *"), at), expected);
    }

    #[test]
    fn fixed_arithmetic_agrees_with_evaluator() {
        let resolver = IntervalResolver::new();
        let references = [
            utc(2023, 12, 31, 23, 59, 59),
            utc(2024, 1, 1, 0, 0, 0),
            utc(2024, 2, 29, 13, 37, 12),
            utc(2024, 7, 14, 21, 45, 30),
            utc(2024, 12, 1, 0, 0, 0) + Duration::nanoseconds(1),
        ];
        for tz in [Tz::UTC, chrono_tz::Europe::Prague, chrono_tz::Asia::Kolkata] {
            let calc = WindowCalculator::new(tz);
            for code in IntervalCode::FIXED {
                let fixed = resolver.fixed(code).unwrap();
                let as_fixed = ScheduleExpression::Fixed(fixed);
                let as_cron = ScheduleExpression::Custom(
                    CustomSchedule::parse(fixed.crontab).unwrap(),
                );
                for reference in references {
                    for allow in [true, false] {
                        assert_eq!(
                            calc.next_occurrence(&as_fixed, reference, allow),
                            calc.next_occurrence(&as_cron, reference, allow),
                            "{code} in {tz} from {reference} (allow_current={allow})"
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn hourly_inside_repeated_autumn_hour() {
        let calc = WindowCalculator::new(chrono_tz::Europe::Prague);
        // 01:15 UTC is the second 02:15 of 2024-10-27 (CET)
        let next = calc
            .next_occurrence(&fixed(IntervalCode::Minute), utc(2024, 10, 27, 1, 15, 0), false)
            .unwrap();
        assert_eq!(next, utc(2024, 10, 27, 1, 16, 0));
        let next = calc
            .next_occurrence(&fixed(IntervalCode::Hour), utc(2024, 10, 27, 1, 15, 0), false)
            .unwrap();
        assert_eq!(next, utc(2024, 10, 27, 2, 0, 0));
    }

    #[test]
    fn local_midnight_in_configured_zone() {
        let calc = WindowCalculator::new(chrono_tz::Europe::Prague);
        // 2024-01-31 22:30 UTC is 23:30 in Prague (CET, +01:00)
        let start = calc
            .window_start(&fixed(IntervalCode::Day), utc(2024, 1, 31, 22, 30, 0))
            .unwrap();
        assert_eq!(start, utc(2024, 1, 31, 23, 0, 0));
    }

    #[test]
    fn hourly_across_spring_forward_gap() {
        let calc = WindowCalculator::new(chrono_tz::Europe::Prague);
        // 2024-03-31 02:00 local does not exist; 01:30 local is 00:30 UTC
        let next = calc
            .next_occurrence(&fixed(IntervalCode::Hour), utc(2024, 3, 31, 0, 30, 0), false)
            .unwrap();
        // 03:00 CEST
        assert_eq!(next, utc(2024, 3, 31, 1, 0, 0));
    }
}
