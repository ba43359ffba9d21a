//! Visit window arithmetic.
//!
//! Scheduled windows are compared by whole calendar day: the lower bound is floored to the start
//! of its UTC day and the upper bound is ceiled to the last microsecond of its UTC day. The
//! unscheduled fallback bound is an exact instant.

use crate::config::EdcConfig;
use crate::interval::shift_days;
use crate::error::fmt_dt;
use crate::schedule::{ScheduleDefinition, VisitSpec};
use crate::{EdcError, EdcResult};
use chrono::{DateTime, NaiveTime, Utc};
use edc_types::VisitCode;

/// The computed window of one visit occurrence. Never persisted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Window {
    pub visit_code: VisitCode,
    /// 0 for the scheduled occurrence, >0 for unscheduled ones.
    pub sequence: u32,
    pub timepoint_datetime: DateTime<Utc>,
    pub lower: DateTime<Utc>,
    pub upper: DateTime<Utc>,
    pub candidate: Option<DateTime<Utc>>,
}

impl Window {
    pub fn contains(&self, datetime: DateTime<Utc>) -> bool {
        self.lower <= datetime && datetime <= self.upper
    }

    pub fn with_candidate(mut self, candidate: DateTime<Utc>) -> Self {
        self.candidate = Some(candidate);
        self
    }
}

/// Computes and checks visit windows.
#[derive(Clone, Copy, Debug)]
pub struct WindowCalculator {
    enforce_window_period: bool,
}

impl Default for WindowCalculator {
    fn default() -> Self {
        Self {
            enforce_window_period: true,
        }
    }
}

impl WindowCalculator {
    pub fn new(config: &EdcConfig) -> Self {
        Self {
            enforce_window_period: config.enforce_window_period(),
        }
    }

    /// A calculator whose checks always pass.
    pub fn unenforced() -> Self {
        Self {
            enforce_window_period: false,
        }
    }

    pub fn enforce_window_period(&self) -> bool {
        self.enforce_window_period
    }

    /// Absolute `(lower, upper)` bounds of a visit's scheduled occurrence.
    ///
    /// With `window_gap_to_lower` set and a `previous` visit, the lower bound is moved back so the
    /// window starts the day after the previous visit's window closes.
    pub fn bounds_for_scheduled(
        &self,
        visit: &VisitSpec,
        baseline: DateTime<Utc>,
        previous: Option<&VisitSpec>,
    ) -> (DateTime<Utc>, DateTime<Utc>) {
        let timepoint_datetime = visit.timepoint_datetime(baseline);
        let mut lower = start_of_day(visit.lower_window.before(timepoint_datetime));
        let upper = end_of_day(visit.upper_window.after(timepoint_datetime));

        if visit.window_gap_to_lower {
            if let Some(previous) = previous {
                let previous_upper =
                    end_of_day(previous.upper_window.after(previous.timepoint_datetime(baseline)));
                let gap_days =
                    (lower.date_naive() - previous_upper.date_naive()).num_days() - 1;
                if gap_days > 0 {
                    lower = shift_days(lower, -gap_days);
                }
            }
        }

        tracing::debug!(
            "window for visit {}: [{}, {}]",
            visit.code,
            fmt_dt(&lower),
            fmt_dt(&upper)
        );
        (lower, upper)
    }

    /// The scheduled window of `visit`, with its previous visit taken from `schedule`.
    pub fn window_for(
        &self,
        schedule: &ScheduleDefinition,
        visit_code: &str,
        baseline: DateTime<Utc>,
    ) -> EdcResult<Window> {
        let visit = schedule.visit(visit_code)?;
        let previous = schedule.previous_visit(visit_code);
        let (lower, upper) = self.bounds_for_scheduled(visit, baseline, previous);
        Ok(Window {
            visit_code: visit.code.clone(),
            sequence: 0,
            timepoint_datetime: visit.timepoint_datetime(baseline),
            lower,
            upper,
            candidate: None,
        })
    }

    /// Scheduled windows of every visit, in timepoint order.
    pub fn schedule_windows(
        &self,
        schedule: &ScheduleDefinition,
        baseline: DateTime<Utc>,
    ) -> Vec<Window> {
        let mut previous: Option<&VisitSpec> = None;
        let mut windows = Vec::with_capacity(schedule.len());
        for visit in schedule.timepoints_ordered() {
            let (lower, upper) = self.bounds_for_scheduled(visit, baseline, previous);
            windows.push(Window {
                visit_code: visit.code.clone(),
                sequence: 0,
                timepoint_datetime: visit.timepoint_datetime(baseline),
                lower,
                upper,
                candidate: None,
            });
            previous = Some(visit);
        }
        windows
    }

    /// Check that `candidate` lies in `[lower, upper]`.
    ///
    /// # Errors
    ///
    /// Returns [`EdcError::ScheduledVisitWindowError`] naming the bounds and the candidate.
    pub fn validate_in_window(
        &self,
        visit_code: &str,
        candidate: DateTime<Utc>,
        lower: DateTime<Utc>,
        upper: DateTime<Utc>,
    ) -> EdcResult<bool> {
        if !self.enforce_window_period {
            return Ok(true);
        }
        if lower <= candidate && candidate <= upper {
            return Ok(true);
        }

        tracing::warn!(
            "visit {}: {} is outside [{}, {}]",
            visit_code,
            fmt_dt(&candidate),
            fmt_dt(&lower),
            fmt_dt(&upper)
        );
        Err(EdcError::ScheduledVisitWindowError {
            visit_code: visit_code.to_string(),
            lower,
            upper,
            candidate,
        })
    }

    /// Check a candidate datetime for an unscheduled occurrence of `current`.
    ///
    /// With a `next` visit the candidate must fall strictly before the next visit's lower bound.
    /// Otherwise it must fall strictly before `timepoint_datetime + upper_window_extended` (or
    /// `upper_window` when no extended window is set).
    ///
    /// # Errors
    ///
    /// Returns [`EdcError::UnscheduledVisitWindowError`] with a message fit for display.
    pub fn bounds_for_unscheduled(
        &self,
        candidate: DateTime<Utc>,
        current: &VisitSpec,
        next: Option<&VisitSpec>,
        baseline: DateTime<Utc>,
    ) -> EdcResult<bool> {
        if !self.enforce_window_period {
            return Ok(true);
        }

        let message = match next {
            Some(next) => {
                let (next_lower, _) = self.bounds_for_scheduled(next, baseline, Some(current));
                if candidate < next_lower {
                    return Ok(true);
                }
                format!(
                    "Invalid datetime for unscheduled visit {}. Expected a datetime before the \
                     window of visit {} opens on {}. Got {}.",
                    current.code,
                    next.code,
                    fmt_dt(&next_lower),
                    fmt_dt(&candidate)
                )
            }
            None => {
                let upper = current
                    .upper_window_extended
                    .unwrap_or(current.upper_window);
                let upper_bound = upper.after(current.timepoint_datetime(baseline));
                if candidate < upper_bound {
                    return Ok(true);
                }
                format!(
                    "Invalid datetime for unscheduled visit {}. Expected a datetime before {}. \
                     Got {}. This is the last visit of the schedule.",
                    current.code,
                    fmt_dt(&upper_bound),
                    fmt_dt(&candidate)
                )
            }
        };

        tracing::warn!("{}", message);
        Err(EdcError::UnscheduledVisitWindowError {
            visit_code: current.code.to_string(),
            candidate,
            message,
        })
    }
}

fn start_of_day(datetime: DateTime<Utc>) -> DateTime<Utc> {
    datetime.date_naive().and_time(NaiveTime::MIN).and_utc()
}

fn end_of_day(datetime: DateTime<Utc>) -> DateTime<Utc> {
    datetime
        .date_naive()
        .and_hms_micro_opt(23, 59, 59, 999_999)
        .map(|end| end.and_utc())
        .unwrap_or(datetime)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interval::Interval;
    use chrono::{Duration, TimeZone};

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    fn visit(code: &str, timepoint: u32, offset: i64, lower: i64, upper: i64) -> VisitSpec {
        VisitSpec::new(
            code,
            timepoint,
            Interval::of_days(offset),
            Interval::of_days(lower),
            Interval::of_days(upper),
        )
        .unwrap()
    }

    #[test]
    fn test_scheduled_window_scenario() {
        let calc = WindowCalculator::default();
        let spec = visit("2000", 1, 28, 7, 7);
        let (lower, upper) = calc.bounds_for_scheduled(&spec, at(2025, 1, 1), None);

        assert_eq!(lower, at(2025, 1, 22));
        assert_eq!(upper.date_naive(), at(2025, 2, 5).date_naive());
        assert!(calc.validate_in_window("2000", at(2025, 2, 5) + Duration::hours(17), lower, upper).unwrap());

        let err = calc
            .validate_in_window("2000", at(2025, 2, 10), lower, upper)
            .expect_err("outside window");
        assert!(matches!(err, EdcError::ScheduledVisitWindowError { .. }));
        let message = err.to_string();
        assert!(message.contains("2025-01-22 00:00 UTC"));
        assert!(message.contains("2025-02-05 23:59 UTC"));
        assert!(message.contains("2025-02-10 00:00 UTC"));
        assert!(message.contains("See visit 2000"));
    }

    #[test]
    fn test_validate_in_window_is_idempotent() {
        let calc = WindowCalculator::default();
        let (lower, upper) = calc.bounds_for_scheduled(&visit("2000", 1, 28, 7, 7), at(2025, 1, 1), None);

        let first = calc.validate_in_window("2000", at(2025, 2, 10), lower, upper).expect_err("first");
        let second = calc.validate_in_window("2000", at(2025, 2, 10), lower, upper).expect_err("second");
        assert_eq!(first.to_string(), second.to_string());
        assert!(matches!(second, EdcError::ScheduledVisitWindowError { .. }));
    }

    #[test]
    fn test_bounds_contain_timepoint_datetime() {
        let calc = WindowCalculator::default();
        let baseline = Utc.with_ymd_and_hms(2025, 3, 14, 10, 30, 0).unwrap();
        for spec in [
            visit("1000", 0, 0, 0, 0),
            visit("2000", 1, 28, 7, 7),
            visit("3000", 2, 90, 0, 14),
            VisitSpec::new(
                "4000",
                3,
                Interval::of_months(6),
                Interval::of_hours(12),
                Interval::of_years(1),
            )
            .unwrap(),
        ] {
            let (lower, upper) = calc.bounds_for_scheduled(&spec, baseline, None);
            let timepoint = spec.timepoint_datetime(baseline);
            assert!(lower <= upper);
            assert!(lower <= timepoint && timepoint <= upper, "visit {}", spec.code);
        }
    }

    #[test]
    fn test_window_gap_to_lower_closes_gap() {
        let calc = WindowCalculator::default();
        let baseline = at(2025, 1, 1);
        let first = visit("1000", 0, 0, 0, 3);
        let second = visit("2000", 1, 28, 7, 7).with_window_gap_to_lower();

        let (lower, _) = calc.bounds_for_scheduled(&second, baseline, Some(&first));
        // previous window closes 2025-01-04
        assert_eq!(lower, at(2025, 1, 5));

        let (ungapped, _) = calc.bounds_for_scheduled(&second, baseline, None);
        assert_eq!(ungapped, at(2025, 1, 22));
    }

    #[test]
    fn test_window_gap_ignored_when_windows_overlap() {
        let calc = WindowCalculator::default();
        let baseline = at(2025, 1, 1);
        let first = visit("1000", 0, 0, 0, 30);
        let second = visit("2000", 1, 28, 7, 7).with_window_gap_to_lower();

        let (lower, _) = calc.bounds_for_scheduled(&second, baseline, Some(&first));
        assert_eq!(lower, at(2025, 1, 22));
    }

    #[test]
    fn test_unscheduled_last_visit_boundary_is_exclusive() {
        let calc = WindowCalculator::default();
        let baseline = at(2025, 1, 1);
        let last = visit("3000", 2, 56, 7, 7);
        let boundary = last.timepoint_datetime(baseline) + Duration::days(7);

        assert!(calc
            .bounds_for_unscheduled(boundary - Duration::minutes(1), &last, None, baseline)
            .unwrap());

        let err = calc
            .bounds_for_unscheduled(boundary, &last, None, baseline)
            .expect_err("boundary is exclusive");
        match err {
            EdcError::UnscheduledVisitWindowError { message, visit_code, .. } => {
                assert_eq!(visit_code, "3000");
                assert!(message.contains("Expected a datetime before"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unscheduled_uses_extended_upper_window() {
        let calc = WindowCalculator::default();
        let baseline = at(2025, 1, 1);
        let last = visit("3000", 2, 56, 7, 7).with_upper_window_extended(Interval::of_days(30));
        let candidate = last.timepoint_datetime(baseline) + Duration::days(20);

        assert!(calc.bounds_for_unscheduled(candidate, &last, None, baseline).unwrap());
    }

    #[test]
    fn test_unscheduled_must_precede_next_lower_bound() {
        let calc = WindowCalculator::default();
        let baseline = at(2025, 1, 1);
        let current = visit("1000", 0, 0, 0, 0);
        let next = visit("2000", 1, 28, 7, 7);

        assert!(calc
            .bounds_for_unscheduled(at(2025, 1, 21) + Duration::hours(23), &current, Some(&next), baseline)
            .unwrap());
        let err = calc
            .bounds_for_unscheduled(at(2025, 1, 22), &current, Some(&next), baseline)
            .expect_err("inside next window");
        assert!(err.to_string().contains("window of visit 2000"));
    }

    #[test]
    fn test_disabled_enforcement_always_passes() {
        let calc = WindowCalculator::unenforced();
        let baseline = at(2025, 1, 1);
        let spec = visit("2000", 1, 28, 7, 7);
        let (lower, upper) = calc.bounds_for_scheduled(&spec, baseline, None);

        assert!(calc.validate_in_window("2000", at(2030, 1, 1), lower, upper).unwrap());
        assert!(calc.bounds_for_unscheduled(at(2030, 1, 1), &spec, None, baseline).unwrap());
    }

    #[test]
    fn test_schedule_windows_in_order() {
        let calc = WindowCalculator::default();
        let mut schedule = ScheduleDefinition::new("schedule1", "1", "a.on", "a.off").unwrap();
        schedule.register(visit("2000", 1, 28, 7, 7)).unwrap();
        schedule.register(visit("1000", 0, 0, 0, 0)).unwrap();

        let windows = calc.schedule_windows(&schedule, at(2025, 1, 1));
        let codes: Vec<&str> = windows.iter().map(|w| w.visit_code.as_str()).collect();
        assert_eq!(codes, vec!["1000", "2000"]);
        assert!(windows[1].contains(at(2025, 1, 29)));

        let window = calc.window_for(&schedule, "2000", at(2025, 1, 1)).unwrap();
        assert_eq!(window, windows[1]);
    }

    #[test]
    fn test_bounds_saturate_at_the_end_of_time() {
        let calc = WindowCalculator::default();
        let spec = visit("2000", 1, 28, 7, 7);
        let last = DateTime::<Utc>::MAX_UTC - Duration::days(2);

        let (lower, upper) = calc.bounds_for_scheduled(&spec, last, None);
        assert!(lower <= upper);
        assert_eq!(upper.date_naive(), DateTime::<Utc>::MAX_UTC.date_naive());
    }
}
