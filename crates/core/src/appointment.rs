//! Appointment records and their status machine.
//!
//! An [`Appointment`] is composed from small field groups rather than one flat record:
//! [`VisitKey`] identifies the visit occurrence, [`AppointmentTiming`] places it in time and
//! [`Timestamps`] tracks record changes.

use crate::{EdcError, EdcResult};
use chrono::{DateTime, Utc};
use edc_types::{SubjectIdentifier, VisitCode};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AppointmentStatus {
    New,
    InProgress,
    Incomplete,
    Complete,
    Cancelled,
}

impl AppointmentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AppointmentStatus::New => "NEW",
            AppointmentStatus::InProgress => "IN_PROGRESS",
            AppointmentStatus::Incomplete => "INCOMPLETE",
            AppointmentStatus::Complete => "COMPLETE",
            AppointmentStatus::Cancelled => "CANCELLED",
        }
    }

    /// Statuses reachable from `self`.
    ///
    /// `INCOMPLETE` and `COMPLETE` may be re-entered: capturing a report or keying a CRF again
    /// recomputes the status.
    pub fn valid_transitions(self) -> &'static [AppointmentStatus] {
        use AppointmentStatus::*;
        match self {
            New => &[InProgress, Incomplete, Complete, Cancelled],
            InProgress => &[Incomplete, Complete, Cancelled],
            Incomplete => &[InProgress, Incomplete, Complete],
            Complete => &[Incomplete, Complete],
            Cancelled => &[],
        }
    }

    pub fn can_transition_to(self, next: AppointmentStatus) -> bool {
        self.valid_transitions().contains(&next)
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentReason {
    Scheduled,
    Unscheduled,
}

/// Identifies one occurrence of a visit for a subject. Unique per subject.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VisitKey {
    pub subject_identifier: SubjectIdentifier,
    pub visit_code: VisitCode,
    /// 0 for the scheduled occurrence.
    pub visit_code_sequence: u32,
}

impl VisitKey {
    pub fn new(
        subject_identifier: SubjectIdentifier,
        visit_code: VisitCode,
        visit_code_sequence: u32,
    ) -> Self {
        Self {
            subject_identifier,
            visit_code,
            visit_code_sequence,
        }
    }
}

impl fmt::Display for VisitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}.{}",
            self.subject_identifier, self.visit_code, self.visit_code_sequence
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppointmentTiming {
    /// Inherited from the visit.
    pub timepoint: u32,
    /// Ideal datetime: `baseline + relative_offset`.
    pub timepoint_datetime: DateTime<Utc>,
    pub appt_datetime: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamps {
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

impl Timestamps {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            created: now,
            modified: now,
        }
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.modified = now;
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Uuid,
    pub key: VisitKey,
    pub timing: AppointmentTiming,
    pub schedule_name: String,
    pub facility_name: String,
    pub appt_status: AppointmentStatus,
    pub appt_reason: AppointmentReason,
    pub timestamps: Timestamps,
}

impl Appointment {
    /// A new appointment in status `NEW`.
    pub fn new(
        key: VisitKey,
        timing: AppointmentTiming,
        schedule_name: impl Into<String>,
        facility_name: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let appt_reason = if key.visit_code_sequence == 0 {
            AppointmentReason::Scheduled
        } else {
            AppointmentReason::Unscheduled
        };
        Self {
            id: Uuid::new_v4(),
            key,
            timing,
            schedule_name: schedule_name.into(),
            facility_name: facility_name.into(),
            appt_status: AppointmentStatus::New,
            appt_reason,
            timestamps: Timestamps::at(now),
        }
    }

    pub fn subject_identifier(&self) -> &str {
        self.key.subject_identifier.as_str()
    }

    pub fn visit_code(&self) -> &str {
        self.key.visit_code.as_str()
    }

    pub fn visit_code_sequence(&self) -> u32 {
        self.key.visit_code_sequence
    }

    pub fn timepoint(&self) -> u32 {
        self.timing.timepoint
    }

    pub fn appt_datetime(&self) -> DateTime<Utc> {
        self.timing.appt_datetime
    }

    /// Move to `next`, checking the status machine.
    ///
    /// # Errors
    ///
    /// Returns [`EdcError::InvalidAppointmentTransition`] if `next` is not reachable.
    pub fn transition_to(&mut self, next: AppointmentStatus, now: DateTime<Utc>) -> EdcResult<()> {
        if !self.appt_status.can_transition_to(next) {
            tracing::warn!(
                "invalid status transition for {}: {} -> {}",
                self.key,
                self.appt_status,
                next
            );
            return Err(EdcError::InvalidAppointmentTransition {
                from: self.appt_status.to_string(),
                to: next.to_string(),
            });
        }
        if self.appt_status != next {
            tracing::info!("appointment {} {} -> {}", self.key, self.appt_status, next);
        }
        self.appt_status = next;
        self.timestamps.touch(now);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn new_for_test(
        subject_identifier: &str,
        visit_code: &str,
        visit_code_sequence: u32,
        appt_datetime: DateTime<Utc>,
        facility_name: &str,
    ) -> Self {
        let key = VisitKey::new(
            SubjectIdentifier::new(subject_identifier).expect("valid subject identifier"),
            VisitCode::new(visit_code).expect("valid visit code"),
            visit_code_sequence,
        );
        let timing = AppointmentTiming {
            timepoint: 0,
            timepoint_datetime: appt_datetime,
            appt_datetime,
        };
        Self::new(key, timing, "schedule1", facility_name, appt_datetime)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn appointment() -> Appointment {
        Appointment::new_for_test(
            "101-1",
            "1000",
            0,
            Utc.with_ymd_and_hms(2025, 1, 6, 9, 0, 0).unwrap(),
            "clinic",
        )
    }

    #[test]
    fn test_new_appointment_starts_new_and_scheduled() {
        let appt = appointment();
        assert_eq!(appt.appt_status, AppointmentStatus::New);
        assert_eq!(appt.appt_reason, AppointmentReason::Scheduled);
        assert_eq!(appt.key.to_string(), "101-1 1000.0");
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut appt = appointment();
        let now = appt.timestamps.created;
        appt.transition_to(AppointmentStatus::InProgress, now).unwrap();
        appt.transition_to(AppointmentStatus::Incomplete, now).unwrap();
        appt.transition_to(AppointmentStatus::Complete, now).unwrap();
        assert_eq!(appt.appt_status, AppointmentStatus::Complete);
    }

    #[test]
    fn test_cancelled_is_terminal() {
        let mut appt = appointment();
        let now = appt.timestamps.created;
        appt.transition_to(AppointmentStatus::Cancelled, now).unwrap();

        let err = appt
            .transition_to(AppointmentStatus::InProgress, now)
            .expect_err("cancelled is terminal");
        assert!(matches!(
            err,
            EdcError::InvalidAppointmentTransition { from, to } if from == "CANCELLED" && to == "IN_PROGRESS"
        ));
    }

    #[test]
    fn test_complete_cannot_be_cancelled_or_restarted() {
        assert!(!AppointmentStatus::Complete.can_transition_to(AppointmentStatus::Cancelled));
        assert!(!AppointmentStatus::Complete.can_transition_to(AppointmentStatus::InProgress));
        assert!(!AppointmentStatus::InProgress.can_transition_to(AppointmentStatus::InProgress));
    }
}
