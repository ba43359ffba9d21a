//! Persistence collaborators.
//!
//! The kernel owns no storage. Implementations must enforce these guarantees at this boundary:
//! `(subject_identifier, visit_code, visit_code_sequence)` is unique across appointments,
//! [`AppointmentStore::mark_in_progress`] checks for another `IN_PROGRESS` appointment and writes
//! the new status as one atomic step, and [`AppointmentStore::delete_unreported`] checks for
//! visit reports and deletes under the same guard. [`crate::memory::InMemoryStore`] implements every trait here.

use crate::appointment::{Appointment, VisitKey};
use crate::consent::{
    ConsentDefinition, ConsentExtensionRecord, ConsentRecord, RegisteredSubject,
};
use crate::metadata::{CrfMetadata, Fields};
use crate::{EdcError, EdcResult};
use chrono::{DateTime, NaiveDate, Utc};
use edc_types::SubjectIdentifier;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub trait AppointmentStore: Send + Sync {
    /// # Errors
    ///
    /// Returns [`EdcError::DuplicateAppointment`] if the visit key is taken.
    fn insert_appointment(&self, appointment: Appointment) -> EdcResult<Appointment>;

    fn get_appointment(&self, id: Uuid) -> EdcResult<Appointment>;

    fn find_appointment(&self, key: &VisitKey) -> EdcResult<Option<Appointment>>;

    /// A subject's appointments on a schedule, ordered by timepoint then sequence.
    fn appointments_for(&self, subject: &str, schedule: &str) -> EdcResult<Vec<Appointment>>;

    fn update_appointment(&self, appointment: &Appointment) -> EdcResult<()>;

    fn delete_appointment(&self, id: Uuid) -> EdcResult<()>;

    /// Delete the appointments and their CRF metadata as one atomic step, unless any of them has
    /// a visit report.
    ///
    /// # Errors
    ///
    /// Returns [`EdcError::RetractionBlocked`] naming the first appointment with a visit report.
    /// Nothing is deleted in that case.
    fn delete_unreported(&self, ids: &[Uuid]) -> EdcResult<()>;

    /// The subject's `IN_PROGRESS` appointment, if any.
    fn in_progress_for(&self, subject: &str) -> EdcResult<Option<Appointment>>;

    /// Atomically set the appointment `IN_PROGRESS`.
    ///
    /// # Errors
    ///
    /// Returns [`EdcError::ConcurrentAppointmentError`] naming the other appointment if the
    /// subject already has one in progress.
    fn mark_in_progress(&self, id: Uuid, now: DateTime<Utc>) -> EdcResult<Appointment>;

    /// Appointments booked at a facility on a date, excluding cancelled ones.
    fn count_for_facility_on(&self, facility: &str, date: NaiveDate) -> EdcResult<usize>;
}

pub trait MetadataStore: Send + Sync {
    fn get_metadata(&self, key: &VisitKey, crf: &str) -> EdcResult<Option<CrfMetadata>>;

    fn upsert_metadata(&self, entry: CrfMetadata) -> EdcResult<()>;

    fn metadata_for_visit(&self, key: &VisitKey) -> EdcResult<Vec<CrfMetadata>>;

    fn delete_metadata_for_visit(&self, key: &VisitKey) -> EdcResult<()>;
}

/// The report recorded when a subject attends an appointment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VisitReport {
    pub appointment_id: Uuid,
    pub report_datetime: DateTime<Utc>,
    pub fields: Fields,
}

/// Captured data of one CRF at one appointment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CrfRecord {
    pub appointment_id: Uuid,
    pub model: String,
    pub report_datetime: DateTime<Utc>,
    pub fields: Fields,
}

pub trait VisitReportStore: Send + Sync {
    /// Insert or replace the report of an appointment.
    fn save_visit_report(&self, report: VisitReport) -> EdcResult<()>;

    fn visit_report(&self, appointment_id: Uuid) -> EdcResult<Option<VisitReport>>;

    fn delete_visit_report(&self, appointment_id: Uuid) -> EdcResult<()>;

    /// Insert or replace the record of `record.model` at its appointment.
    fn save_crf_record(&self, record: CrfRecord) -> EdcResult<()>;

    fn crf_record(&self, appointment_id: Uuid, model: &str) -> EdcResult<Option<CrfRecord>>;

    fn has_visit_report(&self, appointment_id: Uuid) -> EdcResult<bool> {
        Ok(self.visit_report(appointment_id)?.is_some())
    }
}

pub trait ConsentStore: Send + Sync {
    fn save_consent(&self, consent: ConsentRecord) -> EdcResult<()>;

    fn consents_for(&self, subject: &str) -> EdcResult<Vec<ConsentRecord>>;

    fn save_extension_record(&self, record: ConsentExtensionRecord) -> EdcResult<()>;

    /// The extension record with the latest `report_datetime`.
    fn latest_extension_record(
        &self,
        subject: &str,
        extension: &str,
    ) -> EdcResult<Option<ConsentExtensionRecord>>;

    fn save_registered_subject(&self, subject: RegisteredSubject) -> EdcResult<()>;

    /// # Errors
    ///
    /// Returns [`EdcError::SubjectNotFound`] if the subject was never registered.
    fn registered_subject(&self, subject: &str) -> EdcResult<RegisteredSubject>;

    /// The subject's consent valid at `report_datetime`.
    ///
    /// Exactly one of `definitions` must cover the datetime, and the subject must have signed
    /// that definition on or before it.
    ///
    /// # Errors
    ///
    /// Returns [`EdcError::ConsentDefinitionError`] if the definitions do not resolve to exactly
    /// one, or [`EdcError::ConsentDoesNotExist`] if the subject has not signed it.
    fn consent_for(
        &self,
        subject: &str,
        definitions: &[&ConsentDefinition],
        report_datetime: DateTime<Utc>,
    ) -> EdcResult<ConsentRecord> {
        let cdef = ConsentDefinition::resolve(definitions, report_datetime)?;
        let id = cdef.id();
        self.consents_for(subject)?
            .into_iter()
            .filter(|c| c.consent_definition == id && c.consent_datetime <= report_datetime)
            .max_by_key(|c| c.consent_datetime)
            .ok_or_else(|| {
                EdcError::ConsentDoesNotExist(format!(
                    "subject {subject} has no consent '{id}' on or before {report_datetime}"
                ))
            })
    }
}

/// A subject's time on a schedule.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnScheduleRecord {
    pub subject_identifier: SubjectIdentifier,
    pub schedule_name: String,
    pub onschedule_datetime: DateTime<Utc>,
    pub offschedule_datetime: Option<DateTime<Utc>>,
}

pub trait ScheduleHistoryStore: Send + Sync {
    /// # Errors
    ///
    /// Returns [`EdcError::AlreadyOnScheduleError`] if a record for the subject and schedule
    /// exists. The existence check and insert are one atomic step.
    fn put_on_schedule(&self, record: OnScheduleRecord) -> EdcResult<()>;

    fn on_schedule(&self, subject: &str, schedule: &str) -> EdcResult<Option<OnScheduleRecord>>;

    /// Record the off-schedule datetime.
    ///
    /// # Errors
    ///
    /// Returns [`EdcError::NotOnSchedule`] if the subject was never put on the schedule or is
    /// already off it.
    fn take_off_schedule(
        &self,
        subject: &str,
        schedule: &str,
        offschedule_datetime: DateTime<Utc>,
    ) -> EdcResult<OnScheduleRecord>;
}
