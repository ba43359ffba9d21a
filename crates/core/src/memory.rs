//! In-memory implementation of every persistence collaborator.
//!
//! All state sits behind one mutex, so each trait call is atomic. Used by the CLI simulator and
//! by tests.

use crate::appointment::{Appointment, AppointmentStatus, VisitKey};
use crate::consent::{ConsentExtensionRecord, ConsentRecord, RegisteredSubject};
use crate::metadata::CrfMetadata;
use crate::store::{
    AppointmentStore, ConsentStore, CrfRecord, MetadataStore, OnScheduleRecord,
    ScheduleHistoryStore, VisitReport, VisitReportStore,
};
use crate::{EdcError, EdcResult};
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Debug, Default)]
struct State {
    appointments: HashMap<Uuid, Appointment>,
    visit_keys: BTreeMap<VisitKey, Uuid>,
    metadata: BTreeMap<(VisitKey, String), CrfMetadata>,
    visit_reports: HashMap<Uuid, VisitReport>,
    crf_records: HashMap<(Uuid, String), CrfRecord>,
    consents: Vec<ConsentRecord>,
    extension_records: Vec<ConsentExtensionRecord>,
    subjects: BTreeMap<String, RegisteredSubject>,
    on_schedule: BTreeMap<(String, String), OnScheduleRecord>,
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> EdcResult<MutexGuard<'_, State>> {
        self.state.lock().map_err(|_| EdcError::LockPoisoned)
    }
}

fn not_found(id: Uuid) -> EdcError {
    EdcError::AppointmentNotFound(id.to_string())
}

impl AppointmentStore for InMemoryStore {
    fn insert_appointment(&self, appointment: Appointment) -> EdcResult<Appointment> {
        let mut state = self.lock()?;
        if state.visit_keys.contains_key(&appointment.key) {
            return Err(EdcError::DuplicateAppointment {
                subject_identifier: appointment.subject_identifier().to_string(),
                visit_code: appointment.visit_code().to_string(),
                visit_code_sequence: appointment.visit_code_sequence(),
            });
        }
        state
            .visit_keys
            .insert(appointment.key.clone(), appointment.id);
        state
            .appointments
            .insert(appointment.id, appointment.clone());
        Ok(appointment)
    }

    fn get_appointment(&self, id: Uuid) -> EdcResult<Appointment> {
        self.lock()?
            .appointments
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found(id))
    }

    fn find_appointment(&self, key: &VisitKey) -> EdcResult<Option<Appointment>> {
        let state = self.lock()?;
        Ok(state
            .visit_keys
            .get(key)
            .and_then(|id| state.appointments.get(id))
            .cloned())
    }

    fn appointments_for(&self, subject: &str, schedule: &str) -> EdcResult<Vec<Appointment>> {
        let state = self.lock()?;
        let mut found: Vec<Appointment> = state
            .appointments
            .values()
            .filter(|a| a.subject_identifier() == subject && a.schedule_name == schedule)
            .cloned()
            .collect();
        found.sort_by_key(|a| (a.timepoint(), a.visit_code_sequence()));
        Ok(found)
    }

    fn update_appointment(&self, appointment: &Appointment) -> EdcResult<()> {
        let mut state = self.lock()?;
        let Some(existing) = state.appointments.get(&appointment.id) else {
            return Err(not_found(appointment.id));
        };
        if existing.key != appointment.key {
            return Err(EdcError::InvalidInput(format!(
                "appointment {} cannot change its visit key",
                appointment.id
            )));
        }
        if appointment.appt_status == AppointmentStatus::InProgress
            && existing.appt_status != AppointmentStatus::InProgress
        {
            return Err(EdcError::InvalidInput(
                "use mark_in_progress to start an appointment".into(),
            ));
        }
        state
            .appointments
            .insert(appointment.id, appointment.clone());
        Ok(())
    }

    fn delete_appointment(&self, id: Uuid) -> EdcResult<()> {
        let mut state = self.lock()?;
        let appointment = state.appointments.remove(&id).ok_or_else(|| not_found(id))?;
        state.visit_keys.remove(&appointment.key);
        Ok(())
    }

    fn delete_unreported(&self, ids: &[Uuid]) -> EdcResult<()> {
        let mut state = self.lock()?;
        for id in ids {
            let appointment = state.appointments.get(id).ok_or_else(|| not_found(*id))?;
            if state.visit_reports.contains_key(id) {
                return Err(EdcError::RetractionBlocked {
                    subject_identifier: appointment.subject_identifier().to_string(),
                    visit_code: appointment.visit_code().to_string(),
                    visit_code_sequence: appointment.visit_code_sequence(),
                });
            }
        }
        for id in ids {
            if let Some(appointment) = state.appointments.remove(id) {
                state.visit_keys.remove(&appointment.key);
                state.metadata.retain(|(k, _), _| *k != appointment.key);
            }
        }
        Ok(())
    }

    fn in_progress_for(&self, subject: &str) -> EdcResult<Option<Appointment>> {
        Ok(self
            .lock()?
            .appointments
            .values()
            .find(|a| {
                a.subject_identifier() == subject && a.appt_status == AppointmentStatus::InProgress
            })
            .cloned())
    }

    fn mark_in_progress(&self, id: Uuid, now: DateTime<Utc>) -> EdcResult<Appointment> {
        let mut state = self.lock()?;
        let mut appointment = state.appointments.get(&id).cloned().ok_or_else(|| not_found(id))?;

        if let Some(other) = state.appointments.values().find(|a| {
            a.id != id
                && a.key.subject_identifier == appointment.key.subject_identifier
                && a.appt_status == AppointmentStatus::InProgress
        }) {
            return Err(EdcError::ConcurrentAppointmentError {
                subject_identifier: other.subject_identifier().to_string(),
                appointment_id: other.id,
                visit_code: other.visit_code().to_string(),
                visit_code_sequence: other.visit_code_sequence(),
            });
        }

        appointment.transition_to(AppointmentStatus::InProgress, now)?;
        state.appointments.insert(id, appointment.clone());
        Ok(appointment)
    }

    fn count_for_facility_on(&self, facility: &str, date: NaiveDate) -> EdcResult<usize> {
        Ok(self
            .lock()?
            .appointments
            .values()
            .filter(|a| {
                a.facility_name == facility
                    && a.appt_status != AppointmentStatus::Cancelled
                    && a.appt_datetime().date_naive() == date
            })
            .count())
    }
}

impl MetadataStore for InMemoryStore {
    fn get_metadata(&self, key: &VisitKey, crf: &str) -> EdcResult<Option<CrfMetadata>> {
        Ok(self
            .lock()?
            .metadata
            .get(&(key.clone(), crf.to_string()))
            .cloned())
    }

    fn upsert_metadata(&self, entry: CrfMetadata) -> EdcResult<()> {
        self.lock()?
            .metadata
            .insert((entry.key.clone(), entry.crf.clone()), entry);
        Ok(())
    }

    fn metadata_for_visit(&self, key: &VisitKey) -> EdcResult<Vec<CrfMetadata>> {
        Ok(self
            .lock()?
            .metadata
            .iter()
            .filter(|((k, _), _)| k == key)
            .map(|(_, entry)| entry.clone())
            .collect())
    }

    fn delete_metadata_for_visit(&self, key: &VisitKey) -> EdcResult<()> {
        self.lock()?.metadata.retain(|(k, _), _| k != key);
        Ok(())
    }
}

impl VisitReportStore for InMemoryStore {
    fn save_visit_report(&self, report: VisitReport) -> EdcResult<()> {
        self.lock()?
            .visit_reports
            .insert(report.appointment_id, report);
        Ok(())
    }

    fn visit_report(&self, appointment_id: Uuid) -> EdcResult<Option<VisitReport>> {
        Ok(self.lock()?.visit_reports.get(&appointment_id).cloned())
    }

    fn delete_visit_report(&self, appointment_id: Uuid) -> EdcResult<()> {
        self.lock()?.visit_reports.remove(&appointment_id);
        Ok(())
    }

    fn save_crf_record(&self, record: CrfRecord) -> EdcResult<()> {
        self.lock()?
            .crf_records
            .insert((record.appointment_id, record.model.clone()), record);
        Ok(())
    }

    fn crf_record(&self, appointment_id: Uuid, model: &str) -> EdcResult<Option<CrfRecord>> {
        Ok(self
            .lock()?
            .crf_records
            .get(&(appointment_id, model.to_string()))
            .cloned())
    }
}

impl ConsentStore for InMemoryStore {
    fn save_consent(&self, consent: ConsentRecord) -> EdcResult<()> {
        self.lock()?.consents.push(consent);
        Ok(())
    }

    fn consents_for(&self, subject: &str) -> EdcResult<Vec<ConsentRecord>> {
        Ok(self
            .lock()?
            .consents
            .iter()
            .filter(|c| c.subject_identifier.as_str() == subject)
            .cloned()
            .collect())
    }

    fn save_extension_record(&self, record: ConsentExtensionRecord) -> EdcResult<()> {
        self.lock()?.extension_records.push(record);
        Ok(())
    }

    fn latest_extension_record(
        &self,
        subject: &str,
        extension: &str,
    ) -> EdcResult<Option<ConsentExtensionRecord>> {
        // Later saves win ties on report_datetime.
        Ok(self
            .lock()?
            .extension_records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.subject_identifier.as_str() == subject && r.extension == extension)
            .max_by_key(|(i, r)| (r.report_datetime, *i))
            .map(|(_, r)| r.clone()))
    }

    fn save_registered_subject(&self, subject: RegisteredSubject) -> EdcResult<()> {
        self.lock()?
            .subjects
            .insert(subject.subject_identifier.to_string(), subject);
        Ok(())
    }

    fn registered_subject(&self, subject: &str) -> EdcResult<RegisteredSubject> {
        self.lock()?
            .subjects
            .get(subject)
            .cloned()
            .ok_or_else(|| EdcError::SubjectNotFound(subject.to_string()))
    }
}

impl ScheduleHistoryStore for InMemoryStore {
    fn put_on_schedule(&self, record: OnScheduleRecord) -> EdcResult<()> {
        let mut state = self.lock()?;
        let key = (
            record.subject_identifier.to_string(),
            record.schedule_name.clone(),
        );
        if state.on_schedule.contains_key(&key) {
            return Err(EdcError::AlreadyOnScheduleError {
                subject_identifier: key.0,
                schedule: key.1,
            });
        }
        state.on_schedule.insert(key, record);
        Ok(())
    }

    fn on_schedule(&self, subject: &str, schedule: &str) -> EdcResult<Option<OnScheduleRecord>> {
        Ok(self
            .lock()?
            .on_schedule
            .get(&(subject.to_string(), schedule.to_string()))
            .cloned())
    }

    fn take_off_schedule(
        &self,
        subject: &str,
        schedule: &str,
        offschedule_datetime: DateTime<Utc>,
    ) -> EdcResult<OnScheduleRecord> {
        let mut state = self.lock()?;
        let not_on_schedule = || EdcError::NotOnSchedule {
            subject_identifier: subject.to_string(),
            schedule: schedule.to_string(),
        };
        let record = state
            .on_schedule
            .get_mut(&(subject.to_string(), schedule.to_string()))
            .ok_or_else(not_on_schedule)?;
        if record.offschedule_datetime.is_some() {
            return Err(not_on_schedule());
        }
        record.offschedule_datetime = Some(offschedule_datetime);
        Ok(record.clone())
    }
}
