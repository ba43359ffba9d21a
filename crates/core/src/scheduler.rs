//! Appointment materialization and the appointment status machine.
//!
//! [`AppointmentScheduler`] creates appointments when a subject is enrolled, inserts
//! unscheduled occurrences on request and refreshes the appointment set when a consent extension
//! changes. It also drives each appointment through its statuses as visit reports and CRFs are
//! captured.
//!
//! Schedules are read through the subject's *effective* schedule: the registered schedule with
//! every registered consent extension applied according to the subject's latest extension record.

use crate::appointment::{Appointment, AppointmentStatus, AppointmentTiming, VisitKey};
use crate::clock::Clock;
use crate::config::EdcConfig;
use crate::consent::ConsentExtension;
use crate::error::fmt_dt;
use crate::facility::CalendarFacility;
use crate::memory::InMemoryStore;
use crate::metadata::{CrfMetadata, Fields, MetadataRuleEngine, RuleGroupRegistry};
use crate::schedule::{ScheduleDefinition, ScheduleRegistry, VisitSpec};
use crate::store::{
    AppointmentStore, ConsentStore, CrfRecord, MetadataStore, OnScheduleRecord,
    ScheduleHistoryStore, VisitReport, VisitReportStore,
};
use crate::window::WindowCalculator;
use crate::{EdcError, EdcResult};
use chrono::{DateTime, Utc};
use edc_types::{SubjectIdentifier, VisitCode};
use std::sync::Arc;
use uuid::Uuid;

/// The persistence collaborators a scheduler works against.
#[derive(Clone)]
pub struct Collaborators {
    pub appointments: Arc<dyn AppointmentStore>,
    pub metadata: Arc<dyn MetadataStore>,
    pub reports: Arc<dyn VisitReportStore>,
    pub consents: Arc<dyn ConsentStore>,
    pub history: Arc<dyn ScheduleHistoryStore>,
}

impl Collaborators {
    /// Every collaborator backed by the same in-memory store.
    pub fn in_memory(store: Arc<InMemoryStore>) -> Self {
        Self {
            appointments: store.clone(),
            metadata: store.clone(),
            reports: store.clone(),
            consents: store.clone(),
            history: store,
        }
    }
}

/// Appointments added and removed by a consent-extension refresh.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefreshOutcome {
    pub created: Vec<Appointment>,
    pub retracted: Vec<Appointment>,
}

impl RefreshOutcome {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.retracted.is_empty()
    }
}

pub struct AppointmentScheduler {
    schedules: Arc<ScheduleRegistry>,
    calculator: WindowCalculator,
    engine: MetadataRuleEngine,
    stores: Collaborators,
    clock: Arc<dyn Clock>,
}

impl AppointmentScheduler {
    pub fn new(
        config: &EdcConfig,
        schedules: Arc<ScheduleRegistry>,
        rules: Arc<RuleGroupRegistry>,
        stores: Collaborators,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let engine = MetadataRuleEngine::new(
            rules,
            stores.metadata.clone(),
            stores.reports.clone(),
            clock.clone(),
        );
        Self {
            schedules,
            calculator: WindowCalculator::new(config),
            engine,
            stores,
            clock,
        }
    }

    pub fn calculator(&self) -> &WindowCalculator {
        &self.calculator
    }

    pub fn engine(&self) -> &MetadataRuleEngine {
        &self.engine
    }

    /// A subject's appointments on a schedule, in timepoint then sequence order.
    pub fn appointments(&self, subject: &str, schedule_name: &str) -> EdcResult<Vec<Appointment>> {
        self.stores.appointments.appointments_for(subject, schedule_name)
    }

    /// The schedule as it applies to `subject`, with registered consent extensions applied.
    pub fn effective_schedule(
        &self,
        subject: &str,
        schedule_name: &str,
    ) -> EdcResult<ScheduleDefinition> {
        let base = self.schedules.get(schedule_name)?;
        let mut effective = (*base).clone();
        for extension in self.schedules.extensions_for(schedule_name) {
            effective = if self.extension_active(subject, &extension)? {
                effective.extended_by(&extension)?
            } else {
                effective.without_extension(&extension)?
            };
        }
        Ok(effective)
    }

    // ------------------------------------------------------------------------
    // Materialization
    // ------------------------------------------------------------------------

    /// Put a subject on a schedule and create one appointment per visit.
    ///
    /// Each appointment is placed on the first open facility date from the visit's timepoint
    /// datetime up to its upper bound.
    ///
    /// # Errors
    ///
    /// - [`EdcError::ConsentDefinitionError`] / [`EdcError::ConsentDoesNotExist`] if the subject
    ///   holds no valid consent for the baseline datetime
    /// - [`EdcError::NoAvailableSlot`] if a visit has no open date in its window
    /// - [`EdcError::AlreadyOnScheduleError`] if the subject is already on the schedule
    pub fn enroll(
        &self,
        subject: &str,
        schedule_name: &str,
        facility: &CalendarFacility,
        baseline: DateTime<Utc>,
    ) -> EdcResult<Vec<Appointment>> {
        let subject_identifier = SubjectIdentifier::new(subject)?;
        let base = self.schedules.get(schedule_name)?;

        let definitions = self.schedules.consent_definitions_for(&base);
        if !definitions.is_empty() {
            self.stores
                .consents
                .consent_for(subject, &definitions, baseline)?;
        }

        let effective = self.effective_schedule(subject, schedule_name)?;
        let planned = self.plan(&subject_identifier, &effective, facility, baseline)?;

        self.stores.history.put_on_schedule(OnScheduleRecord {
            subject_identifier: subject_identifier.clone(),
            schedule_name: base.name().to_string(),
            onschedule_datetime: baseline,
            offschedule_datetime: None,
        })?;

        let created = self.insert_planned(base.name(), facility, planned)?;
        tracing::info!(
            "enrolled {} on {} with {} appointments",
            subject_identifier,
            base.name(),
            created.len()
        );
        Ok(created)
    }

    /// Insert an unscheduled occurrence of `visit_code` at `suggested_sequence`.
    ///
    /// `suggested_datetime` defaults to now and is moved forward to the nearest open facility
    /// date before it is checked.
    ///
    /// # Errors
    ///
    /// - [`EdcError::UnscheduledAppointmentNotAllowed`] if the visit does not allow unscheduled
    ///   occurrences or its scheduled appointment is not `INCOMPLETE` or `COMPLETE`
    /// - [`EdcError::DuplicateAppointment`] if the sequence is taken
    /// - [`EdcError::InvalidVisitCodeSequence`] if the previous sequence does not exist
    /// - [`EdcError::ConcurrentAppointmentError`] if another appointment is in progress
    /// - [`EdcError::UnscheduledVisitWindowError`] if the datetime is outside the allowed range
    pub fn insert_unscheduled(
        &self,
        subject: &str,
        schedule_name: &str,
        visit_code: &str,
        suggested_sequence: u32,
        suggested_datetime: Option<DateTime<Utc>>,
        facility: &CalendarFacility,
    ) -> EdcResult<Appointment> {
        let subject_identifier = SubjectIdentifier::new(subject)?;
        let code = VisitCode::new(visit_code)?;
        if suggested_sequence == 0 {
            return Err(EdcError::InvalidVisitCodeSequence(format!(
                "unscheduled appointments need a sequence above 0 (visit {code})"
            )));
        }

        let onschedule = self.onschedule_record(subject, schedule_name)?;
        let baseline = onschedule.onschedule_datetime;
        let schedule = self.effective_schedule(subject, schedule_name)?;
        let visit = schedule.visit(visit_code)?;
        if !visit.allow_unscheduled {
            return Err(EdcError::UnscheduledAppointmentNotAllowed(format!(
                "visit {code} does not allow unscheduled appointments"
            )));
        }

        let key = |sequence: u32| VisitKey::new(subject_identifier.clone(), code.clone(), sequence);
        let parent = self
            .stores
            .appointments
            .find_appointment(&key(0))?
            .ok_or_else(|| {
                EdcError::UnscheduledAppointmentNotAllowed(format!(
                    "subject {subject_identifier} has no scheduled appointment for visit {code}"
                ))
            })?;
        if !matches!(
            parent.appt_status,
            AppointmentStatus::Incomplete | AppointmentStatus::Complete
        ) {
            return Err(EdcError::UnscheduledAppointmentNotAllowed(format!(
                "appointment {} is {}; submit its visit report first",
                parent.key, parent.appt_status
            )));
        }

        if self
            .stores
            .appointments
            .find_appointment(&key(suggested_sequence))?
            .is_some()
        {
            return Err(EdcError::DuplicateAppointment {
                subject_identifier: subject_identifier.to_string(),
                visit_code: code.to_string(),
                visit_code_sequence: suggested_sequence,
            });
        }
        let previous = self
            .stores
            .appointments
            .find_appointment(&key(suggested_sequence - 1))?
            .ok_or_else(|| {
                EdcError::InvalidVisitCodeSequence(format!(
                    "expected sequence {} for visit {code}, got {suggested_sequence}",
                    self.next_free_sequence(&key(0)).unwrap_or(1)
                ))
            })?;

        if let Some(other) = self.stores.appointments.in_progress_for(subject)? {
            return Err(EdcError::ConcurrentAppointmentError {
                subject_identifier: other.subject_identifier().to_string(),
                appointment_id: other.id,
                visit_code: other.visit_code().to_string(),
                visit_code_sequence: other.visit_code_sequence(),
            });
        }

        let suggested = suggested_datetime.unwrap_or_else(|| self.clock.now());
        let appt_datetime = facility.nearest_open_date(suggested, None)?;
        if appt_datetime < previous.appt_datetime() {
            return Err(EdcError::UnscheduledVisitWindowError {
                visit_code: code.to_string(),
                candidate: appt_datetime,
                message: format!(
                    "Invalid datetime for unscheduled visit {}. Expected a datetime on or after \
                     {} (visit {}.{}). Got {}.",
                    code,
                    fmt_dt(&previous.appt_datetime()),
                    code,
                    previous.visit_code_sequence(),
                    fmt_dt(&appt_datetime)
                ),
            });
        }
        self.calculator.bounds_for_unscheduled(
            appt_datetime,
            visit,
            schedule.next_visit(visit_code),
            baseline,
        )?;

        let appointment = Appointment::new(
            key(suggested_sequence),
            AppointmentTiming {
                timepoint: visit.timepoint,
                timepoint_datetime: visit.timepoint_datetime(baseline),
                appt_datetime,
            },
            onschedule.schedule_name.as_str(),
            facility.name(),
            self.clock.now(),
        );
        let appointment = self.stores.appointments.insert_appointment(appointment)?;
        tracing::info!(
            "inserted unscheduled appointment {} at {}",
            appointment.key,
            fmt_dt(&appointment.appt_datetime())
        );
        Ok(appointment)
    }

    /// Bring a subject's appointments in line with a consent extension.
    ///
    /// When the extension is active, appointments missing from the effective schedule are
    /// created from the original onschedule datetime. When inactive, every appointment at one of
    /// the extension's timepoints is deleted, unscheduled ones included. Running it again without
    /// a state change does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`EdcError::RetractionBlocked`] without deleting anything if any appointment to
    /// retract has a visit report.
    pub fn refresh_for_consent_extension(
        &self,
        subject: &str,
        schedule_name: &str,
        extension_name: &str,
        facility: &CalendarFacility,
    ) -> EdcResult<RefreshOutcome> {
        let subject_identifier = SubjectIdentifier::new(subject)?;
        let extension = self.schedules.extension(extension_name)?;
        if extension.schedule_name() != schedule_name {
            return Err(EdcError::InvalidInput(format!(
                "consent extension '{}' extends schedule '{}', not '{}'",
                extension.name(),
                extension.schedule_name(),
                schedule_name
            )));
        }

        let onschedule = self.onschedule_record(subject, schedule_name)?;
        if onschedule.offschedule_datetime.is_some() {
            return Err(EdcError::NotOnSchedule {
                subject_identifier: subject_identifier.to_string(),
                schedule: schedule_name.to_string(),
            });
        }

        let mut outcome = RefreshOutcome::default();
        if self.extension_active(subject, &extension)? {
            let effective = self.effective_schedule(subject, schedule_name)?;
            let planned = self.plan(
                &subject_identifier,
                &effective,
                facility,
                onschedule.onschedule_datetime,
            )?;
            outcome.created = self.insert_planned(schedule_name, facility, planned)?;
        } else {
            let doomed: Vec<Appointment> = self
                .appointments(subject, schedule_name)?
                .into_iter()
                .filter(|a| extension.additional_timepoints().contains(&a.timepoint()))
                .collect();

            let ids: Vec<Uuid> = doomed.iter().map(|a| a.id).collect();
            if let Err(e) = self.stores.appointments.delete_unreported(&ids) {
                if matches!(e, EdcError::RetractionBlocked { .. }) {
                    tracing::warn!("refusing to retract for {}: {}", extension.name(), e);
                }
                return Err(e);
            }
            for appointment in &doomed {
                tracing::info!("retracted appointment {}", appointment.key);
            }
            outcome.retracted = doomed;
        }
        Ok(outcome)
    }

    // ------------------------------------------------------------------------
    // Status machine
    // ------------------------------------------------------------------------

    /// Move an appointment to `IN_PROGRESS`.
    ///
    /// # Errors
    ///
    /// Returns [`EdcError::ConcurrentAppointmentError`] naming the other appointment if the
    /// subject already has one in progress.
    pub fn start(&self, id: Uuid) -> EdcResult<Appointment> {
        self.stores.appointments.mark_in_progress(id, self.clock.now())
    }

    pub fn cancel(&self, id: Uuid) -> EdcResult<Appointment> {
        let mut appointment = self.stores.appointments.get_appointment(id)?;
        appointment.transition_to(AppointmentStatus::Cancelled, self.clock.now())?;
        self.stores.appointments.update_appointment(&appointment)?;
        Ok(appointment)
    }

    /// Record the visit report, create the visit's CRF metadata, run every rule group and set
    /// the appointment `INCOMPLETE`, or `COMPLETE` if no CRF is required.
    pub fn capture_visit_report(&self, id: Uuid, fields: Fields) -> EdcResult<Appointment> {
        let mut appointment = self.stores.appointments.get_appointment(id)?;
        if !appointment
            .appt_status
            .can_transition_to(AppointmentStatus::Incomplete)
        {
            return Err(EdcError::InvalidAppointmentTransition {
                from: appointment.appt_status.to_string(),
                to: AppointmentStatus::Incomplete.to_string(),
            });
        }

        let schedule =
            self.effective_schedule(appointment.subject_identifier(), &appointment.schedule_name)?;
        let visit = schedule.visit(appointment.visit_code())?;

        let subject_fields = self.subject_fields(appointment.subject_identifier())?;
        let report = VisitReport {
            appointment_id: id,
            report_datetime: self.clock.now(),
            fields,
        };
        let conclusions = self
            .engine
            .conclusions(&appointment, &report, &subject_fields, None)?;

        let previous_report = self.stores.reports.visit_report(id)?;
        let previous_metadata = self.stores.metadata.metadata_for_visit(&appointment.key)?;
        self.stores.reports.save_visit_report(report)?;
        let committed = self
            .engine
            .create_default_metadata(&appointment.key, visit)
            .and_then(|()| self.engine.apply_all(&appointment.key, visit, conclusions))
            .and_then(|_| self.advance(&mut appointment));
        if let Err(e) = committed {
            tracing::warn!("capture of {} failed, restoring its report: {}", appointment.key, e);
            self.restore_capture(&appointment.key, id, previous_report, previous_metadata)?;
            return Err(e);
        }
        Ok(appointment)
    }

    /// Record a CRF, mark it `KEYED`, re-run the rule groups sourced on it and advance the
    /// appointment.
    pub fn key_crf(&self, id: Uuid, model: &str, fields: Fields) -> EdcResult<Appointment> {
        let mut appointment = self.stores.appointments.get_appointment(id)?;
        if !self.stores.reports.has_visit_report(id)? {
            return Err(EdcError::InvalidInput(format!(
                "capture the visit report of {} before keying {model}",
                appointment.key
            )));
        }
        if appointment.appt_status == AppointmentStatus::Cancelled {
            return Err(EdcError::InvalidAppointmentTransition {
                from: appointment.appt_status.to_string(),
                to: AppointmentStatus::Complete.to_string(),
            });
        }

        let schedule =
            self.effective_schedule(appointment.subject_identifier(), &appointment.schedule_name)?;
        let visit = schedule.visit(appointment.visit_code())?;
        if !visit.schedules_crf(model) {
            return Err(EdcError::InvalidInput(format!(
                "{model} is not a CRF of visit {}",
                visit.code
            )));
        }

        self.stores.reports.save_crf_record(CrfRecord {
            appointment_id: id,
            model: model.to_string(),
            report_datetime: self.clock.now(),
            fields,
        })?;
        self.engine.mark_keyed(&appointment.key, model)?;
        let subject_fields = self.subject_fields(appointment.subject_identifier())?;
        self.engine
            .evaluate(&appointment, visit, &subject_fields, Some(model))?;

        self.advance(&mut appointment)?;
        Ok(appointment)
    }

    /// Move a `NEW` appointment to another datetime inside its window.
    pub fn reschedule(&self, id: Uuid, new_datetime: DateTime<Utc>) -> EdcResult<Appointment> {
        let mut appointment = self.stores.appointments.get_appointment(id)?;
        if appointment.appt_status != AppointmentStatus::New {
            return Err(EdcError::InvalidInput(format!(
                "appointment {} is {}; only NEW appointments can be rescheduled",
                appointment.key, appointment.appt_status
            )));
        }

        let baseline = self
            .onschedule_record(appointment.subject_identifier(), &appointment.schedule_name)?
            .onschedule_datetime;
        let schedule =
            self.effective_schedule(appointment.subject_identifier(), &appointment.schedule_name)?;
        let code = appointment.visit_code();
        let visit = schedule.visit(code)?;

        if appointment.visit_code_sequence() == 0 {
            let (lower, upper) = self.calculator.bounds_for_scheduled(
                visit,
                baseline,
                schedule.previous_visit(code),
            );
            self.calculator
                .validate_in_window(code, new_datetime, lower, upper)?;
        } else {
            self.calculator.bounds_for_unscheduled(
                new_datetime,
                visit,
                schedule.next_visit(code),
                baseline,
            )?;
        }

        appointment.timing.appt_datetime = new_datetime;
        appointment.timestamps.touch(self.clock.now());
        self.stores.appointments.update_appointment(&appointment)?;
        tracing::info!(
            "rescheduled {} to {}",
            appointment.key,
            fmt_dt(&new_datetime)
        );
        Ok(appointment)
    }

    /// Take a subject off a schedule, deleting `NEW` appointments after the off-schedule
    /// datetime that have no visit report. Returns the deleted appointments.
    pub fn take_off_schedule(
        &self,
        subject: &str,
        schedule_name: &str,
        offschedule_datetime: DateTime<Utc>,
    ) -> EdcResult<Vec<Appointment>> {
        self.schedules.get(schedule_name)?;
        self.stores
            .history
            .take_off_schedule(subject, schedule_name, offschedule_datetime)?;

        let mut deleted = Vec::new();
        for appointment in self.appointments(subject, schedule_name)? {
            if appointment.appt_status != AppointmentStatus::New
                || appointment.appt_datetime() <= offschedule_datetime
            {
                continue;
            }
            match self.stores.appointments.delete_unreported(&[appointment.id]) {
                Ok(()) => deleted.push(appointment),
                Err(EdcError::RetractionBlocked { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        tracing::info!(
            "took {} off {}; deleted {} future appointments",
            subject,
            schedule_name,
            deleted.len()
        );
        Ok(deleted)
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn extension_active(&self, subject: &str, extension: &ConsentExtension) -> EdcResult<bool> {
        let record = self
            .stores
            .consents
            .latest_extension_record(subject, extension.name())?;
        extension.is_active(record.as_ref())
    }

    fn onschedule_record(&self, subject: &str, schedule_name: &str) -> EdcResult<OnScheduleRecord> {
        self.stores
            .history
            .on_schedule(subject, schedule_name)?
            .ok_or_else(|| EdcError::NotOnSchedule {
                subject_identifier: subject.to_string(),
                schedule: schedule_name.to_string(),
            })
    }

    /// Appointment keys and timings for every visit of `schedule` that has no appointment yet.
    /// Nothing is stored.
    fn plan(
        &self,
        subject: &SubjectIdentifier,
        schedule: &ScheduleDefinition,
        facility: &CalendarFacility,
        baseline: DateTime<Utc>,
    ) -> EdcResult<Vec<(VisitKey, AppointmentTiming)>> {
        let mut planned = Vec::with_capacity(schedule.len());
        let mut previous: Option<&VisitSpec> = None;
        for visit in schedule.timepoints_ordered() {
            let key = VisitKey::new(subject.clone(), visit.code.clone(), 0);
            if self.stores.appointments.find_appointment(&key)?.is_some() {
                previous = Some(visit);
                continue;
            }
            let (_, upper) = self.calculator.bounds_for_scheduled(visit, baseline, previous);
            let timepoint_datetime = visit.timepoint_datetime(baseline);
            let appt_datetime =
                facility.nearest_open_date(timepoint_datetime, Some(upper - timepoint_datetime))?;
            planned.push((
                key,
                AppointmentTiming {
                    timepoint: visit.timepoint,
                    timepoint_datetime,
                    appt_datetime,
                },
            ));
            previous = Some(visit);
        }
        Ok(planned)
    }

    /// Insert planned appointments that do not exist yet.
    fn insert_planned(
        &self,
        schedule_name: &str,
        facility: &CalendarFacility,
        planned: Vec<(VisitKey, AppointmentTiming)>,
    ) -> EdcResult<Vec<Appointment>> {
        let mut created = Vec::new();
        for (key, timing) in planned {
            if self.stores.appointments.find_appointment(&key)?.is_some() {
                continue;
            }
            let appointment = Appointment::new(
                key,
                timing,
                schedule_name,
                facility.name(),
                self.clock.now(),
            );
            let appointment = self.stores.appointments.insert_appointment(appointment)?;
            tracing::debug!(
                "created appointment {} at {}",
                appointment.key,
                fmt_dt(&appointment.appt_datetime())
            );
            created.push(appointment);
        }
        Ok(created)
    }

    /// Put back the report and metadata a failed capture replaced.
    fn restore_capture(
        &self,
        key: &VisitKey,
        id: Uuid,
        previous_report: Option<VisitReport>,
        previous_metadata: Vec<CrfMetadata>,
    ) -> EdcResult<()> {
        match previous_report {
            Some(report) => self.stores.reports.save_visit_report(report)?,
            None => self.stores.reports.delete_visit_report(id)?,
        }
        self.stores.metadata.delete_metadata_for_visit(key)?;
        for entry in previous_metadata {
            self.stores.metadata.upsert_metadata(entry)?;
        }
        Ok(())
    }

    fn next_free_sequence(&self, scheduled: &VisitKey) -> EdcResult<u32> {
        let mut sequence = 1;
        loop {
            let key = VisitKey::new(
                scheduled.subject_identifier.clone(),
                scheduled.visit_code.clone(),
                sequence,
            );
            if self.stores.appointments.find_appointment(&key)?.is_none() {
                return Ok(sequence);
            }
            sequence += 1;
        }
    }

    fn subject_fields(&self, subject: &str) -> EdcResult<Fields> {
        match self.stores.consents.registered_subject(subject) {
            Ok(registered) => Ok(registered.fields),
            Err(EdcError::SubjectNotFound(_)) => Ok(Fields::new()),
            Err(e) => Err(e),
        }
    }

    /// `INCOMPLETE` while any CRF is required, else `COMPLETE`.
    fn advance(&self, appointment: &mut Appointment) -> EdcResult<()> {
        let next = if self.engine.has_required(&appointment.key)? {
            AppointmentStatus::Incomplete
        } else {
            AppointmentStatus::Complete
        };
        appointment.transition_to(next, self.clock.now())?;
        self.stores.appointments.update_appointment(appointment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::consent::{
        ConsentDefinition, ConsentExtensionRecord, ConsentRecord, RegisteredSubject,
    };
    use crate::facility::{BookedSlots, NoHolidays};
    use crate::interval::Interval;
    use crate::metadata::{MetadataStatus, Predicate, Rule, RuleGroup};
    use chrono::{Duration, TimeZone, Weekday};
    use serde_json::json;
    use std::thread;

    const SUBJECT: &str = "101-1";

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    // Monday
    fn baseline() -> DateTime<Utc> {
        at(2025, 1, 6, 9)
    }

    fn visit(code: &str, timepoint: u32, offset: i64, window: i64) -> VisitSpec {
        VisitSpec::new(
            code,
            timepoint,
            Interval::of_days(offset),
            Interval::of_days(window),
            Interval::of_days(window),
        )
        .unwrap()
    }

    fn registry() -> ScheduleRegistry {
        registry_with(&[3], vec![visit("4000", 3, 84, 7)])
    }

    /// `schedule1` with extension `ext1` gating `gated` and appending `appended`.
    fn registry_with(gated: &[u32], appended: Vec<VisitSpec>) -> ScheduleRegistry {
        let mut registry = ScheduleRegistry::init();
        registry
            .register_consent_definition(
                ConsentDefinition::new("main", "1", "c.subjectconsent", at(2024, 1, 1, 0), at(2030, 12, 31, 0))
                    .unwrap(),
            )
            .unwrap();

        let mut schedule = ScheduleDefinition::new("schedule1", "1", "a.onschedule", "a.offschedule")
            .unwrap()
            .with_consent_definition("main-1");
        schedule
            .register(
                visit("1000", 0, 0, 0)
                    .with_required_crfs(["crf_one"])
                    .with_optional_crfs(["prostate"]),
            )
            .unwrap();
        schedule
            .register(visit("2000", 1, 28, 7).with_required_crfs(["crf_one"]))
            .unwrap();
        schedule
            .register(visit("3000", 2, 56, 7).with_upper_window_extended(Interval::of_days(28)))
            .unwrap();

        let extension = ConsentExtension::new(
            "ext1",
            &schedule,
            gated.iter().copied(),
            appended,
            Predicate::field_equals("agrees_to_extension", "Yes"),
        )
        .unwrap();
        registry.register(schedule).unwrap();
        registry.register_extension(extension).unwrap();
        registry
    }

    fn rules() -> RuleGroupRegistry {
        let rule = Rule::new(
            "male_only",
            Predicate::field_equals("gender", "MALE"),
            "REQUIRED",
            "NOT_REQUIRED",
            ["prostate"],
        )
        .unwrap();
        let mut registry = RuleGroupRegistry::init();
        registry
            .register(RuleGroup::new("trial_subject", None, vec![rule]).unwrap())
            .unwrap();
        registry
    }

    struct Harness {
        store: Arc<InMemoryStore>,
        clock: Arc<FixedClock>,
        facility: CalendarFacility,
        scheduler: AppointmentScheduler,
    }

    fn harness() -> Harness {
        harness_with(EdcConfig::default())
    }

    fn harness_with(config: EdcConfig) -> Harness {
        harness_from(config, registry())
    }

    fn harness_from(config: EdcConfig, schedules: ScheduleRegistry) -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(FixedClock::new(baseline()));
        let facility = CalendarFacility::new(
            "clinic",
            [Weekday::Mon, Weekday::Tue, Weekday::Wed, Weekday::Thu, Weekday::Fri],
            Arc::new(NoHolidays),
        )
        .unwrap();
        let scheduler = AppointmentScheduler::new(
            &config,
            Arc::new(schedules),
            Arc::new(rules()),
            Collaborators::in_memory(store.clone()),
            clock.clone(),
        );

        store
            .save_consent(ConsentRecord {
                subject_identifier: SubjectIdentifier::new(SUBJECT).unwrap(),
                consent_definition: "main-1".into(),
                consent_datetime: baseline() - Duration::hours(1),
            })
            .unwrap();
        store
            .save_registered_subject(RegisteredSubject {
                subject_identifier: SubjectIdentifier::new(SUBJECT).unwrap(),
                fields: [("gender".to_string(), json!("FEMALE"))].into_iter().collect(),
            })
            .unwrap();

        Harness {
            store,
            clock,
            facility,
            scheduler,
        }
    }

    impl Harness {
        fn enroll(&self) -> Vec<Appointment> {
            self.scheduler
                .enroll(SUBJECT, "schedule1", &self.facility, baseline())
                .unwrap()
        }

        fn appointment(&self, code: &str, sequence: u32) -> Appointment {
            self.store
                .find_appointment(&VisitKey::new(
                    SubjectIdentifier::new(SUBJECT).unwrap(),
                    VisitCode::new(code).unwrap(),
                    sequence,
                ))
                .unwrap()
                .unwrap()
        }

        fn agree(&self, answer: &str, day: u32) {
            self.store
                .save_extension_record(ConsentExtensionRecord {
                    subject_identifier: SubjectIdentifier::new(SUBJECT).unwrap(),
                    extension: "ext1".into(),
                    report_datetime: at(2025, 2, day, 9),
                    fields: [("agrees_to_extension".to_string(), json!(answer))]
                        .into_iter()
                        .collect(),
                })
                .unwrap();
        }

        fn refresh(&self) -> EdcResult<RefreshOutcome> {
            self.scheduler
                .refresh_for_consent_extension(SUBJECT, "schedule1", "ext1", &self.facility)
        }

        fn count(&self) -> usize {
            self.scheduler.appointments(SUBJECT, "schedule1").unwrap().len()
        }
    }

    #[test]
    fn test_enroll_creates_one_appointment_per_visit_inside_windows() {
        let h = harness();
        let created = h.enroll();

        assert_eq!(created.len(), 3);
        let schedule = h.scheduler.effective_schedule(SUBJECT, "schedule1").unwrap();
        let windows = h.scheduler.calculator().schedule_windows(&schedule, baseline());
        for (appointment, window) in created.iter().zip(&windows) {
            assert_eq!(appointment.appt_status, AppointmentStatus::New);
            assert_eq!(appointment.visit_code_sequence(), 0);
            assert!(window.contains(appointment.appt_datetime()));
        }
        assert_eq!(created[1].appt_datetime(), at(2025, 2, 3, 9));
    }

    #[test]
    fn test_enroll_twice_fails() {
        let h = harness();
        h.enroll();
        let err = h
            .scheduler
            .enroll(SUBJECT, "schedule1", &h.facility, baseline())
            .expect_err("second enrolment");
        assert!(matches!(err, EdcError::AlreadyOnScheduleError { .. }));
        assert_eq!(h.count(), 3);
    }

    #[test]
    fn test_concurrent_enrolment_creates_one_set() {
        let h = Arc::new(harness());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let h = h.clone();
                thread::spawn(move || {
                    h.scheduler
                        .enroll(SUBJECT, "schedule1", &h.facility, baseline())
                        .is_ok()
                })
            })
            .collect();
        let succeeded = handles
            .into_iter()
            .map(|t| t.join().unwrap())
            .filter(|ok| *ok)
            .count();

        assert_eq!(succeeded, 1);
        assert_eq!(h.count(), 3);
    }

    #[test]
    fn test_enroll_requires_consent() {
        let h = harness();
        let err = h
            .scheduler
            .enroll("102-7", "schedule1", &h.facility, baseline())
            .expect_err("no consent");
        assert!(matches!(err, EdcError::ConsentDoesNotExist(_)));

        let err = h
            .scheduler
            .enroll(SUBJECT, "schedule1", &h.facility, at(2031, 6, 2, 9))
            .expect_err("outside every consent definition");
        assert!(matches!(err, EdcError::ConsentDefinitionError(_)));
    }

    #[test]
    fn test_second_in_progress_names_the_first() {
        let h = harness();
        h.enroll();
        let first = h.appointment("1000", 0);
        let second = h.appointment("2000", 0);

        h.scheduler.start(first.id).unwrap();
        let err = h.scheduler.start(second.id).expect_err("second in progress");
        match err {
            EdcError::ConcurrentAppointmentError { appointment_id, visit_code, .. } => {
                assert_eq!(appointment_id, first.id);
                assert_eq!(visit_code, "1000");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_capture_then_key_completes_visit() {
        let h = harness();
        h.enroll();
        let appointment = h.appointment("1000", 0);
        h.scheduler.start(appointment.id).unwrap();

        let captured = h
            .scheduler
            .capture_visit_report(appointment.id, Fields::new())
            .unwrap();
        assert_eq!(captured.appt_status, AppointmentStatus::Incomplete);

        // female subject: the male-only CRF is not required
        let prostate = h.store.get_metadata(&appointment.key, "prostate").unwrap().unwrap();
        assert_eq!(prostate.status, MetadataStatus::NotRequired);

        let keyed = h
            .scheduler
            .key_crf(appointment.id, "crf_one", Fields::new())
            .unwrap();
        assert_eq!(keyed.appt_status, AppointmentStatus::Complete);
        assert!(h.store.in_progress_for(SUBJECT).unwrap().is_none());
    }

    #[test]
    fn test_failed_rule_evaluation_leaves_no_report() {
        let h = harness();
        h.store
            .save_registered_subject(RegisteredSubject {
                subject_identifier: SubjectIdentifier::new(SUBJECT).unwrap(),
                fields: Fields::new(),
            })
            .unwrap();
        h.enroll();
        let appointment = h.appointment("1000", 0);

        let err = h
            .scheduler
            .capture_visit_report(appointment.id, Fields::new())
            .expect_err("gender missing");
        assert!(matches!(err, EdcError::PredicateError(msg) if msg.contains("gender")));
        assert!(!h.store.has_visit_report(appointment.id).unwrap());
        assert!(h.store.metadata_for_visit(&appointment.key).unwrap().is_empty());
        assert_eq!(h.appointment("1000", 0).appt_status, AppointmentStatus::New);

        let err = h
            .scheduler
            .key_crf(appointment.id, "crf_one", Fields::new())
            .expect_err("no visit report");
        assert!(matches!(err, EdcError::InvalidInput(_)));
        assert_eq!(h.appointment("1000", 0).appt_status, AppointmentStatus::New);
    }

    #[test]
    fn test_failed_recapture_keeps_previous_report() {
        let h = harness();
        h.enroll();
        let appointment = h.appointment("1000", 0);
        let first: Fields = [("note".to_string(), json!("first"))].into_iter().collect();
        h.scheduler.capture_visit_report(appointment.id, first).unwrap();

        h.store
            .save_registered_subject(RegisteredSubject {
                subject_identifier: SubjectIdentifier::new(SUBJECT).unwrap(),
                fields: Fields::new(),
            })
            .unwrap();
        let second: Fields = [("note".to_string(), json!("second"))].into_iter().collect();
        h.scheduler
            .capture_visit_report(appointment.id, second)
            .expect_err("gender missing");

        let report = h.store.visit_report(appointment.id).unwrap().unwrap();
        assert_eq!(report.fields["note"], json!("first"));
        let prostate = h.store.get_metadata(&appointment.key, "prostate").unwrap().unwrap();
        assert_eq!(prostate.status, MetadataStatus::NotRequired);
        assert_eq!(h.appointment("1000", 0).appt_status, AppointmentStatus::Incomplete);
    }

    #[test]
    fn test_cancel_rules() {
        let h = harness();
        h.enroll();
        let cancelled = h.scheduler.cancel(h.appointment("3000", 0).id).unwrap();
        assert_eq!(cancelled.appt_status, AppointmentStatus::Cancelled);

        let err = h
            .scheduler
            .capture_visit_report(cancelled.id, Fields::new())
            .expect_err("cancelled");
        assert!(matches!(err, EdcError::InvalidAppointmentTransition { .. }));
    }

    #[test]
    fn test_insert_unscheduled_guards() {
        let h = harness();
        h.enroll();
        let parent = h.appointment("1000", 0);

        let err = h
            .scheduler
            .insert_unscheduled(SUBJECT, "schedule1", "1000", 1, Some(at(2025, 1, 10, 9)), &h.facility)
            .expect_err("parent still NEW");
        assert!(matches!(err, EdcError::UnscheduledAppointmentNotAllowed(_)));

        h.scheduler.capture_visit_report(parent.id, Fields::new()).unwrap();

        let inserted = h
            .scheduler
            .insert_unscheduled(SUBJECT, "schedule1", "1000", 1, Some(at(2025, 1, 10, 9)), &h.facility)
            .unwrap();
        assert_eq!(inserted.visit_code_sequence(), 1);
        assert_eq!(inserted.timepoint(), 0);

        let err = h
            .scheduler
            .insert_unscheduled(SUBJECT, "schedule1", "1000", 1, Some(at(2025, 1, 13, 9)), &h.facility)
            .expect_err("duplicate sequence");
        assert!(matches!(err, EdcError::DuplicateAppointment { visit_code_sequence: 1, .. }));

        let err = h
            .scheduler
            .insert_unscheduled(SUBJECT, "schedule1", "1000", 3, Some(at(2025, 1, 13, 9)), &h.facility)
            .expect_err("skipped sequence");
        assert!(matches!(err, EdcError::InvalidVisitCodeSequence(msg) if msg.contains("expected sequence 2")));

        // 2000 opens on 2025-01-27
        let err = h
            .scheduler
            .insert_unscheduled(SUBJECT, "schedule1", "1000", 2, Some(at(2025, 1, 27, 9)), &h.facility)
            .expect_err("inside the next window");
        assert!(matches!(err, EdcError::UnscheduledVisitWindowError { .. }));

        let err = h
            .scheduler
            .insert_unscheduled(SUBJECT, "schedule1", "1000", 2, Some(at(2025, 1, 8, 9)), &h.facility)
            .expect_err("before the previous occurrence");
        assert!(matches!(err, EdcError::UnscheduledVisitWindowError { message, .. } if message.contains("on or after")));

        assert_eq!(h.count(), 4);
    }

    #[test]
    fn test_insert_unscheduled_moves_to_open_day_and_defaults_to_now() {
        let h = harness();
        h.enroll();
        let parent = h.appointment("1000", 0);
        h.scheduler.capture_visit_report(parent.id, Fields::new()).unwrap();

        // Saturday 2025-01-11
        h.clock.set(at(2025, 1, 11, 10));
        let inserted = h
            .scheduler
            .insert_unscheduled(SUBJECT, "schedule1", "1000", 1, None, &h.facility)
            .unwrap();
        assert_eq!(inserted.appt_datetime(), at(2025, 1, 13, 10));
    }

    #[test]
    fn test_insert_unscheduled_blocked_while_in_progress() {
        let h = harness();
        h.enroll();
        let parent = h.appointment("1000", 0);
        h.scheduler.capture_visit_report(parent.id, Fields::new()).unwrap();
        h.scheduler.start(h.appointment("2000", 0).id).unwrap();

        let err = h
            .scheduler
            .insert_unscheduled(SUBJECT, "schedule1", "1000", 1, Some(at(2025, 1, 10, 9)), &h.facility)
            .expect_err("2000 in progress");
        assert!(matches!(err, EdcError::ConcurrentAppointmentError { .. }));
    }

    #[test]
    fn test_consent_extension_adds_and_retracts_timepoint() {
        let h = harness();
        h.enroll();
        assert_eq!(h.count(), 3);

        h.agree("Yes", 1);
        let outcome = h.refresh().unwrap();
        assert_eq!(outcome.created.len(), 1);
        assert_eq!(h.count(), 4);
        let extended = h.appointment("4000", 0);
        assert_eq!(extended.timepoint(), 3);
        assert_eq!(extended.timing.timepoint_datetime, baseline() + Duration::days(84));

        // re-entrant
        assert!(h.refresh().unwrap().is_empty());
        assert_eq!(h.count(), 4);

        h.agree("No", 2);
        let outcome = h.refresh().unwrap();
        assert_eq!(outcome.retracted.len(), 1);
        assert_eq!(h.count(), 3);
        assert!(h.refresh().unwrap().is_empty());
    }

    #[test]
    fn test_refresh_with_booked_slots_skips_existing_appointments() {
        let h = harness();
        let facility = CalendarFacility::new(
            "clinic",
            [Weekday::Mon, Weekday::Tue, Weekday::Wed, Weekday::Thu, Weekday::Fri],
            Arc::new(NoHolidays),
        )
        .unwrap()
        .with_slots_per_day(1)
        .with_capacity_policy(Arc::new(BookedSlots::new(h.store.clone())));
        h.scheduler
            .enroll(SUBJECT, "schedule1", &facility, baseline())
            .unwrap();

        // 1000 fills its only day; the refresh must not look for a new slot for it
        h.agree("Yes", 1);
        let outcome = h
            .scheduler
            .refresh_for_consent_extension(SUBJECT, "schedule1", "ext1", &facility)
            .unwrap();
        assert_eq!(outcome.created.len(), 1);
        assert_eq!(outcome.created[0].visit_code(), "4000");
        assert_eq!(h.count(), 4);
    }

    #[test]
    fn test_extension_gating_a_base_visit() {
        let h = harness_from(EdcConfig::default(), registry_with(&[2], vec![]));
        let created = h.enroll();
        assert_eq!(created.len(), 2);
        assert!(created.iter().all(|a| a.visit_code() != "3000"));

        h.agree("Yes", 1);
        let outcome = h.refresh().unwrap();
        assert_eq!(outcome.created.len(), 1);
        let gated = h.appointment("3000", 0);
        assert_eq!(gated.timepoint(), 2);
        assert_eq!(gated.timing.timepoint_datetime, baseline() + Duration::days(56));
        assert_eq!(h.count(), 3);

        h.agree("No", 2);
        let outcome = h.refresh().unwrap();
        assert_eq!(outcome.retracted.len(), 1);
        assert_eq!(outcome.retracted[0].visit_code(), "3000");
        assert_eq!(h.count(), 2);
    }

    #[test]
    fn test_retraction_blocked_by_visit_report() {
        let h = harness();
        h.enroll();
        h.agree("Yes", 1);
        h.refresh().unwrap();

        let extended = h.appointment("4000", 0);
        h.scheduler.capture_visit_report(extended.id, Fields::new()).unwrap();

        h.agree("No", 2);
        let err = h.refresh().expect_err("visit report exists");
        assert!(matches!(err, EdcError::RetractionBlocked { visit_code, .. } if visit_code == "4000"));
        assert_eq!(h.count(), 4);
    }

    #[test]
    fn test_reschedule_checks_window() {
        let h = harness();
        h.enroll();
        let appointment = h.appointment("2000", 0);

        let moved = h.scheduler.reschedule(appointment.id, at(2025, 2, 5, 14)).unwrap();
        assert_eq!(moved.appt_datetime(), at(2025, 2, 5, 14));

        let err = h
            .scheduler
            .reschedule(appointment.id, at(2025, 2, 20, 9))
            .expect_err("outside window");
        assert!(matches!(err, EdcError::ScheduledVisitWindowError { .. }));
    }

    #[test]
    fn test_reschedule_unchecked_when_window_not_enforced() {
        let config = EdcConfig::new(false, 1, "protocol".into()).unwrap();
        let h = harness_with(config);
        h.enroll();
        let appointment = h.appointment("2000", 0);
        assert!(h.scheduler.reschedule(appointment.id, at(2025, 6, 2, 9)).is_ok());
    }

    #[test]
    fn test_take_off_schedule_removes_future_new_appointments() {
        let h = harness();
        h.enroll();
        let first = h.appointment("1000", 0);
        h.scheduler.capture_visit_report(first.id, Fields::new()).unwrap();

        let deleted = h
            .scheduler
            .take_off_schedule(SUBJECT, "schedule1", at(2025, 1, 20, 9))
            .unwrap();
        assert_eq!(deleted.len(), 2);
        assert_eq!(h.count(), 1);

        let err = h
            .scheduler
            .take_off_schedule(SUBJECT, "schedule1", at(2025, 1, 21, 9))
            .expect_err("already off");
        assert!(matches!(err, EdcError::NotOnSchedule { .. }));
    }
}
