use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Format used for datetimes in user-facing error messages.
pub(crate) const MESSAGE_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M UTC";

pub(crate) fn fmt_dt(dt: &DateTime<Utc>) -> String {
    dt.format(MESSAGE_DATETIME_FORMAT).to_string()
}

#[derive(Debug, thiserror::Error)]
pub enum EdcError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("protocol error: {0}")]
    Protocol(#[from] edc_protocol::ProtocolError),
    #[error("invalid value: {0}")]
    Text(#[from] edc_types::TextError),

    // Registration and configuration.
    #[error("already registered: {0}")]
    AlreadyRegistered(String),
    #[error("rule group '{0}' has no rules")]
    NoRulesError(String),
    #[error("rule logic error: {0}")]
    RuleLogicError(String),
    #[error("predicate error: {0}")]
    PredicateError(String),
    #[error("schedule not found: '{0}'")]
    ScheduleNotFound(String),
    #[error("visit '{visit_code}' not found in schedule '{schedule}'")]
    VisitNotFound { schedule: String, visit_code: String },
    #[error("invalid schedule '{schedule}': {reason}")]
    InvalidSchedule { schedule: String, reason: String },
    #[error("consent definition error: {0}")]
    ConsentDefinitionError(String),

    // Temporal.
    #[error(
        "Invalid datetime. Falls outside of the window period for this scheduled visit. \
         Expected a datetime between {lower_s} and {upper_s}. Got {candidate_s}. See visit {visit_code}.",
        lower_s = fmt_dt(.lower),
        upper_s = fmt_dt(.upper),
        candidate_s = fmt_dt(.candidate)
    )]
    ScheduledVisitWindowError {
        visit_code: String,
        lower: DateTime<Utc>,
        upper: DateTime<Utc>,
        candidate: DateTime<Utc>,
    },
    #[error("{message}")]
    UnscheduledVisitWindowError {
        visit_code: String,
        candidate: DateTime<Utc>,
        message: String,
    },

    // Concurrency.
    #[error(
        "appointment already exists for subject {subject_identifier} at visit {visit_code}.{visit_code_sequence}"
    )]
    DuplicateAppointment {
        subject_identifier: String,
        visit_code: String,
        visit_code_sequence: u32,
    },
    #[error(
        "Not allowed. Appointment {visit_code}.{visit_code_sequence} ({appointment_id}) is already in progress for subject {subject_identifier}"
    )]
    ConcurrentAppointmentError {
        subject_identifier: String,
        appointment_id: Uuid,
        visit_code: String,
        visit_code_sequence: u32,
    },
    #[error("subject {subject_identifier} is already on schedule '{schedule}'")]
    AlreadyOnScheduleError {
        subject_identifier: String,
        schedule: String,
    },

    // Capacity.
    #[error(
        "no open slot at facility '{facility}' between {from_s} and {until_s}",
        from_s = fmt_dt(.from),
        until_s = fmt_dt(.until)
    )]
    NoAvailableSlot {
        facility: String,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    },

    // State integrity.
    #[error(
        "cannot retract appointment {visit_code}.{visit_code_sequence} for subject {subject_identifier}: a visit report has been captured"
    )]
    RetractionBlocked {
        subject_identifier: String,
        visit_code: String,
        visit_code_sequence: u32,
    },
    #[error("invalid appointment status transition from {from} to {to}")]
    InvalidAppointmentTransition { from: String, to: String },
    #[error("invalid visit code sequence: {0}")]
    InvalidVisitCodeSequence(String),
    #[error("unscheduled appointment not allowed: {0}")]
    UnscheduledAppointmentNotAllowed(String),
    #[error("subject {subject_identifier} is not on schedule '{schedule}'")]
    NotOnSchedule {
        subject_identifier: String,
        schedule: String,
    },

    // Consent.
    #[error("consent does not exist: {0}")]
    ConsentDoesNotExist(String),

    // Lookup.
    #[error("appointment not found: {0}")]
    AppointmentNotFound(String),
    #[error("registered subject not found: {0}")]
    SubjectNotFound(String),

    #[error("store lock poisoned")]
    LockPoisoned,
}

pub type EdcResult<T> = std::result::Result<T, EdcError>;
