//! # EDC Core
//!
//! The visit-schedule, appointment-window and CRF-metadata kernel of the EDC system.
//!
//! This crate contains the scheduling logic only:
//! - Facility calendars (open weekdays, holidays, capacity)
//! - Visit window arithmetic for scheduled and unscheduled visits
//! - Schedule definitions, consent extensions and their registry
//! - Appointment materialization and the appointment status machine
//! - CRF metadata rules
//!
//! **No storage or UI concerns**: persistence is reached through the collaborator traits in
//! [`store`]; [`memory::InMemoryStore`] implements them for tests and the CLI simulator.

pub mod appointment;
pub mod clock;
pub mod config;
pub mod consent;
pub mod constants;
pub mod error;
pub mod facility;
pub mod interval;
pub mod memory;
pub mod metadata;
pub mod protocol;
pub mod schedule;
pub mod scheduler;
pub mod store;
pub mod window;

pub use appointment::{
    Appointment, AppointmentReason, AppointmentStatus, AppointmentTiming, Timestamps, VisitKey,
};
pub use clock::{Clock, FixedClock, SystemClock};
pub use config::EdcConfig;
pub use consent::{
    ConsentDefinition, ConsentExtension, ConsentExtensionRecord, ConsentRecord, RegisteredSubject,
};
pub use error::{EdcError, EdcResult};
pub use facility::{CalendarFacility, CapacityPolicy, HolidaySource, Holidays, NoHolidays};
pub use interval::{Interval, IntervalUnit};
pub use memory::InMemoryStore;
pub use metadata::{
    Consequence, CrfMetadata, MetadataRuleEngine, MetadataStatus, Predicate, Rule, RuleGroup,
    RuleGroupRegistry,
};
pub use protocol::Protocol;
pub use schedule::{ScheduleDefinition, ScheduleRegistry, VisitSpec};
pub use scheduler::{AppointmentScheduler, Collaborators, RefreshOutcome};
pub use window::{Window, WindowCalculator};
