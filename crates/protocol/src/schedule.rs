//! Schedule definition files (`schedules.yaml`).
//!
//! One file holds the consent definitions a protocol accepts, the schedules (each an ordered
//! list of visits) and any consent extensions layered on top of a schedule.
//!
//! Interval fields (`relative_offset`, `lower_window`, ...) stay as strings here, for example
//! `"+28 days"` or `"7D"`. `edc-core` parses them when it registers the schedule.

use crate::{ensure_unique, parse_yaml, read_file, ProtocolError, ProtocolResult};
use chrono::{DateTime, Utc};
use edc_types::{NonEmptyText, VisitCode};
use serde::Deserialize;
use std::path::Path;

// ============================================================================
// Public domain-level types
// ============================================================================

/// A consent form version the protocol accepts, valid over `[start, end]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConsentDefinitionData {
    pub name: NonEmptyText,
    pub version: NonEmptyText,
    pub model: NonEmptyText,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// One visit of a schedule.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VisitData {
    pub code: VisitCode,
    pub title: String,
    pub timepoint: u32,
    pub relative_offset: String,
    pub lower_window: String,
    pub upper_window: String,
    pub upper_window_extended: Option<String>,
    pub window_gap_to_lower: bool,
    pub allow_unscheduled: bool,
    pub required_crfs: Vec<NonEmptyText>,
    pub optional_crfs: Vec<NonEmptyText>,
}

/// A named, versioned schedule.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScheduleData {
    pub name: NonEmptyText,
    pub version: NonEmptyText,
    pub onschedule_model: NonEmptyText,
    pub offschedule_model: NonEmptyText,
    /// Accepted consent definitions as `name-version` identifiers.
    pub consent_definitions: Vec<String>,
    pub visits: Vec<VisitData>,
}

/// Field condition that activates a consent extension.
#[derive(Clone, Debug, PartialEq)]
pub struct ActivationData {
    pub field: NonEmptyText,
    pub equals: serde_json::Value,
}

/// A consent extension adding timepoints to a schedule.
#[derive(Clone, Debug, PartialEq)]
pub struct ExtensionData {
    pub name: NonEmptyText,
    pub schedule: NonEmptyText,
    pub additional_timepoints: Vec<u32>,
    pub appended_visits: Vec<VisitData>,
    pub activation: ActivationData,
}

// ============================================================================
// Public SchedulesFile operations
// ============================================================================

/// Parsed contents of a `schedules.yaml` file.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct SchedulesFile {
    pub consent_definitions: Vec<ConsentDefinitionData>,
    pub schedules: Vec<ScheduleData>,
    pub extensions: Vec<ExtensionData>,
}

impl SchedulesFile {
    /// Parse schedule definitions from YAML text.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::SchemaMismatch`] naming the failing path when the YAML does not
    /// match the wire schema (unknown keys included), and [`ProtocolError::InvalidInput`] when
    /// names collide or a consent definition's `start` is after its `end`.
    pub fn parse(yaml_text: &str) -> ProtocolResult<Self> {
        let wire: SchedulesFileWire = parse_yaml("schedules", yaml_text)?;
        wire_to_domain(wire)
    }

    /// Read and parse a `schedules.yaml` file.
    pub fn load(path: &Path) -> ProtocolResult<Self> {
        Self::parse(&read_file(path)?)
    }
}

// ============================================================================
// Wire types (internal)
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SchedulesFileWire {
    #[serde(default)]
    consent_definitions: Vec<ConsentDefinitionWire>,
    #[serde(default)]
    schedules: Vec<ScheduleWire>,
    #[serde(default)]
    extensions: Vec<ExtensionWire>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConsentDefinitionWire {
    name: NonEmptyText,
    version: NonEmptyText,
    model: NonEmptyText,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ScheduleWire {
    name: NonEmptyText,
    version: NonEmptyText,
    onschedule_model: NonEmptyText,
    offschedule_model: NonEmptyText,
    #[serde(default)]
    consent_definitions: Vec<String>,
    visits: Vec<VisitWire>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct VisitWire {
    code: VisitCode,
    #[serde(default)]
    title: Option<String>,
    timepoint: u32,
    relative_offset: String,
    lower_window: String,
    upper_window: String,
    #[serde(default)]
    upper_window_extended: Option<String>,
    #[serde(default)]
    window_gap_to_lower: bool,
    #[serde(default = "default_true")]
    allow_unscheduled: bool,
    #[serde(default)]
    required_crfs: Vec<NonEmptyText>,
    #[serde(default)]
    optional_crfs: Vec<NonEmptyText>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ExtensionWire {
    name: NonEmptyText,
    schedule: NonEmptyText,
    additional_timepoints: Vec<u32>,
    #[serde(default)]
    appended_visits: Vec<VisitWire>,
    #[serde(default)]
    activation: Option<ActivationWire>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ActivationWire {
    field: NonEmptyText,
    equals: serde_json::Value,
}

fn default_true() -> bool {
    true
}

// ============================================================================
// Helper functions (internal)
// ============================================================================

fn wire_to_domain(wire: SchedulesFileWire) -> ProtocolResult<SchedulesFile> {
    ensure_unique(
        "schedule",
        wire.schedules.iter().map(|s| s.name.as_str()),
    )?;
    ensure_unique(
        "extension",
        wire.extensions.iter().map(|e| e.name.as_str()),
    )?;

    let mut consent_definitions = Vec::with_capacity(wire.consent_definitions.len());
    for cdef in wire.consent_definitions {
        if cdef.start > cdef.end {
            return Err(ProtocolError::InvalidInput(format!(
                "consent definition '{}-{}' starts after it ends",
                cdef.name, cdef.version
            )));
        }
        consent_definitions.push(ConsentDefinitionData {
            name: cdef.name,
            version: cdef.version,
            model: cdef.model,
            start: cdef.start,
            end: cdef.end,
        });
    }
    // Several versions of one consent share a name; only name-version must be unique.
    let consent_ids: Vec<String> = consent_definitions
        .iter()
        .map(|c| format!("{}-{}", c.name, c.version))
        .collect();
    ensure_unique(
        "consent definition",
        consent_ids.iter().map(String::as_str),
    )?;

    let schedules = wire
        .schedules
        .into_iter()
        .map(|s| ScheduleData {
            name: s.name,
            version: s.version,
            onschedule_model: s.onschedule_model,
            offschedule_model: s.offschedule_model,
            consent_definitions: s.consent_definitions,
            visits: s.visits.into_iter().map(visit_to_domain).collect(),
        })
        .collect();

    let extensions = wire
        .extensions
        .into_iter()
        .map(|e| {
            let activation = match e.activation {
                Some(a) => ActivationData {
                    field: a.field,
                    equals: a.equals,
                },
                None => ActivationData::default_agreement()?,
            };
            Ok(ExtensionData {
                name: e.name,
                schedule: e.schedule,
                additional_timepoints: e.additional_timepoints,
                appended_visits: e.appended_visits.into_iter().map(visit_to_domain).collect(),
                activation,
            })
        })
        .collect::<ProtocolResult<Vec<_>>>()?;

    Ok(SchedulesFile {
        consent_definitions,
        schedules,
        extensions,
    })
}

fn visit_to_domain(v: VisitWire) -> VisitData {
    VisitData {
        title: v.title.unwrap_or_else(|| v.code.to_string()),
        code: v.code,
        timepoint: v.timepoint,
        relative_offset: v.relative_offset,
        lower_window: v.lower_window,
        upper_window: v.upper_window,
        upper_window_extended: v.upper_window_extended,
        window_gap_to_lower: v.window_gap_to_lower,
        allow_unscheduled: v.allow_unscheduled,
        required_crfs: v.required_crfs,
        optional_crfs: v.optional_crfs,
    }
}

impl ActivationData {
    /// `agrees_to_extension == "Yes"`, the activation used when a file gives none.
    pub fn default_agreement() -> ProtocolResult<Self> {
        let field = NonEmptyText::new("agrees_to_extension")
            .map_err(|e| ProtocolError::Translation(e.to_string()))?;
        Ok(Self {
            field,
            equals: serde_json::Value::String("Yes".into()),
        })
    }
}
