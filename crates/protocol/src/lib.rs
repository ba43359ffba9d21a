//! Protocol definition files for the EDC kernel.
//!
//! A trial protocol is described on disk as a small set of YAML files:
//! - `schedules.yaml`: consent definitions, schedules with their visits, consent extensions
//! - `facilities.yaml`: clinic weekdays and daily capacity
//! - `holidays.yaml`: public holidays per country
//! - `rules.yaml`: CRF metadata rule groups
//!
//! This crate owns the strict wire models for those files and the translation into public,
//! domain-level data carriers. It does not interpret the data: interval strings, rule
//! consequences and predicate semantics are validated by `edc-core` when it builds its
//! registries.

pub mod facility;
pub mod rules;
pub mod schedule;

pub use facility::{FacilitiesFile, FacilityData, HolidayData, HolidaysFile};
pub use rules::{PredicateData, RuleData, RuleGroupData, RulesFile};
pub use schedule::{
    ActivationData, ConsentDefinitionData, ExtensionData, ScheduleData, SchedulesFile, VisitData,
};

use serde::de::DeserializeOwned;
use std::path::Path;

/// Errors returned by the `edc-protocol` boundary crate.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid YAML: {0}")]
    InvalidYaml(#[from] serde_yaml::Error),

    #[error("failed to read protocol file {}: {source}", .path.display())]
    Read {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{kind} schema mismatch at {path}: {message}")]
    SchemaMismatch {
        kind: &'static str,
        path: String,
        message: String,
    },

    #[error("translation error: {0}")]
    Translation(String),
}

/// Type alias for Results that can fail with a [`ProtocolError`].
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Deserialize YAML into a wire model, reporting the failing field path on mismatch.
///
/// `kind` names the file type in the error message (for example `"schedules"`).
pub(crate) fn parse_yaml<T: DeserializeOwned>(kind: &'static str, yaml_text: &str) -> ProtocolResult<T> {
    let deserializer = serde_yaml::Deserializer::from_str(yaml_text);

    serde_path_to_error::deserialize::<_, T>(deserializer).map_err(|err| {
        let path = err.path().to_string();
        let path = if path.is_empty() || path == "." {
            "<root>".to_string()
        } else {
            path
        };
        ProtocolError::SchemaMismatch {
            kind,
            path,
            message: err.into_inner().to_string(),
        }
    })
}

/// Read a protocol file into a string.
pub(crate) fn read_file(path: &Path) -> ProtocolResult<String> {
    std::fs::read_to_string(path).map_err(|source| ProtocolError::Read {
        path: path.to_path_buf(),
        source,
    })
}

/// Reject duplicate names within one file.
pub(crate) fn ensure_unique<'a>(
    kind: &str,
    names: impl IntoIterator<Item = &'a str>,
) -> ProtocolResult<()> {
    let mut seen = std::collections::BTreeSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(ProtocolError::InvalidInput(format!(
                "duplicate {kind} '{name}'"
            )));
        }
    }
    Ok(())
}
