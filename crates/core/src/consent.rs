//! Consent definitions, subject consents and consent extensions.

use crate::metadata::{Fields, Predicate};
use crate::schedule::{ScheduleDefinition, VisitSpec};
use crate::{EdcError, EdcResult};
use chrono::{DateTime, Utc};
use edc_protocol::{ConsentDefinitionData, ExtensionData};
use edc_types::SubjectIdentifier;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A versioned consent form valid over a date range.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentDefinition {
    pub name: String,
    pub version: String,
    pub model: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl ConsentDefinition {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        model: impl Into<String>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> EdcResult<Self> {
        let name = name.into();
        let version = version.into();
        if start > end {
            return Err(EdcError::ConsentDefinitionError(format!(
                "consent definition '{name}-{version}' starts after it ends"
            )));
        }
        Ok(Self {
            name,
            version,
            model: model.into(),
            start,
            end,
        })
    }

    pub fn from_data(data: &ConsentDefinitionData) -> Self {
        Self {
            name: data.name.to_string(),
            version: data.version.to_string(),
            model: data.model.to_string(),
            start: data.start,
            end: data.end,
        }
    }

    /// `name-version`.
    pub fn id(&self) -> String {
        format!("{}-{}", self.name, self.version)
    }

    pub fn covers(&self, datetime: DateTime<Utc>) -> bool {
        self.start <= datetime && datetime <= self.end
    }

    /// The single definition among `definitions` covering `report_datetime`.
    ///
    /// # Errors
    ///
    /// Returns [`EdcError::ConsentDefinitionError`] if none or more than one definition covers
    /// the datetime.
    pub fn resolve<'a>(
        definitions: &[&'a ConsentDefinition],
        report_datetime: DateTime<Utc>,
    ) -> EdcResult<&'a ConsentDefinition> {
        let mut covering = definitions.iter().copied().filter(|c| c.covers(report_datetime));
        match (covering.next(), covering.next()) {
            (Some(cdef), None) => Ok(cdef),
            (None, _) => Err(EdcError::ConsentDefinitionError(format!(
                "no consent definition covers {report_datetime}"
            ))),
            (Some(first), Some(second)) => Err(EdcError::ConsentDefinitionError(format!(
                "ambiguous consent definitions for {report_datetime}: {} and {}",
                first.id(),
                second.id()
            ))),
        }
    }
}

/// A subject's signed consent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentRecord {
    pub subject_identifier: SubjectIdentifier,
    /// `name-version` of the consent definition.
    pub consent_definition: String,
    pub consent_datetime: DateTime<Utc>,
}

/// A captured consent-extension form. The latest one per extension governs activation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConsentExtensionRecord {
    pub subject_identifier: SubjectIdentifier,
    pub extension: String,
    pub report_datetime: DateTime<Utc>,
    pub fields: Fields,
}

/// Demographic and consent attributes of an enrolled subject, read by rule predicates.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegisteredSubject {
    pub subject_identifier: SubjectIdentifier,
    pub fields: Fields,
}

/// Conditionally extends a base schedule with extra timepoints.
///
/// `additional_timepoints` lists the gated timepoints: those already in the base schedule are
/// hidden until the extension is active; `appended_visits` add timepoints after the base's last
/// one.
#[derive(Clone, Debug)]
pub struct ConsentExtension {
    name: String,
    schedule_name: String,
    additional_timepoints: BTreeSet<u32>,
    appended_visits: Vec<VisitSpec>,
    activation: Predicate,
}

impl ConsentExtension {
    pub fn new(
        name: impl Into<String>,
        base: &ScheduleDefinition,
        additional_timepoints: impl IntoIterator<Item = u32>,
        appended_visits: Vec<VisitSpec>,
        activation: Predicate,
    ) -> EdcResult<Self> {
        let extension = Self {
            name: name.into(),
            schedule_name: base.name().to_string(),
            additional_timepoints: additional_timepoints.into_iter().collect(),
            appended_visits,
            activation,
        };
        extension.validate_against(base)?;
        Ok(extension)
    }

    pub fn from_data(data: &ExtensionData, base: &ScheduleDefinition) -> EdcResult<Self> {
        let appended_visits = data
            .appended_visits
            .iter()
            .map(VisitSpec::from_data)
            .collect::<EdcResult<Vec<_>>>()?;
        let activation = Predicate::field_equals(
            data.activation.field.as_str(),
            data.activation.equals.clone(),
        );
        Self::new(
            data.name.as_str(),
            base,
            data.additional_timepoints.iter().copied(),
            appended_visits,
            activation,
        )
    }

    pub fn with_activation(mut self, activation: Predicate) -> Self {
        self.activation = activation;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schedule_name(&self) -> &str {
        &self.schedule_name
    }

    pub fn additional_timepoints(&self) -> &BTreeSet<u32> {
        &self.additional_timepoints
    }

    pub fn appended_visits(&self) -> &[VisitSpec] {
        &self.appended_visits
    }

    /// True if the record's fields satisfy the activation predicate.
    ///
    /// A record without the activation field counts as not agreeing.
    pub fn is_active(&self, record: Option<&ConsentExtensionRecord>) -> EdcResult<bool> {
        let Some(record) = record else {
            return Ok(false);
        };
        match self.activation.evaluate(&record.fields) {
            Ok(active) => Ok(active),
            Err(EdcError::PredicateError(msg)) => {
                tracing::debug!("extension {} inactive: {}", self.name, msg);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Check the gated timepoints and appended visits against the base schedule.
    pub(crate) fn validate_against(&self, base: &ScheduleDefinition) -> EdcResult<()> {
        let invalid = |reason: String| {
            EdcError::InvalidInput(format!("consent extension '{}': {}", self.name, reason))
        };

        if self.schedule_name != base.name() {
            return Err(invalid(format!(
                "extends '{}', not '{}'",
                self.schedule_name,
                base.name()
            )));
        }
        if self.additional_timepoints.is_empty() {
            return Err(invalid("no additional timepoints".into()));
        }

        let last = base.last_timepoint();
        for visit in &self.appended_visits {
            if last.is_some_and(|last| visit.timepoint <= last) {
                return Err(invalid(format!(
                    "appended visit {} (timepoint {}) does not follow the base schedule",
                    visit.code, visit.timepoint
                )));
            }
            if base.visit(visit.code.as_str()).is_ok() {
                return Err(invalid(format!(
                    "appended visit {} already exists in the base schedule",
                    visit.code
                )));
            }
        }

        for timepoint in &self.additional_timepoints {
            let in_base = base.visit_at(*timepoint).is_some();
            let appended = self.appended_visits.iter().any(|v| v.timepoint == *timepoint);
            if !in_base && !appended {
                return Err(invalid(format!(
                    "timepoint {timepoint} is neither in the base schedule nor appended"
                )));
            }
        }
        // Appended visits are only ever visible through the extension.
        for visit in &self.appended_visits {
            if !self.additional_timepoints.contains(&visit.timepoint) {
                return Err(invalid(format!(
                    "appended visit {} (timepoint {}) is not listed in additional_timepoints",
                    visit.code, visit.timepoint
                )));
            }
        }
        Ok(())
    }
}
