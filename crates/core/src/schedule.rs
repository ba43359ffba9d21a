//! Schedule definitions and the schedule registry.
//!
//! A [`ScheduleDefinition`] is the timeline template for a cohort: an ordered set of
//! [`VisitSpec`]s, each placed at a relative offset from the subject's baseline. Schedules are
//! built and registered at startup and are immutable once inside a [`ScheduleRegistry`].
//! Extended versions are separate schedules linked through `extends`, never edits in place.

use crate::consent::{ConsentDefinition, ConsentExtension};
use crate::interval::Interval;
use crate::{EdcError, EdcResult};
use chrono::{DateTime, Utc};
use edc_protocol::{ScheduleData, SchedulesFile, VisitData};
use edc_types::VisitCode;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

// ============================================================================
// VISIT SPEC
// ============================================================================

/// One visit of a schedule.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VisitSpec {
    pub code: VisitCode,
    pub title: String,
    /// Ordinal position; unique within a schedule.
    pub timepoint: u32,
    /// Signed offset from the baseline datetime.
    pub relative_offset: Interval,
    pub lower_window: Interval,
    pub upper_window: Interval,
    /// Replaces `upper_window` when bounding unscheduled visits after the last visit.
    pub upper_window_extended: Option<Interval>,
    /// Widen the lower bound back to the previous visit's upper bound.
    pub window_gap_to_lower: bool,
    pub allow_unscheduled: bool,
    /// CRFs that start out REQUIRED.
    pub required_crfs: Vec<String>,
    /// CRFs that start out NOT_REQUIRED.
    pub optional_crfs: Vec<String>,
}

impl VisitSpec {
    pub fn new(
        code: &str,
        timepoint: u32,
        relative_offset: Interval,
        lower_window: Interval,
        upper_window: Interval,
    ) -> EdcResult<Self> {
        let code = VisitCode::new(code)?;
        if lower_window.is_negative() || upper_window.is_negative() {
            return Err(EdcError::InvalidInput(format!(
                "visit {code}: window intervals cannot be negative"
            )));
        }
        for interval in [&relative_offset, &lower_window, &upper_window] {
            interval
                .check_bounded()
                .map_err(|e| EdcError::InvalidInput(format!("visit {code}: {e}")))?;
        }

        Ok(Self {
            title: code.to_string(),
            code,
            timepoint,
            relative_offset,
            lower_window,
            upper_window,
            upper_window_extended: None,
            window_gap_to_lower: false,
            allow_unscheduled: true,
            required_crfs: Vec::new(),
            optional_crfs: Vec::new(),
        })
    }

    /// Build a visit from its protocol file entry, parsing the interval strings.
    pub fn from_data(data: &VisitData) -> EdcResult<Self> {
        let relative_offset: Interval = data.relative_offset.parse()?;
        let lower_window = Interval::parse_window(&data.lower_window)?;
        let upper_window = Interval::parse_window(&data.upper_window)?;
        let upper_window_extended = data
            .upper_window_extended
            .as_deref()
            .map(Interval::parse_window)
            .transpose()?;

        let mut visit = Self::new(
            data.code.as_str(),
            data.timepoint,
            relative_offset,
            lower_window,
            upper_window,
        )?;
        visit.title = data.title.clone();
        visit.upper_window_extended = upper_window_extended;
        visit.window_gap_to_lower = data.window_gap_to_lower;
        visit.allow_unscheduled = data.allow_unscheduled;
        visit.required_crfs = data.required_crfs.iter().map(|c| c.to_string()).collect();
        visit.optional_crfs = data.optional_crfs.iter().map(|c| c.to_string()).collect();
        Ok(visit)
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_required_crfs<I, S>(mut self, crfs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_crfs = crfs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_optional_crfs<I, S>(mut self, crfs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.optional_crfs = crfs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_upper_window_extended(mut self, extended: Interval) -> Self {
        self.upper_window_extended = Some(extended);
        self
    }

    pub fn with_window_gap_to_lower(mut self) -> Self {
        self.window_gap_to_lower = true;
        self
    }

    pub fn without_unscheduled(mut self) -> Self {
        self.allow_unscheduled = false;
        self
    }

    /// The ideal datetime of this visit: `baseline + relative_offset`.
    pub fn timepoint_datetime(&self, baseline: DateTime<Utc>) -> DateTime<Utc> {
        self.relative_offset.after(baseline)
    }

    /// True if `crf` is one of this visit's CRFs, required or optional.
    pub fn schedules_crf(&self, crf: &str) -> bool {
        self.required_crfs.iter().any(|c| c == crf) || self.optional_crfs.iter().any(|c| c == crf)
    }
}

// ============================================================================
// SCHEDULE DEFINITION
// ============================================================================

/// A named, versioned, ordered collection of visits.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScheduleDefinition {
    name: String,
    version: String,
    onschedule_model: String,
    offschedule_model: String,
    consent_definitions: BTreeSet<String>,
    extends: Option<String>,
    // Kept sorted by timepoint.
    visits: Vec<VisitSpec>,
}

impl ScheduleDefinition {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        onschedule_model: impl Into<String>,
        offschedule_model: impl Into<String>,
    ) -> EdcResult<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(EdcError::InvalidInput("schedule name cannot be empty".into()));
        }
        Ok(Self {
            name,
            version: version.into(),
            onschedule_model: onschedule_model.into(),
            offschedule_model: offschedule_model.into(),
            consent_definitions: BTreeSet::new(),
            extends: None,
            visits: Vec::new(),
        })
    }

    /// Build a schedule from its protocol file entry.
    pub fn from_data(data: &ScheduleData) -> EdcResult<Self> {
        let mut schedule = Self::new(
            data.name.as_str(),
            data.version.as_str(),
            data.onschedule_model.as_str(),
            data.offschedule_model.as_str(),
        )?;
        for consent in &data.consent_definitions {
            schedule.consent_definitions.insert(consent.clone());
        }
        for visit in &data.visits {
            schedule.register(VisitSpec::from_data(visit)?)?;
        }
        Ok(schedule)
    }

    /// Accept subjects consented under `consent_id` (`name-version`).
    pub fn with_consent_definition(mut self, consent_id: impl Into<String>) -> Self {
        self.consent_definitions.insert(consent_id.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn onschedule_model(&self) -> &str {
        &self.onschedule_model
    }

    pub fn offschedule_model(&self) -> &str {
        &self.offschedule_model
    }

    pub fn consent_definitions(&self) -> &BTreeSet<String> {
        &self.consent_definitions
    }

    /// Name of the schedule this one was derived from.
    pub fn extends(&self) -> Option<&str> {
        self.extends.as_deref()
    }

    /// Add a visit.
    ///
    /// # Errors
    ///
    /// Returns [`EdcError::InvalidSchedule`] if the code or timepoint is already used, or if the
    /// visit's relative offset would break the rule that offsets increase with timepoints.
    pub fn register(&mut self, visit: VisitSpec) -> EdcResult<()> {
        let invalid = |reason: String| EdcError::InvalidSchedule {
            schedule: self.name.clone(),
            reason,
        };

        if self.visits.iter().any(|v| v.code == visit.code) {
            return Err(invalid(format!("duplicate visit code {}", visit.code)));
        }
        if self.visits.iter().any(|v| v.timepoint == visit.timepoint) {
            return Err(invalid(format!(
                "duplicate timepoint {} (visit {})",
                visit.timepoint, visit.code
            )));
        }

        let offset = visit.relative_offset.days();
        for existing in &self.visits {
            let existing_offset = existing.relative_offset.days();
            let ordered = if existing.timepoint < visit.timepoint {
                existing_offset < offset
            } else {
                existing_offset > offset
            };
            if !ordered {
                return Err(invalid(format!(
                    "visit {} (timepoint {}, offset {}) is out of order with visit {} (timepoint {}, offset {})",
                    visit.code,
                    visit.timepoint,
                    visit.relative_offset,
                    existing.code,
                    existing.timepoint,
                    existing.relative_offset
                )));
            }
        }

        let position = self
            .visits
            .partition_point(|v| v.timepoint < visit.timepoint);
        self.visits.insert(position, visit);
        Ok(())
    }

    /// Visits in ascending timepoint order.
    pub fn timepoints_ordered(&self) -> std::slice::Iter<'_, VisitSpec> {
        self.visits.iter()
    }

    pub fn len(&self) -> usize {
        self.visits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.visits.is_empty()
    }

    pub fn first_visit(&self) -> Option<&VisitSpec> {
        self.visits.first()
    }

    pub fn visit(&self, code: &str) -> EdcResult<&VisitSpec> {
        self.visits
            .iter()
            .find(|v| v.code.as_str() == code)
            .ok_or_else(|| EdcError::VisitNotFound {
                schedule: self.name.clone(),
                visit_code: code.to_string(),
            })
    }

    pub fn visit_at(&self, timepoint: u32) -> Option<&VisitSpec> {
        self.visits.iter().find(|v| v.timepoint == timepoint)
    }

    pub fn previous_visit(&self, code: &str) -> Option<&VisitSpec> {
        let index = self.visits.iter().position(|v| v.code.as_str() == code)?;
        index.checked_sub(1).and_then(|i| self.visits.get(i))
    }

    pub fn next_visit(&self, code: &str) -> Option<&VisitSpec> {
        let index = self.visits.iter().position(|v| v.code.as_str() == code)?;
        self.visits.get(index + 1)
    }

    pub fn last_timepoint(&self) -> Option<u32> {
        self.visits.last().map(|v| v.timepoint)
    }

    /// A new schedule with the extension's appended visits added.
    ///
    /// The result is named `<base>.<extension>` and `extends` the base.
    pub fn extended_by(&self, extension: &ConsentExtension) -> EdcResult<Self> {
        self.ensure_extension_targets_me(extension)?;

        let mut extended = self.clone();
        extended.name = format!("{}.{}", self.name, extension.name());
        extended.extends = Some(self.extends.clone().unwrap_or_else(|| self.name.clone()));
        for visit in extension.appended_visits() {
            extended.register(visit.clone())?;
        }
        Ok(extended)
    }

    /// A copy of this schedule without the timepoints the extension gates.
    pub fn without_extension(&self, extension: &ConsentExtension) -> EdcResult<Self> {
        self.ensure_extension_targets_me(extension)?;

        let mut gated = self.clone();
        gated
            .visits
            .retain(|v| !extension.additional_timepoints().contains(&v.timepoint));
        Ok(gated)
    }

    fn ensure_extension_targets_me(&self, extension: &ConsentExtension) -> EdcResult<()> {
        let root = self.extends.as_deref().unwrap_or(&self.name);
        if extension.schedule_name() != root {
            return Err(EdcError::InvalidInput(format!(
                "consent extension '{}' extends schedule '{}', not '{}'",
                extension.name(),
                extension.schedule_name(),
                self.name
            )));
        }
        Ok(())
    }
}

// ============================================================================
// SCHEDULE REGISTRY
// ============================================================================

/// Startup registry of consent definitions, schedules and consent extensions.
///
/// Build one at startup, wrap it in an `Arc` and pass it to the services that need it. Tests
/// build their own registry or call [`ScheduleRegistry::reset`] between cases.
#[derive(Debug, Default)]
pub struct ScheduleRegistry {
    consent_definitions: BTreeMap<String, ConsentDefinition>,
    schedules: BTreeMap<String, Arc<ScheduleDefinition>>,
    extensions: BTreeMap<String, Arc<ConsentExtension>>,
}

impl ScheduleRegistry {
    pub fn init() -> Self {
        Self::default()
    }

    /// Drop every registration.
    pub fn reset(&mut self) {
        self.consent_definitions.clear();
        self.schedules.clear();
        self.extensions.clear();
    }

    /// Build a registry from a parsed `schedules.yaml`.
    pub fn from_file(file: &SchedulesFile) -> EdcResult<Self> {
        let mut registry = Self::init();
        for cdef in &file.consent_definitions {
            registry.register_consent_definition(ConsentDefinition::from_data(cdef))?;
        }
        for data in &file.schedules {
            registry.register(ScheduleDefinition::from_data(data)?)?;
        }
        for data in &file.extensions {
            let base = registry.get(data.schedule.as_str())?;
            let extension = ConsentExtension::from_data(data, &base)?;
            registry.register_extension(extension)?;
        }
        Ok(registry)
    }

    pub fn register_consent_definition(&mut self, cdef: ConsentDefinition) -> EdcResult<()> {
        let id = cdef.id();
        if self.consent_definitions.contains_key(&id) {
            return Err(EdcError::AlreadyRegistered(format!("consent definition {id}")));
        }
        self.consent_definitions.insert(id, cdef);
        Ok(())
    }

    /// Register a schedule. Its consent definitions must already be registered.
    pub fn register(&mut self, schedule: ScheduleDefinition) -> EdcResult<Arc<ScheduleDefinition>> {
        if self.schedules.contains_key(schedule.name()) {
            return Err(EdcError::AlreadyRegistered(format!(
                "schedule {}",
                schedule.name()
            )));
        }
        if let Some(unknown) = schedule
            .consent_definitions()
            .iter()
            .find(|id| !self.consent_definitions.contains_key(*id))
        {
            return Err(EdcError::ConsentDefinitionError(format!(
                "schedule '{}' accepts unknown consent definition '{}'",
                schedule.name(),
                unknown
            )));
        }

        tracing::debug!(
            "registered schedule {} v{} with {} visits",
            schedule.name(),
            schedule.version(),
            schedule.len()
        );
        let schedule = Arc::new(schedule);
        self.schedules
            .insert(schedule.name().to_string(), schedule.clone());
        Ok(schedule)
    }

    /// Register a consent extension against an already registered schedule.
    pub fn register_extension(&mut self, extension: ConsentExtension) -> EdcResult<Arc<ConsentExtension>> {
        if self.extensions.contains_key(extension.name()) {
            return Err(EdcError::AlreadyRegistered(format!(
                "consent extension {}",
                extension.name()
            )));
        }
        let base = self.get(extension.schedule_name())?;
        extension.validate_against(&base)?;

        let extension = Arc::new(extension);
        self.extensions
            .insert(extension.name().to_string(), extension.clone());
        Ok(extension)
    }

    pub fn get(&self, name: &str) -> EdcResult<Arc<ScheduleDefinition>> {
        self.schedules
            .get(name)
            .cloned()
            .ok_or_else(|| EdcError::ScheduleNotFound(name.to_string()))
    }

    pub fn schedules(&self) -> impl Iterator<Item = &Arc<ScheduleDefinition>> {
        self.schedules.values()
    }

    pub fn extension(&self, name: &str) -> EdcResult<Arc<ConsentExtension>> {
        self.extensions.get(name).cloned().ok_or_else(|| {
            EdcError::InvalidInput(format!("consent extension '{name}' is not registered"))
        })
    }

    /// Extensions layered on the named schedule, in name order.
    pub fn extensions_for(&self, schedule_name: &str) -> Vec<Arc<ConsentExtension>> {
        self.extensions
            .values()
            .filter(|e| e.schedule_name() == schedule_name)
            .cloned()
            .collect()
    }

    pub fn consent_definition(&self, id: &str) -> Option<&ConsentDefinition> {
        self.consent_definitions.get(id)
    }

    /// Consent definitions the schedule accepts.
    pub fn consent_definitions_for(&self, schedule: &ScheduleDefinition) -> Vec<&ConsentDefinition> {
        schedule
            .consent_definitions()
            .iter()
            .filter_map(|id| self.consent_definitions.get(id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Predicate;

    fn visit(code: &str, timepoint: u32, offset_days: i64) -> VisitSpec {
        VisitSpec::new(
            code,
            timepoint,
            Interval::of_days(offset_days),
            Interval::of_days(3),
            Interval::of_days(3),
        )
        .unwrap()
    }

    fn schedule() -> ScheduleDefinition {
        let mut schedule =
            ScheduleDefinition::new("schedule1", "1", "trial_prn.onschedule", "trial_prn.offschedule")
                .unwrap();
        schedule.register(visit("1000", 0, 0)).unwrap();
        schedule.register(visit("2000", 1, 28)).unwrap();
        schedule.register(visit("3000", 2, 56)).unwrap();
        schedule
    }

    #[test]
    fn test_register_rejects_duplicate_code() {
        let mut schedule = schedule();
        let err = schedule.register(visit("2000", 5, 200)).expect_err("duplicate code");
        assert!(matches!(err, EdcError::InvalidSchedule { reason, .. } if reason.contains("duplicate visit code")));
    }

    #[test]
    fn test_register_rejects_duplicate_timepoint() {
        let mut schedule = schedule();
        let err = schedule.register(visit("4000", 1, 200)).expect_err("duplicate timepoint");
        assert!(matches!(err, EdcError::InvalidSchedule { reason, .. } if reason.contains("duplicate timepoint")));
    }

    #[test]
    fn test_register_rejects_out_of_order_offset() {
        let mut schedule = schedule();
        let err = schedule.register(visit("4000", 3, 14)).expect_err("offset out of order");
        assert!(matches!(err, EdcError::InvalidSchedule { reason, .. } if reason.contains("out of order")));
    }

    #[test]
    fn test_timepoints_ordered_is_sorted_and_restartable() {
        let mut schedule =
            ScheduleDefinition::new("schedule1", "1", "a.on", "a.off").unwrap();
        schedule.register(visit("3000", 2, 56)).unwrap();
        schedule.register(visit("1000", 0, 0)).unwrap();
        schedule.register(visit("2000", 1, 28)).unwrap();

        let first: Vec<u32> = schedule.timepoints_ordered().map(|v| v.timepoint).collect();
        let second: Vec<u32> = schedule.timepoints_ordered().map(|v| v.timepoint).collect();
        assert_eq!(first, vec![0, 1, 2]);
        assert_eq!(first, second);
    }

    #[test]
    fn test_previous_and_next_visit() {
        let schedule = schedule();
        assert_eq!(schedule.previous_visit("2000").unwrap().code.as_str(), "1000");
        assert_eq!(schedule.next_visit("2000").unwrap().code.as_str(), "3000");
        assert!(schedule.previous_visit("1000").is_none());
        assert!(schedule.next_visit("3000").is_none());
        assert!(matches!(
            schedule.visit("9999"),
            Err(EdcError::VisitNotFound { .. })
        ));
    }

    #[test]
    fn test_extended_by_creates_linked_schedule() {
        let base = schedule();
        let extension = ConsentExtension::new(
            "ext1",
            &base,
            vec![3],
            vec![visit("4000", 3, 84)],
            Predicate::field_equals("agrees_to_extension", "Yes"),
        )
        .unwrap();

        let extended = base.extended_by(&extension).unwrap();

        assert_eq!(extended.name(), "schedule1.ext1");
        assert_eq!(extended.extends(), Some("schedule1"));
        assert_eq!(extended.len(), 4);
        assert_eq!(base.len(), 3);
        assert_eq!(base.without_extension(&extension).unwrap().len(), 3);
    }

    #[test]
    fn test_registry_rejects_duplicates_and_unknown_consent() {
        let mut registry = ScheduleRegistry::init();
        registry.register(schedule()).unwrap();

        let err = registry.register(schedule()).expect_err("duplicate");
        assert!(matches!(err, EdcError::AlreadyRegistered(_)));

        let other = ScheduleDefinition::new("schedule2", "1", "a.on", "a.off")
            .unwrap()
            .with_consent_definition("main-9");
        let err = registry.register(other).expect_err("unknown consent");
        assert!(matches!(err, EdcError::ConsentDefinitionError(_)));

        assert!(matches!(
            registry.get("missing"),
            Err(EdcError::ScheduleNotFound(_))
        ));

        registry.reset();
        assert!(registry.get("schedule1").is_err());
    }

    #[test]
    fn test_registry_from_file() {
        let file = SchedulesFile::parse(
            r#"
consent_definitions:
  - name: main
    version: "1"
    model: c.subjectconsent
    start: 2024-01-01T00:00:00Z
    end: 2030-12-31T23:59:59Z
schedules:
  - name: schedule1
    version: "1"
    onschedule_model: a.onschedule
    offschedule_model: a.offschedule
    consent_definitions: [main-1]
    visits:
      - code: "1000"
        timepoint: 0
        relative_offset: 0D
        lower_window: 0D
        upper_window: 0D
      - code: "2000"
        timepoint: 1
        relative_offset: 1M
        lower_window: 7D
        upper_window: 12h
extensions:
  - name: ext1
    schedule: schedule1
    additional_timepoints: [2]
    appended_visits:
      - code: "3000"
        timepoint: 2
        relative_offset: 3M
        lower_window: 14D
        upper_window: 14D
"#,
        )
        .unwrap();

        let registry = ScheduleRegistry::from_file(&file).unwrap();
        let schedule = registry.get("schedule1").unwrap();
        let visit = schedule.visit("2000").unwrap();
        assert_eq!(visit.relative_offset.days(), 30);
        assert_eq!(visit.upper_window.days(), 1);
        assert_eq!(registry.extensions_for("schedule1").len(), 1);
        assert_eq!(registry.consent_definitions_for(&schedule).len(), 1);
    }

    #[test]
    fn test_registry_from_file_rejects_bad_interval() {
        let file = SchedulesFile::parse(
            r#"
schedules:
  - name: schedule1
    version: "1"
    onschedule_model: a.onschedule
    offschedule_model: a.offschedule
    visits:
      - code: "1000"
        timepoint: 0
        relative_offset: 0D
        lower_window: -2D
        upper_window: 0D
"#,
        )
        .unwrap();
        let err = ScheduleRegistry::from_file(&file).expect_err("negative window");
        assert!(matches!(err, EdcError::InvalidInput(_)));
    }

    #[test]
    fn test_registry_from_file_rejects_oversized_offset() {
        let file = SchedulesFile::parse(
            r#"
schedules:
  - name: schedule1
    version: "1"
    onschedule_model: a.onschedule
    offschedule_model: a.offschedule
    visits:
      - code: "1000"
        timepoint: 0
        relative_offset: 99999999999999999Y
        lower_window: 0D
        upper_window: 0D
"#,
        )
        .unwrap();
        let err = ScheduleRegistry::from_file(&file).expect_err("offset overflows");
        assert!(matches!(err, EdcError::InvalidInput(_)));

        let err = VisitSpec::new(
            "1000",
            0,
            Interval::of_years(1_000_000),
            Interval::ZERO,
            Interval::ZERO,
        )
        .expect_err("offset beyond the interval limit");
        assert!(matches!(err, EdcError::InvalidInput(_)));
    }
}
