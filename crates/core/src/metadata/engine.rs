use super::predicate::{Fields, RuleEvaluationContext};
use super::rule::{Consequence, RuleGroup};
use super::{CrfMetadata, MetadataStatus};
use crate::appointment::{Appointment, VisitKey};
use crate::clock::Clock;
use crate::schedule::VisitSpec;
use crate::store::{MetadataStore, VisitReport, VisitReportStore};
use crate::{EdcError, EdcResult};
use edc_protocol::RulesFile;
use std::sync::Arc;

/// Rule groups keyed by `(app_label, source_model)`, kept in registration order.
#[derive(Debug, Default)]
pub struct RuleGroupRegistry {
    groups: Vec<RuleGroup>,
}

impl RuleGroupRegistry {
    pub fn init() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.groups.clear();
    }

    pub fn from_file(file: &RulesFile) -> EdcResult<Self> {
        let mut registry = Self::init();
        for data in &file.rule_groups {
            registry.register(RuleGroup::from_data(data)?)?;
        }
        Ok(registry)
    }

    /// # Errors
    ///
    /// Returns [`EdcError::AlreadyRegistered`] if a group with the same key exists.
    pub fn register(&mut self, group: RuleGroup) -> EdcResult<()> {
        let taken = self.groups.iter().any(|g| {
            g.app_label() == group.app_label() && g.source_model() == group.source_model()
        });
        if taken {
            return Err(EdcError::AlreadyRegistered(format!(
                "rule group {}.{}",
                group.app_label(),
                group.source_model().unwrap_or("visit")
            )));
        }
        tracing::debug!(
            "registered rule group {} ({} rules)",
            group.app_label(),
            group.rules().len()
        );
        self.groups.push(group);
        Ok(())
    }

    pub fn groups(&self) -> &[RuleGroup] {
        &self.groups
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

/// Creates and re-evaluates CRF metadata for appointments.
#[derive(Clone)]
pub struct MetadataRuleEngine {
    rules: Arc<RuleGroupRegistry>,
    metadata: Arc<dyn MetadataStore>,
    reports: Arc<dyn VisitReportStore>,
    clock: Arc<dyn Clock>,
}

impl MetadataRuleEngine {
    pub fn new(
        rules: Arc<RuleGroupRegistry>,
        metadata: Arc<dyn MetadataStore>,
        reports: Arc<dyn VisitReportStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            rules,
            metadata,
            reports,
            clock,
        }
    }

    /// Insert default entries for the visit's CRFs that have none yet.
    pub fn create_default_metadata(&self, key: &VisitKey, visit: &VisitSpec) -> EdcResult<()> {
        let now = self.clock.now();
        let defaults = visit
            .required_crfs
            .iter()
            .map(|crf| (crf, MetadataStatus::Required))
            .chain(
                visit
                    .optional_crfs
                    .iter()
                    .map(|crf| (crf, MetadataStatus::NotRequired)),
            );
        for (crf, status) in defaults {
            if self.metadata.get_metadata(key, crf)?.is_none() {
                self.metadata.upsert_metadata(CrfMetadata {
                    key: key.clone(),
                    crf: crf.clone(),
                    status,
                    modified: now,
                })?;
            }
        }
        Ok(())
    }

    /// Run rule groups for an appointment and upsert the resulting metadata.
    ///
    /// With `source_model` set only groups sourced on that model run. Nothing happens until the
    /// visit report is captured. Returns the number of entries written.
    pub fn evaluate(
        &self,
        appointment: &Appointment,
        visit: &VisitSpec,
        registered_subject: &Fields,
        source_model: Option<&str>,
    ) -> EdcResult<usize> {
        let Some(report) = self.reports.visit_report(appointment.id)? else {
            tracing::debug!("no visit report for {}; rules not run", appointment.key);
            return Ok(0);
        };
        let conclusions = self.conclusions(appointment, &report, registered_subject, source_model)?;
        self.apply_all(&appointment.key, visit, conclusions)
    }

    /// What the rule groups conclude for `report`, in group order. Writes nothing, so a failing
    /// predicate leaves the metadata untouched.
    pub fn conclusions(
        &self,
        appointment: &Appointment,
        report: &VisitReport,
        registered_subject: &Fields,
        source_model: Option<&str>,
    ) -> EdcResult<Vec<(String, Consequence)>> {
        let mut conclusions = Vec::new();
        for group in self.rules.groups() {
            if source_model.is_some() && group.source_model() != source_model {
                continue;
            }

            let record = match group.source_model() {
                Some(model) => match self.reports.crf_record(appointment.id, model)? {
                    Some(record) => Some(record),
                    None => {
                        tracing::debug!(
                            "{} not captured for {}; skipping rule group {}",
                            model,
                            appointment.key,
                            group.app_label()
                        );
                        continue;
                    }
                },
                None => None,
            };

            let model_name = group.source_model().unwrap_or(group.app_label());
            let mut context =
                RuleEvaluationContext::new(model_name, &report.fields, registered_subject);
            if let Some(record) = &record {
                context = context.with_source(&record.fields);
            }
            conclusions.extend(group.evaluate(&context)?);
        }
        Ok(conclusions)
    }

    /// Upsert the metadata for a list of conclusions. Returns the number of entries written.
    pub fn apply_all(
        &self,
        key: &VisitKey,
        visit: &VisitSpec,
        conclusions: Vec<(String, Consequence)>,
    ) -> EdcResult<usize> {
        let mut written = 0;
        for (crf, consequence) in conclusions {
            written += self.apply(key, visit, &crf, consequence)?;
        }
        Ok(written)
    }

    /// True if any of the visit's CRFs is still `REQUIRED`.
    pub fn has_required(&self, key: &VisitKey) -> EdcResult<bool> {
        Ok(self
            .metadata
            .metadata_for_visit(key)?
            .iter()
            .any(|m| m.status == MetadataStatus::Required))
    }

    /// Mark a CRF as keyed.
    pub fn mark_keyed(&self, key: &VisitKey, crf: &str) -> EdcResult<()> {
        self.metadata.upsert_metadata(CrfMetadata {
            key: key.clone(),
            crf: crf.to_string(),
            status: MetadataStatus::Keyed,
            modified: self.clock.now(),
        })
    }

    fn apply(
        &self,
        key: &VisitKey,
        visit: &VisitSpec,
        crf: &str,
        consequence: Consequence,
    ) -> EdcResult<usize> {
        let status = match consequence {
            Consequence::Required => MetadataStatus::Required,
            Consequence::NotRequired => MetadataStatus::NotRequired,
            Consequence::DoNothing => return Ok(0),
        };
        if !visit.schedules_crf(crf) {
            return Ok(0);
        }

        let existing = self.metadata.get_metadata(key, crf)?;
        match existing {
            Some(entry) if entry.status == MetadataStatus::Keyed => Ok(0),
            Some(entry) if entry.status == status => Ok(0),
            _ => {
                self.metadata.upsert_metadata(CrfMetadata {
                    key: key.clone(),
                    crf: crf.to_string(),
                    status,
                    modified: self.clock.now(),
                })?;
                Ok(1)
            }
        }
    }
}
