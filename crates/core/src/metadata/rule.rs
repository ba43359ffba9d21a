use super::predicate::{FieldSource, Predicate};
use crate::{EdcError, EdcResult};
use edc_protocol::{RuleData, RuleGroupData};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// What a rule does to its target CRFs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Consequence {
    Required,
    NotRequired,
    /// Leave the current status alone.
    DoNothing,
}

impl Consequence {
    pub fn as_str(self) -> &'static str {
        match self {
            Consequence::Required => "REQUIRED",
            Consequence::NotRequired => "NOT_REQUIRED",
            Consequence::DoNothing => "DO_NOTHING",
        }
    }
}

impl fmt::Display for Consequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Consequence {
    type Err = EdcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "REQUIRED" => Ok(Consequence::Required),
            "NOT_REQUIRED" => Ok(Consequence::NotRequired),
            "DO_NOTHING" => Ok(Consequence::DoNothing),
            other => Err(EdcError::RuleLogicError(format!(
                "invalid rule consequence '{other}'. Expected one of REQUIRED, NOT_REQUIRED, DO_NOTHING"
            ))),
        }
    }
}

/// `status = consequence if predicate else alternative`, applied to every target CRF.
#[derive(Clone, Debug)]
pub struct Rule {
    name: String,
    predicate: Predicate,
    consequence: Consequence,
    alternative: Consequence,
    target_crfs: Vec<String>,
}

impl Rule {
    /// Build a rule. `consequence` and `alternative` are parsed here so that a malformed value
    /// fails at startup instead of at evaluation.
    ///
    /// # Errors
    ///
    /// Returns [`EdcError::RuleLogicError`] if either value is not a valid consequence, both are
    /// `DO_NOTHING`, or there are no target CRFs.
    pub fn new<I, S>(
        name: impl Into<String>,
        predicate: Predicate,
        consequence: &str,
        alternative: &str,
        target_crfs: I,
    ) -> EdcResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let name = name.into();
        let consequence: Consequence = consequence.parse()?;
        let alternative: Consequence = alternative.parse()?;
        if consequence == Consequence::DoNothing && alternative == Consequence::DoNothing {
            return Err(EdcError::RuleLogicError(format!(
                "rule '{name}' does nothing in either branch"
            )));
        }

        let target_crfs: Vec<String> = target_crfs.into_iter().map(Into::into).collect();
        if target_crfs.is_empty() {
            return Err(EdcError::RuleLogicError(format!(
                "rule '{name}' has no target CRFs"
            )));
        }

        Ok(Self {
            name,
            predicate,
            consequence,
            alternative,
            target_crfs,
        })
    }

    pub fn from_data(data: &RuleData) -> EdcResult<Self> {
        Self::new(
            data.name.as_str(),
            Predicate::from_data(&data.predicate),
            &data.consequence,
            &data.alternative,
            data.target_crfs.iter().map(|c| c.to_string()),
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target_crfs(&self) -> &[String] {
        &self.target_crfs
    }

    pub fn run(&self, source: &dyn FieldSource) -> EdcResult<Consequence> {
        Ok(if self.predicate.evaluate(source)? {
            self.consequence
        } else {
            self.alternative
        })
    }
}

/// Ordered rules registered together for one `(app_label, source_model)`.
#[derive(Clone, Debug)]
pub struct RuleGroup {
    app_label: String,
    source_model: Option<String>,
    rules: Vec<Rule>,
}

impl RuleGroup {
    /// `source_model` is `None` for rules that read the visit report itself.
    ///
    /// # Errors
    ///
    /// Returns [`EdcError::NoRulesError`] if `rules` is empty.
    pub fn new(
        app_label: impl Into<String>,
        source_model: Option<&str>,
        rules: Vec<Rule>,
    ) -> EdcResult<Self> {
        let app_label = app_label.into();
        if rules.is_empty() {
            return Err(EdcError::NoRulesError(format!(
                "{app_label}.{}",
                source_model.unwrap_or("visit")
            )));
        }
        Ok(Self {
            app_label,
            source_model: source_model.map(str::to_string),
            rules,
        })
    }

    pub fn from_data(data: &RuleGroupData) -> EdcResult<Self> {
        let rules = data
            .rules
            .iter()
            .map(Rule::from_data)
            .collect::<EdcResult<Vec<_>>>()?;
        Self::new(
            data.app_label.as_str(),
            data.source_model.as_ref().map(|m| m.as_str()),
            rules,
        )
    }

    pub fn app_label(&self) -> &str {
        &self.app_label
    }

    pub fn source_model(&self) -> Option<&str> {
        self.source_model.as_deref()
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Run every rule in registration order. A later rule's conclusion for a CRF replaces an
    /// earlier one, except `DO_NOTHING`, which leaves any earlier conclusion in place.
    pub fn evaluate(&self, source: &dyn FieldSource) -> EdcResult<BTreeMap<String, Consequence>> {
        let mut outcome = BTreeMap::new();
        for rule in &self.rules {
            let consequence = rule.run(source)?;
            tracing::debug!(
                "rule {}.{} -> {} for {:?}",
                self.app_label,
                rule.name(),
                consequence,
                rule.target_crfs()
            );
            if consequence == Consequence::DoNothing {
                continue;
            }
            for crf in rule.target_crfs() {
                outcome.insert(crf.clone(), consequence);
            }
        }
        Ok(outcome)
    }
}
