//! CRF metadata rule files (`rules.yaml`).
//!
//! Only declarative predicates can be written in a file: field equality and field membership.
//! Rules needing arbitrary logic are registered in code.
//!
//! ```yaml
//! rule_groups:
//!   - app_label: trial_subject
//!     source_model: trial_subject.subjectvisit
//!     rules:
//!       - name: male_only
//!         predicate:
//!           field_equals: { field: gender, value: M }
//!         consequence: REQUIRED
//!         alternative: NOT_REQUIRED
//!         target_crfs: [trial_subject.prostate]
//! ```

use crate::{parse_yaml, read_file, ProtocolError, ProtocolResult};
use edc_types::NonEmptyText;
use serde::Deserialize;
use std::path::Path;

/// Declarative predicate from a rule file.
#[derive(Clone, Debug, PartialEq)]
pub enum PredicateData {
    FieldEquals {
        field: NonEmptyText,
        value: serde_json::Value,
    },
    FieldIn {
        field: NonEmptyText,
        values: Vec<serde_json::Value>,
    },
}

/// One rule. `consequence` and `alternative` are kept as written; `edc-core` validates them.
#[derive(Clone, Debug, PartialEq)]
pub struct RuleData {
    pub name: NonEmptyText,
    pub predicate: PredicateData,
    pub consequence: String,
    pub alternative: String,
    pub target_crfs: Vec<NonEmptyText>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RuleGroupData {
    pub app_label: NonEmptyText,
    /// `None` when the rules read the visit report itself.
    pub source_model: Option<NonEmptyText>,
    pub rules: Vec<RuleData>,
}

/// Parsed contents of a `rules.yaml` file.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct RulesFile {
    pub rule_groups: Vec<RuleGroupData>,
}

impl RulesFile {
    pub fn parse(yaml_text: &str) -> ProtocolResult<Self> {
        let wire: RulesFileWire = parse_yaml("rules", yaml_text)?;

        let rule_groups = wire
            .rule_groups
            .into_iter()
            .map(|group| {
                let rules = group
                    .rules
                    .into_iter()
                    .map(rule_to_domain)
                    .collect::<ProtocolResult<Vec<_>>>()?;
                Ok(RuleGroupData {
                    app_label: group.app_label,
                    source_model: group.source_model,
                    rules,
                })
            })
            .collect::<ProtocolResult<Vec<_>>>()?;

        Ok(Self { rule_groups })
    }

    pub fn load(path: &Path) -> ProtocolResult<Self> {
        Self::parse(&read_file(path)?)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RulesFileWire {
    #[serde(default)]
    rule_groups: Vec<RuleGroupWire>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleGroupWire {
    app_label: NonEmptyText,
    #[serde(default)]
    source_model: Option<NonEmptyText>,
    #[serde(default)]
    rules: Vec<RuleWire>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleWire {
    name: NonEmptyText,
    predicate: PredicateWire,
    consequence: String,
    alternative: String,
    target_crfs: Vec<NonEmptyText>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
enum PredicateWire {
    FieldEquals {
        field: NonEmptyText,
        value: serde_json::Value,
    },
    FieldIn {
        field: NonEmptyText,
        values: Vec<serde_json::Value>,
    },
}

fn rule_to_domain(rule: RuleWire) -> ProtocolResult<RuleData> {
    if rule.target_crfs.is_empty() {
        return Err(ProtocolError::InvalidInput(format!(
            "rule '{}' has no target_crfs",
            rule.name
        )));
    }

    let predicate = match rule.predicate {
        PredicateWire::FieldEquals { field, value } => PredicateData::FieldEquals { field, value },
        PredicateWire::FieldIn { field, values } => {
            if values.is_empty() {
                return Err(ProtocolError::InvalidInput(format!(
                    "rule '{}' field_in predicate has no values",
                    rule.name
                )));
            }
            PredicateData::FieldIn { field, values }
        }
    };

    Ok(RuleData {
        name: rule.name,
        predicate,
        consequence: rule.consequence,
        alternative: rule.alternative,
        target_crfs: rule.target_crfs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_rule_groups() {
        let input = r#"
rule_groups:
  - app_label: trial_subject
    rules:
      - name: male_only
        predicate:
          field_equals: { field: gender, value: M }
        consequence: REQUIRED
        alternative: NOT_REQUIRED
        target_crfs: [trial_subject.prostate]
  - app_label: trial_subject
    source_model: trial_subject.bloodresult
    rules:
      - name: abnormal_results
        predicate:
          field_in: { field: grade, values: [3, 4] }
        consequence: REQUIRED
        alternative: DO_NOTHING
        target_crfs: [trial_subject.adverseevent]
"#;
        let file = RulesFile::parse(input).expect("parse yaml");
        assert_eq!(file.rule_groups.len(), 2);
        assert!(file.rule_groups[0].source_model.is_none());

        let rule = &file.rule_groups[1].rules[0];
        assert_eq!(
            rule.predicate,
            PredicateData::FieldIn {
                field: NonEmptyText::new("grade").unwrap(),
                values: vec![json!(3), json!(4)],
            }
        );
        assert_eq!(rule.alternative, "DO_NOTHING");
    }

    #[test]
    fn test_rule_without_targets_rejected() {
        let input = r#"
rule_groups:
  - app_label: trial_subject
    rules:
      - name: empty
        predicate:
          field_equals: { field: gender, value: M }
        consequence: REQUIRED
        alternative: NOT_REQUIRED
        target_crfs: []
"#;
        let err = RulesFile::parse(input).expect_err("should reject");
        assert!(matches!(err, ProtocolError::InvalidInput(msg) if msg.contains("no target_crfs")));
    }

    #[test]
    fn test_unknown_predicate_kind_rejected() {
        let input = r#"
rule_groups:
  - app_label: trial_subject
    rules:
      - name: weird
        predicate:
          field_matches: { field: gender, value: M }
        consequence: REQUIRED
        alternative: NOT_REQUIRED
        target_crfs: [a.b]
"#;
        assert!(matches!(
            RulesFile::parse(input),
            Err(ProtocolError::SchemaMismatch { .. })
        ));
    }
}
