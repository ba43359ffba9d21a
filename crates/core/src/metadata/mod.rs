//! CRF metadata: which case report forms a visit requires.
//!
//! Every scheduled CRF of a visit gets a metadata entry when the visit report is captured:
//! required CRFs start as `REQUIRED`, optional CRFs as `NOT_REQUIRED`. Rule groups then move
//! entries between those two states. Keying a CRF marks it `KEYED`, which rules never change.

mod engine;
mod predicate;
mod rule;

pub use engine::{MetadataRuleEngine, RuleGroupRegistry};
pub use predicate::{CustomPredicate, FieldSource, Fields, Predicate, RuleEvaluationContext};
pub use rule::{Consequence, Rule, RuleGroup};

use crate::appointment::VisitKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MetadataStatus {
    Required,
    NotRequired,
    Keyed,
}

impl MetadataStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MetadataStatus::Required => "REQUIRED",
            MetadataStatus::NotRequired => "NOT_REQUIRED",
            MetadataStatus::Keyed => "KEYED",
        }
    }
}

impl fmt::Display for MetadataStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requiredness of one CRF at one visit occurrence.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrfMetadata {
    pub key: VisitKey,
    pub crf: String,
    pub status: MetadataStatus,
    pub modified: DateTime<Utc>,
}
