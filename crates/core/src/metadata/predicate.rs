//! Rule predicates and the context they read from.

use crate::{EdcError, EdcResult};
use edc_protocol::PredicateData;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Named field values of a captured record.
pub type Fields = BTreeMap<String, Value>;

/// Something predicates can read named fields from.
pub trait FieldSource {
    fn field(&self, name: &str) -> Option<&Value>;
}

impl FieldSource for BTreeMap<String, Value> {
    fn field(&self, name: &str) -> Option<&Value> {
        self.get(name)
    }
}

/// Everything a rule may look at when it runs for one visit.
///
/// Fields are looked up in the source-model record first, then the visit report, then the
/// registered subject.
#[derive(Clone, Copy, Debug)]
pub struct RuleEvaluationContext<'a> {
    pub source_model: &'a str,
    pub source: Option<&'a Fields>,
    pub visit: &'a Fields,
    pub registered_subject: &'a Fields,
}

impl<'a> RuleEvaluationContext<'a> {
    pub fn new(source_model: &'a str, visit: &'a Fields, registered_subject: &'a Fields) -> Self {
        Self {
            source_model,
            source: None,
            visit,
            registered_subject,
        }
    }

    pub fn with_source(mut self, source: &'a Fields) -> Self {
        self.source = Some(source);
        self
    }
}

impl FieldSource for RuleEvaluationContext<'_> {
    fn field(&self, name: &str) -> Option<&Value> {
        self.source
            .and_then(|s| s.get(name))
            .or_else(|| self.visit.get(name))
            .or_else(|| self.registered_subject.get(name))
    }
}

type CustomFn = dyn Fn(&dyn FieldSource) -> bool + Send + Sync;

/// A boolean function over several fields, registered in code.
#[derive(Clone)]
pub struct CustomPredicate {
    name: String,
    func: Arc<CustomFn>,
}

impl CustomPredicate {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for CustomPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CustomPredicate").field(&self.name).finish()
    }
}

/// Decides whether a rule's consequence or alternative applies.
#[derive(Clone, Debug)]
pub enum Predicate {
    FieldEquals { field: String, value: Value },
    FieldIn { field: String, values: Vec<Value> },
    All(Vec<Predicate>),
    Any(Vec<Predicate>),
    Not(Box<Predicate>),
    Custom(CustomPredicate),
}

impl Predicate {
    pub fn field_equals(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::FieldEquals {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn field_in<I, V>(field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Predicate::FieldIn {
            field: field.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn custom<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&dyn FieldSource) -> bool + Send + Sync + 'static,
    {
        Predicate::Custom(CustomPredicate {
            name: name.into(),
            func: Arc::new(func),
        })
    }

    pub fn negate(self) -> Self {
        Predicate::Not(Box::new(self))
    }

    pub fn from_data(data: &PredicateData) -> Self {
        match data {
            PredicateData::FieldEquals { field, value } => Predicate::FieldEquals {
                field: field.to_string(),
                value: value.clone(),
            },
            PredicateData::FieldIn { field, values } => Predicate::FieldIn {
                field: field.to_string(),
                values: values.clone(),
            },
        }
    }

    /// Evaluate against `source`.
    ///
    /// # Errors
    ///
    /// Returns [`EdcError::PredicateError`] if a named field is missing from the source.
    pub fn evaluate(&self, source: &dyn FieldSource) -> EdcResult<bool> {
        match self {
            Predicate::FieldEquals { field, value } => Ok(lookup(source, field)? == value),
            Predicate::FieldIn { field, values } => {
                let actual = lookup(source, field)?;
                Ok(values.iter().any(|v| v == actual))
            }
            Predicate::All(predicates) => {
                for predicate in predicates {
                    if !predicate.evaluate(source)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Predicate::Any(predicates) => {
                for predicate in predicates {
                    if predicate.evaluate(source)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Predicate::Not(inner) => Ok(!inner.evaluate(source)?),
            Predicate::Custom(custom) => Ok((custom.func)(source)),
        }
    }
}

fn lookup<'s>(source: &'s dyn FieldSource, field: &str) -> EdcResult<&'s Value> {
    source
        .field(field)
        .ok_or_else(|| EdcError::PredicateError(format!("field '{field}' not found")))
}
