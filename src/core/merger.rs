//! Combine prerequisite outputs into a single input.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::data::{Data, Value, ValueKind};
use super::types::JobId;

/// Errors produced while merging.
#[derive(Debug, Error, PartialEq)]
pub enum MergeError {
    /// Two inputs carry incompatible values for the same key.
    #[error("key '{key}' holds {existing} and {incoming} values")]
    TypeMismatch {
        key: String,
        existing: ValueKind,
        incoming: ValueKind,
    },
}

/// Strategy used to build a job's input from several payloads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputMerger {
    /// Later payloads win on key collision.
    #[default]
    Overwriting,
    /// Every key maps to an array of all the values seen for it.
    ArrayCreating,
}

impl InputMerger {
    /// Merge payloads in order.
    ///
    /// Both strategies reject a collision between values of different
    /// kinds. Empty arrays are compatible with anything.
    pub fn merge(&self, inputs: &[(JobId, Data)]) -> Result<Data, MergeError> {
        match self {
            InputMerger::Overwriting => overwrite(inputs),
            InputMerger::ArrayCreating => create_arrays(inputs),
        }
    }
}

fn check_kinds(key: &str, existing: &Value, incoming: &Value) -> Result<(), MergeError> {
    match (existing.kind(), incoming.kind()) {
        (Some(a), Some(b)) if a != b => Err(MergeError::TypeMismatch {
            key: key.to_string(),
            existing: a,
            incoming: b,
        }),
        _ => Ok(()),
    }
}

fn overwrite(inputs: &[(JobId, Data)]) -> Result<Data, MergeError> {
    let mut merged = Data::new();
    for (_, data) in inputs {
        for (key, value) in data.iter() {
            if let Some(existing) = merged.get(key) {
                check_kinds(key, existing, value)?;
            }
            merged.insert(key.clone(), value.clone());
        }
    }
    Ok(merged)
}

fn create_arrays(inputs: &[(JobId, Data)]) -> Result<Data, MergeError> {
    let mut merged: Vec<(String, Vec<Value>)> = Vec::new();
    for (_, data) in inputs {
        for (key, value) in data.iter() {
            let incoming: Vec<Value> = match value {
                Value::Array(items) => items.clone(),
                other => vec![other.clone()],
            };
            match merged.iter_mut().find(|(k, _)| k == key) {
                Some((_, items)) => {
                    if let (Some(first), Some(next)) = (items.first(), incoming.first()) {
                        check_kinds(key, first, next)?;
                    }
                    items.extend(incoming);
                }
                None => merged.push((key.clone(), incoming)),
            }
        }
    }
    Ok(merged
        .into_iter()
        .map(|(key, items)| (key, Value::Array(items)))
        .collect())
}
