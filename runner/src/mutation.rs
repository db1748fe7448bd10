//! Addressing and rewriting values of a nested yaml configuration.
//!
//! Keys are either dotted paths (`beam.energy`, sequence items by index) or bare
//! names looked up anywhere in the document, in which case the name must appear
//! exactly once.
use crate::sync::write_atomically;
use serde_yaml::{Mapping, Value};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::trace;

#[derive(Error, Debug)]
pub enum MutationError {
    #[error("Failed to access configuration {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse configuration {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("Failed to serialize configuration")]
    Serialize(#[from] serde_yaml::Error),
    #[error("Key '{0}' does not exist in the configuration")]
    KeyNotFound(String),
    #[error("Key '{key}' is ambiguous, it matches {}", matches.join(", "))]
    AmbiguousKey { key: String, matches: Vec<String> },
}

/// In memory yaml configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigDocument {
    root: Value,
}

#[derive(Debug, Clone, PartialEq)]
enum Step {
    Key(String),
    Index(usize),
}

impl Step {
    fn render(steps: &[Step]) -> String {
        steps
            .iter()
            .map(|step| match step {
                Step::Key(key) => key.clone(),
                Step::Index(index) => index.to_string(),
            })
            .collect::<Vec<_>>()
            .join(".")
    }
}

// collect the location of every mapping entry named `key`
fn find_all(value: &Value, key: &str, prefix: &mut Vec<Step>, found: &mut Vec<Vec<Step>>) {
    match value {
        Value::Mapping(mapping) => {
            for (entry, nested) in mapping {
                let Some(entry) = entry.as_str() else {
                    continue;
                };
                prefix.push(Step::Key(entry.to_string()));
                if entry == key {
                    found.push(prefix.clone());
                }
                find_all(nested, key, prefix, found);
                prefix.pop();
            }
        }
        Value::Sequence(sequence) => {
            for (index, nested) in sequence.iter().enumerate() {
                prefix.push(Step::Index(index));
                find_all(nested, key, prefix, found);
                prefix.pop();
            }
        }
        Value::Tagged(tagged) => find_all(&tagged.value, key, prefix, found),
        _ => {}
    }
}

fn step_into<'a>(value: &'a Value, step: &Step) -> Option<&'a Value> {
    match (value, step) {
        (Value::Mapping(mapping), Step::Key(key)) => mapping.get(key.as_str()),
        (Value::Sequence(sequence), Step::Index(index)) => sequence.get(*index),
        (Value::Tagged(tagged), step) => step_into(&tagged.value, step),
        _ => None,
    }
}

fn step_into_mut<'a>(value: &'a mut Value, step: &Step) -> Option<&'a mut Value> {
    match (value, step) {
        (Value::Mapping(mapping), Step::Key(key)) => mapping.get_mut(key.as_str()),
        (Value::Sequence(sequence), Step::Index(index)) => sequence.get_mut(*index),
        (Value::Tagged(tagged), step) => step_into_mut(&mut tagged.value, step),
        _ => None,
    }
}

impl ConfigDocument {
    pub fn load(path: &Path) -> Result<Self, MutationError> {
        let content = std::fs::read_to_string(path).map_err(|source| MutationError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let root = serde_yaml::from_str(&content).map_err(|source| MutationError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(Self { root })
    }

    pub fn from_value(root: Value) -> Self {
        Self { root }
    }

    pub fn empty() -> Self {
        Self {
            root: Value::Mapping(Mapping::new()),
        }
    }

    pub fn value(&self) -> &Value {
        &self.root
    }

    // dotted keys are explicit paths, sequence items are addressed by index
    fn dotted(&self, key: &str) -> Option<Vec<Step>> {
        let mut steps = Vec::new();
        let mut current = &self.root;
        for part in key.split('.') {
            let step = match (current, part.parse::<usize>()) {
                (Value::Sequence(_), Ok(index)) => Step::Index(index),
                _ => Step::Key(part.to_string()),
            };
            current = step_into(current, &step)?;
            steps.push(step);
        }
        Some(steps)
    }

    fn locate(&self, key: &str) -> Result<Vec<Step>, MutationError> {
        if key.contains('.') {
            return self
                .dotted(key)
                .ok_or_else(|| MutationError::KeyNotFound(key.to_string()));
        }

        let mut found = Vec::new();
        find_all(&self.root, key, &mut Vec::new(), &mut found);
        match found.len() {
            0 => Err(MutationError::KeyNotFound(key.to_string())),
            1 => Ok(found.remove(0)),
            _ => Err(MutationError::AmbiguousKey {
                key: key.to_string(),
                matches: found.iter().map(|steps| Step::render(steps)).collect(),
            }),
        }
    }

    pub fn get(&self, key: &str) -> Result<&Value, MutationError> {
        let steps = self.locate(key)?;
        steps
            .iter()
            .try_fold(&self.root, step_into)
            .ok_or_else(|| MutationError::KeyNotFound(key.to_string()))
    }

    /// Replace the value addressed by `key`, the key must already exist
    pub fn mutate(&mut self, key: &str, value: Value) -> Result<(), MutationError> {
        let steps = self.locate(key)?;
        let slot = steps
            .iter()
            .try_fold(&mut self.root, |current, step| step_into_mut(current, step))
            .ok_or_else(|| MutationError::KeyNotFound(key.to_string()))?;

        trace!(key, path = %Step::render(&steps), "Mutating configuration");
        *slot = value;
        Ok(())
    }

    /// Replace the value of every sub-key of `key`, e.g. both beams of a knob
    pub fn mutate_subkeys(
        &mut self,
        key: &str,
        subkeys: &[String],
        value: &Value,
    ) -> Result<(), MutationError> {
        let parent = self.locate(key)?;
        for subkey in subkeys {
            let mut steps = parent.clone();
            steps.push(Step::Key(subkey.clone()));
            let slot = steps
                .iter()
                .try_fold(&mut self.root, |current, step| step_into_mut(current, step))
                .ok_or_else(|| MutationError::KeyNotFound(format!("{key}.{subkey}")))?;

            trace!(key, subkey = %subkey, "Mutating configuration");
            *slot = value.clone();
        }
        Ok(())
    }

    pub fn to_yaml_string(&self) -> Result<String, MutationError> {
        Ok(serde_yaml::to_string(&self.root)?)
    }

    pub fn dump(&self, path: &Path) -> Result<(), MutationError> {
        let content = self.to_yaml_string()?;
        write_atomically(path, content).map_err(|source| MutationError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}
