//! Named-parameter persistence for plant configuration.
//!
//! The simulator only needs get/set of a handful of scalar values, so the
//! store is a flat key-value map. [`TomlParameterStore`] keeps it in a TOML
//! file next to the process config; [`MemoryParameterStore`] is used when no
//! persistence is wanted and in tests.

mod toml_file;

pub use toml_file::TomlParameterStore;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read parameter file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse parameter file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("failed to write parameter file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to serialize parameters: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Scalar parameter value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
}

impl ParamValue {
    /// Store a u64 seed bit-for-bit in the signed integer slot TOML offers
    pub fn seed(seed: u64) -> Self {
        ParamValue::Int(seed as i64)
    }

    pub fn as_seed(&self) -> Option<u64> {
        match self {
            ParamValue::Int(n) => Some(*n as u64),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            ParamValue::Int(n) => u64::try_from(*n).ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Float(x) => Some(*x),
            ParamValue::Int(n) => Some(*n as f64),
            ParamValue::Bool(_) => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

/// Key-value store for named configuration parameters
pub trait ParameterStore: Send + Sync {
    /// Current value, or None when the caller should apply its default
    fn get(&self, name: &str) -> Option<ParamValue>;

    fn set(&self, name: &str, value: ParamValue) -> Result<(), StoreError>;

    fn remove(&self, name: &str) -> Result<(), StoreError>;

    /// Set (`Some`) or remove (`None`) several values as one change.
    /// Implementations that persist must write them in a single step.
    fn apply(&self, changes: &[(&str, Option<ParamValue>)]) -> Result<(), StoreError> {
        for (name, value) in changes {
            match value {
                Some(value) => self.set(name, value.clone())?,
                None => self.remove(name)?,
            }
        }
        Ok(())
    }
}

/// Volatile parameter store
#[derive(Debug, Default)]
pub struct MemoryParameterStore {
    values: RwLock<BTreeMap<String, ParamValue>>,
}

impl MemoryParameterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ParameterStore for MemoryParameterStore {
    fn get(&self, name: &str) -> Option<ParamValue> {
        self.values.read().get(name).cloned()
    }

    fn set(&self, name: &str, value: ParamValue) -> Result<(), StoreError> {
        self.values.write().insert(name.to_string(), value);
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<(), StoreError> {
        self.values.write().remove(name);
        Ok(())
    }
}
