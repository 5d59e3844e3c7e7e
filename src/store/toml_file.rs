use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::{ParamValue, ParameterStore, StoreError};

/// Parameter store persisted as a flat TOML table.
///
/// Every mutation rewrites the whole file through a temporary sibling and a
/// rename, so a crash mid-write leaves the previous file intact.
#[derive(Debug)]
pub struct TomlParameterStore {
    path: PathBuf,
    values: RwLock<BTreeMap<String, ParamValue>>,
}

impl TomlParameterStore {
    /// Open the store, starting empty when the file does not exist yet
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();

        let values = match std::fs::read_to_string(&path) {
            Ok(text) => toml::from_str(&text).map_err(|source| StoreError::Parse {
                path: path.clone(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "parameter file not found, using defaults");
                BTreeMap::new()
            }
            Err(source) => return Err(StoreError::Read { path, source }),
        };

        Ok(Self {
            path,
            values: RwLock::new(values),
        })
    }

    fn flush(&self, values: &BTreeMap<String, ParamValue>) -> Result<(), StoreError> {
        let text = toml::to_string(values)?;
        let tmp = self.path.with_extension("toml.tmp");

        std::fs::write(&tmp, text).map_err(|source| StoreError::Write {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, &self.path).map_err(|source| StoreError::Write {
            path: self.path.clone(),
            source,
        })?;

        debug!(path = %self.path.display(), entries = values.len(), "parameters saved");
        Ok(())
    }
}

impl ParameterStore for TomlParameterStore {
    fn get(&self, name: &str) -> Option<ParamValue> {
        self.values.read().get(name).cloned()
    }

    fn set(&self, name: &str, value: ParamValue) -> Result<(), StoreError> {
        self.apply(&[(name, Some(value))])
    }

    fn remove(&self, name: &str) -> Result<(), StoreError> {
        self.apply(&[(name, None)])
    }

    fn apply(&self, changes: &[(&str, Option<ParamValue>)]) -> Result<(), StoreError> {
        let mut values = self.values.write();
        let mut next = values.clone();
        for (name, value) in changes {
            match value {
                Some(value) => next.insert(name.to_string(), value.clone()),
                None => next.remove(*name),
            };
        }
        if next == *values {
            return Ok(());
        }

        self.flush(&next)?;
        *values = next;
        Ok(())
    }
}
