//! Persisted per-UTXO mix configuration
//!
//! Maps a UTXO key to its assigned pool and mix target, stored as a JSON
//! object in a single file. Writes are skipped when nothing changed since the
//! last write, and keys that disappeared from the wallet are removed only on
//! the second clean pass that still does not see them.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::logging::{log_persistence, LogLevel};

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid utxo config data: {0}")]
    Json(#[from] serde_json::Error),
}

/// Mix configuration of one UTXO
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UtxoConfig {
    #[serde(default)]
    pub pool_id: Option<String>,
    pub mixs_target: u32,
    /// Milliseconds since epoch
    #[serde(default)]
    pub last_modified: i64,
}

impl UtxoConfig {
    pub fn new(pool_id: Option<String>, mixs_target: u32) -> Self {
        Self {
            pool_id,
            mixs_target,
            last_modified: 0,
        }
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// File-backed store of [`UtxoConfig`] by UTXO key
#[derive(Debug)]
pub struct UtxoConfigHandler {
    path: PathBuf,
    utxo_configs: BTreeMap<String, UtxoConfig>,
    keys_to_clean: HashSet<String>,
    last_set: i64,
    last_write: i64,
}

impl UtxoConfigHandler {
    /// Open the handler and load `path` if it exists
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PersistError> {
        let mut handler = Self {
            path: path.as_ref().to_path_buf(),
            utxo_configs: BTreeMap::new(),
            keys_to_clean: HashSet::new(),
            last_set: 0,
            last_write: 0,
        };
        if handler.path.exists() {
            handler.load()?;
        }
        Ok(handler)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the in-memory state with the file content
    pub fn load(&mut self) -> Result<(), PersistError> {
        let content = fs::read_to_string(&self.path).map_err(|source| PersistError::Io {
            path: self.path.clone(),
            source,
        })?;
        let loaded: BTreeMap<String, UtxoConfig> = serde_json::from_str(&content)?;

        debug!("load: {} utxos loaded", loaded.len());
        self.utxo_configs = loaded;
        self.keys_to_clean.clear();
        self.last_set = 0;
        self.last_write = 0;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&UtxoConfig> {
        self.utxo_configs.get(key)
    }

    pub fn len(&self) -> usize {
        self.utxo_configs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.utxo_configs.is_empty()
    }

    /// Store `config` for `key`, stamping it as modified now
    pub fn set(&mut self, key: impl Into<String>, mut config: UtxoConfig) {
        let stamp = self.next_stamp();
        config.last_modified = stamp;
        self.utxo_configs.insert(key.into(), config);
        self.last_set = stamp;
    }

    /// Two-pass removal of keys not in `known_utxo_keys`
    ///
    /// A missing key is marked on its first sighting and removed on the next
    /// pass that still misses it. A key that reappears is unmarked.
    pub fn clean(&mut self, known_utxo_keys: &HashSet<String>) {
        self.keys_to_clean.retain(|key| !known_utxo_keys.contains(key));

        let obsolete: Vec<String> = self
            .utxo_configs
            .keys()
            .filter(|key| !known_utxo_keys.contains(*key))
            .cloned()
            .collect();

        let mut removed = 0;
        for key in obsolete {
            if self.keys_to_clean.remove(&key) {
                debug!("Remove obsolete key: {}", key);
                self.utxo_configs.remove(&key);
                removed += 1;
            } else {
                debug!("Mark obsolete key: {}", key);
                self.keys_to_clean.insert(key);
            }
        }

        if removed > 0 {
            self.last_set = self.next_stamp();
            log_persistence(
                LogLevel::Debug,
                "obsolete utxo configs removed",
                Some(json!({ "removed": removed })),
            );
        }
    }

    pub fn is_marked_for_clean(&self, key: &str) -> bool {
        self.keys_to_clean.contains(key)
    }

    /// True when a set or clean happened after the last write
    pub fn has_modifications(&self) -> bool {
        self.last_set > self.last_write
            || self
                .utxo_configs
                .values()
                .any(|config| config.last_modified > self.last_write)
    }

    /// Write the file if anything changed, returning whether it was written
    pub fn save(&mut self) -> Result<bool, PersistError> {
        if !self.has_modifications() {
            debug!("nothing to write");
            return Ok(false);
        }

        let content = serde_json::to_string_pretty(&self.utxo_configs)?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).map_err(|source| PersistError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }
        fs::write(&self.path, content).map_err(|source| PersistError::Io {
            path: self.path.clone(),
            source,
        })?;

        self.last_write = now_millis().max(self.last_set);
        log_persistence(
            LogLevel::Debug,
            "utxo configs written",
            Some(json!({ "count": self.utxo_configs.len() })),
        );
        Ok(true)
    }

    // Strictly after the last write, even within the same millisecond
    fn next_stamp(&self) -> i64 {
        now_millis().max(self.last_write + 1)
    }
}
