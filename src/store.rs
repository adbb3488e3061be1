//! Durable list of userscripts.
//!
//! The whole collection lives under a single storage key as one JSON blob:
//!
//! ```text
//! { "version": 1, "scripts": [ { "id": "...", "code": "...", ... } ] }
//! ```
//!
//! Every mutation reloads the blob, edits it and writes it back in one `set`.
//! Writers in this process are serialized; two processes sharing a backend can
//! still overwrite each other's changes (last write wins).

use chrono::Utc;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::borrow::Cow;
use std::sync::{Mutex, PoisonError};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::metadata::{parse_metadata, strip_metadata, ScriptMetadata};
use crate::storage::KeyValueStore;

/// Storage key the collection is kept under unless configured otherwise.
pub const DEFAULT_STORAGE_KEY: &str = "scripts";

/// Format version written by this crate.
pub const CURRENT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptRecord {
    pub id: String,
    /// Full source, metadata header included.
    pub code: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
    /// When the installer last contacted the source URL.
    #[serde(default)]
    pub checked_at: Option<i64>,
    #[serde(default)]
    pub last_fetch_error: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl ScriptRecord {
    pub fn new(code: impl Into<String>) -> Self {
        let now = Utc::now().timestamp();
        Self {
            id: Uuid::new_v4().to_string(),
            code: code.into(),
            enabled: true,
            source_url: None,
            created_at: now,
            updated_at: now,
            checked_at: None,
            last_fetch_error: None,
        }
    }

    /// Metadata parsed from the current code.
    pub fn metadata(&self) -> ScriptMetadata {
        parse_metadata(&self.code)
    }

    /// The code with its metadata block removed.
    pub fn body(&self) -> Cow<'_, str> {
        strip_metadata(&self.code)
    }
}

// `version` is checked on the raw value before decoding
#[derive(Deserialize)]
struct StoredScripts {
    scripts: Vec<ScriptRecord>,
}

// Unversioned layout: a bare array of `{ "code": ... }`
#[derive(Deserialize)]
struct LegacyScript {
    code: String,
}

pub struct ScriptStore<S> {
    storage: S,
    key: String,
    write_lock: Mutex<()>,
}

impl<S: KeyValueStore> ScriptStore<S> {
    pub fn new(storage: S) -> Self {
        Self::with_key(storage, DEFAULT_STORAGE_KEY)
    }

    pub fn with_key(storage: S, key: impl Into<String>) -> Self {
        Self {
            storage,
            key: key.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// All records in insertion order.
    pub fn list(&self) -> StoreResult<Vec<ScriptRecord>> {
        let (records, legacy) = self.load()?;
        if !legacy {
            return Ok(records);
        }

        // Persist the migration so the ids handed out here stay stable
        match self.mutate(|records| Ok((records.clone(), false))) {
            Ok(migrated) => Ok(migrated),
            Err(e) => {
                warn!("Failed to persist migrated scripts: {}", e);
                Ok(records)
            }
        }
    }

    pub fn get(&self, id: &str) -> StoreResult<ScriptRecord> {
        self.list()?
            .into_iter()
            .find(|r| r.id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    /// Append a new record. Identical code may be stored more than once.
    pub fn create(&self, code: impl Into<String>) -> StoreResult<ScriptRecord> {
        self.insert(ScriptRecord::new(code))
    }

    /// Append a prepared record.
    pub fn insert(&self, record: ScriptRecord) -> StoreResult<ScriptRecord> {
        let created = self.mutate(|records| {
            records.push(record.clone());
            Ok((record, true))
        })?;
        info!(
            "Created script {} ({})",
            created.id,
            created.metadata().display_name(0)
        );
        Ok(created)
    }

    /// Append `record` unless `reject` returns true for the current records.
    /// The check and the append happen under the same write lock.
    pub fn insert_unless<F>(&self, record: ScriptRecord, reject: F) -> StoreResult<Option<ScriptRecord>>
    where
        F: FnOnce(&[ScriptRecord]) -> bool,
    {
        let created = self.mutate(|records| {
            if reject(records) {
                return Ok((None, false));
            }
            records.push(record.clone());
            Ok((Some(record), true))
        })?;
        if let Some(created) = &created {
            info!(
                "Created script {} ({})",
                created.id,
                created.metadata().display_name(0)
            );
        }
        Ok(created)
    }

    /// Replace the code at `index`. Returns `false` without touching storage
    /// when the index is out of bounds.
    pub fn update(&self, index: usize, code: impl Into<String>) -> StoreResult<bool> {
        let code = code.into();
        self.mutate(|records| match records.get_mut(index) {
            Some(record) => {
                record.code = code;
                record.updated_at = Utc::now().timestamp();
                info!("Updated script {} at index {}", record.id, index);
                Ok((true, true))
            }
            None => Ok((false, false)),
        })
    }

    /// Remove the record at `index`; later records shift down by one.
    /// Returns `false` when the index is out of bounds.
    pub fn delete(&self, index: usize) -> StoreResult<bool> {
        self.mutate(|records| {
            if index >= records.len() {
                return Ok((false, false));
            }
            let removed = records.remove(index);
            info!("Deleted script {} at index {}", removed.id, index);
            Ok((true, true))
        })
    }

    pub fn update_by_id(&self, id: &str, code: impl Into<String>) -> StoreResult<ScriptRecord> {
        let code = code.into();
        self.modify(id, |record| {
            record.code = code;
            record.updated_at = Utc::now().timestamp();
        })
    }

    pub fn delete_by_id(&self, id: &str) -> StoreResult<ScriptRecord> {
        let removed = self.mutate(|records| {
            let position = records
                .iter()
                .position(|r| r.id == id)
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            Ok((records.remove(position), true))
        })?;
        info!("Deleted script {}", removed.id);
        Ok(removed)
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> StoreResult<ScriptRecord> {
        self.modify(id, |record| record.enabled = enabled)
    }

    /// Overwrite the stored record that has the same id.
    pub fn replace(&self, record: ScriptRecord) -> StoreResult<ScriptRecord> {
        let id = record.id.clone();
        self.modify(&id, move |existing| *existing = record)
    }

    /// Edit the current stored record with `id` in place and persist it.
    ///
    /// The closure sees the record as stored at the time of the write, so
    /// concurrent edits to other fields are kept.
    pub fn modify<F>(&self, id: &str, f: F) -> StoreResult<ScriptRecord>
    where
        F: FnOnce(&mut ScriptRecord),
    {
        self.mutate(|records| {
            let record = records
                .iter_mut()
                .find(|r| r.id == id)
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            f(record);
            Ok((record.clone(), true))
        })
    }

    /// Read-modify-write of the whole collection under the write lock.
    ///
    /// The closure returns its output and whether the records changed; the
    /// blob is only written back when they did (or when it was migrated).
    fn mutate<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Vec<ScriptRecord>) -> StoreResult<(T, bool)>,
    {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut records, legacy) = self.load()?;
        let (output, changed) = f(&mut records)?;
        if changed || legacy {
            self.save(&records)?;
        }
        Ok(output)
    }

    fn load(&self) -> StoreResult<(Vec<ScriptRecord>, bool)> {
        match self.storage.get(&self.key)? {
            None => Ok((Vec::new(), false)),
            Some(raw) => decode(&raw),
        }
    }

    fn save(&self, records: &[ScriptRecord]) -> StoreResult<()> {
        let blob = serde_json::to_string_pretty(&StoredScriptsRef {
            version: CURRENT_VERSION,
            scripts: records,
        })?;
        self.storage.set(&self.key, &blob)?;
        Ok(())
    }
}

#[derive(Serialize)]
struct StoredScriptsRef<'a> {
    version: u32,
    scripts: &'a [ScriptRecord],
}

/// Decode a stored blob, reporting whether it was in the legacy layout.
fn decode(raw: &str) -> StoreResult<(Vec<ScriptRecord>, bool)> {
    let value: Value = serde_json::from_str(raw)?;

    if value.is_array() {
        let legacy: Vec<LegacyScript> = serde_json::from_value(value)?;
        let records = legacy
            .into_iter()
            .map(|script| ScriptRecord::new(script.code))
            .collect();
        return Ok((records, true));
    }

    let found = value.get("version").and_then(Value::as_u64).unwrap_or(0);
    if found > u64::from(CURRENT_VERSION) {
        return Err(StoreError::UnsupportedVersion {
            found,
            supported: CURRENT_VERSION,
        });
    }

    let stored: StoredScripts = serde_json::from_value(value)?;
    Ok((stored.scripts, false))
}
