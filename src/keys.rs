//! Credential store for gateway-issued API keys
//!
//! Records live in an immutable snapshot published through [`ArcSwap`], so
//! `validate` and `list` never take a lock while the backing log is
//! unchanged. Mutations serialize on a write lock, persist to the
//! [`KeyStorage`] backend, and only then publish the new snapshot.
//!
//! Several processes may share one key log (the running gateway and the
//! `emx-gate keys` commands). The log is append-only; a store re-reads it
//! whenever its length differs from what the store last loaded.

use crate::{persist, Error, Result};
use arc_swap::ArcSwap;
use chrono::{DateTime, NaiveDateTime, Utc};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Allow-list token meaning every registered model
pub const WILDCARD: &str = "all";

/// Models a key may request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub enum AllowedModels {
    /// Every model currently registered, evaluated per request
    All,
    /// An explicit set of logical model names
    Only(BTreeSet<String>),
}

impl AllowedModels {
    /// Whether `model` passes this allow-list
    pub fn permits(&self, model: &str) -> bool {
        match self {
            AllowedModels::All => true,
            AllowedModels::Only(models) => models.contains(model),
        }
    }

    /// Parse a comma-separated list; `all` or an empty list is the wildcard
    pub fn parse(list: &str) -> Self {
        list.split(',').map(str::to_string).collect::<Vec<_>>().into()
    }
}

impl<S: Into<String>> FromIterator<S> for AllowedModels {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        iter.into_iter().map(Into::into).collect::<Vec<String>>().into()
    }
}

impl From<Vec<String>> for AllowedModels {
    fn from(models: Vec<String>) -> Self {
        let models: BTreeSet<String> = models
            .into_iter()
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .collect();
        if models.is_empty() || models.iter().any(|m| m.eq_ignore_ascii_case(WILDCARD)) {
            AllowedModels::All
        } else {
            AllowedModels::Only(models)
        }
    }
}

impl From<AllowedModels> for Vec<String> {
    fn from(allowed: AllowedModels) -> Self {
        match allowed {
            AllowedModels::All => vec![WILDCARD.to_string()],
            AllowedModels::Only(models) => models.into_iter().collect(),
        }
    }
}

/// One issued API key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub key: String,
    pub instance_name: String,
    pub allowed_models: AllowedModels,
    pub created_at: DateTime<Utc>,
    /// Free-form note carried over from legacy key files
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Persistence backend for the credential store
pub trait KeyStorage: Send + Sync {
    /// Read every live record in creation order
    fn load(&self) -> Result<Vec<ApiKeyRecord>>;

    /// Durably record a new key
    fn record_issue(&self, record: &ApiKeyRecord) -> Result<()>;

    /// Durably record a revocation
    fn record_revoke(&self, key: &str) -> Result<()>;

    /// Whether another writer changed storage since the last `load`
    fn is_stale(&self) -> bool {
        false
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum KeyEvent {
    Issue { record: ApiKeyRecord },
    Revoke { key: String },
}

/// Append-only JSON-lines key log
pub struct KeyLog {
    path: PathBuf,
    // Log length seen by the last load
    loaded_len: AtomicU64,
}

impl KeyLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        KeyLog {
            path: path.into(),
            loaded_len: AtomicU64::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, event: &KeyEvent) -> Result<()> {
        persist::append_line(&self.path, &serde_json::to_string(event)?)
    }

    fn current_len(&self) -> u64 {
        std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }
}

impl KeyStorage for KeyLog {
    fn load(&self) -> Result<Vec<ApiKeyRecord>> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.loaded_len.store(0, Ordering::Release);
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        // A trailing line without its newline is a write still in flight or
        // torn by a crash; neither was acknowledged.
        let complete = bytes.iter().rposition(|&b| b == b'\n').map_or(0, |p| p + 1);
        let text = String::from_utf8_lossy(&bytes[..complete]);

        let mut records: IndexMap<String, ApiKeyRecord> = IndexMap::new();
        for (i, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<KeyEvent>(line) {
                Ok(KeyEvent::Issue { record }) => {
                    records.insert(record.key.clone(), record);
                }
                Ok(KeyEvent::Revoke { key }) => {
                    records.shift_remove(&key);
                }
                Err(e) => warn!(
                    "Skipping unreadable entry at line {} of {}: {}",
                    i + 1,
                    self.path.display(),
                    e
                ),
            }
        }

        self.loaded_len.store(bytes.len() as u64, Ordering::Release);
        Ok(records.into_values().collect())
    }

    fn record_issue(&self, record: &ApiKeyRecord) -> Result<()> {
        self.append(&KeyEvent::Issue {
            record: record.clone(),
        })
    }

    fn record_revoke(&self, key: &str) -> Result<()> {
        self.append(&KeyEvent::Revoke {
            key: key.to_string(),
        })
    }

    fn is_stale(&self) -> bool {
        self.current_len() != self.loaded_len.load(Ordering::Acquire)
    }
}

/// Non-durable storage for tests and throwaway deployments
#[derive(Default)]
pub struct MemoryKeyStorage {
    records: Mutex<IndexMap<String, ApiKeyRecord>>,
}

impl MemoryKeyStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyStorage for MemoryKeyStorage {
    fn load(&self) -> Result<Vec<ApiKeyRecord>> {
        Ok(self.records.lock().values().cloned().collect())
    }

    fn record_issue(&self, record: &ApiKeyRecord) -> Result<()> {
        self.records.lock().insert(record.key.clone(), record.clone());
        Ok(())
    }

    fn record_revoke(&self, key: &str) -> Result<()> {
        self.records.lock().shift_remove(key);
        Ok(())
    }
}

type KeyGenerator = Box<dyn Fn(&str) -> String + Send + Sync>;

#[derive(Clone, Default)]
struct KeySnapshot {
    // Indexed by SHA-256 of the key so lookups never compare secret prefixes
    records: IndexMap<[u8; 32], Arc<ApiKeyRecord>>,
}

impl KeySnapshot {
    fn get(&self, key: &str) -> Option<&Arc<ApiKeyRecord>> {
        self.records
            .get(&digest(key))
            .filter(|record| record.key == key)
    }

    fn insert(&mut self, record: ApiKeyRecord) {
        self.records.insert(digest(&record.key), Arc::new(record));
    }

    fn from_records(records: Vec<ApiKeyRecord>) -> Self {
        let mut snapshot = KeySnapshot::default();
        for record in records {
            snapshot.insert(record);
        }
        snapshot
    }
}

pub(crate) fn digest(key: &str) -> [u8; 32] {
    Sha256::digest(key.as_bytes()).into()
}

/// Issues, validates and revokes gateway API keys
pub struct CredentialStore {
    snapshot: ArcSwap<KeySnapshot>,
    write_lock: Mutex<()>,
    storage: Box<dyn KeyStorage>,
    generator: KeyGenerator,
}

impl CredentialStore {
    /// Open a store over `storage`, loading every persisted record
    pub fn open(storage: impl KeyStorage + 'static) -> Result<Self> {
        let snapshot = KeySnapshot::from_records(storage.load()?);
        info!("Loaded {} API key(s)", snapshot.records.len());

        Ok(CredentialStore {
            snapshot: ArcSwap::from_pointee(snapshot),
            write_lock: Mutex::new(()),
            storage: Box::new(storage),
            generator: Box::new(generate_key),
        })
    }

    /// In-memory store with no durable backing
    pub fn in_memory() -> Self {
        CredentialStore {
            snapshot: ArcSwap::from_pointee(KeySnapshot::default()),
            write_lock: Mutex::new(()),
            storage: Box::new(MemoryKeyStorage::new()),
            generator: Box::new(generate_key),
        }
    }

    /// Replace the key generator
    pub fn with_generator<F>(mut self, generator: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.generator = Box::new(generator);
        self
    }

    /// Issue a new key for `instance_name`
    pub fn issue(&self, instance_name: &str, allowed_models: AllowedModels) -> Result<ApiKeyRecord> {
        let instance_name = instance_name.trim();
        if instance_name.is_empty() {
            return Err(Error::BadRequest("instance name must not be empty".to_string()));
        }

        let _guard = self.write_lock.lock();
        let current = self.reload_locked()?;
        let key = self.unique_key(&current, instance_name)?;

        let record = ApiKeyRecord {
            key,
            instance_name: instance_name.to_string(),
            allowed_models,
            created_at: Utc::now(),
            description: None,
        };
        self.publish(&current, record.clone())?;
        info!(instance = %record.instance_name, "Issued API key");
        Ok(record)
    }

    /// Insert an externally created record, e.g. from a legacy key file
    pub fn import(&self, record: ApiKeyRecord) -> Result<()> {
        let _guard = self.write_lock.lock();
        let current = self.reload_locked()?;
        if current.get(&record.key).is_some() {
            return Err(Error::DuplicateKey);
        }
        let instance = record.instance_name.clone();
        self.publish(&current, record)?;
        info!(instance = %instance, "Imported API key");
        Ok(())
    }

    /// Look up a presented key
    pub fn validate(&self, key: &str) -> Result<Arc<ApiKeyRecord>> {
        self.current().get(key).cloned().ok_or(Error::InvalidKey)
    }

    /// Delete a key; later validations fail
    pub fn revoke(&self, key: &str) -> Result<()> {
        let _guard = self.write_lock.lock();
        let current = self.reload_locked()?;
        let Some(record) = current.get(key).cloned() else {
            return Err(Error::NotFound("API key".to_string()));
        };

        self.storage.record_revoke(key)?;
        let mut next = (*current).clone();
        next.records.shift_remove(&digest(key));
        self.snapshot.store(Arc::new(next));
        info!(instance = %record.instance_name, "Revoked API key");
        Ok(())
    }

    /// Every live record in creation order
    pub fn list(&self) -> Vec<ApiKeyRecord> {
        self.current()
            .records
            .values()
            .map(|r| (**r).clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.current().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot that includes writes made through other handles on the log
    fn current(&self) -> Arc<KeySnapshot> {
        if self.storage.is_stale() {
            let _guard = self.write_lock.lock();
            if let Err(e) = self.reload_locked() {
                warn!("Failed to re-read API key storage: {}", e);
            }
        }
        self.snapshot.load_full()
    }

    // Caller holds the write lock
    fn reload_locked(&self) -> Result<Arc<KeySnapshot>> {
        if self.storage.is_stale() {
            let next = KeySnapshot::from_records(self.storage.load()?);
            debug!("Re-read {} API key(s) changed by another writer", next.records.len());
            self.snapshot.store(Arc::new(next));
        }
        Ok(self.snapshot.load_full())
    }

    fn unique_key(&self, snapshot: &KeySnapshot, instance_name: &str) -> Result<String> {
        // One regeneration on collision, then give up
        for attempt in 0..2 {
            let key = (self.generator)(instance_name);
            if snapshot.get(&key).is_none() {
                return Ok(key);
            }
            warn!(attempt = attempt + 1, "Generated API key collided with an existing key");
        }
        Err(Error::KeyGenerationExhausted)
    }

    // Caller holds the write lock
    fn publish(&self, current: &KeySnapshot, record: ApiKeyRecord) -> Result<()> {
        self.storage.record_issue(&record)?;
        let mut next = current.clone();
        next.insert(record);
        self.snapshot.store(Arc::new(next));
        Ok(())
    }
}

/// Generate `sk-<instance-slug>-<32 hex>`
pub fn generate_key(instance_name: &str) -> String {
    format!("sk-{}-{}", slug(instance_name), uuid::Uuid::new_v4().simple())
}

fn slug(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    let out = out.trim_matches('-');
    if out.is_empty() {
        "instance".to_string()
    } else {
        out.to_string()
    }
}

#[derive(Deserialize)]
struct LegacyKey {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    models: Vec<String>,
    #[serde(default)]
    created: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

/// Parse the legacy `{ "<key>": {"name", "models", "created"} }` key file
pub fn parse_legacy_keys(text: &str) -> Result<Vec<ApiKeyRecord>> {
    let entries: IndexMap<String, LegacyKey> = serde_json::from_str(text)?;
    Ok(entries
        .into_iter()
        .map(|(key, entry)| ApiKeyRecord {
            instance_name: entry.name.unwrap_or_else(|| "unknown".to_string()),
            allowed_models: entry.models.into(),
            created_at: entry
                .created
                .as_deref()
                .and_then(parse_legacy_time)
                .unwrap_or_else(Utc::now),
            description: entry.description.filter(|d| !d.trim().is_empty()),
            key,
        })
        .collect())
}

fn parse_legacy_time(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Some(t.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|t| t.and_utc())
}
