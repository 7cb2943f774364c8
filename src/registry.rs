//! Provider registry: logical model name -> upstream configuration
//!
//! The registry publishes immutable [`RegistrySnapshot`]s. A writer builds
//! the complete next snapshot, persists it, then swaps it in with a single
//! pointer store; readers holding the previous snapshot are unaffected.

use crate::{Error, ProviderConfig, ProviderDocument, Result};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// One published version of the registry
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    /// Increments on every successful write
    pub version: u64,
    models: BTreeMap<String, Arc<ProviderConfig>>,
}

impl RegistrySnapshot {
    /// Look up a model in this snapshot
    pub fn get(&self, model: &str) -> Option<&Arc<ProviderConfig>> {
        self.models.get(model)
    }

    /// Model names, sorted
    pub fn model_names(&self) -> Vec<String> {
        self.models.keys().cloned().collect()
    }

    /// Configurations, sorted by model name
    pub fn configs(&self) -> impl Iterator<Item = &Arc<ProviderConfig>> {
        self.models.values()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    fn to_document(&self) -> ProviderDocument {
        ProviderDocument {
            models: self.models.values().map(|c| (**c).clone()).collect(),
        }
    }
}

/// Routing table shared by every request
pub struct ProviderRegistry {
    snapshot: ArcSwap<RegistrySnapshot>,
    write_lock: Mutex<()>,
    document_path: Option<PathBuf>,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderRegistry {
    /// Empty registry without persistence
    pub fn new() -> Self {
        ProviderRegistry {
            snapshot: ArcSwap::from_pointee(RegistrySnapshot::default()),
            write_lock: Mutex::new(()),
            document_path: None,
        }
    }

    /// Registry persisted to a provider document at `path`.
    ///
    /// Loads the document when it exists, otherwise seeds from `seed` and
    /// writes it out.
    pub fn open(path: impl Into<PathBuf>, seed: impl FnOnce() -> ProviderDocument) -> Result<Self> {
        let path = path.into();
        let (document, seeded) = match ProviderDocument::load(&path)? {
            Some(doc) => (doc, false),
            None => (seed(), true),
        };

        let registry = ProviderRegistry {
            snapshot: ArcSwap::from_pointee(RegistrySnapshot::default()),
            write_lock: Mutex::new(()),
            document_path: Some(path.clone()),
        };
        if seeded && document.models.is_empty() {
            info!("No provider document at {} and no provider credentials in the environment", path.display());
            return Ok(registry);
        }
        registry.reload(document.models)?;
        info!(
            "Loaded {} model(s) from {}{}",
            registry.snapshot().len(),
            path.display(),
            if seeded { " (seeded from environment)" } else { "" }
        );
        Ok(registry)
    }

    /// Current snapshot
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.snapshot.load_full()
    }

    /// Resolve a logical model name
    pub fn resolve(&self, model: &str) -> Result<Arc<ProviderConfig>> {
        self.snapshot
            .load()
            .get(model)
            .cloned()
            .ok_or_else(|| Error::UnknownModel(model.to_string()))
    }

    /// Registered model names, sorted
    pub fn list_models(&self) -> Vec<String> {
        self.snapshot.load().model_names()
    }

    /// Replace the whole table; any invalid entry rejects the reload
    pub fn reload(&self, configs: Vec<ProviderConfig>) -> Result<()> {
        let mut models = BTreeMap::new();
        for config in configs {
            config.validate()?;
            if models.contains_key(&config.model_name) {
                return Err(Error::invalid(
                    config.model_name,
                    "model is configured more than once",
                ));
            }
            models.insert(config.model_name.clone(), Arc::new(config));
        }

        let _guard = self.write_lock.lock();
        let current = self.snapshot.load_full();
        let next = RegistrySnapshot {
            version: current.version + 1,
            models,
        };
        self.publish(next)?;
        info!("Provider registry reloaded ({} models)", self.snapshot.load().len());
        Ok(())
    }

    /// Insert or replace one model's configuration
    pub fn upsert(&self, config: ProviderConfig) -> Result<()> {
        config.validate()?;

        let _guard = self.write_lock.lock();
        let current = self.snapshot.load_full();
        let mut next = (*current).clone();
        next.version += 1;
        let model = config.model_name.clone();
        let replaced = next.models.insert(model.clone(), Arc::new(config)).is_some();
        self.publish(next)?;
        info!(model = %model, replaced, "Provider configuration updated");
        Ok(())
    }

    /// Remove one model
    pub fn remove(&self, model: &str) -> Result<()> {
        let _guard = self.write_lock.lock();
        let current = self.snapshot.load_full();
        if current.get(model).is_none() {
            return Err(Error::UnknownModel(model.to_string()));
        }
        let mut next = (*current).clone();
        next.version += 1;
        next.models.remove(model);
        self.publish(next)?;
        info!(model = %model, "Provider configuration removed");
        Ok(())
    }

    // Caller holds the write lock
    fn publish(&self, next: RegistrySnapshot) -> Result<()> {
        if let Some(path) = &self.document_path {
            next.to_document().save(path)?;
        }
        self.snapshot.store(Arc::new(next));
        Ok(())
    }
}
