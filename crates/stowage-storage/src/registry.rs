//! Live provider instances keyed by BackupStorage name
//!
//! The registry is created once at startup and shared by every controller.
//! It is not persisted: after a restart it is empty until the storage
//! controller has re-observed each BackupStorage, and dependents treat a
//! missing entry as "retry later".

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;

use stowage_common::kube_utils::deterministic_hash;

use crate::provider::StorageProvider;

/// Hash of the inputs a provider was built from
pub fn config_hash(
    parameters: &BTreeMap<String, String>,
    credentials: &BTreeMap<String, String>,
) -> String {
    let mut input = String::new();
    for (section, map) in [("p", parameters), ("c", credentials)] {
        for (k, v) in map {
            input.push_str(&format!("{}:{}={}\n", section, k.len(), k));
            input.push_str(&format!("{}:{}\n", v.len(), v));
        }
    }
    deterministic_hash(&input)
}

/// Concurrency-safe registry of providers and their configuration hashes
#[derive(Default)]
pub struct ProviderRegistry {
    providers: DashMap<String, Arc<dyn StorageProvider>>,
    hashes: DashMap<String, String>,
}

impl ProviderRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Provider registered under `name`
    pub fn get(&self, name: &str) -> Option<Arc<dyn StorageProvider>> {
        self.providers.get(name).map(|p| Arc::clone(p.value()))
    }

    /// True when there is no live instance or it was built from other inputs
    pub fn needs_rebuild(&self, name: &str, hash: &str) -> bool {
        !self.providers.contains_key(name)
            || self.hashes.get(name).map(|h| h.value() != hash).unwrap_or(true)
    }

    /// Store a freshly built provider together with its configuration hash
    pub fn register(&self, name: &str, provider: Arc<dyn StorageProvider>, hash: String) {
        self.providers.insert(name.to_string(), provider);
        self.hashes.insert(name.to_string(), hash);
    }

    /// Drop the provider and forget its hash, returning the removed instance
    pub fn unregister(&self, name: &str) -> Option<Arc<dyn StorageProvider>> {
        self.hashes.remove(name);
        self.providers.remove(name).map(|(_, p)| p)
    }

    /// Number of live providers
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// True when no provider is registered
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}
