//! Config Entries Manager
//!
//! Owns every persisted config entry and answers unique-id lookups for
//! running config flows.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::entry::ConfigEntry;
use crate::flow::UniqueIdLookup;
use crate::storage::{Storable, Storage, StorageError};

/// Storage key for config entries
pub const STORAGE_KEY: &str = "core.config_entries";
/// Current storage version
pub const STORAGE_VERSION: u32 = 1;
/// Current minor version
pub const STORAGE_MINOR_VERSION: u32 = 5;

/// Config entries errors
#[derive(Debug, Error)]
pub enum ConfigEntriesError {
    #[error("Entry not found: {0}")]
    NotFound(String),

    #[error("Entry already exists for domain {domain} with unique_id {unique_id}")]
    AlreadyExists { domain: String, unique_id: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type ConfigEntriesResult<T> = Result<T, ConfigEntriesError>;

/// Config entries data for storage
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigEntriesData {
    pub entries: Vec<ConfigEntry>,
}

impl Storable for ConfigEntriesData {
    const KEY: &'static str = STORAGE_KEY;
    const VERSION: u32 = STORAGE_VERSION;
    const MINOR_VERSION: u32 = STORAGE_MINOR_VERSION;
}

pub struct ConfigEntries {
    storage: Arc<Storage>,

    /// Primary index: entry_id -> ConfigEntry
    entries: DashMap<String, ConfigEntry>,

    /// Index: domain -> set of entry_ids
    by_domain: DashMap<String, HashSet<String>>,

    /// Index: (domain, unique_id) -> entry_id
    by_unique_id: DashMap<(String, String), String>,
}

impl ConfigEntries {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            entries: DashMap::new(),
            by_domain: DashMap::new(),
            by_unique_id: DashMap::new(),
        }
    }

    /// Load entries from storage
    pub async fn load(&self) -> ConfigEntriesResult<()> {
        if let Some(data) = self.storage.load::<ConfigEntriesData>().await? {
            info!("Loading {} config entries from storage", data.entries.len());
            for entry in data.entries {
                self.index_entry(&entry);
            }
        }
        Ok(())
    }

    /// Save entries to storage
    pub async fn save(&self) -> ConfigEntriesResult<()> {
        let data = ConfigEntriesData {
            entries: self.entries.iter().map(|r| r.value().clone()).collect(),
        };
        self.storage.save(&data).await?;
        debug!("Saved {} config entries to storage", data.entries.len());
        Ok(())
    }

    fn index_entry(&self, entry: &ConfigEntry) {
        let entry_id = entry.entry_id.clone();

        self.entries.insert(entry_id.clone(), entry.clone());

        self.by_domain
            .entry(entry.domain.clone())
            .or_default()
            .insert(entry_id.clone());

        if let Some(ref unique_id) = entry.unique_id {
            self.by_unique_id
                .insert((entry.domain.clone(), unique_id.clone()), entry_id);
        }
    }

    fn unindex_entry(&self, entry: &ConfigEntry) {
        if let Some(mut ids) = self.by_domain.get_mut(&entry.domain) {
            ids.remove(&entry.entry_id);
        }

        if let Some(ref unique_id) = entry.unique_id {
            self.by_unique_id
                .remove(&(entry.domain.clone(), unique_id.clone()));
        }

        self.entries.remove(&entry.entry_id);
    }

    /// Get an entry by ID
    pub fn get(&self, entry_id: &str) -> Option<ConfigEntry> {
        self.entries.get(entry_id).map(|r| r.value().clone())
    }

    /// Get all entries for a domain
    pub fn get_by_domain(&self, domain: &str) -> Vec<ConfigEntry> {
        self.by_domain
            .get(domain)
            .map(|ids| ids.iter().filter_map(|id| self.get(id)).collect())
            .unwrap_or_default()
    }

    /// Get entry by unique_id
    pub fn get_by_unique_id(&self, domain: &str, unique_id: &str) -> Option<ConfigEntry> {
        self.by_unique_id
            .get(&(domain.to_string(), unique_id.to_string()))
            .and_then(|entry_id| self.get(&entry_id))
    }

    /// Add a new config entry, rejecting a duplicate (domain, unique_id)
    pub async fn add(&self, entry: ConfigEntry) -> ConfigEntriesResult<ConfigEntry> {
        if let Some(ref unique_id) = entry.unique_id {
            if self.get_by_unique_id(&entry.domain, unique_id).is_some() {
                return Err(ConfigEntriesError::AlreadyExists {
                    domain: entry.domain.clone(),
                    unique_id: unique_id.clone(),
                });
            }
        }

        self.index_entry(&entry);
        if let Err(err) = self.save().await {
            warn!("Failed to persist config entry {}: {}", entry.entry_id, err);
            self.unindex_entry(&entry);
            return Err(err);
        }

        info!(
            "Added config entry: {} ({}) [{}]",
            entry.title, entry.domain, entry.entry_id
        );

        Ok(entry)
    }

    /// Remove an entry
    pub async fn remove(&self, entry_id: &str) -> ConfigEntriesResult<ConfigEntry> {
        let entry = self
            .get(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;

        self.unindex_entry(&entry);
        if let Err(err) = self.save().await {
            warn!("Failed to persist removal of {}: {}", entry_id, err);
            self.index_entry(&entry);
            return Err(err);
        }

        info!(
            "Removed config entry: {} ({}) [{}]",
            entry.title, entry.domain, entry_id
        );

        Ok(entry)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl UniqueIdLookup for ConfigEntries {
    fn is_configured(&self, domain: &str, unique_id: &str) -> bool {
        self.by_unique_id
            .contains_key(&(domain.to_string(), unique_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::ConfigEntrySource;

    use tempfile::TempDir;

    fn create_test_manager() -> (TempDir, ConfigEntries) {
        let temp_dir = TempDir::new().unwrap();
        let storage = Arc::new(Storage::new(temp_dir.path()));
        let manager = ConfigEntries::new(storage);
        (temp_dir, manager)
    }

    #[tokio::test]
    async fn test_add_entry() {
        let (_dir, manager) = create_test_manager();

        let entry = ConfigEntry::new("wolflink", "Boiler1").with_unique_id("42");

        let added = manager.add(entry).await.unwrap();
        assert_eq!(added.domain, "wolflink");
        assert_eq!(manager.len(), 1);
        assert!(manager.is_configured("wolflink", "42"));
        assert!(!manager.is_configured("wolflink", "43"));
        assert!(!manager.is_configured("hue", "42"));
    }

    #[tokio::test]
    async fn test_failed_save_leaves_nothing_indexed() {
        let temp_dir = TempDir::new().unwrap();
        // A plain file where the storage directory should be
        std::fs::write(temp_dir.path().join(".storage"), b"").unwrap();
        let manager = ConfigEntries::new(Arc::new(Storage::new(temp_dir.path())));

        let result = manager
            .add(ConfigEntry::new("wolflink", "Boiler1").with_unique_id("42"))
            .await;

        assert!(matches!(result, Err(ConfigEntriesError::Storage(_))));
        assert_eq!(manager.len(), 0);
        assert!(!manager.is_configured("wolflink", "42"));
        assert!(manager.get_by_domain("wolflink").is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_unique_id_rejected() {
        let (_dir, manager) = create_test_manager();

        let entry1 = ConfigEntry::new("wolflink", "Boiler 1").with_unique_id("42");
        let entry2 = ConfigEntry::new("wolflink", "Boiler 2").with_unique_id("42");

        manager.add(entry1).await.unwrap();
        let result = manager.add(entry2).await;

        assert!(matches!(
            result,
            Err(ConfigEntriesError::AlreadyExists { .. })
        ));
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test]
    async fn test_get_by_domain() {
        let (_dir, manager) = create_test_manager();

        manager.add(ConfigEntry::new("wolflink", "A")).await.unwrap();
        manager.add(ConfigEntry::new("wolflink", "B")).await.unwrap();
        manager.add(ConfigEntry::new("mqtt", "MQTT")).await.unwrap();

        assert_eq!(manager.get_by_domain("wolflink").len(), 2);
        assert_eq!(manager.get_by_domain("mqtt").len(), 1);
        assert!(manager.get_by_domain("hue").is_empty());
    }

    #[tokio::test]
    async fn test_remove_releases_unique_id() {
        let (_dir, manager) = create_test_manager();

        let entry = manager
            .add(ConfigEntry::new("wolflink", "Boiler").with_unique_id("42"))
            .await
            .unwrap();

        manager.remove(&entry.entry_id).await.unwrap();
        assert!(manager.is_empty());
        assert!(!manager.is_configured("wolflink", "42"));

        let missing = manager.remove(&entry.entry_id).await;
        assert!(matches!(missing, Err(ConfigEntriesError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Arc::new(Storage::new(temp_dir.path()));

        {
            let manager = ConfigEntries::new(storage.clone());
            manager
                .add(
                    ConfigEntry::new("wolflink", "Boiler")
                        .with_unique_id("42")
                        .with_version(1, 2)
                        .with_source(ConfigEntrySource::Import),
                )
                .await
                .unwrap();
        }

        {
            let manager = ConfigEntries::new(storage);
            manager.load().await.unwrap();

            assert_eq!(manager.len(), 1);
            let entry = manager.get_by_unique_id("wolflink", "42").unwrap();
            assert_eq!(entry.title, "Boiler");
            assert_eq!(entry.minor_version, 2);
            assert_eq!(entry.source, ConfigEntrySource::Import);
        }
    }
}
