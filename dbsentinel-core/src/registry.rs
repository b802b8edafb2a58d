//! Registry of connection descriptors.
//!
//! Holds both the descriptors registered by callers and the node-scoped
//! ones created during cluster discovery, keyed by id.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::datasource::DataSource;
use crate::error::{MonitorError, Result};

/// Concurrent id → [`DataSource`] map.
#[derive(Debug, Default)]
pub struct DataSourceRegistry {
    sources: DashMap<String, DataSource>,
}

impl DataSourceRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a descriptor. Returns the replaced one.
    pub fn upsert(&self, data_source: DataSource) -> Option<DataSource> {
        self.sources
            .insert(data_source.id().to_string(), data_source)
    }

    /// Removes a descriptor. Returns it when it was registered.
    pub fn remove(&self, id: &str) -> Option<DataSource> {
        self.sources.remove(id).map(|(_, data_source)| data_source)
    }

    /// Looks a descriptor up.
    pub fn find(&self, id: &str) -> Option<DataSource> {
        self.sources.get(id).map(|entry| entry.value().clone())
    }

    /// Looks a descriptor up, failing when it is absent.
    ///
    /// # Errors
    /// Returns [`MonitorError::NotRegistered`] for unknown ids.
    pub fn get(&self, id: &str) -> Result<DataSource> {
        self.find(id)
            .ok_or_else(|| MonitorError::not_registered("DataSource", id))
    }

    /// Returns the descriptor registered under `id`, creating it once.
    ///
    /// `create` runs at most once per id, even with concurrent callers.
    ///
    /// # Errors
    /// Propagates the error of `create`; nothing is registered then.
    pub fn get_or_try_insert_with<F>(&self, id: &str, create: F) -> Result<DataSource>
    where
        F: FnOnce() -> Result<DataSource>,
    {
        match self.sources.entry(id.to_string()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let data_source = create()?;
                entry.insert(data_source.clone());
                Ok(data_source)
            }
        }
    }

    /// All descriptors, sorted by id
    pub fn all(&self) -> Vec<DataSource> {
        let mut sources: Vec<DataSource> =
            self.sources.iter().map(|e| e.value().clone()).collect();
        sources.sort_by(|a, b| a.id().cmp(b.id()));
        sources
    }

    /// Number of descriptors
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// Returns true when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}
