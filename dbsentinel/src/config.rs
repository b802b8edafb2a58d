//! Configuration file of the command line.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use dbsentinel_core::{DataSource, MonitorConfig};
use serde::{Deserialize, Serialize};

/// Contents of the JSON configuration file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentinelConfig {
    /// Engine tuning; every field is optional
    #[serde(default)]
    pub monitor: MonitorConfig,
    /// Databases to monitor
    #[serde(default)]
    pub data_sources: Vec<DataSourceEntry>,
}

/// One configured database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSourceEntry {
    /// Unique id
    pub id: String,
    /// Display name, defaults to the id
    #[serde(default)]
    pub name: Option<String>,
    /// Connection URI, credentials included
    pub uri: String,
    /// Free text
    #[serde(default)]
    pub description: Option<String>,
    /// Driver properties
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    /// Statement timeout in seconds
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl DataSourceEntry {
    /// Builds the descriptor.
    ///
    /// # Errors
    /// Returns a configuration error when the URI does not parse.
    pub fn to_data_source(&self) -> dbsentinel_core::Result<DataSource> {
        let name = self.name.as_deref().unwrap_or(&self.id);
        let mut data_source = DataSource::new(self.id.as_str(), name, &self.uri)?;
        if let Some(description) = &self.description {
            data_source = data_source.with_description(description.as_str());
        }
        for (key, value) in &self.properties {
            data_source = data_source.with_property(key.as_str(), value.as_str());
        }
        if let Some(secs) = self.timeout_secs {
            data_source = data_source.with_timeout(Duration::from_secs(secs));
        }
        Ok(data_source)
    }
}

impl SentinelConfig {
    /// Reads and validates a configuration file.
    ///
    /// # Errors
    /// Fails when the file cannot be read, is not valid JSON or holds an
    /// invalid monitor configuration.
    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("Invalid configuration in {}", path.display()))?;
        config.monitor.validate()?;
        Ok(config)
    }
}
