use std::collections::HashMap;
use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::{ConfigError, Result};

/// Durable copy of device mappings and where each device was last seen
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PersistedConfig {
    /// device address -> target index
    pub mappings: HashMap<String, usize>,
    /// device address -> port it last identified on
    pub last_ports: HashMap<String, String>,
}

#[async_trait::async_trait]
pub trait ConfigStore: Send + Sync {
    async fn load(&self) -> Result<PersistedConfig>;
    async fn save(&self, config: &PersistedConfig) -> Result<()>;
}

/// Config persisted as pretty-printed JSON
pub struct JsonConfigStore {
    path: PathBuf,
    /// Saves share one temp file
    write_lock: Mutex<()>,
}

impl JsonConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> ConfigError {
        ConfigError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }
}

#[async_trait::async_trait]
impl ConfigStore for JsonConfigStore {
    async fn load(&self) -> Result<PersistedConfig> {
        match tokio::fs::read(&self.path).await {
            Ok(raw) => Ok(serde_json::from_slice(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("No config at {}, starting with empty mappings", self.path.display());
                Ok(PersistedConfig::default())
            }
            Err(e) => Err(self.io_error(e)),
        }
    }

    async fn save(&self, config: &PersistedConfig) -> Result<()> {
        let raw = serde_json::to_vec_pretty(config)?;
        let _guard = self.write_lock.lock().await;
        // Write next to the target and rename so a crash never leaves a truncated file
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, raw).await.map_err(|e| self.io_error(e))?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(|e| self.io_error(e))?;
        log::debug!("Saved config to {}", self.path.display());
        Ok(())
    }
}

/// In-memory store, for hosts without durable storage
#[derive(Default)]
pub struct MemoryConfigStore {
    config: Mutex<PersistedConfig>,
}

impl MemoryConfigStore {
    pub fn new(config: PersistedConfig) -> Self {
        Self { config: Mutex::new(config) }
    }

    pub async fn snapshot(&self) -> PersistedConfig {
        self.config.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn load(&self) -> Result<PersistedConfig> {
        Ok(self.snapshot().await)
    }

    async fn save(&self, config: &PersistedConfig) -> Result<()> {
        *self.config.lock().await = config.clone();
        Ok(())
    }
}
