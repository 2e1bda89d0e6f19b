use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::KeyValueStore;
use crate::error::{BridgeError, Result};

const CONFIG_DIR: &str = ".config/io-hass-bridge";
const STORE_FILE: &str = "store.toml";

/// Key-value store kept in one TOML file
///
/// The whole map is cached in memory and rewritten on every `set`.
#[derive(Debug)]
pub struct TomlFileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl TomlFileStore {
    /// `~/.config/io-hass-bridge`
    pub fn config_dir() -> PathBuf {
        let mut path = dirs::home_dir().unwrap_or_else(|| {
            warn!("Could not determine home directory, using current directory");
            PathBuf::from(".")
        });
        path.push(CONFIG_DIR);
        path
    }

    pub fn default_path() -> PathBuf {
        Self::config_dir().join(STORE_FILE)
    }

    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let exists = tokio::fs::try_exists(&path)
            .await
            .map_err(|e| BridgeError::Persistence(format!("Failed to check store file: {e}")))?;

        let entries = if exists {
            let content = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| BridgeError::Persistence(format!("Failed to read store file: {e}")))?;
            match toml::from_str(&content) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("Store file {:?} is not valid TOML, starting empty: {}", path, e);
                    BTreeMap::new()
                }
            }
        } else {
            debug!("Store file {:?} does not exist yet", path);
            BTreeMap::new()
        };

        info!("Opened store {:?} with {} entries", path, entries.len());
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    async fn flush(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                BridgeError::Persistence(format!("Failed to create store directory: {e}"))
            })?;
        }
        let content = toml::to_string_pretty(entries)
            .map_err(|e| BridgeError::Serialization(format!("Failed to serialize store: {e}")))?;
        tokio::fs::write(&self.path, content)
            .await
            .map_err(|e| BridgeError::Persistence(format!("Failed to write store file: {e}")))
    }
}

impl KeyValueStore for TomlFileStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        let mut entries = self.entries.lock().await;
        entries.insert(key.to_string(), value);
        self.flush(&entries).await?;
        debug!("Stored {}", key);
        Ok(())
    }
}
