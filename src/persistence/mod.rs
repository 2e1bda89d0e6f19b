//! # Persistence
//!
//! The bridge persists two things: the exposure config and the device-level
//! `ha_registered` flag. Both go through a plain string key-value store so the
//! host application can back it with whatever it already uses.
//!
//! ## Failure Handling
//! A missing key reads as "use the default". A value that does not parse is
//! logged and replaced by the default as well, so a corrupted entry never
//! prevents the bridge from starting.

pub mod file_store;
pub mod memory_store;

pub use file_store::TomlFileStore;
pub use memory_store::MemoryStore;

use std::future::Future;

use tracing::{debug, warn};

use crate::config::ExposureConfig;
use crate::error::Result;

pub const CONFIG_KEY: &str = "ha_exposure_config";
pub const REGISTERED_KEY: &str = "ha_registered";

/// String key-value store provided by the host
pub trait KeyValueStore: Send + Sync + 'static {
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<String>>> + Send;

    fn set(&self, key: &str, value: String) -> impl Future<Output = Result<()>> + Send;
}

pub async fn load_config<S: KeyValueStore>(store: &S) -> Result<ExposureConfig> {
    match store.get(CONFIG_KEY).await? {
        Some(raw) => match serde_json::from_str(&raw) {
            Ok(config) => Ok(config),
            Err(e) => {
                warn!("Stored exposure config is unreadable, using defaults: {}", e);
                Ok(ExposureConfig::default())
            }
        },
        None => {
            debug!("No stored exposure config, using defaults");
            Ok(ExposureConfig::default())
        }
    }
}

pub async fn save_config<S: KeyValueStore>(store: &S, config: &ExposureConfig) -> Result<()> {
    let raw = serde_json::to_string(config)?;
    store.set(CONFIG_KEY, raw).await
}

pub async fn load_registered_flag<S: KeyValueStore>(store: &S) -> Result<bool> {
    Ok(store
        .get(REGISTERED_KEY)
        .await?
        .is_some_and(|raw| raw.trim() == "true"))
}

pub async fn save_registered_flag<S: KeyValueStore>(store: &S, registered: bool) -> Result<()> {
    store.set(REGISTERED_KEY, registered.to_string()).await
}
