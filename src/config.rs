//! Exposure configuration: which broker to talk to, how to name the device and
//! which rows may be exposed at all.

use crate::error::{BridgeError, Result};
use crate::model::RowId;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeSet;

pub const DEFAULT_MQTT_PORT: u16 = 1883;
pub const DEFAULT_DISCOVERY_PREFIX: &str = "homeassistant";
pub const DEFAULT_DEVICE_NAME: &str = "IO Hub";
pub const DEFAULT_CONFIG_UI_PORT: u16 = 3000;

/// Bridge configuration as persisted in the key-value store
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExposureConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub mqtt_host: Option<String>,
    #[serde(default = "default_mqtt_port")]
    pub mqtt_port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_discovery_prefix")]
    pub discovery_prefix: String,
    #[serde(default = "default_device_name")]
    pub device_name: String,
    #[serde(default)]
    pub io_instance_id: Option<String>,
    /// Port of the host's web UI, used for the device's configuration link
    #[serde(default = "default_config_ui_port")]
    pub config_ui_port: u16,
    /// Master exposure list; anything that is not a list of strings reads as empty
    #[serde(default, deserialize_with = "lenient_row_ids")]
    pub exposed_row_ids: BTreeSet<RowId>,
}

fn default_mqtt_port() -> u16 {
    DEFAULT_MQTT_PORT
}

fn default_discovery_prefix() -> String {
    DEFAULT_DISCOVERY_PREFIX.to_string()
}

fn default_device_name() -> String {
    DEFAULT_DEVICE_NAME.to_string()
}

fn default_config_ui_port() -> u16 {
    DEFAULT_CONFIG_UI_PORT
}

fn lenient_row_ids<'de, D>(deserializer: D) -> std::result::Result<BTreeSet<RowId>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    let ids = match value {
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .filter_map(serde_json::Value::as_str)
            .map(RowId::from)
            .collect(),
        _ => BTreeSet::new(),
    };
    Ok(ids)
}

impl Default for ExposureConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mqtt_host: None,
            mqtt_port: DEFAULT_MQTT_PORT,
            username: None,
            password: None,
            discovery_prefix: default_discovery_prefix(),
            device_name: default_device_name(),
            io_instance_id: None,
            config_ui_port: DEFAULT_CONFIG_UI_PORT,
            exposed_row_ids: BTreeSet::new(),
        }
    }
}

impl ExposureConfig {
    /// Non-empty broker host, if configured
    pub fn host(&self) -> Option<&str> {
        non_empty(self.mqtt_host.as_deref())
    }

    /// Non-empty instance id, if configured
    pub fn instance_id(&self) -> Option<&str> {
        non_empty(self.io_instance_id.as_deref())
    }

    /// Checks the fields every broker-facing operation needs
    pub fn validate(&self) -> Result<()> {
        if self.host().is_none() {
            return Err(BridgeError::ConfigInvalid("mqttHost is not set".into()));
        }
        if self.instance_id().is_none() {
            return Err(BridgeError::ConfigInvalid("ioInstanceId is not set".into()));
        }
        Ok(())
    }

    /// Applies a merge-patch and reports what kind of change it was
    pub fn apply(&mut self, patch: ConfigPatch) -> ConfigChange {
        let before = self.clone();

        if let Some(enabled) = patch.enabled {
            self.enabled = enabled;
        }
        if let Some(host) = patch.mqtt_host {
            self.mqtt_host = host;
        }
        if let Some(port) = patch.mqtt_port {
            self.mqtt_port = port;
        }
        if let Some(username) = patch.username {
            self.username = username;
        }
        if let Some(password) = patch.password {
            self.password = password;
        }
        if let Some(prefix) = patch.discovery_prefix {
            self.discovery_prefix = prefix;
        }
        if let Some(name) = patch.device_name {
            self.device_name = name;
        }
        if let Some(instance) = patch.io_instance_id {
            self.io_instance_id = instance;
        }
        if let Some(port) = patch.config_ui_port {
            self.config_ui_port = port;
        }
        if let Some(ids) = patch.exposed_row_ids {
            self.exposed_row_ids = ids;
        }

        ConfigChange {
            connection_changed: before.connection_fields() != self.connection_fields(),
            enabled_changed: before.enabled != self.enabled,
            exposure_changed: before.exposed_row_ids != self.exposed_row_ids,
            device_changed: before.device_name != self.device_name
                || before.config_ui_port != self.config_ui_port,
        }
    }

    fn connection_fields(&self) -> ConnectionFields<'_> {
        (
            self.mqtt_host.as_deref(),
            self.mqtt_port,
            self.username.as_deref(),
            self.password.as_deref(),
            self.io_instance_id.as_deref(),
            self.discovery_prefix.as_str(),
        )
    }
}

type ConnectionFields<'a> = (
    Option<&'a str>,
    u16,
    Option<&'a str>,
    Option<&'a str>,
    Option<&'a str>,
    &'a str,
);

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Merge-patch for [`ExposureConfig`]
///
/// `None` leaves a field untouched. For optional fields the inner `Option`
/// allows clearing them.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigPatch {
    pub enabled: Option<bool>,
    pub mqtt_host: Option<Option<String>>,
    pub mqtt_port: Option<u16>,
    pub username: Option<Option<String>>,
    pub password: Option<Option<String>>,
    pub discovery_prefix: Option<String>,
    pub device_name: Option<String>,
    pub io_instance_id: Option<Option<String>>,
    pub config_ui_port: Option<u16>,
    pub exposed_row_ids: Option<BTreeSet<RowId>>,
}

/// What an applied patch touched
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfigChange {
    /// Broker identity or topic namespace changed
    pub connection_changed: bool,
    pub enabled_changed: bool,
    pub exposure_changed: bool,
    /// Device descriptor fields changed
    pub device_changed: bool,
}

impl ConfigChange {
    /// Whether the change requires unregister + reconnect
    pub fn requires_reconnect(&self) -> bool {
        self.connection_changed || self.enabled_changed
    }
}
