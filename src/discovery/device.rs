use serde::Serialize;
use tracing::debug;
use url::Url;

use crate::config::ExposureConfig;

pub const DEVICE_MODEL: &str = "IO Automation Hub";
pub const DEVICE_MANUFACTURER: &str = "IO";

/// Device block attached to every published entity so Home Assistant groups
/// them under one device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceDescriptor {
    pub identifiers: Vec<String>,
    pub name: String,
    pub model: String,
    pub manufacturer: String,
    pub sw_version: String,
    pub configuration_url: String,
}

impl DeviceDescriptor {
    /// `io_hub_<instance>`, also the prefix of every unique_id
    pub fn identifier(&self) -> &str {
        self.identifiers.first().map(String::as_str).unwrap_or_default()
    }
}

/// Derives the device block from the config; `None` without an instance id
pub fn compute_device_descriptor(config: &ExposureConfig) -> Option<DeviceDescriptor> {
    let instance = config.instance_id()?;
    Some(DeviceDescriptor {
        identifiers: vec![format!("io_hub_{instance}")],
        name: config.device_name.clone(),
        model: DEVICE_MODEL.to_string(),
        manufacturer: DEVICE_MANUFACTURER.to_string(),
        sw_version: env!("CARGO_PKG_VERSION").to_string(),
        configuration_url: configuration_url(config),
    })
}

/// Points at the host's web UI on the broker's host, or at localhost when the
/// broker host does not parse
fn configuration_url(config: &ExposureConfig) -> String {
    config
        .host()
        .and_then(|raw| ui_url_on(raw, config.config_ui_port))
        .unwrap_or_else(|| {
            debug!("Using fallback configuration_url");
            format!("http://localhost:{}/", config.config_ui_port)
        })
}

fn ui_url_on(raw_host: &str, port: u16) -> Option<String> {
    let candidate = if raw_host.contains("://") {
        raw_host.to_string()
    } else {
        format!("http://{raw_host}")
    };
    let parsed = Url::parse(&candidate).ok()?;
    let host = parsed.host_str()?;

    let mut url = Url::parse(&format!("http://{host}")).ok()?;
    url.set_port(Some(port)).ok()?;
    url.set_path("/");
    url.set_query(None);
    Some(url.to_string())
}
