//! Per-row switch entities

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::device::DeviceDescriptor;
use super::topic::{row_object_id, EntityTopics};
use crate::config::ExposureConfig;
use crate::model::{AutomationRow, RowId};
use crate::mqtt::MqttLink;

pub const DEFAULT_ROW_ICON: &str = "mdi:lightning-bolt";
pub const PAYLOAD_ON: &str = "ON";
pub const PAYLOAD_OFF: &str = "OFF";

const AUDIO_EXTENSIONS: [&str; 8] = ["mp3", "wav", "ogg", "flac", "m4a", "aac", "opus", "webm"];

/// Home Assistant MQTT-Discovery payload for one row switch
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SwitchDiscovery<'a> {
    #[serde(rename = "~")]
    pub base: String,
    pub name: String,
    pub unique_id: String,
    pub cmd_t: &'static str,
    pub stat_t: &'static str,
    pub payload_on: &'static str,
    pub payload_off: &'static str,
    pub state_on: &'static str,
    pub state_off: &'static str,
    pub optimistic: bool,
    pub device: &'a DeviceDescriptor,
    pub icon: String,
}

impl<'a> SwitchDiscovery<'a> {
    pub fn for_row(
        row: &AutomationRow,
        topics: &EntityTopics,
        device: &'a DeviceDescriptor,
    ) -> Self {
        Self {
            base: topics.base.clone(),
            name: friendly_name(row),
            unique_id: format!("{}_{}", device.identifier(), row_object_id(&row.id)),
            cmd_t: "~/set",
            stat_t: "~/state",
            payload_on: PAYLOAD_ON,
            payload_off: PAYLOAD_OFF,
            state_on: PAYLOAD_ON,
            state_off: PAYLOAD_OFF,
            optimistic: true,
            device,
            icon: entity_icon(row.output.icon.as_deref()),
        }
    }
}

/// Picks the first usable label from the row's output
///
/// Order: `label`, `settings.label`, `data.text`, `data.originalFileName`
/// without its audio extension, `name`, then `IO Row <short id>`.
pub(crate) fn friendly_name(row: &AutomationRow) -> String {
    let output = &row.output;
    let candidates = [
        output.label.clone(),
        string_field(output.settings.get("label")),
        string_field(output.data.get("text")),
        string_field(output.data.get("originalFileName")).map(|f| strip_audio_extension(&f)),
        output.name.clone(),
    ];

    candidates
        .into_iter()
        .flatten()
        .map(|c| c.trim().to_string())
        .find(|c| !c.is_empty())
        .unwrap_or_else(|| {
            let short: String = row.id.as_str().chars().take(8).collect();
            format!("IO Row {short}")
        })
}

fn string_field(value: Option<&Value>) -> Option<String> {
    value.and_then(Value::as_str).map(str::to_string)
}

fn strip_audio_extension(file_name: &str) -> String {
    match file_name.rsplit_once('.') {
        Some((stem, ext))
            if !stem.is_empty()
                && AUDIO_EXTENSIONS
                    .iter()
                    .any(|known| known.eq_ignore_ascii_case(ext)) =>
        {
            stem.to_string()
        }
        _ => file_name.to_string(),
    }
}

/// `mdi:` icons pass through, anything else becomes the default
pub(crate) fn entity_icon(icon: Option<&str>) -> String {
    match icon {
        Some(icon) if icon.starts_with("mdi:") => icon.to_string(),
        _ => DEFAULT_ROW_ICON.to_string(),
    }
}

/// Publishes the discovery config, subscribes the command topic and seeds the
/// state topic with `OFF`
///
/// Returns whether the discovery config went out.
pub fn register_entity<L: MqttLink + ?Sized>(
    row: &AutomationRow,
    config: &ExposureConfig,
    device: &DeviceDescriptor,
    link: &L,
) -> bool {
    let topics = EntityTopics::switch(&config.discovery_prefix, &row.id);
    let payload = match serde_json::to_string(&SwitchDiscovery::for_row(row, &topics, device)) {
        Ok(json) => json,
        Err(e) => {
            error!("Failed to serialize discovery payload for {}: {}", row.id, e);
            return false;
        }
    };

    if !link.publish(&topics.config, &payload, true) {
        warn!("Discovery config for row {} not published", row.id);
        return false;
    }
    link.subscribe(&topics.command);
    link.publish(&topics.state, PAYLOAD_OFF, true);
    info!("Registered row {} as {}", row.id, topics.base);
    true
}

/// Clears the retained discovery config and drops the command subscription
///
/// Best-effort: nothing happens when the link is down.
pub fn unregister_entity<L: MqttLink + ?Sized>(
    row_id: &RowId,
    config: &ExposureConfig,
    link: &L,
) -> bool {
    let topics = EntityTopics::switch(&config.discovery_prefix, row_id);
    if !link.is_connected() {
        debug!("Not connected, unregister of row {} skipped", row_id);
        return false;
    }
    let cleared = link.publish(&topics.config, "", true);
    link.unsubscribe(&topics.command);
    info!("Unregistered row {}", row_id);
    cleared
}
