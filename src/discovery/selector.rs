//! The single `select` entity that mirrors and switches the active profile

use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::device::DeviceDescriptor;
use super::topic::{EntityTopics, SELECTOR_OBJECT_ID};
use crate::config::ExposureConfig;
use crate::model::{ProfileDefinition, ProfileId};
use crate::mqtt::MqttLink;

/// Option meaning "no profile active, every row counts"
pub const NO_PROFILE_OPTION: &str = "None (All Rows Active)";
pub const SELECTOR_NAME: &str = "Active Profile";
pub const SELECTOR_ICON: &str = "mdi:format-list-bulleted";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SelectorDiscovery<'a> {
    #[serde(rename = "~")]
    pub base: String,
    pub name: &'static str,
    pub unique_id: String,
    pub cmd_t: &'static str,
    pub stat_t: &'static str,
    pub options: Vec<String>,
    pub device: &'a DeviceDescriptor,
    pub icon: &'static str,
}

/// What an inbound selector payload refers to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfileSelection {
    NoProfile,
    Profile(ProfileId),
    Unknown(String),
}

/// Sentinel first, then profile names in order, without duplicates
pub(crate) fn selector_options(profiles: &[ProfileDefinition]) -> Vec<String> {
    let mut options = vec![NO_PROFILE_OPTION.to_string()];
    for profile in profiles {
        if !options.contains(&profile.name) {
            options.push(profile.name.clone());
        }
    }
    options
}

/// State string for the active profile; the sentinel when none is active or
/// the id no longer resolves
pub(crate) fn selector_state(active: Option<&ProfileId>, profiles: &[ProfileDefinition]) -> String {
    match active {
        None => NO_PROFILE_OPTION.to_string(),
        Some(id) => match profiles.iter().find(|p| &p.id == id) {
            Some(profile) => profile.name.clone(),
            None => {
                warn!("Active profile {} is unknown, reporting no profile", id);
                NO_PROFILE_OPTION.to_string()
            }
        },
    }
}

pub fn resolve_selection(name: &str, profiles: &[ProfileDefinition]) -> ProfileSelection {
    let name = name.trim();
    if name == NO_PROFILE_OPTION {
        return ProfileSelection::NoProfile;
    }
    profiles
        .iter()
        .find(|p| p.name == name)
        .map_or_else(
            || ProfileSelection::Unknown(name.to_string()),
            |p| ProfileSelection::Profile(p.id.clone()),
        )
}

pub fn register_profile_selector_entity<L: MqttLink + ?Sized>(
    profiles: &[ProfileDefinition],
    active: Option<&ProfileId>,
    config: &ExposureConfig,
    device: &DeviceDescriptor,
    link: &L,
) -> bool {
    let topics = EntityTopics::selector(&config.discovery_prefix);
    let discovery = SelectorDiscovery {
        base: topics.base.clone(),
        name: SELECTOR_NAME,
        unique_id: format!("{}_{}", device.identifier(), SELECTOR_OBJECT_ID),
        cmd_t: "~/set",
        stat_t: "~/state",
        options: selector_options(profiles),
        device,
        icon: SELECTOR_ICON,
    };
    let payload = match serde_json::to_string(&discovery) {
        Ok(json) => json,
        Err(e) => {
            error!("Failed to serialize profile selector payload: {}", e);
            return false;
        }
    };

    if !link.publish(&topics.config, &payload, true) {
        warn!("Profile selector config not published");
        return false;
    }
    link.subscribe(&topics.command);
    publish_selector_state(active, profiles, config, link);
    info!(
        "Registered profile selector with {} options",
        discovery.options.len()
    );
    true
}

pub fn unregister_profile_selector_entity<L: MqttLink + ?Sized>(
    config: &ExposureConfig,
    link: &L,
) -> bool {
    if !link.is_connected() {
        debug!("Not connected, profile selector unregister skipped");
        return false;
    }
    let topics = EntityTopics::selector(&config.discovery_prefix);
    let cleared = link.publish(&topics.config, "", true);
    link.unsubscribe(&topics.command);
    info!("Unregistered profile selector");
    cleared
}

pub fn publish_selector_state<L: MqttLink + ?Sized>(
    active: Option<&ProfileId>,
    profiles: &[ProfileDefinition],
    config: &ExposureConfig,
    link: &L,
) -> bool {
    let topics = EntityTopics::selector(&config.discovery_prefix);
    let state = selector_state(active, profiles);
    debug!("Publishing profile selector state {:?}", state);
    link.publish(&topics.state, &state, true)
}
