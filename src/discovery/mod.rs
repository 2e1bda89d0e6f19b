//! # Discovery Publisher
//!
//! Builds and (un)publishes Home Assistant MQTT-Discovery entities: one
//! `switch` per exposed row and one `select` for the active profile. All of
//! them hang off a single device block derived from the exposure config.
//!
//! Registration is idempotent: the same entity always maps to the same topic
//! and the same retained payload, so re-running it is harmless. Removal
//! publishes an empty retained payload to the config topic, which is how
//! Home Assistant expects entities to be deleted.

pub mod device;
pub mod entity;
pub mod selector;
pub mod topic;

pub use device::{compute_device_descriptor, DeviceDescriptor};
pub use entity::{register_entity, unregister_entity};
pub use selector::{
    publish_selector_state, register_profile_selector_entity, resolve_selection,
    unregister_profile_selector_entity, ProfileSelection,
};
pub use topic::CommandTopic;
