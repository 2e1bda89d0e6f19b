//! Home Assistant bridge for the IO automation hub
//!
//! Exposes automation rows as MQTT-Discovery `switch` entities and the active
//! profile as a `select` entity, and routes Home Assistant commands back into
//! the host.
//!
//! The host plugs in through two traits: [`host::HostApp`] for row/profile
//! snapshots and intent dispatch, and [`persistence::KeyValueStore`] for the
//! persisted config. [`bridge::BridgeHandle`] is the entry point.

pub mod bridge;
pub mod config;
pub mod discovery;
pub mod error;
pub mod host;
pub mod model;
pub mod mqtt;
pub mod persistence;
pub mod reconcile;

pub use bridge::{Bridge, BridgeHandle, BridgeStatus};
pub use config::{ConfigChange, ConfigPatch, ExposureConfig};
pub use error::{BridgeError, Result};
pub use host::HostApp;
