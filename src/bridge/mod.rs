//! # Bridge Orchestrator
//!
//! Wires the connection manager, discovery publisher and reconciliation engine
//! together and owns all bridge state.
//!
//! ## Concurrency
//!
//! A [`Bridge`] is moved onto a single tokio task by [`BridgeHandle::spawn`].
//! Operator commands arrive over an mpsc channel, connection events over a
//! per-connection channel, and the task handles one at a time. Every
//! registry mutation is therefore serialized without locks.
//!
//! ```text
//!  BridgeHandle ──BridgeCommand──► ┌──────────────┐ ──publish──► broker
//!                                  │ bridge task  │
//!  MqttConnection ──ConnectionEvent►│  (Bridge)    │ ──trigger──► HostApp
//!                                  └──────┬───────┘
//!                                         └──watch──► BridgeStatus
//! ```
//!
//! ## Registration Lifecycle
//!
//! `ha_registered` is the persisted operator intent. While it is set, every
//! `Connected` event clears the assumed registry and republishes the selector
//! and all desired rows. Ending the process leaves the retained entities in
//! place; only `unregister_device` removes them.

pub mod orchestrator;
pub mod status;
pub mod worker;

pub use orchestrator::{Bridge, DISCONNECT_GRACE};
pub use status::BridgeStatus;
pub use worker::{BridgeCommand, BridgeHandle};
