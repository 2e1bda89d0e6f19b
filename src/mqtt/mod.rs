//! # MQTT Transport
//!
//! Broker connectivity for the Home Assistant bridge. The bridge never talks to
//! rumqttc directly; it sees a [`link::MqttLink`] for outbound traffic and a
//! stream of [`connection::ConnectionEvent`]s for everything coming back.
//!
//! ## Module Layout
//!
//! ```text
//! mqtt/
//! ├── connection.rs  - Client lifecycle, event loop task, connector seam
//! ├── link.rs        - Outbound operations (publish/subscribe/unsubscribe)
//! └── message.rs     - Inbound message representation
//! ```
//!
//! ## Delivery Model
//!
//! There is no outbound queue. When the client is not connected every outbound
//! call returns `false` and the packet is gone. Consistency is restored by the
//! bridge re-running a full reconciliation on every `Connected` event, which
//! republishes all retained discovery payloads.

pub mod connection;
pub mod link;
pub mod message;

pub use connection::{
    connect, disconnect, ConnectionEvent, ConnectionState, Connector, MqttConnection,
    RumqttConnector,
};
pub use link::{MqttLink, OfflineLink};
pub use message::MqttMessage;
