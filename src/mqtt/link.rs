use tracing::debug;

/// Outbound side of a broker connection
///
/// Every operation is fire-and-forget: it returns `false` without queuing when
/// the connection is not live. Discovery payloads are retained and idempotent,
/// so the next full reconciliation after a reconnect restores anything that was
/// dropped here.
pub trait MqttLink {
    fn is_connected(&self) -> bool;

    /// Publishes at QoS 1
    fn publish(&self, topic: &str, payload: &str, retain: bool) -> bool;

    /// Subscribes at QoS 1
    fn subscribe(&self, topic: &str) -> bool;

    fn unsubscribe(&self, topic: &str) -> bool;
}

/// Link used when there is no connection handle at all
#[derive(Debug, Default, Clone, Copy)]
pub struct OfflineLink;

impl MqttLink for OfflineLink {
    fn is_connected(&self) -> bool {
        false
    }

    fn publish(&self, topic: &str, _payload: &str, _retain: bool) -> bool {
        debug!("No connection, publish to {} skipped", topic);
        false
    }

    fn subscribe(&self, topic: &str) -> bool {
        debug!("No connection, subscribe to {} skipped", topic);
        false
    }

    fn unsubscribe(&self, topic: &str) -> bool {
        debug!("No connection, unsubscribe from {} skipped", topic);
        false
    }
}
