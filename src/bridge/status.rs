use chrono::{DateTime, Local};

use crate::mqtt::ConnectionState;

const MAX_ERROR_MESSAGES: usize = 20;

/// Snapshot of the bridge broadcast after every state change
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BridgeStatus {
    pub connection_state: ConnectionState,
    pub ha_registered: bool,
    /// Size of the assumed registry
    pub registered_entities: usize,
    pub messages_received: usize,
    /// Most recent errors, oldest first
    pub error_messages: Vec<String>,
    pub last_activity: Option<DateTime<Local>>,
}

impl BridgeStatus {
    pub fn push_error(&mut self, message: String) {
        self.error_messages.push(message);
        if self.error_messages.len() > MAX_ERROR_MESSAGES {
            let overflow = self.error_messages.len() - MAX_ERROR_MESSAGES;
            self.error_messages.drain(..overflow);
        }
    }

    pub fn last_error(&self) -> Option<&str> {
        self.error_messages.last().map(String::as_str)
    }
}
