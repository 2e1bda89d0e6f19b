use chrono::{DateTime, Local};
use std::fmt;

/// An inbound MQTT publish as seen by the bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: String,
    pub received_at: DateTime<Local>,
}

impl MqttMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        MqttMessage {
            topic: topic.into(),
            payload: payload.into(),
            received_at: Local::now(),
        }
    }

    /// Builds a message from raw bytes, replacing invalid UTF-8
    pub fn from_bytes(topic: impl Into<String>, payload: &[u8]) -> Self {
        Self::new(topic, String::from_utf8_lossy(payload).into_owned())
    }
}

impl fmt::Display for MqttMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let preview: String = self.payload.chars().take(32).collect();
        write!(f, "{} {} - {}", self.received_at.format("%H:%M:%S"), self.topic, preview)
    }
}
