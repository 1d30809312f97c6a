use chrono::{DateTime, Utc};
use uuid::Uuid;

use parley_core::event::ChatMessage;

use crate::error::TransportError;

/// A chat line leaving this client, tagged so its echo and its persisted
/// copy can be matched back to the local entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub correlation_id: Uuid,
    pub sender: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl OutboundMessage {
    pub fn new(sender: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            sender: sender.into(),
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn to_chat_message(&self) -> ChatMessage {
        ChatMessage {
            id: None,
            sender: self.sender.clone(),
            text: self.text.clone(),
            timestamp: self.timestamp,
            is_system: false,
            is_private: false,
            correlation_id: Some(self.correlation_id),
        }
    }
}

/// Command side of the live channel.
///
/// Every call returns as soon as the command is handed to the transport.
/// Outcomes arrive later as `live.*` events on the event bus:
/// `connect` is confirmed by `live.connection.changed`, a sent message comes
/// back as `live.message.received`, and roster and typing changes arrive as
/// whole sets.
pub trait LiveTransport: Send + 'static {
    fn connect(&mut self, username: &str) -> Result<(), TransportError>;

    fn send(&mut self, message: &OutboundMessage) -> Result<(), TransportError>;

    fn set_typing(&mut self, typing: bool) -> Result<(), TransportError>;

    /// Still typing. Sent periodically during a burst so peers can expire
    /// entries whose stop never arrives. Not a new "start typing".
    fn keep_typing(&mut self) -> Result<(), TransportError>;

    fn disconnect(&mut self) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbound_message_keeps_correlation_on_conversion() {
        let outbound = OutboundMessage::new("alice", "hi");
        let message = outbound.to_chat_message();

        assert_eq!(message.correlation_id, Some(outbound.correlation_id));
        assert_eq!(message.sender, "alice");
        assert_eq!(message.text, "hi");
        assert!(message.id.is_none());
        assert!(!message.is_system);
    }

    #[test]
    fn each_outbound_message_gets_a_fresh_correlation_id() {
        let a = OutboundMessage::new("alice", "one");
        let b = OutboundMessage::new("alice", "one");
        assert_ne!(a.correlation_id, b.correlation_id);
    }
}
