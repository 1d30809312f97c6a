use chrono::{DateTime, Utc};
use globset::{Glob, GlobMatcher};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::EventBusError;

/// Hierarchical channel name validation and parsing.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Channel(String);

impl Channel {
    /// Create a new channel, validating its format.
    pub fn new(name: impl Into<String>) -> std::result::Result<Self, EventBusError> {
        let name = name.into();
        if Self::is_valid(&name) {
            Ok(Self(name))
        } else {
            Err(EventBusError::InvalidChannel(name))
        }
    }

    /// Check if a channel name is valid.
    pub fn is_valid(name: &str) -> bool {
        if name.is_empty() || name.starts_with('.') || name.ends_with('.') || name.contains("..") {
            return false;
        }

        // Must be lowercase and only contain a-z, 0-9, and dots
        if name
            .chars()
            .any(|c| !matches!(c, 'a'..='z' | '0'..='9' | '.'))
        {
            return false;
        }

        matches!(
            name.split('.').next(),
            Some("system") | Some("live") | Some("ui")
        )
    }

    /// Get the domain of the channel.
    pub fn domain(&self) -> &str {
        self.0.split('.').next().unwrap_or("")
    }

    /// Get the full channel name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Channel> for String {
    fn from(channel: Channel) -> Self {
        channel.0
    }
}

/// The standard event envelope wrapping all events in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Hierarchical channel name (e.g., "live.message.received")
    pub channel: Channel,

    /// When the event was created (UTC)
    pub timestamp: DateTime<Utc>,

    /// Unique identifier for this event
    pub id: Uuid,

    /// Optional correlation ID linking related events (e.g., a send and its echo)
    pub correlation_id: Option<Uuid>,

    /// Source component that emitted this event
    pub source: EventSource,

    /// The typed event payload
    pub payload: EventPayload,
}

impl Event {
    /// Create a new event with a given channel and payload.
    pub fn new(channel: Channel, source: EventSource, payload: EventPayload) -> Self {
        Self {
            channel,
            timestamp: Utc::now(),
            id: Uuid::new_v4(),
            correlation_id: None,
            source,
            payload,
        }
    }

    /// Create a new event with a correlation ID.
    pub fn with_correlation(
        channel: Channel,
        source: EventSource,
        payload: EventPayload,
        correlation_id: Uuid,
    ) -> Self {
        Self {
            correlation_id: Some(correlation_id),
            ..Self::new(channel, source, payload)
        }
    }
}

/// Identifies the source of an event
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "camelCase")]
pub enum EventSource {
    /// Core client component
    System(String),
    /// Live transport
    Live,
    /// User interface
    Ui,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum EventPayload {
    // ── System events ──────────────────────────────────────────────
    IdentityReady {
        identity_id: String,
    },
    IdentityFailed {
        reason: String,
    },
    ShutdownRequested {
        reason: String,
    },
    ErrorOccurred {
        component: String,
        message: String,
        recoverable: bool,
    },

    // ── Live transport events ──────────────────────────────────────
    ConnectionChanged {
        connected: bool,
    },
    MessageReceived {
        message: ChatMessage,
    },
    PresenceReceived {
        users: Vec<PresenceEntry>,
    },
    /// The full typing set. `typist` names the user whose signal produced
    /// this update, if any.
    TypingReceived {
        usernames: Vec<String>,
        #[serde(default)]
        typist: Option<String>,
    },

    // ── UI command events (consumed by the chat session) ──────────
    UsernameChosen {
        username: String,
    },
    InputChanged {
        text: String,
    },
    MessageSendRequested {
        body: String,
    },
}

/// A single conversation message, durable or live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Store-assigned ID; live messages may be unidentified
    pub id: Option<String>,

    /// Display name of the sender
    pub sender: String,

    /// Plain-text message body
    pub text: String,

    /// When the message was sent (UTC)
    pub timestamp: DateTime<Utc>,

    /// Join/leave notices and similar server-generated lines
    pub is_system: bool,

    pub is_private: bool,

    /// Client-generated ID linking a live send with its persisted copy
    pub correlation_id: Option<Uuid>,
}

impl ChatMessage {
    pub const SYSTEM_SENDER: &'static str = "system";

    /// Create an unidentified user message stamped with the current time.
    pub fn new(sender: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: None,
            sender: sender.into(),
            text: text.into(),
            timestamp: Utc::now(),
            is_system: false,
            is_private: false,
            correlation_id: None,
        }
    }

    /// Create a server-style notice such as "alice joined".
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            is_system: true,
            ..Self::new(Self::SYSTEM_SENDER, text)
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }
}

/// An entry in the online roster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub user_id: String,
    pub username: String,
}

impl PresenceEntry {
    pub fn new(user_id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            username: username.into(),
        }
    }
}

pub trait EventBus: Send + Sync + 'static {
    fn publish(&self, event: Event) -> std::result::Result<(), EventBusError>;
    fn subscribe(&self, pattern: &str) -> std::result::Result<EventSubscription, EventBusError>;

    /// Validate `channel` and publish a freshly stamped event on it.
    fn emit(
        &self,
        channel: &str,
        source: EventSource,
        payload: EventPayload,
    ) -> std::result::Result<(), EventBusError> {
        self.publish(Event::new(Channel::new(channel)?, source, payload))
    }
}

#[derive(Clone)]
pub struct BroadcastEventBus {
    system_sender: broadcast::Sender<Event>,
    live_sender: broadcast::Sender<Event>,
    ui_sender: broadcast::Sender<Event>,
}

impl BroadcastEventBus {
    pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

    pub fn new(channel_capacity: usize) -> Self {
        let capacity = channel_capacity.max(1);
        let (system_sender, _) = broadcast::channel(capacity);
        let (live_sender, _) = broadcast::channel(capacity);
        let (ui_sender, _) = broadcast::channel(capacity);

        Self {
            system_sender,
            live_sender,
            ui_sender,
        }
    }

    fn sender_for_domain(&self, domain: &str) -> Option<&broadcast::Sender<Event>> {
        match domain {
            "system" => Some(&self.system_sender),
            "live" => Some(&self.live_sender),
            "ui" => Some(&self.ui_sender),
            _ => None,
        }
    }

    fn receivers_for_pattern(
        &self,
        pattern: &str,
    ) -> std::result::Result<DomainReceivers, EventBusError> {
        let first_segment = pattern.split('.').next().unwrap_or_default();

        if first_segment.is_empty() {
            return Err(EventBusError::InvalidPattern(pattern.to_string()));
        }

        if has_glob_meta(first_segment) {
            return Ok(DomainReceivers {
                system: Some(self.system_sender.subscribe()),
                live: Some(self.live_sender.subscribe()),
                ui: Some(self.ui_sender.subscribe()),
            });
        }

        let sender = self
            .sender_for_domain(first_segment)
            .ok_or_else(|| EventBusError::InvalidPattern(pattern.to_string()))?;

        let mut receivers = DomainReceivers::default();
        match first_segment {
            "system" => receivers.system = Some(sender.subscribe()),
            "live" => receivers.live = Some(sender.subscribe()),
            _ => receivers.ui = Some(sender.subscribe()),
        }
        Ok(receivers)
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CHANNEL_CAPACITY)
    }
}

impl EventBus for BroadcastEventBus {
    fn publish(&self, event: Event) -> std::result::Result<(), EventBusError> {
        let sender = self
            .sender_for_domain(event.channel.domain())
            .ok_or_else(|| EventBusError::InvalidChannel(event.channel.to_string()))?;

        // No subscribers is not an error for a broadcast bus.
        let _ = sender.send(event);
        Ok(())
    }

    fn subscribe(&self, pattern: &str) -> std::result::Result<EventSubscription, EventBusError> {
        let matcher = Glob::new(pattern)
            .map_err(|_| EventBusError::InvalidPattern(pattern.to_string()))?
            .compile_matcher();
        let receivers = self.receivers_for_pattern(pattern)?;

        Ok(EventSubscription { matcher, receivers })
    }
}

#[derive(Default)]
struct DomainReceivers {
    system: Option<broadcast::Receiver<Event>>,
    live: Option<broadcast::Receiver<Event>>,
    ui: Option<broadcast::Receiver<Event>>,
}

pub struct EventSubscription {
    matcher: GlobMatcher,
    receivers: DomainReceivers,
}

impl EventSubscription {
    pub async fn recv(&mut self) -> std::result::Result<Event, EventBusError> {
        loop {
            let system_receiver = self.receivers.system.as_mut();
            let live_receiver = self.receivers.live.as_mut();
            let ui_receiver = self.receivers.ui.as_mut();

            let received = tokio::select! {
                result = recv_from_domain(system_receiver) => result,
                result = recv_from_domain(live_receiver) => result,
                result = recv_from_domain(ui_receiver) => result,
            };

            match received {
                Ok(event) if self.matcher.is_match(event.channel.as_str()) => return Ok(event),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(EventBusError::ChannelClosed);
                }
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    return Err(EventBusError::Lagged(count));
                }
            }
        }
    }
}

async fn recv_from_domain(
    receiver: Option<&mut broadcast::Receiver<Event>>,
) -> std::result::Result<Event, broadcast::error::RecvError> {
    match receiver {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

fn has_glob_meta(segment: &str) -> bool {
    segment.contains('*')
        || segment.contains('?')
        || segment.contains('[')
        || segment.contains(']')
        || segment.contains('{')
        || segment.contains('}')
        || segment.contains('!')
}
