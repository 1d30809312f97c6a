//! In-process stand-in for the chat server.
//!
//! A [`LoopbackHub`] plays the server: it owns the roster and the typing set
//! and fans events out to the event bus of every attached client. Each
//! [`LoopbackTransport`] is one client's connection to it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info};

use parley_core::event::{
    Channel, ChatMessage, Event, EventBus, EventPayload, EventSource, PresenceEntry,
};

use crate::error::TransportError;
use crate::transport::{LiveTransport, OutboundMessage};

struct Client {
    bus: Arc<dyn EventBus>,
    username: Option<String>,
    online: bool,
}

#[derive(Default)]
struct HubState {
    clients: BTreeMap<u64, Client>,
    typing: BTreeSet<String>,
    next_client_id: u64,
}

impl HubState {
    fn roster(&self) -> Vec<PresenceEntry> {
        self.clients
            .iter()
            .filter_map(|(id, client)| {
                client
                    .username
                    .as_ref()
                    .map(|username| PresenceEntry::new(format!("user-{id}"), username.clone()))
            })
            .collect()
    }

    fn client(&self, id: u64) -> Result<&Client, TransportError> {
        self.clients
            .get(&id)
            .ok_or_else(|| TransportError::Unavailable("client detached from hub".to_string()))
    }

    fn connected_username(&self, id: u64) -> Result<String, TransportError> {
        let client = self.client(id)?;
        match (&client.username, client.online) {
            (Some(username), true) => Ok(username.clone()),
            _ => Err(TransportError::NotConnected),
        }
    }

    fn publish_to(&self, id: u64, channel: &str, payload: EventPayload) -> Result<(), TransportError> {
        self.client(id)?.bus.emit(channel, EventSource::Live, payload)?;
        Ok(())
    }

    /// Deliver to every joined client whose link is up.
    fn broadcast(&self, event: &Event) -> Result<(), TransportError> {
        for client in self
            .clients
            .values()
            .filter(|c| c.username.is_some() && c.online)
        {
            client.bus.publish(event.clone())?;
        }
        Ok(())
    }

    fn broadcast_payload(&self, channel: &str, payload: EventPayload) -> Result<(), TransportError> {
        let event = Event::new(Channel::new(channel)?, EventSource::Live, payload);
        self.broadcast(&event)
    }

    fn broadcast_roster(&self) -> Result<(), TransportError> {
        self.broadcast_payload(
            "live.presence.received",
            EventPayload::PresenceReceived {
                users: self.roster(),
            },
        )
    }

    fn typing_payload(&self, typist: Option<&str>) -> EventPayload {
        EventPayload::TypingReceived {
            usernames: self.typing.iter().cloned().collect(),
            typist: typist.map(str::to_string),
        }
    }

    fn broadcast_typing(&self, typist: Option<&str>) -> Result<(), TransportError> {
        self.broadcast_payload("live.typing.received", self.typing_payload(typist))
    }

    fn broadcast_notice(&self, text: String) -> Result<(), TransportError> {
        self.broadcast_payload(
            "live.message.received",
            EventPayload::MessageReceived {
                message: ChatMessage::system(text),
            },
        )
    }

    fn leave(&mut self, id: u64) -> Result<(), TransportError> {
        let Some(client) = self.clients.get_mut(&id) else {
            return Ok(());
        };
        let Some(username) = client.username.take() else {
            return Ok(());
        };
        client.online = false;

        let was_typing = self.typing.remove(&username);
        self.broadcast_roster()?;
        self.broadcast_notice(format!("{username} left"))?;
        if was_typing {
            self.broadcast_typing(None)?;
        }
        info!(client = id, %username, "client left loopback hub");
        Ok(())
    }
}

/// Shared server state for all loopback clients in this process.
#[derive(Clone, Default)]
pub struct LoopbackHub {
    state: Arc<Mutex<HubState>>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new client whose inbound events are published on `bus`.
    pub fn transport(&self, bus: Arc<dyn EventBus>) -> LoopbackTransport {
        let id = match self.state.lock() {
            Ok(mut state) => {
                let id = state.next_client_id;
                state.next_client_id += 1;
                state.clients.insert(
                    id,
                    Client {
                        bus,
                        username: None,
                        online: false,
                    },
                );
                id
            }
            Err(_) => u64::MAX,
        };
        LoopbackTransport {
            hub: self.clone(),
            id,
        }
    }

    pub fn roster(&self) -> Vec<PresenceEntry> {
        self.state
            .lock()
            .map(|state| state.roster())
            .unwrap_or_default()
    }

    pub fn typing(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|state| state.typing.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HubState>, TransportError> {
        self.state
            .lock()
            .map_err(|_| TransportError::Unavailable("poisoned lock".to_string()))
    }
}

/// One client's connection to a [`LoopbackHub`].
pub struct LoopbackTransport {
    hub: LoopbackHub,
    id: u64,
}

impl LoopbackTransport {
    /// Simulate the network dropping underneath a connected client. A
    /// dropped client cannot be typing, so its typing entry goes too.
    pub fn drop_connection(&self) -> Result<(), TransportError> {
        let mut state = self.hub.lock()?;
        let client = state
            .clients
            .get_mut(&self.id)
            .ok_or(TransportError::NotConnected)?;
        client.online = false;
        let username = client.username.clone();
        debug!(client = self.id, "loopback connection dropped");

        state.publish_to(
            self.id,
            "live.connection.changed",
            EventPayload::ConnectionChanged { connected: false },
        )?;
        if let Some(username) = username
            && state.typing.remove(&username)
        {
            state.broadcast_typing(None)?;
        }
        Ok(())
    }

    /// Simulate the transport's reconnection policy bringing the link back.
    pub fn restore_connection(&self) -> Result<(), TransportError> {
        let mut state = self.hub.lock()?;
        let client = state
            .clients
            .get_mut(&self.id)
            .ok_or(TransportError::NotConnected)?;
        if client.username.is_none() {
            return Err(TransportError::NotConnected);
        }
        client.online = true;
        debug!(client = self.id, "loopback connection restored");
        state.publish_to(
            self.id,
            "live.connection.changed",
            EventPayload::ConnectionChanged { connected: true },
        )?;

        // Anything broadcast while offline was missed; resend current sets.
        let roster = state.roster();
        state.publish_to(
            self.id,
            "live.presence.received",
            EventPayload::PresenceReceived { users: roster },
        )?;
        let typing = state.typing_payload(None);
        state.publish_to(self.id, "live.typing.received", typing)
    }
}

impl LiveTransport for LoopbackTransport {
    fn connect(&mut self, username: &str) -> Result<(), TransportError> {
        let username = username.trim();
        if username.is_empty() {
            return Err(TransportError::UsernameRejected(
                "username must not be empty".to_string(),
            ));
        }

        let mut state = self.hub.lock()?;
        if let Some(existing) = &state.client(self.id)?.username {
            return Err(TransportError::AlreadyConnected(existing.clone()));
        }
        if let Some(client) = state.clients.get_mut(&self.id) {
            client.username = Some(username.to_string());
            client.online = true;
        }
        info!(client = self.id, %username, "client joined loopback hub");

        state.publish_to(
            self.id,
            "live.connection.changed",
            EventPayload::ConnectionChanged { connected: true },
        )?;
        state.broadcast_roster()?;
        state.broadcast_notice(format!("{username} joined"))
    }

    fn send(&mut self, message: &OutboundMessage) -> Result<(), TransportError> {
        let state = self.hub.lock()?;
        let username = state.connected_username(self.id)?;

        let mut echoed = message.to_chat_message();
        echoed.sender = username;
        let event = Event::with_correlation(
            Channel::new("live.message.received")?,
            EventSource::Live,
            EventPayload::MessageReceived { message: echoed },
            message.correlation_id,
        );
        state.broadcast(&event)
    }

    fn set_typing(&mut self, typing: bool) -> Result<(), TransportError> {
        let mut state = self.hub.lock()?;
        let username = state.connected_username(self.id)?;

        let changed = if typing {
            state.typing.insert(username.clone())
        } else {
            state.typing.remove(&username)
        };
        if changed {
            state.broadcast_typing(Some(username.as_str()))?;
        }
        Ok(())
    }

    fn keep_typing(&mut self) -> Result<(), TransportError> {
        let mut state = self.hub.lock()?;
        let username = state.connected_username(self.id)?;

        if state.typing.insert(username.clone()) {
            debug!(client = self.id, %username, "typing re-announced");
        }
        state.broadcast_typing(Some(username.as_str()))
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        let mut state = self.hub.lock()?;
        let was_online = state.client(self.id)?.online;
        state.leave(self.id)?;
        if was_online {
            state.publish_to(
                self.id,
                "live.connection.changed",
                EventPayload::ConnectionChanged { connected: false },
            )?;
        }
        Ok(())
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        if let Ok(mut state) = self.hub.state.lock() {
            let _ = state.leave(self.id);
            state.clients.remove(&self.id);
        }
    }
}
