//! Merging durable history with live session activity.
//!
//! The rendered conversation is the latest durable snapshot followed by the
//! live messages of this session in arrival order. No interleaving by
//! timestamp is attempted across the two sources.
//!
//! Messages sent from this client carry a correlation id. The transport echo
//! of a local send confirms the existing entry in place, and with
//! `correlate_sent` enabled a durable copy of an already rendered live
//! message is folded into the live entry instead of being shown twice.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use parley_core::event::{ChatMessage, PresenceEntry};
use parley_history::{HistoryError, SNAPSHOT_LIMIT};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::typing::DEFAULT_QUIET_PERIOD;

/// Stable render identity of a view entry. Never changes once assigned.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DisplayKey {
    /// Store-assigned id.
    Stored(String),
    /// Client-generated id of a message sent from this session.
    Correlated(Uuid),
    /// Index within the durable snapshot, for entries without an id.
    DurablePosition(usize),
    /// Index within the live list, for entries without an id.
    LivePosition(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    /// From the durable snapshot.
    Durable,
    /// Sent locally, transport echo not yet seen.
    Sending,
    /// Delivered through the live transport.
    Live,
    /// Live entry whose durable copy has arrived.
    Persisted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewEntry {
    pub key: DisplayKey,
    pub message: ChatMessage,
    pub status: EntryStatus,
}

/// What happened to a live message handed to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveAdmission {
    Appended,
    /// Matched a pending local send by correlation id.
    Confirmed,
    /// Repeat delivery of an entry already confirmed.
    Duplicate,
}

#[derive(Debug, Clone)]
struct LiveEntry {
    key: DisplayKey,
    message: ChatMessage,
    echoed: bool,
}

/// A remote typer as last reported by the transport.
#[derive(Debug, Clone, Copy)]
struct TypingEntry {
    expires_at: Instant,
    /// Quiet period ran out. Hidden until the user signals again or leaves
    /// the set.
    lapsed: bool,
}

#[derive(Debug)]
pub struct ReconciliationEngine {
    local_username: Option<String>,
    history_limit: usize,
    correlate_sent: bool,
    quiet_period: Duration,
    durable: Vec<ChatMessage>,
    live: Vec<LiveEntry>,
    presence: Vec<PresenceEntry>,
    typing: BTreeMap<String, TypingEntry>,
    history_degraded: bool,
}

impl Default for ReconciliationEngine {
    fn default() -> Self {
        Self::new(SNAPSHOT_LIMIT, true, DEFAULT_QUIET_PERIOD)
    }
}

impl ReconciliationEngine {
    pub fn new(history_limit: usize, correlate_sent: bool, quiet_period: Duration) -> Self {
        Self {
            local_username: None,
            history_limit: history_limit.clamp(1, SNAPSHOT_LIMIT),
            correlate_sent,
            quiet_period,
            durable: Vec::new(),
            live: Vec::new(),
            presence: Vec::new(),
            typing: BTreeMap::new(),
            history_degraded: false,
        }
    }

    /// The local user is never shown in the remote typing set.
    pub fn set_local_username(&mut self, username: &str) {
        self.typing.remove(username);
        self.local_username = Some(username.to_string());
    }

    /// Replace durable history wholesale with a snapshot ordered oldest first.
    pub fn on_durable_snapshot(&mut self, mut messages: Vec<ChatMessage>) {
        if messages.len() > self.history_limit {
            let excess = messages.len() - self.history_limit;
            messages.drain(..excess);
        }
        debug!(count = messages.len(), "durable snapshot applied");
        self.durable = messages;
        self.history_degraded = false;
    }

    /// Keep the last good snapshot and carry on with live data.
    pub fn on_durable_error(&mut self, err: &HistoryError) {
        warn!(
            error = %err,
            retained = self.durable.len(),
            "durable history unavailable, continuing with live messages"
        );
        self.history_degraded = true;
    }

    pub fn on_live_message(&mut self, message: ChatMessage) -> LiveAdmission {
        if let Some(correlation_id) = message.correlation_id
            && let Some(entry) = self
                .live
                .iter_mut()
                .find(|entry| entry.message.correlation_id == Some(correlation_id))
        {
            if entry.echoed {
                debug!(%correlation_id, "duplicate live delivery ignored");
                return LiveAdmission::Duplicate;
            }
            entry.echoed = true;
            if entry.message.id.is_none() {
                entry.message.id = message.id;
            }
            debug!(%correlation_id, "local send confirmed by transport");
            return LiveAdmission::Confirmed;
        }

        self.admit(message, true);
        LiveAdmission::Appended
    }

    /// Show a message sent from this client before the transport echoes it.
    pub fn on_local_send(&mut self, message: ChatMessage) {
        self.admit(message, false);
    }

    pub fn on_presence_snapshot(&mut self, users: Vec<PresenceEntry>) {
        self.presence = users;
    }

    /// Replace the remote typing set.
    ///
    /// Only `typist`, the user whose signal produced the update, and users new
    /// to the set get a fresh quiet period. Everyone else keeps their
    /// running one, so one user's activity never extends another's.
    pub fn on_typing_update(&mut self, usernames: Vec<String>, typist: Option<&str>, now: Instant) {
        let fresh = TypingEntry {
            expires_at: now + self.quiet_period,
            lapsed: false,
        };
        let previous = std::mem::take(&mut self.typing);
        self.typing = usernames
            .into_iter()
            .filter(|username| self.local_username.as_deref() != Some(username.as_str()))
            .map(|username| {
                let entry = match previous.get(&username) {
                    Some(_) if typist == Some(username.as_str()) => fresh,
                    Some(entry) => *entry,
                    None => fresh,
                };
                (username, entry)
            })
            .collect();
    }

    /// Hide typers whose quiet period has elapsed. Returns whether any were.
    pub fn expire_typing(&mut self, now: Instant) -> bool {
        let mut expired = 0;
        for entry in self.typing.values_mut() {
            if !entry.lapsed && entry.expires_at <= now {
                entry.lapsed = true;
                expired += 1;
            }
        }
        if expired > 0 {
            debug!(expired, "typing entries expired");
        }
        expired > 0
    }

    pub fn next_typing_expiry(&self) -> Option<Instant> {
        self.typing
            .values()
            .filter(|entry| !entry.lapsed)
            .map(|entry| entry.expires_at)
            .min()
    }

    pub fn presence(&self) -> &[PresenceEntry] {
        &self.presence
    }

    pub fn typing(&self) -> Vec<String> {
        self.typing
            .iter()
            .filter(|(_, entry)| !entry.lapsed)
            .map(|(username, _)| username.clone())
            .collect()
    }

    pub fn history_degraded(&self) -> bool {
        self.history_degraded
    }

    pub fn durable_len(&self) -> usize {
        self.durable.len()
    }

    pub fn live_len(&self) -> usize {
        self.live.len()
    }

    /// The render-ready conversation: durable history, then live activity.
    pub fn view(&self) -> Vec<ViewEntry> {
        let live_correlations: HashSet<Uuid> = if self.correlate_sent {
            self.live
                .iter()
                .filter_map(|entry| entry.message.correlation_id)
                .collect()
        } else {
            HashSet::new()
        };

        let mut persisted: HashSet<Uuid> = HashSet::new();
        let mut entries = Vec::with_capacity(self.durable.len() + self.live.len());

        for (position, message) in self.durable.iter().enumerate() {
            if let Some(correlation_id) = message.correlation_id
                && live_correlations.contains(&correlation_id)
            {
                persisted.insert(correlation_id);
                continue;
            }
            let key = match &message.id {
                Some(id) => DisplayKey::Stored(id.clone()),
                None => DisplayKey::DurablePosition(position),
            };
            entries.push(ViewEntry {
                key,
                message: message.clone(),
                status: EntryStatus::Durable,
            });
        }

        for entry in &self.live {
            let status = match entry.message.correlation_id {
                Some(correlation_id) if persisted.contains(&correlation_id) => {
                    EntryStatus::Persisted
                }
                _ if entry.echoed => EntryStatus::Live,
                _ => EntryStatus::Sending,
            };
            entries.push(ViewEntry {
                key: entry.key.clone(),
                message: entry.message.clone(),
                status,
            });
        }

        entries
    }

    fn admit(&mut self, message: ChatMessage, echoed: bool) {
        let key = match (&message.correlation_id, &message.id) {
            (Some(correlation_id), _) => DisplayKey::Correlated(*correlation_id),
            (None, Some(id)) => DisplayKey::Stored(id.clone()),
            (None, None) => DisplayKey::LivePosition(self.live.len()),
        };
        self.live.push(LiveEntry {
            key,
            message,
            echoed,
        });
    }
}
