use parley_transport::TransportError;
use tracing::{debug, error, info, warn};

use crate::error::LifecycleError;

/// Connection state as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LifecyclePhase {
    #[default]
    Unauthenticated,
    AwaitingUsername,
    Connecting,
    Connected,
    Disconnected,
}

/// Instruction to open the live connection. Issued at most once per session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub username: String,
}

/// Gates chat activity on identity readiness and the transport connection.
#[derive(Debug, Default)]
pub struct ConnectionLifecycle {
    phase: LifecyclePhase,
    identity_id: Option<String>,
    identity_failure: Option<String>,
    username: Option<String>,
    connect_issued: bool,
}

impl ConnectionLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> LifecyclePhase {
        self.phase
    }

    pub fn identity_id(&self) -> Option<&str> {
        self.identity_id.as_deref()
    }

    pub fn identity_failure(&self) -> Option<&str> {
        self.identity_failure.as_deref()
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// Durable history only needs a signed-in identity.
    pub fn history_enabled(&self) -> bool {
        self.identity_id.is_some()
    }

    pub fn is_connected(&self) -> bool {
        self.phase == LifecyclePhase::Connected
    }

    pub fn connection_state(&self) -> ConnectionState {
        match self.phase {
            LifecyclePhase::Connecting => ConnectionState::Connecting,
            LifecyclePhase::Connected => ConnectionState::Connected,
            LifecyclePhase::Unauthenticated
            | LifecyclePhase::AwaitingUsername
            | LifecyclePhase::Disconnected => ConnectionState::Disconnected,
        }
    }

    pub fn on_identity_ready(&mut self, identity_id: &str) -> Option<ConnectRequest> {
        if let Some(existing) = &self.identity_id {
            debug!(%existing, ignored = identity_id, "identity already ready, ignoring");
            return None;
        }
        info!(identity_id, "identity ready");
        self.identity_id = Some(identity_id.to_string());
        self.identity_failure = None;

        if self.username.is_some() {
            self.try_connect()
        } else {
            self.phase = LifecyclePhase::AwaitingUsername;
            None
        }
    }

    /// Sign-in was rejected; the session stays unauthenticated.
    pub fn on_identity_failed(&mut self, reason: &str) {
        error!(reason, "identity sign-in failed");
        if self.identity_id.is_none() {
            self.identity_failure = Some(reason.to_string());
        }
    }

    /// Lock in the username. Repeating the same choice is a no-op.
    pub fn choose_username(
        &mut self,
        username: &str,
    ) -> Result<Option<ConnectRequest>, LifecycleError> {
        let username = username.trim();
        if username.is_empty() {
            return Err(LifecycleError::EmptyUsername);
        }

        match &self.username {
            Some(current) if current == username => {
                debug!(username, "username already chosen");
                return Ok(None);
            }
            Some(current) => {
                return Err(LifecycleError::UsernameLocked {
                    current: current.clone(),
                    requested: username.to_string(),
                });
            }
            None => {}
        }

        debug!(username, "username chosen");
        self.username = Some(username.to_string());
        if self.identity_id.is_some() {
            Ok(self.try_connect())
        } else {
            Ok(None)
        }
    }

    pub fn on_connection_change(&mut self, connected: bool) {
        let next = match (self.phase, connected) {
            (
                LifecyclePhase::Connecting | LifecyclePhase::Disconnected,
                true,
            ) if self.connect_issued => LifecyclePhase::Connected,
            (LifecyclePhase::Connecting | LifecyclePhase::Connected, false) => {
                LifecyclePhase::Disconnected
            }
            (phase, _) => phase,
        };
        if next != self.phase {
            debug!(from = ?self.phase, to = ?next, "connection phase changed");
            self.phase = next;
        }
    }

    /// The connect command itself failed. The attempt is spent.
    pub fn on_connect_failed(&mut self, err: &TransportError) {
        warn!(error = %err, retryable = err.is_retryable(), "connect failed");
        if self.phase == LifecyclePhase::Connecting {
            self.phase = LifecyclePhase::Disconnected;
        }
    }

    fn try_connect(&mut self) -> Option<ConnectRequest> {
        if self.connect_issued {
            return None;
        }
        let username = self.username.clone()?;
        self.connect_issued = true;
        self.phase = LifecyclePhase::Connecting;
        debug!(%username, "issuing connect");
        Some(ConnectRequest { username })
    }
}
