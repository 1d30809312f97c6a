use parley_core::{EventBusError, ParleyError};
use parley_history::HistoryError;
use parley_transport::TransportError;
use thiserror::Error;

/// How a failure is treated by the session.
///
/// Only identity and transport failures reach the user. Durable read and
/// write failures are absorbed so the conversation stays live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    IdentityFailure,
    DurableReadFailure,
    DurableWriteFailure,
    TransportFailure,
}

impl FailureKind {
    pub fn is_user_visible(self) -> bool {
        matches!(
            self,
            FailureKind::IdentityFailure | FailureKind::TransportFailure
        )
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FailureKind::IdentityFailure => "identity",
            FailureKind::DurableReadFailure => "durable-read",
            FailureKind::DurableWriteFailure => "durable-write",
            FailureKind::TransportFailure => "transport",
        };
        f.write_str(name)
    }
}

/// Why a send was refused before anything left the client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("message is empty")]
    Empty,

    #[error("no username has been chosen")]
    NoSender,

    #[error("transport is not connected")]
    NotConnected,
}

impl SendError {
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            SendError::NotConnected => Some(FailureKind::TransportFailure),
            SendError::Empty | SendError::NoSender => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("sign-in rejected: {0}")]
    Rejected(String),

    #[error("malformed custom token: {0}")]
    MalformedToken(String),

    #[error("event bus error: {0}")]
    EventBus(#[from] EventBusError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error("username must not be empty")]
    EmptyUsername,

    #[error("username already chosen as {current}, cannot switch to {requested}")]
    UsernameLocked { current: String, requested: String },
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("history error: {0}")]
    History(#[from] HistoryError),

    #[error("event bus error: {0}")]
    EventBus(#[from] EventBusError),

    #[error("lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),
}

impl SessionError {
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            SessionError::Transport(_) => Some(FailureKind::TransportFailure),
            SessionError::History(_) => Some(FailureKind::DurableReadFailure),
            SessionError::EventBus(_) | SessionError::Lifecycle(_) => None,
        }
    }
}

impl From<SessionError> for ParleyError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Transport(e) => ParleyError::Transport(e.to_string()),
            SessionError::History(e) => ParleyError::History(e.to_string()),
            SessionError::EventBus(e) => ParleyError::EventBus(e),
            SessionError::Lifecycle(e) => ParleyError::Internal(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_identity_and_transport_failures_are_user_visible() {
        assert!(FailureKind::IdentityFailure.is_user_visible());
        assert!(FailureKind::TransportFailure.is_user_visible());
        assert!(!FailureKind::DurableReadFailure.is_user_visible());
        assert!(!FailureKind::DurableWriteFailure.is_user_visible());
    }

    #[test]
    fn not_connected_send_is_a_transport_failure() {
        assert_eq!(
            SendError::NotConnected.failure_kind(),
            Some(FailureKind::TransportFailure)
        );
        assert_eq!(SendError::Empty.failure_kind(), None);
    }

    #[test]
    fn session_errors_fold_into_the_umbrella_error() {
        let err: ParleyError = SessionError::from(TransportError::NotConnected).into();
        assert!(matches!(err, ParleyError::Transport(_)));

        let err: ParleyError = SessionError::from(EventBusError::ChannelClosed).into();
        assert!(matches!(err, ParleyError::EventBus(EventBusError::ChannelClosed)));
    }
}
