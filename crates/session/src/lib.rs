pub mod error;
pub mod identity;
pub mod lifecycle;
pub mod outbound;
pub mod reconcile;
pub mod session;
pub mod typing;

#[cfg(test)]
mod testing;

pub use error::{FailureKind, IdentityError, LifecycleError, SendError, SessionError};
pub use identity::{
    AnonymousSignIn, Identity, IdentityProvider, TokenSignIn, announce_identity, sign_in_configured,
};
pub use lifecycle::{ConnectRequest, ConnectionLifecycle, ConnectionState, LifecyclePhase};
pub use outbound::{Dispatched, OutboundCoordinator};
pub use reconcile::{DisplayKey, EntryStatus, LiveAdmission, ReconciliationEngine, ViewEntry};
pub use session::{ChatSession, ConversationView, SessionSettings};
pub use typing::{TypingDebouncer, TypingSignal};
