//! Sign-in bootstrap. Nothing durable or live may happen before a provider
//! reports a ready identity.

use std::future::Future;

use parley_core::config::{IdentityConfig, SignInMethod};
use parley_core::event::{EventBus, EventPayload, EventSource};
use tracing::{error, info};
use uuid::Uuid;

use crate::error::{FailureKind, IdentityError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub identity_id: String,
    pub method: SignInMethod,
}

pub trait IdentityProvider: Send + Sync {
    fn sign_in(&self) -> impl Future<Output = Result<Identity, IdentityError>> + Send;
}

/// Fresh random identity per sign-in.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnonymousSignIn;

impl IdentityProvider for AnonymousSignIn {
    async fn sign_in(&self) -> Result<Identity, IdentityError> {
        Ok(Identity {
            identity_id: format!("anon-{}", Uuid::new_v4()),
            method: SignInMethod::Anonymous,
        })
    }
}

/// Custom token of the form `<uid>:<secret>`; the uid becomes the identity.
#[derive(Debug, Clone)]
pub struct TokenSignIn {
    token: String,
}

impl TokenSignIn {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    fn parse(&self) -> Result<&str, IdentityError> {
        let (uid, secret) = self
            .token
            .trim()
            .split_once(':')
            .ok_or_else(|| IdentityError::MalformedToken("expected <uid>:<secret>".to_string()))?;

        if uid.is_empty()
            || !uid
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(IdentityError::MalformedToken(format!("invalid uid {uid:?}")));
        }
        if secret.is_empty() {
            return Err(IdentityError::Rejected("empty secret".to_string()));
        }
        Ok(uid)
    }
}

impl IdentityProvider for TokenSignIn {
    async fn sign_in(&self) -> Result<Identity, IdentityError> {
        let uid = self.parse()?;
        Ok(Identity {
            identity_id: uid.to_string(),
            method: SignInMethod::Token,
        })
    }
}

/// Sign in once and publish the outcome: exactly one of
/// `system.identity.ready` or `system.identity.failed`.
pub async fn announce_identity<P: IdentityProvider>(
    provider: &P,
    bus: &dyn EventBus,
) -> Result<Identity, IdentityError> {
    let source = EventSource::System("identity".into());
    match provider.sign_in().await {
        Ok(identity) => {
            info!(identity_id = %identity.identity_id, method = ?identity.method, "signed in");
            bus.emit(
                "system.identity.ready",
                source,
                EventPayload::IdentityReady {
                    identity_id: identity.identity_id.clone(),
                },
            )?;
            Ok(identity)
        }
        Err(e) => {
            error!(error = %e, kind = %FailureKind::IdentityFailure, "sign-in failed");
            bus.emit(
                "system.identity.failed",
                source,
                EventPayload::IdentityFailed {
                    reason: e.to_string(),
                },
            )?;
            Err(e)
        }
    }
}

/// Sign in with whichever method the configuration selects.
pub async fn sign_in_configured(
    config: &IdentityConfig,
    bus: &dyn EventBus,
) -> Result<Identity, IdentityError> {
    match config.method {
        SignInMethod::Anonymous => announce_identity(&AnonymousSignIn, bus).await,
        SignInMethod::Token => {
            let token = config.token.clone().unwrap_or_default();
            announce_identity(&TokenSignIn::new(token), bus).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use parley_core::event::BroadcastEventBus;

    #[tokio::test]
    async fn anonymous_sign_in_gives_distinct_identities() {
        let first = AnonymousSignIn.sign_in().await.unwrap();
        let second = AnonymousSignIn.sign_in().await.unwrap();
        assert_ne!(first.identity_id, second.identity_id);
        assert_eq!(first.method, SignInMethod::Anonymous);
    }

    #[tokio::test]
    async fn token_uid_becomes_identity() {
        let identity = TokenSignIn::new("user_42:s3cret").sign_in().await.unwrap();
        assert_eq!(identity.identity_id, "user_42");
        assert_eq!(identity.method, SignInMethod::Token);
    }

    #[tokio::test]
    async fn malformed_tokens_are_rejected() {
        assert_matches!(
            TokenSignIn::new("no-separator").sign_in().await,
            Err(IdentityError::MalformedToken(_))
        );
        assert_matches!(
            TokenSignIn::new("bad uid:secret").sign_in().await,
            Err(IdentityError::MalformedToken(_))
        );
        assert_matches!(
            TokenSignIn::new("uid:").sign_in().await,
            Err(IdentityError::Rejected(_))
        );
    }

    #[tokio::test]
    async fn announce_publishes_ready() {
        let bus = BroadcastEventBus::default();
        let mut sub = bus.subscribe("system.identity.*").unwrap();

        let identity = announce_identity(&TokenSignIn::new("alice:pw"), &bus)
            .await
            .unwrap();

        let event = sub.recv().await.unwrap();
        assert_eq!(event.channel.as_str(), "system.identity.ready");
        assert_matches!(
            event.payload,
            EventPayload::IdentityReady { identity_id } if identity_id == identity.identity_id
        );
    }

    #[tokio::test]
    async fn announce_publishes_failure() {
        let bus = BroadcastEventBus::default();
        let mut sub = bus.subscribe("system.identity.*").unwrap();

        let result = announce_identity(&TokenSignIn::new("garbage"), &bus).await;
        assert!(result.is_err());

        let event = sub.recv().await.unwrap();
        assert_eq!(event.channel.as_str(), "system.identity.failed");
        assert_matches!(event.payload, EventPayload::IdentityFailed { .. });
    }

    #[tokio::test]
    async fn configured_token_without_value_fails() {
        let bus = BroadcastEventBus::default();
        let config = IdentityConfig {
            method: SignInMethod::Token,
            token: None,
        };
        assert!(sign_in_configured(&config, &bus).await.is_err());
    }
}
