use std::sync::Arc;

use parley_history::{HistoryStore, Scope};
use parley_transport::{LiveTransport, OutboundMessage, TransportError};
use tokio::task::JoinSet;
use tracing::{Instrument, debug, warn};

use crate::error::{FailureKind, SendError};
use crate::typing::{TypingDebouncer, TypingSignal};

/// Outcome of a send that passed validation.
#[derive(Debug)]
pub struct Dispatched {
    pub message: OutboundMessage,
    pub live_result: Result<(), TransportError>,
    /// A typing stop was delivered as part of this send.
    pub typing_cleared: bool,
}

impl Dispatched {
    pub fn live_delivered(&self) -> bool {
        self.live_result.is_ok()
    }
}

/// Fans a send out to the live transport and the durable store.
///
/// Live delivery happens inline and fails fast. The durable append runs in
/// the background; its failure is logged and otherwise ignored.
pub struct OutboundCoordinator<H: HistoryStore> {
    store: Arc<H>,
    scope: Scope,
    writes: JoinSet<()>,
}

impl<H: HistoryStore> OutboundCoordinator<H> {
    pub fn new(store: Arc<H>, scope: Scope) -> Self {
        Self {
            store,
            scope,
            writes: JoinSet::new(),
        }
    }

    pub fn pending_writes(&self) -> usize {
        self.writes.len()
    }

    /// Must be called from within a Tokio runtime.
    pub fn send<T: LiveTransport>(
        &mut self,
        text: &str,
        sender: Option<&str>,
        connected: bool,
        transport: &mut T,
        debouncer: &mut TypingDebouncer,
    ) -> Result<Dispatched, SendError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SendError::Empty);
        }
        let sender = sender
            .map(str::trim)
            .filter(|sender| !sender.is_empty())
            .ok_or(SendError::NoSender)?;
        if !connected {
            return Err(SendError::NotConnected);
        }

        while self.writes.try_join_next().is_some() {}

        let message = OutboundMessage::new(sender, text);
        let correlation_id = message.correlation_id;

        let live_result = transport.send(&message);
        if let Err(e) = &live_result {
            warn!(
                error = %e,
                %correlation_id,
                kind = %FailureKind::TransportFailure,
                "live send failed"
            );
        }

        let store = Arc::clone(&self.store);
        let scope = self.scope.clone();
        let record = message.to_chat_message();
        self.writes.spawn(async move {
            match store.append(&scope, record).await {
                Ok(id) => debug!(%correlation_id, id = %id, %scope, "message persisted"),
                Err(e) => warn!(
                    error = %e,
                    %correlation_id,
                    kind = %FailureKind::DurableWriteFailure,
                    "durable write failed, message stays live-only"
                ),
            }
        }
        .in_current_span());

        let typing_cleared = debouncer.on_send() == Some(TypingSignal::Stop)
            && match transport.set_typing(false) {
                Ok(()) => true,
                Err(e) => {
                    warn!(error = %e, "failed to clear typing indicator on send");
                    false
                }
            };

        Ok(Dispatched {
            message,
            live_result,
            typing_cleared,
        })
    }

    /// Wait for every outstanding durable write to settle.
    pub async fn flush(&mut self) {
        while let Some(result) = self.writes.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "durable write task aborted");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use mockall::predicate::eq;
    use parley_history::InMemoryHistoryStore;
    use tokio::time::Instant;
    use tracing_test::traced_test;

    use crate::testing::MockTransport;

    fn coordinator() -> (OutboundCoordinator<InMemoryHistoryStore>, Arc<InMemoryHistoryStore>) {
        let store = Arc::new(InMemoryHistoryStore::new());
        (
            OutboundCoordinator::new(Arc::clone(&store), Scope::global()),
            store,
        )
    }

    #[tokio::test]
    async fn send_reaches_transport_store_and_debouncer() {
        let (mut outbound, store) = coordinator();
        let mut debouncer = TypingDebouncer::default();
        debouncer.on_input("hello", Instant::now());

        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .withf(|message| message.text == "hello" && message.sender == "alice")
            .times(1)
            .returning(|_| Ok(()));
        transport
            .expect_set_typing()
            .with(eq(false))
            .times(1)
            .returning(|_| Ok(()));

        let dispatched = outbound
            .send(" hello ", Some("alice"), true, &mut transport, &mut debouncer)
            .unwrap();
        assert!(dispatched.live_delivered());
        assert!(dispatched.typing_cleared);
        assert!(!debouncer.is_typing());

        outbound.flush().await;
        let persisted = store.messages(&Scope::global());
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].text, "hello");
        assert_eq!(
            persisted[0].correlation_id,
            Some(dispatched.message.correlation_id)
        );
    }

    #[tokio::test]
    async fn whitespace_only_send_has_no_effects() {
        let (mut outbound, store) = coordinator();
        let mut debouncer = TypingDebouncer::default();
        debouncer.on_input("   ", Instant::now());
        let mut transport = MockTransport::new();

        assert_matches!(
            outbound.send("   ", Some("alice"), true, &mut transport, &mut debouncer),
            Err(SendError::Empty)
        );
        assert!(debouncer.is_typing());
        assert_eq!(outbound.pending_writes(), 0);
        outbound.flush().await;
        assert!(store.messages(&Scope::global()).is_empty());
    }

    #[tokio::test]
    async fn send_requires_sender_and_connection() {
        let (mut outbound, _store) = coordinator();
        let mut debouncer = TypingDebouncer::default();
        let mut transport = MockTransport::new();

        assert_matches!(
            outbound.send("hi", None, true, &mut transport, &mut debouncer),
            Err(SendError::NoSender)
        );
        assert_matches!(
            outbound.send("hi", Some("alice"), false, &mut transport, &mut debouncer),
            Err(SendError::NotConnected)
        );
        assert_eq!(outbound.pending_writes(), 0);
    }

    #[tokio::test]
    #[traced_test]
    async fn durable_failure_is_logged_and_swallowed() {
        let (mut outbound, store) = coordinator();
        store.fail_appends(true);
        let mut debouncer = TypingDebouncer::default();
        let mut transport = MockTransport::new();
        transport.expect_send().times(1).returning(|_| Ok(()));

        let dispatched = outbound
            .send("hello", Some("alice"), true, &mut transport, &mut debouncer)
            .unwrap();
        outbound.flush().await;

        assert!(dispatched.live_delivered());
        assert!(store.messages(&Scope::global()).is_empty());
        assert!(logs_contain("durable write failed"));
    }

    #[tokio::test]
    async fn live_failure_does_not_block_durable_write() {
        let (mut outbound, store) = coordinator();
        let mut debouncer = TypingDebouncer::default();
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .times(1)
            .returning(|_| Err(TransportError::Unavailable("socket reset".into())));

        let dispatched = outbound
            .send("hello", Some("alice"), true, &mut transport, &mut debouncer)
            .unwrap();
        outbound.flush().await;

        assert!(!dispatched.live_delivered());
        assert_eq!(store.messages(&Scope::global()).len(), 1);
    }
}
