//! Durable message history boundary.
//!
//! The store is an append-only log per conversation scope. Readers subscribe
//! and receive whole snapshots of the most recent messages, oldest first,
//! every time the log changes.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use parley_core::event::ChatMessage;

/// Most recent messages included in a snapshot.
pub const SNAPSHOT_LIMIT: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HistoryError {
    #[error("history store unavailable: {0}")]
    Unavailable(String),

    #[error("history query failed: {0}")]
    QueryFailed(String),

    #[error("history write rejected: {0}")]
    WriteRejected(String),
}

/// Identifies one conversation log in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Scope(String);

impl Scope {
    const GLOBAL: &'static str = "global";

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The single shared room every client joins.
    pub fn global() -> Self {
        Self::new(Self::GLOBAL)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryUpdate {
    /// Complete replacement set, oldest first.
    Snapshot(Vec<ChatMessage>),
    Error(HistoryError),
}

pub trait HistoryStore: Send + Sync + 'static {
    fn subscribe(&self, scope: &Scope) -> Result<HistorySubscription, HistoryError>;

    /// Append a message and resolve to its store-assigned id.
    fn append(
        &self,
        scope: &Scope,
        message: ChatMessage,
    ) -> impl Future<Output = Result<String, HistoryError>> + Send;
}

/// Live snapshot feed for one scope. Dropping it unsubscribes.
pub struct HistorySubscription {
    scope: Scope,
    receiver: mpsc::UnboundedReceiver<HistoryUpdate>,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl HistorySubscription {
    pub fn new(
        scope: Scope,
        receiver: mpsc::UnboundedReceiver<HistoryUpdate>,
        release: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            scope,
            receiver,
            release: Some(Box::new(release)),
        }
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Next update, or `None` once the store has gone away.
    pub async fn recv(&mut self) -> Option<HistoryUpdate> {
        self.receiver.recv().await
    }
}

impl Drop for HistorySubscription {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// Turn a newest-first query result into the oldest-first order the
/// conversation view renders, keeping only the most recent `limit`.
pub fn render_order(mut newest_first: Vec<ChatMessage>, limit: usize) -> Vec<ChatMessage> {
    newest_first.truncate(limit);
    newest_first.reverse();
    newest_first
}

struct Subscriber {
    scope: Scope,
    sender: mpsc::UnboundedSender<HistoryUpdate>,
}

#[derive(Default)]
struct StoreState {
    /// Append order stands in for the server timestamp ordering.
    logs: HashMap<Scope, Vec<ChatMessage>>,
    subscribers: HashMap<u64, Subscriber>,
    next_subscriber_id: u64,
    reject_appends: bool,
}

impl StoreState {
    fn recent_newest_first(&self, scope: &Scope, limit: usize) -> Vec<ChatMessage> {
        self.logs
            .get(scope)
            .map(|log| log.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    fn snapshot(&self, scope: &Scope) -> Vec<ChatMessage> {
        render_order(self.recent_newest_first(scope, SNAPSHOT_LIMIT), SNAPSHOT_LIMIT)
    }

    fn notify(&mut self, scope: &Scope, update: HistoryUpdate) {
        self.subscribers.retain(|id, subscriber| {
            if subscriber.scope != *scope {
                return true;
            }
            let delivered = subscriber.sender.send(update.clone()).is_ok();
            if !delivered {
                debug!(subscriber = id, %scope, "dropping closed history subscriber");
            }
            delivered
        });
    }
}

/// Process-local history store used by the terminal client and tests.
#[derive(Clone, Default)]
pub struct InMemoryHistoryStore {
    inner: Arc<Mutex<StoreState>>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a scope with already-persisted messages, oldest first.
    pub fn with_messages(scope: &Scope, messages: Vec<ChatMessage>) -> Self {
        let store = Self::new();
        if let Ok(mut state) = store.inner.lock() {
            let log = state.logs.entry(scope.clone()).or_default();
            log.extend(messages.into_iter().map(|message| match message.id {
                Some(_) => message,
                None => message.with_id(Uuid::new_v4().to_string()),
            }));
        }
        store
    }

    /// Make every subsequent append fail until switched back off.
    pub fn fail_appends(&self, fail: bool) {
        if let Ok(mut state) = self.inner.lock() {
            state.reject_appends = fail;
        }
    }

    /// Push a read error to every subscriber of `scope`.
    pub fn fail_reads(&self, scope: &Scope, reason: &str) {
        if let Ok(mut state) = self.inner.lock() {
            warn!(%scope, reason, "injecting history read failure");
            state.notify(
                scope,
                HistoryUpdate::Error(HistoryError::QueryFailed(reason.to_string())),
            );
        }
    }

    pub fn subscriber_count(&self, scope: &Scope) -> usize {
        self.inner
            .lock()
            .map(|state| {
                state
                    .subscribers
                    .values()
                    .filter(|subscriber| subscriber.scope == *scope)
                    .count()
            })
            .unwrap_or(0)
    }

    /// The full log for `scope`, oldest first.
    pub fn messages(&self, scope: &Scope) -> Vec<ChatMessage> {
        self.inner
            .lock()
            .map(|state| state.logs.get(scope).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    fn state(&self) -> Result<MutexGuard<'_, StoreState>, HistoryError> {
        lock_state(&self.inner)
    }
}

fn lock_state(inner: &Mutex<StoreState>) -> Result<MutexGuard<'_, StoreState>, HistoryError> {
    inner
        .lock()
        .map_err(|_| HistoryError::Unavailable("poisoned lock".to_string()))
}

impl HistoryStore for InMemoryHistoryStore {
    fn subscribe(&self, scope: &Scope) -> Result<HistorySubscription, HistoryError> {
        let mut state = self.state()?;
        let (sender, receiver) = mpsc::unbounded_channel();

        let id = state.next_subscriber_id;
        state.next_subscriber_id += 1;

        // Like a live query, the current snapshot is delivered right away.
        let _ = sender.send(HistoryUpdate::Snapshot(state.snapshot(scope)));
        state.subscribers.insert(
            id,
            Subscriber {
                scope: scope.clone(),
                sender,
            },
        );
        debug!(subscriber = id, %scope, "history subscription opened");

        let inner = Arc::clone(&self.inner);
        Ok(HistorySubscription::new(scope.clone(), receiver, move || {
            if let Ok(mut state) = inner.lock() {
                state.subscribers.remove(&id);
                debug!(subscriber = id, "history subscription released");
            }
        }))
    }

    fn append(
        &self,
        scope: &Scope,
        message: ChatMessage,
    ) -> impl Future<Output = Result<String, HistoryError>> + Send {
        let inner = Arc::clone(&self.inner);
        let scope = scope.clone();

        async move {
            let mut state = lock_state(&inner)?;
            if state.reject_appends {
                return Err(HistoryError::WriteRejected(
                    "store is rejecting writes".to_string(),
                ));
            }

            let id = Uuid::new_v4().to_string();
            state
                .logs
                .entry(scope.clone())
                .or_default()
                .push(message.with_id(id.clone()));

            let snapshot = state.snapshot(&scope);
            state.notify(&scope, HistoryUpdate::Snapshot(snapshot));
            Ok(id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn texts(messages: &[ChatMessage]) -> Vec<&str> {
        messages.iter().map(|m| m.text.as_str()).collect()
    }

    async fn next_snapshot(sub: &mut HistorySubscription) -> Vec<ChatMessage> {
        match sub.recv().await {
            Some(HistoryUpdate::Snapshot(messages)) => messages,
            other => panic!("expected snapshot, got {other:?}"),
        }
    }

    #[test]
    fn render_order_reverses_and_caps() {
        let newest_first = vec![
            ChatMessage::new("a", "3"),
            ChatMessage::new("a", "2"),
            ChatMessage::new("a", "1"),
        ];
        let ordered = render_order(newest_first, 2);
        assert_eq!(texts(&ordered), vec!["2", "3"]);
    }

    #[test]
    fn global_scope_name() {
        assert_eq!(Scope::global().as_str(), "global");
        assert_eq!(Scope::new("lobby").to_string(), "lobby");
    }

    #[tokio::test]
    async fn subscribe_delivers_current_snapshot_oldest_first() {
        let scope = Scope::global();
        let store = InMemoryHistoryStore::with_messages(
            &scope,
            vec![ChatMessage::new("alice", "first"), ChatMessage::new("bob", "second")],
        );

        let mut sub = store.subscribe(&scope).unwrap();
        let snapshot = next_snapshot(&mut sub).await;

        assert_eq!(texts(&snapshot), vec!["first", "second"]);
        assert!(snapshot.iter().all(|m| m.id.is_some()));
    }

    #[tokio::test]
    async fn append_assigns_id_and_pushes_fresh_snapshot() {
        let scope = Scope::global();
        let store = InMemoryHistoryStore::new();
        let mut sub = store.subscribe(&scope).unwrap();
        assert!(next_snapshot(&mut sub).await.is_empty());

        let id = store
            .append(&scope, ChatMessage::new("alice", "hello"))
            .await
            .unwrap();

        let snapshot = next_snapshot(&mut sub).await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id.as_deref(), Some(id.as_str()));
        assert_eq!(snapshot[0].text, "hello");
    }

    #[tokio::test]
    async fn snapshot_keeps_only_most_recent_fifty() {
        let scope = Scope::global();
        let seeded = (0..60)
            .map(|i| ChatMessage::new("alice", i.to_string()))
            .collect();
        let store = InMemoryHistoryStore::with_messages(&scope, seeded);

        let mut sub = store.subscribe(&scope).unwrap();
        let snapshot = next_snapshot(&mut sub).await;

        assert_eq!(snapshot.len(), SNAPSHOT_LIMIT);
        assert_eq!(snapshot.first().unwrap().text, "10");
        assert_eq!(snapshot.last().unwrap().text, "59");
    }

    #[tokio::test]
    async fn rejected_append_leaves_log_untouched() {
        let scope = Scope::global();
        let store = InMemoryHistoryStore::new();
        store.fail_appends(true);

        let err = store
            .append(&scope, ChatMessage::new("alice", "lost"))
            .await
            .unwrap_err();

        assert_matches!(err, HistoryError::WriteRejected(_));
        assert!(store.messages(&scope).is_empty());

        store.fail_appends(false);
        store
            .append(&scope, ChatMessage::new("alice", "kept"))
            .await
            .unwrap();
        assert_eq!(texts(&store.messages(&scope)), vec!["kept"]);
    }

    #[tokio::test]
    async fn read_failure_reaches_subscribers() {
        let scope = Scope::global();
        let store = InMemoryHistoryStore::new();
        let mut sub = store.subscribe(&scope).unwrap();
        next_snapshot(&mut sub).await;

        store.fail_reads(&scope, "permission denied");

        assert_matches!(
            sub.recv().await,
            Some(HistoryUpdate::Error(HistoryError::QueryFailed(reason))) if reason == "permission denied"
        );
    }

    #[tokio::test]
    async fn dropping_subscription_releases_listener() {
        let scope = Scope::global();
        let store = InMemoryHistoryStore::new();

        let sub = store.subscribe(&scope).unwrap();
        let other = store.subscribe(&scope).unwrap();
        assert_eq!(store.subscriber_count(&scope), 2);

        drop(sub);
        assert_eq!(store.subscriber_count(&scope), 1);
        drop(other);
        assert_eq!(store.subscriber_count(&scope), 0);
    }

    #[tokio::test]
    async fn scopes_are_isolated() {
        let lobby = Scope::new("lobby");
        let store = InMemoryHistoryStore::new();
        let mut global_sub = store.subscribe(&Scope::global()).unwrap();
        next_snapshot(&mut global_sub).await;

        store
            .append(&lobby, ChatMessage::new("bob", "elsewhere"))
            .await
            .unwrap();

        assert!(global_sub.receiver.try_recv().is_err());
        assert!(store.messages(&Scope::global()).is_empty());
        assert_eq!(store.messages(&lobby).len(), 1);
    }
}
