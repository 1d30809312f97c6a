use std::sync::Arc;
use std::time::Duration;

use parley_core::EventBusError;
use parley_core::config::Config;
use parley_core::event::{
    ChatMessage, Event, EventBus, EventPayload, EventSource, EventSubscription, PresenceEntry,
};
use parley_history::{
    HistoryError, HistoryStore, HistorySubscription, HistoryUpdate, SNAPSHOT_LIMIT, Scope,
};
use parley_transport::LiveTransport;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{FailureKind, SendError, SessionError};
use crate::lifecycle::{ConnectRequest, ConnectionLifecycle, ConnectionState};
use crate::outbound::{Dispatched, OutboundCoordinator};
use crate::reconcile::{ReconciliationEngine, ViewEntry};
use crate::typing::{DEFAULT_QUIET_PERIOD, TypingDebouncer, TypingSignal};

/// Everything the session reacts to.
pub const SESSION_EVENT_PATTERN: &str = "{system,live,ui}.**";

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub scope: Scope,
    pub history_limit: usize,
    pub correlate_sent: bool,
    pub quiet_period: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            scope: Scope::global(),
            history_limit: SNAPSHOT_LIMIT,
            correlate_sent: true,
            quiet_period: DEFAULT_QUIET_PERIOD,
        }
    }
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            scope: Scope::new(config.history.scope.clone()),
            history_limit: config.history.limit,
            correlate_sent: config.history.correlate_sent,
            quiet_period: config.typing.quiet_period(),
        }
    }
}

/// Immutable snapshot of everything a renderer needs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationView {
    pub entries: Vec<ViewEntry>,
    pub presence: Vec<PresenceEntry>,
    pub typing: Vec<String>,
    pub connection: ConnectionState,
    pub username: Option<String>,
    pub history_degraded: bool,
    pub identity_failure: Option<String>,
}

impl ConversationView {
    pub fn messages(&self) -> impl Iterator<Item = &ChatMessage> {
        self.entries.iter().map(|entry| &entry.message)
    }

    /// Input controls are only live while connected.
    pub fn input_enabled(&self) -> bool {
        self.connection == ConnectionState::Connected
    }
}

/// One client's chat session.
///
/// All state changes happen on the task that drives the session, one event
/// at a time. A fresh [`ConversationView`] is published after each handled
/// event.
pub struct ChatSession<T: LiveTransport, H: HistoryStore> {
    bus: Arc<dyn EventBus>,
    events: EventSubscription,
    transport: T,
    store: Arc<H>,
    scope: Scope,
    engine: ReconciliationEngine,
    debouncer: TypingDebouncer,
    outbound: OutboundCoordinator<H>,
    lifecycle: ConnectionLifecycle,
    history: Option<HistorySubscription>,
    /// Whether the transport was last told we are typing. A stop that could
    /// not be delivered leaves this set until the link comes back.
    typing_announced: bool,
    view_tx: watch::Sender<Arc<ConversationView>>,
}

impl<T: LiveTransport, H: HistoryStore> ChatSession<T, H> {
    pub fn new(
        bus: Arc<dyn EventBus>,
        transport: T,
        store: Arc<H>,
        settings: SessionSettings,
    ) -> Result<Self, SessionError> {
        let events = bus.subscribe(SESSION_EVENT_PATTERN)?;
        let (view_tx, _) = watch::channel(Arc::new(ConversationView::default()));

        Ok(Self {
            bus,
            events,
            transport,
            outbound: OutboundCoordinator::new(Arc::clone(&store), settings.scope.clone()),
            store,
            scope: settings.scope,
            engine: ReconciliationEngine::new(
                settings.history_limit,
                settings.correlate_sent,
                settings.quiet_period,
            ),
            debouncer: TypingDebouncer::new(settings.quiet_period),
            lifecycle: ConnectionLifecycle::new(),
            history: None,
            typing_announced: false,
            view_tx,
        })
    }

    pub fn subscribe_view(&self) -> watch::Receiver<Arc<ConversationView>> {
        self.view_tx.subscribe()
    }

    /// The most recently published view.
    pub fn conversation(&self) -> Arc<ConversationView> {
        Arc::clone(&self.view_tx.borrow())
    }

    pub fn view(&self) -> Vec<ViewEntry> {
        self.engine.view()
    }

    pub fn presence(&self) -> &[PresenceEntry] {
        self.engine.presence()
    }

    pub fn typing(&self) -> Vec<String> {
        self.engine.typing()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.lifecycle.connection_state()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn handle_event(&mut self, event: &Event) {
        match &event.payload {
            EventPayload::IdentityReady { identity_id } => self.on_identity_ready(identity_id),
            EventPayload::IdentityFailed { reason } => self.lifecycle.on_identity_failed(reason),
            EventPayload::UsernameChosen { username } => self.choose_username(username),
            EventPayload::ConnectionChanged { connected } => {
                let was_connected = self.lifecycle.is_connected();
                self.lifecycle.on_connection_change(*connected);
                if *connected && !was_connected {
                    self.resync_typing();
                }
            }
            EventPayload::MessageReceived { message } => {
                let mut message = message.clone();
                if message.correlation_id.is_none() {
                    message.correlation_id = event.correlation_id;
                }
                self.engine.on_live_message(message);
            }
            EventPayload::PresenceReceived { users } => {
                self.engine.on_presence_snapshot(users.clone());
            }
            EventPayload::TypingReceived { usernames, typist } => {
                self.engine
                    .on_typing_update(usernames.clone(), typist.as_deref(), Instant::now());
            }
            EventPayload::InputChanged { text } => self.on_input(text),
            EventPayload::MessageSendRequested { body } => {
                if let Err(e) = self.dispatch_send(body) {
                    debug!(error = %e, "send request refused");
                }
            }
            EventPayload::ShutdownRequested { .. } | EventPayload::ErrorOccurred { .. } => {}
        }
        self.publish_view();
    }

    pub fn handle_history_update(&mut self, update: HistoryUpdate) {
        match update {
            HistoryUpdate::Snapshot(messages) => self.engine.on_durable_snapshot(messages),
            HistoryUpdate::Error(e) => self.engine.on_durable_error(&e),
        }
        self.publish_view();
    }

    /// Send a line of text as the chosen username.
    pub fn send(&mut self, text: &str) -> Result<Dispatched, SendError> {
        let dispatched = self.dispatch_send(text)?;
        self.publish_view();
        Ok(dispatched)
    }

    /// Fire whatever timers are due at `now`.
    pub fn poll_timers(&mut self, now: Instant) {
        match self.debouncer.poll_expired(now) {
            Some(TypingSignal::Stop) => self.emit_typing(false),
            Some(TypingSignal::Renew) => self.renew_typing(),
            Some(TypingSignal::Start) | None => {}
        }
        if self.engine.expire_typing(now) {
            self.publish_view();
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        [self.debouncer.next_wake(), self.engine.next_typing_expiry()]
            .into_iter()
            .flatten()
            .min()
    }

    /// Drive the session until shutdown is requested or the bus closes.
    pub async fn run(mut self) -> Result<(), SessionError> {
        info!(scope = %self.scope, "chat session started");
        self.publish_view();

        let result = loop {
            let deadline = self.next_deadline();
            tokio::select! {
                received = self.events.recv() => match received {
                    Ok(event) => {
                        if let EventPayload::ShutdownRequested { reason } = &event.payload {
                            info!(%reason, "shutdown requested");
                            break Ok(());
                        }
                        self.handle_event(&event);
                    }
                    Err(EventBusError::Lagged(count)) => {
                        warn!(count, "chat session lagged, some events dropped");
                    }
                    Err(EventBusError::ChannelClosed) => {
                        debug!("event bus closed, chat session stopping");
                        break Ok(());
                    }
                    Err(e) => break Err(SessionError::from(e)),
                },
                update = next_history_update(self.history.as_mut()) => match update {
                    Some(update) => self.handle_history_update(update),
                    None => {
                        self.history = None;
                        self.handle_history_update(HistoryUpdate::Error(
                            HistoryError::Unavailable("subscription closed".to_string()),
                        ));
                    }
                },
                _ = sleep_until(deadline) => self.poll_timers(Instant::now()),
            }
        };

        self.shutdown().await;
        result
    }

    /// Release the history subscription, leave the live channel, and wait
    /// for outstanding durable writes.
    pub async fn shutdown(&mut self) {
        self.history = None;
        if self.debouncer.cancel() == Some(TypingSignal::Stop) {
            self.emit_typing(false);
        }
        if self.lifecycle.connection_state() != ConnectionState::Disconnected
            && let Err(e) = self.transport.disconnect()
        {
            warn!(error = %e, "disconnect failed during shutdown");
        }
        self.outbound.flush().await;
        info!(scope = %self.scope, "chat session stopped");
    }

    fn on_identity_ready(&mut self, identity_id: &str) {
        if let Some(request) = self.lifecycle.on_identity_ready(identity_id) {
            self.connect(request);
        }
        self.open_history();
    }

    fn open_history(&mut self) {
        if self.history.is_some() || !self.lifecycle.history_enabled() {
            return;
        }
        match self.store.subscribe(&self.scope) {
            Ok(subscription) => {
                debug!(scope = %self.scope, "history subscription opened");
                self.history = Some(subscription);
            }
            Err(e) => self.engine.on_durable_error(&e),
        }
    }

    fn choose_username(&mut self, username: &str) {
        match self.lifecycle.choose_username(username) {
            Ok(request) => {
                if let Some(chosen) = self.lifecycle.username() {
                    self.engine.set_local_username(chosen);
                }
                if let Some(request) = request {
                    self.connect(request);
                }
            }
            Err(e) => warn!(error = %e, "username not accepted"),
        }
    }

    fn connect(&mut self, request: ConnectRequest) {
        if let Err(e) = self.transport.connect(&request.username) {
            self.lifecycle.on_connect_failed(&e);
            self.report_failure(FailureKind::TransportFailure, &e, e.is_retryable());
        }
    }

    fn dispatch_send(&mut self, text: &str) -> Result<Dispatched, SendError> {
        let connected = self.lifecycle.is_connected();
        let dispatched = self.outbound.send(
            text,
            self.lifecycle.username(),
            connected,
            &mut self.transport,
            &mut self.debouncer,
        )?;
        if dispatched.live_delivered() {
            self.engine.on_local_send(dispatched.message.to_chat_message());
        }
        if dispatched.typing_cleared {
            self.typing_announced = false;
        }
        Ok(dispatched)
    }

    /// Feed an input-box change to the typing debouncer.
    pub fn on_input(&mut self, text: &str) {
        if self.debouncer.on_input(text, Instant::now()) == Some(TypingSignal::Start) {
            self.emit_typing(true);
        }
    }

    fn emit_typing(&mut self, typing: bool) {
        if !self.lifecycle.is_connected() {
            debug!(typing, "not connected, typing signal deferred");
            return;
        }
        match self.transport.set_typing(typing) {
            Ok(()) => self.typing_announced = typing,
            Err(e) => warn!(error = %e, typing, "failed to send typing signal"),
        }
    }

    fn renew_typing(&mut self) {
        if !self.lifecycle.is_connected() {
            return;
        }
        match self.transport.keep_typing() {
            Ok(()) => self.typing_announced = true,
            Err(e) => warn!(error = %e, "failed to renew typing signal"),
        }
    }

    /// After the link comes back, make the transport agree with the
    /// debouncer: resume a burst still under way, or deliver a stop that was
    /// swallowed while offline.
    fn resync_typing(&mut self) {
        if self.debouncer.is_typing() {
            self.emit_typing(true);
        } else if self.typing_announced {
            debug!("delivering typing stop deferred while offline");
            self.emit_typing(false);
        }
    }

    fn report_failure(&self, kind: FailureKind, err: &dyn std::fmt::Display, recoverable: bool) {
        let published = self.bus.emit(
            "system.error.occurred",
            EventSource::System("session".into()),
            EventPayload::ErrorOccurred {
                component: kind.to_string(),
                message: err.to_string(),
                recoverable,
            },
        );
        if let Err(e) = published {
            warn!(error = %e, "failed to publish failure event");
        }
    }

    fn publish_view(&self) {
        let view = ConversationView {
            entries: self.engine.view(),
            presence: self.engine.presence().to_vec(),
            typing: self.engine.typing(),
            connection: self.lifecycle.connection_state(),
            username: self.lifecycle.username().map(str::to_string),
            history_degraded: self.engine.history_degraded(),
            identity_failure: self.lifecycle.identity_failure().map(str::to_string),
        };
        self.view_tx.send_replace(Arc::new(view));
    }
}

async fn next_history_update(
    subscription: Option<&mut HistorySubscription>,
) -> Option<HistoryUpdate> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
