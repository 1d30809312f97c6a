use std::pin::pin;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::select;
use tracing::{debug, warn};

use parley_core::config::Config;
use parley_core::{ParleyError, Result};
use parley_core::event::{BroadcastEventBus, EventBus, EventPayload, EventSource};
use parley_history::InMemoryHistoryStore;
use parley_session::{ChatSession, SessionSettings, sign_in_configured};
use parley_transport::LoopbackHub;

use crate::input::{self, Action, HELP};
use crate::render::{self, Printer};

pub async fn run(config: Config) -> Result<()> {
    let event_bus: Arc<dyn EventBus> =
        Arc::new(BroadcastEventBus::new(config.event_bus.channel_capacity));
    let hub = LoopbackHub::new();
    let store = Arc::new(InMemoryHistoryStore::new());

    let session = ChatSession::new(
        Arc::clone(&event_bus),
        hub.transport(Arc::clone(&event_bus)),
        store,
        SessionSettings::from_config(&config),
    )?;
    let mut views = session.subscribe_view();
    let session_task = tokio::spawn(session.run());

    match &config.session.username {
        Some(username) => publish(
            &event_bus,
            "ui.username.chosen",
            EventPayload::UsernameChosen {
                username: username.clone(),
            },
        )?,
        None => println!("-- choose a username to join ({HELP})"),
    }

    if let Err(e) = sign_in_configured(&config.identity, event_bus.as_ref()).await {
        warn!(error = %e, "continuing without an identity");
    }

    let mut has_username = config.session.username.is_some();
    let mut printer = Printer::default();
    let mut stdout = std::io::stdout();
    let mut lines = pin!(stdin_lines());

    loop {
        select! {
            line = lines.next() => {
                let Some(line) = line else {
                    debug!("stdin closed");
                    break;
                };
                match input::parse_line(&line?, has_username) {
                    Action::None => {}
                    Action::Quit => break,
                    Action::Help => println!("-- {HELP}"),
                    Action::ShowWho => println!("{}", render::format_presence(&views.borrow())),
                    Action::ChooseUsername(username) => {
                        has_username = true;
                        publish(
                            &event_bus,
                            "ui.username.chosen",
                            EventPayload::UsernameChosen { username },
                        )?;
                    }
                    Action::Send(body) => request_send(&event_bus, body)?,
                }
            }
            changed = views.changed() => {
                if changed.is_err() {
                    debug!("session ended");
                    break;
                }
                let view = Arc::clone(&views.borrow_and_update());
                printer.print(&view, &mut stdout)?;
            }
        }
    }

    event_bus.emit(
        "system.shutdown.requested",
        EventSource::System("cli".into()),
        EventPayload::ShutdownRequested {
            reason: "user quit".to_string(),
        },
    )?;
    session_task
        .await
        .map_err(|e| ParleyError::Internal(format!("session task failed: {e}")))??;
    Ok(())
}

fn publish(
    event_bus: &Arc<dyn EventBus>,
    channel: &str,
    payload: EventPayload,
) -> Result<()> {
    event_bus.emit(channel, EventSource::Ui, payload)?;
    Ok(())
}

/// Stdin only yields finished lines, so there is no keystroke stream to
/// report typing from. Only the send itself is published.
fn request_send(event_bus: &Arc<dyn EventBus>, body: String) -> Result<()> {
    publish(
        event_bus,
        "ui.message.send.requested",
        EventPayload::MessageSendRequested { body },
    )
}

fn stdin_lines() -> impl Stream<Item = std::io::Result<String>> {
    let lines = BufReader::new(tokio::io::stdin()).lines();
    futures::stream::unfold(lines, |mut lines| async move {
        match lines.next_line().await {
            Ok(Some(line)) => Some((Ok(line), lines)),
            Ok(None) => None,
            Err(e) => Some((Err(e), lines)),
        }
    })
}
