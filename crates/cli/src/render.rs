use std::collections::HashSet;
use std::io::Write;

use chrono::Local;
use parley_session::{ConversationView, DisplayKey, EntryStatus, ViewEntry};

pub fn format_entry(entry: &ViewEntry) -> String {
    let message = &entry.message;
    let time = message.timestamp.with_timezone(&Local).format("%H:%M");
    if message.is_system {
        return format!("[{time}] * {}", message.text);
    }
    let marker = match entry.status {
        EntryStatus::Sending => " (sending)",
        EntryStatus::Durable | EntryStatus::Live | EntryStatus::Persisted => "",
    };
    format!("[{time}] {}: {}{marker}", message.sender, message.text)
}

pub fn format_status(view: &ConversationView) -> String {
    let mut status = match (&view.identity_failure, &view.username) {
        (Some(reason), _) => format!("-- authenticating failed ({reason})"),
        (None, Some(username)) => format!("-- {} as {username}", view.connection),
        (None, None) => format!("-- {}", view.connection),
    };
    if view.history_degraded {
        status.push_str(" | history unavailable");
    }
    if !view.typing.is_empty() {
        let verb = if view.typing.len() == 1 { "is" } else { "are" };
        status.push_str(&format!(" | {} {verb} typing", view.typing.join(", ")));
    }
    status
}

pub fn format_presence(view: &ConversationView) -> String {
    if view.presence.is_empty() {
        return "-- nobody online".to_string();
    }
    let names: Vec<&str> = view
        .presence
        .iter()
        .map(|entry| entry.username.as_str())
        .collect();
    format!("-- online: {}", names.join(", "))
}

/// Prints each entry once, plus the status line whenever it changes.
#[derive(Debug, Default)]
pub struct Printer {
    printed: HashSet<DisplayKey>,
    last_status: Option<String>,
}

impl Printer {
    pub fn print(&mut self, view: &ConversationView, out: &mut impl Write) -> std::io::Result<()> {
        for entry in &view.entries {
            if self.printed.insert(entry.key.clone()) {
                writeln!(out, "{}", format_entry(entry))?;
            }
        }

        let status = format_status(view);
        if self.last_status.as_ref() != Some(&status) {
            writeln!(out, "{status}")?;
            self.last_status = Some(status);
        }
        out.flush()
    }
}
