//! Local typing indicator debouncing.
//!
//! Raw input changes go in, at most one `Start` per burst and exactly one
//! `Stop` per burst come out. While a burst lasts, a `Renew` keep-alive is
//! due every half quiet period so peers can tell a long burst from a lost
//! stop. Both deadlines live inside the `Typing` state, so leaving that
//! state cancels them.

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

pub const DEFAULT_QUIET_PERIOD: Duration = Duration::from_millis(2000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypingSignal {
    Start,
    Renew,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct InactivityTimer {
    deadline: Instant,
    renew_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DebounceState {
    Idle,
    Typing(InactivityTimer),
}

#[derive(Debug)]
pub struct TypingDebouncer {
    quiet_period: Duration,
    state: DebounceState,
}

impl Default for TypingDebouncer {
    fn default() -> Self {
        Self::new(DEFAULT_QUIET_PERIOD)
    }
}

impl TypingDebouncer {
    pub fn new(quiet_period: Duration) -> Self {
        Self {
            quiet_period,
            state: DebounceState::Idle,
        }
    }

    pub fn quiet_period(&self) -> Duration {
        self.quiet_period
    }

    fn renew_interval(&self) -> Duration {
        self.quiet_period / 2
    }

    pub fn is_typing(&self) -> bool {
        matches!(self.state, DebounceState::Typing(_))
    }

    /// When the current burst ends if no further input arrives.
    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            DebounceState::Typing(timer) => Some(timer.deadline),
            DebounceState::Idle => None,
        }
    }

    /// Earliest instant at which [`poll_expired`](Self::poll_expired) has
    /// something to report.
    pub fn next_wake(&self) -> Option<Instant> {
        match self.state {
            DebounceState::Typing(timer) => Some(timer.deadline.min(timer.renew_at)),
            DebounceState::Idle => None,
        }
    }

    /// Record an input change. Returns `Start` on the first change with
    /// visible text after idling; later changes only push the deadline back.
    pub fn on_input(&mut self, text: &str, now: Instant) -> Option<TypingSignal> {
        let deadline = now + self.quiet_period;
        match self.state {
            DebounceState::Idle if text.trim().is_empty() => None,
            DebounceState::Idle => {
                debug!("typing started");
                self.state = DebounceState::Typing(InactivityTimer {
                    deadline,
                    renew_at: now + self.renew_interval(),
                });
                Some(TypingSignal::Start)
            }
            DebounceState::Typing(timer) => {
                self.state = DebounceState::Typing(InactivityTimer { deadline, ..timer });
                None
            }
        }
    }

    /// A send ends the burst immediately.
    pub fn on_send(&mut self) -> Option<TypingSignal> {
        self.stop("message sent")
    }

    /// Abandon the burst, e.g. on teardown.
    pub fn cancel(&mut self) -> Option<TypingSignal> {
        self.stop("cancelled")
    }

    /// Fire the trailing edge once the deadline has passed, or a keep-alive
    /// when one is due.
    pub fn poll_expired(&mut self, now: Instant) -> Option<TypingSignal> {
        match self.state {
            DebounceState::Typing(timer) if now >= timer.deadline => self.stop("quiet period elapsed"),
            DebounceState::Typing(timer) if now >= timer.renew_at => {
                self.state = DebounceState::Typing(InactivityTimer {
                    renew_at: now + self.renew_interval(),
                    ..timer
                });
                Some(TypingSignal::Renew)
            }
            _ => None,
        }
    }

    fn stop(&mut self, cause: &'static str) -> Option<TypingSignal> {
        match std::mem::replace(&mut self.state, DebounceState::Idle) {
            DebounceState::Typing(_) => {
                debug!(cause, "typing stopped");
                Some(TypingSignal::Stop)
            }
            DebounceState::Idle => None,
        }
    }
}
