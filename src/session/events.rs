//! Session states and the notifications a session owner can subscribe to

use std::sync::mpsc::{channel, Receiver, Sender};

use crate::errors::ErrorReport;
use crate::progress::Affordance;
use crate::tracks::TrackDescriptor;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Preparing,
    Ready,
    Playing,
    Paused,
    /// Terminal; the owner shows the report and stops the session
    Error(ErrorReport),
    Stopped,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Error(_) | SessionState::Stopped)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    Error(ErrorReport),
    TracksChanged,
    /// A subtitle was turned on because it matched the preferred language
    SubtitleSelected(TrackDescriptor),
    Affordance { affordance: Affordance, visible: bool },
    NetworkSpeed(String),
    Progress {
        position_ms: u64,
        duration_ms: Option<u64>,
        watched_seconds: u64,
    },
    Ended,
}

/// Fan-out to every subscriber; dropped receivers are forgotten on the next send
#[derive(Default)]
pub(crate) struct EventBus {
    subscribers: Vec<Sender<SessionEvent>>,
}

impl EventBus {
    pub fn subscribe(&mut self) -> Receiver<SessionEvent> {
        let (tx, rx) = channel();
        self.subscribers.push(tx);
        rx
    }

    pub fn emit(&mut self, event: SessionEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}
