//! Single per-session event queue.
//!
//! Signaling subscriptions, transport callbacks and the external router all
//! push typed events here; the session drains them one at a time, so every
//! state transition happens on one logical thread.

use tokio::sync::mpsc;

use crate::signaling::SignalingEvent;
use crate::topology::RouterEvent;
use crate::transport::TransportEvent;

#[derive(Debug, Clone)]
pub enum SessionEvent {
    Signaling(SignalingEvent),
    Transport(TransportEvent),
    Router(RouterEvent),
}

impl From<SignalingEvent> for SessionEvent {
    fn from(event: SignalingEvent) -> Self {
        SessionEvent::Signaling(event)
    }
}

impl From<TransportEvent> for SessionEvent {
    fn from(event: TransportEvent) -> Self {
        SessionEvent::Transport(event)
    }
}

impl From<RouterEvent> for SessionEvent {
    fn from(event: RouterEvent) -> Self {
        SessionEvent::Router(event)
    }
}

/// Producer side of the session queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EventQueue {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl EventQueue {
    /// Returns false once the session has dropped its receiver.
    pub fn push(&self, event: impl Into<SessionEvent>) -> bool {
        self.tx.send(event.into()).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub type EventReceiver = mpsc::UnboundedReceiver<SessionEvent>;

pub fn event_queue() -> (EventQueue, EventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventQueue { tx }, rx)
}
