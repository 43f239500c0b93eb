use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

use crate::registry::{LinkRole, NegotiationState};
use crate::transport::TransportState;
use crate::types::ParticipantId;

/// Session-wide connectivity as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    /// Not in a meeting.
    Idle,
    Joining,
    Connected,
    Leaving,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "Idle"),
            ConnectionState::Joining => write!(f, "Joining"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Leaving => write!(f, "Leaving"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LinkStatus {
    pub state: NegotiationState,
    pub transport: TransportState,
    pub role: LinkRole,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub links: BTreeMap<ParticipantId, LinkStatus>,
    pub last_error: Option<String>,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Idle,
            links: BTreeMap::new(),
            last_error: None,
        }
    }
}

/// Publishes link snapshots for observers. Written only by the session.
#[derive(Clone)]
pub struct ConnectionMonitor {
    status: Arc<watch::Sender<ConnectionStatus>>,
    receiver: watch::Receiver<ConnectionStatus>,
}

impl Default for ConnectionMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionMonitor {
    pub fn new() -> Self {
        let (status, receiver) = watch::channel(ConnectionStatus::default());
        Self {
            status: Arc::new(status),
            receiver,
        }
    }

    pub fn update_state(&self, state: ConnectionState) {
        self.status.send_modify(|status| {
            status.state = state;
        });
    }

    pub fn update_link(&self, peer: &ParticipantId, link: LinkStatus) {
        self.status.send_modify(|status| {
            status.links.insert(peer.clone(), link);
        });
    }

    pub fn remove_link(&self, peer: &ParticipantId) {
        self.status.send_if_modified(|status| status.links.remove(peer).is_some());
    }

    pub fn clear_links(&self) {
        self.status.send_if_modified(|status| {
            let changed = !status.links.is_empty();
            status.links.clear();
            changed
        });
    }

    pub fn set_error(&self, error: String) {
        self.status.send_modify(|status| {
            status.last_error = Some(error);
        });
    }

    pub fn link(&self, peer: &ParticipantId) -> Option<LinkStatus> {
        self.receiver.borrow().links.get(peer).copied()
    }

    pub fn current(&self) -> ConnectionStatus {
        self.receiver.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.receiver.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn links_are_tracked_per_peer() {
        let monitor = ConnectionMonitor::new();
        let mut rx = monitor.subscribe();
        let peer = ParticipantId::from("2");
        let status = LinkStatus {
            state: NegotiationState::OfferSent,
            transport: TransportState::New,
            role: LinkRole::Initiator,
        };

        monitor.update_link(&peer, status);
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().links.get(&peer), Some(&status));

        monitor.remove_link(&peer);
        assert!(monitor.link(&peer).is_none());
        monitor.remove_link(&peer);
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();
        monitor.remove_link(&peer);
        assert!(!rx.has_changed().unwrap());
    }
}
