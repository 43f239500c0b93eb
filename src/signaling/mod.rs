//! Signaling side-channel.
//!
//! The core only needs a document store with change notifications: one room
//! document, one roster collection, one call record per ordered participant
//! pair and an append-only candidate list per ordered pair. Descriptions and
//! candidates travel through it as opaque blobs.

mod memory;
mod ws;

pub use memory::MemorySignaling;
pub use ws::{ClientFrame, ServerFrame, StoreOp, WsSignaling};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Result;
use crate::events::EventQueue;
use crate::room::{ParticipantRecord, RoomRecord};
use crate::types::{IceCandidate, ParticipantId, SessionDescription};

/// Offer or answer written by `from` for `to`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    pub from: ParticipantId,
    pub to: ParticipantId,
    /// Identifies one offer/answer round. Answers and candidates echo it.
    pub negotiation_id: u64,
    #[serde(default)]
    pub offer: Option<SessionDescription>,
    #[serde(default)]
    pub answer: Option<SessionDescription>,
    /// Offer made on an already established connection.
    #[serde(default)]
    pub renegotiation: bool,
}

impl CallRecord {
    pub fn offer(
        from: ParticipantId,
        to: ParticipantId,
        negotiation_id: u64,
        offer: SessionDescription,
        renegotiation: bool,
    ) -> Self {
        Self {
            from,
            to,
            negotiation_id,
            offer: Some(offer),
            answer: None,
            renegotiation,
        }
    }

    pub fn answer(
        from: ParticipantId,
        to: ParticipantId,
        negotiation_id: u64,
        answer: SessionDescription,
    ) -> Self {
        Self {
            from,
            to,
            negotiation_id,
            offer: None,
            answer: Some(answer),
            renegotiation: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateRecord {
    pub from: ParticipantId,
    pub to: ParticipantId,
    pub negotiation_id: u64,
    /// Store-assigned, increasing in append order.
    pub seq: u64,
    pub candidate: IceCandidate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "change", content = "participant", rename_all = "lowercase")]
pub enum RosterChange {
    Added(ParticipantRecord),
    Modified(ParticipantRecord),
    Removed(ParticipantId),
}

impl RosterChange {
    pub fn participant_id(&self) -> &ParticipantId {
        match self {
            RosterChange::Added(record) | RosterChange::Modified(record) => &record.id,
            RosterChange::Removed(id) => id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "lowercase")]
pub enum SignalingEvent {
    Room(RoomRecord),
    Roster(RosterChange),
    Call(CallRecord),
    Candidate(CandidateRecord),
}

/// What a subscription listens to inside one room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "topic", content = "participant", rename_all = "camelCase")]
pub enum Topic {
    Room,
    Roster,
    /// Call records addressed to the participant.
    CallsTo(ParticipantId),
    /// Candidates addressed to the participant.
    CandidatesTo(ParticipantId),
}

impl Topic {
    pub fn matches(&self, event: &SignalingEvent) -> bool {
        match (self, event) {
            (Topic::Room, SignalingEvent::Room(_)) => true,
            (Topic::Roster, SignalingEvent::Roster(_)) => true,
            (Topic::CallsTo(id), SignalingEvent::Call(record)) => &record.to == id,
            (Topic::CandidatesTo(id), SignalingEvent::Candidate(record)) => &record.to == id,
            _ => false,
        }
    }
}

/// Live listener registration. Dropping it unsubscribes.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

#[async_trait]
pub trait SignalingChannel: Send + Sync {
    async fn create_room(&self, room: RoomRecord) -> Result<()>;

    async fn get_room(&self, room_id: &str) -> Result<Option<RoomRecord>>;

    async fn update_room(&self, room: RoomRecord) -> Result<()>;

    /// Inserts or replaces the participant's roster entry.
    async fn put_participant(&self, room_id: &str, record: ParticipantRecord) -> Result<()>;

    async fn get_participant(
        &self,
        room_id: &str,
        id: &ParticipantId,
    ) -> Result<Option<ParticipantRecord>>;

    async fn list_participants(&self, room_id: &str) -> Result<Vec<ParticipantRecord>>;

    async fn remove_participant(&self, room_id: &str, id: &ParticipantId) -> Result<()>;

    /// Replaces the record for `(record.from, record.to)`. Writing an offer
    /// also resets that pair's candidate list.
    async fn put_call(&self, room_id: &str, record: CallRecord) -> Result<()>;

    async fn get_call(
        &self,
        room_id: &str,
        from: &ParticipantId,
        to: &ParticipantId,
    ) -> Result<Option<CallRecord>>;

    async fn append_candidate(
        &self,
        room_id: &str,
        from: &ParticipantId,
        to: &ParticipantId,
        negotiation_id: u64,
        candidate: IceCandidate,
    ) -> Result<()>;

    /// Drops the call record and candidates written by `from` for `to`.
    async fn clear_pair(&self, room_id: &str, from: &ParticipantId, to: &ParticipantId)
        -> Result<()>;

    /// Delivers the current matching documents, then every later change,
    /// into `queue` until the returned handle is dropped.
    async fn subscribe(&self, room_id: &str, topic: Topic, queue: EventQueue)
        -> Result<Subscription>;
}
