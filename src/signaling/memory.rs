//! In-process document store.
//!
//! Behaves like the hosted store the client was written against: writes are
//! visible immediately, subscriptions first replay the matching documents and
//! then receive every change in write order. Used by tests and by
//! single-process demos where several sessions share one store.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

use super::{
    CallRecord, CandidateRecord, RosterChange, SignalingChannel, SignalingEvent, Subscription,
    Topic,
};
use crate::error::{Error, Result};
use crate::events::EventQueue;
use crate::room::{ParticipantRecord, RoomRecord};
use crate::types::{IceCandidate, ParticipantId, RoomId};

type PairKey = (ParticipantId, ParticipantId);

#[derive(Default)]
struct RoomDocs {
    room: Option<RoomRecord>,
    participants: BTreeMap<ParticipantId, ParticipantRecord>,
    calls: HashMap<PairKey, CallRecord>,
    candidates: HashMap<PairKey, Vec<CandidateRecord>>,
}

struct Subscriber {
    id: u64,
    room_id: RoomId,
    topic: Topic,
    queue: EventQueue,
}

#[derive(Default)]
struct Store {
    rooms: HashMap<RoomId, RoomDocs>,
    subscribers: Vec<Subscriber>,
    next_subscriber: u64,
    next_seq: u64,
    failing_writes: u32,
}

impl Store {
    fn room_mut(&mut self, room_id: &str) -> &mut RoomDocs {
        self.rooms.entry(room_id.to_owned()).or_default()
    }

    fn check_write(&mut self) -> Result<()> {
        if self.failing_writes > 0 {
            self.failing_writes -= 1;
            return Err(Error::Signaling("document store unavailable".into()));
        }
        Ok(())
    }

    fn notify(&mut self, room_id: &str, event: SignalingEvent) {
        self.subscribers.retain(|sub| !sub.queue.is_closed());
        for sub in &self.subscribers {
            if sub.room_id == room_id && sub.topic.matches(&event) {
                sub.queue.push(event.clone());
            }
        }
    }
}

/// Shared handle; clones see the same documents.
#[derive(Clone, Default)]
pub struct MemorySignaling {
    store: Arc<Mutex<Store>>,
}

impl MemorySignaling {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` writes fail as if the store were unreachable.
    pub fn fail_next_writes(&self, count: u32) {
        self.lock().failing_writes = count;
    }

    pub fn subscriber_count(&self) -> usize {
        let mut store = self.lock();
        store.subscribers.retain(|sub| !sub.queue.is_closed());
        store.subscribers.len()
    }

    /// Candidates currently stored for the ordered pair, in append order.
    pub fn candidates(
        &self,
        room_id: &str,
        from: &ParticipantId,
        to: &ParticipantId,
    ) -> Vec<CandidateRecord> {
        self.lock()
            .rooms
            .get(room_id)
            .and_then(|docs| docs.candidates.get(&(from.clone(), to.clone())))
            .cloned()
            .unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, Store> {
        // A panic while holding the lock leaves plain data behind; keep going.
        self.store.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl SignalingChannel for MemorySignaling {
    async fn create_room(&self, room: RoomRecord) -> Result<()> {
        let mut store = self.lock();
        store.check_write()?;
        let room_id = room.id.clone();
        store.room_mut(&room_id).room = Some(room.clone());
        store.notify(&room_id, SignalingEvent::Room(room));
        Ok(())
    }

    async fn get_room(&self, room_id: &str) -> Result<Option<RoomRecord>> {
        Ok(self
            .lock()
            .rooms
            .get(room_id)
            .and_then(|docs| docs.room.clone()))
    }

    async fn update_room(&self, room: RoomRecord) -> Result<()> {
        let mut store = self.lock();
        store.check_write()?;
        let room_id = room.id.clone();
        let docs = store.room_mut(&room_id);
        if docs.room.is_none() {
            return Err(Error::RoomNotFound(room_id));
        }
        docs.room = Some(room.clone());
        store.notify(&room_id, SignalingEvent::Room(room));
        Ok(())
    }

    async fn put_participant(&self, room_id: &str, record: ParticipantRecord) -> Result<()> {
        let mut store = self.lock();
        store.check_write()?;
        let previous = store
            .room_mut(room_id)
            .participants
            .insert(record.id.clone(), record.clone());
        let change = match previous {
            Some(_) => RosterChange::Modified(record),
            None => RosterChange::Added(record),
        };
        store.notify(room_id, SignalingEvent::Roster(change));
        Ok(())
    }

    async fn get_participant(
        &self,
        room_id: &str,
        id: &ParticipantId,
    ) -> Result<Option<ParticipantRecord>> {
        Ok(self
            .lock()
            .rooms
            .get(room_id)
            .and_then(|docs| docs.participants.get(id).cloned()))
    }

    async fn list_participants(&self, room_id: &str) -> Result<Vec<ParticipantRecord>> {
        Ok(self
            .lock()
            .rooms
            .get(room_id)
            .map(|docs| docs.participants.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn remove_participant(&self, room_id: &str, id: &ParticipantId) -> Result<()> {
        let mut store = self.lock();
        store.check_write()?;
        if store.room_mut(room_id).participants.remove(id).is_some() {
            store.notify(room_id, SignalingEvent::Roster(RosterChange::Removed(id.clone())));
        }
        Ok(())
    }

    async fn put_call(&self, room_id: &str, record: CallRecord) -> Result<()> {
        let mut store = self.lock();
        store.check_write()?;
        let key = (record.from.clone(), record.to.clone());
        let docs = store.room_mut(room_id);
        if record.offer.is_some() {
            docs.candidates.remove(&key);
        }
        docs.calls.insert(key, record.clone());
        store.notify(room_id, SignalingEvent::Call(record));
        Ok(())
    }

    async fn get_call(
        &self,
        room_id: &str,
        from: &ParticipantId,
        to: &ParticipantId,
    ) -> Result<Option<CallRecord>> {
        Ok(self
            .lock()
            .rooms
            .get(room_id)
            .and_then(|docs| docs.calls.get(&(from.clone(), to.clone())).cloned()))
    }

    async fn append_candidate(
        &self,
        room_id: &str,
        from: &ParticipantId,
        to: &ParticipantId,
        negotiation_id: u64,
        candidate: IceCandidate,
    ) -> Result<()> {
        let mut store = self.lock();
        store.check_write()?;
        store.next_seq += 1;
        let record = CandidateRecord {
            from: from.clone(),
            to: to.clone(),
            negotiation_id,
            seq: store.next_seq,
            candidate,
        };
        store
            .room_mut(room_id)
            .candidates
            .entry((from.clone(), to.clone()))
            .or_default()
            .push(record.clone());
        store.notify(room_id, SignalingEvent::Candidate(record));
        Ok(())
    }

    async fn clear_pair(
        &self,
        room_id: &str,
        from: &ParticipantId,
        to: &ParticipantId,
    ) -> Result<()> {
        let mut store = self.lock();
        store.check_write()?;
        let key = (from.clone(), to.clone());
        let docs = store.room_mut(room_id);
        docs.calls.remove(&key);
        docs.candidates.remove(&key);
        Ok(())
    }

    async fn subscribe(
        &self,
        room_id: &str,
        topic: Topic,
        queue: EventQueue,
    ) -> Result<Subscription> {
        let mut store = self.lock();
        store.next_subscriber += 1;
        let id = store.next_subscriber;

        let snapshot: Vec<SignalingEvent> = match store.rooms.get(room_id) {
            None => Vec::new(),
            Some(docs) => match &topic {
                Topic::Room => docs.room.iter().cloned().map(SignalingEvent::Room).collect(),
                Topic::Roster => docs
                    .participants
                    .values()
                    .cloned()
                    .map(|record| SignalingEvent::Roster(RosterChange::Added(record)))
                    .collect(),
                Topic::CallsTo(to) => docs
                    .calls
                    .values()
                    .filter(|record| &record.to == to)
                    .cloned()
                    .map(SignalingEvent::Call)
                    .collect(),
                Topic::CandidatesTo(to) => {
                    let mut records: Vec<CandidateRecord> = docs
                        .candidates
                        .values()
                        .flatten()
                        .filter(|record| &record.to == to)
                        .cloned()
                        .collect();
                    records.sort_by_key(|record| record.seq);
                    records.into_iter().map(SignalingEvent::Candidate).collect()
                }
            },
        };
        for event in snapshot {
            queue.push(event);
        }

        debug!("memory store: subscriber {} on {} {:?}", id, room_id, topic);
        store.subscribers.push(Subscriber {
            id,
            room_id: room_id.to_owned(),
            topic,
            queue,
        });

        let weak = Arc::downgrade(&self.store);
        Ok(Subscription::new(move || {
            if let Some(store) = weak.upgrade() {
                let mut store = store.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                store.subscribers.retain(|sub| sub.id != id);
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{event_queue, SessionEvent};
    use crate::room::{Role, TopologyMode};
    use crate::types::SessionDescription;

    fn drain(rx: &mut crate::events::EventReceiver) -> Vec<SignalingEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let SessionEvent::Signaling(event) = event {
                out.push(event);
            }
        }
        out
    }

    #[tokio::test]
    async fn roster_subscription_replays_then_streams() {
        let store = MemorySignaling::new();
        store
            .create_room(RoomRecord::new("room".into(), "1".into(), TopologyMode::Mesh))
            .await
            .unwrap();
        store
            .put_participant("room", ParticipantRecord::new("1".into(), "Ann", Role::Admin))
            .await
            .unwrap();

        let (queue, mut rx) = event_queue();
        let _sub = store.subscribe("room", Topic::Roster, queue).await.unwrap();
        store
            .put_participant("room", ParticipantRecord::new("2".into(), "Bo", Role::Regular))
            .await
            .unwrap();
        store.remove_participant("room", &"2".into()).await.unwrap();

        let events = drain(&mut rx);
        assert_eq!(events.len(), 3);
        assert!(matches!(
            &events[0],
            SignalingEvent::Roster(RosterChange::Added(r)) if r.id.as_str() == "1"
        ));
        assert!(matches!(
            &events[1],
            SignalingEvent::Roster(RosterChange::Added(r)) if r.id.as_str() == "2"
        ));
        assert!(matches!(
            &events[2],
            SignalingEvent::Roster(RosterChange::Removed(id)) if id.as_str() == "2"
        ));
    }

    #[tokio::test]
    async fn calls_are_filtered_by_recipient() {
        let store = MemorySignaling::new();
        let (queue, mut rx) = event_queue();
        let _sub = store
            .subscribe("room", Topic::CallsTo("2".into()), queue)
            .await
            .unwrap();

        let offer = SessionDescription::offer("v=0");
        store
            .put_call("room", CallRecord::offer("1".into(), "2".into(), 7, offer.clone(), false))
            .await
            .unwrap();
        store
            .put_call("room", CallRecord::offer("1".into(), "3".into(), 8, offer, false))
            .await
            .unwrap();

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], SignalingEvent::Call(r) if r.negotiation_id == 7));
    }

    #[tokio::test]
    async fn new_offer_resets_pair_candidates() {
        let store = MemorySignaling::new();
        let (a, b) = (ParticipantId::from("1"), ParticipantId::from("2"));
        store
            .append_candidate("room", &a, &b, 1, IceCandidate::new("c1"))
            .await
            .unwrap();
        assert_eq!(store.candidates("room", &a, &b).len(), 1);

        let offer = CallRecord::offer(
            a.clone(),
            b.clone(),
            2,
            SessionDescription::offer("x"),
            false,
        );
        store.put_call("room", offer).await.unwrap();
        assert!(store.candidates("room", &a, &b).is_empty());
    }

    #[tokio::test]
    async fn dropping_subscription_stops_delivery() {
        let store = MemorySignaling::new();
        let (queue, mut rx) = event_queue();
        let sub = store.subscribe("room", Topic::Roster, queue).await.unwrap();
        assert_eq!(store.subscriber_count(), 1);
        sub.unsubscribe();
        assert_eq!(store.subscriber_count(), 0);

        store
            .put_participant("room", ParticipantRecord::new("1".into(), "Ann", Role::Admin))
            .await
            .unwrap();
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn injected_write_failure_surfaces_once() {
        let store = MemorySignaling::new();
        store.fail_next_writes(1);
        let record = ParticipantRecord::new("1".into(), "Ann", Role::Admin);
        assert!(store.put_participant("room", record.clone()).await.is_err());
        assert!(store.put_participant("room", record).await.is_ok());
    }
}
