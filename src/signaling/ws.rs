//! Document store reached over a websocket.
//!
//! Every store operation is a JSON `ClientFrame` tagged with a request id; the
//! relay answers with a `Reply` carrying the same id. Subscriptions are
//! opened with a client-chosen subscription id and the relay pushes `Event`
//! frames for it until the client sends `Unsubscribe`.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use super::{CallRecord, SignalingChannel, SignalingEvent, Subscription, Topic};
use crate::error::{Error, Result};
use crate::events::EventQueue;
use crate::room::{ParticipantRecord, RoomRecord};
use crate::types::{IceCandidate, ParticipantId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StoreOp {
    CreateRoom {
        room: RoomRecord,
    },
    GetRoom {
        room_id: String,
    },
    UpdateRoom {
        room: RoomRecord,
    },
    PutParticipant {
        room_id: String,
        record: ParticipantRecord,
    },
    GetParticipant {
        room_id: String,
        id: ParticipantId,
    },
    ListParticipants {
        room_id: String,
    },
    RemoveParticipant {
        room_id: String,
        id: ParticipantId,
    },
    PutCall {
        room_id: String,
        record: CallRecord,
    },
    GetCall {
        room_id: String,
        from: ParticipantId,
        to: ParticipantId,
    },
    AppendCandidate {
        room_id: String,
        from: ParticipantId,
        to: ParticipantId,
        negotiation_id: u64,
        candidate: IceCandidate,
    },
    ClearPair {
        room_id: String,
        from: ParticipantId,
        to: ParticipantId,
    },
    Subscribe {
        room_id: String,
        topic: Topic,
        subscription: u64,
    },
    Unsubscribe {
        subscription: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientFrame {
    pub id: u64,
    #[serde(flatten)]
    pub op: StoreOp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServerFrame {
    Reply {
        id: u64,
        #[serde(default)]
        value: Value,
        #[serde(default)]
        error: Option<String>,
    },
    Event {
        subscription: u64,
        event: SignalingEvent,
    },
}

type ReplySender = oneshot::Sender<std::result::Result<Value, String>>;
type PendingReplies = Arc<Mutex<HashMap<u64, ReplySender>>>;
type Subscribers = Arc<Mutex<HashMap<u64, EventQueue>>>;

/// How long a store operation waits for the relay's reply by default.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct WsSignaling {
    outgoing: mpsc::Sender<ClientFrame>,
    pending: PendingReplies,
    subscribers: Subscribers,
    next_id: AtomicU64,
    request_timeout: Duration,
}

impl WsSignaling {
    pub async fn connect(url: &str) -> Result<Self> {
        let (ws_stream, _) = connect_async(url).await?;
        let (mut write, mut read) = ws_stream.split();
        debug!("signaling connected to {}", url);

        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<ClientFrame>(100);
        let pending: PendingReplies = Arc::new(Mutex::new(HashMap::new()));
        let subscribers: Subscribers = Arc::new(Mutex::new(HashMap::new()));

        // Handle outgoing frames
        tokio::spawn(async move {
            while let Some(frame) = outgoing_rx.recv().await {
                let json = match serde_json::to_string(&frame) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("dropping unserializable signaling frame: {}", e);
                        continue;
                    }
                };
                if write.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
        });

        // Handle incoming frames
        let pending_in = pending.clone();
        let subscribers_in = subscribers.clone();
        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                match serde_json::from_str::<ServerFrame>(&text) {
                    Ok(frame) => dispatch(frame, &pending_in, &subscribers_in),
                    Err(e) => warn!("ignoring malformed signaling frame: {}", e),
                }
            }
            debug!("signaling connection closed");
            // Waiters see a closed channel; listeners stop receiving.
            lock(&pending_in).clear();
            lock(&subscribers_in).clear();
        });

        Ok(Self::from_parts(outgoing_tx, pending, subscribers))
    }

    fn from_parts(
        outgoing: mpsc::Sender<ClientFrame>,
        pending: PendingReplies,
        subscribers: Subscribers,
    ) -> Self {
        Self {
            outgoing,
            pending,
            subscribers,
            next_id: AtomicU64::new(1),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Replaces the reply deadline for every store operation.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    async fn request(&self, op: StoreOp) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        lock(&self.pending).insert(id, reply_tx);

        if let Err(e) = self.outgoing.send(ClientFrame { id, op }).await {
            lock(&self.pending).remove(&id);
            return Err(Error::Signaling(format!("Failed to send request: {}", e)));
        }

        match timeout(self.request_timeout, reply_rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(message))) => Err(Error::Signaling(message)),
            Ok(Err(_)) => Err(Error::Signaling("connection closed before reply".into())),
            Err(_) => {
                lock(&self.pending).remove(&id);
                Err(Error::Signaling(format!(
                    "no reply to request {} within {:?}",
                    id, self.request_timeout
                )))
            }
        }
    }

    async fn request_as<T: DeserializeOwned>(&self, op: StoreOp) -> Result<T> {
        let value = self.request(op).await?;
        Ok(serde_json::from_value(value)?)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn dispatch(frame: ServerFrame, pending: &PendingReplies, subscribers: &Subscribers) {
    match frame {
        ServerFrame::Reply { id, value, error } => {
            if let Some(waiter) = lock(pending).remove(&id) {
                let _ = waiter.send(match error {
                    Some(message) => Err(message),
                    None => Ok(value),
                });
            }
        }
        ServerFrame::Event {
            subscription,
            event,
        } => {
            let mut subscribers = lock(subscribers);
            let delivered = subscribers
                .get(&subscription)
                .map(|queue| queue.push(event))
                .unwrap_or(false);
            if !delivered {
                subscribers.remove(&subscription);
            }
        }
    }
}

#[async_trait]
impl SignalingChannel for WsSignaling {
    async fn create_room(&self, room: RoomRecord) -> Result<()> {
        self.request(StoreOp::CreateRoom { room }).await.map(drop)
    }

    async fn get_room(&self, room_id: &str) -> Result<Option<RoomRecord>> {
        self.request_as(StoreOp::GetRoom {
            room_id: room_id.to_owned(),
        })
        .await
    }

    async fn update_room(&self, room: RoomRecord) -> Result<()> {
        self.request(StoreOp::UpdateRoom { room }).await.map(drop)
    }

    async fn put_participant(&self, room_id: &str, record: ParticipantRecord) -> Result<()> {
        self.request(StoreOp::PutParticipant {
            room_id: room_id.to_owned(),
            record,
        })
        .await
        .map(drop)
    }

    async fn get_participant(
        &self,
        room_id: &str,
        id: &ParticipantId,
    ) -> Result<Option<ParticipantRecord>> {
        self.request_as(StoreOp::GetParticipant {
            room_id: room_id.to_owned(),
            id: id.clone(),
        })
        .await
    }

    async fn list_participants(&self, room_id: &str) -> Result<Vec<ParticipantRecord>> {
        self.request_as(StoreOp::ListParticipants {
            room_id: room_id.to_owned(),
        })
        .await
    }

    async fn remove_participant(&self, room_id: &str, id: &ParticipantId) -> Result<()> {
        self.request(StoreOp::RemoveParticipant {
            room_id: room_id.to_owned(),
            id: id.clone(),
        })
        .await
        .map(drop)
    }

    async fn put_call(&self, room_id: &str, record: CallRecord) -> Result<()> {
        self.request(StoreOp::PutCall {
            room_id: room_id.to_owned(),
            record,
        })
        .await
        .map(drop)
    }

    async fn get_call(
        &self,
        room_id: &str,
        from: &ParticipantId,
        to: &ParticipantId,
    ) -> Result<Option<CallRecord>> {
        self.request_as(StoreOp::GetCall {
            room_id: room_id.to_owned(),
            from: from.clone(),
            to: to.clone(),
        })
        .await
    }

    async fn append_candidate(
        &self,
        room_id: &str,
        from: &ParticipantId,
        to: &ParticipantId,
        negotiation_id: u64,
        candidate: IceCandidate,
    ) -> Result<()> {
        self.request(StoreOp::AppendCandidate {
            room_id: room_id.to_owned(),
            from: from.clone(),
            to: to.clone(),
            negotiation_id,
            candidate,
        })
        .await
        .map(drop)
    }

    async fn clear_pair(
        &self,
        room_id: &str,
        from: &ParticipantId,
        to: &ParticipantId,
    ) -> Result<()> {
        self.request(StoreOp::ClearPair {
            room_id: room_id.to_owned(),
            from: from.clone(),
            to: to.clone(),
        })
        .await
        .map(drop)
    }

    async fn subscribe(
        &self,
        room_id: &str,
        topic: Topic,
        queue: EventQueue,
    ) -> Result<Subscription> {
        let subscription = self.next_id.fetch_add(1, Ordering::Relaxed);
        // Register before asking, the relay replays the snapshot right away.
        lock(&self.subscribers).insert(subscription, queue);

        if let Err(e) = self
            .request(StoreOp::Subscribe {
                room_id: room_id.to_owned(),
                topic,
                subscription,
            })
            .await
        {
            lock(&self.subscribers).remove(&subscription);
            return Err(e);
        }

        let subscribers = self.subscribers.clone();
        let outgoing = self.outgoing.clone();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        Ok(Subscription::new(move || {
            lock(&subscribers).remove(&subscription);
            let _ = outgoing.try_send(ClientFrame {
                id,
                op: StoreOp::Unsubscribe { subscription },
            });
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{event_queue, SessionEvent};
    use crate::signaling::RosterChange;
    use crate::room::Role;

    #[test]
    fn client_frame_is_flat_json() {
        let frame = ClientFrame {
            id: 4,
            op: StoreOp::ClearPair {
                room_id: "r".into(),
                from: "1".into(),
                to: "2".into(),
            },
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["id"], 4);
        assert_eq!(json["op"], "clear_pair");
        assert_eq!(json["from"], "1");
    }

    #[test]
    fn server_event_frame_parses() {
        let text = r#"{
            "kind": "event",
            "subscription": 9,
            "event": {"kind": "roster", "data": {"change": "removed", "participant": "3"}}
        }"#;
        let frame: ServerFrame = serde_json::from_str(text).unwrap();
        assert_eq!(
            frame,
            ServerFrame::Event {
                subscription: 9,
                event: SignalingEvent::Roster(RosterChange::Removed("3".into())),
            }
        );
    }

    #[tokio::test]
    async fn replies_and_events_are_routed() {
        let pending: PendingReplies = Arc::new(Mutex::new(HashMap::new()));
        let subscribers: Subscribers = Arc::new(Mutex::new(HashMap::new()));
        let (queue, mut rx) = event_queue();
        lock(&subscribers).insert(2, queue);

        let (reply_tx, reply_rx) = oneshot::channel();
        lock(&pending).insert(1, reply_tx);
        dispatch(
            ServerFrame::Reply {
                id: 1,
                value: Value::Null,
                error: Some("denied".into()),
            },
            &pending,
            &subscribers,
        );
        assert_eq!(reply_rx.await.unwrap(), Err("denied".to_string()));

        let record = ParticipantRecord::new("5".into(), "Eve", Role::Regular);
        dispatch(
            ServerFrame::Event {
                subscription: 2,
                event: SignalingEvent::Roster(RosterChange::Added(record.clone())),
            },
            &pending,
            &subscribers,
        );
        match rx.try_recv().unwrap() {
            SessionEvent::Signaling(SignalingEvent::Roster(RosterChange::Added(got))) => {
                assert_eq!(got, record)
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn silent_relay_times_out() {
        let (outgoing, mut sent) = mpsc::channel(4);
        let pending: PendingReplies = Arc::new(Mutex::new(HashMap::new()));
        let subscribers: Subscribers = Arc::new(Mutex::new(HashMap::new()));
        let signaling = WsSignaling::from_parts(outgoing, pending.clone(), subscribers)
            .with_request_timeout(Duration::from_secs(2));

        let err = signaling
            .remove_participant("r", &"1".into())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Signaling(ref message) if message.contains("no reply")));
        assert!(lock(&pending).is_empty());

        let frame = sent.try_recv().unwrap();
        assert!(matches!(frame.op, StoreOp::RemoveParticipant { .. }));
    }
}
