//! Remote write collaborator: where flushed writes are delivered.
//!
//! Two implementations:
//! - [`WsRemote`] — WebSocket link; one bincode `WriteRequest` per write,
//!   answered by a `WriteResponse` with the same `request_id`.
//! - [`RecordingRemote`] — in-process collaborator that records deliveries
//!   and replays scripted outcomes (offline shells, tests, benchmarks).

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{ProtocolError, WriteOutcome, WriteRequest, WriteResponse};
use crate::storage::{EntityKind, PendingWrite};

/// Accepts one mutation and reports whether it was persisted remotely.
///
/// Anything other than [`WriteOutcome::Acknowledged`] is a rejection.
pub trait RemoteWriter: Send + Sync + 'static {
    fn submit(&self, write: &PendingWrite) -> impl Future<Output = WriteOutcome> + Send;
}

impl<R: RemoteWriter> RemoteWriter for Arc<R> {
    fn submit(&self, write: &PendingWrite) -> impl Future<Output = WriteOutcome> + Send {
        (**self).submit(write)
    }
}

type PendingReplies = Arc<Mutex<HashMap<u64, oneshot::Sender<WriteOutcome>>>>;

/// WebSocket-backed [`RemoteWriter`].
pub struct WsRemote {
    outgoing_tx: mpsc::Sender<Vec<u8>>,
    replies: PendingReplies,
    next_request: AtomicU64,
    connected: Arc<AtomicBool>,
}

impl WsRemote {
    /// Connect to the write endpoint.
    ///
    /// Spawns background tasks for reading/writing WebSocket frames.
    pub async fn connect(url: &str) -> Result<Self, ProtocolError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url).await.map_err(|e| {
            log::warn!("Remote write endpoint {url} unreachable: {e}");
            ProtocolError::ConnectionClosed
        })?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        let replies: PendingReplies = Arc::new(Mutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));

        // Writer task: forward outgoing channel to WebSocket
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader task: route responses to their waiting submitter
        let reader_replies = replies.clone();
        let reader_connected = connected.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => match WriteResponse::decode(&data) {
                        Ok(response) => {
                            let waiter = reader_replies
                                .lock()
                                .ok()
                                .and_then(|mut map| map.remove(&response.request_id));
                            match waiter {
                                Some(tx) => {
                                    let _ = tx.send(response.outcome);
                                }
                                None => log::debug!(
                                    "Dropping response for unknown request {}",
                                    response.request_id
                                ),
                            }
                        }
                        Err(e) => log::warn!("Undecodable write response: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            reader_connected.store(false, Ordering::SeqCst);
            if let Ok(mut map) = reader_replies.lock() {
                for (_, tx) in map.drain() {
                    let _ = tx.send(WriteOutcome::Unreachable("connection closed".into()));
                }
            }
            log::info!("Remote write connection closed");
        });

        Ok(Self {
            outgoing_tx: out_tx,
            replies,
            next_request: AtomicU64::new(1),
            connected,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn round_trip(&self, write: &PendingWrite) -> WriteOutcome {
        if !self.is_connected() {
            return WriteOutcome::Unreachable("connection closed".into());
        }

        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let encoded = match WriteRequest::for_write(request_id, write).encode() {
            Ok(bytes) => bytes,
            Err(e) => return WriteOutcome::Unreachable(e.to_string()),
        };

        let (tx, rx) = oneshot::channel();
        match self.replies.lock() {
            Ok(mut map) => {
                map.insert(request_id, tx);
            }
            Err(_) => return WriteOutcome::Unreachable("reply table poisoned".into()),
        }
        // Frees the slot however this future ends, including a caller timeout
        let _slot = ReplySlot {
            replies: &self.replies,
            request_id,
        };

        // Reader may have drained the table between the check above and the insert
        if !self.is_connected() || self.outgoing_tx.send(encoded).await.is_err() {
            return WriteOutcome::Unreachable("connection closed".into());
        }

        rx.await
            .unwrap_or_else(|_| WriteOutcome::Unreachable("connection closed".into()))
    }

    /// Submissions still waiting for their response.
    pub fn awaiting_replies(&self) -> usize {
        self.replies.lock().map(|map| map.len()).unwrap_or(0)
    }
}

/// Owns one entry of the reply table for the life of a round trip.
struct ReplySlot<'a> {
    replies: &'a PendingReplies,
    request_id: u64,
}

impl Drop for ReplySlot<'_> {
    fn drop(&mut self) {
        if let Ok(mut map) = self.replies.lock() {
            map.remove(&self.request_id);
        }
    }
}

impl RemoteWriter for WsRemote {
    fn submit(&self, write: &PendingWrite) -> impl Future<Output = WriteOutcome> + Send {
        self.round_trip(write)
    }
}

/// One delivery seen by a [`RecordingRemote`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub write_id: u64,
    pub kind: EntityKind,
    pub payload: Vec<u8>,
    pub outcome: WriteOutcome,
}

#[derive(Default)]
struct Recording {
    scripts: HashMap<u64, VecDeque<WriteOutcome>>,
    deliveries: Vec<Delivery>,
}

/// In-process [`RemoteWriter`] that acknowledges by default.
///
/// Outcomes can be scripted per write id; each scripted outcome is used
/// once, after which the write is acknowledged.
#[derive(Default)]
pub struct RecordingRemote {
    recording: Mutex<Recording>,
    delay: Option<Duration>,
    reject_all: AtomicBool,
}

impl RecordingRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every answer (for in-flight flush tests).
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    /// Queue outcomes for the next submissions of `write_id`.
    pub fn script(&self, write_id: u64, outcomes: impl IntoIterator<Item = WriteOutcome>) {
        if let Ok(mut rec) = self.recording.lock() {
            rec.scripts.entry(write_id).or_default().extend(outcomes);
        }
    }

    /// Reject every submission until switched off.
    pub fn set_reject_all(&self, reject: bool) {
        self.reject_all.store(reject, Ordering::SeqCst);
    }

    /// Every submission so far, in arrival order.
    pub fn deliveries(&self) -> Vec<Delivery> {
        self.recording
            .lock()
            .map(|rec| rec.deliveries.clone())
            .unwrap_or_default()
    }

    /// Payloads that were acknowledged, in arrival order.
    pub fn acknowledged_payloads(&self) -> Vec<Vec<u8>> {
        self.deliveries()
            .into_iter()
            .filter(|d| d.outcome.is_acknowledged())
            .map(|d| d.payload)
            .collect()
    }

    fn record(&self, write: &PendingWrite) -> WriteOutcome {
        let Ok(mut rec) = self.recording.lock() else {
            return WriteOutcome::Unreachable("recording poisoned".into());
        };
        let outcome = if self.reject_all.load(Ordering::SeqCst) {
            WriteOutcome::Rejected("rejecting all writes".into())
        } else {
            rec.scripts
                .get_mut(&write.id)
                .and_then(|script| script.pop_front())
                .unwrap_or(WriteOutcome::Acknowledged)
        };
        rec.deliveries.push(Delivery {
            write_id: write.id,
            kind: write.entity_kind,
            payload: write.payload.clone(),
            outcome: outcome.clone(),
        });
        outcome
    }
}

impl RemoteWriter for RecordingRemote {
    fn submit(&self, write: &PendingWrite) -> impl Future<Output = WriteOutcome> + Send {
        let delay = self.delay;
        let outcome = self.record(write);
        async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            outcome
        }
    }
}
