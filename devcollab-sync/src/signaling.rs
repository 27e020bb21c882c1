//! Signaling channel: transport for call-setup messages.
//!
//! ```text
//!  SessionNegotiator ──SignalSender──► outgoing mpsc ──► writer task ──► WebSocket
//!        ▲                                                                   │
//!        └──────────── incoming mpsc ◄── reader task ◄── bincode Signal ◄────┘
//!                     (SignalEvent::Disconnected when the socket ends)
//! ```
//!
//! The negotiator only sees the two mpsc endpoints, so the same code runs
//! over a WebSocket ([`connect_ws`]) or an in-process pair
//! ([`SignalingChannel::in_memory`]).

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::Signal;

const CHANNEL_CAPACITY: usize = 256;

/// Inbound signaling notification.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalEvent {
    Message(Signal),
    /// Transport ended; fatal for every session using this channel
    Disconnected,
}

/// Signaling errors.
#[derive(Debug, Clone)]
pub enum SignalingError {
    ConnectFailed(String),
    Closed,
}

impl std::fmt::Display for SignalingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalingError::ConnectFailed(e) => write!(f, "Signaling connect failed: {e}"),
            SignalingError::Closed => write!(f, "Signaling channel closed"),
        }
    }
}

impl std::error::Error for SignalingError {}

/// Cloneable send half.
#[derive(Debug, Clone)]
pub struct SignalSender {
    tx: mpsc::Sender<Signal>,
}

impl SignalSender {
    pub async fn send(&self, signal: Signal) -> Result<(), SignalingError> {
        log::trace!("→ {} ({})", signal.label(), signal.session_id());
        self.tx.send(signal).await.map_err(|_| SignalingError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Both halves of a signaling connection.
#[derive(Debug)]
pub struct SignalingChannel {
    outgoing: SignalSender,
    incoming: mpsc::Receiver<SignalEvent>,
}

impl SignalingChannel {
    /// In-process channel plus the far end that plays the signaling server.
    pub fn in_memory() -> (SignalingChannel, SignalingPeer) {
        let (out_tx, out_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel(CHANNEL_CAPACITY);
        (
            SignalingChannel {
                outgoing: SignalSender { tx: out_tx },
                incoming: in_rx,
            },
            SignalingPeer {
                sent: out_rx,
                deliver: in_tx,
            },
        )
    }

    pub fn sender(&self) -> SignalSender {
        self.outgoing.clone()
    }

    pub fn split(self) -> (SignalSender, mpsc::Receiver<SignalEvent>) {
        (self.outgoing, self.incoming)
    }
}

/// Far end of an in-memory channel.
#[derive(Debug)]
pub struct SignalingPeer {
    /// Signals the local side sent
    pub sent: mpsc::Receiver<Signal>,
    /// Inject inbound events
    pub deliver: mpsc::Sender<SignalEvent>,
}

impl SignalingPeer {
    /// Next signal sent by the local side, if any is already queued.
    pub fn try_next_sent(&mut self) -> Option<Signal> {
        self.sent.try_recv().ok()
    }

    /// Drain every signal sent so far.
    pub fn drain_sent(&mut self) -> Vec<Signal> {
        let mut out = Vec::new();
        while let Ok(signal) = self.sent.try_recv() {
            out.push(signal);
        }
        out
    }

    pub async fn deliver(&self, signal: Signal) -> Result<(), SignalingError> {
        self.deliver
            .send(SignalEvent::Message(signal))
            .await
            .map_err(|_| SignalingError::Closed)
    }

    pub async fn disconnect(&self) -> Result<(), SignalingError> {
        self.deliver
            .send(SignalEvent::Disconnected)
            .await
            .map_err(|_| SignalingError::Closed)
    }
}

/// Open a WebSocket signaling connection.
///
/// Spawns background tasks for reading/writing frames; the returned
/// channel reports `Disconnected` once when the socket closes.
pub async fn connect_ws(url: &str) -> Result<SignalingChannel, SignalingError> {
    let (ws_stream, _) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| SignalingError::ConnectFailed(e.to_string()))?;
    let (mut ws_writer, mut ws_reader) = ws_stream.split();

    let (out_tx, mut out_rx) = mpsc::channel::<Signal>(CHANNEL_CAPACITY);
    let (in_tx, in_rx) = mpsc::channel::<SignalEvent>(CHANNEL_CAPACITY);

    // Writer task: forward outgoing signals to the socket
    tokio::spawn(async move {
        while let Some(signal) = out_rx.recv().await {
            let encoded = match signal.encode() {
                Ok(bytes) => bytes,
                Err(e) => {
                    log::error!("Dropping unencodable {} signal: {e}", signal.label());
                    continue;
                }
            };
            if ws_writer.send(Message::Binary(encoded.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_writer.close().await;
    });

    // Reader task: decode inbound frames
    let url_owned = url.to_string();
    tokio::spawn(async move {
        while let Some(msg) = ws_reader.next().await {
            match msg {
                Ok(Message::Binary(data)) => match Signal::decode(&data) {
                    Ok(signal) => {
                        log::trace!("← {} ({})", signal.label(), signal.session_id());
                        if in_tx.send(SignalEvent::Message(signal)).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => log::warn!("Undecodable signaling frame: {e}"),
                },
                Ok(Message::Close(_)) | Err(_) => break,
                _ => {}
            }
        }

        log::warn!("Signaling connection to {url_owned} lost");
        let _ = in_tx.send(SignalEvent::Disconnected).await;
    });

    log::info!("Signaling connected to {url}");
    Ok(SignalingChannel {
        outgoing: SignalSender { tx: out_tx },
        incoming: in_rx,
    })
}
