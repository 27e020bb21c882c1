//! Binary wire protocol for call signaling and remote write delivery.
//!
//! Wire format (bincode-encoded, serde mode, standard config):
//! ```text
//! Signal frame
//! ┌──────────┬────────────┬──────────┬──────────────────────────┐
//! │ variant  │ session_id │ from     │ variant body             │
//! │ varint   │ 16 bytes   │ string   │ to / description / cand. │
//! └──────────┴────────────┴──────────┴──────────────────────────┘
//!
//! Handshake between two negotiators
//!   caller ── CallStart(desc) ──► callee      callee admits caller
//!   caller ◄──── Offer(desc) ──── callee      caller admits callee
//!   caller ───── Offer(desc) ───► callee      crossed offer: callee Connected
//!   caller ◄──── Answer(desc) ─── callee      caller Connected
//!
//! Write frames (remote collaborator link)
//! WriteRequest  { request_id, write_id, kind, author, payload }
//! WriteResponse { request_id, outcome }
//! ```
//!
//! One WebSocket binary message carries exactly one frame.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::storage::{EntityKind, PendingWrite};

/// Media track category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaKind {
    Audio,
    Video,
}

/// One codec configuration a participant can send or receive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MediaFormat {
    pub kind: MediaKind,
    /// Codec name, compared case-insensitively (e.g. "opus", "VP8")
    pub codec: String,
    /// RTP clock rate in Hz
    pub clock_rate: u32,
}

impl MediaFormat {
    pub fn new(kind: MediaKind, codec: impl Into<String>, clock_rate: u32) -> Self {
        Self {
            kind,
            codec: codec.into(),
            clock_rate,
        }
    }

    pub fn opus() -> Self {
        Self::new(MediaKind::Audio, "opus", 48_000)
    }

    pub fn vp8() -> Self {
        Self::new(MediaKind::Video, "VP8", 90_000)
    }

    pub fn h264() -> Self {
        Self::new(MediaKind::Video, "H264", 90_000)
    }

    /// Whether two formats describe the same codec configuration.
    pub fn matches(&self, other: &MediaFormat) -> bool {
        self.kind == other.kind
            && self.clock_rate == other.clock_rate
            && self.codec.eq_ignore_ascii_case(&other.codec)
    }
}

/// Offer or answer body: the formats a side is willing to use.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SessionDescription {
    pub formats: Vec<MediaFormat>,
}

impl SessionDescription {
    pub fn new(formats: Vec<MediaFormat>) -> Self {
        Self { formats }
    }

    /// Structural validity: at least one format, no blank codec, no zero clock rate.
    pub fn validate(&self) -> Result<(), String> {
        if self.formats.is_empty() {
            return Err("description lists no media formats".into());
        }
        for format in &self.formats {
            if format.codec.trim().is_empty() {
                return Err(format!("blank codec for {:?} format", format.kind));
            }
            if format.clock_rate == 0 {
                return Err(format!("zero clock rate for codec {}", format.codec));
            }
        }
        Ok(())
    }

    /// Formats present in both descriptions, in `self` order.
    pub fn intersect(&self, formats: &[MediaFormat]) -> Vec<MediaFormat> {
        self.formats
            .iter()
            .filter(|f| formats.iter().any(|other| other.matches(f)))
            .cloned()
            .collect()
    }
}

/// Network reachability candidate exchanged during negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkCandidate {
    pub address: String,
    pub port: u16,
    pub priority: u32,
}

impl NetworkCandidate {
    pub fn new(address: impl Into<String>, port: u16, priority: u32) -> Self {
        Self {
            address: address.into(),
            port,
            priority,
        }
    }
}

/// Call signaling message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Signal {
    /// Caller announces a new call to its target, with its capabilities
    CallStart {
        session_id: Uuid,
        from: String,
        target: String,
        description: SessionDescription,
    },
    /// Local description sent to one peer
    Offer {
        session_id: Uuid,
        from: String,
        to: String,
        description: SessionDescription,
    },
    /// Answer completing a handshake
    Answer {
        session_id: Uuid,
        from: String,
        to: String,
        description: SessionDescription,
    },
    /// Network candidate for one peer
    Candidate {
        session_id: Uuid,
        from: String,
        to: String,
        candidate: NetworkCandidate,
    },
    /// `to: Some(peer)` stops routing for that peer, `None` ends the call
    Hangup {
        session_id: Uuid,
        from: String,
        to: Option<String>,
    },
}

impl Signal {
    pub fn session_id(&self) -> Uuid {
        match self {
            Signal::CallStart { session_id, .. }
            | Signal::Offer { session_id, .. }
            | Signal::Answer { session_id, .. }
            | Signal::Candidate { session_id, .. }
            | Signal::Hangup { session_id, .. } => *session_id,
        }
    }

    pub fn from(&self) -> &str {
        match self {
            Signal::CallStart { from, .. }
            | Signal::Offer { from, .. }
            | Signal::Answer { from, .. }
            | Signal::Candidate { from, .. }
            | Signal::Hangup { from, .. } => from,
        }
    }

    /// Short name for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Signal::CallStart { .. } => "call-start",
            Signal::Offer { .. } => "offer",
            Signal::Answer { .. } => "answer",
            Signal::Candidate { .. } => "candidate",
            Signal::Hangup { .. } => "hangup",
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_frame(self)
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_frame(bytes)
    }
}

/// Outcome reported by the remote write collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteOutcome {
    Acknowledged,
    Rejected(String),
    /// No usable answer (timeout, transport failure)
    Unreachable(String),
}

impl WriteOutcome {
    pub fn is_acknowledged(&self) -> bool {
        matches!(self, WriteOutcome::Acknowledged)
    }
}

/// One pending write shipped to the remote collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteRequest {
    pub request_id: u64,
    pub write_id: u64,
    pub kind: EntityKind,
    pub author: String,
    pub payload: Vec<u8>,
}

impl WriteRequest {
    pub fn for_write(request_id: u64, write: &PendingWrite) -> Self {
        Self {
            request_id,
            write_id: write.id,
            kind: write.entity_kind,
            author: write.author.clone(),
            payload: write.payload.clone(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_frame(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_frame(bytes)
    }
}

/// Reply to a [`WriteRequest`], matched by `request_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteResponse {
    pub request_id: u64,
    pub outcome: WriteOutcome,
}

impl WriteResponse {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_frame(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_frame(bytes)
    }
}

fn encode_frame<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

fn decode_frame<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    Ok(value)
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}
