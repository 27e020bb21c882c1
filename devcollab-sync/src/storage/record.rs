//! Pending-write records and their checksummed on-disk encoding.
//!
//! Record layout (bincode, serde mode):
//! ```text
//! ┌──────┬──────┬────────┬────────────┬──────────┬──────────────────┬──────────┐
//! │ id   │ kind │ author │ created_at │ attempts │ payload (LZ4)    │ checksum │
//! │ u64  │ u8   │ string │ u64 ms     │ u32      │ size-prepended   │ u32 FNV  │
//! └──────┴──────┴────────┴────────────┴──────────┴──────────────────┴──────────┘
//! ```
//!
//! Store key: `<kind tag:1 byte><id:8 bytes big-endian>`, so a forward scan
//! from `<tag><0>` yields one kind's writes in enqueue order.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;

use super::StoreError;

/// Entity a buffered mutation applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum EntityKind {
    /// Chat message
    Message = 1,
    /// Project create/update
    ProjectEdit = 2,
    /// Document create/update
    DocumentEdit = 3,
}

impl EntityKind {
    pub const ALL: [EntityKind; 3] = [
        EntityKind::Message,
        EntityKind::ProjectEdit,
        EntityKind::DocumentEdit,
    ];

    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(EntityKind::Message),
            2 => Some(EntityKind::ProjectEdit),
            3 => Some(EntityKind::DocumentEdit),
            _ => None,
        }
    }

    /// Dense index for per-kind arrays.
    pub fn index(self) -> usize {
        self as usize - 1
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Message => "message",
            EntityKind::ProjectEdit => "project-edit",
            EntityKind::DocumentEdit => "document-edit",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "message" | "msg" => Ok(EntityKind::Message),
            "project-edit" | "project" => Ok(EntityKind::ProjectEdit),
            "document-edit" | "document" | "doc" => Ok(EntityKind::DocumentEdit),
            other => Err(format!("unknown entity kind '{other}'")),
        }
    }
}

/// One buffered mutation awaiting remote acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingWrite {
    /// Queue sequence number, unique across kinds and restarts
    pub id: u64,
    pub entity_kind: EntityKind,
    /// Local participant that made the mutation
    pub author: String,
    /// Opaque serialized mutation body
    pub payload: Vec<u8>,
    /// Milliseconds since the Unix epoch
    pub created_at: u64,
    /// Failed flush attempts so far
    pub attempts: u32,
}

impl PendingWrite {
    pub fn new(id: u64, entity_kind: EntityKind, author: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            id,
            entity_kind,
            author: author.into(),
            payload,
            created_at: now_millis(),
            attempts: 0,
        }
    }

    /// Store key for this write.
    pub fn key(&self) -> [u8; 9] {
        record_key(self.entity_kind, self.id)
    }
}

/// Build a record key: kind tag (1 byte) + id (8 bytes big-endian).
pub fn record_key(kind: EntityKind, id: u64) -> [u8; 9] {
    let mut key = [0u8; 9];
    key[0] = kind.tag();
    key[1..].copy_from_slice(&id.to_be_bytes());
    key
}

/// Split a record key back into kind and id.
pub fn parse_key(key: &[u8]) -> Option<(EntityKind, u64)> {
    if key.len() != 9 {
        return None;
    }
    let kind = EntityKind::from_tag(key[0])?;
    let mut id_buf = [0u8; 8];
    id_buf.copy_from_slice(&key[1..]);
    Some((kind, u64::from_be_bytes(id_buf)))
}

#[derive(Serialize, Deserialize)]
struct StoredWrite {
    id: u64,
    kind: EntityKind,
    author: String,
    created_at: u64,
    attempts: u32,
    compressed: Vec<u8>,
    checksum: u32,
}

impl StoredWrite {
    fn compute_checksum(&self) -> u32 {
        let mut hash: u32 = 0x811c_9dc5; // FNV offset basis
        let mut mix = |bytes: &[u8]| {
            for byte in bytes {
                hash ^= *byte as u32;
                hash = hash.wrapping_mul(0x0100_0193); // FNV prime
            }
        };
        mix(&self.id.to_le_bytes());
        mix(&[self.kind.tag()]);
        mix(self.author.as_bytes());
        mix(&self.created_at.to_le_bytes());
        mix(&self.attempts.to_le_bytes());
        mix(&self.compressed);
        hash
    }
}

/// Serialize a write into a checksummed record.
pub fn encode_record(write: &PendingWrite) -> Result<Vec<u8>, StoreError> {
    let mut stored = StoredWrite {
        id: write.id,
        kind: write.entity_kind,
        author: write.author.clone(),
        created_at: write.created_at,
        attempts: write.attempts,
        compressed: lz4_flex::compress_prepend_size(&write.payload),
        checksum: 0,
    };
    stored.checksum = stored.compute_checksum();
    bincode::serde::encode_to_vec(&stored, bincode::config::standard())
        .map_err(|e| StoreError::SerializationError(e.to_string()))
}

/// Decode and verify a record.
pub fn decode_record(bytes: &[u8]) -> Result<PendingWrite, StoreError> {
    let (stored, _): (StoredWrite, _) =
        bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
    if stored.checksum != stored.compute_checksum() {
        return Err(StoreError::ChecksumMismatch { id: stored.id });
    }
    let payload = lz4_flex::decompress_size_prepended(&stored.compressed)
        .map_err(|e| StoreError::CompressionError(e.to_string()))?;
    Ok(PendingWrite {
        id: stored.id,
        entity_kind: stored.kind,
        author: stored.author,
        payload,
        created_at: stored.created_at,
        attempts: stored.attempts,
    })
}

/// Decode a batch of records, skipping corrupted ones.
///
/// Returns valid writes sorted by id and the number skipped.
pub fn recover_records(serialized: &[Vec<u8>]) -> (Vec<PendingWrite>, usize) {
    let mut valid = Vec::with_capacity(serialized.len());
    let mut corrupted = 0;

    for bytes in serialized {
        match decode_record(bytes) {
            Ok(write) => valid.push(write),
            Err(e) => {
                log::warn!("Skipping unreadable pending-write record: {e}");
                corrupted += 1;
            }
        }
    }

    valid.sort_by_key(|w| w.id);
    (valid, corrupted)
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
