//! Durable storage for the offline write queue.
//!
//! Architecture:
//! ```text
//! ┌───────────────────┐  append / remove   ┌──────────────────────────────┐
//! │ OfflineWriteQueue │ ─────────────────► │ dyn DurableStore             │
//! │ (per-kind FIFO)   │ ◄───────────────── │                              │
//! └───────────────────┘  pending(kind)     │  RocksStore                  │
//!                                          │   CF "pending"     FIFO/kind │
//!                                          │   CF "dead_letter" quarantine│
//!                                          │   CF "meta"        sequence  │
//!                                          │  MemoryStore (tests, embed)  │
//!                                          └──────────────────────────────┘
//! ```
//!
//! A write acknowledged by `append` must survive a restart: `RocksStore`
//! syncs every batch unless configured otherwise.

pub mod memory;
pub mod record;
pub mod rocks;

pub use memory::MemoryStore;
pub use record::{EntityKind, PendingWrite};
pub use rocks::{RocksStore, StoreConfig};

/// Record store backing the offline write queue.
///
/// Implementations must be crash-consistent for every method that returns
/// `Ok`, and `pending` must return one kind's writes in insertion order.
pub trait DurableStore: Send + Sync {
    /// Append a new write to the pending set.
    fn append(&self, write: &PendingWrite) -> Result<(), StoreError>;

    /// Rewrite a pending write after its `attempts` changed.
    fn update(&self, write: &PendingWrite) -> Result<(), StoreError>;

    /// Delete an acknowledged write.
    fn remove(&self, kind: EntityKind, id: u64) -> Result<(), StoreError>;

    /// Pending writes of one kind, oldest first.
    fn pending(&self, kind: EntityKind) -> Result<Vec<PendingWrite>, StoreError>;

    /// Atomically move a pending write into the dead-letter set.
    fn quarantine(&self, write: &PendingWrite) -> Result<(), StoreError>;

    /// All dead-lettered writes, ordered by kind then id.
    fn dead_letters(&self) -> Result<Vec<PendingWrite>, StoreError>;

    /// Delete a dead-lettered write, returning it if it existed.
    fn remove_dead_letter(&self, kind: EntityKind, id: u64) -> Result<Option<PendingWrite>, StoreError>;

    /// Atomically replace dead-lettered `dead` with pending `fresh`.
    fn requeue(&self, dead: &PendingWrite, fresh: &PendingWrite) -> Result<(), StoreError>;

    /// Highest id ever appended, if any.
    fn last_sequence(&self) -> Result<Option<u64>, StoreError>;
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    /// Record not found
    NotFound { kind: EntityKind, id: u64 },
    /// Serialization failed
    SerializationError(String),
    /// Deserialization failed
    DeserializationError(String),
    /// Compression error
    CompressionError(String),
    /// Record checksum did not verify
    ChecksumMismatch { id: u64 },
    /// Store refused the write (full disk, injected failure)
    Unavailable(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::NotFound { kind, id } => write!(f, "Pending write not found: {kind} #{id}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
            StoreError::ChecksumMismatch { id } => write!(f, "Checksum mismatch for record #{id}"),
            StoreError::Unavailable(e) => write!(f, "Store unavailable: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}
