//! # devcollab-sync — Call negotiation and offline sync for DevCollab
//!
//! Two independent kernels of the collaboration client: peer-call session
//! negotiation over a signaling channel, and a durable queue that buffers
//! writes while offline and flushes them when connectivity returns.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────┐  Signal frames   ┌──────────────────┐
//! │ SessionNegotiator │ ◄──────────────► │ SignalingChannel │ ◄──► WebSocket
//! │ (per host)        │                  │ (mpsc pair)      │
//! └────────┬──────────┘                  └──────────────────┘
//!          │ &mut
//!          ▼
//! ┌───────────────────┐      ┌───────────┐
//! │ CallSession       │ ───► │ LocalMedia│  (released on drop)
//! │ participants: map │      └───────────┘
//! │ PeerLink state    │
//! └───────────────────┘
//!
//! ┌───────────────────┐ append/remove ┌──────────────┐
//! │ OfflineWriteQueue │ ────────────► │ DurableStore │  RocksDB / memory
//! │ per-kind locks    │               └──────────────┘
//! └────────┬──────────┘
//!          │ submit (FIFO per kind)        ▲ offline → online
//!          ▼                               │
//! ┌───────────────────┐            ┌───────┴──────┐
//! │ RemoteWriter      │            │ Connectivity │
//! └───────────────────┘            └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire protocol (bincode-encoded Signal, write frames)
//! - [`signaling`] — Signaling channel over WebSocket or in-process
//! - [`media`] — Local capture handle and remote media
//! - [`session`] — Session negotiator and peer link state machine
//! - [`storage`] — Durable pending/dead-letter store
//! - [`connectivity`] — Online/offline watch
//! - [`remote`] — Remote write collaborator
//! - [`queue`] — Offline write queue with auto-flush
//! - [`context`] — Application context (identity)

pub mod connectivity;
pub mod context;
pub mod media;
pub mod protocol;
pub mod queue;
pub mod remote;
pub mod session;
pub mod signaling;
pub mod storage;

// Re-exports for convenience
pub use connectivity::{Connectivity, ConnectivityState, ConnectivityWatch};
pub use context::{AppContext, Identity};
pub use media::{
    LocalMedia, MediaConstraints, MediaDevices, MediaError, RemoteMedia, StaticDevices,
};
pub use protocol::{
    MediaFormat, MediaKind, NetworkCandidate, ProtocolError, SessionDescription, Signal,
    WriteOutcome, WriteRequest, WriteResponse,
};
pub use queue::{FlushReport, OfflineWriteQueue, QueueConfig, QueueError};
pub use remote::{Delivery, RecordingRemote, RemoteWriter, WsRemote};
pub use session::{
    CallSession, LinkState, NegotiatorConfig, PeerId, PeerLink, SessionError, SessionEvent,
    SessionNegotiator, SessionStatus, SharedSession,
};
pub use signaling::{
    connect_ws, SignalEvent, SignalSender, SignalingChannel, SignalingError, SignalingPeer,
};
pub use storage::{
    DurableStore, EntityKind, MemoryStore, PendingWrite, RocksStore, StoreConfig, StoreError,
};
