//! Local media capture and inbound media handles.
//!
//! [`LocalMedia`] is the exclusively owned capture handle of one call
//! session. Dropping it releases the devices, so every exit path of a
//! session (hangup, signaling loss, panic unwinding) frees the camera and
//! microphone.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::protocol::{MediaFormat, MediaKind};

/// Which tracks to capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

impl MediaConstraints {
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }

    pub fn wants(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Audio => self.audio,
            MediaKind::Video => self.video,
        }
    }
}

/// Capture failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// Device is held by another application or session
    DeviceBusy(String),
    /// User or platform refused access
    PermissionDenied,
    /// No device offers the requested tracks
    NoDevice(MediaKind),
}

impl std::fmt::Display for MediaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaError::DeviceBusy(name) => write!(f, "Media device busy: {name}"),
            MediaError::PermissionDenied => write!(f, "Media permission denied"),
            MediaError::NoDevice(kind) => write!(f, "No {kind:?} capture device"),
        }
    }
}

impl std::error::Error for MediaError {}

/// Host capability that opens capture devices.
pub trait MediaDevices: Send + Sync {
    fn open(&self, constraints: &MediaConstraints) -> Result<LocalMedia, MediaError>;
}

/// Exclusively owned local capture handle.
///
/// Not `Clone`: a capture belongs to exactly one session.
pub struct LocalMedia {
    stream_id: Uuid,
    formats: Vec<MediaFormat>,
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl LocalMedia {
    /// Wrap an opened capture; `release` runs exactly once, on drop.
    pub fn new(formats: Vec<MediaFormat>, release: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            stream_id: Uuid::new_v4(),
            formats,
            release: Some(Box::new(release)),
        }
    }

    pub fn stream_id(&self) -> Uuid {
        self.stream_id
    }

    /// Formats this capture can encode to.
    pub fn formats(&self) -> &[MediaFormat] {
        &self.formats
    }
}

impl Drop for LocalMedia {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            log::debug!("Releasing local media {}", self.stream_id);
            release();
        }
    }
}

impl std::fmt::Debug for LocalMedia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMedia")
            .field("stream_id", &self.stream_id)
            .field("formats", &self.formats)
            .finish()
    }
}

/// Inbound media of one connected peer, shared with renderers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMedia {
    pub stream_id: Uuid,
    pub peer_id: String,
    pub formats: Vec<MediaFormat>,
}

impl RemoteMedia {
    pub fn new(peer_id: impl Into<String>, formats: Vec<MediaFormat>) -> Arc<Self> {
        Arc::new(Self {
            stream_id: Uuid::new_v4(),
            peer_id: peer_id.into(),
            formats,
        })
    }
}

/// Fixed device set with a single exclusive capture slot.
///
/// Serves headless hosts and tests: a second `open` while a capture is
/// live fails with `DeviceBusy`, and `open_count` tracks live captures.
pub struct StaticDevices {
    name: String,
    formats: Vec<MediaFormat>,
    permission_granted: AtomicBool,
    open: Arc<AtomicUsize>,
}

impl StaticDevices {
    pub fn new(name: impl Into<String>, formats: Vec<MediaFormat>) -> Self {
        Self {
            name: name.into(),
            formats,
            permission_granted: AtomicBool::new(true),
            open: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Opus audio plus VP8 and H264 video.
    pub fn default_camera() -> Self {
        Self::new(
            "default camera",
            vec![MediaFormat::opus(), MediaFormat::vp8(), MediaFormat::h264()],
        )
    }

    pub fn set_permission(&self, granted: bool) {
        self.permission_granted.store(granted, Ordering::SeqCst);
    }

    /// Captures currently held.
    pub fn open_count(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }
}

impl MediaDevices for StaticDevices {
    fn open(&self, constraints: &MediaConstraints) -> Result<LocalMedia, MediaError> {
        if !self.permission_granted.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied);
        }

        for kind in [MediaKind::Audio, MediaKind::Video] {
            if constraints.wants(kind) && !self.formats.iter().any(|f| f.kind == kind) {
                return Err(MediaError::NoDevice(kind));
            }
        }

        if self
            .open
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(MediaError::DeviceBusy(self.name.clone()));
        }

        let formats = self
            .formats
            .iter()
            .filter(|f| constraints.wants(f.kind))
            .cloned()
            .collect();
        let open = self.open.clone();
        Ok(LocalMedia::new(formats, move || {
            open.fetch_sub(1, Ordering::SeqCst);
        }))
    }
}
