//! Session negotiator: media links for one peer call.
//!
//! ```text
//!                 admit_peer
//!   (none) ─────────────────────► Connecting ──apply_remote_answer──► Connected
//!                                  │      │                             │
//!              timeout / bad answer│      │hangup                 hangup│
//!                                  ▼      ▼                             ▼
//!                               Failed   Closed ◄───────────────────────┘
//! ```
//!
//! Failed and Closed are terminal; the link leaves `participants` as it
//! enters them. Per-peer failures never end the session. Losing the
//! signaling channel does: every link fails, local media is released and a
//! single `SessionFailed` notice names the failed peers.
//!
//! Sessions are plain values mutated through `&mut CallSession`; hosts that
//! share one across tasks wrap it in [`SharedSession`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::context::AppContext;
use crate::media::{LocalMedia, MediaConstraints, MediaDevices, MediaError, RemoteMedia};
use crate::protocol::{MediaFormat, NetworkCandidate, SessionDescription, Signal};
use crate::signaling::{SignalEvent, SignalSender};

pub type PeerId = String;

/// Session shared between a driver task and a controlling host.
pub type SharedSession = Arc<tokio::sync::Mutex<CallSession>>;

/// Negotiator tuning.
#[derive(Debug, Clone)]
pub struct NegotiatorConfig {
    /// How long a link may stay Connecting before it is failed
    pub negotiation_timeout_ms: u64,
    /// Period of the expiry sweep in [`SessionNegotiator::drive`]
    pub sweep_interval_ms: u64,
}

impl Default for NegotiatorConfig {
    fn default() -> Self {
        Self {
            negotiation_timeout_ms: 30_000,
            sweep_interval_ms: 1_000,
        }
    }
}

impl NegotiatorConfig {
    /// Short timeouts for tests.
    pub fn for_testing() -> Self {
        Self {
            negotiation_timeout_ms: 150,
            sweep_interval_ms: 20,
        }
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }
}

// ─── Link & session state ────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// No live link yet (or every link failed)
    Waiting,
    /// At least one link Connecting or Connected
    Active,
    Ended,
    Failed,
}

#[derive(Debug, Clone)]
pub enum LinkState {
    Connecting {
        since: Instant,
        local_description: SessionDescription,
        remote_candidates: Vec<NetworkCandidate>,
    },
    Connected {
        remote_media: Arc<RemoteMedia>,
        remote_candidates: Vec<NetworkCandidate>,
    },
    Failed {
        reason: String,
    },
    Closed,
}

impl LinkState {
    pub fn name(&self) -> &'static str {
        match self {
            LinkState::Connecting { .. } => "connecting",
            LinkState::Connected { .. } => "connected",
            LinkState::Failed { .. } => "failed",
            LinkState::Closed => "closed",
        }
    }
}

/// One negotiated connection to one remote participant.
#[derive(Debug, Clone)]
pub struct PeerLink {
    link_id: Uuid,
    peer_id: PeerId,
    negotiated: Vec<MediaFormat>,
    state: LinkState,
}

impl PeerLink {
    fn connecting(peer_id: &str, negotiated: Vec<MediaFormat>) -> Self {
        Self {
            link_id: Uuid::new_v4(),
            peer_id: peer_id.to_string(),
            state: LinkState::Connecting {
                since: Instant::now(),
                local_description: SessionDescription::new(negotiated.clone()),
                remote_candidates: Vec::new(),
            },
            negotiated,
        }
    }

    pub fn link_id(&self) -> Uuid {
        self.link_id
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn state(&self) -> &LinkState {
        &self.state
    }

    /// Formats both sides agreed on when the peer was admitted.
    pub fn negotiated_formats(&self) -> &[MediaFormat] {
        &self.negotiated
    }

    pub fn is_live(&self) -> bool {
        matches!(
            self.state,
            LinkState::Connecting { .. } | LinkState::Connected { .. }
        )
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, LinkState::Connected { .. })
    }

    pub fn remote_media(&self) -> Option<Arc<RemoteMedia>> {
        match &self.state {
            LinkState::Connected { remote_media, .. } => Some(remote_media.clone()),
            _ => None,
        }
    }

    pub fn remote_candidates(&self) -> &[NetworkCandidate] {
        match &self.state {
            LinkState::Connecting {
                remote_candidates, ..
            }
            | LinkState::Connected {
                remote_candidates, ..
            } => remote_candidates,
            _ => &[],
        }
    }
}

/// Observable session notices.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    PeerConnecting {
        session_id: Uuid,
        peer_id: PeerId,
    },
    PeerConnected {
        session_id: Uuid,
        peer_id: PeerId,
        remote_media: Arc<RemoteMedia>,
    },
    PeerFailed {
        session_id: Uuid,
        peer_id: PeerId,
        reason: String,
    },
    PeerClosed {
        session_id: Uuid,
        peer_id: PeerId,
    },
    SessionEnded {
        session_id: Uuid,
    },
    /// Aggregate notice for a session-fatal failure
    SessionFailed {
        session_id: Uuid,
        failed_peers: Vec<PeerId>,
    },
}

/// One active call.
pub struct CallSession {
    session_id: Uuid,
    local_id: String,
    /// Remote party named at call setup; a full hangup from it ends the call
    target: String,
    local_media: Option<LocalMedia>,
    participants: HashMap<PeerId, PeerLink>,
    /// Peers whose negotiation was declared expired
    expired: HashSet<PeerId>,
    /// Peers admitted at some point whose link has since been removed
    departed: HashSet<PeerId>,
    status: SessionStatus,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
    event_rx: Option<mpsc::UnboundedReceiver<SessionEvent>>,
}

impl CallSession {
    fn new(session_id: Uuid, local_id: &str, target: &str, media: LocalMedia) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            session_id,
            local_id: local_id.to_string(),
            target: target.to_string(),
            local_media: Some(media),
            participants: HashMap::new(),
            expired: HashSet::new(),
            departed: HashSet::new(),
            status: SessionStatus::Waiting,
            event_tx,
            event_rx: Some(event_rx),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// Ended or Failed.
    pub fn is_over(&self) -> bool {
        matches!(self.status, SessionStatus::Ended | SessionStatus::Failed)
    }

    pub fn participants(&self) -> &HashMap<PeerId, PeerLink> {
        &self.participants
    }

    pub fn participant(&self, peer_id: &str) -> Option<&PeerLink> {
        self.participants.get(peer_id)
    }

    pub fn local_media(&self) -> Option<&LocalMedia> {
        self.local_media.as_ref()
    }

    pub fn has_local_media(&self) -> bool {
        self.local_media.is_some()
    }

    /// Take the notice receiver (only once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.event_rx.take()
    }

    pub fn into_shared(self) -> SharedSession {
        Arc::new(tokio::sync::Mutex::new(self))
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.event_tx.send(event);
    }

    fn refresh_status(&mut self) {
        if self.is_over() {
            return;
        }
        self.status = if self.participants.values().any(PeerLink::is_live) {
            SessionStatus::Active
        } else {
            SessionStatus::Waiting
        };
    }
}

impl std::fmt::Debug for CallSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSession")
            .field("session_id", &self.session_id)
            .field("target", &self.target)
            .field("status", &self.status)
            .field("participants", &self.participants.len())
            .field("local_media", &self.local_media.is_some())
            .finish()
    }
}

// ─── Errors ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    MediaUnavailable(MediaError),
    /// No format in common with the peer
    IncompatibleMedia(PeerId),
    MalformedDescription(String),
    UnknownPeer(PeerId),
    NegotiationExpired(PeerId),
    SignalingLost,
    SessionClosed,
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MediaUnavailable(e) => write!(f, "Media unavailable: {e}"),
            Self::IncompatibleMedia(peer) => write!(f, "No common media format with {peer}"),
            Self::MalformedDescription(e) => write!(f, "Malformed session description: {e}"),
            Self::UnknownPeer(peer) => write!(f, "Unknown peer: {peer}"),
            Self::NegotiationExpired(peer) => write!(f, "Negotiation with {peer} expired"),
            Self::SignalingLost => write!(f, "Signaling channel lost"),
            Self::SessionClosed => write!(f, "Session already closed"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<MediaError> for SessionError {
    fn from(e: MediaError) -> Self {
        Self::MediaUnavailable(e)
    }
}

// ─── Negotiator ──────────────────────────────────────────────────

/// Drives call sessions over one signaling channel.
pub struct SessionNegotiator {
    context: AppContext,
    devices: Arc<dyn MediaDevices>,
    signaling: SignalSender,
    constraints: MediaConstraints,
    config: NegotiatorConfig,
}

impl SessionNegotiator {
    pub fn new(
        context: AppContext,
        devices: Arc<dyn MediaDevices>,
        signaling: SignalSender,
        config: NegotiatorConfig,
    ) -> Self {
        Self {
            context,
            devices,
            signaling,
            constraints: MediaConstraints::default(),
            config,
        }
    }

    pub fn with_constraints(mut self, constraints: MediaConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn config(&self) -> &NegotiatorConfig {
        &self.config
    }

    fn local_id(&self) -> &str {
        self.context.participant_id()
    }

    /// Acquire local media and announce a call to `target`.
    pub async fn start_session(&self, target: &str) -> Result<CallSession, SessionError> {
        let media = self.devices.open(&self.constraints)?;
        let description = SessionDescription::new(media.formats().to_vec());
        let mut session = CallSession::new(Uuid::new_v4(), self.local_id(), target, media);

        log::info!(
            "Call {} started by {} for {target}",
            session.session_id,
            self.local_id()
        );

        let announce = Signal::CallStart {
            session_id: session.session_id,
            from: self.local_id().to_string(),
            target: target.to_string(),
            description,
        };
        self.send(&mut session, announce).await?;
        Ok(session)
    }

    /// Join a call announced by `caller`: acquire media and admit the caller.
    pub async fn accept_call(
        &self,
        session_id: Uuid,
        caller: &str,
        caller_description: &SessionDescription,
    ) -> Result<CallSession, SessionError> {
        let media = self.devices.open(&self.constraints)?;
        let mut session = CallSession::new(session_id, self.local_id(), caller, media);
        log::info!("Joining call {session_id} from {caller}");
        self.admit_peer(&mut session, caller, caller_description)
            .await?;
        Ok(session)
    }

    /// Register a Connecting link for `peer_id` and send it our description.
    ///
    /// Idempotent: a live link for the peer is returned unchanged.
    pub async fn admit_peer(
        &self,
        session: &mut CallSession,
        peer_id: &str,
        remote_offer: &SessionDescription,
    ) -> Result<PeerLink, SessionError> {
        if session.is_over() {
            return Err(SessionError::SessionClosed);
        }
        if let Some(existing) = session.participants.get(peer_id) {
            if existing.is_live() {
                log::debug!("Peer {peer_id} already admitted to {}", session.session_id);
                return Ok(existing.clone());
            }
        }

        remote_offer
            .validate()
            .map_err(SessionError::MalformedDescription)?;
        let local_formats = session
            .local_media
            .as_ref()
            .map(|m| m.formats().to_vec())
            .ok_or(SessionError::SessionClosed)?;
        let negotiated = remote_offer.intersect(&local_formats);
        if negotiated.is_empty() {
            return Err(SessionError::IncompatibleMedia(peer_id.to_string()));
        }

        let link = PeerLink::connecting(peer_id, negotiated);
        session.expired.remove(peer_id);
        session.departed.remove(peer_id);
        session.participants.insert(peer_id.to_string(), link.clone());
        session.refresh_status();
        session.emit(SessionEvent::PeerConnecting {
            session_id: session.session_id,
            peer_id: peer_id.to_string(),
        });
        log::info!(
            "Admitted {peer_id} to {} ({} common formats)",
            session.session_id,
            link.negotiated.len()
        );

        let offer = Signal::Offer {
            session_id: session.session_id,
            from: self.local_id().to_string(),
            to: peer_id.to_string(),
            description: SessionDescription::new(link.negotiated.clone()),
        };
        self.send(session, offer).await?;
        Ok(link)
    }

    /// Complete the handshake with `peer_id`.
    pub fn apply_remote_answer(
        &self,
        session: &mut CallSession,
        peer_id: &str,
        answer: &SessionDescription,
    ) -> Result<PeerLink, SessionError> {
        if session.is_over() {
            return Err(SessionError::SessionClosed);
        }
        let Some(link) = session.participants.get(peer_id) else {
            return Err(if session.expired.contains(peer_id) {
                SessionError::NegotiationExpired(peer_id.to_string())
            } else {
                SessionError::UnknownPeer(peer_id.to_string())
            });
        };

        let since = match &link.state {
            LinkState::Connecting { since, .. } => *since,
            LinkState::Connected { .. } => return Ok(link.clone()),
            LinkState::Failed { .. } | LinkState::Closed => {
                return Err(SessionError::UnknownPeer(peer_id.to_string()))
            }
        };
        let common = answer.intersect(&link.negotiated);

        if since.elapsed() >= self.config.negotiation_timeout() {
            self.expire_peer(session, peer_id);
            return Err(SessionError::NegotiationExpired(peer_id.to_string()));
        }
        if let Err(reason) = answer.validate() {
            self.fail_peer(session, peer_id, format!("malformed answer: {reason}"));
            return Err(SessionError::MalformedDescription(reason));
        }
        if common.is_empty() {
            self.fail_peer(session, peer_id, "answer shares no media format".into());
            return Err(SessionError::IncompatibleMedia(peer_id.to_string()));
        }

        let remote_media = RemoteMedia::new(peer_id, common);
        let Some(link) = session.participants.get_mut(peer_id) else {
            return Err(SessionError::UnknownPeer(peer_id.to_string()));
        };
        let remote_candidates = match &mut link.state {
            LinkState::Connecting {
                remote_candidates, ..
            } => std::mem::take(remote_candidates),
            _ => Vec::new(),
        };
        link.state = LinkState::Connected {
            remote_media: remote_media.clone(),
            remote_candidates,
        };
        let snapshot = link.clone();

        session.emit(SessionEvent::PeerConnected {
            session_id: session.session_id,
            peer_id: peer_id.to_string(),
            remote_media,
        });
        log::info!("Peer {peer_id} connected in {}", session.session_id);
        Ok(snapshot)
    }

    /// Record a network candidate received from `peer_id`.
    pub fn submit_network_candidate(
        &self,
        session: &mut CallSession,
        peer_id: &str,
        candidate: NetworkCandidate,
    ) -> Result<(), SessionError> {
        if session.is_over() {
            log::debug!("Ignoring candidate from {peer_id}: session over");
            return Ok(());
        }
        let Some(link) = session.participants.get_mut(peer_id) else {
            if session.departed.contains(peer_id) {
                log::debug!("Ignoring candidate from departed peer {peer_id}");
                return Ok(());
            }
            return Err(SessionError::UnknownPeer(peer_id.to_string()));
        };

        match &mut link.state {
            LinkState::Connecting {
                remote_candidates, ..
            }
            | LinkState::Connected {
                remote_candidates, ..
            } => {
                if !remote_candidates.contains(&candidate) {
                    log::trace!(
                        "Candidate {}:{} for {peer_id}",
                        candidate.address,
                        candidate.port
                    );
                    remote_candidates.push(candidate);
                }
            }
            LinkState::Failed { .. } | LinkState::Closed => {
                log::debug!("Ignoring candidate for {} link {peer_id}", link.state.name());
            }
        }
        Ok(())
    }

    /// Send one of our own candidates to `peer_id`.
    pub async fn announce_local_candidate(
        &self,
        session: &mut CallSession,
        peer_id: &str,
        candidate: NetworkCandidate,
    ) -> Result<(), SessionError> {
        if session.is_over() {
            return Err(SessionError::SessionClosed);
        }
        if !session
            .participants
            .get(peer_id)
            .is_some_and(PeerLink::is_live)
        {
            return Err(SessionError::UnknownPeer(peer_id.to_string()));
        }
        let signal = Signal::Candidate {
            session_id: session.session_id,
            from: self.local_id().to_string(),
            to: peer_id.to_string(),
            candidate,
        };
        self.send(session, signal).await
    }

    /// Close one link, or the whole session when `peer_id` is `None`.
    ///
    /// Idempotent. Closing the last participant ends the session.
    pub async fn hangup(&self, session: &mut CallSession, peer_id: Option<&str>) {
        if session.is_over() {
            return;
        }
        match peer_id {
            Some(peer_id) => {
                if !self.close_peer(session, peer_id) {
                    return;
                }
                let stop_routing = Signal::Hangup {
                    session_id: session.session_id,
                    from: self.local_id().to_string(),
                    to: Some(peer_id.to_string()),
                };
                if self.send(session, stop_routing).await.is_err() {
                    return;
                }
                if session.participants.is_empty() {
                    self.end_session(session).await;
                }
            }
            None => self.end_session(session).await,
        }
    }

    /// Fail every link stuck in Connecting past the timeout.
    pub fn expire_stale(&self, session: &mut CallSession) -> Vec<PeerId> {
        let timeout = self.config.negotiation_timeout();
        let mut stale: Vec<PeerId> = session
            .participants
            .values()
            .filter(|link| {
                matches!(link.state, LinkState::Connecting { since, .. } if since.elapsed() >= timeout)
            })
            .map(|link| link.peer_id.clone())
            .collect();
        stale.sort();

        for peer_id in &stale {
            self.expire_peer(session, peer_id);
        }
        stale
    }

    /// Route one inbound signaling event.
    ///
    /// Per-peer errors become `PeerFailed` notices; only signaling loss
    /// ends the session.
    pub async fn handle_signal(&self, session: &mut CallSession, event: SignalEvent) {
        if session.is_over() {
            return;
        }
        let signal = match event {
            SignalEvent::Message(signal) => signal,
            SignalEvent::Disconnected => {
                self.fail_session(session, "signaling channel disconnected");
                return;
            }
        };
        if signal.session_id() != session.session_id || signal.from() == self.local_id() {
            return;
        }
        log::trace!("{} from {} in {}", signal.label(), signal.from(), session.session_id);

        match signal {
            Signal::Offer {
                from,
                to,
                description,
                ..
            } if to == self.local_id() => {
                let crossed = session
                    .participants
                    .get(&from)
                    .is_some_and(|link| matches!(link.state, LinkState::Connecting { .. }));
                if crossed {
                    self.complete_crossed_offer(session, &from, &description)
                        .await;
                } else if let Err(e) = self.admit_peer(session, &from, &description).await {
                    self.report_peer_error(session, &from, e);
                }
            }
            Signal::Answer {
                from,
                to,
                description,
                ..
            } if to == self.local_id() => {
                if let Err(e) = self.apply_remote_answer(session, &from, &description) {
                    self.report_peer_error(session, &from, e);
                }
            }
            Signal::Candidate {
                from, to, candidate, ..
            } if to == self.local_id() => {
                if let Err(e) = self.submit_network_candidate(session, &from, candidate) {
                    log::warn!("Candidate from {from} rejected: {e}");
                }
            }
            Signal::Hangup { from, to: None, .. } if from == session.target => {
                log::info!("Call {} ended by {from}", session.session_id);
                self.end_session(session).await;
            }
            Signal::Hangup { from, to, .. }
                if to.is_none() || to.as_deref() == Some(self.local_id()) =>
            {
                self.hangup(session, Some(&from)).await;
            }
            Signal::CallStart { from, .. } => {
                log::debug!("Ignoring repeated call-start from {from}");
            }
            _ => {}
        }
    }

    /// Process signaling and periodic expiry until the session is over.
    pub async fn drive(
        &self,
        session: &mut CallSession,
        incoming: &mut mpsc::Receiver<SignalEvent>,
    ) {
        let mut sweep = self.sweep_timer();
        while !session.is_over() {
            tokio::select! {
                event = incoming.recv() => match event {
                    Some(event) => self.handle_signal(session, event).await,
                    None => self.fail_session(session, "signaling channel closed"),
                },
                _ = sweep.tick() => {
                    self.expire_stale(session);
                }
            }
        }
        log::debug!("Drive loop for {} finished", session.session_id);
    }

    /// [`drive`](Self::drive) for a shared session; the lock is held per event.
    pub async fn drive_shared(
        &self,
        session: SharedSession,
        mut incoming: mpsc::Receiver<SignalEvent>,
    ) {
        let mut sweep = self.sweep_timer();
        loop {
            tokio::select! {
                event = incoming.recv() => {
                    let mut guard = session.lock().await;
                    match event {
                        Some(event) => self.handle_signal(&mut guard, event).await,
                        None => self.fail_session(&mut guard, "signaling channel closed"),
                    }
                    if guard.is_over() {
                        break;
                    }
                }
                _ = sweep.tick() => {
                    let mut guard = session.lock().await;
                    if guard.is_over() {
                        break;
                    }
                    self.expire_stale(&mut guard);
                }
            }
        }
    }

    // ─── Internal transitions ────────────────────────────────────

    fn sweep_timer(&self) -> tokio::time::Interval {
        let mut sweep =
            tokio::time::interval(Duration::from_millis(self.config.sweep_interval_ms.max(1)));
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        sweep
    }

    async fn complete_crossed_offer(
        &self,
        session: &mut CallSession,
        peer_id: &str,
        description: &SessionDescription,
    ) {
        match self.apply_remote_answer(session, peer_id, description) {
            Ok(link) => {
                let answer = Signal::Answer {
                    session_id: session.session_id,
                    from: self.local_id().to_string(),
                    to: peer_id.to_string(),
                    description: SessionDescription::new(link.negotiated.clone()),
                };
                let _ = self.send(session, answer).await;
            }
            Err(e) => self.report_peer_error(session, peer_id, e),
        }
    }

    /// Emit a `PeerFailed` notice for errors that did not already fail a link.
    fn report_peer_error(&self, session: &mut CallSession, peer_id: &str, error: SessionError) {
        match error {
            SessionError::MalformedDescription(_)
            | SessionError::IncompatibleMedia(_)
            | SessionError::UnknownPeer(_)
                if !session.departed.contains(peer_id) =>
            {
                log::warn!("Peer {peer_id} rejected: {error}");
                session.emit(SessionEvent::PeerFailed {
                    session_id: session.session_id,
                    peer_id: peer_id.to_string(),
                    reason: error.to_string(),
                });
            }
            _ => log::debug!("Peer {peer_id}: {error}"),
        }
    }

    fn expire_peer(&self, session: &mut CallSession, peer_id: &str) {
        self.fail_peer(session, peer_id, "negotiation timed out".into());
        session.expired.insert(peer_id.to_string());
    }

    fn fail_peer(&self, session: &mut CallSession, peer_id: &str, reason: String) {
        let Some(mut link) = session.participants.remove(peer_id) else {
            return;
        };
        log::warn!("Peer {peer_id} failed in {}: {reason}", session.session_id);
        link.state = LinkState::Failed {
            reason: reason.clone(),
        };
        session.departed.insert(peer_id.to_string());
        session.refresh_status();
        session.emit(SessionEvent::PeerFailed {
            session_id: session.session_id,
            peer_id: peer_id.to_string(),
            reason,
        });
    }

    /// Remove a live link as Closed. Returns false if there was none.
    fn close_peer(&self, session: &mut CallSession, peer_id: &str) -> bool {
        let Some(mut link) = session.participants.remove(peer_id) else {
            return false;
        };
        link.state = LinkState::Closed;
        session.departed.insert(peer_id.to_string());
        session.refresh_status();
        session.emit(SessionEvent::PeerClosed {
            session_id: session.session_id,
            peer_id: peer_id.to_string(),
        });
        log::info!("Closed link to {peer_id} in {}", session.session_id);
        true
    }

    async fn end_session(&self, session: &mut CallSession) {
        if session.is_over() {
            return;
        }
        let mut peers: Vec<PeerId> = session.participants.keys().cloned().collect();
        peers.sort();
        for peer_id in &peers {
            self.close_peer(session, peer_id);
        }
        session.local_media = None;
        session.status = SessionStatus::Ended;

        let hangup = Signal::Hangup {
            session_id: session.session_id,
            from: self.local_id().to_string(),
            to: None,
        };
        if let Err(e) = self.signaling.send(hangup).await {
            log::warn!("Hangup for {} not delivered: {e}", session.session_id);
        }
        session.emit(SessionEvent::SessionEnded {
            session_id: session.session_id,
        });
        log::info!("Call {} ended", session.session_id);
    }

    /// Session-fatal failure: every link fails, media is released.
    fn fail_session(&self, session: &mut CallSession, reason: &str) {
        if session.is_over() {
            return;
        }
        let mut failed_peers: Vec<PeerId> = Vec::new();
        for (peer_id, mut link) in session.participants.drain() {
            link.state = LinkState::Failed {
                reason: reason.to_string(),
            };
            failed_peers.push(peer_id);
        }
        failed_peers.sort();
        session.departed.extend(failed_peers.iter().cloned());
        session.local_media = None;
        session.status = SessionStatus::Failed;

        log::error!(
            "Call {} failed ({reason}); {} peers dropped",
            session.session_id,
            failed_peers.len()
        );
        session.emit(SessionEvent::SessionFailed {
            session_id: session.session_id,
            failed_peers,
        });
    }

    /// Send a signal; a closed channel fails the session.
    async fn send(&self, session: &mut CallSession, signal: Signal) -> Result<(), SessionError> {
        if self.signaling.send(signal).await.is_err() {
            self.fail_session(session, "signaling send failed");
            return Err(SessionError::SignalingLost);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Identity;
    use crate::media::StaticDevices;
    use crate::protocol::MediaKind;
    use crate::signaling::{SignalingChannel, SignalingPeer};

    struct Harness {
        negotiator: SessionNegotiator,
        devices: Arc<StaticDevices>,
        peer: SignalingPeer,
        incoming: mpsc::Receiver<SignalEvent>,
    }

    fn harness(config: NegotiatorConfig) -> Harness {
        let (channel, peer) = SignalingChannel::in_memory();
        let (sender, incoming) = channel.split();
        let devices = Arc::new(StaticDevices::default_camera());
        let negotiator = SessionNegotiator::new(
            AppContext::new(Identity::new("alice", "Alice")),
            devices.clone(),
            sender,
            config,
        );
        Harness {
            negotiator,
            devices,
            peer,
            incoming,
        }
    }

    fn offer() -> SessionDescription {
        SessionDescription::new(vec![MediaFormat::opus(), MediaFormat::vp8()])
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn test_start_session_acquires_media_and_announces() {
        let mut h = harness(NegotiatorConfig::for_testing());
        let session = h.negotiator.start_session("bob").await.unwrap();

        assert_eq!(session.status(), SessionStatus::Waiting);
        assert!(session.has_local_media());
        assert_eq!(h.devices.open_count(), 1);
        match h.peer.try_next_sent() {
            Some(Signal::CallStart {
                target,
                description,
                ..
            }) => {
                assert_eq!(target, "bob");
                assert_eq!(description.formats.len(), 3);
            }
            other => panic!("expected call-start, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_start_session_busy_device() {
        let h = harness(NegotiatorConfig::for_testing());
        let _first = h.negotiator.start_session("bob").await.unwrap();
        let err = h.negotiator.start_session("carol").await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::MediaUnavailable(MediaError::DeviceBusy(_))
        ));
    }

    #[tokio::test]
    async fn test_start_session_permission_denied() {
        let h = harness(NegotiatorConfig::for_testing());
        h.devices.set_permission(false);
        assert_eq!(
            h.negotiator.start_session("bob").await.unwrap_err(),
            SessionError::MediaUnavailable(MediaError::PermissionDenied)
        );
    }

    #[tokio::test]
    async fn test_admit_peer_is_idempotent() {
        let mut h = harness(NegotiatorConfig::for_testing());
        let mut session = h.negotiator.start_session("bob").await.unwrap();
        h.peer.drain_sent();

        let first = h
            .negotiator
            .admit_peer(&mut session, "bob", &offer())
            .await
            .unwrap();
        let second = h
            .negotiator
            .admit_peer(&mut session, "bob", &offer())
            .await
            .unwrap();

        assert_eq!(first.link_id(), second.link_id());
        assert_eq!(session.participants().len(), 1);
        assert_eq!(session.status(), SessionStatus::Active);
        // Only the first admission sends a description
        let sent = h.peer.drain_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].label(), "offer");
    }

    #[tokio::test]
    async fn test_admit_rejects_bad_offers() {
        let h = harness(NegotiatorConfig::for_testing());
        let mut session = h.negotiator.start_session("bob").await.unwrap();

        let empty = SessionDescription::default();
        assert!(matches!(
            h.negotiator.admit_peer(&mut session, "bob", &empty).await,
            Err(SessionError::MalformedDescription(_))
        ));

        let foreign = SessionDescription::new(vec![MediaFormat::new(MediaKind::Video, "AV1", 90_000)]);
        assert_eq!(
            h.negotiator
                .admit_peer(&mut session, "bob", &foreign)
                .await
                .unwrap_err(),
            SessionError::IncompatibleMedia("bob".into())
        );
        assert!(session.participants().is_empty());
        assert_eq!(session.status(), SessionStatus::Waiting);
    }

    #[tokio::test]
    async fn test_answer_connects_link_and_keeps_candidates() {
        let h = harness(NegotiatorConfig::for_testing());
        let mut session = h.negotiator.start_session("bob").await.unwrap();
        let mut events = session.take_event_rx().unwrap();
        h.negotiator
            .admit_peer(&mut session, "bob", &offer())
            .await
            .unwrap();

        let candidate = NetworkCandidate::new("10.0.0.2", 5000, 100);
        h.negotiator
            .submit_network_candidate(&mut session, "bob", candidate.clone())
            .unwrap();

        let link = h
            .negotiator
            .apply_remote_answer(&mut session, "bob", &SessionDescription::new(vec![MediaFormat::opus()]))
            .unwrap();
        assert!(link.is_connected());
        assert_eq!(link.remote_candidates(), &[candidate]);
        let media = link.remote_media().unwrap();
        assert_eq!(media.formats, vec![MediaFormat::opus()]);

        // Second answer is a no-op
        let again = h
            .negotiator
            .apply_remote_answer(&mut session, "bob", &offer())
            .unwrap();
        assert_eq!(again.remote_media().unwrap().stream_id, media.stream_id);

        let events = drain(&mut events);
        assert!(matches!(events[0], SessionEvent::PeerConnecting { .. }));
        assert!(matches!(events[1], SessionEvent::PeerConnected { .. }));
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn test_answer_from_unknown_peer() {
        let h = harness(NegotiatorConfig::for_testing());
        let mut session = h.negotiator.start_session("bob").await.unwrap();
        assert_eq!(
            h.negotiator
                .apply_remote_answer(&mut session, "mallory", &offer())
                .unwrap_err(),
            SessionError::UnknownPeer("mallory".into())
        );
        assert_eq!(
            h.negotiator
                .submit_network_candidate(&mut session, "mallory", NetworkCandidate::new("x", 1, 1))
                .unwrap_err(),
            SessionError::UnknownPeer("mallory".into())
        );
    }

    #[tokio::test]
    async fn test_incompatible_answer_fails_link() {
        let h = harness(NegotiatorConfig::for_testing());
        let mut session = h.negotiator.start_session("bob").await.unwrap();
        h.negotiator
            .admit_peer(&mut session, "bob", &SessionDescription::new(vec![MediaFormat::opus()]))
            .await
            .unwrap();

        let video_only = SessionDescription::new(vec![MediaFormat::vp8()]);
        assert_eq!(
            h.negotiator
                .apply_remote_answer(&mut session, "bob", &video_only)
                .unwrap_err(),
            SessionError::IncompatibleMedia("bob".into())
        );
        assert!(session.participant("bob").is_none());
        assert_eq!(session.status(), SessionStatus::Waiting);
        // Late candidates for the failed peer are ignored
        h.negotiator
            .submit_network_candidate(&mut session, "bob", NetworkCandidate::new("x", 1, 1))
            .unwrap();
    }

    #[tokio::test]
    async fn test_late_answer_after_expiry() {
        let h = harness(NegotiatorConfig::for_testing());
        let mut session = h.negotiator.start_session("bob").await.unwrap();
        let mut events = session.take_event_rx().unwrap();
        h.negotiator
            .admit_peer(&mut session, "bob", &offer())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(
            h.negotiator
                .apply_remote_answer(&mut session, "bob", &offer())
                .unwrap_err(),
            SessionError::NegotiationExpired("bob".into())
        );
        // Terminal once declared
        assert_eq!(
            h.negotiator
                .apply_remote_answer(&mut session, "bob", &offer())
                .unwrap_err(),
            SessionError::NegotiationExpired("bob".into())
        );
        let failed = drain(&mut events)
            .into_iter()
            .filter(|e| matches!(e, SessionEvent::PeerFailed { .. }))
            .count();
        assert_eq!(failed, 1);
    }

    #[tokio::test]
    async fn test_expire_stale_sweeps_connecting_links() {
        let h = harness(NegotiatorConfig::for_testing());
        let mut session = h.negotiator.start_session("bob").await.unwrap();
        h.negotiator
            .admit_peer(&mut session, "bob", &offer())
            .await
            .unwrap();
        h.negotiator
            .admit_peer(&mut session, "carol", &offer())
            .await
            .unwrap();
        h.negotiator
            .apply_remote_answer(&mut session, "carol", &offer())
            .unwrap();

        assert!(h.negotiator.expire_stale(&mut session).is_empty());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(h.negotiator.expire_stale(&mut session), vec!["bob".to_string()]);
        assert!(session.participant("carol").unwrap().is_connected());
        assert_eq!(session.status(), SessionStatus::Active);
    }

    #[tokio::test]
    async fn test_full_hangup_releases_everything() {
        let mut h = harness(NegotiatorConfig::for_testing());
        let mut session = h.negotiator.start_session("bob").await.unwrap();
        let mut events = session.take_event_rx().unwrap();
        for peer in ["bob", "carol"] {
            h.negotiator
                .admit_peer(&mut session, peer, &offer())
                .await
                .unwrap();
        }
        h.peer.drain_sent();

        h.negotiator.hangup(&mut session, None).await;
        assert!(session.participants().is_empty());
        assert!(!session.has_local_media());
        assert_eq!(h.devices.open_count(), 0);
        assert_eq!(session.status(), SessionStatus::Ended);
        assert!(matches!(
            h.peer.try_next_sent(),
            Some(Signal::Hangup { to: None, .. })
        ));

        // Idempotent
        h.negotiator.hangup(&mut session, None).await;
        assert!(h.peer.try_next_sent().is_none());

        let events = drain(&mut events);
        let closed = events
            .iter()
            .filter(|e| matches!(e, SessionEvent::PeerClosed { .. }))
            .count();
        let ended = events
            .iter()
            .filter(|e| matches!(e, SessionEvent::SessionEnded { .. }))
            .count();
        assert_eq!((closed, ended), (2, 1));
    }

    #[tokio::test]
    async fn test_hangup_last_peer_ends_session() {
        let mut h = harness(NegotiatorConfig::for_testing());
        let mut session = h.negotiator.start_session("bob").await.unwrap();
        h.negotiator
            .admit_peer(&mut session, "bob", &offer())
            .await
            .unwrap();
        h.peer.drain_sent();

        h.negotiator.hangup(&mut session, Some("bob")).await;
        let sent = h.peer.drain_sent();
        assert!(matches!(&sent[0], Signal::Hangup { to: Some(p), .. } if p == "bob"));
        assert!(matches!(&sent[1], Signal::Hangup { to: None, .. }));
        assert_eq!(session.status(), SessionStatus::Ended);
        assert_eq!(h.devices.open_count(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_fails_session_once() {
        let h = harness(NegotiatorConfig::for_testing());
        let mut session = h.negotiator.start_session("bob").await.unwrap();
        let mut events = session.take_event_rx().unwrap();
        for peer in ["bob", "carol"] {
            h.negotiator
                .admit_peer(&mut session, peer, &offer())
                .await
                .unwrap();
            h.negotiator
                .apply_remote_answer(&mut session, peer, &offer())
                .unwrap();
        }
        drain(&mut events);

        h.negotiator
            .handle_signal(&mut session, SignalEvent::Disconnected)
            .await;
        h.negotiator
            .handle_signal(&mut session, SignalEvent::Disconnected)
            .await;

        assert_eq!(session.status(), SessionStatus::Failed);
        assert!(session.participants().is_empty());
        assert_eq!(h.devices.open_count(), 0);
        let events = drain(&mut events);
        assert_eq!(events.len(), 1);
        match &events[0] {
            SessionEvent::SessionFailed { failed_peers, .. } => {
                assert_eq!(failed_peers, &vec!["bob".to_string(), "carol".to_string()]);
            }
            other => panic!("expected aggregate failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_send_failure_is_signaling_loss() {
        let Harness {
            negotiator,
            devices,
            peer,
            ..
        } = harness(NegotiatorConfig::for_testing());
        let mut session = negotiator.start_session("bob").await.unwrap();
        drop(peer);

        assert_eq!(
            negotiator
                .admit_peer(&mut session, "bob", &offer())
                .await
                .unwrap_err(),
            SessionError::SignalingLost
        );
        assert_eq!(session.status(), SessionStatus::Failed);
        assert_eq!(devices.open_count(), 0);
    }

    #[tokio::test]
    async fn test_handle_signal_routes_offer_and_answer() {
        let mut h = harness(NegotiatorConfig::for_testing());
        let mut session = h.negotiator.start_session("bob").await.unwrap();
        let id = session.session_id();
        h.peer.drain_sent();

        h.negotiator
            .handle_signal(
                &mut session,
                SignalEvent::Message(Signal::Offer {
                    session_id: id,
                    from: "bob".into(),
                    to: "alice".into(),
                    description: offer(),
                }),
            )
            .await;
        assert!(matches!(
            session.participant("bob").unwrap().state(),
            LinkState::Connecting { .. }
        ));
        assert_eq!(h.peer.drain_sent()[0].label(), "offer");

        h.negotiator
            .handle_signal(
                &mut session,
                SignalEvent::Message(Signal::Answer {
                    session_id: id,
                    from: "bob".into(),
                    to: "alice".into(),
                    description: offer(),
                }),
            )
            .await;
        assert!(session.participant("bob").unwrap().is_connected());

        // Signals for other sessions are ignored
        h.negotiator
            .handle_signal(
                &mut session,
                SignalEvent::Message(Signal::Hangup {
                    session_id: Uuid::new_v4(),
                    from: "bob".into(),
                    to: None,
                }),
            )
            .await;
        assert_eq!(session.status(), SessionStatus::Active);
    }

    #[tokio::test]
    async fn test_bad_offer_reported_as_peer_failure() {
        let h = harness(NegotiatorConfig::for_testing());
        let mut session = h.negotiator.start_session("bob").await.unwrap();
        let mut events = session.take_event_rx().unwrap();
        let id = session.session_id();

        h.negotiator
            .handle_signal(
                &mut session,
                SignalEvent::Message(Signal::Offer {
                    session_id: id,
                    from: "bob".into(),
                    to: "alice".into(),
                    description: SessionDescription::default(),
                }),
            )
            .await;

        assert_eq!(session.status(), SessionStatus::Waiting);
        let events = drain(&mut events);
        assert!(matches!(&events[..], [SessionEvent::PeerFailed { peer_id, .. }] if peer_id == "bob"));
    }

    #[tokio::test]
    async fn test_drive_returns_on_disconnect() {
        let mut h = harness(NegotiatorConfig::for_testing());
        let mut session = h.negotiator.start_session("bob").await.unwrap();
        h.peer.disconnect().await.unwrap();

        tokio::time::timeout(
            Duration::from_secs(2),
            h.negotiator.drive(&mut session, &mut h.incoming),
        )
        .await
        .expect("drive loop should finish");
        assert_eq!(session.status(), SessionStatus::Failed);
    }
}
