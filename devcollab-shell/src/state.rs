//! Application state — wires both sync kernels to their collaborators.
//!
//! `AppState` owns the write queue, the connectivity source and the
//! session negotiator, plus the call currently in progress. Command
//! handlers report through the `log` facade; a signal pump task feeds
//! inbound signaling into the current call.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use devcollab_sync::{
    connect_ws, AppContext, CallSession, Connectivity, ConnectivityState, DurableStore,
    EntityKind, MemoryStore, OfflineWriteQueue, PendingWrite, RecordingRemote, RemoteWriter,
    RocksStore, SessionEvent, SessionNegotiator, SharedSession, Signal, SignalEvent,
    SignalingChannel, StaticDevices, WriteOutcome, WsRemote,
};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::commands::{Command, HELP};
use crate::settings::Settings;

/// Remote write collaborator chosen at start-up.
pub enum ShellRemote {
    Ws(WsRemote),
    /// No endpoint configured: acknowledge in-process
    Local(RecordingRemote),
}

impl RemoteWriter for ShellRemote {
    fn submit(&self, write: &PendingWrite) -> impl Future<Output = WriteOutcome> + Send {
        async move {
            match self {
                ShellRemote::Ws(remote) => remote.submit(write).await,
                ShellRemote::Local(remote) => remote.submit(write).await,
            }
        }
    }
}

pub type ShellQueue = OfflineWriteQueue<ShellRemote>;

/// What the REPL should do after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

pub struct AppState {
    pub queue: Arc<ShellQueue>,
    pub connectivity: Connectivity,
    pub negotiator: Arc<SessionNegotiator>,
    pub call: Arc<Mutex<Option<SharedSession>>>,
    context: AppContext,
    background: Vec<JoinHandle<()>>,
}

impl AppState {
    /// Open the store, connect the configured endpoints and start the
    /// background tasks (auto flush, signal pump).
    pub async fn start(settings: &Settings) -> Result<Self, Box<dyn std::error::Error>> {
        let context = AppContext::new(settings.identity());
        log::info!(
            "Participant {} ({})",
            context.participant_id(),
            context.identity().display_name
        );

        let store: Arc<dyn DurableStore> = match RocksStore::open(settings.store_config()) {
            Ok(store) => Arc::new(store),
            Err(e) => {
                log::error!("Durable store unavailable ({e}); queued writes will not survive restart");
                Arc::new(MemoryStore::new())
            }
        };

        let remote = match &settings.remote_url {
            Some(url) => match WsRemote::connect(url).await {
                Ok(remote) => ShellRemote::Ws(remote),
                Err(e) => {
                    log::warn!("Write endpoint {url} unavailable ({e}); acknowledging locally");
                    ShellRemote::Local(RecordingRemote::new())
                }
            },
            None => ShellRemote::Local(RecordingRemote::new()),
        };

        let initial = if settings.start_online {
            ConnectivityState::Online
        } else {
            ConnectivityState::Offline
        };
        let connectivity = Connectivity::new(initial);
        let queue = Arc::new(OfflineWriteQueue::new(
            context.clone(),
            store,
            remote,
            connectivity.watch(),
            settings.queue_config(),
        )?);

        let mut background = vec![queue.spawn_auto_flush()];

        let channel = match &settings.signaling_url {
            Some(url) => connect_ws(url).await?,
            None => {
                let (channel, mut far) = SignalingChannel::in_memory();
                // Loopback: nothing answers, signals are only logged
                background.push(tokio::spawn(async move {
                    while let Some(signal) = far.sent.recv().await {
                        log::debug!("(no signaling server) dropped {}", signal.label());
                    }
                }));
                channel
            }
        };
        let (sender, incoming) = channel.split();
        let negotiator = Arc::new(SessionNegotiator::new(
            context.clone(),
            Arc::new(StaticDevices::default_camera()),
            sender,
            settings.negotiator_config(),
        ));

        let call: Arc<Mutex<Option<SharedSession>>> = Arc::new(Mutex::new(None));
        background.push(spawn_signal_pump(
            negotiator.clone(),
            call.clone(),
            incoming,
            Duration::from_millis(settings.sweep_interval_ms.max(1)),
        ));

        Ok(Self {
            queue,
            connectivity,
            negotiator,
            call,
            context,
            background,
        })
    }

    /// Execute one command.
    pub async fn execute(&self, command: Command) -> Flow {
        match command {
            Command::Enqueue(kind, text) => match self.queue.enqueue(kind, text.into_bytes()) {
                Ok(write) => log::info!("Queued {kind} #{}", write.id),
                Err(e) => log::error!("{e}"),
            },
            Command::Flush(kind) => match self.queue.flush(kind).await {
                Ok(report) if report.offline => log::info!("Offline: nothing sent"),
                Ok(report) => log::info!(
                    "Flushed: {} sent, {} rejected, {} dead-lettered{}",
                    report.sent(),
                    report.rejected.len(),
                    report.dead_lettered.len(),
                    if report.cancelled { " (cancelled)" } else { "" }
                ),
                Err(e) => log::error!("{e}"),
            },
            Command::Cancel => self.queue.cancel_flush(),
            Command::Pending => self.log_pending(),
            Command::Dead => match self.queue.dead_letters(None) {
                Ok(dead) if dead.is_empty() => log::info!("No dead letters"),
                Ok(dead) => {
                    for write in dead {
                        log::info!(
                            "dead #{} {} after {} attempts: {}",
                            write.id,
                            write.entity_kind,
                            write.attempts,
                            String::from_utf8_lossy(&write.payload)
                        );
                    }
                }
                Err(e) => log::error!("{e}"),
            },
            Command::Retry(id) => match self.queue.retry_dead_letter(id) {
                Ok(write) => log::info!("#{id} requeued as #{}", write.id),
                Err(e) => log::error!("{e}"),
            },
            Command::Discard(id) => match self.queue.discard_dead_letter(id) {
                Ok(_) => log::info!("#{id} discarded"),
                Err(e) => log::error!("{e}"),
            },
            Command::Online(online) => self.connectivity.set_online(online),
            Command::Call(peer) => self.start_call(&peer).await,
            Command::Candidate(peer, candidate) => {
                let Some(session) = self.current_call().await else {
                    log::warn!("No call in progress");
                    return Flow::Continue;
                };
                let mut session = session.lock().await;
                if let Err(e) = self
                    .negotiator
                    .announce_local_candidate(&mut session, &peer, candidate)
                    .await
                {
                    log::error!("{e}");
                }
            }
            Command::Hangup(peer) => {
                let Some(session) = self.current_call().await else {
                    log::warn!("No call in progress");
                    return Flow::Continue;
                };
                let mut session = session.lock().await;
                self.negotiator.hangup(&mut session, peer.as_deref()).await;
            }
            Command::Status => self.log_status().await,
            Command::Help => log::info!("\n{HELP}"),
            Command::Quit => return Flow::Quit,
        }
        Flow::Continue
    }

    async fn current_call(&self) -> Option<SharedSession> {
        self.call.lock().await.clone()
    }

    async fn start_call(&self, peer: &str) {
        let mut slot = self.call.lock().await;
        if let Some(existing) = slot.as_ref() {
            if !existing.lock().await.is_over() {
                log::warn!("Already in a call; hang up first");
                return;
            }
        }
        match self.negotiator.start_session(peer).await {
            Ok(session) => {
                log::info!("Calling {peer} (session {})", session.session_id());
                *slot = Some(install_session(session));
            }
            Err(e) => log::error!("Cannot start call: {e}"),
        }
    }

    fn log_pending(&self) {
        for kind in EntityKind::ALL {
            match self.queue.pending(kind) {
                Ok(writes) => {
                    for write in writes {
                        log::info!(
                            "pending #{} {kind} attempts={} {}",
                            write.id,
                            write.attempts,
                            String::from_utf8_lossy(&write.payload)
                        );
                    }
                }
                Err(e) => log::error!("{e}"),
            }
        }
    }

    async fn log_status(&self) {
        let pending = self.queue.pending_count().unwrap_or_default();
        let dead = self.queue.dead_letters(None).map(|d| d.len()).unwrap_or_default();
        log::info!(
            "{} | {:?} | {pending} pending, {dead} dead-lettered",
            self.context.participant_id(),
            self.connectivity.state()
        );
        match self.current_call().await {
            Some(session) => {
                let session = session.lock().await;
                log::info!(
                    "call {} {:?}, media {}",
                    session.session_id(),
                    session.status(),
                    if session.has_local_media() { "held" } else { "released" }
                );
                let mut peers: Vec<_> = session.participants().values().collect();
                peers.sort_by(|a, b| a.peer_id().cmp(b.peer_id()));
                for link in peers {
                    log::info!("  {} {}", link.peer_id(), link.state().name());
                }
            }
            None => log::info!("no call"),
        }
    }

    /// Stop background tasks; the current call is hung up first.
    pub async fn shutdown(self) {
        if let Some(session) = self.current_call().await {
            let mut session = session.lock().await;
            self.negotiator.hangup(&mut session, None).await;
        }
        self.queue.cancel_flush();
        for task in self.background {
            task.abort();
        }
        log::info!("Shut down");
    }
}

/// Share a session and log its notices.
fn install_session(mut session: CallSession) -> SharedSession {
    if let Some(mut events) = session.take_event_rx() {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                log_session_event(&event);
            }
        });
    }
    session.into_shared()
}

fn log_session_event(event: &SessionEvent) {
    match event {
        SessionEvent::PeerConnecting { peer_id, .. } => log::info!("{peer_id} connecting"),
        SessionEvent::PeerConnected {
            peer_id,
            remote_media,
            ..
        } => log::info!(
            "{peer_id} connected ({} formats)",
            remote_media.formats.len()
        ),
        SessionEvent::PeerFailed {
            peer_id, reason, ..
        } => log::warn!("{peer_id} failed: {reason}"),
        SessionEvent::PeerClosed { peer_id, .. } => log::info!("{peer_id} left"),
        SessionEvent::SessionEnded { session_id } => log::info!("Call {session_id} ended"),
        SessionEvent::SessionFailed {
            session_id,
            failed_peers,
        } => log::error!("Call {session_id} failed, dropped {failed_peers:?}"),
    }
}

/// Feed inbound signaling into the current call; answer incoming calls
/// when idle. Runs the expiry sweep on the same task.
fn spawn_signal_pump(
    negotiator: Arc<SessionNegotiator>,
    call: Arc<Mutex<Option<SharedSession>>>,
    mut incoming: mpsc::Receiver<SignalEvent>,
    sweep_interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut sweep = tokio::time::interval(sweep_interval);
        loop {
            tokio::select! {
                event = incoming.recv() => {
                    let event = event.unwrap_or(SignalEvent::Disconnected);
                    let disconnected = event == SignalEvent::Disconnected;
                    route_signal(&negotiator, &call, event).await;
                    if disconnected {
                        log::error!("Signaling lost; calls unavailable until restart");
                        break;
                    }
                }
                _ = sweep.tick() => {
                    if let Some(session) = call.lock().await.clone() {
                        let mut session = session.lock().await;
                        let expired = negotiator.expire_stale(&mut session);
                        if !expired.is_empty() {
                            log::warn!("Negotiation expired for {expired:?}");
                        }
                    }
                }
            }
        }
    })
}

async fn route_signal(
    negotiator: &SessionNegotiator,
    call: &Mutex<Option<SharedSession>>,
    event: SignalEvent,
) {
    let mut slot = call.lock().await;
    let idle = match slot.as_ref() {
        Some(session) => session.lock().await.is_over(),
        None => true,
    };

    if idle {
        if let SignalEvent::Message(Signal::CallStart {
            session_id,
            from,
            description,
            ..
        }) = event
        {
            log::info!("Incoming call from {from}");
            match negotiator.accept_call(session_id, &from, &description).await {
                Ok(session) => *slot = Some(install_session(session)),
                Err(e) => log::error!("Cannot accept call from {from}: {e}"),
            }
        }
        return;
    }

    if let Some(session) = slot.as_ref() {
        let mut session = session.lock().await;
        negotiator.handle_signal(&mut session, event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devcollab_sync::SessionStatus;
    use tempfile::tempdir;

    fn settings(dir: &std::path::Path) -> Settings {
        Settings {
            participant_id: Some("ada".into()),
            store_path: dir.join("queue"),
            start_online: false,
            sweep_interval_ms: 20,
            ..Settings::default()
        }
    }

    #[tokio::test]
    async fn test_offline_messages_flush_when_back_online() {
        let dir = tempdir().unwrap();
        let app = AppState::start(&settings(dir.path())).await.unwrap();

        app.execute(Command::Enqueue(EntityKind::Message, "hi".into())).await;
        app.execute(Command::Enqueue(EntityKind::Message, "there".into())).await;
        app.execute(Command::Flush(None)).await;
        assert_eq!(app.queue.pending_count().unwrap(), 2);

        app.execute(Command::Online(true)).await;
        tokio::time::timeout(Duration::from_secs(2), async {
            while app.queue.pending_count().unwrap() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("auto flush should drain the queue");

        match app.queue.remote() {
            ShellRemote::Local(remote) => assert_eq!(
                remote.acknowledged_payloads(),
                vec![b"hi".to_vec(), b"there".to_vec()]
            ),
            ShellRemote::Ws(_) => panic!("no endpoint configured"),
        }
        app.shutdown().await;
    }

    #[tokio::test]
    async fn test_call_and_hangup_without_signaling_server() {
        let dir = tempdir().unwrap();
        let app = AppState::start(&settings(dir.path())).await.unwrap();

        app.execute(Command::Call("bob".into())).await;
        let session = app.current_call().await.expect("call started");
        assert_eq!(session.lock().await.status(), SessionStatus::Waiting);

        // A second call is refused while the first is live
        app.execute(Command::Call("carol".into())).await;
        assert_eq!(session.lock().await.target(), "bob");

        app.execute(Command::Hangup(None)).await;
        let session = session.lock().await;
        assert_eq!(session.status(), SessionStatus::Ended);
        assert!(!session.has_local_media());
    }

    #[tokio::test]
    async fn test_quit_command_stops_loop() {
        let dir = tempdir().unwrap();
        let app = AppState::start(&settings(dir.path())).await.unwrap();
        assert_eq!(app.execute(Command::Status).await, Flow::Continue);
        assert_eq!(app.execute(Command::Quit).await, Flow::Quit);
    }
}
