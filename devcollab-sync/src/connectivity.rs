//! Host-provided connectivity capability.
//!
//! The host (browser shell, OS network monitor, test) owns a
//! [`Connectivity`] and flips it; consumers hold [`ConnectivityWatch`]es
//! and await transitions instead of polling global state.

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    Online,
    Offline,
}

impl ConnectivityState {
    pub fn is_online(self) -> bool {
        self == ConnectivityState::Online
    }
}

/// Writer side of the connectivity signal.
#[derive(Debug)]
pub struct Connectivity {
    tx: watch::Sender<ConnectivityState>,
}

impl Connectivity {
    pub fn new(initial: ConnectivityState) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    pub fn set(&self, state: ConnectivityState) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            log::info!("Connectivity changed: {state:?}");
        }
    }

    pub fn set_online(&self, online: bool) {
        self.set(if online {
            ConnectivityState::Online
        } else {
            ConnectivityState::Offline
        });
    }

    pub fn state(&self) -> ConnectivityState {
        *self.tx.borrow()
    }

    pub fn watch(&self) -> ConnectivityWatch {
        ConnectivityWatch {
            rx: self.tx.subscribe(),
        }
    }
}

/// Reader side: current state plus transition notifications.
#[derive(Debug, Clone)]
pub struct ConnectivityWatch {
    rx: watch::Receiver<ConnectivityState>,
}

impl ConnectivityWatch {
    pub fn state(&self) -> ConnectivityState {
        *self.rx.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.state().is_online()
    }

    /// Wait for the next state change and return the new state.
    ///
    /// Returns `None` once the [`Connectivity`] owner is dropped.
    pub async fn changed(&mut self) -> Option<ConnectivityState> {
        self.rx.changed().await.ok()?;
        Some(*self.rx.borrow_and_update())
    }
}
