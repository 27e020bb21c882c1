//! Application context handed to the core components at construction.
//!
//! Replaces ambient UI singletons (current user store, online flag) with an
//! explicit value. Identity comes from the external auth collaborator.

use std::sync::Arc;
use uuid::Uuid;

/// Local participant identity used to tag writes and call signaling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub participant_id: String,
    pub display_name: String,
}

impl Identity {
    pub fn new(participant_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            participant_id: participant_id.into(),
            display_name: display_name.into(),
        }
    }

    /// Throwaway identity for local tools and tests.
    pub fn anonymous() -> Self {
        let id = Uuid::new_v4();
        Self {
            participant_id: id.to_string(),
            display_name: format!("guest-{}", &id.simple().to_string()[..8]),
        }
    }
}

/// Shared, read-only context for one running application instance.
#[derive(Debug, Clone)]
pub struct AppContext {
    identity: Arc<Identity>,
}

impl AppContext {
    pub fn new(identity: Identity) -> Self {
        Self {
            identity: Arc::new(identity),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn participant_id(&self) -> &str {
        &self.identity.participant_id
    }
}
