//! Lazy, per-cycle memoized access to the identity service.
//!
//! Obtaining an authenticated client involves an expensive handshake, and many
//! pollsters and dispatch calls may need it within one polling cycle. The
//! [`CredentialBroker`] acquires the client on first use and caches it for the
//! rest of the cycle. A failed acquisition is cached too: every subsequent
//! [`get`](CredentialBroker::get) in the same cycle returns the same error
//! without a new network attempt, so an unreachable identity service does not
//! cause a retry storm. [`reset_for_cycle`](CredentialBroker::reset_for_cycle)
//! must be called exactly once at the start of every polling interval to get
//! fresh credentials and fresh failure detection.

use std::sync::{Arc, Mutex};

use thiserror::Error;

/// Failure to acquire an authenticated client.
///
/// Clonable so that the broker can hand the same cached failure to every
/// caller within a cycle.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("authentication failed: {message}")]
pub struct AuthError {
    pub message: String,
}

impl AuthError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// An authenticated client for the identity service.
pub trait IdentityClient: Send + Sync {
    /// Resolves the id of the project with the given name.
    fn find_project_id(&self, name: &str) -> anyhow::Result<String>;
}

/// Produces authenticated identity clients. Implemented by the deployment's
/// credential plumbing (out of scope here).
pub trait CredentialSource: Send + Sync {
    fn new_client(&self) -> Result<Arc<dyn IdentityClient>, AuthError>;
}

enum CycleState {
    /// No acquisition attempted yet in this cycle.
    Unset,
    Ready(Arc<dyn IdentityClient>),
    Failed(AuthError),
}

/// Per-cycle memoization of an authenticated identity client.
pub struct CredentialBroker {
    source: Box<dyn CredentialSource>,
    state: Mutex<CycleState>,
}

impl CredentialBroker {
    pub fn new(source: Box<dyn CredentialSource>) -> Self {
        Self {
            source,
            state: Mutex::new(CycleState::Unset),
        }
    }

    /// Returns a ready client, acquiring one on the first call of the cycle.
    ///
    /// Both outcomes are memoized: a success is reused for the rest of the
    /// cycle, a failure is returned verbatim on every subsequent call until
    /// [`reset_for_cycle`](Self::reset_for_cycle).
    pub fn get(&self) -> Result<Arc<dyn IdentityClient>, AuthError> {
        let mut state = self.state.lock().unwrap();
        if let CycleState::Unset = *state {
            *state = match self.source.new_client() {
                Ok(client) => CycleState::Ready(client),
                Err(e) => CycleState::Failed(e),
            };
        }
        match &*state {
            CycleState::Ready(client) => Ok(Arc::clone(client)),
            CycleState::Failed(e) => Err(e.clone()),
            CycleState::Unset => unreachable!("state is set above"),
        }
    }

    /// Drops the cached client and the cached failure.
    ///
    /// Call once at the start of every polling interval.
    pub fn reset_for_cycle(&self) {
        *self.state.lock().unwrap() = CycleState::Unset;
    }
}
