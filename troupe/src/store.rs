//! In-memory tracker store.
//!
//! Maps session ids to trackers. The outer map supports concurrent
//! get-or-create; each tracker is wrapped in its own async lock, which the
//! bot holds for the whole turn so turns for one session fully serialize
//! while different sessions progress in parallel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::Mutex as AsyncMutex;

use crate::tracker::Tracker;

/// Shared handle to one session's tracker.
pub type SharedTracker = Arc<AsyncMutex<Tracker>>;

/// In-memory session-id → tracker map.
#[derive(Debug, Default)]
pub struct TrackerStore {
    sessions: Mutex<HashMap<String, SharedTracker>>,
}

impl TrackerStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the session's tracker, creating it with `make` on first use.
    ///
    /// The critical section covers only the map access, so concurrent
    /// creators for different sessions never contend and concurrent creators
    /// for the same session agree on one tracker.
    pub fn get_or_create(
        &self,
        user_id: &str,
        make: impl FnOnce(&str) -> Tracker,
    ) -> SharedTracker {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            sessions
                .entry(user_id.to_owned())
                .or_insert_with(|| Arc::new(AsyncMutex::new(make(user_id)))),
        )
    }

    /// Fetch an existing session's tracker.
    #[must_use]
    pub fn retrieve(&self, user_id: &str) -> Option<SharedTracker> {
        let sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        sessions.get(user_id).map(Arc::clone)
    }

    /// Snapshot-copy a session's state for diagnostics.
    pub async fn snapshot(&self, user_id: &str) -> Option<Tracker> {
        let tracker = self.retrieve(user_id)?;
        let guard = tracker.lock().await;
        Some(guard.clone())
    }

    /// Number of known sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no session exists yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
