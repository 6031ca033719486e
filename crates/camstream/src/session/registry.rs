//! Identifier-keyed session tables
//!
//! An id is in at most one of three places: pending (prepared), starting
//! (claimed by a `start` in flight) or ongoing (backend and transcoder live).

use super::{PendingSessionInfo, StreamSession};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

struct Tables<S> {
    pending: HashMap<String, PendingSessionInfo>,
    starting: HashMap<String, StartClaim>,
    ongoing: HashMap<String, S>,
    next_generation: u64,
}

/// A `start` in flight for one id
///
/// Each claim carries its own generation, so a start that was stopped
/// cannot act on the claim of a later start for the same id.
#[derive(Debug, Clone)]
pub struct StartClaim {
    generation: u64,
    token: CancellationToken,
}

impl StartClaim {
    /// Cancelled when the session is stopped while starting
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    fn same(&self, other: &StartClaim) -> bool {
        self.generation == other.generation
    }
}

/// Session registry owned by the engine
pub struct SessionRegistry<S = Arc<StreamSession>> {
    tables: Mutex<Tables<S>>,
}

impl<S: Clone> Default for SessionRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Clone> SessionRegistry<S> {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables {
                pending: HashMap::new(),
                starting: HashMap::new(),
                ongoing: HashMap::new(),
                next_generation: 0,
            }),
        }
    }

    /// Record a prepared session. Re-preparing a pending id replaces it.
    ///
    /// # Errors
    ///
    /// [`Error::SessionError`] if the id is starting or active.
    pub fn prepare(&self, info: PendingSessionInfo) -> Result<()> {
        let mut tables = self.tables.lock();
        let id = info.session_id.clone();
        if tables.starting.contains_key(&id) || tables.ongoing.contains_key(&id) {
            return Err(Error::SessionError(format!("session {} is already active", id)));
        }
        if tables.pending.insert(id.clone(), info).is_some() {
            debug!("Session {} re-prepared", id);
        }
        Ok(())
    }

    /// Claim a pending session for `start`.
    ///
    /// The pending entry is removed whatever the outcome of the start. The
    /// claim's token is cancelled if the session is stopped meanwhile.
    ///
    /// # Errors
    ///
    /// [`Error::SessionNotFound`] if the id was never prepared or another
    /// start already claimed it.
    pub fn begin_start(&self, session_id: &str) -> Result<(PendingSessionInfo, StartClaim)> {
        let mut tables = self.tables.lock();
        let info = tables
            .pending
            .remove(session_id)
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
        tables.next_generation += 1;
        let claim = StartClaim {
            generation: tables.next_generation,
            token: CancellationToken::new(),
        };
        tables.starting.insert(session_id.to_string(), claim.clone());
        Ok((info, claim))
    }

    /// Promote a starting session to ongoing.
    ///
    /// Hands the session back if `claim` was stopped or is no longer the
    /// claim on record; the caller must tear it down.
    pub fn activate(
        &self,
        session_id: &str,
        claim: &StartClaim,
        session: S,
    ) -> std::result::Result<(), S> {
        let mut tables = self.tables.lock();
        let current = tables
            .starting
            .get(session_id)
            .is_some_and(|held| held.same(claim));
        if !current || claim.is_cancelled() {
            return Err(session);
        }
        tables.starting.remove(session_id);
        tables.ongoing.insert(session_id.to_string(), session);
        Ok(())
    }

    /// Drop `claim` after a failed start. A later claim on the same id is kept.
    pub fn abandon(&self, session_id: &str, claim: &StartClaim) {
        let mut tables = self.tables.lock();
        if tables
            .starting
            .get(session_id)
            .is_some_and(|held| held.same(claim))
        {
            tables.starting.remove(session_id);
        }
    }

    /// Remove every trace of `session_id`, cancelling an in-flight start.
    ///
    /// Returns the active session, if any, for teardown.
    pub fn stop(&self, session_id: &str) -> Option<S> {
        let mut tables = self.tables.lock();
        if tables.pending.remove(session_id).is_some() {
            debug!("Session {} dropped before start", session_id);
        }
        if let Some(claim) = tables.starting.remove(session_id) {
            debug!("Session {} cancelled while starting", session_id);
            claim.token.cancel();
        }
        tables.ongoing.remove(session_id)
    }

    /// Remove an active session only if `matches` holds for it
    pub fn remove_if(&self, session_id: &str, matches: impl FnOnce(&S) -> bool) -> Option<S> {
        let mut tables = self.tables.lock();
        if tables.ongoing.get(session_id).is_some_and(matches) {
            return tables.ongoing.remove(session_id);
        }
        None
    }

    /// Empty all tables, cancelling in-flight starts
    pub fn drain(&self) -> Vec<S> {
        let mut tables = self.tables.lock();
        tables.pending.clear();
        for (_, claim) in tables.starting.drain() {
            claim.token.cancel();
        }
        tables.ongoing.drain().map(|(_, session)| session).collect()
    }

    pub fn get(&self, session_id: &str) -> Option<S> {
        self.tables.lock().ongoing.get(session_id).cloned()
    }

    pub fn is_pending(&self, session_id: &str) -> bool {
        self.tables.lock().pending.contains_key(session_id)
    }

    pub fn is_starting(&self, session_id: &str) -> bool {
        self.tables.lock().starting.contains_key(session_id)
    }

    pub fn is_ongoing(&self, session_id: &str) -> bool {
        self.tables.lock().ongoing.contains_key(session_id)
    }

    /// Ids of active sessions, sorted
    pub fn active_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tables.lock().ongoing.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn pending_count(&self) -> usize {
        self.tables.lock().pending.len()
    }

    pub fn ongoing_count(&self) -> usize {
        self.tables.lock().ongoing.len()
    }
}
