//! Session registry
//!
//! Maps opaque session identifiers to live connection handles. The
//! registry is bounded by `max_sessions` and forgets sessions that sit
//! idle longer than `idle`; expired handles are handed back to the
//! caller so it can close them outside the lock.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt::Write as _;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Bytes of entropy in a session id (hex encoded, so twice as many chars).
const SESSION_ID_BYTES: usize = 32;

struct SessionEntry<H> {
    handle: H,
    last_used: Instant,
}

pub struct SessionRegistry<H> {
    sessions: Mutex<HashMap<String, SessionEntry<H>>>,
    max_sessions: usize,
    idle: Duration,
}

impl<H: Clone> SessionRegistry<H> {
    #[must_use]
    pub fn new(max_sessions: usize, idle: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            max_sessions,
            idle,
        }
    }

    /// Register a handle under a freshly generated id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionLimit`] if the registry is full.
    pub fn create(&self, handle: H) -> Result<String> {
        let mut sessions = self.lock();
        if sessions.len() >= self.max_sessions {
            return Err(Error::SessionLimit(self.max_sessions));
        }

        loop {
            match sessions.entry(generate_session_id()) {
                Entry::Occupied(_) => {}
                Entry::Vacant(slot) => {
                    let id = slot.key().clone();
                    slot.insert(SessionEntry {
                        handle,
                        last_used: Instant::now(),
                    });
                    return Ok(id);
                }
            }
        }
    }

    /// Resolve a session id and refresh its idle clock.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSession`] if the id is unknown or expired.
    pub fn get(&self, id: &str) -> Result<H> {
        let mut sessions = self.lock();
        let entry = sessions.get_mut(id).ok_or(Error::InvalidSession)?;
        if entry.last_used.elapsed() > self.idle {
            return Err(Error::InvalidSession);
        }
        entry.last_used = Instant::now();
        Ok(entry.handle.clone())
    }

    pub fn remove(&self, id: &str) -> Option<H> {
        self.lock().remove(id).map(|entry| entry.handle)
    }

    /// Remove and return every session idle longer than the limit.
    pub fn take_expired(&self) -> Vec<H> {
        let mut sessions = self.lock();
        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, entry)| entry.last_used.elapsed() > self.idle)
            .map(|(id, _)| id.clone())
            .collect();

        if !expired.is_empty() {
            debug!(count = expired.len(), "Expiring idle sessions");
        }
        expired
            .iter()
            .filter_map(|id| sessions.remove(id))
            .map(|entry| entry.handle)
            .collect()
    }

    /// Remove and return every session.
    pub fn drain(&self) -> Vec<H> {
        self.lock().drain().map(|(_, entry)| entry.handle).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, SessionEntry<H>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn generate_session_id() -> String {
    let bytes: [u8; SESSION_ID_BYTES] = rand::random();
    bytes
        .iter()
        .fold(String::with_capacity(SESSION_ID_BYTES * 2), |mut id, b| {
            let _ = write!(id, "{b:02x}");
            id
        })
}
