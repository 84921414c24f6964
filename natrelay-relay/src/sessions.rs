//! Pool of backend sessions handed out to clients one at a time.

use crate::registry::ClientId;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

pub type SessionId = String;

#[derive(Default)]
struct Pool {
    available: VecDeque<SessionId>,
    by_client: HashMap<ClientId, SessionId>,
    by_session: HashMap<SessionId, ClientId>,
}

/// A session is either available or assigned to exactly one client, and a
/// client holds at most one session.
#[derive(Default)]
pub struct SessionPool {
    pool: Mutex<Pool>,
}

impl SessionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a session the backend reported. Known sessions are ignored.
    pub fn add_available(&self, session: SessionId) -> bool {
        let mut pool = self.pool.lock();
        if pool.by_session.contains_key(&session) || pool.available.contains(&session) {
            return false;
        }
        log::debug!(
            "session {} available (pool size {})",
            session,
            pool.available.len() + 1
        );
        pool.available.push_back(session);
        true
    }

    /// Gives `client` a session: the one it already holds, or the oldest
    /// available one.
    pub fn assign(&self, client: &str) -> Option<SessionId> {
        let mut pool = self.pool.lock();
        if let Some(existing) = pool.by_client.get(client) {
            return Some(existing.clone());
        }
        let session = pool.available.pop_front()?;
        pool.by_client.insert(client.to_string(), session.clone());
        pool.by_session.insert(session.clone(), client.to_string());
        log::info!(
            "assigned session {} to client {} ({} left)",
            session,
            client,
            pool.available.len()
        );
        Some(session)
    }

    /// Returns `client`'s session to the pool.
    pub fn release(&self, client: &str) -> Option<SessionId> {
        let mut pool = self.pool.lock();
        let session = pool.by_client.remove(client)?;
        pool.by_session.remove(&session);
        pool.available.push_back(session.clone());
        log::debug!("client {} released session {}", client, session);
        Some(session)
    }

    /// Forgets a session the backend tore down. Returns the client that held it.
    pub fn remove(&self, session: &str) -> Option<ClientId> {
        let mut pool = self.pool.lock();
        pool.available.retain(|s| s != session);
        let owner = pool.by_session.remove(session)?;
        pool.by_client.remove(&owner);
        Some(owner)
    }

    /// Drops every session, e.g. when the backend is replaced. Returns the
    /// clients that lost theirs.
    pub fn invalidate(&self) -> Vec<ClientId> {
        let mut pool = self.pool.lock();
        pool.available.clear();
        pool.by_session.clear();
        let mut affected: Vec<ClientId> = pool.by_client.drain().map(|(client, _)| client).collect();
        affected.sort();
        affected
    }

    pub fn owner_of(&self, session: &str) -> Option<ClientId> {
        self.pool.lock().by_session.get(session).cloned()
    }

    pub fn session_of(&self, client: &str) -> Option<SessionId> {
        self.pool.lock().by_client.get(client).cloned()
    }

    pub fn available_count(&self) -> usize {
        self.pool.lock().available.len()
    }

    pub fn assigned_count(&self) -> usize {
        self.pool.lock().by_client.len()
    }

    #[cfg(test)]
    fn check_invariants(&self) {
        let pool = self.pool.lock();
        assert_eq!(pool.by_client.len(), pool.by_session.len());
        for (client, session) in &pool.by_client {
            assert_eq!(pool.by_session.get(session), Some(client));
            assert!(!pool.available.contains(session));
        }
        let mut seen = std::collections::HashSet::new();
        for session in &pool.available {
            assert!(seen.insert(session), "session {session} listed twice");
        }
    }
}
