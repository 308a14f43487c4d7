use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Redis(#[from] redis::RedisError),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
    #[error("session store unavailable")]
    Poisoned,
}

/// Server side half of an upstream-refreshable session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Upstream refresh token, encrypted with the session key held in the
    /// client's refresh cookie.
    pub refresh_token: Option<String>,
    /// Unix seconds.
    pub access_token_expiry: i64,
    /// Unix seconds. The record is gone after this.
    pub expires_at: i64,
}

impl SessionRecord {
    /// Clamps the access token expiry to the record's own lifetime.
    pub fn new(refresh_token: Option<String>, access_token_expiry: i64, expires_at: i64) -> Self {
        Self {
            refresh_token,
            access_token_expiry: access_token_expiry.min(expires_at),
            expires_at,
        }
    }

    pub fn ttl(&self, now: i64) -> Option<Duration> {
        let remaining = self.expires_at - now;
        (remaining > 0).then(|| Duration::from_secs(remaining as u64))
    }
}

/// An advisory lock on one session id. Expires on its own after its TTL.
#[derive(Clone, Debug, PartialEq)]
pub struct Lease {
    pub session_id: String,
    pub token: String,
}

impl Lease {
    pub fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            token: Uuid::new_v4().to_string(),
        }
    }
}

pub fn session_key(username: &str, session_id: &str) -> String {
    format!("session:{username}:{session_id}")
}

pub fn lock_key(session_id: &str) -> String {
    format!("session-lock:{session_id}")
}

#[async_trait]
pub trait SessionStore: Send + Sync + 'static {
    async fn put_session(
        &self,
        username: &str,
        session_id: &str,
        record: &SessionRecord,
    ) -> Result<(), StoreError>;
    async fn get_session(
        &self,
        username: &str,
        session_id: &str,
    ) -> Result<Option<SessionRecord>, StoreError>;
    async fn delete_session(&self, username: &str, session_id: &str) -> Result<(), StoreError>;
    /// Atomic conditional insert. `None` when someone else holds the lock.
    async fn try_lock(&self, session_id: &str, ttl: Duration) -> Result<Option<Lease>, StoreError>;
    /// Idempotent. Only removes the lock if it is still ours.
    async fn unlock(&self, lease: &Lease) -> Result<(), StoreError>;
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Single process store for deployments without redis, and for tests.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<String, SessionRecord>>,
    locks: Mutex<HashMap<String, (String, Instant)>>,
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn put_session(
        &self,
        username: &str,
        session_id: &str,
        record: &SessionRecord,
    ) -> Result<(), StoreError> {
        let mut sessions = self.sessions.lock().map_err(|_| StoreError::Poisoned)?;
        sessions.insert(session_key(username, session_id), record.clone());
        Ok(())
    }

    async fn get_session(
        &self,
        username: &str,
        session_id: &str,
    ) -> Result<Option<SessionRecord>, StoreError> {
        let now = chrono::Utc::now().timestamp();
        let mut sessions = self.sessions.lock().map_err(|_| StoreError::Poisoned)?;
        let key = session_key(username, session_id);
        match sessions.get(&key) {
            Some(record) if record.expires_at > now => Ok(Some(record.clone())),
            Some(_) => {
                sessions.remove(&key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn delete_session(&self, username: &str, session_id: &str) -> Result<(), StoreError> {
        let mut sessions = self.sessions.lock().map_err(|_| StoreError::Poisoned)?;
        sessions.remove(&session_key(username, session_id));
        Ok(())
    }

    async fn try_lock(&self, session_id: &str, ttl: Duration) -> Result<Option<Lease>, StoreError> {
        let mut locks = self.locks.lock().map_err(|_| StoreError::Poisoned)?;
        let key = lock_key(session_id);
        if let Some((_, expires)) = locks.get(&key) {
            if *expires > Instant::now() {
                return Ok(None);
            }
        }
        let lease = Lease::new(session_id);
        locks.insert(key, (lease.token.clone(), Instant::now() + ttl));
        Ok(Some(lease))
    }

    async fn unlock(&self, lease: &Lease) -> Result<(), StoreError> {
        let mut locks = self.locks.lock().map_err(|_| StoreError::Poisoned)?;
        let key = lock_key(&lease.session_id);
        if locks.get(&key).is_some_and(|(token, _)| *token == lease.token) {
            locks.remove(&key);
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
