use std::{sync::Arc, time::Duration};

use crate::{
    session_store::{Lease, SessionStore},
    AuthError,
};

#[derive(Clone, Copy, Debug)]
pub struct LeasePolicy {
    pub retries: u32,
    pub spacing: Duration,
    pub ttl: Duration,
}

/// Holds a session lock. Release explicitly with `release`; a guard dropped
/// without it (panic, cancelled request) releases in the background.
pub struct LeaseGuard {
    store: Arc<dyn SessionStore>,
    lease: Option<Lease>,
}

impl LeaseGuard {
    pub async fn release(mut self) {
        if let Some(lease) = self.lease.take() {
            if let Err(err) = self.store.unlock(&lease).await {
                // The TTL reclaims it.
                tracing::error!("{err:?}");
            }
        }
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        let Some(lease) = self.lease.take() else {
            return;
        };
        let store = self.store.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(err) = store.unlock(&lease).await {
                    tracing::error!("{err:?}");
                }
            });
        }
    }
}

/// Tries the lock `retries + 1` times, `spacing` apart.
#[tracing::instrument(skip(store), err)]
pub async fn acquire(
    store: &Arc<dyn SessionStore>,
    session_id: &str,
    policy: LeasePolicy,
) -> Result<LeaseGuard, AuthError> {
    for attempt in 0..=policy.retries {
        if let Some(lease) = store.try_lock(session_id, policy.ttl).await? {
            return Ok(LeaseGuard {
                store: store.clone(),
                lease: Some(lease),
            });
        }
        if attempt < policy.retries {
            tokio::time::sleep(policy.spacing).await;
        }
    }
    tracing::warn!("Gave up waiting for the refresh lock on {session_id}");
    Err(AuthError::LockTimeout)
}
