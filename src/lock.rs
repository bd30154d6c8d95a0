//! TTL-bounded performer lock over the store's set-if-absent keys.
//!
//! A holder that crashes without releasing is healed by the TTL. A
//! [`LockGuard`] owns a unique token: it can only extend or release the key
//! while the key still carries that token.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::store::StreamStore;

pub fn performer_key(performer_id: impl Display) -> String {
    format!("performer:busy:{performer_id}")
}

#[derive(Clone)]
pub struct PerformerLock {
    store: Arc<dyn StreamStore>,
    ttl: Duration,
}

impl PerformerLock {
    pub fn new(store: Arc<dyn StreamStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// `Ok(true)` if this call took the lock, `Ok(false)` if someone holds it.
    pub async fn acquire(&self, performer_id: impl Display) -> Result<bool> {
        let key = performer_key(performer_id);
        let acquired = self.store.set_if_absent(&key, "1", self.ttl).await?;
        debug!(key, acquired, "performer lock");
        Ok(acquired)
    }

    pub async fn release(&self, performer_id: impl Display) -> Result<()> {
        self.store.delete_key(&performer_key(performer_id)).await
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Acquire and hand back a guard that releases on every exit path.
    pub async fn try_lock(&self, performer_id: impl Display) -> Result<Option<LockGuard>> {
        let lease = Lease {
            store: Arc::clone(&self.store),
            key: performer_key(performer_id),
            token: Uuid::new_v4().to_string(),
            ttl: self.ttl,
        };
        if self
            .store
            .set_if_absent(&lease.key, &lease.token, self.ttl)
            .await?
        {
            Ok(Some(LockGuard { lease: Some(lease) }))
        } else {
            Ok(None)
        }
    }
}

/// The renewable half of a held lock, for heartbeat tasks.
#[derive(Clone)]
pub struct Lease {
    store: Arc<dyn StreamStore>,
    key: String,
    token: String,
    ttl: Duration,
}

impl Lease {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Push the expiry a full TTL out. `Ok(false)` means the lock expired or
    /// passed to another holder.
    pub async fn refresh(&self) -> Result<bool> {
        self.store.extend_key(&self.key, &self.token, self.ttl).await
    }

    async fn release(&self) -> Result<()> {
        let released = self.store.delete_key_if(&self.key, &self.token).await?;
        if !released {
            debug!(key = %self.key, "lock already expired or taken over, nothing to release");
        }
        Ok(())
    }
}

/// Held performer lock.
///
/// Prefer [`LockGuard::release`]; dropping the guard releases in a
/// background task instead. Release never deletes a key that another holder
/// took over after this one expired.
pub struct LockGuard {
    lease: Option<Lease>,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        self.lease.as_ref().map(Lease::key).unwrap_or_default()
    }

    pub fn lease(&self) -> Option<Lease> {
        self.lease.clone()
    }

    pub async fn release(mut self) -> Result<()> {
        match self.lease.take() {
            Some(lease) => lease.release().await,
            None => Ok(()),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(lease) = self.lease.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = lease.release().await {
                        warn!(key = %lease.key, error = %e, "failed to release lock on drop");
                    }
                });
            }
            Err(_) => warn!(key = %lease.key, "no runtime to release lock; it will expire by ttl"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn second_acquire_fails_until_release() {
        let lock = PerformerLock::new(Arc::new(MemoryStore::new()), Duration::from_secs(60));
        assert!(lock.acquire(7).await.unwrap());
        assert!(!lock.acquire(7).await.unwrap());
        assert!(lock.acquire(8).await.unwrap());
        lock.release(7).await.unwrap();
        assert!(lock.acquire(7).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_lock_expires() {
        let lock = PerformerLock::new(Arc::new(MemoryStore::new()), Duration::from_secs(900));
        assert!(lock.acquire(1).await.unwrap());
        tokio::time::advance(Duration::from_secs(901)).await;
        assert!(lock.acquire(1).await.unwrap());
    }

    #[tokio::test]
    async fn guard_releases() {
        let store = Arc::new(MemoryStore::new());
        let lock = PerformerLock::new(store.clone(), Duration::from_secs(60));
        let guard = lock.try_lock("job-1").await.unwrap().unwrap();
        assert_eq!(guard.key(), "performer:busy:job-1");
        assert!(lock.try_lock("job-1").await.unwrap().is_none());
        guard.release().await.unwrap();
        assert!(store.get_key("performer:busy:job-1").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_keeps_the_lock_past_its_ttl() {
        let store = Arc::new(MemoryStore::new());
        let lock = PerformerLock::new(store.clone(), Duration::from_secs(60));
        let guard = lock.try_lock("job-2").await.unwrap().unwrap();
        let lease = guard.lease().unwrap();

        for _ in 0..5 {
            tokio::time::advance(Duration::from_secs(40)).await;
            assert!(lease.refresh().await.unwrap());
        }
        assert!(lock.try_lock("job-2").await.unwrap().is_none());
        assert_eq!(
            store.get_key("performer:busy:job-2").await.as_deref(),
            Some(lease.token())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn expired_holder_cannot_release_a_successor() {
        let store = Arc::new(MemoryStore::new());
        let lock = PerformerLock::new(store.clone(), Duration::from_secs(60));
        let stale = lock.try_lock("job-3").await.unwrap().unwrap();
        let stale_lease = stale.lease().unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;
        let current = lock.try_lock("job-3").await.unwrap().unwrap();
        let current_token = current.lease().unwrap().token().to_string();
        assert_ne!(stale_lease.token(), current_token);

        assert!(!stale_lease.refresh().await.unwrap());
        stale.release().await.unwrap();
        assert_eq!(
            store.get_key("performer:busy:job-3").await,
            Some(current_token)
        );
        current.release().await.unwrap();
        assert!(store.get_key("performer:busy:job-3").await.is_none());
    }
}
