//! Lock: exclusive ownership of a key, held by a session.
//!
//! Acquisition is a compare-and-swap on the key's holder. Leadership is
//! never cached: [`Lock::is_leader`] re-reads the key with a consistent
//! query every time, because the backend may hand the key to someone else
//! as soon as our session is invalidated.

use std::sync::{Arc, Mutex};

use extsvc_backend::{Backend, KvPair, QueryOptions};
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::session::Session;

#[derive(Clone)]
struct Holder {
    session: Arc<Session>,
    /// Created by this lock, so destroyed with it.
    owned: bool,
}

pub struct Lock {
    key: String,
    backend: Arc<dyn Backend>,
    session_config: SessionConfig,
    holder: Mutex<Option<Holder>>,
}

impl Lock {
    /// Create a lock on `key`, creating the key with an empty value if it
    /// does not exist yet.
    pub async fn new(
        backend: Arc<dyn Backend>,
        key: impl Into<String>,
        session_config: SessionConfig,
    ) -> Result<Self> {
        let key = key.into();
        if key.is_empty() {
            return Err(Error::EmptyLockKey);
        }
        if backend
            .kv_get(&key, &QueryOptions::consistent())
            .await?
            .is_none()
        {
            backend.kv_put(&key, &[]).await?;
            debug!(%key, "lock key created");
        }
        Ok(Self {
            key,
            backend,
            session_config,
            holder: Mutex::new(None),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Session currently held by this lock, if any.
    pub fn session(&self) -> Option<Arc<Session>> {
        self.holder().map(|h| h.session)
    }

    fn holder(&self) -> Option<Holder> {
        self.holder.lock().ok().and_then(|h| h.clone())
    }

    fn set_holder(&self, holder: Option<Holder>) {
        if let Ok(mut slot) = self.holder.lock() {
            *slot = holder;
        }
    }

    /// Try to take the lock.
    ///
    /// Uses the session already held, else adopts `session`, else creates
    /// and owns a new one. Fails with `AlreadyHeld` if another session holds
    /// the key.
    pub async fn acquire(&self, session: Option<Arc<Session>>) -> Result<()> {
        if self.is_leader().await {
            return Ok(());
        }

        let mut current = self.holder();
        if let Some(stale) = current.as_ref().filter(|h| h.owned) {
            // Our own lease expired; a stale session can never acquire again.
            if stale.session.is_destroyed().await {
                info!(key = %self.key, session = %stale.session.id(), "replacing expired session");
                if let Err(e) = stale.session.destroy().await {
                    warn!(key = %self.key, error = %e, "failed to clean up expired session");
                }
                self.set_holder(None);
                current = None;
            }
        }
        let holder = match current {
            Some(holder) => holder,
            None => self.new_holder(session).await?,
        };

        let pair = self.read().await?;
        let acquired = self
            .backend
            .kv_acquire(&self.key, &pair.value, holder.session.id())
            .await?;
        if acquired {
            info!(key = %self.key, session = %holder.session.id(), "lock acquired");
            Ok(())
        } else {
            debug!(key = %self.key, holder = ?pair.session, "lock held elsewhere");
            Err(Error::AlreadyHeld(self.key.clone()))
        }
    }

    async fn new_holder(&self, session: Option<Arc<Session>>) -> Result<Holder> {
        let holder = match session {
            Some(session) => Holder {
                session,
                owned: false,
            },
            None => Holder {
                session: Arc::new(
                    Session::create(Arc::clone(&self.backend), None, &self.session_config).await?,
                ),
                owned: true,
            },
        };
        self.set_holder(Some(holder.clone()));
        Ok(holder)
    }

    async fn read(&self) -> Result<KvPair> {
        self.backend
            .kv_get(&self.key, &QueryOptions::consistent())
            .await?
            .ok_or_else(|| Error::NoSuchKey(self.key.clone()))
    }

    /// Whether our session currently holds the key. False on any error.
    pub async fn is_leader(&self) -> bool {
        let Some(holder) = self.holder() else {
            return false;
        };
        match self.read().await {
            Ok(pair) => pair.session.as_deref() == Some(holder.session.id()),
            Err(e) => {
                debug!(key = %self.key, error = %e, "leadership check failed");
                false
            }
        }
    }

    /// Like [`is_leader`](Self::is_leader), but says why not.
    pub async fn is_locked(&self) -> Result<()> {
        let holder = self
            .holder()
            .ok_or_else(|| Error::NoSession(self.key.clone()))?;
        let pair = self.read().await?;
        match pair.session {
            None => Err(Error::NotLocked(self.key.clone())),
            Some(id) if id == holder.session.id() => Ok(()),
            Some(id) => Err(Error::LockedByOther {
                key: self.key.clone(),
                holder: id,
            }),
        }
    }

    /// Whether nobody holds the key. Read errors count as unlocked.
    pub async fn is_unlocked(&self) -> bool {
        match self.backend.kv_get(&self.key, &QueryOptions::consistent()).await {
            Ok(Some(pair)) => pair.session.is_none(),
            _ => true,
        }
    }

    /// Release the key. Succeeds if nobody holds it.
    pub async fn release(&self) -> Result<()> {
        let pair = self.read().await?;
        if pair.session.is_none() {
            return Ok(());
        }
        let holder = self
            .holder()
            .ok_or_else(|| Error::ReleaseRejected(self.key.clone()))?;
        if self
            .backend
            .kv_release(&self.key, holder.session.id())
            .await?
        {
            info!(key = %self.key, session = %holder.session.id(), "lock released");
            Ok(())
        } else {
            Err(Error::ReleaseRejected(self.key.clone()))
        }
    }

    /// Release if leader, then destroy the session if this lock created it.
    pub async fn destroy(&self) -> Result<()> {
        if self.is_leader().await {
            self.release().await?;
        }
        if let Some(holder) = self.holder() {
            if holder.owned {
                holder.session.destroy().await?;
            }
            self.set_holder(None);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use extsvc_backend::InMemoryBackend;

    fn backend() -> Arc<dyn Backend> {
        Arc::new(InMemoryBackend::new("agent-1"))
    }

    #[tokio::test]
    async fn empty_key_is_rejected() {
        let err = Lock::new(backend(), "", SessionConfig::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::EmptyLockKey));
    }

    #[tokio::test]
    async fn new_creates_missing_key() {
        let backend = backend();
        let lock = Lock::new(backend.clone(), "locks/a", SessionConfig::default())
            .await
            .unwrap();
        let pair = backend
            .kv_get("locks/a", &QueryOptions::consistent())
            .await
            .unwrap()
            .unwrap();
        assert!(pair.value.is_empty());
        assert!(lock.is_unlocked().await);
        assert!(!lock.is_leader().await);
        assert!(matches!(lock.is_locked().await, Err(Error::NoSession(_))));
    }

    #[tokio::test]
    async fn acquire_release_cycle() {
        let backend = backend();
        let lock = Lock::new(backend, "locks/a", SessionConfig::default())
            .await
            .unwrap();
        lock.acquire(None).await.unwrap();
        assert!(lock.is_leader().await);
        assert!(!lock.is_unlocked().await);
        lock.is_locked().await.unwrap();

        // Acquiring again while leader is a no-op.
        lock.acquire(None).await.unwrap();

        lock.release().await.unwrap();
        assert!(!lock.is_leader().await);
        assert!(matches!(lock.is_locked().await, Err(Error::NotLocked(_))));
        // Releasing an unheld key is fine.
        lock.release().await.unwrap();
        lock.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn second_lock_sees_contention() {
        let backend = backend();
        let a = Lock::new(backend.clone(), "locks/a", SessionConfig::default())
            .await
            .unwrap();
        let b = Lock::new(backend.clone(), "locks/a", SessionConfig::default())
            .await
            .unwrap();
        a.acquire(None).await.unwrap();

        let err = b.acquire(None).await.unwrap_err();
        assert!(err.is_contention());
        assert!(!b.is_leader().await);
        assert!(matches!(b.is_locked().await, Err(Error::LockedByOther { .. })));
        assert!(matches!(b.release().await, Err(Error::ReleaseRejected(_))));

        a.destroy().await.unwrap();
        b.acquire(None).await.unwrap();
        assert!(b.is_leader().await);
        assert!(!a.is_leader().await);
        b.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn adopted_session_survives_destroy() {
        let backend = backend();
        let session = Arc::new(
            Session::create(backend.clone(), None, &SessionConfig::default())
                .await
                .unwrap(),
        );
        let lock = Lock::new(backend.clone(), "locks/a", SessionConfig::default())
            .await
            .unwrap();
        lock.acquire(Some(session.clone())).await.unwrap();
        assert_eq!(lock.session().unwrap().id(), session.id());

        lock.destroy().await.unwrap();
        assert!(lock.is_unlocked().await);
        assert!(!session.is_destroyed().await);
        session.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn destroy_twice_is_safe() {
        let backend = backend();
        let lock = Lock::new(backend, "locks/a", SessionConfig::default())
            .await
            .unwrap();
        lock.acquire(None).await.unwrap();
        let session = lock.session().unwrap();
        lock.destroy().await.unwrap();
        lock.destroy().await.unwrap();
        assert!(session.is_destroyed().await);
        assert!(lock.session().is_none());
    }

    #[tokio::test]
    async fn acquire_fails_when_key_was_deleted() {
        let backend = backend();
        let lock = Lock::new(backend.clone(), "locks/a", SessionConfig::default())
            .await
            .unwrap();
        backend.kv_delete("locks/a").await.unwrap();
        let err = lock.acquire(None).await.unwrap_err();
        assert!(matches!(err, Error::NoSuchKey(_)));
        lock.destroy().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_leader_loses_lock_after_ttl() {
        let backend = backend();
        let a = Lock::new(backend.clone(), "locks/a", SessionConfig::default())
            .await
            .unwrap();
        let b = Lock::new(backend.clone(), "locks/a", SessionConfig::default())
            .await
            .unwrap();
        a.acquire(None).await.unwrap();
        assert!(b.acquire(None).await.unwrap_err().is_contention());

        // The leader stops passing its TTL check, as a hung process would.
        a.session().unwrap().stop_refresh().await;
        tokio::time::advance(Duration::from_secs(11)).await;

        b.acquire(None).await.unwrap();
        assert!(b.is_leader().await);
        assert!(!a.is_leader().await);
        a.destroy().await.unwrap();
        b.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_acquires_elect_one_leader() {
        let backend = backend();
        let mut locks = Vec::new();
        for _ in 0..4 {
            locks.push(Arc::new(
                Lock::new(backend.clone(), "locks/race", SessionConfig::default())
                    .await
                    .unwrap(),
            ));
        }
        let attempts: Vec<_> = locks
            .iter()
            .map(|lock| {
                let lock = Arc::clone(lock);
                tokio::spawn(async move { lock.acquire(None).await.is_ok() })
            })
            .collect();
        let mut winners = 0;
        for attempt in attempts {
            if attempt.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);

        let mut leaders = 0;
        for lock in &locks {
            if lock.is_leader().await {
                leaders += 1;
            }
        }
        assert_eq!(leaders, 1);
        for lock in &locks {
            lock.destroy().await.unwrap();
        }
    }
}
