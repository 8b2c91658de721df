//! Connections and the shared session pool.
//!
//! A connection mediates access to a remote store: credentials plus a
//! bounded pool of underlying sessions. The pool hands out RAII leases, so
//! a session returns to the idle list on every exit path. Idle sessions
//! older than `max_idle_time` are evicted on the next acquisition, and the
//! factory produces a single session at a time.

use crate::error::Result;
use crate::id::ConnectionId;
use async_trait::async_trait;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex as AsyncMutex, OwnedSemaphorePermit, Semaphore};
use tracing::debug;

#[async_trait]
pub trait Connection: Send + Sync {
    fn id(&self) -> ConnectionId;

    /// One cheap call validating the connection during the prepare phase.
    async fn test(&self) -> Result<()>;
}

#[async_trait]
pub trait SessionFactory<S: Send>: Send + Sync {
    async fn create(&self) -> Result<S>;
}

struct IdleSession<S> {
    session: S,
    parked_at: Instant,
}

pub struct ConnectionPool<S: Send + 'static> {
    factory: Box<dyn SessionFactory<S>>,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<IdleSession<S>>>,
    create_lock: AsyncMutex<()>,
    max_idle_time: Duration,
}

impl<S: Send + 'static> ConnectionPool<S> {
    pub fn new(
        max_size: usize,
        max_idle_time: Duration,
        factory: Box<dyn SessionFactory<S>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            factory,
            permits: Arc::new(Semaphore::new(max_size.max(1))),
            idle: Mutex::new(Vec::new()),
            create_lock: AsyncMutex::new(()),
            max_idle_time,
        })
    }

    /// Acquires a session lease, waiting when the pool is exhausted.
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledSession<S>> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| anyhow::anyhow!("connection pool closed: {}", e))?;

        let reused = {
            let mut idle = self.idle.lock().expect("pool idle list poisoned");
            let before = idle.len();
            idle.retain(|s| s.parked_at.elapsed() < self.max_idle_time);
            let evicted = before - idle.len();
            if evicted > 0 {
                debug!(evicted, "evicted idle sessions past max_idle_time");
            }
            idle.pop().map(|s| s.session)
        };

        let session = match reused {
            Some(s) => s,
            None => {
                let _guard = self.create_lock.lock().await;
                self.factory.create().await?
            }
        };

        Ok(PooledSession {
            session: Some(session),
            pool: Arc::clone(self),
            _permit: permit,
        })
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().expect("pool idle list poisoned").len()
    }

    fn park(&self, session: S) {
        self.idle
            .lock()
            .expect("pool idle list poisoned")
            .push(IdleSession {
                session,
                parked_at: Instant::now(),
            });
    }
}

/// RAII lease on a pooled session.
pub struct PooledSession<S: Send + 'static> {
    session: Option<S>,
    pool: Arc<ConnectionPool<S>>,
    _permit: OwnedSemaphorePermit,
}

impl<S: Send + 'static> Deref for PooledSession<S> {
    type Target = S;

    fn deref(&self) -> &S {
        self.session.as_ref().expect("session taken")
    }
}

impl<S: Send + 'static> DerefMut for PooledSession<S> {
    fn deref_mut(&mut self) -> &mut S {
        self.session.as_mut().expect("session taken")
    }
}

impl<S: Send + 'static> Drop for PooledSession<S> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.pool.park(session);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingFactory {
        created: AtomicUsize,
    }

    #[async_trait]
    impl SessionFactory<usize> for CountingFactory {
        async fn create(&self) -> Result<usize> {
            Ok(self.created.fetch_add(1, Ordering::SeqCst))
        }
    }

    fn pool(max_size: usize, max_idle: Duration) -> Arc<ConnectionPool<usize>> {
        ConnectionPool::new(
            max_size,
            max_idle,
            Box::new(CountingFactory {
                created: AtomicUsize::new(0),
            }),
        )
    }

    #[tokio::test]
    async fn leases_return_to_the_idle_list_on_drop() {
        let pool = pool(2, Duration::from_secs(60));
        let lease = pool.acquire().await.unwrap();
        assert_eq!(*lease, 0);
        drop(lease);
        assert_eq!(pool.idle_count(), 1);

        // the parked session is reused instead of creating a new one
        let lease = pool.acquire().await.unwrap();
        assert_eq!(*lease, 0);
    }

    #[tokio::test]
    async fn bounded_size_blocks_until_a_lease_is_released() {
        let pool = pool(1, Duration::from_secs(60));
        let lease = pool.acquire().await.unwrap();
        let second = tokio::time::timeout(Duration::from_millis(50), pool.acquire()).await;
        assert!(second.is_err(), "second acquire should wait");
        drop(lease);
        let lease = tokio::time::timeout(Duration::from_millis(50), pool.acquire())
            .await
            .expect("acquire after release")
            .unwrap();
        assert_eq!(*lease, 0);
    }

    #[tokio::test]
    async fn idle_sessions_are_evicted_after_max_idle_time() {
        let pool = pool(1, Duration::from_millis(10));
        drop(pool.acquire().await.unwrap());
        assert_eq!(pool.idle_count(), 1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let lease = pool.acquire().await.unwrap();
        // session 0 was evicted, the factory created session 1
        assert_eq!(*lease, 1);
    }
}
