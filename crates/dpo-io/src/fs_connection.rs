//! Local filesystem connection.
//!
//! Mediates access to a base directory through the core connection pool, so
//! file tables sharing a connection also share its session bound. A session
//! is little more than a validated handle on the base directory, which is
//! exactly what the prepare-phase connection test needs.

use anyhow::Context;
use async_trait::async_trait;
use dpo_core::connection::{Connection, ConnectionPool, SessionFactory};
use dpo_core::{ConnectionId, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub struct FsSession {
    base: PathBuf,
}

impl FsSession {
    pub fn base(&self) -> &PathBuf {
        &self.base
    }
}

struct FsSessionFactory {
    base: PathBuf,
}

#[async_trait]
impl SessionFactory<FsSession> for FsSessionFactory {
    async fn create(&self) -> Result<FsSession> {
        std::fs::create_dir_all(&self.base)
            .with_context(|| format!("creating base directory {}", self.base.display()))?;
        debug!(base = %self.base.display(), "filesystem session opened");
        Ok(FsSession {
            base: self.base.clone(),
        })
    }
}

pub struct LocalFsConnection {
    id: ConnectionId,
    base_path: PathBuf,
    pool: Arc<ConnectionPool<FsSession>>,
}

impl LocalFsConnection {
    pub fn new(
        id: impl Into<ConnectionId>,
        base_path: impl Into<PathBuf>,
        max_pool_size: usize,
        max_idle_time: Duration,
    ) -> Self {
        let base_path = base_path.into();
        let pool = ConnectionPool::new(
            max_pool_size,
            max_idle_time,
            Box::new(FsSessionFactory {
                base: base_path.clone(),
            }),
        );
        Self {
            id: id.into(),
            base_path,
            pool,
        }
    }

    pub fn base_path(&self) -> &PathBuf {
        &self.base_path
    }

    pub fn pool(&self) -> &Arc<ConnectionPool<FsSession>> {
        &self.pool
    }
}

#[async_trait]
impl Connection for LocalFsConnection {
    fn id(&self) -> ConnectionId {
        self.id.clone()
    }

    async fn test(&self) -> Result<()> {
        let _session = self.pool.acquire().await?;
        Ok(())
    }
}
