use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::backend::{
    connect, BackendId, BackendRegistry, BackendSession, ConnectError, ConnectParams,
    CredentialStore, SessionAttrs,
};
use crate::config::PoolConfig;

/// Grace period for the COM_QUIT sent to a discarded session
const QUIT_TIMEOUT: Duration = Duration::from_millis(500);

/// Idle sessions are keyed by backend and the user they authenticated as
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub backend: BackendId,
    pub user: String,
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("No session slot available on backend {0}")]
    Exhausted(String),

    #[error("Backend {0} is not available")]
    BackendDown(String),

    #[error("Unknown backend id {0}")]
    UnknownBackend(BackendId),

    #[error("No credential for user {0}")]
    UnknownUser(String),

    #[error(transparent)]
    Connect(#[from] ConnectError),
}

impl PoolError {
    /// Waiting and trying again may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, PoolError::Exhausted(_))
    }
}

/// Delay before checkout attempt `attempt` (0-based): base + step * attempt,
/// capped at the configured maximum.
pub fn backoff_delay(attempt: u32, config: &PoolConfig) -> Duration {
    let ms = config
        .retry_base_delay_ms
        .saturating_add(config.retry_step_ms.saturating_mul(attempt as u64))
        .min(config.retry_max_delay_ms.max(config.retry_base_delay_ms));
    Duration::from_millis(ms)
}

/// Connect parameters shared by every session the pool opens
#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub config: PoolConfig,
    pub connect_timeout: Duration,
    pub max_packet_size: usize,
}

/// Backend session pool shared by all client connections.
///
/// Checkout hands out an owned [`BackendSession`]; checkin transfers it back.
/// Sessions opened before the last [`SessionPool::refresh`] are closed
/// instead of being reused.
pub struct SessionPool {
    registry: Arc<BackendRegistry>,
    credentials: Arc<CredentialStore>,
    options: PoolOptions,
    epoch: AtomicU64,
    idle: DashMap<PoolKey, VecDeque<BackendSession>>,
}

impl SessionPool {
    pub fn new(registry: Arc<BackendRegistry>, credentials: Arc<CredentialStore>, options: PoolOptions) -> Self {
        Self {
            registry,
            credentials,
            options,
            epoch: AtomicU64::new(0),
            idle: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &PoolConfig {
        &self.options.config
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    fn is_stale(&self, session: &BackendSession) -> bool {
        let config = &self.options.config;
        session.epoch() < self.epoch()
            || session.age() > Duration::from_millis(config.max_age_ms)
            || session.idle_for() > Duration::from_millis(config.max_idle_time_ms)
    }

    /// Pop a usable idle session, closing stale ones on the way
    pub fn take_idle(&self, backend: BackendId, user: &str) -> Option<BackendSession> {
        let key = PoolKey {
            backend,
            user: user.to_string(),
        };
        loop {
            let session = self.idle.get_mut(&key)?.pop_front()?;
            if self.is_stale(&session) {
                debug!(backend = %session.addr(), thread_id = session.thread_id(), "Discarding stale idle session");
                self.discard(session);
                continue;
            }
            return Some(session);
        }
    }

    /// Check out a session for `user` on `backend`, reusing an idle one or
    /// opening a new one when the backend has a free slot.
    pub async fn checkout(
        &self,
        backend_id: BackendId,
        user: &str,
        wanted: &SessionAttrs,
    ) -> Result<BackendSession, PoolError> {
        let backend = self
            .registry
            .get(backend_id)
            .ok_or(PoolError::UnknownBackend(backend_id))?;
        if !backend.is_available() {
            return Err(PoolError::BackendDown(backend.addr.clone()));
        }

        if let Some(session) = self.take_idle(backend_id, user) {
            debug!(backend = %backend.addr, thread_id = session.thread_id(), "Reusing idle session");
            return Ok(session);
        }

        if !backend.try_reserve(self.options.config.max_conns_per_backend) {
            return Err(PoolError::Exhausted(backend.addr.clone()));
        }

        let credential = match self.credentials.get(user) {
            Some(c) => c,
            None => {
                backend.release();
                return Err(PoolError::UnknownUser(user.to_string()));
            }
        };
        let params = ConnectParams {
            user,
            credential,
            charset: &wanted.charset,
            database: wanted.db.as_deref(),
            max_packet_size: self.options.max_packet_size,
            epoch: self.epoch(),
        };
        let result = match tokio::time::timeout(self.options.connect_timeout, connect(backend, params)).await {
            Ok(result) => result,
            Err(_) => Err(ConnectError::Timeout),
        };
        match result {
            Ok(session) => {
                info!(backend = %backend.addr, thread_id = session.thread_id(), "Opened backend session");
                Ok(session)
            }
            Err(e) => {
                backend.release();
                warn!(backend = %backend.addr, error = %e, "Backend connect failed");
                Err(e.into())
            }
        }
    }

    /// Return a session. Sessions that are mid-response, in a transaction,
    /// stale or over the idle limit are closed instead.
    pub fn checkin(&self, mut session: BackendSession) {
        if !session.is_reusable() || self.is_stale(&session) {
            self.discard(session);
            return;
        }
        session.begin_round();
        session.has_written = false;
        let key = PoolKey {
            backend: session.backend(),
            user: session.user().to_string(),
        };
        let mut idle = self.idle.entry(key).or_default();
        if idle.len() >= self.options.config.max_idle_per_key {
            drop(idle);
            self.discard(session);
            return;
        }
        idle.push_back(session);
    }

    /// Close a session and free its backend slot
    pub fn discard(&self, session: BackendSession) {
        if let Some(backend) = self.registry.get(session.backend()) {
            backend.release();
        }
        tokio::spawn(session.quit(QUIT_TIMEOUT));
    }

    /// Start a new epoch: every idle session is closed now and every
    /// checked-out one on checkin.
    pub fn refresh(&self) -> u64 {
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        let keys: Vec<PoolKey> = self.idle.iter().map(|e| e.key().clone()).collect();
        let mut closed = 0;
        for key in keys {
            if let Some((_, sessions)) = self.idle.remove(&key) {
                for session in sessions {
                    closed += 1;
                    self.discard(session);
                }
            }
        }
        info!(epoch, closed, "Refreshed backend sessions");
        epoch
    }

    pub fn idle_count(&self) -> usize {
        self.idle.iter().map(|e| e.value().len()).sum()
    }
}
