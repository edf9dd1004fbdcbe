//! Periodic backend probes.
//!
//! One task per backend keeps a probe session open and pings it on an
//! interval. Results only flip the registry's state flags; routing and the
//! pool read those flags on their own.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{connect, Backend, BackendRegistry, BackendSession, ConnectParams, CredentialStore};
use crate::config::HealthCheckConfig;
use crate::protocol::Command;

/// Error during health check
#[derive(Debug, thiserror::Error)]
pub enum CheckError {
    #[error("Connection failed: {0}")]
    Connection(String),
    #[error("Ping failed: {0}")]
    Ping(String),
    #[error("No user configured for probes")]
    NoUser,
}

/// Spawns and owns the per-backend probe tasks
pub struct HealthChecker {
    registry: Arc<BackendRegistry>,
    credentials: Arc<CredentialStore>,
    config: HealthCheckConfig,
    max_packet_size: usize,
}

impl HealthChecker {
    pub fn new(
        registry: Arc<BackendRegistry>,
        credentials: Arc<CredentialStore>,
        config: HealthCheckConfig,
        max_packet_size: usize,
    ) -> Self {
        Self {
            registry,
            credentials,
            config,
            max_packet_size,
        }
    }

    /// Start one probe task per backend; all stop when `shutdown` fires
    pub fn start(self: Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        if !self.config.enabled {
            info!("Health checks are disabled");
            return Vec::new();
        }
        info!(
            interval_ms = self.config.interval_ms,
            backends = self.registry.len(),
            "Starting health checks"
        );
        self.registry
            .all()
            .iter()
            .map(|backend| self.clone().spawn_check_task(backend.clone(), shutdown.clone()))
            .collect()
    }

    fn spawn_check_task(self: Arc<Self>, backend: Arc<Backend>, cancel: CancellationToken) -> JoinHandle<()> {
        let interval = Duration::from_millis(self.config.interval_ms.max(1));
        let check_timeout = Duration::from_millis(self.config.timeout_ms);

        tokio::spawn(async move {
            // Stagger the first probe across the interval
            let initial_delay = rand::thread_rng().gen_range(0..interval.as_millis().max(1) as u64);
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_millis(initial_delay)) => {}
            }

            let mut probe: Option<BackendSession> = None;
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(backend = %backend.addr, "Health check task cancelled");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.do_check(&backend, &mut probe, check_timeout).await;
                    }
                }
            }
            if let Some(session) = probe.take() {
                session.quit(check_timeout).await;
            }
        })
    }

    async fn do_check(&self, backend: &Backend, probe: &mut Option<BackendSession>, check_timeout: Duration) {
        let result = tokio::time::timeout(check_timeout, self.check_once(backend, probe)).await;
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(_) => Err(CheckError::Ping("timed out".into())),
        };

        match outcome {
            Ok(()) => {
                if backend.record_success() {
                    info!(backend = %backend.addr, "Backend is up");
                } else {
                    debug!(backend = %backend.addr, "Health check passed");
                }
            }
            Err(e) => {
                *probe = None;
                if backend.record_failure(self.config.failure_threshold) {
                    warn!(backend = %backend.addr, error = %e, "Backend is down");
                } else {
                    debug!(backend = %backend.addr, error = %e, "Health check failed");
                }
            }
        }
    }

    async fn check_once(&self, backend: &Backend, probe: &mut Option<BackendSession>) -> Result<(), CheckError> {
        if probe.is_none() {
            let user = match &self.config.user {
                Some(user) => user.as_str(),
                None => self.credentials.first_user().ok_or(CheckError::NoUser)?,
            };
            let credential = self.credentials.get(user).ok_or(CheckError::NoUser)?;
            let session = connect(
                backend,
                ConnectParams {
                    user,
                    credential,
                    charset: "utf8mb4",
                    database: None,
                    max_packet_size: self.max_packet_size,
                    epoch: 0,
                },
            )
            .await
            .map_err(|e| CheckError::Connection(e.to_string()))?;
            *probe = Some(session);
        }
        let Some(session) = probe.as_mut() else {
            return Err(CheckError::NoUser);
        };
        ping(session).await
    }
}

/// COM_PING round trip on an open session
pub async fn ping(session: &mut BackendSession) -> Result<(), CheckError> {
    session.begin_round();
    session.send_command(Bytes::from_static(&[Command::Ping as u8]));
    session.flush().await.map_err(|e| CheckError::Ping(e.to_string()))?;
    loop {
        if session.absorb().map_err(|e| CheckError::Ping(e.to_string()))? {
            break;
        }
        session
            .read_more()
            .await
            .map_err(|e| CheckError::Ping(e.to_string()))?;
    }
    match session.summary().and_then(|s| s.error()) {
        Some(err) => Err(CheckError::Ping(err.error_message.clone())),
        None => Ok(()),
    }
}
