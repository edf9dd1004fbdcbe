//! Client connection handling.
//!
//! Every accepted client is driven by a [`ConnContext`] through the states
//! in [`ConState`]. Handlers never block: they inspect buffered input, queue
//! output and return an [`Outcome`] naming the next state or the I/O to wait
//! for. The driver loop below performs that I/O under the matching timeout.

mod collect;
mod context;
mod dispatch;
mod handlers;
mod reconcile;
mod state;
mod stream;
#[cfg(test)]
mod testing;

pub use context::ConnContext;
pub use state::{ConState, Outcome, WaitFor};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{join_all, select_all};
use tokio::net::TcpStream;
use tracing::{debug, error, info, instrument, warn};

use crate::backend::{BackendRegistry, CredentialStore, DispatchState};
use crate::config::{Config, ProxyMode};
use crate::metrics::Metrics;
use crate::network::Channel;
use crate::plugin::{Behavior, ProxyBehavior, ShardBehavior};
use crate::pool::{PoolError, PoolOptions, SessionPool};
use crate::router::{Router, RouterConfig};
use crate::xa::{TransactionLog, XidGenerator};

/// Everything a connection shares with the rest of the proxy
pub struct ProxyState {
    pub config: Arc<Config>,
    pub credentials: Arc<CredentialStore>,
    pub pool: Arc<SessionPool>,
    pub behavior: Arc<dyn Behavior>,
    pub metrics: Arc<Metrics>,
    pub xid_generator: Arc<XidGenerator>,
    pub xa_log: Arc<dyn TransactionLog>,
}

impl ProxyState {
    /// Wire up the backend registry, pool and routing behaviour for `config`
    pub fn build(config: Arc<Config>, metrics: Arc<Metrics>, xa_log: Arc<dyn TransactionLog>) -> Self {
        let registry = Arc::new(BackendRegistry::new(&config.backends));
        let credentials = Arc::new(CredentialStore::new(&config.users));
        let pool = Arc::new(SessionPool::new(
            registry.clone(),
            credentials.clone(),
            PoolOptions {
                config: config.pool.clone(),
                connect_timeout: Duration::from_millis(config.timeouts.connect_ms),
                max_packet_size: config.server.max_packet_size,
            },
        ));

        let default_group = config
            .groups()
            .into_iter()
            .next()
            .unwrap_or_else(|| "default".to_string());
        let behavior: Arc<dyn Behavior> = match config.mode {
            ProxyMode::Proxy => Arc::new(ProxyBehavior::new(registry, default_group)),
            ProxyMode::Shard => {
                let router = Router::new(RouterConfig::from_rules(&config.sharding), default_group);
                Arc::new(ShardBehavior::new(registry, router, config.xa.enabled))
            }
        };
        info!(
            behavior = behavior.name(),
            backends = config.backends.len(),
            xa = config.xa.enabled,
            "Proxy state ready"
        );

        Self {
            xid_generator: Arc::new(XidGenerator::new(config.xa.xid_prefix.clone())),
            config,
            credentials,
            pool,
            behavior,
            metrics,
            xa_log,
        }
    }
}

/// Serve one client until it disconnects
#[instrument(name = "conn", skip_all, fields(conn_id, peer = %peer))]
pub async fn handle_connection(proxy: Arc<ProxyState>, stream: TcpStream, conn_id: u32, peer: SocketAddr) {
    tracing::Span::current().record("conn_id", conn_id);
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "Failed to set TCP_NODELAY");
    }
    let max_packet_size = proxy.config.server.max_packet_size;
    let client = Channel::new(Box::new(stream), peer.to_string(), max_packet_size);
    ConnContext::new(proxy, conn_id, client).run().await;
}

impl ConnContext {
    /// Drive the state machine until the connection closes
    pub async fn run(mut self) {
        loop {
            match self.handle() {
                Outcome::Goto(next) if next == self.state => {
                    error!(conn_id = self.conn_id, state = %next, "Handler did not make progress");
                    self.enter(ConState::Error);
                }
                Outcome::Goto(next) => self.enter(next),
                Outcome::Wait(what, budget) => {
                    if tokio::time::timeout(budget, self.wait(what)).await.is_err() {
                        let next = self.on_timeout(what);
                        self.enter(next);
                    }
                }
                Outcome::Close => break,
            }
        }
        self.client.shutdown().await;
        info!(conn_id = self.conn_id, user = %self.user, "Client disconnected");
    }

    /// Perform one I/O step. Failures are recorded on the connection or
    /// session they belong to and picked up by the next handler run.
    async fn wait(&mut self, what: WaitFor) {
        match what {
            WaitFor::ClientRead => {
                if let Err(e) = self.client.read_more().await {
                    debug!(conn_id = self.conn_id, error = %e, "Client read ended");
                    self.enter(ConState::CloseClient);
                }
            }
            WaitFor::ClientWrite => {
                if let Err(e) = self.client.flush().await {
                    debug!(conn_id = self.conn_id, error = %e, "Client write failed");
                    self.enter(ConState::CloseClient);
                }
            }
            WaitFor::BackendWrite => {
                let flushes = self
                    .sessions
                    .iter_mut()
                    .filter(|s| s.has_pending_writes() && !s.unavailable)
                    .map(|s| async move {
                        let result = s.flush().await;
                        (s, result)
                    });
                for (session, result) in join_all(flushes).await {
                    if let Err(e) = result {
                        warn!(conn_id = self.conn_id, backend = %session.addr(), error = %e, "Backend write failed");
                        session.set_dispatch_state(DispatchState::Error);
                        session.unavailable = true;
                        self.proxy.metrics.record_backend_error("write");
                    }
                }
            }
            WaitFor::BackendRead => {
                let reads: Vec<_> = self
                    .sessions
                    .iter_mut()
                    .filter(|s| {
                        !s.unavailable && matches!(s.dispatch_state(), DispatchState::Read | DispatchState::PartFinished)
                    })
                    .map(|s| {
                        Box::pin(async move {
                            let result = s.read_more().await;
                            (s, result)
                        })
                    })
                    .collect();
                if reads.is_empty() {
                    drop(reads);
                    error!(conn_id = self.conn_id, state = %self.state, "Waiting on backends with nothing to read");
                    self.enter(ConState::Error);
                    return;
                }
                let ((session, result), _, _) = select_all(reads).await;
                if let Err(e) = result {
                    warn!(conn_id = self.conn_id, backend = %session.addr(), error = %e, "Backend read failed");
                    session.set_dispatch_state(DispatchState::Error);
                    session.unavailable = true;
                    self.proxy.metrics.record_backend_error("read");
                }
            }
            WaitFor::Checkout => {
                let pending = std::mem::take(&mut self.pending_checkout);
                for backend in pending {
                    match self.proxy.pool.checkout(backend, &self.user, &self.attrs).await {
                        Ok(session) => self.sessions.push(session),
                        Err(e) => {
                            self.checkout_error = Some(e);
                            break;
                        }
                    }
                }
            }
            WaitFor::Timer => std::future::pending::<()>().await,
        }
    }

    /// State to enter when a wait ran out of time
    fn on_timeout(&mut self, what: WaitFor) -> ConState {
        match (self.state, what) {
            (ConState::ReadQuery, WaitFor::ClientRead) if self.is_start_tran_command => {
                self.expire_short_wait();
                ConState::ReadQuery
            }
            (ConState::ReadQuery, WaitFor::ClientRead) => {
                info!(conn_id = self.conn_id, "Client idle timeout");
                ConState::CloseClient
            }
            (ConState::GetServerConnection, WaitFor::Timer) => ConState::GetServerConnection,
            (ConState::GetServerConnection, WaitFor::Checkout) => {
                warn!(conn_id = self.conn_id, "Backend checkout timed out");
                self.checkout_error = Some(PoolError::Exhausted("checkout timed out".to_string()));
                ConState::GetServerConnection
            }
            (state, what) => {
                warn!(conn_id = self.conn_id, %state, ?what, "Timed out");
                self.proxy.metrics.record_backend_error("timeout");
                ConState::Error
            }
        }
    }
}
