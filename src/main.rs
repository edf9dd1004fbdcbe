mod backend;
mod config;
mod health;
mod merge;
mod metrics;
mod network;
mod parser;
mod plugin;
mod pool;
mod protocol;
mod router;
mod session;
mod xa;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use config::Config;
use health::HealthChecker;
use metrics::Metrics;
use session::ProxyState;
use xa::{FileTransactionLog, NullTransactionLog, TransactionLog};

/// Connection ids handed to clients in the greeting
static CONNECTION_COUNTER: AtomicU32 = AtomicU32::new(1);

#[derive(Debug, Parser)]
#[command(name = "cetus", version, about = "MySQL proxy with pooling, sharding and XA transactions")]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, env = "CETUS_CONFIG")]
    config: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let args = Args::parse();
    let config = config::load_or_default(args.config.as_deref())?;

    let mut runtime = tokio::runtime::Builder::new_multi_thread();
    if config.server.worker_threads > 0 {
        runtime.worker_threads(config.server.worker_threads);
    }
    runtime.enable_all().build()?.block_on(serve(config))
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let metrics = Arc::new(Metrics::new()?);

    let (xa_log, file_log): (Arc<dyn TransactionLog>, Option<Arc<FileTransactionLog>>) = if config.xa.enabled {
        let log = Arc::new(FileTransactionLog::open(&config.xa.log_path)?);
        (log.clone(), Some(log))
    } else {
        (Arc::new(NullTransactionLog), None)
    };

    let proxy = Arc::new(ProxyState::build(config.clone(), metrics.clone(), xa_log));

    let shutdown = CancellationToken::new();
    let checker = Arc::new(HealthChecker::new(
        proxy.pool.registry().clone(),
        proxy.credentials.clone(),
        config.health.clone(),
        config.server.max_packet_size,
    ));
    let probes = checker.start(shutdown.clone());

    if let Some(addr) = config.server.metrics_addr.clone() {
        let metrics = metrics.clone();
        tokio::spawn(async move {
            if let Err(e) = metrics::start_metrics_server(&addr, metrics).await {
                error!(error = %e, "Metrics server failed");
            }
        });
    }

    #[cfg(unix)]
    {
        let pool = proxy.pool.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            use tokio::signal::unix::{signal, SignalKind};
            let mut hangup = match signal(SignalKind::hangup()) {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "Cannot listen for SIGHUP");
                    return;
                }
            };
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = hangup.recv() => {
                        if received.is_none() {
                            break;
                        }
                        info!("SIGHUP received, refreshing backend sessions");
                        pool.refresh();
                    }
                }
            }
        });
    }

    let addr = format!("{}:{}", config.server.listen_addr, config.server.listen_port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, mode = ?config.mode, "Cetus MySQL proxy listening");

    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(v) => v,
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    continue;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                break;
            }
        };

        let conn_id = CONNECTION_COUNTER.fetch_add(1, Ordering::SeqCst);
        let proxy = proxy.clone();
        info!(conn_id, peer = %peer, "New connection");
        proxy.metrics.record_connection_accepted();

        tokio::spawn(async move {
            session::handle_connection(proxy.clone(), stream, conn_id, peer).await;
            proxy.metrics.record_connection_closed();
        });
    }

    shutdown.cancel();
    for probe in probes {
        if let Err(e) = probe.await {
            warn!(error = %e, "Health probe task ended abnormally");
        }
    }
    if let Some(log) = file_log {
        log.shutdown().await;
    }
    Ok(())
}
