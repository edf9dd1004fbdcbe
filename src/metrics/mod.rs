//! Prometheus metrics for the Cetus proxy
//!
//! One [`Metrics`] value is created at startup and handed to every component
//! that records something. Exposed via HTTP for Prometheus scraping.

use std::sync::Arc;

use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry};

/// Process-wide metric collection
pub struct Metrics {
    /// Registry for all metrics
    pub registry: Registry,

    // Connection metrics
    pub connections_total: IntCounter,
    pub connections_active: IntGauge,
    pub connections_closed: IntCounter,

    // Query metrics
    pub queries_total: IntCounterVec,
    pub query_duration_seconds: HistogramVec,
    /// Query errors by kind
    pub query_errors_total: IntCounterVec,

    // Routing metrics
    pub queries_routed_total: IntCounterVec,
    pub scatter_queries_total: IntCounter,

    // Backend side
    pub backend_errors_total: IntCounterVec,
    pub pool_exhausted_total: IntCounter,
    pub merge_failures_total: IntCounter,
    pub health_check_total: IntCounterVec,

    // Distributed transactions
    /// Finished distributed transactions by outcome (commit, one_phase, rollback)
    pub xa_transactions_total: IntCounterVec,
    pub xa_mending_total: IntCounter,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let connections_total = IntCounter::new(
            "cetus_connections_total",
            "Total number of client connections accepted",
        )?;
        let connections_active = IntGauge::new(
            "cetus_connections_active",
            "Current number of active client connections",
        )?;
        let connections_closed = IntCounter::new(
            "cetus_connections_closed_total",
            "Total number of client connections closed",
        )?;

        let queries_total = IntCounterVec::new(
            Opts::new("cetus_queries_total", "Total number of queries processed"),
            &["type"], // select, insert, update, local, etc.
        )?;
        let query_duration_seconds = HistogramVec::new(
            HistogramOpts::new("cetus_query_duration_seconds", "Query latency in seconds").buckets(vec![
                0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ]),
            &["type"],
        )?;
        let query_errors_total = IntCounterVec::new(
            Opts::new("cetus_query_errors_total", "Total number of query errors"),
            &["type"], // parse_error, backend_error, timeout, etc.
        )?;

        let queries_routed_total = IntCounterVec::new(
            Opts::new("cetus_queries_routed_total", "Total number of queries routed by target"),
            &["target"], // rw/ro
        )?;
        let scatter_queries_total = IntCounter::new(
            "cetus_scatter_queries_total",
            "Total number of queries dispatched to more than one backend",
        )?;

        let backend_errors_total = IntCounterVec::new(
            Opts::new("cetus_backend_errors_total", "Backend failures by kind"),
            &["kind"], // connect, io, protocol
        )?;
        let pool_exhausted_total = IntCounter::new(
            "cetus_pool_exhausted_total",
            "Clients answered with service unavailable after checkout retries",
        )?;
        let merge_failures_total = IntCounter::new(
            "cetus_merge_failures_total",
            "Multi-backend results that could not be merged",
        )?;
        let health_check_total = IntCounterVec::new(
            Opts::new("cetus_health_check_total", "Total number of health checks by result"),
            &["result"],
        )?;

        let xa_transactions_total = IntCounterVec::new(
            Opts::new("cetus_xa_transactions_total", "Distributed transactions by outcome"),
            &["outcome"],
        )?;
        let xa_mending_total = IntCounter::new(
            "cetus_xa_mending_total",
            "Transaction branches whose outcome had to be logged for mending",
        )?;

        registry.register(Box::new(connections_total.clone()))?;
        registry.register(Box::new(connections_active.clone()))?;
        registry.register(Box::new(connections_closed.clone()))?;
        registry.register(Box::new(queries_total.clone()))?;
        registry.register(Box::new(query_duration_seconds.clone()))?;
        registry.register(Box::new(query_errors_total.clone()))?;
        registry.register(Box::new(queries_routed_total.clone()))?;
        registry.register(Box::new(scatter_queries_total.clone()))?;
        registry.register(Box::new(backend_errors_total.clone()))?;
        registry.register(Box::new(pool_exhausted_total.clone()))?;
        registry.register(Box::new(merge_failures_total.clone()))?;
        registry.register(Box::new(health_check_total.clone()))?;
        registry.register(Box::new(xa_transactions_total.clone()))?;
        registry.register(Box::new(xa_mending_total.clone()))?;

        Ok(Self {
            registry,
            connections_total,
            connections_active,
            connections_closed,
            queries_total,
            query_duration_seconds,
            query_errors_total,
            queries_routed_total,
            scatter_queries_total,
            backend_errors_total,
            pool_exhausted_total,
            merge_failures_total,
            health_check_total,
            xa_transactions_total,
            xa_mending_total,
        })
    }

    /// Record a query execution
    pub fn record_query(&self, query_type: &str, duration_secs: f64) {
        self.queries_total.with_label_values(&[query_type]).inc();
        self.query_duration_seconds
            .with_label_values(&[query_type])
            .observe(duration_secs);
    }

    pub fn record_query_error(&self, error_type: &str) {
        self.query_errors_total.with_label_values(&[error_type]).inc();
    }

    pub fn record_connection_accepted(&self) {
        self.connections_total.inc();
        self.connections_active.inc();
    }

    pub fn record_connection_closed(&self) {
        self.connections_active.dec();
        self.connections_closed.inc();
    }

    /// Record route decision
    pub fn record_route(&self, target: &str, is_scatter: bool) {
        self.queries_routed_total.with_label_values(&[target]).inc();
        if is_scatter {
            self.scatter_queries_total.inc();
        }
    }

    pub fn record_backend_error(&self, kind: &str) {
        self.backend_errors_total.with_label_values(&[kind]).inc();
    }

    pub fn record_health_check(&self, result: &str) {
        self.health_check_total.with_label_values(&[result]).inc();
    }

    pub fn record_xa(&self, outcome: &str) {
        self.xa_transactions_total.with_label_values(&[outcome]).inc();
    }

    /// Metrics in Prometheus text format
    pub fn gather(&self) -> prometheus::Result<String> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

/// Start the metrics HTTP server
pub async fn start_metrics_server(addr: &str, metrics: Arc<Metrics>) -> anyhow::Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;
    use tracing::{error, info};

    fn respond(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(body.into()));
        *response.status_mut() = status;
        response
    }

    async fn handle_request(
        req: Request<hyper::body::Incoming>,
        metrics: Arc<Metrics>,
    ) -> Result<Response<Full<Bytes>>, Infallible> {
        Ok(match req.uri().path() {
            "/metrics" => match metrics.gather() {
                Ok(body) => {
                    let mut response = respond(StatusCode::OK, body);
                    response.headers_mut().insert(
                        CONTENT_TYPE,
                        HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
                    );
                    response
                }
                Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            },
            "/health" => respond(StatusCode::OK, "OK"),
            _ => respond(StatusCode::NOT_FOUND, "Not Found"),
        })
    }

    let addr: SocketAddr = addr.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "Metrics server listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let metrics = metrics.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| handle_request(req, metrics.clone()));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!(error = %e, "Metrics server connection error");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_contains_counters() {
        let metrics = Metrics::new().unwrap();
        metrics.record_connection_accepted();
        metrics.record_query("select", 0.002);
        metrics.record_xa("one_phase");
        metrics.pool_exhausted_total.inc();

        let text = metrics.gather().unwrap();
        assert!(text.contains("cetus_connections_total 1"));
        assert!(text.contains("cetus_queries_total{type=\"select\"} 1"));
        assert!(text.contains("cetus_xa_transactions_total{outcome=\"one_phase\"} 1"));
        assert!(text.contains("cetus_pool_exhausted_total 1"));
    }

    #[test]
    fn test_connection_gauge() {
        let metrics = Metrics::new().unwrap();
        metrics.record_connection_accepted();
        metrics.record_connection_accepted();
        metrics.record_connection_closed();
        assert_eq!(metrics.connections_active.get(), 1);
        assert_eq!(metrics.connections_closed.get(), 1);
    }
}
