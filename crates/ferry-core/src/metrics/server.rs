//! The process-wide Prometheus recorder and its scrape endpoint.
//!
//! Every table loop and the monitor loop in a process record into one
//! recorder. The endpoint binds before anything else starts, so a taken port
//! fails startup instead of leaving the process unscrapeable.

use std::net::SocketAddr;
use std::sync::OnceLock;

use axum::{Extension, Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use snafu::prelude::*;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::error::{
    AlreadyInitializedSnafu, BindSnafu, MetricsError, NotInitializedSnafu, PrometheusInitSnafu,
};

pub const DEFAULT_METRICS_ADDR: &str = "0.0.0.0:9090";

/// Histogram buckets in seconds. Syncs run from sub-second to tens of minutes.
const DURATION_BUCKETS: &[f64] = &[
    0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0,
];

static CONTROLLER: OnceLock<MetricsController> = OnceLock::new();

pub struct MetricsController {
    handle: PrometheusHandle,
}

/// Bind `addr`, install the recorder and serve `/metrics` and `/health`.
///
/// Returns the bound address, which differs from `addr` when its port is 0.
pub async fn init_global(addr: SocketAddr) -> Result<SocketAddr, MetricsError> {
    let listener = TcpListener::bind(addr).await.context(BindSnafu { addr })?;
    let bound = listener.local_addr().context(BindSnafu { addr })?;

    let handle = install_recorder()?;
    CONTROLLER
        .set(MetricsController {
            handle: handle.clone(),
        })
        .map_err(|_| AlreadyInitializedSnafu.build())?;

    tokio::spawn(serve(listener, handle));
    info!(addr = %bound, "Metrics server started");
    Ok(bound)
}

/// Install the recorder without an endpoint. Safe to call from many test
/// threads; losers of the race wait for the winner.
pub fn init_test() {
    let installed = install_recorder().and_then(|handle| {
        CONTROLLER
            .set(MetricsController { handle })
            .map_err(|_| AlreadyInitializedSnafu.build())
    });

    if installed.is_err() {
        while CONTROLLER.get().is_none() {
            std::hint::spin_loop();
        }
    }
}

fn install_recorder() -> Result<PrometheusHandle, MetricsError> {
    PrometheusBuilder::new()
        .set_buckets(DURATION_BUCKETS)
        .context(PrometheusInitSnafu)?
        .install_recorder()
        .context(PrometheusInitSnafu)
}

impl MetricsController {
    pub fn get() -> Result<&'static Self, MetricsError> {
        CONTROLLER.get().context(NotInitializedSnafu)
    }

    /// Current metrics in Prometheus text format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

fn router(handle: PrometheusHandle) -> Router {
    Router::new()
        .route("/metrics", get(scrape))
        .route("/health", get(health))
        .layer(Extension(handle))
}

async fn scrape(Extension(handle): Extension<PrometheusHandle>) -> String {
    handle.render()
}

async fn health() -> &'static str {
    "ok\n"
}

async fn serve(listener: TcpListener, handle: PrometheusHandle) {
    if let Err(e) = axum::serve(listener, router(handle)).await {
        error!(error = %e, "Metrics server stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics::counter;
    use std::thread;

    #[test]
    fn test_init_test_is_idempotent() {
        init_test();
        init_test();
        assert!(MetricsController::get().is_ok());
    }

    #[test]
    fn test_concurrent_init_test() {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                thread::spawn(|| {
                    init_test();
                    MetricsController::get().unwrap();
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
    }

    #[tokio::test]
    async fn test_endpoint_serves_recorded_metrics() {
        init_test();
        counter!("ferry_core_test_scrapes").increment(3);
        let handle = MetricsController::get().unwrap().handle.clone();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(serve(listener, handle));

        let health = reqwest::get(format!("{base}/health")).await.unwrap();
        assert_eq!(health.text().await.unwrap(), "ok\n");
        let scrape = reqwest::get(format!("{base}/metrics")).await.unwrap().text().await.unwrap();
        assert!(scrape.contains("ferry_core_test_scrapes 3"));
    }

    #[tokio::test]
    async fn test_taken_port_fails_before_installing() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();

        let err = init_global(addr).await.unwrap_err();
        assert!(matches!(err, MetricsError::Bind { .. }));
        assert!(err.to_string().contains(&addr.to_string()));
    }
}
