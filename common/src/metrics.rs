use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use owo_colors::OwoColorize;
use tokio::net::TcpListener;

use crate::shutdown::shutdown_signal;

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Flips true after the reconciler's first successful Node list; `/readyz`
/// reports not-ready until then, distinguishing readiness from liveness.
static READY: AtomicBool = AtomicBool::new(false);

pub fn mark_ready() {
    READY.store(true, Ordering::Relaxed);
}

fn install_recorder_once() -> &'static PrometheusHandle {
    PROM_HANDLE.get_or_init(|| {
        PrometheusBuilder::new()
            .install_recorder()
            .expect("install global metrics recorder")
    })
}

/// Serves `/metrics` on `metrics_port`, matching the sibling example's
/// `metrics-exporter-prometheus` + `axum` wiring.
pub async fn run_metrics_server(metrics_port: u16) {
    let handle = install_recorder_once().clone();
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );
    serve(app, metrics_port, "metrics").await;
}

/// Serves `/healthz` and `/readyz` on `probe_port`.
pub async fn run_probe_server(probe_port: u16) {
    let _ = install_recorder_once();
    let app = Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route(
            "/readyz",
            get(|| async {
                if READY.load(Ordering::Relaxed) {
                    (axum::http::StatusCode::OK, "ok")
                } else {
                    (axum::http::StatusCode::SERVICE_UNAVAILABLE, "not ready")
                }
            }),
        );
    serve(app, probe_port, "probe").await;
}

async fn serve(app: Router, port: u16, name: &str) {
    let addr = format!("0.0.0.0:{port}");
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("{}", format!("failed to bind {name} server to {addr}: {e}").red());
            return;
        }
    };
    println!(
        "{}",
        format!("📈 starting {name} server • port={port}").green()
    );
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        eprintln!("{}", format!("{name} server stopped: {e}").red());
    }
}
