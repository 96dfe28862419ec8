//! Ambient process concerns shared by the operator binary: colored
//! logging, graceful shutdown, the `/healthz`+`/readyz`+`/metrics` HTTP
//! surface, and process-wide configuration (spec.md §6).

pub mod config;
pub mod log;
pub mod metrics;
pub mod shutdown;

pub use config::Config;

/// Sets up process-global state that must run exactly once before
/// anything else: color support detection and the readiness marker.
/// Mirrors the teacher's `strim_common::init()`.
pub fn init() {
    let disable_colors = ["1", "true"].contains(
        &std::env::var("DISABLE_COLORS")
            .unwrap_or_default()
            .to_lowercase()
            .as_str(),
    );
    owo_colors::set_override(!disable_colors);
}

/// Drops a readiness marker file for process managers that check for it
/// out-of-band, in addition to the `/readyz` HTTP endpoint.
pub fn signal_ready() {
    let _ = std::fs::write("/tmp/skyhook-ready", "ready");
}
