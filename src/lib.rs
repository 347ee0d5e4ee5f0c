// Engine for a virtualized media grid: a priority-gated download scheduler, a
// slot-file disk cache for thumbnails, and a heartbeat coordinator that keeps
// per-cell presentation state truthful across the three.

pub mod config;
pub mod engine;
pub mod layout;
pub mod source;

use std::sync::Once;

use tracing::info;
use tracing_subscriber::EnvFilter;

static INIT_TRACING: Once = Once::new();

/// Installs the default tracing subscriber once, honoring `RUST_LOG`.
pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,hyper=warn,reqwest=warn"));

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init();

        info!("grid engine tracing initialized");
    });
}
