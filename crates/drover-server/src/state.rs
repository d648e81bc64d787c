//! Shared handler state.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use metrics_exporter_prometheus::PrometheusHandle;
use sqlx::PgPool;

use drover_core::config::ServiceConfig;
use drover_core::manager::WorkerManager;

/// Everything a request handler may touch. Handlers hold no state of their
/// own across requests.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub manager: Arc<WorkerManager>,
    pub config: Arc<ServiceConfig>,
    pub metrics: PrometheusHandle,
    draining: Arc<AtomicBool>,
}

impl AppState {
    pub fn new(
        pool: PgPool,
        manager: Arc<WorkerManager>,
        config: Arc<ServiceConfig>,
        metrics: PrometheusHandle,
    ) -> Self {
        Self {
            pool,
            manager,
            config,
            metrics,
            draining: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flip the service into drain mode: task creation and claims are
    /// refused from here on.
    pub fn begin_drain(&self) {
        self.draining.store(true, Ordering::SeqCst);
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }
}
