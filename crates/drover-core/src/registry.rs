//! Worker registry operations: identifier validation, registration, and
//! heartbeats.
//!
//! The authoritative worker state is the row in the store; this module is
//! the policy layer in front of the `workers` queries.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::time::Duration;
use uuid::Uuid;

use drover_db::StoreError;
use drover_db::models::{Worker, WorkerStatus};
use drover_db::queries::workers::{self, WorkerSpec};

/// Internal worker ids occupy slots 1..=99; external workers register with
/// slot numbers of 100 and above.
pub const INTERNAL_SLOT_MAX: u32 = 99;

/// Whether an identifier matches `worker-NNN-kind` (exactly three digits).
pub fn is_valid_worker_id(id: &str) -> bool {
    let Some(rest) = id.strip_prefix("worker-") else {
        return false;
    };
    let Some(digits) = rest.strip_suffix("-kind") else {
        return false;
    };
    digits.len() == 3 && digits.bytes().all(|b| b.is_ascii_digit())
}

/// Build the internal worker id for a slot number, e.g. `worker-001-kind`.
pub fn internal_worker_id(slot: u32) -> String {
    format!("worker-{slot:03}-kind")
}

/// Extract the slot number from a valid worker id.
pub fn worker_slot(id: &str) -> Option<u32> {
    if !is_valid_worker_id(id) {
        return None;
    }
    id["worker-".len().."worker-".len() + 3].parse().ok()
}

/// Register (upsert) a worker.
///
/// The identifier must match `worker-NNN-kind`; mismatches are a Conflict.
/// Capability fields are validated before the row is written.
pub async fn register(pool: &PgPool, spec: WorkerSpec) -> Result<Worker, StoreError> {
    if !is_valid_worker_id(&spec.worker_id) {
        return Err(StoreError::conflict(format!(
            "worker id {:?} does not match worker-NNN-kind",
            spec.worker_id
        )));
    }
    if spec.max_parallel_tasks < 1 {
        return Err(StoreError::validation(
            "max_parallel_tasks must be at least 1",
        ));
    }
    if spec.supported_problems.iter().any(|p| p.is_empty()) {
        return Err(StoreError::validation(
            "supported_problems entries must be non-empty substrings",
        ));
    }

    workers::upsert_worker(pool, &spec).await
}

/// Refresh a worker's heartbeat. Unknown workers are rejected.
pub async fn heartbeat(
    pool: &PgPool,
    worker_id: &str,
    status: WorkerStatus,
    current_task_id: Option<Uuid>,
) -> Result<Worker, StoreError> {
    workers::heartbeat(pool, worker_id, status, current_task_id).await
}

/// Whether a worker is eligible to claim: not offline, and its heartbeat is
/// within the liveness window.
pub fn is_claimable(worker: &Worker, now: DateTime<Utc>, heartbeat_timeout: Duration) -> bool {
    if worker.status == WorkerStatus::Offline {
        return false;
    }
    let age = now.signed_duration_since(worker.last_heartbeat);
    age.to_std().map_or(true, |age| age <= heartbeat_timeout)
}
