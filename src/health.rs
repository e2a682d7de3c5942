//! Health probing (§4.7 / SPEC_FULL §4.9). Grounded on `health.rs`'s
//! three-tier liveness/readiness/health shape, adapted from axum handlers to
//! plain library functions — HTTP wiring is left to the host, same as this
//! crate never installing a metrics recorder itself.

use serde::Serialize;

use crate::storage::{HealthMetrics, StorageProvider};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReadinessReport {
    pub ready: bool,
    pub backend_reachable: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: CheckStatus,
    pub backend: CheckStatus,
    pub metrics: HealthMetrics,
}

/// Liveness probe: no I/O, just confirms the calling process can still run
/// async code. Always `true` if this function returns at all.
pub fn liveness() -> bool {
    true
}

/// Readiness probe: a round-trip to the backend via `health_metrics`, bounded
/// by `max_processing_time` only in the sense that a storage call that never
/// returns is not this function's problem — callers should wrap it in their
/// own timeout if the backend can hang.
pub async fn readiness(storage: &dyn StorageProvider, inbox_name: &str) -> ReadinessReport {
    let backend_reachable = storage
        .health_metrics(inbox_name, std::time::Duration::from_secs(1))
        .await
        .is_ok();
    ReadinessReport {
        ready: backend_reachable,
        backend_reachable,
    }
}

/// Full health report: backend reachability plus the pending/captured/DLQ
/// counts from [`StorageProvider::health_metrics`].
pub async fn health(
    storage: &dyn StorageProvider,
    inbox_name: &str,
    max_processing_time: std::time::Duration,
) -> HealthReport {
    match storage.health_metrics(inbox_name, max_processing_time).await {
        Ok(metrics) => HealthReport {
            status: CheckStatus::Healthy,
            backend: CheckStatus::Healthy,
            metrics,
        },
        Err(_) => HealthReport {
            status: CheckStatus::Unhealthy,
            backend: CheckStatus::Unhealthy,
            metrics: HealthMetrics::default(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::storage::memory::MemoryStorageProvider;
    use std::sync::Arc;

    #[test]
    fn liveness_is_always_true() {
        assert!(liveness());
    }

    #[tokio::test]
    async fn readiness_reports_reachable_backend() {
        let storage = MemoryStorageProvider::new(Arc::new(SystemClock));
        let report = readiness(&storage, "demo").await;
        assert!(report.ready);
        assert!(report.backend_reachable);
    }

    #[tokio::test]
    async fn health_reports_counts_for_empty_inbox() {
        let storage = MemoryStorageProvider::new(Arc::new(SystemClock));
        let report = health(&storage, "demo", std::time::Duration::from_secs(300)).await;
        assert_eq!(report.status, CheckStatus::Healthy);
        assert_eq!(report.metrics.pending_count, 0);
    }
}
