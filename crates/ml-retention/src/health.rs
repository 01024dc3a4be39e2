use crate::error::{CacheError, Result};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
}

/// Consecutive storage failure tracking
#[derive(Debug)]
pub struct StorageHealth {
    consecutive_failures: AtomicU32,
    total_failures: AtomicU64,
    degraded_after: u32,
    latency_us: AtomicU64,
    latency_calls: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthStatus,
    pub consecutive_failures: u32,
    pub total_failures: u64,
}

impl StorageHealth {
    pub fn new(degraded_after: u32) -> Self {
        Self {
            consecutive_failures: AtomicU32::new(0),
            total_failures: AtomicU64::new(0),
            degraded_after: degraded_after.max(1),
            latency_us: AtomicU64::new(0),
            latency_calls: AtomicU64::new(0),
        }
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        self.total_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_latency(&self, elapsed: Duration) {
        self.latency_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        self.latency_calls.fetch_add(1, Ordering::Relaxed);
    }

    /// Mean storage call latency since the previous call, in milliseconds.
    /// `None` when no call completed in between.
    pub fn take_latency_ms(&self) -> Option<f64> {
        let calls = self.latency_calls.swap(0, Ordering::Relaxed);
        let total_us = self.latency_us.swap(0, Ordering::Relaxed);
        (calls > 0).then(|| total_us as f64 / calls as f64 / 1000.0)
    }

    pub fn status(&self) -> HealthStatus {
        if self.consecutive_failures.load(Ordering::Relaxed) >= self.degraded_after {
            HealthStatus::Degraded
        } else {
            HealthStatus::Ok
        }
    }

    pub fn report(&self) -> HealthReport {
        HealthReport {
            status: self.status(),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
        }
    }
}

/// Runs storage calls under a timeout and feeds their outcome into [`StorageHealth`]
#[derive(Debug, Clone)]
pub struct StorageGuard {
    timeout: Duration,
    health: Arc<StorageHealth>,
}

impl StorageGuard {
    pub fn new(timeout: Duration, health: Arc<StorageHealth>) -> Self {
        Self { timeout, health }
    }

    pub fn health(&self) -> &Arc<StorageHealth> {
        &self.health
    }

    /// Run one storage call under the default timeout, sampling its latency
    pub async fn run<T, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let outcome = self.run_with_timeout(operation, self.timeout, fut).await;
        self.health.record_latency(started.elapsed());
        outcome
    }

    pub async fn run_with_timeout<T, F>(
        &self,
        operation: &str,
        timeout: Duration,
        fut: F,
    ) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let outcome = match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!(operation, timeout_ms = timeout.as_millis() as u64, "Storage call timed out");
                Err(CacheError::StorageUnavailable(format!(
                    "{} timed out after {:?}",
                    operation, timeout
                )))
            }
        };

        match &outcome {
            Ok(_) => self.health.record_success(),
            Err(e) if e.is_storage_failure() => self.health.record_failure(),
            Err(_) => {}
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_degrades_after_threshold_and_recovers() {
        let health = StorageHealth::new(3);
        health.record_failure();
        health.record_failure();
        assert_eq!(health.status(), HealthStatus::Ok);
        health.record_failure();
        assert_eq!(health.status(), HealthStatus::Degraded);
        health.record_success();
        assert_eq!(health.status(), HealthStatus::Ok);
        assert_eq!(health.report().total_failures, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_guard_times_out_slow_calls() {
        let health = Arc::new(StorageHealth::new(1));
        let guard = StorageGuard::new(Duration::from_millis(50), health.clone());

        let result: Result<()> = guard
            .run("slow", async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(CacheError::StorageUnavailable(_))));
        assert_eq!(health.status(), HealthStatus::Degraded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_window_resets_on_read() {
        let health = Arc::new(StorageHealth::new(3));
        let guard = StorageGuard::new(Duration::from_secs(5), health.clone());
        assert_eq!(health.take_latency_ms(), None);

        for ms in [100, 300] {
            guard
                .run("read", async move {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    Ok(())
                })
                .await
                .unwrap();
        }

        let mean = health.take_latency_ms().unwrap();
        assert!((mean - 200.0).abs() < 1.0, "mean was {}", mean);
        assert_eq!(health.take_latency_ms(), None);
    }

    #[tokio::test]
    async fn test_guard_ignores_non_storage_errors() {
        let health = Arc::new(StorageHealth::new(1));
        let guard = StorageGuard::new(Duration::from_secs(1), health.clone());

        let result: Result<()> = guard
            .run("validate", async { Err(CacheError::NotFound("x".into())) })
            .await;

        assert!(result.is_err());
        assert_eq!(health.status(), HealthStatus::Ok);
    }
}
