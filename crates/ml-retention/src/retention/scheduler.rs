//! Background loop driving retention, pending invalidations, metric flushes
//! and alert checks.

use super::RetentionEngine;
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::health::StorageHealth;
use crate::inference_cache::InferenceCache;
use crate::metrics::MetricsRecorder;
use crate::monitoring::{observe, AlertMonitor};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Stops the scheduler task when asked
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Retention scheduler ended abnormally");
        }
    }
}

pub fn spawn_scheduler(
    engine: Arc<RetentionEngine>,
    inference: Arc<InferenceCache>,
    metrics: Arc<MetricsRecorder>,
    monitor: Arc<AlertMonitor>,
    health: Arc<StorageHealth>,
    clock: Arc<dyn Clock>,
    config: &EngineConfig,
) -> SchedulerHandle {
    let (shutdown, mut stop) = watch::channel(false);
    let tick = config.scheduler_tick;
    let flush_every = config.metrics_flush_interval;
    let backoff = config.error_backoff;

    let task = tokio::spawn(async move {
        let mut ticker = interval(tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut flusher = interval(flush_every);
        flusher.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            tick_secs = tick.as_secs(),
            flush_secs = flush_every.as_secs(),
            "Retention scheduler started"
        );

        loop {
            tokio::select! {
                _ = stop.changed() => break,
                _ = ticker.tick() => {
                    match engine.run_due().await {
                        Ok(executions) => {
                            let failed = executions.iter().filter(|e| !e.success).count();
                            debug!(ran = executions.len(), failed, "Retention tick complete");
                        }
                        Err(e) => {
                            error!(error = %e, backoff_secs = backoff.as_secs(), "Could not load retention policies");
                            tokio::select! {
                                _ = stop.changed() => break,
                                _ = sleep(backoff) => {}
                            }
                        }
                    }

                    let completed = inference.retry_pending_invalidations().await;
                    if completed > 0 {
                        info!(completed, "Completed pending model invalidations");
                    }
                }
                _ = flusher.tick() => {
                    if let Err(e) = metrics.flush().await {
                        warn!(error = %e, "Metrics flush failed");
                    }
                    match observe(&engine, &metrics, &health).await {
                        Ok(observation) => {
                            let raised = monitor.check(observation, clock.now()).await;
                            debug!(raised = raised.len(), "Alert check complete");
                        }
                        Err(e) => warn!(error = %e, "Alert check failed"),
                    }
                }
            }
        }

        if let Err(e) = metrics.flush().await {
            warn!(error = %e, "Final metrics flush failed");
        }
        info!("Retention scheduler stopped");
    });

    SchedulerHandle { shutdown, task }
}
