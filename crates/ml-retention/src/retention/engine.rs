use super::defaults::default_policies;
use crate::backend::{LeaseManager, PolicyStore, RetentionTarget};
use crate::clock::Clock;
use crate::config::{expires_after, EngineConfig};
use crate::error::{CacheError, Result};
use crate::health::StorageGuard;
use crate::metrics::MetricsRecorder;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use ml_retention_db::{
    EvictionCriteria, PolicyAction, Priority, RetentionPolicy, Tier, TierStats, TimeWindow,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};
use ts_rs::TS;

/// Where a policy is in its run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export, export_to = "bindings/")]
pub enum PolicyPhase {
    Idle,
    Scanning,
    Evicting,
}

/// Outcome of one policy run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct PolicyExecution {
    pub policy_id: String,
    pub tier: Tier,
    pub executed_at: DateTime<Utc>,
    pub dry_run: bool,
    pub records_matched: u64,
    pub records_affected: u64,
    pub space_freed_mb: f64,
    pub duration_ms: u64,
    pub success: bool,
    #[ts(optional)]
    pub error_message: Option<String>,
}

/// Partial change to a policy's definition. Absent fields keep their value.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub retention_days: Option<i32>,
    pub min_access_count: Option<i64>,
    pub min_quality_score: Option<f64>,
    pub priority_threshold: Option<Priority>,
    pub time_window: Option<String>,
    pub action: Option<PolicyAction>,
    pub enabled: Option<bool>,
    pub execution_interval_hours: Option<i32>,
}

impl PolicyUpdate {
    fn apply(self, policy: &mut RetentionPolicy) {
        if let Some(name) = self.name {
            policy.name = name;
        }
        if let Some(description) = self.description {
            policy.description = description;
        }
        if let Some(days) = self.retention_days {
            policy.retention_days = days;
        }
        if let Some(count) = self.min_access_count {
            policy.min_access_count = count;
        }
        if let Some(score) = self.min_quality_score {
            policy.min_quality_score = score;
        }
        if let Some(priority) = self.priority_threshold {
            policy.priority_threshold = Some(priority);
        }
        if let Some(window) = self.time_window {
            policy.time_window = Some(window);
        }
        if let Some(action) = self.action {
            policy.action = action;
        }
        if let Some(enabled) = self.enabled {
            policy.enabled = enabled;
        }
        if let Some(hours) = self.execution_interval_hours {
            policy.execution_interval_hours = hours;
        }
    }
}

fn validate(policy: &RetentionPolicy, now: DateTime<Utc>) -> Result<()> {
    let invalid = |msg: String| -> Result<()> { Err(CacheError::InvalidPolicy(msg)) };

    if policy.policy_id.trim().is_empty() {
        return invalid("policy id is empty".into());
    }
    if policy.name.trim().is_empty() {
        return invalid("policy name is empty".into());
    }
    if policy.retention_days < 0 {
        return invalid(format!("retention days {} is negative", policy.retention_days));
    }
    if policy.min_access_count < 0 {
        return invalid(format!("min access count {} is negative", policy.min_access_count));
    }
    if !(0.0..=1.0).contains(&policy.min_quality_score) {
        return invalid(format!(
            "min quality score {} outside [0, 1]",
            policy.min_quality_score
        ));
    }
    if policy.execution_interval_hours <= 0 {
        return invalid(format!(
            "execution interval {}h must be positive",
            policy.execution_interval_hours
        ));
    }
    if let Some(window) = &policy.time_window {
        if window.parse::<TimeWindow>().is_err() {
            return invalid(format!("unknown time window '{}'", window));
        }
    }
    if EvictionCriteria::for_policy(policy, now).is_unbounded() {
        return invalid(format!(
            "policy {} has no eviction clause for tier {}",
            policy.policy_id, policy.tier
        ));
    }
    Ok(())
}

/// Counts a run reached before it finished or failed
#[derive(Debug, Default, Clone, Copy)]
struct Progress {
    matched: u64,
    evicted: u64,
}

fn next_run(policy: &RetentionPolicy, from: DateTime<Utc>) -> DateTime<Utc> {
    from + ChronoDuration::hours(policy.execution_interval_hours.max(1) as i64)
}

/// Runs retention policies against their tiers, one lease-holding owner per policy
pub struct RetentionEngine {
    policies: Arc<dyn PolicyStore>,
    leases: Arc<dyn LeaseManager>,
    targets: HashMap<Tier, Arc<dyn RetentionTarget>>,
    metrics: Arc<MetricsRecorder>,
    clock: Arc<dyn Clock>,
    guard: StorageGuard,
    holder: String,
    runs: AtomicU64,
    lease_ttl: Duration,
    eviction_timeout: Duration,
    batch_size: u64,
    history_limit: usize,
    history: Mutex<VecDeque<PolicyExecution>>,
    phases: RwLock<HashMap<String, PolicyPhase>>,
}

impl RetentionEngine {
    pub fn new(
        policies: Arc<dyn PolicyStore>,
        leases: Arc<dyn LeaseManager>,
        targets: HashMap<Tier, Arc<dyn RetentionTarget>>,
        metrics: Arc<MetricsRecorder>,
        clock: Arc<dyn Clock>,
        guard: StorageGuard,
        config: &EngineConfig,
    ) -> Self {
        Self {
            policies,
            leases,
            targets,
            metrics,
            clock,
            guard,
            holder: config.instance_id.clone(),
            runs: AtomicU64::new(0),
            lease_ttl: config.lease_ttl,
            eviction_timeout: config.eviction_timeout,
            batch_size: config.eviction_batch_size.max(1) as u64,
            history_limit: config.history_limit.max(1),
            history: Mutex::new(VecDeque::new()),
            phases: RwLock::new(HashMap::new()),
        }
    }

    /// Insert the default policy set, skipping ids that already exist
    pub async fn seed_defaults(&self) -> Result<usize> {
        let mut inserted = 0;
        for policy in default_policies(self.clock.now()) {
            if self
                .guard
                .run("policy_insert", self.policies.insert(&policy))
                .await?
            {
                inserted += 1;
            }
        }
        info!(inserted, "Seeded default retention policies");
        Ok(inserted)
    }

    pub async fn list_policies(&self) -> Result<Vec<RetentionPolicy>> {
        self.guard.run("policy_list", self.policies.list()).await
    }

    pub async fn get_policy(&self, policy_id: &str) -> Result<RetentionPolicy> {
        self.guard
            .run("policy_get", self.policies.get(policy_id))
            .await?
            .ok_or_else(|| CacheError::NotFound(format!("policy {}", policy_id)))
    }

    /// Register a new policy with fresh counters, first due one interval from now
    pub async fn create_policy(&self, policy: RetentionPolicy) -> Result<RetentionPolicy> {
        let now = self.clock.now();
        validate(&policy, now)?;

        let policy = RetentionPolicy {
            last_executed: None,
            next_execution: Some(policy.next_execution.unwrap_or_else(|| next_run(&policy, now))),
            last_error: None,
            records_processed: 0,
            records_deleted: 0,
            space_freed_mb: 0.0,
            ..policy
        };

        if !self
            .guard
            .run("policy_insert", self.policies.insert(&policy))
            .await?
        {
            return Err(CacheError::InvalidPolicy(format!(
                "policy {} already exists",
                policy.policy_id
            )));
        }
        info!(policy_id = %policy.policy_id, tier = %policy.tier, "Created retention policy");
        Ok(policy)
    }

    /// Change thresholds or schedule. Counters and history are kept.
    pub async fn update_policy(
        &self,
        policy_id: &str,
        update: PolicyUpdate,
    ) -> Result<RetentionPolicy> {
        let now = self.clock.now();
        let mut policy = self.get_policy(policy_id).await?;
        let previous_interval = policy.execution_interval_hours;
        update.apply(&mut policy);
        validate(&policy, now)?;

        if !self
            .guard
            .run("policy_update", self.policies.update_definition(&policy))
            .await?
        {
            return Err(CacheError::NotFound(format!("policy {}", policy_id)));
        }

        // the stored schedule may have moved since the read above; only touch it
        // when the interval itself changed
        if policy.execution_interval_hours != previous_interval {
            let next = next_run(&policy, policy.last_executed.unwrap_or(now));
            self.guard
                .run("policy_reschedule", self.policies.reschedule(policy_id, next))
                .await?;
        }
        info!(policy_id, enabled = policy.enabled, "Updated retention policy");
        self.get_policy(policy_id).await
    }

    pub async fn set_enabled(&self, policy_id: &str, enabled: bool) -> Result<RetentionPolicy> {
        self.update_policy(
            policy_id,
            PolicyUpdate {
                enabled: Some(enabled),
                ..Default::default()
            },
        )
        .await
    }

    pub async fn delete_policy(&self, policy_id: &str) -> Result<()> {
        if !self
            .guard
            .run("policy_delete", self.policies.delete(policy_id))
            .await?
        {
            return Err(CacheError::NotFound(format!("policy {}", policy_id)));
        }
        self.phases.write().await.remove(policy_id);
        info!(policy_id, "Deleted retention policy");
        Ok(())
    }

    /// Run every enabled policy whose next execution has passed.
    ///
    /// A failing or busy policy does not stop the others. Only failing to list
    /// policies is an error.
    pub async fn run_due(&self) -> Result<Vec<PolicyExecution>> {
        let now = self.clock.now();
        let due: Vec<RetentionPolicy> = self
            .list_policies()
            .await?
            .into_iter()
            .filter(|p| p.is_due(now))
            .collect();

        let mut executions = Vec::with_capacity(due.len());
        for policy in due {
            match self.execute(&policy, false).await {
                Ok(execution) => executions.push(execution),
                Err(CacheError::PolicyBusy(policy_id)) => {
                    debug!(policy_id = %policy_id, "Policy lease held elsewhere, skipping");
                }
                Err(e) => {
                    warn!(policy_id = %policy.policy_id, error = %e, "Could not start policy");
                }
            }
        }
        Ok(executions)
    }

    /// Run one policy now, whether or not it is due. A dry run only counts.
    pub async fn run_policy(&self, policy_id: &str, dry_run: bool) -> Result<PolicyExecution> {
        let policy = self.get_policy(policy_id).await?;
        let execution = self.execute(&policy, dry_run).await?;
        if execution.success {
            Ok(execution)
        } else {
            Err(CacheError::PolicyExecutionFailed {
                policy_id: policy_id.to_string(),
                reason: execution.error_message.unwrap_or_default(),
            })
        }
    }

    /// Most recent runs first
    pub async fn history(&self, limit: usize) -> Vec<PolicyExecution> {
        self.history.lock().await.iter().take(limit).cloned().collect()
    }

    pub async fn phase(&self, policy_id: &str) -> PolicyPhase {
        self.phases
            .read()
            .await
            .get(policy_id)
            .copied()
            .unwrap_or(PolicyPhase::Idle)
    }

    pub async fn tier_stats(&self) -> Result<Vec<TierStats>> {
        let now = self.clock.now();
        let mut stats = Vec::with_capacity(self.targets.len());
        for tier in Tier::ALL {
            if let Some(target) = self.targets.get(tier) {
                stats.push(self.guard.run("tier_stats", target.stats(now)).await?);
            }
        }
        Ok(stats)
    }

    async fn set_phase(&self, policy_id: &str, phase: PolicyPhase) {
        self.phases
            .write()
            .await
            .insert(policy_id.to_string(), phase);
    }

    async fn execute(&self, policy: &RetentionPolicy, dry_run: bool) -> Result<PolicyExecution> {
        let policy_id = policy.policy_id.as_str();
        let now = self.clock.now();
        let lease_expires = expires_after(now, self.lease_ttl).unwrap_or(DateTime::<Utc>::MAX_UTC);
        // one token per run, so two runs in this process exclude each other too
        let token = format!("{}#{}", self.holder, self.runs.fetch_add(1, Ordering::Relaxed));

        let acquired = self
            .guard
            .run(
                "lease_acquire",
                self.leases.try_acquire(policy_id, &token, now, lease_expires),
            )
            .await?;
        if !acquired {
            return Err(CacheError::PolicyBusy(policy_id.to_string()));
        }

        let started = Instant::now();
        let mut progress = Progress::default();
        let outcome = self.evict(policy, now, dry_run, &mut progress).await;
        self.set_phase(policy_id, PolicyPhase::Idle).await;

        if let Err(e) = self
            .guard
            .run("lease_release", self.leases.release(policy_id, &token))
            .await
        {
            warn!(policy_id, error = %e, "Failed to release policy lease");
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        let space_freed_mb = progress.evicted as f64 * policy.tier.estimated_record_mb();
        let error_message = match outcome {
            Ok(()) => {
                if !dry_run {
                    self.record_success(policy, progress.evicted, space_freed_mb, now)
                        .await;
                }
                info!(
                    policy_id,
                    tier = %policy.tier,
                    dry_run,
                    matched = progress.matched,
                    evicted = progress.evicted,
                    duration_ms,
                    "Retention policy completed"
                );
                None
            }
            Err(e) => {
                let reason = e.to_string();
                error!(
                    policy_id,
                    tier = %policy.tier,
                    dry_run,
                    evicted = progress.evicted,
                    error = %reason,
                    "Retention policy failed"
                );
                if !dry_run {
                    self.record_failure(policy, progress.evicted, space_freed_mb, &reason)
                        .await;
                }
                Some(reason)
            }
        };

        let execution = PolicyExecution {
            policy_id: policy_id.to_string(),
            tier: policy.tier,
            executed_at: now,
            dry_run,
            records_matched: progress.matched,
            records_affected: progress.evicted,
            space_freed_mb,
            duration_ms,
            success: error_message.is_none(),
            error_message,
        };
        self.push_history(execution.clone()).await;
        Ok(execution)
    }

    /// Scan then evict in batches. `progress` holds what was done even when this fails
    /// part way, since every completed batch is already committed.
    async fn evict(
        &self,
        policy: &RetentionPolicy,
        now: DateTime<Utc>,
        dry_run: bool,
        progress: &mut Progress,
    ) -> Result<()> {
        let policy_id = policy.policy_id.as_str();
        let target = self.targets.get(&policy.tier).ok_or_else(|| {
            CacheError::InvalidPolicy(format!("no storage configured for tier {}", policy.tier))
        })?;

        let criteria = EvictionCriteria::for_policy(policy, now);
        if criteria.is_unbounded() {
            return Err(CacheError::InvalidPolicy(
                "no eviction clause, refusing to clear the whole tier".into(),
            ));
        }

        self.set_phase(policy_id, PolicyPhase::Scanning).await;
        progress.matched = self
            .guard
            .run_with_timeout(
                "retention_count",
                self.eviction_timeout,
                target.count_matching(&criteria),
            )
            .await?;
        if dry_run || progress.matched == 0 {
            return Ok(());
        }

        if policy.action != PolicyAction::Delete {
            warn!(policy_id, action = %policy.action, "Action not supported, deleting instead");
        }

        self.set_phase(policy_id, PolicyPhase::Evicting).await;
        loop {
            let deleted = self
                .guard
                .run_with_timeout(
                    "retention_evict_batch",
                    self.eviction_timeout,
                    target.evict_batch(&criteria, self.batch_size),
                )
                .await?;
            progress.evicted += deleted;
            debug!(policy_id, deleted, total = progress.evicted, "Evicted batch");
            if deleted < self.batch_size {
                return Ok(());
            }
        }
    }

    async fn record_success(
        &self,
        policy: &RetentionPolicy,
        evicted: u64,
        space_freed_mb: f64,
        now: DateTime<Utc>,
    ) {
        let policy_id = policy.policy_id.as_str();
        if let Err(e) = self
            .guard
            .run(
                "policy_record_success",
                self.policies.record_success(
                    policy_id,
                    evicted as i64,
                    space_freed_mb,
                    now,
                    next_run(policy, now),
                ),
            )
            .await
        {
            warn!(policy_id, error = %e, "Failed to update policy counters");
        }
        self.metrics
            .record_eviction(policy_id, policy.tier, evicted, space_freed_mb)
            .await;
    }

    /// Keep the schedule so the policy is retried, but count deletions that did commit
    async fn record_failure(
        &self,
        policy: &RetentionPolicy,
        evicted: u64,
        space_freed_mb: f64,
        reason: &str,
    ) {
        let policy_id = policy.policy_id.as_str();
        if let Err(e) = self
            .guard
            .run(
                "policy_record_failure",
                self.policies
                    .record_failure(policy_id, reason, evicted as i64, space_freed_mb),
            )
            .await
        {
            warn!(policy_id, error = %e, "Failed to record policy failure");
        }
        if evicted > 0 {
            self.metrics
                .record_eviction(policy_id, policy.tier, evicted, space_freed_mb)
                .await;
        }
        self.metrics
            .record_policy_failure(policy_id, policy.tier, reason)
            .await;
    }

    async fn push_history(&self, execution: PolicyExecution) {
        let mut history = self.history.lock().await;
        history.push_front(execution);
        history.truncate(self.history_limit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryStore;
    use crate::clock::ManualClock;
    use crate::feature_store::{FeatureInput, FeatureStore};
    use crate::health::StorageHealth;
    use async_trait::async_trait;
    use ml_retention_db::{FeatureType, MetricType};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn start() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    struct Harness {
        engine: RetentionEngine,
        memory: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        features: FeatureStore,
    }

    fn harness_with(
        config: EngineConfig,
        override_target: Option<(Tier, Arc<dyn RetentionTarget>)>,
    ) -> Harness {
        let memory = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(start()));
        let guard = StorageGuard::new(Duration::from_secs(5), Arc::new(StorageHealth::new(3)));
        let metrics = Arc::new(MetricsRecorder::new(
            memory.clone(),
            clock.clone(),
            guard.clone(),
        ));

        let mut targets: HashMap<Tier, Arc<dyn RetentionTarget>> = Tier::ALL
            .iter()
            .map(|tier| (*tier, memory.retention_target(*tier)))
            .collect();
        if let Some((tier, target)) = override_target {
            targets.insert(tier, target);
        }

        let engine = RetentionEngine::new(
            memory.clone(),
            memory.clone(),
            targets,
            metrics.clone(),
            clock.clone(),
            guard.clone(),
            &config,
        );
        let features = FeatureStore::new(memory.clone(), guard, clock.clone(), metrics, 100);
        Harness {
            engine,
            memory,
            clock,
            features,
        }
    }

    fn harness() -> Harness {
        harness_with(EngineConfig::default(), None)
    }

    fn feature(source_id: &str, quality: f64) -> FeatureInput {
        FeatureInput {
            source_id: source_id.into(),
            source_table: "biodiversity_studies".into(),
            feature_type: FeatureType::Spatial,
            vector: json!([quality, 1.0, 2.0]),
            quality_score: quality,
            temporal_window: Some("1week".into()),
            location_bucket: Some("lat_-12_lon_18".into()),
            spatial_resolution: None,
        }
    }

    fn low_quality_policy() -> RetentionPolicy {
        RetentionPolicy {
            min_access_count: 1,
            min_quality_score: 0.3,
            ..RetentionPolicy::new("fs_low", "low quality features", Tier::FeatureStore, 90)
        }
    }

    #[tokio::test]
    async fn test_evicts_stale_unused_low_quality_but_keeps_popular() {
        let h = harness();
        h.engine.create_policy(low_quality_policy()).await.unwrap();

        let stale = h.features.put(feature("obs-1", 0.2)).await.unwrap();
        let popular = h.features.put(feature("obs-2", 0.2)).await.unwrap();
        for _ in 0..5 {
            h.features
                .get("obs-2", FeatureType::Spatial, &popular.content_hash)
                .await
                .unwrap()
                .unwrap();
        }

        h.clock.advance(ChronoDuration::days(100));
        let run = h.engine.run_policy("fs_low", false).await.unwrap();
        assert_eq!(run.records_affected, 1);

        h.clock.advance(ChronoDuration::days(100));
        let run = h.engine.run_policy("fs_low", false).await.unwrap();
        assert_eq!(run.records_affected, 0);

        assert_eq!(h.memory.tier_len(Tier::FeatureStore), 1);
        assert!(h
            .features
            .get("obs-1", FeatureType::Spatial, &stale.content_hash)
            .await
            .unwrap()
            .is_none());
        assert!(h
            .features
            .get("obs-2", FeatureType::Spatial, &popular.content_hash)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_no_remaining_entry_matches_an_enabled_policy_after_cycle() {
        let h = harness();
        h.engine.seed_defaults().await.unwrap();

        for i in 0..20 {
            let quality = (i as f64) / 20.0;
            h.features
                .put(feature(&format!("obs-{}", i), quality))
                .await
                .unwrap();
            h.clock.advance(ChronoDuration::days(30));
        }

        h.clock.advance(ChronoDuration::days(400));
        let executions = h.engine.run_due().await.unwrap();
        assert_eq!(executions.len(), 9);
        assert!(executions.iter().all(|e| e.success));

        let now = h.clock.now();
        for policy in h.engine.list_policies().await.unwrap() {
            let criteria = EvictionCriteria::for_policy(&policy, now);
            let remaining = h
                .memory
                .retention_target(policy.tier)
                .count_matching(&criteria)
                .await
                .unwrap();
            assert_eq!(remaining, 0, "{} still matches", policy.policy_id);
        }
    }

    #[tokio::test]
    async fn test_success_updates_counters_and_schedule() {
        let h = harness();
        h.engine.create_policy(low_quality_policy()).await.unwrap();
        h.features.put(feature("obs-1", 0.1)).await.unwrap();
        h.features.put(feature("obs-2", 0.2)).await.unwrap();

        h.clock.advance(ChronoDuration::days(91));
        let now = h.clock.now();
        let executions = h.engine.run_due().await.unwrap();
        assert_eq!(executions.len(), 1);

        let policy = h.engine.get_policy("fs_low").await.unwrap();
        assert_eq!(policy.records_deleted, 2);
        assert_eq!(policy.records_processed, 2);
        assert!((policy.space_freed_mb - 0.004).abs() < 1e-9);
        assert_eq!(policy.last_executed, Some(now));
        assert_eq!(policy.next_execution, Some(now + ChronoDuration::hours(24)));
        assert_eq!(h.engine.phase("fs_low").await, PolicyPhase::Idle);

        // not due again until the interval passes
        assert!(h.engine.run_due().await.unwrap().is_empty());

        let evicted: Vec<_> = h
            .memory
            .metric_records()
            .into_iter()
            .filter(|m| m.metric_type == MetricType::RecordsEvicted)
            .collect();
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].value, 2.0);
    }

    #[tokio::test]
    async fn test_dry_run_counts_without_deleting() {
        let h = harness();
        h.engine.create_policy(low_quality_policy()).await.unwrap();
        h.features.put(feature("obs-1", 0.1)).await.unwrap();
        h.clock.advance(ChronoDuration::days(91));

        let run = h.engine.run_policy("fs_low", true).await.unwrap();
        assert!(run.dry_run);
        assert_eq!(run.records_matched, 1);
        assert_eq!(run.records_affected, 0);
        assert_eq!(h.memory.tier_len(Tier::FeatureStore), 1);

        let policy = h.engine.get_policy("fs_low").await.unwrap();
        assert_eq!(policy.records_deleted, 0);
        assert_eq!(policy.last_executed, None);
    }

    struct BrokenTarget;

    #[async_trait]
    impl RetentionTarget for BrokenTarget {
        async fn count_matching(&self, _: &EvictionCriteria) -> Result<u64> {
            Err(CacheError::StorageUnavailable("disk on fire".into()))
        }

        async fn evict_batch(&self, _: &EvictionCriteria, _: u64) -> Result<u64> {
            Err(CacheError::StorageUnavailable("disk on fire".into()))
        }

        async fn stats(&self, _: DateTime<Utc>) -> Result<TierStats> {
            Err(CacheError::StorageUnavailable("disk on fire".into()))
        }
    }

    #[tokio::test]
    async fn test_failing_policy_does_not_block_others() {
        let h = harness_with(
            EngineConfig::default(),
            Some((Tier::TrainingCache, Arc::new(BrokenTarget))),
        );
        h.engine
            .create_policy(RetentionPolicy {
                min_access_count: 3,
                ..RetentionPolicy::new("tc", "training", Tier::TrainingCache, 90)
            })
            .await
            .unwrap();
        h.engine.create_policy(low_quality_policy()).await.unwrap();
        h.features.put(feature("obs-1", 0.1)).await.unwrap();

        h.clock.advance(ChronoDuration::days(91));
        let executions = h.engine.run_due().await.unwrap();
        assert_eq!(executions.len(), 2);

        let failed = executions.iter().find(|e| e.policy_id == "tc").unwrap();
        assert!(!failed.success);
        assert!(failed
            .error_message
            .as_deref()
            .unwrap()
            .contains("disk on fire"));
        let succeeded = executions.iter().find(|e| e.policy_id == "fs_low").unwrap();
        assert!(succeeded.success);
        assert_eq!(succeeded.records_affected, 1);

        let tc = h.engine.get_policy("tc").await.unwrap();
        assert!(tc.last_error.is_some());
        assert!(tc.next_execution.unwrap() <= h.clock.now());
        assert!(tc.is_due(h.clock.now()));

        assert!(h
            .memory
            .metric_records()
            .iter()
            .any(|m| m.metric_type == MetricType::PolicyFailure));

        let err = h.engine.run_policy("tc", false).await.unwrap_err();
        assert!(matches!(err, CacheError::PolicyExecutionFailed { .. }));
    }

    #[tokio::test]
    async fn test_lease_held_elsewhere_is_busy() {
        let h = harness();
        h.engine.create_policy(low_quality_policy()).await.unwrap();
        let now = h.clock.now();
        assert!(h
            .memory
            .try_acquire("fs_low", "other-instance", now, now + ChronoDuration::hours(1))
            .await
            .unwrap());

        let err = h.engine.run_policy("fs_low", false).await.unwrap_err();
        assert!(matches!(err, CacheError::PolicyBusy(_)));

        h.clock.advance(ChronoDuration::hours(2));
        assert!(h.engine.run_policy("fs_low", false).await.is_ok());
    }

    /// Finds one candidate, then takes a while to delete nothing
    struct SlowTarget;

    #[async_trait]
    impl RetentionTarget for SlowTarget {
        async fn count_matching(&self, _: &EvictionCriteria) -> Result<u64> {
            Ok(1)
        }

        async fn evict_batch(&self, _: &EvictionCriteria, _: u64) -> Result<u64> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(0)
        }

        async fn stats(&self, _: DateTime<Utc>) -> Result<TierStats> {
            Ok(TierStats {
                tier: Tier::FeatureStore,
                total_entries: 0,
                avg_access_count: None,
                active_entries: 0,
                avg_quality: None,
            })
        }
    }

    #[tokio::test]
    async fn test_concurrent_runs_of_one_policy_are_exclusive() {
        let h = harness_with(
            EngineConfig::default(),
            Some((Tier::FeatureStore, Arc::new(SlowTarget))),
        );
        h.engine.create_policy(low_quality_policy()).await.unwrap();

        let (first, second) = tokio::join!(
            h.engine.run_policy("fs_low", false),
            h.engine.run_policy("fs_low", false)
        );
        let results = [first, second];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(
            results
                .iter()
                .filter(|r| matches!(r, Err(CacheError::PolicyBusy(_))))
                .count(),
            1
        );

        // released once the winner finished
        assert!(h.engine.run_policy("fs_low", false).await.is_ok());
    }

    /// Deletes one full batch, then loses the connection
    struct FailsAfterFirstBatch {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RetentionTarget for FailsAfterFirstBatch {
        async fn count_matching(&self, _: &EvictionCriteria) -> Result<u64> {
            Ok(5)
        }

        async fn evict_batch(&self, _: &EvictionCriteria, limit: u64) -> Result<u64> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(limit)
            } else {
                Err(CacheError::StorageUnavailable("connection reset".into()))
            }
        }

        async fn stats(&self, _: DateTime<Utc>) -> Result<TierStats> {
            Err(CacheError::StorageUnavailable("connection reset".into()))
        }
    }

    #[tokio::test]
    async fn test_failed_run_still_counts_committed_batches() {
        let config = EngineConfig {
            eviction_batch_size: 2,
            ..EngineConfig::default()
        };
        let h = harness_with(
            config,
            Some((
                Tier::FeatureStore,
                Arc::new(FailsAfterFirstBatch {
                    calls: AtomicUsize::new(0),
                }),
            )),
        );
        let created = h.engine.create_policy(low_quality_policy()).await.unwrap();

        let err = h.engine.run_policy("fs_low", false).await.unwrap_err();
        assert!(matches!(err, CacheError::PolicyExecutionFailed { .. }));

        let run = &h.engine.history(1).await[0];
        assert!(!run.success);
        assert_eq!(run.records_matched, 5);
        assert_eq!(run.records_affected, 2);
        assert!((run.space_freed_mb - 0.004).abs() < 1e-9);

        let policy = h.engine.get_policy("fs_low").await.unwrap();
        assert_eq!(policy.records_deleted, 2);
        assert!(policy.last_error.unwrap().contains("connection reset"));
        assert_eq!(policy.next_execution, created.next_execution);

        let evicted: Vec<_> = h
            .memory
            .metric_records()
            .into_iter()
            .filter(|m| m.metric_type == MetricType::RecordsEvicted)
            .collect();
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].value, 2.0);
    }

    #[tokio::test]
    async fn test_eviction_runs_in_batches() {
        let config = EngineConfig {
            eviction_batch_size: 2,
            ..EngineConfig::default()
        };
        let h = harness_with(config, None);
        h.engine.create_policy(low_quality_policy()).await.unwrap();
        for i in 0..5 {
            h.features
                .put(feature(&format!("obs-{}", i), 0.1))
                .await
                .unwrap();
        }
        h.clock.advance(ChronoDuration::days(91));

        let run = h.engine.run_policy("fs_low", false).await.unwrap();
        assert_eq!(run.records_affected, 5);
        assert_eq!(h.memory.tier_len(Tier::FeatureStore), 0);
    }

    #[tokio::test]
    async fn test_unknown_policy_not_found() {
        let h = harness();
        let err = h.engine.run_policy("missing", false).await.unwrap_err();
        assert!(matches!(err, CacheError::NotFound(_)));
        let err = h.engine.delete_policy("missing").await.unwrap_err();
        assert!(matches!(err, CacheError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_and_duplicate() {
        let h = harness();
        let unbounded = RetentionPolicy::new("all", "everything", Tier::FeatureStore, 0);
        assert!(matches!(
            h.engine.create_policy(unbounded).await.unwrap_err(),
            CacheError::InvalidPolicy(_)
        ));

        let bad_quality = RetentionPolicy {
            min_quality_score: 1.5,
            ..low_quality_policy()
        };
        assert!(matches!(
            h.engine.create_policy(bad_quality).await.unwrap_err(),
            CacheError::InvalidPolicy(_)
        ));

        h.engine.create_policy(low_quality_policy()).await.unwrap();
        assert!(matches!(
            h.engine.create_policy(low_quality_policy()).await.unwrap_err(),
            CacheError::InvalidPolicy(_)
        ));
    }

    #[tokio::test]
    async fn test_update_keeps_counters() {
        let h = harness();
        h.engine.create_policy(low_quality_policy()).await.unwrap();
        h.features.put(feature("obs-1", 0.1)).await.unwrap();
        h.clock.advance(ChronoDuration::days(91));
        h.engine.run_policy("fs_low", false).await.unwrap();

        let updated = h
            .engine
            .update_policy(
                "fs_low",
                PolicyUpdate {
                    retention_days: Some(30),
                    execution_interval_hours: Some(6),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.retention_days, 30);
        assert_eq!(updated.records_deleted, 1);
        assert_eq!(
            updated.next_execution,
            Some(h.clock.now() + ChronoDuration::hours(6))
        );

        // a threshold-only change leaves the schedule alone
        let tightened = h
            .engine
            .update_policy(
                "fs_low",
                PolicyUpdate {
                    min_access_count: Some(2),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(tightened.next_execution, updated.next_execution);

        let disabled = h.engine.set_enabled("fs_low", false).await.unwrap();
        assert!(!disabled.enabled);
        h.clock.advance(ChronoDuration::days(10));
        assert!(h.engine.run_due().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_archive_falls_back_to_delete() {
        let h = harness();
        h.engine
            .create_policy(RetentionPolicy {
                action: PolicyAction::Archive,
                ..low_quality_policy()
            })
            .await
            .unwrap();
        h.features.put(feature("obs-1", 0.1)).await.unwrap();
        h.clock.advance(ChronoDuration::days(91));

        let run = h.engine.run_policy("fs_low", false).await.unwrap();
        assert_eq!(run.records_affected, 1);
        assert_eq!(h.memory.tier_len(Tier::FeatureStore), 0);
    }

    #[tokio::test]
    async fn test_history_is_bounded_and_newest_first() {
        let config = EngineConfig {
            history_limit: 2,
            ..EngineConfig::default()
        };
        let h = harness_with(config, None);
        h.engine.create_policy(low_quality_policy()).await.unwrap();

        for _ in 0..3 {
            h.engine.run_policy("fs_low", true).await.unwrap();
            h.clock.advance(ChronoDuration::minutes(1));
        }
        let history = h.engine.history(10).await;
        assert_eq!(history.len(), 2);
        assert!(history[0].executed_at > history[1].executed_at);
    }

    #[tokio::test]
    async fn test_tier_stats_cover_every_tier() {
        let h = harness();
        h.features.put(feature("obs-1", 0.5)).await.unwrap();
        let stats = h.engine.tier_stats().await.unwrap();
        assert_eq!(stats.len(), Tier::ALL.len());
        let features = stats
            .iter()
            .find(|s| s.tier == Tier::FeatureStore)
            .unwrap();
        assert_eq!(features.total_entries, 1);
        assert_eq!(features.active_entries, 1);
        assert_eq!(features.avg_quality, Some(0.5));
    }
}
