use super::{Lease, MemoryStore};
use crate::backend::{LeaseManager, PolicyStore};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ml_retention_db::RetentionPolicy;

#[async_trait]
impl PolicyStore for MemoryStore {
    async fn list(&self) -> Result<Vec<RetentionPolicy>> {
        Ok(self.policies.read().await.values().cloned().collect())
    }

    async fn get(&self, policy_id: &str) -> Result<Option<RetentionPolicy>> {
        Ok(self.policies.read().await.get(policy_id).cloned())
    }

    async fn insert(&self, policy: &RetentionPolicy) -> Result<bool> {
        let mut policies = self.policies.write().await;
        if policies.contains_key(&policy.policy_id) {
            return Ok(false);
        }
        policies.insert(policy.policy_id.clone(), policy.clone());
        Ok(true)
    }

    async fn update_definition(&self, policy: &RetentionPolicy) -> Result<bool> {
        let mut policies = self.policies.write().await;
        let Some(stored) = policies.get_mut(&policy.policy_id) else {
            return Ok(false);
        };
        *stored = RetentionPolicy {
            last_executed: stored.last_executed,
            next_execution: stored.next_execution,
            last_error: stored.last_error.take(),
            records_processed: stored.records_processed,
            records_deleted: stored.records_deleted,
            space_freed_mb: stored.space_freed_mb,
            ..policy.clone()
        };
        Ok(true)
    }

    async fn reschedule(&self, policy_id: &str, next_execution: DateTime<Utc>) -> Result<bool> {
        let mut policies = self.policies.write().await;
        let Some(stored) = policies.get_mut(policy_id) else {
            return Ok(false);
        };
        stored.next_execution = Some(next_execution);
        Ok(true)
    }

    async fn delete(&self, policy_id: &str) -> Result<bool> {
        Ok(self.policies.write().await.remove(policy_id).is_some())
    }

    async fn record_success(
        &self,
        policy_id: &str,
        records_evicted: i64,
        space_freed_mb: f64,
        executed_at: DateTime<Utc>,
        next_execution: DateTime<Utc>,
    ) -> Result<()> {
        if let Some(policy) = self.policies.write().await.get_mut(policy_id) {
            policy.records_processed += records_evicted;
            policy.records_deleted += records_evicted;
            policy.space_freed_mb += space_freed_mb;
            policy.last_executed = Some(executed_at);
            policy.next_execution = Some(next_execution);
            policy.last_error = None;
        }
        Ok(())
    }

    async fn record_failure(
        &self,
        policy_id: &str,
        error: &str,
        records_evicted: i64,
        space_freed_mb: f64,
    ) -> Result<()> {
        if let Some(policy) = self.policies.write().await.get_mut(policy_id) {
            policy.records_processed += records_evicted;
            policy.records_deleted += records_evicted;
            policy.space_freed_mb += space_freed_mb;
            policy.last_error = Some(error.to_string());
        }
        Ok(())
    }
}

#[async_trait]
impl LeaseManager for MemoryStore {
    async fn try_acquire(
        &self,
        policy_id: &str,
        holder: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut leases = self.leases.lock().await;
        if leases.get(policy_id).is_some_and(|l| l.expires_at >= now) {
            return Ok(false);
        }
        leases.insert(
            policy_id.to_string(),
            Lease {
                holder: holder.to_string(),
                expires_at,
            },
        );
        Ok(true)
    }

    async fn release(&self, policy_id: &str, holder: &str) -> Result<()> {
        let mut leases = self.leases.lock().await;
        if leases.get(policy_id).is_some_and(|l| l.holder == holder) {
            leases.remove(policy_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use ml_retention_db::Tier;

    #[tokio::test]
    async fn test_lease_excludes_everyone_until_expiry() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let until = now + Duration::minutes(10);

        assert!(store.try_acquire("p", "a", now, until).await.unwrap());
        assert!(!store.try_acquire("p", "b", now, until).await.unwrap());
        // not reentrant, even for the same token
        assert!(!store.try_acquire("p", "a", now, until).await.unwrap());
        // expired lease can be taken over
        let later = until + Duration::seconds(1);
        assert!(store
            .try_acquire("p", "b", later, later + Duration::minutes(10))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_release_only_by_holder() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let until = now + Duration::minutes(10);
        store.try_acquire("p", "a", now, until).await.unwrap();

        store.release("p", "b").await.unwrap();
        assert!(!store.try_acquire("p", "b", now, until).await.unwrap());

        store.release("p", "a").await.unwrap();
        assert!(store.try_acquire("p", "b", now, until).await.unwrap());
    }

    #[tokio::test]
    async fn test_update_definition_keeps_counters() {
        let store = MemoryStore::new();
        let policy = RetentionPolicy::new("p", "P", Tier::FeatureStore, 30);
        assert!(store.insert(&policy).await.unwrap());
        assert!(!store.insert(&policy).await.unwrap());

        let now = Utc::now();
        store
            .record_success("p", 7, 0.014, now, now + Duration::hours(24))
            .await
            .unwrap();

        let updated = RetentionPolicy {
            retention_days: 60,
            ..policy
        };
        assert!(store.update_definition(&updated).await.unwrap());

        let stored = store.get("p").await.unwrap().unwrap();
        assert_eq!(stored.retention_days, 60);
        assert_eq!(stored.records_deleted, 7);
        assert_eq!(stored.last_executed, Some(now));
    }

    #[tokio::test]
    async fn test_stale_definition_update_keeps_newer_schedule() {
        let store = MemoryStore::new();
        let policy = RetentionPolicy::new("p", "P", Tier::FeatureStore, 30);
        store.insert(&policy).await.unwrap();
        let stale = store.get("p").await.unwrap().unwrap();

        // a run finishes between the read and the write
        let now = Utc::now();
        let next = now + Duration::hours(24);
        store.record_success("p", 3, 0.006, now, next).await.unwrap();

        let edited = RetentionPolicy {
            min_access_count: 2,
            ..stale
        };
        store.update_definition(&edited).await.unwrap();

        let stored = store.get("p").await.unwrap().unwrap();
        assert_eq!(stored.min_access_count, 2);
        assert_eq!(stored.next_execution, Some(next));

        let moved = now + Duration::hours(6);
        assert!(store.reschedule("p", moved).await.unwrap());
        assert_eq!(store.get("p").await.unwrap().unwrap().next_execution, Some(moved));
        assert!(!store.reschedule("missing", moved).await.unwrap());
    }

    #[tokio::test]
    async fn test_failure_counts_partial_progress() {
        let store = MemoryStore::new();
        let policy = RetentionPolicy::new("p", "P", Tier::FeatureStore, 30);
        store.insert(&policy).await.unwrap();

        store.record_failure("p", "timed out", 1000, 2.0).await.unwrap();

        let stored = store.get("p").await.unwrap().unwrap();
        assert_eq!(stored.records_deleted, 1000);
        assert_eq!(stored.last_error.as_deref(), Some("timed out"));
        assert_eq!(stored.last_executed, None);
        assert_eq!(stored.next_execution, policy.next_execution);
    }
}
