//! Access to the external coordination store ("agency").
//!
//! The agency holds the Plan and Current documents as a tree of JSON
//! values addressed by `/`-separated paths. All Current mutations
//! produced by a reconciliation pass are collected into an
//! [`AgencyBatch`] and applied through [`write_locked`]: the partition
//! write lock is the only cluster-wide mutual-exclusion gate, and the
//! partition version counter is bumped once per applied batch so other
//! servers notice the change.

use std::collections::BTreeMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;

use osprey_common::config::ClusterSyncConfig;
use osprey_common::error::{AgencyError, OspreyError, OspreyResult};
use osprey_common::types::{DatabaseName, PlanId, ServerId, ShardName};

/// Partition holding the desired state.
pub const PLAN_PARTITION: &str = "Plan";
/// Partition holding the observed state.
pub const CURRENT_PARTITION: &str = "Current";

/// Agency key construction.
pub mod paths {
    use super::*;

    pub fn plan_collection(db: &DatabaseName, plan_id: &PlanId) -> String {
        format!("Plan/Collections/{db}/{plan_id}")
    }

    pub fn current_database(db: &DatabaseName, server: &ServerId) -> String {
        format!("Current/Databases/{db}/{server}")
    }

    pub fn current_collection(db: &DatabaseName, plan_id: &PlanId, shard: &ShardName) -> String {
        format!("Current/Collections/{db}/{plan_id}/{shard}")
    }

    pub fn server_endpoint(server: &ServerId) -> String {
        format!("Current/ServersRegistered/{server}/endpoint")
    }

    pub fn version(partition: &str) -> String {
        format!("{partition}/Version")
    }
}

/// Versioned key/value access plus a distributed write lock per
/// partition.
pub trait Agency: Send + Sync {
    fn get(&self, path: &str) -> OspreyResult<Option<Value>>;
    fn set(&self, path: &str, value: Value) -> OspreyResult<()>;
    fn remove(&self, path: &str) -> OspreyResult<()>;
    fn lock_write(&self, partition: &str, ttl: Duration, timeout: Duration) -> OspreyResult<()>;
    fn unlock_write(&self, partition: &str, timeout: Duration) -> OspreyResult<()>;
    /// Atomically increment the counter at `key`, returning the new value.
    fn increase_version(&self, key: &str) -> OspreyResult<u64>;
}

/// One mutation in a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum AgencyOp {
    Set { path: String, value: Value },
    Remove { path: String },
}

/// Ordered batch of agency mutations, applied under one write lock with
/// one version bump.
#[derive(Debug, Clone, Default)]
pub struct AgencyBatch {
    ops: Vec<AgencyOp>,
}

impl AgencyBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, path: String, value: Value) {
        self.ops.push(AgencyOp::Set { path, value });
    }

    pub fn remove(&mut self, path: String) {
        self.ops.push(AgencyOp::Remove { path });
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn ops(&self) -> &[AgencyOp] {
        &self.ops
    }
}

/// Serialize a value for an agency write.
pub(crate) fn to_json<T: serde::Serialize>(value: &T) -> OspreyResult<Value> {
    serde_json::to_value(value).map_err(|e| OspreyError::Internal(e.to_string()))
}

/// Apply a batch and bump the partition version. The caller must hold
/// the partition write lock.
pub fn apply_batch_locked(
    agency: &dyn Agency,
    partition: &str,
    batch: &AgencyBatch,
) -> OspreyResult<()> {
    if batch.is_empty() {
        return Ok(());
    }
    for op in batch.ops() {
        match op {
            AgencyOp::Set { path, value } => agency.set(path, value.clone())?,
            AgencyOp::Remove { path } => agency.remove(path)?,
        }
    }
    agency.increase_version(&paths::version(partition))?;
    Ok(())
}

/// Apply a batch of agency mutations under the partition write lock,
/// bumping the partition version counter. Empty batches are a no-op (no
/// lock, no version bump). The lock is always released, also when a
/// mutation or the version bump fails; an unlock failure on top of an
/// earlier failure is logged and the earlier failure wins.
pub fn write_locked(
    agency: &dyn Agency,
    partition: &str,
    config: &ClusterSyncConfig,
    batch: &AgencyBatch,
) -> OspreyResult<()> {
    if batch.is_empty() {
        return Ok(());
    }
    agency.lock_write(
        partition,
        config.agency_lock_ttl(),
        config.agency_lock_timeout(),
    )?;
    let applied = apply_batch_locked(agency, partition, batch);
    let unlocked = agency.unlock_write(partition, config.agency_lock_timeout());
    if let Err(e) = &unlocked {
        tracing::error!(partition, error = %e, "failed to release agency write lock");
    }
    applied.and(unlocked)
}

/// Holds a partition write lock across a longer section (the
/// take-over-responsibility pass). Released explicitly via
/// [`WriteLockGuard::release`]; dropping without release unlocks
/// best-effort.
pub struct WriteLockGuard<'a> {
    agency: &'a dyn Agency,
    partition: &'a str,
    timeout: Duration,
    released: bool,
}

impl<'a> WriteLockGuard<'a> {
    pub fn acquire(
        agency: &'a dyn Agency,
        partition: &'a str,
        config: &ClusterSyncConfig,
    ) -> OspreyResult<Self> {
        agency.lock_write(
            partition,
            config.agency_lock_ttl(),
            config.agency_lock_timeout(),
        )?;
        Ok(Self {
            agency,
            partition,
            timeout: config.agency_lock_timeout(),
            released: false,
        })
    }

    pub fn release(mut self) -> OspreyResult<()> {
        self.released = true;
        self.agency.unlock_write(self.partition, self.timeout)
    }
}

impl Drop for WriteLockGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.agency.unlock_write(self.partition, self.timeout) {
                tracing::error!(partition = self.partition, error = %e,
                    "failed to release agency write lock on drop");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryAgency — in-process implementation
// ---------------------------------------------------------------------------

/// In-process agency for tests and embedded single-process clusters.
///
/// Keeps the tree as a flat path -> value map, tracks per-partition lock
/// flags, and records every operation in an event log so tests can
/// assert lock/mutate/bump/unlock ordering. Write failures can be
/// injected per path fragment.
#[derive(Default)]
pub struct MemoryAgency {
    inner: Mutex<MemoryAgencyInner>,
}

#[derive(Default)]
struct MemoryAgencyInner {
    tree: BTreeMap<String, Value>,
    locked: BTreeMap<String, bool>,
    events: Vec<String>,
    fail_set_fragments: Vec<String>,
}

impl MemoryAgency {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every subsequent `set` whose path contains `fragment` fails.
    pub fn inject_set_failure(&self, fragment: &str) {
        self.inner.lock().fail_set_fragments.push(fragment.to_string());
    }

    /// Chronological log of operations ("lock:Current", "set:<path>",
    /// "remove:<path>", "bump:<key>", "unlock:Current").
    pub fn events(&self) -> Vec<String> {
        self.inner.lock().events.clone()
    }

    /// Current value of a version counter (0 when never bumped).
    pub fn version_of(&self, partition: &str) -> u64 {
        self.inner
            .lock()
            .tree
            .get(&paths::version(partition))
            .and_then(Value::as_u64)
            .unwrap_or(0)
    }

    /// Number of keys with the given path prefix.
    pub fn count_prefix(&self, prefix: &str) -> usize {
        self.inner
            .lock()
            .tree
            .keys()
            .filter(|k| k.starts_with(prefix))
            .count()
    }
}

impl Agency for MemoryAgency {
    fn get(&self, path: &str) -> OspreyResult<Option<Value>> {
        Ok(self.inner.lock().tree.get(path).cloned())
    }

    fn set(&self, path: &str, value: Value) -> OspreyResult<()> {
        let mut inner = self.inner.lock();
        if inner
            .fail_set_fragments
            .iter()
            .any(|frag| path.contains(frag.as_str()))
        {
            inner.events.push(format!("set-failed:{path}"));
            return Err(AgencyError::Transport(format!("injected failure for {path}")).into());
        }
        inner.events.push(format!("set:{path}"));
        inner.tree.insert(path.to_string(), value);
        Ok(())
    }

    fn remove(&self, path: &str) -> OspreyResult<()> {
        let mut inner = self.inner.lock();
        inner.events.push(format!("remove:{path}"));
        let prefix = format!("{path}/");
        inner
            .tree
            .retain(|key, _| key.as_str() != path && !key.starts_with(&prefix));
        Ok(())
    }

    fn lock_write(&self, partition: &str, _ttl: Duration, timeout: Duration) -> OspreyResult<()> {
        let mut inner = self.inner.lock();
        if *inner.locked.get(partition).unwrap_or(&false) {
            return Err(AgencyError::LockTimeout {
                partition: partition.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }
            .into());
        }
        inner.events.push(format!("lock:{partition}"));
        inner.locked.insert(partition.to_string(), true);
        Ok(())
    }

    fn unlock_write(&self, partition: &str, _timeout: Duration) -> OspreyResult<()> {
        let mut inner = self.inner.lock();
        if !*inner.locked.get(partition).unwrap_or(&false) {
            return Err(AgencyError::Conflict(format!("'{partition}' is not locked")).into());
        }
        inner.events.push(format!("unlock:{partition}"));
        inner.locked.insert(partition.to_string(), false);
        Ok(())
    }

    fn increase_version(&self, key: &str) -> OspreyResult<u64> {
        let mut inner = self.inner.lock();
        inner.events.push(format!("bump:{key}"));
        let next = inner.tree.get(key).and_then(Value::as_u64).unwrap_or(0) + 1;
        inner.tree.insert(key.to_string(), Value::from(next));
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config() -> ClusterSyncConfig {
        ClusterSyncConfig::default()
    }

    #[test]
    fn test_get_set_remove() {
        let agency = MemoryAgency::new();
        agency.set("Current/Databases/d1/A", json!({"name": "d1"})).unwrap();
        assert_eq!(
            agency.get("Current/Databases/d1/A").unwrap().unwrap()["name"],
            "d1"
        );
        agency.remove("Current/Databases/d1/A").unwrap();
        assert!(agency.get("Current/Databases/d1/A").unwrap().is_none());
    }

    #[test]
    fn test_remove_deletes_subtree() {
        let agency = MemoryAgency::new();
        agency.set("Current/Collections/d1/100/s1", json!(1)).unwrap();
        agency.set("Current/Collections/d1/100/s2", json!(2)).unwrap();
        agency.remove("Current/Collections/d1/100").unwrap();
        assert_eq!(agency.count_prefix("Current/Collections/d1"), 0);
    }

    #[test]
    fn test_write_locked_orders_lock_ops_bump_unlock() {
        let agency = MemoryAgency::new();
        let mut batch = AgencyBatch::new();
        batch.set("Current/Databases/d1/A".into(), json!({"name": "d1"}));
        batch.remove("Current/Databases/d2/A".into());

        write_locked(&agency, CURRENT_PARTITION, &config(), &batch).unwrap();

        assert_eq!(
            agency.events(),
            vec![
                "lock:Current",
                "set:Current/Databases/d1/A",
                "remove:Current/Databases/d2/A",
                "bump:Current/Version",
                "unlock:Current",
            ]
        );
        assert_eq!(agency.version_of(CURRENT_PARTITION), 1);
    }

    #[test]
    fn test_write_locked_empty_batch_is_noop() {
        let agency = MemoryAgency::new();
        write_locked(&agency, CURRENT_PARTITION, &config(), &AgencyBatch::new()).unwrap();
        assert!(agency.events().is_empty());
        assert_eq!(agency.version_of(CURRENT_PARTITION), 0);
    }

    #[test]
    fn test_write_locked_unlocks_on_op_failure() {
        let agency = MemoryAgency::new();
        agency.inject_set_failure("d1");
        let mut batch = AgencyBatch::new();
        batch.set("Current/Databases/d1/A".into(), json!({}));

        let err = write_locked(&agency, CURRENT_PARTITION, &config(), &batch).unwrap_err();
        assert!(err.is_pass_fatal());

        let events = agency.events();
        assert_eq!(events.last().unwrap(), "unlock:Current");
        // No version bump after a failed mutation.
        assert_eq!(agency.version_of(CURRENT_PARTITION), 0);
    }

    #[test]
    fn test_lock_is_exclusive() {
        let agency = MemoryAgency::new();
        agency
            .lock_write(CURRENT_PARTITION, Duration::from_secs(120), Duration::from_secs(60))
            .unwrap();
        assert!(agency
            .lock_write(CURRENT_PARTITION, Duration::from_secs(120), Duration::from_secs(60))
            .is_err());
        agency
            .unlock_write(CURRENT_PARTITION, Duration::from_secs(60))
            .unwrap();
        agency
            .lock_write(CURRENT_PARTITION, Duration::from_secs(120), Duration::from_secs(60))
            .unwrap();
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let agency = MemoryAgency::new();
        {
            let _guard = WriteLockGuard::acquire(&agency, CURRENT_PARTITION, &config()).unwrap();
        }
        assert_eq!(
            agency.events(),
            vec!["lock:Current", "unlock:Current"]
        );
    }

    #[test]
    fn test_guard_explicit_release() {
        let agency = MemoryAgency::new();
        let guard = WriteLockGuard::acquire(&agency, CURRENT_PARTITION, &config()).unwrap();
        guard.release().unwrap();
        // Releasing again through drop must not double-unlock.
        assert_eq!(agency.events(), vec!["lock:Current", "unlock:Current"]);
    }

    #[test]
    fn test_version_bump_increments() {
        let agency = MemoryAgency::new();
        assert_eq!(agency.increase_version("Plan/Version").unwrap(), 1);
        assert_eq!(agency.increase_version("Plan/Version").unwrap(), 2);
        assert_eq!(agency.version_of(PLAN_PARTITION), 2);
    }
}
