//! The follower-sync job queue: at most one shard synchronization runs
//! at any time.
//!
//! A fresh cluster start can leave many shards under-replicated at
//! once; running their catch-ups one at a time keeps the leaders from
//! being overloaded, and respects the replication client's
//! one-initial-sync-per-leader constraint. Jobs drain in ascending
//! shard-name order, so the schedule is deterministic given the
//! scheduled set.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use osprey_common::types::{DatabaseName, PlanId, ServerId, ShardName};

use crate::context::SyncContext;
use crate::sync::{ShardSynchronizer, SyncOutcome};

/// One pending or running shard synchronization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncJob {
    pub database: DatabaseName,
    pub shard: ShardName,
    pub plan_id: PlanId,
    pub leader: ServerId,
}

#[derive(Default)]
struct SyncKeyspace {
    scheduled: BTreeMap<ShardName, SyncJob>,
    running: Option<SyncJob>,
}

#[derive(Default)]
struct SchedulerMetrics {
    scheduled: AtomicU64,
    launched: AtomicU64,
    synced: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

/// Point-in-time counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerMetricsSnapshot {
    pub scheduled: u64,
    pub launched: u64,
    pub synced: u64,
    pub failed: u64,
    pub cancelled: u64,
}

/// Point-in-time queue state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerSnapshot {
    pub scheduled: Vec<ShardName>,
    pub running: Option<ShardName>,
}

struct SchedulerShared {
    ctx: Arc<SyncContext>,
    keyspace: Mutex<SyncKeyspace>,
    metrics: SchedulerMetrics,
}

/// Schedules shard synchronizations and runs them one at a time on a
/// dedicated background thread per job.
#[derive(Clone)]
pub struct SyncScheduler {
    shared: Arc<SchedulerShared>,
}

impl SyncScheduler {
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        Self {
            shared: Arc::new(SchedulerShared {
                ctx,
                keyspace: Mutex::new(SyncKeyspace::default()),
                metrics: SchedulerMetrics::default(),
            }),
        }
    }

    /// Schedule one shard synchronization. Returns false when the shard
    /// is already scheduled or running.
    pub fn schedule(&self, job: SyncJob) -> bool {
        {
            let mut keyspace = self.shared.keyspace.lock();
            let busy = keyspace
                .running
                .as_ref()
                .is_some_and(|running| running.shard == job.shard)
                || keyspace.scheduled.contains_key(&job.shard);
            if busy {
                tracing::debug!(shard = %job.shard,
                    "synchronization already scheduled or running, ignoring");
                return false;
            }
            tracing::debug!(database = %job.database, shard = %job.shard, leader = %job.leader,
                "scheduled shard synchronization");
            keyspace.scheduled.insert(job.shard.clone(), job);
            self.shared.metrics.scheduled.fetch_add(1, Ordering::Relaxed);
        }
        self.try_launch();
        true
    }

    /// Promote the first scheduled job to running, when nothing runs.
    /// Called after scheduling and whenever a run finishes.
    pub fn try_launch(&self) {
        if self.shared.ctx.shutdown.is_shutdown() {
            let mut keyspace = self.shared.keyspace.lock();
            if !keyspace.scheduled.is_empty() {
                tracing::debug!(count = keyspace.scheduled.len(),
                    "discarding scheduled synchronizations on shutdown");
                keyspace.scheduled.clear();
            }
            return;
        }
        let job = {
            let mut keyspace = self.shared.keyspace.lock();
            if keyspace.running.is_some() {
                return;
            }
            match keyspace.scheduled.pop_first() {
                Some((_, job)) => {
                    keyspace.running = Some(job.clone());
                    job
                }
                None => return,
            }
        };

        let shared = self.shared.clone();
        let thread_job = job.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("osprey-shard-sync-{}", job.shard))
            .spawn(move || {
                let outcome = ShardSynchronizer::new(&shared.ctx).run(&thread_job);
                let counter = match outcome {
                    SyncOutcome::Synced | SyncOutcome::AlreadyInSync => &shared.metrics.synced,
                    SyncOutcome::Cancelled => &shared.metrics.cancelled,
                    SyncOutcome::Failed => &shared.metrics.failed,
                };
                counter.fetch_add(1, Ordering::Relaxed);
                shared.keyspace.lock().running = None;
                SyncScheduler { shared }.try_launch();
            });

        match spawned {
            Ok(_) => {
                self.shared.metrics.launched.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                tracing::error!(shard = %job.shard, error = %e,
                    "could not spawn shard-sync thread; the shard stays under-replicated until the next pass");
                self.shared.keyspace.lock().running = None;
            }
        }
    }

    pub fn is_idle(&self) -> bool {
        let keyspace = self.shared.keyspace.lock();
        keyspace.running.is_none() && keyspace.scheduled.is_empty()
    }

    /// Wait until the queue drains. For tests and shutdown paths.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.is_idle() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        self.is_idle()
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        let keyspace = self.shared.keyspace.lock();
        SchedulerSnapshot {
            scheduled: keyspace.scheduled.keys().cloned().collect(),
            running: keyspace.running.as_ref().map(|job| job.shard.clone()),
        }
    }

    pub fn metrics(&self) -> SchedulerMetricsSnapshot {
        SchedulerMetricsSnapshot {
            scheduled: self.shared.metrics.scheduled.load(Ordering::Relaxed),
            launched: self.shared.metrics.launched.load(Ordering::Relaxed),
            synced: self.shared.metrics.synced.load(Ordering::Relaxed),
            failed: self.shared.metrics.failed.load(Ordering::Relaxed),
            cancelled: self.shared.metrics.cancelled.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    use osprey_common::config::ClusterSyncConfig;
    use osprey_common::types::ServerRole;

    use crate::agency::{paths, Agency, MemoryAgency};
    use crate::plan::{
        CollectionProperties, CollectionStatus, CollectionType, PlanCollection,
    };
    use crate::testing::{MemoryStore, ScriptedPeer, ScriptedReplication};

    fn job(shard: &str) -> SyncJob {
        SyncJob {
            database: DatabaseName::from("d1"),
            shard: ShardName::from(shard),
            plan_id: PlanId::from("100"),
            leader: ServerId::from("A"),
        }
    }

    /// Context whose sync runs stall in the leader-wait loop: the plan
    /// lists the shard with us as follower, but the leader never
    /// registers it in Current.
    fn stalling_ctx(shards: &[&str], wait_ms: u64) -> Arc<SyncContext> {
        let agency = Arc::new(MemoryAgency::new());
        let collection = PlanCollection {
            id: PlanId::from("100"),
            name: "c1".into(),
            collection_type: CollectionType::Document,
            status: CollectionStatus::Loaded,
            shards: shards
                .iter()
                .map(|s| {
                    (
                        ShardName::from(*s),
                        vec![ServerId::from("A"), ServerId::from("B")],
                    )
                })
                .collect(),
            indexes: vec![],
            properties: CollectionProperties::default(),
        };
        agency
            .set(
                &paths::plan_collection(&DatabaseName::from("d1"), &PlanId::from("100")),
                serde_json::to_value(&collection).unwrap(),
            )
            .unwrap();
        agency
            .set(
                &paths::server_endpoint(&ServerId::from("A")),
                json!("tcp://leader:8529"),
            )
            .unwrap();
        let config = ClusterSyncConfig {
            leader_wait_attempts: 1000,
            leader_wait_interval_ms: wait_ms,
            ..Default::default()
        };
        Arc::new(SyncContext::new(
            ServerId::from("B"),
            ServerRole::Primary,
            config,
            agency,
            Arc::new(MemoryStore::new()),
            Arc::new(ScriptedReplication::new()),
            Arc::new(ScriptedPeer::new()),
        ))
    }

    #[test]
    fn test_duplicate_schedule_is_rejected() {
        let ctx = stalling_ctx(&["s1"], 20);
        let scheduler = SyncScheduler::new(ctx.clone());

        assert!(scheduler.schedule(job("s1")));
        // Immediately re-scheduling the same shard is a no-op while it
        // is scheduled or running.
        assert!(!scheduler.schedule(job("s1")));

        ctx.shutdown.shutdown();
        assert!(scheduler.wait_idle(Duration::from_secs(5)));
        assert_eq!(scheduler.metrics().scheduled, 1);
    }

    #[test]
    fn test_at_most_one_running() {
        let ctx = stalling_ctx(&["s1", "s2", "s3"], 20);
        let scheduler = SyncScheduler::new(ctx.clone());

        assert!(scheduler.schedule(job("s1")));
        assert!(scheduler.schedule(job("s2")));
        assert!(scheduler.schedule(job("s3")));

        // One running, the others queued; no shard both scheduled and
        // running.
        let snapshot = scheduler.snapshot();
        assert!(snapshot.running.is_some());
        assert_eq!(snapshot.scheduled.len(), 2);
        if let Some(running) = &snapshot.running {
            assert!(!snapshot.scheduled.contains(running));
        }

        ctx.shutdown.shutdown();
        assert!(scheduler.wait_idle(Duration::from_secs(5)));
    }

    #[test]
    fn test_queue_drains_after_completion() {
        // Unknown plan: runs cancel immediately.
        let agency = Arc::new(MemoryAgency::new());
        let ctx = Arc::new(SyncContext::new(
            ServerId::from("B"),
            ServerRole::Primary,
            ClusterSyncConfig {
                leader_wait_attempts: 2,
                leader_wait_interval_ms: 1,
                ..Default::default()
            },
            agency,
            Arc::new(MemoryStore::new()),
            Arc::new(ScriptedReplication::new()),
            Arc::new(ScriptedPeer::new()),
        ));
        let scheduler = SyncScheduler::new(ctx);

        assert!(scheduler.schedule(job("s1")));
        assert!(scheduler.schedule(job("s2")));
        assert!(scheduler.wait_idle(Duration::from_secs(5)));

        let metrics = scheduler.metrics();
        assert_eq!(metrics.launched, 2);
        assert_eq!(metrics.cancelled, 2);
        // Re-scheduling after the queue drained works again.
        assert!(scheduler.schedule(job("s1")));
        assert!(scheduler.wait_idle(Duration::from_secs(5)));
    }

    #[test]
    fn test_no_launch_after_shutdown() {
        let ctx = stalling_ctx(&["s1"], 20);
        ctx.shutdown.shutdown();
        let scheduler = SyncScheduler::new(ctx);
        assert!(scheduler.schedule(job("s1")));
        // Never launched; the queue is discarded on shutdown.
        std::thread::sleep(Duration::from_millis(20));
        let snapshot = scheduler.snapshot();
        assert_eq!(snapshot.running, None);
        assert!(snapshot.scheduled.is_empty());
        assert_eq!(scheduler.metrics().launched, 0);
    }
}
