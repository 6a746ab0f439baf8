//! One leader-to-follower shard catch-up run.
//!
//! Phases: initial sync -> read-lock acquire -> finalize -> register,
//! with cleanup that always tears down the barrier and the read lock.
//! The barrier guards the leader's WAL retention for the initial sync;
//! the read lock freezes writes for the finalize handoff. They are
//! independent, overlapping leases.
//!
//! A failed run is not retried here: the shard simply stays
//! under-replicated until the next reconciliation pass schedules it
//! again.

use std::time::Instant;

use osprey_common::error::{OspreyResult, ReplicationError};

use crate::context::SyncContext;
use crate::leader_proto::{
    add_shard_follower, cancel_barrier, cancel_read_lock_on_leader, start_read_lock_on_leader,
    ReadLockHandle,
};
use crate::replication::InitialSync;
use crate::scheduler::SyncJob;

/// Terminal state of one sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The follower was registered with the leader.
    Synced,
    /// Current already lists this server; nothing to do.
    AlreadyInSync,
    /// The plan moved on, the leader never became ready, or shutdown
    /// was requested.
    Cancelled,
    /// A phase failed; details were logged.
    Failed,
}

enum Preflight {
    Proceed,
    AlreadyInSync,
    Cancelled,
}

/// Executes one shard sync run against the leader.
pub struct ShardSynchronizer<'a> {
    ctx: &'a SyncContext,
}

impl<'a> ShardSynchronizer<'a> {
    pub fn new(ctx: &'a SyncContext) -> Self {
        Self { ctx }
    }

    /// Run the protocol to completion, logging the outcome. Never
    /// panics; all failures end in [`SyncOutcome::Failed`].
    pub fn run(&self, job: &SyncJob) -> SyncOutcome {
        let started = Instant::now();
        tracing::debug!(database = %job.database, shard = %job.shard, leader = %job.leader,
            "starting shard synchronization");
        let outcome = match self.execute(job) {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(database = %job.database, shard = %job.shard,
                    error = %e, scope = ?e.scope(), "shard synchronization failed");
                SyncOutcome::Failed
            }
        };
        tracing::debug!(database = %job.database, shard = %job.shard, outcome = ?outcome,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "shard synchronization finished");
        outcome
    }

    fn execute(&self, job: &SyncJob) -> OspreyResult<SyncOutcome> {
        match self.preflight(job)? {
            Preflight::Cancelled => return Ok(SyncOutcome::Cancelled),
            Preflight::AlreadyInSync => {
                tracing::debug!(shard = %job.shard, "already in the current server list");
                return Ok(SyncOutcome::AlreadyInSync);
            }
            Preflight::Proceed => {}
        }

        let endpoint = self.ctx.server_endpoint(&job.leader)?;
        let peers = self.ctx.peers.as_ref();

        tracing::debug!(shard = %job.shard, endpoint = %endpoint, "running initial sync");
        let sync = self
            .ctx
            .replication
            .sync_incremental(&job.database, &job.shard, &endpoint, &job.leader)?;

        if !sync.collections.iter().any(|c| c == job.shard.as_str()) {
            if !cancel_barrier(peers, &endpoint, &job.database, sync.barrier_id) {
                tracing::error!(shard = %job.shard, barrier = sync.barrier_id,
                    "barrier cancellation failed; the leader will expire it");
            }
            return Err(ReplicationError::InitialSync {
                db: job.database.0.clone(),
                shard: job.shard.0.clone(),
                reason: "shard missing from the leader's collection set".into(),
            }
            .into());
        }

        // Request the write freeze while the barrier still protects the
        // synced WAL range; the barrier is torn down either way.
        let lock = start_read_lock_on_leader(
            peers,
            &self.ctx.shutdown,
            &self.ctx.config,
            &endpoint,
            &job.database,
            &job.shard,
        );
        if !cancel_barrier(peers, &endpoint, &job.database, sync.barrier_id) {
            tracing::error!(shard = %job.shard, barrier = sync.barrier_id,
                "barrier cancellation failed; the leader will expire it");
        }
        let lock = lock?;

        let result = self.finalize_and_register(job, &endpoint, &sync, &lock);
        if !cancel_read_lock_on_leader(peers, &endpoint, &lock.id) {
            tracing::error!(shard = %job.shard, lock = %lock.id,
                "read-lock release failed; the lock expires via its ttl");
        }
        result.map(|()| SyncOutcome::Synced)
    }

    fn finalize_and_register(
        &self,
        job: &SyncJob,
        endpoint: &str,
        sync: &InitialSync,
        lock: &ReadLockHandle,
    ) -> OspreyResult<()> {
        self.ctx.replication.sync_finalize(
            &job.database,
            &job.shard,
            sync.last_log_tick,
            endpoint,
            &job.leader,
        )?;
        add_shard_follower(
            self.ctx.peers.as_ref(),
            endpoint,
            &job.database,
            &job.shard,
            &self.ctx.server_id,
            &lock.id,
        )
    }

    /// Re-read Plan and Current and wait (bounded) until the leader has
    /// registered the shard. The run is cancelled when the plan moved
    /// on: the shard vanished, this server is no longer a planned
    /// follower, or the leader changed.
    fn preflight(&self, job: &SyncJob) -> OspreyResult<Preflight> {
        let me = &self.ctx.server_id;
        let config = &self.ctx.config;
        let mut attempts = 0u32;
        loop {
            if self.ctx.shutdown.is_shutdown() {
                return Ok(Preflight::Cancelled);
            }

            let planned = self
                .ctx
                .planned_servers(&job.database, &job.plan_id, &job.shard)?;
            let still_planned = planned.as_ref().is_some_and(|servers| {
                servers.first() == Some(&job.leader)
                    && servers.iter().position(|s| s == me).is_some_and(|p| p > 0)
            });
            if !still_planned {
                tracing::debug!(database = %job.database, shard = %job.shard,
                    "plan moved on, cancelling synchronization");
                return Ok(Preflight::Cancelled);
            }

            if let Some(current) = self
                .ctx
                .current_servers(&job.database, &job.plan_id, &job.shard)?
            {
                if current.first() == Some(&job.leader) {
                    if current.iter().any(|s| s == me) {
                        return Ok(Preflight::AlreadyInSync);
                    }
                    return Ok(Preflight::Proceed);
                }
            }

            attempts += 1;
            if attempts >= config.leader_wait_attempts {
                tracing::warn!(database = %job.database, shard = %job.shard, leader = %job.leader,
                    "leader never registered the shard in Current, giving up");
                return Ok(Preflight::Cancelled);
            }
            tracing::debug!(database = %job.database, shard = %job.shard, "waiting for leader");
            if self.ctx.shutdown.wait_timeout(config.leader_wait_interval()) {
                return Ok(Preflight::Cancelled);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use serde_json::json;

    use osprey_common::config::ClusterSyncConfig;
    use osprey_common::types::{DatabaseName, PlanId, ServerId, ServerRole, ShardName};

    use crate::agency::{paths, Agency, MemoryAgency};
    use crate::plan::{
        CollectionProperties, CollectionStatus, CollectionType, CurrentShard, PlanCollection,
    };
    use crate::testing::{ScriptedPeer, ScriptedReplication};
    use crate::transport::Method;

    const HOLD_READ_LOCK: &str = "/_api/replication/holdReadLockCollection";

    fn job() -> SyncJob {
        SyncJob {
            database: DatabaseName::from("d1"),
            shard: ShardName::from("s1"),
            plan_id: PlanId::from("100"),
            leader: ServerId::from("A"),
        }
    }

    fn seed_cluster(agency: &MemoryAgency, planned: &[&str], current: &[&str]) {
        let job = job();
        let collection = PlanCollection {
            id: job.plan_id.clone(),
            name: "c1".into(),
            collection_type: CollectionType::Document,
            status: CollectionStatus::Loaded,
            shards: [(
                job.shard.clone(),
                planned.iter().map(|s| ServerId::from(*s)).collect(),
            )]
            .into(),
            indexes: vec![],
            properties: CollectionProperties::default(),
        };
        agency
            .set(
                &paths::plan_collection(&job.database, &job.plan_id),
                serde_json::to_value(&collection).unwrap(),
            )
            .unwrap();
        if !current.is_empty() {
            let entry = CurrentShard {
                servers: current.iter().map(|s| ServerId::from(*s)).collect(),
                ..Default::default()
            };
            agency
                .set(
                    &paths::current_collection(&job.database, &job.plan_id, &job.shard),
                    serde_json::to_value(&entry).unwrap(),
                )
                .unwrap();
        }
        agency
            .set(
                &paths::server_endpoint(&job.leader),
                json!("tcp://leader:8529"),
            )
            .unwrap();
    }

    struct Fixture {
        ctx: Arc<SyncContext>,
        agency: Arc<MemoryAgency>,
        replication: Arc<ScriptedReplication>,
        peer: Arc<ScriptedPeer>,
    }

    fn fixture() -> Fixture {
        let agency = Arc::new(MemoryAgency::new());
        let replication = Arc::new(ScriptedReplication::new());
        let peer = Arc::new(ScriptedPeer::new());
        peer.respond(
            Method::Get,
            HOLD_READ_LOCK,
            ScriptedPeer::json_response(200, json!({"id": "lock-1"})),
        );
        peer.respond(
            Method::Post,
            HOLD_READ_LOCK,
            ScriptedPeer::async_accepted("job-1"),
        );
        peer.respond(
            Method::Put,
            HOLD_READ_LOCK,
            ScriptedPeer::json_response(200, json!({"lockHeld": true})),
        );
        let config = ClusterSyncConfig {
            read_lock_poll_interval_ms: 1,
            leader_wait_attempts: 3,
            leader_wait_interval_ms: 1,
            ..Default::default()
        };
        let store = Arc::new(crate::testing::MemoryStore::new());
        let ctx = Arc::new(SyncContext::new(
            ServerId::from("B"),
            ServerRole::Primary,
            config,
            agency.clone(),
            store,
            replication.clone(),
            peer.clone(),
        ));
        Fixture {
            ctx,
            agency,
            replication,
            peer,
        }
    }

    #[test]
    fn test_happy_path_registers_follower() {
        let f = fixture();
        seed_cluster(&f.agency, &["A", "B"], &["A"]);

        let outcome = ShardSynchronizer::new(&f.ctx).run(&job());
        assert_eq!(outcome, SyncOutcome::Synced);

        // Barrier cancelled exactly once, lock released exactly once.
        assert_eq!(f.peer.count(Method::Delete, "/_api/replication/barrier/42"), 1);
        assert_eq!(f.peer.count(Method::Delete, HOLD_READ_LOCK), 1);
        // Registered with the read-lock id from acquisition.
        let follower_puts: Vec<_> = f
            .peer
            .requests()
            .into_iter()
            .filter(|r| r.url.contains("addFollower"))
            .collect();
        assert_eq!(follower_puts.len(), 1);
        assert_eq!(follower_puts[0].body.as_ref().unwrap()["followerId"], "B");
        assert_eq!(follower_puts[0].body.as_ref().unwrap()["readLockId"], "lock-1");
        // Finalize used the initial sync's log tick.
        assert!(f
            .replication
            .calls()
            .contains(&crate::testing::ReplicationCall::SyncFinalize("s1".into(), 1000)));
    }

    #[test]
    fn test_shard_missing_from_leader_cancels_barrier_and_fails() {
        let f = fixture();
        seed_cluster(&f.agency, &["A", "B"], &["A"]);
        f.replication.script_initial(
            &ShardName::from("s1"),
            Ok(InitialSync {
                collections: vec!["other".into()],
                barrier_id: 99,
                last_log_tick: 5,
            }),
        );

        let outcome = ShardSynchronizer::new(&f.ctx).run(&job());
        assert_eq!(outcome, SyncOutcome::Failed);
        assert_eq!(f.peer.count(Method::Delete, "/_api/replication/barrier/99"), 1);
        // Never tried to lock or register.
        assert_eq!(f.peer.count(Method::Get, HOLD_READ_LOCK), 0);
        assert_eq!(f.peer.count(Method::Put, "addFollower"), 0);
    }

    #[test]
    fn test_finalize_failure_still_releases_lock_once() {
        let f = fixture();
        seed_cluster(&f.agency, &["A", "B"], &["A"]);
        f.replication.fail_finalize(&ShardName::from("s1"));

        let outcome = ShardSynchronizer::new(&f.ctx).run(&job());
        assert_eq!(outcome, SyncOutcome::Failed);
        // Lock released exactly once despite the failure.
        assert_eq!(f.peer.count(Method::Delete, HOLD_READ_LOCK), 1);
        // Barrier was cancelled before finalize even ran.
        assert_eq!(f.peer.count(Method::Delete, "/_api/replication/barrier/42"), 1);
        assert_eq!(f.peer.count(Method::Put, "addFollower"), 0);
    }

    #[test]
    fn test_lock_failure_cancels_barrier_and_skips_finalize() {
        let f = fixture();
        seed_cluster(&f.agency, &["A", "B"], &["A"]);
        // Confirmation never succeeds.
        f.peer.respond(
            Method::Put,
            HOLD_READ_LOCK,
            ScriptedPeer::json_response(200, json!({"lockHeld": false})),
        );
        let mut config = f.ctx.config.clone();
        config.read_lock_poll_attempts = 2;
        let ctx = SyncContext::new(
            ServerId::from("B"),
            ServerRole::Primary,
            config,
            f.agency.clone(),
            Arc::new(crate::testing::MemoryStore::new()),
            f.replication.clone(),
            f.peer.clone(),
        );

        let outcome = ShardSynchronizer::new(&ctx).run(&job());
        assert_eq!(outcome, SyncOutcome::Failed);
        assert_eq!(f.peer.count(Method::Delete, "/_api/replication/barrier/42"), 1);
        assert!(f
            .replication
            .calls()
            .iter()
            .all(|c| !matches!(c, crate::testing::ReplicationCall::SyncFinalize(_, _))));
        // No lock was confirmed, so nothing to release.
        assert_eq!(f.peer.count(Method::Delete, HOLD_READ_LOCK), 0);
    }

    #[test]
    fn test_cancelled_when_plan_moved_on() {
        let f = fixture();
        // Leader in the plan is now C, not A.
        seed_cluster(&f.agency, &["C", "B"], &["C"]);
        let outcome = ShardSynchronizer::new(&f.ctx).run(&job());
        assert_eq!(outcome, SyncOutcome::Cancelled);
        assert!(f.replication.calls().is_empty());
    }

    #[test]
    fn test_cancelled_when_no_longer_planned_follower() {
        let f = fixture();
        seed_cluster(&f.agency, &["A", "C"], &["A"]);
        let outcome = ShardSynchronizer::new(&f.ctx).run(&job());
        assert_eq!(outcome, SyncOutcome::Cancelled);
    }

    #[test]
    fn test_already_in_sync() {
        let f = fixture();
        seed_cluster(&f.agency, &["A", "B"], &["A", "B"]);
        let outcome = ShardSynchronizer::new(&f.ctx).run(&job());
        assert_eq!(outcome, SyncOutcome::AlreadyInSync);
        assert!(f.replication.calls().is_empty());
    }

    #[test]
    fn test_gives_up_when_leader_never_registers() {
        let f = fixture();
        // Planned, but the leader never writes Current.
        seed_cluster(&f.agency, &["A", "B"], &[]);
        let outcome = ShardSynchronizer::new(&f.ctx).run(&job());
        assert_eq!(outcome, SyncOutcome::Cancelled);
        assert!(f.replication.calls().is_empty());
    }
}
