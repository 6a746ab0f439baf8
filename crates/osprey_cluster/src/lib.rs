//! Cluster-membership reconciliation and shard synchronization.
//!
//! Runs on every Osprey data server. Each pass reconciles the cluster's
//! desired state (Plan) against locally observed reality (Current):
//! databases and shards are created, updated and dropped to match the
//! Plan, outcomes are published to Current through a write-locked agency
//! batch, and lagging shard replicas are caught up through a
//! leader/follower handoff protocol that freezes writes only briefly via
//! a cooperative read lock.
//!
//! # Architecture
//!
//! ```text
//!   ReconciliationEngine::handle_plan_change(plan, current)
//!       |
//!       +-- RoleTransitionManager (redetermine role, teardown appliers)
//!       +-- DatabaseReconciler    (create/drop databases, publish Current)
//!       +-- CollectionReconciler  (shards, properties, indexes, Current)
//!       |       |
//!       |       +-- SyncScheduler (at most one running sync job)
//!       |               |
//!       |               +-- ShardSynchronizer (background thread)
//!       |                       initial sync -> read lock -> finalize
//!       |                       -> register follower
//!       +-- replication applier setup (non-primary roles)
//! ```
//!
//! All collaborators (agency, local store, replication client, peer
//! transport) are traits on [`context::SyncContext`]; in-process
//! implementations for tests and embedded use live in [`testing`] and
//! [`agency::MemoryAgency`].

pub mod agency;
pub mod applier;
pub mod context;
pub mod engine;
pub mod leader_proto;
pub mod plan;
pub mod reconcile;
pub mod replication;
pub mod role;
pub mod scheduler;
pub mod store;
pub mod sync;
pub mod testing;
pub mod transport;

#[cfg(test)]
mod tests;

pub use agency::{write_locked, Agency, AgencyBatch, AgencyOp, MemoryAgency, WriteLockGuard};
pub use applier::setup_replication;
pub use context::{RoleState, SyncContext};
pub use engine::{PlanChangeOutcome, ReconciliationEngine};
pub use leader_proto::{
    add_shard_follower, cancel_barrier, cancel_read_lock_on_leader, remove_shard_follower,
    start_read_lock_on_leader, ReadLockHandle,
};
pub use plan::{
    CollectionProperties, CollectionStatus, CollectionType, Current, CurrentDatabase,
    CurrentShard, IndexKind, IndexSpec, Plan, PlanCollection, PlanDatabase,
};
pub use reconcile::{CollectionReconciler, DatabaseReconciler};
pub use replication::{ApplierState, InitialSync, ReplicationClient};
pub use role::{RoleTransition, RoleTransitionManager};
pub use scheduler::{SchedulerMetricsSnapshot, SchedulerSnapshot, SyncJob, SyncScheduler};
pub use store::{LocalCollection, LocalStore, PropertyPatch, ShardSpec, StoreResult};
pub use sync::{ShardSynchronizer, SyncOutcome};
pub use transport::{endpoint_to_url, HttpPeerTransport, Method, PeerRequest, PeerResponse, PeerTransport};
