//! The generic replication transport, seen through the seam the
//! sync protocol and the applier setup need.

use osprey_common::error::ReplicationError;
use osprey_common::types::{DatabaseName, ServerId, ShardName};

/// Result of an incremental initial sync against a leader.
#[derive(Debug, Clone, PartialEq)]
pub struct InitialSync {
    /// Names of the collections the leader reported during the sync.
    pub collections: Vec<String>,
    /// WAL-retention barrier created on the leader for this sync; must
    /// be cancelled by the caller. Non-positive means no barrier.
    pub barrier_id: i64,
    /// Log position reached by the initial sync; handed to finalize.
    pub last_log_tick: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplierState {
    Stopped,
    Running,
}

/// Replication collaborator.
///
/// `sync_incremental` retries internally (on the order of an hour of
/// one-second attempts) and only one initial sync may be in flight per
/// leader cluster-wide; the sync scheduler's one-running-job invariant
/// exists to respect that.
pub trait ReplicationClient: Send + Sync {
    fn sync_incremental(
        &self,
        db: &DatabaseName,
        shard: &ShardName,
        endpoint: &str,
        leader: &ServerId,
    ) -> Result<InitialSync, ReplicationError>;

    fn sync_finalize(
        &self,
        db: &DatabaseName,
        shard: &ShardName,
        last_log_tick: u64,
        endpoint: &str,
        leader: &ServerId,
    ) -> Result<(), ReplicationError>;

    fn applier_state(&self, db: &DatabaseName) -> Result<ApplierState, ReplicationError>;

    /// One-time full sync from the given endpoint; returns the log tick
    /// the applier should start from.
    fn applier_full_sync(&self, db: &DatabaseName, endpoint: &str)
        -> Result<u64, ReplicationError>;

    fn applier_start(&self, db: &DatabaseName, from_tick: u64) -> Result<(), ReplicationError>;
    fn applier_stop(&self, db: &DatabaseName) -> Result<(), ReplicationError>;
    fn applier_forget(&self, db: &DatabaseName) -> Result<(), ReplicationError>;
}
