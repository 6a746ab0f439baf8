//! Configuration for the cluster-sync subsystem.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for reconciliation and shard synchronization.
///
/// Defaults are the production values; tests override the intervals with
/// millisecond budgets. All timeout budgets are independent of each
/// other: the read-lock poll budget (attempts × interval) is client-side
/// and bounds our own waiting, while the read-lock TTL and the agency
/// write-lock TTL bound the corresponding server-side leases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSyncConfig {
    /// TTL of the agency write lock on a partition, in seconds.
    pub agency_lock_ttl_secs: u64,
    /// How long to wait for the agency write lock, in seconds.
    pub agency_lock_timeout_secs: u64,
    /// TTL requested for the cooperative read lock on the leader, in
    /// seconds. The lock expires on its own if we fail to release it.
    pub read_lock_ttl_secs: u64,
    /// How many times to poll the leader for read-lock confirmation.
    pub read_lock_poll_attempts: u32,
    /// Interval between read-lock confirmation polls, in milliseconds.
    pub read_lock_poll_interval_ms: u64,
    /// How many times to check whether the leader has registered a shard
    /// in Current before giving up on a sync run.
    pub leader_wait_attempts: u32,
    /// Interval between leader-readiness checks, in milliseconds.
    pub leader_wait_interval_ms: u64,
    /// Bounded timeout for dropping a local shard, in milliseconds. A
    /// drop that cannot finish in time is retried on the next pass.
    pub shard_drop_timeout_ms: u64,
    /// Connect timeout for HTTP requests to peer servers, in seconds.
    pub peer_connect_timeout_secs: u64,
    /// Overall timeout for HTTP requests to peer servers, in seconds.
    pub peer_request_timeout_secs: u64,
    /// Delay the caller should apply before re-triggering a pass that
    /// returned `success = false`. Failed role redetermination has no
    /// internal backoff; this interval is the rate limit.
    pub retrigger_delay_ms: u64,
}

impl Default for ClusterSyncConfig {
    fn default() -> Self {
        Self {
            agency_lock_ttl_secs: 120,
            agency_lock_timeout_secs: 60,
            read_lock_ttl_secs: 120,
            read_lock_poll_attempts: 20,
            read_lock_poll_interval_ms: 500,
            leader_wait_attempts: 300,
            leader_wait_interval_ms: 1000,
            shard_drop_timeout_ms: 1000,
            peer_connect_timeout_secs: 5,
            peer_request_timeout_secs: 60,
            retrigger_delay_ms: 1000,
        }
    }
}

impl ClusterSyncConfig {
    pub fn agency_lock_ttl(&self) -> Duration {
        Duration::from_secs(self.agency_lock_ttl_secs)
    }

    pub fn agency_lock_timeout(&self) -> Duration {
        Duration::from_secs(self.agency_lock_timeout_secs)
    }

    pub fn read_lock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.read_lock_poll_interval_ms)
    }

    pub fn leader_wait_interval(&self) -> Duration {
        Duration::from_millis(self.leader_wait_interval_ms)
    }

    pub fn shard_drop_timeout(&self) -> Duration {
        Duration::from_millis(self.shard_drop_timeout_ms)
    }

    pub fn peer_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_connect_timeout_secs)
    }

    pub fn peer_request_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_request_timeout_secs)
    }
}
