//! Wire sub-protocols spoken against a shard's leader.
//!
//! The read lock briefly freezes writes on the leader so the follower
//! can establish a consistent handoff point. Acquisition can block on
//! the leader until in-flight writes drain, so it is started
//! asynchronously (async-store dispatch) and confirmed by polling;
//! this bounds client-side resource use. The lock and the sync barrier
//! are independent, overlapping leases and are torn down separately.

use serde_json::json;

use osprey_common::config::ClusterSyncConfig;
use osprey_common::error::{OspreyError, OspreyResult, TransportError};
use osprey_common::shutdown::{PollOutcome, ShutdownSignal};
use osprey_common::types::{DatabaseName, ServerId, ShardName};

use crate::transport::{endpoint_to_url, PeerRequest, PeerTransport};

const HOLD_READ_LOCK: &str = "/_api/replication/holdReadLockCollection";
const BARRIER: &str = "/_api/replication/barrier";
const ADD_FOLLOWER: &str = "/_api/replication/addFollower";
const REMOVE_FOLLOWER: &str = "/_api/replication/removeFollower";
const JOB: &str = "/_api/job";

/// A confirmed read lock on the leader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadLockHandle {
    pub id: String,
    /// Async job that established the lock, when the dispatch yielded
    /// one.
    pub async_job_id: Option<String>,
}

fn db_url(endpoint: &str, db: &DatabaseName) -> String {
    format!("{}/_db/{}", endpoint_to_url(endpoint), db)
}

/// Acquire a bounded-duration read lock on `shard` at the leader.
///
/// GETs a fresh lock id, dispatches the lock request asynchronously
/// (the outcome is deliberately ignored — teardown below covers every
/// case), then polls with PUT until the leader confirms `lockHeld`.
/// On an exhausted poll budget the outstanding async job is disposed of
/// best-effort and the call fails.
pub fn start_read_lock_on_leader(
    transport: &dyn PeerTransport,
    shutdown: &ShutdownSignal,
    config: &ClusterSyncConfig,
    endpoint: &str,
    db: &DatabaseName,
    shard: &ShardName,
) -> OspreyResult<ReadLockHandle> {
    let url = format!("{}{}", db_url(endpoint, db), HOLD_READ_LOCK);

    let response = transport.execute(&PeerRequest::get(url.clone()))?;
    if !response.is_ok() {
        return Err(TransportError::Status {
            status: response.status,
            url,
        }
        .into());
    }
    let id = response
        .body
        .as_ref()
        .and_then(|b| b.get("id"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| TransportError::BadBody {
            url: url.clone(),
            reason: "missing lock id".into(),
        })?;

    let body = json!({
        "id": id,
        "collection": shard,
        "ttl": config.read_lock_ttl_secs,
    });
    let async_job_id = match transport.execute(
        &PeerRequest::post(url.clone())
            .with_body(body.clone())
            .async_store(),
    ) {
        Ok(response) => response.async_id,
        Err(e) => {
            tracing::warn!(shard = %shard, error = %e,
                "async read-lock dispatch failed, still polling for confirmation");
            None
        }
    };

    let outcome = shutdown.poll_until(
        config.read_lock_poll_attempts,
        config.read_lock_poll_interval(),
        || match transport.execute(&PeerRequest::put(url.clone()).with_body(body.clone())) {
            Ok(response) if response.is_ok() => {
                let held = response
                    .body
                    .as_ref()
                    .and_then(|b| b.get("lockHeld"))
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                if held {
                    Some(())
                } else {
                    tracing::debug!(shard = %shard, "read lock not yet acquired");
                    None
                }
            }
            Ok(response) => {
                tracing::debug!(shard = %shard, status = response.status,
                    "leader does not see the read lock yet");
                None
            }
            Err(e) => {
                tracing::debug!(shard = %shard, error = %e, "read-lock confirmation poll failed");
                None
            }
        },
    );

    match outcome {
        PollOutcome::Ready(()) => Ok(ReadLockHandle { id, async_job_id }),
        PollOutcome::Exhausted | PollOutcome::Interrupted => {
            tracing::error!(shard = %shard, attempts = config.read_lock_poll_attempts,
                "giving up on read-lock confirmation");
            if let Some(job_id) = &async_job_id {
                let job_url = format!("{}{}/{}", endpoint_to_url(endpoint), JOB, job_id);
                match transport.execute(&PeerRequest::put(job_url)) {
                    Ok(response) if response.is_ok() => {
                        tracing::debug!(job = %job_id, "disposed of pending read-lock job")
                    }
                    Ok(response) => tracing::error!(job = %job_id, status = response.status,
                        "could not dispose of pending read-lock job"),
                    Err(e) => tracing::error!(job = %job_id, error = %e,
                        "could not dispose of pending read-lock job"),
                }
            }
            Err(OspreyError::from(TransportError::LockNotConfirmed {
                url,
                attempts: config.read_lock_poll_attempts,
            }))
        }
    }
}

/// Release a read lock by id. Always addressed to the `_system`
/// database: the shard's database may already be gone on the leader,
/// and the lock must be released under all circumstances. Best-effort.
pub fn cancel_read_lock_on_leader(
    transport: &dyn PeerTransport,
    endpoint: &str,
    lock_id: &str,
) -> bool {
    let url = format!(
        "{}/_db/_system{}",
        endpoint_to_url(endpoint),
        HOLD_READ_LOCK
    );
    match transport.execute(&PeerRequest::delete(url).with_body(json!({ "id": lock_id }))) {
        Ok(response) if response.is_ok() => {
            tracing::debug!(lock = %lock_id, "read lock released");
            true
        }
        Ok(response) => {
            tracing::error!(lock = %lock_id, status = response.status,
                "read-lock release refused");
            false
        }
        Err(e) => {
            tracing::error!(lock = %lock_id, error = %e, "read-lock release failed");
            false
        }
    }
}

/// Cancel the WAL-retention barrier created by an initial sync.
/// Non-positive barrier ids mean "no barrier" and are a no-op.
pub fn cancel_barrier(
    transport: &dyn PeerTransport,
    endpoint: &str,
    db: &DatabaseName,
    barrier_id: i64,
) -> bool {
    if barrier_id <= 0 {
        return true;
    }
    let url = format!("{}{}/{}", db_url(endpoint, db), BARRIER, barrier_id);
    match transport.execute(&PeerRequest::delete(url)) {
        Ok(response) if response.status == 200 || response.status == 204 => {
            tracing::debug!(barrier = barrier_id, "barrier cancelled");
            true
        }
        Ok(response) => {
            tracing::error!(barrier = barrier_id, status = response.status,
                "barrier cancellation refused");
            false
        }
        Err(e) => {
            tracing::error!(barrier = barrier_id, error = %e, "barrier cancellation failed");
            false
        }
    }
}

/// Tell the leader to append this server to the shard's follower list.
pub fn add_shard_follower(
    transport: &dyn PeerTransport,
    endpoint: &str,
    db: &DatabaseName,
    shard: &ShardName,
    follower: &ServerId,
    lock_id: &str,
) -> OspreyResult<()> {
    tracing::debug!(shard = %shard, "asking the leader to add us to the follower list");
    let url = format!("{}{}", db_url(endpoint, db), ADD_FOLLOWER);
    let body = json!({
        "followerId": follower,
        "shard": shard,
        "readLockId": lock_id,
    });
    let response = transport.execute(&PeerRequest::put(url.clone()).with_body(body))?;
    if response.is_ok() {
        Ok(())
    } else {
        Err(TransportError::Status {
            status: response.status,
            url,
        }
        .into())
    }
}

/// Tell the leader to take this server off the shard's follower list.
/// Best-effort: the leader drops unreachable followers on its own.
pub fn remove_shard_follower(
    transport: &dyn PeerTransport,
    endpoint: &str,
    db: &DatabaseName,
    shard: &ShardName,
    follower: &ServerId,
) -> bool {
    tracing::debug!(shard = %shard, "asking the leader to take us off the follower list");
    let url = format!("{}{}", db_url(endpoint, db), REMOVE_FOLLOWER);
    let body = json!({ "followerId": follower, "shard": shard });
    match transport.execute(&PeerRequest::put(url).with_body(body)) {
        Ok(response) if response.is_ok() => true,
        Ok(response) => {
            tracing::error!(shard = %shard, status = response.status,
                "could not leave the leader's follower list");
            false
        }
        Err(e) => {
            tracing::error!(shard = %shard, error = %e,
                "could not leave the leader's follower list");
            false
        }
    }
}
