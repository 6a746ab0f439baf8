//! Replication applier setup for non-primary data servers.
//!
//! A secondary shadows its designated primary: every local database
//! needs an asynchronous replication applier running against the
//! primary's endpoint. An applier that is not running gets a one-time
//! full sync and is then started from the returned log tick. One
//! database's failure does not stop the others; it only marks the pass
//! not-ok so the caller re-triggers soon.

use osprey_common::error::{OspreyError, OspreyResult};
use osprey_common::types::DatabaseName;

use crate::context::SyncContext;
use crate::replication::ApplierState;

/// Ensure appliers run for every local database. Returns false when at
/// least one database could not be set up.
pub fn setup_replication(ctx: &SyncContext) -> bool {
    tracing::debug!("checking replication appliers");
    let databases = match ctx.store.list_databases() {
        Ok(databases) => databases,
        Err(e) => {
            tracing::error!(error = %e, "could not list databases for replication setup");
            return false;
        }
    };

    let mut ok = true;
    for db in databases {
        if let Err(e) = ensure_applier(ctx, &db) {
            tracing::error!(database = %db, error = %e,
                "could not set up replication applier");
            ok = false;
        }
    }
    ok
}

fn ensure_applier(ctx: &SyncContext, db: &DatabaseName) -> OspreyResult<()> {
    if ctx.replication.applier_state(db)? == ApplierState::Running {
        return Ok(());
    }
    let primary = ctx
        .role_state()
        .id_of_primary
        .ok_or_else(|| OspreyError::Role("no designated primary to replicate from".into()))?;
    let endpoint = ctx.server_endpoint(&primary)?;

    tracing::debug!(database = %db, endpoint = %endpoint, "starting full synchronization");
    let last_log_tick = ctx.replication.applier_full_sync(db, &endpoint)?;
    tracing::debug!(database = %db, last_log_tick, "starting replication applier");
    ctx.replication.applier_start(db, last_log_tick)?;
    Ok(())
}
