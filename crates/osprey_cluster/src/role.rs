//! Role redetermination and failover transitions.
//!
//! The Plan's primary -> designated-secondary pairing is authoritative:
//! a server whose id is a key is a primary; a server some primary maps
//! to is that primary's secondary. The cached role is compared against
//! the pairing before every pass and redetermined on mismatch. A server
//! found nowhere in the pairing aborts the pass; the next external
//! trigger retries.

use osprey_common::error::{OspreyError, OspreyResult};
use osprey_common::types::{ServerId, ServerRole};

use crate::context::{RoleState, SyncContext};
use crate::plan::Plan;

/// A confirmed role change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleTransition {
    pub old_role: ServerRole,
    pub new_role: ServerRole,
    /// Set on secondary -> primary: the collection pass must claim
    /// ownership of every owned shard immediately.
    pub take_over: bool,
}

pub struct RoleTransitionManager;

impl RoleTransitionManager {
    /// Compare the cached role against the Plan and redetermine it on
    /// mismatch. Returns the transition when the role actually changed.
    pub fn check_role(ctx: &SyncContext, plan: &Plan) -> OspreyResult<Option<RoleTransition>> {
        let cached = ctx.role_state();
        match cached.role {
            ServerRole::Primary => {
                if plan.db_servers.contains_key(&ctx.server_id) {
                    return Ok(None);
                }
            }
            ServerRole::Secondary => {
                let primary = primary_of(plan, &ctx.server_id);
                if primary == cached.id_of_primary && primary.is_some() {
                    return Ok(None);
                }
            }
            // Coordinators and single servers do not take part in
            // Plan/Current reconciliation.
            ServerRole::Coordinator | ServerRole::Single => return Ok(None),
        }
        Self::redetermine(ctx, plan, cached)
    }

    fn redetermine(
        ctx: &SyncContext,
        plan: &Plan,
        cached: RoleState,
    ) -> OspreyResult<Option<RoleTransition>> {
        let new_state = if plan.db_servers.contains_key(&ctx.server_id) {
            RoleState {
                role: ServerRole::Primary,
                id_of_primary: None,
            }
        } else if let Some(primary) = primary_of(plan, &ctx.server_id) {
            RoleState {
                role: ServerRole::Secondary,
                id_of_primary: Some(primary),
            }
        } else {
            return Err(OspreyError::Role(format!(
                "server '{}' is not present in the plan's server pairing",
                ctx.server_id
            )));
        };

        if new_state == cached {
            return Ok(None);
        }
        if new_state.role == cached.role {
            // Same role, different primary pairing; no failover
            // handling needed.
            tracing::info!(role = %new_state.role, "designated primary has changed");
            ctx.set_role_state(new_state);
            return Ok(None);
        }

        let transition = RoleTransition {
            old_role: cached.role,
            new_role: new_state.role,
            take_over: cached.role == ServerRole::Secondary
                && new_state.role == ServerRole::Primary,
        };
        tracing::info!(old_role = %transition.old_role, new_role = %transition.new_role,
            "server role has changed");
        ctx.set_role_state(new_state);

        if transition.old_role == ServerRole::Primary
            && transition.new_role == ServerRole::Secondary
        {
            stop_all_appliers(ctx);
        }

        Ok(Some(transition))
    }
}

fn primary_of(plan: &Plan, server: &ServerId) -> Option<ServerId> {
    plan.db_servers
        .iter()
        .find(|(_, secondary)| *secondary == server)
        .map(|(primary, _)| primary.clone())
}

/// Stop and forget every database's replication applier. Per-database
/// failures are logged; the teardown continues.
fn stop_all_appliers(ctx: &SyncContext) {
    let databases = match ctx.store.list_databases() {
        Ok(databases) => databases,
        Err(e) => {
            tracing::error!(error = %e, "could not list databases for applier teardown");
            return;
        }
    };
    for db in databases {
        tracing::info!(database = %db, "stopping asynchronous replication");
        if let Err(e) = ctx.replication.applier_stop(&db) {
            tracing::warn!(database = %db, error = %e, "could not stop replication applier");
        }
        if let Err(e) = ctx.replication.applier_forget(&db) {
            tracing::warn!(database = %db, error = %e, "could not forget replication applier");
        }
    }
}
