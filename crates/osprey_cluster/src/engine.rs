//! The top-level reconciliation entry point.
//!
//! Driven by an external trigger whenever Plan or Current change. One
//! pass is synchronous; callers serialize invocations for the same
//! server and re-trigger soon (see
//! `ClusterSyncConfig::retrigger_delay_ms`) when the outcome reports
//! `success = false`. Shard catch-ups launched by the pass run on the
//! scheduler's background thread and never block the next pass.

use std::sync::Arc;

use osprey_common::error::OspreyResult;
use osprey_common::types::ServerRole;

use crate::applier::setup_replication;
use crate::context::SyncContext;
use crate::plan::{Current, Plan};
use crate::reconcile::{CollectionReconciler, DatabaseReconciler};
use crate::role::RoleTransitionManager;
use crate::scheduler::SyncScheduler;

/// Result of one pass, echoing the snapshot versions it worked on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanChangeOutcome {
    pub plan_version: u64,
    pub current_version: u64,
    /// False asks the caller to re-trigger reconciliation soon.
    pub success: bool,
}

pub struct ReconciliationEngine {
    ctx: Arc<SyncContext>,
    scheduler: SyncScheduler,
}

impl ReconciliationEngine {
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        let scheduler = SyncScheduler::new(ctx.clone());
        Self { ctx, scheduler }
    }

    pub fn context(&self) -> &Arc<SyncContext> {
        &self.ctx
    }

    pub fn scheduler(&self) -> &SyncScheduler {
        &self.scheduler
    }

    /// Run one reconciliation pass against the given snapshots.
    pub fn handle_plan_change(&self, plan: &Plan, current: &Current) -> PlanChangeOutcome {
        tracing::debug!(plan_version = plan.version, current_version = current.version,
            "handling plan change");
        let success = match self.handle_changes(plan, current) {
            Ok(ok) => {
                tracing::debug!("plan change handling successful");
                ok
            }
            Err(e) => {
                tracing::error!(error = %e, scope = ?e.scope(), "plan change handling failed");
                false
            }
        };
        PlanChangeOutcome {
            plan_version: plan.version,
            current_version: current.version,
            success,
        }
    }

    fn handle_changes(&self, plan: &Plan, current: &Current) -> OspreyResult<bool> {
        // Coordinators and single servers have no local shards to
        // reconcile.
        if !self.ctx.role().is_data_server() {
            return Ok(true);
        }

        let transition = RoleTransitionManager::check_role(&self.ctx, plan)?;
        let take_over = transition.as_ref().is_some_and(|t| t.take_over);

        DatabaseReconciler::new(&self.ctx).reconcile(plan, current)?;

        match self.ctx.role() {
            ServerRole::Primary => CollectionReconciler::new(&self.ctx).reconcile(
                plan,
                current,
                take_over,
                &self.scheduler,
            ),
            _ => Ok(setup_replication(&self.ctx)),
        }
    }
}
