//! Database reconciliation: converge local databases to the Plan and
//! publish the outcome per database to Current.

use std::collections::{BTreeMap, BTreeSet};

use osprey_common::error::OspreyResult;
use osprey_common::types::{DatabaseName, ObjectError, ServerRole};

use crate::agency::{paths, to_json, write_locked, AgencyBatch, CURRENT_PARTITION};
use crate::context::SyncContext;
use crate::plan::{Current, CurrentDatabase, Plan};
use crate::replication::ApplierState;

pub struct DatabaseReconciler<'a> {
    ctx: &'a SyncContext,
}

impl<'a> DatabaseReconciler<'a> {
    pub fn new(ctx: &'a SyncContext) -> Self {
        Self { ctx }
    }

    /// One database pass: create planned-but-missing databases, drop
    /// unplanned ones, then publish adds/removes/errors to Current as a
    /// single write-locked batch. Creation failures are captured per
    /// database and still published; they never abort the pass.
    pub fn reconcile(&self, plan: &Plan, current: &Current) -> OspreyResult<()> {
        let mut errors = BTreeMap::new();
        self.create_missing(plan, &mut errors)?;
        self.drop_unplanned(plan);
        self.update_current(current, &errors)
    }

    fn create_missing(
        &self,
        plan: &Plan,
        errors: &mut BTreeMap<DatabaseName, ObjectError>,
    ) -> OspreyResult<()> {
        let local: BTreeSet<DatabaseName> = self.ctx.store.list_databases()?.into_iter().collect();
        for name in plan.databases.keys() {
            if local.contains(name) {
                continue;
            }
            tracing::debug!(database = %name, "creating local database");
            if let Err(e) = self.ctx.store.create_database(name) {
                tracing::warn!(database = %name, error = %e, "creating local database failed");
                errors.insert(name.clone(), ObjectError::from(&e));
            }
        }
        Ok(())
    }

    fn drop_unplanned(&self, plan: &Plan) {
        let local = match self.ctx.store.list_databases() {
            Ok(local) => local,
            Err(e) => {
                tracing::warn!(error = %e, "could not list local databases");
                return;
            }
        };
        for name in local {
            if name.is_system() || plan.databases.contains_key(&name) {
                continue;
            }
            if self.ctx.role() == ServerRole::Secondary {
                self.stop_applier_before_drop(&name);
            }
            tracing::debug!(database = %name, "dropping local database");
            if let Err(e) = self.ctx.store.drop_database(&name) {
                tracing::warn!(database = %name, error = %e, "dropping local database failed");
            }
        }
    }

    fn stop_applier_before_drop(&self, db: &DatabaseName) {
        match self.ctx.replication.applier_state(db) {
            Ok(ApplierState::Running) => {
                tracing::debug!(database = %db, "stopping replication applier first");
                if let Err(e) = self.ctx.replication.applier_stop(db) {
                    tracing::warn!(database = %db, error = %e,
                        "could not stop replication applier");
                }
            }
            Ok(ApplierState::Stopped) => {}
            Err(e) => {
                tracing::warn!(database = %db, error = %e,
                    "could not inspect replication applier");
            }
        }
    }

    fn update_current(
        &self,
        current: &Current,
        errors: &BTreeMap<DatabaseName, ObjectError>,
    ) -> OspreyResult<()> {
        let me = &self.ctx.server_id;
        let local: BTreeSet<DatabaseName> = self.ctx.store.list_databases()?.into_iter().collect();
        let mut batch = AgencyBatch::new();

        // Local databases missing from Current (or marked errored
        // there) get a fresh healthy entry.
        for name in &local {
            let needs_entry = current
                .database_entry(name, me)
                .map_or(true, |entry| entry.error);
            if needs_entry {
                tracing::debug!(database = %name, "adding entry in Current");
                batch.set(
                    paths::current_database(name, me),
                    to_json(&CurrentDatabase {
                        name: name.clone(),
                        error: false,
                        error_num: 0,
                        error_message: String::new(),
                    })?,
                );
            }
        }

        // Entries we reported for databases that no longer exist
        // locally are removed (creation errors keep theirs).
        for (name, servers) in &current.databases {
            if name.is_system() || errors.contains_key(name) {
                continue;
            }
            if !local.contains(name) && servers.contains_key(me) {
                tracing::debug!(database = %name, "cleaning up Current entry");
                batch.remove(paths::current_database(name, me));
            }
        }

        // Publish creation failures.
        for (name, error) in errors {
            tracing::debug!(database = %name, "reporting database error to Current");
            batch.set(
                paths::current_database(name, me),
                to_json(&CurrentDatabase {
                    name: name.clone(),
                    error: error.error,
                    error_num: error.error_num,
                    error_message: error.error_message.clone(),
                })?,
            );
        }

        write_locked(
            self.ctx.agency.as_ref(),
            CURRENT_PARTITION,
            &self.ctx.config,
            &batch,
        )
    }
}
