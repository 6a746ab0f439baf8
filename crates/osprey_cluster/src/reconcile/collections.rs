//! Collection/shard reconciliation: converge local shards to the Plan,
//! publish leader-side Current entries, and schedule follower catch-ups.

use std::collections::{BTreeMap, BTreeSet};

use osprey_common::error::OspreyResult;
use osprey_common::types::{DatabaseName, ObjectError, PlanId, ServerId, ShardName};

use crate::agency::{
    apply_batch_locked, paths, to_json, write_locked, AgencyBatch, WriteLockGuard,
    CURRENT_PARTITION,
};
use crate::context::SyncContext;
use crate::plan::{CollectionStatus, CollectionType, Current, CurrentShard, IndexSpec, Plan};
use crate::scheduler::{SyncJob, SyncScheduler};
use crate::store::{LocalCollection, PropertyPatch, ShardSpec};

/// Errors captured for one shard during plan execution, with enough
/// context to publish them even when the shard does not exist locally.
#[derive(Debug, Clone, Default)]
struct ShardErrors {
    database: DatabaseName,
    plan_id: PlanId,
    collection: Option<ObjectError>,
    indexes: BTreeMap<String, ObjectError>,
}

impl ShardErrors {
    fn has_any(&self) -> bool {
        self.collection.is_some() || !self.indexes.is_empty()
    }
}

type ErrorMap = BTreeMap<ShardName, ShardErrors>;

pub struct CollectionReconciler<'a> {
    ctx: &'a SyncContext,
}

impl<'a> CollectionReconciler<'a> {
    pub fn new(ctx: &'a SyncContext) -> Self {
        Self { ctx }
    }

    /// One collection pass: execute the plan locally, drop unplanned
    /// shards, publish Current (leader entries, error reports, stale
    /// cleanup) as one write-locked batch, then schedule catch-ups for
    /// shards we should follow but do not yet. Returns false when
    /// follow-up syncs were scheduled, signalling "retry soon".
    ///
    /// With `take_over` (this server just became primary) the whole
    /// pass holds one additional Current write lock and every owned
    /// shard is force-written to claim ownership immediately.
    pub fn reconcile(
        &self,
        plan: &Plan,
        current: &Current,
        take_over: bool,
        scheduler: &SyncScheduler,
    ) -> OspreyResult<bool> {
        let guard = if take_over {
            Some(WriteLockGuard::acquire(
                self.ctx.agency.as_ref(),
                CURRENT_PARTITION,
                &self.ctx.config,
            )?)
        } else {
            None
        };

        let result = self.reconcile_inner(plan, current, take_over, guard.is_some());
        match guard {
            Some(guard) => {
                // On failure the guard's drop releases the lock
                // best-effort and the original error propagates.
                result?;
                guard.release()?;
            }
            None => result?,
        }

        Ok(self.schedule_missing_followers(plan, current, scheduler))
    }

    fn reconcile_inner(
        &self,
        plan: &Plan,
        current: &Current,
        take_over: bool,
        lock_held: bool,
    ) -> OspreyResult<()> {
        let mut errors = self.execute_plan(plan, current)?;
        self.drop_local_collections(plan);

        let mut batch = AgencyBatch::new();
        self.collect_current_updates(plan, current, &mut errors, take_over, &mut batch)?;
        self.cleanup_current(plan, current, &mut batch)?;

        if lock_held {
            apply_batch_locked(self.ctx.agency.as_ref(), CURRENT_PARTITION, &batch)
        } else {
            write_locked(
                self.ctx.agency.as_ref(),
                CURRENT_PARTITION,
                &self.ctx.config,
                &batch,
            )
        }
    }

    /// Create and update local shards to match the plan. Storage errors
    /// are captured per shard/index; a failed creation skips index
    /// reconciliation for that shard.
    fn execute_plan(&self, plan: &Plan, current: &Current) -> OspreyResult<ErrorMap> {
        let me = &self.ctx.server_id;
        let mut errors = ErrorMap::new();
        let local_dbs: BTreeSet<DatabaseName> =
            self.ctx.store.list_databases()?.into_iter().collect();

        for (db, collections) in &plan.collections {
            if !local_dbs.contains(db) {
                continue;
            }
            let local: BTreeMap<ShardName, LocalCollection> = match self.ctx.store.list_collections(db)
            {
                Ok(list) => list.into_iter().map(|c| (c.name.clone(), c)).collect(),
                Err(e) => {
                    tracing::warn!(database = %db, error = %e, "could not list local shards");
                    continue;
                }
            };

            for (plan_id, collection) in collections {
                for (shard, servers) in &collection.shards {
                    if servers.is_empty() {
                        tracing::warn!(database = %db, shard = %shard,
                            "shard has an empty server list in the plan");
                        continue;
                    }
                    if !servers.contains(me) {
                        continue;
                    }
                    let is_leader = servers.first() == Some(me);
                    let mut shard_errors = ShardErrors {
                        database: db.clone(),
                        plan_id: plan_id.clone(),
                        ..Default::default()
                    };

                    match local.get(shard) {
                        None => {
                            tracing::debug!(database = %db, shard = %shard, plan_id = %plan_id,
                                "creating local shard");
                            let spec = ShardSpec {
                                plan_id: plan_id.clone(),
                                status: collection.status,
                                properties: collection.properties.clone(),
                            };
                            let created = match collection.collection_type {
                                CollectionType::Edge => {
                                    self.ctx.store.create_edge_collection(db, shard, &spec)
                                }
                                CollectionType::Document => {
                                    self.ctx.store.create_collection(db, shard, &spec)
                                }
                            };
                            match created {
                                Ok(()) => {
                                    shard_errors.indexes =
                                        self.reconcile_indexes(db, shard, &collection.indexes);
                                }
                                Err(e) => {
                                    tracing::warn!(database = %db, shard = %shard, error = %e,
                                        "creating local shard failed");
                                    shard_errors.collection = Some(ObjectError::from(&e));
                                }
                            }
                        }
                        Some(local_info) => {
                            if is_leader {
                                self.trim_followers(db, shard, servers);
                            } else {
                                self.resign_if_current_leader(db, plan_id, shard, current);
                            }

                            if local_info.status != collection.status {
                                tracing::debug!(database = %db, shard = %shard,
                                    "detected status change for local shard");
                                let result = match collection.status {
                                    CollectionStatus::Loaded => self.ctx.store.load(db, shard),
                                    CollectionStatus::Unloaded => self.ctx.store.unload(db, shard),
                                };
                                if let Err(e) = result {
                                    shard_errors.collection = Some(ObjectError::from(&e));
                                }
                            }

                            let patch = PropertyPatch::diff(
                                &local_info.properties,
                                &collection.properties,
                            );
                            if !patch.is_empty() {
                                tracing::debug!(database = %db, shard = %shard,
                                    "updating properties of local shard");
                                if let Err(e) =
                                    self.ctx.store.update_properties(db, shard, &patch)
                                {
                                    shard_errors.collection = Some(ObjectError::from(&e));
                                }
                            }

                            shard_errors.indexes =
                                self.reconcile_indexes(db, shard, &collection.indexes);
                        }
                    }

                    if shard_errors.has_any() {
                        errors.insert(shard.clone(), shard_errors);
                    }
                }
            }
        }
        Ok(errors)
    }

    /// A leader whose plan no longer lists some in-sync follower drops
    /// it from the local follower list. Not needed for correctness;
    /// the leader would notice on the next failed replication.
    fn trim_followers(&self, db: &DatabaseName, shard: &ShardName, planned: &[ServerId]) {
        let followers = match self.ctx.store.followers(db, shard) {
            Ok(followers) => followers,
            Err(_) => return,
        };
        for follower in followers {
            if !planned.contains(&follower) {
                tracing::debug!(database = %db, shard = %shard, follower = %follower,
                    "dropping follower no longer in the plan");
                if let Err(e) = self.ctx.store.remove_follower(db, shard, &follower) {
                    tracing::warn!(database = %db, shard = %shard, error = %e,
                        "could not drop follower");
                }
            }
        }
    }

    /// If Current still shows this server as the shard's leader but the
    /// plan no longer lists it first, resign before touching anything
    /// else on the shard.
    fn resign_if_current_leader(
        &self,
        db: &DatabaseName,
        plan_id: &PlanId,
        shard: &ShardName,
        current: &Current,
    ) {
        let was_leader = current
            .shard_entry(db, plan_id, shard)
            .is_some_and(|entry| entry.servers.first() == Some(&self.ctx.server_id));
        if !was_leader {
            return;
        }
        tracing::info!(database = %db, shard = %shard, "withdrawing as shard leader");
        if let Err(e) = self.ctx.store.leader_resign(db, shard) {
            tracing::warn!(database = %db, shard = %shard, error = %e,
                "leader resignation failed");
        }
    }

    /// Diff local indexes against the plan: create planned non-system
    /// indexes that are missing, drop local non-system indexes absent
    /// from the plan. Each dropped index leaves the in-memory map
    /// before the next iteration so the diff never sees it again.
    fn reconcile_indexes(
        &self,
        db: &DatabaseName,
        shard: &ShardName,
        planned: &[IndexSpec],
    ) -> BTreeMap<String, ObjectError> {
        let mut errors = BTreeMap::new();
        let mut existing: BTreeMap<String, IndexSpec> =
            match self.ctx.store.get_indexes(db, shard) {
                Ok(indexes) => indexes.into_iter().map(|i| (i.id.clone(), i)).collect(),
                Err(e) => {
                    tracing::warn!(database = %db, shard = %shard, error = %e,
                        "could not read local indexes");
                    return errors;
                }
            };

        for index in planned {
            if index.kind.is_system() || existing.contains_key(&index.id) {
                continue;
            }
            tracing::debug!(database = %db, shard = %shard, index = %index.id,
                "creating index");
            match self.ctx.store.ensure_index(db, shard, index) {
                Ok(()) => {
                    existing.insert(index.id.clone(), index.clone());
                }
                Err(e) => {
                    errors.insert(index.id.clone(), ObjectError::from(&e));
                }
            }
        }

        let planned_ids: BTreeSet<&str> = planned.iter().map(|i| i.id.as_str()).collect();
        let to_drop: Vec<String> = existing
            .values()
            .filter(|i| !i.kind.is_system() && !planned_ids.contains(i.id.as_str()))
            .map(|i| i.id.clone())
            .collect();
        for id in to_drop {
            tracing::debug!(database = %db, shard = %shard, index = %id, "dropping index");
            match self.ctx.store.drop_index(db, shard, &id) {
                Ok(true) => {
                    existing.remove(&id);
                }
                Ok(false) => {
                    errors.insert(
                        id.clone(),
                        ObjectError::new(4, "could not delete index locally"),
                    );
                }
                Err(e) => {
                    errors.insert(id.clone(), ObjectError::from(&e));
                }
            }
        }
        errors
    }

    /// Drop local shards absent from the plan or no longer assigned to
    /// this server. A follower leaving a still-planned shard tells the
    /// leader to take it off the follower list first (best-effort).
    pub fn drop_local_collections(&self, plan: &Plan) {
        let me = &self.ctx.server_id;
        let shard_map = plan.shard_map();
        let local_dbs = match self.ctx.store.list_databases() {
            Ok(dbs) => dbs,
            Err(e) => {
                tracing::warn!(error = %e, "could not list local databases");
                return;
            }
        };

        for db in &local_dbs {
            let locals = match self.ctx.store.list_collections(db) {
                Ok(list) => list,
                Err(e) => {
                    tracing::warn!(database = %db, error = %e, "could not list local shards");
                    continue;
                }
            };
            for info in locals {
                let assigned = shard_map
                    .get(&info.name)
                    .is_some_and(|servers| servers.contains(me));
                if assigned {
                    continue;
                }

                if let Some(servers) = shard_map.get(&info.name) {
                    if let Some(leader) = servers.first() {
                        match self.ctx.server_endpoint(leader) {
                            Ok(endpoint) => {
                                crate::leader_proto::remove_shard_follower(
                                    self.ctx.peers.as_ref(),
                                    &endpoint,
                                    db,
                                    &info.name,
                                    me,
                                );
                            }
                            Err(e) => {
                                tracing::debug!(database = %db, shard = %info.name, error = %e,
                                    "could not resolve leader endpoint for follower removal");
                            }
                        }
                    }
                }

                tracing::debug!(database = %db, shard = %info.name, plan_id = %info.plan_id,
                    "dropping local shard");
                if let Err(e) = self.ctx.store.drop_collection(
                    db,
                    &info.name,
                    self.ctx.config.shard_drop_timeout(),
                ) {
                    tracing::debug!(database = %db, shard = %info.name, error = %e,
                        "could not drop local shard in time, trying again later");
                }
            }
        }
    }

    /// Assemble and stage Current writes for every locally led shard
    /// (only when the entry changed, unless `take_over` forces the
    /// write) and publish creation errors for shards that do not exist
    /// locally.
    fn collect_current_updates(
        &self,
        plan: &Plan,
        current: &Current,
        errors: &mut ErrorMap,
        take_over: bool,
        batch: &mut AgencyBatch,
    ) -> OspreyResult<()> {
        let me = &self.ctx.server_id;
        let shard_map = plan.shard_map();
        let local_dbs = self.ctx.store.list_databases()?;

        for db in &local_dbs {
            let locals = match self.ctx.store.list_collections(db) {
                Ok(list) => list,
                Err(e) => {
                    tracing::warn!(database = %db, error = %e, "could not list local shards");
                    continue;
                }
            };
            for info in locals {
                let is_planned_leader = shard_map
                    .get(&info.name)
                    .is_some_and(|servers| servers.first() == Some(me));
                if is_planned_leader {
                    let entry = self.assemble_shard_entry(db, &info, errors.get(&info.name));
                    let unchanged =
                        current.shard_entry(db, &info.plan_id, &info.name) == Some(&entry);
                    if take_over || !unchanged {
                        batch.set(
                            paths::current_collection(db, &info.plan_id, &info.name),
                            to_json(&entry)?,
                        );
                    }
                }
                errors.remove(&info.name);
            }
        }

        // Creation failures: the shard is not local, publish the error
        // so the cluster sees why.
        for (shard, shard_errors) in errors.iter() {
            if let Some(error) = &shard_errors.collection {
                tracing::debug!(database = %shard_errors.database, shard = %shard,
                    "reporting shard error to Current");
                batch.set(
                    paths::current_collection(&shard_errors.database, &shard_errors.plan_id, shard),
                    to_json(&CurrentShard {
                        servers: vec![me.clone()],
                        indexes: vec![],
                        error: error.error,
                        error_num: error.error_num,
                        error_message: error.error_message.clone(),
                    })?,
                );
            }
        }
        errors.clear();
        Ok(())
    }

    fn assemble_shard_entry(
        &self,
        db: &DatabaseName,
        info: &LocalCollection,
        errors: Option<&ShardErrors>,
    ) -> CurrentShard {
        if let Some(error) = errors.and_then(|e| e.collection.as_ref()) {
            return CurrentShard {
                servers: vec![self.ctx.server_id.clone()],
                indexes: vec![],
                error: error.error,
                error_num: error.error_num,
                error_message: error.error_message.clone(),
            };
        }

        let mut indexes: Vec<serde_json::Value> = self
            .ctx
            .store
            .get_indexes(db, &info.name)
            .unwrap_or_default()
            .iter()
            .filter_map(|index| serde_json::to_value(index).ok())
            .collect();
        if let Some(shard_errors) = errors {
            for (id, error) in &shard_errors.indexes {
                indexes.push(serde_json::json!({
                    "id": id,
                    "error": true,
                    "errorNum": error.error_num,
                    "errorMessage": error.error_message,
                }));
            }
        }

        let mut servers = vec![self.ctx.server_id.clone()];
        servers.extend(self.ctx.store.followers(db, &info.name).unwrap_or_default());

        CurrentShard {
            servers,
            indexes,
            error: false,
            error_num: 0,
            error_message: String::new(),
        }
    }

    /// Stage removals for Current entries this server reported whose
    /// shard is gone both locally and from the plan.
    pub fn cleanup_current(
        &self,
        plan: &Plan,
        current: &Current,
        batch: &mut AgencyBatch,
    ) -> OspreyResult<()> {
        let me = &self.ctx.server_id;
        let shard_map = plan.shard_map();
        let local_dbs: BTreeSet<DatabaseName> =
            self.ctx.store.list_databases()?.into_iter().collect();

        for (db, collections) in &current.collections {
            if !local_dbs.contains(db) {
                // A vanished database is cleaned up by the database
                // pass, not here.
                continue;
            }
            let local_shards: BTreeSet<ShardName> = match self.ctx.store.list_collections(db) {
                Ok(list) => list.into_iter().map(|c| c.name).collect(),
                Err(e) => {
                    tracing::warn!(database = %db, error = %e, "could not list local shards");
                    continue;
                }
            };
            for (plan_id, shards) in collections {
                for (shard, entry) in shards {
                    if entry.servers.first() == Some(me)
                        && !local_shards.contains(shard)
                        && !shard_map.contains_key(shard)
                    {
                        tracing::debug!(database = %db, shard = %shard,
                            "cleaning up Current entry for vanished shard");
                        batch.remove(paths::current_collection(db, plan_id, shard));
                    }
                }
            }
        }
        Ok(())
    }

    /// Schedule a catch-up for every planned shard this server should
    /// follow but is not yet in sync with. Returns true when nothing
    /// had to be scheduled.
    pub fn schedule_missing_followers(
        &self,
        plan: &Plan,
        current: &Current,
        scheduler: &SyncScheduler,
    ) -> bool {
        let me = &self.ctx.server_id;
        let local_dbs: BTreeSet<DatabaseName> = match self.ctx.store.list_databases() {
            Ok(dbs) => dbs.into_iter().collect(),
            Err(e) => {
                tracing::warn!(error = %e, "could not list local databases");
                return false;
            }
        };

        let mut all_synced = true;
        for (db, collections) in &plan.collections {
            if !local_dbs.contains(db) {
                continue;
            }
            let Some(current_db) = current.collections.get(db) else {
                continue;
            };
            let local_shards: BTreeSet<ShardName> = match self.ctx.store.list_collections(db) {
                Ok(list) => list.into_iter().map(|c| c.name).collect(),
                Err(e) => {
                    tracing::warn!(database = %db, error = %e, "could not list local shards");
                    continue;
                }
            };

            for (plan_id, collection) in collections {
                let Some(current_shards) = current_db.get(plan_id) else {
                    // Current entries are created by the leader; until
                    // then there is nothing to sync against.
                    continue;
                };
                for (shard, planned) in &collection.shards {
                    if !local_shards.contains(shard) {
                        continue;
                    }
                    let Some(current_entry) = current_shards.get(shard) else {
                        continue;
                    };
                    let planned_follower = planned
                        .iter()
                        .position(|s| s == me)
                        .is_some_and(|p| p > 0);
                    if !planned_follower {
                        continue;
                    }
                    let already_in_sync = current_entry
                        .servers
                        .iter()
                        .position(|s| s == me)
                        .is_some_and(|p| p > 0);
                    if already_in_sync {
                        continue;
                    }
                    let Some(leader) = planned.first() else {
                        continue;
                    };
                    scheduler.schedule(SyncJob {
                        database: db.clone(),
                        shard: shard.clone(),
                        plan_id: plan_id.clone(),
                        leader: leader.clone(),
                    });
                    all_synced = false;
                }
            }
        }
        all_synced
    }
}
