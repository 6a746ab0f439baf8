//! In-process implementations of the cluster collaborators, for tests
//! and embedded single-process setups.
//!
//! `MemoryStore` keeps databases and shards in maps and records every
//! mutating call in an operation log so tests can assert ordering and
//! idempotence. `ScriptedReplication` and `ScriptedPeer` answer with
//! scripted results and keep call logs; unscripted peer requests get a
//! plain 200.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;

use osprey_common::error::{ReplicationError, StoreError, TransportError};
use osprey_common::types::{DatabaseName, ServerId, ShardName};

use crate::plan::IndexSpec;
use crate::replication::{ApplierState, InitialSync, ReplicationClient};
use crate::store::{LocalCollection, LocalStore, PropertyPatch, ShardSpec, StoreResult};
use crate::transport::{Method, PeerRequest, PeerResponse, PeerTransport};

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// One mutating storage call, in invocation order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    CreateDatabase(String),
    DropDatabase(String),
    CreateCollection(String, String),
    CreateEdgeCollection(String, String),
    DropCollection(String, String),
    Load(String, String),
    Unload(String, String),
    UpdateProperties(String, String),
    EnsureIndex(String, String, String),
    DropIndex(String, String, String),
    LeaderResign(String, String),
    RemoveFollower(String, String, String),
}

#[derive(Debug, Clone)]
struct ShardState {
    info: LocalCollection,
    indexes: Vec<IndexSpec>,
    followers: Vec<ServerId>,
}

#[derive(Default)]
struct MemoryStoreInner {
    databases: BTreeMap<DatabaseName, BTreeMap<ShardName, ShardState>>,
    ops: Vec<StoreOp>,
    fail_create_shards: BTreeSet<ShardName>,
    fail_create_databases: BTreeSet<DatabaseName>,
    fail_index_ids: BTreeSet<String>,
}

/// In-memory storage engine with an operation log.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryStoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_database(&self, db: &DatabaseName) {
        self.inner
            .lock()
            .databases
            .entry(db.clone())
            .or_default();
    }

    /// Seed a shard with its index set (a primary index is implied on
    /// creation through the trait, but seeded shards take exactly what
    /// they are given).
    pub fn add_shard(&self, db: &DatabaseName, info: LocalCollection, indexes: Vec<IndexSpec>) {
        let mut inner = self.inner.lock();
        let shard = info.name.clone();
        inner.databases.entry(db.clone()).or_default().insert(
            shard,
            ShardState {
                info,
                indexes,
                followers: vec![],
            },
        );
    }

    pub fn set_followers(&self, db: &DatabaseName, shard: &ShardName, followers: Vec<ServerId>) {
        let mut inner = self.inner.lock();
        if let Some(state) = inner
            .databases
            .get_mut(db)
            .and_then(|shards| shards.get_mut(shard))
        {
            state.followers = followers;
        }
    }

    /// Every creation attempt for this shard fails with error 1207.
    pub fn fail_create(&self, shard: &ShardName) {
        self.inner.lock().fail_create_shards.insert(shard.clone());
    }

    /// Every creation attempt for this database fails with error 1207.
    pub fn fail_create_database(&self, db: &DatabaseName) {
        self.inner.lock().fail_create_databases.insert(db.clone());
    }

    /// Every ensure attempt for this index id fails with error 1235.
    pub fn fail_index(&self, index_id: &str) {
        self.inner.lock().fail_index_ids.insert(index_id.to_string());
    }

    pub fn ops(&self) -> Vec<StoreOp> {
        self.inner.lock().ops.clone()
    }

    pub fn mutation_count(&self) -> usize {
        self.inner.lock().ops.len()
    }

    pub fn has_database(&self, db: &DatabaseName) -> bool {
        self.inner.lock().databases.contains_key(db)
    }

    pub fn has_shard(&self, db: &DatabaseName, shard: &ShardName) -> bool {
        self.inner
            .lock()
            .databases
            .get(db)
            .is_some_and(|shards| shards.contains_key(shard))
    }

    pub fn index_ids(&self, db: &DatabaseName, shard: &ShardName) -> Vec<String> {
        self.inner
            .lock()
            .databases
            .get(db)
            .and_then(|shards| shards.get(shard))
            .map(|state| state.indexes.iter().map(|i| i.id.clone()).collect())
            .unwrap_or_default()
    }

    fn record(&self, op: StoreOp) {
        self.inner.lock().ops.push(op);
    }
}

fn not_found(what: &str) -> StoreError {
    StoreError::new(1203, format!("{what} not found"))
}

impl LocalStore for MemoryStore {
    fn list_databases(&self) -> StoreResult<Vec<DatabaseName>> {
        Ok(self.inner.lock().databases.keys().cloned().collect())
    }

    fn create_database(&self, db: &DatabaseName) -> StoreResult<()> {
        self.record(StoreOp::CreateDatabase(db.0.clone()));
        let mut inner = self.inner.lock();
        if inner.fail_create_databases.contains(db) {
            return Err(StoreError::new(1207, format!("cannot create database '{db}'")));
        }
        if inner.databases.contains_key(db) {
            return Err(StoreError::new(1207, format!("duplicate database '{db}'")));
        }
        inner.databases.insert(db.clone(), BTreeMap::new());
        Ok(())
    }

    fn drop_database(&self, db: &DatabaseName) -> StoreResult<()> {
        self.record(StoreOp::DropDatabase(db.0.clone()));
        self.inner
            .lock()
            .databases
            .remove(db)
            .map(|_| ())
            .ok_or_else(|| not_found("database"))
    }

    fn list_collections(&self, db: &DatabaseName) -> StoreResult<Vec<LocalCollection>> {
        let inner = self.inner.lock();
        let shards = inner.databases.get(db).ok_or_else(|| not_found("database"))?;
        Ok(shards.values().map(|state| state.info.clone()).collect())
    }

    fn create_collection(
        &self,
        db: &DatabaseName,
        shard: &ShardName,
        spec: &ShardSpec,
    ) -> StoreResult<()> {
        self.record(StoreOp::CreateCollection(db.0.clone(), shard.0.clone()));
        self.create_internal(db, shard, spec, crate::plan::CollectionType::Document)
    }

    fn create_edge_collection(
        &self,
        db: &DatabaseName,
        shard: &ShardName,
        spec: &ShardSpec,
    ) -> StoreResult<()> {
        self.record(StoreOp::CreateEdgeCollection(db.0.clone(), shard.0.clone()));
        self.create_internal(db, shard, spec, crate::plan::CollectionType::Edge)
    }

    fn drop_collection(
        &self,
        db: &DatabaseName,
        shard: &ShardName,
        _timeout: Duration,
    ) -> StoreResult<()> {
        self.record(StoreOp::DropCollection(db.0.clone(), shard.0.clone()));
        let mut inner = self.inner.lock();
        inner
            .databases
            .get_mut(db)
            .and_then(|shards| shards.remove(shard))
            .map(|_| ())
            .ok_or_else(|| not_found("collection"))
    }

    fn load(&self, db: &DatabaseName, shard: &ShardName) -> StoreResult<()> {
        self.record(StoreOp::Load(db.0.clone(), shard.0.clone()));
        self.with_shard(db, shard, |state| {
            state.info.status = crate::plan::CollectionStatus::Loaded;
        })
    }

    fn unload(&self, db: &DatabaseName, shard: &ShardName) -> StoreResult<()> {
        self.record(StoreOp::Unload(db.0.clone(), shard.0.clone()));
        self.with_shard(db, shard, |state| {
            state.info.status = crate::plan::CollectionStatus::Unloaded;
        })
    }

    fn update_properties(
        &self,
        db: &DatabaseName,
        shard: &ShardName,
        patch: &PropertyPatch,
    ) -> StoreResult<()> {
        self.record(StoreOp::UpdateProperties(db.0.clone(), shard.0.clone()));
        let patch = patch.clone();
        self.with_shard(db, shard, move |state| {
            if let Some(v) = patch.journal_size {
                state.info.properties.journal_size = v;
            }
            if let Some(v) = patch.wait_for_sync {
                state.info.properties.wait_for_sync = v;
            }
            if let Some(v) = patch.do_compact {
                state.info.properties.do_compact = v;
            }
            if let Some(v) = patch.index_buckets {
                state.info.properties.index_buckets = v;
            }
        })
    }

    fn ensure_index(
        &self,
        db: &DatabaseName,
        shard: &ShardName,
        index: &IndexSpec,
    ) -> StoreResult<()> {
        self.record(StoreOp::EnsureIndex(
            db.0.clone(),
            shard.0.clone(),
            index.id.clone(),
        ));
        {
            let inner = self.inner.lock();
            if inner.fail_index_ids.contains(&index.id) {
                return Err(StoreError::new(1235, format!("cannot create index '{}'", index.id)));
            }
        }
        let index = index.clone();
        self.with_shard(db, shard, move |state| {
            if !state.indexes.iter().any(|i| i.id == index.id) {
                state.indexes.push(index);
            }
        })
    }

    fn drop_index(
        &self,
        db: &DatabaseName,
        shard: &ShardName,
        index_id: &str,
    ) -> StoreResult<bool> {
        self.record(StoreOp::DropIndex(
            db.0.clone(),
            shard.0.clone(),
            index_id.to_string(),
        ));
        let mut dropped = false;
        self.with_shard(db, shard, |state| {
            let before = state.indexes.len();
            state.indexes.retain(|i| i.id != index_id);
            dropped = state.indexes.len() < before;
        })?;
        Ok(dropped)
    }

    fn get_indexes(&self, db: &DatabaseName, shard: &ShardName) -> StoreResult<Vec<IndexSpec>> {
        let inner = self.inner.lock();
        inner
            .databases
            .get(db)
            .and_then(|shards| shards.get(shard))
            .map(|state| state.indexes.clone())
            .ok_or_else(|| not_found("collection"))
    }

    fn leader_resign(&self, db: &DatabaseName, shard: &ShardName) -> StoreResult<()> {
        self.record(StoreOp::LeaderResign(db.0.clone(), shard.0.clone()));
        self.with_shard(db, shard, |_| {})
    }

    fn followers(&self, db: &DatabaseName, shard: &ShardName) -> StoreResult<Vec<ServerId>> {
        let inner = self.inner.lock();
        inner
            .databases
            .get(db)
            .and_then(|shards| shards.get(shard))
            .map(|state| state.followers.clone())
            .ok_or_else(|| not_found("collection"))
    }

    fn remove_follower(
        &self,
        db: &DatabaseName,
        shard: &ShardName,
        follower: &ServerId,
    ) -> StoreResult<()> {
        self.record(StoreOp::RemoveFollower(
            db.0.clone(),
            shard.0.clone(),
            follower.0.clone(),
        ));
        let follower = follower.clone();
        self.with_shard(db, shard, move |state| {
            state.followers.retain(|f| f != &follower);
        })
    }
}

impl MemoryStore {
    fn create_internal(
        &self,
        db: &DatabaseName,
        shard: &ShardName,
        spec: &ShardSpec,
        collection_type: crate::plan::CollectionType,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        if inner.fail_create_shards.contains(shard) {
            return Err(StoreError::new(1207, format!("cannot create shard '{shard}'")));
        }
        let shards = inner
            .databases
            .get_mut(db)
            .ok_or_else(|| not_found("database"))?;
        if shards.contains_key(shard) {
            return Err(StoreError::new(1207, format!("duplicate name '{shard}'")));
        }
        shards.insert(
            shard.clone(),
            ShardState {
                info: LocalCollection {
                    name: shard.clone(),
                    plan_id: spec.plan_id.clone(),
                    collection_type,
                    status: spec.status,
                    properties: spec.properties.clone(),
                },
                indexes: vec![IndexSpec {
                    id: "0".into(),
                    kind: crate::plan::IndexKind::Primary,
                    fields: vec!["_key".into()],
                    unique: true,
                    sparse: false,
                }],
                followers: vec![],
            },
        );
        Ok(())
    }

    fn with_shard(
        &self,
        db: &DatabaseName,
        shard: &ShardName,
        f: impl FnOnce(&mut ShardState),
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        let state = inner
            .databases
            .get_mut(db)
            .and_then(|shards| shards.get_mut(shard))
            .ok_or_else(|| not_found("collection"))?;
        f(state);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ScriptedReplication
// ---------------------------------------------------------------------------

/// One replication-client call, in invocation order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationCall {
    SyncIncremental(String),
    SyncFinalize(String, u64),
    ApplierState(String),
    ApplierFullSync(String, String),
    ApplierStart(String, u64),
    ApplierStop(String),
    ApplierForget(String),
}

#[derive(Default)]
struct ScriptedReplicationInner {
    initial: BTreeMap<ShardName, Result<InitialSync, String>>,
    finalize_failures: BTreeSet<ShardName>,
    applier_states: BTreeMap<DatabaseName, ApplierState>,
    full_sync_failures: BTreeSet<DatabaseName>,
    calls: Vec<ReplicationCall>,
}

/// Replication client with scripted outcomes.
///
/// Unscripted initial syncs succeed with the expected shard in the
/// collection set, barrier 42 and tick 1000; unscripted appliers report
/// `Stopped`.
#[derive(Default)]
pub struct ScriptedReplication {
    inner: Mutex<ScriptedReplicationInner>,
}

impl ScriptedReplication {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script_initial(&self, shard: &ShardName, result: Result<InitialSync, String>) {
        self.inner.lock().initial.insert(shard.clone(), result);
    }

    pub fn fail_finalize(&self, shard: &ShardName) {
        self.inner.lock().finalize_failures.insert(shard.clone());
    }

    pub fn set_applier_state(&self, db: &DatabaseName, state: ApplierState) {
        self.inner.lock().applier_states.insert(db.clone(), state);
    }

    pub fn fail_full_sync(&self, db: &DatabaseName) {
        self.inner.lock().full_sync_failures.insert(db.clone());
    }

    pub fn calls(&self) -> Vec<ReplicationCall> {
        self.inner.lock().calls.clone()
    }

    fn record(&self, call: ReplicationCall) {
        self.inner.lock().calls.push(call);
    }
}

impl ReplicationClient for ScriptedReplication {
    fn sync_incremental(
        &self,
        db: &DatabaseName,
        shard: &ShardName,
        _endpoint: &str,
        _leader: &ServerId,
    ) -> Result<InitialSync, ReplicationError> {
        self.record(ReplicationCall::SyncIncremental(shard.0.clone()));
        let inner = self.inner.lock();
        match inner.initial.get(shard) {
            Some(Ok(sync)) => Ok(sync.clone()),
            Some(Err(reason)) => Err(ReplicationError::InitialSync {
                db: db.0.clone(),
                shard: shard.0.clone(),
                reason: reason.clone(),
            }),
            None => Ok(InitialSync {
                collections: vec![shard.0.clone()],
                barrier_id: 42,
                last_log_tick: 1000,
            }),
        }
    }

    fn sync_finalize(
        &self,
        db: &DatabaseName,
        shard: &ShardName,
        last_log_tick: u64,
        _endpoint: &str,
        _leader: &ServerId,
    ) -> Result<(), ReplicationError> {
        self.record(ReplicationCall::SyncFinalize(shard.0.clone(), last_log_tick));
        if self.inner.lock().finalize_failures.contains(shard) {
            return Err(ReplicationError::Finalize {
                db: db.0.clone(),
                shard: shard.0.clone(),
                reason: "scripted failure".into(),
            });
        }
        Ok(())
    }

    fn applier_state(&self, db: &DatabaseName) -> Result<ApplierState, ReplicationError> {
        self.record(ReplicationCall::ApplierState(db.0.clone()));
        Ok(*self
            .inner
            .lock()
            .applier_states
            .get(db)
            .unwrap_or(&ApplierState::Stopped))
    }

    fn applier_full_sync(
        &self,
        db: &DatabaseName,
        endpoint: &str,
    ) -> Result<u64, ReplicationError> {
        self.record(ReplicationCall::ApplierFullSync(
            db.0.clone(),
            endpoint.to_string(),
        ));
        if self.inner.lock().full_sync_failures.contains(db) {
            return Err(ReplicationError::Applier {
                db: db.0.clone(),
                reason: "scripted full-sync failure".into(),
            });
        }
        Ok(7)
    }

    fn applier_start(&self, db: &DatabaseName, from_tick: u64) -> Result<(), ReplicationError> {
        self.record(ReplicationCall::ApplierStart(db.0.clone(), from_tick));
        self.inner
            .lock()
            .applier_states
            .insert(db.clone(), ApplierState::Running);
        Ok(())
    }

    fn applier_stop(&self, db: &DatabaseName) -> Result<(), ReplicationError> {
        self.record(ReplicationCall::ApplierStop(db.0.clone()));
        self.inner
            .lock()
            .applier_states
            .insert(db.clone(), ApplierState::Stopped);
        Ok(())
    }

    fn applier_forget(&self, db: &DatabaseName) -> Result<(), ReplicationError> {
        self.record(ReplicationCall::ApplierForget(db.0.clone()));
        self.inner.lock().applier_states.remove(db);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ScriptedPeer
// ---------------------------------------------------------------------------

struct Responder {
    method: Method,
    url_fragment: String,
    responses: VecDeque<PeerResponse>,
    last: PeerResponse,
}

#[derive(Default)]
struct ScriptedPeerInner {
    responders: Vec<Responder>,
    log: Vec<PeerRequest>,
    fail_fragments: Vec<String>,
}

/// Peer transport with scripted responses and a request log.
/// Unscripted requests are answered with a bare 200.
#[derive(Default)]
pub struct ScriptedPeer {
    inner: Mutex<ScriptedPeerInner>,
}

impl ScriptedPeer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn json_response(status: u16, body: Value) -> PeerResponse {
        PeerResponse {
            status,
            body: Some(body),
            async_id: None,
        }
    }

    pub fn status_response(status: u16) -> PeerResponse {
        PeerResponse {
            status,
            body: None,
            async_id: None,
        }
    }

    /// A 202 carrying an async job id, as returned for async-store
    /// dispatch.
    pub fn async_accepted(job_id: &str) -> PeerResponse {
        PeerResponse {
            status: 202,
            body: None,
            async_id: Some(job_id.to_string()),
        }
    }

    /// Answer every matching request with `response`.
    pub fn respond(&self, method: Method, url_fragment: &str, response: PeerResponse) {
        self.inner.lock().responders.push(Responder {
            method,
            url_fragment: url_fragment.to_string(),
            responses: VecDeque::new(),
            last: response,
        });
    }

    /// Answer matching requests with the given sequence; the last
    /// response repeats.
    pub fn respond_seq(&self, method: Method, url_fragment: &str, responses: Vec<PeerResponse>) {
        let mut queue: VecDeque<PeerResponse> = responses.into();
        let last = queue
            .pop_back()
            .unwrap_or_else(|| Self::status_response(200));
        self.inner.lock().responders.push(Responder {
            method,
            url_fragment: url_fragment.to_string(),
            responses: queue,
            last,
        });
    }

    /// Every matching request fails at the transport level.
    pub fn fail_requests(&self, url_fragment: &str) {
        self.inner.lock().fail_fragments.push(url_fragment.to_string());
    }

    pub fn requests(&self) -> Vec<PeerRequest> {
        self.inner.lock().log.clone()
    }

    pub fn count(&self, method: Method, url_fragment: &str) -> usize {
        self.inner
            .lock()
            .log
            .iter()
            .filter(|r| r.method == method && r.url.contains(url_fragment))
            .count()
    }
}

impl PeerTransport for ScriptedPeer {
    fn execute(&self, request: &PeerRequest) -> Result<PeerResponse, TransportError> {
        let mut inner = self.inner.lock();
        inner.log.push(request.clone());
        if inner
            .fail_fragments
            .iter()
            .any(|frag| request.url.contains(frag.as_str()))
        {
            return Err(TransportError::Request {
                url: request.url.clone(),
                reason: "injected transport failure".into(),
            });
        }
        // Latest matching responder wins, so tests can override the
        // fixture defaults.
        for responder in inner.responders.iter_mut().rev() {
            if responder.method == request.method && request.url.contains(&responder.url_fragment) {
                return Ok(responder
                    .responses
                    .pop_front()
                    .unwrap_or_else(|| responder.last.clone()));
            }
        }
        Ok(Self::status_response(200))
    }
}
