//! The local storage engine, seen through the narrow seam the
//! reconciler needs.
//!
//! Every method is blocking. Failures carry the engine's numeric error
//! code (`StoreError`) so they can be surfaced verbatim in Current as
//! `{error, errorNum, errorMessage}`.

use std::time::Duration;

use osprey_common::error::StoreError;
use osprey_common::types::{DatabaseName, PlanId, ServerId, ShardName};

use crate::plan::{CollectionProperties, CollectionStatus, CollectionType, IndexSpec};

pub type StoreResult<T> = Result<T, StoreError>;

/// A locally present shard, as reported by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalCollection {
    pub name: ShardName,
    pub plan_id: PlanId,
    pub collection_type: CollectionType,
    pub status: CollectionStatus,
    pub properties: CollectionProperties,
}

/// Creation payload for a local shard.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardSpec {
    pub plan_id: PlanId,
    pub status: CollectionStatus,
    pub properties: CollectionProperties,
}

/// Property delta applied to an existing shard. Only the changed fields
/// are set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropertyPatch {
    pub journal_size: Option<u64>,
    pub wait_for_sync: Option<bool>,
    pub do_compact: Option<bool>,
    pub index_buckets: Option<u32>,
}

impl PropertyPatch {
    pub fn is_empty(&self) -> bool {
        self.journal_size.is_none()
            && self.wait_for_sync.is_none()
            && self.do_compact.is_none()
            && self.index_buckets.is_none()
    }

    /// The fields of `planned` that differ from `local`.
    pub fn diff(local: &CollectionProperties, planned: &CollectionProperties) -> Self {
        Self {
            journal_size: (local.journal_size != planned.journal_size)
                .then_some(planned.journal_size),
            wait_for_sync: (local.wait_for_sync != planned.wait_for_sync)
                .then_some(planned.wait_for_sync),
            do_compact: (local.do_compact != planned.do_compact).then_some(planned.do_compact),
            index_buckets: (local.index_buckets != planned.index_buckets)
                .then_some(planned.index_buckets),
        }
    }
}

/// Local storage collaborator.
pub trait LocalStore: Send + Sync {
    fn list_databases(&self) -> StoreResult<Vec<DatabaseName>>;
    fn create_database(&self, db: &DatabaseName) -> StoreResult<()>;
    fn drop_database(&self, db: &DatabaseName) -> StoreResult<()>;

    fn list_collections(&self, db: &DatabaseName) -> StoreResult<Vec<LocalCollection>>;
    fn create_collection(
        &self,
        db: &DatabaseName,
        shard: &ShardName,
        spec: &ShardSpec,
    ) -> StoreResult<()>;
    fn create_edge_collection(
        &self,
        db: &DatabaseName,
        shard: &ShardName,
        spec: &ShardSpec,
    ) -> StoreResult<()>;
    /// Bounded drop; a shard busy with writes may not drop in time and
    /// is retried on the next pass.
    fn drop_collection(
        &self,
        db: &DatabaseName,
        shard: &ShardName,
        timeout: Duration,
    ) -> StoreResult<()>;

    fn load(&self, db: &DatabaseName, shard: &ShardName) -> StoreResult<()>;
    fn unload(&self, db: &DatabaseName, shard: &ShardName) -> StoreResult<()>;
    fn update_properties(
        &self,
        db: &DatabaseName,
        shard: &ShardName,
        patch: &PropertyPatch,
    ) -> StoreResult<()>;

    fn ensure_index(&self, db: &DatabaseName, shard: &ShardName, index: &IndexSpec)
        -> StoreResult<()>;
    /// Returns false when the engine refused to drop the index.
    fn drop_index(&self, db: &DatabaseName, shard: &ShardName, index_id: &str)
        -> StoreResult<bool>;
    fn get_indexes(&self, db: &DatabaseName, shard: &ShardName) -> StoreResult<Vec<IndexSpec>>;

    /// Withdraw as leader of a shard: waits for in-flight writes to
    /// drain and stops accepting new ones until a new leadership deal
    /// is negotiated.
    fn leader_resign(&self, db: &DatabaseName, shard: &ShardName) -> StoreResult<()>;

    /// In-sync followers of a locally led shard.
    fn followers(&self, db: &DatabaseName, shard: &ShardName) -> StoreResult<Vec<ServerId>>;
    fn remove_follower(
        &self,
        db: &DatabaseName,
        shard: &ShardName,
        follower: &ServerId,
    ) -> StoreResult<()>;
}
