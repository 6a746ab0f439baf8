//! Plan and Current: the cluster's desired and observed state documents.
//!
//! Both live in the coordination store; the subsystem works on immutable
//! snapshots taken once per reconciliation pass. Within a shard's server
//! list, position 0 is the leader and the rest are synchronous
//! followers; the list is never empty and leadership changes only
//! through explicit reconciliation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use osprey_common::types::{DatabaseName, PlanId, ServerId, ShardName};

/// Desired global state, owned by the coordination store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub databases: BTreeMap<DatabaseName, PlanDatabase>,
    /// database -> plan collection id -> collection.
    #[serde(default)]
    pub collections: BTreeMap<DatabaseName, BTreeMap<PlanId, PlanCollection>>,
    /// Authoritative primary -> designated-secondary pairing; server
    /// roles are derived from it.
    #[serde(default)]
    pub db_servers: BTreeMap<ServerId, ServerId>,
    #[serde(default)]
    pub version: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanDatabase {
    pub name: DatabaseName,
    #[serde(default)]
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanCollection {
    pub id: PlanId,
    pub name: String,
    #[serde(rename = "type", default)]
    pub collection_type: CollectionType,
    #[serde(default)]
    pub status: CollectionStatus,
    /// shard -> ordered server list; position 0 is the leader.
    pub shards: BTreeMap<ShardName, Vec<ServerId>>,
    #[serde(default)]
    pub indexes: Vec<IndexSpec>,
    #[serde(default)]
    pub properties: CollectionProperties,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionType {
    #[default]
    Document,
    Edge,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionStatus {
    #[default]
    Loaded,
    Unloaded,
}

/// The reconcilable collection properties. A delta between the planned
/// and the local values becomes a property patch on the local store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionProperties {
    pub journal_size: u64,
    pub wait_for_sync: bool,
    pub do_compact: bool,
    pub index_buckets: u32,
}

impl Default for CollectionProperties {
    fn default() -> Self {
        Self {
            journal_size: 32 * 1024 * 1024,
            wait_for_sync: false,
            do_compact: true,
            index_buckets: 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: IndexKind,
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub sparse: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
    Primary,
    Edge,
    Hash,
    Skiplist,
    Geo,
    Fulltext,
}

impl IndexKind {
    /// Primary and edge indexes belong to the storage engine; the
    /// reconciler never creates or drops them.
    pub fn is_system(self) -> bool {
        matches!(self, IndexKind::Primary | IndexKind::Edge)
    }
}

impl Plan {
    /// Flatten all shard assignments across databases and collections
    /// into one shard -> server-list map.
    pub fn shard_map(&self) -> BTreeMap<ShardName, Vec<ServerId>> {
        let mut map = BTreeMap::new();
        for collections in self.collections.values() {
            for collection in collections.values() {
                for (shard, servers) in &collection.shards {
                    map.insert(shard.clone(), servers.clone());
                }
            }
        }
        map
    }

    pub fn planned_servers(
        &self,
        db: &DatabaseName,
        plan_id: &PlanId,
        shard: &ShardName,
    ) -> Option<&Vec<ServerId>> {
        self.collections
            .get(db)
            .and_then(|colls| colls.get(plan_id))
            .and_then(|coll| coll.shards.get(shard))
    }
}

/// Observed global state, written per data server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Current {
    /// database -> reporting server -> entry.
    #[serde(default)]
    pub databases: BTreeMap<DatabaseName, BTreeMap<ServerId, CurrentDatabase>>,
    /// database -> plan collection id -> shard -> entry (written by the
    /// shard's leader).
    #[serde(default)]
    pub collections: BTreeMap<DatabaseName, BTreeMap<PlanId, BTreeMap<ShardName, CurrentShard>>>,
    #[serde(default)]
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentDatabase {
    pub name: DatabaseName,
    pub error: bool,
    pub error_num: i64,
    pub error_message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentShard {
    /// Position 0 is the reporting leader, the rest are in-sync
    /// followers.
    #[serde(default)]
    pub servers: Vec<ServerId>,
    /// Index descriptions as reported, including per-index error
    /// entries.
    #[serde(default)]
    pub indexes: Vec<serde_json::Value>,
    #[serde(default)]
    pub error: bool,
    #[serde(default)]
    pub error_num: i64,
    #[serde(default)]
    pub error_message: String,
}

impl Current {
    pub fn shard_entry(
        &self,
        db: &DatabaseName,
        plan_id: &PlanId,
        shard: &ShardName,
    ) -> Option<&CurrentShard> {
        self.collections
            .get(db)
            .and_then(|colls| colls.get(plan_id))
            .and_then(|shards| shards.get(shard))
    }

    pub fn database_entry(
        &self,
        db: &DatabaseName,
        server: &ServerId,
    ) -> Option<&CurrentDatabase> {
        self.databases.get(db).and_then(|m| m.get(server))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collection(plan_id: &str, shards: &[(&str, &[&str])]) -> PlanCollection {
        PlanCollection {
            id: PlanId::from(plan_id),
            name: format!("c{plan_id}"),
            collection_type: CollectionType::Document,
            status: CollectionStatus::Loaded,
            shards: shards
                .iter()
                .map(|(shard, servers)| {
                    (
                        ShardName::from(*shard),
                        servers.iter().map(|s| ServerId::from(*s)).collect(),
                    )
                })
                .collect(),
            indexes: vec![],
            properties: CollectionProperties::default(),
        }
    }

    #[test]
    fn test_shard_map_flattens_all_databases() {
        let mut plan = Plan::default();
        plan.collections.insert(
            DatabaseName::from("d1"),
            BTreeMap::from([(
                PlanId::from("100"),
                collection("100", &[("s1", &["A", "B"]), ("s2", &["B", "A"])]),
            )]),
        );
        plan.collections.insert(
            DatabaseName::from("d2"),
            BTreeMap::from([(PlanId::from("200"), collection("200", &[("s3", &["C"])]))]),
        );

        let map = plan.shard_map();
        assert_eq!(map.len(), 3);
        assert_eq!(
            map[&ShardName::from("s1")],
            vec![ServerId::from("A"), ServerId::from("B")]
        );
        assert_eq!(map[&ShardName::from("s3")], vec![ServerId::from("C")]);
    }

    #[test]
    fn test_planned_servers_lookup() {
        let mut plan = Plan::default();
        plan.collections.insert(
            DatabaseName::from("d1"),
            BTreeMap::from([(PlanId::from("100"), collection("100", &[("s1", &["A", "B"])]))]),
        );

        let servers = plan
            .planned_servers(
                &DatabaseName::from("d1"),
                &PlanId::from("100"),
                &ShardName::from("s1"),
            )
            .unwrap();
        assert_eq!(servers[0], ServerId::from("A"));
        assert!(plan
            .planned_servers(
                &DatabaseName::from("d1"),
                &PlanId::from("100"),
                &ShardName::from("s9"),
            )
            .is_none());
    }

    #[test]
    fn test_index_kind_system() {
        assert!(IndexKind::Primary.is_system());
        assert!(IndexKind::Edge.is_system());
        assert!(!IndexKind::Hash.is_system());
        assert!(!IndexKind::Skiplist.is_system());
    }

    #[test]
    fn test_current_shard_wire_shape() {
        let entry = CurrentShard {
            servers: vec![ServerId::from("A")],
            indexes: vec![],
            error: false,
            error_num: 0,
            error_message: String::new(),
        };
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["servers"][0], "A");
        assert_eq!(value["errorNum"], 0);
    }

    #[test]
    fn test_plan_collection_type_serde() {
        let coll = collection("100", &[("s1", &["A"])]);
        let value = serde_json::to_value(&coll).unwrap();
        assert_eq!(value["type"], "document");
        let back: PlanCollection = serde_json::from_value(value).unwrap();
        assert_eq!(back.collection_type, CollectionType::Document);
    }
}
