//! Cross-module scenarios driven through the reconciliation engine.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use osprey_common::config::ClusterSyncConfig;
use osprey_common::types::{DatabaseName, PlanId, ServerId, ServerRole, ShardName};

use crate::agency::{paths, Agency, MemoryAgency, CURRENT_PARTITION};
use crate::context::SyncContext;
use crate::engine::ReconciliationEngine;
use crate::plan::{
    CollectionProperties, CollectionStatus, CollectionType, Current, CurrentDatabase,
    CurrentShard, Plan, PlanCollection, PlanDatabase,
};
use crate::testing::{MemoryStore, ReplicationCall, ScriptedPeer, ScriptedReplication};

struct Cluster {
    engine: ReconciliationEngine,
    ctx: Arc<SyncContext>,
    agency: Arc<MemoryAgency>,
    store: Arc<MemoryStore>,
    replication: Arc<ScriptedReplication>,
}

fn cluster(role: ServerRole) -> Cluster {
    let agency = Arc::new(MemoryAgency::new());
    let store = Arc::new(MemoryStore::new());
    let replication = Arc::new(ScriptedReplication::new());
    let ctx = Arc::new(SyncContext::new(
        ServerId::from("B"),
        role,
        ClusterSyncConfig {
            leader_wait_attempts: 2,
            leader_wait_interval_ms: 1,
            read_lock_poll_interval_ms: 1,
            ..Default::default()
        },
        agency.clone(),
        store.clone(),
        replication.clone(),
        Arc::new(ScriptedPeer::new()),
    ));
    Cluster {
        engine: ReconciliationEngine::new(ctx.clone()),
        ctx,
        agency,
        store,
        replication,
    }
}

fn plan_database(plan: &mut Plan, name: &str) {
    plan.databases.insert(
        DatabaseName::from(name),
        PlanDatabase {
            name: DatabaseName::from(name),
            id: String::new(),
        },
    );
}

fn plan_shard(plan: &mut Plan, db: &str, plan_id: &str, shard: &str, servers: &[&str]) {
    plan_database(plan, db);
    let collection = PlanCollection {
        id: PlanId::from(plan_id),
        name: format!("c{plan_id}"),
        collection_type: CollectionType::Document,
        status: CollectionStatus::Loaded,
        shards: BTreeMap::from([(
            ShardName::from(shard),
            servers.iter().map(|s| ServerId::from(*s)).collect(),
        )]),
        indexes: vec![],
        properties: CollectionProperties::default(),
    };
    plan.collections
        .entry(DatabaseName::from(db))
        .or_default()
        .insert(PlanId::from(plan_id), collection);
}

fn pair(plan: &mut Plan, primary: &str, secondary: &str) {
    plan.db_servers
        .insert(ServerId::from(primary), ServerId::from(secondary));
}

#[test]
fn test_scenario_planned_database_materializes() {
    let c = cluster(ServerRole::Primary);
    let mut plan = Plan::default();
    pair(&mut plan, "B", "C");
    plan_database(&mut plan, "d1");

    let outcome = c.engine.handle_plan_change(&plan, &Current::default());
    assert!(outcome.success);

    assert!(c.store.has_database(&DatabaseName::from("d1")));
    let entry = c
        .agency
        .get("Current/Databases/d1/B")
        .unwrap()
        .expect("database entry in Current");
    assert_eq!(entry["name"], "d1");
    assert_eq!(entry["error"], false);
    assert_eq!(entry["errorNum"], 0);
}

#[test]
fn test_scenario_new_follower_creates_shard_and_schedules_sync() {
    let c = cluster(ServerRole::Primary);
    let mut plan = Plan::default();
    pair(&mut plan, "B", "C");
    pair(&mut plan, "A", "D");
    plan_shard(&mut plan, "d1", "100", "s1", &["A", "B"]);

    // The leader A has registered the shard; we are not in its list.
    let mut current = Current::default();
    current.collections.insert(
        DatabaseName::from("d1"),
        BTreeMap::from([(
            PlanId::from("100"),
            BTreeMap::from([(
                ShardName::from("s1"),
                CurrentShard {
                    servers: vec![ServerId::from("A")],
                    ..Default::default()
                },
            )]),
        )]),
    );

    let outcome = c.engine.handle_plan_change(&plan, &current);

    // The shard exists locally and exactly one sync job was scheduled,
    // so the pass asks to be re-triggered.
    assert!(!outcome.success);
    assert!(c.store.has_shard(&DatabaseName::from("d1"), &ShardName::from("s1")));
    assert_eq!(c.engine.scheduler().metrics().scheduled, 1);

    c.ctx.shutdown.shutdown();
    assert!(c.engine.scheduler().wait_idle(Duration::from_secs(5)));
}

#[test]
fn test_second_pass_is_fully_idempotent() {
    let c = cluster(ServerRole::Primary);
    let mut plan = Plan::default();
    pair(&mut plan, "B", "C");
    plan_shard(&mut plan, "d1", "100", "s1", &["B"]);

    let outcome = c.engine.handle_plan_change(&plan, &Current::default());
    assert!(outcome.success);
    let mutations = c.store.mutation_count();
    let version = c.agency.version_of(CURRENT_PARTITION);

    // Build the Current snapshot the first pass produced.
    let mut current = Current::default();
    current.databases.insert(
        DatabaseName::from("d1"),
        BTreeMap::from([(
            ServerId::from("B"),
            CurrentDatabase {
                name: DatabaseName::from("d1"),
                error: false,
                error_num: 0,
                error_message: String::new(),
            },
        )]),
    );
    let shard_entry: CurrentShard = serde_json::from_value(
        c.agency
            .get("Current/Collections/d1/100/s1")
            .unwrap()
            .unwrap(),
    )
    .unwrap();
    current.collections.insert(
        DatabaseName::from("d1"),
        BTreeMap::from([(
            PlanId::from("100"),
            BTreeMap::from([(ShardName::from("s1"), shard_entry)]),
        )]),
    );

    let outcome = c.engine.handle_plan_change(&plan, &current);
    assert!(outcome.success);
    assert_eq!(c.store.mutation_count(), mutations, "no extra storage mutations");
    assert_eq!(
        c.agency.version_of(CURRENT_PARTITION),
        version,
        "no extra Current writes"
    );
}

#[test]
fn test_promotion_claims_ownership_under_one_lock() {
    let c = cluster(ServerRole::Secondary);
    c.store.add_database(&DatabaseName::from("d1"));
    c.store.add_shard(
        &DatabaseName::from("d1"),
        crate::store::LocalCollection {
            name: ShardName::from("s1"),
            plan_id: PlanId::from("100"),
            collection_type: CollectionType::Document,
            status: CollectionStatus::Loaded,
            properties: CollectionProperties::default(),
        },
        vec![],
    );
    let mut plan = Plan::default();
    pair(&mut plan, "B", "C");
    plan_shard(&mut plan, "d1", "100", "s1", &["B"]);

    let outcome = c.engine.handle_plan_change(&plan, &Current::default());
    assert!(outcome.success);
    assert_eq!(c.ctx.role(), ServerRole::Primary);

    // Ownership of the shard was claimed with a forced write.
    let events = c.agency.events();
    assert!(events.contains(&"set:Current/Collections/d1/100/s1".to_string()));
    let entry = c
        .agency
        .get("Current/Collections/d1/100/s1")
        .unwrap()
        .unwrap();
    assert_eq!(entry["servers"][0], "B");
}

#[test]
fn test_demotion_tears_down_appliers_and_sets_up_replication() {
    let c = cluster(ServerRole::Primary);
    c.store.add_database(&DatabaseName::from("d1"));
    c.agency
        .set(
            &paths::server_endpoint(&ServerId::from("A")),
            json!("tcp://primary:8529"),
        )
        .unwrap();
    // "A" is primary now, we shadow it.
    let mut plan = Plan::default();
    pair(&mut plan, "A", "B");
    plan_database(&mut plan, "d1");

    let outcome = c.engine.handle_plan_change(&plan, &Current::default());
    assert!(outcome.success);
    assert_eq!(c.ctx.role(), ServerRole::Secondary);

    let calls = c.replication.calls();
    // Teardown of the old applier state, then fresh setup from the
    // designated primary.
    assert!(calls.contains(&ReplicationCall::ApplierStop("d1".into())));
    assert!(calls.contains(&ReplicationCall::ApplierForget("d1".into())));
    assert!(calls.contains(&ReplicationCall::ApplierFullSync(
        "d1".into(),
        "tcp://primary:8529".into()
    )));
    assert!(calls.contains(&ReplicationCall::ApplierStart("d1".into(), 7)));
}

#[test]
fn test_unknown_server_aborts_pass_without_mutations() {
    let c = cluster(ServerRole::Primary);
    let mut plan = Plan::default();
    pair(&mut plan, "A", "C");
    plan_database(&mut plan, "d1");

    let outcome = c.engine.handle_plan_change(&plan, &Current::default());
    assert!(!outcome.success);
    assert_eq!(c.store.mutation_count(), 0);
    assert_eq!(c.agency.version_of(CURRENT_PARTITION), 0);
}

#[test]
fn test_coordinator_pass_is_a_noop() {
    let c = cluster(ServerRole::Coordinator);
    let mut plan = Plan::default();
    plan_database(&mut plan, "d1");

    let outcome = c.engine.handle_plan_change(&plan, &Current::default());
    assert!(outcome.success);
    assert_eq!(c.store.mutation_count(), 0);
}

#[test]
fn test_outcome_echoes_snapshot_versions() {
    let c = cluster(ServerRole::Primary);
    let mut plan = Plan::default();
    pair(&mut plan, "B", "C");
    plan.version = 17;
    let mut current = Current::default();
    current.version = 9;

    let outcome = c.engine.handle_plan_change(&plan, &current);
    assert_eq!(outcome.plan_version, 17);
    assert_eq!(outcome.current_version, 9);
    assert!(outcome.success);
}
