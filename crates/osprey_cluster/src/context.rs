//! The explicit context threaded through every component: node
//! identity, cached role, configuration, and the four collaborators.

use std::sync::Arc;

use parking_lot::RwLock;

use osprey_common::config::ClusterSyncConfig;
use osprey_common::error::{AgencyError, OspreyError, OspreyResult};
use osprey_common::shutdown::ShutdownSignal;
use osprey_common::types::{DatabaseName, PlanId, ServerId, ServerRole, ShardName};

use crate::agency::{paths, Agency};
use crate::plan::{CurrentShard, PlanCollection};
use crate::replication::ReplicationClient;
use crate::store::LocalStore;
use crate::transport::PeerTransport;

/// Cached role of this node. Mutated only through role
/// redetermination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleState {
    pub role: ServerRole,
    /// For secondaries: the primary this node shadows.
    pub id_of_primary: Option<ServerId>,
}

/// Everything a reconciliation pass or a sync run needs.
pub struct SyncContext {
    pub server_id: ServerId,
    pub config: ClusterSyncConfig,
    pub agency: Arc<dyn Agency>,
    pub store: Arc<dyn LocalStore>,
    pub replication: Arc<dyn ReplicationClient>,
    pub peers: Arc<dyn PeerTransport>,
    pub shutdown: ShutdownSignal,
    role: RwLock<RoleState>,
}

impl SyncContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        server_id: ServerId,
        role: ServerRole,
        config: ClusterSyncConfig,
        agency: Arc<dyn Agency>,
        store: Arc<dyn LocalStore>,
        replication: Arc<dyn ReplicationClient>,
        peers: Arc<dyn PeerTransport>,
    ) -> Self {
        Self {
            server_id,
            config,
            agency,
            store,
            replication,
            peers,
            shutdown: ShutdownSignal::new(),
            role: RwLock::new(RoleState {
                role,
                id_of_primary: None,
            }),
        }
    }

    pub fn role(&self) -> ServerRole {
        self.role.read().role
    }

    pub fn role_state(&self) -> RoleState {
        self.role.read().clone()
    }

    pub(crate) fn set_role_state(&self, state: RoleState) {
        *self.role.write() = state;
    }

    /// Registered endpoint of a server, read from the agency.
    pub fn server_endpoint(&self, server: &ServerId) -> OspreyResult<String> {
        let path = paths::server_endpoint(server);
        match self.agency.get(&path)? {
            Some(serde_json::Value::String(endpoint)) => Ok(endpoint),
            Some(_) => Err(AgencyError::Malformed {
                path,
                reason: "endpoint is not a string".into(),
            }
            .into()),
            None => Err(AgencyError::KeyNotFound(path).into()),
        }
    }

    /// Fresh planned server list of a shard, read from the agency.
    pub(crate) fn planned_servers(
        &self,
        db: &DatabaseName,
        plan_id: &PlanId,
        shard: &ShardName,
    ) -> OspreyResult<Option<Vec<ServerId>>> {
        let path = paths::plan_collection(db, plan_id);
        match self.agency.get(&path)? {
            None => Ok(None),
            Some(value) => {
                let collection: PlanCollection =
                    serde_json::from_value(value).map_err(|e| {
                        OspreyError::from(AgencyError::Malformed {
                            path,
                            reason: e.to_string(),
                        })
                    })?;
                Ok(collection.shards.get(shard).cloned())
            }
        }
    }

    /// Fresh Current server list of a shard, read from the agency.
    pub(crate) fn current_servers(
        &self,
        db: &DatabaseName,
        plan_id: &PlanId,
        shard: &ShardName,
    ) -> OspreyResult<Option<Vec<ServerId>>> {
        let path = paths::current_collection(db, plan_id, shard);
        match self.agency.get(&path)? {
            None => Ok(None),
            Some(value) => {
                let entry: CurrentShard = serde_json::from_value(value).map_err(|e| {
                    OspreyError::from(AgencyError::Malformed {
                        path,
                        reason: e.to_string(),
                    })
                })?;
                Ok(Some(entry.servers))
            }
        }
    }
}
