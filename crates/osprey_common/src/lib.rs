//! Shared foundation for the Osprey cluster-sync subsystem.
//!
//! Small, dependency-light building blocks used by every other crate:
//! error taxonomy, identifier newtypes, configuration, and the
//! interruptible shutdown signal that all polling loops are built on.

pub mod config;
pub mod error;
pub mod shutdown;
pub mod types;

pub use config::ClusterSyncConfig;
pub use error::{
    AgencyError, ErrorContext, ErrorScope, OspreyError, OspreyResult, ReplicationError,
    StoreError, TransportError,
};
pub use shutdown::{PollOutcome, ShutdownSignal};
pub use types::{DatabaseName, ObjectError, PlanId, ServerId, ServerRole, ShardName};
