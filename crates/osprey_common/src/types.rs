//! Identifier newtypes and small shared value types.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

string_id! {
    /// Cluster-wide unique identifier of a server.
    ServerId
}

string_id! {
    /// Name of a database.
    DatabaseName
}

string_id! {
    /// Name of one shard of a sharded collection.
    ShardName
}

string_id! {
    /// Identifier of a collection in the Plan.
    PlanId
}

impl DatabaseName {
    /// System databases (leading underscore) are never created or dropped
    /// by reconciliation.
    pub fn is_system(&self) -> bool {
        self.0.starts_with('_')
    }
}

/// Role of a server in the cluster. The authoritative value is derived
/// from the Plan; the locally cached value changes only through role
/// redetermination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServerRole {
    Primary,
    Secondary,
    Coordinator,
    Single,
}

impl ServerRole {
    pub fn is_data_server(self) -> bool {
        matches!(self, ServerRole::Primary | ServerRole::Secondary)
    }
}

impl fmt::Display for ServerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerRole::Primary => write!(f, "PRIMARY"),
            ServerRole::Secondary => write!(f, "SECONDARY"),
            ServerRole::Coordinator => write!(f, "COORDINATOR"),
            ServerRole::Single => write!(f, "SINGLE"),
        }
    }
}

/// Per-object error payload surfaced to Current. Field names match the
/// wire shape consumed by the rest of the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectError {
    pub error: bool,
    pub error_num: i64,
    pub error_message: String,
}

impl ObjectError {
    /// The "no error" payload written for healthy objects.
    pub fn none() -> Self {
        Self {
            error: false,
            error_num: 0,
            error_message: String::new(),
        }
    }

    pub fn new(error_num: i64, error_message: impl Into<String>) -> Self {
        Self {
            error: true,
            error_num,
            error_message: error_message.into(),
        }
    }
}

impl From<&StoreError> for ObjectError {
    fn from(err: &StoreError) -> Self {
        Self::new(err.code, err.message.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_error_wire_shape() {
        let err = ObjectError::new(1207, "duplicate name");
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["error"], true);
        assert_eq!(value["errorNum"], 1207);
        assert_eq!(value["errorMessage"], "duplicate name");
    }

    #[test]
    fn test_object_error_none() {
        let value = serde_json::to_value(ObjectError::none()).unwrap();
        assert_eq!(value["error"], false);
        assert_eq!(value["errorNum"], 0);
        assert_eq!(value["errorMessage"], "");
    }

    #[test]
    fn test_server_role_display() {
        assert_eq!(ServerRole::Primary.to_string(), "PRIMARY");
        assert_eq!(ServerRole::Secondary.to_string(), "SECONDARY");
        assert!(ServerRole::Primary.is_data_server());
        assert!(!ServerRole::Coordinator.is_data_server());
    }

    #[test]
    fn test_system_database_detection() {
        assert!(DatabaseName::from("_system").is_system());
        assert!(!DatabaseName::from("orders").is_system());
    }

    #[test]
    fn test_id_serde_transparent() {
        let id: ServerId = serde_json::from_str("\"DBS-1\"").unwrap();
        assert_eq!(id, ServerId::from("DBS-1"));
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"DBS-1\"");
    }
}
