//! Stage identities and the least-privilege access policy between them.
//!
//! Every store handle and publisher in the pipeline is opened on behalf of a
//! [`Principal`]. Guards consult the [`AccessPolicy`] before each operation, so
//! a loader identity cannot write landing objects or publish notifications,
//! and an ingest identity cannot touch the warehouse.

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A named service identity (e.g. `ingest@datafeed.iam`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Principal(String);

impl Principal {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An operation that crosses a trust boundary.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Permission {
    /// Publish to a bus topic.
    Publish { topic: String },
    LandingRead,
    LandingWrite,
    WarehouseRead { dataset: String },
    WarehouseWrite { dataset: String },
}

impl Permission {
    pub fn publish(topic: impl Into<String>) -> Self {
        Self::Publish {
            topic: topic.into(),
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Publish { topic } => write!(f, "publish to topic '{topic}'"),
            Self::LandingRead => f.write_str("read the landing store"),
            Self::LandingWrite => f.write_str("write the landing store"),
            Self::WarehouseRead { dataset } => write!(f, "read warehouse dataset '{dataset}'"),
            Self::WarehouseWrite { dataset } => write!(f, "write warehouse dataset '{dataset}'"),
        }
    }
}

/// Raised when a principal attempts an operation it was not granted.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("principal '{principal}' is not permitted to {permission}")]
pub struct AccessDenied {
    pub principal: Principal,
    pub permission: Permission,
}

/// The principals each stage runs as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageIdentities {
    pub scheduler: Principal,
    pub ingest: Principal,
    pub load: Principal,
    pub join: Principal,
}

impl Default for StageIdentities {
    fn default() -> Self {
        Self {
            scheduler: Principal::new("scheduler@datafeed"),
            ingest: Principal::new("ingest@datafeed"),
            load: Principal::new("load@datafeed"),
            join: Principal::new("join@datafeed"),
        }
    }
}

/// Explicit grants per principal. Anything not granted is denied.
#[derive(Debug, Clone, Default)]
pub struct AccessPolicy {
    grants: HashMap<Principal, HashSet<Permission>>,
}

impl AccessPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a grant (builder style).
    pub fn grant(mut self, principal: &Principal, permission: Permission) -> Self {
        self.grants
            .entry(principal.clone())
            .or_default()
            .insert(permission);
        self
    }

    /// The standard separation of duties between pipeline stages.
    pub fn least_privilege(
        ids: &StageIdentities,
        trigger_topic: &str,
        notification_topic: &str,
        warehouse_dataset: &str,
    ) -> Self {
        Self::new()
            .grant(&ids.scheduler, Permission::publish(trigger_topic))
            .grant(&ids.ingest, Permission::LandingWrite)
            .grant(&ids.ingest, Permission::publish(notification_topic))
            .grant(&ids.load, Permission::LandingRead)
            .grant(
                &ids.load,
                Permission::WarehouseRead {
                    dataset: warehouse_dataset.to_string(),
                },
            )
            .grant(
                &ids.load,
                Permission::WarehouseWrite {
                    dataset: warehouse_dataset.to_string(),
                },
            )
            .grant(
                &ids.join,
                Permission::WarehouseRead {
                    dataset: warehouse_dataset.to_string(),
                },
            )
            .grant(
                &ids.join,
                Permission::WarehouseWrite {
                    dataset: warehouse_dataset.to_string(),
                },
            )
    }

    pub fn allows(&self, principal: &Principal, permission: &Permission) -> bool {
        self.grants
            .get(principal)
            .is_some_and(|granted| granted.contains(permission))
    }

    pub fn check(&self, principal: &Principal, permission: &Permission) -> Result<(), AccessDenied> {
        if self.allows(principal, permission) {
            Ok(())
        } else {
            tracing::warn!(principal = %principal, permission = %permission, "access denied");
            Err(AccessDenied {
                principal: principal.clone(),
                permission: permission.clone(),
            })
        }
    }
}
