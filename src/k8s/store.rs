//! Narrow capability interface over the cluster API.
//!
//! The controller and agents only ever talk to the cluster through these
//! traits, so their logic runs unchanged against the in-memory fake in tests.

use std::fmt;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Node, Service, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};

use crate::error::Result;
use crate::k8s::node::NodePatch;
use crate::k8s::target::{DesiredUpdate, UpgradeTarget};

/// Kinds of objects the controller creates and deletes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ObjectKind {
    ServiceAccount,
    ClusterRole,
    ClusterRoleBinding,
    Service,
    DaemonSet,
    Job,
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ServiceAccount => write!(f, "ServiceAccount"),
            Self::ClusterRole => write!(f, "ClusterRole"),
            Self::ClusterRoleBinding => write!(f, "ClusterRoleBinding"),
            Self::Service => write!(f, "Service"),
            Self::DaemonSet => write!(f, "DaemonSet"),
            Self::Job => write!(f, "Job"),
        }
    }
}

/// Typed key of a managed object. Namespaced kinds live in the store's namespace.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    pub kind: ObjectKind,
    pub name: String,
}

impl ObjectKey {
    pub fn new(kind: ObjectKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

/// An object the controller ensures exists.
#[derive(Debug, Clone)]
pub enum ManagedObject {
    ServiceAccount(ServiceAccount),
    ClusterRole(ClusterRole),
    ClusterRoleBinding(ClusterRoleBinding),
    Service(Service),
    DaemonSet(DaemonSet),
    Job(Job),
}

impl ManagedObject {
    pub fn key(&self) -> ObjectKey {
        let (kind, name) = match self {
            Self::ServiceAccount(o) => (ObjectKind::ServiceAccount, &o.metadata.name),
            Self::ClusterRole(o) => (ObjectKind::ClusterRole, &o.metadata.name),
            Self::ClusterRoleBinding(o) => (ObjectKind::ClusterRoleBinding, &o.metadata.name),
            Self::Service(o) => (ObjectKind::Service, &o.metadata.name),
            Self::DaemonSet(o) => (ObjectKind::DaemonSet, &o.metadata.name),
            Self::Job(o) => (ObjectKind::Job, &o.metadata.name),
        };
        ObjectKey::new(kind, name.clone().unwrap_or_default())
    }
}

/// Result of an idempotent create or delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Created,
    AlreadyExists,
    Deleted,
    NotFound,
}

/// Node access needed by the per-node agents.
#[async_trait]
pub trait NodeStore: Send + Sync {
    async fn list_nodes(&self) -> Result<Vec<Node>>;

    async fn get_node(&self, name: &str) -> Result<Node>;

    /// Merge-patch labels and annotations of a node (last writer wins).
    async fn patch_node(&self, name: &str, patch: &NodePatch) -> Result<()>;
}

/// Everything the controller needs on top of node access.
#[async_trait]
pub trait ClusterStore: NodeStore {
    async fn get_upgrade_target(&self) -> Result<UpgradeTarget>;

    async fn request_upgrade(&self, update: &DesiredUpdate) -> Result<()>;

    /// Create the object; an existing object of the same key is not an error.
    async fn create(&self, object: &ManagedObject) -> Result<Applied>;

    /// Delete the object; a missing object is not an error.
    async fn delete(&self, key: &ObjectKey) -> Result<Applied>;
}
