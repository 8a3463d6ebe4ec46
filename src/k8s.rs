//! Cluster API access: store traits, kube-rs implementation and object manifests.

pub mod client;
pub mod manifests;
pub mod node;
pub mod store;
pub mod target;

#[cfg(test)]
pub mod fake;

pub use client::{KubeNodeStore, KubeStore};
pub use store::{Applied, ClusterStore, ManagedObject, NodeStore, ObjectKey, ObjectKind};
