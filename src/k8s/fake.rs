//! In-memory store recording every mutation, for controller and agent tests.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;

use crate::error::{KbuError, Result};
use crate::k8s::node::{NodePatch, node_name};
use crate::k8s::store::{Applied, ClusterStore, ManagedObject, NodeStore, ObjectKey, ObjectKind};
use crate::k8s::target::{DesiredUpdate, UpgradeTarget};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    Created(ObjectKey),
    Deleted(ObjectKey),
    PatchedNode(String, NodePatch),
    RequestedUpgrade(DesiredUpdate),
}

#[derive(Default)]
pub struct FakeStore {
    pub target: Mutex<UpgradeTarget>,
    pub nodes: Mutex<Vec<Node>>,
    pub objects: Mutex<BTreeMap<ObjectKey, ManagedObject>>,
    pub mutations: Mutex<Vec<Mutation>>,
    /// Fail node patches, to exercise error paths.
    pub fail_patches: bool,
    /// Refuse creating objects of this kind.
    pub fail_create: Option<ObjectKind>,
    /// Refuse deleting objects of this kind.
    pub fail_delete: Option<ObjectKind>,
    pub fail_request: bool,
}

impl FakeStore {
    pub fn new(target: UpgradeTarget, nodes: Vec<Node>) -> Self {
        Self {
            target: Mutex::new(target),
            nodes: Mutex::new(nodes),
            ..Default::default()
        }
    }

    pub fn mutations(&self) -> Vec<Mutation> {
        self.mutations.lock().unwrap().clone()
    }

    pub fn clear_mutations(&self) {
        self.mutations.lock().unwrap().clear();
    }

    pub fn keys(&self) -> Vec<ObjectKey> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    pub fn node(&self, name: &str) -> Option<Node> {
        self.nodes
            .lock()
            .unwrap()
            .iter()
            .find(|n| node_name(n) == name)
            .cloned()
    }

    /// Progress annotation values written to a node, in order.
    pub fn progress_of(&self, name: &str) -> Vec<String> {
        self.mutations()
            .into_iter()
            .filter_map(|m| match m {
                Mutation::PatchedNode(node, patch) if node == name => patch
                    .annotations
                    .get(crate::labels::PROGRESS_ANNOTATION)
                    .cloned(),
                _ => None,
            })
            .collect()
    }

    fn record(&self, mutation: Mutation) {
        self.mutations.lock().unwrap().push(mutation);
    }
}

#[async_trait]
impl NodeStore for FakeStore {
    async fn list_nodes(&self) -> Result<Vec<Node>> {
        Ok(self.nodes.lock().unwrap().clone())
    }

    async fn get_node(&self, name: &str) -> Result<Node> {
        self.node(name)
            .ok_or_else(|| KbuError::Kubernetes(format!("node {name} not found")))
    }

    async fn patch_node(&self, name: &str, patch: &NodePatch) -> Result<()> {
        if self.fail_patches {
            return Err(KbuError::Kubernetes(format!("patch of node {name} refused")));
        }
        {
            let mut nodes = self.nodes.lock().unwrap();
            let node = nodes
                .iter_mut()
                .find(|n| node_name(n) == name)
                .ok_or_else(|| KbuError::Kubernetes(format!("node {name} not found")))?;
            patch.apply_to(node);
        }
        self.record(Mutation::PatchedNode(name.to_string(), patch.clone()));
        Ok(())
    }
}

#[async_trait]
impl ClusterStore for FakeStore {
    async fn get_upgrade_target(&self) -> Result<UpgradeTarget> {
        Ok(self.target.lock().unwrap().clone())
    }

    async fn request_upgrade(&self, update: &DesiredUpdate) -> Result<()> {
        if self.fail_request {
            return Err(KbuError::Kubernetes("update of the upgrade target refused".to_string()));
        }
        self.target.lock().unwrap().desired_update = Some(update.clone());
        self.record(Mutation::RequestedUpgrade(update.clone()));
        Ok(())
    }

    async fn create(&self, object: &ManagedObject) -> Result<Applied> {
        let key = object.key();
        if self.fail_create.as_ref() == Some(&key.kind) {
            return Err(KbuError::Kubernetes(format!("create of {key} refused")));
        }
        {
            let mut objects = self.objects.lock().unwrap();
            if objects.contains_key(&key) {
                return Ok(Applied::AlreadyExists);
            }
            objects.insert(key.clone(), object.clone());
        }
        self.record(Mutation::Created(key));
        Ok(Applied::Created)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<Applied> {
        if self.fail_delete.as_ref() == Some(&key.kind) {
            return Err(KbuError::Kubernetes(format!("delete of {key} refused")));
        }
        if self.objects.lock().unwrap().remove(key).is_none() {
            return Ok(Applied::NotFound);
        }
        self.record(Mutation::Deleted(key.clone()));
        Ok(Applied::Deleted)
    }
}
