//! kube-rs backed implementations of the store traits.

use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Node, Service, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams,
};
use kube::{Client, Resource};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::debug;

use crate::error::{KbuError, Result, is_status};
use crate::k8s::node::NodePatch;
use crate::k8s::store::{Applied, ClusterStore, ManagedObject, NodeStore, ObjectKey, ObjectKind};
use crate::k8s::target::{DesiredUpdate, UpgradeTarget, cluster_version_resource};
use crate::labels::MANAGER;

/// Node access only, as used by the per-node agents.
#[derive(Clone)]
pub struct KubeNodeStore {
    client: Client,
}

impl KubeNodeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }
}

#[async_trait]
impl NodeStore for KubeNodeStore {
    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let list = self
            .nodes()
            .list(&ListParams::default())
            .await
            .map_err(|e| KbuError::kube("Failed to list nodes", &e))?;
        Ok(list.items)
    }

    async fn get_node(&self, name: &str) -> Result<Node> {
        self.nodes()
            .get(name)
            .await
            .map_err(|e| KbuError::kube(&format!("Failed to get node {name}"), &e))
    }

    async fn patch_node(&self, name: &str, patch: &NodePatch) -> Result<()> {
        let body = patch.to_merge_patch();
        self.nodes()
            .patch(name, &PatchParams::apply(MANAGER), &Patch::Merge(&body))
            .await
            .map_err(|e| KbuError::kube(&format!("Failed to patch node {name}"), &e))?;
        debug!(node = name, "Patched node");
        Ok(())
    }
}

/// Full cluster access for the controller.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    nodes: KubeNodeStore,
    namespace: String,
    target_name: String,
    target_resource: ApiResource,
}

impl KubeStore {
    pub fn new(client: Client, namespace: &str, target_name: &str) -> Self {
        Self {
            nodes: KubeNodeStore::new(client.clone()),
            client,
            namespace: namespace.to_string(),
            target_name: target_name.to_string(),
            target_resource: cluster_version_resource(),
        }
    }

    fn targets(&self) -> Api<DynamicObject> {
        Api::all_with(self.client.clone(), &self.target_resource)
    }

    fn namespaced<K>(&self) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn cluster<K>(&self) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::ClusterResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::all(self.client.clone())
    }
}

async fn create_object<K>(api: Api<K>, object: &K, key: &ObjectKey) -> Result<Applied>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug,
{
    match api.create(&PostParams::default(), object).await {
        Ok(_) => Ok(Applied::Created),
        Err(e) if is_status(&e, 409) => Ok(Applied::AlreadyExists),
        Err(e) => Err(KbuError::kube(&format!("Failed to create {key}"), &e)),
    }
}

async fn delete_object<K>(api: Api<K>, key: &ObjectKey) -> Result<Applied>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    match api.delete(&key.name, &DeleteParams::background()).await {
        Ok(_) => Ok(Applied::Deleted),
        Err(e) if is_status(&e, 404) => Ok(Applied::NotFound),
        Err(e) => Err(KbuError::kube(&format!("Failed to delete {key}"), &e)),
    }
}

#[async_trait]
impl NodeStore for KubeStore {
    async fn list_nodes(&self) -> Result<Vec<Node>> {
        self.nodes.list_nodes().await
    }

    async fn get_node(&self, name: &str) -> Result<Node> {
        self.nodes.get_node(name).await
    }

    async fn patch_node(&self, name: &str, patch: &NodePatch) -> Result<()> {
        self.nodes.patch_node(name, patch).await
    }
}

#[async_trait]
impl ClusterStore for KubeStore {
    async fn get_upgrade_target(&self) -> Result<UpgradeTarget> {
        let obj = self.targets().get(&self.target_name).await.map_err(|e| {
            KbuError::kube(&format!("Failed to get ClusterVersion {}", self.target_name), &e)
        })?;
        Ok(UpgradeTarget::from_dynamic(&obj))
    }

    async fn request_upgrade(&self, update: &DesiredUpdate) -> Result<()> {
        let patch = json!({ "spec": { "desiredUpdate": update } });
        self.targets()
            .patch(
                &self.target_name,
                &PatchParams::apply(MANAGER),
                &Patch::Merge(&patch),
            )
            .await
            .map_err(|e| {
                KbuError::kube(
                    &format!("Failed to request upgrade on ClusterVersion {}", self.target_name),
                    &e,
                )
            })?;
        Ok(())
    }

    async fn create(&self, object: &ManagedObject) -> Result<Applied> {
        let key = object.key();
        match object {
            ManagedObject::ServiceAccount(o) => create_object(self.namespaced(), o, &key).await,
            ManagedObject::ClusterRole(o) => create_object(self.cluster(), o, &key).await,
            ManagedObject::ClusterRoleBinding(o) => create_object(self.cluster(), o, &key).await,
            ManagedObject::Service(o) => create_object(self.namespaced(), o, &key).await,
            ManagedObject::DaemonSet(o) => create_object(self.namespaced(), o, &key).await,
            ManagedObject::Job(o) => create_object(self.namespaced(), o, &key).await,
        }
    }

    async fn delete(&self, key: &ObjectKey) -> Result<Applied> {
        match key.kind {
            ObjectKind::ServiceAccount => {
                delete_object(self.namespaced::<ServiceAccount>(), key).await
            }
            ObjectKind::ClusterRole => delete_object(self.cluster::<ClusterRole>(), key).await,
            ObjectKind::ClusterRoleBinding => {
                delete_object(self.cluster::<ClusterRoleBinding>(), key).await
            }
            ObjectKind::Service => delete_object(self.namespaced::<Service>(), key).await,
            ObjectKind::DaemonSet => delete_object(self.namespaced::<DaemonSet>(), key).await,
            ObjectKind::Job => delete_object(self.namespaced::<Job>(), key).await,
        }
    }
}
