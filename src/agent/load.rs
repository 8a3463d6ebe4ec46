//! Bundle loading agent: stage the extracted bundle's images into the container runtime.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::progress::Progress;
use crate::error::{KbuError, Result};
use crate::k8s::NodeStore;
use crate::k8s::node::NodePatch;
use crate::labels::{LOADED_LABEL, TRUE};
use crate::metadata::Metadata;
use crate::registry::{RegistryConfig, RegistryServer};
use crate::runtime::RuntimeControl;

#[derive(Debug, Clone)]
pub struct LoadConfig {
    pub node_name: String,
    pub extract_dir: PathBuf,
    pub host_root: PathBuf,
    pub runtime_unit: String,
    pub listen_addr: SocketAddr,
}

pub struct LoadAgent<S> {
    config: LoadConfig,
    store: Arc<S>,
    progress: Progress<S>,
    runtime: RuntimeControl,
    registry_addr: Mutex<Option<SocketAddr>>,
}

impl<S: NodeStore + 'static> LoadAgent<S> {
    pub fn new(config: LoadConfig, store: Arc<S>, runtime: RuntimeControl) -> Self {
        let progress = Progress::new(Arc::clone(&store), &config.node_name);
        Self {
            config,
            store,
            progress,
            runtime,
            registry_addr: Mutex::new(None),
        }
    }

    /// Address the private registry was last bound to.
    pub fn registry_addr(&self) -> Option<SocketAddr> {
        self.registry_addr.lock().ok().and_then(|addr| *addr)
    }

    /// Load every image of the extracted bundle, returning how many were pulled.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<usize> {
        let dir = &self.config.extract_dir;
        if !tokio::fs::try_exists(dir)
            .await
            .map_err(|e| KbuError::io(dir.display().to_string(), e))?
        {
            return Err(KbuError::Extraction(format!(
                "{} does not exist, the bundle has not been extracted",
                dir.display()
            )));
        }
        let metadata = Metadata::read_from_dir(dir).await?;
        info!(version = %metadata.version, images = metadata.images.len(), "Loading bundle");

        let mut registry = RegistryServer::build(RegistryConfig {
            listen_addr: self.config.listen_addr,
            root_dir: dir.clone(),
            tls_files: None,
        })?;
        let result = match registry.start().await {
            Ok(addr) => {
                if let Ok(mut last) = self.registry_addr.lock() {
                    *last = Some(addr);
                }
                self.stage(&metadata, addr, cancel).await
            }
            Err(e) => Err(e),
        };
        registry.stop().await;
        let loaded = result?;

        tokio::fs::remove_dir_all(dir)
            .await
            .map_err(|e| KbuError::io(dir.display().to_string(), e))?;
        self.mark_loaded().await?;
        info!(images = loaded, "Bundle loaded");
        Ok(loaded)
    }

    /// Pull every image through the runtime while it mirrors to the private registry.
    async fn stage(
        &self,
        metadata: &Metadata,
        registry: SocketAddr,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        self.runtime.create_pin_config(&metadata.images).await?;
        self.runtime
            .create_mirror_config(&registry.to_string(), &metadata.images)
            .await?;
        self.runtime.reload_service().await?;

        if let Err(e) = self.pull_all(&metadata.images, cancel).await {
            self.unmirror_after_failure().await;
            return Err(e);
        }

        self.runtime.remove_mirror_config().await?;
        self.runtime.reload_service().await?;
        Ok(metadata.images.len())
    }

    async fn pull_all(&self, images: &[String], cancel: &CancellationToken) -> Result<()> {
        let total = images.len();
        for (i, image) in images.iter().enumerate() {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(KbuError::Cancelled),
                pulled = self.runtime.pull_image(image) => { pulled?; }
            }
            info!(%image, "Loaded image {} of {}", i + 1, total);
            self.progress
                .report(&format!("Loaded image {} of {}", i + 1, total))
                .await;
        }
        Ok(())
    }

    async fn unmirror_after_failure(&self) {
        if let Err(e) = self.runtime.remove_mirror_config().await {
            warn!("Failed to remove mirror configuration: {}", e);
            return;
        }
        if let Err(e) = self.runtime.reload_service().await {
            warn!("Failed to reload runtime after removing mirror configuration: {}", e);
        }
    }

    async fn mark_loaded(&self) -> Result<()> {
        let node = &self.config.node_name;
        self.store.get_node(node).await?;
        self.store
            .patch_node(node, &NodePatch::default().label(LOADED_LABEL, TRUE))
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::k8s::fake::FakeStore;
    use crate::k8s::node::{label_is_true, test_node};
    use crate::k8s::target::UpgradeTarget;
    use crate::labels::EXTRACTED_LABEL;
    use crate::metadata::METADATA_FILE;
    use crate::registry::storage::fixture;
    use crate::runtime::testing::{Recorder, runtime};

    const RELEASE: &str = "quay.io/openshift-release-dev/ocp-release:4.16.3";
    const COMPONENT: &str = "quay.io/openshift-release-dev/ocp-v4.0-art-dev:etcd";

    fn extracted_bundle(dir: &Path) {
        fixture::image(dir, "openshift-release-dev/ocp-release", "4.16.3", b"release");
        fixture::image(dir, "openshift-release-dev/ocp-v4.0-art-dev", "etcd", b"etcd");
        let metadata = Metadata {
            version: "4.16.3".to_string(),
            architecture: "x86_64".to_string(),
            release: RELEASE.to_string(),
            images: vec![RELEASE.to_string(), COMPONENT.to_string()],
        };
        std::fs::write(dir.join(METADATA_FILE), metadata.to_json().unwrap()).unwrap();
    }

    fn setup(root: &Path, recorder: &Recorder) -> (Arc<FakeStore>, LoadAgent<FakeStore>) {
        let store = Arc::new(FakeStore::new(
            UpgradeTarget::default(),
            vec![test_node("worker-0", &[(EXTRACTED_LABEL, "true")], &[])],
        ));
        let config = LoadConfig {
            node_name: "worker-0".to_string(),
            extract_dir: root.join("bundle"),
            host_root: root.join("host"),
            runtime_unit: "crio.service".to_string(),
            listen_addr: "127.0.0.1:0".parse().unwrap(),
        };
        let runtime = runtime(&config.host_root, recorder);
        let agent = LoadAgent::new(config, Arc::clone(&store), runtime);
        (store, agent)
    }

    #[tokio::test]
    async fn test_loads_every_image_and_marks_node() {
        let root = tempfile::tempdir().unwrap();
        extracted_bundle(&root.path().join("bundle"));
        let recorder = Recorder::default();
        let (store, agent) = setup(root.path(), &recorder);

        let loaded = agent.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(loaded, 2);
        assert_eq!(
            recorder.calls(),
            vec![
                "reload crio.service".to_string(),
                format!("pull {RELEASE}"),
                format!("pull {COMPONENT}"),
                "reload crio.service".to_string(),
            ]
        );

        assert!(agent.runtime.pin_config_path().exists());
        assert!(!agent.runtime.mirror_config_path().exists());
        assert!(!root.path().join("bundle").exists());

        let node = store.node("worker-0").unwrap();
        assert!(label_is_true(&node, LOADED_LABEL));
        assert_eq!(
            store.progress_of("worker-0"),
            vec!["Loaded image 1 of 2", "Loaded image 2 of 2"]
        );
    }

    #[tokio::test]
    async fn test_failed_pull_keeps_bundle_and_node_unloaded() {
        let root = tempfile::tempdir().unwrap();
        extracted_bundle(&root.path().join("bundle"));
        let recorder = Recorder {
            fail_pull: Some(COMPONENT.to_string()),
            ..Recorder::default()
        };
        let (store, agent) = setup(root.path(), &recorder);

        let err = agent.run(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, KbuError::Pull(_, _)));
        assert_registry_stopped(&agent).await;

        assert!(root.path().join("bundle").exists());
        assert!(!agent.runtime.mirror_config_path().exists());
        assert_eq!(recorder.calls().last().unwrap(), "reload crio.service");
        let node = store.node("worker-0").unwrap();
        assert!(!label_is_true(&node, LOADED_LABEL));
        assert_eq!(store.progress_of("worker-0"), vec!["Loaded image 1 of 2"]);
    }

    async fn assert_registry_stopped(agent: &LoadAgent<FakeStore>) {
        let addr = agent.registry_addr().unwrap();
        assert!(
            tokio::net::TcpStream::connect(addr).await.is_err(),
            "registry still accepts connections on {addr}"
        );
    }

    #[tokio::test]
    async fn test_cancelled_run_stops_registry_and_keeps_bundle() {
        let root = tempfile::tempdir().unwrap();
        extracted_bundle(&root.path().join("bundle"));
        let recorder = Recorder::default();
        let (store, agent) = setup(root.path(), &recorder);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = agent.run(&cancel).await.unwrap_err();
        assert!(matches!(err, KbuError::Cancelled));
        assert_registry_stopped(&agent).await;

        assert!(root.path().join("bundle").exists());
        assert!(!agent.runtime.mirror_config_path().exists());
        assert!(!recorder.calls().iter().any(|c| c.starts_with("pull ")));
        let node = store.node("worker-0").unwrap();
        assert!(!label_is_true(&node, LOADED_LABEL));
    }

    #[tokio::test]
    async fn test_successful_run_stops_registry() {
        let root = tempfile::tempdir().unwrap();
        extracted_bundle(&root.path().join("bundle"));
        let recorder = Recorder::default();
        let (_store, agent) = setup(root.path(), &recorder);

        assert_eq!(agent.registry_addr(), None);
        agent.run(&CancellationToken::new()).await.unwrap();
        assert_registry_stopped(&agent).await;
    }

    #[tokio::test]
    async fn test_missing_extraction_directory_is_an_error() {
        let root = tempfile::tempdir().unwrap();
        let recorder = Recorder::default();
        let (store, agent) = setup(root.path(), &recorder);

        let err = agent.run(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, KbuError::Extraction(_)));
        assert!(recorder.calls().is_empty());
        assert!(store.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_restart_after_success_is_rejected_without_side_effects() {
        let root = tempfile::tempdir().unwrap();
        extracted_bundle(&root.path().join("bundle"));
        let recorder = Recorder::default();
        let (_store, agent) = setup(root.path(), &recorder);

        agent.run(&CancellationToken::new()).await.unwrap();
        let calls = recorder.calls().len();
        assert!(agent.run(&CancellationToken::new()).await.is_err());
        assert_eq!(recorder.calls().len(), calls);
    }
}
