//! Container runtime control on the host: pin and mirror configuration,
//! service reload over D-Bus and image pulls over CRI.

pub mod cri;
pub mod files;
pub mod systemd;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::Result;

/// CRI-O socket, relative to the host root.
pub const CRIO_SOCKET: &str = "run/crio/crio.sock";
/// System D-Bus socket, relative to the host root.
pub const DBUS_SOCKET: &str = "run/dbus/system_bus_socket";
/// Pinned image drop-in, relative to the host root.
pub const PIN_CONFIG: &str = "etc/crio/crio.conf.d/50-kbu-pinned-images.conf";
/// Registry mirror drop-in, relative to the host root.
pub const MIRROR_CONFIG: &str = "etc/containers/registries.conf.d/50-kbu-mirrors.conf";

/// Pulls an image through the runtime, returning the runtime's image id.
#[async_trait]
pub trait ImagePuller: Send + Sync {
    async fn pull_image(&self, reference: &str) -> Result<String>;
}

/// Reloads a service unit and waits for the reload job to finish.
#[async_trait]
pub trait ServiceReloader: Send + Sync {
    async fn reload(&self, unit: &str) -> Result<()>;
}

pub struct RuntimeControl {
    host_root: PathBuf,
    unit: String,
    puller: Box<dyn ImagePuller>,
    reloader: Box<dyn ServiceReloader>,
}

impl RuntimeControl {
    pub fn new(
        host_root: &Path,
        unit: &str,
        puller: Box<dyn ImagePuller>,
        reloader: Box<dyn ServiceReloader>,
    ) -> Self {
        Self {
            host_root: host_root.to_path_buf(),
            unit: unit.to_string(),
            puller,
            reloader,
        }
    }

    /// Control CRI-O through its socket and systemd through the system bus under `host_root`.
    pub fn host(host_root: &Path, unit: &str) -> Self {
        let puller = cri::CriImagePuller::new(host_root.join(CRIO_SOCKET));
        let reloader = systemd::SystemdReloader::new(format!(
            "unix:path={}",
            host_root.join(DBUS_SOCKET).display()
        ));
        Self::new(host_root, unit, Box::new(puller), Box::new(reloader))
    }

    pub fn pin_config_path(&self) -> PathBuf {
        self.host_root.join(PIN_CONFIG)
    }

    pub fn mirror_config_path(&self) -> PathBuf {
        self.host_root.join(MIRROR_CONFIG)
    }

    /// Pin `references` so the runtime never garbage-collects them.
    pub async fn create_pin_config(&self, references: &[String]) -> Result<()> {
        let contents = files::render_pin_config(references)?;
        files::write_atomic(&self.pin_config_path(), &contents).await?;
        info!(images = references.len(), "Wrote pinned images configuration");
        Ok(())
    }

    pub async fn remove_pin_config(&self) -> Result<()> {
        files::remove_if_exists(&self.pin_config_path()).await
    }

    /// Redirect pulls of every repository in `references` to `mirror`.
    pub async fn create_mirror_config(&self, mirror: &str, references: &[String]) -> Result<()> {
        let contents = files::render_mirror_config(mirror, references)?;
        files::write_atomic(&self.mirror_config_path(), &contents).await?;
        info!(%mirror, "Wrote registry mirror configuration");
        Ok(())
    }

    pub async fn remove_mirror_config(&self) -> Result<()> {
        files::remove_if_exists(&self.mirror_config_path()).await
    }

    pub async fn reload_service(&self) -> Result<()> {
        debug!(unit = %self.unit, "Reloading runtime service");
        self.reloader.reload(&self.unit).await?;
        info!(unit = %self.unit, "Reloaded runtime service");
        Ok(())
    }

    pub async fn pull_image(&self, reference: &str) -> Result<String> {
        let image_id = self.puller.pull_image(reference).await?;
        debug!(%reference, %image_id, "Pulled image");
        Ok(image_id)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{Recorder, runtime};

    #[tokio::test]
    async fn test_config_files_are_created_and_removed() {
        let root = tempfile::tempdir().unwrap();
        let recorder = Recorder::default();
        let runtime = runtime(root.path(), &recorder);
        let refs = vec!["quay.io/a/b:1".to_string()];

        runtime.create_pin_config(&refs).await.unwrap();
        runtime
            .create_mirror_config("127.0.0.1:5000", &refs)
            .await
            .unwrap();
        assert!(runtime.pin_config_path().exists());
        assert!(runtime.mirror_config_path().exists());
        assert!(runtime.pin_config_path().starts_with(root.path()));

        runtime.remove_mirror_config().await.unwrap();
        runtime.remove_pin_config().await.unwrap();
        assert!(!runtime.mirror_config_path().exists());
        assert!(!runtime.pin_config_path().exists());

        // removing twice is fine
        runtime.remove_mirror_config().await.unwrap();
    }

    #[tokio::test]
    async fn test_reload_and_pull_delegate() {
        let root = tempfile::tempdir().unwrap();
        let recorder = Recorder::default();
        let runtime = runtime(root.path(), &recorder);

        runtime.reload_service().await.unwrap();
        runtime.pull_image("quay.io/a/b:1").await.unwrap();
        assert_eq!(
            recorder.calls(),
            vec!["reload crio.service", "pull quay.io/a/b:1"]
        );
    }
}
