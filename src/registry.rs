//! Embeddable read-only TLS registry serving an extracted bundle.

pub mod handlers;
pub mod storage;
pub mod tls;

use std::net::{SocketAddr, TcpListener};
use std::path::PathBuf;
use std::time::Duration;

use axum_server::Handle;
use axum_server::tls_rustls::RustlsConfig;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::{KbuError, Result};
use storage::Storage;
use tls::TlsMaterial;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub listen_addr: SocketAddr,
    /// Directory holding `docker/registry/v2`.
    pub root_dir: PathBuf,
    /// Certificate and key files; a self-signed pair is generated when absent.
    pub tls_files: Option<(PathBuf, PathBuf)>,
}

pub struct RegistryServer {
    config: RegistryConfig,
    tls: TlsMaterial,
    running: Option<Running>,
}

struct Running {
    addr: SocketAddr,
    handle: Handle,
    task: JoinHandle<std::io::Result<()>>,
}

impl RegistryServer {
    /// Validate the configuration and prepare TLS material. Nothing listens yet.
    pub fn build(config: RegistryConfig) -> Result<Self> {
        let mut errors = Vec::new();
        if config.root_dir.as_os_str().is_empty() {
            errors.push("registry root directory is required".to_string());
        } else if !config.root_dir.is_dir() {
            errors.push(format!(
                "registry root directory {} does not exist",
                config.root_dir.display()
            ));
        }
        if !errors.is_empty() {
            return Err(KbuError::Configuration(errors));
        }

        let tls = match &config.tls_files {
            Some((cert, key)) => TlsMaterial::from_files(cert, key),
            None => TlsMaterial::self_signed(&config.listen_addr.ip().to_string())?,
        };
        Ok(Self {
            config,
            tls,
            running: None,
        })
    }

    /// Bind and start serving in the background, returning the bound address.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        if let Some(running) = &self.running {
            return Ok(running.addr);
        }
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
        let rustls = RustlsConfig::from_pem_file(&self.tls.cert_path, &self.tls.key_path)
            .await
            .map_err(|e| KbuError::Tls(format!("Failed to load certificate: {e}")))?;

        let listen = self.config.listen_addr;
        let listener =
            TcpListener::bind(listen).map_err(|e| KbuError::io(format!("bind {listen}"), e))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| KbuError::io(format!("bind {listen}"), e))?;
        let addr = listener
            .local_addr()
            .map_err(|e| KbuError::io(format!("bind {listen}"), e))?;

        let app = handlers::router(Storage::new(&self.config.root_dir));
        let handle = Handle::new();
        let server = axum_server::from_tcp_rustls(listener, rustls).handle(handle.clone());
        let task = tokio::spawn(async move { server.serve(app.into_make_service()).await });

        info!(%addr, root = %self.config.root_dir.display(), "Registry listening");
        self.running = Some(Running { addr, handle, task });
        Ok(addr)
    }

    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.addr)
    }

    /// Shut down and remove generated TLS material. Never touches the root directory.
    pub async fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            running.handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
            match running.task.await {
                Ok(Ok(())) => info!(addr = %running.addr, "Registry stopped"),
                Ok(Err(e)) => warn!("Registry server error: {}", e),
                Err(e) => warn!("Registry server task failed: {}", e),
            }
        }
        if let Err(e) = self.tls.cleanup() {
            warn!("Failed to remove registry TLS material: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::storage::fixture;

    fn config(root: &std::path::Path) -> RegistryConfig {
        RegistryConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            root_dir: root.to_path_buf(),
            tls_files: None,
        }
    }

    #[test]
    fn test_build_rejects_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        let err = RegistryServer::build(config(&dir.path().join("absent"))).err().unwrap();
        assert!(matches!(err, KbuError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_serves_over_tls_and_stops_cleanly() {
        let root = tempfile::tempdir().unwrap();
        let (manifest, _) = fixture::image(root.path(), "ocp/release", "4.16.3", b"layer");

        let mut server = RegistryServer::build(config(root.path())).unwrap();
        let cert_dir = server.tls.cert_path.parent().unwrap().to_path_buf();
        let addr = server.start().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(server.listen_addr(), Some(addr));

        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .unwrap();
        let response = client
            .get(format!("https://{addr}/v2/ocp/release/manifests/4.16.3"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(
            response.headers()["docker-content-digest"].to_str().unwrap(),
            manifest
        );

        server.stop().await;
        assert_eq!(server.listen_addr(), None);
        assert!(!cert_dir.exists());
        assert!(root.path().join("docker/registry/v2").exists());
    }
}
