//! Bundle extraction agent: fetch the bundle locally or from a peer and unpack it.

use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytesize::ByteSize;
use futures::TryStreamExt;
use futures::future::join_all;
use rand::seq::SliceRandom;
use tokio::io::AsyncRead;
use tokio::process::Command;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::progress::{PROGRESS_INTERVAL, Progress, ProgressReader};
use crate::error::{KbuError, Result};
use crate::k8s::NodeStore;
use crate::k8s::node::NodePatch;
use crate::labels::{BUNDLE_METADATA_ANNOTATION, EXTRACTED_LABEL, TRUE};
use crate::metadata::Metadata;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ExtractConfig {
    pub node_name: String,
    /// Bundle file on the local host, preferred over peers when present.
    pub bundle_file: PathBuf,
    /// `host:port` of the transfer service, resolving to every peer.
    pub peer_address: String,
    pub extract_dir: PathBuf,
    pub retry_interval: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractOutcome {
    AlreadyExtracted,
    Extracted(Metadata),
}

enum Source {
    Local(PathBuf),
    Peer(SocketAddr),
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(path) => write!(f, "{}", path.display()),
            Self::Peer(addr) => write!(f, "peer {addr}"),
        }
    }
}

type BundleStream = Box<dyn AsyncRead + Send + Unpin>;

pub struct ExtractAgent<S> {
    config: ExtractConfig,
    store: Arc<S>,
    progress: Progress<S>,
    http: reqwest::Client,
}

impl<S: NodeStore + 'static> ExtractAgent<S> {
    pub fn new(config: ExtractConfig, store: Arc<S>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| KbuError::Http("client".to_string(), e.to_string()))?;
        let progress = Progress::new(Arc::clone(&store), &config.node_name);
        Ok(Self {
            config,
            store,
            progress,
            http,
        })
    }

    pub async fn run(&self, cancel: &CancellationToken) -> Result<ExtractOutcome> {
        let target = &self.config.extract_dir;
        if tokio::fs::try_exists(target)
            .await
            .map_err(|e| KbuError::io(target.display().to_string(), e))?
        {
            info!(dir = %target.display(), "Bundle already extracted");
            return Ok(ExtractOutcome::AlreadyExtracted);
        }

        let (source, stream) = self.acquire(cancel).await?;
        info!(%source, dir = %target.display(), "Extracting bundle");
        self.progress
            .report(&format!("Extracting bundle from {source}"))
            .await;

        let bytes = Arc::new(AtomicU64::new(0));
        let ticker = self
            .progress
            .watch("Extracting bundle", Arc::clone(&bytes), PROGRESS_INTERVAL);
        let result = extract_archive(
            ProgressReader::new(stream, Arc::clone(&bytes)),
            target,
            cancel,
        )
        .await;
        ticker.abort();

        let read = ByteSize::b(bytes.load(Ordering::Relaxed));
        match &result {
            Ok(()) => {
                self.progress
                    .report(&format!("Extracted bundle ({read})"))
                    .await;
            }
            Err(e) => {
                self.progress
                    .report(&format!("Bundle extraction failed after {read}: {e}"))
                    .await;
            }
        }
        result?;

        let metadata = Metadata::read_from_dir(target).await?;
        self.record(&metadata).await?;
        info!(version = %metadata.version, images = metadata.images.len(), "Bundle extracted");
        Ok(ExtractOutcome::Extracted(metadata))
    }

    /// Mark the node extracted and record the bundle metadata without its image list.
    async fn record(&self, metadata: &Metadata) -> Result<()> {
        let node = &self.config.node_name;
        self.store.get_node(node).await?;
        let patch = NodePatch::default()
            .label(EXTRACTED_LABEL, TRUE)
            .annotation(BUNDLE_METADATA_ANNOTATION, metadata.without_images().to_json()?);
        self.store.patch_node(node, &patch).await
    }

    /// Wait until some bundle source is available. Only cancellation ends the wait.
    async fn acquire(&self, cancel: &CancellationToken) -> Result<(Source, BundleStream)> {
        loop {
            if let Some(found) = self.open_source().await {
                return Ok(found);
            }
            info!(
                retry_in = ?self.config.retry_interval,
                "No bundle source available, waiting"
            );
            tokio::select! {
                () = cancel.cancelled() => return Err(KbuError::Cancelled),
                () = tokio::time::sleep(self.config.retry_interval) => {}
            }
        }
    }

    async fn open_source(&self) -> Option<(Source, BundleStream)> {
        let path = &self.config.bundle_file;
        match tokio::fs::File::open(path).await {
            Ok(file) => {
                let stream: BundleStream = Box::new(file);
                return Some((Source::Local(path.clone()), stream));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No local bundle file");
            }
            Err(e) => warn!(path = %path.display(), "Failed to open local bundle file: {}", e),
        }

        let peers = self.available_peers().await;
        let addr = *peers.choose(&mut rand::thread_rng())?;
        match self.http.get(format!("http://{addr}/")).send().await {
            Ok(response) if response.status().is_success() => {
                let body = response.bytes_stream().map_err(std::io::Error::other);
                let stream: BundleStream = Box::new(StreamReader::new(body));
                Some((Source::Peer(addr), stream))
            }
            Ok(response) => {
                warn!(peer = %addr, status = %response.status(), "Peer refused bundle download");
                None
            }
            Err(e) => {
                warn!(peer = %addr, "Failed to download bundle from peer: {}", e);
                None
            }
        }
    }

    /// Peers answering 200 to a HEAD request.
    async fn available_peers(&self) -> Vec<SocketAddr> {
        let addrs: Vec<SocketAddr> = match tokio::net::lookup_host(&self.config.peer_address).await {
            Ok(addrs) => addrs.collect(),
            Err(e) => {
                warn!(peer_address = %self.config.peer_address, "Failed to resolve peers: {}", e);
                return Vec::new();
            }
        };
        let probes = addrs.iter().map(|addr| async move {
            let response = self
                .http
                .head(format!("http://{addr}/"))
                .timeout(PROBE_TIMEOUT)
                .send()
                .await;
            match response {
                Ok(r) if r.status() == reqwest::StatusCode::OK => Some(*addr),
                Ok(r) => {
                    debug!(peer = %addr, status = %r.status(), "Peer has no bundle");
                    None
                }
                Err(e) => {
                    debug!(peer = %addr, "Peer unreachable: {}", e);
                    None
                }
            }
        });
        let available: Vec<SocketAddr> = join_all(probes).await.into_iter().flatten().collect();
        debug!(resolved = addrs.len(), available = available.len(), "Probed peers");
        available
    }
}

/// Unpack a tar stream into `target` through a sibling staging directory.
///
/// `target` only appears once `tar` succeeded. On failure the staging
/// directory is left in place for inspection.
pub async fn extract_archive<R>(mut reader: R, target: &Path, cancel: &CancellationToken) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let parent = target
        .parent()
        .ok_or_else(|| KbuError::Extraction(format!("{} has no parent", target.display())))?;
    let name = target
        .file_name()
        .ok_or_else(|| KbuError::Extraction(format!("{} has no file name", target.display())))?
        .to_string_lossy();
    tokio::fs::create_dir_all(parent)
        .await
        .map_err(|e| KbuError::io(parent.display().to_string(), e))?;
    let staging = tempfile::Builder::new()
        .prefix(&format!(".{name}-"))
        .tempdir_in(parent)
        .map_err(|e| KbuError::io(parent.display().to_string(), e))?
        .keep();
    debug!(staging = %staging.display(), "Created staging directory");

    let mut child = Command::new("tar")
        .args(["-x", "-f", "-"])
        .current_dir(&staging)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| KbuError::io("tar", e))?;
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| KbuError::Extraction("tar stdin unavailable".to_string()))?;

    let feed = async move {
        let copied = tokio::io::copy(&mut reader, &mut stdin).await;
        drop(stdin);
        copied
    };
    let (fed, output) = tokio::select! {
        () = cancel.cancelled() => return Err(KbuError::Cancelled),
        done = async { tokio::join!(feed, child.wait_with_output()) } => done,
    };
    let output = output.map_err(|e| KbuError::io("tar", e))?;
    if !output.status.success() {
        return Err(KbuError::Extraction(format!(
            "tar exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    let copied = fed.map_err(|e| KbuError::io("bundle stream", e))?;

    tokio::fs::rename(&staging, target)
        .await
        .map_err(|e| KbuError::io(target.display().to_string(), e))?;
    debug!(bytes = copied, dir = %target.display(), "Bundle unpacked");
    Ok(())
}
