//! Node progress reporting for the per-node agents.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use bytesize::ByteSize;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::k8s::NodeStore;
use crate::k8s::node::NodePatch;

/// Minimum spacing between byte-count updates while streaming.
pub const PROGRESS_INTERVAL: Duration = Duration::from_secs(60);

/// Writes the progress annotation of one node. Failures are logged, never returned.
pub struct Progress<S> {
    store: Arc<S>,
    node: String,
}

impl<S: NodeStore + 'static> Progress<S> {
    pub fn new(store: Arc<S>, node: &str) -> Self {
        Self {
            store,
            node: node.to_string(),
        }
    }

    pub async fn report(&self, message: &str) {
        report(self.store.as_ref(), &self.node, message).await;
    }

    /// Report `<label>: <bytes> read` every `interval` until the handle is aborted.
    pub fn watch(&self, label: &str, bytes: Arc<AtomicU64>, interval: Duration) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let node = self.node.clone();
        let label = label.to_string();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let read = ByteSize::b(bytes.load(Ordering::Relaxed));
                report(store.as_ref(), &node, &format!("{label}: {read} read")).await;
            }
        })
    }
}

async fn report<S: NodeStore + ?Sized>(store: &S, node: &str, message: &str) {
    debug!(%node, progress = %message, "Reporting progress");
    if let Err(e) = store.patch_node(node, &NodePatch::progress(message)).await {
        warn!(%node, "Failed to update progress annotation: {}", e);
    }
}

/// Counts bytes read through the inner reader.
pub struct ProgressReader<R> {
    inner: R,
    bytes: Arc<AtomicU64>,
}

impl<R> ProgressReader<R> {
    pub fn new(inner: R, bytes: Arc<AtomicU64>) -> Self {
        Self { inner, bytes }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ProgressReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            let read = (buf.filled().len() - before) as u64;
            this.bytes.fetch_add(read, Ordering::Relaxed);
        }
        poll
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::fake::FakeStore;
    use crate::k8s::node::test_node;
    use crate::k8s::target::UpgradeTarget;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_reader_counts_bytes() {
        let bytes = Arc::new(AtomicU64::new(0));
        let mut reader = ProgressReader::new(&b"0123456789"[..], Arc::clone(&bytes));
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out.len(), 10);
        assert_eq!(bytes.load(Ordering::Relaxed), 10);
    }

    #[tokio::test]
    async fn test_report_swallows_patch_failures() {
        let store = Arc::new(FakeStore {
            fail_patches: true,
            ..FakeStore::new(UpgradeTarget::default(), vec![test_node("a", &[], &[])])
        });
        Progress::new(Arc::clone(&store), "a").report("Extracting").await;
        assert!(store.mutations().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_reports_once_per_interval() {
        let store = Arc::new(FakeStore::new(
            UpgradeTarget::default(),
            vec![test_node("a", &[], &[])],
        ));
        let progress = Progress::new(Arc::clone(&store), "a");
        let bytes = Arc::new(AtomicU64::new(2048));
        let handle = progress.watch("Extracting bundle", bytes, PROGRESS_INTERVAL);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(store.progress_of("a").is_empty());
        tokio::time::sleep(Duration::from_secs(31)).await;
        handle.abort();

        let reports = store.progress_of("a");
        assert_eq!(reports.len(), 1);
        assert!(reports[0].starts_with("Extracting bundle: "));
    }
}
