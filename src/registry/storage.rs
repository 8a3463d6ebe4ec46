//! Read-only view of a distribution-style registry filesystem.
//!
//! Layout under `<root>/docker/registry/v2`:
//!
//! ```text
//! blobs/sha256/<xx>/<hex>/data
//! repositories/<name>/_manifests/tags/<tag>/current/link
//! repositories/<name>/_manifests/revisions/sha256/<hex>/link
//! repositories/<name>/_layers/sha256/<hex>/link
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{KbuError, Result};

const MANIFESTS_DIR: &str = "_manifests";
const LAYERS_DIR: &str = "_layers";

/// A content digest, `sha256:<hex>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Digest {
    algorithm: String,
    hex: String,
}

impl Digest {
    pub fn parse(input: &str) -> Option<Self> {
        let (algorithm, hex) = input.trim().split_once(':')?;
        let valid_algorithm = !algorithm.is_empty()
            && algorithm
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "+._-".contains(c));
        let valid_hex = hex.len() >= 2 && hex.chars().all(|c| c.is_ascii_hexdigit());
        (valid_algorithm && valid_hex).then(|| Self {
            algorithm: algorithm.to_string(),
            hex: hex.to_ascii_lowercase(),
        })
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

/// Repository names are slash-separated lowercase components.
pub fn valid_repository(name: &str) -> bool {
    !name.is_empty()
        && name.split('/').all(|component| {
            !component.is_empty()
                && component != "."
                && component != ".."
                && !component.starts_with('_')
                && component
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "._-".contains(c))
        })
}

pub fn valid_tag(tag: &str) -> bool {
    !tag.is_empty()
        && tag.len() <= 128
        && !tag.starts_with(['.', '-'])
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "._-".contains(c))
}

#[derive(Debug, Clone)]
pub struct Storage {
    v2: PathBuf,
}

impl Storage {
    pub fn new(root: &Path) -> Self {
        Self {
            v2: root.join("docker/registry/v2"),
        }
    }

    fn repository_dir(&self, name: &str) -> PathBuf {
        self.v2.join("repositories").join(name)
    }

    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.v2
            .join("blobs")
            .join(&digest.algorithm)
            .join(&digest.hex[..2])
            .join(&digest.hex)
            .join("data")
    }

    fn revision_link(&self, name: &str, digest: &Digest) -> PathBuf {
        self.repository_dir(name)
            .join(MANIFESTS_DIR)
            .join("revisions")
            .join(&digest.algorithm)
            .join(&digest.hex)
            .join("link")
    }

    fn layer_link(&self, name: &str, digest: &Digest) -> PathBuf {
        self.repository_dir(name)
            .join(LAYERS_DIR)
            .join(&digest.algorithm)
            .join(&digest.hex)
            .join("link")
    }

    /// Digest a tag or digest reference resolves to within a repository.
    pub async fn resolve_manifest(&self, name: &str, reference: &str) -> Result<Option<Digest>> {
        if let Some(digest) = Digest::parse(reference) {
            return Ok(exists(&self.revision_link(name, &digest)).await.then_some(digest));
        }
        if !valid_tag(reference) {
            return Ok(None);
        }
        let link = self
            .repository_dir(name)
            .join(MANIFESTS_DIR)
            .join("tags")
            .join(reference)
            .join("current/link");
        read_link(&link).await
    }

    /// Whether the repository references the blob as a layer or a manifest.
    pub async fn has_blob(&self, name: &str, digest: &Digest) -> bool {
        exists(&self.layer_link(name, digest)).await
            || exists(&self.revision_link(name, digest)).await
    }

    /// Tags of a repository, sorted; `None` when the repository is unknown.
    pub async fn tags(&self, name: &str) -> Result<Option<Vec<String>>> {
        let dir = self.repository_dir(name).join(MANIFESTS_DIR);
        if !exists(&dir).await {
            return Ok(None);
        }
        let mut tags = list_dirs(&dir.join("tags")).await?;
        tags.sort();
        Ok(Some(tags))
    }

    /// Repository names, sorted, at most `limit` of them.
    pub async fn repositories(&self, limit: usize) -> Result<Vec<String>> {
        let root = self.v2.join("repositories");
        let mut found = Vec::new();
        let mut pending = vec![String::new()];
        while let Some(prefix) = pending.pop() {
            let dir = if prefix.is_empty() {
                root.clone()
            } else {
                root.join(&prefix)
            };
            for entry in list_dirs(&dir).await? {
                if entry.starts_with('_') {
                    continue;
                }
                let name = if prefix.is_empty() {
                    entry
                } else {
                    format!("{prefix}/{entry}")
                };
                if exists(&root.join(&name).join(MANIFESTS_DIR)).await {
                    found.push(name.clone());
                }
                pending.push(name);
            }
        }
        found.sort();
        found.truncate(limit);
        Ok(found)
    }
}

async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

async fn read_link(path: &Path) -> Result<Option<Digest>> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => Digest::parse(&contents)
            .map(Some)
            .ok_or_else(|| KbuError::Registry(format!("malformed link {}", path.display()))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(KbuError::io(path.display().to_string(), e)),
    }
}

async fn list_dirs(dir: &Path) -> Result<Vec<String>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(KbuError::io(dir.display().to_string(), e)),
    };
    let mut names = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| KbuError::io(dir.display().to_string(), e))?
    {
        let is_dir = entry.file_type().await.is_ok_and(|t| t.is_dir());
        if is_dir && let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    Ok(names)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_parse() {
        let d = Digest::parse("sha256:ABCdef01").unwrap();
        assert_eq!(d.to_string(), "sha256:abcdef01");
        assert!(Digest::parse("sha256:").is_none());
        assert!(Digest::parse("latest").is_none());
        assert!(Digest::parse("sha256:../../etc").is_none());
    }

    #[test]
    fn test_repository_and_tag_validation() {
        assert!(valid_repository("openshift/release"));
        assert!(valid_repository("a.b/c-d/e_f"));
        assert!(!valid_repository("../etc"));
        assert!(!valid_repository("a//b"));
        assert!(!valid_repository("a/_manifests"));
        assert!(!valid_repository("Upper"));
        assert!(valid_tag("v4.16.3"));
        assert!(!valid_tag(".."));
        assert!(!valid_tag("a/b"));
    }

    #[tokio::test]
    async fn test_resolve_tag_and_digest() {
        let root = tempfile::tempdir().unwrap();
        let (manifest, layer) = fixture::image(root.path(), "ocp/release", "4.16.3", b"layer");
        let storage = Storage::new(root.path());

        let by_tag = storage.resolve_manifest("ocp/release", "4.16.3").await.unwrap();
        assert_eq!(by_tag.unwrap().to_string(), manifest);

        let by_digest = storage.resolve_manifest("ocp/release", &manifest).await.unwrap();
        assert_eq!(by_digest.unwrap().to_string(), manifest);

        // A layer digest is not a manifest of the repository.
        assert!(storage.resolve_manifest("ocp/release", &layer).await.unwrap().is_none());
        assert!(storage.resolve_manifest("ocp/release", "missing").await.unwrap().is_none());
        assert!(storage.resolve_manifest("other", "4.16.3").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_has_blob_is_scoped_to_repository() {
        let root = tempfile::tempdir().unwrap();
        let (_, layer) = fixture::image(root.path(), "a/b", "1", b"layer-a");
        fixture::image(root.path(), "c/d", "1", b"layer-c");
        let storage = Storage::new(root.path());
        let layer = Digest::parse(&layer).unwrap();

        assert!(storage.has_blob("a/b", &layer).await);
        assert!(!storage.has_blob("c/d", &layer).await);
        assert!(storage.blob_path(&layer).exists());
    }

    #[tokio::test]
    async fn test_catalog_and_tags() {
        let root = tempfile::tempdir().unwrap();
        fixture::image(root.path(), "ocp/release", "4.16.3", b"1");
        fixture::image(root.path(), "ocp/release", "4.16.4", b"2");
        fixture::image(root.path(), "library/busybox", "1.36", b"3");
        let storage = Storage::new(root.path());

        assert_eq!(
            storage.repositories(100).await.unwrap(),
            vec!["library/busybox", "ocp/release"]
        );
        assert_eq!(storage.repositories(1).await.unwrap(), vec!["library/busybox"]);
        assert_eq!(
            storage.tags("ocp/release").await.unwrap(),
            Some(vec!["4.16.3".to_string(), "4.16.4".to_string()])
        );
        assert_eq!(storage.tags("unknown").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_empty_root() {
        let root = tempfile::tempdir().unwrap();
        let storage = Storage::new(root.path());
        assert!(storage.repositories(100).await.unwrap().is_empty());
    }
}
