//! Bundle metadata descriptor (`metadata.json`).

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{KbuError, Result};

/// File name of the descriptor at the root of every bundle.
pub const METADATA_FILE: &str = "metadata.json";

/// Content descriptor of a bundle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub version: String,
    pub architecture: String,
    /// Release image reference the cluster upgrades to.
    pub release: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
}

impl Metadata {
    /// Copy of this metadata without the image list, as recorded on nodes.
    pub fn without_images(&self) -> Self {
        Self {
            images: Vec::new(),
            ..self.clone()
        }
    }

    pub fn from_json(data: &str) -> Result<Self> {
        serde_json::from_str(data).map_err(|e| KbuError::Metadata(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| KbuError::Metadata(e.to_string()))
    }

    /// Read `metadata.json` from an extracted bundle directory.
    pub async fn read_from_dir(dir: &Path) -> Result<Self> {
        let path = dir.join(METADATA_FILE);
        let data = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| KbuError::io(path.display().to_string(), e))?;
        Self::from_json(&data)
    }
}
