//! Rendering and writing of the runtime drop-in configuration files.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;

use crate::error::{KbuError, Result};
use crate::reference::ImageReference;

#[derive(Serialize)]
struct PinConfig {
    crio: CrioTable,
}

#[derive(Serialize)]
struct CrioTable {
    image: CrioImageTable,
}

#[derive(Serialize)]
struct CrioImageTable {
    pinned_images: Vec<String>,
}

#[derive(Serialize)]
struct MirrorConfig {
    registry: Vec<RegistryEntry>,
}

#[derive(Serialize)]
struct RegistryEntry {
    location: String,
    mirror: Vec<MirrorEntry>,
}

#[derive(Serialize)]
struct MirrorEntry {
    location: String,
    insecure: bool,
}

/// `[crio.image] pinned_images`, one reference per line, sorted and deduplicated.
pub fn render_pin_config(references: &[String]) -> Result<String> {
    let mut pinned: Vec<String> = references.to_vec();
    pinned.sort();
    pinned.dedup();
    let config = PinConfig {
        crio: CrioTable {
            image: CrioImageTable {
                pinned_images: pinned,
            },
        },
    };
    toml::to_string_pretty(&config).map_err(|e| KbuError::Registry(e.to_string()))
}

/// One `[[registry]]` per distinct repository, mirrored to `mirror` under the same path.
pub fn render_mirror_config(mirror: &str, references: &[String]) -> Result<String> {
    let mut repositories = BTreeMap::new();
    for reference in references {
        let parsed = ImageReference::parse(reference)?;
        repositories.insert(parsed.repository(), format!("{mirror}/{}", parsed.path));
    }
    let config = MirrorConfig {
        registry: repositories
            .into_iter()
            .map(|(location, mirror_location)| RegistryEntry {
                location,
                mirror: vec![MirrorEntry {
                    location: mirror_location,
                    insecure: true,
                }],
            })
            .collect(),
    };
    toml::to_string_pretty(&config).map_err(|e| KbuError::Registry(e.to_string()))
}

/// Write through a temporary sibling and rename, so readers never see a partial file.
pub async fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let display = path.display().to_string();
    let parent = path
        .parent()
        .ok_or_else(|| KbuError::io(&display, std::io::Error::other("path has no parent")))?;
    tokio::fs::create_dir_all(parent)
        .await
        .map_err(|e| KbuError::io(parent.display().to_string(), e))?;

    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, contents)
        .await
        .map_err(|e| KbuError::io(tmp.display().to_string(), e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| KbuError::io(&display, e))
}

pub async fn remove_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(KbuError::io(path.display().to_string(), e)),
    }
}
