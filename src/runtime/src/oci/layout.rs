//! Manifest source backed by an on-disk OCI image layout.
//!
//! ```text
//! layout/
//! ├── oci-layout
//! ├── index.json
//! └── blobs/
//!     └── sha256/<hex>
//! ```
//!
//! References look like `oci:///path/to/layout[:tag|@digest]`. Without a
//! tag or digest the first manifest of `index.json` is used.

use std::path::{Path, PathBuf};

use a3s_mirror_core::error::{MirrorError, Result};
use a3s_mirror_core::reference::{split_digest, split_transport};
use async_trait::async_trait;
use oci_distribution::manifest::{OciImageIndex, OciImageManifest, OciManifest};

use crate::transport::{split_layout_reference, FetchedManifest, Locator, ManifestSource};

/// Annotation holding the tag of a manifest listed in `index.json`.
const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

/// Resolves manifests from OCI image layouts on the local filesystem.
#[derive(Debug, Clone, Default)]
pub struct OciLayoutManifestSource;

impl OciLayoutManifestSource {
    pub fn new() -> Self {
        Self
    }

    fn resolve(&self, root: &Path, locator: Option<Locator<'_>>) -> Result<FetchedManifest> {
        let digest = match locator {
            Some(Locator::Digest(digest)) => digest.to_string(),
            Some(Locator::Tag(tag)) => {
                let index = load_index(root)?;
                index
                    .manifests
                    .iter()
                    .find(|entry| {
                        entry
                            .annotations
                            .as_ref()
                            .and_then(|a| a.get(REF_NAME_ANNOTATION))
                            .map_or(false, |name| name == tag)
                    })
                    .map(|entry| entry.digest.clone())
                    .ok_or_else(|| {
                        MirrorError::ManifestNotFound(format!("{}:{}", root.display(), tag))
                    })?
            }
            None => {
                let index = load_index(root)?;
                index
                    .manifests
                    .first()
                    .map(|entry| entry.digest.clone())
                    .ok_or_else(|| {
                        MirrorError::ManifestNotFound(format!(
                            "{} (empty index.json)",
                            root.display()
                        ))
                    })?
            }
        };

        let path = blob_path(root, &digest)?;
        if !path.exists() {
            return Err(MirrorError::ManifestNotFound(format!(
                "{}@{}",
                root.display(),
                digest
            )));
        }
        let data = std::fs::read(&path)?;
        let manifest = parse_manifest(&data)?;
        Ok(FetchedManifest { digest, manifest })
    }
}

#[async_trait]
impl ManifestSource for OciLayoutManifestSource {
    async fn fetch_manifest(&self, reference: &str) -> Result<FetchedManifest> {
        let (_, rest) = split_transport(reference);
        let (path, locator) = split_layout_reference(rest);
        let root = PathBuf::from(path);
        if !root.join("index.json").exists() {
            return Err(MirrorError::ManifestNotFound(format!(
                "{} is not an OCI image layout",
                root.display()
            )));
        }
        self.resolve(&root, locator)
    }
}

fn load_index(root: &Path) -> Result<OciImageIndex> {
    let content = std::fs::read(root.join("index.json"))?;
    Ok(serde_json::from_slice(&content)?)
}

/// Path of a blob inside a layout: `blobs/<algorithm>/<hex>`.
pub fn blob_path(root: &Path, digest: &str) -> Result<PathBuf> {
    let (algorithm, encoded) = split_digest(digest)?;
    Ok(root.join("blobs").join(algorithm).join(encoded))
}

/// Decode manifest bytes as either an image index or an image manifest.
fn parse_manifest(data: &[u8]) -> Result<OciManifest> {
    let value: serde_json::Value = serde_json::from_slice(data)?;
    if value.get("manifests").is_some() {
        let index: OciImageIndex = serde_json::from_value(value)?;
        Ok(OciManifest::ImageIndex(index))
    } else {
        let manifest: OciImageManifest = serde_json::from_value(value)?;
        Ok(OciManifest::Image(manifest))
    }
}
