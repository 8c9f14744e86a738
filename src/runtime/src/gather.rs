//! Blob gathering: every digest an image needs in an archive.
//!
//! For a reference the gatherer collects the manifest digest, the config
//! and layer digests and, unless signatures are removed, the manifest,
//! config and layers of each attached signature. Multi-arch indexes are
//! expanded into their instances.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use a3s_mirror_core::error::{MirrorError, Result};
use oci_distribution::manifest::{OciImageManifest, OciManifest};

use crate::transport::{reference_at_digest, reference_at_tag, ManifestSource, SignatureResolver};

/// Ordered set of content digests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentDigestSet {
    digests: BTreeSet<String>,
}

impl ContentDigestSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a digest; returns false if it was already present.
    pub fn insert(&mut self, digest: impl Into<String>) -> bool {
        self.digests.insert(digest.into())
    }

    pub fn contains(&self, digest: &str) -> bool {
        self.digests.contains(digest)
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.digests.iter()
    }

    pub fn len(&self) -> usize {
        self.digests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.digests.is_empty()
    }
}

impl FromIterator<String> for ContentDigestSet {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Self {
            digests: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for ContentDigestSet {
    type Item = String;
    type IntoIter = std::collections::btree_set::IntoIter<String>;

    fn into_iter(self) -> Self::IntoIter {
        self.digests.into_iter()
    }
}

/// Why a signature could not be gathered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureFailureKind {
    /// The signature tag does not exist
    TagNotFound,
    /// The signature could not be resolved or fetched
    Unreachable,
}

/// A tolerated signature failure for one image instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureFailure {
    pub reference: String,
    pub kind: SignatureFailureKind,
    pub message: String,
}

impl fmt::Display for SignatureFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            SignatureFailureKind::TagNotFound => "signature tag not found",
            SignatureFailureKind::Unreachable => "signature unreachable",
        };
        write!(f, "{} for {}: {}", kind, self.reference, self.message)
    }
}

/// Result of gathering one reference.
#[derive(Debug, Clone, Default)]
pub struct GatheredBlobs {
    pub digests: ContentDigestSet,
    pub signature_failures: Vec<SignatureFailure>,
}

/// Collects the content digests behind image references.
pub struct BlobGatherer {
    manifests: Arc<dyn ManifestSource>,
    signatures: Arc<dyn SignatureResolver>,
    remove_signatures: bool,
}

impl BlobGatherer {
    pub fn new(
        manifests: Arc<dyn ManifestSource>,
        signatures: Arc<dyn SignatureResolver>,
        remove_signatures: bool,
    ) -> Self {
        Self {
            manifests,
            signatures,
            remove_signatures,
        }
    }

    /// Gather every digest needed to reproduce `reference`.
    ///
    /// Signature failures are returned alongside the digests; any other
    /// failure is an error.
    pub async fn gather(&self, reference: &str) -> Result<GatheredBlobs> {
        let mut gathered = GatheredBlobs::default();
        let fetched = self.manifests.fetch_manifest(reference).await?;
        gathered.digests.insert(fetched.digest.clone());

        match fetched.manifest {
            OciManifest::Image(manifest) => {
                add_image_blobs(&mut gathered.digests, &manifest);
                let pinned = reference_at_digest(reference, &fetched.digest)?;
                self.gather_signatures(&pinned, &mut gathered).await?;
            }
            OciManifest::ImageIndex(index) => {
                tracing::debug!(
                    reference = %reference,
                    instances = index.manifests.len(),
                    "Expanding multi-arch index"
                );
                let pinned = reference_at_digest(reference, &fetched.digest)?;
                self.gather_signatures(&pinned, &mut gathered).await?;

                for entry in &index.manifests {
                    gathered.digests.insert(entry.digest.clone());
                    let instance = reference_at_digest(reference, &entry.digest)?;
                    let fetched = self.manifests.fetch_manifest(&instance).await?;
                    match fetched.manifest {
                        OciManifest::Image(manifest) => {
                            add_image_blobs(&mut gathered.digests, &manifest)
                        }
                        OciManifest::ImageIndex(_) => {
                            return Err(MirrorError::Other(format!(
                                "nested image index at {}",
                                instance
                            )))
                        }
                    }
                    self.gather_signatures(&instance, &mut gathered).await?;
                }
            }
        }

        Ok(gathered)
    }

    async fn gather_signatures(&self, pinned: &str, gathered: &mut GatheredBlobs) -> Result<()> {
        if self.remove_signatures {
            return Ok(());
        }

        let tags = match self.signatures.resolve_signature_tags(pinned).await {
            Ok(tags) => tags,
            Err(e) => {
                gathered.signature_failures.push(SignatureFailure {
                    reference: pinned.to_string(),
                    kind: SignatureFailureKind::Unreachable,
                    message: e.to_string(),
                });
                return Ok(());
            }
        };

        for tag in tags {
            let signature = reference_at_tag(pinned, &tag)?;
            match self.manifests.fetch_manifest(&signature).await {
                Ok(fetched) => {
                    gathered.digests.insert(fetched.digest);
                    match fetched.manifest {
                        OciManifest::Image(manifest) => {
                            add_image_blobs(&mut gathered.digests, &manifest)
                        }
                        OciManifest::ImageIndex(index) => {
                            for entry in index.manifests {
                                gathered.digests.insert(entry.digest);
                            }
                        }
                    }
                }
                Err(MirrorError::ManifestNotFound(message)) => {
                    tracing::debug!(reference = %pinned, tag = %tag, "Signature tag not found");
                    gathered.signature_failures.push(SignatureFailure {
                        reference: signature,
                        kind: SignatureFailureKind::TagNotFound,
                        message,
                    });
                }
                Err(e) => {
                    tracing::warn!(reference = %pinned, tag = %tag, error = %e, "Signature unreachable");
                    gathered.signature_failures.push(SignatureFailure {
                        reference: signature,
                        kind: SignatureFailureKind::Unreachable,
                        message: e.to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

fn add_image_blobs(digests: &mut ContentDigestSet, manifest: &OciImageManifest) {
    digests.insert(manifest.config.digest.clone());
    for layer in &manifest.layers {
        digests.insert(layer.digest.clone());
    }
}
