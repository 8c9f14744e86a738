//! OCI collaborators: registry transport and manifest sources.
//!
//! - [`RegistryTransport`] copies images between registries
//! - [`RegistryManifestSource`] resolves manifests from a registry
//! - [`OciLayoutManifestSource`] resolves manifests from an on-disk layout

pub mod layout;
pub mod registry;

pub use layout::OciLayoutManifestSource;
pub use registry::{RegistryAuth, RegistryManifestSource, RegistryTransport};

use a3s_mirror_core::error::{MirrorError, Result};
use a3s_mirror_core::reference::{split_transport, Transport};
use async_trait::async_trait;

use crate::transport::{FetchedManifest, ManifestSource};

/// Picks the manifest source matching the transport of each reference.
pub struct RoutedManifestSource {
    registry: RegistryManifestSource,
    layout: OciLayoutManifestSource,
}

impl RoutedManifestSource {
    pub fn new(registry: RegistryManifestSource) -> Self {
        Self {
            registry,
            layout: OciLayoutManifestSource::new(),
        }
    }
}

#[async_trait]
impl ManifestSource for RoutedManifestSource {
    async fn fetch_manifest(&self, reference: &str) -> Result<FetchedManifest> {
        match split_transport(reference).0 {
            Transport::Docker => self.registry.fetch_manifest(reference).await,
            Transport::Oci => self.layout.fetch_manifest(reference).await,
            Transport::Dir => Err(MirrorError::Unsupported(format!(
                "cannot read manifests from directory reference {}",
                reference
            ))),
        }
    }
}
