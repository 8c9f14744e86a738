//! Registry-backed collaborators.
//!
//! Uses the `oci-distribution` crate to copy images between container
//! registries and to resolve manifests for blob gathering.

use a3s_mirror_core::error::{MirrorError, Result};
use a3s_mirror_core::reference::{signature_tag, ImageReference};
use async_trait::async_trait;
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::errors::OciDistributionError;
use oci_distribution::manifest::{
    OciImageIndex, OciImageManifest, OciManifest, IMAGE_MANIFEST_LIST_MEDIA_TYPE,
    IMAGE_MANIFEST_MEDIA_TYPE, OCI_IMAGE_INDEX_MEDIA_TYPE, OCI_IMAGE_MEDIA_TYPE,
};
use oci_distribution::secrets::RegistryAuth as OciRegistryAuth;
use oci_distribution::{Client, Reference, RegistryOperation};

use crate::transport::{
    FetchedManifest, ImageTransport, ManifestSource, TransferMode, TransferOptions,
};

/// Authentication credentials for a container registry.
#[derive(Debug, Clone)]
pub struct RegistryAuth {
    username: Option<String>,
    password: Option<String>,
}

impl RegistryAuth {
    /// Create anonymous authentication (no credentials).
    pub fn anonymous() -> Self {
        Self {
            username: None,
            password: None,
        }
    }

    /// Create basic authentication with username and password.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// Create authentication from `REGISTRY_USERNAME` / `REGISTRY_PASSWORD`.
    ///
    /// Falls back to anonymous if either is unset.
    pub fn from_env() -> Self {
        match (
            std::env::var("REGISTRY_USERNAME").ok(),
            std::env::var("REGISTRY_PASSWORD").ok(),
        ) {
            (Some(username), Some(password)) => Self::basic(username, password),
            _ => Self::anonymous(),
        }
    }

    fn to_oci_auth(&self) -> OciRegistryAuth {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => OciRegistryAuth::Basic(u.clone(), p.clone()),
            _ => OciRegistryAuth::Anonymous,
        }
    }
}

/// Manifest media types accepted when copying.
const MANIFEST_MEDIA_TYPES: &[&str] = &[
    IMAGE_MANIFEST_MEDIA_TYPE,
    IMAGE_MANIFEST_LIST_MEDIA_TYPE,
    OCI_IMAGE_MEDIA_TYPE,
    OCI_IMAGE_INDEX_MEDIA_TYPE,
];

/// Registry clients for verified and unverified TLS endpoints.
struct RegistryClients {
    secure: Client,
    insecure: Client,
}

impl RegistryClients {
    fn new() -> Self {
        let secure = Client::new(ClientConfig {
            protocol: ClientProtocol::Https,
            ..Default::default()
        });
        // Local cache registries usually listen on plain HTTP.
        let insecure = Client::new(ClientConfig {
            protocol: ClientProtocol::Http,
            accept_invalid_certificates: true,
            ..Default::default()
        });
        Self { secure, insecure }
    }

    fn get(&self, tls_verify: bool) -> &Client {
        if tls_verify {
            &self.secure
        } else {
            &self.insecure
        }
    }
}

/// A manifest exactly as the source registry served it.
///
/// The bytes are pushed unchanged so the destination keeps the source digest.
#[derive(Debug)]
struct RawManifest {
    body: Vec<u8>,
    digest: String,
    manifest: OciManifest,
}

impl RawManifest {
    fn parse(reference: &ImageReference, body: Vec<u8>, digest: String) -> Result<Self> {
        let manifest = serde_json::from_slice(&body).map_err(|e| MirrorError::Registry {
            registry: reference.registry.clone(),
            message: format!("Unparseable manifest {}: {}", reference, e),
        })?;
        Ok(Self {
            body,
            digest,
            manifest,
        })
    }
}

/// Copies images between registries.
///
/// A tag pointing at an image index is copied with every instance it lists,
/// so multi-architecture images arrive whole. Manifests keep their source
/// digests, and the signature stored under the `<algorithm>-<hex>.sig` tag
/// of the copied digest follows when present.
pub struct RegistryTransport {
    clients: RegistryClients,
    auth: RegistryAuth,
}

impl RegistryTransport {
    pub fn new(auth: RegistryAuth) -> Self {
        Self {
            clients: RegistryClients::new(),
            auth,
        }
    }

    async fn copy(&self, source: &str, destination: &str, options: &TransferOptions) -> Result<()> {
        let src = ImageReference::parse(source)?;
        let dst = ImageReference::parse(destination)?;
        let pull = self.clients.get(options.src_tls_verify);
        let push = self.clients.get(options.dest_tls_verify);
        let auth = self.auth.to_oci_auth();

        tracing::debug!(source = %src, destination = %dst, "Copying image");
        let digest = self.copy_manifest(pull, push, &src, &dst, &auth).await?;

        if options.remove_signatures {
            return Ok(());
        }

        let tag = signature_tag(&digest)?;
        match self
            .copy_manifest(pull, push, &src.with_tag(&tag), &dst.with_tag(&tag), &auth)
            .await
        {
            Ok(_) => {
                tracing::debug!(source = %src, tag = %tag, "Copied signature");
                Ok(())
            }
            Err(MirrorError::ManifestNotFound(_)) => {
                tracing::debug!(source = %src, "Image has no signature");
                Ok(())
            }
            Err(e) => Err(MirrorError::Signature {
                reference: src.with_tag(&tag).full_reference(),
                message: e.to_string(),
            }),
        }
    }

    /// Copy the manifest at `src` and everything it references to `dst`.
    ///
    /// Returns the digest of the copied manifest.
    async fn copy_manifest(
        &self,
        pull: &Client,
        push: &Client,
        src: &ImageReference,
        dst: &ImageReference,
        auth: &OciRegistryAuth,
    ) -> Result<String> {
        let raw = pull_raw(pull, src, auth).await?;
        push.auth(&to_oci_reference(dst)?, auth, RegistryOperation::Push)
            .await
            .map_err(|e| registry_error(dst, "Failed to authenticate", e))?;

        match &raw.manifest {
            OciManifest::Image(image) => copy_blobs(pull, push, src, dst, image).await?,
            OciManifest::ImageIndex(index) => {
                let instances = index_instances(index);
                tracing::debug!(source = %src, instances = instances.len(), "Copying image index");
                for digest in instances {
                    let instance_src = src.with_digest(&digest);
                    let instance_dst = dst.with_digest(&digest);
                    let instance = pull_raw(pull, &instance_src, auth).await?;
                    let OciManifest::Image(image) = &instance.manifest else {
                        return Err(MirrorError::Unsupported(format!(
                            "nested image index {}",
                            instance_src
                        )));
                    };
                    copy_blobs(pull, push, &instance_src, &instance_dst, image).await?;
                    push_raw(push, &instance_dst, &instance).await?;
                }
            }
        }

        push_raw(push, dst, &raw).await?;
        Ok(raw.digest)
    }
}

async fn pull_raw(
    client: &Client,
    reference: &ImageReference,
    auth: &OciRegistryAuth,
) -> Result<RawManifest> {
    let (body, digest) = client
        .pull_manifest_raw(&to_oci_reference(reference)?, auth, MANIFEST_MEDIA_TYPES)
        .await
        .map_err(|e| classify(reference, "Failed to pull manifest", e))?;
    RawManifest::parse(reference, body, digest)
}

async fn push_raw(client: &Client, reference: &ImageReference, raw: &RawManifest) -> Result<()> {
    let media_type = manifest_media_type(&raw.manifest);
    let content_type = media_type.parse().map_err(|_| MirrorError::Registry {
        registry: reference.registry.clone(),
        message: format!("Invalid manifest media type '{}'", media_type),
    })?;
    client
        .push_manifest_raw(&to_oci_reference(reference)?, raw.body.clone(), content_type)
        .await
        .map_err(|e| registry_error(reference, "Failed to push manifest", e))?;
    Ok(())
}

/// Copy the config and layers of `image`, skipping non-distributable layers.
async fn copy_blobs(
    pull: &Client,
    push: &Client,
    src: &ImageReference,
    dst: &ImageReference,
    image: &OciImageManifest,
) -> Result<()> {
    let src_ref = to_oci_reference(src)?;
    let dst_ref = to_oci_reference(dst)?;

    for descriptor in std::iter::once(&image.config).chain(image.layers.iter()) {
        if !is_distributable(&descriptor.media_type) {
            tracing::debug!(digest = %descriptor.digest, "Skipping non-distributable layer");
            continue;
        }
        let mut data: Vec<u8> = Vec::new();
        pull.pull_blob(&src_ref, descriptor, &mut data)
            .await
            .map_err(|e| registry_error(src, &format!("Failed to pull blob {}", descriptor.digest), e))?;
        push.push_blob(&dst_ref, &data, &descriptor.digest)
            .await
            .map_err(|e| registry_error(dst, &format!("Failed to push blob {}", descriptor.digest), e))?;
    }
    Ok(())
}

/// Instance digests listed by an image index, in index order, without repeats.
fn index_instances(index: &OciImageIndex) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    index
        .manifests
        .iter()
        .filter(|entry| seen.insert(entry.digest.as_str()))
        .map(|entry| entry.digest.clone())
        .collect()
}

/// Content type to push `manifest` with.
fn manifest_media_type(manifest: &OciManifest) -> &str {
    match manifest {
        OciManifest::Image(image) => image.media_type.as_deref().unwrap_or(OCI_IMAGE_MEDIA_TYPE),
        OciManifest::ImageIndex(index) => index
            .media_type
            .as_deref()
            .unwrap_or(OCI_IMAGE_INDEX_MEDIA_TYPE),
    }
}

/// Whether a blob may be copied between registries.
fn is_distributable(media_type: &str) -> bool {
    !media_type.contains("nondistributable") && !media_type.contains(".foreign.")
}

#[async_trait]
impl ImageTransport for RegistryTransport {
    async fn transfer(
        &self,
        source: &str,
        destination: &str,
        mode: TransferMode,
        options: &TransferOptions,
    ) -> Result<()> {
        match mode {
            TransferMode::Copy => self.copy(source, destination, options).await,
            TransferMode::Delete => Err(MirrorError::Unsupported(format!(
                "registry transport cannot delete {}",
                destination
            ))),
        }
    }

    async fn exists(&self, reference: &str, options: &TransferOptions) -> Result<bool> {
        let parsed = ImageReference::parse(reference)?;
        let client = self.clients.get(options.dest_tls_verify);
        match client
            .fetch_manifest_digest(&to_oci_reference(&parsed)?, &self.auth.to_oci_auth())
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => match classify(&parsed, "Failed to check manifest", e) {
                MirrorError::ManifestNotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }
}

/// Resolves manifests from a registry.
pub struct RegistryManifestSource {
    clients: RegistryClients,
    auth: RegistryAuth,
    tls_verify: bool,
}

impl RegistryManifestSource {
    pub fn new(auth: RegistryAuth, tls_verify: bool) -> Self {
        Self {
            clients: RegistryClients::new(),
            auth,
            tls_verify,
        }
    }
}

#[async_trait]
impl ManifestSource for RegistryManifestSource {
    async fn fetch_manifest(&self, reference: &str) -> Result<FetchedManifest> {
        let parsed = ImageReference::parse(reference)?;
        let (manifest, digest) = self
            .clients
            .get(self.tls_verify)
            .pull_manifest(&to_oci_reference(&parsed)?, &self.auth.to_oci_auth())
            .await
            .map_err(|e| classify(&parsed, "Failed to pull manifest", e))?;
        Ok(FetchedManifest { digest, manifest })
    }
}

fn to_oci_reference(reference: &ImageReference) -> Result<Reference> {
    let full = reference.full_reference();
    full.parse::<Reference>().map_err(|e| {
        MirrorError::InvalidReference(format!("Invalid OCI reference '{}': {}", full, e))
    })
}

fn registry_error(reference: &ImageReference, context: &str, err: OciDistributionError) -> MirrorError {
    MirrorError::Registry {
        registry: reference.registry.clone(),
        message: format!("{} {}: {}", context, reference, err),
    }
}

/// Map a client error, separating "nothing stored here" from other failures.
fn classify(reference: &ImageReference, context: &str, err: OciDistributionError) -> MirrorError {
    let not_found = match &err {
        OciDistributionError::ImageManifestNotFoundError(_) => true,
        other => {
            let text = other.to_string();
            text.contains("MANIFEST_UNKNOWN") || text.contains("404")
        }
    };
    if not_found {
        MirrorError::ManifestNotFound(reference.full_reference())
    } else {
        registry_error(reference, context, err)
    }
}
