//! Collaborator interfaces used by the mirror engine.
//!
//! The engine never speaks a registry protocol itself. Moving bytes is the
//! job of an [`ImageTransport`]; locating manifests is the job of a
//! [`ManifestSource`]; finding attached signatures is the job of a
//! [`SignatureResolver`].

use a3s_mirror_core::error::{MirrorError, Result};
use a3s_mirror_core::reference::{signature_tag, split_transport, ImageReference, Transport};
use a3s_mirror_core::MirrorConfig;
use async_trait::async_trait;
use oci_distribution::manifest::OciManifest;

/// What a transfer does with its destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// Copy source to destination
    Copy,
    /// Delete destination
    Delete,
}

/// Per-transfer options passed through to the transport.
#[derive(Debug, Clone)]
pub struct TransferOptions {
    pub remove_signatures: bool,
    pub src_tls_verify: bool,
    pub dest_tls_verify: bool,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            remove_signatures: false,
            src_tls_verify: true,
            dest_tls_verify: true,
        }
    }
}

impl From<&MirrorConfig> for TransferOptions {
    fn from(config: &MirrorConfig) -> Self {
        Self {
            remove_signatures: config.remove_signatures,
            src_tls_verify: config.src_tls_verify,
            dest_tls_verify: config.dest_tls_verify,
        }
    }
}

/// Moves a single image. Retries, if any, happen inside the implementation.
#[async_trait]
pub trait ImageTransport: Send + Sync {
    /// Copy `source` to `destination`, or delete `destination`.
    async fn transfer(
        &self,
        source: &str,
        destination: &str,
        mode: TransferMode,
        options: &TransferOptions,
    ) -> Result<()>;

    /// Whether an image exists at `reference`.
    async fn exists(&self, reference: &str, options: &TransferOptions) -> Result<bool>;
}

/// Finds the signature tags attached to a digest-pinned reference.
#[async_trait]
pub trait SignatureResolver: Send + Sync {
    async fn resolve_signature_tags(&self, reference: &str) -> Result<Vec<String>>;
}

/// A manifest together with the digest it was served under.
#[derive(Debug, Clone)]
pub struct FetchedManifest {
    pub digest: String,
    pub manifest: OciManifest,
}

/// Resolves the manifest behind a reference.
///
/// Implementations return [`MirrorError::ManifestNotFound`] when nothing is
/// stored at the reference, so callers can tell absence from failure.
#[async_trait]
pub trait ManifestSource: Send + Sync {
    async fn fetch_manifest(&self, reference: &str) -> Result<FetchedManifest>;
}

/// Signature resolver using the `<algorithm>-<hex>.sig` tag convention.
#[derive(Debug, Clone, Default)]
pub struct PseudoTagSignatureResolver;

#[async_trait]
impl SignatureResolver for PseudoTagSignatureResolver {
    async fn resolve_signature_tags(&self, reference: &str) -> Result<Vec<String>> {
        let digest = reference
            .rsplit_once('@')
            .map(|(_, digest)| digest)
            .ok_or_else(|| {
                MirrorError::InvalidReference(format!(
                    "'{}' is not pinned to a digest",
                    reference
                ))
            })?;
        Ok(vec![signature_tag(digest)?])
    }
}

/// Same image location as `reference`, addressed by `digest`.
pub fn reference_at_digest(reference: &str, digest: &str) -> Result<String> {
    match split_transport(reference) {
        (Transport::Docker, rest) => {
            let parsed = ImageReference::parse(rest)?;
            Ok(format!("{}{}", Transport::Docker.prefix(), parsed.with_digest(digest)))
        }
        (transport, rest) => Ok(format!(
            "{}{}@{}",
            transport.prefix(),
            strip_locator(rest),
            digest
        )),
    }
}

/// Same image location as `reference`, addressed by `tag`.
pub fn reference_at_tag(reference: &str, tag: &str) -> Result<String> {
    match split_transport(reference) {
        (Transport::Docker, rest) => {
            let parsed = ImageReference::parse(rest)?;
            Ok(format!("{}{}", Transport::Docker.prefix(), parsed.with_tag(tag)))
        }
        (transport, rest) => Ok(format!(
            "{}{}:{}",
            transport.prefix(),
            strip_locator(rest),
            tag
        )),
    }
}

/// Split a local layout reference into path and optional `@digest` / `:tag`.
pub(crate) fn split_layout_reference(rest: &str) -> (&str, Option<Locator<'_>>) {
    if let Some((path, digest)) = rest.rsplit_once('@') {
        return (path, Some(Locator::Digest(digest)));
    }
    let segment_start = rest.rfind('/').map(|p| p + 1).unwrap_or(0);
    match rest[segment_start..].rfind(':') {
        Some(colon) => {
            let split = segment_start + colon;
            (&rest[..split], Some(Locator::Tag(&rest[split + 1..])))
        }
        None => (rest, None),
    }
}

/// Tag or digest part of a local layout reference.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Locator<'a> {
    Tag(&'a str),
    Digest(&'a str),
}

fn strip_locator(rest: &str) -> &str {
    split_layout_reference(rest).0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pseudo_tag_resolver_derives_sig_tag() {
        let resolver = PseudoTagSignatureResolver;
        let tags = resolver
            .resolve_signature_tags("docker://quay.io/org/app@sha256:abc123")
            .await
            .unwrap();
        assert_eq!(tags, vec!["sha256-abc123.sig".to_string()]);
    }

    #[tokio::test]
    async fn test_pseudo_tag_resolver_requires_digest() {
        let resolver = PseudoTagSignatureResolver;
        let err = resolver
            .resolve_signature_tags("docker://quay.io/org/app:v1")
            .await
            .unwrap_err();
        assert!(matches!(err, MirrorError::InvalidReference(_)));
    }

    #[test]
    fn test_reference_at_digest_registry() {
        let pinned = reference_at_digest("docker://localhost:55000/org/app:v1", "sha256:ff").unwrap();
        assert_eq!(pinned, "docker://localhost:55000/org/app@sha256:ff");
    }

    #[test]
    fn test_reference_at_tag_registry() {
        let tagged = reference_at_tag("docker://quay.io/org/app@sha256:ff", "sha256-ff.sig").unwrap();
        assert_eq!(tagged, "docker://quay.io/org/app:sha256-ff.sig");
    }

    #[test]
    fn test_layout_references() {
        assert_eq!(
            reference_at_digest("oci:///srv/layout:v1", "sha256:aa").unwrap(),
            "oci:///srv/layout@sha256:aa"
        );
        assert_eq!(
            reference_at_tag("oci:///srv/layout@sha256:aa", "sha256-aa.sig").unwrap(),
            "oci:///srv/layout:sha256-aa.sig"
        );
        assert_eq!(
            split_layout_reference("/srv/layout"),
            ("/srv/layout", None)
        );
        assert_eq!(
            split_layout_reference("/srv/layout:v2"),
            ("/srv/layout", Some(Locator::Tag("v2")))
        );
    }

    #[test]
    fn test_transfer_options_from_config() {
        let config = MirrorConfig {
            remove_signatures: true,
            dest_tls_verify: false,
            ..Default::default()
        };
        let options = TransferOptions::from(&config);
        assert!(options.remove_signatures);
        assert!(options.src_tls_verify);
        assert!(!options.dest_tls_verify);
    }
}
