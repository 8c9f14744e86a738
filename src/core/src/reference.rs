//! Image reference parsing.
//!
//! Mirror sources and destinations are transport-qualified strings such as
//! `docker://quay.io/org/app:v1` or `oci:///srv/layouts/app`. This module
//! splits off the transport and parses registry references into structured
//! components.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{MirrorError, Result};

/// Default registry when none is specified.
const DEFAULT_REGISTRY: &str = "docker.io";

/// Default tag when neither tag nor digest is given.
const DEFAULT_TAG: &str = "latest";

/// Transport prefix of a mirror reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Transport {
    /// Remote registry (`docker://`)
    Docker,
    /// Local OCI image layout (`oci:` / `oci://`)
    Oci,
    /// Plain directory (`dir:` / `dir://`)
    Dir,
}

impl Transport {
    /// Prefix used when rendering a reference with this transport.
    pub fn prefix(&self) -> &'static str {
        match self {
            Transport::Docker => "docker://",
            Transport::Oci => "oci://",
            Transport::Dir => "dir://",
        }
    }
}

/// Split a transport-qualified reference into its transport and remainder.
///
/// References without a recognised prefix are treated as registry references.
pub fn split_transport(reference: &str) -> (Transport, &str) {
    let reference = reference.trim();
    for (transport, prefixes) in [
        (Transport::Docker, ["docker://", "docker:"]),
        (Transport::Oci, ["oci://", "oci:"]),
        (Transport::Dir, ["dir://", "dir:"]),
    ] {
        for prefix in prefixes {
            if let Some(rest) = reference.strip_prefix(prefix) {
                return (transport, rest);
            }
        }
    }
    (Transport::Docker, reference)
}

/// Parsed registry image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageReference {
    /// Registry hostname (e.g., "quay.io", "localhost:55000")
    pub registry: String,
    /// Repository path (e.g., "openshift-release-dev/ocp-release")
    pub repository: String,
    /// Tag (e.g., "4.15.0-x86_64")
    pub tag: Option<String>,
    /// Digest (e.g., "sha256:abc123...")
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parse a registry reference, with or without a `docker://` prefix.
    ///
    /// - `nginx` → docker.io/library/nginx:latest
    /// - `quay.io/org/app:v1` → quay.io/org/app:v1
    /// - `localhost:5000/app@sha256:…` → digest pinned, no tag
    pub fn parse(reference: &str) -> Result<Self> {
        let (transport, rest) = split_transport(reference);
        if transport != Transport::Docker {
            return Err(MirrorError::InvalidReference(format!(
                "'{}' is not a registry reference",
                reference
            )));
        }
        let rest = rest.trim();
        if rest.is_empty() {
            return Err(MirrorError::InvalidReference(
                "Empty image reference".to_string(),
            ));
        }

        let (name_tag, digest) = match rest.rsplit_once('@') {
            Some((name, digest)) => {
                if !digest.contains(':') {
                    return Err(MirrorError::InvalidReference(format!(
                        "Invalid digest in '{}': expected algorithm:hex",
                        reference
                    )));
                }
                (name, Some(digest.to_string()))
            }
            None => (rest, None),
        };

        // A tag colon can only appear after the last slash; a colon in the
        // first component followed by digits alone is a registry port.
        let last_segment_start = name_tag.rfind('/').map(|p| p + 1).unwrap_or(0);
        let (name, tag) = match name_tag[last_segment_start..].rfind(':') {
            Some(colon) => {
                let split = last_segment_start + colon;
                let candidate = &name_tag[split + 1..];
                let is_port = last_segment_start == 0
                    && digest.is_none()
                    && candidate.chars().all(|c| c.is_ascii_digit());
                if is_port {
                    (name_tag, None)
                } else {
                    (&name_tag[..split], Some(candidate.to_string()))
                }
            }
            None => (name_tag, None),
        };

        let (registry, repository) = split_registry_repository(name)?;
        let tag = match (&tag, &digest) {
            (None, None) => Some(DEFAULT_TAG.to_string()),
            _ => tag,
        };

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Same repository, pinned to `digest` (tag dropped).
    pub fn with_digest(&self, digest: impl Into<String>) -> Self {
        Self {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: None,
            digest: Some(digest.into()),
        }
    }

    /// Same repository, addressed by `tag` (digest dropped).
    pub fn with_tag(&self, tag: impl Into<String>) -> Self {
        Self {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: Some(tag.into()),
            digest: None,
        }
    }

    /// Full reference without transport prefix.
    pub fn full_reference(&self) -> String {
        let mut s = format!("{}/{}", self.registry, self.repository);
        if let Some(ref tag) = self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(ref digest) = self.digest {
            s.push('@');
            s.push_str(digest);
        }
        s
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}

fn split_registry_repository(name: &str) -> Result<(String, String)> {
    if let Some((first, repo)) = name.split_once('/') {
        if first.contains('.') || first.contains(':') || first == "localhost" {
            if repo.is_empty() {
                return Err(MirrorError::InvalidReference(format!(
                    "Empty repository in '{}'",
                    name
                )));
            }
            return Ok((first.to_string(), repo.to_string()));
        }
        return Ok((DEFAULT_REGISTRY.to_string(), name.to_string()));
    }
    if name.is_empty() {
        return Err(MirrorError::InvalidReference(
            "Empty repository".to_string(),
        ));
    }
    Ok((DEFAULT_REGISTRY.to_string(), format!("library/{}", name)))
}

/// Split a content digest into `(algorithm, encoded)`.
///
/// Follows the OCI digest grammar: the algorithm is lowercase alphanumeric
/// components joined by `+ . _ -`, the encoded part is `[a-zA-Z0-9=_-]+`.
/// Digests come from manifest data and end up in file paths, so anything
/// else is rejected.
pub fn split_digest(digest: &str) -> Result<(&str, &str)> {
    let invalid = || MirrorError::InvalidReference(format!("Invalid digest: '{}'", digest));
    let (algorithm, encoded) = digest.split_once(':').ok_or_else(invalid)?;

    let algorithm_ok = !algorithm.is_empty()
        && algorithm
            .split(|c| matches!(c, '+' | '.' | '_' | '-'))
            .all(|part| {
                !part.is_empty()
                    && part
                        .bytes()
                        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
            });
    let encoded_ok = !encoded.is_empty()
        && encoded
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'=' | b'_' | b'-'));

    if algorithm_ok && encoded_ok {
        Ok((algorithm, encoded))
    } else {
        Err(invalid())
    }
}

/// Derive the signature pseudo-tag for a digest: `sha256:abc` → `sha256-abc.sig`.
pub fn signature_tag(digest: &str) -> Result<String> {
    let (algorithm, encoded) = split_digest(digest)?;
    Ok(format!("{}-{}.sig", algorithm, encoded))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_transport_prefixes() {
        assert_eq!(
            split_transport("docker://quay.io/a/b:1"),
            (Transport::Docker, "quay.io/a/b:1")
        );
        assert_eq!(split_transport("oci:///tmp/layout"), (Transport::Oci, "/tmp/layout"));
        assert_eq!(split_transport("oci:/tmp/layout"), (Transport::Oci, "/tmp/layout"));
        assert_eq!(split_transport("dir://cache/x"), (Transport::Dir, "cache/x"));
        assert_eq!(split_transport("quay.io/a/b"), (Transport::Docker, "quay.io/a/b"));
    }

    #[test]
    fn test_parse_simple_name() {
        let r = ImageReference::parse("nginx").unwrap();
        assert_eq!(r.registry, "docker.io");
        assert_eq!(r.repository, "library/nginx");
        assert_eq!(r.tag.as_deref(), Some("latest"));
        assert_eq!(r.digest, None);
    }

    #[test]
    fn test_parse_with_transport_prefix() {
        let r = ImageReference::parse("docker://quay.io/openshift/release:4.15.0").unwrap();
        assert_eq!(r.registry, "quay.io");
        assert_eq!(r.repository, "openshift/release");
        assert_eq!(r.tag.as_deref(), Some("4.15.0"));
    }

    #[test]
    fn test_parse_registry_with_port() {
        let r = ImageReference::parse("localhost:55000/ns/app:v1").unwrap();
        assert_eq!(r.registry, "localhost:55000");
        assert_eq!(r.repository, "ns/app");
        assert_eq!(r.tag.as_deref(), Some("v1"));
    }

    #[test]
    fn test_parse_digest_only() {
        let r = ImageReference::parse("quay.io/org/app@sha256:abcdef").unwrap();
        assert_eq!(r.tag, None);
        assert_eq!(r.digest.as_deref(), Some("sha256:abcdef"));
    }

    #[test]
    fn test_parse_tag_and_digest() {
        let r = ImageReference::parse("quay.io/org/app:v1@sha256:abcdef").unwrap();
        assert_eq!(r.tag.as_deref(), Some("v1"));
        assert_eq!(r.digest.as_deref(), Some("sha256:abcdef"));
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(ImageReference::parse("").is_err());
        assert!(ImageReference::parse("nginx@nodigest").is_err());
        assert!(ImageReference::parse("oci:///tmp/layout").is_err());
    }

    #[test]
    fn test_with_digest_drops_tag() {
        let r = ImageReference::parse("quay.io/org/app:v1").unwrap();
        let pinned = r.with_digest("sha256:0123");
        assert_eq!(pinned.full_reference(), "quay.io/org/app@sha256:0123");
        assert_eq!(pinned.with_tag("x").full_reference(), "quay.io/org/app:x");
    }

    #[test]
    fn test_signature_tag() {
        assert_eq!(signature_tag("sha256:abc123").unwrap(), "sha256-abc123.sig");
        assert!(signature_tag("abc123").is_err());
        assert!(signature_tag("sha256:").is_err());
    }

    #[test]
    fn test_split_digest() {
        assert_eq!(split_digest("sha256:ab12").unwrap(), ("sha256", "ab12"));
        assert_eq!(
            split_digest("multihash+base58:QmRZxt2b1F").unwrap(),
            ("multihash+base58", "QmRZxt2b1F")
        );
    }

    #[test]
    fn test_split_digest_rejects_path_like_input() {
        for digest in [
            "sha256:../../../../etc/passwd",
            "sha256:ab/cd",
            "sha256:a\u{e9}",
            "../sha256:abcd",
            "SHA256:abcd",
            "sha256+:abcd",
            "sha256:",
            ":abcd",
            "abcd",
        ] {
            assert!(split_digest(digest).is_err(), "accepted {:?}", digest);
        }
    }
}
