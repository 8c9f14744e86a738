//! Incremental archive builder.
//!
//! Packs the run's metadata and every blob not shipped by an earlier run
//! into size-bounded tar segments, then extends the history ledger.
//!
//! Archive layout:
//!
//! ```text
//! docker/registry/v2/repositories/...   cache repository metadata
//! docker/registry/v2/blobs/<alg>/<xx>/<hex>/data
//! working-dir/...                       working directory
//! working-dir/isc_<timestamp>.yaml      input configuration
//! ```

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use a3s_mirror_core::config::{ChunkPolicy, MirrorConfig, HISTORY_DIR};
use a3s_mirror_core::error::{MirrorError, Result};
use a3s_mirror_core::event::{events, EventEmitter, MirrorEvent};
use a3s_mirror_core::reference::split_digest;
use a3s_mirror_core::unit::TransferUnit;

use super::segment::SegmentWriter;
use crate::gather::{BlobGatherer, SignatureFailure};
use crate::history::HistoryLedger;

const REGISTRY_ROOT: &str = "docker/registry/v2";
const WORKING_DIR_PREFIX: &str = "working-dir";

/// What an archive run produced.
#[derive(Debug, Clone, Default)]
pub struct ArchiveSummary {
    /// Segment files, in order
    pub segments: Vec<PathBuf>,
    /// Digests written by this run
    pub added_digests: Vec<String>,
    /// Digests already shipped by an earlier run
    pub skipped_digests: Vec<String>,
    /// Files written to standalone segments (permissive policy)
    pub oversized: Vec<String>,
    /// Tolerated signature failures
    pub signature_warnings: Vec<SignatureFailure>,
}

/// Packs transferred images into archive segments.
pub struct ArchiveBuilder {
    cache_dir: PathBuf,
    working_dir: PathBuf,
    history_dir: PathBuf,
    destination: PathBuf,
    config_path: Option<PathBuf>,
    max_size: u64,
    policy: ChunkPolicy,
    gatherer: BlobGatherer,
    events: Option<EventEmitter>,
}

impl ArchiveBuilder {
    pub fn new(
        cache_dir: impl Into<PathBuf>,
        working_dir: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        gatherer: BlobGatherer,
    ) -> Self {
        let working_dir = working_dir.into();
        Self {
            cache_dir: cache_dir.into(),
            history_dir: working_dir.join(HISTORY_DIR),
            working_dir,
            destination: destination.into(),
            config_path: None,
            max_size: a3s_mirror_core::config::DEFAULT_MAX_ARCHIVE_SIZE,
            policy: ChunkPolicy::Strict,
            gatherer,
            events: None,
        }
    }

    pub fn from_config(config: &MirrorConfig, gatherer: BlobGatherer) -> Self {
        Self::new(
            &config.cache_dir,
            &config.working_dir,
            &config.destination,
            gatherer,
        )
        .with_config_path(config.config_path.clone())
        .with_history_dir(config.history_dir())
        .with_max_size(config.max_archive_size, config.chunk_policy)
    }

    /// Ledger directory; defaults to `<working_dir>/.history`.
    pub fn with_history_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.history_dir = dir.into();
        self
    }

    pub fn with_config_path(mut self, path: Option<PathBuf>) -> Self {
        self.config_path = path;
        self
    }

    pub fn with_max_size(mut self, max_size: u64, policy: ChunkPolicy) -> Self {
        self.max_size = max_size;
        self.policy = policy;
        self
    }

    pub fn with_events(mut self, emitter: EventEmitter) -> Self {
        self.events = Some(emitter);
        self
    }

    /// Build archive segments for `transferred`.
    ///
    /// On error every segment produced by this call is removed and the
    /// ledger is left untouched.
    pub async fn build(&self, transferred: &[TransferUnit]) -> Result<ArchiveSummary> {
        std::fs::create_dir_all(&self.destination).map_err(|e| {
            MirrorError::Archive(format!(
                "Failed to create destination {}: {}",
                self.destination.display(),
                e
            ))
        })?;

        tracing::info!(
            images = transferred.len(),
            destination = %self.destination.display(),
            max_size = self.max_size,
            "Building archive"
        );

        let mut writer = SegmentWriter::new(&self.destination, self.max_size, self.policy);
        let mut summary = ArchiveSummary::default();
        let mut ledger = match self.fill(&mut writer, transferred, &mut summary).await {
            Ok(ledger) => ledger,
            Err(e) => {
                writer.discard();
                return Err(e);
            }
        };

        let finished = writer.finish()?;
        summary.segments = finished.segments;
        summary.oversized = finished.oversized;

        ledger.append(summary.added_digests.iter().cloned())?;

        if let Some(emitter) = &self.events {
            for segment in &summary.segments {
                emitter.emit(MirrorEvent::with_string(
                    events::ARCHIVE_SEGMENT_CLOSED,
                    segment.display().to_string(),
                ));
            }
        }

        tracing::info!(
            segments = summary.segments.len(),
            added = summary.added_digests.len(),
            skipped = summary.skipped_digests.len(),
            "Archive complete"
        );
        Ok(summary)
    }

    async fn fill(
        &self,
        writer: &mut SegmentWriter,
        transferred: &[TransferUnit],
        summary: &mut ArchiveSummary,
    ) -> Result<HistoryLedger> {
        let repositories = self.cache_dir.join(REGISTRY_ROOT).join("repositories");
        if repositories.is_dir() {
            writer.add_dir_all(
                &repositories,
                &format!("{}/repositories", REGISTRY_ROOT),
                &|_: &Path| false,
            )?;
        } else {
            tracing::warn!(path = %repositories.display(), "Cache has no repository metadata");
        }

        if self.working_dir.is_dir() {
            let destination = canonical(&self.destination);
            let same_dir = canonical(&self.working_dir) == destination;
            let exclude = |path: &Path| {
                if same_dir {
                    is_segment_file(path)
                } else {
                    canonical(path) == destination
                }
            };
            writer.add_dir_all(&self.working_dir, WORKING_DIR_PREFIX, &exclude)?;
        }

        if let Some(config_path) = &self.config_path {
            let name = format!(
                "{}/isc_{}.yaml",
                WORKING_DIR_PREFIX,
                chrono::Local::now().format("%Y%m%d_%H%M%S")
            );
            let data = std::fs::read(config_path).map_err(|e| {
                MirrorError::Archive(format!(
                    "Failed to read configuration {}: {}",
                    config_path.display(),
                    e
                ))
            })?;
            writer.add_bytes(&name, &data)?;
        }

        let ledger = HistoryLedger::read(self.history_dir.clone())?;
        let mut added: BTreeSet<String> = BTreeSet::new();
        let mut skipped: BTreeSet<String> = BTreeSet::new();

        for unit in transferred {
            let gathered = self.gatherer.gather(&unit.destination).await?;
            for failure in gathered.signature_failures {
                tracing::warn!(origin = %unit.origin, "{}", failure);
                summary.signature_warnings.push(failure);
            }

            for digest in gathered.digests {
                if ledger.contains(&digest) {
                    skipped.insert(digest);
                    continue;
                }
                if added.contains(&digest) {
                    continue;
                }
                let relative = blob_relative_path(&digest)?;
                let source = self.cache_dir.join(&relative);
                if !source.is_file() {
                    return Err(MirrorError::Archive(format!(
                        "Blob {} of {} not found at {}",
                        digest,
                        unit.origin,
                        source.display()
                    )));
                }
                writer.add_file(&source, &relative)?;
                added.insert(digest);
            }
        }

        summary.added_digests = added.into_iter().collect();
        summary.skipped_digests = skipped.into_iter().collect();
        Ok(ledger)
    }
}

/// Path of a blob relative to the cache root and inside the archive.
pub fn blob_relative_path(digest: &str) -> Result<String> {
    let (algorithm, encoded) = split_digest(digest)?;
    if encoded.len() < 2 {
        return Err(MirrorError::InvalidReference(format!(
            "Digest too short: {}",
            digest
        )));
    }
    Ok(format!(
        "{}/blobs/{}/{}/{}/data",
        REGISTRY_ROOT,
        algorithm,
        &encoded[..2],
        encoded
    ))
}

fn canonical(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

fn is_segment_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map_or(false, |n| n.starts_with("mirror_") && n.ends_with(".tar"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_relative_path() {
        assert_eq!(
            blob_relative_path("sha256:abcdef").unwrap(),
            "docker/registry/v2/blobs/sha256/ab/abcdef/data"
        );
        assert!(blob_relative_path("sha256:a").is_err());
        assert!(blob_relative_path("abcdef").is_err());
    }

    #[test]
    fn test_blob_relative_path_rejects_unsafe_digests() {
        // multi-byte character straddling the fan-out prefix
        assert!(blob_relative_path("sha256:a\u{e9}").is_err());
        assert!(matches!(
            blob_relative_path("sha256:../../../../etc/passwd"),
            Err(MirrorError::InvalidReference(_))
        ));
        assert!(blob_relative_path("../x:abcd").is_err());
    }

    #[test]
    fn test_is_segment_file() {
        assert!(is_segment_file(Path::new("/out/mirror_000001.tar")));
        assert!(!is_segment_file(Path::new("/out/logs")));
        assert!(!is_segment_file(Path::new("/out/mirror.yaml")));
    }
}
