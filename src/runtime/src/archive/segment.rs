//! Size-bounded tar segment writer.
//!
//! Files are appended to `mirror_000001.tar`, `mirror_000002.tar`, ... in
//! the destination directory. A segment is closed when the next entry plus
//! the end-of-archive trailer does not fit into the remaining room.
//! Numbering continues after any segment already present in the destination.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use a3s_mirror_core::config::ChunkPolicy;
use a3s_mirror_core::error::{MirrorError, Result};

const BLOCK_SIZE: u64 = 512;
/// Two zero blocks written when a segment is closed.
const TRAILER_SIZE: u64 = 2 * BLOCK_SIZE;
/// Longest name that fits into a plain tar header.
const MAX_HEADER_NAME: usize = 100;

/// Bytes an entry occupies in a tar stream: header, optional GNU long-name
/// record, and content padded to whole blocks.
pub fn entry_size(name: &str, len: u64) -> u64 {
    let mut size = BLOCK_SIZE + padded(len);
    if name.len() >= MAX_HEADER_NAME {
        size += BLOCK_SIZE + padded(name.len() as u64 + 1);
    }
    size
}

fn padded(len: u64) -> u64 {
    (len + BLOCK_SIZE - 1) / BLOCK_SIZE * BLOCK_SIZE
}

/// Segment file name for a 1-based index.
pub fn segment_name(index: usize) -> String {
    format!("mirror_{:06}.tar", index)
}

/// Index of a segment file name, `None` for anything else.
fn segment_index(name: &str) -> Option<usize> {
    let digits = name.strip_prefix("mirror_")?.strip_suffix(".tar")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// First segment index not used by a file already in `dir`.
fn next_free_index(dir: &Path) -> Result<usize> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(1),
        Err(e) => return Err(archive_error(dir, "read", e)),
    };
    let mut highest = 0;
    for entry in entries {
        let entry = entry.map_err(|e| archive_error(dir, "read", e))?;
        if let Some(index) = entry.file_name().to_str().and_then(segment_index) {
            highest = highest.max(index);
        }
    }
    Ok(highest + 1)
}

struct OpenSegment {
    path: PathBuf,
    builder: tar::Builder<BufWriter<File>>,
    size: u64,
}

impl OpenSegment {
    fn close(self) -> Result<PathBuf> {
        let mut writer = self
            .builder
            .into_inner()
            .map_err(|e| archive_error(&self.path, "finish", e))?;
        writer
            .flush()
            .map_err(|e| archive_error(&self.path, "flush", e))?;
        tracing::debug!(segment = %self.path.display(), size = self.size, "Closed archive segment");
        Ok(self.path)
    }
}

/// Segments produced by a [`SegmentWriter`].
#[derive(Debug, Clone, Default)]
pub struct FinishedSegments {
    pub segments: Vec<PathBuf>,
    /// Archive names of files written to standalone oversized segments
    pub oversized: Vec<String>,
}

/// Writes entries across size-bounded tar segments.
pub struct SegmentWriter {
    destination: PathBuf,
    max_size: u64,
    policy: ChunkPolicy,
    /// Resolved when the first segment is opened
    next_index: Option<usize>,
    current: Option<OpenSegment>,
    closed: Vec<PathBuf>,
    oversized: Vec<String>,
}

impl SegmentWriter {
    pub fn new(destination: impl Into<PathBuf>, max_size: u64, policy: ChunkPolicy) -> Self {
        Self {
            destination: destination.into(),
            max_size,
            policy,
            next_index: None,
            current: None,
            closed: Vec::new(),
            oversized: Vec::new(),
        }
    }

    /// Append the file at `source` as `name`.
    pub fn add_file(&mut self, source: &Path, name: &str) -> Result<()> {
        let mut file = File::open(source).map_err(|e| archive_error(source, "open", e))?;
        let len = file
            .metadata()
            .map_err(|e| archive_error(source, "stat", e))?
            .len();

        let isolated = self.make_room(name, len)?;
        let segment = self.open_current()?;
        segment
            .builder
            .append_file(name, &mut file)
            .map_err(|e| archive_error(&segment.path, "append to", e))?;
        segment.size += entry_size(name, len);

        if isolated {
            self.close_current()?;
        }
        Ok(())
    }

    /// Append in-memory content as `name`.
    pub fn add_bytes(&mut self, name: &str, data: &[u8]) -> Result<()> {
        let len = data.len() as u64;
        let isolated = self.make_room(name, len)?;
        let segment = self.open_current()?;

        let mut header = tar::Header::new_gnu();
        header.set_size(len);
        header.set_mode(0o644);
        header.set_mtime(chrono::Utc::now().timestamp().max(0) as u64);
        header.set_cksum();
        segment
            .builder
            .append_data(&mut header, name, data)
            .map_err(|e| archive_error(&segment.path, "append to", e))?;
        segment.size += entry_size(name, len);

        if isolated {
            self.close_current()?;
        }
        Ok(())
    }

    /// Append every regular file below `dir`, named `<prefix>/<relative path>`.
    ///
    /// Paths for which `exclude` returns true are skipped, including whole
    /// subtrees. Symlinks are not followed.
    pub fn add_dir_all(
        &mut self,
        dir: &Path,
        prefix: &str,
        exclude: &dyn Fn(&Path) -> bool,
    ) -> Result<usize> {
        let mut entries: Vec<_> = std::fs::read_dir(dir)
            .map_err(|e| archive_error(dir, "read", e))?
            .collect::<std::io::Result<_>>()
            .map_err(|e| archive_error(dir, "read", e))?;
        entries.sort_by_key(|entry| entry.file_name());

        let mut added = 0;
        for entry in entries {
            let path = entry.path();
            if exclude(&path) {
                tracing::debug!(path = %path.display(), "Excluded from archive");
                continue;
            }
            let name = format!("{}/{}", prefix, entry.file_name().to_string_lossy());
            let file_type = entry
                .file_type()
                .map_err(|e| archive_error(&path, "stat", e))?;
            if file_type.is_dir() {
                added += self.add_dir_all(&path, &name, exclude)?;
            } else if file_type.is_file() {
                self.add_file(&path, &name)?;
                added += 1;
            } else {
                tracing::debug!(path = %path.display(), "Skipping non-regular file");
            }
        }
        Ok(added)
    }

    /// Close the open segment and return everything produced.
    pub fn finish(mut self) -> Result<FinishedSegments> {
        self.close_current()?;
        Ok(FinishedSegments {
            segments: std::mem::take(&mut self.closed),
            oversized: std::mem::take(&mut self.oversized),
        })
    }

    /// Drop the open segment and remove every segment file produced so far.
    pub fn discard(mut self) {
        let mut paths = std::mem::take(&mut self.closed);
        if let Some(segment) = self.current.take() {
            paths.push(segment.path.clone());
            drop(segment);
        }
        for path in paths {
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::warn!(segment = %path.display(), error = %e, "Failed to remove segment");
            }
        }
    }

    /// Rotate so an entry of `len` bytes fits. Returns true when the entry
    /// goes into a standalone oversized segment.
    fn make_room(&mut self, name: &str, len: u64) -> Result<bool> {
        let needed = entry_size(name, len) + TRAILER_SIZE;
        if needed > self.max_size {
            return match self.policy {
                ChunkPolicy::Strict => Err(MirrorError::ArchiveSizeExceeded {
                    path: name.to_string(),
                    size: len,
                    max: self.max_size,
                }),
                ChunkPolicy::Permissive => {
                    tracing::warn!(
                        file = %name,
                        size = len,
                        max = self.max_size,
                        "File exceeds maximum archive size, writing it to its own segment"
                    );
                    self.close_current()?;
                    self.oversized.push(name.to_string());
                    Ok(true)
                }
            };
        }

        let full = self
            .current
            .as_ref()
            .map_or(false, |segment| {
                segment.size > 0 && segment.size + needed > self.max_size
            });
        if full {
            self.close_current()?;
        }
        Ok(false)
    }

    fn open_current(&mut self) -> Result<&mut OpenSegment> {
        if self.current.is_none() {
            let index = match self.next_index {
                Some(index) => index,
                None => next_free_index(&self.destination)?,
            };
            let path = self.destination.join(segment_name(index));
            // Never truncate a segment left by an earlier run.
            let file = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .map_err(|e| archive_error(&path, "create", e))?;
            self.next_index = Some(index + 1);
            tracing::debug!(segment = %path.display(), "Opened archive segment");
            self.current = Some(OpenSegment {
                path,
                builder: tar::Builder::new(BufWriter::new(file)),
                size: 0,
            });
        }
        self.current
            .as_mut()
            .ok_or_else(|| MirrorError::Archive("no open segment".to_string()))
    }

    fn close_current(&mut self) -> Result<()> {
        if let Some(segment) = self.current.take() {
            let path = segment.close()?;
            self.closed.push(path);
        }
        Ok(())
    }
}

fn archive_error(path: &Path, action: &str, err: std::io::Error) -> MirrorError {
    MirrorError::Archive(format!("Failed to {} {}: {}", action, path.display(), err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry_names(path: &Path) -> Vec<String> {
        let mut archive = tar::Archive::new(File::open(path).unwrap());
        archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_entry_size_accounting() {
        assert_eq!(entry_size("a", 0), 512);
        assert_eq!(entry_size("a", 1), 1024);
        assert_eq!(entry_size("a", 512), 1024);
        assert_eq!(entry_size("a", 513), 1536);
        let long = "x".repeat(120);
        assert_eq!(entry_size(&long, 1), 1024 + 512 + 512);
    }

    #[test]
    fn test_segment_name() {
        assert_eq!(segment_name(1), "mirror_000001.tar");
        assert_eq!(segment_name(42), "mirror_000042.tar");
    }

    #[test]
    fn test_rotates_when_segment_full() {
        let tmp = TempDir::new().unwrap();
        let mut writer = SegmentWriter::new(tmp.path(), 4096, ChunkPolicy::Strict);
        for i in 0..3 {
            writer.add_bytes(&format!("blob-{}", i), &[7u8; 1024]).unwrap();
        }
        let finished = writer.finish().unwrap();

        assert_eq!(finished.segments.len(), 2);
        assert_eq!(entry_names(&finished.segments[0]), vec!["blob-0", "blob-1"]);
        assert_eq!(entry_names(&finished.segments[1]), vec!["blob-2"]);
        assert!(finished.oversized.is_empty());
    }

    #[test]
    fn test_segments_on_disk_stay_within_bound() {
        let tmp = TempDir::new().unwrap();
        let max = 4096;
        let mut writer = SegmentWriter::new(tmp.path(), max, ChunkPolicy::Strict);
        let sizes = [2560usize, 1024, 1024, 100, 2000, 700];
        for (i, size) in sizes.iter().enumerate() {
            writer.add_bytes(&format!("blob-{}", i), &vec![3u8; *size]).unwrap();
        }
        let finished = writer.finish().unwrap();

        let mut names = Vec::new();
        for segment in &finished.segments {
            let on_disk = std::fs::metadata(segment).unwrap().len();
            assert!(on_disk <= max, "{} is {} bytes", segment.display(), on_disk);
            names.extend(entry_names(segment));
        }
        let expected: Vec<String> = (0..sizes.len()).map(|i| format!("blob-{}", i)).collect();
        assert_eq!(names, expected);
    }

    #[test]
    fn test_trailer_counts_against_bound() {
        let tmp = TempDir::new().unwrap();
        let mut writer = SegmentWriter::new(tmp.path(), 4096, ChunkPolicy::Strict);
        // header + 2560 bytes + trailer == 4096
        writer.add_bytes("fits", &[7u8; 2560]).unwrap();
        let finished = writer.finish().unwrap();
        assert_eq!(std::fs::metadata(&finished.segments[0]).unwrap().len(), 4096);

        let mut writer = SegmentWriter::new(tmp.path().join("other"), 4096, ChunkPolicy::Strict);
        let err = writer.add_bytes("blob", &[7u8; 3072]).unwrap_err();
        assert!(matches!(err, MirrorError::ArchiveSizeExceeded { size: 3072, .. }));
    }

    #[test]
    fn test_numbering_continues_after_existing_segments() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("mirror_000001.tar"), b"earlier run").unwrap();
        std::fs::write(tmp.path().join("mirror_000003.tar"), b"earlier run").unwrap();
        std::fs::write(tmp.path().join("mirror_notes.tar"), b"unrelated").unwrap();

        let mut writer = SegmentWriter::new(tmp.path(), 1 << 20, ChunkPolicy::Strict);
        writer.add_bytes("blob", &[1u8; 10]).unwrap();
        let finished = writer.finish().unwrap();

        assert_eq!(finished.segments, vec![tmp.path().join("mirror_000004.tar")]);
        assert_eq!(
            std::fs::read(tmp.path().join("mirror_000001.tar")).unwrap(),
            b"earlier run"
        );
    }

    #[test]
    fn test_discard_keeps_earlier_segments() {
        let tmp = TempDir::new().unwrap();
        let earlier = tmp.path().join("mirror_000001.tar");
        std::fs::write(&earlier, b"earlier run").unwrap();

        let mut writer = SegmentWriter::new(tmp.path(), 1 << 20, ChunkPolicy::Strict);
        writer.add_bytes("blob", &[1u8; 10]).unwrap();
        writer.discard();

        assert!(earlier.exists());
        assert!(!tmp.path().join("mirror_000002.tar").exists());
    }

    #[test]
    fn test_segment_index() {
        assert_eq!(segment_index("mirror_000012.tar"), Some(12));
        assert_eq!(segment_index("mirror_.tar"), None);
        assert_eq!(segment_index("mirror_notes.tar"), None);
        assert_eq!(segment_index("mirror_000001.tar.gz"), None);
    }

    #[test]
    fn test_strict_rejects_oversized_file() {
        let tmp = TempDir::new().unwrap();
        let mut writer = SegmentWriter::new(tmp.path(), 2048, ChunkPolicy::Strict);
        writer.add_bytes("small", &[1u8; 100]).unwrap();
        let err = writer.add_bytes("big", &[1u8; 4096]).unwrap_err();
        assert!(matches!(err, MirrorError::ArchiveSizeExceeded { size: 4096, max: 2048, .. }));

        writer.discard();
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_permissive_isolates_oversized_file() {
        let tmp = TempDir::new().unwrap();
        let mut writer = SegmentWriter::new(tmp.path(), 2048, ChunkPolicy::Permissive);
        writer.add_bytes("small-1", &[1u8; 100]).unwrap();
        writer.add_bytes("big", &[1u8; 4096]).unwrap();
        writer.add_bytes("small-2", &[1u8; 100]).unwrap();
        let finished = writer.finish().unwrap();

        assert_eq!(finished.segments.len(), 3);
        assert_eq!(entry_names(&finished.segments[0]), vec!["small-1"]);
        assert_eq!(entry_names(&finished.segments[1]), vec!["big"]);
        assert_eq!(entry_names(&finished.segments[2]), vec!["small-2"]);
        assert_eq!(finished.oversized, vec!["big".to_string()]);
    }

    #[test]
    fn test_add_dir_all_with_exclusion() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        std::fs::create_dir_all(src.join("nested")).unwrap();
        std::fs::create_dir_all(src.join("skip")).unwrap();
        std::fs::write(src.join("a.txt"), "a").unwrap();
        std::fs::write(src.join("nested").join("b.txt"), "b").unwrap();
        std::fs::write(src.join("skip").join("c.txt"), "c").unwrap();

        let out = tmp.path().join("out");
        std::fs::create_dir_all(&out).unwrap();
        let mut writer = SegmentWriter::new(&out, 1 << 20, ChunkPolicy::Strict);
        let skip = src.join("skip");
        let added = writer
            .add_dir_all(&src, "working-dir", &|p: &Path| p == skip.as_path())
            .unwrap();
        let finished = writer.finish().unwrap();

        assert_eq!(added, 2);
        assert_eq!(
            entry_names(&finished.segments[0]),
            vec!["working-dir/a.txt", "working-dir/nested/b.txt"]
        );
    }

    #[test]
    fn test_finish_without_entries_produces_nothing() {
        let tmp = TempDir::new().unwrap();
        let writer = SegmentWriter::new(tmp.path(), 4096, ChunkPolicy::Strict);
        assert!(writer.finish().unwrap().segments.is_empty());
    }
}
