//! History ledger: digests already shipped in earlier archives.
//!
//! The ledger lives in `<working_dir>/.history/` as plain-text files named
//! `.history-<YYYYmmdd_HHMMSS>`, one digest per line. The newest file is the
//! current ledger. Appending writes a new file, so earlier files are never
//! rewritten.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use a3s_mirror_core::error::{MirrorError, Result};

const HISTORY_PREFIX: &str = ".history-";

/// Persisted set of archived digests.
#[derive(Debug, Clone)]
pub struct HistoryLedger {
    dir: PathBuf,
    digests: BTreeSet<String>,
}

impl HistoryLedger {
    /// Empty ledger stored in `dir`. Nothing is read.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            digests: BTreeSet::new(),
        }
    }

    /// Load the most recent ledger file in `dir`.
    ///
    /// A missing directory or no ledger file yields an empty ledger.
    pub fn read(dir: impl Into<PathBuf>) -> Result<Self> {
        let mut ledger = Self::new(dir);
        let Some(latest) = ledger.latest_file()? else {
            tracing::debug!(dir = %ledger.dir.display(), "No history ledger found, starting empty");
            return Ok(ledger);
        };

        let content = std::fs::read_to_string(&latest).map_err(|e| {
            MirrorError::History(format!("Failed to read {}: {}", latest.display(), e))
        })?;
        ledger.digests = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect();

        tracing::debug!(
            file = %latest.display(),
            digests = ledger.digests.len(),
            "Loaded history ledger"
        );
        Ok(ledger)
    }

    /// Path of the newest ledger file, if any.
    pub fn latest_file(&self) -> Result<Option<PathBuf>> {
        if !self.dir.exists() {
            return Ok(None);
        }
        let entries = std::fs::read_dir(&self.dir).map_err(|e| {
            MirrorError::History(format!("Failed to list {}: {}", self.dir.display(), e))
        })?;

        let mut latest: Option<String> = None;
        for entry in entries {
            let name = entry?.file_name().to_string_lossy().into_owned();
            if name.starts_with(HISTORY_PREFIX) && latest.as_ref().map_or(true, |l| name > *l) {
                latest = Some(name);
            }
        }
        Ok(latest.map(|name| self.dir.join(name)))
    }

    pub fn contains(&self, digest: &str) -> bool {
        self.digests.contains(digest)
    }

    pub fn len(&self) -> usize {
        self.digests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.digests.is_empty()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn digests(&self) -> impl Iterator<Item = &String> {
        self.digests.iter()
    }

    /// Persist the ledger extended with `added` as a new ledger file.
    ///
    /// The file is written under a temporary name and renamed into place.
    pub fn append<I>(&mut self, added: I) -> Result<PathBuf>
    where
        I: IntoIterator<Item = String>,
    {
        self.digests.extend(added);

        std::fs::create_dir_all(&self.dir).map_err(|e| {
            MirrorError::History(format!("Failed to create {}: {}", self.dir.display(), e))
        })?;

        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let path = self.dir.join(format!("{}{}", HISTORY_PREFIX, stamp));
        let tmp = self.dir.join(format!(".tmp-history-{}", stamp));

        let mut content = String::new();
        for digest in &self.digests {
            content.push_str(digest);
            content.push('\n');
        }
        std::fs::write(&tmp, content).map_err(|e| {
            MirrorError::History(format!("Failed to write {}: {}", tmp.display(), e))
        })?;
        std::fs::rename(&tmp, &path).map_err(|e| {
            MirrorError::History(format!("Failed to persist {}: {}", path.display(), e))
        })?;

        tracing::info!(
            file = %path.display(),
            digests = self.digests.len(),
            "History ledger updated"
        );
        Ok(path)
    }
}
