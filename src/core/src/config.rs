use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{MirrorError, Result};

/// Default number of images transferred in parallel.
pub const DEFAULT_PARALLEL_IMAGES: usize = 8;

/// Default per-image command timeout: 10 minutes.
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 600;

/// Default maximum archive segment size: 10 GiB.
pub const DEFAULT_MAX_ARCHIVE_SIZE: u64 = 10 * 1024 * 1024 * 1024;

/// History ledger directory, relative to the working directory.
pub const HISTORY_DIR: &str = ".history";

/// Mirror configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    /// Workflow being executed
    pub mode: WorkflowMode,

    /// Working directory (reports, history ledger, run metadata)
    pub working_dir: PathBuf,

    /// Local cache registry storage root
    pub cache_dir: PathBuf,

    /// Directory receiving archive segments
    pub destination: PathBuf,

    /// Image set configuration embedded in the archive
    pub config_path: Option<PathBuf>,

    /// Maximum number of images in flight
    pub parallel_images: usize,

    /// Per-image transfer timeout in seconds
    pub command_timeout_secs: u64,

    /// Maximum archive segment size in bytes ("500m", "4g" accepted)
    #[serde(deserialize_with = "deserialize_size")]
    pub max_archive_size: u64,

    /// What to do with files larger than one segment
    pub chunk_policy: ChunkPolicy,

    /// Do not copy or archive image signatures
    pub remove_signatures: bool,

    /// Mirror the update-graph image in-band (enclave / fully offline setups)
    pub enclave_override: bool,

    /// Verify TLS when talking to source registries
    pub src_tls_verify: bool,

    /// Verify TLS when talking to destination registries
    pub dest_tls_verify: bool,

    /// Log level used when RUST_LOG is not set
    pub log_level: LogLevel,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        let base = dirs::home_dir()
            .map(|h| h.join(".a3s"))
            .unwrap_or_else(|| PathBuf::from(".a3s"))
            .join("mirror");
        Self {
            mode: WorkflowMode::MirrorToDisk,
            working_dir: PathBuf::from("working-dir"),
            cache_dir: base.join("cache"),
            destination: PathBuf::from("."),
            config_path: None,
            parallel_images: DEFAULT_PARALLEL_IMAGES,
            command_timeout_secs: DEFAULT_COMMAND_TIMEOUT_SECS,
            max_archive_size: DEFAULT_MAX_ARCHIVE_SIZE,
            chunk_policy: ChunkPolicy::Strict,
            remove_signatures: false,
            enclave_override: false,
            src_tls_verify: true,
            dest_tls_verify: true,
            log_level: LogLevel::Info,
        }
    }
}

impl MirrorConfig {
    /// Load a YAML configuration file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            MirrorError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let mut config: MirrorConfig = serde_yaml::from_str(&content)?;
        if config.config_path.is_none() {
            config.config_path = Some(path.to_path_buf());
        }
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.parallel_images == 0 {
            return Err(MirrorError::Config(
                "parallel_images must be greater than 0".to_string(),
            ));
        }
        if self.command_timeout_secs == 0 {
            return Err(MirrorError::Config(
                "command_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.max_archive_size == 0 {
            return Err(MirrorError::Config(
                "max_archive_size must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// Directory holding the error reports of each run.
    pub fn logs_dir(&self) -> PathBuf {
        self.working_dir.join("logs")
    }

    /// Directory holding the history ledger files.
    pub fn history_dir(&self) -> PathBuf {
        self.working_dir.join(HISTORY_DIR)
    }
}

/// Workflow being executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkflowMode {
    /// Remote registries → local cache → archive segments
    MirrorToDisk,
    /// Archive segments → local cache → remote registry
    DiskToMirror,
    /// Remote registries → remote registry
    MirrorToMirror,
    /// Remove previously mirrored images from a registry
    Delete,
}

impl WorkflowMode {
    /// Whether this workflow ends by producing archive segments.
    pub fn produces_archive(&self) -> bool {
        matches!(self, WorkflowMode::MirrorToDisk)
    }
}

/// Handling of files larger than the maximum segment size
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChunkPolicy {
    /// Abort the build
    #[default]
    Strict,
    /// Write the file to a standalone segment and warn
    Permissive,
}

/// Log level
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SizeValue {
    Bytes(u64),
    Text(String),
}

fn deserialize_size<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<u64, D::Error> {
    match SizeValue::deserialize(deserializer)? {
        SizeValue::Bytes(n) => Ok(n),
        SizeValue::Text(s) => parse_size(&s).map_err(serde::de::Error::custom),
    }
}

/// Parse a human-readable size string (e.g., "10m", "1g", "4096") into bytes.
pub fn parse_size(s: &str) -> std::result::Result<u64, String> {
    let s = s.trim().to_lowercase();
    if let Ok(n) = s.parse::<u64>() {
        return Ok(n);
    }
    let (num, mult) = if s.ends_with("gb") || s.ends_with('g') {
        (s.trim_end_matches("gb").trim_end_matches('g'), 1024u64 * 1024 * 1024)
    } else if s.ends_with("mb") || s.ends_with('m') {
        (s.trim_end_matches("mb").trim_end_matches('m'), 1024u64 * 1024)
    } else if s.ends_with("kb") || s.ends_with('k') {
        (s.trim_end_matches("kb").trim_end_matches('k'), 1024u64)
    } else if s.ends_with('b') {
        (s.trim_end_matches('b'), 1u64)
    } else {
        return Err(format!("unrecognized size format: {s}"));
    };
    let n: u64 = num.trim().parse().map_err(|_| format!("invalid number: {num}"))?;
    Ok(n * mult)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = MirrorConfig::default();
        assert_eq!(config.mode, WorkflowMode::MirrorToDisk);
        assert_eq!(config.parallel_images, DEFAULT_PARALLEL_IMAGES);
        assert_eq!(config.command_timeout(), Duration::from_secs(600));
        assert_eq!(config.chunk_policy, ChunkPolicy::Strict);
        assert!(!config.enclave_override);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("1024").unwrap(), 1024);
        assert_eq!(parse_size("10m").unwrap(), 10 * 1024 * 1024);
        assert_eq!(parse_size("4G").unwrap(), 4 * 1024 * 1024 * 1024);
        assert_eq!(parse_size("512kb").unwrap(), 512 * 1024);
        assert!(parse_size("abc").is_err());
    }

    #[test]
    fn test_load_yaml_with_size_string() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("mirror.yaml");
        std::fs::write(
            &path,
            "mode: mirror-to-disk\nparallel_images: 4\nmax_archive_size: 500m\nchunk_policy: permissive\nenclave_override: true\n",
        )
        .unwrap();

        let config = MirrorConfig::load(&path).unwrap();
        assert_eq!(config.parallel_images, 4);
        assert_eq!(config.max_archive_size, 500 * 1024 * 1024);
        assert_eq!(config.chunk_policy, ChunkPolicy::Permissive);
        assert!(config.enclave_override);
        assert_eq!(config.config_path.as_deref(), Some(path.as_path()));
    }

    #[test]
    fn test_load_yaml_with_numeric_size() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("mirror.yaml");
        std::fs::write(&path, "max_archive_size: 4096\n").unwrap();
        let config = MirrorConfig::load(&path).unwrap();
        assert_eq!(config.max_archive_size, 4096);
    }

    #[test]
    fn test_validate_rejects_zero_parallelism() {
        let config = MirrorConfig {
            parallel_images: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(MirrorError::Config(_))));
    }

    #[test]
    fn test_load_missing_file() {
        let err = MirrorConfig::load(Path::new("/nonexistent/mirror.yaml")).unwrap_err();
        assert!(err.to_string().contains("Configuration error"));
    }

    #[test]
    fn test_derived_directories() {
        let config = MirrorConfig {
            working_dir: PathBuf::from("/data/wd"),
            ..Default::default()
        };
        assert_eq!(config.logs_dir(), PathBuf::from("/data/wd/logs"));
        assert_eq!(config.history_dir(), PathBuf::from("/data/wd").join(HISTORY_DIR));
    }

    #[test]
    fn test_only_mirror_to_disk_produces_archive() {
        assert!(WorkflowMode::MirrorToDisk.produces_archive());
        assert!(!WorkflowMode::MirrorToMirror.produces_archive());
        assert!(!WorkflowMode::DiskToMirror.produces_archive());
        assert!(!WorkflowMode::Delete.produces_archive());
    }
}
