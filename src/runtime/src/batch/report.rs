//! Error report written at the end of a run with failures.

use std::path::{Path, PathBuf};

use a3s_mirror_core::error::{MirrorError, Result};
use a3s_mirror_core::unit::TransferFailure;

/// Render failures one per line, sorted by origin then destination.
pub fn format_report(failures: &[TransferFailure]) -> String {
    let mut sorted: Vec<&TransferFailure> = failures.iter().collect();
    sorted.sort_by(|a, b| {
        a.unit
            .origin
            .cmp(&b.unit.origin)
            .then_with(|| a.unit.destination.cmp(&b.unit.destination))
    });

    let mut out = String::new();
    for failure in sorted {
        out.push_str(&failure.to_string());
        out.push('\n');
    }
    out
}

/// Write `mirroring_errors_<YYYYmmdd_HHMMSS>.txt` into `logs_dir`.
pub fn write_report(logs_dir: &Path, failures: &[TransferFailure]) -> Result<PathBuf> {
    std::fs::create_dir_all(logs_dir).map_err(|e| {
        MirrorError::Other(format!(
            "Failed to create report directory {}: {}",
            logs_dir.display(),
            e
        ))
    })?;

    let name = format!(
        "mirroring_errors_{}.txt",
        chrono::Local::now().format("%Y%m%d_%H%M%S")
    );
    let path = logs_dir.join(name);
    std::fs::write(&path, format_report(failures)).map_err(|e| {
        MirrorError::Other(format!("Failed to write report {}: {}", path.display(), e))
    })?;
    Ok(path)
}
