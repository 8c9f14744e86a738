//! `a3s-mirror run` command: Mirror a batch of images.
//!
//! Runs the batch engine over the collected images and, for mirror-to-disk,
//! packs everything that was transferred into archive segments.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use a3s_mirror_core::config::{ChunkPolicy, MirrorConfig};
use a3s_mirror_core::error::Result;
use a3s_mirror_core::event::{events, EventEmitter, EventPayload};
use a3s_mirror_core::unit::TransferBatch;
use a3s_mirror_runtime::{
    ArchiveBuilder, ArchiveSummary, BatchExecutor, BatchOutcome, BatchSettings, BlobGatherer,
    PseudoTagSignatureResolver, RegistryAuth, RegistryManifestSource, RegistryTransport,
    RoutedManifestSource,
};
use clap::Args;
use tokio::task::JoinHandle;

use crate::output;

#[derive(Args)]
pub struct RunArgs {
    /// Mirror configuration (YAML)
    #[arg(long)]
    pub config: PathBuf,

    /// Images to mirror (YAML, or JSON with a .json extension)
    #[arg(long)]
    pub batch: PathBuf,

    /// Maximum number of images in flight
    #[arg(long)]
    pub parallel: Option<usize>,

    /// Abort when a file does not fit in one archive segment
    #[arg(long, conflicts_with = "permissive")]
    pub strict: bool,

    /// Write oversized files to standalone segments instead of aborting
    #[arg(long)]
    pub permissive: bool,
}

pub async fn execute(args: RunArgs) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let config = load_config(&args)?;
    let batch = load_batch(&args.batch)?;

    println!(
        "Mirroring {} images ({:?}, {} in parallel)",
        batch.len(),
        config.mode,
        config.parallel_images
    );

    let emitter = EventEmitter::new(256);
    let progress = spawn_progress(&emitter, batch.len());

    let auth = RegistryAuth::from_env();
    let signatures = Arc::new(PseudoTagSignatureResolver);
    let executor = BatchExecutor::new(
        Arc::new(RegistryTransport::new(auth.clone())),
        signatures.clone(),
        BatchSettings::from_config(&config),
    )
    .with_events(emitter.clone());

    let result = executor.execute(batch).await;
    progress.abort();
    let result = result?;

    println!("{}", output::counts_table(&result.counts, &result.totals));
    match &result.outcome {
        BatchOutcome::Complete => {}
        BatchOutcome::Recoverable { failures, report } => {
            eprintln!(
                "{} images failed to mirror, see {}",
                failures.len(),
                report.display()
            );
        }
        BatchOutcome::Fatal { report, .. } => {
            eprintln!("Release image failed, see {}", report.display());
        }
    }
    let result = result.into_result()?;

    if !config.mode.produces_archive() {
        return Ok(());
    }

    let gatherer = BlobGatherer::new(
        Arc::new(RoutedManifestSource::new(RegistryManifestSource::new(
            auth,
            config.dest_tls_verify,
        ))),
        signatures,
        config.remove_signatures,
    );
    let summary = ArchiveBuilder::from_config(&config, gatherer)
        .with_events(emitter)
        .build(&result.transferred)
        .await?;
    print_summary(&summary);
    Ok(())
}

/// Load the configuration and apply command-line overrides.
fn load_config(args: &RunArgs) -> Result<MirrorConfig> {
    let mut config = MirrorConfig::load(&args.config)?;
    if let Some(parallel) = args.parallel {
        config.parallel_images = parallel;
    }
    if args.strict {
        config.chunk_policy = ChunkPolicy::Strict;
    }
    if args.permissive {
        config.chunk_policy = ChunkPolicy::Permissive;
    }
    config.validate()?;
    Ok(config)
}

/// Load the collector output.
fn load_batch(path: &Path) -> Result<TransferBatch> {
    let content = std::fs::read_to_string(path)?;
    let mut batch: TransferBatch = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(&content)?,
        _ => serde_yaml::from_str(&content)?,
    };
    batch.normalize();
    Ok(batch)
}

/// Print one line per finished image as events arrive.
fn spawn_progress(emitter: &EventEmitter, total: usize) -> JoinHandle<()> {
    let mut rx = emitter.subscribe();
    tokio::spawn(async move {
        let mut done = 0;
        while let Ok(event) = rx.recv().await {
            let mark = match event.key.as_str() {
                events::UNIT_SUCCEEDED => "ok",
                events::UNIT_FAILED => "failed",
                events::UNIT_SKIPPED => "skipped",
                _ => continue,
            };
            done += 1;
            let EventPayload::Map(fields) = &event.payload else {
                continue;
            };
            let origin = fields
                .get("origin")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            match fields.get("cause").and_then(|v| v.as_str()) {
                Some(cause) => eprintln!("[{done}/{total}] {mark} {origin}: {cause}"),
                None => eprintln!("[{done}/{total}] {mark} {origin}"),
            }
        }
    })
}

fn print_summary(summary: &ArchiveSummary) {
    let mut table = output::new_table(&["SEGMENT", "SIZE"]);
    for segment in &summary.segments {
        let size = std::fs::metadata(segment).map(|m| m.len()).unwrap_or(0);
        table.add_row(vec![
            segment.display().to_string(),
            output::format_bytes(size),
        ]);
    }
    println!("{table}");
    println!(
        "{} new blobs archived, {} already shipped",
        summary.added_digests.len(),
        summary.skipped_digests.len()
    );
    for path in &summary.oversized {
        eprintln!("Oversized file in its own segment: {path}");
    }
}
