//! Bounded-concurrency batch executor.
//!
//! One coordinator owns the run state. It dispatches units in batch order,
//! makes every skip decision and records every result; worker tasks only
//! perform transport calls and send their outcome back over a channel.
//!
//! ```text
//!   coordinator ──spawn──▶ worker (permit held for the transport call)
//!        ▲                    │
//!        └──── mpsc result ◀──┘
//!   watch<bool> cancel ──────▶ all workers
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use a3s_mirror_core::config::{MirrorConfig, WorkflowMode};
use a3s_mirror_core::error::{MirrorError, Result};
use a3s_mirror_core::event::{events, EventEmitter, MirrorEvent};
use a3s_mirror_core::unit::{
    Category, CategoryCounts, FailureSeverity, ImageType, OriginKey, RelatedImageIndex,
    TransferBatch, TransferFailure, TransferUnit,
};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;

use super::report::write_report;
use crate::transport::{
    reference_at_tag, ImageTransport, SignatureResolver, TransferMode, TransferOptions,
};

/// Cause recorded for bundles skipped because a related image failed.
pub const SKIPPED_DEPENDENCY_CAUSE: &str = "skipped due to failed dependency";

/// Engine settings derived from [`MirrorConfig`].
#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub mode: WorkflowMode,
    /// Maximum transfers in flight; 0 is treated as 1
    pub parallel_images: usize,
    pub command_timeout: Duration,
    pub enclave_override: bool,
    /// Directory receiving the error report
    pub logs_dir: PathBuf,
    pub options: TransferOptions,
}

impl BatchSettings {
    pub fn from_config(config: &MirrorConfig) -> Self {
        Self {
            mode: config.mode,
            parallel_images: config.parallel_images,
            command_timeout: config.command_timeout(),
            enclave_override: config.enclave_override,
            logs_dir: config.logs_dir(),
            options: TransferOptions::from(config),
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone)]
pub enum BatchOutcome {
    /// Every unit succeeded
    Complete,
    /// Some units failed; none of them was a release image
    Recoverable {
        failures: Vec<TransferFailure>,
        report: PathBuf,
    },
    /// A release image failed and the run was cancelled
    Fatal {
        failure: Box<TransferFailure>,
        report: PathBuf,
    },
}

impl BatchOutcome {
    pub fn is_fatal(&self) -> bool {
        matches!(self, BatchOutcome::Fatal { .. })
    }

    /// Path of the error report, if one was written.
    pub fn report(&self) -> Option<&PathBuf> {
        match self {
            BatchOutcome::Complete => None,
            BatchOutcome::Recoverable { report, .. } | BatchOutcome::Fatal { report, .. } => {
                Some(report)
            }
        }
    }
}

/// Result of executing a batch.
#[derive(Debug, Clone)]
pub struct BatchResult {
    /// Units that were transferred (or handled upstream), in batch order
    pub transferred: Vec<TransferUnit>,
    /// Successes per category
    pub counts: CategoryCounts,
    /// Units per category
    pub totals: CategoryCounts,
    pub outcome: BatchOutcome,
}

impl BatchResult {
    /// Turn a fatal outcome into [`MirrorError::Fatal`].
    pub fn into_result(self) -> Result<Self> {
        match self.outcome {
            BatchOutcome::Fatal { failure, .. } => Err(MirrorError::Fatal(failure)),
            _ => Ok(self),
        }
    }
}

/// Failures recorded so far in a run.
#[derive(Debug, Default)]
pub struct FailureHistory {
    failures: Vec<TransferFailure>,
}

impl FailureHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, failure: TransferFailure) {
        self.failures.push(failure);
    }

    /// Whether any recorded failure references `bundle`.
    pub fn bundle_failed(&self, bundle: &OriginKey) -> bool {
        self.failures.iter().any(|f| f.references_bundle(bundle))
    }

    pub fn failures(&self) -> &[TransferFailure] {
        &self.failures
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    fn into_failures(self) -> Vec<TransferFailure> {
        self.failures
    }
}

/// What the coordinator does with a unit before dispatching it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipDecision {
    /// Run the transport
    Transfer,
    /// Handled outside this run; counts as transferred
    AlreadyHandled,
    /// Not attempted; recorded as a failure with this cause
    Skip(String),
}

/// Decide whether `unit` is transferred, given the failures seen so far.
pub fn skip_decision(
    unit: &TransferUnit,
    mode: WorkflowMode,
    enclave_override: bool,
    history: &FailureHistory,
) -> SkipDecision {
    match unit.image_type {
        ImageType::UpdateGraph
            if !enclave_override
                && matches!(mode, WorkflowMode::MirrorToDisk | WorkflowMode::MirrorToMirror) =>
        {
            SkipDecision::AlreadyHandled
        }
        ImageType::OperatorBundle if history.bundle_failed(&unit.origin_key()) => {
            SkipDecision::Skip(SKIPPED_DEPENDENCY_CAUSE.to_string())
        }
        _ => SkipDecision::Transfer,
    }
}

/// Outcome of one worker.
#[derive(Debug)]
enum UnitOutcome {
    Succeeded,
    Failed(String),
    Aborted,
}

#[derive(Debug)]
struct UnitReport {
    index: usize,
    outcome: UnitOutcome,
}

/// Sends a failure if the worker ends without reporting (e.g. panics).
struct ReportGuard {
    index: usize,
    tx: mpsc::Sender<UnitReport>,
    sent: bool,
}

impl ReportGuard {
    fn send(mut self, outcome: UnitOutcome) {
        self.sent = true;
        // Capacity equals the unit count and each unit reports once.
        let _ = self.tx.try_send(UnitReport {
            index: self.index,
            outcome,
        });
    }
}

impl Drop for ReportGuard {
    fn drop(&mut self) {
        if !self.sent {
            let _ = self.tx.try_send(UnitReport {
                index: self.index,
                outcome: UnitOutcome::Failed("transfer task terminated unexpectedly".to_string()),
            });
        }
    }
}

/// Executes transfer batches.
pub struct BatchExecutor {
    transport: Arc<dyn ImageTransport>,
    signatures: Arc<dyn SignatureResolver>,
    settings: BatchSettings,
    events: Option<EventEmitter>,
}

impl BatchExecutor {
    pub fn new(
        transport: Arc<dyn ImageTransport>,
        signatures: Arc<dyn SignatureResolver>,
        settings: BatchSettings,
    ) -> Self {
        Self {
            transport,
            signatures,
            settings,
            events: None,
        }
    }

    /// Emit progress events through `emitter`.
    pub fn with_events(mut self, emitter: EventEmitter) -> Self {
        self.events = Some(emitter);
        self
    }

    pub fn settings(&self) -> &BatchSettings {
        &self.settings
    }

    /// Run every unit of `batch`.
    ///
    /// Unit failures are reported through [`BatchOutcome`]; `Err` means the
    /// engine itself failed (e.g. the report could not be written).
    pub async fn execute(&self, mut batch: TransferBatch) -> Result<BatchResult> {
        batch.normalize();
        let units = batch.units;
        let limit = self.settings.parallel_images.max(1);
        let mode = match self.settings.mode {
            WorkflowMode::Delete => TransferMode::Delete,
            _ => TransferMode::Copy,
        };

        tracing::info!(
            units = units.len(),
            parallel = limit,
            mode = ?self.settings.mode,
            "Starting batch"
        );

        let (result_tx, mut result_rx) = mpsc::channel::<UnitReport>(units.len().max(1));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let semaphore = Arc::new(Semaphore::new(limit));
        let mut tasks = JoinSet::new();
        let mut run = RunState::new(&batch.related, self.events.clone());

        for (index, unit) in units.iter().enumerate() {
            // Wait for room while consuming finished results.
            let permit = loop {
                tokio::select! {
                    biased;
                    Some(report) = result_rx.recv() => run.record(report, &units, &cancel_tx),
                    permit = semaphore.clone().acquire_owned() => {
                        break permit.map_err(|e| MirrorError::Other(format!("Semaphore closed: {}", e)))?;
                    }
                }
            };
            while let Ok(report) = result_rx.try_recv() {
                run.record(report, &units, &cancel_tx);
            }

            if run.fatal.is_some() {
                run.not_started = units.len() - index;
                drop(permit);
                break;
            }

            match skip_decision(unit, self.settings.mode, self.settings.enclave_override, &run.history) {
                SkipDecision::AlreadyHandled => {
                    tracing::debug!(origin = %unit.origin, "Update graph handled upstream, skipping");
                    run.emit(events::UNIT_SKIPPED, unit, None);
                    run.succeed(index, unit);
                    continue;
                }
                SkipDecision::Skip(cause) => {
                    tracing::warn!(origin = %unit.origin, cause = %cause, "Skipping unit");
                    run.emit(events::UNIT_SKIPPED, unit, Some(&cause));
                    run.fail(unit, cause, &cancel_tx);
                    continue;
                }
                SkipDecision::Transfer => {}
            }

            let guard = ReportGuard {
                index,
                tx: result_tx.clone(),
                sent: false,
            };
            let transport = Arc::clone(&self.transport);
            let signatures = Arc::clone(&self.signatures);
            let options = self.settings.options.clone();
            let timeout = self.settings.command_timeout;
            let cancel = cancel_rx.clone();
            let unit = unit.clone();

            tasks.spawn(async move {
                let _permit = permit;
                let outcome = run_unit(
                    transport.as_ref(),
                    signatures.as_ref(),
                    &unit,
                    mode,
                    &options,
                    timeout,
                    cancel,
                )
                .await;
                guard.send(outcome);
            });
        }

        drop(result_tx);
        while let Some(report) = result_rx.recv().await {
            run.record(report, &units, &cancel_tx);
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Transfer task failed to complete");
            }
        }

        self.finish(run, batch.totals)
    }

    fn finish(&self, run: RunState, totals: CategoryCounts) -> Result<BatchResult> {
        let RunState {
            mut transferred,
            counts,
            history,
            fatal,
            aborted,
            not_started,
            events: emitter,
            ..
        } = run;

        for category in Category::ALL {
            tracing::info!(
                category = %category,
                succeeded = counts.get(category),
                total = totals.get(category),
                "Mirrored images"
            );
        }
        if aborted > 0 || not_started > 0 {
            tracing::warn!(aborted, not_started, "Batch cancelled before all units ran");
        }

        let outcome = if history.is_empty() {
            BatchOutcome::Complete
        } else {
            let report = write_report(&self.settings.logs_dir, history.failures())?;
            tracing::warn!(
                failures = history.len(),
                report = %report.display(),
                "Some images failed to mirror"
            );
            match fatal {
                Some(failure) => BatchOutcome::Fatal {
                    failure: Box::new(failure),
                    report,
                },
                None => BatchOutcome::Recoverable {
                    failures: history.into_failures(),
                    report,
                },
            }
        };

        if let Some(emitter) = &emitter {
            emitter.emit(MirrorEvent::with_string(
                events::BATCH_COMPLETED,
                format!("{}/{} images mirrored", counts.total(), totals.total()),
            ));
        }

        transferred.sort_by_key(|(index, _)| *index);
        Ok(BatchResult {
            transferred: transferred.into_iter().map(|(_, unit)| unit).collect(),
            counts,
            totals,
            outcome,
        })
    }
}

/// State owned by the coordinator for one run.
struct RunState<'a> {
    related: &'a RelatedImageIndex,
    events: Option<EventEmitter>,
    transferred: Vec<(usize, TransferUnit)>,
    counts: CategoryCounts,
    history: FailureHistory,
    fatal: Option<TransferFailure>,
    aborted: usize,
    not_started: usize,
}

impl<'a> RunState<'a> {
    fn new(related: &'a RelatedImageIndex, events: Option<EventEmitter>) -> Self {
        Self {
            related,
            events,
            transferred: Vec::new(),
            counts: CategoryCounts::default(),
            history: FailureHistory::new(),
            fatal: None,
            aborted: 0,
            not_started: 0,
        }
    }

    fn record(&mut self, report: UnitReport, units: &[TransferUnit], cancel: &watch::Sender<bool>) {
        let unit = &units[report.index];
        match report.outcome {
            UnitOutcome::Succeeded => {
                tracing::debug!(origin = %unit.origin, destination = %unit.destination, "Image mirrored");
                self.emit(events::UNIT_SUCCEEDED, unit, None);
                self.succeed(report.index, unit);
            }
            UnitOutcome::Failed(cause) => {
                self.emit(events::UNIT_FAILED, unit, Some(&cause));
                self.fail(unit, cause, cancel);
            }
            UnitOutcome::Aborted => {
                tracing::debug!(origin = %unit.origin, "Transfer aborted");
                self.aborted += 1;
            }
        }
    }

    fn succeed(&mut self, index: usize, unit: &TransferUnit) {
        self.counts.increment(unit.image_type.category());
        self.transferred.push((index, unit.clone()));
    }

    fn fail(&mut self, unit: &TransferUnit, cause: String, cancel: &watch::Sender<bool>) {
        let failure = TransferFailure::new(unit.clone(), cause)
            .with_referrers(self.related.referrers(&unit.origin));

        if failure.severity() == FailureSeverity::Fatal && self.fatal.is_none() {
            tracing::error!(
                origin = %unit.origin,
                cause = %failure.cause,
                "Release image failed, cancelling remaining transfers"
            );
            cancel.send_replace(true);
            if let Some(emitter) = &self.events {
                emitter.emit(MirrorEvent::with_string(
                    events::BATCH_CANCELLED,
                    failure.to_string(),
                ));
            }
            self.fatal = Some(failure.clone());
        } else {
            tracing::warn!(origin = %unit.origin, cause = %failure.cause, "Image failed to mirror");
        }
        self.history.record(failure);
    }

    fn emit(&self, key: &str, unit: &TransferUnit, cause: Option<&str>) {
        let Some(emitter) = &self.events else {
            return;
        };
        let mut map = HashMap::new();
        map.insert("origin".to_string(), serde_json::json!(unit.origin));
        map.insert("destination".to_string(), serde_json::json!(unit.destination));
        map.insert("type".to_string(), serde_json::json!(unit.image_type.to_string()));
        if let Some(cause) = cause {
            map.insert("cause".to_string(), serde_json::json!(cause));
        }
        emitter.emit(MirrorEvent::with_map(key, map));
    }
}

/// Run one unit in a worker task.
async fn run_unit(
    transport: &dyn ImageTransport,
    signatures: &dyn SignatureResolver,
    unit: &TransferUnit,
    mode: TransferMode,
    options: &TransferOptions,
    timeout: Duration,
    mut cancel: watch::Receiver<bool>,
) -> UnitOutcome {
    if *cancel.borrow() {
        return UnitOutcome::Aborted;
    }

    let work = async {
        match mode {
            TransferMode::Copy => {
                transport
                    .transfer(&unit.source, &unit.destination, TransferMode::Copy, options)
                    .await
            }
            TransferMode::Delete => delete_unit(transport, signatures, unit, options).await,
        }
    };

    tokio::select! {
        biased;
        _ = cancelled(&mut cancel) => UnitOutcome::Aborted,
        result = tokio::time::timeout(timeout, work) => match result {
            Ok(Ok(())) => UnitOutcome::Succeeded,
            Ok(Err(e)) => UnitOutcome::Failed(e.to_string()),
            Err(_) => UnitOutcome::Failed(
                MirrorError::Timeout(format!("{} after {:?}", unit.destination, timeout))
                    .to_string(),
            ),
        },
    }
}

/// Delete the destination of `unit` together with its signatures.
async fn delete_unit(
    transport: &dyn ImageTransport,
    signatures: &dyn SignatureResolver,
    unit: &TransferUnit,
    options: &TransferOptions,
) -> Result<()> {
    if !transport.exists(&unit.destination, options).await? {
        tracing::debug!(destination = %unit.destination, "Image not present, nothing to delete");
        return Ok(());
    }

    match signatures.resolve_signature_tags(&unit.destination).await {
        Ok(tags) => {
            for tag in tags {
                let signature = reference_at_tag(&unit.destination, &tag)?;
                if let Err(e) = transport
                    .transfer("", &signature, TransferMode::Delete, options)
                    .await
                {
                    tracing::warn!(signature = %signature, error = %e, "Failed to delete signature");
                }
            }
        }
        Err(e) => {
            tracing::warn!(destination = %unit.destination, error = %e, "Failed to resolve signatures");
        }
    }

    transport
        .transfer(&unit.source, &unit.destination, TransferMode::Delete, options)
        .await
}

/// Resolves once cancellation is requested. Never resolves if the sender is gone.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|cancelled| *cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}
