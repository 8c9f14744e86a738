//! Batch engine: executes a transfer batch with bounded concurrency.

mod engine;
pub mod report;

pub use engine::{
    skip_decision, BatchExecutor, BatchOutcome, BatchResult, BatchSettings, FailureHistory,
    SkipDecision, SKIPPED_DEPENDENCY_CAUSE,
};
