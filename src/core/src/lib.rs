//! A3S Mirror Core - Foundational Types
//!
//! Transfer units and batches, the failure taxonomy, configuration and the
//! event emitter shared by the mirror runtime and CLI.

pub mod config;
pub mod error;
pub mod event;
pub mod reference;
pub mod unit;

// Re-export commonly used types
pub use config::{ChunkPolicy, LogLevel, MirrorConfig, WorkflowMode};
pub use error::{MirrorError, Result};
pub use event::{EventEmitter, MirrorEvent};
pub use reference::{ImageReference, Transport};
pub use unit::{
    Category, CategoryCounts, FailureSeverity, ImageReferrers, ImageType, OriginKey,
    RelatedImageIndex, TransferBatch, TransferFailure, TransferUnit,
};

/// A3S Mirror version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
