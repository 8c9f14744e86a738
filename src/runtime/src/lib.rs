//! A3S Mirror Runtime - transfer execution pipeline.
//!
//! Batch engine, blob gathering, history ledger and incremental archive
//! builder, plus the registry and OCI layout collaborators they run against.

#![allow(clippy::result_large_err)]

pub mod archive;
pub mod batch;
pub mod gather;
pub mod history;
pub mod oci;
pub mod transport;

// Re-export common types
pub use archive::{ArchiveBuilder, ArchiveSummary};
pub use batch::{BatchExecutor, BatchOutcome, BatchResult, BatchSettings};
pub use gather::{BlobGatherer, ContentDigestSet, GatheredBlobs, SignatureFailure, SignatureFailureKind};
pub use history::HistoryLedger;
pub use oci::{OciLayoutManifestSource, RegistryAuth, RegistryManifestSource, RegistryTransport, RoutedManifestSource};
pub use transport::{
    FetchedManifest, ImageTransport, ManifestSource, PseudoTagSignatureResolver, SignatureResolver,
    TransferMode, TransferOptions,
};

/// A3S Mirror Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
