//! Archive production for the mirror-to-disk workflow.

mod builder;
pub mod segment;

pub use builder::{blob_relative_path, ArchiveBuilder, ArchiveSummary};
pub use segment::{FinishedSegments, SegmentWriter};
