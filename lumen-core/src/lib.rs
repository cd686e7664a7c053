//! Core engine of the Lumen media-library server: filesystem indexing, the
//! metadata store, video probing, and the thumbnail pipeline. The HTTP
//! surface and the transcoder live in `lumen-server`.

pub mod error;
pub mod indexer;
pub mod probe;
pub mod scanner;
pub mod store;
pub mod thumbs;
pub mod types;
pub mod watch;

pub use error::{MediaError, Result};
pub use indexer::{Indexer, IndexerOptions, ProgressSnapshot, READY_THRESHOLD};
pub use probe::{Prober, VideoInfo, COMPATIBLE_CODECS, COMPATIBLE_CONTAINERS};
pub use scanner::{ScanCounters, ScanOptions, ScanOutcome};
pub use store::{FavoriteEntry, MediaStore, Page, StatsSnapshot, TagSummary};
pub use thumbs::{ThumbnailOutcome, ThumbnailService, ThumbnailStatus};
pub use types::{FileRecord, MediaKind};
pub use watch::ChangeDetector;
