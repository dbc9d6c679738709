//! Client-side journaled read cache: interval index, journal, vector cache,
//! watermark cleaner, cached-file facade, and statistics.

pub mod cached_file;
pub mod cleaner;
pub mod interval;
pub mod journal;
pub mod stats;
pub mod vector_cache;

pub use cached_file::{CachedFile, CachedFileConfig, RemoteFile};
pub use cleaner::{Cleaner, CleanerConfig};
pub use interval::{Interval, IntervalIndex};
pub use journal::{Journal, JournalConfig, JournalError, RemoteStamp};
pub use stats::{FileStats, Stats, StatsDump};
pub use vector_cache::{ChunkData, ChunkRequest, VectorCache, VectorCacheError};
