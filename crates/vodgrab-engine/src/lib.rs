//! # vodgrab engine
//!
//! Chunked, rate-limited download engine for segmented video. A pool of
//! fetchers downloads chunk URLs concurrently while the engine writes them
//! to one output file per group in strict sequence order.
//!
//! - Fixed and probe-derived variable speed limits, adjustable at runtime
//! - Pause and resume without re-downloading finished chunks
//! - Fixed-delay retries for transient failures, immediate abort on 403
//! - Bounded reassembly buffer via a backpressure ladder
//! - Periodic progress snapshots over a channel
//!

pub mod chunk;
pub mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod fetcher;
pub mod playlist;
pub mod progress;
pub mod rate;
pub mod reassembly;
pub mod retry;
pub mod source;
pub mod throttle;

pub use chunk::parted_path;
pub use command::{DownloadController, DownloaderCommand};
pub use config::{
    BackpressureLadder, EngineConfig, FetcherConfig, HttpConfig, ProbeCorrection, ProgressConfig,
    RetryPolicy, SpeedLimitConfig,
};
pub use engine::{ChunkedDownloader, DownloadOptions, DownloadSummary};
pub use error::DownloadError;
pub use playlist::{PlaylistOptions, parse_segment_groups, retain_content_groups};
pub use progress::ProgressSnapshot;
pub use reassembly::{ChunkSink, FileSink};
pub use source::{ChunkBody, ChunkSource, HttpChunkSource};
pub use throttle::SpeedLimit;
