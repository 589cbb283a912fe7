//! HTTP session, streaming downloads and the batched download engine.
//!
//! # Features
//!
//! - One shared [`HttpClient`] with bounded retries and exponential backoff
//! - Streaming downloads into `<name>.part`, renamed once the size checks out
//! - A semaphore-bounded [`DownloadEngine`] that pauses between batches
//! - Live progress through a single-writer [`ProgressTracker`]
//!
//! # Example
//!
//! ```no_run
//! use ipsw_downloader_core::download::HttpClient;
//! use std::path::Path;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = HttpClient::new();
//! let file = client
//!     .download_to_file(
//!         "https://updates.cdn-apple.com/fw/iPhone_Restore.ipsw",
//!         Path::new("/srv/ipsw/iPhone_Restore.ipsw"),
//!         8192,
//!         |_, _| {},
//!     )
//!     .await?;
//! println!("Downloaded: {}", file.path.display());
//! # Ok(())
//! # }
//! ```

mod client;
mod engine;
mod error;
mod progress;
mod retry;

pub use client::{
    DEFAULT_CHUNK_SIZE, DEFAULT_CONNECT_TIMEOUT, DEFAULT_REQUEST_TIMEOUT, DownloadFileResult,
    HttpClient, part_path_for,
};
pub use engine::{
    DEFAULT_BATCH_PAUSE, DEFAULT_BATCH_PAUSE_EVERY, DEFAULT_CONCURRENCY,
    DEFAULT_PROGRESS_INTERVAL, DownloadEngine, DownloadTask, EngineError, EngineOptions,
    FailedDownload, RunResult, TaskOutcome, TaskState,
};
pub use error::DownloadError;
pub use progress::{ProgressHandle, ProgressSnapshot, ProgressTracker, format_elapsed};
pub use retry::{
    DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_STATUSES, FailureType, MAX_RETRY_AFTER, RetryDecision,
    RetryPolicy, classify_error, parse_retry_after,
};
