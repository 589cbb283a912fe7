//! Concurrent batched download engine.
//!
//! The engine streams one firmware image per [`DownloadTask`] using a bounded
//! pool of tokio tasks, collects results in completion order, and throttles
//! the run by pausing after every N successful downloads.
//!
//! # Concurrency Model
//!
//! - A semaphore permit is acquired before each task is spawned
//! - Each download runs in its own task inside a [`JoinSet`]
//! - Permits are released automatically when downloads complete (RAII)
//! - Results are drained with `join_next`, so the first to finish is the
//!   first recorded, regardless of submission order
//!
//! # Example
//!
//! ```no_run
//! use ipsw_downloader_core::download::{DownloadEngine, EngineOptions, HttpClient, ProgressHandle};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = DownloadEngine::new(EngineOptions::default())?;
//! let client = HttpClient::new();
//! let result = engine.run_batch(&client, Vec::new(), &ProgressHandle::detached()).await?;
//! println!("downloaded {} files", result.downloaded.len());
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use super::client::DEFAULT_CHUNK_SIZE;
use super::progress::{ProgressHandle, ProgressSnapshot, format_elapsed};
use super::{DownloadError, HttpClient};
use crate::catalog::Device;
use crate::logging::TRANSFER_TARGET;

/// Minimum allowed concurrency value.
const MIN_CONCURRENCY: usize = 1;

/// Maximum allowed concurrency value.
const MAX_CONCURRENCY: usize = 64;

/// Default number of simultaneous downloads.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Default number of successful downloads between pauses.
pub const DEFAULT_BATCH_PAUSE_EVERY: usize = 2;

/// Default length of the pause between batches.
pub const DEFAULT_BATCH_PAUSE: Duration = Duration::from_secs(60);

/// Default minimum interval between progress updates for one download.
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// Error type for download engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Invalid concurrency value provided.
    #[error(
        "invalid concurrency value {value}: must be between {MIN_CONCURRENCY} and {MAX_CONCURRENCY}"
    )]
    InvalidConcurrency {
        /// The invalid value that was provided.
        value: usize,
    },

    /// Semaphore was closed unexpectedly.
    #[error("semaphore closed unexpectedly")]
    SemaphoreClosed,
}

/// Tunables for one engine instance.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Maximum simultaneous downloads.
    pub concurrency: usize,
    /// Pause after this many successful downloads; `0` disables pausing.
    pub batch_pause_every: usize,
    /// How long each pause lasts.
    pub batch_pause: Duration,
    /// Minimum time between progress updates for a single download.
    pub progress_interval: Duration,
    /// Maximum size of each write to disk.
    pub chunk_size: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            batch_pause_every: DEFAULT_BATCH_PAUSE_EVERY,
            batch_pause: DEFAULT_BATCH_PAUSE,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// One firmware image to fetch for one device.
#[derive(Debug, Clone)]
pub struct DownloadTask {
    /// Device the image belongs to.
    pub device: Device,
    /// Firmware URL.
    pub source_url: String,
    /// Final path of the image on disk.
    pub destination: PathBuf,
}

/// Lifecycle of a single task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Waiting for a worker slot.
    Pending,
    /// Body is being written to the part file.
    Streaming,
    /// Image renamed into place.
    Completed,
    /// Destination already existed; nothing fetched.
    Skipped,
    /// Request or write failed; part file removed.
    Failed,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "pending",
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Terminal result of one task.
#[derive(Debug)]
pub enum TaskOutcome {
    /// Image downloaded to this path.
    Completed(PathBuf),
    /// Destination already existed.
    Skipped(PathBuf),
    /// The download failed.
    Failed(DownloadError),
}

impl TaskOutcome {
    /// Terminal state this outcome corresponds to.
    #[must_use]
    pub fn state(&self) -> TaskState {
        match self {
            Self::Completed(_) => TaskState::Completed,
            Self::Skipped(_) => TaskState::Skipped,
            Self::Failed(_) => TaskState::Failed,
        }
    }
}

/// A device whose download did not complete.
#[derive(Debug, Clone)]
pub struct FailedDownload {
    /// Device the failed task belonged to.
    pub device: Device,
    /// Human-readable failure reason.
    pub reason: String,
}

/// Everything one batch produced.
#[derive(Debug, Default)]
pub struct RunResult {
    /// Downloaded paths in completion order.
    pub downloaded: Vec<PathBuf>,
    /// Tasks whose destination already existed.
    pub skipped: Vec<PathBuf>,
    /// Tasks that failed or panicked.
    pub failed: Vec<FailedDownload>,
    /// Success counts at which the engine paused.
    pub pauses: Vec<usize>,
}

/// Download engine for concurrent, batched firmware downloads.
///
/// Individual failures never abort sibling tasks. Retrying is left entirely
/// to the [`HttpClient`]; the engine makes exactly one download call per task.
#[derive(Debug)]
pub struct DownloadEngine {
    semaphore: Arc<Semaphore>,
    options: EngineOptions,
}

impl DownloadEngine {
    /// Creates a new download engine.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidConcurrency`] if `options.concurrency`
    /// is outside the valid range.
    ///
    /// # Example
    ///
    /// ```
    /// use ipsw_downloader_core::download::{DownloadEngine, EngineOptions};
    ///
    /// let engine = DownloadEngine::new(EngineOptions::default()).unwrap();
    /// assert_eq!(engine.concurrency(), 4);
    /// ```
    #[instrument(level = "debug")]
    pub fn new(options: EngineOptions) -> Result<Self, EngineError> {
        if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&options.concurrency) {
            return Err(EngineError::InvalidConcurrency {
                value: options.concurrency,
            });
        }

        debug!(
            concurrency = options.concurrency,
            batch_pause_every = options.batch_pause_every,
            batch_pause_secs = options.batch_pause.as_secs(),
            "creating download engine"
        );

        Ok(Self {
            semaphore: Arc::new(Semaphore::new(options.concurrency)),
            options,
        })
    }

    /// Returns the configured concurrency limit.
    #[must_use]
    pub fn concurrency(&self) -> usize {
        self.options.concurrency
    }

    /// Downloads every task and returns what happened, in completion order.
    ///
    /// After every `batch_pause_every` successful downloads the engine sleeps
    /// `batch_pause` before recording further completions, as long as any
    /// are still outstanding.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::SemaphoreClosed`] if the worker semaphore is
    /// closed. Individual download failures are reported in
    /// [`RunResult::failed`], never as an error.
    #[instrument(skip(self, client, tasks, progress), fields(tasks = tasks.len()))]
    pub async fn run_batch(
        &self,
        client: &HttpClient,
        tasks: Vec<DownloadTask>,
        progress: &ProgressHandle,
    ) -> Result<RunResult, EngineError> {
        let mut join_set = JoinSet::new();
        let mut devices_by_task = HashMap::new();

        info!(tasks = tasks.len(), "starting download batch");

        for task in tasks {
            debug!(device = %task.device.name, state = %TaskState::Pending, "queued download");

            let permit = Arc::clone(&self.semaphore)
                .acquire_owned()
                .await
                .map_err(|_| EngineError::SemaphoreClosed)?;

            let device = task.device.clone();
            let client = client.clone();
            let progress = progress.clone();
            let options = self.options.clone();

            let handle = join_set.spawn(async move {
                let _permit = permit;
                let outcome = run_task(&client, &task, &options, &progress).await;
                (task, outcome)
            });
            devices_by_task.insert(handle.id(), device);
        }

        let mut result = RunResult::default();
        let mut successes = 0usize;

        while let Some(joined) = join_set.join_next_with_id().await {
            let (task, outcome) = match joined {
                Ok((_, pair)) => pair,
                Err(join_error) => {
                    warn!(error = %join_error, "download task panicked");
                    if let Some(device) = devices_by_task.remove(&join_error.id()) {
                        result.failed.push(FailedDownload {
                            device,
                            reason: join_error.to_string(),
                        });
                    }
                    continue;
                }
            };

            match outcome {
                TaskOutcome::Completed(path) => {
                    info!("Downloaded {}", path.display());
                    result.downloaded.push(path);
                    successes += 1;

                    if self.should_pause(successes) && !join_set.is_empty() {
                        info!(
                            "Pausing for {} before starting the next batch...",
                            format_elapsed(self.options.batch_pause)
                        );
                        result.pauses.push(successes);
                        tokio::time::sleep(self.options.batch_pause).await;
                    }
                }
                TaskOutcome::Skipped(path) => {
                    debug!(path = %path.display(), "destination already present");
                    result.skipped.push(path);
                }
                TaskOutcome::Failed(error) => {
                    warn!(
                        device = %task.device.name,
                        identifier = %task.device.identifier,
                        url = %task.source_url,
                        error = %error,
                        "download failed"
                    );
                    result.failed.push(FailedDownload {
                        device: task.device,
                        reason: error.to_string(),
                    });
                }
            }
        }

        info!(
            downloaded = result.downloaded.len(),
            skipped = result.skipped.len(),
            failed = result.failed.len(),
            pauses = result.pauses.len(),
            "download batch complete"
        );

        Ok(result)
    }

    fn should_pause(&self, successes: usize) -> bool {
        let every = self.options.batch_pause_every;
        every > 0 && successes % every == 0
    }
}

/// Streams one task to disk, publishing throttled progress along the way.
#[instrument(skip_all, fields(device = %task.device.name, url = %task.source_url))]
async fn run_task(
    client: &HttpClient,
    task: &DownloadTask,
    options: &EngineOptions,
    progress: &ProgressHandle,
) -> TaskOutcome {
    if tokio::fs::try_exists(&task.destination)
        .await
        .unwrap_or(false)
    {
        return TaskOutcome::Skipped(task.destination.clone());
    }

    debug!(target: TRANSFER_TARGET, state = %TaskState::Streaming, "starting transfer");

    let device = task.device.name.as_str();
    let started = Instant::now();
    let mut last_update = started;

    let result = client
        .download_to_file(
            &task.source_url,
            &task.destination,
            options.chunk_size,
            |written, total| {
                let now = Instant::now();
                if now.duration_since(last_update) >= options.progress_interval {
                    last_update = now;
                    progress.update(ProgressSnapshot::from_transfer(
                        device,
                        written,
                        total,
                        started.elapsed(),
                    ));
                }
            },
        )
        .await;

    let outcome = match result {
        Ok(file) => {
            progress.update(
                ProgressSnapshot::from_transfer(
                    device,
                    file.bytes_downloaded,
                    file.content_length,
                    started.elapsed(),
                )
                .completed(),
            );
            TaskOutcome::Completed(file.path)
        }
        Err(error) => TaskOutcome::Failed(error),
    };

    debug!(target: TRANSFER_TARGET, state = %outcome.state(), "transfer finished");
    outcome
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    use crate::download::RetryPolicy;
    use crate::test_support::socket_guard::start_mock_server_or_skip;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, ResponseTemplate};

    fn device(name: &str, identifier: &str) -> Device {
        Device {
            identifier: identifier.to_string(),
            name: name.to_string(),
            release_year: Some(2023),
        }
    }

    fn options(concurrency: usize) -> EngineOptions {
        EngineOptions {
            concurrency,
            batch_pause: Duration::from_millis(1),
            ..EngineOptions::default()
        }
    }

    #[test]
    fn test_engine_new_valid_concurrency() {
        let engine = DownloadEngine::new(options(1)).unwrap();
        assert_eq!(engine.concurrency(), 1);

        let engine = DownloadEngine::new(EngineOptions::default()).unwrap();
        assert_eq!(engine.concurrency(), DEFAULT_CONCURRENCY);

        let engine = DownloadEngine::new(options(MAX_CONCURRENCY)).unwrap();
        assert_eq!(engine.concurrency(), MAX_CONCURRENCY);
    }

    #[test]
    fn test_engine_new_invalid_concurrency() {
        for value in [0, MAX_CONCURRENCY + 1] {
            let result = DownloadEngine::new(options(value));
            assert!(
                matches!(result, Err(EngineError::InvalidConcurrency { value: v }) if v == value),
                "concurrency {value}"
            );
        }
    }

    #[test]
    fn test_default_options_match_documented_values() {
        let options = EngineOptions::default();
        assert_eq!(options.concurrency, 4);
        assert_eq!(options.batch_pause_every, 2);
        assert_eq!(options.batch_pause, Duration::from_secs(60));
        assert_eq!(options.progress_interval, Duration::from_secs(1));
        assert_eq!(options.chunk_size, 8192);
    }

    #[test]
    fn test_should_pause_every_n() {
        let engine = DownloadEngine::new(EngineOptions::default()).unwrap();
        let paused: Vec<usize> = (1..=5).filter(|n| engine.should_pause(*n)).collect();
        assert_eq!(paused, vec![2, 4]);
    }

    #[test]
    fn test_should_pause_disabled_with_zero() {
        let engine = DownloadEngine::new(EngineOptions {
            batch_pause_every: 0,
            ..EngineOptions::default()
        })
        .unwrap();
        assert!((1..=10).all(|n| !engine.should_pause(n)));
    }

    #[test]
    fn test_task_state_display() {
        assert_eq!(TaskState::Streaming.to_string(), "streaming");
        assert_eq!(TaskOutcome::Skipped(PathBuf::new()).state(), TaskState::Skipped);
    }

    #[tokio::test]
    async fn test_run_batch_empty_is_empty_result() {
        let engine = DownloadEngine::new(options(2)).unwrap();
        let result = engine
            .run_batch(&HttpClient::new(), Vec::new(), &ProgressHandle::detached())
            .await
            .unwrap();
        assert!(result.downloaded.is_empty());
        assert!(result.pauses.is_empty());
    }

    #[tokio::test]
    async fn test_run_batch_existing_destination_makes_no_request() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        let temp_dir = TempDir::new().unwrap();
        let destination = temp_dir.path().join("present.ipsw");
        std::fs::write(&destination, b"old").unwrap();

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"new".to_vec()))
            .expect(0)
            .mount(&mock_server)
            .await;

        let engine = DownloadEngine::new(options(2)).unwrap();
        let task = DownloadTask {
            device: device("iPhone 15", "iPhone15,4"),
            source_url: format!("{}/present.ipsw", mock_server.uri()),
            destination: destination.clone(),
        };
        let result = engine
            .run_batch(&HttpClient::new(), vec![task], &ProgressHandle::detached())
            .await
            .unwrap();

        assert!(result.downloaded.is_empty());
        assert_eq!(result.skipped, vec![destination.clone()]);
        assert_eq!(std::fs::read(&destination).unwrap(), b"old");
    }

    #[tokio::test]
    async fn test_run_batch_failure_does_not_abort_siblings() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        let temp_dir = TempDir::new().unwrap();

        Mock::given(method("GET"))
            .and(path("/ok.ipsw"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8; 64]))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/missing.ipsw"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock_server)
            .await;

        let client = HttpClient::with_settings(
            Duration::from_secs(5),
            Duration::from_secs(5),
            RetryPolicy::with_max_attempts(1),
        )
        .unwrap();
        let engine = DownloadEngine::new(options(2)).unwrap();
        let tasks = vec![
            DownloadTask {
                device: device("iPad Air", "iPad13,16"),
                source_url: format!("{}/missing.ipsw", mock_server.uri()),
                destination: temp_dir.path().join("missing.ipsw"),
            },
            DownloadTask {
                device: device("iPhone 15", "iPhone15,4"),
                source_url: format!("{}/ok.ipsw", mock_server.uri()),
                destination: temp_dir.path().join("ok.ipsw"),
            },
        ];

        let result = engine
            .run_batch(&client, tasks, &ProgressHandle::detached())
            .await
            .unwrap();

        assert_eq!(result.downloaded, vec![temp_dir.path().join("ok.ipsw")]);
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.failed[0].device.identifier, "iPad13,16");
        assert!(result.failed[0].reason.contains("404"));
        assert!(!temp_dir.path().join("missing.ipsw").exists());
    }
}
