//! HTTP client wrapper with bounded retries and streaming downloads.
//!
//! This module provides the `HttpClient` struct, the single place where the
//! crate talks to the network. Every catalog request and every firmware
//! download goes through [`HttpClient::get`], which retries transient failures
//! according to the configured [`RetryPolicy`].

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::Client;
use reqwest::header::RETRY_AFTER;
use serde::de::DeserializeOwned;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::error::DownloadError;
use super::retry::{FailureType, RetryDecision, RetryPolicy, classify_error, parse_retry_after};
use crate::user_agent;

/// Default per-read timeout applied to every request (60 seconds).
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Default TCP connect timeout (30 seconds).
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default write chunk size for streamed downloads (8 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024;

/// Suffix appended to the destination while a download is in flight.
const PART_SUFFIX: &str = ".part";

/// HTTP client with retry support.
///
/// This client is designed to be created once and reused for every request
/// in the process, taking advantage of connection pooling. Cloning is cheap.
///
/// # Example
///
/// ```no_run
/// use ipsw_downloader_core::download::HttpClient;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = HttpClient::new();
/// let devices: serde_json::Value = client.get_json("https://api.ipsw.me/v4/devices").await?;
/// println!("{devices}");
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    retry_policy: RetryPolicy,
}

/// Outcome of a completed streamed download.
#[derive(Debug, Clone)]
pub struct DownloadFileResult {
    /// Final output path.
    pub path: PathBuf,
    /// Bytes written to disk.
    pub bytes_downloaded: u64,
    /// Expected file size when the server announced one.
    pub content_length: Option<u64>,
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient {
    /// Creates a new HTTP client with default timeouts and retry policy.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client builder fails to build with the static
    /// configuration. This should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new() -> Self {
        Self::with_settings(
            DEFAULT_REQUEST_TIMEOUT,
            DEFAULT_CONNECT_TIMEOUT,
            RetryPolicy::default(),
        )
        .expect("failed to build HTTP client with static configuration")
    }

    /// Creates a client with explicit timeouts and retry policy.
    ///
    /// `request_timeout` bounds every individual read (headers and each body
    /// chunk), not the total transfer, so multi-gigabyte downloads are not cut
    /// off while data keeps flowing.
    ///
    /// # Errors
    ///
    /// Returns the underlying reqwest error if the TLS backend or resolver
    /// cannot be initialised.
    #[instrument(level = "debug", skip(retry_policy))]
    pub fn with_settings(
        request_timeout: Duration,
        connect_timeout: Duration,
        retry_policy: RetryPolicy,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .read_timeout(request_timeout)
            .gzip(true)
            .user_agent(user_agent::default_user_agent())
            .build()?;
        Ok(Self {
            client,
            retry_policy,
        })
    }

    /// Returns the retry policy applied to every request.
    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Issues a GET request, retrying transient failures.
    ///
    /// A response is returned only for 2xx statuses. Statuses in the retry set
    /// (and network errors/timeouts) are retried with exponential backoff,
    /// honoring `Retry-After` when the server sends one.
    ///
    /// # Errors
    ///
    /// Returns the last [`DownloadError`] once the failure is permanent or the
    /// attempt bound is exhausted.
    #[instrument(level = "debug", skip(self), fields(url = %url))]
    pub async fn get(&self, url: &str) -> Result<reqwest::Response, DownloadError> {
        Url::parse(url).map_err(|_| DownloadError::invalid_url(url))?;

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            debug!(attempt, "sending request");

            let error = match self.send_once(url).await {
                Ok(response) => return Ok(response),
                Err(error) => error,
            };

            let failure_type = classify_error(&error, self.retry_policy.retry_statuses());
            match self.retry_policy.should_retry(failure_type, attempt) {
                RetryDecision::Retry {
                    delay: backoff_delay,
                    attempt: next_attempt,
                } => {
                    let retry_after_delay = error.retry_after().and_then(parse_retry_after);
                    let delay = retry_after_delay.unwrap_or(backoff_delay);
                    info!(
                        url = %url,
                        attempt = next_attempt,
                        max_attempts = self.retry_policy.max_attempts(),
                        delay_ms = delay.as_millis(),
                        using_retry_after = retry_after_delay.is_some(),
                        rate_limited = failure_type == FailureType::RateLimited,
                        error = %error,
                        "retrying request"
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::DoNotRetry { reason } => {
                    debug!(url = %url, %reason, attempts = attempt, "not retrying request");
                    return Err(error);
                }
            }
        }
    }

    /// Fetches `url` and decodes the body as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Decode`] when the body is not the expected
    /// document, or any error from [`get`](Self::get).
    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, DownloadError> {
        let response = self.get(url).await?;
        let body = response.bytes().await.map_err(|e| map_reqwest_error(url, e))?;
        serde_json::from_slice(&body).map_err(|e| DownloadError::decode(url, e))
    }

    /// Streams `url` into `destination`.
    ///
    /// The body is written to `<destination>.part` in writes of at most
    /// `chunk_size` bytes and renamed into place only after the full body has
    /// been flushed. A body cut short by the server surfaces as a stream error
    /// from reqwest; the byte count is compared with `Content-Length` once more
    /// before the rename. On any failure the part file is removed, so
    /// `destination` never holds a truncated image.
    ///
    /// `on_chunk` is invoked after every write with the running byte count and
    /// the announced total.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError`] if the request fails, a chunk cannot be read
    /// or written, or the byte count does not match the announced length.
    #[instrument(skip(self, on_chunk), fields(url = %url, path = %destination.display()))]
    pub async fn download_to_file<F>(
        &self,
        url: &str,
        destination: &Path,
        chunk_size: usize,
        mut on_chunk: F,
    ) -> Result<DownloadFileResult, DownloadError>
    where
        F: FnMut(u64, Option<u64>),
    {
        let response = self.get(url).await?;
        let content_length = response.content_length().filter(|len| *len > 0);
        let part_path = part_path_for(destination);

        let file = File::create(&part_path)
            .await
            .map_err(|e| DownloadError::io(part_path.clone(), e))?;

        let streamed = stream_to_file(
            file,
            response,
            url,
            &part_path,
            chunk_size.max(1),
            |written| on_chunk(written, content_length),
        )
        .await
        .and_then(|written| match content_length {
            Some(expected) if expected != written => {
                Err(DownloadError::integrity(destination, expected, written))
            }
            _ => Ok(written),
        });

        let bytes_written = match streamed {
            Ok(written) => written,
            Err(error) => {
                debug!(path = %part_path.display(), "removing part file after error");
                if let Err(cleanup) = tokio::fs::remove_file(&part_path).await {
                    warn!(path = %part_path.display(), error = %cleanup, "failed to remove part file");
                }
                return Err(error);
            }
        };

        tokio::fs::rename(&part_path, destination)
            .await
            .map_err(|e| DownloadError::io(destination, e))?;

        debug!(bytes = bytes_written, "download complete");

        Ok(DownloadFileResult {
            path: destination.to_path_buf(),
            bytes_downloaded: bytes_written,
            content_length,
        })
    }

    async fn send_once(&self, url: &str) -> Result<reqwest::Response, DownloadError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| map_reqwest_error(url, e))?;

        if response.status().is_success() {
            return Ok(response);
        }

        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(std::string::ToString::to_string);
        Err(DownloadError::http_status_with_retry_after(
            url,
            response.status().as_u16(),
            retry_after,
        ))
    }
}

/// Returns the in-flight path for `destination` (`<name>.part`).
#[must_use]
pub fn part_path_for(destination: &Path) -> PathBuf {
    let mut name: OsString = destination
        .file_name()
        .map_or_else(|| destination.as_os_str().to_os_string(), ToOwned::to_owned);
    name.push(PART_SUFFIX);
    destination.with_file_name(name)
}

fn map_reqwest_error(url: &str, error: reqwest::Error) -> DownloadError {
    if error.is_timeout() {
        DownloadError::timeout(url)
    } else {
        DownloadError::network(url, error)
    }
}

/// Streams response body to file in `chunk_size` writes, returning bytes written.
async fn stream_to_file(
    file: File,
    response: reqwest::Response,
    url: &str,
    file_path: &Path,
    chunk_size: usize,
    mut on_write: impl FnMut(u64),
) -> Result<u64, DownloadError> {
    let mut writer = BufWriter::new(file);
    let mut stream = response.bytes_stream();
    let mut bytes_written: u64 = 0;

    while let Some(chunk_result) = stream.next().await {
        let chunk = chunk_result.map_err(|e| map_reqwest_error(url, e))?;

        for piece in chunk.chunks(chunk_size) {
            writer
                .write_all(piece)
                .await
                .map_err(|e| DownloadError::io(file_path, e))?;
            bytes_written += piece.len() as u64;
            on_write(bytes_written);
        }
    }

    writer
        .flush()
        .await
        .map_err(|e| DownloadError::io(file_path, e))?;

    Ok(bytes_written)
}
