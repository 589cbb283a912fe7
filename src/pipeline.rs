//! One full mirror pass: catalog, firmware lookup, download, notify.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::catalog::{CatalogError, DeviceFilter, list_eligible_devices};
use crate::config::Config;
use crate::download::{
    DownloadEngine, DownloadTask, EngineError, HttpClient, ProgressTracker, RunResult,
};
use crate::firmware::{firmware_file_name, resolve_latest_firmware};
use crate::notify::Notifier;

/// Errors that end a run early.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The storage directory could not be created.
    #[error("cannot prepare storage directory '{}': {source}", path.display())]
    Storage {
        /// Storage directory path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The device catalog could not be fetched.
    #[error(transparent)]
    Catalog(CatalogError),

    /// The download engine could not be built or run.
    #[error("download engine error: {source}")]
    Engine {
        /// Underlying engine error.
        #[source]
        source: EngineError,
    },

    /// The HTTP session could not be built.
    #[error("failed to build HTTP client: {source}")]
    Client {
        /// Underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },
}

/// Static inputs of every run.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Catalog API base URL.
    pub api_base_url: String,
    /// Where firmware images are stored.
    pub storage_dir: PathBuf,
    /// Live progress file.
    pub progress_log: PathBuf,
    /// Which devices to mirror.
    pub device_filter: DeviceFilter,
}

impl PipelineSettings {
    /// Extracts the run settings from `config`.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            api_base_url: config.api_base_url.clone(),
            storage_dir: config.storage_dir.clone(),
            progress_log: config.progress_log.clone(),
            device_filter: config.device_filter(),
        }
    }
}

/// Summary of one run.
#[derive(Debug)]
pub struct RunReport {
    /// Devices that passed the catalog filter.
    pub eligible_devices: usize,
    /// Devices whose newest image was already on disk.
    pub already_present: usize,
    /// Downloads handed to the engine.
    pub scheduled: usize,
    /// What the engine did.
    pub result: RunResult,
}

impl RunReport {
    /// Paths downloaded in this run, in completion order.
    #[must_use]
    pub fn downloaded(&self) -> &[PathBuf] {
        &self.result.downloaded
    }
}

/// Everything needed to run a mirror pass, built once per process.
pub struct Pipeline {
    client: HttpClient,
    engine: DownloadEngine,
    notifier: Box<dyn Notifier>,
    settings: PipelineSettings,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("engine", &self.engine)
            .field("notifier", &self.notifier.name())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Builds the HTTP session and engine described by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Client`] if the HTTP client cannot be built and
    /// [`PipelineError::Engine`] for an invalid concurrency.
    pub fn from_config(config: &Config, notifier: Box<dyn Notifier>) -> Result<Self, PipelineError> {
        let client = HttpClient::with_settings(
            config.request_timeout(),
            config.connect_timeout(),
            config.retry_policy(),
        )
        .map_err(|source| PipelineError::Client { source })?;
        let engine = DownloadEngine::new(config.engine_options())
            .map_err(|source| PipelineError::Engine { source })?;

        Ok(Self::new(
            client,
            engine,
            notifier,
            PipelineSettings::from_config(config),
        ))
    }

    /// Assembles a pipeline from prebuilt parts.
    #[must_use]
    pub fn new(
        client: HttpClient,
        engine: DownloadEngine,
        notifier: Box<dyn Notifier>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            client,
            engine,
            notifier,
            settings,
        }
    }

    /// Runs one complete pass.
    ///
    /// Per-device lookup failures and individual download failures are logged
    /// and skipped. Only an unusable storage directory or an unreachable
    /// catalog abort the pass.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError`] when the run cannot proceed at all.
    #[instrument(skip(self), fields(storage_dir = %self.settings.storage_dir.display()))]
    pub async fn run_once(&self) -> Result<RunReport, PipelineError> {
        ensure_storage_dir(&self.settings.storage_dir).map_err(|source| {
            PipelineError::Storage {
                path: self.settings.storage_dir.clone(),
                source,
            }
        })?;

        info!("Starting to get the latest IPSW files...");

        let devices = list_eligible_devices(
            &self.client,
            &self.settings.api_base_url,
            &self.settings.device_filter,
        )
        .await
        .map_err(PipelineError::Catalog)?;

        let mut tasks = Vec::new();
        let mut destinations = HashSet::new();
        let mut already_present = 0usize;

        for device in &devices {
            let Some(firmware) =
                resolve_latest_firmware(&self.client, &self.settings.api_base_url, device).await
            else {
                continue;
            };

            let file_name = match firmware_file_name(&firmware.url) {
                Ok(name) => name,
                Err(error) => {
                    warn!(device = %device.name, error = %error, "skipping firmware");
                    continue;
                }
            };
            let destination = self.settings.storage_dir.join(&file_name);

            if destination.exists() {
                debug!(path = %destination.display(), "firmware already on disk");
                already_present += 1;
                continue;
            }
            if !destinations.insert(destination.clone()) {
                warn!(path = %destination.display(), device = %device.name, "destination already scheduled this run");
                continue;
            }

            info!(
                "Scheduling download for {} for {} ({})...",
                file_name, device.name, device.identifier
            );
            tasks.push(DownloadTask {
                device: device.clone(),
                source_url: firmware.url,
                destination,
            });
        }

        let scheduled = tasks.len();
        let result = self.download(tasks).await?;

        if result.downloaded.is_empty() {
            info!("All downloads have been already completed. No further action required.");
        } else if let Err(error) = self.notifier.notify(&result.downloaded).await {
            error!(notifier = self.notifier.name(), error = %error, "Failed to send notification");
        } else {
            info!(notifier = self.notifier.name(), files = result.downloaded.len(), "notification sent");
        }

        Ok(RunReport {
            eligible_devices: devices.len(),
            already_present,
            scheduled,
            result,
        })
    }

    /// Runs one pass and logs any failure instead of returning it.
    pub async fn run_logged(&self) {
        match self.run_once().await {
            Ok(report) => info!(
                eligible = report.eligible_devices,
                already_present = report.already_present,
                scheduled = report.scheduled,
                downloaded = report.result.downloaded.len(),
                failed = report.result.failed.len(),
                "run finished"
            ),
            Err(error) => error!("An error occurred: {error}"),
        }
    }

    async fn download(&self, tasks: Vec<DownloadTask>) -> Result<RunResult, PipelineError> {
        if tasks.is_empty() {
            return Ok(RunResult::default());
        }

        if let Some(parent) = self.settings.progress_log.parent()
            && !parent.as_os_str().is_empty()
            && let Err(error) = std::fs::create_dir_all(parent)
        {
            warn!(path = %parent.display(), %error, "cannot create progress log directory");
        }

        let (progress, aggregator) = ProgressTracker::spawn(&self.settings.progress_log);
        let result = self.engine.run_batch(&self.client, tasks, &progress).await;
        drop(progress);
        if let Err(error) = aggregator.await {
            warn!(%error, "progress aggregator panicked");
        }

        result.map_err(|source| PipelineError::Engine { source })
    }
}

/// Creates the storage directory if needed, logging which case applied.
///
/// Returns `true` when the directory was created.
///
/// # Errors
///
/// Returns the IO error if the directory cannot be created.
pub fn ensure_storage_dir(path: &Path) -> std::io::Result<bool> {
    if path.is_dir() {
        info!("Directory already exists: {}", path.display());
        return Ok(false);
    }
    std::fs::create_dir_all(path)?;
    info!("Created directory: {}", path.display());
    Ok(true)
}
