//! IPSW Downloader Core Library
//!
//! Mirrors the newest firmware image of every eligible device from a public
//! firmware catalog into a local directory, once at startup and then daily.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`download`] - Retrying HTTP session, streaming downloads, batch engine, progress
//! - [`catalog`] - Device catalog fetch and eligibility filter
//! - [`firmware`] - Latest-firmware lookup per device
//! - [`notify`] - End-of-run notification
//! - [`pipeline`] - One full mirror pass
//! - [`scheduler`] - Startup and daily runs
//! - [`config`] - TOML configuration
//! - [`logging`] - Console and detailed-log subscriber

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod catalog;
pub mod config;
pub mod download;
pub mod firmware;
pub mod logging;
pub mod notify;
pub mod pipeline;
pub mod scheduler;
#[cfg(test)]
pub mod test_support;
pub(crate) mod user_agent;

// Re-export commonly used types
pub use catalog::{CatalogError, Device, DeviceFilter, list_eligible_devices, select_eligible};
pub use config::{Config, ConfigError, LoadedConfig, load_config};
pub use download::{
    DEFAULT_CONCURRENCY, DownloadEngine, DownloadError, DownloadTask, EngineError, EngineOptions,
    FailureType, HttpClient, ProgressHandle, ProgressSnapshot, ProgressTracker, RetryDecision,
    RetryPolicy, RunResult, classify_error,
};
pub use firmware::{FirmwareEntry, FirmwareError, resolve_latest_firmware, select_latest};
pub use notify::{LogNotifier, NoopNotifier, NotificationError, Notifier};
pub use pipeline::{Pipeline, PipelineError, PipelineSettings, RunReport};
pub use scheduler::{Scheduler, next_run_after};
