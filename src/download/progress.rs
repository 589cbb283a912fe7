//! Live download progress, persisted by a single aggregator task.
//!
//! Download workers never touch the progress log directly. They send
//! [`ProgressSnapshot`]s through a [`ProgressHandle`]; the task started by
//! [`ProgressTracker::spawn`] owns the per-device map and rewrites the whole
//! file after every update, one line per device.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Local};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const BYTES_PER_MIB: f64 = 1024.0 * 1024.0;
const BYTES_PER_GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Latest transfer state of one in-flight download.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    /// Device display name; the key of the progress map.
    pub device: String,
    /// Percent complete, `None` when the server sent no usable Content-Length.
    pub percentage: Option<f64>,
    /// Bytes written so far.
    pub downloaded_bytes: u64,
    /// Average speed since the transfer started, in MiB/s.
    pub speed_mbps: f64,
    /// Wall time since the transfer started.
    pub elapsed: Duration,
    /// When this snapshot was taken.
    pub updated_at: DateTime<Local>,
}

impl ProgressSnapshot {
    /// Derives a snapshot from raw transfer counters.
    ///
    /// A missing or zero `total_bytes` yields an unknown percentage rather
    /// than a division by zero.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn from_transfer(
        device: impl Into<String>,
        downloaded_bytes: u64,
        total_bytes: Option<u64>,
        elapsed: Duration,
    ) -> Self {
        let percentage = total_bytes
            .filter(|total| *total > 0)
            .map(|total| downloaded_bytes as f64 / total as f64 * 100.0);

        let secs = elapsed.as_secs_f64();
        let speed_mbps = if secs > 0.0 {
            downloaded_bytes as f64 / secs / BYTES_PER_MIB
        } else {
            0.0
        };

        Self {
            device: device.into(),
            percentage,
            downloaded_bytes,
            speed_mbps,
            elapsed,
            updated_at: Local::now(),
        }
    }

    /// Forces the percentage to 100, used for the final snapshot of a finished download.
    #[must_use]
    pub fn completed(mut self) -> Self {
        self.percentage = Some(100.0);
        self
    }

    /// Renders this snapshot as a progress log line.
    ///
    /// ```
    /// use std::time::Duration;
    /// use ipsw_downloader_core::download::ProgressSnapshot;
    ///
    /// let snapshot = ProgressSnapshot::from_transfer("iPhone 15", 512, Some(1024), Duration::from_secs(5));
    /// assert!(snapshot.to_line().contains("iPhone 15: 50.00% downloaded"));
    /// ```
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn to_line(&self) -> String {
        let pct = self
            .percentage
            .map_or_else(|| "unknown".to_string(), |p| format!("{p:.2}"));
        format!(
            "{} - {}: {}% downloaded, {:.2} GB downloaded, download speed: {:.2} MB/s, time elapsed: {}",
            self.updated_at.format("%Y-%m-%d %H:%M:%S"),
            self.device,
            pct,
            self.downloaded_bytes as f64 / BYTES_PER_GIB,
            self.speed_mbps,
            format_elapsed(self.elapsed),
        )
    }
}

/// Formats a duration as `Hh Mm Ss`, `Mm Ss`, or `Ss`, dropping leading zero units.
#[must_use]
pub fn format_elapsed(elapsed: Duration) -> String {
    let total = elapsed.as_secs();
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

/// Sending side of the progress aggregator. Cheap to clone, one per worker.
#[derive(Debug, Clone)]
pub struct ProgressHandle {
    tx: mpsc::UnboundedSender<ProgressSnapshot>,
}

impl ProgressHandle {
    /// Returns a handle whose updates go nowhere.
    #[must_use]
    pub fn detached() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { tx }
    }

    /// Publishes a snapshot. Silently dropped if the aggregator has stopped.
    pub fn update(&self, snapshot: ProgressSnapshot) {
        if self.tx.send(snapshot).is_err() {
            debug!("progress aggregator gone, dropping update");
        }
    }
}

/// Spawns the single writer of the progress log.
#[derive(Debug)]
pub struct ProgressTracker;

impl ProgressTracker {
    /// Starts the aggregator writing to `path`.
    ///
    /// The task exits once every [`ProgressHandle`] clone has been dropped,
    /// so await the returned join handle to be sure the last update landed.
    #[must_use]
    pub fn spawn(path: impl Into<PathBuf>) -> (ProgressHandle, JoinHandle<()>) {
        let path = path.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<ProgressSnapshot>();

        let task = tokio::spawn(async move {
            let mut snapshots: Vec<ProgressSnapshot> = Vec::new();
            while let Some(snapshot) = rx.recv().await {
                upsert(&mut snapshots, snapshot);
                // Coalesce whatever queued up while we were writing.
                while let Ok(snapshot) = rx.try_recv() {
                    upsert(&mut snapshots, snapshot);
                }
                if let Err(error) = tokio::fs::write(&path, render(&snapshots)).await {
                    warn!(path = %path.display(), %error, "failed to write progress log");
                }
            }
            debug!(devices = snapshots.len(), "progress aggregator stopped");
        });

        (ProgressHandle { tx }, task)
    }
}

fn upsert(snapshots: &mut Vec<ProgressSnapshot>, snapshot: ProgressSnapshot) {
    match snapshots.iter_mut().find(|s| s.device == snapshot.device) {
        Some(existing) => *existing = snapshot,
        None => snapshots.push(snapshot),
    }
}

/// Renders every device's line in first-seen order.
fn render(snapshots: &[ProgressSnapshot]) -> String {
    snapshots
        .iter()
        .map(ProgressSnapshot::to_line)
        .collect::<Vec<_>>()
        .join("\n")
}
