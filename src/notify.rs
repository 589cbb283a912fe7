//! End-of-run notification about newly downloaded firmware.

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};

/// Subject line used for download summaries.
pub const NOTIFICATION_SUBJECT: &str = "IPSW Download Notification";

const BODY_HEADER: &str = "The following IPSW files have been downloaded:";

/// A notification could not be delivered.
///
/// Delivery failures are logged by the caller and never change a run's outcome.
#[derive(Debug, Error)]
pub enum NotificationError {
    /// The notifier backend rejected or failed to send the message.
    #[error("notification delivery failed: {reason}")]
    Delivery {
        /// Backend-specific failure description.
        reason: String,
    },
}

/// Receives the paths downloaded during a run.
///
/// Only called when at least one file was downloaded.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Short backend name for log fields.
    fn name(&self) -> &str;

    /// Sends the summary for `downloaded`, given in completion order.
    async fn notify(&self, downloaded: &[PathBuf]) -> Result<(), NotificationError>;
}

/// Builds the plain-text summary body.
///
/// ```
/// use std::path::PathBuf;
/// use ipsw_downloader_core::notify::compose_body;
///
/// let body = compose_body(&[PathBuf::from("/srv/ipsw/a.ipsw")], &[]);
/// assert_eq!(body, "The following IPSW files have been downloaded:\n/srv/ipsw/a.ipsw");
/// ```
#[must_use]
pub fn compose_body(downloaded: &[PathBuf], viewer_links: &[String]) -> String {
    let mut body = String::from(BODY_HEADER);
    for path in downloaded {
        body.push('\n');
        body.push_str(&path.display().to_string());
    }
    if !viewer_links.is_empty() {
        body.push_str("\n\nTo check the downloaded updates view here: ");
        body.push_str(&viewer_links.join(", "));
    }
    body
}

/// Writes the summary to the log at info level.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier {
    viewer_links: Vec<String>,
}

impl LogNotifier {
    /// Creates a notifier that appends `viewer_links` to every summary.
    #[must_use]
    pub fn new(viewer_links: Vec<String>) -> Self {
        Self { viewer_links }
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn notify(&self, downloaded: &[PathBuf]) -> Result<(), NotificationError> {
        debug!(subject = NOTIFICATION_SUBJECT, files = downloaded.len(), "writing summary to log");
        // One event per body line.
        for line in compose_body(downloaded, &self.viewer_links)
            .lines()
            .filter(|line| !line.is_empty())
        {
            info!("{line}");
        }
        Ok(())
    }
}

/// Discards every notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    fn name(&self) -> &str {
        "noop"
    }

    async fn notify(&self, _downloaded: &[PathBuf]) -> Result<(), NotificationError> {
        Ok(())
    }
}
