//! Latest-firmware lookup for a single device.

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::catalog::{Device, api_url};
use crate::download::{DownloadError, HttpClient};

/// One downloadable firmware build.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FirmwareEntry {
    /// Version string as published, e.g. `17.5.1`.
    pub version: String,
    /// Download URL of the image.
    pub url: String,
    /// Build identifier, when the API provides it.
    #[serde(default)]
    pub buildid: Option<String>,
    /// Image size in bytes, when the API provides it.
    #[serde(default)]
    pub filesize: Option<u64>,
    /// Whether the build is still being signed.
    #[serde(default)]
    pub signed: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct FirmwareListing {
    #[serde(default)]
    firmwares: Vec<FirmwareEntry>,
}

/// Why no firmware could be chosen for a device.
#[derive(Debug, Error)]
pub enum FirmwareError {
    /// The configured API base could not be turned into a request URL.
    #[error("invalid firmware lookup URL for {identifier}")]
    InvalidUrl {
        /// Device identifier being looked up.
        identifier: String,
    },

    /// The firmware request failed after retries, or returned a malformed body.
    #[error("failed to fetch firmware list for {identifier}: {source}")]
    Fetch {
        /// Device identifier being looked up.
        identifier: String,
        /// Underlying request error.
        #[source]
        source: DownloadError,
    },

    /// The device has no published firmware.
    #[error("no firmware published for {identifier}")]
    Empty {
        /// Device identifier being looked up.
        identifier: String,
    },

    /// The firmware URL has no usable file name.
    #[error("cannot derive a file name from {url}")]
    NoFileName {
        /// The firmware URL.
        url: String,
    },
}

/// Fetches a device's firmware list and picks the newest entry.
///
/// # Errors
///
/// Returns [`FirmwareError`] if the lookup fails or the device has no firmware.
#[instrument(skip(client, device), fields(identifier = %device.identifier))]
pub async fn fetch_latest_firmware(
    client: &HttpClient,
    api_base: &str,
    device: &Device,
) -> Result<FirmwareEntry, FirmwareError> {
    let mut url = api_url(api_base, &["device", &device.identifier]).ok_or_else(|| {
        FirmwareError::InvalidUrl {
            identifier: device.identifier.clone(),
        }
    })?;
    url.query_pairs_mut().append_pair("type", "ipsw");

    let listing: FirmwareListing =
        client
            .get_json(url.as_str())
            .await
            .map_err(|source| FirmwareError::Fetch {
                identifier: device.identifier.clone(),
                source,
            })?;

    debug!(count = listing.firmwares.len(), "fetched firmware list");

    select_latest(listing.firmwares).ok_or_else(|| FirmwareError::Empty {
        identifier: device.identifier.clone(),
    })
}

/// Like [`fetch_latest_firmware`], but logs the failure and yields `None`.
///
/// A device without resolvable firmware is skipped for this run; it never
/// fails the run as a whole.
pub async fn resolve_latest_firmware(
    client: &HttpClient,
    api_base: &str,
    device: &Device,
) -> Option<FirmwareEntry> {
    match fetch_latest_firmware(client, api_base, device).await {
        Ok(entry) => Some(entry),
        Err(error) => {
            warn!(
                device = %device.name,
                identifier = %device.identifier,
                error = %error,
                "skipping device without resolvable firmware"
            );
            None
        }
    }
}

/// Picks the entry whose `version` sorts last as a plain string.
///
/// Versions are compared lexically, not numerically, so `"9.9"` outranks
/// `"10.1"`. Among equal versions the first listed wins.
///
/// ```
/// use ipsw_downloader_core::firmware::{FirmwareEntry, select_latest};
///
/// let entry = |v: &str| FirmwareEntry {
///     version: v.to_string(),
///     url: format!("https://example.com/{v}.ipsw"),
///     buildid: None,
///     filesize: None,
///     signed: None,
/// };
/// let latest = select_latest(vec![entry("10.1"), entry("9.9")]).unwrap();
/// assert_eq!(latest.version, "9.9");
/// ```
#[must_use]
pub fn select_latest(mut entries: Vec<FirmwareEntry>) -> Option<FirmwareEntry> {
    entries.sort_by(|a, b| b.version.cmp(&a.version));
    entries.into_iter().next()
}

/// Derives the on-disk file name from a firmware URL's last path segment.
///
/// The segment is percent-decoded; path separators and control characters
/// are replaced so the result always names a file directly inside the
/// storage directory.
///
/// # Errors
///
/// Returns [`FirmwareError::NoFileName`] when the URL has no usable last segment.
pub fn firmware_file_name(url: &str) -> Result<String, FirmwareError> {
    let no_name = || FirmwareError::NoFileName {
        url: url.to_string(),
    };

    let parsed = Url::parse(url).map_err(|_| no_name())?;
    let segment = parsed
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|s| !s.is_empty())
        .ok_or_else(no_name)?;

    let decoded = urlencoding::decode(segment).map_err(|_| no_name())?;
    let name = sanitize_file_name(&decoded);
    if name.is_empty() || name == "." || name == ".." {
        return Err(no_name());
    }
    Ok(name)
}

fn sanitize_file_name(value: &str) -> String {
    value
        .chars()
        .map(|c| match c {
            '/' | '\\' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect::<String>()
        .trim()
        .to_string()
}
