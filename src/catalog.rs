//! Device catalog fetch and eligibility filtering.
//!
//! The catalog API lists every device it knows about. A device is eligible for
//! mirroring when its name contains one of the configured substrings and its
//! release year, looked up in a static table keyed by identifier, is at least
//! the cutoff year.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument};
use url::Url;

use crate::download::{DownloadError, HttpClient};

/// Default catalog API base URL.
pub const DEFAULT_API_BASE_URL: &str = "https://api.ipsw.me/v4";

/// Default earliest release year to mirror.
pub const DEFAULT_CUTOFF_YEAR: u16 = 2020;

/// Device name substrings mirrored by default.
pub const DEFAULT_DEVICE_FILTERS: [&str; 2] = ["iPhone", "iPad"];

/// Release year per device identifier.
const RELEASE_YEARS: &[(&str, u16)] = &[
    ("iPhone12,8", 2020),
    ("iPhone13,1", 2020),
    ("iPhone13,2", 2020),
    ("iPhone13,3", 2020),
    ("iPhone13,4", 2020),
    ("iPhone14,2", 2021),
    ("iPhone14,3", 2021),
    ("iPhone14,4", 2021),
    ("iPhone14,5", 2021),
    ("iPhone14,6", 2022),
    ("iPhone14,7", 2022),
    ("iPhone14,8", 2022),
    ("iPhone15,2", 2022),
    ("iPhone15,3", 2022),
    ("iPhone15,4", 2023),
    ("iPhone15,5", 2023),
    ("iPhone16,1", 2023),
    ("iPhone16,2", 2023),
    ("iPhone17,1", 2024),
    ("iPhone17,2", 2024),
    ("iPhone17,3", 2024),
    ("iPhone17,4", 2024),
    ("iPad8,9", 2020),
    ("iPad8,10", 2020),
    ("iPad8,11", 2020),
    ("iPad8,12", 2020),
    ("iPad11,6", 2020),
    ("iPad11,7", 2020),
    ("iPad13,1", 2020),
    ("iPad13,2", 2020),
    ("iPad12,1", 2021),
    ("iPad12,2", 2021),
    ("iPad13,4", 2021),
    ("iPad13,5", 2021),
    ("iPad13,6", 2021),
    ("iPad13,7", 2021),
    ("iPad13,8", 2021),
    ("iPad13,9", 2021),
    ("iPad13,10", 2021),
    ("iPad13,11", 2021),
    ("iPad14,1", 2021),
    ("iPad14,2", 2021),
    ("iPad13,16", 2022),
    ("iPad13,17", 2022),
    ("iPad13,18", 2022),
    ("iPad13,19", 2022),
    ("iPad14,3", 2022),
    ("iPad14,4", 2022),
    ("iPad14,5", 2022),
    ("iPad14,6", 2022),
    ("iPad14,8", 2023),
    ("iPad14,9", 2023),
    ("iPad14,10", 2023),
    ("iPad14,11", 2023),
    ("iPad16,3", 2023),
    ("iPad16,4", 2023),
    ("iPad16,5", 2023),
    ("iPad16,6", 2023),
    ("iPad16,1", 2024),
    ("iPad16,2", 2024),
];

/// Returns the built-in release-year table.
#[must_use]
pub fn default_release_years() -> BTreeMap<String, u16> {
    RELEASE_YEARS
        .iter()
        .map(|(id, year)| ((*id).to_string(), *year))
        .collect()
}

/// A device as listed by the catalog API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Hardware identifier, e.g. `iPhone16,1`.
    pub identifier: String,
    /// Marketing name, e.g. `iPhone 15 Pro`.
    pub name: String,
    /// Release year from the static table; not part of the API payload.
    #[serde(skip)]
    pub release_year: Option<u16>,
}

/// Which devices to mirror.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFilter {
    /// A device qualifies if its name contains any of these.
    pub name_filters: Vec<String>,
    /// Earliest release year to keep.
    pub cutoff_year: u16,
    /// Identifier to release-year table.
    pub release_years: BTreeMap<String, u16>,
}

impl Default for DeviceFilter {
    fn default() -> Self {
        Self {
            name_filters: DEFAULT_DEVICE_FILTERS.iter().map(ToString::to_string).collect(),
            cutoff_year: DEFAULT_CUTOFF_YEAR,
            release_years: default_release_years(),
        }
    }
}

impl DeviceFilter {
    /// Release year of `identifier`, or 0 when the table does not know it.
    #[must_use]
    pub fn year_of(&self, identifier: &str) -> u16 {
        self.release_years.get(identifier).copied().unwrap_or(0)
    }

    /// Whether a device with this name and year should be mirrored.
    #[must_use]
    pub fn accepts(&self, name: &str, year: u16) -> bool {
        year >= self.cutoff_year && self.name_filters.iter().any(|f| name.contains(f.as_str()))
    }
}

/// Errors raised while fetching the device catalog.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// The configured API base could not be turned into a request URL.
    #[error("invalid catalog base URL: {base}")]
    InvalidBase {
        /// The offending base URL.
        base: String,
    },

    /// The catalog request failed after retries, or returned a malformed body.
    #[error("failed to fetch device catalog: {source}")]
    Fetch {
        /// Underlying request error.
        #[source]
        source: DownloadError,
    },
}

/// Joins path segments onto the API base URL.
pub(crate) fn api_url(base: &str, segments: &[&str]) -> Option<Url> {
    let mut url = Url::parse(base).ok()?;
    {
        let mut path = url.path_segments_mut().ok()?;
        path.pop_if_empty();
        path.extend(segments);
    }
    Some(url)
}

/// Fetches the catalog and returns the eligible devices, newest first.
///
/// # Errors
///
/// Returns [`CatalogError`] when the catalog cannot be fetched or decoded.
/// This is fatal for the run: without a catalog there is nothing to resolve.
#[instrument(skip(client, filter), fields(api_base = %api_base))]
pub async fn list_eligible_devices(
    client: &HttpClient,
    api_base: &str,
    filter: &DeviceFilter,
) -> Result<Vec<Device>, CatalogError> {
    let url = api_url(api_base, &["devices"]).ok_or_else(|| CatalogError::InvalidBase {
        base: api_base.to_string(),
    })?;

    let devices: Vec<Device> = client
        .get_json(url.as_str())
        .await
        .map_err(|source| CatalogError::Fetch { source })?;

    let total = devices.len();
    let eligible = select_eligible(devices, filter);
    info!(total, eligible = eligible.len(), "fetched device catalog");
    Ok(eligible)
}

/// Attaches release years, sorts newest first and keeps the eligible devices.
///
/// The sort is stable, so devices from the same year keep catalog order.
/// Duplicate identifiers are dropped after the first occurrence.
#[must_use]
pub fn select_eligible(devices: Vec<Device>, filter: &DeviceFilter) -> Vec<Device> {
    let mut devices: Vec<Device> = devices
        .into_iter()
        .map(|mut device| {
            device.release_year = filter.release_years.get(&device.identifier).copied();
            device
        })
        .collect();

    devices.sort_by_key(|d| std::cmp::Reverse(d.release_year.unwrap_or(0)));

    let mut seen = HashSet::new();
    devices
        .into_iter()
        .filter(|device| {
            let keep = filter.accepts(&device.name, device.release_year.unwrap_or(0));
            if !keep {
                debug!(identifier = %device.identifier, name = %device.name, "device not eligible");
            }
            keep
        })
        .filter(|device| seen.insert(device.identifier.clone()))
        .collect()
}
