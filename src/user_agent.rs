//! User-Agent string shared by catalog and firmware download requests.

/// Default User-Agent for every request (identifies the tool and version).
#[must_use]
pub(crate) fn default_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("ipsw-downloader/{version} (firmware-mirror)")
}
