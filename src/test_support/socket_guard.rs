//! Lets wiremock-based tests skip where localhost sockets are unavailable.

use std::net::TcpListener;
use std::panic::Location;

use wiremock::MockServer;

const REQUIRE_ENV: &str = "IPSW_REQUIRE_SOCKET_TESTS";

fn socket_tests_required() -> bool {
    std::env::var(REQUIRE_ENV)
        .is_ok_and(|value| matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
}

/// Starts a mock server, or returns `None` (after a note on stderr) when
/// binding a localhost port is not permitted.
///
/// # Panics
///
/// Panics instead of skipping when `IPSW_REQUIRE_SOCKET_TESTS` is set.
#[track_caller]
pub fn start_mock_server_or_skip() -> impl std::future::Future<Output = Option<MockServer>> {
    let location = Location::caller();
    let can_bind = TcpListener::bind("127.0.0.1:0").is_ok();

    async move {
        if can_bind {
            return Some(MockServer::start().await);
        }
        let message = format!(
            "[socket-bound-test] {}:{} cannot bind a localhost port",
            location.file(),
            location.line()
        );
        assert!(!socket_tests_required(), "{message} and {REQUIRE_ENV} is set");
        eprintln!("{message}; skipping");
        None
    }
}
