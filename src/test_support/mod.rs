//! Helpers shared by unit tests.

pub mod capture;
pub mod socket_guard;
