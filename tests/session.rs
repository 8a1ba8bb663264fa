//! Session integration tests.
//!
//! Whole sessions (a host and its clients) run on one in-memory network and are stepped in
//! lock-step from the test thread:
//! - lifecycle: hosting, joining, rejection, closing
//! - resync: membership changes and the reset rounds they trigger
//! - protocol: hand-crafted control traffic against a live host
//! - determinism: every player computes the same frames

// Allow test-specific patterns that are appropriate for test code
#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::cast_possible_truncation
)]

// Shared test infrastructure
#[path = "common/mod.rs"]
mod common;

mod session {
    pub mod determinism;
    pub mod lifecycle;
    pub mod protocol;
    pub mod resync;
}
