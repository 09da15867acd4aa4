// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Functional tests for cluster administration.
//!
//! These tests drive the public API end to end against the in-process
//! sandbox deployment, WITHOUT requiring MySQL servers. Servers are deployed,
//! killed and restarted through the sandbox to produce quorum loss and
//! complete outages.
//!
//! ```bash
//! # Run all functional tests
//! cargo test --test functional
//!
//! # Run specific test
//! cargo test --test functional test_force_quorum_then_rejoin
//! ```
//!
//! ## Test Categories
//!
//! - **Membership tests**: add, remove, rejoin, dissolve and rescan
//! - **Recovery tests**: quorum loss and complete outage
//! - **Topology tests**: mode switches, primary election and options
//! - **Version tests**: server version gates at every entry point

#[path = "../common/mod.rs"]
mod common;

mod membership_tests;
mod recovery_tests;
mod topology_tests;
mod version_tests;
