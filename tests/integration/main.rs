// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Integration tests for innodb-cluster-admin
//!
//! These tests require three disposable MySQL 8.0 servers with group
//! replication available. Tests are marked with #[ignore] and must be run
//! explicitly:
//!
//! ```bash
//! export ICADMIN_TEST_INSTANCES="root:root@db1:3306,root:root@db2:3306,root:root@db3:3306"
//!
//! # Run all integration tests (serially, they share the servers)
//! cargo test --test integration -- --ignored --test-threads=1
//!
//! # Run specific test
//! cargo test --test integration test_cluster_lifecycle -- --ignored
//! ```
//!
//! Every test starts by dropping whatever cluster a previous run left behind
//! and finishes by dissolving its own.

// Test infrastructure modules
pub mod fixtures;

// Test modules
mod failure_tests;
mod lifecycle_tests;

pub use fixtures::*;
