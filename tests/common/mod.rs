//! Shared test fixtures (used by functional and integration tests).

pub mod fixtures;
