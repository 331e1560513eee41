//! Simulator integration test suite.
//!
//! This crate-level test target organizes the component-level scenario
//! tests and their shared infrastructure.

/// Shared test infrastructure: mock upstream and downstream channel
/// drivers and fixture helpers.
pub mod common;

/// Scenario tests for the cache, DRAM, core, and full machine.
pub mod unit;
