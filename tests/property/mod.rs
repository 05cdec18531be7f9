// tests/property/mod.rs

//! Property-based tests for shardd
//!
//! These tests use property-based testing to verify invariants and properties
//! that should always hold, regardless of input values.

pub mod escalation_test;
pub mod forwarding_test;
pub mod placement_test;
