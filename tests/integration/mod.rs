// tests/integration/mod.rs

//! Integration tests exercising the live transport paths.

pub mod transport_test;
