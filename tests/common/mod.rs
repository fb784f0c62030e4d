//! Shared helpers for the integration tests.

#![allow(dead_code)] // Each test binary uses a different subset

pub mod builders;
pub mod harness;

pub use builders::*;
pub use harness::*;
