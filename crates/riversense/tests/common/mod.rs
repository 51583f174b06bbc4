//! Shared test utilities for riversense integration tests.
//!
//! This module provides:
//! - `TestHarness` wiring store, queue and artifact directory over a temp dir
//! - Fake converters and storages with scripted behaviour

pub mod fakes;
pub mod harness;

pub use fakes::*;
pub use harness::TestHarness;
