//! Internal tests module
//!
//! Coordinator scenario tests with full access to crate internals, plus the
//! test doubles shared with per-module unit tests.

pub(crate) mod test_utils;
