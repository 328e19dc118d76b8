//! Test utilities for drydock unit tests.
//!
//! Only available under `cfg(test)`. Provides throwaway workspaces,
//! closure-backed rule generators, and instrumented executors.

pub mod fixtures;
