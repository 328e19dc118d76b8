//! Drydock - the execution core of an incremental build engine.
//!
//! Given a set of requested output artifacts, drydock determines which rules
//! must run, in what order, with what inputs, runs each at most once per
//! unique specification, and caches results across invocations.
//!
//! The crate provides:
//! - lazy, memoized per-directory rule discovery ([`RuleGenerator`]);
//! - the dependency-recording computation abstraction ([`Build`]) used both
//!   to declare build requests and to describe rule actions;
//! - a concurrent execution engine ([`Session::do_build`]) that deduplicates
//!   in-flight work and surfaces dependency cycles;
//! - named target sets per directory ([`AliasRequest`]);
//! - an optional content-addressed cache with probabilistic verification
//!   ([`CacheConfig`]).

pub mod core;
pub mod engine;
pub mod ops;
pub mod util;

/// Test fixtures and instrumented collaborators for drydock unit tests.
#[cfg(test)]
pub mod test_support;

pub use crate::core::{
    deps::{AliasRequest, Dep, DepSet},
    path::{BuildPath, BuildScope, Layout, TargetPath},
    select::FileSelector,
    subdir::SubdirSet,
};
pub use crate::engine::{
    build::{env, select, Build, ResolvedDeps},
    cache::{CacheBackend, CacheConfig, CacheEntry, CachedOutput, CacheKey, LocalCache},
    errors::{BuildError, Result},
    executor::{ActionExecutor, ActionInvocation, ActionOutcome, LocalExecutor, SandboxMode},
    loader::{LoadedDir, RuleGenerator, RuleScope},
    rules::{Action, EvaluatedRule, RuleId},
    session::{EngineConfig, GeneratorKey, PackageAssign, Session, VcsEnumerator, VcsTree},
};
pub use crate::util::diagnostic::{Diagnostic, Severity};
