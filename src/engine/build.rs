//! The dependency-recording build computation.
//!
//! A `Build<T>` is a pure description of "a value of `T`, plus the
//! dependencies needed to produce it". It is used both as the request handed
//! to the engine and as the body of a rule's action producer. Dependencies
//! accumulate in an explicit set carried alongside the continuation, so the
//! declared set is auditable without running anything.
//!
//! Continuations only ever see a [`ResolvedDeps`] view: environment values
//! and selector matches. File contents are never observable during the
//! declaration phase, which keeps evaluation referentially transparent for a
//! fixed dependency resolution.
//!
//! Dynamic dependencies (`and_then`) are evaluated in rounds: the engine
//! resolves the currently declared set, applies the continuation, and
//! repeats until a final value is produced.

use std::collections::BTreeMap;

use crate::core::deps::{AliasRequest, Dep, DepSet};
use crate::core::path::TargetPath;
use crate::core::select::FileSelector;
use crate::engine::errors::Result;

/// The resolved view of one or more declaration rounds: environment values
/// and selector matches, keyed by the dependency that produced them.
#[derive(Debug, Default)]
pub struct ResolvedDeps {
    env: BTreeMap<String, Option<String>>,
    selections: BTreeMap<FileSelector, Vec<TargetPath>>,
}

impl ResolvedDeps {
    /// The value of an environment variable dependency, if set.
    pub fn env_value(&self, name: &str) -> Option<&str> {
        self.env.get(name).and_then(|v| v.as_deref())
    }

    /// The matches of a selector dependency.
    pub fn selection(&self, selector: &FileSelector) -> &[TargetPath] {
        self.selections
            .get(selector)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub(crate) fn record_env(&mut self, name: String, value: Option<String>) {
        self.env.insert(name, value);
    }

    pub(crate) fn record_selection(&mut self, selector: FileSelector, matches: Vec<TargetPath>) {
        self.selections.insert(selector, matches);
    }

    /// Merge another round's resolution into this one.
    pub(crate) fn merge(&mut self, other: ResolvedDeps) {
        self.env.extend(other.env);
        self.selections.extend(other.selections);
    }
}

type ValueFn<T> = Box<dyn FnOnce(&ResolvedDeps) -> Result<T> + Send>;
type ChainFn<T> = Box<dyn FnOnce(&ResolvedDeps) -> Result<Build<T>> + Send>;

pub(crate) enum Step<T> {
    /// Produce the final value from this round's resolution.
    Value(ValueFn<T>),
    /// Produce the next round's computation from this round's resolution.
    Chain(ChainFn<T>),
}

/// A composable, dependency-recording description of a computation.
pub struct Build<T> {
    deps: DepSet,
    step: Step<T>,
}

impl<T: Send + 'static> Build<T> {
    /// A computation with no dependencies.
    pub fn pure(value: T) -> Build<T> {
        Build {
            deps: DepSet::new(),
            step: Step::Value(Box::new(move |_| Ok(value))),
        }
    }

    /// A computation that fails when evaluated.
    pub fn fail(error: crate::engine::errors::BuildError) -> Build<T> {
        Build {
            deps: DepSet::new(),
            step: Step::Value(Box::new(move |_| Err(error))),
        }
    }

    /// Map the result.
    pub fn map<U, F>(self, f: F) -> Build<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let Build { deps, step } = self;
        let step = match step {
            Step::Value(g) => {
                Step::Value(Box::new(move |r: &ResolvedDeps| Ok(f(g(r)?))) as ValueFn<U>)
            }
            Step::Chain(g) => {
                Step::Chain(Box::new(move |r: &ResolvedDeps| Ok(g(r)?.map(f))) as ChainFn<U>)
            }
        };
        Build { deps, step }
    }

    /// Sequence: the continuation may declare further dependencies, which
    /// the engine resolves in a later round.
    pub fn and_then<U, F>(self, f: F) -> Build<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> Build<U> + Send + 'static,
    {
        let Build { deps, step } = self;
        let chain: ChainFn<U> = match step {
            Step::Value(g) => Box::new(move |r| Ok(f(g(r)?))),
            Step::Chain(g) => Box::new(move |r| Ok(g(r)?.and_then(f))),
        };
        Build {
            deps,
            step: Step::Chain(chain),
        }
    }

    /// Parallel combination: dependencies of both sides are declared
    /// together, and both results are produced.
    pub fn zip<U: Send + 'static>(self, other: Build<U>) -> Build<(T, U)> {
        let deps = self.deps.union(other.deps);
        let step = match (self.step, other.step) {
            (Step::Value(a), Step::Value(b)) => {
                Step::Value(Box::new(move |r: &ResolvedDeps| Ok((a(r)?, b(r)?))) as ValueFn<(T, U)>)
            }
            (sa, sb) => Step::Chain(Box::new(move |r: &ResolvedDeps| {
                let a = advance(sa, r)?;
                let b = advance(sb, r)?;
                Ok(a.zip(b))
            }) as ChainFn<(T, U)>),
        };
        Build { deps, step }
    }

    /// Combine two computations with a function.
    pub fn map2<U, V, F>(self, other: Build<U>, f: F) -> Build<V>
    where
        U: Send + 'static,
        V: Send + 'static,
        F: FnOnce(T, U) -> V + Send + 'static,
    {
        self.zip(other).map(move |(a, b)| f(a, b))
    }

    /// Sequence a whole collection, collecting the results.
    pub fn all(items: Vec<Build<T>>) -> Build<Vec<T>> {
        let mut acc = Build::pure(Vec::with_capacity(items.len()));
        for item in items {
            acc = acc.map2(item, |mut v: Vec<T>, x| {
                v.push(x);
                v
            });
        }
        acc
    }

    /// Add extra dependencies without changing the result.
    pub fn with_deps(mut self, extra: DepSet) -> Build<T> {
        self.deps.union_with(&extra);
        self
    }

    /// The dependencies declared for the current round.
    pub fn deps(&self) -> &DepSet {
        &self.deps
    }

    pub(crate) fn into_parts(self) -> (DepSet, Step<T>) {
        (self.deps, self.step)
    }
}

/// Run one round of a step: a `Value` becomes a finished `pure`, a `Chain`
/// produces the next round.
pub(crate) fn advance<T: Send + 'static>(step: Step<T>, resolved: &ResolvedDeps) -> Result<Build<T>> {
    match step {
        Step::Value(f) => Ok(Build::pure(f(resolved)?)),
        Step::Chain(f) => f(resolved),
    }
}

impl Build<()> {
    /// Depend on a file.
    pub fn path(target: TargetPath) -> Build<()> {
        Build::record(DepSet::file(target))
    }

    /// Depend on several files.
    pub fn paths<I: IntoIterator<Item = TargetPath>>(targets: I) -> Build<()> {
        Build::record(DepSet::of(targets.into_iter().map(Dep::File)))
    }

    /// Depend on an alias.
    pub fn alias(request: AliasRequest) -> Build<()> {
        Build::record(DepSet::of([Dep::Alias(request)]))
    }

    /// Always rebuild.
    pub fn universe() -> Build<()> {
        Build::record(DepSet::of([Dep::Universe]))
    }

    /// Depend on an explicit set.
    pub fn record(deps: DepSet) -> Build<()> {
        Build {
            deps,
            step: Step::Value(Box::new(|_| Ok(()))),
        }
    }
}

/// Depend on an environment variable, producing its value.
pub fn env(name: impl Into<String>) -> Build<Option<String>> {
    let name = name.into();
    let dep_name = name.clone();
    Build {
        deps: DepSet::of([Dep::Env(dep_name)]),
        step: Step::Value(Box::new(move |r| Ok(r.env_value(&name).map(String::from)))),
    }
}

/// Depend on a directory-listing selector, producing its matches.
pub fn select(selector: FileSelector) -> Build<Vec<TargetPath>> {
    let key = selector.clone();
    Build {
        deps: DepSet::of([Dep::Select(selector)]),
        step: Step::Value(Box::new(move |r| Ok(r.selection(&key).to_vec()))),
    }
}
