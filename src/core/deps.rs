//! Typed dependency sets.
//!
//! A dependency is one of: a file, a directory-listing selector, an alias
//! reference, an environment variable, or the "universe" marker that forces
//! a rule to rebuild on every run. Sets are ordered and duplicates collapse.

use std::collections::BTreeSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::core::path::TargetPath;
use crate::core::select::FileSelector;

/// A reference to a named alias in a source-tree directory.
///
/// `contexts` restricts resolution to the named contexts; empty means every
/// context configured for the session. `loc` annotates errors with the
/// request site when the alias was named explicitly.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AliasRequest {
    /// Workspace-relative directory the alias lives in.
    pub dir: PathBuf,
    /// Alias name, e.g. "test" or "install".
    pub name: String,
    /// Also pull in the same-named alias from every kept subdirectory,
    /// transitively.
    pub recursive: bool,
    /// Contexts to resolve under; empty = all configured contexts.
    pub contexts: Vec<String>,
    /// Request site, for diagnostics.
    pub loc: Option<String>,
}

impl AliasRequest {
    /// A non-recursive alias request over all configured contexts.
    pub fn new(dir: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        AliasRequest {
            dir: dir.into(),
            name: name.into(),
            recursive: false,
            contexts: Vec::new(),
            loc: None,
        }
    }

    /// Make the request recursive.
    pub fn recursive(mut self) -> Self {
        self.recursive = true;
        self
    }

    /// Restrict the request to the given contexts.
    pub fn in_contexts<I, S>(mut self, contexts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.contexts = contexts.into_iter().map(Into::into).collect();
        self
    }

    /// Annotate the request with its source location.
    pub fn at(mut self, loc: impl Into<String>) -> Self {
        self.loc = Some(loc.into());
        self
    }
}

impl std::fmt::Display for AliasRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.dir.as_os_str().is_empty() {
            write!(f, "@{}", self.name)
        } else {
            write!(f, "{}/@{}", self.dir.display(), self.name)
        }
    }
}

/// A single dependency.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Dep {
    /// A file (source, build, or external).
    File(TargetPath),
    /// The matches of a directory-listing selector.
    Select(FileSelector),
    /// An alias and everything registered under it.
    Alias(AliasRequest),
    /// The value of an environment variable.
    Env(String),
    /// Always rebuild; never cached.
    Universe,
}

/// An ordered set of dependencies. Duplicates collapse; order of insertion
/// is irrelevant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepSet(BTreeSet<Dep>);

impl DepSet {
    /// An empty set.
    pub fn new() -> Self {
        DepSet(BTreeSet::new())
    }

    /// A set from an iterator of dependencies.
    pub fn of<I: IntoIterator<Item = Dep>>(deps: I) -> Self {
        DepSet(deps.into_iter().collect())
    }

    /// A singleton file dependency.
    pub fn file(target: TargetPath) -> Self {
        DepSet::of([Dep::File(target)])
    }

    /// Insert a dependency.
    pub fn insert(&mut self, dep: Dep) {
        self.0.insert(dep);
    }

    /// Union another set into this one.
    pub fn union_with(&mut self, other: &DepSet) {
        self.0.extend(other.0.iter().cloned());
    }

    /// Union, consuming both sets.
    pub fn union(mut self, other: DepSet) -> DepSet {
        self.0.extend(other.0);
        self
    }

    /// Iterate dependencies in order.
    pub fn iter(&self) -> impl Iterator<Item = &Dep> {
        self.0.iter()
    }

    /// Iterate the file dependencies only.
    pub fn files(&self) -> impl Iterator<Item = &TargetPath> {
        self.0.iter().filter_map(|dep| match dep {
            Dep::File(target) => Some(target),
            _ => None,
        })
    }

    /// Number of dependencies.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether the set contains a dependency.
    pub fn contains(&self, dep: &Dep) -> bool {
        self.0.contains(dep)
    }

    /// Whether the set carries the always-rebuild marker.
    pub fn has_universe(&self) -> bool {
        self.0.contains(&Dep::Universe)
    }
}

impl IntoIterator for DepSet {
    type Item = Dep;
    type IntoIter = std::collections::btree_set::IntoIter<Dep>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl FromIterator<Dep> for DepSet {
    fn from_iter<I: IntoIterator<Item = Dep>>(iter: I) -> Self {
        DepSet(iter.into_iter().collect())
    }
}
