//! Subdirectory retention sets.
//!
//! A rule generator reports which subdirectories of its directory stay
//! visible to recursion (directory listings, recursive aliases, target
//! walks). `All` keeps every on-disk subdirectory; `Named` keeps exactly the
//! listed names, including build-only subdirectories that never exist in the
//! source tree.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Which subdirectories of a directory are retained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubdirSet {
    /// Keep every subdirectory.
    All,
    /// Keep exactly the named subdirectories.
    Named(BTreeSet<String>),
}

impl SubdirSet {
    /// An empty retention set.
    pub fn empty() -> Self {
        SubdirSet::Named(BTreeSet::new())
    }

    /// A retention set of explicit names.
    pub fn of<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        SubdirSet::Named(names.into_iter().map(Into::into).collect())
    }

    /// Whether `name` is retained.
    pub fn contains(&self, name: &str) -> bool {
        match self {
            SubdirSet::All => true,
            SubdirSet::Named(names) => names.contains(name),
        }
    }

    /// Pointwise union; `All` absorbs.
    pub fn union(self, other: SubdirSet) -> SubdirSet {
        match (self, other) {
            (SubdirSet::All, _) | (_, SubdirSet::All) => SubdirSet::All,
            (SubdirSet::Named(mut a), SubdirSet::Named(b)) => {
                a.extend(b);
                SubdirSet::Named(a)
            }
        }
    }

    /// The explicitly named members, if any. `All` has none.
    pub fn names(&self) -> Option<&BTreeSet<String>> {
        match self {
            SubdirSet::All => None,
            SubdirSet::Named(names) => Some(names),
        }
    }
}

impl Default for SubdirSet {
    fn default() -> Self {
        SubdirSet::empty()
    }
}
