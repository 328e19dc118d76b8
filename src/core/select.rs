//! File selectors: a (directory, glob predicate) pair resolved to a concrete
//! path set.
//!
//! Selectors over source directories match files on disk; selectors over
//! build directories match declared rule targets (resolved by the engine,
//! which knows the loaded rule set).

use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};

use crate::core::path::{Layout, TargetPath};
use crate::engine::errors::{BuildError, Result};
use crate::util::fs::list_files;

/// A glob predicate scoped to a single directory (non-recursive).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileSelector {
    pub dir: TargetPath,
    pub pattern: String,
}

impl FileSelector {
    /// Create a selector, validating the pattern up front. An invalid
    /// pattern is a configuration error.
    pub fn new(dir: TargetPath, pattern: impl Into<String>) -> Result<Self> {
        let pattern = pattern.into();
        Pattern::new(&pattern).map_err(|e| BuildError::InvalidPattern {
            pattern: pattern.clone(),
            message: e.to_string(),
        })?;
        Ok(FileSelector { dir, pattern })
    }

    fn match_options() -> MatchOptions {
        // Leading dots are literal, like a shell glob; synthetic dot-files
        // (alias stamps) never leak into wildcard matches.
        MatchOptions {
            require_literal_leading_dot: true,
            ..MatchOptions::new()
        }
    }

    /// Whether a file name matches the predicate.
    pub fn matches_name(&self, name: &str) -> bool {
        match Pattern::new(&self.pattern) {
            Ok(pattern) => pattern.matches_with(name, Self::match_options()),
            Err(_) => false,
        }
    }

    /// Resolve the selector against a source directory on disk. Matches are
    /// sorted and deduplicated. Build-directory selectors are resolved by
    /// the engine against declared targets instead.
    pub fn resolve_source(&self, layout: &Layout) -> Result<Vec<TargetPath>> {
        let dir_abs = layout.absolute(&self.dir);
        let names = list_files(&dir_abs)
            .map_err(|e| BuildError::io(format!("listing {}", self.dir), e))?;

        let mut matches: Vec<TargetPath> = names
            .iter()
            .filter(|name| self.matches_name(name))
            .map(|name| self.dir.join(name))
            .collect();
        matches.sort();
        matches.dedup();
        Ok(matches)
    }
}

impl std::fmt::Display for FileSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.dir, self.pattern)
    }
}
