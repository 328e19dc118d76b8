//! Core data model: paths, dependencies, selectors, subdirectory sets.

pub mod deps;
pub mod path;
pub mod select;
pub mod subdir;
