//! The path model: source-tree paths, build-output paths, external paths.
//!
//! Build paths are always rooted under a build scope (a context tree or an
//! install tree) and never escape it. Source paths are workspace-relative.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// The owner of a build subtree: a named context or a per-context install
/// tree. This is the tag that routes a directory to its rule generator.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BuildScope {
    /// A named build environment (toolchain/target configuration).
    Context(String),
    /// The install tree of the named context.
    Install(String),
}

impl BuildScope {
    /// The context name this scope is namespaced by.
    pub fn name(&self) -> &str {
        match self {
            BuildScope::Context(name) | BuildScope::Install(name) => name,
        }
    }

    /// Whether this is a context scope (as opposed to an install tree).
    pub fn is_context(&self) -> bool {
        matches!(self, BuildScope::Context(_))
    }
}

impl fmt::Display for BuildScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildScope::Context(name) => write!(f, "{}", name),
            BuildScope::Install(name) => write!(f, "install/{}", name),
        }
    }
}

/// A path inside a build scope, relative to the scope root.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BuildPath {
    pub scope: BuildScope,
    pub rel: PathBuf,
}

impl BuildPath {
    /// Create a build path under a context.
    pub fn context(name: impl Into<String>, rel: impl Into<PathBuf>) -> Self {
        BuildPath {
            scope: BuildScope::Context(name.into()),
            rel: rel.into(),
        }
    }

    /// Create a build path under an install tree.
    pub fn install(name: impl Into<String>, rel: impl Into<PathBuf>) -> Self {
        BuildPath {
            scope: BuildScope::Install(name.into()),
            rel: rel.into(),
        }
    }

    /// The root of this path's scope.
    pub fn scope_root(&self) -> BuildPath {
        BuildPath {
            scope: self.scope.clone(),
            rel: PathBuf::new(),
        }
    }

    /// The parent directory, or `None` at the scope root.
    pub fn parent(&self) -> Option<BuildPath> {
        if self.rel.as_os_str().is_empty() {
            return None;
        }
        Some(BuildPath {
            scope: self.scope.clone(),
            rel: self.rel.parent().map(Path::to_path_buf).unwrap_or_default(),
        })
    }

    /// Append a component.
    pub fn join(&self, name: impl AsRef<Path>) -> BuildPath {
        BuildPath {
            scope: self.scope.clone(),
            rel: self.rel.join(name),
        }
    }

    /// The final component, if any.
    pub fn file_name(&self) -> Option<String> {
        self.rel
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
    }

    /// The path components relative to the scope root, as strings. This is
    /// what rule generator callbacks receive.
    pub fn components(&self) -> Vec<String> {
        self.rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect()
    }
}

impl fmt::Display for BuildPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.rel.as_os_str().is_empty() {
            write!(f, "{}", self.scope)
        } else {
            write!(f, "{}/{}", self.scope, self.rel.display())
        }
    }
}

/// Any path the engine can depend on or produce.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TargetPath {
    /// A workspace-relative source-tree path.
    Source(PathBuf),
    /// A path owned by exactly one build scope.
    Build(BuildPath),
    /// An absolute path outside the workspace (system files).
    External(PathBuf),
}

impl TargetPath {
    /// A source-tree path, relative to the workspace root.
    pub fn source(rel: impl Into<PathBuf>) -> Self {
        TargetPath::Source(rel.into())
    }

    /// A build path under the named context.
    pub fn build(context: impl Into<String>, rel: impl Into<PathBuf>) -> Self {
        TargetPath::Build(BuildPath::context(context, rel))
    }

    /// A build path under the named context's install tree.
    pub fn install(context: impl Into<String>, rel: impl Into<PathBuf>) -> Self {
        TargetPath::Build(BuildPath::install(context, rel))
    }

    /// An absolute path outside the workspace.
    pub fn external(path: impl Into<PathBuf>) -> Self {
        TargetPath::External(path.into())
    }

    /// The parent directory, staying within the same variant.
    pub fn parent(&self) -> Option<TargetPath> {
        match self {
            TargetPath::Source(p) => p.parent().map(|p| TargetPath::Source(p.to_path_buf())),
            TargetPath::Build(b) => b.parent().map(TargetPath::Build),
            TargetPath::External(p) => p.parent().map(|p| TargetPath::External(p.to_path_buf())),
        }
    }

    /// Append a component.
    pub fn join(&self, name: impl AsRef<Path>) -> TargetPath {
        match self {
            TargetPath::Source(p) => TargetPath::Source(p.join(name)),
            TargetPath::Build(b) => TargetPath::Build(b.join(name)),
            TargetPath::External(p) => TargetPath::External(p.join(name)),
        }
    }

    /// The build path, if this is a build target.
    pub fn as_build(&self) -> Option<&BuildPath> {
        match self {
            TargetPath::Build(b) => Some(b),
            _ => None,
        }
    }

    /// The owning context name, for context-scoped build paths.
    pub fn context(&self) -> Option<&str> {
        match self {
            TargetPath::Build(b) if b.scope.is_context() => Some(b.scope.name()),
            _ => None,
        }
    }

    /// Whether this is a source-tree path.
    pub fn is_source(&self) -> bool {
        matches!(self, TargetPath::Source(_))
    }
}

impl fmt::Display for TargetPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetPath::Source(p) => write!(f, "{}", p.display()),
            TargetPath::Build(b) => write!(f, "{}", b),
            TargetPath::External(p) => write!(f, "{}", p.display()),
        }
    }
}

/// Filesystem layout of a build session: where the source tree and the build
/// tree live. Resolves logical paths to absolute ones.
#[derive(Debug, Clone)]
pub struct Layout {
    pub workspace_root: PathBuf,
    pub build_root: PathBuf,
}

impl Layout {
    /// Create a layout with the conventional `_build` directory.
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        let workspace_root = workspace_root.into();
        let build_root = workspace_root.join("_build");
        Layout {
            workspace_root,
            build_root,
        }
    }

    /// The on-disk root of a build scope.
    pub fn scope_root(&self, scope: &BuildScope) -> PathBuf {
        match scope {
            BuildScope::Context(name) => self.build_root.join(name),
            BuildScope::Install(name) => self.build_root.join("install").join(name),
        }
    }

    /// Resolve a target path to an absolute filesystem path.
    pub fn absolute(&self, target: &TargetPath) -> PathBuf {
        match target {
            TargetPath::Source(rel) => crate::util::fs::join_rel(&self.workspace_root, rel),
            TargetPath::Build(b) => crate::util::fs::join_rel(&self.scope_root(&b.scope), &b.rel),
            TargetPath::External(p) => p.clone(),
        }
    }
}
