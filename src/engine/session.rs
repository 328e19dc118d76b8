//! The engine session: all process state, explicitly threaded.
//!
//! A [`Session`] is a cheap clonable handle over reference-counted state:
//! configuration, registered collaborators, and the memo tables (loaded
//! directories, evaluated rules, executions, digests). Nothing lives in
//! globals, so independent sessions coexist in one process.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use dashmap::DashMap;

use crate::core::path::{BuildPath, BuildScope, Layout, TargetPath};
use crate::core::select::FileSelector;
use crate::engine::cache::CacheConfig;
use crate::engine::errors::{BuildError, Result};
use crate::engine::executor::{ActionExecutor, LocalExecutor, SandboxMode};
use crate::engine::flight::{SingleFlight, WaitGraph};
use crate::engine::loader::{LoadedDir, PendingRules, RuleGenerator};
use crate::engine::rules::EvaluatedRule;
use crate::util::diagnostic::Diagnostic;

/// Routes a directory to its rule generator: one registration per
/// context-or-install key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GeneratorKey {
    Context(String),
    Install(String),
}

impl GeneratorKey {
    /// The key a build scope is routed by.
    pub fn of(scope: &BuildScope) -> Self {
        match scope {
            BuildScope::Context(name) => GeneratorKey::Context(name.clone()),
            BuildScope::Install(name) => GeneratorKey::Install(name.clone()),
        }
    }

    /// The root directory of the scope this key governs.
    pub fn scope_root(&self) -> BuildPath {
        match self {
            GeneratorKey::Context(name) => BuildPath::context(name.clone(), ""),
            GeneratorKey::Install(name) => BuildPath::install(name.clone(), ""),
        }
    }

    /// The context name this key is namespaced by.
    pub fn context_name(&self) -> &str {
        match self {
            GeneratorKey::Context(name) | GeneratorKey::Install(name) => name,
        }
    }
}

/// A version-controlled tree: its workspace-relative root and the tracked
/// files below it (relative to that root).
#[derive(Debug, Clone)]
pub struct VcsTree {
    pub root: PathBuf,
    pub tracked: BTreeSet<PathBuf>,
}

/// Supplies the version-controlled trees, so the engine can tell tracked
/// source files from build byproducts that leaked into the source tree.
pub trait VcsEnumerator: Send + Sync {
    fn trees(&self) -> anyhow::Result<Vec<VcsTree>>;
}

/// Maps a build path to the packages it belongs to.
pub type PackageAssign = Arc<dyn Fn(&BuildPath) -> BTreeSet<String> + Send + Sync>;

/// Configuration supplied to [`Session::init`].
#[derive(Clone)]
pub struct EngineConfig {
    pub workspace_root: PathBuf,
    /// Defaults to `<workspace_root>/_build`.
    pub build_root: Option<PathBuf>,
    /// The configured contexts; immutable for the session's lifetime.
    pub contexts: Vec<String>,
    pub cache: Option<CacheConfig>,
    /// Acceptable isolation modes for action execution, in preference order.
    pub sandbox_preference: Vec<SandboxMode>,
}

impl EngineConfig {
    pub fn new<I, S>(workspace_root: impl Into<PathBuf>, contexts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        EngineConfig {
            workspace_root: workspace_root.into(),
            build_root: None,
            contexts: contexts.into_iter().map(Into::into).collect(),
            cache: None,
            sandbox_preference: vec![SandboxMode::None],
        }
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_build_root(mut self, build_root: impl Into<PathBuf>) -> Self {
        self.build_root = Some(build_root.into());
        self
    }

    pub fn with_sandbox_preference(mut self, preference: Vec<SandboxMode>) -> Self {
        self.sandbox_preference = preference;
        self
    }
}

pub(crate) struct SessionInner {
    pub layout: Layout,
    pub contexts: Vec<String>,
    pub cache: Option<CacheConfig>,
    pub sandbox: Vec<SandboxMode>,

    pub executor: RwLock<Arc<dyn ActionExecutor>>,
    pub generators: RwLock<HashMap<GeneratorKey, Arc<dyn RuleGenerator>>>,
    pub vcs: RwLock<Option<Arc<dyn VcsEnumerator>>>,
    pub package_assign: RwLock<Option<PackageAssign>>,

    // Memo tables: each key is computed once; concurrent requesters share
    // the single in-flight computation.
    pub dirs: SingleFlight<BuildPath, Arc<LoadedDir>>,
    pub evaluated: SingleFlight<u64, Arc<EvaluatedRule>>,
    pub executions: SingleFlight<u64, Arc<BTreeMap<TargetPath, String>>>,
    pub selections: DashMap<FileSelector, Vec<TargetPath>>,
    pub file_digests: DashMap<PathBuf, String>,
    pub env_values: DashMap<String, Option<String>>,
    pub materialized: DashMap<TargetPath, String>,
    pub rule_labels: DashMap<u64, String>,

    pub init_state: tokio::sync::Mutex<HashSet<GeneratorKey>>,
    pub init_rules: Mutex<HashMap<GeneratorKey, PendingRules>>,

    pub rule_counter: AtomicU64,
    pub cancelled: AtomicBool,
    pub wait_graph: WaitGraph,
    pub check_seed: Mutex<[u8; 16]>,
    pub diagnostics: Mutex<Vec<Diagnostic>>,
}

/// A handle to one engine session. Clones share state.
#[derive(Clone)]
pub struct Session {
    pub(crate) inner: Arc<SessionInner>,
}

impl Session {
    /// Initialize a session from configuration. Context names must be
    /// non-empty and distinct.
    pub fn init(config: EngineConfig) -> Result<Session> {
        let mut seen = BTreeSet::new();
        for name in &config.contexts {
            if name.is_empty() {
                return Err(BuildError::UnknownContext { name: name.clone() });
            }
            if !seen.insert(name.clone()) {
                return Err(BuildError::Internal(format!(
                    "context `{}` configured twice",
                    name
                )));
            }
        }

        let mut layout = Layout::new(config.workspace_root);
        if let Some(build_root) = config.build_root {
            layout.build_root = build_root;
        }

        let executor: Arc<dyn ActionExecutor> = Arc::new(LocalExecutor::new(layout.clone()));

        Ok(Session {
            inner: Arc::new(SessionInner {
                layout,
                contexts: config.contexts,
                cache: config.cache,
                sandbox: config.sandbox_preference,
                executor: RwLock::new(executor),
                generators: RwLock::new(HashMap::new()),
                vcs: RwLock::new(None),
                package_assign: RwLock::new(None),
                dirs: SingleFlight::new(),
                evaluated: SingleFlight::new(),
                executions: SingleFlight::new(),
                selections: DashMap::new(),
                file_digests: DashMap::new(),
                env_values: DashMap::new(),
                materialized: DashMap::new(),
                rule_labels: DashMap::new(),
                init_state: tokio::sync::Mutex::new(HashSet::new()),
                init_rules: Mutex::new(HashMap::new()),
                rule_counter: AtomicU64::new(0),
                cancelled: AtomicBool::new(false),
                wait_graph: WaitGraph::new(),
                check_seed: Mutex::new(*uuid::Uuid::new_v4().as_bytes()),
                diagnostics: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Register the rule generator for a context or install tree. The
    /// context name must be configured.
    pub fn register_generator(
        &self,
        key: GeneratorKey,
        generator: Arc<dyn RuleGenerator>,
    ) -> Result<()> {
        let name = key.context_name();
        if !self.inner.contexts.iter().any(|c| c == name) {
            return Err(BuildError::UnknownContext {
                name: name.to_string(),
            });
        }
        self.inner
            .generators
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(key, generator);
        Ok(())
    }

    /// Register the version-control enumerator.
    pub fn register_vcs(&self, vcs: Arc<dyn VcsEnumerator>) {
        *self.inner.vcs.write().unwrap_or_else(|p| p.into_inner()) = Some(vcs);
    }

    /// Register the package assignment function.
    pub fn set_package_assignment(&self, assign: PackageAssign) {
        *self
            .inner
            .package_assign
            .write()
            .unwrap_or_else(|p| p.into_inner()) = Some(assign);
    }

    /// Replace the action executor (defaults to [`LocalExecutor`]).
    pub fn set_executor(&self, executor: Arc<dyn ActionExecutor>) {
        *self
            .inner
            .executor
            .write()
            .unwrap_or_else(|p| p.into_inner()) = executor;
    }

    /// Refuse to start any further rule evaluation. In-flight work is
    /// allowed to finish; external action executions are not force-killed.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    /// Discard all memoized state and registrations, keeping configuration.
    /// Must not be called while a build is in flight.
    pub fn reset(&self) {
        let inner = &self.inner;
        inner.dirs.clear();
        inner.evaluated.clear();
        inner.executions.clear();
        inner.selections.clear();
        inner.file_digests.clear();
        inner.env_values.clear();
        inner.materialized.clear();
        inner.rule_labels.clear();
        inner.wait_graph.clear();

        inner
            .generators
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
        *inner.vcs.write().unwrap_or_else(|p| p.into_inner()) = None;
        *inner
            .package_assign
            .write()
            .unwrap_or_else(|p| p.into_inner()) = None;

        if let Ok(mut inited) = inner.init_state.try_lock() {
            inited.clear();
        }
        inner
            .init_rules
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
        inner
            .diagnostics
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clear();

        *inner.check_seed.lock().unwrap_or_else(|p| p.into_inner()) =
            *uuid::Uuid::new_v4().as_bytes();
        inner.rule_counter.store(0, Ordering::SeqCst);
        inner.cancelled.store(false, Ordering::SeqCst);

        tracing::debug!("session reset");
    }

    /// The configured contexts.
    pub fn contexts(&self) -> &[String] {
        &self.inner.contexts
    }

    /// The session's filesystem layout.
    pub fn layout(&self) -> &Layout {
        &self.inner.layout
    }

    /// Warning-class diagnostics recorded so far (cache integrity events).
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.inner
            .diagnostics
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub(crate) fn push_diagnostic(&self, diagnostic: Diagnostic) {
        tracing::warn!("{}", diagnostic);
        self.inner
            .diagnostics
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(diagnostic);
    }
}
