//! The execution engine.
//!
//! `do_build` resolves a request's build computation in rounds,
//! materializing its declared dependencies bottom-up: every file dependency
//! resolves to a rule (or a source leaf), rules evaluate once, execute once,
//! and concurrent requesters share in-flight work. Independent rules run
//! concurrently; a rule's action never starts before every resolved
//! dependency is materialized.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::core::deps::{Dep, DepSet};
use crate::core::path::TargetPath;
use crate::core::select::FileSelector;
use crate::engine::alias::resolve_alias;
use crate::engine::build::{Build, ResolvedDeps, Step};
use crate::engine::cache::{should_verify, CacheEntry, CachedOutput, CacheKey};
use crate::engine::errors::{BuildError, Result};
use crate::engine::executor::{ActionInvocation, ActionOutcome};
use crate::engine::loader::{ensure_init, load_dir};
use crate::engine::rules::{EvaluatedRule, Rule};
use crate::engine::session::{Session, SessionInner};
use crate::util::diagnostic::Diagnostic;
use crate::util::fs::{join_rel, read_bytes, write_bytes};
use crate::util::hash::{sha256_file, Fingerprint};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The chain of rule evaluations the current task is inside. Re-entering a
/// rule already on the path is a dependency cycle.
#[derive(Clone, Default)]
pub(crate) struct EvalPath {
    entries: Vec<(u64, String)>,
}

impl EvalPath {
    fn contains(&self, id: u64) -> bool {
        self.entries.iter().any(|(i, _)| *i == id)
    }

    fn last_id(&self) -> Option<u64> {
        self.entries.last().map(|(i, _)| *i)
    }

    fn push(&self, id: u64, label: String) -> EvalPath {
        let mut next = self.clone();
        next.entries.push((id, label));
        next
    }

    /// The cycle chain: labels from the first occurrence of `id` through the
    /// end of the path, closed with `label`.
    fn cycle_chain(&self, id: u64, label: String) -> Vec<String> {
        let start = self
            .entries
            .iter()
            .position(|(i, _)| *i == id)
            .unwrap_or(0);
        let mut chain: Vec<String> = self.entries[start..]
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        chain.push(label);
        chain
    }
}

/// Everything materializing a dependency set yields: the declaration-phase
/// view plus per-input content digests for cache keying.
struct DepResolution {
    resolved: ResolvedDeps,
    inputs: BTreeMap<String, String>,
    universe: bool,
}

enum DepOutcome {
    File(TargetPath, String),
    Selection(FileSelector, Vec<(TargetPath, String)>),
    Stamps(Vec<(TargetPath, String)>),
}

impl Session {
    /// Run a build request: materialize its declared dependencies, then
    /// produce its result. The sole entry point that executes actions.
    pub async fn do_build<T: Send + 'static>(&self, request: Build<T>) -> Result<T> {
        let inner = Arc::clone(&self.inner);
        ensure_init(&inner).await?;

        let mut resolved = ResolvedDeps::default();
        let mut current = request;
        loop {
            let (deps, step) = current.into_parts();
            let resolution = materialize_deps(&inner, &deps, &EvalPath::default()).await?;
            resolved.merge(resolution.resolved);

            match step {
                Step::Value(f) => return f(&resolved),
                Step::Chain(f) => current = f(&resolved)?,
            }
        }
    }

    /// Evaluate the rules a request reaches, without executing any action.
    /// `recursive = false` stops at the request's immediate dependencies;
    /// `recursive = true` takes the transitive closure.
    pub async fn evaluate_rules(
        &self,
        recursive: bool,
        request: Build<()>,
    ) -> Result<Vec<Arc<EvaluatedRule>>> {
        let inner = Arc::clone(&self.inner);
        ensure_init(&inner).await?;

        let ((), deps) = resolve_decl(&inner, request).await?;
        let mut out: BTreeMap<u64, Arc<EvaluatedRule>> = BTreeMap::new();

        for target in dep_targets(&inner, &deps).await? {
            visit_rule(&inner, target, Vec::new(), recursive, &mut out).await?;
        }

        Ok(out.into_values().collect())
    }
}

/// Declaration-phase resolution: drive a build computation's rounds using
/// only environment values and selector matches. Never executes actions.
pub(crate) async fn resolve_decl<T: Send + 'static>(
    inner: &Arc<SessionInner>,
    build: Build<T>,
) -> Result<(T, DepSet)> {
    let mut acc = DepSet::new();
    let mut resolved = ResolvedDeps::default();
    let mut current = build;

    loop {
        let (deps, step) = current.into_parts();
        for dep in deps.iter() {
            match dep {
                Dep::Env(name) => {
                    let value = env_value(inner, name);
                    resolved.record_env(name.clone(), value);
                }
                Dep::Select(selector) => {
                    let matches = resolve_selector(inner, selector.clone()).await?;
                    resolved.record_selection(selector.clone(), matches);
                }
                _ => {}
            }
        }
        acc.union_with(&deps);

        match step {
            Step::Value(f) => return Ok((f(&resolved)?, acc)),
            Step::Chain(f) => current = f(&resolved)?,
        }
    }
}

/// The build targets a dependency set reaches directly: file deps, selector
/// matches, and alias stamps. Source leaves have no rules and are skipped.
async fn dep_targets(inner: &Arc<SessionInner>, deps: &DepSet) -> Result<Vec<TargetPath>> {
    let mut targets = Vec::new();
    for dep in deps.iter() {
        match dep {
            Dep::File(target) => {
                if target.as_build().is_some() {
                    targets.push(target.clone());
                }
            }
            Dep::Select(selector) => {
                for target in resolve_selector(inner, selector.clone()).await? {
                    if target.as_build().is_some() {
                        targets.push(target);
                    }
                }
            }
            Dep::Alias(request) => {
                targets.extend(resolve_alias(Arc::clone(inner), request.clone()).await?);
            }
            Dep::Env(_) | Dep::Universe => {}
        }
    }
    targets.sort();
    targets.dedup();
    Ok(targets)
}

fn visit_rule<'a>(
    inner: &'a Arc<SessionInner>,
    target: TargetPath,
    path: Vec<u64>,
    recursive: bool,
    out: &'a mut BTreeMap<u64, Arc<EvaluatedRule>>,
) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        let Some(build_path) = target.as_build() else {
            return Ok(());
        };
        let Some(parent) = build_path.parent() else {
            return Err(BuildError::NoRuleForTarget {
                target: target.to_string(),
            });
        };

        let loaded = load_dir(inner, &parent).await?;
        let Some(rule) = loaded.rules.get(&target).cloned() else {
            return Err(BuildError::NoRuleForTarget {
                target: target.to_string(),
            });
        };

        if path.contains(&rule.id.0) {
            return Err(BuildError::DependencyCycle {
                chain: cycle_labels(inner, &path, rule.id.0, rule.label()),
            });
        }
        if out.contains_key(&rule.id.0) {
            return Ok(());
        }

        inner.rule_labels.insert(rule.id.0, rule.label());
        let evaluated = evaluate_rule(inner, rule.clone()).await?;
        out.insert(evaluated.id.0, Arc::clone(&evaluated));

        if recursive {
            let mut next_path = path;
            next_path.push(evaluated.id.0);
            for sub in dep_targets(inner, &evaluated.deps).await? {
                visit_rule(inner, sub, next_path.clone(), true, out).await?;
            }
        }
        Ok(())
    })
}

fn cycle_labels(inner: &SessionInner, path: &[u64], id: u64, label: String) -> Vec<String> {
    let start = path.iter().position(|i| *i == id).unwrap_or(0);
    let mut chain: Vec<String> = path[start..]
        .iter()
        .map(|i| label_of(inner, *i))
        .collect();
    chain.push(label);
    chain
}

fn label_of(inner: &SessionInner, id: u64) -> String {
    inner
        .rule_labels
        .get(&id)
        .map(|l| l.value().clone())
        .unwrap_or_else(|| format!("rule#{}", id))
}

/// Read an environment variable once per session.
fn env_value(inner: &SessionInner, name: &str) -> Option<String> {
    inner
        .env_values
        .entry(name.to_string())
        .or_insert_with(|| std::env::var(name).ok())
        .clone()
}

/// Resolve a selector: source directories match files on disk, build
/// directories match declared rule targets. Memoized.
pub(crate) async fn resolve_selector(
    inner: &Arc<SessionInner>,
    selector: FileSelector,
) -> Result<Vec<TargetPath>> {
    if let Some(hit) = inner.selections.get(&selector) {
        return Ok(hit.value().clone());
    }

    let matches = match &selector.dir {
        TargetPath::Source(_) | TargetPath::External(_) => {
            selector.resolve_source(&inner.layout)?
        }
        TargetPath::Build(dir) => {
            let loaded = load_dir(inner, dir).await?;
            loaded
                .rules
                .keys()
                .filter(|t| match t {
                    TargetPath::Build(b) => b
                        .file_name()
                        .map(|name| selector.matches_name(&name))
                        .unwrap_or(false),
                    _ => false,
                })
                .cloned()
                .collect()
        }
    };

    inner.selections.insert(selector, matches.clone());
    Ok(matches)
}

/// Materialize a dependency set: build every file/alias/selector entry
/// (concurrently where independent), read environment values, and collect
/// per-input digests.
async fn materialize_deps(
    inner: &Arc<SessionInner>,
    deps: &DepSet,
    path: &EvalPath,
) -> Result<DepResolution> {
    let mut resolution = DepResolution {
        resolved: ResolvedDeps::default(),
        inputs: BTreeMap::new(),
        universe: false,
    };

    let mut handles: Vec<JoinHandle<Result<DepOutcome>>> = Vec::new();

    for dep in deps.iter() {
        match dep {
            Dep::Universe => {
                resolution.universe = true;
                resolution
                    .inputs
                    .insert("universe".to_string(), "always".to_string());
            }
            Dep::Env(name) => {
                let value = env_value(inner, name);
                resolution
                    .inputs
                    .insert(format!("env:{}", name), match &value {
                        Some(v) => format!("={}", v),
                        None => "<unset>".to_string(),
                    });
                resolution.resolved.record_env(name.clone(), value);
            }
            Dep::File(target) => {
                let task_inner = Arc::clone(inner);
                let task_target = target.clone();
                let task_path = path.clone();
                handles.push(tokio::spawn(async move {
                    let digest =
                        build_file(task_inner, task_target.clone(), task_path).await?;
                    Ok(DepOutcome::File(task_target, digest))
                }));
            }
            Dep::Select(selector) => {
                let task_inner = Arc::clone(inner);
                let task_selector = selector.clone();
                let task_path = path.clone();
                handles.push(tokio::spawn(async move {
                    let matches =
                        resolve_selector(&task_inner, task_selector.clone()).await?;
                    let mut built = Vec::with_capacity(matches.len());
                    for target in matches {
                        let digest = build_file(
                            Arc::clone(&task_inner),
                            target.clone(),
                            task_path.clone(),
                        )
                        .await?;
                        built.push((target, digest));
                    }
                    Ok(DepOutcome::Selection(task_selector, built))
                }));
            }
            Dep::Alias(request) => {
                let task_inner = Arc::clone(inner);
                let task_request = request.clone();
                let task_path = path.clone();
                handles.push(tokio::spawn(async move {
                    let stamps = resolve_alias(Arc::clone(&task_inner), task_request).await?;
                    let mut built = Vec::with_capacity(stamps.len());
                    for stamp in stamps {
                        let digest = build_file(
                            Arc::clone(&task_inner),
                            stamp.clone(),
                            task_path.clone(),
                        )
                        .await?;
                        built.push((stamp, digest));
                    }
                    Ok(DepOutcome::Stamps(built))
                }));
            }
        }
    }

    // Let every started dependency finish before reporting the first
    // failure; siblings of a failed rule are unaffected.
    let mut first_err: Option<BuildError> = None;
    for handle in handles {
        match handle.await {
            Ok(Ok(outcome)) => apply_outcome(&mut resolution, outcome),
            Ok(Err(e)) => {
                first_err.get_or_insert(e);
            }
            Err(join) => {
                first_err.get_or_insert(BuildError::Internal(format!(
                    "dependency task failed: {}",
                    join
                )));
            }
        }
    }
    if let Some(err) = first_err {
        return Err(err);
    }

    Ok(resolution)
}

fn apply_outcome(resolution: &mut DepResolution, outcome: DepOutcome) {
    match outcome {
        DepOutcome::File(target, digest) => {
            resolution.inputs.insert(format!("file:{}", target), digest);
        }
        DepOutcome::Selection(selector, built) => {
            let mut fp = Fingerprint::new();
            for (target, digest) in &built {
                fp.update_str(&target.to_string());
                fp.update_str(digest);
            }
            resolution
                .inputs
                .insert(format!("glob:{}", selector), fp.finish());
            resolution
                .resolved
                .record_selection(selector, built.into_iter().map(|(t, _)| t).collect());
        }
        DepOutcome::Stamps(built) => {
            for (target, digest) in built {
                resolution.inputs.insert(format!("file:{}", target), digest);
            }
        }
    }
}

/// Materialize one file: a source/external leaf is digested as-is, a build
/// target is produced by its rule.
fn build_file(
    inner: Arc<SessionInner>,
    target: TargetPath,
    path: EvalPath,
) -> BoxFuture<'static, Result<String>> {
    Box::pin(async move {
        if inner.cancelled.load(Ordering::SeqCst) {
            return Err(BuildError::Cancelled);
        }
        if let Some(digest) = inner.materialized.get(&target) {
            return Ok(digest.value().clone());
        }

        match &target {
            TargetPath::Source(_) | TargetPath::External(_) => digest_leaf(&inner, &target),
            TargetPath::Build(build_path) => {
                let Some(parent) = build_path.parent() else {
                    return Err(BuildError::NoRuleForTarget {
                        target: target.to_string(),
                    });
                };
                let loaded = load_dir(&inner, &parent).await?;
                let Some(rule) = loaded.rules.get(&target).cloned() else {
                    return Err(BuildError::NoRuleForTarget {
                        target: target.to_string(),
                    });
                };

                let outputs = build_rule(&inner, rule, &path).await?;
                outputs.get(&target).cloned().ok_or_else(|| {
                    BuildError::Internal(format!("rule did not record target {}", target))
                })
            }
        }
    })
}

fn digest_leaf(inner: &SessionInner, target: &TargetPath) -> Result<String> {
    let abs = inner.layout.absolute(target);
    if let Some(digest) = inner.file_digests.get(&abs) {
        return Ok(digest.value().clone());
    }
    if !abs.is_file() {
        return Err(BuildError::SourceFileMissing {
            path: target.to_string(),
        });
    }
    let digest =
        sha256_file(&abs).map_err(|e| BuildError::io(format!("hashing {}", target), e))?;
    inner.file_digests.insert(abs, digest.clone());
    Ok(digest)
}

/// Drive one rule to completion, single-flight: evaluate, materialize its
/// dependency set, consult the cache, execute if needed.
async fn build_rule(
    inner: &Arc<SessionInner>,
    rule: Arc<Rule>,
    path: &EvalPath,
) -> Result<Arc<BTreeMap<TargetPath, String>>> {
    if path.contains(rule.id.0) {
        return Err(BuildError::DependencyCycle {
            chain: path.cycle_chain(rule.id.0, rule.label()),
        });
    }

    inner.rule_labels.insert(rule.id.0, rule.label());

    // A cycle entered concurrently from two requests never shows up on
    // either task's own path; the wait-for graph catches it instead of
    // letting the two flights deadlock on each other.
    let waiter = path.last_id();
    if let Some(waiter) = waiter {
        if let Err(ids) = inner.wait_graph.add_edge(waiter, rule.id.0) {
            return Err(BuildError::DependencyCycle {
                chain: ids.iter().map(|id| label_of(inner, *id)).collect(),
            });
        }
    }

    let task_inner = Arc::clone(inner);
    let task_rule = Arc::clone(&rule);
    let task_path = path.push(rule.id.0, rule.label());
    let result = inner
        .executions
        .get_or_compute(rule.id.0, async move {
            exec_rule(task_inner, task_rule, task_path).await
        })
        .await;

    if let Some(waiter) = waiter {
        inner.wait_graph.remove_edge(waiter, rule.id.0);
    }

    result
}

/// Evaluate a rule into its canonical form, once per rule id.
pub(crate) async fn evaluate_rule(
    inner: &Arc<SessionInner>,
    rule: Arc<Rule>,
) -> Result<Arc<EvaluatedRule>> {
    let task_inner = Arc::clone(inner);
    inner
        .evaluated
        .get_or_compute(rule.id.0, async move {
            let Some(body) = rule.take_body() else {
                return Err(BuildError::Internal(format!(
                    "rule body for {} already consumed",
                    rule.label()
                )));
            };
            let (action, deps) = resolve_decl(&task_inner, body).await?;
            Ok(Arc::new(EvaluatedRule {
                id: rule.id,
                dir: rule.dir.clone(),
                deps,
                targets: rule.targets.clone(),
                context: rule.context.clone(),
                action,
            }))
        })
        .await
}

async fn exec_rule(
    inner: Arc<SessionInner>,
    rule: Arc<Rule>,
    path: EvalPath,
) -> Result<Arc<BTreeMap<TargetPath, String>>> {
    if inner.cancelled.load(Ordering::SeqCst) {
        return Err(BuildError::Cancelled);
    }

    let evaluated = evaluate_rule(&inner, rule).await?;
    let resolution = materialize_deps(&inner, &evaluated.deps, &path).await?;

    let mut fp = Fingerprint::new();
    for (label, digest) in &resolution.inputs {
        fp.update_str(label);
        fp.update_str(digest);
    }
    let inputs_digest = fp.finish();

    let targets: Vec<(TargetPath, PathBuf)> = evaluated
        .targets
        .iter()
        .map(|t| (t.clone(), inner.layout.absolute(t)))
        .collect();
    let cwd = join_rel(&inner.layout.scope_root(&evaluated.dir.scope), &evaluated.dir.rel);

    let invocation = ActionInvocation {
        action: evaluated.action.clone(),
        targets,
        cwd,
        inputs_digest,
        sandbox: inner.sandbox.clone(),
    };

    let outputs = if resolution.universe || inner.cache.is_none() {
        run_action(&inner, invocation).await?
    } else {
        run_through_cache(&inner, &evaluated, &resolution.inputs, invocation).await?
    };

    for (target, digest) in &outputs {
        inner.materialized.insert(target.clone(), digest.clone());
    }
    tracing::debug!(rule = %evaluated.id, targets = outputs.len(), "rule materialized");

    Ok(Arc::new(outputs))
}

async fn run_action(
    inner: &Arc<SessionInner>,
    invocation: ActionInvocation,
) -> Result<BTreeMap<TargetPath, String>> {
    let executor = {
        let guard = inner.executor.read().unwrap_or_else(|p| p.into_inner());
        Arc::clone(&*guard)
    };
    let outcome = executor.execute(invocation).await?;
    Ok(outcome_map(outcome))
}

fn outcome_map(outcome: ActionOutcome) -> BTreeMap<TargetPath, String> {
    outcome.outputs.into_iter().collect()
}

async fn run_through_cache(
    inner: &Arc<SessionInner>,
    evaluated: &EvaluatedRule,
    inputs: &BTreeMap<String, String>,
    invocation: ActionInvocation,
) -> Result<BTreeMap<TargetPath, String>> {
    let Some(cache) = inner.cache.clone() else {
        return run_action(inner, invocation).await;
    };

    let key = CacheKey::compute(&evaluated.action, inputs)?;

    let entry = match cache.backend.fetch(&key) {
        Ok(entry) => entry,
        Err(e) => {
            tracing::warn!(key = key.as_str(), "cache fetch failed: {}", e);
            None
        }
    };

    match entry {
        Some(entry) => {
            let seed = *inner
                .check_seed
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            if should_verify(&seed, &key, cache.check_probability) {
                // Do not trust the hit: re-run and diff. A mismatch means
                // the rule is nondeterministic or under-declares inputs.
                let fresh = run_action(inner, invocation).await?;
                let cached: BTreeMap<TargetPath, String> = entry
                    .outputs
                    .iter()
                    .map(|o| (o.target.clone(), o.digest.clone()))
                    .collect();
                if fresh != cached {
                    let session = Session {
                        inner: Arc::clone(inner),
                    };
                    session.push_diagnostic(
                        Diagnostic::warning("cache integrity mismatch: rerun produced different outputs")
                            .with_location(evaluated.id.to_string())
                            .with_context(evaluated.action.describe()),
                    );
                    store_in_cache(inner, &cache, &key, &fresh);
                }
                Ok(fresh)
            } else {
                match materialize_cached(inner, &entry) {
                    Ok(outputs) => {
                        tracing::debug!(rule = %evaluated.id, "cache hit");
                        Ok(outputs)
                    }
                    Err(e) => {
                        tracing::warn!(rule = %evaluated.id, "cache entry unusable: {}", e);
                        let fresh = run_action(inner, invocation).await?;
                        store_in_cache(inner, &cache, &key, &fresh);
                        Ok(fresh)
                    }
                }
            }
        }
        None => {
            let fresh = run_action(inner, invocation).await?;
            store_in_cache(inner, &cache, &key, &fresh);
            Ok(fresh)
        }
    }
}

/// Copy cached blobs into the build tree.
fn materialize_cached(
    inner: &Arc<SessionInner>,
    entry: &CacheEntry,
) -> Result<BTreeMap<TargetPath, String>> {
    let cache = inner
        .cache
        .as_ref()
        .ok_or_else(|| BuildError::Internal("cache entry without cache config".to_string()))?;

    let mut outputs = BTreeMap::new();
    for output in &entry.outputs {
        let data = cache.backend.load_blob(&output.digest)?;
        let abs = inner.layout.absolute(&output.target);
        write_bytes(&abs, &data)
            .map_err(|e| BuildError::io(format!("materializing {}", output.target), e))?;
        outputs.insert(output.target.clone(), output.digest.clone());
    }
    Ok(outputs)
}

/// Record an execution in the cache. Failures degrade to a warning; the
/// build already has its result.
fn store_in_cache(
    inner: &Arc<SessionInner>,
    cache: &crate::engine::cache::CacheConfig,
    key: &CacheKey,
    outputs: &BTreeMap<TargetPath, String>,
) {
    let result: Result<()> = (|| {
        let mut recorded = Vec::with_capacity(outputs.len());
        for (target, digest) in outputs {
            let abs = inner.layout.absolute(target);
            let data = read_bytes(&abs).map_err(|e| BuildError::Cache(e.to_string()))?;
            cache.backend.save_blob(&data)?;
            recorded.push(CachedOutput {
                target: target.clone(),
                digest: digest.clone(),
            });
        }
        cache.backend.store(key, &CacheEntry { outputs: recorded })
    })();

    if let Err(e) = result {
        tracing::warn!(key = key.as_str(), "cache store failed: {}", e);
    }
}
