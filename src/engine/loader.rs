//! Lazy, memoized per-directory rule discovery.
//!
//! The first reference to a directory routes it to the rule generator
//! registered for its scope, collects the declared rules and aliases,
//! validates them, and memoizes the result. The callback runs at most once
//! per directory per session; errors memoize too.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::core::deps::DepSet;
use crate::core::path::{BuildPath, BuildScope, TargetPath};
use crate::core::subdir::SubdirSet;
use crate::engine::build::Build;
use crate::engine::errors::{BuildError, Result};
use crate::engine::rules::{Action, Rule, RuleId};
use crate::engine::session::{GeneratorKey, SessionInner};

/// Declares rules for one scope (a context tree or an install tree).
///
/// `init` runs exactly once per session before any directory-specific
/// callback, with a scope rooted at the generator's scope root; rules it
/// declares are merged into that root directory. `gen_rules` runs once per
/// directory and reports which subdirectories stay visible to recursion.
pub trait RuleGenerator: Send + Sync {
    fn init(&self, scope: &mut RuleScope<'_>) -> Result<()> {
        let _ = scope;
        Ok(())
    }

    fn gen_rules(
        &self,
        scope: &mut RuleScope<'_>,
        dir: &BuildPath,
        components: &[String],
    ) -> Result<SubdirSet>;
}

/// The rule-declaration surface handed to generator callbacks.
pub struct RuleScope<'a> {
    dir: BuildPath,
    context: Option<String>,
    prefix: Vec<DepSet>,
    rules: Vec<Arc<Rule>>,
    aliases: BTreeMap<String, DepSet>,
    counter: &'a AtomicU64,
}

impl<'a> RuleScope<'a> {
    pub(crate) fn new(dir: BuildPath, counter: &'a AtomicU64) -> Self {
        let context = match &dir.scope {
            BuildScope::Context(name) => Some(name.clone()),
            BuildScope::Install(_) => None,
        };
        RuleScope {
            dir,
            context,
            prefix: Vec::new(),
            rules: Vec::new(),
            aliases: BTreeMap::new(),
            counter,
        }
    }

    /// The directory this scope declares rules for.
    pub fn dir(&self) -> &BuildPath {
        &self.dir
    }

    /// Declare a rule: a set of targets in this directory plus the producer
    /// of the action that makes them.
    pub fn rule<I>(&mut self, targets: I, body: Build<Action>) -> RuleId
    where
        I: IntoIterator<Item = TargetPath>,
    {
        let id = RuleId(self.counter.fetch_add(1, Ordering::SeqCst) + 1);

        let mut body = body;
        for extra in &self.prefix {
            body = body.with_deps(extra.clone());
        }

        let rule = Rule::new(
            id,
            self.dir.clone(),
            targets.into_iter().collect(),
            self.context.clone(),
            body,
        );
        self.rules.push(Arc::new(rule));
        id
    }

    /// Register dependencies under a named alias in this directory.
    /// Multiple registrations union.
    pub fn alias(&mut self, name: impl Into<String>, deps: DepSet) {
        self.aliases.entry(name.into()).or_default().union_with(&deps);
    }

    /// Run `f` in a scope where every declared rule also gains `extra` as
    /// shared dependencies (inherited context).
    pub fn prefix_rules<R>(&mut self, extra: DepSet, f: impl FnOnce(&mut Self) -> R) -> R {
        self.prefix.push(extra);
        let result = f(self);
        self.prefix.pop();
        result
    }

    /// The stamp target for an alias declared in `dir`.
    pub fn stamp_target(dir: &BuildPath, name: &str) -> TargetPath {
        TargetPath::Build(dir.join(format!(".alias-{}.stamp", name)))
    }

    pub(crate) fn into_pending(self) -> PendingRules {
        PendingRules {
            rules: self.rules,
            aliases: self.aliases,
        }
    }

    /// Validate the declared rules and assemble the directory's memo entry.
    pub(crate) fn finish(mut self, subdirs: SubdirSet) -> Result<LoadedDir> {
        // Alias stamps become ordinary rules so resolution and execution
        // treat them uniformly.
        for (name, deps) in self.aliases.clone() {
            let target = Self::stamp_target(&self.dir, &name);
            let alias = name.clone();
            let body = Build::record(deps).map(move |_| Action::Stamp { alias });
            self.rule([target], body);
        }

        let dir = self.dir;
        let mut rules = BTreeMap::new();
        for rule in self.rules {
            for target in &rule.targets {
                let parent_ok = matches!(
                    target,
                    TargetPath::Build(b) if b.parent().as_ref() == Some(&dir)
                );
                if !parent_ok {
                    return Err(BuildError::TargetEscapesDirectory {
                        target: target.to_string(),
                        dir: dir.to_string(),
                    });
                }
                if rules.insert(target.clone(), Arc::clone(&rule)).is_some() {
                    return Err(BuildError::DuplicateTarget {
                        target: target.to_string(),
                        dir: dir.to_string(),
                    });
                }
            }
        }

        Ok(LoadedDir {
            dir,
            rules,
            aliases: self.aliases,
            subdirs,
        })
    }
}

/// Rules declared outside `load_dir` (by `init` callbacks), waiting to be
/// merged into their scope root.
pub(crate) struct PendingRules {
    pub rules: Vec<Arc<Rule>>,
    pub aliases: BTreeMap<String, DepSet>,
}

/// The memoized result of loading one directory.
#[derive(Debug)]
pub struct LoadedDir {
    pub dir: BuildPath,
    /// Every declared rule, indexed by target path.
    pub rules: BTreeMap<TargetPath, Arc<Rule>>,
    /// Alias registrations in this directory.
    pub aliases: BTreeMap<String, DepSet>,
    /// Subdirectories visible to recursion.
    pub subdirs: SubdirSet,
}

impl LoadedDir {
    fn empty(dir: BuildPath) -> Self {
        LoadedDir {
            dir,
            rules: BTreeMap::new(),
            aliases: BTreeMap::new(),
            subdirs: SubdirSet::empty(),
        }
    }

    /// Whether an alias is registered here.
    pub fn has_alias(&self, name: &str) -> bool {
        self.aliases.contains_key(name)
    }
}

/// Run every registered generator's `init` that has not run yet.
pub(crate) async fn ensure_init(inner: &Arc<SessionInner>) -> Result<()> {
    let mut inited = inner.init_state.lock().await;

    let generators: Vec<(GeneratorKey, Arc<dyn RuleGenerator>)> = {
        let map = inner.generators.read().unwrap_or_else(|p| p.into_inner());
        map.iter().map(|(k, g)| (k.clone(), Arc::clone(g))).collect()
    };

    for (key, generator) in generators {
        if !inited.insert(key.clone()) {
            continue;
        }
        let root = key.scope_root();
        let mut scope = RuleScope::new(root, &inner.rule_counter);
        generator.init(&mut scope)?;
        let pending = scope.into_pending();
        if !pending.rules.is_empty() || !pending.aliases.is_empty() {
            inner
                .init_rules
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .insert(key, pending);
        }
    }
    Ok(())
}

/// Load a directory's rules, memoized single-flight.
///
/// The generator lookup happens outside the memo table: a directory whose
/// scope has no registered generator is not recorded, so registering one
/// later (or after `reset`) is picked up by the next load.
pub(crate) async fn load_dir(inner: &Arc<SessionInner>, dir: &BuildPath) -> Result<Arc<LoadedDir>> {
    if !inner.contexts.iter().any(|c| c == dir.scope.name()) {
        return Err(BuildError::UnknownContext {
            name: dir.scope.name().to_string(),
        });
    }

    ensure_init(inner).await?;

    let generator = {
        let map = inner.generators.read().unwrap_or_else(|p| p.into_inner());
        map.get(&GeneratorKey::of(&dir.scope)).cloned()
    };
    let Some(generator) = generator else {
        // Install trees without a generator simply have no generated rules;
        // a context without one is a configuration error.
        return match dir.scope {
            BuildScope::Context(_) => Err(BuildError::NoRulesForContext {
                scope: dir.scope.to_string(),
            }),
            BuildScope::Install(_) => Ok(Arc::new(LoadedDir::empty(dir.clone()))),
        };
    };

    let key = dir.clone();
    let task_inner = Arc::clone(inner);
    let task_dir = dir.clone();
    inner
        .dirs
        .get_or_compute(key, async move {
            compute_dir(task_inner, task_dir, generator).await
        })
        .await
}

async fn compute_dir(
    inner: Arc<SessionInner>,
    dir: BuildPath,
    generator: Arc<dyn RuleGenerator>,
) -> Result<Arc<LoadedDir>> {
    tracing::debug!(dir = %dir, "loading rules");

    let mut scope = RuleScope::new(dir.clone(), &inner.rule_counter);
    let components = dir.components();
    let subdirs = generator.gen_rules(&mut scope, &dir, &components)?;

    // Rules declared by `init` land in the scope root.
    if dir.rel.as_os_str().is_empty() {
        let pending = inner
            .init_rules
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&GeneratorKey::of(&dir.scope));
        if let Some(pending) = pending {
            scope.rules.extend(pending.rules);
            for (name, deps) in pending.aliases {
                scope.alias(name, deps);
            }
        }
    }

    let loaded = scope.finish(subdirs)?;
    Ok(Arc::new(loaded))
}
