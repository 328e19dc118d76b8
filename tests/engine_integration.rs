//! End-to-end engine tests: rule discovery, scheduling, caching, aliases.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use drydock::{
    Action, ActionExecutor, ActionInvocation, ActionOutcome, AliasRequest, Build, BuildError,
    BuildPath, BuildScope, CacheConfig, DepSet, EngineConfig, GeneratorKey, LocalCache,
    LocalExecutor, Result, RuleGenerator, RuleScope, Session, SubdirSet, TargetPath,
    VcsEnumerator, VcsTree,
};

type GenFn =
    Box<dyn Fn(&mut RuleScope<'_>, &BuildPath, &[String]) -> Result<SubdirSet> + Send + Sync>;

/// Closure-backed generator counting invocations.
struct Gen {
    callback: GenFn,
    calls: AtomicUsize,
}

impl Gen {
    fn new<F>(callback: F) -> Arc<Gen>
    where
        F: Fn(&mut RuleScope<'_>, &BuildPath, &[String]) -> Result<SubdirSet>
            + Send
            + Sync
            + 'static,
    {
        Arc::new(Gen {
            callback: Box::new(callback),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl RuleGenerator for Gen {
    fn gen_rules(
        &self,
        scope: &mut RuleScope<'_>,
        dir: &BuildPath,
        components: &[String],
    ) -> Result<SubdirSet> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.callback)(scope, dir, components)
    }
}

/// Wraps the local executor, counting runs, observing overlap, and logging
/// start/end events per target.
struct Instrumented {
    delegate: LocalExecutor,
    runs: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    events: Mutex<Vec<String>>,
    delay: Option<Duration>,
}

impl Instrumented {
    fn new(session: &Session, delay: Option<Duration>) -> Arc<Instrumented> {
        Arc::new(Instrumented {
            delegate: LocalExecutor::new(session.layout().clone()),
            runs: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            events: Mutex::new(Vec::new()),
            delay,
        })
    }

    fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl ActionExecutor for Instrumented {
    async fn execute(&self, invocation: ActionInvocation) -> Result<ActionOutcome> {
        let label = invocation
            .targets
            .first()
            .map(|(t, _)| t.to_string())
            .unwrap_or_default();

        self.runs.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.events.lock().unwrap().push(format!("start {}", label));

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let result = self.delegate.execute(invocation).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.events.lock().unwrap().push(format!("end {}", label));
        result
    }
}

/// Deliberately nondeterministic: ignores the action and writes a fresh
/// counter value to every target on each run.
struct NondetExecutor {
    counter: Arc<AtomicUsize>,
}

#[async_trait]
impl ActionExecutor for NondetExecutor {
    async fn execute(&self, invocation: ActionInvocation) -> Result<ActionOutcome> {
        let value = format!("run-{}", self.counter.fetch_add(1, Ordering::SeqCst));
        let mut outputs = Vec::new();
        for (target, abs) in &invocation.targets {
            if let Some(parent) = abs.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(abs, &value).unwrap();
            outputs.push((
                target.clone(),
                drydock::util::hash::sha256_bytes(value.as_bytes()),
            ));
        }
        Ok(ActionOutcome { outputs })
    }
}

struct StaticVcs {
    trees: Vec<VcsTree>,
}

impl VcsEnumerator for StaticVcs {
    fn trees(&self) -> anyhow::Result<Vec<VcsTree>> {
        Ok(self.trees.clone())
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn session(root: &TempDir) -> Session {
    init_tracing();
    Session::init(EngineConfig::new(root.path(), ["default"])).unwrap()
}

fn register(session: &Session, context: &str, generator: Arc<Gen>) {
    session
        .register_generator(GeneratorKey::Context(context.to_string()), generator)
        .unwrap();
}

fn write_rule(scope: &mut RuleScope<'_>, name: &str, contents: &str, deps: DepSet) -> TargetPath {
    let target = TargetPath::Build(scope.dir().join(name));
    let action_target = target.clone();
    let contents = contents.to_string();
    scope.rule(
        [target.clone()],
        Build::record(deps).map(move |_| Action::WriteFile {
            target: action_target,
            contents,
        }),
    );
    target
}

fn read_target(session: &Session, target: &TargetPath) -> String {
    std::fs::read_to_string(session.layout().absolute(target)).unwrap()
}

#[tokio::test]
async fn test_generator_invoked_once_per_directory_across_builds() {
    let root = TempDir::new().unwrap();
    std::fs::create_dir_all(root.path().join("lib")).unwrap();

    let generator = Gen::new(|scope, _dir, components| {
        if components.is_empty() {
            write_rule(scope, "top.txt", "top", DepSet::new());
            Ok(SubdirSet::of(["lib"]))
        } else {
            write_rule(scope, "dep.txt", "dep", DepSet::new());
            Ok(SubdirSet::empty())
        }
    });

    let session = session(&root);
    register(&session, "default", generator.clone());

    let top = TargetPath::build("default", "top.txt");
    let dep = TargetPath::build("default", "lib/dep.txt");

    session.do_build(Build::path(top.clone())).await.unwrap();
    session
        .do_build(Build::paths([top, dep.clone()]))
        .await
        .unwrap();
    session.do_build(Build::path(dep)).await.unwrap();

    // Root and lib each loaded exactly once despite three builds.
    assert_eq!(generator.calls(), 2);
}

#[tokio::test]
async fn test_concurrent_cycle_requests_error_instead_of_deadlocking() {
    let root = TempDir::new().unwrap();
    let generator = Gen::new(|scope, _dir, _components| {
        let a = TargetPath::Build(scope.dir().join("a.txt"));
        let b = TargetPath::Build(scope.dir().join("b.txt"));
        write_rule(scope, "a.txt", "a", DepSet::file(b));
        write_rule(scope, "b.txt", "b", DepSet::file(a));
        Ok(SubdirSet::empty())
    });

    let session = session(&root);
    register(&session, "default", generator);

    let s1 = session.clone();
    let s2 = session.clone();
    let build_a =
        tokio::spawn(async move { s1.do_build(Build::path(TargetPath::build("default", "a.txt"))).await });
    let build_b =
        tokio::spawn(async move { s2.do_build(Build::path(TargetPath::build("default", "b.txt"))).await });

    let results = tokio::time::timeout(Duration::from_secs(10), async {
        (build_a.await.unwrap(), build_b.await.unwrap())
    })
    .await
    .expect("cycle must not deadlock");

    for result in [results.0, results.1] {
        match result {
            Err(BuildError::DependencyCycle { chain }) => {
                assert!(chain.iter().any(|l| l.contains("a.txt")));
                assert!(chain.iter().any(|l| l.contains("b.txt")));
            }
            Err(other) => panic!("expected cycle error, got {}", other),
            Ok(_) => panic!("cyclic build cannot succeed"),
        }
    }
}

fn cached_session(root: &TempDir, cache_root: &std::path::Path, probability: f64) -> Session {
    let cache = CacheConfig::new(Arc::new(LocalCache::new(cache_root)), probability).unwrap();
    Session::init(EngineConfig::new(root.path(), ["default"]).with_cache(cache)).unwrap()
}

fn cacheable_generator() -> Arc<Gen> {
    Gen::new(|scope, _dir, _components| {
        write_rule(
            scope,
            "out.txt",
            "cached-content",
            DepSet::file(TargetPath::source("input.c")),
        );
        Ok(SubdirSet::empty())
    })
}

#[tokio::test]
async fn test_cache_hit_skips_execution_with_identical_outputs() {
    let root = TempDir::new().unwrap();
    let cache_root = TempDir::new().unwrap();
    std::fs::write(root.path().join("input.c"), "int x;").unwrap();

    let target = TargetPath::build("default", "out.txt");

    // First session: a miss, so the action executes and populates the cache.
    let first = cached_session(&root, cache_root.path(), 0.0);
    let exec1 = Instrumented::new(&first, None);
    first.set_executor(exec1.clone());
    register(&first, "default", cacheable_generator());
    first.do_build(Build::path(target.clone())).await.unwrap();
    assert_eq!(exec1.runs(), 1);
    let first_bytes = std::fs::read(first.layout().absolute(&target)).unwrap();

    // Second session, same cache: zero executor invocations, identical bits.
    let second = cached_session(&root, cache_root.path(), 0.0);
    let exec2 = Instrumented::new(&second, None);
    second.set_executor(exec2.clone());
    register(&second, "default", cacheable_generator());
    second.do_build(Build::path(target.clone())).await.unwrap();

    assert_eq!(exec2.runs(), 0);
    let second_bytes = std::fs::read(second.layout().absolute(&target)).unwrap();
    assert_eq!(first_bytes, second_bytes);
}

#[tokio::test]
async fn test_cache_verification_reports_nondeterministic_rule() {
    let root = TempDir::new().unwrap();
    let cache_root = TempDir::new().unwrap();
    std::fs::write(root.path().join("input.c"), "int x;").unwrap();

    let counter = Arc::new(AtomicUsize::new(0));
    let target = TargetPath::build("default", "out.txt");

    let first = cached_session(&root, cache_root.path(), 1.0);
    first.set_executor(Arc::new(NondetExecutor {
        counter: Arc::clone(&counter),
    }));
    register(&first, "default", cacheable_generator());
    first.do_build(Build::path(target.clone())).await.unwrap();
    assert_eq!(read_target(&first, &target), "run-0");
    assert!(first.diagnostics().is_empty());

    // check_probability = 1: the hit is always verified, the rerun produces
    // different bytes, and the mismatch is surfaced without failing the
    // build.
    let second = cached_session(&root, cache_root.path(), 1.0);
    second.set_executor(Arc::new(NondetExecutor { counter }));
    register(&second, "default", cacheable_generator());
    second.do_build(Build::path(target.clone())).await.unwrap();

    assert_eq!(read_target(&second, &target), "run-1");
    let diagnostics = second.diagnostics();
    assert_eq!(diagnostics.len(), 1);
    assert!(diagnostics[0].message.contains("cache integrity"));
}

fn alias_generator() -> Arc<Gen> {
    Gen::new(|scope, _dir, components| match components {
        [] => Ok(SubdirSet::of(["a"])),
        [first] if first == "a" => {
            let x = write_rule(scope, "x.txt", "X", DepSet::new());
            scope.alias("t", DepSet::file(x));
            Ok(SubdirSet::of(["b"]))
        }
        [first, second] if first == "a" && second == "b" => {
            let y = write_rule(scope, "y.txt", "Y", DepSet::new());
            scope.alias("t", DepSet::file(y));
            Ok(SubdirSet::empty())
        }
        _ => Ok(SubdirSet::empty()),
    })
}

fn alias_workspace() -> TempDir {
    let root = TempDir::new().unwrap();
    std::fs::create_dir_all(root.path().join("a/b")).unwrap();
    root
}

#[tokio::test]
async fn test_recursive_alias_pulls_in_subdirectories() {
    let root = alias_workspace();
    let session = session(&root);
    register(&session, "default", alias_generator());

    session
        .do_build(Build::alias(AliasRequest::new("a", "t").recursive()))
        .await
        .unwrap();

    let x = TargetPath::build("default", "a/x.txt");
    let y = TargetPath::build("default", "a/b/y.txt");
    assert_eq!(read_target(&session, &x), "X");
    assert_eq!(read_target(&session, &y), "Y");
}

#[tokio::test]
async fn test_non_recursive_alias_stops_at_its_directory() {
    let root = alias_workspace();
    let session = session(&root);
    register(&session, "default", alias_generator());

    session
        .do_build(Build::alias(AliasRequest::new("a", "t")))
        .await
        .unwrap();

    let x = TargetPath::build("default", "a/x.txt");
    let y = TargetPath::build("default", "a/b/y.txt");
    assert_eq!(read_target(&session, &x), "X");
    assert!(!session.layout().absolute(&y).exists());
}

#[tokio::test]
async fn test_multi_context_alias_requires_at_least_one_resolution() {
    let root = TempDir::new().unwrap();
    let session =
        Session::init(EngineConfig::new(root.path(), ["host", "cross"])).unwrap();

    // The alias exists only under the host context.
    let generator = Gen::new(|scope, dir, _components| {
        if dir.scope == BuildScope::Context("host".to_string()) {
            let x = write_rule(scope, "x.txt", "X", DepSet::new());
            scope.alias("t", DepSet::file(x));
        }
        Ok(SubdirSet::empty())
    });
    register(&session, "host", generator.clone());
    register(&session, "cross", generator);

    session
        .do_build(Build::alias(AliasRequest::new("", "t").in_contexts(["host"])))
        .await
        .unwrap();

    let err = session
        .do_build(Build::alias(
            AliasRequest::new("", "t").in_contexts(["cross"]),
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, BuildError::AliasNoContext { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_independent_rules_run_concurrently() {
    let root = TempDir::new().unwrap();
    let generator = Gen::new(|scope, _dir, _components| {
        write_rule(scope, "left.txt", "left", DepSet::new());
        write_rule(scope, "right.txt", "right", DepSet::new());
        Ok(SubdirSet::empty())
    });

    let session = session(&root);
    let executor = Instrumented::new(&session, Some(Duration::from_millis(100)));
    session.set_executor(executor.clone());
    register(&session, "default", generator);

    session
        .do_build(Build::paths([
            TargetPath::build("default", "left.txt"),
            TargetPath::build("default", "right.txt"),
        ]))
        .await
        .unwrap();

    assert_eq!(executor.runs(), 2);
    assert!(
        executor.max_in_flight() >= 2,
        "independent rules should overlap, max in flight was {}",
        executor.max_in_flight()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dependent_rule_waits_for_materialized_inputs() {
    let root = TempDir::new().unwrap();
    let generator = Gen::new(|scope, _dir, _components| {
        let leaf = write_rule(scope, "leaf.txt", "leaf", DepSet::new());
        write_rule(scope, "top.txt", "top", DepSet::file(leaf));
        Ok(SubdirSet::empty())
    });

    let session = session(&root);
    let executor = Instrumented::new(&session, Some(Duration::from_millis(20)));
    session.set_executor(executor.clone());
    register(&session, "default", generator);

    session
        .do_build(Build::path(TargetPath::build("default", "top.txt")))
        .await
        .unwrap();

    let events = executor.events();
    let leaf_end = events
        .iter()
        .position(|e| e == "end default/leaf.txt")
        .expect("leaf must run");
    let top_start = events
        .iter()
        .position(|e| e == "start default/top.txt")
        .expect("top must run");
    assert!(
        leaf_end < top_start,
        "dependent rule started before its input materialized: {:?}",
        events
    );
}

#[tokio::test]
async fn test_all_targets_and_is_target_walk_the_rule_graph() {
    let root = TempDir::new().unwrap();
    std::fs::create_dir_all(root.path().join("lib")).unwrap();

    let generator = Gen::new(|scope, _dir, components| {
        if components.is_empty() {
            write_rule(scope, "top.txt", "top", DepSet::new());
            Ok(SubdirSet::of(["lib"]))
        } else {
            write_rule(scope, "dep.txt", "dep", DepSet::new());
            Ok(SubdirSet::empty())
        }
    });

    let session = session(&root);
    register(&session, "default", generator);

    let targets = session.all_targets().await.unwrap();
    let top = TargetPath::build("default", "top.txt");
    let dep = TargetPath::build("default", "lib/dep.txt");
    assert!(targets.contains(&top));
    assert!(targets.contains(&dep));

    assert!(session.is_target(&top).await.unwrap());
    assert!(!session
        .is_target(&TargetPath::build("default", "ghost.txt"))
        .await
        .unwrap());
    assert!(!session.is_target(&TargetPath::source("top.txt")).await.unwrap());
}

#[tokio::test]
async fn test_stale_untracked_files_are_reported_for_deletion() {
    let root = TempDir::new().unwrap();
    std::fs::create_dir_all(root.path().join("src")).unwrap();
    std::fs::create_dir_all(root.path().join("gen")).unwrap();
    std::fs::write(root.path().join("src/main.c"), "int main;").unwrap();
    std::fs::write(root.path().join("src/stale.o"), "old object").unwrap();
    // Untracked, but still produced by a rule: a live promoted output.
    std::fs::write(root.path().join("gen/out.txt"), "generated").unwrap();

    let generator = Gen::new(|scope, _dir, components| {
        if components.is_empty() {
            Ok(SubdirSet::of(["gen"]))
        } else {
            write_rule(scope, "out.txt", "generated", DepSet::new());
            Ok(SubdirSet::empty())
        }
    });

    let session = session(&root);
    register(&session, "default", generator);
    session.register_vcs(Arc::new(StaticVcs {
        trees: vec![VcsTree {
            root: PathBuf::new(),
            tracked: [PathBuf::from("src/main.c")].into_iter().collect(),
        }],
    }));

    let stale = session.files_in_source_tree_to_delete().await.unwrap();
    assert_eq!(stale, vec![PathBuf::from("src/stale.o")]);
}

#[tokio::test]
async fn test_package_deps_maps_closure_through_assignment() {
    let root = TempDir::new().unwrap();
    std::fs::create_dir_all(root.path().join("lib")).unwrap();

    let generator = Gen::new(|scope, _dir, components| {
        if components.is_empty() {
            write_rule(
                scope,
                "top.txt",
                "top",
                DepSet::file(TargetPath::build("default", "lib/dep.txt")),
            );
            Ok(SubdirSet::of(["lib"]))
        } else {
            write_rule(scope, "dep.txt", "dep", DepSet::new());
            Ok(SubdirSet::empty())
        }
    });

    let session = session(&root);
    register(&session, "default", generator);
    session.set_package_assignment(Arc::new(|path: &BuildPath| {
        if path.rel.starts_with("lib") {
            ["libpkg".to_string()].into_iter().collect()
        } else {
            BTreeSet::new()
        }
    }));

    let packages = session
        .package_deps(&TargetPath::build("default", "top.txt"))
        .await
        .unwrap();
    assert_eq!(packages, ["libpkg".to_string()].into_iter().collect());

    let fresh = Session::init(EngineConfig::new(root.path(), ["default"])).unwrap();
    let err = fresh
        .package_deps(&TargetPath::build("default", "top.txt"))
        .await
        .unwrap_err();
    assert!(matches!(err, BuildError::CollaboratorMissing { .. }));
}

#[tokio::test]
async fn test_reset_discards_memo_state_and_registrations() {
    let root = TempDir::new().unwrap();
    let make_generator = || {
        Gen::new(|scope, _dir, _components| {
            write_rule(scope, "out.txt", "fresh", DepSet::new());
            Ok(SubdirSet::empty())
        })
    };

    let session = session(&root);
    let executor = Instrumented::new(&session, None);
    session.set_executor(executor.clone());
    register(&session, "default", make_generator());

    let target = TargetPath::build("default", "out.txt");
    session.do_build(Build::path(target.clone())).await.unwrap();
    assert_eq!(executor.runs(), 1);

    session.reset();

    // Registrations are gone; the context now has no generator.
    let err = session.do_build(Build::path(target.clone())).await.unwrap_err();
    assert!(matches!(err, BuildError::NoRulesForContext { .. }));

    // Re-registering rebuilds from scratch.
    register(&session, "default", make_generator());
    session.do_build(Build::path(target)).await.unwrap();
    assert_eq!(executor.runs(), 2);
}

#[tokio::test]
async fn test_env_dependencies_enter_the_cache_key() {
    let root = TempDir::new().unwrap();
    let cache_root = TempDir::new().unwrap();

    let generator = || {
        Gen::new(|scope, _dir, _components| {
            let target = TargetPath::Build(scope.dir().join("cfg.txt"));
            let action_target = target.clone();
            let body = drydock::env("DRYDOCK_IT_CFG").map(move |value| Action::WriteFile {
                target: action_target,
                contents: value.unwrap_or_default(),
            });
            scope.rule([target], body);
            Ok(SubdirSet::empty())
        })
    };

    let target = TargetPath::build("default", "cfg.txt");

    std::env::set_var("DRYDOCK_IT_CFG", "one");
    let first = cached_session(&root, cache_root.path(), 0.0);
    let exec1 = Instrumented::new(&first, None);
    first.set_executor(exec1.clone());
    register(&first, "default", generator());
    first.do_build(Build::path(target.clone())).await.unwrap();
    assert_eq!(exec1.runs(), 1);

    // A different environment value is a different key: the action reruns.
    std::env::set_var("DRYDOCK_IT_CFG", "two");
    let second = cached_session(&root, cache_root.path(), 0.0);
    let exec2 = Instrumented::new(&second, None);
    second.set_executor(exec2.clone());
    register(&second, "default", generator());
    second.do_build(Build::path(target.clone())).await.unwrap();
    assert_eq!(exec2.runs(), 1);
    assert_eq!(read_target(&second, &target), "two");
    std::env::remove_var("DRYDOCK_IT_CFG");
}

#[tokio::test]
async fn test_selector_matches_source_files_and_feeds_rules() {
    let root = TempDir::new().unwrap();
    std::fs::create_dir_all(root.path().join("src")).unwrap();
    std::fs::write(root.path().join("src/a.c"), "a").unwrap();
    std::fs::write(root.path().join("src/b.c"), "b").unwrap();
    std::fs::write(root.path().join("src/README"), "docs").unwrap();

    let generator = Gen::new(|scope, _dir, _components| {
        let target = TargetPath::Build(scope.dir().join("sources.list"));
        let action_target = target.clone();
        let selector =
            drydock::FileSelector::new(TargetPath::source("src"), "*.c").unwrap();
        let body = drydock::select(selector).map(move |matches| {
            let listing: Vec<String> = matches.iter().map(|m| m.to_string()).collect();
            Action::WriteFile {
                target: action_target,
                contents: listing.join("\n"),
            }
        });
        scope.rule([target], body);
        Ok(SubdirSet::empty())
    });

    let session = session(&root);
    register(&session, "default", generator);

    let target = TargetPath::build("default", "sources.list");
    session.do_build(Build::path(target.clone())).await.unwrap();

    assert_eq!(read_target(&session, &target), "src/a.c\nsrc/b.c");
}
