//! Test fixtures: throwaway workspaces, closure-backed rule generators, and
//! an instrumented executor.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use crate::core::path::{BuildPath, TargetPath};
use crate::core::subdir::SubdirSet;
use crate::engine::errors::Result;
use crate::engine::executor::{ActionExecutor, ActionInvocation, ActionOutcome, LocalExecutor};
use crate::engine::loader::{RuleGenerator, RuleScope};
use crate::engine::session::{EngineConfig, Session};

/// A temporary workspace with a session over it.
pub struct TestWorkspace {
    pub tmp: TempDir,
    pub session: Session,
}

impl TestWorkspace {
    pub fn new(contexts: &[&str]) -> TestWorkspace {
        let tmp = TempDir::new().expect("create tempdir");
        let session = Session::init(EngineConfig::new(tmp.path(), contexts.iter().copied()))
            .expect("init session");
        TestWorkspace { tmp, session }
    }

    /// Write a source file, creating parent directories.
    pub fn write_source(&self, rel: &str, contents: &str) {
        let path = self.tmp.path().join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("create source dir");
        }
        std::fs::write(path, contents).expect("write source file");
    }

    /// Read a produced target back from the build tree.
    pub fn read_target(&self, target: &TargetPath) -> String {
        let abs = self.session.layout().absolute(target);
        std::fs::read_to_string(abs).expect("read target")
    }

    pub fn root(&self) -> &Path {
        self.tmp.path()
    }
}

type GenFn =
    Box<dyn Fn(&mut RuleScope<'_>, &BuildPath, &[String]) -> Result<SubdirSet> + Send + Sync>;

/// A rule generator backed by a closure, counting invocations.
pub struct FnGenerator {
    callback: GenFn,
    calls: AtomicUsize,
}

impl FnGenerator {
    pub fn new<F>(callback: F) -> Arc<FnGenerator>
    where
        F: Fn(&mut RuleScope<'_>, &BuildPath, &[String]) -> Result<SubdirSet>
            + Send
            + Sync
            + 'static,
    {
        Arc::new(FnGenerator {
            callback: Box::new(callback),
            calls: AtomicUsize::new(0),
        })
    }

    /// How many times `gen_rules` ran.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl RuleGenerator for FnGenerator {
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

/// Wraps [`LocalExecutor`], counting runs and observing concurrency.
pub struct CountingExecutor {
    delegate: LocalExecutor,
    runs: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    delay: Option<Duration>,
}

impl CountingExecutor {
    pub fn new(session: &Session) -> Arc<CountingExecutor> {
        Self::with_delay(session, None)
    }

    /// Add an artificial delay per action so overlap is observable.
    pub fn with_delay(session: &Session, delay: Option<Duration>) -> Arc<CountingExecutor> {
        Arc::new(CountingExecutor {
            delegate: LocalExecutor::new(session.layout().clone()),
            runs: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            delay,
        })
    }

    /// Total actions executed.
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    /// The largest number of actions observed running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ActionExecutor for CountingExecutor {
    async fn execute(&self, invocation: ActionInvocation) -> Result<ActionOutcome> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let result = self.delegate.execute(invocation).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
