//! Rules and their evaluated form.
//!
//! A rule is an unevaluated specification: a set of target paths in one
//! directory plus a dependency-recording producer of the action to run.
//! Evaluating it resolves the producer into a concrete action and a concrete
//! dependency set, exactly once per rule id.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::core::deps::DepSet;
use crate::core::path::{BuildPath, TargetPath};
use crate::engine::build::Build;
use crate::engine::errors::{BuildError, Result};
use crate::util::hash::sha256_bytes;

/// Unique rule identity, assigned at declaration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RuleId(pub u64);

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rule#{}", self.0)
    }
}

/// A fully resolved action description. Serializable so it can be content
/// digested for the cache key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// Run a program.
    Command {
        program: String,
        args: Vec<String>,
        env: BTreeMap<String, String>,
        /// Working directory; defaults to the rule's directory.
        cwd: Option<TargetPath>,
    },
    /// Write literal contents to the rule's target.
    WriteFile { target: TargetPath, contents: String },
    /// Copy a file to the rule's target.
    CopyFile { source: TargetPath, target: TargetPath },
    /// Write an alias stamp recording that the alias's requirements are met.
    Stamp { alias: String },
}

impl Action {
    /// Content digest of the action description.
    pub fn digest(&self) -> Result<String> {
        let bytes = serde_json::to_vec(self)
            .map_err(|e| BuildError::Internal(format!("unserializable action: {}", e)))?;
        Ok(sha256_bytes(&bytes))
    }

    /// Short human-readable description for logs.
    pub fn describe(&self) -> String {
        match self {
            Action::Command { program, args, .. } => {
                format!("{} {}", program, args.join(" "))
            }
            Action::WriteFile { target, .. } => format!("write {}", target),
            Action::CopyFile { source, target } => format!("copy {} -> {}", source, target),
            Action::Stamp { alias } => format!("stamp @{}", alias),
        }
    }
}

/// An unevaluated rule: declared targets plus the action producer.
pub struct Rule {
    pub id: RuleId,
    /// The directory the rule belongs to; every target is a direct child.
    pub dir: BuildPath,
    pub targets: BTreeSet<TargetPath>,
    /// Owning context; `None` for context-independent rules (install trees).
    pub context: Option<String>,
    body: Mutex<Option<Build<Action>>>,
}

impl Rule {
    pub(crate) fn new(
        id: RuleId,
        dir: BuildPath,
        targets: BTreeSet<TargetPath>,
        context: Option<String>,
        body: Build<Action>,
    ) -> Self {
        Rule {
            id,
            dir,
            targets,
            context,
            body: Mutex::new(Some(body)),
        }
    }

    /// Take the action producer. Single-flight evaluation guarantees this is
    /// called at most once.
    pub(crate) fn take_body(&self) -> Option<Build<Action>> {
        self.body
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    /// Label for cycle reports and logs: the first target.
    pub fn label(&self) -> String {
        self.targets
            .iter()
            .next()
            .map(|t| t.to_string())
            .unwrap_or_else(|| self.dir.to_string())
    }
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("id", &self.id)
            .field("dir", &self.dir)
            .field("targets", &self.targets)
            .field("context", &self.context)
            .finish()
    }
}

/// The resolved form of a rule, ready for execution.
#[derive(Debug, Clone)]
pub struct EvaluatedRule {
    pub id: RuleId,
    pub dir: BuildPath,
    /// The concrete dependency set accumulated across every declaration
    /// round of the rule body.
    pub deps: DepSet,
    pub targets: BTreeSet<TargetPath>,
    pub context: Option<String>,
    pub action: Action,
}
