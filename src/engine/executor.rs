//! The opaque action executor interface.
//!
//! The engine hands a fully resolved action to an executor together with the
//! sandbox preference order; the executor picks the strongest isolation mode
//! it can satisfy, runs the action, and reports the digests of the produced
//! outputs. Retry policy, if any, belongs to the executor.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::path::{Layout, TargetPath};
use crate::engine::errors::{BuildError, Result};
use crate::engine::rules::Action;
use crate::util::fs::{ensure_dir, write_string};
use crate::util::hash::sha256_file;

/// An isolation mode, strongest first in a typical preference list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxMode {
    /// No isolation; the action runs directly against the build tree.
    None,
    /// Inputs exposed through symlinks in a scratch directory.
    Symlink,
    /// Inputs copied into a scratch directory.
    Copy,
    /// Inputs hardlinked into a scratch directory.
    Hardlink,
}

/// A fully resolved invocation handed to the executor.
#[derive(Debug, Clone)]
pub struct ActionInvocation {
    pub action: Action,
    /// Every declared target with its absolute destination.
    pub targets: Vec<(TargetPath, PathBuf)>,
    /// Absolute working directory for command actions.
    pub cwd: PathBuf,
    /// Combined digest of the resolved inputs; stamp actions record it.
    pub inputs_digest: String,
    /// Acceptable isolation modes, in preference order.
    pub sandbox: Vec<SandboxMode>,
}

/// The executor's report: a digest per produced output.
#[derive(Debug, Clone)]
pub struct ActionOutcome {
    pub outputs: Vec<(TargetPath, String)>,
}

/// Executes resolved actions. Implementations may spawn real processes; the
/// engine only awaits completion.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, invocation: ActionInvocation) -> Result<ActionOutcome>;
}

/// The default executor: runs actions in place with no isolation.
pub struct LocalExecutor {
    layout: Layout,
}

impl LocalExecutor {
    pub fn new(layout: Layout) -> Self {
        LocalExecutor { layout }
    }

    fn pick_mode(sandbox: &[SandboxMode]) -> Result<SandboxMode> {
        if sandbox.is_empty() || sandbox.contains(&SandboxMode::None) {
            return Ok(SandboxMode::None);
        }
        Err(BuildError::ActionFailed {
            target: String::new(),
            message: "local executor supports only the `none` sandbox mode".to_string(),
        })
    }

    async fn run_command(
        &self,
        program: &str,
        args: &[String],
        env: &BTreeMap<String, String>,
        cwd: &PathBuf,
        label: &str,
    ) -> Result<()> {
        ensure_dir(cwd).map_err(|e| BuildError::io(format!("preparing cwd for {}", label), e))?;

        let output = tokio::process::Command::new(program)
            .args(args)
            .envs(env)
            .current_dir(cwd)
            .output()
            .await
            .map_err(|e| BuildError::ActionFailed {
                target: label.to_string(),
                message: format!("failed to spawn `{}`: {}", program, e),
            })?;

        if !output.status.success() {
            return Err(BuildError::ActionFailed {
                target: label.to_string(),
                message: format!(
                    "`{}` exited with {}: {}",
                    program,
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ActionExecutor for LocalExecutor {
    async fn execute(&self, invocation: ActionInvocation) -> Result<ActionOutcome> {
        let mode = Self::pick_mode(&invocation.sandbox)?;
        let label = invocation
            .targets
            .first()
            .map(|(t, _)| t.to_string())
            .unwrap_or_default();
        tracing::debug!(action = %invocation.action.describe(), ?mode, "executing action");

        for (_, abs) in &invocation.targets {
            if let Some(parent) = abs.parent() {
                ensure_dir(parent)
                    .map_err(|e| BuildError::io(format!("preparing outputs for {}", label), e))?;
            }
        }

        match &invocation.action {
            Action::Command {
                program, args, env, ..
            } => {
                self.run_command(program, args, env, &invocation.cwd, &label)
                    .await?;
            }
            Action::WriteFile { target, contents } => {
                let abs = self.layout.absolute(target);
                write_string(&abs, contents)
                    .map_err(|e| BuildError::io(format!("writing {}", target), e))?;
            }
            Action::CopyFile { source, target } => {
                let src = self.layout.absolute(source);
                let dst = self.layout.absolute(target);
                crate::util::fs::copy_file(&src, &dst)
                    .map_err(|e| BuildError::io(format!("copying to {}", target), e))?;
            }
            Action::Stamp { .. } => {
                for (_, abs) in &invocation.targets {
                    write_string(abs, &invocation.inputs_digest)
                        .map_err(|e| BuildError::io(format!("stamping {}", label), e))?;
                }
            }
        }

        let mut outputs = Vec::with_capacity(invocation.targets.len());
        for (target, abs) in &invocation.targets {
            let digest = sha256_file(abs).map_err(|_| BuildError::ActionFailed {
                target: target.to_string(),
                message: "rule did not produce its declared target".to_string(),
            })?;
            outputs.push((target.clone(), digest));
        }

        Ok(ActionOutcome { outputs })
    }
}
