//! Engine error taxonomy.
//!
//! Every variant carries owned, cloneable payloads so results can live in
//! shared memo tables: all concurrent requesters of a failed computation see
//! the same error. Fatal errors fail the enclosing request only; the session
//! survives and can be `reset`.

use thiserror::Error;

/// Error produced while loading rules, evaluating them, or running a build.
#[derive(Debug, Clone, Error)]
pub enum BuildError {
    #[error("no rule generator registered for `{scope}`")]
    NoRulesForContext { scope: String },

    #[error("no rule to build target `{target}`")]
    NoRuleForTarget { target: String },

    #[error("source file does not exist: `{path}`")]
    SourceFileMissing { path: String },

    #[error("rule target `{target}` escapes its directory `{dir}`")]
    TargetEscapesDirectory { target: String, dir: String },

    #[error("duplicate rule for target `{target}` in `{dir}`")]
    DuplicateTarget { target: String, dir: String },

    #[error("dependency cycle: {}", .chain.join(" -> "))]
    DependencyCycle { chain: Vec<String> },

    #[error("alias `{name}` not found under `{dir}`{}", .loc.as_ref().map(|l| format!(" (requested at {})", l)).unwrap_or_default())]
    AliasNotFound {
        name: String,
        dir: String,
        loc: Option<String>,
    },

    #[error("alias `{name}` does not resolve in any of the requested contexts: {}", .contexts.join(", "))]
    AliasNoContext { name: String, contexts: Vec<String> },

    #[error("invalid glob pattern `{pattern}`: {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("action failed for `{target}`: {message}")]
    ActionFailed { target: String, message: String },

    #[error("cache backend error: {0}")]
    Cache(String),

    #[error("{context}: {message}")]
    Io { context: String, message: String },

    #[error("unknown context `{name}`")]
    UnknownContext { name: String },

    #[error("no {what} registered with the session")]
    CollaboratorMissing { what: String },

    #[error("build cancelled")]
    Cancelled,

    #[error("internal engine error: {0}")]
    Internal(String),
}

impl BuildError {
    /// Wrap a filesystem-level error with context.
    pub fn io(context: impl Into<String>, err: impl std::fmt::Display) -> Self {
        BuildError::Io {
            context: context.into(),
            message: err.to_string(),
        }
    }

    /// Whether this error class is a configuration error (programming error
    /// in the rule setup, never retried).
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            BuildError::NoRulesForContext { .. }
                | BuildError::NoRuleForTarget { .. }
                | BuildError::TargetEscapesDirectory { .. }
                | BuildError::DuplicateTarget { .. }
                | BuildError::InvalidPattern { .. }
        )
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, BuildError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_names_chain() {
        let err = BuildError::DependencyCycle {
            chain: vec!["default/a".to_string(), "default/b".to_string(), "default/a".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "dependency cycle: default/a -> default/b -> default/a"
        );
    }

    #[test]
    fn test_alias_not_found_location() {
        let err = BuildError::AliasNotFound {
            name: "test".to_string(),
            dir: "lib".to_string(),
            loc: Some("cli".to_string()),
        };
        assert!(err.to_string().contains("requested at cli"));
    }

    #[test]
    fn test_is_configuration() {
        assert!(BuildError::NoRulesForContext { scope: "x".into() }.is_configuration());
        assert!(!BuildError::Cancelled.is_configuration());
    }
}
