//! Alias resolution.
//!
//! An alias's build dependency is a synthetic stamp target, one per
//! (directory, name, context), declared by the loader alongside ordinary
//! rules. Resolution maps an [`AliasRequest`] to the stamp targets it
//! covers; recursive requests descend into every kept subdirectory.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::core::deps::AliasRequest;
use crate::core::path::{BuildPath, TargetPath};
use crate::core::subdir::SubdirSet;
use crate::engine::errors::{BuildError, Result};
use crate::engine::loader::{load_dir, RuleScope};
use crate::engine::session::SessionInner;
use crate::util::fs::{join_rel, list_subdirs};

/// Resolve an alias request to the stamp targets it depends on.
///
/// Absence of the alias below the root is "nothing to do there"; absence
/// everywhere is an error, since the request named the alias explicitly.
pub(crate) async fn resolve_alias(
    inner: Arc<SessionInner>,
    request: AliasRequest,
) -> Result<Vec<TargetPath>> {
    let contexts: Vec<String> = if request.contexts.is_empty() {
        inner.contexts.clone()
    } else {
        for name in &request.contexts {
            if !inner.contexts.iter().any(|c| c == name) {
                return Err(BuildError::UnknownContext { name: name.clone() });
            }
        }
        request.contexts.clone()
    };

    let mut stamps = Vec::new();
    for context in &contexts {
        let dir = BuildPath::context(context.clone(), request.dir.clone());
        collect(&inner, dir, &request.name, request.recursive, &mut stamps).await?;
    }

    if stamps.is_empty() {
        if !request.contexts.is_empty() {
            return Err(BuildError::AliasNoContext {
                name: request.name.clone(),
                contexts: request.contexts.clone(),
            });
        }
        return Err(BuildError::AliasNotFound {
            name: request.name.clone(),
            dir: request.dir.display().to_string(),
            loc: request.loc.clone(),
        });
    }

    stamps.sort();
    stamps.dedup();
    Ok(stamps)
}

fn collect<'a>(
    inner: &'a Arc<SessionInner>,
    dir: BuildPath,
    name: &'a str,
    recursive: bool,
    stamps: &'a mut Vec<TargetPath>,
) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
    Box::pin(async move {
        let loaded = load_dir(inner, &dir).await?;
        if loaded.has_alias(name) {
            stamps.push(RuleScope::stamp_target(&dir, name));
        }

        if recursive {
            for sub in kept_subdirs(inner, &dir, &loaded.subdirs)? {
                collect(inner, dir.join(&sub), name, true, stamps).await?;
            }
        }
        Ok(())
    })
}

/// The subdirectories of `dir` visible to recursion: on-disk source
/// subdirectories filtered by the keep set, plus explicitly named
/// (build-only) ones. The build root and dot-directories never count.
pub(crate) fn kept_subdirs(
    inner: &SessionInner,
    dir: &BuildPath,
    subdirs: &SubdirSet,
) -> Result<Vec<String>> {
    let source_dir = join_rel(&inner.layout.workspace_root, &dir.rel);
    let on_disk = list_subdirs(&source_dir)
        .map_err(|e| BuildError::io(format!("listing subdirectories of {}", dir), e))?;

    let mut names: Vec<String> = on_disk
        .into_iter()
        .filter(|name| !name.starts_with('.'))
        .filter(|name| source_dir.join(name) != inner.layout.build_root)
        .filter(|name| subdirs.contains(name))
        .collect();

    if let Some(extra) = subdirs.names() {
        for name in extra {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
    }

    names.sort();
    Ok(names)
}
