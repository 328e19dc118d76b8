//! Query surface over the rule graph: target enumeration, stale-file
//! detection, per-package dependency closures.

use std::collections::BTreeSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use walkdir::WalkDir;

use crate::core::path::{BuildPath, TargetPath};
use crate::engine::alias::kept_subdirs;
use crate::engine::build::Build;
use crate::engine::errors::{BuildError, Result};
use crate::engine::loader::{ensure_init, load_dir};
use crate::engine::session::{GeneratorKey, Session, SessionInner, VcsTree};
use crate::util::fs::join_rel;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

impl Session {
    /// Every declared target reachable by walking the configured contexts
    /// (and any install tree with a registered generator), pruning by each
    /// directory's subdir-keep set and, when a VCS enumerator is
    /// registered, by the version-controlled trees.
    pub async fn all_targets(&self) -> Result<Vec<TargetPath>> {
        let inner = Arc::clone(&self.inner);
        ensure_init(&inner).await?;

        let trees = self.vcs_trees()?;

        let mut roots: Vec<BuildPath> = inner
            .contexts
            .iter()
            .map(|c| BuildPath::context(c.clone(), ""))
            .collect();
        {
            let generators = inner.generators.read().unwrap_or_else(|p| p.into_inner());
            roots.extend(generators.keys().filter_map(|key| match key {
                GeneratorKey::Install(_) => Some(key.scope_root()),
                GeneratorKey::Context(_) => None,
            }));
        }

        let mut targets = Vec::new();
        for root in roots {
            walk_targets(&inner, root, &trees, &mut targets).await?;
        }

        targets.sort();
        targets.dedup();
        Ok(targets)
    }

    /// Whether some rule declares this build path as a target.
    pub async fn is_target(&self, target: &TargetPath) -> Result<bool> {
        let Some(build_path) = target.as_build() else {
            return Ok(false);
        };
        let Some(parent) = build_path.parent() else {
            return Ok(false);
        };
        let loaded = load_dir(&self.inner, &parent).await?;
        Ok(loaded.rules.contains_key(target))
    }

    /// Source-tree files that are not version-controlled and that no rule
    /// produces any longer: stale byproducts safe to delete. Without a
    /// registered VCS enumerator nothing can be told apart, so nothing is
    /// reported.
    pub async fn files_in_source_tree_to_delete(&self) -> Result<Vec<PathBuf>> {
        let Some(trees) = self.vcs_trees()? else {
            return Ok(Vec::new());
        };

        let produced: BTreeSet<PathBuf> = self
            .all_targets()
            .await?
            .iter()
            .filter_map(|t| t.as_build().map(|b| b.rel.clone()))
            .collect();

        let inner = &self.inner;
        let build_root = inner.layout.build_root.clone();
        let mut stale = Vec::new();

        for tree in &trees {
            let tree_abs = join_rel(&inner.layout.workspace_root, &tree.root);
            let walker = WalkDir::new(&tree_abs).into_iter().filter_entry(|e| {
                let hidden = e.depth() > 0
                    && e.file_name().to_string_lossy().starts_with('.');
                !hidden && !e.path().starts_with(&build_root)
            });

            for entry in walker {
                let entry =
                    entry.map_err(|e| BuildError::io("walking source tree", e))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let Ok(rel_tree) = entry.path().strip_prefix(&tree_abs) else {
                    continue;
                };
                if tree.tracked.contains(rel_tree) {
                    continue;
                }
                let rel_ws = tree.root.join(rel_tree);
                if produced.contains(&rel_ws) {
                    continue;
                }
                stale.push(rel_ws);
            }
        }

        stale.sort();
        stale.dedup();
        Ok(stale)
    }

    /// The packages the transitive rule closure of `target` depends on,
    /// per the registered package assignment function.
    pub async fn package_deps(&self, target: &TargetPath) -> Result<BTreeSet<String>> {
        let assign = {
            let guard = self
                .inner
                .package_assign
                .read()
                .unwrap_or_else(|p| p.into_inner());
            guard.clone()
        };
        let Some(assign) = assign else {
            return Err(BuildError::CollaboratorMissing {
                what: "package assignment function".to_string(),
            });
        };

        let rules = self
            .evaluate_rules(true, Build::path(target.clone()))
            .await?;

        let mut packages = BTreeSet::new();
        for rule in &rules {
            for dep in rule.deps.files() {
                if let Some(build_path) = dep.as_build() {
                    packages.extend(assign(build_path));
                }
            }
        }
        Ok(packages)
    }

    fn vcs_trees(&self) -> Result<Option<Vec<VcsTree>>> {
        let vcs = {
            let guard = self.inner.vcs.read().unwrap_or_else(|p| p.into_inner());
            guard.clone()
        };
        match vcs {
            None => Ok(None),
            Some(vcs) => vcs
                .trees()
                .map(Some)
                .map_err(|e| BuildError::io("enumerating version-controlled trees", e)),
        }
    }
}

fn walk_targets<'a>(
    inner: &'a Arc<SessionInner>,
    dir: BuildPath,
    trees: &'a Option<Vec<VcsTree>>,
    out: &'a mut Vec<TargetPath>,
) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        let loaded = load_dir(inner, &dir).await?;
        out.extend(loaded.rules.keys().cloned());

        for sub in kept_subdirs(inner, &dir, &loaded.subdirs)? {
            let child_rel = dir.rel.join(&sub);
            if let Some(trees) = trees {
                if !vcs_allows(trees, &child_rel) {
                    continue;
                }
            }
            walk_targets(inner, dir.join(&sub), trees, out).await?;
        }
        Ok(())
    })
}

/// A directory is worth descending into when it lies inside a
/// version-controlled tree, or contains one.
fn vcs_allows(trees: &[VcsTree], rel: &Path) -> bool {
    trees
        .iter()
        .any(|tree| rel.starts_with(&tree.root) || tree.root.starts_with(rel))
}
