//! Single-flight memoization and the wait-for graph.
//!
//! Memo tables are mutated exactly once per key: the first task to reach a
//! missing key spawns the computation, every other concurrent requester
//! awaits that one result. Computations run on detached tasks, so an
//! abandoned requester never kills work that other requesters (or a later
//! session query) can still use.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::watch;

use crate::engine::errors::{BuildError, Result};

enum Slot<T> {
    Pending(watch::Receiver<Option<Result<T>>>),
    Done(Result<T>),
}

/// A keyed single-flight table: at most one in-progress computation per key,
/// shared by all concurrent requesters; completed results are memoized.
pub(crate) struct SingleFlight<K, T> {
    slots: Arc<DashMap<K, Slot<T>>>,
}

impl<K, T> SingleFlight<K, T>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        SingleFlight {
            slots: Arc::new(DashMap::new()),
        }
    }

    /// Return the memoized result for `key`, or make this call responsible
    /// for computing it. `compute` is lazy; it is dropped unawaited when
    /// another task already owns the key.
    pub async fn get_or_compute<F>(&self, key: K, compute: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let rx = match self.slots.entry(key.clone()) {
            Entry::Occupied(slot) => match slot.get() {
                Slot::Done(result) => return result.clone(),
                Slot::Pending(rx) => rx.clone(),
            },
            Entry::Vacant(vacant) => {
                let (tx, rx) = watch::channel(None);
                vacant.insert(Slot::Pending(rx.clone()));

                let slots = Arc::clone(&self.slots);
                tokio::spawn(async move {
                    let result = compute.await;
                    slots.insert(key, Slot::Done(result.clone()));
                    let _ = tx.send(Some(result));
                });
                rx
            }
        };

        Self::wait(rx).await
    }

    async fn wait(mut rx: watch::Receiver<Option<Result<T>>>) -> Result<T> {
        loop {
            if let Some(result) = rx.borrow().as_ref() {
                return result.clone();
            }
            if rx.changed().await.is_err() {
                return Err(BuildError::Internal(
                    "in-flight computation terminated without a result".to_string(),
                ));
            }
        }
    }

    /// Drop every memoized and pending entry.
    pub fn clear(&self) {
        self.slots.clear();
    }
}

/// The wait-for graph between in-flight rule computations. An edge
/// `waiter -> awaited` exists while `waiter`'s computation is blocked on
/// `awaited`. A cycle here means two requests entered a dependency cycle
/// from different points; without this check they would deadlock instead of
/// erroring.
#[derive(Default)]
pub(crate) struct WaitGraph {
    edges: Mutex<HashMap<u64, BTreeSet<u64>>>,
}

impl WaitGraph {
    pub fn new() -> Self {
        WaitGraph::default()
    }

    /// Record that `waiter` is about to block on `awaited`. Fails with the
    /// cycle (as a node sequence from `waiter` back to itself) when the edge
    /// would close a loop.
    pub fn add_edge(&self, waiter: u64, awaited: u64) -> std::result::Result<(), Vec<u64>> {
        let mut edges = self.edges.lock().unwrap_or_else(|p| p.into_inner());

        if let Some(mut path) = find_path(&edges, awaited, waiter) {
            let mut chain = vec![waiter];
            chain.append(&mut path);
            return Err(chain);
        }

        edges.entry(waiter).or_default().insert(awaited);
        Ok(())
    }

    /// Remove a previously recorded edge.
    pub fn remove_edge(&self, waiter: u64, awaited: u64) {
        let mut edges = self.edges.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(set) = edges.get_mut(&waiter) {
            set.remove(&awaited);
            if set.is_empty() {
                edges.remove(&waiter);
            }
        }
    }

    pub fn clear(&self) {
        self.edges
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
    }
}

/// Depth-first path search from `from` to `to` over the edge map.
fn find_path(edges: &HashMap<u64, BTreeSet<u64>>, from: u64, to: u64) -> Option<Vec<u64>> {
    if from == to {
        return Some(vec![to]);
    }
    let mut visited = BTreeSet::new();
    let mut path = Vec::new();
    if dfs(edges, from, to, &mut visited, &mut path) {
        Some(path)
    } else {
        None
    }
}

fn dfs(
    edges: &HashMap<u64, BTreeSet<u64>>,
    node: u64,
    to: u64,
    visited: &mut BTreeSet<u64>,
    path: &mut Vec<u64>,
) -> bool {
    if !visited.insert(node) {
        return false;
    }
    path.push(node);
    if node == to {
        return true;
    }
    if let Some(next) = edges.get(&node) {
        for &n in next {
            if dfs(edges, n, to, visited, path) {
                return true;
            }
        }
    }
    path.pop();
    false
}
