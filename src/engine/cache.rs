//! The optional content-addressed cache layer.
//!
//! Entries are keyed by a digest of the action description and its resolved
//! input digests; target paths never enter the key. A hit either
//! short-circuits execution (the cached blobs are materialized into the
//! build tree) or, with probability `check_probability`, is verified by
//! re-running the action and diffing digests to flush out nondeterministic
//! or under-specified rules.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::core::path::TargetPath;
use crate::engine::errors::{BuildError, Result};
use crate::engine::rules::Action;
use crate::util::fs::{ensure_dir, read_bytes, write_bytes};
use crate::util::hash::{sha256_bytes, Fingerprint};

/// A cache key: hex digest over action + resolved inputs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Compute the key for an action and its resolved input digests
    /// (labelled, sorted map: file digests, env values, selector listings).
    pub fn compute(action: &Action, inputs: &BTreeMap<String, String>) -> Result<Self> {
        let mut fp = Fingerprint::new();
        fp.update_str(&action.digest()?);
        for (label, digest) in inputs {
            fp.update_str(label);
            fp.update_str(digest);
        }
        Ok(CacheKey(fp.finish()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// One recorded output of a cached execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedOutput {
    pub target: TargetPath,
    pub digest: String,
}

/// The recorded output set of a prior execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub outputs: Vec<CachedOutput>,
}

/// A pluggable cache store. Blobs are content-addressed by digest; entries
/// map a cache key to the output file set.
pub trait CacheBackend: Send + Sync {
    fn fetch(&self, key: &CacheKey) -> Result<Option<CacheEntry>>;
    fn store(&self, key: &CacheKey, entry: &CacheEntry) -> Result<()>;
    fn load_blob(&self, digest: &str) -> Result<Vec<u8>>;
    fn save_blob(&self, data: &[u8]) -> Result<String>;
}

/// Cache configuration supplied at engine initialization.
#[derive(Clone)]
pub struct CacheConfig {
    pub backend: Arc<dyn CacheBackend>,
    pub check_probability: f64,
}

impl CacheConfig {
    /// Create a configuration; `check_probability` must be in `[0, 1]`.
    pub fn new(backend: Arc<dyn CacheBackend>, check_probability: f64) -> Result<Self> {
        if !(0.0..=1.0).contains(&check_probability) {
            return Err(BuildError::Cache(format!(
                "check_probability must be in [0, 1], got {}",
                check_probability
            )));
        }
        Ok(CacheConfig {
            backend,
            check_probability,
        })
    }
}

/// Decide whether a hit for `key` gets verified this session. Derived from
/// the session seed and the key, so a session samples rules stably while
/// different sessions sample different rules.
pub(crate) fn should_verify(seed: &[u8], key: &CacheKey, probability: f64) -> bool {
    if probability <= 0.0 {
        return false;
    }
    if probability >= 1.0 {
        return true;
    }

    let mut hasher = Sha256::new();
    hasher.update(seed);
    hasher.update(key.as_str().as_bytes());
    let digest = hasher.finalize();

    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    let fraction = u64::from_be_bytes(bytes) as f64 / u64::MAX as f64;
    fraction < probability
}

/// A local-disk cache: `keys/<key>.json` entries plus `cas/<digest>` blobs.
pub struct LocalCache {
    root: PathBuf,
}

impl LocalCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalCache { root: root.into() }
    }

    fn key_path(&self, key: &CacheKey) -> PathBuf {
        self.root.join("keys").join(format!("{}.json", key.as_str()))
    }

    fn blob_path(&self, digest: &str) -> PathBuf {
        self.root.join("cas").join(digest)
    }
}

impl CacheBackend for LocalCache {
    fn fetch(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        let path = self.key_path(key);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = read_bytes(&path).map_err(|e| BuildError::Cache(e.to_string()))?;
        let entry = serde_json::from_slice(&bytes)
            .map_err(|e| BuildError::Cache(format!("corrupt cache entry: {}", e)))?;
        Ok(Some(entry))
    }

    fn store(&self, key: &CacheKey, entry: &CacheEntry) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(entry)
            .map_err(|e| BuildError::Cache(e.to_string()))?;
        write_bytes(&self.key_path(key), &bytes).map_err(|e| BuildError::Cache(e.to_string()))
    }

    fn load_blob(&self, digest: &str) -> Result<Vec<u8>> {
        read_bytes(&self.blob_path(digest)).map_err(|e| BuildError::Cache(e.to_string()))
    }

    fn save_blob(&self, data: &[u8]) -> Result<String> {
        let digest = sha256_bytes(data);
        let path = self.blob_path(&digest);
        if !path.exists() {
            if let Some(parent) = path.parent() {
                ensure_dir(parent).map_err(|e| BuildError::Cache(e.to_string()))?;
            }
            write_bytes(&path, data).map_err(|e| BuildError::Cache(e.to_string()))?;
        }
        Ok(digest)
    }
}
