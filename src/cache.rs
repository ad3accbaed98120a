use std::fs;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use directories::BaseDirs;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tempfile::Builder;
use tracing::{debug, warn};

use crate::error::AnnotError;

pub const DEFAULT_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Debug, Clone, PartialEq)]
pub struct CacheKey {
    pub function: &'static str,
    pub args: Value,
}

impl CacheKey {
    pub fn new(function: &'static str, args: Value) -> Self {
        Self { function, args }
    }

    // serde_json objects are key-sorted, so equal structures share a digest
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.function.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.args.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }
}

pub trait CachePort {
    fn get(&self, key: &CacheKey) -> Result<Option<Value>, AnnotError>;
    fn put(&self, key: &CacheKey, value: Value, ttl: Duration) -> Result<(), AnnotError>;
}

impl<C: CachePort + ?Sized> CachePort for &C {
    fn get(&self, key: &CacheKey) -> Result<Option<Value>, AnnotError> {
        (**self).get(key)
    }

    fn put(&self, key: &CacheKey, value: Value, ttl: Duration) -> Result<(), AnnotError> {
        (**self).put(key, value, ttl)
    }
}

// Cache failures are logged and fall back to `compute`; only its errors surface.
pub fn memoize<C, T, F>(cache: &C, key: CacheKey, ttl: Duration, compute: F) -> Result<T, AnnotError>
where
    C: CachePort + ?Sized,
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Result<T, AnnotError>,
{
    match cache.get(&key) {
        Ok(Some(value)) => match serde_json::from_value(value) {
            Ok(hit) => {
                debug!(function = key.function, "cache hit");
                return Ok(hit);
            }
            Err(err) => warn!(function = key.function, "discarding stale cache entry: {err}"),
        },
        Ok(None) => {}
        Err(err) => warn!(function = key.function, "cache lookup failed: {err}"),
    }
    debug!(function = key.function, "cache miss");
    let result = compute()?;
    match serde_json::to_value(&result) {
        Ok(value) => {
            if let Err(err) = cache.put(&key, value, ttl) {
                warn!(function = key.function, "failed to store cache entry: {err}");
            }
        }
        Err(err) => warn!(function = key.function, "failed to encode cache entry: {err}"),
    }
    Ok(result)
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    function: String,
    created_at: DateTime<Utc>,
    ttl_secs: u64,
    value: Value,
}

impl CacheEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.created_at);
        age.num_seconds() < 0 || age.num_seconds() as u64 >= self.ttl_secs
    }
}

#[derive(Debug, Clone)]
pub struct FileCache {
    root: Utf8PathBuf,
}

impl FileCache {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn default_root() -> Result<Utf8PathBuf, AnnotError> {
        BaseDirs::new()
            .and_then(|dirs| {
                Utf8PathBuf::from_path_buf(dirs.home_dir().join(".cache").join("wsi-annotations"))
                    .ok()
            })
            .ok_or_else(|| AnnotError::Filesystem("unable to resolve cache directory".to_string()))
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn entry_path(&self, key: &CacheKey) -> Utf8PathBuf {
        self.root.join(format!("{}.json", key.digest()))
    }

    pub fn ensure_root(&self) -> Result<(), AnnotError> {
        fs::create_dir_all(self.root.as_std_path())
            .map_err(|err| AnnotError::Filesystem(err.to_string()))
    }

    pub fn clear(&self) -> Result<usize, AnnotError> {
        if !self.root.as_std_path().exists() {
            return Ok(0);
        }
        let mut removed = 0;
        let entries = fs::read_dir(self.root.as_std_path())
            .map_err(|err| AnnotError::Filesystem(err.to_string()))?;
        for entry in entries {
            let path = entry
                .map_err(|err| AnnotError::Filesystem(err.to_string()))?
                .path();
            if path.is_file() && path.extension().map(|ext| ext == "json").unwrap_or(false) {
                fs::remove_file(&path).map_err(|err| AnnotError::Filesystem(err.to_string()))?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn read_entry(path: &Utf8Path) -> Option<CacheEntry> {
        let content = match fs::read(path.as_std_path()) {
            Ok(content) => content,
            Err(err) => {
                warn!(%path, "unreadable cache entry: {err}");
                return None;
            }
        };
        match serde_json::from_slice(&content) {
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!(%path, "corrupt cache entry: {err}");
                None
            }
        }
    }
}

impl CachePort for FileCache {
    fn get(&self, key: &CacheKey) -> Result<Option<Value>, AnnotError> {
        let path = self.entry_path(key);
        if !path.as_std_path().exists() {
            return Ok(None);
        }
        let Some(entry) = Self::read_entry(&path) else {
            return Ok(None);
        };
        if entry.is_expired(Utc::now()) {
            debug!(%path, "cache entry expired");
            if let Err(err) = fs::remove_file(path.as_std_path()) {
                warn!(%path, "failed to remove expired cache entry: {err}");
            }
            return Ok(None);
        }
        Ok(Some(entry.value))
    }

    fn put(&self, key: &CacheKey, value: Value, ttl: Duration) -> Result<(), AnnotError> {
        self.ensure_root()?;
        let entry = CacheEntry {
            function: key.function.to_string(),
            created_at: Utc::now(),
            ttl_secs: ttl.as_secs(),
            value,
        };
        let content =
            serde_json::to_vec(&entry).map_err(|err| AnnotError::Cache(err.to_string()))?;
        let mut temp = Builder::new()
            .prefix("wsi-annot-cache")
            .tempfile_in(self.root.as_std_path())
            .map_err(|err| AnnotError::Filesystem(err.to_string()))?;
        std::io::Write::write_all(&mut temp, &content)
            .map_err(|err| AnnotError::Filesystem(err.to_string()))?;
        temp.persist(self.entry_path(key).as_std_path())
            .map_err(|err| AnnotError::Filesystem(err.to_string()))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoCache;

impl CachePort for NoCache {
    fn get(&self, _key: &CacheKey) -> Result<Option<Value>, AnnotError> {
        Ok(None)
    }

    fn put(&self, _key: &CacheKey, _value: Value, _ttl: Duration) -> Result<(), AnnotError> {
        Ok(())
    }
}
