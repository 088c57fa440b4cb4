//! # Result Cache
//!
//! Content-addressed store of succeeded task payloads, keyed by fingerprint.
//! One file per fingerprint under `${base_dir}/.skypipe/cache/`; entries are
//! self-describing JSON envelopes written via temp-file-then-rename so
//! readers never observe a partial payload. The cache is write-once per
//! fingerprint: a hit skips the write, and re-computation of the same
//! fingerprint produces a byte-identical envelope.
//!
//! The cache is scoped per `base_dir` and shared by every queue beneath it.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{PipelineError, PipelineResult};
use crate::fingerprint::Fingerprint;

/// Self-describing on-disk envelope for one cached result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

/// Handle on the per-`base_dir` result cache directory
#[derive(Debug, Clone)]
pub struct ResultCache {
    dir: PathBuf,
}

impl ResultCache {
    /// Open (creating if needed) the cache under `base_dir`
    pub fn open(base_dir: &Path) -> PipelineResult<Self> {
        let dir = base_dir.join(".skypipe").join("cache");
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// On-disk path for a fingerprint's entry
    pub fn entry_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.dir.join(format!("{}.json", fingerprint.as_str()))
    }

    pub fn has(&self, fingerprint: &Fingerprint) -> bool {
        self.entry_path(fingerprint).is_file()
    }

    /// Persist a payload under its fingerprint, returning the entry path
    ///
    /// Existing entries are left untouched (write-once). The write goes to a
    /// temp file in the same directory and is renamed into place.
    pub fn put(&self, fingerprint: &Fingerprint, payload: &Value) -> PipelineResult<PathBuf> {
        let path = self.entry_path(fingerprint);
        if path.is_file() {
            debug!(fingerprint = %fingerprint, "cache hit on put, skipping write");
            return Ok(path);
        }

        let entry = CacheEntry {
            fingerprint: fingerprint.clone(),
            payload: payload.clone(),
            created_at: Utc::now(),
        };
        let tmp = self.dir.join(format!(
            ".{}.tmp.{}",
            fingerprint.as_str(),
            std::process::id()
        ));
        std::fs::write(&tmp, serde_json::to_vec_pretty(&entry)?)?;
        std::fs::rename(&tmp, &path)?;
        debug!(fingerprint = %fingerprint, path = %path.display(), "cached result");
        Ok(path)
    }

    /// Drop an entry (the corrupt-entry escape hatch)
    ///
    /// The cache is write-once per fingerprint, so a corrupt entry must be
    /// evicted before a re-run can persist a good payload; `put` would
    /// otherwise skip the write as a hit.
    pub fn evict(&self, fingerprint: &Fingerprint) -> PipelineResult<()> {
        let path = self.entry_path(fingerprint);
        if path.is_file() {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }

    /// Load a cached payload
    ///
    /// A present-but-undecodable entry surfaces [`PipelineError::CacheCorrupt`];
    /// callers treat that as a miss and re-run the task.
    pub fn get(&self, fingerprint: &Fingerprint) -> PipelineResult<Value> {
        let path = self.entry_path(fingerprint);
        let bytes = std::fs::read(&path).map_err(|e| {
            PipelineError::store_unavailable(format!(
                "no cache entry for {fingerprint}: {e}"
            ))
        })?;
        let entry: CacheEntry = serde_json::from_slice(&bytes)
            .map_err(|e| PipelineError::cache_corrupt(fingerprint.as_str(), e.to_string()))?;
        if entry.fingerprint != *fingerprint {
            return Err(PipelineError::cache_corrupt(
                fingerprint.as_str(),
                format!("entry claims fingerprint {}", entry.fingerprint),
            ));
        }
        Ok(entry.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> (tempfile::TempDir, ResultCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResultCache::open(dir.path()).unwrap();
        (dir, cache)
    }

    fn fp(seed: u8) -> Fingerprint {
        Fingerprint::from_hex(format!("{seed:02x}").repeat(32))
    }

    #[test]
    fn test_put_get_round_trip() {
        let (_dir, cache) = cache();
        let payload = serde_json::json!({"mean": 3.14, "n": 20});

        assert!(!cache.has(&fp(1)));
        cache.put(&fp(1), &payload).unwrap();
        assert!(cache.has(&fp(1)));
        assert_eq!(cache.get(&fp(1)).unwrap(), payload);
    }

    #[test]
    fn test_put_is_write_once() {
        let (_dir, cache) = cache();
        cache.put(&fp(2), &serde_json::json!(1)).unwrap();
        // A second put under the same fingerprint must not clobber
        cache.put(&fp(2), &serde_json::json!(999)).unwrap();
        assert_eq!(cache.get(&fp(2)).unwrap(), serde_json::json!(1));
    }

    #[test]
    fn test_corrupt_entry_surfaces_cache_corrupt() {
        let (_dir, cache) = cache();
        std::fs::write(cache.entry_path(&fp(3)), b"not json at all").unwrap();
        let err = cache.get(&fp(3)).unwrap_err();
        assert!(matches!(err, PipelineError::CacheCorrupt { .. }));
    }

    #[test]
    fn test_mismatched_fingerprint_is_corrupt() {
        let (_dir, cache) = cache();
        cache.put(&fp(4), &serde_json::json!(null)).unwrap();
        // Copy entry 4 under key 5: self-description no longer matches
        std::fs::copy(cache.entry_path(&fp(4)), cache.entry_path(&fp(5))).unwrap();
        let err = cache.get(&fp(5)).unwrap_err();
        assert!(matches!(err, PipelineError::CacheCorrupt { .. }));
    }

    #[test]
    fn test_evict_allows_rewrite() {
        let (_dir, cache) = cache();
        std::fs::write(cache.entry_path(&fp(7)), b"garbage").unwrap();
        assert!(cache.get(&fp(7)).is_err());

        cache.evict(&fp(7)).unwrap();
        assert!(!cache.has(&fp(7)));
        cache.put(&fp(7), &serde_json::json!(2.5)).unwrap();
        assert_eq!(cache.get(&fp(7)).unwrap(), serde_json::json!(2.5));
    }

    #[test]
    fn test_evict_missing_entry_is_ok() {
        let (_dir, cache) = cache();
        cache.evict(&fp(8)).unwrap();
    }

    #[test]
    fn test_missing_entry_is_not_corrupt() {
        let (_dir, cache) = cache();
        let err = cache.get(&fp(6)).unwrap_err();
        assert!(matches!(err, PipelineError::StoreUnavailable(_)));
    }
}
