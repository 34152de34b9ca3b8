use camino::{Utf8Path, Utf8PathBuf};
use tracing::debug;

use crate::{CacheError, CacheHitMetadata, CacheMetadata, CacheSource};

pub struct FsCache {
    cache_directory: Utf8PathBuf,
}

impl CacheMetadata {
    fn read(path: &Utf8Path) -> Result<CacheMetadata, CacheError> {
        serde_json::from_str(&std::fs::read_to_string(path)?)
            .map_err(CacheError::InvalidMetadata)
    }
}

impl FsCache {
    pub fn new(cache_dir: &Utf8Path) -> Result<Self, CacheError> {
        debug!("FsCache::new called with cache_dir={}", cache_dir);
        std::fs::create_dir_all(cache_dir)?;

        Ok(FsCache {
            cache_directory: cache_dir.to_owned(),
        })
    }

    fn marker_path(&self, hash: &str) -> Utf8PathBuf {
        self.cache_directory.join(format!("{hash}-meta.json"))
    }

    /// Checks for a success marker without reading anything beyond the
    /// marker itself.
    pub fn exists(&self, hash: &str) -> Result<Option<CacheHitMetadata>, CacheError> {
        let marker = self.marker_path(hash);
        if !marker.exists() {
            debug!("cache miss for hash {hash} in {}", self.cache_directory);
            return Ok(None);
        }

        let meta = CacheMetadata::read(&marker)?;

        Ok(Some(CacheHitMetadata {
            source: CacheSource::Local,
            time_saved: meta.duration,
        }))
    }

    /// Fetches the recorded exit code and duration for a hash, if a
    /// marker exists.
    pub fn fetch(&self, hash: &str) -> Result<Option<(CacheHitMetadata, i32)>, CacheError> {
        let marker = self.marker_path(hash);
        if !marker.exists() {
            return Ok(None);
        }
        let meta = CacheMetadata::read(&marker)?;
        Ok(Some((
            CacheHitMetadata {
                source: CacheSource::Local,
                time_saved: meta.duration,
            },
            meta.exit_code,
        )))
    }

    /// Records a run. Only clean successes produce a marker; failed or
    /// failure-permitted runs leave the cache untouched so they re-run.
    pub fn put(&self, hash: &str, exit_code: i32, duration: u64) -> Result<(), CacheError> {
        if exit_code != 0 {
            debug!("not caching hash {hash}: exit code {exit_code}");
            return Ok(());
        }

        let meta = CacheMetadata {
            hash: hash.to_string(),
            exit_code,
            duration,
        };
        let contents =
            serde_json::to_string(&meta).map_err(CacheError::MetadataWriteFailure)?;

        // Write-then-rename so a torn write never reads as a valid marker
        let temp_path = self.cache_directory.join(format!(".{hash}-meta.json.tmp"));
        std::fs::write(&temp_path, contents)?;
        std::fs::rename(&temp_path, self.marker_path(hash))?;

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use camino::Utf8Path;
    use tempfile::TempDir;

    use super::*;

    fn test_cache() -> (TempDir, FsCache) {
        let dir = TempDir::new().unwrap();
        let cache = FsCache::new(Utf8Path::from_path(dir.path()).unwrap()).unwrap();
        (dir, cache)
    }

    #[test]
    fn test_miss_then_hit() {
        let (_dir, cache) = test_cache();
        let hash = "0123456789abcdef";

        assert!(cache.exists(hash).unwrap().is_none());

        cache.put(hash, 0, 1200).unwrap();
        let hit = cache.exists(hash).unwrap().expect("marker written");
        assert_eq!(hit.source, CacheSource::Local);
        assert_eq!(hit.time_saved, 1200);
    }

    #[test]
    fn test_failures_are_not_recorded() {
        let (_dir, cache) = test_cache();
        let hash = "deadbeefdeadbeef";

        cache.put(hash, 1, 10).unwrap();
        assert!(cache.exists(hash).unwrap().is_none());
    }

    #[test]
    fn test_fetch_returns_exit_code() {
        let (_dir, cache) = test_cache();
        let hash = "feedfacefeedface";

        cache.put(hash, 0, 42).unwrap();
        let (hit, exit_code) = cache.fetch(hash).unwrap().expect("marker written");
        assert_eq!(exit_code, 0);
        assert_eq!(hit.time_saved, 42);
    }

    #[test]
    fn test_distinct_hashes_do_not_collide() {
        let (_dir, cache) = test_cache();

        cache.put("aaaa", 0, 1).unwrap();
        assert!(cache.exists("bbbb").unwrap().is_none());
    }
}
