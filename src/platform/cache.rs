use super::caps::Variant;
use super::PlatformInfo;

use chrono::{DateTime, Duration, Utc};
use serde_derive::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Detection result persisted between boots so startup does not have to
/// touch DMI every time.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CachedPlatform {
    pub model: String,
    pub variant: Variant,
    pub safe_limit: i32,
    pub cached_at: String,
}

impl CachedPlatform {
    pub fn from_platform_info(info: &PlatformInfo) -> CachedPlatform {
        CachedPlatform {
            model: info.model.clone(),
            variant: info.variant,
            safe_limit: info.safe_limit,
            cached_at: Utc::now().to_rfc3339(),
        }
    }

    /// Cached entries always came from a successful detection.
    pub fn to_platform_info(&self) -> PlatformInfo {
        PlatformInfo {
            model: self.model.clone(),
            variant: self.variant,
            safe_limit: self.safe_limit,
            detected: true,
        }
    }

    pub fn is_valid(&self, ttl_days: i64) -> bool {
        match DateTime::parse_from_rfc3339(&self.cached_at) {
            Ok(cached_at) => {
                let age = Utc::now().signed_duration_since(cached_at);
                age <= Duration::days(ttl_days)
            }
            Err(error) => {
                log::warn!("Invalid platform cache timestamp: {}", error);
                false
            }
        }
    }
}

pub struct PlatformCache {
    cache_dir: PathBuf,
}

impl PlatformCache {
    const CACHE_FILE_NAME: &'static str = "platform_cache.json";
    const CACHE_TTL_DAYS: i64 = 30;

    pub fn new<P: AsRef<Path>>(cache_dir: P) -> PlatformCache {
        PlatformCache {
            cache_dir: cache_dir.as_ref().to_path_buf(),
        }
    }

    fn cache_path(&self) -> PathBuf {
        self.cache_dir.join(Self::CACHE_FILE_NAME)
    }

    /// Returns the cached platform if the file exists, parses, and is less
    /// than 30 days old. Any I/O or parse problem is treated as a miss.
    pub fn load(&self) -> Option<PlatformInfo> {
        let path = self.cache_path();

        if !path.is_file() {
            return None;
        }

        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(error) => {
                log::warn!("Failed to read platform cache file: {}", error);
                return None;
            }
        };

        if content.trim().is_empty() {
            return None;
        }

        let cached: CachedPlatform = match serde_json::from_str(&content) {
            Ok(cached) => cached,
            Err(error) => {
                log::warn!("Platform cache file is corrupted: {}", error);
                return None;
            }
        };

        if !cached.is_valid(Self::CACHE_TTL_DAYS) {
            log::info!("Platform cache is expired, will re-detect");
            return None;
        }

        log::info!(
            "Loaded platform from cache: {} ({})",
            cached.model,
            cached.variant
        );

        Some(cached.to_platform_info())
    }

    pub fn save(&self, info: &PlatformInfo) {
        let cached = CachedPlatform::from_platform_info(info);

        if let Err(error) = std::fs::create_dir_all(&self.cache_dir) {
            log::error!("Failed to create platform cache directory: {}", error);
            return;
        }

        let encoded = match serde_json::to_string_pretty(&cached) {
            Ok(encoded) => encoded,
            Err(error) => {
                log::error!("Failed to encode platform cache: {}", error);
                return;
            }
        };

        if let Err(error) = std::fs::write(self.cache_path(), encoded) {
            log::error!("Failed to save platform cache: {}", error);
        } else {
            log::info!("Saved platform to cache: {} ({})", info.model, info.variant);
        }
    }

    pub fn clear(&self) {
        let path = self.cache_path();

        if path.exists() {
            if let Err(error) = std::fs::remove_file(&path) {
                log::warn!("Failed to delete platform cache file: {}", error);
            } else {
                log::info!("Platform cache cleared");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jupiter() -> PlatformInfo {
        PlatformInfo {
            model: "Jupiter".to_string(),
            variant: Variant::Lcd,
            safe_limit: -30,
            detected: true,
        }
    }

    #[test]
    fn test_cache_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PlatformCache::new(dir.path());

        assert!(cache.load().is_none());

        cache.save(&jupiter());
        let loaded = cache.load().unwrap();

        assert_eq!(loaded.model, "Jupiter");
        assert_eq!(loaded.variant, Variant::Lcd);
        assert_eq!(loaded.safe_limit, -30);
        assert!(loaded.detected);
    }

    #[test]
    fn test_corrupt_cache_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PlatformCache::new(dir.path());

        std::fs::write(dir.path().join("platform_cache.json"), "not json{").unwrap();
        assert!(cache.load().is_none());
    }

    #[test]
    fn test_expired_cache_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PlatformCache::new(dir.path());

        let stale = CachedPlatform {
            model: "Jupiter".to_string(),
            variant: Variant::Lcd,
            safe_limit: -30,
            cached_at: (Utc::now() - Duration::days(31)).to_rfc3339(),
        };
        std::fs::write(
            dir.path().join("platform_cache.json"),
            serde_json::to_string(&stale).unwrap(),
        )
        .unwrap();

        assert!(cache.load().is_none());
    }

    #[test]
    fn test_clear_removes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PlatformCache::new(dir.path());

        cache.save(&jupiter());
        cache.clear();

        assert!(cache.load().is_none());
        assert!(!dir.path().join("platform_cache.json").exists());
    }
}
