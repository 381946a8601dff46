pub mod cache;
pub mod caps;

pub use caps::{Variant, VariantLimits};

use cache::PlatformCache;
use std::path::{Path, PathBuf};

pub const DMI_PRODUCT_NAME_PATH: &str = "/sys/devices/virtual/dmi/id/product_name";

/// Resolved device identity. Immutable once detected.
#[derive(Clone, Debug, PartialEq)]
pub struct PlatformInfo {
    pub model: String,
    pub variant: Variant,
    pub safe_limit: i32,
    pub detected: bool,
}

impl PlatformInfo {
    pub fn limits(&self) -> VariantLimits {
        caps::limits(self.variant)
    }
}

fn read_dmi_product_name(path: &Path) -> Option<String> {
    match std::fs::read_to_string(path) {
        Ok(content) => Some(content.trim().to_string()),
        Err(error) => {
            log::warn!(
                "Failed to read DMI product name from {:?}: {}",
                path,
                error
            );
            None
        }
    }
}

fn map_product_name(product_name: Option<&str>) -> PlatformInfo {
    match product_name {
        Some(name) if name.contains("Jupiter") => PlatformInfo {
            model: "Jupiter".to_string(),
            variant: Variant::Lcd,
            safe_limit: caps::safe_limit(Variant::Lcd),
            detected: true,
        },
        Some(name) if name.contains("Galileo") => PlatformInfo {
            model: "Galileo".to_string(),
            variant: Variant::Oled,
            safe_limit: caps::safe_limit(Variant::Oled),
            detected: true,
        },
        Some(name) => {
            log::warn!(
                "Unknown device product name: {}, using conservative limits",
                name
            );
            unknown_platform()
        }
        None => unknown_platform(),
    }
}

fn unknown_platform() -> PlatformInfo {
    PlatformInfo {
        model: "Unknown".to_string(),
        variant: Variant::Unknown,
        safe_limit: caps::safe_limit(Variant::Unknown),
        detected: false,
    }
}

/// One-shot detection, bypassing the cache.
pub fn detect_fresh(dmi_path: &Path) -> PlatformInfo {
    let product_name = read_dmi_product_name(dmi_path);
    map_product_name(product_name.as_deref())
}

/// Owns the on-disk detection cache. Created once at startup and threaded
/// through; detection never fails, falling back to the UNKNOWN variant.
pub struct PlatformCapabilities {
    dmi_path: PathBuf,
    cache: PlatformCache,
}

impl PlatformCapabilities {
    pub fn new<P: AsRef<Path>>(cache_dir: P) -> PlatformCapabilities {
        PlatformCapabilities {
            dmi_path: PathBuf::from(DMI_PRODUCT_NAME_PATH),
            cache: PlatformCache::new(cache_dir),
        }
    }

    pub fn with_dmi_path<P1: AsRef<Path>, P2: AsRef<Path>>(
        dmi_path: P1,
        cache_dir: P2,
    ) -> PlatformCapabilities {
        PlatformCapabilities {
            dmi_path: dmi_path.as_ref().to_path_buf(),
            cache: PlatformCache::new(cache_dir),
        }
    }

    /// Cache-first detection. Unsuccessful detections are never cached, so a
    /// machine that boots with an unreadable DMI will re-probe next time.
    pub fn detect(&self) -> PlatformInfo {
        if let Some(cached) = self.cache.load() {
            return cached;
        }

        let info = detect_fresh(&self.dmi_path);

        if info.detected {
            self.cache.save(&info);
        }

        info
    }

    /// Clears the cache and probes DMI again.
    pub fn redetect(&self) -> PlatformInfo {
        self.cache.clear();
        log::info!("Platform cache cleared, performing fresh detection");

        let info = detect_fresh(&self.dmi_path);

        if info.detected {
            self.cache.save(&info);
        }

        info
    }
}
