use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Persistent key→value settings store.
///
/// Writes are atomic (backup copy, temp file, rename) so a power cut during
/// a save can never leave a half-written settings file. Reads fall back from
/// the main file to the backup, and the in-memory cache keeps serving the
/// last value whenever the disk is unavailable. Keys starting with `_` are
/// reserved for the migration layer and rejected by the public save API.
pub struct SettingsManager {
    storage_dir: PathBuf,
    state: Mutex<State>,
}

struct State {
    cache: Map<String, Value>,
    loaded: bool,
}

impl SettingsManager {
    const SETTINGS_FILE_NAME: &'static str = "settings.json";
    const BACKUP_FILE_NAME: &'static str = "settings.json.backup";
    const TEMP_FILE_NAME: &'static str = "settings.json.tmp";

    pub fn new<P: AsRef<Path>>(storage_dir: P) -> SettingsManager {
        let storage_dir = storage_dir.as_ref().to_path_buf();

        if let Err(error) = std::fs::create_dir_all(&storage_dir) {
            log::error!("Failed to create settings directory: {}", error);
        }

        SettingsManager {
            storage_dir,
            state: Mutex::new(State {
                cache: Map::new(),
                loaded: false,
            }),
        }
    }

    pub fn default_dir() -> PathBuf {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        Path::new(&home)
            .join("homebrew")
            .join("settings")
            .join("decktune")
    }

    fn settings_path(&self) -> PathBuf {
        self.storage_dir.join(Self::SETTINGS_FILE_NAME)
    }

    fn backup_path(&self) -> PathBuf {
        self.storage_dir.join(Self::BACKUP_FILE_NAME)
    }

    fn temp_path(&self) -> PathBuf {
        self.storage_dir.join(Self::TEMP_FILE_NAME)
    }

    /// Save a single setting. Returns false when the disk write failed; the
    /// value is still cached so subsequent reads see it.
    pub fn save(&self, key: &str, value: Value) -> bool {
        if key.starts_with('_') {
            log::warn!("Attempted to save internal key '{}', rejecting", key);
            return false;
        }

        let mut state = self.state.lock().unwrap();
        self.ensure_loaded(&mut state);

        state.cache.insert(key.to_string(), value);

        // One retry covers transient failures (e.g. the previous temp file
        // still being flushed).
        self.write_to_disk(&state.cache) || self.write_to_disk(&state.cache)
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let mut state = self.state.lock().unwrap();
        self.ensure_loaded(&mut state);
        state.cache.get(key).cloned()
    }

    /// All settings, with reserved `_` keys filtered out.
    pub fn load_all(&self) -> Map<String, Value> {
        let mut state = self.state.lock().unwrap();
        self.ensure_loaded(&mut state);

        state
            .cache
            .iter()
            .filter(|(k, _)| !k.starts_with('_'))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn ensure_loaded(&self, state: &mut State) {
        if state.loaded {
            return;
        }

        state.cache = self.load_from_disk();
        state.loaded = true;
    }

    fn load_from_disk(&self) -> Map<String, Value> {
        let settings_path = self.settings_path();

        if settings_path.exists() {
            match Self::read_map(&settings_path) {
                Ok(map) => {
                    log::debug!("Loaded settings from {:?}", settings_path);
                    return map;
                }
                Err(error) => {
                    log::warn!(
                        "Settings file corrupted at {:?}: {}, trying backup",
                        settings_path,
                        error
                    );
                }
            }
        }

        let backup_path = self.backup_path();

        if backup_path.exists() {
            match Self::read_map(&backup_path) {
                Ok(map) => {
                    log::info!("Loaded settings from backup: {:?}", backup_path);
                    if let Err(error) = std::fs::copy(&backup_path, &settings_path) {
                        log::error!("Failed to restore main file from backup: {}", error);
                    }
                    return map;
                }
                Err(error) => {
                    log::error!("Backup file also corrupted at {:?}: {}", backup_path, error);
                }
            }
        }

        log::info!("No existing settings found, starting with empty cache");
        Map::new()
    }

    fn read_map(path: &Path) -> std::io::Result<Map<String, Value>> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    fn write_to_disk(&self, cache: &Map<String, Value>) -> bool {
        let settings_path = self.settings_path();

        if settings_path.exists() {
            if let Err(error) = std::fs::copy(&settings_path, self.backup_path()) {
                log::warn!("Failed to create backup before write: {}", error);
            }
        }

        let encoded = match serde_json::to_string_pretty(cache) {
            Ok(encoded) => encoded,
            Err(error) => {
                log::error!("Failed to encode settings: {}", error);
                return false;
            }
        };

        let temp_path = self.temp_path();

        if let Err(error) = std::fs::write(&temp_path, encoded) {
            log::error!("Failed to write to temporary file {:?}: {}", temp_path, error);
            let _ = std::fs::remove_file(&temp_path);
            return false;
        }

        if let Err(error) = std::fs::rename(&temp_path, &settings_path) {
            log::error!(
                "Failed to rename temp file to {:?}: {}",
                settings_path,
                error
            );
            let _ = std::fs::remove_file(&temp_path);
            return false;
        }

        log::debug!("Settings written to {:?}", settings_path);
        true
    }
}
