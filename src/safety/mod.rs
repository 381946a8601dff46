pub mod recovery;

use crate::platform::PlatformInfo;
use crate::power::{self, ApplyOffsets, CORE_COUNT};
use crate::session::crash::CrashMetricsStore;
use crate::settings::SettingsManager;

use chrono::Utc;
use serde_derive::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub const TUNING_FLAG_FILE: &str = "/tmp/decktune_tuning_flag";
pub const BINNING_STATE_FILE: &str = "/tmp/decktune_binning_state.json";

const LKG_CORES_KEY: &str = "lkg_cores";
const LKG_TIMESTAMP_KEY: &str = "lkg_timestamp";
const CORES_KEY: &str = "cores";

/// Durable record of an in-flight binning iteration.
///
/// Written before each test so that a hard hang during the test leaves
/// enough on disk to restore the last value that actually passed.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct BinningCheckpoint {
    pub active: bool,
    pub current_value: i32,
    pub last_stable: i32,
    pub iteration: u32,
    pub failed_values: Vec<i32>,
    pub timestamp: String,
}

/// Owner of the Last-Known-Good record and the on-disk crash markers.
///
/// Every offset write in the system is mediated here: values are clamped to
/// the platform's safe limit before they can reach the hardware, and the
/// markers this type maintains are what `check_boot_recovery` consults after
/// an abrupt power loss.
pub struct SafetyPolicy {
    settings: Arc<SettingsManager>,
    platform: PlatformInfo,
    applier: Arc<dyn ApplyOffsets>,
    crash_metrics: Option<Arc<CrashMetricsStore>>,
    lkg: Mutex<Vec<i32>>,
    tuning_flag_path: PathBuf,
    checkpoint_path: PathBuf,
}

impl SafetyPolicy {
    pub fn new(
        settings: Arc<SettingsManager>,
        platform: PlatformInfo,
        applier: Arc<dyn ApplyOffsets>,
    ) -> SafetyPolicy {
        let policy = SafetyPolicy {
            settings,
            platform,
            applier,
            crash_metrics: None,
            lkg: Mutex::new(vec![0; CORE_COUNT]),
            tuning_flag_path: PathBuf::from(TUNING_FLAG_FILE),
            checkpoint_path: PathBuf::from(BINNING_STATE_FILE),
        };

        let persisted = policy.load_lkg();
        *policy.lkg.lock().unwrap() = persisted;
        policy
    }

    pub fn with_state_paths<P1: AsRef<Path>, P2: AsRef<Path>>(
        mut self,
        tuning_flag_path: P1,
        checkpoint_path: P2,
    ) -> SafetyPolicy {
        self.tuning_flag_path = tuning_flag_path.as_ref().to_path_buf();
        self.checkpoint_path = checkpoint_path.as_ref().to_path_buf();
        self
    }

    pub fn with_crash_metrics(mut self, crash_metrics: Arc<CrashMetricsStore>) -> SafetyPolicy {
        self.crash_metrics = Some(crash_metrics);
        self
    }

    pub fn platform(&self) -> &PlatformInfo {
        &self.platform
    }

    pub fn applier(&self) -> Arc<dyn ApplyOffsets> {
        Arc::clone(&self.applier)
    }

    pub fn settings(&self) -> &Arc<SettingsManager> {
        &self.settings
    }

    /// Element-wise clamp into `[safe_limit, 0]`.
    pub fn clamp(&self, values: &[i32]) -> Vec<i32> {
        let safe_limit = self.platform.safe_limit;

        values
            .iter()
            .map(|&v| {
                if v < safe_limit {
                    safe_limit
                } else if v > 0 {
                    0
                } else {
                    v
                }
            })
            .collect()
    }

    /// Persist a confirmed-stable offset set as the new LKG.
    pub fn save_lkg(&self, values: &[i32]) {
        *self.lkg.lock().unwrap() = values.to_vec();
        self.settings.save(LKG_CORES_KEY, json!(values));
        self.settings
            .save(LKG_TIMESTAMP_KEY, json!(Utc::now().to_rfc3339()));
    }

    /// LKG from persistent settings, `[0; 4]` when absent or malformed.
    pub fn load_lkg(&self) -> Vec<i32> {
        let loaded = self
            .settings
            .get(LKG_CORES_KEY)
            .and_then(|value| serde_json::from_value::<Vec<i32>>(value).ok())
            .filter(|values| values.len() == CORE_COUNT);

        match loaded {
            Some(values) => {
                *self.lkg.lock().unwrap() = values.clone();
                values
            }
            None => vec![0; CORE_COUNT],
        }
    }

    pub fn get_lkg(&self) -> Vec<i32> {
        self.lkg.lock().unwrap().clone()
    }

    /// Offsets currently applied to the hardware, as recorded in settings.
    pub fn current_offsets(&self) -> Vec<i32> {
        self.settings
            .get(CORES_KEY)
            .and_then(|value| serde_json::from_value::<Vec<i32>>(value).ok())
            .filter(|values| values.len() == CORE_COUNT)
            .unwrap_or_else(|| vec![0; CORE_COUNT])
    }

    /// Apply the LKG values immediately for emergency recovery.
    pub async fn rollback_to_lkg(&self) -> power::Result<()> {
        let lkg_values = self.load_lkg();

        match self.applier.apply(&lkg_values).await {
            Ok(()) => {
                log::info!("Successfully rolled back to LKG values: {:?}", lkg_values);
                Ok(())
            }
            Err(error) => {
                log::error!("Failed to rollback to LKG values: {}", error);
                Err(error)
            }
        }
    }

    pub fn create_tuning_flag(&self) {
        // Best effort: losing the flag only costs an unnecessary recovery.
        if let Err(error) = std::fs::write(&self.tuning_flag_path, Utc::now().to_rfc3339()) {
            log::warn!("Failed to create tuning flag: {}", error);
        }
    }

    pub fn remove_tuning_flag(&self) {
        if self.tuning_flag_path.exists() {
            if let Err(error) = std::fs::remove_file(&self.tuning_flag_path) {
                log::warn!("Failed to remove tuning flag: {}", error);
            }
        }
    }

    pub fn has_tuning_flag(&self) -> bool {
        self.tuning_flag_path.exists()
    }

    /// Write (or overwrite) the binning checkpoint for the value about to be
    /// tested.
    pub fn update_checkpoint(
        &self,
        current_value: i32,
        last_stable: i32,
        iteration: u32,
        failed_values: &[i32],
    ) {
        let checkpoint = BinningCheckpoint {
            active: true,
            current_value,
            last_stable,
            iteration,
            failed_values: failed_values.to_vec(),
            timestamp: Utc::now().to_rfc3339(),
        };

        match serde_json::to_string_pretty(&checkpoint) {
            Ok(encoded) => {
                if let Err(error) = std::fs::write(&self.checkpoint_path, encoded) {
                    log::warn!("Failed to write binning checkpoint: {}", error);
                } else {
                    log::debug!(
                        "Checkpoint written: iteration={}, current={}, last_stable={}",
                        iteration,
                        current_value,
                        last_stable
                    );
                }
            }
            Err(error) => log::warn!("Failed to encode binning checkpoint: {}", error),
        }
    }

    pub fn clear_checkpoint(&self) {
        if self.checkpoint_path.exists() {
            if let Err(error) = std::fs::remove_file(&self.checkpoint_path) {
                log::warn!("Failed to clear binning checkpoint: {}", error);
            } else {
                log::debug!("Cleared binning checkpoint");
            }
        }
    }

    /// Checkpoint from disk; corrupt or incomplete files count as absent.
    pub fn load_checkpoint(&self) -> Option<BinningCheckpoint> {
        if !self.checkpoint_path.exists() {
            return None;
        }

        let content = match std::fs::read_to_string(&self.checkpoint_path) {
            Ok(content) => content,
            Err(error) => {
                log::warn!("Failed to read binning checkpoint: {}", error);
                return None;
            }
        };

        match serde_json::from_str::<BinningCheckpoint>(&content) {
            Ok(checkpoint) => Some(checkpoint),
            Err(error) => {
                log::warn!("Failed to parse binning checkpoint: {}", error);
                None
            }
        }
    }

    /// Boot-time recovery, run once at startup.
    ///
    /// Two independent branches, in order: an `active` binning checkpoint
    /// restores the last value that passed a stress test (possibly deeper
    /// than the long-term LKG), and a leftover tuning flag rolls back to the
    /// LKG. Both can fire on the same boot; neither failure stops the other.
    pub async fn check_boot_recovery(&self) -> bool {
        let mut recovery_performed = false;

        if let Some(checkpoint) = self.load_checkpoint() {
            if checkpoint.active {
                log::warn!(
                    "Binning crash detected - failed value: {}, restoring last_stable: {}",
                    checkpoint.current_value,
                    checkpoint.last_stable
                );

                let restore = vec![checkpoint.last_stable; CORE_COUNT];
                match self.applier.apply(&restore).await {
                    Ok(()) => log::info!(
                        "Binning recovery: restored last_stable value {}",
                        checkpoint.last_stable
                    ),
                    Err(error) => log::error!(
                        "Binning recovery: failed to restore last_stable - {}",
                        error
                    ),
                }

                if let Some(crash_metrics) = &self.crash_metrics {
                    crash_metrics.record_crash(
                        &vec![checkpoint.current_value; CORE_COUNT],
                        &restore,
                        "binning_crash_recovery",
                    );
                }

                self.clear_checkpoint();
                recovery_performed = true;
            }
        }

        if self.has_tuning_flag() {
            log::warn!("Tuning flag detected on boot - performing recovery");
            self.remove_tuning_flag();

            let crashed = self.current_offsets();

            if let Err(error) = self.rollback_to_lkg().await {
                log::error!("Boot recovery rollback failed: {}", error);
            }

            if let Some(crash_metrics) = &self.crash_metrics {
                crash_metrics.record_crash(&crashed, &self.get_lkg(), "boot_recovery");
            }

            recovery_performed = true;
        }

        recovery_performed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{PlatformInfo, Variant};
    use async_trait::async_trait;

    pub struct RecordingApplier {
        pub applied: Mutex<Vec<Vec<i32>>>,
        pub fail: std::sync::atomic::AtomicBool,
    }

    impl RecordingApplier {
        pub fn new() -> Arc<RecordingApplier> {
            Arc::new(RecordingApplier {
                applied: Mutex::new(vec![]),
                fail: std::sync::atomic::AtomicBool::new(false),
            })
        }

        pub fn last(&self) -> Option<Vec<i32>> {
            self.applied.lock().unwrap().last().cloned()
        }
    }

    #[async_trait]
    impl ApplyOffsets for RecordingApplier {
        async fn apply(&self, offsets: &[i32]) -> power::Result<()> {
            if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(power::Error::CommandFailed(0, "simulated".to_string()));
            }
            self.applied.lock().unwrap().push(offsets.to_vec());
            Ok(())
        }
    }

    fn lcd_platform() -> PlatformInfo {
        PlatformInfo {
            model: "Jupiter".to_string(),
            variant: Variant::Lcd,
            safe_limit: -30,
            detected: true,
        }
    }

    fn policy(dir: &Path) -> (Arc<RecordingApplier>, SafetyPolicy) {
        let settings = Arc::new(SettingsManager::new(dir));
        let applier = RecordingApplier::new();
        let policy = SafetyPolicy::new(settings, lcd_platform(), applier.clone())
            .with_state_paths(dir.join("tuning_flag"), dir.join("binning_state.json"));
        (applier, policy)
    }

    #[test]
    fn test_clamp_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let (_applier, policy) = policy(dir.path());

        assert_eq!(policy.clamp(&[-50, -30, -10, 5]), vec![-30, -30, -10, 0]);
        assert_eq!(policy.clamp(&[0, 0, 0, 0]), vec![0, 0, 0, 0]);

        for value in -100..=50 {
            let clamped = policy.clamp(&[value; 4]);
            for &c in &clamped {
                assert!((-30..=0).contains(&c));
            }
            if (-30..=0).contains(&value) {
                assert_eq!(clamped, vec![value; 4]);
            }
        }
    }

    #[test]
    fn test_lkg_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (_applier, policy) = policy(dir.path());

        assert_eq!(policy.load_lkg(), vec![0; 4]);

        policy.save_lkg(&[-20, -20, -15, -20]);
        assert_eq!(policy.get_lkg(), vec![-20, -20, -15, -20]);
        assert_eq!(policy.load_lkg(), vec![-20, -20, -15, -20]);
    }

    #[test]
    fn test_malformed_lkg_falls_back_to_zeroes() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Arc::new(SettingsManager::new(dir.path()));
        settings.save(LKG_CORES_KEY, json!([-20, -20]));

        let policy = SafetyPolicy::new(settings, lcd_platform(), RecordingApplier::new());
        assert_eq!(policy.load_lkg(), vec![0; 4]);
    }

    #[tokio::test]
    async fn test_rollback_applies_lkg() {
        let dir = tempfile::tempdir().unwrap();
        let (applier, policy) = policy(dir.path());

        policy.save_lkg(&[-20; 4]);
        policy.rollback_to_lkg().await.unwrap();

        assert_eq!(applier.last(), Some(vec![-20; 4]));
    }

    #[test]
    fn test_checkpoint_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (_applier, policy) = policy(dir.path());

        assert!(policy.load_checkpoint().is_none());

        policy.update_checkpoint(-20, -15, 3, &[]);
        let checkpoint = policy.load_checkpoint().unwrap();

        assert!(checkpoint.active);
        assert_eq!(checkpoint.current_value, -20);
        assert_eq!(checkpoint.last_stable, -15);
        assert_eq!(checkpoint.iteration, 3);

        policy.clear_checkpoint();
        assert!(policy.load_checkpoint().is_none());
    }

    #[test]
    fn test_corrupt_checkpoint_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let (_applier, policy) = policy(dir.path());

        std::fs::write(dir.path().join("binning_state.json"), "{nope").unwrap();
        assert!(policy.load_checkpoint().is_none());
    }

    #[tokio::test]
    async fn test_boot_recovery_restores_last_stable_from_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let (applier, policy) = policy(dir.path());

        policy.update_checkpoint(-20, -15, 3, &[]);

        assert!(policy.check_boot_recovery().await);
        assert_eq!(applier.last(), Some(vec![-15; 4]));
        assert!(policy.load_checkpoint().is_none());
    }

    #[tokio::test]
    async fn test_boot_recovery_tuning_flag_rolls_back_to_lkg() {
        let dir = tempfile::tempdir().unwrap();
        let (applier, policy) = policy(dir.path());

        policy.save_lkg(&[-20; 4]);
        policy.create_tuning_flag();

        assert!(policy.check_boot_recovery().await);
        assert_eq!(applier.last(), Some(vec![-20; 4]));
        assert!(!policy.has_tuning_flag());
    }

    #[tokio::test]
    async fn test_boot_recovery_both_branches_fire() {
        let dir = tempfile::tempdir().unwrap();
        let (applier, policy) = policy(dir.path());

        policy.save_lkg(&[-10; 4]);
        policy.update_checkpoint(-25, -20, 4, &[-25]);
        policy.create_tuning_flag();

        assert!(policy.check_boot_recovery().await);

        let applied = applier.applied.lock().unwrap().clone();
        // Checkpoint branch first, then the LKG rollback.
        assert_eq!(applied, vec![vec![-20; 4], vec![-10; 4]]);
    }

    #[tokio::test]
    async fn test_boot_recovery_nothing_to_do() {
        let dir = tempfile::tempdir().unwrap();
        let (_applier, policy) = policy(dir.path());

        assert!(!policy.check_boot_recovery().await);
    }

    #[tokio::test]
    async fn test_boot_recovery_records_crash_metrics() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Arc::new(SettingsManager::new(dir.path()));
        let crash_metrics = Arc::new(CrashMetricsStore::new(Arc::clone(&settings)));
        let applier = RecordingApplier::new();
        let policy = SafetyPolicy::new(settings, lcd_platform(), applier.clone())
            .with_state_paths(dir.path().join("flag"), dir.path().join("checkpoint.json"))
            .with_crash_metrics(Arc::clone(&crash_metrics));

        policy.update_checkpoint(-25, -20, 4, &[]);
        policy.check_boot_recovery().await;

        let metrics = crash_metrics.metrics();
        assert_eq!(metrics.total_count, 1);
        assert_eq!(metrics.history[0].crashed_values, vec![-25; 4]);
        assert_eq!(metrics.history[0].restored_values, vec![-20; 4]);
    }
}
