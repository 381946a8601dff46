pub mod monitor;

pub use monitor::{GameHooks, GameStateMonitor};

use crate::events::EventSink;
use crate::power::{ApplyOffsets, CORE_COUNT};
use crate::safety::SafetyPolicy;

use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

/// Hard ceiling on profile application / reset during a game transition.
const HOOK_TIMEOUT: Duration = Duration::from_secs(2);

const WIZARD_PRESETS_KEY: &str = "wizard_presets";
const FREQUENCY_PRESETS_KEY: &str = "frequency_wizard_presets";
const CORES_KEY: &str = "cores";

#[derive(Error, Debug)]
pub enum Error {
    #[error("frequency wizard game-only presets are not implemented")]
    Unimplemented,
    #[error(transparent)]
    Apply(#[from] crate::power::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Applies the saved undervolt profile while a game runs and resets to
/// defaults on exit. Every write goes through SafetyPolicy so profile
/// values are clamped to the platform limits.
pub struct GameOnlyModeController {
    safety: Arc<SafetyPolicy>,
    events: Arc<dyn EventSink>,
    enabled: AtomicBool,
    last_profile: Mutex<Option<Vec<i32>>>,
}

impl GameOnlyModeController {
    pub fn new(safety: Arc<SafetyPolicy>, events: Arc<dyn EventSink>) -> GameOnlyModeController {
        GameOnlyModeController {
            safety,
            events,
            enabled: AtomicBool::new(false),
            last_profile: Mutex::new(None),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub async fn enable(&self, monitor: &GameStateMonitor) -> bool {
        if self.enabled.load(Ordering::SeqCst) {
            log::warn!("Game Only Mode is already enabled");
            return true;
        }

        log::info!("Enabling Game Only Mode");

        if !monitor.start_monitoring().await {
            log::error!("Failed to start game state monitoring");
            return false;
        }

        self.enabled.store(true, Ordering::SeqCst);
        true
    }

    pub async fn disable(&self, monitor: &GameStateMonitor) -> bool {
        if !self.enabled.load(Ordering::SeqCst) {
            log::warn!("Game Only Mode is not enabled");
            return true;
        }

        log::info!("Disabling Game Only Mode");

        monitor.stop_monitoring().await;

        if let Err(error) = self.reset_undervolt().await {
            log::error!("Failed to reset undervolt while disabling: {}", error);
        }

        self.enabled.store(false, Ordering::SeqCst);
        *self.last_profile.lock().unwrap() = None;
        true
    }

    pub fn status(&self, monitor: &GameStateMonitor) -> serde_json::Value {
        json!({
            "enabled": self.is_enabled(),
            "monitoring": monitor.is_running(),
            "game_running": monitor.is_game_running(),
            "last_profile": *self.last_profile.lock().unwrap(),
        })
    }

    async fn apply_profile(&self) -> Result<()> {
        // Wizard presets flagged game-only take priority over the plain
        // profile.
        if let Some(presets) = self.safety.settings().get(WIZARD_PRESETS_KEY) {
            if let Some(presets) = presets.as_array() {
                for preset in presets {
                    if preset
                        .get("game_only_mode")
                        .and_then(|v| v.as_bool())
                        .unwrap_or(false)
                    {
                        let name = preset.get("name").and_then(|n| n.as_str()).unwrap_or("?");
                        log::info!("Applying wizard preset (game only): {}", name);

                        let cores: Vec<i32> = preset
                            .pointer("/offsets/cpu")
                            .and_then(|v| serde_json::from_value(v.clone()).ok())
                            .unwrap_or_else(|| vec![0; CORE_COUNT]);

                        let cores = self.safety.clamp(&cores);
                        self.safety.applier().apply(&cores).await?;
                        *self.last_profile.lock().unwrap() = Some(cores);
                        self.events.emit_status("enabled").await;
                        return Ok(());
                    }
                }
            }
        }

        if let Some(presets) = self.safety.settings().get(FREQUENCY_PRESETS_KEY) {
            if let Some(presets) = presets.as_array() {
                for preset in presets {
                    if preset
                        .get("game_only_mode")
                        .and_then(|v| v.as_bool())
                        .unwrap_or(false)
                    {
                        return Err(Error::Unimplemented);
                    }
                }
            }
        }

        let profile: Option<Vec<i32>> = self
            .safety
            .settings()
            .get(CORES_KEY)
            .and_then(|value| serde_json::from_value(value).ok());

        let profile = match profile {
            Some(profile) if profile != vec![0; CORE_COUNT] => profile,
            _ => {
                log::info!("No active profile to apply, skipping");
                return Ok(());
            }
        };

        let profile = self.safety.clamp(&profile);
        log::debug!("Applying profile: {:?}", profile);
        self.safety.applier().apply(&profile).await?;
        *self.last_profile.lock().unwrap() = Some(profile);
        self.events.emit_status("enabled").await;
        Ok(())
    }

    async fn reset_undervolt(&self) -> Result<()> {
        log::debug!("Resetting undervolt to default [0, 0, 0, 0]");
        self.safety.applier().disable().await?;
        *self.last_profile.lock().unwrap() = None;
        self.events.emit_status("disabled").await;
        Ok(())
    }
}

#[async_trait]
impl GameHooks for GameOnlyModeController {
    async fn on_game_start(&self, app_id: u32) {
        if !self.is_enabled() {
            return;
        }

        log::info!("Game started (app_id: {}), applying profile", app_id);

        match tokio::time::timeout(HOOK_TIMEOUT, self.apply_profile()).await {
            Ok(Ok(())) => {}
            Ok(Err(Error::Unimplemented)) => {
                log::warn!("Frequency wizard game-only presets are not implemented");
            }
            Ok(Err(error)) => {
                log::error!("Error applying profile on game start: {}", error);
                self.events.emit_status("error").await;
            }
            Err(_) => {
                log::error!("Profile application timed out after {:?}", HOOK_TIMEOUT);
                self.events.emit_status("error").await;
            }
        }
    }

    async fn on_game_exit(&self) {
        if !self.is_enabled() {
            return;
        }

        log::info!("Game exited, resetting undervolt to default");

        match tokio::time::timeout(HOOK_TIMEOUT, self.reset_undervolt()).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                log::error!("Error resetting undervolt on game exit: {}", error);
                self.events.emit_status("error").await;
            }
            Err(_) => {
                log::error!("Undervolt reset timed out after {:?}", HOOK_TIMEOUT);
                self.events.emit_status("error").await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::LogSink;
    use crate::platform::{PlatformInfo, Variant};
    use crate::power::{self, ApplyOffsets};
    use crate::settings::SettingsManager;

    struct RecordingApplier {
        applied: Mutex<Vec<Vec<i32>>>,
        delay: Duration,
    }

    impl RecordingApplier {
        fn new() -> Arc<RecordingApplier> {
            Arc::new(RecordingApplier {
                applied: Mutex::new(vec![]),
                delay: Duration::from_millis(0),
            })
        }
    }

    #[async_trait]
    impl ApplyOffsets for RecordingApplier {
        async fn apply(&self, offsets: &[i32]) -> power::Result<()> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.applied.lock().unwrap().push(offsets.to_vec());
            Ok(())
        }
    }

    fn controller(
        dir: &std::path::Path,
        applier: Arc<RecordingApplier>,
    ) -> (Arc<SettingsManager>, GameOnlyModeController) {
        let settings = Arc::new(SettingsManager::new(dir));
        let safety = Arc::new(
            SafetyPolicy::new(
                Arc::clone(&settings),
                PlatformInfo {
                    model: "Jupiter".to_string(),
                    variant: Variant::Lcd,
                    safe_limit: -30,
                    detected: true,
                },
                applier,
            )
            .with_state_paths(dir.join("flag"), dir.join("checkpoint.json")),
        );
        let controller = GameOnlyModeController::new(safety, Arc::new(LogSink));
        controller.enabled.store(true, Ordering::SeqCst);
        (settings, controller)
    }

    #[tokio::test]
    async fn test_game_start_applies_saved_profile() {
        let dir = tempfile::tempdir().unwrap();
        let applier = RecordingApplier::new();
        let (settings, controller) = controller(dir.path(), applier.clone());

        settings.save(CORES_KEY, json!([-15, -15, -15, -15]));

        controller.on_game_start(1091500).await;

        assert_eq!(applier.applied.lock().unwrap().clone(), vec![vec![-15; 4]]);
        assert_eq!(
            *controller.last_profile.lock().unwrap(),
            Some(vec![-15; 4])
        );
    }

    #[tokio::test]
    async fn test_profile_is_clamped_to_platform_limits() {
        let dir = tempfile::tempdir().unwrap();
        let applier = RecordingApplier::new();
        let (settings, controller) = controller(dir.path(), applier.clone());

        // Deeper than the LCD safe limit of -30.
        settings.save(CORES_KEY, json!([-50, -50, -50, -50]));

        controller.on_game_start(1091500).await;

        assert_eq!(applier.applied.lock().unwrap().clone(), vec![vec![-30; 4]]);
    }

    #[tokio::test]
    async fn test_game_start_skips_zero_profile() {
        let dir = tempfile::tempdir().unwrap();
        let applier = RecordingApplier::new();
        let (settings, controller) = controller(dir.path(), applier.clone());

        settings.save(CORES_KEY, json!([0, 0, 0, 0]));

        controller.on_game_start(1091500).await;

        assert!(applier.applied.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_wizard_preset_takes_priority() {
        let dir = tempfile::tempdir().unwrap();
        let applier = RecordingApplier::new();
        let (settings, controller) = controller(dir.path(), applier.clone());

        settings.save(CORES_KEY, json!([-15, -15, -15, -15]));
        settings.save(
            WIZARD_PRESETS_KEY,
            json!([
                { "name": "daily", "game_only_mode": false, "offsets": { "cpu": [-5, -5, -5, -5] } },
                { "name": "deep", "game_only_mode": true, "offsets": { "cpu": [-25, -25, -25, -25] } },
            ]),
        );

        controller.on_game_start(1091500).await;

        assert_eq!(applier.applied.lock().unwrap().clone(), vec![vec![-25; 4]]);
    }

    #[tokio::test]
    async fn test_frequency_wizard_preset_is_an_explicit_unimplemented() {
        let dir = tempfile::tempdir().unwrap();
        let applier = RecordingApplier::new();
        let (settings, controller) = controller(dir.path(), applier.clone());

        settings.save(
            FREQUENCY_PRESETS_KEY,
            json!([{ "name": "freq", "game_only_mode": true }]),
        );

        let result = controller.apply_profile().await;
        assert!(matches!(result, Err(Error::Unimplemented)));
        assert!(applier.applied.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_game_exit_resets_to_zero() {
        let dir = tempfile::tempdir().unwrap();
        let applier = RecordingApplier::new();
        let (settings, controller) = controller(dir.path(), applier.clone());

        settings.save(CORES_KEY, json!([-15, -15, -15, -15]));
        controller.on_game_start(1091500).await;
        controller.on_game_exit().await;

        let applied = applier.applied.lock().unwrap().clone();
        assert_eq!(applied, vec![vec![-15; 4], vec![0; 4]]);
        assert_eq!(*controller.last_profile.lock().unwrap(), None);
    }

    #[tokio::test]
    async fn test_hooks_are_noops_while_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let applier = RecordingApplier::new();
        let (settings, controller) = controller(dir.path(), applier.clone());
        controller.enabled.store(false, Ordering::SeqCst);

        settings.save(CORES_KEY, json!([-15, -15, -15, -15]));

        controller.on_game_start(1091500).await;
        controller.on_game_exit().await;

        assert!(applier.applied.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_slow_apply_hits_the_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let applier = Arc::new(RecordingApplier {
            applied: Mutex::new(vec![]),
            delay: Duration::from_secs(3),
        });
        let (settings, controller) = controller(dir.path(), applier.clone());

        settings.save(CORES_KEY, json!([-15, -15, -15, -15]));

        let started = std::time::Instant::now();
        controller.on_game_start(1091500).await;

        // The hook returned at the timeout, not after the full delay.
        assert!(started.elapsed() < Duration::from_secs(3));
    }
}
