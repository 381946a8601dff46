use crate::events::EventSink;
use crate::power::{ApplyOffsets, CORE_COUNT};
use crate::safety::SafetyPolicy;

use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Millivolts added back onto the deepest stable value when recommending a
/// daily-driver setting.
pub const SAFETY_MARGIN: i32 = 5;

#[derive(Error, Debug)]
pub enum Error {
    #[error("binning is already running")]
    AlreadyRunning,
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug)]
pub struct BinningConfig {
    pub start_value: i32,
    pub step_size: i32,
    pub test_duration: Duration,
    pub max_iterations: u32,
    pub consecutive_fail_limit: u32,
}

impl Default for BinningConfig {
    fn default() -> BinningConfig {
        BinningConfig {
            start_value: -10,
            step_size: 5,
            test_duration: Duration::from_secs(60),
            max_iterations: 20,
            consecutive_fail_limit: 3,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct BinningResult {
    pub max_stable: i32,
    pub recommended: i32,
    pub iterations: u32,
    pub duration: Duration,
    pub aborted: bool,
}

/// Pass/fail verdict from an external stress-test run.
#[async_trait]
pub trait StressDriver: Send + Sync {
    async fn run_test(&self, duration: Duration) -> bool;
}

/// Driver that shells out to an external stress tool.
///
/// Any `{duration}` placeholder in the arguments is replaced by the test
/// window in seconds. A test passes when the command exits 0 within the
/// window (plus a grace period for the tool's own teardown).
pub struct CommandDriver {
    program: String,
    args: Vec<String>,
}

impl CommandDriver {
    const GRACE: Duration = Duration::from_secs(30);

    pub fn new(program: &str, args: &[String]) -> CommandDriver {
        CommandDriver {
            program: program.to_string(),
            args: args.to_vec(),
        }
    }
}

#[async_trait]
impl StressDriver for CommandDriver {
    async fn run_test(&self, duration: Duration) -> bool {
        let args: Vec<String> = self
            .args
            .iter()
            .map(|a| a.replace("{duration}", &duration.as_secs().to_string()))
            .collect();

        let mut child = match tokio::process::Command::new(&self.program)
            .args(&args)
            .spawn()
        {
            Ok(child) => child,
            Err(error) => {
                log::error!("Failed to spawn stress command {}: {}", self.program, error);
                return false;
            }
        };

        match tokio::time::timeout(duration + Self::GRACE, child.wait()).await {
            Ok(Ok(status)) => status.success(),
            Ok(Err(error)) => {
                log::error!("Failed to wait for stress command: {}", error);
                false
            }
            Err(_) => {
                log::warn!("Stress command overran its window, killing");
                let _ = child.kill().await;
                false
            }
        }
    }
}

/// Iterative voltage-descent search for the deepest stable offset.
///
/// Values descend from `start_value` in `step_size` decrements. A checkpoint
/// is written before every iteration, so a hang mid-test leaves the boot
/// recovery path enough to restore the last value that passed.
pub struct BinningEngine {
    applier: Arc<dyn ApplyOffsets>,
    driver: Arc<dyn StressDriver>,
    safety: Arc<SafetyPolicy>,
    events: Arc<dyn EventSink>,
    running: AtomicBool,
    cancelled: AtomicBool,
}

impl BinningEngine {
    pub fn new(
        applier: Arc<dyn ApplyOffsets>,
        driver: Arc<dyn StressDriver>,
        safety: Arc<SafetyPolicy>,
        events: Arc<dyn EventSink>,
    ) -> BinningEngine {
        BinningEngine {
            applier,
            driver,
            safety,
            events,
            running: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Request cancellation; takes effect between iterations.
    pub fn cancel(&self) {
        if self.is_running() {
            log::info!("Binning cancellation requested");
            self.cancelled.store(true, Ordering::SeqCst);
        }
    }

    pub async fn start(&self, config: BinningConfig) -> Result<BinningResult> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyRunning);
        }
        self.cancelled.store(false, Ordering::SeqCst);

        // Offsets to restore if the session is cancelled mid-descent.
        let previous_values = self.safety.load_lkg();

        let result = self.run(&config).await;

        self.safety.clear_checkpoint();

        if self.cancelled.load(Ordering::SeqCst) {
            log::info!("Restoring previous values: {:?}", previous_values);
            if let Err(error) = self.applier.apply(&previous_values).await {
                log::error!("Failed to restore previous values: {}", error);
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(result)
    }

    async fn run(&self, config: &BinningConfig) -> BinningResult {
        let started = Instant::now();
        let safe_limit = self.safety.platform().safe_limit;

        let mut iteration: u32 = 0;
        let mut last_stable: i32 = 0;
        let mut failed_values: Vec<i32> = vec![];
        let mut consecutive_failures: u32 = 0;
        let mut aborted = false;
        let mut current_value = config.start_value;

        log::info!(
            "Starting binning: start={}, step={}, duration={:?}, safe_limit={}",
            config.start_value,
            config.step_size,
            config.test_duration,
            safe_limit
        );

        while iteration < config.max_iterations {
            if self.cancelled.load(Ordering::SeqCst) {
                log::info!("Binning cancelled by user");
                aborted = true;
                break;
            }

            if current_value < safe_limit {
                log::info!("Reached platform safe limit: {}", safe_limit);
                aborted = true;
                break;
            }

            iteration += 1;

            // Checkpoint the value about to be tested, never the last-tested
            // one: if this iteration hangs the machine, boot recovery must
            // restore `last_stable`.
            self.safety
                .update_checkpoint(current_value, last_stable, iteration, &failed_values);

            let remaining = config.max_iterations - iteration;
            let eta = remaining as u64 * config.test_duration.as_secs();

            self.events
                .emit(
                    "binning_progress",
                    json!({
                        "current_value": current_value,
                        "iteration": iteration,
                        "last_stable": last_stable,
                        "eta": eta,
                    }),
                )
                .await;

            log::info!("Binning iteration {}: testing value {}", iteration, current_value);
            let passed = self.run_iteration(current_value, config).await;

            if passed {
                last_stable = current_value;
                consecutive_failures = 0;
                log::info!("Iteration {} passed: {} is stable", iteration, current_value);

                current_value -= config.step_size;
            } else {
                failed_values.push(current_value);
                consecutive_failures += 1;
                log::warn!("Iteration {} failed: {} is unstable", iteration, current_value);

                if consecutive_failures >= config.consecutive_fail_limit {
                    log::warn!("Aborting: {} consecutive failures", consecutive_failures);
                    aborted = true;
                    break;
                }

                // Descent stops at the first failing value.
                log::info!("Stopping binning after first failure");
                break;
            }
        }

        if iteration >= config.max_iterations {
            log::warn!("Binning reached max iterations: {}", config.max_iterations);
            aborted = true;
        }

        let result = BinningResult {
            max_stable: last_stable,
            recommended: last_stable + SAFETY_MARGIN,
            iterations: iteration,
            duration: started.elapsed(),
            aborted,
        };

        log::info!(
            "Binning complete: max_stable={}, recommended={}, iterations={}, duration={:.1}s, aborted={}",
            result.max_stable,
            result.recommended,
            result.iterations,
            result.duration.as_secs_f64(),
            result.aborted
        );

        result
    }

    async fn run_iteration(&self, value: i32, config: &BinningConfig) -> bool {
        let test_values = [value; CORE_COUNT];

        if let Err(error) = self.applier.apply(&test_values).await {
            log::error!("Failed to apply test value {}: {}", value, error);
            return false;
        }

        self.driver.run_test(config.test_duration).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::LogSink;
    use crate::platform::{PlatformInfo, Variant};
    use crate::power;
    use crate::settings::SettingsManager;
    use std::sync::Mutex;

    struct RecordingApplier {
        applied: Mutex<Vec<Vec<i32>>>,
    }

    #[async_trait]
    impl ApplyOffsets for RecordingApplier {
        async fn apply(&self, offsets: &[i32]) -> power::Result<()> {
            self.applied.lock().unwrap().push(offsets.to_vec());
            Ok(())
        }
    }

    /// Driver with a scripted pass/fail sequence; optionally snapshots the
    /// checkpoint visible at test time.
    struct ScriptedDriver {
        verdicts: Mutex<Vec<bool>>,
        safety: Option<Arc<SafetyPolicy>>,
        observed_checkpoints: Arc<Mutex<Vec<(i32, i32)>>>,
        delay: Duration,
    }

    impl ScriptedDriver {
        fn passing() -> ScriptedDriver {
            ScriptedDriver::scripted(vec![])
        }

        fn scripted(verdicts: Vec<bool>) -> ScriptedDriver {
            ScriptedDriver {
                verdicts: Mutex::new(verdicts),
                safety: None,
                observed_checkpoints: Arc::new(Mutex::new(vec![])),
                delay: Duration::from_millis(0),
            }
        }
    }

    #[async_trait]
    impl StressDriver for ScriptedDriver {
        async fn run_test(&self, _duration: Duration) -> bool {
            if let Some(safety) = &self.safety {
                if let Some(checkpoint) = safety.load_checkpoint() {
                    self.observed_checkpoints
                        .lock()
                        .unwrap()
                        .push((checkpoint.current_value, checkpoint.last_stable));
                }
            }

            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }

            let mut verdicts = self.verdicts.lock().unwrap();
            if verdicts.is_empty() {
                true
            } else {
                verdicts.remove(0)
            }
        }
    }

    fn setup(
        dir: &std::path::Path,
        safe_limit: i32,
        driver: ScriptedDriver,
    ) -> (Arc<RecordingApplier>, Arc<SafetyPolicy>, BinningEngine) {
        let settings = Arc::new(SettingsManager::new(dir));
        let applier = Arc::new(RecordingApplier {
            applied: Mutex::new(vec![]),
        });
        let safety = Arc::new(
            SafetyPolicy::new(
                settings,
                PlatformInfo {
                    model: "Jupiter".to_string(),
                    variant: Variant::Lcd,
                    safe_limit,
                    detected: true,
                },
                applier.clone(),
            )
            .with_state_paths(dir.join("flag"), dir.join("checkpoint.json")),
        );
        let engine = BinningEngine::new(
            applier.clone(),
            Arc::new(driver),
            Arc::clone(&safety),
            Arc::new(LogSink),
        );
        (applier, safety, engine)
    }

    #[tokio::test]
    async fn test_descent_sequence_with_always_passing_tests() {
        let dir = tempfile::tempdir().unwrap();
        let (applier, _safety, engine) = setup(dir.path(), -1000, ScriptedDriver::passing());

        let config = BinningConfig {
            start_value: -10,
            step_size: 5,
            test_duration: Duration::from_millis(1),
            max_iterations: 4,
            consecutive_fail_limit: 3,
        };

        let result = engine.start(config).await.unwrap();

        let applied = applier.applied.lock().unwrap().clone();
        assert_eq!(
            applied,
            vec![vec![-10; 4], vec![-15; 4], vec![-20; 4], vec![-25; 4]]
        );
        assert_eq!(result.iterations, 4);
        assert_eq!(result.max_stable, -25);
        assert_eq!(result.recommended, -20);
        assert!(result.aborted); // stopped by max_iterations
    }

    #[tokio::test]
    async fn test_descent_stops_at_safe_limit() {
        let dir = tempfile::tempdir().unwrap();
        let (applier, _safety, engine) = setup(dir.path(), -20, ScriptedDriver::passing());

        let config = BinningConfig {
            start_value: -10,
            step_size: 5,
            test_duration: Duration::from_millis(1),
            max_iterations: 20,
            consecutive_fail_limit: 3,
        };

        let result = engine.start(config).await.unwrap();

        // -10, -15, -20 pass; -25 would cross the limit.
        let applied = applier.applied.lock().unwrap().clone();
        assert_eq!(applied.len(), 3);
        assert_eq!(result.max_stable, -20);
        assert_eq!(result.recommended, -15);
        assert!(result.aborted);
    }

    #[tokio::test]
    async fn test_first_failure_stops_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let (_applier, safety, engine) = setup(
            dir.path(),
            -1000,
            ScriptedDriver::scripted(vec![true, true, false]),
        );

        let config = BinningConfig {
            start_value: -10,
            step_size: 5,
            test_duration: Duration::from_millis(1),
            max_iterations: 20,
            consecutive_fail_limit: 3,
        };

        let result = engine.start(config).await.unwrap();

        assert_eq!(result.iterations, 3);
        assert_eq!(result.max_stable, -15);
        assert_eq!(result.recommended, -10);
        assert!(!result.aborted);
        // Checkpoint is cleared on graceful completion.
        assert!(safety.load_checkpoint().is_none());
    }

    #[tokio::test]
    async fn test_checkpoint_always_reflects_value_under_test() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Arc::new(SettingsManager::new(dir.path()));
        let applier = Arc::new(RecordingApplier {
            applied: Mutex::new(vec![]),
        });
        let safety = Arc::new(
            SafetyPolicy::new(
                settings,
                PlatformInfo {
                    model: "Jupiter".to_string(),
                    variant: Variant::Lcd,
                    safe_limit: -1000,
                    detected: true,
                },
                applier.clone(),
            )
            .with_state_paths(
                dir.path().join("flag"),
                dir.path().join("checkpoint.json"),
            ),
        );

        let driver = ScriptedDriver {
            verdicts: Mutex::new(vec![]),
            safety: Some(Arc::clone(&safety)),
            observed_checkpoints: Arc::new(Mutex::new(vec![])),
            delay: Duration::from_millis(0),
        };
        let observed = Arc::clone(&driver.observed_checkpoints);

        let engine = BinningEngine::new(
            applier,
            Arc::new(driver),
            Arc::clone(&safety),
            Arc::new(LogSink),
        );

        let config = BinningConfig {
            start_value: -10,
            step_size: 5,
            test_duration: Duration::from_millis(1),
            max_iterations: 3,
            consecutive_fail_limit: 3,
        };

        engine.start(config).await.unwrap();

        // During each test the checkpoint names the value being tested and
        // the previous iteration's stable value.
        assert_eq!(
            observed.lock().unwrap().clone(),
            vec![(-10, 0), (-15, -10), (-20, -15)]
        );
    }

    #[tokio::test]
    async fn test_cancellation_restores_previous_lkg() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Arc::new(SettingsManager::new(dir.path()));
        let applier = Arc::new(RecordingApplier {
            applied: Mutex::new(vec![]),
        });
        let safety = Arc::new(
            SafetyPolicy::new(
                settings,
                PlatformInfo {
                    model: "Jupiter".to_string(),
                    variant: Variant::Lcd,
                    safe_limit: -1000,
                    detected: true,
                },
                applier.clone(),
            )
            .with_state_paths(
                dir.path().join("flag"),
                dir.path().join("checkpoint.json"),
            ),
        );
        safety.save_lkg(&[-5; 4]);

        let driver = ScriptedDriver {
            verdicts: Mutex::new(vec![]),
            safety: None,
            observed_checkpoints: Arc::new(Mutex::new(vec![])),
            delay: Duration::from_millis(40),
        };
        let engine = Arc::new(BinningEngine::new(
            applier.clone(),
            Arc::new(driver),
            Arc::clone(&safety),
            Arc::new(LogSink),
        ));

        let config = BinningConfig {
            start_value: -10,
            step_size: 5,
            test_duration: Duration::from_millis(1),
            max_iterations: 20,
            consecutive_fail_limit: 3,
        };

        let runner = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.start(config).await })
        };

        // Cancel while the first test is still sleeping.
        tokio::time::sleep(Duration::from_millis(20)).await;
        engine.cancel();

        let result = runner.await.unwrap().unwrap();

        assert!(result.aborted);
        assert!(safety.load_checkpoint().is_none());
        // The previous LKG was re-applied after cancellation.
        assert_eq!(applier.applied.lock().unwrap().last(), Some(&vec![-5; 4]));
    }

    #[tokio::test]
    async fn test_start_while_running_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Arc::new(SettingsManager::new(dir.path()));
        let applier = Arc::new(RecordingApplier {
            applied: Mutex::new(vec![]),
        });
        let safety = Arc::new(
            SafetyPolicy::new(
                settings,
                PlatformInfo {
                    model: "Jupiter".to_string(),
                    variant: Variant::Lcd,
                    safe_limit: -1000,
                    detected: true,
                },
                applier.clone(),
            )
            .with_state_paths(
                dir.path().join("flag"),
                dir.path().join("checkpoint.json"),
            ),
        );

        let driver = ScriptedDriver {
            verdicts: Mutex::new(vec![]),
            safety: None,
            observed_checkpoints: Arc::new(Mutex::new(vec![])),
            delay: Duration::from_millis(50),
        };
        let engine = Arc::new(BinningEngine::new(
            applier,
            Arc::new(driver),
            safety,
            Arc::new(LogSink),
        ));

        let config = BinningConfig {
            test_duration: Duration::from_millis(1),
            max_iterations: 2,
            ..BinningConfig::default()
        };

        let runner = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.start(config).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(matches!(
            engine.start(config).await,
            Err(Error::AlreadyRunning)
        ));

        runner.await.unwrap().unwrap();
    }
}
