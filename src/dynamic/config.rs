use crate::power::CORE_COUNT;

use serde_derive::{Deserialize, Serialize};
use std::path::Path;

/// Per-core adaptation bounds. `min_mv` is the shallow end (applied under
/// load), `max_mv` the deep end (applied when idle); both are ≤ 0 and
/// `max_mv ≤ min_mv`.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct CoreConfig {
    pub min_mv: i32,
    pub max_mv: i32,
    pub threshold: f64,
}

impl Default for CoreConfig {
    fn default() -> CoreConfig {
        CoreConfig {
            min_mv: 0,
            max_mv: -20,
            threshold: 50.0,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct FanControlConfig {
    pub enabled: bool,
    pub mode: String,
    pub hysteresis_temp: i32,
    pub zero_rpm_enabled: bool,
    #[serde(default)]
    pub curve: Vec<(i32, i32)>,
}

/// Launch configuration for the adaptive controller subprocess.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct DynamicConfig {
    pub strategy: String,
    pub sample_interval_ms: u64,
    pub hysteresis_percent: f64,
    pub status_interval_ms: u64,
    pub cores: Vec<CoreConfig>,
    /// Simple mode pins every core to `simple_value` for both bounds.
    pub simple_mode: bool,
    pub simple_value: i32,
    #[serde(default)]
    pub fan: FanControlConfig,
}

impl Default for DynamicConfig {
    fn default() -> DynamicConfig {
        DynamicConfig {
            strategy: "balanced".to_string(),
            sample_interval_ms: 100,
            hysteresis_percent: 5.0,
            status_interval_ms: 1000,
            cores: vec![CoreConfig::default(); CORE_COUNT],
            simple_mode: false,
            simple_value: -20,
            fan: FanControlConfig::default(),
        }
    }
}

impl DynamicConfig {
    /// All problems with the configuration; empty when launchable.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = vec![];

        if self.strategy.is_empty() {
            errors.push("strategy must not be empty".to_string());
        }

        if self.sample_interval_ms == 0 {
            errors.push("sample interval must be positive".to_string());
        }

        if !(0.0..=100.0).contains(&self.hysteresis_percent) {
            errors.push(format!(
                "hysteresis {} outside [0, 100]",
                self.hysteresis_percent
            ));
        }

        if self.status_interval_ms == 0 {
            errors.push("status interval must be positive".to_string());
        }

        if self.cores.len() != CORE_COUNT {
            errors.push(format!(
                "expected {} core configs, got {}",
                CORE_COUNT,
                self.cores.len()
            ));
        }

        for (i, core) in self.cores.iter().enumerate() {
            if core.min_mv > 0 || core.max_mv > 0 {
                errors.push(format!("core {} bounds must be <= 0", i));
            }
            if core.max_mv > core.min_mv {
                errors.push(format!(
                    "core {} max_mv {} is shallower than min_mv {}",
                    i, core.max_mv, core.min_mv
                ));
            }
            if !(0.0..=100.0).contains(&core.threshold) {
                errors.push(format!("core {} threshold outside [0, 100]", i));
            }
        }

        if self.simple_mode && self.simple_value > 0 {
            errors.push("simple value must be <= 0".to_string());
        }

        errors
    }

    /// Argv for the subprocess, in the order its parser expects.
    pub fn build_args(&self, ryzenadj_path: &Path) -> Vec<String> {
        let mut args = vec![
            self.strategy.clone(),
            (self.sample_interval_ms * 1000).to_string(),
            format!("--hysteresis={}", self.hysteresis_percent),
            format!("--ryzenadj-path={}", ryzenadj_path.display()),
            format!("--status-interval={}", self.status_interval_ms),
        ];

        for (i, core) in self.cores.iter().enumerate() {
            if self.simple_mode {
                args.push(format!(
                    "--core={}:{}:{}:{}",
                    i, self.simple_value, self.simple_value, core.threshold
                ));
            } else {
                args.push(format!(
                    "--core={}:{}:{}:{}",
                    i, core.min_mv, core.max_mv, core.threshold
                ));
            }
        }

        if self.fan.enabled {
            args.push("--fan-control".to_string());
            args.push(format!("--fan-mode={}", self.fan.mode));
            args.push(format!("--fan-hysteresis={}", self.fan.hysteresis_temp));

            if self.fan.zero_rpm_enabled {
                args.push("--fan-zero-rpm".to_string());
            }

            if self.fan.mode == "custom" {
                for (temp, speed) in &self.fan.curve {
                    args.push(format!("--fan-curve={}:{}", temp, speed));
                }
            }
        }

        args
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct FanStatus {
    pub rpm: Option<u32>,
    pub pwm: u32,
    pub temp_c: f64,
}

/// Last parsed state of the subprocess.
#[derive(Clone, Debug, Default, Serialize)]
pub struct DynamicStatus {
    pub running: bool,
    pub strategy: Option<String>,
    pub load: Vec<f64>,
    pub values: Vec<i32>,
    pub fan: Option<FanStatus>,
    pub power_w: Option<f64>,
    pub error: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct StatusMessage {
    #[serde(default)]
    pub load: Vec<f64>,
    #[serde(default)]
    pub values: Vec<i32>,
    pub fan: Option<FanStatus>,
    pub power_w: Option<f64>,
}

/// Closed schema for the subprocess's newline-delimited stdout protocol.
/// Unknown tags fail to parse and are logged, never crash the reader.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControllerMessage {
    Status(StatusMessage),
    Transition {
        from: String,
        to: String,
        #[serde(default)]
        progress: f64,
    },
    Error {
        message: String,
    },
}
