use crate::settings::SettingsManager;

use chrono::Utc;
use serde_derive::{Deserialize, Serialize};
use serde_json::json;
use std::sync::{Arc, Mutex};

/// Oldest records are dropped once the history reaches this many entries.
pub const HISTORY_LIMIT: usize = 50;

const SETTINGS_KEY: &str = "crash_metrics";

/// One recovery event: the offsets that brought the machine down and the
/// offsets that were restored in response.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct CrashRecord {
    pub timestamp: String,
    pub crashed_values: Vec<i32>,
    pub restored_values: Vec<i32>,
    pub recovery_reason: String,
}

impl CrashRecord {
    pub fn is_complete(&self) -> bool {
        !self.timestamp.is_empty()
            && self.crashed_values.len() == 4
            && self.restored_values.len() == 4
            && !self.recovery_reason.is_empty()
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct CrashMetrics {
    pub total_count: u64,
    pub last_crash_date: Option<String>,
    #[serde(default)]
    pub history: Vec<CrashRecord>,
}

/// Bounded FIFO log of recovery events, persisted through the settings
/// store.
pub struct CrashMetricsStore {
    settings: Arc<SettingsManager>,
    metrics: Mutex<CrashMetrics>,
}

impl CrashMetricsStore {
    pub fn new(settings: Arc<SettingsManager>) -> CrashMetricsStore {
        let metrics = match settings.get(SETTINGS_KEY) {
            Some(value) => match serde_json::from_value(value) {
                Ok(metrics) => metrics,
                Err(error) => {
                    log::warn!("Failed to load crash metrics from settings: {}", error);
                    CrashMetrics::default()
                }
            },
            None => CrashMetrics::default(),
        };

        CrashMetricsStore {
            settings,
            metrics: Mutex::new(metrics),
        }
    }

    pub fn record_crash(&self, crashed_values: &[i32], restored_values: &[i32], reason: &str) {
        let timestamp = Utc::now().to_rfc3339();

        let record = CrashRecord {
            timestamp: timestamp.clone(),
            crashed_values: crashed_values.to_vec(),
            restored_values: restored_values.to_vec(),
            recovery_reason: reason.to_string(),
        };

        let mut metrics = self.metrics.lock().unwrap();

        metrics.history.push(record);
        while metrics.history.len() > HISTORY_LIMIT {
            metrics.history.remove(0);
        }

        metrics.total_count += 1;
        metrics.last_crash_date = Some(timestamp);

        log::info!(
            "Recorded crash recovery: reason={}, crashed={:?}, restored={:?}",
            reason,
            crashed_values,
            restored_values
        );

        self.persist(&metrics);
    }

    pub fn metrics(&self) -> CrashMetrics {
        self.metrics.lock().unwrap().clone()
    }

    pub fn export_for_diagnostics(&self) -> serde_json::Value {
        let metrics = self.metrics.lock().unwrap();
        json!({ "crash_metrics": serde_json::to_value(&*metrics).unwrap_or_default() })
    }

    fn persist(&self, metrics: &CrashMetrics) {
        match serde_json::to_value(metrics) {
            Ok(value) => {
                if !self.settings.save(SETTINGS_KEY, value) {
                    log::error!("Failed to save crash metrics to settings");
                }
            }
            Err(error) => log::error!("Failed to encode crash metrics: {}", error),
        }
    }
}
