use chrono::Utc;
use futures_locks::RwLock;
use serde_derive::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

/// Samples retained in the ring: ~30 s of history at the 500 ms status
/// cadence.
pub const RING_SIZE: usize = 60;

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct MetricSample {
    pub timestamp: f64,
    pub temperature_c: f64,
    pub cpu_load_percent: f64,
    pub undervolt_values: Vec<i32>,
    pub fan_speed_rpm: u32,
    pub fan_pwm: u32,
}

#[derive(Debug, Serialize)]
struct Recording<'a> {
    timestamp: String,
    reason: &'a str,
    duration_sec: f64,
    samples: &'a VecDeque<MetricSample>,
}

/// Fixed-capacity flight recorder for the dynamic controller's metrics.
///
/// The ring always holds the most recent `RING_SIZE` samples; on a crash or
/// watchdog trip the whole window is dumped to disk for post-mortem
/// analysis.
pub struct BlackBox {
    output_dir: PathBuf,
    ring: RwLock<VecDeque<MetricSample>>,
}

impl BlackBox {
    pub fn new<P: AsRef<Path>>(output_dir: P) -> BlackBox {
        BlackBox {
            output_dir: output_dir.as_ref().to_path_buf(),
            ring: RwLock::new(VecDeque::with_capacity(RING_SIZE)),
        }
    }

    pub async fn record(&self, sample: MetricSample) {
        let mut ring = self.ring.write().await;

        if ring.len() == RING_SIZE {
            ring.pop_front();
        }
        ring.push_back(sample);
    }

    /// Current contents in insertion order (oldest first).
    pub async fn snapshot(&self) -> Vec<MetricSample> {
        self.ring.read().await.iter().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.ring.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.ring.read().await.is_empty()
    }

    pub async fn clear(&self) {
        self.ring.write().await.clear();
    }

    /// Dump the current window to a timestamped file. Returns the filename,
    /// or `None` when the ring is empty or the write failed.
    pub async fn persist(&self, reason: &str) -> Option<String> {
        let ring = self.ring.read().await;

        if ring.is_empty() {
            log::debug!("BlackBox empty, nothing to persist for {:?}", reason);
            return None;
        }

        let duration_sec = match (ring.front(), ring.back()) {
            (Some(first), Some(last)) => last.timestamp - first.timestamp,
            _ => 0.0,
        };

        let recording = Recording {
            timestamp: Utc::now().to_rfc3339(),
            reason,
            duration_sec,
            samples: &*ring,
        };

        let filename = format!(
            "blackbox_{}_{}.json",
            Utc::now().format("%Y%m%d_%H%M%S"),
            sanitize_reason(reason)
        );

        if let Err(error) = std::fs::create_dir_all(&self.output_dir) {
            log::error!("Failed to create blackbox directory: {}", error);
            return None;
        }

        let path = self.output_dir.join(&filename);

        let encoded = match serde_json::to_string_pretty(&recording) {
            Ok(encoded) => encoded,
            Err(error) => {
                log::error!("Failed to encode blackbox recording: {}", error);
                return None;
            }
        };

        match std::fs::write(&path, encoded) {
            Ok(()) => {
                log::info!("BlackBox persisted to {:?} (reason: {})", path, reason);
                Some(filename)
            }
            Err(error) => {
                log::error!("Failed to persist blackbox recording: {}", error);
                None
            }
        }
    }
}

fn sanitize_reason(reason: &str) -> String {
    reason
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(n: usize) -> MetricSample {
        MetricSample {
            timestamp: 1_700_000_000.0 + n as f64 * 0.5,
            temperature_c: 60.0 + n as f64,
            cpu_load_percent: 50.0,
            undervolt_values: vec![-20, -20, -20, -20],
            fan_speed_rpm: 3000,
            fan_pwm: 128,
        }
    }

    #[tokio::test]
    async fn test_ring_keeps_last_sixty_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let blackbox = BlackBox::new(dir.path());

        for n in 0..75 {
            blackbox.record(sample(n)).await;
        }

        let snapshot = blackbox.snapshot().await;
        assert_eq!(snapshot.len(), RING_SIZE);
        assert_eq!(snapshot[0], sample(15));
        assert_eq!(snapshot[RING_SIZE - 1], sample(74));
    }

    #[tokio::test]
    async fn test_persist_empty_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let blackbox = BlackBox::new(dir.path());

        assert_eq!(blackbox.persist("watchdog_timeout").await, None);
    }

    #[tokio::test]
    async fn test_persist_writes_complete_recording() {
        let dir = tempfile::tempdir().unwrap();
        let blackbox = BlackBox::new(dir.path());

        for n in 0..10 {
            blackbox.record(sample(n)).await;
        }

        let filename = blackbox.persist("watchdog_timeout").await.unwrap();
        assert!(filename.contains("watchdog_timeout"));

        let content = std::fs::read_to_string(dir.path().join(&filename)).unwrap();
        let data: serde_json::Value = serde_json::from_str(&content).unwrap();

        assert!(data["timestamp"].is_string());
        assert_eq!(data["reason"], "watchdog_timeout");
        assert!((data["duration_sec"].as_f64().unwrap() - 4.5).abs() < 1e-9);
        assert_eq!(data["samples"].as_array().unwrap().len(), 10);
        assert_eq!(data["samples"][0]["temperature_c"], 60.0);
        assert_eq!(data["samples"][0]["undervolt_values"][0], -20);
    }

    #[tokio::test]
    async fn test_persist_sanitizes_reason_in_filename() {
        let dir = tempfile::tempdir().unwrap();
        let blackbox = BlackBox::new(dir.path());
        blackbox.record(sample(0)).await;

        let filename = blackbox.persist("gymdeck3 crash/code -9").await.unwrap();
        assert!(!filename.contains('/'));
        assert!(!filename.contains(' '));
    }
}
