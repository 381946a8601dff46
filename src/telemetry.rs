use futures_locks::RwLock;
use serde_derive::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Samples retained for the UI: ~5 minutes at 1 Hz.
pub const BUFFER_SIZE: usize = 300;

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct TelemetrySample {
    pub timestamp: f64,
    pub temperature_c: f64,
    pub power_w: f64,
    pub load_percent: f64,
}

/// Rolling telemetry window backing the frontend graphs.
pub struct TelemetryBuffer {
    ring: RwLock<VecDeque<TelemetrySample>>,
}

impl TelemetryBuffer {
    pub fn new() -> TelemetryBuffer {
        TelemetryBuffer {
            ring: RwLock::new(VecDeque::with_capacity(BUFFER_SIZE)),
        }
    }

    pub async fn record(&self, sample: TelemetrySample) {
        let mut ring = self.ring.write().await;

        if ring.len() == BUFFER_SIZE {
            ring.pop_front();
        }
        ring.push_back(sample);
    }

    pub async fn snapshot(&self) -> Vec<TelemetrySample> {
        self.ring.read().await.iter().cloned().collect()
    }

    pub async fn latest(&self) -> Option<TelemetrySample> {
        self.ring.read().await.back().cloned()
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
}

impl Default for TelemetryBuffer {
    fn default() -> TelemetryBuffer {
        TelemetryBuffer::new()
    }
}
