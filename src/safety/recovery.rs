use super::SafetyPolicy;
use crate::power::{self, ApplyOffsets};

use serde_derive::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Millivolts added back (toward zero) on the first instability.
pub const REDUCTION_STEP: i32 = 5;
/// Clean heartbeats required in the Reduced state before the reduction is
/// promoted to the new LKG.
pub const STABILITY_HEARTBEATS: u32 = 2;

const STATE_KEY: &str = "recovery_state";

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum RecoveryState {
    Initial,
    Reduced {
        original: Vec<i32>,
        reduced: Vec<i32>,
        heartbeats: u32,
    },
    RolledBack,
}

impl RecoveryState {
    pub fn is_reduced(&self) -> bool {
        matches!(self, RecoveryState::Reduced { .. })
    }
}

/// Two-stage response to detected instability.
///
/// The first trip backs the offsets off by `REDUCTION_STEP` and watches for
/// stability instead of throwing away the whole tuning result; only when
/// instability persists does the machine fall all the way back to the LKG.
pub struct ProgressiveRecovery {
    safety: Arc<SafetyPolicy>,
    state: Mutex<RecoveryState>,
}

impl ProgressiveRecovery {
    pub fn new(safety: Arc<SafetyPolicy>) -> ProgressiveRecovery {
        // Pick up a recovery that was mid-flight when the process died.
        let state = safety
            .settings()
            .get(STATE_KEY)
            .and_then(|value| serde_json::from_value(value).ok())
            .unwrap_or(RecoveryState::Initial);

        ProgressiveRecovery {
            safety,
            state: Mutex::new(state),
        }
    }

    pub async fn state(&self) -> RecoveryState {
        self.state.lock().await.clone()
    }

    pub async fn is_recovering(&self) -> bool {
        self.state.lock().await.is_reduced()
    }

    pub async fn reset(&self) {
        *self.state.lock().await = RecoveryState::Initial;
    }

    /// Instability detected (stale heartbeat). First occurrence reduces the
    /// current offsets; a repeat while still unconfirmed escalates to a full
    /// LKG rollback. Further occurrences keep re-applying the LKG.
    pub async fn on_instability(&self) -> power::Result<RecoveryState> {
        let mut state = self.state.lock().await;

        match state.clone() {
            RecoveryState::Initial => {
                let original = self.safety.current_offsets();
                let reduced: Vec<i32> = original
                    .iter()
                    .map(|&v| (v + REDUCTION_STEP).min(0))
                    .collect();

                log::warn!(
                    "Instability detected: reducing offsets {:?} -> {:?}",
                    original,
                    reduced
                );

                match self.safety.applier().apply(&reduced).await {
                    Ok(()) => {
                        *state = RecoveryState::Reduced {
                            original,
                            reduced,
                            heartbeats: 0,
                        };
                        self.persist_state(&state);
                        Ok(state.clone())
                    }
                    Err(error) => {
                        // Could not even apply the gentler values; go straight
                        // to the known-good configuration.
                        log::error!(
                            "Failed to apply reduced values ({}), escalating to full rollback",
                            error
                        );
                        self.rollback(&mut state).await
                    }
                }
            }
            RecoveryState::Reduced { .. } => {
                log::warn!("Instability persisted in reduced state, escalating to full rollback");
                self.rollback(&mut state).await
            }
            RecoveryState::RolledBack => {
                // Safety net: keep re-applying the LKG.
                self.safety.rollback_to_lkg().await?;
                Ok(RecoveryState::RolledBack)
            }
        }
    }

    /// A clean heartbeat arrived. Returns true when this heartbeat confirmed
    /// stability (the reduced values became the new LKG).
    pub async fn on_heartbeat(&self) -> bool {
        let mut state = self.state.lock().await;

        if let RecoveryState::Reduced {
            original,
            reduced,
            heartbeats,
        } = state.clone()
        {
            let heartbeats = heartbeats + 1;

            if heartbeats >= STABILITY_HEARTBEATS {
                log::info!(
                    "Stability confirmed after {} heartbeats, promoting {:?} to LKG",
                    heartbeats,
                    reduced
                );
                self.safety.save_lkg(&reduced);
                *state = RecoveryState::Initial;
                self.persist_state(&state);
                return true;
            }

            *state = RecoveryState::Reduced {
                original,
                reduced,
                heartbeats,
            };
            self.persist_state(&state);
        }

        false
    }

    async fn rollback(
        &self,
        state: &mut RecoveryState,
    ) -> power::Result<RecoveryState> {
        let result = self.safety.rollback_to_lkg().await;
        *state = RecoveryState::RolledBack;
        self.persist_state(state);
        result.map(|_| RecoveryState::RolledBack)
    }

    fn persist_state(&self, state: &RecoveryState) {
        if let Ok(value) = serde_json::to_value(state) {
            // Best effort; an unreadable state just means recovery restarts
            // from Initial after a reboot.
            let _ = self.safety.settings().save(STATE_KEY, value);
        }
    }
}
