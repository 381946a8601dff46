pub mod crash;

use crate::settings::SettingsManager;

use chrono::{DateTime, Utc};
use serde_derive::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Sessions kept in the settings store before the oldest overflow into the
/// archive file.
pub const ACTIVE_LIMIT: usize = 100;
pub const HISTORY_DEFAULT_LIMIT: usize = 30;

/// Typical whole-device draw without undervolting, used to estimate savings.
const BASELINE_POWER_W: f64 = 25.0;

const ARCHIVE_FILE_NAME: &str = "sessions_archive.json";
const SETTINGS_KEY: &str = "sessions";

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct SessionSample {
    pub timestamp: f64,
    pub temperature_c: f64,
    pub power_w: f64,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct SessionMetrics {
    pub duration_sec: f64,
    pub avg_temperature_c: f64,
    pub min_temperature_c: f64,
    pub max_temperature_c: f64,
    pub avg_power_w: f64,
    pub estimated_battery_saved_wh: f64,
    pub undervolt_values: Vec<i32>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Session {
    pub id: String,
    pub start_time: String,
    pub end_time: Option<String>,
    pub game_name: Option<String>,
    pub app_id: Option<u32>,
    pub metrics: Option<SessionMetrics>,
    #[serde(default)]
    pub samples: Vec<SessionSample>,
}

impl Session {
    pub fn is_active(&self) -> bool {
        self.end_time.is_none()
    }
}

/// Element-wise metric differences, computed as `session1 − session2` so
/// that `compare(a, b)` and `compare(b, a)` are exact negations.
#[derive(Clone, Debug, Serialize)]
pub struct MetricsDiff {
    pub duration_sec: f64,
    pub avg_temperature_c: f64,
    pub min_temperature_c: f64,
    pub max_temperature_c: f64,
    pub avg_power_w: f64,
    pub estimated_battery_saved_wh: f64,
}

#[derive(Clone, Debug, Serialize)]
pub struct SessionComparison {
    pub session1: Session,
    pub session2: Session,
    pub diff: MetricsDiff,
}

struct HistoryState {
    sessions: Vec<Session>,
    active: Option<Session>,
}

/// Gaming-session ledger: one active session at a time, computed metrics on
/// end, bounded history with archival overflow.
pub struct SessionHistory {
    settings: Arc<SettingsManager>,
    data_dir: PathBuf,
    state: Mutex<HistoryState>,
}

impl SessionHistory {
    pub fn new<P: AsRef<Path>>(settings: Arc<SettingsManager>, data_dir: P) -> SessionHistory {
        let sessions = match settings.get(SETTINGS_KEY) {
            Some(value) => match serde_json::from_value(value) {
                Ok(sessions) => sessions,
                Err(error) => {
                    log::warn!("Failed to load sessions from settings: {}", error);
                    vec![]
                }
            },
            None => vec![],
        };

        SessionHistory {
            settings,
            data_dir: data_dir.as_ref().to_path_buf(),
            state: Mutex::new(HistoryState {
                sessions,
                active: None,
            }),
        }
    }

    /// Open a new session, ending any session still active.
    pub fn start_session(&self, game_name: Option<&str>, app_id: Option<u32>) -> Session {
        let previous = {
            let state = self.state.lock().unwrap();
            state.active.as_ref().map(|s| s.id.clone())
        };

        if let Some(id) = previous {
            log::warn!("Ending previous active session before starting new one");
            self.end_session(&id);
        }

        let session = Session {
            id: Uuid::new_v4().to_string(),
            start_time: Utc::now().to_rfc3339(),
            end_time: None,
            game_name: game_name.map(|s| s.to_string()),
            app_id,
            metrics: None,
            samples: vec![],
        };

        log::info!(
            "Started session {} for game: {}",
            session.id,
            game_name.unwrap_or("Unknown")
        );

        self.state.lock().unwrap().active = Some(session.clone());
        session
    }

    pub fn add_sample(&self, temperature_c: f64, power_w: f64, timestamp: f64) {
        let mut state = self.state.lock().unwrap();

        if let Some(active) = &mut state.active {
            active.samples.push(SessionSample {
                timestamp,
                temperature_c,
                power_w,
            });
        }
    }

    /// Close the named session, compute its metrics, and fold it into the
    /// history (archiving overflow).
    pub fn end_session(&self, session_id: &str) -> Option<SessionMetrics> {
        let mut state = self.state.lock().unwrap();

        match &state.active {
            Some(active) if active.id == session_id => {}
            _ => {
                log::warn!("Session {} not found or not active", session_id);
                return None;
            }
        }

        let mut session = state.active.take().unwrap();
        session.end_time = Some(Utc::now().to_rfc3339());

        let metrics = compute_metrics(&session);
        session.metrics = Some(metrics.clone());

        state.sessions.push(session);
        self.archive_overflow(&mut state);
        self.persist(&state);

        log::info!(
            "Ended session {}, duration: {:.1}s",
            session_id,
            metrics.duration_sec
        );

        Some(metrics)
    }

    pub fn active_session(&self) -> Option<Session> {
        self.state.lock().unwrap().active.clone()
    }

    /// Recent completed sessions, most recent first.
    pub fn get_history(&self, limit: usize) -> Vec<Session> {
        let state = self.state.lock().unwrap();
        state
            .sessions
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn get_session(&self, session_id: &str) -> Option<Session> {
        let state = self.state.lock().unwrap();

        if let Some(active) = &state.active {
            if active.id == session_id {
                return Some(active.clone());
            }
        }

        state.sessions.iter().find(|s| s.id == session_id).cloned()
    }

    pub fn compare(&self, id1: &str, id2: &str) -> Option<SessionComparison> {
        let session1 = self.get_session(id1)?;
        let session2 = self.get_session(id2)?;

        let m1 = session1.metrics.clone()?;
        let m2 = session2.metrics.clone()?;

        Some(SessionComparison {
            diff: MetricsDiff {
                duration_sec: m1.duration_sec - m2.duration_sec,
                avg_temperature_c: m1.avg_temperature_c - m2.avg_temperature_c,
                min_temperature_c: m1.min_temperature_c - m2.min_temperature_c,
                max_temperature_c: m1.max_temperature_c - m2.max_temperature_c,
                avg_power_w: m1.avg_power_w - m2.avg_power_w,
                estimated_battery_saved_wh: m1.estimated_battery_saved_wh
                    - m2.estimated_battery_saved_wh,
            },
            session1,
            session2,
        })
    }

    pub fn export_for_diagnostics(&self) -> serde_json::Value {
        let state = self.state.lock().unwrap();
        json!({
            "session_count": state.sessions.len(),
            "active_session": state.active,
            "recent_sessions": state.sessions.iter().rev().take(10).collect::<Vec<_>>(),
        })
    }

    fn archive_overflow(&self, state: &mut HistoryState) {
        if state.sessions.len() <= ACTIVE_LIMIT {
            return;
        }

        let overflow = state.sessions.len() - ACTIVE_LIMIT;
        let archived: Vec<Session> = state.sessions.drain(..overflow).collect();
        let archive_path = self.data_dir.join(ARCHIVE_FILE_NAME);

        let result = std::fs::create_dir_all(&self.data_dir)
            .map_err(|e| e.to_string())
            .and_then(|_| {
                let mut existing: Vec<Session> = if archive_path.exists() {
                    std::fs::read_to_string(&archive_path)
                        .ok()
                        .and_then(|content| serde_json::from_str(&content).ok())
                        .unwrap_or_else(|| {
                            log::warn!("Failed to load existing archive, starting fresh");
                            vec![]
                        })
                } else {
                    vec![]
                };

                existing.extend(archived.iter().cloned());

                serde_json::to_string(&existing)
                    .map_err(|e| e.to_string())
                    .and_then(|encoded| {
                        std::fs::write(&archive_path, encoded).map_err(|e| e.to_string())
                    })
            });

        match result {
            Ok(()) => log::info!("Archived {} sessions to {:?}", overflow, archive_path),
            Err(error) => {
                log::error!("Failed to archive sessions: {}", error);
                // Put them back so nothing is lost.
                let mut restored = archived;
                restored.extend(state.sessions.drain(..));
                state.sessions = restored;
            }
        }
    }

    fn persist(&self, state: &HistoryState) {
        match serde_json::to_value(&state.sessions) {
            Ok(value) => {
                if !self.settings.save(SETTINGS_KEY, value) {
                    log::error!("Failed to save sessions to settings");
                }
            }
            Err(error) => log::error!("Failed to encode sessions: {}", error),
        }
    }
}

fn compute_metrics(session: &Session) -> SessionMetrics {
    let duration_sec = session_duration(session);

    if session.samples.is_empty() {
        return SessionMetrics {
            duration_sec,
            avg_temperature_c: 0.0,
            min_temperature_c: 0.0,
            max_temperature_c: 0.0,
            avg_power_w: 0.0,
            estimated_battery_saved_wh: 0.0,
            undervolt_values: vec![0; 4],
        };
    }

    let count = session.samples.len() as f64;
    let mut min_temp = f64::MAX;
    let mut max_temp = f64::MIN;
    let mut temp_sum = 0.0;
    let mut power_sum = 0.0;

    for sample in &session.samples {
        min_temp = min_temp.min(sample.temperature_c);
        max_temp = max_temp.max(sample.temperature_c);
        temp_sum += sample.temperature_c;
        power_sum += sample.power_w;
    }

    let avg_power = power_sum / count;
    let duration_hours = duration_sec / 3600.0;
    let power_saved_w = (BASELINE_POWER_W - avg_power).max(0.0);

    SessionMetrics {
        duration_sec,
        avg_temperature_c: temp_sum / count,
        min_temperature_c: min_temp,
        max_temperature_c: max_temp,
        avg_power_w: avg_power,
        estimated_battery_saved_wh: power_saved_w * duration_hours,
        undervolt_values: vec![0; 4],
    }
}

fn session_duration(session: &Session) -> f64 {
    let start = DateTime::parse_from_rfc3339(&session.start_time);
    let end = session
        .end_time
        .as_deref()
        .map(DateTime::parse_from_rfc3339);

    match (start, end) {
        (Ok(start), Some(Ok(end))) => {
            end.signed_duration_since(start).num_milliseconds() as f64 / 1000.0
        }
        (Ok(start), None) => {
            Utc::now().signed_duration_since(start).num_milliseconds() as f64 / 1000.0
        }
        _ => 0.0,
    }
}
