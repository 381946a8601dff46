pub mod config;

pub use config::{ControllerMessage, DynamicConfig, DynamicStatus};

use crate::blackbox::{BlackBox, MetricSample};
use crate::events::EventSink;
use crate::session::SessionHistory;
use crate::stream::StatusStream;
use crate::telemetry::{TelemetryBuffer, TelemetrySample};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

const STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid dynamic config: {0}")]
    InvalidConfig(String),
    #[error("gymdeck3 binary not found: {0:?}")]
    BinaryMissing(PathBuf),
    #[error("failed to start gymdeck3: {0}")]
    SpawnError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

struct Inner {
    events: Arc<dyn EventSink>,
    stream: Arc<StatusStream>,
    blackbox: Arc<BlackBox>,
    telemetry: Arc<TelemetryBuffer>,
    sessions: Arc<SessionHistory>,
    status: std::sync::Mutex<DynamicStatus>,
    running: AtomicBool,
    session_id: std::sync::Mutex<Option<String>>,
    child: tokio::sync::Mutex<Option<Child>>,
}

/// Supervisor for the adaptive controller subprocess (gymdeck3).
///
/// Owns the child process handle, parses its newline-delimited status
/// protocol, and fans every status message out to the UI stream, the
/// blackbox, the telemetry ring, and the active session.
pub struct DynamicController {
    ryzenadj_path: PathBuf,
    gymdeck_path: PathBuf,
    inner: Arc<Inner>,
    reader: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl DynamicController {
    pub fn new<P1: AsRef<Path>, P2: AsRef<Path>>(
        ryzenadj_path: P1,
        gymdeck_path: P2,
        events: Arc<dyn EventSink>,
        stream: Arc<StatusStream>,
        blackbox: Arc<BlackBox>,
        telemetry: Arc<TelemetryBuffer>,
        sessions: Arc<SessionHistory>,
    ) -> DynamicController {
        DynamicController {
            ryzenadj_path: ryzenadj_path.as_ref().to_path_buf(),
            gymdeck_path: gymdeck_path.as_ref().to_path_buf(),
            inner: Arc::new(Inner {
                events,
                stream,
                blackbox,
                telemetry,
                sessions,
                status: std::sync::Mutex::new(DynamicStatus::default()),
                running: AtomicBool::new(false),
                session_id: std::sync::Mutex::new(None),
                child: tokio::sync::Mutex::new(None),
            }),
            reader: std::sync::Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> DynamicStatus {
        self.inner.status.lock().unwrap().clone()
    }

    /// Launch the subprocess. A controller that is already running is
    /// stopped first.
    pub async fn start(&self, config: DynamicConfig) -> Result<()> {
        let errors = config.validate();
        if !errors.is_empty() {
            log::error!("Invalid config: {:?}", errors);
            self.inner.events.emit_status("error").await;
            return Err(Error::InvalidConfig(errors.join("; ")));
        }

        if self.is_running() {
            self.stop().await;
        }

        if !self.gymdeck_path.is_file() {
            log::error!("gymdeck3 binary not found: {:?}", self.gymdeck_path);
            self.inner.events.emit_status("error").await;
            return Err(Error::BinaryMissing(self.gymdeck_path.clone()));
        }

        let args = config.build_args(&self.ryzenadj_path);
        log::info!(
            "Starting gymdeck3: {:?} {}",
            self.gymdeck_path,
            args.join(" ")
        );

        let mut child = Command::new(&self.gymdeck_path)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|error| {
                log::error!("Failed to start gymdeck3: {}", error);
                Error::SpawnError(error)
            })?;

        let stdout = child.stdout.take();
        let pid = child.id();

        *self.inner.status.lock().unwrap() = DynamicStatus {
            running: true,
            strategy: Some(config.strategy.clone()),
            ..DynamicStatus::default()
        };
        self.inner.running.store(true, Ordering::SeqCst);
        self.inner.stream.set_running(true);
        *self.inner.child.lock().await = Some(child);

        if let Some(stdout) = stdout {
            let inner = Arc::clone(&self.inner);
            let handle = tokio::spawn(async move { inner.read_output(stdout).await });
            *self.reader.lock().unwrap() = Some(handle);
        }

        let session = self.inner.sessions.start_session(None, None);
        *self.inner.session_id.lock().unwrap() = Some(session.id.clone());
        log::info!("Started session {} for dynamic mode", session.id);

        self.inner.events.emit_status("dynamic_running").await;
        log::info!("gymdeck3 started with PID {:?}", pid);
        Ok(())
    }

    /// Graceful stop: SIGTERM (the child resets offsets to 0 on it), then a
    /// kill after `STOP_TIMEOUT`.
    pub async fn stop(&self) -> bool {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return true;
        }

        log::info!("Stopping gymdeck3...");

        let mut child_slot = self.inner.child.lock().await;

        if let Some(child) = child_slot.as_mut() {
            if let Some(pid) = child.id() {
                if let Err(error) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                    log::warn!("Failed to send SIGTERM: {}", error);
                }
            }

            match tokio::time::timeout(STOP_TIMEOUT, child.wait()).await {
                Ok(Ok(status)) => log::debug!("gymdeck3 exited: {}", status),
                Ok(Err(error)) => log::warn!("Failed to wait for gymdeck3: {}", error),
                Err(_) => {
                    log::warn!("gymdeck3 did not exit gracefully, killing...");
                    if let Err(error) = child.kill().await {
                        log::warn!("Failed to kill gymdeck3: {}", error);
                    }
                }
            }
        }
        *child_slot = None;
        drop(child_slot);

        let reader = self.reader.lock().unwrap().take();
        if let Some(handle) = reader {
            handle.abort();
            let _ = handle.await;
        }

        *self.inner.status.lock().unwrap() = DynamicStatus::default();
        self.inner.stream.set_running(false);
        self.inner.end_session().await;
        self.inner.events.emit_status("disabled").await;

        log::info!("gymdeck3 stopped");
        true
    }

    /// Ask the child for an immediate status line.
    pub async fn force_status(&self) {
        if !self.is_running() {
            return;
        }

        let child_slot = self.inner.child.lock().await;
        if let Some(child) = child_slot.as_ref() {
            if let Some(pid) = child.id() {
                if let Err(error) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGUSR1) {
                    log::warn!("Failed to send SIGUSR1: {}", error);
                }
            }
        }
    }

    pub async fn persist_blackbox(&self, reason: &str) -> Option<String> {
        self.inner.blackbox.persist(reason).await
    }
}

impl Inner {
    fn now_epoch() -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }

    async fn read_output(self: Arc<Self>, stdout: tokio::process::ChildStdout) {
        let mut lines = BufReader::new(stdout).lines();

        loop {
            match lines.next_line().await {
                Ok(Some(line)) => self.handle_line(&line).await,
                Ok(None) => break,
                Err(error) => {
                    log::error!("Error reading gymdeck3 output: {}", error);
                    break;
                }
            }
        }

        // EOF with the running flag still set means the child died on us.
        if self.running.swap(false, Ordering::SeqCst) {
            let code = self.reap_exit_code().await;
            log::warn!("gymdeck3 exited unexpectedly with code {}", code);

            *self.status.lock().unwrap() = DynamicStatus {
                running: false,
                error: Some(format!("Process exited with code {}", code)),
                ..DynamicStatus::default()
            };

            self.stream.set_running(false);

            let reason = format!("gymdeck3_crash_code_{}", code);
            if let Some(filename) = self.blackbox.persist(&reason).await {
                log::info!("BlackBox persisted: {}", filename);
                self.events
                    .emit(
                        "blackbox_saved",
                        json!({ "filename": filename, "reason": reason }),
                    )
                    .await;
            }

            self.end_session().await;
            self.events.emit_status("error").await;
        }
    }

    async fn reap_exit_code(&self) -> i32 {
        let mut child_slot = self.child.lock().await;

        if let Some(child) = child_slot.as_mut() {
            if let Ok(Ok(status)) =
                tokio::time::timeout(Duration::from_secs(1), child.wait()).await
            {
                *child_slot = None;
                return status.code().unwrap_or(-1);
            }
        }
        -1
    }

    async fn handle_line(&self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }

        let message: ControllerMessage = match serde_json::from_str(line) {
            Ok(message) => message,
            Err(error) => {
                match serde_json::from_str::<serde_json::Value>(line) {
                    Ok(value) => log::debug!(
                        "Unknown message type: {}",
                        value.get("type").and_then(|t| t.as_str()).unwrap_or("?")
                    ),
                    Err(_) => log::warn!("Invalid JSON from gymdeck3: {}", error),
                }
                return;
            }
        };

        match message {
            ControllerMessage::Status(status) => {
                let snapshot = {
                    let mut current = self.status.lock().unwrap();
                    current.running = true;
                    current.load = status.load.clone();
                    current.values = status.values.clone();
                    current.fan = status.fan.clone();
                    current.power_w = status.power_w;
                    current.clone()
                };

                self.record_samples(&snapshot).await;

                self.stream.publish(json!({
                    "type": "dynamic_status",
                    "data": snapshot,
                }));
            }
            ControllerMessage::Transition { from, to, progress } => {
                log::debug!("Transition: {} -> {} ({:.0}%)", from, to, progress * 100.0);
            }
            ControllerMessage::Error { message } => {
                log::error!("gymdeck3 error: {}", message);
                self.status.lock().unwrap().error = Some(message);
            }
        }
    }

    async fn record_samples(&self, status: &DynamicStatus) {
        let timestamp = Self::now_epoch();

        let (temp_c, fan_rpm, fan_pwm) = match &status.fan {
            Some(fan) => (fan.temp_c, fan.rpm.unwrap_or(0), fan.pwm),
            None => (0.0, 0, 0),
        };

        let avg_load = if status.load.is_empty() {
            0.0
        } else {
            status.load.iter().sum::<f64>() / status.load.len() as f64
        };

        self.blackbox
            .record(MetricSample {
                timestamp,
                temperature_c: temp_c,
                cpu_load_percent: avg_load,
                undervolt_values: status.values.clone(),
                fan_speed_rpm: fan_rpm,
                fan_pwm,
            })
            .await;

        let power_w = status.power_w.unwrap_or(0.0);

        let sample = TelemetrySample {
            timestamp,
            temperature_c: temp_c,
            power_w,
            load_percent: avg_load,
        };
        self.telemetry.record(sample.clone()).await;
        self.events
            .emit("telemetry_sample", json!(sample))
            .await;

        self.sessions.add_sample(temp_c, power_w, timestamp);
    }

    async fn end_session(&self) {
        let session_id = self.session_id.lock().unwrap().take();

        if let Some(session_id) = session_id {
            if let Some(metrics) = self.sessions.end_session(&session_id) {
                log::info!(
                    "Ended session {}, duration: {:.1}s, avg_temp: {:.1}°C",
                    session_id,
                    metrics.duration_sec,
                    metrics.avg_temperature_c
                );
                self.events
                    .emit(
                        "session_ended",
                        json!({ "session_id": session_id, "metrics": metrics }),
                    )
                    .await;
            }
        }
    }
}
