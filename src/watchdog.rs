use crate::blackbox::BlackBox;
use crate::safety::recovery::{ProgressiveRecovery, RecoveryState};
use crate::safety::SafetyPolicy;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;

pub const HEARTBEAT_FILE: &str = "/tmp/decktune_heartbeat";
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
pub const TIMEOUT: Duration = Duration::from_secs(30);

struct Inner {
    safety: Arc<SafetyPolicy>,
    recovery: Option<Arc<ProgressiveRecovery>>,
    blackbox: Option<Arc<BlackBox>>,
    heartbeat_path: PathBuf,
    check_interval: Duration,
    timeout: Duration,
    running: AtomicBool,
    heartbeat_count: AtomicU64,
}

/// Heartbeat monitor with automatic rollback.
///
/// A live main loop keeps the heartbeat file fresh; if it goes stale for
/// `TIMEOUT` the machine is assumed to be crawling out of a hang and the
/// watchdog drives progressive recovery (or a direct LKG rollback when no
/// recovery is configured). Monitoring continues only while recovery sits in
/// its Reduced state waiting for stability.
pub struct Watchdog {
    inner: Arc<Inner>,
    monitor: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Watchdog {
    pub fn new(safety: Arc<SafetyPolicy>) -> Watchdog {
        Watchdog {
            inner: Arc::new(Inner {
                safety,
                recovery: None,
                blackbox: None,
                heartbeat_path: PathBuf::from(HEARTBEAT_FILE),
                check_interval: HEARTBEAT_INTERVAL,
                timeout: TIMEOUT,
                running: AtomicBool::new(false),
                heartbeat_count: AtomicU64::new(0),
            }),
            monitor: std::sync::Mutex::new(None),
        }
    }

    pub fn with_recovery(mut self, recovery: Arc<ProgressiveRecovery>) -> Watchdog {
        Arc::get_mut(&mut self.inner)
            .expect("watchdog already started")
            .recovery = Some(recovery);
        self
    }

    pub fn with_blackbox(mut self, blackbox: Arc<BlackBox>) -> Watchdog {
        Arc::get_mut(&mut self.inner)
            .expect("watchdog already started")
            .blackbox = Some(blackbox);
        self
    }

    pub fn with_heartbeat_path<P: AsRef<Path>>(mut self, path: P) -> Watchdog {
        Arc::get_mut(&mut self.inner)
            .expect("watchdog already started")
            .heartbeat_path = path.as_ref().to_path_buf();
        self
    }

    pub fn with_timing(mut self, check_interval: Duration, timeout: Duration) -> Watchdog {
        let inner = Arc::get_mut(&mut self.inner).expect("watchdog already started");
        inner.check_interval = check_interval;
        inner.timeout = timeout;
        self
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn heartbeat_count(&self) -> u64 {
        self.inner.heartbeat_count.load(Ordering::SeqCst)
    }

    /// Prove liveness. Also forwards the heartbeat to an in-progress
    /// recovery so it can count down to stability confirmation.
    pub async fn write_heartbeat(&self) {
        self.inner.write_heartbeat().await;
    }

    pub fn read_heartbeat(&self) -> Option<f64> {
        self.inner.read_heartbeat()
    }

    pub fn is_heartbeat_stale(&self) -> bool {
        self.inner.is_stale()
    }

    pub fn clear_heartbeat(&self) {
        self.inner.clear_heartbeat();
    }

    /// Write an initial heartbeat and spawn the monitoring loop.
    pub async fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            log::warn!("Watchdog already running");
            return;
        }

        self.inner.heartbeat_count.store(0, Ordering::SeqCst);

        if let Some(recovery) = &self.inner.recovery {
            recovery.reset().await;
        }

        self.inner.write_heartbeat().await;

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move { inner.monitor_loop().await });
        *self.monitor.lock().unwrap() = Some(handle);

        log::info!("Watchdog started");
    }

    /// Stop monitoring and delete the heartbeat file.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }

        let handle = self.monitor.lock().unwrap().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }

        self.inner.clear_heartbeat();

        if let Some(recovery) = &self.inner.recovery {
            recovery.reset().await;
        }

        log::info!("Watchdog stopped");
    }
}

impl Inner {
    fn now_epoch() -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }

    async fn write_heartbeat(&self) {
        if let Err(error) = std::fs::write(&self.heartbeat_path, Self::now_epoch().to_string()) {
            log::warn!("Failed to write heartbeat: {}", error);
            return;
        }

        let count = self.heartbeat_count.fetch_add(1, Ordering::SeqCst) + 1;
        log::debug!("Heartbeat written: {}", count);

        if let Some(recovery) = &self.recovery {
            if recovery.is_recovering().await && recovery.on_heartbeat().await {
                log::info!("Progressive recovery: stability confirmed after heartbeat");
            }
        }
    }

    fn read_heartbeat(&self) -> Option<f64> {
        match std::fs::read_to_string(&self.heartbeat_path) {
            Ok(content) => match content.trim().parse::<f64>() {
                Ok(value) => Some(value),
                Err(error) => {
                    log::warn!("Failed to parse heartbeat: {}", error);
                    None
                }
            },
            Err(_) => None,
        }
    }

    fn is_stale(&self) -> bool {
        match self.read_heartbeat() {
            Some(last) => Self::now_epoch() - last >= self.timeout.as_secs_f64(),
            None => true,
        }
    }

    fn clear_heartbeat(&self) {
        if self.heartbeat_path.exists() {
            if let Err(error) = std::fs::remove_file(&self.heartbeat_path) {
                log::warn!("Failed to clear heartbeat file: {}", error);
            }
        }
    }

    async fn monitor_loop(self: Arc<Self>) {
        while self.running.load(Ordering::SeqCst) {
            tokio::time::sleep(self.check_interval).await;

            if !self.running.load(Ordering::SeqCst) {
                break;
            }

            if self.is_stale() {
                log::warn!(
                    "Heartbeat stale for >= {:?}, triggering rollback",
                    self.timeout
                );
                self.trigger_rollback().await;

                if let Some(recovery) = &self.recovery {
                    if recovery.is_recovering().await {
                        log::info!("Progressive recovery in progress, continuing monitoring");
                        continue;
                    }
                }

                self.running.store(false, Ordering::SeqCst);
                self.clear_heartbeat();
                break;
            }
        }
    }

    async fn trigger_rollback(&self) {
        // Preserve the crashing window before any state changes.
        if let Some(blackbox) = &self.blackbox {
            if let Some(filename) = blackbox.persist("watchdog_timeout").await {
                log::info!("BlackBox persisted on instability: {}", filename);
            }
        }

        match &self.recovery {
            Some(recovery) => {
                log::warn!("Watchdog triggering progressive recovery");

                match recovery.on_instability().await {
                    Ok(RecoveryState::Reduced { reduced, .. }) => {
                        log::info!(
                            "Progressive recovery: values reduced to {:?}, waiting for stability",
                            reduced
                        );
                    }
                    Ok(RecoveryState::RolledBack) => {
                        log::info!("Progressive recovery: full rollback completed");
                    }
                    Ok(RecoveryState::Initial) => {}
                    Err(error) => {
                        log::error!("Progressive recovery failed: {}", error);
                        log::warn!("Falling back to direct LKG rollback");
                        self.direct_rollback().await;
                    }
                }
            }
            None => self.direct_rollback().await,
        }
    }

    async fn direct_rollback(&self) {
        log::warn!("Watchdog triggering direct rollback to LKG values");

        match self.safety.rollback_to_lkg().await {
            Ok(()) => log::info!("Watchdog rollback successful"),
            Err(error) => log::error!("Watchdog rollback failed: {}", error),
        }
    }
}
