use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Grace period before a newly detected app id fires the start hook, so a
/// transient flicker in Steam's state files does not thrash profiles.
pub const DEBOUNCE_DELAY: Duration = Duration::from_millis(500);

/// StateFlags bit Steam sets while an app is running.
const STATE_FLAG_RUNNING: u64 = 0x2;

lazy_static! {
    static ref MANIFEST_NAME: Regex = Regex::new(r"^appmanifest_(\d+)\.acf$").unwrap();
    static ref STATE_FLAGS: Regex = Regex::new(r#""StateFlags"\s+"(\d+)""#).unwrap();
}

/// Callbacks fired on game-state transitions.
#[async_trait]
pub trait GameHooks: Send + Sync {
    async fn on_game_start(&self, app_id: u32);
    async fn on_game_exit(&self);
}

struct Inner {
    hooks: Arc<dyn GameHooks>,
    steamapps_dir: PathBuf,
    proc_dir: PathBuf,
    poll_interval: Duration,
    debounce: Duration,
    running: AtomicBool,
    current_app_id: Mutex<Option<u32>>,
}

/// Poll-based Steam game detector.
///
/// Two sources are consulted in order: appmanifest StateFlags, then the
/// process table (`steam -applaunch <id>`). Transitions drive the injected
/// hooks; detection errors only skip a poll, never stop the loop.
pub struct GameStateMonitor {
    inner: Arc<Inner>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

impl GameStateMonitor {
    pub fn new(hooks: Arc<dyn GameHooks>) -> GameStateMonitor {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());

        GameStateMonitor {
            inner: Arc::new(Inner {
                hooks,
                steamapps_dir: Path::new(&home).join(".steam").join("steam").join("steamapps"),
                proc_dir: PathBuf::from("/proc"),
                poll_interval: DEFAULT_POLL_INTERVAL,
                debounce: DEBOUNCE_DELAY,
                running: AtomicBool::new(false),
                current_app_id: Mutex::new(None),
            }),
            poll_task: Mutex::new(None),
        }
    }

    pub fn with_paths<P1: AsRef<Path>, P2: AsRef<Path>>(
        mut self,
        steamapps_dir: P1,
        proc_dir: P2,
    ) -> GameStateMonitor {
        let inner = Arc::get_mut(&mut self.inner).expect("monitor already started");
        inner.steamapps_dir = steamapps_dir.as_ref().to_path_buf();
        inner.proc_dir = proc_dir.as_ref().to_path_buf();
        self
    }

    pub fn with_timing(mut self, poll_interval: Duration, debounce: Duration) -> GameStateMonitor {
        let inner = Arc::get_mut(&mut self.inner).expect("monitor already started");
        inner.poll_interval = poll_interval;
        inner.debounce = debounce;
        self
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn is_game_running(&self) -> bool {
        self.inner.current_app_id.lock().unwrap().is_some()
    }

    pub fn current_app_id(&self) -> Option<u32> {
        *self.inner.current_app_id.lock().unwrap()
    }

    /// One-shot detection, bypassing the loop.
    pub fn detect(&self) -> Option<u32> {
        self.inner.detect()
    }

    pub async fn start_monitoring(&self) -> bool {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            log::warn!("GameStateMonitor is already running");
            return true;
        }

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move { inner.poll_loop().await });
        *self.poll_task.lock().unwrap() = Some(handle);

        log::info!("GameStateMonitor started");
        true
    }

    pub async fn stop_monitoring(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }

        let handle = self.poll_task.lock().unwrap().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }

        *self.inner.current_app_id.lock().unwrap() = None;
        log::info!("GameStateMonitor stopped");
    }
}

impl Inner {
    fn detect(&self) -> Option<u32> {
        self.detect_from_appmanifest()
            .or_else(|| self.detect_from_proc())
    }

    fn detect_from_appmanifest(&self) -> Option<u32> {
        let entries = std::fs::read_dir(&self.steamapps_dir).ok()?;

        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let name = match file_name.to_str() {
                Some(name) => name,
                None => continue,
            };

            let app_id: u32 = match MANIFEST_NAME
                .captures(name)
                .and_then(|c| c.get(1))
                .and_then(|m| m.as_str().parse().ok())
            {
                Some(app_id) => app_id,
                None => continue,
            };

            let content = match std::fs::read_to_string(entry.path()) {
                Ok(content) => content,
                Err(_) => continue,
            };

            let flags: u64 = match STATE_FLAGS
                .captures(&content)
                .and_then(|c| c.get(1))
                .and_then(|m| m.as_str().parse().ok())
            {
                Some(flags) => flags,
                None => continue,
            };

            if flags & STATE_FLAG_RUNNING != 0 {
                log::debug!("Detected running game from appmanifest: {}", app_id);
                return Some(app_id);
            }
        }

        None
    }

    fn detect_from_proc(&self) -> Option<u32> {
        let entries = std::fs::read_dir(&self.proc_dir).ok()?;

        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let name = match file_name.to_str() {
                Some(name) => name,
                None => continue,
            };

            if !name.chars().all(|c| c.is_ascii_digit()) {
                continue;
            }

            let cmdline = match std::fs::read(entry.path().join("cmdline")) {
                Ok(bytes) => bytes,
                Err(_) => continue,
            };

            let decoded = String::from_utf8_lossy(&cmdline);
            let args: Vec<&str> = decoded.split('\0').collect();

            if args.is_empty() || !args[0].to_lowercase().contains("steam") {
                continue;
            }

            for window in args.windows(2) {
                if window[0] == "-applaunch" {
                    if let Ok(app_id) = window[1].parse::<u32>() {
                        log::debug!("Detected running game from /proc: {}", app_id);
                        return Some(app_id);
                    }
                }
            }
        }

        None
    }

    async fn poll_loop(self: Arc<Self>) {
        log::info!("GameStateMonitor polling loop started");
        let mut first_poll = true;

        while self.running.load(Ordering::SeqCst) {
            let detected = self.detect();
            let previous = *self.current_app_id.lock().unwrap();

            match (previous, detected) {
                (None, Some(app_id)) => {
                    if self.confirm_detection(app_id, first_poll).await {
                        log::info!("Game started: {}", app_id);
                        *self.current_app_id.lock().unwrap() = Some(app_id);
                        self.hooks.on_game_start(app_id).await;
                    }
                }
                (Some(app_id), None) => {
                    log::info!("Game exited: {}", app_id);
                    *self.current_app_id.lock().unwrap() = None;
                    self.hooks.on_game_exit().await;
                }
                (Some(old), Some(new)) if old != new => {
                    log::info!("Game changed: {} -> {}", old, new);
                    *self.current_app_id.lock().unwrap() = Some(new);
                    self.hooks.on_game_exit().await;
                    self.hooks.on_game_start(new).await;
                }
                _ => {}
            }

            first_poll = false;
            tokio::time::sleep(self.poll_interval).await;
        }

        log::info!("GameStateMonitor polling loop stopped");
    }

    /// A freshly appeared app id must still be there after the debounce
    /// delay. The first poll after start skips the delay so that a game
    /// already running when monitoring begins is picked up immediately.
    async fn confirm_detection(&self, app_id: u32, first_poll: bool) -> bool {
        if first_poll || self.debounce.is_zero() {
            return true;
        }

        tokio::time::sleep(self.debounce).await;

        match self.detect() {
            Some(confirmed) if confirmed == app_id => true,
            other => {
                log::debug!(
                    "Debounce dropped transient detection of {} (now {:?})",
                    app_id,
                    other
                );
                false
            }
        }
    }
}
