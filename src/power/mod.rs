use crate::events::EventSink;

use async_trait::async_trait;
use displaydoc::Display;
use lazy_static::lazy_static;
use regex::Regex;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

pub const CORE_COUNT: usize = 4;

lazy_static! {
    static ref STDERR_ERROR_PATTERN: Regex = Regex::new(r"(?i)error|fail").unwrap();
}

#[derive(Error, Display)]
pub enum Error {
    /// expected exactly 4 core values, got {0}
    WrongValueCount(usize),
    /// ryzenadj binary not found at {0:?}
    BinaryMissing(PathBuf),
    /// ryzenadj timed out for core {0}
    Timeout(usize),
    /// ryzenadj failed for core {0}: {1}
    CommandFailed(usize, String),
    /// failed to invoke ryzenadj: {0}
    InvocationError(#[source] std::io::Error),
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Capability seam: "apply these per-core offsets to the hardware".
///
/// SafetyPolicy, the watchdog, and the binning engine only ever see this
/// trait, so tests can substitute a recording fake for the real tool.
#[async_trait]
pub trait ApplyOffsets: Send + Sync {
    async fn apply(&self, offsets: &[i32]) -> Result<()>;

    async fn disable(&self) -> Result<()> {
        self.apply(&[0; CORE_COUNT]).await
    }
}

/// Encode a (core, offset) pair into the `--set-coper` opcode.
///
/// The layout is `(core << 20) | (offset & 0xFFFFF)`: the low 20 bits carry
/// the offset in two's complement, the next nibble selects the core.
pub fn calculate_hex(core: usize, value: i32) -> String {
    let combined = ((core as u32) << 20) | ((value as u32) & 0xFFFFF);
    format!("0X{:X}", combined)
}

/// Wrapper for the external `ryzenadj` CLI.
///
/// Applies undervolt offsets one core at a time through the privilege
/// elevator, screening stderr for error text the tool prints without a
/// non-zero exit status.
pub struct PowerAdjustInvoker {
    elevator: String,
    binary_path: PathBuf,
    working_dir: Option<PathBuf>,
    events: Arc<dyn EventSink>,
    last_commands: Mutex<Vec<String>>,
    last_error: Mutex<Option<String>>,
}

impl PowerAdjustInvoker {
    const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);
    const DEFAULT_ELEVATOR: &'static str = "sudo";

    pub fn new<P: AsRef<Path>>(binary_path: P, events: Arc<dyn EventSink>) -> PowerAdjustInvoker {
        PowerAdjustInvoker {
            elevator: Self::DEFAULT_ELEVATOR.to_string(),
            binary_path: binary_path.as_ref().to_path_buf(),
            working_dir: None,
            events,
            last_commands: Mutex::new(vec![]),
            last_error: Mutex::new(None),
        }
    }

    pub fn with_elevator(mut self, elevator: &str) -> PowerAdjustInvoker {
        self.elevator = elevator.to_string();
        self
    }

    pub fn with_working_dir<P: AsRef<Path>>(mut self, dir: P) -> PowerAdjustInvoker {
        self.working_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn binary_path(&self) -> &Path {
        &self.binary_path
    }

    /// Commands issued by the most recent `apply` call.
    pub fn last_commands(&self) -> Vec<String> {
        self.last_commands.lock().unwrap().clone()
    }

    /// Failure reason of the most recent `apply` call, if any.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().unwrap().clone()
    }

    async fn record_failure(&self, error: Error) -> Error {
        let message = error.to_string();
        log::error!("Ryzenadj error: {}", message);
        *self.last_error.lock().unwrap() = Some(message);
        self.events.emit_status("error").await;
        error
    }

    async fn invoke_core(&self, core: usize, value: i32) -> Result<()> {
        let hex = calculate_hex(core, value);
        let coper_arg = format!("--set-coper={}", hex);

        self.last_commands.lock().unwrap().push(format!(
            "{} {} {}",
            self.elevator,
            self.binary_path.display(),
            coper_arg
        ));

        log::debug!(
            "Applying undervolt to core {}: {} (hex: {})",
            core,
            value,
            hex
        );

        let mut command = Command::new(&self.elevator);
        command
            .arg(&self.binary_path)
            .arg(&coper_arg)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let output = match tokio::time::timeout(Self::COMMAND_TIMEOUT, command.output()).await {
            Err(_) => return Err(Error::Timeout(core)),
            Ok(Err(error)) if error.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::BinaryMissing(self.binary_path.clone()))
            }
            Ok(Err(error)) => return Err(Error::InvocationError(error)),
            Ok(Ok(output)) => output,
        };

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        if !output.status.success() {
            let detail = if stderr.is_empty() {
                format!("ryzenadj returned {}", output.status)
            } else {
                stderr
            };
            return Err(Error::CommandFailed(core, detail));
        }

        if !stderr.is_empty() {
            log::warn!("ryzenadj stderr for core {}: {}", core, stderr);
            // The tool reports some hard failures with exit 0.
            if STDERR_ERROR_PATTERN.is_match(&stderr) {
                return Err(Error::CommandFailed(core, stderr));
            }
        }

        Ok(())
    }
}

#[async_trait]
impl ApplyOffsets for PowerAdjustInvoker {
    async fn apply(&self, offsets: &[i32]) -> Result<()> {
        if offsets.len() != CORE_COUNT {
            return Err(self
                .record_failure(Error::WrongValueCount(offsets.len()))
                .await);
        }

        self.last_commands.lock().unwrap().clear();
        *self.last_error.lock().unwrap() = None;

        for (core, &value) in offsets.iter().enumerate() {
            if let Err(error) = self.invoke_core(core, value).await {
                return Err(self.record_failure(error).await);
            }
        }

        log::info!("Successfully applied undervolt values: {:?}", offsets);
        Ok(())
    }

    async fn disable(&self) -> Result<()> {
        log::info!("Disabling undervolt (resetting all cores to 0)");
        self.apply(&[0; CORE_COUNT]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::LogSink;

    #[test]
    fn test_calculate_hex_examples() {
        assert_eq!(calculate_hex(0, 0), "0X0");
        assert_eq!(calculate_hex(3, 0), "0X300000");
        assert_eq!(calculate_hex(0, -1), "0XFFFFF");
        assert_eq!(calculate_hex(0, -30), "0XFFFE2");
        assert_eq!(calculate_hex(1, -30), "0X1FFFE2");
        assert_eq!(calculate_hex(2, -30), "0X2FFFE2");
        assert_eq!(calculate_hex(3, -30), "0X3FFFE2");
    }

    #[test]
    fn test_calculate_hex_full_offset_range() {
        for core in 0..CORE_COUNT {
            for value in -60..=0 {
                let expected = format!("0X{:X}", ((core as u32) << 20) | ((value as u32) & 0xFFFFF));
                assert_eq!(calculate_hex(core, value), expected);
            }
        }
    }

    fn invoker(binary: &str) -> PowerAdjustInvoker {
        // `env` stands in for the privilege elevator so tests run unprivileged.
        PowerAdjustInvoker::new(binary, Arc::new(LogSink)).with_elevator("env")
    }

    #[tokio::test]
    async fn test_apply_rejects_wrong_length() {
        let sink = Arc::new(crate::events::testing::RecordingSink::default());
        let invoker = PowerAdjustInvoker::new("true", sink.clone()).with_elevator("env");

        let result = invoker.apply(&[-10, -10, -10]).await;

        assert!(matches!(result, Err(Error::WrongValueCount(3))));
        assert!(invoker.last_error().is_some());
        // Failures surface to the frontend as an error status.
        assert_eq!(sink.statuses.lock().unwrap().clone(), vec!["error"]);
    }

    #[tokio::test]
    async fn test_apply_invokes_once_per_core_in_order() {
        let invoker = invoker("true");

        invoker.apply(&[-30, -30, -30, -30]).await.unwrap();

        let commands = invoker.last_commands();
        assert_eq!(commands.len(), 4);
        assert!(commands[0].ends_with("--set-coper=0XFFFE2"));
        assert!(commands[1].ends_with("--set-coper=0X1FFFE2"));
        assert!(commands[2].ends_with("--set-coper=0X2FFFE2"));
        assert!(commands[3].ends_with("--set-coper=0X3FFFE2"));
        assert!(invoker.last_error().is_none());
    }

    #[tokio::test]
    async fn test_apply_stops_at_first_failure() {
        let invoker = invoker("false");

        let result = invoker.apply(&[0, 0, 0, 0]).await;

        assert!(matches!(result, Err(Error::CommandFailed(0, _))));
        assert_eq!(invoker.last_commands().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_binary_is_reported() {
        let invoker = invoker("/nonexistent/ryzenadj-binary");

        let result = invoker.apply(&[0, 0, 0, 0]).await;

        // `env` exits 127 with an error message on stderr.
        assert!(result.is_err());
        assert!(invoker.last_error().is_some());
    }

    #[tokio::test]
    async fn test_disable_applies_zeroes() {
        let invoker = invoker("true");

        invoker.disable().await.unwrap();

        let commands = invoker.last_commands();
        assert_eq!(commands.len(), 4);
        assert!(commands[0].ends_with("--set-coper=0X0"));
        assert!(commands[3].ends_with("--set-coper=0X300000"));
    }
}
