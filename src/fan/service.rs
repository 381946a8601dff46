use super::{apply_safety_override, speed_to_pwm, Error, FanCurve, Result, PRESETS};

use serde_derive::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
struct FanConfig {
    active: Option<String>,
    #[serde(default)]
    custom_curves: Vec<FanCurve>,
}

/// Holds the active curve selection and user-defined custom curves.
///
/// The config file is written atomically with mode 0600; if the active
/// custom curve is deleted the service falls back to the stock preset.
pub struct FanControlService {
    config_path: PathBuf,
    pwm_path: Option<PathBuf>,
    config: Mutex<FanConfig>,
}

impl FanControlService {
    pub const FALLBACK_PRESET: &'static str = "stock";

    pub fn new<P: AsRef<Path>>(config_path: P) -> FanControlService {
        let config_path = config_path.as_ref().to_path_buf();
        let config = Self::load_config(&config_path);

        FanControlService {
            config_path,
            pwm_path: None,
            config: Mutex::new(config),
        }
    }

    pub fn with_pwm_path<P: AsRef<Path>>(mut self, pwm_path: P) -> FanControlService {
        self.pwm_path = Some(pwm_path.as_ref().to_path_buf());
        self
    }

    fn load_config(path: &Path) -> FanConfig {
        if !path.is_file() {
            return FanConfig::default();
        }

        match std::fs::read_to_string(path)
            .map_err(Error::from)
            .and_then(|content| serde_json::from_str(&content).map_err(Error::from))
        {
            Ok(config) => config,
            Err(error) => {
                log::warn!("Fan config unreadable, starting fresh: {}", error);
                FanConfig::default()
            }
        }
    }

    fn persist(&self, config: &FanConfig) -> bool {
        let encoded = match serde_json::to_string_pretty(config) {
            Ok(encoded) => encoded,
            Err(error) => {
                log::error!("Failed to encode fan config: {}", error);
                return false;
            }
        };

        if let Some(parent) = self.config_path.parent() {
            if let Err(error) = std::fs::create_dir_all(parent) {
                log::error!("Failed to create fan config directory: {}", error);
                return false;
            }
        }

        let temp_path = self.config_path.with_extension("tmp");

        if let Err(error) = std::fs::write(&temp_path, encoded) {
            log::error!("Failed to write fan config: {}", error);
            return false;
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(error) =
                std::fs::set_permissions(&temp_path, std::fs::Permissions::from_mode(0o600))
            {
                log::warn!("Failed to set fan config permissions: {}", error);
            }
        }

        if let Err(error) = std::fs::rename(&temp_path, &self.config_path) {
            log::error!("Failed to replace fan config: {}", error);
            let _ = std::fs::remove_file(&temp_path);
            return false;
        }

        true
    }

    /// Store or replace a custom curve. Preset names cannot be shadowed.
    pub fn save_custom_curve(&self, curve: FanCurve) -> Result<()> {
        if PRESETS.contains_key(curve.name.as_str()) {
            return Err(Error::ReservedName(curve.name));
        }

        let mut config = self.config.lock().unwrap();
        config.custom_curves.retain(|c| c.name != curve.name);
        config.custom_curves.push(curve);
        self.persist(&config);
        Ok(())
    }

    /// Delete a custom curve by name. If it was active, the selection falls
    /// back to the stock preset.
    pub fn delete_custom_curve(&self, name: &str) -> Result<()> {
        let mut config = self.config.lock().unwrap();
        let before = config.custom_curves.len();
        config.custom_curves.retain(|c| c.name != name);

        if config.custom_curves.len() == before {
            return Err(Error::UnknownCurve(name.to_string()));
        }

        if config.active.as_deref() == Some(name) {
            log::info!(
                "Active fan curve {:?} deleted, falling back to {}",
                name,
                Self::FALLBACK_PRESET
            );
            config.active = Some(Self::FALLBACK_PRESET.to_string());
        }

        self.persist(&config);
        Ok(())
    }

    pub fn set_active(&self, name: &str) -> Result<()> {
        let mut config = self.config.lock().unwrap();

        let known = PRESETS.contains_key(name)
            || config.custom_curves.iter().any(|c| c.name == name);

        if !known {
            return Err(Error::UnknownCurve(name.to_string()));
        }

        config.active = Some(name.to_string());
        self.persist(&config);
        Ok(())
    }

    /// The curve currently driving the fan; stock when nothing is selected
    /// or the selection no longer resolves.
    pub fn active_curve(&self) -> FanCurve {
        let config = self.config.lock().unwrap();

        let name = config
            .active
            .clone()
            .unwrap_or_else(|| Self::FALLBACK_PRESET.to_string());

        if let Some(preset) = PRESETS.get(name.as_str()) {
            return preset.clone();
        }

        config
            .custom_curves
            .iter()
            .find(|c| c.name == name)
            .cloned()
            .unwrap_or_else(|| PRESETS[Self::FALLBACK_PRESET].clone())
    }

    pub fn custom_curves(&self) -> Vec<FanCurve> {
        self.config.lock().unwrap().custom_curves.clone()
    }

    /// Evaluate the active curve at `temp`, apply the thermal override, and
    /// return the final speed percentage.
    pub fn target_speed(&self, temp: f64) -> i32 {
        let calculated = self.active_curve().evaluate(temp);
        apply_safety_override(temp, calculated)
    }

    /// Compute the final speed and write the PWM value to the hardware
    /// control file. Returns the written speed, or the speed alone when no
    /// PWM path is configured.
    pub fn apply(&self, temp: f64) -> Result<i32> {
        let speed = self.target_speed(temp);

        if let Some(pwm_path) = &self.pwm_path {
            let pwm = speed_to_pwm(speed);
            std::fs::write(pwm_path, pwm.to_string())?;
            log::debug!("Fan speed {}% (pwm {}) written at {:.1}°C", speed, pwm, temp);
        }

        Ok(speed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fan::FanPoint;

    fn custom(name: &str) -> FanCurve {
        FanCurve::new(
            name,
            vec![
                FanPoint { temp: 40, speed: 10 },
                FanPoint { temp: 60, speed: 50 },
                FanPoint { temp: 80, speed: 90 },
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_defaults_to_stock() {
        let dir = tempfile::tempdir().unwrap();
        let service = FanControlService::new(dir.path().join("fan.json"));

        assert_eq!(service.active_curve().name, "stock");
    }

    #[test]
    fn test_custom_curve_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fan.json");

        let service = FanControlService::new(&path);
        service.save_custom_curve(custom("quiet-gaming")).unwrap();
        service.set_active("quiet-gaming").unwrap();

        // Selection and curve survive a reload.
        let reloaded = FanControlService::new(&path);
        assert_eq!(reloaded.active_curve().name, "quiet-gaming");
        assert_eq!(reloaded.custom_curves().len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_config_file_mode_is_0600() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fan.json");

        let service = FanControlService::new(&path);
        service.save_custom_curve(custom("modes")).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_deleting_active_curve_falls_back_to_stock() {
        let dir = tempfile::tempdir().unwrap();
        let service = FanControlService::new(dir.path().join("fan.json"));

        service.save_custom_curve(custom("doomed")).unwrap();
        service.set_active("doomed").unwrap();
        service.delete_custom_curve("doomed").unwrap();

        assert_eq!(service.active_curve().name, "stock");
    }

    #[test]
    fn test_unknown_selection_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let service = FanControlService::new(dir.path().join("fan.json"));

        assert!(matches!(
            service.set_active("missing"),
            Err(Error::UnknownCurve(_))
        ));
    }

    #[test]
    fn test_target_speed_applies_thermal_override() {
        let dir = tempfile::tempdir().unwrap();
        let service = FanControlService::new(dir.path().join("fan.json"));

        // Stock at 96°C would be 100 anyway; silent at 92°C would not.
        service.save_custom_curve(custom("low")).unwrap();
        service.set_active("low").unwrap();

        assert_eq!(service.target_speed(96.0), 100);
        assert!(service.target_speed(92.0) >= 80);
    }

    #[test]
    fn test_apply_writes_pwm() {
        let dir = tempfile::tempdir().unwrap();
        let pwm_path = dir.path().join("pwm1");
        let service =
            FanControlService::new(dir.path().join("fan.json")).with_pwm_path(&pwm_path);

        let speed = service.apply(96.0).unwrap();

        assert_eq!(speed, 100);
        assert_eq!(std::fs::read_to_string(&pwm_path).unwrap(), "255");
    }
}
