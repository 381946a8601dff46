pub mod service;

use lazy_static::lazy_static;
use serde_derive::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("fan point temperature {0} outside [0, 120]")]
    InvalidTemperature(i32),
    #[error("fan point speed {0} outside [0, 100]")]
    InvalidSpeed(i32),
    #[error("fan curve needs 3 to 10 points, got {0}")]
    InvalidCurveSize(usize),
    #[error("fan curve temperature {0} is not unique")]
    DuplicateTemperature(i32),
    #[error("no fan curve named {0:?}")]
    UnknownCurve(String),
    #[error("{0:?} is a reserved preset name")]
    ReservedName(String),
    #[error("fan config I/O error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("fan config decoding error: {0}")]
    ConfigDecodingError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Temperature above which the fan is forced to full speed.
pub const CRITICAL_TEMP_C: f64 = 95.0;
/// Temperature above which a minimum of 80% is enforced.
pub const ELEVATED_TEMP_C: f64 = 90.0;
const ELEVATED_MIN_SPEED: i32 = 80;

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct FanPoint {
    pub temp: i32,
    pub speed: i32,
}

impl FanPoint {
    pub fn new(temp: i32, speed: i32) -> Result<FanPoint> {
        if !(0..=120).contains(&temp) {
            return Err(Error::InvalidTemperature(temp));
        }
        if !(0..=100).contains(&speed) {
            return Err(Error::InvalidSpeed(speed));
        }
        Ok(FanPoint { temp, speed })
    }
}

/// A named fan curve: 3–10 points with strictly increasing temperatures.
/// Points are sorted on construction, so insertion order never matters.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct FanCurve {
    pub name: String,
    pub points: Vec<FanPoint>,
    #[serde(default)]
    pub is_preset: bool,
}

impl FanCurve {
    pub fn new(name: &str, mut points: Vec<FanPoint>) -> Result<FanCurve> {
        if !(3..=10).contains(&points.len()) {
            return Err(Error::InvalidCurveSize(points.len()));
        }

        for point in &points {
            FanPoint::new(point.temp, point.speed)?;
        }

        points.sort_by_key(|p| p.temp);

        for pair in points.windows(2) {
            if pair[0].temp == pair[1].temp {
                return Err(Error::DuplicateTemperature(pair[0].temp));
            }
        }

        Ok(FanCurve {
            name: name.to_string(),
            points,
            is_preset: false,
        })
    }

    fn preset(name: &str, raw: &[(i32, i32)]) -> FanCurve {
        let points = raw
            .iter()
            .map(|&(temp, speed)| FanPoint { temp, speed })
            .collect();
        let mut curve = FanCurve::new(name, points).expect("invalid preset definition");
        curve.is_preset = true;
        curve
    }

    /// Linear interpolation over the curve, clamped to the end points.
    /// The result is rounded to the nearest integer and always in [0, 100].
    pub fn evaluate(&self, temp: f64) -> i32 {
        let first = &self.points[0];
        let last = &self.points[self.points.len() - 1];

        let speed = if temp <= first.temp as f64 {
            first.speed as f64
        } else if temp >= last.temp as f64 {
            last.speed as f64
        } else {
            let mut result = last.speed as f64;
            for pair in self.points.windows(2) {
                let (p1, p2) = (&pair[0], &pair[1]);
                if temp < p2.temp as f64 {
                    let ratio = (temp - p1.temp as f64) / ((p2.temp - p1.temp) as f64);
                    result = p1.speed as f64 + (p2.speed - p1.speed) as f64 * ratio;
                    break;
                }
            }
            result
        };

        (speed.round() as i32).max(0).min(100)
    }
}

/// Thermal safety floor, applied after curve evaluation and regardless of
/// which curve produced the value.
pub fn apply_safety_override(temp: f64, calculated_speed: i32) -> i32 {
    if temp >= CRITICAL_TEMP_C {
        100
    } else if temp >= ELEVATED_TEMP_C {
        calculated_speed.max(ELEVATED_MIN_SPEED)
    } else {
        calculated_speed
    }
}

/// Convert a speed percentage to the 8-bit PWM value the hwmon interface
/// expects.
pub fn speed_to_pwm(speed: i32) -> u8 {
    let clamped = speed.max(0).min(100);
    ((clamped as f64) * 255.0 / 100.0).round() as u8
}

lazy_static! {
    /// Built-in immutable curves.
    pub static ref PRESETS: HashMap<&'static str, FanCurve> = {
        let mut presets = HashMap::new();
        presets.insert(
            "stock",
            FanCurve::preset("stock", &[(40, 0), (60, 40), (75, 70), (85, 100)]),
        );
        presets.insert(
            "silent",
            FanCurve::preset("silent", &[(50, 0), (70, 30), (85, 60), (95, 100)]),
        );
        presets.insert(
            "turbo",
            FanCurve::preset("turbo", &[(30, 20), (50, 60), (65, 80), (80, 100)]),
        );
        presets
    };
}
