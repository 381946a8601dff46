use serde_derive::{Deserialize, Serialize};
use std::fmt;

/// Steam Deck hardware family, or the conservative fallback when the DMI
/// string is unrecognized.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Variant {
    Lcd,
    Oled,
    Unknown,
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Variant::Lcd => write!(f, "LCD"),
            Variant::Oled => write!(f, "OLED"),
            Variant::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Per-variant undervolt limits, all in millivolts (negative).
///
/// `safe_limit` is the user-visible floor; `absolute_limit` is the historical
/// hard floor; `expert_limit` is the deeper floor unlocked by expert mode.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct VariantLimits {
    pub safe_limit: i32,
    pub absolute_limit: i32,
    pub expert_limit: i32,
    pub default_step: i32,
}

pub fn limits(variant: Variant) -> VariantLimits {
    match variant {
        Variant::Lcd => VariantLimits {
            safe_limit: -30,
            absolute_limit: -40,
            expert_limit: -50,
            default_step: 5,
        },
        Variant::Oled => VariantLimits {
            safe_limit: -35,
            absolute_limit: -50,
            expert_limit: -60,
            default_step: 5,
        },
        Variant::Unknown => VariantLimits {
            safe_limit: -25,
            absolute_limit: -30,
            expert_limit: -30,
            default_step: 5,
        },
    }
}

pub fn safe_limit(variant: Variant) -> i32 {
    limits(variant).safe_limit
}

pub fn absolute_limit(variant: Variant) -> i32 {
    limits(variant).absolute_limit
}

pub fn expert_limit(variant: Variant) -> i32 {
    limits(variant).expert_limit
}

pub fn default_step(variant: Variant) -> i32 {
    limits(variant).default_step
}
