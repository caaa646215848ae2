//! The fan level ladder: discrete cooling rungs with overlapping hysteresis bands

use serde::{Deserialize, Serialize};
use zvariant::Type;

use crate::errors::{FanControlError, Result};

/// One rung on the cooling ladder.
///
/// `low` and `high` bound the hysteresis band: the engine escalates past this
/// level only when the temperature exceeds `high`, and de-escalates only when
/// it drops below `low`. Adjacent bands overlap, so the exit threshold of a
/// level is never the entry threshold of its neighbor.
#[derive(Debug, Clone, PartialEq)]
pub struct FanLevel {
    pub name: &'static str,
    pub low: f32,
    pub high: f32,
    pub percent: u8,
}

/// The fixed four-level ladder used by the engine.
pub const FAN_LEVELS: [FanLevel; 4] = [
    FanLevel {
        name: "OFF",
        low: -200.0,
        high: 55.0,
        percent: 0,
    },
    FanLevel {
        name: "LOW",
        low: 45.0,
        high: 65.0,
        percent: 40,
    },
    FanLevel {
        name: "MEDIUM",
        low: 55.0,
        high: 75.0,
        percent: 80,
    },
    FanLevel {
        name: "HIGH",
        low: 65.0,
        high: 100.0,
        percent: 100,
    },
];

/// Named presets for the relay fan activation rung, most to least aggressive.
/// The preset index is the ladder rung at or above which the relay switches on.
pub const GPIO_FAN_MODES: [&str; 5] = ["Always On", "Performance", "Cool", "Balanced", "Quiet"];

/// Validate a ladder before handing it to the engine.
///
/// Checks that percent is non-decreasing, that each band is well formed and
/// that adjacent bands overlap (a zero-width hysteresis gap would reintroduce
/// threshold chatter).
pub fn validate(levels: &[FanLevel]) -> Result<()> {
    if levels.is_empty() {
        return Err(FanControlError::Config("fan level ladder is empty".to_string()));
    }

    for level in levels {
        if level.low >= level.high {
            return Err(FanControlError::Config(format!(
                "fan level {}: low {} must be below high {}",
                level.name, level.low, level.high
            )));
        }
        if level.percent > 100 {
            return Err(FanControlError::Config(format!(
                "fan level {}: percent {} out of range",
                level.name, level.percent
            )));
        }
    }

    for pair in levels.windows(2) {
        if pair[1].percent < pair[0].percent {
            return Err(FanControlError::Config(format!(
                "fan level {}: percent decreases from {}",
                pair[1].name, pair[0].name
            )));
        }
        if pair[0].high <= pair[1].low {
            return Err(FanControlError::Config(format!(
                "fan levels {} and {}: bands do not overlap",
                pair[0].name, pair[1].name
            )));
        }
    }

    Ok(())
}

/// Ladder rung description as exposed over DBus.
#[derive(Debug, Clone, Serialize, Deserialize, Type)]
pub struct LevelInfo {
    pub name: String,
    pub low: i16,
    pub high: i16,
    pub percent: u16,
}

impl From<&FanLevel> for LevelInfo {
    fn from(level: &FanLevel) -> Self {
        Self {
            name: level.name.to_string(),
            low: level.low as i16,
            high: level.high as i16,
            percent: level.percent as u16,
        }
    }
}
