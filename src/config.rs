//! Daemon configuration with fail-soft partial updates

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{FanControlError, Result};
use crate::levels::GPIO_FAN_MODES;

/// Behavior of the relay fan indicator LED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedMode {
    /// Mirror the relay state
    Follow,
    On,
    Off,
}

impl FromStr for LedMode {
    type Err = FanControlError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "follow" => Ok(LedMode::Follow),
            "on" => Ok(LedMode::On),
            "off" => Ok(LedMode::Off),
            other => Err(FanControlError::Config(format!(
                "invalid led mode: {:?} (expected follow, on or off)",
                other
            ))),
        }
    }
}

/// Display unit for logged temperatures. The ladder itself is always Celsius.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TemperatureUnit {
    C,
    F,
}

impl TemperatureUnit {
    pub fn display(&self, celsius: f32) -> String {
        match self {
            TemperatureUnit::C => format!("{:.1} °C", celsius),
            TemperatureUnit::F => format!("{:.1} °F", celsius * 9.0 / 5.0 + 32.0),
        }
    }
}

/// Runtime configuration of the fan engine and its backends.
///
/// Every field can be updated while the daemon runs; see [`FanConfig::apply_update`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FanConfig {
    /// Relay fan output line
    pub gpio_fan_pin: u8,
    /// Indicator LED output line
    pub gpio_fan_led_pin: u8,
    /// Indicator LED behavior
    pub gpio_fan_led: LedMode,
    /// Ladder rung at or above which the relay fan switches on (0-4)
    pub gpio_fan_mode: u8,
    /// Unit used when logging temperatures
    pub temperature_unit: TemperatureUnit,
}

impl Default for FanConfig {
    fn default() -> Self {
        Self {
            gpio_fan_pin: 6,
            gpio_fan_led_pin: 5,
            gpio_fan_led: LedMode::Follow,
            gpio_fan_mode: 1,
            temperature_unit: TemperatureUnit::C,
        }
    }
}

impl FanConfig {
    /// Apply a partial update from a JSON object, one key at a time.
    ///
    /// A key with an invalid type or value is logged and skipped; the prior
    /// value stays in effect and the remaining keys are still applied. Returns
    /// the names of the keys that actually changed.
    pub fn apply_update(&mut self, updates: &serde_json::Map<String, Value>) -> Vec<&'static str> {
        let mut changed = Vec::new();

        for (key, value) in updates {
            match key.as_str() {
                "gpio_fan_pin" => {
                    if let Some(pin) = as_pin(value) {
                        debug!("Update gpio_fan_pin to {}", pin);
                        if self.gpio_fan_pin != pin {
                            self.gpio_fan_pin = pin;
                            changed.push("gpio_fan_pin");
                        }
                    } else {
                        warn!("Rejecting gpio_fan_pin update, invalid value: {}", value);
                    }
                }
                "gpio_fan_led_pin" => {
                    if let Some(pin) = as_pin(value) {
                        debug!("Update gpio_fan_led_pin to {}", pin);
                        if self.gpio_fan_led_pin != pin {
                            self.gpio_fan_led_pin = pin;
                            changed.push("gpio_fan_led_pin");
                        }
                    } else {
                        warn!("Rejecting gpio_fan_led_pin update, invalid value: {}", value);
                    }
                }
                "gpio_fan_led" => match value.as_str().map(LedMode::from_str) {
                    Some(Ok(mode)) => {
                        debug!("Update gpio_fan_led to {:?}", mode);
                        if self.gpio_fan_led != mode {
                            self.gpio_fan_led = mode;
                            changed.push("gpio_fan_led");
                        }
                    }
                    _ => warn!("Rejecting gpio_fan_led update, invalid value: {}", value),
                },
                "gpio_fan_mode" => {
                    match value.as_u64() {
                        Some(mode) if (mode as usize) < GPIO_FAN_MODES.len() => {
                            let mode = mode as u8;
                            debug!(
                                "Update gpio_fan_mode to {} ({})",
                                mode, GPIO_FAN_MODES[mode as usize]
                            );
                            if self.gpio_fan_mode != mode {
                                self.gpio_fan_mode = mode;
                                changed.push("gpio_fan_mode");
                            }
                        }
                        _ => warn!("Rejecting gpio_fan_mode update, invalid value: {}", value),
                    }
                }
                "temperature_unit" => match value.as_str() {
                    Some("C") => {
                        if self.temperature_unit != TemperatureUnit::C {
                            self.temperature_unit = TemperatureUnit::C;
                            changed.push("temperature_unit");
                        }
                    }
                    Some("F") => {
                        if self.temperature_unit != TemperatureUnit::F {
                            self.temperature_unit = TemperatureUnit::F;
                            changed.push("temperature_unit");
                        }
                    }
                    _ => warn!("Rejecting temperature_unit update, invalid value: {}", value),
                },
                other => debug!("Ignoring unknown config key: {}", other),
            }
        }

        changed
    }

    /// Default config file location.
    pub fn config_path() -> PathBuf {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        PathBuf::from(home).join(".pi-fan-control").join("config.json")
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        let config: FanConfig = serde_json::from_str(&json)?;
        Ok(config)
    }

    /// Write the config as JSON, via a temp file and atomic rename.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let temp_path = path.with_extension("tmp");
        let json = serde_json::to_string_pretty(self)?;
        fs::write(&temp_path, json)?;

        fs::rename(&temp_path, path).map_err(|e| {
            let _ = fs::remove_file(&temp_path);
            FanControlError::Io(e)
        })?;

        info!("Configuration saved to: {}", path.display());
        Ok(())
    }

    /// Load the config at `path`, or persist and return defaults when absent.
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match Self::load_from_file(path) {
                Ok(config) => return config,
                Err(e) => warn!("Failed to load config, using defaults: {}", e),
            }
        }
        let config = Self::default();
        if let Err(e) = config.save_to_file(path) {
            warn!("Failed to save default config: {}", e);
        }
        config
    }
}

fn as_pin(value: &Value) -> Option<u8> {
    value.as_u64().and_then(|v| u8::try_from(v).ok())
}
