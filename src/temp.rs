//! CPU temperature source

use std::fs;
use std::path::{Path, PathBuf};

use log::info;

use crate::errors::{FanControlError, Result};

/// Default kernel thermal zone for the SoC temperature on Raspberry Pi.
const THERMAL_ZONE_PATH: &str = "/sys/class/thermal/thermal_zone0/temp";

/// A source of CPU temperature samples in degrees Celsius.
///
/// The decision engine only ever calls `read_temperature`; everything about
/// where the number comes from stays behind this trait.
pub trait CpuTemperature {
    fn read_temperature(&mut self) -> Result<f32>;
}

/// Reads the SoC temperature from the kernel thermal zone.
pub struct ThermalZoneSensor {
    path: PathBuf,
}

impl ThermalZoneSensor {
    /// Create a sensor over the default thermal zone.
    pub fn new() -> Result<Self> {
        Self::with_path(THERMAL_ZONE_PATH)
    }

    /// Create a sensor over an explicit temperature file.
    pub fn with_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.exists() {
            return Err(FanControlError::Temperature(format!(
                "thermal zone not found: {}",
                path.display()
            )));
        }
        info!("CPU temperature source: {}", path.display());
        Ok(Self { path })
    }

    fn read_file(path: &Path) -> Result<f32> {
        let content = fs::read_to_string(path)?;

        // The kernel reports millidegrees Celsius
        let millidegrees: i32 = content
            .trim()
            .parse()
            .map_err(|_| FanControlError::Temperature(format!("unparsable reading: {:?}", content.trim())))?;

        let celsius = millidegrees as f32 / 1000.0;

        if !(-50.0..=200.0).contains(&celsius) {
            return Err(FanControlError::Temperature(format!(
                "reading out of range: {:.1}°C",
                celsius
            )));
        }

        Ok(celsius)
    }
}

impl CpuTemperature for ThermalZoneSensor {
    fn read_temperature(&mut self) -> Result<f32> {
        Self::read_file(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sensor_over(content: &str) -> (tempfile::TempDir, ThermalZoneSensor) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("temp");
        let mut file = fs::File::create(&path).unwrap();
        write!(file, "{}", content).unwrap();
        let sensor = ThermalZoneSensor::with_path(&path).unwrap();
        (dir, sensor)
    }

    #[test]
    fn parses_millidegrees() {
        let (_dir, mut sensor) = sensor_over("48250\n");
        assert_eq!(sensor.read_temperature().unwrap(), 48.25);
    }

    #[test]
    fn rejects_garbage() {
        let (_dir, mut sensor) = sensor_over("not-a-number\n");
        assert!(sensor.read_temperature().is_err());
    }

    #[test]
    fn rejects_out_of_range() {
        let (_dir, mut sensor) = sensor_over("250000\n");
        assert!(sensor.read_temperature().is_err());
    }

    #[test]
    fn missing_zone_fails_construction() {
        assert!(ThermalZoneSensor::with_path("/nonexistent/thermal/zone").is_err());
    }
}
