//! Relay fan on a GPIO line, with an optional indicator LED

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, error, warn};

use crate::backends::{FanBackend, RelayControl};
use crate::config::LedMode;
use crate::errors::{FanControlError, Result};

const GPIO_SYSFS_ROOT: &str = "/sys/class/gpio";

/// One exported sysfs GPIO output line.
struct GpioLine {
    dir: PathBuf,
    pin: u8,
}

impl GpioLine {
    fn export(base: &Path, pin: u8) -> Result<Self> {
        let dir = base.join(format!("gpio{}", pin));
        if !dir.exists() {
            fs::write(base.join("export"), pin.to_string()).map_err(|e| FanControlError::Gpio {
                pin,
                message: format!("export failed: {}", e),
            })?;
        }
        if !dir.exists() {
            return Err(FanControlError::Gpio {
                pin,
                message: "line did not appear after export".to_string(),
            });
        }
        fs::write(dir.join("direction"), "out").map_err(|e| FanControlError::Gpio {
            pin,
            message: format!("direction failed: {}", e),
        })?;
        Ok(Self { dir, pin })
    }

    fn set(&self, high: bool) -> Result<()> {
        fs::write(self.dir.join("value"), if high { "1" } else { "0" }).map_err(|e| {
            FanControlError::Gpio {
                pin: self.pin,
                message: format!("value write failed: {}", e),
            }
        })
    }

    fn unexport(&self, base: &Path) {
        if let Err(e) = fs::write(base.join("unexport"), self.pin.to_string()) {
            debug!("GPIO {} unexport failed: {}", self.pin, e);
        }
    }
}

/// Binary relay fan. The engine switches it by comparing the current ladder
/// rung against the configured activation rung, not by percent.
pub struct GpioFan {
    base: PathBuf,
    fan: Option<GpioLine>,
    led: Option<GpioLine>,
    led_follow: bool,
    last_applied: Option<bool>,
    ready: bool,
}

impl GpioFan {
    /// Export the relay line (and the LED line when given). A failure leaves
    /// the backend permanently not-ready.
    pub fn new(pin: u8, led_pin: Option<u8>) -> Self {
        Self::with_base(GPIO_SYSFS_ROOT, pin, led_pin)
    }

    pub fn with_base(base: impl Into<PathBuf>, pin: u8, led_pin: Option<u8>) -> Self {
        let base = base.into();
        let mut backend = Self {
            base,
            fan: None,
            led: None,
            led_follow: false,
            last_applied: None,
            ready: false,
        };

        match GpioLine::export(&backend.base, pin) {
            Ok(line) => {
                backend.fan = Some(line);
                backend.ready = true;
            }
            Err(e) => {
                error!("GPIO fan init error: {}", e);
                return backend;
            }
        }

        if let Some(led_pin) = led_pin {
            match GpioLine::export(&backend.base, led_pin) {
                Ok(line) => {
                    let _ = line.set(false);
                    backend.led = Some(line);
                }
                Err(e) => {
                    error!("GPIO fan LED init error: {}", e);
                    backend.ready = false;
                }
            }
        }

        backend
    }
}

impl FanBackend for GpioFan {
    fn name(&self) -> &'static str {
        "gpio_fan"
    }

    fn is_ready(&self) -> bool {
        self.ready
    }

    fn off(&mut self) {
        self.set(false);
    }

    fn close(&mut self) {
        if !self.ready {
            return;
        }
        self.off();
        self.ready = false;
        if let Some(line) = self.fan.take() {
            line.unexport(&self.base);
        }
        if let Some(line) = self.led.take() {
            let _ = line.set(false);
            line.unexport(&self.base);
        }
        debug!("GPIO fan closed");
    }
}

impl RelayControl for GpioFan {
    fn set(&mut self, on: bool) -> Option<bool> {
        if !self.check_ready() {
            return None;
        }
        if self.last_applied == Some(on) {
            return None;
        }

        let line = self.fan.as_ref()?;
        if let Err(e) = line.set(on) {
            error!("GPIO fan write error: {}", e);
            return None;
        }
        if self.led_follow {
            if let Some(led) = &self.led {
                if let Err(e) = led.set(on) {
                    error!("GPIO fan LED write error: {}", e);
                }
            }
        }
        self.last_applied = Some(on);
        Some(on)
    }

    fn set_led(&mut self, mode: LedMode) {
        if !self.check_ready() {
            return;
        }
        debug!("Set fan LED to {:?}", mode);
        match mode {
            LedMode::Follow => {
                self.led_follow = true;
                // Catch the LED up with the relay state
                if let (Some(led), Some(on)) = (&self.led, self.last_applied) {
                    let _ = led.set(on);
                }
            }
            LedMode::On | LedMode::Off => {
                self.led_follow = false;
                if let Some(led) = &self.led {
                    if let Err(e) = led.set(mode == LedMode::On) {
                        error!("GPIO fan LED write error: {}", e);
                    }
                } else {
                    warn!("No fan LED line configured");
                }
            }
        }
    }

    fn change_pin(&mut self, pin: u8) {
        if let Some(line) = self.fan.take() {
            let _ = line.set(false);
            line.unexport(&self.base);
        }
        match GpioLine::export(&self.base, pin) {
            Ok(line) => {
                self.fan = Some(line);
                self.last_applied = None;
                self.ready = true;
            }
            Err(e) => {
                error!("Change pin error: {}", e);
                self.ready = false;
            }
        }
    }

    fn change_led_pin(&mut self, pin: u8) {
        if let Some(line) = self.led.take() {
            let _ = line.set(false);
            line.unexport(&self.base);
        }
        match GpioLine::export(&self.base, pin) {
            Ok(line) => {
                let _ = line.set(false);
                self.led = Some(line);
            }
            Err(e) => {
                error!("Change led pin error: {}", e);
                self.ready = false;
            }
        }
    }
}
