//! Fan hardware backends
//!
//! Three heterogeneous actuators hide behind a small set of traits: a binary
//! GPIO relay, the OS duty-cycle cooling device, and a microcontroller fan
//! driven over an I2C register protocol. A backend that fails to construct
//! stays permanently not-ready; every method on a not-ready backend is a
//! logged no-op and never an error.

pub mod gpio;
pub mod mcu;
pub mod pwm;

pub use gpio::GpioFan;
pub use mcu::McuFan;
pub use pwm::PwmFan;

use log::{debug, warn};

use crate::config::LedMode;

/// Common contract of every fan backend.
pub trait FanBackend {
    fn name(&self) -> &'static str;

    /// False after a construction failure or close; there is no retry.
    fn is_ready(&self) -> bool;

    /// Drive the fan to its off value.
    fn off(&mut self);

    /// Off, then release the underlying resource. Idempotent.
    fn close(&mut self);

    /// Gate for every actuation method: warn once per call when not ready.
    fn check_ready(&self) -> bool {
        if !self.is_ready() {
            warn!("{} is not ready", self.name());
            return false;
        }
        true
    }
}

/// The relay variant: binary on/off, switched by the ladder rung rather than
/// by percent, with an optional indicator LED.
pub trait RelayControl: FanBackend {
    /// Returns the applied state, or None when the write was skipped.
    fn set(&mut self, on: bool) -> Option<bool>;

    fn set_led(&mut self, mode: LedMode);

    /// Re-init the relay output on another line.
    fn change_pin(&mut self, pin: u8);

    /// Re-init the indicator LED on another line.
    fn change_led_pin(&mut self, pin: u8);
}

/// The duty-cycle variant: a small fixed ladder of device states owned either
/// by the platform's thermal governor or by us.
pub trait DutyCycleControl: FanBackend {
    /// True when the platform governor drives the device and the engine
    /// should defer to its state instead of computing one.
    fn is_supported(&self) -> bool;

    /// Current discrete device state (0-3).
    fn state(&mut self) -> u8;

    /// Returns the applied state, or None when the write was skipped.
    fn set_state(&mut self, state: u8) -> Option<u8>;

    /// Observed fan speed in RPM, when the tachometer is readable.
    fn speed_rpm(&mut self) -> Option<u32>;
}

/// The microcontroller variant: 0-100 percent over a register protocol.
pub trait PowerControl: FanBackend {
    /// Returns the applied percent, or None when the write was skipped.
    fn set_power(&mut self, percent: u8) -> Option<u8>;
}

/// The three backend variants, resolved from configured fan names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Relay,
    DutyCycle,
    Microcontroller,
}

impl BackendKind {
    /// Resolve a configured fan name, accepting legacy aliases.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "gpio_fan_state" => Some(BackendKind::Relay),
            "pwm_fan_speed" => Some(BackendKind::DutyCycle),
            "spc_fan_power" => Some(BackendKind::Microcontroller),
            // Deprecated aliases kept for existing configurations
            "gpio_fan" => Some(BackendKind::Relay),
            "pwm_fan" => Some(BackendKind::DutyCycle),
            "spc_fan" => Some(BackendKind::Microcontroller),
            _ => None,
        }
    }
}

/// Which backends a daemon instance should construct.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendSelection {
    pub relay: bool,
    pub duty_cycle: bool,
    pub microcontroller: bool,
    /// The extra `gpio_fan_led` name enables the relay's indicator output.
    pub relay_led: bool,
}

impl BackendSelection {
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Self {
        let mut selection = Self::default();

        for name in names {
            let name = name.as_ref();
            if name == "gpio_fan_led" {
                selection.relay_led = true;
                continue;
            }
            match BackendKind::from_name(name) {
                Some(BackendKind::Relay) => selection.relay = true,
                Some(BackendKind::DutyCycle) => selection.duty_cycle = true,
                Some(BackendKind::Microcontroller) => selection.microcontroller = true,
                None => warn!("Unknown fan name ignored: {}", name),
            }
            if matches!(name, "gpio_fan" | "pwm_fan" | "spc_fan") {
                debug!("Fan name {} is deprecated", name);
            }
        }

        selection
    }

    pub fn any(&self) -> bool {
        self.relay || self.duty_cycle || self.microcontroller
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_current_names() {
        assert_eq!(BackendKind::from_name("gpio_fan_state"), Some(BackendKind::Relay));
        assert_eq!(BackendKind::from_name("pwm_fan_speed"), Some(BackendKind::DutyCycle));
        assert_eq!(
            BackendKind::from_name("spc_fan_power"),
            Some(BackendKind::Microcontroller)
        );
    }

    #[test]
    fn legacy_aliases_resolve_to_the_same_variant() {
        assert_eq!(
            BackendKind::from_name("gpio_fan"),
            BackendKind::from_name("gpio_fan_state")
        );
        assert_eq!(
            BackendKind::from_name("pwm_fan"),
            BackendKind::from_name("pwm_fan_speed")
        );
        assert_eq!(
            BackendKind::from_name("spc_fan"),
            BackendKind::from_name("spc_fan_power")
        );
    }

    #[test]
    fn selection_collects_led_and_ignores_unknown() {
        let selection =
            BackendSelection::from_names(&["gpio_fan", "gpio_fan_led", "oled", "spc_fan_power"]);
        assert!(selection.relay);
        assert!(selection.relay_led);
        assert!(selection.microcontroller);
        assert!(!selection.duty_cycle);
        assert!(selection.any());
    }

    #[test]
    fn empty_selection_is_inactive() {
        let selection = BackendSelection::from_names::<&str>(&[]);
        assert!(!selection.any());
    }
}
