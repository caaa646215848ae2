//! The fan decision engine
//!
//! Maps the sampled CPU temperature onto the level ladder with per-level
//! hysteresis bands, then fans the chosen level out to every ready backend in
//! its native resolution. When the platform's own thermal governor drives the
//! duty-cycle fan, the engine flips into follow mode: the governor's device
//! state becomes the source of truth and the other backends are kept in
//! lockstep with it.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backends::{
    BackendSelection, DutyCycleControl, FanBackend, GpioFan, McuFan, PowerControl, PwmFan,
    RelayControl,
};
use crate::config::FanConfig;
use crate::errors::Result;
use crate::levels::{validate, FanLevel, FAN_LEVELS};
use crate::temp::{CpuTemperature, ThermalZoneSensor};

/// Value applied to one backend during a tick.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StateValue {
    Bool(bool),
    Percent(u8),
    Rpm(u32),
}

/// Per-tick report, keyed by backend state name.
pub type FanState = BTreeMap<String, StateValue>;

type RelayBackend = Box<dyn RelayControl + Send>;
type DutyBackend = Box<dyn DutyCycleControl + Send>;
type PowerBackend = Box<dyn PowerControl + Send>;

pub struct FanEngine {
    levels: Vec<FanLevel>,
    level: usize,
    initial: bool,
    config: Arc<Mutex<FanConfig>>,
    /// Last configuration acted on by the tick thread
    applied: FanConfig,
    temperature: Box<dyn CpuTemperature + Send>,
    relay: Option<RelayBackend>,
    duty: Option<DutyBackend>,
    power: Option<PowerBackend>,
}

impl FanEngine {
    /// Build the engine and the selected hardware backends.
    ///
    /// A backend that fails to initialize is kept in a permanently not-ready
    /// state and logged; only a missing temperature source is fatal.
    pub fn new(config: Arc<Mutex<FanConfig>>, selection: &BackendSelection) -> Result<Self> {
        let cfg = config.lock().unwrap().clone();

        let relay = selection.relay.then(|| {
            let led_pin = selection.relay_led.then_some(cfg.gpio_fan_led_pin);
            debug!(
                "Init GPIO fan with pin {}, led pin {:?}",
                cfg.gpio_fan_pin, led_pin
            );
            let mut fan = GpioFan::new(cfg.gpio_fan_pin, led_pin);
            if fan.is_ready() {
                fan.set_led(cfg.gpio_fan_led);
            } else {
                warn!("GPIO fan init failed, disabling gpio fan control");
            }
            Box::new(fan) as RelayBackend
        });

        let duty = selection.duty_cycle.then(|| {
            debug!("Init PWM fan");
            let fan = PwmFan::new();
            if !fan.is_ready() {
                warn!("PWM fan init failed, disabling pwm fan control");
            }
            Box::new(fan) as DutyBackend
        });

        let power = selection.microcontroller.then(|| {
            debug!("Init MCU fan");
            let fan = McuFan::new();
            if !fan.is_ready() {
                warn!("MCU fan init failed, disabling spc fan control");
            }
            Box::new(fan) as PowerBackend
        });

        let temperature = Box::new(ThermalZoneSensor::new()?);

        Self::with_parts(FAN_LEVELS.to_vec(), config, temperature, relay, duty, power)
    }

    pub(crate) fn with_parts(
        levels: Vec<FanLevel>,
        config: Arc<Mutex<FanConfig>>,
        temperature: Box<dyn CpuTemperature + Send>,
        relay: Option<RelayBackend>,
        duty: Option<DutyBackend>,
        power: Option<PowerBackend>,
    ) -> Result<Self> {
        validate(&levels)?;
        let applied = config.lock().unwrap().clone();
        Ok(Self {
            levels,
            level: 0,
            initial: true,
            config,
            applied,
            temperature,
            relay,
            duty,
            power,
        })
    }

    /// Apply a partial configuration update. Safe to call from any thread;
    /// per-key validation is fail-soft (see [`FanConfig::apply_update`]).
    pub fn configure(&self, updates: &serde_json::Map<String, Value>) -> Vec<&'static str> {
        self.config.lock().unwrap().apply_update(updates)
    }

    /// Shared handle to the engine configuration.
    pub fn config_handle(&self) -> Arc<Mutex<FanConfig>> {
        self.config.clone()
    }

    pub fn level(&self) -> usize {
        self.level
    }

    pub fn levels(&self) -> &[FanLevel] {
        &self.levels
    }

    /// One decision step. Never blocks beyond the backend writes and never
    /// fails; faults are logged and superseded by the next tick.
    pub fn tick(&mut self) -> FanState {
        self.refresh_config();
        let cfg = self.applied.clone();
        let mut state = FanState::new();

        // Governor follow mode: the platform drives the duty-cycle fan, we
        // keep the secondary backends in lockstep with its state.
        if let Some(duty) = self
            .duty
            .as_mut()
            .filter(|d| d.is_ready() && d.is_supported())
        {
            if self.initial {
                info!("PWM fan governor is active, syncing other fans with it");
                self.initial = false;
            }
            let rung = (duty.state() as usize).min(self.levels.len() - 1);
            debug!("Governor fan state {}, following", rung);
            if let Some(rpm) = duty.speed_rpm() {
                state.insert("pwm_fan_speed".to_string(), StateValue::Rpm(rpm));
            }

            if let Some(power) = self.power.as_mut().filter(|p| p.is_ready()) {
                let percent = self.levels[rung].percent;
                power.set_power(percent);
                state.insert("spc_fan_power".to_string(), StateValue::Percent(percent));
            }
            if let Some(relay) = self.relay.as_mut().filter(|r| r.is_ready()) {
                let on = rung as u8 >= cfg.gpio_fan_mode;
                relay.set(on);
                state.insert("gpio_fan_state".to_string(), StateValue::Bool(on));
            }
            return state;
        }

        let temp = match self.temperature.read_temperature() {
            Ok(temp) => temp,
            Err(e) => {
                // Hold the previous level until the sensor recovers
                error!("Temperature read error: {}", e);
                return state;
            }
        };
        debug!("CPU temperature: {}", cfg.temperature_unit.display(temp));

        // Move at most one rung per tick, gated by the band of the level held
        // at tick start; overlapping bands make the exit threshold differ
        // from the entry threshold.
        let start = self.level;
        if temp > self.levels[start].high {
            self.level = (start + 1).min(self.levels.len() - 1);
        } else if temp < self.levels[start].low {
            self.level = start.saturating_sub(1);
        }
        let percent = self.levels[self.level].percent;

        if let Some(relay) = self.relay.as_mut().filter(|r| r.is_ready()) {
            let on = self.level as u8 >= cfg.gpio_fan_mode;
            relay.set(on);
            state.insert("gpio_fan_state".to_string(), StateValue::Bool(on));
        }
        if let Some(power) = self.power.as_mut().filter(|p| p.is_ready()) {
            power.set_power(percent);
            state.insert("spc_fan_power".to_string(), StateValue::Percent(percent));
        }
        if let Some(duty) = self.duty.as_mut().filter(|d| d.is_ready()) {
            duty.set_state(self.level as u8);
            if let Some(rpm) = duty.speed_rpm() {
                state.insert("pwm_fan_speed".to_string(), StateValue::Rpm(rpm));
            }
        }

        if self.level != start {
            let crossed = if self.level > start {
                format!("above {} °C", self.levels[start].high)
            } else {
                format!("below {} °C", self.levels[start].low)
            };
            info!(
                "Fan level: {} ({}%), CPU temperature {} {}",
                self.levels[self.level].name,
                percent,
                cfg.temperature_unit.display(temp),
                crossed
            );
        } else if self.initial {
            info!(
                "Fan level: {} ({}%), CPU temperature {}",
                self.levels[self.level].name,
                percent,
                cfg.temperature_unit.display(temp)
            );
        }
        self.initial = false;

        state
    }

    /// Drive every ready backend to its off value.
    pub fn off(&mut self) {
        if let Some(relay) = self.relay.as_mut().filter(|r| r.is_ready()) {
            relay.off();
        }
        if let Some(power) = self.power.as_mut().filter(|p| p.is_ready()) {
            power.off();
        }
        if let Some(duty) = self.duty.as_mut().filter(|d| d.is_ready()) {
            duty.off();
        }
    }

    /// Off, then release every backend. Idempotent.
    pub fn close(&mut self) {
        if let Some(relay) = self.relay.as_mut() {
            relay.close();
        }
        if let Some(power) = self.power.as_mut() {
            power.close();
        }
        if let Some(duty) = self.duty.as_mut() {
            duty.close();
        }
        debug!("Fan engine closed");
    }

    /// Pick up configuration changes made since the previous tick and apply
    /// the backend side effects (pin moves, LED mode) on the tick thread.
    fn refresh_config(&mut self) {
        let current = self.config.lock().unwrap().clone();
        if current == self.applied {
            return;
        }

        if let Some(relay) = self.relay.as_mut() {
            if current.gpio_fan_pin != self.applied.gpio_fan_pin && relay.is_ready() {
                relay.change_pin(current.gpio_fan_pin);
            }
            if current.gpio_fan_led_pin != self.applied.gpio_fan_led_pin && relay.is_ready() {
                relay.change_led_pin(current.gpio_fan_led_pin);
            }
            if current.gpio_fan_led != self.applied.gpio_fan_led && relay.is_ready() {
                relay.set_led(current.gpio_fan_led);
            }
        }

        self.applied = current;
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted fakes shared by the engine and service tests.

    use super::*;
    use crate::config::LedMode;
    use crate::errors::FanControlError;

    #[derive(Default)]
    pub struct RelayLog {
        pub sets: Vec<bool>,
        pub leds: Vec<LedMode>,
        pub pins: Vec<u8>,
        pub closed: u32,
    }

    pub struct FakeRelay {
        pub ready: bool,
        pub log: Arc<Mutex<RelayLog>>,
    }

    impl FakeRelay {
        pub fn new() -> (Arc<Mutex<RelayLog>>, Self) {
            let log = Arc::new(Mutex::new(RelayLog::default()));
            (
                log.clone(),
                Self {
                    ready: true,
                    log,
                },
            )
        }
    }

    impl FanBackend for FakeRelay {
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
            self.log.lock().unwrap().closed += 1;
        }
    }

    impl RelayControl for FakeRelay {
        fn set(&mut self, on: bool) -> Option<bool> {
            self.log.lock().unwrap().sets.push(on);
            Some(on)
        }
        fn set_led(&mut self, mode: LedMode) {
            self.log.lock().unwrap().leds.push(mode);
        }
        fn change_pin(&mut self, pin: u8) {
            self.log.lock().unwrap().pins.push(pin);
        }
        fn change_led_pin(&mut self, _pin: u8) {}
    }

    #[derive(Default)]
    pub struct DutyLog {
        pub set_states: Vec<u8>,
        pub closed: u32,
    }

    pub struct FakeDuty {
        pub ready: bool,
        pub supported: bool,
        pub device_state: u8,
        pub rpm: Option<u32>,
        pub log: Arc<Mutex<DutyLog>>,
    }

    impl FakeDuty {
        pub fn new(supported: bool) -> (Arc<Mutex<DutyLog>>, Self) {
            let log = Arc::new(Mutex::new(DutyLog::default()));
            (
                log.clone(),
                Self {
                    ready: true,
                    supported,
                    device_state: 0,
                    rpm: Some(1200),
                    log,
                },
            )
        }
    }

    impl FanBackend for FakeDuty {
        fn name(&self) -> &'static str {
            "pwm_fan"
        }
        fn is_ready(&self) -> bool {
            self.ready
        }
        fn off(&mut self) {
            if !self.supported {
                self.set_state(0);
            }
        }
        fn close(&mut self) {
            if !self.ready {
                return;
            }
            self.off();
            self.ready = false;
            self.log.lock().unwrap().closed += 1;
        }
    }

    impl DutyCycleControl for FakeDuty {
        fn is_supported(&self) -> bool {
            self.supported
        }
        fn state(&mut self) -> u8 {
            self.device_state
        }
        fn set_state(&mut self, state: u8) -> Option<u8> {
            self.log.lock().unwrap().set_states.push(state);
            Some(state)
        }
        fn speed_rpm(&mut self) -> Option<u32> {
            self.rpm
        }
    }

    #[derive(Default)]
    pub struct PowerLog {
        pub powers: Vec<u8>,
        pub closed: u32,
    }

    pub struct FakePower {
        pub ready: bool,
        pub log: Arc<Mutex<PowerLog>>,
    }

    impl FakePower {
        pub fn new() -> (Arc<Mutex<PowerLog>>, Self) {
            let log = Arc::new(Mutex::new(PowerLog::default()));
            (
                log.clone(),
                Self {
                    ready: true,
                    log,
                },
            )
        }
    }

    impl FanBackend for FakePower {
        fn name(&self) -> &'static str {
            "spc_fan"
        }
        fn is_ready(&self) -> bool {
            self.ready
        }
        fn off(&mut self) {
            self.set_power(0);
        }
        fn close(&mut self) {
            if !self.ready {
                return;
            }
            self.off();
            self.ready = false;
            self.log.lock().unwrap().closed += 1;
        }
    }

    impl PowerControl for FakePower {
        fn set_power(&mut self, percent: u8) -> Option<u8> {
            self.log.lock().unwrap().powers.push(percent);
            Some(percent)
        }
    }

    /// Replays a fixed temperature script, repeating the last entry.
    pub struct ScriptedTemp {
        pub script: Vec<Result<f32>>,
        pub cursor: usize,
    }

    impl ScriptedTemp {
        pub fn new(temps: &[f32]) -> Self {
            Self {
                script: temps.iter().map(|t| Ok(*t)).collect(),
                cursor: 0,
            }
        }

        pub fn from_script(script: Vec<Result<f32>>) -> Self {
            Self { script, cursor: 0 }
        }
    }

    impl CpuTemperature for ScriptedTemp {
        fn read_temperature(&mut self) -> Result<f32> {
            let index = self.cursor.min(self.script.len() - 1);
            self.cursor += 1;
            match &self.script[index] {
                Ok(temp) => Ok(*temp),
                Err(_) => Err(FanControlError::Temperature("scripted fault".to_string())),
            }
        }
    }

    pub fn shared_config() -> Arc<Mutex<FanConfig>> {
        Arc::new(Mutex::new(FanConfig::default()))
    }

    pub fn engine_with(
        temps: &[f32],
        relay: Option<RelayBackend>,
        duty: Option<DutyBackend>,
        power: Option<PowerBackend>,
    ) -> FanEngine {
        FanEngine::with_parts(
            FAN_LEVELS.to_vec(),
            shared_config(),
            Box::new(ScriptedTemp::new(temps)),
            relay,
            duty,
            power,
        )
        .unwrap()
    }
}
