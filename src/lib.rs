//! Leveled Fan Control for Raspberry Pi accessory boards
//!
//! A daemon that maps the SoC temperature onto a discrete fan level ladder
//! with hysteresis, drives up to three heterogeneous fan backends in lockstep
//! (GPIO relay, OS cooling device, microcontroller fan) and exposes state and
//! live configuration over DBus.

pub mod args;
pub mod backends;
pub mod client;
pub mod config;
pub mod daemon;
pub mod engine;
pub mod errors;
pub mod levels;
pub mod logging;
pub mod service;
pub mod temp;

// DBus identity shared by the daemon and the client proxy
pub const DBUS_SERVICE_NAME: &str = "org.pifan.FanControl1";
pub const DBUS_OBJECT_PATH: &str = "/org/pifan/FanControl1";
pub const DBUS_INTERFACE_NAME: &str = "org.pifan.FanControl1";

// Re-export commonly used types
pub use config::{FanConfig, LedMode, TemperatureUnit};
pub use engine::{FanEngine, FanState, StateValue};
pub use errors::{FanControlError, Result};
pub use levels::{FanLevel, FAN_LEVELS, GPIO_FAN_MODES};
pub use service::FanService;
