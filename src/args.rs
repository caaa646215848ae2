//! Command line argument parsing for the fan control daemon

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Leveled fan control for Raspberry Pi accessory boards
#[derive(Parser)]
#[command(name = "pi-fan-control")]
#[command(about = "Leveled fan control daemon and client")]
#[command(version)]
pub struct Args {
    /// Increase verbosity (can be used multiple times)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Also append log records to this file
    #[arg(long, value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the daemon
    Daemon {
        /// Fan backend to drive, repeatable. Names: pwm_fan_speed,
        /// gpio_fan_state, spc_fan_power, gpio_fan_led (plus the deprecated
        /// aliases pwm_fan, gpio_fan, spc_fan)
        #[arg(long = "fan", value_name = "NAME")]
        fans: Vec<String>,

        /// Seconds between control ticks
        #[arg(long, default_value_t = 1.0)]
        interval: f64,

        /// Config file path
        #[arg(long, value_name = "PATH")]
        config: Option<PathBuf>,
    },
    /// Show the daemon state and configuration
    Status,
    /// Show the fan level ladder
    Levels,
    /// Set the relay fan activation rung (0 = always on, 4 = quiet)
    SetMode {
        /// Ladder rung at or above which the relay fan switches on
        mode: u8,
    },
    /// Set the relay fan indicator LED behavior
    SetLed {
        /// follow, on or off
        mode: String,
    },
    /// Apply a JSON configuration update, e.g. '{"gpio_fan_mode": 2}'
    Config {
        /// JSON object of configuration keys
        json: String,
    },
    /// Poll the daemon state once per second and print it
    Watch {
        /// Stop after this many samples (default: run until interrupted)
        #[arg(long)]
        seconds: Option<u64>,

        /// Append samples to this CSV file
        #[arg(long, value_name = "PATH")]
        csv: Option<PathBuf>,
    },
}
