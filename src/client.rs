//! DBus client backing the CLI subcommands

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use log::debug;
use zbus::{dbus_proxy, Connection};

use crate::args::Commands;
use crate::config::LedMode;
use crate::engine::FanState;
use crate::errors::{FanControlError, Result};
use crate::levels::{LevelInfo, GPIO_FAN_MODES};

#[dbus_proxy(
    interface = "org.pifan.FanControl1",
    default_service = "org.pifan.FanControl1",
    default_path = "/org/pifan/FanControl1"
)]
trait FanControl {
    async fn get_state(&self) -> zbus::Result<String>;
    async fn get_config(&self) -> zbus::Result<String>;
    async fn update_config(&self, updates: &str) -> zbus::Result<Vec<String>>;
    async fn set_gpio_fan_mode(&self, mode: u8) -> zbus::Result<()>;
    async fn get_levels(&self) -> zbus::Result<Vec<LevelInfo>>;
}

/// Client for talking to a running fan control daemon
pub struct FanControlClient {
    proxy: FanControlProxy<'static>,
}

fn daemon_error(e: zbus::Error) -> FanControlError {
    match &e {
        zbus::Error::FDO(fdo) if matches!(**fdo, zbus::fdo::Error::ServiceUnknown(_)) => {
            FanControlError::DaemonNotRunning
        }
        _ => FanControlError::DBus(e),
    }
}

impl FanControlClient {
    pub async fn new() -> Result<Self> {
        let connection = Connection::system().await?;
        let proxy = FanControlProxy::new(&connection).await?;
        Ok(Self { proxy })
    }

    /// Dispatch a parsed CLI command.
    pub async fn handle_command(&self, command: Commands) -> Result<()> {
        match command {
            Commands::Daemon { .. } => Err(FanControlError::Unknown(
                "daemon command should not be handled by the client".to_string(),
            )),
            Commands::Status => self.status().await,
            Commands::Levels => self.levels().await,
            Commands::SetMode { mode } => self.set_mode(mode).await,
            Commands::SetLed { mode } => self.set_led(&mode).await,
            Commands::Config { json } => self.update_config(&json).await,
            Commands::Watch { seconds, csv } => self.watch(seconds, csv.as_deref()).await,
        }
    }

    async fn status(&self) -> Result<()> {
        let state = self.proxy.get_state().await.map_err(daemon_error)?;
        let config = self.proxy.get_config().await.map_err(daemon_error)?;
        println!("State:  {}", state);
        println!("Config: {}", config);
        Ok(())
    }

    async fn levels(&self) -> Result<()> {
        let levels = self.proxy.get_levels().await.map_err(daemon_error)?;
        println!("{:<8} {:>6} {:>6} {:>8}", "Level", "Low", "High", "Percent");
        for level in levels {
            println!(
                "{:<8} {:>6} {:>6} {:>7}%",
                level.name, level.low, level.high, level.percent
            );
        }
        Ok(())
    }

    async fn set_mode(&self, mode: u8) -> Result<()> {
        self.proxy
            .set_gpio_fan_mode(mode)
            .await
            .map_err(daemon_error)?;
        let name = GPIO_FAN_MODES
            .get(mode as usize)
            .copied()
            .unwrap_or("unknown");
        println!("GPIO fan mode set to {} ({})", mode, name);
        Ok(())
    }

    async fn set_led(&self, mode: &str) -> Result<()> {
        // Validate locally for a friendlier error than the daemon's
        let mode = LedMode::from_str(mode)?;
        let updates = serde_json::json!({ "gpio_fan_led": mode }).to_string();
        self.proxy
            .update_config(&updates)
            .await
            .map_err(daemon_error)?;
        println!("GPIO fan LED set to {:?}", mode);
        Ok(())
    }

    async fn update_config(&self, json: &str) -> Result<()> {
        let parsed: serde_json::Value = serde_json::from_str(json)?;
        if !parsed.is_object() {
            return Err(FanControlError::Config(
                "expected a JSON object".to_string(),
            ));
        }
        let applied = self
            .proxy
            .update_config(json)
            .await
            .map_err(daemon_error)?;
        if applied.is_empty() {
            println!("No configuration changes applied");
        } else {
            println!("Applied: {}", applied.join(", "));
        }
        Ok(())
    }

    /// Poll the daemon state once per second and print it, optionally
    /// appending rows to a CSV file.
    async fn watch(&self, seconds: Option<u64>, csv: Option<&Path>) -> Result<()> {
        let mut csv_file = match csv {
            Some(path) => {
                let mut file = OpenOptions::new().create(true).append(true).open(path)?;
                if file.metadata()?.len() == 0 {
                    writeln!(file, "timestamp,gpio_fan_state,spc_fan_power,pwm_fan_speed")?;
                }
                println!("Logging to {}", path.display());
                Some(file)
            }
            None => None,
        };

        let mut remaining = seconds;
        loop {
            let raw = self.proxy.get_state().await.map_err(daemon_error)?;
            let state: FanState = serde_json::from_str(&raw).unwrap_or_default();
            let now = chrono::Local::now();

            let cell = |key: &str| {
                state
                    .get(key)
                    .map(|v| serde_json::to_string(v).unwrap_or_default())
                    .unwrap_or_else(|| "-".to_string())
            };
            println!(
                "{}  relay {}  mcu {}%  rpm {}",
                now.format("%H:%M:%S"),
                cell("gpio_fan_state"),
                cell("spc_fan_power"),
                cell("pwm_fan_speed"),
            );

            if let Some(file) = csv_file.as_mut() {
                writeln!(
                    file,
                    "{},{},{},{}",
                    now.format("%Y-%m-%d %H:%M:%S"),
                    cell("gpio_fan_state"),
                    cell("spc_fan_power"),
                    cell("pwm_fan_speed"),
                )?;
            }

            if let Some(left) = remaining.as_mut() {
                *left = left.saturating_sub(1);
                if *left == 0 {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        debug!("Watch finished");
        Ok(())
    }
}
