//! DBus daemon wrapping the fan service

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::watch;
use zbus::{dbus_interface, ConnectionBuilder, SignalContext};

use crate::backends::BackendSelection;
use crate::config::FanConfig;
use crate::engine::{FanEngine, FanState};
use crate::errors::{zbus_error_from_display, FanControlError, Result};
use crate::levels::{LevelInfo, FAN_LEVELS, GPIO_FAN_MODES};
use crate::service::FanService;
use crate::{DBUS_OBJECT_PATH, DBUS_SERVICE_NAME};

/// Main daemon structure: the running fan service plus the shared pieces the
/// DBus interface reads and writes.
pub struct FanControlDaemon {
    service: FanService,
    config: Arc<Mutex<FanConfig>>,
    config_path: PathBuf,
    latest: Arc<Mutex<FanState>>,
    state_rx: watch::Receiver<String>,
}

impl FanControlDaemon {
    /// Build the engine for the selected fans and wire the state observer.
    pub fn new(fans: &[String], interval: Duration, config_path: Option<PathBuf>) -> Result<Self> {
        let config_path = config_path.unwrap_or_else(FanConfig::config_path);
        let config = Arc::new(Mutex::new(FanConfig::load_or_default(&config_path)));

        let selection = BackendSelection::from_names(fans);
        if !selection.any() {
            warn!("No fan backends selected, state reports will be empty");
        }

        let engine = FanEngine::new(config.clone(), &selection)?;
        let mut service = FanService::new(engine, interval);

        let latest = Arc::new(Mutex::new(FanState::new()));
        let (state_tx, state_rx) = watch::channel(String::new());
        let observer_latest = latest.clone();
        service.set_on_state_changed(Box::new(move |state| {
            *observer_latest.lock().unwrap() = state.clone();
            if let Ok(json) = serde_json::to_string(state) {
                // Only wake the signal task when the state actually changed
                state_tx.send_if_modified(|current| {
                    if *current != json {
                        *current = json;
                        true
                    } else {
                        false
                    }
                });
            }
        }));

        Ok(Self {
            service,
            config,
            config_path,
            latest,
            state_rx,
        })
    }

    /// Run until interrupted, then stop the service and park the fans.
    pub async fn run(mut self) -> Result<()> {
        info!("Starting fan control daemon");
        self.service.start();

        let iface = FanControlIface {
            config: self.config.clone(),
            config_path: self.config_path.clone(),
            latest: self.latest.clone(),
        };

        let connection = ConnectionBuilder::system()?
            .name(DBUS_SERVICE_NAME)?
            .serve_at(DBUS_OBJECT_PATH, iface)?
            .build()
            .await?;

        // Bridge the observer thread to the StateChanged signal
        {
            let connection = connection.clone();
            let mut state_rx = self.state_rx.clone();
            tokio::spawn(async move {
                while state_rx.changed().await.is_ok() {
                    let state = state_rx.borrow_and_update().clone();
                    let ctxt = match SignalContext::new(&connection, DBUS_OBJECT_PATH) {
                        Ok(ctxt) => ctxt,
                        Err(e) => {
                            debug!("Signal context error: {}", e);
                            break;
                        }
                    };
                    if let Err(e) = FanControlIface::state_changed(&ctxt, &state).await {
                        debug!("StateChanged signal failed: {}", e);
                    }
                }
            });
        }

        info!("Daemon started, listening on DBus as {}", DBUS_SERVICE_NAME);

        tokio::signal::ctrl_c().await.map_err(FanControlError::Io)?;
        info!("Interrupted, shutting down");
        self.service.stop();

        Ok(())
    }
}

/// The DBus-facing half of the daemon.
struct FanControlIface {
    config: Arc<Mutex<FanConfig>>,
    config_path: PathBuf,
    latest: Arc<Mutex<FanState>>,
}

impl FanControlIface {
    fn apply_and_save(
        &self,
        updates: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Vec<String>> {
        let (changed, snapshot) = {
            let mut config = self.config.lock().unwrap();
            let changed = config.apply_update(updates);
            (changed, config.clone())
        };
        if !changed.is_empty() {
            snapshot.save_to_file(&self.config_path)?;
        }
        Ok(changed.into_iter().map(str::to_string).collect())
    }
}

#[dbus_interface(name = "org.pifan.FanControl1")]
impl FanControlIface {
    /// Signal emitted when a tick produces a different state map
    #[dbus_interface(signal)]
    async fn state_changed(ctxt: &SignalContext<'_>, state: &str) -> zbus::Result<()>;

    /// Latest per-tick state as a JSON object
    async fn get_state(&self) -> zbus::fdo::Result<String> {
        let state = self.latest.lock().unwrap();
        serde_json::to_string(&*state).map_err(zbus_error_from_display)
    }

    /// Current configuration as a JSON object
    async fn get_config(&self) -> zbus::fdo::Result<String> {
        let config = self.config.lock().unwrap().clone();
        serde_json::to_string(&config).map_err(zbus_error_from_display)
    }

    /// Apply a partial configuration update (JSON object). Invalid keys are
    /// skipped; returns the names of the keys that changed.
    async fn update_config(&self, updates: &str) -> zbus::fdo::Result<Vec<String>> {
        debug!("UpdateConfig: {}", updates);
        let parsed: serde_json::Value =
            serde_json::from_str(updates).map_err(zbus_error_from_display)?;
        let object = parsed
            .as_object()
            .ok_or_else(|| zbus_error_from_display("expected a JSON object"))?;
        self.apply_and_save(object).map_err(zbus_error_from_display)
    }

    /// Set the relay fan activation rung (0-4)
    async fn set_gpio_fan_mode(&self, mode: u8) -> zbus::fdo::Result<()> {
        if mode as usize >= GPIO_FAN_MODES.len() {
            return Err(zbus_error_from_display(format!(
                "invalid gpio fan mode: {}",
                mode
            )));
        }
        let mut updates = serde_json::Map::new();
        updates.insert("gpio_fan_mode".to_string(), mode.into());
        self.apply_and_save(&updates).map_err(zbus_error_from_display)?;
        info!(
            "GPIO fan mode set to {} ({})",
            mode, GPIO_FAN_MODES[mode as usize]
        );
        Ok(())
    }

    /// The fan level ladder
    async fn get_levels(&self) -> zbus::fdo::Result<Vec<LevelInfo>> {
        Ok(FAN_LEVELS.iter().map(LevelInfo::from).collect())
    }
}
