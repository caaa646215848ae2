//! Orchestration loop driving the fan engine

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{error, info, warn};
use serde_json::Value;

use crate::config::FanConfig;
use crate::engine::{FanEngine, FanState};

/// Callback receiving the per-tick state report.
pub type StateObserver = Box<dyn Fn(&FanState) + Send + 'static>;

/// Owns the engine on a dedicated background thread and ticks it once per
/// interval. `stop()` interrupts the inter-tick sleep, joins the thread and
/// drives every backend off.
pub struct FanService {
    engine: Option<FanEngine>,
    config: Arc<Mutex<FanConfig>>,
    interval: Duration,
    observer: Option<StateObserver>,
    stop_tx: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl FanService {
    pub fn new(engine: FanEngine, interval: Duration) -> Self {
        let config = engine.config_handle();
        Self {
            engine: Some(engine),
            config,
            interval,
            observer: None,
            stop_tx: None,
            handle: None,
        }
    }

    /// Register the state observer. Must be called before `start`.
    pub fn set_on_state_changed(&mut self, observer: StateObserver) {
        if self.handle.is_some() {
            warn!("Observer must be set before start");
            return;
        }
        self.observer = Some(observer);
    }

    /// Fail-soft partial configuration update, callable from any thread.
    pub fn configure(&self, updates: &serde_json::Map<String, Value>) -> Vec<&'static str> {
        self.config.lock().unwrap().apply_update(updates)
    }

    pub fn config(&self) -> FanConfig {
        self.config.lock().unwrap().clone()
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Spawn the control thread. Idempotent while running; a stopped service
    /// stays stopped, since its backends have been released.
    pub fn start(&mut self) {
        if self.handle.is_some() {
            warn!("Already running");
            return;
        }
        let Some(mut engine) = self.engine.take() else {
            warn!("Fan service already stopped");
            return;
        };

        let observer = self.observer.take();
        let interval = self.interval;
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let spawned = std::thread::Builder::new()
            .name("fan-control".to_string())
            .spawn(move || {
                loop {
                    let state = engine.tick();
                    if let Some(observer) = &observer {
                        if catch_unwind(AssertUnwindSafe(|| observer(&state))).is_err() {
                            error!("State observer panicked");
                        }
                    }
                    // The channel doubles as an interruptible sleep
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        _ => break,
                    }
                }
                engine.off();
                engine.close();
            });

        match spawned {
            Ok(handle) => {
                self.stop_tx = Some(stop_tx);
                self.handle = Some(handle);
                info!("Fan service started, interval {:?}", self.interval);
            }
            Err(e) => error!("Failed to spawn fan control thread: {}", e),
        }
    }

    /// Stop the control thread and park the fans. Idempotent; joins before
    /// returning.
    pub fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Fan control thread panicked");
            }
            info!("Fan service stopped");
        }
    }
}

impl Drop for FanService {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::{engine_with, FakePower, FakeRelay};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    fn idle_service(interval_ms: u64) -> FanService {
        let engine = engine_with(&[50.0], None, None, None);
        FanService::new(engine, Duration::from_millis(interval_ms))
    }

    #[test]
    fn start_and_stop_are_idempotent() {
        let mut service = idle_service(10);
        service.start();
        service.start();
        assert!(service.is_running());
        service.stop();
        service.stop();
        assert!(!service.is_running());

        // A stopped service does not come back
        service.start();
        assert!(!service.is_running());
    }

    #[test]
    fn stop_joins_and_parks_the_backends() {
        let (relay_log, relay) = FakeRelay::new();
        let (power_log, power) = FakePower::new();
        let engine = engine_with(&[70.0], Some(Box::new(relay)), None, Some(Box::new(power)));
        let mut service = FanService::new(engine, Duration::from_millis(10));

        service.start();
        std::thread::sleep(Duration::from_millis(50));
        service.stop();

        let relay_log = relay_log.lock().unwrap();
        assert_eq!(relay_log.sets.last(), Some(&false));
        assert_eq!(relay_log.closed, 1);
        let power_log = power_log.lock().unwrap();
        assert_eq!(power_log.powers.last(), Some(&0));
        assert_eq!(power_log.closed, 1);
    }

    #[test]
    fn stop_interrupts_a_long_sleep() {
        let mut service = idle_service(30_000);
        service.start();
        std::thread::sleep(Duration::from_millis(20));

        let begin = Instant::now();
        service.stop();
        assert!(begin.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn observer_sees_every_tick() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let seen = ticks.clone();

        let (_power_log, power) = FakePower::new();
        let engine = engine_with(&[60.0], None, None, Some(Box::new(power)));
        let mut service = FanService::new(engine, Duration::from_millis(5));
        service.set_on_state_changed(Box::new(move |state| {
            assert!(state.contains_key("spc_fan_power"));
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        service.start();
        std::thread::sleep(Duration::from_millis(60));
        service.stop();

        assert!(ticks.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn panicking_observer_does_not_kill_the_loop() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let seen = ticks.clone();

        let mut service = {
            let engine = engine_with(&[50.0], None, None, None);
            let mut service = FanService::new(engine, Duration::from_millis(5));
            service.set_on_state_changed(Box::new(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
                panic!("observer bug");
            }));
            service
        };

        service.start();
        std::thread::sleep(Duration::from_millis(60));
        service.stop();

        assert!(ticks.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn configure_while_running_is_safe() {
        let mut service = idle_service(5);
        service.start();
        for mode in 0..5u8 {
            let changed = service.configure(json!({ "gpio_fan_mode": mode }).as_object().unwrap());
            let _ = changed;
            std::thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(service.config().gpio_fan_mode, 4);
        service.stop();
    }
}
