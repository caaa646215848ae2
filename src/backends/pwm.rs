//! Duty-cycle fan driven through the kernel cooling device

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, error, warn};

use crate::backends::{DutyCycleControl, FanBackend};

const COOLING_STATE_PATH: &str = "/sys/class/thermal/cooling_device0/cur_state";
const COOLING_FAN_HWMON_DIR: &str = "/sys/devices/platform/cooling_fan/hwmon";
const OS_RELEASE_PATH: &str = "/etc/os-release";

/// Highest discrete device state of the cooling fan.
const MAX_STATE: u8 = 3;

/// Distributions whose firmware thermal loop is known broken, where the
/// daemon must drive the cooling device itself instead of deferring.
const GOVERNOR_OVERRIDE_OS: [&str; 0] = [];

/// System fan with a small ladder of discrete states, normally owned by the
/// platform's own thermal governor. When the governor is active the engine
/// reads this backend's state as the source of truth; otherwise the engine
/// drives it like any other backend.
pub struct PwmFan {
    state_path: PathBuf,
    hwmon_dir: PathBuf,
    governor_active: bool,
    last_state: Option<u8>,
    ready: bool,
}

impl PwmFan {
    pub fn new() -> Self {
        Self::with_paths(COOLING_STATE_PATH, COOLING_FAN_HWMON_DIR, OS_RELEASE_PATH)
    }

    pub fn with_paths(
        state_path: impl Into<PathBuf>,
        hwmon_dir: impl Into<PathBuf>,
        os_release: impl AsRef<Path>,
    ) -> Self {
        let state_path = state_path.into();
        let hwmon_dir = hwmon_dir.into();

        if !state_path.exists() || !hwmon_dir.exists() {
            warn!("PWM fan is not present on this platform");
            return Self {
                state_path,
                hwmon_dir,
                governor_active: false,
                last_state: None,
                ready: false,
            };
        }

        let governor_active = !os_overridden(os_release.as_ref());
        if !governor_active {
            warn!("Platform thermal governor overridden, driving PWM fan directly");
        }

        Self {
            state_path,
            hwmon_dir,
            governor_active,
            last_state: None,
            ready: true,
        }
    }

    #[cfg(test)]
    fn force_governor(&mut self, active: bool) {
        self.governor_active = active;
    }
}

/// True when the running distribution is on the override list.
fn os_overridden(os_release: &Path) -> bool {
    let content = match fs::read_to_string(os_release) {
        Ok(content) => content,
        Err(_) => return false,
    };

    for line in content.lines() {
        let id = line
            .strip_prefix("ID=")
            .or_else(|| line.strip_prefix("VERSION_CODENAME="));
        if let Some(id) = id {
            let id = id.trim_matches('"').to_lowercase();
            if GOVERNOR_OVERRIDE_OS.contains(&id.as_str()) {
                return true;
            }
        }
    }
    false
}

impl FanBackend for PwmFan {
    fn name(&self) -> &'static str {
        "pwm_fan"
    }

    fn is_ready(&self) -> bool {
        self.ready
    }

    fn off(&mut self) {
        if !self.check_ready() {
            return;
        }
        // The governor owns the device; parking it at 0 would fight the OS
        if !self.governor_active {
            self.set_state(0);
        }
    }

    fn close(&mut self) {
        if !self.ready {
            return;
        }
        self.off();
        self.ready = false;
        debug!("PWM fan closed");
    }
}

impl DutyCycleControl for PwmFan {
    fn is_supported(&self) -> bool {
        self.governor_active
    }

    fn state(&mut self) -> u8 {
        if !self.check_ready() {
            return 0;
        }
        match fs::read_to_string(&self.state_path) {
            Ok(content) => match content.trim().parse::<u8>() {
                Ok(state) => state.min(MAX_STATE),
                Err(_) => {
                    error!("Unparsable PWM fan state: {:?}", content.trim());
                    0
                }
            },
            Err(e) => {
                error!("Read PWM fan state error: {}", e);
                0
            }
        }
    }

    fn set_state(&mut self, state: u8) -> Option<u8> {
        if !self.check_ready() {
            return None;
        }
        let state = state.min(MAX_STATE);
        if self.last_state == Some(state) {
            return None;
        }
        if let Err(e) = fs::write(&self.state_path, state.to_string()) {
            error!("Write PWM fan state error: {}", e);
            return None;
        }
        self.last_state = Some(state);
        Some(state)
    }

    fn speed_rpm(&mut self) -> Option<u32> {
        if !self.check_ready() {
            return None;
        }
        // The hwmon instance under the platform device carries a rotating name
        let entry = fs::read_dir(&self.hwmon_dir).ok()?.flatten().next()?;
        let input = entry.path().join("fan1_input");
        match fs::read_to_string(&input) {
            Ok(content) => content.trim().parse().ok(),
            Err(e) => {
                error!("Read fan speed error: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_platform(state: &str, rpm: &str) -> (tempfile::TempDir, PwmFan) {
        let dir = tempfile::tempdir().unwrap();
        let state_path = dir.path().join("cur_state");
        fs::write(&state_path, state).unwrap();
        let hwmon = dir.path().join("hwmon/hwmon2");
        fs::create_dir_all(&hwmon).unwrap();
        fs::write(hwmon.join("fan1_input"), rpm).unwrap();
        let os_release = dir.path().join("os-release");
        fs::write(&os_release, "ID=raspbian\nVERSION_CODENAME=bookworm\n").unwrap();

        let fan = PwmFan::with_paths(&state_path, dir.path().join("hwmon"), &os_release);
        (dir, fan)
    }

    #[test]
    fn reads_state_and_speed() {
        let (_dir, mut fan) = fake_platform("2\n", "1450\n");
        assert!(fan.is_ready());
        assert!(fan.is_supported());
        assert_eq!(fan.state(), 2);
        assert_eq!(fan.speed_rpm(), Some(1450));
    }

    #[test]
    fn state_is_clamped_to_device_range() {
        let (_dir, mut fan) = fake_platform("9\n", "0\n");
        assert_eq!(fan.state(), MAX_STATE);
        fan.force_governor(false);
        assert_eq!(fan.set_state(7), Some(MAX_STATE));
    }

    #[test]
    fn set_state_skips_redundant_writes() {
        let (_dir, mut fan) = fake_platform("0\n", "0\n");
        fan.force_governor(false);
        assert_eq!(fan.set_state(2), Some(2));
        assert_eq!(fan.set_state(2), None);
        assert_eq!(fan.set_state(1), Some(1));
    }

    #[test]
    fn off_defers_to_an_active_governor() {
        let (dir, mut fan) = fake_platform("3\n", "0\n");
        fan.off();
        let content = fs::read_to_string(dir.path().join("cur_state")).unwrap();
        assert_eq!(content.trim(), "3");

        fan.force_governor(false);
        fan.off();
        let content = fs::read_to_string(dir.path().join("cur_state")).unwrap();
        assert_eq!(content.trim(), "0");
    }

    #[test]
    fn missing_platform_is_not_ready() {
        let dir = tempfile::tempdir().unwrap();
        let mut fan = PwmFan::with_paths(
            dir.path().join("cur_state"),
            dir.path().join("hwmon"),
            dir.path().join("os-release"),
        );
        assert!(!fan.is_ready());
        assert_eq!(fan.set_state(1), None);
        assert_eq!(fan.speed_rpm(), None);
    }
}
