//! Microcontroller fan driven over an I2C register protocol

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::path::Path;

use log::{debug, error};

use crate::backends::{FanBackend, PowerControl};
use crate::errors::{FanControlError, Result};

const MCU_I2C_BUS: u8 = 1;
const MCU_I2C_ADDRESS: u16 = 0x5a;

const REG_SET_FAN_POWER: u8 = 0x00;
const REG_GET_FAN_POWER: u8 = 0x21;

/// Register-level access to the companion chip. The real implementation rides
/// the kernel i2c-dev interface; tests substitute a scripted one.
pub trait RegisterIo: Send {
    fn write_register(&mut self, reg: u8, value: u8) -> Result<()>;
    fn read_register(&mut self, reg: u8) -> Result<u8>;
}

/// `/dev/i2c-N` device bound to one slave address.
pub struct I2cDev {
    file: File,
    address: u16,
}

impl I2cDev {
    const I2C_SLAVE: libc::c_ulong = 0x0703;

    pub fn open(bus: u8, address: u16) -> Result<Self> {
        let path = format!("/dev/i2c-{}", bus);
        if !Path::new(&path).exists() {
            return Err(FanControlError::I2c {
                address,
                message: format!("bus device {} not found", path),
            });
        }
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let rc = unsafe { libc::ioctl(file.as_raw_fd(), Self::I2C_SLAVE, address as libc::c_ulong) };
        if rc < 0 {
            return Err(FanControlError::I2c {
                address,
                message: format!("bind failed: {}", std::io::Error::last_os_error()),
            });
        }
        Ok(Self { file, address })
    }

    fn bus_error(&self, e: std::io::Error) -> FanControlError {
        FanControlError::I2c {
            address: self.address,
            message: e.to_string(),
        }
    }
}

impl RegisterIo for I2cDev {
    fn write_register(&mut self, reg: u8, value: u8) -> Result<()> {
        self.file
            .write_all(&[reg, value])
            .map_err(|e| self.bus_error(e))
    }

    fn read_register(&mut self, reg: u8) -> Result<u8> {
        self.file.write_all(&[reg]).map_err(|e| self.bus_error(e))?;
        let mut buf = [0u8; 1];
        self.file
            .read_exact(&mut buf)
            .map_err(|e| self.bus_error(e))?;
        Ok(buf[0])
    }
}

/// Fan on the accessory board's microcontroller, set as a 0-100 percent power.
pub struct McuFan {
    io: Option<Box<dyn RegisterIo>>,
    last_power: Option<u8>,
    ready: bool,
}

impl McuFan {
    /// Bind to the companion chip on the default bus. A probe read confirms
    /// the chip answers; failure leaves the backend permanently not-ready.
    pub fn new() -> Self {
        match I2cDev::open(MCU_I2C_BUS, MCU_I2C_ADDRESS) {
            Ok(dev) => Self::with_io(Box::new(dev)),
            Err(e) => {
                error!("MCU fan init error: {}", e);
                Self {
                    io: None,
                    last_power: None,
                    ready: false,
                }
            }
        }
    }

    pub fn with_io(mut io: Box<dyn RegisterIo>) -> Self {
        match io.read_register(REG_GET_FAN_POWER) {
            Ok(power) => {
                debug!("MCU fan reports power {}%", power);
                Self {
                    io: Some(io),
                    last_power: None,
                    ready: true,
                }
            }
            Err(e) => {
                error!("MCU fan probe error: {}", e);
                Self {
                    io: None,
                    last_power: None,
                    ready: false,
                }
            }
        }
    }

    /// Power the chip reports it is currently applying.
    pub fn get_power(&mut self) -> Option<u8> {
        if !self.check_ready() {
            return None;
        }
        match self.io.as_mut()?.read_register(REG_GET_FAN_POWER) {
            Ok(power) => Some(power),
            Err(e) => {
                error!("MCU fan read error: {}", e);
                None
            }
        }
    }
}

impl FanBackend for McuFan {
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
        self.io = None;
        debug!("MCU fan closed");
    }
}

impl PowerControl for McuFan {
    fn set_power(&mut self, percent: u8) -> Option<u8> {
        if !self.check_ready() {
            return None;
        }
        let percent = percent.min(100);
        if self.last_power == Some(percent) {
            return None;
        }
        if let Err(e) = self.io.as_mut()?.write_register(REG_SET_FAN_POWER, percent) {
            // Leave last_power untouched so the next tick retries the write
            error!("MCU fan write error: {}", e);
            return None;
        }
        self.last_power = Some(percent);
        Some(percent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct BusLog {
        writes: Vec<(u8, u8)>,
        fail: bool,
    }

    struct MockBus(Arc<Mutex<BusLog>>);

    impl RegisterIo for MockBus {
        fn write_register(&mut self, reg: u8, value: u8) -> Result<()> {
            let mut log = self.0.lock().unwrap();
            if log.fail {
                return Err(FanControlError::I2c {
                    address: MCU_I2C_ADDRESS,
                    message: "nak".to_string(),
                });
            }
            log.writes.push((reg, value));
            Ok(())
        }

        fn read_register(&mut self, _reg: u8) -> Result<u8> {
            if self.0.lock().unwrap().fail {
                return Err(FanControlError::I2c {
                    address: MCU_I2C_ADDRESS,
                    message: "nak".to_string(),
                });
            }
            Ok(0)
        }
    }

    fn mock_fan() -> (Arc<Mutex<BusLog>>, McuFan) {
        let log = Arc::new(Mutex::new(BusLog::default()));
        let fan = McuFan::with_io(Box::new(MockBus(log.clone())));
        (log, fan)
    }

    #[test]
    fn writes_the_power_register() {
        let (log, mut fan) = mock_fan();
        assert!(fan.is_ready());
        assert_eq!(fan.set_power(40), Some(40));
        assert_eq!(log.lock().unwrap().writes, vec![(REG_SET_FAN_POWER, 40)]);
    }

    #[test]
    fn clamps_to_100() {
        let (_log, mut fan) = mock_fan();
        assert_eq!(fan.set_power(250), Some(100));
    }

    #[test]
    fn skips_redundant_writes() {
        let (log, mut fan) = mock_fan();
        fan.set_power(40);
        fan.set_power(40);
        fan.set_power(40);
        assert_eq!(log.lock().unwrap().writes.len(), 1);
        fan.set_power(80);
        assert_eq!(log.lock().unwrap().writes.len(), 2);
    }

    #[test]
    fn failed_write_retries_next_time() {
        let (log, mut fan) = mock_fan();
        log.lock().unwrap().fail = true;
        assert_eq!(fan.set_power(40), None);

        log.lock().unwrap().fail = false;
        assert_eq!(fan.set_power(40), Some(40));
    }

    #[test]
    fn probe_failure_leaves_not_ready() {
        let log = Arc::new(Mutex::new(BusLog {
            writes: Vec::new(),
            fail: true,
        }));
        let mut fan = McuFan::with_io(Box::new(MockBus(log)));
        assert!(!fan.is_ready());
        assert_eq!(fan.set_power(40), None);
    }

    #[test]
    fn close_parks_the_fan() {
        let (log, mut fan) = mock_fan();
        fan.set_power(80);
        fan.close();
        assert!(!fan.is_ready());
        assert_eq!(
            log.lock().unwrap().writes,
            vec![(REG_SET_FAN_POWER, 80), (REG_SET_FAN_POWER, 0)]
        );
    }
}
