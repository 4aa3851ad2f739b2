//! Sorting hardware channel.
//!
//! The controller (an Arduino on a serial line in the reference build) takes
//! one newline-terminated bin name per command and has no acknowledgement.
//! When no port is configured, the port cannot be opened, or the crate was
//! built without `actuator-serial`, commands go to `SimulatedActuator`.

use anyhow::Result;

use crate::error::SortError;
use crate::BinColor;

pub const DEFAULT_ACTUATOR_PORT: &str = "/dev/ttyACM0";
pub const DEFAULT_BAUD_RATE: u32 = 9600;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActuatorConfig {
    /// Serial device path; `None` forces simulation.
    pub port: Option<String>,
    pub baud_rate: u32,
}

impl Default for ActuatorConfig {
    fn default() -> Self {
        Self {
            port: Some(DEFAULT_ACTUATOR_PORT.to_string()),
            baud_rate: DEFAULT_BAUD_RATE,
        }
    }
}

pub trait SortActuator: Send {
    fn name(&self) -> &'static str;

    /// Fire-and-forget: an `Ok` means the command left this process.
    fn send(&mut self, bin: BinColor) -> Result<()>;
}

/// Logs commands instead of moving hardware.
#[derive(Debug, Default)]
pub struct SimulatedActuator {
    sent: u64,
}

impl SimulatedActuator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }
}

impl SortActuator for SimulatedActuator {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn send(&mut self, bin: BinColor) -> Result<()> {
        self.sent += 1;
        log::info!("SimulatedActuator: open {} bin (command #{})", bin, self.sent);
        Ok(())
    }
}

/// Open the configured actuator, degrading to simulation on any failure.
pub fn connect(config: &ActuatorConfig) -> Box<dyn SortActuator> {
    let Some(port) = config.port.as_deref() else {
        log::info!("SortActuator: no port configured, simulating");
        return Box::new(SimulatedActuator::new());
    };
    match open_serial(port, config.baud_rate) {
        Ok(actuator) => actuator,
        Err(err) => {
            log::warn!("SortActuator: {}; simulating", err);
            Box::new(SimulatedActuator::new())
        }
    }
}

#[cfg(feature = "actuator-serial")]
fn open_serial(port: &str, baud_rate: u32) -> Result<Box<dyn SortActuator>, SortError> {
    serial::SerialActuator::open(port, baud_rate).map(|a| Box::new(a) as Box<dyn SortActuator>)
}

#[cfg(not(feature = "actuator-serial"))]
fn open_serial(port: &str, _baud_rate: u32) -> Result<Box<dyn SortActuator>, SortError> {
    Err(SortError::ActuatorUnavailable(format!(
        "{}: built without feature 'actuator-serial'",
        port
    )))
}

#[cfg(feature = "actuator-serial")]
pub use serial::SerialActuator;

#[cfg(feature = "actuator-serial")]
mod serial {
    use anyhow::{anyhow, Result};
    use std::io::Write;
    use std::time::Duration;

    use super::{SimulatedActuator, SortActuator};
    use crate::error::SortError;
    use crate::BinColor;

    const WRITE_TIMEOUT: Duration = Duration::from_secs(1);

    /// Serial controller. After the first failed write the port is dropped
    /// and later commands are simulated.
    pub struct SerialActuator {
        path: String,
        port: Option<Box<dyn serialport::SerialPort>>,
        fallback: SimulatedActuator,
    }

    impl SerialActuator {
        pub fn open(path: &str, baud_rate: u32) -> Result<Self, SortError> {
            let port = serialport::new(path, baud_rate)
                .timeout(WRITE_TIMEOUT)
                .open()
                .map_err(|e| SortError::ActuatorUnavailable(format!("{}: {}", path, e)))?;
            log::info!("SerialActuator: connected to {} at {} baud", path, baud_rate);
            Ok(Self {
                path: path.to_string(),
                port: Some(port),
                fallback: SimulatedActuator::new(),
            })
        }
    }

    impl SortActuator for SerialActuator {
        fn name(&self) -> &'static str {
            "serial"
        }

        fn send(&mut self, bin: BinColor) -> Result<()> {
            let Some(port) = self.port.as_mut() else {
                return self.fallback.send(bin);
            };
            let line = format!("{}\n", bin);
            if let Err(err) = port.write_all(line.as_bytes()).and_then(|_| port.flush()) {
                self.port = None;
                let err = SortError::ActuatorUnavailable(format!("{}: {}", self.path, err));
                log::warn!("SerialActuator: {}; simulating from now on", err);
                return Err(anyhow!(err));
            }
            log::info!("SerialActuator: sent '{}' to {}", bin, self.path);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_actuator_counts_commands() {
        let mut actuator = SimulatedActuator::new();
        actuator.send(BinColor::Yellow).unwrap();
        actuator.send(BinColor::Brown).unwrap();
        assert_eq!(actuator.sent(), 2);
    }

    #[test]
    fn missing_port_degrades_to_simulation() {
        let actuator = connect(&ActuatorConfig {
            port: None,
            baud_rate: DEFAULT_BAUD_RATE,
        });
        assert_eq!(actuator.name(), "simulated");

        let actuator = connect(&ActuatorConfig {
            port: Some("/nonexistent/smart-bin-tty".to_string()),
            baud_rate: DEFAULT_BAUD_RATE,
        });
        assert_eq!(actuator.name(), "simulated");
    }
}
