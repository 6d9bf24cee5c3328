//! Modem power-cycle via a sysfs GPIO line.
//!
//! The reset controller pulses the line low → high → low, then the cellular
//! state machine waits for the modem's device nodes to re-enumerate.  Every
//! hold is a stored deadline checked on the next tick.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::error::{NetdError, Result};

/// A digital output that can be driven high or low.
pub trait ResetLine: Send {
    fn set_level(&mut self, high: bool) -> Result<()>;
}

/// Presence of the modem's device nodes.
pub trait DeviceNodes: Send {
    /// AT port node.
    fn at_port_present(&self) -> bool;
    /// PPP data port node.
    fn data_port_present(&self) -> bool;

    fn all_present(&self) -> bool {
        self.at_port_present() && self.data_port_present()
    }
}

// ── sysfs GPIO ────────────────────────────────────────────────────────────────

/// An exported sysfs GPIO configured as output.  Unexported on drop if this
/// process exported it.
pub struct GpioPin {
    base:          PathBuf,
    pin:           u32,
    exported_here: bool,
}

impl GpioPin {
    /// Export `pin` under `base` (normally `/sys/class/gpio`) and configure it
    /// as an output driven low.
    pub fn export(base: &Path, pin: u32) -> Result<Self> {
        let dir = base.join(format!("gpio{pin}"));
        let exported_here = if dir.exists() {
            false
        } else {
            fs::write(base.join("export"), pin.to_string())
                .map_err(|e| NetdError::Gpio(format!("export {pin}: {e}")))?;
            true
        };
        let gpio = Self { base: base.to_path_buf(), pin, exported_here };
        // "low" sets direction and initial level in one write.
        fs::write(dir.join("direction"), "low")
            .map_err(|e| NetdError::Gpio(format!("direction of gpio{pin}: {e}")))?;
        info!("GPIO {pin} exported as reset line");
        Ok(gpio)
    }

    fn value_path(&self) -> PathBuf {
        self.base.join(format!("gpio{}", self.pin)).join("value")
    }
}

impl ResetLine for GpioPin {
    fn set_level(&mut self, high: bool) -> Result<()> {
        fs::write(self.value_path(), if high { "1" } else { "0" })
            .map_err(|e| NetdError::Gpio(format!("gpio{} value: {e}", self.pin)))
    }
}

impl Drop for GpioPin {
    fn drop(&mut self) {
        if self.exported_here {
            if let Err(e) = fs::write(self.base.join("unexport"), self.pin.to_string()) {
                warn!("failed to unexport GPIO {}: {e}", self.pin);
            } else {
                debug!("GPIO {} unexported", self.pin);
            }
        }
    }
}

/// Checks the real device paths.
pub struct SysNodes {
    pub at_device:   PathBuf,
    pub data_device: PathBuf,
}

impl DeviceNodes for SysNodes {
    fn at_port_present(&self) -> bool {
        self.at_device.exists()
    }

    fn data_port_present(&self) -> bool {
        self.data_device.exists()
    }
}

// ── Controller ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum PulseStep {
    Low  { until: Instant },
    High { until: Instant },
}

/// Progress of a reset pulse.
#[derive(Debug)]
pub enum PulsePoll {
    Pending,
    Done,
    Failed(NetdError),
}

pub struct HardwareResetController {
    line:      Option<Box<dyn ResetLine>>,
    nodes:     Box<dyn DeviceNodes>,
    low_hold:  Duration,
    high_hold: Duration,
    step:      Option<PulseStep>,
    pulses:    u32,
}

impl HardwareResetController {
    pub fn new(
        line:      Option<Box<dyn ResetLine>>,
        nodes:     Box<dyn DeviceNodes>,
        low_hold:  Duration,
        high_hold: Duration,
    ) -> Self {
        Self { line, nodes, low_hold, high_hold, step: None, pulses: 0 }
    }

    pub fn has_line(&self) -> bool {
        self.line.is_some()
    }

    /// Pulses issued since startup.
    pub fn pulses(&self) -> u32 {
        self.pulses
    }

    pub fn nodes_present(&self) -> bool {
        self.nodes.all_present()
    }

    pub fn data_port_present(&self) -> bool {
        self.nodes.data_port_present()
    }

    /// Drive the line low and arm the first hold.
    pub fn begin_pulse(&mut self, now: Instant) -> Result<()> {
        self.pulses += 1;
        let Some(line) = self.line.as_mut() else {
            warn!("modem reset requested but no reset line is configured");
            self.step = None;
            return Ok(());
        };
        info!("modem reset: pulse {} starting", self.pulses);
        line.set_level(false)?;
        self.step = Some(PulseStep::Low { until: now + self.low_hold });
        Ok(())
    }

    /// Advance the pulse; call each tick until it is no longer pending.
    pub fn poll_pulse(&mut self, now: Instant) -> PulsePoll {
        let (Some(step), Some(line)) = (self.step, self.line.as_mut()) else {
            self.step = None;
            return PulsePoll::Done;
        };
        match step {
            PulseStep::Low { until } if now >= until => {
                if let Err(e) = line.set_level(true) {
                    self.step = None;
                    return PulsePoll::Failed(e);
                }
                self.step = Some(PulseStep::High { until: now + self.high_hold });
                PulsePoll::Pending
            }
            PulseStep::High { until } if now >= until => {
                self.step = None;
                match line.set_level(false) {
                    Ok(()) => {
                        debug!("modem reset: pulse complete");
                        PulsePoll::Done
                    }
                    Err(e) => PulsePoll::Failed(e),
                }
            }
            _ => PulsePoll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockLine, MockNodes};

    fn controller(line: &MockLine, nodes: &MockNodes) -> HardwareResetController {
        HardwareResetController::new(
            Some(Box::new(line.clone())),
            Box::new(nodes.clone()),
            Duration::from_millis(100),
            Duration::from_millis(1000),
        )
    }

    #[test]
    fn pulse_drives_low_high_low_on_schedule() {
        let line = MockLine::default();
        let nodes = MockNodes::present();
        let mut c = controller(&line, &nodes);
        let t0 = Instant::now();
        c.begin_pulse(t0).unwrap();
        assert!(matches!(c.poll_pulse(t0 + Duration::from_millis(50)), PulsePoll::Pending));
        assert_eq!(line.levels(), vec![false]);
        assert!(matches!(c.poll_pulse(t0 + Duration::from_millis(100)), PulsePoll::Pending));
        assert_eq!(line.levels(), vec![false, true]);
        assert!(matches!(c.poll_pulse(t0 + Duration::from_millis(600)), PulsePoll::Pending));
        assert!(matches!(c.poll_pulse(t0 + Duration::from_millis(1100)), PulsePoll::Done));
        assert_eq!(line.levels(), vec![false, true, false]);
        assert_eq!(c.pulses(), 1);
    }

    #[test]
    fn missing_line_completes_immediately() {
        let nodes = MockNodes::present();
        let mut c = HardwareResetController::new(
            None,
            Box::new(nodes),
            Duration::from_millis(100),
            Duration::from_millis(1000),
        );
        let now = Instant::now();
        c.begin_pulse(now).unwrap();
        assert!(matches!(c.poll_pulse(now), PulsePoll::Done));
    }

    #[test]
    fn failed_write_is_reported() {
        let line = MockLine::default();
        let nodes = MockNodes::present();
        let mut c = controller(&line, &nodes);
        let t0 = Instant::now();
        c.begin_pulse(t0).unwrap();
        line.fail(true);
        assert!(matches!(c.poll_pulse(t0 + Duration::from_secs(1)), PulsePoll::Failed(_)));
    }

    #[test]
    fn gpio_pin_exports_and_unexports() {
        let base = std::env::temp_dir().join(format!("netd-gpio-{}", std::process::id()));
        fs::create_dir_all(base.join("gpio23")).unwrap();
        {
            let mut pin = GpioPin::export(&base, 23).unwrap();
            assert_eq!(fs::read_to_string(base.join("gpio23/direction")).unwrap(), "low");
            pin.set_level(true).unwrap();
            assert_eq!(fs::read_to_string(base.join("gpio23/value")).unwrap(), "1");
        }
        // Pre-existing export is left in place.
        assert!(!base.join("unexport").exists());
        fs::remove_dir_all(&base).unwrap();
    }
}
