//! Emergency-stop relay.
//!
//! Firing commands the relay instrument `true` and latches. A latched relay
//! only releases on a forced reset. A disabled stop logs and ignores every
//! request.

use super::vinstrument::VirtualInstrument;
use crate::error::AppResult;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Relay that cuts power to the apparatus.
#[derive(Debug)]
pub struct EmergencyStop {
    relay: Arc<VirtualInstrument>,
    enabled: bool,
    fired: AtomicBool,
}

impl EmergencyStop {
    /// Wrap the instrument driving the relay.
    pub fn new(relay: Arc<VirtualInstrument>, enabled: bool) -> Self {
        info!(relay = %relay.uid(), enabled, "Emergency stop configured");
        Self {
            relay,
            enabled,
            fired: AtomicBool::new(false),
        }
    }

    /// Whether requests reach the relay.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Whether the relay fired and has not been reset since.
    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Instrument driving the relay.
    pub fn relay(&self) -> &Arc<VirtualInstrument> {
        &self.relay
    }

    /// Fire the relay. Returns `false` if the stop is disabled.
    pub fn fire(&self) -> AppResult<bool> {
        if !self.enabled {
            warn!(relay = %self.relay.uid(), "Emergency stop is disabled, ignoring fire request");
            return Ok(false);
        }
        self.relay.command(true)?;
        self.fired.store(true, Ordering::SeqCst);
        error!(relay = %self.relay.uid(), "Emergency stop fired");
        Ok(true)
    }

    /// Release the relay. A fired relay needs `force`. Returns whether the
    /// relay was released.
    pub fn reset(&self, force: bool) -> AppResult<bool> {
        if !self.enabled {
            warn!(relay = %self.relay.uid(), "Emergency stop is disabled, ignoring reset request");
            return Ok(false);
        }
        if self.is_fired() && !force {
            warn!(relay = %self.relay.uid(), "Emergency stop has fired, ignoring unforced reset");
            return Ok(false);
        }
        self.relay.command(false)?;
        self.fired.store(false, Ordering::SeqCst);
        info!(relay = %self.relay.uid(), "Emergency stop reset");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::{
        Arguments, Binding, InstrumentContext, InstrumentKind, PhysicalInstrument,
        SimulatedInstrument,
    };
    use crate::value::Value;

    fn relay(driver: &Arc<SimulatedInstrument>) -> Arc<VirtualInstrument> {
        let driver: Arc<dyn PhysicalInstrument> = driver.clone();
        Arc::new(VirtualInstrument::new(
            "estop_relay",
            "E-stop relay",
            InstrumentKind::CommandDriven {
                setter: Binding::new(driver.clone(), "tripped", Arguments::new()),
                getter: Binding::new(driver, "tripped", Arguments::new()),
            },
            InstrumentContext::default(),
        ))
    }

    #[test]
    fn fired_relay_needs_forced_reset() {
        let driver = Arc::new(SimulatedInstrument::new("relay").with_channel("tripped", false));
        let estop = EmergencyStop::new(relay(&driver), true);

        assert!(estop.fire().unwrap());
        assert!(estop.is_fired());
        assert_eq!(estop.relay().value(), Value::Bool(true));

        assert!(!estop.reset(false).unwrap());
        assert!(estop.is_fired());
        assert!(estop.reset(true).unwrap());
        assert!(!estop.is_fired());
        assert_eq!(estop.relay().value(), Value::Bool(false));

        // An unfired relay resets without force.
        assert!(estop.reset(false).unwrap());
        assert_eq!(driver.writes().len(), 3);
    }

    #[test]
    fn disabled_stop_ignores_requests() {
        let driver = Arc::new(SimulatedInstrument::new("relay").with_channel("tripped", false));
        let estop = EmergencyStop::new(relay(&driver), false);
        assert!(!estop.fire().unwrap());
        assert!(!estop.is_fired());
        assert!(!estop.reset(true).unwrap());
        assert!(driver.writes().is_empty());
    }
}
