//! Seams to the hardware collaborators: the slave bus peripheral and the
//! digital output that carries the handshake signal.

use crate::protocol::{Events, CHUNK_SIZE};
use embedded_hal::digital::OutputPin;
use log::trace;
use serde::{Deserialize, Serialize};

/// Register file of the slave peripheral, as seen while events are masked.
pub trait SlaveRegisters {
    /// Load the next chunk the peer will pull (one data-chunk transaction).
    fn load_outbound_chunk(&mut self, data: &[u8]);

    /// Payload of the last chunk the peer pushed.
    fn inbound_chunk(&self) -> &[u8; CHUNK_SIZE];

    /// Publish our pending-send length for the peer to read.
    fn set_outbound_status(&mut self, len: u32);

    /// Length most recently announced by the peer.
    fn inbound_status(&self) -> u32;
}

/// Completion handler installed on the bus.
///
/// Runs in interrupt context. Returns true when a blocked task was woken
/// and the bus should yield to the scheduler on exit.
pub type CompletionHandler = Box<dyn FnMut(Events, &mut dyn SlaveRegisters) -> bool + Send>;

/// The slave bus peripheral.
pub trait SlaveBus: Send {
    fn register_handler(&mut self, handler: CompletionHandler);

    fn unregister_handler(&mut self);

    /// Run `f` against the register file with completion events held off.
    fn with_events_masked<R>(&self, f: impl FnOnce(&mut dyn SlaveRegisters) -> R) -> R;
}

/// Source of digital outputs, addressed by pin number.
pub trait PinBank {
    type Output: OutputPin + Send + 'static;

    /// Returns `None` when `pin` cannot be used as a digital output.
    fn output(&mut self, pin: u8) -> Option<Self::Output>;
}

/// Electrical level of a digital line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    High,
    Low,
}

impl Level {
    pub fn inverse(self) -> Level {
        match self {
            Level::High => Level::Low,
            Level::Low => Level::High,
        }
    }
}

/// Handshake output with configurable polarity.
#[derive(Debug)]
pub struct Handshake<P> {
    pin: P,
    active: Level,
    asserted: bool,
}

impl<P: OutputPin> Handshake<P> {
    /// Takes ownership of `pin` and drives it to the idle level.
    pub fn new(pin: P, active: Level) -> Self {
        let mut handshake = Handshake {
            pin,
            active,
            asserted: false,
        };
        handshake.drive(active.inverse());
        handshake
    }

    /// Signal "service needed". Never blocks.
    pub fn assert(&mut self) {
        self.drive(self.active);
        self.asserted = true;
    }

    pub fn release(&mut self) {
        self.drive(self.active.inverse());
        self.asserted = false;
    }

    pub fn is_asserted(&self) -> bool {
        self.asserted
    }

    fn drive(&mut self, level: Level) {
        let result = match level {
            Level::High => self.pin.set_high(),
            Level::Low => self.pin.set_low(),
        };
        // Called from interrupt context, so a failed write is dropped.
        if let Err(e) = result {
            trace!("handshake pin write failed: {:?}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimLine;

    #[test]
    fn test_handshake_idles_on_creation() {
        let line = SimLine::new();
        let _handshake = Handshake::new(line.output(), Level::High);
        assert!(!line.is_high());

        let line = SimLine::new();
        let _handshake = Handshake::new(line.output(), Level::Low);
        assert!(line.is_high());
    }

    #[test]
    fn test_handshake_active_low() {
        let line = SimLine::new();
        let mut handshake = Handshake::new(line.output(), Level::Low);

        handshake.assert();
        assert!(handshake.is_asserted());
        assert!(!line.is_high());

        handshake.release();
        assert!(!handshake.is_asserted());
        assert!(line.is_high());
    }

    #[test]
    fn test_level_inverse() {
        assert_eq!(Level::High.inverse(), Level::Low);
        assert_eq!(Level::Low.inverse(), Level::High);
    }
}
