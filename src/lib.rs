//! Full-duplex byte streams over an SPI slave with a handshake line.
//!
//! The slave side (`device::Transport`) splits arbitrary writes into
//! 64-byte chunks, announces pending lengths through a status register and
//! asks the master for service with a single GPIO. The master side
//! (`peer::PeerMaster`) drives the same protocol from the initiator.

pub mod bus;
pub mod config;
pub mod device;
pub mod error;
pub mod peer;
pub mod protocol;
pub mod queue;
pub mod sim;

pub use bus::{Handshake, Level, PinBank, SlaveBus, SlaveRegisters};
pub use config::TransportConfig;
pub use device::{Transport, TransportSlot, TransportState, TransportStats};
pub use error::{Result, TransportError};
pub use peer::{PeerMaster, PollOutcome};
pub use protocol::{Event, Events, CHUNK_SIZE};
