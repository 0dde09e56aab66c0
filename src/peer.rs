//! Master side of the wire protocol.
//!
//! `PeerMaster` owns the SPI initiator and watches the slave's handshake
//! line. Each `poll` services at most one handshake, continuing an active
//! pull before an active push, and otherwise asking the slave what it has
//! to send.

use crate::bus::Level;
use crate::error::{Result, TransportError};
use crate::protocol::{
    decode_status, encode_header, encode_status, AddressWidth, Command, CHUNK_SIZE,
    MAX_HEADER_SIZE, STATUS_SIZE,
};
use embedded_hal::digital::InputPin;
use embedded_hal::spi::{Operation, SpiDevice};
use log::{debug, trace};
use std::collections::VecDeque;

/// What a single `poll` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Handshake not asserted, nothing was sent on the bus.
    Idle,
    /// Pulled this many payload bytes from the slave.
    Pulled(usize),
    /// Pushed this many payload bytes to the slave.
    Pushed(usize),
    /// Read the slave's announced length.
    StatusRead(u32),
}

pub struct PeerMaster<S, H> {
    spi: S,
    handshake: H,
    active: Level,
    width: AddressWidth,
    outgoing: VecDeque<u8>,
    push_remaining: usize,
    pull_remaining: usize,
    received: Vec<u8>,
}

impl<S, H> PeerMaster<S, H>
where
    S: SpiDevice<u8>,
    H: InputPin,
{
    pub fn new(spi: S, handshake: H, active: Level, width: AddressWidth) -> Self {
        PeerMaster {
            spi,
            handshake,
            active,
            width,
            outgoing: VecDeque::new(),
            push_remaining: 0,
            pull_remaining: 0,
            received: Vec::new(),
        }
    }

    /// Command 1: tell the slave how many bytes we are about to push.
    pub fn announce_send(&mut self, len: u32) -> Result<()> {
        let mut header = [0u8; MAX_HEADER_SIZE];
        let n = encode_header(Command::WriteStatus, self.width, &mut header);
        let status = encode_status(len);
        self.spi
            .transaction(&mut [Operation::Write(&header[..n]), Operation::Write(&status)])
            .map_err(bus_error)
    }

    /// Command 2: push one chunk, zero padded to `CHUNK_SIZE`.
    pub fn push_chunk(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > CHUNK_SIZE {
            return Err(TransportError::InvalidArgument("chunk larger than CHUNK_SIZE"));
        }
        let mut header = [0u8; MAX_HEADER_SIZE];
        let n = encode_header(Command::WriteChunk, self.width, &mut header);
        let mut chunk = [0u8; CHUNK_SIZE];
        chunk[..data.len()].copy_from_slice(data);
        self.spi
            .transaction(&mut [Operation::Write(&header[..n]), Operation::Write(&chunk)])
            .map_err(bus_error)
    }

    /// Command 3: pull the chunk the slave has loaded.
    pub fn pull_chunk(&mut self) -> Result<[u8; CHUNK_SIZE]> {
        let mut header = [0u8; MAX_HEADER_SIZE];
        let n = encode_header(Command::ReadChunk, self.width, &mut header);
        let mut chunk = [0u8; CHUNK_SIZE];
        self.spi
            .transaction(&mut [Operation::Write(&header[..n]), Operation::Read(&mut chunk)])
            .map_err(bus_error)?;
        Ok(chunk)
    }

    /// Command 4: read how many bytes the slave wants to send.
    pub fn read_status(&mut self) -> Result<u32> {
        let mut header = [0u8; MAX_HEADER_SIZE];
        let n = encode_header(Command::ReadStatus, self.width, &mut header);
        let mut status = [0u8; STATUS_SIZE];
        self.spi
            .transaction(&mut [Operation::Write(&header[..n]), Operation::Read(&mut status)])
            .map_err(bus_error)?;
        Ok(decode_status(status))
    }

    pub fn handshake_asserted(&mut self) -> Result<bool> {
        let high = self.handshake.is_high().map_err(bus_error)?;
        Ok(high == (self.active == Level::High))
    }

    /// Service one handshake, if the slave is asking for one.
    pub fn poll(&mut self) -> Result<PollOutcome> {
        if !self.handshake_asserted()? {
            return Ok(PollOutcome::Idle);
        }

        let outcome = if self.pull_remaining > 0 {
            let chunk = self.pull_chunk()?;
            let n = self.pull_remaining.min(CHUNK_SIZE);
            self.received.extend_from_slice(&chunk[..n]);
            self.pull_remaining -= n;
            trace!("pulled {} bytes, {} to go", n, self.pull_remaining);
            PollOutcome::Pulled(n)
        } else if self.push_remaining > 0 {
            let n = self.push_remaining.min(CHUNK_SIZE);
            let chunk: Vec<u8> = self.outgoing.drain(..n).collect();
            self.push_chunk(&chunk)?;
            self.push_remaining -= n;
            trace!("pushed {} bytes, {} to go", n, self.push_remaining);
            PollOutcome::Pushed(n)
        } else {
            let status = self.read_status()?;
            self.pull_remaining = status as usize;
            if status > 0 {
                debug!("slave announced {} bytes", status);
            }
            PollOutcome::StatusRead(status)
        };

        self.maybe_announce()?;
        Ok(outcome)
    }

    /// Poll until the slave stops asking or `limit` polls have run.
    ///
    /// Returns the number of polls that moved something on the bus.
    pub fn run_until_idle(&mut self, limit: usize) -> Result<usize> {
        let mut serviced = 0;
        for _ in 0..limit {
            match self.poll()? {
                PollOutcome::Idle => break,
                _ => serviced += 1,
            }
        }
        Ok(serviced)
    }

    /// Queue bytes for the slave. They are announced as soon as no push or
    /// pull is in progress.
    pub fn queue_send(&mut self, data: &[u8]) -> Result<()> {
        self.outgoing.extend(data);
        self.maybe_announce()
    }

    /// Everything pulled from the slave since the last call.
    pub fn take_received(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.received)
    }

    /// Bytes queued for the slave that have not been pushed yet.
    pub fn pending_send(&self) -> usize {
        self.outgoing.len()
    }

    pub fn is_idle(&self) -> bool {
        self.push_remaining == 0 && self.pull_remaining == 0
    }

    fn maybe_announce(&mut self) -> Result<()> {
        if !self.is_idle() || self.outgoing.is_empty() {
            return Ok(());
        }
        let len = u32::try_from(self.outgoing.len()).unwrap_or(u32::MAX);
        self.announce_send(len)?;
        self.push_remaining = len as usize;
        debug!("announced {} bytes to slave", len);
        Ok(())
    }
}

fn bus_error<E: std::fmt::Debug>(e: E) -> TransportError {
    TransportError::Bus(format!("{:?}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::SlaveBus;
    use crate::config::{HandshakeConfig, TransportConfig};
    use crate::device::Transport;
    use crate::sim::{SimBus, SimInput, SimLine, SimOutput, SimPins, SimSpi};
    use std::time::Duration;

    const NO_WAIT: Option<Duration> = Some(Duration::ZERO);

    struct Rig {
        transport: Transport<SimBus, SimOutput>,
        master: PeerMaster<SimSpi, SimInput>,
        bus: SimBus,
    }

    fn rig(out_cap: usize, in_cap: usize, active: Level, width: AddressWidth) -> Rig {
        let bus = SimBus::new();
        let line = SimLine::new();
        let mut pins = SimPins::new(&line);
        let config = TransportConfig {
            handshake: HandshakeConfig {
                pin: 5,
                active_level: active,
            },
            outbound_capacity: out_cap,
            inbound_capacity: in_cap,
            stall_timeout_ms: None,
        };
        let transport = Transport::create(bus.clone(), &mut pins, &config).unwrap();
        let master = PeerMaster::new(bus.master(width), line.input(), active, width);
        Rig {
            transport,
            master,
            bus,
        }
    }

    /// Alternate master polling and slave reads until both sides have
    /// everything they expect.
    fn pump(rig: &mut Rig, to_slave: usize, to_master: usize) -> (Vec<u8>, Vec<u8>) {
        let mut slave_got = Vec::new();
        let mut master_got = Vec::new();
        for _ in 0..200 {
            rig.master.run_until_idle(64).unwrap();
            master_got.extend(rig.master.take_received());

            let mut buf = [0u8; 48];
            let n = rig.transport.read(&mut buf, NO_WAIT);
            slave_got.extend_from_slice(&buf[..n]);

            if slave_got.len() >= to_slave && master_got.len() >= to_master {
                break;
            }
        }
        (slave_got, master_got)
    }

    #[test]
    fn test_idle_without_handshake() {
        let mut rig = rig(64, 64, Level::High, AddressWidth::Bits8);
        assert_eq!(rig.master.poll().unwrap(), PollOutcome::Idle);
        assert!(rig.bus.loaded_chunks().is_empty());
    }

    #[test]
    fn test_slave_to_master() {
        let mut rig = rig(256, 64, Level::High, AddressWidth::Bits8);
        let data: Vec<u8> = (0..150).map(|i| i as u8).collect();
        assert_eq!(rig.transport.write(&data, None), 150);

        assert_eq!(rig.master.poll().unwrap(), PollOutcome::StatusRead(150));
        assert_eq!(rig.master.poll().unwrap(), PollOutcome::Pulled(64));
        let (_, master_got) = pump(&mut rig, 0, 150);
        assert_eq!(master_got, data);
        assert_eq!(rig.bus.loaded_chunks(), vec![64, 64, 22]);
        assert!(rig.master.is_idle());
    }

    #[test]
    fn test_master_to_slave_with_backpressure() {
        let mut rig = rig(64, 64, Level::High, AddressWidth::Bits8);
        let data: Vec<u8> = (0..200).map(|i| (i * 7) as u8).collect();
        rig.master.queue_send(&data).unwrap();
        assert_eq!(rig.transport.state().remaining_to_receive, 200);

        // One chunk fills the slave; the master must wait for a read.
        assert_eq!(rig.master.run_until_idle(64).unwrap(), 1);
        assert!(rig.transport.state().is_blocking_receive);

        let (slave_got, _) = pump(&mut rig, 200, 0);
        assert_eq!(slave_got, data);
        assert_eq!(rig.master.pending_send(), 0);
    }

    #[test]
    fn test_full_duplex_exchange() {
        let mut rig = rig(256, 128, Level::High, AddressWidth::Bits8);
        let down: Vec<u8> = (0..150).map(|i| i as u8).collect();
        let up: Vec<u8> = (0..100).map(|i| 255 - i as u8).collect();

        assert_eq!(rig.transport.write(&down, None), 150);
        rig.master.queue_send(&up).unwrap();

        let (slave_got, master_got) = pump(&mut rig, up.len(), down.len());
        assert_eq!(slave_got, up);
        assert_eq!(master_got, down);
    }

    #[test]
    fn test_active_low_wide_address() {
        let mut rig = rig(128, 128, Level::Low, AddressWidth::Bits32);
        assert!(!rig.master.handshake_asserted().unwrap());

        assert_eq!(rig.transport.write(b"hello", None), 5);
        assert!(rig.master.handshake_asserted().unwrap());
        rig.master.queue_send(b"world").unwrap();

        let (slave_got, master_got) = pump(&mut rig, 5, 5);
        assert_eq!(slave_got, b"world".to_vec());
        assert_eq!(master_got, b"hello".to_vec());
    }

    #[test]
    fn test_push_chunk_rejects_oversize() {
        let mut rig = rig(64, 64, Level::High, AddressWidth::Bits8);
        let result = rig.master.push_chunk(&[0; CHUNK_SIZE + 1]);
        assert!(matches!(result, Err(TransportError::InvalidArgument(_))));
    }

    #[test]
    fn test_raw_commands() {
        let mut rig = rig(64, 64, Level::High, AddressWidth::Bits8);
        rig.master.announce_send(3).unwrap();
        assert_eq!(rig.transport.state().remaining_to_receive, 3);

        rig.master.push_chunk(b"abc").unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(rig.transport.read(&mut buf, NO_WAIT), 3);
        assert_eq!(&buf[..3], b"abc");

        rig.bus.with_events_masked(|regs| regs.set_outbound_status(9));
        assert_eq!(rig.master.read_status().unwrap(), 9);
    }
}
