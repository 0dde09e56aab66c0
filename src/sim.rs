//! In-memory stand-ins for the bus peripheral and the handshake line.
//!
//! `SimBus` holds the slave register file and fires completion events
//! synchronously whenever the simulated master touches it, either through
//! the step methods (`peer_*`) or through `SimSpi`, which decodes real
//! wire transactions. Used by the tests and handy for bring-up without
//! hardware.

use crate::bus::{CompletionHandler, PinBank, SlaveBus, SlaveRegisters};
use crate::protocol::{
    decode_status, encode_status, AddressWidth, Command, Event, Events, CHUNK_SIZE, STATUS_SIZE,
};
use embedded_hal::digital::{ErrorType as PinErrorType, InputPin, OutputPin};
use embedded_hal::spi::{ErrorType as SpiErrorType, Operation, SpiDevice};
use log::trace;
use parking_lot::Mutex;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// A single digital line shared between an output and any number of inputs.
#[derive(Debug, Clone, Default)]
pub struct SimLine {
    inner: Arc<LineState>,
}

#[derive(Debug, Default)]
struct LineState {
    high: AtomicBool,
    rising_edges: AtomicUsize,
}

impl SimLine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn output(&self) -> SimOutput {
        SimOutput { line: self.clone() }
    }

    pub fn input(&self) -> SimInput {
        SimInput { line: self.clone() }
    }

    pub fn is_high(&self) -> bool {
        self.inner.high.load(Ordering::SeqCst)
    }

    /// Low-to-high transitions seen so far.
    pub fn rising_edges(&self) -> usize {
        self.inner.rising_edges.load(Ordering::SeqCst)
    }

    fn set(&self, high: bool) {
        let was_high = self.inner.high.swap(high, Ordering::SeqCst);
        if high && !was_high {
            self.inner.rising_edges.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[derive(Debug)]
pub struct SimOutput {
    line: SimLine,
}

impl PinErrorType for SimOutput {
    type Error = Infallible;
}

impl OutputPin for SimOutput {
    fn set_low(&mut self) -> Result<(), Infallible> {
        self.line.set(false);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Infallible> {
        self.line.set(true);
        Ok(())
    }
}

#[derive(Debug)]
pub struct SimInput {
    line: SimLine,
}

impl PinErrorType for SimInput {
    type Error = Infallible;
}

impl InputPin for SimInput {
    fn is_high(&mut self) -> Result<bool, Infallible> {
        Ok(self.line.is_high())
    }

    fn is_low(&mut self) -> Result<bool, Infallible> {
        Ok(!self.line.is_high())
    }
}

/// Pin bank with GPIO 0..=16, of which 12..=15 belong to the bus itself.
#[derive(Debug, Clone)]
pub struct SimPins {
    line: SimLine,
}

impl SimPins {
    pub const MAX_PIN: u8 = 16;

    /// Every output handed out drives `line`.
    pub fn new(line: &SimLine) -> Self {
        SimPins { line: line.clone() }
    }
}

impl PinBank for SimPins {
    type Output = SimOutput;

    fn output(&mut self, pin: u8) -> Option<SimOutput> {
        match pin {
            12..=15 => None,
            p if p > Self::MAX_PIN => None,
            _ => Some(self.line.output()),
        }
    }
}

/// Slave register file.
#[derive(Debug)]
pub struct SimRegisters {
    outbound_chunk: [u8; CHUNK_SIZE],
    outbound_loaded: usize,
    inbound_chunk: [u8; CHUNK_SIZE],
    outbound_status: u32,
    inbound_status: u32,
    loaded_sizes: Vec<usize>,
}

impl SimRegisters {
    fn new() -> Self {
        SimRegisters {
            outbound_chunk: [0; CHUNK_SIZE],
            outbound_loaded: 0,
            inbound_chunk: [0; CHUNK_SIZE],
            outbound_status: 0,
            inbound_status: 0,
            loaded_sizes: Vec::new(),
        }
    }
}

impl SlaveRegisters for SimRegisters {
    fn load_outbound_chunk(&mut self, data: &[u8]) {
        let n = data.len().min(CHUNK_SIZE);
        self.outbound_chunk = [0; CHUNK_SIZE];
        self.outbound_chunk[..n].copy_from_slice(&data[..n]);
        self.outbound_loaded = n;
        self.loaded_sizes.push(n);
    }

    fn inbound_chunk(&self) -> &[u8; CHUNK_SIZE] {
        &self.inbound_chunk
    }

    fn set_outbound_status(&mut self, len: u32) {
        self.outbound_status = len;
    }

    fn inbound_status(&self) -> u32 {
        self.inbound_status
    }
}

struct SimCore {
    regs: SimRegisters,
    handler: Option<CompletionHandler>,
    yields: usize,
}

impl SimCore {
    fn fire(&mut self, events: Events) {
        let SimCore {
            regs,
            handler,
            yields,
        } = self;
        if let Some(handler) = handler.as_mut() {
            if handler(events, regs) {
                *yields += 1;
            }
        }
    }
}

/// Simulated slave bus peripheral.
#[derive(Clone)]
pub struct SimBus {
    core: Arc<Mutex<SimCore>>,
}

impl Default for SimBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SimBus {
    pub fn new() -> Self {
        SimBus {
            core: Arc::new(Mutex::new(SimCore {
                regs: SimRegisters::new(),
                handler: None,
                yields: 0,
            })),
        }
    }

    /// SPI master wired to this bus.
    pub fn master(&self, width: AddressWidth) -> SimSpi {
        SimSpi {
            bus: self.clone(),
            width,
        }
    }

    pub fn has_handler(&self) -> bool {
        self.core.lock().handler.is_some()
    }

    /// Deliver a raw completion bitmask, as a misbehaving peripheral might.
    pub fn fire_raw(&self, raw: u32) {
        self.core.lock().fire(Events::from_bits_truncate(raw));
    }

    /// Place a chunk in the inbound buffer without raising an event.
    pub fn stage_inbound_chunk(&self, data: &[u8]) {
        let mut core = self.core.lock();
        let n = data.len().min(CHUNK_SIZE);
        core.regs.inbound_chunk = [0; CHUNK_SIZE];
        core.regs.inbound_chunk[..n].copy_from_slice(&data[..n]);
    }

    /// Set the inbound status register without raising an event.
    pub fn stage_inbound_status(&self, len: u32) {
        self.core.lock().regs.inbound_status = len;
    }

    /// Command 1: announce the master's pending-send length.
    pub fn peer_write_status(&self, len: u32) {
        self.stage_inbound_status(len);
        self.core.lock().fire(Event::PeerAnnouncedLength.into());
    }

    /// Command 2: deposit a chunk into the slave's inbound buffer.
    pub fn peer_write_chunk(&self, data: &[u8]) {
        self.stage_inbound_chunk(data);
        self.core.lock().fire(Event::InboundChunkDone.into());
    }

    /// Command 3: pull the loaded chunk. Returns the bytes the slave loaded.
    pub fn peer_read_chunk(&self) -> Vec<u8> {
        let mut core = self.core.lock();
        let chunk = core.regs.outbound_chunk[..core.regs.outbound_loaded].to_vec();
        core.regs.outbound_loaded = 0;
        core.fire(Event::OutboundChunkDone.into());
        chunk
    }

    /// Command 4: read the slave's announced outbound length.
    pub fn peer_read_status(&self) -> u32 {
        let mut core = self.core.lock();
        let status = core.regs.outbound_status;
        core.fire(Event::PeerReadLength.into());
        status
    }

    /// Sizes of every chunk the slave has loaded, in order.
    pub fn loaded_chunks(&self) -> Vec<usize> {
        self.core.lock().regs.loaded_sizes.clone()
    }

    pub fn outbound_status(&self) -> u32 {
        self.core.lock().regs.outbound_status
    }

    /// Completion events after which the handler asked for a context switch.
    pub fn yields(&self) -> usize {
        self.core.lock().yields
    }
}

impl SlaveBus for SimBus {
    fn register_handler(&mut self, handler: CompletionHandler) {
        self.core.lock().handler = Some(handler);
    }

    fn unregister_handler(&mut self) {
        self.core.lock().handler = None;
    }

    fn with_events_masked<R>(&self, f: impl FnOnce(&mut dyn SlaveRegisters) -> R) -> R {
        let mut core = self.core.lock();
        f(&mut core.regs)
    }
}

/// `SpiDevice` view of a `SimBus`, decoding the wire commands.
#[derive(Clone)]
pub struct SimSpi {
    bus: SimBus,
    width: AddressWidth,
}

impl SpiErrorType for SimSpi {
    type Error = Infallible;
}

impl SpiDevice<u8> for SimSpi {
    fn transaction(&mut self, operations: &mut [Operation<'_, u8>]) -> Result<(), Infallible> {
        let mut written = Vec::new();
        for op in operations.iter() {
            match op {
                Operation::Write(data) => written.extend_from_slice(data),
                Operation::Transfer(_, data) => written.extend_from_slice(data),
                Operation::TransferInPlace(data) => written.extend_from_slice(data),
                Operation::Read(_) | Operation::DelayNs(_) => {}
            }
        }

        let header_len = 1 + self.width.bytes();
        let Some(command) = written.first().copied().and_then(Command::from_code) else {
            trace!("sim bus ignoring transaction without a known command");
            return Ok(());
        };
        let body = written.get(header_len..).unwrap_or(&[]);

        let response = match command {
            Command::WriteStatus => {
                let mut status = [0u8; STATUS_SIZE];
                let n = body.len().min(STATUS_SIZE);
                status[..n].copy_from_slice(&body[..n]);
                self.bus.peer_write_status(decode_status(status));
                Vec::new()
            }
            Command::WriteChunk => {
                self.bus.peer_write_chunk(body);
                Vec::new()
            }
            Command::ReadChunk => {
                let mut chunk = self.bus.peer_read_chunk();
                chunk.resize(CHUNK_SIZE, 0);
                chunk
            }
            Command::ReadStatus => encode_status(self.bus.peer_read_status()).to_vec(),
        };

        let mut cursor = response.iter().copied();
        for op in operations.iter_mut() {
            match op {
                Operation::Read(buf) | Operation::Transfer(buf, _) => {
                    for byte in buf.iter_mut() {
                        *byte = cursor.next().unwrap_or(0);
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}
