//! Slave-side transport device.
//!
//! The device owns two bounded byte queues and the handshake output. The
//! bus completion handler moves chunks between the queues and the slave
//! register file; tasks push and pull bytes through `write` and `read`.
//!
//! Lock order is always bus (events masked) before link state, in both the
//! handler and task paths.

use crate::bus::{CompletionHandler, Handshake, PinBank, SlaveBus, SlaveRegisters};
use crate::config::TransportConfig;
use crate::error::{Result, TransportError};
use crate::protocol::{Event, Events, CHUNK_SIZE};
use crate::queue::{deadline_after, ByteQueue, IsrQueue};
use embedded_hal::digital::OutputPin;
use log::{debug, info, trace, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Diagnostic observer, called after every completion event.
pub type Observer = Box<dyn FnMut(Events) + Send>;

/// Running counters for a device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub chunks_sent: usize,
    pub chunks_received: usize,
    pub announcements: usize,
    pub handshakes: usize,
    pub stall_aborts: usize,
}

/// Snapshot of the flags and counters that drive the state machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportState {
    pub is_sending: bool,
    pub remaining_to_send: usize,
    pub remaining_to_receive: usize,
    pub is_blocking_receive: bool,
    pub handshake_asserted: bool,
    pub outbound_len: usize,
    pub inbound_len: usize,
}

struct LinkState<P> {
    handshake: Handshake<P>,
    is_sending: bool,
    remaining_to_send: usize,
    remaining_to_receive: usize,
    is_blocking_receive: bool,
    observer: Option<Observer>,
    last_progress: Instant,
    stats: TransportStats,
}

impl<P: OutputPin> LinkState<P> {
    fn new(handshake: Handshake<P>) -> Self {
        LinkState {
            handshake,
            is_sending: false,
            remaining_to_send: 0,
            remaining_to_receive: 0,
            is_blocking_receive: false,
            observer: None,
            last_progress: Instant::now(),
            stats: TransportStats::default(),
        }
    }

    fn assert_handshake(&mut self) {
        self.handshake.assert();
        self.stats.handshakes += 1;
    }

    /// Publish `pending` bytes as the next outbound transfer.
    fn announce(&mut self, regs: &mut dyn SlaveRegisters, pending: usize) {
        debug_assert!(!self.is_sending);
        regs.set_outbound_status(u32::try_from(pending).unwrap_or(u32::MAX));
        self.remaining_to_send = pending;
        self.is_sending = true;
        self.last_progress = Instant::now();
        self.stats.announcements += 1;
    }

    /// Pop the next chunk of the current transfer and load it for the peer.
    fn load_chunk(&mut self, regs: &mut dyn SlaveRegisters, outbound: IsrQueue<'_>) -> (usize, bool) {
        let mut chunk = [0u8; CHUNK_SIZE];
        let want = self.remaining_to_send.min(CHUNK_SIZE);
        let (n, woken) = outbound.pop(&mut chunk[..want]);
        if n > 0 {
            regs.load_outbound_chunk(&chunk[..n]);
            self.remaining_to_send -= n;
            self.stats.chunks_sent += 1;
        }
        (n, woken)
    }

    fn snapshot(&self, outbound: &ByteQueue, inbound: &ByteQueue) -> TransportState {
        TransportState {
            is_sending: self.is_sending,
            remaining_to_send: self.remaining_to_send,
            remaining_to_receive: self.remaining_to_receive,
            is_blocking_receive: self.is_blocking_receive,
            handshake_asserted: self.handshake.is_asserted(),
            outbound_len: outbound.len(),
            inbound_len: inbound.len(),
        }
    }
}

struct Shared<P> {
    outbound: ByteQueue,
    inbound: ByteQueue,
    link: Mutex<LinkState<P>>,
}

impl<P: OutputPin> Shared<P> {
    /// Completion handler body. Runs in interrupt context and never blocks.
    ///
    /// Returns true when a queue operation woke a task.
    fn on_completion(&self, events: Events, regs: &mut dyn SlaveRegisters) -> bool {
        let outbound = self.outbound.isr();
        let inbound = self.inbound.isr();
        let mut link = self.link.lock();

        if events.is_empty() {
            // No recognised sub-event.
            trace!("completion with no recognised sub-event");
            if let Some(observer) = link.observer.as_mut() {
                observer(events);
            }
            return false;
        }

        // The peer has serviced the last request.
        link.handshake.release();
        link.last_progress = Instant::now();

        let mut request = false;
        let mut woken = false;

        for event in events.in_order() {
            match event {
                Event::OutboundChunkDone => {
                    if link.remaining_to_send == 0 {
                        link.is_sending = false;
                        let pending = outbound.len();
                        if pending > 0 {
                            link.announce(regs, pending);
                            request |= !link.is_blocking_receive;
                        } else {
                            regs.set_outbound_status(0);
                        }
                    } else {
                        let (sent, w) = link.load_chunk(regs, outbound);
                        woken |= w;
                        request |= sent > 0;
                    }
                }
                Event::InboundChunkDone => {
                    let n = link.remaining_to_receive.min(CHUNK_SIZE);
                    let (pushed, w) = inbound.push(&regs.inbound_chunk()[..n]);
                    woken |= w;
                    if pushed < n {
                        trace!("inbound queue overflow, dropped {} bytes", n - pushed);
                    }
                    link.remaining_to_receive -= n;
                    link.stats.chunks_received += 1;

                    if inbound.free() >= CHUNK_SIZE {
                        request = true;
                    } else if link.remaining_to_receive > 0 {
                        link.is_blocking_receive = true;
                    } else {
                        // The peer must announce before pushing again, so
                        // it is safe to call it back for our own data.
                        request |= link.is_sending && !link.is_blocking_receive;
                    }
                }
                Event::PeerAnnouncedLength => {
                    link.remaining_to_receive = regs.inbound_status() as usize;
                    if !link.is_sending && !outbound.is_empty() {
                        link.announce(regs, outbound.len());
                    }

                    let receiving = link.remaining_to_receive > 0;
                    if receiving && inbound.free() < CHUNK_SIZE {
                        link.is_blocking_receive = true;
                    }
                    if !link.is_blocking_receive && (receiving || link.is_sending) {
                        request = true;
                    }
                }
                Event::PeerReadLength => {
                    let (sent, w) = link.load_chunk(regs, outbound);
                    woken |= w;
                    request |= sent > 0;
                }
            }
        }

        if request {
            link.assert_handshake();
        }
        if let Some(observer) = link.observer.as_mut() {
            observer(events);
        }
        woken
    }
}

/// Queues and pin, allocated before anything is registered with the bus.
struct Provision<P> {
    handshake: Handshake<P>,
    outbound: ByteQueue,
    inbound: ByteQueue,
}

impl<P: OutputPin> Provision<P> {
    fn new<G>(pins: &mut G, config: &TransportConfig) -> Result<Self>
    where
        G: PinBank<Output = P>,
    {
        if config.outbound_capacity == 0 {
            return Err(TransportError::InvalidArgument("outbound capacity must be non-zero"));
        }
        if config.inbound_capacity == 0 {
            return Err(TransportError::InvalidArgument("inbound capacity must be non-zero"));
        }
        if config.inbound_capacity < CHUNK_SIZE {
            warn!(
                "inbound capacity {} is below one chunk ({}), inbound flow will stall",
                config.inbound_capacity, CHUNK_SIZE
            );
        }

        let pin = pins
            .output(config.handshake.pin)
            .ok_or(TransportError::InvalidArgument("handshake pin is not a digital output"))?;

        // Dropping on error releases whatever was already allocated.
        let outbound = ByteQueue::with_capacity(config.outbound_capacity)?;
        let inbound = ByteQueue::with_capacity(config.inbound_capacity)?;

        Ok(Provision {
            handshake: Handshake::new(pin, config.handshake.active_level),
            outbound,
            inbound,
        })
    }
}

/// A live transport device bound to a bus.
///
/// Owning the bus makes a second concurrent device impossible; `destroy`
/// hands the bus back. Dropping the device detaches it the same way.
pub struct Transport<B: SlaveBus, P: OutputPin> {
    // Only `None` once `destroy` or `drop` has detached the device.
    bus: Option<B>,
    shared: Arc<Shared<P>>,
    stall_timeout: Option<Duration>,
}

impl<B, P> Transport<B, P>
where
    B: SlaveBus,
    P: OutputPin + Send + 'static,
{
    /// Allocate the queues, claim the handshake pin and install the
    /// completion handler on `bus`.
    pub fn create<G>(bus: B, pins: &mut G, config: &TransportConfig) -> Result<Self>
    where
        G: PinBank<Output = P>,
    {
        let provision = Provision::new(pins, config)?;
        Ok(Self::attach(bus, provision, config))
    }

    fn attach(mut bus: B, provision: Provision<P>, config: &TransportConfig) -> Self {
        let shared = Arc::new(Shared {
            outbound: provision.outbound,
            inbound: provision.inbound,
            link: Mutex::new(LinkState::new(provision.handshake)),
        });

        let isr_shared = Arc::clone(&shared);
        let handler: CompletionHandler =
            Box::new(move |events: Events, regs: &mut dyn SlaveRegisters| {
                isr_shared.on_completion(events, regs)
            });
        bus.register_handler(handler);

        info!(
            "transport created: handshake pin {} active {:?}, outbound {} bytes, inbound {} bytes",
            config.handshake.pin,
            config.handshake.active_level,
            config.outbound_capacity,
            config.inbound_capacity
        );

        Transport {
            bus: Some(bus),
            shared,
            stall_timeout: config.stall_timeout_ms.map(Duration::from_millis),
        }
    }

    /// Unregister the handler, idle the handshake, release the queues and
    /// return the bus.
    pub fn destroy(mut self) -> Result<B> {
        let mut bus = self
            .bus
            .take()
            .ok_or(TransportError::InvalidState("transport already detached"))?;
        detach(&mut bus, &self.shared);
        Ok(bus)
    }

    /// Pull up to `buf.len()` bytes from the inbound queue.
    ///
    /// Waits up to `timeout` (`None` waits forever) for the first byte and
    /// returns 0 if none arrives. Resumes a peer held off by backpressure
    /// once a full chunk of room is free again.
    pub fn read(&self, buf: &mut [u8], timeout: Option<Duration>) -> usize {
        let n = self.shared.inbound.recv_timeout(buf, timeout);

        self.masked(|_| {
            let mut link = self.shared.link.lock();
            if link.is_blocking_receive && self.shared.inbound.free() >= CHUNK_SIZE {
                link.is_blocking_receive = false;
                link.assert_handshake();
                debug!("inbound room recovered, resuming peer");
            }
        });

        if n == 0 {
            self.abort_if_stalled();
        }
        n
    }

    /// Queue `data` for the peer, waiting up to `timeout` for room.
    ///
    /// When no transfer is in flight the queued bytes are announced right
    /// away. Otherwise they ride along until the current transfer drains.
    /// Returns the number of bytes accepted, short only on timeout.
    pub fn write(&self, data: &[u8], timeout: Option<Duration>) -> usize {
        if data.is_empty() {
            return 0;
        }

        let deadline = deadline_after(timeout);
        let mut total = 0;
        loop {
            total += self.push_and_arm(&data[total..]);
            if total == data.len() || !self.shared.outbound.wait_for_room(deadline) {
                break;
            }
        }

        if total < data.len() {
            self.abort_if_stalled();
        }
        total
    }

    /// Install or clear the diagnostic observer.
    pub fn set_observer(&self, observer: Option<Observer>) {
        self.masked(|_| {
            self.shared.link.lock().observer = observer;
        });
    }

    pub fn state(&self) -> TransportState {
        self.masked(|_| {
            let link = self.shared.link.lock();
            link.snapshot(&self.shared.outbound, &self.shared.inbound)
        })
    }

    pub fn stats(&self) -> TransportStats {
        self.masked(|_| self.shared.link.lock().stats)
    }

    pub fn outbound_capacity(&self) -> usize {
        self.shared.outbound.capacity()
    }

    pub fn inbound_capacity(&self) -> usize {
        self.shared.inbound.capacity()
    }

    /// Push what fits without waiting and announce it if the link is idle.
    fn push_and_arm(&self, data: &[u8]) -> usize {
        let shared = &self.shared;
        self.masked(|regs| {
            let mut link = shared.link.lock();
            let (n, _) = shared.outbound.isr().push(data);
            if !link.is_sending && !shared.outbound.is_empty() {
                link.announce(regs, shared.outbound.len());
                // A push from the peer now would overflow the inbound queue.
                if !link.is_blocking_receive {
                    link.assert_handshake();
                }
            }
            n
        })
    }

    /// Reset both directions when an announced transfer has seen no bus
    /// activity for longer than the stall timeout.
    fn abort_if_stalled(&self) {
        let Some(limit) = self.stall_timeout else {
            return;
        };

        self.masked(|regs| {
            let mut link = self.shared.link.lock();
            let in_flight = link.is_sending || link.remaining_to_receive > 0;
            if !in_flight || link.last_progress.elapsed() <= limit {
                return;
            }

            warn!(
                "transfer stalled for {:?}, aborting ({} bytes unsent, {} bytes not received)",
                link.last_progress.elapsed(),
                link.remaining_to_send,
                link.remaining_to_receive
            );
            link.is_sending = false;
            link.remaining_to_send = 0;
            link.remaining_to_receive = 0;
            link.is_blocking_receive = false;
            link.handshake.release();
            link.last_progress = Instant::now();
            link.stats.stall_aborts += 1;
            regs.set_outbound_status(0);
        });
    }

    /// Run `f` with completion events held off.
    fn masked<R: Default>(&self, f: impl FnOnce(&mut dyn SlaveRegisters) -> R) -> R {
        match &self.bus {
            Some(bus) => bus.with_events_masked(f),
            None => R::default(),
        }
    }
}

impl<B: SlaveBus, P: OutputPin> Drop for Transport<B, P> {
    fn drop(&mut self) {
        if let Some(mut bus) = self.bus.take() {
            detach(&mut bus, &self.shared);
        }
    }
}

/// Stop event delivery, then drive the handshake idle and withdraw any
/// announced length so the peer stops servicing us.
fn detach<B: SlaveBus, P: OutputPin>(bus: &mut B, shared: &Shared<P>) {
    bus.unregister_handler();
    bus.with_events_masked(|regs| {
        let mut link = shared.link.lock();
        link.handshake.release();
        link.is_sending = false;
        regs.set_outbound_status(0);
    });
    info!("transport destroyed");
}

/// Process-wide owner of the bus that hosts at most one device.
///
/// `create` on an occupied slot tears the old device down first.
pub struct TransportSlot<B: SlaveBus, P: OutputPin> {
    bus: Option<B>,
    device: Option<Transport<B, P>>,
}

impl<B, P> TransportSlot<B, P>
where
    B: SlaveBus,
    P: OutputPin + Send + 'static,
{
    pub fn new(bus: B) -> Self {
        TransportSlot {
            bus: Some(bus),
            device: None,
        }
    }

    pub fn create<G>(&mut self, pins: &mut G, config: &TransportConfig) -> Result<&Transport<B, P>>
    where
        G: PinBank<Output = P>,
    {
        if let Some(old) = self.device.take() {
            info!("transport already exists, tearing it down");
            self.bus = Some(old.destroy()?);
        }

        let bus = self
            .bus
            .take()
            .ok_or(TransportError::InvalidState("bus is not available"))?;

        match Provision::new(pins, config) {
            Ok(provision) => Ok(&*self.device.insert(Transport::attach(bus, provision, config))),
            Err(e) => {
                self.bus = Some(bus);
                Err(e)
            }
        }
    }

    pub fn destroy(&mut self) -> Result<()> {
        let device = self
            .device
            .take()
            .ok_or(TransportError::InvalidState("no transport device exists"))?;
        self.bus = Some(device.destroy()?);
        Ok(())
    }

    pub fn get(&self) -> Option<&Transport<B, P>> {
        self.device.as_ref()
    }
}
