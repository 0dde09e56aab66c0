//! Wire protocol shared by the slave transport and the master peer.
//!
//! Every transaction carries a one byte command, an address field that is
//! always zero, and either a status word or a payload chunk of at most
//! `CHUNK_SIZE` bytes.

use serde::{Deserialize, Serialize};

/// Largest payload the bus peripheral moves in one transaction.
pub const CHUNK_SIZE: usize = 64;

/// Size of a status field on the wire.
pub const STATUS_SIZE: usize = 4;

/// Transaction command codes, named from the initiator's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Write our pending-send length into the responder's inbound status.
    WriteStatus = 1,
    /// Push a chunk into the responder's inbound buffer.
    WriteChunk = 2,
    /// Pull a chunk from the responder's outbound buffer.
    ReadChunk = 3,
    /// Read the responder's announced outbound length.
    ReadStatus = 4,
}

impl Command {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Command::WriteStatus),
            2 => Some(Command::WriteChunk),
            3 => Some(Command::ReadChunk),
            4 => Some(Command::ReadStatus),
            _ => None,
        }
    }
}

/// Width of the (unused) address field, which depends on the deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressWidth {
    #[default]
    Bits8,
    Bits32,
}

impl AddressWidth {
    pub fn bytes(self) -> usize {
        match self {
            AddressWidth::Bits8 => 1,
            AddressWidth::Bits32 => 4,
        }
    }
}

/// Longest transaction header: command byte plus a 32-bit address.
pub const MAX_HEADER_SIZE: usize = 5;

/// Encodes the command and zero address into `buf`, returning the header length.
pub fn encode_header(command: Command, width: AddressWidth, buf: &mut [u8; MAX_HEADER_SIZE]) -> usize {
    let len = 1 + width.bytes();
    buf[0] = command.code();
    buf[1..len].fill(0);
    len
}

pub fn encode_status(len: u32) -> [u8; STATUS_SIZE] {
    len.to_le_bytes()
}

pub fn decode_status(bytes: [u8; STATUS_SIZE]) -> u32 {
    u32::from_le_bytes(bytes)
}

/// One sub-event of a bus completion interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// The peer pulled the chunk we loaded.
    OutboundChunkDone,
    /// The peer deposited a chunk into our inbound buffer.
    InboundChunkDone,
    /// The peer wrote its pending-send length.
    PeerAnnouncedLength,
    /// The peer read our announced outbound length.
    PeerReadLength,
}

impl Event {
    /// Handler evaluation order. Independent of bit positions.
    pub const ORDER: [Event; 4] = [
        Event::OutboundChunkDone,
        Event::InboundChunkDone,
        Event::PeerAnnouncedLength,
        Event::PeerReadLength,
    ];

    pub const fn bit(self) -> u32 {
        match self {
            Event::OutboundChunkDone => 1 << 0,
            Event::InboundChunkDone => 1 << 1,
            Event::PeerReadLength => 1 << 2,
            Event::PeerAnnouncedLength => 1 << 3,
        }
    }
}

/// Completion bitmask as delivered by the bus peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Events(u32);

impl Events {
    const KNOWN: u32 = 0b1111;

    pub const fn empty() -> Self {
        Events(0)
    }

    /// Keeps the four known sub-event bits and drops everything else.
    pub const fn from_bits_truncate(raw: u32) -> Self {
        Events(raw & Self::KNOWN)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, event: Event) -> bool {
        self.0 & event.bit() != 0
    }

    pub const fn with(self, event: Event) -> Self {
        Events(self.0 | event.bit())
    }

    /// Sub-events present in this mask, in handler order.
    pub fn in_order(self) -> impl Iterator<Item = Event> {
        Event::ORDER.into_iter().filter(move |e| self.contains(*e))
    }
}

impl From<Event> for Events {
    fn from(event: Event) -> Self {
        Events::empty().with(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_codes() {
        assert_eq!(Command::WriteStatus.code(), 1);
        assert_eq!(Command::WriteChunk.code(), 2);
        assert_eq!(Command::ReadChunk.code(), 3);
        assert_eq!(Command::ReadStatus.code(), 4);
        assert_eq!(Command::from_code(3), Some(Command::ReadChunk));
        assert_eq!(Command::from_code(0), None);
        assert_eq!(Command::from_code(5), None);
    }

    #[test]
    fn test_header_encoding() {
        let mut buf = [0xffu8; MAX_HEADER_SIZE];
        let len = encode_header(Command::ReadStatus, AddressWidth::Bits8, &mut buf);
        assert_eq!(&buf[..len], &[4, 0]);

        let mut buf = [0xffu8; MAX_HEADER_SIZE];
        let len = encode_header(Command::WriteChunk, AddressWidth::Bits32, &mut buf);
        assert_eq!(&buf[..len], &[2, 0, 0, 0, 0]);
    }

    #[test]
    fn test_status_is_little_endian() {
        assert_eq!(encode_status(200), [200, 0, 0, 0]);
        assert_eq!(decode_status([0x00, 0x01, 0x00, 0x00]), 256);
    }

    #[test]
    fn test_events_fixed_order() {
        let events = Events::from(Event::PeerReadLength)
            .with(Event::PeerAnnouncedLength)
            .with(Event::InboundChunkDone);
        let order: Vec<Event> = events.in_order().collect();
        assert_eq!(
            order,
            vec![
                Event::InboundChunkDone,
                Event::PeerAnnouncedLength,
                Event::PeerReadLength
            ]
        );
    }

    #[test]
    fn test_unknown_bits_dropped() {
        let events = Events::from_bits_truncate(0xf0);
        assert!(events.is_empty());
        assert_eq!(events.in_order().count(), 0);

        let events = Events::from_bits_truncate(0x11);
        assert!(events.contains(Event::OutboundChunkDone));
        assert_eq!(events.bits(), 0x01);
    }
}
