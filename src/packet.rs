//! Wire-format definitions for protocol segments.
//!
//! Every datagram exchanged between peers carries one [`Packet`].  This
//! module is responsible for:
//! - Defining the on-wire binary layout (header fields, control and option
//!   bits, SYN body, trailing payload).
//! - Serialising a [`Packet`] into a byte buffer ready for transmission.
//! - Deserialising a raw byte slice back into a [`Packet`], returning errors
//!   for truncated or unclassifiable input.
//!
//! No I/O happens here.  The 2-byte checksum prefix is added and stripped by
//! [`crate::channel`]; the bytes handled here start at the header.
//!
//! # Wire format
//!
//! All multi-byte integers are **little-endian**.
//!
//! ```text
//!  0               1               2               3
//! +---------------+---------------+---------------+---------------+
//! |   Controls    |    Options    |   Sequence    |      Ack      |
//! +---------------+---------------+---------------+---------------+
//! |   body ...  (SYN parameters, or ACK payload, or nothing)      |
//! +---------------------------------------------------------------+
//!
//! Controls: bit7 SYN, bit6 ACK, bit5 EAK, bit4 RST, bit3 NUL
//! Options:  bit7 Reliable, bit6 Ordered, bit5 Sequenced
//!
//! SYN body (14 bytes + optional security block):
//!  version(1) max_outstanding(1) max_packet_size(2) rto(2)
//!  cum_ack_timeout(2) null_timeout(2) max_retx(1) max_cum_acks(1)
//!  max_out_of_seq(1) max_auto_resets(1) security(..)
//! ```
//!
//! An ACK payload has no length field: it is whatever follows the header.

use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

use crate::buffer::{BufferPool, PooledBuffer};
use crate::parameters::ConnectionParameters;

/// Bit constants for the `controls` header byte.
pub mod controls {
    /// Connection initiation; body carries [`super::ConnectionParameters`].
    pub const SYN: u8 = 0b1000_0000;
    /// The `ack` field is valid.
    pub const ACK: u8 = 0b0100_0000;
    /// Extended acknowledgement.  Reserved.
    pub const EAK: u8 = 0b0010_0000;
    /// Reset the connection.
    pub const RST: u8 = 0b0001_0000;
    /// Null (keep-alive) segment.
    pub const NUL: u8 = 0b0000_1000;
}

/// Bit constants for the `options` header byte.
pub mod options {
    pub const NONE: u8 = 0;
    pub const RELIABLE: u8 = 0b1000_0000;
    pub const ORDERED: u8 = 0b0100_0000;
    pub const SEQUENCED: u8 = 0b0010_0000;
}

/// Byte length of the fixed header.
pub const HEADER_LEN: usize = 4;

/// Byte length of the fixed part of a SYN body.
pub const SYN_BODY_LEN: usize = 14;

/// Byte length of a SYN without security block.
pub const SYN_LEN: usize = HEADER_LEN + SYN_BODY_LEN;

// Byte offsets within the serialised header.
const OFF_CONTROLS: usize = 0;
const OFF_OPTIONS: usize = 1;
const OFF_SEQ: usize = 2;
const OFF_ACK: usize = 3;

// Byte offsets within a serialised SYN.
const OFF_VERSION: usize = 4;
const OFF_MAX_OUTSTANDING: usize = 5;
const OFF_MAX_PACKET_SIZE: usize = 6;
const OFF_RTO: usize = 8;
const OFF_CUM_ACK_TIMEOUT: usize = 10;
const OFF_NULL_TIMEOUT: usize = 12;
const OFF_MAX_RETX: usize = 14;
const OFF_MAX_CUM_ACKS: usize = 15;
const OFF_MAX_OUT_OF_SEQ: usize = 16;
const OFF_MAX_AUTO_RESETS: usize = 17;

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

/// Fixed-size protocol header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Bitmask of [`controls`] constants.
    pub controls: u8,
    /// Bitmask of [`options`] constants.
    pub options: u8,
    pub seq: u8,
    pub ack: u8,
}

impl Header {
    pub fn new(controls: u8, options: u8, seq: u8, ack: u8) -> Self {
        Self {
            controls,
            options,
            seq,
            ack,
        }
    }

    /// `true` when every bit of `control` is set.
    pub fn has(&self, control: u8) -> bool {
        self.controls & control == control
    }

    /// `true` for an ACK with no other control bit: a data segment or a
    /// stand-alone acknowledgement.
    pub fn is_pure_ack(&self) -> bool {
        self.controls == controls::ACK
    }

    /// Overwrite the ack field of an already-encoded segment.
    pub fn rewrite_ack(segment: &mut [u8], ack: u8) {
        if let Some(byte) = segment.get_mut(OFF_ACK) {
            *byte = ack;
        }
    }

    fn write(&self, buf: &mut [u8]) {
        buf[OFF_CONTROLS] = self.controls;
        buf[OFF_OPTIONS] = self.options;
        buf[OFF_SEQ] = self.seq;
        buf[OFF_ACK] = self.ack;
    }

    /// Parse the header at the start of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < HEADER_LEN {
            return Err(PacketError::TooShort {
                kind: "header",
                expected: HEADER_LEN,
                actual: buf.len(),
            });
        }
        Ok(Self {
            controls: buf[OFF_CONTROLS],
            options: buf[OFF_OPTIONS],
            seq: buf[OFF_SEQ],
            ack: buf[OFF_ACK],
        })
    }
}

// ---------------------------------------------------------------------------
// OptionsMask
// ---------------------------------------------------------------------------

/// Capability check a delivery discipline applies to inbound `options`.
///
/// Bits in `required` must be set, bits in `forbidden` must be clear, and
/// every other bit is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptionsMask {
    pub required: u8,
    pub forbidden: u8,
}

impl OptionsMask {
    pub const UNRELIABLE: Self = Self {
        required: options::NONE,
        forbidden: options::RELIABLE | options::ORDERED | options::SEQUENCED,
    };
    pub const RELIABLE: Self = Self {
        required: options::RELIABLE,
        forbidden: options::ORDERED | options::SEQUENCED,
    };
    pub const ORDERED: Self = Self {
        required: options::RELIABLE | options::ORDERED,
        forbidden: options::SEQUENCED,
    };

    pub fn supports(&self, options: u8) -> bool {
        options & self.required == self.required && options & self.forbidden == 0
    }
}

// ---------------------------------------------------------------------------
// Variants
// ---------------------------------------------------------------------------

/// Connection request or reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Syn {
    pub header: Header,
    pub params: ConnectionParameters,
}

impl Syn {
    /// A connection request.
    pub fn request(seq: u8, params: ConnectionParameters) -> Self {
        Self {
            header: Header::new(controls::SYN, options::RELIABLE, seq, 0),
            params,
        }
    }

    /// A reply to a request whose sequence number was `ack`.
    pub fn reply(seq: u8, ack: u8, params: ConnectionParameters) -> Self {
        Self {
            header: Header::new(controls::SYN | controls::ACK, options::RELIABLE, seq, ack),
            params,
        }
    }

    fn encoded_len(&self) -> usize {
        SYN_LEN + self.params.security.as_ref().map_or(0, Vec::len)
    }

    fn write(&self, buf: &mut [u8]) {
        let p = &self.params;
        self.header.write(buf);
        buf[OFF_VERSION] = p.version;
        buf[OFF_MAX_OUTSTANDING] = p.max_outstanding_packets;
        LittleEndian::write_u16(&mut buf[OFF_MAX_PACKET_SIZE..], p.max_packet_size);
        LittleEndian::write_u16(&mut buf[OFF_RTO..], p.retransmission_timeout);
        LittleEndian::write_u16(&mut buf[OFF_CUM_ACK_TIMEOUT..], p.cumulative_ack_timeout);
        LittleEndian::write_u16(&mut buf[OFF_NULL_TIMEOUT..], p.null_packet_timeout);
        buf[OFF_MAX_RETX] = p.max_retransmissions;
        buf[OFF_MAX_CUM_ACKS] = p.max_cumulative_acks;
        buf[OFF_MAX_OUT_OF_SEQ] = p.max_out_of_sequence_packets;
        buf[OFF_MAX_AUTO_RESETS] = p.max_auto_resets;
        if let Some(security) = &p.security {
            buf[SYN_LEN..SYN_LEN + security.len()].copy_from_slice(security);
        }
    }

    /// Parse a SYN segment.  Trailing bytes become the security block.
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < SYN_LEN {
            return Err(PacketError::TooShort {
                kind: "SYN",
                expected: SYN_LEN,
                actual: buf.len(),
            });
        }
        let header = Header::decode(buf)?;
        let security = (buf.len() > SYN_LEN).then(|| buf[SYN_LEN..].to_vec());
        let params = ConnectionParameters {
            version: buf[OFF_VERSION],
            max_outstanding_packets: buf[OFF_MAX_OUTSTANDING],
            max_packet_size: LittleEndian::read_u16(&buf[OFF_MAX_PACKET_SIZE..]),
            retransmission_timeout: LittleEndian::read_u16(&buf[OFF_RTO..]),
            cumulative_ack_timeout: LittleEndian::read_u16(&buf[OFF_CUM_ACK_TIMEOUT..]),
            null_packet_timeout: LittleEndian::read_u16(&buf[OFF_NULL_TIMEOUT..]),
            max_retransmissions: buf[OFF_MAX_RETX],
            max_cumulative_acks: buf[OFF_MAX_CUM_ACKS],
            max_out_of_sequence_packets: buf[OFF_MAX_OUT_OF_SEQ],
            max_auto_resets: buf[OFF_MAX_AUTO_RESETS],
            security,
        };
        Ok(Self { header, params })
    }
}

/// Acknowledgement, optionally carrying piggybacked data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub header: Header,
    pub payload: Vec<u8>,
}

impl Ack {
    pub fn new(seq: u8, ack: u8, options: u8, payload: Vec<u8>) -> Self {
        Self {
            header: Header::new(controls::ACK, options, seq, ack),
            payload,
        }
    }

    /// Parse an ACK segment; everything after the header is payload.
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        let header = Header::decode(buf)?;
        Ok(Self {
            header,
            payload: buf[HEADER_LEN..].to_vec(),
        })
    }
}

/// A complete protocol segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Syn(Syn),
    Ack(Ack),
    /// Reset.  Header only.
    Rst(Header),
    /// Keep-alive.  Header only.
    Nul(Header),
}

impl Packet {
    /// Reset segment; carries `ACK` alongside `RST`.
    pub fn rst(seq: u8, ack: u8) -> Self {
        Packet::Rst(Header::new(
            controls::RST | controls::ACK,
            options::NONE,
            seq,
            ack,
        ))
    }

    /// Keep-alive segment; carries `ACK` alongside `NUL`.
    pub fn nul(seq: u8, ack: u8, options: u8) -> Self {
        Packet::Nul(Header::new(controls::NUL | controls::ACK, options, seq, ack))
    }

    pub fn header(&self) -> &Header {
        match self {
            Packet::Syn(syn) => &syn.header,
            Packet::Ack(ack) => &ack.header,
            Packet::Rst(header) | Packet::Nul(header) => header,
        }
    }

    /// Serialised length in bytes.
    pub fn encoded_len(&self) -> usize {
        match self {
            Packet::Syn(syn) => syn.encoded_len(),
            Packet::Ack(ack) => HEADER_LEN + ack.payload.len(),
            Packet::Rst(_) | Packet::Nul(_) => HEADER_LEN,
        }
    }

    /// Serialise into `buf`, which must be exactly [`Packet::encoded_len`] bytes.
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert_eq!(buf.len(), self.encoded_len());
        match self {
            Packet::Syn(syn) => syn.write(buf),
            Packet::Ack(ack) => {
                ack.header.write(buf);
                buf[HEADER_LEN..].copy_from_slice(&ack.payload);
            }
            Packet::Rst(header) | Packet::Nul(header) => header.write(buf),
        }
    }

    /// Serialise into a newly allocated byte vector.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.encoded_len()];
        self.encode_into(&mut buf);
        buf
    }

    /// Serialise into a buffer leased from `pool`.
    pub fn encode_pooled(&self, pool: &Arc<BufferPool>) -> PooledBuffer {
        let mut buf = pool.lease(self.encoded_len());
        self.encode_into(&mut buf);
        buf
    }

    /// Parse a segment, classifying it by its most significant control bit:
    /// SYN, then RST, then NUL, then ACK.
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        let header = Header::decode(buf)?;
        if header.has(controls::SYN) {
            Ok(Packet::Syn(Syn::decode(buf)?))
        } else if header.has(controls::RST) {
            Ok(Packet::Rst(header))
        } else if header.has(controls::NUL) {
            Ok(Packet::Nul(header))
        } else if header.has(controls::ACK) {
            Ok(Packet::Ack(Ack::decode(buf)?))
        } else {
            Err(PacketError::UnknownControls(header.controls))
        }
    }
}

/// Errors that can arise when parsing a raw segment.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("{kind} needs {expected} bytes, got {actual}")]
    TooShort {
        kind: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("no known control bit in {0:#010b}")]
    UnknownControls(u8),
}
