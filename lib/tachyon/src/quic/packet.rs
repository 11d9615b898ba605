use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use lumen::shared::{QuicError, QuicResult};

pub const PACKET_TYPE_VERSION_NEGOTIATION: u8 = 1;
pub const PACKET_TYPE_CLIENT_INITIAL: u8 = 2;
pub const PACKET_TYPE_SERVER_STATELESS_RETRY: u8 = 3;
pub const PACKET_TYPE_SERVER_CLEARTEXT: u8 = 4;
pub const PACKET_TYPE_CLIENT_CLEARTEXT: u8 = 5;
pub const PACKET_TYPE_0RTT_PROTECTED: u8 = 6;
pub const PACKET_TYPE_1RTT_KEY_PHASE_0: u8 = 7;
// Shares its value with the public reset type; decoded as key phase 1.
pub const PACKET_TYPE_1RTT_KEY_PHASE_1: u8 = 8;

pub const LONG_HEADER_SIZE: usize = 17;
pub const FNV1A_TRAILER_SIZE: usize = 8;
/// Payload bytes of a CLIENT_INITIAL packet, before the FNV-1a trailer.
pub const INITIAL_PAYLOAD_SIZE: usize = 1272;

const FLAG_LONG: u8 = 0x80;
const SHORT_FLAG_CONNECTION_ID: u8 = 0x40;
const SHORT_FLAG_KEY_PHASE: u8 = 0x20;

pub const FNV1A_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
pub const FNV1A_PRIME: u64 = 0x0000_0100_0000_01b3;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PacketKind {
    Long { ty: u8, version: u32 },
    Short { key_phase: bool },
}

/// Decoded packet header plus the still-protected payload. The payload slice
/// aliases the datagram buffer so protection can be removed in place.
pub struct PacketView<'a> {
    pub kind: PacketKind,
    pub cid: Option<u64>,
    pub packet_number: u32,
    pub pn_width: usize,
    pub header: &'a [u8],
    pub payload: &'a mut [u8],
}

pub fn decode(datagram: &mut [u8]) -> QuicResult<PacketView> {
    if datagram.is_empty() {
        return Err(QuicError::InvalidPacketHeader);
    }

    let first = datagram[0];

    if first & FLAG_LONG != 0 {
        if datagram.len() < LONG_HEADER_SIZE {
            return Err(QuicError::InvalidPacketHeader);
        }

        let ty = first & 0x7f;
        if ty < PACKET_TYPE_VERSION_NEGOTIATION || ty > PACKET_TYPE_1RTT_KEY_PHASE_1 {
            return Err(QuicError::InvalidPacketHeader);
        }

        let cid = BigEndian::read_u64(&datagram[1..9]);
        let packet_number = BigEndian::read_u32(&datagram[9..13]);
        let version = BigEndian::read_u32(&datagram[13..17]);

        let (header, payload) = datagram.split_at_mut(LONG_HEADER_SIZE);

        Ok(PacketView {
            kind: PacketKind::Long { ty, version },
            cid: Some(cid),
            packet_number,
            pn_width: 4,
            header: &*header,
            payload,
        })
    } else {
        let has_cid = first & SHORT_FLAG_CONNECTION_ID != 0;
        let key_phase = first & SHORT_FLAG_KEY_PHASE != 0;

        let pn_bits = first & 0x07;
        if pn_bits < 1 || pn_bits > 3 {
            return Err(QuicError::InvalidPacketHeader);
        }
        let pn_width = 1usize << (pn_bits - 1);

        let cid_len = match has_cid {
            true => 8,
            false => 0,
        };
        let header_len = 1 + cid_len + pn_width;
        if datagram.len() < header_len {
            return Err(QuicError::InvalidPacketHeader);
        }

        let cid = match has_cid {
            true => Some(BigEndian::read_u64(&datagram[1..9])),
            false => None,
        };
        let packet_number = BigEndian::read_uint(&datagram[1 + cid_len..header_len], pn_width) as u32;

        let (header, payload) = datagram.split_at_mut(header_len);

        Ok(PacketView {
            kind: PacketKind::Short { key_phase },
            cid,
            packet_number,
            pn_width,
            header: &*header,
            payload,
        })
    }
}

pub fn write_long_header(buf: &mut Vec<u8>, ty: u8, cid: u64, packet_number: u32, version: u32) {
    buf.write_u8(FLAG_LONG | ty).expect("Error writing header");
    buf.write_u64::<BigEndian>(cid).expect("Error writing header");
    buf.write_u32::<BigEndian>(packet_number).expect("Error writing header");
    buf.write_u32::<BigEndian>(version).expect("Error writing header");
}

/// Short headers are emitted with a four-byte packet number; the connection id
/// is elided when the peer negotiated truncation.
pub fn write_short_header(buf: &mut Vec<u8>, cid: Option<u64>, key_phase: bool, packet_number: u32) {
    let mut first = 0x03u8;
    if cid.is_some() {
        first |= SHORT_FLAG_CONNECTION_ID;
    }
    if key_phase {
        first |= SHORT_FLAG_KEY_PHASE;
    }
    buf.write_u8(first).expect("Error writing header");
    if let Some(cid) = cid {
        buf.write_u64::<BigEndian>(cid).expect("Error writing header");
    }
    buf.write_u32::<BigEndian>(packet_number).expect("Error writing header");
}

#[inline]
pub fn fnv1a(hash: u64, bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .fold(hash, |hash, &byte| (hash ^ u64::from(byte)).wrapping_mul(FNV1A_PRIME))
}

/// Verifies the FNV-1a trailer of a cleartext packet, returning the
/// authenticated payload length.
pub fn verify_cleartext(header: &[u8], payload: &[u8]) -> QuicResult<usize> {
    if payload.len() < FNV1A_TRAILER_SIZE {
        return Err(QuicError::DecryptionFailure);
    }

    let body = payload.len() - FNV1A_TRAILER_SIZE;
    let expected = fnv1a(fnv1a(FNV1A_OFFSET_BASIS, header), &payload[..body]);
    let found = BigEndian::read_u64(&payload[body..]);

    match expected == found {
        true => Ok(body),
        _ => Err(QuicError::DecryptionFailure),
    }
}

/// Expands a truncated packet number to the candidate closest to the next
/// expected one.
pub fn recover_packet_number(truncated: u32, width: usize, expected: u64) -> u64 {
    let window = 1u64 << (width * 8);
    let candidate = (expected & !(window - 1)) | u64::from(truncated);

    if candidate + window / 2 < expected {
        candidate + window
    } else if candidate >= expected + window / 2 && candidate >= window {
        candidate - window
    } else {
        candidate
    }
}
