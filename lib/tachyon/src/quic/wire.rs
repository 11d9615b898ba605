use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io;

/// Minimal number of bytes out of {1, 2, 4, 8} covering `value`.
#[inline]
pub fn uint_width(value: u64) -> usize {
    if value < 1 << 8 {
        1
    } else if value < 1 << 16 {
        2
    } else if value < 1 << 32 {
        4
    } else {
        8
    }
}

/// Two-bit code for a {1, 2, 4, 8} byte width.
#[inline]
pub fn width_code(width: usize) -> u8 {
    match width {
        1 => 0,
        2 => 1,
        4 => 2,
        8 => 3,
        _ => unreachable!("width must be 1, 2, 4 or 8"),
    }
}

/// Inverse of `width_code`.
#[inline]
pub fn code_width(code: u8) -> usize {
    1 << code
}

/// Minimal stream id width in bytes (1..=4).
#[inline]
pub fn stream_id_width(id: u32) -> usize {
    if id < 1 << 8 {
        1
    } else if id < 1 << 16 {
        2
    } else if id < 1 << 24 {
        3
    } else {
        4
    }
}

/// Minimal stream offset width: zero offsets are elided entirely, everything
/// else takes 2, 4 or 8 bytes.
#[inline]
pub fn offset_width(offset: u64) -> usize {
    if offset == 0 {
        0
    } else if offset < 1 << 16 {
        2
    } else if offset < 1 << 32 {
        4
    } else {
        8
    }
}

/// Two-bit code for a {0, 2, 4, 8} byte offset width.
#[inline]
pub fn offset_code(width: usize) -> u8 {
    match width {
        0 => 0,
        2 => 1,
        4 => 2,
        8 => 3,
        _ => unreachable!("offset width must be 0, 2, 4 or 8"),
    }
}

/// Inverse of `offset_code`.
#[inline]
pub fn code_offset_width(code: u8) -> usize {
    [0, 2, 4, 8][code as usize]
}

#[inline]
pub fn write_uint<W: io::Write>(stream: &mut W, value: u64, width: usize) -> io::Result<()> {
    stream.write_uint::<BigEndian>(value, width)
}

#[inline]
pub fn read_uint<R: io::Read>(stream: &mut R, width: usize) -> io::Result<u64> {
    stream.read_uint::<BigEndian>(width)
}
