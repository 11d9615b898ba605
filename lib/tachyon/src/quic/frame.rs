use crate::quic::ranges::RangeSet;
use crate::quic::wire;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use lumen::shared::{QuicError, QuicResult, SizedRead};
use std::io;

pub const FRAME_TYPE_PADDING: u8 = 0x00;
pub const FRAME_TYPE_RST_STREAM: u8 = 0x01;
pub const FRAME_TYPE_MAX_DATA: u8 = 0x04;
pub const FRAME_TYPE_MAX_STREAM_DATA: u8 = 0x05;
pub const FRAME_TYPE_STOP_SENDING: u8 = 0x0c;

// 0b101n_llmm: n = more blocks, ll/mm = largest-ack and block-length widths
const FRAME_TYPE_ACK_BASE: u8 = 0xa0;
const ACK_FLAG_BLOCKS: u8 = 0x10;

// 0b11fs_sood: f = fin, ss = stream id width, oo = offset width, d = length
const FRAME_TYPE_STREAM_BASE: u8 = 0xc0;
const STREAM_FLAG_FIN: u8 = 0x20;
const STREAM_FLAG_DATA_LENGTH: u8 = 0x01;

#[derive(Debug, Eq, PartialEq)]
pub struct StreamFrame<'a> {
    pub stream_id: u32,
    pub offset: u64,
    pub fin: bool,
    pub data: &'a [u8],
}

#[derive(Debug, Eq, PartialEq)]
pub struct AckFrame {
    pub largest: u64,
    pub ack_delay: u16,
    pub acked: RangeSet,
}

#[derive(Debug, Eq, PartialEq)]
pub enum Frame<'a> {
    Padding,
    RstStream {
        stream_id: u32,
        error_code: u32,
        final_offset: u64,
    },
    StopSending {
        stream_id: u32,
        error_code: u32,
    },
    MaxData {
        max_data_kb: u64,
    },
    MaxStreamData {
        stream_id: u32,
        max_stream_data: u64,
    },
    Ack(AckFrame),
    Stream(StreamFrame<'a>),
}

impl<'a> Frame<'a> {
    pub fn read(stream: &mut io::Cursor<&'a [u8]>) -> QuicResult<Frame<'a>> {
        let ty = stream.read_u8()?;

        match ty {
            FRAME_TYPE_PADDING => Ok(Frame::Padding),
            FRAME_TYPE_RST_STREAM => {
                if stream.remaining_data() < 16 {
                    return Err(QuicError::InvalidFrameData);
                }
                Ok(Frame::RstStream {
                    stream_id: stream.read_u32::<BigEndian>()?,
                    error_code: stream.read_u32::<BigEndian>()?,
                    final_offset: stream.read_u64::<BigEndian>()?,
                })
            }
            FRAME_TYPE_MAX_DATA => {
                if stream.remaining_data() < 8 {
                    return Err(QuicError::InvalidFrameData);
                }
                Ok(Frame::MaxData {
                    max_data_kb: stream.read_u64::<BigEndian>()?,
                })
            }
            FRAME_TYPE_MAX_STREAM_DATA => {
                if stream.remaining_data() < 12 {
                    return Err(QuicError::InvalidFrameData);
                }
                Ok(Frame::MaxStreamData {
                    stream_id: stream.read_u32::<BigEndian>()?,
                    max_stream_data: stream.read_u64::<BigEndian>()?,
                })
            }
            FRAME_TYPE_STOP_SENDING => {
                if stream.remaining_data() < 8 {
                    return Err(QuicError::InvalidFrameData);
                }
                Ok(Frame::StopSending {
                    stream_id: stream.read_u32::<BigEndian>()?,
                    error_code: stream.read_u32::<BigEndian>()?,
                })
            }
            ty if ty & 0b1110_0000 == FRAME_TYPE_ACK_BASE => Self::read_ack(ty, stream).map(Frame::Ack),
            ty if ty & 0b1100_0000 == FRAME_TYPE_STREAM_BASE => {
                Self::read_stream(ty, stream).map(Frame::Stream)
            }
            _ => Err(QuicError::InvalidFrameData),
        }
    }

    fn read_ack(ty: u8, stream: &mut io::Cursor<&[u8]>) -> QuicResult<AckFrame> {
        let largest_width = wire::code_width((ty >> 2) & 0x03);
        let block_width = wire::code_width(ty & 0x03);

        if stream.remaining_data() < largest_width + 2 {
            return Err(QuicError::InvalidFrameData);
        }
        let largest = wire::read_uint(stream, largest_width)?;
        let ack_delay = stream.read_u16::<BigEndian>()?;

        let block_count = match ty & ACK_FLAG_BLOCKS {
            0 => 0,
            _ => stream.read_u8()?,
        };

        if stream.remaining_data() < block_width + block_count as usize * (1 + block_width) {
            return Err(QuicError::InvalidFrameData);
        }

        let first_len = wire::read_uint(stream, block_width)?;
        if first_len > largest + 1 {
            return Err(QuicError::InvalidFrameData);
        }

        let mut acked = RangeSet::new();
        let mut floor = largest + 1 - first_len;
        if first_len > 0 {
            acked.update(floor, largest + 1);
        }

        for _ in 0..block_count {
            let gap = u64::from(stream.read_u8()?);
            let len = wire::read_uint(stream, block_width)?;
            if gap + len > floor {
                return Err(QuicError::InvalidFrameData);
            }
            let end = floor - gap;
            if len > 0 {
                acked.update(end - len, end);
            }
            floor = end - len;
        }

        Ok(AckFrame { largest, ack_delay, acked })
    }

    fn read_stream(ty: u8, stream: &mut io::Cursor<&'a [u8]>) -> QuicResult<StreamFrame<'a>> {
        let id_width = ((ty >> 3) & 0x03) as usize + 1;
        let offset_width = wire::code_offset_width((ty >> 1) & 0x03);
        let has_length = ty & STREAM_FLAG_DATA_LENGTH != 0;

        let mut needed = id_width + offset_width;
        if has_length {
            needed += 2;
        }
        if stream.remaining_data() < needed {
            return Err(QuicError::InvalidFrameData);
        }

        let stream_id = wire::read_uint(stream, id_width)? as u32;
        let offset = match offset_width {
            0 => 0,
            width => wire::read_uint(stream, width)?,
        };
        let len = match has_length {
            true => stream.read_u16::<BigEndian>()? as usize,
            false => stream.remaining_data(),
        };

        if stream.remaining_data() < len {
            return Err(QuicError::InvalidFrameData);
        }

        let buffer: &'a [u8] = *stream.get_ref();
        let position = stream.position() as usize;
        let data = &buffer[position..position + len];
        stream.set_position((position + len) as u64);

        Ok(StreamFrame {
            stream_id,
            offset,
            fin: ty & STREAM_FLAG_FIN != 0,
            data,
        })
    }

    /// Exact encoded size of the frame.
    pub fn wire_size(&self) -> usize {
        match self {
            Frame::Padding => 1,
            Frame::RstStream { .. } => 17,
            Frame::StopSending { .. } => 9,
            Frame::MaxData { .. } => 9,
            Frame::MaxStreamData { .. } => 13,
            Frame::Ack(ack) => ack.wire_size(),
            Frame::Stream(frame) => frame.wire_size(),
        }
    }

    pub fn write<W: io::Write>(&self, stream: &mut W) -> QuicResult<()> {
        match self {
            Frame::Padding => stream.write_u8(FRAME_TYPE_PADDING)?,
            Frame::RstStream {
                stream_id,
                error_code,
                final_offset,
            } => {
                stream.write_u8(FRAME_TYPE_RST_STREAM)?;
                stream.write_u32::<BigEndian>(*stream_id)?;
                stream.write_u32::<BigEndian>(*error_code)?;
                stream.write_u64::<BigEndian>(*final_offset)?;
            }
            Frame::StopSending { stream_id, error_code } => {
                stream.write_u8(FRAME_TYPE_STOP_SENDING)?;
                stream.write_u32::<BigEndian>(*stream_id)?;
                stream.write_u32::<BigEndian>(*error_code)?;
            }
            Frame::MaxData { max_data_kb } => {
                stream.write_u8(FRAME_TYPE_MAX_DATA)?;
                stream.write_u64::<BigEndian>(*max_data_kb)?;
            }
            Frame::MaxStreamData {
                stream_id,
                max_stream_data,
            } => {
                stream.write_u8(FRAME_TYPE_MAX_STREAM_DATA)?;
                stream.write_u32::<BigEndian>(*stream_id)?;
                stream.write_u64::<BigEndian>(*max_stream_data)?;
            }
            Frame::Ack(ack) => ack.write(stream)?,
            Frame::Stream(frame) => frame.write(stream)?,
        }
        Ok(())
    }
}

impl AckFrame {
    /// Builds the frame acknowledging every range in `acked`. The set must not
    /// be empty.
    pub fn new(acked: &RangeSet, ack_delay: u16) -> AckFrame {
        let largest = acked.last().expect("ack frame needs at least one range").end - 1;
        AckFrame {
            largest,
            ack_delay,
            acked: acked.clone(),
        }
    }

    /// Gap/length entries in descending packet-number order. Gaps wider than
    /// 255 are bridged with zero-length blocks.
    fn blocks(&self) -> (u64, Vec<(u8, u64)>) {
        let mut iter = self.acked.iter().rev();
        let first = iter.next().expect("ack frame needs at least one range");

        let mut blocks = Vec::new();
        let mut floor = first.start;

        for range in iter {
            let mut gap = floor - range.end;
            while gap > 255 {
                blocks.push((255u8, 0u64));
                gap -= 255;
            }
            blocks.push((gap as u8, range.len()));
            floor = range.start;
        }

        (first.len(), blocks)
    }

    fn widths(&self, first_len: u64, blocks: &[(u8, u64)]) -> (usize, usize) {
        let largest_width = wire::uint_width(self.largest);
        let max_block = blocks.iter().map(|&(_, len)| len).fold(first_len, u64::max);
        (largest_width, wire::uint_width(max_block))
    }

    pub fn wire_size(&self) -> usize {
        let (first_len, blocks) = self.blocks();
        let (largest_width, block_width) = self.widths(first_len, &blocks);

        let mut size = 1 + largest_width + 2 + block_width;
        if !blocks.is_empty() {
            size += 1 + blocks.len() * (1 + block_width);
        }
        size
    }

    pub fn write<W: io::Write>(&self, stream: &mut W) -> QuicResult<()> {
        let (first_len, blocks) = self.blocks();
        let (largest_width, block_width) = self.widths(first_len, &blocks);

        let mut ty = FRAME_TYPE_ACK_BASE
            | wire::width_code(largest_width) << 2
            | wire::width_code(block_width);
        if !blocks.is_empty() {
            ty |= ACK_FLAG_BLOCKS;
        }

        stream.write_u8(ty)?;
        wire::write_uint(stream, self.largest, largest_width)?;
        stream.write_u16::<BigEndian>(self.ack_delay)?;
        if !blocks.is_empty() {
            stream.write_u8(blocks.len() as u8)?;
        }
        wire::write_uint(stream, first_len, block_width)?;
        for &(gap, len) in &blocks {
            stream.write_u8(gap)?;
            wire::write_uint(stream, len, block_width)?;
        }
        Ok(())
    }
}

impl<'a> StreamFrame<'a> {
    pub fn wire_size(&self) -> usize {
        1 + wire::stream_id_width(self.stream_id) + wire::offset_width(self.offset) + 2 + self.data.len()
    }

    /// Header bytes of a stream frame carrying data at `offset`, without the
    /// data itself.
    #[inline]
    pub fn overhead(stream_id: u32, offset: u64) -> usize {
        1 + wire::stream_id_width(stream_id) + wire::offset_width(offset) + 2
    }

    pub fn write<W: io::Write>(&self, stream: &mut W) -> QuicResult<()> {
        let id_width = wire::stream_id_width(self.stream_id);
        let offset_width = wire::offset_width(self.offset);

        let mut ty = FRAME_TYPE_STREAM_BASE
            | ((id_width - 1) as u8) << 3
            | wire::offset_code(offset_width) << 1
            | STREAM_FLAG_DATA_LENGTH;
        if self.fin {
            ty |= STREAM_FLAG_FIN;
        }

        stream.write_u8(ty)?;
        wire::write_uint(stream, u64::from(self.stream_id), id_width)?;
        if offset_width > 0 {
            wire::write_uint(stream, self.offset, offset_width)?;
        }
        stream.write_u16::<BigEndian>(self.data.len() as u16)?;
        stream.write_all(self.data)?;
        Ok(())
    }
}
