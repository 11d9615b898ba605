use crate::quic::ranges::RangeSet;
use lumen::shared::{QuicError, QuicResult};
use slice_deque::SliceDeque;

/// Inbound reassembly buffer. Storage covers `[data_off, data_off + len)`;
/// gaps between out-of-order chunks hold zeroes until the real bytes arrive,
/// with `received` tracking which ranges are valid.
pub struct RecvBuffer {
    data: SliceDeque<u8>,
    data_off: u64,
    eos: u64,
    received: RangeSet,
    consumed: u64,
}

impl RecvBuffer {
    pub fn new() -> RecvBuffer {
        RecvBuffer {
            data: SliceDeque::new(),
            data_off: 0,
            eos: u64::max_value(),
            received: RangeSet::new(),
            consumed: 0,
        }
    }

    #[inline]
    pub fn data_off(&self) -> u64 {
        self.data_off
    }

    #[inline]
    pub fn eos(&self) -> u64 {
        self.eos
    }

    /// Total bytes handed to the application, for flow-control accounting.
    #[inline]
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Highest offset absorbed so far.
    #[inline]
    pub fn high_water(&self) -> u64 {
        self.received.last().map(|r| r.end).unwrap_or(self.data_off)
    }

    /// Absorbs a chunk at the given absolute offset. Bytes below `data_off`
    /// were already delivered and are dropped.
    pub fn write(&mut self, offset: u64, data: &[u8]) -> QuicResult<()> {
        let end = offset + data.len() as u64;
        if end > self.eos {
            return Err(QuicError::InvalidStreamData);
        }
        if end <= self.data_off || data.is_empty() {
            return Ok(());
        }

        let skip = self.data_off.saturating_sub(offset) as usize;
        let start = offset + skip as u64;

        let needed = (end - self.data_off) as usize;
        if needed > self.data.len() {
            let grow = needed - self.data.len();
            self.data.extend(std::iter::repeat(0u8).take(grow));
        }

        let relative = (start - self.data_off) as usize;
        self.data[relative..needed].copy_from_slice(&data[skip..]);
        self.received.update(start, end);
        Ok(())
    }

    /// Fixes the end of stream. Conflicting marks or buffered data beyond the
    /// mark are rejected.
    pub fn mark_eos(&mut self, offset: u64) -> QuicResult<()> {
        if self.eos != u64::max_value() {
            return match self.eos == offset {
                true => Ok(()),
                _ => Err(QuicError::InvalidStreamData),
            };
        }
        if offset < self.high_water() {
            return Err(QuicError::InvalidStreamData);
        }
        self.eos = offset;
        Ok(())
    }

    /// The contiguous prefix available to the application, borrowed straight
    /// out of the reassembly storage.
    #[inline]
    pub fn readable(&self) -> &[u8] {
        match self.received.first() {
            Some(range) if range.start == self.data_off => {
                &self.data[..(range.end - self.data_off) as usize]
            }
            _ => &[],
        }
    }

    /// Releases `count` delivered bytes.
    pub fn shift(&mut self, count: usize) -> QuicResult<()> {
        if count > self.readable().len() {
            return Err(QuicError::InvalidStreamData);
        }

        unsafe { self.data.move_head(count as isize) };
        self.data_off += count as u64;
        self.consumed += count as u64;
        self.received.shrink_left(self.data_off);
        Ok(())
    }

    #[inline]
    pub fn transfer_complete(&self) -> bool {
        self.eos != u64::max_value() && self.data_off == self.eos
    }
}
