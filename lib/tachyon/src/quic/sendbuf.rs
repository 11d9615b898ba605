use crate::quic::ranges::RangeSet;
use lumen::shared::{QuicError, QuicResult};
use slice_deque::SliceDeque;

/// Outbound byte queue addressed by absolute stream offset. Bytes live in the
/// deque from the lowest unacknowledged offset to the append tail; the FIN
/// signal occupies a single virtual byte at offset `eos`, scheduled and
/// acknowledged like data.
pub struct SendBuffer {
    data: SliceDeque<u8>,
    base: u64,
    eos: u64,
    pending: RangeSet,
    acked: RangeSet,
}

impl SendBuffer {
    pub fn new() -> SendBuffer {
        SendBuffer {
            data: SliceDeque::new(),
            base: 0,
            eos: u64::max_value(),
            pending: RangeSet::new(),
            acked: RangeSet::new(),
        }
    }

    /// Next offset to be appended.
    #[inline]
    pub fn tail(&self) -> u64 {
        self.base + self.data.len() as u64
    }

    #[inline]
    pub fn eos(&self) -> u64 {
        self.eos
    }

    #[inline]
    pub fn is_shutdown(&self) -> bool {
        self.eos != u64::max_value()
    }

    #[inline]
    pub fn pending(&self) -> &RangeSet {
        &self.pending
    }

    /// Appends bytes and schedules them for transmission.
    pub fn write(&mut self, data: &[u8]) -> QuicResult<()> {
        if self.is_shutdown() {
            return Err(QuicError::InvalidStreamData);
        }

        let start = self.tail();
        self.data.extend(data.iter().cloned());
        self.pending.update(start, start + data.len() as u64);
        Ok(())
    }

    /// Fixes the end of stream at the current tail; the FIN is scheduled
    /// alongside the final byte range.
    pub fn shutdown(&mut self) {
        if self.is_shutdown() {
            return;
        }
        self.eos = self.tail();
        self.pending.update(self.eos, self.eos + 1);
    }

    /// Fixes the end of stream and cancels any untransmitted data. Used when
    /// the stream is reset and an RST takes over from the data path.
    pub fn abort(&mut self) {
        if !self.is_shutdown() {
            self.eos = self.tail();
        }
        self.pending.clear();
    }

    /// Borrows the queued bytes `[offset, offset + len)`. The range must fall
    /// between the unacked base and the tail.
    #[inline]
    pub fn slice(&self, offset: u64, len: usize) -> &[u8] {
        let relative = (offset - self.base) as usize;
        &self.data[relative..relative + len]
    }

    /// Removes an emitted range from the pending set.
    #[inline]
    pub fn emitted(&mut self, start: u64, end: u64) {
        self.pending.remove(start, end);
    }

    /// Marks a range acknowledged and releases any fully-acked prefix.
    pub fn acked(&mut self, start: u64, end: u64) {
        self.acked.update(start, end);
        self.pending.remove(start, end);

        if let Some(first) = self.acked.first().cloned() {
            if first.start <= self.base && first.end > self.base {
                let new_base = first.end;
                let release = (new_base.min(self.tail()) - self.base) as usize;
                unsafe { self.data.move_head(release as isize) };
                self.base = new_base;
            }
        }
    }

    /// Requeues a lost range, minus anything acknowledged since.
    pub fn lost(&mut self, start: u64, end: u64) {
        let mut cursor = start;
        for range in self.acked.iter() {
            if range.end <= cursor {
                continue;
            }
            if range.start >= end {
                break;
            }
            if cursor < range.start {
                self.pending.update(cursor, range.start);
            }
            cursor = range.end;
        }
        if cursor < end {
            self.pending.update(cursor, end);
        }
    }

    /// True once the FIN virtual byte has been acknowledged.
    #[inline]
    pub fn transfer_complete(&self) -> bool {
        self.is_shutdown() && self.base > self.eos
    }
}
