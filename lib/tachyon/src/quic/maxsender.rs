/// Advertiser of a monotonically increasing flow-control limit. Keeps the
/// latched (acknowledged) value apart from the in-flight high-water so an
/// update is sent once per increment and rescheduled on loss.
#[derive(Clone, Copy, Debug)]
pub struct MaxSender {
    max_acked: u64,
    max_inflight: u64,
}

impl MaxSender {
    #[inline]
    pub fn new(initial: u64) -> MaxSender {
        MaxSender {
            max_acked: initial,
            max_inflight: initial,
        }
    }

    /// Highest value ever put on the wire; the peer must stay below it.
    #[inline]
    pub fn limit(&self) -> u64 {
        self.max_inflight
    }

    /// True when advertising `consumed + window` would move the limit forward
    /// by at least `slack`.
    #[inline]
    pub fn should_update(&self, consumed: u64, window: u64, slack: u64) -> bool {
        consumed + window >= self.max_inflight + slack
    }

    /// Registers a new in-flight advertisement.
    #[inline]
    pub fn record(&mut self, value: u64) {
        debug_assert!(value >= self.max_inflight);
        self.max_inflight = value;
    }

    /// Latches an acknowledged advertisement.
    #[inline]
    pub fn acked(&mut self, value: u64) {
        if value > self.max_acked {
            self.max_acked = value;
        }
    }

    /// Rewinds the high-water when the lost witness was the newest one, so the
    /// advertisement is scheduled again.
    #[inline]
    pub fn lost(&mut self, value: u64) {
        if self.max_inflight == value {
            self.max_inflight = self.max_acked;
        }
    }
}
