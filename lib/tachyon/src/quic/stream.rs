use crate::quic::maxsender::MaxSender;
use crate::quic::recvbuf::RecvBuffer;
use crate::quic::sendbuf::SendBuffer;
use lumen::shared::{QuicError, QuicResult};

pub type StreamId = u32;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SenderState {
    None,
    Send,
    Inflight,
    Acked,
}

/// Transmission state of a one-shot stream control signal (RST_STREAM or
/// STOP_SENDING). Armed once; loss sends it again.
#[derive(Clone, Copy, Debug)]
pub struct StateSender {
    pub state: SenderState,
    pub error_code: u32,
}

impl StateSender {
    #[inline]
    fn new() -> StateSender {
        StateSender {
            state: SenderState::None,
            error_code: 0,
        }
    }

    #[inline]
    pub(crate) fn arm(&mut self, error_code: u32) {
        if self.state == SenderState::None {
            self.state = SenderState::Send;
            self.error_code = error_code;
        }
    }
}

/// A reliable byte channel inside a connection: a send buffer and a receive
/// buffer joined to their flow-control windows and stream control senders.
pub struct Stream {
    id: StreamId,
    pub(crate) send: SendBuffer,
    pub(crate) recv: RecvBuffer,

    // Egress side: peer-granted window, transmission high-water, senders
    pub(crate) max_stream_data: u64,
    pub(crate) max_sent: u64,
    pub(crate) rst: StateSender,
    pub(crate) stop: StateSender,

    // Ingress side: local window advertiser, abort code from the peer
    pub(crate) window: u64,
    pub(crate) max_sender: MaxSender,
    pub(crate) rst_received: Option<u32>,

    pub(crate) close_requested: bool,
}

impl Stream {
    pub(crate) fn new(id: StreamId, max_stream_data: u64, window: u64) -> Stream {
        Stream {
            id,
            send: SendBuffer::new(),
            recv: RecvBuffer::new(),
            max_stream_data,
            max_sent: 0,
            rst: StateSender::new(),
            stop: StateSender::new(),
            window,
            max_sender: MaxSender::new(window),
            rst_received: None,
            close_requested: false,
        }
    }

    #[inline]
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Appends bytes to the send queue. Rejected once the stream was shut
    /// down or reset.
    pub fn write(&mut self, data: &[u8]) -> QuicResult<()> {
        if self.rst.state != SenderState::None {
            return Err(QuicError::InvalidStreamData);
        }
        self.send.write(data)
    }

    /// Marks the end of the outgoing data; the FIN ships with the last bytes.
    #[inline]
    pub fn shutdown(&mut self) {
        if self.rst.state == SenderState::None {
            self.send.shutdown();
        }
    }

    /// Abandons the outgoing data. When everything through the end of stream
    /// was already transmitted the FIN does the job and no RST is scheduled.
    pub fn reset(&mut self, error_code: u32) {
        if self.send.is_shutdown() && self.max_sent >= self.send.eos() {
            return;
        }
        self.send.abort();
        self.rst.arm(error_code);
    }

    /// Asks the peer to stop transmitting on this stream.
    #[inline]
    pub fn stop_sending(&mut self, error_code: u32) {
        self.stop.arm(error_code);
    }

    /// Contiguous received bytes, borrowed from the reassembly buffer.
    #[inline]
    pub fn readable(&self) -> &[u8] {
        self.recv.readable()
    }

    /// Releases bytes previously exposed by `readable`.
    #[inline]
    pub fn consume(&mut self, count: usize) -> QuicResult<()> {
        self.recv.shift(count)
    }

    /// Abort code received from the peer, if any.
    #[inline]
    pub fn rst_received(&self) -> Option<u32> {
        self.rst_received
    }

    /// The send side is finished: every byte and the FIN acknowledged, or the
    /// RST acknowledged.
    #[inline]
    pub fn send_complete(&self) -> bool {
        self.send.transfer_complete() || self.rst.state == SenderState::Acked
    }

    /// The receive side is finished: delivered through the end of stream, or
    /// aborted by the peer.
    #[inline]
    pub fn recv_complete(&self) -> bool {
        self.recv.transfer_complete() || self.rst_received.is_some()
    }

    #[inline]
    pub(crate) fn is_destroyable(&self) -> bool {
        self.close_requested && self.send_complete() && self.recv_complete()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_after_shutdown_rejected() {
        let mut stream = Stream::new(1, 8192, 8192);
        stream.write(b"data").unwrap();
        stream.shutdown();
        assert_eq!(stream.write(b"more"), Err(QuicError::InvalidStreamData));
    }

    #[test]
    fn test_reset_arms_rst_sender() {
        let mut stream = Stream::new(1, 8192, 8192);
        stream.write(&[0u8; 1000]).unwrap();
        stream.shutdown();
        stream.reset(42);

        assert_eq!(stream.rst.state, SenderState::Send);
        assert_eq!(stream.rst.error_code, 42);
        assert_eq!(stream.send.eos(), 1000);
        assert!(stream.send.pending().is_empty());
    }

    #[test]
    fn test_reset_after_everything_sent_keeps_fin() {
        let mut stream = Stream::new(1, 8192, 8192);
        stream.write(&[0u8; 100]).unwrap();
        stream.shutdown();
        stream.max_sent = 101;
        stream.send.emitted(0, 101);

        stream.reset(42);
        assert_eq!(stream.rst.state, SenderState::None);
    }

    #[test]
    fn test_reset_is_sticky() {
        let mut stream = Stream::new(1, 8192, 8192);
        stream.write(&[0u8; 10]).unwrap();
        stream.reset(1);
        stream.reset(2);
        assert_eq!(stream.rst.error_code, 1);
    }

    #[test]
    fn test_destroyable_needs_all_three_conditions() {
        let mut stream = Stream::new(1, 8192, 8192);
        stream.shutdown();
        stream.send.emitted(0, 1);
        stream.send.acked(0, 1);
        stream.recv.mark_eos(0).unwrap();

        assert!(!stream.is_destroyable());
        stream.close_requested = true;
        assert!(stream.is_destroyable());
    }

    #[test]
    fn test_peer_rst_completes_receive_side() {
        let mut stream = Stream::new(1, 8192, 8192);
        assert!(!stream.recv_complete());
        stream.rst_received = Some(9);
        assert!(stream.recv_complete());
    }
}
