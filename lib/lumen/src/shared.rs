use std::io;

pub type QuicResult<T> = Result<T, QuicError>;

/// Errors surfaced by the transport core. Non-fatal variants leave the
/// connection usable; everything else tears it down.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum QuicError {
    InvalidPacketHeader,
    DecryptionFailure,
    InvalidFrameData,
    InvalidStreamData,
    VersionNegotiationMismatch,
    PacketIgnored,
    HandshakeTooLarge,
    TooManyOpenStreams,
    FlowControlError,
    Tls,
}

impl From<io::Error> for QuicError {
    // Reads running past the end of a wire buffer surface as malformed frames.
    #[inline]
    fn from(_: io::Error) -> Self {
        QuicError::InvalidFrameData
    }
}

pub trait ErrorUtils {
    fn is_fatal(&self) -> bool;
}

impl<T> ErrorUtils for QuicResult<T> {
    fn is_fatal(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(QuicError::PacketIgnored) => false,
            Err(QuicError::DecryptionFailure) => false,
            _ => true,
        }
    }
}

/// Augmented `io::Write` that is aware of the amount of remaining free capacity
/// in the destination.
pub trait SizedWrite: io::Write {
    /// Remaining free capacity in the destination.
    fn free_capacity(&self) -> usize;
}

/// Augmented `io::Read` that is aware of the amount of remaining data in the
/// source.
pub trait SizedRead: io::Read {
    /// Remaining data in the source.
    fn remaining_data(&self) -> usize;
}

impl SizedWrite for io::Cursor<&mut [u8]> {
    #[inline]
    fn free_capacity(&self) -> usize {
        self.get_ref().len() - self.position() as usize
    }
}

impl SizedRead for io::Cursor<&[u8]> {
    #[inline]
    fn remaining_data(&self) -> usize {
        self.get_ref().len() - self.position() as usize
    }
}
