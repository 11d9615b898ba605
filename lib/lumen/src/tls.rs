use crate::crypto::Aead;
use crate::shared::QuicResult;

/// Progress of the handshake after feeding it peer messages.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum HandshakeStatus {
    InProgress,
    Complete,
}

/// Handshake engine consumed by the transport core. The engine owns the TLS
/// record layer, the key schedule and the certificate machinery; the core only
/// moves opaque handshake bytes in and out of it and asks for keying material
/// once the exchange completes.
pub trait TlsSession {
    /// Begins the handshake. Clients pass the server name and receive their
    /// first flight in `out`; servers register state and produce nothing.
    /// `transport_params` is the raw extension body to offer to the peer.
    fn start(
        &mut self,
        server_name: Option<&str>,
        transport_params: &[u8],
        out: &mut Vec<u8>,
    ) -> QuicResult<HandshakeStatus>;

    /// Feeds handshake bytes received from the peer, collecting any response
    /// records in `out`. Partial messages are buffered by the engine.
    fn handshake(&mut self, input: &[u8], out: &mut Vec<u8>) -> QuicResult<HandshakeStatus>;

    fn is_established(&self) -> bool;

    /// The raw transport-parameter extension body offered by the peer.
    fn peer_transport_params(&self) -> Option<&[u8]>;

    /// Exports keying material under the given label.
    fn export_secret(&self, label: &[u8]) -> QuicResult<Vec<u8>>;

    /// Builds a packet-protection context keyed from an exported secret,
    /// using the cipher suite negotiated by the session.
    fn aead(&self, secret: &[u8]) -> QuicResult<Box<dyn Aead>>;
}
