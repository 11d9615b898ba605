//! The transport modules implement the per-connection QUIC engine: wire
//! coding, packet protection, stream multiplexing and loss recovery.

pub mod acks;
pub mod connection;
pub mod frame;
pub mod maxsender;
pub mod packet;
pub mod params;
pub mod ranges;
pub mod recvbuf;
pub mod sendbuf;
pub mod stream;
pub mod wire;
