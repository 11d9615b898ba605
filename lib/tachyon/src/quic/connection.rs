use crate::quic::acks::{AckLedger, AckPayload, AckRecord, StateSenderKind};
use crate::quic::frame::{AckFrame, Frame, StreamFrame};
use crate::quic::maxsender::MaxSender;
use crate::quic::packet::{self, PacketKind, PacketView};
use crate::quic::params::{self, TransportParams};
use crate::quic::ranges::RangeSet;
use crate::quic::stream::{SenderState, Stream, StreamId};
use crate::PROTOCOL_VERSION;
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use indexmap::IndexMap;
use lumen::crypto::{self, Aead};
use lumen::logging;
use lumen::shared::{QuicError, QuicResult, SizedWrite};
use lumen::tls::{HandshakeStatus, TlsSession};
use std::io;
use std::net::SocketAddr;

const EXPORTER_LABEL_CLIENT: &[u8] = b"EXPORTER-QUIC client 1-RTT Secret";
const EXPORTER_LABEL_SERVER: &[u8] = b"EXPORTER-QUIC server 1-RTT Secret";

// Cap on ranges packed into one ACK frame; older ranges are dropped first
const MAX_ACK_RANGES: usize = 64;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum State {
    BeforeSh,
    BeforeSf,
    OneRttEncrypted,
}

/// Changes surfaced to the application, drained via `Connection::events`.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum StreamEvent {
    Opened(StreamId),
    Data(StreamId),
    Reset(StreamId, u32),
    StopSending(StreamId, u32),
}

#[derive(Clone, Copy, Debug)]
pub struct Config {
    pub max_packet_size: usize,
    /// Retransmission timeout in milliseconds.
    pub initial_rto: u64,
    pub params: TransportParams,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            max_packet_size: 1280,
            initial_rto: 500,
            params: TransportParams::default(),
        }
    }
}

struct EgressState {
    packet_number: u64,
    secret: Vec<u8>,
    aead: Option<Box<dyn Aead>>,
}

struct IngressState {
    next_expected: u64,
    acks: RangeSet,
    secret: Vec<u8>,
    aead: Option<Box<dyn Aead>>,
}

/// Connection-level egress credit granted by the peer.
struct FlowControl {
    permitted: u64,
    sent: u64,
}

/// A single QUIC connection: stream registry, packet protection state, loss
/// ledger and the send scheduler. Not thread-safe; every entry point runs to
/// completion under the caller's exclusion.
pub struct Connection {
    role: Role,
    state: State,
    cid: u64,
    peer_addr: SocketAddr,
    config: Config,
    tls: Box<dyn TlsSession>,

    streams: IndexMap<StreamId, Stream>,
    host_next_stream_id: u32,
    peer_next_stream_id: u32,
    host_open_enabled: bool,
    peer_open_enabled: bool,

    peer_params: TransportParams,
    egress: EgressState,
    ingress: IngressState,
    egress_max_data: FlowControl,
    max_data_sender: MaxSender,
    consumed_base: u64,

    ledger: AckLedger,
    events: Vec<StreamEvent>,
    encrypted_acks_only: bool,

    log: logging::Logger,
}

impl Connection {
    fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        role: Role,
        cid: u64,
        config: Config,
        tls: Box<dyn TlsSession>,
        peer_addr: SocketAddr,
        log: L,
    ) -> Connection {
        let log = logging::root(log);
        let peer_params = TransportParams::default();

        let mut streams = IndexMap::new();
        streams.insert(
            0,
            Stream::new(
                0,
                u64::from(peer_params.initial_max_stream_data),
                u64::from(config.params.initial_max_stream_data),
            ),
        );

        logging::debug!(log, "connection created"; "role" => ?role, "cid" => cid);

        Connection {
            role,
            state: match role {
                Role::Client => State::BeforeSh,
                Role::Server => State::BeforeSf,
            },
            cid,
            peer_addr,
            config,
            tls,
            streams,
            host_next_stream_id: match role {
                Role::Client => 1,
                Role::Server => 2,
            },
            peer_next_stream_id: match role {
                Role::Client => 2,
                Role::Server => 1,
            },
            host_open_enabled: true,
            peer_open_enabled: true,
            egress: EgressState {
                packet_number: 0,
                secret: Vec::new(),
                aead: None,
            },
            ingress: IngressState {
                next_expected: 0,
                acks: RangeSet::new(),
                secret: Vec::new(),
                aead: None,
            },
            egress_max_data: FlowControl {
                permitted: u64::from(peer_params.initial_max_data_kb) * 1024,
                sent: 0,
            },
            max_data_sender: MaxSender::new(u64::from(config.params.initial_max_data_kb)),
            consumed_base: 0,
            ledger: AckLedger::new(),
            events: Vec::new(),
            encrypted_acks_only: false,
            peer_params,
            log,
        }
    }

    /// Creates a client connection and queues the first handshake flight on
    /// stream 0. The caller drives transmission through `send`.
    pub fn connect<'a, L: Into<Option<&'a logging::Logger>>>(
        config: Config,
        mut tls: Box<dyn TlsSession>,
        peer_addr: SocketAddr,
        server_name: &str,
        log: L,
    ) -> QuicResult<Connection> {
        let mut cid_bytes = [0u8; 8];
        crypto::random_bytes(&mut cid_bytes);
        let cid = BigEndian::read_u64(&cid_bytes);

        let offer = params::encode_client(PROTOCOL_VERSION, PROTOCOL_VERSION, &config.params);
        let mut first_flight = Vec::new();
        tls.start(Some(server_name), &offer, &mut first_flight)?;

        let mut conn = Self::new(Role::Client, cid, config, tls, peer_addr, log);
        conn.streams
            .get_mut(&0)
            .expect("stream 0 must exist")
            .send
            .write(&first_flight)?;
        Ok(conn)
    }

    /// Creates a server connection from the client's first packet, which must
    /// be a CLIENT_INITIAL. The connection adopts the client-chosen id.
    pub fn accept<'a, L: Into<Option<&'a logging::Logger>>>(
        config: Config,
        mut tls: Box<dyn TlsSession>,
        peer_addr: SocketAddr,
        first_packet: &mut PacketView<'_>,
        now: u64,
        log: L,
    ) -> QuicResult<Connection> {
        match first_packet.kind {
            PacketKind::Long { ty, .. } if ty == packet::PACKET_TYPE_CLIENT_INITIAL => {}
            _ => return Err(QuicError::InvalidPacketHeader),
        }
        let cid = first_packet.cid.ok_or(QuicError::InvalidPacketHeader)?;

        let offer = params::encode_server(&[PROTOCOL_VERSION], &config.params);
        let mut unused = Vec::new();
        tls.start(None, &offer, &mut unused)?;

        let mut conn = Self::new(Role::Server, cid, config, tls, peer_addr, log);
        conn.receive(first_packet, now)?;
        Ok(conn)
    }

    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    #[inline]
    pub fn state(&self) -> State {
        self.state
    }

    #[inline]
    pub fn cid(&self) -> u64 {
        self.cid
    }

    #[inline]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Peer limits; defaults until the handshake commits the negotiated set.
    #[inline]
    pub fn peer_params(&self) -> &TransportParams {
        &self.peer_params
    }

    #[inline]
    pub fn stream(&self, id: StreamId) -> Option<&Stream> {
        self.streams.get(&id)
    }

    #[inline]
    pub fn stream_mut(&mut self, id: StreamId) -> Option<&mut Stream> {
        self.streams.get_mut(&id)
    }

    /// Opens a host-initiated stream.
    pub fn open_stream(&mut self) -> QuicResult<StreamId> {
        if !self.host_open_enabled {
            return Err(QuicError::TooManyOpenStreams);
        }
        let id = self.host_next_stream_id;
        if u64::from(id) > u64::from(self.peer_params.initial_max_stream_id) {
            return Err(QuicError::TooManyOpenStreams);
        }

        self.streams.insert(
            id,
            Stream::new(
                id,
                u64::from(self.peer_params.initial_max_stream_data),
                u64::from(self.config.params.initial_max_stream_data),
            ),
        );
        match id.checked_add(2) {
            Some(next) if next <= i32::max_value() as u32 => self.host_next_stream_id = next,
            _ => self.host_open_enabled = false,
        }

        logging::debug!(self.log, "stream opened"; "stream_id" => id);
        Ok(id)
    }

    /// Requests destruction of a stream. The stream lives on until its send
    /// side is fully acknowledged and its receive side is complete.
    pub fn close_stream(&mut self, id: StreamId) -> QuicResult<()> {
        if id == 0 {
            return Err(QuicError::InvalidStreamData);
        }
        match self.streams.get_mut(&id) {
            Some(stream) => stream.close_requested = true,
            None => return Err(QuicError::InvalidStreamData),
        }
        self.sweep_destroyed();
        Ok(())
    }

    /// Drains the change queue accumulated by `receive` and `send`.
    #[inline]
    pub fn events(&mut self) -> impl Iterator<Item = StreamEvent> + '_ {
        self.events.drain(..)
    }

    /// Deadline of the retransmission timer, if any packet is outstanding.
    #[inline]
    pub fn next_timeout(&self) -> Option<u64> {
        self.ledger.oldest_sent_at().map(|at| at + self.config.initial_rto)
    }

    fn sweep_destroyed(&mut self) {
        let dead: Vec<StreamId> = self
            .streams
            .iter()
            .filter(|(&id, stream)| id != 0 && stream.is_destroyable())
            .map(|(&id, _)| id)
            .collect();

        for id in dead {
            if let Some(stream) = self.streams.shift_remove(&id) {
                self.consumed_base += stream.recv.consumed();
                logging::debug!(self.log, "stream destroyed"; "stream_id" => id);
            }
        }
    }
}

// Receive path
impl Connection {
    /// Processes one decoded packet. Protection is removed in place, so the
    /// datagram buffer is mutated. Non-fatal outcomes (`PacketIgnored`,
    /// `DecryptionFailure`) leave the connection intact.
    pub fn receive(&mut self, packet: &mut PacketView<'_>, now: u64) -> QuicResult<()> {
        if let Some(cid) = packet.cid {
            if cid != self.cid {
                return Err(QuicError::InvalidPacketHeader);
            }
        }

        let (plain_len, pn, protected) = self.unprotect(packet)?;
        if plain_len == 0 {
            return Err(QuicError::InvalidFrameData);
        }

        logging::trace!(self.log, "packet received";
                        "packet_number" => pn,
                        "len" => plain_len,
                        "protected" => protected,
                        "now" => now);

        let mut ack_eliciting = false;
        {
            let payload = &packet.payload[..plain_len];
            let mut cursor = io::Cursor::new(payload);

            while (cursor.position() as usize) < plain_len {
                match Frame::read(&mut cursor)? {
                    Frame::Padding => {}
                    Frame::Ack(ack) => self.apply_ack(&ack)?,
                    Frame::Stream(frame) => {
                        ack_eliciting = true;
                        self.apply_stream_frame(&frame)?;
                    }
                    Frame::RstStream {
                        stream_id,
                        error_code,
                        final_offset,
                    } => {
                        ack_eliciting = true;
                        self.apply_rst_stream(stream_id, error_code, final_offset)?;
                    }
                    Frame::StopSending { stream_id, error_code } => {
                        ack_eliciting = true;
                        self.apply_stop_sending(stream_id, error_code)?;
                    }
                    Frame::MaxData { max_data_kb } => {
                        ack_eliciting = true;
                        self.apply_max_data(max_data_kb)?;
                    }
                    Frame::MaxStreamData {
                        stream_id,
                        max_stream_data,
                    } => {
                        ack_eliciting = true;
                        self.apply_max_stream_data(stream_id, max_stream_data)?;
                    }
                }
            }
        }

        if ack_eliciting {
            // Once the peer elicits acks under 1-RTT protection, a server must
            // not leak them through cleartext packets anymore
            if protected && self.role == Role::Server {
                self.encrypted_acks_only = true;
            }
            self.ingress.acks.update(pn, pn + 1);
        }
        self.ingress.next_expected = self.ingress.next_expected.max(pn + 1);

        if let PacketKind::Long { ty, .. } = packet.kind {
            if ty == packet::PACKET_TYPE_SERVER_CLEARTEXT && self.state == State::BeforeSh {
                self.state = State::BeforeSf;
            }
        }

        self.pump_handshake()?;
        self.sweep_destroyed();
        Ok(())
    }

    /// Validates role/state gating and removes packet protection, returning
    /// the plaintext length, the recovered packet number and whether the
    /// packet was AEAD-protected.
    fn unprotect(&mut self, packet: &mut PacketView<'_>) -> QuicResult<(usize, u64, bool)> {
        match packet.kind {
            PacketKind::Long { ty, version } => {
                if version != PROTOCOL_VERSION {
                    return Err(QuicError::InvalidPacketHeader);
                }

                match ty {
                    packet::PACKET_TYPE_SERVER_CLEARTEXT => {
                        if self.role != Role::Client {
                            return Err(QuicError::InvalidPacketHeader);
                        }
                    }
                    packet::PACKET_TYPE_CLIENT_INITIAL | packet::PACKET_TYPE_CLIENT_CLEARTEXT => {
                        if self.role != Role::Server {
                            return Err(QuicError::InvalidPacketHeader);
                        }
                    }
                    packet::PACKET_TYPE_1RTT_KEY_PHASE_0 => {}
                    // Version negotiation, retry, 0-RTT and phase-1 keys are
                    // not handled by this endpoint
                    _ => return Err(QuicError::PacketIgnored),
                }

                let pn = packet::recover_packet_number(
                    packet.packet_number,
                    packet.pn_width,
                    self.ingress.next_expected,
                );

                match ty {
                    packet::PACKET_TYPE_1RTT_KEY_PHASE_0 => {
                        let aead = match self.ingress.aead.as_ref() {
                            Some(aead) => aead,
                            None => return Err(QuicError::PacketIgnored),
                        };
                        let len = aead.open(pn, packet.header, packet.payload)?;
                        Ok((len, pn, true))
                    }
                    _ => {
                        let len = packet::verify_cleartext(packet.header, packet.payload)?;
                        Ok((len, pn, false))
                    }
                }
            }
            PacketKind::Short { key_phase } => {
                if self.state != State::OneRttEncrypted {
                    return Err(QuicError::PacketIgnored);
                }
                if key_phase {
                    // Only phase-0 keys are installed
                    return Err(QuicError::PacketIgnored);
                }
                let aead = match self.ingress.aead.as_ref() {
                    Some(aead) => aead,
                    None => return Err(QuicError::PacketIgnored),
                };

                let pn = packet::recover_packet_number(
                    packet.packet_number,
                    packet.pn_width,
                    self.ingress.next_expected,
                );
                let len = aead.open(pn, packet.header, packet.payload)?;
                Ok((len, pn, true))
            }
        }
    }

    /// Opens the addressed stream implicitly when a frame names an unopened
    /// peer-parity id, filling every gap below it. Stale ids (already
    /// destroyed streams) simply stay absent from the registry.
    fn ensure_stream(&mut self, id: StreamId) -> QuicResult<()> {
        if self.streams.contains_key(&id) {
            return Ok(());
        }

        let peer_bit = match self.role {
            Role::Client => 0,
            Role::Server => 1,
        };
        if id & 1 != peer_bit {
            // Host parity: a frame for a stream this endpoint never opened
            if id >= self.host_next_stream_id {
                return Err(QuicError::InvalidStreamData);
            }
            return Ok(());
        }

        if u64::from(id) > u64::from(self.config.params.initial_max_stream_id) {
            return Err(QuicError::InvalidStreamData);
        }
        if !self.peer_open_enabled || id < self.peer_next_stream_id {
            return Ok(());
        }

        loop {
            let sid = self.peer_next_stream_id;
            self.streams.insert(
                sid,
                Stream::new(
                    sid,
                    u64::from(self.peer_params.initial_max_stream_data),
                    u64::from(self.config.params.initial_max_stream_data),
                ),
            );
            self.events.push(StreamEvent::Opened(sid));
            logging::debug!(self.log, "peer stream opened"; "stream_id" => sid);

            match sid.checked_add(2) {
                Some(next) if next <= i32::max_value() as u32 => self.peer_next_stream_id = next,
                _ => self.peer_open_enabled = false,
            }
            if sid == id || !self.peer_open_enabled {
                break;
            }
        }
        Ok(())
    }

    fn apply_stream_frame(&mut self, frame: &StreamFrame<'_>) -> QuicResult<()> {
        self.ensure_stream(frame.stream_id)?;
        let stream = match self.streams.get_mut(&frame.stream_id) {
            Some(stream) => stream,
            None => return Ok(()),
        };

        let end = frame.offset + frame.data.len() as u64;
        if end > stream.max_sender.limit() {
            return Err(QuicError::InvalidStreamData);
        }

        if frame.fin {
            stream.recv.mark_eos(end)?;
        }
        if stream.rst_received().is_some() {
            return Ok(());
        }

        let before = stream.recv.readable().len();
        stream.recv.write(frame.offset, frame.data)?;
        let grew = stream.recv.readable().len() > before
            || (frame.fin && stream.recv.transfer_complete());

        let id = stream.id();
        if id != 0 && grew {
            self.events.push(StreamEvent::Data(id));
        }
        Ok(())
    }

    fn apply_rst_stream(&mut self, id: StreamId, error_code: u32, final_offset: u64) -> QuicResult<()> {
        if id == 0 {
            return Err(QuicError::InvalidStreamData);
        }
        self.ensure_stream(id)?;
        let stream = match self.streams.get_mut(&id) {
            Some(stream) => stream,
            None => return Ok(()),
        };

        if final_offset > stream.max_sender.limit() {
            return Err(QuicError::InvalidStreamData);
        }
        stream.recv.mark_eos(final_offset)?;

        if stream.rst_received().is_none() {
            stream.rst_received = Some(error_code);
            self.events.push(StreamEvent::Reset(id, error_code));
            logging::debug!(self.log, "stream reset by peer";
                            "stream_id" => id,
                            "error_code" => error_code,
                            "final_offset" => final_offset);
        }
        Ok(())
    }

    fn apply_stop_sending(&mut self, id: StreamId, error_code: u32) -> QuicResult<()> {
        if id == 0 {
            return Err(QuicError::InvalidStreamData);
        }
        self.ensure_stream(id)?;
        let stream = match self.streams.get_mut(&id) {
            Some(stream) => stream,
            None => return Ok(()),
        };

        let was_idle = stream.rst.state == SenderState::None;
        stream.reset(error_code);
        if was_idle && stream.rst.state == SenderState::Send {
            self.events.push(StreamEvent::StopSending(id, error_code));
        }
        Ok(())
    }

    fn apply_max_data(&mut self, max_data_kb: u64) -> QuicResult<()> {
        let permitted = max_data_kb.saturating_mul(1024);
        if permitted < self.egress_max_data.permitted {
            return Err(QuicError::FlowControlError);
        }
        self.egress_max_data.permitted = permitted;
        Ok(())
    }

    fn apply_max_stream_data(&mut self, id: StreamId, max_stream_data: u64) -> QuicResult<()> {
        self.ensure_stream(id)?;
        let stream = match self.streams.get_mut(&id) {
            Some(stream) => stream,
            None => return Ok(()),
        };

        if max_stream_data < stream.max_stream_data {
            return Err(QuicError::FlowControlError);
        }
        stream.max_stream_data = max_stream_data;
        Ok(())
    }

    fn apply_ack(&mut self, ack: &AckFrame) -> QuicResult<()> {
        let hits = self.ledger.take_acked(&ack.acked);
        if hits.is_empty() {
            logging::debug!(self.log, "duplicate or stale ack ignored"; "largest" => ack.largest);
            return Ok(());
        }

        for record in hits {
            Self::dispatch_record(&mut self.streams, &mut self.max_data_sender, record, true, &self.log);
        }
        Ok(())
    }

    /// Replays an ack record against the structure that emitted it.
    fn dispatch_record(
        streams: &mut IndexMap<StreamId, Stream>,
        max_data_sender: &mut MaxSender,
        record: AckRecord,
        acked: bool,
        log: &logging::Logger,
    ) {
        match record.payload {
            AckPayload::Stream { stream_id, start, end } => {
                if let Some(stream) = streams.get_mut(&stream_id) {
                    match acked {
                        true => stream.send.acked(start, end),
                        false => stream.send.lost(start, end),
                    }
                }
            }
            AckPayload::MaxData { max_data_kb } => match acked {
                true => max_data_sender.acked(max_data_kb),
                false => max_data_sender.lost(max_data_kb),
            },
            AckPayload::MaxStreamData {
                stream_id,
                max_stream_data,
            } => {
                if let Some(stream) = streams.get_mut(&stream_id) {
                    match acked {
                        true => stream.max_sender.acked(max_stream_data),
                        false => stream.max_sender.lost(max_stream_data),
                    }
                }
            }
            AckPayload::StreamState { stream_id, sender } => {
                if let Some(stream) = streams.get_mut(&stream_id) {
                    let field = match sender {
                        StateSenderKind::Reset => &mut stream.rst,
                        StateSenderKind::StopSending => &mut stream.stop,
                    };
                    match acked {
                        true => field.state = SenderState::Acked,
                        false => {
                            if field.state == SenderState::Inflight {
                                field.state = SenderState::Send;
                            }
                        }
                    }
                }
            }
        }

        logging::trace!(log, "ack record dispatched";
                        "packet_number" => record.packet_number,
                        "acked" => acked);
    }

    /// Moves contiguous stream-0 bytes into the TLS engine and its responses
    /// back out; installs 1-RTT keys when the handshake completes.
    fn pump_handshake(&mut self) -> QuicResult<()> {
        loop {
            let stream0 = self.streams.get_mut(&0).expect("stream 0 must exist");
            let available = stream0.recv.readable().len();
            if available == 0 {
                return Ok(());
            }

            let mut response = Vec::new();
            let status = self.tls.handshake(stream0.recv.readable(), &mut response)?;

            stream0.recv.shift(available)?;
            if !response.is_empty() {
                stream0.send.write(&response)?;
            }

            if status == HandshakeStatus::Complete && self.state != State::OneRttEncrypted {
                self.setup_1rtt()?;
            }
        }
    }

    /// Commits the peer's transport parameters and installs the 1-RTT keys.
    /// Any failure here propagates to the caller.
    fn setup_1rtt(&mut self) -> QuicResult<()> {
        let body = self.tls.peer_transport_params().ok_or(QuicError::Tls)?.to_vec();
        let peer_params = match self.role {
            Role::Client => params::decode_from_server(&body, PROTOCOL_VERSION)?,
            Role::Server => params::decode_from_client(&body, PROTOCOL_VERSION)?,
        };

        self.peer_params = peer_params;
        self.egress_max_data.permitted = u64::from(peer_params.initial_max_data_kb) * 1024;
        for (_, stream) in self.streams.iter_mut() {
            stream.max_stream_data = u64::from(peer_params.initial_max_stream_data);
        }

        let (egress_label, ingress_label) = match self.role {
            Role::Client => (EXPORTER_LABEL_CLIENT, EXPORTER_LABEL_SERVER),
            Role::Server => (EXPORTER_LABEL_SERVER, EXPORTER_LABEL_CLIENT),
        };

        let egress_secret = self.tls.export_secret(egress_label)?;
        let ingress_secret = self.tls.export_secret(ingress_label)?;
        self.egress.aead = Some(self.tls.aead(&egress_secret)?);
        self.ingress.aead = Some(self.tls.aead(&ingress_secret)?);
        self.egress.secret = egress_secret;
        self.ingress.secret = ingress_secret;

        self.state = State::OneRttEncrypted;
        logging::debug!(self.log, "handshake complete, 1-rtt keys installed"; "role" => ?self.role);
        Ok(())
    }
}

enum Pass {
    Cleartext(u8),
    Encrypted,
}

struct PacketBuilder {
    buf: Vec<u8>,
    header_len: usize,
    capacity: usize,
    packet_number: u64,
    long_type: Option<u8>,
}

impl PacketBuilder {
    fn long(ty: u8, cid: u64, packet_number: u64, version: u32, capacity: usize) -> PacketBuilder {
        let mut buf = Vec::with_capacity(packet::LONG_HEADER_SIZE + capacity + packet::FNV1A_TRAILER_SIZE);
        packet::write_long_header(&mut buf, ty, cid, packet_number as u32, version);
        let header_len = buf.len();
        PacketBuilder {
            buf,
            header_len,
            capacity,
            packet_number,
            long_type: Some(ty),
        }
    }

    fn short(cid: Option<u64>, packet_number: u64, capacity: usize) -> PacketBuilder {
        let mut buf = Vec::new();
        packet::write_short_header(&mut buf, cid, false, packet_number as u32);
        let header_len = buf.len();
        PacketBuilder {
            buf,
            header_len,
            capacity,
            packet_number,
            long_type: None,
        }
    }

    #[inline]
    fn payload_len(&self) -> usize {
        self.buf.len() - self.header_len
    }
}

impl io::Write for PacketBuilder {
    #[inline]
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    #[inline]
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SizedWrite for PacketBuilder {
    #[inline]
    fn free_capacity(&self) -> usize {
        self.capacity.saturating_sub(self.payload_len())
    }
}

/// Per-call state of the send scheduler: the datagram vector under
/// construction, the active pass and the packet being filled.
struct SendContext<'a> {
    out: &'a mut Vec<Vec<u8>>,
    egress: &'a mut EgressState,
    log: &'a logging::Logger,
    cid: u64,
    short_cid: Option<u64>,
    version: u32,
    max_packet_size: usize,
    max_packets: usize,
    now: u64,
    emitted: usize,
    pass: Pass,
    builder: Option<PacketBuilder>,
    initial_done: bool,
}

impl<'a> SendContext<'a> {
    /// Hands out a packet under construction with at least `min` payload
    /// bytes free, committing the previous one if needed. `None` means the
    /// packet budget for this call is exhausted.
    fn ensure(&mut self, min: usize) -> QuicResult<Option<&mut PacketBuilder>> {
        let need_new = match &self.builder {
            Some(builder) => builder.free_capacity() < min,
            None => true,
        };

        if need_new {
            self.commit()?;
            if self.emitted >= self.max_packets {
                return Ok(None);
            }

            let builder = match self.pass {
                Pass::Cleartext(ty) => {
                    if ty == packet::PACKET_TYPE_CLIENT_INITIAL && self.initial_done {
                        // The whole first flight must fit one padded datagram
                        return Err(QuicError::HandshakeTooLarge);
                    }
                    let capacity = match ty == packet::PACKET_TYPE_CLIENT_INITIAL {
                        true => packet::INITIAL_PAYLOAD_SIZE,
                        false => {
                            self.max_packet_size - packet::LONG_HEADER_SIZE - packet::FNV1A_TRAILER_SIZE
                        }
                    };
                    PacketBuilder::long(ty, self.cid, self.egress.packet_number, self.version, capacity)
                }
                Pass::Encrypted => {
                    let overhead = self
                        .egress
                        .aead
                        .as_ref()
                        .expect("1-rtt keys must be installed")
                        .overhead();
                    let header_len = 1 + self.short_cid.map_or(0, |_| 8) + 4;
                    let capacity = self.max_packet_size - header_len - overhead;
                    PacketBuilder::short(self.short_cid, self.egress.packet_number, capacity)
                }
            };
            self.builder = Some(builder);
        }

        Ok(self.builder.as_mut())
    }

    /// Finalizes the packet under construction: pads CLIENT_INITIALs, applies
    /// the FNV-1a trailer or the AEAD, and advances the packet number. Empty
    /// packets are discarded without consuming a number.
    fn commit(&mut self) -> QuicResult<()> {
        let mut builder = match self.builder.take() {
            Some(builder) => builder,
            None => return Ok(()),
        };
        if builder.payload_len() == 0 {
            return Ok(());
        }

        match builder.long_type {
            Some(ty) => {
                if ty == packet::PACKET_TYPE_CLIENT_INITIAL {
                    builder.buf.resize(builder.header_len + packet::INITIAL_PAYLOAD_SIZE, 0);
                    self.initial_done = true;
                }
                let hash = packet::fnv1a(packet::FNV1A_OFFSET_BASIS, &builder.buf);
                builder
                    .buf
                    .write_u64::<BigEndian>(hash)
                    .expect("Error writing trailer");
            }
            None => {
                let aead = self.egress.aead.as_ref().expect("1-rtt keys must be installed");
                let plain_len = builder.payload_len();
                builder.buf.resize(builder.header_len + plain_len + aead.overhead(), 0);
                let (header, payload) = builder.buf.split_at_mut(builder.header_len);
                aead.seal(builder.packet_number, header, payload, plain_len);
            }
        }

        logging::trace!(self.log, "packet committed";
                        "packet_number" => builder.packet_number,
                        "len" => builder.buf.len());

        self.egress.packet_number = builder.packet_number + 1;
        self.out.push(builder.buf);
        self.emitted += 1;
        Ok(())
    }
}

// Send path
impl Connection {
    /// Fills `out` with up to `max_packets` datagrams: the RTO scan first,
    /// then the cleartext pass (handshake stream and acks), then the 1-RTT
    /// pass over every other stream.
    pub fn send(&mut self, out: &mut Vec<Vec<u8>>, max_packets: usize, now: u64) -> QuicResult<()> {
        if now >= self.config.initial_rto {
            let expired = self.ledger.take_expired(now - self.config.initial_rto);
            for record in expired {
                logging::debug!(self.log, "retransmit timeout fired";
                                "packet_number" => record.packet_number);
                Self::dispatch_record(&mut self.streams, &mut self.max_data_sender, record, false, &self.log);
            }
        }

        let cleartext_type = match self.role {
            Role::Client => match self.state {
                State::BeforeSh => packet::PACKET_TYPE_CLIENT_INITIAL,
                _ => packet::PACKET_TYPE_CLIENT_CLEARTEXT,
            },
            Role::Server => packet::PACKET_TYPE_SERVER_CLEARTEXT,
        };

        let mut ctx = SendContext {
            out,
            egress: &mut self.egress,
            log: &self.log,
            cid: self.cid,
            short_cid: match self.peer_params.truncate_connection_id {
                true => None,
                false => Some(self.cid),
            },
            version: PROTOCOL_VERSION,
            max_packet_size: self.config.max_packet_size,
            max_packets,
            now,
            emitted: 0,
            pass: Pass::Cleartext(cleartext_type),
            builder: None,
            initial_done: false,
        };

        // Cleartext pass: acks (unless forced into 1-RTT packets) and stream 0
        let ack_allowed =
            !(self.encrypted_acks_only && cleartext_type != packet::PACKET_TYPE_CLIENT_INITIAL);
        let mut budget = true;
        if ack_allowed {
            budget = Self::emit_ack(&mut ctx, &mut self.ingress.acks)?;
        }
        if budget {
            let stream0 = self.streams.get_mut(&0).expect("stream 0 must exist");
            if Self::emit_stream_aux(&mut ctx, stream0, &mut self.ledger)? {
                Self::emit_stream_data(&mut ctx, stream0, &mut self.ledger, None)?;
            }
        }
        ctx.commit()?;

        // Encrypted pass: acks, the connection window, then every data stream
        if self.state == State::OneRttEncrypted {
            ctx.pass = Pass::Encrypted;

            let mut budget = Self::emit_ack(&mut ctx, &mut self.ingress.acks)?;

            if budget {
                // Bytes consumed outside the handshake stream drive the
                // connection-level window advertisement
                let consumed = self.consumed_base
                    + self
                        .streams
                        .iter()
                        .filter(|(&id, _)| id != 0)
                        .map(|(_, stream)| stream.recv.consumed())
                        .sum::<u64>();
                let consumed_kb = consumed / 1024;
                let window_kb = u64::from(self.config.params.initial_max_data_kb);
                let slack = (window_kb / 2).max(1);
                if self.max_data_sender.should_update(consumed_kb, window_kb, slack) {
                    let value = consumed_kb + window_kb;
                    let frame = Frame::MaxData { max_data_kb: value };
                    match ctx.ensure(frame.wire_size())? {
                        Some(builder) => {
                            let pn = builder.packet_number;
                            frame.write(builder)?;
                            self.ledger.allocate(pn, now, AckPayload::MaxData { max_data_kb: value });
                            self.max_data_sender.record(value);
                        }
                        None => budget = false,
                    }
                }
            }

            if budget {
                let flow = &mut self.egress_max_data;
                for (_, stream) in self.streams.iter_mut() {
                    if stream.id() == 0 {
                        continue;
                    }
                    if !Self::emit_stream_aux(&mut ctx, stream, &mut self.ledger)? {
                        break;
                    }
                    if !Self::emit_stream_data(&mut ctx, stream, &mut self.ledger, Some(&mut *flow))? {
                        break;
                    }
                }
            }
            ctx.commit()?;
        }

        self.sweep_destroyed();
        Ok(())
    }

    /// Emits one ACK frame covering the ingress ack queue, dropping the
    /// oldest ranges when the queue outgrows a single frame.
    fn emit_ack(ctx: &mut SendContext<'_>, acks: &mut RangeSet) -> QuicResult<bool> {
        if acks.is_empty() {
            return Ok(true);
        }

        if acks.len() > MAX_ACK_RANGES {
            let excess = acks.len() - MAX_ACK_RANGES;
            acks.shrink(0, excess);
        }

        let frame = AckFrame::new(acks, 0);
        match ctx.ensure(frame.wire_size())? {
            Some(builder) => {
                frame.write(builder)?;
                acks.clear();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Emits the pending stream control frames: STOP_SENDING, RST_STREAM and
    /// the receive-window advertisement.
    fn emit_stream_aux(
        ctx: &mut SendContext<'_>,
        stream: &mut Stream,
        ledger: &mut AckLedger,
    ) -> QuicResult<bool> {
        if stream.stop.state == SenderState::Send {
            let frame = Frame::StopSending {
                stream_id: stream.id(),
                error_code: stream.stop.error_code,
            };
            match ctx.ensure(frame.wire_size())? {
                Some(builder) => {
                    let pn = builder.packet_number;
                    frame.write(builder)?;
                    ledger.allocate(
                        pn,
                        ctx.now,
                        AckPayload::StreamState {
                            stream_id: stream.id(),
                            sender: StateSenderKind::StopSending,
                        },
                    );
                    stream.stop.state = SenderState::Inflight;
                }
                None => return Ok(false),
            }
        }

        if stream.rst.state == SenderState::Send {
            let frame = Frame::RstStream {
                stream_id: stream.id(),
                error_code: stream.rst.error_code,
                final_offset: stream.send.eos(),
            };
            match ctx.ensure(frame.wire_size())? {
                Some(builder) => {
                    let pn = builder.packet_number;
                    frame.write(builder)?;
                    ledger.allocate(
                        pn,
                        ctx.now,
                        AckPayload::StreamState {
                            stream_id: stream.id(),
                            sender: StateSenderKind::Reset,
                        },
                    );
                    stream.rst.state = SenderState::Inflight;
                }
                None => return Ok(false),
            }
        }

        if stream.rst_received().is_none() && stream.recv.eos() == u64::max_value() {
            let window = stream.window;
            let slack = (window / 2).max(1);
            if stream.max_sender.should_update(stream.recv.consumed(), window, slack) {
                let value = stream.recv.consumed() + window;
                let frame = Frame::MaxStreamData {
                    stream_id: stream.id(),
                    max_stream_data: value,
                };
                match ctx.ensure(frame.wire_size())? {
                    Some(builder) => {
                        let pn = builder.packet_number;
                        frame.write(builder)?;
                        ledger.allocate(
                            pn,
                            ctx.now,
                            AckPayload::MaxStreamData {
                                stream_id: stream.id(),
                                max_stream_data: value,
                            },
                        );
                        stream.max_sender.record(value);
                    }
                    None => return Ok(false),
                }
            }
        }

        Ok(true)
    }

    /// Emits STREAM frames for the pending ranges, respecting the peer's
    /// stream window and, outside stream 0, the connection credit. The FIN
    /// virtual byte ships with the final range, or alone once everything else
    /// was transmitted.
    fn emit_stream_data(
        ctx: &mut SendContext<'_>,
        stream: &mut Stream,
        ledger: &mut AckLedger,
        conn_flow: Option<&mut FlowControl>,
    ) -> QuicResult<bool> {
        let mut conn_flow = conn_flow;

        loop {
            let range = match stream.send.pending().first() {
                Some(range) => *range,
                None => return Ok(true),
            };
            let eos = stream.send.eos();

            // New data is capped by the stream window and connection credit;
            // anything below the transmission high-water was already allowed
            let mut limit = stream.max_stream_data;
            if let Some(flow) = conn_flow.as_mut() {
                limit = limit.min(stream.max_sent + (flow.permitted - flow.sent));
            }
            let allowed_end = range.end.min(limit.max(stream.max_sent));

            let fin_possible =
                stream.send.is_shutdown() && range.end == eos + 1 && allowed_end >= eos;
            if allowed_end <= range.start && !fin_possible {
                return Ok(true);
            }

            let overhead = StreamFrame::overhead(stream.id(), range.start);
            let pure_fin = fin_possible && range.start == eos;
            let min_need = overhead + match pure_fin {
                true => 0,
                false => 1,
            };

            let builder = match ctx.ensure(min_need)? {
                Some(builder) => builder,
                None => return Ok(false),
            };
            let pn = builder.packet_number;
            let space = builder.free_capacity() - overhead;

            let data_top = allowed_end.min(eos);
            let wire_end = data_top.min(range.start + space as u64);
            let wire_len = (wire_end - range.start) as usize;
            let fin = fin_possible && wire_end == eos;
            let emit_end = match fin {
                true => eos + 1,
                false => wire_end,
            };

            let frame = StreamFrame {
                stream_id: stream.id(),
                offset: range.start,
                fin,
                data: stream.send.slice(range.start, wire_len),
            };
            frame.write(builder)?;

            ledger.allocate(
                pn,
                ctx.now,
                AckPayload::Stream {
                    stream_id: stream.id(),
                    start: range.start,
                    end: emit_end,
                },
            );
            stream.send.emitted(range.start, emit_end);

            if wire_end > stream.max_sent {
                if let Some(flow) = conn_flow.as_mut() {
                    flow.sent += wire_end - stream.max_sent;
                }
            }
            stream.max_sent = stream.max_sent.max(emit_end);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    const MSG_CLIENT_HELLO: u8 = 1;
    const MSG_SERVER_HELLO: u8 = 2;

    /// Deterministic stand-in for the TLS engine: a two-message exchange
    /// carrying the transport-parameter bodies, with label-derived secrets.
    struct TestTls {
        client: bool,
        local_params: Vec<u8>,
        peer_params: Option<Vec<u8>>,
        inbuf: Vec<u8>,
        established: bool,
    }

    impl TestTls {
        fn new(client: bool) -> TestTls {
            TestTls {
                client,
                local_params: Vec::new(),
                peer_params: None,
                inbuf: Vec::new(),
                established: false,
            }
        }

        fn push_message(out: &mut Vec<u8>, tag: u8, body: &[u8]) {
            out.push(tag);
            out.write_u16::<BigEndian>(body.len() as u16).unwrap();
            out.extend_from_slice(body);
        }
    }

    impl TlsSession for TestTls {
        fn start(
            &mut self,
            server_name: Option<&str>,
            transport_params: &[u8],
            out: &mut Vec<u8>,
        ) -> QuicResult<HandshakeStatus> {
            self.local_params = transport_params.to_vec();
            if self.client {
                assert!(server_name.is_some());
                Self::push_message(out, MSG_CLIENT_HELLO, transport_params);
            }
            Ok(HandshakeStatus::InProgress)
        }

        fn handshake(&mut self, input: &[u8], out: &mut Vec<u8>) -> QuicResult<HandshakeStatus> {
            self.inbuf.extend_from_slice(input);

            loop {
                if self.inbuf.len() < 3 {
                    break;
                }
                let len = BigEndian::read_u16(&self.inbuf[1..3]) as usize;
                if self.inbuf.len() < 3 + len {
                    break;
                }
                let tag = self.inbuf[0];
                let body: Vec<u8> = self.inbuf[3..3 + len].to_vec();
                self.inbuf.drain(..3 + len);

                match (self.client, tag) {
                    (false, MSG_CLIENT_HELLO) => {
                        self.peer_params = Some(body);
                        Self::push_message(out, MSG_SERVER_HELLO, &self.local_params);
                        self.established = true;
                    }
                    (true, MSG_SERVER_HELLO) => {
                        self.peer_params = Some(body);
                        self.established = true;
                    }
                    _ => return Err(QuicError::Tls),
                }
            }

            Ok(match self.established {
                true => HandshakeStatus::Complete,
                false => HandshakeStatus::InProgress,
            })
        }

        fn is_established(&self) -> bool {
            self.established
        }

        fn peer_transport_params(&self) -> Option<&[u8]> {
            self.peer_params.as_deref()
        }

        fn export_secret(&self, label: &[u8]) -> QuicResult<Vec<u8>> {
            let mut secret = vec![0u8; 32];
            let mut hash = packet::fnv1a(packet::FNV1A_OFFSET_BASIS, label);
            for chunk in secret.chunks_mut(8) {
                BigEndian::write_u64(chunk, hash);
                hash = packet::fnv1a(hash, b"next");
            }
            Ok(secret)
        }

        fn aead(&self, secret: &[u8]) -> QuicResult<Box<dyn Aead>> {
            Ok(Box::new(TestAead {
                key: BigEndian::read_u64(&secret[..8]),
            }))
        }
    }

    /// Xor-keystream cipher with an FNV tag; enough to exercise the packet
    /// protection plumbing without pulling real key schedules into the tests.
    struct TestAead {
        key: u64,
    }

    impl TestAead {
        fn keystream(&self, nonce: u64, index: usize) -> u8 {
            let x = self.key
                ^ nonce.wrapping_mul(0x9e37_79b9_7f4a_7c15)
                ^ (index as u64).wrapping_mul(packet::FNV1A_PRIME);
            (x >> 32) as u8
        }

        fn tag(&self, nonce: u64, aad: &[u8], plain: &[u8]) -> u64 {
            packet::fnv1a(packet::fnv1a(packet::FNV1A_OFFSET_BASIS, aad), plain) ^ self.key ^ nonce
        }
    }

    impl Aead for TestAead {
        fn overhead(&self) -> usize {
            8
        }

        fn seal(&self, nonce: u64, aad: &[u8], buf: &mut [u8], plain_len: usize) -> usize {
            let tag = self.tag(nonce, aad, &buf[..plain_len]);
            for index in 0..plain_len {
                buf[index] ^= self.keystream(nonce, index);
            }
            BigEndian::write_u64(&mut buf[plain_len..plain_len + 8], tag);
            plain_len + 8
        }

        fn open(&self, nonce: u64, aad: &[u8], buf: &mut [u8]) -> QuicResult<usize> {
            if buf.len() < 8 {
                return Err(QuicError::DecryptionFailure);
            }
            let plain_len = buf.len() - 8;
            let found = BigEndian::read_u64(&buf[plain_len..]);
            for index in 0..plain_len {
                buf[index] ^= self.keystream(nonce, index);
            }
            match self.tag(nonce, aad, &buf[..plain_len]) == found {
                true => Ok(plain_len),
                _ => Err(QuicError::DecryptionFailure),
            }
        }
    }

    /// Engine whose first flight cannot fit a single padded datagram.
    struct BloatTls;

    impl TlsSession for BloatTls {
        fn start(&mut self, _: Option<&str>, _: &[u8], out: &mut Vec<u8>) -> QuicResult<HandshakeStatus> {
            out.resize(4096, 0xaa);
            Ok(HandshakeStatus::InProgress)
        }

        fn handshake(&mut self, _: &[u8], _: &mut Vec<u8>) -> QuicResult<HandshakeStatus> {
            unimplemented!()
        }

        fn is_established(&self) -> bool {
            false
        }

        fn peer_transport_params(&self) -> Option<&[u8]> {
            None
        }

        fn export_secret(&self, _: &[u8]) -> QuicResult<Vec<u8>> {
            unimplemented!()
        }

        fn aead(&self, _: &[u8]) -> QuicResult<Box<dyn Aead>> {
            unimplemented!()
        }
    }

    fn addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 4433)
    }

    fn pump(from: &mut Connection, to: &mut Connection, now: u64) -> usize {
        let mut packets = Vec::new();
        from.send(&mut packets, 16, now).unwrap();
        let count = packets.len();
        for mut datagram in packets {
            let mut view = packet::decode(&mut datagram).unwrap();
            to.receive(&mut view, now).unwrap();
        }
        count
    }

    fn converge(a: &mut Connection, b: &mut Connection, now: u64) {
        loop {
            if pump(a, b, now) + pump(b, a, now) == 0 {
                break;
            }
        }
    }

    fn pair() -> (Connection, Connection) {
        pair_with(Config::default(), Config::default())
    }

    fn pair_with(client_config: Config, server_config: Config) -> (Connection, Connection) {
        let mut client = Connection::connect(
            client_config,
            Box::new(TestTls::new(true)),
            addr(),
            "echo.test",
            None,
        )
        .unwrap();

        let mut packets = Vec::new();
        client.send(&mut packets, 4, 0).unwrap();
        assert_eq!(packets.len(), 1);

        let mut first = packets.remove(0);
        let mut view = packet::decode(&mut first).unwrap();
        let mut server = Connection::accept(
            server_config,
            Box::new(TestTls::new(false)),
            addr(),
            &mut view,
            0,
            None,
        )
        .unwrap();

        converge(&mut client, &mut server, 0);
        assert_eq!(client.state(), State::OneRttEncrypted);
        assert_eq!(server.state(), State::OneRttEncrypted);

        client.events().count();
        server.events().count();
        (client, server)
    }

    #[test]
    fn test_client_initial_is_padded() {
        let mut client = Connection::connect(
            Config::default(),
            Box::new(TestTls::new(true)),
            addr(),
            "echo.test",
            None,
        )
        .unwrap();

        let mut packets = Vec::new();
        client.send(&mut packets, 4, 0).unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(
            packets[0].len(),
            packet::LONG_HEADER_SIZE + packet::INITIAL_PAYLOAD_SIZE + packet::FNV1A_TRAILER_SIZE
        );
    }

    #[test]
    fn test_handshake_commits_params_and_crosses_secrets() {
        let mut server_config = Config::default();
        server_config.params.initial_max_stream_data = 4096;
        server_config.params.initial_max_data_kb = 32;
        server_config.params.initial_max_stream_id = 20;
        server_config.params.idle_timeout = 17;

        let (client, server) = pair_with(Config::default(), server_config);

        assert_eq!(*client.peer_params(), server_config.params);
        assert_eq!(*server.peer_params(), Config::default().params);

        assert_eq!(client.egress.secret, server.ingress.secret);
        assert_eq!(client.ingress.secret, server.egress.secret);
        assert_ne!(client.egress.secret, client.ingress.secret);

        assert_eq!(client.egress_max_data.permitted, 32 * 1024);
    }

    #[test]
    fn test_handshake_too_large() {
        let mut client = Connection::connect(
            Config::default(),
            Box::new(BloatTls),
            addr(),
            "echo.test",
            None,
        )
        .unwrap();

        let mut packets = Vec::new();
        assert_eq!(
            client.send(&mut packets, 4, 0),
            Err(QuicError::HandshakeTooLarge)
        );
    }

    #[test]
    fn test_echo_smoke() {
        let (mut client, mut server) = pair();

        let sid = client.open_stream().unwrap();
        assert_eq!(sid, 1);
        client.stream_mut(sid).unwrap().write(b"hello").unwrap();
        client.stream_mut(sid).unwrap().shutdown();
        converge(&mut client, &mut server, 0);

        let server_events: Vec<_> = server.events().collect();
        assert!(server_events.contains(&StreamEvent::Opened(sid)));
        assert!(server_events.contains(&StreamEvent::Data(sid)));

        {
            let stream = server.stream_mut(sid).unwrap();
            assert_eq!(stream.readable(), b"hello");
            stream.write(b"hello").unwrap();
            stream.shutdown();
            stream.consume(5).unwrap();
            assert!(stream.recv_complete());
        }
        server.close_stream(sid).unwrap();
        converge(&mut server, &mut client, 0);

        let client_events: Vec<_> = client.events().collect();
        assert!(client_events.contains(&StreamEvent::Data(sid)));

        {
            let stream = client.stream_mut(sid).unwrap();
            assert_eq!(stream.readable(), b"hello");
            stream.consume(5).unwrap();
            assert!(stream.send_complete());
            assert!(stream.recv_complete());
        }
        client.close_stream(sid).unwrap();
        converge(&mut client, &mut server, 0);

        assert!(client.stream(sid).is_none());
        assert!(server.stream(sid).is_none());
        assert_eq!(client.next_timeout(), None);
        assert_eq!(server.next_timeout(), None);
    }

    #[test]
    fn test_reordered_packets_deliver_once_contiguous() {
        let (mut client, mut server) = pair();
        let sid = client.open_stream().unwrap();

        client.stream_mut(sid).unwrap().write(b"01234").unwrap();
        let mut first = Vec::new();
        client.send(&mut first, 4, 0).unwrap();
        assert_eq!(first.len(), 1);

        client.stream_mut(sid).unwrap().write(b"56789").unwrap();
        let mut second = Vec::new();
        client.send(&mut second, 4, 0).unwrap();
        assert_eq!(second.len(), 1);

        // Deliver out of order
        let mut view = packet::decode(&mut second[0]).unwrap();
        server.receive(&mut view, 0).unwrap();

        let events: Vec<_> = server.events().collect();
        assert!(events.contains(&StreamEvent::Opened(sid)));
        assert!(!events.iter().any(|e| matches!(e, StreamEvent::Data(_))));
        assert_eq!(server.stream(sid).unwrap().readable(), b"");

        let mut view = packet::decode(&mut first[0]).unwrap();
        server.receive(&mut view, 0).unwrap();

        let events: Vec<_> = server.events().collect();
        assert_eq!(events, vec![StreamEvent::Data(sid)]);
        assert_eq!(server.stream(sid).unwrap().readable(), b"0123456789");
    }

    #[test]
    fn test_retransmit_on_rto() {
        let (mut client, mut server) = pair();
        let sid = client.open_stream().unwrap();

        let payload: Vec<u8> = (0..300).map(|i| i as u8).collect();
        let mut sent = Vec::new();
        for chunk in payload.chunks(100) {
            client.stream_mut(sid).unwrap().write(chunk).unwrap();
            let mut packets = Vec::new();
            client.send(&mut packets, 4, 0).unwrap();
            assert_eq!(packets.len(), 1);
            sent.push(packets.remove(0));
        }

        // Packet 2 is lost
        for index in &[0usize, 2] {
            let mut datagram = sent[*index].clone();
            let mut view = packet::decode(&mut datagram).unwrap();
            server.receive(&mut view, 0).unwrap();
        }
        assert_eq!(server.stream(sid).unwrap().readable(), &payload[..100]);

        // Acks for the delivered packets come back
        pump(&mut server, &mut client, 0);
        assert_eq!(client.ledger.len(), 1);

        // The timeout requeues the missing range
        let mut packets = Vec::new();
        client.send(&mut packets, 4, 600).unwrap();
        assert_eq!(packets.len(), 1);
        let mut view = packet::decode(&mut packets[0]).unwrap();
        server.receive(&mut view, 600).unwrap();

        assert_eq!(server.stream(sid).unwrap().readable(), &payload[..]);
    }

    #[test]
    fn test_rst_wins_over_fin() {
        let (mut client, mut server) = pair();
        let sid = client.open_stream().unwrap();

        client.stream_mut(sid).unwrap().write(&[0x5a; 1000]).unwrap();
        client.stream_mut(sid).unwrap().shutdown();
        client.stream_mut(sid).unwrap().reset(42);

        pump(&mut client, &mut server, 0);

        let events: Vec<_> = server.events().collect();
        assert!(events.contains(&StreamEvent::Reset(sid, 42)));
        assert_eq!(server.stream(sid).unwrap().rst_received(), Some(42));
        assert_eq!(server.stream(sid).unwrap().recv.eos(), 1000);
        assert!(server.stream(sid).unwrap().recv_complete());

        // The send side only completes once the RST itself is acknowledged
        assert!(!client.stream(sid).unwrap().send_complete());
        pump(&mut server, &mut client, 0);
        assert!(client.stream(sid).unwrap().send_complete());
    }

    #[test]
    fn test_flow_control_stall_and_unblock() {
        let mut server_config = Config::default();
        server_config.params.initial_max_data_kb = 1;
        let (mut client, mut server) = pair_with(Config::default(), server_config);

        let sid = client.open_stream().unwrap();
        client.stream_mut(sid).unwrap().write(&[0xaa; 2048]).unwrap();

        pump(&mut client, &mut server, 0);

        // Exactly one window of data escapes
        assert_eq!(client.stream(sid).unwrap().max_sent, 1024);
        assert_eq!(client.egress_max_data.sent, 1024);
        assert_eq!(server.stream(sid).unwrap().readable().len(), 1024);

        server.stream_mut(sid).unwrap().consume(1024).unwrap();

        // Consumption drives a MAX_DATA advertisement of two windows
        pump(&mut server, &mut client, 0);
        assert_eq!(client.egress_max_data.permitted, 2048);

        pump(&mut client, &mut server, 0);
        assert_eq!(client.stream(sid).unwrap().max_sent, 2048);
        assert_eq!(server.stream(sid).unwrap().readable().len(), 1024);
        assert!(client.egress_max_data.sent <= client.egress_max_data.permitted);
    }

    #[test]
    fn test_duplicate_ack_is_ignored() {
        let (mut client, mut server) = pair();
        let sid = client.open_stream().unwrap();
        client.stream_mut(sid).unwrap().write(b"data").unwrap();
        pump(&mut client, &mut server, 0);

        let mut acks = Vec::new();
        server.send(&mut acks, 4, 0).unwrap();
        assert_eq!(acks.len(), 1);
        let mut dup = acks[0].clone();

        let mut view = packet::decode(&mut acks[0]).unwrap();
        client.receive(&mut view, 0).unwrap();
        assert!(client.ledger.is_empty());

        // The second delivery dispatches nothing and changes nothing
        let mut view = packet::decode(&mut dup).unwrap();
        client.receive(&mut view, 0).unwrap();
        assert!(client.ledger.is_empty());
        assert!(client.stream(sid).unwrap().send.pending().is_empty());
    }

    #[test]
    fn test_zero_length_fin_after_data() {
        let (mut client, mut server) = pair();
        let sid = client.open_stream().unwrap();

        client.stream_mut(sid).unwrap().write(b"tail").unwrap();
        pump(&mut client, &mut server, 0);

        client.stream_mut(sid).unwrap().shutdown();
        pump(&mut client, &mut server, 0);

        let stream = server.stream_mut(sid).unwrap();
        assert_eq!(stream.readable(), b"tail");
        assert_eq!(stream.recv.eos(), 4);
        stream.consume(4).unwrap();
        assert!(stream.recv_complete());
    }

    #[test]
    fn test_stop_sending_arms_reset() {
        let (mut client, mut server) = pair();
        let sid = client.open_stream().unwrap();
        client.stream_mut(sid).unwrap().write(b"x").unwrap();
        pump(&mut client, &mut server, 0);
        server.events().count();

        client.stream_mut(sid).unwrap().stop_sending(7);
        pump(&mut client, &mut server, 0);

        let events: Vec<_> = server.events().collect();
        assert!(events.contains(&StreamEvent::StopSending(sid, 7)));

        pump(&mut server, &mut client, 0);
        let events: Vec<_> = client.events().collect();
        assert!(events.contains(&StreamEvent::Reset(sid, 7)));
        assert_eq!(client.stream(sid).unwrap().rst_received(), Some(7));
    }

    #[test]
    fn test_gap_streams_open_implicitly() {
        let (mut client, mut server) = pair();

        // Jump straight to the third client stream
        let first = client.open_stream().unwrap();
        let second = client.open_stream().unwrap();
        let third = client.open_stream().unwrap();
        assert_eq!((first, second, third), (1, 3, 5));

        client.stream_mut(third).unwrap().write(b"skip").unwrap();
        pump(&mut client, &mut server, 0);

        let events: Vec<_> = server.events().collect();
        assert_eq!(
            events,
            vec![
                StreamEvent::Opened(1),
                StreamEvent::Opened(3),
                StreamEvent::Opened(5),
                StreamEvent::Data(5),
            ]
        );
    }

    #[test]
    fn test_open_stream_exhaustion() {
        let mut server_config = Config::default();
        server_config.params.initial_max_stream_id = 1;
        let (mut client, _server) = pair_with(Config::default(), server_config);

        assert_eq!(client.open_stream(), Ok(1));
        assert_eq!(client.open_stream(), Err(QuicError::TooManyOpenStreams));
    }

    #[test]
    fn test_short_packet_before_handshake_is_ignored() {
        let mut client = Connection::connect(
            Config::default(),
            Box::new(TestTls::new(true)),
            addr(),
            "echo.test",
            None,
        )
        .unwrap();

        let mut datagram = Vec::new();
        packet::write_short_header(&mut datagram, Some(client.cid()), false, 1);
        datagram.extend_from_slice(&[0u8; 16]);

        let mut view = packet::decode(&mut datagram).unwrap();
        assert_eq!(client.receive(&mut view, 0), Err(QuicError::PacketIgnored));
    }

    #[test]
    fn test_connection_id_mismatch_rejected() {
        let (mut client, _server) = pair();

        let mut datagram = Vec::new();
        packet::write_short_header(&mut datagram, Some(client.cid().wrapping_add(1)), false, 9);
        datagram.extend_from_slice(&[0u8; 16]);

        let mut view = packet::decode(&mut datagram).unwrap();
        assert_eq!(
            client.receive(&mut view, 0),
            Err(QuicError::InvalidPacketHeader)
        );
    }

    #[test]
    fn test_role_inconsistent_packet_rejected() {
        let (mut client, _server) = pair();

        // A client must never see CLIENT_CLEARTEXT packets
        let mut datagram = Vec::new();
        packet::write_long_header(
            &mut datagram,
            packet::PACKET_TYPE_CLIENT_CLEARTEXT,
            client.cid(),
            9,
            PROTOCOL_VERSION,
        );
        datagram.extend_from_slice(&[0u8; 32]);

        let mut view = packet::decode(&mut datagram).unwrap();
        assert_eq!(
            client.receive(&mut view, 0),
            Err(QuicError::InvalidPacketHeader)
        );
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let (mut client, _server) = pair();

        let mut datagram = Vec::new();
        packet::write_long_header(
            &mut datagram,
            packet::PACKET_TYPE_SERVER_CLEARTEXT,
            client.cid(),
            9,
            0x1,
        );
        datagram.extend_from_slice(&[0u8; 32]);

        let mut view = packet::decode(&mut datagram).unwrap();
        assert_eq!(
            client.receive(&mut view, 0),
            Err(QuicError::InvalidPacketHeader)
        );
    }

    #[test]
    fn test_accept_requires_client_initial() {
        let mut datagram = Vec::new();
        packet::write_short_header(&mut datagram, Some(1), false, 1);
        datagram.extend_from_slice(&[0u8; 16]);

        let mut view = packet::decode(&mut datagram).unwrap();
        let result = Connection::accept(
            Config::default(),
            Box::new(TestTls::new(false)),
            addr(),
            &mut view,
            0,
            None,
        );
        assert!(matches!(result, Err(QuicError::InvalidPacketHeader)));
    }

    #[test]
    fn test_corrupted_protected_packet_is_nonfatal() {
        let (mut client, mut server) = pair();
        let sid = client.open_stream().unwrap();
        client.stream_mut(sid).unwrap().write(b"payload").unwrap();

        let mut packets = Vec::new();
        client.send(&mut packets, 4, 0).unwrap();
        let mut datagram = packets.remove(0);
        let last = datagram.len() - 1;
        datagram[last] ^= 0xff;

        let mut view = packet::decode(&mut datagram).unwrap();
        assert_eq!(
            server.receive(&mut view, 0),
            Err(QuicError::DecryptionFailure)
        );

        // The connection survives and the intact retransmission lands
        let mut packets = Vec::new();
        client.send(&mut packets, 4, 600).unwrap();
        let mut view = packet::decode(&mut packets[0]).unwrap();
        server.receive(&mut view, 600).unwrap();
        assert_eq!(server.stream(sid).unwrap().readable(), b"payload");
    }

    #[test]
    fn test_next_timeout_tracks_oldest_record() {
        let (mut client, mut server) = pair();
        let sid = client.open_stream().unwrap();
        client.stream_mut(sid).unwrap().write(b"tick").unwrap();

        let mut packets = Vec::new();
        client.send(&mut packets, 4, 100).unwrap();
        assert_eq!(client.next_timeout(), Some(600));

        for mut datagram in packets {
            let mut view = packet::decode(&mut datagram).unwrap();
            server.receive(&mut view, 100).unwrap();
        }
        pump(&mut server, &mut client, 100);
        assert_eq!(client.next_timeout(), None);
    }
}
