use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use lumen::shared::{QuicError, QuicResult, SizedRead};
use std::io;

/// TLS extension number carrying the QUIC transport parameters.
pub const TRANSPORT_PARAMS_EXTENSION_TYPE: u16 = 26;

const PARAM_INITIAL_MAX_STREAM_DATA: u16 = 0;
const PARAM_INITIAL_MAX_DATA_KB: u16 = 1;
const PARAM_INITIAL_MAX_STREAM_ID: u16 = 2;
const PARAM_IDLE_TIMEOUT: u16 = 3;
const PARAM_TRUNCATE_CONNECTION_ID: u16 = 4;

const REQUIRED_PARAMS: u64 = 0b1111;

/// Connection-level limits negotiated through the handshake.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TransportParams {
    pub initial_max_stream_data: u32,
    pub initial_max_data_kb: u32,
    pub initial_max_stream_id: u32,
    pub idle_timeout: u16,
    pub truncate_connection_id: bool,
}

impl Default for TransportParams {
    fn default() -> TransportParams {
        TransportParams {
            initial_max_stream_data: 8192,
            initial_max_data_kb: 16,
            initial_max_stream_id: 100,
            idle_timeout: 60,
            truncate_connection_id: false,
        }
    }
}

/// Extension body offered by a client: the version it settled on, the version
/// it started from, then the parameter block.
pub fn encode_client(negotiated_version: u32, initial_version: u32, params: &TransportParams) -> Vec<u8> {
    let mut out = Vec::new();
    out.write_u32::<BigEndian>(negotiated_version).expect("Error writing version");
    out.write_u32::<BigEndian>(initial_version).expect("Error writing version");
    write_params(&mut out, params);
    out
}

/// Extension body offered by a server: the supported-versions list, then the
/// parameter block.
pub fn encode_server(supported_versions: &[u32], params: &TransportParams) -> Vec<u8> {
    let mut out = Vec::new();
    out.write_u8((supported_versions.len() * 4) as u8).expect("Error writing version list");
    for &version in supported_versions {
        out.write_u32::<BigEndian>(version).expect("Error writing version list");
    }
    write_params(&mut out, params);
    out
}

fn write_params(out: &mut Vec<u8>, params: &TransportParams) {
    let mut block = Vec::new();

    write_param(&mut block, PARAM_INITIAL_MAX_STREAM_DATA, &params.initial_max_stream_data.to_be_bytes());
    write_param(&mut block, PARAM_INITIAL_MAX_DATA_KB, &params.initial_max_data_kb.to_be_bytes());
    write_param(&mut block, PARAM_INITIAL_MAX_STREAM_ID, &params.initial_max_stream_id.to_be_bytes());
    write_param(&mut block, PARAM_IDLE_TIMEOUT, &params.idle_timeout.to_be_bytes());
    if params.truncate_connection_id {
        write_param(&mut block, PARAM_TRUNCATE_CONNECTION_ID, &[]);
    }

    out.write_u16::<BigEndian>(block.len() as u16).expect("Error writing parameter block");
    out.extend_from_slice(&block);
}

fn write_param(block: &mut Vec<u8>, id: u16, value: &[u8]) {
    block.write_u16::<BigEndian>(id).expect("Error writing parameter");
    block.write_u16::<BigEndian>(value.len() as u16).expect("Error writing parameter");
    block.extend_from_slice(value);
}

/// Decodes the extension received from a server (runs on the client). The
/// version the client negotiated must appear in the server's supported list.
pub fn decode_from_server(body: &[u8], negotiated_version: u32) -> QuicResult<TransportParams> {
    let mut stream = io::Cursor::new(body);

    if stream.remaining_data() < 1 {
        return Err(QuicError::InvalidFrameData);
    }
    let list_len = stream.read_u8()? as usize;
    if list_len == 0 || list_len % 4 != 0 || stream.remaining_data() < list_len {
        return Err(QuicError::InvalidFrameData);
    }

    let mut found = false;
    for _ in 0..list_len / 4 {
        if stream.read_u32::<BigEndian>()? == negotiated_version {
            found = true;
        }
    }
    if !found {
        return Err(QuicError::VersionNegotiationMismatch);
    }

    read_params(&mut stream)
}

/// Decodes the extension received from a client (runs on the server). A
/// peer-offered version other than ours is rejected.
pub fn decode_from_client(body: &[u8], version: u32) -> QuicResult<TransportParams> {
    let mut stream = io::Cursor::new(body);

    if stream.remaining_data() < 8 {
        return Err(QuicError::InvalidFrameData);
    }
    let negotiated = stream.read_u32::<BigEndian>()?;
    let _initial = stream.read_u32::<BigEndian>()?;
    if negotiated != version {
        return Err(QuicError::VersionNegotiationMismatch);
    }

    read_params(&mut stream)
}

fn read_params(stream: &mut io::Cursor<&[u8]>) -> QuicResult<TransportParams> {
    if stream.remaining_data() < 2 {
        return Err(QuicError::InvalidFrameData);
    }
    let block_len = stream.read_u16::<BigEndian>()? as usize;
    if stream.remaining_data() < block_len {
        return Err(QuicError::InvalidFrameData);
    }

    let mut params = TransportParams::default();
    let mut seen = 0u64;
    let end = stream.position() as usize + block_len;

    while (stream.position() as usize) < end {
        if end - (stream.position() as usize) < 4 {
            return Err(QuicError::InvalidFrameData);
        }
        let id = stream.read_u16::<BigEndian>()?;
        let len = stream.read_u16::<BigEndian>()? as usize;
        if stream.position() as usize + len > end {
            return Err(QuicError::InvalidFrameData);
        }

        // Duplicates are forbidden for every known id
        if id < 64 {
            let bit = 1u64 << id;
            if seen & bit != 0 {
                return Err(QuicError::InvalidFrameData);
            }
            seen |= bit;
        }

        match id {
            PARAM_INITIAL_MAX_STREAM_DATA => {
                params.initial_max_stream_data = read_value_u32(stream, len)?;
            }
            PARAM_INITIAL_MAX_DATA_KB => {
                params.initial_max_data_kb = read_value_u32(stream, len)?;
            }
            PARAM_INITIAL_MAX_STREAM_ID => {
                params.initial_max_stream_id = read_value_u32(stream, len)?;
            }
            PARAM_IDLE_TIMEOUT => {
                if len != 2 {
                    return Err(QuicError::InvalidFrameData);
                }
                params.idle_timeout = stream.read_u16::<BigEndian>()?;
            }
            PARAM_TRUNCATE_CONNECTION_ID => {
                if len != 0 {
                    return Err(QuicError::InvalidFrameData);
                }
                params.truncate_connection_id = true;
            }
            _ => {
                // Unknown parameters are skipped for forward compatibility
                stream.set_position(stream.position() + len as u64);
            }
        }
    }

    if seen & REQUIRED_PARAMS != REQUIRED_PARAMS {
        return Err(QuicError::InvalidFrameData);
    }

    Ok(params)
}

fn read_value_u32(stream: &mut io::Cursor<&[u8]>, len: usize) -> QuicResult<u32> {
    if len != 4 {
        return Err(QuicError::InvalidFrameData);
    }
    Ok(stream.read_u32::<BigEndian>()?)
}
