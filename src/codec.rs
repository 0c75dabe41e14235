//! Wire codec for the Server List Ping protocol.
//!
//! Covers the primitive types the status exchange needs (VarInt, length-prefixed
//! UTF-8 strings, big-endian unsigned shorts) and the length-prefixed packet envelope.
//! Every decoder takes the untrusted input buffer and reports how many bytes it consumed.
use thiserror::Error;

const SEGMENT_BITS: u8 = 0x7F;
const CONTINUE_BIT: u8 = 0x80;

/// Longest VarInt the protocol accepts: 5 bytes carrying 32 bits.
pub const MAX_VAR_INT_LEN: usize = 5;

pub const HANDSHAKE_ID: i32 = 0x00;
pub const STATUS_REQUEST_ID: i32 = 0x00;
pub const STATUS_RESPONSE_ID: i32 = 0x00;

/// Handshake `next state` value selecting the status exchange.
pub const NEXT_STATE_STATUS: i32 = 1;

/// Protocol version announced in the handshake. Servers answer a status ping regardless.
pub const HANDSHAKE_PROTOCOL_VERSION: i32 = 0;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    #[error("buffer ended before the value was complete")]
    Truncated,
    #[error("malformed VarInt: longer than {MAX_VAR_INT_LEN} bytes")]
    Overflow,
    #[error("negative length prefix")]
    NegativeLength,
}

/// Encode a VarInt: 7 payload bits per byte, low bits first, high bit set on all
/// but the last byte. Negative values encode as their 32-bit two's complement.
pub fn encode_var_int(value: i32) -> Vec<u8> {
    let mut value = value as u32;
    let mut out = Vec::with_capacity(MAX_VAR_INT_LEN);
    loop {
        if value & !(SEGMENT_BITS as u32) == 0 {
            out.push(value as u8);
            return out;
        }
        out.push((value as u8 & SEGMENT_BITS) | CONTINUE_BIT);
        value >>= 7;
    }
}

/// Decode a VarInt from the front of `buf`, returning the value and the bytes consumed.
pub fn decode_var_int(buf: &[u8]) -> Result<(i32, usize), CodecError> {
    let mut value: u32 = 0;
    let mut shift = 0u32;
    for (i, &byte) in buf.iter().enumerate() {
        if shift >= 32 {
            return Err(CodecError::Overflow);
        }
        value |= ((byte & SEGMENT_BITS) as u32) << shift;
        if byte & CONTINUE_BIT == 0 {
            return Ok((value as i32, i + 1));
        }
        shift += 7;
    }
    if shift >= 32 {
        // Five continuation bytes and nothing after them is still an over-long VarInt.
        return Err(CodecError::Overflow);
    }
    Err(CodecError::Truncated)
}

pub fn encode_string(s: &str) -> Vec<u8> {
    let bytes = s.as_bytes();
    let mut out = encode_var_int(bytes.len() as i32);
    out.extend_from_slice(bytes);
    out
}

/// Decode a VarInt-length-prefixed string. Invalid UTF-8 is replaced rather than rejected,
/// since the declared length is all the framing guarantees.
pub fn decode_string(buf: &[u8]) -> Result<(String, usize), CodecError> {
    let (len, prefix) = decode_var_int(buf)?;
    if len < 0 {
        return Err(CodecError::NegativeLength);
    }
    let end = prefix
        .checked_add(len as usize)
        .ok_or(CodecError::Truncated)?;
    let bytes = buf.get(prefix..end).ok_or(CodecError::Truncated)?;
    Ok((String::from_utf8_lossy(bytes).into_owned(), end))
}

pub fn encode_unsigned_short(value: u16) -> [u8; 2] {
    value.to_be_bytes()
}

/// A packet id plus its opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: i32,
    pub data: Vec<u8>,
}

impl Packet {
    pub fn new(id: i32, data: Vec<u8>) -> Self {
        Self { id, data }
    }

    /// Handshake announcing `address:port` and the requested next state.
    pub fn handshake(address: &str, port: u16, next_state: i32) -> Self {
        let mut data = encode_var_int(HANDSHAKE_PROTOCOL_VERSION);
        data.extend(encode_string(address));
        data.extend(encode_unsigned_short(port));
        data.extend(encode_var_int(next_state));
        Self::new(HANDSHAKE_ID, data)
    }

    pub fn status_request() -> Self {
        Self::new(STATUS_REQUEST_ID, Vec::new())
    }

    /// `VarInt(len(id) + len(data)) ++ id ++ data`.
    pub fn serialize(&self) -> Vec<u8> {
        let id = encode_var_int(self.id);
        let mut out = encode_var_int((id.len() + self.data.len()) as i32);
        out.reserve(id.len() + self.data.len());
        out.extend(id);
        out.extend_from_slice(&self.data);
        out
    }
}

/// Decode one packet from the front of `buf`.
///
/// The declared length is untrusted: the payload is `declared - len(id)` bytes and must
/// fit inside `buf`, anything past it is left unconsumed.
pub fn decode_packet(buf: &[u8]) -> Result<(Packet, usize), CodecError> {
    let (declared, prefix) = decode_var_int(buf)?;
    if declared < 0 {
        return Err(CodecError::Truncated);
    }
    let (id, id_len) = decode_var_int(&buf[prefix..])?;
    let payload_len = (declared as usize)
        .checked_sub(id_len)
        .ok_or(CodecError::Truncated)?;
    let start = prefix + id_len;
    let end = start + payload_len;
    let data = buf.get(start..end).ok_or(CodecError::Truncated)?;
    Ok((Packet::new(id, data.to_vec()), end))
}
