//! One Server List Ping exchange against a single target.
//!
//! connect -> handshake -> status request -> read until the declared packet length
//! has arrived -> decode the status JSON. Every failure is typed by the step it
//! happened in so the scanner can decide what is routine network noise.
use std::io;
use std::net::SocketAddrV4;
use std::time::Duration;

use log::trace;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::codec::{
    decode_packet, decode_string, decode_var_int, CodecError, Packet, NEXT_STATE_STATUS,
    STATUS_RESPONSE_ID,
};
use crate::config::ScanConfig;
use crate::types::ServerStatus;

const READ_CHUNK: usize = 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("packet length prefix: {0}")]
    MalformedVarInt(CodecError),
    #[error("status packet: {0}")]
    Packet(CodecError),
    #[error("status payload: {0}")]
    Payload(CodecError),
    #[error("unexpected packet id {0:#04x}")]
    UnexpectedPacketId(i32),
    #[error("declared packet length {0} exceeds limit")]
    PacketTooLarge(usize),
    #[error("status json: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("dial: {0}")]
    Dial(#[source] io::Error),
    #[error("send: {0}")]
    Send(#[source] io::Error),
    #[error("read: {0}")]
    Read(#[source] io::Error),
    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("cancelled")]
    Cancelled,
}

impl SessionError {
    /// Failures that every internet-wide scan produces in bulk: hosts that are down or
    /// filtered, peers that reset or time out, non-SLP services answering with garbage,
    /// and probes aborted by shutdown. These are dropped instead of reported.
    pub fn is_expected_noise(&self) -> bool {
        match self {
            SessionError::Dial(_) | SessionError::Read(_) | SessionError::Cancelled => true,
            SessionError::Send(e) => e.kind() == io::ErrorKind::ConnectionReset,
            SessionError::Protocol(ProtocolError::MalformedVarInt(_)) => true,
            SessionError::Protocol(_) => false,
        }
    }
}

/// Per-target probe settings.
#[derive(Debug, Clone)]
pub struct Session {
    pub target: SocketAddrV4,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub max_packet_len: usize,
}

impl Session {
    pub fn new(target: SocketAddrV4, config: &ScanConfig) -> Self {
        Self {
            target,
            connect_timeout: config.connect_timeout,
            read_timeout: config.read_timeout,
            max_packet_len: config.max_packet_len,
        }
    }

    /// Run the exchange to completion, or stop early when `cancel` fires. The socket is
    /// dropped on every exit path.
    pub async fn probe(&self, cancel: &CancellationToken) -> Result<ServerStatus, SessionError> {
        if cancel.is_cancelled() {
            return Err(SessionError::Cancelled);
        }
        tokio::select! {
            _ = cancel.cancelled() => Err(SessionError::Cancelled),
            res = self.exchange() => res,
        }
    }

    async fn exchange(&self) -> Result<ServerStatus, SessionError> {
        let mut stream = time::timeout(self.connect_timeout, TcpStream::connect(self.target))
            .await
            .map_err(|_| SessionError::Dial(io::ErrorKind::TimedOut.into()))?
            .map_err(SessionError::Dial)?;
        trace!("{} connected", self.target);

        let host = self.target.ip().to_string();
        let mut request = Packet::handshake(&host, self.target.port(), NEXT_STATE_STATUS).serialize();
        request.extend(Packet::status_request().serialize());
        stream.write_all(&request).await.map_err(SessionError::Send)?;
        trace!("{} handshake and status request sent", self.target);

        let buf = time::timeout(self.read_timeout, self.receive(&mut stream))
            .await
            .map_err(|_| SessionError::Read(io::ErrorKind::TimedOut.into()))??;
        trace!("{} received {} bytes", self.target, buf.len());

        decode_status(&buf)
    }

    /// Accumulate chunks until the buffer holds the whole packet its length prefix declares.
    async fn receive(&self, stream: &mut TcpStream) -> Result<Vec<u8>, SessionError> {
        let mut buf = Vec::with_capacity(4 * READ_CHUNK);
        let mut chunk = [0u8; READ_CHUNK];
        let mut total_len: Option<usize> = None;

        loop {
            let n = stream.read(&mut chunk).await.map_err(SessionError::Read)?;
            if n == 0 {
                return match total_len {
                    None => Ok(buf),
                    Some(_) => Err(SessionError::Read(io::ErrorKind::UnexpectedEof.into())),
                };
            }
            buf.extend_from_slice(&chunk[..n]);

            if total_len.is_none() {
                total_len = packet_total_len(&buf, self.max_packet_len)?;
            }
            if let Some(total) = total_len {
                if buf.len() >= total {
                    return Ok(buf);
                }
            }
        }
    }
}

/// Prefix length plus declared packet length, once the prefix is complete.
fn packet_total_len(buf: &[u8], max_packet_len: usize) -> Result<Option<usize>, ProtocolError> {
    match decode_var_int(buf) {
        // a well-formed VarInt that cannot be a length
        Ok((declared, _)) if declared < 0 => Err(ProtocolError::Packet(CodecError::Truncated)),
        Ok((declared, prefix)) => {
            let declared = declared as usize;
            if declared > max_packet_len {
                return Err(ProtocolError::PacketTooLarge(declared));
            }
            Ok(Some(prefix + declared))
        }
        Err(CodecError::Truncated) => Ok(None),
        Err(e) => Err(ProtocolError::MalformedVarInt(e)),
    }
}

/// Decode a complete status response packet into its JSON document.
pub fn decode_status(buf: &[u8]) -> Result<ServerStatus, SessionError> {
    decode_var_int(buf).map_err(ProtocolError::MalformedVarInt)?;
    let (packet, _) = decode_packet(buf).map_err(ProtocolError::Packet)?;
    if packet.id != STATUS_RESPONSE_ID {
        return Err(ProtocolError::UnexpectedPacketId(packet.id).into());
    }
    let (json, _) = decode_string(&packet.data).map_err(ProtocolError::Payload)?;
    let status = serde_json::from_str(&json).map_err(ProtocolError::Json)?;
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_string;

    fn response(json: &str) -> Vec<u8> {
        Packet::new(STATUS_RESPONSE_ID, encode_string(json)).serialize()
    }

    #[test]
    fn decodes_status_response() {
        let status = decode_status(&response(
            r#"{"version":{"name":"1.20","protocol":763},"description":"hello"}"#,
        ))
        .unwrap();
        assert_eq!(status.version.name, "1.20");
        assert_eq!(status.version.protocol, 763);
        assert_eq!(status.description, "hello");
    }

    #[test]
    fn rejects_wrong_packet_id() {
        let buf = Packet::new(0x01, encode_string("{}")).serialize();
        let err = decode_status(&buf).unwrap_err();
        assert!(matches!(
            err,
            SessionError::Protocol(ProtocolError::UnexpectedPacketId(0x01))
        ));
        assert!(!err.is_expected_noise());
    }

    #[test]
    fn invalid_json_is_reported() {
        let err = decode_status(&response("not json")).unwrap_err();
        assert!(matches!(err, SessionError::Protocol(ProtocolError::Json(_))));
        assert!(!err.is_expected_noise());
    }

    #[test]
    fn empty_response_is_malformed_var_int() {
        let err = decode_status(&[]).unwrap_err();
        assert!(matches!(
            err,
            SessionError::Protocol(ProtocolError::MalformedVarInt(CodecError::Truncated))
        ));
        assert!(err.is_expected_noise());
    }

    #[test]
    fn total_len_waits_for_prefix() {
        assert_eq!(packet_total_len(&[0x80], 100).unwrap(), None);
        assert_eq!(packet_total_len(&[0x05, 0x00], 100).unwrap(), Some(6));
        assert_eq!(packet_total_len(&[0x80, 0x01], 1000).unwrap(), Some(130));
    }

    #[test]
    fn total_len_rejects_oversized_and_overlong() {
        assert!(matches!(
            packet_total_len(&[0x80, 0x01], 100),
            Err(ProtocolError::PacketTooLarge(128))
        ));
        assert!(matches!(
            packet_total_len(&[0xff; 6], 100),
            Err(ProtocolError::MalformedVarInt(CodecError::Overflow))
        ));
    }

    #[test]
    fn negative_declared_length_is_reported() {
        let buf = crate::codec::encode_var_int(-1);
        let err = packet_total_len(&buf, 100).unwrap_err();
        assert!(matches!(err, ProtocolError::Packet(CodecError::Truncated)));
        assert!(!SessionError::from(err).is_expected_noise());

        let err = decode_status(&buf).unwrap_err();
        assert!(matches!(
            err,
            SessionError::Protocol(ProtocolError::Packet(CodecError::Truncated))
        ));
        assert!(!err.is_expected_noise());
    }

    #[test]
    fn noise_classification() {
        let reset = || io::Error::from(io::ErrorKind::ConnectionReset);
        assert!(SessionError::Dial(io::ErrorKind::ConnectionRefused.into()).is_expected_noise());
        assert!(SessionError::Read(io::ErrorKind::TimedOut.into()).is_expected_noise());
        assert!(SessionError::Send(reset()).is_expected_noise());
        assert!(!SessionError::Send(io::ErrorKind::BrokenPipe.into()).is_expected_noise());
        assert!(SessionError::Cancelled.is_expected_noise());
        assert!(
            SessionError::from(ProtocolError::MalformedVarInt(CodecError::Overflow))
                .is_expected_noise()
        );
        assert!(!SessionError::from(ProtocolError::Packet(CodecError::Truncated)).is_expected_noise());
        assert!(!SessionError::from(ProtocolError::PacketTooLarge(1 << 30)).is_expected_noise());
    }
}
