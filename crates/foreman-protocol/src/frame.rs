// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wire format for engine/slave channels.
//!
//! Each channel carries tagged frames with the following layout:
//! - 4 bytes: payload length (big-endian)
//! - 2 bytes: frame kind
//! - 8 bytes: logical channel id (multiplexes jobs over one connection)
//! - N bytes: payload
//!
//! Control frames (handshake, heartbeat, terminate) travel on channel 0;
//! invoke/chunk/choke/error frames carry the job id they belong to.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame payload size (16 MB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Frame header size (4 bytes length + 2 bytes kind + 8 bytes channel id).
pub const HEADER_SIZE: usize = 14;

/// The control channel id used by handshake, heartbeat and terminate frames.
pub const CONTROL_CHANNEL: u64 = 0;

/// Frame kinds recognized at the engine/slave boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum FrameKind {
    /// Worker hello carrying its uuid; first frame on every connection.
    Handshake = 1,
    /// Liveness signal; any frame counts as liveness, this one carries nothing else.
    Heartbeat = 2,
    /// Graceful stop request, engine to worker.
    Terminate = 3,
    /// Job invocation carrying a method name and payload.
    Invoke = 4,
    /// One response data frame.
    Chunk = 5,
    /// End-of-stream; terminal frame of a successful job.
    Choke = 6,
    /// Error report carrying a numeric code and a message; terminal.
    Error = 7,
}

impl TryFrom<u16> for FrameKind {
    type Error = FrameError;

    fn try_from(value: u16) -> Result<Self, FrameError> {
        match value {
            1 => Ok(FrameKind::Handshake),
            2 => Ok(FrameKind::Heartbeat),
            3 => Ok(FrameKind::Terminate),
            4 => Ok(FrameKind::Invoke),
            5 => Ok(FrameKind::Chunk),
            6 => Ok(FrameKind::Choke),
            7 => Ok(FrameKind::Error),
            _ => Err(FrameError::InvalidKind(value)),
        }
    }
}

/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FrameError {
    #[error("frame too large: {0} bytes (max: {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),

    #[error("invalid frame kind: {0}")]
    InvalidKind(u16),

    #[error("malformed {0} payload")]
    MalformedPayload(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed")]
    ConnectionClosed,
}

/// A framed message with kind, channel id and payload.
#[derive(Debug, Clone)]
pub struct Frame {
    pub kind: FrameKind,
    pub channel: u64,
    pub payload: Bytes,
}

impl Frame {
    /// Create a frame with the given kind, channel and payload.
    pub fn new(kind: FrameKind, channel: u64, payload: Bytes) -> Result<Self, FrameError> {
        if payload.len() > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(payload.len()));
        }
        Ok(Self {
            kind,
            channel,
            payload,
        })
    }

    /// Worker hello carrying its uuid.
    pub fn handshake(uuid: &str) -> Self {
        Self {
            kind: FrameKind::Handshake,
            channel: CONTROL_CHANNEL,
            payload: Bytes::copy_from_slice(uuid.as_bytes()),
        }
    }

    /// Empty liveness frame.
    pub fn heartbeat() -> Self {
        Self {
            kind: FrameKind::Heartbeat,
            channel: CONTROL_CHANNEL,
            payload: Bytes::new(),
        }
    }

    /// Graceful stop request.
    pub fn terminate() -> Self {
        Self {
            kind: FrameKind::Terminate,
            channel: CONTROL_CHANNEL,
            payload: Bytes::new(),
        }
    }

    /// Job invocation. The method name is length-prefixed inside the payload.
    pub fn invoke(channel: u64, method: &str, payload: &Bytes) -> Result<Self, FrameError> {
        let mut buf = BytesMut::with_capacity(4 + method.len() + payload.len());
        buf.put_u32(method.len() as u32);
        buf.put(method.as_bytes());
        buf.put(payload.clone());
        Self::new(FrameKind::Invoke, channel, buf.freeze())
    }

    /// One response data frame.
    pub fn chunk(channel: u64, payload: Bytes) -> Result<Self, FrameError> {
        Self::new(FrameKind::Chunk, channel, payload)
    }

    /// End-of-stream marker.
    pub fn choke(channel: u64) -> Self {
        Self {
            kind: FrameKind::Choke,
            channel,
            payload: Bytes::new(),
        }
    }

    /// Error report with a numeric code and a message.
    pub fn error(channel: u64, code: u32, message: &str) -> Result<Self, FrameError> {
        let mut buf = BytesMut::with_capacity(4 + message.len());
        buf.put_u32(code);
        buf.put(message.as_bytes());
        Self::new(FrameKind::Error, channel, buf.freeze())
    }

    /// Decode a handshake payload into the worker uuid string.
    pub fn decode_handshake(&self) -> Result<String, FrameError> {
        String::from_utf8(self.payload.to_vec())
            .map_err(|_| FrameError::MalformedPayload("handshake"))
    }

    /// Decode an invoke payload into `(method, payload)`.
    pub fn decode_invoke(&self) -> Result<(String, Bytes), FrameError> {
        let mut buf = self.payload.clone();
        if buf.len() < 4 {
            return Err(FrameError::MalformedPayload("invoke"));
        }
        let method_len = buf.get_u32() as usize;
        if buf.len() < method_len {
            return Err(FrameError::MalformedPayload("invoke"));
        }
        let method = String::from_utf8(buf.split_to(method_len).to_vec())
            .map_err(|_| FrameError::MalformedPayload("invoke"))?;
        Ok((method, buf))
    }

    /// Decode an error payload into `(code, message)`.
    pub fn decode_error(&self) -> Result<(u32, String), FrameError> {
        let mut buf = self.payload.clone();
        if buf.len() < 4 {
            return Err(FrameError::MalformedPayload("error"));
        }
        let code = buf.get_u32();
        let message =
            String::from_utf8(buf.to_vec()).map_err(|_| FrameError::MalformedPayload("error"))?;
        Ok((code, message))
    }

    /// Encode the frame to bytes for wire transmission.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_u32(self.payload.len() as u32);
        buf.put_u16(self.kind as u16);
        buf.put_u64(self.channel);
        buf.put(self.payload.clone());
        buf.freeze()
    }

    /// Decode a frame from a contiguous byte buffer.
    pub fn decode_from_bytes(mut bytes: Bytes) -> Result<Self, FrameError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FrameError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "incomplete frame header",
            )));
        }

        let length = bytes.get_u32() as usize;
        let kind = FrameKind::try_from(bytes.get_u16())?;
        let channel = bytes.get_u64();

        if length > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(length));
        }

        if bytes.len() < length {
            return Err(FrameError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "incomplete frame payload",
            )));
        }

        let payload = bytes.split_to(length);
        Ok(Self {
            kind,
            channel,
            payload,
        })
    }
}

/// Write a frame to an async writer.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), FrameError> {
    let encoded = frame.encode();
    writer.write_all(&encoded).await?;
    Ok(())
}

/// Read a frame from an async reader.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, FrameError> {
    let mut header = [0u8; HEADER_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FrameError::ConnectionClosed);
        }
        Err(e) => return Err(e.into()),
    }

    let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let kind = FrameKind::try_from(u16::from_be_bytes([header[4], header[5]]))?;
    let channel = u64::from_be_bytes([
        header[6], header[7], header[8], header[9], header[10], header[11], header[12], header[13],
    ]);

    if length > MAX_FRAME_SIZE {
        return Err(FrameError::FrameTooLarge(length));
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;

    Ok(Frame {
        kind,
        channel,
        payload: Bytes::from(payload),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_kind_round_trip() {
        for &kind in &[
            FrameKind::Handshake,
            FrameKind::Heartbeat,
            FrameKind::Terminate,
            FrameKind::Invoke,
            FrameKind::Chunk,
            FrameKind::Choke,
            FrameKind::Error,
        ] {
            let value = kind as u16;
            let decoded = FrameKind::try_from(value).unwrap();
            assert_eq!(kind, decoded);
        }
    }

    #[test]
    fn test_invalid_kind() {
        assert!(matches!(
            FrameKind::try_from(42),
            Err(FrameError::InvalidKind(42))
        ));
    }

    #[test]
    fn test_invoke_round_trip() {
        let payload = Bytes::from_static(b"ping");
        let frame = Frame::invoke(7, "echo", &payload).unwrap();
        let encoded = frame.encode();
        let decoded = Frame::decode_from_bytes(encoded).unwrap();

        assert_eq!(decoded.kind, FrameKind::Invoke);
        assert_eq!(decoded.channel, 7);
        let (method, body) = decoded.decode_invoke().unwrap();
        assert_eq!(method, "echo");
        assert_eq!(body, payload);
    }

    #[test]
    fn test_error_round_trip() {
        let frame = Frame::error(3, 500, "worker exploded").unwrap();
        let decoded = Frame::decode_from_bytes(frame.encode()).unwrap();
        let (code, message) = decoded.decode_error().unwrap();
        assert_eq!(code, 500);
        assert_eq!(message, "worker exploded");
    }

    #[test]
    fn test_handshake_round_trip() {
        let frame = Frame::handshake("4a1b5de0-7f5a-4b8e-8c2d-2f9e1a6c0d3b");
        assert_eq!(frame.channel, CONTROL_CHANNEL);
        let decoded = Frame::decode_from_bytes(frame.encode()).unwrap();
        assert_eq!(
            decoded.decode_handshake().unwrap(),
            "4a1b5de0-7f5a-4b8e-8c2d-2f9e1a6c0d3b"
        );
    }

    #[test]
    fn test_malformed_invoke_payload() {
        let frame = Frame {
            kind: FrameKind::Invoke,
            channel: 1,
            payload: Bytes::from_static(&[0, 0]),
        };
        assert!(matches!(
            frame.decode_invoke(),
            Err(FrameError::MalformedPayload("invoke"))
        ));
    }

    #[tokio::test]
    async fn test_read_write_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        let frame = Frame::chunk(9, Bytes::from_static(b"data")).unwrap();
        write_frame(&mut a, &frame).await.unwrap();
        write_frame(&mut a, &Frame::choke(9)).await.unwrap();

        let first = read_frame(&mut b).await.unwrap();
        assert_eq!(first.kind, FrameKind::Chunk);
        assert_eq!(first.channel, 9);
        assert_eq!(first.payload, Bytes::from_static(b"data"));

        let second = read_frame(&mut b).await.unwrap();
        assert_eq!(second.kind, FrameKind::Choke);

        drop(a);
        assert!(matches!(
            read_frame(&mut b).await,
            Err(FrameError::ConnectionClosed)
        ));
    }
}
