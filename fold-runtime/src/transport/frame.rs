//! Wire format for the worker ingress socket.
//!
//! Every RPC message travels in one frame:
//! - 4 bytes: payload length (big-endian)
//! - 2 bytes: message type
//! - 8 bytes: call id, echoed back in the reply
//! - N bytes: protobuf payload

use bytes::{Buf, BufMut, Bytes, BytesMut};
use prost::Message;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame payload size (64 MB).
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Frame header size (4 bytes length + 2 bytes type + 8 bytes call id).
pub const HEADER_SIZE: usize = 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageType {
    /// `GetManifest` call; payload is `ManifestRequest`.
    GetManifest = 1,
    /// `DoRequest` call; payload is `WireRequest`.
    DoRequest = 2,
    /// Reply to `GetManifest`; payload is `WireManifest`.
    Manifest = 3,
    /// Reply to `DoRequest`; payload is `WireResponse`.
    Response = 4,
    /// Failed call; payload is `WireError`.
    Error = 5,
}

impl TryFrom<u16> for MessageType {
    type Error = FrameError;

    fn try_from(value: u16) -> Result<Self, <Self as TryFrom<u16>>::Error> {
        match value {
            1 => Ok(MessageType::GetManifest),
            2 => Ok(MessageType::DoRequest),
            3 => Ok(MessageType::Manifest),
            4 => Ok(MessageType::Response),
            5 => Ok(MessageType::Error),
            _ => Err(FrameError::InvalidMessageType(value)),
        }
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too large: {0} bytes (max: {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),

    #[error("invalid message type: {0}")]
    InvalidMessageType(u16),

    #[error("unexpected message type: {0:?}")]
    UnexpectedMessageType(MessageType),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("connection closed")]
    ConnectionClosed,
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub message_type: MessageType,
    pub call_id: u64,
    pub payload: Bytes,
}

impl Frame {
    pub fn new<M: Message>(message_type: MessageType, call_id: u64, msg: &M) -> Result<Self, FrameError> {
        let payload = msg.encode_to_vec();
        if payload.len() > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(payload.len()));
        }
        Ok(Self {
            message_type,
            call_id,
            payload: Bytes::from(payload),
        })
    }

    /// Decode the payload as a protobuf message
    pub fn decode<M: Message + Default>(&self) -> Result<M, FrameError> {
        Ok(M::decode(self.payload.clone())?)
    }

    /// Encode the frame to bytes for wire transmission
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_u32(self.payload.len() as u32);
        buf.put_u16(self.message_type as u16);
        buf.put_u64(self.call_id);
        buf.put(self.payload.clone());
        buf.freeze()
    }
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<(), FrameError> {
    writer.write_all(&frame.encode()).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, FrameError> {
    let mut header = [0u8; HEADER_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FrameError::ConnectionClosed);
        }
        Err(e) => return Err(e.into()),
    }

    let mut header = &header[..];
    let length = header.get_u32() as usize;
    let message_type = MessageType::try_from(header.get_u16())?;
    let call_id = header.get_u64();

    if length > MAX_FRAME_SIZE {
        return Err(FrameError::FrameTooLarge(length));
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;

    Ok(Frame {
        message_type,
        call_id,
        payload: Bytes::from(payload),
    })
}
