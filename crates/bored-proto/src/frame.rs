//! Multiplexer frame encoding and decoding

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Size of the fixed frame header (stream id + type)
pub const FRAME_HEADER_LEN: usize = 5;

/// Frame decoding errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtoError {
    #[error("Frame too short: {0} bytes")]
    TooShort(usize),

    #[error("Unknown frame type: {0}")]
    UnknownType(u8),

    #[error("Malformed {0:?} frame payload")]
    MalformedPayload(FrameType),
}

/// Frame type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Data = 0,
    Fin = 1,
    Rst = 2,
    WindowUpdate = 3,
}

impl TryFrom<u8> for FrameType {
    type Error = ProtoError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameType::Data),
            1 => Ok(FrameType::Fin),
            2 => Ok(FrameType::Rst),
            3 => Ok(FrameType::WindowUpdate),
            other => Err(ProtoError::UnknownType(other)),
        }
    }
}

/// A decoded multiplexer frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data { stream_id: u32, payload: Bytes },
    Fin { stream_id: u32 },
    Rst { stream_id: u32 },
    WindowUpdate { stream_id: u32, increment: u32 },
}

impl Frame {
    pub fn stream_id(&self) -> u32 {
        match self {
            Frame::Data { stream_id, .. }
            | Frame::Fin { stream_id }
            | Frame::Rst { stream_id }
            | Frame::WindowUpdate { stream_id, .. } => *stream_id,
        }
    }

    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Data { .. } => FrameType::Data,
            Frame::Fin { .. } => FrameType::Fin,
            Frame::Rst { .. } => FrameType::Rst,
            Frame::WindowUpdate { .. } => FrameType::WindowUpdate,
        }
    }

    /// Encode into a single WebSocket message body
    pub fn encode(&self) -> Vec<u8> {
        let payload_len = match self {
            Frame::Data { payload, .. } => payload.len(),
            Frame::WindowUpdate { .. } => 4,
            Frame::Fin { .. } | Frame::Rst { .. } => 0,
        };

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload_len);
        buf.put_u32(self.stream_id());
        buf.put_u8(self.frame_type() as u8);

        match self {
            Frame::Data { payload, .. } => buf.put_slice(payload),
            Frame::WindowUpdate { increment, .. } => buf.put_u32(*increment),
            Frame::Fin { .. } | Frame::Rst { .. } => {}
        }

        buf.to_vec()
    }

    /// Decode a frame from a WebSocket message body
    pub fn decode(data: &[u8]) -> Result<Self, ProtoError> {
        if data.len() < FRAME_HEADER_LEN {
            return Err(ProtoError::TooShort(data.len()));
        }

        let stream_id = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let frame_type = FrameType::try_from(data[4])?;
        let payload = &data[FRAME_HEADER_LEN..];

        match frame_type {
            FrameType::Data => Ok(Frame::Data {
                stream_id,
                payload: Bytes::copy_from_slice(payload),
            }),
            FrameType::Fin => Ok(Frame::Fin { stream_id }),
            FrameType::Rst => Ok(Frame::Rst { stream_id }),
            FrameType::WindowUpdate => {
                let increment: [u8; 4] = payload
                    .try_into()
                    .map_err(|_| ProtoError::MalformedPayload(FrameType::WindowUpdate))?;
                Ok(Frame::WindowUpdate {
                    stream_id,
                    increment: u32::from_be_bytes(increment),
                })
            }
        }
    }
}
