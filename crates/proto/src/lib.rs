use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::convert::TryFrom;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub const PROTOCOL_VERSION: u16 = 1;
pub const MAX_FRAME_LEN: usize = 256 * 1024;
pub const MAX_CONTROL_JSON_LEN: usize = 128 * 1024;
pub const MAX_SEQUENCE: u64 = u32::MAX as u64;
/// Upper bound on the serialized size of a relayed signal payload.
pub const MAX_SIGNAL_LEN: usize = 50_000;
/// Upper bound on the length of a report reason.
pub const MAX_REPORT_REASON_LEN: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameType {
    // client -> server
    Join = 0x01,
    Next = 0x02,
    Leave = 0x03,
    Signal = 0x04,
    Report = 0x05,
    // server -> client
    Ack = 0x10,
    Waiting = 0x11,
    Paired = 0x12,
    PartnerDisconnected = 0x13,
    Left = 0x14,
    Error = 0x15,
    Banned = 0x16,
    ReportSubmitted = 0x17,
}

impl FrameType {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Join),
            0x02 => Some(Self::Next),
            0x03 => Some(Self::Leave),
            0x04 => Some(Self::Signal),
            0x05 => Some(Self::Report),
            0x10 => Some(Self::Ack),
            0x11 => Some(Self::Waiting),
            0x12 => Some(Self::Paired),
            0x13 => Some(Self::PartnerDisconnected),
            0x14 => Some(Self::Left),
            0x15 => Some(Self::Error),
            0x16 => Some(Self::Banned),
            0x17 => Some(Self::ReportSubmitted),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum CodecError {
    InvalidFrameType,
    InvalidControlJson,
    UnexpectedEof,
    VarintOverflow,
    PayloadTooLarge,
    FrameTooLarge,
    SequenceTooLarge,
}

impl Display for CodecError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidFrameType => write!(f, "invalid frame type"),
            Self::InvalidControlJson => write!(f, "invalid control payload"),
            Self::UnexpectedEof => write!(f, "unexpected end of frame"),
            Self::VarintOverflow => write!(f, "varint overflow"),
            Self::PayloadTooLarge => write!(f, "payload exceeds limits"),
            Self::FrameTooLarge => write!(f, "frame exceeds limits"),
            Self::SequenceTooLarge => write!(f, "sequence exceeds limits"),
        }
    }
}

impl Error for CodecError {}

/// JSON control payload carried by every frame. Events without a payload
/// travel as an empty body and decode to a null value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ControlEnvelope {
    pub properties: Value,
}

impl ControlEnvelope {
    pub fn empty() -> Self {
        ControlEnvelope {
            properties: Value::Null,
        }
    }

    fn bytes(&self) -> Result<Vec<u8>, CodecError> {
        if self.properties.is_null() {
            return Ok(Vec::new());
        }
        let encoded = serde_json::to_vec(self).map_err(|_| CodecError::InvalidControlJson)?;
        if encoded.len() > MAX_CONTROL_JSON_LEN {
            return Err(CodecError::PayloadTooLarge);
        }
        Ok(encoded)
    }

    fn from_bytes(data: &[u8]) -> Result<Self, CodecError> {
        if data.is_empty() {
            return Ok(Self::empty());
        }
        if data.len() > MAX_CONTROL_JSON_LEN {
            return Err(CodecError::PayloadTooLarge);
        }
        serde_json::from_slice::<ControlEnvelope>(data).map_err(|_| CodecError::InvalidControlJson)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub sequence: u64,
    pub frame_type: FrameType,
    pub payload: ControlEnvelope,
}

impl Frame {
    pub fn new(sequence: u64, frame_type: FrameType, properties: Value) -> Self {
        Frame {
            sequence,
            frame_type,
            payload: ControlEnvelope { properties },
        }
    }

    /// Serializes the frame into a length prefixed binary representation.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        if self.sequence > MAX_SEQUENCE {
            return Err(CodecError::SequenceTooLarge);
        }
        let payload = self.payload.bytes()?;
        let mut body = Vec::with_capacity(payload.len() + 8);
        body.push(self.frame_type as u8);
        encode_varint(self.sequence, &mut body);
        encode_varint(payload.len() as u64, &mut body);
        body.extend_from_slice(&payload);
        if body.len() > MAX_FRAME_LEN {
            return Err(CodecError::FrameTooLarge);
        }
        let mut encoded = Vec::with_capacity(body.len() + 4);
        encode_varint(body.len() as u64, &mut encoded);
        encoded.extend_from_slice(&body);
        Ok(encoded)
    }

    /// Attempts to decode one frame from the head of a contiguous buffer,
    /// returning the frame and the number of bytes consumed.
    pub fn decode(buffer: &[u8]) -> Result<(Self, usize), CodecError> {
        let (frame_len_raw, header_len) = decode_varint(buffer)?;
        let frame_len = usize::try_from(frame_len_raw).map_err(|_| CodecError::FrameTooLarge)?;
        if frame_len > MAX_FRAME_LEN {
            return Err(CodecError::FrameTooLarge);
        }
        if buffer.len() < header_len + frame_len {
            return Err(CodecError::UnexpectedEof);
        }
        let frame_slice = &buffer[header_len..header_len + frame_len];
        if frame_slice.is_empty() {
            return Err(CodecError::UnexpectedEof);
        }
        let frame_type = FrameType::from_u8(frame_slice[0]).ok_or(CodecError::InvalidFrameType)?;
        let mut cursor = 1;
        let (sequence, read) = decode_varint(&frame_slice[cursor..])?;
        cursor += read;
        if sequence > MAX_SEQUENCE {
            return Err(CodecError::SequenceTooLarge);
        }
        let (payload_len_raw, read) = decode_varint(&frame_slice[cursor..])?;
        cursor += read;
        let payload_len =
            usize::try_from(payload_len_raw).map_err(|_| CodecError::PayloadTooLarge)?;
        if payload_len > MAX_CONTROL_JSON_LEN {
            return Err(CodecError::PayloadTooLarge);
        }
        if frame_slice.len() < cursor + payload_len {
            return Err(CodecError::UnexpectedEof);
        }
        let payload = ControlEnvelope::from_bytes(&frame_slice[cursor..cursor + payload_len])?;
        Ok((
            Frame {
                sequence,
                frame_type,
                payload,
            },
            header_len + frame_len,
        ))
    }
}

fn encode_varint(mut value: u64, buffer: &mut Vec<u8>) {
    while value >= 0x80 {
        buffer.push(((value as u8) & 0x7f) | 0x80);
        value >>= 7;
    }
    buffer.push(value as u8);
}

fn decode_varint(buffer: &[u8]) -> Result<(u64, usize), CodecError> {
    let mut value = 0u64;
    let mut shift = 0u32;
    for (index, byte) in buffer.iter().enumerate() {
        let part = (byte & 0x7f) as u64;
        value |= part << shift;
        if byte & 0x80 == 0 {
            return Ok((value, index + 1));
        }
        shift += 7;
        if shift > 63 {
            return Err(CodecError::VarintOverflow);
        }
    }
    Err(CodecError::UnexpectedEof)
}

/// `signal` in both directions: the server rewrites `peer` to the sender id
/// before forwarding and passes `signal` through verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub peer: String,
    pub signal: Value,
}

impl SignalEnvelope {
    /// Outer-shape validation only: peer id present, signal a structured
    /// object within the relay size ceiling. The blob itself stays opaque.
    pub fn validate(&self) -> Result<(), CodecError> {
        if self.peer.is_empty() {
            return Err(CodecError::InvalidControlJson);
        }
        if !self.signal.is_object() {
            return Err(CodecError::InvalidControlJson);
        }
        let encoded =
            serde_json::to_vec(&self.signal).map_err(|_| CodecError::InvalidControlJson)?;
        if encoded.len() > MAX_SIGNAL_LEN {
            return Err(CodecError::PayloadTooLarge);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportRequest {
    pub peer: String,
    pub reason: String,
}

impl ReportRequest {
    pub fn validate(&self) -> Result<(), CodecError> {
        if self.peer.is_empty() {
            return Err(CodecError::InvalidControlJson);
        }
        if self.reason.is_empty() || self.reason.len() > MAX_REPORT_REASON_LEN {
            return Err(CodecError::InvalidControlJson);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairedNotice {
    pub peer: String,
    pub initiator: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorNotice {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BannedNotice {
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportAck {
    pub success: bool,
}

fn encode_control<T: Serialize>(value: T) -> Result<ControlEnvelope, CodecError> {
    let properties = serde_json::to_value(value).map_err(|_| CodecError::InvalidControlJson)?;
    Ok(ControlEnvelope { properties })
}

fn decode_control<T: DeserializeOwned>(envelope: &ControlEnvelope) -> Result<T, CodecError> {
    serde_json::from_value(envelope.properties.clone()).map_err(|_| CodecError::InvalidControlJson)
}

macro_rules! impl_control_codec {
    ($ty:ty) => {
        impl TryFrom<$ty> for ControlEnvelope {
            type Error = CodecError;

            fn try_from(value: $ty) -> Result<Self, Self::Error> {
                encode_control(value)
            }
        }

        impl TryFrom<&$ty> for ControlEnvelope {
            type Error = CodecError;

            fn try_from(value: &$ty) -> Result<Self, Self::Error> {
                encode_control(value)
            }
        }

        impl TryFrom<&ControlEnvelope> for $ty {
            type Error = CodecError;

            fn try_from(envelope: &ControlEnvelope) -> Result<Self, Self::Error> {
                decode_control::<$ty>(envelope)
            }
        }
    };
}

impl_control_codec!(SignalEnvelope);
impl_control_codec!(ReportRequest);
impl_control_codec!(PairedNotice);
impl_control_codec!(ErrorNotice);
impl_control_codec!(BannedNotice);
impl_control_codec!(ReportAck);
