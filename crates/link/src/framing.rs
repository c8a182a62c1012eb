use bytes::{BufMut, Bytes, BytesMut};
use crate::LinkError;

/// kind, sequence (u16 BE)
pub const HEADER_LEN: usize = 3;
pub const DEFAULT_MTU: usize = 250;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    Data = 0x01,
    Ack = 0x02,
}

impl TryFrom<u8> for FrameKind {
    type Error = LinkError;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        match raw {
            0x01 => Ok(FrameKind::Data),
            0x02 => Ok(FrameKind::Ack),
            other => Err(LinkError::Malformed(format!("unknown frame kind 0x{:02x}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub sequence: u16,
    pub kind: FrameKind,
    pub payload: Bytes,
}

impl Frame {
    pub fn data(sequence: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            sequence,
            kind: FrameKind::Data,
            payload: payload.into(),
        }
    }

    pub fn ack(sequence: u16) -> Self {
        Self {
            sequence,
            kind: FrameKind::Ack,
            payload: Bytes::new(),
        }
    }
}

/// Encodes and decodes frames for a radio with a given MTU.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    mtu: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MTU)
    }
}

impl FrameCodec {
    pub fn new(mtu: usize) -> Self {
        Self { mtu }
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    pub fn max_payload(&self) -> usize {
        self.mtu.saturating_sub(HEADER_LEN)
    }

    pub fn encode(&self, kind: FrameKind, sequence: u16, payload: &[u8]) -> Result<Bytes, LinkError> {
        let max = self.max_payload();
        if payload.len() > max {
            return Err(LinkError::PayloadTooLarge { len: payload.len(), max });
        }

        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
        buf.put_u8(kind as u8);
        buf.put_u16(sequence);
        buf.put_slice(payload);
        Ok(buf.freeze())
    }

    pub fn encode_frame(&self, frame: &Frame) -> Result<Bytes, LinkError> {
        self.encode(frame.kind, frame.sequence, &frame.payload)
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Frame, LinkError> {
        if bytes.len() < HEADER_LEN {
            return Err(LinkError::Malformed(format!(
                "{} bytes is shorter than the {}-byte header",
                bytes.len(),
                HEADER_LEN
            )));
        }
        if bytes.len() > self.mtu {
            return Err(LinkError::Malformed(format!(
                "{} bytes exceeds the {}-byte MTU",
                bytes.len(),
                self.mtu
            )));
        }
        let kind = FrameKind::try_from(bytes[0])?;
        let sequence = u16::from_be_bytes([bytes[1], bytes[2]]);

        Ok(Frame {
            sequence,
            kind,
            payload: Bytes::copy_from_slice(&bytes[HEADER_LEN..]),
        })
    }
}

pub fn encode(kind: FrameKind, sequence: u16, payload: &[u8]) -> Result<Bytes, LinkError> {
    FrameCodec::default().encode(kind, sequence, payload)
}

pub fn decode(bytes: &[u8]) -> Result<Frame, LinkError> {
    FrameCodec::default().decode(bytes)
}
