//! The muxer's wire unit and its codec.
//!
//! A frame is `uvarint(stream_id << 3 | flag) ++ uvarint(len) ++ payload`.
//! Flags are relative to the stream's initiator, so the two sides' id
//! counters live in disjoint namespaces and cannot collide.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::MuxerError;

/// Widest header value we accept; a uvarint longer than this cannot fit a
/// `u64` and is a protocol violation.
const MAX_UVARINT_LEN: usize = 10;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[repr(u8)]
pub enum FrameFlag {
    NewStream = 0,
    MessageReceiver = 1,
    MessageInitiator = 2,
    CloseReceiver = 3,
    CloseInitiator = 4,
    ResetReceiver = 5,
    ResetInitiator = 6,
}

impl FrameFlag {
    #[must_use]
    pub fn from_wire(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::NewStream,
            1 => Self::MessageReceiver,
            2 => Self::MessageInitiator,
            3 => Self::CloseReceiver,
            4 => Self::CloseInitiator,
            5 => Self::ResetReceiver,
            6 => Self::ResetInitiator,
            _ => return None,
        })
    }

    /// Data flag as sent by the given role.
    #[must_use]
    pub fn message(initiator: bool) -> Self {
        if initiator {
            Self::MessageInitiator
        } else {
            Self::MessageReceiver
        }
    }

    /// Half-close flag as sent by the given role.
    #[must_use]
    pub fn close(initiator: bool) -> Self {
        if initiator {
            Self::CloseInitiator
        } else {
            Self::CloseReceiver
        }
    }

    /// Reset flag as sent by the given role.
    #[must_use]
    pub fn reset(initiator: bool) -> Self {
        if initiator {
            Self::ResetInitiator
        } else {
            Self::ResetReceiver
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Frame {
    pub stream_id: u64,
    pub flag: FrameFlag,
    pub payload: Bytes,
}

impl Frame {
    #[must_use]
    pub fn new(stream_id: u64, flag: FrameFlag, payload: Bytes) -> Self {
        Self {
            stream_id,
            flag,
            payload,
        }
    }

    #[must_use]
    pub fn header(stream_id: u64, flag: FrameFlag) -> Self {
        Self::new(stream_id, flag, Bytes::new())
    }
}

/// Incremental frame codec enforcing the configured payload ceiling.
#[derive(Debug)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    #[must_use]
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = MuxerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, MuxerError> {
        let Some((header, header_len)) = read_uvarint(src)? else {
            return Ok(None);
        };
        let Some((len, len_len)) = read_uvarint(&src[header_len..])? else {
            return Ok(None);
        };

        let len = usize::try_from(len)
            .map_err(|_| MuxerError::ProtocolViolation("frame length overflows usize"))?;
        if len > self.max_frame_size {
            return Err(MuxerError::FrameTooLarge {
                size: len,
                max: self.max_frame_size,
            });
        }

        let prefix = header_len + len_len;
        if src.len() < prefix + len {
            src.reserve(prefix + len - src.len());
            return Ok(None);
        }

        #[expect(clippy::cast_possible_truncation, reason = "masked to 3 bits")]
        let flag = FrameFlag::from_wire((header & 0x07) as u8)
            .ok_or(MuxerError::ProtocolViolation("unknown frame flag"))?;

        src.advance(prefix);
        let payload = src.split_to(len).freeze();

        Ok(Some(Frame {
            stream_id: header >> 3,
            flag,
            payload,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = MuxerError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), MuxerError> {
        if frame.payload.len() > self.max_frame_size {
            return Err(MuxerError::FrameTooLarge {
                size: frame.payload.len(),
                max: self.max_frame_size,
            });
        }

        dst.reserve(2 * MAX_UVARINT_LEN + frame.payload.len());
        put_uvarint(dst, frame.stream_id << 3 | u64::from(frame.flag as u8));
        put_uvarint(dst, frame.payload.len() as u64);
        dst.put_slice(&frame.payload);

        Ok(())
    }
}

fn put_uvarint(dst: &mut BytesMut, mut value: u64) {
    while value >= 0x80 {
        #[expect(clippy::cast_possible_truncation, reason = "masked to 7 bits")]
        dst.put_u8((value & 0x7f) as u8 | 0x80);
        value >>= 7;
    }
    #[expect(clippy::cast_possible_truncation, reason = "below 0x80")]
    dst.put_u8(value as u8);
}

/// Reads one uvarint without consuming input. `Ok(None)` means more bytes
/// are needed; the value and its encoded width are returned otherwise.
fn read_uvarint(buf: &[u8]) -> Result<Option<(u64, usize)>, MuxerError> {
    let mut value: u64 = 0;
    for (i, byte) in buf.iter().copied().enumerate() {
        if i >= MAX_UVARINT_LEN || (i == MAX_UVARINT_LEN - 1 && byte > 0x01) {
            return Err(MuxerError::ProtocolViolation("uvarint overflows u64"));
        }
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    Ok(None)
}
