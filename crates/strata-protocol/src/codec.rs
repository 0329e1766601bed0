use tracing::trace;

use crate::error::{ProtocolError, ProtocolResult};
use crate::message::{Frame, MAX_MESSAGE_SIZE};

/// Length of the big-endian length prefix.
const LEN_BYTES: usize = 4;
/// Length of the CRC32 trailer covering tag and payload.
const CRC_BYTES: usize = 4;

/// Codec for Strata frames.
///
/// Layout: `[4 bytes len][1 byte tag][bincode payload][4 bytes crc32]`, where
/// `len` counts the tag and payload and the trailer covers the same bytes.
pub struct StrataCodec;

impl StrataCodec {
    /// Encode a frame.
    pub fn encode(frame: &Frame) -> ProtocolResult<Vec<u8>> {
        let payload =
            bincode::serialize(frame).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: payload.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        let body_len = payload.len() + 1;
        let mut buf = Vec::with_capacity(LEN_BYTES + body_len + CRC_BYTES);
        buf.extend_from_slice(&(body_len as u32).to_be_bytes());
        buf.push(frame.type_tag());
        buf.extend_from_slice(&payload);
        let crc = crc32fast::hash(&buf[LEN_BYTES..]);
        buf.extend_from_slice(&crc.to_be_bytes());
        trace!(frame = frame.type_name(), seq = %frame.seq(), bytes = buf.len(), "encoded frame");
        Ok(buf)
    }

    /// Decode one frame from the front of `data`. Returns the frame and the
    /// number of bytes consumed.
    pub fn decode(data: &[u8]) -> ProtocolResult<(Frame, usize)> {
        if data.len() < LEN_BYTES + 1 + CRC_BYTES {
            return Err(ProtocolError::FramingError("too short".into()));
        }
        let mut len_bytes = [0u8; LEN_BYTES];
        len_bytes.copy_from_slice(&data[..LEN_BYTES]);
        let body_len = u32::from_be_bytes(len_bytes) as usize;
        if body_len < 1 {
            return Err(ProtocolError::FramingError("zero-length frame".into()));
        }
        if body_len - 1 > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: body_len - 1,
                max: MAX_MESSAGE_SIZE,
            });
        }
        let total = LEN_BYTES + body_len + CRC_BYTES;
        if data.len() < total {
            return Err(ProtocolError::FramingError(format!(
                "incomplete: have {}, need {}",
                data.len(),
                total
            )));
        }

        let body = &data[LEN_BYTES..LEN_BYTES + body_len];
        let mut crc_bytes = [0u8; CRC_BYTES];
        crc_bytes.copy_from_slice(&data[LEN_BYTES + body_len..total]);
        let expected = u32::from_be_bytes(crc_bytes);
        let actual = crc32fast::hash(body);
        if expected != actual {
            return Err(ProtocolError::FrameChecksum { expected, actual });
        }

        let tag = body[0];
        if !(1..=4).contains(&tag) {
            return Err(ProtocolError::InvalidFrameType(tag));
        }
        let frame: Frame = bincode::deserialize(&body[1..])
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        if frame.type_tag() != tag {
            return Err(ProtocolError::TagMismatch {
                tag,
                decoded: frame.type_tag(),
            });
        }
        Ok((frame, total))
    }

    /// Decode every frame in a contiguous buffer.
    pub fn decode_all(mut data: &[u8]) -> ProtocolResult<Vec<Frame>> {
        let mut frames = Vec::new();
        while !data.is_empty() {
            let (frame, used) = Self::decode(data)?;
            frames.push(frame);
            data = &data[used..];
        }
        Ok(frames)
    }
}
