//! Wire framing: a 4-byte little-endian length followed by a UTF-8 payload.
//!
//! There is no acknowledgement; the aggregator reads frames until the
//! connection closes.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::StreamLogError;

/// Size of the length prefix.
pub const HEADER_LEN: usize = 4;

/// Default upper bound of one payload.
pub const DEFAULT_MAX_FRAME: usize = 4 * 1024 * 1024;

/// Length-prefixed string frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodec {
    max_frame: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME)
    }
}

impl FrameCodec {
    /// Creates a codec rejecting payloads longer than `max_frame`.
    #[must_use]
    pub const fn new(max_frame: usize) -> Self {
        Self { max_frame }
    }

    /// Largest accepted payload.
    #[must_use]
    pub const fn max_frame(&self) -> usize {
        self.max_frame
    }

    fn check(&self, len: usize) -> Result<(), StreamLogError> {
        if len > self.max_frame {
            return Err(StreamLogError::FrameTooLarge {
                len,
                max: self.max_frame,
            });
        }
        Ok(())
    }
}

impl<T: AsRef<str>> Encoder<T> for FrameCodec {
    type Error = StreamLogError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = item.as_ref().as_bytes();
        self.check(payload.len())?;
        let len = u32::try_from(payload.len()).map_err(|_| StreamLogError::FrameTooLarge {
            len: payload.len(),
            max: self.max_frame,
        })?;
        dst.reserve(HEADER_LEN + payload.len());
        dst.put_u32_le(len);
        dst.put_slice(payload);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = String;
    type Error = StreamLogError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&src[..HEADER_LEN]);
        let len = u32::from_le_bytes(header) as usize;
        self.check(len)?;

        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(len);
        String::from_utf8(payload.to_vec())
            .map(Some)
            .map_err(|_| StreamLogError::InvalidUtf8)
    }
}
