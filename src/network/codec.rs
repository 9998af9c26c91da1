use std::marker::PhantomData;

use bytes::Buf;
use bytes::BufMut;
use bytes::BytesMut;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::codec::Decoder;
use tokio_util::codec::Encoder;

use crate::constants::FRAME_HEADER_LEN;
use crate::ProtocolError;

/// Length-prefixed bincode frames: `u32` big-endian payload length, then payload.
///
/// Frames whose declared length exceeds `max_frame_len` are rejected before any
/// payload is buffered.
#[derive(Debug)]
pub struct FrameCodec<In, Out> {
    max_frame_len: usize,
    bytes_encoded: u64,
    _marker: PhantomData<fn(Out) -> In>,
}

impl<In, Out> FrameCodec<In, Out> {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            max_frame_len,
            bytes_encoded: 0,
            _marker: PhantomData,
        }
    }

    /// Total frame bytes produced by this codec, headers included
    pub fn bytes_encoded(&self) -> u64 {
        self.bytes_encoded
    }
}

impl<In: DeserializeOwned, Out> Decoder for FrameCodec<In, Out> {
    type Item = In;
    type Error = ProtocolError;

    fn decode(
        &mut self,
        src: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let mut header = [0u8; FRAME_HEADER_LEN];
        header.copy_from_slice(&src[..FRAME_HEADER_LEN]);
        let len = u32::from_be_bytes(header) as usize;

        if len > self.max_frame_len {
            return Err(ProtocolError::FrameTooLarge {
                size: len,
                max: self.max_frame_len,
            });
        }

        if src.len() < FRAME_HEADER_LEN + len {
            src.reserve(FRAME_HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(FRAME_HEADER_LEN);
        let payload = src.split_to(len);
        Ok(Some(bincode::deserialize(&payload)?))
    }
}

impl<In, Out: Serialize> Encoder<Out> for FrameCodec<In, Out> {
    type Error = ProtocolError;

    fn encode(
        &mut self,
        item: Out,
        dst: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        let len = bincode::serialized_size(&item)? as usize;
        if len > self.max_frame_len {
            return Err(ProtocolError::FrameTooLarge {
                size: len,
                max: self.max_frame_len,
            });
        }

        dst.reserve(FRAME_HEADER_LEN + len);
        dst.put_u32(len as u32);
        bincode::serialize_into(dst.writer(), &item)?;
        self.bytes_encoded += (FRAME_HEADER_LEN + len) as u64;
        Ok(())
    }
}
