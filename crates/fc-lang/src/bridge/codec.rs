//! Length-prefixed JSON framing.
//!
//! Every channel the bridge speaks (inbound RPC, reverse channel) uses a
//! 4-byte big-endian length followed by one serde_json document.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Upper bound on a single frame; larger frames close the connection.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Frame size above which encoding is logged at debug level.
const LARGE_FRAME_BYTES: usize = 256 * 1024;

pub struct JsonCodec<T> {
    frames: LengthDelimitedCodec,
    _item: PhantomData<fn() -> T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            frames: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(MAX_FRAME_BYTES)
                .new_codec(),
            _item: PhantomData,
        }
    }
}

fn invalid(e: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<T>, io::Error> {
        let Some(frame) = self.frames.decode(src)? else {
            return Ok(None);
        };
        serde_json::from_slice(&frame).map(Some).map_err(invalid)
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), io::Error> {
        let body = serde_json::to_vec(&item).map_err(invalid)?;
        if body.len() > LARGE_FRAME_BYTES {
            tracing::debug!(frame_bytes = body.len(), "Encoding large frame");
        } else {
            tracing::trace!(frame_bytes = body.len(), "Encoding frame");
        }
        self.frames.encode(Bytes::from(body), dst)
    }
}

#[cfg(test)]
mod tests {
    use tokio_util::bytes::BufMut;

    use super::*;
    use crate::bridge::protocol::{Call, HandlesCall, Request};

    #[test]
    fn request_survives_framing() {
        let mut codec = JsonCodec::<Request>::new();
        let mut buf = BytesMut::new();
        let req = Request {
            id: 11,
            call: Call::Handles(HandlesCall::Release { hnd: 4 }),
        };
        codec.encode(req.clone(), &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, req);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let mut codec = JsonCodec::<serde_json::Value>::new();
        let mut buf = BytesMut::new();
        codec.encode(serde_json::json!({"a": 1}), &mut buf).unwrap();
        let tail = buf.split_off(5);

        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.unsplit(tail);
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(serde_json::json!({"a": 1}))
        );
    }

    #[test]
    fn garbage_body_is_invalid_data() {
        let mut codec = JsonCodec::<serde_json::Value>::new();
        let mut buf = BytesMut::new();
        buf.put_u32(3);
        buf.put_slice(b"{{{");
        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut codec = JsonCodec::<serde_json::Value>::new();
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_BYTES + 1) as u32);
        assert!(codec.decode(&mut buf).is_err());
    }
}
