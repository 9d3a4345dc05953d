//! Length-prefixed framing for the native-messaging pipe.
//!
//! Every message in both directions is a 4-byte length prefix followed by
//! exactly that many bytes of UTF-8 JSON. [`FrameCodec`] handles the framing
//! only; [`JsonCodec`] layers serde_json on top for typed messages.
//! Both work over any AsyncRead/AsyncWrite (child pipes, duplex streams).

use std::io;
use std::marker::PhantomData;
use std::str::FromStr;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Width of the length prefix in bytes.
pub const LENGTH_PREFIX_BYTES: usize = 4;

/// Largest frame accepted unless configured otherwise (64 MiB).
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

/// Byte order of the length prefix.
///
/// Both ends of the pipe must agree. The peer writes its native machine word,
/// which is little-endian on every platform it ships for, so `Little` is the
/// default and `Native` exists for exotic hosts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LengthPrefixOrder {
    #[default]
    Little,
    Big,
    Native,
}

impl FromStr for LengthPrefixOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "little" | "le" => Ok(Self::Little),
            "big" | "be" => Ok(Self::Big),
            "native" => Ok(Self::Native),
            other => Err(format!(
                "unknown length prefix order '{other}', expected little, big or native"
            )),
        }
    }
}

/// Raw frame codec: 4-byte length prefix plus opaque payload.
///
/// Decoding is streaming: `decode` returns `None` until a whole frame is
/// buffered. A stream that ends mid-frame is reported as `UnexpectedEof`.
#[derive(Debug)]
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
    /// A length prefix was consumed but its payload has not been produced yet.
    mid_frame: bool,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(LengthPrefixOrder::default())
    }
}

impl FrameCodec {
    pub fn new(order: LengthPrefixOrder) -> Self {
        Self::with_max_frame_length(order, DEFAULT_MAX_FRAME_LENGTH)
    }

    pub fn with_max_frame_length(order: LengthPrefixOrder, max_frame_length: usize) -> Self {
        let mut builder = LengthDelimitedCodec::builder();
        builder
            .length_field_length(LENGTH_PREFIX_BYTES)
            .max_frame_length(max_frame_length);
        match order {
            LengthPrefixOrder::Little => builder.little_endian(),
            LengthPrefixOrder::Big => builder.big_endian(),
            LengthPrefixOrder::Native => builder.native_endian(),
        };
        Self {
            inner: builder.new_codec(),
            mid_frame: false,
        }
    }

    pub fn max_frame_length(&self) -> usize {
        self.inner.max_frame_length()
    }
}

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let buffered = src.len();
        let frame = self.inner.decode(src)?;
        if frame.is_some() {
            self.mid_frame = false;
        } else if src.len() < buffered {
            self.mid_frame = true;
        }
        Ok(frame)
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None if buf.is_empty() && !self.mid_frame => Ok(None),
            None => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("stream ended mid-frame with {} bytes buffered", buf.len()),
            )),
        }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.inner.encode(item, dst)
    }
}

/// Codec that frames messages with a length prefix and serializes with JSON.
pub struct JsonCodec<T> {
    inner: FrameCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new(FrameCodec::default())
    }
}

impl<T> JsonCodec<T> {
    pub fn new(inner: FrameCodec) -> Self {
        Self {
            inner,
            _phantom: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(bytes) => {
                let item = serde_json::from_slice(&bytes)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode_eof(buf)? {
            Some(bytes) => {
                let item = serde_json::from_slice(&bytes)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let json_len = json.len();
        tracing::trace!(json_size_bytes = json_len, "Encoding frame");
        if json_len > 1_000_000 {
            tracing::debug!(
                json_size_bytes = json_len,
                json_size_kb = json_len / 1024,
                "Large frame being encoded"
            );
        }
        self.inner.encode(Bytes::from(json), dst)
    }
}
