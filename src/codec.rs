//! Pluggable message codecs and per-stream codec resolution.
//!
//! Every virtual stream carries records of one item type `T`. The codec that
//! turns those records into channel payloads is chosen by a [`CodecSource`]:
//! either one fixed codec for every stream, or a resolver evaluated once per
//! stream, per side, after the channel's open handshake has completed.

use crate::error::{Error, Result};
use crate::protocol::ControlMessage;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// Binary codec for one record type
pub trait Codec: Send + Sync + 'static {
    type Item: Send + 'static;

    /// Append the encoding of `item` to `dst`
    fn encode(&self, item: &Self::Item, dst: &mut BytesMut) -> Result<()>;

    /// Decode one record from a complete channel payload
    fn decode(&self, src: Bytes) -> Result<Self::Item>;
}

/// Shared, type-erased codec for records of type `T`
pub type SharedCodec<T> = Arc<dyn Codec<Item = T>>;

/// Raw bytes, passed through unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

impl Codec for RawCodec {
    type Item = Bytes;

    fn encode(&self, item: &Bytes, dst: &mut BytesMut) -> Result<()> {
        dst.put_slice(item);
        Ok(())
    }

    fn decode(&self, src: Bytes) -> Result<Bytes> {
        Ok(src)
    }
}

/// JSON records via serde
pub struct JsonCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for JsonCodec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("JsonCodec")
    }
}

impl<T> Codec for JsonCodec<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    type Item = T;

    fn encode(&self, item: &T, dst: &mut BytesMut) -> Result<()> {
        serde_json::to_writer(dst.writer(), item)?;
        Ok(())
    }

    fn decode(&self, src: Bytes) -> Result<T> {
        Ok(serde_json::from_slice(&src)?)
    }
}

const CONTROL_FLAG_INITIATOR: u8 = 0x01;
const CONTROL_FLAG_DECLINED: u8 = 0x02;

/// Control message codec
///
/// Wire format: `[flags: u8][id]`, bit 0 of `flags` = `is_initiator`,
/// bit 1 = `declined`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ControlCodec;

impl Codec for ControlCodec {
    type Item = ControlMessage;

    fn encode(&self, item: &ControlMessage, dst: &mut BytesMut) -> Result<()> {
        let mut flags = 0;
        if item.is_initiator {
            flags |= CONTROL_FLAG_INITIATOR;
        }
        if item.declined {
            flags |= CONTROL_FLAG_DECLINED;
        }
        dst.reserve(1 + item.id.len());
        dst.put_u8(flags);
        dst.put_slice(&item.id);
        Ok(())
    }

    fn decode(&self, mut src: Bytes) -> Result<ControlMessage> {
        if !src.has_remaining() {
            return Err(Error::Codec("Empty control message".to_string()));
        }
        let flags = src.get_u8();
        if flags & !(CONTROL_FLAG_INITIATOR | CONTROL_FLAG_DECLINED) != 0 {
            return Err(Error::Codec(format!(
                "Unknown control flags {:02x}",
                flags
            )));
        }
        Ok(ControlMessage {
            is_initiator: flags & CONTROL_FLAG_INITIATOR != 0,
            declined: flags & CONTROL_FLAG_DECLINED != 0,
            id: src,
        })
    }
}

/// Inputs to a codec resolver
#[derive(Debug, Clone, Copy)]
pub struct CodecContext<'a> {
    /// Whether the resolving side initiated the stream
    pub is_initiator: bool,
    pub id: &'a [u8],
    /// Remote handshake received at channel open
    pub handshake: &'a [u8],
}

/// Resolver callback: `None` selects the fallback codec
pub type ResolveFn<T> = Arc<dyn Fn(CodecContext<'_>) -> Option<SharedCodec<T>> + Send + Sync>;

/// Where a stream's codec comes from
pub enum CodecSource<T> {
    /// One codec for every stream
    Fixed(SharedCodec<T>),
    /// Evaluated once per stream, per side
    Resolver {
        resolve: ResolveFn<T>,
        fallback: SharedCodec<T>,
    },
}

impl<T> Clone for CodecSource<T> {
    fn clone(&self) -> Self {
        match self {
            CodecSource::Fixed(codec) => CodecSource::Fixed(codec.clone()),
            CodecSource::Resolver { resolve, fallback } => CodecSource::Resolver {
                resolve: resolve.clone(),
                fallback: fallback.clone(),
            },
        }
    }
}

impl<T> fmt::Debug for CodecSource<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecSource::Fixed(_) => f.write_str("CodecSource::Fixed"),
            CodecSource::Resolver { .. } => f.write_str("CodecSource::Resolver"),
        }
    }
}

impl<T: Send + 'static> CodecSource<T> {
    pub fn fixed<C: Codec<Item = T>>(codec: C) -> Self {
        CodecSource::Fixed(Arc::new(codec))
    }

    pub fn resolver_with_fallback<F, C>(resolve: F, fallback: C) -> Self
    where
        F: Fn(CodecContext<'_>) -> Option<SharedCodec<T>> + Send + Sync + 'static,
        C: Codec<Item = T>,
    {
        CodecSource::Resolver {
            resolve: Arc::new(resolve),
            fallback: Arc::new(fallback),
        }
    }

    /// Pick the codec for one stream side
    pub fn resolve(&self, cx: CodecContext<'_>) -> SharedCodec<T> {
        match self {
            CodecSource::Fixed(codec) => codec.clone(),
            CodecSource::Resolver { resolve, fallback } => {
                resolve(cx).unwrap_or_else(|| fallback.clone())
            }
        }
    }
}

impl CodecSource<Bytes> {
    /// Resolver falling back to [`RawCodec`]
    pub fn resolver<F>(resolve: F) -> Self
    where
        F: Fn(CodecContext<'_>) -> Option<SharedCodec<Bytes>> + Send + Sync + 'static,
    {
        Self::resolver_with_fallback(resolve, RawCodec)
    }
}

impl Default for CodecSource<Bytes> {
    fn default() -> Self {
        CodecSource::fixed(RawCodec)
    }
}
