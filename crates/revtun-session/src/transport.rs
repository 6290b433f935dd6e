//! Message-oriented transports

use bytes::{Bytes, BytesMut};
use futures_util::{Sink, Stream, TryStreamExt};
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// A duplex of discrete binary messages
///
/// A stream that ends with `None` is a clean close by the peer; an `Err`
/// item is an abnormal one.
pub trait FrameTransport:
    Stream<Item = io::Result<Bytes>> + Sink<Bytes, Error = io::Error> + Send + Unpin + 'static
{
}

impl<T> FrameTransport for T where
    T: Stream<Item = io::Result<Bytes>> + Sink<Bytes, Error = io::Error> + Send + Unpin + 'static
{
}

pub type BoxTransport = Box<dyn FrameTransport>;

/// Frame a byte stream with a 4-byte big-endian length prefix
pub fn length_delimited<T>(io: T) -> impl FrameTransport
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    Framed::new(io, LengthDelimitedCodec::new()).map_ok(BytesMut::freeze)
}
