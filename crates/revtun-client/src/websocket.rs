//! WebSocket message transport

use bytes::Bytes;
use futures_util::{Sink, Stream};
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::trace;

/// Binary WebSocket messages as session frames
///
/// A Close frame (or the connection already being closed) ends the stream
/// cleanly; any other failure is reported as an error. Ping, pong and text
/// messages are skipped.
#[derive(Debug)]
pub struct WsFrames<S> {
    inner: WebSocketStream<S>,
}

impl<S> WsFrames<S> {
    pub fn new(inner: WebSocketStream<S>) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> WebSocketStream<S> {
        self.inner
    }
}

fn to_io_error(e: WsError) -> io::Error {
    match e {
        WsError::Io(e) => e,
        other => io::Error::other(other),
    }
}

fn is_closed(e: &WsError) -> bool {
    matches!(e, WsError::ConnectionClosed | WsError::AlreadyClosed)
}

impl<S> Stream for WsFrames<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match ready!(Pin::new(&mut self.inner).poll_next(cx)) {
                Some(Ok(Message::Binary(data))) => return Poll::Ready(Some(Ok(Bytes::from(data)))),
                Some(Ok(Message::Close(frame))) => {
                    trace!("WebSocket close received: {:?}", frame);
                    return Poll::Ready(None);
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) if is_closed(&e) => return Poll::Ready(None),
                Some(Err(e)) => return Poll::Ready(Some(Err(to_io_error(e)))),
                None => return Poll::Ready(None),
            }
        }
    }
}

impl<S> Sink<Bytes> for WsFrames<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    type Error = io::Error;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_ready(cx).map_err(to_io_error)
    }

    fn start_send(mut self: Pin<&mut Self>, item: Bytes) -> io::Result<()> {
        Pin::new(&mut self.inner)
            .start_send(Message::Binary(item.to_vec()))
            .map_err(to_io_error)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx).map_err(to_io_error)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match ready!(Pin::new(&mut self.inner).poll_close(cx)) {
            Err(e) if !is_closed(&e) => Poll::Ready(Err(to_io_error(e))),
            _ => Poll::Ready(Ok(())),
        }
    }
}
