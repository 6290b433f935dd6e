//! In-memory tunnel server used by the client tests
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Sink, Stream};
use revtun_client::{Connector, ConnectionState, TunnelClient, TunnelError};
use revtun_proto::{decode_config, ForwardingRule, CONFIG_REQUEST, PING_REQUEST, PROTOCOL_VERSION};
use revtun_session::{accept, length_delimited, BoxTransport, ServerIdentity};
use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::duplex;
use tokio::sync::mpsc;

pub const AUTH: &str = "admin:secret";

/// How the server treats one accepted connection
#[derive(Debug, Clone, PartialEq)]
pub enum Behavior {
    /// Accept the config and keep the session open
    Hold,
    /// Refuse the credentials
    RejectAuth,
    /// Answer the config request with this rejection text
    RejectConfig(String),
    /// Accept the config, then end the connection
    CloseAfterConfig { graceful: bool },
    /// Accept the config, then send the client a request and open a channel
    Probe,
    /// Like `Hold`, but closing the client's end of the transport fails
    BrokenClose,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    Config(Vec<ForwardingRule>),
    Ping,
    Probed {
        request_accepted: bool,
        channel_refused: bool,
    },
}

/// Connector that hands out in-memory transports to a scripted server
pub struct FakeServer {
    identity: Arc<ServerIdentity>,
    failing_dials: usize,
    behaviors: Mutex<VecDeque<Behavior>>,
    dials: Mutex<Vec<Instant>>,
    events: mpsc::UnboundedSender<ServerEvent>,
}

impl FakeServer {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ServerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let server = Self {
            identity: Arc::new(ServerIdentity::generate()),
            failing_dials: 0,
            behaviors: Mutex::new(VecDeque::new()),
            dials: Mutex::new(Vec::new()),
            events,
        };
        (server, rx)
    }

    /// Refuse the first `n` dials
    pub fn fail_first(mut self, n: usize) -> Self {
        self.failing_dials = n;
        self
    }

    /// Script the next successful connection; unscripted ones use `Hold`
    pub fn then(self, behavior: Behavior) -> Self {
        self.behaviors.lock().unwrap().push_back(behavior);
        self
    }

    pub fn fingerprint(&self) -> String {
        self.identity.fingerprint()
    }

    pub fn dial_count(&self) -> usize {
        self.dials.lock().unwrap().len()
    }

    pub fn dial_times(&self) -> Vec<Instant> {
        self.dials.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for FakeServer {
    async fn connect(&self) -> Result<BoxTransport, TunnelError> {
        let attempt = {
            let mut dials = self.dials.lock().unwrap();
            dials.push(Instant::now());
            dials.len()
        };
        if attempt <= self.failing_dials {
            return Err(TunnelError::Dial("connection refused".to_string()));
        }

        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Behavior::Hold);

        let (client_io, server_io) = duplex(64 * 1024);
        let client: BoxTransport = match behavior {
            Behavior::CloseAfterConfig { graceful: false } => {
                Box::new(ResetOnEof(length_delimited(client_io)))
            }
            Behavior::BrokenClose => Box::new(BrokenClose(length_delimited(client_io))),
            _ => Box::new(length_delimited(client_io)),
        };

        tokio::spawn(serve(
            Box::new(length_delimited(server_io)),
            self.identity.clone(),
            behavior,
            self.events.clone(),
        ));
        Ok(client)
    }
}

async fn serve(
    transport: BoxTransport,
    identity: Arc<ServerIdentity>,
    behavior: Behavior,
    events: mpsc::UnboundedSender<ServerEvent>,
) {
    let allow = behavior != Behavior::RejectAuth;
    let accepted = accept(transport, PROTOCOL_VERSION, &identity, |user, password| {
        allow && format!("{}:{}", user, password) == AUTH
    })
    .await;
    let Ok((session, mut incoming)) = accepted else {
        return;
    };

    while let Some(request) = incoming.requests.recv().await {
        let name = request.name().to_string();
        match name.as_str() {
            CONFIG_REQUEST => {
                let rules = decode_config(request.payload()).unwrap_or_default();
                let _ = events.send(ServerEvent::Config(rules));

                if let Behavior::RejectConfig(text) = &behavior {
                    let _ = request.reply(false, Bytes::from(text.clone())).await;
                    continue;
                }
                let _ = request.reply(true, Bytes::new()).await;

                match &behavior {
                    Behavior::CloseAfterConfig { graceful: true } => {
                        let _ = session.close().await;
                        return;
                    }
                    // Dropping the last handle tears the session down
                    Behavior::CloseAfterConfig { graceful: false } => return,
                    Behavior::Probe => {
                        let session = session.clone();
                        let events = events.clone();
                        tokio::spawn(async move {
                            let reply = session.request("shell", Bytes::new()).await;
                            let mut channel = session.open_channel("127.0.0.1:22").await.ok();
                            let refused = match channel.as_mut() {
                                Some(channel) => channel.recv().await.is_none(),
                                None => false,
                            };
                            let _ = events.send(ServerEvent::Probed {
                                request_accepted: reply.map(|r| r.accepted).unwrap_or(true),
                                channel_refused: refused,
                            });
                        });
                    }
                    _ => {}
                }
            }
            PING_REQUEST => {
                let _ = events.send(ServerEvent::Ping);
                let _ = request.reply(true, Bytes::new()).await;
            }
            _ => {}
        }
    }
}

/// Turns a clean end-of-stream into a connection reset
pub struct ResetOnEof<T>(pub T);

impl<T: Stream<Item = io::Result<Bytes>> + Unpin> Stream for ResetOnEof<T> {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.0).poll_next(cx) {
            Poll::Ready(None) => Poll::Ready(Some(Err(io::ErrorKind::ConnectionReset.into()))),
            other => other,
        }
    }
}

impl<T: Sink<Bytes, Error = io::Error> + Unpin> Sink<Bytes> for ResetOnEof<T> {
    type Error = io::Error;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_ready(cx)
    }

    fn start_send(mut self: Pin<&mut Self>, item: Bytes) -> io::Result<()> {
        Pin::new(&mut self.0).start_send(item)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_flush(cx)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_close(cx)
    }
}

/// Fails every attempt to close the transport
pub struct BrokenClose<T>(pub T);

impl<T: Stream<Item = io::Result<Bytes>> + Unpin> Stream for BrokenClose<T> {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.0).poll_next(cx)
    }
}

impl<T: Sink<Bytes, Error = io::Error> + Unpin> Sink<Bytes> for BrokenClose<T> {
    type Error = io::Error;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_ready(cx)
    }

    fn start_send(mut self: Pin<&mut Self>, item: Bytes) -> io::Result<()> {
        Pin::new(&mut self.0).start_send(item)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "close refused")))
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Wait until the client reaches a state matching `predicate`
pub async fn wait_for_state<F>(client: &TunnelClient, predicate: F) -> ConnectionState
where
    F: Fn(&ConnectionState) -> bool,
{
    let mut states = client.subscribe();
    let state = tokio::time::timeout(Duration::from_secs(5), states.wait_for(|s| predicate(s)))
        .await
        .expect("timed out waiting for state")
        .expect("client dropped")
        .clone();
    state
}

pub async fn next_event(events: &mut mpsc::UnboundedReceiver<ServerEvent>) -> ServerEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for server event")
        .expect("server gone")
}
