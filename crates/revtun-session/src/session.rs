//! Session multiplexing over an encrypted transport

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::channel::{Channel, InboundRequest, Incoming};
use crate::crypto::{Opener, Role, Sealer};
use crate::error::{SessionError, SessionResult};
use crate::frame::{
    decode_frame_header, encode_frame, ControlMessage, CONTROL_CHANNEL_ID, KIND_CONTROL,
    KIND_DATA, KIND_FIN, KIND_OPEN,
};
use crate::transport::FrameTransport;

/// Upper bound on flushing and closing the transport after a local close
const SINK_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Reply to a control request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestReply {
    pub accepted: bool,
    pub payload: Bytes,
}

/// Session statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub active_channels: usize,
    pub uptime_secs: u64,
}

/// Why the session ended
#[derive(Debug, Clone, PartialEq, Eq)]
enum Termination {
    /// Closed by this side
    Local,
    /// Peer closed the transport cleanly
    Eof,
    Error(String),
}

/// State shared between the session handles and its I/O tasks
struct Shared {
    id: String,
    frame_tx: mpsc::Sender<Vec<u8>>,
    channels: Mutex<HashMap<u32, mpsc::Sender<Bytes>>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<RequestReply>>>,
    termination: watch::Sender<Option<Termination>>,
    /// Result of closing the transport sink, set when the writer exits
    writer_done: watch::Sender<Option<Result<(), String>>>,
    cancel: CancellationToken,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl Shared {
    /// Record the first termination reason; later ones are ignored
    fn terminate(&self, reason: Termination) -> bool {
        self.termination.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        })
    }

    fn termination_error(&self) -> SessionError {
        match &*self.termination.borrow() {
            Some(Termination::Error(e)) => SessionError::ConnectionLost(e.clone()),
            _ => SessionError::Closed,
        }
    }

    async fn dispatch(
        &self,
        frame: &[u8],
        requests_tx: &mpsc::Sender<InboundRequest>,
        channels_tx: &mpsc::Sender<Channel>,
    ) -> SessionResult<()> {
        let (channel_id, kind, payload) = decode_frame_header(frame)
            .ok_or_else(|| SessionError::Protocol("short frame".to_string()))?;

        trace!(
            "[{}] Received frame: channel={}, kind={}, len={}",
            self.id,
            channel_id,
            kind,
            payload.len()
        );

        match kind {
            KIND_CONTROL => {
                if channel_id != CONTROL_CHANNEL_ID {
                    return Err(SessionError::Protocol(format!(
                        "control frame on channel {}",
                        channel_id
                    )));
                }
                match bincode::deserialize::<ControlMessage>(payload)? {
                    ControlMessage::Request {
                        id,
                        name,
                        want_reply,
                        payload,
                    } => {
                        let request = InboundRequest::new(
                            id,
                            name,
                            want_reply,
                            Bytes::from(payload),
                            self.frame_tx.clone(),
                        );
                        if let Err(mpsc::error::SendError(request)) =
                            requests_tx.send(request).await
                        {
                            debug!(
                                "[{}] No listener for request '{}', rejecting",
                                self.id,
                                request.name()
                            );
                            if let Err(e) = request.reply(false, Bytes::new()).await {
                                debug!("[{}] Failed to reject request: {}", self.id, e);
                            }
                        }
                    }
                    ControlMessage::Reply {
                        id,
                        accepted,
                        payload,
                    } => match self.pending.lock().await.remove(&id) {
                        Some(tx) => {
                            let _ = tx.send(RequestReply {
                                accepted,
                                payload: Bytes::from(payload),
                            });
                        }
                        None => warn!("[{}] Reply for unknown request {}", self.id, id),
                    },
                }
            }
            KIND_OPEN => {
                let mut channels = self.channels.lock().await;
                if channel_id == CONTROL_CHANNEL_ID || channels.contains_key(&channel_id) {
                    return Err(SessionError::Protocol(format!(
                        "duplicate channel {}",
                        channel_id
                    )));
                }
                let (tx, rx) = mpsc::channel(256);
                channels.insert(channel_id, tx);
                drop(channels);

                let channel = Channel::new(
                    channel_id,
                    Bytes::copy_from_slice(payload),
                    rx,
                    self.frame_tx.clone(),
                );
                if let Err(mpsc::error::SendError(mut channel)) = channels_tx.send(channel).await {
                    debug!(
                        "[{}] No listener for channels, rejecting channel {}",
                        self.id, channel_id
                    );
                    self.channels.lock().await.remove(&channel_id);
                    if let Err(e) = channel.finish().await {
                        debug!("[{}] Failed to reject channel: {}", self.id, e);
                    }
                }
            }
            KIND_DATA => {
                let tx = self.channels.lock().await.get(&channel_id).cloned();
                match tx {
                    Some(tx) => {
                        if tx.send(Bytes::copy_from_slice(payload)).await.is_err() {
                            warn!("[{}] Channel {} receiver dropped", self.id, channel_id);
                            self.channels.lock().await.remove(&channel_id);
                        }
                    }
                    None => trace!("[{}] Data for unknown channel {}", self.id, channel_id),
                }
            }
            KIND_FIN => {
                self.channels.lock().await.remove(&channel_id);
            }
            other => warn!("[{}] Unknown frame kind: {}", self.id, other),
        }
        Ok(())
    }
}

struct Inner {
    shared: Arc<Shared>,
    next_request_id: AtomicU64,
    next_channel_id: AtomicU32,
    created_at: Instant,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

/// Handle to an established session
///
/// Cheap to clone. The session is torn down when [`Session::close`] is
/// called, when the transport ends, or when the last handle is dropped.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.shared.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Session {
    /// Start the I/O tasks over a transport that completed the handshake
    pub(crate) fn spawn<T: FrameTransport>(
        transport: T,
        sealer: Sealer,
        opener: Opener,
        role: Role,
    ) -> (Self, Incoming) {
        let id = format!("session-{}", uuid::Uuid::new_v4());

        let (sink, source) = transport.split();
        let (frame_tx, frame_rx) = mpsc::channel::<Vec<u8>>(256);
        let (requests_tx, requests_rx) = mpsc::channel(64);
        let (channels_tx, channels_rx) = mpsc::channel(64);

        let shared = Arc::new(Shared {
            id,
            frame_tx,
            channels: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            termination: watch::channel(None).0,
            writer_done: watch::channel(None).0,
            cancel: CancellationToken::new(),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        });

        // Server uses even channel IDs, client uses odd
        let next_channel_id = match role {
            Role::Client => 1,
            Role::Server => 2,
        };

        tokio::spawn(writer_task(sink, frame_rx, sealer, shared.clone()));
        tokio::spawn(reader_task(
            source,
            opener,
            requests_tx,
            channels_tx,
            shared.clone(),
        ));

        debug!("[{}] Session established", shared.id);

        let session = Self {
            inner: Arc::new(Inner {
                shared,
                next_request_id: AtomicU64::new(1),
                next_channel_id: AtomicU32::new(next_channel_id),
                created_at: Instant::now(),
            }),
        };
        let incoming = Incoming {
            requests: requests_rx,
            channels: channels_rx,
        };
        (session, incoming)
    }

    pub fn id(&self) -> &str {
        &self.inner.shared.id
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shared.termination.borrow().is_some()
    }

    /// Send a control request and wait for the peer's reply
    pub async fn request(
        &self,
        name: &str,
        payload: impl Into<Bytes>,
    ) -> SessionResult<RequestReply> {
        let shared = &self.inner.shared;
        let id = self.inner.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        shared.pending.lock().await.insert(id, tx);

        // The reader drains pending requests after recording termination
        if self.is_closed() {
            shared.pending.lock().await.remove(&id);
            return Err(shared.termination_error());
        }

        let frame = ControlMessage::Request {
            id,
            name: name.to_string(),
            want_reply: true,
            payload: payload.into().to_vec(),
        }
        .to_frame()?;

        if shared.frame_tx.send(frame).await.is_err() {
            shared.pending.lock().await.remove(&id);
            return Err(shared.termination_error());
        }

        rx.await.map_err(|_| shared.termination_error())
    }

    /// Open a data channel; `payload` is delivered with the open frame
    pub async fn open_channel(&self, payload: impl Into<Bytes>) -> SessionResult<Channel> {
        let shared = &self.inner.shared;
        if self.is_closed() {
            return Err(shared.termination_error());
        }

        // Increment by 2 to keep odd/even separation
        let channel_id = self.inner.next_channel_id.fetch_add(2, Ordering::SeqCst);
        let payload = payload.into();

        let (tx, rx) = mpsc::channel(256);
        shared.channels.lock().await.insert(channel_id, tx);

        if shared
            .frame_tx
            .send(encode_frame(channel_id, KIND_OPEN, &payload))
            .await
            .is_err()
        {
            shared.channels.lock().await.remove(&channel_id);
            return Err(shared.termination_error());
        }

        debug!("[{}] Opened channel {}", shared.id, channel_id);
        Ok(Channel::new(channel_id, payload, rx, shared.frame_tx.clone()))
    }

    /// Wait for the session to end
    ///
    /// Returns `Ok` when the peer closed the transport cleanly or the session
    /// was closed locally, and `ConnectionLost` for any other failure.
    pub async fn wait(&self) -> SessionResult<()> {
        let mut rx = self.inner.shared.termination.subscribe();
        let termination = match rx.wait_for(Option::is_some).await {
            Ok(t) => (*t).clone(),
            Err(_) => None,
        };
        match termination {
            Some(Termination::Error(e)) => Err(SessionError::ConnectionLost(e)),
            _ => Ok(()),
        }
    }

    /// Close the session and its transport
    ///
    /// Returns the error from closing the transport, if any. Closing a
    /// session that already ended is a no-op.
    pub async fn close(&self) -> SessionResult<()> {
        let shared = &self.inner.shared;
        if !shared.terminate(Termination::Local) {
            return Ok(());
        }
        debug!("[{}] Closing session", shared.id);
        shared.cancel.cancel();

        let mut rx = shared.writer_done.subscribe();
        let result = match rx.wait_for(Option::is_some).await {
            Ok(r) => (*r).clone(),
            Err(_) => None,
        };
        match result {
            Some(Err(e)) => Err(SessionError::Transport(std::io::Error::other(e))),
            _ => Ok(()),
        }
    }

    pub fn stats(&self) -> ConnectionStats {
        let shared = &self.inner.shared;
        let channels = shared.channels.try_lock().map(|c| c.len()).unwrap_or(0);

        ConnectionStats {
            bytes_sent: shared.bytes_sent.load(Ordering::Relaxed),
            bytes_received: shared.bytes_received.load(Ordering::Relaxed),
            active_channels: channels,
            uptime_secs: self.inner.created_at.elapsed().as_secs(),
        }
    }
}

/// Writer task - seals frames and sends them on the transport
async fn writer_task<T: FrameTransport>(
    mut sink: SplitSink<T, Bytes>,
    mut rx: mpsc::Receiver<Vec<u8>>,
    mut sealer: Sealer,
    shared: Arc<Shared>,
) {
    let mut flush_queued = false;
    loop {
        let frame = tokio::select! {
            _ = shared.cancel.cancelled() => {
                flush_queued = true;
                break;
            }
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let sealed = match sealer.seal(&frame) {
            Ok(sealed) => sealed,
            Err(e) => {
                error!("[{}] Failed to seal frame: {}", shared.id, e);
                shared.terminate(Termination::Error(e.to_string()));
                shared.cancel.cancel();
                break;
            }
        };

        // A frame that was already sealed must go out, or the peer's nonce
        // counter falls out of step
        let sent = {
            let send = sink.send(Bytes::from(sealed));
            tokio::pin!(send);
            tokio::select! {
                sent = &mut send => sent,
                _ = shared.cancel.cancelled() => {
                    flush_queued = true;
                    match tokio::time::timeout(SINK_CLOSE_TIMEOUT, &mut send).await {
                        Ok(sent) => sent,
                        Err(_) => Err(std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            "send timed out while closing",
                        )),
                    }
                }
            }
        };
        if let Err(e) = sent {
            error!("[{}] Session send error: {}", shared.id, e);
            shared.terminate(Termination::Error(e.to_string()));
            shared.cancel.cancel();
            flush_queued = false;
            break;
        }
        shared
            .bytes_sent
            .fetch_add(frame.len() as u64, Ordering::Relaxed);
        if flush_queued {
            break;
        }
    }

    debug!("[{}] Session writer task ended", shared.id);
    let shutdown = async {
        // Frames queued before a local close still go out
        if flush_queued {
            while let Ok(frame) = rx.try_recv() {
                let Ok(sealed) = sealer.seal(&frame) else {
                    break;
                };
                if sink.feed(Bytes::from(sealed)).await.is_err() {
                    break;
                }
            }
        }
        sink.close().await
    };
    let result = match tokio::time::timeout(SINK_CLOSE_TIMEOUT, shutdown).await {
        Ok(result) => result.map_err(|e| e.to_string()),
        Err(_) => Err("timed out closing transport".to_string()),
    };
    shared.writer_done.send_replace(Some(result));
}

/// Reader task - opens frames and dispatches them to channels and requests
async fn reader_task<T: FrameTransport>(
    mut source: SplitStream<T>,
    mut opener: Opener,
    requests_tx: mpsc::Sender<InboundRequest>,
    channels_tx: mpsc::Sender<Channel>,
    shared: Arc<Shared>,
) {
    let reason = loop {
        let item = tokio::select! {
            _ = shared.cancel.cancelled() => break Termination::Local,
            item = source.next() => item,
        };

        let sealed = match item {
            Some(Ok(sealed)) => sealed,
            Some(Err(e)) => break Termination::Error(e.to_string()),
            None => break Termination::Eof,
        };

        let frame = match opener.open(&sealed) {
            Ok(frame) => frame,
            Err(e) => break Termination::Error(e.to_string()),
        };
        shared
            .bytes_received
            .fetch_add(frame.len() as u64, Ordering::Relaxed);

        let dispatched = tokio::select! {
            _ = shared.cancel.cancelled() => break Termination::Local,
            dispatched = shared.dispatch(&frame, &requests_tx, &channels_tx) => dispatched,
        };
        if let Err(e) = dispatched {
            break Termination::Error(e.to_string());
        }
    };

    match &reason {
        Termination::Local => debug!("[{}] Session closed locally", shared.id),
        Termination::Eof => debug!("[{}] Peer closed the session", shared.id),
        Termination::Error(e) => warn!("[{}] Session read error: {}", shared.id, e),
    }

    shared.terminate(reason);
    shared.cancel.cancel();

    // Dropping the senders ends every channel and fails every pending request
    shared.channels.lock().await.clear();
    shared.pending.lock().await.clear();

    debug!("[{}] Session reader task ended", shared.id);
}
