//! Data channels and inbound control requests

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::{SessionError, SessionResult};
use crate::frame::{encode_frame, ControlMessage, KIND_DATA, KIND_FIN, MAX_DATA_CHUNK};

/// Unsolicited traffic from the peer
///
/// Dropping either receiver makes the session refuse what would have been
/// delivered on it: requests wanting a reply are rejected and channels are
/// finished immediately.
#[derive(Debug)]
pub struct Incoming {
    pub requests: mpsc::Receiver<InboundRequest>,
    pub channels: mpsc::Receiver<Channel>,
}

/// A control request sent by the peer
#[derive(Debug)]
pub struct InboundRequest {
    id: u64,
    name: String,
    want_reply: bool,
    payload: Bytes,
    frame_tx: mpsc::Sender<Vec<u8>>,
    replied: bool,
}

impl InboundRequest {
    pub(crate) fn new(
        id: u64,
        name: String,
        want_reply: bool,
        payload: Bytes,
        frame_tx: mpsc::Sender<Vec<u8>>,
    ) -> Self {
        Self {
            id,
            name,
            want_reply,
            payload,
            frame_tx,
            replied: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn want_reply(&self) -> bool {
        self.want_reply
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Answer the request. A no-op when the peer did not ask for a reply.
    pub async fn reply(mut self, accepted: bool, payload: impl Into<Bytes>) -> SessionResult<()> {
        self.replied = true;
        if !self.want_reply {
            return Ok(());
        }
        let frame = ControlMessage::Reply {
            id: self.id,
            accepted,
            payload: payload.into().to_vec(),
        }
        .to_frame()?;
        self.frame_tx
            .send(frame)
            .await
            .map_err(|_| SessionError::Closed)
    }
}

impl Drop for InboundRequest {
    fn drop(&mut self) {
        if self.replied || !self.want_reply {
            return;
        }
        let reject = ControlMessage::Reply {
            id: self.id,
            accepted: false,
            payload: Vec::new(),
        };
        if let Ok(frame) = reject.to_frame() {
            let _ = self.frame_tx.try_send(frame);
        }
    }
}

/// A bidirectional data channel within a session
#[derive(Debug)]
pub struct Channel {
    id: u32,
    open_payload: Bytes,
    rx: mpsc::Receiver<Bytes>,
    tx: mpsc::Sender<Vec<u8>>,
    finished: bool,
}

impl Channel {
    pub(crate) fn new(
        id: u32,
        open_payload: Bytes,
        rx: mpsc::Receiver<Bytes>,
        tx: mpsc::Sender<Vec<u8>>,
    ) -> Self {
        Self {
            id,
            open_payload,
            rx,
            tx,
            finished: false,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Payload the opener attached, typically the target address
    pub fn open_payload(&self) -> &Bytes {
        &self.open_payload
    }

    pub async fn send(&mut self, data: &[u8]) -> SessionResult<()> {
        if self.finished {
            return Err(SessionError::Closed);
        }
        for chunk in data.chunks(MAX_DATA_CHUNK) {
            self.tx
                .send(encode_frame(self.id, KIND_DATA, chunk))
                .await
                .map_err(|_| SessionError::Closed)?;
        }
        trace!("Sent {} bytes on channel {}", data.len(), self.id);
        Ok(())
    }

    /// Next chunk from the peer, `None` once the peer finished or the
    /// session ended
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Signal that no more data will be sent
    pub async fn finish(&mut self) -> SessionResult<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.tx
            .send(encode_frame(self.id, KIND_FIN, &[]))
            .await
            .map_err(|_| SessionError::Closed)
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.tx.try_send(encode_frame(self.id, KIND_FIN, &[]));
        }
    }
}
