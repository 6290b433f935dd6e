//! Multiplexing frames
//!
//! Every decrypted transport message is one frame:
//! - 4 bytes: channel ID (big-endian u32)
//! - 1 byte: frame kind (0=data, 1=fin, 2=open, 3=control)
//! - Rest: payload
//!
//! Channel 0 is reserved for control messages. Client-opened channels use
//! odd IDs, server-opened channels use even IDs.

use serde::{Deserialize, Serialize};

/// Reserved channel ID for control messages
pub const CONTROL_CHANNEL_ID: u32 = 0;

pub(crate) const KIND_DATA: u8 = 0;
pub(crate) const KIND_FIN: u8 = 1;
pub(crate) const KIND_OPEN: u8 = 2;
pub(crate) const KIND_CONTROL: u8 = 3;

pub(crate) const HEADER_LEN: usize = 5;

/// Largest data payload carried by one frame
pub const MAX_DATA_CHUNK: usize = 32 * 1024;

/// Encode a multiplexed frame
pub(crate) fn encode_frame(channel_id: u32, kind: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&channel_id.to_be_bytes());
    frame.push(kind);
    frame.extend_from_slice(payload);
    frame
}

/// Decode a multiplexed frame header
pub(crate) fn decode_frame_header(data: &[u8]) -> Option<(u32, u8, &[u8])> {
    if data.len() < HEADER_LEN {
        return None;
    }
    let channel_id = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    Some((channel_id, data[4], &data[HEADER_LEN..]))
}

/// Messages carried on the control channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum ControlMessage {
    Request {
        id: u64,
        name: String,
        want_reply: bool,
        payload: Vec<u8>,
    },
    Reply {
        id: u64,
        accepted: bool,
        payload: Vec<u8>,
    },
}

impl ControlMessage {
    pub(crate) fn to_frame(&self) -> Result<Vec<u8>, bincode::Error> {
        Ok(encode_frame(
            CONTROL_CHANNEL_ID,
            KIND_CONTROL,
            &bincode::serialize(self)?,
        ))
    }
}
