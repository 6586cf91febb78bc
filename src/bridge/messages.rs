// src/bridge/messages.rs
//! Datagram wire frames exchanged with visual interface processes
//!
//! The transport is connectionless UDP with JSON payloads. Loss and
//! reordering are tolerated; malformed datagrams are dropped on decode.

use crate::types::TaskCategory;
use serde::{Deserialize, Serialize};

/// Upper bound for a single datagram payload
pub const MAX_DATAGRAM_LEN: usize = 8192;

/// One datagram payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frame {
    /// Connection probe sent by the bridge
    Handshake { token: u32 },
    /// Probe response sent by the interface process
    HandshakeAck { token: u32 },
    /// Control output dispatched by the online loop
    Output { task: TaskCategory, values: Vec<f32> },
    /// Ground-truth label emitted by the interface process
    GroundTruth { task: TaskCategory, values: Vec<f32>, timestamp_us: u64 },
    /// Orderly teardown notice, sent in both directions
    Shutdown,
}

impl Frame {
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode a received datagram; `None` for garbage or foreign payloads
    pub fn decode(bytes: &[u8]) -> Option<Frame> {
        serde_json::from_slice(bytes).ok()
    }
}
