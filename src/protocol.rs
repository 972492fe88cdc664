//! JSON wire protocol between replicas and the room server.
//!
//! Every message on the persistent session is an envelope with exactly one
//! top-level key naming the kind; serde's externally tagged enums give that
//! shape for free, and unknown kinds fail at decode rather than downstream.
//!
//! ```text
//! server ──► {"setSiteId":{"siteId":3}}
//!        ──► {"crdtEvents":{"events":[...]}}
//!        ──► {"sitePresence":{"siteId":3,"name":"ada","visible":true}}
//!        ──► {"siteDisconnected":{"siteId":3}}
//!        ──► {"heartbit":{}}
//!        ──► {"compactionRequired":{}}
//! client ──► {"crdtEvents":{"events":[...]}}
//!        ──► {"sitePresence":{"siteId":3,"name":"ada","visible":true}}
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crdt::CrdtEvent;

/// Display names are capped to keep presence fan-out small.
pub const MAX_NAME_LEN: usize = 30;

/// A site's display state, broadcast to every session in the room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SitePresence {
    #[serde(rename = "siteId")]
    pub site_id: u32,
    pub name: String,
    pub visible: bool,
}

/// Messages the server pushes onto a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    #[serde(rename = "setSiteId")]
    SetSiteId {
        #[serde(rename = "siteId")]
        site_id: u32,
    },
    #[serde(rename = "crdtEvents")]
    CrdtEvents { events: Vec<CrdtEvent> },
    #[serde(rename = "sitePresence")]
    SitePresence(SitePresence),
    #[serde(rename = "siteDisconnected")]
    SiteDisconnected {
        #[serde(rename = "siteId")]
        site_id: u32,
    },
    #[serde(rename = "heartbit")]
    Heartbit {},
    #[serde(rename = "compactionRequired")]
    CompactionRequired {},
}

/// Messages a client may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    #[serde(rename = "crdtEvents")]
    CrdtEvents { events: Vec<CrdtEvent> },
    #[serde(rename = "sitePresence")]
    SitePresence(SitePresence),
}

impl ServerMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::Decode)
    }
}

impl ClientMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    /// Decode and validate. Name bounds are enforced here, at the codec
    /// boundary, so the hub never sees an out-of-range presence.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let message: Self = serde_json::from_str(text).map_err(ProtocolError::Decode)?;
        if let ClientMessage::SitePresence(presence) = &message {
            let chars = presence.name.chars().count();
            if chars == 0 || chars > MAX_NAME_LEN {
                return Err(ProtocolError::InvalidName { chars });
            }
        }
        Ok(message)
    }
}

/// `POST /resource/room` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomCreated {
    #[serde(rename = "roomId")]
    pub room_id: String,
}

/// Session parameters handed to clients at bootstrap.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RoomSettings {
    /// Seconds between server heartbeats; silence for twice this long
    /// means the peer is gone.
    #[serde(rename = "heartbitInterval")]
    pub heartbit_interval: u64,
    /// Max characters a client will let the document grow to.
    #[serde(rename = "documentLimit")]
    pub document_limit: usize,
}

/// `GET /resource/room/{roomId}` response: the room's event log plus the
/// session parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomSnapshot {
    pub events: Vec<CrdtEvent>,
    pub settings: RoomSettings,
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("malformed message: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("display name must be 1..={MAX_NAME_LEN} characters, got {chars}")]
    InvalidName { chars: usize },
}
