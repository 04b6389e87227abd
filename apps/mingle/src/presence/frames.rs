//! Payload shapes of the server frames the reconciler consumes. Unknown
//! fields are ignored.

use crate::presence::roster::PeerStatus;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerJoined {
    #[serde(alias = "peer_id", alias = "id")]
    pub peer_id: String,
    #[serde(default, alias = "displayName")]
    pub name: Option<String>,
    #[serde(default)]
    pub status: Option<PeerStatus>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerLeft {
    #[serde(alias = "peer_id", alias = "id")]
    pub peer_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerStatusChanged {
    #[serde(alias = "peer_id", alias = "id")]
    pub peer_id: String,
    pub status: PeerStatus,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingFrame {
    #[serde(alias = "peer_id")]
    pub peer_id: String,
    #[serde(alias = "conversation_id")]
    pub conversation_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationFrame {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, alias = "message")]
    pub body: Option<String>,
    #[serde(
        default,
        alias = "source_peer_id",
        alias = "fromPeerId",
        alias = "peerId"
    )]
    pub source_peer_id: Option<String>,
    #[serde(default, alias = "ttl_seconds")]
    pub ttl_seconds: Option<u64>,
}
