use serde::Serialize;

/// One peer typing in one conversation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingKey {
    pub peer_id: String,
    pub conversation_id: String,
}

impl TypingKey {
    pub fn new(peer_id: impl Into<String>, conversation_id: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            conversation_id: conversation_id.into(),
        }
    }
}
