use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    #[default]
    Online,
    Away,
    Busy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerPresence {
    pub peer_id: String,
    pub name: String,
    pub status: PeerStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
}

/// Peers currently present, keyed by id. Each peer appears at most once.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Roster {
    peers: BTreeMap<String, PeerPresence>,
}

impl Roster {
    /// Inserts or replaces the peer. A missing name keeps the known one.
    pub fn join(&mut self, peer_id: &str, name: Option<String>, status: PeerStatus) {
        let now = OffsetDateTime::now_utc();
        let name = name
            .or_else(|| self.peers.get(peer_id).map(|peer| peer.name.clone()))
            .unwrap_or_else(|| peer_id.to_string());
        self.peers.insert(
            peer_id.to_string(),
            PeerPresence {
                peer_id: peer_id.to_string(),
                name,
                status,
                last_seen: now,
            },
        );
    }

    pub fn leave(&mut self, peer_id: &str) -> Option<PeerPresence> {
        self.peers.remove(peer_id)
    }

    /// Updates a present peer. Returns false, changing nothing, for an
    /// absent one.
    pub fn set_status(&mut self, peer_id: &str, status: PeerStatus) -> bool {
        match self.peers.get_mut(peer_id) {
            Some(peer) => {
                peer.status = status;
                peer.last_seen = OffsetDateTime::now_utc();
                true
            }
            None => false,
        }
    }

    pub fn get(&self, peer_id: &str) -> Option<&PeerPresence> {
        self.peers.get(peer_id)
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.peers.contains_key(peer_id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerPresence> {
        self.peers.values()
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejoin_keeps_single_entry_and_name() {
        let mut roster = Roster::default();
        roster.join("p1", Some("Ada".into()), PeerStatus::Online);
        roster.join("p1", None, PeerStatus::Away);
        assert_eq!(roster.len(), 1);
        let peer = roster.get("p1").unwrap();
        assert_eq!(peer.name, "Ada");
        assert_eq!(peer.status, PeerStatus::Away);
    }

    #[test]
    fn status_change_for_absent_peer_is_ignored() {
        let mut roster = Roster::default();
        roster.join("p1", None, PeerStatus::Online);
        roster.leave("p1");
        assert!(!roster.set_status("p1", PeerStatus::Busy));
        assert!(!roster.contains("p1"));
    }
}
