use crate::protocol;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Match,
    Introduction,
    Meetup,
    Proximity,
    Activity,
}

impl Category {
    pub fn from_frame(name: &str) -> Option<Self> {
        match name {
            protocol::MATCH_FOUND => Some(Category::Match),
            protocol::INTRODUCTION_RECEIVED => Some(Category::Introduction),
            protocol::MEETUP_SCHEDULED => Some(Category::Meetup),
            protocol::PROXIMITY_ALERT => Some(Category::Proximity),
            protocol::ACTIVITY_PING => Some(Category::Activity),
            _ => None,
        }
    }

    pub fn default_title(self) -> &'static str {
        match self {
            Category::Match => "New match",
            Category::Introduction => "New introduction",
            Category::Meetup => "Meetup scheduled",
            Category::Proximity => "Someone is nearby",
            Category::Activity => "New activity",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    pub category: Category,
    pub title: String,
    pub body: String,
    pub source_peer_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub read: bool,
    pub ttl: Option<Duration>,
}

/// Bounded queue, oldest first. Pushing past capacity evicts the oldest.
#[derive(Debug, Clone)]
pub struct NotificationQueue {
    entries: VecDeque<Notification>,
    capacity: usize,
}

impl NotificationQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Appends `entry` and returns the entries evicted to make room.
    pub fn push(&mut self, entry: Notification) -> Vec<Notification> {
        self.entries.push_back(entry);
        let mut evicted = Vec::new();
        while self.entries.len() > self.capacity {
            if let Some(oldest) = self.entries.pop_front() {
                evicted.push(oldest);
            }
        }
        evicted
    }

    pub fn remove(&mut self, id: &str) -> Option<Notification> {
        let index = self.entries.iter().position(|entry| entry.id == id)?;
        self.entries.remove(index)
    }

    pub fn mark_read(&mut self, id: &str) -> bool {
        match self.entries.iter_mut().find(|entry| entry.id == id) {
            Some(entry) if !entry.read => {
                entry.read = true;
                true
            }
            _ => false,
        }
    }

    /// Returns how many entries changed.
    pub fn mark_all_read(&mut self) -> usize {
        let mut changed = 0;
        for entry in self.entries.iter_mut().filter(|entry| !entry.read) {
            entry.read = true;
            changed += 1;
        }
        changed
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.iter().any(|entry| entry.id == id)
    }

    pub fn unread_count(&self) -> usize {
        self.entries.iter().filter(|entry| !entry.read).count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Notification> {
        self.entries.iter()
    }
}
