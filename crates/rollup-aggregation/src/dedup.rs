//! Bounded recently-seen event-id set
//!
//! Kept inside each window's persisted state so redelivered events are
//! skipped even after a crash. When full, the oldest id is forgotten first.

use std::collections::{HashSet, VecDeque};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "VecDeque<String>", into = "VecDeque<String>")]
pub struct SeenEvents {
    /// Insertion order, oldest first
    order: VecDeque<String>,
    index: HashSet<String>,
}

impl SeenEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, event_id: &str) -> bool {
        self.index.contains(event_id)
    }

    /// Remember `event_id`. Returns false if it was already present.
    pub fn insert(&mut self, event_id: &str, capacity: usize) -> bool {
        if self.index.contains(event_id) {
            return false;
        }

        self.order.push_back(event_id.to_string());
        self.index.insert(event_id.to_string());

        while self.order.len() > capacity.max(1) {
            if let Some(oldest) = self.order.pop_front() {
                self.index.remove(&oldest);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl From<VecDeque<String>> for SeenEvents {
    fn from(order: VecDeque<String>) -> Self {
        let index = order.iter().cloned().collect();
        Self { order, index }
    }
}

impl From<SeenEvents> for VecDeque<String> {
    fn from(seen: SeenEvents) -> Self {
        seen.order
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detects_duplicates() {
        let mut seen = SeenEvents::new();
        assert!(seen.insert("e1", 10));
        assert!(seen.insert("e2", 10));
        assert!(!seen.insert("e1", 10));
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn test_forgets_oldest_beyond_capacity() {
        let mut seen = SeenEvents::new();
        for id in ["e1", "e2", "e3"] {
            seen.insert(id, 2);
        }
        assert!(!seen.contains("e1"));
        assert!(seen.contains("e2"));
        assert!(seen.contains("e3"));
    }

    #[test]
    fn test_survives_serialization() {
        let mut seen = SeenEvents::new();
        seen.insert("e1", 10);
        seen.insert("e2", 10);

        let bytes = rollup_storage::encode(&seen).unwrap();
        let restored: SeenEvents = rollup_storage::decode(&bytes).unwrap();
        assert_eq!(restored, seen);
        assert!(restored.contains("e2"));
    }
}
