use ahash::{HashMap, HashMapExt};
use std::collections::VecDeque;

use crate::msg::MsgId;

/// Recently gossiped message ids.
///
/// Eviction is batched: the log grows to twice its capacity and is then
/// cut back to the most recent `capacity` ids in one go.
#[derive(Debug)]
pub struct DedupLog {
    capacity: usize,
    entries: VecDeque<MsgId>,
    /// Occurrences of each id currently in `entries`.
    counts: HashMap<MsgId, usize>,
}

impl DedupLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: VecDeque::with_capacity(2 * capacity + 1),
            counts: HashMap::new(),
        }
    }

    pub fn insert(&mut self, id: MsgId) {
        *self.counts.entry(id.clone()).or_insert(0) += 1;
        self.entries.push_back(id);
        if self.entries.len() > 2 * self.capacity {
            self.trim();
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.counts.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MsgId> {
        self.entries.iter()
    }

    fn trim(&mut self) {
        while self.entries.len() > self.capacity {
            let Some(old) = self.entries.pop_front() else {
                break;
            };
            if let Some(count) = self.counts.get_mut(&old) {
                *count -= 1;
                if *count == 0 {
                    self.counts.remove(&old);
                }
            }
        }
    }
}
