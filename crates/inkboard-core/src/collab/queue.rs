//! Bounded buffers used while the channel is down or to drop redundant deliveries.

use std::collections::{HashSet, VecDeque};

/// FIFO of outbound frames; the oldest frame is dropped when full.
#[derive(Debug, Clone)]
pub struct OfflineQueue {
    capacity: usize,
    items: VecDeque<String>,
    dropped: usize,
}

impl OfflineQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            items: VecDeque::new(),
            dropped: 0,
        }
    }

    pub fn push(&mut self, frame: String) {
        if self.items.len() >= self.capacity {
            self.items.pop_front();
            self.dropped += 1;
            log::debug!("Offline queue full, dropped oldest frame");
        }
        self.items.push_back(frame);
    }

    /// Take everything, oldest first.
    pub fn drain(&mut self) -> Vec<String> {
        self.items.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Frames lost to overflow since creation.
    pub fn dropped(&self) -> usize {
        self.dropped
    }
}

/// Remembers the last `capacity` ids seen.
#[derive(Debug, Clone)]
pub struct RecentIds {
    capacity: usize,
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl RecentIds {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    /// Record `id`. Returns `false` if it was already remembered.
    pub fn insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(id.to_string());
        self.seen.insert(id.to_string());
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.seen.clear();
    }
}
