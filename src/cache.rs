//! Response cache
//!
//! Bounded, time-bucketed cache of register responses keyed by register
//! id. Entries expire after a TTL; on overflow the oldest entries by
//! insertion order are evicted. Each connection owns one cache and drops
//! it on close.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tracing::trace;

use crate::frame::Datagram;

/// One cached response
#[derive(Debug, Clone)]
struct CacheEntry {
    value: Datagram,
    inserted_at: Instant,
}

/// TTL + insertion-order bounded response cache
#[derive(Debug)]
pub struct ResponseCache {
    entries: HashMap<u32, CacheEntry>,
    /// Insertion order of live keys, oldest first
    order: VecDeque<u32>,
    ttl: Duration,
    max_size: usize,
}

impl ResponseCache {
    /// Create a cache. A `max_size` of zero disables caching entirely.
    pub fn new(ttl: Duration, max_size: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            ttl,
            max_size,
        }
    }

    /// Fetch a fresh entry, removing it if it has expired.
    pub fn get(&mut self, id: u32) -> Option<Datagram> {
        let entry = self.entries.get(&id)?;
        if entry.inserted_at.elapsed() > self.ttl {
            trace!("cache expired: id=0x{:08X}", id);
            self.remove(id);
            return None;
        }
        Some(self.entries[&id].value.clone())
    }

    /// Insert or overwrite an entry. Overwriting counts as a fresh
    /// insertion for eviction ordering.
    pub fn put(&mut self, id: u32, value: Datagram) {
        if self.max_size == 0 {
            return;
        }
        if self.entries.contains_key(&id) {
            self.remove(id);
        }
        if self.entries.len() >= self.max_size {
            self.cleanup();
            while self.entries.len() >= self.max_size {
                let Some(oldest) = self.order.front().copied() else {
                    break;
                };
                trace!("cache evict: id=0x{:08X}", oldest);
                self.remove(oldest);
            }
        }
        self.entries.insert(
            id,
            CacheEntry {
                value,
                inserted_at: Instant::now(),
            },
        );
        self.order.push_back(id);
    }

    /// Sweep expired entries; safe to call opportunistically.
    pub fn cleanup(&mut self) {
        let expired: Vec<u32> = self
            .entries
            .iter()
            .filter(|(_, e)| e.inserted_at.elapsed() > self.ttl)
            .map(|(&id, _)| id)
            .collect();
        for id in expired {
            self.remove(id);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn remove(&mut self, id: u32) {
        self.entries.remove(&id);
        if let Some(pos) = self.order.iter().position(|&k| k == id) {
            self.order.remove(pos);
        }
    }
}
