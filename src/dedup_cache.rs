use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

/// Recently seen update ids. An id is forgotten `window` after it was first
/// marked, however often it is seen in between.
#[derive(Debug)]
pub struct DedupCache {
    window: Duration,
    seen: HashMap<u64, Instant>,
}

impl DedupCache {
    pub fn new(window: Duration) -> DedupCache {
        DedupCache { window, seen: HashMap::new() }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Returns `true` when `update_id` was already seen inside the window.
    /// Otherwise marks it and returns `false`.
    pub fn check_and_mark(&mut self, update_id: u64) -> bool {
        let now = Instant::now();
        self.evict_expired(now);
        if self.seen.contains_key(&update_id) {
            log::debug!("Duplicate update {:#x} dropped", update_id);
            return true;
        }
        self.seen.insert(update_id, now + self.window);
        false
    }

    fn evict_expired(&mut self, now: Instant) {
        self.seen.retain(|_, expires_at| *expires_at > now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn first_sight_is_not_a_duplicate() {
        let mut cache = DedupCache::new(Duration::from_secs(16));
        assert!(!cache.check_and_mark(7));
        assert!(cache.check_and_mark(7));
        assert!(!cache.check_and_mark(8));
        assert_eq!(2, cache.len());
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_sightings_do_not_extend_window() {
        let mut cache = DedupCache::new(Duration::from_secs(16));
        assert!(!cache.check_and_mark(7));
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(cache.check_and_mark(7));
        tokio::time::advance(Duration::from_secs(7)).await;
        assert!(!cache.check_and_mark(7));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_ids_are_evicted() {
        let mut cache = DedupCache::new(Duration::from_secs(16));
        cache.check_and_mark(1);
        cache.check_and_mark(2);
        tokio::time::advance(Duration::from_secs(16)).await;
        assert!(!cache.check_and_mark(3));
        assert_eq!(1, cache.len());
    }
}
