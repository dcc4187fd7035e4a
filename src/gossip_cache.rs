use crate::error::{Result, SwimError};
use crate::wire::Update;

/// Pending updates waiting to be piggybacked on pings and acks.
///
/// Delivery is round-robin; each `get` spends one unit of the returned
/// update's ttl and the update leaves the queue when it reaches zero.
#[derive(Debug, Default)]
pub struct GossipCache {
    pending: Vec<Update>,
    pointer: usize,
}

impl GossipCache {
    pub fn new() -> GossipCache {
        GossipCache::default()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn pending(&self) -> &[Update] {
        &self.pending
    }

    /// Queues `update` for dissemination. An update with no ttl left is dropped.
    pub fn set(&mut self, update: Update) {
        if update.ttl == 0 {
            log::debug!("Gossip cache ignores update {:#x} with ttl=0", update.update_id);
            return;
        }
        log::debug!("Gossip cache queued {:?} update {:#x} for {}", update.kind, update.update_id, update.member.id);
        self.pending.push(update);
    }

    /// Returns the update under the pointer with its ttl already decremented.
    pub fn get(&mut self) -> Result<Update> {
        if self.pending.is_empty() {
            return Err(SwimError::Empty);
        }
        if self.pointer >= self.pending.len() {
            self.pointer = 0;
        }
        let current = &mut self.pending[self.pointer];
        current.ttl -= 1;
        let emitted = *current;

        if emitted.ttl == 0 {
            log::debug!("Gossip cache expired update {:#x}", emitted.update_id);
            self.pending.remove(self.pointer);
        }
        // advance modulo the possibly shortened queue
        self.pointer = match self.pending.len() {
            0 => 0,
            len => (self.pointer + 1) % len,
        };
        Ok(emitted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::MemberId;
    use crate::wire::{Member, MemberState, UpdateKind};

    fn update(ts: u64, ttl: u8) -> Update {
        let member = Member::new(MemberId::new(ts, 1), MemberState::ALIVE);
        Update::new(UpdateKind::Join, member, ttl)
    }

    #[test]
    fn get_on_empty_cache_fails() {
        let mut cache = GossipCache::new();
        assert!(matches!(cache.get(), Err(SwimError::Empty)));
    }

    #[test]
    fn set_rejects_zero_ttl() {
        let mut cache = GossipCache::new();
        cache.set(update(1, 0));
        assert!(cache.is_empty());
    }

    #[test]
    fn update_is_returned_at_most_ttl_times() {
        let mut cache = GossipCache::new();
        let original = update(1, 3);
        cache.set(original);

        let ttls: Vec<u8> = (0..3).map(|_| cache.get().unwrap().ttl).collect();
        assert_eq!(vec![2, 1, 0], ttls);
        assert!(matches!(cache.get(), Err(SwimError::Empty)));
    }

    #[test]
    fn delivery_is_round_robin() {
        let mut cache = GossipCache::new();
        let a = update(1, 2);
        let b = update(2, 2);
        let c = update(3, 1);
        cache.set(a);
        cache.set(b);
        cache.set(c);

        let order: Vec<u64> = (0..5).map(|_| cache.get().unwrap().update_id).collect();
        // c expires at pointer 2, so the pointer moves to (2 + 1) % 2 = 1
        assert_eq!(
            vec![a.update_id, b.update_id, c.update_id, b.update_id, a.update_id],
            order
        );
        assert!(cache.is_empty());
    }

    #[test]
    fn eviction_advances_past_shortened_slot() {
        let mut cache = GossipCache::new();
        let a = update(1, 1);
        let b = update(2, 5);
        let c = update(3, 5);
        cache.set(a);
        cache.set(b);
        cache.set(c);

        assert_eq!(a.update_id, cache.get().unwrap().update_id);
        assert_eq!(c.update_id, cache.get().unwrap().update_id);
        assert_eq!(b.update_id, cache.get().unwrap().update_id);
        assert_eq!(2, cache.len());
    }

    #[test]
    fn set_after_drain_starts_over() {
        let mut cache = GossipCache::new();
        cache.set(update(1, 1));
        cache.get().unwrap();
        let next = update(2, 1);
        cache.set(next);
        assert_eq!(next.update_id, cache.get().unwrap().update_id);
    }
}
