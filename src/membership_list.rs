use std::fmt;

use rand::seq::SliceRandom;
use rand::thread_rng;

use crate::error::{Result, SwimError};
use crate::id::MemberId;
use crate::wire::{Member, MemberState};

/// Local view of the cluster.
///
/// Members live in a dense vector (swap-delete, so order is not stable).
/// `order` is a permutation of `0..members.len()` walked by [`pick_next`]
/// and reshuffled at the end of every round.
///
/// Lookups are a linear scan; a `HashMap<MemberId, usize>` index can be added
/// behind `select` without changing the other operations.
///
/// [`pick_next`]: MembershipList::pick_next
#[derive(Debug)]
pub struct MembershipList {
    members: Vec<Member>,
    order: Vec<usize>,
    cursor: usize,
}

impl MembershipList {
    pub fn with_capacity(capacity: usize) -> MembershipList {
        return MembershipList {
            members: Vec::with_capacity(capacity),
            order: Vec::with_capacity(capacity),
            cursor: 0,
        };
    }

    pub fn size(&self) -> usize {
        self.members.len()
    }

    pub fn capacity(&self) -> usize {
        self.members.capacity()
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    /// Appends `member` unless its identity is already tracked.
    /// Returns whether the list changed.
    pub fn insert(&mut self, member: Member) -> bool {
        if self.select(&member.id).is_some() {
            log::debug!("Member {} already in membership list", member.id);
            return false;
        }
        self.members.push(member);
        self.order.push(self.order.len());
        log::info!("Insert member {} (size {})", member.id, self.members.len());
        true
    }

    pub fn delete(&mut self, id: &MemberId) -> Result<Member> {
        let index = self.select(id).ok_or_else(|| not_found(id))?;
        let removed = self.members.swap_remove(index);

        // Drop the slot that points past the new end so `order` stays a
        // permutation of 0..size.
        let new_size = self.members.len();
        if let Some(position) = self.order.iter().position(|&slot| slot == new_size) {
            self.order.swap_remove(position);
        }
        log::info!("Delete member {} (size {})", id, new_size);
        Ok(removed)
    }

    pub fn update(&mut self, id: &MemberId, state: MemberState) -> Result<()> {
        let index = self.select(id).ok_or_else(|| not_found(id))?;
        self.members[index].state = state;
        log::info!("Update member {} to state {:?}", id, state);
        Ok(())
    }

    pub fn select(&self, id: &MemberId) -> Option<usize> {
        self.members.iter().position(|member| member.id == *id)
    }

    pub fn retrieve(&self, id: &MemberId) -> Result<Member> {
        self.select(id)
            .map(|index| self.members[index])
            .ok_or_else(|| not_found(id))
    }

    pub fn retrieve_by_index(&self, index: usize) -> Result<Member> {
        self.members
            .get(index)
            .copied()
            .ok_or(SwimError::OutOfRange { index, size: self.members.len() })
    }

    /// Next probe target: round-robin over a shuffled permutation, so every
    /// live member is returned exactly once per round.
    pub fn pick_next(&mut self) -> Option<Member> {
        if self.order.is_empty() {
            return None;
        }
        if self.cursor >= self.order.len() {
            // deletes shortened the round; start a fresh one
            self.cursor = 0;
            self.order.shuffle(&mut thread_rng());
        }
        let picked = self.members[self.order[self.cursor]];
        self.cursor += 1;
        if self.cursor == self.order.len() {
            self.cursor = 0;
            self.order.shuffle(&mut thread_rng());
        }
        log::debug!("Member {} selected by shuffling", picked.id);
        Some(picked)
    }
}

impl fmt::Display for MembershipList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Size: {}, Capacity: {}", self.size(), self.capacity())?;
        for (index, member) in self.members.iter().enumerate() {
            writeln!(f, "idx: {}, id: {}, state: {:#06b}", index, member.id, member.state.bits())?;
        }
        Ok(())
    }
}

fn not_found(id: &MemberId) -> SwimError {
    SwimError::NotFound { timestamp: id.timestamp, ip: id.ip }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn member(n: u64) -> Member {
        Member::new(MemberId::new(n, n as u32), MemberState::ALIVE)
    }

    fn list_of(n: u64) -> MembershipList {
        let mut membership_list = MembershipList::with_capacity(1);
        for i in 1..=n {
            membership_list.insert(member(i));
        }
        membership_list
    }

    fn one_round(membership_list: &mut MembershipList) -> Vec<MemberId> {
        (0..membership_list.size())
            .map(|_| membership_list.pick_next().unwrap().id)
            .collect()
    }

    fn live_ids(membership_list: &MembershipList) -> HashSet<MemberId> {
        membership_list.members().iter().map(|m| m.id).collect()
    }

    fn assert_permutation(membership_list: &MembershipList) {
        let mut order = membership_list.order.clone();
        order.sort_unstable();
        assert_eq!((0..membership_list.size()).collect::<Vec<_>>(), order);
    }

    #[test]
    fn insert_grows_past_initial_capacity() {
        let membership_list = list_of(10);
        assert_eq!(10, membership_list.size());
        assert!(membership_list.capacity() >= 10);
        assert_permutation(&membership_list);
    }

    #[test]
    fn insert_rejects_duplicate_identity() {
        let mut membership_list = list_of(3);
        let mut duplicate = member(2);
        duplicate.state = MemberState::SUSPECT;
        assert!(!membership_list.insert(duplicate));
        assert_eq!(3, membership_list.size());
        assert_eq!(MemberState::ALIVE, membership_list.retrieve(&duplicate.id).unwrap().state);
    }

    #[test]
    fn delete_removes_exactly_one_member() {
        let mut membership_list = list_of(5);
        let removed = membership_list.delete(&member(2).id).unwrap();
        assert_eq!(member(2), removed);
        assert_eq!(4, membership_list.size());
        assert!(membership_list.retrieve(&member(2).id).is_err());
        for i in [1, 3, 4, 5] {
            assert_eq!(member(i), membership_list.retrieve(&member(i).id).unwrap());
        }
        assert_permutation(&membership_list);
    }

    #[test]
    fn delete_missing_member_is_not_found() {
        let mut membership_list = list_of(2);
        let result = membership_list.delete(&MemberId::new(99, 99));
        assert!(matches!(result, Err(SwimError::NotFound { timestamp: 99, ip: 99 })));
        assert_eq!(2, membership_list.size());
    }

    #[test]
    fn update_overwrites_state_in_place() {
        let mut membership_list = list_of(3);
        let id = member(3).id;
        membership_list.update(&id, MemberState::SUSPECT).unwrap();
        assert_eq!(MemberState::SUSPECT, membership_list.retrieve(&id).unwrap().state);
        assert!(membership_list.update(&MemberId::new(7, 7), MemberState::ALIVE).is_err());
    }

    #[test]
    fn retrieve_by_index_checks_range() {
        let membership_list = list_of(2);
        assert!(membership_list.retrieve_by_index(1).is_ok());
        assert!(matches!(
            membership_list.retrieve_by_index(2),
            Err(SwimError::OutOfRange { index: 2, size: 2 })
        ));
    }

    #[test]
    fn pick_next_on_empty_list_is_none() {
        let mut membership_list = MembershipList::with_capacity(4);
        assert_eq!(None, membership_list.pick_next());
    }

    #[test]
    fn pick_next_visits_every_member_once_per_round() {
        let mut membership_list = list_of(7);
        for _ in 0..5 {
            let round = one_round(&mut membership_list);
            let visited: HashSet<_> = round.iter().copied().collect();
            assert_eq!(round.len(), visited.len());
            assert_eq!(live_ids(&membership_list), visited);
        }
    }

    #[test]
    fn pick_next_stays_fair_across_resizes() {
        let mut membership_list = list_of(4);
        membership_list.pick_next();
        membership_list.insert(member(5));
        membership_list.delete(&member(1).id).unwrap();
        membership_list.pick_next();
        membership_list.insert(member(6));
        assert_permutation(&membership_list);

        // finish the disturbed round, then full rounds must be exact again
        while membership_list.cursor != 0 {
            membership_list.pick_next();
        }
        for _ in 0..3 {
            let visited: HashSet<_> = one_round(&mut membership_list).into_iter().collect();
            assert_eq!(live_ids(&membership_list), visited);
        }
    }

    #[test]
    fn pick_next_starts_fresh_round_when_deletes_overtake_cursor() {
        let mut membership_list = list_of(4);
        for _ in 0..3 {
            membership_list.pick_next();
        }
        membership_list.delete(&member(1).id).unwrap();
        membership_list.delete(&member(2).id).unwrap();
        assert!(membership_list.cursor >= membership_list.size());

        let visited: HashSet<_> = one_round(&mut membership_list).into_iter().collect();
        assert_eq!(live_ids(&membership_list), visited);
        assert_eq!(0, membership_list.cursor);
        assert_permutation(&membership_list);
    }

    #[test]
    fn identity_stays_unique_under_churn() {
        let mut membership_list = MembershipList::with_capacity(2);
        for round in 0..4u64 {
            for i in 0..6 {
                membership_list.insert(member(i));
            }
            membership_list.delete(&member(round).id).unwrap();
            let ids = live_ids(&membership_list);
            assert_eq!(membership_list.size(), ids.len());
            assert_permutation(&membership_list);
        }
    }

    #[test]
    fn display_lists_every_member() {
        let printed = list_of(2).to_string();
        assert!(printed.starts_with("Size: 2"));
        assert_eq!(3, printed.lines().count());
    }
}
