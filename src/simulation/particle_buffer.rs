use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::BufferExhausted;

#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum LifeState {
    Active,
    // proposed for a split in the running pass, reverted to `Active` on commit or failure
    PendingSplit,
    // retired by a merge; the slot returns to the free list at the end of the pass
    Merged,
    // allocated at construction but never used yet
    BufferReserved,
}

impl LifeState {
    /** Only these particles take part in neighbor searches and physics evaluation */
    pub fn is_live(self) -> bool {
        matches!(self, LifeState::Active | LifeState::PendingSplit)
    }
}

struct FreeList {
    // stored in descending order for never-used reserve slots, so `pop` hands out the lowest index first
    slots: Vec<usize>,
    claimed: usize,
}

/**
 * Pool of particle slots that new split children are materialized into.
 *
 * The reserve is appended once at construction and never grows afterwards. Slots of
 * merged particles are handed back with `release_slot` and recycled by later splits.
 * The free list is the only shared mutable state, so claim and release are the only
 * operations that take the lock.
 */
pub struct BufferPool {
    capacity: usize,
    free: Mutex<FreeList>,
}

impl BufferPool {
    /// Registers the slots `first_slot..first_slot + n` as the reserve.
    pub fn allocate_reserve(first_slot: usize, n: usize) -> Self {
        BufferPool {
            capacity: n,
            free: Mutex::new(FreeList {
                slots: (first_slot..first_slot + n).rev().collect(),
                claimed: 0,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of slots a split can still claim.
    pub fn available(&self) -> usize {
        self.free.lock().slots.len()
    }

    pub fn claimed_total(&self) -> usize {
        self.free.lock().claimed
    }

    pub fn claim_slot(&self) -> Result<usize, BufferExhausted> {
        let mut free = self.free.lock();
        match free.slots.pop() {
            Some(slot) => {
                free.claimed += 1;
                Ok(slot)
            }
            None => Err(BufferExhausted {
                capacity: self.capacity,
            }),
        }
    }

    pub fn release_slot(&self, slot: usize) {
        let mut free = self.free.lock();
        debug_assert!(!free.slots.contains(&slot), "slot {} released twice", slot);
        free.slots.push(slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrency::par_iter_mut0;
    use std::collections::HashSet;

    #[test]
    fn claims_never_exceed_capacity() {
        let pool = BufferPool::allocate_reserve(10, 3);
        assert_eq!(pool.claim_slot(), Ok(10));
        assert_eq!(pool.claim_slot(), Ok(11));
        assert_eq!(pool.claim_slot(), Ok(12));
        assert_eq!(pool.claim_slot(), Err(BufferExhausted { capacity: 3 }));
        assert_eq!(pool.claim_slot(), Err(BufferExhausted { capacity: 3 }));
        assert_eq!(pool.claimed_total(), 3);
    }

    #[test]
    fn empty_reserve_is_exhausted_immediately() {
        let pool = BufferPool::allocate_reserve(4, 0);
        assert_eq!(pool.available(), 0);
        assert!(pool.claim_slot().is_err());
    }

    #[test]
    fn released_slots_are_recycled() {
        let pool = BufferPool::allocate_reserve(2, 1);
        assert_eq!(pool.claim_slot(), Ok(2));
        pool.release_slot(0);
        assert_eq!(pool.claim_slot(), Ok(0));
        assert!(pool.claim_slot().is_err());
    }

    #[test]
    fn concurrent_claims_are_unique() {
        let pool = BufferPool::allocate_reserve(100, 64);
        let claimed = Mutex::new(Vec::new());
        par_iter_mut0(128, |_| {
            if let Ok(slot) = pool.claim_slot() {
                claimed.lock().push(slot);
            }
        });
        let claimed = claimed.into_inner();
        assert_eq!(claimed.len(), 64);
        let unique: HashSet<usize> = claimed.iter().cloned().collect();
        assert_eq!(unique.len(), 64);
        assert!(unique.iter().all(|&s| (100..164).contains(&s)));
    }
}
