//! Helpers shared by the set tests.

use alloc::collections::BTreeSet;
use alloc::vec::Vec;
use core::cell::Cell;
use core::hash::BuildHasher;
use core::hash::Hasher;
use core::ptr::NonNull;

use rand::Rng;
use rand::SeedableRng;
use rand::TryRngCore;
use rand::rngs::OsRng;
use rand::rngs::SmallRng;
use siphasher::sip::SipHasher;

use crate::allocator::Allocator;
use crate::allocator::FallbackAllocator;

#[derive(Clone)]
pub(crate) struct SipHashBuilder {
    k1: u64,
    k2: u64,
}

impl BuildHasher for SipHashBuilder {
    type Hasher = SipHasher;

    fn build_hasher(&self) -> Self::Hasher {
        SipHasher::new_with_keys(self.k1, self.k2)
    }
}

impl Default for SipHashBuilder {
    fn default() -> Self {
        Self {
            k1: OsRng.try_next_u64().unwrap_or(0),
            k2: OsRng.try_next_u64().unwrap_or(0),
        }
    }
}

/// Hashes every key to zero: same bucket, same fingerprint.
#[derive(Clone, Default)]
pub(crate) struct ZeroHashBuilder;

pub(crate) struct ZeroHasher;

impl Hasher for ZeroHasher {
    fn finish(&self) -> u64 {
        0
    }

    fn write(&mut self, _bytes: &[u8]) {}
}

impl BuildHasher for ZeroHashBuilder {
    type Hasher = ZeroHasher;

    fn build_hasher(&self) -> Self::Hasher {
        ZeroHasher
    }
}

/// Serves `budget` allocations, then returns `None` until refilled.
pub(crate) struct BudgetAllocator {
    inner: FallbackAllocator,
    budget: Cell<usize>,
}

impl BudgetAllocator {
    pub(crate) fn new(budget: usize) -> Self {
        Self {
            inner: FallbackAllocator::new(),
            budget: Cell::new(budget),
        }
    }

    pub(crate) fn refill(&self, budget: usize) {
        self.budget.set(budget);
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.inner.outstanding()
    }
}

// SAFETY: Every block comes from the wrapped `FallbackAllocator`.
unsafe impl Allocator for BudgetAllocator {
    fn malloc(&self, size: usize, align: usize, offset: usize) -> Option<NonNull<u8>> {
        let budget = self.budget.get();
        if budget == 0 {
            return None;
        }
        self.budget.set(budget - 1);
        self.inner.malloc(size, align, offset)
    }

    unsafe fn free(&self, ptr: *mut u8) {
        // SAFETY: Caller upholds the contract of `free`.
        unsafe { self.inner.free(ptr) }
    }
}

/// The operations [`check_against_model`] drives on a set of `u64` keys.
pub(crate) trait ModelSet {
    fn add(&mut self, key: u64) -> bool;
    fn remove(&mut self, key: u64) -> bool;
    fn contains(&self, key: u64) -> bool;
    fn count(&self) -> usize;
    fn capacity(&self) -> usize;
    fn max_load(&self) -> usize;
    fn keys(&self) -> Vec<u64>;

    /// Layout checks specific to the table variant.
    fn check_invariants(&self) {}
}

/// Runs a seeded random sequence of add/remove/contains against `set` and a
/// `BTreeSet`, asserting they agree after every step.
///
/// `set` must already be allocated.
pub(crate) fn check_against_model<T: ModelSet>(set: &mut T, seed: u64, ops: usize, key_space: u64) {
    let mut rng = SmallRng::seed_from_u64(seed);
    let mut model = BTreeSet::new();
    let mut last_capacity = set.capacity();

    for step in 0..ops {
        let key = rng.random_range(0..key_space);
        match rng.random_range(0..10u8) {
            0..=5 => {
                assert_eq!(set.add(key), model.insert(key), "step {step}: add {key}");
                assert!(
                    set.count() <= set.max_load(),
                    "step {step}: {} keys over load limit {}",
                    set.count(),
                    set.max_load()
                );
            }
            6..=8 => {
                assert_eq!(
                    set.remove(key),
                    model.remove(&key),
                    "step {step}: remove {key}"
                );
            }
            _ => {
                assert_eq!(
                    set.contains(key),
                    model.contains(&key),
                    "step {step}: contains {key}"
                );
            }
        }

        assert_eq!(set.count(), model.len(), "step {step}");
        assert!(set.capacity().is_power_of_two());
        assert!(set.capacity() >= last_capacity, "capacity shrank");
        last_capacity = set.capacity();

        if step % 64 == 0 {
            set.check_invariants();
        }
    }

    set.check_invariants();
    for key in 0..key_space {
        assert_eq!(set.contains(key), model.contains(&key), "final contains {key}");
    }

    let mut keys = set.keys();
    keys.sort_unstable();
    assert_eq!(keys, model.into_iter().collect::<Vec<_>>());
}
