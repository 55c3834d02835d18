use core::alloc::Layout;
use core::fmt::Debug;
use core::hash::BuildHasher;
use core::hash::Hash;
use core::iter::FusedIterator;
use core::marker::PhantomData;
use core::mem::MaybeUninit;
use core::ptr::NonNull;

use crate::DefaultHashBuilder;
use crate::allocator::Allocator;
use crate::allocator::FallbackAllocator;
use crate::capacity::GrowthPolicy;
use crate::capacity::MIN_CAPACITY;
use crate::capacity::RobinHoodGrowth;
use crate::capacity::grown;
use crate::capacity::round_up_pow2;
use crate::control::h1;
use crate::error::Error;
use crate::error::infallible;

/// Probe byte of an empty slot.
const VACANT: u8 = 0xFF;

/// Largest storable probe distance. Reaching `VACANT` means the walk
/// saturated.
const MAX_DISTANCE: usize = 254;

/// Doublings attempted for a single insert or rehash before giving up with
/// [`Error::ProbeExhausted`].
pub const MAX_FORCED_GROWTHS: usize = 4;

#[derive(Debug)]
struct DataLayout {
    layout: Layout,
    hashes_offset: usize,
    slots_offset: usize,
}

impl DataLayout {
    fn new<K>(capacity: usize) -> Result<Self, Error> {
        let probes = Layout::array::<u8>(capacity).map_err(|_| Error::CapacityOverflow)?;
        let hashes = Layout::array::<u64>(capacity).map_err(|_| Error::CapacityOverflow)?;
        let slots =
            Layout::array::<MaybeUninit<K>>(capacity).map_err(|_| Error::CapacityOverflow)?;

        let (layout, hashes_offset) = probes
            .extend(hashes)
            .map_err(|_| Error::CapacityOverflow)?;
        let (layout, slots_offset) = layout.extend(slots).map_err(|_| Error::CapacityOverflow)?;

        Ok(DataLayout {
            layout: layout.pad_to_align(),
            hashes_offset,
            slots_offset,
        })
    }
}

/// Outcome of walking a probe run for one hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Probe {
    Found(usize),
    /// The key would be placed at `index`, `distance` slots past its ideal
    /// bucket.
    Vacant {
        index: usize,
        distance: usize,
    },
    Saturated,
}

/// Probe distances, full hashes and keys in one block.
///
/// Does not free itself: the owner hands it back to the allocator it came
/// from.
struct RawTable<K> {
    block: NonNull<u8>,
    hashes_offset: usize,
    slots_offset: usize,
    capacity: usize,
    _phantom: PhantomData<K>,
}

impl<K> RawTable<K> {
    const fn unallocated() -> Self {
        Self {
            block: NonNull::dangling(),
            hashes_offset: 0,
            slots_offset: 0,
            capacity: 0,
            _phantom: PhantomData,
        }
    }

    fn allocate<A: Allocator>(capacity: usize, alloc: &A) -> Result<Self, Error> {
        debug_assert!(capacity.is_power_of_two() && capacity >= MIN_CAPACITY);

        let layout = DataLayout::new::<K>(capacity)?;
        let block = alloc
            .malloc(layout.layout.size(), layout.layout.align(), 0)
            .ok_or(Error::AllocError {
                layout: layout.layout,
            })?;

        // SAFETY: The block starts with `capacity` probe bytes.
        unsafe { core::ptr::write_bytes(block.as_ptr(), VACANT, capacity) };

        Ok(Self {
            block,
            hashes_offset: layout.hashes_offset,
            slots_offset: layout.slots_offset,
            capacity,
            _phantom: PhantomData,
        })
    }

    /// Returns the block to `alloc`. Keys still in the slots are not dropped.
    ///
    /// # Safety
    ///
    /// `alloc` must be the allocator this table was allocated from.
    unsafe fn free<A: Allocator>(self, alloc: &A) {
        if self.is_allocated() {
            // SAFETY: Caller guarantees the block came from `alloc`.
            unsafe { alloc.free(self.block.as_ptr()) };
        }
    }

    #[inline(always)]
    fn is_allocated(&self) -> bool {
        self.capacity != 0
    }

    #[inline(always)]
    fn mask(&self) -> usize {
        self.capacity - 1
    }

    #[inline(always)]
    fn ideal_bucket(&self, hash: u64) -> usize {
        h1(hash) & self.mask()
    }

    /// # Safety
    ///
    /// `index` must be less than `capacity`.
    #[inline(always)]
    unsafe fn probe_ptr(&self, index: usize) -> *mut u8 {
        // SAFETY: Caller ensures `index` is within the probe bytes.
        unsafe { self.block.as_ptr().add(index) }
    }

    /// # Safety
    ///
    /// `index` must be less than `capacity`.
    #[inline(always)]
    unsafe fn hash_ptr(&self, index: usize) -> *mut u64 {
        // SAFETY: Caller ensures `index` is within the hash array.
        unsafe {
            self.block
                .as_ptr()
                .add(self.hashes_offset)
                .cast::<u64>()
                .add(index)
        }
    }

    /// # Safety
    ///
    /// `index` must be less than `capacity`.
    #[inline(always)]
    unsafe fn slot(&self, index: usize) -> *mut K {
        // SAFETY: Caller ensures `index` is within the slot array.
        unsafe {
            self.block
                .as_ptr()
                .add(self.slots_offset)
                .cast::<K>()
                .add(index)
        }
    }

    /// # Safety
    ///
    /// `index` must be less than `capacity`.
    #[inline(always)]
    unsafe fn distance(&self, index: usize) -> u8 {
        // SAFETY: Caller ensures `index` is in bounds.
        unsafe { *self.probe_ptr(index) }
    }

    /// Walks the run for `hash` without touching the table.
    ///
    /// Stops at a key matching `eq`, or where the key would go: an empty slot
    /// or one whose occupant sits closer to its own ideal bucket.
    ///
    /// # Safety
    ///
    /// The table must be allocated and hold at least one empty slot.
    #[inline]
    unsafe fn probe(&self, hash: u64, eq: impl Fn(&K) -> bool) -> Probe {
        let mut index = self.ideal_bucket(hash);
        for distance in 0..=MAX_DISTANCE {
            // SAFETY: `index` is masked to the capacity.
            let stored = unsafe { self.distance(index) };
            if stored == VACANT || (stored as usize) < distance {
                return Probe::Vacant { index, distance };
            }
            // SAFETY: The slot is occupied.
            if stored as usize == distance
                && unsafe { *self.hash_ptr(index) } == hash
                && eq(unsafe { &*self.slot(index) })
            {
                return Probe::Found(index);
            }
            index = (index + 1) & self.mask();
        }
        Probe::Saturated
    }

    /// Whether placing an entry at `index` with `distance` lets every entry it
    /// displaces land somewhere without saturating.
    ///
    /// # Safety
    ///
    /// The table must be allocated and hold at least one empty slot.
    unsafe fn displacement_fits(&self, mut index: usize, distance: usize) -> bool {
        let mut carried = distance;
        loop {
            // SAFETY: `index` is masked to the capacity.
            let stored = unsafe { self.distance(index) };
            if stored == VACANT {
                return true;
            }
            carried = carried.min(stored as usize) + 1;
            if carried > MAX_DISTANCE {
                return false;
            }
            index = (index + 1) & self.mask();
        }
    }

    /// Places `key` at `index`, shifting richer entries forward.
    ///
    /// # Safety
    ///
    /// `index` and `distance` must come from a [`probe`](Self::probe) of
    /// `hash` that [`displacement_fits`](Self::displacement_fits) accepted.
    unsafe fn place(&mut self, mut index: usize, distance: usize, hash: u64, key: K) {
        let mut carried_key = key;
        let mut carried_hash = hash;
        let mut carried = distance as u8;
        loop {
            // SAFETY: `index` is masked to the capacity; occupied slots hold
            // initialized keys and empty ones are written before being read.
            unsafe {
                let stored = self.distance(index);
                if stored == VACANT {
                    *self.probe_ptr(index) = carried;
                    *self.hash_ptr(index) = carried_hash;
                    self.slot(index).write(carried_key);
                    return;
                }
                if stored < carried {
                    *self.probe_ptr(index) = carried;
                    carried = stored;
                    core::mem::swap(&mut carried_hash, &mut *self.hash_ptr(index));
                    core::mem::swap(&mut carried_key, &mut *self.slot(index));
                }
            }
            carried += 1;
            index = (index + 1) & self.mask();
        }
    }

    /// Takes the key out of `index` and closes the gap by pulling the rest of
    /// the run back one slot.
    ///
    /// # Safety
    ///
    /// `index` must be an occupied slot.
    unsafe fn remove_at(&mut self, index: usize) -> K {
        // SAFETY: Caller ensures the slot is occupied. Each shifted entry is
        // copied into the hole before its own slot becomes the hole.
        unsafe {
            let key = self.slot(index).read();
            let mut hole = index;
            loop {
                let next = (hole + 1) & self.mask();
                let stored = self.distance(next);
                if stored == VACANT || stored == 0 {
                    *self.probe_ptr(hole) = VACANT;
                    return key;
                }
                *self.probe_ptr(hole) = stored - 1;
                *self.hash_ptr(hole) = *self.hash_ptr(next);
                core::ptr::copy_nonoverlapping(self.slot(next), self.slot(hole), 1);
                hole = next;
            }
        }
    }

    /// Bitwise-copies every entry of `self` into the empty table `target`,
    /// returning `false` as soon as one would saturate.
    ///
    /// # Safety
    ///
    /// Both tables must be allocated, `target` empty and large enough to keep
    /// an empty slot. Whichever table is discarded afterwards must be freed
    /// without dropping its keys.
    unsafe fn copy_into(&self, target: &mut RawTable<K>) -> bool {
        for index in 0..self.capacity {
            // SAFETY: `index` is below capacity; occupied slots hold keys.
            unsafe {
                if self.distance(index) == VACANT {
                    continue;
                }
                let hash = *self.hash_ptr(index);
                let Probe::Vacant {
                    index: to,
                    distance,
                } = target.probe(hash, |_| false)
                else {
                    return false;
                };
                if !target.displacement_fits(to, distance) {
                    return false;
                }
                target.place(to, distance, hash, self.slot(index).read());
            }
        }
        true
    }
}

/// A hash set using Robin-Hood open addressing.
///
/// Each slot records how far its key sits from its ideal bucket. An insert
/// that meets a key closer to home than itself takes that slot and pushes the
/// displaced key further along, which keeps probe runs short and sorted by
/// distance. Lookups stop as soon as they pass a key closer to home than the
/// one sought. Removal shifts the rest of the run back instead of leaving a
/// tombstone.
///
/// The full 64-bit hash of every key is stored next to it, so a rehash never
/// calls the hasher. The table grows at 15/16 load, and also when a probe
/// distance would exceed 254; if doubling [`MAX_FORCED_GROWTHS`] times does
/// not help (many keys with identical hashes), the insert fails with
/// [`Error::ProbeExhausted`].
///
/// # Panics
///
/// Lookups and removals on a set that has never allocated are contract
/// violations and panic.
///
/// # Examples
///
/// ```rust
/// use probe_set::RobinHoodSet;
///
/// let mut set: RobinHoodSet<&str> = RobinHoodSet::with_capacity(64);
/// assert_eq!(set.add("apple"), Ok(true));
/// assert_eq!(set.add("pear"), Ok(true));
/// assert!(set.remove(&"apple"));
/// assert!(set.contains(&"pear"));
/// assert_eq!(set.count(), 1);
/// ```
pub struct RobinHoodSet<K, S = DefaultHashBuilder, A: Allocator = FallbackAllocator> {
    raw: RawTable<K>,
    count: usize,
    hash_builder: S,
    alloc: A,
}

// SAFETY: The set exclusively owns its keys and its block.
unsafe impl<K: Send, S: Send, A: Allocator + Send> Send for RobinHoodSet<K, S, A> {}
// SAFETY: Shared access only reads.
unsafe impl<K: Sync, S: Sync, A: Allocator + Sync> Sync for RobinHoodSet<K, S, A> {}

impl<K> RobinHoodSet<K, DefaultHashBuilder, FallbackAllocator> {
    /// Creates an empty set. Nothing is allocated until the first key is
    /// added.
    pub fn new() -> Self {
        Self::with_hasher_in(DefaultHashBuilder::default(), FallbackAllocator::new())
    }

    /// Creates a set with at least `capacity` slots, rounded up to a power of
    /// two no smaller than 16.
    ///
    /// # Panics
    ///
    /// Panics on capacity overflow, and calls
    /// [`handle_alloc_error`](alloc::alloc::handle_alloc_error) if the
    /// allocation fails.
    pub fn with_capacity(capacity: usize) -> Self {
        infallible(Self::try_with_capacity_and_hasher_in(
            capacity,
            DefaultHashBuilder::default(),
            FallbackAllocator::new(),
        ))
    }
}

impl<K> Default for RobinHoodSet<K, DefaultHashBuilder, FallbackAllocator> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, S> RobinHoodSet<K, S, FallbackAllocator> {
    /// Creates an empty set using `hash_builder` to hash keys.
    pub fn with_hasher(hash_builder: S) -> Self {
        Self::with_hasher_in(hash_builder, FallbackAllocator::new())
    }
}

impl<K, A: Allocator> RobinHoodSet<K, DefaultHashBuilder, A> {
    /// Creates an empty set drawing its storage from `alloc`.
    pub fn new_in(alloc: A) -> Self {
        Self::with_hasher_in(DefaultHashBuilder::default(), alloc)
    }
}

impl<K, S, A: Allocator> RobinHoodSet<K, S, A> {
    /// Creates an empty set with the given hasher and allocator.
    pub fn with_hasher_in(hash_builder: S, alloc: A) -> Self {
        Self {
            raw: RawTable::unallocated(),
            count: 0,
            hash_builder,
            alloc,
        }
    }

    /// Creates a set with at least `capacity` slots, reporting allocation
    /// failure instead of aborting. A capacity of zero allocates nothing.
    pub fn try_with_capacity_and_hasher_in(
        capacity: usize,
        hash_builder: S,
        alloc: A,
    ) -> Result<Self, Error> {
        let mut set = Self::with_hasher_in(hash_builder, alloc);
        if capacity > 0 {
            let capacity = round_up_pow2(capacity)
                .ok_or(Error::CapacityOverflow)?
                .max(MIN_CAPACITY);
            set.raw = RawTable::allocate(capacity, &set.alloc)?;
        }
        Ok(set)
    }

    /// Returns the number of keys in the set.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Returns the number of keys in the set.
    pub fn len(&self) -> usize {
        self.count
    }

    /// Returns `true` if the set holds no keys.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Returns the number of slots, zero before the first allocation.
    pub fn capacity(&self) -> usize {
        self.raw.capacity
    }

    /// Returns the set's hasher builder.
    pub fn hasher(&self) -> &S {
        &self.hash_builder
    }

    /// Returns the allocator backing the set.
    pub fn allocator(&self) -> &A {
        &self.alloc
    }

    /// Returns an iterator over the keys in arbitrary order.
    pub fn keys(&self) -> Keys<'_, K> {
        Keys {
            raw: &self.raw,
            index: 0,
            remaining: self.count,
        }
    }

    /// Removes every key, keeping the allocation.
    pub fn clear(&mut self) {
        // SAFETY: Every key is dropped once and its slot marked vacant.
        unsafe {
            for index in 0..self.raw.capacity {
                let probe = self.raw.probe_ptr(index);
                if *probe != VACANT {
                    *probe = VACANT;
                    core::ptr::drop_in_place(self.raw.slot(index));
                }
            }
        }
        self.count = 0;
    }
}

impl<K, S, A> RobinHoodSet<K, S, A>
where
    K: Hash + Eq,
    S: BuildHasher,
    A: Allocator,
{
    /// Adds a key to the set.
    ///
    /// Returns `Ok(true)` if the key was inserted and `Ok(false)` if it was
    /// already present (the set is unchanged and `key` is dropped).
    ///
    /// # Errors
    ///
    /// - [`Error::ProbeExhausted`] if the key's probe distance still saturates
    ///   in a table [`MAX_FORCED_GROWTHS`] doublings larger.
    /// - [`Error::AllocError`] or [`Error::CapacityOverflow`] if a growth
    ///   fails.
    ///
    /// The set is unchanged on error: same keys, same capacity.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use probe_set::RobinHoodSet;
    ///
    /// let mut set = RobinHoodSet::new();
    /// for key in 0..100u32 {
    ///     assert_eq!(set.add(key), Ok(true));
    /// }
    /// assert_eq!(set.add(42), Ok(false));
    /// assert_eq!(set.count(), 100);
    /// ```
    pub fn add(&mut self, key: K) -> Result<bool, Error> {
        let hash = self.hash_builder.hash_one(&key);
        if !self.raw.is_allocated() {
            self.resize(MIN_CAPACITY)?;
        }

        loop {
            // SAFETY: The table is allocated and below its load limit, so it has
            // an empty slot.
            match unsafe { self.raw.probe(hash, |k| *k == key) } {
                Probe::Found(_) => return Ok(false),
                Probe::Vacant { index, distance } => {
                    if RobinHoodGrowth::should_rehash(self.count + 1, self.raw.capacity) {
                        self.grow()?;
                        continue;
                    }
                    // SAFETY: As above; `index` and `distance` come from the probe.
                    unsafe {
                        if self.raw.displacement_fits(index, distance) {
                            self.raw.place(index, distance, hash, key);
                            self.count += 1;
                            return Ok(true);
                        }
                    }
                }
                Probe::Saturated => {}
            }
            return self.add_with_forced_growth(hash, key);
        }
    }

    /// Inserts a key that saturates the current table into successively
    /// doubled copies of it. A copy only replaces the table once the key is in.
    #[cold]
    #[inline(never)]
    fn add_with_forced_growth(&mut self, hash: u64, key: K) -> Result<bool, Error> {
        let mut capacity = self.raw.capacity;
        for forced_growths in 1..=MAX_FORCED_GROWTHS {
            capacity = grown(capacity).ok_or(Error::CapacityOverflow)?;
            tracing::debug!(
                from = self.raw.capacity,
                to = capacity,
                count = self.count,
                forced_growths,
                "probe distance saturated, trying a larger table"
            );
            let Some(mut candidate) = self.copy_at(capacity)? else {
                continue;
            };

            // SAFETY: `candidate` holds bitwise copies of every entry at a larger
            // capacity, so it keeps an empty slot. It either becomes the table or
            // is freed without dropping its copies.
            unsafe {
                if let Probe::Vacant { index, distance } = candidate.probe(hash, |_| false) {
                    if candidate.displacement_fits(index, distance) {
                        candidate.place(index, distance, hash, key);
                        self.install(candidate);
                        self.count += 1;
                        return Ok(true);
                    }
                }
                candidate.free(&self.alloc);
            }
        }

        Err(Error::ProbeExhausted {
            capacity: self.raw.capacity,
            forced_growths: MAX_FORCED_GROWTHS,
        })
    }

    /// Returns `true` if the set contains `key`.
    ///
    /// # Panics
    ///
    /// Panics if the set has never allocated.
    pub fn contains(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Returns the stored key equal to `key`, if any.
    ///
    /// # Panics
    ///
    /// Panics if the set has never allocated.
    pub fn get(&self, key: &K) -> Option<&K> {
        let index = self.find(key)?;
        // SAFETY: `find` only returns occupied slots.
        Some(unsafe { &*self.raw.slot(index) })
    }

    /// Removes `key`, returning whether it was present.
    ///
    /// # Panics
    ///
    /// Panics if the set has never allocated.
    pub fn remove(&mut self, key: &K) -> bool {
        self.take(key).is_some()
    }

    /// Removes and returns the stored key equal to `key`, if any.
    ///
    /// # Panics
    ///
    /// Panics if the set has never allocated.
    pub fn take(&mut self, key: &K) -> Option<K> {
        let index = self.find(key)?;
        self.count -= 1;
        // SAFETY: `find` only returns occupied slots.
        Some(unsafe { self.raw.remove_at(index) })
    }

    /// Grows the set, if needed, to at least `min_capacity` slots.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AllocError`], [`Error::CapacityOverflow`] or, if the
    /// keys cannot be laid out without saturating, [`Error::ProbeExhausted`].
    /// The set is unchanged on error.
    pub fn ensure_capacity(&mut self, min_capacity: usize) -> Result<(), Error> {
        if min_capacity <= self.raw.capacity {
            return Ok(());
        }
        let capacity = round_up_pow2(min_capacity)
            .ok_or(Error::CapacityOverflow)?
            .max(MIN_CAPACITY);
        self.resize(capacity)
    }

    /// Makes room for at least `additional` more keys without growing.
    ///
    /// # Errors
    ///
    /// As for [`ensure_capacity`](Self::ensure_capacity).
    pub fn reserve(&mut self, additional: usize) -> Result<(), Error> {
        let required = self
            .count
            .checked_add(additional)
            .ok_or(Error::CapacityOverflow)?;
        if required == 0
            || (self.raw.is_allocated()
                && !RobinHoodGrowth::should_rehash(required, self.raw.capacity))
        {
            return Ok(());
        }

        let capacity = RobinHoodGrowth::capacity_for(required).ok_or(Error::CapacityOverflow)?;
        if capacity > self.raw.capacity {
            self.resize(capacity)
        } else {
            Ok(())
        }
    }

    /// Computes probe-length statistics for the current layout.
    ///
    /// Requires the `stats` feature.
    #[cfg(feature = "stats")]
    pub fn probe_stats(&self) -> crate::ProbeStats {
        crate::ProbeStats::from_probe_lengths(
            self.count,
            self.raw.capacity,
            (0..self.raw.capacity).filter_map(|index| {
                // SAFETY: `index` is below capacity.
                let stored = unsafe { self.raw.distance(index) };
                (stored != VACANT).then_some(stored as usize)
            }),
        )
    }

    fn find(&self, key: &K) -> Option<usize> {
        assert!(
            self.raw.is_allocated(),
            "lookup on a set that has never allocated"
        );
        let hash = self.hash_builder.hash_one(key);
        // SAFETY: The table is allocated and keeps an empty slot.
        match unsafe { self.raw.probe(hash, |k| k == key) } {
            Probe::Found(index) => Some(index),
            Probe::Vacant { .. } | Probe::Saturated => None,
        }
    }

    #[cold]
    #[inline(never)]
    fn grow(&mut self) -> Result<(), Error> {
        let capacity = grown(self.raw.capacity).ok_or(Error::CapacityOverflow)?;
        self.resize(capacity)
    }

    /// Moves every entry into a fresh table of at least `capacity` slots,
    /// doubling the target while it saturates.
    ///
    /// The current block is only released once a new one is complete, so any
    /// error leaves the set untouched.
    fn resize(&mut self, mut capacity: usize) -> Result<(), Error> {
        let mut forced_growths = 0;
        loop {
            if let Some(new_raw) = self.copy_at(capacity)? {
                // SAFETY: `new_raw` holds bitwise copies of every entry.
                unsafe { self.install(new_raw) };
                return Ok(());
            }

            if forced_growths == MAX_FORCED_GROWTHS {
                return Err(Error::ProbeExhausted {
                    capacity,
                    forced_growths,
                });
            }
            forced_growths += 1;
            tracing::debug!(capacity, "rehash target saturated, doubling");
            capacity = grown(capacity).ok_or(Error::CapacityOverflow)?;
        }
    }
}

impl<K, S, A: Allocator> RobinHoodSet<K, S, A> {
    /// Bitwise copy of the table at `capacity` slots, or `None` if an entry
    /// would saturate there.
    ///
    /// `capacity` must be at least the current capacity. The copy shares its
    /// keys with the current table: exactly one of the two may later drop them.
    fn copy_at(&self, capacity: usize) -> Result<Option<RawTable<K>>, Error> {
        let mut new_raw = RawTable::<K>::allocate(capacity, &self.alloc)?;
        // SAFETY: `new_raw` is empty and at least as large as the current table.
        // On saturation its partial copies are forgotten with the block.
        unsafe {
            if !self.raw.is_allocated() || self.raw.copy_into(&mut new_raw) {
                return Ok(Some(new_raw));
            }
            new_raw.free(&self.alloc);
        }
        Ok(None)
    }

    /// Replaces the table with `new_raw` and frees the old block.
    ///
    /// # Safety
    ///
    /// `new_raw` must come from `self.alloc` and own every key of the current
    /// table, which is freed without dropping them.
    unsafe fn install(&mut self, new_raw: RawTable<K>) {
        tracing::debug!(
            from = self.raw.capacity,
            to = new_raw.capacity,
            count = self.count,
            "rehashing robin-hood table"
        );
        let old = core::mem::replace(&mut self.raw, new_raw);
        // SAFETY: Caller guarantees the keys moved to `new_raw`.
        unsafe { old.free(&self.alloc) };
    }
}

impl<K, S, A: Allocator> Drop for RobinHoodSet<K, S, A> {
    fn drop(&mut self) {
        if core::mem::needs_drop::<K>() {
            self.clear();
        }
        let raw = core::mem::replace(&mut self.raw, RawTable::unallocated());
        // SAFETY: The block came from `self.alloc`, and no keys remain in it.
        unsafe { raw.free(&self.alloc) };
    }
}

impl<K, S, A> PartialEq for RobinHoodSet<K, S, A>
where
    K: Hash + Eq,
    S: BuildHasher,
    A: Allocator,
{
    fn eq(&self, other: &Self) -> bool {
        if self.count != other.count {
            return false;
        }
        self.count == 0 || self.keys().all(|key| other.contains(key))
    }
}

impl<K, S, A> Eq for RobinHoodSet<K, S, A>
where
    K: Hash + Eq,
    S: BuildHasher,
    A: Allocator,
{
}

impl<K: Debug, S, A: Allocator> Debug for RobinHoodSet<K, S, A> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_set().entries(self.keys()).finish()
    }
}

impl<K, S, A> Extend<K> for RobinHoodSet<K, S, A>
where
    K: Hash + Eq,
    S: BuildHasher,
    A: Allocator,
{
    /// # Panics
    ///
    /// Panics if an insert fails with anything but an allocation error, which
    /// goes to the alloc error handler. Use [`add`](RobinHoodSet::add) to
    /// handle these.
    fn extend<I: IntoIterator<Item = K>>(&mut self, iter: I) {
        let iter = iter.into_iter();
        infallible(self.reserve(iter.size_hint().0));
        for key in iter {
            infallible(self.add(key));
        }
    }
}

impl<K, S, A> FromIterator<K> for RobinHoodSet<K, S, A>
where
    K: Hash + Eq,
    S: BuildHasher + Default,
    A: Allocator + Default,
{
    fn from_iter<I: IntoIterator<Item = K>>(iter: I) -> Self {
        let mut set = Self::with_hasher_in(S::default(), A::default());
        set.extend(iter);
        set
    }
}

impl<'a, K, S, A: Allocator> IntoIterator for &'a RobinHoodSet<K, S, A> {
    type Item = &'a K;
    type IntoIter = Keys<'a, K>;

    fn into_iter(self) -> Self::IntoIter {
        self.keys()
    }
}

/// An iterator over the keys of a [`RobinHoodSet`], in arbitrary order.
///
/// Created by [`RobinHoodSet::keys`].
pub struct Keys<'a, K> {
    raw: &'a RawTable<K>,
    index: usize,
    remaining: usize,
}

// SAFETY: The iterator only hands out shared references to keys.
unsafe impl<K: Sync> Send for Keys<'_, K> {}
// SAFETY: As above.
unsafe impl<K: Sync> Sync for Keys<'_, K> {}

impl<K> Clone for Keys<'_, K> {
    fn clone(&self) -> Self {
        Keys {
            raw: self.raw,
            index: self.index,
            remaining: self.remaining,
        }
    }
}

impl<'a, K> Iterator for Keys<'a, K> {
    type Item = &'a K;

    fn next(&mut self) -> Option<Self::Item> {
        while self.remaining > 0 {
            let index = self.index;
            self.index += 1;
            // SAFETY: `remaining > 0` means an occupied slot lies at or after
            // `index`, so it is below capacity.
            unsafe {
                if self.raw.distance(index) != VACANT {
                    self.remaining -= 1;
                    return Some(&*self.raw.slot(index));
                }
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<K> ExactSizeIterator for Keys<'_, K> {}

impl<K> FusedIterator for Keys<'_, K> {}
