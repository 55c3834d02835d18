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
use crate::capacity::SwissGrowth;
use crate::capacity::grown;
use crate::capacity::round_up_pow2;
use crate::control::DELETED;
use crate::control::EMPTY;
use crate::control::h1;
use crate::control::h2;
use crate::control::is_full;
use crate::error::Error;
use crate::error::infallible;
use crate::group::BitMask;
use crate::group::GROUP_WIDTH;
use crate::group::Group;

/// Control bytes (`capacity + GROUP_WIDTH`, group-aligned) followed by the
/// slot array, in one block.
#[derive(Debug)]
struct DataLayout {
    layout: Layout,
    slots_offset: usize,
}

impl DataLayout {
    fn new<K>(capacity: usize) -> Result<Self, Error> {
        let ctrl_len = capacity
            .checked_add(GROUP_WIDTH)
            .ok_or(Error::CapacityOverflow)?;
        let ctrl_layout = Layout::array::<u8>(ctrl_len)
            .and_then(|layout| layout.align_to(GROUP_WIDTH))
            .map_err(|_| Error::CapacityOverflow)?;
        let slots_layout =
            Layout::array::<MaybeUninit<K>>(capacity).map_err(|_| Error::CapacityOverflow)?;

        let (layout, slots_offset) = ctrl_layout
            .extend(slots_layout)
            .map_err(|_| Error::CapacityOverflow)?;

        Ok(DataLayout {
            layout: layout.pad_to_align(),
            slots_offset,
        })
    }
}

/// Storage of a [`SwissSet`] without its bookkeeping.
///
/// Does not free itself: the owner hands it back to the allocator it came
/// from.
struct RawTable<K> {
    block: NonNull<u8>,
    slots_offset: usize,
    capacity: usize,
    _phantom: PhantomData<K>,
}

impl<K> RawTable<K> {
    const fn unallocated() -> Self {
        Self {
            block: NonNull::dangling(),
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

        // SAFETY: The block starts with `capacity + GROUP_WIDTH` control bytes.
        unsafe { core::ptr::write_bytes(block.as_ptr(), EMPTY, capacity + GROUP_WIDTH) };

        Ok(Self {
            block,
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
    fn ctrl_ptr(&self) -> *mut u8 {
        self.block.as_ptr()
    }

    /// # Safety
    ///
    /// `index` must be less than `capacity + GROUP_WIDTH`.
    #[inline(always)]
    unsafe fn ctrl(&self, index: usize) -> u8 {
        // SAFETY: Caller ensures `index` is within the control bytes.
        unsafe { *self.ctrl_ptr().add(index) }
    }

    /// Writes a control byte and its mirror, if it has one.
    ///
    /// # Safety
    ///
    /// `index` must be less than `capacity`.
    #[inline(always)]
    unsafe fn set_ctrl(&mut self, index: usize, value: u8) {
        // Slots below GROUP_WIDTH are mirrored at `capacity + index`; for every
        // other slot this computes `index` again.
        let mirror = (index.wrapping_sub(GROUP_WIDTH) & self.mask()) + GROUP_WIDTH;
        // SAFETY: Caller ensures `index < capacity`, and `mirror` is at most
        // `capacity + GROUP_WIDTH - 1` since `capacity >= GROUP_WIDTH`.
        unsafe {
            *self.ctrl_ptr().add(index) = value;
            *self.ctrl_ptr().add(mirror) = value;
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

    #[inline(always)]
    fn probe_seq(&self, hash: u64) -> ProbeSeq {
        ProbeSeq {
            pos: h1(hash) & self.mask(),
            mask: self.mask(),
            remaining: self.capacity / GROUP_WIDTH,
        }
    }

    /// # Safety
    ///
    /// `pos` must be less than `capacity`.
    #[inline(always)]
    unsafe fn group_at(&self, pos: usize) -> Group {
        // SAFETY: Reads `pos..pos + GROUP_WIDTH`, inside the control bytes thanks
        // to the mirrored tail.
        unsafe { Group::load(self.ctrl_ptr().add(pos)) }
    }

    /// Index of the slot holding a key matching `eq`.
    ///
    /// # Safety
    ///
    /// The table must be allocated.
    #[inline]
    unsafe fn find(&self, hash: u64, eq: impl Fn(&K) -> bool) -> Option<usize> {
        let tag = h2(hash);
        for pos in self.probe_seq(hash) {
            // SAFETY: `pos` comes from the probe sequence, so it is below capacity.
            let group = unsafe { self.group_at(pos) };
            for bit in group.match_byte(tag) {
                let index = (pos + bit) & self.mask();
                // SAFETY: A fingerprint match means the slot is occupied.
                if eq(unsafe { &*self.slot(index) }) {
                    return Some(index);
                }
            }
            if group.match_empty().any_bit_set() {
                return None;
            }
        }
        None
    }

    /// `Ok` with the index of the matching key, or `Err` with the first empty
    /// or deleted slot of the probe sequence.
    ///
    /// Probing only stops at an empty byte: a key may sit past a tombstone.
    ///
    /// # Safety
    ///
    /// The table must be allocated.
    #[inline]
    unsafe fn find_or_find_insert_slot(
        &self,
        hash: u64,
        eq: impl Fn(&K) -> bool,
    ) -> Result<usize, usize> {
        let tag = h2(hash);
        let mut insert_slot = None;
        for pos in self.probe_seq(hash) {
            // SAFETY: `pos` comes from the probe sequence, so it is below capacity.
            let group = unsafe { self.group_at(pos) };
            for bit in group.match_byte(tag) {
                let index = (pos + bit) & self.mask();
                // SAFETY: A fingerprint match means the slot is occupied.
                if eq(unsafe { &*self.slot(index) }) {
                    return Ok(index);
                }
            }

            if insert_slot.is_none() {
                insert_slot = group
                    .match_empty_or_deleted()
                    .lowest_set_bit()
                    .map(|bit| (pos + bit) & self.mask());
            }

            if group.match_empty().any_bit_set() {
                break;
            }
        }

        match insert_slot {
            Some(slot) => Err(slot),
            None => panic!("probe sequence wrapped without finding a free slot"),
        }
    }

    /// First empty or deleted slot of the probe sequence for `hash`.
    ///
    /// # Safety
    ///
    /// The table must be allocated.
    #[inline]
    unsafe fn find_insert_slot(&self, hash: u64) -> usize {
        for pos in self.probe_seq(hash) {
            // SAFETY: `pos` comes from the probe sequence, so it is below capacity.
            let group = unsafe { self.group_at(pos) };
            if let Some(bit) = group.match_empty_or_deleted().lowest_set_bit() {
                return (pos + bit) & self.mask();
            }
        }
        panic!("probe sequence wrapped without finding a free slot")
    }

    /// Indices of the occupied slots. `count` must be the number of occupied
    /// slots.
    fn full_indices(&self, count: usize) -> FullIndices {
        let current = if count == 0 {
            BitMask(0)
        } else {
            // SAFETY: A non-zero count means the table is allocated.
            unsafe { self.group_at(0) }.match_full()
        };
        FullIndices {
            ctrl: self.ctrl_ptr(),
            group_base: 0,
            current,
            remaining: count,
        }
    }
}

/// Group start positions visited for one hash, each `GROUP_WIDTH` past the
/// last, wrapping at capacity. Covers every slot exactly once.
struct ProbeSeq {
    pos: usize,
    mask: usize,
    remaining: usize,
}

impl Iterator for ProbeSeq {
    type Item = usize;

    #[inline(always)]
    fn next(&mut self) -> Option<usize> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let pos = self.pos;
        self.pos = (pos + GROUP_WIDTH) & self.mask;
        Some(pos)
    }
}

/// Scans aligned groups for occupied slots.
#[derive(Clone)]
struct FullIndices {
    ctrl: *const u8,
    group_base: usize,
    current: BitMask,
    remaining: usize,
}

impl Iterator for FullIndices {
    type Item = usize;

    #[inline]
    fn next(&mut self) -> Option<usize> {
        if self.remaining == 0 {
            return None;
        }
        loop {
            if let Some(bit) = self.current.next() {
                self.remaining -= 1;
                return Some(self.group_base + bit);
            }
            self.group_base += GROUP_WIDTH;
            // SAFETY: `remaining > 0` means an occupied slot lies at or after
            // `group_base`, so the group is inside the first `capacity` bytes.
            self.current = unsafe { Group::load(self.ctrl.add(self.group_base)) }.match_full();
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

/// A hash set using a control-byte ("SwissTable") layout.
///
/// Every slot has one control byte: `EMPTY`, `DELETED` (a tombstone), or the
/// 7-bit fingerprint (H2) of the key stored there. Lookups start at the
/// bucket picked by the remaining hash bits (H1) and compare 16 control bytes
/// at once against the fingerprint, checking full key equality only for the
/// matches. Control bytes and keys share one block from the set's
/// [`Allocator`]; the 16 control bytes past the end mirror the first 16 so a
/// probe window never needs to wrap.
///
/// The table grows by doubling when inserting into an empty slot would push
/// live keys plus tombstones over 7/8 of the capacity. If most of that load
/// is tombstones, it is rehashed at the same capacity instead.
///
/// # Panics
///
/// Lookups and removals on a set that has never allocated (no key added, no
/// capacity requested) are contract violations and panic.
///
/// # Examples
///
/// ```rust
/// use probe_set::SwissSet;
///
/// let mut set: SwissSet<u64> = SwissSet::with_capacity(16);
/// assert_eq!(set.add(7), Ok(true));
/// assert_eq!(set.add(7), Ok(false));
/// assert!(set.contains(&7));
/// assert!(set.remove(&7));
/// assert!(!set.contains(&7));
/// ```
pub struct SwissSet<K, S = DefaultHashBuilder, A: Allocator = FallbackAllocator> {
    raw: RawTable<K>,
    count: usize,
    deleted: usize,
    hash_builder: S,
    alloc: A,
}

// SAFETY: The set exclusively owns its keys and its block.
unsafe impl<K: Send, S: Send, A: Allocator + Send> Send for SwissSet<K, S, A> {}
// SAFETY: Shared access only reads keys and control bytes.
unsafe impl<K: Sync, S: Sync, A: Allocator + Sync> Sync for SwissSet<K, S, A> {}

impl<K> SwissSet<K, DefaultHashBuilder, FallbackAllocator> {
    /// Creates an empty set. Nothing is allocated until the first key is
    /// added.
    pub fn new() -> Self {
        Self::with_hasher_in(DefaultHashBuilder::default(), FallbackAllocator::new())
    }

    /// Creates a set with at least `capacity` slots, rounded up to a power of
    /// two no smaller than 16. A capacity of zero allocates nothing.
    ///
    /// # Panics
    ///
    /// Panics on capacity overflow, and calls
    /// [`handle_alloc_error`](alloc::alloc::handle_alloc_error) if the
    /// allocation fails.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use probe_set::SwissSet;
    ///
    /// let set: SwissSet<u32> = SwissSet::with_capacity(100);
    /// assert_eq!(set.capacity(), 128);
    /// ```
    pub fn with_capacity(capacity: usize) -> Self {
        infallible(Self::try_with_capacity_and_hasher_in(
            capacity,
            DefaultHashBuilder::default(),
            FallbackAllocator::new(),
        ))
    }
}

impl<K> Default for SwissSet<K, DefaultHashBuilder, FallbackAllocator> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, S> SwissSet<K, S, FallbackAllocator> {
    /// Creates an empty set using `hash_builder` to hash keys.
    pub fn with_hasher(hash_builder: S) -> Self {
        Self::with_hasher_in(hash_builder, FallbackAllocator::new())
    }
}

impl<K, A: Allocator> SwissSet<K, DefaultHashBuilder, A> {
    /// Creates an empty set drawing its storage from `alloc`.
    pub fn new_in(alloc: A) -> Self {
        Self::with_hasher_in(DefaultHashBuilder::default(), alloc)
    }
}

impl<K, S, A: Allocator> SwissSet<K, S, A> {
    /// Creates an empty set with the given hasher and allocator.
    pub fn with_hasher_in(hash_builder: S, alloc: A) -> Self {
        Self {
            raw: RawTable::unallocated(),
            count: 0,
            deleted: 0,
            hash_builder,
            alloc,
        }
    }

    /// Creates a set with at least `capacity` slots, reporting allocation
    /// failure instead of aborting.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use probe_set::FallbackAllocator;
    /// use probe_set::SwissSet;
    /// use probe_set::DefaultHashBuilder;
    ///
    /// let alloc = FallbackAllocator::new();
    /// let set = SwissSet::<u64, _, _>::try_with_capacity_and_hasher_in(
    ///     16,
    ///     DefaultHashBuilder::default(),
    ///     &alloc,
    /// )
    /// .unwrap();
    /// assert_eq!(set.capacity(), 16);
    /// assert_eq!(alloc.outstanding(), 1);
    /// ```
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

    /// Returns the number of slots: zero before the first allocation, a power
    /// of two no smaller than 16 afterwards.
    ///
    /// At most 7/8 of the slots hold keys at any time.
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
            indices: self.raw.full_indices(self.count),
            raw: &self.raw,
        }
    }

    /// Removes every key, keeping the allocation.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use probe_set::SwissSet;
    ///
    /// let mut set: SwissSet<i32> = (0..10).collect();
    /// let capacity = set.capacity();
    /// set.clear();
    /// assert!(set.is_empty());
    /// assert_eq!(set.capacity(), capacity);
    /// ```
    pub fn clear(&mut self) {
        // SAFETY: Keys are dropped exactly once, then every control byte is reset
        // so the slots are no longer considered initialized.
        unsafe {
            self.drop_keys();
            if self.raw.is_allocated() {
                core::ptr::write_bytes(
                    self.raw.ctrl_ptr(),
                    EMPTY,
                    self.raw.capacity + GROUP_WIDTH,
                );
            }
        }
        self.count = 0;
        self.deleted = 0;
    }

    /// Drops every stored key without touching the control bytes.
    ///
    /// # Safety
    ///
    /// The control bytes must be reset (or the block freed) before the slots
    /// are read again.
    unsafe fn drop_keys(&mut self) {
        if !core::mem::needs_drop::<K>() {
            return;
        }
        for index in self.raw.full_indices(self.count) {
            // SAFETY: `full_indices` only yields occupied slots.
            unsafe { core::ptr::drop_in_place(self.raw.slot(index)) };
        }
    }
}

impl<K, S, A> SwissSet<K, S, A>
where
    K: Hash + Eq,
    S: BuildHasher,
    A: Allocator,
{
    /// Adds a key to the set.
    ///
    /// Returns `Ok(true)` if the key was inserted and `Ok(false)` if it was
    /// already present, in which case the set is unchanged and `key` is
    /// dropped. The first add allocates a 16-slot table.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AllocError`] if a needed growth could not allocate, and
    /// [`Error::CapacityOverflow`] if the doubled capacity does not fit. The set
    /// is left as it was.
    pub fn add(&mut self, key: K) -> Result<bool, Error> {
        let hash = self.hash_builder.hash_one(&key);
        if !self.raw.is_allocated() {
            self.resize(MIN_CAPACITY)?;
        }

        // SAFETY: The table is allocated.
        let slot = match unsafe { self.raw.find_or_find_insert_slot(hash, |k| *k == key) } {
            Ok(_) => return Ok(false),
            Err(slot) => slot,
        };

        // SAFETY: `slot` is a valid index from the probe.
        let consumes_empty = unsafe { self.raw.ctrl(slot) } == EMPTY;
        let slot = if consumes_empty
            && self.count + self.deleted + 1 > SwissGrowth::max_load(self.raw.capacity)
        {
            self.reserve_rehash()?;
            // SAFETY: The table is still allocated after a rehash.
            unsafe { self.raw.find_insert_slot(hash) }
        } else {
            slot
        };

        // SAFETY: `slot` is an empty or deleted slot of the current table.
        unsafe { self.insert_at(slot, hash, key) };
        Ok(true)
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
        self.assert_allocated();
        let hash = self.hash_builder.hash_one(key);
        // SAFETY: The table is allocated, and `find` returns occupied slots only.
        unsafe {
            self.raw
                .find(hash, |k| k == key)
                .map(|index| &*self.raw.slot(index))
        }
    }

    /// Removes `key`, returning whether it was present.
    ///
    /// The slot becomes a tombstone so probe sequences through it stay intact.
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
        self.assert_allocated();
        let hash = self.hash_builder.hash_one(key);
        // SAFETY: The table is allocated.
        let index = unsafe { self.raw.find(hash, |k| k == key) }?;

        self.count -= 1;
        self.deleted += 1;
        // SAFETY: `index` holds an initialized key; marking it deleted first means
        // it is never read or dropped again.
        unsafe {
            self.raw.set_ctrl(index, DELETED);
            Some(self.raw.slot(index).read())
        }
    }

    /// Grows the set, if needed, to at least `min_capacity` slots.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AllocError`] or [`Error::CapacityOverflow`]; the set is
    /// unchanged on error.
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
    /// Returns [`Error::AllocError`] or [`Error::CapacityOverflow`]; the set is
    /// unchanged on error.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use probe_set::SwissSet;
    ///
    /// let mut set: SwissSet<u64> = SwissSet::new();
    /// set.reserve(100).unwrap();
    /// assert!(set.capacity() * 7 / 8 >= 100);
    /// ```
    pub fn reserve(&mut self, additional: usize) -> Result<(), Error> {
        let required = self
            .count
            .checked_add(additional)
            .ok_or(Error::CapacityOverflow)?;
        if required == 0
            || (self.raw.is_allocated() && required <= SwissGrowth::max_load(self.raw.capacity))
        {
            return Ok(());
        }

        let capacity = SwissGrowth::capacity_for(required).ok_or(Error::CapacityOverflow)?;
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
            self.raw.full_indices(self.count).map(|index| {
                // SAFETY: `full_indices` only yields occupied slots.
                let hash = self.hash_builder.hash_one(unsafe { &*self.raw.slot(index) });
                index.wrapping_sub(h1(hash)) & self.raw.mask()
            }),
        )
    }

    #[inline(always)]
    fn assert_allocated(&self) {
        assert!(
            self.raw.is_allocated(),
            "lookup on a set that has never allocated"
        );
    }

    /// # Safety
    ///
    /// `index` must be an empty or deleted slot of the current table.
    #[inline]
    unsafe fn insert_at(&mut self, index: usize, hash: u64, key: K) {
        // SAFETY: Caller ensures `index` is a free slot.
        unsafe {
            debug_assert!(!is_full(self.raw.ctrl(index)));
            if self.raw.ctrl(index) == DELETED {
                self.deleted -= 1;
            }
            self.raw.set_ctrl(index, h2(hash));
            self.raw.slot(index).write(key);
        }
        self.count += 1;
    }

    /// Makes room for one more key in an empty slot: purges tombstones in place
    /// when live keys use at most half the load budget, doubles otherwise.
    #[cold]
    #[inline(never)]
    fn reserve_rehash(&mut self) -> Result<(), Error> {
        let capacity = self.raw.capacity;
        if self.count < SwissGrowth::max_load(capacity) / 2 {
            tracing::debug!(
                capacity,
                count = self.count,
                deleted = self.deleted,
                "purging tombstones"
            );
            return self.resize(capacity);
        }

        let capacity = grown(capacity).ok_or(Error::CapacityOverflow)?;
        self.resize(capacity)
    }

    /// Moves every key into a fresh table of `capacity` slots.
    ///
    /// The current block is only released once the new one is complete, so a
    /// failed allocation or a panicking `Hash` leaves the set untouched.
    fn resize(&mut self, capacity: usize) -> Result<(), Error> {
        let mut new_raw = FreeOnDrop {
            raw: RawTable::<K>::allocate(capacity, &self.alloc)?,
            alloc: &self.alloc,
        };
        tracing::debug!(
            from = self.raw.capacity,
            to = capacity,
            count = self.count,
            "rehashing control-byte table"
        );

        for index in self.raw.full_indices(self.count) {
            // SAFETY: `index` is an occupied slot of the old table. Keys are copied
            // bitwise; the old block is freed below without dropping them. If
            // hashing unwinds, the guard frees the new block and the copies in it
            // are forgotten.
            unsafe {
                let key = self.raw.slot(index);
                let hash = self.hash_builder.hash_one(&*key);
                let new_index = new_raw.raw.find_insert_slot(hash);
                new_raw.raw.set_ctrl(new_index, h2(hash));
                core::ptr::copy_nonoverlapping(key, new_raw.raw.slot(new_index), 1);
            }
        }

        let new_raw = new_raw.into_inner();
        let old = core::mem::replace(&mut self.raw, new_raw);
        self.deleted = 0;
        // SAFETY: `old` came from `self.alloc`; its keys now live in the new table.
        unsafe { old.free(&self.alloc) };
        Ok(())
    }
}

/// Returns a table under construction to its allocator if the rehash filling
/// it unwinds. Keys in it are not dropped.
struct FreeOnDrop<'a, K, A: Allocator> {
    raw: RawTable<K>,
    alloc: &'a A,
}

impl<K, A: Allocator> FreeOnDrop<'_, K, A> {
    fn into_inner(mut self) -> RawTable<K> {
        core::mem::replace(&mut self.raw, RawTable::unallocated())
    }
}

impl<K, A: Allocator> Drop for FreeOnDrop<'_, K, A> {
    fn drop(&mut self) {
        let raw = core::mem::replace(&mut self.raw, RawTable::unallocated());
        // SAFETY: `raw` came from `alloc`, and an unallocated table frees nothing.
        unsafe { raw.free(self.alloc) };
    }
}

impl<K, S, A: Allocator> Drop for SwissSet<K, S, A> {
    fn drop(&mut self) {
        // SAFETY: The keys are dropped once and the block is freed right after.
        unsafe {
            self.drop_keys();
            let raw = core::mem::replace(&mut self.raw, RawTable::unallocated());
            raw.free(&self.alloc);
        }
    }
}

impl<K, S, A> PartialEq for SwissSet<K, S, A>
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

impl<K, S, A> Eq for SwissSet<K, S, A>
where
    K: Hash + Eq,
    S: BuildHasher,
    A: Allocator,
{
}

impl<K: Debug, S, A: Allocator> Debug for SwissSet<K, S, A> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_set().entries(self.keys()).finish()
    }
}

impl<K, S, A> Extend<K> for SwissSet<K, S, A>
where
    K: Hash + Eq,
    S: BuildHasher,
    A: Allocator,
{
    /// # Panics
    ///
    /// Panics on capacity overflow and calls the alloc error handler if growth
    /// fails. Use [`add`](SwissSet::add) to handle these.
    fn extend<I: IntoIterator<Item = K>>(&mut self, iter: I) {
        let iter = iter.into_iter();
        infallible(self.reserve(iter.size_hint().0));
        for key in iter {
            infallible(self.add(key));
        }
    }
}

impl<K, S, A> FromIterator<K> for SwissSet<K, S, A>
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

impl<'a, K, S, A: Allocator> IntoIterator for &'a SwissSet<K, S, A> {
    type Item = &'a K;
    type IntoIter = Keys<'a, K>;

    fn into_iter(self) -> Self::IntoIter {
        self.keys()
    }
}

/// An iterator over the keys of a [`SwissSet`], in arbitrary order.
///
/// Created by [`SwissSet::keys`].
pub struct Keys<'a, K> {
    raw: &'a RawTable<K>,
    indices: FullIndices,
}

// SAFETY: The iterator only hands out shared references to keys.
unsafe impl<K: Sync> Send for Keys<'_, K> {}
// SAFETY: As above.
unsafe impl<K: Sync> Sync for Keys<'_, K> {}

impl<K> Clone for Keys<'_, K> {
    fn clone(&self) -> Self {
        Keys {
            raw: self.raw,
            indices: self.indices.clone(),
        }
    }
}

impl<'a, K> Iterator for Keys<'a, K> {
    type Item = &'a K;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        let index = self.indices.next()?;
        // SAFETY: `indices` yields occupied slots of `raw`, which outlives `'a`.
        Some(unsafe { &*self.raw.slot(index) })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.indices.size_hint()
    }
}

impl<K> ExactSizeIterator for Keys<'_, K> {}

impl<K> FusedIterator for Keys<'_, K> {}

#[cfg(test)]
mod tests {
    use alloc::rc::Rc;
    use alloc::string::String;
    use alloc::string::ToString;
    use alloc::vec::Vec;
    use core::cell::Cell;

    use super::*;
    use crate::test_util::BudgetAllocator;
    use crate::test_util::ModelSet;
    use crate::test_util::SipHashBuilder;
    use crate::test_util::ZeroHashBuilder;
    use crate::test_util::check_against_model;

    fn set_with_capacity<K>(capacity: usize) -> SwissSet<K, SipHashBuilder> {
        SwissSet::try_with_capacity_and_hasher_in(
            capacity,
            SipHashBuilder::default(),
            FallbackAllocator::new(),
        )
        .unwrap()
    }

    impl<K, S, A> SwissSet<K, S, A>
    where
        K: Hash + Eq,
        S: BuildHasher,
        A: Allocator,
    {
        fn assert_layout(&self) {
            if !self.raw.is_allocated() {
                assert_eq!(self.count, 0);
                return;
            }

            let mut full = 0;
            let mut deleted = 0;
            for index in 0..self.raw.capacity {
                // SAFETY: `index` is below capacity.
                let ctrl = unsafe { self.raw.ctrl(index) };
                if is_full(ctrl) {
                    full += 1;
                    // SAFETY: The slot is occupied.
                    let key = unsafe { &*self.raw.slot(index) };
                    assert_eq!(ctrl, h2(self.hash_builder.hash_one(key)));
                    assert!(self.contains(key));
                } else if ctrl == DELETED {
                    deleted += 1;
                } else {
                    assert_eq!(ctrl, EMPTY);
                }
            }
            for index in 0..GROUP_WIDTH {
                // SAFETY: Both indices are inside the control bytes.
                unsafe {
                    assert_eq!(
                        self.raw.ctrl(index),
                        self.raw.ctrl(self.raw.capacity + index),
                        "mirror byte {index}"
                    );
                }
            }
            assert_eq!(full, self.count);
            assert_eq!(deleted, self.deleted);
            assert!(self.count + self.deleted <= SwissGrowth::max_load(self.raw.capacity));
        }
    }

    impl<S: BuildHasher, A: Allocator> ModelSet for SwissSet<u64, S, A> {
        fn add(&mut self, key: u64) -> bool {
            SwissSet::add(self, key).unwrap()
        }

        fn remove(&mut self, key: u64) -> bool {
            SwissSet::remove(self, &key)
        }

        fn contains(&self, key: u64) -> bool {
            SwissSet::contains(self, &key)
        }

        fn count(&self) -> usize {
            SwissSet::count(self)
        }

        fn capacity(&self) -> usize {
            SwissSet::capacity(self)
        }

        fn max_load(&self) -> usize {
            SwissGrowth::max_load(SwissSet::capacity(self))
        }

        fn keys(&self) -> Vec<u64> {
            SwissSet::keys(self).copied().collect()
        }

        fn check_invariants(&self) {
            self.assert_layout();
        }
    }

    #[derive(Debug)]
    struct Tracked {
        key: u64,
        drops: Rc<Cell<usize>>,
    }

    impl PartialEq for Tracked {
        fn eq(&self, other: &Self) -> bool {
            self.key == other.key
        }
    }

    impl Eq for Tracked {}

    impl Hash for Tracked {
        fn hash<H: core::hash::Hasher>(&self, state: &mut H) {
            self.key.hash(state);
        }
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.drops.set(self.drops.get() + 1);
        }
    }

    #[test]
    fn new_set_is_unallocated() {
        let set: SwissSet<u64> = SwissSet::new();
        assert_eq!(set.capacity(), 0);
        assert_eq!(set.count(), 0);
        assert!(set.is_empty());
        assert_eq!(set.keys().count(), 0);
        assert_eq!(set.allocator().outstanding(), 0);
    }

    #[test]
    fn with_capacity_rounds_up() {
        assert_eq!(set_with_capacity::<u64>(1).capacity(), 16);
        assert_eq!(set_with_capacity::<u64>(16).capacity(), 16);
        assert_eq!(set_with_capacity::<u64>(17).capacity(), 32);
        assert_eq!(set_with_capacity::<u64>(1000).capacity(), 1024);
        assert_eq!(set_with_capacity::<u64>(0).capacity(), 0);
    }

    #[test]
    fn fifty_keys_grow_past_two_doublings() {
        let mut set = set_with_capacity::<u64>(16);
        assert_eq!(set.capacity(), 16);

        for key in 0..50u64 {
            assert_eq!(set.add(key), Ok(true));
        }

        assert_eq!(set.count(), 50);
        assert!(set.capacity() >= 64, "capacity {}", set.capacity());
        for key in 0..50u64 {
            assert!(set.contains(&key), "missing {key}: {set:?}");
        }
        assert!(!set.contains(&50));
        set.assert_layout();
    }

    #[test]
    fn duplicate_add_is_rejected() {
        let mut set = set_with_capacity::<u64>(16);
        assert_eq!(set.add(42), Ok(true));
        assert_eq!(set.add(42), Ok(false));
        assert_eq!(set.count(), 1);
    }

    #[test]
    fn remove_present_and_absent() {
        let mut set = set_with_capacity::<u64>(16);
        for key in 0..8u64 {
            set.add(key).unwrap();
        }

        assert!(!set.remove(&100));
        assert_eq!(set.count(), 8);

        assert!(set.remove(&3));
        assert_eq!(set.count(), 7);
        assert!(!set.contains(&3));
        assert!(!set.remove(&3));
        assert_eq!(set.count(), 7);
        set.assert_layout();
    }

    #[test]
    fn tombstone_is_reused() {
        let mut set = set_with_capacity::<u64>(16);
        assert_eq!(set.add(9), Ok(true));
        assert!(set.remove(&9));
        assert_eq!(set.deleted, 1);

        assert_eq!(set.add(9), Ok(true));
        assert!(set.contains(&9));
        assert_eq!(set.count(), 1);
        assert_eq!(set.deleted, 0);
        set.assert_layout();
    }

    #[test]
    fn tombstone_does_not_hide_later_duplicate() {
        let mut set = SwissSet::with_hasher(ZeroHashBuilder);
        set.ensure_capacity(16).unwrap();
        for key in 0..4u64 {
            set.add(key).unwrap();
        }
        assert!(set.remove(&0));

        // Key 3 sits past the tombstone left by 0 on the shared probe path.
        assert_eq!(set.add(3), Ok(false));
        assert_eq!(set.count(), 3);
        assert_eq!(set.keys().filter(|&&k| k == 3).count(), 1);
    }

    #[test]
    fn tombstone_churn_does_not_grow() {
        let mut set = set_with_capacity::<u64>(16);
        for key in 0..10_000u64 {
            assert_eq!(set.add(key), Ok(true));
            assert!(set.remove(&key));
        }
        assert_eq!(set.capacity(), 16);
        assert!(set.is_empty());
        set.assert_layout();
    }

    #[test]
    #[should_panic(expected = "never allocated")]
    fn contains_on_unallocated_set_panics() {
        let set: SwissSet<u64> = SwissSet::new();
        set.contains(&1);
    }

    #[test]
    #[should_panic(expected = "never allocated")]
    fn remove_on_unallocated_set_panics() {
        let mut set: SwissSet<u64> = SwissSet::new();
        set.remove(&1);
    }

    #[test]
    fn first_add_allocates() {
        let mut set = SwissSet::with_hasher(SipHashBuilder::default());
        assert_eq!(set.add(1u64), Ok(true));
        assert_eq!(set.capacity(), MIN_CAPACITY);
        assert!(set.contains(&1));
    }

    #[test]
    fn clear_keeps_capacity() {
        let mut set = set_with_capacity::<u64>(16);
        for key in 0..40u64 {
            set.add(key).unwrap();
        }
        set.remove(&0);
        let capacity = set.capacity();

        set.clear();
        assert_eq!(set.count(), 0);
        assert_eq!(set.capacity(), capacity);
        assert_eq!(set.keys().count(), 0);
        for key in 0..40u64 {
            assert!(!set.contains(&key));
        }
        set.assert_layout();

        assert_eq!(set.add(5), Ok(true));
        assert!(set.contains(&5));
    }

    #[test]
    fn ensure_capacity_and_reserve() {
        let mut set = SwissSet::with_hasher(SipHashBuilder::default());
        set.ensure_capacity(0).unwrap();
        assert_eq!(set.capacity(), 0);

        set.ensure_capacity(100).unwrap();
        assert_eq!(set.capacity(), 128);
        set.ensure_capacity(50).unwrap();
        assert_eq!(set.capacity(), 128);

        for key in 0..100u64 {
            set.add(key).unwrap();
        }
        set.reserve(100).unwrap();
        assert!(SwissGrowth::max_load(set.capacity()) >= 200);
        let capacity = set.capacity();
        for key in 100..200u64 {
            set.add(key).unwrap();
        }
        assert_eq!(set.capacity(), capacity);
        assert_eq!(set.ensure_capacity(usize::MAX), Err(Error::CapacityOverflow));
        set.assert_layout();
    }

    #[test]
    fn keys_round_trip_strings() {
        let mut set = set_with_capacity::<String>(16);
        let words: Vec<String> = (0..300).map(|i| alloc::format!("key_{i:04}")).collect();
        for word in &words {
            assert_eq!(set.add(word.clone()), Ok(true));
        }

        let mut keys: Vec<String> = set.keys().cloned().collect();
        keys.sort();
        assert_eq!(keys, words);
        assert_eq!(set.keys().len(), 300);

        assert_eq!(set.take(&"key_0007".to_string()), Some("key_0007".to_string()));
        assert_eq!(set.get(&"key_0008".to_string()).map(String::as_str), Some("key_0008"));
        assert_eq!(set.keys().len(), 299);
    }

    #[test]
    fn keys_is_restartable() {
        let set: SwissSet<u32> = (0..20).collect();
        let first: Vec<u32> = set.keys().copied().collect();
        let second: Vec<u32> = (&set).into_iter().copied().collect();
        assert_eq!(first, second);
        assert_eq!(first.len(), 20);
    }

    #[test]
    fn equality_ignores_layout() {
        let mut a = set_with_capacity::<u64>(16);
        let mut b = set_with_capacity::<u64>(1024);
        for key in 0..30u64 {
            a.add(key).unwrap();
            b.add(29 - key).unwrap();
        }
        assert!(a == b);

        b.remove(&0);
        assert!(a != b);
        b.add(100).unwrap();
        assert!(a != b);

        let empty = SwissSet::with_hasher(SipHashBuilder::default());
        let cleared = {
            let mut set = set_with_capacity::<u64>(16);
            set.add(1).unwrap();
            set.clear();
            set
        };
        assert!(empty == cleared);
    }

    #[test]
    fn all_keys_colliding() {
        let mut set = SwissSet::with_hasher(ZeroHashBuilder);
        for key in 0..100u64 {
            assert_eq!(set.add(key), Ok(true));
        }
        for key in 0..100u64 {
            assert!(set.contains(&key));
        }
        for key in (0..100u64).step_by(2) {
            assert!(set.remove(&key));
        }
        for key in 0..100u64 {
            assert_eq!(set.contains(&key), key % 2 == 1);
        }
        set.assert_layout();
    }

    #[test]
    fn allocation_failure_leaves_set_intact() {
        let alloc = BudgetAllocator::new(1);
        let mut set = SwissSet::with_hasher_in(SipHashBuilder::default(), &alloc);

        for key in 0..14u64 {
            assert_eq!(set.add(key), Ok(true));
        }
        assert_eq!(set.capacity(), 16);

        let err = set.add(14).unwrap_err();
        assert!(matches!(err, Error::AllocError { .. }), "{err:?}");
        assert_eq!(set.count(), 14);
        assert_eq!(set.capacity(), 16);
        for key in 0..14u64 {
            assert!(set.contains(&key));
        }
        assert!(!set.contains(&14));

        alloc.refill(1);
        assert_eq!(set.add(14), Ok(true));
        assert_eq!(set.capacity(), 32);
        assert_eq!(alloc.outstanding(), 1);
        set.assert_layout();
    }

    #[cfg(feature = "std")]
    #[test]
    fn panicking_hash_during_rehash_frees_new_block() {
        use core::hash::Hasher;
        use std::panic::AssertUnwindSafe;
        use std::panic::catch_unwind;

        std::thread_local! {
            static FAIL_HASH: Cell<bool> = const { Cell::new(false) };
        }

        #[derive(Debug, PartialEq, Eq)]
        struct Brittle(u64);

        impl Hash for Brittle {
            fn hash<H: Hasher>(&self, state: &mut H) {
                if self.0 == 3 && FAIL_HASH.with(Cell::get) {
                    panic!("hash failure");
                }
                self.0.hash(state);
            }
        }

        let alloc = FallbackAllocator::new();
        {
            let mut set = SwissSet::with_hasher_in(SipHashBuilder::default(), &alloc);
            for key in 0..14u64 {
                set.add(Brittle(key)).unwrap();
            }
            assert_eq!(set.capacity(), 16);
            assert_eq!(alloc.outstanding(), 1);

            // The 15th key forces a growth, which rehashes key 3.
            FAIL_HASH.with(|fail| fail.set(true));
            let result = catch_unwind(AssertUnwindSafe(|| set.add(Brittle(100))));
            FAIL_HASH.with(|fail| fail.set(false));

            assert!(result.is_err());
            assert_eq!(alloc.outstanding(), 1);
            assert_eq!(set.count(), 14);
            assert_eq!(set.capacity(), 16);
            for key in 0..14u64 {
                assert!(set.contains(&Brittle(key)));
            }
            set.assert_layout();

            assert_eq!(set.add(Brittle(100)), Ok(true));
            assert_eq!(set.capacity(), 32);
        }
        assert_eq!(alloc.outstanding(), 0);
    }

    #[test]
    fn allocator_counter_returns_to_zero() {
        let alloc = FallbackAllocator::new();
        {
            let mut set = SwissSet::with_hasher_in(SipHashBuilder::default(), &alloc);
            for key in 0..1000u64 {
                set.add(key).unwrap();
            }
            for key in 0..500u64 {
                set.remove(&key);
            }
            set.ensure_capacity(8192).unwrap();
            set.clear();
            for key in 0..100u64 {
                set.add(key).unwrap();
            }
            assert_eq!(alloc.outstanding(), 1);
        }
        assert_eq!(alloc.outstanding(), 0);
    }

    #[test]
    fn keys_are_dropped_exactly_once() {
        let drops = Rc::new(Cell::new(0));
        let make = |key| Tracked {
            key,
            drops: drops.clone(),
        };

        {
            let mut set = SwissSet::with_hasher(SipHashBuilder::default());
            for key in 0..100u64 {
                set.add(make(key)).unwrap();
            }
            assert_eq!(drops.get(), 0);

            assert_eq!(set.add(make(5)), Ok(false));
            assert_eq!(drops.get(), 1);

            assert!(set.remove(&make(7)));
            // The probe key and the removed key.
            assert_eq!(drops.get(), 3);

            set.clear();
            assert_eq!(drops.get(), 3 + 99);

            for key in 0..10u64 {
                set.add(make(key)).unwrap();
            }
        }
        assert_eq!(drops.get(), 3 + 99 + 10);
    }

    #[test]
    fn matches_model() {
        let mut set = set_with_capacity::<u64>(16);
        check_against_model(&mut set, 0x5EED, 20_000, 512);
    }

    #[test]
    fn matches_model_with_collisions() {
        let mut set = SwissSet::with_hasher(ZeroHashBuilder);
        set.ensure_capacity(16).unwrap();
        check_against_model(&mut set, 7, 3_000, 64);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn insert_many() {
        let mut set = set_with_capacity::<u64>(0);
        for key in 0..100_000u64 {
            assert_eq!(set.add(key), Ok(true));
        }
        assert_eq!(set.count(), 100_000);
        assert!(set.count() <= SwissGrowth::max_load(set.capacity()));
        for key in 0..100_000u64 {
            assert!(set.contains(&key));
        }
        assert!(!set.contains(&100_000));
    }

    #[cfg(feature = "stats")]
    #[test]
    fn probe_stats_cover_every_key() {
        let mut set = SwissSet::with_hasher(ZeroHashBuilder);
        for key in 0..10u64 {
            set.add(key).unwrap();
        }
        let stats = set.probe_stats();
        assert_eq!(stats.len, 10);
        assert_eq!(stats.histogram.iter().sum::<usize>(), 10);
        assert_eq!(stats.collisions, 9);
        assert_eq!(stats.max_probe_length, 9);
    }
}
