use core::alloc::Layout;
use core::ptr::NonNull;
use core::sync::atomic::AtomicUsize;
use core::sync::atomic::Ordering;

/// A source of aligned, offset-adjustable memory blocks.
///
/// Both set types take their backing storage from an `Allocator` instead of
/// the global allocator. The allocator is injected at construction and either
/// owned by the set or borrowed through `&A`; in the latter case the borrow
/// guarantees the allocator outlives every set built on it.
///
/// # Safety
///
/// Implementors must return blocks that are valid for reads and writes of
/// `size` bytes and whose address `p` satisfies `(p + offset) % align == 0`.
/// A block must stay valid until it is passed to [`free`](Allocator::free) on
/// the same allocator.
pub unsafe trait Allocator {
    /// Allocates `size` bytes such that the address `offset` bytes into the
    /// block is aligned to `align`.
    ///
    /// Returns `None` when `size` is zero or when memory is exhausted.
    ///
    /// # Panics
    ///
    /// Panics if `align` is not a power of two.
    fn malloc(&self, size: usize, align: usize, offset: usize) -> Option<NonNull<u8>>;

    /// Releases a block. Freeing null is a no-op.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a block returned by [`malloc`](Allocator::malloc)
    /// on this allocator that has not been freed yet.
    unsafe fn free(&self, ptr: *mut u8);
}

// SAFETY: Forwards to `A`, which upholds the contract.
unsafe impl<A: Allocator + ?Sized> Allocator for &A {
    #[inline]
    fn malloc(&self, size: usize, align: usize, offset: usize) -> Option<NonNull<u8>> {
        (**self).malloc(size, align, offset)
    }

    #[inline]
    unsafe fn free(&self, ptr: *mut u8) {
        // SAFETY: Caller upholds the contract of `free`.
        unsafe { (**self).free(ptr) }
    }
}

/// Bookkeeping stored immediately before every block handed out by
/// [`FallbackAllocator`].
#[derive(Clone, Copy)]
struct Header {
    base: NonNull<u8>,
    size: usize,
}

const HEADER_SIZE: usize = core::mem::size_of::<Header>();

/// Counting allocator over the global allocator.
///
/// Each block is over-allocated by `align - 1` bytes plus a header, so any
/// alignment and offset can be served and [`free`](Allocator::free) does not
/// need the size back. The number of live blocks is tracked and checked when
/// the allocator is dropped.
///
/// # Panics
///
/// Dropping a `FallbackAllocator` that still has outstanding blocks panics.
/// [`free`](Allocator::free) panics when no blocks are outstanding.
///
/// # Safety
///
/// Double frees are only detected through the live-block counter: freeing a
/// block twice panics when the counter is already zero, and is undefined
/// behavior otherwise. Freed blocks go back to the global allocator, so their
/// headers cannot be checked afterwards.
///
/// # Examples
///
/// ```rust
/// use probe_set::Allocator;
/// use probe_set::FallbackAllocator;
///
/// let alloc = FallbackAllocator::new();
/// let block = alloc.malloc(100, 64, 16).unwrap();
/// assert_eq!((block.as_ptr() as usize + 16) % 64, 0);
/// assert_eq!(alloc.outstanding(), 1);
///
/// unsafe { alloc.free(block.as_ptr()) };
/// assert_eq!(alloc.outstanding(), 0);
/// ```
#[derive(Debug, Default)]
pub struct FallbackAllocator {
    outstanding: AtomicUsize,
}

impl FallbackAllocator {
    /// Creates an allocator with no outstanding blocks.
    pub const fn new() -> Self {
        Self {
            outstanding: AtomicUsize::new(0),
        }
    }

    /// Returns the number of blocks allocated and not yet freed.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }

    fn block_layout(size: usize, align: usize) -> Option<Layout> {
        let total = size.checked_add(align - 1)?.checked_add(HEADER_SIZE)?;
        Layout::from_size_align(total, core::mem::align_of::<Header>()).ok()
    }
}

// SAFETY: The returned pointer is `base + HEADER_SIZE + adjust` with
// `adjust < align`, and the block spans `size + align - 1 + HEADER_SIZE`
// bytes, so `size` bytes are always available past it. `adjust` is chosen so
// that `p + offset` is a multiple of `align`.
unsafe impl Allocator for FallbackAllocator {
    fn malloc(&self, size: usize, align: usize, offset: usize) -> Option<NonNull<u8>> {
        assert!(
            align.is_power_of_two(),
            "alignment {align} is not a power of two"
        );
        if size == 0 {
            return None;
        }

        let layout = Self::block_layout(size, align)?;
        // SAFETY: `layout` has a non-zero size.
        let base = NonNull::new(unsafe { alloc::alloc::alloc(layout) })?;

        let misalign = base.as_ptr().addr().wrapping_add(HEADER_SIZE + offset) & (align - 1);
        let adjust = (align - misalign) & (align - 1);

        // SAFETY: `HEADER_SIZE + adjust` stays inside the block (see above), and
        // the header occupies the `HEADER_SIZE` bytes right before `block`,
        // which start at or after `base`.
        let block = unsafe {
            let block = base.add(HEADER_SIZE + adjust);
            block.sub(HEADER_SIZE).cast::<Header>().write_unaligned(Header {
                base,
                size: layout.size(),
            });
            block
        };

        self.outstanding.fetch_add(1, Ordering::Relaxed);
        Some(block)
    }

    unsafe fn free(&self, ptr: *mut u8) {
        let Some(block) = NonNull::new(ptr) else {
            return;
        };

        if self
            .outstanding
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_err()
        {
            panic!("free called with no outstanding allocations");
        }

        // SAFETY: Caller guarantees `block` came from `malloc` on this allocator,
        // so a header written by `malloc` sits right before it and describes the
        // underlying global allocation.
        unsafe {
            let header = block.sub(HEADER_SIZE).cast::<Header>().read_unaligned();
            alloc::alloc::dealloc(
                header.base.as_ptr(),
                Layout::from_size_align_unchecked(header.size, core::mem::align_of::<Header>()),
            );
        }
    }
}

impl Drop for FallbackAllocator {
    fn drop(&mut self) {
        let outstanding = *self.outstanding.get_mut();
        if outstanding == 0 {
            return;
        }

        #[cfg(feature = "std")]
        if std::thread::panicking() {
            return;
        }

        tracing::error!(outstanding, "allocator dropped with live blocks");
        panic!("allocator dropped with {outstanding} outstanding allocation(s)");
    }
}
