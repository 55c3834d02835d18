//! Batched compares over a window of control bytes.
//!
//! The SSE2 version is used on x86_64 whenever the target has SSE2; the
//! portable version is always compiled so the two can be checked against each
//! other.

use crate::control::EMPTY;

/// Number of control bytes examined per probe step.
pub(crate) const GROUP_WIDTH: usize = 16;

/// One bit per slot of a group, lowest bit first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct BitMask(pub(crate) u16);

impl BitMask {
    #[inline(always)]
    pub(crate) fn any_bit_set(self) -> bool {
        self.0 != 0
    }

    #[inline(always)]
    pub(crate) fn lowest_set_bit(self) -> Option<usize> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros() as usize)
        }
    }
}

impl Iterator for BitMask {
    type Item = usize;

    #[inline(always)]
    fn next(&mut self) -> Option<usize> {
        let bit = self.lowest_set_bit()?;
        self.0 &= self.0 - 1;
        Some(bit)
    }
}

#[cfg_attr(
    all(target_arch = "x86_64", target_feature = "sse2"),
    allow(dead_code)
)]
pub(crate) mod generic {
    use super::BitMask;
    use super::EMPTY;
    use super::GROUP_WIDTH;

    #[derive(Clone, Copy)]
    pub(crate) struct Group([u8; GROUP_WIDTH]);

    impl Group {
        /// Loads a group starting at `ptr`.
        ///
        /// # Safety
        ///
        /// `ptr` must be valid for reads of `GROUP_WIDTH` bytes.
        #[inline(always)]
        pub(crate) unsafe fn load(ptr: *const u8) -> Self {
            // SAFETY: Caller guarantees `GROUP_WIDTH` readable bytes.
            Group(unsafe { ptr.cast::<[u8; GROUP_WIDTH]>().read_unaligned() })
        }

        #[inline(always)]
        fn mask_where(&self, pred: impl Fn(u8) -> bool) -> BitMask {
            let mut bits: u16 = 0;
            for (i, &byte) in self.0.iter().enumerate() {
                if pred(byte) {
                    bits |= 1 << i;
                }
            }
            BitMask(bits)
        }

        #[inline(always)]
        pub(crate) fn match_byte(&self, byte: u8) -> BitMask {
            self.mask_where(|b| b == byte)
        }

        #[inline(always)]
        pub(crate) fn match_empty(&self) -> BitMask {
            self.mask_where(|b| b == EMPTY)
        }

        #[inline(always)]
        pub(crate) fn match_empty_or_deleted(&self) -> BitMask {
            self.mask_where(|b| b & 0x80 != 0)
        }

        #[inline(always)]
        pub(crate) fn match_full(&self) -> BitMask {
            self.mask_where(|b| b & 0x80 == 0)
        }
    }
}

#[cfg(all(target_arch = "x86_64", target_feature = "sse2"))]
pub(crate) mod sse2 {
    use core::arch::x86_64::*;

    use super::BitMask;
    use super::EMPTY;

    #[derive(Clone, Copy)]
    pub(crate) struct Group(__m128i);

    impl Group {
        /// Loads a group starting at `ptr`.
        ///
        /// # Safety
        ///
        /// `ptr` must be valid for reads of `GROUP_WIDTH` bytes.
        #[inline(always)]
        pub(crate) unsafe fn load(ptr: *const u8) -> Self {
            // SAFETY: Caller guarantees 16 readable bytes; the load is unaligned.
            Group(unsafe { _mm_loadu_si128(ptr.cast::<__m128i>()) })
        }

        #[inline(always)]
        pub(crate) fn match_byte(&self, byte: u8) -> BitMask {
            // SAFETY: SSE2 is statically enabled for this module.
            unsafe {
                let cmp = _mm_cmpeq_epi8(self.0, _mm_set1_epi8(byte as i8));
                BitMask(_mm_movemask_epi8(cmp) as u16)
            }
        }

        #[inline(always)]
        pub(crate) fn match_empty(&self) -> BitMask {
            self.match_byte(EMPTY)
        }

        /// Both markers have the sign bit set, occupied bytes never do.
        #[inline(always)]
        pub(crate) fn match_empty_or_deleted(&self) -> BitMask {
            // SAFETY: SSE2 is statically enabled for this module.
            unsafe { BitMask(_mm_movemask_epi8(self.0) as u16) }
        }

        #[inline(always)]
        pub(crate) fn match_full(&self) -> BitMask {
            BitMask(!self.match_empty_or_deleted().0)
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "x86_64", target_feature = "sse2"))] {
        pub(crate) use sse2::Group;
    } else {
        pub(crate) use generic::Group;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::DELETED;

    fn sample() -> [u8; GROUP_WIDTH] {
        [
            0x00, EMPTY, 0x7F, DELETED, 0x11, 0x11, EMPTY, 0x42, //
            DELETED, 0x01, 0x11, EMPTY, 0x7F, 0x00, 0x33, DELETED,
        ]
    }

    #[test]
    fn bitmask_iterates_lowest_first() {
        let bits: alloc::vec::Vec<usize> = BitMask(0b1000_0000_0010_0101).collect();
        assert_eq!(bits, [0, 2, 5, 15]);
        assert_eq!(BitMask(0).lowest_set_bit(), None);
        assert!(!BitMask(0).any_bit_set());
    }

    #[test]
    fn generic_matches() {
        let bytes = sample();
        // SAFETY: `bytes` holds exactly one group.
        let group = unsafe { generic::Group::load(bytes.as_ptr()) };
        assert_eq!(group.match_byte(0x11), BitMask(0b0000_0100_0011_0000));
        assert_eq!(group.match_empty(), BitMask(0b0000_1000_0100_0010));
        assert_eq!(
            group.match_empty_or_deleted(),
            BitMask(0b1000_1001_0100_1010)
        );
        assert_eq!(group.match_full(), BitMask(!0b1000_1001_0100_1010));
    }

    #[test]
    fn selected_group_agrees_with_generic() {
        let bytes = sample();
        // SAFETY: `bytes` holds exactly one group.
        let (fast, slow) = unsafe {
            (
                Group::load(bytes.as_ptr()),
                generic::Group::load(bytes.as_ptr()),
            )
        };
        for tag in 0..=0x7Fu8 {
            assert_eq!(fast.match_byte(tag), slow.match_byte(tag), "tag {tag:#04x}");
        }
        assert_eq!(fast.match_empty(), slow.match_empty());
        assert_eq!(fast.match_empty_or_deleted(), slow.match_empty_or_deleted());
        assert_eq!(fast.match_full(), slow.match_full());
    }
}
