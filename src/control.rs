//! Control-byte encoding and hash splitting.

/// Control byte of a slot that has never held a key since the last rehash or
/// clear.
///
/// Chosen as 0x80 (sign bit set) so a `movemask` over a group finds empty and
/// deleted slots without a compare.
pub(crate) const EMPTY: u8 = 0x80;

/// Control byte of a tombstone left behind by a removal.
pub(crate) const DELETED: u8 = 0xFE;

/// Bucket selector: the hash without the 7 fingerprint bits.
#[inline(always)]
pub(crate) fn h1(hash: u64) -> usize {
    (hash >> 7) as usize
}

/// 7-bit fingerprint stored in the control byte of an occupied slot.
#[inline(always)]
pub(crate) fn h2(hash: u64) -> u8 {
    (hash & 0x7F) as u8
}

#[inline(always)]
pub(crate) fn is_full(ctrl: u8) -> bool {
    ctrl & 0x80 == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_uses_disjoint_bits() {
        let hash = 0xDEAD_BEEF_CAFE_F00Du64;
        assert_eq!(h2(hash), 0x0D);
        assert_eq!(h1(hash) as u64, hash >> 7);
        assert!(is_full(h2(u64::MAX)));
        assert!(!is_full(EMPTY));
        assert!(!is_full(DELETED));
    }
}
