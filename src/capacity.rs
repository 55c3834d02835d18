/// Smallest slot count of an allocated table.
///
/// Keeps every probe window a full [`GROUP_WIDTH`](crate::group::GROUP_WIDTH)
/// wide.
pub(crate) const MIN_CAPACITY: usize = 16;

/// Rounds `value` up to the next power of two by smearing the highest set bit
/// into every lower position.
///
/// Returns `None` if the result does not fit in `usize`. Zero rounds to one.
#[inline]
pub(crate) const fn round_up_pow2(value: usize) -> Option<usize> {
    if value <= 1 {
        return Some(1);
    }

    let mut v = value - 1;
    let mut shift = 1;
    while shift < usize::BITS {
        v |= v >> shift;
        shift <<= 1;
    }
    v.checked_add(1)
}

const fn swiss_max_load_table() -> [usize; usize::BITS as usize] {
    let mut table = [0usize; usize::BITS as usize];
    let mut exp = 0;
    while exp < usize::BITS as usize {
        let capacity = 1usize << exp;
        table[exp] = capacity - capacity / 8;
        exp += 1;
    }
    table
}

/// `7/8 * 2^exp` for every exponent.
static SWISS_MAX_LOAD: [usize; usize::BITS as usize] = swiss_max_load_table();

/// Load-factor rules for one table variant.
pub(crate) trait GrowthPolicy {
    /// Highest number of live entries allowed at `capacity` slots.
    ///
    /// `capacity` must be a power of two.
    fn max_load(capacity: usize) -> usize;

    /// Smallest capacity at or above [`MIN_CAPACITY`] that holds `items`
    /// entries without growing, or `None` on overflow.
    fn capacity_for(items: usize) -> Option<usize> {
        let mut capacity = round_up_pow2(items)?.max(MIN_CAPACITY);
        while Self::max_load(capacity) < items {
            capacity = grown(capacity)?;
        }
        Some(capacity)
    }
}

/// 87.5% load factor of the control-byte table.
pub(crate) struct SwissGrowth;

impl GrowthPolicy for SwissGrowth {
    #[inline(always)]
    fn max_load(capacity: usize) -> usize {
        debug_assert!(capacity.is_power_of_two());
        SWISS_MAX_LOAD[capacity.trailing_zeros() as usize]
    }
}

/// 93.75% load factor of the Robin-Hood table.
pub(crate) struct RobinHoodGrowth;

impl RobinHoodGrowth {
    /// Whether a table with `capacity` slots must grow before holding `count`
    /// entries.
    #[inline(always)]
    pub(crate) fn should_rehash(count: usize, capacity: usize) -> bool {
        count > Self::max_load(capacity)
    }
}

impl GrowthPolicy for RobinHoodGrowth {
    #[inline(always)]
    fn max_load(capacity: usize) -> usize {
        capacity - capacity / 16
    }
}

/// Next capacity when a table grows.
#[inline]
pub(crate) fn grown(capacity: usize) -> Option<usize> {
    capacity.max(MIN_CAPACITY / 2).checked_mul(2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_to_powers_of_two() {
        assert_eq!(round_up_pow2(0), Some(1));
        assert_eq!(round_up_pow2(1), Some(1));
        assert_eq!(round_up_pow2(2), Some(2));
        assert_eq!(round_up_pow2(3), Some(4));
        assert_eq!(round_up_pow2(17), Some(32));
        assert_eq!(round_up_pow2(1 << 20), Some(1 << 20));
        assert_eq!(round_up_pow2((1 << 20) + 1), Some(1 << 21));
        assert_eq!(round_up_pow2(usize::MAX), None);
        for value in 1..5000usize {
            assert_eq!(round_up_pow2(value), Some(value.next_power_of_two()));
        }
    }

    #[test]
    fn swiss_lookup_matches_seven_eighths() {
        for exp in 4..40 {
            let capacity = 1usize << exp;
            assert_eq!(SwissGrowth::max_load(capacity), capacity / 8 * 7);
        }
        assert_eq!(SwissGrowth::max_load(16), 14);
    }

    #[test]
    fn robin_hood_threshold() {
        assert_eq!(RobinHoodGrowth::max_load(16), 15);
        assert_eq!(RobinHoodGrowth::max_load(64), 60);
        assert!(!RobinHoodGrowth::should_rehash(60, 64));
        assert!(RobinHoodGrowth::should_rehash(61, 64));
    }

    #[test]
    fn capacity_for_respects_minimum_and_load() {
        assert_eq!(SwissGrowth::capacity_for(0), Some(16));
        assert_eq!(SwissGrowth::capacity_for(14), Some(16));
        assert_eq!(SwissGrowth::capacity_for(15), Some(32));
        assert_eq!(SwissGrowth::capacity_for(100), Some(128));
        assert_eq!(SwissGrowth::capacity_for(113), Some(256));
        assert_eq!(RobinHoodGrowth::capacity_for(15), Some(16));
        assert_eq!(RobinHoodGrowth::capacity_for(16), Some(32));
        assert_eq!(SwissGrowth::capacity_for(usize::MAX), None);
    }

    #[test]
    fn growth_doubles() {
        assert_eq!(grown(16), Some(32));
        assert_eq!(grown(1 << 30), Some(1 << 31));
        assert_eq!(grown(usize::MAX / 2 + 1), None);
    }
}
