#![warn(missing_docs)]
#![doc = include_str!("../README.md")]
#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

mod allocator;
mod capacity;
mod control;
mod error;
mod group;
mod robin_hood_set;
#[cfg(feature = "stats")]
mod stats;
mod swiss_set;
#[cfg(test)]
mod test_util;

/// Iterators returned by [`RobinHoodSet::keys`].
pub mod robin_hood {
    pub use crate::robin_hood_set::Keys;
}

/// Iterators returned by [`SwissSet::keys`].
pub mod swiss {
    pub use crate::swiss_set::Keys;
}

pub use allocator::Allocator;
pub use allocator::FallbackAllocator;
pub use error::Error;
pub use robin_hood_set::MAX_FORCED_GROWTHS;
pub use robin_hood_set::RobinHoodSet;
#[cfg(feature = "stats")]
pub use stats::ProbeStats;
pub use swiss_set::SwissSet;

cfg_if::cfg_if! {
    if #[cfg(feature = "foldhash")] {
        /// Hasher builder used when none is given: `foldhash`'s randomly seeded
        /// fast hasher.
        pub type DefaultHashBuilder = foldhash::fast::RandomState;
    } else if #[cfg(feature = "std")] {
        /// Hasher builder used when none is given: the standard library's
        /// randomly keyed SipHash.
        pub type DefaultHashBuilder = std::hash::RandomState;
    } else {
        /// Hasher builder used when none is given: unkeyed SipHash. Enable
        /// `foldhash` or `std` for a randomly seeded hasher.
        #[allow(deprecated)]
        pub type DefaultHashBuilder = core::hash::BuildHasherDefault<core::hash::SipHasher>;
    }
}
