use core::alloc::Layout;

/// Recoverable failures of the fallible set operations.
///
/// Contract violations (probing a table that was never allocated, freeing a
/// block twice, dropping an allocator with live blocks) are panics and never
/// show up here. A missing key is not an error either: it is reported through
/// the `bool`/`Option` results of the lookup operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The requested capacity does not fit in `usize` or in a [`Layout`].
    #[error("capacity overflow")]
    CapacityOverflow,

    /// The allocator returned null for a non-zero request.
    #[error(
        "allocator returned null for {} bytes aligned to {}",
        .layout.size(),
        .layout.align()
    )]
    AllocError {
        /// The block that could not be allocated.
        layout: Layout,
    },

    /// Robin-Hood probe distance kept saturating after forced growth.
    #[error(
        "probe distance saturated at capacity {capacity} after {forced_growths} forced growth(s)"
    )]
    ProbeExhausted {
        /// Slot count of the table when the insert gave up.
        capacity: usize,
        /// Number of doublings attempted for this insert.
        forced_growths: usize,
    },
}

/// Unwraps the result of an allocating operation for the infallible API
/// surface: allocation failures go through the global alloc error handler,
/// anything else panics.
#[inline]
pub(crate) fn infallible<T>(result: Result<T, Error>) -> T {
    match result {
        Ok(value) => value,
        Err(Error::AllocError { layout }) => alloc::alloc::handle_alloc_error(layout),
        Err(err) => panic!("{err}"),
    }
}

#[cfg(test)]
mod tests {
    use alloc::string::ToString;

    use super::*;

    #[test]
    fn display_messages() {
        assert_eq!(Error::CapacityOverflow.to_string(), "capacity overflow");

        let layout = Layout::from_size_align(272, 16).unwrap();
        assert_eq!(
            Error::AllocError { layout }.to_string(),
            "allocator returned null for 272 bytes aligned to 16"
        );

        assert_eq!(
            Error::ProbeExhausted {
                capacity: 1024,
                forced_growths: 4
            }
            .to_string(),
            "probe distance saturated at capacity 1024 after 4 forced growth(s)"
        );
    }

    #[test]
    #[should_panic(expected = "capacity overflow")]
    fn infallible_panics_on_overflow() {
        let _: () = infallible(Err(Error::CapacityOverflow));
    }
}
