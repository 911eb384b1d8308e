//! Compile-time capability bits exported by each PAL variant.

bitflags::bitflags! {
    /// Optional behaviours a PAL variant supports.
    ///
    /// The allocator above branches on these at compile time through
    /// [`Pal::FEATURES`](crate::Pal::FEATURES), never at run time.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PalFeatures: u64 {
        /// The OS can deliver low-memory notifications.
        const LOW_MEMORY_NOTIFICATION = 1 << 0;
        /// `reserve` can honour alignments larger than a page.
        const ALIGNED_ALLOCATION = 1 << 1;
        /// Fresh mappings are committed lazily on first touch.
        const LAZY_COMMIT = 1 << 2;
        /// `zero` can replace aligned ranges with fresh anonymous pages in place.
        const FIXED_REMAP_ZERO = 1 << 3;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bits_are_distinct() {
        let all = [
            PalFeatures::LOW_MEMORY_NOTIFICATION,
            PalFeatures::ALIGNED_ALLOCATION,
            PalFeatures::LAZY_COMMIT,
            PalFeatures::FIXED_REMAP_ZERO,
        ];
        let mut seen = PalFeatures::empty();
        for flag in all {
            assert!(!seen.intersects(flag));
            seen |= flag;
        }
        assert_eq!(seen, PalFeatures::all());
    }
}
