//! Size classes (C5): the fixed table of small-object bins and the
//! byte-size → class lookup used to route an allocation request.
//!
//! Classes are fixed at init, exactly as spec.md §3 describes: 16..256
//! step 16, 288..512 step 32, 576..4096 step 64. Bin sizes are strictly
//! increasing and every bin size is a multiple of 16 (the intrusive
//! free-list next-pointer needs at least a pointer's worth of storage).
use static_assertions::const_assert;

/// Sizes above this many bytes are never small; they are routed to the
/// large tier.
pub const SMALL_LIMIT: usize = 4096;

/// Index into the fixed size-class table.
pub type ClassIndex = usize;

const_assert!(SMALL_LIMIT % 16 == 0);

fn build_bin_sizes() -> Vec<u32> {
    let mut sizes = Vec::new();

    let mut s = 16u32;
    while s <= 256 {
        sizes.push(s);
        s += 16;
    }

    let mut s = 288u32;
    while s <= 512 {
        sizes.push(s);
        s += 32;
    }

    let mut s = 576u32;
    while s <= SMALL_LIMIT as u32 {
        sizes.push(s);
        s += 64;
    }

    sizes
}

fn build_lookup_table(bin_sizes: &[u32]) -> Vec<Option<u16>> {
    // One entry per byte size in [0, SMALL_LIMIT], plus the table is
    // indexed directly by requested size, so it has SMALL_LIMIT + 1 slots.
    let mut table = vec![None; SMALL_LIMIT + 1];

    let mut class = 0usize;
    for (i, slot) in table.iter_mut().enumerate() {
        if i == 0 {
            // A zero-byte request is never small; callers must ask for at
            // least one byte.
            continue;
        }

        while (bin_sizes[class] as usize) < i {
            class += 1;
        }

        *slot = Some(class as u16);
    }

    table
}

/// The greatest power of two dividing `bin_size`: the alignment every
/// pointer handed out by this class naturally satisfies.
pub fn natural_alignment(bin_size: u32) -> usize {
    1usize << bin_size.trailing_zeros()
}

pub struct SizeClasses {
    bin_sizes: Vec<u32>,
    lookup: Vec<Option<u16>>,
}

lazy_static::lazy_static! {
    pub static ref CLASSES: SizeClasses = {
        let bin_sizes = build_bin_sizes();
        let lookup = build_lookup_table(&bin_sizes);

        for window in bin_sizes.windows(2) {
            assert!(window[0] < window[1], "size classes must strictly increase");
        }
        for &size in &bin_sizes {
            assert_eq!(size % 16, 0, "bin sizes must be multiples of 16");
        }

        SizeClasses { bin_sizes, lookup }
    };
}

impl SizeClasses {
    #[inline]
    pub fn count(&self) -> usize {
        self.bin_sizes.len()
    }

    #[inline]
    pub fn bin_size(&self, class: ClassIndex) -> u32 {
        self.bin_sizes[class]
    }

    #[inline]
    pub fn natural_alignment(&self, class: ClassIndex) -> usize {
        natural_alignment(self.bin_sizes[class])
    }

    /// Maps a requested byte size to a class index, or `None` if the
    /// request belongs to the large tier (zero, or above `SMALL_LIMIT`).
    #[inline]
    pub fn class_for_size(&self, size: usize) -> Option<ClassIndex> {
        if size == 0 || size > SMALL_LIMIT {
            return None;
        }

        self.lookup[size].map(|c| c as ClassIndex)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn classes_strictly_increase() {
        assert!(CLASSES.count() > 0);
        for i in 1..CLASSES.count() {
            assert!(CLASSES.bin_size(i) > CLASSES.bin_size(i - 1));
        }
    }

    #[test]
    fn bin_sizes_are_multiples_of_16() {
        for i in 0..CLASSES.count() {
            assert_eq!(CLASSES.bin_size(i) % 16, 0);
        }
    }

    #[test]
    fn lookup_rounds_up_to_the_next_class() {
        assert_eq!(CLASSES.bin_size(CLASSES.class_for_size(1).unwrap()), 16);
        assert_eq!(CLASSES.bin_size(CLASSES.class_for_size(16).unwrap()), 16);
        assert_eq!(CLASSES.bin_size(CLASSES.class_for_size(17).unwrap()), 32);
        assert_eq!(CLASSES.bin_size(CLASSES.class_for_size(257).unwrap()), 288);
        assert_eq!(CLASSES.bin_size(CLASSES.class_for_size(513).unwrap()), 576);
        assert_eq!(CLASSES.bin_size(CLASSES.class_for_size(4096).unwrap()), 4096);
    }

    #[test]
    fn zero_and_oversize_are_not_small() {
        assert_eq!(CLASSES.class_for_size(0), None);
        assert_eq!(CLASSES.class_for_size(SMALL_LIMIT + 1), None);
    }

    #[test]
    fn natural_alignment_matches_spec_example() {
        // bin 576 -> natural alignment 64 (greatest power of two dividing 576).
        assert_eq!(natural_alignment(576), 64);
        assert_eq!(natural_alignment(16), 16);
        assert_eq!(natural_alignment(4096), 4096);
    }
}
