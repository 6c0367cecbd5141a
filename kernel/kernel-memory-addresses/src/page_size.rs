use core::fmt;
use core::hash::Hash;

mod sealed {
    pub trait Sealed {}
}

/// Marker trait for the x86-64 translation granularities.
///
/// Implemented by [`Size4K`], [`Size2M`] and [`Size1G`] only; the trait is
/// sealed so generic code can rely on these being the complete set.
pub trait PageSize:
    sealed::Sealed + Clone + Copy + Eq + PartialEq + Ord + PartialOrd + Hash + fmt::Debug
{
    /// Page size in bytes (power of two).
    const SIZE: u64;
    /// `log2(SIZE)`: number of low address bits covered by the page offset.
    const SHIFT: u32;
    /// Number of 4 KiB frames spanned by one page of this size.
    const FRAMES: u64 = Self::SIZE >> 12;

    fn as_str() -> &'static str;
}

macro_rules! page_size {
    ($(#[$doc:meta])* $name:ident, $shift:expr, $label:literal) => {
        $(#[$doc])*
        #[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name;

        impl sealed::Sealed for $name {}

        impl PageSize for $name {
            const SIZE: u64 = 1 << $shift;
            const SHIFT: u32 = $shift;

            fn as_str() -> &'static str {
                $label
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str($label)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str($label)
            }
        }
    };
}

page_size!(
    /// 4 KiB page, mapped by a level-1 entry (or carved out of a larger one).
    Size4K,
    12,
    "4K"
);
page_size!(
    /// 2 MiB page, mapped by a level-2 entry with the size bit set.
    Size2M,
    21,
    "2M"
);
page_size!(
    /// 1 GiB page, mapped by a level-3 entry with the size bit set.
    Size1G,
    30,
    "1G"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_per_page() {
        assert_eq!(Size4K::FRAMES, 1);
        assert_eq!(Size2M::FRAMES, 512);
        assert_eq!(Size1G::FRAMES, 512 * 512);
    }
}
