//! Small free-standing helpers shared across the allocator stack.

#[macro_export]
macro_rules! round_up {
    ($num:expr, $s:expr) => {
        (($num + $s - 1) / $s) * $s
    };
}

#[macro_export]
macro_rules! round_down {
    ($num:expr, $s:expr) => {
        $num - ($num % $s)
    };
}

pub trait PowersOf2 {
    /// Floor of log base 2, i.e. the index of the highest set bit.
    fn log2(self) -> u8;
    /// True if `self` is a non-zero power of two.
    fn is_power_of_two(self) -> bool;
}

impl PowersOf2 for usize {
    #[cfg(target_pointer_width = "64")]
    fn log2(self) -> u8 {
        63 - self.leading_zeros() as u8
    }

    #[cfg(target_pointer_width = "32")]
    fn log2(self) -> u8 {
        31 - self.leading_zeros() as u8
    }

    fn is_power_of_two(self) -> bool {
        self != 0 && (self & (self - 1)) == 0
    }
}

/// Index of the freelist that must be scanned to satisfy an allocation of
/// `len` with an instant-fit policy: the lowest non-empty freelist at or
/// above `len`'s bucket, found via `ctz(bitmap & !(ceil_pow2(len) - 1))`.
pub fn index_of_nonempty_freelist_instant_fit(bitmap: usize, len: usize) -> Option<u8> {
    let threshold = ceil_pow2(len) - 1;
    let candidates = bitmap & !threshold;
    if candidates == 0 {
        None
    } else {
        Some(candidates.trailing_zeros() as u8)
    }
}

/// Smallest power of two `>= n` (for `n >= 1`).
pub fn ceil_pow2(n: usize) -> usize {
    debug_assert!(n > 0);
    if n.is_power_of_two() {
        n
    } else {
        1usize << (n.log2() + 1)
    }
}

/// Index of the freelist that holds tags with `2^i <= len < 2^(i+1)`.
pub fn index_of_freelist_containing_len(len: usize) -> u8 {
    debug_assert!(len > 0);
    len.log2()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ceil_pow2_exact_and_rounded() {
        assert_eq!(ceil_pow2(1), 1);
        assert_eq!(ceil_pow2(2), 2);
        assert_eq!(ceil_pow2(3), 4);
        assert_eq!(ceil_pow2(33), 64);
        assert_eq!(ceil_pow2(64), 64);
    }

    #[test]
    fn freelist_index_buckets() {
        assert_eq!(index_of_freelist_containing_len(1), 0);
        assert_eq!(index_of_freelist_containing_len(2), 1);
        assert_eq!(index_of_freelist_containing_len(3), 1);
        assert_eq!(index_of_freelist_containing_len(4), 2);
        assert_eq!(index_of_freelist_containing_len(32), 5);
    }

    #[test]
    fn instant_fit_skips_empty_low_buckets() {
        // Bucket 5 (32..64) is empty, bucket 6 (64..128) has a tag.
        let bitmap = 1usize << 6;
        assert_eq!(index_of_nonempty_freelist_instant_fit(bitmap, 40), Some(6));
    }

    #[test]
    fn instant_fit_none_when_nothing_big_enough() {
        let bitmap = 1usize << 2;
        assert_eq!(index_of_nonempty_freelist_instant_fit(bitmap, 40), None);
    }
}
