/// `ceil(n / d)`, for `d > 0`
pub fn div_ceil(n: u64, d: u64) -> u64 {
    debug_assert!(d != 0);
    n / d + (n % d != 0) as u64
}

/// Number of bytes needed to hold a bitmap of `bits` bits
pub fn bitmap_bytes(bits: u64) -> u64 {
    div_ceil(bits, 8)
}

/// Count the set bits in `b` by clearing the lowest set bit until none remain
pub fn count_bits(mut b: u8) -> u32 {
    let mut count = 0;
    while b != 0 {
        count += 1;
        b &= b - 1;
    }
    count
}

/// Population count over a whole byte buffer. Each byte is counted on its own
/// and the results summed, so the order of `bytes` does not matter.
pub fn count_set_bits(bytes: &[u8]) -> u64 {
    bytes.iter().map(|&b| count_bits(b) as u64).sum()
}

/// Test if `addr` is a multiple of `align`. An `align` of zero never matches.
pub fn is_aligned(addr: u64, align: u64) -> bool {
    align != 0 && addr % align == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn bitmap_bytes_rounds_up() {
        assert_eq!(bitmap_bytes(0), 0);
        assert_eq!(bitmap_bytes(1), 1);
        assert_eq!(bitmap_bytes(8), 1);
        assert_eq!(bitmap_bytes(9), 2);
        assert_eq!(bitmap_bytes(64), 8);
        assert_eq!(bitmap_bytes(65), 9);
    }

    #[test]
    fn count_bits_matches_hand_counts() {
        assert_eq!(count_bits(0), 0);
        assert_eq!(count_bits(0b0000_0111), 3);
        assert_eq!(count_bits(0x80), 1);
        assert_eq!(count_bits(0xff), 8);
    }

    #[test]
    fn alignment() {
        assert!(is_aligned(0x2000, 0x1000));
        assert!(!is_aligned(0x2008, 0x1000));
        assert!(!is_aligned(0x2000, 0));
    }

    proptest! {
        #[test]
        fn bitmap_bytes_is_exact_ceiling(k in 0u64..100_000) {
            let n = bitmap_bytes(k);
            prop_assert!(n * 8 >= k);
            prop_assert!(n == 0 || (n - 1) * 8 < k);
        }

        #[test]
        fn count_bits_agrees_with_count_ones(b in any::<u8>()) {
            prop_assert_eq!(count_bits(b), b.count_ones());
        }

        #[test]
        fn popcount_is_additive(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
            let per_byte: u64 = bytes.iter().map(|&b| count_bits(b) as u64).sum();
            prop_assert_eq!(count_set_bits(&bytes), per_byte);
            let (left, right) = bytes.split_at(bytes.len() / 2);
            prop_assert_eq!(count_set_bits(&bytes), count_set_bits(left) + count_set_bits(right));
        }

        #[test]
        fn popcount_ignores_byte_order(
            (bytes, perm) in proptest::collection::vec(any::<u8>(), 1..128)
                .prop_flat_map(|v| {
                    let len = v.len();
                    (Just(v), Just((0..len).collect::<Vec<_>>()).prop_shuffle())
                })
        ) {
            let permuted: Vec<u8> = perm.iter().map(|&i| bytes[i]).collect();
            prop_assert_eq!(count_set_bits(&bytes), count_set_bits(&permuted));
        }
    }
}
