//! # Key and Value Codec Traits
//!
//! This module defines the record types the index can store. Keys and
//! values are fixed-width: their byte size is a compile-time constant, so
//! page capacity and tree fanout are plain arithmetic and every in-page
//! record lives at a computable offset.
//!
//! ## Keys
//!
//! An [`IndexKey`] is `Copy + Ord` with a codec and a minimum sentinel.
//! The sentinel occupies the first record of every interior node and makes
//! the routing rule uniform: for a lookup key `k`, descend into the child
//! of the greatest stored key `<= k`, which always exists because the
//! sentinel compares below everything.
//!
//! Encoded bytes are never compared directly; records are decoded before
//! comparison, so the encoding does not have to be order-preserving. All
//! multi-byte primitives encode little-endian, matching the file header
//! and page header layouts.
//!
//! ## Values
//!
//! An [`IndexValue`] only needs the codec; values are payload, never
//! ordered.
//!
//! ## Provided Impls
//!
//! `u32`, `u64` and `i64` cover integer-keyed indexes; `[u8; N]` covers
//! fixed-width binary and padded-string records, ordered lexicographically
//! with an all-zeroes minimum.

use std::fmt;

/// A fixed-width, totally ordered key with a minimum sentinel.
pub trait IndexKey: Copy + Ord + fmt::Debug + Send + Sync + 'static {
    /// Encoded width in bytes.
    const SIZE: usize;

    /// The smallest possible key. Stored as the first record of every
    /// interior node.
    const MIN: Self;

    /// Encodes into `buf`, which is exactly `SIZE` bytes.
    fn write_to(&self, buf: &mut [u8]);

    /// Decodes from `buf`, which is exactly `SIZE` bytes.
    fn read_from(buf: &[u8]) -> Self;
}

/// A fixed-width value payload.
pub trait IndexValue: Copy + PartialEq + fmt::Debug + Send + Sync + 'static {
    /// Encoded width in bytes.
    const SIZE: usize;

    /// Encodes into `buf`, which is exactly `SIZE` bytes.
    fn write_to(&self, buf: &mut [u8]);

    /// Decodes from `buf`, which is exactly `SIZE` bytes.
    fn read_from(buf: &[u8]) -> Self;
}

macro_rules! int_index_impls {
    ($($ty:ty),*) => {
        $(
            impl IndexKey for $ty {
                const SIZE: usize = size_of::<$ty>();
                const MIN: Self = <$ty>::MIN;

                fn write_to(&self, buf: &mut [u8]) {
                    buf[..<Self as IndexKey>::SIZE].copy_from_slice(&self.to_le_bytes());
                }

                fn read_from(buf: &[u8]) -> Self {
                    <$ty>::from_le_bytes(buf[..<Self as IndexKey>::SIZE].try_into().unwrap())
                }
            }

            impl IndexValue for $ty {
                const SIZE: usize = size_of::<$ty>();

                fn write_to(&self, buf: &mut [u8]) {
                    buf[..<Self as IndexValue>::SIZE].copy_from_slice(&self.to_le_bytes());
                }

                fn read_from(buf: &[u8]) -> Self {
                    <$ty>::from_le_bytes(buf[..<Self as IndexValue>::SIZE].try_into().unwrap())
                }
            }
        )*
    };
}

int_index_impls!(u32, u64, i64);

impl<const N: usize> IndexKey for [u8; N] {
    const SIZE: usize = N;
    const MIN: Self = [0u8; N];

    fn write_to(&self, buf: &mut [u8]) {
        buf[..N].copy_from_slice(self);
    }

    fn read_from(buf: &[u8]) -> Self {
        buf[..N].try_into().unwrap()
    }
}

impl<const N: usize> IndexValue for [u8; N] {
    const SIZE: usize = N;

    fn write_to(&self, buf: &mut [u8]) {
        buf[..N].copy_from_slice(self);
    }

    fn read_from(buf: &[u8]) -> Self {
        buf[..N].try_into().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip_key<K: IndexKey>(key: K) -> K {
        let mut buf = vec![0u8; K::SIZE];
        key.write_to(&mut buf);
        K::read_from(&buf)
    }

    #[test]
    fn integer_keys_roundtrip() {
        assert_eq!(roundtrip_key(0u64), 0);
        assert_eq!(roundtrip_key(u64::MAX), u64::MAX);
        assert_eq!(roundtrip_key(0xDEAD_BEEFu32), 0xDEAD_BEEF);
        assert_eq!(roundtrip_key(-42i64), -42);
    }

    #[test]
    fn integer_min_sentinel_compares_below_everything() {
        assert!(u64::MIN <= 0);
        assert!(i64::MIN < -1_000_000);
        assert!(<u32 as IndexKey>::MIN <= 1);
    }

    #[test]
    fn byte_array_keys_roundtrip() {
        let key = *b"hello world 1234";
        assert_eq!(roundtrip_key(key), key);
    }

    #[test]
    fn byte_array_min_is_all_zeroes() {
        let min = <[u8; 8] as IndexKey>::MIN;
        assert_eq!(min, [0u8; 8]);
        assert!(min < *b"\x00\x00\x00\x00\x00\x00\x00\x01");
    }

    #[test]
    fn byte_array_order_is_lexicographic() {
        let a = *b"abc\x00";
        let b = *b"abd\x00";
        let c = *b"b\x00\x00\x00";
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn value_encoding_is_little_endian() {
        let mut buf = [0u8; 8];
        IndexValue::write_to(&0x0102_0304_0506_0708u64, &mut buf);
        assert_eq!(buf, [8, 7, 6, 5, 4, 3, 2, 1]);
    }
}
