//! Key/value layouts.
//!
//! A layout tells the tree how to order keys and how to turn keys and values
//! into bytes. Layouts with a fixed key and value size get the fixed-size node
//! format, everything else gets the dynamic-size format.

use std::cmp::Ordering;
use std::fmt::Debug;

/// Serialization and ordering of the keys and values stored in a tree.
pub trait Layout: Send + Sync + 'static {
    type Key: Clone + Debug + Send + Sync;
    type Value: Clone + Debug + Send + Sync;

    /// Identifies the layout in the meta record.
    fn identifier(&self) -> u64;

    /// Incompatible format changes bump the major version.
    fn major_version(&self) -> u32;

    /// Compatible format changes bump the minor version.
    fn minor_version(&self) -> u32;

    /// `Some((key_size, value_size))` when every key and value has that size.
    fn fixed_key_value_size(&self) -> Option<(usize, usize)>;

    /// Order two keys.
    fn compare(&self, left: &Self::Key, right: &Self::Key) -> Ordering;

    /// Serialized size of a key.
    fn key_size(&self, key: &Self::Key) -> usize;

    /// Serialized size of a value.
    fn value_size(&self, value: &Self::Value) -> usize;

    /// Serialize a key into exactly `key_size(key)` bytes.
    fn write_key(&self, key: &Self::Key, into: &mut [u8]);

    /// Serialize a value into exactly `value_size(value)` bytes.
    fn write_value(&self, value: &Self::Value, into: &mut [u8]);

    /// Deserialize a key from exactly the bytes it was written to.
    fn read_key(&self, from: &[u8]) -> Self::Key;

    /// Deserialize a value from exactly the bytes it was written to.
    fn read_value(&self, from: &[u8]) -> Self::Value;

    /// The smallest key that is greater than `left` and not greater than
    /// `right`, used as separator when a leaf splits between the two.
    fn minimal_splitter(&self, left: &Self::Key, right: &Self::Key) -> Self::Key {
        let _ = left;
        right.clone()
    }

    /// Whether keys and values all have a fixed size.
    fn fixed_size(&self) -> bool {
        self.fixed_key_value_size().is_some()
    }

    /// Serialize a key to a fresh buffer.
    fn key_bytes(&self, key: &Self::Key) -> Vec<u8> {
        let mut buf = vec![0u8; self.key_size(key)];
        self.write_key(key, &mut buf);
        buf
    }

    /// Serialize a value to a fresh buffer.
    fn value_bytes(&self, value: &Self::Value) -> Vec<u8> {
        let mut buf = vec![0u8; self.value_size(value)];
        self.write_value(value, &mut buf);
        buf
    }
}

/// Fixed 8-byte unsigned keys and values.
#[derive(Debug, Clone, Copy, Default)]
pub struct LongLayout;

impl Layout for LongLayout {
    type Key = u64;
    type Value = u64;

    fn identifier(&self) -> u64 {
        u64::from_le_bytes(*b"LONGLONG")
    }

    fn major_version(&self) -> u32 {
        1
    }

    fn minor_version(&self) -> u32 {
        0
    }

    fn fixed_key_value_size(&self) -> Option<(usize, usize)> {
        Some((8, 8))
    }

    fn compare(&self, left: &u64, right: &u64) -> Ordering {
        left.cmp(right)
    }

    fn key_size(&self, _key: &u64) -> usize {
        8
    }

    fn value_size(&self, _value: &u64) -> usize {
        8
    }

    fn write_key(&self, key: &u64, into: &mut [u8]) {
        into.copy_from_slice(&key.to_le_bytes());
    }

    fn write_value(&self, value: &u64, into: &mut [u8]) {
        into.copy_from_slice(&value.to_le_bytes());
    }

    fn read_key(&self, from: &[u8]) -> u64 {
        read_u64(from)
    }

    fn read_value(&self, from: &[u8]) -> u64 {
        read_u64(from)
    }
}

fn read_u64(from: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&from[..8]);
    u64::from_le_bytes(buf)
}

/// Variable-size byte string keys and values, ordered lexicographically.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesLayout;

impl Layout for BytesLayout {
    type Key = Vec<u8>;
    type Value = Vec<u8>;

    fn identifier(&self) -> u64 {
        u64::from_le_bytes(*b"BYTESDYN")
    }

    fn major_version(&self) -> u32 {
        1
    }

    fn minor_version(&self) -> u32 {
        0
    }

    fn fixed_key_value_size(&self) -> Option<(usize, usize)> {
        None
    }

    fn compare(&self, left: &Vec<u8>, right: &Vec<u8>) -> Ordering {
        left.cmp(right)
    }

    fn key_size(&self, key: &Vec<u8>) -> usize {
        key.len()
    }

    fn value_size(&self, value: &Vec<u8>) -> usize {
        value.len()
    }

    fn write_key(&self, key: &Vec<u8>, into: &mut [u8]) {
        into.copy_from_slice(key);
    }

    fn write_value(&self, value: &Vec<u8>, into: &mut [u8]) {
        into.copy_from_slice(value);
    }

    fn read_key(&self, from: &[u8]) -> Vec<u8> {
        from.to_vec()
    }

    fn read_value(&self, from: &[u8]) -> Vec<u8> {
        from.to_vec()
    }

    fn minimal_splitter(&self, left: &Vec<u8>, right: &Vec<u8>) -> Vec<u8> {
        for len in 1..right.len() {
            if right[..len] > left[..] {
                return right[..len].to_vec();
            }
        }
        right.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_long_layout_round_trip() {
        let layout = LongLayout;
        let bytes = layout.key_bytes(&0xDEAD_BEEF);
        assert_eq!(bytes.len(), 8);
        assert_eq!(layout.read_key(&bytes), 0xDEAD_BEEF);
        assert!(layout.fixed_size());
        assert_eq!(layout.compare(&1, &2), Ordering::Less);
    }

    #[test]
    fn test_bytes_minimal_splitter() {
        let layout = BytesLayout;
        let left = b"apple".to_vec();
        let right = b"banana".to_vec();
        assert_eq!(layout.minimal_splitter(&left, &right), b"b".to_vec());

        let left = b"abc".to_vec();
        let right = b"abd".to_vec();
        assert_eq!(layout.minimal_splitter(&left, &right), b"abd".to_vec());

        let left = b"ab".to_vec();
        let right = b"abc".to_vec();
        assert_eq!(layout.minimal_splitter(&left, &right), b"abc".to_vec());
    }

    #[test]
    fn test_bytes_layout_is_dynamic() {
        let layout = BytesLayout;
        assert!(!layout.fixed_size());
        assert_eq!(layout.key_size(&vec![1, 2, 3]), 3);
    }
}
