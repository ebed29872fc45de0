//! Key and value descriptors
//!
//! A descriptor tells a map how to turn its keys and values into bytes and
//! back, how to compare them and (for keys) how to hash them.

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{DurableError, Result};

/// Serialization and equality for one item type
pub trait DataDescriptor {
    type Item;

    /// Append the encoded item to `out`
    fn to_bytes(&self, item: &Self::Item, out: &mut Vec<u8>) -> Result<()>;

    fn from_bytes(&self, bytes: &[u8]) -> Result<Self::Item>;

    fn equal(&self, a: &Self::Item, b: &Self::Item) -> bool;
}

/// Descriptor for map keys
///
/// Keys that are `equal` must hash identically. Distinct keys may share a
/// hash; the maps tell them apart by comparing the stored key.
pub trait KeyDescriptor: DataDescriptor {
    fn hash(&self, key: &Self::Item) -> u64;
}

/// Default key hash over the encoded bytes
pub fn hash_bytes(bytes: &[u8]) -> u64 {
    xxhash_rust::xxh3::xxh3_64(bytes)
}

// =============================================================================
// Built-in Descriptors
// =============================================================================

/// UTF-8 strings
#[derive(Debug, Clone, Copy, Default)]
pub struct Utf8Descriptor;

impl DataDescriptor for Utf8Descriptor {
    type Item = String;

    fn to_bytes(&self, item: &String, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(item.as_bytes());
        Ok(())
    }

    fn from_bytes(&self, bytes: &[u8]) -> Result<String> {
        String::from_utf8(bytes.to_vec())
            .map_err(|e| DurableError::Serialization(format!("invalid UTF-8: {}", e)))
    }

    fn equal(&self, a: &String, b: &String) -> bool {
        a == b
    }
}

impl KeyDescriptor for Utf8Descriptor {
    fn hash(&self, key: &String) -> u64 {
        hash_bytes(key.as_bytes())
    }
}

/// Raw byte strings
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesDescriptor;

impl DataDescriptor for BytesDescriptor {
    type Item = Vec<u8>;

    fn to_bytes(&self, item: &Vec<u8>, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(item);
        Ok(())
    }

    fn from_bytes(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        Ok(bytes.to_vec())
    }

    fn equal(&self, a: &Vec<u8>, b: &Vec<u8>) -> bool {
        a == b
    }
}

impl KeyDescriptor for BytesDescriptor {
    fn hash(&self, key: &Vec<u8>) -> u64 {
        hash_bytes(key)
    }
}

macro_rules! int_descriptor {
    ($name:ident, $ty:ty, $doc:literal) => {
        #[doc = $doc]
        #[derive(Debug, Clone, Copy, Default)]
        pub struct $name;

        impl DataDescriptor for $name {
            type Item = $ty;

            fn to_bytes(&self, item: &$ty, out: &mut Vec<u8>) -> Result<()> {
                out.extend_from_slice(&item.to_le_bytes());
                Ok(())
            }

            fn from_bytes(&self, bytes: &[u8]) -> Result<$ty> {
                let raw = <[u8; std::mem::size_of::<$ty>()]>::try_from(bytes).map_err(|_| {
                    DurableError::Serialization(format!(
                        "expected {} bytes for {}, got {}",
                        std::mem::size_of::<$ty>(),
                        stringify!($ty),
                        bytes.len()
                    ))
                })?;
                Ok(<$ty>::from_le_bytes(raw))
            }

            fn equal(&self, a: &$ty, b: &$ty) -> bool {
                a == b
            }
        }

        impl KeyDescriptor for $name {
            fn hash(&self, key: &$ty) -> u64 {
                hash_bytes(&key.to_le_bytes())
            }
        }
    };
}

int_descriptor!(U32Descriptor, u32, "Little-endian `u32`");
int_descriptor!(U64Descriptor, u64, "Little-endian `u64`");

/// Any serde type, encoded with bincode
///
/// Equality and hashing work on the encoded bytes, so two items are the same
/// key exactly when they serialize identically.
pub struct BincodeDescriptor<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> BincodeDescriptor<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for BincodeDescriptor<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for BincodeDescriptor<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T: Serialize + DeserializeOwned> DataDescriptor for BincodeDescriptor<T> {
    type Item = T;

    fn to_bytes(&self, item: &T, out: &mut Vec<u8>) -> Result<()> {
        bincode::serialize_into(out, item)?;
        Ok(())
    }

    fn from_bytes(&self, bytes: &[u8]) -> Result<T> {
        Ok(bincode::deserialize(bytes)?)
    }

    fn equal(&self, a: &T, b: &T) -> bool {
        match (bincode::serialize(a), bincode::serialize(b)) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
}

impl<T: Serialize + DeserializeOwned> KeyDescriptor for BincodeDescriptor<T> {
    /// Hash of the bincode encoding
    ///
    /// A key bincode cannot encode hashes to 0. Such a key never reaches
    /// storage: writes encode the key first and fail with `Serialization`,
    /// and lookups find nothing because `equal` never matches it.
    fn hash(&self, key: &T) -> u64 {
        bincode::serialize(key)
            .map(|bytes| hash_bytes(&bytes))
            .unwrap_or(0)
    }
}
