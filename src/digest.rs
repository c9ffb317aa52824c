//! Content hashing (§3 "Block hash"): an MD5 digest of a block's plaintext payload,
//! persisted in object metadata and used for conditional reads and integrity checks.

use std::fmt;

/// MD5 digest of a block's plaintext payload.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockDigest([u8; 16]);

impl BlockDigest {
    /// The digest of a zero-length (or implicitly all-zero) block. All-zero blocks are
    /// represented by object absence rather than a stored digest, but callers sometimes
    /// need this value for comparison (e.g. an empty read buffer).
    pub fn of_zero_block(block_size: usize) -> Self {
        Self::compute(&vec![0u8; block_size])
    }

    pub fn compute(data: &[u8]) -> Self {
        Self(md5::compute(data).0)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 16] = bytes.try_into().ok()?;
        Some(Self(arr))
    }
}

impl fmt::Debug for BlockDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockDigest({})", self.to_hex())
    }
}

impl fmt::Display for BlockDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl serde::Serialize for BlockDigest {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> serde::Deserialize<'de> for BlockDigest {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).ok_or_else(|| serde::de::Error::custom("invalid hex digest"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_roundtrip() {
        let d = BlockDigest::compute(b"hello world");
        let hex = d.to_hex();
        assert_eq!(BlockDigest::from_hex(&hex), Some(d));
    }

    #[test]
    fn distinct_payloads_hash_differently() {
        let a = BlockDigest::compute(b"payload a");
        let b = BlockDigest::compute(b"payload b");
        assert_ne!(a, b);
    }
}
