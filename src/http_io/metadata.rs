//! The reserved store metadata object (§6): "block size B, block count N, compression
//! flag and level, encryption cipher name, salt bytes, HMAC of the canonical parameter
//! serialization."

use crate::config::Config;
use crate::error::{Result, StoreError};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// The reserved object key holding [`StoreMetadata`], relative to the configured prefix.
pub const METADATA_KEY: &str = ".blockbucket-metadata";

/// Persisted store parameters, written once at first open and read back by every later
/// open to check compatibility (§6).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreMetadata {
    pub block_size: u32,
    pub num_blocks: u64,
    pub compress: bool,
    pub compression_level: u32,
    pub encrypt: bool,
    pub cipher: String,
    pub salt: Vec<u8>,
}

impl StoreMetadata {
    pub fn from_config(config: &Config, salt: Vec<u8>) -> Self {
        Self {
            block_size: config.block_size,
            num_blocks: config.num_blocks,
            compress: config.compress,
            compression_level: config.compression_level,
            encrypt: config.encrypt,
            cipher: if config.encrypt {
                "aes-256-cbc-hmac-sha256".to_string()
            } else {
                "none".to_string()
            },
            salt,
        }
    }

    /// HMAC over the canonical (bincode) serialization, keyed by the password if
    /// encryption is enabled, or a fixed public key otherwise (so the HMAC still detects
    /// accidental corruption of the metadata object even for unencrypted stores).
    fn hmac(&self, password: Option<&str>) -> Result<Vec<u8>> {
        let key = password.unwrap_or("blockbucket-unauthenticated-metadata");
        let encoded = bincode::serialize(self)
            .map_err(|e| StoreError::config(format!("failed to serialize metadata: {e}")))?;
        let mut mac = HmacSha256::new_from_slice(key.as_bytes()).expect("any key length is valid");
        mac.update(&encoded);
        Ok(mac.finalize().into_bytes().to_vec())
    }

    /// Serializes `self` and its HMAC as the JSON object body stored at
    /// [`METADATA_KEY`].
    pub fn to_object_body(&self, password: Option<&str>) -> Result<Vec<u8>> {
        let envelope = MetadataEnvelope {
            metadata: self.clone(),
            hmac: hex::encode(self.hmac(password)?),
        };
        serde_json::to_vec(&envelope).map_err(StoreError::from)
    }

    /// Parses and authenticates a metadata object body previously produced by
    /// [`StoreMetadata::to_object_body`].
    pub fn from_object_body(body: &[u8], password: Option<&str>) -> Result<Self> {
        let envelope: MetadataEnvelope = serde_json::from_slice(body)?;
        let expected = hex::encode(envelope.metadata.hmac(password)?);
        if expected != envelope.hmac {
            return Err(StoreError::integrity("store metadata HMAC mismatch"));
        }
        Ok(envelope.metadata)
    }

    /// Checks `self` (persisted) is compatible with `config` (requested), per §6: "if
    /// present, its values override configured values for compatibility."
    pub fn check_compatible(&self, config: &Config) -> Result<()> {
        if self.block_size != config.block_size {
            return Err(StoreError::config(format!(
                "persisted block_size {} does not match configured {}",
                self.block_size, config.block_size
            )));
        }
        if self.num_blocks != config.num_blocks {
            return Err(StoreError::config(format!(
                "persisted num_blocks {} does not match configured {}",
                self.num_blocks, config.num_blocks
            )));
        }
        if self.encrypt != config.encrypt {
            return Err(StoreError::config(
                "persisted encryption setting does not match configured value",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MetadataEnvelope {
    metadata: StoreMetadata,
    hmac: String,
}

/// Per-block object metadata (§6's "Object metadata carried on each block"), carried as
/// `x-amz-meta-*` headers on the underlying PUT/GET.
#[derive(Debug, Clone, Default)]
pub struct BlockMetadata {
    pub digest_hex: String,
    pub compressed: bool,
    pub original_length: Option<usize>,
    pub encrypted: bool,
    /// Set while a write is in flight and not yet superseded by a later write, per the
    /// open question on dirty-block recovery (see DESIGN.md).
    pub dirty: bool,
}

pub const HEADER_DIGEST: &str = "x-amz-meta-blockbucket-digest";
pub const HEADER_COMPRESSED: &str = "x-amz-meta-blockbucket-compressed";
pub const HEADER_ORIGINAL_LENGTH: &str = "x-amz-meta-blockbucket-original-length";
pub const HEADER_ENCRYPTED: &str = "x-amz-meta-blockbucket-encrypted";
pub const HEADER_DIRTY: &str = "x-amz-meta-blockbucket-dirty";

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config::new("bucket", "us-east-1")
    }

    #[test]
    fn roundtrip_without_password() {
        let meta = StoreMetadata::from_config(&config(), vec![1, 2, 3, 4]);
        let body = meta.to_object_body(None).unwrap();
        let parsed = StoreMetadata::from_object_body(&body, None).unwrap();
        assert_eq!(meta, parsed);
    }

    #[test]
    fn tampering_is_detected() {
        let meta = StoreMetadata::from_config(&config(), vec![9, 9, 9]);
        let mut body = meta.to_object_body(Some("pw")).unwrap();
        // Flip a byte inside the JSON body to simulate corruption in transit/at rest.
        let mid = body.len() / 2;
        body[mid] ^= 1;
        let err = StoreMetadata::from_object_body(&body, Some("pw")).unwrap_err();
        assert!(matches!(
            err.kind(),
            crate::error::ErrorKind::Integrity | crate::error::ErrorKind::Config
        ));
    }

    #[test]
    fn wrong_password_fails_hmac() {
        let meta = StoreMetadata::from_config(&config(), vec![9, 9, 9]);
        let body = meta.to_object_body(Some("right")).unwrap();
        let err = StoreMetadata::from_object_body(&body, Some("wrong")).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Integrity);
    }

    #[test]
    fn incompatible_block_size_is_rejected() {
        let meta = StoreMetadata::from_config(&config(), vec![]);
        let mut cfg = config();
        cfg.block_size = 8192;
        assert!(meta.check_compatible(&cfg).is_err());
    }
}
