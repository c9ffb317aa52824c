//! Store configuration, per §6's "Configuration recognized by the core" table.
//!
//! Follows the teacher's one-struct-per-concern `Default` convention
//! (`database::cache::CacheConfig`), but unified into a single [`Config`] because the
//! core builds one layered stack per bucket, not several independently-tunable
//! subsystems.

use crate::clock::ms;
use crate::credentials::CredentialProvider;
use crate::error::{Result, StoreError};
use crate::logger::{GlobalLogger, Logger};
use std::sync::Arc;
use std::time::Duration;

/// Top-level store configuration. Construct with [`Config::new`] and override fields
/// (builder-style `with_*` methods) before passing to
/// [`crate::builder::create_store`].
#[derive(Clone)]
pub struct Config {
    // --- object store identity ---
    /// Block size `B` in bytes; must be a power of two (§3).
    pub block_size: u32,
    /// Block count `N`; the store exposes `N * block_size` bytes (§3).
    pub num_blocks: u64,
    /// AWS region the bucket lives in.
    pub region: String,
    /// Bucket name.
    pub bucket: String,
    /// Key prefix prepended to every block key (§4.4/§6).
    pub prefix: String,

    // --- credentials ---
    /// Access key; ignored if `credentials` is set explicitly via
    /// [`Config::with_credential_provider`].
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub session_token: Option<String>,
    credential_provider: Option<Arc<dyn CredentialProvider>>,

    // --- payload transforms (§4.4) ---
    pub compress: bool,
    pub compression_level: u32,
    /// Objects shorter than this are stored raw even when `compress` is set.
    pub compression_threshold: usize,
    pub encrypt: bool,
    pub password: Option<String>,
    /// Derived-key length in bytes (16, 24, or 32 for AES-128/192/256).
    pub key_length: usize,

    // --- block cache (§4.1) ---
    pub cache_size: usize,
    pub num_threads: usize,
    pub write_delay: Duration,
    pub max_dirty: usize,
    pub read_ahead: usize,
    pub read_ahead_trigger: u32,
    pub synchronous: bool,
    pub no_verify: bool,
    pub recover_dirty_blocks: bool,

    // --- EC protect (§4.3) ---
    pub ec_protect: bool,
    pub min_write_delay: Duration,
    pub md5_cache_size: usize,

    // --- zero cache (§4.2) ---
    pub zero_cache: bool,
    /// Above this many blocks the zero cache degrades to a no-op rather than scanning
    /// the whole bucket at start (§4.2: "up to a configured maximum, else the layer
    /// becomes a no-op").
    pub zero_cache_max_blocks: u64,

    // --- misc ---
    pub read_only: bool,
    pub max_retry_pause: Duration,
    pub timeout: Duration,

    // --- injected collaborators (§6) ---
    logger: Arc<dyn Logger>,
}

impl Config {
    /// A new configuration for the given bucket, with the conservative defaults implied
    /// by §8's end-to-end scenarios (`cache_size=16`, one worker, `write_delay=100ms`,
    /// `min_write_delay=200ms`) generalized to sane production values.
    pub fn new(bucket: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            block_size: 4096,
            num_blocks: 1 << 20,
            region: region.into(),
            bucket: bucket.into(),
            prefix: String::new(),

            access_key: None,
            secret_key: None,
            session_token: None,
            credential_provider: None,

            compress: false,
            compression_level: 6,
            compression_threshold: 64,
            encrypt: false,
            password: None,
            key_length: 32,

            cache_size: 1000,
            num_threads: 4,
            write_delay: ms(250),
            max_dirty: 4000,
            read_ahead: 4,
            read_ahead_trigger: 2,
            synchronous: false,
            no_verify: false,
            recover_dirty_blocks: false,

            ec_protect: true,
            min_write_delay: ms(1000),
            md5_cache_size: 1000,

            zero_cache: true,
            zero_cache_max_blocks: 1 << 24,

            read_only: false,
            max_retry_pause: Duration::from_secs(30),
            timeout: Duration::from_secs(30),

            logger: GlobalLogger::shared(),
        }
    }

    pub fn with_credential_provider(mut self, provider: Arc<dyn CredentialProvider>) -> Self {
        self.credential_provider = Some(provider);
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn logger(&self) -> Arc<dyn Logger> {
        self.logger.clone()
    }

    /// Resolves the configured [`CredentialProvider`], falling back to the static
    /// `access_key`/`secret_key`/`session_token` fields.
    pub fn credential_provider(&self) -> Result<Arc<dyn CredentialProvider>> {
        if let Some(provider) = &self.credential_provider {
            return Ok(provider.clone());
        }
        let access_key = self
            .access_key
            .clone()
            .ok_or_else(|| StoreError::config("no access_key or credential_provider configured"))?;
        let secret_key = self
            .secret_key
            .clone()
            .ok_or_else(|| StoreError::config("no secret_key or credential_provider configured"))?;
        Ok(Arc::new(crate::credentials::StaticCredentials::new(
            access_key,
            secret_key,
            self.session_token.clone(),
        )))
    }

    /// Validates field combinations that would otherwise surface as confusing runtime
    /// errors deep in a layer, per §7's `CONFIG` error kind.
    pub fn validate(&self) -> Result<()> {
        if !self.block_size.is_power_of_two() {
            return Err(StoreError::config(format!(
                "block_size {} is not a power of two",
                self.block_size
            )));
        }
        if self.num_blocks == 0 {
            return Err(StoreError::config("num_blocks must be nonzero"));
        }
        if self.bucket.is_empty() {
            return Err(StoreError::config("bucket must not be empty"));
        }
        if self.encrypt && self.password.is_none() {
            return Err(StoreError::config("encrypt=true requires a password"));
        }
        if ![16, 24, 32].contains(&self.key_length) {
            return Err(StoreError::config("key_length must be 16, 24, or 32"));
        }
        if self.num_threads == 0 {
            return Err(StoreError::config("num_threads must be nonzero"));
        }
        if self.max_dirty == 0 {
            return Err(StoreError::config("max_dirty must be nonzero"));
        }
        if self.cache_size == 0 {
            return Err(StoreError::config("cache_size must be nonzero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = Config::new("my-bucket", "us-east-1");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn non_power_of_two_block_size_is_rejected() {
        let mut cfg = Config::new("my-bucket", "us-east-1");
        cfg.block_size = 4097;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn encryption_without_password_is_rejected() {
        let mut cfg = Config::new("my-bucket", "us-east-1");
        cfg.encrypt = true;
        assert_eq!(cfg.validate().unwrap_err().kind(), crate::error::ErrorKind::Config);
    }
}
