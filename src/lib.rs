//! # blockbucket
//!
//! An S3-backed block device store: a layered `BlockStore` implementation translating
//! fixed-size block reads and writes into signed REST calls against an S3-compatible
//! object store, with write-back caching, read-ahead, eventual-consistency protection,
//! and all-zero-block elision in front of it.
//!
//! ## Architecture
//!
//! - `block`: block addressing and object-key formatting
//! - `digest`: the block content digest used for change detection and integrity checks
//! - `error`: the crate's error kind and result type
//! - `clock`: an injectable time source, real and mock
//! - `logger`: an injectable log sink forwarding to the `log` facade by default
//! - `credentials`: AWS credential providers (static, environment, IAM role)
//! - `config`: store configuration and validation
//! - `http_io`: the bottom layer — signed HTTP requests against the object store
//! - `zero_cache`: elides I/O for all-zero blocks via a dense bitmap
//! - `ec_protect`: compensates for object-store eventual consistency
//! - `cache`: write-back block cache with read-ahead
//! - `store`: the `BlockStore` trait every layer implements
//! - `builder`: assembles the configured layer stack into one `BlockStore`

#![warn(missing_docs)]

/// Block addressing and object-key formatting.
pub mod block;

/// The store's error kind and result type.
pub mod error;

/// An injectable time source.
pub mod clock;

/// An injectable log sink.
pub mod logger;

/// AWS credential providers.
pub mod credentials;

/// The block content digest.
pub mod digest;

/// The `BlockStore` trait every layer implements.
pub mod store;

/// Store configuration and validation.
pub mod config;

/// The bottom layer: signed HTTP requests against the object store.
pub mod http_io;

/// Elides I/O for all-zero blocks.
pub mod zero_cache;

/// Compensates for object-store eventual consistency.
pub mod ec_protect;

/// Write-back block cache with read-ahead.
pub mod cache;

/// Assembles the configured layer stack into one `BlockStore`.
pub mod builder;

/// Test doubles shared by this crate's own unit tests and `tests/` integration tests.
#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use block::BlockIndex;
pub use builder::create_store;
pub use config::Config;
pub use digest::BlockDigest;
pub use error::{ErrorKind, Result, StoreError};
pub use store::{BlockSink, BlockStore, ReadOutcome};

/// The crate's package version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
