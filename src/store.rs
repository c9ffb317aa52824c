//! The uniform block-store contract (§3) implemented by every layer in the stack, and by
//! [`crate::testing::MockBackend`] in tests.
//!
//! Per §9's design note, this is the "polymorphic contract" behind the stack: a capability
//! set of `{read, write, list_blocks, flush, survey_non_zero, shutdown, destroy}` with one
//! implementation per layer, each owning the layer below it so that `destroy` cascades.

use crate::block::BlockIndex;
use crate::digest::BlockDigest;
use crate::error::Result;

/// The outcome of a [`BlockStore::read`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// `buf` was filled with the block's current contents.
    Filled,
    /// The caller's `expect_digest` matched; `buf` was left untouched.
    NotModified,
}

/// A sink for block indices, used by [`BlockStore::list_blocks`] and
/// [`BlockStore::survey_non_zero`].
pub type BlockSink<'a> = dyn FnMut(BlockIndex) + 'a;

/// The operation set every layer of the stack implements (§3).
pub trait BlockStore: Send + Sync {
    /// Fills `buf` (which must be exactly `block_size` bytes) with the current contents
    /// of block `idx`. If `expect_digest` is supplied and matches the block's current
    /// digest, returns [`ReadOutcome::NotModified`] without touching `buf` or the network.
    /// A block that was never written reads as all-zero, not an error — `NotFound` is
    /// only ever observed internally, never returned from this method.
    fn read(
        &self,
        idx: BlockIndex,
        buf: &mut [u8],
        expect_digest: Option<BlockDigest>,
    ) -> Result<ReadOutcome>;

    /// Writes block `idx`. `data: None` means "all zero" (§3: "payload of length B or
    /// NULL to mean zero"); `data: Some(bytes)` must be exactly `block_size` bytes.
    /// Returns the digest of what was written (the all-zero digest when `data` is
    /// `None`). On success the block is durable at the *next* layer — for a write-back
    /// layer that means queued in its dirty set, which `flush()` will drain.
    fn write(&self, idx: BlockIndex, data: Option<&[u8]>) -> Result<BlockDigest>;

    /// Enumerates every block index currently known to be allocated (i.e. to have a
    /// present object downstream, or a pending write that will produce one).
    fn list_blocks(&self, sink: &mut BlockSink<'_>) -> Result<()>;

    /// Blocks until every write acknowledged before this call is durable downstream.
    /// A fence per §5: `flush(); flush()` is idempotent and the second call returns
    /// promptly with no downstream traffic.
    fn flush(&self) -> Result<()>;

    /// Enumerates every block index currently known *not* to be all-zero.
    fn survey_non_zero(&self, sink: &mut BlockSink<'_>) -> Result<()>;

    /// Quiesces the layer: flushes outstanding writes, stops worker threads, and blocks
    /// new submissions. Cascades to the layer below.
    fn shutdown(&self) -> Result<()>;

    /// Releases any resources held by this layer after `shutdown`. Cascades to the layer
    /// below.
    fn destroy(&self) -> Result<()>;

    /// Advisory hint that block `idx` has been durably written and no longer needs to be
    /// replayed by dirty-block recovery (§9). Layers with nothing to record default to a
    /// no-op; [`crate::http_io::HttpIo`] is the one layer that acts on it.
    fn mark_clean(&self, idx: BlockIndex) -> Result<()> {
        let _ = idx;
        Ok(())
    }
}

impl std::fmt::Debug for dyn BlockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn BlockStore")
    }
}
