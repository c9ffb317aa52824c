//! The block cache entry state machine (§4.1).

use crate::digest::BlockDigest;

/// One block cache entry's lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Data present, matches downstream.
    Clean,
    /// Data present, write pending.
    Dirty,
    /// Data present, a worker is propagating it downward.
    Writing,
    /// Newer data superseded the in-flight write; becomes `Dirty` (not `Clean`) on
    /// completion of the current PUT.
    Writing2,
    /// A worker is fetching the block; other callers wait.
    Reading,
    /// Like `Reading`, but a concurrent write arrived; the fetched bytes are discarded
    /// and the entry becomes `Dirty` on completion.
    Reading2,
}

/// A cache entry: `(state, data?, timestamp, verify-hash?)` per §3's tuple, with
/// `waiters` realized as callers parked on the cache's shared condition variable rather
/// than a per-entry list.
pub struct Entry {
    pub state: EntryState,
    /// `None` means all-zero, matching the [`crate::store::BlockStore`] convention.
    pub data: Option<Vec<u8>>,
    /// The payload (and its digest) a concurrent write supplied while this entry was
    /// `Writing` or `Reading`; applied once the in-flight operation completes.
    pub pending: Option<(Option<Vec<u8>>, BlockDigest)>,
    pub digest: Option<BlockDigest>,
    /// Set when the entry enters `Dirty`; used to enforce `write_delay` eligibility.
    pub dirty_since: Option<u64>,
}

impl Entry {
    pub fn reading() -> Self {
        Self {
            state: EntryState::Reading,
            data: None,
            pending: None,
            digest: None,
            dirty_since: None,
        }
    }

    pub fn writing() -> Self {
        Self {
            state: EntryState::Writing,
            data: None,
            pending: None,
            digest: None,
            dirty_since: None,
        }
    }

    pub fn dirty(data: Option<Vec<u8>>, digest: BlockDigest, now_ms: u64) -> Self {
        Self {
            state: EntryState::Dirty,
            data,
            pending: None,
            digest: Some(digest),
            dirty_since: Some(now_ms),
        }
    }

    pub fn is_servable(&self) -> bool {
        matches!(
            self.state,
            EntryState::Clean | EntryState::Dirty | EntryState::Writing | EntryState::Writing2
        )
    }

    pub fn fill(&self, buf: &mut [u8]) {
        match &self.data {
            Some(bytes) => buf.copy_from_slice(bytes),
            None => buf.fill(0),
        }
    }
}
