//! Test doubles shared by this crate's own unit tests and by `tests/` integration tests
//! (via the `test-util` feature). Grounded on the teacher's `testing::fixtures` module,
//! which played the same role for the CAD kernel's geometry tests: an in-memory stand-in
//! for the bottom-most collaborator plus a handful of instrumentation counters.

use crate::block::BlockIndex;
use crate::digest::BlockDigest;
use crate::error::{ErrorKind, Result, StoreError};
use crate::store::{BlockSink, BlockStore, ReadOutcome};
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Default)]
struct Counters {
    get: HashMap<BlockIndex, u32>,
    put: HashMap<BlockIndex, u32>,
    delete: HashMap<BlockIndex, u32>,
}

/// A scripted failure returned once, then cleared, the next time the named operation
/// touches the given index.
#[derive(Clone)]
pub struct Fault {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Default)]
struct Faults {
    on_read: HashMap<BlockIndex, Fault>,
    on_write: HashMap<BlockIndex, Fault>,
}

struct State {
    blocks: HashMap<BlockIndex, Vec<u8>>,
    counters: Counters,
    faults: Faults,
    shutdown: bool,
    destroyed: bool,
}

/// An in-memory [`BlockStore`] standing in for the bottom of the layered stack in tests.
/// Absence of a key means all-zero, matching every layer's own convention.
pub struct MockBackend {
    block_size: u32,
    num_blocks: u64,
    state: Mutex<State>,
}

impl MockBackend {
    pub fn new(block_size: u32, num_blocks: u64) -> Self {
        Self {
            block_size,
            num_blocks,
            state: Mutex::new(State {
                blocks: HashMap::new(),
                counters: Counters::default(),
                faults: Faults::default(),
                shutdown: false,
                destroyed: false,
            }),
        }
    }

    /// Pre-seeds block `idx` with `data` as if it had already been written, bypassing
    /// the counters (used to set up fixtures, not to assert on them).
    pub fn seed(&self, idx: BlockIndex, data: Vec<u8>) {
        self.state.lock().blocks.insert(idx, data);
    }

    pub fn get_count(&self, idx: BlockIndex) -> u32 {
        *self.state.lock().counters.get.get(&idx).unwrap_or(&0)
    }

    pub fn put_count(&self, idx: BlockIndex) -> u32 {
        *self.state.lock().counters.put.get(&idx).unwrap_or(&0)
    }

    pub fn delete_count(&self, idx: BlockIndex) -> u32 {
        *self.state.lock().counters.delete.get(&idx).unwrap_or(&0)
    }

    pub fn total_calls(&self, idx: BlockIndex) -> u32 {
        self.get_count(idx) + self.put_count(idx) + self.delete_count(idx)
    }

    /// The next `read()` of `idx` returns `fault` instead of touching storage.
    pub fn fail_next_read(&self, idx: BlockIndex, fault: Fault) {
        self.state.lock().faults.on_read.insert(idx, fault);
    }

    /// The next `write()` of `idx` returns `fault` instead of touching storage.
    pub fn fail_next_write(&self, idx: BlockIndex, fault: Fault) {
        self.state.lock().faults.on_write.insert(idx, fault);
    }

    pub fn was_shutdown(&self) -> bool {
        self.state.lock().shutdown
    }

    pub fn was_destroyed(&self) -> bool {
        self.state.lock().destroyed
    }
}

impl BlockStore for MockBackend {
    fn read(&self, idx: BlockIndex, buf: &mut [u8], expect_digest: Option<BlockDigest>) -> Result<ReadOutcome> {
        let mut state = self.state.lock();
        if let Some(fault) = state.faults.on_read.remove(&idx) {
            return Err(StoreError::new(fault.kind, fault.message));
        }
        *state.counters.get.entry(idx).or_insert(0) += 1;
        match state.blocks.get(&idx) {
            Some(bytes) => {
                let digest = BlockDigest::compute(bytes);
                if expect_digest == Some(digest) {
                    return Ok(ReadOutcome::NotModified);
                }
                buf.copy_from_slice(bytes);
                Ok(ReadOutcome::Filled)
            }
            None => Err(StoreError::not_found(format!("block {idx} not present"))),
        }
    }

    fn write(&self, idx: BlockIndex, data: Option<&[u8]>) -> Result<BlockDigest> {
        let mut state = self.state.lock();
        if let Some(fault) = state.faults.on_write.remove(&idx) {
            return Err(StoreError::new(fault.kind, fault.message));
        }
        match data {
            None => {
                *state.counters.delete.entry(idx).or_insert(0) += 1;
                state.blocks.remove(&idx);
                Ok(BlockDigest::of_zero_block(self.block_size as usize))
            }
            Some(bytes) => {
                *state.counters.put.entry(idx).or_insert(0) += 1;
                let digest = BlockDigest::compute(bytes);
                state.blocks.insert(idx, bytes.to_vec());
                Ok(digest)
            }
        }
    }

    fn list_blocks(&self, sink: &mut BlockSink<'_>) -> Result<()> {
        let state = self.state.lock();
        let mut indices: Vec<_> = state.blocks.keys().copied().collect();
        indices.sort_unstable();
        for idx in indices {
            sink(idx);
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn survey_non_zero(&self, sink: &mut BlockSink<'_>) -> Result<()> {
        self.list_blocks(sink)
    }

    fn shutdown(&self) -> Result<()> {
        self.state.lock().shutdown = true;
        Ok(())
    }

    fn destroy(&self) -> Result<()> {
        self.state.lock().destroyed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_written_block_is_not_found() {
        let backend = MockBackend::new(64, 4);
        let mut buf = vec![0u8; 64];
        let err = backend.read(0, &mut buf, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn write_then_read_roundtrips_and_counts() {
        let backend = MockBackend::new(64, 4);
        backend.write(1, Some(&vec![7u8; 64])).unwrap();
        let mut buf = vec![0u8; 64];
        backend.read(1, &mut buf, None).unwrap();
        assert_eq!(buf, vec![7u8; 64]);
        assert_eq!(backend.put_count(1), 1);
        assert_eq!(backend.get_count(1), 1);
    }

    #[test]
    fn scripted_fault_fires_once() {
        let backend = MockBackend::new(64, 4);
        backend.seed(2, vec![1u8; 64]);
        backend.fail_next_read(
            2,
            Fault {
                kind: ErrorKind::Transient,
                message: "simulated outage".into(),
            },
        );
        let mut buf = vec![0u8; 64];
        assert_eq!(backend.read(2, &mut buf, None).unwrap_err().kind(), ErrorKind::Transient);
        // The fault was consumed; the retry succeeds.
        backend.read(2, &mut buf, None).unwrap();
    }

    #[test]
    fn num_blocks_is_exposed_for_fixture_setup() {
        let backend = MockBackend::new(64, 9);
        assert_eq!(backend.num_blocks, 9);
    }
}
