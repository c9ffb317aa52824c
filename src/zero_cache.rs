//! The Zero Cache layer (§4.2): elides I/O for all-zero blocks using a dense bitmap.

use crate::block::BlockIndex;
use crate::digest::BlockDigest;
use crate::error::{ErrorKind, Result};
use crate::logger::Logger;
use crate::store::{BlockSink, BlockStore, ReadOutcome};
use parking_lot::Mutex;
use std::sync::Arc;

/// A dense, one-bit-per-block bitmap. Bit set means "known to be all-zero."
struct Bitmap {
    bits: Vec<u64>,
    len: u64,
}

impl Bitmap {
    fn new_all_set(len: u64) -> Self {
        let words = ((len + 63) / 64) as usize;
        Self {
            bits: vec![u64::MAX; words],
            len,
        }
    }

    fn get(&self, idx: u64) -> bool {
        let word = (idx / 64) as usize;
        let bit = idx % 64;
        (self.bits[word] >> bit) & 1 == 1
    }

    fn set(&mut self, idx: u64, value: bool) {
        let word = (idx / 64) as usize;
        let bit = idx % 64;
        if value {
            self.bits[word] |= 1 << bit;
        } else {
            self.bits[word] &= !(1 << bit);
        }
    }
}

enum State {
    /// Tracking every block up to `num_blocks` bits.
    Tracking(Bitmap),
    /// §4.2: "up to a configured maximum, else the layer becomes a no-op" — too many
    /// blocks to track economically, so every read/write passes straight through.
    Disabled,
}

/// Elides reads and writes of all-zero blocks, per §4.2.
pub struct ZeroCache {
    state: Mutex<State>,
    downstream: Arc<dyn BlockStore>,
    block_size: u32,
    logger: Arc<dyn Logger>,
}

impl ZeroCache {
    /// Builds the bitmap by enumerating present objects downstream (§4.2: "populated at
    /// start by enumerating present objects via list_blocks on the layer below").
    pub fn open(
        downstream: Arc<dyn BlockStore>,
        num_blocks: u64,
        block_size: u32,
        max_blocks: u64,
        logger: Arc<dyn Logger>,
    ) -> Result<Self> {
        let state = if num_blocks > max_blocks {
            logger.warn(&format!(
                "zero cache disabled: {num_blocks} blocks exceeds the configured maximum of {max_blocks}"
            ));
            State::Disabled
        } else {
            let mut bitmap = Bitmap::new_all_set(num_blocks);
            downstream.list_blocks(&mut |idx| {
                if idx < num_blocks {
                    bitmap.set(idx, false);
                }
            })?;
            State::Tracking(bitmap)
        };
        Ok(Self {
            state: Mutex::new(state),
            downstream,
            block_size,
            logger,
        })
    }
}

impl BlockStore for ZeroCache {
    fn read(&self, idx: BlockIndex, buf: &mut [u8], expect_digest: Option<BlockDigest>) -> Result<ReadOutcome> {
        let known_zero = match &*self.state.lock() {
            State::Tracking(bitmap) => bitmap.get(idx),
            State::Disabled => false,
        };
        if known_zero {
            let zero_digest = BlockDigest::of_zero_block(self.block_size as usize);
            if expect_digest == Some(zero_digest) {
                return Ok(ReadOutcome::NotModified);
            }
            buf.fill(0);
            return Ok(ReadOutcome::Filled);
        }

        match self.downstream.read(idx, buf, expect_digest) {
            Err(e) if e.kind() == ErrorKind::NotFound => {
                // NOT_FOUND never surfaces above the zero cache (§7): a never-written
                // block reads as all-zero, and we now know its bit should be set.
                if let State::Tracking(bitmap) = &mut *self.state.lock() {
                    bitmap.set(idx, true);
                }
                buf.fill(0);
                Ok(ReadOutcome::Filled)
            }
            other => other,
        }
    }

    fn write(&self, idx: BlockIndex, data: Option<&[u8]>) -> Result<BlockDigest> {
        let is_zero = match data {
            None => true,
            Some(bytes) => bytes.iter().all(|&b| b == 0),
        };

        if is_zero {
            self.downstream.write(idx, None)?;
            // The bit is only mutated after the downstream acknowledgment (§4.2).
            if let State::Tracking(bitmap) = &mut *self.state.lock() {
                bitmap.set(idx, true);
            }
            Ok(BlockDigest::of_zero_block(self.block_size as usize))
        } else {
            let digest = self.downstream.write(idx, data)?;
            if let State::Tracking(bitmap) = &mut *self.state.lock() {
                bitmap.set(idx, false);
            }
            Ok(digest)
        }
    }

    fn list_blocks(&self, sink: &mut BlockSink<'_>) -> Result<()> {
        self.downstream.list_blocks(sink)
    }

    fn flush(&self) -> Result<()> {
        self.downstream.flush()
    }

    fn survey_non_zero(&self, sink: &mut BlockSink<'_>) -> Result<()> {
        match &*self.state.lock() {
            State::Tracking(bitmap) => {
                for idx in 0..bitmap.len {
                    if !bitmap.get(idx) {
                        sink(idx);
                    }
                }
                Ok(())
            }
            State::Disabled => self.downstream.survey_non_zero(sink),
        }
    }

    fn shutdown(&self) -> Result<()> {
        self.downstream.shutdown()
    }

    fn destroy(&self) -> Result<()> {
        self.downstream.destroy()
    }

    fn mark_clean(&self, idx: BlockIndex) -> Result<()> {
        self.downstream.mark_clean(idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::GlobalLogger;
    use crate::testing::MockBackend;

    fn zero_cache_over_mock(block_size: u32, num_blocks: u64) -> (ZeroCache, Arc<MockBackend>) {
        let backend = Arc::new(MockBackend::new(block_size, num_blocks));
        let cache = ZeroCache::open(backend.clone(), num_blocks, block_size, 1 << 20, GlobalLogger::shared()).unwrap();
        (cache, backend)
    }

    #[test]
    fn never_written_block_reads_zero_without_downstream_call() {
        let (cache, backend) = zero_cache_over_mock(64, 16);
        let mut buf = vec![0xffu8; 64];
        cache.read(3, &mut buf, None).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
        assert_eq!(backend.get_count(3), 0);
    }

    #[test]
    fn zero_write_issues_delete_and_sets_bit() {
        let (cache, backend) = zero_cache_over_mock(64, 16);
        cache.write(5, Some(&vec![0u8; 64])).unwrap();
        assert_eq!(backend.delete_count(5), 1);
        assert_eq!(backend.put_count(5), 0);

        let mut seen = vec![];
        cache.survey_non_zero(&mut |idx| seen.push(idx)).unwrap();
        assert!(!seen.contains(&5));
    }

    #[test]
    fn non_zero_write_clears_bit() {
        let (cache, _backend) = zero_cache_over_mock(64, 16);
        cache.write(2, Some(&vec![7u8; 64])).unwrap();
        let mut seen = vec![];
        cache.survey_non_zero(&mut |idx| seen.push(idx)).unwrap();
        assert_eq!(seen, vec![2]);
    }
}
