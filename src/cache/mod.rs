//! The Block Cache layer (§4.1): write-back caching with read-ahead, single-flight
//! dedup, and bounded resource usage — the top of the layered stack.
//!
//! The worker-pool shape is grounded on the teacher's `scheduling::worker` module; the
//! state machine and FIFO/LRU bookkeeping are this crate's own, driven by §4.1.

mod entry;
mod worker;

use crate::block::BlockIndex;
use crate::clock::Clock;
use crate::config::Config;
use crate::digest::BlockDigest;
use crate::error::{ErrorKind, Result, StoreError};
use crate::logger::Logger;
use crate::store::{BlockSink, BlockStore, ReadOutcome};
use entry::{Entry, EntryState};
use lru::LruCache;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use worker::WorkerPool;

struct Inner {
    entries: HashMap<BlockIndex, Entry>,
    clean_lru: LruCache<BlockIndex, ()>,
    dirty_fifo: VecDeque<BlockIndex>,
    dirty_count: usize,
    last_read_idx: Option<BlockIndex>,
    sequential_run: u32,
    /// A fetch failure not yet observed by the `read()` call that is waiting on it;
    /// consumed (and cleared) by the first caller to notice it after the entry is
    /// removed, so the failure surfaces exactly once per failed fetch rather than
    /// being silently retried away.
    pending_read_errors: HashMap<BlockIndex, (ErrorKind, String)>,
}

/// Merges `data`/`digest` into the entry for `idx`, pushing it onto the dirty FIFO (and
/// counting it against `max_dirty`) only if it was not already dirty. Shared by `write`,
/// and by the read/write-completion handlers that land an entry back in `Dirty` after a
/// coalesced `WRITING2`/`READING2` transition.
fn promote_to_dirty(inner: &mut Inner, idx: BlockIndex, data: Option<Vec<u8>>, digest: BlockDigest, now_ms: u64) {
    if inner.entries.get(&idx).map(|e| e.state) == Some(EntryState::Clean) {
        inner.clean_lru.pop(&idx);
    }
    let e = inner
        .entries
        .entry(idx)
        .or_insert_with(|| Entry::dirty(data.clone(), digest, now_ms));
    e.state = EntryState::Dirty;
    e.data = data;
    e.digest = Some(digest);
    e.pending = None;
    if e.dirty_since.is_none() {
        e.dirty_since = Some(now_ms);
        inner.dirty_fifo.push_back(idx);
        inner.dirty_count += 1;
    }
}

/// The write-back layer sitting at the top of the stack.
pub struct BlockCache {
    inner: Mutex<Inner>,
    cv: Condvar,
    downstream: Arc<dyn BlockStore>,
    clock: Arc<dyn Clock>,
    logger: Arc<dyn Logger>,
    pool: WorkerPool,
    self_weak: Weak<BlockCache>,
    cache_size: usize,
    write_delay: Duration,
    max_dirty: usize,
    read_ahead: usize,
    read_ahead_trigger: u32,
    synchronous: bool,
    block_size: u32,
    num_blocks: u64,
    stop: Arc<AtomicBool>,
    dispatcher: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl BlockCache {
    pub fn open(
        downstream: Arc<dyn BlockStore>,
        clock: Arc<dyn Clock>,
        logger: Arc<dyn Logger>,
        config: &Config,
    ) -> Arc<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let dispatcher = spawn_dirty_dispatcher(weak.clone(), stop.clone());
            Self {
                inner: Mutex::new(Inner {
                    entries: HashMap::new(),
                    clean_lru: LruCache::new(NonZeroUsize::new(config.cache_size.max(1)).unwrap()),
                    dirty_fifo: VecDeque::new(),
                    dirty_count: 0,
                    last_read_idx: None,
                    sequential_run: 0,
                    pending_read_errors: HashMap::new(),
                }),
                cv: Condvar::new(),
                downstream,
                clock,
                logger,
                pool: WorkerPool::new(config.num_threads),
                self_weak: weak.clone(),
                cache_size: config.cache_size,
                write_delay: config.write_delay,
                max_dirty: config.max_dirty,
                read_ahead: config.read_ahead,
                read_ahead_trigger: config.read_ahead_trigger.max(1),
                synchronous: config.synchronous,
                block_size: config.block_size,
                num_blocks: config.num_blocks,
                stop,
                dispatcher: Mutex::new(Some(dispatcher)),
            }
        })
    }

    /// Pre-seeds block `idx` as `DIRTY`, used by dirty-block recovery at open (§4.1,
    /// see DESIGN.md for the marker scheme) to replay writes a prior instance had
    /// acknowledged but not yet flushed.
    pub fn seed_dirty(&self, idx: BlockIndex, data: Option<Vec<u8>>) {
        let digest = data
            .as_deref()
            .map(BlockDigest::compute)
            .unwrap_or_else(|| BlockDigest::of_zero_block(self.block_size as usize));
        let mut inner = self.inner.lock();
        promote_to_dirty(&mut inner, idx, data, digest, self.clock.now_ms());
    }

    fn ensure_room(&self, inner: &mut Inner) {
        while inner.entries.len() >= self.cache_size {
            match inner.clean_lru.pop_lru() {
                Some((idx, _)) => {
                    inner.entries.remove(&idx);
                }
                None => break,
            }
        }
    }

    fn note_sequential_access(&self, inner: &mut Inner, idx: BlockIndex) {
        let sequential = inner.last_read_idx.map(|last| last + 1 == idx).unwrap_or(false);
        inner.sequential_run = if sequential { inner.sequential_run + 1 } else { 1 };
        inner.last_read_idx = Some(idx);

        if self.read_ahead == 0 || inner.sequential_run < self.read_ahead_trigger {
            return;
        }
        let start = idx + 1;
        let end = (start + self.read_ahead as u64).min(self.num_blocks);
        let to_fetch: Vec<BlockIndex> = (start..end).filter(|i| !inner.entries.contains_key(i)).collect();
        for ahead_idx in to_fetch {
            inner.entries.insert(ahead_idx, Entry::reading());
            self.schedule_fetch(ahead_idx);
        }
    }

    fn schedule_fetch(&self, idx: BlockIndex) {
        let this = self.self_weak.clone();
        let block_size = self.block_size as usize;
        self.pool.submit(move || {
            let Some(this) = this.upgrade() else { return };
            let mut buf = vec![0u8; block_size];
            let result = this.downstream.read(idx, &mut buf, None);
            this.finish_read(idx, result, buf);
        });
    }

    fn finish_read(&self, idx: BlockIndex, result: Result<ReadOutcome>, buf: Vec<u8>) {
        let mut inner = self.inner.lock();
        let now = self.clock.now_ms();
        match inner.entries.get(&idx).map(|e| e.state) {
            Some(EntryState::Reading) => match result {
                Ok(_) => {
                    let digest = BlockDigest::compute(&buf);
                    let e = inner.entries.get_mut(&idx).unwrap();
                    e.state = EntryState::Clean;
                    e.data = Some(buf);
                    e.digest = Some(digest);
                    inner.clean_lru.put(idx, ());
                }
                Err(e) => {
                    inner.entries.remove(&idx);
                    self.logger.warn(&format!("block cache fetch for index {idx} failed: {e}"));
                    inner.pending_read_errors.insert(idx, (e.kind(), e.message().to_string()));
                }
            },
            Some(EntryState::Reading2) => {
                let pending = inner.entries.get_mut(&idx).unwrap().pending.take();
                match pending {
                    Some((data, digest)) => promote_to_dirty(&mut inner, idx, data, digest, now),
                    None => {
                        inner.entries.remove(&idx);
                    }
                }
            }
            _ => {}
        }
        drop(inner);
        self.cv.notify_all();
    }

    fn schedule_write(&self, idx: BlockIndex) {
        let this = self.self_weak.clone();
        self.pool.submit(move || {
            let Some(this) = this.upgrade() else { return };
            let payload = match this.inner.lock().entries.get(&idx) {
                Some(e) => e.data.clone(),
                None => return,
            };
            let result = this.downstream.write(idx, payload.as_deref());
            this.finish_write(idx, result);
        });
    }

    fn finish_write(&self, idx: BlockIndex, result: Result<BlockDigest>) {
        let mut inner = self.inner.lock();
        let now = self.clock.now_ms();
        let is_in_flight = matches!(
            inner.entries.get(&idx).map(|e| e.state),
            Some(EntryState::Writing) | Some(EntryState::Writing2)
        );
        if !is_in_flight {
            drop(inner);
            self.cv.notify_all();
            return;
        }
        let pending = inner.entries.get_mut(&idx).unwrap().pending.take();
        match (result, pending) {
            (Ok(_), Some((data, digest))) => {
                // WRITING2: newer data superseded the completed write; it becomes DIRTY
                // again rather than CLEAN, per §4.1.
                promote_to_dirty(&mut inner, idx, data, digest, now);
            }
            (Ok(_), None) => {
                let e = inner.entries.get_mut(&idx).unwrap();
                e.state = EntryState::Clean;
                e.dirty_since = None;
                inner.clean_lru.put(idx, ());
                drop(inner);
                if let Err(e) = self.downstream.mark_clean(idx) {
                    self.logger.warn(&format!("failed to clear dirty marker for index {idx}: {e}"));
                }
                inner = self.inner.lock();
            }
            (Err(err), Some((data, digest))) => {
                self.logger
                    .warn(&format!("block cache write-back for index {idx} failed ({err}); retrying newest payload"));
                promote_to_dirty(&mut inner, idx, data, digest, now);
            }
            (Err(err), None) => {
                self.logger.warn(&format!("block cache write-back for index {idx} failed ({err}); will retry"));
                let e = inner.entries.get_mut(&idx).unwrap();
                let data = e.data.clone();
                let digest = e.digest.unwrap_or_else(|| BlockDigest::of_zero_block(self.block_size as usize));
                e.dirty_since = None; // cleared so promote_to_dirty re-queues it
                promote_to_dirty(&mut inner, idx, data, digest, now);
            }
        }
        drop(inner);
        self.cv.notify_all();
    }

    fn write_through(&self, idx: BlockIndex, data: Option<&[u8]>) -> Result<BlockDigest> {
        let mut inner = self.inner.lock();
        self.cv.wait_while(&mut inner, |i| {
            matches!(
                i.entries.get(&idx).map(|e| e.state),
                Some(EntryState::Writing) | Some(EntryState::Writing2) | Some(EntryState::Reading) | Some(EntryState::Reading2)
            )
        });
        if inner.entries.get(&idx).map(|e| e.state) == Some(EntryState::Clean) {
            inner.clean_lru.pop(&idx);
        }
        inner.entries.insert(idx, Entry::writing());
        drop(inner);

        let result = self.downstream.write(idx, data);
        let mut inner = self.inner.lock();
        match &result {
            Ok(digest) => {
                let e = inner.entries.get_mut(&idx).unwrap();
                e.state = EntryState::Clean;
                e.data = data.map(|d| d.to_vec());
                e.digest = Some(*digest);
                inner.clean_lru.put(idx, ());
            }
            Err(_) => {
                inner.entries.remove(&idx);
            }
        }
        drop(inner);
        self.cv.notify_all();
        result
    }
}

fn spawn_dirty_dispatcher(weak: Weak<BlockCache>, stop: Arc<AtomicBool>) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("block-cache-dirty-dispatcher".into())
        .spawn(move || loop {
            if stop.load(Ordering::Acquire) {
                return;
            }
            let Some(this) = weak.upgrade() else { return };
            let ready_idx = {
                let mut inner = this.inner.lock();
                let now = this.clock.now_ms();
                let delay_ms = this.write_delay.as_millis() as u64;
                match inner.dirty_fifo.front().copied() {
                    Some(idx) => {
                        let eligible = inner
                            .entries
                            .get(&idx)
                            .and_then(|e| e.dirty_since)
                            .map(|since| now.saturating_sub(since) >= delay_ms)
                            .unwrap_or(false);
                        if eligible {
                            inner.dirty_fifo.pop_front();
                            inner.dirty_count = inner.dirty_count.saturating_sub(1);
                            if let Some(e) = inner.entries.get_mut(&idx) {
                                e.state = EntryState::Writing;
                            }
                            Some(idx)
                        } else {
                            None
                        }
                    }
                    None => None,
                }
            };
            match ready_idx {
                Some(idx) => {
                    this.cv.notify_all();
                    this.schedule_write(idx);
                }
                None => std::thread::sleep(Duration::from_millis(10)),
            }
        })
        .expect("failed to spawn block cache dirty dispatcher thread")
}

impl BlockStore for BlockCache {
    fn read(&self, idx: BlockIndex, buf: &mut [u8], expect_digest: Option<BlockDigest>) -> Result<ReadOutcome> {
        loop {
            let mut inner = self.inner.lock();
            let state = inner.entries.get(&idx).map(|e| e.state);
            match state {
                Some(s) if matches!(s, EntryState::Clean | EntryState::Dirty | EntryState::Writing | EntryState::Writing2) => {
                    let digest = inner.entries[&idx]
                        .digest
                        .unwrap_or_else(|| BlockDigest::of_zero_block(self.block_size as usize));
                    let not_modified = expect_digest == Some(digest);
                    if !not_modified {
                        inner.entries[&idx].fill(buf);
                    }
                    if s == EntryState::Clean {
                        inner.clean_lru.get(&idx);
                    }
                    self.note_sequential_access(&mut inner, idx);
                    return Ok(if not_modified {
                        ReadOutcome::NotModified
                    } else {
                        ReadOutcome::Filled
                    });
                }
                Some(_) => {
                    self.cv.wait(&mut inner);
                    continue;
                }
                None => {
                    if let Some((kind, message)) = inner.pending_read_errors.remove(&idx) {
                        return Err(StoreError::new(kind, message));
                    }
                    self.ensure_room(&mut inner);
                    inner.entries.insert(idx, Entry::reading());
                    self.note_sequential_access(&mut inner, idx);
                    drop(inner);
                    self.schedule_fetch(idx);
                    continue;
                }
            }
        }
    }

    fn write(&self, idx: BlockIndex, data: Option<&[u8]>) -> Result<BlockDigest> {
        if self.synchronous {
            return self.write_through(idx, data);
        }
        let bytes = data.map(|d| d.to_vec());
        let digest = bytes
            .as_deref()
            .map(BlockDigest::compute)
            .unwrap_or_else(|| BlockDigest::of_zero_block(self.block_size as usize));

        let mut inner = self.inner.lock();
        loop {
            match inner.entries.get(&idx).map(|e| e.state) {
                Some(EntryState::Writing) => {
                    let e = inner.entries.get_mut(&idx).unwrap();
                    e.state = EntryState::Writing2;
                    e.pending = Some((bytes.clone(), digest));
                    break;
                }
                Some(EntryState::Writing2) | Some(EntryState::Reading2) => {
                    inner.entries.get_mut(&idx).unwrap().pending = Some((bytes.clone(), digest));
                    break;
                }
                Some(EntryState::Reading) => {
                    let e = inner.entries.get_mut(&idx).unwrap();
                    e.state = EntryState::Reading2;
                    e.pending = Some((bytes.clone(), digest));
                    break;
                }
                Some(EntryState::Clean) | Some(EntryState::Dirty) => {
                    promote_to_dirty(&mut inner, idx, bytes.clone(), digest, self.clock.now_ms());
                    break;
                }
                None => {
                    if inner.dirty_count >= self.max_dirty {
                        self.cv.wait_while(&mut inner, |i| {
                            i.dirty_count >= self.max_dirty && !i.entries.contains_key(&idx)
                        });
                        continue;
                    }
                    self.ensure_room(&mut inner);
                    promote_to_dirty(&mut inner, idx, bytes.clone(), digest, self.clock.now_ms());
                    break;
                }
            }
        }
        drop(inner);
        self.cv.notify_all();
        Ok(digest)
    }

    fn list_blocks(&self, sink: &mut BlockSink<'_>) -> Result<()> {
        self.downstream.list_blocks(sink)
    }

    fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.cv.wait_while(&mut inner, |i| {
            i.dirty_count > 0 || i.entries.values().any(|e| matches!(e.state, EntryState::Writing | EntryState::Writing2))
        });
        drop(inner);
        self.downstream.flush()
    }

    fn survey_non_zero(&self, sink: &mut BlockSink<'_>) -> Result<()> {
        self.downstream.survey_non_zero(sink)
    }

    fn shutdown(&self) -> Result<()> {
        self.flush()?;
        self.stop.store(true, Ordering::Release);
        self.cv.notify_all();
        self.downstream.shutdown()
    }

    fn destroy(&self) -> Result<()> {
        self.downstream.destroy()
    }
}

impl Drop for BlockCache {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.dispatcher.lock().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::logger::GlobalLogger;
    use crate::testing::MockBackend;

    fn cache_over_mock(cfg_mut: impl FnOnce(&mut Config)) -> (Arc<BlockCache>, Arc<MockBackend>, Arc<MockClock>) {
        let mut config = Config::new("bucket", "us-east-1");
        config.block_size = 64;
        config.num_blocks = 64;
        config.cache_size = 16;
        config.num_threads = 1;
        config.write_delay = Duration::from_millis(20);
        config.max_dirty = 8;
        cfg_mut(&mut config);
        let backend = Arc::new(MockBackend::new(64, 64));
        let clock = Arc::new(MockClock::new(0));
        let cache = BlockCache::open(backend.clone(), clock.clone(), GlobalLogger::shared(), &config);
        (cache, backend, clock)
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("condition did not become true in time");
    }

    #[test]
    fn write_then_read_returns_written_data_before_flush() {
        let (cache, backend, _clock) = cache_over_mock(|_| {});
        cache.write(5, Some(&vec![7u8; 64])).unwrap();
        let mut buf = vec![0u8; 64];
        cache.read(5, &mut buf, None).unwrap();
        assert_eq!(buf, vec![7u8; 64]);
        assert_eq!(backend.get_count(5), 0);
    }

    #[test]
    fn dirty_entry_eventually_flushes_downstream() {
        let (cache, backend, _clock) = cache_over_mock(|_| {});
        cache.write(3, Some(&vec![9u8; 64])).unwrap();
        cache.flush().unwrap();
        assert_eq!(backend.put_count(3), 1);
    }

    #[test]
    fn coalesced_writes_produce_one_put() {
        let (cache, backend, _clock) = cache_over_mock(|_| {});
        cache.write(1, Some(&vec![1u8; 64])).unwrap();
        cache.write(1, Some(&vec![2u8; 64])).unwrap();
        cache.flush().unwrap();
        wait_until(|| backend.put_count(1) >= 1);
        let mut buf = vec![0u8; 64];
        cache.read(1, &mut buf, None).unwrap();
        assert_eq!(buf, vec![2u8; 64]);
    }

    #[test]
    fn zero_write_then_flush_issues_delete() {
        let (cache, backend, _clock) = cache_over_mock(|_| {});
        cache.write(2, None).unwrap();
        cache.flush().unwrap();
        assert_eq!(backend.delete_count(2), 1);
    }

    #[test]
    fn read_of_never_written_block_fetches_once() {
        let (cache, backend, _clock) = cache_over_mock(|_| {});
        backend.seed(8, vec![3u8; 64]);
        let mut buf = vec![0u8; 64];
        cache.read(8, &mut buf, None).unwrap();
        assert_eq!(buf, vec![3u8; 64]);
        assert_eq!(backend.get_count(8), 1);

        let mut buf2 = vec![0u8; 64];
        cache.read(8, &mut buf2, None).unwrap();
        assert_eq!(backend.get_count(8), 1, "second read should be served from cache");
    }

    #[test]
    fn max_dirty_blocks_new_writes_until_drained() {
        let (cache, _backend, _clock) = cache_over_mock(|c| {
            c.max_dirty = 2;
            c.write_delay = Duration::from_millis(500);
        });
        cache.write(0, Some(&vec![1u8; 64])).unwrap();
        cache.write(1, Some(&vec![1u8; 64])).unwrap();

        let cache2 = cache.clone();
        let handle = std::thread::spawn(move || cache2.write(2, Some(&vec![1u8; 64])));
        std::thread::sleep(Duration::from_millis(100));
        assert!(!handle.is_finished(), "write should block while max_dirty is saturated");
        cache.flush().unwrap();
        handle.join().unwrap().unwrap();
    }
}
