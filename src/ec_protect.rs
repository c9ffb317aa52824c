//! The EC Protect layer (§4.3): compensates for object-store eventual consistency by
//! enforcing a read-after-write delay and serializing concurrent writes to the same
//! block.
//!
//! The expiring-entry shape is grounded on the teacher's `database::cache::CacheConfig`
//! TTL-based tiers, repurposed here for write-then-read consistency windows instead of
//! read caching.

use crate::block::BlockIndex;
use crate::clock::Clock;
use crate::digest::BlockDigest;
use crate::error::Result;
use crate::store::{BlockSink, BlockStore, ReadOutcome};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

#[derive(Clone)]
enum Payload {
    Bytes(Vec<u8>),
    Zero,
}

impl Payload {
    fn digest(&self, block_size: usize) -> BlockDigest {
        match self {
            Payload::Bytes(b) => BlockDigest::compute(b),
            Payload::Zero => BlockDigest::of_zero_block(block_size),
        }
    }

    fn fill(&self, buf: &mut [u8]) {
        match self {
            Payload::Bytes(b) => buf.copy_from_slice(b),
            Payload::Zero => buf.fill(0),
        }
    }
}

struct Entry {
    /// `true` while some thread is inside the downstream `write` call for this index.
    in_flight: bool,
    /// The most recently requested payload not yet applied downstream; consumed by the
    /// in-flight writer's loop, so earlier superseded payloads never reach the network.
    pending: Option<Payload>,
    /// The last payload known to be durable downstream, held so reads within the window
    /// are served locally (§4.3).
    applied: Option<Payload>,
    written_at_ms: u64,
}

impl Entry {
    fn fresh(now_ms: u64) -> Self {
        Self {
            in_flight: false,
            pending: None,
            applied: None,
            written_at_ms: now_ms,
        }
    }
}

struct Inner {
    entries: HashMap<BlockIndex, Entry>,
}

fn spawn_reaper(
    weak: Weak<EcProtect>,
    stop: Arc<AtomicBool>,
    min_write_delay: Duration,
) -> std::thread::JoinHandle<()> {
    let interval = min_write_delay.max(Duration::from_millis(10));
    std::thread::Builder::new()
        .name("ec-protect-reaper".into())
        .spawn(move || {
            while !stop.load(Ordering::Acquire) {
                std::thread::sleep(interval);
                match weak.upgrade() {
                    Some(this) => this.reap_expired(),
                    None => return,
                }
            }
        })
        .expect("failed to spawn ec-protect reaper thread")
}

/// Enforces §4.3's consistency window in front of `downstream`.
pub struct EcProtect {
    inner: Mutex<Inner>,
    cv: Condvar,
    downstream: Arc<dyn BlockStore>,
    clock: Arc<dyn Clock>,
    min_write_delay: Duration,
    cache_size: usize,
    block_size: u32,
    stop: Arc<AtomicBool>,
    reaper: Option<std::thread::JoinHandle<()>>,
}

impl EcProtect {
    pub fn new(
        downstream: Arc<dyn BlockStore>,
        clock: Arc<dyn Clock>,
        min_write_delay: Duration,
        cache_size: usize,
        block_size: u32,
    ) -> Arc<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let reaper = spawn_reaper(weak.clone(), stop.clone(), min_write_delay);
            Self {
                inner: Mutex::new(Inner {
                    entries: HashMap::new(),
                }),
                cv: Condvar::new(),
                downstream,
                clock,
                min_write_delay,
                cache_size,
                block_size,
                stop,
                reaper: Some(reaper),
            }
        })
    }

    fn reap_expired(&self) {
        let mut inner = self.inner.lock();
        let now = self.clock.now_ms();
        let min_delay = self.min_write_delay.as_millis() as u64;
        inner
            .entries
            .retain(|_, e| e.in_flight || now.saturating_sub(e.written_at_ms) < min_delay);
        self.cv.notify_all();
    }

    fn within_window(&self, entry: &Entry, now_ms: u64) -> bool {
        now_ms.saturating_sub(entry.written_at_ms) < self.min_write_delay.as_millis() as u64
    }
}

impl BlockStore for EcProtect {
    fn read(&self, idx: BlockIndex, buf: &mut [u8], expect_digest: Option<BlockDigest>) -> Result<ReadOutcome> {
        let mut inner = self.inner.lock();
        self.cv.wait_while(&mut inner, |inner| {
            inner.entries.get(&idx).map(|e| e.in_flight).unwrap_or(false)
        });

        let now = self.clock.now_ms();
        if let Some(entry) = inner.entries.get(&idx) {
            if self.within_window(entry, now) {
                if let Some(payload) = &entry.applied {
                    let digest = payload.digest(self.block_size as usize);
                    if expect_digest == Some(digest) {
                        return Ok(ReadOutcome::NotModified);
                    }
                    payload.fill(buf);
                    return Ok(ReadOutcome::Filled);
                }
            }
        }
        drop(inner);
        self.downstream.read(idx, buf, expect_digest)
    }

    fn write(&self, idx: BlockIndex, data: Option<&[u8]>) -> Result<BlockDigest> {
        let payload = match data {
            None => Payload::Zero,
            Some(bytes) => Payload::Bytes(bytes.to_vec()),
        };
        let digest = payload.digest(self.block_size as usize);

        let mut inner = self.inner.lock();
        let now = self.clock.now_ms();

        self.cv.wait_while(&mut inner, |inner| {
            !inner.entries.contains_key(&idx) && inner.entries.len() >= self.cache_size
        });

        let entry = inner.entries.entry(idx).or_insert_with(|| Entry::fresh(now));
        if entry.in_flight {
            entry.pending = Some(payload);
            self.cv.wait_while(&mut inner, |inner| {
                inner.entries.get(&idx).map(|e| e.in_flight).unwrap_or(false)
            });
            return Ok(digest);
        }

        entry.in_flight = true;
        let mut current = payload;
        loop {
            let to_write = current.clone();
            drop(inner);
            let write_result = match &to_write {
                Payload::Zero => self.downstream.write(idx, None),
                Payload::Bytes(bytes) => self.downstream.write(idx, Some(bytes)),
            };
            inner = self.inner.lock();
            let entry = inner
                .entries
                .get_mut(&idx)
                .expect("entry cannot be removed while in_flight");
            match write_result {
                Ok(_) => {
                    entry.applied = Some(to_write);
                    entry.written_at_ms = self.clock.now_ms();
                }
                Err(e) => {
                    entry.in_flight = false;
                    entry.pending = None;
                    self.cv.notify_all();
                    return Err(e);
                }
            }
            match entry.pending.take() {
                Some(next) => {
                    current = next;
                    continue;
                }
                None => {
                    entry.in_flight = false;
                    self.cv.notify_all();
                    break;
                }
            }
        }
        Ok(digest)
    }

    fn list_blocks(&self, sink: &mut BlockSink<'_>) -> Result<()> {
        self.downstream.list_blocks(sink)
    }

    fn flush(&self) -> Result<()> {
        self.downstream.flush()
    }

    fn survey_non_zero(&self, sink: &mut BlockSink<'_>) -> Result<()> {
        self.downstream.survey_non_zero(sink)
    }

    fn shutdown(&self) -> Result<()> {
        self.stop.store(true, Ordering::Release);
        self.downstream.shutdown()
    }

    fn destroy(&self) -> Result<()> {
        self.downstream.destroy()
    }

    fn mark_clean(&self, idx: BlockIndex) -> Result<()> {
        self.downstream.mark_clean(idx)
    }
}

impl Drop for EcProtect {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.reaper.take() {
            // The reaper sleeps at most `min_write_delay`; joining here bounds shutdown
            // latency by that same interval rather than blocking indefinitely.
            let _ = handle.join();
        }
    }
}
