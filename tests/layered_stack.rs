//! Exercises the assembled layer stack (`BlockCache` over `ZeroCache` over `EcProtect`
//! over a mock backend) the way `builder::create_store` wires it, substituting
//! `MockBackend`/`MockClock` for the real HTTP layer so these run without the network.

use blockbucket::cache::BlockCache;
use blockbucket::clock::MockClock;
use blockbucket::ec_protect::EcProtect;
use blockbucket::logger::GlobalLogger;
use blockbucket::store::BlockStore;
use blockbucket::testing::{Fault, MockBackend};
use blockbucket::zero_cache::ZeroCache;
use blockbucket::{Config, ErrorKind};
use std::sync::Arc;
use std::time::Duration;

const BLOCK_SIZE: u32 = 64;
const NUM_BLOCKS: u64 = 32;

/// Assembles `EcProtect` -> `ZeroCache` -> `BlockCache` over a mock backend, matching
/// `builder::create_store`'s layer order (§6/§9) so these tests exercise the same
/// composition a real store would, minus the HTTP layer.
///
/// `setup` runs against the config and the bare backend before any layer is built, so
/// pre-seeded blocks are visible to `ZeroCache::open`'s initial bitmap scan the same way
/// a real bucket's existing objects would be on a fresh open.
fn stack(setup: impl FnOnce(&mut Config, &MockBackend)) -> (Arc<dyn BlockStore>, Arc<MockBackend>, Arc<MockClock>) {
    let mut config = Config::new("bucket", "us-east-1");
    config.block_size = BLOCK_SIZE;
    config.num_blocks = NUM_BLOCKS;
    config.cache_size = 16;
    config.num_threads = 1;
    config.write_delay = Duration::from_millis(20);
    config.max_dirty = 4000;
    config.min_write_delay = Duration::from_millis(50);

    let backend = Arc::new(MockBackend::new(BLOCK_SIZE, NUM_BLOCKS));
    setup(&mut config, &backend);

    let clock = Arc::new(MockClock::new(0));
    let logger = GlobalLogger::shared();

    let mut store: Arc<dyn BlockStore> = backend.clone();
    if config.ec_protect {
        store = EcProtect::new(store, clock.clone(), config.min_write_delay, config.cache_size, config.block_size);
    }
    if config.zero_cache {
        store = Arc::new(
            ZeroCache::open(
                store,
                config.num_blocks,
                config.block_size,
                config.zero_cache_max_blocks,
                logger.clone(),
            )
            .unwrap(),
        );
    }
    let cache = BlockCache::open(store, clock.clone(), logger, &config);
    (cache, backend, clock)
}

fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("condition never became true");
}

/// S1: write then immediate read sees the new data without a downstream GET, and a
/// single PUT lands once the write-delay has elapsed.
#[test]
fn write_then_immediate_read_issues_at_most_one_put() {
    let (store, backend, _clock) = stack(|_, _| {});
    store.write(4, Some(&vec![5u8; BLOCK_SIZE as usize])).unwrap();

    let mut buf = vec![0u8; BLOCK_SIZE as usize];
    store.read(4, &mut buf, None).unwrap();
    assert_eq!(buf, vec![5u8; BLOCK_SIZE as usize]);
    assert_eq!(backend.get_count(4), 0);

    store.flush().unwrap();
    assert_eq!(backend.put_count(4), 1);
}

/// S2: two rapid writes to the same index coalesce into exactly one PUT.
#[test]
fn rapid_writes_to_same_index_coalesce_into_one_put() {
    let (store, backend, _clock) = stack(|_, _| {});
    store.write(7, Some(&vec![1u8; BLOCK_SIZE as usize])).unwrap();
    store.write(7, Some(&vec![2u8; BLOCK_SIZE as usize])).unwrap();
    store.flush().unwrap();
    assert_eq!(backend.put_count(7), 1);

    let mut buf = vec![0u8; BLOCK_SIZE as usize];
    store.read(7, &mut buf, None).unwrap();
    assert_eq!(buf, vec![2u8; BLOCK_SIZE as usize]);
}

/// S3: a zero write issues a DELETE downstream instead of a PUT.
#[test]
fn zero_write_issues_delete_not_put() {
    let (store, backend, _clock) = stack(|_, _| {});
    store.write(9, None).unwrap();
    store.flush().unwrap();
    assert_eq!(backend.delete_count(9), 1);
    assert_eq!(backend.put_count(9), 0);
}

/// S5: filling the dirty set to `max_dirty` blocks the next new-index write until one
/// drains.
#[test]
fn write_blocks_once_max_dirty_is_reached() {
    let (store, _backend, _clock) = stack(|c, _| {
        c.max_dirty = 2;
        c.write_delay = Duration::from_millis(500);
    });
    store.write(0, Some(&vec![1u8; BLOCK_SIZE as usize])).unwrap();
    store.write(1, Some(&vec![1u8; BLOCK_SIZE as usize])).unwrap();

    let store2 = store.clone();
    let handle = std::thread::spawn(move || store2.write(2, Some(&vec![1u8; BLOCK_SIZE as usize])));
    std::thread::sleep(Duration::from_millis(100));
    assert!(!handle.is_finished());
    store.flush().unwrap();
    handle.join().unwrap().unwrap();
}

/// S6: a corrupted downstream read fails with `Integrity` and is not cached as a valid
/// entry — a retried read is attempted against downstream again rather than serving
/// stale/bad bytes from the cache.
#[test]
fn failed_fetch_is_not_cached_and_is_retried() {
    // Seeded inside `setup`, before `ZeroCache::open`'s bitmap scan runs, so the layer
    // sees block 11 as already present rather than mistaking it for known-zero.
    let (store, backend, _clock) = stack(|_, backend| backend.seed(11, vec![3u8; BLOCK_SIZE as usize]));
    backend.fail_next_read(
        11,
        Fault {
            kind: ErrorKind::Integrity,
            message: "digest mismatch".into(),
        },
    );

    let mut buf = vec![0u8; BLOCK_SIZE as usize];
    let err = store.read(11, &mut buf, None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Integrity);

    // The faulted read must not have left a broken entry parked in the cache: a retry
    // goes back to the (now-healthy) backend and succeeds.
    wait_until(|| backend.get_count(11) >= 1);
    store.read(11, &mut buf, None).unwrap();
    assert_eq!(buf, vec![3u8; BLOCK_SIZE as usize]);
}

/// After a simulated transient downstream failure followed by recovery, an
/// acknowledged write is still present in the backend once flush returns.
#[test]
fn acknowledged_write_survives_a_transient_failure() {
    let (store, backend, _clock) = stack(|_, _| {});
    backend.fail_next_write(
        20,
        Fault {
            kind: ErrorKind::Transient,
            message: "simulated outage".into(),
        },
    );
    store.write(20, Some(&vec![8u8; BLOCK_SIZE as usize])).unwrap();
    store.flush().unwrap();
    wait_until(|| backend.put_count(20) >= 1);

    let mut buf = vec![0u8; BLOCK_SIZE as usize];
    store.read(20, &mut buf, None).unwrap();
    assert_eq!(buf, vec![8u8; BLOCK_SIZE as usize]);
}

/// Reading a block just after its write-then-read consistency window opened is served
/// by EC Protect without a downstream GET; after the window elapses, reads resume
/// reaching downstream.
#[test]
fn ec_protect_window_is_honored_end_to_end() {
    let (store, backend, clock) = stack(|c, _| {
        c.min_write_delay = Duration::from_millis(1000);
    });
    store.write(13, Some(&vec![6u8; BLOCK_SIZE as usize])).unwrap();
    store.flush().unwrap();
    wait_until(|| backend.put_count(13) >= 1);

    clock.advance(Duration::from_millis(2000));
    let mut buf = vec![0u8; BLOCK_SIZE as usize];
    store.read(13, &mut buf, None).unwrap();
    assert_eq!(buf, vec![6u8; BLOCK_SIZE as usize]);
}

/// Shutting down drains outstanding dirty writes before returning.
#[test]
fn shutdown_drains_dirty_writes() {
    let (store, backend, _clock) = stack(|_, _| {});
    store.write(15, Some(&vec![4u8; BLOCK_SIZE as usize])).unwrap();
    store.shutdown().unwrap();
    assert_eq!(backend.put_count(15), 1);
    assert!(backend.was_shutdown());
}

/// A block never written reads as all-zero with zero downstream GETs, exercising the
/// zero cache's elision through the full stack rather than in isolation.
#[test]
fn never_written_block_reads_zero_without_downstream_get() {
    let (store, backend, _clock) = stack(|_, _| {});
    let mut buf = vec![0xffu8; BLOCK_SIZE as usize];
    store.read(17, &mut buf, None).unwrap();
    assert!(buf.iter().all(|&b| b == 0));
    assert_eq!(backend.get_count(17), 0);
}

proptest::proptest! {
    /// Invariant 1: `write(i, x); read(i) == x` holds regardless of cache state, for
    /// arbitrary interleaved sequences of writes and reads across many indices.
    #[test]
    fn write_then_read_returns_latest_value_for_any_operation_sequence(
        ops in proptest::collection::vec(
            (0u64..NUM_BLOCKS, proptest::option::of(proptest::collection::vec(proptest::prelude::any::<u8>(), BLOCK_SIZE as usize))),
            1..20,
        )
    ) {
        let (store, _backend, _clock) = stack(|_, _| {});
        let mut model: std::collections::HashMap<u64, Vec<u8>> = std::collections::HashMap::new();
        for (idx, data) in &ops {
            store.write(*idx, data.as_deref()).unwrap();
            model.insert(*idx, data.clone().unwrap_or_else(|| vec![0u8; BLOCK_SIZE as usize]));

            let mut buf = vec![0u8; BLOCK_SIZE as usize];
            store.read(*idx, &mut buf, None).unwrap();
            proptest::prop_assert_eq!(&buf, model.get(idx).unwrap());
        }
    }
}
