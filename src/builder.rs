//! Assembles the layer stack per §6/§9: `HttpIo` → `EcProtect` → `ZeroCache` →
//! `BlockCache`, each layer independently omissible by config, destruction cascading
//! downward through the `Arc<dyn BlockStore>` chain each layer owns.

use crate::cache::BlockCache;
use crate::clock::SystemClock;
use crate::config::Config;
use crate::ec_protect::EcProtect;
use crate::error::Result;
use crate::http_io::HttpIo;
use crate::store::BlockStore;
use crate::zero_cache::ZeroCache;
use std::sync::Arc;

/// Validates `config` and wires up the configured layer stack, returning the top of it.
pub fn create_store(config: &Config) -> Result<Arc<dyn BlockStore>> {
    config.validate()?;
    let clock = SystemClock::new();
    let logger = config.logger();

    let http_io = HttpIo::open(config)?;

    let recovered_blocks = if config.recover_dirty_blocks {
        http_io.scan_dirty_blocks()?
    } else {
        Vec::new()
    };

    let mut store: Arc<dyn BlockStore> = http_io.clone();

    if config.ec_protect {
        store = EcProtect::new(
            store,
            clock.clone(),
            config.min_write_delay,
            config.cache_size,
            config.block_size,
        );
    }

    if config.zero_cache {
        store = Arc::new(ZeroCache::open(
            store,
            config.num_blocks,
            config.block_size,
            config.zero_cache_max_blocks,
            logger.clone(),
        )?);
    }

    let block_cache = BlockCache::open(store, clock, logger.clone(), config);

    if config.recover_dirty_blocks && !recovered_blocks.is_empty() {
        logger.info(&format!("replaying {} dirty block(s) from a prior instance", recovered_blocks.len()));
        let mut buf = vec![0u8; config.block_size as usize];
        for idx in recovered_blocks {
            match block_cache.read(idx, &mut buf, None) {
                Ok(_) => block_cache.seed_dirty(idx, Some(buf.clone())),
                Err(e) => logger.warn(&format!("failed to recover dirty block {idx}: {e}")),
            }
        }
    }

    Ok(block_cache)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_config_before_opening_any_layer() {
        let mut config = Config::new("bucket", "us-east-1");
        config.block_size = 0;
        let err = create_store(&config).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
    }
}
