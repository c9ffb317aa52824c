//! Block addressing (§3, §6): a block index and the object-key width derived from it.

/// A zero-based block index in `[0, num_blocks)`.
pub type BlockIndex = u64;

/// The smallest number of hex digits that can encode `num_blocks - 1`, per §6's
/// "Width X is the smallest hex-digit count encoding N-1."
pub fn hex_key_width(num_blocks: u64) -> usize {
    if num_blocks <= 1 {
        return 1;
    }
    let max_index = num_blocks - 1;
    let mut width = 1;
    let mut limit: u64 = 16;
    while limit <= max_index {
        width += 1;
        limit = limit.saturating_mul(16);
    }
    width
}

/// Formats a block object key as `{prefix}{idx:0width x}`, per §4.4/§6.
pub fn block_key(prefix: &str, idx: BlockIndex, width: usize) -> String {
    format!("{prefix}{idx:0width$x}", prefix = prefix, idx = idx, width = width)
}

/// Parses a block index back out of a key produced by [`block_key`]. Returns `None` for
/// keys that don't look like block keys (e.g. the metadata object), which callers of
/// `list_blocks` skip with a warning per §4.4.
pub fn parse_block_key(prefix: &str, key: &str) -> Option<BlockIndex> {
    let suffix = key.strip_prefix(prefix)?;
    if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u64::from_str_radix(suffix, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn width_covers_max_index() {
        assert_eq!(hex_key_width(1), 1);
        assert_eq!(hex_key_width(16), 1);
        assert_eq!(hex_key_width(17), 2);
        assert_eq!(hex_key_width(256), 2);
        assert_eq!(hex_key_width(257), 3);
        assert_eq!(hex_key_width(1024), 3);
    }

    #[test]
    fn key_roundtrip() {
        let width = hex_key_width(1024);
        let key = block_key("block-", 255, width);
        assert_eq!(key, "block-0ff");
        assert_eq!(parse_block_key("block-", &key), Some(255));
    }

    #[test]
    fn non_block_keys_are_skipped() {
        assert_eq!(parse_block_key("block-", "metadata"), None);
        assert_eq!(parse_block_key("block-", "block-zz"), None);
    }
}
