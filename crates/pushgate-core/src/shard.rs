//! Token → shard ordinal mapping.
//!
//! A single registry map under one lock serializes every register, send,
//! and broadcast in the process. Splitting the registry into N independent
//! shards, each with its own lock, and routing by a pure hash of the token
//! removes that contention. The index must be deterministic and stable for
//! a fixed shard count: a token always lands in the same shard, so global
//! token uniqueness reduces to per-shard uniqueness.
//!
//! The shard count is fixed at startup. Changing it moves tokens between
//! shards and would require a coordinated migration; that is explicitly
//! unsupported.

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// FNV-1a over the token bytes. Stable across processes and platforms,
/// unlike `DefaultHasher` whose seed is randomized per instance.
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET;
    for &b in bytes {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Map a token to a shard ordinal in `[0, shard_count)`.
///
/// # Panics
///
/// Panics if `shard_count` is zero; settings validation rejects that
/// configuration before any bucket exists.
pub fn shard_index(token: &str, shard_count: usize) -> usize {
    assert!(shard_count > 0, "shard_count must be non-zero");
    (fnv1a(token.as_bytes()) % shard_count as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_is_stable_across_calls() {
        let first = shard_index("abc", 4);
        for _ in 0..100 {
            assert_eq!(shard_index("abc", 4), first);
        }
    }

    #[test]
    fn index_is_in_range() {
        for count in [1, 2, 4, 16, 64] {
            for token in ["", "a", "abc", "user:1234", "セッション"] {
                assert!(shard_index(token, count) < count);
            }
        }
    }

    #[test]
    fn single_shard_maps_everything_to_zero() {
        assert_eq!(shard_index("anything", 1), 0);
        assert_eq!(shard_index("", 1), 0);
    }

    #[test]
    fn tokens_spread_across_shards() {
        // Not a distribution-quality test, just a sanity check that the
        // index is not constant.
        let hits: std::collections::HashSet<usize> = (0..256)
            .map(|i| shard_index(&format!("token-{i}"), 8))
            .collect();
        assert!(hits.len() > 1);
    }

    #[test]
    #[should_panic(expected = "shard_count must be non-zero")]
    fn zero_shards_panics() {
        let _ = shard_index("abc", 0);
    }
}
