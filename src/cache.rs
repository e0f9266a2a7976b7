//! ShardCache — bounded LRU in front of a `ShardSource` (spec §4.2).
//!
//! Small hand-rolled LRU rather than a crate: capacity is 2-4 entries
//! (sequential tensor reads hit one or two shards), so a `VecDeque` of
//! recency order plus a `HashMap` for lookup is simpler than a
//! dependency, and this is exactly the scale the teacher hand-rolls
//! similar bookkeeping at (`worker_pool.rs`'s `PoolStats`, `priority_queue.rs`).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;
use crate::manifest::Manifest;
use crate::shard_source::{ShardBytes, ShardSource};

const DEFAULT_CAPACITY: usize = 4;

struct Inner {
    capacity: usize,
    entries: HashMap<usize, ShardBytes>,
    /// Most-recently-used at the back.
    recency: VecDeque<usize>,
}

impl Inner {
    fn touch(&mut self, index: usize) {
        self.recency.retain(|&i| i != index);
        self.recency.push_back(index);
    }

    fn evict_if_full(&mut self) {
        while self.entries.len() > self.capacity {
            if let Some(lru) = self.recency.pop_front() {
                self.entries.remove(&lru);
            } else {
                break;
            }
        }
    }
}

/// Verification policy applied before a shard enters the cache (spec
/// §4.2, §4.3): optional for injected sources, enabled by default.
#[derive(Clone, Copy)]
pub struct VerifyPolicy {
    pub enabled: bool,
}

impl Default for VerifyPolicy {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Owned by the Loader alone — never shared across model loads (spec
/// §5 "Shared-resource policy"). Cleared on `unload()`.
pub struct ShardCache {
    inner: Mutex<Inner>,
    verify: VerifyPolicy,
}

impl ShardCache {
    pub fn new(capacity: usize, verify: VerifyPolicy) -> Self {
        Self {
            inner: Mutex::new(Inner {
                capacity: capacity.max(1),
                entries: HashMap::new(),
                recency: VecDeque::new(),
            }),
            verify,
        }
    }

    pub fn with_default_capacity(verify: VerifyPolicy) -> Self {
        Self::new(DEFAULT_CAPACITY, verify)
    }

    /// Fetch shard `index`, consulting the cache first. On a cache miss
    /// the source is consulted, the result is normalized into an owned
    /// buffer exactly once (open question 2), hash-verified if the
    /// policy calls for it, and inserted before being returned.
    pub async fn get(
        &self,
        index: usize,
        manifest: &Manifest,
        source: &dyn ShardSource,
    ) -> Result<ShardBytes> {
        if let Some(bytes) = {
            let mut inner = self.inner.lock();
            let hit = inner.entries.get(&index).cloned();
            if hit.is_some() {
                inner.touch(index);
            }
            hit
        } {
            tracing::debug!(shard = index, "shard cache hit");
            return Ok(bytes);
        }

        tracing::debug!(shard = index, "shard cache miss, fetching from source");
        let fetched = source.fetch(index).await?;
        // Normalize to one owned copy here, at the cache boundary —
        // this is the single normalization point the spec calls for.
        let bytes = ShardBytes(Arc::<[u8]>::from(fetched.as_slice()));

        if self.verify.enabled {
            self.verify_shard(index, manifest, &bytes)?;
        }

        {
            let mut inner = self.inner.lock();
            inner.entries.insert(index, bytes.clone());
            inner.touch(index);
            inner.evict_if_full();
        }

        Ok(bytes)
    }

    fn verify_shard(&self, index: usize, manifest: &Manifest, bytes: &ShardBytes) -> Result<()> {
        let declared = manifest.shard(index).ok_or_else(|| crate::error::LoaderError::Integrity {
            shard_index: index,
            reason: "shard not present in manifest".into(),
        })?;

        if bytes.len() != declared.size {
            return Err(crate::error::LoaderError::Integrity {
                shard_index: index,
                reason: format!("length {} does not match manifest size {}", bytes.len(), declared.size),
            });
        }

        let digest = manifest.hash_algorithm.hex_digest(bytes.as_slice());
        if !digest.eq_ignore_ascii_case(&declared.hash) {
            return Err(crate::error::LoaderError::Integrity {
                shard_index: index,
                reason: format!(
                    "hash mismatch (expected {}, got {digest}, algorithm {:?})",
                    declared.hash,
                    manifest.hash_algorithm
                ),
            });
        }

        Ok(())
    }

    /// Clear every cached entry. Hard invariant on `unload()` (spec
    /// §4.2): a stale entry across model loads is exactly the
    /// silent-corruption class the spec warns against.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.recency.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::HashAlgorithm;
    use crate::shard_source::InMemoryShardSource;

    fn manifest_with_shards(sizes: &[u64]) -> Manifest {
        let shards: Vec<_> = sizes
            .iter()
            .enumerate()
            .map(|(i, &size)| {
                let bytes = vec![0u8; size as usize];
                let hash = HashAlgorithm::Sha256.hex_digest(&bytes);
                serde_json::json!({"index": i, "filename": format!("s{i}.bin"), "size": size, "hash": hash})
            })
            .collect();
        let json = serde_json::json!({
            "version": 1, "modelId": "m", "architecture": "a", "config": {},
            "shards": shards, "tensors": {}, "hashAlgorithm": "sha256"
        });
        Manifest::parse(&json.to_string()).unwrap()
    }

    #[tokio::test]
    async fn evicts_least_recently_used() {
        let manifest = manifest_with_shards(&[8, 8, 8]);
        let source = InMemoryShardSource::new(vec![vec![0u8; 8]; 3]);
        let cache = ShardCache::new(2, VerifyPolicy { enabled: false });

        cache.get(0, &manifest, &source).await.unwrap();
        cache.get(1, &manifest, &source).await.unwrap();
        assert_eq!(cache.len(), 2);
        cache.get(2, &manifest, &source).await.unwrap();
        assert_eq!(cache.len(), 2);

        // 0 should have been evicted as LRU, 1 and 2 remain.
        let inner = cache.inner.lock();
        assert!(!inner.entries.contains_key(&0));
        assert!(inner.entries.contains_key(&1));
        assert!(inner.entries.contains_key(&2));
    }

    #[tokio::test]
    async fn clear_empties_cache() {
        let manifest = manifest_with_shards(&[8]);
        let source = InMemoryShardSource::new(vec![vec![0u8; 8]]);
        let cache = ShardCache::new(4, VerifyPolicy { enabled: false });
        cache.get(0, &manifest, &source).await.unwrap();
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test]
    async fn detects_hash_mismatch() {
        let manifest = manifest_with_shards(&[8]);
        let source = InMemoryShardSource::new(vec![vec![1u8; 8]]); // wrong content vs hash of zeros
        let cache = ShardCache::new(4, VerifyPolicy { enabled: true });
        let err = cache.get(0, &manifest, &source).await.unwrap_err();
        assert!(matches!(err, crate::error::LoaderError::Integrity { .. }));
    }
}
