//! ShardSource — the backend that returns shard *i*'s raw bytes.
//!
//! Grounded on the teacher's `ModelBackend` trait
//! (`continuum-core/src/inference/backends/mod.rs`): one small trait,
//! `Send + Sync`, implemented once per backend kind, with a single
//! factory-style constructor per realization rather than an enum of
//! variants.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{LoaderError, Result};

/// Bytes returned by a shard fetch. May be a view into backing storage —
/// callers must not assume exclusive ownership until it crosses the
/// `ShardCache` boundary (open question 2, spec §9), which copies into
/// an owned `Arc<[u8]>` exactly once.
#[derive(Clone)]
pub struct ShardBytes(pub Arc<[u8]>);

impl ShardBytes {
    pub fn len(&self) -> u64 {
        self.0.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

/// `fetch(shard_index) -> bytes` (spec §4.2).
#[async_trait]
pub trait ShardSource: Send + Sync {
    async fn fetch(&self, shard_index: usize) -> Result<ShardBytes>;
}

/// Content-addressed local store: shard `i` lives at
/// `{root}/{filename}` as declared by the manifest.
pub struct LocalShardStore {
    root: PathBuf,
    filenames: Vec<String>,
}

impl LocalShardStore {
    pub fn new(root: impl Into<PathBuf>, filenames: Vec<String>) -> Self {
        Self { root: root.into(), filenames }
    }
}

#[async_trait]
impl ShardSource for LocalShardStore {
    async fn fetch(&self, shard_index: usize) -> Result<ShardBytes> {
        let filename = self.filenames.get(shard_index).ok_or_else(|| {
            LoaderError::Integrity { shard_index, reason: "no filename registered for this index".into() }
        })?;
        let path = self.root.join(filename);
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| LoaderError::Integrity { shard_index, reason: format!("read failed: {e}") })?;
        Ok(ShardBytes(Arc::from(bytes.into_boxed_slice())))
    }
}

/// An injected callback shard source (spec §4.1 `set_shard_source`).
/// The closure itself does the fetch; this just adapts it to the trait
/// object boundary `Loader` expects.
pub struct CallbackShardSource<F> {
    callback: F,
}

impl<F> CallbackShardSource<F>
where
    F: Fn(usize) -> FetchFuture + Send + Sync,
{
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

/// The callback's return type: a boxed future so the closure can be
/// either sync or async under the hood without the trait needing GATs.
type FetchFuture = std::pin::Pin<Box<dyn std::future::Future<Output = Result<ShardBytes>> + Send>>;

#[async_trait]
impl<F> ShardSource for CallbackShardSource<F>
where
    F: Fn(usize) -> FetchFuture + Send + Sync,
{
    async fn fetch(&self, shard_index: usize) -> Result<ShardBytes> {
        (self.callback)(shard_index).await
    }
}

/// A trivial in-memory source, for scenario tests (spec §8) and
/// anywhere the whole container fits in host memory up front.
pub struct InMemoryShardSource {
    shards: Vec<Vec<u8>>,
}

impl InMemoryShardSource {
    pub fn new(shards: Vec<Vec<u8>>) -> Self {
        Self { shards }
    }
}

#[async_trait]
impl ShardSource for InMemoryShardSource {
    async fn fetch(&self, shard_index: usize) -> Result<ShardBytes> {
        let bytes = self.shards.get(shard_index).ok_or_else(|| LoaderError::Integrity {
            shard_index,
            reason: "no such shard in memory".into(),
        })?;
        Ok(ShardBytes(Arc::from(bytes.clone().into_boxed_slice())))
    }
}
