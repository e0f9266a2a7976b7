//! rdrr-loader — manifest-driven sharded model weight loading.
//!
//! A container is one JSON manifest plus a set of content-addressed
//! shard blobs. The [`Loader`] façade turns that pair into a
//! [`weights::WeightSet`] of device-resident tensors: it resolves
//! tensor names across checkpoint-naming conventions, streams and
//! verifies shard bytes through a small LRU cache, dequantizes and
//! widens narrow on-disk dtypes, and lands the result on whatever
//! device was probed at [`Loader::init`].
//!
//! See `SPEC_FULL.md` in the repository root for the full behavioral
//! contract this crate implements.

pub mod cache;
pub mod device;
pub mod dequant;
pub mod error;
pub mod integrity;
pub mod loader;
pub mod manifest;
pub mod materializer;
pub mod progress;
pub mod resolver;
pub mod shard_source;
pub mod weights;

pub use device::{DeviceBufferPool, DeviceRequest, TensorHandle};
pub use error::{LoaderError, Result};
pub use loader::{LoadOptions, Loader, LoaderStats};
pub use manifest::{HashAlgorithm, Manifest};
pub use progress::{ProgressEvent, Stage};
pub use shard_source::{CallbackShardSource, LocalShardStore, ShardBytes, ShardSource};
pub use weights::{ExpertWeights, ExpertsRecord, LayerWeights, Mlp, RouterWeights, WeightSet};
