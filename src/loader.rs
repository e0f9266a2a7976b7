//! Loader — the public façade (spec §4.1, §4.9).
//!
//! Grounded on the teacher's `CandleAdapter` lifecycle
//! (`candle_adapter.rs`: `new` -> `load_model` -> `generate_text` ->
//! `unload`/drop), generalized to the spec's explicit
//! `init`/`set_shard_source`/`set_manifest`/`load`/`unload` surface and
//! its atomic-failure and manifest-preservation rules.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::cache::{ShardCache, VerifyPolicy};
use crate::device::{DeviceBufferPool, DeviceRequest};
use crate::error::{LoaderError, Result};
use crate::manifest::Manifest;
use crate::materializer::TensorMaterializer;
use crate::progress::{ProgressEvent, Stage};
use crate::resolver::NameResolver;
use crate::shard_source::ShardSource;
use crate::weights::{ExpertWeights, LayerWeights, Mlp, WeightSet, WeightSetBuilder};

const NUM_LAYERS_FIELDS: &[&str] = &["num_hidden_layers", "n_layer", "num_layers"];
const NUM_EXPERTS_FIELDS: &[&str] = &["num_local_experts", "num_experts"];

/// Fallback layer count when none of `NUM_LAYERS_FIELDS` is present in
/// the manifest's config (spec §4.8 point 2).
const DEFAULT_NUM_LAYERS: usize = 32;

/// Options accepted by `Loader::load` (spec §4.1).
pub struct LoadOptions<'a> {
    pub verify_hashes: bool,
    pub on_progress: Option<&'a (dyn Fn(ProgressEvent) + Send + Sync)>,
    /// Cooperative cancellation flag, polled at each suspension point
    /// (spec §5): set it and in-flight `load()` returns
    /// `LoaderError::Cancelled` at the next checkpoint rather than
    /// completing.
    pub cancel: Option<&'a AtomicBool>,
}

impl<'a> Default for LoadOptions<'a> {
    fn default() -> Self {
        Self { verify_hashes: true, on_progress: None, cancel: None }
    }
}

fn is_cancelled(cancel: Option<&AtomicBool>) -> bool {
    cancel.map_or(false, |flag| flag.load(std::sync::atomic::Ordering::Relaxed))
}

/// Snapshot of pool bookkeeping (spec §4.9 `stats()`).
#[derive(Debug, Clone, Copy)]
pub struct LoaderStats {
    pub live_buffers: usize,
    pub bytes_acquired: usize,
    pub cached_shards: usize,
}

/// The public entry point. One `Loader` owns one device pool and one
/// shard cache for its whole lifetime; `unload()` clears loaded state
/// without discarding either (spec §5 "Shared-resource policy").
pub struct Loader {
    devices: DeviceBufferPool,
    cache: ShardCache,
    shard_source: Option<Arc<dyn ShardSource>>,
    manifest: Option<Manifest>,
    resolver: NameResolver,
    weights: Option<WeightSet>,
    current_model_id: Option<String>,
}

impl Loader {
    /// Probe the device once, up front (spec §4.1 `init`). Idempotent:
    /// constructing a second `Loader` just probes again independently.
    pub fn init(request: DeviceRequest) -> Result<Self> {
        let devices = DeviceBufferPool::new(request)?;
        let cache = ShardCache::with_default_capacity(VerifyPolicy::default());
        Ok(Self {
            devices,
            cache,
            shard_source: None,
            manifest: None,
            resolver: NameResolver::new(),
            weights: None,
            current_model_id: None,
        })
    }

    pub fn set_shard_source(&mut self, source: Arc<dyn ShardSource>, verify: bool) {
        self.shard_source = Some(source);
        self.cache = ShardCache::with_default_capacity(VerifyPolicy { enabled: verify });
    }

    /// Install a manifest without materializing anything (spec §4.1).
    /// Replacing the manifest while a model is loaded drops the
    /// existing weights — a stale `WeightSet` pointing at the old
    /// manifest's tensor table would silently corrupt lookups.
    pub fn set_manifest(&mut self, manifest: Manifest) {
        self.weights = None;
        self.manifest = Some(manifest);
    }

    /// Materialize every weight the model needs (spec §4.1, §4.6,
    /// §4.8). Atomic: on any error the `Loader`'s previously loaded
    /// `weights` (if any) are left untouched, and no partial `WeightSet`
    /// is ever installed (spec §8 scenario D — "zero allocated
    /// buffers" on integrity failure is the degenerate case of this
    /// same rule).
    pub async fn load(&mut self, model_id: &str, options: LoadOptions<'_>) -> Result<serde_json::Value> {
        // Spec §4.1 entry precondition: clear any prior model state
        // before doing any work, but keep the installed manifest/shard
        // source (`unload` never touches either). Without this a second
        // `load()` for a different model id would hit stale, unverified
        // shard bytes still sitting in `self.cache` from the first load.
        self.unload();

        let manifest =
            self.manifest.as_ref().ok_or_else(|| LoaderError::Parse("no manifest installed".into()))?;
        let source = self
            .shard_source
            .as_ref()
            .ok_or_else(|| LoaderError::Parse("no shard source installed".into()))?
            .clone();

        if let Some(progress) = options.on_progress {
            progress(ProgressEvent::stage_only(Stage::ParsingManifest, 0.0));
        }

        if is_cancelled(options.cancel) {
            return Err(LoaderError::Cancelled);
        }

        if options.verify_hashes {
            if let Some(progress) = options.on_progress {
                progress(ProgressEvent::stage_only(Stage::CheckingIntegrity, 0.0));
            }
            let report = crate::integrity::check(manifest, source.as_ref()).await;
            if !report.is_valid() {
                return Err(LoaderError::Integrity {
                    shard_index: report.missing.first().or(report.corrupt.first()).copied().unwrap_or(0),
                    reason: format!("missing={:?} corrupt={:?}", report.missing, report.corrupt),
                });
            }
        }

        if is_cancelled(options.cancel) {
            return Err(LoaderError::Cancelled);
        }

        let num_layers = manifest.num_layers(NUM_LAYERS_FIELDS, DEFAULT_NUM_LAYERS);
        let num_experts = NUM_EXPERTS_FIELDS
            .iter()
            .find_map(|field| manifest.config_field(field).and_then(|v| v.as_u64()))
            .map(|v| v as usize);

        let materializer = TensorMaterializer::new(manifest, &self.cache, source.as_ref(), &self.devices);
        let builder = WeightSetBuilder::new(manifest, &materializer, &self.resolver, &self.devices);

        let set = builder
            .build(num_layers, num_experts, options.cancel, |layer, total| {
                if let Some(progress) = options.on_progress {
                    progress(ProgressEvent::layer(Stage::MaterializingLayer, layer, total));
                }
            })
            .await?;

        if let Some(progress) = options.on_progress {
            progress(ProgressEvent::stage_only(Stage::MaterializingHead, 1.0));
            progress(ProgressEvent::stage_only(Stage::Done, 1.0));
        }

        let config = manifest.config.clone();
        self.weights = Some(set);
        self.current_model_id = Some(model_id.to_string());
        Ok(config)
    }

    /// Drop all materialized weights and clear the shard cache, but
    /// keep the installed manifest and shard source (spec §8 scenario F
    /// — "manifest-preservation across unload"): a subsequent `load()`
    /// for the same model_id does not require `set_manifest` again.
    pub fn unload(&mut self) {
        self.weights = None;
        self.current_model_id = None;
        self.cache.clear();
    }

    pub fn get_layer(&self, index: usize) -> Result<&LayerWeights> {
        let set = self.weights.as_ref().ok_or_else(|| LoaderError::NotFound("no model loaded".into()))?;
        set.layers.get(index).ok_or_else(|| LoaderError::NotFound(format!("layer {index}")))
    }

    /// Resolve expert `expert` of layer `index` on demand (spec §4.8).
    /// Only valid for MoE layers; a dense layer's `Mlp::Dense` has no
    /// experts to load.
    pub async fn load_expert(&self, index: usize, expert: usize) -> Result<ExpertWeights> {
        let manifest =
            self.manifest.as_ref().ok_or_else(|| LoaderError::Parse("no manifest installed".into()))?;
        let source = self
            .shard_source
            .as_ref()
            .ok_or_else(|| LoaderError::Parse("no shard source installed".into()))?;
        let layer = self.get_layer(index)?;
        let experts = match &layer.mlp {
            Mlp::Moe { experts, .. } => experts,
            Mlp::Dense { .. } => return Err(LoaderError::NotFound(format!("layer {index} has no experts"))),
        };

        let materializer = TensorMaterializer::new(manifest, &self.cache, source.as_ref(), &self.devices);
        let builder = WeightSetBuilder::new(manifest, &materializer, &self.resolver, &self.devices);
        builder.load_expert(index, expert, experts).await
    }

    pub fn get_config(&self) -> Option<&serde_json::Value> {
        self.manifest.as_ref().map(|m| &m.config)
    }

    pub fn stats(&self) -> LoaderStats {
        LoaderStats {
            live_buffers: self.devices.live_buffer_count(),
            bytes_acquired: self.devices.bytes_acquired(),
            cached_shards: self.cache.len(),
        }
    }

    pub fn current_model_id(&self) -> Option<&str> {
        self.current_model_id.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::HashAlgorithm;
    use crate::shard_source::InMemoryShardSource;

    fn tiny_manifest_and_blob() -> (Manifest, Vec<u8>) {
        let weight = |v: f32| -> Vec<u8> { bytemuck::cast_slice(&[v; 4]).to_vec() };
        let mut tensors = serde_json::Map::new();
        let mut blob = Vec::new();
        let mut push = |name: &str, value: f32, tensors: &mut serde_json::Map<String, serde_json::Value>| {
            let offset = blob.len() as u64;
            blob.extend_from_slice(&weight(value));
            tensors.insert(
                name.to_string(),
                serde_json::json!({"shard": 0, "offset": offset, "size": 16, "shape": [4], "dtype": "F32"}),
            );
        };
        for name in [
            "embed_tokens.weight",
            "layers.0.input_layernorm.weight",
            "layers.0.post_attention_layernorm.weight",
            "layers.0.self_attn.q_proj.weight",
            "layers.0.self_attn.k_proj.weight",
            "layers.0.self_attn.v_proj.weight",
            "layers.0.self_attn.o_proj.weight",
            "layers.0.mlp.gate_proj.weight",
            "layers.0.mlp.up_proj.weight",
            "layers.0.mlp.down_proj.weight",
            "norm.weight",
        ] {
            push(name, 1.0, &mut tensors);
        }
        let hash = HashAlgorithm::Sha256.hex_digest(&blob);
        let json = serde_json::json!({
            "version": 1, "modelId": "m", "architecture": "llama",
            "config": {"num_hidden_layers": 1},
            "shards": [{"index": 0, "filename": "s.bin", "size": blob.len(), "hash": hash}],
            "tensors": tensors, "hashAlgorithm": "sha256"
        });
        (Manifest::parse(&json.to_string()).unwrap(), blob)
    }

    #[tokio::test]
    async fn load_then_unload_preserves_manifest() {
        let (manifest, blob) = tiny_manifest_and_blob();
        let mut loader = Loader::init(DeviceRequest::Cpu).unwrap();
        loader.set_shard_source(Arc::new(InMemoryShardSource::new(vec![blob])), true);
        loader.set_manifest(manifest);

        loader.load("test-model", LoadOptions::default()).await.unwrap();
        assert!(loader.get_layer(0).is_ok());

        loader.unload();
        assert!(loader.get_layer(0).is_err());
        assert!(loader.get_config().is_some(), "manifest must survive unload");
        assert_eq!(loader.stats().cached_shards, 0);
    }

    #[tokio::test]
    async fn load_fails_atomically_without_shard_source() {
        let (manifest, _blob) = tiny_manifest_and_blob();
        let mut loader = Loader::init(DeviceRequest::Cpu).unwrap();
        loader.set_manifest(manifest);

        let err = loader.load("test-model", LoadOptions::default()).await.unwrap_err();
        assert!(matches!(err, LoaderError::Parse(_)));
        assert!(loader.get_layer(0).is_err());
    }

    #[tokio::test]
    async fn progress_callback_receives_done_stage() {
        let (manifest, blob) = tiny_manifest_and_blob();
        let mut loader = Loader::init(DeviceRequest::Cpu).unwrap();
        loader.set_shard_source(Arc::new(InMemoryShardSource::new(vec![blob])), true);
        loader.set_manifest(manifest);

        let seen = std::sync::Mutex::new(Vec::new());
        let callback = |event: ProgressEvent| seen.lock().unwrap().push(event.stage);
        loader
            .load("test-model", LoadOptions { verify_hashes: true, on_progress: Some(&callback), cancel: None })
            .await
            .unwrap();

        let stages = seen.into_inner().unwrap();
        assert_eq!(stages.last().copied(), Some(Stage::Done));
    }

    #[tokio::test]
    async fn cancelling_before_load_returns_cancelled_error() {
        let (manifest, blob) = tiny_manifest_and_blob();
        let mut loader = Loader::init(DeviceRequest::Cpu).unwrap();
        loader.set_shard_source(Arc::new(InMemoryShardSource::new(vec![blob])), true);
        loader.set_manifest(manifest);

        let cancel = std::sync::atomic::AtomicBool::new(true);
        let options = LoadOptions { verify_hashes: true, on_progress: None, cancel: Some(&cancel) };
        let err = loader.load("test-model", options).await.unwrap_err();
        assert!(matches!(err, LoaderError::Cancelled));
        assert_eq!(loader.stats().live_buffers, 0);
    }

    #[tokio::test]
    async fn missing_num_layers_field_falls_back_to_32() {
        let weight = |v: f32| -> Vec<u8> { bytemuck::cast_slice(&[v; 4]).to_vec() };
        let mut tensors = serde_json::Map::new();
        let mut blob = Vec::new();
        let offset = blob.len() as u64;
        blob.extend_from_slice(&weight(1.0));
        tensors.insert(
            "embed_tokens.weight".to_string(),
            serde_json::json!({"shard": 0, "offset": offset, "size": 16, "shape": [4], "dtype": "F32"}),
        );
        let hash = HashAlgorithm::Sha256.hex_digest(&blob);
        let json = serde_json::json!({
            "version": 1, "modelId": "m", "architecture": "llama", "config": {},
            "shards": [{"index": 0, "filename": "s.bin", "size": blob.len(), "hash": hash}],
            "tensors": tensors, "hashAlgorithm": "sha256"
        });
        let manifest = Manifest::parse(&json.to_string()).unwrap();
        assert_eq!(manifest.num_layers(NUM_LAYERS_FIELDS, DEFAULT_NUM_LAYERS), DEFAULT_NUM_LAYERS);
    }
}
