//! WeightSetBuilder — drives materialization of every named parameter
//! group a loaded model needs: embeddings, per-layer attention/MLP/MoE
//! blocks, final norm, and the (possibly tied) LM head (spec §4.8).
//!
//! Grounded on `candle_adapter.rs`'s `load_weights`/`build_layers` flow
//! (sequential per-layer construction, norm/attn/mlp in that order,
//! shared embedding table reused for the head) generalized to the
//! spec's alias-resolution and lazy-expert rules.

use std::sync::Arc;

use dashmap::DashMap;

use crate::device::TensorHandle;
use crate::error::{LoaderError, Result};
use crate::manifest::Manifest;
use crate::materializer::{Materialized, Placement, TensorMaterializer};
use crate::resolver::{LogicalName, NameResolver};

/// Parameter suffixes eligible for the downcast-to-F16 policy (spec
/// §4.8 open question 3): only the large matrix-multiply weights: never
/// norms, biases, or embeddings, which need their full-precision range.
const MATMUL_WEIGHT_SUFFIXES: &[&str] = &[
    "self_attn.q_proj.weight",
    "self_attn.k_proj.weight",
    "self_attn.v_proj.weight",
    "self_attn.o_proj.weight",
    "mlp.gate_proj.weight",
    "mlp.up_proj.weight",
    "mlp.down_proj.weight",
    "lm_head.weight",
];

fn is_matmul_weight(suffix: &str) -> bool {
    MATMUL_WEIGHT_SUFFIXES.contains(&suffix)
}

/// Checkpoint formats that store RMSNorm weight as `w - 1` rather than
/// the applied `1 + w`, requiring the offset to be added back at load
/// time (spec §4.8 open question 3). Formats not in this list are
/// assumed to already bake the `+1` into the stored value.
fn norm_needs_offset(manifest: &Manifest) -> bool {
    matches!(manifest.source_format.as_deref(), Some("gemma") | Some("gemma2"))
}

fn apply_norm_offset(manifest: &Manifest, tensor: candle_core::Tensor) -> Result<candle_core::Tensor> {
    if norm_needs_offset(manifest) {
        Ok(tensor.affine(1.0, 1.0)?)
    } else {
        Ok(tensor)
    }
}

fn maybe_downcast(devices: &crate::device::DeviceBufferPool, suffix: &str, tensor: candle_core::Tensor) -> Result<candle_core::Tensor> {
    if is_matmul_weight(suffix) && devices.supports_f16() {
        Ok(tensor.to_dtype(candle_core::DType::F16)?)
    } else {
        Ok(tensor)
    }
}

/// One transformer layer's weights. MoE models populate `mlp` with
/// `Mlp::Moe`; dense models populate `Mlp::Dense`. The five optional
/// fields are per-layer roles spec §4.8 point 2 says "any subset may be
/// present" — absence is not an error, just `None`.
pub struct LayerWeights {
    pub input_layernorm: TensorHandle,
    pub post_attention_layernorm: TensorHandle,
    pub pre_ff_norm: Option<TensorHandle>,
    pub post_ff_norm: Option<TensorHandle>,
    pub q_norm: Option<TensorHandle>,
    pub k_norm: Option<TensorHandle>,
    pub attn_q: TensorHandle,
    pub attn_k: TensorHandle,
    pub attn_v: TensorHandle,
    pub attn_o: TensorHandle,
    pub attention_sink: Option<TensorHandle>,
    pub mlp: Mlp,
}

pub enum Mlp {
    Dense { gate: TensorHandle, up: TensorHandle, down: TensorHandle },
    Moe { router: RouterWeights, experts: ExpertsRecord },
}

/// MoE gating weight and optional bias for one layer (spec §4.8 point
/// 3: "load router weight and optional router bias").
pub struct RouterWeights {
    pub weight: TensorHandle,
    pub bias: Option<TensorHandle>,
}

/// How a layer's experts are stored (spec §4.8 point 3 /
/// `ExpertWeights` in spec §3): either one shared tensor per role
/// covering every expert (loaded once, views taken per expert), or one
/// triple per expert loaded lazily on first `load_expert` request.
pub enum ExpertsRecord {
    Packed { gate: TensorHandle, up: TensorHandle, down: TensorHandle, num_experts: usize },
    PerExpert { cache: Arc<DashMap<usize, ExpertWeights>>, num_experts: usize },
}

#[derive(Clone)]
pub struct ExpertWeights {
    pub gate: TensorHandle,
    pub up: TensorHandle,
    pub down: TensorHandle,
}

/// The fully resolved set of weights for one loaded model (spec §4.8).
pub struct WeightSet {
    pub embeddings: TensorHandle,
    pub layers: Vec<LayerWeights>,
    pub final_norm: TensorHandle,
    /// `true` when this handle is the embeddings table reused as-is
    /// (object-identical, no copy) rather than an independently
    /// materialized `lm_head.weight` (spec §4.8 "tied embeddings").
    pub lm_head_tied: bool,
    pub lm_head: TensorHandle,
}

pub struct WeightSetBuilder<'a> {
    manifest: &'a Manifest,
    materializer: &'a TensorMaterializer<'a>,
    resolver: &'a NameResolver,
    devices: &'a crate::device::DeviceBufferPool,
}

impl<'a> WeightSetBuilder<'a> {
    pub fn new(
        manifest: &'a Manifest,
        materializer: &'a TensorMaterializer<'a>,
        resolver: &'a NameResolver,
        devices: &'a crate::device::DeviceBufferPool,
    ) -> Self {
        Self { manifest, materializer, resolver, devices }
    }

    async fn materialize_named(&self, name: &LogicalName) -> Result<TensorHandle> {
        let aliases = self.resolver.candidates(name);
        let (_, materialized) = self.materializer.materialize(&aliases, Placement::Device).await?;
        match materialized {
            Materialized::Device(handle) => Ok(handle),
            Materialized::Host { .. } => unreachable!("Placement::Device always yields Materialized::Device"),
        }
    }

    async fn materialize_matmul(&self, name: &LogicalName, suffix: &str) -> Result<TensorHandle> {
        let handle = self.materialize_named(name).await?;
        let downcast = maybe_downcast(self.devices, suffix, handle.tensor().clone())?;
        Ok(TensorHandle::new(handle.name().to_string(), downcast))
    }

    async fn materialize_norm(&self, name: &LogicalName) -> Result<TensorHandle> {
        let handle = self.materialize_named(name).await?;
        let adjusted = apply_norm_offset(self.manifest, handle.tensor().clone())?;
        Ok(TensorHandle::new(handle.name().to_string(), adjusted))
    }

    /// Like `materialize_named`, but a `NotFound` alias resolution is not
    /// an error — it means this optional role is absent from the
    /// checkpoint (spec §4.8 point 2: "any subset may be present").
    async fn materialize_named_optional(&self, name: &LogicalName) -> Result<Option<TensorHandle>> {
        match self.materialize_named(name).await {
            Ok(handle) => Ok(Some(handle)),
            Err(LoaderError::NotFound(_)) => Ok(None),
            Err(other) => Err(other),
        }
    }

    async fn materialize_matmul_optional(&self, name: &LogicalName, suffix: &str) -> Result<Option<TensorHandle>> {
        match self.materialize_matmul(name, suffix).await {
            Ok(handle) => Ok(Some(handle)),
            Err(LoaderError::NotFound(_)) => Ok(None),
            Err(other) => Err(other),
        }
    }

    async fn materialize_norm_optional(&self, name: &LogicalName) -> Result<Option<TensorHandle>> {
        match self.materialize_norm(name).await {
            Ok(handle) => Ok(Some(handle)),
            Err(LoaderError::NotFound(_)) => Ok(None),
            Err(other) => Err(other),
        }
    }

    /// Progress-aware driver over every layer (spec §4.8 step order:
    /// embeddings -> per-layer -> final norm -> LM head). `on_progress`
    /// is called once per completed layer with `(index, total)`. `cancel`
    /// is polled at each suspension point (spec §5 cooperative
    /// cancellation); when set, `Err(LoaderError::Cancelled)` is returned
    /// instead of continuing.
    pub async fn build(
        &self,
        num_layers: usize,
        num_experts: Option<usize>,
        cancel: Option<&std::sync::atomic::AtomicBool>,
        on_progress: impl Fn(usize, usize),
    ) -> Result<WeightSet> {
        let is_cancelled = || cancel.map_or(false, |flag| flag.load(std::sync::atomic::Ordering::Relaxed));

        let embeddings = self.materialize_named(&LogicalName::Embeddings).await?;

        let mut layers = Vec::with_capacity(num_layers);
        for index in 0..num_layers {
            if is_cancelled() {
                return Err(LoaderError::Cancelled);
            }
            layers.push(self.build_layer(index, num_experts).await?);
            on_progress(index + 1, num_layers);
        }

        if is_cancelled() {
            return Err(LoaderError::Cancelled);
        }

        let final_norm = self.materialize_norm(&LogicalName::FinalNorm).await?;

        let (lm_head, lm_head_tied) = match self.materialize_matmul(&LogicalName::LmHead, "lm_head.weight").await {
            Ok(handle) => (handle, false),
            Err(LoaderError::NotFound(_)) => {
                tracing::debug!("no independent lm_head.weight found, tying to embeddings");
                (embeddings.clone(), true)
            }
            Err(other) => return Err(other),
        };

        Ok(WeightSet { embeddings, layers, final_norm, lm_head_tied, lm_head })
    }

    async fn build_layer(&self, index: usize, num_experts: Option<usize>) -> Result<LayerWeights> {
        let input_layernorm = self
            .materialize_norm(&LogicalName::Layer { index, suffix: "input_layernorm.weight" })
            .await?;
        let post_attention_layernorm = self
            .materialize_norm(&LogicalName::Layer { index, suffix: "post_attention_layernorm.weight" })
            .await?;
        let pre_ff_norm = self
            .materialize_norm_optional(&LogicalName::Layer { index, suffix: "pre_feedforward_layernorm.weight" })
            .await?;
        let post_ff_norm = self
            .materialize_norm_optional(&LogicalName::Layer { index, suffix: "post_feedforward_layernorm.weight" })
            .await?;
        let q_norm = self
            .materialize_norm_optional(&LogicalName::Layer { index, suffix: "self_attn.q_norm.weight" })
            .await?;
        let k_norm = self
            .materialize_norm_optional(&LogicalName::Layer { index, suffix: "self_attn.k_norm.weight" })
            .await?;

        let attn_q = self
            .materialize_matmul(&LogicalName::Layer { index, suffix: "self_attn.q_proj.weight" }, "self_attn.q_proj.weight")
            .await?;
        let attn_k = self
            .materialize_matmul(&LogicalName::Layer { index, suffix: "self_attn.k_proj.weight" }, "self_attn.k_proj.weight")
            .await?;
        let attn_v = self
            .materialize_matmul(&LogicalName::Layer { index, suffix: "self_attn.v_proj.weight" }, "self_attn.v_proj.weight")
            .await?;
        let attn_o = self
            .materialize_matmul(&LogicalName::Layer { index, suffix: "self_attn.o_proj.weight" }, "self_attn.o_proj.weight")
            .await?;

        let attention_sink =
            self.materialize_named_optional(&LogicalName::Layer { index, suffix: "self_attn.sinks" }).await?;

        let mlp = match num_experts {
            None => {
                let gate = self
                    .materialize_matmul(&LogicalName::Layer { index, suffix: "mlp.gate_proj.weight" }, "mlp.gate_proj.weight")
                    .await?;
                let up = self
                    .materialize_matmul(&LogicalName::Layer { index, suffix: "mlp.up_proj.weight" }, "mlp.up_proj.weight")
                    .await?;
                let down = self
                    .materialize_matmul(&LogicalName::Layer { index, suffix: "mlp.down_proj.weight" }, "mlp.down_proj.weight")
                    .await?;
                Mlp::Dense { gate, up, down }
            }
            Some(num_experts) => {
                let router = self.build_router(index).await?;
                let experts = self.build_experts_record(index, num_experts).await?;
                Mlp::Moe { router, experts }
            }
        };

        Ok(LayerWeights {
            input_layernorm,
            post_attention_layernorm,
            pre_ff_norm,
            post_ff_norm,
            q_norm,
            k_norm,
            attn_q,
            attn_k,
            attn_v,
            attn_o,
            attention_sink,
            mlp,
        })
    }

    /// Router weight (required) and optional bias for one expert-bearing
    /// layer (spec §4.8 point 3).
    async fn build_router(&self, index: usize) -> Result<RouterWeights> {
        let weight = self
            .materialize_named(&LogicalName::Layer { index, suffix: "block_sparse_moe.gate.weight" })
            .await?;
        let bias = self
            .materialize_named_optional(&LogicalName::Layer { index, suffix: "block_sparse_moe.gate.bias" })
            .await?;
        Ok(RouterWeights { weight, bias })
    }

    /// Probe for a packed per-role expert tensor (one shared tensor
    /// covering every expert of the layer) before falling back to the
    /// lazy per-expert dense-triple mode (spec §4.8 point 3, §3
    /// `ExpertWeights`: "a packed record is loaded once per layer and
    /// shared; per-expert records are loaded on demand").
    async fn build_experts_record(&self, index: usize, num_experts: usize) -> Result<ExpertsRecord> {
        let gate = self
            .materialize_matmul_optional(
                &LogicalName::Layer { index, suffix: "block_sparse_moe.experts.gate_proj.weight" },
                "mlp.gate_proj.weight",
            )
            .await?;
        let Some(gate) = gate else {
            return Ok(ExpertsRecord::PerExpert { cache: Arc::new(DashMap::new()), num_experts });
        };

        let up = self
            .materialize_matmul(
                &LogicalName::Layer { index, suffix: "block_sparse_moe.experts.up_proj.weight" },
                "mlp.up_proj.weight",
            )
            .await?;
        let down = self
            .materialize_matmul(
                &LogicalName::Layer { index, suffix: "block_sparse_moe.experts.down_proj.weight" },
                "mlp.down_proj.weight",
            )
            .await?;
        Ok(ExpertsRecord::Packed { gate, up, down, num_experts })
    }

    /// Resolve one MoE expert's weights on demand (spec §4.8 point 3).
    /// Packed layers return a cheap view into the shared tensor; dense
    /// per-expert layers cache the result so a repeated request for the
    /// same `(layer, expert)` is a cache hit rather than a refetch.
    pub async fn load_expert(&self, layer: usize, expert: usize, record: &ExpertsRecord) -> Result<ExpertWeights> {
        match record {
            ExpertsRecord::Packed { gate, up, down, num_experts } => {
                if expert >= *num_experts {
                    return Err(LoaderError::NotFound(format!(
                        "expert {expert} of layer {layer} (layer has {num_experts} experts)"
                    )));
                }
                Ok(ExpertWeights {
                    gate: packed_expert_view(gate, expert)?,
                    up: packed_expert_view(up, expert)?,
                    down: packed_expert_view(down, expert)?,
                })
            }
            ExpertsRecord::PerExpert { cache, num_experts } => {
                if expert >= *num_experts {
                    return Err(LoaderError::NotFound(format!(
                        "expert {expert} of layer {layer} (layer has {num_experts} experts)"
                    )));
                }
                if let Some(cached) = cache.get(&expert) {
                    return Ok(cached.clone());
                }

                let gate = self
                    .materialize_matmul(
                        &LogicalName::Expert { layer, expert, suffix: "w1.weight" },
                        "mlp.gate_proj.weight",
                    )
                    .await?;
                let up = self
                    .materialize_matmul(
                        &LogicalName::Expert { layer, expert, suffix: "w3.weight" },
                        "mlp.up_proj.weight",
                    )
                    .await?;
                let down = self
                    .materialize_matmul(
                        &LogicalName::Expert { layer, expert, suffix: "w2.weight" },
                        "mlp.down_proj.weight",
                    )
                    .await?;

                let weights = ExpertWeights { gate, up, down };
                cache.insert(expert, weights.clone());
                Ok(weights)
            }
        }
    }
}

/// A per-expert view into a packed tensor (spec §3 `ExpertWeights`:
/// "the per-expert view being a pair `(expert_index, packed_record_ref)`").
/// `Tensor::get` narrows along dim 0 without copying device memory.
fn packed_expert_view(handle: &TensorHandle, expert: usize) -> Result<TensorHandle> {
    let view = handle.tensor().get(expert)?;
    Ok(TensorHandle::new(format!("{}[{expert}]", handle.name()), view))
}
