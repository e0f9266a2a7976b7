//! Manifest — the parsed, immutable descriptor of shards and tensors.
//!
//! Mirrors the teacher's config-loading style (`LlamaConfig` deserialized
//! straight off `config.json` in `model.rs::load_model_by_id`) but adds
//! the validation the teacher leaves to Candle: span-sum/size invariants
//! are checked once, at parse time, so a bad manifest never reaches the
//! materializer.

use std::collections::HashMap;

use serde::Deserialize;

use crate::error::{LoaderError, Result};

/// Hash algorithm declared by (or defaulted for) the manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha256,
    Blake3,
}

impl HashAlgorithm {
    fn parse(tag: &str) -> Result<Self> {
        match tag {
            "sha256" => Ok(HashAlgorithm::Sha256),
            "blake3" => Ok(HashAlgorithm::Blake3),
            other => Err(LoaderError::Parse(format!(
                "unknown hashAlgorithm '{other}' (expected 'sha256' or 'blake3')"
            ))),
        }
    }

    pub fn hex_digest(self, bytes: &[u8]) -> String {
        match self {
            HashAlgorithm::Sha256 => {
                use sha2::Digest;
                hex::encode(sha2::Sha256::digest(bytes))
            }
            HashAlgorithm::Blake3 => hex::encode(blake3::hash(bytes).as_bytes()),
        }
    }
}

/// One shard entry: `{index, filename, size, hash}`.
#[derive(Debug, Clone)]
pub struct ShardInfo {
    pub index: usize,
    pub filename: String,
    pub size: u64,
    pub hash: String,
}

/// A `(shard, offset, size)` slice. Spans are listed in reading order.
#[derive(Debug, Clone, Copy)]
pub struct Span {
    pub shard_index: usize,
    pub offset: u64,
    pub size: u64,
}

/// Either a single-shard location or an ordered list of cross-shard spans.
#[derive(Debug, Clone)]
pub enum TensorLocation {
    Single(Span),
    Spanned(Vec<Span>),
}

impl TensorLocation {
    pub fn spans(&self) -> &[Span] {
        match self {
            TensorLocation::Single(s) => std::slice::from_ref(s),
            TensorLocation::Spanned(v) => v,
        }
    }

    pub fn total_size(&self) -> u64 {
        self.spans().iter().map(|s| s.size).sum()
    }
}

/// Element dtype, tagged per spec §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dtype {
    F32,
    F16,
    Bf16,
    /// Block-quantized 4-bit scheme, 144 bytes / 256 elements (§4.4, §6).
    BlockQ4K,
    I32,
    I64,
    U8,
    Bool,
}

/// Fixed on-disk block layout for `BlockQ4K` (spec §6).
pub const Q4K_BLOCK_ELEMENTS: usize = 256;
pub const Q4K_BLOCK_BYTES: usize = 144;

impl Dtype {
    fn parse(tag: &str) -> Result<Self> {
        match tag {
            "F32" => Ok(Dtype::F32),
            "F16" => Ok(Dtype::F16),
            "BF16" => Ok(Dtype::Bf16),
            "Q4_K" | "BLOCK_Q4K" => Ok(Dtype::BlockQ4K),
            "I32" => Ok(Dtype::I32),
            "I64" => Ok(Dtype::I64),
            "U8" => Ok(Dtype::U8),
            "BOOL" => Ok(Dtype::Bool),
            other => Err(LoaderError::Parse(format!("unknown dtype '{other}'"))),
        }
    }

    /// Whether this dtype requires a dequantization/widening pass before
    /// use (spec §3, §4.4).
    pub fn requires_decode(self) -> bool {
        matches!(self, Dtype::BlockQ4K | Dtype::Bf16)
    }

    /// Byte width of one element, for non-block dtypes. `BlockQ4K` has no
    /// per-element width — use `Q4K_BLOCK_BYTES` / `Q4K_BLOCK_ELEMENTS`.
    pub fn element_width(self) -> Option<usize> {
        match self {
            Dtype::F32 | Dtype::I32 => Some(4),
            Dtype::F16 | Dtype::Bf16 => Some(2),
            Dtype::I64 => Some(8),
            Dtype::U8 | Dtype::Bool => Some(1),
            Dtype::BlockQ4K => None,
        }
    }

    /// Candle dtype this tensor targets once materialized (pre-downcast).
    pub fn target_candle_dtype(self) -> candle_core::DType {
        match self {
            Dtype::F32 | Dtype::BlockQ4K | Dtype::Bf16 | Dtype::F16 => candle_core::DType::F32,
            Dtype::I32 => candle_core::DType::I64,
            Dtype::I64 => candle_core::DType::I64,
            Dtype::U8 | Dtype::Bool => candle_core::DType::U8,
        }
    }
}

/// One entry of the manifest's tensor table.
#[derive(Debug, Clone)]
pub struct TensorEntry {
    pub dtype: Dtype,
    pub shape: Vec<usize>,
    pub location: TensorLocation,
}

impl TensorEntry {
    fn shape_product(&self) -> u64 {
        self.shape.iter().map(|&d| d as u64).product()
    }

    /// Invariant 1 (spec §8): span-size sum matches `size`, which
    /// matches shape×width (or an integer multiple of the block size).
    fn validate(&self, name: &str) -> Result<()> {
        let total = self.location.total_size();
        match self.dtype.element_width() {
            Some(width) => {
                let expected = self.shape_product() * width as u64;
                if total != expected {
                    return Err(LoaderError::Parse(format!(
                        "tensor '{name}': span total {total} does not match shape×width {expected}"
                    )));
                }
            }
            None => {
                if total == 0 || total % Q4K_BLOCK_BYTES as u64 != 0 {
                    return Err(LoaderError::Parse(format!(
                        "tensor '{name}': block-quantized size {total} is not a positive multiple of {Q4K_BLOCK_BYTES}"
                    )));
                }
                let elements = (total / Q4K_BLOCK_BYTES as u64) * Q4K_BLOCK_ELEMENTS as u64;
                if elements != self.shape_product() {
                    return Err(LoaderError::Parse(format!(
                        "tensor '{name}': block-quantized element count {elements} does not match shape product {}",
                        self.shape_product()
                    )));
                }
            }
        }
        Ok(())
    }
}

/// The parsed, immutable manifest. Frozen once `Manifest::parse` returns;
/// may be freely shared (spec §5 "Shared-resource policy").
#[derive(Debug, Clone)]
pub struct Manifest {
    pub version: u32,
    pub model_id: String,
    pub architecture: String,
    pub config: serde_json::Value,
    pub shards: Vec<ShardInfo>,
    pub tensors: HashMap<String, TensorEntry>,
    pub quantization: Option<serde_json::Value>,
    pub hash_algorithm: HashAlgorithm,
    pub source_format: Option<String>,
    pub moe_config: Option<serde_json::Value>,
}

// --- raw JSON shape -------------------------------------------------------

#[derive(Deserialize)]
struct RawManifest {
    version: u32,
    #[serde(rename = "modelId")]
    model_id: String,
    architecture: String,
    #[serde(default)]
    config: serde_json::Value,
    shards: Vec<RawShard>,
    tensors: HashMap<String, RawTensor>,
    #[serde(default)]
    quantization: Option<serde_json::Value>,
    #[serde(rename = "hashAlgorithm", default)]
    hash_algorithm: Option<String>,
    #[serde(rename = "sourceFormat", default)]
    source_format: Option<String>,
    #[serde(rename = "moeConfig", default)]
    moe_config: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct RawShard {
    index: usize,
    filename: String,
    size: u64,
    #[serde(default)]
    hash: Option<String>,
    #[serde(default)]
    blake3: Option<String>,
    #[serde(default)]
    sha256: Option<String>,
}

#[derive(Deserialize)]
struct RawTensor {
    dtype: String,
    shape: Vec<usize>,
    #[serde(default)]
    shard: Option<usize>,
    #[serde(default)]
    offset: Option<u64>,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    spans: Option<Vec<RawSpan>>,
}

#[derive(Deserialize)]
struct RawSpan {
    shard: usize,
    offset: u64,
    size: u64,
}

impl Manifest {
    /// Parse and validate a manifest from its JSON representation
    /// (spec §6). Open question 1: a legacy manifest with no
    /// `hashAlgorithm` defaults to SHA-256; an explicit but unrecognized
    /// tag is a hard `Parse` error rather than a silent fallback.
    pub fn parse(json: &str) -> Result<Self> {
        let raw: RawManifest = serde_json::from_str(json)?;

        let mut per_shard_algorithm: Option<HashAlgorithm> = None;
        let mut shards = Vec::with_capacity(raw.shards.len());
        for s in raw.shards {
            let (hash, inferred) = if let Some(h) = s.hash {
                (h, None)
            } else if let Some(h) = s.blake3 {
                (h, Some(HashAlgorithm::Blake3))
            } else if let Some(h) = s.sha256 {
                (h, Some(HashAlgorithm::Sha256))
            } else {
                return Err(LoaderError::Parse(format!(
                    "shard {} has no hash, blake3, or sha256 field",
                    s.index
                )));
            };
            if let Some(alg) = inferred {
                per_shard_algorithm.get_or_insert(alg);
            }
            shards.push(ShardInfo { index: s.index, filename: s.filename, size: s.size, hash });
        }
        shards.sort_by_key(|s| s.index);

        let hash_algorithm = match raw.hash_algorithm {
            Some(tag) => HashAlgorithm::parse(&tag)?,
            None => per_shard_algorithm.unwrap_or(HashAlgorithm::Sha256),
        };

        let mut tensors = HashMap::with_capacity(raw.tensors.len());
        for (name, t) in raw.tensors {
            let dtype = Dtype::parse(&t.dtype)?;
            let location = if let Some(spans) = t.spans {
                if spans.is_empty() {
                    return Err(LoaderError::Parse(format!("tensor '{name}' has empty spans list")));
                }
                TensorLocation::Spanned(
                    spans
                        .into_iter()
                        .map(|s| Span { shard_index: s.shard, offset: s.offset, size: s.size })
                        .collect(),
                )
            } else {
                let shard_index = t.shard.ok_or_else(|| {
                    LoaderError::Parse(format!("tensor '{name}' has neither shard/offset/size nor spans"))
                })?;
                let offset = t.offset.unwrap_or(0);
                let size = t
                    .size
                    .ok_or_else(|| LoaderError::Parse(format!("tensor '{name}' missing 'size'")))?;
                TensorLocation::Single(Span { shard_index, offset, size })
            };

            let entry = TensorEntry { dtype, shape: t.shape, location };
            entry.validate(&name)?;
            tensors.insert(name, entry);
        }

        // Invariant 2: every span's offset+size must fit inside its
        // declared shard. (Re-checked again per fetched shard length at
        // materialization time — this is the manifest-declared version.)
        let shard_sizes: HashMap<usize, u64> = shards.iter().map(|s| (s.index, s.size)).collect();
        for (name, entry) in &tensors {
            for span in entry.location.spans() {
                let declared = shard_sizes.get(&span.shard_index).ok_or_else(|| {
                    LoaderError::Parse(format!(
                        "tensor '{name}' references unknown shard {}",
                        span.shard_index
                    ))
                })?;
                if span.offset + span.size > *declared {
                    return Err(LoaderError::Parse(format!(
                        "tensor '{name}' span {:?} exceeds declared shard {} size {}",
                        span, span.shard_index, declared
                    )));
                }
            }
        }

        Ok(Manifest {
            version: raw.version,
            model_id: raw.model_id,
            architecture: raw.architecture,
            config: raw.config,
            shards,
            tensors,
            quantization: raw.quantization,
            hash_algorithm,
            source_format: raw.source_format,
            moe_config: raw.moe_config,
        })
    }

    pub fn shard(&self, index: usize) -> Option<&ShardInfo> {
        self.shards.iter().find(|s| s.index == index)
    }

    /// Look up a config field, trying `text_config.<name>` before
    /// top-level `<name>` (spec §6: "text-submodel config may live under
    /// `text_config`").
    pub fn config_field(&self, name: &str) -> Option<&serde_json::Value> {
        self.config
            .get("text_config")
            .and_then(|tc| tc.get(name))
            .or_else(|| self.config.get(name))
    }

    pub fn num_layers(&self, known_fields: &[&str], fallback: usize) -> usize {
        for field in known_fields {
            if let Some(v) = self.config_field(field).and_then(|v| v.as_u64()) {
                return v as usize;
            }
        }
        fallback
    }
}
