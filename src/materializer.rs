//! TensorMaterializer — turns one manifest tensor entry into a
//! `TensorHandle` (spec §4.6). This is the module the rest of the
//! loader's budget is spent on: resolve location, fetch spans through
//! the shard cache, decode, land on device.
//!
//! Grounded on the teacher's `load_model_by_id` tensor-copy loop in
//! `model.rs` (read safetensors view -> convert dtype -> write into the
//! `VarBuilder`) generalized from "one contiguous file view" to
//! "one-or-many cache-backed spans."
//!
//! `Placement::Device` routes block-quantized and BF16 payloads straight
//! through `dequant`'s device-side decoders (`dequantize_q4k_to_tensor`,
//! `widen_bf16_device`) instead of fully expanding to a host `Vec<f32>`
//! first — spec §4.4's "on-device conversion is mandatory for large
//! tensors" applies to every tensor landed on a device, not just a
//! hand-picked subset. `Placement::Host` (the diagnostic CLI's path)
//! still goes through the host reference decoders, since there is no
//! device to stage onto.

use candle_core::{DType, Tensor};

use crate::cache::ShardCache;
use crate::device::{DeviceBufferPool, TensorHandle};
use crate::dequant;
use crate::error::{LoaderError, Result};
use crate::manifest::{Dtype, Manifest, Span, TensorEntry};
use crate::shard_source::ShardSource;

/// Whether the caller wants the result staged into device memory or
/// handed back as host bytes (spec §4.6 step 7, `to_device=false`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Device,
    Host,
}

/// A fully host-resident materialization result, used when
/// `Placement::Host` is requested (e.g. by the diagnostic CLI).
pub enum Materialized {
    Device(TensorHandle),
    Host { shape: Vec<usize>, dtype: DType, bytes: Vec<u8> },
}

pub struct TensorMaterializer<'a> {
    manifest: &'a Manifest,
    cache: &'a ShardCache,
    source: &'a dyn ShardSource,
    devices: &'a DeviceBufferPool,
}

impl<'a> TensorMaterializer<'a> {
    pub fn new(
        manifest: &'a Manifest,
        cache: &'a ShardCache,
        source: &'a dyn ShardSource,
        devices: &'a DeviceBufferPool,
    ) -> Self {
        Self { manifest, cache, source, devices }
    }

    /// Materialize tensor `name`, trying each alias in `aliases` in
    /// order until one resolves (spec §4.7 feeds `aliases`; a bare
    /// lookup by exact name is just `aliases = [name]`).
    pub async fn materialize(
        &self,
        aliases: &[String],
        placement: Placement,
    ) -> Result<(String, Materialized)> {
        let (resolved_name, entry) = aliases
            .iter()
            .find_map(|alias| self.manifest.tensors.get(alias).map(|e| (alias.clone(), e)))
            .ok_or_else(|| LoaderError::NotFound(aliases.join(" | ")))?;

        let raw = self.gather_spans(&resolved_name, entry).await?;

        match placement {
            Placement::Host => {
                let decoded = self.decode_host(&resolved_name, entry, &raw)?;
                Ok((resolved_name, Materialized::Host {
                    shape: entry.shape.clone(),
                    dtype: entry.dtype.target_candle_dtype(),
                    bytes: decoded,
                }))
            }
            Placement::Device => {
                let tensor = self.decode_to_device(&resolved_name, entry, &raw)?;
                let byte_len = raw.len();
                let handle = self.devices.acquire(resolved_name.clone(), tensor, byte_len);
                Ok((resolved_name, Materialized::Device(handle)))
            }
        }
    }

    /// Fetch every span (through the shard cache) and concatenate into
    /// one contiguous byte buffer, in manifest-declared order (spec
    /// §4.6 steps 1-3). Spans are read sequentially — the spec's
    /// per-load ordering contract, not a parallelism opportunity.
    async fn gather_spans(&self, name: &str, entry: &TensorEntry) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(entry.location.total_size() as usize);
        for span in entry.location.spans() {
            let shard = self.cache.get(span.shard_index, self.manifest, self.source).await?;
            self.append_span(name, span, shard.as_slice(), &mut out)?;
        }
        Ok(out)
    }

    fn append_span(&self, name: &str, span: &Span, shard: &[u8], out: &mut Vec<u8>) -> Result<()> {
        let end = span.offset + span.size;
        if end > shard.len() as u64 {
            return Err(LoaderError::span_overrun(name, span.shard_index, span.offset, span.size, shard.len() as u64));
        }
        out.extend_from_slice(&shard[span.offset as usize..end as usize]);
        Ok(())
    }

    /// Host-side decode pass (spec §4.4, §4.6 step 4), used only by
    /// `Placement::Host`. Returns raw little-endian `target_candle_dtype`
    /// bytes.
    fn decode_host(&self, name: &str, entry: &TensorEntry, raw: &[u8]) -> Result<Vec<u8>> {
        match entry.dtype {
            Dtype::BlockQ4K => {
                let floats = decode_block_q4k_host(raw)?;
                Ok(bytemuck::cast_slice(&floats).to_vec())
            }
            Dtype::Bf16 => {
                let floats = dequant::widen_bf16_host(raw)?;
                Ok(bytemuck::cast_slice(&floats).to_vec())
            }
            Dtype::I32 => {
                let widened = widen_i32_to_i64(name, raw)?;
                Ok(bytemuck::cast_slice(&widened).to_vec())
            }
            Dtype::F32 | Dtype::F16 | Dtype::I64 | Dtype::U8 | Dtype::Bool => Ok(raw.to_vec()),
        }
    }

    /// Device-side decode pass (spec §4.4, §4.6 steps 2-4): block-
    /// quantized and BF16 payloads go straight through `dequant`'s
    /// device decoders rather than via a fully expanded host buffer.
    fn decode_to_device(&self, name: &str, entry: &TensorEntry, raw: &[u8]) -> Result<Tensor> {
        let device = self.devices.device();
        let shape = entry.shape.as_slice();

        match entry.dtype {
            Dtype::BlockQ4K => dequant::dequantize_q4k_to_tensor(raw, device, entry.dtype.target_candle_dtype()),
            Dtype::Bf16 => dequant::widen_bf16_device(raw, shape, device),
            Dtype::F16 => {
                // No device-native F16 widen kernel exists yet; fall back
                // to the host widen and land the result.
                let floats = dequant::widen_f16_host(raw)?;
                Ok(Tensor::from_slice(&floats, shape, device)?)
            }
            Dtype::I32 => {
                let widened = widen_i32_to_i64(name, raw)?;
                Ok(Tensor::from_slice(&widened, shape, device)?)
            }
            Dtype::F32 => {
                let floats: &[f32] = bytemuck::cast_slice(raw);
                Ok(Tensor::from_slice(floats, shape, device)?)
            }
            Dtype::I64 => {
                let ints: &[i64] = bytemuck::cast_slice(raw);
                Ok(Tensor::from_slice(ints, shape, device)?)
            }
            Dtype::U8 | Dtype::Bool => Ok(Tensor::from_slice(raw, shape, device)?),
        }
    }
}

fn widen_i32_to_i64(name: &str, raw: &[u8]) -> Result<Vec<i64>> {
    if raw.len() % 4 != 0 {
        return Err(LoaderError::Parse(format!("tensor '{name}': I32 payload not a multiple of 4 bytes")));
    }
    Ok(raw.chunks_exact(4).map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as i64).collect())
}

fn decode_block_q4k_host(raw: &[u8]) -> Result<Vec<f32>> {
    if raw.is_empty() || raw.len() % crate::manifest::Q4K_BLOCK_BYTES != 0 {
        return Err(LoaderError::Parse(format!(
            "block-quantized payload length {} is not a positive multiple of {}",
            raw.len(),
            crate::manifest::Q4K_BLOCK_BYTES
        )));
    }
    let num_blocks = raw.len() / crate::manifest::Q4K_BLOCK_BYTES;
    let mut out = Vec::with_capacity(num_blocks * crate::manifest::Q4K_BLOCK_ELEMENTS);
    for b in 0..num_blocks {
        let block = &raw[b * crate::manifest::Q4K_BLOCK_BYTES..(b + 1) * crate::manifest::Q4K_BLOCK_BYTES];
        out.extend_from_slice(&dequant::dequantize_block_q4k_reference(block)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::VerifyPolicy;
    use crate::device::DeviceRequest;
    use crate::manifest::HashAlgorithm;
    use crate::shard_source::InMemoryShardSource;

    fn manifest_single_shard_tensor(bytes: &[u8], shape: &[usize], dtype: &str) -> Manifest {
        let hash = HashAlgorithm::Sha256.hex_digest(bytes);
        let json = serde_json::json!({
            "version": 1, "modelId": "m", "architecture": "a", "config": {},
            "shards": [{"index": 0, "filename": "s.bin", "size": bytes.len(), "hash": hash}],
            "tensors": {
                "w": {"shard": 0, "offset": 0, "size": bytes.len(), "shape": shape, "dtype": dtype}
            },
            "hashAlgorithm": "sha256"
        });
        Manifest::parse(&json.to_string()).unwrap()
    }

    #[tokio::test]
    async fn materializes_dense_f32_tensor() {
        let floats: Vec<f32> = vec![1.0, 2.0, 3.0, 4.0];
        let bytes: Vec<u8> = bytemuck::cast_slice(&floats).to_vec();
        let manifest = manifest_single_shard_tensor(&bytes, &[4], "F32");
        let source = InMemoryShardSource::new(vec![bytes]);
        let cache = ShardCache::new(2, VerifyPolicy { enabled: true });
        let devices = DeviceBufferPool::new(DeviceRequest::Cpu).unwrap();
        let materializer = TensorMaterializer::new(&manifest, &cache, &source, &devices);

        let (name, result) = materializer.materialize(&["w".to_string()], Placement::Device).await.unwrap();
        assert_eq!(name, "w");
        match result {
            Materialized::Device(handle) => {
                assert_eq!(handle.shape(), vec![4]);
                let values: Vec<f32> = handle.tensor().to_vec1().unwrap();
                assert_eq!(values, floats);
            }
            _ => panic!("expected device placement"),
        }
    }

    #[tokio::test]
    async fn materializes_tensor_spanning_two_shards() {
        let first: Vec<u8> = bytemuck::cast_slice(&[1.0f32, 2.0]).to_vec();
        let second: Vec<u8> = bytemuck::cast_slice(&[3.0f32, 4.0]).to_vec();
        let hash0 = HashAlgorithm::Sha256.hex_digest(&first);
        let hash1 = HashAlgorithm::Sha256.hex_digest(&second);
        let json = serde_json::json!({
            "version": 1, "modelId": "m", "architecture": "a", "config": {},
            "shards": [
                {"index": 0, "filename": "a.bin", "size": first.len(), "hash": hash0},
                {"index": 1, "filename": "b.bin", "size": second.len(), "hash": hash1}
            ],
            "tensors": {
                "w": {"shape": [4], "dtype": "F32", "spans": [
                    {"shard": 0, "offset": 0, "size": first.len()},
                    {"shard": 1, "offset": 0, "size": second.len()}
                ]}
            },
            "hashAlgorithm": "sha256"
        });
        let manifest = Manifest::parse(&json.to_string()).unwrap();
        let source = InMemoryShardSource::new(vec![first, second]);
        let cache = ShardCache::new(2, VerifyPolicy { enabled: true });
        let devices = DeviceBufferPool::new(DeviceRequest::Cpu).unwrap();
        let materializer = TensorMaterializer::new(&manifest, &cache, &source, &devices);

        let (_, result) = materializer.materialize(&["w".to_string()], Placement::Device).await.unwrap();
        match result {
            Materialized::Device(handle) => {
                let values: Vec<f32> = handle.tensor().to_vec1().unwrap();
                assert_eq!(values, vec![1.0, 2.0, 3.0, 4.0]);
            }
            _ => panic!("expected device placement"),
        }
    }

    #[tokio::test]
    async fn falls_through_alias_list_to_first_match() {
        let floats: Vec<f32> = vec![5.0];
        let bytes: Vec<u8> = bytemuck::cast_slice(&floats).to_vec();
        let manifest = manifest_single_shard_tensor(&bytes, &[1], "F32");
        let source = InMemoryShardSource::new(vec![bytes]);
        let cache = ShardCache::new(2, VerifyPolicy { enabled: true });
        let devices = DeviceBufferPool::new(DeviceRequest::Cpu).unwrap();
        let materializer = TensorMaterializer::new(&manifest, &cache, &source, &devices);

        let (name, _) = materializer
            .materialize(&["model.w".to_string(), "w".to_string()], Placement::Device)
            .await
            .unwrap();
        assert_eq!(name, "w");
    }

    #[tokio::test]
    async fn reports_not_found_when_no_alias_resolves() {
        let manifest = manifest_single_shard_tensor(&[0u8; 4], &[1], "F32");
        let source = InMemoryShardSource::new(vec![vec![0u8; 4]]);
        let cache = ShardCache::new(2, VerifyPolicy { enabled: true });
        let devices = DeviceBufferPool::new(DeviceRequest::Cpu).unwrap();
        let materializer = TensorMaterializer::new(&manifest, &cache, &source, &devices);

        let err = materializer.materialize(&["missing".to_string()], Placement::Device).await.unwrap_err();
        assert!(matches!(err, LoaderError::NotFound(_)));
    }

    #[tokio::test]
    async fn span_overrun_produces_diagnostic_error() {
        // A span that the manifest itself would reject at parse time is
        // not reachable here; this exercises the materializer's own
        // guard against a shard that shrank between verify and fetch.
        let bytes: Vec<u8> = bytemuck::cast_slice(&[1.0f32, 2.0]).to_vec();
        let manifest = manifest_single_shard_tensor(&bytes, &[2], "F32");
        // Source returns a shard shorter than declared, bypassing cache
        // verification by disabling it for this test.
        let source = InMemoryShardSource::new(vec![vec![0u8; 2]]);
        let cache = ShardCache::new(2, VerifyPolicy { enabled: false });
        let devices = DeviceBufferPool::new(DeviceRequest::Cpu).unwrap();
        let materializer = TensorMaterializer::new(&manifest, &cache, &source, &devices);

        let err = materializer.materialize(&["w".to_string()], Placement::Device).await.unwrap_err();
        assert!(matches!(err, LoaderError::SpanOverrun { .. }));
    }

    /// `Placement::Device` for a block-quantized tensor must go through
    /// `dequant::dequantize_q4k_to_tensor`, not a host-expanded buffer —
    /// this reuses Scenario C's hand-worked block (d=1.0, dmin=0.5).
    #[tokio::test]
    async fn device_placement_dequantizes_block_q4k_via_device_path() {
        use half::f16;

        let mut block = vec![0u8; crate::manifest::Q4K_BLOCK_BYTES];
        block[0..2].copy_from_slice(&f16::from_f32(1.0).to_le_bytes());
        block[2..4].copy_from_slice(&f16::from_f32(0.5).to_le_bytes());
        block[4..16].copy_from_slice(&[1u8, 2, 3, 4, 1, 1, 1, 1, 0, 0, 0, 0]);
        for b in &mut block[16..144] {
            *b = 0xFF;
        }

        let manifest = manifest_single_shard_tensor(&block, &[256], "Q4_K");
        let source = InMemoryShardSource::new(vec![block.clone()]);
        let cache = ShardCache::new(2, VerifyPolicy { enabled: true });
        let devices = DeviceBufferPool::new(DeviceRequest::Cpu).unwrap();
        let materializer = TensorMaterializer::new(&manifest, &cache, &source, &devices);

        let (_, result) = materializer.materialize(&["w".to_string()], Placement::Device).await.unwrap();
        match result {
            Materialized::Device(handle) => {
                let values: Vec<f32> = handle.tensor().to_vec1().unwrap();
                assert!((values[0] - 14.5).abs() < 1e-3);
            }
            _ => panic!("expected device placement"),
        }
    }

    /// `Placement::Device` for a BF16 tensor must go through
    /// `dequant::widen_bf16_device`.
    #[tokio::test]
    async fn device_placement_widens_bf16_via_device_path() {
        use half::bf16;

        let values = [bf16::from_f32(3.5), bf16::from_f32(-1.25)];
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        let manifest = manifest_single_shard_tensor(&bytes, &[2], "BF16");
        let source = InMemoryShardSource::new(vec![bytes]);
        let cache = ShardCache::new(2, VerifyPolicy { enabled: true });
        let devices = DeviceBufferPool::new(DeviceRequest::Cpu).unwrap();
        let materializer = TensorMaterializer::new(&manifest, &cache, &source, &devices);

        let (_, result) = materializer.materialize(&["w".to_string()], Placement::Device).await.unwrap();
        match result {
            Materialized::Device(handle) => {
                let widened: Vec<f32> = handle.tensor().to_vec1().unwrap();
                assert!((widened[0] - 3.5).abs() < 1e-3);
                assert!((widened[1] - (-1.25)).abs() < 1e-3);
            }
            _ => panic!("expected device placement"),
        }
    }
}
