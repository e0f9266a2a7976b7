//! DeviceBufferPool — device selection, buffer bookkeeping, and the
//! `TensorHandle` type tensors are materialized into (spec §4.5).
//!
//! Grounded on the teacher's device-selection fallback in
//! `quantized_model.rs::load_model` (`Device::cuda_if_available` ->
//! `Device::Cpu` on failure) and the buffer-accounting style of
//! `worker_pool.rs::PoolStats` (plain `AtomicUsize` counters behind a
//! small struct, no external metrics crate for a pool this size).

use std::sync::atomic::{AtomicUsize, Ordering};

use candle_core::{DType, Device, Tensor};

use crate::error::{LoaderError, Result};

/// Requested device kind (spec §4.5: "the loader never silently ignores
/// an explicit device request — CPU-only is a capability error, not a
/// fallback").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceRequest {
    Cpu,
    Cuda(usize),
    Metal(usize),
    /// Probe CUDA, then Metal, then fall back to CPU.
    Auto,
}

impl Default for DeviceRequest {
    fn default() -> Self {
        DeviceRequest::Auto
    }
}

fn resolve(request: DeviceRequest) -> Result<Device> {
    match request {
        DeviceRequest::Cpu => Ok(Device::Cpu),
        DeviceRequest::Cuda(ordinal) => {
            Device::new_cuda(ordinal).map_err(|e| LoaderError::Capability(format!("CUDA unavailable: {e}")))
        }
        DeviceRequest::Metal(ordinal) => {
            Device::new_metal(ordinal).map_err(|e| LoaderError::Capability(format!("Metal unavailable: {e}")))
        }
        DeviceRequest::Auto => {
            if let Ok(d) = Device::new_cuda(0) {
                return Ok(d);
            }
            if let Ok(d) = Device::new_metal(0) {
                return Ok(d);
            }
            tracing::info!("no accelerator probed successfully, falling back to CPU");
            Ok(Device::Cpu)
        }
    }
}

/// A materialized tensor, bound to the `Loader` that produced it (spec
/// §4.5 "handles do not outlive their loader"). Cloning a handle clones
/// the underlying Candle `Tensor`, which is itself a cheap refcounted
/// view, never a deep copy of device memory.
#[derive(Clone)]
pub struct TensorHandle {
    name: String,
    tensor: Tensor,
}

impl TensorHandle {
    pub fn new(name: impl Into<String>, tensor: Tensor) -> Self {
        Self { name: name.into(), tensor }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }

    pub fn shape(&self) -> Vec<usize> {
        self.tensor.dims().to_vec()
    }

    pub fn dtype(&self) -> DType {
        self.tensor.dtype()
    }
}

/// Owns the resolved `Device` for one `Loader` instance and counts live
/// buffers for `Loader::stats()`. Acquire/release is bookkeeping only —
/// actual device memory is reclaimed when the last `Tensor` clone drops,
/// same as the teacher never manually frees Candle tensors.
pub struct DeviceBufferPool {
    device: Device,
    live_buffers: AtomicUsize,
    bytes_acquired: AtomicUsize,
}

impl DeviceBufferPool {
    pub fn new(request: DeviceRequest) -> Result<Self> {
        let device = resolve(request)?;
        tracing::info!(?device, "device buffer pool initialized");
        Ok(Self { device, live_buffers: AtomicUsize::new(0), bytes_acquired: AtomicUsize::new(0) })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Whether this device can hold a 16-bit float buffer. Candle's CPU
    /// backend supports F16 storage even without kernel acceleration for
    /// every op, and the spec's downcast policy (`weights.rs`) only
    /// requires *storage* support — so every device this pool can
    /// resolve to counts as capable (open question 3 resolution).
    pub fn supports_f16(&self) -> bool {
        true
    }

    /// Record a buffer entering service and wrap it in a handle (spec
    /// §4.5 `acquire`). `byte_len` is informational, used only for
    /// `stats()`.
    pub fn acquire(&self, name: impl Into<String>, tensor: Tensor, byte_len: usize) -> TensorHandle {
        self.live_buffers.fetch_add(1, Ordering::Relaxed);
        self.bytes_acquired.fetch_add(byte_len, Ordering::Relaxed);
        TensorHandle::new(name, tensor)
    }

    /// Drop a handle's accounting entry (spec §4.5 `release`, called by
    /// `Loader::unload`). Does not touch the underlying `Tensor` — the
    /// caller is expected to drop its own clones.
    pub fn release(&self, _handle: &TensorHandle) {
        self.live_buffers.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn dtype_of(&self, handle: &TensorHandle) -> DType {
        handle.dtype()
    }

    pub fn live_buffer_count(&self) -> usize {
        self.live_buffers.load(Ordering::Relaxed)
    }

    pub fn bytes_acquired(&self) -> usize {
        self.bytes_acquired.load(Ordering::Relaxed)
    }
}
