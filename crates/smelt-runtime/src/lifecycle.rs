//! Model lifecycle: planning loads and releasing resident handles.
//!
//! The pipeline keeps at most one resident model per logical role (primary /
//! grader). [`ModelSlot`] owns the handle for a role; [`plan_load`] turns a
//! device policy plus per-load toggles into the concrete [`LoadSpec`] handed
//! to the runtime. Sequencing loads and unloads so that device memory is
//! respected is the caller's job; the runtime performs the load it is asked
//! for and nothing more.

use crate::device::{Device, DevicePolicy, Precision, Quantization};
use crate::{ModelHandle, ModelRuntime};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Everything the runtime needs to load one model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadSpec {
    /// Base model weights location.
    pub model_path: PathBuf,
    /// Adapter weights to layer on top, if any.
    pub adapter_path: Option<PathBuf>,
    pub device: Device,
    pub precision: Precision,
    /// Quantize at load time; `None` loads full-precision weights.
    pub quantization: Option<Quantization>,
}

/// Decides device, precision, and quantization for one load.
///
/// Quantization applies only when it is enabled by policy, requested for
/// this load, and the load actually lands on an accelerator.
#[must_use]
pub fn plan_load(
    model_path: &Path,
    adapter_path: Option<&Path>,
    force_cpu: bool,
    allow_quantization: bool,
    policy: &DevicePolicy,
) -> LoadSpec {
    let accelerated = policy.accelerated() && !force_cpu;
    let device = if accelerated { policy.preferred.clone() } else { Device::Cpu };
    let precision = if accelerated { Precision::Half } else { Precision::BFloat16 };
    let quantization = (policy.quantization_enabled && allow_quantization && accelerated)
        .then(Quantization::four_bit);

    info!(
        model = %model_path.display(),
        device = %device,
        quantized = quantization.is_some(),
        ?precision,
        "planning model load"
    );

    LoadSpec {
        model_path: model_path.to_path_buf(),
        adapter_path: adapter_path.map(Path::to_path_buf),
        device,
        precision,
        quantization,
    }
}

/// Owner of at most one resident [`ModelHandle`] for a logical role.
///
/// Unloading drops the handle and asks the runtime to reclaim resources.
/// Unloading an empty slot is a no-op, so teardown paths may call it
/// unconditionally.
#[derive(Default)]
pub struct ModelSlot {
    inner: Option<ModelHandle>,
}

impl ModelSlot {
    #[must_use]
    pub fn empty() -> Self {
        Self { inner: None }
    }

    /// Places a freshly loaded handle into the slot, returning the previous
    /// occupant (which the caller should already have unloaded).
    pub fn place(&mut self, handle: ModelHandle) -> Option<ModelHandle> {
        self.inner.replace(handle)
    }

    #[must_use]
    pub fn handle(&self) -> Option<&ModelHandle> {
        self.inner.as_ref()
    }

    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.inner.is_some()
    }

    /// Releases the resident handle, if any, and triggers reclamation.
    pub fn unload(&mut self, runtime: &dyn ModelRuntime) {
        if let Some(handle) = self.inner.take() {
            info!(model = %handle.source.display(), "unloading model");
            drop(handle);
            runtime.reclaim();
        }
    }
}
