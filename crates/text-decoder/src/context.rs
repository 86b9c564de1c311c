//! Per-call computation scope.

use candle_core::{DType, Device};
use layers::PrecisionPolicy;

/// State threaded through one forward pass: the target device and the dtype
/// policy every layer casts through.
///
/// A context is created by the caller of [`TextModel::forward`] and borrowed by
/// each layer for the duration of the call; layers never keep it.
///
/// [`TextModel::forward`]: crate::TextModel::forward
#[derive(Debug, Clone)]
pub struct ForwardContext {
    device: Device,
    policy: PrecisionPolicy,
}

impl ForwardContext {
    pub fn new(device: Device, policy: PrecisionPolicy) -> Self {
        Self { device, policy }
    }

    /// Context whose policy is derived from the parameter dtype.
    pub fn for_dtype(device: Device, dtype: DType) -> Self {
        Self::new(device, PrecisionPolicy::from_parameter_dtype(dtype))
    }

    pub fn cpu() -> Self {
        Self::new(Device::Cpu, PrecisionPolicy::default())
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn policy(&self) -> &PrecisionPolicy {
        &self.policy
    }
}
