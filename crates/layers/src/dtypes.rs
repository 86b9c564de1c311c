//! Precision policy shared by every layer.
//!
//! Parameters may be stored in `f16`/`bf16` while matmuls and activations run
//! in `f32`. Normalisation statistics always accumulate in `f32`.

use candle_core::{DType, Result, Tensor};

/// Describes how tensors are cast during the phases of a forward pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrecisionPolicy {
    storage: DType,
    compute: DType,
    reduction: DType,
}

impl PrecisionPolicy {
    pub fn new(storage: DType, compute: DType, reduction: DType) -> Self {
        Self {
            storage,
            compute,
            reduction,
        }
    }

    /// Builds a policy from the dtype the weights are stored in.
    pub fn from_parameter_dtype(storage: DType) -> Self {
        let compute = match storage {
            DType::F16 | DType::BF16 => DType::F32,
            other => other,
        };
        let reduction = match storage {
            DType::F64 => DType::F64,
            _ => DType::F32,
        };
        Self::new(storage, compute, reduction)
    }

    pub fn storage(&self) -> DType {
        self.storage
    }

    pub fn compute(&self) -> DType {
        self.compute
    }

    pub fn reduction(&self) -> DType {
        self.reduction
    }

    /// Indicates whether any phase runs in a different dtype than storage.
    pub fn is_mixed_precision(&self) -> bool {
        self.storage != self.compute || self.compute != self.reduction
    }

    /// Casts a tensor to the compute dtype ahead of a matmul or activation.
    pub fn cast_for_matmul(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.compute)
    }

    /// Casts a tensor to the reduction dtype for statistics.
    pub fn cast_for_reduction(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.reduction)
    }

    /// Casts a tensor back to the storage dtype (no-op when already there).
    pub fn cast_to_storage(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.storage)
    }
}

impl Default for PrecisionPolicy {
    fn default() -> Self {
        Self::from_parameter_dtype(DType::F32)
    }
}

fn cast_tensor(tensor: &Tensor, dtype: DType) -> Result<Tensor> {
    if tensor.dtype() == dtype {
        Ok(tensor.clone())
    } else {
        tensor.to_dtype(dtype)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn half_precision_promotes_compute() {
        let policy = PrecisionPolicy::from_parameter_dtype(DType::BF16);
        assert_eq!(policy.storage(), DType::BF16);
        assert_eq!(policy.compute(), DType::F32);
        assert_eq!(policy.reduction(), DType::F32);
        assert!(policy.is_mixed_precision());
    }

    #[test]
    fn f32_policy_is_uniform() {
        let policy = PrecisionPolicy::default();
        assert!(!policy.is_mixed_precision());
    }

    #[test]
    fn round_trip_casts_back_to_storage() -> Result<()> {
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F16);
        let input = Tensor::ones((2, 3), DType::F16, &Device::Cpu)?;
        let compute = policy.cast_for_matmul(&input)?;
        assert_eq!(compute.dtype(), DType::F32);
        assert_eq!(policy.cast_to_storage(&compute)?.dtype(), DType::F16);
        Ok(())
    }
}
