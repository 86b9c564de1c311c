//! Root-mean-square normalisation.
//!
//! Normalisation happens along the trailing axis, so the same layer serves
//! `(batch, seq, hidden)` hidden states and `(batch, seq, heads, head_dim)`
//! per-head query/key tensors. Statistics accumulate in
//! [`PrecisionPolicy::reduction`] before the result is cast back to storage.

use candle_core::{Result, Tensor, D};
use candle_nn::{init, VarBuilder};

use crate::{checks, dtypes::PrecisionPolicy};

/// RMSNorm with a learnable scale, as used by LLaMA-style blocks.
#[derive(Debug, Clone)]
pub struct RmsNorm {
    hidden_size: usize,
    epsilon: f64,
    weight: Tensor,
}

impl RmsNorm {
    pub fn new(weight: Tensor, epsilon: f64) -> Result<Self> {
        checks::expect_rank("rms_norm.weight", &weight, 1)?;
        checks::expect_dtype_in("rms_norm.weight", &weight, checks::PARAMETER_DTYPES)?;
        if !(epsilon > 0.0) {
            candle_core::bail!("rms_norm epsilon must be positive, got {epsilon}");
        }
        Ok(Self {
            hidden_size: weight.dims1()?,
            epsilon,
            weight,
        })
    }

    /// Loads the scale vector (`weight`) from `vb`; fresh variables start at one.
    pub fn load(hidden_size: usize, epsilon: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(hidden_size, "weight", init::ONE)?;
        Self::new(weight, epsilon)
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    pub fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_last_dim("rms_norm.input", hidden, self.hidden_size)?;

        let compute = policy.cast_for_reduction(hidden)?;
        let mean_sq = compute.sqr()?.mean_keepdim(D::Minus1)?;
        let denom = (mean_sq + self.epsilon)?.sqrt()?;
        let normalized = compute.broadcast_div(&denom)?;
        let weight = self.weight.to_dtype(normalized.dtype())?;

        policy.cast_to_storage(&normalized.broadcast_mul(&weight)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::ops;

    fn build_input(device: &Device, dims: &[usize]) -> Result<Tensor> {
        let total: usize = dims.iter().product();
        let data = (0..total)
            .map(|i| (i as f32 * 0.25_f32) - 1.5_f32)
            .collect::<Vec<_>>();
        Tensor::from_vec(data, dims, device)
    }

    fn max_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
        a.to_dtype(DType::F32)?
            .sub(&b.to_dtype(DType::F32)?)?
            .abs()?
            .max_all()?
            .to_vec0::<f32>()
    }

    #[test]
    fn matches_candle_reference() -> Result<()> {
        let device = Device::Cpu;
        let weight = Tensor::from_slice(&[0.5f32, 1.0, 1.5, 2.0], 4, &device)?;
        let norm = RmsNorm::new(weight.clone(), 1e-5)?;
        let input = build_input(&device, &[2, 3, 4])?;

        let output = norm.forward(&input, &PrecisionPolicy::default())?;
        let reference = ops::rms_norm(&input, &weight, 1e-5)?;
        assert!(max_diff(&output, &reference)? < 1e-5);
        Ok(())
    }

    #[test]
    fn normalises_per_head_on_rank_four_input() -> Result<()> {
        let device = Device::Cpu;
        let norm = RmsNorm::new(Tensor::ones(4, DType::F32, &device)?, 1e-6)?;
        let input = build_input(&device, &[1, 3, 2, 4])?;
        let output = norm.forward(&input, &PrecisionPolicy::default())?;
        assert_eq!(output.dims(), input.dims());

        let rms = output
            .sqr()?
            .mean_keepdim(D::Minus1)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        assert!(rms.iter().all(|value| (value - 1.0).abs() < 1e-3));
        Ok(())
    }

    #[test]
    fn half_precision_output_keeps_storage_dtype() -> Result<()> {
        let device = Device::Cpu;
        let norm = RmsNorm::new(Tensor::ones(4, DType::BF16, &device)?, 1e-5)?;
        let input = build_input(&device, &[1, 2, 4])?.to_dtype(DType::BF16)?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::BF16);
        assert_eq!(norm.forward(&input, &policy)?.dtype(), DType::BF16);
        Ok(())
    }

    #[test]
    fn rejects_non_positive_epsilon() {
        let weight = Tensor::ones(4, DType::F32, &Device::Cpu).unwrap();
        assert!(RmsNorm::new(weight, 0.0).is_err());
    }
}
