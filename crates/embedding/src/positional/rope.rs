//! Rotary positional embeddings.
//!
//! Tensors are shaped `[batch, n_heads, seq_len, head_dim]`. Only the leading
//! `rotate_dim` features of each head are rotated, as adjacent `(even, odd)`
//! pairs; the tail is copied through untouched. Pair `i` at position `p` is
//! rotated by
//!
//! ```text
//! angle(p, i) = p * freq_scale * theta^(-2i / rotate_dim) / factor[i]
//! ```
//!
//! where `factor` is the optional per-frequency scaling vector shipped with
//! long-context checkpoints (`rope_freqs`). Positions are explicit ids, not a
//! contiguous range, so batched prompts and decode steps share one code path.

use candle_core::{bail, DType, Device, Result, Tensor};
use candle_nn::VarBuilder;

/// Geometry and frequency parameters for rotary embeddings.
#[derive(Debug, Clone, PartialEq)]
pub struct RopeConfig {
    /// Per-head dimensionality of the tensors being rotated.
    pub head_dim: usize,
    /// How many leading dimensions to rotate; `None` rotates the full head.
    pub rotate_dim: Option<usize>,
    /// Base angle θ controlling the frequency spectrum.
    pub rope_theta: f32,
    /// Linear position scaling; `1.0` leaves positions unchanged.
    pub freq_scale: f32,
}

impl Default for RopeConfig {
    fn default() -> Self {
        Self {
            head_dim: 0,
            rotate_dim: None,
            rope_theta: 10_000.0,
            freq_scale: 1.0,
        }
    }
}

impl RopeConfig {
    pub fn rotate_dim(&self) -> usize {
        self.rotate_dim.unwrap_or(self.head_dim)
    }

    pub fn validate(&self) -> Result<()> {
        if self.head_dim == 0 {
            bail!("head_dim must be non-zero");
        }
        let rotate_dim = self.rotate_dim();
        if rotate_dim == 0 || rotate_dim > self.head_dim {
            bail!("invalid rotate_dim {} for head_dim {}", rotate_dim, self.head_dim);
        }
        if rotate_dim % 2 != 0 {
            bail!("rotate_dim must be even to pair dimensions, got {rotate_dim}");
        }
        if !(self.rope_theta > 0.0) {
            bail!("rope_theta must be positive, got {}", self.rope_theta);
        }
        if !(self.freq_scale > 0.0) {
            bail!("freq_scale must be positive, got {}", self.freq_scale);
        }
        Ok(())
    }
}

/// Rotary embedding with precomputed inverse frequencies.
#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    config: RopeConfig,
    has_factors: bool,
    /// `(1, rotate_dim / 2)` f32 row of per-pair angular rates.
    inv_freqs: Tensor,
}

impl RotaryEmbedding {
    /// Builds the embedding; `factors`, when present, must hold `rotate_dim / 2`
    /// positive entries.
    pub fn new(config: RopeConfig, factors: Option<&Tensor>, device: &Device) -> Result<Self> {
        config.validate()?;
        let rotate_dim = config.rotate_dim();
        let half_dim = rotate_dim / 2;

        let factors = match factors {
            Some(tensor) => {
                let values = tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
                if values.len() != half_dim {
                    bail!(
                        "rope factors must have {half_dim} entries, got {}",
                        values.len()
                    );
                }
                if values.iter().any(|factor| !(*factor > 0.0)) {
                    bail!("rope factors must be positive");
                }
                Some(values)
            }
            None => None,
        };

        let base = config.rope_theta as f64;
        let scale = config.freq_scale as f64;
        let inv_freqs = (0..half_dim)
            .map(|idx| {
                let exponent = (2 * idx) as f64 / rotate_dim as f64;
                let factor = factors.as_ref().map_or(1.0, |f| f[idx] as f64);
                (scale * base.powf(-exponent) / factor) as f32
            })
            .collect::<Vec<_>>();

        Ok(Self {
            config,
            has_factors: factors.is_some(),
            inv_freqs: Tensor::from_vec(inv_freqs, (1, half_dim), device)?,
        })
    }

    /// Builds the embedding, picking up `rope_freqs.weight` from `vb` when the
    /// checkpoint ships one.
    pub fn load(config: RopeConfig, vb: &VarBuilder) -> Result<Self> {
        let half_dim = config.rotate_dim() / 2;
        let factors = if vb.contains_tensor("rope_freqs.weight") {
            Some(
                vb.pp("rope_freqs")
                    .get_with_hints(half_dim, "weight", candle_nn::init::ONE)?,
            )
        } else {
            None
        };
        Self::new(config, factors.as_ref(), vb.device())
    }

    pub fn config(&self) -> &RopeConfig {
        &self.config
    }

    pub fn has_factors(&self) -> bool {
        self.has_factors
    }

    /// Stable description of the frequency setup, logged at model construction.
    pub fn fingerprint(&self) -> String {
        format!(
            "theta={:.1};scale={:.4};rot={}/{};factors={}",
            self.config.rope_theta,
            self.config.freq_scale,
            self.config.rotate_dim(),
            self.config.head_dim,
            if self.has_factors { "yes" } else { "no" }
        )
    }

    /// Returns `(sin, cos)` tables shaped `[seq_len, rotate_dim / 2]` for the
    /// given 1-D position ids.
    pub fn sin_cos(&self, positions: &Tensor) -> Result<(Tensor, Tensor)> {
        if positions.rank() != 1 {
            bail!("positions tensor must be 1-D, got {:?}", positions.dims());
        }
        let seq_len = positions.dims1()?;
        let angles = positions
            .to_device(self.inv_freqs.device())?
            .to_dtype(DType::F32)?
            .reshape((seq_len, 1))?
            .matmul(&self.inv_freqs)?;
        Ok((angles.sin()?, angles.cos()?))
    }

    /// Rotates `x` shaped `[batch, heads, seq_len, head_dim]` by `positions`.
    pub fn apply(&self, x: &Tensor, positions: &Tensor) -> Result<Tensor> {
        let (batch, heads, seq_len, head_dim) = x.dims4()?;
        if head_dim != self.config.head_dim {
            bail!(
                "rope expected head_dim {}, got {}",
                self.config.head_dim,
                head_dim
            );
        }
        let pos_len = positions.dims1()?;
        if pos_len != seq_len {
            bail!("positions length {pos_len} does not match sequence length {seq_len}");
        }
        if seq_len == 0 {
            return Ok(x.clone());
        }

        let rotate_dim = self.config.rotate_dim();
        let half_dim = rotate_dim / 2;
        let (sin, cos) = self.sin_cos(positions)?;
        let sin_b = sin
            .reshape((1, 1, seq_len, half_dim))?
            .broadcast_as((batch, heads, seq_len, half_dim))?;
        let cos_b = cos
            .reshape((1, 1, seq_len, half_dim))?
            .broadcast_as((batch, heads, seq_len, half_dim))?;

        let dtype = x.dtype();
        let main = x.narrow(3, 0, rotate_dim)?.to_dtype(DType::F32)?;
        let pairs = main.reshape((batch, heads, seq_len, half_dim, 2))?;
        let even = pairs.narrow(4, 0, 1)?.squeeze(4)?;
        let odd = pairs.narrow(4, 1, 1)?.squeeze(4)?;

        let rotated_even = (even.mul(&cos_b)? - odd.mul(&sin_b)?)?;
        let rotated_odd = (odd.mul(&cos_b)? + even.mul(&sin_b)?)?;
        let rotated = Tensor::stack(&[&rotated_even, &rotated_odd], 4)?
            .reshape((batch, heads, seq_len, rotate_dim))?
            .to_dtype(dtype)?;

        let tail_dim = head_dim - rotate_dim;
        if tail_dim == 0 {
            Ok(rotated)
        } else {
            let tail = x.narrow(3, rotate_dim, tail_dim)?;
            Tensor::cat(&[&rotated, &tail], 3)
        }
    }

    /// Applies the identical rotation to queries and keys so their dot product
    /// depends only on relative position. Head counts may differ (grouped-query
    /// attention) as long as the head geometry matches.
    pub fn apply_to_qk(&self, q: &Tensor, k: &Tensor, positions: &Tensor) -> Result<(Tensor, Tensor)> {
        if !q.device().same_device(k.device()) {
            bail!("query and key must live on the same device");
        }
        Ok((self.apply(q, positions)?, self.apply(k, positions)?))
    }
}
