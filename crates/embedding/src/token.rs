//! Token embedding table.

use candle_core::{bail, DType, Result, Tensor};
use candle_nn::{Init, VarBuilder};
use layers::checks;

/// Configuration for a token embedding table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenEmbeddingConfig {
    /// Number of distinct tokens.
    pub vocab_size: usize,
    /// Width of each embedding vector.
    pub hidden_dim: usize,
}

/// Lookup table mapping token ids to hidden vectors.
#[derive(Debug, Clone)]
pub struct TokenEmbedding {
    config: TokenEmbeddingConfig,
    weight: Tensor,
}

impl TokenEmbedding {
    pub fn new(config: TokenEmbeddingConfig, weight: Tensor) -> Result<Self> {
        if config.vocab_size == 0 {
            bail!("token embedding requires vocab_size > 0");
        }
        if config.hidden_dim == 0 {
            bail!("token embedding requires hidden_dim > 0");
        }
        checks::expect_shape(
            "token_embd.weight",
            &weight,
            &[config.vocab_size, config.hidden_dim],
        )?;
        Ok(Self { config, weight })
    }

    /// Loads `weight` from `vb`; fresh variables are sampled from `N(0, 1)`.
    pub fn load(config: TokenEmbeddingConfig, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(
            (config.vocab_size, config.hidden_dim),
            "weight",
            Init::Randn {
                mean: 0.0,
                stdev: 1.0,
            },
        )?;
        Self::new(config, weight)
    }

    pub fn config(&self) -> &TokenEmbeddingConfig {
        &self.config
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// Looks up embeddings for `token_ids` shaped `(batch, seq)`.
    ///
    /// Returns `(batch, seq, hidden)` in the weight dtype. An empty sequence
    /// yields an empty tensor rather than an error.
    pub fn forward(&self, token_ids: &Tensor) -> Result<Tensor> {
        let (batch, seq) = self.validate_token_ids(token_ids)?;
        if batch * seq == 0 {
            return Tensor::zeros(
                (batch, seq, self.config.hidden_dim),
                self.weight.dtype(),
                self.weight.device(),
            );
        }

        let flat = token_ids.to_dtype(DType::I64)?.flatten_all()?;
        self.ensure_id_range(&flat)?;
        let flat = flat.to_device(self.weight.device())?;
        self.weight
            .index_select(&flat, 0)?
            .reshape((batch, seq, self.config.hidden_dim))
    }

    fn validate_token_ids(&self, token_ids: &Tensor) -> Result<(usize, usize)> {
        if !token_ids.dtype().is_int() {
            bail!(
                "token_ids expected integer dtype but received {:?}",
                token_ids.dtype()
            );
        }
        match token_ids.dims() {
            [batch, seq] => Ok((*batch, *seq)),
            dims => bail!("token_ids must be shaped [batch, seq], got {dims:?}"),
        }
    }

    fn ensure_id_range(&self, flat_ids: &Tensor) -> Result<()> {
        let min_id = flat_ids.min(0)?.to_scalar::<i64>()?;
        if min_id < 0 {
            bail!("encountered negative token id {min_id}");
        }
        let max_id = flat_ids.max(0)?.to_scalar::<i64>()?;
        if max_id >= self.config.vocab_size as i64 {
            bail!(
                "token id {} exceeds vocab size {}",
                max_id,
                self.config.vocab_size
            );
        }
        Ok(())
    }
}
