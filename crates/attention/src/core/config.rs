//! Run-time knobs shared by all attention implementations.

/// Configuration driving attention behaviour.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Config {
    /// Multiplier applied to the raw scores. `None` uses `1 / sqrt(head_dim)`.
    pub softmax_scale: Option<f64>,
    /// Promote scores and probabilities to `f32` when inputs are reduced
    /// precision.
    pub upcast: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            softmax_scale: None,
            upcast: true,
        }
    }
}

impl Config {
    pub fn scale_for(&self, head_dim: usize) -> f64 {
        self.softmax_scale
            .unwrap_or_else(|| 1.0 / (head_dim as f64).sqrt())
    }
}
