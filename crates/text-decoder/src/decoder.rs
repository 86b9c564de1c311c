//! Ordered stack of decoder layers.

use attention::CacheProvider;
use candle_core::Tensor;

use crate::context::ForwardContext;
use crate::error::Result;
use crate::layer::{DecoderLayer, LayerKind};

#[derive(Debug, Clone)]
pub struct TextDecoder {
    layers: Vec<DecoderLayer>,
}

impl TextDecoder {
    pub fn new(layers: Vec<DecoderLayer>) -> Self {
        Self { layers }
    }

    pub fn layers(&self) -> &[DecoderLayer] {
        &self.layers
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn layer_kinds(&self) -> Vec<LayerKind> {
        self.layers.iter().map(DecoderLayer::kind).collect()
    }

    /// Runs every layer in index order.
    ///
    /// A cross-attention layer reached without `cross_state` is skipped: the
    /// hidden state passes through and its cache slice is not requested. Every
    /// executed layer receives `cache.sub(index)`. `cross_mask` is accepted but
    /// not applied; cross-attention runs unmasked.
    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &self,
        ctx: &ForwardContext,
        hidden: &Tensor,
        positions: &Tensor,
        mask: Option<&Tensor>,
        cross_state: Option<&Tensor>,
        _cross_mask: Option<&Tensor>,
        cache: &mut dyn CacheProvider,
    ) -> Result<Tensor> {
        let mut hidden = hidden.clone();
        for (index, layer) in self.layers.iter().enumerate() {
            if layer.is_cross_attention() && cross_state.is_none() {
                log::trace!("layer {index}: no cross-modal state, skipping cross-attention");
                continue;
            }
            let slice = cache.sub(index)?;
            hidden = layer.forward(ctx, &hidden, positions, mask, cross_state, slice)?;
        }
        Ok(hidden)
    }
}
