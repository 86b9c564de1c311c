//! Paged key/value cache implementation.
//!
//! Every decoder layer owns an independent slice. A slice stores keys and
//! values with layout `[batch, n_kv_heads, position, head_dim]` and organises
//! storage into fixed-capacity pages so long contexts never reallocate a single
//! monolithic buffer. Pages are allocated lazily on the first write that needs
//! them; the first `put` fixes the slice geometry.

use std::cell::Cell;
use std::cmp::min;
use std::marker::PhantomData;

use candle_core::{DType, Device, Tensor};

use crate::core::errors::invalid_shape;
use crate::core::AttentionError;
use crate::kv_cache::api::{CacheProvider, CacheStats, KeyValueCache};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheConfig {
    pub layers: usize,
    pub page_size: usize,
    /// Upper bound on positions per layer. `None` grows without limit.
    pub max_positions: Option<usize>,
    /// Storage dtype. `None` keeps whatever dtype the first `put` supplies.
    pub dtype: Option<DType>,
}

impl CacheConfig {
    pub fn new(layers: usize, page_size: usize) -> Result<Self, AttentionError> {
        if page_size == 0 {
            return Err(invalid_shape("page_size must be greater than zero"));
        }
        Ok(Self {
            layers,
            page_size,
            max_positions: None,
            dtype: None,
        })
    }

    pub fn with_max_positions(mut self, max_positions: usize) -> Self {
        self.max_positions = Some(max_positions);
        self
    }

    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = Some(dtype);
        self
    }
}

#[derive(Debug, Clone)]
struct SliceGeometry {
    batch: usize,
    heads: usize,
    head_dim: usize,
    dtype: DType,
    device: Device,
}

impl SliceGeometry {
    fn matches(&self, batch: usize, heads: usize, head_dim: usize, device: &Device) -> bool {
        self.batch == batch
            && self.heads == heads
            && self.head_dim == head_dim
            && self.device.same_device(device)
    }
}

#[derive(Debug)]
struct CachePage {
    keys: Tensor,
    values: Tensor,
    len: usize,
    capacity: usize,
}

impl CachePage {
    fn new(geometry: &SliceGeometry, capacity: usize) -> Result<Self, AttentionError> {
        let shape = (geometry.batch, geometry.heads, capacity, geometry.head_dim);
        let keys = Tensor::zeros(shape, geometry.dtype, &geometry.device)?;
        let values = Tensor::zeros(shape, geometry.dtype, &geometry.device)?;
        Ok(Self {
            keys,
            values,
            len: 0,
            capacity,
        })
    }

    fn remaining(&self) -> usize {
        self.capacity - self.len
    }

    fn store_chunk(&mut self, keys: &Tensor, values: &Tensor) -> Result<(), AttentionError> {
        let (batch, heads, chunk, head_dim) = keys.dims4()?;
        let ranges = [
            0..batch,
            0..heads,
            self.len..self.len + chunk,
            0..head_dim,
        ];
        self.keys = self.keys.slice_assign(&ranges, keys)?;
        self.values = self.values.slice_assign(&ranges, values)?;
        self.len += chunk;
        Ok(())
    }

    fn filled(&self) -> Result<(Tensor, Tensor), AttentionError> {
        Ok((
            self.keys.narrow(2, 0, self.len)?,
            self.values.narrow(2, 0, self.len)?,
        ))
    }
}

/// Cache slice for one decoder layer.
#[derive(Debug)]
pub struct PagedLayerCache {
    layer: usize,
    config: CacheConfig,
    geometry: Option<SliceGeometry>,
    pages: Vec<CachePage>,
    len: usize,
}

impl PagedLayerCache {
    fn new(layer: usize, config: CacheConfig) -> Self {
        Self {
            layer,
            config,
            geometry: None,
            pages: Vec::new(),
            len: 0,
        }
    }

    pub fn pages_allocated(&self) -> usize {
        self.pages.len()
    }

    fn check_geometry(&self, keys: &Tensor, values: &Tensor) -> Result<SliceGeometry, AttentionError> {
        let (batch, heads, _, head_dim) = keys.dims4().map_err(|_| {
            invalid_shape(format!(
                "cached keys must be [batch, kv_heads, seq, head_dim], got {:?}",
                keys.dims()
            ))
        })?;
        if values.dims() != keys.dims() {
            return Err(invalid_shape(format!(
                "values shape {:?} must match keys shape {:?}",
                values.dims(),
                keys.dims()
            )));
        }

        match &self.geometry {
            Some(geometry) if geometry.matches(batch, heads, head_dim, keys.device()) => {
                Ok(geometry.clone())
            }
            Some(geometry) => Err(invalid_shape(format!(
                "layer {} caches [{}, {}, seq, {}], got {:?}",
                self.layer,
                geometry.batch,
                geometry.heads,
                geometry.head_dim,
                keys.dims()
            ))),
            None => Ok(SliceGeometry {
                batch,
                heads,
                head_dim,
                dtype: self.config.dtype.unwrap_or(keys.dtype()),
                device: keys.device().clone(),
            }),
        }
    }

    fn accumulated(&self, geometry: &SliceGeometry) -> Result<(Tensor, Tensor), AttentionError> {
        if self.pages.is_empty() {
            let empty = Tensor::zeros(
                (geometry.batch, geometry.heads, 0, geometry.head_dim),
                geometry.dtype,
                &geometry.device,
            )?;
            return Ok((empty.clone(), empty));
        }
        let mut keys = Vec::with_capacity(self.pages.len());
        let mut values = Vec::with_capacity(self.pages.len());
        for page in &self.pages {
            let (k, v) = page.filled()?;
            keys.push(k);
            values.push(v);
        }
        Ok((Tensor::cat(&keys, 2)?, Tensor::cat(&values, 2)?))
    }
}

impl KeyValueCache for PagedLayerCache {
    fn put(&mut self, keys: &Tensor, values: &Tensor) -> Result<(Tensor, Tensor), AttentionError> {
        let geometry = self.check_geometry(keys, values)?;
        let incoming = keys.dim(2)?;
        let requested = self.len + incoming;
        if let Some(capacity) = self.config.max_positions {
            if requested > capacity {
                return Err(AttentionError::CapacityExceeded {
                    layer: self.layer,
                    requested,
                    capacity,
                });
            }
        }

        let stored_keys = keys.to_dtype(geometry.dtype)?;
        let stored_values = values.to_dtype(geometry.dtype)?;
        let mut offset = 0;
        while offset < incoming {
            let needs_page = self.pages.last().map_or(true, |page| page.remaining() == 0);
            if needs_page {
                self.pages
                    .push(CachePage::new(&geometry, self.config.page_size)?);
                log::debug!(
                    "kv-cache layer {}: allocated page {} ({} positions)",
                    self.layer,
                    self.pages.len(),
                    self.config.page_size
                );
            }
            let Some(page) = self.pages.last_mut() else {
                break;
            };
            let write = min(page.remaining(), incoming - offset);
            page.store_chunk(
                &stored_keys.narrow(2, offset, write)?,
                &stored_values.narrow(2, offset, write)?,
            )?;
            offset += write;
        }
        self.len = requested;
        // Geometry is only pinned once a write has landed.
        if self.geometry.is_none() {
            self.geometry = Some(geometry.clone());
        }

        let (all_keys, all_values) = self.accumulated(&geometry)?;
        Ok((all_keys.to_dtype(keys.dtype())?, all_values.to_dtype(values.dtype())?))
    }

    fn len(&self) -> usize {
        self.len
    }

    fn reset(&mut self) {
        self.pages.clear();
        self.geometry = None;
        self.len = 0;
    }
}

/// Paged cache holding one [`PagedLayerCache`] per decoder layer.
///
/// The cache is `Send` but not `Sync`: a sequence has exactly one writer.
#[derive(Debug)]
pub struct PagedKeyValueCache {
    config: CacheConfig,
    layers: Vec<PagedLayerCache>,
    _not_sync: PhantomData<Cell<()>>,
}

impl PagedKeyValueCache {
    pub fn new(config: CacheConfig) -> Self {
        log::info!(
            "kv-cache init: layers={} page_size={} max_positions={:?} dtype={:?}",
            config.layers,
            config.page_size,
            config.max_positions,
            config.dtype
        );
        let layers = (0..config.layers)
            .map(|layer| PagedLayerCache::new(layer, config))
            .collect();
        Self {
            config,
            layers,
            _not_sync: PhantomData,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn stats(&self) -> CacheStats {
        self.layers.iter().fold(CacheStats::default(), |acc, layer| CacheStats {
            tokens: acc.tokens + layer.len,
            pages_allocated: acc.pages_allocated + layer.pages.len(),
        })
    }
}

impl CacheProvider for PagedKeyValueCache {
    fn sub(&mut self, layer: usize) -> Result<&mut dyn KeyValueCache, AttentionError> {
        let layers = self.layers.len();
        match self.layers.get_mut(layer) {
            Some(slice) => Ok(slice as &mut dyn KeyValueCache),
            None => Err(AttentionError::LayerOutOfRange { layer, layers }),
        }
    }

    fn num_layers(&self) -> usize {
        self.layers.len()
    }

    fn reset(&mut self) {
        log::debug!(
            "kv-cache reset: layers={} {:?}",
            self.layers.len(),
            self.stats()
        );
        self.layers.iter_mut().for_each(|layer| layer.reset());
    }
}
