use candle_core::{DType, Device, Tensor};

use crate::error::{AttentionError, Result};

use super::block_pool::BlockId;
use super::config::{CacheConfig, KVCacheLayout};

/// Caller-owned K and V block pools for one attention layer.
///
/// Both pools share shape, dtype, device and layout. Elements are addressed
/// as `(block, slot, head, dim)` and resolved to flat offsets through the
/// layout, so writes go through `scatter_set` on a flat view of the storage
/// and never through raw pointers.
pub struct PagedKvCache {
    k_cache: Tensor,
    v_cache: Tensor,
    num_blocks: usize,
    block_size: usize,
    num_kv_heads: usize,
    head_dim: usize,
    layout: KVCacheLayout,
}

impl PagedKvCache {
    /// Allocate zero-filled pools.
    pub fn new(config: &CacheConfig) -> Result<Self> {
        check_addressable(config.num_elements())?;
        let shape = config.layout.cache_shape(
            config.num_blocks,
            config.block_size,
            config.num_kv_heads,
            config.head_dim,
        );
        let k_cache = Tensor::zeros(shape, config.dtype, &config.device)?;
        let v_cache = Tensor::zeros(shape, config.dtype, &config.device)?;
        Ok(Self {
            k_cache,
            v_cache,
            num_blocks: config.num_blocks,
            block_size: config.block_size,
            num_kv_heads: config.num_kv_heads,
            head_dim: config.head_dim,
            layout: config.layout,
        })
    }

    /// Adopt pools allocated elsewhere.
    ///
    /// The tensors must be rank 4 in `layout`'s axis order, identical in shape
    /// and dtype, and contiguous (writes land in their storage).
    pub fn from_tensors(k_cache: Tensor, v_cache: Tensor, layout: KVCacheLayout) -> Result<Self> {
        if k_cache.dims() != v_cache.dims() {
            return Err(AttentionError::shape(format!(
                "k_cache shape {:?} differs from v_cache shape {:?}",
                k_cache.dims(),
                v_cache.dims()
            )));
        }
        if k_cache.dtype() != v_cache.dtype() {
            return Err(AttentionError::invalid(format!(
                "k_cache dtype {:?} differs from v_cache dtype {:?}",
                k_cache.dtype(),
                v_cache.dtype()
            )));
        }
        if !k_cache.is_contiguous() || !v_cache.is_contiguous() {
            return Err(AttentionError::invalid("cache tensors must be contiguous"));
        }
        let (d0, d1, d2, d3) = k_cache.dims4().map_err(|_| {
            AttentionError::shape(format!("cache must be rank 4, got {:?}", k_cache.dims()))
        })?;
        let (num_blocks, block_size, num_kv_heads, head_dim) = match layout {
            KVCacheLayout::HDN => (d0, d3, d1, d2),
            KVCacheLayout::NHD => (d0, d1, d2, d3),
            KVCacheLayout::HND => (d0, d2, d1, d3),
        };
        check_addressable(k_cache.elem_count())?;
        Ok(Self {
            k_cache,
            v_cache,
            num_blocks,
            block_size,
            num_kv_heads,
            head_dim,
            layout,
        })
    }

    pub fn k_cache(&self) -> &Tensor {
        &self.k_cache
    }

    pub fn v_cache(&self) -> &Tensor {
        &self.v_cache
    }

    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn num_kv_heads(&self) -> usize {
        self.num_kv_heads
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    pub fn layout(&self) -> KVCacheLayout {
        self.layout
    }

    pub fn dtype(&self) -> DType {
        self.k_cache.dtype()
    }

    pub fn device(&self) -> &Device {
        self.k_cache.device()
    }

    #[inline]
    pub(crate) fn element_offset(
        &self,
        block: BlockId,
        slot: usize,
        head: usize,
        dim: usize,
    ) -> usize {
        self.layout.element_offset(
            block,
            slot,
            head,
            dim,
            self.block_size,
            self.num_kv_heads,
            self.head_dim,
        )
    }

    /// Append the flat offsets of one token's `[num_kv_heads, head_dim]`
    /// vector, in row-major source order.
    pub(crate) fn push_token_offsets(&self, block: BlockId, slot: usize, out: &mut Vec<u32>) {
        for h in 0..self.num_kv_heads {
            for d in 0..self.head_dim {
                out.push(self.element_offset(block, slot, h, d) as u32);
            }
        }
    }

    /// Scatter `[n, num_kv_heads, head_dim]` sources into the pools.
    ///
    /// `offsets` holds one flat destination per source element in row-major
    /// order. Destinations must be distinct; values are copied bit for bit.
    pub(crate) fn scatter(
        &mut self,
        k_src: &Tensor,
        v_src: &Tensor,
        offsets: Vec<u32>,
    ) -> Result<()> {
        let n = offsets.len();
        let device = self.k_cache.device().clone();
        let indices = Tensor::from_vec(offsets, (n,), &device)?;

        // Contiguous pools: the flat reshape is a view on the same storage
        let total = self.k_cache.elem_count();
        let k_flat = self.k_cache.reshape((total,))?;
        let v_flat = self.v_cache.reshape((total,))?;

        let k_src = k_src.contiguous()?.reshape((n,))?;
        let v_src = v_src.contiguous()?.reshape((n,))?;
        k_flat.scatter_set(&indices, &k_src, 0)?;
        v_flat.scatter_set(&indices, &v_src, 0)?;
        Ok(())
    }

    /// Gather the first `num_tokens` tokens stored under `block_ids`.
    ///
    /// Returns `(k, v)` each shaped `[num_tokens, num_kv_heads, head_dim]`
    /// in the pool dtype, independent of layout.
    pub fn read(&self, block_ids: &[BlockId], num_tokens: usize) -> Result<(Tensor, Tensor)> {
        let capacity = block_ids.len() * self.block_size;
        if num_tokens > capacity {
            return Err(AttentionError::invalid(format!(
                "cannot read {num_tokens} tokens from {} blocks of {}",
                block_ids.len(),
                self.block_size
            )));
        }
        if let Some(&block_id) = block_ids.iter().find(|&&id| id >= self.num_blocks) {
            return Err(AttentionError::invalid(format!(
                "block {block_id} is outside the pool of {} blocks",
                self.num_blocks
            )));
        }

        let mut offsets = Vec::with_capacity(num_tokens * self.num_kv_heads * self.head_dim);
        for pos in 0..num_tokens {
            let block = block_ids[pos / self.block_size];
            self.push_token_offsets(block, pos % self.block_size, &mut offsets);
        }
        let n = offsets.len();
        let indices = Tensor::from_vec(offsets, (n,), self.k_cache.device())?;

        let total = self.k_cache.elem_count();
        let shape = (num_tokens, self.num_kv_heads, self.head_dim);
        let k = self
            .k_cache
            .reshape((total,))?
            .index_select(&indices, 0)?
            .reshape(shape)?;
        let v = self
            .v_cache
            .reshape((total,))?
            .index_select(&indices, 0)?
            .reshape(shape)?;
        Ok((k, v))
    }

    /// Number of blocks holding at least one non-zero K or V element.
    ///
    /// Meaningful on a zero-initialised pool: counts blocks that have been
    /// written since allocation or the last [`Self::reset`].
    pub fn occupied_blocks(&self) -> Result<usize> {
        if self.num_blocks == 0 {
            return Ok(0);
        }
        let per_block = |t: &Tensor| -> Result<Vec<f32>> {
            Ok(t.to_dtype(DType::F32)?
                .reshape((self.num_blocks, ()))?
                .abs()?
                .sum(1)?
                .to_vec1::<f32>()?)
        };
        let k_mass = per_block(&self.k_cache)?;
        let v_mass = per_block(&self.v_cache)?;
        Ok(k_mass
            .iter()
            .zip(v_mass.iter())
            .filter(|(k, v)| **k != 0.0 || **v != 0.0)
            .count())
    }

    /// Zero both pools in place of the old storage.
    pub fn reset(&mut self) -> Result<()> {
        self.k_cache = self.k_cache.zeros_like()?;
        self.v_cache = self.v_cache.zeros_like()?;
        Ok(())
    }
}

fn check_addressable(num_elements: usize) -> Result<()> {
    if num_elements > u32::MAX as usize {
        return Err(AttentionError::invalid(format!(
            "cache pool of {num_elements} elements exceeds u32 addressing"
        )));
    }
    Ok(())
}
