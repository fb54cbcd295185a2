use candle_core::{DType, Tensor};

use crate::error::{AttentionError, Result};
use crate::kv_cache::{BlockPool, BlockTables, PagedKvCache};

/// Reserve blocks for each sequence from a fresh pool of
/// `context_lengths.len() * max_blocks` blocks.
///
/// Sequence `i` receives `ceil(len_i / block_size)` consecutive ids; the rest
/// of its row stays unreserved.
pub fn mock_alloc_block_tables(
    context_lengths: &[usize],
    max_blocks: usize,
    block_size: usize,
) -> Result<BlockTables> {
    let mut pool = BlockPool::new(context_lengths.len() * max_blocks);
    let mut tables = BlockTables::new(max_blocks);
    for &len in context_lengths {
        let blocks = pool
            .allocate_tokens(len, block_size)
            .map_err(|e| AttentionError::invalid(e.to_string()))?;
        tables.push_row(blocks)?;
    }
    Ok(tables)
}

/// Place packed K/V into `cache` element by element on the host, without
/// going through the scatter path.
///
/// Produces the cache state a correct prefill write must reproduce.
pub fn mock_fill_cache(
    cache: &mut PagedKvCache,
    k: &Tensor,
    v: &Tensor,
    context_lengths: &[usize],
    block_tables: &BlockTables,
) -> Result<()> {
    let (heads, dim) = (cache.num_kv_heads(), cache.head_dim());
    let (layout, block_size) = (cache.layout(), cache.block_size());
    let dtype = cache.dtype();
    let shape = cache.k_cache().dims().to_vec();

    let host = |t: &Tensor| -> Result<Vec<f32>> {
        Ok(t.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?)
    };
    let mut k_pool = host(cache.k_cache())?;
    let mut v_pool = host(cache.v_cache())?;
    let (k_src, v_src) = (host(k)?, host(v)?);

    let mut token = 0;
    for (seq, &len) in context_lengths.iter().enumerate() {
        for pos in 0..len {
            let (block, slot) = block_tables.slot(seq, pos, block_size).ok_or_else(|| {
                AttentionError::invalid(format!("position {pos} of sequence {seq} has no block"))
            })?;
            for h in 0..heads {
                for d in 0..dim {
                    let dst = layout.element_offset(block, slot, h, d, block_size, heads, dim);
                    let src = (token * heads + h) * dim + d;
                    k_pool[dst] = k_src[src];
                    v_pool[dst] = v_src[src];
                }
            }
            token += 1;
        }
    }

    let device = cache.device().clone();
    let k_cache = Tensor::from_vec(k_pool, shape.as_slice(), &device)?.to_dtype(dtype)?;
    let v_cache = Tensor::from_vec(v_pool, shape.as_slice(), &device)?.to_dtype(dtype)?;
    *cache = PagedKvCache::from_tensors(k_cache, v_cache, layout)?;
    Ok(())
}
