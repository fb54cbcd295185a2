//! One synthetic prefill: build a packed batch, reserve blocks, run
//! attention with cache writes and check the result against the f64
//! reference.

use std::time::{Duration, Instant};

use anyhow::Context;
use candle_core::{DType, Device};
use prefill_core::testing::{
    allclose, max_abs_diff, mock_alloc_block_tables, random_context_lengths, random_packed_batch,
    reference_context_attention, BatchShape,
};
use prefill_core::{CacheConfig, PagedKvCache, UnpaddedAttention};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::info;

use crate::config::RunSettings;

/// `(atol, rtol)` used to accept an output of the given dtype.
pub fn tolerance(dtype: DType) -> (f32, f32) {
    match dtype {
        // 8 mantissa bits
        DType::BF16 => (1e-2, 1e-2),
        _ => (1e-3, 1e-4),
    }
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub backend: &'static str,
    pub context_lengths: Vec<usize>,
    pub output_dims: Vec<usize>,
    pub tokens_written: usize,
    pub blocks_written: usize,
    pub occupied_blocks: usize,
    pub max_abs_diff: f32,
    pub within_tolerance: bool,
    pub elapsed: Duration,
}

pub fn execute(settings: &RunSettings) -> anyhow::Result<RunReport> {
    let device = Device::Cpu;
    let mut rng = StdRng::seed_from_u64(settings.seed);
    let context_lengths = random_context_lengths(
        &mut rng,
        settings.batch_size,
        settings.max_seq_len(),
        settings.same_context,
    );
    let shape = BatchShape {
        num_heads: settings.num_heads,
        num_kv_heads: settings.num_kv_heads(),
        head_dim: settings.head_dim,
        dtype: settings.dtype,
    };
    let batch = random_packed_batch(&mut rng, &context_lengths, shape, &device)
        .context("failed to generate packed batch")?;
    info!(
        num_seqs = context_lengths.len(),
        total_tokens = batch.total_tokens(),
        dtype = ?settings.dtype,
        "generated batch"
    );

    let tables = mock_alloc_block_tables(
        &context_lengths,
        settings.max_blocks_per_seq,
        settings.block_size,
    )
    .context("failed to reserve cache blocks")?;
    let cache_config = CacheConfig::for_batch(
        settings.batch_size,
        settings.max_blocks_per_seq,
        settings.block_size,
        settings.num_kv_heads(),
        settings.head_dim,
        settings.dtype,
        device.clone(),
    )
    .with_layout(settings.layout);
    info!(
        num_blocks = cache_config.num_blocks,
        layout = ?settings.layout,
        size_mb = cache_config.size_in_bytes() / (1024 * 1024),
        "allocating kv cache"
    );
    let mut cache = PagedKvCache::new(&cache_config).context("failed to allocate kv cache")?;

    let attention = UnpaddedAttention::new(&settings.attention)?;
    let start = Instant::now();
    let out = attention.forward(
        &batch.q,
        &batch.k,
        &batch.v,
        &mut cache,
        &context_lengths,
        &tables,
        settings.block_size,
    )?;
    let elapsed = start.elapsed();

    let expected = reference_context_attention(&batch.q, &batch.k, &batch.v, &context_lengths)
        .context("reference attention failed")?;
    let (atol, rtol) = tolerance(settings.dtype);
    let report = RunReport {
        backend: attention.backend_name(),
        output_dims: out.output.dims().to_vec(),
        tokens_written: out.summary.tokens_written,
        blocks_written: out.summary.blocks_written,
        occupied_blocks: cache.occupied_blocks()?,
        max_abs_diff: max_abs_diff(&out.output, &expected)?,
        within_tolerance: allclose(&out.output, &expected, atol, rtol)?,
        context_lengths,
        elapsed,
    };
    info!(
        backend = report.backend,
        elapsed_ms = report.elapsed.as_secs_f64() * 1e3,
        max_abs_diff = report.max_abs_diff,
        "prefill complete"
    );
    Ok(report)
}
