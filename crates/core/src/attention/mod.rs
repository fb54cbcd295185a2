//! Unpadded causal context attention with paged KV cache writes.
//!
//! This module provides:
//! - The dispatch layer (span table, GQA mapping, entry validation)
//! - Pluggable causal attention backends (naive tensor algebra, tiled host kernel)
//! - [`UnpaddedAttention`], which drives cache write + attention for one call
//!
//! # Example
//!
//! ```ignore
//! use prefill_core::attention::context_attention_unpadded;
//!
//! let out = context_attention_unpadded(
//!     &q, &k, &v,
//!     &mut cache,
//!     &context_lengths,
//!     &block_tables,
//!     block_size,
//! )?;
//! ```

mod backend;
mod dispatch;
pub mod naive;
mod ops;
pub mod tiled;

pub use backend::{select_backend, ContextAttentionBackend};
pub use dispatch::{GqaLayout, PrefillPlan, SeqSpan, SpanTable};
pub use naive::NaiveAttentionBackend;
pub use ops::{causal_mask, repeat_kv};
pub use tiled::TiledAttentionBackend;

use candle_core::Tensor;
use tracing::{debug, warn};

use crate::config::AttentionConfig;
use crate::error::{AttentionError, Result};
use crate::kv_cache::{BlockTables, CacheWriter, PagedKvCache, WriteSummary};

/// Result of one prefill call.
#[derive(Debug)]
pub struct PrefillOutput {
    /// `[total_tokens, num_heads, head_dim]`, same shape and dtype as Q.
    pub output: Tensor,
    pub summary: WriteSummary,
}

/// Drives the cache writer and a causal attention backend over a packed batch.
pub struct UnpaddedAttention {
    backend: Box<dyn ContextAttentionBackend>,
}

impl UnpaddedAttention {
    pub fn new(config: &AttentionConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            backend: select_backend(config),
        })
    }

    pub fn with_backend(backend: Box<dyn ContextAttentionBackend>) -> Self {
        Self { backend }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Write K/V into the cache and compute causal attention per sequence.
    ///
    /// # Arguments
    /// * `q` - Packed queries `[total_tokens, num_heads, head_dim]`
    /// * `k`, `v` - Packed keys/values `[total_tokens, num_kv_heads, head_dim]`
    /// * `cache` - Caller-owned pools; only the blocks named by the used
    ///   prefix of each table row are written
    /// * `context_lengths` - Tokens per sequence, in packing order
    /// * `block_tables` - One reserved row per sequence
    /// * `block_size` - Token slots per block; must equal the cache's
    ///
    /// All preconditions are checked before the first write.
    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        cache: &mut PagedKvCache,
        context_lengths: &[usize],
        block_tables: &BlockTables,
        block_size: usize,
    ) -> Result<PrefillOutput> {
        let _span =
            tracing::debug_span!("context_attention", backend = self.backend.name()).entered();

        let plan = PrefillPlan::new(q, k, v, context_lengths, block_tables).map_err(rejected)?;
        if !self.backend.supported_dtypes().contains(&plan.dtype()) {
            return Err(rejected(AttentionError::invalid(format!(
                "backend {} does not support {:?}",
                self.backend.name(),
                plan.dtype()
            ))));
        }
        let write_plan = CacheWriter::plan(plan.spans(), block_tables, block_size, k, cache)
            .map_err(rejected)?;

        let gqa = plan.gqa();
        debug!(
            num_seqs = plan.spans().len(),
            total_tokens = plan.spans().total_tokens(),
            max_len = plan.spans().max_len(),
            num_heads = gqa.num_heads(),
            num_kv_heads = gqa.num_kv_heads(),
            head_dim = gqa.head_dim(),
            block_size,
            "prefill plan"
        );

        let summary = CacheWriter::write(&write_plan, k, v, cache)?;
        let output = self.backend.causal_attention(q, k, v, plan.spans(), gqa)?;

        Ok(PrefillOutput { output, summary })
    }
}

fn rejected(e: AttentionError) -> AttentionError {
    warn!(error = %e, "context attention rejected");
    e
}

/// Causal attention over a packed batch, populating the paged cache.
///
/// Convenience wrapper around [`UnpaddedAttention`] with the default
/// backend. Returns `[total_tokens, num_heads, head_dim]`.
pub fn context_attention_unpadded(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    cache: &mut PagedKvCache,
    context_lengths: &[usize],
    block_tables: &BlockTables,
    block_size: usize,
) -> Result<Tensor> {
    let attention = UnpaddedAttention::new(&AttentionConfig::default())?;
    let out = attention.forward(q, k, v, cache, context_lengths, block_tables, block_size)?;
    Ok(out.output)
}
