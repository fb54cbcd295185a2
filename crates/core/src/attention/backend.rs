//! Causal attention engine trait for pluggable implementations.
//!
//! A backend computes attention for a packed batch whose spans and head
//! mapping were already validated by the dispatch layer. Backends never see
//! the cache: in the prefill path attention reads the freshly computed K/V.

use candle_core::{DType, Tensor};

use crate::config::{AttentionConfig, BackendKind};
use crate::error::Result;

use super::dispatch::{GqaLayout, SpanTable};

pub trait ContextAttentionBackend: Send + Sync {
    /// Returns the name of this backend.
    fn name(&self) -> &'static str;

    /// Causal attention over every span of a packed batch.
    ///
    /// # Arguments
    /// * `q` - Query tensor `[total_tokens, num_heads, head_dim]`
    /// * `k` - Key tensor `[total_tokens, num_kv_heads, head_dim]`
    /// * `v` - Value tensor `[total_tokens, num_kv_heads, head_dim]`
    /// * `spans` - Per-sequence token ranges
    /// * `gqa` - Query head → kv head mapping
    ///
    /// Returns `[total_tokens, num_heads, head_dim]` in Q's dtype.
    fn causal_attention(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        spans: &SpanTable,
        gqa: &GqaLayout,
    ) -> Result<Tensor>;

    fn supported_dtypes(&self) -> &[DType] {
        &[DType::F32, DType::F16, DType::BF16]
    }
}

pub fn select_backend(config: &AttentionConfig) -> Box<dyn ContextAttentionBackend> {
    match config.backend {
        BackendKind::Naive => Box::new(super::naive::NaiveAttentionBackend::new()),
        BackendKind::Tiled => Box::new(super::tiled::TiledAttentionBackend::new(config.query_tile)),
    }
}
