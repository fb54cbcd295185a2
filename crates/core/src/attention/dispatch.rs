//! Unpadded dispatch: span boundaries and entry validation.
//!
//! A packed batch concatenates sequences along the token axis with no
//! padding. Everything downstream works from the [`SpanTable`] built here
//! once per call, and from the [`GqaLayout`] that fixes the query-head →
//! kv-head mapping.

use std::ops::Range;

use candle_core::{DType, Tensor};

use crate::error::{AttentionError, Result};
use crate::kv_cache::BlockTables;

/// Token range of one sequence inside the packed batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeqSpan {
    pub seq: usize,
    pub start: usize,
    pub len: usize,
}

impl SeqSpan {
    pub fn end(&self) -> usize {
        self.start + self.len
    }

    pub fn range(&self) -> Range<usize> {
        self.start..self.end()
    }
}

/// Prefix sums over context lengths, computed once per call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanTable {
    spans: Vec<SeqSpan>,
    total_tokens: usize,
}

impl SpanTable {
    /// Build spans for `context_lengths` against a packed batch of
    /// `total_tokens` tokens.
    ///
    /// Every length must be positive and the lengths must add up to
    /// `total_tokens` exactly.
    pub fn from_context_lengths(context_lengths: &[usize], total_tokens: usize) -> Result<Self> {
        let mut spans = Vec::with_capacity(context_lengths.len());
        let mut start = 0usize;
        for (seq, &len) in context_lengths.iter().enumerate() {
            if len == 0 {
                return Err(AttentionError::invalid(format!(
                    "context length of sequence {seq} must be positive"
                )));
            }
            spans.push(SeqSpan { seq, start, len });
            start = start.checked_add(len).ok_or_else(|| {
                AttentionError::invalid(format!("context lengths overflow at sequence {seq}"))
            })?;
        }
        if start != total_tokens {
            return Err(AttentionError::invalid(format!(
                "context lengths sum to {start}, packed tensors hold {total_tokens} tokens"
            )));
        }
        Ok(Self {
            spans,
            total_tokens,
        })
    }

    pub fn spans(&self) -> &[SeqSpan] {
        &self.spans
    }

    pub fn iter(&self) -> std::slice::Iter<'_, SeqSpan> {
        self.spans.iter()
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    pub fn total_tokens(&self) -> usize {
        self.total_tokens
    }

    pub fn max_len(&self) -> usize {
        self.spans.iter().map(|s| s.len).max().unwrap_or(0)
    }
}

/// Grouped-query head sharing, validated once at entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GqaLayout {
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    group: usize,
}

impl GqaLayout {
    pub fn new(num_heads: usize, num_kv_heads: usize, head_dim: usize) -> Result<Self> {
        if num_kv_heads == 0 || num_heads == 0 {
            return Err(AttentionError::shape(format!(
                "head counts must be positive (num_heads {num_heads}, num_kv_heads {num_kv_heads})"
            )));
        }
        if num_heads % num_kv_heads != 0 {
            return Err(AttentionError::shape(format!(
                "num_heads {num_heads} is not divisible by num_kv_heads {num_kv_heads}"
            )));
        }
        if head_dim == 0 {
            return Err(AttentionError::shape("head_dim must be positive"));
        }
        Ok(Self {
            num_heads,
            num_kv_heads,
            head_dim,
            group: num_heads / num_kv_heads,
        })
    }

    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    pub fn num_kv_heads(&self) -> usize {
        self.num_kv_heads
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    /// Query heads per kv head (`kv_group_num`).
    pub fn group(&self) -> usize {
        self.group
    }

    #[inline]
    pub fn kv_head(&self, head: usize) -> usize {
        head / self.group
    }

    /// Softmax scale `1 / sqrt(head_dim)`.
    pub fn scale(&self) -> f64 {
        1.0 / (self.head_dim as f64).sqrt()
    }
}

/// Validated shapes of one prefill call.
#[derive(Debug, Clone)]
pub struct PrefillPlan {
    spans: SpanTable,
    gqa: GqaLayout,
    dtype: DType,
}

impl PrefillPlan {
    /// Check every input precondition that does not involve the cache.
    ///
    /// Q is `[tokens, num_heads, head_dim]`; K and V are
    /// `[tokens, num_kv_heads, head_dim]`.
    pub fn new(
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        context_lengths: &[usize],
        block_tables: &BlockTables,
    ) -> Result<Self> {
        let (q_tokens, num_heads, q_head_dim) = dims3("q", q)?;
        let (k_tokens, num_kv_heads, k_head_dim) = dims3("k", k)?;
        dims3("v", v)?;
        if k.dims() != v.dims() {
            return Err(AttentionError::shape(format!(
                "k shape {:?} differs from v shape {:?}",
                k.dims(),
                v.dims()
            )));
        }
        if q.dtype() != k.dtype() || k.dtype() != v.dtype() {
            return Err(AttentionError::shape(format!(
                "q/k/v dtypes differ: {:?}/{:?}/{:?}",
                q.dtype(),
                k.dtype(),
                v.dtype()
            )));
        }
        if q_head_dim != k_head_dim {
            return Err(AttentionError::shape(format!(
                "q head_dim {q_head_dim} differs from k head_dim {k_head_dim}"
            )));
        }
        let gqa = GqaLayout::new(num_heads, num_kv_heads, q_head_dim)?;
        if k_tokens != q_tokens {
            return Err(AttentionError::invalid(format!(
                "k/v hold {k_tokens} tokens, q holds {q_tokens}"
            )));
        }
        let spans = SpanTable::from_context_lengths(context_lengths, q_tokens)?;
        if block_tables.num_rows() != spans.len() {
            return Err(AttentionError::invalid(format!(
                "{} context lengths but {} block table rows",
                spans.len(),
                block_tables.num_rows()
            )));
        }
        Ok(Self {
            spans,
            gqa,
            dtype: q.dtype(),
        })
    }

    pub fn spans(&self) -> &SpanTable {
        &self.spans
    }

    pub fn gqa(&self) -> &GqaLayout {
        &self.gqa
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }
}

fn dims3(name: &str, t: &Tensor) -> Result<(usize, usize, usize)> {
    t.dims3().map_err(|_| {
        AttentionError::shape(format!(
            "{name} must be [tokens, heads, head_dim], got {:?}",
            t.dims()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn packed(tokens: usize, heads: usize, dim: usize) -> Tensor {
        Tensor::zeros((tokens, heads, dim), DType::F32, &Device::Cpu).unwrap()
    }

    fn tables(rows: usize) -> BlockTables {
        BlockTables::from_rows(vec![vec![0]; rows], 4).unwrap()
    }

    #[test]
    fn spans_follow_prefix_sums() {
        let spans = SpanTable::from_context_lengths(&[3, 1, 4], 8).unwrap();
        let ranges: Vec<_> = spans.iter().map(SeqSpan::range).collect();
        assert_eq!(ranges, vec![0..3, 3..4, 4..8]);
        assert_eq!(spans.total_tokens(), 8);
        assert_eq!(spans.max_len(), 4);
    }

    #[test]
    fn spans_reject_zero_length() {
        let err = SpanTable::from_context_lengths(&[3, 0, 4], 7).unwrap_err();
        assert!(matches!(err, AttentionError::InvalidInput(_)));
        assert!(err.to_string().contains("sequence 1"));
    }

    #[test]
    fn spans_reject_wrong_total() {
        let err = SpanTable::from_context_lengths(&[3, 4], 8).unwrap_err();
        assert!(err.to_string().contains("sum to 7"));
    }

    #[test]
    fn spans_reject_overflowing_lengths() {
        let err = SpanTable::from_context_lengths(&[usize::MAX, 2], 1).unwrap_err();
        assert!(matches!(err, AttentionError::InvalidInput(_)));
        assert!(err.to_string().contains("sequence 1"));
    }

    #[test]
    fn empty_batch_is_valid() {
        let spans = SpanTable::from_context_lengths(&[], 0).unwrap();
        assert!(spans.is_empty());
        assert_eq!(spans.total_tokens(), 0);
        assert_eq!(spans.max_len(), 0);
    }

    #[test]
    fn gqa_maps_heads_to_groups() {
        let gqa = GqaLayout::new(16, 8, 32).unwrap();
        assert_eq!(gqa.group(), 2);
        let kv: Vec<_> = (0..6).map(|h| gqa.kv_head(h)).collect();
        assert_eq!(kv, vec![0, 0, 1, 1, 2, 2]);
        assert!((gqa.scale() - 1.0 / 32f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn gqa_rejects_indivisible_heads() {
        assert!(matches!(
            GqaLayout::new(6, 4, 8),
            Err(AttentionError::ShapeMismatch(_))
        ));
        assert!(GqaLayout::new(4, 0, 8).is_err());
        assert!(GqaLayout::new(4, 4, 0).is_err());
    }

    #[test]
    fn plan_accepts_well_formed_batch() {
        let plan = PrefillPlan::new(
            &packed(5, 4, 8),
            &packed(5, 2, 8),
            &packed(5, 2, 8),
            &[2, 3],
            &tables(2),
        )
        .unwrap();
        assert_eq!(plan.spans().len(), 2);
        assert_eq!(plan.gqa().group(), 2);
        assert_eq!(plan.dtype(), DType::F32);
    }

    #[test]
    fn plan_rejects_head_dim_mismatch() {
        let err = PrefillPlan::new(
            &packed(5, 4, 8),
            &packed(5, 2, 16),
            &packed(5, 2, 16),
            &[5],
            &tables(1),
        )
        .unwrap_err();
        assert!(matches!(err, AttentionError::ShapeMismatch(_)));
    }

    #[test]
    fn plan_rejects_row_count_mismatch() {
        let err = PrefillPlan::new(
            &packed(5, 4, 8),
            &packed(5, 2, 8),
            &packed(5, 2, 8),
            &[2, 3],
            &tables(3),
        )
        .unwrap_err();
        assert!(matches!(err, AttentionError::InvalidInput(_)));
    }

    #[test]
    fn plan_rejects_token_count_mismatch() {
        let err = PrefillPlan::new(
            &packed(5, 4, 8),
            &packed(4, 2, 8),
            &packed(4, 2, 8),
            &[5],
            &tables(1),
        )
        .unwrap_err();
        assert!(matches!(err, AttentionError::InvalidInput(_)));
    }

    #[test]
    fn plan_rejects_rank_and_kv_mismatch() {
        let flat = Tensor::zeros((5, 32), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            PrefillPlan::new(&flat, &packed(5, 2, 8), &packed(5, 2, 8), &[5], &tables(1)),
            Err(AttentionError::ShapeMismatch(_))
        ));
        assert!(matches!(
            PrefillPlan::new(
                &packed(5, 4, 8),
                &packed(5, 2, 8),
                &packed(5, 1, 8),
                &[5],
                &tables(1)
            ),
            Err(AttentionError::ShapeMismatch(_))
        ));
    }
}
