//! Scatter of freshly computed K/V into reserved cache blocks.
//!
//! Planning and writing are split: [`CacheWriter::plan`] checks every
//! destination of the call against the block tables and the pool, and only
//! a successful plan can be written. A rejected call therefore never leaves
//! partially written sequences behind.

use candle_core::Tensor;
use rayon::prelude::*;

use crate::attention::SpanTable;
use crate::error::{AttentionError, OverflowKind, Result};

use super::block_pool::BlockId;
use super::block_table::BlockTables;
use super::paged_cache::PagedKvCache;

/// What a write touched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteSummary {
    pub tokens_written: usize,
    pub blocks_written: usize,
}

/// Validated destinations for every sequence of one call.
#[derive(Debug)]
pub struct WritePlan<'a> {
    spans: &'a SpanTable,
    /// Per sequence, the reserved blocks its tokens land in.
    blocks: Vec<&'a [BlockId]>,
    block_size: usize,
}

impl WritePlan<'_> {
    pub fn num_blocks(&self) -> usize {
        self.blocks.iter().map(|b| b.len()).sum()
    }

    #[cfg(test)]
    fn blocks_for(&self, seq: usize) -> &[BlockId] {
        self.blocks[seq]
    }
}

pub struct CacheWriter;

impl CacheWriter {
    /// Validate the destinations for `spans` before anything is written.
    ///
    /// `k` is the packed `[tokens, num_kv_heads, head_dim]` source; its head
    /// geometry and dtype must match the pool.
    pub fn plan<'a>(
        spans: &'a SpanTable,
        block_tables: &'a BlockTables,
        block_size: usize,
        k: &Tensor,
        cache: &PagedKvCache,
    ) -> Result<WritePlan<'a>> {
        if block_size == 0 || block_size != cache.block_size() {
            return Err(AttentionError::invalid(format!(
                "block_size {block_size} does not match the cache block size {}",
                cache.block_size()
            )));
        }
        let (_, num_kv_heads, head_dim) = k.dims3()?;
        if num_kv_heads != cache.num_kv_heads() || head_dim != cache.head_dim() {
            return Err(AttentionError::shape(format!(
                "k has {num_kv_heads} heads of dim {head_dim}, cache holds {} heads of dim {}",
                cache.num_kv_heads(),
                cache.head_dim()
            )));
        }
        if k.dtype() != cache.dtype() {
            return Err(AttentionError::invalid(format!(
                "k/v dtype {:?} differs from cache dtype {:?}",
                k.dtype(),
                cache.dtype()
            )));
        }
        if block_tables.num_rows() != spans.len() {
            return Err(AttentionError::invalid(format!(
                "{} sequences but {} block table rows",
                spans.len(),
                block_tables.num_rows()
            )));
        }

        let max_tokens = block_tables.max_tokens_per_seq(block_size);
        let mut owner: Vec<Option<usize>> = vec![None; cache.num_blocks()];
        let mut blocks = Vec::with_capacity(spans.len());

        for span in spans.iter() {
            let seq = span.seq;
            if span.len > max_tokens {
                return Err(AttentionError::CacheOverflow {
                    seq,
                    kind: OverflowKind::TableWidth {
                        context_len: span.len,
                        max_tokens,
                    },
                });
            }
            let row = block_tables.row(seq);
            if span.len > block_tables.capacity_tokens(seq, block_size) {
                return Err(AttentionError::CacheOverflow {
                    seq,
                    kind: OverflowKind::UnassignedBlock {
                        logical_block: row.len(),
                        row_len: row.len(),
                    },
                });
            }
            let used = &row[..span.len.div_ceil(block_size)];
            for &block_id in used {
                let Some(slot) = owner.get_mut(block_id) else {
                    return Err(AttentionError::CacheOverflow {
                        seq,
                        kind: OverflowKind::BlockOutOfPool {
                            block_id,
                            num_blocks: cache.num_blocks(),
                        },
                    });
                };
                if let Some(other) = *slot {
                    return Err(AttentionError::invalid(format!(
                        "block {block_id} is written by both sequence {other} and sequence {seq}"
                    )));
                }
                *slot = Some(seq);
            }
            blocks.push(used);
        }

        Ok(WritePlan {
            spans,
            blocks,
            block_size,
        })
    }

    /// Scatter packed `k`/`v` into the planned blocks.
    ///
    /// Destinations are disjoint across sequences and positions, so the
    /// per-sequence address computation runs in parallel and the scatter
    /// itself needs no ordering. Tail slots of a partially filled last block
    /// are left as they were.
    pub fn write(
        plan: &WritePlan<'_>,
        k: &Tensor,
        v: &Tensor,
        cache: &mut PagedKvCache,
    ) -> Result<WriteSummary> {
        let summary = WriteSummary {
            tokens_written: plan.spans.total_tokens(),
            blocks_written: plan.num_blocks(),
        };
        if summary.tokens_written == 0 {
            return Ok(summary);
        }

        let block_size = plan.block_size;
        let per_token = cache.num_kv_heads() * cache.head_dim();
        let shared: &PagedKvCache = cache;
        let per_seq: Vec<Vec<u32>> = plan
            .spans
            .spans()
            .par_iter()
            .map(|span| {
                let blocks = plan.blocks[span.seq];
                let mut offsets = Vec::with_capacity(span.len * per_token);
                for pos in 0..span.len {
                    shared.push_token_offsets(
                        blocks[pos / block_size],
                        pos % block_size,
                        &mut offsets,
                    );
                }
                offsets
            })
            .collect();

        // Spans tile the packed batch in order, so concatenation lines the
        // offsets up with the flattened sources.
        let offsets = per_seq.concat();
        cache.scatter(k, v, offsets)?;

        tracing::debug!(
            tokens = summary.tokens_written,
            blocks = summary.blocks_written,
            "kv cache write complete"
        );
        Ok(summary)
    }
}
