//! Tiled host backend: one independent unit of work per
//! `(sequence, query head, query tile)`.
//!
//! Units run on the rayon pool with no ordering between them. Inside a unit
//! each query row is reduced causally over `p' <= p` with a two-pass
//! softmax (row max first, then exponentials), accumulated in f32.

use candle_core::{DType, Tensor};
use rayon::prelude::*;

use crate::error::Result;

use super::backend::ContextAttentionBackend;
use super::dispatch::{GqaLayout, SeqSpan, SpanTable};

pub struct TiledAttentionBackend {
    query_tile: usize,
}

impl TiledAttentionBackend {
    pub fn new(query_tile: usize) -> Self {
        Self {
            query_tile: query_tile.max(1),
        }
    }

    pub fn query_tile(&self) -> usize {
        self.query_tile
    }
}

impl Default for TiledAttentionBackend {
    fn default() -> Self {
        Self::new(64)
    }
}

/// Query positions `[q_begin, q_end)` of one head of one sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct WorkUnit {
    span: SeqSpan,
    head: usize,
    q_begin: usize,
    q_end: usize,
}

fn work_units(spans: &SpanTable, num_heads: usize, query_tile: usize) -> Vec<WorkUnit> {
    let mut units = Vec::new();
    for span in spans.iter() {
        for head in 0..num_heads {
            for q_begin in (0..span.len).step_by(query_tile) {
                units.push(WorkUnit {
                    span: *span,
                    head,
                    q_begin,
                    q_end: (q_begin + query_tile).min(span.len),
                });
            }
        }
    }
    units
}

/// Packed host buffers, row-major `[tokens, heads, head_dim]`.
struct HostKernel<'a> {
    q: &'a [f32],
    k: &'a [f32],
    v: &'a [f32],
    gqa: GqaLayout,
    scale: f32,
}

impl HostKernel<'_> {
    #[inline]
    fn q_row(&self, token: usize, head: usize) -> &[f32] {
        let d = self.gqa.head_dim();
        let off = (token * self.gqa.num_heads() + head) * d;
        &self.q[off..off + d]
    }

    #[inline]
    fn kv_offset(&self, token: usize, kv_head: usize) -> usize {
        (token * self.gqa.num_kv_heads() + kv_head) * self.gqa.head_dim()
    }

    /// Output rows of one unit, `[q_end - q_begin, head_dim]`.
    fn run(&self, unit: &WorkUnit) -> Vec<f32> {
        let d = self.gqa.head_dim();
        let kv_head = self.gqa.kv_head(unit.head);
        let start = unit.span.start;
        let mut out = vec![0.0f32; (unit.q_end - unit.q_begin) * d];
        let mut scores = Vec::with_capacity(unit.q_end);

        for (row, p) in (unit.q_begin..unit.q_end).enumerate() {
            let q_row = self.q_row(start + p, unit.head);

            scores.clear();
            let mut max = f32::NEG_INFINITY;
            for key in 0..=p {
                let off = self.kv_offset(start + key, kv_head);
                let s = dot(q_row, &self.k[off..off + d]) * self.scale;
                max = max.max(s);
                scores.push(s);
            }

            let mut denom = 0.0f32;
            for s in scores.iter_mut() {
                *s = (*s - max).exp();
                denom += *s;
            }

            let acc = &mut out[row * d..(row + 1) * d];
            for (key, &w) in scores.iter().enumerate() {
                let off = self.kv_offset(start + key, kv_head);
                for (a, &x) in acc.iter_mut().zip(&self.v[off..off + d]) {
                    *a += w * x;
                }
            }
            let inv = 1.0 / denom;
            acc.iter_mut().for_each(|a| *a *= inv);
        }
        out
    }
}

#[inline]
fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

impl ContextAttentionBackend for TiledAttentionBackend {
    fn name(&self) -> &'static str {
        "tiled"
    }

    fn causal_attention(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        spans: &SpanTable,
        gqa: &GqaLayout,
    ) -> Result<Tensor> {
        let out_dtype = q.dtype();
        let device = q.device();
        let (num_heads, head_dim) = (gqa.num_heads(), gqa.head_dim());
        let total = spans.total_tokens();

        let host = |t: &Tensor| -> candle_core::Result<Vec<f32>> {
            t.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()
        };
        let (q_host, k_host, v_host) = (host(q)?, host(k)?, host(v)?);

        let kernel = HostKernel {
            q: &q_host,
            k: &k_host,
            v: &v_host,
            gqa: *gqa,
            scale: gqa.scale() as f32,
        };
        let units = work_units(spans, num_heads, self.query_tile);
        tracing::trace!(units = units.len(), query_tile = self.query_tile, "tiled dispatch");

        let tiles: Vec<Vec<f32>> = units.par_iter().map(|unit| kernel.run(unit)).collect();

        let mut out = vec![0.0f32; total * num_heads * head_dim];
        for (unit, tile) in units.iter().zip(tiles) {
            for (row, p) in (unit.q_begin..unit.q_end).enumerate() {
                let dst = ((unit.span.start + p) * num_heads + unit.head) * head_dim;
                let src = &tile[row * head_dim..(row + 1) * head_dim];
                out[dst..dst + head_dim].copy_from_slice(src);
            }
        }

        Ok(Tensor::from_vec(out, (total, num_heads, head_dim), device)?.to_dtype(out_dtype)?)
    }
}
