//! Naive attention backend using standard matrix operations.
//!
//! Sequences are processed one at a time: slice the span out of the packed
//! batch, run masked scaled dot-product attention with matmuls, and
//! concatenate the results back in token order. Works on any device; the
//! heavy lifting is parallelised inside candle's matmul.

use candle_core::{DType, Tensor};

use crate::error::Result;

use super::backend::ContextAttentionBackend;
use super::dispatch::{GqaLayout, SpanTable};
use super::ops::{causal_mask, repeat_kv};

pub struct NaiveAttentionBackend;

impl NaiveAttentionBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NaiveAttentionBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextAttentionBackend for NaiveAttentionBackend {
    fn name(&self) -> &'static str {
        "naive"
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
        if spans.is_empty() {
            return Ok(Tensor::zeros(
                (0, gqa.num_heads(), gqa.head_dim()),
                out_dtype,
                device,
            )?);
        }

        let scale = gqa.scale();
        let mut outputs = Vec::with_capacity(spans.len());

        for span in spans.iter() {
            tracing::trace!(seq = span.seq, start = span.start, len = span.len, "naive span");

            // [len, heads, d] → [1, heads, len, d], accumulated in f32
            let to_bhsd = |t: &Tensor| -> candle_core::Result<Tensor> {
                t.narrow(0, span.start, span.len)?
                    .to_dtype(DType::F32)?
                    .transpose(0, 1)?
                    .contiguous()?
                    .unsqueeze(0)
            };
            let q_s = to_bhsd(q)?;
            let k_s = repeat_kv(to_bhsd(k)?, gqa.group())?;
            let v_s = repeat_kv(to_bhsd(v)?, gqa.group())?;

            let scores = (q_s.matmul(&k_s.transpose(2, 3)?.contiguous()?)? * scale)?;
            let mask = causal_mask(span.len, DType::F32, device)?;
            let scores = scores.broadcast_add(&mask)?;
            let probs = candle_nn::ops::softmax_last_dim(&scores)?;
            let out = probs.matmul(&v_s)?;

            // [1, heads, len, d] → [len, heads, d]
            outputs.push(out.squeeze(0)?.transpose(0, 1)?);
        }

        Ok(Tensor::cat(&outputs, 0)?.to_dtype(out_dtype)?)
    }
}
