use candle_core::{DType, Tensor};

use crate::error::{AttentionError, Result};

/// Per-sequence causal attention computed in f64 on the host.
///
/// Each sequence is treated as an independent dense `[L, L]` problem with a
/// lower-triangular mask, which is the definition the packed kernels must
/// agree with. Returns an F32 tensor shaped like `q`.
pub fn reference_context_attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    context_lengths: &[usize],
) -> Result<Tensor> {
    let (total, num_heads, head_dim) = q.dims3()?;
    let (_, num_kv_heads, _) = k.dims3()?;
    if num_kv_heads == 0 || num_heads % num_kv_heads != 0 {
        return Err(AttentionError::shape(format!(
            "{num_heads} query heads cannot share {num_kv_heads} kv heads"
        )));
    }
    if context_lengths.iter().sum::<usize>() != total {
        return Err(AttentionError::invalid("context lengths do not cover the batch"));
    }
    let group = num_heads / num_kv_heads;
    let device = q.device().clone();
    let scale = 1.0 / (head_dim as f64).sqrt();

    let host = |t: &Tensor| -> Result<Vec<f64>> {
        Ok(t.to_dtype(DType::F64)?.flatten_all()?.to_vec1::<f64>()?)
    };
    let (q, k, v) = (host(q)?, host(k)?, host(v)?);
    let q_at = |t: usize, h: usize| (t * num_heads + h) * head_dim;
    let kv_at = |t: usize, h: usize| (t * num_kv_heads + h) * head_dim;

    let mut out = vec![0.0f32; total * num_heads * head_dim];
    let mut start = 0;
    for &len in context_lengths {
        for h in 0..num_heads {
            let kvh = h / group;
            for i in 0..len {
                let qi = &q[q_at(start + i, h)..][..head_dim];
                let scores: Vec<f64> = (0..=i)
                    .map(|j| {
                        let kj = &k[kv_at(start + j, kvh)..][..head_dim];
                        qi.iter().zip(kj).map(|(a, b)| a * b).sum::<f64>() * scale
                    })
                    .collect();
                let max = scores.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
                let weights: Vec<f64> = scores.iter().map(|s| (s - max).exp()).collect();
                let denom: f64 = weights.iter().sum();

                let dst = q_at(start + i, h);
                for d in 0..head_dim {
                    let acc: f64 = weights
                        .iter()
                        .enumerate()
                        .map(|(j, w)| w * v[kv_at(start + j, kvh) + d])
                        .sum();
                    out[dst + d] = (acc / denom) as f32;
                }
            }
        }
        start += len;
    }

    Ok(Tensor::from_vec(out, (total, num_heads, head_dim), &device)?)
}

/// Largest elementwise `|a - b|`, both read as f32.
pub fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    let a: Vec<f32> = a.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
    let b: Vec<f32> = b.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
    Ok(a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f32::max))
}

/// Whether `|actual - expected| <= atol + rtol * |expected|` holds everywhere.
pub fn allclose(actual: &Tensor, expected: &Tensor, atol: f32, rtol: f32) -> Result<bool> {
    if actual.dims() != expected.dims() {
        return Ok(false);
    }
    let a: Vec<f32> = actual.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
    let b: Vec<f32> = expected.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
    Ok(a.iter()
        .zip(b.iter())
        .all(|(x, y)| (x - y).abs() <= atol + rtol * y.abs()))
}

/// Panic unless `|actual - expected| <= atol + rtol * |expected|` everywhere.
pub fn assert_close(actual: &Tensor, expected: &Tensor, atol: f32, rtol: f32) {
    assert_eq!(actual.dims(), expected.dims(), "shape mismatch");
    let read = |t: &Tensor| -> Vec<f32> {
        t.to_dtype(DType::F32)
            .and_then(|t| t.flatten_all())
            .and_then(|t| t.to_vec1())
            .unwrap_or_else(|e| panic!("cannot read tensor: {e}"))
    };
    let (a, b) = (read(actual), read(expected));
    for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
        let tol = atol + rtol * y.abs();
        assert!(
            (x - y).abs() <= tol,
            "element {i}: {x} vs {y} (|diff| {} > {tol})",
            (x - y).abs()
        );
    }
}
