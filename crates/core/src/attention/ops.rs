//! Tensor helpers shared by the attention backends.

use candle_core::{DType, Device, Result, Tensor};

/// Repeat KV heads for Grouped Query Attention.
///
/// Query head `h` ends up paired with kv head `h / num_kv_groups`.
///
/// # Arguments
/// * `x` - Input tensor `[batch, num_kv_heads, seq_len, head_dim]`
/// * `num_kv_groups` - Query heads per kv head (num_heads / num_kv_heads)
///
/// # Returns
/// Tensor with shape `[batch, num_heads, seq_len, head_dim]`
pub fn repeat_kv(x: Tensor, num_kv_groups: usize) -> Result<Tensor> {
    if num_kv_groups == 1 {
        return Ok(x);
    }
    let (b, num_kv_heads, s, d) = x.dims4()?;
    let num_heads = num_kv_heads * num_kv_groups;
    x.unsqueeze(2)?
        .expand((b, num_kv_heads, num_kv_groups, s, d))?
        .reshape((b, num_heads, s, d))
}

/// Additive lower-triangular mask `[1, 1, seq_len, seq_len]`.
///
/// Entry `(i, j)` is `-inf` for `j > i` and `0` otherwise; the diagonal is
/// kept.
pub fn causal_mask(seq_len: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| {
            (0..seq_len).map(move |j| if j > i { f32::NEG_INFINITY } else { 0.0 })
        })
        .collect();
    let mask = Tensor::from_vec(mask, (1, 1, seq_len, seq_len), device)?;
    mask.to_dtype(dtype)
}
