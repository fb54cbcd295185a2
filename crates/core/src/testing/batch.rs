use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::Rng;

use crate::error::Result;

/// Head geometry of a generated batch.
#[derive(Debug, Clone, Copy)]
pub struct BatchShape {
    pub num_heads: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
    pub dtype: DType,
}

impl BatchShape {
    /// 16 query heads of dim 32 sharing `num_heads / kv_group` kv heads.
    pub fn grouped(kv_group: usize, dtype: DType) -> Self {
        Self {
            num_heads: 16,
            num_kv_heads: 16 / kv_group,
            head_dim: 32,
            dtype,
        }
    }
}

/// One packed prefill batch.
#[derive(Debug, Clone)]
pub struct PackedBatch {
    pub q: Tensor,
    pub k: Tensor,
    pub v: Tensor,
    pub context_lengths: Vec<usize>,
}

impl PackedBatch {
    pub fn total_tokens(&self) -> usize {
        self.context_lengths.iter().sum()
    }
}

/// Either every sequence has `max_seq_len` tokens, or each length is drawn
/// uniformly from `[1, max_seq_len)`.
pub fn random_context_lengths(
    rng: &mut StdRng,
    num_seqs: usize,
    max_seq_len: usize,
    same_context: bool,
) -> Vec<usize> {
    if same_context || max_seq_len <= 1 {
        return vec![max_seq_len.max(1); num_seqs];
    }
    (0..num_seqs).map(|_| rng.gen_range(1..max_seq_len)).collect()
}

/// Q/K/V drawn from N(0, 0.5) for the given lengths.
pub fn random_packed_batch(
    rng: &mut StdRng,
    context_lengths: &[usize],
    shape: BatchShape,
    device: &Device,
) -> Result<PackedBatch> {
    let total: usize = context_lengths.iter().sum();
    let mut tensor = |heads: usize| -> Result<Tensor> {
        let data = normal_samples(rng, total * heads * shape.head_dim, 0.5);
        Ok(Tensor::from_vec(data, (total, heads, shape.head_dim), device)?.to_dtype(shape.dtype)?)
    };
    let q = tensor(shape.num_heads)?;
    let k = tensor(shape.num_kv_heads)?;
    let v = tensor(shape.num_kv_heads)?;
    Ok(PackedBatch {
        q,
        k,
        v,
        context_lengths: context_lengths.to_vec(),
    })
}

// Box-Muller over the seeded generator.
fn normal_samples(rng: &mut StdRng, n: usize, std: f32) -> Vec<f32> {
    let mut out = Vec::with_capacity(n + 1);
    while out.len() < n {
        let u1: f32 = rng.gen_range(f32::EPSILON..1.0);
        let u2: f32 = rng.gen();
        let r = (-2.0 * u1.ln()).sqrt() * std;
        let theta = 2.0 * std::f32::consts::PI * u2;
        out.push(r * theta.cos());
        out.push(r * theta.sin());
    }
    out.truncate(n);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_equal_lengths_use_max() {
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(random_context_lengths(&mut rng, 3, 128, true), vec![128; 3]);
    }

    #[test]
    fn test_random_lengths_stay_below_max() {
        let mut rng = StdRng::seed_from_u64(7);
        let lens = random_context_lengths(&mut rng, 64, 20, false);
        assert!(lens.iter().all(|&l| (1..20).contains(&l)));
    }

    #[test]
    fn test_batch_shapes() {
        let mut rng = StdRng::seed_from_u64(1);
        let batch = random_packed_batch(
            &mut rng,
            &[3, 5],
            BatchShape::grouped(2, DType::F16),
            &Device::Cpu,
        )
        .unwrap();
        assert_eq!(batch.total_tokens(), 8);
        assert_eq!(batch.q.dims(), &[8, 16, 32]);
        assert_eq!(batch.k.dims(), &[8, 8, 32]);
        assert_eq!(batch.v.dtype(), DType::F16);
    }

    #[test]
    fn test_samples_are_reproducible() {
        let a = normal_samples(&mut StdRng::seed_from_u64(3), 33, 0.5);
        let b = normal_samples(&mut StdRng::seed_from_u64(3), 33, 0.5);
        assert_eq!(a.len(), 33);
        assert_eq!(a, b);
    }
}
