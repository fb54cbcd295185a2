use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};

/// Physical arrangement of one cache pool.
///
/// All layouts address the same logical element `(block, slot, head, dim)`;
/// they differ only in which axis is innermost.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KVCacheLayout {
    /// `[num_blocks, num_kv_heads, head_dim, block_size]`
    #[default]
    HDN,
    /// `[num_blocks, block_size, num_kv_heads, head_dim]`
    NHD,
    /// `[num_blocks, num_kv_heads, block_size, head_dim]`
    HND,
}

impl KVCacheLayout {
    pub fn cache_shape(
        self,
        num_blocks: usize,
        block_size: usize,
        num_kv_heads: usize,
        head_dim: usize,
    ) -> (usize, usize, usize, usize) {
        match self {
            Self::HDN => (num_blocks, num_kv_heads, head_dim, block_size),
            Self::NHD => (num_blocks, block_size, num_kv_heads, head_dim),
            Self::HND => (num_blocks, num_kv_heads, block_size, head_dim),
        }
    }

    /// Flat element offset of `(block, slot, head, dim)` in a contiguous pool.
    #[inline]
    #[allow(clippy::too_many_arguments)]
    pub fn element_offset(
        self,
        block: usize,
        slot: usize,
        head: usize,
        dim: usize,
        block_size: usize,
        num_kv_heads: usize,
        head_dim: usize,
    ) -> usize {
        let block_base = block * block_size * num_kv_heads * head_dim;
        block_base
            + match self {
                Self::HDN => (head * head_dim + dim) * block_size + slot,
                Self::NHD => (slot * num_kv_heads + head) * head_dim + dim,
                Self::HND => (head * block_size + slot) * head_dim + dim,
            }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "hdn" => Some(Self::HDN),
            "nhd" => Some(Self::NHD),
            "hnd" => Some(Self::HND),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub block_size: usize,
    pub num_blocks: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
    pub dtype: DType,
    pub device: Device,
    pub layout: KVCacheLayout,
}

impl CacheConfig {
    /// Pool sized for `num_seqs` sequences that each own a full table row.
    pub fn for_batch(
        num_seqs: usize,
        max_num_blocks_per_seq: usize,
        block_size: usize,
        num_kv_heads: usize,
        head_dim: usize,
        dtype: DType,
        device: Device,
    ) -> Self {
        Self {
            block_size,
            num_blocks: num_seqs * max_num_blocks_per_seq,
            num_kv_heads,
            head_dim,
            dtype,
            device,
            layout: KVCacheLayout::default(),
        }
    }

    pub fn with_layout(mut self, layout: KVCacheLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Scalars held by one pool (K or V).
    pub fn num_elements(&self) -> usize {
        self.num_blocks * self.block_size * self.num_kv_heads * self.head_dim
    }

    /// Bytes for both pools.
    pub fn size_in_bytes(&self) -> usize {
        2 * self.num_elements() * self.dtype.size_in_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn for_batch_reserves_full_rows() {
        // 4 sequences x 8 blocks of 16 tokens, 8 kv heads of dim 32, f16
        let config = CacheConfig::for_batch(4, 8, 16, 8, 32, DType::F16, Device::Cpu);
        assert_eq!(config.num_blocks, 32);
        assert_eq!(config.num_elements(), 32 * 16 * 8 * 32);
        assert_eq!(config.size_in_bytes(), 2 * 32 * 16 * 8 * 32 * 2);
        assert_eq!(config.layout, KVCacheLayout::HDN);
    }

    #[test]
    fn cache_shape_per_layout() {
        assert_eq!(KVCacheLayout::HDN.cache_shape(4, 16, 2, 8), (4, 2, 8, 16));
        assert_eq!(KVCacheLayout::NHD.cache_shape(4, 16, 2, 8), (4, 16, 2, 8));
        assert_eq!(KVCacheLayout::HND.cache_shape(4, 16, 2, 8), (4, 2, 16, 8));
    }

    #[test]
    fn element_offset_is_a_bijection() {
        let (blocks, block_size, heads, dim) = (3, 4, 2, 5);
        for layout in [KVCacheLayout::HDN, KVCacheLayout::NHD, KVCacheLayout::HND] {
            let mut seen = vec![false; blocks * block_size * heads * dim];
            for b in 0..blocks {
                for s in 0..block_size {
                    for h in 0..heads {
                        for d in 0..dim {
                            let off = layout.element_offset(b, s, h, d, block_size, heads, dim);
                            assert!(!seen[off], "{layout:?} maps two elements to {off}");
                            seen[off] = true;
                        }
                    }
                }
            }
            assert!(seen.iter().all(|&x| x));
        }
    }

    #[test]
    fn hdn_offset_keeps_slots_innermost() {
        let layout = KVCacheLayout::HDN;
        let base = layout.element_offset(1, 0, 0, 0, 16, 2, 8);
        assert_eq!(base, 16 * 2 * 8);
        assert_eq!(layout.element_offset(1, 1, 0, 0, 16, 2, 8), base + 1);
        assert_eq!(layout.element_offset(1, 0, 0, 1, 16, 2, 8), base + 16);
        assert_eq!(layout.element_offset(1, 0, 1, 0, 16, 2, 8), base + 8 * 16);
    }

    #[test]
    fn parse_layout_names() {
        assert_eq!(KVCacheLayout::parse("HDN"), Some(KVCacheLayout::HDN));
        assert_eq!(KVCacheLayout::parse("nhd"), Some(KVCacheLayout::NHD));
        assert_eq!(KVCacheLayout::parse("hnd"), Some(KVCacheLayout::HND));
        assert_eq!(KVCacheLayout::parse("dhn"), None);
    }
}
