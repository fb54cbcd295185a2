use super::error::PoolError;

pub type BlockId = usize;

/// Physical block allocator for a cache pool.
///
/// Reservation happens on the caller's side before a prefill call; the
/// attention core only ever writes into blocks handed out here. Allocation
/// always returns the lowest free ids first, so allocating sequence by
/// sequence from a fresh pool yields one contiguous, disjoint id range per
/// sequence.
pub struct BlockPool {
    num_blocks: usize,
    free_list: Vec<BlockId>,
    allocated: Vec<bool>,
}

impl BlockPool {
    pub fn new(num_blocks: usize) -> Self {
        // LIFO: push 0..num_blocks so that pop gives low IDs first
        let free_list: Vec<BlockId> = (0..num_blocks).rev().collect();
        Self {
            num_blocks,
            free_list,
            allocated: vec![false; num_blocks],
        }
    }

    /// Allocate n blocks. Returns Err if insufficient free blocks.
    pub fn allocate(&mut self, n: usize) -> Result<Vec<BlockId>, PoolError> {
        if n > self.free_list.len() {
            return Err(PoolError::OutOfBlocks {
                requested: n,
                available: self.free_list.len(),
            });
        }
        let split = self.free_list.len() - n;
        let ids: Vec<BlockId> = self.free_list.drain(split..).rev().collect();
        for &id in &ids {
            self.allocated[id] = true;
        }
        Ok(ids)
    }

    /// Allocate enough blocks to hold `num_tokens` tokens.
    pub fn allocate_tokens(
        &mut self,
        num_tokens: usize,
        block_size: usize,
    ) -> Result<Vec<BlockId>, PoolError> {
        self.allocate(num_tokens.div_ceil(block_size))
    }

    /// Return blocks to the pool.
    pub fn free(&mut self, blocks: &[BlockId]) -> Result<(), PoolError> {
        for &id in blocks {
            if id >= self.num_blocks || !self.allocated[id] {
                return Err(PoolError::BlockNotAllocated { block_id: id });
            }
            self.allocated[id] = false;
            self.free_list.push(id);
        }
        Ok(())
    }

    pub fn num_free(&self) -> usize {
        self.free_list.len()
    }

    pub fn num_total(&self) -> usize {
        self.num_blocks
    }

    pub fn num_used(&self) -> usize {
        self.num_blocks - self.free_list.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_has_all_free() {
        let pool = BlockPool::new(64);
        assert_eq!(pool.num_free(), 64);
        assert_eq!(pool.num_used(), 0);
        assert_eq!(pool.num_total(), 64);
    }

    #[test]
    fn allocate_hands_out_low_ids_in_order() {
        let mut pool = BlockPool::new(16);
        assert_eq!(pool.allocate(3).unwrap(), vec![0, 1, 2]);
        assert_eq!(pool.allocate(2).unwrap(), vec![3, 4]);
        assert_eq!(pool.num_used(), 5);
    }

    #[test]
    fn allocate_tokens_rounds_up_to_blocks() {
        let mut pool = BlockPool::new(16);
        assert_eq!(pool.allocate_tokens(17, 16).unwrap(), vec![0, 1]);
        assert_eq!(pool.allocate_tokens(16, 16).unwrap(), vec![2]);
        assert!(pool.allocate_tokens(0, 16).unwrap().is_empty());
    }

    #[test]
    fn allocate_oom_returns_error() {
        let mut pool = BlockPool::new(4);
        assert_eq!(
            pool.allocate(5).unwrap_err(),
            PoolError::OutOfBlocks {
                requested: 5,
                available: 4
            }
        );
        // Nothing was taken by the failed request
        assert_eq!(pool.num_free(), 4);
    }

    #[test]
    fn double_free_returns_error() {
        let mut pool = BlockPool::new(8);
        let ids = pool.allocate(2).unwrap();
        pool.free(&ids).unwrap();
        assert!(matches!(
            pool.free(&ids),
            Err(PoolError::BlockNotAllocated { .. })
        ));
    }

    #[test]
    fn free_out_of_range_returns_error() {
        let mut pool = BlockPool::new(8);
        assert_eq!(
            pool.free(&[8]).unwrap_err(),
            PoolError::BlockNotAllocated { block_id: 8 }
        );
    }

    #[test]
    fn allocate_after_free_reuses_blocks() {
        let mut pool = BlockPool::new(4);
        let ids1 = pool.allocate(4).unwrap();
        pool.free(&ids1).unwrap();
        let ids2 = pool.allocate(4).unwrap();
        assert_eq!(ids2.len(), 4);
        assert_eq!(pool.num_free(), 0);
    }
}
