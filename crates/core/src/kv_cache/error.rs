use thiserror::Error;

/// Errors raised by the caller-side block allocator.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum PoolError {
    #[error("out of blocks: requested {requested}, available {available}")]
    OutOfBlocks { requested: usize, available: usize },

    #[error("block {block_id} is not allocated")]
    BlockNotAllocated { block_id: usize },
}
