//! Paged KV cache: block pool, block tables and the prefill write path.

mod block_pool;
mod block_table;
mod cache_writer;
pub mod config;
mod error;
mod paged_cache;

pub use block_pool::{BlockId, BlockPool};
pub use block_table::BlockTables;
pub use cache_writer::{CacheWriter, WritePlan, WriteSummary};
pub use config::{CacheConfig, KVCacheLayout};
pub use error::PoolError;
pub use paged_cache::PagedKvCache;
