pub mod attention;
pub mod config;
pub mod error;
pub mod kv_cache;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use attention::{context_attention_unpadded, PrefillOutput, UnpaddedAttention};
pub use config::{AttentionConfig, BackendKind};
pub use error::{AttentionError, OverflowKind, Result};
pub use kv_cache::{BlockTables, CacheConfig, KVCacheLayout, PagedKvCache};
