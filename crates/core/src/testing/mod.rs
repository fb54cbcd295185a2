//! Shared test utilities for prefill-core.
//!
//! This module provides seeded packed-batch generators, the mock block
//! allocation used by the prefill tests, a direct cache filler and an f64
//! reference for comparing attention outputs.

mod batch;
mod mock_cache;
mod reference;

pub use batch::{random_context_lengths, random_packed_batch, BatchShape, PackedBatch};
pub use mock_cache::{mock_alloc_block_tables, mock_fill_cache};
pub use reference::{allclose, assert_close, max_abs_diff, reference_context_attention};
