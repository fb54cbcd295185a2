//! Criterion benchmarks for unpadded context attention.
//!
//! Covers the two attention backends on packed batches, the paged cache
//! write on its own, and causal mask generation -- all running on CPU device.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use candle_core::{DType, Device};
use prefill_core::attention::{
    causal_mask, ContextAttentionBackend, GqaLayout, NaiveAttentionBackend, SpanTable,
    TiledAttentionBackend,
};
use prefill_core::kv_cache::{CacheWriter, CacheConfig, PagedKvCache};
use prefill_core::testing::{mock_alloc_block_tables, random_packed_batch, BatchShape, PackedBatch};
use rand::rngs::StdRng;
use rand::SeedableRng;

const BLOCK_SIZE: usize = 16;

fn packed(num_seqs: usize, seq_len: usize, kv_group: usize) -> PackedBatch {
    let mut rng = StdRng::seed_from_u64(0);
    random_packed_batch(
        &mut rng,
        &vec![seq_len; num_seqs],
        BatchShape::grouped(kv_group, DType::F32),
        &Device::Cpu,
    )
    .expect("failed to build batch")
}

// ---------------------------------------------------------------------------
// Attention backends
// ---------------------------------------------------------------------------

fn bench_backends(c: &mut Criterion) {
    let mut group = c.benchmark_group("causal_attention");
    group.sample_size(10);

    for &(num_seqs, seq_len) in &[(4, 128), (8, 256), (2, 1024)] {
        let batch = packed(num_seqs, seq_len, 2);
        let spans = SpanTable::from_context_lengths(&batch.context_lengths, batch.total_tokens())
            .expect("span table failed");
        let gqa = GqaLayout::new(16, 8, 32).expect("gqa layout failed");
        let label = format!("b{num_seqs}_s{seq_len}");

        let backends: [(&str, Box<dyn ContextAttentionBackend>); 2] = [
            ("naive", Box::new(NaiveAttentionBackend::new())),
            ("tiled", Box::new(TiledAttentionBackend::default())),
        ];
        for (name, backend) in &backends {
            group.bench_with_input(BenchmarkId::new(*name, &label), &label, |b, _| {
                b.iter(|| {
                    backend
                        .causal_attention(
                            black_box(&batch.q),
                            black_box(&batch.k),
                            black_box(&batch.v),
                            &spans,
                            &gqa,
                        )
                        .expect("causal_attention failed")
                });
            });
        }
    }
    group.finish();
}

fn bench_query_tile(c: &mut Criterion) {
    let mut group = c.benchmark_group("tiled_query_tile");
    group.sample_size(10);

    let batch = packed(4, 512, 2);
    let spans = SpanTable::from_context_lengths(&batch.context_lengths, batch.total_tokens())
        .expect("span table failed");
    let gqa = GqaLayout::new(16, 8, 32).expect("gqa layout failed");

    for &tile in &[16, 64, 256] {
        let backend = TiledAttentionBackend::new(tile);
        group.bench_with_input(BenchmarkId::new("tile", tile), &tile, |b, _| {
            b.iter(|| {
                backend
                    .causal_attention(&batch.q, &batch.k, &batch.v, &spans, &gqa)
                    .expect("causal_attention failed")
            });
        });
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Paged cache write
// ---------------------------------------------------------------------------

fn bench_cache_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_write");

    for &(num_seqs, seq_len) in &[(4, 128), (32, 128), (8, 512)] {
        let batch = packed(num_seqs, seq_len, 2);
        let max_blocks = seq_len.div_ceil(BLOCK_SIZE);
        let tables = mock_alloc_block_tables(&batch.context_lengths, max_blocks, BLOCK_SIZE)
            .expect("block tables failed");
        let spans = SpanTable::from_context_lengths(&batch.context_lengths, batch.total_tokens())
            .expect("span table failed");
        let config = CacheConfig::for_batch(
            num_seqs,
            max_blocks,
            BLOCK_SIZE,
            8,
            32,
            DType::F32,
            Device::Cpu,
        );
        let mut cache = PagedKvCache::new(&config).expect("cache alloc failed");
        let label = format!("b{num_seqs}_s{seq_len}");

        group.bench_with_input(BenchmarkId::new("scatter", &label), &label, |b, _| {
            b.iter(|| {
                let plan = CacheWriter::plan(&spans, &tables, BLOCK_SIZE, &batch.k, &cache)
                    .expect("plan failed");
                CacheWriter::write(&plan, black_box(&batch.k), black_box(&batch.v), &mut cache)
                    .expect("write failed")
            });
        });
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Causal mask generation
// ---------------------------------------------------------------------------

fn bench_causal_mask(c: &mut Criterion) {
    let mut group = c.benchmark_group("causal_mask");

    for &seq_len in &[128, 512, 2048] {
        group.bench_with_input(
            BenchmarkId::new("seq_len", seq_len),
            &seq_len,
            |b, &seq_len| {
                b.iter(|| {
                    causal_mask(black_box(seq_len), DType::F32, &Device::Cpu)
                        .expect("causal_mask failed")
                });
            },
        );
    }
    group.finish();
}

criterion_group!(attn_benches, bench_backends, bench_query_tile);
criterion_group!(cache_benches, bench_cache_write);
criterion_group!(mask_benches, bench_causal_mask);
criterion_main!(attn_benches, cache_benches, mask_benches);
