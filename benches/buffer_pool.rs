use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use protohub::buffer::{BufferPool, ChunkQueue};

const CHUNK_SIZES: [usize; 3] = [4 * 1024, 64 * 1024, 256 * 1024];

fn acquire_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("buffer_pool_acquire_release");
    for size in CHUNK_SIZES {
        let pool = BufferPool::new(size, 64);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("warm", size), &pool, |b, pool| {
            b.iter(|| {
                let buf = pool.acquire();
                pool.release(buf);
            })
        });
    }
    group.finish();
}

fn chunk_queue_put_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunk_queue_put_get");
    let payload = vec![0u8; 4096];
    group.throughput(Throughput::Bytes(payload.len() as u64));
    group.bench_function("single_segment", |b| {
        b.iter(|| {
            let mut q = ChunkQueue::new();
            q.put(bytes::Bytes::copy_from_slice(&payload));
            let _ = q.get(payload.len());
        })
    });
    group.bench_function("many_small_segments", |b| {
        b.iter(|| {
            let mut q = ChunkQueue::new();
            for chunk in payload.chunks(64) {
                q.put(bytes::Bytes::copy_from_slice(chunk));
            }
            let _ = q.get(payload.len());
        })
    });
    group.finish();
}

criterion_group!(benches, acquire_release, chunk_queue_put_get);
criterion_main!(benches);
