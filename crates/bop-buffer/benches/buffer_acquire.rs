use bop_buffer::{BufferManager, LocalBufferPoolConfig};
use criterion::{Criterion, black_box, criterion_group, criterion_main};

fn bench_manager_acquire_release(c: &mut Criterion) {
    let manager = BufferManager::with_capacity(4096, 1024).unwrap();
    c.bench_function("manager_acquire_release", |b| {
        b.iter(|| {
            let buffer = manager.get_buffer_no_blocking().unwrap();
            black_box(buffer.buffer_size());
        });
    });
}

fn bench_local_pool_acquire_release(c: &mut Criterion) {
    let manager = BufferManager::with_capacity(4096, 1024).unwrap();
    let pool = manager
        .create_local_buffer_pool(LocalBufferPoolConfig::default())
        .unwrap();
    c.bench_function("local_pool_acquire_release", |b| {
        b.iter(|| {
            let buffer = pool.get_buffer_no_blocking().unwrap();
            black_box(buffer.buffer_size());
        });
    });
}

fn bench_clone_drop(c: &mut Criterion) {
    let manager = BufferManager::with_capacity(4096, 16).unwrap();
    let buffer = manager.get_buffer_blocking().unwrap();
    c.bench_function("tuple_buffer_clone_drop", |b| {
        b.iter(|| {
            let copy = black_box(buffer.clone());
            drop(copy);
        });
    });
}

criterion_group!(
    benches,
    bench_manager_acquire_release,
    bench_local_pool_acquire_release,
    bench_clone_drop
);
criterion_main!(benches);
