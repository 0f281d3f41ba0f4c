//! Benchmarks for per-launch overhead of the execution engine

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use hetbatch::prelude::*;
use std::sync::Arc;

fn driver() -> Arc<dyn Driver> {
    Arc::new(HostDriver::new(vec![HostPlatformConfig::new("bench")
        .with_device(HostDeviceConfig::gpu("gpu0"))
        .with_device(HostDeviceConfig::cpu("cpu0"))]))
}

fn noop_kernels(runtime: &Runtime) -> hetbatch::KernelMap {
    let kernel: Arc<dyn Kernel> = Arc::new(HostKernel::new("noop", |group| {
        black_box(group.group_id());
        Ok(())
    }));
    runtime.compile_kernels(|_| Ok(Arc::clone(&kernel))).unwrap()
}

fn bench_empty_launch(c: &mut Criterion) {
    let runtime = Runtime::new(driver(), RuntimeConfig::build_default()).unwrap();
    let kernels = noop_kernels(&runtime);
    let args = Arc::new(KernelArguments::new());

    c.bench_function("empty_launch", |b| {
        b.iter(|| {
            runtime
                .run(&kernels, Arc::clone(&args), black_box(1))
                .unwrap()
        });
    });
}

fn bench_memory_policies(c: &mut Criterion) {
    let mut group = c.benchmark_group("bind_and_launch");

    for (name, policy) in [
        ("copy", MemoryPolicy::AlwaysCopy),
        ("host_ptr", MemoryPolicy::AlwaysUseHostPtr),
    ] {
        let config = RuntimeConfig::builder()
            .memory_policy(policy)
            .balancer(BalancerPolicy::Even)
            .build()
            .unwrap();
        let runtime = Runtime::new(driver(), config).unwrap();
        let kernels = noop_kernels(&runtime);

        for n in [256usize, 4096] {
            let args = Arc::new(
                KernelArguments::new()
                    .with("x", InputBuffer::new(HostArray::zeros(DType::F64, vec![n, 16])))
                    .unwrap()
                    .with("y", OutputBuffer::new(DType::F64, vec![n]))
                    .unwrap(),
            );
            group.bench_with_input(BenchmarkId::new(name, n), &n, |b, &n| {
                b.iter(|| runtime.run(&kernels, Arc::clone(&args), n).unwrap());
            });
        }
    }

    group.finish();
}

criterion_group!(benches, bench_empty_launch, bench_memory_policies);
criterion_main!(benches);
