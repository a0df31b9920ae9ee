// Criterion benchmarks comparing the reference interpreter with both JIT backends on a tight
// counted loop. The native bench only runs where generated code can execute.

#[cfg(target_arch = "wasm32")]
fn main() {}

#[cfg(not(target_arch = "wasm32"))]
use std::time::Duration;

#[cfg(not(target_arch = "wasm32"))]
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
#[cfg(not(target_arch = "wasm32"))]
use duet_cpu_core::duet_types::Arch;
#[cfg(not(target_arch = "wasm32"))]
use duet_cpu_core::{ArmCpu, FlatMemory, Interpreter};
#[cfg(not(target_arch = "wasm32"))]
use duet_jit::{native, BackendKind, JitConfig, JitCpu};

#[cfg(not(target_arch = "wasm32"))]
const CYCLES: u64 = 100_000;

#[cfg(not(target_arch = "wasm32"))]
const LOOP: [u32; 5] = [
    0xE3A0_0000, // mov r0, #0
    0xE3E0_1000, // mvn r1, #0
    0xE080_0001, // loop: add r0, r0, r1
    0xE251_1001, // subs r1, r1, #1
    0x1AFF_FFFC, // bne loop
];

#[cfg(not(target_arch = "wasm32"))]
fn criterion_config() -> Criterion {
    // Opt into longer runs with `DUET_BENCH_PROFILE=full`.
    match std::env::var("DUET_BENCH_PROFILE").as_deref() {
        Ok("full") => Criterion::default()
            .warm_up_time(Duration::from_secs(1))
            .measurement_time(Duration::from_secs(2))
            .sample_size(50)
            .noise_threshold(0.03),
        _ => Criterion::default()
            .warm_up_time(Duration::from_millis(150))
            .measurement_time(Duration::from_millis(400))
            .sample_size(20)
            .noise_threshold(0.05),
    }
}

#[cfg(not(target_arch = "wasm32"))]
fn memory() -> FlatMemory {
    let mut mem = FlatMemory::new(0x1000);
    mem.load_words(0, &LOOP);
    mem
}

#[cfg(not(target_arch = "wasm32"))]
fn bench_counted_loop(c: &mut Criterion) {
    let mut group = c.benchmark_group("counted_loop");
    group.throughput(Throughput::Elements(CYCLES));

    let mut interpreter = Interpreter::new(Arch::V5, memory());
    group.bench_function("interpreter", |b| {
        b.iter(|| {
            interpreter.run(black_box(CYCLES));
            black_box(interpreter.gpr(0))
        })
    });

    let mut ir = JitCpu::new(Arch::V5, memory());
    group.bench_function("ir_interpreter", |b| {
        b.iter(|| {
            ir.run(black_box(CYCLES));
            black_box(ir.gpr(0))
        })
    });

    if native::HOST_SUPPORTED {
        let config = JitConfig {
            backend: BackendKind::Native,
            ..JitConfig::default()
        };
        let mut jit = JitCpu::with_config(Arch::V5, memory(), config);
        group.bench_function("native", |b| {
            b.iter(|| {
                jit.run(black_box(CYCLES));
                black_box(jit.gpr(0))
            })
        });
    }

    group.finish();
}

#[cfg(not(target_arch = "wasm32"))]
criterion_group! {
    name = benches;
    config = criterion_config();
    targets = bench_counted_loop
}
#[cfg(not(target_arch = "wasm32"))]
criterion_main!(benches);
