#[cfg(target_arch = "wasm32")]
fn main() {}

#[cfg(not(target_arch = "wasm32"))]
use std::sync::Arc;
#[cfg(not(target_arch = "wasm32"))]
use std::time::Duration;

#[cfg(not(target_arch = "wasm32"))]
use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
#[cfg(not(target_arch = "wasm32"))]
use kiln_gpu::pipeline::{GraphicsPipelineDesc, LocalPipelineCache, PipelineCache};
#[cfg(not(target_arch = "wasm32"))]
use kiln_gpu::recorder::{GlobalBindings, GraphicsDraw, GraphicsItem, ItemRecorder, RenderOutputs};
#[cfg(not(target_arch = "wasm32"))]
use kiln_gpu::{Device, DeviceOptions, GpuStats, NativeDevice, Shader, ShaderBlob};

#[cfg(not(target_arch = "wasm32"))]
fn criterion_config() -> Criterion {
    match std::env::var("KILN_BENCH_PROFILE").as_deref() {
        Ok("ci") => Criterion::default()
            .warm_up_time(Duration::from_millis(150))
            .measurement_time(Duration::from_millis(400))
            .sample_size(20)
            .noise_threshold(0.05),
        _ => Criterion::default()
            .warm_up_time(Duration::from_secs(1))
            .measurement_time(Duration::from_secs(2))
            .sample_size(50)
            .noise_threshold(0.03),
    }
}

#[cfg(not(target_arch = "wasm32"))]
fn bench_options() -> DeviceOptions {
    DeviceOptions {
        worker_count: 0,
        persistent_descriptor_count: 4096,
        transient_descriptor_count: 65_536,
        sampler_descriptor_count: 64,
        rtv_descriptor_count: 64,
        dsv_descriptor_count: 16,
        ..DeviceOptions::default()
    }
}

#[cfg(not(target_arch = "wasm32"))]
fn draw_items(device: &Device, count: usize) -> Vec<GraphicsItem> {
    let shader = Shader::cooked(Arc::clone(device.shaders()), b"vs-bench");
    (0..count)
        .map(|_| GraphicsItem::new(Arc::clone(&shader), GraphicsDraw::Draw { vertex_count: 3 }))
        .collect()
}

#[cfg(not(target_arch = "wasm32"))]
fn bench_record_frame(c: &mut Criterion) {
    let outputs = RenderOutputs::default();
    let globals = GlobalBindings::default();

    let mut group = c.benchmark_group("record_frame");
    for count in [256usize, 4096] {
        group.throughput(criterion::Throughput::Elements(count as u64));
        // A fresh device per iteration: the simulated queue retains every
        // submitted buffer, so a shared device would grow without bound.
        group.bench_with_input(
            BenchmarkId::new("graphics_items", count),
            &count,
            |b, &count| {
                b.iter_batched(
                    || {
                        let device = Device::new(bench_options()).unwrap();
                        let items = draw_items(&device, count);
                        (device, items)
                    },
                    |(mut device, items)| {
                        device.begin_frame().unwrap();
                        let main = device.main();
                        main.begin_graphics_items(&outputs, &globals).unwrap();
                        for item in &items {
                            main.execute_graphics_item(item);
                        }
                        main.end_items();
                        device.end_frame().unwrap();
                        (device, items)
                    },
                    BatchSize::LargeInput,
                );
            },
        );
    }

    group.throughput(criterion::Throughput::Elements(256));
    group.bench_with_input(
        BenchmarkId::new("single_item_spans", 256),
        &256usize,
        |b, &count| {
            b.iter_batched(
                || {
                    let device = Device::new(bench_options()).unwrap();
                    let items = draw_items(&device, count);
                    (device, items)
                },
                |(mut device, items)| {
                    device.begin_frame().unwrap();
                    for item in &items {
                        device
                            .main()
                            .execute_single_graphics_item(item, &outputs, &globals)
                            .unwrap();
                    }
                    device.end_frame().unwrap();
                    (device, items)
                },
                BatchSize::LargeInput,
            );
        },
    );
    group.finish();
}

#[cfg(not(target_arch = "wasm32"))]
fn bench_pipeline_cache(c: &mut Criterion) {
    let cache = PipelineCache::<GraphicsPipelineDesc>::new();
    let native = NativeDevice::new();
    let stats = GpuStats::new();
    let mut desc = GraphicsPipelineDesc::default();
    desc.vs_id = 7;
    desc.vs_blob = Some(ShaderBlob::from_bytes(b"vs-bench"));

    let mut group = c.benchmark_group("pipeline_cache");

    let mut local = LocalPipelineCache::new();
    cache.find_or_create(&desc, &mut local, &native, &stats, 1);
    group.bench_function("lookaside_hit", |b| {
        b.iter(|| {
            black_box(cache.find_or_create(black_box(&desc), &mut local, &native, &stats, 1))
        });
    });

    // A fresh lookaside per iteration forces the shared-map read path.
    group.bench_function("shared_hit", |b| {
        b.iter_batched(
            LocalPipelineCache::new,
            |mut local| black_box(cache.find_or_create(&desc, &mut local, &native, &stats, 1)),
            BatchSize::LargeInput,
        );
    });
    group.finish();
}

#[cfg(not(target_arch = "wasm32"))]
criterion_group! {
    name = benches;
    config = criterion_config();
    targets = bench_record_frame, bench_pipeline_cache
}
#[cfg(not(target_arch = "wasm32"))]
criterion_main!(benches);
