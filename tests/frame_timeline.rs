use std::sync::{Arc, Mutex};

use kiln_gpu::cmd::NativeCmd;
use kiln_gpu::recorder::{ComputeItem, GlobalBindings, GraphicsDraw, GraphicsItem, RenderOutputs};
use kiln_gpu::{
    Device, DeviceOptions, Format, GpuStatsSnapshot, QueueEvent, ResourceDesc, Shader,
};
use pretty_assertions::assert_eq;

fn submitted_buffers(device: &Device) -> Vec<Vec<NativeCmd>> {
    device
        .native()
        .events()
        .into_iter()
        .filter_map(|event| match event {
            QueueEvent::Submit { buffers, .. } => Some(buffers),
            _ => None,
        })
        .flatten()
        .collect()
}

#[test]
fn three_frames_produce_exact_counters() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .try_init();

    let mut device = Device::new(DeviceOptions::default()).expect("options are valid");
    let target = device
        .create_resource(ResourceDesc::texture(Format::R8G8B8A8Unorm, 1).with_render_target())
        .unwrap();
    let constants = device.create_resource(ResourceDesc::buffer(256)).unwrap();

    let shader = Shader::cooked(Arc::clone(device.shaders()), b"vs-frame");
    let item = GraphicsItem::new(shader, GraphicsDraw::Draw { vertex_count: 3 });
    let mut outputs = RenderOutputs::default();
    outputs.render_targets.push(Arc::clone(&target));
    let mut globals = GlobalBindings::default();
    globals.constant_buffers.push(Arc::clone(&constants));

    for _ in 0..3 {
        device.begin_frame().unwrap();
        let flags = device
            .main()
            .execute_single_graphics_item(&item, &outputs, &globals)
            .unwrap();
        assert!(flags.is_empty());
        device.end_frame().unwrap();
    }

    // Both resources transition once, the pipeline builds once and is a
    // shared-cache hit afterwards (the per-frame lookaside is cleared at each
    // frame end), and only the third frame has to wait on its flip slot.
    assert_eq!(
        device.stats().snapshot(),
        GpuStatsSnapshot {
            frames: 3,
            submissions: 3,
            flushes: 0,
            sync_waits: 1,
            barriers: 2,
            deferred_transitions: 0,
            deferred_coalesced: 0,
            graphics_items: 3,
            compute_items: 0,
            raytrace_items: 0,
            pso_cache_hits: 2,
            pso_local_cache_hits: 0,
            pso_cache_misses: 1,
            pso_builds_failed: 0,
            pso_evictions: 0,
            transient_stalls: 0,
        }
    );

    let mut signals = Vec::new();
    let mut waits = Vec::new();
    for event in device.native().events() {
        match event {
            QueueEvent::Signal { value } => signals.push(value),
            QueueEvent::Wait { value } => waits.push(value),
            QueueEvent::Submit { buffers, .. } => assert_eq!(buffers.len(), 1),
        }
    }
    assert_eq!(signals, [1, 2, 3]);
    assert_eq!(waits, [1]);
}

#[test]
fn frame_done_callbacks_wait_out_the_ring() {
    let mut device = Device::new(DeviceOptions::default()).expect("options are valid");
    let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    let schedule = |device: &Device, label: &'static str| {
        let log = Arc::clone(&log);
        device.execute_after_gpu_frame_done(move |_| log.lock().unwrap().push(label));
    };

    device.begin_frame().unwrap();
    schedule(&device, "first");
    device.end_frame().unwrap();

    device.begin_frame().unwrap();
    assert!(log.lock().unwrap().is_empty());
    schedule(&device, "second");
    device.end_frame().unwrap();

    // A slot is reused two begins after it was filled, once its fence has
    // been waited out.
    device.begin_frame().unwrap();
    assert_eq!(*log.lock().unwrap(), ["first"]);
    device.end_frame().unwrap();

    device.begin_frame().unwrap();
    assert_eq!(*log.lock().unwrap(), ["first", "second"]);
    schedule(&device, "third");
    device.end_frame().unwrap();

    // A full sync drains every slot without waiting for more begins.
    device.sync_gpu(true);
    assert_eq!(*log.lock().unwrap(), ["first", "second", "third"]);
}

#[test]
fn transient_windows_cycle_through_the_ring_without_stalling() {
    let mut device = Device::new(DeviceOptions {
        transient_descriptor_count: 128,
        ..DeviceOptions::default()
    })
    .expect("options are valid");

    let shader = Shader::cooked(Arc::clone(device.shaders()), b"cs-frame");
    let item = ComputeItem::new(shader, 8, 8, 1);
    let globals = GlobalBindings::default();

    for _ in 0..6 {
        device.begin_frame().unwrap();
        device
            .main()
            .execute_single_compute_item(&item, &globals)
            .unwrap();
        device.end_frame().unwrap();
    }

    let snapshot = device.stats().snapshot();
    assert_eq!(snapshot.compute_items, 6);
    assert_eq!(snapshot.transient_stalls, 0);

    // One window per frame walks the ring and wraps back to the start once
    // the frame that owned the head of the ring has retired.
    let bases: Vec<u32> = submitted_buffers(&device)
        .into_iter()
        .flatten()
        .filter_map(|cmd| match cmd {
            NativeCmd::SetDescriptorTable { base_offset, .. } => Some(base_offset),
            _ => None,
        })
        .collect();
    assert_eq!(bases, [0, 32, 64, 0, 32, 64]);
}
