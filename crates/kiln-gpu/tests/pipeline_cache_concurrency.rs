//! The shared pipeline cache under thread contention: many recorders racing
//! on the same description must produce exactly one driver build.

use std::sync::Arc;
use std::thread;

use kiln_gpu::pipeline::{GraphicsPipelineDesc, LocalPipelineCache, PipelineCache};
use kiln_gpu::{GpuStats, NativeDevice, ShaderBlob};

fn vertex_only_desc(vs_id: i64, blob: &ShaderBlob) -> GraphicsPipelineDesc {
    let mut desc = GraphicsPipelineDesc::default();
    desc.vs_id = vs_id;
    desc.vs_blob = Some(blob.clone());
    desc
}

#[test]
fn racing_threads_share_one_build() {
    let cache = Arc::new(PipelineCache::<GraphicsPipelineDesc>::new());
    let native = Arc::new(NativeDevice::new());
    let stats = Arc::new(GpuStats::new());
    let blob = ShaderBlob::from_bytes(b"vs-contended");

    let mut handles = Vec::new();
    for _ in 0..8 {
        let cache = Arc::clone(&cache);
        let native = Arc::clone(&native);
        let stats = Arc::clone(&stats);
        let desc = vertex_only_desc(42, &blob);
        handles.push(thread::spawn(move || {
            // Each thread models one recorder with its own lookaside.
            let mut local = LocalPipelineCache::new();
            let entry = cache.find_or_create(&desc, &mut local, &native, &stats, 1);
            let again = cache.find_or_create(&desc, &mut local, &native, &stats, 1);
            assert!(Arc::ptr_eq(&entry, &again));
            entry
        }));
    }
    let entries: Vec<_> = handles
        .into_iter()
        .map(|handle| handle.join().expect("lookup thread panicked"))
        .collect();

    assert_eq!(native.pipeline_build_count(), 1);
    assert_eq!(cache.entry_count(), 1);
    for entry in &entries {
        assert!(Arc::ptr_eq(&entries[0], entry));
        assert!(entry.is_resolved());
        assert!(entry.pipeline().is_some());
    }

    let snap = stats.snapshot();
    // Which threads hit the read path and which lose the insert race depends
    // on timing; only the repeat lookups are deterministic.
    assert!(snap.pso_cache_misses >= 1);
    assert_eq!(snap.pso_local_cache_hits, 8);
    assert_eq!(snap.pso_builds_failed, 0);
}

#[test]
fn distinct_descriptions_build_independently() {
    let cache = Arc::new(PipelineCache::<GraphicsPipelineDesc>::new());
    let native = Arc::new(NativeDevice::new());
    let stats = Arc::new(GpuStats::new());
    let blob = ShaderBlob::from_bytes(b"vs-distinct");

    let mut handles = Vec::new();
    for vs_id in 1..=4 {
        let cache = Arc::clone(&cache);
        let native = Arc::clone(&native);
        let stats = Arc::clone(&stats);
        let desc = vertex_only_desc(vs_id, &blob);
        handles.push(thread::spawn(move || {
            let mut local = LocalPipelineCache::new();
            cache.find_or_create(&desc, &mut local, &native, &stats, 1)
        }));
    }
    let entries: Vec<_> = handles
        .into_iter()
        .map(|handle| handle.join().expect("lookup thread panicked"))
        .collect();

    assert_eq!(native.pipeline_build_count(), 4);
    assert_eq!(cache.entry_count(), 4);
    for (i, a) in entries.iter().enumerate() {
        assert!(a.pipeline().is_some());
        for b in &entries[i + 1..] {
            let (a, b) = (a.pipeline().unwrap(), b.pipeline().unwrap());
            assert_ne!(a.id, b.id);
        }
    }
    assert_eq!(stats.snapshot().pso_cache_misses, 4);
}

#[test]
fn failed_build_is_shared_across_threads() {
    let cache = Arc::new(PipelineCache::<GraphicsPipelineDesc>::new());
    let native = Arc::new(NativeDevice::new());
    let stats = Arc::new(GpuStats::new());
    let blob = ShaderBlob::invalid();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let cache = Arc::clone(&cache);
        let native = Arc::clone(&native);
        let stats = Arc::clone(&stats);
        let desc = vertex_only_desc(7, &blob);
        handles.push(thread::spawn(move || {
            let mut local = LocalPipelineCache::new();
            cache.find_or_create(&desc, &mut local, &native, &stats, 1)
        }));
    }
    for handle in handles {
        let entry = handle.join().expect("lookup thread panicked");
        assert!(entry.is_failed());
        assert!(entry.pipeline().is_none());
    }

    // The rejection is permanent and the description was offered to the
    // driver exactly once.
    assert_eq!(native.pipeline_build_count(), 1);
    assert_eq!(stats.snapshot().pso_builds_failed, 1);
}
