//! Native device model: submission queue, fence, pipeline builds.
//!
//! This is the boundary the rest of the crate records against. Submissions
//! are kept as an ordered log and completion is advanced explicitly, so every
//! ordering and lifetime rule upstream can be checked deterministically on
//! any host. Pipeline "builds" are CPU-side: a build fails iff any referenced
//! shader blob is flagged invalid, which is how tests model driver-side
//! compilation failure.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use crate::cmd::{NativeCmd, PipelineId};
use crate::shader::ShaderBlob;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PipelineKind {
    Graphics,
    Compute,
    Raytrace,
}

/// A built native pipeline object.
///
/// `incomplete` is only meaningful for raytrace pipelines: the object exists
/// but its shader tables are still being generated, so dispatches recorded
/// against it must be treated as provisional.
#[derive(Clone, Debug, PartialEq)]
pub struct NativePipeline {
    pub id: PipelineId,
    pub kind: PipelineKind,
    pub incomplete: bool,
}

/// One entry of the native queue log.
#[derive(Clone, Debug, PartialEq)]
pub enum QueueEvent {
    /// One `ExecuteCommandLists`-style call: the buffers run in order, as a
    /// single scheduling unit.
    Submit {
        seq: u64,
        buffers: Vec<Vec<NativeCmd>>,
    },
    Signal {
        value: u64,
    },
    Wait {
        value: u64,
    },
}

#[derive(Debug, Default)]
struct QueueState {
    events: Vec<QueueEvent>,
    next_seq: u64,
    last_signaled: u64,
    completed: u64,
}

#[derive(Debug)]
pub struct NativeDevice {
    queue: Mutex<QueueState>,
    removed: AtomicBool,
    next_pipeline_id: AtomicU64,
    pipeline_builds: AtomicU64,
}

impl NativeDevice {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(QueueState::default()),
            removed: AtomicBool::new(false),
            next_pipeline_id: AtomicU64::new(1),
            pipeline_builds: AtomicU64::new(0),
        }
    }

    /// Executes a group of closed command buffers as one ordered submission.
    /// Returns the submission sequence number.
    pub fn submit(&self, buffers: Vec<Vec<NativeCmd>>) -> u64 {
        let mut q = self.queue.lock().unwrap();
        let seq = q.next_seq;
        q.next_seq += 1;
        q.events.push(QueueEvent::Submit { seq, buffers });
        seq
    }

    /// Queues a fence signal after all prior submissions.
    pub fn signal(&self, value: u64) {
        let mut q = self.queue.lock().unwrap();
        debug_assert!(
            value > q.last_signaled,
            "fence signals must be monotonically increasing ({} after {})",
            value,
            q.last_signaled
        );
        q.last_signaled = value;
        q.events.push(QueueEvent::Signal { value });
    }

    /// Blocks until the fence reaches `value`. In this model the GPU always
    /// makes progress, so the wait retires everything up to the signal.
    pub fn wait(&self, value: u64) {
        let mut q = self.queue.lock().unwrap();
        debug_assert!(
            value <= q.last_signaled,
            "waiting on fence value {} that was never signaled (last {})",
            value,
            q.last_signaled
        );
        q.events.push(QueueEvent::Wait { value });
        q.completed = q.completed.max(value);
    }

    /// Highest fence value the GPU has retired.
    pub fn completed_value(&self) -> u64 {
        self.queue.lock().unwrap().completed
    }

    pub fn last_signaled_value(&self) -> u64 {
        self.queue.lock().unwrap().last_signaled
    }

    /// Advances completion out-of-band, as a polled fence would.
    pub fn complete_to(&self, value: u64) {
        let mut q = self.queue.lock().unwrap();
        let value = value.min(q.last_signaled);
        q.completed = q.completed.max(value);
    }

    pub fn submit_count(&self) -> u64 {
        self.queue.lock().unwrap().next_seq
    }

    /// Snapshot of the queue log. Intended for tests and diagnostics.
    pub fn events(&self) -> Vec<QueueEvent> {
        self.queue.lock().unwrap().events.clone()
    }

    /// Builds a pipeline from the referenced shader blobs. Returns `None` if
    /// any blob is invalid, mirroring a failed driver-side compilation.
    pub fn build_pipeline(
        &self,
        kind: PipelineKind,
        blobs: &[&ShaderBlob],
    ) -> Option<NativePipeline> {
        self.pipeline_builds.fetch_add(1, Ordering::Relaxed);
        if blobs.iter().any(|b| !b.is_valid()) {
            return None;
        }
        let id = PipelineId(self.next_pipeline_id.fetch_add(1, Ordering::Relaxed));
        let incomplete =
            kind == PipelineKind::Raytrace && blobs.iter().any(|b| b.tables_pending());
        Some(NativePipeline {
            id,
            kind,
            incomplete,
        })
    }

    /// Number of pipeline build attempts (including failed ones).
    pub fn pipeline_build_count(&self) -> u64 {
        self.pipeline_builds.load(Ordering::Relaxed)
    }

    /// Latches the device into the removed state, as a TDR would.
    pub fn simulate_removal(&self) {
        self.removed.store(true, Ordering::Release);
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }
}

impl Default for NativeDevice {
    fn default() -> Self {
        Self::new()
    }
}
