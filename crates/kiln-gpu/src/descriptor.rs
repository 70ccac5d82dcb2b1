//! Descriptor storage: persistent heaps and the transient ring.
//!
//! Each heap's index space is split in two: a reserved prefix that the
//! [`TransientDescriptorRing`] sub-allocates per frame, and a persistent
//! suffix managed by a free list. Persistent exhaustion is fatal (the caller
//! sized the heap wrong); transient exhaustion is a recoverable stall handled
//! by the device's flush-and-sync retry loop.

use std::sync::Mutex;

use tracing::warn;

use crate::device::FRAME_RING_SIZE;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DescriptorHeapKind {
    CbvSrvUav,
    Sampler,
    Rtv,
    Dsv,
}

impl DescriptorHeapKind {
    pub fn shader_visible(self) -> bool {
        matches!(self, DescriptorHeapKind::CbvSrvUav | DescriptorHeapKind::Sampler)
    }

    /// Native handle increment for this heap type.
    pub fn descriptor_size(self) -> u32 {
        match self {
            DescriptorHeapKind::CbvSrvUav => 32,
            DescriptorHeapKind::Sampler => 32,
            DescriptorHeapKind::Rtv => 32,
            DescriptorHeapKind::Dsv => 32,
        }
    }

    fn ordinal(self) -> u64 {
        match self {
            DescriptorHeapKind::CbvSrvUav => 0,
            DescriptorHeapKind::Sampler => 1,
            DescriptorHeapKind::Rtv => 2,
            DescriptorHeapKind::Dsv => 3,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CpuDescriptorHandle(pub u64);

/// Null for heaps that are not shader visible.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GpuDescriptorHandle(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DescriptorSlot {
    pub index: u32,
    pub cpu: CpuDescriptorHandle,
    pub gpu: GpuDescriptorHandle,
}

#[derive(Debug)]
struct HeapInner {
    /// High-water mark; starts at the reserved prefix size.
    allocated: u32,
    freed: Vec<u32>,
}

/// Fixed-capacity descriptor pool with free-list reuse. Thread safe; never
/// waits on the GPU.
#[derive(Debug)]
pub struct DescriptorHeap {
    kind: DescriptorHeapKind,
    capacity: u32,
    reserved: u32,
    cpu_base: u64,
    gpu_base: u64,
    inner: Mutex<HeapInner>,
}

impl DescriptorHeap {
    pub fn new(kind: DescriptorHeapKind, capacity: u32, reserved: u32) -> Self {
        debug_assert!(reserved <= capacity);
        let cpu_base = 0x1000_0000 * (kind.ordinal() + 1);
        let gpu_base = if kind.shader_visible() {
            0x8_0000_0000 + kind.ordinal() * 0x1_0000_0000
        } else {
            0
        };
        Self {
            kind,
            capacity,
            reserved,
            cpu_base,
            gpu_base,
            inner: Mutex::new(HeapInner {
                allocated: reserved,
                freed: Vec::new(),
            }),
        }
    }

    pub fn kind(&self) -> DescriptorHeapKind {
        self.kind
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Size of the transient prefix excluded from free-list allocation.
    pub fn reserved(&self) -> u32 {
        self.reserved
    }

    fn slot(&self, index: u32) -> DescriptorSlot {
        let size = self.kind.descriptor_size() as u64;
        DescriptorSlot {
            index,
            cpu: CpuDescriptorHandle(self.cpu_base + index as u64 * size),
            gpu: if self.kind.shader_visible() {
                GpuDescriptorHandle(self.gpu_base + index as u64 * size)
            } else {
                GpuDescriptorHandle(0)
            },
        }
    }

    /// GPU handle for an arbitrary index, including the transient prefix.
    pub fn gpu_handle_at(&self, index: u32) -> GpuDescriptorHandle {
        debug_assert!(index < self.capacity);
        self.slot(index).gpu
    }

    /// `None` means the persistent range is exhausted. That is a sizing bug,
    /// not a transient condition, so it is logged and asserted.
    pub fn allocate(&self) -> Option<DescriptorSlot> {
        let mut inner = self.inner.lock().unwrap();
        let index = match inner.freed.pop() {
            Some(index) => index,
            None => {
                if inner.allocated >= self.capacity {
                    warn!(
                        kind = ?self.kind,
                        capacity = self.capacity,
                        "descriptor heap exhausted"
                    );
                    debug_assert!(false, "descriptor heap {:?} exhausted", self.kind);
                    return None;
                }
                let index = inner.allocated;
                inner.allocated += 1;
                index
            }
        };
        Some(self.slot(index))
    }

    pub fn release(&self, index: u32) {
        let mut inner = self.inner.lock().unwrap();
        debug_assert!(
            index >= self.reserved && index < inner.allocated,
            "releasing descriptor index {} outside the persistent range",
            index
        );
        inner.freed.push(index);
    }

    /// Live persistent descriptor count.
    pub fn live(&self) -> u32 {
        let inner = self.inner.lock().unwrap();
        inner.allocated - self.reserved - inner.freed.len() as u32
    }
}

impl Drop for DescriptorHeap {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        let inner = self.inner.lock().unwrap();
        debug_assert_eq!(
            inner.allocated as usize - inner.freed.len(),
            self.reserved as usize,
            "descriptor heap {:?} dropped with live persistent descriptors",
            self.kind
        );
    }
}

/// Circular sub-allocator over a heap's reserved prefix.
///
/// `frame_barriers` records the head position at the end of each of the last
/// [`FRAME_RING_SIZE`] frames, oldest first; an allocation may not cross a
/// barrier whose frame the GPU has not retired. `sync_age` marks how many of
/// the oldest barriers were force-retired early within the current frame.
/// Single writer; the owning device serializes access.
#[derive(Debug)]
pub struct TransientDescriptorRing {
    capacity: u32,
    head: u32,
    frame_barriers: [u32; FRAME_RING_SIZE],
    sync_age: usize,
}

impl TransientDescriptorRing {
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            head: 0,
            frame_barriers: [0; FRAME_RING_SIZE],
            sync_age: 0,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn head(&self) -> u32 {
        self.head
    }

    pub fn frame_barriers(&self) -> &[u32] {
        &self.frame_barriers
    }

    pub fn sync_age(&self) -> usize {
        self.sync_age
    }

    /// Allocates `size` contiguous slots, returning the base offset, or
    /// `None` when the request would overrun data the GPU may still read.
    /// The caller resolves `None` by flushing and waiting, then retrying.
    pub fn allocate(&mut self, size: u32) -> Option<u32> {
        if size >= self.capacity / 2 {
            debug_assert!(
                false,
                "transient allocation of {} exceeds half the ring ({})",
                size, self.capacity
            );
            return None;
        }

        if self.head + size >= self.capacity {
            // Wrapping jumps over every unretired frame's tail; refuse if any
            // such frame still owns space ahead of us (or never recorded a
            // barrier, which is indistinguishable from owning everything).
            for i in self.sync_age..FRAME_RING_SIZE {
                if self.head < self.frame_barriers[i] || self.frame_barriers[i] == 0 {
                    return None;
                }
            }
            self.head = 0;
        }

        for i in self.sync_age..FRAME_RING_SIZE {
            let barrier = self.frame_barriers[i];
            if self.head < barrier && self.head + size >= barrier {
                return None;
            }
        }

        let offset = self.head;
        self.head += size;
        Some(offset)
    }

    /// Rotates the barrier history at a frame boundary: the oldest barrier
    /// retires, the current head becomes the newest.
    pub fn next_frame(&mut self) {
        for i in 0..FRAME_RING_SIZE - 1 {
            self.frame_barriers[i] = self.frame_barriers[i + 1];
        }
        self.frame_barriers[FRAME_RING_SIZE - 1] = self.head % self.capacity;
        self.sync_age = 0;
    }

    /// Marks one more of the oldest in-flight frames as retired mid-frame.
    pub fn sync_age_increment(&mut self) {
        debug_assert!(self.sync_age < FRAME_RING_SIZE);
        self.sync_age = (self.sync_age + 1).min(FRAME_RING_SIZE);
    }
}
