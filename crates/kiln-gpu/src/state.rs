//! Resource state tracking.
//!
//! Each GPU resource carries a [`ResourceStateTracker`]: the uniform state of
//! the whole resource plus per-subresource overrides for mixed-state
//! resources. Transitions emit barriers only for actual state changes, and a
//! whole-resource transition first collapses any overrides so the native
//! barrier's before-state is truthful for every subresource.

use bitflags::bitflags;

use crate::cmd::{CommandBuffer, NativeCmd};
use crate::resource::{ResourceId, ALL_SUBRESOURCES};

bitflags! {
    /// Native resource states (D3D12 bit assignments).
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct ResourceState: u32 {
        const VERTEX_AND_CONSTANT_BUFFER = 1 << 0;
        const INDEX_BUFFER = 1 << 1;
        const RENDER_TARGET = 1 << 2;
        const UNORDERED_ACCESS = 1 << 3;
        const DEPTH_WRITE = 1 << 4;
        const DEPTH_READ = 1 << 5;
        const NON_PIXEL_SHADER_RESOURCE = 1 << 6;
        const PIXEL_SHADER_RESOURCE = 1 << 7;
        const INDIRECT_ARGUMENT = 1 << 9;
        const COPY_DEST = 1 << 10;
        const COPY_SOURCE = 1 << 11;
        const ACCELERATION_STRUCTURE = 1 << 22;
        const SHADING_RATE_SOURCE = 1 << 24;

        const SHADER_RESOURCE = Self::NON_PIXEL_SHADER_RESOURCE.bits()
            | Self::PIXEL_SHADER_RESOURCE.bits();
    }
}

impl ResourceState {
    /// The common state; also what the native API calls `PRESENT`.
    pub const COMMON: Self = Self::empty();
    pub const PRESENT: Self = Self::empty();
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct SubresourceState {
    index: u32,
    state: ResourceState,
}

/// State machine for one resource.
///
/// Mutation is single-owner by convention: during a batch exactly one
/// recorder transitions a given resource (shared resources go through the
/// deferred queue instead). [`ResourceStateTracker::claim_for_batch`] is the
/// debug-build stamp that checks the convention.
#[derive(Debug)]
pub struct ResourceStateTracker {
    uniform: ResourceState,
    /// Kept small and scanned linearly; entries always differ from `uniform`.
    overrides: Vec<SubresourceState>,
    subresource_count: u32,
    attached: bool,
    claim_epoch: u64,
    claim_owner: u32,
}

impl ResourceStateTracker {
    pub fn new(initial: ResourceState, subresource_count: u32) -> Self {
        debug_assert!(subresource_count >= 1);
        Self {
            uniform: initial,
            overrides: Vec::new(),
            subresource_count,
            attached: true,
            claim_epoch: 0,
            claim_owner: 0,
        }
    }

    /// Detaches the tracker ahead of resource destruction. A resource must
    /// not die while still in a mixed state.
    pub fn detach(&mut self) {
        debug_assert!(self.attached, "tracker detached twice");
        debug_assert!(
            self.overrides.is_empty(),
            "resource destroyed with {} subresource state overrides outstanding",
            self.overrides.len()
        );
        self.attached = false;
    }

    pub fn uniform_state(&self) -> ResourceState {
        self.uniform
    }

    pub fn subresource_state(&self, subresource: u32) -> ResourceState {
        debug_assert!(subresource < self.subresource_count);
        self.overrides
            .iter()
            .find(|o| o.index == subresource)
            .map(|o| o.state)
            .unwrap_or(self.uniform)
    }

    pub fn subresource_count(&self) -> u32 {
        self.subresource_count
    }

    pub fn override_count(&self) -> usize {
        self.overrides.len()
    }

    /// Stamps this tracker as mutated by `owner` within batch `epoch`;
    /// flags two different recorders touching one resource in one batch.
    pub fn claim_for_batch(&mut self, owner: u32, epoch: u64) {
        if self.claim_epoch != epoch {
            self.claim_epoch = epoch;
            self.claim_owner = owner;
        } else {
            debug_assert_eq!(
                self.claim_owner, owner,
                "resource mutated by recorders {} and {} in the same batch",
                self.claim_owner, owner
            );
        }
    }

    /// Transitions toward `target`, emitting barriers for `resource` into
    /// `buf`. Returns the number of barriers emitted.
    pub fn transition(
        &mut self,
        resource: ResourceId,
        target: ResourceState,
        subresource: u32,
        buf: &mut CommandBuffer,
    ) -> usize {
        debug_assert!(self.attached, "transition on a detached tracker");
        let mut emitted = 0;

        if subresource == ALL_SUBRESOURCES {
            if !self.overrides.is_empty() {
                for o in &self.overrides {
                    debug_assert_ne!(o.state, self.uniform);
                    buf.push(NativeCmd::TransitionBarrier {
                        resource,
                        subresource: o.index,
                        before: o.state,
                        after: self.uniform,
                    });
                    emitted += 1;
                }
                self.overrides.clear();
            }
            if self.uniform != target {
                buf.push(NativeCmd::whole_resource_barrier(
                    resource,
                    self.uniform,
                    target,
                ));
                self.uniform = target;
                emitted += 1;
            }
            return emitted;
        }

        debug_assert!(subresource < self.subresource_count);
        match self.overrides.iter().position(|o| o.index == subresource) {
            Some(pos) => {
                let before = self.overrides[pos].state;
                if before != target {
                    buf.push(NativeCmd::TransitionBarrier {
                        resource,
                        subresource,
                        before,
                        after: target,
                    });
                    emitted += 1;
                }
                if target == self.uniform {
                    self.overrides.swap_remove(pos);
                } else {
                    self.overrides[pos].state = target;
                }
            }
            None => {
                if self.uniform != target {
                    buf.push(NativeCmd::TransitionBarrier {
                        resource,
                        subresource,
                        before: self.uniform,
                        after: target,
                    });
                    self.overrides.push(SubresourceState {
                        index: subresource,
                        state: target,
                    });
                    emitted += 1;
                }
            }
        }
        emitted
    }

    /// Reports whether [`ResourceStateTracker::transition`] with the same
    /// arguments would emit at least one barrier.
    pub fn is_transition_required(&self, target: ResourceState, subresource: u32) -> bool {
        if subresource == ALL_SUBRESOURCES {
            return !self.overrides.is_empty() || self.uniform != target;
        }
        debug_assert!(subresource < self.subresource_count);
        self.overrides
            .iter()
            .find(|o| o.index == subresource)
            .map(|o| o.state != target)
            .unwrap_or(self.uniform != target)
    }

    /// Records a state change that happened outside this recorder's command
    /// stream (no barrier emitted). Whole-resource only: the one resource
    /// class that needs subresource adoption has a single legal state.
    pub fn adopt_state(&mut self, target: ResourceState, subresource: u32) {
        debug_assert!(self.attached);
        if subresource != ALL_SUBRESOURCES {
            debug_assert!(false, "per-subresource state adoption is not supported");
            return;
        }
        debug_assert!(
            self.overrides.is_empty(),
            "adopting a uniform state over subresource overrides"
        );
        self.overrides.clear();
        self.uniform = target;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RES: ResourceId = ResourceId(7);

    fn open_buf() -> CommandBuffer {
        let mut buf = CommandBuffer::new();
        buf.reset();
        buf
    }

    #[test]
    fn idempotent_transition_emits_nothing() {
        let mut buf = open_buf();
        let mut tracker = ResourceStateTracker::new(ResourceState::COPY_DEST, 1);

        let n = tracker.transition(RES, ResourceState::COPY_DEST, ALL_SUBRESOURCES, &mut buf);
        assert_eq!(n, 0);
        assert!(buf.is_empty());
        assert!(!tracker.is_transition_required(ResourceState::COPY_DEST, ALL_SUBRESOURCES));
    }

    #[test]
    fn whole_resource_transition_emits_one_barrier() {
        let mut buf = open_buf();
        let mut tracker = ResourceStateTracker::new(ResourceState::COMMON, 4);

        let n = tracker.transition(RES, ResourceState::RENDER_TARGET, ALL_SUBRESOURCES, &mut buf);
        assert_eq!(n, 1);
        assert_eq!(
            buf.commands(),
            &[NativeCmd::whole_resource_barrier(
                RES,
                ResourceState::COMMON,
                ResourceState::RENDER_TARGET
            )]
        );
        assert_eq!(tracker.uniform_state(), ResourceState::RENDER_TARGET);
    }

    #[test]
    fn subresource_overrides_collapse_on_whole_resource_transition() {
        let mut buf = open_buf();
        let uniform = ResourceState::SHADER_RESOURCE;
        let target = ResourceState::RENDER_TARGET;
        let mut tracker = ResourceStateTracker::new(uniform, 4);

        for sub in 0..3 {
            tracker.transition(RES, target, sub, &mut buf);
        }
        assert_eq!(tracker.override_count(), 3);
        assert_eq!(tracker.subresource_state(3), uniform);

        buf.reset();
        tracker.transition(RES, target, ALL_SUBRESOURCES, &mut buf);

        assert_eq!(tracker.override_count(), 0);
        assert_eq!(tracker.uniform_state(), target);
        // Three collapse barriers back to the uniform state, then one
        // whole-resource barrier to the target.
        assert_eq!(buf.len(), 4);
        assert_eq!(
            buf.commands().last(),
            Some(&NativeCmd::whole_resource_barrier(RES, uniform, target))
        );
    }

    #[test]
    fn override_returning_to_uniform_state_is_dropped() {
        let mut buf = open_buf();
        let uniform = ResourceState::SHADER_RESOURCE;
        let mut tracker = ResourceStateTracker::new(uniform, 2);

        tracker.transition(RES, ResourceState::COPY_SOURCE, 1, &mut buf);
        assert_eq!(tracker.override_count(), 1);

        tracker.transition(RES, uniform, 1, &mut buf);
        assert_eq!(tracker.override_count(), 0);
        assert_eq!(tracker.subresource_state(1), uniform);
    }

    #[test]
    fn subresource_transition_to_current_uniform_is_a_no_op() {
        let mut buf = open_buf();
        let uniform = ResourceState::SHADER_RESOURCE;
        let mut tracker = ResourceStateTracker::new(uniform, 2);

        let n = tracker.transition(RES, uniform, 0, &mut buf);
        assert_eq!(n, 0);
        assert_eq!(tracker.override_count(), 0);
    }

    #[test]
    fn is_transition_required_mirrors_transition() {
        let mut buf = open_buf();
        let mut tracker = ResourceStateTracker::new(ResourceState::SHADER_RESOURCE, 4);

        assert!(!tracker.is_transition_required(ResourceState::SHADER_RESOURCE, 2));
        assert!(tracker.is_transition_required(ResourceState::COPY_DEST, 2));

        tracker.transition(RES, ResourceState::COPY_DEST, 2, &mut buf);
        assert!(!tracker.is_transition_required(ResourceState::COPY_DEST, 2));
        // Any outstanding override forces work on a whole-resource pass.
        assert!(tracker.is_transition_required(ResourceState::SHADER_RESOURCE, ALL_SUBRESOURCES));
    }

    #[test]
    fn adopted_state_emits_no_barrier() {
        let mut buf = open_buf();
        let mut tracker = ResourceStateTracker::new(ResourceState::COMMON, 1);

        tracker.adopt_state(ResourceState::COPY_DEST, ALL_SUBRESOURCES);
        assert!(buf.is_empty());
        assert_eq!(tracker.uniform_state(), ResourceState::COPY_DEST);

        let n = tracker.transition(RES, ResourceState::COPY_DEST, ALL_SUBRESOURCES, &mut buf);
        assert_eq!(n, 0);
    }

    #[test]
    fn claim_allows_one_owner_per_epoch() {
        let mut tracker = ResourceStateTracker::new(ResourceState::COMMON, 1);
        tracker.claim_for_batch(2, 10);
        tracker.claim_for_batch(2, 10);
        // A new batch epoch transfers ownership freely.
        tracker.claim_for_batch(5, 11);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "same batch")]
    fn claim_rejects_two_owners_in_one_epoch() {
        let mut tracker = ResourceStateTracker::new(ResourceState::COMMON, 1);
        tracker.claim_for_batch(1, 10);
        tracker.claim_for_batch(2, 10);
    }
}
