//! # Submission tracking
//!
//! A [SubmitId] names one submitted command buffer without holding on to it. The buffer itself may be recycled for
//! other work long before anyone asks about the id again, so completion is answered from the queue's ring: everything
//! behind the ring's tail is retired, and a slot that was recycled since is retired as well.

use ash::vk;

use crate::{
    backend::Backend,
    command::{CmdRing, SlotState},
    context::Context,
    error::GfxError,
    lock,
    queue::QueueId,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubmitId {
    ///Ring position counter of the queue.
    pub counter: u32,
    pub queue: QueueId,
    pub valid: bool,
}

impl SubmitId {
    ///Names no submission. Always reported as retired.
    pub const INVALID: SubmitId = SubmitId {
        counter: 0,
        queue: QueueId::Graphics,
        valid: false,
    };

    ///True if both ids are valid, on the same queue, and `self` was issued before `other`.
    pub fn is_before(&self, other: &SubmitId) -> bool {
        self.valid && other.valid && self.queue == other.queue && before(self.counter, other.counter)
    }
}

impl Default for SubmitId {
    fn default() -> Self {
        SubmitId::INVALID
    }
}

///Wrapping "a < b" on ring counters.
pub(crate) fn before(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

fn wait_retired(backend: &dyn Backend, fence: vk::Fence) -> Result<(), GfxError> {
    match backend.wait_fence(fence) {
        //nothing runs on a lost device anymore
        Ok(()) | Err(vk::Result::ERROR_DEVICE_LOST) => Ok(()),
        Err(e) => Err(GfxError::from_native(e)),
    }
}

impl CmdRing {
    ///Advances the tail over retired slots, up to and including `until`. Blocks on pending fences if `block` is set.
    /// Stops at the first slot that is still being recorded, since ring order has to be kept.
    pub(crate) fn sweep(
        &mut self,
        backend: &dyn Backend,
        until: u32,
        block: bool,
    ) -> Result<(), GfxError> {
        while before(self.tail, self.head) && !before(until, self.tail) {
            let index = self.index_of(self.tail);
            let slot = &mut self.slots[index];
            if slot.state != SlotState::Pending {
                break;
            }
            if !backend.fence_status(slot.fence).is_retired() {
                if !block {
                    break;
                }
                wait_retired(backend, slot.fence)?;
            }
            slot.recycle(backend)?;
            self.tail = self.tail.wrapping_add(1);
        }
        Ok(())
    }

    ///Blocks on every submitted slot up to and including `until`, in ring order, then advances the tail.
    pub(crate) fn wait_until(&mut self, backend: &dyn Backend, until: u32) -> Result<(), GfxError> {
        let mut counter = self.tail;
        while before(counter, self.head) && !before(until, counter) {
            let slot = &self.slots[self.index_of(counter)];
            if slot.state == SlotState::Pending && slot.id == counter {
                wait_retired(backend, slot.fence)?;
            }
            counter = counter.wrapping_add(1);
        }
        self.sweep(backend, until, false)
    }

    pub(crate) fn is_retired(&self, backend: &dyn Backend, counter: u32) -> bool {
        if !before(counter, self.head) {
            //not handed out yet
            return false;
        }
        //anything a full ring behind the head was recycled already
        if before(counter, self.tail) || self.head.wrapping_sub(counter) > self.size() {
            return true;
        }
        let slot = &self.slots[self.index_of(counter)];
        slot.id != counter
            || (slot.state == SlotState::Pending && backend.fence_status(slot.fence).is_retired())
    }

    fn is_recording(&self, counter: u32) -> bool {
        let slot = &self.slots[self.index_of(counter)];
        slot.id == counter && slot.state == SlotState::Recording
    }
}

impl Context {
    ///Non-blocking completion check. Retires (and recycles) finished ring slots on the way.
    pub fn poll(&self, id: SubmitId) -> Result<bool, GfxError> {
        if !id.valid {
            return Ok(true);
        }
        let mut ring = lock(&self.queue(id.queue).ring);
        ring.sweep(self.backend(), id.counter, false)?;
        Ok(ring.is_retired(self.backend(), id.counter))
    }

    ///Blocks until `id` finished executing. Waiting on a buffer that was never submitted is a contract violation.
    pub fn wait(&self, id: SubmitId) -> Result<(), GfxError> {
        if !id.valid {
            return Ok(());
        }
        #[cfg(feature = "profiling")]
        puffin::profile_function!();

        let mut ring = lock(&self.queue(id.queue).ring);
        assert!(
            !ring.is_recording(id.counter),
            "waiting on command buffer {} of {} that was never submitted",
            id.counter,
            id.queue
        );
        ring.wait_until(self.backend(), id.counter)
    }

    ///Blocks until every submission on every queue finished. Buffers that are still being recorded are skipped.
    pub fn wait_all(&self) -> Result<(), GfxError> {
        #[cfg(feature = "profiling")]
        puffin::profile_function!();

        for queue in self.queues() {
            let mut ring = lock(&queue.ring);
            let newest = ring.head.wrapping_sub(1);
            ring.wait_until(self.backend(), newest)?;
        }
        Ok(())
    }
}
