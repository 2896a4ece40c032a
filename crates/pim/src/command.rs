//! # Command recording
//!
//! Every [Queue](crate::queue::Queue) owns a ring of command buffers. Each ring slot has its own command pool, a
//! fence that is signaled once the slot's submission finished, and one binary semaphore per possible destination
//! queue, which is signaled whenever the slot releases resources to that queue.
//!
//! Recording threads never share an open command buffer. [Context::cmd_get] hands every `(queue, thread)` pair its own
//! "current" buffer, acquiring a fresh ring slot lazily on first use. If the ring is exhausted, acquiring blocks until
//! the oldest submission retired, and panics if the oldest slot was never submitted.

use ash::vk;
use smallvec::SmallVec;

use crate::{
    backend::{Backend, SemaphoreWait, Submission},
    context::Context,
    error::GfxError,
    lock,
    queue::{QueueId, QueueMask},
    submit::SubmitId,
};

///Transient recording unit. Copies are handed out by [Context::cmd_get], the authoritative state lives in the queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CmdBuf {
    pub handle: vk::CommandBuffer,
    pub fence: vk::Fence,
    ///Submission counter this buffer will be submitted as.
    pub id: u32,
    pub queue: QueueId,
    ///Index into the queue's ring.
    pub slot: u32,
    pub began: bool,
    pub ended: bool,
    pub submitted: bool,
    ///Released ownership of at least one resource to another queue.
    pub xfer_src: bool,
    ///Acquired ownership of at least one resource from another queue.
    pub xfer_dst: bool,
    ///Queues this buffer released resources to.
    pub xfer_targets: QueueMask,
    ///Recording thread.
    pub thread: u32,
}

impl Default for CmdBuf {
    fn default() -> Self {
        CmdBuf {
            handle: vk::CommandBuffer::null(),
            fence: vk::Fence::null(),
            id: 0,
            queue: QueueId::Graphics,
            slot: 0,
            began: false,
            ended: false,
            submitted: false,
            xfer_src: false,
            xfer_dst: false,
            xfer_targets: QueueMask::EMPTY,
            thread: 0,
        }
    }
}

impl CmdBuf {
    pub fn is_open(&self) -> bool {
        self.handle != vk::CommandBuffer::null() && self.began && !self.ended
    }

    ///Id the buffer is (or will be) submitted as.
    pub fn submit_id(&self) -> SubmitId {
        if self.handle == vk::CommandBuffer::null() {
            SubmitId::INVALID
        } else {
            SubmitId {
                counter: self.id,
                queue: self.queue,
                valid: true,
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SlotState {
    Free,
    Recording,
    Pending,
}

pub(crate) struct CmdSlot {
    pub(crate) pool: vk::CommandPool,
    pub(crate) cmd: vk::CommandBuffer,
    pub(crate) fence: vk::Fence,
    pub(crate) id: u32,
    pub(crate) state: SlotState,
    ///Signaled on submission for every destination queue of an ownership transfer.
    pub(crate) signals: [vk::Semaphore; QueueId::COUNT],
}

pub(crate) struct CmdRing {
    pub(crate) slots: Vec<CmdSlot>,
    ///Next counter to hand out.
    pub(crate) head: u32,
    ///Oldest counter that is not known to be retired.
    pub(crate) tail: u32,
}

impl CmdRing {
    pub(crate) fn new(backend: &dyn Backend, family: u32, size: u32) -> Result<Self, GfxError> {
        assert!(size.is_power_of_two(), "ring size must be a power of two");
        let mut ring = CmdRing {
            slots: Vec::with_capacity(size as usize),
            //counter 0 marks a blank slot
            head: 1,
            tail: 1,
        };
        for _ in 0..size {
            match CmdSlot::new(backend, family) {
                Ok(slot) => ring.slots.push(slot),
                Err(e) => {
                    ring.destroy(backend);
                    return Err(e);
                }
            }
        }
        Ok(ring)
    }

    pub(crate) fn size(&self) -> u32 {
        self.slots.len() as u32
    }

    pub(crate) fn index_of(&self, counter: u32) -> usize {
        (counter & (self.size() - 1)) as usize
    }

    ///Number of slots that are acquired but not retired.
    pub(crate) fn in_flight(&self) -> u32 {
        self.head.wrapping_sub(self.tail)
    }

    ///Acquires the next slot and begins recording. Blocks on the oldest submission if the ring is full.
    ///
    /// Panics if the oldest slot is still recording. It has no fence to wait on until it is submitted.
    pub(crate) fn acquire(
        &mut self,
        backend: &dyn Backend,
        queue: QueueId,
    ) -> Result<CmdBuf, GfxError> {
        #[cfg(feature = "profiling")]
        puffin::profile_function!();

        if self.in_flight() >= self.size() {
            let tail = self.index_of(self.tail);
            let oldest = &mut self.slots[tail];
            assert!(
                oldest.state == SlotState::Pending,
                "command ring of {queue} exhausted by command buffers that were never submitted"
            );
            #[cfg(feature = "logging")]
            log::trace!("Command ring of {queue} full, waiting for submission {}", oldest.id);

            match backend.wait_fence(oldest.fence) {
                Ok(()) | Err(vk::Result::ERROR_DEVICE_LOST) => {}
                Err(e) => return Err(GfxError::from_native(e)),
            }
            oldest.recycle(backend)?;
            self.tail = self.tail.wrapping_add(1);
        }

        let counter = self.head;
        let index = self.index_of(counter);
        let slot = &mut self.slots[index];
        debug_assert!(slot.state == SlotState::Free);

        backend
            .begin_command_buffer(slot.cmd)
            .map_err(GfxError::from_native)?;
        slot.id = counter;
        slot.state = SlotState::Recording;
        self.head = counter.wrapping_add(1);

        Ok(CmdBuf {
            handle: slot.cmd,
            fence: slot.fence,
            id: counter,
            queue,
            slot: index as u32,
            began: true,
            ..Default::default()
        })
    }

    pub(crate) fn destroy(&mut self, backend: &dyn Backend) {
        for slot in self.slots.drain(..) {
            slot.destroy(backend);
        }
    }
}

impl CmdSlot {
    fn new(backend: &dyn Backend, family: u32) -> Result<Self, GfxError> {
        let mut slot = CmdSlot {
            pool: vk::CommandPool::null(),
            cmd: vk::CommandBuffer::null(),
            fence: vk::Fence::null(),
            id: 0,
            state: SlotState::Free,
            signals: [vk::Semaphore::null(); QueueId::COUNT],
        };
        if let Err(e) = slot.create_handles(backend, family) {
            slot.destroy(backend);
            return Err(GfxError::from_native(e));
        }
        Ok(slot)
    }

    fn create_handles(&mut self, backend: &dyn Backend, family: u32) -> Result<(), vk::Result> {
        self.pool = backend.create_command_pool(family)?;
        self.cmd = backend.allocate_command_buffer(self.pool)?;
        self.fence = backend.create_fence(false)?;
        for signal in self.signals.iter_mut() {
            *signal = backend.create_semaphore()?;
        }
        Ok(())
    }

    ///Resets a retired slot to its blank state.
    pub(crate) fn recycle(&mut self, backend: &dyn Backend) -> Result<(), GfxError> {
        backend
            .reset_fence(self.fence)
            .map_err(GfxError::from_native)?;
        backend
            .reset_command_pool(self.pool)
            .map_err(GfxError::from_native)?;
        self.id = 0;
        self.state = SlotState::Free;
        Ok(())
    }

    fn destroy(self, backend: &dyn Backend) {
        for signal in self.signals {
            if signal != vk::Semaphore::null() {
                backend.destroy_semaphore(signal);
            }
        }
        if self.fence != vk::Fence::null() {
            backend.destroy_fence(self.fence);
        }
        //frees the command buffer as well
        if self.pool != vk::CommandPool::null() {
            backend.destroy_command_pool(self.pool);
        }
    }
}

impl Context {
    ///Returns the open command buffer of thread `tid` on `queue`, beginning a new one if there is none.
    pub fn cmd_get(&self, queue: QueueId, tid: usize) -> Result<CmdBuf, GfxError> {
        let q = self.queue(queue);
        let mut current = lock(q.thread_slot(tid));
        if current.is_open() {
            return Ok(*current);
        }

        let mut cmd = lock(&q.ring).acquire(self.backend(), queue)?;
        cmd.thread = tid as u32;
        #[cfg(feature = "logging")]
        log::trace!("Began command buffer {} on {queue} for thread {tid}", cmd.id);
        *current = cmd;
        Ok(cmd)
    }

    ///Open command buffer of thread `tid` on `queue`, if any.
    pub fn cmd_current(&self, queue: QueueId, tid: usize) -> Option<CmdBuf> {
        let current = *lock(self.queue(queue).thread_slot(tid));
        if current.is_open() { Some(current) } else { None }
    }

    ///Ends and submits `cmd` with its paired fence. The recording thread's slot becomes blank, so the next
    /// [Context::cmd_get] begins a new buffer.
    pub fn cmd_submit(
        &self,
        cmd: CmdBuf,
        wait: Option<SemaphoreWait>,
        signal: Option<vk::Semaphore>,
    ) -> Result<SubmitId, GfxError> {
        let q = self.queue(cmd.queue);
        let mut stored = None;
        for slot in q.current.iter() {
            let mut current = lock(slot);
            if current.is_open() && current.handle == cmd.handle {
                stored = Some(std::mem::take(&mut *current));
                break;
            }
        }
        let Some(stored) = stored else {
            panic!(
                "command buffer {} is not open on {}",
                cmd.id, cmd.queue
            );
        };

        self.submit_open(stored, wait, signal)
    }

    ///Submits the open command buffer of thread `tid` on `queue`. Returns [SubmitId::INVALID] if nothing was open.
    pub fn cmd_flush(&self, queue: QueueId, tid: usize) -> Result<SubmitId, GfxError> {
        let taken = {
            let mut current = lock(self.queue(queue).thread_slot(tid));
            if current.is_open() {
                Some(std::mem::take(&mut *current))
            } else {
                None
            }
        };

        match taken {
            Some(cmd) => self.submit_open(cmd, None, None),
            None => Ok(SubmitId::INVALID),
        }
    }

    ///Submits every open buffer of thread `tid` that takes part in an ownership transfer. Releasing buffers are
    /// submitted before acquiring ones, and acquiring buffers wait on the release semaphores.
    pub fn cmd_flush_transfers(&self, tid: usize) -> Result<(), GfxError> {
        let mut sources: SmallVec<[QueueId; QueueId::COUNT]> = SmallVec::new();
        let mut destinations: SmallVec<[QueueId; QueueId::COUNT]> = SmallVec::new();
        for id in QueueId::ALL {
            if let Some(cmd) = self.cmd_current(id, tid) {
                debug_assert!(
                    !(cmd.xfer_src && cmd.xfer_dst),
                    "{id} both releases and acquires in one command buffer"
                );
                if cmd.xfer_src {
                    sources.push(id);
                } else if cmd.xfer_dst {
                    destinations.push(id);
                }
            }
        }

        #[cfg(feature = "logging")]
        if !sources.is_empty() {
            log::trace!("Flushing transfers {sources:?} -> {destinations:?}");
        }

        for id in sources.into_iter().chain(destinations) {
            self.cmd_flush(id, tid)?;
        }
        Ok(())
    }

    ///Marks the open buffers of `src` and `dst` as the two ends of an ownership transfer.
    pub fn cmd_mark_transfer(&self, src: QueueId, dst: QueueId, tid: usize) {
        assert!(src != dst, "transfer needs two different queues");
        {
            let mut source = lock(self.queue(src).thread_slot(tid));
            assert!(source.is_open(), "no open command buffer on {src}");
            source.xfer_src = true;
            source.xfer_targets.insert(dst);
        }
        let mut destination = lock(self.queue(dst).thread_slot(tid));
        assert!(destination.is_open(), "no open command buffer on {dst}");
        destination.xfer_dst = true;
    }

    ///Records a single pipeline barrier. Does nothing if both lists are empty.
    pub fn cmd_barrier(
        &self,
        cmd: &CmdBuf,
        images: &[vk::ImageMemoryBarrier2<'_>],
        buffers: &[vk::BufferMemoryBarrier2<'_>],
    ) {
        if images.is_empty() && buffers.is_empty() {
            return;
        }
        assert!(cmd.is_open(), "recording barrier into closed command buffer");
        self.backend().cmd_pipeline_barrier2(cmd.handle, images, buffers);
    }

    ///Lets the next submission on `queue` wait for `semaphore`. Used by the swapchain driver for image acquisition.
    pub fn queue_wait(&self, queue: QueueId, semaphore: vk::Semaphore, stage: vk::PipelineStageFlags2) {
        lock(&self.queue(queue).waits).push(SemaphoreWait { semaphore, stage });
    }

    ///Drains the ids of everything thread `tid` submitted since the last call, in submission order.
    pub fn cmd_take_submitted(&self, tid: usize) -> Vec<SubmitId> {
        std::mem::take(&mut *lock(&self.submitted[tid]))
    }

    fn submit_open(
        &self,
        mut cmd: CmdBuf,
        wait: Option<SemaphoreWait>,
        signal: Option<vk::Semaphore>,
    ) -> Result<SubmitId, GfxError> {
        #[cfg(feature = "profiling")]
        puffin::profile_function!();

        let q = self.queue(cmd.queue);
        self.backend()
            .end_command_buffer(cmd.handle)
            .map_err(GfxError::from_native)?;
        cmd.ended = true;

        let mut waits: SmallVec<[SemaphoreWait; 4]> = std::mem::take(&mut *lock(&q.waits));
        waits.extend(wait);

        let slot_signals = lock(&q.ring).slots[cmd.slot as usize].signals;
        let mut signals: SmallVec<[vk::Semaphore; 4]> = signal.into_iter().collect();
        for target in cmd.xfer_targets.iter() {
            signals.push(slot_signals[target.index()]);
        }

        {
            let _submit = lock(&q.submit_lock);
            self.backend()
                .queue_submit(
                    q.handle,
                    &Submission {
                        cmd: cmd.handle,
                        fence: cmd.fence,
                        waits: &waits,
                        signals: &signals,
                    },
                )
                .map_err(GfxError::from_native)?;
        }
        cmd.submitted = true;
        lock(&q.ring).slots[cmd.slot as usize].state = SlotState::Pending;
        lock(&self.submitted[cmd.thread as usize]).push(cmd.submit_id());

        for target in cmd.xfer_targets.iter() {
            lock(&self.queue(target).waits).push(SemaphoreWait {
                semaphore: slot_signals[target.index()],
                stage: vk::PipelineStageFlags2::ALL_COMMANDS,
            });
        }

        #[cfg(feature = "logging")]
        log::trace!(
            "Submitted {} on {} (waits={}, signals={})",
            cmd.id,
            cmd.queue,
            waits.len(),
            signals.len()
        );

        Ok(cmd.submit_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::{headless::HeadlessBackend, FenceStatus},
        config::GfxConfig,
    };
    use std::sync::Arc;

    fn context(ring: u32) -> (Arc<HeadlessBackend>, Context) {
        let backend = Arc::new(HeadlessBackend::new());
        let ctx = Context::headless(
            backend.clone(),
            GfxConfig::default().with_cmd_ring_size(ring).with_thread_count(2),
        )
        .unwrap();
        (backend, ctx)
    }

    #[test]
    fn get_is_lazy_and_cached() {
        let (backend, ctx) = context(4);
        assert!(ctx.cmd_current(QueueId::Graphics, 0).is_none());
        let a = ctx.cmd_get(QueueId::Graphics, 0).unwrap();
        let b = ctx.cmd_get(QueueId::Graphics, 0).unwrap();
        assert_eq!(a, b);
        assert!(a.is_open());
        //other threads get their own buffer
        let c = ctx.cmd_get(QueueId::Graphics, 1).unwrap();
        assert_ne!(a.handle, c.handle);
        assert_eq!(backend.begun(), 2);
    }

    #[test]
    fn submit_blanks_current_slot() {
        let (backend, ctx) = context(4);
        let cmd = ctx.cmd_get(QueueId::Compute, 0).unwrap();
        let id = ctx.cmd_submit(cmd, None, None).unwrap();
        assert!(id.valid);
        assert_eq!(id.queue, QueueId::Compute);
        assert_eq!(id.counter, cmd.id);
        assert!(ctx.cmd_current(QueueId::Compute, 0).is_none());
        assert_eq!(backend.submissions().len(), 1);

        let next = ctx.cmd_get(QueueId::Compute, 0).unwrap();
        assert_eq!(next.id, cmd.id + 1);
    }

    #[test]
    fn flush_without_open_buffer() {
        let (_backend, ctx) = context(4);
        assert_eq!(ctx.cmd_flush(QueueId::Transfer, 0).unwrap(), SubmitId::INVALID);
    }

    #[test]
    fn ring_back_pressure_waits_for_oldest() {
        let (backend, ctx) = context(2);
        let first = ctx.cmd_get(QueueId::Graphics, 0).unwrap();
        ctx.cmd_submit(first, None, None).unwrap();
        let second = ctx.cmd_get(QueueId::Graphics, 0).unwrap();
        ctx.cmd_submit(second, None, None).unwrap();
        assert_eq!(backend.fence_waits(), 0);

        //ring is full, acquiring blocks on the oldest fence
        let third = ctx.cmd_get(QueueId::Graphics, 0).unwrap();
        assert_eq!(backend.fence_waits(), 1);
        assert_eq!(third.slot, first.slot);
        assert_eq!(third.handle, first.handle);
        assert_eq!(third.id, second.id + 1);
        assert!(!third.submitted && !third.ended && !third.xfer_src && !third.xfer_dst);
        assert_eq!(backend.fence_status(third.fence), FenceStatus::Unsignaled);
        assert!(ctx.poll(first.submit_id()).unwrap());
    }

    #[test]
    #[should_panic]
    fn exhausting_ring_without_submitting_panics() {
        let (_backend, ctx) = context(2);
        let first = ctx.cmd_get(QueueId::Graphics, 0).unwrap();
        ctx.cmd_submit(first, None, None).unwrap();
        //stays open on thread 1
        ctx.cmd_get(QueueId::Graphics, 1).unwrap();
        let third = ctx.cmd_get(QueueId::Graphics, 0).unwrap();
        ctx.cmd_submit(third, None, None).unwrap();
        //oldest unretired slot is still recording
        ctx.cmd_get(QueueId::Graphics, 0).unwrap();
    }

    #[test]
    fn transfer_flush_orders_and_links_semaphores() {
        let (backend, ctx) = context(4);
        ctx.cmd_get(QueueId::Graphics, 0).unwrap();
        ctx.cmd_get(QueueId::Compute, 0).unwrap();
        ctx.cmd_mark_transfer(QueueId::Graphics, QueueId::Compute, 0);

        ctx.cmd_flush_transfers(0).unwrap();
        let subs = backend.submissions();
        assert_eq!(subs.len(), 2);
        assert_eq!(subs[0].queue, ctx.queue(QueueId::Graphics).handle);
        assert_eq!(subs[1].queue, ctx.queue(QueueId::Compute).handle);
        assert_eq!(subs[0].signals.len(), 1);
        assert_eq!(subs[1].waits, vec![subs[0].signals[0]]);
    }

    #[test]
    fn submitted_ids_follow_submission_order() {
        let (_backend, ctx) = context(4);
        let compute = ctx.cmd_get(QueueId::Compute, 0).unwrap();
        let graphics = ctx.cmd_get(QueueId::Graphics, 0).unwrap();
        let other = ctx.cmd_get(QueueId::Graphics, 1).unwrap();
        ctx.cmd_mark_transfer(QueueId::Graphics, QueueId::Compute, 0);
        ctx.cmd_flush_transfers(0).unwrap();
        ctx.cmd_submit(other, None, None).unwrap();

        //releasing side goes first
        assert_eq!(
            ctx.cmd_take_submitted(0),
            vec![graphics.submit_id(), compute.submit_id()]
        );
        assert!(ctx.cmd_take_submitted(0).is_empty());
        assert_eq!(ctx.cmd_take_submitted(1), vec![other.submit_id()]);
    }

    #[test]
    fn queue_wait_is_consumed_once() {
        let (backend, ctx) = context(4);
        let acquire = backend.create_semaphore().unwrap();
        ctx.queue_wait(
            QueueId::Graphics,
            acquire,
            vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
        );
        ctx.cmd_get(QueueId::Graphics, 0).unwrap();
        ctx.cmd_flush(QueueId::Graphics, 0).unwrap();
        ctx.cmd_get(QueueId::Graphics, 0).unwrap();
        ctx.cmd_flush(QueueId::Graphics, 0).unwrap();

        let subs = backend.submissions();
        assert_eq!(subs[0].waits, vec![acquire]);
        assert!(subs[1].waits.is_empty());
    }
}
