//! ## Context
//!
//! The [Device] is the part of the context that resources keep alive: the native backend, the configuration, the
//! frame counter and the [ReleaseQueue]. Buffers and images hold an `Arc<Device>` so they can hand their handles to
//! the release queue from wherever they are dropped.
//!
//! The [Context] adds the queues (and with them command recording and submission tracking). It is created once at
//! device bring-up and passed by reference to everything that records or submits work.

use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc, Mutex,
};

use ahash::AHashMap;
use ash::vk;

use crate::{
    backend::Backend,
    config::GfxConfig,
    error::GfxError,
    queue::{Queue, QueueDesc, QueueId},
    release::{Releasable, ReleaseQueue},
    submit::SubmitId,
};

pub struct Device {
    pub backend: Arc<dyn Backend>,
    pub config: GfxConfig,
    releases: ReleaseQueue,
    frame: AtomicU32,
}

impl Device {
    pub fn new(backend: Arc<dyn Backend>, config: GfxConfig) -> Arc<Self> {
        config.validate();
        Arc::new(Device {
            backend,
            config,
            releases: ReleaseQueue::new(),
            frame: AtomicU32::new(0),
        })
    }

    ///Current frame number.
    pub fn frame(&self) -> u32 {
        self.frame.load(Ordering::Acquire)
    }

    fn advance_frame(&self) -> u32 {
        self.frame.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
    }

    ///Schedules a release. Safe to call from any thread. If too many releases pile up the queue is force-finalized,
    /// which stalls until the device is idle.
    pub fn release(&self, record: Releasable) {
        let pending = self.releases.add(record);
        if pending >= self.config.max_pending_releases {
            #[cfg(feature = "logging")]
            log::warn!("Too many gpu objects pending release ({pending}), force-finalizing");
            if let Err(_e) = self.releases.finalize(&*self.backend) {
                #[cfg(feature = "logging")]
                log::error!("Force-finalizing releases failed: {_e}");
            }
        }
    }

    pub fn pending_releases(&self) -> usize {
        self.releases.len()
    }

    ///Destroys all releases that became ready. `retired` answers submission gated records.
    pub fn update_releases(&self, retired: &dyn Fn(SubmitId) -> bool) -> usize {
        self.releases.update(
            &*self.backend,
            self.frame(),
            self.config.frames_in_flight,
            retired,
        )
    }

    ///Waits for everything and destroys all pending releases.
    pub fn finalize_releases(&self) -> Result<(), GfxError> {
        self.releases.finalize(&*self.backend)
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if let Err(_e) = self.releases.finalize(&*self.backend) {
            #[cfg(feature = "logging")]
            log::error!("Finalizing releases on device drop failed: {_e}");
        }
    }
}

pub struct Context {
    pub device: Arc<Device>,
    ///Indexed by [QueueId::index].
    queues: Vec<Queue>,
    ///Submission log per recording thread, drained by [Context::cmd_take_submitted].
    pub(crate) submitted: Vec<Mutex<Vec<SubmitId>>>,
}

impl Context {
    ///Creates the context. `descs` must name every [QueueId] exactly once.
    pub fn new(device: Arc<Device>, descs: &[QueueDesc]) -> Result<Self, GfxError> {
        assert_eq!(
            descs.len(),
            QueueId::COUNT,
            "every queue id needs exactly one description"
        );
        let mut sorted = descs.to_vec();
        sorted.sort_by_key(|desc| desc.id);
        for (desc, id) in sorted.iter().zip(QueueId::ALL) {
            assert_eq!(desc.id, id, "queue {id} is missing or described twice");
        }

        //logical queues that alias one native queue must not submit concurrently
        let mut submit_locks: AHashMap<vk::Queue, Arc<Mutex<()>>> = AHashMap::default();
        let mut queues: Vec<Queue> = Vec::with_capacity(QueueId::COUNT);
        for desc in sorted.iter() {
            let submit_lock = submit_locks.entry(desc.handle).or_default().clone();
            match Queue::new(&*device.backend, desc, &device.config, submit_lock) {
                Ok(queue) => queues.push(queue),
                Err(e) => {
                    for queue in queues.iter_mut() {
                        crate::lock(&queue.ring).destroy(&*device.backend);
                    }
                    return Err(e);
                }
            }
        }

        #[cfg(feature = "logging")]
        for queue in queues.iter() {
            log::info!(
                "{} queue: family={}, index={}, caps={:?}, present={}",
                queue.id,
                queue.family,
                queue.index,
                queue.caps.flags,
                queue.caps.present
            );
        }

        let submitted = (0..device.config.thread_count)
            .map(|_| Mutex::new(Vec::new()))
            .collect();
        Ok(Context {
            device,
            queues,
            submitted,
        })
    }

    ///Context over a [HeadlessBackend](crate::backend::headless::HeadlessBackend) where every queue has its own
    /// family and full capabilities.
    #[cfg(any(test, feature = "headless"))]
    pub fn headless(
        backend: Arc<crate::backend::headless::HeadlessBackend>,
        config: GfxConfig,
    ) -> Result<Self, GfxError> {
        let descs = QueueId::ALL.map(|id| backend.queue_desc(id));
        let device = Device::new(backend, config);
        Context::new(device, &descs)
    }

    pub fn backend(&self) -> &dyn Backend {
        &*self.device.backend
    }

    pub fn config(&self) -> &GfxConfig {
        &self.device.config
    }

    pub fn queue(&self, id: QueueId) -> &Queue {
        &self.queues[id.index()]
    }

    pub fn queues(&self) -> impl Iterator<Item = &Queue> {
        self.queues.iter()
    }

    pub fn frame(&self) -> u32 {
        self.device.frame()
    }

    pub fn frames_in_flight(&self) -> u32 {
        self.device.config.frames_in_flight
    }

    ///Advances the frame counter and destroys every release that became ready. Returns the new frame number.
    pub fn begin_frame(&self) -> u32 {
        #[cfg(feature = "profiling")]
        puffin::profile_function!();

        let frame = self.device.advance_frame();
        let _released = self.device.update_releases(&|id| match self.poll(id) {
            Ok(retired) => retired,
            Err(_e) => {
                #[cfg(feature = "logging")]
                log::error!("Polling {id:?} failed: {_e}");
                false
            }
        });
        frame
    }
}

impl Queue {
    pub(crate) fn thread_slot(&self, tid: usize) -> &Mutex<crate::command::CmdBuf> {
        assert!(
            tid < self.current.len(),
            "thread id {tid} exceeds the configured thread count {}",
            self.current.len()
        );
        &self.current[tid]
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if let Err(_e) = self.wait_all() {
            #[cfg(feature = "logging")]
            log::error!("Waiting for queues on context drop failed: {_e}");
        }
        if let Err(_e) = self.device.finalize_releases() {
            #[cfg(feature = "logging")]
            log::error!("Finalizing releases on context drop failed: {_e}");
        }
        for queue in self.queues.iter() {
            crate::lock(&queue.ring).destroy(self.backend());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::headless::HeadlessBackend,
        release::{ReleasableKind, ReleaseGate},
        resources::{BufDesc, Buffer},
    };
    use static_assertions::assert_impl_all;

    #[test]
    fn impl_send_sync() {
        assert_impl_all!(Device: Send, Sync);
        assert_impl_all!(Context: Send, Sync);
    }

    #[test]
    fn begin_frame_releases_after_frames_in_flight() {
        let backend = Arc::new(HeadlessBackend::new());
        let ctx = Context::headless(backend.clone(), GfxConfig::default()).unwrap();
        let buffer = Buffer::new(
            &ctx.device,
            BufDesc::new(256, ash::vk::BufferUsageFlags::VERTEX_BUFFER),
            "vertices",
        )
        .unwrap();
        drop(buffer);

        for _ in 0..3 {
            ctx.begin_frame();
            assert_eq!(backend.live_buffers(), 1);
        }
        assert_eq!(ctx.begin_frame(), 4);
        assert_eq!(backend.live_buffers(), 0);
    }

    #[test]
    fn submit_gated_release() {
        let backend = Arc::new(HeadlessBackend::new());
        let ctx = Context::headless(backend.clone(), GfxConfig::default()).unwrap();
        let buffer = backend
            .create_buffer(&BufDesc::staging(64), "staging")
            .unwrap();

        let cmd = ctx.cmd_get(QueueId::Transfer, 0).unwrap();
        let id = ctx.cmd_submit(cmd, None, None).unwrap();
        ctx.device.release(Releasable {
            kind: ReleasableKind::Buffer(buffer),
            gate: ReleaseGate::Submit(id),
        });

        ctx.begin_frame();
        assert_eq!(ctx.device.pending_releases(), 1);
        backend.complete_all();
        ctx.begin_frame();
        assert_eq!(ctx.device.pending_releases(), 0);
    }

    #[test]
    fn force_finalize_over_threshold() {
        let backend = Arc::new(HeadlessBackend::new());
        let device = Device::new(
            backend.clone(),
            GfxConfig::default().with_max_pending_releases(4),
        );
        for _ in 0..3 {
            drop(Buffer::new(&device, BufDesc::staging(8), "tmp").unwrap());
        }
        assert_eq!(device.pending_releases(), 3);
        drop(Buffer::new(&device, BufDesc::staging(8), "tmp").unwrap());
        assert_eq!(device.pending_releases(), 0);
        assert_eq!(backend.live_buffers(), 0);
    }

    #[test]
    fn drop_tears_down_everything() {
        let backend = Arc::new(HeadlessBackend::new());
        {
            let ctx = Context::headless(backend.clone(), GfxConfig::default()).unwrap();
            let cmd = ctx.cmd_get(QueueId::Graphics, 0).unwrap();
            ctx.cmd_submit(cmd, None, None).unwrap();
            drop(Buffer::new(&ctx.device, BufDesc::staging(8), "tmp").unwrap());
        }
        assert_eq!(backend.live_buffers(), 0);
        assert_eq!(backend.live_fences(), 0);
    }
}
