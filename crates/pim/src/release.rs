//! # Deferred reclamation
//!
//! GPU resources can't be destroyed the moment the CPU side lets go of them, since a command buffer that is still in
//! flight might reference them. Instead a [Releasable] record is pushed to the [ReleaseQueue] and destroyed once its
//! [ReleaseGate] reports that nothing can still use it.
//!
//! The queue is the one structure of the device that is mutated from arbitrary threads (resources may be dropped on
//! any worker), so it sits behind a mutex.

use std::sync::Mutex;

use ash::vk;

use crate::{
    backend::Backend,
    error::GfxError,
    lock,
    submit::SubmitId,
};

///Native payload of a release.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReleasableKind {
    Buffer(vk::Buffer),
    Image(vk::Image),
    ImageView(vk::ImageView),
}

impl ReleasableKind {
    fn destroy(self, backend: &dyn Backend) {
        match self {
            ReleasableKind::Buffer(buffer) => backend.destroy_buffer(buffer),
            ReleasableKind::Image(image) => backend.destroy_image(image),
            ReleasableKind::ImageView(view) => backend.destroy_image_view(view),
        }
    }
}

///Condition that has to hold before a release may happen.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleaseGate {
    ///Ready once the fence is signaled, or the device is lost. The fence is not owned by the record.
    Fence(vk::Fence),
    ///Ready once more than `frames_in_flight` frames passed since the given frame.
    Frame(u32),
    ///Ready once the submission is retired.
    Submit(SubmitId),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Releasable {
    pub kind: ReleasableKind,
    pub gate: ReleaseGate,
}

impl Releasable {
    pub fn is_ready(
        &self,
        backend: &dyn Backend,
        frame: u32,
        frames_in_flight: u32,
        retired: &dyn Fn(SubmitId) -> bool,
    ) -> bool {
        match self.gate {
            ReleaseGate::Fence(fence) => backend.fence_status(fence).is_retired(),
            ReleaseGate::Frame(released_at) => frame.wrapping_sub(released_at) > frames_in_flight,
            ReleaseGate::Submit(id) => retired(id),
        }
    }
}

#[derive(Debug, Default)]
pub struct ReleaseQueue {
    list: Mutex<Vec<Releasable>>,
}

impl ReleaseQueue {
    pub fn new() -> Self {
        ReleaseQueue {
            list: Mutex::new(Vec::new()),
        }
    }

    ///Appends a record. Returns the number of pending records afterwards.
    pub fn add(&self, record: Releasable) -> usize {
        let mut list = lock(&self.list);
        list.push(record);
        list.len()
    }

    pub fn len(&self) -> usize {
        lock(&self.list).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    ///Destroys every ready record. Order of the remaining records is not preserved.
    /// Returns the number of destroyed records.
    pub fn update(
        &self,
        backend: &dyn Backend,
        frame: u32,
        frames_in_flight: u32,
        retired: &dyn Fn(SubmitId) -> bool,
    ) -> usize {
        let mut list = lock(&self.list);
        let mut released = 0;
        //reverse, so swap_remove only moves already checked records
        for i in (0..list.len()).rev() {
            if list[i].is_ready(backend, frame, frames_in_flight, retired) {
                let record = list.swap_remove(i);
                record.kind.destroy(backend);
                released += 1;
            }
        }

        #[cfg(feature = "logging")]
        if released > 0 {
            log::trace!(
                "Released {released} resources in frame {frame}, {} pending",
                list.len()
            );
        }

        released
    }

    ///Waits for every outstanding fence and the device, then destroys everything. Only meant for teardown or
    /// as an emergency valve when too many records pile up.
    ///
    /// Everything is destroyed even if a wait fails. The first failure is returned.
    pub fn finalize(&self, backend: &dyn Backend) -> Result<(), GfxError> {
        let records = std::mem::take(&mut *lock(&self.list));
        let mut first_error = None;

        for record in records.iter() {
            if let ReleaseGate::Fence(fence) = record.gate {
                if let Err(e) = backend.wait_fence(fence) {
                    if e != vk::Result::ERROR_DEVICE_LOST {
                        first_error.get_or_insert(GfxError::from_native(e));
                    }
                }
            }
        }
        if let Err(e) = backend.device_wait_idle() {
            if e != vk::Result::ERROR_DEVICE_LOST {
                first_error.get_or_insert(GfxError::from_native(e));
            }
        }

        for record in records {
            record.kind.destroy(backend);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{backend::headless::HeadlessBackend, queue::QueueId, resources::BufDesc};
    use static_assertions::assert_impl_all;

    fn never(_: SubmitId) -> bool {
        false
    }

    fn buffer(backend: &HeadlessBackend) -> vk::Buffer {
        backend
            .create_buffer(
                &BufDesc::new(16, vk::BufferUsageFlags::UNIFORM_BUFFER),
                "test",
            )
            .unwrap()
    }

    #[test]
    fn impl_send_sync() {
        assert_impl_all!(ReleaseQueue: Send, Sync);
    }

    #[test]
    fn frame_gate_waits_for_frames_in_flight() {
        let backend = HeadlessBackend::new();
        let queue = ReleaseQueue::new();
        queue.add(Releasable {
            kind: ReleasableKind::Buffer(buffer(&backend)),
            gate: ReleaseGate::Frame(10),
        });

        //frame - record.frame <= frames_in_flight is never ready
        for frame in 10..=13 {
            assert_eq!(queue.update(&backend, frame, 3, &never), 0);
        }
        assert_eq!(backend.live_buffers(), 1);
        assert_eq!(queue.update(&backend, 14, 3, &never), 1);
        assert_eq!(backend.live_buffers(), 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn fence_gate_waits_for_signal() {
        let backend = HeadlessBackend::new();
        let queue = ReleaseQueue::new();
        let fence = backend.create_fence(false).unwrap();
        let pending = buffer(&backend);
        queue.add(Releasable {
            kind: ReleasableKind::Buffer(pending),
            gate: ReleaseGate::Fence(fence),
        });

        //frame count alone does not release fence gated records
        assert_eq!(queue.update(&backend, 1000, 3, &never), 0);
        backend.signal_fence(fence);
        assert_eq!(queue.update(&backend, 1000, 3, &never), 1);
        assert!(backend.destroyed().contains(&ReleasableKind::Buffer(pending)));
    }

    #[test]
    fn lost_device_counts_as_ready() {
        let backend = HeadlessBackend::new();
        let queue = ReleaseQueue::new();
        let fence = backend.create_fence(false).unwrap();
        queue.add(Releasable {
            kind: ReleasableKind::Buffer(buffer(&backend)),
            gate: ReleaseGate::Fence(fence),
        });
        backend.lose_device();
        assert_eq!(queue.update(&backend, 0, 3, &never), 1);
    }

    #[test]
    fn submit_gate_asks_tracker() {
        let backend = HeadlessBackend::new();
        let queue = ReleaseQueue::new();
        let id = SubmitId {
            counter: 7,
            queue: QueueId::Compute,
            valid: true,
        };
        queue.add(Releasable {
            kind: ReleasableKind::Buffer(buffer(&backend)),
            gate: ReleaseGate::Submit(id),
        });
        assert_eq!(queue.update(&backend, 0, 3, &never), 0);
        assert_eq!(queue.update(&backend, 0, 3, &|other| other == id), 1);
    }

    #[test]
    fn swap_remove_keeps_unready_records() {
        let backend = HeadlessBackend::new();
        let queue = ReleaseQueue::new();
        for frame in [0, 5, 1, 4] {
            queue.add(Releasable {
                kind: ReleasableKind::Buffer(buffer(&backend)),
                gate: ReleaseGate::Frame(frame),
            });
        }
        assert_eq!(queue.update(&backend, 5, 3, &never), 2);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.update(&backend, 10, 3, &never), 2);
        assert_eq!(backend.live_buffers(), 0);
    }

    #[test]
    fn finalize_waits_and_destroys_everything() {
        let backend = HeadlessBackend::new();
        let queue = ReleaseQueue::new();
        let fence = backend.create_fence(false).unwrap();
        backend.mark_fence_pending(fence);
        queue.add(Releasable {
            kind: ReleasableKind::Buffer(buffer(&backend)),
            gate: ReleaseGate::Fence(fence),
        });
        queue.add(Releasable {
            kind: ReleasableKind::Buffer(buffer(&backend)),
            gate: ReleaseGate::Frame(100),
        });

        queue.finalize(&backend).unwrap();
        assert!(queue.is_empty());
        assert_eq!(backend.live_buffers(), 0);
        assert_eq!(backend.fence_waits(), 1);
    }
}
