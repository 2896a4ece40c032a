//! Backend that executes nothing. Handles are synthetic, every barrier and submission is logged, and "the GPU" finishes
//! a submission as soon as someone blocks on its fence (or [HeadlessBackend::complete_all] is called).

use std::sync::Mutex;

use ahash::{AHashMap, AHashSet};
use ash::vk::{self, Handle};

use crate::{
    error::AllocationError,
    lock,
    queue::{QueueCaps, QueueDesc, QueueId},
    release::ReleasableKind,
    resources::{range_eq, BufDesc, ImgDesc, ImgViewDesc},
};

use super::{Backend, FenceStatus, Submission};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FenceState {
    Unsignaled,
    ///Submitted, "executing".
    Pending,
    Signaled,
}

///Logged image barrier.
#[derive(Clone, Copy, Debug)]
pub struct ImageBarrier {
    pub image: vk::Image,
    pub range: vk::ImageSubresourceRange,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_stage: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub dst_stage: vk::PipelineStageFlags2,
    pub dst_access: vk::AccessFlags2,
    pub src_family: u32,
    pub dst_family: u32,
}

impl PartialEq for ImageBarrier {
    fn eq(&self, other: &Self) -> bool {
        self.image == other.image
            && range_eq(&self.range, &other.range)
            && self.old_layout == other.old_layout
            && self.new_layout == other.new_layout
            && self.src_stage == other.src_stage
            && self.src_access == other.src_access
            && self.dst_stage == other.dst_stage
            && self.dst_access == other.dst_access
            && self.src_family == other.src_family
            && self.dst_family == other.dst_family
    }
}

impl Eq for ImageBarrier {}

///Logged buffer barrier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferBarrier {
    pub buffer: vk::Buffer,
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
    pub src_stage: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub dst_stage: vk::PipelineStageFlags2,
    pub dst_access: vk::AccessFlags2,
    pub src_family: u32,
    pub dst_family: u32,
}

///One `vkCmdPipelineBarrier2` call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BarrierRecord {
    pub cmd: vk::CommandBuffer,
    pub images: Vec<ImageBarrier>,
    pub buffers: Vec<BufferBarrier>,
}

///One queue submission.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubmitRecord {
    pub queue: vk::Queue,
    pub cmd: vk::CommandBuffer,
    pub fence: vk::Fence,
    pub waits: Vec<vk::Semaphore>,
    pub signals: Vec<vk::Semaphore>,
}

#[derive(Default)]
struct HeadlessState {
    next_handle: u64,
    fences: AHashMap<vk::Fence, FenceState>,
    semaphores: AHashSet<vk::Semaphore>,
    pools: AHashMap<vk::CommandPool, Vec<vk::CommandBuffer>>,
    recording: AHashMap<vk::CommandBuffer, bool>,
    buffers: AHashMap<vk::Buffer, BufDesc>,
    images: AHashMap<vk::Image, ImgDesc>,
    views: AHashSet<vk::ImageView>,
    barriers: Vec<BarrierRecord>,
    submissions: Vec<SubmitRecord>,
    destroyed: Vec<ReleasableKind>,
    fence_waits: usize,
    begun: usize,
    fail_allocations: bool,
    lost: bool,
}

impl HeadlessState {
    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        //keep clear of null
        0x1_0000 + self.next_handle
    }
}

#[derive(Default)]
pub struct HeadlessBackend {
    state: Mutex<HeadlessState>,
}

impl HeadlessBackend {
    pub fn new() -> Self {
        Self::default()
    }

    ///Every logical queue gets its own family (the family index equals [QueueId::index]) with full capabilities.
    pub fn queue_desc(&self, id: QueueId) -> QueueDesc {
        QueueDesc {
            id,
            family: id.index() as u32,
            index: 0,
            handle: vk::Queue::from_raw(0x100 + id.index() as u64),
            caps: QueueCaps::new(
                vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
                matches!(id, QueueId::Graphics | QueueId::Present),
            ),
        }
    }

    ///Makes every following buffer and image creation fail.
    pub fn fail_allocations(&self, fail: bool) {
        lock(&self.state).fail_allocations = fail;
    }

    ///Simulates device loss. All fences report [FenceStatus::Lost] afterwards.
    pub fn lose_device(&self) {
        lock(&self.state).lost = true;
    }

    ///Finishes every submitted workload.
    pub fn complete_all(&self) {
        for state in lock(&self.state).fences.values_mut() {
            if *state == FenceState::Pending {
                *state = FenceState::Signaled;
            }
        }
    }

    pub fn signal_fence(&self, fence: vk::Fence) {
        lock(&self.state).fences.insert(fence, FenceState::Signaled);
    }

    ///Pretends `fence` was submitted with some work, so waiting on it returns.
    pub fn mark_fence_pending(&self, fence: vk::Fence) {
        lock(&self.state).fences.insert(fence, FenceState::Pending);
    }

    ///Number of waits that actually had to block.
    pub fn fence_waits(&self) -> usize {
        lock(&self.state).fence_waits
    }

    ///Number of begun command buffers.
    pub fn begun(&self) -> usize {
        lock(&self.state).begun
    }

    pub fn barriers(&self) -> Vec<BarrierRecord> {
        lock(&self.state).barriers.clone()
    }

    ///All image barriers, flattened in recording order.
    pub fn image_barriers(&self) -> Vec<ImageBarrier> {
        lock(&self.state)
            .barriers
            .iter()
            .flat_map(|record| record.images.iter().copied())
            .collect()
    }

    ///All buffer barriers, flattened in recording order.
    pub fn buffer_barriers(&self) -> Vec<BufferBarrier> {
        lock(&self.state)
            .barriers
            .iter()
            .flat_map(|record| record.buffers.iter().copied())
            .collect()
    }

    pub fn submissions(&self) -> Vec<SubmitRecord> {
        lock(&self.state).submissions.clone()
    }

    ///Forgets logged barriers and submissions.
    pub fn clear_log(&self) {
        let mut state = lock(&self.state);
        state.barriers.clear();
        state.submissions.clear();
    }

    pub fn destroyed(&self) -> Vec<ReleasableKind> {
        lock(&self.state).destroyed.clone()
    }

    pub fn live_buffers(&self) -> usize {
        lock(&self.state).buffers.len()
    }

    pub fn live_images(&self) -> usize {
        lock(&self.state).images.len()
    }

    pub fn live_views(&self) -> usize {
        lock(&self.state).views.len()
    }

    pub fn live_fences(&self) -> usize {
        lock(&self.state).fences.len()
    }

    pub fn buffer_desc(&self, buffer: vk::Buffer) -> Option<BufDesc> {
        lock(&self.state).buffers.get(&buffer).copied()
    }

    pub fn image_desc(&self, image: vk::Image) -> Option<ImgDesc> {
        lock(&self.state).images.get(&image).copied()
    }
}

impl Backend for HeadlessBackend {
    fn create_fence(&self, signaled: bool) -> Result<vk::Fence, vk::Result> {
        let mut state = lock(&self.state);
        let fence = vk::Fence::from_raw(state.handle());
        let initial = if signaled {
            FenceState::Signaled
        } else {
            FenceState::Unsignaled
        };
        state.fences.insert(fence, initial);
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        lock(&self.state).fences.remove(&fence);
    }

    fn fence_status(&self, fence: vk::Fence) -> FenceStatus {
        let state = lock(&self.state);
        if state.lost {
            return FenceStatus::Lost;
        }
        match state.fences.get(&fence) {
            Some(FenceState::Signaled) => FenceStatus::Signaled,
            _ => FenceStatus::Unsignaled,
        }
    }

    fn wait_fence(&self, fence: vk::Fence) -> Result<(), vk::Result> {
        let mut state = lock(&self.state);
        if state.lost {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        match state.fences.get(&fence).copied() {
            Some(FenceState::Signaled) => Ok(()),
            Some(FenceState::Pending) => {
                state.fences.insert(fence, FenceState::Signaled);
                state.fence_waits += 1;
                Ok(())
            }
            Some(FenceState::Unsignaled) => {
                panic!("waiting on fence {fence:?} that was never submitted blocks forever")
            }
            None => panic!("waiting on unknown fence {fence:?}"),
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<(), vk::Result> {
        let mut state = lock(&self.state);
        assert!(
            state.fences.get(&fence) != Some(&FenceState::Pending) || state.lost,
            "resetting fence {fence:?} of a running submission"
        );
        state.fences.insert(fence, FenceState::Unsignaled);
        Ok(())
    }

    fn create_semaphore(&self) -> Result<vk::Semaphore, vk::Result> {
        let mut state = lock(&self.state);
        let semaphore = vk::Semaphore::from_raw(state.handle());
        state.semaphores.insert(semaphore);
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        lock(&self.state).semaphores.remove(&semaphore);
    }

    fn create_command_pool(&self, _family: u32) -> Result<vk::CommandPool, vk::Result> {
        let mut state = lock(&self.state);
        let pool = vk::CommandPool::from_raw(state.handle());
        state.pools.insert(pool, Vec::new());
        Ok(pool)
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut state = lock(&self.state);
        if let Some(cmds) = state.pools.remove(&pool) {
            for cmd in cmds {
                state.recording.remove(&cmd);
            }
        }
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> Result<(), vk::Result> {
        let mut state = lock(&self.state);
        let cmds = state.pools.get(&pool).cloned().unwrap_or_default();
        for cmd in cmds {
            state.recording.insert(cmd, false);
        }
        Ok(())
    }

    fn allocate_command_buffer(
        &self,
        pool: vk::CommandPool,
    ) -> Result<vk::CommandBuffer, vk::Result> {
        let mut state = lock(&self.state);
        let cmd = vk::CommandBuffer::from_raw(state.handle());
        state.pools.entry(pool).or_default().push(cmd);
        state.recording.insert(cmd, false);
        Ok(cmd)
    }

    fn begin_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<(), vk::Result> {
        let mut state = lock(&self.state);
        let recording = state.recording.entry(cmd).or_insert(false);
        assert!(!*recording, "command buffer {cmd:?} begun twice");
        *recording = true;
        state.begun += 1;
        Ok(())
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<(), vk::Result> {
        let mut state = lock(&self.state);
        let recording = state.recording.entry(cmd).or_insert(false);
        assert!(*recording, "ending command buffer {cmd:?} that is not recording");
        *recording = false;
        Ok(())
    }

    fn cmd_pipeline_barrier2(
        &self,
        cmd: vk::CommandBuffer,
        images: &[vk::ImageMemoryBarrier2<'_>],
        buffers: &[vk::BufferMemoryBarrier2<'_>],
    ) {
        let mut state = lock(&self.state);
        assert!(
            state.recording.get(&cmd).copied().unwrap_or(false),
            "barrier recorded into {cmd:?} outside of recording"
        );
        let record = BarrierRecord {
            cmd,
            images: images
                .iter()
                .map(|b| ImageBarrier {
                    image: b.image,
                    range: b.subresource_range,
                    old_layout: b.old_layout,
                    new_layout: b.new_layout,
                    src_stage: b.src_stage_mask,
                    src_access: b.src_access_mask,
                    dst_stage: b.dst_stage_mask,
                    dst_access: b.dst_access_mask,
                    src_family: b.src_queue_family_index,
                    dst_family: b.dst_queue_family_index,
                })
                .collect(),
            buffers: buffers
                .iter()
                .map(|b| BufferBarrier {
                    buffer: b.buffer,
                    offset: b.offset,
                    size: b.size,
                    src_stage: b.src_stage_mask,
                    src_access: b.src_access_mask,
                    dst_stage: b.dst_stage_mask,
                    dst_access: b.dst_access_mask,
                    src_family: b.src_queue_family_index,
                    dst_family: b.dst_queue_family_index,
                })
                .collect(),
        };
        state.barriers.push(record);
    }

    fn queue_submit(
        &self,
        queue: vk::Queue,
        submission: &Submission<'_>,
    ) -> Result<(), vk::Result> {
        let mut state = lock(&self.state);
        if state.lost {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        assert!(
            !state
                .recording
                .get(&submission.cmd)
                .copied()
                .unwrap_or(false),
            "submitting command buffer that is still recording"
        );
        assert_eq!(
            state.fences.get(&submission.fence),
            Some(&FenceState::Unsignaled),
            "submitting with a fence that is not reset"
        );
        state.fences.insert(submission.fence, FenceState::Pending);
        state.submissions.push(SubmitRecord {
            queue,
            cmd: submission.cmd,
            fence: submission.fence,
            waits: submission.waits.iter().map(|w| w.semaphore).collect(),
            signals: submission.signals.to_vec(),
        });
        Ok(())
    }

    fn create_buffer(&self, desc: &BufDesc, _name: &str) -> Result<vk::Buffer, AllocationError> {
        let mut state = lock(&self.state);
        if desc.size == 0 {
            return Err(AllocationError::ZeroSized);
        }
        if state.fail_allocations {
            return Err(AllocationError::Allocator(
                "headless allocation failure".to_owned(),
            ));
        }
        let buffer = vk::Buffer::from_raw(state.handle());
        state.buffers.insert(buffer, *desc);
        Ok(buffer)
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        let mut state = lock(&self.state);
        assert!(
            state.buffers.remove(&buffer).is_some(),
            "destroying unknown buffer {buffer:?}"
        );
        state.destroyed.push(ReleasableKind::Buffer(buffer));
    }

    fn create_image(&self, desc: &ImgDesc, _name: &str) -> Result<vk::Image, AllocationError> {
        let mut state = lock(&self.state);
        if desc.extent.width == 0 || desc.extent.height == 0 || desc.extent.depth == 0 {
            return Err(AllocationError::ZeroSized);
        }
        if state.fail_allocations {
            return Err(AllocationError::Allocator(
                "headless allocation failure".to_owned(),
            ));
        }
        let image = vk::Image::from_raw(state.handle());
        state.images.insert(image, *desc);
        Ok(image)
    }

    fn destroy_image(&self, image: vk::Image) {
        let mut state = lock(&self.state);
        assert!(
            state.images.remove(&image).is_some(),
            "destroying unknown image {image:?}"
        );
        state.destroyed.push(ReleasableKind::Image(image));
    }

    fn create_image_view(
        &self,
        image: vk::Image,
        _desc: &ImgViewDesc,
    ) -> Result<vk::ImageView, vk::Result> {
        let mut state = lock(&self.state);
        assert!(state.images.contains_key(&image), "view of unknown image");
        let view = vk::ImageView::from_raw(state.handle());
        state.views.insert(view);
        Ok(view)
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        let mut state = lock(&self.state);
        state.views.remove(&view);
        state.destroyed.push(ReleasableKind::ImageView(view));
    }

    fn device_wait_idle(&self) -> Result<(), vk::Result> {
        let mut state = lock(&self.state);
        if state.lost {
            return Err(vk::Result::ERROR_DEVICE_LOST);
        }
        for fence in state.fences.values_mut() {
            if *fence == FenceState::Pending {
                *fence = FenceState::Signaled;
            }
        }
        Ok(())
    }
}
