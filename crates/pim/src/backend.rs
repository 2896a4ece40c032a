//! # Backend
//!
//! Every native call pim issues goes through the object-safe [Backend] trait. The context, the recorder and the
//! reclamation queue only ever see this trait, which keeps device bring-up (and the memory allocator) outside of the
//! synchronization core.
//!
//! Two implementations exist:
//! - [AshBackend](ash_backend::AshBackend) wraps an [ash::Device] and a `gpu-allocator` instance. Enabled through the
//!   `default_allocator` feature.
//! - [HeadlessBackend](headless::HeadlessBackend) records all calls and simulates fence completion. Enabled through
//!   the `headless` feature and used by the test suites.

use ash::vk;

use crate::{
    error::AllocationError,
    resources::{BufDesc, ImgDesc, ImgViewDesc},
};

#[cfg(feature = "default_allocator")]
pub mod ash_backend;

#[cfg(any(test, feature = "headless"))]
pub mod headless;

///State of a fence as reported by the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FenceStatus {
    Signaled,
    Unsignaled,
    ///The device was lost. Nothing will ever be signaled again, so anything waiting on this fence can proceed.
    Lost,
}

impl FenceStatus {
    ///True if nothing on the GPU can still be running behind this fence.
    pub fn is_retired(&self) -> bool {
        !matches!(self, FenceStatus::Unsignaled)
    }
}

///A semaphore wait attached to a submission.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SemaphoreWait {
    pub semaphore: vk::Semaphore,
    pub stage: vk::PipelineStageFlags2,
}

///Everything needed to submit a single command buffer.
#[derive(Clone, Copy, Debug)]
pub struct Submission<'a> {
    pub cmd: vk::CommandBuffer,
    pub fence: vk::Fence,
    pub waits: &'a [SemaphoreWait],
    pub signals: &'a [vk::Semaphore],
}

///The native API seam. All methods map one-to-one to Vulkan calls (or a small group of calls).
///
/// Waits are unbounded. Device loss is reported through [FenceStatus::Lost] and `ERROR_DEVICE_LOST` results.
pub trait Backend: Send + Sync + 'static {
    fn create_fence(&self, signaled: bool) -> Result<vk::Fence, vk::Result>;
    fn destroy_fence(&self, fence: vk::Fence);
    fn fence_status(&self, fence: vk::Fence) -> FenceStatus;
    ///Blocks until `fence` is signaled.
    fn wait_fence(&self, fence: vk::Fence) -> Result<(), vk::Result>;
    fn reset_fence(&self, fence: vk::Fence) -> Result<(), vk::Result>;

    fn create_semaphore(&self) -> Result<vk::Semaphore, vk::Result>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    fn create_command_pool(&self, family: u32) -> Result<vk::CommandPool, vk::Result>;
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    fn reset_command_pool(&self, pool: vk::CommandPool) -> Result<(), vk::Result>;
    ///Allocates a single primary command buffer from `pool`.
    fn allocate_command_buffer(
        &self,
        pool: vk::CommandPool,
    ) -> Result<vk::CommandBuffer, vk::Result>;
    fn begin_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<(), vk::Result>;
    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<(), vk::Result>;

    ///Records a single `vkCmdPipelineBarrier2` with the given barriers.
    fn cmd_pipeline_barrier2(
        &self,
        cmd: vk::CommandBuffer,
        images: &[vk::ImageMemoryBarrier2<'_>],
        buffers: &[vk::BufferMemoryBarrier2<'_>],
    );

    fn queue_submit(&self, queue: vk::Queue, submission: &Submission<'_>)
    -> Result<(), vk::Result>;

    ///Creates a buffer and binds freshly allocated memory to it.
    fn create_buffer(&self, desc: &BufDesc, name: &str) -> Result<vk::Buffer, AllocationError>;
    ///Destroys the buffer and frees its memory.
    fn destroy_buffer(&self, buffer: vk::Buffer);
    ///Creates an image in `UNDEFINED` layout and binds freshly allocated memory to it.
    fn create_image(&self, desc: &ImgDesc, name: &str) -> Result<vk::Image, AllocationError>;
    ///Destroys the image and frees its memory.
    fn destroy_image(&self, image: vk::Image);
    fn create_image_view(
        &self,
        image: vk::Image,
        desc: &ImgViewDesc,
    ) -> Result<vk::ImageView, vk::Result>;
    fn destroy_image_view(&self, view: vk::ImageView);

    fn device_wait_idle(&self) -> Result<(), vk::Result>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lost_counts_as_retired() {
        assert!(FenceStatus::Signaled.is_retired());
        assert!(FenceStatus::Lost.is_retired());
        assert!(!FenceStatus::Unsignaled.is_retired());
    }
}
