use pim::{
    ash::vk,
    command::CmdBuf,
    Context,
};
use tinyvec::TinyVec;

///Barrier building helper. Collects image and buffer barriers via a simple builder API and records all of them through
/// a single `vkCmdPipelineBarrier2`.
///
/// Uses tinyvec internally. [Self::STACK_ALLOCATION] barriers per type live on the stack, the builder can outgrow
/// that value however.
#[derive(Debug, Default, Clone)]
pub struct BarrierBuilder {
    pub images: TinyVec<[vk::ImageMemoryBarrier2<'static>; Self::STACK_ALLOCATION]>,
    pub buffers: TinyVec<[vk::BufferMemoryBarrier2<'static>; Self::STACK_ALLOCATION]>,
}

impl BarrierBuilder {
    ///Barriers of each kind kept inline before spilling to the heap.
    pub const STACK_ALLOCATION: usize = 6;

    pub fn new() -> Self {
        Self::default()
    }

    ///Adds a buffer barrier. Pass the same family twice (or `QUEUE_FAMILY_IGNORED`) for a barrier without ownership
    /// transfer.
    ///
    /// # Safety
    ///
    /// `buffer` has to stay alive until the barrier executed.
    /// This is not enforced by this object since it is dropped whenever the commandbuffer is build.
    #[allow(clippy::too_many_arguments)]
    pub fn buffer_barrier(
        &mut self,
        buffer: vk::Buffer,
        offset: u64,
        size: u64,
        src_access_mask: vk::AccessFlags2,
        src_pipeline_stage: vk::PipelineStageFlags2,
        src_queue_family: u32,
        dst_access_mask: vk::AccessFlags2,
        dst_pipeline_stage: vk::PipelineStageFlags2,
        dst_queue_family: u32,
    ) -> &mut Self {
        let item = vk::BufferMemoryBarrier2::default()
            .buffer(buffer)
            .src_access_mask(src_access_mask)
            .src_stage_mask(src_pipeline_stage)
            .src_queue_family_index(src_queue_family)
            .dst_access_mask(dst_access_mask)
            .dst_stage_mask(dst_pipeline_stage)
            .dst_queue_family_index(dst_queue_family)
            .offset(offset)
            .size(size);

        #[cfg(feature = "logging")]
        log::trace!(
            "buffer[{:?}] {:?}@{:?} -> {:?}@{:?}",
            buffer,
            src_access_mask,
            src_pipeline_stage,
            dst_access_mask,
            dst_pipeline_stage
        );

        self.buffers.push(item);
        self
    }

    ///Adds an image barrier.
    ///
    /// # Safety
    ///
    /// Make sure that the `image` handle is alive until the barrier is used on the GPU. See [Self::buffer_barrier].
    #[allow(clippy::too_many_arguments)]
    pub fn image_barrier(
        &mut self,
        image: vk::Image,
        subresource_range: vk::ImageSubresourceRange,
        src_access_mask: vk::AccessFlags2,
        src_pipeline_stage: vk::PipelineStageFlags2,
        src_layout: vk::ImageLayout,
        src_queue_family: u32,
        dst_access_mask: vk::AccessFlags2,
        dst_pipeline_stage: vk::PipelineStageFlags2,
        dst_layout: vk::ImageLayout,
        dst_queue_family: u32,
    ) -> &mut Self {
        let item = vk::ImageMemoryBarrier2::default()
            .image(image)
            .subresource_range(subresource_range)
            .src_access_mask(src_access_mask)
            .src_stage_mask(src_pipeline_stage)
            .src_queue_family_index(src_queue_family)
            .old_layout(src_layout)
            .dst_access_mask(dst_access_mask)
            .dst_stage_mask(dst_pipeline_stage)
            .dst_queue_family_index(dst_queue_family)
            .new_layout(dst_layout);

        #[cfg(feature = "logging")]
        log::trace!(
            "image[{:?}] {:?} -> {:?} (mips {}+{}, layers {}+{})",
            image,
            src_layout,
            dst_layout,
            subresource_range.base_mip_level,
            subresource_range.level_count,
            subresource_range.base_array_layer,
            subresource_range.layer_count
        );

        self.images.push(item);
        self
    }

    pub fn image_custom_barrier(&mut self, barrier: vk::ImageMemoryBarrier2<'static>) -> &mut Self {
        self.images.push(barrier);
        self
    }

    pub fn buffer_custom_barrier(
        &mut self,
        barrier: vk::BufferMemoryBarrier2<'static>,
    ) -> &mut Self {
        self.buffers.push(barrier);
        self
    }

    ///Returns a dependency info over the currently pushed barriers.
    pub fn as_dependency_info(&self) -> vk::DependencyInfo<'_> {
        vk::DependencyInfo::default()
            .image_memory_barriers(self.images.as_slice())
            .buffer_memory_barriers(self.buffers.as_slice())
    }

    ///Returns true if at least one barrier has been added.
    pub fn has_barrier(&self) -> bool {
        !self.images.is_empty() || !self.buffers.is_empty()
    }

    ///Number of barriers of both types.
    pub fn len(&self) -> usize {
        self.images.len() + self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_barrier()
    }

    pub fn clear(&mut self) {
        self.images.clear();
        self.buffers.clear();
    }

    ///Records all barriers into `cmd` as one pipeline barrier. Does nothing if the builder is empty.
    pub fn record(&self, ctx: &Context, cmd: &CmdBuf) {
        if !self.has_barrier() {
            return;
        }
        ctx.cmd_barrier(cmd, self.images.as_slice(), self.buffers.as_slice());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pim::{backend::headless::HeadlessBackend, queue::QueueId, GfxConfig};
    use static_assertions::assert_impl_all;
    use std::sync::Arc;

    #[test]
    fn impl_send_sync() {
        assert_impl_all!(BarrierBuilder: Send, Sync);
    }

    fn range() -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        }
    }

    #[test]
    fn grows_past_stack() {
        let mut builder = BarrierBuilder::new();
        for _ in 0..(BarrierBuilder::STACK_ALLOCATION + 2) {
            builder.image_barrier(
                vk::Image::null(),
                range(),
                vk::AccessFlags2::NONE,
                vk::PipelineStageFlags2::TOP_OF_PIPE,
                vk::ImageLayout::UNDEFINED,
                vk::QUEUE_FAMILY_IGNORED,
                vk::AccessFlags2::SHADER_READ,
                vk::PipelineStageFlags2::FRAGMENT_SHADER,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::QUEUE_FAMILY_IGNORED,
            );
        }
        assert_eq!(builder.len(), BarrierBuilder::STACK_ALLOCATION + 2);
        assert_eq!(
            builder.as_dependency_info().image_memory_barrier_count as usize,
            BarrierBuilder::STACK_ALLOCATION + 2
        );
    }

    #[test]
    fn records_single_pipeline_barrier() {
        let backend = Arc::new(HeadlessBackend::new());
        let ctx = Context::headless(backend.clone(), GfxConfig::default()).unwrap();
        let cmd = ctx.cmd_get(QueueId::Graphics, 0).unwrap();

        //empty builders record nothing
        BarrierBuilder::new().record(&ctx, &cmd);
        assert!(backend.barriers().is_empty());

        let mut builder = BarrierBuilder::new();
        builder
            .buffer_barrier(
                vk::Buffer::null(),
                0,
                vk::WHOLE_SIZE,
                vk::AccessFlags2::TRANSFER_WRITE,
                vk::PipelineStageFlags2::COPY,
                vk::QUEUE_FAMILY_IGNORED,
                vk::AccessFlags2::UNIFORM_READ,
                vk::PipelineStageFlags2::VERTEX_SHADER,
                vk::QUEUE_FAMILY_IGNORED,
            )
            .image_barrier(
                vk::Image::null(),
                range(),
                vk::AccessFlags2::NONE,
                vk::PipelineStageFlags2::TOP_OF_PIPE,
                vk::ImageLayout::UNDEFINED,
                vk::QUEUE_FAMILY_IGNORED,
                vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
                vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                vk::QUEUE_FAMILY_IGNORED,
            );
        builder.record(&ctx, &cmd);

        let log = backend.barriers();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].cmd, cmd.handle);
        assert_eq!(log[0].images.len(), 1);
        assert_eq!(log[0].buffers.len(), 1);
        assert_eq!(
            log[0].images[0].new_layout,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        );
        ctx.cmd_submit(cmd, None, None).unwrap();
    }
}
