//! Render pass abstraction.
//!
//! A [RenderPass] declares in [RenderPass::setup] which named resources it reads and writes, with the stage, access
//! and layout of every use. The frame graph resolves the names to physical resources, records all barriers the
//! declared uses need and then calls [RenderPass::execute] with a command buffer in which those uses are legal.

use pim::{
    ash::vk,
    command::CmdBuf,
    queue::QueueId,
    resources::{aspect_for, BufDesc, Buffer, Image, ImageType, ImgDesc, MemoryUsage},
    Context,
};
use pim_commands::has_write;
use slotmap::SlotMap;
use smallvec::SmallVec;

use crate::{
    graph::{Logical, LogicalTables, PhysicalBuffer, PhysicalBufferKey, PhysicalImage, PhysicalImageKey},
    subresource::SubRange,
};

///Logical buffer of the frame it was declared in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferHandle {
    pub(crate) index: u32,
    pub(crate) frame: u32,
}

///Logical image of the frame it was declared in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ImageHandle {
    pub(crate) index: u32,
    pub(crate) frame: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferInfo {
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub memory: MemoryUsage,
}

impl BufferInfo {
    pub fn new(size: vk::DeviceSize, usage: vk::BufferUsageFlags) -> Self {
        BufferInfo {
            size,
            usage,
            memory: MemoryUsage::GpuOnly,
        }
    }

    pub fn with_memory(mut self, memory: MemoryUsage) -> Self {
        self.memory = memory;
        self
    }

    pub fn desc(&self) -> BufDesc {
        BufDesc {
            size: self.size,
            usage: self.usage,
            memory: self.memory,
        }
    }
}

///Extent of a graph image.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Scaling {
    Absolute(vk::Extent3D),
    ///Fraction of [GraphConfig::display_size](crate::GraphConfig::display_size).
    DisplayRelative { x: f32, y: f32 },
}

impl Scaling {
    pub fn resolve(&self, display: vk::Extent2D) -> vk::Extent3D {
        match self {
            Scaling::Absolute(extent) => *extent,
            Scaling::DisplayRelative { x, y } => vk::Extent3D {
                width: ((display.width as f32 * x).ceil() as u32).max(1),
                height: ((display.height as f32 * y).ceil() as u32).max(1),
                depth: 1,
            },
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ImageInfo {
    pub img_type: ImageType,
    pub format: vk::Format,
    pub scaling: Scaling,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub samples: vk::SampleCountFlags,
    pub usage: vk::ImageUsageFlags,
}

impl ImageInfo {
    ///2d render target. Color or depth/stencil attachment usage is derived from `format`.
    pub fn attachment(format: vk::Format, scaling: Scaling) -> Self {
        let usage = if aspect_for(format).contains(vk::ImageAspectFlags::COLOR) {
            vk::ImageUsageFlags::COLOR_ATTACHMENT
        } else {
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT
        };
        ImageInfo {
            img_type: ImageType::Tex2d,
            format,
            scaling,
            mip_levels: 1,
            array_layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            usage,
        }
    }

    ///2d storage image.
    pub fn storage(format: vk::Format, scaling: Scaling) -> Self {
        ImageInfo {
            usage: vk::ImageUsageFlags::STORAGE,
            ..ImageInfo::attachment(format, scaling)
        }
    }

    pub fn with_usage(mut self, usage: vk::ImageUsageFlags) -> Self {
        self.usage |= usage;
        self
    }

    pub fn with_mips(mut self, mip_levels: u32) -> Self {
        self.mip_levels = mip_levels;
        self
    }

    pub fn with_layers(mut self, array_layers: u32) -> Self {
        self.array_layers = array_layers;
        self
    }

    pub fn desc(&self, display: vk::Extent2D) -> ImgDesc {
        ImgDesc {
            img_type: self.img_type,
            format: self.format,
            extent: self.scaling.resolve(display),
            mip_levels: self.mip_levels,
            array_layers: self.array_layers,
            samples: self.samples,
            usage: self.usage,
            memory: MemoryUsage::GpuOnly,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Target {
    Buffer(u32),
    Image { index: u32, range: Option<SubRange> },
}

///One declared use of a logical resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Access {
    pub(crate) target: Target,
    pub(crate) stage: vk::PipelineStageFlags2,
    pub(crate) access: vk::AccessFlags2,
    pub(crate) layout: vk::ImageLayout,
}

pub trait RenderPass {
    fn name(&self) -> &str;

    ///Queue the pass records on.
    fn queue(&self) -> QueueId {
        QueueId::Graphics
    }

    ///Declares all resources and their uses. Returning false skips the pass for this frame, nothing it declared is
    /// kept.
    fn setup(&mut self, builder: &mut PassBuilder) -> bool;

    ///Records the pass. Every use declared in `setup` is legal at this point.
    fn execute(&mut self, ctx: &mut PassContext);
}

///Declaration interface handed to [RenderPass::setup].
pub struct PassBuilder<'a> {
    pub(crate) tables: &'a mut LogicalTables,
    pub(crate) accesses: &'a mut SmallVec<[Access; 8]>,
    pub(crate) pass: usize,
    pub(crate) queue: QueueId,
    pub(crate) frame: u32,
    pub(crate) display_size: vk::Extent2D,
}

impl PassBuilder<'_> {
    pub fn queue(&self) -> QueueId {
        self.queue
    }

    pub fn display_size(&self) -> vk::Extent2D {
        self.display_size
    }

    ///Declares the buffer `name`. Declarations of the same name within a frame are merged, sizes take the maximum and
    /// usages are combined.
    pub fn buffer(&mut self, name: &str, info: BufferInfo) -> BufferHandle {
        let desc = info.desc();
        let index = match self.tables.buffer_names.get(name) {
            Some(&index) => {
                self.tables.buffers[index as usize].merge(&desc);
                index
            }
            None => {
                let index = self.tables.buffers.len() as u32;
                self.tables.buffers.push(Logical::new(name, desc));
                self.tables.buffer_names.insert(name.to_owned(), index);
                index
            }
        };
        BufferHandle {
            index,
            frame: self.frame,
        }
    }

    ///Declares the image `name`. Declarations of the same name within a frame are merged by combining usages. Format,
    /// extent, mip and layer counts have to agree.
    pub fn image(&mut self, name: &str, info: ImageInfo) -> ImageHandle {
        let desc = info.desc(self.display_size);
        let index = match self.tables.image_names.get(name) {
            Some(&index) => {
                self.tables.images[index as usize].merge(&desc);
                index
            }
            None => {
                let index = self.tables.images.len() as u32;
                self.tables.images.push(Logical::new(name, desc));
                self.tables.image_names.insert(name.to_owned(), index);
                index
            }
        };
        ImageHandle {
            index,
            frame: self.frame,
        }
    }

    fn buffer_access(
        &mut self,
        handle: BufferHandle,
        stage: vk::PipelineStageFlags2,
        access: vk::AccessFlags2,
        write: bool,
    ) -> &mut Self {
        assert!(
            handle.frame == self.frame && (handle.index as usize) < self.tables.buffers.len(),
            "buffer handle {handle:?} was not declared in frame {}",
            self.frame
        );
        self.tables.buffers[handle.index as usize].used_by(self.pass, self.queue, write);
        self.accesses.push(Access {
            target: Target::Buffer(handle.index),
            stage,
            access,
            layout: vk::ImageLayout::UNDEFINED,
        });
        self
    }

    fn image_access(
        &mut self,
        handle: ImageHandle,
        stage: vk::PipelineStageFlags2,
        access: vk::AccessFlags2,
        layout: vk::ImageLayout,
        range: Option<SubRange>,
        write: bool,
    ) -> &mut Self {
        assert!(
            handle.frame == self.frame && (handle.index as usize) < self.tables.images.len(),
            "image handle {handle:?} was not declared in frame {}",
            self.frame
        );
        self.tables.images[handle.index as usize].used_by(self.pass, self.queue, write);
        self.accesses.push(Access {
            target: Target::Image {
                index: handle.index,
                range,
            },
            stage,
            access,
            layout,
        });
        self
    }

    pub fn read_buffer(
        &mut self,
        handle: BufferHandle,
        stage: vk::PipelineStageFlags2,
        access: vk::AccessFlags2,
    ) -> &mut Self {
        assert!(!has_write(access), "read_buffer with write access {access:?}");
        self.buffer_access(handle, stage, access, false)
    }

    pub fn write_buffer(
        &mut self,
        handle: BufferHandle,
        stage: vk::PipelineStageFlags2,
        access: vk::AccessFlags2,
    ) -> &mut Self {
        self.buffer_access(handle, stage, access, true)
    }

    pub fn read_image(
        &mut self,
        handle: ImageHandle,
        stage: vk::PipelineStageFlags2,
        access: vk::AccessFlags2,
        layout: vk::ImageLayout,
    ) -> &mut Self {
        assert!(!has_write(access), "read_image with write access {access:?}");
        self.image_access(handle, stage, access, layout, None, false)
    }

    pub fn write_image(
        &mut self,
        handle: ImageHandle,
        stage: vk::PipelineStageFlags2,
        access: vk::AccessFlags2,
        layout: vk::ImageLayout,
    ) -> &mut Self {
        self.image_access(handle, stage, access, layout, None, true)
    }

    ///Reads only `range` of the image. The image is tracked per subresource while its parts differ.
    pub fn read_image_range(
        &mut self,
        handle: ImageHandle,
        stage: vk::PipelineStageFlags2,
        access: vk::AccessFlags2,
        layout: vk::ImageLayout,
        range: SubRange,
    ) -> &mut Self {
        assert!(!has_write(access), "read_image_range with write access {access:?}");
        self.image_access(handle, stage, access, layout, Some(range), false)
    }

    pub fn write_image_range(
        &mut self,
        handle: ImageHandle,
        stage: vk::PipelineStageFlags2,
        access: vk::AccessFlags2,
        layout: vk::ImageLayout,
        range: SubRange,
    ) -> &mut Self {
        self.image_access(handle, stage, access, layout, Some(range), true)
    }
}

///Recording interface handed to [RenderPass::execute].
pub struct PassContext<'a> {
    pub ctx: &'a Context,
    ///Open command buffer on the pass's queue.
    pub cmd: CmdBuf,
    pub(crate) frame: u32,
    pub(crate) tables: &'a LogicalTables,
    pub(crate) buffers: &'a SlotMap<PhysicalBufferKey, PhysicalBuffer>,
    pub(crate) images: &'a SlotMap<PhysicalImageKey, PhysicalImage>,
}

impl PassContext<'_> {
    pub fn frame(&self) -> u32 {
        self.frame
    }

    ///Physical buffer behind `handle` for this frame.
    pub fn buffer(&self, handle: BufferHandle) -> &Buffer {
        assert!(
            handle.frame == self.frame,
            "buffer handle {handle:?} was not declared in frame {}",
            self.frame
        );
        let logical = &self.tables.buffers[handle.index as usize];
        match logical.physical.and_then(|key| self.buffers.get(key)) {
            Some(physical) => &physical.set.current(self.frame).buffer,
            None => panic!("buffer {} has no physical resource", logical.name),
        }
    }

    ///Physical image behind `handle` for this frame.
    pub fn image(&self, handle: ImageHandle) -> &Image {
        assert!(
            handle.frame == self.frame,
            "image handle {handle:?} was not declared in frame {}",
            self.frame
        );
        let logical = &self.tables.images[handle.index as usize];
        match logical.physical.and_then(|key| self.images.get(key)) {
            Some(physical) => &physical.set.current(self.frame).image,
            None => panic!("image {} has no physical resource", logical.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_relative_rounds_up() {
        let display = vk::Extent2D {
            width: 1919,
            height: 1080,
        };
        let half = Scaling::DisplayRelative { x: 0.5, y: 0.5 }.resolve(display);
        assert_eq!((half.width, half.height, half.depth), (960, 540, 1));
        let tiny = Scaling::DisplayRelative { x: 0.0, y: 0.0 }.resolve(display);
        assert_eq!((tiny.width, tiny.height), (1, 1));
    }

    #[test]
    fn attachment_usage_follows_format() {
        let scaling = Scaling::DisplayRelative { x: 1.0, y: 1.0 };
        assert_eq!(
            ImageInfo::attachment(vk::Format::R16G16B16A16_SFLOAT, scaling).usage,
            vk::ImageUsageFlags::COLOR_ATTACHMENT
        );
        assert_eq!(
            ImageInfo::attachment(vk::Format::D32_SFLOAT, scaling).usage,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT
        );
    }
}
