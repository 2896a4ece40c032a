//! [Backend] over a real Vulkan device. Memory is managed by `gpu-allocator`. The device must have been created with
//! `synchronization2` enabled.

use std::{mem::ManuallyDrop, sync::Mutex};

use ahash::AHashMap;
use ash::vk;
use gpu_allocator::{
    vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc},
    AllocationSizes, AllocatorDebugSettings, MemoryLocation,
};

use crate::{
    error::AllocationError,
    lock,
    resources::{BufDesc, ImageType, ImgDesc, ImgViewDesc, MemoryUsage},
};

use super::{Backend, FenceStatus, Submission};

pub fn memory_usage_to_location(usage: MemoryUsage) -> MemoryLocation {
    match usage {
        MemoryUsage::CpuToGpu => MemoryLocation::CpuToGpu,
        MemoryUsage::GpuOnly => MemoryLocation::GpuOnly,
        MemoryUsage::GpuToCpu => MemoryLocation::GpuToCpu,
    }
}

fn allocator_error(err: gpu_allocator::AllocationError) -> AllocationError {
    AllocationError::Allocator(err.to_string())
}

pub struct AshBackend {
    pub device: ash::Device,
    allocator: ManuallyDrop<Mutex<Allocator>>,
    buffers: Mutex<AHashMap<vk::Buffer, Allocation>>,
    images: Mutex<AHashMap<vk::Image, Allocation>>,
}

impl AshBackend {
    ///Takes ownership of `device`. The device is destroyed when the backend is dropped.
    pub fn new(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: ash::Device,
    ) -> Result<Self, AllocationError> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: AllocatorDebugSettings::default(),
            buffer_device_address: false,
            allocation_sizes: AllocationSizes::default(),
        })
        .map_err(allocator_error)?;

        Ok(AshBackend {
            device,
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            buffers: Mutex::new(AHashMap::default()),
            images: Mutex::new(AHashMap::default()),
        })
    }

    fn allocate(
        &self,
        name: &str,
        requirements: vk::MemoryRequirements,
        usage: MemoryUsage,
        linear: bool,
    ) -> Result<Allocation, AllocationError> {
        lock(&self.allocator)
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location: memory_usage_to_location(usage),
                linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(allocator_error)
    }

    fn free(&self, allocation: Allocation) {
        if let Err(_e) = lock(&self.allocator).free(allocation) {
            #[cfg(feature = "logging")]
            log::error!("Failed to free allocation: {_e}");
        }
    }
}

impl Backend for AshBackend {
    fn create_fence(&self, signaled: bool) -> Result<vk::Fence, vk::Result> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        unsafe {
            self.device
                .create_fence(&vk::FenceCreateInfo::default().flags(flags), None)
        }
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) }
    }

    fn fence_status(&self, fence: vk::Fence) -> FenceStatus {
        match unsafe { self.device.get_fence_status(fence) } {
            Ok(true) => FenceStatus::Signaled,
            Ok(false) => FenceStatus::Unsignaled,
            Err(vk::Result::ERROR_DEVICE_LOST) => FenceStatus::Lost,
            Err(_e) => {
                #[cfg(feature = "logging")]
                log::error!("Querying fence {fence:?} failed: {_e}");
                FenceStatus::Unsignaled
            }
        }
    }

    fn wait_fence(&self, fence: vk::Fence) -> Result<(), vk::Result> {
        unsafe { self.device.wait_for_fences(&[fence], true, u64::MAX) }
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<(), vk::Result> {
        unsafe { self.device.reset_fences(&[fence]) }
    }

    fn create_semaphore(&self) -> Result<vk::Semaphore, vk::Result> {
        unsafe {
            self.device
                .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)
        }
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) }
    }

    fn create_command_pool(&self, family: u32) -> Result<vk::CommandPool, vk::Result> {
        let info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        unsafe { self.device.create_command_pool(&info, None) }
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) }
    }

    fn reset_command_pool(&self, pool: vk::CommandPool) -> Result<(), vk::Result> {
        unsafe {
            self.device
                .reset_command_pool(pool, vk::CommandPoolResetFlags::empty())
        }
    }

    fn allocate_command_buffer(
        &self,
        pool: vk::CommandPool,
    ) -> Result<vk::CommandBuffer, vk::Result> {
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let mut cmds = unsafe { self.device.allocate_command_buffers(&info)? };
        cmds.pop().ok_or(vk::Result::ERROR_UNKNOWN)
    }

    fn begin_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<(), vk::Result> {
        let info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.begin_command_buffer(cmd, &info) }
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<(), vk::Result> {
        unsafe { self.device.end_command_buffer(cmd) }
    }

    fn cmd_pipeline_barrier2(
        &self,
        cmd: vk::CommandBuffer,
        images: &[vk::ImageMemoryBarrier2<'_>],
        buffers: &[vk::BufferMemoryBarrier2<'_>],
    ) {
        let dep = vk::DependencyInfo::default()
            .image_memory_barriers(images)
            .buffer_memory_barriers(buffers);
        unsafe { self.device.cmd_pipeline_barrier2(cmd, &dep) }
    }

    fn queue_submit(
        &self,
        queue: vk::Queue,
        submission: &Submission<'_>,
    ) -> Result<(), vk::Result> {
        let waits = submission
            .waits
            .iter()
            .map(|wait| {
                vk::SemaphoreSubmitInfo::default()
                    .semaphore(wait.semaphore)
                    .stage_mask(wait.stage)
            })
            .collect::<smallvec::SmallVec<[_; 4]>>();
        let signals = submission
            .signals
            .iter()
            .map(|signal| {
                vk::SemaphoreSubmitInfo::default()
                    .semaphore(*signal)
                    .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            })
            .collect::<smallvec::SmallVec<[_; 4]>>();
        let cmds = [vk::CommandBufferSubmitInfo::default().command_buffer(submission.cmd)];
        let submit = vk::SubmitInfo2::default()
            .wait_semaphore_infos(&waits)
            .signal_semaphore_infos(&signals)
            .command_buffer_infos(&cmds);

        unsafe {
            self.device
                .queue_submit2(queue, &[submit], submission.fence)
        }
    }

    fn create_buffer(&self, desc: &BufDesc, name: &str) -> Result<vk::Buffer, AllocationError> {
        if desc.size == 0 {
            return Err(AllocationError::ZeroSized);
        }
        let info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { self.device.create_buffer(&info, None)? };
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let allocation = match self.allocate(name, requirements, desc.memory, true) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };
        if let Err(e) = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        } {
            unsafe { self.device.destroy_buffer(buffer, None) };
            self.free(allocation);
            return Err(e.into());
        }

        lock(&self.buffers).insert(buffer, allocation);
        Ok(buffer)
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        unsafe { self.device.destroy_buffer(buffer, None) };
        if let Some(allocation) = lock(&self.buffers).remove(&buffer) {
            self.free(allocation);
        }
    }

    fn create_image(&self, desc: &ImgDesc, name: &str) -> Result<vk::Image, AllocationError> {
        if desc.extent.width == 0 || desc.extent.height == 0 || desc.extent.depth == 0 {
            return Err(AllocationError::ZeroSized);
        }
        let flags = if desc.img_type == ImageType::Cube {
            vk::ImageCreateFlags::CUBE_COMPATIBLE
        } else {
            vk::ImageCreateFlags::empty()
        };
        let info = vk::ImageCreateInfo::default()
            .flags(flags)
            .image_type(desc.img_type.into())
            .format(desc.format)
            .extent(desc.extent)
            .mip_levels(desc.mip_levels)
            .array_layers(desc.array_layers)
            .samples(desc.samples)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { self.device.create_image(&info, None)? };
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let allocation = match self.allocate(name, requirements, desc.memory, false) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(e);
            }
        };
        if let Err(e) = unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        } {
            unsafe { self.device.destroy_image(image, None) };
            self.free(allocation);
            return Err(e.into());
        }

        lock(&self.images).insert(image, allocation);
        Ok(image)
    }

    fn destroy_image(&self, image: vk::Image) {
        unsafe { self.device.destroy_image(image, None) };
        if let Some(allocation) = lock(&self.images).remove(&image) {
            self.free(allocation);
        }
    }

    fn create_image_view(
        &self,
        image: vk::Image,
        desc: &ImgViewDesc,
    ) -> Result<vk::ImageView, vk::Result> {
        let info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(desc.view_type)
            .format(desc.format)
            .subresource_range(desc.range);
        unsafe { self.device.create_image_view(&info, None) }
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        unsafe { self.device.destroy_image_view(view, None) }
    }

    fn device_wait_idle(&self) -> Result<(), vk::Result> {
        unsafe { self.device.device_wait_idle() }
    }
}

impl Drop for AshBackend {
    fn drop(&mut self) {
        let _ = unsafe { self.device.device_wait_idle() };
        let buffers: Vec<_> = lock(&self.buffers).drain().collect();
        for (buffer, allocation) in buffers {
            unsafe { self.device.destroy_buffer(buffer, None) };
            self.free(allocation);
        }
        let images: Vec<_> = lock(&self.images).drain().collect();
        for (image, allocation) in images {
            unsafe { self.device.destroy_image(image, None) };
            self.free(allocation);
        }
        #[cfg(feature = "logging")]
        log::trace!("Destroying device");
        //the allocator has to go before the device
        unsafe {
            ManuallyDrop::drop(&mut self.allocator);
            self.device.destroy_device(None);
        }
    }
}
