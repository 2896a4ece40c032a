use ash::vk;

use thiserror::Error;

///Reasons a native buffer or image could not be created.
#[derive(Error, Debug)]
pub enum AllocationError {
    #[error("Vulkan error: {0}")]
    VkError(#[from] vk::Result),
    #[error("Memory allocator failed: {0}")]
    Allocator(String),
    #[error("Zero sized allocation requested")]
    ZeroSized,
}

#[derive(Error, Debug)]
pub enum GfxError {
    #[error("Vulkan error: {0}")]
    VkError(#[from] vk::Result),
    #[error("Allocating {name} failed: {source}")]
    Allocation {
        name: String,
        #[source]
        source: AllocationError,
    },
    #[error("Device was lost")]
    DeviceLost,
}

impl GfxError {
    ///Maps a raw native result onto [GfxError::DeviceLost] where applicable.
    pub fn from_native(res: vk::Result) -> Self {
        if res == vk::Result::ERROR_DEVICE_LOST {
            GfxError::DeviceLost
        } else {
            GfxError::VkError(res)
        }
    }
}
