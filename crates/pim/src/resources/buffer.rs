use std::{
    hash::{Hash, Hasher},
    sync::Arc,
};

use ash::vk;

use crate::{
    context::Device,
    error::GfxError,
    release::{Releasable, ReleasableKind, ReleaseGate},
};

use super::MemoryUsage;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufDesc {
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub memory: MemoryUsage,
}

impl BufDesc {
    pub fn new(size: vk::DeviceSize, usage: vk::BufferUsageFlags) -> Self {
        BufDesc {
            size,
            usage,
            memory: MemoryUsage::GpuOnly,
        }
    }

    ///Host visible upload buffer.
    pub fn staging(size: vk::DeviceSize) -> Self {
        BufDesc {
            size,
            usage: vk::BufferUsageFlags::TRANSFER_SRC,
            memory: MemoryUsage::CpuToGpu,
        }
    }

    pub fn add_usage(mut self, usage: vk::BufferUsageFlags) -> Self {
        self.usage |= usage;
        self
    }
}

///Buffer with bound memory. The native handle is handed to the device's release queue when dropped.
pub struct Buffer {
    pub inner: vk::Buffer,
    pub desc: BufDesc,
    pub device: Arc<Device>,
}

///The hash implementation is based on [Buffer](ash::vk::Buffer)'s hash.
impl Hash for Buffer {
    fn hash<H: Hasher>(&self, hasher: &mut H) {
        self.inner.hash(hasher)
    }
}

impl Buffer {
    ///Creates a buffer for `desc`. On failure nothing is left behind and the error names the buffer.
    pub fn new(device: &Arc<Device>, desc: BufDesc, name: &str) -> Result<Self, GfxError> {
        let inner = device.backend.create_buffer(&desc, name).map_err(|source| {
            #[cfg(feature = "logging")]
            log::error!(
                "Failed to create buffer {name} (size={}, usage={:?}): {source}",
                desc.size,
                desc.usage
            );
            GfxError::Allocation {
                name: name.to_owned(),
                source,
            }
        })?;

        Ok(Buffer {
            inner,
            desc,
            device: device.clone(),
        })
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.desc.size
    }

    ///Makes sure the buffer can hold at least `size` bytes. Grows to at least twice the old size so repeated small
    /// growth stays amortized. The old buffer goes to the release queue.
    ///
    /// Returns true if a new buffer was allocated. Content is *not* copied.
    pub fn reserve(&mut self, size: vk::DeviceSize, name: &str) -> Result<bool, GfxError> {
        if self.desc.size >= size {
            return Ok(false);
        }

        let desc = BufDesc {
            size: size.max(self.desc.size.saturating_mul(2)),
            ..self.desc
        };
        let grown = Buffer::new(&self.device, desc, name)?;
        //old buffer is released on drop
        let _old = std::mem::replace(self, grown);
        Ok(true)
    }

    ///Releases the buffer once `fence` signals instead of after the frames-in-flight window.
    /// The fence stays owned by the caller and must outlive the release.
    pub fn release_after(mut self, fence: vk::Fence) {
        let inner = std::mem::replace(&mut self.inner, vk::Buffer::null());
        self.device.release(Releasable {
            kind: ReleasableKind::Buffer(inner),
            gate: ReleaseGate::Fence(fence),
        });
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if self.inner != vk::Buffer::null() {
            self.device.release(Releasable {
                kind: ReleasableKind::Buffer(self.inner),
                gate: ReleaseGate::Frame(self.device.frame()),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{backend::headless::HeadlessBackend, config::GfxConfig};
    use static_assertions::assert_impl_all;

    #[test]
    fn impl_send_sync() {
        assert_impl_all!(Buffer: Send, Sync);
    }

    #[test]
    fn reserve_grows_by_doubling() {
        let backend = Arc::new(HeadlessBackend::new());
        let device = Device::new(backend.clone(), GfxConfig::default());

        let mut buffer = Buffer::new(
            &device,
            BufDesc::new(64, vk::BufferUsageFlags::STORAGE_BUFFER),
            "grow",
        )
        .unwrap();
        assert!(!buffer.reserve(32, "grow").unwrap());
        assert_eq!(buffer.size(), 64);

        assert!(buffer.reserve(100, "grow").unwrap());
        assert_eq!(buffer.size(), 128);
        assert!(buffer.reserve(1000, "grow").unwrap());
        assert_eq!(buffer.size(), 1000);

        //two replaced buffers wait in the release queue, the current one is alive
        assert_eq!(device.pending_releases(), 2);
        assert_eq!(backend.live_buffers(), 3);
    }

    #[test]
    fn failed_allocation_names_buffer() {
        let backend = Arc::new(HeadlessBackend::new());
        let device = Device::new(backend.clone(), GfxConfig::default());
        backend.fail_allocations(true);

        match Buffer::new(&device, BufDesc::staging(16), "upload") {
            Err(GfxError::Allocation { name, .. }) => assert_eq!(name, "upload"),
            _ => panic!("expected allocation error"),
        }
        assert_eq!(device.pending_releases(), 0);
    }
}
