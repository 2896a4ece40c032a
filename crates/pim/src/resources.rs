//! Allocatable resources. Mostly [Image] and [Buffer].
//!
//! Neither type destroys its native handle directly. When dropped (or explicitly released) both hand their handles to
//! the device's [ReleaseQueue](crate::release::ReleaseQueue), which destroys them once no in-flight submission can
//! still reference them.

mod buffer;
pub use buffer::{BufDesc, Buffer};

mod image;
pub use image::{aspect_for, range_eq, ImageType, ImgDesc, ImgViewDesc, Image};

mod set;
pub use set::FrameSet;

///Types of memory usage. Make sure to use GpuOnly wherever it applies to get optimal performance.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum MemoryUsage {
    GpuOnly,
    CpuToGpu,
    GpuToCpu,
}

impl Default for MemoryUsage {
    fn default() -> Self {
        MemoryUsage::GpuOnly
    }
}

///One buffer per frame in flight.
pub type BufferSet = FrameSet<Buffer>;
///One image per frame in flight.
pub type ImageSet = FrameSet<Image>;
