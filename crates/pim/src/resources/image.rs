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
pub enum ImageType {
    Tex1d,
    Tex2d,
    Tex3d,
    ///Six layers per cube. `array_layers` must be a multiple of six.
    Cube,
}

impl From<ImageType> for vk::ImageType {
    fn from(ty: ImageType) -> vk::ImageType {
        match ty {
            ImageType::Tex1d => vk::ImageType::TYPE_1D,
            ImageType::Tex2d | ImageType::Cube => vk::ImageType::TYPE_2D,
            ImageType::Tex3d => vk::ImageType::TYPE_3D,
        }
    }
}

///Returns the aspect an image of `format` is accessed through.
pub fn aspect_for(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::X8_D24_UNORM_PACK32 | vk::Format::D32_SFLOAT => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        _ => vk::ImageAspectFlags::COLOR,
    }
}

///Field-wise equality of two subresource ranges. Ash does not derive `PartialEq` for them.
pub fn range_eq(a: &vk::ImageSubresourceRange, b: &vk::ImageSubresourceRange) -> bool {
    a.aspect_mask == b.aspect_mask
        && a.base_mip_level == b.base_mip_level
        && a.level_count == b.level_count
        && a.base_array_layer == b.base_array_layer
        && a.layer_count == b.layer_count
}

///Describes all static parameters of an image view.
#[derive(Clone, Copy, Debug)]
pub struct ImgViewDesc {
    pub view_type: vk::ImageViewType,
    pub format: vk::Format,
    pub range: vk::ImageSubresourceRange,
}

impl PartialEq for ImgViewDesc {
    fn eq(&self, other: &Self) -> bool {
        self.view_type == other.view_type
            && self.format == other.format
            && range_eq(&self.range, &other.range)
    }
}

impl Eq for ImgViewDesc {}

///Image description. Basically a [ImageCreateInfo](vk::ImageCreateInfo) without the creation-time specifics.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ImgDesc {
    pub img_type: ImageType,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub samples: vk::SampleCountFlags,
    pub usage: vk::ImageUsageFlags,
    pub memory: MemoryUsage,
}

impl Default for ImgDesc {
    ///Creates a conservative image description for a 2d 8bit 4-channel image without mipmapping or multisampling
    /// with an extent of 512x512.
    fn default() -> Self {
        ImgDesc {
            img_type: ImageType::Tex2d,
            format: vk::Format::R8G8B8A8_UNORM,
            extent: vk::Extent3D {
                width: 512,
                height: 512,
                depth: 1,
            },
            mip_levels: 1,
            array_layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            memory: MemoryUsage::GpuOnly,
        }
    }
}

impl ImgDesc {
    pub fn color_attachment_2d(width: u32, height: u32, format: vk::Format) -> Self {
        ImgDesc {
            extent: vk::Extent3D {
                width,
                height,
                depth: 1,
            },
            format,
            ..Default::default()
        }
    }

    pub fn depth_attachment_2d(width: u32, height: u32, format: vk::Format) -> Self {
        ImgDesc {
            extent: vk::Extent3D {
                width,
                height,
                depth: 1,
            },
            format,
            usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            ..Default::default()
        }
    }

    ///Storage image with transfer bits set.
    pub fn storage_image_2d(width: u32, height: u32, format: vk::Format) -> Self {
        ImgDesc {
            extent: vk::Extent3D {
                width,
                height,
                depth: 1,
            },
            format,
            usage: vk::ImageUsageFlags::STORAGE
                | vk::ImageUsageFlags::TRANSFER_SRC
                | vk::ImageUsageFlags::TRANSFER_DST,
            ..Default::default()
        }
    }

    pub fn texture_2d(width: u32, height: u32, format: vk::Format) -> Self {
        ImgDesc {
            extent: vk::Extent3D {
                width,
                height,
                depth: 1,
            },
            format,
            usage: vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
            ..Default::default()
        }
    }

    pub fn with_mips(mut self, mip_levels: u32) -> Self {
        self.mip_levels = mip_levels;
        self
    }

    pub fn with_layers(mut self, array_layers: u32) -> Self {
        self.array_layers = array_layers;
        self
    }

    pub fn add_usage(mut self, usage: vk::ImageUsageFlags) -> Self {
        self.usage |= usage;
        self
    }

    pub fn aspect(&self) -> vk::ImageAspectFlags {
        aspect_for(self.format)
    }

    pub fn view_type(&self) -> vk::ImageViewType {
        match self.img_type {
            ImageType::Tex1d if self.array_layers > 1 => vk::ImageViewType::TYPE_1D_ARRAY,
            ImageType::Tex1d => vk::ImageViewType::TYPE_1D,
            ImageType::Tex2d if self.array_layers > 1 => vk::ImageViewType::TYPE_2D_ARRAY,
            ImageType::Tex2d => vk::ImageViewType::TYPE_2D,
            ImageType::Tex3d => vk::ImageViewType::TYPE_3D,
            ImageType::Cube if self.array_layers > 6 => vk::ImageViewType::CUBE_ARRAY,
            ImageType::Cube => vk::ImageViewType::CUBE,
        }
    }

    ///Sub resource range that encloses the whole image.
    pub fn subresource_all(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: self.aspect(),
            base_mip_level: 0,
            level_count: self.mip_levels,
            base_array_layer: 0,
            layer_count: self.array_layers,
        }
    }

    pub fn view_all(&self) -> ImgViewDesc {
        ImgViewDesc {
            view_type: self.view_type(),
            format: self.format,
            range: self.subresource_all(),
        }
    }
}

///Image with bound memory and a view over the whole image.
pub struct Image {
    pub inner: vk::Image,
    pub view: vk::ImageView,
    pub desc: ImgDesc,
    pub device: Arc<Device>,
}

///The hash implementation is based on [Image](ash::vk::Image)'s hash.
impl Hash for Image {
    fn hash<H: Hasher>(&self, hasher: &mut H) {
        self.inner.hash(hasher)
    }
}

impl Image {
    ///Creates the image and its default view. The image starts in `UNDEFINED` layout.
    pub fn new(device: &Arc<Device>, desc: ImgDesc, name: &str) -> Result<Self, GfxError> {
        assert!(
            desc.mip_levels > 0 && desc.array_layers > 0,
            "image {name} needs at least one mip and layer"
        );

        let inner = device.backend.create_image(&desc, name).map_err(|source| {
            #[cfg(feature = "logging")]
            log::error!(
                "Failed to create image {name} ({}x{}x{}, {:?}, usage={:?}): {source}",
                desc.extent.width,
                desc.extent.height,
                desc.extent.depth,
                desc.format,
                desc.usage
            );
            GfxError::Allocation {
                name: name.to_owned(),
                source,
            }
        })?;

        let view = match device.backend.create_image_view(inner, &desc.view_all()) {
            Ok(view) => view,
            Err(e) => {
                //never submitted, can go right away
                device.backend.destroy_image(inner);
                #[cfg(feature = "logging")]
                log::error!("Failed to create view for image {name}: {e}");
                return Err(GfxError::from_native(e));
            }
        };

        Ok(Image {
            inner,
            view,
            desc,
            device: device.clone(),
        })
    }

    pub fn extent_3d(&self) -> vk::Extent3D {
        self.desc.extent
    }

    pub fn extent_2d(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.desc.extent.width,
            height: self.desc.extent.height,
        }
    }

    pub fn subresource_all(&self) -> vk::ImageSubresourceRange {
        self.desc.subresource_all()
    }

    ///Releases image and view once `fence` signals.
    pub fn release_after(mut self, fence: vk::Fence) {
        let view = std::mem::replace(&mut self.view, vk::ImageView::null());
        let inner = std::mem::replace(&mut self.inner, vk::Image::null());
        self.device.release(Releasable {
            kind: ReleasableKind::ImageView(view),
            gate: ReleaseGate::Fence(fence),
        });
        self.device.release(Releasable {
            kind: ReleasableKind::Image(inner),
            gate: ReleaseGate::Fence(fence),
        });
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        let frame = self.device.frame();
        if self.view != vk::ImageView::null() {
            self.device.release(Releasable {
                kind: ReleasableKind::ImageView(self.view),
                gate: ReleaseGate::Frame(frame),
            });
        }
        if self.inner != vk::Image::null() {
            self.device.release(Releasable {
                kind: ReleasableKind::Image(self.inner),
                gate: ReleaseGate::Frame(frame),
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
        assert_impl_all!(Image: Send, Sync);
    }

    #[test]
    fn aspect_from_format() {
        assert_eq!(
            aspect_for(vk::Format::D32_SFLOAT),
            vk::ImageAspectFlags::DEPTH
        );
        assert_eq!(
            aspect_for(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(
            aspect_for(vk::Format::R16G16B16A16_SFLOAT),
            vk::ImageAspectFlags::COLOR
        );
    }

    #[test]
    fn view_desc_compares_ranges() {
        let desc = ImgDesc::texture_2d(64, 64, vk::Format::R8G8B8A8_UNORM).with_mips(4);
        let all = desc.view_all();
        assert_eq!(all, desc.view_all());

        let mut first_mip = all;
        first_mip.range.level_count = 1;
        assert_ne!(all, first_mip);
        assert!(range_eq(&desc.subresource_all(), &all.range));
    }

    #[test]
    fn view_type_follows_layers() {
        let desc = ImgDesc::texture_2d(64, 64, vk::Format::R8G8B8A8_UNORM);
        assert_eq!(desc.view_type(), vk::ImageViewType::TYPE_2D);
        assert_eq!(
            desc.with_layers(4).view_type(),
            vk::ImageViewType::TYPE_2D_ARRAY
        );

        let cube = ImgDesc {
            img_type: ImageType::Cube,
            array_layers: 12,
            ..Default::default()
        };
        assert_eq!(cube.view_type(), vk::ImageViewType::CUBE_ARRAY);
    }

    #[test]
    fn drop_defers_view_and_image() {
        let backend = Arc::new(HeadlessBackend::new());
        let device = Device::new(backend.clone(), GfxConfig::default());

        let image = Image::new(
            &device,
            ImgDesc::storage_image_2d(32, 32, vk::Format::R32_SFLOAT).with_mips(3),
            "target",
        )
        .unwrap();
        assert_eq!(image.subresource_all().level_count, 3);
        drop(image);

        assert_eq!(device.pending_releases(), 2);
        assert_eq!(backend.live_images(), 1);
    }
}
