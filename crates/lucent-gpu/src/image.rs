//! Device-resident images.

use crate::buffer::Residency;
use crate::device::{DescriptorResource, GpuDevice, ImageBarrier, ImageDesc, SamplerDesc};
use crate::error::{GpuError, Result};
use crate::memory::AllocationId;
use crate::resources::ResourceContext;
use ash::vk;

/// Shape and usage of a 2D image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageProperties {
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub samples: vk::SampleCountFlags,
    pub aspect: vk::ImageAspectFlags,
    pub mip_levels: u32,
}

impl ImageProperties {
    /// A single-sampled texture that is uploaded and then sampled.
    pub const fn texture(extent: vk::Extent2D, format: vk::Format) -> Self {
        Self {
            extent,
            format,
            usage: vk::ImageUsageFlags::from_raw(
                vk::ImageUsageFlags::TRANSFER_DST.as_raw() | vk::ImageUsageFlags::SAMPLED.as_raw(),
            ),
            samples: vk::SampleCountFlags::TYPE_1,
            aspect: vk::ImageAspectFlags::COLOR,
            mip_levels: 1,
        }
    }

    /// Depth attachment of a render pass.
    pub const fn depth_attachment(
        extent: vk::Extent2D,
        format: vk::Format,
        samples: vk::SampleCountFlags,
    ) -> Self {
        Self {
            extent,
            format,
            usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            samples,
            aspect: vk::ImageAspectFlags::DEPTH,
            mip_levels: 1,
        }
    }

    /// Transient multisampled color attachment resolved into the swapchain.
    pub const fn color_attachment(
        extent: vk::Extent2D,
        format: vk::Format,
        samples: vk::SampleCountFlags,
    ) -> Self {
        Self {
            extent,
            format,
            usage: vk::ImageUsageFlags::from_raw(
                vk::ImageUsageFlags::TRANSIENT_ATTACHMENT.as_raw()
                    | vk::ImageUsageFlags::COLOR_ATTACHMENT.as_raw(),
            ),
            samples,
            aspect: vk::ImageAspectFlags::COLOR,
            mip_levels: 1,
        }
    }

    /// Request a full mip chain, generated by blits after upload.
    #[must_use]
    pub fn with_mipmaps(mut self) -> Self {
        self.mip_levels = mip_level_count(self.extent);
        self.usage |= vk::ImageUsageFlags::TRANSFER_SRC;
        self
    }

    /// Check that `len` bytes are exactly the tightly packed base level.
    pub fn check_texels(&self, len: usize) -> Result<()> {
        check_extent(self.extent)?;
        let Some(texel) = texel_size(self.format) else {
            return Err(GpuError::InvalidState(format!(
                "format {:?} cannot be uploaded from texels",
                self.format
            )));
        };
        let expected = u64::from(self.extent.width) * u64::from(self.extent.height) * texel;
        if len as u64 != expected {
            return Err(GpuError::InvalidState(format!(
                "{}x{} {:?} image needs {expected} texel bytes, got {len}",
                self.extent.width, self.extent.height, self.format
            )));
        }
        Ok(())
    }

    const fn desc(&self) -> ImageDesc {
        ImageDesc {
            extent: self.extent,
            format: self.format,
            usage: self.usage,
            mip_levels: self.mip_levels,
            samples: self.samples,
        }
    }
}

/// Number of levels in a full mip chain for `extent`.
pub fn mip_level_count(extent: vk::Extent2D) -> u32 {
    32 - extent.width.max(extent.height).max(1).leading_zeros()
}

/// Bytes per texel of the uncompressed color formats uploaded from memory.
pub const fn texel_size(format: vk::Format) -> Option<vk::DeviceSize> {
    match format {
        vk::Format::R8_UNORM | vk::Format::R8_SRGB => Some(1),
        vk::Format::R8G8_UNORM | vk::Format::R8G8_SRGB | vk::Format::R16_SFLOAT => Some(2),
        vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_SRGB
        | vk::Format::B8G8R8A8_UNORM
        | vk::Format::B8G8R8A8_SRGB
        | vk::Format::R16G16_SFLOAT
        | vk::Format::R32_SFLOAT => Some(4),
        vk::Format::R16G16B16A16_SFLOAT | vk::Format::R32G32_SFLOAT => Some(8),
        vk::Format::R32G32B32A32_SFLOAT => Some(16),
        _ => None,
    }
}

fn check_extent(extent: vk::Extent2D) -> Result<()> {
    if extent.width == 0 || extent.height == 0 {
        return Err(GpuError::InvalidState(format!(
            "image extent {}x{} is empty",
            extent.width, extent.height
        )));
    }
    Ok(())
}

/// Access and stage masks for the layouts this crate transitions between.
fn layout_masks(layout: vk::ImageLayout) -> (vk::AccessFlags, vk::PipelineStageFlags) {
    match layout {
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => (
            vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::TRANSFER,
        ),
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => (
            vk::AccessFlags::TRANSFER_READ,
            vk::PipelineStageFlags::TRANSFER,
        ),
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => (
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
        ),
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => (
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        ),
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => (
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        ),
        _ => (vk::AccessFlags::empty(), vk::PipelineStageFlags::TOP_OF_PIPE),
    }
}

fn barrier(
    image: vk::Image,
    aspect: vk::ImageAspectFlags,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
    base_mip_level: u32,
    level_count: u32,
) -> ImageBarrier {
    let (src_access, src_stage) = layout_masks(old_layout);
    let (dst_access, dst_stage) = layout_masks(new_layout);
    ImageBarrier {
        image,
        aspect,
        old_layout,
        new_layout,
        src_access,
        dst_access,
        src_stage,
        dst_stage,
        base_mip_level,
        level_count,
    }
}

/// A device-local image with a view and one dedicated allocation.
#[derive(Debug)]
pub struct DeviceImage {
    image: vk::Image,
    view: vk::ImageView,
    allocation: AllocationId,
    properties: ImageProperties,
    layout: vk::ImageLayout,
    uploaded: bool,
    outdated: bool,
}

impl DeviceImage {
    pub fn new<D: GpuDevice>(ctx: &mut ResourceContext<D>, properties: ImageProperties) -> Result<Self> {
        check_extent(properties.extent)?;
        let (image, allocation) = ctx.create_image(&properties.desc(), Residency::DeviceLocal.memory_properties())?;
        let view = match ctx.device().create_image_view(
            image,
            properties.format,
            properties.aspect,
            properties.mip_levels,
        ) {
            Ok(view) => view,
            Err(e) => {
                ctx.free_image(image, allocation)?;
                return Err(e);
            }
        };

        Ok(Self {
            image,
            view,
            allocation,
            properties,
            layout: vk::ImageLayout::UNDEFINED,
            uploaded: false,
            outdated: true,
        })
    }

    /// Upload tightly packed texels through a staging buffer, generate the
    /// mip chain and leave the image ready for sampling.
    ///
    /// Re-uploading an image that was uploaded before waits for the device
    /// to go idle, since earlier frames may still sample it.
    pub fn upload<D: GpuDevice>(&mut self, ctx: &mut ResourceContext<D>, texels: &[u8]) -> Result<()> {
        if self.properties.mip_levels > 1 && !ctx.device().supports_linear_blit(self.properties.format) {
            return Err(GpuError::InvalidState(format!(
                "format {:?} does not support linear blits for mipmap generation",
                self.properties.format
            )));
        }
        self.properties.check_texels(texels.len())?;
        if self.uploaded {
            ctx.device().wait_idle()?;
        }

        let (staging, staging_allocation) = ctx.create_buffer(
            texels.len() as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_SRC,
            Residency::HostVisible.memory_properties(),
        )?;
        let image = self.image;
        let properties = self.properties;
        let copied = ctx.write(staging_allocation, texels).and_then(|()| {
            ctx.one_shot(|device, cmd| {
                device.cmd_image_barrier(
                    cmd,
                    &barrier(
                        image,
                        properties.aspect,
                        vk::ImageLayout::UNDEFINED,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        0,
                        properties.mip_levels,
                    ),
                );
                device.cmd_copy_buffer_to_image(cmd, staging, image, properties.extent);
                record_mipmaps(device, cmd, image, &properties);
            })
        });
        ctx.free_buffer(staging, staging_allocation)?;
        copied?;

        self.layout = vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL;
        self.uploaded = true;
        self.outdated = false;
        Ok(())
    }

    pub fn set_outdated(&mut self) {
        self.outdated = true;
    }

    pub const fn is_outdated(&self) -> bool {
        self.outdated
    }

    pub const fn handle(&self) -> vk::Image {
        self.image
    }

    pub const fn view(&self) -> vk::ImageView {
        self.view
    }

    pub const fn properties(&self) -> &ImageProperties {
        &self.properties
    }

    pub const fn layout(&self) -> vk::ImageLayout {
        self.layout
    }

    pub const fn allocation(&self) -> AllocationId {
        self.allocation
    }

    /// Destroy the view and image and release the allocation.
    pub fn destroy<D: GpuDevice>(self, ctx: &mut ResourceContext<D>) -> Result<()> {
        ctx.device().destroy_image_view(self.view);
        ctx.free_image(self.image, self.allocation)
    }
}

/// Blit each level from the one above it, leaving all levels shader-readable.
/// With a single level this is just the final transition.
fn record_mipmaps<D: GpuDevice>(
    device: &D,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    properties: &ImageProperties,
) {
    let aspect = properties.aspect;
    let mut width = properties.extent.width as i32;
    let mut height = properties.extent.height as i32;

    for level in 1..properties.mip_levels {
        device.cmd_image_barrier(
            cmd,
            &barrier(
                image,
                aspect,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                level - 1,
                1,
            ),
        );

        let next_width = (width / 2).max(1);
        let next_height = (height / 2).max(1);
        let region = vk::ImageBlit {
            src_subresource: vk::ImageSubresourceLayers {
                aspect_mask: aspect,
                mip_level: level - 1,
                base_array_layer: 0,
                layer_count: 1,
            },
            src_offsets: [
                vk::Offset3D::default(),
                vk::Offset3D {
                    x: width,
                    y: height,
                    z: 1,
                },
            ],
            dst_subresource: vk::ImageSubresourceLayers {
                aspect_mask: aspect,
                mip_level: level,
                base_array_layer: 0,
                layer_count: 1,
            },
            dst_offsets: [
                vk::Offset3D::default(),
                vk::Offset3D {
                    x: next_width,
                    y: next_height,
                    z: 1,
                },
            ],
        };
        device.cmd_blit_image(cmd, image, &region);

        device.cmd_image_barrier(
            cmd,
            &barrier(
                image,
                aspect,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                level - 1,
                1,
            ),
        );

        width = next_width;
        height = next_height;
    }

    device.cmd_image_barrier(
        cmd,
        &barrier(
            image,
            aspect,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            properties.mip_levels - 1,
            1,
        ),
    );
}

/// A texture together with the sampler it is read through.
#[derive(Debug)]
pub struct SampledImage {
    image: DeviceImage,
    sampler: vk::Sampler,
}

impl SampledImage {
    pub fn new<D: GpuDevice>(ctx: &mut ResourceContext<D>, properties: ImageProperties) -> Result<Self> {
        let image = DeviceImage::new(ctx, properties)?;
        let desc = SamplerDesc {
            max_lod: properties.mip_levels as f32,
            ..SamplerDesc::default()
        };
        match ctx.device().create_sampler(&desc) {
            Ok(sampler) => Ok(Self { image, sampler }),
            Err(e) => {
                image.destroy(ctx)?;
                Err(e)
            }
        }
    }

    pub fn upload<D: GpuDevice>(&mut self, ctx: &mut ResourceContext<D>, texels: &[u8]) -> Result<()> {
        self.image.upload(ctx, texels)
    }

    pub const fn image(&self) -> &DeviceImage {
        &self.image
    }

    pub fn image_mut(&mut self) -> &mut DeviceImage {
        &mut self.image
    }

    pub const fn sampler(&self) -> vk::Sampler {
        self.sampler
    }

    pub const fn descriptor(&self) -> DescriptorResource {
        DescriptorResource::CombinedImageSampler {
            view: self.image.view,
            sampler: self.sampler,
        }
    }

    pub fn destroy<D: GpuDevice>(self, ctx: &mut ResourceContext<D>) -> Result<()> {
        ctx.device().destroy_sampler(self.sampler);
        self.image.destroy(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockCommand, MockDevice, MockEvent};

    fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    #[test]
    fn mip_chain_length() {
        assert_eq!(mip_level_count(extent(1, 1)), 1);
        assert_eq!(mip_level_count(extent(256, 256)), 9);
        assert_eq!(mip_level_count(extent(512, 3)), 10);
        assert_eq!(mip_level_count(extent(0, 0)), 1);
    }

    #[test]
    fn texture_upload_generates_mips_and_frees_staging() {
        let mut ctx = ResourceContext::new(MockDevice::new()).unwrap();
        let properties = ImageProperties::texture(extent(4, 4), vk::Format::R8G8B8A8_SRGB).with_mipmaps();
        let mut texture = SampledImage::new(&mut ctx, properties).unwrap();
        assert_eq!(texture.image().properties().mip_levels, 3);

        texture.upload(&mut ctx, &[255; 64]).unwrap();

        assert_eq!(ctx.allocations().len(), 1);
        assert_eq!(texture.image().layout(), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert!(!texture.image().is_outdated());
        let submitted = ctx
            .device()
            .events()
            .into_iter()
            .filter(|e| matches!(e, MockEvent::Submit { .. }))
            .count();
        assert_eq!(submitted, 1);
        texture.destroy(&mut ctx).unwrap();
        assert!(ctx.allocations().is_empty());
    }

    #[test]
    fn reupload_waits_for_idle() {
        let mut ctx = ResourceContext::new(MockDevice::new()).unwrap();
        let mut image =
            DeviceImage::new(&mut ctx, ImageProperties::texture(extent(2, 2), vk::Format::R8G8B8A8_UNORM))
                .unwrap();

        image.upload(&mut ctx, &[0; 16]).unwrap();
        assert!(!ctx.device().events().contains(&MockEvent::DeviceWaitIdle));

        image.set_outdated();
        image.upload(&mut ctx, &[1; 16]).unwrap();
        assert!(ctx.device().events().contains(&MockEvent::DeviceWaitIdle));
        image.destroy(&mut ctx).unwrap();
    }

    #[test]
    fn upload_must_cover_the_whole_extent() {
        let mut ctx = ResourceContext::new(MockDevice::new()).unwrap();
        let mut image =
            DeviceImage::new(&mut ctx, ImageProperties::texture(extent(64, 64), vk::Format::R8G8B8A8_SRGB))
                .unwrap();
        ctx.device().clear_events();

        assert!(matches!(
            image.upload(&mut ctx, &[255; 4]),
            Err(GpuError::InvalidState(_))
        ));
        assert!(image.upload(&mut ctx, &vec![255; 64 * 64 * 4 + 1]).is_err());
        // Nothing was staged or submitted.
        assert!(ctx.device().events().is_empty());
        assert_eq!(ctx.allocations().len(), 1);

        image.upload(&mut ctx, &vec![255; 64 * 64 * 4]).unwrap();
        image.destroy(&mut ctx).unwrap();
    }

    #[test]
    fn empty_extent_is_rejected() {
        let mut ctx = ResourceContext::new(MockDevice::new()).unwrap();
        let properties = ImageProperties::texture(extent(0, 4), vk::Format::R8G8B8A8_SRGB);
        assert!(matches!(
            DeviceImage::new(&mut ctx, properties),
            Err(GpuError::InvalidState(_))
        ));
        assert!(properties.check_texels(0).is_err());
        assert_eq!(ctx.device().live_count("image"), 0);
        assert!(ctx.allocations().is_empty());
    }

    #[test]
    fn texel_sizes_follow_the_format() {
        let rgba = ImageProperties::texture(extent(3, 2), vk::Format::R8G8B8A8_UNORM);
        assert!(rgba.check_texels(24).is_ok());
        let half = ImageProperties::texture(extent(3, 2), vk::Format::R16G16B16A16_SFLOAT);
        assert!(half.check_texels(48).is_ok());
        assert!(half.check_texels(24).is_err());
        let compressed = ImageProperties::texture(extent(4, 4), vk::Format::BC1_RGB_UNORM_BLOCK);
        assert!(compressed.check_texels(8).is_err());
    }

    #[test]
    fn mip_recording_blits_every_level() {
        let device = MockDevice::new();
        let cmd = device
            .allocate_command_buffers(vk::CommandPool::null(), vk::CommandBufferLevel::PRIMARY, 1)
            .unwrap()[0];
        device
            .begin_command_buffer(cmd, vk::CommandBufferUsageFlags::empty(), None)
            .unwrap();
        let properties = ImageProperties::texture(extent(8, 8), vk::Format::R8G8B8A8_SRGB).with_mipmaps();

        record_mipmaps(&device, cmd, vk::Image::null(), &properties);

        let blits: Vec<u32> = device
            .recorded(cmd)
            .into_iter()
            .filter_map(|c| match c {
                MockCommand::Blit { dst_mip, .. } => Some(dst_mip),
                _ => None,
            })
            .collect();
        assert_eq!(blits, vec![1, 2, 3]);
    }
}
