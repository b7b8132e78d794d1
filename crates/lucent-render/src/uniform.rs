//! Shader-bound data: uniform buffers, sampled images and push constants.

use crate::error::{RenderError, Result};
use ash::vk;
use lucent_gpu::{
    DescriptorResource, DeviceBuffer, GpuDevice, ImageProperties, Residency, ResourceContext,
    SampledImage,
};

/// A uniform buffer with one host-visible copy per presentable image.
///
/// Each image's copy is uploaded only when that image is drawn and its copy is
/// outdated, so frames still in flight keep reading the value they were
/// recorded with.
#[derive(Debug)]
pub struct UniformBuffer {
    set: u32,
    binding: u32,
    data: Vec<u8>,
    buffers: Vec<DeviceBuffer>,
}

impl UniformBuffer {
    pub fn new<T: bytemuck::Pod>(set: u32, binding: u32, value: &T) -> Self {
        Self {
            set,
            binding,
            data: bytemuck::bytes_of(value).to_vec(),
            buffers: Vec::new(),
        }
    }

    pub const fn set(&self) -> u32 {
        self.set
    }

    pub const fn binding(&self) -> u32 {
        self.binding
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Replace the value. Returns whether it changed; a change marks every
    /// per-image copy outdated.
    pub fn update<T: bytemuck::Pod>(&mut self, value: &T) -> Result<bool> {
        self.update_bytes(bytemuck::bytes_of(value))
    }

    pub fn update_bytes(&mut self, data: &[u8]) -> Result<bool> {
        if data.len() != self.data.len() {
            return Err(RenderError::InvalidSettings(format!(
                "uniform ({}, {}) holds {} bytes, got {}",
                self.set,
                self.binding,
                self.data.len(),
                data.len()
            )));
        }
        if data == self.data.as_slice() {
            return Ok(false);
        }
        self.data.copy_from_slice(data);
        for buffer in &mut self.buffers {
            buffer.set_outdated();
        }
        Ok(true)
    }

    /// Whether the copy for `image_index` still needs an upload.
    pub fn is_outdated(&self, image_index: u32) -> bool {
        self.buffers
            .get(image_index as usize)
            .map_or(true, DeviceBuffer::is_outdated)
    }

    pub(crate) fn allocate<D: GpuDevice>(
        &mut self,
        ctx: &mut ResourceContext<D>,
        image_count: usize,
    ) -> Result<()> {
        let size = self.data.len().max(1) as vk::DeviceSize;
        for _ in 0..image_count {
            let buffer = DeviceBuffer::new(
                ctx,
                size,
                vk::BufferUsageFlags::UNIFORM_BUFFER,
                Residency::HostVisible,
            )?;
            self.buffers.push(buffer);
        }
        Ok(())
    }

    /// Upload the copy for `image_index` if it is outdated. Returns whether
    /// anything was written.
    pub(crate) fn upload<D: GpuDevice>(
        &mut self,
        ctx: &mut ResourceContext<D>,
        image_index: u32,
    ) -> Result<bool> {
        let Some(buffer) = self.buffers.get_mut(image_index as usize) else {
            return Ok(false);
        };
        if !buffer.is_outdated() {
            return Ok(false);
        }
        buffer.upload(ctx, &self.data)?;
        Ok(true)
    }

    pub(crate) fn descriptor(&self, image_index: usize) -> Option<DescriptorResource> {
        self.buffers.get(image_index).map(DeviceBuffer::descriptor)
    }

    pub(crate) fn release<D: GpuDevice>(&mut self, ctx: &mut ResourceContext<D>) -> Result<()> {
        for buffer in self.buffers.drain(..) {
            buffer.destroy(ctx)?;
        }
        Ok(())
    }
}

/// A sampled image bound through a combined image sampler.
#[derive(Debug)]
pub struct UniformImage {
    set: u32,
    binding: u32,
    properties: ImageProperties,
    texels: Vec<u8>,
    image: Option<SampledImage>,
}

impl UniformImage {
    /// An RGBA8 sRGB texture from tightly packed texels.
    pub fn rgba8(set: u32, binding: u32, extent: vk::Extent2D, texels: Vec<u8>) -> Result<Self> {
        Self::new(
            set,
            binding,
            ImageProperties::texture(extent, vk::Format::R8G8B8A8_SRGB),
            texels,
        )
    }

    /// `texels` must hold exactly the tightly packed base level of `properties`.
    pub fn new(set: u32, binding: u32, properties: ImageProperties, texels: Vec<u8>) -> Result<Self> {
        properties.check_texels(texels.len()).map_err(|e| {
            RenderError::InvalidSettings(format!("uniform image ({set}, {binding}): {e}"))
        })?;
        Ok(Self {
            set,
            binding,
            properties,
            texels,
            image: None,
        })
    }

    /// Generate a full mip chain when uploading.
    #[must_use]
    pub fn with_mipmaps(mut self) -> Self {
        self.properties = self.properties.with_mipmaps();
        self
    }

    pub const fn set(&self) -> u32 {
        self.set
    }

    pub const fn binding(&self) -> u32 {
        self.binding
    }

    pub const fn properties(&self) -> &ImageProperties {
        &self.properties
    }

    /// Replace the texels. The image is re-uploaded the next time it is drawn.
    pub fn update(&mut self, texels: Vec<u8>) -> Result<()> {
        if texels.len() != self.texels.len() {
            return Err(RenderError::InvalidSettings(format!(
                "uniform image ({}, {}) holds {} bytes, got {}",
                self.set,
                self.binding,
                self.texels.len(),
                texels.len()
            )));
        }
        self.texels = texels;
        if let Some(image) = &mut self.image {
            image.image_mut().set_outdated();
        }
        Ok(())
    }

    pub fn is_outdated(&self) -> bool {
        self.image.as_ref().map_or(true, |i| i.image().is_outdated())
    }

    /// Create the image and upload the texels.
    pub(crate) fn allocate<D: GpuDevice>(&mut self, ctx: &mut ResourceContext<D>) -> Result<()> {
        let mut image = SampledImage::new(ctx, self.properties)?;
        if let Err(e) = image.upload(ctx, &self.texels) {
            image.destroy(ctx)?;
            return Err(e.into());
        }
        self.image = Some(image);
        Ok(())
    }

    /// Re-upload if the texels changed. Waits for the device to go idle first.
    pub(crate) fn upload<D: GpuDevice>(&mut self, ctx: &mut ResourceContext<D>) -> Result<bool> {
        match &mut self.image {
            Some(image) if image.image().is_outdated() => {
                image.upload(ctx, &self.texels)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub(crate) fn descriptor(&self) -> Option<DescriptorResource> {
        self.image.as_ref().map(SampledImage::descriptor)
    }

    pub(crate) fn release<D: GpuDevice>(&mut self, ctx: &mut ResourceContext<D>) -> Result<()> {
        if let Some(image) = self.image.take() {
            image.destroy(ctx)?;
        }
        Ok(())
    }
}

/// Push-constant bytes recorded into a command buffer.
///
/// Push constants live in the recording itself, so a changed value makes every
/// recording of the owning mesh outdated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushConstant {
    stages: vk::ShaderStageFlags,
    offset: u32,
    data: Vec<u8>,
    outdated: bool,
}

impl PushConstant {
    pub fn new<T: bytemuck::Pod>(stages: vk::ShaderStageFlags, offset: u32, value: &T) -> Self {
        Self {
            stages,
            offset,
            data: bytemuck::bytes_of(value).to_vec(),
            outdated: true,
        }
    }

    pub const fn stages(&self) -> vk::ShaderStageFlags {
        self.stages
    }

    pub const fn offset(&self) -> u32 {
        self.offset
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Replace the value. Returns whether it changed.
    pub fn update<T: bytemuck::Pod>(&mut self, value: &T) -> Result<bool> {
        let bytes = bytemuck::bytes_of(value);
        if bytes.len() != self.data.len() {
            return Err(RenderError::InvalidSettings(format!(
                "push constant at offset {} holds {} bytes, got {}",
                self.offset,
                self.data.len(),
                bytes.len()
            )));
        }
        if bytes == self.data.as_slice() {
            return Ok(false);
        }
        self.data.copy_from_slice(bytes);
        self.outdated = true;
        Ok(true)
    }

    pub const fn is_outdated(&self) -> bool {
        self.outdated
    }

    pub(crate) fn mark_recorded(&mut self) {
        self.outdated = false;
    }

    pub(crate) fn record<D: GpuDevice>(
        &self,
        device: &D,
        cmd: vk::CommandBuffer,
        layout: vk::PipelineLayout,
    ) {
        device.cmd_push_constants(cmd, layout, self.stages, self.offset, &self.data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lucent_gpu::MockDevice;

    #[test]
    fn uniform_update_only_flags_real_changes() {
        let mut ctx = ResourceContext::new(MockDevice::new()).unwrap();
        let mut uniform = UniformBuffer::new(0, 0, &[1.0_f32, 2.0]);
        uniform.allocate(&mut ctx, 2).unwrap();
        assert!(uniform.upload(&mut ctx, 0).unwrap());
        assert!(uniform.upload(&mut ctx, 1).unwrap());
        assert!(!uniform.is_outdated(0));

        assert!(!uniform.update(&[1.0_f32, 2.0]).unwrap());
        assert!(!uniform.is_outdated(0));

        assert!(uniform.update(&[3.0_f32, 2.0]).unwrap());
        assert!(uniform.is_outdated(0));
        assert!(uniform.is_outdated(1));

        assert!(uniform.update(&[1.0_f32]).is_err());
        uniform.release(&mut ctx).unwrap();
    }

    #[test]
    fn uniform_upload_writes_only_the_drawn_image() {
        let mut ctx = ResourceContext::new(MockDevice::new()).unwrap();
        let mut uniform = UniformBuffer::new(0, 0, &7_u32);
        uniform.allocate(&mut ctx, 3).unwrap();

        assert!(uniform.upload(&mut ctx, 1).unwrap());
        assert!(!uniform.upload(&mut ctx, 1).unwrap());
        assert!(uniform.is_outdated(0));
        assert!(uniform.is_outdated(2));

        let Some(DescriptorResource::UniformBuffer { buffer, .. }) = uniform.descriptor(1) else {
            panic!("expected a uniform buffer descriptor");
        };
        assert_eq!(&ctx.device().buffer_contents(buffer)[..4], &7_u32.to_ne_bytes());
        uniform.release(&mut ctx).unwrap();
        assert!(ctx.allocations().is_empty());
    }

    #[test]
    fn image_texels_must_match_the_extent() {
        let extent = vk::Extent2D {
            width: 64,
            height: 64,
        };
        assert!(matches!(
            UniformImage::rgba8(0, 0, extent, vec![255; 4]),
            Err(RenderError::InvalidSettings(_))
        ));
        assert!(UniformImage::rgba8(0, 0, extent, vec![255; 64 * 64 * 4]).is_ok());

        let empty = vk::Extent2D {
            width: 0,
            height: 0,
        };
        assert!(matches!(
            UniformImage::rgba8(0, 0, empty, vec![255; 4]),
            Err(RenderError::InvalidSettings(_))
        ));
        assert!(UniformImage::rgba8(0, 0, empty, Vec::new()).is_err());
    }

    #[test]
    fn image_update_reuploads_after_idle_wait() {
        let mut ctx = ResourceContext::new(MockDevice::new()).unwrap();
        let extent = vk::Extent2D {
            width: 2,
            height: 2,
        };
        let mut image = UniformImage::rgba8(1, 0, extent, vec![255; 16]).unwrap();
        image.allocate(&mut ctx).unwrap();
        assert!(!image.is_outdated());
        assert!(!image.upload(&mut ctx).unwrap());

        image.update(vec![0; 16]).unwrap();
        assert!(image.is_outdated());
        ctx.device().clear_events();
        assert!(image.upload(&mut ctx).unwrap());
        assert!(ctx
            .device()
            .events()
            .contains(&lucent_gpu::MockEvent::DeviceWaitIdle));

        assert!(image.update(vec![0; 4]).is_err());
        image.release(&mut ctx).unwrap();
    }

    #[test]
    fn push_constant_tracks_changes() {
        let mut push = PushConstant::new(vk::ShaderStageFlags::VERTEX, 0, &[0.5_f32; 4]);
        assert!(push.is_outdated());
        push.mark_recorded();
        assert!(!push.update(&[0.5_f32; 4]).unwrap());
        assert!(!push.is_outdated());
        assert!(push.update(&[1.0_f32; 4]).unwrap());
        assert!(push.is_outdated());
    }
}
