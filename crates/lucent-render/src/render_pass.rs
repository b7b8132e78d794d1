//! Render passes with their attachments, framebuffers and pipelines.

use crate::error::{RenderError, Result};
use crate::handle::{PipelineId, RenderPassId};
use crate::pipeline::Pipeline;
use crate::settings::{clamp_samples, RenderPassSettings};
use ash::vk;
use hashbrown::HashMap;
use lucent_gpu::{
    DeviceImage, GpuDevice, ImageProperties, RenderPassDesc, ResourceContext, SwapchainInfo,
};
use tracing::debug;

/// A single-subpass render pass drawing into the presentable images.
///
/// Everything that depends on the surface (the render pass object, the depth
/// and multisampled color attachments and one framebuffer per presentable
/// image) is rebuilt together by [`Self::recreate`].
#[derive(Debug)]
pub struct RenderPass {
    id: RenderPassId,
    settings: RenderPassSettings,
    samples: vk::SampleCountFlags,
    depth_format: Option<vk::Format>,
    render_pass: vk::RenderPass,
    extent: vk::Extent2D,
    color: Option<DeviceImage>,
    depth: Option<DeviceImage>,
    framebuffers: Vec<vk::Framebuffer>,
    pipelines: HashMap<PipelineId, Pipeline>,
}

impl RenderPass {
    pub(crate) fn new<D: GpuDevice>(
        ctx: &mut ResourceContext<D>,
        id: RenderPassId,
        settings: RenderPassSettings,
        swapchain: &SwapchainInfo,
        views: &[vk::ImageView],
    ) -> Result<Self> {
        let samples = clamp_samples(settings.samples, ctx.device().max_sample_count());
        let depth_format = settings.depth.then(|| ctx.device().depth_format());

        let mut render_pass = Self {
            id,
            settings,
            samples,
            depth_format,
            render_pass: vk::RenderPass::null(),
            extent: swapchain.extent,
            color: None,
            depth: None,
            framebuffers: Vec::new(),
            pipelines: HashMap::new(),
        };
        if let Err(e) = render_pass.build(ctx, swapchain, views) {
            render_pass.teardown(ctx)?;
            return Err(e);
        }
        debug!(
            "Created {id} with {} framebuffers at {}x{}",
            views.len(),
            swapchain.extent.width,
            swapchain.extent.height
        );
        Ok(render_pass)
    }

    fn build<D: GpuDevice>(
        &mut self,
        ctx: &mut ResourceContext<D>,
        swapchain: &SwapchainInfo,
        views: &[vk::ImageView],
    ) -> Result<()> {
        self.extent = swapchain.extent;
        self.render_pass = ctx.device().create_render_pass(&RenderPassDesc {
            color_format: swapchain.format,
            depth_format: self.depth_format,
            samples: self.samples,
        })?;

        if self.samples != vk::SampleCountFlags::TYPE_1 {
            self.color = Some(DeviceImage::new(
                ctx,
                ImageProperties::color_attachment(swapchain.extent, swapchain.format, self.samples),
            )?);
        }
        if let Some(format) = self.depth_format {
            self.depth = Some(DeviceImage::new(
                ctx,
                ImageProperties::depth_attachment(swapchain.extent, format, self.samples),
            )?);
        }

        for view in views {
            let attachments = self.attachments(*view);
            let framebuffer =
                ctx.device()
                    .create_framebuffer(self.render_pass, &attachments, swapchain.extent)?;
            self.framebuffers.push(framebuffer);
        }
        Ok(())
    }

    /// Framebuffer attachments in render pass order: color, depth, resolve.
    fn attachments(&self, swapchain_view: vk::ImageView) -> Vec<vk::ImageView> {
        let mut attachments = Vec::with_capacity(3);
        match &self.color {
            Some(color) => attachments.push(color.view()),
            None => attachments.push(swapchain_view),
        }
        if let Some(depth) = &self.depth {
            attachments.push(depth.view());
        }
        if self.color.is_some() {
            attachments.push(swapchain_view);
        }
        attachments
    }

    /// Destroy everything [`Self::build`] created.
    fn teardown<D: GpuDevice>(&mut self, ctx: &mut ResourceContext<D>) -> Result<()> {
        for framebuffer in self.framebuffers.drain(..) {
            ctx.device().destroy_framebuffer(framebuffer);
        }
        if let Some(depth) = self.depth.take() {
            depth.destroy(ctx)?;
        }
        if let Some(color) = self.color.take() {
            color.destroy(ctx)?;
        }
        ctx.device().destroy_render_pass(self.render_pass);
        self.render_pass = vk::RenderPass::null();
        Ok(())
    }

    /// Rebuild the render pass, its attachments and framebuffers for a new
    /// surface, then rebuild every pipeline against it. The device must be idle.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub(crate) fn recreate<D: GpuDevice>(
        &mut self,
        ctx: &mut ResourceContext<D>,
        swapchain: &SwapchainInfo,
        views: &[vk::ImageView],
    ) -> Result<()> {
        self.teardown(ctx)?;
        self.build(ctx, swapchain, views)?;
        for pipeline in self.pipelines.values_mut() {
            pipeline.recreate(ctx.device(), self.render_pass, self.samples)?;
        }
        debug!(
            "Recreated {} with {} pipelines and {} framebuffers",
            self.id,
            self.pipelines.len(),
            self.framebuffers.len()
        );
        Ok(())
    }

    /// Begin the render pass on `image_index`'s framebuffer. The subpass
    /// contents come from secondary command buffers.
    pub(crate) fn begin<D: GpuDevice>(
        &self,
        device: &D,
        cmd: vk::CommandBuffer,
        image_index: u32,
    ) -> Result<()> {
        let framebuffer = self.framebuffer(image_index)?;
        device.cmd_begin_render_pass(
            cmd,
            self.render_pass,
            framebuffer,
            self.extent,
            &self.settings.clear_values(),
            vk::SubpassContents::SECONDARY_COMMAND_BUFFERS,
        );
        Ok(())
    }

    pub const fn id(&self) -> RenderPassId {
        self.id
    }

    pub const fn handle(&self) -> vk::RenderPass {
        self.render_pass
    }

    pub const fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Sample count after clamping to the device limit.
    pub const fn samples(&self) -> vk::SampleCountFlags {
        self.samples
    }

    pub const fn settings(&self) -> &RenderPassSettings {
        &self.settings
    }

    pub fn framebuffer_count(&self) -> usize {
        self.framebuffers.len()
    }

    pub fn framebuffer(&self, image_index: u32) -> Result<vk::Framebuffer> {
        self.framebuffers
            .get(image_index as usize)
            .copied()
            .ok_or_else(|| RenderError::ImageIndexOutOfRange {
                index: image_index,
                count: self.framebuffers.len(),
            })
    }

    pub fn pipeline(&self, id: PipelineId) -> Option<&Pipeline> {
        self.pipelines.get(&id)
    }

    pub fn pipeline_count(&self) -> usize {
        self.pipelines.len()
    }

    pub(crate) fn insert_pipeline(&mut self, pipeline: Pipeline) {
        self.pipelines.insert(pipeline.id(), pipeline);
    }

    pub(crate) fn remove_pipeline(&mut self, id: PipelineId) -> Option<Pipeline> {
        self.pipelines.remove(&id)
    }

    /// Destroy the pipelines and every surface-dependent object. The device
    /// must be idle.
    pub(crate) fn destroy<D: GpuDevice>(mut self, ctx: &mut ResourceContext<D>) -> Result<()> {
        for (_, pipeline) in self.pipelines.drain() {
            pipeline.destroy(ctx.device());
        }
        self.teardown(ctx)?;
        debug!("Destroyed {}", self.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lucent_gpu::MockDevice;

    fn create(
        device: MockDevice,
        settings: RenderPassSettings,
    ) -> (ResourceContext<MockDevice>, RenderPass) {
        let mut ctx = ResourceContext::new(device).unwrap();
        let info = ctx.device().swapchain_info();
        let views = ctx.device().swapchain_image_views();
        let render_pass = RenderPass::new(&mut ctx, RenderPassId(1), settings, &info, &views).unwrap();
        (ctx, render_pass)
    }

    #[test]
    fn one_framebuffer_per_presentable_image() {
        let (mut ctx, render_pass) =
            create(MockDevice::new().with_image_count(3), RenderPassSettings::default());
        assert_eq!(render_pass.framebuffer_count(), 3);
        assert!(render_pass.framebuffer(2).is_ok());
        assert!(matches!(
            render_pass.framebuffer(3),
            Err(RenderError::ImageIndexOutOfRange { index: 3, count: 3 })
        ));
        // Depth only; no multisampled color.
        assert_eq!(ctx.allocations().len(), 1);

        render_pass.destroy(&mut ctx).unwrap();
        assert!(ctx.allocations().is_empty());
        assert_eq!(ctx.device().live_count("framebuffer"), 0);
        assert_eq!(ctx.device().live_count("render pass"), 0);
    }

    #[test]
    fn samples_clamp_and_add_a_color_target() {
        let settings = RenderPassSettings::default().with_samples(vk::SampleCountFlags::TYPE_8);
        let (mut ctx, render_pass) = create(MockDevice::new(), settings);
        assert_eq!(render_pass.samples(), vk::SampleCountFlags::TYPE_4);
        assert_eq!(ctx.allocations().len(), 2);
        assert_eq!(render_pass.attachments(vk::ImageView::null()).len(), 3);
        render_pass.destroy(&mut ctx).unwrap();
    }

    #[test]
    fn recreate_follows_the_new_image_count() {
        let (mut ctx, mut render_pass) = create(MockDevice::new(), RenderPassSettings::default());
        let old = render_pass.handle();

        ctx.device().set_image_count_on_recreate(4);
        let extent = vk::Extent2D {
            width: 1024,
            height: 768,
        };
        let info = ctx.device_mut().recreate_swapchain(extent).unwrap();
        let views = ctx.device().swapchain_image_views();
        render_pass.recreate(&mut ctx, &info, &views).unwrap();

        assert_ne!(render_pass.handle(), old);
        assert_eq!(render_pass.framebuffer_count(), 4);
        assert_eq!(render_pass.extent(), extent);
        assert_eq!(ctx.device().live_count("framebuffer"), 4);
        assert_eq!(ctx.device().live_count("render pass"), 1);
        render_pass.destroy(&mut ctx).unwrap();
    }

    #[test]
    fn begin_uses_secondary_contents() {
        let (mut ctx, render_pass) = create(MockDevice::new(), RenderPassSettings::default());
        let pool = lucent_gpu::CommandPool::new(ctx.device()).unwrap();
        let cmd = pool
            .allocate_command_buffer(ctx.device(), vk::CommandBufferLevel::PRIMARY)
            .unwrap();
        ctx.device()
            .begin_command_buffer(cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT, None)
            .unwrap();
        render_pass.begin(ctx.device(), cmd, 1).unwrap();

        assert_eq!(
            ctx.device().recorded(cmd),
            vec![lucent_gpu::MockCommand::BeginRenderPass {
                render_pass: render_pass.handle(),
                framebuffer: render_pass.framebuffer(1).unwrap(),
                contents: vk::SubpassContents::SECONDARY_COMMAND_BUFFERS,
            }]
        );
        pool.destroy(ctx.device());
        render_pass.destroy(&mut ctx).unwrap();
    }
}
