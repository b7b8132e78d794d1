//! The renderer: client draw API, frame protocol and recreation cascade.

use crate::command::{Command, RecordTarget};
use crate::error::{RenderError, Result};
use crate::handle::{
    CommandHandle, CommandId, PipelineHandle, PipelineId, Release, RenderPassHandle, RenderPassId,
};
use crate::pipeline::Pipeline;
use crate::render_pass::RenderPass;
use crate::settings::{PipelineSettings, RenderPassSettings, RendererConfig};
use ash::vk;
use crossbeam::channel::{unbounded, Receiver, Sender};
use hashbrown::HashMap;
use lucent_gpu::{
    AcquireOutcome, CommandPool, DescriptorPool, FrameSlot, FrameSyncRing, GpuDevice,
    ResourceContext, Submission, SwapchainInfo,
};
use tracing::{debug, error, info, warn};

/// Upper bound on descriptors of each type in one set.
const DESCRIPTORS_PER_SET: u32 = 8;

/// Forwards surface size changes to the renderer.
///
/// Cloneable and usable from a windowing callback; the renderer only reads
/// the latest size when the next frame starts.
#[derive(Debug, Clone)]
pub struct SurfaceNotifier {
    sender: Sender<vk::Extent2D>,
}

impl SurfaceNotifier {
    pub fn notify_resized(&self, width: u32, height: u32) {
        // A closed channel means the renderer is gone and nothing needs resizing.
        let _ = self.sender.send(vk::Extent2D { width, height });
    }
}

/// Result of [`Renderer::start_frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// A frame is in progress on `image_index`; draw, then present.
    Started { image_index: u32 },
    /// No frame was started, because the surface was out of date or has zero
    /// size. Try again next frame.
    Skipped,
}

impl FrameStatus {
    pub const fn is_started(self) -> bool {
        matches!(self, Self::Started { .. })
    }
}

/// State of the frame between start and present.
#[derive(Debug)]
struct ActiveFrame {
    render_pass: RenderPassId,
    image_index: u32,
    slot: FrameSlot,
    suboptimal: bool,
    drawn: Vec<CommandId>,
    secondaries: Vec<vk::CommandBuffer>,
}

/// Owns every GPU object behind the client handles and drives the frame loop.
pub struct Renderer<D: GpuDevice> {
    config: RendererConfig,
    render_passes: HashMap<RenderPassId, RenderPass>,
    commands: HashMap<CommandId, Command>,
    next_id: u64,
    release_tx: Sender<Release>,
    release_rx: Receiver<Release>,
    resize_tx: Sender<vk::Extent2D>,
    resize_rx: Receiver<vk::Extent2D>,
    pending_extent: Option<vk::Extent2D>,
    frame: Option<ActiveFrame>,
    primaries: Vec<vk::CommandBuffer>,
    command_pool: CommandPool,
    descriptor_pool: DescriptorPool,
    sync: FrameSyncRing,
    // Dropped last: owns the device and the allocation table.
    ctx: ResourceContext<D>,
}

impl<D: GpuDevice> Renderer<D> {
    pub fn new(device: D, config: RendererConfig) -> Result<Self> {
        config.validate()?;
        let ctx = ResourceContext::new(device)?;
        let swapchain = ctx.device().swapchain_info();

        let sync = FrameSyncRing::new(
            ctx.device(),
            config.frames_in_flight,
            swapchain.image_count as usize,
            config.fence_timeout_ns,
        )?;
        let command_pool = CommandPool::new(ctx.device())?;
        let primaries = command_pool.allocate_command_buffers(
            ctx.device(),
            vk::CommandBufferLevel::PRIMARY,
            config.frames_in_flight as u32,
        )?;
        let descriptor_pool =
            DescriptorPool::new(ctx.device(), config.max_descriptor_sets, DESCRIPTORS_PER_SET)?;

        let (release_tx, release_rx) = unbounded();
        let (resize_tx, resize_rx) = unbounded();

        info!(
            "Renderer ready: {} frames in flight, {} presentable images at {}x{}",
            config.frames_in_flight,
            swapchain.image_count,
            swapchain.extent.width,
            swapchain.extent.height
        );

        Ok(Self {
            config,
            render_passes: HashMap::new(),
            commands: HashMap::new(),
            next_id: 0,
            release_tx,
            release_rx,
            resize_tx,
            resize_rx,
            pending_extent: None,
            frame: None,
            primaries,
            command_pool,
            descriptor_pool,
            sync,
            ctx,
        })
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub const fn config(&self) -> &RendererConfig {
        &self.config
    }

    pub fn device(&self) -> &D {
        self.ctx.device()
    }

    pub fn swapchain_info(&self) -> SwapchainInfo {
        self.ctx.device().swapchain_info()
    }

    pub fn image_count(&self) -> usize {
        self.sync.image_count()
    }

    /// A notifier for the windowing layer to report surface size changes.
    pub fn surface_notifier(&self) -> SurfaceNotifier {
        SurfaceNotifier {
            sender: self.resize_tx.clone(),
        }
    }

    pub fn create_render_pass(&mut self, settings: RenderPassSettings) -> Result<RenderPassHandle> {
        let id = RenderPassId(self.next_id());
        let swapchain = self.ctx.device().swapchain_info();
        let views = self.ctx.device().swapchain_image_views();
        let render_pass = RenderPass::new(&mut self.ctx, id, settings, &swapchain, &views)?;
        self.render_passes.insert(id, render_pass);
        Ok(RenderPassHandle::new(id, &self.release_tx))
    }

    pub fn create_pipeline(
        &mut self,
        settings: PipelineSettings,
        render_pass: &RenderPassHandle,
    ) -> Result<PipelineHandle> {
        let id = PipelineId(self.next_id());
        let pass = self
            .render_passes
            .get_mut(&render_pass.id())
            .ok_or(RenderError::UnknownRenderPass(render_pass.id()))?;
        let pipeline = Pipeline::new(self.ctx.device(), id, settings, pass.handle(), pass.samples())?;
        pass.insert_pipeline(pipeline);
        Ok(PipelineHandle::new(id, render_pass.clone(), &self.release_tx))
    }

    /// Take ownership of a command, upload its meshes and allocate its
    /// per-image recordings.
    pub fn add_command(&mut self, mut command: Command) -> Result<CommandHandle> {
        let id = CommandId(self.next_id());
        let image_count = self.sync.image_count();
        if let Err(e) = command.allocate(&mut self.ctx, &self.command_pool, image_count) {
            if let Err(release) = command.release(&mut self.ctx, &self.command_pool, &self.descriptor_pool) {
                error!("Failed to release partially added {id}: {release}");
            }
            return Err(e);
        }
        self.commands.insert(id, command);
        debug!("Added {id}");
        Ok(CommandHandle::new(id, &self.release_tx))
    }

    /// Mutable access to a command's meshes between frames or during one.
    pub fn command_mut(&mut self, handle: &CommandHandle) -> Result<&mut Command> {
        self.commands
            .get_mut(&handle.id())
            .ok_or(RenderError::UnknownCommand(handle.id()))
    }

    pub fn render_pass(&self, handle: &RenderPassHandle) -> Result<&RenderPass> {
        self.render_passes
            .get(&handle.id())
            .ok_or(RenderError::UnknownRenderPass(handle.id()))
    }

    /// Begin a frame on `render_pass`.
    ///
    /// Drains released handles and pending resizes first, then advances the
    /// frame ring, acquires an image and waits until no older frame still
    /// renders to it. An out-of-date surface runs the recreation cascade and
    /// skips the frame.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn start_frame(&mut self, render_pass: &RenderPassHandle) -> Result<FrameStatus> {
        if self.frame.is_some() {
            return Err(RenderError::FrameAlreadyStarted);
        }
        self.drain_releases()?;

        if let Some(extent) = self.resize_rx.try_iter().last() {
            self.pending_extent = Some(extent);
        }
        if let Some(extent) = self.pending_extent {
            if extent.width == 0 || extent.height == 0 {
                debug!("Surface has zero size, skipping frame");
                return Ok(FrameStatus::Skipped);
            }
            self.recreate(extent)?;
        }

        let render_pass = render_pass.id();
        if !self.render_passes.contains_key(&render_pass) {
            return Err(RenderError::UnknownRenderPass(render_pass));
        }

        let slot = self.sync.begin_frame(self.ctx.device())?;
        let acquired = self
            .ctx
            .device()
            .acquire_next_image(slot.image_available, self.config.fence_timeout_ns)?;
        let (image_index, suboptimal) = match acquired {
            AcquireOutcome::Acquired {
                image_index,
                suboptimal,
            } => (image_index, suboptimal),
            AcquireOutcome::OutOfDate => {
                let extent = self.ctx.device().swapchain_info().extent;
                self.recreate(extent)?;
                return Ok(FrameStatus::Skipped);
            }
        };
        self.sync.wait_for_image(self.ctx.device(), image_index)?;

        self.frame = Some(ActiveFrame {
            render_pass,
            image_index,
            slot,
            suboptimal,
            drawn: Vec::new(),
            secondaries: Vec::new(),
        });
        Ok(FrameStatus::Started { image_index })
    }

    /// Draw `command` with `pipeline` in the current frame.
    ///
    /// Uploads the command's outdated uniforms for this image and re-records
    /// its recording for this image if it is stale.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn draw(&mut self, command: &CommandHandle, pipeline: &PipelineHandle) -> Result<()> {
        let frame = self.frame.as_mut().ok_or(RenderError::NoActiveFrame)?;
        if pipeline.render_pass().id() != frame.render_pass {
            return Err(RenderError::PipelineNotInActivePass {
                pipeline: pipeline.id(),
                render_pass: frame.render_pass,
            });
        }
        if frame.drawn.contains(&command.id()) {
            return Err(RenderError::CommandAlreadyDrawn(command.id()));
        }

        let render_pass = self
            .render_passes
            .get(&frame.render_pass)
            .ok_or(RenderError::UnknownRenderPass(frame.render_pass))?;
        let pipeline_object = render_pass
            .pipeline(pipeline.id())
            .ok_or(RenderError::UnknownPipeline(pipeline.id()))?;
        let target = RecordTarget {
            render_pass_id: render_pass.id(),
            render_pass: render_pass.handle(),
            framebuffer: render_pass.framebuffer(frame.image_index)?,
            extent: render_pass.extent(),
            pipeline: pipeline_object,
        };
        let entry = self
            .commands
            .get_mut(&command.id())
            .ok_or(RenderError::UnknownCommand(command.id()))?;

        entry.upload_uniforms(&mut self.ctx, frame.image_index)?;
        let secondary = entry.prepare(&mut self.ctx, &self.descriptor_pool, frame.image_index, target)?;
        frame.drawn.push(command.id());
        frame.secondaries.push(secondary);
        Ok(())
    }

    /// Record the frame's primary command buffer, submit it and present.
    ///
    /// A suboptimal or out-of-date surface runs the recreation cascade after
    /// presenting; that is not an error.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn present_frame(&mut self) -> Result<()> {
        let frame = self.frame.take().ok_or(RenderError::NoActiveFrame)?;
        let render_pass = self
            .render_passes
            .get(&frame.render_pass)
            .ok_or(RenderError::UnknownRenderPass(frame.render_pass))?;
        let device = self.ctx.device();
        let primary = self.primaries[self.sync.current_index()];

        // The slot's fence was waited on in start_frame, so the last use has retired.
        device.reset_command_buffer(primary)?;
        device.begin_command_buffer(primary, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT, None)?;
        render_pass.begin(device, primary, frame.image_index)?;
        if !frame.secondaries.is_empty() {
            device.cmd_execute_commands(primary, &frame.secondaries);
        }
        device.cmd_end_render_pass(primary);
        device.end_command_buffer(primary)?;

        let fence = self.sync.reset_current_fence(device)?;
        device.queue_submit(&Submission {
            command_buffers: &[primary],
            wait_semaphores: &[frame.slot.image_available],
            wait_stages: &[vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT],
            signal_semaphores: &[frame.slot.render_finished],
            fence,
        })?;
        self.sync.mark_image_in_flight(frame.image_index);

        let presented = self
            .ctx
            .device()
            .present(frame.image_index, frame.slot.render_finished)?;
        if frame.suboptimal || presented.needs_recreation() {
            let extent = self
                .pending_extent
                .unwrap_or_else(|| self.ctx.device().swapchain_info().extent);
            self.recreate(extent)?;
        }
        Ok(())
    }

    /// Rebuild everything that depends on the presentation surface.
    pub fn recreate_swapchain(&mut self, extent: vk::Extent2D) -> Result<()> {
        if self.frame.is_some() {
            return Err(RenderError::FrameAlreadyStarted);
        }
        self.recreate(extent)
    }

    /// Wait for the device, rebuild the swapchain, resize the image-in-flight
    /// map, rebuild every render pass with its pipelines, then outdate every
    /// command.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn recreate(&mut self, extent: vk::Extent2D) -> Result<()> {
        info!("Recreating swapchain at {}x{}", extent.width, extent.height);
        self.ctx.device().wait_idle()?;
        let swapchain = self.ctx.device_mut().recreate_swapchain(extent)?;
        self.pending_extent = None;

        let image_count = swapchain.image_count as usize;
        self.sync.resize_images(image_count);

        let views = self.ctx.device().swapchain_image_views();
        for render_pass in self.render_passes.values_mut() {
            render_pass.recreate(&mut self.ctx, &swapchain, &views)?;
        }
        for command in self.commands.values_mut() {
            command.reallocate(
                &mut self.ctx,
                &self.command_pool,
                &self.descriptor_pool,
                image_count,
            )?;
        }
        debug!(
            "Recreated {} render passes and {} commands for {image_count} images",
            self.render_passes.len(),
            self.commands.len()
        );
        Ok(())
    }

    /// Wait for the device and remove objects whose last handle was dropped.
    ///
    /// Fails with [`RenderError::FrameAlreadyStarted`] while a frame is in
    /// progress.
    pub fn wait_idle(&mut self) -> Result<()> {
        if self.frame.is_some() {
            return Err(RenderError::FrameAlreadyStarted);
        }
        self.ctx.device().wait_idle()?;
        self.drain_releases()
    }

    /// Remove released objects after one device idle wait, dependents first.
    fn drain_releases(&mut self) -> Result<()> {
        let mut released: Vec<Release> = self.release_rx.try_iter().collect();
        if released.is_empty() {
            return Ok(());
        }
        released.sort_unstable();
        self.ctx.device().wait_idle()?;

        for release in released {
            match release {
                Release::Command(id) => {
                    if let Some(mut command) = self.commands.remove(&id) {
                        command.release(&mut self.ctx, &self.command_pool, &self.descriptor_pool)?;
                        debug!("Removed {id}");
                    }
                }
                Release::Pipeline(id) => {
                    for command in self.commands.values_mut() {
                        command.release_pipeline(self.ctx.device(), &self.descriptor_pool, id)?;
                    }
                    for render_pass in self.render_passes.values_mut() {
                        if let Some(pipeline) = render_pass.remove_pipeline(id) {
                            pipeline.destroy(self.ctx.device());
                        }
                    }
                }
                Release::RenderPass(id) => {
                    if let Some(render_pass) = self.render_passes.remove(&id) {
                        render_pass.destroy(&mut self.ctx)?;
                    }
                }
            }
        }
        Ok(())
    }
}

impl<D: GpuDevice> Drop for Renderer<D> {
    fn drop(&mut self) {
        if let Err(e) = self.ctx.device().wait_idle() {
            error!("Failed to wait for device idle on shutdown: {e}");
        }
        for (id, mut command) in self.commands.drain() {
            if let Err(e) = command.release(&mut self.ctx, &self.command_pool, &self.descriptor_pool) {
                warn!("Failed to release {id}: {e}");
            }
        }
        for (id, render_pass) in self.render_passes.drain() {
            if let Err(e) = render_pass.destroy(&mut self.ctx) {
                warn!("Failed to destroy {id}: {e}");
            }
        }
        let device = self.ctx.device();
        self.descriptor_pool.destroy(device);
        self.command_pool.destroy(device);
        self.sync.destroy(device);
        debug!("Renderer destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::Mesh;
    use crate::shader::ShaderStage;
    use crate::uniform::UniformBuffer;
    use crate::vertex::ColorVertex;
    use lucent_gpu::{FenceState, GpuError, MockCommand, MockDevice, MockEvent, PresentOutcome};

    fn renderer(device: MockDevice) -> Renderer<MockDevice> {
        Renderer::new(device, RendererConfig::default()).unwrap()
    }

    fn pipeline_settings() -> PipelineSettings {
        PipelineSettings::new(vec![
            ShaderStage::new(vk::ShaderStageFlags::VERTEX, vec![0x0723_0203]).with_uniform_buffer(0, 0),
            ShaderStage::new(vk::ShaderStageFlags::FRAGMENT, vec![0x0723_0203]),
        ])
        .for_vertex::<ColorVertex>()
    }

    fn triangle() -> Command {
        let mesh = Mesh::new(&[ColorVertex::default(); 3])
            .unwrap()
            .with_uniform(UniformBuffer::new(0, 0, &[0.0_f32; 4]));
        Command::new().with_mesh(mesh)
    }

    struct Scene {
        renderer: Renderer<MockDevice>,
        render_pass: RenderPassHandle,
        pipeline: PipelineHandle,
        command: CommandHandle,
    }

    fn scene(device: MockDevice) -> Scene {
        let mut renderer = renderer(device);
        let render_pass = renderer
            .create_render_pass(RenderPassSettings::default())
            .unwrap();
        let pipeline = renderer
            .create_pipeline(pipeline_settings(), &render_pass)
            .unwrap();
        let command = renderer.add_command(triangle()).unwrap();
        renderer.device().clear_events();
        Scene {
            renderer,
            render_pass,
            pipeline,
            command,
        }
    }

    impl Scene {
        fn frame(&mut self) -> FrameStatus {
            let status = self.renderer.start_frame(&self.render_pass).unwrap();
            if status.is_started() {
                self.renderer.draw(&self.command, &self.pipeline).unwrap();
                self.renderer.present_frame().unwrap();
            }
            status
        }
    }

    #[test]
    fn five_frames_on_two_slots_block_three_times() {
        let mut scene = scene(MockDevice::new());
        for _ in 0..5 {
            assert!(scene.frame().is_started());
        }
        let device = scene.renderer.device();
        assert_eq!(device.blocking_fence_waits(), 3);
        assert_eq!(device.submissions(), 5);
        assert!(device.max_pending_fences() <= 2);

        // The first two frames find their slots idle.
        let waits: Vec<bool> = device
            .events()
            .iter()
            .filter_map(|e| match e {
                MockEvent::FenceWait { blocked, .. } => Some(*blocked),
                _ => None,
            })
            .collect();
        assert!(!waits[0]);
        assert!(!waits[1]);
    }

    #[test]
    fn slot_primaries_are_reset_before_each_frame() {
        let mut scene = scene(MockDevice::new());
        for _ in 0..3 {
            scene.frame();
        }
        let device = scene.renderer.device();
        let first = scene.renderer.primaries[0];
        let second = scene.renderer.primaries[1];
        assert_eq!(device.reset_count(first), 2);
        assert_eq!(device.recording_count(first), 2);
        assert_eq!(device.reset_count(second), 1);

        // Only the latest frame is in the buffer.
        let passes = device
            .recorded(first)
            .iter()
            .filter(|c| matches!(c, MockCommand::BeginRenderPass { .. }))
            .count();
        assert_eq!(passes, 1);
    }

    #[test]
    fn ring_bounds_pending_submissions() {
        let mut scene = scene(MockDevice::new().with_image_count(4));
        for _ in 0..12 {
            scene.frame();
        }
        assert!(scene.renderer.device().max_pending_fences() <= 2);
    }

    #[test]
    fn image_in_flight_is_waited_before_reuse() {
        // Three images on two slots: frame 3 reuses slot 0 while image 2 is
        // fresh, frame 4 reuses slot 1 while image 0 was last rendered by slot 0.
        let mut scene = scene(MockDevice::new().with_image_count(3));
        for _ in 0..4 {
            scene.frame();
        }
        let events = scene.renderer.device().events();
        let submits: Vec<vk::Fence> = events
            .iter()
            .filter_map(|e| match e {
                MockEvent::Submit { fence, .. } => Some(*fence),
                _ => None,
            })
            .collect();
        let first_fence = submits[0];

        // Before the fourth submit, image 0's fence (slot 0) was waited on.
        let fourth_submit = events
            .iter()
            .enumerate()
            .filter(|(_, e)| matches!(e, MockEvent::Submit { .. }))
            .nth(3)
            .map(|(i, _)| i)
            .unwrap();
        let last_acquire = events[..fourth_submit]
            .iter()
            .rposition(|e| matches!(e, MockEvent::Acquire(_)))
            .unwrap();
        assert!(events[last_acquire..fourth_submit]
            .iter()
            .any(|e| matches!(e, MockEvent::FenceWait { fence, .. } if *fence == first_fence)));
    }

    #[test]
    fn one_submission_per_frame_executes_every_draw() {
        let mut scene = scene(MockDevice::new());
        let second = scene.renderer.add_command(triangle()).unwrap();

        scene.renderer.start_frame(&scene.render_pass).unwrap();
        scene.renderer.draw(&scene.command, &scene.pipeline).unwrap();
        scene.renderer.draw(&second, &scene.pipeline).unwrap();
        assert!(matches!(
            scene.renderer.draw(&second, &scene.pipeline),
            Err(RenderError::CommandAlreadyDrawn(_))
        ));
        scene.renderer.present_frame().unwrap();

        let device = scene.renderer.device();
        assert_eq!(device.submissions(), 1);
        let Some(MockEvent::Submit {
            command_buffers, ..
        }) = device.events().into_iter().find(|e| matches!(e, MockEvent::Submit { .. }))
        else {
            panic!("no submission");
        };
        let recorded = device.recorded(command_buffers[0]);
        assert!(matches!(recorded[0], MockCommand::BeginRenderPass { .. }));
        assert!(matches!(&recorded[1], MockCommand::ExecuteCommands(s) if s.len() == 2));
        assert_eq!(recorded[2], MockCommand::EndRenderPass);
    }

    #[test]
    fn outdated_mesh_rerecords_every_image() {
        let mut scene = scene(MockDevice::new());
        scene.frame();
        scene.frame();

        let command = scene.renderer.command_mut(&scene.command).unwrap();
        assert!(!command.is_outdated(0).unwrap());
        command.mesh_mut(0).unwrap().set_outdated();
        assert!(command.is_outdated(0).unwrap());
        assert!(command.is_outdated(1).unwrap());
    }

    #[test]
    fn uniform_upload_is_guarded_at_the_call_site() {
        let mut scene = scene(MockDevice::new());
        let live = scene.renderer.device().live_memory_count();
        scene.frame();
        scene.frame();

        let command = scene.renderer.command_mut(&scene.command).unwrap();
        let mesh = command.mesh_mut(0).unwrap();
        assert!(!mesh.uniforms()[0].is_outdated(0));
        assert!(!mesh.update_uniform(0, 0, &[0.0_f32; 4]).unwrap());
        assert!(!mesh.uniforms()[0].is_outdated(0));
        assert!(mesh.update_uniform(0, 0, &[1.0_f32; 4]).unwrap());
        assert!(mesh.uniforms()[0].is_outdated(0));
        assert!(mesh.uniforms()[0].is_outdated(1));
        // A uniform change needs no new recording.
        assert!(!command.is_outdated(0).unwrap());

        scene.frame();
        let mesh = &scene.renderer.command_mut(&scene.command).unwrap().meshes()[0];
        assert!(!mesh.uniforms()[0].is_outdated(0));
        assert!(mesh.uniforms()[0].is_outdated(1));
        assert_eq!(scene.renderer.device().live_memory_count(), live);
    }

    #[test]
    fn recreation_rebuilds_framebuffers_and_outdates_commands() {
        let mut scene = scene(MockDevice::new());
        scene.frame();
        scene.frame();

        scene.renderer.device().set_image_count_on_recreate(3);
        scene
            .renderer
            .recreate_swapchain(vk::Extent2D {
                width: 1280,
                height: 720,
            })
            .unwrap();

        assert_eq!(scene.renderer.image_count(), 3);
        let render_pass = scene.renderer.render_pass(&scene.render_pass).unwrap();
        assert_eq!(render_pass.framebuffer_count(), 3);
        assert_eq!(render_pass.pipeline_count(), 1);
        assert_eq!(scene.renderer.device().live_count("framebuffer"), 3);
        assert_eq!(scene.renderer.device().live_count("pipeline"), 1);

        let command = scene.renderer.command_mut(&scene.command).unwrap();
        assert_eq!(command.image_count(), 3);
        for i in 0..3 {
            assert!(command.is_outdated(i).unwrap());
        }

        for _ in 0..3 {
            assert!(scene.frame().is_started());
        }
    }

    #[test]
    fn resize_is_applied_at_frame_start() {
        let mut scene = scene(MockDevice::new());
        let notifier = scene.renderer.surface_notifier();
        notifier.notify_resized(640, 480);
        notifier.notify_resized(1024, 768);

        assert!(scene.frame().is_started());
        let recreations: Vec<vk::Extent2D> = scene
            .renderer
            .device()
            .events()
            .iter()
            .filter_map(|e| match e {
                MockEvent::RecreateSwapchain(extent) => Some(*extent),
                _ => None,
            })
            .collect();
        assert_eq!(
            recreations,
            vec![vk::Extent2D {
                width: 1024,
                height: 768
            }]
        );
    }

    #[test]
    fn zero_extent_skips_without_recreating() {
        let mut scene = scene(MockDevice::new());
        let notifier = scene.renderer.surface_notifier();
        notifier.notify_resized(0, 0);

        assert_eq!(scene.frame(), FrameStatus::Skipped);
        assert_eq!(scene.frame(), FrameStatus::Skipped);
        assert_eq!(scene.renderer.device().submissions(), 0);

        notifier.notify_resized(800, 600);
        assert!(scene.frame().is_started());
        assert_eq!(scene.renderer.device().submissions(), 1);
    }

    #[test]
    fn out_of_date_acquire_skips_the_frame() {
        let mut scene = scene(MockDevice::new());
        scene.renderer.device().script_acquire(AcquireOutcome::OutOfDate);

        assert_eq!(scene.frame(), FrameStatus::Skipped);
        let device = scene.renderer.device();
        assert_eq!(device.submissions(), 0);
        assert!(device
            .events()
            .iter()
            .any(|e| matches!(e, MockEvent::RecreateSwapchain(_))));

        assert!(scene.frame().is_started());
    }

    #[test]
    fn suboptimal_present_runs_the_cascade() {
        let mut scene = scene(MockDevice::new());
        scene.renderer.device().script_present(PresentOutcome::Suboptimal);
        assert!(scene.frame().is_started());

        let events = scene.renderer.device().events();
        let present = events
            .iter()
            .position(|e| matches!(e, MockEvent::Present { .. }))
            .unwrap();
        assert!(matches!(events[present + 1], MockEvent::DeviceWaitIdle));
        assert!(matches!(events[present + 2], MockEvent::RecreateSwapchain(_)));
    }

    #[test]
    fn suboptimal_acquire_recreates_after_present() {
        let mut scene = scene(MockDevice::new());
        scene.renderer.device().script_acquire(AcquireOutcome::Acquired {
            image_index: 0,
            suboptimal: true,
        });
        assert!(scene.frame().is_started());

        let events = scene.renderer.device().events();
        assert_eq!(scene.renderer.device().submissions(), 1);
        assert!(matches!(events.last(), Some(MockEvent::RecreateSwapchain(_))));
    }

    #[test]
    fn timeout_is_fatal() {
        let mut scene = scene(MockDevice::new());
        scene.frame();
        // Reset a slot fence behind the ring's back so nothing will signal it.
        let fence = scene.renderer.sync.current().in_flight;
        scene.renderer.device().wait_idle().unwrap();
        scene.renderer.device().reset_fences(&[fence]).unwrap();
        assert_eq!(
            scene.renderer.device().fence_state(fence),
            Some(FenceState::Unsignaled)
        );
        scene.frame();

        let result = scene.renderer.start_frame(&scene.render_pass);
        assert!(matches!(result, Err(RenderError::Gpu(GpuError::Timeout))));
    }

    #[test]
    fn released_handles_are_removed_after_idle() {
        let mut scene = scene(MockDevice::new());
        scene.frame();

        let Scene {
            mut renderer,
            render_pass,
            pipeline,
            command,
        } = scene;
        drop(command);
        renderer.wait_idle().unwrap();
        assert!(renderer.commands.is_empty());
        assert_eq!(renderer.device().live_descriptor_sets(), 0);

        // The pipeline handle keeps the render pass alive.
        drop(render_pass);
        renderer.wait_idle().unwrap();
        assert_eq!(renderer.render_passes.len(), 1);

        drop(pipeline);
        renderer.wait_idle().unwrap();
        assert!(renderer.render_passes.is_empty());
        assert_eq!(renderer.device().live_count("pipeline"), 0);
        assert_eq!(renderer.device().live_count("render pass"), 0);
        assert_eq!(renderer.device().live_count("framebuffer"), 0);
        assert!(renderer.ctx.allocations().is_empty());
    }

    #[test]
    fn drawing_requires_a_frame_and_a_matching_pass() {
        let mut scene = scene(MockDevice::new());
        assert!(matches!(
            scene.renderer.draw(&scene.command, &scene.pipeline),
            Err(RenderError::NoActiveFrame)
        ));
        assert!(matches!(
            scene.renderer.present_frame(),
            Err(RenderError::NoActiveFrame)
        ));

        let other_pass = scene
            .renderer
            .create_render_pass(RenderPassSettings::default().with_depth(false))
            .unwrap();
        scene.renderer.start_frame(&other_pass).unwrap();
        assert!(matches!(
            scene.renderer.draw(&scene.command, &scene.pipeline),
            Err(RenderError::PipelineNotInActivePass { .. })
        ));
        assert!(matches!(
            scene.renderer.start_frame(&other_pass),
            Err(RenderError::FrameAlreadyStarted)
        ));
        scene.renderer.present_frame().unwrap();
    }

    #[test]
    fn wait_idle_is_refused_mid_frame() {
        let mut scene = scene(MockDevice::new());
        scene.renderer.start_frame(&scene.render_pass).unwrap();
        scene.renderer.device().clear_events();

        assert!(matches!(
            scene.renderer.wait_idle(),
            Err(RenderError::FrameAlreadyStarted)
        ));
        assert!(!scene
            .renderer
            .device()
            .events()
            .contains(&MockEvent::DeviceWaitIdle));

        scene.renderer.draw(&scene.command, &scene.pipeline).unwrap();
        scene.renderer.present_frame().unwrap();
        scene.renderer.wait_idle().unwrap();
        assert!(scene
            .renderer
            .device()
            .events()
            .contains(&MockEvent::DeviceWaitIdle));
    }

    #[test]
    fn dropping_mid_frame_releases_cleanly() {
        let Scene {
            mut renderer,
            render_pass,
            pipeline,
            command,
        } = scene(MockDevice::new().with_image_count(3));
        renderer.start_frame(&render_pass).unwrap();
        renderer.draw(&command, &pipeline).unwrap();
        assert!(renderer.device().live_object_count() > 0);

        // Handles may outlive the renderer; their releases go nowhere.
        drop(renderer);
        drop((command, pipeline, render_pass));
    }
}
