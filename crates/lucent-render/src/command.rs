//! Dirty-tracking draw commands.
//!
//! A command owns one secondary command buffer per presentable image. A
//! recording is reused until it goes stale: when any mesh of the command
//! reports outdated, every image's recording is marked outdated, not only the
//! image drawn next. A recording is also stale when drawn with a different
//! pipeline than the one it was recorded with.

use crate::error::{RenderError, Result};
use crate::handle::{PipelineId, RenderPassId};
use crate::mesh::Mesh;
use crate::pipeline::Pipeline;
use ash::vk;
use lucent_gpu::{begin_secondary, CommandPool, DescriptorPool, GpuDevice, Inheritance, ResourceContext};

/// What a recording is recorded against.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RecordTarget<'a> {
    pub render_pass_id: RenderPassId,
    pub render_pass: vk::RenderPass,
    pub framebuffer: vk::Framebuffer,
    pub extent: vk::Extent2D,
    pub pipeline: &'a Pipeline,
}

impl RecordTarget<'_> {
    fn key(&self) -> (RenderPassId, PipelineId) {
        (self.render_pass_id, self.pipeline.id())
    }
}

/// Recording state of one presentable image.
#[derive(Debug, Clone, Copy)]
struct Recording {
    buffer: vk::CommandBuffer,
    outdated: bool,
    recorded_with: Option<(RenderPassId, PipelineId)>,
}

/// An ordered list of meshes drawn with one pipeline.
#[derive(Debug, Default)]
pub struct Command {
    meshes: Vec<Mesh>,
    recordings: Vec<Recording>,
}

impl Command {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_mesh(mut self, mesh: Mesh) -> Self {
        self.meshes.push(mesh);
        self
    }

    pub fn meshes(&self) -> &[Mesh] {
        &self.meshes
    }

    pub fn mesh_mut(&mut self, index: usize) -> Option<&mut Mesh> {
        self.meshes.get_mut(index)
    }

    /// Number of presentable images this command records for. Zero until the
    /// command is added to a renderer.
    pub fn image_count(&self) -> usize {
        self.recordings.len()
    }

    /// Whether `image_index`'s recording must be redone.
    ///
    /// An outdated mesh marks every image outdated before the flag of
    /// `image_index` is read.
    pub fn is_outdated(&mut self, image_index: u32) -> Result<bool> {
        let count = self.recordings.len();
        if image_index as usize >= count {
            return Err(RenderError::ImageIndexOutOfRange {
                index: image_index,
                count,
            });
        }
        if self.meshes.iter().any(Mesh::is_outdated) {
            self.mark_all_outdated();
        }
        Ok(self.recordings[image_index as usize].outdated)
    }

    /// Whether drawing `image_index` against `key` needs a new recording.
    fn needs_recording(&mut self, image_index: u32, key: (RenderPassId, PipelineId)) -> Result<bool> {
        let outdated = self.is_outdated(image_index)?;
        Ok(outdated || self.recordings[image_index as usize].recorded_with != Some(key))
    }

    pub(crate) fn mark_all_outdated(&mut self) {
        for recording in &mut self.recordings {
            recording.outdated = true;
        }
    }

    /// Allocate one secondary buffer per image and upload the meshes.
    pub(crate) fn allocate<D: GpuDevice>(
        &mut self,
        ctx: &mut ResourceContext<D>,
        pool: &CommandPool,
        image_count: usize,
    ) -> Result<()> {
        self.allocate_recordings(ctx.device(), pool, image_count)?;
        for mesh in &mut self.meshes {
            mesh.allocate(ctx, image_count)?;
        }
        Ok(())
    }

    fn allocate_recordings<D: GpuDevice>(
        &mut self,
        device: &D,
        pool: &CommandPool,
        image_count: usize,
    ) -> Result<()> {
        let buffers = pool.allocate_command_buffers(
            device,
            vk::CommandBufferLevel::SECONDARY,
            image_count as u32,
        )?;
        self.recordings = buffers
            .into_iter()
            .map(|buffer| Recording {
                buffer,
                outdated: true,
                recorded_with: None,
            })
            .collect();
        Ok(())
    }

    fn free_recordings<D: GpuDevice>(&mut self, device: &D, pool: &CommandPool) {
        let buffers: Vec<vk::CommandBuffer> = self.recordings.drain(..).map(|r| r.buffer).collect();
        if !buffers.is_empty() {
            pool.free(device, &buffers);
        }
    }

    /// Rebuild per-image state after the swapchain was recreated. Every
    /// recording ends up outdated and every descriptor set is written again.
    /// The device must be idle.
    pub(crate) fn reallocate<D: GpuDevice>(
        &mut self,
        ctx: &mut ResourceContext<D>,
        command_pool: &CommandPool,
        descriptor_pool: &DescriptorPool,
        image_count: usize,
    ) -> Result<()> {
        let previous = self.recordings.len();
        self.free_recordings(ctx.device(), command_pool);
        self.allocate_recordings(ctx.device(), command_pool, image_count)?;
        for mesh in &mut self.meshes {
            mesh.invalidate_descriptors(ctx.device(), descriptor_pool)?;
            if previous != image_count {
                mesh.reallocate_uniforms(ctx, image_count)?;
            }
        }
        Ok(())
    }

    /// Upload this image's outdated uniform data.
    pub(crate) fn upload_uniforms<D: GpuDevice>(
        &mut self,
        ctx: &mut ResourceContext<D>,
        image_index: u32,
    ) -> Result<()> {
        for mesh in &mut self.meshes {
            mesh.upload_uniforms(ctx, image_index)?;
        }
        Ok(())
    }

    /// Secondary buffer to execute for `image_index`, re-recorded first if it
    /// is stale.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub(crate) fn prepare<D: GpuDevice>(
        &mut self,
        ctx: &mut ResourceContext<D>,
        descriptor_pool: &DescriptorPool,
        image_index: u32,
        target: RecordTarget<'_>,
    ) -> Result<vk::CommandBuffer> {
        if self.needs_recording(image_index, target.key())? {
            self.record(ctx, descriptor_pool, image_index, target)?;
        }
        Ok(self.recordings[image_index as usize].buffer)
    }

    fn record<D: GpuDevice>(
        &mut self,
        ctx: &mut ResourceContext<D>,
        descriptor_pool: &DescriptorPool,
        image_index: u32,
        target: RecordTarget<'_>,
    ) -> Result<()> {
        let index = image_index as usize;
        let image_count = self.recordings.len();
        for mesh in &mut self.meshes {
            mesh.sync_geometry(ctx)?;
            mesh.prepare_descriptors(
                ctx.device(),
                descriptor_pool,
                target.pipeline,
                image_count,
                index,
            )?;
        }

        let device = ctx.device();
        let cmd = self.recordings[index].buffer;
        begin_secondary(
            device,
            cmd,
            Inheritance {
                render_pass: target.render_pass,
                framebuffer: target.framebuffer,
            },
        )?;
        device.cmd_bind_pipeline(cmd, target.pipeline.handle());
        device.cmd_set_viewport_scissor(cmd, target.extent);
        for mesh in &self.meshes {
            mesh.record(device, cmd, target.pipeline, index);
        }
        device.end_command_buffer(cmd)?;

        for mesh in &mut self.meshes {
            mesh.mark_recorded();
        }
        let recording = &mut self.recordings[index];
        recording.outdated = false;
        recording.recorded_with = Some(target.key());
        Ok(())
    }

    /// Free the descriptor sets written for a removed pipeline.
    pub(crate) fn release_pipeline<D: GpuDevice>(
        &mut self,
        device: &D,
        descriptor_pool: &DescriptorPool,
        pipeline: PipelineId,
    ) -> Result<()> {
        for mesh in &mut self.meshes {
            mesh.release_pipeline(device, descriptor_pool, pipeline)?;
        }
        for recording in &mut self.recordings {
            if recording.recorded_with.is_some_and(|(_, p)| p == pipeline) {
                recording.outdated = true;
                recording.recorded_with = None;
            }
        }
        Ok(())
    }

    /// Release every GPU object of the command. The device must be idle.
    pub(crate) fn release<D: GpuDevice>(
        &mut self,
        ctx: &mut ResourceContext<D>,
        command_pool: &CommandPool,
        descriptor_pool: &DescriptorPool,
    ) -> Result<()> {
        self.free_recordings(ctx.device(), command_pool);
        for mesh in &mut self.meshes {
            mesh.release(ctx, descriptor_pool)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::PipelineSettings;
    use crate::shader::ShaderStage;
    use crate::uniform::{PushConstant, UniformBuffer, UniformImage};
    use crate::vertex::{ColorVertex, TexturedVertex};
    use lucent_gpu::{DescriptorResource, MockCommand, MockDevice};

    struct Fixture {
        ctx: ResourceContext<MockDevice>,
        command_pool: CommandPool,
        descriptor_pool: DescriptorPool,
        pipeline: Pipeline,
    }

    fn target(pipeline: &Pipeline) -> RecordTarget<'_> {
        RecordTarget {
            render_pass_id: RenderPassId(1),
            render_pass: vk::RenderPass::null(),
            framebuffer: vk::Framebuffer::null(),
            extent: vk::Extent2D {
                width: 800,
                height: 600,
            },
            pipeline,
        }
    }

    impl Fixture {
        fn new() -> Self {
            let ctx = ResourceContext::new(MockDevice::new()).unwrap();
            let command_pool = CommandPool::new(ctx.device()).unwrap();
            let descriptor_pool = DescriptorPool::new(ctx.device(), 16, 4).unwrap();
            let settings = PipelineSettings::new(vec![ShaderStage::new(
                vk::ShaderStageFlags::VERTEX,
                vec![0x0723_0203],
            )
            .with_uniform_buffer(0, 0)])
            .for_vertex::<ColorVertex>();
            let pipeline = Pipeline::new(
                ctx.device(),
                PipelineId(1),
                settings,
                vk::RenderPass::null(),
                vk::SampleCountFlags::TYPE_1,
            )
            .unwrap();
            Self {
                ctx,
                command_pool,
                descriptor_pool,
                pipeline,
            }
        }

        fn command(&mut self) -> Command {
            let mesh = Mesh::indexed(&[ColorVertex::default(); 3], &[0, 1, 2])
                .unwrap()
                .with_uniform(UniformBuffer::new(0, 0, &[0.0_f32; 4]));
            let mut command = Command::new().with_mesh(mesh);
            command.allocate(&mut self.ctx, &self.command_pool, 2).unwrap();
            command
        }

        fn prepare(&mut self, command: &mut Command, image_index: u32) -> vk::CommandBuffer {
            let target = target(&self.pipeline);
            command
                .prepare(&mut self.ctx, &self.descriptor_pool, image_index, target)
                .unwrap()
        }
    }

    #[test]
    fn set_outdated_marks_every_image() {
        let mut fixture = Fixture::new();
        let mut command = fixture.command();
        fixture.prepare(&mut command, 0);
        fixture.prepare(&mut command, 1);
        assert!(!command.is_outdated(0).unwrap());
        assert!(!command.is_outdated(1).unwrap());

        command.mesh_mut(0).unwrap().set_outdated();
        assert!(command.is_outdated(0).unwrap());
        assert!(command.is_outdated(1).unwrap());
    }

    #[test]
    fn out_of_range_image_is_an_error() {
        let mut fixture = Fixture::new();
        let mut command = fixture.command();
        assert!(matches!(
            command.is_outdated(2),
            Err(RenderError::ImageIndexOutOfRange { index: 2, count: 2 })
        ));
    }

    #[test]
    fn recordings_are_reused_until_stale() {
        let mut fixture = Fixture::new();
        let mut command = fixture.command();
        let cmd = fixture.prepare(&mut command, 0);
        assert_eq!(fixture.ctx.device().recording_count(cmd), 1);

        assert_eq!(fixture.prepare(&mut command, 0), cmd);
        assert_eq!(fixture.ctx.device().recording_count(cmd), 1);

        command.mesh_mut(0).unwrap().set_outdated();
        fixture.prepare(&mut command, 0);
        assert_eq!(fixture.ctx.device().recording_count(cmd), 2);
    }

    #[test]
    fn recording_binds_pipeline_sets_and_geometry() {
        let mut fixture = Fixture::new();
        let mut command = fixture.command();
        let cmd = fixture.prepare(&mut command, 1);

        let recorded = fixture.ctx.device().recorded(cmd);
        assert_eq!(recorded[0], MockCommand::BindPipeline(fixture.pipeline.handle()));
        assert!(matches!(recorded[1], MockCommand::SetViewportScissor(_)));
        assert!(matches!(
            recorded[2],
            MockCommand::BindDescriptorSets { first_set: 0, .. }
        ));
        assert_eq!(recorded.last(), Some(&MockCommand::DrawIndexed(3)));
        assert_eq!(
            fixture.ctx.device().inherited_framebuffer(cmd),
            Some(vk::Framebuffer::null())
        );

        // Only image 1's sets were written.
        assert_eq!(fixture.ctx.device().descriptor_writes().len(), 1);
        assert_eq!(fixture.ctx.device().live_descriptor_sets(), 2);
    }

    #[test]
    fn reallocate_outdates_everything_and_rewrites_descriptors() {
        let mut fixture = Fixture::new();
        let mut command = fixture.command();
        fixture.prepare(&mut command, 0);
        fixture.prepare(&mut command, 1);

        command
            .reallocate(&mut fixture.ctx, &fixture.command_pool, &fixture.descriptor_pool, 3)
            .unwrap();
        assert_eq!(command.image_count(), 3);
        for i in 0..3 {
            assert!(command.is_outdated(i).unwrap());
        }
        assert_eq!(fixture.ctx.device().live_descriptor_sets(), 0);

        fixture.prepare(&mut command, 2);
        assert_eq!(fixture.ctx.device().live_descriptor_sets(), 3);
        assert_eq!(fixture.ctx.device().descriptor_writes().len(), 3);
    }

    #[test]
    fn textured_mesh_binds_its_set_and_push_constants() {
        let mut fixture = Fixture::new();
        let textured = Pipeline::new(
            fixture.ctx.device(),
            PipelineId(3),
            PipelineSettings::new(vec![
                ShaderStage::new(vk::ShaderStageFlags::VERTEX, vec![0x0723_0203])
                    .with_push_constants(0, 16),
                ShaderStage::new(vk::ShaderStageFlags::FRAGMENT, vec![0x0723_0203])
                    .with_sampled_image(1, 0),
            ])
            .for_vertex::<TexturedVertex>(),
            vk::RenderPass::null(),
            vk::SampleCountFlags::TYPE_1,
        )
        .unwrap();

        let extent = vk::Extent2D {
            width: 2,
            height: 2,
        };
        let mesh = Mesh::new(&[TexturedVertex::default(); 3])
            .unwrap()
            .with_image(UniformImage::rgba8(1, 0, extent, vec![255; 16]).unwrap())
            .with_push_constant(PushConstant::new(vk::ShaderStageFlags::VERTEX, 0, &[0.0_f32; 4]));
        let mut command = Command::new().with_mesh(mesh);
        command.allocate(&mut fixture.ctx, &fixture.command_pool, 2).unwrap();

        let cmd = command
            .prepare(&mut fixture.ctx, &fixture.descriptor_pool, 0, target(&textured))
            .unwrap();
        let recorded = fixture.ctx.device().recorded(cmd);
        assert!(recorded.contains(&MockCommand::PushConstants {
            offset: 0,
            data: vec![0; 16],
        }));
        // Set 0 is empty and never bound.
        assert!(recorded
            .iter()
            .any(|c| matches!(c, MockCommand::BindDescriptorSets { first_set: 1, .. })));
        assert!(!recorded
            .iter()
            .any(|c| matches!(c, MockCommand::BindDescriptorSets { first_set: 0, .. })));
        assert_eq!(recorded.last(), Some(&MockCommand::Draw(3)));

        let writes = fixture.ctx.device().descriptor_writes();
        assert_eq!(writes.len(), 1);
        assert!(matches!(
            writes[0].resource,
            DescriptorResource::CombinedImageSampler { .. }
        ));

        // A changed push constant invalidates every image's recording.
        assert!(!command.is_outdated(0).unwrap());
        let changed = command
            .mesh_mut(0)
            .unwrap()
            .update_push_constant(0, &[1.0_f32; 4])
            .unwrap();
        assert!(changed);
        assert!(command.is_outdated(0).unwrap());
        assert!(command.is_outdated(1).unwrap());

        command
            .prepare(&mut fixture.ctx, &fixture.descriptor_pool, 0, target(&textured))
            .unwrap();
        assert_eq!(fixture.ctx.device().recording_count(cmd), 2);
        assert!(fixture
            .ctx
            .device()
            .recorded(cmd)
            .contains(&MockCommand::PushConstants {
                offset: 0,
                data: bytemuck::cast_slice(&[1.0_f32; 4]).to_vec(),
            }));

        command
            .release(&mut fixture.ctx, &fixture.command_pool, &fixture.descriptor_pool)
            .unwrap();
        textured.destroy(fixture.ctx.device());
    }

    #[test]
    fn other_pipeline_forces_recording() {
        let mut fixture = Fixture::new();
        let mut command = fixture.command();
        let cmd = fixture.prepare(&mut command, 0);

        let other = Pipeline::new(
            fixture.ctx.device(),
            PipelineId(2),
            PipelineSettings::new(vec![ShaderStage::new(vk::ShaderStageFlags::VERTEX, vec![])]),
            vk::RenderPass::null(),
            vk::SampleCountFlags::TYPE_1,
        )
        .unwrap();
        command
            .prepare(&mut fixture.ctx, &fixture.descriptor_pool, 0, target(&other))
            .unwrap();
        assert_eq!(fixture.ctx.device().recording_count(cmd), 2);
        other.destroy(fixture.ctx.device());
    }
}
