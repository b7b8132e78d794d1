//! Graphics pipelines owned by a render pass.

use crate::error::Result;
use crate::handle::PipelineId;
use crate::settings::PipelineSettings;
use crate::shader::merge_push_constants;
use ash::vk;
use lucent_gpu::{merge_bindings, DescriptorBinding, GpuDevice, GraphicsPipelineDesc};
use std::collections::BTreeMap;
use tracing::debug;

/// Layout of one descriptor set number.
#[derive(Debug)]
struct SetLayout {
    layout: vk::DescriptorSetLayout,
    bindings: Vec<DescriptorBinding>,
}

/// A graphics pipeline with its shader modules and layouts.
///
/// Modules and layouts live as long as the pipeline. Only the pipeline object
/// depends on the render pass, so only it is rebuilt on recreation.
#[derive(Debug)]
pub struct Pipeline {
    id: PipelineId,
    settings: PipelineSettings,
    modules: Vec<(vk::ShaderStageFlags, vk::ShaderModule)>,
    set_layouts: BTreeMap<u32, SetLayout>,
    push_ranges: Vec<vk::PushConstantRange>,
    layout: vk::PipelineLayout,
    pipeline: vk::Pipeline,
}

impl Pipeline {
    pub(crate) fn new<D: GpuDevice>(
        device: &D,
        id: PipelineId,
        settings: PipelineSettings,
        render_pass: vk::RenderPass,
        samples: vk::SampleCountFlags,
    ) -> Result<Self> {
        settings.validate()?;

        let push_ranges = merge_push_constants(&settings.shaders);
        let mut pipeline = Self {
            id,
            settings,
            modules: Vec::new(),
            set_layouts: BTreeMap::new(),
            push_ranges,
            layout: vk::PipelineLayout::null(),
            pipeline: vk::Pipeline::null(),
        };
        if let Err(e) = pipeline.build(device, render_pass, samples) {
            pipeline.destroy(device);
            return Err(e);
        }
        debug!("Created {id}");
        Ok(pipeline)
    }

    fn build<D: GpuDevice>(
        &mut self,
        device: &D,
        render_pass: vk::RenderPass,
        samples: vk::SampleCountFlags,
    ) -> Result<()> {
        for shader in &self.settings.shaders {
            let module = device.create_shader_module(&shader.code)?;
            self.modules.push((shader.stage, module));
        }

        let mut by_set: BTreeMap<u32, Vec<DescriptorBinding>> = BTreeMap::new();
        for (set, binding) in self.settings.shaders.iter().flat_map(|s| s.bindings.iter()) {
            by_set.entry(*set).or_default().push(*binding);
        }
        // Pipeline layouts index sets by position, so gaps get empty layouts.
        if let Some(&last) = by_set.keys().next_back() {
            for set in 0..=last {
                let bindings = merge_bindings(by_set.remove(&set).unwrap_or_default());
                let layout = device.create_descriptor_set_layout(&bindings)?;
                self.set_layouts.insert(set, SetLayout { layout, bindings });
            }
        }

        let layouts: Vec<vk::DescriptorSetLayout> =
            self.set_layouts.values().map(|s| s.layout).collect();
        self.layout = device.create_pipeline_layout(&layouts, &self.push_ranges)?;
        self.pipeline = device.create_graphics_pipeline(&self.desc(render_pass, samples))?;
        Ok(())
    }

    fn desc(&self, render_pass: vk::RenderPass, samples: vk::SampleCountFlags) -> GraphicsPipelineDesc {
        let settings = &self.settings;
        GraphicsPipelineDesc {
            render_pass,
            layout: self.layout,
            stages: self.modules.clone(),
            vertex_bindings: settings.vertex_layout.bindings(),
            vertex_attributes: settings.vertex_layout.attribute_descriptions(),
            topology: settings.topology,
            polygon_mode: settings.polygon_mode,
            cull_mode: settings.cull_mode,
            front_face: settings.front_face,
            depth_test: settings.depth_test,
            depth_write: settings.depth_write,
            samples,
            sample_shading: settings.sample_shading,
        }
    }

    /// Rebuild the pipeline object against a rebuilt render pass.
    pub(crate) fn recreate<D: GpuDevice>(
        &mut self,
        device: &D,
        render_pass: vk::RenderPass,
        samples: vk::SampleCountFlags,
    ) -> Result<()> {
        device.destroy_pipeline(self.pipeline);
        self.pipeline = vk::Pipeline::null();
        self.pipeline = device.create_graphics_pipeline(&self.desc(render_pass, samples))?;
        Ok(())
    }

    pub const fn id(&self) -> PipelineId {
        self.id
    }

    pub const fn handle(&self) -> vk::Pipeline {
        self.pipeline
    }

    pub const fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    pub const fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// `(set number, layout, bindings)` in set order.
    pub(crate) fn set_layouts(
        &self,
    ) -> impl Iterator<Item = (u32, vk::DescriptorSetLayout, &[DescriptorBinding])> {
        self.set_layouts
            .iter()
            .map(|(set, layout)| (*set, layout.layout, layout.bindings.as_slice()))
    }

    pub(crate) fn set_bindings(&self, set: u32) -> Option<&[DescriptorBinding]> {
        self.set_layouts.get(&set).map(|s| s.bindings.as_slice())
    }

    /// The device must be done with the pipeline.
    pub(crate) fn destroy<D: GpuDevice>(&self, device: &D) {
        device.destroy_pipeline(self.pipeline);
        device.destroy_pipeline_layout(self.layout);
        for set in self.set_layouts.values() {
            device.destroy_descriptor_set_layout(set.layout);
        }
        for (_, module) in &self.modules {
            device.destroy_shader_module(*module);
        }
        debug!("Destroyed {}", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shader::ShaderStage;
    use crate::vertex::{ColorVertex, Vertex};
    use lucent_gpu::MockDevice;

    fn settings() -> PipelineSettings {
        PipelineSettings::new(vec![
            ShaderStage::new(vk::ShaderStageFlags::VERTEX, vec![0x0723_0203])
                .with_uniform_buffer(0, 0)
                .with_push_constants(0, 16),
            ShaderStage::new(vk::ShaderStageFlags::FRAGMENT, vec![0x0723_0203])
                .with_sampled_image(2, 0),
        ])
        .for_vertex::<ColorVertex>()
    }

    #[test]
    fn set_gaps_get_empty_layouts() {
        let device = MockDevice::new();
        let pipeline = Pipeline::new(
            &device,
            PipelineId(1),
            settings(),
            vk::RenderPass::null(),
            vk::SampleCountFlags::TYPE_1,
        )
        .unwrap();

        let sets: Vec<(u32, usize)> = pipeline
            .set_layouts()
            .map(|(set, _, bindings)| (set, bindings.len()))
            .collect();
        assert_eq!(sets, vec![(0, 1), (1, 0), (2, 1)]);
        assert_eq!(device.live_count("descriptor set layout"), 3);
        assert_eq!(device.live_count("shader module"), 2);

        pipeline.destroy(&device);
        assert_eq!(device.live_object_count(), 0);
    }

    #[test]
    fn recreate_rebuilds_only_the_pipeline_object() {
        let device = MockDevice::new();
        let mut pipeline = Pipeline::new(
            &device,
            PipelineId(1),
            settings(),
            vk::RenderPass::null(),
            vk::SampleCountFlags::TYPE_4,
        )
        .unwrap();
        let layout = pipeline.layout();
        let old = pipeline.handle();

        pipeline
            .recreate(&device, vk::RenderPass::null(), vk::SampleCountFlags::TYPE_2)
            .unwrap();
        assert_ne!(pipeline.handle(), old);
        assert_eq!(pipeline.layout(), layout);
        assert_eq!(device.live_count("pipeline"), 1);

        let descs = device.pipeline_descs();
        assert_eq!(descs.len(), 2);
        assert_eq!(descs[1].samples, vk::SampleCountFlags::TYPE_2);
        assert_eq!(descs[1].vertex_bindings[0].stride, ColorVertex::layout().stride);
        pipeline.destroy(&device);
    }

    #[test]
    fn invalid_settings_create_nothing() {
        let device = MockDevice::new();
        let result = Pipeline::new(
            &device,
            PipelineId(1),
            PipelineSettings::new(vec![]),
            vk::RenderPass::null(),
            vk::SampleCountFlags::TYPE_1,
        );
        assert!(result.is_err());
        assert_eq!(device.live_object_count(), 0);
    }
}
