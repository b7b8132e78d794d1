//! Render pass and graphics pipeline construction for the ash backend.

use crate::device::{GraphicsPipelineDesc, RenderPassDesc};
use crate::error::{GpuError, Result};
use ash::vk;

/// Attachment descriptions of a render pass, in framebuffer order:
/// color, then depth if present, then the resolve target when multisampled.
///
/// The presentable image is the color attachment when single-sampled and the
/// resolve attachment otherwise.
pub fn attachment_descriptions(desc: &RenderPassDesc) -> Vec<vk::AttachmentDescription> {
    let multisampled = desc.samples != vk::SampleCountFlags::TYPE_1;
    let mut attachments = vec![vk::AttachmentDescription {
        format: desc.color_format,
        samples: desc.samples,
        load_op: vk::AttachmentLoadOp::CLEAR,
        store_op: if multisampled {
            vk::AttachmentStoreOp::DONT_CARE
        } else {
            vk::AttachmentStoreOp::STORE
        },
        stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
        stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
        initial_layout: vk::ImageLayout::UNDEFINED,
        final_layout: if multisampled {
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        } else {
            vk::ImageLayout::PRESENT_SRC_KHR
        },
        ..Default::default()
    }];

    if let Some(depth_format) = desc.depth_format {
        attachments.push(vk::AttachmentDescription {
            format: depth_format,
            samples: desc.samples,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::DONT_CARE,
            stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
            stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            ..Default::default()
        });
    }

    if multisampled {
        attachments.push(vk::AttachmentDescription {
            format: desc.color_format,
            samples: vk::SampleCountFlags::TYPE_1,
            load_op: vk::AttachmentLoadOp::DONT_CARE,
            store_op: vk::AttachmentStoreOp::STORE,
            stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
            stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
            ..Default::default()
        });
    }

    attachments
}

/// Create a single-subpass render pass.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_render_pass(device: &ash::Device, desc: &RenderPassDesc) -> Result<vk::RenderPass> {
    let attachments = attachment_descriptions(desc);
    let multisampled = desc.samples != vk::SampleCountFlags::TYPE_1;

    let color_refs = [vk::AttachmentReference {
        attachment: 0,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    }];
    let depth_ref = vk::AttachmentReference {
        attachment: 1,
        layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
    };
    let resolve_refs = [vk::AttachmentReference {
        attachment: attachments.len() as u32 - 1,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    }];

    let mut subpass = vk::SubpassDescription::default()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_refs);
    if desc.depth_format.is_some() {
        subpass = subpass.depth_stencil_attachment(&depth_ref);
    }
    if multisampled {
        subpass = subpass.resolve_attachments(&resolve_refs);
    }

    let stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
        | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS;
    let dependency = vk::SubpassDependency::default()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(stages)
        .src_access_mask(vk::AccessFlags::empty())
        .dst_stage_mask(stages)
        .dst_access_mask(
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        );

    let subpasses = [subpass];
    let dependencies = [dependency];
    let create_info = vk::RenderPassCreateInfo::default()
        .attachments(&attachments)
        .subpasses(&subpasses)
        .dependencies(&dependencies);

    let render_pass = unsafe { device.create_render_pass(&create_info, None) }?;
    Ok(render_pass)
}

/// Create a graphics pipeline for subpass 0 of `desc.render_pass`.
///
/// Viewport and scissor are dynamic.
///
/// # Safety
/// The device must be valid and every handle in `desc` must belong to it.
pub unsafe fn create_graphics_pipeline(
    device: &ash::Device,
    desc: &GraphicsPipelineDesc,
) -> Result<vk::Pipeline> {
    let shader_stages: Vec<_> = desc
        .stages
        .iter()
        .map(|(stage, module)| {
            vk::PipelineShaderStageCreateInfo::default()
                .stage(*stage)
                .module(*module)
                .name(c"main")
        })
        .collect();

    let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
        .vertex_binding_descriptions(&desc.vertex_bindings)
        .vertex_attribute_descriptions(&desc.vertex_attributes);

    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
        .topology(desc.topology)
        .primitive_restart_enable(false);

    // Viewport (dynamic)
    let viewport_state = vk::PipelineViewportStateCreateInfo::default()
        .viewport_count(1)
        .scissor_count(1);

    let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(desc.polygon_mode)
        .cull_mode(desc.cull_mode)
        .front_face(desc.front_face)
        .depth_bias_enable(false)
        .line_width(1.0);

    let multisampling = vk::PipelineMultisampleStateCreateInfo::default()
        .rasterization_samples(desc.samples)
        .sample_shading_enable(desc.sample_shading.is_some())
        .min_sample_shading(desc.sample_shading.unwrap_or(0.0));

    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
        .depth_test_enable(desc.depth_test)
        .depth_write_enable(desc.depth_write)
        .depth_compare_op(vk::CompareOp::LESS)
        .depth_bounds_test_enable(false)
        .stencil_test_enable(false);

    let color_blend_attachments = [vk::PipelineColorBlendAttachmentState::default()
        .blend_enable(false)
        .color_write_mask(vk::ColorComponentFlags::RGBA)];

    let color_blending = vk::PipelineColorBlendStateCreateInfo::default()
        .logic_op_enable(false)
        .attachments(&color_blend_attachments);

    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

    let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
        .stages(&shader_stages)
        .vertex_input_state(&vertex_input)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterization)
        .multisample_state(&multisampling)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blending)
        .dynamic_state(&dynamic_state)
        .layout(desc.layout)
        .render_pass(desc.render_pass)
        .subpass(0);

    let pipelines = unsafe {
        device.create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
    }
    .map_err(|(_pipelines, e)| GpuError::PipelineCreation(e.to_string()))?;

    pipelines
        .into_iter()
        .next()
        .ok_or_else(|| GpuError::PipelineCreation("no pipeline returned".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(depth: bool, samples: vk::SampleCountFlags) -> RenderPassDesc {
        RenderPassDesc {
            color_format: vk::Format::B8G8R8A8_SRGB,
            depth_format: depth.then_some(vk::Format::D32_SFLOAT),
            samples,
        }
    }

    #[test]
    fn single_sampled_color_presents_directly() {
        let attachments = attachment_descriptions(&desc(false, vk::SampleCountFlags::TYPE_1));
        assert_eq!(attachments.len(), 1);
        assert_eq!(attachments[0].final_layout, vk::ImageLayout::PRESENT_SRC_KHR);
    }

    #[test]
    fn multisampled_pass_resolves_last() {
        let attachments = attachment_descriptions(&desc(true, vk::SampleCountFlags::TYPE_4));
        assert_eq!(attachments.len(), 3);
        assert_eq!(attachments[0].samples, vk::SampleCountFlags::TYPE_4);
        assert_eq!(attachments[1].format, vk::Format::D32_SFLOAT);
        assert_eq!(attachments[1].samples, vk::SampleCountFlags::TYPE_4);
        assert_eq!(attachments[2].samples, vk::SampleCountFlags::TYPE_1);
        assert_eq!(attachments[2].final_layout, vk::ImageLayout::PRESENT_SRC_KHR);
    }
}
