//! Renderer, render pass and pipeline configuration.

use crate::error::{RenderError, Result};
use crate::shader::ShaderStage;
use crate::vertex::{Vertex, VertexLayout};
use ash::vk;

/// Renderer-wide configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RendererConfig {
    /// Depth of the frame synchronization ring.
    pub frames_in_flight: usize,
    /// Timeout for fence waits and image acquisition. Reaching it is fatal.
    pub fence_timeout_ns: u64,
    /// Capacity of the descriptor pool shared by all commands.
    pub max_descriptor_sets: u32,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 2,
            fence_timeout_ns: u64::MAX,
            max_descriptor_sets: 256,
        }
    }
}

impl RendererConfig {
    #[must_use]
    pub const fn with_frames_in_flight(mut self, frames_in_flight: usize) -> Self {
        self.frames_in_flight = frames_in_flight;
        self
    }

    #[must_use]
    pub const fn with_fence_timeout_ns(mut self, timeout_ns: u64) -> Self {
        self.fence_timeout_ns = timeout_ns;
        self
    }

    #[must_use]
    pub const fn with_max_descriptor_sets(mut self, max_sets: u32) -> Self {
        self.max_descriptor_sets = max_sets;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.frames_in_flight == 0 {
            return Err(RenderError::InvalidSettings(
                "frames_in_flight must be at least 1".to_string(),
            ));
        }
        if self.max_descriptor_sets == 0 {
            return Err(RenderError::InvalidSettings(
                "max_descriptor_sets must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Attachments and clear values of a render pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderPassSettings {
    pub depth: bool,
    /// Requested sample count; clamped to what the device supports.
    pub samples: vk::SampleCountFlags,
    pub clear_color: [f32; 4],
    pub clear_depth: f32,
}

impl Default for RenderPassSettings {
    fn default() -> Self {
        Self {
            depth: true,
            samples: vk::SampleCountFlags::TYPE_1,
            clear_color: [0.2, 0.2, 0.2, 1.0],
            clear_depth: 1.0,
        }
    }
}

impl RenderPassSettings {
    #[must_use]
    pub const fn with_depth(mut self, depth: bool) -> Self {
        self.depth = depth;
        self
    }

    #[must_use]
    pub const fn with_samples(mut self, samples: vk::SampleCountFlags) -> Self {
        self.samples = samples;
        self
    }

    #[must_use]
    pub const fn with_clear_color(mut self, clear_color: [f32; 4]) -> Self {
        self.clear_color = clear_color;
        self
    }

    #[must_use]
    pub const fn with_clear_depth(mut self, clear_depth: f32) -> Self {
        self.clear_depth = clear_depth;
        self
    }

    /// Clear values in attachment order: color, then depth if present.
    pub(crate) fn clear_values(&self) -> Vec<vk::ClearValue> {
        let mut values = vec![vk::ClearValue {
            color: vk::ClearColorValue {
                float32: self.clear_color,
            },
        }];
        if self.depth {
            values.push(vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: self.clear_depth,
                    stencil: 0,
                },
            });
        }
        values
    }
}

/// Clamp `requested` to the highest count the device supports.
pub(crate) fn clamp_samples(
    requested: vk::SampleCountFlags,
    max: vk::SampleCountFlags,
) -> vk::SampleCountFlags {
    if requested.as_raw() > max.as_raw() {
        tracing::warn!("{requested:?} MSAA not supported, using {max:?}");
        max
    } else {
        requested
    }
}

/// Shaders and fixed-function state of a graphics pipeline.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub shaders: Vec<ShaderStage>,
    pub vertex_layout: VertexLayout,
    pub topology: vk::PrimitiveTopology,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub depth_test: bool,
    pub depth_write: bool,
    /// Minimum sample shading fraction, or `None` to disable sample shading.
    pub sample_shading: Option<f32>,
}

impl PipelineSettings {
    pub fn new(shaders: Vec<ShaderStage>) -> Self {
        Self {
            shaders,
            vertex_layout: VertexLayout::default(),
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::BACK,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            depth_test: true,
            depth_write: true,
            sample_shading: None,
        }
    }

    /// Read vertices of type `V` from binding 0.
    #[must_use]
    pub fn for_vertex<V: Vertex>(self) -> Self {
        self.with_vertex_layout(V::layout())
    }

    #[must_use]
    pub fn with_vertex_layout(mut self, layout: VertexLayout) -> Self {
        self.vertex_layout = layout;
        self
    }

    #[must_use]
    pub fn with_topology(mut self, topology: vk::PrimitiveTopology) -> Self {
        self.topology = topology;
        self
    }

    #[must_use]
    pub fn with_polygon_mode(mut self, polygon_mode: vk::PolygonMode) -> Self {
        self.polygon_mode = polygon_mode;
        self
    }

    #[must_use]
    pub fn with_cull_mode(mut self, cull_mode: vk::CullModeFlags) -> Self {
        self.cull_mode = cull_mode;
        self
    }

    #[must_use]
    pub fn with_front_face(mut self, front_face: vk::FrontFace) -> Self {
        self.front_face = front_face;
        self
    }

    #[must_use]
    pub fn with_depth(mut self, test: bool, write: bool) -> Self {
        self.depth_test = test;
        self.depth_write = write;
        self
    }

    #[must_use]
    pub fn with_sample_shading(mut self, min_fraction: f32) -> Self {
        self.sample_shading = Some(min_fraction.clamp(0.0, 1.0));
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.shaders.is_empty() {
            return Err(RenderError::InvalidSettings(
                "a pipeline needs at least one shader stage".to_string(),
            ));
        }
        let mut seen = vk::ShaderStageFlags::empty();
        for shader in &self.shaders {
            if seen.intersects(shader.stage) {
                return Err(RenderError::InvalidSettings(format!(
                    "shader stage {:?} given twice",
                    shader.stage
                )));
            }
            seen |= shader.stage;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn samples_are_clamped_to_device_max() {
        let max = vk::SampleCountFlags::TYPE_4;
        assert_eq!(clamp_samples(vk::SampleCountFlags::TYPE_8, max), max);
        assert_eq!(
            clamp_samples(vk::SampleCountFlags::TYPE_2, max),
            vk::SampleCountFlags::TYPE_2
        );
    }

    #[test]
    fn clear_values_follow_attachments() {
        assert_eq!(RenderPassSettings::default().clear_values().len(), 2);
        assert_eq!(
            RenderPassSettings::default()
                .with_depth(false)
                .clear_values()
                .len(),
            1
        );
    }

    #[test]
    fn pipeline_settings_reject_duplicate_stages() {
        let vertex = ShaderStage::new(vk::ShaderStageFlags::VERTEX, vec![]);
        assert!(PipelineSettings::new(vec![]).validate().is_err());
        assert!(PipelineSettings::new(vec![vertex.clone()]).validate().is_ok());
        assert!(PipelineSettings::new(vec![vertex.clone(), vertex])
            .validate()
            .is_err());
    }

    #[test]
    fn config_rejects_empty_ring() {
        assert!(RendererConfig::default().validate().is_ok());
        assert!(RendererConfig::default()
            .with_frames_in_flight(0)
            .validate()
            .is_err());
    }
}
