//! Vertex formats.

use ash::vk;
use glam::{Vec2, Vec3};

/// One vertex attribute within a vertex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexAttribute {
    pub location: u32,
    pub format: vk::Format,
    pub offset: u32,
}

/// Layout of the vertex buffer at binding 0.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VertexLayout {
    pub stride: u32,
    pub attributes: Vec<VertexAttribute>,
}

impl VertexLayout {
    pub const fn new(stride: u32) -> Self {
        Self {
            stride,
            attributes: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_attribute(mut self, location: u32, format: vk::Format, offset: u32) -> Self {
        self.attributes.push(VertexAttribute {
            location,
            format,
            offset,
        });
        self
    }

    /// Binding descriptions; empty when the pipeline reads no vertex buffer.
    pub(crate) fn bindings(&self) -> Vec<vk::VertexInputBindingDescription> {
        if self.stride == 0 {
            return Vec::new();
        }
        vec![vk::VertexInputBindingDescription {
            binding: 0,
            stride: self.stride,
            input_rate: vk::VertexInputRate::VERTEX,
        }]
    }

    pub(crate) fn attribute_descriptions(&self) -> Vec<vk::VertexInputAttributeDescription> {
        self.attributes
            .iter()
            .map(|a| vk::VertexInputAttributeDescription {
                location: a.location,
                binding: 0,
                format: a.format,
                offset: a.offset,
            })
            .collect()
    }
}

/// A plain-old-data vertex type with a known layout.
pub trait Vertex: bytemuck::Pod {
    fn layout() -> VertexLayout;
}

/// Position and color.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ColorVertex {
    pub position: Vec3,
    pub color: Vec3,
}

impl Vertex for ColorVertex {
    fn layout() -> VertexLayout {
        VertexLayout::new(std::mem::size_of::<Self>() as u32)
            .with_attribute(0, vk::Format::R32G32B32_SFLOAT, 0)
            .with_attribute(1, vk::Format::R32G32B32_SFLOAT, 12)
    }
}

/// Position, normal and texture coordinate.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct TexturedVertex {
    pub position: Vec3,
    pub normal: Vec3,
    pub uv: Vec2,
}

impl Vertex for TexturedVertex {
    fn layout() -> VertexLayout {
        VertexLayout::new(std::mem::size_of::<Self>() as u32)
            .with_attribute(0, vk::Format::R32G32B32_SFLOAT, 0)
            .with_attribute(1, vk::Format::R32G32B32_SFLOAT, 12)
            .with_attribute(2, vk::Format::R32G32_SFLOAT, 24)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layouts_match_struct_sizes() {
        assert_eq!(ColorVertex::layout().stride, 24);
        assert_eq!(TexturedVertex::layout().stride, 32);
        assert_eq!(TexturedVertex::layout().attribute_descriptions()[2].offset, 24);
    }

    #[test]
    fn zero_stride_reads_no_buffer() {
        assert!(VertexLayout::default().bindings().is_empty());
        assert_eq!(ColorVertex::layout().bindings().len(), 1);
    }
}
