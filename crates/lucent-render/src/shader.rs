//! Shader stages as handed over by the shader loader.
//!
//! Bytecode is not parsed here. The loader supplies the descriptor bindings
//! and push-constant ranges each stage declares.

use crate::error::{RenderError, Result};
use ash::vk;
use lucent_gpu::DescriptorBinding;
use std::io::Cursor;

/// One compiled shader stage with its reflected interface.
#[derive(Debug, Clone)]
pub struct ShaderStage {
    pub stage: vk::ShaderStageFlags,
    pub code: Vec<u32>,
    /// `(set, binding)` pairs declared by this stage.
    pub bindings: Vec<(u32, DescriptorBinding)>,
    pub push_constants: Vec<vk::PushConstantRange>,
}

impl ShaderStage {
    pub fn new(stage: vk::ShaderStageFlags, code: Vec<u32>) -> Self {
        Self {
            stage,
            code,
            bindings: Vec::new(),
            push_constants: Vec::new(),
        }
    }

    /// Read SPIR-V from raw bytes, checking size and magic number.
    pub fn from_spirv_bytes(stage: vk::ShaderStageFlags, bytes: &[u8]) -> Result<Self> {
        let code = ash::util::read_spv(&mut Cursor::new(bytes))
            .map_err(|e| RenderError::InvalidSettings(format!("invalid SPIR-V: {e}")))?;
        Ok(Self::new(stage, code))
    }

    /// Declare a descriptor binding used by this stage.
    #[must_use]
    pub fn with_binding(mut self, set: u32, binding: u32, descriptor_type: vk::DescriptorType) -> Self {
        self.bindings.push((
            set,
            DescriptorBinding {
                binding,
                descriptor_type,
                count: 1,
                stages: self.stage,
            },
        ));
        self
    }

    #[must_use]
    pub fn with_uniform_buffer(self, set: u32, binding: u32) -> Self {
        self.with_binding(set, binding, vk::DescriptorType::UNIFORM_BUFFER)
    }

    #[must_use]
    pub fn with_sampled_image(self, set: u32, binding: u32) -> Self {
        self.with_binding(set, binding, vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
    }

    /// Declare a push-constant range read by this stage.
    #[must_use]
    pub fn with_push_constants(mut self, offset: u32, size: u32) -> Self {
        self.push_constants.push(vk::PushConstantRange {
            stage_flags: self.stage,
            offset,
            size,
        });
        self
    }
}

/// Combine the push-constant ranges of several stages. Ranges with the same
/// offset and size are merged into one range visible to all their stages.
pub(crate) fn merge_push_constants<'a>(
    stages: impl IntoIterator<Item = &'a ShaderStage>,
) -> Vec<vk::PushConstantRange> {
    let mut merged: Vec<vk::PushConstantRange> = Vec::new();
    for range in stages.into_iter().flat_map(|s| s.push_constants.iter()) {
        match merged
            .iter_mut()
            .find(|r| r.offset == range.offset && r.size == range.size)
        {
            Some(existing) => existing.stage_flags |= range.stage_flags,
            None => merged.push(*range),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spirv_bytes_are_validated() {
        let mut bytes = 0x0723_0203_u32.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0, 0, 1, 0]);
        let stage = ShaderStage::from_spirv_bytes(vk::ShaderStageFlags::VERTEX, &bytes).unwrap();
        assert_eq!(stage.code.len(), 2);

        assert!(ShaderStage::from_spirv_bytes(vk::ShaderStageFlags::VERTEX, &[1, 2, 3]).is_err());
    }

    #[test]
    fn bindings_take_the_stage_flag() {
        let stage = ShaderStage::new(vk::ShaderStageFlags::FRAGMENT, vec![])
            .with_uniform_buffer(0, 0)
            .with_sampled_image(1, 2);
        assert_eq!(stage.bindings.len(), 2);
        assert_eq!(stage.bindings[1].0, 1);
        assert_eq!(stage.bindings[1].1.binding, 2);
        assert_eq!(stage.bindings[1].1.stages, vk::ShaderStageFlags::FRAGMENT);
    }

    #[test]
    fn identical_push_ranges_merge_stage_flags() {
        let vertex = ShaderStage::new(vk::ShaderStageFlags::VERTEX, vec![]).with_push_constants(0, 64);
        let fragment = ShaderStage::new(vk::ShaderStageFlags::FRAGMENT, vec![])
            .with_push_constants(0, 64)
            .with_push_constants(64, 16);

        let merged = merge_push_constants([&vertex, &fragment]);
        assert_eq!(merged.len(), 2);
        assert_eq!(
            merged[0].stage_flags,
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
        );
        assert_eq!(merged[1].offset, 64);
    }
}
