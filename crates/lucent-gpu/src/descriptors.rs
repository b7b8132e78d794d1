//! Descriptor pool management.

use crate::device::{DescriptorBinding, DescriptorResource, GpuDevice};
use crate::error::Result;
use ash::vk;

/// Descriptor types the renderer binds.
pub const POOL_DESCRIPTOR_TYPES: [vk::DescriptorType; 2] = [
    vk::DescriptorType::UNIFORM_BUFFER,
    vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
];

/// A pool whose sets can be freed one by one.
#[derive(Debug)]
pub struct DescriptorPool {
    pool: vk::DescriptorPool,
    max_sets: u32,
}

impl DescriptorPool {
    /// Create a pool for `max_sets` sets, each holding up to
    /// `descriptors_per_set` descriptors of every pooled type.
    pub fn new<D: GpuDevice>(device: &D, max_sets: u32, descriptors_per_set: u32) -> Result<Self> {
        let sizes: Vec<vk::DescriptorPoolSize> = POOL_DESCRIPTOR_TYPES
            .iter()
            .map(|ty| vk::DescriptorPoolSize {
                ty: *ty,
                descriptor_count: max_sets * descriptors_per_set,
            })
            .collect();
        let pool = device.create_descriptor_pool(max_sets, &sizes)?;
        tracing::debug!("Created descriptor pool for {max_sets} sets");
        Ok(Self { pool, max_sets })
    }

    pub const fn handle(&self) -> vk::DescriptorPool {
        self.pool
    }

    pub const fn max_sets(&self) -> u32 {
        self.max_sets
    }

    /// Allocate one set per layout.
    pub fn allocate<D: GpuDevice>(
        &self,
        device: &D,
        layouts: &[vk::DescriptorSetLayout],
    ) -> Result<Vec<vk::DescriptorSet>> {
        device.allocate_descriptor_sets(self.pool, layouts)
    }

    pub fn free<D: GpuDevice>(&self, device: &D, sets: &[vk::DescriptorSet]) -> Result<()> {
        if sets.is_empty() {
            return Ok(());
        }
        device.free_descriptor_sets(self.pool, sets)
    }

    /// Destroy the pool, implicitly freeing all of its sets.
    pub fn destroy<D: GpuDevice>(&self, device: &D) {
        device.destroy_descriptor_pool(self.pool);
    }
}

/// Descriptor type a resource is written as.
pub const fn descriptor_type(resource: &DescriptorResource) -> vk::DescriptorType {
    match resource {
        DescriptorResource::UniformBuffer { .. } => vk::DescriptorType::UNIFORM_BUFFER,
        DescriptorResource::CombinedImageSampler { .. } => {
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER
        }
    }
}

/// Merge bindings declared by several shader stages into one layout,
/// combining stage flags of bindings that appear in more than one stage.
pub fn merge_bindings(bindings: impl IntoIterator<Item = DescriptorBinding>) -> Vec<DescriptorBinding> {
    let mut merged: Vec<DescriptorBinding> = Vec::new();
    for binding in bindings {
        if let Some(existing) = merged.iter_mut().find(|b| b.binding == binding.binding) {
            existing.stages |= binding.stages;
            existing.count = existing.count.max(binding.count);
        } else {
            merged.push(binding);
        }
    }
    merged.sort_by_key(|b| b.binding);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(binding: u32, stages: vk::ShaderStageFlags) -> DescriptorBinding {
        DescriptorBinding {
            binding,
            descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
            count: 1,
            stages,
        }
    }

    #[test]
    fn merge_combines_stages_and_sorts() {
        let merged = merge_bindings([
            binding(1, vk::ShaderStageFlags::FRAGMENT),
            binding(0, vk::ShaderStageFlags::VERTEX),
            binding(1, vk::ShaderStageFlags::VERTEX),
        ]);

        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].binding, 0);
        assert_eq!(
            merged[1].stages,
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
        );
    }

    #[test]
    fn resource_types() {
        let buffer = DescriptorResource::UniformBuffer {
            buffer: vk::Buffer::null(),
            range: 64,
        };
        assert_eq!(descriptor_type(&buffer), vk::DescriptorType::UNIFORM_BUFFER);
        let image = DescriptorResource::CombinedImageSampler {
            view: vk::ImageView::null(),
            sampler: vk::Sampler::null(),
        };
        assert_eq!(descriptor_type(&image), vk::DescriptorType::COMBINED_IMAGE_SAMPLER);
    }
}
