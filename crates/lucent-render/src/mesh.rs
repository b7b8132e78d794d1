//! Drawable geometry with the uniforms, images and push constants it binds.

use crate::error::{RenderError, Result};
use crate::handle::PipelineId;
use crate::pipeline::Pipeline;
use crate::uniform::{PushConstant, UniformBuffer, UniformImage};
use crate::vertex::Vertex;
use ash::vk;
use hashbrown::HashMap;
use lucent_gpu::{
    DescriptorPool, DescriptorResource, DescriptorWrite, DeviceBuffer, GpuDevice, Residency,
    ResourceContext,
};
use tracing::warn;

/// Device-local vertex or index data with its CPU copy.
#[derive(Debug)]
struct GeometryBuffer {
    usage: vk::BufferUsageFlags,
    data: Vec<u8>,
    buffer: Option<DeviceBuffer>,
}

impl GeometryBuffer {
    fn new(usage: vk::BufferUsageFlags, data: Vec<u8>) -> Self {
        Self {
            usage,
            data,
            buffer: None,
        }
    }

    fn set_data(&mut self, data: Vec<u8>) {
        self.data = data;
        self.set_outdated();
    }

    fn set_outdated(&mut self) {
        if let Some(buffer) = &mut self.buffer {
            buffer.set_outdated();
        }
    }

    fn is_outdated(&self) -> bool {
        self.buffer.as_ref().map_or(true, DeviceBuffer::is_outdated)
    }

    /// Upload the CPU copy if it changed since the last upload.
    ///
    /// A buffer that was uploaded before may still be read by frames in flight,
    /// so replacing its contents waits for the device to go idle.
    fn sync<D: GpuDevice>(&mut self, ctx: &mut ResourceContext<D>) -> Result<()> {
        if !self.is_outdated() {
            return Ok(());
        }
        let size = self.data.len() as vk::DeviceSize;

        if let Some(buffer) = self.buffer.as_mut().filter(|b| b.size() >= size) {
            ctx.device().wait_idle()?;
            buffer.upload(ctx, &self.data)?;
            return Ok(());
        }

        if let Some(old) = self.buffer.take() {
            ctx.device().wait_idle()?;
            old.destroy(ctx)?;
        }
        let mut buffer = DeviceBuffer::new(ctx, size, self.usage, Residency::DeviceLocal)?;
        if let Err(e) = buffer.upload(ctx, &self.data) {
            buffer.destroy(ctx)?;
            return Err(e.into());
        }
        self.buffer = Some(buffer);
        Ok(())
    }

    fn release<D: GpuDevice>(&mut self, ctx: &mut ResourceContext<D>) -> Result<()> {
        if let Some(buffer) = self.buffer.take() {
            buffer.destroy(ctx)?;
        }
        Ok(())
    }
}

/// What a mesh draws: plain vertices or indexed vertices.
#[derive(Debug)]
enum Geometry {
    Vertices {
        vertices: GeometryBuffer,
        vertex_count: u32,
    },
    Indexed {
        vertices: GeometryBuffer,
        indices: GeometryBuffer,
        index_count: u32,
    },
}

impl Geometry {
    fn vertices_mut(&mut self) -> &mut GeometryBuffer {
        match self {
            Self::Vertices { vertices, .. } | Self::Indexed { vertices, .. } => vertices,
        }
    }

    fn is_outdated(&self) -> bool {
        match self {
            Self::Vertices { vertices, .. } => vertices.is_outdated(),
            Self::Indexed {
                vertices, indices, ..
            } => vertices.is_outdated() || indices.is_outdated(),
        }
    }

    fn sync<D: GpuDevice>(&mut self, ctx: &mut ResourceContext<D>) -> Result<()> {
        match self {
            Self::Vertices { vertices, .. } => vertices.sync(ctx),
            Self::Indexed {
                vertices, indices, ..
            } => {
                vertices.sync(ctx)?;
                indices.sync(ctx)
            }
        }
    }

    fn record<D: GpuDevice>(&self, device: &D, cmd: vk::CommandBuffer) {
        match self {
            Self::Vertices {
                vertices,
                vertex_count,
            } => {
                if let Some(buffer) = &vertices.buffer {
                    buffer.bind_vertex(device, cmd);
                    device.cmd_draw(cmd, *vertex_count);
                }
            }
            Self::Indexed {
                vertices,
                indices,
                index_count,
            } => {
                if let (Some(vertex_buffer), Some(index_buffer)) = (&vertices.buffer, &indices.buffer)
                {
                    vertex_buffer.bind_vertex(device, cmd);
                    index_buffer.bind_index(device, cmd);
                    device.cmd_draw_indexed(cmd, *index_count);
                }
            }
        }
    }

    fn release<D: GpuDevice>(&mut self, ctx: &mut ResourceContext<D>) -> Result<()> {
        match self {
            Self::Vertices { vertices, .. } => vertices.release(ctx),
            Self::Indexed {
                vertices, indices, ..
            } => {
                vertices.release(ctx)?;
                indices.release(ctx)
            }
        }
    }
}

/// Descriptor sets of one mesh for one pipeline, per presentable image.
#[derive(Debug)]
struct MeshDescriptors {
    /// `(set number, set)` pairs for each image.
    sets: Vec<Vec<(u32, vk::DescriptorSet)>>,
    written: Vec<bool>,
}

impl MeshDescriptors {
    fn all_sets(&self) -> Vec<vk::DescriptorSet> {
        self.sets.iter().flatten().map(|(_, set)| *set).collect()
    }
}

/// Geometry plus everything its shaders read.
#[derive(Debug)]
pub struct Mesh {
    geometry: Geometry,
    uniforms: Vec<UniformBuffer>,
    images: Vec<UniformImage>,
    push_constants: Vec<PushConstant>,
    descriptors: HashMap<PipelineId, MeshDescriptors>,
}

fn vertex_bytes<V: Vertex>(vertices: &[V]) -> Result<(Vec<u8>, u32)> {
    if vertices.is_empty() {
        return Err(RenderError::InvalidSettings(
            "a mesh needs at least one vertex".to_string(),
        ));
    }
    Ok((bytemuck::cast_slice(vertices).to_vec(), vertices.len() as u32))
}

fn index_bytes(indices: &[u32]) -> Result<(Vec<u8>, u32)> {
    if indices.is_empty() {
        return Err(RenderError::InvalidSettings(
            "an indexed mesh needs at least one index".to_string(),
        ));
    }
    Ok((bytemuck::cast_slice(indices).to_vec(), indices.len() as u32))
}

impl Mesh {
    /// A mesh drawn with `vkCmdDraw`.
    pub fn new<V: Vertex>(vertices: &[V]) -> Result<Self> {
        let (data, vertex_count) = vertex_bytes(vertices)?;
        Ok(Self::with_geometry(Geometry::Vertices {
            vertices: GeometryBuffer::new(vk::BufferUsageFlags::VERTEX_BUFFER, data),
            vertex_count,
        }))
    }

    /// A mesh drawn with 32-bit indices.
    pub fn indexed<V: Vertex>(vertices: &[V], indices: &[u32]) -> Result<Self> {
        let (vertex_data, _) = vertex_bytes(vertices)?;
        let (index_data, index_count) = index_bytes(indices)?;
        Ok(Self::with_geometry(Geometry::Indexed {
            vertices: GeometryBuffer::new(vk::BufferUsageFlags::VERTEX_BUFFER, vertex_data),
            indices: GeometryBuffer::new(vk::BufferUsageFlags::INDEX_BUFFER, index_data),
            index_count,
        }))
    }

    fn with_geometry(geometry: Geometry) -> Self {
        Self {
            geometry,
            uniforms: Vec::new(),
            images: Vec::new(),
            push_constants: Vec::new(),
            descriptors: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_uniform(mut self, uniform: UniformBuffer) -> Self {
        self.uniforms.push(uniform);
        self
    }

    #[must_use]
    pub fn with_image(mut self, image: UniformImage) -> Self {
        self.images.push(image);
        self
    }

    #[must_use]
    pub fn with_push_constant(mut self, push_constant: PushConstant) -> Self {
        self.push_constants.push(push_constant);
        self
    }

    pub const fn is_indexed(&self) -> bool {
        matches!(self.geometry, Geometry::Indexed { .. })
    }

    /// Replace the vertices. Uploaded the next time the mesh is recorded.
    pub fn set_vertices<V: Vertex>(&mut self, vertices: &[V]) -> Result<()> {
        let (data, count) = vertex_bytes(vertices)?;
        if let Geometry::Vertices { vertex_count, .. } = &mut self.geometry {
            *vertex_count = count;
        }
        self.geometry.vertices_mut().set_data(data);
        Ok(())
    }

    /// Replace the indices of an indexed mesh.
    pub fn set_indices(&mut self, new_indices: &[u32]) -> Result<()> {
        let Geometry::Indexed {
            indices,
            index_count,
            ..
        } = &mut self.geometry
        else {
            return Err(RenderError::InvalidSettings(
                "set_indices on a mesh without indices".to_string(),
            ));
        };
        let (data, count) = index_bytes(new_indices)?;
        indices.set_data(data);
        *index_count = count;
        Ok(())
    }

    /// Force the vertex data to be uploaded again.
    pub fn set_outdated(&mut self) {
        self.geometry.vertices_mut().set_outdated();
    }

    /// Whether any recording of this mesh is stale: its geometry must be
    /// uploaded again or a push constant changed.
    pub fn is_outdated(&self) -> bool {
        self.geometry.is_outdated() || self.push_constants.iter().any(PushConstant::is_outdated)
    }

    /// Update the uniform at `(set, binding)`. Returns whether the value changed.
    pub fn update_uniform<T: bytemuck::Pod>(&mut self, set: u32, binding: u32, value: &T) -> Result<bool> {
        self.uniform_mut(set, binding)?.update(value)
    }

    pub fn uniform_mut(&mut self, set: u32, binding: u32) -> Result<&mut UniformBuffer> {
        self.uniforms
            .iter_mut()
            .find(|u| u.set() == set && u.binding() == binding)
            .ok_or_else(|| RenderError::InvalidSettings(format!("no uniform at ({set}, {binding})")))
    }

    pub fn image_mut(&mut self, set: u32, binding: u32) -> Result<&mut UniformImage> {
        self.images
            .iter_mut()
            .find(|i| i.set() == set && i.binding() == binding)
            .ok_or_else(|| RenderError::InvalidSettings(format!("no image at ({set}, {binding})")))
    }

    /// Update the push constant at `offset`. Returns whether the value changed.
    pub fn update_push_constant<T: bytemuck::Pod>(&mut self, offset: u32, value: &T) -> Result<bool> {
        self.push_constants
            .iter_mut()
            .find(|p| p.offset() == offset)
            .ok_or_else(|| RenderError::InvalidSettings(format!("no push constant at offset {offset}")))?
            .update(value)
    }

    pub fn uniforms(&self) -> &[UniformBuffer] {
        &self.uniforms
    }

    /// Upload the geometry and images and create per-image uniform buffers.
    pub(crate) fn allocate<D: GpuDevice>(
        &mut self,
        ctx: &mut ResourceContext<D>,
        image_count: usize,
    ) -> Result<()> {
        self.geometry.sync(ctx)?;
        for uniform in &mut self.uniforms {
            uniform.allocate(ctx, image_count)?;
        }
        for image in &mut self.images {
            image.allocate(ctx)?;
        }
        Ok(())
    }

    /// Recreate the per-image uniform buffers for a new image count.
    pub(crate) fn reallocate_uniforms<D: GpuDevice>(
        &mut self,
        ctx: &mut ResourceContext<D>,
        image_count: usize,
    ) -> Result<()> {
        for uniform in &mut self.uniforms {
            uniform.release(ctx)?;
            uniform.allocate(ctx, image_count)?;
        }
        Ok(())
    }

    pub(crate) fn sync_geometry<D: GpuDevice>(&mut self, ctx: &mut ResourceContext<D>) -> Result<()> {
        self.geometry.sync(ctx)
    }

    /// Upload this image's uniform buffers and any changed images.
    pub(crate) fn upload_uniforms<D: GpuDevice>(
        &mut self,
        ctx: &mut ResourceContext<D>,
        image_index: u32,
    ) -> Result<()> {
        for uniform in &mut self.uniforms {
            uniform.upload(ctx, image_index)?;
        }
        for image in &mut self.images {
            image.upload(ctx)?;
        }
        Ok(())
    }

    /// Allocate descriptor sets for `pipeline` on first use and write the
    /// sets of `image_index` if they have not been written yet.
    pub(crate) fn prepare_descriptors<D: GpuDevice>(
        &mut self,
        device: &D,
        pool: &DescriptorPool,
        pipeline: &Pipeline,
        image_count: usize,
        image_index: usize,
    ) -> Result<()> {
        if !self.descriptors.contains_key(&pipeline.id()) {
            let layouts: Vec<(u32, vk::DescriptorSetLayout)> = pipeline
                .set_layouts()
                .filter(|(_, _, bindings)| !bindings.is_empty())
                .map(|(set, layout, _)| (set, layout))
                .collect();
            let sets = if layouts.is_empty() {
                vec![Vec::new(); image_count]
            } else {
                let per_image: Vec<vk::DescriptorSetLayout> =
                    layouts.iter().map(|(_, layout)| *layout).collect();
                let all: Vec<vk::DescriptorSetLayout> = per_image
                    .iter()
                    .copied()
                    .cycle()
                    .take(per_image.len() * image_count)
                    .collect();
                let allocated = pool.allocate(device, &all)?;
                allocated
                    .chunks(layouts.len())
                    .map(|chunk| {
                        layouts
                            .iter()
                            .zip(chunk)
                            .map(|((set, _), handle)| (*set, *handle))
                            .collect()
                    })
                    .collect()
            };
            self.descriptors.insert(
                pipeline.id(),
                MeshDescriptors {
                    sets,
                    written: vec![false; image_count],
                },
            );
        }

        let Some(descriptors) = self.descriptors.get(&pipeline.id()) else {
            return Ok(());
        };
        if descriptors.written.get(image_index).copied().unwrap_or(true) {
            return Ok(());
        }

        let mut writes = Vec::new();
        for (set_number, set) in &descriptors.sets[image_index] {
            let Some(bindings) = pipeline.set_bindings(*set_number) else {
                continue;
            };
            for binding in bindings {
                match self.resource_for(*set_number, binding.binding, binding.descriptor_type, image_index) {
                    Some(resource) => writes.push(DescriptorWrite {
                        set: *set,
                        binding: binding.binding,
                        resource,
                    }),
                    None => warn!(
                        "{} set {set_number} binding {} has no matching mesh resource",
                        pipeline.id(),
                        binding.binding
                    ),
                }
            }
        }
        if !writes.is_empty() {
            device.update_descriptor_sets(&writes);
        }
        if let Some(descriptors) = self.descriptors.get_mut(&pipeline.id()) {
            descriptors.written[image_index] = true;
        }
        Ok(())
    }

    fn resource_for(
        &self,
        set: u32,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        image_index: usize,
    ) -> Option<DescriptorResource> {
        match descriptor_type {
            vk::DescriptorType::UNIFORM_BUFFER => self
                .uniforms
                .iter()
                .find(|u| u.set() == set && u.binding() == binding)
                .and_then(|u| u.descriptor(image_index)),
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER => self
                .images
                .iter()
                .find(|i| i.set() == set && i.binding() == binding)
                .and_then(UniformImage::descriptor),
            _ => None,
        }
    }

    /// Record push constants, descriptor bindings and the draw call.
    pub(crate) fn record<D: GpuDevice>(
        &self,
        device: &D,
        cmd: vk::CommandBuffer,
        pipeline: &Pipeline,
        image_index: usize,
    ) {
        for push in &self.push_constants {
            push.record(device, cmd, pipeline.layout());
        }
        if let Some(sets) = self
            .descriptors
            .get(&pipeline.id())
            .and_then(|d| d.sets.get(image_index))
        {
            for (set_number, set) in sets {
                device.cmd_bind_descriptor_sets(cmd, pipeline.layout(), *set_number, &[*set]);
            }
        }
        self.geometry.record(device, cmd);
    }

    pub(crate) fn mark_recorded(&mut self) {
        for push in &mut self.push_constants {
            push.mark_recorded();
        }
    }

    /// Free the descriptor sets allocated for `pipeline`.
    pub(crate) fn release_pipeline<D: GpuDevice>(
        &mut self,
        device: &D,
        pool: &DescriptorPool,
        pipeline: PipelineId,
    ) -> Result<()> {
        if let Some(descriptors) = self.descriptors.remove(&pipeline) {
            pool.free(device, &descriptors.all_sets())?;
        }
        Ok(())
    }

    /// Free every descriptor set. They are allocated and written again on the
    /// next recording.
    pub(crate) fn invalidate_descriptors<D: GpuDevice>(
        &mut self,
        device: &D,
        pool: &DescriptorPool,
    ) -> Result<()> {
        for (_, descriptors) in self.descriptors.drain() {
            pool.free(device, &descriptors.all_sets())?;
        }
        Ok(())
    }

    pub(crate) fn release<D: GpuDevice>(
        &mut self,
        ctx: &mut ResourceContext<D>,
        pool: &DescriptorPool,
    ) -> Result<()> {
        self.invalidate_descriptors(ctx.device(), pool)?;
        self.geometry.release(ctx)?;
        for uniform in &mut self.uniforms {
            uniform.release(ctx)?;
        }
        for image in &mut self.images {
            image.release(ctx)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vertex::ColorVertex;
    use glam::Vec3;
    use lucent_gpu::{MockDevice, MockEvent};

    fn triangle() -> Vec<ColorVertex> {
        vec![
            ColorVertex {
                position: Vec3::new(0.0, -0.5, 0.0),
                color: Vec3::X,
            },
            ColorVertex {
                position: Vec3::new(0.5, 0.5, 0.0),
                color: Vec3::Y,
            },
            ColorVertex {
                position: Vec3::new(-0.5, 0.5, 0.0),
                color: Vec3::Z,
            },
        ]
    }

    #[test]
    fn empty_geometry_is_rejected() {
        assert!(Mesh::new::<ColorVertex>(&[]).is_err());
        assert!(Mesh::indexed(&triangle(), &[]).is_err());
        assert!(Mesh::new(&triangle()).unwrap().set_indices(&[0, 1, 2]).is_err());
    }

    #[test]
    fn geometry_is_outdated_until_uploaded() {
        let mut ctx = ResourceContext::new(MockDevice::new()).unwrap();
        let mut mesh = Mesh::indexed(&triangle(), &[0, 1, 2]).unwrap();
        assert!(mesh.is_outdated());

        mesh.allocate(&mut ctx, 2).unwrap();
        assert!(!mesh.is_outdated());

        mesh.set_outdated();
        assert!(mesh.is_outdated());
        mesh.sync_geometry(&mut ctx).unwrap();
        assert!(!mesh.is_outdated());
        let pool = DescriptorPool::new(ctx.device(), 4, 4).unwrap();
        mesh.release(&mut ctx, &pool).unwrap();
        assert!(ctx.allocations().is_empty());
    }

    #[test]
    fn replacing_uploaded_geometry_waits_for_idle() {
        let mut ctx = ResourceContext::new(MockDevice::new()).unwrap();
        let mut mesh = Mesh::new(&triangle()).unwrap();
        mesh.allocate(&mut ctx, 2).unwrap();
        ctx.device().clear_events();

        let mut bigger = triangle();
        bigger.extend(triangle());
        mesh.set_vertices(&bigger).unwrap();
        mesh.sync_geometry(&mut ctx).unwrap();

        let events = ctx.device().events();
        assert_eq!(events.first(), Some(&MockEvent::DeviceWaitIdle));
        assert_eq!(ctx.allocations().len(), 1);
    }

    #[test]
    fn push_constant_change_outdates_mesh() {
        let mut ctx = ResourceContext::new(MockDevice::new()).unwrap();
        let mut mesh = Mesh::new(&triangle())
            .unwrap()
            .with_push_constant(PushConstant::new(vk::ShaderStageFlags::VERTEX, 0, &1.0_f32));
        mesh.allocate(&mut ctx, 2).unwrap();
        mesh.mark_recorded();
        assert!(!mesh.is_outdated());

        assert!(!mesh.update_push_constant(0, &1.0_f32).unwrap());
        assert!(!mesh.is_outdated());
        assert!(mesh.update_push_constant(0, &2.0_f32).unwrap());
        assert!(mesh.is_outdated());
        assert!(mesh.update_push_constant(4, &2.0_f32).is_err());
    }

    #[test]
    fn uniform_changes_do_not_outdate_recordings() {
        let mut ctx = ResourceContext::new(MockDevice::new()).unwrap();
        let mut mesh = Mesh::new(&triangle())
            .unwrap()
            .with_uniform(UniformBuffer::new(0, 0, &[0.0_f32; 4]));
        mesh.allocate(&mut ctx, 2).unwrap();

        assert!(mesh.update_uniform(0, 0, &[1.0_f32; 4]).unwrap());
        assert!(!mesh.is_outdated());
        assert!(mesh.uniforms()[0].is_outdated(0));
        assert!(mesh.update_uniform(0, 1, &[1.0_f32; 4]).is_err());
    }
}
