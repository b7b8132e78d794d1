//! Device-resident buffers.

use crate::device::{DescriptorResource, GpuDevice};
use crate::error::{GpuError, Result};
use crate::memory::AllocationId;
use crate::resources::ResourceContext;
use ash::vk;

/// Where a buffer's memory lives and how uploads reach it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    /// Host-visible coherent memory written in place. For data that changes
    /// every frame.
    HostVisible,
    /// Device-local memory filled through a staging buffer and a GPU copy.
    DeviceLocal,
}

impl Residency {
    pub const fn memory_properties(self) -> vk::MemoryPropertyFlags {
        match self {
            Self::HostVisible => vk::MemoryPropertyFlags::from_raw(
                vk::MemoryPropertyFlags::HOST_VISIBLE.as_raw()
                    | vk::MemoryPropertyFlags::HOST_COHERENT.as_raw(),
            ),
            Self::DeviceLocal => vk::MemoryPropertyFlags::DEVICE_LOCAL,
        }
    }
}

/// A buffer with one dedicated allocation and an outdated flag.
///
/// The flag starts set. [`Self::upload`] always writes and clears it; it does
/// not compare against previous contents. Callers that want to skip redundant
/// uploads check [`Self::is_outdated`] first, and anything that changes the
/// logical value calls [`Self::set_outdated`].
#[derive(Debug)]
pub struct DeviceBuffer {
    buffer: vk::Buffer,
    allocation: AllocationId,
    size: vk::DeviceSize,
    residency: Residency,
    outdated: bool,
}

impl DeviceBuffer {
    /// Create a buffer of `size` bytes. Device-local buffers also get
    /// `TRANSFER_DST` usage.
    pub fn new<D: GpuDevice>(
        ctx: &mut ResourceContext<D>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        residency: Residency,
    ) -> Result<Self> {
        if size == 0 {
            return Err(GpuError::InvalidState("buffer size must be non-zero".to_string()));
        }

        let usage = match residency {
            Residency::HostVisible => usage,
            Residency::DeviceLocal => usage | vk::BufferUsageFlags::TRANSFER_DST,
        };
        let (buffer, allocation) =
            ctx.create_buffer(size, usage, residency.memory_properties())?;

        Ok(Self {
            buffer,
            allocation,
            size,
            residency,
            outdated: true,
        })
    }

    /// Write `data` to the start of the buffer and clear the outdated flag.
    ///
    /// Device-local buffers block until the staging copy has completed.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn upload<D: GpuDevice>(&mut self, ctx: &mut ResourceContext<D>, data: &[u8]) -> Result<()> {
        let len = data.len() as vk::DeviceSize;
        if len > self.size {
            return Err(GpuError::InvalidState(format!(
                "upload of {len} bytes into a buffer of {} bytes",
                self.size
            )));
        }

        match self.residency {
            Residency::HostVisible => ctx.write(self.allocation, data)?,
            Residency::DeviceLocal if len > 0 => {
                let (staging, staging_allocation) = ctx.create_buffer(
                    len,
                    vk::BufferUsageFlags::TRANSFER_SRC,
                    Residency::HostVisible.memory_properties(),
                )?;
                let dst = self.buffer;
                let copied = ctx.write(staging_allocation, data).and_then(|()| {
                    ctx.one_shot(|device, cmd| device.cmd_copy_buffer(cmd, staging, dst, len))
                });
                ctx.free_buffer(staging, staging_allocation)?;
                copied?;
            }
            Residency::DeviceLocal => {}
        }

        self.outdated = false;
        Ok(())
    }

    /// Upload a slice of plain-old-data values.
    pub fn upload_pod<D: GpuDevice, T: bytemuck::Pod>(
        &mut self,
        ctx: &mut ResourceContext<D>,
        data: &[T],
    ) -> Result<()> {
        self.upload(ctx, bytemuck::cast_slice(data))
    }

    pub fn set_outdated(&mut self) {
        self.outdated = true;
    }

    pub const fn is_outdated(&self) -> bool {
        self.outdated
    }

    /// Bind as vertex buffer 0.
    pub fn bind_vertex<D: GpuDevice>(&self, device: &D, cmd: vk::CommandBuffer) {
        device.cmd_bind_vertex_buffer(cmd, self.buffer);
    }

    /// Bind as a 32-bit index buffer.
    pub fn bind_index<D: GpuDevice>(&self, device: &D, cmd: vk::CommandBuffer) {
        device.cmd_bind_index_buffer(cmd, self.buffer, vk::IndexType::UINT32);
    }

    /// Descriptor for binding the whole buffer as a uniform buffer.
    pub const fn descriptor(&self) -> DescriptorResource {
        DescriptorResource::UniformBuffer {
            buffer: self.buffer,
            range: self.size,
        }
    }

    pub const fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    pub const fn allocation(&self) -> AllocationId {
        self.allocation
    }

    pub const fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub const fn residency(&self) -> Residency {
        self.residency
    }

    /// Destroy the buffer and release its allocation. The GPU must be done with it.
    pub fn destroy<D: GpuDevice>(self, ctx: &mut ResourceContext<D>) -> Result<()> {
        ctx.free_buffer(self.buffer, self.allocation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockCommand, MockDevice, MockEvent};

    #[test]
    fn host_visible_upload_writes_in_place() {
        let mut ctx = ResourceContext::new(MockDevice::new()).unwrap();
        let mut buffer =
            DeviceBuffer::new(&mut ctx, 8, vk::BufferUsageFlags::UNIFORM_BUFFER, Residency::HostVisible)
                .unwrap();
        assert!(buffer.is_outdated());

        buffer.upload_pod(&mut ctx, &[7u32, 9]).unwrap();

        assert!(!buffer.is_outdated());
        assert_eq!(ctx.device().submissions(), 0);
        assert_eq!(
            ctx.device().buffer_contents(buffer.handle()),
            bytemuck::cast_slice::<u32, u8>(&[7, 9])
        );
        buffer.destroy(&mut ctx).unwrap();
    }

    #[test]
    fn device_local_upload_goes_through_staging() {
        let mut ctx = ResourceContext::new(MockDevice::new()).unwrap();
        let mut buffer =
            DeviceBuffer::new(&mut ctx, 12, vk::BufferUsageFlags::VERTEX_BUFFER, Residency::DeviceLocal)
                .unwrap();
        let allocation = ctx.allocations().get(buffer.allocation()).unwrap();
        assert!(allocation
            .properties()
            .contains(vk::MemoryPropertyFlags::DEVICE_LOCAL));

        buffer.upload(&mut ctx, &[1, 2, 3, 4, 5, 6]).unwrap();

        let events = ctx.device().events();
        assert!(matches!(
            events.as_slice(),
            [MockEvent::Submit { .. }, MockEvent::QueueWaitIdle]
        ));
        assert_eq!(&ctx.device().buffer_contents(buffer.handle())[..6], &[1, 2, 3, 4, 5, 6]);
        // Only the destination allocation is left.
        assert_eq!(ctx.allocations().len(), 1);
        assert!(!buffer.is_outdated());
        buffer.destroy(&mut ctx).unwrap();
        assert!(ctx.allocations().is_empty());
    }

    #[test]
    fn upload_does_not_guard_itself() {
        let mut ctx = ResourceContext::new(MockDevice::new()).unwrap();
        let mut buffer =
            DeviceBuffer::new(&mut ctx, 4, vk::BufferUsageFlags::VERTEX_BUFFER, Residency::DeviceLocal)
                .unwrap();

        buffer.upload(&mut ctx, &[1, 1, 1, 1]).unwrap();
        buffer.upload(&mut ctx, &[1, 1, 1, 1]).unwrap();
        assert_eq!(ctx.device().submissions(), 2);

        ctx.device().clear_events();
        for _ in 0..2 {
            if buffer.is_outdated() {
                buffer.upload(&mut ctx, &[1, 1, 1, 1]).unwrap();
            }
        }
        assert_eq!(ctx.device().submissions(), 0);

        buffer.set_outdated();
        for _ in 0..2 {
            if buffer.is_outdated() {
                buffer.upload(&mut ctx, &[2, 2, 2, 2]).unwrap();
            }
        }
        assert_eq!(ctx.device().submissions(), 1);
        buffer.destroy(&mut ctx).unwrap();
    }

    #[test]
    fn oversized_upload_is_rejected() {
        let mut ctx = ResourceContext::new(MockDevice::new()).unwrap();
        let mut buffer =
            DeviceBuffer::new(&mut ctx, 2, vk::BufferUsageFlags::VERTEX_BUFFER, Residency::HostVisible)
                .unwrap();

        assert!(buffer.upload(&mut ctx, &[0; 3]).is_err());
        assert!(buffer.is_outdated());
        buffer.destroy(&mut ctx).unwrap();
    }

    #[test]
    fn bind_records_vertex_and_index_bindings() {
        let mut ctx = ResourceContext::new(MockDevice::new()).unwrap();
        let vertices =
            DeviceBuffer::new(&mut ctx, 4, vk::BufferUsageFlags::VERTEX_BUFFER, Residency::HostVisible)
                .unwrap();
        let indices =
            DeviceBuffer::new(&mut ctx, 4, vk::BufferUsageFlags::INDEX_BUFFER, Residency::HostVisible)
                .unwrap();
        let cmd = ctx
            .device()
            .allocate_command_buffers(vk::CommandPool::null(), vk::CommandBufferLevel::PRIMARY, 1)
            .unwrap()[0];
        ctx.device()
            .begin_command_buffer(cmd, vk::CommandBufferUsageFlags::empty(), None)
            .unwrap();

        vertices.bind_vertex(ctx.device(), cmd);
        indices.bind_index(ctx.device(), cmd);

        assert_eq!(
            ctx.device().recorded(cmd),
            vec![
                MockCommand::BindVertexBuffer(vertices.handle()),
                MockCommand::BindIndexBuffer(indices.handle()),
            ]
        );
        vertices.destroy(&mut ctx).unwrap();
        indices.destroy(&mut ctx).unwrap();
    }
}
