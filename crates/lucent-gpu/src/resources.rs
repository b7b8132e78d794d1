//! Device, allocation table and transfer pool bundled for resource code.

use crate::command::{execute_single_time_commands, CommandPool};
use crate::device::{GpuDevice, ImageDesc};
use crate::error::Result;
use crate::memory::{AllocationId, AllocationTable};
use ash::vk;

/// Everything resource wrappers need to create, upload and destroy themselves.
///
/// Owns the device. Resources never hold a reference back to it; each
/// operation borrows the context instead.
pub struct ResourceContext<D: GpuDevice> {
    transfer_pool: CommandPool,
    allocations: AllocationTable,
    device: D,
}

impl<D: GpuDevice> ResourceContext<D> {
    pub fn new(device: D) -> Result<Self> {
        let allocations = AllocationTable::new(device.memory_properties());
        let transfer_pool = CommandPool::new(&device)?;
        Ok(Self {
            transfer_pool,
            allocations,
            device,
        })
    }

    pub const fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub const fn allocations(&self) -> &AllocationTable {
        &self.allocations
    }

    /// Create a buffer with its own allocation.
    pub fn create_buffer(
        &mut self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<(vk::Buffer, AllocationId)> {
        let buffer = self.device.create_buffer(size, usage)?;
        match self
            .allocations
            .allocate_buffer(&self.device, buffer, properties)
        {
            Ok(allocation) => Ok((buffer, allocation)),
            Err(e) => {
                self.device.destroy_buffer(buffer);
                Err(e)
            }
        }
    }

    pub fn free_buffer(&mut self, buffer: vk::Buffer, allocation: AllocationId) -> Result<()> {
        self.device.destroy_buffer(buffer);
        self.allocations.deallocate(&self.device, allocation)
    }

    /// Create an image with its own allocation.
    pub fn create_image(
        &mut self,
        desc: &ImageDesc,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<(vk::Image, AllocationId)> {
        let image = self.device.create_image(desc)?;
        match self
            .allocations
            .allocate_image(&self.device, image, properties)
        {
            Ok(allocation) => Ok((image, allocation)),
            Err(e) => {
                self.device.destroy_image(image);
                Err(e)
            }
        }
    }

    pub fn free_image(&mut self, image: vk::Image, allocation: AllocationId) -> Result<()> {
        self.device.destroy_image(image);
        self.allocations.deallocate(&self.device, allocation)
    }

    /// Copy bytes into a host-visible allocation.
    pub fn write(&self, allocation: AllocationId, data: &[u8]) -> Result<()> {
        self.allocations.write(&self.device, allocation, data)
    }

    /// Record and submit a one-shot command buffer, blocking until it completes.
    pub fn one_shot<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&D, vk::CommandBuffer),
    {
        execute_single_time_commands(&self.device, &self.transfer_pool, f)
    }
}

impl<D: GpuDevice> Drop for ResourceContext<D> {
    fn drop(&mut self) {
        self.transfer_pool.destroy(&self.device);
    }
}
