//! Device memory bookkeeping.
//!
//! Every buffer and image gets exactly one dedicated allocation. The
//! [`AllocationTable`] owns all of them; resources keep only the
//! [`AllocationId`] and hand it back when they are destroyed.

use crate::device::{GpuDevice, MemoryTarget};
use crate::error::{GpuError, Result};
use ash::vk;
use std::collections::HashMap;
use std::fmt;
use std::ptr::NonNull;

/// Stable identifier of a live allocation. Never reused within a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AllocationId(u64);

impl fmt::Display for AllocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A block of device memory bound to one resource.
#[derive(Debug, Clone, Copy)]
pub struct Allocation {
    memory: vk::DeviceMemory,
    memory_type_index: u32,
    properties: vk::MemoryPropertyFlags,
    size: vk::DeviceSize,
}

impl Allocation {
    /// Native memory handle.
    pub const fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    /// Index of the memory type the block was allocated from.
    pub const fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }

    /// Property flags of that memory type.
    pub const fn properties(&self) -> vk::MemoryPropertyFlags {
        self.properties
    }

    pub const fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// Offset of the resource inside the block. Always 0: nothing is sub-allocated.
    pub const fn offset(&self) -> vk::DeviceSize {
        0
    }

    pub fn is_host_visible(&self) -> bool {
        self.properties
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
    }
}

/// Pick the first memory type accepted by `type_bits` whose flags contain
/// every bit of `required`.
pub fn find_memory_type(
    properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> Option<u32> {
    properties
        .memory_types
        .iter()
        .take(properties.memory_type_count as usize)
        .enumerate()
        .find(|(i, memory_type)| {
            type_bits & (1 << i) != 0 && memory_type.property_flags.contains(required)
        })
        .map(|(i, _)| i as u32)
}

/// Owner of every device memory allocation.
///
/// Methods take `&mut self`, so callers sharing a table across threads wrap
/// it in a lock.
pub struct AllocationTable {
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    allocations: HashMap<AllocationId, Allocation>,
    next_id: u64,
}

impl AllocationTable {
    /// Create an empty table for a device's memory types.
    pub fn new(memory_properties: vk::PhysicalDeviceMemoryProperties) -> Self {
        Self {
            memory_properties,
            allocations: HashMap::new(),
            next_id: 0,
        }
    }

    /// Allocate memory for `buffer` with at least `properties` and bind it.
    pub fn allocate_buffer<D: GpuDevice>(
        &mut self,
        device: &D,
        buffer: vk::Buffer,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<AllocationId> {
        let requirements = device.buffer_memory_requirements(buffer);
        self.allocate(device, MemoryTarget::Buffer(buffer), requirements, properties)
    }

    /// Allocate memory for `image` with at least `properties` and bind it.
    pub fn allocate_image<D: GpuDevice>(
        &mut self,
        device: &D,
        image: vk::Image,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<AllocationId> {
        let requirements = device.image_memory_requirements(image);
        self.allocate(device, MemoryTarget::Image(image), requirements, properties)
    }

    /// Allocate a dedicated block for `target` and bind the resource to it.
    ///
    /// Fails with [`GpuError::NoSuitableMemoryType`] if no memory type
    /// satisfies both `requirements` and `properties`.
    pub fn allocate<D: GpuDevice>(
        &mut self,
        device: &D,
        target: MemoryTarget,
        requirements: vk::MemoryRequirements,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<AllocationId> {
        let memory_type_index =
            find_memory_type(&self.memory_properties, requirements.memory_type_bits, properties)
                .ok_or(GpuError::NoSuitableMemoryType {
                    type_bits: requirements.memory_type_bits,
                    properties,
                })?;

        let memory = device.allocate_memory(target, requirements, memory_type_index)?;
        let bound = match target {
            MemoryTarget::Buffer(buffer) => device.bind_buffer_memory(buffer, memory, 0),
            MemoryTarget::Image(image) => device.bind_image_memory(image, memory, 0),
        };
        if let Err(e) = bound {
            device.free_memory(memory)?;
            return Err(e);
        }

        let id = AllocationId(self.next_id);
        self.next_id += 1;
        self.allocations.insert(
            id,
            Allocation {
                memory,
                memory_type_index,
                properties: self.memory_properties.memory_types[memory_type_index as usize]
                    .property_flags,
                size: requirements.size,
            },
        );

        tracing::debug!(
            "Allocated {} bytes as {id} (memory type {memory_type_index})",
            requirements.size
        );
        Ok(id)
    }

    /// Release an allocation. No GPU work may still reference it.
    pub fn deallocate<D: GpuDevice>(&mut self, device: &D, id: AllocationId) -> Result<()> {
        let allocation = self
            .allocations
            .remove(&id)
            .ok_or(GpuError::AllocationNotFound(id))?;
        device.free_memory(allocation.memory)?;
        tracing::debug!("Freed allocation {id}");
        Ok(())
    }

    /// Map a host-visible allocation. The pointer is valid until [`Self::unmap`].
    pub fn map<D: GpuDevice>(&self, device: &D, id: AllocationId) -> Result<NonNull<u8>> {
        let allocation = self.get(id)?;
        if !allocation.is_host_visible() {
            return Err(GpuError::NotHostVisible(id));
        }
        device.map_memory(allocation.memory)
    }

    pub fn unmap<D: GpuDevice>(&self, device: &D, id: AllocationId) -> Result<()> {
        device.unmap_memory(self.get(id)?.memory);
        Ok(())
    }

    /// Copy `data` to the start of a host-visible allocation.
    pub fn write<D: GpuDevice>(&self, device: &D, id: AllocationId, data: &[u8]) -> Result<()> {
        let allocation = self.get(id)?;
        if data.len() as vk::DeviceSize > allocation.size {
            return Err(GpuError::InvalidState(format!(
                "write of {} bytes exceeds allocation {id} of {} bytes",
                data.len(),
                allocation.size
            )));
        }

        let ptr = self.map(device, id)?;
        // SAFETY: the mapping covers `allocation.size` bytes, checked above.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.as_ptr(), data.len());
        }
        self.unmap(device, id)
    }

    /// Offset of the resource inside its memory block.
    pub fn offset(&self, id: AllocationId) -> Result<vk::DeviceSize> {
        Ok(self.get(id)?.offset())
    }

    pub fn get(&self, id: AllocationId) -> Result<&Allocation> {
        self.allocations
            .get(&id)
            .ok_or(GpuError::AllocationNotFound(id))
    }

    /// Number of live allocations.
    pub fn len(&self) -> usize {
        self.allocations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }

    pub const fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }
}

impl Drop for AllocationTable {
    fn drop(&mut self) {
        if !self.allocations.is_empty() {
            tracing::warn!(
                "Allocation table dropped with {} live allocations",
                self.allocations.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDevice;

    fn properties(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (slot, flags) in props.memory_types.iter_mut().zip(types) {
            slot.property_flags = *flags;
        }
        props
    }

    #[test]
    fn picks_first_type_with_all_requested_flags() {
        let props = properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        ]);
        let host = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;

        assert_eq!(find_memory_type(&props, 0b111, host), Some(2));
        assert_eq!(
            find_memory_type(&props, 0b111, vk::MemoryPropertyFlags::HOST_VISIBLE),
            Some(1)
        );
        assert_eq!(
            find_memory_type(&props, 0b111, vk::MemoryPropertyFlags::empty()),
            Some(0)
        );
    }

    #[test]
    fn respects_resource_type_bits() {
        let props = properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ]);
        assert_eq!(
            find_memory_type(&props, 0b10, vk::MemoryPropertyFlags::DEVICE_LOCAL),
            Some(1)
        );
        assert_eq!(
            find_memory_type(&props, 0b100, vk::MemoryPropertyFlags::DEVICE_LOCAL),
            None
        );
    }

    #[test]
    fn allocate_then_deallocate_leaves_count_unchanged() {
        let device = MockDevice::new();
        let mut table = AllocationTable::new(device.memory_properties());
        let keep = device.create_buffer(16, vk::BufferUsageFlags::VERTEX_BUFFER).unwrap();
        let kept = table
            .allocate_buffer(&device, keep, vk::MemoryPropertyFlags::DEVICE_LOCAL)
            .unwrap();

        for size in [4, 256, 4096] {
            for mask in [
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            ] {
                let before = table.len();
                let buffer = device
                    .create_buffer(size, vk::BufferUsageFlags::UNIFORM_BUFFER)
                    .unwrap();
                let id = table.allocate_buffer(&device, buffer, mask).unwrap();
                assert_eq!(table.len(), before + 1);
                assert_eq!(table.offset(id).unwrap(), 0);
                assert!(table.get(id).unwrap().properties().contains(mask));

                table.deallocate(&device, id).unwrap();
                device.destroy_buffer(buffer);
                assert_eq!(table.len(), before);
            }
        }

        table.deallocate(&device, kept).unwrap();
        device.destroy_buffer(keep);
        assert!(table.is_empty());
        assert_eq!(device.live_memory_count(), 0);
    }

    #[test]
    fn unsatisfiable_mask_is_a_configuration_error() {
        let device = MockDevice::with_memory_types(&[vk::MemoryPropertyFlags::DEVICE_LOCAL]);
        let mut table = AllocationTable::new(device.memory_properties());
        let buffer = device.create_buffer(64, vk::BufferUsageFlags::UNIFORM_BUFFER).unwrap();

        let err = table
            .allocate_buffer(&device, buffer, vk::MemoryPropertyFlags::HOST_VISIBLE)
            .unwrap_err();
        assert!(matches!(err, GpuError::NoSuitableMemoryType { .. }));
        assert!(table.is_empty());
    }

    #[test]
    fn host_writes_reach_memory() {
        let device = MockDevice::new();
        let mut table = AllocationTable::new(device.memory_properties());
        let buffer = device.create_buffer(8, vk::BufferUsageFlags::UNIFORM_BUFFER).unwrap();
        let id = table
            .allocate_buffer(
                &device,
                buffer,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            )
            .unwrap();

        table.write(&device, id, &[1, 2, 3, 4]).unwrap();
        let memory = table.get(id).unwrap().memory();
        assert_eq!(&device.memory_contents(memory)[..4], &[1, 2, 3, 4]);

        table.deallocate(&device, id).unwrap();
    }

    #[test]
    fn device_local_memory_cannot_be_mapped() {
        let device = MockDevice::with_memory_types(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        ]);
        let mut table = AllocationTable::new(device.memory_properties());
        let buffer = device.create_buffer(8, vk::BufferUsageFlags::VERTEX_BUFFER).unwrap();
        let id = table
            .allocate_buffer(&device, buffer, vk::MemoryPropertyFlags::DEVICE_LOCAL)
            .unwrap();

        assert!(matches!(table.map(&device, id), Err(GpuError::NotHostVisible(_))));
        table.deallocate(&device, id).unwrap();
        assert!(matches!(
            table.deallocate(&device, id),
            Err(GpuError::AllocationNotFound(_))
        ));
    }
}
