//! Command pool and one-shot submission helpers.

use crate::device::{GpuDevice, Inheritance, Submission};
use crate::error::{GpuError, Result};
use ash::vk;

/// A resettable command pool on the graphics queue family.
#[derive(Debug)]
pub struct CommandPool {
    pool: vk::CommandPool,
}

impl CommandPool {
    pub fn new<D: GpuDevice>(device: &D) -> Result<Self> {
        Ok(Self {
            pool: device.create_command_pool()?,
        })
    }

    pub const fn handle(&self) -> vk::CommandPool {
        self.pool
    }

    /// Allocate a single command buffer.
    pub fn allocate_command_buffer<D: GpuDevice>(
        &self,
        device: &D,
        level: vk::CommandBufferLevel,
    ) -> Result<vk::CommandBuffer> {
        device
            .allocate_command_buffers(self.pool, level, 1)?
            .into_iter()
            .next()
            .ok_or_else(|| GpuError::Other("No command buffer allocated".to_string()))
    }

    /// Allocate `count` command buffers.
    pub fn allocate_command_buffers<D: GpuDevice>(
        &self,
        device: &D,
        level: vk::CommandBufferLevel,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>> {
        device.allocate_command_buffers(self.pool, level, count)
    }

    pub fn free<D: GpuDevice>(&self, device: &D, buffers: &[vk::CommandBuffer]) {
        if !buffers.is_empty() {
            device.free_command_buffers(self.pool, buffers);
        }
    }

    /// Destroy the pool and every buffer allocated from it.
    pub fn destroy<D: GpuDevice>(&self, device: &D) {
        device.destroy_command_pool(self.pool);
    }
}

/// Begin a secondary command buffer that continues `inheritance`'s render pass.
pub fn begin_secondary<D: GpuDevice>(
    device: &D,
    cmd: vk::CommandBuffer,
    inheritance: Inheritance,
) -> Result<()> {
    device.begin_command_buffer(
        cmd,
        vk::CommandBufferUsageFlags::RENDER_PASS_CONTINUE,
        Some(inheritance),
    )
}

/// Record, submit and wait for a one-time command buffer.
///
/// Blocks until the graphics queue is idle. Meant for uploads outside the
/// per-frame path.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub fn execute_single_time_commands<D, F>(device: &D, pool: &CommandPool, f: F) -> Result<()>
where
    D: GpuDevice,
    F: FnOnce(&D, vk::CommandBuffer),
{
    let cmd = pool.allocate_command_buffer(device, vk::CommandBufferLevel::PRIMARY)?;

    let result = submit_and_wait(device, cmd, f);
    pool.free(device, &[cmd]);
    result
}

fn submit_and_wait<D, F>(device: &D, cmd: vk::CommandBuffer, f: F) -> Result<()>
where
    D: GpuDevice,
    F: FnOnce(&D, vk::CommandBuffer),
{
    device.begin_command_buffer(cmd, vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT, None)?;
    f(device, cmd);
    device.end_command_buffer(cmd)?;

    device.queue_submit(&Submission {
        command_buffers: &[cmd],
        wait_semaphores: &[],
        wait_stages: &[],
        signal_semaphores: &[],
        fence: vk::Fence::null(),
    })?;
    device.queue_wait_idle()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockDevice, MockEvent};

    #[test]
    fn single_time_commands_submit_and_wait() {
        let device = MockDevice::new();
        let pool = CommandPool::new(&device).unwrap();
        let src = device.create_buffer(4, vk::BufferUsageFlags::TRANSFER_SRC).unwrap();
        let dst = device.create_buffer(4, vk::BufferUsageFlags::TRANSFER_DST).unwrap();

        let mut recorded = None;
        execute_single_time_commands(&device, &pool, |device, cmd| {
            device.cmd_copy_buffer(cmd, src, dst, 4);
            recorded = Some(cmd);
        })
        .unwrap();

        let events = device.events();
        assert!(matches!(
            events.as_slice(),
            [MockEvent::Submit { .. }, MockEvent::QueueWaitIdle]
        ));
        // The buffer was freed after the wait.
        assert!(device.recorded(recorded.unwrap()).is_empty());
        pool.destroy(&device);
    }

    #[test]
    fn secondary_buffers_require_inheritance() {
        let device = MockDevice::new();
        let pool = CommandPool::new(&device).unwrap();
        let cmd = pool
            .allocate_command_buffer(&device, vk::CommandBufferLevel::SECONDARY)
            .unwrap();

        assert!(device
            .begin_command_buffer(cmd, vk::CommandBufferUsageFlags::empty(), None)
            .is_err());
        begin_secondary(
            &device,
            cmd,
            Inheritance {
                render_pass: vk::RenderPass::null(),
                framebuffer: vk::Framebuffer::null(),
            },
        )
        .unwrap();
        assert_eq!(device.recording_count(cmd), 1);
    }
}
