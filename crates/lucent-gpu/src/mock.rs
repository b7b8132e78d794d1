//! In-memory [`GpuDevice`] for tests.
//!
//! Handles are plain counters. Fences follow the real state machine
//! (signaled, unsignaled, pending after a submit); waiting on a pending fence
//! completes it and is logged as a blocking wait. Host-visible memory is
//! backed by byte vectors and buffer copies run when they are submitted.

use crate::device::{
    AcquireOutcome, DescriptorBinding, DescriptorWrite, GpuDevice, GraphicsPipelineDesc,
    ImageBarrier, ImageDesc, Inheritance, MemoryTarget, PresentOutcome, RenderPassDesc,
    SamplerDesc, Submission, SwapchainInfo,
};
use crate::error::{GpuError, Result};
use ash::vk::{self, Handle};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::ptr::NonNull;

/// State of a mock fence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceState {
    Signaled,
    Unsignaled,
    /// Submitted work has not been waited on yet.
    Pending,
}

/// Device-level call observed by the mock.
#[derive(Debug, Clone, PartialEq)]
pub enum MockEvent {
    FenceWait { fence: vk::Fence, blocked: bool },
    FenceReset(vk::Fence),
    Submit {
        command_buffers: Vec<vk::CommandBuffer>,
        signal_semaphores: Vec<vk::Semaphore>,
        fence: vk::Fence,
    },
    Acquire(AcquireOutcome),
    Present { image_index: u32 },
    DeviceWaitIdle,
    QueueWaitIdle,
    RecreateSwapchain(vk::Extent2D),
}

/// Command recorded into a mock command buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum MockCommand {
    BeginRenderPass {
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        contents: vk::SubpassContents,
    },
    EndRenderPass,
    ExecuteCommands(Vec<vk::CommandBuffer>),
    BindPipeline(vk::Pipeline),
    SetViewportScissor(vk::Extent2D),
    BindVertexBuffer(vk::Buffer),
    BindIndexBuffer(vk::Buffer),
    BindDescriptorSets {
        first_set: u32,
        sets: Vec<vk::DescriptorSet>,
    },
    PushConstants { offset: u32, data: Vec<u8> },
    Draw(u32),
    DrawIndexed(u32),
    CopyBuffer {
        src: vk::Buffer,
        dst: vk::Buffer,
        size: vk::DeviceSize,
    },
    CopyBufferToImage { src: vk::Buffer, image: vk::Image },
    ImageBarrier {
        image: vk::Image,
        new_layout: vk::ImageLayout,
    },
    Blit { image: vk::Image, dst_mip: u32 },
}

#[derive(Debug, Default)]
struct CommandBufferState {
    pool: u64,
    level: vk::CommandBufferLevel,
    commands: Vec<MockCommand>,
    recordings: usize,
    resets: usize,
    inheritance: Option<vk::Framebuffer>,
}

struct MockState {
    next_handle: u64,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    max_samples: vk::SampleCountFlags,
    live: HashMap<u64, &'static str>,
    memory: HashMap<u64, Vec<u8>>,
    buffers: HashMap<u64, (vk::DeviceSize, Option<u64>)>,
    fences: HashMap<u64, FenceState>,
    max_pending_fences: usize,
    command_buffers: HashMap<u64, CommandBufferState>,
    descriptor_sets: HashMap<u64, u64>,
    descriptor_writes: Vec<DescriptorWrite>,
    pipelines: Vec<GraphicsPipelineDesc>,
    events: Vec<MockEvent>,
    swapchain: SwapchainInfo,
    swapchain_views: Vec<vk::ImageView>,
    next_image: u32,
    image_count_on_recreate: Option<u32>,
    acquire_script: VecDeque<AcquireOutcome>,
    present_script: VecDeque<PresentOutcome>,
}

impl MockState {
    fn handle(&mut self, kind: &'static str) -> u64 {
        self.next_handle += 1;
        self.live.insert(self.next_handle, kind);
        self.next_handle
    }

    fn release(&mut self, raw: u64) {
        self.live.remove(&raw);
    }

    fn make_swapchain_views(&mut self) {
        self.swapchain_views = (0..self.swapchain.image_count)
            .map(|_| {
                self.next_handle += 1;
                vk::ImageView::from_raw(self.next_handle)
            })
            .collect();
    }

    fn push(&mut self, cmd: vk::CommandBuffer, command: MockCommand) {
        if let Some(state) = self.command_buffers.get_mut(&cmd.as_raw()) {
            state.commands.push(command);
        }
    }

    fn run_copies(&mut self, command_buffers: &[vk::CommandBuffer]) {
        let copies: Vec<(u64, u64, usize)> = command_buffers
            .iter()
            .filter_map(|cmd| self.command_buffers.get(&cmd.as_raw()))
            .flat_map(|state| state.commands.iter())
            .filter_map(|command| match command {
                MockCommand::CopyBuffer { src, dst, size } => {
                    Some((src.as_raw(), dst.as_raw(), *size as usize))
                }
                _ => None,
            })
            .collect();

        for (src, dst, size) in copies {
            let src_memory = self.buffers.get(&src).and_then(|b| b.1);
            let dst_memory = self.buffers.get(&dst).and_then(|b| b.1);
            if let (Some(src_memory), Some(dst_memory)) = (src_memory, dst_memory) {
                let bytes: Vec<u8> = self.memory[&src_memory][..size].to_vec();
                if let Some(target) = self.memory.get_mut(&dst_memory) {
                    target[..size].copy_from_slice(&bytes);
                }
            }
        }
    }
}

/// In-memory device.
pub struct MockDevice {
    state: Mutex<MockState>,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevice {
    /// Device with one device-local and one host-visible coherent memory
    /// type, two presentable images at 800x600 and up to 4x MSAA.
    pub fn new() -> Self {
        Self::with_memory_types(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        ])
    }

    pub fn with_memory_types(types: &[vk::MemoryPropertyFlags]) -> Self {
        let mut memory_properties = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (slot, flags) in memory_properties.memory_types.iter_mut().zip(types) {
            slot.property_flags = *flags;
        }

        let mut state = MockState {
            next_handle: 0,
            memory_properties,
            max_samples: vk::SampleCountFlags::TYPE_4,
            live: HashMap::new(),
            memory: HashMap::new(),
            buffers: HashMap::new(),
            fences: HashMap::new(),
            max_pending_fences: 0,
            command_buffers: HashMap::new(),
            descriptor_sets: HashMap::new(),
            descriptor_writes: Vec::new(),
            pipelines: Vec::new(),
            events: Vec::new(),
            swapchain: SwapchainInfo {
                format: vk::Format::B8G8R8A8_SRGB,
                extent: vk::Extent2D {
                    width: 800,
                    height: 600,
                },
                image_count: 2,
            },
            swapchain_views: Vec::new(),
            next_image: 0,
            image_count_on_recreate: None,
            acquire_script: VecDeque::new(),
            present_script: VecDeque::new(),
        };
        state.make_swapchain_views();

        Self {
            state: Mutex::new(state),
        }
    }

    /// Set the number of presentable images, rebuilding their views.
    #[must_use]
    pub fn with_image_count(self, image_count: u32) -> Self {
        {
            let mut state = self.state.lock();
            state.swapchain.image_count = image_count;
            state.make_swapchain_views();
        }
        self
    }

    /// Image count the next `recreate_swapchain` reports.
    pub fn set_image_count_on_recreate(&self, image_count: u32) {
        self.state.lock().image_count_on_recreate = Some(image_count);
    }

    /// Queue an outcome for a future acquire. Unscripted acquires rotate
    /// through the images.
    pub fn script_acquire(&self, outcome: AcquireOutcome) {
        self.state.lock().acquire_script.push_back(outcome);
    }

    /// Queue an outcome for a future present.
    pub fn script_present(&self, outcome: PresentOutcome) {
        self.state.lock().present_script.push_back(outcome);
    }

    pub fn events(&self) -> Vec<MockEvent> {
        self.state.lock().events.clone()
    }

    pub fn clear_events(&self) {
        self.state.lock().events.clear();
    }

    /// Number of fence waits that had to wait for submitted work.
    pub fn blocking_fence_waits(&self) -> usize {
        self.state
            .lock()
            .events
            .iter()
            .filter(|e| matches!(e, MockEvent::FenceWait { blocked: true, .. }))
            .count()
    }

    pub fn submissions(&self) -> usize {
        self.state
            .lock()
            .events
            .iter()
            .filter(|e| matches!(e, MockEvent::Submit { .. }))
            .count()
    }

    pub fn fence_state(&self, fence: vk::Fence) -> Option<FenceState> {
        self.state.lock().fences.get(&fence.as_raw()).copied()
    }

    /// Highest number of fences pending at the same time.
    pub fn max_pending_fences(&self) -> usize {
        self.state.lock().max_pending_fences
    }

    /// Commands currently recorded in `cmd`.
    pub fn recorded(&self, cmd: vk::CommandBuffer) -> Vec<MockCommand> {
        self.state
            .lock()
            .command_buffers
            .get(&cmd.as_raw())
            .map(|s| s.commands.clone())
            .unwrap_or_default()
    }

    /// How many times `cmd` has been begun.
    pub fn recording_count(&self, cmd: vk::CommandBuffer) -> usize {
        self.state
            .lock()
            .command_buffers
            .get(&cmd.as_raw())
            .map_or(0, |s| s.recordings)
    }

    /// How many times `cmd` was reset explicitly.
    pub fn reset_count(&self, cmd: vk::CommandBuffer) -> usize {
        self.state
            .lock()
            .command_buffers
            .get(&cmd.as_raw())
            .map_or(0, |s| s.resets)
    }

    /// Framebuffer a secondary buffer was last begun against.
    pub fn inherited_framebuffer(&self, cmd: vk::CommandBuffer) -> Option<vk::Framebuffer> {
        self.state
            .lock()
            .command_buffers
            .get(&cmd.as_raw())
            .and_then(|s| s.inheritance)
    }

    pub fn memory_contents(&self, memory: vk::DeviceMemory) -> Vec<u8> {
        self.state
            .lock()
            .memory
            .get(&memory.as_raw())
            .cloned()
            .unwrap_or_default()
    }

    /// Contents of the memory bound to `buffer`.
    pub fn buffer_contents(&self, buffer: vk::Buffer) -> Vec<u8> {
        let state = self.state.lock();
        state
            .buffers
            .get(&buffer.as_raw())
            .and_then(|(_, memory)| *memory)
            .and_then(|memory| state.memory.get(&memory).cloned())
            .unwrap_or_default()
    }

    pub fn live_memory_count(&self) -> usize {
        self.state.lock().memory.len()
    }

    /// Live objects of one kind, e.g. `"framebuffer"`.
    pub fn live_count(&self, kind: &str) -> usize {
        self.state.lock().live.values().filter(|k| **k == kind).count()
    }

    /// Every created object not destroyed yet, excluding presentable images.
    pub fn live_object_count(&self) -> usize {
        self.state.lock().live.len()
    }

    pub fn descriptor_writes(&self) -> Vec<DescriptorWrite> {
        self.state.lock().descriptor_writes.clone()
    }

    pub fn live_descriptor_sets(&self) -> usize {
        self.state.lock().descriptor_sets.len()
    }

    /// Descriptions of every graphics pipeline created so far.
    pub fn pipeline_descs(&self) -> Vec<GraphicsPipelineDesc> {
        self.state.lock().pipelines.clone()
    }
}

impl GpuDevice for MockDevice {
    fn memory_properties(&self) -> vk::PhysicalDeviceMemoryProperties {
        self.state.lock().memory_properties
    }

    fn max_sample_count(&self) -> vk::SampleCountFlags {
        self.state.lock().max_samples
    }

    fn depth_format(&self) -> vk::Format {
        vk::Format::D32_SFLOAT
    }

    fn supports_linear_blit(&self, _format: vk::Format) -> bool {
        true
    }

    fn wait_idle(&self) -> Result<()> {
        let mut state = self.state.lock();
        for fence in state.fences.values_mut() {
            if *fence == FenceState::Pending {
                *fence = FenceState::Signaled;
            }
        }
        state.events.push(MockEvent::DeviceWaitIdle);
        Ok(())
    }

    fn allocate_memory(
        &self,
        _target: MemoryTarget,
        requirements: vk::MemoryRequirements,
        memory_type_index: u32,
    ) -> Result<vk::DeviceMemory> {
        let mut state = self.state.lock();
        if memory_type_index >= state.memory_properties.memory_type_count {
            return Err(GpuError::AllocationFailed(format!(
                "memory type {memory_type_index} does not exist"
            )));
        }
        let raw = state.handle("memory");
        state.memory.insert(raw, vec![0; requirements.size as usize]);
        Ok(vk::DeviceMemory::from_raw(raw))
    }

    fn free_memory(&self, memory: vk::DeviceMemory) -> Result<()> {
        let mut state = self.state.lock();
        state
            .memory
            .remove(&memory.as_raw())
            .ok_or_else(|| GpuError::InvalidState("double free of device memory".to_string()))?;
        state.release(memory.as_raw());
        Ok(())
    }

    fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        _offset: vk::DeviceSize,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let entry = state
            .buffers
            .get_mut(&buffer.as_raw())
            .ok_or_else(|| GpuError::InvalidState("bind to unknown buffer".to_string()))?;
        entry.1 = Some(memory.as_raw());
        Ok(())
    }

    fn bind_image_memory(
        &self,
        _image: vk::Image,
        _memory: vk::DeviceMemory,
        _offset: vk::DeviceSize,
    ) -> Result<()> {
        Ok(())
    }

    fn map_memory(&self, memory: vk::DeviceMemory) -> Result<NonNull<u8>> {
        let mut state = self.state.lock();
        let bytes = state
            .memory
            .get_mut(&memory.as_raw())
            .ok_or_else(|| GpuError::InvalidState("map of unknown memory".to_string()))?;
        NonNull::new(bytes.as_mut_ptr())
            .ok_or_else(|| GpuError::InvalidState("map of empty memory".to_string()))
    }

    fn unmap_memory(&self, _memory: vk::DeviceMemory) {}

    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        _usage: vk::BufferUsageFlags,
    ) -> Result<vk::Buffer> {
        let mut state = self.state.lock();
        let raw = state.handle("buffer");
        state.buffers.insert(raw, (size, None));
        Ok(vk::Buffer::from_raw(raw))
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        let mut state = self.state.lock();
        state.buffers.remove(&buffer.as_raw());
        state.release(buffer.as_raw());
    }

    fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements {
        let state = self.state.lock();
        let size = state.buffers.get(&buffer.as_raw()).map_or(0, |b| b.0);
        vk::MemoryRequirements {
            size,
            alignment: 256,
            memory_type_bits: (1 << state.memory_properties.memory_type_count) - 1,
        }
    }

    fn create_image(&self, _desc: &ImageDesc) -> Result<vk::Image> {
        Ok(vk::Image::from_raw(self.state.lock().handle("image")))
    }

    fn destroy_image(&self, image: vk::Image) {
        self.state.lock().release(image.as_raw());
    }

    fn image_memory_requirements(&self, _image: vk::Image) -> vk::MemoryRequirements {
        let state = self.state.lock();
        vk::MemoryRequirements {
            size: 64,
            alignment: 256,
            memory_type_bits: (1 << state.memory_properties.memory_type_count) - 1,
        }
    }

    fn create_image_view(
        &self,
        _image: vk::Image,
        _format: vk::Format,
        _aspect: vk::ImageAspectFlags,
        _mip_levels: u32,
    ) -> Result<vk::ImageView> {
        Ok(vk::ImageView::from_raw(self.state.lock().handle("image view")))
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        self.state.lock().release(view.as_raw());
    }

    fn create_sampler(&self, _desc: &SamplerDesc) -> Result<vk::Sampler> {
        Ok(vk::Sampler::from_raw(self.state.lock().handle("sampler")))
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        self.state.lock().release(sampler.as_raw());
    }

    fn create_semaphore(&self) -> Result<vk::Semaphore> {
        Ok(vk::Semaphore::from_raw(self.state.lock().handle("semaphore")))
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.state.lock().release(semaphore.as_raw());
    }

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let mut state = self.state.lock();
        let raw = state.handle("fence");
        let initial = if signaled {
            FenceState::Signaled
        } else {
            FenceState::Unsignaled
        };
        state.fences.insert(raw, initial);
        Ok(vk::Fence::from_raw(raw))
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.state.lock();
        state.fences.remove(&fence.as_raw());
        state.release(fence.as_raw());
    }

    fn wait_for_fences(&self, fences: &[vk::Fence], _timeout_ns: u64) -> Result<()> {
        let mut state = self.state.lock();
        for fence in fences {
            let current = state
                .fences
                .get(&fence.as_raw())
                .copied()
                .ok_or_else(|| GpuError::InvalidState("wait on unknown fence".to_string()))?;
            match current {
                FenceState::Signaled => state.events.push(MockEvent::FenceWait {
                    fence: *fence,
                    blocked: false,
                }),
                FenceState::Pending => {
                    state.fences.insert(fence.as_raw(), FenceState::Signaled);
                    state.events.push(MockEvent::FenceWait {
                        fence: *fence,
                        blocked: true,
                    });
                }
                // Nothing was submitted, so nothing will ever signal it.
                FenceState::Unsignaled => return Err(GpuError::Timeout),
            }
        }
        Ok(())
    }

    fn reset_fences(&self, fences: &[vk::Fence]) -> Result<()> {
        let mut state = self.state.lock();
        for fence in fences {
            if state.fences.get(&fence.as_raw()) == Some(&FenceState::Pending) {
                return Err(GpuError::InvalidState(
                    "reset of a fence with pending work".to_string(),
                ));
            }
            state.fences.insert(fence.as_raw(), FenceState::Unsignaled);
            state.events.push(MockEvent::FenceReset(*fence));
        }
        Ok(())
    }

    fn create_command_pool(&self) -> Result<vk::CommandPool> {
        Ok(vk::CommandPool::from_raw(
            self.state.lock().handle("command pool"),
        ))
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut state = self.state.lock();
        state
            .command_buffers
            .retain(|_, buffer| buffer.pool != pool.as_raw());
        state.release(pool.as_raw());
    }

    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        level: vk::CommandBufferLevel,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>> {
        let mut state = self.state.lock();
        Ok((0..count)
            .map(|_| {
                state.next_handle += 1;
                let raw = state.next_handle;
                state.command_buffers.insert(
                    raw,
                    CommandBufferState {
                        pool: pool.as_raw(),
                        level,
                        ..Default::default()
                    },
                );
                vk::CommandBuffer::from_raw(raw)
            })
            .collect())
    }

    fn free_command_buffers(&self, _pool: vk::CommandPool, buffers: &[vk::CommandBuffer]) {
        let mut state = self.state.lock();
        for cmd in buffers {
            state.command_buffers.remove(&cmd.as_raw());
        }
    }

    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        let mut state = self.state.lock();
        let buffer = state
            .command_buffers
            .get_mut(&cmd.as_raw())
            .ok_or_else(|| GpuError::InvalidState("reset of unknown command buffer".to_string()))?;
        buffer.commands.clear();
        buffer.resets += 1;
        Ok(())
    }

    fn begin_command_buffer(
        &self,
        cmd: vk::CommandBuffer,
        _flags: vk::CommandBufferUsageFlags,
        inheritance: Option<Inheritance>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let buffer = state
            .command_buffers
            .get_mut(&cmd.as_raw())
            .ok_or_else(|| GpuError::InvalidState("begin of unknown command buffer".to_string()))?;
        if buffer.level == vk::CommandBufferLevel::SECONDARY && inheritance.is_none() {
            return Err(GpuError::InvalidState(
                "secondary command buffer begun without inheritance".to_string(),
            ));
        }
        buffer.commands.clear();
        buffer.recordings += 1;
        buffer.inheritance = inheritance.map(|i| i.framebuffer);
        Ok(())
    }

    fn end_command_buffer(&self, _cmd: vk::CommandBuffer) -> Result<()> {
        Ok(())
    }

    fn cmd_begin_render_pass(
        &self,
        cmd: vk::CommandBuffer,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        _extent: vk::Extent2D,
        _clear_values: &[vk::ClearValue],
        contents: vk::SubpassContents,
    ) {
        self.state.lock().push(
            cmd,
            MockCommand::BeginRenderPass {
                render_pass,
                framebuffer,
                contents,
            },
        );
    }

    fn cmd_end_render_pass(&self, cmd: vk::CommandBuffer) {
        self.state.lock().push(cmd, MockCommand::EndRenderPass);
    }

    fn cmd_execute_commands(&self, cmd: vk::CommandBuffer, secondaries: &[vk::CommandBuffer]) {
        self.state
            .lock()
            .push(cmd, MockCommand::ExecuteCommands(secondaries.to_vec()));
    }

    fn cmd_bind_pipeline(&self, cmd: vk::CommandBuffer, pipeline: vk::Pipeline) {
        self.state.lock().push(cmd, MockCommand::BindPipeline(pipeline));
    }

    fn cmd_set_viewport_scissor(&self, cmd: vk::CommandBuffer, extent: vk::Extent2D) {
        self.state
            .lock()
            .push(cmd, MockCommand::SetViewportScissor(extent));
    }

    fn cmd_bind_vertex_buffer(&self, cmd: vk::CommandBuffer, buffer: vk::Buffer) {
        self.state
            .lock()
            .push(cmd, MockCommand::BindVertexBuffer(buffer));
    }

    fn cmd_bind_index_buffer(
        &self,
        cmd: vk::CommandBuffer,
        buffer: vk::Buffer,
        _index_type: vk::IndexType,
    ) {
        self.state
            .lock()
            .push(cmd, MockCommand::BindIndexBuffer(buffer));
    }

    fn cmd_bind_descriptor_sets(
        &self,
        cmd: vk::CommandBuffer,
        _layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    ) {
        self.state.lock().push(
            cmd,
            MockCommand::BindDescriptorSets {
                first_set,
                sets: sets.to_vec(),
            },
        );
    }

    fn cmd_push_constants(
        &self,
        cmd: vk::CommandBuffer,
        _layout: vk::PipelineLayout,
        _stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) {
        self.state.lock().push(
            cmd,
            MockCommand::PushConstants {
                offset,
                data: data.to_vec(),
            },
        );
    }

    fn cmd_draw(&self, cmd: vk::CommandBuffer, vertex_count: u32) {
        self.state.lock().push(cmd, MockCommand::Draw(vertex_count));
    }

    fn cmd_draw_indexed(&self, cmd: vk::CommandBuffer, index_count: u32) {
        self.state
            .lock()
            .push(cmd, MockCommand::DrawIndexed(index_count));
    }

    fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        size: vk::DeviceSize,
    ) {
        self.state
            .lock()
            .push(cmd, MockCommand::CopyBuffer { src, dst, size });
    }

    fn cmd_copy_buffer_to_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        image: vk::Image,
        _extent: vk::Extent2D,
    ) {
        self.state
            .lock()
            .push(cmd, MockCommand::CopyBufferToImage { src, image });
    }

    fn cmd_image_barrier(&self, cmd: vk::CommandBuffer, barrier: &ImageBarrier) {
        self.state.lock().push(
            cmd,
            MockCommand::ImageBarrier {
                image: barrier.image,
                new_layout: barrier.new_layout,
            },
        );
    }

    fn cmd_blit_image(&self, cmd: vk::CommandBuffer, image: vk::Image, region: &vk::ImageBlit) {
        self.state.lock().push(
            cmd,
            MockCommand::Blit {
                image,
                dst_mip: region.dst_subresource.mip_level,
            },
        );
    }

    fn queue_submit(&self, submission: &Submission<'_>) -> Result<()> {
        let mut state = self.state.lock();
        if submission.fence != vk::Fence::null() {
            match state.fences.get(&submission.fence.as_raw()) {
                Some(FenceState::Unsignaled) => {}
                _ => {
                    return Err(GpuError::InvalidState(
                        "submit with a fence that is not reset".to_string(),
                    ))
                }
            }
            state
                .fences
                .insert(submission.fence.as_raw(), FenceState::Pending);
            let pending = state
                .fences
                .values()
                .filter(|f| **f == FenceState::Pending)
                .count();
            state.max_pending_fences = state.max_pending_fences.max(pending);
        }

        state.run_copies(submission.command_buffers);
        state.events.push(MockEvent::Submit {
            command_buffers: submission.command_buffers.to_vec(),
            signal_semaphores: submission.signal_semaphores.to_vec(),
            fence: submission.fence,
        });
        Ok(())
    }

    fn queue_wait_idle(&self) -> Result<()> {
        let mut state = self.state.lock();
        for fence in state.fences.values_mut() {
            if *fence == FenceState::Pending {
                *fence = FenceState::Signaled;
            }
        }
        state.events.push(MockEvent::QueueWaitIdle);
        Ok(())
    }

    fn swapchain_info(&self) -> SwapchainInfo {
        self.state.lock().swapchain
    }

    fn swapchain_image_views(&self) -> Vec<vk::ImageView> {
        self.state.lock().swapchain_views.clone()
    }

    fn recreate_swapchain(&mut self, extent: vk::Extent2D) -> Result<SwapchainInfo> {
        let mut state = self.state.lock();
        state.swapchain.extent = extent;
        if let Some(count) = state.image_count_on_recreate.take() {
            state.swapchain.image_count = count;
        }
        state.make_swapchain_views();
        state.next_image = 0;
        state.events.push(MockEvent::RecreateSwapchain(extent));
        Ok(state.swapchain)
    }

    fn acquire_next_image(
        &self,
        _semaphore: vk::Semaphore,
        _timeout_ns: u64,
    ) -> Result<AcquireOutcome> {
        let mut state = self.state.lock();
        let outcome = if let Some(outcome) = state.acquire_script.pop_front() {
            outcome
        } else {
            let image_index = state.next_image;
            state.next_image = (image_index + 1) % state.swapchain.image_count;
            AcquireOutcome::Acquired {
                image_index,
                suboptimal: false,
            }
        };
        state.events.push(MockEvent::Acquire(outcome));
        Ok(outcome)
    }

    fn present(&self, image_index: u32, _wait_semaphore: vk::Semaphore) -> Result<PresentOutcome> {
        let mut state = self.state.lock();
        state.events.push(MockEvent::Present { image_index });
        Ok(state
            .present_script
            .pop_front()
            .unwrap_or(PresentOutcome::Presented))
    }

    fn create_render_pass(&self, _desc: &RenderPassDesc) -> Result<vk::RenderPass> {
        Ok(vk::RenderPass::from_raw(
            self.state.lock().handle("render pass"),
        ))
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        self.state.lock().release(render_pass.as_raw());
    }

    fn create_framebuffer(
        &self,
        _render_pass: vk::RenderPass,
        _attachments: &[vk::ImageView],
        _extent: vk::Extent2D,
    ) -> Result<vk::Framebuffer> {
        Ok(vk::Framebuffer::from_raw(
            self.state.lock().handle("framebuffer"),
        ))
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        self.state.lock().release(framebuffer.as_raw());
    }

    fn create_shader_module(&self, _code: &[u32]) -> Result<vk::ShaderModule> {
        Ok(vk::ShaderModule::from_raw(
            self.state.lock().handle("shader module"),
        ))
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        self.state.lock().release(module.as_raw());
    }

    fn create_descriptor_set_layout(
        &self,
        _bindings: &[DescriptorBinding],
    ) -> Result<vk::DescriptorSetLayout> {
        Ok(vk::DescriptorSetLayout::from_raw(
            self.state.lock().handle("descriptor set layout"),
        ))
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        self.state.lock().release(layout.as_raw());
    }

    fn create_pipeline_layout(
        &self,
        _set_layouts: &[vk::DescriptorSetLayout],
        _push_constant_ranges: &[vk::PushConstantRange],
    ) -> Result<vk::PipelineLayout> {
        Ok(vk::PipelineLayout::from_raw(
            self.state.lock().handle("pipeline layout"),
        ))
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        self.state.lock().release(layout.as_raw());
    }

    fn create_graphics_pipeline(&self, desc: &GraphicsPipelineDesc) -> Result<vk::Pipeline> {
        let mut state = self.state.lock();
        state.pipelines.push(desc.clone());
        Ok(vk::Pipeline::from_raw(state.handle("pipeline")))
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        self.state.lock().release(pipeline.as_raw());
    }

    fn create_descriptor_pool(
        &self,
        _max_sets: u32,
        _pool_sizes: &[vk::DescriptorPoolSize],
    ) -> Result<vk::DescriptorPool> {
        Ok(vk::DescriptorPool::from_raw(
            self.state.lock().handle("descriptor pool"),
        ))
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        let mut state = self.state.lock();
        state
            .descriptor_sets
            .retain(|_, owner| *owner != pool.as_raw());
        state.release(pool.as_raw());
    }

    fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layouts: &[vk::DescriptorSetLayout],
    ) -> Result<Vec<vk::DescriptorSet>> {
        let mut state = self.state.lock();
        Ok(layouts
            .iter()
            .map(|_| {
                state.next_handle += 1;
                let raw = state.next_handle;
                state.descriptor_sets.insert(raw, pool.as_raw());
                vk::DescriptorSet::from_raw(raw)
            })
            .collect())
    }

    fn free_descriptor_sets(
        &self,
        _pool: vk::DescriptorPool,
        sets: &[vk::DescriptorSet],
    ) -> Result<()> {
        let mut state = self.state.lock();
        for set in sets {
            state.descriptor_sets.remove(&set.as_raw());
        }
        Ok(())
    }

    fn update_descriptor_sets(&self, writes: &[DescriptorWrite]) {
        self.state.lock().descriptor_writes.extend_from_slice(writes);
    }
}
