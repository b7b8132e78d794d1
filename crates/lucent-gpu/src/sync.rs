//! Frames-in-flight synchronization.
//!
//! A fixed ring of [`FrameSlot`]s bounds how far the CPU may run ahead of the
//! GPU. The ring is sized independently of the swapchain; a separate
//! image-in-flight map remembers which slot fence last rendered each
//! presentable image.

use crate::device::GpuDevice;
use crate::error::{GpuError, Result};
use ash::vk;

/// Synchronization objects of one frame in flight.
#[derive(Debug, Clone, Copy)]
pub struct FrameSlot {
    /// Signaled when the acquired image is ready to be rendered to.
    pub image_available: vk::Semaphore,
    /// Signaled when the frame's submission has finished rendering.
    pub render_finished: vk::Semaphore,
    /// Signaled when the frame's submission has completed.
    pub in_flight: vk::Fence,
}

impl FrameSlot {
    /// Create the slot with its fence signaled, so the first wait returns at once.
    pub fn new<D: GpuDevice>(device: &D) -> Result<Self> {
        Ok(Self {
            image_available: device.create_semaphore()?,
            render_finished: device.create_semaphore()?,
            in_flight: device.create_fence(true)?,
        })
    }

    /// The slot's work must have completed.
    pub fn destroy<D: GpuDevice>(&self, device: &D) {
        device.destroy_semaphore(self.image_available);
        device.destroy_semaphore(self.render_finished);
        device.destroy_fence(self.in_flight);
    }
}

/// Ring of frame slots plus the image-in-flight map.
pub struct FrameSyncRing {
    slots: Vec<FrameSlot>,
    current: usize,
    images_in_flight: Vec<Option<vk::Fence>>,
    timeout_ns: u64,
}

impl FrameSyncRing {
    /// Create `frames_in_flight` slots for a swapchain with `image_count` images.
    pub fn new<D: GpuDevice>(
        device: &D,
        frames_in_flight: usize,
        image_count: usize,
        timeout_ns: u64,
    ) -> Result<Self> {
        if frames_in_flight == 0 {
            return Err(GpuError::InvalidState(
                "at least one frame in flight is required".to_string(),
            ));
        }

        let slots = (0..frames_in_flight)
            .map(|_| FrameSlot::new(device))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            slots,
            // The first advance lands on slot 0.
            current: frames_in_flight - 1,
            images_in_flight: vec![None; image_count],
            timeout_ns,
        })
    }

    /// Advance to the next slot and wait until its previous submission is done.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn begin_frame<D: GpuDevice>(&mut self, device: &D) -> Result<FrameSlot> {
        self.current = (self.current + 1) % self.slots.len();
        let slot = self.slots[self.current];
        device.wait_for_fences(&[slot.in_flight], self.timeout_ns)?;
        Ok(slot)
    }

    /// Wait for the last frame that rendered `image_index`, if any.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn wait_for_image<D: GpuDevice>(&self, device: &D, image_index: u32) -> Result<()> {
        let entry = self
            .images_in_flight
            .get(image_index as usize)
            .ok_or_else(|| {
                GpuError::InvalidState(format!(
                    "image index {image_index} out of range for {} images",
                    self.images_in_flight.len()
                ))
            })?;
        if let Some(fence) = *entry {
            device.wait_for_fences(&[fence], self.timeout_ns)?;
        }
        Ok(())
    }

    /// Reset the current slot's fence so it can be passed to a submission.
    pub fn reset_current_fence<D: GpuDevice>(&self, device: &D) -> Result<vk::Fence> {
        let fence = self.slots[self.current].in_flight;
        device.reset_fences(&[fence])?;
        Ok(fence)
    }

    /// Record that the current slot's submission renders `image_index`.
    pub fn mark_image_in_flight(&mut self, image_index: u32) {
        if let Some(entry) = self.images_in_flight.get_mut(image_index as usize) {
            *entry = Some(self.slots[self.current].in_flight);
        }
    }

    /// Resize the image-in-flight map after the swapchain was rebuilt.
    ///
    /// The device must be idle, so every previous entry is already signaled.
    pub fn resize_images(&mut self, image_count: usize) {
        self.images_in_flight.clear();
        self.images_in_flight.resize(image_count, None);
    }

    pub fn current(&self) -> &FrameSlot {
        &self.slots[self.current]
    }

    pub const fn current_index(&self) -> usize {
        self.current
    }

    pub fn frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    pub fn image_count(&self) -> usize {
        self.images_in_flight.len()
    }

    /// Fence that last rendered `image_index`.
    pub fn image_fence(&self, image_index: u32) -> Option<vk::Fence> {
        self.images_in_flight
            .get(image_index as usize)
            .copied()
            .flatten()
    }

    pub const fn timeout_ns(&self) -> u64 {
        self.timeout_ns
    }

    /// Destroy every slot. The device must be idle.
    pub fn destroy<D: GpuDevice>(&mut self, device: &D) {
        for slot in self.slots.drain(..) {
            slot.destroy(device);
        }
        self.images_in_flight.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{AcquireOutcome, Submission};
    use crate::mock::{MockDevice, MockEvent};

    /// Run one frame the way the renderer does and return the image index.
    fn run_frame(device: &MockDevice, ring: &mut FrameSyncRing) -> u32 {
        let slot = ring.begin_frame(device).unwrap();
        let AcquireOutcome::Acquired { image_index, .. } = device
            .acquire_next_image(slot.image_available, ring.timeout_ns())
            .unwrap()
        else {
            panic!("mock acquire is unscripted");
        };
        ring.wait_for_image(device, image_index).unwrap();
        let fence = ring.reset_current_fence(device).unwrap();
        device
            .queue_submit(&Submission {
                command_buffers: &[],
                wait_semaphores: &[slot.image_available],
                wait_stages: &[vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT],
                signal_semaphores: &[slot.render_finished],
                fence,
            })
            .unwrap();
        ring.mark_image_in_flight(image_index);
        device.present(image_index, slot.render_finished).unwrap();
        image_index
    }

    fn blocking_waits(events: &[MockEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, MockEvent::FenceWait { blocked: true, .. }))
            .count()
    }

    #[test]
    fn five_frames_on_two_slots_block_three_times() {
        let device = MockDevice::new().with_image_count(2);
        let mut ring = FrameSyncRing::new(&device, 2, 2, u64::MAX).unwrap();

        let mut per_frame = Vec::new();
        let mut slots = Vec::new();
        for _ in 0..5 {
            device.clear_events();
            run_frame(&device, &mut ring);
            slots.push(ring.current_index());
            per_frame.push(blocking_waits(&device.events()));
        }

        assert_eq!(slots, vec![0, 1, 0, 1, 0]);
        assert_eq!(per_frame, vec![0, 0, 1, 1, 1]);
    }

    #[test]
    fn never_more_submitted_slots_than_ring_depth() {
        for (depth, images) in [(1, 3), (2, 2), (2, 4), (3, 3), (3, 2)] {
            let device = MockDevice::new().with_image_count(images);
            let mut ring = FrameSyncRing::new(&device, depth, images as usize, u64::MAX).unwrap();
            for _ in 0..20 {
                run_frame(&device, &mut ring);
            }
            assert!(device.max_pending_fences() <= depth);
        }
    }

    #[test]
    fn image_fence_is_waited_before_the_image_is_submitted_again() {
        let device = MockDevice::new().with_image_count(3);
        let mut ring = FrameSyncRing::new(&device, 2, 3, u64::MAX).unwrap();
        let mut last_fence: Vec<Option<vk::Fence>> = vec![None; 3];

        for _ in 0..12 {
            device.clear_events();
            let image = run_frame(&device, &mut ring) as usize;
            let events = device.events();
            let submit_at = events
                .iter()
                .position(|e| matches!(e, MockEvent::Submit { .. }))
                .unwrap();

            if let Some(previous) = last_fence[image] {
                let waited = events[..submit_at].iter().any(|e| {
                    matches!(e, MockEvent::FenceWait { fence, .. } if *fence == previous)
                });
                assert!(waited, "image {image} submitted before its fence was waited");
            }
            last_fence[image] = ring.image_fence(image as u32);
        }
    }

    #[test]
    fn resize_clears_the_image_map() {
        let device = MockDevice::new();
        let mut ring = FrameSyncRing::new(&device, 2, 2, u64::MAX).unwrap();
        run_frame(&device, &mut ring);
        assert!(ring.image_fence(0).is_some());

        ring.resize_images(3);
        assert_eq!(ring.image_count(), 3);
        assert!((0..3).all(|i| ring.image_fence(i).is_none()));
        assert!(ring.wait_for_image(&device, 3).is_err());
    }

    #[test]
    fn fence_that_never_signals_surfaces_a_timeout() {
        let device = MockDevice::new();
        let mut ring = FrameSyncRing::new(&device, 1, 2, 1_000).unwrap();
        ring.begin_frame(&device).unwrap();
        ring.reset_current_fence(&device).unwrap();

        assert!(matches!(ring.begin_frame(&device), Err(GpuError::Timeout)));
    }

    #[test]
    fn zero_depth_is_rejected() {
        let device = MockDevice::new();
        assert!(FrameSyncRing::new(&device, 0, 2, u64::MAX).is_err());
    }

    #[test]
    fn destroy_releases_every_object() {
        let device = MockDevice::new();
        let mut ring = FrameSyncRing::new(&device, 3, 2, u64::MAX).unwrap();
        assert_eq!(device.live_count("fence"), 3);
        assert_eq!(device.live_count("semaphore"), 6);

        ring.destroy(&device);
        assert_eq!(device.live_object_count(), 0);
    }
}
