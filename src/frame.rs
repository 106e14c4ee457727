// Frame scheduling
//
// Drives one frame at a time through wait -> acquire -> update -> record ->
// submit -> present across F slots used round-robin. The GPU side is behind
// `FrameBackend`, so the protocol itself does not depend on Vulkan.

use crate::backend::{AcquireOutcome, PresentOutcome, RecreateOutcome, RenderError, RenderResult};
use std::time::Duration;

/// Per-slot operations the scheduler sequences. Slot indices are always in
/// `0..frames_in_flight`.
pub trait FrameBackend {
    type Scene: ?Sized;

    /// Block until the slot's previous submission has completed. A timeout
    /// must come back as `RenderError::DeviceLost`.
    fn wait_for_slot(&mut self, slot: usize, timeout: Duration) -> RenderResult<()>;

    fn acquire_image(&mut self, slot: usize) -> RenderResult<AcquireOutcome>;

    /// Only called after `wait_for_slot` returned for this slot.
    fn update_uniforms(&mut self, slot: usize, scene: &Self::Scene) -> RenderResult<()>;

    fn record(&mut self, slot: usize, image_index: u32, scene: &Self::Scene) -> RenderResult<()>;

    /// Resets the slot fence and submits in the same step.
    fn submit(&mut self, slot: usize, image_index: u32) -> RenderResult<()>;

    /// Give back a slot whose frame failed after its image was acquired but
    /// before it was submitted. Must leave the slot's acquire semaphore
    /// unsignaled and its fence signaled (or about to be), so the next
    /// `wait_for_slot` and acquire on this slot are valid.
    fn abandon_frame(&mut self, slot: usize) -> RenderResult<()>;

    fn present(&mut self, slot: usize, image_index: u32) -> RenderResult<PresentOutcome>;

    fn set_drawable_size(&mut self, width: u32, height: u32);

    /// Waits for the device to go idle before touching anything.
    fn recreate_swapchain(&mut self) -> RenderResult<RecreateOutcome>;

    fn wait_idle(&mut self) -> RenderResult<()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Acquiring,
    Recording,
    Submitted,
    Presented,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    /// Acquire reported out of date; the swapchain was rebuilt instead.
    OutOfDate,
    /// Drawable has zero area.
    Minimized,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameStatus {
    Presented { slot: usize, image_index: u32 },
    Skipped(SkipReason),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub frames_presented: u64,
    pub frames_skipped: u64,
    pub fence_waits: u64,
    pub recreations: u64,
}

pub struct FrameScheduler<B: FrameBackend> {
    backend: B,
    frames_in_flight: usize,
    fence_timeout: Duration,
    frame_counter: u64,
    slots: Vec<SlotState>,
    needs_recreation: bool,
    stats: FrameStats,
}

impl<B: FrameBackend> FrameScheduler<B> {
    pub fn new(backend: B, frames_in_flight: usize, fence_timeout: Duration) -> RenderResult<Self> {
        if frames_in_flight == 0 {
            return Err(RenderError::InvalidRequest("frames in flight must be at least 1".into()));
        }
        if fence_timeout.is_zero() {
            return Err(RenderError::InvalidRequest("fence timeout must be non-zero".into()));
        }
        Ok(Self {
            backend,
            frames_in_flight,
            fence_timeout,
            frame_counter: 0,
            slots: vec![SlotState::Idle; frames_in_flight],
            needs_recreation: false,
            stats: FrameStats::default(),
        })
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frames_in_flight
    }

    pub fn fence_timeout(&self) -> Duration {
        self.fence_timeout
    }

    pub fn frame_counter(&self) -> u64 {
        self.frame_counter
    }

    pub fn stats(&self) -> FrameStats {
        self.stats
    }

    pub fn slot_state(&self, slot: usize) -> Option<SlotState> {
        self.slots.get(slot).copied()
    }

    pub fn needs_recreation(&self) -> bool {
        self.needs_recreation
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Record the new drawable size. The swapchain is rebuilt after the
    /// current frame, or at the start of the next one.
    pub fn notify_resized(&mut self, width: u32, height: u32) {
        log::debug!("Resize to {}x{} pending", width, height);
        self.backend.set_drawable_size(width, height);
        self.needs_recreation = true;
    }

    pub fn render_frame(&mut self, scene: &B::Scene) -> RenderResult<FrameStatus> {
        if self.needs_recreation && self.recreate()? == RecreateOutcome::Deferred {
            self.stats.frames_skipped += 1;
            return Ok(FrameStatus::Skipped(SkipReason::Minimized));
        }

        let slot = (self.frame_counter % self.frames_in_flight as u64) as usize;

        self.backend.wait_for_slot(slot, self.fence_timeout)?;
        self.stats.fence_waits += 1;
        self.slots[slot] = SlotState::Acquiring;

        let image_index = match self.backend.acquire_image(slot)? {
            AcquireOutcome::Acquired { image_index, suboptimal } => {
                if suboptimal {
                    self.needs_recreation = true;
                }
                image_index
            }
            AcquireOutcome::OutOfDate => {
                // Nothing was submitted, so the slot fence is still signaled.
                self.slots[slot] = SlotState::Idle;
                self.needs_recreation = true;
                self.stats.frames_skipped += 1;
                let reason = match self.recreate()? {
                    RecreateOutcome::Recreated => SkipReason::OutOfDate,
                    RecreateOutcome::Deferred => SkipReason::Minimized,
                };
                return Ok(FrameStatus::Skipped(reason));
            }
        };

        self.slots[slot] = SlotState::Recording;
        if let Err(e) = self.record_and_submit(slot, image_index, scene) {
            return Err(self.abandon(slot, e));
        }
        self.slots[slot] = SlotState::Submitted;

        // The submission is in flight from here on, so the slot advances
        // even when present fails.
        self.frame_counter += 1;
        let presented = match self.backend.present(slot, image_index) {
            Ok(presented) => presented,
            Err(e) => {
                self.needs_recreation = true;
                return Err(e);
            }
        };
        self.slots[slot] = SlotState::Presented;
        self.stats.frames_presented += 1;

        if presented.needs_recreation() {
            log::debug!("Present returned {:?}, rebuilding swapchain", presented);
            self.needs_recreation = true;
        }
        if self.needs_recreation {
            self.recreate()?;
        }

        Ok(FrameStatus::Presented { slot, image_index })
    }

    /// Wait for all submitted work, leaving every slot idle. Every wait is
    /// bounded by the fence timeout; a slot that never completes comes back
    /// as `DeviceLost` and the device is not waited on further.
    pub fn shutdown(&mut self) -> RenderResult<()> {
        for slot in 0..self.frames_in_flight {
            self.backend.wait_for_slot(slot, self.fence_timeout)?;
            self.slots[slot] = SlotState::Idle;
        }
        self.backend.wait_idle()
    }

    pub fn into_backend(self) -> B {
        self.backend
    }

    fn record_and_submit(&mut self, slot: usize, image_index: u32, scene: &B::Scene) -> RenderResult<()> {
        self.backend.update_uniforms(slot, scene)?;
        self.backend.record(slot, image_index, scene)?;
        self.backend.submit(slot, image_index)
    }

    /// The acquired image is never presented, so the swapchain is rebuilt
    /// before the next frame to release it.
    fn abandon(&mut self, slot: usize, cause: RenderError) -> RenderError {
        log::warn!("Abandoning frame on slot {}: {}", slot, cause);
        self.needs_recreation = true;
        match self.backend.abandon_frame(slot) {
            Ok(()) => {
                self.slots[slot] = SlotState::Submitted;
                cause
            }
            Err(e) => RenderError::DeviceLost(format!("frame slot {slot} left unusable: {e}")),
        }
    }

    fn recreate(&mut self) -> RenderResult<RecreateOutcome> {
        let outcome = self.backend.recreate_swapchain()?;
        match outcome {
            RecreateOutcome::Recreated => {
                self.needs_recreation = false;
                self.stats.recreations += 1;
                // recreate_swapchain waited for idle.
                self.slots.fill(SlotState::Idle);
            }
            RecreateOutcome::Deferred => {
                log::trace!("Swapchain recreation deferred");
                self.needs_recreation = true;
            }
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    enum Event {
        Wait(usize),
        Acquire(usize),
        Uniforms(usize),
        Record(usize, u32),
        Submit(usize),
        Abandon(usize),
        Present(usize, u32),
        Recreate,
        Idle,
    }

    /// A GPU that never finishes work on its own: a submission only
    /// completes when the CPU waits on its slot.
    struct SlowGpu {
        image_count: u32,
        next_image: u32,
        extent: (u32, u32),
        pending: Vec<bool>,
        /// Acquire semaphore of each slot has a signal nobody waited on.
        acquired: Vec<bool>,
        acquires_on_signaled: usize,
        max_outstanding: usize,
        hung: bool,
        fail_next_record: bool,
        fail_next_present: bool,
        fail_abandon: bool,
        acquire_script: VecDeque<AcquireOutcome>,
        present_script: VecDeque<PresentOutcome>,
        events: Vec<Event>,
        recorded: Vec<(u32, (u32, u32), u32)>,
    }

    impl SlowGpu {
        fn new(frames_in_flight: usize, image_count: u32) -> Self {
            Self {
                image_count,
                next_image: 0,
                extent: (800, 600),
                pending: vec![false; frames_in_flight],
                acquired: vec![false; frames_in_flight],
                acquires_on_signaled: 0,
                max_outstanding: 0,
                hung: false,
                fail_next_record: false,
                fail_next_present: false,
                fail_abandon: false,
                acquire_script: VecDeque::new(),
                present_script: VecDeque::new(),
                events: Vec::new(),
                recorded: Vec::new(),
            }
        }

        fn outstanding(&self) -> usize {
            self.pending.iter().filter(|p| **p).count()
        }

        fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
            self.events.iter().filter(|e| pred(e)).count()
        }
    }

    impl FrameBackend for SlowGpu {
        type Scene = u32;

        fn wait_for_slot(&mut self, slot: usize, timeout: Duration) -> RenderResult<()> {
            self.events.push(Event::Wait(slot));
            if self.hung && self.pending[slot] {
                return Err(RenderError::DeviceLost(format!("fence wait exceeded {timeout:?}")));
            }
            self.pending[slot] = false;
            Ok(())
        }

        fn acquire_image(&mut self, slot: usize) -> RenderResult<AcquireOutcome> {
            self.events.push(Event::Acquire(slot));
            let outcome = self.acquire_script.pop_front().unwrap_or_else(|| {
                let image_index = self.next_image;
                self.next_image = (self.next_image + 1) % self.image_count;
                AcquireOutcome::Acquired {
                    image_index,
                    suboptimal: false,
                }
            });
            if matches!(outcome, AcquireOutcome::Acquired { .. }) {
                if self.acquired[slot] {
                    self.acquires_on_signaled += 1;
                }
                self.acquired[slot] = true;
            }
            Ok(outcome)
        }

        fn update_uniforms(&mut self, slot: usize, _scene: &u32) -> RenderResult<()> {
            assert!(!self.pending[slot], "uniforms written while slot {slot} is in flight");
            self.events.push(Event::Uniforms(slot));
            Ok(())
        }

        fn record(&mut self, slot: usize, image_index: u32, scene: &u32) -> RenderResult<()> {
            assert!(!self.pending[slot], "command buffer reused while in flight");
            if std::mem::take(&mut self.fail_next_record) {
                return Err(RenderError::OutOfDeviceMemory("recording".into()));
            }
            self.events.push(Event::Record(slot, image_index));
            self.recorded.push((image_index, self.extent, *scene));
            Ok(())
        }

        fn submit(&mut self, slot: usize, _image_index: u32) -> RenderResult<()> {
            self.events.push(Event::Submit(slot));
            self.pending[slot] = true;
            self.acquired[slot] = false;
            self.max_outstanding = self.max_outstanding.max(self.outstanding());
            Ok(())
        }

        fn abandon_frame(&mut self, slot: usize) -> RenderResult<()> {
            self.events.push(Event::Abandon(slot));
            if self.fail_abandon {
                return Err(RenderError::OutOfHostMemory("empty submit".into()));
            }
            self.pending[slot] = true;
            self.acquired[slot] = false;
            Ok(())
        }

        fn present(&mut self, slot: usize, image_index: u32) -> RenderResult<PresentOutcome> {
            self.events.push(Event::Present(slot, image_index));
            if std::mem::take(&mut self.fail_next_present) {
                return Err(RenderError::OutOfHostMemory("presenting".into()));
            }
            Ok(self.present_script.pop_front().unwrap_or(PresentOutcome::Presented))
        }

        fn set_drawable_size(&mut self, width: u32, height: u32) {
            self.extent = (width, height);
        }

        fn recreate_swapchain(&mut self) -> RenderResult<RecreateOutcome> {
            self.wait_idle()?;
            if self.extent.0 == 0 || self.extent.1 == 0 {
                return Ok(RecreateOutcome::Deferred);
            }
            self.events.push(Event::Recreate);
            self.next_image = 0;
            Ok(RecreateOutcome::Recreated)
        }

        fn wait_idle(&mut self) -> RenderResult<()> {
            self.events.push(Event::Idle);
            self.pending.fill(false);
            Ok(())
        }
    }

    fn scheduler(frames_in_flight: usize, image_count: u32) -> FrameScheduler<SlowGpu> {
        FrameScheduler::new(
            SlowGpu::new(frames_in_flight, image_count),
            frames_in_flight,
            Duration::from_secs(1),
        )
        .unwrap()
    }

    #[test]
    fn rejects_zero_frames_in_flight() {
        let result = FrameScheduler::new(SlowGpu::new(1, 3), 0, Duration::from_secs(1));
        assert!(matches!(result, Err(RenderError::InvalidRequest(_))));
    }

    #[test]
    fn never_more_than_f_submissions_outstanding() {
        for frames_in_flight in 1..=3 {
            let mut frames = scheduler(frames_in_flight, 3);
            for i in 0..50 {
                frames.render_frame(&i).unwrap();
                assert!(frames.backend().outstanding() <= frames_in_flight);
            }
            assert_eq!(frames.backend().max_outstanding, frames_in_flight);
        }
    }

    #[test]
    fn hundred_frames_present_hundred_times_with_one_wait_each() {
        let mut frames = scheduler(2, 3);
        for i in 0..100 {
            let status = frames.render_frame(&i).unwrap();
            assert!(matches!(status, FrameStatus::Presented { slot, .. } if slot == (i as usize) % 2));
        }

        let gpu = frames.backend();
        assert_eq!(gpu.count(|e| matches!(e, Event::Present(..))), 100);
        assert_eq!(gpu.count(|e| matches!(e, Event::Wait(_))), 100);
        assert_eq!(frames.stats().frames_presented, 100);
        assert_eq!(frames.frame_counter(), 100);

        // Each frame is exactly: wait on the reused slot, then acquire, then
        // update, record, submit and present on that same slot.
        for (frame, chunk) in gpu.events.chunks(6).enumerate() {
            let slot = frame % 2;
            assert_eq!(chunk[0], Event::Wait(slot));
            assert_eq!(chunk[1], Event::Acquire(slot));
            assert_eq!(chunk[2], Event::Uniforms(slot));
            assert!(matches!(chunk[3], Event::Record(s, _) if s == slot));
            assert_eq!(chunk[4], Event::Submit(slot));
            assert!(matches!(chunk[5], Event::Present(s, _) if s == slot));
        }
    }

    #[test]
    fn out_of_date_acquire_recreates_and_submits_nothing() {
        let mut frames = scheduler(2, 3);
        frames.render_frame(&0).unwrap();
        frames.backend_mut().acquire_script.push_back(AcquireOutcome::OutOfDate);

        let submits_before = frames.backend().count(|e| matches!(e, Event::Submit(_)));
        let status = frames.render_frame(&1).unwrap();

        assert_eq!(status, FrameStatus::Skipped(SkipReason::OutOfDate));
        let gpu = frames.backend();
        assert_eq!(gpu.count(|e| matches!(e, Event::Submit(_))), submits_before);
        assert_eq!(gpu.count(|e| *e == Event::Recreate), 1);
        assert_eq!(frames.frame_counter(), 1);
        assert_eq!(frames.slot_state(1), Some(SlotState::Idle));

        // The retried frame reuses the same slot.
        let status = frames.render_frame(&1).unwrap();
        assert!(matches!(status, FrameStatus::Presented { slot: 1, .. }));
    }

    #[test]
    fn suboptimal_present_recreates_after_the_frame() {
        let mut frames = scheduler(2, 3);
        frames.backend_mut().present_script.push_back(PresentOutcome::Suboptimal);

        let status = frames.render_frame(&0).unwrap();
        assert!(matches!(status, FrameStatus::Presented { .. }));

        let events = &frames.backend().events;
        let present = events.iter().position(|e| matches!(e, Event::Present(..))).unwrap();
        let recreate = events.iter().position(|e| *e == Event::Recreate).unwrap();
        assert!(recreate > present);
        assert!(!frames.needs_recreation());
        assert_eq!(frames.stats().recreations, 1);
    }

    #[test]
    fn suboptimal_acquire_still_presents() {
        let mut frames = scheduler(2, 3);
        frames.backend_mut().acquire_script.push_back(AcquireOutcome::Acquired {
            image_index: 2,
            suboptimal: true,
        });
        let status = frames.render_frame(&0).unwrap();
        assert_eq!(status, FrameStatus::Presented { slot: 0, image_index: 2 });
        assert_eq!(frames.stats().recreations, 1);
    }

    #[test]
    fn minimized_window_defers_until_restored() {
        let mut frames = scheduler(2, 3);
        frames.render_frame(&0).unwrap();
        frames.notify_resized(0, 0);

        for i in 1..5 {
            assert_eq!(
                frames.render_frame(&i).unwrap(),
                FrameStatus::Skipped(SkipReason::Minimized)
            );
        }
        assert!(frames.needs_recreation());
        assert_eq!(frames.backend().count(|e| *e == Event::Recreate), 0);

        frames.notify_resized(1024, 768);
        assert!(matches!(frames.render_frame(&5).unwrap(), FrameStatus::Presented { .. }));
        assert_eq!(frames.backend().count(|e| *e == Event::Recreate), 1);
        assert_eq!(frames.stats().frames_skipped, 4);
    }

    #[test]
    fn fence_timeout_is_device_lost() {
        let mut frames = scheduler(2, 3);
        frames.render_frame(&0).unwrap();
        frames.render_frame(&1).unwrap();
        frames.backend_mut().hung = true;

        let err = frames.render_frame(&2).unwrap_err();
        assert!(err.is_device_lost());
        assert!(!err.is_recoverable());
    }

    #[test]
    fn recreation_is_idempotent() {
        let mut frames = scheduler(2, 3);
        for i in 0..3 {
            frames.render_frame(&i).unwrap();
        }
        let before = frames.backend().recorded.clone();

        for _ in 0..5 {
            frames.notify_resized(800, 600);
            frames.backend_mut().recorded.clear();
            for i in 0..3 {
                frames.render_frame(&i).unwrap();
            }
            assert_eq!(frames.backend().recorded, before);
        }
        assert_eq!(frames.stats().recreations, 5);
    }

    #[test]
    fn shutdown_waits_for_idle() {
        let mut frames = scheduler(2, 3);
        frames.render_frame(&0).unwrap();
        frames.shutdown().unwrap();
        assert_eq!(frames.backend().outstanding(), 0);
        assert_eq!(frames.slot_state(0), Some(SlotState::Idle));
        assert_eq!(frames.backend().events.last(), Some(&Event::Idle));
    }

    #[test]
    fn failed_record_hands_back_a_clean_slot() {
        let mut frames = scheduler(2, 3);
        frames.render_frame(&0).unwrap();
        frames.backend_mut().fail_next_record = true;

        let err = frames.render_frame(&1).unwrap_err();
        assert!(matches!(err, RenderError::OutOfDeviceMemory(_)));
        assert!(frames.needs_recreation());
        assert_eq!(frames.frame_counter(), 1);
        assert_eq!(frames.slot_state(1), Some(SlotState::Submitted));
        assert_eq!(frames.backend().count(|e| *e == Event::Abandon(1)), 1);

        for i in 1..6 {
            assert!(matches!(frames.render_frame(&i).unwrap(), FrameStatus::Presented { .. }));
        }
        let gpu = frames.backend();
        assert_eq!(gpu.acquires_on_signaled, 0);
        assert_eq!(gpu.count(|e| matches!(e, Event::Abandon(_))), 1);
        assert_eq!(frames.stats().recreations, 1);
    }

    #[test]
    fn failed_abandon_is_device_lost() {
        let mut frames = scheduler(2, 3);
        frames.backend_mut().fail_next_record = true;
        frames.backend_mut().fail_abandon = true;

        let err = frames.render_frame(&0).unwrap_err();
        assert!(err.is_device_lost());
        assert!(!err.is_recoverable());
    }

    #[test]
    fn failed_present_still_advances_the_slot() {
        let mut frames = scheduler(2, 3);
        frames.backend_mut().fail_next_present = true;

        assert!(frames.render_frame(&0).is_err());
        assert_eq!(frames.frame_counter(), 1);
        assert!(frames.needs_recreation());
        assert_eq!(frames.slot_state(0), Some(SlotState::Submitted));

        let status = frames.render_frame(&1).unwrap();
        assert!(matches!(status, FrameStatus::Presented { slot: 1, .. }));
        assert_eq!(frames.backend().acquires_on_signaled, 0);
    }

    #[test]
    fn shutdown_on_hung_gpu_is_bounded() {
        let mut frames = scheduler(2, 3);
        frames.render_frame(&0).unwrap();
        frames.backend_mut().hung = true;

        let err = frames.shutdown().unwrap_err();
        assert!(err.is_device_lost());
        assert_eq!(frames.backend().count(|e| *e == Event::Idle), 0);
    }
}
