//! Per-frame sequencing of compute, draw and present across frames in flight.
//!
//! ## Slot protocol
//!
//! Each frame runs on slot `i = frame mod N` and goes through:
//!
//! 1. admission: wait on slot `i`'s graphics fence. This is the only
//!    backpressure; a slow GPU stalls the host here.
//! 2. dispatch: reset the compute fence, submit the brick expansion,
//!    signal `compute_finished[i]`.
//! 3. wait on the compute fence.
//! 4. acquire a swap image. Out of date means no draw and no present.
//! 5. reset the graphics fence, submit the draw waiting on
//!    `compute_finished[i]` (vertex input) and `image_available[i]`
//!    (color output), signal `render_finished[i]` and the graphics fence.
//! 6. present waiting on `render_finished[i]`.
//! 7. advance to the next slot.
//!
//! On the host path (CPU fallback) steps 2 and 3 are skipped and the host
//! writes the slot's mapped particles after step 1 instead; the draw then
//! only waits on `image_available[i]`.
//!
//! ## Slot states
//!
//! `Idle -> ComputeQueued -> ComputeDone -> GraphicsQueued -> Presented -> Idle`

use std::time::Duration;

use bevy::log::{debug, trace};

use crate::gpu::backend::{
    AcquireStatus, Backend, ComputeJob, DrawJob, PresentStatus, SemaphoreWait, WaitStage,
};
use crate::gpu::buffers::FrameResources;
use crate::gpu::error::{FatalError, FrameStatus};
use crate::gpu::pipeline::Pipelines;
use crate::gpu::swap::SwapChain;

pub const FRAMES_IN_FLIGHT: usize = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    ComputeQueued,
    ComputeDone,
    GraphicsQueued,
    Presented,
}

/// Where this frame's particle records come from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParticlePath {
    Device,
    Host,
}

/// Host work that runs once the slot is free: field updates and, on the host
/// path, writing the slot's particle records.
pub trait HostStage<B: Backend> {
    fn prepare(
        &mut self,
        slot: usize,
        resources: &FrameResources<B>,
    ) -> Result<ParticlePath, FatalError>;
}

pub struct FrameSlot<B: Backend> {
    render_finished: B::Semaphore,
    image_available: B::Semaphore,
    compute_finished: B::Semaphore,
    graphics_fence: B::Fence,
    compute_fence: B::Fence,
    state: SlotState,
}

impl<B: Backend> FrameSlot<B> {
    fn new(backend: &B) -> Result<Self, FatalError> {
        Ok(Self {
            render_finished: backend.create_semaphore()?,
            image_available: backend.create_semaphore()?,
            compute_finished: backend.create_semaphore()?,
            // signaled so the first admission wait returns immediately
            graphics_fence: backend.create_fence(true)?,
            compute_fence: backend.create_fence(true)?,
            state: SlotState::Idle,
        })
    }

    pub fn graphics_fence(&self) -> &B::Fence {
        &self.graphics_fence
    }

    pub fn compute_fence(&self) -> &B::Fence {
        &self.compute_fence
    }

    pub fn state(&self) -> SlotState {
        self.state
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub frames: u64,
    pub presented: u64,
    pub skipped: u64,
    pub recreate_requests: u64,
    pub dispatches: u64,
    pub host_updates: u64,
}

#[derive(Clone, Copy, Debug)]
pub struct FrameTimeouts {
    pub fence: Duration,
    pub acquire: Duration,
}

pub struct FrameOrchestrator<B: Backend> {
    slots: Vec<FrameSlot<B>>,
    current: usize,
    timeouts: FrameTimeouts,
    clear_color: [f32; 4],
    stats: FrameStats,
}

impl<B: Backend> FrameOrchestrator<B> {
    pub fn new(
        backend: &B,
        frames: usize,
        timeouts: FrameTimeouts,
        clear_color: [f32; 4],
    ) -> Result<Self, FatalError> {
        if frames == 0 {
            return Err(FatalError::InvalidConfig("frames_in_flight must be at least 1".to_string()));
        }
        let slots = (0..frames)
            .map(|_| FrameSlot::new(backend))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            slots,
            current: 0,
            timeouts,
            clear_color,
            stats: FrameStats::default(),
        })
    }

    pub fn frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    pub fn current_slot(&self) -> usize {
        self.current
    }

    pub fn slot(&self, index: usize) -> &FrameSlot<B> {
        &self.slots[index]
    }

    pub fn slot_state(&self, index: usize) -> SlotState {
        self.slots[index].state
    }

    pub fn stats(&self) -> FrameStats {
        self.stats
    }

    pub fn run_frame(
        &mut self,
        backend: &B,
        resources: &FrameResources<B>,
        pipelines: &Pipelines<B>,
        swap: &mut SwapChain<B>,
        host: &mut impl HostStage<B>,
    ) -> Result<FrameStatus, FatalError> {
        let i = self.current;
        self.stats.frames += 1;

        // 1. admission
        backend.wait_fence(&self.slots[i].graphics_fence, self.timeouts.fence)?;
        self.slots[i].state = SlotState::Idle;

        let path = host.prepare(i, resources)?;
        let dispatched = match path {
            ParticlePath::Device => {
                self.dispatch(backend, resources, pipelines, i)?;
                true
            }
            ParticlePath::Host => {
                self.stats.host_updates += 1;
                false
            }
        };

        // 4. acquire
        let acquired = swap.acquire_next_image(
            backend,
            self.timeouts.acquire,
            &self.slots[i].image_available,
        )?;
        let (image, suboptimal) = match acquired {
            AcquireStatus::Acquired { image, suboptimal } => (image, suboptimal),
            AcquireStatus::OutOfDate => {
                debug!("frame: slot {i} acquire out of date, skipping draw");
                self.abandon(backend, i, dispatched)?;
                self.stats.recreate_requests += 1;
                return Ok(FrameStatus::NeedsRecreate);
            }
            AcquireStatus::Timeout => {
                debug!("frame: slot {i} acquire timed out, skipping draw");
                self.abandon(backend, i, dispatched)?;
                return Ok(FrameStatus::Skip);
            }
        };

        // 5. draw
        resources.flush_draw_inputs(backend, i, !dispatched)?;
        let target = swap.target().ok_or_else(|| {
            FatalError::InvariantViolation("acquired an image without a swap target".to_string())
        })?;
        let slot = &mut self.slots[i];
        backend.reset_fence(&mut slot.graphics_fence)?;

        let mut waits = Vec::with_capacity(2);
        if dispatched {
            waits.push(SemaphoreWait {
                semaphore: &slot.compute_finished,
                stage: WaitStage::VertexInput,
            });
        }
        waits.push(SemaphoreWait {
            semaphore: &slot.image_available,
            stage: WaitStage::ColorAttachmentOutput,
        });

        let uniforms = [resources.transform_buffer(i)];
        let job = DrawJob {
            pipeline: pipelines.graphics_pipeline(),
            bind_group: pipelines.draw_bind_group(i),
            uniforms: &uniforms,
            vertex_buffer: resources.particle_buffer(i),
            vertex_count: resources.layout().records() as u32,
            target,
            image,
            clear_color: self.clear_color,
        };
        backend.submit_draw(&job, &waits, &slot.render_finished, &mut slot.graphics_fence)?;
        slot.state = SlotState::GraphicsQueued;

        // 6. present
        let presented = swap.present(backend, image, &slot.render_finished)?;
        slot.state = SlotState::Presented;
        self.stats.presented += 1;

        let resized = swap.take_resized();
        let status = if suboptimal || resized || presented != PresentStatus::Presented {
            swap.mark_stale();
            self.stats.recreate_requests += 1;
            FrameStatus::NeedsRecreate
        } else {
            FrameStatus::Ok
        };
        trace!("frame: slot {i} image {image} -> {status:?}");

        // 7. advance
        self.advance();
        Ok(status)
    }

    // steps 2 and 3
    fn dispatch(
        &mut self,
        backend: &B,
        resources: &FrameResources<B>,
        pipelines: &Pipelines<B>,
        i: usize,
    ) -> Result<(), FatalError> {
        resources.flush_compute_inputs(backend, i)?;

        let slot = &mut self.slots[i];
        backend.reset_fence(&mut slot.compute_fence)?;

        let reads = [resources.compute_buffer(i), resources.field_buffer()];
        let writes = [resources.particle_buffer(i)];
        let job = ComputeJob {
            pipeline: pipelines.compute_pipeline(),
            bind_group: pipelines.compute_bind_group(i),
            workgroups: pipelines.workgroups(),
            reads: &reads,
            writes: &writes,
        };
        backend.submit_compute(&job, &slot.compute_finished, &mut slot.compute_fence)?;
        slot.state = SlotState::ComputeQueued;

        backend.wait_fence(&slot.compute_fence, self.timeouts.fence)?;
        slot.state = SlotState::ComputeDone;
        self.stats.dispatches += 1;
        Ok(())
    }

    /// Drops the frame after step 4. The graphics fence was never reset, so
    /// the slot stays admissible; a signaled compute semaphore is consumed.
    fn abandon(&mut self, backend: &B, i: usize, dispatched: bool) -> Result<(), FatalError> {
        if dispatched {
            backend.drain_semaphore(&self.slots[i].compute_finished)?;
        }
        self.slots[i].state = SlotState::Idle;
        self.stats.skipped += 1;
        self.advance();
        Ok(())
    }

    fn advance(&mut self) {
        self.current = (self.current + 1) % self.slots.len();
    }

    /// Blocks until every slot's last draw has retired.
    pub fn wait_all(&mut self, backend: &B) -> Result<(), FatalError> {
        for slot in &mut self.slots {
            backend.wait_fence(&slot.graphics_fence, self.timeouts.fence)?;
            slot.state = SlotState::Idle;
        }
        Ok(())
    }
}
