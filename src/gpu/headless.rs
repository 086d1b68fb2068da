//! A software device implementing [`Backend`] without any GPU.
//!
//! Submissions are queued and only start once every semaphore they wait on
//! has been signaled. Started work then advances in small steps, several
//! submissions at a time, so a compute dispatch and a draw that are not
//! ordered by a semaphore really do overlap. Host calls advance the device a
//! little, fence waits advance it until the fence signals.
//!
//! ## What gets checked
//!
//! - binary semaphore rules: no double signal, no wait without a pending signal
//! - fence rules: no reset while pending, no submit with a signaled fence
//! - torn reads: a draw executing while a compute write to its vertex buffer
//!   is only partly done
//! - host-write hazards: flushing or uploading a buffer that queued work uses
//! - lifetimes: destroying buffers, fences or swap images still in use
//!
//! Findings land in [`HeadlessReport`]; none of them are returned as errors,
//! so tests can assert on them after the fact.

use std::ops::Range;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bevy::log::warn;
use bytemuck::Pod;

use crate::cpu::bricks::{self, EXPANSION};
use crate::gpu::backend::{
    AcquireStatus, Backend, BindEntry, BindingKind, BufferDesc, ComputeJob, ComputePipelineDesc,
    DrawJob, GraphicsPipelineDesc, LayoutEntry, PresentStatus, SemaphoreWait, ShaderStage,
};
use crate::gpu::buffers::HostMemory;
use crate::gpu::device::{
    DeviceFeatures, DeviceKind, DeviceRequirements, DeviceSelection, PhysicalDeviceInfo,
    QueueFamilyInfo, QueueFlags, SWAPCHAIN_EXTENSION, VALIDATION_LAYER, select_physical_device,
};
use crate::gpu::error::FatalError;
use crate::gpu::ffi::{ComputeUniforms, Particle};
use crate::gpu::shaders::{check_interface, validate_wgsl};
use crate::gpu::swap::{
    ColorSpace, DepthFormat, Extent, PixelFormat, PresentMode, SurfaceCapabilities, SurfaceFormat,
    SurfaceSupport, SwapConfig,
};

/// Expands `cells` of the field into `out` (`cells.len() * EXPANSION` records).
pub type ComputeKernel = fn(&ComputeUniforms, &[f32], Range<usize>, &mut [Particle]);

#[derive(Clone, Debug)]
pub struct HeadlessConfig {
    pub adapters: Vec<PhysicalDeviceInfo>,
    pub instance_layers: Vec<String>,
    pub window: Extent,
    /// Report the window size as the surface's current extent.
    pub report_current_extent: bool,
    /// Steps a dispatch takes to retire.
    pub compute_steps: u32,
    /// Device steps taken on every submit/acquire/present/flush.
    pub background_steps: u32,
    pub kernel: ComputeKernel,
}

impl Default for HeadlessConfig {
    fn default() -> Self {
        Self {
            adapters: vec![reference_adapter("headless reference device", DeviceKind::Discrete)],
            instance_layers: vec![VALIDATION_LAYER.to_string()],
            window: Extent::new(1280, 720),
            report_current_extent: true,
            compute_steps: 4,
            background_steps: 1,
            kernel: bricks::expand_range,
        }
    }
}

pub fn reference_surface() -> SurfaceSupport {
    SurfaceSupport {
        capabilities: SurfaceCapabilities {
            current_extent: None,
            min_extent: Extent::new(1, 1),
            max_extent: Extent::new(8192, 8192),
            min_image_count: 2,
            max_image_count: 3,
        },
        formats: vec![
            SurfaceFormat {
                format: PixelFormat::Rgba8UnormSrgb,
                color_space: ColorSpace::SrgbNonLinear,
            },
            SurfaceFormat {
                format: PixelFormat::Bgra8UnormSrgb,
                color_space: ColorSpace::SrgbNonLinear,
            },
        ],
        present_modes: vec![PresentMode::Fifo, PresentMode::Mailbox],
        depth_formats: vec![DepthFormat::Depth32Float, DepthFormat::Depth24PlusStencil8],
    }
}

pub fn reference_adapter(name: &str, kind: DeviceKind) -> PhysicalDeviceInfo {
    PhysicalDeviceInfo {
        name: name.to_string(),
        kind,
        queue_families: vec![QueueFamilyInfo {
            flags: QueueFlags::GRAPHICS | QueueFlags::COMPUTE | QueueFlags::TRANSFER,
            queue_count: 1,
            present: true,
        }],
        features: DeviceFeatures {
            geometry_shader: true,
            fill_mode_non_solid: true,
            wide_lines: true,
            large_points: true,
        },
        extensions: vec![SWAPCHAIN_EXTENSION.to_string()],
        surface: reference_surface(),
    }
}

// ====================== report =======================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FenceEventKind {
    Created { signaled: bool },
    Reset,
    Submitted,
    Signaled,
    WaitReturned,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FenceEvent {
    pub at: u64,
    pub kind: FenceEventKind,
}

/// Last producer of a buffer's device contents.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteTag {
    Upload,
    Host,
    Compute { submission: u64 },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ComputeRecord {
    pub submission: u64,
    pub target: usize,
    pub finished_at: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DrawRecord {
    pub submission: u64,
    pub vertex_buffer: usize,
    pub observed: Option<WriteTag>,
    pub visible: usize,
    pub torn: bool,
    pub executed_at: u64,
}

#[derive(Clone, Debug, Default)]
pub struct HeadlessReport {
    pub torn_reads: u64,
    pub hazards: Vec<String>,
    pub violations: Vec<String>,
    pub presented: u64,
    pub uploads: u64,
    pub swap_builds: u64,
    pub computes: Vec<ComputeRecord>,
    pub draws: Vec<DrawRecord>,
}

impl HeadlessReport {
    pub fn is_clean(&self) -> bool {
        self.torn_reads == 0 && self.hazards.is_empty() && self.violations.is_empty()
    }
}

// ====================== device state =================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ImageState {
    Available,
    Acquired,
    // presented, but the compositor has not handed it back
    Held,
}

struct SwapRecord {
    generation: u64,
    extent: Extent,
    images: Vec<ImageState>,
    next: usize,
}

struct FenceRecord {
    signaled: bool,
    pending: bool,
    history: Vec<FenceEvent>,
}

#[derive(Default)]
struct SemaphoreRecord {
    signaled: bool,
    pending_signal: bool,
}

struct BufferRecord {
    label: String,
    device: Vec<u8>,
    shadow: Option<HostMemory>,
    users: u32,
    writer: Option<u64>,
    last_write: Option<WriteTag>,
}

enum Work {
    Compute {
        uniforms: ComputeUniforms,
        field: usize,
        out: usize,
        total: usize,
        cursor: usize,
        chunk: usize,
    },
    Draw {
        vertex_buffer: usize,
        generation: u64,
    },
    Present {
        image: usize,
        generation: u64,
    },
    Drain,
}

struct Submission {
    id: u64,
    waits: Vec<usize>,
    signals: Vec<usize>,
    fence: Option<usize>,
    buffers: Vec<usize>,
    started: bool,
    done: bool,
    work: Work,
}

struct DeviceState {
    clock: u64,
    window: Extent,
    hold_presented: bool,
    fences: Vec<FenceRecord>,
    semaphores: Vec<SemaphoreRecord>,
    buffers: Vec<BufferRecord>,
    queue: Vec<Submission>,
    next_submission: u64,
    swap: Option<SwapRecord>,
    swap_generation: u64,
    kernel: ComputeKernel,
    report: HeadlessReport,
}

impl DeviceState {
    fn violation(&mut self, message: String) {
        warn!("headless: {message}");
        self.report.violations.push(message);
    }

    fn hazard(&mut self, message: String) {
        warn!("headless: {message}");
        self.report.hazards.push(message);
    }

    fn fence_event(&mut self, fence: usize, kind: FenceEventKind) {
        self.clock += 1;
        let at = self.clock;
        self.fences[fence].history.push(FenceEvent { at, kind });
    }

    fn enqueue(
        &mut self,
        waits: Vec<usize>,
        signals: Vec<usize>,
        fence: Option<usize>,
        buffers: Vec<usize>,
        work: Work,
    ) -> u64 {
        for w in &waits {
            let sem = &self.semaphores[*w];
            if !sem.signaled && !sem.pending_signal {
                self.violation(format!("wait on semaphore {w} with no pending signal"));
            }
        }
        for s in &signals {
            if self.semaphores[*s].pending_signal || self.semaphores[*s].signaled {
                self.violation(format!("semaphore {s} signaled again before being waited on"));
            }
            self.semaphores[*s].pending_signal = true;
        }
        if let Some(f) = fence {
            if self.fences[f].signaled || self.fences[f].pending {
                self.violation(format!("submission with fence {f} that was not reset"));
            }
            self.fences[f].pending = true;
            self.fence_event(f, FenceEventKind::Submitted);
        }
        for b in &buffers {
            self.buffers[*b].users += 1;
        }

        let id = self.next_submission;
        self.next_submission += 1;
        self.queue.push(Submission {
            id,
            waits,
            signals,
            fence,
            buffers,
            started: false,
            done: false,
            work,
        });
        id
    }

    /// One unit of device progress. Returns false when nothing could move.
    fn step(&mut self) -> bool {
        let mut queue = std::mem::take(&mut self.queue);
        let mut progressed = false;

        for sub in queue.iter_mut().filter(|s| !s.started) {
            if sub.waits.iter().all(|w| self.semaphores[*w].signaled) {
                for w in &sub.waits {
                    self.semaphores[*w].signaled = false;
                }
                sub.started = true;
            }
        }

        for sub in queue.iter_mut().filter(|s| s.started) {
            progressed = true;
            sub.done = self.execute(sub.id, &mut sub.work);
        }

        let (done, pending): (Vec<_>, Vec<_>) = queue.into_iter().partition(|s| s.done);
        // work enqueued during this step cannot exist, but keep ordering stable
        self.queue = pending;
        for sub in done {
            self.retire(sub);
        }
        self.clock += 1;
        progressed
    }

    fn execute(&mut self, id: u64, work: &mut Work) -> bool {
        match work {
            Work::Compute {
                uniforms,
                field,
                out,
                total,
                cursor,
                chunk,
            } => {
                if *cursor == 0 {
                    self.buffers[*out].writer = Some(id);
                }
                let end = (*cursor + *chunk).min(*total);
                self.run_kernel(uniforms, *field, *out, *cursor..end);
                *cursor = end;
                if end < *total {
                    return false;
                }
                self.buffers[*out].writer = None;
                self.buffers[*out].last_write = Some(WriteTag::Compute { submission: id });
                self.report.computes.push(ComputeRecord {
                    submission: id,
                    target: *out,
                    finished_at: self.clock,
                });
                true
            }
            Work::Draw {
                vertex_buffer,
                generation,
            } => {
                if self.swap.as_ref().map(|s| s.generation) != Some(*generation) {
                    self.violation(format!("draw {id} into a destroyed swap image"));
                }
                let record = &self.buffers[*vertex_buffer];
                let torn = record.writer.is_some();
                let visible = record
                    .device
                    .chunks_exact(std::mem::size_of::<Particle>())
                    .filter(|bytes| !bytemuck::pod_read_unaligned::<Particle>(bytes).is_parked())
                    .count();
                let observed = record.last_write;
                if torn {
                    self.report.torn_reads += 1;
                    warn!("headless: draw {id} read a half-written `{}`", record.label);
                }
                self.report.draws.push(DrawRecord {
                    submission: id,
                    vertex_buffer: *vertex_buffer,
                    observed,
                    visible,
                    torn,
                    executed_at: self.clock,
                });
                true
            }
            Work::Present { image, generation } => {
                match self.swap.as_mut() {
                    Some(swap) if swap.generation == *generation => {
                        swap.images[*image] = if self.hold_presented {
                            ImageState::Held
                        } else {
                            ImageState::Available
                        };
                    }
                    _ => self.violation(format!("present {id} of a destroyed swap image")),
                }
                self.report.presented += 1;
                true
            }
            Work::Drain => true,
        }
    }

    fn run_kernel(&mut self, uniforms: &ComputeUniforms, field: usize, out: usize, cells: Range<usize>) {
        let stride = EXPANSION * std::mem::size_of::<Particle>();
        let bytes = cells.start * stride..cells.end * stride;
        if bytes.end > self.buffers[out].device.len() {
            self.violation(format!(
                "dispatch writes past the end of `{}`",
                self.buffers[out].label
            ));
            return;
        }
        let field: Vec<f32> = bytemuck::pod_collect_to_vec(&self.buffers[field].device);
        let target = &mut self.buffers[out].device[bytes];
        let mut records: Vec<Particle> = bytemuck::pod_collect_to_vec(target);
        (self.kernel)(uniforms, &field, cells, &mut records);
        target.copy_from_slice(bytemuck::cast_slice(&records));
    }

    fn retire(&mut self, sub: Submission) {
        for s in &sub.signals {
            if self.semaphores[*s].signaled {
                self.violation(format!("semaphore {s} signaled while already signaled"));
            }
            self.semaphores[*s].signaled = true;
            self.semaphores[*s].pending_signal = false;
        }
        if let Some(f) = sub.fence {
            self.fences[f].signaled = true;
            self.fences[f].pending = false;
            self.fence_event(f, FenceEventKind::Signaled);
        }
        for b in &sub.buffers {
            self.buffers[*b].users -= 1;
        }
    }

    fn advance(&mut self, steps: u32) {
        for _ in 0..steps {
            if !self.step() {
                break;
            }
        }
    }

    fn drain(&mut self) -> Result<(), FatalError> {
        while !self.queue.is_empty() {
            if !self.step() {
                return Err(FatalError::InvariantViolation(format!(
                    "device idle wait stalled with {} blocked submissions",
                    self.queue.len()
                )));
            }
        }
        Ok(())
    }

    fn publish(&mut self, id: usize) {
        let Some(shadow) = self.buffers[id].shadow.clone() else {
            return;
        };
        if !shadow.take_dirty() {
            return;
        }
        if self.buffers[id].users > 0 {
            let label = self.buffers[id].label.clone();
            self.hazard(format!("host write to `{label}` while queued work still uses it"));
        }
        let record = &mut self.buffers[id];
        record.device = shadow.snapshot();
        record.last_write = Some(WriteTag::Host);
    }
}

// ====================== handles ======================================

type Shared = Arc<Mutex<DeviceState>>;

fn lock(shared: &Shared) -> MutexGuard<'_, DeviceState> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct HeadlessBuffer {
    id: usize,
    shared: Shared,
}

impl HeadlessBuffer {
    pub fn id(&self) -> usize {
        self.id
    }
}

impl Drop for HeadlessBuffer {
    fn drop(&mut self) {
        let mut state = lock(&self.shared);
        if state.buffers[self.id].users > 0 {
            let label = state.buffers[self.id].label.clone();
            state.violation(format!("buffer `{label}` destroyed while in use"));
        }
        // release the mapping so views see the buffer as gone
        state.buffers[self.id].shadow = None;
        state.buffers[self.id].device = Vec::new();
    }
}

pub struct HeadlessFence {
    id: usize,
    shared: Shared,
}

impl HeadlessFence {
    pub fn id(&self) -> usize {
        self.id
    }
}

impl Drop for HeadlessFence {
    fn drop(&mut self) {
        let mut state = lock(&self.shared);
        if state.fences[self.id].pending {
            state.violation(format!("fence {} destroyed while pending", self.id));
        }
    }
}

pub struct HeadlessSemaphore {
    id: usize,
    shared: Shared,
}

impl HeadlessSemaphore {
    pub fn id(&self) -> usize {
        self.id
    }
}

impl Drop for HeadlessSemaphore {
    fn drop(&mut self) {
        let mut state = lock(&self.shared);
        let waited = state.queue.iter().any(|s| s.waits.contains(&self.id));
        if state.semaphores[self.id].pending_signal || waited {
            state.violation(format!("semaphore {} destroyed while in use", self.id));
        }
    }
}

pub struct HeadlessShader {
    pub name: String,
    pub stage: ShaderStage,
    /// Group 0 buffer bindings the module declares.
    pub bindings: Vec<LayoutEntry>,
}

pub struct HeadlessLayout {
    entries: Vec<LayoutEntry>,
}

pub struct HeadlessBindGroup {
    bindings: Vec<(u32, usize)>,
}

impl HeadlessBindGroup {
    fn buffer(&self, binding: u32) -> Option<usize> {
        self.bindings.iter().find(|(b, _)| *b == binding).map(|(_, id)| *id)
    }
}

pub struct HeadlessComputePipeline {
    pub label: String,
}

pub struct HeadlessGraphicsPipeline {
    pub label: String,
    pub color_format: PixelFormat,
}

pub struct HeadlessSwapTarget {
    generation: u64,
    config: SwapConfig,
    shared: Shared,
}

impl HeadlessSwapTarget {
    pub fn config(&self) -> &SwapConfig {
        &self.config
    }
}

impl Drop for HeadlessSwapTarget {
    fn drop(&mut self) {
        let mut state = lock(&self.shared);
        let generation = self.generation;
        let in_use = state.queue.iter().any(|s| match s.work {
            Work::Draw { generation: g, .. } | Work::Present { generation: g, .. } => g == generation,
            _ => false,
        });
        if in_use {
            state.violation(format!("swap target {generation} destroyed while in use"));
        }
        if state.swap.as_ref().is_some_and(|s| s.generation == generation) {
            state.swap = None;
        }
    }
}

// ====================== backend ======================================

pub struct HeadlessBackend {
    shared: Shared,
    selection: DeviceSelection,
    surface: SurfaceSupport,
    report_current_extent: bool,
    compute_steps: u32,
    background_steps: u32,
}

impl HeadlessBackend {
    pub fn open(config: HeadlessConfig, requirements: &DeviceRequirements) -> Result<Self, FatalError> {
        let selection = select_physical_device(&config.instance_layers, &config.adapters, requirements)?;
        let surface = config.adapters[selection.index].surface.clone();

        let state = DeviceState {
            clock: 0,
            window: config.window,
            hold_presented: false,
            fences: Vec::new(),
            semaphores: Vec::new(),
            buffers: Vec::new(),
            queue: Vec::new(),
            next_submission: 0,
            swap: None,
            swap_generation: 0,
            kernel: config.kernel,
            report: HeadlessReport::default(),
        };

        Ok(Self {
            shared: Arc::new(Mutex::new(state)),
            selection,
            surface,
            report_current_extent: config.report_current_extent,
            compute_steps: config.compute_steps.max(1),
            background_steps: config.background_steps,
        })
    }

    fn state(&self) -> MutexGuard<'_, DeviceState> {
        lock(&self.shared)
    }

    /// Simulates the window being resized or minimized.
    pub fn set_window_extent(&self, extent: Extent) {
        self.state().window = extent;
    }

    /// While set, presented images are never returned to the swap chain, so
    /// acquire eventually times out. Clearing it releases every held image.
    pub fn hold_presented_images(&self, hold: bool) {
        let mut state = self.state();
        state.hold_presented = hold;
        if !hold {
            if let Some(swap) = state.swap.as_mut() {
                for image in swap.images.iter_mut().filter(|img| **img == ImageState::Held) {
                    *image = ImageState::Available;
                }
            }
        }
    }

    pub fn window_extent(&self) -> Extent {
        self.state().window
    }

    pub fn report(&self) -> HeadlessReport {
        self.state().report.clone()
    }

    pub fn clock(&self) -> u64 {
        self.state().clock
    }

    pub fn pending_submissions(&self) -> usize {
        self.state().queue.len()
    }

    pub fn fence_history(&self, fence: &HeadlessFence) -> Vec<FenceEvent> {
        self.state().fences[fence.id].history.clone()
    }

    pub fn fence_signaled(&self, fence: &HeadlessFence) -> bool {
        self.state().fences[fence.id].signaled
    }

    pub fn device_bytes(&self, buffer: &HeadlessBuffer) -> Vec<u8> {
        self.state().buffers[buffer.id].device.clone()
    }

    pub fn device_contents<T: Pod>(&self, buffer: &HeadlessBuffer) -> Vec<T> {
        bytemuck::pod_collect_to_vec(&self.device_bytes(buffer))
    }

    fn semaphore_wait_ids(waits: &[SemaphoreWait<'_, Self>]) -> Vec<usize> {
        waits.iter().map(|w| w.semaphore.id).collect()
    }
}

impl Backend for HeadlessBackend {
    type Buffer = HeadlessBuffer;
    type Fence = HeadlessFence;
    type Semaphore = HeadlessSemaphore;
    type ShaderModule = HeadlessShader;
    type BindGroupLayout = HeadlessLayout;
    type BindGroup = HeadlessBindGroup;
    type ComputePipeline = HeadlessComputePipeline;
    type GraphicsPipeline = HeadlessGraphicsPipeline;
    type SwapTarget = HeadlessSwapTarget;

    fn selection(&self) -> &DeviceSelection {
        &self.selection
    }

    fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<HeadlessBuffer, FatalError> {
        let size = desc.size as usize;
        let mut state = self.state();
        let id = state.buffers.len();
        state.buffers.push(BufferRecord {
            label: desc.label.to_string(),
            device: vec![0; size],
            shadow: desc.host_visible.then(|| HostMemory::zeroed(size)),
            users: 0,
            writer: None,
            last_write: None,
        });
        Ok(HeadlessBuffer {
            id,
            shared: Arc::clone(&self.shared),
        })
    }

    fn host_memory(&self, buffer: &HeadlessBuffer) -> Option<HostMemory> {
        self.state().buffers[buffer.id].shadow.clone()
    }

    fn flush(&self, buffer: &HeadlessBuffer) -> Result<(), FatalError> {
        let mut state = self.state();
        state.advance(self.background_steps);
        state.publish(buffer.id);
        Ok(())
    }

    fn upload(&self, buffer: &HeadlessBuffer, bytes: &[u8]) -> Result<(), FatalError> {
        let mut state = self.state();
        let record = &state.buffers[buffer.id];
        if bytes.len() > record.device.len() {
            return Err(FatalError::Allocation {
                label: record.label.clone(),
                reason: format!("upload of {} bytes into {}", bytes.len(), record.device.len()),
            });
        }
        if record.users > 0 {
            let label = record.label.clone();
            state.hazard(format!("upload into `{label}` while queued work still uses it"));
        }
        let record = &mut state.buffers[buffer.id];
        record.device[..bytes.len()].copy_from_slice(bytes);
        record.last_write = Some(WriteTag::Upload);
        if let Some(shadow) = &record.shadow {
            shadow.mirror(bytes);
        }
        state.report.uploads += 1;
        Ok(())
    }

    fn create_fence(&self, signaled: bool) -> Result<HeadlessFence, FatalError> {
        let mut state = self.state();
        let id = state.fences.len();
        state.fences.push(FenceRecord {
            signaled,
            pending: false,
            history: Vec::new(),
        });
        state.fence_event(id, FenceEventKind::Created { signaled });
        Ok(HeadlessFence {
            id,
            shared: Arc::clone(&self.shared),
        })
    }

    fn wait_fence(&self, fence: &HeadlessFence, timeout: Duration) -> Result<(), FatalError> {
        let mut state = self.state();
        while !state.fences[fence.id].signaled {
            if !state.step() {
                // nothing can make progress: a real device would hang until timeout
                return Err(FatalError::FenceTimeout(timeout));
            }
        }
        state.fence_event(fence.id, FenceEventKind::WaitReturned);
        Ok(())
    }

    fn reset_fence(&self, fence: &mut HeadlessFence) -> Result<(), FatalError> {
        let mut state = self.state();
        if state.fences[fence.id].pending {
            state.violation(format!("reset of fence {} while pending", fence.id));
        }
        state.fences[fence.id].signaled = false;
        state.fence_event(fence.id, FenceEventKind::Reset);
        Ok(())
    }

    fn create_semaphore(&self) -> Result<HeadlessSemaphore, FatalError> {
        let mut state = self.state();
        let id = state.semaphores.len();
        state.semaphores.push(SemaphoreRecord::default());
        Ok(HeadlessSemaphore {
            id,
            shared: Arc::clone(&self.shared),
        })
    }

    fn compile_shader(
        &self,
        name: &str,
        stage: ShaderStage,
        source: &str,
    ) -> Result<HeadlessShader, FatalError> {
        let bindings = validate_wgsl(name, stage, source)?;
        Ok(HeadlessShader {
            name: name.to_string(),
            stage,
            bindings,
        })
    }

    fn create_bind_group_layout(
        &self,
        _label: &str,
        entries: &[LayoutEntry],
    ) -> Result<HeadlessLayout, FatalError> {
        Ok(HeadlessLayout {
            entries: entries.to_vec(),
        })
    }

    fn create_bind_group(
        &self,
        label: &str,
        layout: &HeadlessLayout,
        entries: &[BindEntry<'_, Self>],
    ) -> Result<HeadlessBindGroup, FatalError> {
        let state = self.state();
        for slot in &layout.entries {
            let Some(entry) = entries.iter().find(|e| e.binding == slot.binding) else {
                return Err(FatalError::PipelineCreation {
                    label: label.to_string(),
                    reason: format!("binding {} has no buffer", slot.binding),
                });
            };
            let record = &state.buffers[entry.buffer.id];
            if slot.kind == BindingKind::Uniform && record.device.is_empty() {
                return Err(FatalError::PipelineCreation {
                    label: label.to_string(),
                    reason: format!("uniform binding {} is empty", slot.binding),
                });
            }
        }
        Ok(HeadlessBindGroup {
            bindings: entries.iter().map(|e| (e.binding, e.buffer.id)).collect(),
        })
    }

    fn create_compute_pipeline(
        &self,
        desc: &ComputePipelineDesc<'_, Self>,
    ) -> Result<HeadlessComputePipeline, FatalError> {
        if desc.module.stage != ShaderStage::Compute {
            return Err(FatalError::PipelineCreation {
                label: desc.label.to_string(),
                reason: format!("`{}` is not a compute shader", desc.module.name),
            });
        }
        check_interface(&desc.module.name, &desc.module.bindings, &desc.layout.entries).map_err(|reason| {
            FatalError::PipelineCreation {
                label: desc.label.to_string(),
                reason,
            }
        })?;
        Ok(HeadlessComputePipeline {
            label: desc.label.to_string(),
        })
    }

    fn create_graphics_pipeline(
        &self,
        desc: &GraphicsPipelineDesc<'_, Self>,
    ) -> Result<HeadlessGraphicsPipeline, FatalError> {
        if desc.vertex.stage != ShaderStage::Vertex || desc.fragment.stage != ShaderStage::Fragment {
            return Err(FatalError::PipelineCreation {
                label: desc.label.to_string(),
                reason: "vertex/fragment stages are swapped or missing".to_string(),
            });
        }
        if desc.vertex_layout.stride != Particle::STRIDE {
            return Err(FatalError::PipelineCreation {
                label: desc.label.to_string(),
                reason: format!("vertex stride {} does not match Particle", desc.vertex_layout.stride),
            });
        }
        for module in [desc.vertex, desc.fragment] {
            check_interface(&module.name, &module.bindings, &desc.layout.entries).map_err(|reason| {
                FatalError::PipelineCreation {
                    label: desc.label.to_string(),
                    reason,
                }
            })?;
        }
        Ok(HeadlessGraphicsPipeline {
            label: desc.label.to_string(),
            color_format: desc.color_format,
        })
    }

    fn submit_compute(
        &self,
        job: &ComputeJob<'_, Self>,
        signal: &HeadlessSemaphore,
        fence: &mut HeadlessFence,
    ) -> Result<(), FatalError> {
        let mut state = self.state();
        state.advance(self.background_steps);

        let (Some(params), Some(field), Some(out)) = (
            job.bind_group.buffer(0),
            job.bind_group.buffer(1),
            job.bind_group.buffer(2),
        ) else {
            return Err(FatalError::Submission("compute bind group is incomplete".to_string()));
        };

        let uniforms: ComputeUniforms = {
            let bytes = &state.buffers[params].device;
            let size = std::mem::size_of::<ComputeUniforms>();
            if bytes.len() < size {
                return Err(FatalError::Submission("compute uniforms are truncated".to_string()));
            }
            bytemuck::pod_read_unaligned(&bytes[..size])
        };
        let total = (uniforms.num_cells as usize).min(job.workgroups as usize * 256);
        let chunk = total.div_ceil(self.compute_steps as usize).max(1);

        let mut buffers: Vec<usize> = job.reads.iter().chain(job.writes).map(|b| b.id).collect();
        buffers.sort_unstable();
        buffers.dedup();

        state.enqueue(
            Vec::new(),
            vec![signal.id],
            Some(fence.id),
            buffers,
            Work::Compute {
                uniforms,
                field,
                out,
                total,
                cursor: 0,
                chunk,
            },
        );
        Ok(())
    }

    fn submit_draw(
        &self,
        job: &DrawJob<'_, Self>,
        waits: &[SemaphoreWait<'_, Self>],
        signal: &HeadlessSemaphore,
        fence: &mut HeadlessFence,
    ) -> Result<(), FatalError> {
        let mut state = self.state();
        state.advance(self.background_steps);

        let image_ok = state
            .swap
            .as_ref()
            .filter(|s| s.generation == job.target.generation)
            .and_then(|s| s.images.get(job.image as usize))
            .is_some_and(|img| *img == ImageState::Acquired);
        if !image_ok {
            state.violation(format!("draw into image {} that was not acquired", job.image));
        }

        let mut buffers: Vec<usize> = job.uniforms.iter().map(|b| b.id).collect();
        buffers.push(job.vertex_buffer.id);
        state.enqueue(
            Self::semaphore_wait_ids(waits),
            vec![signal.id],
            Some(fence.id),
            buffers,
            Work::Draw {
                vertex_buffer: job.vertex_buffer.id,
                generation: job.target.generation,
            },
        );
        Ok(())
    }

    fn drain_semaphore(&self, semaphore: &HeadlessSemaphore) -> Result<(), FatalError> {
        let mut state = self.state();
        state.enqueue(vec![semaphore.id], Vec::new(), None, Vec::new(), Work::Drain);
        Ok(())
    }

    fn surface_support(&self) -> Result<SurfaceSupport, FatalError> {
        let mut support = self.surface.clone();
        if self.report_current_extent {
            support.capabilities.current_extent = Some(self.state().window);
        }
        Ok(support)
    }

    fn create_swap_target(&self, config: &SwapConfig) -> Result<HeadlessSwapTarget, FatalError> {
        if config.extent.is_degenerate() {
            return Err(FatalError::Swapchain(format!(
                "cannot build a {} swap chain",
                config.extent
            )));
        }
        let mut state = self.state();
        if state.swap.is_some() {
            state.violation("swap target created while the previous one is alive".to_string());
        }
        state.swap_generation += 1;
        let generation = state.swap_generation;
        state.swap = Some(SwapRecord {
            generation,
            extent: config.extent,
            images: vec![ImageState::Available; config.image_count as usize],
            next: 0,
        });
        state.report.swap_builds += 1;
        Ok(HeadlessSwapTarget {
            generation,
            config: *config,
            shared: Arc::clone(&self.shared),
        })
    }

    fn acquire_next_image(
        &self,
        target: &mut HeadlessSwapTarget,
        _timeout: Duration,
        signal: &HeadlessSemaphore,
    ) -> Result<AcquireStatus, FatalError> {
        let mut state = self.state();
        state.advance(self.background_steps);

        let window = state.window;
        let current = state
            .swap
            .as_ref()
            .is_some_and(|s| s.generation == target.generation && s.extent == window);
        if !current || window.is_degenerate() {
            return Ok(AcquireStatus::OutOfDate);
        }

        let image = loop {
            let free = state.swap.as_ref().and_then(|s| {
                let n = s.images.len();
                (0..n)
                    .map(|k| (s.next + k) % n)
                    .find(|k| s.images[*k] == ImageState::Available)
            });
            if let Some(image) = free {
                break image;
            }
            if !state.step() {
                return Ok(AcquireStatus::Timeout);
            }
        };

        if state.semaphores[signal.id].signaled || state.semaphores[signal.id].pending_signal {
            state.violation(format!("acquire signals semaphore {} that is still signaled", signal.id));
        }
        state.semaphores[signal.id].signaled = true;
        if let Some(swap) = state.swap.as_mut() {
            swap.images[image] = ImageState::Acquired;
            swap.next = (image + 1) % swap.images.len();
        }
        Ok(AcquireStatus::Acquired {
            image: image as u32,
            suboptimal: false,
        })
    }

    fn present(
        &self,
        target: &mut HeadlessSwapTarget,
        image: u32,
        wait: &HeadlessSemaphore,
    ) -> Result<PresentStatus, FatalError> {
        let mut state = self.state();
        state.advance(self.background_steps);

        let acquired = state
            .swap
            .as_ref()
            .filter(|s| s.generation == target.generation)
            .and_then(|s| s.images.get(image as usize))
            .is_some_and(|img| *img == ImageState::Acquired);
        if !acquired {
            state.violation(format!("present of image {image} that was not acquired"));
        }

        state.enqueue(
            vec![wait.id],
            Vec::new(),
            None,
            Vec::new(),
            Work::Present {
                image: image as usize,
                generation: target.generation,
            },
        );

        if state.window != target.config.extent {
            Ok(PresentStatus::OutOfDate)
        } else {
            Ok(PresentStatus::Presented)
        }
    }

    fn wait_idle(&self) -> Result<(), FatalError> {
        self.state().drain()
    }
}
