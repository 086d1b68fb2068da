//! The seam between the frame engine and a concrete GPU API.
//!
//! Everything above this trait (resources, pipelines, swap chain, frame
//! orchestration) is written once against [`Backend`]. Two implementations
//! exist: [`crate::gpu::wgpu_backend::WgpuBackend`] for real hardware and
//! [`crate::gpu::headless::HeadlessBackend`], a software device used by the
//! tests and the headless demo.
//!
//! ## Handle model
//!
//! Every associated type is an owned RAII handle. Dropping it releases the
//! underlying object, so teardown order is the field order of whoever owns it.
//!
//! ## Synchronization model
//!
//! Fences are host-observable completion signals. Semaphores are device-only:
//! the host creates them and names them in submissions but never waits on or
//! signals them itself.

use std::ops::BitOr;
use std::time::Duration;

use crate::gpu::buffers::HostMemory;
use crate::gpu::device::DeviceSelection;
use crate::gpu::error::FatalError;
use crate::gpu::swap::{DepthFormat, PixelFormat, SurfaceSupport, SwapConfig};

// ====================== descriptors ==================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferUsage(u32);

impl BufferUsage {
    pub const UNIFORM: Self = Self(1 << 0);
    pub const STORAGE: Self = Self(1 << 1);
    pub const VERTEX: Self = Self(1 << 2);
    pub const TRANSFER_DST: Self = Self(1 << 3);
    pub const TRANSFER_SRC: Self = Self(1 << 4);

    #[inline]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for BufferUsage {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct BufferDesc<'a> {
    pub label: &'a str,
    pub size: u64,
    pub usage: BufferUsage,
    /// Keep a persistently mapped host copy. Host writes become visible to
    /// the device at the next [`Backend::flush`].
    pub host_visible: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
}

impl ShaderStage {
    pub const ALL: [ShaderStage; 3] = [ShaderStage::Vertex, ShaderStage::Fragment, ShaderStage::Compute];

    /// File suffix used by the shader library: `<name>.<ext>.wgsl`.
    pub fn extension(self) -> &'static str {
        match self {
            ShaderStage::Vertex => "vert",
            ShaderStage::Fragment => "frag",
            ShaderStage::Compute => "comp",
        }
    }

    pub fn entry_point(self) -> &'static str {
        match self {
            ShaderStage::Vertex => "vs_main",
            ShaderStage::Fragment => "fs_main",
            ShaderStage::Compute => "cs_main",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StageFlags(u8);

impl StageFlags {
    pub const VERTEX: Self = Self(1 << 0);
    pub const FRAGMENT: Self = Self(1 << 1);
    pub const COMPUTE: Self = Self(1 << 2);

    #[inline]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for StageFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BindingKind {
    Uniform,
    StorageRead,
    StorageReadWrite,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LayoutEntry {
    pub binding: u32,
    pub kind: BindingKind,
    pub visibility: StageFlags,
}

pub struct BindEntry<'a, B: Backend> {
    pub binding: u32,
    pub buffer: &'a B::Buffer,
}

/// A `vec4<f32>` vertex attribute.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VertexAttribute {
    pub location: u32,
    pub offset: u64,
}

#[derive(Clone, Copy, Debug)]
pub struct VertexLayout<'a> {
    pub stride: u64,
    pub attributes: &'a [VertexAttribute],
}

pub struct ComputePipelineDesc<'a, B: Backend> {
    pub label: &'a str,
    pub layout: &'a B::BindGroupLayout,
    pub module: &'a B::ShaderModule,
}

pub struct GraphicsPipelineDesc<'a, B: Backend> {
    pub label: &'a str,
    pub layout: &'a B::BindGroupLayout,
    pub vertex: &'a B::ShaderModule,
    pub fragment: &'a B::ShaderModule,
    pub vertex_layout: VertexLayout<'a>,
    pub color_format: PixelFormat,
    pub depth_format: DepthFormat,
}

// ====================== submissions ==================================

/// One compute dispatch. `reads`/`writes` list every buffer the bind group
/// touches so a backend can track hazards.
pub struct ComputeJob<'a, B: Backend> {
    pub pipeline: &'a B::ComputePipeline,
    pub bind_group: &'a B::BindGroup,
    pub workgroups: u32,
    pub reads: &'a [&'a B::Buffer],
    pub writes: &'a [&'a B::Buffer],
}

/// One render pass into an acquired swap image.
pub struct DrawJob<'a, B: Backend> {
    pub pipeline: &'a B::GraphicsPipeline,
    pub bind_group: &'a B::BindGroup,
    pub uniforms: &'a [&'a B::Buffer],
    pub vertex_buffer: &'a B::Buffer,
    pub vertex_count: u32,
    pub target: &'a B::SwapTarget,
    pub image: u32,
    pub clear_color: [f32; 4],
}

/// The pipeline stage a semaphore wait gates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitStage {
    VertexInput,
    ColorAttachmentOutput,
}

pub struct SemaphoreWait<'a, B: Backend> {
    pub semaphore: &'a B::Semaphore,
    pub stage: WaitStage,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquireStatus {
    Acquired { image: u32, suboptimal: bool },
    OutOfDate,
    Timeout,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresentStatus {
    Presented,
    Suboptimal,
    OutOfDate,
}

// ====================== trait ========================================

pub trait Backend: Sized + Send + Sync + 'static {
    type Buffer: Send + Sync;
    type Fence: Send + Sync;
    type Semaphore: Send + Sync;
    type ShaderModule: Send + Sync;
    type BindGroupLayout: Send + Sync;
    type BindGroup: Send + Sync;
    type ComputePipeline: Send + Sync;
    type GraphicsPipeline: Send + Sync;
    type SwapTarget: Send + Sync;

    /// The physical device and queue families this backend was opened on.
    fn selection(&self) -> &DeviceSelection;

    fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<Self::Buffer, FatalError>;

    /// The persistent host mapping of a buffer created with `host_visible`.
    fn host_memory(&self, buffer: &Self::Buffer) -> Option<HostMemory>;

    /// Publishes pending host writes to the device. Must only be called when
    /// no in-flight GPU work uses `buffer`.
    fn flush(&self, buffer: &Self::Buffer) -> Result<(), FatalError>;

    /// One-time blocking upload through a transient staging buffer.
    fn upload(&self, buffer: &Self::Buffer, bytes: &[u8]) -> Result<(), FatalError>;

    fn create_fence(&self, signaled: bool) -> Result<Self::Fence, FatalError>;

    /// Blocks until `fence` signals. Exceeding `timeout` is a hang and fatal.
    fn wait_fence(&self, fence: &Self::Fence, timeout: Duration) -> Result<(), FatalError>;

    fn reset_fence(&self, fence: &mut Self::Fence) -> Result<(), FatalError>;

    fn create_semaphore(&self) -> Result<Self::Semaphore, FatalError>;

    fn compile_shader(
        &self,
        name: &str,
        stage: ShaderStage,
        source: &str,
    ) -> Result<Self::ShaderModule, FatalError>;

    fn create_bind_group_layout(
        &self,
        label: &str,
        entries: &[LayoutEntry],
    ) -> Result<Self::BindGroupLayout, FatalError>;

    fn create_bind_group(
        &self,
        label: &str,
        layout: &Self::BindGroupLayout,
        entries: &[BindEntry<'_, Self>],
    ) -> Result<Self::BindGroup, FatalError>;

    fn create_compute_pipeline(
        &self,
        desc: &ComputePipelineDesc<'_, Self>,
    ) -> Result<Self::ComputePipeline, FatalError>;

    fn create_graphics_pipeline(
        &self,
        desc: &GraphicsPipelineDesc<'_, Self>,
    ) -> Result<Self::GraphicsPipeline, FatalError>;

    /// Submits with no wait semaphores; signals `signal` and `fence` on completion.
    fn submit_compute(
        &self,
        job: &ComputeJob<'_, Self>,
        signal: &Self::Semaphore,
        fence: &mut Self::Fence,
    ) -> Result<(), FatalError>;

    fn submit_draw(
        &self,
        job: &DrawJob<'_, Self>,
        waits: &[SemaphoreWait<'_, Self>],
        signal: &Self::Semaphore,
        fence: &mut Self::Fence,
    ) -> Result<(), FatalError>;

    /// Submits an empty batch that only waits on `semaphore`, returning it to
    /// the unsignaled state once its signal operation has executed.
    fn drain_semaphore(&self, semaphore: &Self::Semaphore) -> Result<(), FatalError>;

    fn surface_support(&self) -> Result<SurfaceSupport, FatalError>;

    fn create_swap_target(&self, config: &SwapConfig) -> Result<Self::SwapTarget, FatalError>;

    fn acquire_next_image(
        &self,
        target: &mut Self::SwapTarget,
        timeout: Duration,
        signal: &Self::Semaphore,
    ) -> Result<AcquireStatus, FatalError>;

    fn present(
        &self,
        target: &mut Self::SwapTarget,
        image: u32,
        wait: &Self::Semaphore,
    ) -> Result<PresentStatus, FatalError>;

    fn wait_idle(&self) -> Result<(), FatalError>;
}
