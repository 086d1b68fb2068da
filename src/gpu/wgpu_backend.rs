//! [`Backend`] on top of wgpu, driving a window surface owned by bevy's
//! winit integration.
//!
//! wgpu hides queue families and binary semaphores: everything goes through
//! one queue and submissions execute in order. Semaphores are therefore
//! markers, and the orchestrator's waits are satisfied by submission order.
//! Fences map onto `Queue::on_submitted_work_done`; a wait blocks on the
//! fence's submission index. The validation layer is looked up in the Vulkan
//! loader, so requesting it on a host without it fails at startup.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use bevy::log::{debug, info, warn};
use bevy::tasks::block_on;
use bevy::window::RawHandleWrapper;
use wgpu::util::DeviceExt;

use crate::gpu::backend::{
    AcquireStatus, Backend, BindEntry, BindingKind, BufferDesc, BufferUsage, ComputeJob,
    ComputePipelineDesc, DrawJob, GraphicsPipelineDesc, LayoutEntry, PresentStatus, SemaphoreWait,
    ShaderStage, StageFlags,
};
use crate::gpu::buffers::HostMemory;
use crate::gpu::device::{
    DeviceFeatures, DeviceKind, DeviceRequirements, DeviceSelection, PhysicalDeviceInfo,
    QueueFamilyInfo, QueueFlags, SWAPCHAIN_EXTENSION, select_physical_device,
};
use crate::gpu::error::FatalError;
use crate::gpu::swap::{
    ColorSpace, DepthFormat, Extent, PixelFormat, PresentMode, SurfaceCapabilities, SurfaceFormat,
    SurfaceSupport, SwapConfig,
};

pub const FENCE_BACKOFF_MIN: Duration = Duration::from_micros(50);
pub const FENCE_BACKOFF_MAX: Duration = Duration::from_millis(2);

/// Sleep before the next fence poll: doubles, capped at [`FENCE_BACKOFF_MAX`].
pub fn fence_backoff(previous: Duration) -> Duration {
    (previous * 2).clamp(FENCE_BACKOFF_MIN, FENCE_BACKOFF_MAX)
}

// ==================== instance layers ================================

/// Instance layers the Vulkan loader behind `instance` can enable. An
/// instance without a Vulkan backend has none.
pub fn instance_layers(instance: &wgpu::Instance) -> Vec<String> {
    #[cfg(any(windows, all(unix, not(target_vendor = "apple"), not(target_arch = "wasm32"))))]
    {
        // SAFETY: the hal instance is only borrowed for this enumeration
        if let Some(vulkan) = unsafe { instance.as_hal::<wgpu::hal::api::Vulkan>() } {
            let entry = vulkan.shared_instance().entry();
            // SAFETY: `entry` is the loader the instance was created from
            return match unsafe { entry.enumerate_instance_layer_properties() } {
                Ok(layers) => layers
                    .iter()
                    .filter_map(|layer| layer.layer_name_as_c_str().ok())
                    .map(|name| name.to_string_lossy().into_owned())
                    .collect(),
                Err(err) => {
                    warn!("device: instance layer enumeration failed: {err}");
                    Vec::new()
                }
            };
        }
    }
    #[cfg(not(any(windows, all(unix, not(target_vendor = "apple"), not(target_arch = "wasm32")))))]
    let _ = instance;
    Vec::new()
}

// ==================== format mapping =================================

fn texture_format(format: PixelFormat) -> wgpu::TextureFormat {
    match format {
        PixelFormat::Bgra8UnormSrgb => wgpu::TextureFormat::Bgra8UnormSrgb,
        PixelFormat::Rgba8UnormSrgb => wgpu::TextureFormat::Rgba8UnormSrgb,
        PixelFormat::Bgra8Unorm => wgpu::TextureFormat::Bgra8Unorm,
        PixelFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
        PixelFormat::Rgb10a2Unorm => wgpu::TextureFormat::Rgb10a2Unorm,
        PixelFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
    }
}

fn surface_format(format: wgpu::TextureFormat) -> Option<SurfaceFormat> {
    let (format, color_space) = match format {
        wgpu::TextureFormat::Bgra8UnormSrgb => (PixelFormat::Bgra8UnormSrgb, ColorSpace::SrgbNonLinear),
        wgpu::TextureFormat::Rgba8UnormSrgb => (PixelFormat::Rgba8UnormSrgb, ColorSpace::SrgbNonLinear),
        wgpu::TextureFormat::Bgra8Unorm => (PixelFormat::Bgra8Unorm, ColorSpace::SrgbNonLinear),
        wgpu::TextureFormat::Rgba8Unorm => (PixelFormat::Rgba8Unorm, ColorSpace::SrgbNonLinear),
        wgpu::TextureFormat::Rgb10a2Unorm => (PixelFormat::Rgb10a2Unorm, ColorSpace::SrgbNonLinear),
        wgpu::TextureFormat::Rgba16Float => (PixelFormat::Rgba16Float, ColorSpace::ExtendedLinear),
        _ => return None,
    };
    Some(SurfaceFormat { format, color_space })
}

fn depth_texture_format(format: DepthFormat) -> wgpu::TextureFormat {
    match format {
        DepthFormat::Depth32Float => wgpu::TextureFormat::Depth32Float,
        DepthFormat::Depth32FloatStencil8 => wgpu::TextureFormat::Depth32FloatStencil8,
        DepthFormat::Depth24PlusStencil8 => wgpu::TextureFormat::Depth24PlusStencil8,
    }
}

fn present_mode(mode: PresentMode) -> wgpu::PresentMode {
    match mode {
        PresentMode::Immediate => wgpu::PresentMode::Immediate,
        PresentMode::Mailbox => wgpu::PresentMode::Mailbox,
        PresentMode::Fifo => wgpu::PresentMode::Fifo,
        PresentMode::FifoRelaxed => wgpu::PresentMode::FifoRelaxed,
    }
}

fn from_present_mode(mode: wgpu::PresentMode) -> Option<PresentMode> {
    match mode {
        wgpu::PresentMode::Immediate => Some(PresentMode::Immediate),
        wgpu::PresentMode::Mailbox => Some(PresentMode::Mailbox),
        wgpu::PresentMode::Fifo => Some(PresentMode::Fifo),
        wgpu::PresentMode::FifoRelaxed => Some(PresentMode::FifoRelaxed),
        _ => None,
    }
}

fn device_kind(kind: wgpu::DeviceType) -> DeviceKind {
    match kind {
        wgpu::DeviceType::DiscreteGpu => DeviceKind::Discrete,
        wgpu::DeviceType::IntegratedGpu => DeviceKind::Integrated,
        wgpu::DeviceType::VirtualGpu => DeviceKind::Virtual,
        wgpu::DeviceType::Cpu => DeviceKind::Cpu,
        wgpu::DeviceType::Other => DeviceKind::Other,
    }
}

fn buffer_usages(usage: BufferUsage, host_visible: bool) -> wgpu::BufferUsages {
    let pairs = [
        (BufferUsage::UNIFORM, wgpu::BufferUsages::UNIFORM),
        (BufferUsage::STORAGE, wgpu::BufferUsages::STORAGE),
        (BufferUsage::VERTEX, wgpu::BufferUsages::VERTEX),
        (BufferUsage::TRANSFER_DST, wgpu::BufferUsages::COPY_DST),
        (BufferUsage::TRANSFER_SRC, wgpu::BufferUsages::COPY_SRC),
    ];
    let mut usages = wgpu::BufferUsages::empty();
    for (ours, theirs) in pairs {
        if usage.contains(ours) {
            usages |= theirs;
        }
    }
    // host writes are published with `Queue::write_buffer`
    if host_visible {
        usages |= wgpu::BufferUsages::COPY_DST;
    }
    usages
}

fn shader_stages(flags: StageFlags) -> wgpu::ShaderStages {
    let mut stages = wgpu::ShaderStages::NONE;
    if flags.contains(StageFlags::VERTEX) {
        stages |= wgpu::ShaderStages::VERTEX;
    }
    if flags.contains(StageFlags::FRAGMENT) {
        stages |= wgpu::ShaderStages::FRAGMENT;
    }
    if flags.contains(StageFlags::COMPUTE) {
        stages |= wgpu::ShaderStages::COMPUTE;
    }
    stages
}

fn surface_support(
    surface: &wgpu::Surface<'static>,
    adapter: &wgpu::Adapter,
) -> SurfaceSupport {
    let caps = surface.get_capabilities(adapter);
    let max = adapter.limits().max_texture_dimension_2d;

    let mut depth_formats = vec![DepthFormat::Depth32Float, DepthFormat::Depth24PlusStencil8];
    if adapter.features().contains(wgpu::Features::DEPTH32FLOAT_STENCIL8) {
        depth_formats.push(DepthFormat::Depth32FloatStencil8);
    }

    SurfaceSupport {
        capabilities: SurfaceCapabilities {
            // wgpu never dictates the extent; the window size is used as is
            current_extent: None,
            min_extent: Extent::new(1, 1),
            max_extent: Extent::new(max, max),
            min_image_count: 2,
            max_image_count: 3,
        },
        formats: caps.formats.iter().copied().filter_map(surface_format).collect(),
        present_modes: caps.present_modes.iter().copied().filter_map(from_present_mode).collect(),
        depth_formats,
    }
}

fn describe(surface: &wgpu::Surface<'static>, adapter: &wgpu::Adapter) -> PhysicalDeviceInfo {
    let info = adapter.get_info();
    let features = adapter.features();
    let present = adapter.is_surface_supported(surface);
    PhysicalDeviceInfo {
        name: info.name,
        kind: device_kind(info.device_type),
        queue_families: vec![QueueFamilyInfo {
            flags: QueueFlags::GRAPHICS | QueueFlags::COMPUTE | QueueFlags::TRANSFER,
            queue_count: 1,
            present,
        }],
        features: DeviceFeatures {
            geometry_shader: false,
            fill_mode_non_solid: features.contains(wgpu::Features::POLYGON_MODE_LINE),
            wide_lines: false,
            large_points: features.contains(wgpu::Features::POLYGON_MODE_POINT),
        },
        extensions: if present {
            vec![SWAPCHAIN_EXTENSION.to_string()]
        } else {
            Vec::new()
        },
        surface: surface_support(surface, adapter),
    }
}

// ====================== handles ======================================

pub struct WgpuBuffer {
    buffer: wgpu::Buffer,
    label: String,
    shadow: Option<HostMemory>,
}

impl WgpuBuffer {
    pub fn raw(&self) -> &wgpu::Buffer {
        &self.buffer
    }
}

pub struct WgpuFence {
    done: Arc<AtomicBool>,
    // None once reset, until the next submission arms it
    submission: Option<wgpu::SubmissionIndex>,
}

/// Submission order on the single queue already gives the ordering a
/// semaphore would.
pub struct WgpuSemaphore;

pub struct WgpuShader {
    module: wgpu::ShaderModule,
    stage: ShaderStage,
}

pub struct WgpuLayout {
    layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
}

pub struct WgpuBindGroup(wgpu::BindGroup);

pub struct WgpuComputePipeline(wgpu::ComputePipeline);

pub struct WgpuGraphicsPipeline(wgpu::RenderPipeline);

struct AcquiredImage {
    index: u32,
    texture: wgpu::SurfaceTexture,
    view: wgpu::TextureView,
}

pub struct WgpuSwapTarget {
    current: Option<AcquiredImage>,
    depth_view: wgpu::TextureView,
    _depth: wgpu::Texture,
    config: SwapConfig,
    next_image: u32,
}

// ====================== backend ======================================

// surface first: it must go before the window handle it was created from
pub struct WgpuBackend {
    surface: wgpu::Surface<'static>,
    queue: wgpu::Queue,
    device: wgpu::Device,
    adapter: wgpu::Adapter,
    _instance: wgpu::Instance,
    selection: DeviceSelection,
    device_error: Arc<Mutex<Option<String>>>,
    _window: RawHandleWrapper,
}

impl WgpuBackend {
    pub fn open(window: &RawHandleWrapper, requirements: &DeviceRequirements) -> Result<Self, FatalError> {
        let mut flags = wgpu::InstanceFlags::from_build_config();
        if requirements.validation_layer.is_some() {
            flags |= wgpu::InstanceFlags::VALIDATION | wgpu::InstanceFlags::DEBUG;
        }
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            flags,
            ..Default::default()
        });

        let target = wgpu::SurfaceTargetUnsafe::RawHandle {
            raw_display_handle: window.get_display_handle(),
            raw_window_handle: window.get_window_handle(),
        };
        // SAFETY: the handle wrapper keeps the window alive and is stored
        // after the surface, so it outlives it.
        let surface = unsafe { instance.create_surface_unsafe(target) }
            .map_err(|err| FatalError::Surface(err.to_string()))?;

        let mut adapters = instance.enumerate_adapters(wgpu::Backends::PRIMARY);
        let candidates: Vec<_> = adapters.iter().map(|a| describe(&surface, a)).collect();
        let layers = instance_layers(&instance);
        debug!("device: instance layers {layers:?}");
        let selection = select_physical_device(&layers, &candidates, requirements)?;
        let adapter = adapters.swap_remove(selection.index);

        let mut required_features = wgpu::Features::empty();
        if adapter.features().contains(wgpu::Features::DEPTH32FLOAT_STENCIL8) {
            required_features |= wgpu::Features::DEPTH32FLOAT_STENCIL8;
        }
        let (device, queue) = block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("lego_ocean_device"),
                required_features,
                required_limits: adapter.limits(),
                memory_hints: wgpu::MemoryHints::Performance,
            },
            None,
        ))
        .map_err(|err| FatalError::DeviceCreation(err.to_string()))?;

        let device_error = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&device_error);
        device.on_uncaptured_error(Box::new(move |err| {
            warn!("device: {err}");
            *sink.lock().unwrap_or_else(PoisonError::into_inner) = Some(err.to_string());
        }));

        info!("device: opened {} via {:?}", selection.name, adapter.get_info().backend);

        Ok(Self {
            surface,
            queue,
            device,
            adapter,
            _instance: instance,
            selection,
            device_error,
            _window: window.clone(),
        })
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    fn take_device_error(&self) -> Option<String> {
        self.device_error.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// Runs `f` inside a validation error scope.
    fn scoped<T>(&self, f: impl FnOnce() -> T) -> (T, Option<wgpu::Error>) {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = f();
        let error = block_on(self.device.pop_error_scope());
        (value, error)
    }

    fn submit(
        &self,
        encoder: wgpu::CommandEncoder,
        fence: &mut WgpuFence,
    ) -> Result<(), FatalError> {
        let index = self.queue.submit(Some(encoder.finish()));
        let done = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&done);
        self.queue.on_submitted_work_done(move || flag.store(true, Ordering::Release));
        fence.done = done;
        fence.submission = Some(index);

        match self.take_device_error() {
            Some(message) => Err(FatalError::Submission(message)),
            None => Ok(()),
        }
    }
}

impl Backend for WgpuBackend {
    type Buffer = WgpuBuffer;
    type Fence = WgpuFence;
    type Semaphore = WgpuSemaphore;
    type ShaderModule = WgpuShader;
    type BindGroupLayout = WgpuLayout;
    type BindGroup = WgpuBindGroup;
    type ComputePipeline = WgpuComputePipeline;
    type GraphicsPipeline = WgpuGraphicsPipeline;
    type SwapTarget = WgpuSwapTarget;

    fn selection(&self) -> &DeviceSelection {
        &self.selection
    }

    fn create_buffer(&self, desc: &BufferDesc<'_>) -> Result<WgpuBuffer, FatalError> {
        if desc.size % wgpu::COPY_BUFFER_ALIGNMENT != 0 {
            return Err(FatalError::Allocation {
                label: desc.label.to_string(),
                reason: format!("size {} is not 4-byte aligned", desc.size),
            });
        }
        let (buffer, error) = self.scoped(|| {
            self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(desc.label),
                size: desc.size,
                usage: buffer_usages(desc.usage, desc.host_visible),
                mapped_at_creation: false,
            })
        });
        if let Some(err) = error {
            return Err(FatalError::Allocation {
                label: desc.label.to_string(),
                reason: err.to_string(),
            });
        }
        Ok(WgpuBuffer {
            buffer,
            label: desc.label.to_string(),
            shadow: desc.host_visible.then(|| HostMemory::zeroed(desc.size as usize)),
        })
    }

    fn host_memory(&self, buffer: &WgpuBuffer) -> Option<HostMemory> {
        buffer.shadow.clone()
    }

    fn flush(&self, buffer: &WgpuBuffer) -> Result<(), FatalError> {
        let Some(shadow) = &buffer.shadow else {
            return Ok(());
        };
        if shadow.take_dirty() {
            self.queue.write_buffer(&buffer.buffer, 0, &shadow.snapshot());
        }
        Ok(())
    }

    fn upload(&self, buffer: &WgpuBuffer, bytes: &[u8]) -> Result<(), FatalError> {
        let len = bytes.len() as u64;
        if len > buffer.buffer.size() || len % wgpu::COPY_BUFFER_ALIGNMENT != 0 {
            return Err(FatalError::Allocation {
                label: buffer.label.clone(),
                reason: format!("upload of {len} bytes into {}", buffer.buffer.size()),
            });
        }
        if len == 0 {
            return Ok(());
        }

        let staging = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("staging"),
            contents: bytes,
            usage: wgpu::BufferUsages::COPY_SRC,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("upload") });
        encoder.copy_buffer_to_buffer(&staging, 0, &buffer.buffer, 0, len);
        let index = self.queue.submit(Some(encoder.finish()));
        self.device.poll(wgpu::Maintain::WaitForSubmissionIndex(index));

        if let Some(shadow) = &buffer.shadow {
            shadow.mirror(bytes);
        }
        debug!("resources: uploaded {len} bytes into `{}`", buffer.label);
        Ok(())
    }

    fn create_fence(&self, signaled: bool) -> Result<WgpuFence, FatalError> {
        Ok(WgpuFence {
            done: Arc::new(AtomicBool::new(signaled)),
            submission: None,
        })
    }

    fn wait_fence(&self, fence: &WgpuFence, timeout: Duration) -> Result<(), FatalError> {
        if fence.done.load(Ordering::Acquire) {
            return Ok(());
        }
        // reset and never submitted: nothing will ever signal it
        let Some(index) = fence.submission.clone() else {
            return Err(FatalError::FenceTimeout(timeout));
        };

        let start = Instant::now();
        self.device.poll(wgpu::Maintain::WaitForSubmissionIndex(index));
        let mut backoff = FENCE_BACKOFF_MIN;
        while !fence.done.load(Ordering::Acquire) {
            if start.elapsed() > timeout {
                return Err(FatalError::FenceTimeout(timeout));
            }
            std::thread::sleep(backoff);
            backoff = fence_backoff(backoff);
            self.device.poll(wgpu::Maintain::Poll);
        }
        Ok(())
    }

    fn reset_fence(&self, fence: &mut WgpuFence) -> Result<(), FatalError> {
        fence.done = Arc::new(AtomicBool::new(false));
        fence.submission = None;
        Ok(())
    }

    fn create_semaphore(&self) -> Result<WgpuSemaphore, FatalError> {
        Ok(WgpuSemaphore)
    }

    fn compile_shader(
        &self,
        name: &str,
        stage: ShaderStage,
        source: &str,
    ) -> Result<WgpuShader, FatalError> {
        let (module, error) = self.scoped(|| {
            self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(name),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            })
        });
        if let Some(err) = error {
            return Err(FatalError::ShaderCompile {
                name: name.to_string(),
                message: err.to_string(),
            });
        }
        Ok(WgpuShader { module, stage })
    }

    fn create_bind_group_layout(
        &self,
        label: &str,
        entries: &[LayoutEntry],
    ) -> Result<WgpuLayout, FatalError> {
        let entries: Vec<_> = entries
            .iter()
            .map(|e| wgpu::BindGroupLayoutEntry {
                binding: e.binding,
                visibility: shader_stages(e.visibility),
                ty: wgpu::BindingType::Buffer {
                    ty: match e.kind {
                        BindingKind::Uniform => wgpu::BufferBindingType::Uniform,
                        BindingKind::StorageRead => wgpu::BufferBindingType::Storage { read_only: true },
                        BindingKind::StorageReadWrite => {
                            wgpu::BufferBindingType::Storage { read_only: false }
                        }
                    },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            })
            .collect();

        let ((layout, pipeline_layout), error) = self.scoped(|| {
            let layout = self.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some(label),
                entries: &entries,
            });
            let pipeline_layout = self.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(label),
                bind_group_layouts: &[&layout],
                push_constant_ranges: &[],
            });
            (layout, pipeline_layout)
        });
        if let Some(err) = error {
            return Err(FatalError::PipelineCreation {
                label: label.to_string(),
                reason: err.to_string(),
            });
        }
        Ok(WgpuLayout {
            layout,
            pipeline_layout,
        })
    }

    fn create_bind_group(
        &self,
        label: &str,
        layout: &WgpuLayout,
        entries: &[BindEntry<'_, Self>],
    ) -> Result<WgpuBindGroup, FatalError> {
        let entries: Vec<_> = entries
            .iter()
            .map(|e| wgpu::BindGroupEntry {
                binding: e.binding,
                resource: e.buffer.buffer.as_entire_binding(),
            })
            .collect();
        let (group, error) = self.scoped(|| {
            self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(label),
                layout: &layout.layout,
                entries: &entries,
            })
        });
        if let Some(err) = error {
            return Err(FatalError::PipelineCreation {
                label: label.to_string(),
                reason: err.to_string(),
            });
        }
        Ok(WgpuBindGroup(group))
    }

    fn create_compute_pipeline(
        &self,
        desc: &ComputePipelineDesc<'_, Self>,
    ) -> Result<WgpuComputePipeline, FatalError> {
        let (pipeline, error) = self.scoped(|| {
            self.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(desc.label),
                layout: Some(&desc.layout.pipeline_layout),
                module: &desc.module.module,
                entry_point: Some(desc.module.stage.entry_point()),
                compilation_options: Default::default(),
                cache: None,
            })
        });
        if let Some(err) = error {
            return Err(FatalError::PipelineCreation {
                label: desc.label.to_string(),
                reason: err.to_string(),
            });
        }
        Ok(WgpuComputePipeline(pipeline))
    }

    fn create_graphics_pipeline(
        &self,
        desc: &GraphicsPipelineDesc<'_, Self>,
    ) -> Result<WgpuGraphicsPipeline, FatalError> {
        let attributes: Vec<_> = desc
            .vertex_layout
            .attributes
            .iter()
            .map(|a| wgpu::VertexAttribute {
                format: wgpu::VertexFormat::Float32x4,
                offset: a.offset,
                shader_location: a.location,
            })
            .collect();

        let (pipeline, error) = self.scoped(|| {
            self.device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(desc.label),
                layout: Some(&desc.layout.pipeline_layout),
                vertex: wgpu::VertexState {
                    module: &desc.vertex.module,
                    entry_point: Some(desc.vertex.stage.entry_point()),
                    buffers: &[wgpu::VertexBufferLayout {
                        array_stride: desc.vertex_layout.stride,
                        step_mode: wgpu::VertexStepMode::Vertex,
                        attributes: &attributes,
                    }],
                    compilation_options: Default::default(),
                },
                fragment: Some(wgpu::FragmentState {
                    module: &desc.fragment.module,
                    entry_point: Some(desc.fragment.stage.entry_point()),
                    targets: &[Some(wgpu::ColorTargetState {
                        format: texture_format(desc.color_format),
                        blend: Some(wgpu::BlendState::REPLACE),
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                    compilation_options: Default::default(),
                }),
                primitive: wgpu::PrimitiveState {
                    topology: wgpu::PrimitiveTopology::TriangleList,
                    front_face: wgpu::FrontFace::Ccw,
                    cull_mode: None,
                    ..Default::default()
                },
                depth_stencil: Some(wgpu::DepthStencilState {
                    format: depth_texture_format(desc.depth_format),
                    depth_write_enabled: true,
                    depth_compare: wgpu::CompareFunction::Less,
                    stencil: wgpu::StencilState::default(),
                    bias: wgpu::DepthBiasState::default(),
                }),
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
                cache: None,
            })
        });
        if let Some(err) = error {
            return Err(FatalError::PipelineCreation {
                label: desc.label.to_string(),
                reason: err.to_string(),
            });
        }
        Ok(WgpuGraphicsPipeline(pipeline))
    }

    fn submit_compute(
        &self,
        job: &ComputeJob<'_, Self>,
        _signal: &WgpuSemaphore,
        fence: &mut WgpuFence,
    ) -> Result<(), FatalError> {
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("brick_expand") });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("brick_expand_pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&job.pipeline.0);
            pass.set_bind_group(0, &job.bind_group.0, &[]);
            pass.dispatch_workgroups(job.workgroups, 1, 1);
        }
        self.submit(encoder, fence)
    }

    fn submit_draw(
        &self,
        job: &DrawJob<'_, Self>,
        _waits: &[SemaphoreWait<'_, Self>],
        _signal: &WgpuSemaphore,
        fence: &mut WgpuFence,
    ) -> Result<(), FatalError> {
        let Some(image) = job.target.current.as_ref().filter(|img| img.index == job.image) else {
            return Err(FatalError::InvariantViolation(format!(
                "draw into image {} that was not acquired",
                job.image
            )));
        };
        let [r, g, b, a] = job.clear_color.map(f64::from);
        let stencil_ops = match job.target.config.depth_format {
            DepthFormat::Depth32Float => None,
            _ => Some(wgpu::Operations {
                load: wgpu::LoadOp::Clear(0),
                store: wgpu::StoreOp::Discard,
            }),
        };

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("brick_draw") });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("brick_draw_pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &image.view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color { r, g, b, a }),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                    view: &job.target.depth_view,
                    depth_ops: Some(wgpu::Operations {
                        load: wgpu::LoadOp::Clear(1.0),
                        store: wgpu::StoreOp::Discard,
                    }),
                    stencil_ops,
                }),
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.set_pipeline(&job.pipeline.0);
            pass.set_bind_group(0, &job.bind_group.0, &[]);
            pass.set_vertex_buffer(0, job.vertex_buffer.buffer.slice(..));
            pass.draw(0..job.vertex_count, 0..1);
        }
        self.submit(encoder, fence)
    }

    fn drain_semaphore(&self, _semaphore: &WgpuSemaphore) -> Result<(), FatalError> {
        Ok(())
    }

    fn surface_support(&self) -> Result<SurfaceSupport, FatalError> {
        Ok(surface_support(&self.surface, &self.adapter))
    }

    fn create_swap_target(&self, config: &SwapConfig) -> Result<WgpuSwapTarget, FatalError> {
        if config.extent.is_degenerate() {
            return Err(FatalError::Swapchain(format!(
                "cannot build a {} swap chain",
                config.extent
            )));
        }
        let caps = self.surface.get_capabilities(&self.adapter);
        let alpha_mode = caps
            .alpha_modes
            .first()
            .copied()
            .unwrap_or(wgpu::CompositeAlphaMode::Auto);

        let (depth, error) = self.scoped(|| {
            self.surface.configure(
                &self.device,
                &wgpu::SurfaceConfiguration {
                    usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
                    format: texture_format(config.format.format),
                    width: config.extent.width,
                    height: config.extent.height,
                    present_mode: present_mode(config.present_mode),
                    desired_maximum_frame_latency: config.image_count.saturating_sub(1).max(1),
                    alpha_mode,
                    view_formats: vec![],
                },
            );
            self.device.create_texture(&wgpu::TextureDescriptor {
                label: Some("depth"),
                size: wgpu::Extent3d {
                    width: config.extent.width,
                    height: config.extent.height,
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: depth_texture_format(config.depth_format),
                usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
                view_formats: &[],
            })
        });
        if let Some(err) = error {
            return Err(FatalError::Swapchain(err.to_string()));
        }

        Ok(WgpuSwapTarget {
            current: None,
            depth_view: depth.create_view(&wgpu::TextureViewDescriptor::default()),
            _depth: depth,
            config: *config,
            next_image: 0,
        })
    }

    fn acquire_next_image(
        &self,
        target: &mut WgpuSwapTarget,
        _timeout: Duration,
        _signal: &WgpuSemaphore,
    ) -> Result<AcquireStatus, FatalError> {
        if target.current.is_some() {
            return Err(FatalError::InvariantViolation(
                "acquire while the previous image is still held".to_string(),
            ));
        }
        let texture = match self.surface.get_current_texture() {
            Ok(texture) => texture,
            Err(wgpu::SurfaceError::Timeout) => return Ok(AcquireStatus::Timeout),
            Err(wgpu::SurfaceError::Outdated | wgpu::SurfaceError::Lost) => {
                return Ok(AcquireStatus::OutOfDate);
            }
            Err(err) => return Err(FatalError::Surface(err.to_string())),
        };

        let index = target.next_image;
        target.next_image = (index + 1) % target.config.image_count.max(1);
        let suboptimal = texture.suboptimal;
        let view = texture.texture.create_view(&wgpu::TextureViewDescriptor::default());
        target.current = Some(AcquiredImage {
            index,
            texture,
            view,
        });
        Ok(AcquireStatus::Acquired { image: index, suboptimal })
    }

    fn present(
        &self,
        target: &mut WgpuSwapTarget,
        image: u32,
        _wait: &WgpuSemaphore,
    ) -> Result<PresentStatus, FatalError> {
        let Some(acquired) = target.current.take().filter(|img| img.index == image) else {
            return Err(FatalError::InvariantViolation(format!(
                "present of image {image} that was not acquired"
            )));
        };
        let suboptimal = acquired.texture.suboptimal;
        drop(acquired.view);
        acquired.texture.present();
        Ok(if suboptimal {
            PresentStatus::Suboptimal
        } else {
            PresentStatus::Presented
        })
    }

    fn wait_idle(&self) -> Result<(), FatalError> {
        self.device.poll(wgpu::Maintain::Wait);
        match self.take_device_error() {
            Some(message) => Err(FatalError::Submission(message)),
            None => Ok(()),
        }
    }
}
