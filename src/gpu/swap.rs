//! Presentable image chain: format/extent negotiation and the
//! stale-then-rebuild protocol.
//!
//! Negotiation is a set of pure functions over [`SurfaceSupport`] so it can be
//! checked without a device. [`SwapChain`] owns the backend's swap target and
//! everything that depends on the extent (image views, depth image).

use std::fmt;
use std::time::Duration;

use bevy::log::{debug, info};

use crate::gpu::backend::{AcquireStatus, Backend, PresentStatus};
use crate::gpu::error::FatalError;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Extent {
    pub width: u32,
    pub height: u32,
}

impl Extent {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Zero width or height, e.g. a minimized window.
    #[inline]
    pub fn is_degenerate(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    #[inline]
    pub fn aspect(&self) -> f32 {
        if self.height == 0 {
            1.0
        } else {
            self.width as f32 / self.height as f32
        }
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Bgra8UnormSrgb,
    Rgba8UnormSrgb,
    Bgra8Unorm,
    Rgba8Unorm,
    Rgb10a2Unorm,
    Rgba16Float,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ColorSpace {
    SrgbNonLinear,
    ExtendedLinear,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SurfaceFormat {
    pub format: PixelFormat,
    pub color_space: ColorSpace,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PresentMode {
    Immediate,
    Mailbox,
    Fifo,
    FifoRelaxed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DepthFormat {
    Depth32Float,
    Depth32FloatStencil8,
    Depth24PlusStencil8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SurfaceCapabilities {
    /// `None` when the surface lets the swap chain decide.
    pub current_extent: Option<Extent>,
    pub min_extent: Extent,
    pub max_extent: Extent,
    pub min_image_count: u32,
    /// 0 means no upper limit.
    pub max_image_count: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SurfaceSupport {
    pub capabilities: SurfaceCapabilities,
    pub formats: Vec<SurfaceFormat>,
    pub present_modes: Vec<PresentMode>,
    pub depth_formats: Vec<DepthFormat>,
}

impl SurfaceSupport {
    pub fn is_adequate(&self) -> bool {
        !self.formats.is_empty() && !self.present_modes.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SwapPreferences {
    pub format: SurfaceFormat,
    pub present_modes: Vec<PresentMode>,
    pub depth_formats: Vec<DepthFormat>,
}

impl Default for SwapPreferences {
    fn default() -> Self {
        Self {
            format: SurfaceFormat {
                format: PixelFormat::Bgra8UnormSrgb,
                color_space: ColorSpace::SrgbNonLinear,
            },
            present_modes: vec![PresentMode::Mailbox],
            depth_formats: vec![
                DepthFormat::Depth32Float,
                DepthFormat::Depth32FloatStencil8,
                DepthFormat::Depth24PlusStencil8,
            ],
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwapConfig {
    pub format: SurfaceFormat,
    pub present_mode: PresentMode,
    pub extent: Extent,
    pub image_count: u32,
    pub depth_format: DepthFormat,
}

// ====================== negotiation ==================================

pub fn choose_surface_format(
    available: &[SurfaceFormat],
    preferred: SurfaceFormat,
) -> Option<SurfaceFormat> {
    available
        .iter()
        .copied()
        .find(|f| *f == preferred)
        .or_else(|| available.first().copied())
}

/// FIFO is the one mode every surface must support.
pub fn choose_present_mode(available: &[PresentMode], preferred: &[PresentMode]) -> PresentMode {
    preferred
        .iter()
        .copied()
        .find(|m| available.contains(m))
        .unwrap_or(PresentMode::Fifo)
}

pub fn choose_extent(caps: &SurfaceCapabilities, framebuffer: Extent) -> Extent {
    if let Some(current) = caps.current_extent {
        return current;
    }
    Extent {
        width: framebuffer.width.clamp(caps.min_extent.width, caps.max_extent.width),
        height: framebuffer.height.clamp(caps.min_extent.height, caps.max_extent.height),
    }
}

pub fn choose_image_count(caps: &SurfaceCapabilities) -> u32 {
    let wanted = caps.min_image_count + 1;
    if caps.max_image_count > 0 {
        wanted.min(caps.max_image_count)
    } else {
        wanted
    }
}

pub fn choose_depth_format(
    supported: &[DepthFormat],
    preferred: &[DepthFormat],
) -> Option<DepthFormat> {
    preferred.iter().copied().find(|d| supported.contains(d))
}

pub fn negotiate(
    support: &SurfaceSupport,
    framebuffer: Extent,
    preferences: &SwapPreferences,
) -> Result<SwapConfig, FatalError> {
    let format = choose_surface_format(&support.formats, preferences.format)
        .ok_or_else(|| FatalError::Swapchain("surface reports no formats".to_string()))?;
    let depth_format = choose_depth_format(&support.depth_formats, &preferences.depth_formats)
        .ok_or_else(|| FatalError::Swapchain("no supported depth format".to_string()))?;

    Ok(SwapConfig {
        format,
        present_mode: choose_present_mode(&support.present_modes, &preferences.present_modes),
        extent: choose_extent(&support.capabilities, framebuffer),
        image_count: choose_image_count(&support.capabilities),
        depth_format,
    })
}

// ====================== swap chain ===================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecreateOutcome {
    Rebuilt,
    /// extent is zero; try again on a later frame
    Deferred,
}

pub struct SwapChain<B: Backend> {
    target: Option<B::SwapTarget>,
    config: Option<SwapConfig>,
    preferences: SwapPreferences,
    stale: bool,
    resized: bool,
    generation: u64,
}

impl<B: Backend> SwapChain<B> {
    /// Builds the first chain. A minimized window leaves it stale, to be
    /// rebuilt once the extent becomes non-zero.
    pub fn new(
        backend: &B,
        framebuffer: Extent,
        preferences: SwapPreferences,
    ) -> Result<Self, FatalError> {
        let mut swap = Self {
            target: None,
            config: None,
            preferences,
            stale: true,
            resized: false,
            generation: 0,
        };
        swap.recreate(backend, framebuffer)?;
        Ok(swap)
    }

    pub fn config(&self) -> Option<&SwapConfig> {
        self.config.as_ref()
    }

    pub fn extent(&self) -> Option<Extent> {
        self.config.map(|c| c.extent)
    }

    pub fn target(&self) -> Option<&B::SwapTarget> {
        self.target.as_ref()
    }

    /// Bumped on every successful rebuild.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_stale(&self) -> bool {
        self.stale || self.target.is_none()
    }

    pub fn mark_stale(&mut self) {
        self.stale = true;
    }

    /// Called from the window collaborator's resize notification.
    pub fn notify_resized(&mut self) {
        self.resized = true;
    }

    pub fn take_resized(&mut self) -> bool {
        std::mem::take(&mut self.resized)
    }

    pub fn acquire_next_image(
        &mut self,
        backend: &B,
        timeout: Duration,
        signal: &B::Semaphore,
    ) -> Result<AcquireStatus, FatalError> {
        let Some(target) = self.target.as_mut() else {
            self.stale = true;
            return Ok(AcquireStatus::OutOfDate);
        };
        let status = backend.acquire_next_image(target, timeout, signal)?;
        if status == AcquireStatus::OutOfDate {
            self.stale = true;
        }
        Ok(status)
    }

    pub fn present(
        &mut self,
        backend: &B,
        image: u32,
        wait: &B::Semaphore,
    ) -> Result<PresentStatus, FatalError> {
        let Some(target) = self.target.as_mut() else {
            return Err(FatalError::InvariantViolation(
                "present without a swap target".to_string(),
            ));
        };
        let status = backend.present(target, image, wait)?;
        if status != PresentStatus::Presented {
            self.stale = true;
        }
        Ok(status)
    }

    /// Drains the device, drops the old chain and builds a new one against
    /// the current surface. Safe to call repeatedly.
    pub fn recreate(
        &mut self,
        backend: &B,
        framebuffer: Extent,
    ) -> Result<RecreateOutcome, FatalError> {
        let support = backend.surface_support()?;
        let config = negotiate(&support, framebuffer, &self.preferences)?;
        if framebuffer.is_degenerate() || config.extent.is_degenerate() {
            self.stale = true;
            debug!("swap: extent {} is degenerate, deferring rebuild", framebuffer);
            return Ok(RecreateOutcome::Deferred);
        }

        backend.wait_idle()?;
        // old views, depth image and swap object go first
        self.target = None;
        let target = backend.create_swap_target(&config)?;

        self.target = Some(target);
        self.config = Some(config);
        self.stale = false;
        self.resized = false;
        self.generation += 1;

        info!(
            "swap: built {} {:?} {:?}, {} images, depth {:?}",
            config.extent, config.format.format, config.present_mode, config.image_count, config.depth_format
        );
        Ok(RecreateOutcome::Rebuilt)
    }
}
