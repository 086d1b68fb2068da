use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Which part of the renderer gave up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Subsystem {
    Device,
    Swap,
    Resources,
    Pipeline,
    Frame,
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Subsystem::Device => "device",
            Subsystem::Swap => "swap",
            Subsystem::Resources => "resources",
            Subsystem::Pipeline => "pipeline",
            Subsystem::Frame => "frame",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ViewError {
    #[error("index {index} is out of bounds for a view of {len} elements")]
    OutOfBounds { index: usize, len: usize },

    #[error("the buffer behind this view has been destroyed")]
    Invalidated,
}

/// Unrecoverable conditions. Anything that can be handled by skipping a frame
/// or rebuilding the swap chain is reported through [`FrameStatus`] instead.
#[derive(Error, Debug)]
pub enum FatalError {
    #[error("device: validation layer `{0}` was requested but is not available")]
    MissingValidationLayer(String),

    #[error("device: no suitable physical device ({0})")]
    NoSuitableDevice(String),

    #[error("device: failed to open logical device: {0}")]
    DeviceCreation(String),

    #[error("swap: surface error: {0}")]
    Surface(String),

    #[error("swap: {0}")]
    Swapchain(String),

    #[error("resources: allocation of `{label}` failed: {reason}")]
    Allocation { label: String, reason: String },

    #[error("resources: {0}")]
    View(#[from] ViewError),

    #[error("resources: invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("pipeline: shader `{0}` not found")]
    ShaderNotFound(String),

    #[error("pipeline: shader `{name}` failed to compile: {message}")]
    ShaderCompile { name: String, message: String },

    #[error("pipeline: `{label}` creation failed: {reason}")]
    PipelineCreation { label: String, reason: String },

    #[error("frame: fence wait exceeded {0:?}")]
    FenceTimeout(Duration),

    #[error("frame: submission failed: {0}")]
    Submission(String),

    #[error("frame: {0}")]
    InvariantViolation(String),
}

impl FatalError {
    pub fn subsystem(&self) -> Subsystem {
        match self {
            FatalError::MissingValidationLayer(_)
            | FatalError::NoSuitableDevice(_)
            | FatalError::DeviceCreation(_) => Subsystem::Device,
            FatalError::Surface(_) | FatalError::Swapchain(_) => Subsystem::Swap,
            FatalError::Allocation { .. } | FatalError::View(_) | FatalError::InvalidConfig(_) => {
                Subsystem::Resources
            }
            FatalError::ShaderNotFound(_)
            | FatalError::ShaderCompile { .. }
            | FatalError::PipelineCreation { .. } => Subsystem::Pipeline,
            FatalError::FenceTimeout(_)
            | FatalError::Submission(_)
            | FatalError::InvariantViolation(_) => Subsystem::Frame,
        }
    }
}

/// Expected per-frame outcomes. None of these are errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameStatus {
    /// compute, draw and present all went through
    Ok,
    /// the swap chain went stale and has to be rebuilt
    NeedsRecreate,
    /// nothing was submitted this iteration
    Skip,
}
