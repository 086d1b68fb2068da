pub mod app;
pub mod config;
pub mod plugin;

pub mod cpu {
    pub mod bricks;
    pub mod field;
}

pub mod gpu {
    pub mod backend;
    pub mod buffers;
    pub mod device;
    pub mod error;
    pub mod ffi;
    pub mod frame;
    pub mod headless;
    pub mod pipeline;
    pub mod renderer;
    pub mod shaders;
    pub mod swap;
    pub mod wgpu_backend;
}

pub use app::{AppState, Camera, InputResponse, Key, KeyAction, KeyEvent};
pub use config::SimConfig;
pub use gpu::error::{FatalError, FrameStatus};
pub use plugin::{HeadlessOceanPlugin, LegoOceanPlugin, OceanRenderer};
