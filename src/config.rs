use std::path::PathBuf;
use std::time::Duration;

use bevy::prelude::Resource;

use crate::cpu::bricks::EXPANSION;
use crate::cpu::field::{FieldMode, GridDims};
use crate::gpu::buffers::ParticleLayout;
use crate::gpu::device::{DeviceFeatures, DeviceRequirements, VALIDATION_LAYER};
use crate::gpu::error::FatalError;
use crate::gpu::frame::{FRAMES_IN_FLIGHT, FrameTimeouts};
use crate::gpu::swap::Extent;

#[derive(Resource, Clone, Debug)]
pub struct SimConfig {
    pub num_cells: u32,
    pub expansion: u32, // vertex records per cell
    pub frames_in_flight: usize,
    pub fence_timeout: Duration,
    pub acquire_timeout: Duration,
    pub validation: bool,
    pub validation_layer: String,
    pub features: DeviceFeatures,
    pub shader_name: String,
    pub shader_dir: PathBuf,
    pub clear_color: [f32; 4],
    pub window_extent: Extent,
    pub seed: u64,
    pub initial_mode: FieldMode,
    pub initial_radius: f32,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self::lego_ocean()
    }
}

impl SimConfig {
    // 10k cells on a 22^3 grid, two frames in flight
    pub fn lego_ocean() -> Self {
        Self {
            num_cells: 10_000,
            expansion: EXPANSION as u32,
            frames_in_flight: FRAMES_IN_FLIGHT,
            fence_timeout: Duration::from_secs(10),
            acquire_timeout: Duration::from_nanos(u32::MAX as u64),
            validation: cfg!(debug_assertions),
            validation_layer: VALIDATION_LAYER.to_string(),
            features: DeviceFeatures::default(),
            shader_name: "lego_ocean".to_string(),
            shader_dir: PathBuf::from("assets/shaders"),
            clear_color: [0.2, 0.3, 0.3, 1.0],
            window_extent: Extent::new(1920, 1080),
            seed: 0x1e60_0cea,
            initial_mode: FieldMode::SphereSeed,
            initial_radius: 6.0,
        }
    }

    /// Same pipeline, fewer cells and a small window. Used by tests.
    pub fn small(num_cells: u32) -> Self {
        Self {
            num_cells,
            validation: false,
            window_extent: Extent::new(320, 240),
            ..Self::lego_ocean()
        }
    }

    /// Rejects settings no renderer can be built from.
    pub fn validate(&self) -> Result<(), FatalError> {
        if self.frames_in_flight == 0 {
            return Err(FatalError::InvalidConfig("frames_in_flight must be at least 1".to_string()));
        }
        if self.num_cells == 0 {
            return Err(FatalError::InvalidConfig("num_cells must be at least 1".to_string()));
        }
        // the compute shader hardcodes the record count
        if self.expansion as usize != EXPANSION {
            return Err(FatalError::InvalidConfig(format!(
                "expansion is {} but bricks emit {EXPANSION} records",
                self.expansion
            )));
        }
        Ok(())
    }

    pub fn grid(&self) -> GridDims {
        GridDims::for_cells(self.num_cells as usize)
    }

    pub fn particle_layout(&self) -> ParticleLayout {
        ParticleLayout {
            num_cells: self.num_cells,
            expansion: self.expansion,
        }
    }

    pub fn particle_records(&self) -> usize {
        self.particle_layout().records()
    }

    pub fn timeouts(&self) -> FrameTimeouts {
        FrameTimeouts {
            fence: self.fence_timeout,
            acquire: self.acquire_timeout,
        }
    }

    pub fn device_requirements(&self) -> DeviceRequirements {
        DeviceRequirements {
            features: self.features,
            validation_layer: self.validation.then(|| self.validation_layer.clone()),
            ..DeviceRequirements::default()
        }
    }
}
