use bevy::log::{error, info};

use crate::app::AppState;
use crate::config::SimConfig;
use crate::cpu::bricks;
use crate::gpu::backend::Backend;
use crate::gpu::buffers::FrameResources;
use crate::gpu::error::{FatalError, FrameStatus};
use crate::gpu::ffi::{ComputeUniforms, Particle};
use crate::gpu::frame::{FrameOrchestrator, FrameStats, HostStage, ParticlePath};
use crate::gpu::pipeline::Pipelines;
use crate::gpu::shaders::{ShaderLibrary, ShaderSet};
use crate::gpu::swap::{Extent, RecreateOutcome, SwapChain, SwapPreferences, negotiate};

/// Owns every device resource. Fields are declared in reverse construction
/// order so they drop sync objects first and the backend last.
pub struct Renderer<B: Backend> {
    frames: FrameOrchestrator<B>,
    pipelines: Pipelines<B>,
    swap: SwapChain<B>,
    shaders: ShaderSet<B>,
    resources: FrameResources<B>,
    scratch: Vec<Particle>,
    idle: bool,
    backend: B,
}

// field update + the host side of the cpu fallback
struct SimulationStage<'a> {
    state: &'a mut AppState,
    scratch: &'a mut Vec<Particle>,
    uniforms: ComputeUniforms,
}

impl<B: Backend> HostStage<B> for SimulationStage<'_> {
    fn prepare(
        &mut self,
        slot: usize,
        resources: &FrameResources<B>,
    ) -> Result<ParticlePath, FatalError> {
        self.state.field.step(self.state.elapsed);
        if self.state.field.take_dirty() {
            resources.write_field(self.state.field.cells())?;
        }
        if !self.state.cpu_fallback {
            return Ok(ParticlePath::Device);
        }
        bricks::expand_all(&self.uniforms, self.state.field.cells(), self.scratch);
        resources.particles_view(slot).write_slice(0, self.scratch)?;
        Ok(ParticlePath::Host)
    }
}

impl<B: Backend> Renderer<B> {
    pub fn new(
        backend: B,
        config: &SimConfig,
        library: &ShaderLibrary,
        initial_field: &[f32],
        framebuffer: Extent,
    ) -> Result<Self, FatalError> {
        config.validate()?;
        let resources = FrameResources::new(
            &backend,
            config.frames_in_flight,
            config.particle_layout(),
            initial_field,
        )?;
        let shaders = ShaderSet::load(&backend, library, &config.shader_name)?;

        let preferences = SwapPreferences::default();
        // pipelines need the attachment formats even if the window starts minimized
        let formats = negotiate(&backend.surface_support()?, framebuffer, &preferences)?;
        let swap = SwapChain::new(&backend, framebuffer, preferences)?;
        let pipelines = Pipelines::new(&backend, &shaders, &resources, swap.config().unwrap_or(&formats))?;
        let frames = FrameOrchestrator::new(
            &backend,
            config.frames_in_flight,
            config.timeouts(),
            config.clear_color,
        )?;

        info!(
            "renderer: ready on {} with {} frames in flight",
            backend.selection().name,
            frames.frames_in_flight()
        );

        Ok(Self {
            frames,
            pipelines,
            swap,
            shaders,
            resources,
            scratch: Vec::with_capacity(config.particle_records()),
            idle: false,
            backend,
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn resources(&self) -> &FrameResources<B> {
        &self.resources
    }

    pub fn pipelines(&self) -> &Pipelines<B> {
        &self.pipelines
    }

    pub fn shaders(&self) -> &ShaderSet<B> {
        &self.shaders
    }

    pub fn swap(&self) -> &SwapChain<B> {
        &self.swap
    }

    pub fn frames(&self) -> &FrameOrchestrator<B> {
        &self.frames
    }

    pub fn stats(&self) -> FrameStats {
        self.frames.stats()
    }

    pub fn notify_resized(&mut self) {
        self.swap.notify_resized();
    }

    /// One iteration of the loop. Stale swap chains are rebuilt here; while
    /// the framebuffer is degenerate this keeps returning `Skip`.
    pub fn render_frame(
        &mut self,
        state: &mut AppState,
        framebuffer: Extent,
    ) -> Result<FrameStatus, FatalError> {
        if self.swap.is_stale() && self.rebuild_swap(framebuffer)? == RecreateOutcome::Deferred {
            return Ok(FrameStatus::Skip);
        }
        self.idle = false;

        let aspect = self.swap.extent().unwrap_or(framebuffer).aspect();
        let uniforms = state.compute_uniforms();
        self.resources.update_transform(&state.transform(aspect))?;
        self.resources.update_compute(&uniforms)?;

        let mut stage = SimulationStage {
            state,
            scratch: &mut self.scratch,
            uniforms,
        };
        let status = self.frames.run_frame(
            &self.backend,
            &self.resources,
            &self.pipelines,
            &mut self.swap,
            &mut stage,
        )?;

        if status == FrameStatus::NeedsRecreate {
            self.rebuild_swap(framebuffer)?;
        }
        Ok(status)
    }

    fn rebuild_swap(&mut self, framebuffer: Extent) -> Result<RecreateOutcome, FatalError> {
        let outcome = self.swap.recreate(&self.backend, framebuffer)?;
        if outcome == RecreateOutcome::Deferred {
            return Ok(outcome);
        }
        if let Some(config) = self.swap.config().copied() {
            if !self.pipelines.matches(&config) {
                self.backend.wait_idle()?;
                self.pipelines = Pipelines::new(&self.backend, &self.shaders, &self.resources, &config)?;
                info!("pipeline: rebuilt for {:?}", config.format.format);
            }
        }
        Ok(outcome)
    }

    /// Waits for every slot and the whole device. Nothing is released yet.
    pub fn shutdown(&mut self) -> Result<(), FatalError> {
        self.frames.wait_all(&self.backend)?;
        self.backend.wait_idle()?;
        self.idle = true;
        info!("renderer: device idle after {} frames", self.frames.stats().frames);
        Ok(())
    }
}

impl<B: Backend> Drop for Renderer<B> {
    fn drop(&mut self) {
        if self.idle {
            return;
        }
        if let Err(err) = self.backend.wait_idle() {
            error!("renderer: {err} during teardown");
        }
    }
}
