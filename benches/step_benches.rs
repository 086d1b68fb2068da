use std::hint::black_box;

use bevy_lego_ocean::app::AppState;
use bevy_lego_ocean::config::SimConfig;
use bevy_lego_ocean::cpu::bricks::expand_all;
use bevy_lego_ocean::cpu::field::{FieldMode, FieldSim, GridDims};
use bevy_lego_ocean::gpu::headless::{HeadlessBackend, HeadlessConfig};
use bevy_lego_ocean::gpu::renderer::Renderer;
use bevy_lego_ocean::gpu::shaders::ShaderLibrary;
use criterion::{Criterion, criterion_group, criterion_main};

const CELLS: usize = 10_000;

fn bench_field(c: &mut Criterion) {
    let grid = GridDims::for_cells(CELLS);

    let mut waves = FieldSim::new(grid, FieldMode::Waves, 0, 6.0);
    let mut t = 0.0;
    c.bench_function("field_waves_10k", |b| {
        b.iter(|| {
            t += 0.016;
            waves.step(black_box(t))
        })
    });

    let mut growth = FieldSim::new(grid, FieldMode::Growth, 7, 6.0);
    c.bench_function("field_growth_10k", |b| b.iter(|| growth.step(black_box(1.0))));
}

fn bench_expand(c: &mut Criterion) {
    let config = SimConfig::small(CELLS as u32);
    let mut state = AppState::new(&config);
    state.field.step(0.0);
    let uniforms = state.compute_uniforms();
    let mut out = Vec::with_capacity(config.particle_records());

    c.bench_function("expand_sphere_10k", |b| {
        b.iter(|| expand_all(&uniforms, black_box(state.field.cells()), &mut out))
    });
}

fn bench_frame(c: &mut Criterion) {
    let config = SimConfig::small(CELLS as u32);
    let device = HeadlessConfig {
        background_steps: 0,
        ..HeadlessConfig::default()
    };
    let Ok(backend) = HeadlessBackend::open(device, &config.device_requirements()) else {
        return;
    };
    let mut state = AppState::new(&config);
    let window = backend.window_extent();
    let Ok(mut renderer) = Renderer::new(
        backend,
        &config,
        &ShaderLibrary::builtin(),
        state.field.cells(),
        window,
    ) else {
        return;
    };

    let mut t = 0.0;
    c.bench_function("headless_frame_10k", |b| {
        b.iter(|| {
            t += 0.016;
            state.advance(t);
            renderer.render_frame(&mut state, window)
        })
    });

    state.cpu_fallback = true;
    c.bench_function("headless_frame_cpu_10k", |b| {
        b.iter(|| {
            t += 0.016;
            state.advance(t);
            renderer.render_frame(&mut state, window)
        })
    });
}

criterion_group!(benches, bench_field, bench_expand, bench_frame);
criterion_main!(benches);
