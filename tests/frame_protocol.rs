use std::time::Duration;

use bevy_lego_ocean::app::{AppState, Key, KeyEvent};
use bevy_lego_ocean::config::SimConfig;
use bevy_lego_ocean::cpu::bricks::EXPANSION;
use bevy_lego_ocean::gpu::backend::{
    AcquireStatus, Backend, ComputeJob, DrawJob, SemaphoreWait, WaitStage,
};
use bevy_lego_ocean::gpu::buffers::FrameResources;
use bevy_lego_ocean::gpu::device::DeviceRequirements;
use bevy_lego_ocean::gpu::error::{FatalError, FrameStatus, Subsystem};
use bevy_lego_ocean::gpu::frame::SlotState;
use bevy_lego_ocean::gpu::headless::{
    FenceEvent, FenceEventKind, HeadlessBackend, HeadlessConfig, HeadlessReport, WriteTag,
};
use bevy_lego_ocean::gpu::pipeline::Pipelines;
use bevy_lego_ocean::gpu::renderer::Renderer;
use bevy_lego_ocean::gpu::shaders::{ShaderLibrary, ShaderSet};
use bevy_lego_ocean::gpu::swap::{Extent, SwapChain, SwapPreferences};

const TIMEOUT: Duration = Duration::from_secs(1);
// 2000 cells -> 13^3 grid; the radius-4 seed has 49 columns, one surface brick each
const CELLS: u32 = 2_000;
const SURFACE_RECORDS: usize = 49 * EXPANSION;

fn open(device: HeadlessConfig) -> (Renderer<HeadlessBackend>, AppState, SimConfig) {
    let config = SimConfig::small(CELLS);
    let backend = HeadlessBackend::open(device, &config.device_requirements()).unwrap();
    let state = AppState::new(&config);
    let window = backend.window_extent();
    let renderer = Renderer::new(
        backend,
        &config,
        &ShaderLibrary::builtin(),
        state.field.cells(),
        window,
    )
    .unwrap();
    (renderer, state, config)
}

fn frame(renderer: &mut Renderer<HeadlessBackend>, state: &mut AppState, t: f32) -> FrameStatus {
    state.advance(t);
    let window = renderer.backend().window_extent();
    renderer.render_frame(state, window).unwrap()
}

/// Host never resets a fence it has not seen signal, never submits an
/// unreset fence, and every signal follows a submit.
fn assert_fence_protocol(history: &[FenceEvent]) {
    let FenceEventKind::Created { signaled } = history[0].kind else {
        panic!("history does not start with creation: {history:?}");
    };
    let (mut signaled, mut pending, mut seen) = (signaled, false, signaled);
    for pair in history.windows(2) {
        assert!(pair[0].at < pair[1].at, "events out of order: {pair:?}");
    }
    for event in &history[1..] {
        match event.kind {
            FenceEventKind::WaitReturned => {
                assert!(signaled, "wait returned on an unsignaled fence");
                seen = true;
            }
            FenceEventKind::Reset => {
                assert!(!pending && seen, "reset before the signal was observed: {history:?}");
                signaled = false;
                seen = false;
            }
            FenceEventKind::Submitted => {
                assert!(!signaled && !pending, "submit with an unreset fence: {history:?}");
                pending = true;
            }
            FenceEventKind::Signaled => {
                assert!(pending, "signal without a submission");
                pending = false;
                signaled = true;
            }
            FenceEventKind::Created { .. } => panic!("fence created twice"),
        }
    }
}

/// Every draw sees the most recent finished compute into its vertex buffer.
fn assert_draws_see_latest_compute(report: &HeadlessReport) {
    for draw in &report.draws {
        let latest = report
            .computes
            .iter()
            .filter(|c| c.target == draw.vertex_buffer && c.submission < draw.submission)
            .map(|c| c.submission)
            .max()
            .expect("draw without a preceding compute");
        assert_eq!(draw.observed, Some(WriteTag::Compute { submission: latest }), "{draw:?}");
        assert!(!draw.torn);
    }
}

#[test]
fn frames_run_clean_across_both_slots() {
    let (mut renderer, mut state, _) = open(HeadlessConfig::default());
    assert_eq!(renderer.frames().frames_in_flight(), 2);

    for n in 0..8 {
        assert_eq!(renderer.frames().current_slot(), n % 2);
        let status = frame(&mut renderer, &mut state, n as f32 / 60.0);
        assert_eq!(status, FrameStatus::Ok);
        assert_eq!(renderer.frames().slot_state(n % 2), SlotState::Presented);
    }
    renderer.shutdown().unwrap();

    let stats = renderer.stats();
    assert_eq!((stats.frames, stats.presented, stats.dispatches), (8, 8, 8));
    assert_eq!(stats.skipped, 0);

    let report = renderer.backend().report();
    assert!(report.is_clean(), "{report:?}");
    assert_eq!(report.draws.len(), 8);
    assert_eq!(report.presented, 8);
    assert_draws_see_latest_compute(&report);
    assert!(report.draws.iter().all(|d| d.visible == SURFACE_RECORDS));

    // consecutive frames alternate particle buffers
    assert_ne!(report.draws[0].vertex_buffer, report.draws[1].vertex_buffer);
    assert_eq!(report.draws[0].vertex_buffer, report.draws[2].vertex_buffer);
}

#[test]
fn fences_follow_the_slot_protocol_and_end_signaled() {
    let device = HeadlessConfig {
        compute_steps: 6,
        background_steps: 0,
        ..HeadlessConfig::default()
    };
    let (mut renderer, mut state, _) = open(device);
    for n in 0..10 {
        frame(&mut renderer, &mut state, n as f32 * 0.1);
    }
    renderer.shutdown().unwrap();

    let backend = renderer.backend();
    for i in 0..renderer.frames().frames_in_flight() {
        let slot = renderer.frames().slot(i);
        assert!(backend.fence_signaled(slot.graphics_fence()));
        assert!(backend.fence_signaled(slot.compute_fence()));
        assert_eq!(slot.state(), SlotState::Idle);
        assert_fence_protocol(&backend.fence_history(slot.graphics_fence()));
        assert_fence_protocol(&backend.fence_history(slot.compute_fence()));
    }
    assert_eq!(backend.pending_submissions(), 0);
    assert!(backend.report().is_clean());
}

#[test]
fn slow_compute_never_tears_a_draw() {
    let device = HeadlessConfig {
        compute_steps: 32,
        background_steps: 3,
        ..HeadlessConfig::default()
    };
    let (mut renderer, mut state, _) = open(device);
    state.handle_key(KeyEvent::release(Key::Digit(3)));
    for n in 0..12 {
        assert_eq!(frame(&mut renderer, &mut state, n as f32 * 0.05), FrameStatus::Ok);
    }
    renderer.shutdown().unwrap();

    let report = renderer.backend().report();
    assert_eq!(report.torn_reads, 0);
    assert!(report.is_clean(), "{report:?}");
    assert_draws_see_latest_compute(&report);
}

#[test]
fn cpu_fallback_skips_dispatch_and_draws_host_records() {
    let (mut renderer, mut state, _) = open(HeadlessConfig::default());
    frame(&mut renderer, &mut state, 0.0);
    frame(&mut renderer, &mut state, 0.1);

    state.handle_key(KeyEvent::release(Key::Digit(5)));
    assert!(state.cpu_fallback);
    for n in 2..8 {
        assert_eq!(frame(&mut renderer, &mut state, n as f32 * 0.1), FrameStatus::Ok);
    }
    renderer.shutdown().unwrap();

    let stats = renderer.stats();
    assert_eq!(stats.dispatches, 2);
    assert_eq!(stats.host_updates, 6);

    let report = renderer.backend().report();
    assert!(report.is_clean(), "{report:?}");
    assert_eq!(report.computes.len(), 2);
    for draw in &report.draws[2..] {
        assert_eq!(draw.observed, Some(WriteTag::Host));
        assert_eq!(draw.visible, SURFACE_RECORDS);
    }

    // the slot's mapped records are what the device drew
    let last = (renderer.frames().current_slot() + 1) % 2;
    let host = renderer.resources().particles_view(last).read_all().unwrap();
    let device: Vec<_> = renderer
        .backend()
        .device_contents(renderer.resources().particle_buffer(last));
    assert_eq!(host, device);
}

#[test]
fn toggling_back_to_the_device_path_resumes_dispatch() {
    let (mut renderer, mut state, _) = open(HeadlessConfig::default());
    state.handle_key(KeyEvent::release(Key::Digit(5)));
    frame(&mut renderer, &mut state, 0.0);
    frame(&mut renderer, &mut state, 0.1);
    state.handle_key(KeyEvent::release(Key::Digit(5)));
    assert!(!state.cpu_fallback);
    frame(&mut renderer, &mut state, 0.2);
    renderer.shutdown().unwrap();

    let report = renderer.backend().report();
    assert!(report.is_clean(), "{report:?}");
    assert_eq!(report.computes.len(), 1);
    let last = report.draws.last().unwrap();
    assert!(matches!(last.observed, Some(WriteTag::Compute { .. })));
}

#[test]
fn minimized_window_skips_without_hanging() {
    let (mut renderer, mut state, _) = open(HeadlessConfig::default());
    for n in 0..3 {
        assert_eq!(frame(&mut renderer, &mut state, n as f32), FrameStatus::Ok);
    }

    renderer.backend().set_window_extent(Extent::new(0, 0));
    assert_eq!(frame(&mut renderer, &mut state, 3.0), FrameStatus::NeedsRecreate);
    for n in 4..10 {
        assert_eq!(frame(&mut renderer, &mut state, n as f32), FrameStatus::Skip);
    }

    let restored = Extent::new(800, 600);
    renderer.backend().set_window_extent(restored);
    for n in 10..14 {
        assert_eq!(frame(&mut renderer, &mut state, n as f32), FrameStatus::Ok);
    }
    assert_eq!(renderer.swap().extent(), Some(restored));
    renderer.shutdown().unwrap();

    let stats = renderer.stats();
    assert_eq!(stats.skipped, 1);
    assert_eq!(stats.recreate_requests, 1);
    assert_eq!(stats.presented, 7);

    let report = renderer.backend().report();
    assert!(report.is_clean(), "{report:?}");
    assert_eq!(report.swap_builds, 2);
}

#[test]
fn acquire_timeout_skips_and_drains_the_compute_signal() {
    let (mut renderer, mut state, _) = open(HeadlessConfig::default());
    let images = renderer.swap().config().unwrap().image_count as u64;

    // the compositor keeps every presented image
    renderer.backend().hold_presented_images(true);
    for n in 0..images {
        assert_eq!(frame(&mut renderer, &mut state, n as f32), FrameStatus::Ok);
    }
    let slot = renderer.frames().current_slot();
    assert_eq!(frame(&mut renderer, &mut state, 10.0), FrameStatus::Skip);
    assert_eq!(renderer.frames().current_slot(), (slot + 1) % 2);
    assert_eq!(renderer.frames().slot_state(slot), SlotState::Idle);

    let stats = renderer.stats();
    assert_eq!(stats.skipped, 1);
    assert_eq!(stats.recreate_requests, 0);
    assert_eq!((stats.dispatches, stats.presented), (images + 1, images));
    assert_eq!(renderer.backend().report().hazards, Vec::<String>::new());

    renderer.backend().hold_presented_images(false);
    for n in 11..15 {
        assert_eq!(frame(&mut renderer, &mut state, n as f32), FrameStatus::Ok);
    }
    renderer.shutdown().unwrap();
    assert_eq!(renderer.stats().presented, images + 4);

    let report = renderer.backend().report();
    assert!(report.is_clean(), "{report:?}");
    assert_eq!(report.swap_builds, 1);
}

#[test]
fn resize_rebuilds_once_and_continues() {
    let (mut renderer, mut state, _) = open(HeadlessConfig::default());
    frame(&mut renderer, &mut state, 0.0);
    let generation = renderer.swap().generation();

    renderer.backend().set_window_extent(Extent::new(1024, 768));
    assert_eq!(frame(&mut renderer, &mut state, 0.1), FrameStatus::NeedsRecreate);
    assert_eq!(renderer.swap().generation(), generation + 1);
    assert_eq!(frame(&mut renderer, &mut state, 0.2), FrameStatus::Ok);
    assert_eq!(renderer.swap().extent(), Some(Extent::new(1024, 768)));
    renderer.shutdown().unwrap();
    assert!(renderer.backend().report().is_clean());
}

#[test]
fn resize_notification_marks_the_chain_stale() {
    let (mut renderer, mut state, _) = open(HeadlessConfig::default());
    frame(&mut renderer, &mut state, 0.0);
    let generation = renderer.swap().generation();

    renderer.notify_resized();
    assert_eq!(frame(&mut renderer, &mut state, 0.1), FrameStatus::NeedsRecreate);
    assert_eq!(renderer.swap().generation(), generation + 1);
    assert_eq!(frame(&mut renderer, &mut state, 0.2), FrameStatus::Ok);
    renderer.shutdown().unwrap();
    assert!(renderer.backend().report().is_clean());
}

#[test]
fn waiting_on_a_fence_nothing_will_signal_is_fatal() {
    let backend = HeadlessBackend::open(HeadlessConfig::default(), &DeviceRequirements::default())
        .unwrap();
    let fence = backend.create_fence(false).unwrap();
    let err = backend.wait_fence(&fence, TIMEOUT).unwrap_err();
    assert!(matches!(err, FatalError::FenceTimeout(_)));
    assert!(err.to_string().starts_with("frame:"));
}

#[test]
fn missing_semaphore_wait_is_caught_as_a_torn_read() {
    // a draw that skips the compute semaphore wait races the dispatch
    let device = HeadlessConfig {
        compute_steps: 8,
        ..HeadlessConfig::default()
    };
    let config = SimConfig::small(CELLS);
    let backend = HeadlessBackend::open(device, &config.device_requirements()).unwrap();
    let mut state = AppState::new(&config);
    state.field.step(0.0);

    let resources = FrameResources::new(&backend, 1, config.particle_layout(), state.field.cells())
        .unwrap();
    resources.update_compute(&state.compute_uniforms()).unwrap();
    resources.flush_compute_inputs(&backend, 0).unwrap();

    let shaders = ShaderSet::load(&backend, &ShaderLibrary::builtin(), &config.shader_name).unwrap();
    let mut swap = SwapChain::new(&backend, backend.window_extent(), SwapPreferences::default())
        .unwrap();
    let swap_config = *swap.config().unwrap();
    let pipelines = Pipelines::new(&backend, &shaders, &resources, &swap_config).unwrap();

    let compute_done = backend.create_semaphore().unwrap();
    let image_available = backend.create_semaphore().unwrap();
    let render_done = backend.create_semaphore().unwrap();
    let mut compute_fence = backend.create_fence(false).unwrap();
    let mut draw_fence = backend.create_fence(false).unwrap();

    let reads = [resources.compute_buffer(0), resources.field_buffer()];
    let writes = [resources.particle_buffer(0)];
    let compute = ComputeJob {
        pipeline: pipelines.compute_pipeline(),
        bind_group: pipelines.compute_bind_group(0),
        workgroups: pipelines.workgroups(),
        reads: &reads,
        writes: &writes,
    };
    backend.submit_compute(&compute, &compute_done, &mut compute_fence).unwrap();

    let AcquireStatus::Acquired { image, .. } = swap
        .acquire_next_image(&backend, TIMEOUT, &image_available)
        .unwrap()
    else {
        panic!("acquire failed");
    };
    let uniforms = [resources.transform_buffer(0)];
    let draw = DrawJob {
        pipeline: pipelines.graphics_pipeline(),
        bind_group: pipelines.draw_bind_group(0),
        uniforms: &uniforms,
        vertex_buffer: resources.particle_buffer(0),
        vertex_count: resources.layout().records() as u32,
        target: swap.target().unwrap(),
        image,
        clear_color: config.clear_color,
    };
    let waits = [SemaphoreWait {
        semaphore: &image_available,
        stage: WaitStage::ColorAttachmentOutput,
    }];
    backend.submit_draw(&draw, &waits, &render_done, &mut draw_fence).unwrap();

    backend.wait_fence(&draw_fence, TIMEOUT).unwrap();
    backend.wait_fence(&compute_fence, TIMEOUT).unwrap();
    let report = backend.report();
    assert!(report.torn_reads >= 1, "{report:?}");
    assert!(report.draws[0].torn);
}

#[test]
fn configs_without_frame_slots_are_rejected() {
    let config = SimConfig {
        frames_in_flight: 0,
        ..SimConfig::small(CELLS)
    };
    let backend = HeadlessBackend::open(HeadlessConfig::default(), &config.device_requirements()).unwrap();
    let state = AppState::new(&config);
    let window = backend.window_extent();
    let err = Renderer::new(backend, &config, &ShaderLibrary::builtin(), state.field.cells(), window)
        .err()
        .unwrap();
    assert!(matches!(err, FatalError::InvalidConfig(_)), "{err}");
    assert_eq!(err.subsystem(), Subsystem::Resources);

    let mismatched = SimConfig {
        expansion: 6,
        ..SimConfig::small(CELLS)
    };
    assert!(matches!(mismatched.validate(), Err(FatalError::InvalidConfig(_))));
    assert!(SimConfig::small(CELLS).validate().is_ok());
    assert!(SimConfig::default().validate().is_ok());
}
