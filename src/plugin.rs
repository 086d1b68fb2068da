use bevy::input::ButtonState;
use bevy::input::keyboard::KeyboardInput;
use bevy::prelude::*;
use bevy::window::{PrimaryWindow, RawHandleWrapper, WindowResized};

use crate::app::{AppState, InputResponse, Key, KeyAction, KeyEvent};
use crate::config::SimConfig;
use crate::gpu::backend::Backend;
use crate::gpu::error::{FatalError, FrameStatus};
use crate::gpu::headless::{HeadlessBackend, HeadlessConfig};
use crate::gpu::renderer::Renderer;
use crate::gpu::shaders::ShaderLibrary;
use crate::gpu::swap::Extent;
use crate::gpu::wgpu_backend::WgpuBackend;

/// The renderer as an ECS resource. Dropping it tears the device down.
#[derive(Resource)]
pub struct OceanRenderer<B: Backend>(pub Renderer<B>);

fn build_renderer<B: Backend>(
    backend: B,
    config: &SimConfig,
    framebuffer: Extent,
) -> Result<(Renderer<B>, AppState), FatalError> {
    let state = AppState::new(config);
    let library = ShaderLibrary::builtin().with_root(&config.shader_dir);
    let renderer = Renderer::new(backend, config, &library, state.field.cells(), framebuffer)?;
    Ok((renderer, state))
}

fn report_fatal(err: &FatalError, exit: &mut EventWriter<AppExit>) {
    error!(subsystem = %err.subsystem(), "{err}");
    exit.write(AppExit::error());
}

fn render<B: Backend>(
    renderer: &mut Renderer<B>,
    state: &mut AppState,
    framebuffer: Extent,
    exit: &mut EventWriter<AppExit>,
) -> Option<FrameStatus> {
    match renderer.render_frame(state, framebuffer) {
        Ok(status) => Some(status),
        Err(err) => {
            report_fatal(&err, exit);
            None
        }
    }
}

fn map_key(code: KeyCode) -> Option<Key> {
    let key = match code {
        KeyCode::KeyW => Key::W,
        KeyCode::KeyA => Key::A,
        KeyCode::KeyS => Key::S,
        KeyCode::KeyD => Key::D,
        KeyCode::KeyQ => Key::Q,
        KeyCode::KeyE => Key::E,
        KeyCode::ArrowLeft => Key::Left,
        KeyCode::ArrowRight => Key::Right,
        KeyCode::ArrowUp => Key::Up,
        KeyCode::ArrowDown => Key::Down,
        KeyCode::Escape => Key::Escape,
        KeyCode::Digit0 => Key::Digit(0),
        KeyCode::Digit1 => Key::Digit(1),
        KeyCode::Digit2 => Key::Digit(2),
        KeyCode::Digit3 => Key::Digit(3),
        KeyCode::Digit4 => Key::Digit(4),
        KeyCode::Digit5 => Key::Digit(5),
        _ => return None,
    };
    Some(key)
}

fn forward_keyboard(
    mut keys: EventReader<KeyboardInput>,
    mut state: ResMut<AppState>,
    mut exit: EventWriter<AppExit>,
) {
    for input in keys.read() {
        let Some(key) = map_key(input.key_code) else {
            continue;
        };
        let action = match (input.state, input.repeat) {
            (ButtonState::Pressed, false) => KeyAction::Press,
            (ButtonState::Pressed, true) => KeyAction::Repeat,
            (ButtonState::Released, _) => KeyAction::Release,
        };
        if state.handle_key(KeyEvent { key, action }) == InputResponse::Close {
            exit.write(AppExit::Success);
        }
    }
}

fn shutdown_on_exit<B: Backend>(
    mut exits: EventReader<AppExit>,
    mut renderer: ResMut<OceanRenderer<B>>,
) {
    if exits.read().next().is_none() {
        return;
    }
    if let Err(err) = renderer.0.shutdown() {
        error!(subsystem = %err.subsystem(), "{err}");
    }
}

// ======================= windowed ====================================

/// Drives the brick ocean on the primary window through wgpu.
///
/// The renderer owns the window surface, so bevy's own renderer must not
/// create one (see `demos/lego_ocean.rs`).
pub struct LegoOceanPlugin {
    pub config: SimConfig,
}

impl Default for LegoOceanPlugin {
    fn default() -> Self {
        Self {
            config: SimConfig::default(),
        }
    }
}

impl Plugin for LegoOceanPlugin {
    fn build(&self, app: &mut App) {
        type Ready = OceanRenderer<WgpuBackend>;

        app.insert_resource(self.config.clone())
            .add_systems(Update, init_window_renderer.run_if(not(resource_exists::<Ready>)))
            .add_systems(
                Update,
                (forward_keyboard, forward_resize, draw_window_frame)
                    .chain()
                    .run_if(resource_exists::<Ready>),
            )
            .add_systems(Last, shutdown_on_exit::<WgpuBackend>.run_if(resource_exists::<Ready>));
    }
}

fn framebuffer(window: &Window) -> Extent {
    Extent::new(window.physical_width(), window.physical_height())
}

fn init_window_renderer(
    mut commands: Commands,
    config: Res<SimConfig>,
    windows: Query<(&Window, &RawHandleWrapper), With<PrimaryWindow>>,
    mut exit: EventWriter<AppExit>,
) {
    // the handle shows up once winit has created the window
    let Ok((window, handle)) = windows.single() else {
        return;
    };
    let result = WgpuBackend::open(handle, &config.device_requirements())
        .and_then(|backend| build_renderer(backend, &config, framebuffer(window)));
    match result {
        Ok((renderer, state)) => {
            commands.insert_resource(OceanRenderer(renderer));
            commands.insert_resource(state);
        }
        Err(err) => report_fatal(&err, &mut exit),
    }
}

fn forward_resize(
    mut resized: EventReader<WindowResized>,
    mut renderer: ResMut<OceanRenderer<WgpuBackend>>,
) {
    if resized.read().count() > 0 {
        renderer.0.notify_resized();
    }
}

fn draw_window_frame(
    time: Res<Time>,
    windows: Query<&Window, With<PrimaryWindow>>,
    mut renderer: ResMut<OceanRenderer<WgpuBackend>>,
    mut state: ResMut<AppState>,
    mut exit: EventWriter<AppExit>,
) {
    if state.close_requested {
        return;
    }
    // closing the window removes it; the exit event is already on its way
    let Ok(window) = windows.single() else {
        return;
    };
    state.advance(time.elapsed_secs());
    render(&mut renderer.0, &mut state, framebuffer(window), &mut exit);
}

// ======================= headless ====================================

/// Runs the same loop against [`HeadlessBackend`] for a fixed number of
/// frames, then exits and logs what the software device observed.
pub struct HeadlessOceanPlugin {
    pub config: SimConfig,
    pub device: HeadlessConfig,
    pub frames: u64,
    /// Simulated seconds per frame.
    pub step: f32,
}

impl Default for HeadlessOceanPlugin {
    fn default() -> Self {
        Self {
            config: SimConfig::small(2_000),
            device: HeadlessConfig::default(),
            frames: 120,
            step: 1.0 / 60.0,
        }
    }
}

#[derive(Resource, Clone, Debug)]
pub struct HeadlessRun {
    pub device: HeadlessConfig,
    pub remaining: u64,
    pub step: f32,
    pub elapsed: f32,
    pub last_status: Option<FrameStatus>,
}

impl Plugin for HeadlessOceanPlugin {
    fn build(&self, app: &mut App) {
        type Ready = OceanRenderer<HeadlessBackend>;

        app.insert_resource(self.config.clone())
            .insert_resource(HeadlessRun {
                device: self.device.clone(),
                remaining: self.frames,
                step: self.step,
                elapsed: 0.0,
                last_status: None,
            })
            .add_systems(Startup, init_headless_renderer)
            .add_systems(Update, draw_headless_frame.run_if(resource_exists::<Ready>))
            .add_systems(
                Last,
                (shutdown_on_exit::<HeadlessBackend>, log_headless_report)
                    .chain()
                    .run_if(resource_exists::<Ready>),
            );
    }
}

fn init_headless_renderer(
    mut commands: Commands,
    config: Res<SimConfig>,
    run: Res<HeadlessRun>,
    mut exit: EventWriter<AppExit>,
) {
    let result = HeadlessBackend::open(run.device.clone(), &config.device_requirements())
        .and_then(|backend| {
            let window = backend.window_extent();
            build_renderer(backend, &config, window)
        });
    match result {
        Ok((renderer, state)) => {
            commands.insert_resource(OceanRenderer(renderer));
            commands.insert_resource(state);
        }
        Err(err) => report_fatal(&err, &mut exit),
    }
}

fn draw_headless_frame(
    mut run: ResMut<HeadlessRun>,
    mut renderer: ResMut<OceanRenderer<HeadlessBackend>>,
    mut state: ResMut<AppState>,
    mut exit: EventWriter<AppExit>,
) {
    if run.remaining == 0 {
        return;
    }
    run.remaining -= 1;
    run.elapsed += run.step;
    state.advance(run.elapsed);

    let window = renderer.0.backend().window_extent();
    run.last_status = render(&mut renderer.0, &mut state, window, &mut exit);
    if run.remaining == 0 {
        exit.write(AppExit::Success);
    }
}

fn log_headless_report(
    mut exits: EventReader<AppExit>,
    renderer: Res<OceanRenderer<HeadlessBackend>>,
) {
    if exits.read().next().is_none() {
        return;
    }
    let stats = renderer.0.stats();
    let report = renderer.0.backend().report();
    info!(
        "headless: {} frames, {} presented, {} skipped, {} dispatches, {} swap builds",
        stats.frames, stats.presented, stats.skipped, stats.dispatches, report.swap_builds
    );
    if report.is_clean() {
        info!("headless: no synchronization findings");
    } else {
        warn!(
            "headless: {} torn reads, {} hazards, {} violations",
            report.torn_reads,
            report.hazards.len(),
            report.violations.len()
        );
    }
}
