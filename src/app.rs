// explicit application state: camera, field simulation and input handling
use bevy::log::info;
use bevy::prelude::Resource;
use glam::{Mat4, Vec3};

use crate::config::SimConfig;
use crate::cpu::field::{FieldMode, FieldSim};
use crate::gpu::ffi::{ComputeUniforms, Transform};

const MOVE_STEP: f32 = 1.0;
const TURN_STEP: f32 = 0.1;
const PITCH_LIMIT: f32 = 1.5;
const MODEL_SCALE: f32 = 0.5;
const FOV_Y_DEGREES: f32 = 45.0;
const Z_NEAR: f32 = 0.1;
const Z_FAR: f32 = 1000.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Key {
    W,
    A,
    S,
    D,
    Q,
    E,
    Left,
    Right,
    Up,
    Down,
    Digit(u8),
    Escape,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyAction {
    Press,
    Repeat,
    Release,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeyEvent {
    pub key: Key,
    pub action: KeyAction,
}

impl KeyEvent {
    pub fn press(key: Key) -> Self {
        Self { key, action: KeyAction::Press }
    }

    pub fn release(key: Key) -> Self {
        Self { key, action: KeyAction::Release }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputResponse {
    None,
    Close,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Camera {
    pub pos: Vec3,
    pub fwd: Vec3,
    pub yaw: f32,
    pub pitch: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            pos: Vec3::new(40.0, 40.0, -160.0),
            fwd: Vec3::Z,
            yaw: 0.0,
            pitch: 0.0,
        }
    }
}

impl Camera {
    #[inline]
    fn right(&self) -> Vec3 {
        self.fwd.cross(Vec3::Y).normalize_or_zero()
    }

    pub fn turn(&mut self, d_yaw: f32, d_pitch: f32) {
        self.yaw += d_yaw;
        self.pitch = (self.pitch + d_pitch).clamp(-PITCH_LIMIT, PITCH_LIMIT);
        self.fwd = Vec3::new(
            self.pitch.cos() * self.yaw.sin(),
            self.pitch.sin(),
            self.pitch.cos() * self.yaw.cos(),
        );
    }

    pub fn view(&self) -> Mat4 {
        Mat4::look_at_rh(self.pos, self.pos + self.fwd, Vec3::Y)
    }
}

#[derive(Resource, Clone, Debug)]
pub struct AppState {
    pub camera: Camera,
    pub field: FieldSim,
    pub cpu_fallback: bool,
    pub elapsed: f32,
    pub close_requested: bool,
}

impl AppState {
    pub fn new(config: &SimConfig) -> Self {
        Self {
            camera: Camera::default(),
            field: FieldSim::new(config.grid(), config.initial_mode, config.seed, config.initial_radius),
            cpu_fallback: false,
            elapsed: 0.0,
            close_requested: false,
        }
    }

    pub fn advance(&mut self, elapsed: f32) {
        self.elapsed = elapsed;
    }

    pub fn handle_key(&mut self, event: KeyEvent) -> InputResponse {
        let held = matches!(event.action, KeyAction::Press | KeyAction::Repeat);
        let released = event.action == KeyAction::Release;
        let cam = &mut self.camera;

        match event.key {
            Key::W if held => cam.pos += cam.fwd * MOVE_STEP,
            Key::S if held => cam.pos -= cam.fwd * MOVE_STEP,
            Key::A if held => cam.pos -= cam.right() * MOVE_STEP,
            Key::D if held => cam.pos += cam.right() * MOVE_STEP,
            Key::Q if held => cam.pos += Vec3::Y * MOVE_STEP,
            Key::E if held => cam.pos -= Vec3::Y * MOVE_STEP,
            Key::Left if held => cam.turn(TURN_STEP, 0.0),
            Key::Right if held => cam.turn(-TURN_STEP, 0.0),
            Key::Up if held => cam.turn(0.0, TURN_STEP),
            Key::Down if held => cam.turn(0.0, -TURN_STEP),
            Key::Digit(5) if released => {
                self.cpu_fallback = !self.cpu_fallback;
                info!("input: cpu fallback {}", if self.cpu_fallback { "on" } else { "off" });
            }
            Key::Digit(d) if released => {
                if let Some(mode) = FieldMode::from_digit(d) {
                    info!("input: field mode {mode:?}");
                    self.field.set_mode(mode);
                }
            }
            Key::Escape if held => {
                self.close_requested = true;
                return InputResponse::Close;
            }
            _ => {}
        }
        InputResponse::None
    }

    pub fn transform(&self, aspect: f32) -> Transform {
        let proj = Mat4::perspective_rh(FOV_Y_DEGREES.to_radians(), aspect, Z_NEAR, Z_FAR);
        Transform {
            model: Mat4::from_scale(Vec3::splat(MODEL_SCALE)).to_cols_array_2d(),
            view: self.camera.view().to_cols_array_2d(),
            proj: proj.to_cols_array_2d(),
            wave: u32::from(self.field.mode() == FieldMode::Waves),
            _pad: [0; 3],
        }
    }

    pub fn compute_uniforms(&self) -> ComputeUniforms {
        let grid = self.field.grid();
        ComputeUniforms {
            elapsed: self.elapsed,
            field_mode: self.field.mode().id(),
            grid_size: grid.size,
            num_cells: grid.cells as u32,
        }
    }
}
