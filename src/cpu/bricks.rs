// Brick expansion: every field cell owns EXPANSION vertex records (5 triangles).
// A surface cell emits a flat top plus a three-sided stud; everything else is
// parked at the origin with w = 0. lego_ocean.comp.wgsl mirrors this file.
use std::f32::consts::{FRAC_PI_2, TAU};
use std::ops::Range;

use glam::Vec3;

use crate::cpu::field::{FieldMode, GridDims};
use crate::gpu::ffi::{ComputeUniforms, Particle};

pub const EXPANSION: usize = 15;
pub const SOLID_THRESHOLD: f32 = 0.5;

const HALF_BRICK: f32 = 0.5;
const STUD_RADIUS: f32 = 0.25;
const STUD_HEIGHT: f32 = 0.3;
const WAVE_BOB: f32 = 0.1;

#[inline]
fn solid(field: &[f32], i: usize) -> bool {
    field.get(i).is_some_and(|v| *v >= SOLID_THRESHOLD)
}

/// Solid with nothing directly above it (+y).
pub fn is_surface(grid: &GridDims, field: &[f32], i: usize) -> bool {
    if !solid(field, i) {
        return false;
    }
    let g = grid.size as usize;
    let layer = i / (g * g);
    let above = i + g * g;
    !(layer + 1 < g && solid(field, above))
}

#[inline]
fn emit(out: &mut [Particle], a: Vec3, b: Vec3, c: Vec3, normal: Vec3) {
    out[0] = Particle::new(a.to_array(), normal.to_array());
    out[1] = Particle::new(b.to_array(), normal.to_array());
    out[2] = Particle::new(c.to_array(), normal.to_array());
}

/// Writes the EXPANSION records of cell `i` into `out`.
pub fn expand_cell(uniforms: &ComputeUniforms, field: &[f32], i: usize, out: &mut [Particle]) {
    let grid = GridDims {
        size: uniforms.grid_size,
        cells: uniforms.num_cells as usize,
    };
    if !is_surface(&grid, field, i) {
        out[..EXPANSION].fill(Particle::default());
        return;
    }

    let c = grid.coords(i).as_vec3();
    let top = c.y + HALF_BRICK;
    let corner = |dx: f32, dz: f32| Vec3::new(c.x + dx, top, c.z + dz);

    // top face
    let (p00, p01) = (corner(-HALF_BRICK, -HALF_BRICK), corner(-HALF_BRICK, HALF_BRICK));
    let (p11, p10) = (corner(HALF_BRICK, HALF_BRICK), corner(HALF_BRICK, -HALF_BRICK));
    emit(&mut out[0..3], p00, p01, p11, Vec3::Y);
    emit(&mut out[3..6], p00, p11, p10, Vec3::Y);

    // stud
    let bob = if uniforms.field_mode == FieldMode::Waves.id() {
        WAVE_BOB * (3.0 * uniforms.elapsed + c.x).sin()
    } else {
        0.0
    };
    let apex = Vec3::new(c.x, top + STUD_HEIGHT + bob, c.z);
    let base = |k: usize| {
        let theta = FRAC_PI_2 + k as f32 * TAU / 3.0;
        Vec3::new(c.x + STUD_RADIUS * theta.cos(), top, c.z + STUD_RADIUS * theta.sin())
    };
    for k in 0..3 {
        let (a, b) = (base(k), base((k + 1) % 3));
        let normal = (a - b).cross(apex - b).normalize_or_zero();
        let start = 6 + 3 * k;
        emit(&mut out[start..start + 3], b, a, apex, normal);
    }
}

/// Expands `cells` into `out`, which holds exactly `cells.len() * EXPANSION` records.
pub fn expand_range(
    uniforms: &ComputeUniforms,
    field: &[f32],
    cells: Range<usize>,
    out: &mut [Particle],
) {
    debug_assert_eq!(out.len(), cells.len() * EXPANSION);
    for (i, chunk) in cells.zip(out.chunks_exact_mut(EXPANSION)) {
        expand_cell(uniforms, field, i, chunk);
    }
}

/// Host fallback for the whole grid.
pub fn expand_all(uniforms: &ComputeUniforms, field: &[f32], out: &mut Vec<Particle>) {
    let n = uniforms.num_cells as usize;
    out.resize(n * EXPANSION, Particle::default());
    expand_range(uniforms, field, 0..n, out);
}
