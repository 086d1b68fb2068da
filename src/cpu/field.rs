// scalar occupancy field on a cubic grid and the policies that drive it
use glam::IVec3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const SEED_RADIUS: f32 = 4.0;
const RANDOM_FILL: f32 = 0.3;
const GROWTH_CHANCE: f32 = 0.999;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GridDims {
    pub size: u32,
    pub cells: usize,
}

impl GridDims {
    /// Smallest cube that holds `cells`: 10000 cells -> 22.
    pub fn for_cells(cells: usize) -> Self {
        let mut size = 1u32;
        while (size as usize).pow(3) < cells {
            size += 1;
        }
        Self { size, cells }
    }

    #[inline]
    pub fn half(&self) -> i32 {
        (self.size / 2) as i32
    }

    /// Linear index -> cell coordinates in `[-size/2, size/2)`.
    #[inline]
    pub fn coords(&self, i: usize) -> IVec3 {
        let g = self.size as usize;
        let h = self.half();
        IVec3::new(
            (i % g) as i32 - h,
            (i / (g * g)) as i32 - h,
            ((i / g) % g) as i32 - h,
        )
    }

    pub fn index(&self, c: IVec3) -> Option<usize> {
        let g = self.size as i32;
        let h = self.half();
        let (x, y, z) = (c.x + h, c.y + h, c.z + h);
        if [x, y, z].iter().any(|v| *v < 0 || *v >= g) {
            return None;
        }
        let i = (y * g * g + z * g + x) as usize;
        (i < self.cells).then_some(i)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldMode {
    SphereSeed,
    PulsingSphere,
    RandomSeed,
    Waves,
    Growth,
}

impl FieldMode {
    pub fn from_digit(digit: u8) -> Option<Self> {
        match digit {
            0 => Some(FieldMode::SphereSeed),
            1 => Some(FieldMode::PulsingSphere),
            2 => Some(FieldMode::RandomSeed),
            3 => Some(FieldMode::Waves),
            4 => Some(FieldMode::Growth),
            _ => None,
        }
    }

    pub fn id(self) -> u32 {
        match self {
            FieldMode::SphereSeed => 0,
            FieldMode::PulsingSphere => 1,
            FieldMode::RandomSeed => 2,
            FieldMode::Waves => 3,
            FieldMode::Growth => 4,
        }
    }
}

// per-cell rules: (cell, time, previous value, random sample) -> new value

#[inline]
fn occupied(hit: bool) -> f32 {
    if hit { 1.0 } else { 0.0 }
}

#[inline]
pub fn sphere_rule(c: IVec3, radius: f32) -> f32 {
    occupied(c.length_squared() as f32 <= radius * radius)
}

#[inline]
pub fn pulse_rule(c: IVec3, t: f32) -> f32 {
    sphere_rule(c, SEED_RADIUS * t.sin().abs())
}

#[inline]
pub fn wave_rule(c: IVec3, t: f32) -> f32 {
    let surface = (c.x as f32 + 3.0 * t).sin() + (c.y as f32 + 3.0 * t).cos();
    occupied((c.z as f32) < surface)
}

#[inline]
pub fn random_rule(sample: f32) -> f32 {
    occupied(sample > RANDOM_FILL)
}

#[inline]
pub fn growth_rule(c: IVec3, half: i32, prev: f32, sample: f32) -> f32 {
    let edge = half - 1;
    if c.x.abs() >= edge || c.y.abs() >= edge || c.z.abs() >= edge {
        return 0.0;
    }
    occupied(prev == 1.0 || sample > GROWTH_CHANCE)
}

fn apply(grid: &GridDims, cells: &mut [f32], mut rule: impl FnMut(IVec3, f32) -> f32) {
    for (i, cell) in cells.iter_mut().enumerate() {
        *cell = rule(grid.coords(i), *cell);
    }
}

pub fn seed_sphere(grid: &GridDims, radius: f32) -> Vec<f32> {
    let mut cells = vec![0.0; grid.cells];
    apply(grid, &mut cells, |c, _| sphere_rule(c, radius));
    cells
}

/// Field update policy. Seed-once policies carry their own `initialized`
/// latch and leave the field untouched after the first step.
#[derive(Clone, Debug)]
pub enum FieldPolicy {
    SphereSeed { initialized: bool },
    PulsingSphere,
    RandomSeed { initialized: bool, rng: StdRng },
    Waves,
    Growth { initialized: bool, rng: StdRng },
}

impl FieldPolicy {
    pub fn new(mode: FieldMode, seed: u64) -> Self {
        match mode {
            FieldMode::SphereSeed => FieldPolicy::SphereSeed { initialized: false },
            FieldMode::PulsingSphere => FieldPolicy::PulsingSphere,
            FieldMode::RandomSeed => FieldPolicy::RandomSeed {
                initialized: false,
                rng: StdRng::seed_from_u64(seed),
            },
            FieldMode::Waves => FieldPolicy::Waves,
            FieldMode::Growth => FieldPolicy::Growth {
                initialized: false,
                rng: StdRng::seed_from_u64(seed),
            },
        }
    }

    pub fn mode(&self) -> FieldMode {
        match self {
            FieldPolicy::SphereSeed { .. } => FieldMode::SphereSeed,
            FieldPolicy::PulsingSphere => FieldMode::PulsingSphere,
            FieldPolicy::RandomSeed { .. } => FieldMode::RandomSeed,
            FieldPolicy::Waves => FieldMode::Waves,
            FieldPolicy::Growth { .. } => FieldMode::Growth,
        }
    }

    pub fn is_initialized(&self) -> bool {
        match self {
            FieldPolicy::SphereSeed { initialized }
            | FieldPolicy::RandomSeed { initialized, .. }
            | FieldPolicy::Growth { initialized, .. } => *initialized,
            FieldPolicy::PulsingSphere | FieldPolicy::Waves => true,
        }
    }

    /// First pass after a mode switch.
    pub fn initialize(&mut self, grid: &GridDims, t: f32, cells: &mut [f32]) {
        match self {
            FieldPolicy::SphereSeed { initialized } => {
                apply(grid, cells, |c, _| sphere_rule(c, SEED_RADIUS));
                *initialized = true;
            }
            FieldPolicy::RandomSeed { initialized, rng } => {
                apply(grid, cells, |_, _| random_rule(rng.r#gen()));
                *initialized = true;
            }
            FieldPolicy::Growth { initialized, .. } => {
                cells.fill(0.0);
                *initialized = true;
            }
            FieldPolicy::PulsingSphere | FieldPolicy::Waves => self.advance(grid, t, cells),
        }
    }

    fn advance(&mut self, grid: &GridDims, t: f32, cells: &mut [f32]) {
        match self {
            FieldPolicy::PulsingSphere => apply(grid, cells, |c, _| pulse_rule(c, t)),
            FieldPolicy::Waves => apply(grid, cells, |c, _| wave_rule(c, t)),
            FieldPolicy::Growth { rng, .. } => {
                let half = grid.half();
                apply(grid, cells, |c, prev| growth_rule(c, half, prev, rng.r#gen()));
            }
            FieldPolicy::SphereSeed { .. } | FieldPolicy::RandomSeed { .. } => {}
        }
    }

    /// Returns whether `cells` changed and needs uploading.
    pub fn step(&mut self, grid: &GridDims, t: f32, cells: &mut [f32]) -> bool {
        if !self.is_initialized() {
            self.initialize(grid, t, cells);
            return true;
        }
        match self {
            FieldPolicy::SphereSeed { .. } | FieldPolicy::RandomSeed { .. } => false,
            _ => {
                self.advance(grid, t, cells);
                true
            }
        }
    }
}

/// Host-side authoritative copy of the field plus the active policy.
#[derive(Clone, Debug)]
pub struct FieldSim {
    grid: GridDims,
    cells: Vec<f32>,
    policy: FieldPolicy,
    seed: u64,
    switches: u64,
    dirty: bool,
}

impl FieldSim {
    pub fn new(grid: GridDims, mode: FieldMode, seed: u64, initial_radius: f32) -> Self {
        Self {
            grid,
            cells: seed_sphere(&grid, initial_radius),
            policy: FieldPolicy::new(mode, seed),
            seed,
            switches: 0,
            dirty: false,
        }
    }

    pub fn grid(&self) -> &GridDims {
        &self.grid
    }

    pub fn cells(&self) -> &[f32] {
        &self.cells
    }

    pub fn mode(&self) -> FieldMode {
        self.policy.mode()
    }

    pub fn policy(&self) -> &FieldPolicy {
        &self.policy
    }

    /// Installs a fresh policy; its first step re-seeds the field.
    pub fn set_mode(&mut self, mode: FieldMode) {
        self.switches += 1;
        self.policy = FieldPolicy::new(mode, self.seed.wrapping_add(self.switches));
    }

    pub fn step(&mut self, t: f32) -> bool {
        let changed = self.policy.step(&self.grid, t, &mut self.cells);
        self.dirty |= changed;
        changed
    }

    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }
}
