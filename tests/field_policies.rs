use bevy_lego_ocean::cpu::field::{
    FieldMode, FieldPolicy, FieldSim, GridDims, growth_rule, random_rule, seed_sphere,
};
use glam::IVec3;

fn brute_force_sphere(cells: usize, g: usize, r2: i32) -> Vec<f32> {
    let h = (g / 2) as i32;
    (0..cells)
        .map(|i| {
            let x = (i % g) as i32 - h;
            let y = (i / (g * g)) as i32 - h;
            let z = ((i / g) % g) as i32 - h;
            if x * x + y * y + z * z <= r2 { 1.0 } else { 0.0 }
        })
        .collect()
}

#[test]
fn grid_for_ten_thousand_cells_is_22() {
    let grid = GridDims::for_cells(10_000);
    assert_eq!(grid.size, 22);
    assert_eq!(grid.half(), 11);
    assert_eq!(GridDims::for_cells(8).size, 2);
    assert_eq!(GridDims::for_cells(9).size, 3);
}

#[test]
fn coords_and_index_agree() {
    let grid = GridDims::for_cells(10_000);
    for i in [0, 1, 21, 22, 483, 484, 5_000, 9_999] {
        let c = grid.coords(i);
        assert_eq!(grid.index(c), Some(i), "cell {i} at {c}");
    }
    assert_eq!(grid.coords(0), IVec3::splat(-11));
    assert_eq!(grid.coords(1), IVec3::new(-10, -11, -11));
    assert_eq!(grid.coords(22), IVec3::new(-11, -11, -10));
    assert_eq!(grid.coords(484), IVec3::new(-11, -10, -11));
    // outside the cube, or inside it but past the last cell
    assert_eq!(grid.index(IVec3::new(11, 0, 0)), None);
    assert_eq!(grid.index(IVec3::splat(10)), None);
}

#[test]
fn sphere_seed_matches_brute_force_reference() {
    let grid = GridDims::for_cells(10_000);
    let mut sim = FieldSim::new(grid, FieldMode::Waves, 7, 6.0);
    sim.set_mode(FieldMode::SphereSeed);
    assert!(sim.step(0.0));

    let reference = brute_force_sphere(10_000, 22, 16);
    assert_eq!(sim.cells().len(), reference.len());
    for (i, (got, want)) in sim.cells().iter().zip(&reference).enumerate() {
        assert_eq!(got, want, "cell {i} at {}", grid.coords(i));
    }
    // 257 lattice points with x²+y²+z² <= 16
    assert_eq!(sim.cells().iter().filter(|v| **v == 1.0).count(), 257);
}

#[test]
fn sphere_seed_is_idempotent_after_first_step() {
    let grid = GridDims::for_cells(10_000);
    let mut sim = FieldSim::new(grid, FieldMode::SphereSeed, 1, 6.0);
    assert!(sim.step(0.0));
    assert!(sim.take_dirty());
    let seeded = sim.cells().to_vec();

    for frame in 1..50 {
        assert!(!sim.step(frame as f32 * 0.016));
        assert_eq!(sim.cells(), &seeded[..]);
    }
    assert!(!sim.take_dirty());
}

#[test]
fn random_seed_is_idempotent_and_roughly_seventy_percent_full() {
    let grid = GridDims::for_cells(10_000);
    let mut sim = FieldSim::new(grid, FieldMode::RandomSeed, 42, 6.0);
    assert!(sim.step(0.0));
    let seeded = sim.cells().to_vec();

    for frame in 1..20 {
        assert!(!sim.step(frame as f32));
    }
    assert_eq!(sim.cells(), &seeded[..]);

    let filled = seeded.iter().filter(|v| **v == 1.0).count() as f32 / seeded.len() as f32;
    assert!((0.6..0.8).contains(&filled), "fill ratio {filled}");
}

#[test]
fn same_seed_gives_same_random_field() {
    let grid = GridDims::for_cells(1_000);
    let mut a = FieldSim::new(grid, FieldMode::RandomSeed, 99, 3.0);
    let mut b = FieldSim::new(grid, FieldMode::RandomSeed, 99, 3.0);
    a.step(0.0);
    b.step(0.0);
    assert_eq!(a.cells(), b.cells());
}

#[test]
fn reselecting_a_seed_once_mode_reseeds() {
    let grid = GridDims::for_cells(1_000);
    let mut sim = FieldSim::new(grid, FieldMode::SphereSeed, 5, 3.0);
    sim.step(0.0);

    sim.set_mode(FieldMode::Waves);
    sim.step(1.3);
    assert_eq!(sim.mode(), FieldMode::Waves);

    sim.set_mode(FieldMode::SphereSeed);
    assert!(!sim.policy().is_initialized());
    assert!(sim.step(2.0));
    assert_eq!(sim.cells(), &seed_sphere(&grid, 4.0)[..]);
}

#[test]
fn waves_and_pulse_update_every_step() {
    let grid = GridDims::for_cells(1_000);
    let mut sim = FieldSim::new(grid, FieldMode::Waves, 0, 3.0);
    assert!(sim.step(0.0));
    let first = sim.cells().to_vec();
    assert!(sim.step(0.5));
    assert_ne!(sim.cells(), &first[..]);

    sim.set_mode(FieldMode::PulsingSphere);
    // |sin(0)| = 0: only the origin survives
    assert!(sim.step(0.0));
    assert_eq!(sim.cells().iter().filter(|v| **v == 1.0).count(), 1);
}

#[test]
fn growth_starts_empty_and_never_fills_the_border() {
    let grid = GridDims::for_cells(1_000);
    let mut sim = FieldSim::new(grid, FieldMode::Growth, 3, 3.0);
    assert!(sim.step(0.0));
    assert!(sim.cells().iter().all(|v| *v == 0.0));

    for frame in 1..200 {
        sim.step(frame as f32);
    }
    let edge = grid.half() - 1;
    for (i, v) in sim.cells().iter().enumerate() {
        let c = grid.coords(i);
        if c.x.abs() >= edge || c.y.abs() >= edge || c.z.abs() >= edge {
            assert_eq!(*v, 0.0, "border cell {c} grew");
        }
    }
}

#[test]
fn growth_rule_keeps_grown_cells() {
    assert_eq!(growth_rule(IVec3::ZERO, 11, 1.0, 0.0), 1.0);
    assert_eq!(growth_rule(IVec3::ZERO, 11, 0.0, 0.5), 0.0);
    assert_eq!(growth_rule(IVec3::ZERO, 11, 0.0, 0.9995), 1.0);
    assert_eq!(growth_rule(IVec3::new(10, 0, 0), 11, 1.0, 1.0), 0.0);
    assert_eq!(random_rule(0.31), 1.0);
    assert_eq!(random_rule(0.3), 0.0);
}

#[test]
fn digits_map_to_modes() {
    for d in 0..5u8 {
        let mode = FieldMode::from_digit(d).expect("digit 0-4 is a mode");
        assert_eq!(mode.id(), d as u32);
        assert_eq!(FieldPolicy::new(mode, 0).mode(), mode);
    }
    assert_eq!(FieldMode::from_digit(5), None);
}
