use bytemuck::{Pod, Zeroable};

// plain arrays instead of glam types to keep the WGSL layout obvious

/// One emitted vertex of the expanded brick geometry. `pos.w == 0` marks a
/// parked record that collapses into a degenerate triangle.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Particle {
    pub pos: [f32; 4],
    pub normal: [f32; 4],
}

impl Particle {
    pub const STRIDE: u64 = std::mem::size_of::<Particle>() as u64;
    pub const NORMAL_OFFSET: u64 = 16;

    pub fn new(pos: [f32; 3], normal: [f32; 3]) -> Self {
        Self {
            pos: [pos[0], pos[1], pos[2], 1.0],
            normal: [normal[0], normal[1], normal[2], 0.0],
        }
    }

    #[inline]
    pub fn is_parked(&self) -> bool {
        self.pos[3] == 0.0
    }
}

// matches `struct Transform` in lego_ocean.vert.wgsl
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct Transform {
    pub model: [[f32; 4]; 4],
    pub view: [[f32; 4]; 4],
    pub proj: [[f32; 4]; 4],
    pub wave: u32,
    pub _pad: [u32; 3], // uniform structs round up to 16 bytes
}

impl Default for Transform {
    fn default() -> Self {
        let identity = glam::Mat4::IDENTITY.to_cols_array_2d();
        Self {
            model: identity,
            view: identity,
            proj: identity,
            wave: 0,
            _pad: [0; 3],
        }
    }
}

// matches `struct ComputeUniforms` in lego_ocean.comp.wgsl
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct ComputeUniforms {
    pub elapsed: f32,
    pub field_mode: u32,
    pub grid_size: u32,
    pub num_cells: u32,
}
