use bevy::log::info;

use crate::gpu::backend::{
    Backend, BindEntry, BindingKind, ComputePipelineDesc, GraphicsPipelineDesc, LayoutEntry,
    StageFlags, VertexAttribute, VertexLayout,
};
use crate::gpu::buffers::FrameResources;
use crate::gpu::error::FatalError;
use crate::gpu::ffi::Particle;
use crate::gpu::shaders::ShaderSet;
use crate::gpu::swap::{DepthFormat, PixelFormat, SwapConfig};

pub const WORKGROUP_SIZE: u32 = 256;

/// One invocation per cell, 256 cells per workgroup.
#[inline]
pub fn workgroup_count(cells: u32) -> u32 {
    let n = cells.max(1);
    (n + WORKGROUP_SIZE - 1) / WORKGROUP_SIZE
}

pub const COMPUTE_LAYOUT: [LayoutEntry; 3] = [
    LayoutEntry {
        binding: 0,
        kind: BindingKind::Uniform,
        visibility: StageFlags::COMPUTE,
    },
    // previous: the field
    LayoutEntry {
        binding: 1,
        kind: BindingKind::StorageRead,
        visibility: StageFlags::COMPUTE,
    },
    // next: the slot's particle records
    LayoutEntry {
        binding: 2,
        kind: BindingKind::StorageReadWrite,
        visibility: StageFlags::COMPUTE,
    },
];

pub const DRAW_LAYOUT: [LayoutEntry; 1] = [LayoutEntry {
    binding: 0,
    kind: BindingKind::Uniform,
    visibility: StageFlags::VERTEX,
}];

const PARTICLE_ATTRIBUTES: [VertexAttribute; 2] = [
    VertexAttribute {
        location: 0,
        offset: 0,
    },
    VertexAttribute {
        location: 1,
        offset: Particle::NORMAL_OFFSET,
    },
];

// fields drop top to bottom: bind groups, pipelines, then layouts
pub struct Pipelines<B: Backend> {
    draw_bind_groups: Vec<B::BindGroup>,
    compute_bind_groups: Vec<B::BindGroup>,
    graphics: B::GraphicsPipeline,
    compute: B::ComputePipeline,
    draw_layout: B::BindGroupLayout,
    compute_layout: B::BindGroupLayout,
    color_format: PixelFormat,
    depth_format: DepthFormat,
    workgroups: u32,
}

impl<B: Backend> Pipelines<B> {
    pub fn new(
        backend: &B,
        shaders: &ShaderSet<B>,
        resources: &FrameResources<B>,
        swap: &SwapConfig,
    ) -> Result<Self, FatalError> {
        let compute_layout = backend.create_bind_group_layout("compute_bind_group_layout", &COMPUTE_LAYOUT)?;
        let draw_layout = backend.create_bind_group_layout("draw_bind_group_layout", &DRAW_LAYOUT)?;

        let compute = backend.create_compute_pipeline(&ComputePipelineDesc {
            label: "brick_expand_pipeline",
            layout: &compute_layout,
            module: &shaders.compute,
        })?;

        let graphics = backend.create_graphics_pipeline(&GraphicsPipelineDesc {
            label: "brick_draw_pipeline",
            layout: &draw_layout,
            vertex: &shaders.vertex,
            fragment: &shaders.fragment,
            vertex_layout: VertexLayout {
                stride: Particle::STRIDE,
                attributes: &PARTICLE_ATTRIBUTES,
            },
            color_format: swap.format.format,
            depth_format: swap.depth_format,
        })?;

        let mut compute_bind_groups = Vec::with_capacity(resources.frames());
        let mut draw_bind_groups = Vec::with_capacity(resources.frames());
        for slot in 0..resources.frames() {
            compute_bind_groups.push(backend.create_bind_group(
                &format!("compute_bind_group[{slot}]"),
                &compute_layout,
                &[
                    BindEntry {
                        binding: 0,
                        buffer: resources.compute_buffer(slot),
                    },
                    BindEntry {
                        binding: 1,
                        buffer: resources.field_buffer(),
                    },
                    BindEntry {
                        binding: 2,
                        buffer: resources.particle_buffer(slot),
                    },
                ],
            )?);
            draw_bind_groups.push(backend.create_bind_group(
                &format!("draw_bind_group[{slot}]"),
                &draw_layout,
                &[BindEntry {
                    binding: 0,
                    buffer: resources.transform_buffer(slot),
                }],
            )?);
        }

        let workgroups = workgroup_count(resources.layout().num_cells);
        info!(
            "pipeline: compute + graphics ready ({:?}, {} workgroups of {})",
            swap.format.format, workgroups, WORKGROUP_SIZE
        );

        Ok(Self {
            draw_bind_groups,
            compute_bind_groups,
            graphics,
            compute,
            draw_layout,
            compute_layout,
            color_format: swap.format.format,
            depth_format: swap.depth_format,
            workgroups,
        })
    }

    /// The graphics pipeline bakes in the attachment formats; a swap chain
    /// with different ones needs a full rebuild.
    pub fn matches(&self, swap: &SwapConfig) -> bool {
        self.color_format == swap.format.format && self.depth_format == swap.depth_format
    }

    pub fn compute_pipeline(&self) -> &B::ComputePipeline {
        &self.compute
    }

    pub fn graphics_pipeline(&self) -> &B::GraphicsPipeline {
        &self.graphics
    }

    pub fn compute_bind_group(&self, slot: usize) -> &B::BindGroup {
        &self.compute_bind_groups[slot]
    }

    pub fn draw_bind_group(&self, slot: usize) -> &B::BindGroup {
        &self.draw_bind_groups[slot]
    }

    pub fn compute_layout(&self) -> &B::BindGroupLayout {
        &self.compute_layout
    }

    pub fn draw_layout(&self) -> &B::BindGroupLayout {
        &self.draw_layout
    }

    pub fn workgroups(&self) -> u32 {
        self.workgroups
    }
}
