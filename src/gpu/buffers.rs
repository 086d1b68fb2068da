use std::marker::PhantomData;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use bevy::log::info;
use bytemuck::Pod;

use crate::gpu::backend::{Backend, BufferDesc, BufferUsage};
use crate::gpu::error::{FatalError, ViewError};
use crate::gpu::ffi::{ComputeUniforms, Particle, Transform};

// ==================== host mapping ===================================

struct HostBytes {
    bytes: Mutex<Vec<u8>>,
    dirty: AtomicBool,
}

/* persistent host mapping of a buffer. The owning backend buffer holds the
only long-lived strong reference, views hold weak ones. */
#[derive(Clone)]
pub struct HostMemory(Arc<HostBytes>);

impl HostMemory {
    pub fn zeroed(len: usize) -> Self {
        Self(Arc::new(HostBytes {
            bytes: Mutex::new(vec![0; len]),
            dirty: AtomicBool::new(false),
        }))
    }

    fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.0.bytes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.lock().clone()
    }

    /// Copies `bytes` in without marking the mapping dirty. Used by backends
    /// to mirror an upload the device already has.
    pub fn mirror(&self, bytes: &[u8]) {
        let mut guard = self.lock();
        let n = bytes.len().min(guard.len());
        guard[..n].copy_from_slice(&bytes[..n]);
    }

    /// Returns whether host writes happened since the last call.
    pub fn take_dirty(&self) -> bool {
        self.0.dirty.swap(false, Ordering::AcqRel)
    }

    pub fn view<T: Pod>(&self) -> MappedView<T> {
        let len = self.len() / std::mem::size_of::<T>();
        MappedView {
            memory: Arc::downgrade(&self.0),
            len,
            _marker: PhantomData,
        }
    }
}

/// Typed, bounds-checked window over a persistent mapping. Stops working
/// once the buffer that owns the mapping is destroyed.
pub struct MappedView<T: Pod> {
    memory: Weak<HostBytes>,
    len: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Pod> MappedView<T> {
    const SIZE: usize = std::mem::size_of::<T>();

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_valid(&self) -> bool {
        self.memory.strong_count() > 0
    }

    fn upgrade(&self) -> Result<Arc<HostBytes>, ViewError> {
        self.memory.upgrade().ok_or(ViewError::Invalidated)
    }

    fn byte_range(&self, start: usize, count: usize) -> Result<Range<usize>, ViewError> {
        let end = start.checked_add(count).filter(|end| *end <= self.len);
        match end {
            Some(end) => Ok(start * Self::SIZE..end * Self::SIZE),
            None => Err(ViewError::OutOfBounds {
                index: start.saturating_add(count.saturating_sub(1)),
                len: self.len,
            }),
        }
    }

    pub fn read(&self, index: usize) -> Result<T, ViewError> {
        let range = self.byte_range(index, 1)?;
        let memory = self.upgrade()?;
        let bytes = memory.bytes.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(bytemuck::pod_read_unaligned(&bytes[range]))
    }

    pub fn read_all(&self) -> Result<Vec<T>, ViewError> {
        let range = self.byte_range(0, self.len)?;
        let memory = self.upgrade()?;
        let bytes = memory.bytes.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(bytemuck::pod_collect_to_vec(&bytes[range]))
    }

    pub fn write(&self, index: usize, value: &T) -> Result<(), ViewError> {
        self.write_slice(index, std::slice::from_ref(value))
    }

    pub fn write_slice(&self, start: usize, values: &[T]) -> Result<(), ViewError> {
        let range = self.byte_range(start, values.len())?;
        let memory = self.upgrade()?;
        let mut bytes = memory.bytes.lock().unwrap_or_else(PoisonError::into_inner);
        bytes[range].copy_from_slice(bytemuck::cast_slice(values));
        memory.dirty.store(true, Ordering::Release);
        Ok(())
    }
}

// ==================== buffers ========================================

pub struct HostBuffer<B: Backend, T: Pod> {
    view: MappedView<T>,
    buffer: B::Buffer,
}

impl<B: Backend, T: Pod> HostBuffer<B, T> {
    pub fn new(backend: &B, label: &str, usage: BufferUsage, count: usize) -> Result<Self, FatalError> {
        let buffer = backend.create_buffer(&BufferDesc {
            label,
            size: (count * std::mem::size_of::<T>()) as u64,
            usage,
            host_visible: true,
        })?;
        let memory = backend.host_memory(&buffer).ok_or_else(|| FatalError::Allocation {
            label: label.to_string(),
            reason: "buffer has no host mapping".to_string(),
        })?;
        Ok(Self {
            view: memory.view(),
            buffer,
        })
    }

    pub fn buffer(&self) -> &B::Buffer {
        &self.buffer
    }

    pub fn view(&self) -> &MappedView<T> {
        &self.view
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParticleLayout {
    pub num_cells: u32,
    pub expansion: u32,
}

impl ParticleLayout {
    #[inline]
    pub fn records(&self) -> usize {
        self.num_cells as usize * self.expansion as usize
    }
}

/// Per-slot uniforms and particle buffers plus the shared field buffer.
pub struct FrameResources<B: Backend> {
    transforms: Vec<HostBuffer<B, Transform>>,
    compute: Vec<HostBuffer<B, ComputeUniforms>>,
    particles: Vec<HostBuffer<B, Particle>>,
    field: HostBuffer<B, f32>,
    layout: ParticleLayout,
}

impl<B: Backend> FrameResources<B> {
    pub fn new(
        backend: &B,
        frames: usize,
        layout: ParticleLayout,
        initial_field: &[f32],
    ) -> Result<Self, FatalError> {
        if initial_field.len() != layout.num_cells as usize {
            return Err(FatalError::Allocation {
                label: "field".to_string(),
                reason: format!(
                    "initial field has {} cells, expected {}",
                    initial_field.len(),
                    layout.num_cells
                ),
            });
        }

        let vertex_usage = BufferUsage::VERTEX | BufferUsage::STORAGE | BufferUsage::TRANSFER_DST;

        let field = HostBuffer::new(
            backend,
            "field",
            BufferUsage::STORAGE | BufferUsage::TRANSFER_DST,
            layout.num_cells as usize,
        )?;
        backend.upload(field.buffer(), bytemuck::cast_slice(initial_field))?;

        let parked = vec![Particle::default(); layout.records()];
        let mut transforms = Vec::with_capacity(frames);
        let mut compute = Vec::with_capacity(frames);
        let mut particles = Vec::with_capacity(frames);
        for slot in 0..frames {
            transforms.push(HostBuffer::new(
                backend,
                &format!("transform[{slot}]"),
                BufferUsage::UNIFORM,
                1,
            )?);
            compute.push(HostBuffer::new(
                backend,
                &format!("compute_uniforms[{slot}]"),
                BufferUsage::UNIFORM,
                1,
            )?);
            let buffer = HostBuffer::new(
                backend,
                &format!("particles[{slot}]"),
                vertex_usage,
                layout.records(),
            )?;
            backend.upload(buffer.buffer(), bytemuck::cast_slice(&parked))?;
            particles.push(buffer);
        }

        info!(
            "resources: {} slots, {} field cells, {} particle records per slot ({} KiB)",
            frames,
            layout.num_cells,
            layout.records(),
            layout.records() * std::mem::size_of::<Particle>() / 1024
        );

        Ok(Self {
            transforms,
            compute,
            particles,
            field,
            layout,
        })
    }

    pub fn frames(&self) -> usize {
        self.particles.len()
    }

    pub fn layout(&self) -> ParticleLayout {
        self.layout
    }

    // every slot, every frame; no diffing against the previous contents
    pub fn update_transform(&self, transform: &Transform) -> Result<(), FatalError> {
        for slot in &self.transforms {
            slot.view().write(0, transform)?;
        }
        Ok(())
    }

    pub fn update_compute(&self, uniforms: &ComputeUniforms) -> Result<(), FatalError> {
        for slot in &self.compute {
            slot.view().write(0, uniforms)?;
        }
        Ok(())
    }

    pub fn write_field(&self, cells: &[f32]) -> Result<(), FatalError> {
        self.field.view().write_slice(0, cells)?;
        Ok(())
    }

    pub fn particles_view(&self, slot: usize) -> &MappedView<Particle> {
        self.particles[slot].view()
    }

    pub fn transform_buffer(&self, slot: usize) -> &B::Buffer {
        self.transforms[slot].buffer()
    }

    pub fn compute_buffer(&self, slot: usize) -> &B::Buffer {
        self.compute[slot].buffer()
    }

    pub fn particle_buffer(&self, slot: usize) -> &B::Buffer {
        self.particles[slot].buffer()
    }

    pub fn field_buffer(&self) -> &B::Buffer {
        self.field.buffer()
    }

    /// Publishes the slot's compute uniforms and the shared field.
    pub fn flush_compute_inputs(&self, backend: &B, slot: usize) -> Result<(), FatalError> {
        backend.flush(self.compute_buffer(slot))?;
        backend.flush(self.field_buffer())
    }

    /// Publishes the slot's transform and, on the host path, its particles.
    pub fn flush_draw_inputs(
        &self,
        backend: &B,
        slot: usize,
        host_particles: bool,
    ) -> Result<(), FatalError> {
        if host_particles {
            backend.flush(self.particle_buffer(slot))?;
        }
        backend.flush(self.transform_buffer(slot))
    }
}
