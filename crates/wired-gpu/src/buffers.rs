//! Buffer pool with deferred destruction and frame cycling.
//!
//! A logical buffer (addressed by [`BufferId`]) owns one or more physical
//! Vulkan buffers plus an active index. When the active physical buffer is
//! still referenced by in-flight GPU work and a caller asks for a cycled
//! lookup, the pool switches to an idle physical buffer or allocates another
//! one, so a writer never touches memory the GPU may still be reading.

use crate::barriers::BufferUsageMode;
use crate::context::DeviceContext;
use crate::error::{GpuError, Result};
use crate::ids::{BufferId, Ids};
use crate::memory::GpuBuffer;
use crate::types::{BufferCreateParams, BufferUsageFlags, TransferBufferCreateParams, TransferBufferUsageFlags};
use crate::usage::Usages;
use ash::vk;
use gpu_allocator::MemoryLocation;
use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;
use std::sync::Arc;

/// Everything needed to (re)create one physical buffer.
#[derive(Clone, Copy, Debug)]
pub struct BufferDef {
    pub is_transfer_buffer: bool,
    pub default_usage_mode: BufferUsageMode,
    pub byte_size: u64,
    pub vk_usage_flags: vk::BufferUsageFlags,
    pub location: MemoryLocation,
    pub host_visible: bool,
    pub dedicated: bool,
}

/// A snapshot of one physical buffer, handed out by lookups.
///
/// Carries no ownership; lifetime is governed by the pool plus the usage
/// trackers.
#[derive(Clone, Copy, Debug)]
pub struct BufferInstance {
    pub vk_buffer: vk::Buffer,
    pub def: BufferDef,
}

struct PhysicalBuffer {
    gpu: GpuBuffer,
    def: BufferDef,
}

impl PhysicalBuffer {
    fn instance(&self) -> BufferInstance {
        BufferInstance {
            vk_buffer: self.gpu.buffer,
            def: self.def,
        }
    }
}

struct Buffer {
    id: BufferId,
    tag: String,
    active_index: usize,
    physical: Vec<PhysicalBuffer>,
}

#[derive(Default)]
struct BuffersState {
    buffers: HashMap<BufferId, Buffer>,
    marked_for_deletion: HashSet<BufferId>,
}

/// Pool of logical buffers.
pub struct Buffers {
    context: Arc<DeviceContext>,
    usages: Arc<Usages>,
    ids: Arc<Ids>,
    state: Mutex<BuffersState>,
}

impl Buffers {
    pub fn new(context: Arc<DeviceContext>, usages: Arc<Usages>, ids: Arc<Ids>) -> Self {
        Self {
            context,
            usages,
            ids,
            state: Mutex::new(BuffersState::default()),
        }
    }

    /// Create a device-local buffer.
    pub fn create_buffer(&self, params: &BufferCreateParams, tag: &str) -> Result<BufferId> {
        let default_usage_mode = default_usage_mode_for(params.usage_flags)?;
        let vk_usage_flags = vk_buffer_usage_flags(params.usage_flags);

        // Uniform buffers are written from the CPU every frame, so they
        // stay host-visible; everything else is device-local.
        let host_visible = params.usage_flags.intersects(
            BufferUsageFlags::GRAPHICS_UNIFORM_READ | BufferUsageFlags::COMPUTE_UNIFORM_READ,
        );

        let def = BufferDef {
            is_transfer_buffer: false,
            default_usage_mode,
            byte_size: params.byte_size,
            vk_usage_flags,
            location: if host_visible {
                MemoryLocation::CpuToGpu
            } else {
                MemoryLocation::GpuOnly
            },
            host_visible,
            dedicated: params.dedicated_memory,
        };

        self.create_and_record(def, tag)
    }

    /// Create a host-visible transfer buffer for uploads and downloads.
    pub fn create_transfer_buffer(
        &self,
        params: &TransferBufferCreateParams,
        tag: &str,
    ) -> Result<BufferId> {
        let default_usage_mode = if params.usage_flags.contains(TransferBufferUsageFlags::UPLOAD) {
            BufferUsageMode::TransferSrc
        } else if params.usage_flags.contains(TransferBufferUsageFlags::DOWNLOAD) {
            BufferUsageMode::TransferDst
        } else {
            return Err(GpuError::InvalidParameters(format!(
                "Transfer buffer has no usage flags: {tag}"
            )));
        };

        let mut vk_usage_flags = vk::BufferUsageFlags::empty();
        if params.usage_flags.contains(TransferBufferUsageFlags::UPLOAD) {
            vk_usage_flags |= vk::BufferUsageFlags::TRANSFER_SRC;
        }
        if params.usage_flags.contains(TransferBufferUsageFlags::DOWNLOAD) {
            vk_usage_flags |= vk::BufferUsageFlags::TRANSFER_DST;
        }

        let location = if params.usage_flags.contains(TransferBufferUsageFlags::DOWNLOAD) {
            MemoryLocation::GpuToCpu
        } else {
            MemoryLocation::CpuToGpu
        };

        let def = BufferDef {
            is_transfer_buffer: true,
            default_usage_mode,
            byte_size: params.byte_size,
            vk_usage_flags,
            location,
            host_visible: true,
            dedicated: false,
        };

        self.create_and_record(def, tag)
    }

    fn create_and_record(&self, def: BufferDef, tag: &str) -> Result<BufferId> {
        let physical = self.create_physical(def, tag)?;

        let mut state = self.state.lock();

        let id = BufferId(self.ids.buffer_ids.acquire());
        state.buffers.insert(
            id,
            Buffer {
                id,
                tag: tag.to_string(),
                active_index: 0,
                physical: vec![physical],
            },
        );

        Ok(id)
    }

    fn create_physical(&self, def: BufferDef, tag: &str) -> Result<PhysicalBuffer> {
        if def.byte_size == 0 {
            return Err(GpuError::InvalidParameters(format!(
                "Tried to create a zero-sized buffer: {tag}"
            )));
        }

        let gpu = self.context.allocator().lock().create_buffer(
            def.byte_size,
            def.vk_usage_flags,
            def.location,
            def.dedicated,
            tag,
        )?;

        self.context
            .set_object_name(gpu.buffer, &format!("Buffer-{tag}"));

        Ok(PhysicalBuffer { gpu, def })
    }

    /// Look up a logical buffer's active physical instance.
    ///
    /// Returns `None` when the ID is unknown or the buffer is marked for
    /// deletion. With `cycled`, the active instance is first cycled so the
    /// returned buffer has no outstanding GPU usage.
    pub fn get_buffer(&self, buffer_id: BufferId, cycled: bool) -> Option<BufferInstance> {
        let mut state = self.state.lock();

        if state.marked_for_deletion.contains(&buffer_id) {
            tracing::warn!(buffer_id = %buffer_id, "GetBuffer: buffer is marked for deletion");
            return None;
        }

        let buffer = state.buffers.get_mut(&buffer_id)?;

        if cycled {
            if let Err(e) = self.cycle_if_needed(buffer) {
                tracing::error!(buffer_id = %buffer_id, error = %e, "GetBuffer: cycling failed");
                return None;
            }
        }

        Some(buffer.physical[buffer.active_index].instance())
    }

    fn cycle_if_needed(&self, buffer: &mut Buffer) -> Result<()> {
        // The active physical buffer is idle, nothing to do
        let active = &buffer.physical[buffer.active_index];
        if self.usages.buffers.gpu_usage_count(&active.gpu.buffer) == 0 {
            return Ok(());
        }

        // Switch to an existing idle physical buffer if one exists
        for (index, physical) in buffer.physical.iter().enumerate() {
            if index == buffer.active_index {
                continue;
            }
            if self.usages.buffers.gpu_usage_count(&physical.gpu.buffer) == 0 {
                buffer.active_index = index;
                return Ok(());
            }
        }

        // All physical buffers are in flight, allocate another one
        let def = buffer.physical[0].def;
        let physical = self.create_physical(def, &buffer.tag)?;
        buffer.physical.push(physical);
        buffer.active_index = buffer.physical.len() - 1;

        Ok(())
    }

    /// Map a host-visible buffer for CPU access.
    pub fn map_buffer(&self, buffer_id: BufferId, cycle: bool) -> Result<*mut u8> {
        let mut state = self.state.lock();

        if state.marked_for_deletion.contains(&buffer_id) {
            return Err(GpuError::ResourceNotFound(format!("Buffer {buffer_id}")));
        }

        let buffer = state
            .buffers
            .get_mut(&buffer_id)
            .ok_or_else(|| GpuError::ResourceNotFound(format!("Buffer {buffer_id}")))?;

        if cycle {
            self.cycle_if_needed(buffer)?;
        }

        let physical = &buffer.physical[buffer.active_index];

        if !physical.def.host_visible {
            return Err(GpuError::InvalidState(format!(
                "Buffer {buffer_id} is not host-visible"
            )));
        }

        physical
            .gpu
            .mapped_ptr()
            .ok_or_else(|| GpuError::InvalidState(format!("Buffer {buffer_id} has no mapping")))
    }

    /// Release a mapping obtained from [`Self::map_buffer`].
    ///
    /// Allocations are persistently mapped, so this only validates that the
    /// buffer still exists.
    pub fn unmap_buffer(&self, buffer_id: BufferId) -> Result<()> {
        let state = self.state.lock();

        if state.buffers.contains_key(&buffer_id) {
            Ok(())
        } else {
            Err(GpuError::ResourceNotFound(format!("Buffer {buffer_id}")))
        }
    }

    /// Destroy a logical buffer.
    ///
    /// With `destroy_immediately` the buffer and all its physical instances
    /// are freed on the spot; otherwise it is marked for deletion and freed
    /// by a later cleanup pass once nothing references it.
    pub fn destroy_buffer(&self, buffer_id: BufferId, destroy_immediately: bool) {
        let mut state = self.state.lock();
        self.destroy_buffer_locked(&mut state, buffer_id, destroy_immediately);
    }

    fn destroy_buffer_locked(
        &self,
        state: &mut BuffersState,
        buffer_id: BufferId,
        destroy_immediately: bool,
    ) {
        if !state.buffers.contains_key(&buffer_id) {
            tracing::warn!(buffer_id = %buffer_id, "DestroyBuffer: no such buffer");
            return;
        }

        if destroy_immediately {
            if let Some(buffer) = state.buffers.remove(&buffer_id) {
                self.free_physical_buffers(buffer);
            }
            state.marked_for_deletion.remove(&buffer_id);
            self.ids.buffer_ids.release(buffer_id.0);
        } else {
            state.marked_for_deletion.insert(buffer_id);
        }
    }

    fn free_physical_buffers(&self, buffer: Buffer) {
        tracing::debug!(buffer_id = %buffer.id, tag = %buffer.tag, "Destroying buffer objects");

        let mut allocator = self.context.allocator().lock();
        for mut physical in buffer.physical {
            if let Err(e) = allocator.free_buffer(&mut physical.gpu) {
                tracing::error!(buffer_id = %buffer.id, error = %e, "Failed to free buffer");
            }
        }
    }

    /// Sweep deletion-marked buffers whose physical instances are all
    /// unreferenced.
    pub fn run_cleanup(&self) {
        let mut state = self.state.lock();

        let marked: Vec<BufferId> = state.marked_for_deletion.iter().copied().collect();

        for buffer_id in marked {
            let Some(buffer) = state.buffers.get(&buffer_id) else {
                tracing::error!(buffer_id = %buffer_id, "RunCleanUp: marked buffer doesn't exist");
                state.marked_for_deletion.remove(&buffer_id);
                continue;
            };

            let all_unreferenced = buffer.physical.iter().all(|physical| {
                self.usages.buffers.gpu_usage_count(&physical.gpu.buffer) == 0
                    && self.usages.buffers.lock_count(&physical.gpu.buffer) == 0
            });

            if all_unreferenced {
                self.destroy_buffer_locked(&mut state, buffer_id, true);
            }
        }
    }

    /// Destroy every buffer, including live ones. Called at shutdown after
    /// the device has gone idle.
    pub fn destroy_all(&self) {
        tracing::info!("Buffers: destroying");

        let mut state = self.state.lock();
        let ids: Vec<BufferId> = state.buffers.keys().copied().collect();
        for buffer_id in ids {
            self.destroy_buffer_locked(&mut state, buffer_id, true);
        }
    }
}

/// Derive a buffer's default usage mode from its declared usage flags.
///
/// Order matters: the earliest matching flag wins, so a vertex+transfer-dst
/// buffer rests in `VertexRead` between operations.
pub(crate) fn default_usage_mode_for(flags: BufferUsageFlags) -> Result<BufferUsageMode> {
    if flags.contains(BufferUsageFlags::VERTEX) {
        Ok(BufferUsageMode::VertexRead)
    } else if flags.contains(BufferUsageFlags::INDEX) {
        Ok(BufferUsageMode::IndexRead)
    } else if flags.contains(BufferUsageFlags::INDIRECT) {
        Ok(BufferUsageMode::IndirectRead)
    } else if flags.contains(BufferUsageFlags::GRAPHICS_UNIFORM_READ) {
        Ok(BufferUsageMode::GraphicsUniformRead)
    } else if flags.contains(BufferUsageFlags::GRAPHICS_STORAGE_READ) {
        Ok(BufferUsageMode::GraphicsStorageRead)
    } else if flags.contains(BufferUsageFlags::COMPUTE_UNIFORM_READ) {
        Ok(BufferUsageMode::ComputeUniformRead)
    } else if flags.intersects(
        BufferUsageFlags::COMPUTE_STORAGE_READ | BufferUsageFlags::COMPUTE_STORAGE_READ_WRITE,
    ) {
        // Both default to read, not read-write. A buffer used read/write by
        // two consecutive compute dispatches must rest in a read state
        // between them or the second dispatch's pre-barrier is a no-op.
        Ok(BufferUsageMode::ComputeStorageRead)
    } else if flags.contains(BufferUsageFlags::TRANSFER_SRC) {
        Ok(BufferUsageMode::TransferSrc)
    } else {
        Err(GpuError::InvalidParameters(
            "Buffer has no supported usage flags".to_string(),
        ))
    }
}

/// Map declared usage flags to Vulkan buffer usage bits.
pub(crate) fn vk_buffer_usage_flags(flags: BufferUsageFlags) -> vk::BufferUsageFlags {
    let mut vk_flags = vk::BufferUsageFlags::empty();

    if flags.contains(BufferUsageFlags::VERTEX) {
        vk_flags |= vk::BufferUsageFlags::VERTEX_BUFFER;
    }
    if flags.contains(BufferUsageFlags::INDEX) {
        vk_flags |= vk::BufferUsageFlags::INDEX_BUFFER;
    }
    if flags.contains(BufferUsageFlags::INDIRECT) {
        vk_flags |= vk::BufferUsageFlags::INDIRECT_BUFFER;
    }
    if flags
        .intersects(BufferUsageFlags::GRAPHICS_UNIFORM_READ | BufferUsageFlags::COMPUTE_UNIFORM_READ)
    {
        vk_flags |= vk::BufferUsageFlags::UNIFORM_BUFFER;
    }
    if flags.intersects(
        BufferUsageFlags::GRAPHICS_STORAGE_READ
            | BufferUsageFlags::COMPUTE_STORAGE_READ
            | BufferUsageFlags::COMPUTE_STORAGE_READ_WRITE,
    ) {
        vk_flags |= vk::BufferUsageFlags::STORAGE_BUFFER;
    }
    if flags.contains(BufferUsageFlags::TRANSFER_SRC) {
        vk_flags |= vk::BufferUsageFlags::TRANSFER_SRC;
    }
    if flags.contains(BufferUsageFlags::TRANSFER_DST) {
        vk_flags |= vk::BufferUsageFlags::TRANSFER_DST;
    }

    vk_flags
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_usage_mode_priority() {
        assert_eq!(
            default_usage_mode_for(BufferUsageFlags::VERTEX | BufferUsageFlags::TRANSFER_DST)
                .unwrap(),
            BufferUsageMode::VertexRead
        );
        assert_eq!(
            default_usage_mode_for(BufferUsageFlags::INDEX | BufferUsageFlags::INDIRECT).unwrap(),
            BufferUsageMode::IndexRead
        );
        assert_eq!(
            default_usage_mode_for(BufferUsageFlags::TRANSFER_SRC).unwrap(),
            BufferUsageMode::TransferSrc
        );
    }

    #[test]
    fn compute_storage_defaults_to_read() {
        assert_eq!(
            default_usage_mode_for(BufferUsageFlags::COMPUTE_STORAGE_READ_WRITE).unwrap(),
            BufferUsageMode::ComputeStorageRead
        );
    }

    #[test]
    fn empty_usage_flags_rejected() {
        assert!(default_usage_mode_for(BufferUsageFlags::empty()).is_err());
    }

    #[test]
    fn vk_flags_cover_all_declared_uses() {
        let flags = vk_buffer_usage_flags(
            BufferUsageFlags::VERTEX
                | BufferUsageFlags::GRAPHICS_STORAGE_READ
                | BufferUsageFlags::TRANSFER_DST,
        );
        assert!(flags.contains(vk::BufferUsageFlags::VERTEX_BUFFER));
        assert!(flags.contains(vk::BufferUsageFlags::STORAGE_BUFFER));
        assert!(flags.contains(vk::BufferUsageFlags::TRANSFER_DST));
        assert!(!flags.contains(vk::BufferUsageFlags::INDEX_BUFFER));
    }
}
