//! Dynamic uniform buffer suballocation.
//!
//! Uniform data is served in fixed-size entries carved out of large shared
//! buffers. The active buffer hands out entries until it is full, at which
//! point it is tapped out and a cached or fresh buffer takes over. Tapped
//! buffers return to the cache once the GPU is done with them.

use std::sync::Arc;

use hashbrown::HashSet;
use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::buffers::Buffers;
use crate::context::DeviceContext;
use crate::error::{GpuError, Result};
use crate::ids::BufferId;
use crate::types::{BufferCreateParams, BufferUsageFlags};
use crate::usage::Usages;

/// Bytes of uniform data a single entry can hold, before alignment.
pub const UNIFORM_BUFFER_BYTE_SIZE: u64 = 1024;

const ENTRIES_PER_BUFFER: u64 = 1024;

/// A slice of a shared uniform buffer, addressed by dynamic offset at
/// descriptor bind time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DynamicUniformBuffer {
    pub buffer_id: BufferId,
    pub byte_offset: u64,
}

#[derive(Debug, Clone, Copy)]
struct ActiveBuffer {
    buffer_id: BufferId,
    entry_offset: u64,
}

struct UniformBuffersState {
    active: Option<ActiveBuffer>,
    cached: HashSet<BufferId>,
    tapped: HashSet<BufferId>,
}

pub struct UniformBuffers {
    usages: Arc<Usages>,
    entry_byte_size: u64,
    buffer_byte_size: u64,
    state: Mutex<UniformBuffersState>,
}

impl UniformBuffers {
    pub fn new(context: &DeviceContext, usages: Arc<Usages>, buffers: &Buffers) -> Result<Self> {
        info!("creating uniform buffers");

        let mut entry_byte_size = UNIFORM_BUFFER_BYTE_SIZE;
        let alignment = context.capabilities().min_uniform_buffer_offset_alignment;
        if alignment > 0 {
            entry_byte_size = (entry_byte_size + alignment - 1) & !(alignment - 1);
        }
        let buffer_byte_size = entry_byte_size * ENTRIES_PER_BUFFER;

        let uniforms = Self {
            usages,
            entry_byte_size,
            buffer_byte_size,
            state: Mutex::new(UniformBuffersState {
                active: None,
                cached: HashSet::new(),
                tapped: HashSet::new(),
            }),
        };
        let initial = uniforms.allocate_buffer(buffers)?;
        uniforms.state.lock().active = Some(initial);
        Ok(uniforms)
    }

    /// Hands out the next free entry, rotating buffers when the active one
    /// fills up.
    pub fn get_free_uniform_buffer(&self, buffers: &Buffers) -> Result<DynamicUniformBuffer> {
        let mut state = self.state.lock();

        let Some(active) = state.active.as_mut() else {
            return Err(GpuError::InvalidState(
                "no active uniform buffer exists".into(),
            ));
        };

        let entry = DynamicUniformBuffer {
            buffer_id: active.buffer_id,
            byte_offset: active.entry_offset * self.entry_byte_size,
        };
        active.entry_offset += 1;

        if active.entry_offset == ENTRIES_PER_BUFFER {
            let tapped_id = active.buffer_id;
            state.tapped.insert(tapped_id);
            state.active = None;

            match self.allocate_locked(&mut state, buffers) {
                Ok(replacement) => state.active = Some(replacement),
                Err(e) => error!("failed to allocate a replacement uniform buffer: {e}"),
            }
        }

        Ok(entry)
    }

    #[must_use]
    pub fn entry_byte_size(&self) -> u64 {
        self.entry_byte_size
    }

    /// Returns tapped buffers the GPU has finished with to the cache.
    pub fn run_cleanup(&self, buffers: &Buffers) {
        let mut state = self.state.lock();

        let mut to_cache = Vec::new();
        for buffer_id in &state.tapped {
            let Some(instance) = buffers.get_buffer(*buffer_id, false) else {
                error!(id = buffer_id.0, "tapped uniform buffer no longer exists");
                continue;
            };
            if self.usages.buffers.gpu_usage_count(&instance.vk_buffer) == 0 {
                to_cache.push(*buffer_id);
            }
        }
        for buffer_id in to_cache {
            state.tapped.remove(&buffer_id);
            state.cached.insert(buffer_id);
        }
    }

    pub fn destroy(&self, buffers: &Buffers) {
        info!("destroying uniform buffers");
        let mut state = self.state.lock();

        if let Some(active) = state.active.take() {
            buffers.destroy_buffer(active.buffer_id, true);
        }
        for buffer_id in state.cached.drain() {
            buffers.destroy_buffer(buffer_id, true);
        }
        for buffer_id in state.tapped.drain() {
            buffers.destroy_buffer(buffer_id, true);
        }
    }

    fn allocate_buffer(&self, buffers: &Buffers) -> Result<ActiveBuffer> {
        let mut state = self.state.lock();
        self.allocate_locked(&mut state, buffers)
    }

    fn allocate_locked(
        &self,
        state: &mut UniformBuffersState,
        buffers: &Buffers,
    ) -> Result<ActiveBuffer> {
        if let Some(cached_id) = state.cached.iter().next().copied() {
            state.cached.remove(&cached_id);
            return Ok(ActiveBuffer {
                buffer_id: cached_id,
                entry_offset: 0,
            });
        }

        debug!("allocating a new uniform buffer");
        let buffer_id = buffers.create_buffer(
            &BufferCreateParams {
                usage_flags: BufferUsageFlags::GRAPHICS_UNIFORM_READ,
                byte_size: self.buffer_byte_size,
                dedicated_memory: false,
            },
            "Uniform",
        )?;
        Ok(ActiveBuffer {
            buffer_id,
            entry_offset: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_size_honors_offset_alignment() {
        // Mirrors the alignment rounding in new() for a 256-byte minimum.
        let alignment: u64 = 256;
        let aligned = (UNIFORM_BUFFER_BYTE_SIZE + alignment - 1) & !(alignment - 1);
        assert_eq!(aligned, 1024);

        let alignment: u64 = 2048;
        let aligned = (UNIFORM_BUFFER_BYTE_SIZE + alignment - 1) & !(alignment - 1);
        assert_eq!(aligned, 2048);
    }
}
