//! Command buffer pool.
//!
//! Command buffers are transient: acquired, recorded, submitted, then
//! reclaimed by cleanup once their fence signals and nothing references
//! them. While a holder records into one its lock count is non-zero, which
//! keeps cleanup away.

use std::sync::Arc;

use ash::vk;
use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::command::{CommandBuffer, CommandBufferType};
use crate::context::DeviceContext;
use crate::error::Result;
use crate::ids::{CommandBufferId, Ids};
use crate::usage::Usages;

#[derive(Default)]
struct CommandBuffersState {
    command_buffers: HashMap<CommandBufferId, Arc<Mutex<CommandBuffer>>>,
}

pub struct CommandBuffers {
    context: Arc<DeviceContext>,
    usages: Arc<Usages>,
    ids: Arc<Ids>,
    state: Mutex<CommandBuffersState>,
}

impl CommandBuffers {
    pub fn new(context: Arc<DeviceContext>, usages: Arc<Usages>, ids: Arc<Ids>) -> Self {
        Self {
            context,
            usages,
            ids,
            state: Mutex::new(CommandBuffersState::default()),
        }
    }

    /// Allocates a command buffer from the given pool and hands it out with
    /// its lock count raised. The lock is dropped when the holder submits or
    /// cancels it.
    pub fn acquire_command_buffer(
        &self,
        vk_command_pool: vk::CommandPool,
        cb_type: CommandBufferType,
        tag: &str,
    ) -> Result<(CommandBufferId, Arc<Mutex<CommandBuffer>>)> {
        let level = match cb_type {
            CommandBufferType::Primary => vk::CommandBufferLevel::PRIMARY,
            CommandBufferType::Secondary => vk::CommandBufferLevel::SECONDARY,
        };
        let allocate_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(vk_command_pool)
            .level(level)
            .command_buffer_count(1);
        let vk_command_buffer =
            unsafe { self.context.device().allocate_command_buffers(&allocate_info)?[0] };
        self.context
            .set_object_name(vk_command_buffer, &format!("CommandBuffer-{tag}"));

        // Only primaries get submitted alone, so only they carry a fence.
        let fence = match cb_type {
            CommandBufferType::Primary => {
                let fence = unsafe {
                    self.context
                        .device()
                        .create_fence(&vk::FenceCreateInfo::default(), None)
                };
                let fence = match fence {
                    Ok(fence) => fence,
                    Err(e) => {
                        unsafe {
                            self.context
                                .device()
                                .free_command_buffers(vk_command_pool, &[vk_command_buffer]);
                        }
                        return Err(e.into());
                    }
                };
                self.context
                    .set_object_name(fence, &format!("Fence-{tag}-Finished"));
                fence
            }
            CommandBufferType::Secondary => vk::Fence::null(),
        };

        let id = CommandBufferId(self.ids.command_buffer_ids.acquire());
        self.usages.command_buffers.increment_lock(&id);

        let command_buffer = Arc::new(Mutex::new(CommandBuffer::new(
            Arc::clone(&self.context),
            Arc::clone(&self.usages),
            tag.to_string(),
            cb_type,
            id,
            vk_command_buffer,
            vk_command_pool,
            fence,
        )));
        self.state
            .lock()
            .command_buffers
            .insert(id, Arc::clone(&command_buffer));

        debug!(id = id.0, tag, "acquired command buffer");
        Ok((id, command_buffer))
    }

    #[must_use]
    pub fn get_command_buffer(&self, id: CommandBufferId) -> Option<Arc<Mutex<CommandBuffer>>> {
        self.state.lock().command_buffers.get(&id).cloned()
    }

    /// Drops the holder's lock after submission; the fence now decides when
    /// cleanup may reclaim the command buffer.
    pub fn mark_submitted(&self, id: CommandBufferId) {
        self.usages.command_buffers.decrement_lock(&id);
    }

    /// Abandons a command buffer that will never be submitted. Its tracked
    /// resources are released and the native objects freed immediately.
    pub fn cancel_command_buffer(&self, id: CommandBufferId) {
        let Some(command_buffer) = self.state.lock().command_buffers.remove(&id) else {
            warn!(id = id.0, "cancel requested for unknown command buffer");
            return;
        };
        self.usages.command_buffers.decrement_lock(&id);
        let mut cmd = command_buffer.lock();
        cmd.release_tracked_resources();
        self.free_native(&cmd);
        self.ids.command_buffer_ids.release(id.0);
    }

    /// Reclaims every command buffer whose work is provably finished: the
    /// holder's lock is gone, no primary still references it, and (for
    /// primaries) its fence has signalled.
    pub fn run_cleanup(&self) {
        let mut reclaimed = Vec::new();
        {
            let mut state = self.state.lock();
            state.command_buffers.retain(|id, command_buffer| {
                if self.usages.command_buffers.lock_count(id) > 0 {
                    return true;
                }
                if self.usages.command_buffers.gpu_usage_count(id) > 0 {
                    return true;
                }
                let cmd = command_buffer.lock();
                if cmd.fence() != vk::Fence::null() {
                    let signalled = unsafe {
                        self.context
                            .device()
                            .get_fence_status(cmd.fence())
                            .unwrap_or(false)
                    };
                    if !signalled {
                        return true;
                    }
                }
                drop(cmd);
                reclaimed.push((*id, Arc::clone(command_buffer)));
                false
            });
        }

        for (id, command_buffer) in reclaimed {
            let mut cmd = command_buffer.lock();
            cmd.release_tracked_resources();
            self.free_native(&cmd);
            self.ids.command_buffer_ids.release(id.0);
            debug!(id = id.0, "reclaimed command buffer");
        }
    }

    /// Frees every command buffer regardless of fence state. Callers must
    /// have idled the device first.
    pub fn destroy_all(&self) {
        let command_buffers = {
            let mut state = self.state.lock();
            std::mem::take(&mut state.command_buffers)
        };
        for (id, command_buffer) in command_buffers {
            let mut cmd = command_buffer.lock();
            cmd.release_tracked_resources();
            self.free_native(&cmd);
            self.ids.command_buffer_ids.release(id.0);
        }
    }

    fn free_native(&self, cmd: &CommandBuffer) {
        unsafe {
            self.context
                .device()
                .free_command_buffers(cmd.vk_command_pool(), &[cmd.vk_command_buffer()]);
            if cmd.fence() != vk::Fence::null() {
                self.context.device().destroy_fence(cmd.fence(), None);
            }
        }
    }
}

impl Drop for CommandBuffers {
    fn drop(&mut self) {
        self.destroy_all();
    }
}
