//! Frames-in-flight tracking.
//!
//! A frame owns the persistent semaphores used to chain swapchain acquire,
//! submit, and present, plus the set of command buffers working on its
//! behalf. Starting a frame waits for its previous round of primary command
//! buffers to finish, which is the engine's CPU/GPU backpressure point.

use std::sync::Arc;

use ash::vk;
use hashbrown::HashSet;
use parking_lot::Mutex;
use tracing::{error, info};

use crate::command::CommandBufferType;
use crate::command_buffers::CommandBuffers;
use crate::context::DeviceContext;
use crate::error::Result;
use crate::ids::CommandBufferId;
use crate::settings::GpuSettings;
use crate::timestamps::{queue_family_supports_timestamps, Timestamps};
use crate::usage::Usages;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    NotStarted,
    Started,
    Finished,
}

pub struct Frame {
    context: Arc<DeviceContext>,
    usages: Arc<Usages>,
    frame_index: u32,
    state: FrameState,

    swapchain_image_available_semaphore: vk::Semaphore,
    present_work_finished_semaphore: vk::Semaphore,
    timestamps: Option<Timestamps>,

    swapchain_present_index: Option<u32>,
    associated_command_buffers: HashSet<CommandBufferId>,
}

impl Frame {
    fn new(
        context: Arc<DeviceContext>,
        usages: Arc<Usages>,
        settings: &GpuSettings,
        frame_index: u32,
    ) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::default();
        let swapchain_image_available_semaphore =
            unsafe { context.device().create_semaphore(&semaphore_info, None)? };
        context.set_object_name(
            swapchain_image_available_semaphore,
            &format!("Semaphore-Frame{frame_index}-ImageAvailable"),
        );

        let present_work_finished_semaphore = unsafe {
            match context.device().create_semaphore(&semaphore_info, None) {
                Ok(semaphore) => semaphore,
                Err(e) => {
                    context
                        .device()
                        .destroy_semaphore(swapchain_image_available_semaphore, None);
                    return Err(e.into());
                }
            }
        };
        context.set_object_name(
            present_work_finished_semaphore,
            &format!("Semaphore-Frame{frame_index}-PresentWorkFinished"),
        );

        let timestamps = if settings.timestamp_count > 0
            && queue_family_supports_timestamps(&context)
        {
            match Timestamps::new(
                Arc::clone(&context),
                settings.timestamp_count,
                &format!("Frame-{frame_index}"),
            ) {
                Ok(timestamps) => Some(timestamps),
                Err(e) => {
                    error!(frame_index, "failed to create frame timestamps: {e}");
                    None
                }
            }
        } else {
            None
        };

        Ok(Self {
            context,
            usages,
            frame_index,
            state: FrameState::NotStarted,
            swapchain_image_available_semaphore,
            present_work_finished_semaphore,
            timestamps,
            swapchain_present_index: None,
            associated_command_buffers: HashSet::new(),
        })
    }

    #[must_use]
    pub fn frame_index(&self) -> u32 {
        self.frame_index
    }

    #[must_use]
    pub fn state(&self) -> FrameState {
        self.state
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == FrameState::Started
    }

    #[must_use]
    pub fn swapchain_image_available_semaphore(&self) -> vk::Semaphore {
        self.swapchain_image_available_semaphore
    }

    #[must_use]
    pub fn present_work_finished_semaphore(&self) -> vk::Semaphore {
        self.present_work_finished_semaphore
    }

    pub fn set_swapchain_present_index(&mut self, image_index: u32) {
        self.swapchain_present_index = Some(image_index);
    }

    #[must_use]
    pub fn swapchain_present_index(&self) -> Option<u32> {
        self.swapchain_present_index
    }

    pub fn timestamps_mut(&mut self) -> Option<&mut Timestamps> {
        self.timestamps.as_mut()
    }

    /// Ties a command buffer's lifetime to this frame. The usage count keeps
    /// the command buffer pool from reclaiming (and re-issuing) the id while
    /// the frame still plans to wait on it.
    pub fn associate_command_buffer(&mut self, id: CommandBufferId) {
        if self.associated_command_buffers.insert(id) {
            self.usages.command_buffers.increment_gpu_usage(&id);
        }
    }

    pub fn unassociate_command_buffer(&mut self, id: CommandBufferId) {
        if self.associated_command_buffers.remove(&id) {
            self.usages.command_buffers.decrement_gpu_usage(&id);
        }
    }

    #[must_use]
    pub fn associated_command_buffers(&self) -> Vec<CommandBufferId> {
        self.associated_command_buffers.iter().copied().collect()
    }

    fn clear_associated_command_buffers(&mut self) {
        for id in self.associated_command_buffers.drain() {
            self.usages.command_buffers.decrement_gpu_usage(&id);
        }
    }

    fn destroy(&mut self) {
        unsafe {
            self.context
                .device()
                .destroy_semaphore(self.swapchain_image_available_semaphore, None);
            self.context
                .device()
                .destroy_semaphore(self.present_work_finished_semaphore, None);
        }
        self.swapchain_image_available_semaphore = vk::Semaphore::null();
        self.present_work_finished_semaphore = vk::Semaphore::null();

        if let Some(timestamps) = self.timestamps.as_mut() {
            timestamps.destroy();
        }
        self.timestamps = None;

        self.swapchain_present_index = None;
        self.clear_associated_command_buffers();
    }
}

pub struct Frames {
    context: Arc<DeviceContext>,
    usages: Arc<Usages>,
    state: Mutex<FramesState>,
}

struct FramesState {
    frames: Vec<Frame>,
    current_frame_index: u32,
}

impl Frames {
    pub fn new(
        context: Arc<DeviceContext>,
        usages: Arc<Usages>,
        settings: &GpuSettings,
    ) -> Result<Self> {
        let frames = Self::create_frames(&context, &usages, settings)?;
        Ok(Self {
            context,
            usages,
            state: Mutex::new(FramesState {
                frames,
                current_frame_index: 0,
            }),
        })
    }

    fn create_frames(
        context: &Arc<DeviceContext>,
        usages: &Arc<Usages>,
        settings: &GpuSettings,
    ) -> Result<Vec<Frame>> {
        info!(
            frames_in_flight = settings.frames_in_flight,
            "creating frames"
        );
        let mut frames = Vec::with_capacity(settings.frames_in_flight as usize);
        for frame_index in 0..settings.frames_in_flight {
            match Frame::new(Arc::clone(context), Arc::clone(usages), settings, frame_index) {
                Ok(frame) => frames.push(frame),
                Err(e) => {
                    for mut frame in frames {
                        frame.destroy();
                    }
                    return Err(e);
                }
            }
        }
        Ok(frames)
    }

    #[must_use]
    pub fn current_frame_index(&self) -> u32 {
        self.state.lock().current_frame_index
    }

    /// Runs a closure against the current frame.
    pub fn with_current_frame<R>(&self, f: impl FnOnce(&mut Frame) -> R) -> R {
        let mut state = self.state.lock();
        let index = state.current_frame_index as usize;
        f(&mut state.frames[index])
    }

    /// Blocks until every primary command buffer from this frame's previous
    /// round has finished, then resets the frame for reuse.
    pub fn start_frame(&self, command_buffers: &CommandBuffers) {
        let mut state = self.state.lock();
        let index = state.current_frame_index as usize;
        let frame = &mut state.frames[index];

        if frame.is_active() {
            error!(frame_index = frame.frame_index, "frame is already started");
            return;
        }

        let mut fences = Vec::new();
        for id in frame.associated_command_buffers() {
            // A missing command buffer just means cleanup already reclaimed
            // it after seeing its work finish.
            let Some(command_buffer) = command_buffers.get_command_buffer(id) else {
                continue;
            };
            let cmd = command_buffer.lock();
            if cmd.cb_type() == CommandBufferType::Primary {
                fences.push(cmd.fence());
            }
        }

        if !fences.is_empty() {
            let result = unsafe {
                self.context
                    .device()
                    .wait_for_fences(&fences, true, u64::MAX)
            };
            if let Err(e) = result {
                error!("failed waiting on frame fences: {e}");
            }
        }

        // CPU and GPU are synced for this frame from here on.
        if let Some(timestamps) = frame.timestamps_mut() {
            timestamps.sync_down();
        }
        frame.clear_associated_command_buffers();
        frame.swapchain_present_index = None;
        frame.state = FrameState::Started;
    }

    pub fn end_frame(&self) {
        let mut state = self.state.lock();
        let index = state.current_frame_index as usize;
        let frame = &mut state.frames[index];

        if !frame.is_active() {
            error!(frame_index = frame.frame_index, "frame isn't started");
            return;
        }
        frame.state = FrameState::Finished;

        let count = state.frames.len() as u32;
        state.current_frame_index = (state.current_frame_index + 1) % count;
    }

    /// Rebuilds the frame pool when the frames-in-flight count changes,
    /// clamping the current index into the new range.
    pub fn on_settings_changed(&self, settings: &GpuSettings) -> Result<()> {
        let mut state = self.state.lock();
        if settings.frames_in_flight as usize == state.frames.len() {
            return Ok(());
        }

        info!(
            frames_in_flight = settings.frames_in_flight,
            "settings changed, recreating frames"
        );
        state.current_frame_index = state
            .current_frame_index
            .min(settings.frames_in_flight.saturating_sub(1));

        for frame in &mut state.frames {
            frame.destroy();
        }
        state.frames = Self::create_frames(&self.context, &self.usages, settings)?;
        Ok(())
    }

    pub fn destroy(&self) {
        info!("destroying frames");
        let mut state = self.state.lock();
        for frame in &mut state.frames {
            frame.destroy();
        }
        state.frames.clear();
    }
}
