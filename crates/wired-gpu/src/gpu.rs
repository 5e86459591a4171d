//! The top-level GPU interface.
//!
//! A [`Gpu`] owns the device context, every resource pool, the frame
//! rotation, and (when built for a window) the presentation surface and
//! swapchain. Resource handles are plain IDs; all recording flows through
//! pass tokens handed out by the `begin_*_pass` methods, which carry the
//! command buffer they were opened on.
//!
//! Thread affinity: command pools and descriptor set caches are created per
//! calling thread on demand, so any thread may acquire and record command
//! buffers without external locking.

use std::sync::Arc;
use std::thread::ThreadId;

use ash::vk;
use hashbrown::HashMap;
use parking_lot::Mutex;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use tracing::{debug, error, info};
use wired_core::{Point2D, Point3D, Size2D};

use crate::barriers::{BufferUsageMode, ImageUsageMode};
use crate::buffers::{BufferInstance, Buffers};
use crate::command::{CommandBuffer, CommandBufferType, SemaphoreOp};
use crate::command_buffers::CommandBuffers;
use crate::context::{DeviceContext, DeviceContextBuilder};
use crate::descriptors::DescriptorSets;
use crate::error::{GpuError, Result, SurfaceError};
use crate::frame::Frames;
use crate::ids::{BufferId, CommandBufferId, Ids, ImageId, PipelineId, SamplerId};
use crate::images::{ImageInstance, Images};
use crate::layouts::Layouts;
use crate::pass_state::{BoundBuffer, BoundImageView, BoundImageViewSampler, PassAttachment};
use crate::pipelines::Pipelines;
use crate::samplers::Samplers;
use crate::settings::GpuSettings;
use crate::shaders::Shaders;
use crate::surface::SurfaceContext;
use crate::swapchain::{calculate_extent, select_present_mode, select_surface_format, Swapchain};
use crate::types::{
    BufferBinding, BufferCreateParams, ColorRenderAttachment, ComputePass, ComputePipelineParams,
    CopyPass, DepthRenderAttachment, Filter, GraphicsPipelineParams, ImageAspect,
    ImageCreateParams, ImageRegion, ImageSubresourceRange, IndexType, IndirectDrawCommand,
    LoadOp, RenderOrComputePass, RenderPass, SamplerInfo, ShaderSpec, StoreOp,
    TransferBufferCreateParams,
};
use crate::uniforms::{UniformBuffers, UNIFORM_BUFFER_BYTE_SIZE};
use crate::usage::Usages;

/// The live swapchain plus the pool-wrapped IDs of its images.
struct PresentationState {
    swapchain: Swapchain,
    image_ids: Vec<ImageId>,
}

/// GPU resource and command orchestrator.
pub struct Gpu {
    context: Arc<DeviceContext>,
    usages: Arc<Usages>,
    settings: Mutex<GpuSettings>,

    buffers: Buffers,
    images: Images,
    shaders: Shaders,
    samplers: Samplers,
    layouts: Arc<Layouts>,
    pipelines: Pipelines,
    command_buffers: CommandBuffers,
    uniform_buffers: UniformBuffers,
    frames: Frames,

    surface: Option<SurfaceContext>,
    presentation: Mutex<Option<PresentationState>>,
    surface_pixel_size: Mutex<Size2D>,

    thread_command_pools: Mutex<HashMap<ThreadId, vk::CommandPool>>,
    thread_descriptor_sets: Mutex<HashMap<ThreadId, Arc<DescriptorSets>>>,

    // vkQueue access requires external synchronization
    queue_lock: Mutex<()>,
    shut_down: Mutex<bool>,
}

impl Gpu {
    /// Create a headless GPU with no presentation surface.
    pub fn new(app_name: &str, settings: GpuSettings) -> Result<Self> {
        let context = Arc::new(
            DeviceContextBuilder::new()
                .app_name(app_name)
                .validation(cfg!(debug_assertions))
                .build()?,
        );
        Self::from_context(context, None, settings, Size2D::default())
    }

    /// Create a GPU that presents to the given window.
    pub fn new_for_window<W>(
        app_name: &str,
        settings: GpuSettings,
        window: &W,
        surface_pixel_size: Size2D,
    ) -> Result<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let context = Arc::new(
            DeviceContextBuilder::new()
                .app_name(app_name)
                .validation(cfg!(debug_assertions))
                .build()?,
        );
        let surface = unsafe { SurfaceContext::from_window(&context, window)? };
        Self::from_context(context, Some(surface), settings, surface_pixel_size)
    }

    fn from_context(
        context: Arc<DeviceContext>,
        surface: Option<SurfaceContext>,
        settings: GpuSettings,
        surface_pixel_size: Size2D,
    ) -> Result<Self> {
        info!("{}", context.capabilities().summary());

        let usages = Arc::new(Usages::new());
        let ids = Arc::new(Ids::new());

        let buffers = Buffers::new(Arc::clone(&context), Arc::clone(&usages), Arc::clone(&ids));
        let images = Images::new(Arc::clone(&context), Arc::clone(&usages), Arc::clone(&ids));
        let shaders = Shaders::new(Arc::clone(&context), Arc::clone(&usages));
        let samplers = Samplers::new(Arc::clone(&context), Arc::clone(&usages), Arc::clone(&ids));
        let layouts = Arc::new(Layouts::new(Arc::clone(&context)));
        let pipelines = Pipelines::new(
            Arc::clone(&context),
            Arc::clone(&usages),
            Arc::clone(&ids),
            Arc::clone(&layouts),
        );
        let command_buffers =
            CommandBuffers::new(Arc::clone(&context), Arc::clone(&usages), Arc::clone(&ids));
        let uniform_buffers = UniformBuffers::new(&context, Arc::clone(&usages), &buffers)?;
        let frames = Frames::new(Arc::clone(&context), Arc::clone(&usages), &settings)?;

        let gpu = Self {
            context,
            usages,
            settings: Mutex::new(settings),
            buffers,
            images,
            shaders,
            samplers,
            layouts,
            pipelines,
            command_buffers,
            uniform_buffers,
            frames,
            surface,
            presentation: Mutex::new(None),
            surface_pixel_size: Mutex::new(surface_pixel_size),
            thread_command_pools: Mutex::new(HashMap::new()),
            thread_descriptor_sets: Mutex::new(HashMap::new()),
            queue_lock: Mutex::new(()),
            shut_down: Mutex::new(false),
        };

        if gpu.surface.is_some() {
            let state = gpu.create_presentation()?;
            *gpu.presentation.lock() = Some(state);
        }

        Ok(gpu)
    }

    /// Release every GPU object. Idempotent; also invoked on drop.
    pub fn shutdown(&self) {
        {
            let mut shut_down = self.shut_down.lock();
            if *shut_down {
                return;
            }
            *shut_down = true;
        }
        info!("shutting down");

        if let Err(e) = self.context.wait_idle() {
            error!(error = %e, "wait idle failed during shutdown");
        }

        self.uniform_buffers.destroy(&self.buffers);
        self.pipelines.destroy_all();
        self.layouts.destroy_all();
        self.samplers.destroy_all();
        self.shaders.destroy_all();
        self.buffers.destroy_all();
        self.images.destroy_all();
        self.command_buffers.destroy_all();

        for (_, descriptor_sets) in self.thread_descriptor_sets.lock().drain() {
            descriptor_sets.destroy();
        }
        for (_, pool) in self.thread_command_pools.lock().drain() {
            unsafe {
                self.context.device().destroy_command_pool(pool, None);
            }
        }

        self.usages.reset();
        self.frames.destroy();

        if let Some(state) = self.presentation.lock().take() {
            if let Some(surface) = &self.surface {
                unsafe {
                    state
                        .swapchain
                        .destroy(self.context.device(), &surface.swapchain_loader);
                }
            }
        }
        if let Some(surface) = &self.surface {
            unsafe {
                surface.destroy();
            }
        }

        if let Err(e) = self.context.wait_idle() {
            error!(error = %e, "wait idle failed during shutdown");
        }
    }

    //
    // Settings and surface lifecycle
    //

    #[must_use]
    pub fn settings(&self) -> GpuSettings {
        *self.settings.lock()
    }

    /// Apply new settings. Changing `frames_in_flight` or `timestamp_count`
    /// rebuilds the frame pool; changing `present_mode` rebuilds the
    /// swapchain. Must not be called mid-frame.
    pub fn on_settings_changed(&self, settings: GpuSettings) -> Result<()> {
        self.context.wait_idle()?;

        let present_mode_changed = {
            let mut current = self.settings.lock();
            let changed = current.present_mode != settings.present_mode;
            *current = settings;
            changed
        };

        self.frames.on_settings_changed(&settings)?;

        if present_mode_changed {
            self.recreate_swapchain()?;
        }
        Ok(())
    }

    /// React to the window surface changing size. Rebuilds the swapchain at
    /// the new pixel size. Must not be called mid-frame.
    pub fn on_surface_details_changed(&self, surface_pixel_size: Size2D) -> Result<()> {
        *self.surface_pixel_size.lock() = surface_pixel_size;
        self.recreate_swapchain()
    }

    /// The pixel size of the current swapchain, when one exists.
    #[must_use]
    pub fn swapchain_size(&self) -> Option<Size2D> {
        self.presentation
            .lock()
            .as_ref()
            .map(|state| Size2D::new(state.swapchain.extent.width, state.swapchain.extent.height))
    }

    /// Block until the device is idle.
    pub fn wait_idle(&self) -> Result<()> {
        self.context.wait_idle()
    }

    fn create_presentation(&self) -> Result<PresentationState> {
        let Some(surface) = &self.surface else {
            return Err(GpuError::InvalidState(
                "no presentation surface exists".into(),
            ));
        };

        let capabilities = surface.capabilities(&self.context)?;
        let surface_format = select_surface_format(&capabilities.formats);
        let present_mode =
            select_present_mode(&capabilities.present_modes, self.settings.lock().present_mode);
        let pixel_size = *self.surface_pixel_size.lock();
        let extent = calculate_extent(&capabilities.capabilities, pixel_size.w, pixel_size.h);

        let swapchain = unsafe {
            Swapchain::new(
                self.context.device(),
                &surface.swapchain_loader,
                surface.surface,
                &capabilities.capabilities,
                surface_format,
                present_mode,
                extent,
                None,
                self.context.queue_family(),
            )?
        };

        let mut image_ids = Vec::with_capacity(swapchain.images.len());
        for (index, &vk_image) in swapchain.images.iter().enumerate() {
            match self.images.create_from_swapchain_image(
                index as u32,
                vk_image,
                swapchain.format,
                swapchain.extent,
            ) {
                Ok(id) => image_ids.push(id),
                Err(e) => {
                    for id in image_ids {
                        self.images.destroy_image(id, true);
                    }
                    unsafe {
                        swapchain.destroy(self.context.device(), &surface.swapchain_loader);
                    }
                    return Err(e);
                }
            }
        }

        info!(
            images = swapchain.images.len(),
            width = extent.width,
            height = extent.height,
            "created swapchain"
        );

        Ok(PresentationState {
            swapchain,
            image_ids,
        })
    }

    fn recreate_swapchain(&self) -> Result<()> {
        let Some(surface) = &self.surface else {
            return Ok(());
        };

        self.context.wait_idle()?;

        {
            let mut presentation = self.presentation.lock();
            if let Some(old) = presentation.take() {
                for id in &old.image_ids {
                    self.images.destroy_image(*id, true);
                }
                unsafe {
                    old.swapchain
                        .destroy(self.context.device(), &surface.swapchain_loader);
                }
            }
        }

        let state = self.create_presentation()?;
        *self.presentation.lock() = Some(state);
        Ok(())
    }

    //
    // Frames and cleanup
    //

    #[must_use]
    pub fn current_frame_index(&self) -> u32 {
        self.frames.current_frame_index()
    }

    /// Open the next frame. Blocks until the frame's previous round of work
    /// has retired, then reclaims finished resources.
    pub fn start_frame(&self) {
        self.run_cleanup(false);
        self.frames.start_frame(&self.command_buffers);
    }

    /// Close the current frame and advance the rotation.
    pub fn end_frame(&self) {
        self.frames.end_frame();
    }

    /// Reclaim resources whose deferred destruction can now proceed.
    /// `is_idle_cleanup` signals the device is idle, allowing descriptor set
    /// caches to drop entries still nominally in flight.
    pub fn run_cleanup(&self, is_idle_cleanup: bool) {
        self.command_buffers.run_cleanup();
        self.images.run_cleanup();
        self.buffers.run_cleanup();
        self.samplers.run_cleanup();
        self.pipelines.run_cleanup();
        self.shaders.run_cleanup();
        for descriptor_sets in self.thread_descriptor_sets.lock().values() {
            descriptor_sets.run_cleanup(is_idle_cleanup);
        }
        self.uniform_buffers.run_cleanup(&self.buffers);
        self.usages.forget_zero_count_entries();
    }

    //
    // Per-thread pools
    //

    fn ensure_thread_command_pool(&self) -> Result<vk::CommandPool> {
        let thread_id = std::thread::current().id();
        let mut pools = self.thread_command_pools.lock();
        if let Some(pool) = pools.get(&thread_id) {
            return Ok(*pool);
        }

        let create_info =
            vk::CommandPoolCreateInfo::default().queue_family_index(self.context.queue_family());
        let pool = unsafe { self.context.device().create_command_pool(&create_info, None)? };
        self.context
            .set_object_name(pool, &format!("CommandPool-{thread_id:?}"));
        debug!(?thread_id, "created thread command pool");
        pools.insert(thread_id, pool);
        Ok(pool)
    }

    fn ensure_thread_descriptor_sets(&self) -> Arc<DescriptorSets> {
        let thread_id = std::thread::current().id();
        let mut caches = self.thread_descriptor_sets.lock();
        Arc::clone(caches.entry(thread_id).or_insert_with(|| {
            Arc::new(DescriptorSets::new(
                Arc::clone(&self.context),
                Arc::clone(&self.usages),
                format!("{thread_id:?}"),
            ))
        }))
    }

    //
    // Resources
    //

    pub fn create_shader(&self, spec: &ShaderSpec) -> Result<()> {
        self.shaders.create_shader(spec)
    }

    pub fn destroy_shader(&self, shader_name: &str) {
        self.shaders.destroy_shader(shader_name, false);
    }

    pub fn create_graphics_pipeline(&self, params: &GraphicsPipelineParams) -> Result<PipelineId> {
        self.pipelines
            .create_graphics_pipeline(&self.shaders, &self.images, params)
    }

    pub fn create_compute_pipeline(&self, params: &ComputePipelineParams) -> Result<PipelineId> {
        self.pipelines.create_compute_pipeline(&self.shaders, params)
    }

    pub fn destroy_pipeline(&self, pipeline_id: PipelineId) {
        self.pipelines.destroy_pipeline(pipeline_id, false);
    }

    pub fn create_buffer(&self, params: &BufferCreateParams, tag: &str) -> Result<BufferId> {
        self.buffers.create_buffer(params, tag)
    }

    pub fn create_transfer_buffer(
        &self,
        params: &TransferBufferCreateParams,
        tag: &str,
    ) -> Result<BufferId> {
        self.buffers.create_transfer_buffer(params, tag)
    }

    /// Map a host-visible buffer. Cycling first swaps to an unused physical
    /// buffer so the map never races in-flight reads.
    pub fn map_buffer(&self, buffer_id: BufferId, cycle: bool) -> Result<*mut u8> {
        self.buffers.map_buffer(buffer_id, cycle)
    }

    pub fn unmap_buffer(&self, buffer_id: BufferId) -> Result<()> {
        self.buffers.unmap_buffer(buffer_id)
    }

    pub fn destroy_buffer(&self, buffer_id: BufferId) {
        self.buffers.destroy_buffer(buffer_id, false);
    }

    /// Create an image. The initial layout transition is recorded into the
    /// given command buffer, which must be submitted for the image to be
    /// usable.
    pub fn create_image(
        &self,
        command_buffer_id: CommandBufferId,
        params: &ImageCreateParams,
        tag: &str,
    ) -> Result<ImageId> {
        let command_buffer = self.command_buffer(command_buffer_id)?;
        let mut cmd = command_buffer.lock();
        self.images.create_from_params(&mut cmd, params, tag)
    }

    pub fn destroy_image(&self, image_id: ImageId) {
        self.images.destroy_image(image_id, false);
    }

    pub fn create_sampler(&self, info: &SamplerInfo, tag: &str) -> Result<SamplerId> {
        let settings = *self.settings.lock();
        self.samplers.get_or_create_sampler(info, &settings, tag)
    }

    pub fn destroy_sampler(&self, sampler_id: SamplerId) {
        self.samplers.destroy_sampler(sampler_id, false);
    }

    //
    // Command buffer lifecycle
    //

    /// Acquire a command buffer from the calling thread's pool and begin
    /// recording it. When a frame is active the buffer is associated with it,
    /// so `start_frame` will later wait on its fence.
    pub fn acquire_command_buffer(
        &self,
        cb_type: CommandBufferType,
        tag: &str,
    ) -> Result<CommandBufferId> {
        let pool = self.ensure_thread_command_pool()?;
        let (id, command_buffer) = self.command_buffers.acquire_command_buffer(pool, cb_type, tag)?;

        if let Err(e) = command_buffer.lock().begin_recording() {
            self.command_buffers.cancel_command_buffer(id);
            return Err(e);
        }

        self.frames.with_current_frame(|frame| {
            if frame.is_active() {
                frame.associate_command_buffer(id);
            }
        });

        Ok(id)
    }

    /// Submit a primary command buffer to the queue. A buffer configured for
    /// presentation gets its swapchain image transitioned to present layout
    /// as its final command, and the image is queued for presentation after
    /// the submit.
    pub fn submit_command_buffer(&self, command_buffer_id: CommandBufferId) -> Result<()> {
        // Frame state is read before the command buffer lock is taken; lock
        // order is frames before command buffers everywhere.
        let (frame_active, present_index) = self.frames.with_current_frame(|frame| {
            (frame.is_active(), frame.swapchain_present_index())
        });

        let command_buffer = self.command_buffer(command_buffer_id)?;
        let mut cmd = command_buffer.lock();

        if cmd.cb_type() != CommandBufferType::Primary {
            return Err(GpuError::InvalidState(
                "only primary command buffers can be submitted".into(),
            ));
        }
        if cmd.is_in_any_pass() {
            return Err(GpuError::InvalidState(
                "command buffer still has an open pass".into(),
            ));
        }

        let mut present_request = None;

        if cmd.is_configured_for_presentation() {
            if !frame_active {
                return Err(GpuError::InvalidState(
                    "presenting command buffer requires an active frame".into(),
                ));
            }
            let Some(present_index) = present_index else {
                return Err(GpuError::InvalidState(
                    "no swapchain image was acquired this frame".into(),
                ));
            };

            let presentation = self.presentation.lock();
            let Some(state) = presentation.as_ref() else {
                return Err(GpuError::InvalidState("no swapchain exists".into()));
            };
            let vk_image = state.swapchain.images[present_index as usize];
            drop(presentation);

            // Last command: hand the swapchain image over to present layout
            cmd.cmd_image_pipeline_barrier(
                vk_image,
                vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                ImageUsageMode::ColorAttachment,
                ImageUsageMode::PresentSrc,
            );

            let signal = cmd.signal_semaphores().to_vec();
            present_request = Some((present_index, signal));
        }

        cmd.end_recording()?;

        let wait_infos: Vec<vk::SemaphoreSubmitInfo> = cmd
            .wait_semaphores()
            .iter()
            .map(|op| semaphore_submit_info(*op))
            .collect();
        let signal_infos: Vec<vk::SemaphoreSubmitInfo> = cmd
            .signal_semaphores()
            .iter()
            .map(|op| semaphore_submit_info(*op))
            .collect();
        let command_buffer_info =
            vk::CommandBufferSubmitInfo::default().command_buffer(cmd.vk_command_buffer());
        let submit_info = vk::SubmitInfo2::default()
            .wait_semaphore_infos(&wait_infos)
            .command_buffer_infos(std::slice::from_ref(&command_buffer_info))
            .signal_semaphore_infos(&signal_infos);

        {
            let _queue = self.queue_lock.lock();
            unsafe {
                self.context.device().queue_submit2(
                    self.context.queue(),
                    &[submit_info],
                    cmd.fence(),
                )?;
            }
        }

        drop(cmd);
        self.command_buffers.mark_submitted(command_buffer_id);

        if let Some((present_index, signal_semaphores)) = present_request {
            self.present_swapchain_image(present_index, &signal_semaphores)?;
        }

        Ok(())
    }

    /// Abandon a command buffer that will never be submitted.
    pub fn cancel_command_buffer(&self, command_buffer_id: CommandBufferId) {
        self.frames.with_current_frame(|frame| {
            if frame.is_active() {
                frame.unassociate_command_buffer(command_buffer_id);
            }
        });
        self.command_buffers.cancel_command_buffer(command_buffer_id);
    }

    /// Acquire the current frame's swapchain image for rendering.
    ///
    /// The given primary command buffer is configured to wait on the image
    /// being available and to signal present-readiness; its submission must
    /// follow this call within the same frame. The returned image ID wraps
    /// the acquired swapchain image.
    pub fn acquire_swapchain_image(
        &self,
        command_buffer_id: CommandBufferId,
    ) -> Result<ImageId> {
        let Some(surface) = &self.surface else {
            return Err(GpuError::InvalidState(
                "no presentation surface exists".into(),
            ));
        };

        let (frame_active, image_available, present_finished) =
            self.frames.with_current_frame(|frame| {
                (
                    frame.is_active(),
                    frame.swapchain_image_available_semaphore(),
                    frame.present_work_finished_semaphore(),
                )
            });
        if !frame_active {
            return Err(GpuError::InvalidState(
                "acquiring a swapchain image requires an active frame".into(),
            ));
        }

        let command_buffer = self.command_buffer(command_buffer_id)?;
        let mut cmd = command_buffer.lock();
        if cmd.cb_type() != CommandBufferType::Primary {
            return Err(GpuError::InvalidState(
                "swapchain images are acquired on a primary command buffer".into(),
            ));
        }

        cmd.configure_for_presentation(
            SemaphoreOp {
                semaphore: image_available,
                stage_mask: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            },
            SemaphoreOp {
                semaphore: present_finished,
                stage_mask: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            },
        );

        let presentation = self.presentation.lock();
        let Some(state) = presentation.as_ref() else {
            return Err(GpuError::InvalidState("no swapchain exists".into()));
        };

        let image_index = unsafe {
            state
                .swapchain
                .acquire_next_image(&surface.swapchain_loader, image_available, u64::MAX)?
        };

        let vk_image = state.swapchain.images[image_index as usize];
        let image_id = state.image_ids[image_index as usize];
        drop(presentation);

        cmd.cmd_swapchain_acquire_barrier(vk_image);
        drop(cmd);

        self.frames
            .with_current_frame(|frame| frame.set_swapchain_present_index(image_index));

        Ok(image_id)
    }

    fn present_swapchain_image(
        &self,
        image_index: u32,
        wait_ops: &[SemaphoreOp],
    ) -> std::result::Result<(), SurfaceError> {
        let Some(surface) = &self.surface else {
            error!("present requested without a surface");
            return Err(SurfaceError::Other);
        };

        let presentation = self.presentation.lock();
        let Some(state) = presentation.as_ref() else {
            error!("present requested without a swapchain");
            return Err(SurfaceError::Other);
        };

        let wait_semaphores: Vec<vk::Semaphore> =
            wait_ops.iter().map(|op| op.semaphore).collect();

        let _queue = self.queue_lock.lock();
        unsafe {
            state.swapchain.present(
                &surface.swapchain_loader,
                self.context.queue(),
                image_index,
                &wait_semaphores,
            )
        }
    }

    /// Stitch recorded secondary command buffers into a primary one. Invalid
    /// secondaries are skipped with an error log; valid ones have their
    /// recording ended and their reclamation tied to the primary's fence.
    pub fn cmd_execute_commands(
        &self,
        primary_command_buffer_id: CommandBufferId,
        secondary_command_buffer_ids: &[CommandBufferId],
    ) -> Result<()> {
        let primary = self.command_buffer(primary_command_buffer_id)?;
        let mut primary_cmd = primary.lock();
        if primary_cmd.cb_type() != CommandBufferType::Primary {
            return Err(GpuError::InvalidState(
                "secondary command buffers execute within a primary one".into(),
            ));
        }

        let mut executed = Vec::with_capacity(secondary_command_buffer_ids.len());
        for &secondary_id in secondary_command_buffer_ids {
            let Some(secondary) = self.command_buffers.get_command_buffer(secondary_id) else {
                error!(id = secondary_id.0, "no such secondary command buffer");
                continue;
            };
            let secondary_cmd = secondary.lock();
            if secondary_cmd.cb_type() != CommandBufferType::Secondary {
                error!(id = secondary_id.0, "not a secondary command buffer");
                continue;
            }
            if secondary_cmd.is_in_any_pass() {
                error!(
                    id = secondary_id.0,
                    "secondary command buffer has an open pass"
                );
                continue;
            }
            if let Err(e) = secondary_cmd.end_recording() {
                error!(id = secondary_id.0, error = %e, "failed to end secondary recording");
                continue;
            }
            executed.push((secondary_id, secondary_cmd.vk_command_buffer()));
        }

        primary_cmd.cmd_execute_commands(&executed);
        drop(primary_cmd);

        // The holders' part is done; retirement now follows the primary
        for (secondary_id, _) in &executed {
            self.command_buffers.mark_submitted(*secondary_id);
            self.frames.with_current_frame(|frame| {
                if frame.is_active() {
                    frame.unassociate_command_buffer(*secondary_id);
                }
            });
        }

        Ok(())
    }

    //
    // Passes
    //

    pub fn begin_copy_pass(&self, command_buffer_id: CommandBufferId, tag: &str) -> Result<CopyPass> {
        let command_buffer = self.command_buffer(command_buffer_id)?;
        let mut cmd = command_buffer.lock();
        cmd.begin_copy_pass()?;
        cmd.cmd_push_debug_section(&format!("CopyPass-{tag}"));
        Ok(CopyPass { command_buffer_id })
    }

    pub fn end_copy_pass(&self, pass: CopyPass) -> Result<()> {
        let command_buffer = self.command_buffer(pass.command_buffer_id)?;
        let mut cmd = command_buffer.lock();
        cmd.cmd_pop_debug_section();
        cmd.end_copy_pass()
    }

    /// Begin a dynamic rendering pass. Attachments are cycled as requested,
    /// transitioned to attachment layout, and restored to their defaults when
    /// the pass ends.
    #[allow(clippy::too_many_arguments)]
    pub fn begin_render_pass(
        &self,
        command_buffer_id: CommandBufferId,
        color_attachments: &[ColorRenderAttachment],
        depth_attachment: Option<&DepthRenderAttachment>,
        render_offset: Point2D,
        render_extent: Size2D,
        tag: &str,
    ) -> Result<RenderPass> {
        if color_attachments.is_empty() && depth_attachment.is_none() {
            return Err(GpuError::InvalidParameters(
                "a render pass requires at least one attachment".into(),
            ));
        }

        let command_buffer = self.command_buffer(command_buffer_id)?;
        let mut cmd = command_buffer.lock();
        if cmd.is_in_any_pass() {
            return Err(GpuError::InvalidState(
                "command buffer already has an open pass".into(),
            ));
        }

        let mut colors = Vec::with_capacity(color_attachments.len());
        for attachment in color_attachments {
            colors.push(self.resolve_color_attachment(&mut cmd, attachment)?);
        }
        let depth = match depth_attachment {
            Some(attachment) => Some(self.resolve_depth_attachment(&mut cmd, attachment)?),
            None => None,
        };

        cmd.begin_render_pass()?;
        cmd.cmd_push_debug_section(&format!("RenderPass-{tag}"));

        for (attachment, _) in &colors {
            cmd.cmd_image_pipeline_barrier(
                attachment.image.vk_image,
                attachment.subresource_range,
                attachment.image.default_usage_mode,
                ImageUsageMode::ColorAttachment,
            );
        }
        if let Some((attachment, _)) = &depth {
            cmd.cmd_image_pipeline_barrier(
                attachment.image.vk_image,
                attachment.subresource_range,
                attachment.image.default_usage_mode,
                ImageUsageMode::DepthAttachment,
            );
        }

        let render_area = vk::Rect2D {
            offset: vk::Offset2D {
                x: render_offset.x as i32,
                y: render_offset.y as i32,
            },
            extent: vk::Extent2D {
                width: render_extent.w,
                height: render_extent.h,
            },
        };
        cmd.cmd_begin_rendering(render_area, colors, depth);

        Ok(RenderPass { command_buffer_id })
    }

    pub fn end_render_pass(&self, pass: RenderPass) -> Result<()> {
        let command_buffer = self.command_buffer(pass.command_buffer_id)?;
        let mut cmd = command_buffer.lock();
        if !cmd.is_in_render_pass() {
            return Err(GpuError::InvalidState("not in a render pass".into()));
        }

        let attachments: Vec<PassAttachment> = cmd
            .pass_state()
            .map(|pass_state| {
                pass_state
                    .color_attachments
                    .iter()
                    .cloned()
                    .chain(pass_state.depth_attachment.clone())
                    .collect()
            })
            .unwrap_or_default();

        cmd.cmd_end_rendering();

        for attachment in attachments {
            let attachment_mode = if attachment.is_depth {
                ImageUsageMode::DepthAttachment
            } else {
                ImageUsageMode::ColorAttachment
            };
            cmd.cmd_image_pipeline_barrier(
                attachment.image.vk_image,
                attachment.subresource_range,
                attachment_mode,
                attachment.image.default_usage_mode,
            );
        }

        cmd.cmd_pop_debug_section();
        cmd.end_render_pass()
    }

    pub fn begin_compute_pass(
        &self,
        command_buffer_id: CommandBufferId,
        tag: &str,
    ) -> Result<ComputePass> {
        let command_buffer = self.command_buffer(command_buffer_id)?;
        let mut cmd = command_buffer.lock();
        cmd.begin_compute_pass()?;
        cmd.cmd_push_debug_section(&format!("ComputePass-{tag}"));
        Ok(ComputePass { command_buffer_id })
    }

    pub fn end_compute_pass(&self, pass: ComputePass) -> Result<()> {
        let command_buffer = self.command_buffer(pass.command_buffer_id)?;
        let mut cmd = command_buffer.lock();
        cmd.cmd_pop_debug_section();
        cmd.end_compute_pass()
    }

    fn resolve_color_attachment(
        &self,
        cmd: &mut CommandBuffer,
        attachment: &ColorRenderAttachment,
    ) -> Result<(PassAttachment, vk::RenderingAttachmentInfo<'static>)> {
        let image = self
            .images
            .get_image(attachment.image_id, attachment.cycle, Some(cmd))
            .ok_or_else(|| {
                GpuError::ResourceNotFound(format!(
                    "color attachment image does not exist: {}",
                    attachment.image_id.0
                ))
            })?;

        let view = attachment_view(&image, attachment.layer)?;

        let info = vk::RenderingAttachmentInfo::default()
            .image_view(view)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .resolve_mode(vk::ResolveModeFlags::NONE)
            .load_op(vk_load_op(attachment.load_op))
            .store_op(vk_store_op(attachment.store_op))
            .clear_value(vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: attachment.clear_color,
                },
            });

        let subresource_range = vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: attachment.mip_level,
            level_count: 1,
            base_array_layer: attachment.layer,
            layer_count: 1,
        };

        Ok((
            PassAttachment {
                is_depth: false,
                image,
                subresource_range,
            },
            info,
        ))
    }

    fn resolve_depth_attachment(
        &self,
        cmd: &mut CommandBuffer,
        attachment: &DepthRenderAttachment,
    ) -> Result<(PassAttachment, vk::RenderingAttachmentInfo<'static>)> {
        let image = self
            .images
            .get_image(attachment.image_id, attachment.cycle, Some(cmd))
            .ok_or_else(|| {
                GpuError::ResourceNotFound(format!(
                    "depth attachment image does not exist: {}",
                    attachment.image_id.0
                ))
            })?;

        let view = attachment_view(&image, attachment.layer)?;

        let info = vk::RenderingAttachmentInfo::default()
            .image_view(view)
            .image_layout(vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL)
            .resolve_mode(vk::ResolveModeFlags::NONE)
            .load_op(vk_load_op(attachment.load_op))
            .store_op(vk_store_op(attachment.store_op))
            .clear_value(vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: attachment.clear_depth,
                    stencil: 0,
                },
            });

        let subresource_range = vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::DEPTH,
            base_mip_level: attachment.mip_level,
            level_count: 1,
            base_array_layer: attachment.layer,
            layer_count: 1,
        };

        Ok((
            PassAttachment {
                is_depth: true,
                image,
                subresource_range,
            },
            info,
        ))
    }

    //
    // Copy pass operations
    //

    /// Clear a color image's subresource range to a flat color.
    pub fn cmd_clear_color_image(
        &self,
        pass: CopyPass,
        image_id: ImageId,
        range: &ImageSubresourceRange,
        color: [f32; 4],
        cycle: bool,
    ) -> Result<()> {
        let command_buffer = self.command_buffer(pass.command_buffer_id)?;
        let mut cmd = command_buffer.lock();
        if !cmd.is_in_copy_pass() {
            return Err(GpuError::InvalidState(
                "clears are only allowed inside a copy pass".into(),
            ));
        }

        let image = self.image(&mut cmd, image_id, cycle)?;

        if range.image_aspect != ImageAspect::Color {
            return Err(GpuError::InvalidParameters(
                "color clears require the color aspect".into(),
            ));
        }
        if range.base_mip_level + range.level_count > image.def.num_mip_levels {
            return Err(GpuError::InvalidParameters(
                "clear range exceeds the image's mip levels".into(),
            ));
        }
        if range.base_array_layer + range.layer_count > image.def.num_layers {
            return Err(GpuError::InvalidParameters(
                "clear range exceeds the image's layers".into(),
            ));
        }

        let vk_range = vk_subresource_range(range);

        cmd.cmd_image_pipeline_barrier(
            image.vk_image,
            vk_range,
            image.default_usage_mode,
            ImageUsageMode::TransferDst,
        );
        cmd.cmd_clear_color_image(
            image.vk_image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &vk::ClearColorValue { float32: color },
            &[vk_range],
        );
        cmd.cmd_image_pipeline_barrier(
            image.vk_image,
            vk_range,
            ImageUsageMode::TransferDst,
            image.default_usage_mode,
        );

        Ok(())
    }

    /// Blit a region of one image into a region of another, scaling and
    /// format-converting as needed.
    #[allow(clippy::too_many_arguments)]
    pub fn cmd_blit_image(
        &self,
        pass: CopyPass,
        source_image_id: ImageId,
        source_region: &ImageRegion,
        dest_image_id: ImageId,
        dest_region: &ImageRegion,
        filter: Filter,
        cycle: bool,
    ) -> Result<()> {
        let command_buffer = self.command_buffer(pass.command_buffer_id)?;
        let mut cmd = command_buffer.lock();
        if !cmd.is_in_copy_pass() {
            return Err(GpuError::InvalidState(
                "blits are only allowed inside a copy pass".into(),
            ));
        }

        let source = self.image(&mut cmd, source_image_id, false)?;
        let dest = self.image(&mut cmd, dest_image_id, cycle)?;

        validate_region(&source, source_region, "blit source")?;
        validate_region(&dest, dest_region, "blit dest")?;

        let src_offsets = region_offsets(&source, source_region);
        let dst_offsets = region_offsets(&dest, dest_region);

        let blit = vk::ImageBlit {
            src_subresource: region_subresource_layers(&source, source_region),
            src_offsets,
            dst_subresource: region_subresource_layers(&dest, dest_region),
            dst_offsets,
        };

        let src_range = region_subresource_range(&source, source_region);
        let dst_range = region_subresource_range(&dest, dest_region);

        cmd.cmd_image_pipeline_barrier(
            source.vk_image,
            src_range,
            source.default_usage_mode,
            ImageUsageMode::TransferSrc,
        );
        cmd.cmd_image_pipeline_barrier(
            dest.vk_image,
            dst_range,
            dest.default_usage_mode,
            ImageUsageMode::TransferDst,
        );
        cmd.cmd_blit_image(
            source.vk_image,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            dest.vk_image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            blit,
            match filter {
                Filter::Linear => vk::Filter::LINEAR,
                Filter::Nearest => vk::Filter::NEAREST,
            },
        );
        cmd.cmd_image_pipeline_barrier(
            source.vk_image,
            src_range,
            ImageUsageMode::TransferSrc,
            source.default_usage_mode,
        );
        cmd.cmd_image_pipeline_barrier(
            dest.vk_image,
            dst_range,
            ImageUsageMode::TransferDst,
            dest.default_usage_mode,
        );

        Ok(())
    }

    /// Copy staged data from a transfer buffer into a GPU buffer.
    #[allow(clippy::too_many_arguments)]
    pub fn cmd_upload_data_to_buffer(
        &self,
        pass: CopyPass,
        source_transfer_buffer_id: BufferId,
        source_byte_offset: u64,
        dest_buffer_id: BufferId,
        dest_byte_offset: u64,
        byte_size: u64,
        cycle: bool,
    ) -> Result<()> {
        let command_buffer = self.command_buffer(pass.command_buffer_id)?;
        let mut cmd = command_buffer.lock();
        if !cmd.is_in_copy_pass() {
            return Err(GpuError::InvalidState(
                "uploads are only allowed inside a copy pass".into(),
            ));
        }

        let source = self.buffer(source_transfer_buffer_id, false)?;
        let dest = self.buffer(dest_buffer_id, cycle)?;

        if !source.def.is_transfer_buffer {
            return Err(GpuError::InvalidParameters(
                "upload source must be a transfer buffer".into(),
            ));
        }
        if dest.def.is_transfer_buffer {
            return Err(GpuError::InvalidParameters(
                "upload dest must not be a transfer buffer".into(),
            ));
        }

        self.copy_between_buffers(
            &mut cmd,
            &source,
            source_byte_offset,
            &dest,
            dest_byte_offset,
            byte_size,
        )
    }

    /// Copy between two GPU buffers.
    #[allow(clippy::too_many_arguments)]
    pub fn cmd_copy_buffer_to_buffer(
        &self,
        pass: CopyPass,
        source_buffer_id: BufferId,
        source_byte_offset: u64,
        dest_buffer_id: BufferId,
        dest_byte_offset: u64,
        byte_size: u64,
        cycle: bool,
    ) -> Result<()> {
        let command_buffer = self.command_buffer(pass.command_buffer_id)?;
        let mut cmd = command_buffer.lock();
        if !cmd.is_in_copy_pass() {
            return Err(GpuError::InvalidState(
                "copies are only allowed inside a copy pass".into(),
            ));
        }

        let source = self.buffer(source_buffer_id, false)?;
        let dest = self.buffer(dest_buffer_id, cycle)?;

        self.copy_between_buffers(
            &mut cmd,
            &source,
            source_byte_offset,
            &dest,
            dest_byte_offset,
            byte_size,
        )
    }

    fn copy_between_buffers(
        &self,
        cmd: &mut CommandBuffer,
        source: &BufferInstance,
        source_byte_offset: u64,
        dest: &BufferInstance,
        dest_byte_offset: u64,
        byte_size: u64,
    ) -> Result<()> {
        if source_byte_offset + byte_size > source.def.byte_size {
            return Err(GpuError::InvalidParameters(
                "copy exceeds the source buffer's size".into(),
            ));
        }
        if dest_byte_offset + byte_size > dest.def.byte_size {
            return Err(GpuError::InvalidParameters(
                "copy exceeds the dest buffer's size".into(),
            ));
        }

        cmd.cmd_buffer_pipeline_barrier(
            source.vk_buffer,
            source_byte_offset,
            byte_size,
            source.def.default_usage_mode,
            BufferUsageMode::TransferSrc,
        );
        cmd.cmd_buffer_pipeline_barrier(
            dest.vk_buffer,
            dest_byte_offset,
            byte_size,
            dest.def.default_usage_mode,
            BufferUsageMode::TransferDst,
        );

        let region = vk::BufferCopy2::default()
            .src_offset(source_byte_offset)
            .dst_offset(dest_byte_offset)
            .size(byte_size);
        cmd.cmd_copy_buffer(source.vk_buffer, dest.vk_buffer, &[region]);

        cmd.cmd_buffer_pipeline_barrier(
            source.vk_buffer,
            source_byte_offset,
            byte_size,
            BufferUsageMode::TransferSrc,
            source.def.default_usage_mode,
        );
        cmd.cmd_buffer_pipeline_barrier(
            dest.vk_buffer,
            dest_byte_offset,
            byte_size,
            BufferUsageMode::TransferDst,
            dest.def.default_usage_mode,
        );

        Ok(())
    }

    /// Copy staged data from a transfer buffer into an image region. A zero
    /// second offset in the region means the whole mip extent.
    #[allow(clippy::too_many_arguments)]
    pub fn cmd_upload_data_to_image(
        &self,
        pass: CopyPass,
        source_transfer_buffer_id: BufferId,
        source_byte_offset: u64,
        dest_image_id: ImageId,
        dest_region: &ImageRegion,
        byte_size: u64,
        cycle: bool,
    ) -> Result<()> {
        let command_buffer = self.command_buffer(pass.command_buffer_id)?;
        let mut cmd = command_buffer.lock();
        if !cmd.is_in_copy_pass() {
            return Err(GpuError::InvalidState(
                "uploads are only allowed inside a copy pass".into(),
            ));
        }

        let source = self.buffer(source_transfer_buffer_id, false)?;
        if !source.def.is_transfer_buffer {
            return Err(GpuError::InvalidParameters(
                "upload source must be a transfer buffer".into(),
            ));
        }
        if source_byte_offset + byte_size > source.def.byte_size {
            return Err(GpuError::InvalidParameters(
                "upload exceeds the source buffer's size".into(),
            ));
        }

        let dest = self.image(&mut cmd, dest_image_id, cycle)?;
        validate_region(&dest, dest_region, "upload dest")?;

        let extent = region_extent(&dest, dest_region);
        let copy = vk::BufferImageCopy2::default()
            .buffer_offset(source_byte_offset)
            .buffer_row_length(0)
            .buffer_image_height(0)
            .image_subresource(region_subresource_layers(&dest, dest_region))
            .image_offset(vk::Offset3D {
                x: dest_region.offsets[0].x as i32,
                y: dest_region.offsets[0].y as i32,
                z: dest_region.offsets[0].z as i32,
            })
            .image_extent(extent);

        let dst_range = region_subresource_range(&dest, dest_region);

        cmd.cmd_buffer_pipeline_barrier(
            source.vk_buffer,
            source_byte_offset,
            byte_size,
            source.def.default_usage_mode,
            BufferUsageMode::TransferSrc,
        );
        cmd.cmd_image_pipeline_barrier(
            dest.vk_image,
            dst_range,
            dest.default_usage_mode,
            ImageUsageMode::TransferDst,
        );
        cmd.cmd_copy_buffer_to_image(
            source.vk_buffer,
            dest.vk_image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &[copy],
        );
        cmd.cmd_buffer_pipeline_barrier(
            source.vk_buffer,
            source_byte_offset,
            byte_size,
            BufferUsageMode::TransferSrc,
            source.def.default_usage_mode,
        );
        cmd.cmd_image_pipeline_barrier(
            dest.vk_image,
            dst_range,
            ImageUsageMode::TransferDst,
            dest.default_usage_mode,
        );

        Ok(())
    }

    /// Fill an image's mip chain by blitting each level from the one above,
    /// halving each axis. Opens its own copy pass; the command buffer must
    /// not have a pass open.
    pub fn generate_mip_maps(
        &self,
        command_buffer_id: CommandBufferId,
        image_id: ImageId,
    ) -> Result<()> {
        {
            let command_buffer = self.command_buffer(command_buffer_id)?;
            let cmd = command_buffer.lock();
            if cmd.is_in_any_pass() {
                return Err(GpuError::InvalidState(
                    "mip generation requires no open pass".into(),
                ));
            }
        }

        let image = self.images.get_image(image_id, false, None).ok_or_else(|| {
            GpuError::ResourceNotFound(format!("no such image: {}", image_id.0))
        })?;
        if image.def.vk_image_type != vk::ImageType::TYPE_2D {
            return Err(GpuError::InvalidParameters(
                "mip generation requires a 2D image".into(),
            ));
        }

        let format_properties = unsafe {
            self.context
                .instance()
                .get_physical_device_format_properties(
                    self.context.physical_device(),
                    image.def.vk_format,
                )
        };
        if !format_properties
            .optimal_tiling_features
            .contains(vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR)
        {
            return Err(GpuError::InvalidParameters(
                "mip generation requires a linearly filterable format".into(),
            ));
        }

        let pass =
            self.begin_copy_pass(command_buffer_id, &format!("GenerateMipMaps-{}", image_id.0))?;

        let mut mip_width = image.def.vk_extent.width;
        let mut mip_height = image.def.vk_extent.height;
        for mip_level in 1..image.def.num_mip_levels {
            self.cmd_blit_image(
                pass,
                image_id,
                &ImageRegion {
                    layer_index: 0,
                    mip_level: mip_level - 1,
                    offsets: [Point3D::default(), Point3D::new(mip_width, mip_height, 1)],
                },
                image_id,
                &ImageRegion {
                    layer_index: 0,
                    mip_level,
                    offsets: [
                        Point3D::default(),
                        Point3D::new((mip_width / 2).max(1), (mip_height / 2).max(1), 1),
                    ],
                },
                Filter::Linear,
                false,
            )?;

            mip_width = (mip_width / 2).max(1);
            mip_height = (mip_height / 2).max(1);
        }

        self.end_copy_pass(pass)
    }

    //
    // Render and compute pass bindings
    //

    pub fn cmd_bind_pipeline(&self, pass: RenderOrComputePass, pipeline_id: PipelineId) -> Result<()> {
        let command_buffer = self.command_buffer(pass.command_buffer_id())?;
        let mut cmd = command_buffer.lock();
        if !cmd.is_in_render_pass() && !cmd.is_in_compute_pass() {
            return Err(GpuError::InvalidState(
                "pipelines bind inside a render or compute pass".into(),
            ));
        }
        let pipeline = self.pipelines.get_pipeline(pipeline_id).ok_or_else(|| {
            GpuError::ResourceNotFound(format!("no such pipeline: {}", pipeline_id.0))
        })?;
        cmd.cmd_bind_pipeline(&pipeline);
        Ok(())
    }

    pub fn cmd_bind_vertex_buffer(&self, pass: RenderPass, binding: BufferBinding) -> Result<()> {
        let command_buffer = self.command_buffer(pass.command_buffer_id)?;
        let mut cmd = command_buffer.lock();
        if !cmd.is_in_render_pass() {
            return Err(GpuError::InvalidState(
                "vertex buffers bind inside a render pass".into(),
            ));
        }
        let instance = self.buffer(binding.buffer_id, false)?;
        cmd.cmd_bind_vertex_buffer(vertex_index_binding(instance, binding.byte_offset));
        Ok(())
    }

    pub fn cmd_bind_index_buffer(
        &self,
        pass: RenderPass,
        binding: BufferBinding,
        index_type: IndexType,
    ) -> Result<()> {
        let command_buffer = self.command_buffer(pass.command_buffer_id)?;
        let mut cmd = command_buffer.lock();
        if !cmd.is_in_render_pass() {
            return Err(GpuError::InvalidState(
                "index buffers bind inside a render pass".into(),
            ));
        }
        let instance = self.buffer(binding.buffer_id, false)?;
        cmd.cmd_bind_index_buffer(vertex_index_binding(instance, binding.byte_offset), index_type);
        Ok(())
    }

    /// Stage a small blob of per-draw uniform data and bind it to the named
    /// bind point as a dynamic uniform.
    pub fn cmd_bind_uniform_data<T: bytemuck::NoUninit>(
        &self,
        pass: RenderOrComputePass,
        bind_point: &str,
        data: &T,
    ) -> Result<()> {
        let bytes = bytemuck::bytes_of(data);
        if bytes.len() as u64 > UNIFORM_BUFFER_BYTE_SIZE {
            return Err(GpuError::InvalidParameters(format!(
                "uniform data exceeds {UNIFORM_BUFFER_BYTE_SIZE} bytes: {}",
                bytes.len()
            )));
        }

        let command_buffer = self.command_buffer(pass.command_buffer_id())?;
        let mut cmd = command_buffer.lock();
        self.require_pipeline_bound(&cmd)?;

        let uniform = self.uniform_buffers.get_free_uniform_buffer(&self.buffers)?;
        let mapped = self.buffers.map_buffer(uniform.buffer_id, false)?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                mapped.add(uniform.byte_offset as usize),
                bytes.len(),
            );
        }
        self.buffers.unmap_buffer(uniform.buffer_id)?;

        let dynamic_byte_offset = u32::try_from(uniform.byte_offset).map_err(|_| {
            GpuError::Other(format!(
                "uniform entry offset exceeds u32: {}",
                uniform.byte_offset
            ))
        })?;

        let instance = self.buffer(uniform.buffer_id, false)?;
        cmd.bind_buffer(
            bind_point,
            BoundBuffer {
                instance,
                descriptor_type: vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
                shader_writeable: false,
                byte_offset: 0,
                byte_size: bytes.len() as u64,
                dynamic_byte_offset: Some(dynamic_byte_offset),
            },
        );
        Ok(())
    }

    /// Bind a whole buffer to the named bind point for shader reads.
    pub fn cmd_bind_storage_read_buffer(
        &self,
        pass: RenderOrComputePass,
        bind_point: &str,
        buffer_id: BufferId,
    ) -> Result<()> {
        let command_buffer = self.command_buffer(pass.command_buffer_id())?;
        let mut cmd = command_buffer.lock();
        self.require_pipeline_bound(&cmd)?;

        let instance = self.buffer(buffer_id, false)?;
        cmd.bind_buffer(
            bind_point,
            storage_buffer_binding(instance, false),
        );
        Ok(())
    }

    /// Bind a whole buffer to the named bind point for shader reads and
    /// writes. Compute passes only; graphics set resources are read-only.
    pub fn cmd_bind_storage_read_write_buffer(
        &self,
        pass: RenderOrComputePass,
        bind_point: &str,
        buffer_id: BufferId,
    ) -> Result<()> {
        let command_buffer = self.command_buffer(pass.command_buffer_id())?;
        let mut cmd = command_buffer.lock();
        if !cmd.is_in_compute_pass() {
            return Err(GpuError::InvalidState(
                "writeable storage buffers bind inside a compute pass".into(),
            ));
        }
        self.require_pipeline_bound(&cmd)?;

        let instance = self.buffer(buffer_id, false)?;
        cmd.bind_buffer(
            bind_point,
            storage_buffer_binding(instance, true),
        );
        Ok(())
    }

    /// Bind an image's whole view plus a sampler to the named bind point, at
    /// the given array index for arrayed bindings.
    pub fn cmd_bind_image_view_sampler(
        &self,
        pass: RenderOrComputePass,
        bind_point: &str,
        array_index: u32,
        image_id: ImageId,
        sampler_id: SamplerId,
    ) -> Result<()> {
        let command_buffer = self.command_buffer(pass.command_buffer_id())?;
        let mut cmd = command_buffer.lock();
        self.require_pipeline_bound(&cmd)?;

        let image = self.image(&mut cmd, image_id, false)?;
        let sampler = self.samplers.get_sampler(sampler_id).ok_or_else(|| {
            GpuError::ResourceNotFound(format!("no such sampler: {}", sampler_id.0))
        })?;

        cmd.bind_image_view_sampler(
            bind_point,
            array_index,
            BoundImageViewSampler {
                instance: image,
                view_index: 0,
                sampler,
            },
        );
        Ok(())
    }

    /// Bind an image's whole view as a read-only storage image.
    pub fn cmd_bind_storage_read_image(
        &self,
        pass: RenderOrComputePass,
        bind_point: &str,
        image_id: ImageId,
    ) -> Result<()> {
        self.bind_storage_image(pass, bind_point, image_id, false)
    }

    /// Bind an image's whole view as a read-write storage image.
    pub fn cmd_bind_storage_read_write_image(
        &self,
        pass: RenderOrComputePass,
        bind_point: &str,
        image_id: ImageId,
    ) -> Result<()> {
        self.bind_storage_image(pass, bind_point, image_id, true)
    }

    fn bind_storage_image(
        &self,
        pass: RenderOrComputePass,
        bind_point: &str,
        image_id: ImageId,
        shader_writeable: bool,
    ) -> Result<()> {
        let command_buffer = self.command_buffer(pass.command_buffer_id())?;
        let mut cmd = command_buffer.lock();
        self.require_pipeline_bound(&cmd)?;

        let image = self.image(&mut cmd, image_id, false)?;
        cmd.bind_image_view(
            bind_point,
            BoundImageView {
                instance: image,
                view_index: 0,
                shader_writeable,
            },
        );
        Ok(())
    }

    //
    // Draws and dispatches
    //

    pub fn cmd_draw_indexed(
        &self,
        pass: RenderPass,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) -> Result<()> {
        let command_buffer = self.command_buffer(pass.command_buffer_id)?;
        let mut cmd = command_buffer.lock();
        self.prepare_draw(&mut cmd, false)?;
        cmd.cmd_draw_indexed(
            index_count,
            instance_count,
            first_index,
            vertex_offset,
            first_instance,
        );
        barrier_set_resources(&mut cmd, false, true);
        Ok(())
    }

    /// Draw from GPU-written [`IndirectDrawCommand`]s.
    pub fn cmd_draw_indexed_indirect(
        &self,
        pass: RenderPass,
        commands_buffer_id: BufferId,
        commands_byte_offset: u64,
        draw_count: u32,
    ) -> Result<()> {
        let command_buffer = self.command_buffer(pass.command_buffer_id)?;
        let mut cmd = command_buffer.lock();
        let commands = self.buffer(commands_buffer_id, false)?;
        self.prepare_draw(&mut cmd, false)?;
        cmd.cmd_draw_indexed_indirect(
            commands.vk_buffer,
            commands_byte_offset,
            draw_count,
            std::mem::size_of::<IndirectDrawCommand>() as u32,
        );
        barrier_set_resources(&mut cmd, false, true);
        Ok(())
    }

    /// Draw from GPU-written commands with a GPU-written draw count.
    #[allow(clippy::too_many_arguments)]
    pub fn cmd_draw_indexed_indirect_count(
        &self,
        pass: RenderPass,
        commands_buffer_id: BufferId,
        commands_byte_offset: u64,
        count_buffer_id: BufferId,
        count_byte_offset: u64,
        max_draw_count: u32,
    ) -> Result<()> {
        let command_buffer = self.command_buffer(pass.command_buffer_id)?;
        let mut cmd = command_buffer.lock();
        let commands = self.buffer(commands_buffer_id, false)?;
        let counts = self.buffer(count_buffer_id, false)?;
        self.prepare_draw(&mut cmd, false)?;
        cmd.cmd_draw_indexed_indirect_count(
            commands.vk_buffer,
            commands_byte_offset,
            counts.vk_buffer,
            count_byte_offset,
            max_draw_count,
            std::mem::size_of::<IndirectDrawCommand>() as u32,
        );
        barrier_set_resources(&mut cmd, false, true);
        Ok(())
    }

    pub fn cmd_dispatch(
        &self,
        pass: ComputePass,
        group_count_x: u32,
        group_count_y: u32,
        group_count_z: u32,
    ) -> Result<()> {
        let command_buffer = self.command_buffer(pass.command_buffer_id)?;
        let mut cmd = command_buffer.lock();
        self.prepare_draw(&mut cmd, true)?;
        cmd.cmd_dispatch(group_count_x, group_count_y, group_count_z);
        barrier_set_resources(&mut cmd, true, true);
        Ok(())
    }

    /// Refresh dirty descriptor sets and barrier every bound set resource
    /// into its shader usage mode.
    fn prepare_draw(&self, cmd: &mut CommandBuffer, compute: bool) -> Result<()> {
        if compute {
            if !cmd.is_in_compute_pass() {
                return Err(GpuError::InvalidState(
                    "dispatches are only allowed inside a compute pass".into(),
                ));
            }
        } else if !cmd.is_in_render_pass() {
            return Err(GpuError::InvalidState(
                "draws are only allowed inside a render pass".into(),
            ));
        }
        self.require_pipeline_bound(cmd)?;
        self.bind_descriptor_sets_needing_refresh(cmd)?;
        barrier_set_resources(cmd, compute, false);
        Ok(())
    }

    /// Materialize and bind the contiguous run of descriptor sets dirtied
    /// since the last draw, with dynamic offsets ordered by binding index.
    fn bind_descriptor_sets_needing_refresh(&self, cmd: &mut CommandBuffer) -> Result<()> {
        let Some(pass_state) = cmd.pass_state() else {
            return Err(GpuError::InvalidState("no pass is open".into()));
        };
        let Some(pipeline) = pass_state.bound_pipeline.clone() else {
            return Err(GpuError::InvalidState("no pipeline is bound".into()));
        };

        // Dirtying set N dirties N..=3, so the dirty flags are a suffix
        let Some(first_dirty) = pass_state
            .sets_needing_refresh
            .iter()
            .position(|dirty| *dirty)
        else {
            return Ok(());
        };
        let set_bindings = pass_state.set_bindings[first_dirty..].to_vec();
        let tag = cmd.tag().to_string();

        let descriptor_sets = self.ensure_thread_descriptor_sets();

        let mut sets = Vec::with_capacity(set_bindings.len());
        let mut dynamic_offsets = Vec::new();
        for (index, bindings) in set_bindings.iter().enumerate() {
            let set_index = first_dirty + index;
            let set =
                descriptor_sets.get_descriptor_set(&pipeline.set_layouts[set_index], bindings, &tag)?;

            let mut dynamic: Vec<(u32, u32)> = bindings
                .buffers
                .iter()
                .filter(|(_, bound)| {
                    matches!(
                        bound.descriptor_type,
                        vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC
                            | vk::DescriptorType::STORAGE_BUFFER_DYNAMIC
                    )
                })
                .map(|(binding, bound)| (*binding, bound.dynamic_byte_offset.unwrap_or(0)))
                .collect();
            dynamic.sort_unstable_by_key(|(binding, _)| *binding);
            dynamic_offsets.extend(dynamic.into_iter().map(|(_, offset)| offset));

            sets.push(set);
        }

        cmd.cmd_bind_descriptor_sets(&pipeline, first_dirty as u32, &sets, &dynamic_offsets);

        if let Some(pass_state) = cmd.pass_state_mut() {
            for flag in &mut pass_state.sets_needing_refresh[first_dirty..] {
                *flag = false;
            }
        }
        Ok(())
    }

    fn require_pipeline_bound(&self, cmd: &CommandBuffer) -> Result<()> {
        let bound = cmd
            .pass_state()
            .is_some_and(|pass_state| pass_state.bound_pipeline.is_some());
        if bound {
            Ok(())
        } else {
            Err(GpuError::InvalidState("no pipeline is bound".into()))
        }
    }

    //
    // Timestamps
    //

    /// Whether the current frame carries a timestamp pool.
    #[must_use]
    pub fn has_timestamp_support(&self) -> bool {
        self.frames
            .with_current_frame(|frame| frame.timestamps_mut().is_some())
    }

    /// Read back the current frame's timestamp results from the GPU.
    pub fn sync_down_frame_timestamps(&self) {
        self.frames.with_current_frame(|frame| {
            if let Some(timestamps) = frame.timestamps_mut() {
                timestamps.sync_down();
            } else {
                error!("frame has no timestamp support");
            }
        });
    }

    /// Reset the current frame's timestamp pool for a new round of writes.
    pub fn reset_frame_timestamps_for_recording(
        &self,
        command_buffer_id: CommandBufferId,
    ) -> Result<()> {
        let command_buffer = self.command_buffer(command_buffer_id)?;
        self.frames.with_current_frame(|frame| {
            let Some(timestamps) = frame.timestamps_mut() else {
                return Err(GpuError::InvalidState(
                    "frame has no timestamp support".into(),
                ));
            };
            timestamps.reset_for_recording(&command_buffer.lock());
            Ok(())
        })
    }

    /// Write the opening timestamp of a named span.
    pub fn cmd_write_timestamp_start(
        &self,
        command_buffer_id: CommandBufferId,
        name: &str,
    ) -> Result<()> {
        let command_buffer = self.command_buffer(command_buffer_id)?;
        self.frames.with_current_frame(|frame| {
            let Some(timestamps) = frame.timestamps_mut() else {
                return Err(GpuError::InvalidState(
                    "frame has no timestamp support".into(),
                ));
            };
            timestamps.write_start(&command_buffer.lock(), name, 1);
            Ok(())
        })
    }

    /// Write the closing timestamp of a named span.
    pub fn cmd_write_timestamp_finish(
        &self,
        command_buffer_id: CommandBufferId,
        name: &str,
    ) -> Result<()> {
        let command_buffer = self.command_buffer(command_buffer_id)?;
        self.frames.with_current_frame(|frame| {
            let Some(timestamps) = frame.timestamps_mut() else {
                return Err(GpuError::InvalidState(
                    "frame has no timestamp support".into(),
                ));
            };
            timestamps.write_finish(&command_buffer.lock(), name);
            Ok(())
        })
    }

    /// The synced-down duration of a named span in milliseconds, or `None`
    /// when it has not completed.
    #[must_use]
    pub fn timestamp_diff_ms(&self, name: &str, offset: u32) -> Option<f32> {
        self.frames.with_current_frame(|frame| {
            frame
                .timestamps_mut()
                .and_then(|timestamps| timestamps.diff_ms(name, offset))
        })
    }

    //
    // Debug sections
    //

    pub fn cmd_push_debug_section(&self, command_buffer_id: CommandBufferId, name: &str) -> Result<()> {
        let command_buffer = self.command_buffer(command_buffer_id)?;
        command_buffer.lock().cmd_push_debug_section(name);
        Ok(())
    }

    pub fn cmd_pop_debug_section(&self, command_buffer_id: CommandBufferId) -> Result<()> {
        let command_buffer = self.command_buffer(command_buffer_id)?;
        command_buffer.lock().cmd_pop_debug_section();
        Ok(())
    }

    //
    // Lookup helpers
    //

    fn command_buffer(
        &self,
        id: CommandBufferId,
    ) -> Result<Arc<Mutex<CommandBuffer>>> {
        self.command_buffers.get_command_buffer(id).ok_or_else(|| {
            GpuError::ResourceNotFound(format!("no such command buffer: {}", id.0))
        })
    }

    fn buffer(&self, buffer_id: BufferId, cycled: bool) -> Result<BufferInstance> {
        self.buffers.get_buffer(buffer_id, cycled).ok_or_else(|| {
            GpuError::ResourceNotFound(format!("no such buffer: {}", buffer_id.0))
        })
    }

    fn image(
        &self,
        cmd: &mut CommandBuffer,
        image_id: ImageId,
        cycle: bool,
    ) -> Result<ImageInstance> {
        self.images
            .get_image(image_id, cycle, Some(cmd))
            .ok_or_else(|| {
                GpuError::ResourceNotFound(format!("no such image: {}", image_id.0))
            })
    }
}

impl Drop for Gpu {
    fn drop(&mut self) {
        self.shutdown();
    }
}

//
// Free helpers
//

fn semaphore_submit_info(op: SemaphoreOp) -> vk::SemaphoreSubmitInfo<'static> {
    vk::SemaphoreSubmitInfo::default()
        .semaphore(op.semaphore)
        .stage_mask(op.stage_mask)
}

fn vk_load_op(load_op: LoadOp) -> vk::AttachmentLoadOp {
    match load_op {
        LoadOp::Load => vk::AttachmentLoadOp::LOAD,
        LoadOp::Clear => vk::AttachmentLoadOp::CLEAR,
        LoadOp::DontCare => vk::AttachmentLoadOp::DONT_CARE,
    }
}

fn vk_store_op(store_op: StoreOp) -> vk::AttachmentStoreOp {
    match store_op {
        StoreOp::Store => vk::AttachmentStoreOp::STORE,
        StoreOp::DontCare => vk::AttachmentStoreOp::DONT_CARE,
    }
}

fn vk_subresource_range(range: &ImageSubresourceRange) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: match range.image_aspect {
            ImageAspect::Color => vk::ImageAspectFlags::COLOR,
            ImageAspect::Depth => vk::ImageAspectFlags::DEPTH,
        },
        base_mip_level: range.base_mip_level,
        level_count: range.level_count,
        base_array_layer: range.base_array_layer,
        layer_count: range.layer_count,
    }
}

/// Layered images expose view 0 for the whole resource and one view per
/// layer after it; single-layer images only have the whole view.
fn attachment_view(image: &ImageInstance, layer: u32) -> Result<vk::ImageView> {
    let view_index = if image.def.num_layers > 1 {
        layer as usize + 1
    } else {
        0
    };
    image
        .views
        .get(view_index)
        .map(|view| view.vk_image_view)
        .ok_or_else(|| {
            GpuError::InvalidParameters(format!("attachment layer out of range: {layer}"))
        })
}

fn mip_extent(image: &ImageInstance, mip_level: u32) -> vk::Extent3D {
    vk::Extent3D {
        width: (image.def.vk_extent.width >> mip_level).max(1),
        height: (image.def.vk_extent.height >> mip_level).max(1),
        depth: (image.def.vk_extent.depth >> mip_level).max(1),
    }
}

fn validate_region(image: &ImageInstance, region: &ImageRegion, what: &str) -> Result<()> {
    if region.mip_level >= image.def.num_mip_levels {
        return Err(GpuError::InvalidParameters(format!(
            "{what} mip level out of range: {}",
            region.mip_level
        )));
    }
    if region.layer_index >= image.def.num_layers {
        return Err(GpuError::InvalidParameters(format!(
            "{what} layer out of range: {}",
            region.layer_index
        )));
    }

    let extent = mip_extent(image, region.mip_level);
    for offset in &region.offsets {
        if offset.x > extent.width || offset.y > extent.height || offset.z > extent.depth {
            return Err(GpuError::InvalidParameters(format!(
                "{what} region exceeds the mip extent"
            )));
        }
    }
    Ok(())
}

/// Region offsets as blit corners. Non-3D images get their z corners forced
/// to the full 0..1 slab.
fn region_offsets(image: &ImageInstance, region: &ImageRegion) -> [vk::Offset3D; 2] {
    let is_3d = image.def.vk_image_type == vk::ImageType::TYPE_3D;
    let corner = |offset: Point3D, full_z: i32| vk::Offset3D {
        x: offset.x as i32,
        y: offset.y as i32,
        z: if is_3d { offset.z as i32 } else { full_z },
    };
    [
        corner(region.offsets[0], 0),
        corner(region.offsets[1], 1),
    ]
}

/// The copy extent a region describes; a zero second offset means the whole
/// mip extent.
fn region_extent(image: &ImageInstance, region: &ImageRegion) -> vk::Extent3D {
    let second = region.offsets[1];
    if second.x == 0 && second.y == 0 && second.z == 0 {
        return mip_extent(image, region.mip_level);
    }
    let first = region.offsets[0];
    vk::Extent3D {
        width: second.x.saturating_sub(first.x),
        height: second.y.saturating_sub(first.y),
        depth: second.z.saturating_sub(first.z).max(1),
    }
}

fn region_subresource_layers(
    image: &ImageInstance,
    region: &ImageRegion,
) -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers {
        aspect_mask: image.aspect_flags(),
        mip_level: region.mip_level,
        base_array_layer: region.layer_index,
        layer_count: 1,
    }
}

fn region_subresource_range(
    image: &ImageInstance,
    region: &ImageRegion,
) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: image.aspect_flags(),
        base_mip_level: region.mip_level,
        level_count: 1,
        base_array_layer: region.layer_index,
        layer_count: 1,
    }
}

/// Vertex and index bindings never reach a descriptor write; the descriptor
/// type is an inert filler used only for change detection.
fn vertex_index_binding(instance: BufferInstance, byte_offset: u64) -> BoundBuffer {
    BoundBuffer {
        byte_size: instance.def.byte_size,
        instance,
        descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
        shader_writeable: false,
        byte_offset,
        dynamic_byte_offset: None,
    }
}

fn storage_buffer_binding(instance: BufferInstance, shader_writeable: bool) -> BoundBuffer {
    BoundBuffer {
        byte_size: instance.def.byte_size,
        instance,
        descriptor_type: vk::DescriptorType::STORAGE_BUFFER,
        shader_writeable,
        byte_offset: 0,
        dynamic_byte_offset: None,
    }
}

fn graphics_buffer_usage_mode(bound: &BoundBuffer) -> Option<BufferUsageMode> {
    match bound.descriptor_type {
        vk::DescriptorType::UNIFORM_BUFFER | vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC => {
            Some(BufferUsageMode::GraphicsUniformRead)
        }
        vk::DescriptorType::STORAGE_BUFFER | vk::DescriptorType::STORAGE_BUFFER_DYNAMIC => {
            Some(BufferUsageMode::GraphicsStorageRead)
        }
        _ => None,
    }
}

fn compute_buffer_usage_mode(bound: &BoundBuffer) -> Option<BufferUsageMode> {
    match bound.descriptor_type {
        vk::DescriptorType::UNIFORM_BUFFER | vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC => {
            Some(BufferUsageMode::ComputeUniformRead)
        }
        vk::DescriptorType::STORAGE_BUFFER | vk::DescriptorType::STORAGE_BUFFER_DYNAMIC => {
            Some(if bound.shader_writeable {
                BufferUsageMode::ComputeStorageReadWrite
            } else {
                BufferUsageMode::ComputeStorageRead
            })
        }
        _ => None,
    }
}

/// Transition every resource bound through the open pass's descriptor sets
/// between its default usage mode and its shader usage mode.
fn barrier_set_resources(cmd: &mut CommandBuffer, compute: bool, back_to_default: bool) {
    let Some(pass_state) = cmd.pass_state() else {
        return;
    };
    let set_bindings = pass_state.set_bindings.clone();

    for bindings in &set_bindings {
        for bound in bindings.buffers.values() {
            let mode = if compute {
                compute_buffer_usage_mode(bound)
            } else {
                graphics_buffer_usage_mode(bound)
            };
            let Some(mode) = mode else {
                error!(descriptor_type = ?bound.descriptor_type, "unsupported buffer descriptor type");
                continue;
            };
            // Dynamic uniforms barrier the slice the dynamic offset selected
            let byte_offset = match bound.dynamic_byte_offset {
                Some(dynamic) if !compute => u64::from(dynamic),
                _ => bound.byte_offset,
            };
            let (source, dest) = if back_to_default {
                (mode, bound.instance.def.default_usage_mode)
            } else {
                (bound.instance.def.default_usage_mode, mode)
            };
            cmd.cmd_buffer_pipeline_barrier(
                bound.instance.vk_buffer,
                byte_offset,
                bound.byte_size,
                source,
                dest,
            );
        }

        for bound in bindings.image_views.values() {
            let mode = if compute {
                if bound.shader_writeable {
                    ImageUsageMode::ComputeStorageReadWrite
                } else {
                    ImageUsageMode::ComputeStorageRead
                }
            } else {
                ImageUsageMode::GraphicsStorageRead
            };
            let (source, dest) = if back_to_default {
                (mode, bound.instance.default_usage_mode)
            } else {
                (bound.instance.default_usage_mode, mode)
            };
            let range = bound.instance.whole_subresource_range();
            cmd.cmd_image_pipeline_barrier(bound.instance.vk_image, range, source, dest);
        }

        for array in bindings.image_view_samplers.values() {
            for bound in array.values() {
                let mode = if compute {
                    ImageUsageMode::ComputeSampled
                } else {
                    ImageUsageMode::GraphicsSampled
                };
                let (source, dest) = if back_to_default {
                    (mode, bound.instance.default_usage_mode)
                } else {
                    (bound.instance.default_usage_mode, mode)
                };
                let range = bound.instance.whole_subresource_range();
                cmd.cmd_image_pipeline_barrier(bound.instance.vk_image, range, source, dest);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::barriers::BufferUsageMode;
    use crate::buffers::BufferDef;
    use gpu_allocator::MemoryLocation;

    fn test_instance(descriptor_type: vk::DescriptorType) -> BoundBuffer {
        let instance = BufferInstance {
            vk_buffer: vk::Buffer::null(),
            def: BufferDef {
                is_transfer_buffer: false,
                default_usage_mode: BufferUsageMode::GraphicsStorageRead,
                byte_size: 256,
                vk_usage_flags: vk::BufferUsageFlags::STORAGE_BUFFER,
                location: MemoryLocation::GpuOnly,
                host_visible: false,
                dedicated: false,
            },
        };
        BoundBuffer {
            instance,
            descriptor_type,
            shader_writeable: false,
            byte_offset: 0,
            byte_size: 256,
            dynamic_byte_offset: None,
        }
    }

    #[test]
    fn graphics_buffer_modes() {
        let uniform = test_instance(vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC);
        assert_eq!(
            graphics_buffer_usage_mode(&uniform),
            Some(BufferUsageMode::GraphicsUniformRead)
        );

        let storage = test_instance(vk::DescriptorType::STORAGE_BUFFER);
        assert_eq!(
            graphics_buffer_usage_mode(&storage),
            Some(BufferUsageMode::GraphicsStorageRead)
        );

        let sampler = test_instance(vk::DescriptorType::COMBINED_IMAGE_SAMPLER);
        assert_eq!(graphics_buffer_usage_mode(&sampler), None);
    }

    #[test]
    fn compute_buffer_modes_honor_writeability() {
        let mut storage = test_instance(vk::DescriptorType::STORAGE_BUFFER);
        assert_eq!(
            compute_buffer_usage_mode(&storage),
            Some(BufferUsageMode::ComputeStorageRead)
        );
        storage.shader_writeable = true;
        assert_eq!(
            compute_buffer_usage_mode(&storage),
            Some(BufferUsageMode::ComputeStorageReadWrite)
        );

        let uniform = test_instance(vk::DescriptorType::UNIFORM_BUFFER);
        assert_eq!(
            compute_buffer_usage_mode(&uniform),
            Some(BufferUsageMode::ComputeUniformRead)
        );
    }

    #[test]
    fn load_store_op_mapping() {
        assert_eq!(vk_load_op(LoadOp::Clear), vk::AttachmentLoadOp::CLEAR);
        assert_eq!(vk_load_op(LoadOp::Load), vk::AttachmentLoadOp::LOAD);
        assert_eq!(vk_store_op(StoreOp::Store), vk::AttachmentStoreOp::STORE);
        assert_eq!(
            vk_store_op(StoreOp::DontCare),
            vk::AttachmentStoreOp::DONT_CARE
        );
    }

    #[test]
    fn subresource_range_mapping() {
        let range = ImageSubresourceRange {
            image_aspect: ImageAspect::Depth,
            base_mip_level: 2,
            level_count: 3,
            base_array_layer: 1,
            layer_count: 4,
        };
        let vk_range = vk_subresource_range(&range);
        assert_eq!(vk_range.aspect_mask, vk::ImageAspectFlags::DEPTH);
        assert_eq!(vk_range.base_mip_level, 2);
        assert_eq!(vk_range.level_count, 3);
        assert_eq!(vk_range.base_array_layer, 1);
        assert_eq!(vk_range.layer_count, 4);
    }

    #[test]
    fn indirect_command_stride_matches_vulkan() {
        assert_eq!(
            std::mem::size_of::<IndirectDrawCommand>(),
            std::mem::size_of::<vk::DrawIndexedIndirectCommand>()
        );
    }
}
