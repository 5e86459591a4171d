//! Command buffer recording and per-command-buffer resource tracking.
//!
//! Every recorded operation registers the native handles it touches; each
//! handle's GPU usage count is incremented once per command buffer and
//! released in one batch when the command buffer's work is confirmed
//! finished. Barrier synthesis lives here too: operations transition
//! resources from a source usage mode to a destination mode, and identical
//! modes are skipped.

use std::sync::Arc;

use ash::vk;
use hashbrown::HashSet;
use tracing::error;

use crate::barriers::{
    dest_buffer_barrier_flags, dest_image_barrier_flags, source_buffer_barrier_flags,
    source_image_barrier_flags, BufferUsageMode, ImageUsageMode,
};
use crate::context::DeviceContext;
use crate::descriptors::DescriptorSet;
use crate::error::{GpuError, Result};
use crate::ids::CommandBufferId;
use crate::pass_state::{
    BoundBuffer, BoundImageView, BoundImageViewSampler, PassAttachment, PassState,
};
use crate::pipelines::Pipeline;
use crate::types::IndexType;
use crate::usage::Usages;

/// Primary buffers are submitted to a queue; secondary buffers are recorded
/// on worker threads and stitched in via `cmd_execute_commands`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBufferType {
    Primary,
    Secondary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBufferState {
    Default,
    CopyPass,
    RenderPass,
    ComputePass,
}

/// A semaphore paired with the pipeline stage it waits at or signals from.
#[derive(Debug, Clone, Copy)]
pub struct SemaphoreOp {
    pub semaphore: vk::Semaphore,
    pub stage_mask: vk::PipelineStageFlags2,
}

pub struct CommandBuffer {
    context: Arc<DeviceContext>,
    usages: Arc<Usages>,
    tag: String,
    cb_type: CommandBufferType,
    id: CommandBufferId,
    vk_command_buffer: vk::CommandBuffer,
    vk_command_pool: vk::CommandPool,

    // Primary command buffers only
    fence: vk::Fence,
    signal_semaphores: Vec<SemaphoreOp>,
    wait_semaphores: Vec<SemaphoreOp>,
    configured_for_present: bool,
    secondary_command_buffers: HashSet<CommandBufferId>,

    used_images: HashSet<vk::Image>,
    used_image_views: HashSet<vk::ImageView>,
    used_buffers: HashSet<vk::Buffer>,
    used_pipelines: HashSet<vk::Pipeline>,
    used_shaders: HashSet<vk::ShaderModule>,
    used_descriptor_sets: HashSet<vk::DescriptorSet>,
    used_samplers: HashSet<vk::Sampler>,

    state: CommandBufferState,
    pass_state: Option<PassState>,
}

impl CommandBuffer {
    pub(crate) fn new(
        context: Arc<DeviceContext>,
        usages: Arc<Usages>,
        tag: String,
        cb_type: CommandBufferType,
        id: CommandBufferId,
        vk_command_buffer: vk::CommandBuffer,
        vk_command_pool: vk::CommandPool,
        fence: vk::Fence,
    ) -> Self {
        Self {
            context,
            usages,
            tag,
            cb_type,
            id,
            vk_command_buffer,
            vk_command_pool,
            fence,
            signal_semaphores: Vec::new(),
            wait_semaphores: Vec::new(),
            configured_for_present: false,
            secondary_command_buffers: HashSet::new(),
            used_images: HashSet::new(),
            used_image_views: HashSet::new(),
            used_buffers: HashSet::new(),
            used_pipelines: HashSet::new(),
            used_shaders: HashSet::new(),
            used_descriptor_sets: HashSet::new(),
            used_samplers: HashSet::new(),
            state: CommandBufferState::Default,
            pass_state: None,
        }
    }

    #[must_use]
    pub fn id(&self) -> CommandBufferId {
        self.id
    }

    #[must_use]
    pub fn tag(&self) -> &str {
        &self.tag
    }

    #[must_use]
    pub fn cb_type(&self) -> CommandBufferType {
        self.cb_type
    }

    #[must_use]
    pub fn vk_command_buffer(&self) -> vk::CommandBuffer {
        self.vk_command_buffer
    }

    #[must_use]
    pub fn vk_command_pool(&self) -> vk::CommandPool {
        self.vk_command_pool
    }

    #[must_use]
    pub fn fence(&self) -> vk::Fence {
        self.fence
    }

    #[must_use]
    pub fn pass_state(&self) -> Option<&PassState> {
        self.pass_state.as_ref()
    }

    #[must_use]
    pub fn pass_state_mut(&mut self) -> Option<&mut PassState> {
        self.pass_state.as_mut()
    }

    #[must_use]
    pub fn secondary_command_buffer_ids(&self) -> &HashSet<CommandBufferId> {
        &self.secondary_command_buffers
    }

    /// Marks this primary command buffer as presenting: it waits on the
    /// frame's image-available semaphore and signals its work-complete
    /// semaphore.
    pub fn configure_for_presentation(&mut self, wait_on: SemaphoreOp, signal_on: SemaphoreOp) {
        self.wait_semaphores.push(wait_on);
        self.signal_semaphores.push(signal_on);
        self.configured_for_present = true;
    }

    #[must_use]
    pub fn is_configured_for_presentation(&self) -> bool {
        self.configured_for_present
    }

    #[must_use]
    pub fn wait_semaphores(&self) -> &[SemaphoreOp] {
        &self.wait_semaphores
    }

    #[must_use]
    pub fn signal_semaphores(&self) -> &[SemaphoreOp] {
        &self.signal_semaphores
    }

    //
    // Recording lifecycle
    //

    pub fn begin_recording(&self) -> Result<()> {
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.context
                .device()
                .begin_command_buffer(self.vk_command_buffer, &begin_info)?;
        }
        Ok(())
    }

    pub fn end_recording(&self) -> Result<()> {
        unsafe {
            self.context
                .device()
                .end_command_buffer(self.vk_command_buffer)?;
        }
        Ok(())
    }

    //
    // Pass state machine
    //

    #[must_use]
    pub fn is_in_any_pass(&self) -> bool {
        self.state != CommandBufferState::Default
    }

    #[must_use]
    pub fn is_in_copy_pass(&self) -> bool {
        self.state == CommandBufferState::CopyPass
    }

    #[must_use]
    pub fn is_in_render_pass(&self) -> bool {
        self.state == CommandBufferState::RenderPass
    }

    #[must_use]
    pub fn is_in_compute_pass(&self) -> bool {
        self.state == CommandBufferState::ComputePass
    }

    pub fn begin_copy_pass(&mut self) -> Result<()> {
        if self.state != CommandBufferState::Default {
            return Err(GpuError::InvalidState(
                "can't begin a copy pass within another pass".into(),
            ));
        }
        self.state = CommandBufferState::CopyPass;
        Ok(())
    }

    pub fn end_copy_pass(&mut self) -> Result<()> {
        if self.state != CommandBufferState::CopyPass {
            return Err(GpuError::InvalidState("not in a copy pass".into()));
        }
        self.state = CommandBufferState::Default;
        Ok(())
    }

    pub fn begin_render_pass(&mut self) -> Result<()> {
        if self.state != CommandBufferState::Default {
            return Err(GpuError::InvalidState(
                "can't begin a render pass within another pass".into(),
            ));
        }
        self.state = CommandBufferState::RenderPass;
        Ok(())
    }

    pub fn end_render_pass(&mut self) -> Result<()> {
        if self.state != CommandBufferState::RenderPass {
            return Err(GpuError::InvalidState("not in a render pass".into()));
        }
        self.state = CommandBufferState::Default;
        Ok(())
    }

    pub fn begin_compute_pass(&mut self) -> Result<()> {
        if self.state != CommandBufferState::Default {
            return Err(GpuError::InvalidState(
                "can't begin a compute pass within another pass".into(),
            ));
        }
        self.state = CommandBufferState::ComputePass;
        self.pass_state = Some(PassState::new());
        Ok(())
    }

    pub fn end_compute_pass(&mut self) -> Result<()> {
        if self.state != CommandBufferState::ComputePass {
            return Err(GpuError::InvalidState("not in a compute pass".into()));
        }
        self.state = CommandBufferState::Default;
        self.pass_state = None;
        Ok(())
    }

    //
    // Barriers
    //

    /// Transitions an image between usage modes. Identical modes are a no-op.
    pub fn cmd_image_pipeline_barrier(
        &mut self,
        vk_image: vk::Image,
        subresource_range: vk::ImageSubresourceRange,
        source_mode: ImageUsageMode,
        dest_mode: ImageUsageMode,
    ) {
        if source_mode == dest_mode {
            return;
        }

        let source = source_image_barrier_flags(source_mode);
        let dest = dest_image_barrier_flags(dest_mode);

        let barrier = vk::ImageMemoryBarrier2::default()
            .image(vk_image)
            .subresource_range(subresource_range)
            .src_stage_mask(source.stage_mask)
            .src_access_mask(source.access_mask)
            .dst_stage_mask(dest.stage_mask)
            .dst_access_mask(dest.access_mask)
            .old_layout(source.layout)
            .new_layout(dest.layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED);
        let dependency_info =
            vk::DependencyInfo::default().image_memory_barriers(std::slice::from_ref(&barrier));
        unsafe {
            self.context
                .device()
                .cmd_pipeline_barrier2(self.vk_command_buffer, &dependency_info);
        }

        self.record_image_usage(vk_image);
    }

    /// Transitions a freshly acquired swapchain image from undefined to its
    /// color-attachment default. The source stage must match the stage the
    /// image-available semaphore is waited on at submit, so this bypasses the
    /// usage-mode flag tables.
    pub fn cmd_swapchain_acquire_barrier(&mut self, vk_image: vk::Image) {
        let barrier = vk::ImageMemoryBarrier2::default()
            .image(vk_image)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            })
            .src_stage_mask(vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT)
            .src_access_mask(vk::AccessFlags2::NONE)
            .dst_stage_mask(vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT)
            .dst_access_mask(vk::AccessFlags2::COLOR_ATTACHMENT_WRITE)
            .old_layout(vk::ImageLayout::UNDEFINED)
            .new_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED);
        let dependency_info =
            vk::DependencyInfo::default().image_memory_barriers(std::slice::from_ref(&barrier));
        unsafe {
            self.context
                .device()
                .cmd_pipeline_barrier2(self.vk_command_buffer, &dependency_info);
        }

        self.record_image_usage(vk_image);
    }

    /// Transitions a buffer range between usage modes. Identical modes are a
    /// no-op.
    pub fn cmd_buffer_pipeline_barrier(
        &mut self,
        vk_buffer: vk::Buffer,
        byte_offset: u64,
        byte_size: u64,
        source_mode: BufferUsageMode,
        dest_mode: BufferUsageMode,
    ) {
        if source_mode == dest_mode {
            return;
        }

        let source = source_buffer_barrier_flags(source_mode);
        let dest = dest_buffer_barrier_flags(dest_mode);

        let barrier = vk::BufferMemoryBarrier2::default()
            .buffer(vk_buffer)
            .offset(byte_offset)
            .size(byte_size)
            .src_stage_mask(source.stage_mask)
            .src_access_mask(source.access_mask)
            .dst_stage_mask(dest.stage_mask)
            .dst_access_mask(dest.access_mask)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED);
        let dependency_info =
            vk::DependencyInfo::default().buffer_memory_barriers(std::slice::from_ref(&barrier));
        unsafe {
            self.context
                .device()
                .cmd_pipeline_barrier2(self.vk_command_buffer, &dependency_info);
        }

        self.record_buffer_usage(vk_buffer);
    }

    //
    // Transfer and clear operations
    //

    pub fn cmd_clear_color_image(
        &mut self,
        vk_image: vk::Image,
        layout: vk::ImageLayout,
        color: &vk::ClearColorValue,
        ranges: &[vk::ImageSubresourceRange],
    ) {
        unsafe {
            self.context.device().cmd_clear_color_image(
                self.vk_command_buffer,
                vk_image,
                layout,
                color,
                ranges,
            );
        }
        self.record_image_usage(vk_image);
    }

    pub fn cmd_blit_image(
        &mut self,
        src_image: vk::Image,
        src_layout: vk::ImageLayout,
        dst_image: vk::Image,
        dst_layout: vk::ImageLayout,
        blit: vk::ImageBlit,
        filter: vk::Filter,
    ) {
        unsafe {
            self.context.device().cmd_blit_image(
                self.vk_command_buffer,
                src_image,
                src_layout,
                dst_image,
                dst_layout,
                &[blit],
                filter,
            );
        }
        self.record_image_usage(src_image);
        self.record_image_usage(dst_image);
    }

    pub fn cmd_copy_buffer(
        &mut self,
        src_buffer: vk::Buffer,
        dst_buffer: vk::Buffer,
        regions: &[vk::BufferCopy2],
    ) {
        let copy_info = vk::CopyBufferInfo2::default()
            .src_buffer(src_buffer)
            .dst_buffer(dst_buffer)
            .regions(regions);
        unsafe {
            self.context
                .device()
                .cmd_copy_buffer2(self.vk_command_buffer, &copy_info);
        }
        self.record_buffer_usage(src_buffer);
        self.record_buffer_usage(dst_buffer);
    }

    pub fn cmd_copy_buffer_to_image(
        &mut self,
        src_buffer: vk::Buffer,
        dst_image: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy2],
    ) {
        let copy_info = vk::CopyBufferToImageInfo2::default()
            .src_buffer(src_buffer)
            .dst_image(dst_image)
            .dst_image_layout(dst_layout)
            .regions(regions);
        unsafe {
            self.context
                .device()
                .cmd_copy_buffer_to_image2(self.vk_command_buffer, &copy_info);
        }
        self.record_buffer_usage(src_buffer);
        self.record_image_usage(dst_image);
    }

    pub fn cmd_copy_image_to_buffer(
        &mut self,
        src_image: vk::Image,
        src_layout: vk::ImageLayout,
        dst_buffer: vk::Buffer,
        regions: &[vk::BufferImageCopy2],
    ) {
        let copy_info = vk::CopyImageToBufferInfo2::default()
            .src_image(src_image)
            .src_image_layout(src_layout)
            .dst_buffer(dst_buffer)
            .regions(regions);
        unsafe {
            self.context
                .device()
                .cmd_copy_image_to_buffer2(self.vk_command_buffer, &copy_info);
        }
        self.record_image_usage(src_image);
        self.record_buffer_usage(dst_buffer);
    }

    /// Stitches recorded secondary command buffers into this primary one and
    /// remembers them so their retirement is tied to this buffer's fence.
    pub fn cmd_execute_commands(&mut self, secondaries: &[(CommandBufferId, vk::CommandBuffer)]) {
        let vk_buffers: Vec<vk::CommandBuffer> =
            secondaries.iter().map(|(_, vk_cb)| *vk_cb).collect();
        unsafe {
            self.context
                .device()
                .cmd_execute_commands(self.vk_command_buffer, &vk_buffers);
        }
        for (id, _) in secondaries {
            if self.secondary_command_buffers.insert(*id) {
                self.usages.command_buffers.increment_gpu_usage(id);
            }
        }
    }

    //
    // Dynamic rendering
    //

    pub fn cmd_begin_rendering(
        &mut self,
        render_area: vk::Rect2D,
        color_attachments: Vec<(PassAttachment, vk::RenderingAttachmentInfo<'static>)>,
        depth_attachment: Option<(PassAttachment, vk::RenderingAttachmentInfo<'static>)>,
    ) {
        let mut pass_state = PassState::new();

        let color_infos: Vec<vk::RenderingAttachmentInfo> = color_attachments
            .iter()
            .map(|(_, info)| *info)
            .collect();

        let mut rendering_info = vk::RenderingInfo::default()
            .render_area(render_area)
            .layer_count(1)
            .color_attachments(&color_infos);

        let depth_info = depth_attachment.as_ref().map(|(_, info)| *info);
        if let Some(depth_info) = &depth_info {
            rendering_info = rendering_info.depth_attachment(depth_info);
        }

        unsafe {
            self.context
                .device()
                .cmd_begin_rendering(self.vk_command_buffer, &rendering_info);
        }

        for (attachment, _) in &color_attachments {
            self.record_image_usage(attachment.image.vk_image);
        }
        if let Some((attachment, _)) = &depth_attachment {
            self.record_image_usage(attachment.image.vk_image);
        }

        pass_state.color_attachments = color_attachments
            .into_iter()
            .map(|(attachment, _)| attachment)
            .collect();
        pass_state.depth_attachment = depth_attachment.map(|(attachment, _)| attachment);
        self.pass_state = Some(pass_state);
    }

    pub fn cmd_end_rendering(&mut self) {
        unsafe {
            self.context.device().cmd_end_rendering(self.vk_command_buffer);
        }
        self.pass_state = None;
    }

    //
    // Bind and draw/dispatch operations
    //

    pub fn cmd_bind_pipeline(&mut self, pipeline: &Pipeline) {
        let Some(pass_state) = self.pass_state.as_mut() else {
            error!(tag = %self.tag, "pipeline bind outside of a pass");
            return;
        };
        if !pass_state.bind_pipeline(pipeline) {
            return;
        }

        unsafe {
            self.context.device().cmd_bind_pipeline(
                self.vk_command_buffer,
                pipeline.bind_point,
                pipeline.vk_pipeline,
            );
        }

        self.record_pipeline_usage(pipeline.vk_pipeline);
        for module in &pipeline.shader_modules {
            self.record_shader_usage(*module);
        }
    }

    pub fn cmd_bind_vertex_buffer(&mut self, binding: BoundBuffer) {
        let Some(pass_state) = self.pass_state.as_mut() else {
            error!(tag = %self.tag, "vertex buffer bind outside of a pass");
            return;
        };
        if !pass_state.bind_vertex_buffer(binding) {
            return;
        }

        unsafe {
            self.context.device().cmd_bind_vertex_buffers(
                self.vk_command_buffer,
                0,
                &[binding.instance.vk_buffer],
                &[binding.byte_offset],
            );
        }
        self.record_buffer_usage(binding.instance.vk_buffer);
    }

    pub fn cmd_bind_index_buffer(&mut self, binding: BoundBuffer, index_type: IndexType) {
        let Some(pass_state) = self.pass_state.as_mut() else {
            error!(tag = %self.tag, "index buffer bind outside of a pass");
            return;
        };
        if !pass_state.bind_index_buffer(binding) {
            return;
        }

        let vk_index_type = match index_type {
            IndexType::Uint16 => vk::IndexType::UINT16,
            IndexType::Uint32 => vk::IndexType::UINT32,
        };
        unsafe {
            self.context.device().cmd_bind_index_buffer(
                self.vk_command_buffer,
                binding.instance.vk_buffer,
                binding.byte_offset,
                vk_index_type,
            );
        }
        self.record_buffer_usage(binding.instance.vk_buffer);
    }

    pub fn cmd_draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        unsafe {
            self.context.device().cmd_draw_indexed(
                self.vk_command_buffer,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            );
        }
    }

    pub fn cmd_draw_indexed_indirect(
        &mut self,
        vk_buffer: vk::Buffer,
        byte_offset: u64,
        draw_count: u32,
        stride: u32,
    ) {
        unsafe {
            self.context.device().cmd_draw_indexed_indirect(
                self.vk_command_buffer,
                vk_buffer,
                byte_offset,
                draw_count,
                stride,
            );
        }
        self.record_buffer_usage(vk_buffer);
    }

    #[allow(clippy::too_many_arguments)]
    pub fn cmd_draw_indexed_indirect_count(
        &mut self,
        commands_buffer: vk::Buffer,
        commands_byte_offset: u64,
        count_buffer: vk::Buffer,
        count_byte_offset: u64,
        max_draw_count: u32,
        stride: u32,
    ) {
        unsafe {
            self.context.device().cmd_draw_indexed_indirect_count(
                self.vk_command_buffer,
                commands_buffer,
                commands_byte_offset,
                count_buffer,
                count_byte_offset,
                max_draw_count,
                stride,
            );
        }
        self.record_buffer_usage(commands_buffer);
        self.record_buffer_usage(count_buffer);
    }

    pub fn cmd_dispatch(&mut self, group_count_x: u32, group_count_y: u32, group_count_z: u32) {
        unsafe {
            self.context.device().cmd_dispatch(
                self.vk_command_buffer,
                group_count_x,
                group_count_y,
                group_count_z,
            );
        }
    }

    /// Binds descriptor sets and records every resource bound within them,
    /// tying those resources' lifetimes to this command buffer.
    pub fn cmd_bind_descriptor_sets(
        &mut self,
        pipeline: &Pipeline,
        first_set: u32,
        sets: &[DescriptorSet],
        dynamic_offsets: &[u32],
    ) {
        let vk_sets: Vec<vk::DescriptorSet> = sets.iter().map(|set| set.vk_set).collect();
        unsafe {
            self.context.device().cmd_bind_descriptor_sets(
                self.vk_command_buffer,
                pipeline.bind_point,
                pipeline.vk_layout,
                first_set,
                &vk_sets,
                dynamic_offsets,
            );
        }

        for set in sets {
            self.record_descriptor_set_usage(set.vk_set);

            for binding in set.bindings.buffers.values() {
                self.record_buffer_usage(binding.instance.vk_buffer);
            }
            for binding in set.bindings.image_views.values() {
                self.record_image_usage(binding.instance.vk_image);
                if let Some(view) = binding.instance.views.get(binding.view_index as usize) {
                    self.record_image_view_usage(view.vk_image_view);
                }
            }
            for array in set.bindings.image_view_samplers.values() {
                for binding in array.values() {
                    self.record_image_usage(binding.instance.vk_image);
                    if let Some(view) = binding.instance.views.get(binding.view_index as usize) {
                        self.record_image_view_usage(view.vk_image_view);
                    }
                    self.record_sampler_usage(binding.sampler);
                }
            }
        }
    }

    //
    // Named descriptor bindings (resolved via the bound pipeline)
    //

    pub fn bind_buffer(&mut self, bind_point: &str, binding: BoundBuffer) {
        let vk_buffer = binding.instance.vk_buffer;
        if let Some(pass_state) = self.pass_state.as_mut() {
            pass_state.bind_buffer(bind_point, binding);
        }
        self.record_buffer_usage(vk_buffer);
    }

    pub fn bind_image_view(&mut self, bind_point: &str, binding: BoundImageView) {
        let vk_image = binding.instance.vk_image;
        let vk_view = binding
            .instance
            .views
            .get(binding.view_index as usize)
            .map(|view| view.vk_image_view);
        if let Some(pass_state) = self.pass_state.as_mut() {
            pass_state.bind_image_view(bind_point, binding);
        }
        self.record_image_usage(vk_image);
        if let Some(view) = vk_view {
            self.record_image_view_usage(view);
        }
    }

    pub fn bind_image_view_sampler(
        &mut self,
        bind_point: &str,
        array_index: u32,
        binding: BoundImageViewSampler,
    ) {
        let vk_image = binding.instance.vk_image;
        let vk_view = binding
            .instance
            .views
            .get(binding.view_index as usize)
            .map(|view| view.vk_image_view);
        let vk_sampler = binding.sampler;
        if let Some(pass_state) = self.pass_state.as_mut() {
            pass_state.bind_image_view_sampler(bind_point, array_index, binding);
        }
        self.record_image_usage(vk_image);
        if let Some(view) = vk_view {
            self.record_image_view_usage(view);
        }
        self.record_sampler_usage(vk_sampler);
    }

    //
    // Debug sections
    //

    pub fn cmd_push_debug_section(&self, name: &str) {
        let Some(debug_utils) = &self.context.debug_utils else {
            return;
        };
        let Ok(label_name) = std::ffi::CString::new(name) else {
            return;
        };
        let label = vk::DebugUtilsLabelEXT::default().label_name(&label_name);
        unsafe {
            debug_utils.cmd_begin_debug_utils_label(self.vk_command_buffer, &label);
        }
    }

    pub fn cmd_pop_debug_section(&self) {
        let Some(debug_utils) = &self.context.debug_utils else {
            return;
        };
        unsafe {
            debug_utils.cmd_end_debug_utils_label(self.vk_command_buffer);
        }
    }

    //
    // Usage tracking
    //

    pub(crate) fn record_image_usage(&mut self, vk_image: vk::Image) {
        if self.used_images.insert(vk_image) {
            self.usages.images.increment_gpu_usage(&vk_image);
        }
    }

    pub(crate) fn record_image_view_usage(&mut self, vk_image_view: vk::ImageView) {
        if self.used_image_views.insert(vk_image_view) {
            self.usages.image_views.increment_gpu_usage(&vk_image_view);
        }
    }

    pub(crate) fn record_buffer_usage(&mut self, vk_buffer: vk::Buffer) {
        if self.used_buffers.insert(vk_buffer) {
            self.usages.buffers.increment_gpu_usage(&vk_buffer);
        }
    }

    fn record_pipeline_usage(&mut self, vk_pipeline: vk::Pipeline) {
        if self.used_pipelines.insert(vk_pipeline) {
            self.usages.pipelines.increment_gpu_usage(&vk_pipeline);
        }
    }

    fn record_shader_usage(&mut self, module: vk::ShaderModule) {
        if self.used_shaders.insert(module) {
            self.usages.shaders.increment_gpu_usage(&module);
        }
    }

    fn record_descriptor_set_usage(&mut self, vk_set: vk::DescriptorSet) {
        if self.used_descriptor_sets.insert(vk_set) {
            self.usages.descriptor_sets.increment_gpu_usage(&vk_set);
        }
    }

    fn record_sampler_usage(&mut self, vk_sampler: vk::Sampler) {
        if self.used_samplers.insert(vk_sampler) {
            self.usages.samplers.increment_gpu_usage(&vk_sampler);
        }
    }

    /// Releases every usage this command buffer recorded. Called once when
    /// its work is confirmed finished.
    pub fn release_tracked_resources(&mut self) {
        for vk_image in self.used_images.drain() {
            self.usages.images.decrement_gpu_usage(&vk_image);
        }
        for vk_view in self.used_image_views.drain() {
            self.usages.image_views.decrement_gpu_usage(&vk_view);
        }
        for vk_buffer in self.used_buffers.drain() {
            self.usages.buffers.decrement_gpu_usage(&vk_buffer);
        }
        for vk_pipeline in self.used_pipelines.drain() {
            self.usages.pipelines.decrement_gpu_usage(&vk_pipeline);
        }
        for module in self.used_shaders.drain() {
            self.usages.shaders.decrement_gpu_usage(&module);
        }
        for vk_set in self.used_descriptor_sets.drain() {
            self.usages.descriptor_sets.decrement_gpu_usage(&vk_set);
        }
        for vk_sampler in self.used_samplers.drain() {
            self.usages.samplers.decrement_gpu_usage(&vk_sampler);
        }
        for secondary_id in self.secondary_command_buffers.drain() {
            self.usages.command_buffers.decrement_gpu_usage(&secondary_id);
        }
    }
}
