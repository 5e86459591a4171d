//! Graphics and compute pipeline pool.
//!
//! Pipelines are created against shaders already registered in the shader
//! pool. Descriptor set layouts are derived from shader reflection: every
//! pipeline gets exactly four set layouts, with empty stub layouts for set
//! indices none of its shaders use, so descriptor sets can always be bound at
//! fixed slots 0..4.

use std::sync::Arc;

use ash::vk;
use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::context::DeviceContext;
use crate::error::{GpuError, Result};
use crate::ids::{Ids, PipelineId};
use crate::images::Images;
use crate::layouts::{DescriptorSetLayout, LayoutBinding, Layouts};
use crate::shaders::{Shader, Shaders};
use crate::types::{ComputePipelineParams, CullFace, GraphicsPipelineParams};
use crate::usage::Usages;

/// A created pipeline and everything command recording needs from it.
#[derive(Clone)]
pub struct Pipeline {
    pub vk_pipeline: vk::Pipeline,
    pub vk_layout: vk::PipelineLayout,
    pub bind_point: vk::PipelineBindPoint,
    pub set_layouts: [DescriptorSetLayout; 4],
    pub shader_modules: Vec<vk::ShaderModule>,
}

impl Pipeline {
    /// Resolves a shader bind point name to its (set index, binding) pair.
    #[must_use]
    pub fn binding_details(&self, bind_point: &str) -> Option<(u32, &LayoutBinding)> {
        self.set_layouts.iter().enumerate().find_map(|(set, layout)| {
            layout
                .binding_details(bind_point)
                .map(|binding| (set as u32, binding))
        })
    }
}

#[derive(Default)]
struct PipelinesState {
    pipelines: HashMap<PipelineId, Pipeline>,
    marked_for_deletion: HashSet<PipelineId>,
}

pub struct Pipelines {
    context: Arc<DeviceContext>,
    usages: Arc<Usages>,
    ids: Arc<Ids>,
    layouts: Arc<Layouts>,
    state: Mutex<PipelinesState>,
}

impl Pipelines {
    pub fn new(
        context: Arc<DeviceContext>,
        usages: Arc<Usages>,
        ids: Arc<Ids>,
        layouts: Arc<Layouts>,
    ) -> Self {
        Self {
            context,
            usages,
            ids,
            layouts,
            state: Mutex::new(PipelinesState::default()),
        }
    }

    pub fn create_graphics_pipeline(
        &self,
        shaders: &Shaders,
        images: &Images,
        params: &GraphicsPipelineParams,
    ) -> Result<PipelineId> {
        let mut pipeline_shaders: Vec<Shader> = Vec::new();
        for name in [&params.vertex_shader_name, &params.fragment_shader_name]
            .into_iter()
            .flatten()
        {
            let shader = shaders.get_shader(name).ok_or_else(|| {
                GpuError::ResourceNotFound(format!("pipeline shader not registered: {name}"))
            })?;
            pipeline_shaders.push(shader);
        }
        if pipeline_shaders.is_empty() {
            return Err(GpuError::InvalidParameters(
                "graphics pipeline requires at least one shader".into(),
            ));
        }

        // Resolve attachment formats from the images the pipeline will render to
        let mut color_formats: Vec<vk::Format> = Vec::new();
        for image_id in &params.color_attachment_image_ids {
            let image = images.get_image(*image_id, false, None).ok_or_else(|| {
                GpuError::ResourceNotFound(format!(
                    "color attachment image does not exist: {}",
                    image_id.0
                ))
            })?;
            color_formats.push(image.def.vk_format);
        }
        let depth_format = match params.depth_attachment_image_id {
            Some(image_id) => Some(
                images
                    .get_image(image_id, false, None)
                    .ok_or_else(|| {
                        GpuError::ResourceNotFound(format!(
                            "depth attachment image does not exist: {}",
                            image_id.0
                        ))
                    })?
                    .def
                    .vk_format,
            ),
            None => None,
        };

        let id = PipelineId(self.ids.pipeline_ids.acquire());
        let tag = format!("{}", id.0);

        let set_layouts = self.build_set_layouts(&pipeline_shaders, &tag)?;
        let vk_layout = self.build_pipeline_layout(&pipeline_shaders, &set_layouts, &tag)?;

        let vk_pipeline = match self.build_graphics_pipeline(
            &pipeline_shaders,
            params,
            &color_formats,
            depth_format,
            vk_layout,
            &tag,
        ) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                self.ids.pipeline_ids.release(id.0);
                return Err(e);
            }
        };

        debug!(id = id.0, "created graphics pipeline");

        self.state.lock().pipelines.insert(
            id,
            Pipeline {
                vk_pipeline,
                vk_layout,
                bind_point: vk::PipelineBindPoint::GRAPHICS,
                set_layouts,
                shader_modules: pipeline_shaders.iter().map(|s| s.module).collect(),
            },
        );
        Ok(id)
    }

    pub fn create_compute_pipeline(
        &self,
        shaders: &Shaders,
        params: &ComputePipelineParams,
    ) -> Result<PipelineId> {
        if params.shader_name.is_empty() {
            return Err(GpuError::InvalidParameters(
                "compute shader name is empty".into(),
            ));
        }
        let shader = shaders.get_shader(&params.shader_name).ok_or_else(|| {
            GpuError::ResourceNotFound(format!(
                "compute shader not registered: {}",
                params.shader_name
            ))
        })?;
        let pipeline_shaders = vec![shader];

        let id = PipelineId(self.ids.pipeline_ids.acquire());
        let tag = format!("{}", id.0);

        let set_layouts = self.build_set_layouts(&pipeline_shaders, &tag)?;
        let vk_layout = self.build_pipeline_layout(&pipeline_shaders, &set_layouts, &tag)?;

        let shader = &pipeline_shaders[0];
        let entry_point = match std::ffi::CString::new(shader.reflection.entry_point.clone()) {
            Ok(name) => name,
            Err(_) => {
                self.ids.pipeline_ids.release(id.0);
                return Err(GpuError::PipelineCreation(
                    "shader entry point name contains a nul byte".into(),
                ));
            }
        };
        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(shader.module)
            .name(&entry_point);

        let create_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage)
            .layout(vk_layout);

        let vk_pipeline = unsafe {
            self.context
                .device()
                .create_compute_pipelines(vk::PipelineCache::null(), &[create_info], None)
                .map_err(|(_, e)| {
                    self.ids.pipeline_ids.release(id.0);
                    GpuError::from(e)
                })?[0]
        };
        self.context
            .set_object_name(vk_pipeline, &format!("Pipeline-{tag}"));

        debug!(id = id.0, "created compute pipeline");

        self.state.lock().pipelines.insert(
            id,
            Pipeline {
                vk_pipeline,
                vk_layout,
                bind_point: vk::PipelineBindPoint::COMPUTE,
                set_layouts,
                shader_modules: pipeline_shaders.iter().map(|s| s.module).collect(),
            },
        );
        Ok(id)
    }

    #[must_use]
    pub fn get_pipeline(&self, id: PipelineId) -> Option<Pipeline> {
        let state = self.state.lock();
        if state.marked_for_deletion.contains(&id) {
            warn!(id = id.0, "lookup of pipeline marked for deletion");
            return None;
        }
        state.pipelines.get(&id).cloned()
    }

    pub fn destroy_pipeline(&self, id: PipelineId, immediately: bool) {
        let mut state = self.state.lock();
        if !state.pipelines.contains_key(&id) {
            warn!(id = id.0, "destroy requested for unknown pipeline");
            return;
        }
        if immediately {
            self.destroy_pipeline_locked(&mut state, id);
        } else {
            state.marked_for_deletion.insert(id);
        }
    }

    pub fn run_cleanup(&self) {
        let mut state = self.state.lock();
        let ready: Vec<PipelineId> = state
            .marked_for_deletion
            .iter()
            .filter(|id| {
                state.pipelines.get(*id).is_none_or(|pipeline| {
                    self.usages.pipelines.gpu_usage_count(&pipeline.vk_pipeline) == 0
                        && self.usages.pipelines.lock_count(&pipeline.vk_pipeline) == 0
                })
            })
            .copied()
            .collect();
        for id in ready {
            self.destroy_pipeline_locked(&mut state, id);
        }
    }

    /// Frees every pipeline unconditionally. Only valid after device idle.
    /// Layout objects are interned and owned by [`Layouts`], not freed here.
    pub fn destroy_all(&self) {
        let mut state = self.state.lock();
        let ids: Vec<PipelineId> = state.pipelines.keys().copied().collect();
        for id in ids {
            self.destroy_pipeline_locked(&mut state, id);
        }
    }

    fn destroy_pipeline_locked(&self, state: &mut PipelinesState, id: PipelineId) {
        if let Some(pipeline) = state.pipelines.remove(&id) {
            unsafe {
                self.context
                    .device()
                    .destroy_pipeline(pipeline.vk_pipeline, None);
            }
            self.ids.pipeline_ids.release(id.0);
        }
        state.marked_for_deletion.remove(&id);
    }

    /// Builds the pipeline's four descriptor set layouts from shader
    /// reflection. Stage flags for a set are the union of the stages of every
    /// shader that declares the set. Shaders sharing a set are assumed to
    /// agree on its bindings; the first declaration of a binding index wins.
    fn build_set_layouts(
        &self,
        pipeline_shaders: &[Shader],
        tag: &str,
    ) -> Result<[DescriptorSetLayout; 4]> {
        let mut layouts: Vec<DescriptorSetLayout> = Vec::with_capacity(4);

        for set in 0..4u32 {
            let mut stage_flags = vk::ShaderStageFlags::empty();
            for shader in pipeline_shaders {
                if shader.reflection.bindings.iter().any(|b| b.set == set) {
                    stage_flags |= shader.stage_flags();
                }
            }

            let mut bindings: Vec<LayoutBinding> = Vec::new();
            for shader in pipeline_shaders {
                for info in shader.reflection.bindings.iter().filter(|b| b.set == set) {
                    if bindings.iter().any(|b| b.binding == info.binding) {
                        continue;
                    }
                    bindings.push(LayoutBinding {
                        bind_point: info.name.clone(),
                        set,
                        binding: info.binding,
                        descriptor_type: info.descriptor_type,
                        descriptor_count: info.count,
                        stage_flags,
                    });
                }
            }

            let layout_tag = if bindings.is_empty() {
                format!("{tag}-stub")
            } else {
                format!("{tag}-{set}")
            };
            layouts.push(
                self.layouts
                    .get_or_create_descriptor_set_layout(&bindings, &layout_tag)?,
            );
        }

        layouts
            .try_into()
            .map_err(|_| GpuError::Other("descriptor set layout count mismatch".into()))
    }

    fn build_pipeline_layout(
        &self,
        pipeline_shaders: &[Shader],
        set_layouts: &[DescriptorSetLayout; 4],
        tag: &str,
    ) -> Result<vk::PipelineLayout> {
        let vk_set_layouts = [
            set_layouts[0].layout,
            set_layouts[1].layout,
            set_layouts[2].layout,
            set_layouts[3].layout,
        ];

        let mut push_constant_size = 0u32;
        let mut push_constant_stages = vk::ShaderStageFlags::empty();
        for shader in pipeline_shaders {
            if shader.reflection.push_constant_size > 0 {
                push_constant_size = push_constant_size.max(shader.reflection.push_constant_size);
                push_constant_stages |= shader.stage_flags();
            }
        }
        let mut push_constant_ranges: Vec<vk::PushConstantRange> = Vec::new();
        if push_constant_size > 0 {
            push_constant_ranges.push(
                vk::PushConstantRange::default()
                    .stage_flags(push_constant_stages)
                    .offset(0)
                    .size((push_constant_size + 3) & !3),
            );
        }

        self.layouts
            .get_or_create_pipeline_layout(&vk_set_layouts, &push_constant_ranges, tag)
    }

    #[allow(clippy::too_many_lines)]
    fn build_graphics_pipeline(
        &self,
        pipeline_shaders: &[Shader],
        params: &GraphicsPipelineParams,
        color_formats: &[vk::Format],
        depth_format: Option<vk::Format>,
        vk_layout: vk::PipelineLayout,
        tag: &str,
    ) -> Result<vk::Pipeline> {
        let entry_points: Vec<std::ffi::CString> = pipeline_shaders
            .iter()
            .map(|shader| std::ffi::CString::new(shader.reflection.entry_point.clone()))
            .collect::<std::result::Result<_, _>>()
            .map_err(|_| {
                GpuError::PipelineCreation("shader entry point name contains a nul byte".into())
            })?;

        let stages: Vec<vk::PipelineShaderStageCreateInfo> = pipeline_shaders
            .iter()
            .zip(&entry_points)
            .map(|(shader, entry_point)| {
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(shader.stage_flags())
                    .module(shader.module)
                    .name(entry_point)
            })
            .collect();

        // Vertex input layout comes from the vertex shader's reflection
        let mut attribute_descriptions: Vec<vk::VertexInputAttributeDescription> = Vec::new();
        let mut binding_descriptions: Vec<vk::VertexInputBindingDescription> = Vec::new();
        for shader in pipeline_shaders {
            if shader.reflection.vertex_inputs.is_empty() {
                continue;
            }
            for input in &shader.reflection.vertex_inputs {
                attribute_descriptions.push(
                    vk::VertexInputAttributeDescription::default()
                        .location(input.location)
                        .binding(0)
                        .format(input.format)
                        .offset(input.byte_offset),
                );
            }
            binding_descriptions.push(
                vk::VertexInputBindingDescription::default()
                    .binding(0)
                    .stride(shader.reflection.vertex_stride)
                    .input_rate(vk::VertexInputRate::VERTEX),
            );
            break;
        }
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_attribute_descriptions(&attribute_descriptions)
            .vertex_binding_descriptions(&binding_descriptions);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .primitive_restart_enable(false);

        // Flipped y-axis viewport, front faces stay counter-clockwise
        let viewport = vk::Viewport {
            x: params.viewport.x as f32,
            y: (params.viewport.h - params.viewport.y) as f32,
            width: params.viewport.w as f32,
            height: -(params.viewport.h as f32),
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D {
                x: params.viewport.x as i32,
                y: params.viewport.y as i32,
            },
            extent: vk::Extent2D {
                width: params.viewport.w,
                height: params.viewport.h,
            },
        };
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewports(std::slice::from_ref(&viewport))
            .scissors(std::slice::from_ref(&scissor));

        let cull_mode = match params.cull_face {
            CullFace::None => vk::CullModeFlags::NONE,
            CullFace::Front => vk::CullModeFlags::FRONT,
            CullFace::Back => vk::CullModeFlags::BACK,
        };
        let mut polygon_mode = if params.wireframe_fill_mode {
            vk::PolygonMode::LINE
        } else {
            vk::PolygonMode::FILL
        };
        if polygon_mode != vk::PolygonMode::FILL && !self.context.capabilities().supports_wireframe
        {
            error!("wireframe fill mode requested but unsupported, using fill");
            polygon_mode = vk::PolygonMode::FILL;
        }

        let mut rasterizer = vk::PipelineRasterizationStateCreateInfo::default()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .line_width(1.0)
            .cull_mode(cull_mode)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .polygon_mode(polygon_mode);
        if params.depth_bias_enabled {
            // Bias constants negated for the reversed depth axis
            rasterizer = rasterizer
                .depth_bias_enable(true)
                .depth_bias_constant_factor(-2.0)
                .depth_bias_slope_factor(-1.1)
                .depth_bias_clamp(0.0);
        }

        let multisampling = vk::PipelineMultisampleStateCreateInfo::default()
            .sample_shading_enable(false)
            .rasterization_samples(vk::SampleCountFlags::TYPE_1)
            .min_sample_shading(1.0);

        let blend_attachments: Vec<vk::PipelineColorBlendAttachmentState> = color_formats
            .iter()
            .map(|_| {
                vk::PipelineColorBlendAttachmentState::default()
                    .color_write_mask(vk::ColorComponentFlags::RGBA)
                    .blend_enable(true)
                    .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
                    .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
                    .color_blend_op(vk::BlendOp::ADD)
                    .src_alpha_blend_factor(vk::BlendFactor::ONE)
                    .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
                    .alpha_blend_op(vk::BlendOp::ADD)
            })
            .collect();
        let color_blending = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(false)
            .logic_op(vk::LogicOp::COPY)
            .attachments(&blend_attachments);

        // Reversed depth axis: far plane clears to 0, nearer fragments win
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(params.depth_test_enabled)
            .depth_write_enable(params.depth_write_enabled)
            .depth_compare_op(vk::CompareOp::GREATER_OR_EQUAL)
            .depth_bounds_test_enable(false)
            .min_depth_bounds(0.0)
            .max_depth_bounds(1.0)
            .stencil_test_enable(false);

        let mut rendering_info = vk::PipelineRenderingCreateInfo::default()
            .color_attachment_formats(color_formats)
            .depth_attachment_format(depth_format.unwrap_or(vk::Format::UNDEFINED))
            .stencil_attachment_format(vk::Format::UNDEFINED);

        let mut create_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterizer)
            .multisample_state(&multisampling)
            .color_blend_state(&color_blending)
            .layout(vk_layout)
            .push_next(&mut rendering_info);
        if depth_format.is_some() {
            create_info = create_info.depth_stencil_state(&depth_stencil);
        }

        let vk_pipeline = unsafe {
            self.context
                .device()
                .create_graphics_pipelines(vk::PipelineCache::null(), &[create_info], None)
                .map_err(|(_, e)| GpuError::from(e))?[0]
        };
        self.context
            .set_object_name(vk_pipeline, &format!("Pipeline-{tag}"));
        Ok(vk_pipeline)
    }
}

impl Drop for Pipelines {
    fn drop(&mut self) {
        self.destroy_all();
    }
}
