//! Per-pass bind state tracking.
//!
//! Lives only while a render or compute pass is open. Tracks the bound
//! pipeline, vertex/index buffers, and the bindings recorded for each of the
//! four descriptor set slots, along with a per-slot dirty flag. Binding into
//! set N dirties sets N..=3, since descriptor sets must be rebound
//! contiguously from the lowest changed index.

use ash::vk;
use hashbrown::HashMap;

use crate::buffers::BufferInstance;
use crate::images::ImageInstance;
use crate::pipelines::Pipeline;

/// A buffer resolved and bound for descriptor or vertex/index use.
#[derive(Clone, Copy, Debug)]
pub struct BoundBuffer {
    pub instance: BufferInstance,
    pub descriptor_type: vk::DescriptorType,
    pub shader_writeable: bool,
    pub byte_offset: u64,
    pub byte_size: u64,
    pub dynamic_byte_offset: Option<u32>,
}

/// An image view bound as a storage image.
#[derive(Clone, Debug)]
pub struct BoundImageView {
    pub instance: ImageInstance,
    pub view_index: u32,
    pub shader_writeable: bool,
}

/// An image view plus sampler bound as a combined image sampler.
#[derive(Clone, Debug)]
pub struct BoundImageViewSampler {
    pub instance: ImageInstance,
    pub view_index: u32,
    pub sampler: vk::Sampler,
}

/// Everything bound into one descriptor set slot, keyed by binding index.
/// Combined image samplers additionally key by array index.
#[derive(Clone, Debug, Default)]
pub struct SetBindings {
    pub buffers: HashMap<u32, BoundBuffer>,
    pub image_views: HashMap<u32, BoundImageView>,
    pub image_view_samplers: HashMap<u32, HashMap<u32, BoundImageViewSampler>>,
}

impl SetBindings {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
            && self.image_views.is_empty()
            && self.image_view_samplers.is_empty()
    }
}

/// An attachment the open render pass is writing to, kept so the pass end can
/// barrier it back to its default usage mode.
#[derive(Clone, Debug)]
pub struct PassAttachment {
    pub is_depth: bool,
    pub image: ImageInstance,
    pub subresource_range: vk::ImageSubresourceRange,
}

#[derive(Clone, Default)]
pub struct PassState {
    pub color_attachments: Vec<PassAttachment>,
    pub depth_attachment: Option<PassAttachment>,

    pub bound_pipeline: Option<Pipeline>,
    pub bound_vertex_buffer: Option<BoundBuffer>,
    pub bound_index_buffer: Option<BoundBuffer>,

    pub sets_needing_refresh: [bool; 4],
    pub set_bindings: [SetBindings; 4],
}

impl PassState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            sets_needing_refresh: [true; 4],
            ..Self::default()
        }
    }

    /// Records the pipeline. Returns false when it is already bound. A new
    /// pipeline invalidates all sets and clears vertex/index bindings, since
    /// its layouts and bind points may differ.
    pub fn bind_pipeline(&mut self, pipeline: &Pipeline) -> bool {
        if let Some(bound) = &self.bound_pipeline {
            if bound.vk_pipeline == pipeline.vk_pipeline {
                return false;
            }
        }

        self.bound_pipeline = Some(pipeline.clone());
        self.invalidate_set(0);
        self.set_bindings = Default::default();
        self.bound_vertex_buffer = None;
        self.bound_index_buffer = None;
        true
    }

    /// Records the vertex buffer. Returns false when it is already bound.
    pub fn bind_vertex_buffer(&mut self, binding: BoundBuffer) -> bool {
        if let Some(bound) = &self.bound_vertex_buffer {
            if same_buffer_binding(bound, &binding) {
                return false;
            }
        }
        self.bound_vertex_buffer = Some(binding);
        true
    }

    /// Records the index buffer. Returns false when it is already bound.
    pub fn bind_index_buffer(&mut self, binding: BoundBuffer) -> bool {
        if let Some(bound) = &self.bound_index_buffer {
            if same_buffer_binding(bound, &binding) {
                return false;
            }
        }
        self.bound_index_buffer = Some(binding);
        true
    }

    /// Records a buffer for the named bind point. No-op when the pipeline has
    /// no such bind point or the identical binding is already recorded.
    pub fn bind_buffer(&mut self, bind_point: &str, binding: BoundBuffer) {
        let Some((set, details)) = self.resolve_bind_point(bind_point) else {
            return;
        };
        let slot = &mut self.set_bindings[set as usize];
        if let Some(existing) = slot.buffers.get(&details) {
            if same_buffer_binding(existing, &binding) {
                return;
            }
        }
        slot.buffers.insert(details, binding);
        self.invalidate_set(set);
    }

    /// Records a storage image view for the named bind point.
    pub fn bind_image_view(&mut self, bind_point: &str, binding: BoundImageView) {
        let Some((set, details)) = self.resolve_bind_point(bind_point) else {
            return;
        };
        let slot = &mut self.set_bindings[set as usize];
        if let Some(existing) = slot.image_views.get(&details) {
            if existing.instance.vk_image == binding.instance.vk_image
                && existing.view_index == binding.view_index
            {
                return;
            }
        }
        slot.image_views.insert(details, binding);
        self.invalidate_set(set);
    }

    /// Records a combined image sampler for the named bind point at the given
    /// array index.
    pub fn bind_image_view_sampler(
        &mut self,
        bind_point: &str,
        array_index: u32,
        binding: BoundImageViewSampler,
    ) {
        let Some((set, details)) = self.resolve_bind_point(bind_point) else {
            return;
        };
        let slot = &mut self.set_bindings[set as usize];
        if let Some(existing) = slot
            .image_view_samplers
            .get(&details)
            .and_then(|array| array.get(&array_index))
        {
            if existing.instance.vk_image == binding.instance.vk_image
                && existing.view_index == binding.view_index
                && existing.sampler == binding.sampler
            {
                return;
            }
        }
        slot.image_view_samplers
            .entry(details)
            .or_default()
            .insert(array_index, binding);
        self.invalidate_set(set);
    }

    fn resolve_bind_point(&self, bind_point: &str) -> Option<(u32, u32)> {
        let pipeline = self.bound_pipeline.as_ref()?;
        let (set, binding) = pipeline.binding_details(bind_point)?;
        Some((set, binding.binding))
    }

    fn invalidate_set(&mut self, set: u32) {
        for slot in set as usize..4 {
            self.sets_needing_refresh[slot] = true;
        }
    }
}

fn same_buffer_binding(a: &BoundBuffer, b: &BoundBuffer) -> bool {
    a.instance.vk_buffer == b.instance.vk_buffer
        && a.descriptor_type == b.descriptor_type
        && a.shader_writeable == b.shader_writeable
        && a.byte_offset == b.byte_offset
        && a.byte_size == b.byte_size
        && a.dynamic_byte_offset == b.dynamic_byte_offset
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::barriers::BufferUsageMode;
    use crate::buffers::BufferDef;
    use crate::layouts::{DescriptorSetLayout, LayoutBinding};
    use ash::vk::Handle;
    use gpu_allocator::MemoryLocation;

    fn test_pipeline(vk_pipeline: vk::Pipeline) -> Pipeline {
        let bindings = vec![LayoutBinding {
            bind_point: "u_data".into(),
            set: 1,
            binding: 0,
            descriptor_type: vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
            descriptor_count: 1,
            stage_flags: vk::ShaderStageFlags::VERTEX,
        }];
        let stub = DescriptorSetLayout::new(vk::DescriptorSetLayout::null(), Vec::new());
        Pipeline {
            vk_pipeline,
            vk_layout: vk::PipelineLayout::null(),
            bind_point: vk::PipelineBindPoint::GRAPHICS,
            set_layouts: [
                stub.clone(),
                DescriptorSetLayout::new(vk::DescriptorSetLayout::null(), bindings),
                stub.clone(),
                stub,
            ],
            shader_modules: Vec::new(),
        }
    }

    fn test_buffer_binding(offset: u64) -> BoundBuffer {
        BoundBuffer {
            instance: BufferInstance {
                vk_buffer: vk::Buffer::null(),
                def: BufferDef {
                    is_transfer_buffer: false,
                    default_usage_mode: BufferUsageMode::GraphicsUniformRead,
                    byte_size: 256,
                    vk_usage_flags: vk::BufferUsageFlags::UNIFORM_BUFFER,
                    location: MemoryLocation::CpuToGpu,
                    host_visible: true,
                    dedicated: false,
                },
            },
            descriptor_type: vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
            shader_writeable: false,
            byte_offset: offset,
            byte_size: 256,
            dynamic_byte_offset: None,
        }
    }

    #[test]
    fn fresh_pass_needs_all_sets_refreshed() {
        let state = PassState::new();
        assert_eq!(state.sets_needing_refresh, [true; 4]);
    }

    #[test]
    fn rebinding_same_pipeline_is_a_noop() {
        let mut state = PassState::new();
        let pipeline = test_pipeline(vk::Pipeline::null());
        assert!(state.bind_pipeline(&pipeline));
        assert!(!state.bind_pipeline(&pipeline));
    }

    #[test]
    fn binding_a_pipeline_clears_vertex_and_index_buffers() {
        let mut state = PassState::new();
        let pipeline = test_pipeline(vk::Pipeline::null());
        assert!(state.bind_pipeline(&pipeline));
        assert!(state.bind_vertex_buffer(test_buffer_binding(0)));
        assert!(state.bind_index_buffer(test_buffer_binding(64)));

        let other = test_pipeline(vk::Pipeline::from_raw(1));
        assert!(state.bind_pipeline(&other));
        assert!(state.bound_vertex_buffer.is_none());
        assert!(state.bound_index_buffer.is_none());
    }

    #[test]
    fn identical_buffer_binding_does_not_dirty_the_set() {
        let mut state = PassState::new();
        state.bind_pipeline(&test_pipeline(vk::Pipeline::null()));
        state.bind_buffer("u_data", test_buffer_binding(0));

        state.sets_needing_refresh = [false; 4];
        state.bind_buffer("u_data", test_buffer_binding(0));
        assert_eq!(state.sets_needing_refresh, [false; 4]);

        state.bind_buffer("u_data", test_buffer_binding(512));
        assert_eq!(state.sets_needing_refresh, [false, true, true, true]);
    }

    #[test]
    fn unknown_bind_point_is_ignored() {
        let mut state = PassState::new();
        state.bind_pipeline(&test_pipeline(vk::Pipeline::null()));
        state.sets_needing_refresh = [false; 4];
        state.bind_buffer("u_missing", test_buffer_binding(0));
        assert_eq!(state.sets_needing_refresh, [false; 4]);
        assert!(state.set_bindings.iter().all(SetBindings::is_empty));
    }

    #[test]
    fn invalidation_propagates_to_later_sets_only() {
        let mut state = PassState::new();
        state.sets_needing_refresh = [false; 4];
        state.invalidate_set(2);
        assert_eq!(state.sets_needing_refresh, [false, false, true, true]);
    }
}
