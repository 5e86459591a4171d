//! Descriptor set layout and pipeline layout caches.
//!
//! Layouts are interned by content hash and live for the whole device
//! lifetime; pipelines referencing the same binding sets share layout objects.

use std::hash::{Hash, Hasher};
use std::sync::Arc;

use ash::vk;
use ash::vk::Handle;
use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::context::DeviceContext;
use crate::error::{GpuError, Result};

/// One binding within a descriptor set layout, annotated with the shader
/// variable name it was reflected from.
#[derive(Debug, Clone)]
pub struct LayoutBinding {
    pub bind_point: String,
    pub set: u32,
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub descriptor_count: u32,
    pub stage_flags: vk::ShaderStageFlags,
}

/// An interned descriptor set layout plus the bindings it was built from.
#[derive(Debug, Clone)]
pub struct DescriptorSetLayout {
    pub layout: vk::DescriptorSetLayout,
    bindings: Arc<Vec<LayoutBinding>>,
}

impl DescriptorSetLayout {
    pub(crate) fn new(layout: vk::DescriptorSetLayout, bindings: Vec<LayoutBinding>) -> Self {
        Self {
            layout,
            bindings: Arc::new(bindings),
        }
    }

    /// Looks up a binding by shader variable name.
    #[must_use]
    pub fn binding_details(&self, bind_point: &str) -> Option<&LayoutBinding> {
        self.bindings.iter().find(|b| b.bind_point == bind_point)
    }

    #[must_use]
    pub fn bindings(&self) -> &[LayoutBinding] {
        &self.bindings
    }
}

#[derive(Default)]
struct LayoutsState {
    descriptor_set_layouts: HashMap<u64, DescriptorSetLayout>,
    pipeline_layouts: HashMap<u64, vk::PipelineLayout>,
}

pub struct Layouts {
    context: Arc<DeviceContext>,
    state: Mutex<LayoutsState>,
}

impl Layouts {
    pub fn new(context: Arc<DeviceContext>) -> Self {
        Self {
            context,
            state: Mutex::new(LayoutsState::default()),
        }
    }

    /// Returns the interned layout for these bindings, creating it on first
    /// use. An empty binding list yields a valid empty layout, used to stub
    /// out unused set indices.
    pub fn get_or_create_descriptor_set_layout(
        &self,
        bindings: &[LayoutBinding],
        tag: &str,
    ) -> Result<DescriptorSetLayout> {
        let hash = descriptor_set_layout_hash(bindings);

        let mut state = self.state.lock();
        if let Some(layout) = state.descriptor_set_layouts.get(&hash) {
            return Ok(layout.clone());
        }

        let vk_bindings: Vec<vk::DescriptorSetLayoutBinding> = bindings
            .iter()
            .map(|b| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(b.binding)
                    .descriptor_type(b.descriptor_type)
                    .descriptor_count(b.descriptor_count)
                    .stage_flags(b.stage_flags)
            })
            .collect();
        let create_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&vk_bindings);
        let layout = unsafe {
            self.context
                .device()
                .create_descriptor_set_layout(&create_info, None)?
        };
        self.context
            .set_object_name(layout, &format!("DescriptorSetLayout-{tag}"));
        debug!(tag, bindings = bindings.len(), "created descriptor set layout");

        let entry = DescriptorSetLayout {
            layout,
            bindings: Arc::new(bindings.to_vec()),
        };
        state.descriptor_set_layouts.insert(hash, entry.clone());
        Ok(entry)
    }

    /// Returns the interned pipeline layout for these set layouts and push
    /// constant ranges, creating it on first use.
    pub fn get_or_create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout; 4],
        push_constant_ranges: &[vk::PushConstantRange],
        tag: &str,
    ) -> Result<vk::PipelineLayout> {
        for range in push_constant_ranges {
            if range.offset % 4 != 0 {
                return Err(GpuError::InvalidParameters(format!(
                    "push constant offset must be a multiple of 4, got {}",
                    range.offset
                )));
            }
            if range.size % 4 != 0 {
                return Err(GpuError::InvalidParameters(format!(
                    "push constant size must be a multiple of 4, got {}",
                    range.size
                )));
            }
        }

        let hash = pipeline_layout_hash(set_layouts, push_constant_ranges);

        let mut state = self.state.lock();
        if let Some(layout) = state.pipeline_layouts.get(&hash) {
            return Ok(*layout);
        }

        let create_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(set_layouts)
            .push_constant_ranges(push_constant_ranges);
        let layout = unsafe {
            self.context
                .device()
                .create_pipeline_layout(&create_info, None)?
        };
        self.context
            .set_object_name(layout, &format!("PipelineLayout-{tag}"));
        debug!(tag, "created pipeline layout");

        state.pipeline_layouts.insert(hash, layout);
        Ok(layout)
    }

    /// Destroys every cached layout. Only valid after device idle.
    pub fn destroy_all(&self) {
        let mut state = self.state.lock();
        for (_, layout) in state.descriptor_set_layouts.drain() {
            unsafe {
                self.context
                    .device()
                    .destroy_descriptor_set_layout(layout.layout, None);
            }
        }
        for (_, layout) in state.pipeline_layouts.drain() {
            unsafe {
                self.context.device().destroy_pipeline_layout(layout, None);
            }
        }
    }
}

impl Drop for Layouts {
    fn drop(&mut self) {
        self.destroy_all();
    }
}

fn descriptor_set_layout_hash(bindings: &[LayoutBinding]) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    for b in bindings {
        b.bind_point.hash(&mut hasher);
        b.set.hash(&mut hasher);
        b.binding.hash(&mut hasher);
        b.descriptor_type.as_raw().hash(&mut hasher);
        b.descriptor_count.hash(&mut hasher);
        b.stage_flags.as_raw().hash(&mut hasher);
    }
    hasher.finish()
}

fn pipeline_layout_hash(
    set_layouts: &[vk::DescriptorSetLayout; 4],
    push_constant_ranges: &[vk::PushConstantRange],
) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    for layout in set_layouts {
        layout.as_raw().hash(&mut hasher);
    }
    for range in push_constant_ranges {
        range.stage_flags.as_raw().hash(&mut hasher);
        range.offset.hash(&mut hasher);
        range.size.hash(&mut hasher);
    }
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(set: u32, binding: u32, ty: vk::DescriptorType) -> LayoutBinding {
        LayoutBinding {
            bind_point: format!("u_data{binding}"),
            set,
            binding,
            descriptor_type: ty,
            descriptor_count: 1,
            stage_flags: vk::ShaderStageFlags::COMPUTE,
        }
    }

    #[test]
    fn identical_bindings_share_a_hash() {
        let a = [binding(0, 0, vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC)];
        let b = [binding(0, 0, vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC)];
        assert_eq!(descriptor_set_layout_hash(&a), descriptor_set_layout_hash(&b));
    }

    #[test]
    fn descriptor_type_changes_the_hash() {
        let a = [binding(0, 0, vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC)];
        let b = [binding(0, 0, vk::DescriptorType::STORAGE_BUFFER)];
        assert_ne!(descriptor_set_layout_hash(&a), descriptor_set_layout_hash(&b));
    }

    #[test]
    fn empty_layout_hash_is_stable() {
        assert_eq!(descriptor_set_layout_hash(&[]), descriptor_set_layout_hash(&[]));
    }

    #[test]
    fn push_constant_ranges_distinguish_pipeline_layouts() {
        let sets = [vk::DescriptorSetLayout::null(); 4];
        let with_range = [vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::VERTEX)
            .offset(0)
            .size(16)];
        assert_ne!(
            pipeline_layout_hash(&sets, &[]),
            pipeline_layout_hash(&sets, &with_range)
        );
    }
}
