//! Shader module registry.
//!
//! Shaders are registered under user-chosen names and referenced by name from
//! pipeline parameters. Registration reflects the SPIR-V binary once and keeps
//! the derived metadata (descriptor bindings, vertex inputs, push constant
//! size) alongside the module, so pipeline creation never re-parses bytecode.

use std::sync::Arc;

use ash::vk;
use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::context::DeviceContext;
use crate::error::{GpuError, Result};
use crate::types::{ShaderSpec, ShaderType};
use crate::usage::Usages;

/// One descriptor binding a shader declares.
#[derive(Debug, Clone)]
pub struct ShaderBindingInfo {
    pub set: u32,
    pub binding: u32,
    pub name: String,
    pub descriptor_type: vk::DescriptorType,
    pub count: u32,
}

/// One vertex input attribute, with its offset within the packed vertex.
#[derive(Debug, Clone, Copy)]
pub struct VertexInputInfo {
    pub location: u32,
    pub format: vk::Format,
    pub byte_offset: u32,
}

/// Metadata reflected from a SPIR-V binary at registration time.
#[derive(Debug, Clone, Default)]
pub struct ShaderReflection {
    pub entry_point: String,
    pub bindings: Vec<ShaderBindingInfo>,
    pub vertex_inputs: Vec<VertexInputInfo>,
    pub vertex_stride: u32,
    pub push_constant_size: u32,
}

/// A registered shader. Cheap to clone; reflection data is shared.
#[derive(Debug, Clone)]
pub struct Shader {
    pub module: vk::ShaderModule,
    pub shader_type: ShaderType,
    pub reflection: Arc<ShaderReflection>,
}

impl Shader {
    #[must_use]
    pub fn stage_flags(&self) -> vk::ShaderStageFlags {
        match self.shader_type {
            ShaderType::Vertex => vk::ShaderStageFlags::VERTEX,
            ShaderType::Fragment => vk::ShaderStageFlags::FRAGMENT,
            ShaderType::Compute => vk::ShaderStageFlags::COMPUTE,
        }
    }
}

#[derive(Default)]
struct ShadersState {
    shaders: HashMap<String, Shader>,
    marked_for_deletion: HashSet<String>,
}

/// Name-keyed shader pool with deferred destruction.
pub struct Shaders {
    context: Arc<DeviceContext>,
    usages: Arc<Usages>,
    state: Mutex<ShadersState>,
}

impl Shaders {
    pub fn new(context: Arc<DeviceContext>, usages: Arc<Usages>) -> Self {
        Self {
            context,
            usages,
            state: Mutex::new(ShadersState::default()),
        }
    }

    /// Registers a SPIR-V binary under its name.
    ///
    /// Names must be unique across the lifetime of the registry until the
    /// shader is destroyed. Re-registering a marked-for-deletion name is also
    /// rejected until its module has actually been freed.
    pub fn create_shader(&self, spec: &ShaderSpec) -> Result<()> {
        let mut state = self.state.lock();
        if state.shaders.contains_key(&spec.shader_name) {
            return Err(GpuError::InvalidParameters(format!(
                "shader name already registered: {}",
                spec.shader_name
            )));
        }

        let words = spirv_words(&spec.shader_binary)?;
        let reflection = reflect_shader(&words, spec.shader_type)?;

        let module_info = vk::ShaderModuleCreateInfo::default().code(&words);
        let module = unsafe {
            self.context
                .device()
                .create_shader_module(&module_info, None)?
        };
        self.context
            .set_object_name(module, &format!("Shader-{}", spec.shader_name));

        debug!(
            name = %spec.shader_name,
            bindings = reflection.bindings.len(),
            vertex_inputs = reflection.vertex_inputs.len(),
            "registered shader"
        );

        state.shaders.insert(
            spec.shader_name.clone(),
            Shader {
                module,
                shader_type: spec.shader_type,
                reflection: Arc::new(reflection),
            },
        );
        Ok(())
    }

    /// Looks up a shader by name. Marked-for-deletion shaders are not returned.
    #[must_use]
    pub fn get_shader(&self, name: &str) -> Option<Shader> {
        let state = self.state.lock();
        if state.marked_for_deletion.contains(name) {
            warn!(name, "lookup of shader marked for deletion");
            return None;
        }
        state.shaders.get(name).cloned()
    }

    /// Marks a shader for deletion, or destroys it now when `immediately`.
    pub fn destroy_shader(&self, name: &str, immediately: bool) {
        let mut state = self.state.lock();
        if !state.shaders.contains_key(name) {
            warn!(name, "destroy requested for unknown shader");
            return;
        }
        if immediately {
            self.destroy_shader_locked(&mut state, name);
        } else {
            state.marked_for_deletion.insert(name.to_owned());
        }
    }

    /// Frees marked shaders whose modules are no longer referenced.
    pub fn run_cleanup(&self) {
        let mut state = self.state.lock();
        let ready: Vec<String> = state
            .marked_for_deletion
            .iter()
            .filter(|name| {
                state.shaders.get(*name).is_none_or(|shader| {
                    self.usages.shaders.gpu_usage_count(&shader.module) == 0
                        && self.usages.shaders.lock_count(&shader.module) == 0
                })
            })
            .cloned()
            .collect();
        for name in ready {
            self.destroy_shader_locked(&mut state, &name);
        }
    }

    /// Frees every shader unconditionally. Only valid at shutdown, after the
    /// device has gone idle.
    pub fn destroy_all(&self) {
        let mut state = self.state.lock();
        let names: Vec<String> = state.shaders.keys().cloned().collect();
        for name in names {
            self.destroy_shader_locked(&mut state, &name);
        }
    }

    fn destroy_shader_locked(&self, state: &mut ShadersState, name: &str) {
        if let Some(shader) = state.shaders.remove(name) {
            unsafe {
                self.context
                    .device()
                    .destroy_shader_module(shader.module, None);
            }
        }
        state.marked_for_deletion.remove(name);
    }
}

impl Drop for Shaders {
    fn drop(&mut self) {
        self.destroy_all();
    }
}

/// Converts raw bytes to SPIR-V words, validating alignment and magic.
fn spirv_words(bytes: &[u8]) -> Result<Vec<u32>> {
    if bytes.len() < 4 || bytes.len() % 4 != 0 {
        return Err(GpuError::ShaderCreation(format!(
            "SPIR-V binary length must be a non-zero multiple of 4, got {}",
            bytes.len()
        )));
    }
    let words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();
    const SPIRV_MAGIC: u32 = 0x0723_0203;
    if words[0] != SPIRV_MAGIC {
        return Err(GpuError::ShaderCreation(
            "binary is not SPIR-V (bad magic number)".into(),
        ));
    }
    Ok(words)
}

fn reflect_shader(words: &[u32], shader_type: ShaderType) -> Result<ShaderReflection> {
    let module = spirv_reflect::ShaderModule::load_u32_data(words)
        .map_err(|e| GpuError::ShaderCreation(e.to_string()))?;

    let mut reflection = ShaderReflection {
        entry_point: module.get_entry_point_name(),
        ..ShaderReflection::default()
    };

    for set in module
        .enumerate_descriptor_sets(None)
        .map_err(|e| GpuError::ShaderCreation(e.to_string()))?
    {
        for binding in &set.bindings {
            reflection.bindings.push(ShaderBindingInfo {
                set: set.set,
                binding: binding.binding,
                name: binding.name.clone(),
                descriptor_type: map_descriptor_type(binding.descriptor_type)?,
                count: binding.count,
            });
        }
    }

    if shader_type == ShaderType::Vertex {
        let mut inputs: Vec<(u32, vk::Format, u32)> = Vec::new();
        for input in module
            .enumerate_input_variables(None)
            .map_err(|e| GpuError::ShaderCreation(e.to_string()))?
        {
            if input
                .decoration_flags
                .contains(spirv_reflect::types::ReflectDecorationFlags::BUILT_IN)
            {
                continue;
            }
            let (format, size) = map_vertex_format(input.format)?;
            inputs.push((input.location, format, size));
        }
        inputs.sort_by_key(|(location, _, _)| *location);

        let mut offset = 0;
        for (location, format, size) in inputs {
            reflection.vertex_inputs.push(VertexInputInfo {
                location,
                format,
                byte_offset: offset,
            });
            offset += size;
        }
        reflection.vertex_stride = offset;
    }

    for block in module
        .enumerate_push_constant_blocks(None)
        .map_err(|e| GpuError::ShaderCreation(e.to_string()))?
    {
        reflection.push_constant_size = reflection.push_constant_size.max(block.size);
    }

    Ok(reflection)
}

/// Maps reflected descriptor types to the types descriptor sets are allocated
/// with. All uniform buffers become dynamic so a single large buffer can back
/// many bindings at rotating offsets.
fn map_descriptor_type(
    ty: spirv_reflect::types::ReflectDescriptorType,
) -> Result<vk::DescriptorType> {
    use spirv_reflect::types::ReflectDescriptorType;
    match ty {
        ReflectDescriptorType::UniformBuffer | ReflectDescriptorType::UniformBufferDynamic => {
            Ok(vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC)
        }
        ReflectDescriptorType::StorageBuffer | ReflectDescriptorType::StorageBufferDynamic => {
            Ok(vk::DescriptorType::STORAGE_BUFFER)
        }
        ReflectDescriptorType::CombinedImageSampler => {
            Ok(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
        }
        ReflectDescriptorType::SampledImage => Ok(vk::DescriptorType::SAMPLED_IMAGE),
        ReflectDescriptorType::StorageImage => Ok(vk::DescriptorType::STORAGE_IMAGE),
        ReflectDescriptorType::Sampler => Ok(vk::DescriptorType::SAMPLER),
        other => Err(GpuError::ShaderCreation(format!(
            "unsupported descriptor type in shader: {other:?}"
        ))),
    }
}

/// Maps reflected vertex input formats to (Vulkan format, byte size).
fn map_vertex_format(format: spirv_reflect::types::ReflectFormat) -> Result<(vk::Format, u32)> {
    use spirv_reflect::types::ReflectFormat;
    let mapped = match format {
        ReflectFormat::R32_UINT => (vk::Format::R32_UINT, 4),
        ReflectFormat::R32_SINT => (vk::Format::R32_SINT, 4),
        ReflectFormat::R32_SFLOAT => (vk::Format::R32_SFLOAT, 4),
        ReflectFormat::R32G32_UINT => (vk::Format::R32G32_UINT, 8),
        ReflectFormat::R32G32_SINT => (vk::Format::R32G32_SINT, 8),
        ReflectFormat::R32G32_SFLOAT => (vk::Format::R32G32_SFLOAT, 8),
        ReflectFormat::R32G32B32_UINT => (vk::Format::R32G32B32_UINT, 12),
        ReflectFormat::R32G32B32_SINT => (vk::Format::R32G32B32_SINT, 12),
        ReflectFormat::R32G32B32_SFLOAT => (vk::Format::R32G32B32_SFLOAT, 12),
        ReflectFormat::R32G32B32A32_UINT => (vk::Format::R32G32B32A32_UINT, 16),
        ReflectFormat::R32G32B32A32_SINT => (vk::Format::R32G32B32A32_SINT, 16),
        ReflectFormat::R32G32B32A32_SFLOAT => (vk::Format::R32G32B32A32_SFLOAT, 16),
        other => {
            return Err(GpuError::ShaderCreation(format!(
                "unsupported vertex input format: {other:?}"
            )))
        }
    };
    Ok(mapped)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_misaligned_binaries() {
        assert!(spirv_words(&[0x03, 0x02, 0x23]).is_err());
        assert!(spirv_words(&[]).is_err());
    }

    #[test]
    fn rejects_bad_magic() {
        let bytes = [0xde, 0xad, 0xbe, 0xef, 0, 0, 0, 0];
        assert!(spirv_words(&bytes).is_err());
    }

    #[test]
    fn accepts_spirv_magic() {
        let bytes = [0x03, 0x02, 0x23, 0x07, 0x00, 0x00, 0x01, 0x00];
        let words = spirv_words(&bytes).unwrap();
        assert_eq!(words[0], 0x0723_0203);
    }

    #[test]
    fn uniform_buffers_become_dynamic() {
        use spirv_reflect::types::ReflectDescriptorType;
        assert_eq!(
            map_descriptor_type(ReflectDescriptorType::UniformBuffer).unwrap(),
            vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC
        );
        assert_eq!(
            map_descriptor_type(ReflectDescriptorType::UniformBufferDynamic).unwrap(),
            vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC
        );
    }

    #[test]
    fn vertex_format_sizes_accumulate_into_offsets() {
        use spirv_reflect::types::ReflectFormat;
        let (_, vec3) = map_vertex_format(ReflectFormat::R32G32B32_SFLOAT).unwrap();
        let (_, vec2) = map_vertex_format(ReflectFormat::R32G32_SFLOAT).unwrap();
        assert_eq!(vec3 + vec2, 20);
    }
}
