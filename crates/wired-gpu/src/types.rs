//! Public API types for resource creation and command recording.

use crate::ids::{BufferId, CommandBufferId, ImageId};
use bitflags::bitflags;
use wired_core::{Point3D, Size3D};

/// Sampling filter for blits and samplers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Filter {
    #[default]
    Linear,
    Nearest,
}

/// Index element width for indexed draws.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IndexType {
    Uint16,
    Uint32,
}

/// Shader pipeline stage a binary targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaderType {
    Vertex,
    Fragment,
    Compute,
}

/// A pre-compiled shader binary plus the metadata needed to register it.
///
/// Binaries arrive as SPIR-V words in little-endian byte order.
#[derive(Clone, Debug)]
pub struct ShaderSpec {
    pub shader_name: String,
    pub shader_type: ShaderType,
    pub shader_binary: Vec<u8>,
}

/// Token for an open copy pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CopyPass {
    pub command_buffer_id: CommandBufferId,
}

/// Token for an open render pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderPass {
    pub command_buffer_id: CommandBufferId,
}

/// Token for an open compute pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ComputePass {
    pub command_buffer_id: CommandBufferId,
}

/// Either a render or a compute pass, for operations valid in both.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RenderOrComputePass {
    Render(RenderPass),
    Compute(ComputePass),
}

impl RenderOrComputePass {
    #[must_use]
    pub fn command_buffer_id(self) -> CommandBufferId {
        match self {
            Self::Render(pass) => pass.command_buffer_id,
            Self::Compute(pass) => pass.command_buffer_id,
        }
    }
}

impl From<RenderPass> for RenderOrComputePass {
    fn from(pass: RenderPass) -> Self {
        Self::Render(pass)
    }
}

impl From<ComputePass> for RenderOrComputePass {
    fn from(pass: ComputePass) -> Self {
        Self::Compute(pass)
    }
}

/// One indexed-indirect draw record, laid out for direct GPU consumption.
#[derive(Clone, Copy, Debug, Default, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
pub struct IndirectDrawCommand {
    pub index_count: u32,
    pub instance_count: u32,
    pub first_index: u32,
    pub vertex_offset: i32,
    pub first_instance: u32,
}

//
// Images
//

/// Logical image dimensionality.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ImageType {
    #[default]
    Image2D,
    Image2DArray,
    Image3D,
    ImageCube,
}

bitflags! {
    /// Declared uses for an image; drives format, view, and barrier selection.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct ImageUsageFlags: u32 {
        const GRAPHICS_SAMPLED = 1 << 0;
        const COMPUTE_SAMPLED = 1 << 1;
        const COLOR_TARGET = 1 << 2;
        const DEPTH_STENCIL_TARGET = 1 << 3;
        const POST_PROCESS = 1 << 4;
        const TRANSFER_SRC = 1 << 5;
        const TRANSFER_DST = 1 << 6;
        const GRAPHICS_STORAGE_READ = 1 << 7;
        const COMPUTE_STORAGE_READ = 1 << 8;
        const COMPUTE_STORAGE_READ_WRITE = 1 << 9;
    }
}

/// Which aspect of an image an operation addresses.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ImageAspect {
    #[default]
    Color,
    Depth,
}

/// Color space of image contents.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ColorSpace {
    #[default]
    Srgb,
    Linear,
}

/// Parameters for creating an image.
#[derive(Clone, Debug, Default)]
pub struct ImageCreateParams {
    pub image_type: ImageType,
    pub usage_flags: ImageUsageFlags,
    pub size: Size3D,
    pub color_space: ColorSpace,
    pub num_layers: u32,
    pub num_mip_levels: u32,
}

/// A contiguous range of mips and layers within an image.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ImageSubresourceRange {
    pub image_aspect: ImageAspect,
    pub base_mip_level: u32,
    pub level_count: u32,
    pub base_array_layer: u32,
    pub layer_count: u32,
}

impl ImageSubresourceRange {
    /// The single mip and layer of a simple 2D color image.
    pub const ONE_LEVEL_ONE_LAYER_COLOR: Self = Self {
        image_aspect: ImageAspect::Color,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    };
}

impl Default for ImageSubresourceRange {
    fn default() -> Self {
        Self::ONE_LEVEL_ONE_LAYER_COLOR
    }
}

/// A rectangular region of one mip of one layer, for blits and uploads.
///
/// `offsets[0]` and `offsets[1]` bound the region; a zero second offset in an
/// upload means "the whole mip extent".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ImageRegion {
    pub layer_index: u32,
    pub mip_level: u32,
    pub offsets: [Point3D; 2],
}

//
// Buffers
//

bitflags! {
    /// Declared uses for a buffer; drives Vulkan usage flags and the
    /// default usage mode.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct BufferUsageFlags: u32 {
        const VERTEX = 1 << 0;
        const INDEX = 1 << 1;
        const INDIRECT = 1 << 2;
        const TRANSFER_SRC = 1 << 3;
        const TRANSFER_DST = 1 << 4;
        const GRAPHICS_UNIFORM_READ = 1 << 5;
        const GRAPHICS_STORAGE_READ = 1 << 6;
        const COMPUTE_UNIFORM_READ = 1 << 7;
        const COMPUTE_STORAGE_READ = 1 << 8;
        const COMPUTE_STORAGE_READ_WRITE = 1 << 9;
    }
}

/// Parameters for creating a device-local buffer.
#[derive(Clone, Copy, Debug, Default)]
pub struct BufferCreateParams {
    pub usage_flags: BufferUsageFlags,
    pub byte_size: u64,
    pub dedicated_memory: bool,
}

bitflags! {
    /// Direction(s) a transfer buffer moves data.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct TransferBufferUsageFlags: u32 {
        const UPLOAD = 1 << 0;
        const DOWNLOAD = 1 << 1;
    }
}

/// Parameters for creating a host-visible transfer buffer.
#[derive(Clone, Copy, Debug, Default)]
pub struct TransferBufferCreateParams {
    pub usage_flags: TransferBufferUsageFlags,
    pub byte_size: u64,
    pub sequentially_written: bool,
}

/// A buffer plus a byte offset into it, for vertex/index binds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferBinding {
    pub buffer_id: BufferId,
    pub byte_offset: u64,
}

//
// Rendering
//

/// What happens to attachment contents when a render pass begins.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum LoadOp {
    Load,
    #[default]
    Clear,
    DontCare,
}

/// What happens to attachment contents when a render pass ends.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum StoreOp {
    #[default]
    Store,
    DontCare,
}

/// A color render target for a render pass.
#[derive(Clone, Copy, Debug)]
pub struct ColorRenderAttachment {
    pub image_id: ImageId,
    pub mip_level: u32,
    pub layer: u32,
    pub load_op: LoadOp,
    pub store_op: StoreOp,
    pub clear_color: [f32; 4],
    pub cycle: bool,
}

impl ColorRenderAttachment {
    #[must_use]
    pub fn new(image_id: ImageId) -> Self {
        Self {
            image_id,
            mip_level: 0,
            layer: 0,
            load_op: LoadOp::Clear,
            store_op: StoreOp::Store,
            clear_color: [0.0, 0.0, 0.0, 1.0],
            cycle: true,
        }
    }
}

/// A depth render target for a render pass.
#[derive(Clone, Copy, Debug)]
pub struct DepthRenderAttachment {
    pub image_id: ImageId,
    pub mip_level: u32,
    pub layer: u32,
    pub load_op: LoadOp,
    pub store_op: StoreOp,
    pub clear_depth: f32,
    pub cycle: bool,
}

impl DepthRenderAttachment {
    #[must_use]
    pub fn new(image_id: ImageId) -> Self {
        Self {
            image_id,
            mip_level: 0,
            layer: 0,
            load_op: LoadOp::Clear,
            store_op: StoreOp::Store,
            clear_depth: 0.0,
            cycle: true,
        }
    }
}

/// Triangle faces culled during rasterization.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum CullFace {
    None,
    Front,
    #[default]
    Back,
}

//
// Samplers
//

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum SamplerFilter {
    Nearest,
    #[default]
    Linear,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum SamplerMipmapMode {
    Nearest,
    #[default]
    Linear,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum SamplerAddressMode {
    #[default]
    Clamp,
    Repeat,
    Mirrored,
}

/// Parameters for creating a sampler.
///
/// Every field participates in the sampler content hash; changing any
/// field yields a distinct sampler.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SamplerInfo {
    pub mag_filter: SamplerFilter,
    pub min_filter: SamplerFilter,
    pub mipmap_mode: SamplerMipmapMode,
    pub address_mode_u: SamplerAddressMode,
    pub address_mode_v: SamplerAddressMode,
    pub address_mode_w: SamplerAddressMode,
    pub anisotropy_enable: bool,
    pub mip_lod_bias: Option<f32>,
    pub min_lod: Option<f32>,
    pub max_lod: Option<f32>,
}

//
// Pipelines
//

/// A rectangle in pixels, for pipeline viewports.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ViewportRect {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

/// Parameters for creating a graphics pipeline.
#[derive(Clone, Debug, Default)]
pub struct GraphicsPipelineParams {
    pub vertex_shader_name: Option<String>,
    pub fragment_shader_name: Option<String>,

    /// Images whose formats the pipeline's color attachments are built for.
    pub color_attachment_image_ids: Vec<ImageId>,
    /// Image whose format the pipeline's depth attachment is built for.
    pub depth_attachment_image_id: Option<ImageId>,

    pub viewport: ViewportRect,

    pub cull_face: CullFace,
    pub depth_bias_enabled: bool,
    pub wireframe_fill_mode: bool,

    pub depth_test_enabled: bool,
    pub depth_write_enabled: bool,
}

/// Parameters for creating a compute pipeline.
#[derive(Clone, Debug, Default)]
pub struct ComputePipelineParams {
    pub shader_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pass_token_resolves_command_buffer() {
        let pass = RenderOrComputePass::from(RenderPass {
            command_buffer_id: CommandBufferId(7),
        });
        assert_eq!(pass.command_buffer_id(), CommandBufferId(7));
    }

    #[test]
    fn indirect_draw_command_layout() {
        assert_eq!(std::mem::size_of::<IndirectDrawCommand>(), 20);
    }
}
