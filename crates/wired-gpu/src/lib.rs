//! Vulkan GPU resource lifecycle and command recording for the Wired engine.
//!
//! This crate provides:
//! - Device, surface, and swapchain management
//! - Pooled buffers, images, samplers, shaders, and pipelines
//! - Usage-tracked deferred destruction and per-frame cleanup
//! - Copy, render, and compute pass recording with automatic barriers
//! - Frame pacing, presentation, and GPU timestamp queries

pub mod barriers;
pub mod buffers;
pub mod capabilities;
pub mod command;
pub mod command_buffers;
pub mod context;
pub mod descriptors;
pub mod error;
pub mod frame;
pub mod gpu;
pub mod ids;
pub mod images;
pub mod instance;
pub mod layouts;
pub mod memory;
pub mod pass_state;
pub mod pipelines;
pub mod samplers;
pub mod settings;
pub mod shaders;
pub mod surface;
pub mod swapchain;
pub mod timestamps;
pub mod types;
pub mod uniforms;
pub mod usage;

pub use command::CommandBufferType;
pub use error::{GpuError, Result, SurfaceError};
pub use gpu::Gpu;
pub use ids::{BufferId, CommandBufferId, ImageId, PipelineId, SamplerId};
pub use settings::{GpuSettings, PresentMode, SamplerAnisotropy};
pub use types::{
    BufferBinding, BufferCreateParams, BufferUsageFlags, ColorRenderAttachment, ColorSpace,
    ComputePass, ComputePipelineParams, CopyPass, CullFace, DepthRenderAttachment, Filter,
    GraphicsPipelineParams, ImageAspect, ImageCreateParams, ImageRegion, ImageSubresourceRange,
    ImageType, ImageUsageFlags, IndexType, IndirectDrawCommand, LoadOp, RenderOrComputePass,
    RenderPass, SamplerAddressMode, SamplerFilter, SamplerInfo, SamplerMipmapMode, ShaderSpec,
    ShaderType, StoreOp, TransferBufferCreateParams, TransferBufferUsageFlags, ViewportRect,
};
