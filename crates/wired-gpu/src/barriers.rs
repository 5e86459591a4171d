//! Usage modes and the barrier parameters they map to.
//!
//! Each resource carries a single default usage mode describing its steady
//! state. Operations barrier the resource from its default mode to the mode
//! they require, then back again afterwards, so every operation finds
//! resources in their default state and leaves them there. Each mode maps to a
//! fixed (stage mask, access mask[, layout]) triple; buffer modes carry no
//! layout.

use ash::vk;

/// How a buffer is being accessed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferUsageMode {
    TransferSrc,
    TransferDst,
    VertexRead,
    IndexRead,
    IndirectRead,
    GraphicsUniformRead,
    GraphicsStorageRead,
    ComputeUniformRead,
    ComputeStorageRead,
    ComputeStorageReadWrite,
}

/// How an image is being accessed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageUsageMode {
    Undefined,
    GraphicsSampled,
    ComputeSampled,
    TransferSrc,
    TransferDst,
    ColorAttachment,
    DepthAttachment,
    PresentSrc,
    GraphicsStorageRead,
    ComputeStorageRead,
    ComputeStorageReadWrite,
}

/// Barrier parameters for one side of an image transition.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageBarrierFlags {
    pub stage_mask: vk::PipelineStageFlags2,
    pub access_mask: vk::AccessFlags2,
    pub layout: vk::ImageLayout,
}

/// Barrier parameters for one side of a buffer transition.
#[derive(Debug, Clone, Copy, Default)]
pub struct BufferBarrierFlags {
    pub stage_mask: vk::PipelineStageFlags2,
    pub access_mask: vk::AccessFlags2,
}

#[must_use]
pub fn source_image_barrier_flags(mode: ImageUsageMode) -> ImageBarrierFlags {
    match mode {
        ImageUsageMode::Undefined => ImageBarrierFlags {
            stage_mask: vk::PipelineStageFlags2::NONE,
            access_mask: vk::AccessFlags2::NONE,
            layout: vk::ImageLayout::UNDEFINED,
        },
        ImageUsageMode::GraphicsSampled => ImageBarrierFlags {
            stage_mask: vk::PipelineStageFlags2::VERTEX_SHADER
                | vk::PipelineStageFlags2::FRAGMENT_SHADER,
            access_mask: vk::AccessFlags2::SHADER_SAMPLED_READ,
            layout: vk::ImageLayout::READ_ONLY_OPTIMAL,
        },
        ImageUsageMode::ComputeSampled => ImageBarrierFlags {
            stage_mask: vk::PipelineStageFlags2::COMPUTE_SHADER,
            access_mask: vk::AccessFlags2::SHADER_SAMPLED_READ,
            layout: vk::ImageLayout::READ_ONLY_OPTIMAL,
        },
        ImageUsageMode::TransferSrc => ImageBarrierFlags {
            stage_mask: vk::PipelineStageFlags2::TRANSFER,
            access_mask: vk::AccessFlags2::TRANSFER_READ,
            layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        },
        ImageUsageMode::TransferDst => ImageBarrierFlags {
            stage_mask: vk::PipelineStageFlags2::TRANSFER,
            access_mask: vk::AccessFlags2::TRANSFER_WRITE,
            layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        },
        ImageUsageMode::ColorAttachment => ImageBarrierFlags {
            stage_mask: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            access_mask: vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
            layout: vk::ImageLayout::ATTACHMENT_OPTIMAL,
        },
        ImageUsageMode::DepthAttachment => ImageBarrierFlags {
            stage_mask: vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
            access_mask: vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
            layout: vk::ImageLayout::ATTACHMENT_OPTIMAL,
        },
        // Nothing ever reads a presented image back through a barrier
        ImageUsageMode::PresentSrc => ImageBarrierFlags::default(),
        ImageUsageMode::GraphicsStorageRead => ImageBarrierFlags {
            stage_mask: vk::PipelineStageFlags2::VERTEX_SHADER
                | vk::PipelineStageFlags2::FRAGMENT_SHADER,
            access_mask: vk::AccessFlags2::SHADER_READ,
            layout: vk::ImageLayout::READ_ONLY_OPTIMAL,
        },
        ImageUsageMode::ComputeStorageRead => ImageBarrierFlags {
            stage_mask: vk::PipelineStageFlags2::COMPUTE_SHADER,
            access_mask: vk::AccessFlags2::SHADER_READ,
            layout: vk::ImageLayout::READ_ONLY_OPTIMAL,
        },
        ImageUsageMode::ComputeStorageReadWrite => ImageBarrierFlags {
            stage_mask: vk::PipelineStageFlags2::COMPUTE_SHADER,
            access_mask: vk::AccessFlags2::SHADER_READ | vk::AccessFlags2::SHADER_WRITE,
            layout: vk::ImageLayout::GENERAL,
        },
    }
}

#[must_use]
pub fn dest_image_barrier_flags(mode: ImageUsageMode) -> ImageBarrierFlags {
    match mode {
        // Transitioning to Undefined is meaningless
        ImageUsageMode::Undefined => ImageBarrierFlags::default(),
        ImageUsageMode::GraphicsSampled => ImageBarrierFlags {
            stage_mask: vk::PipelineStageFlags2::VERTEX_SHADER
                | vk::PipelineStageFlags2::FRAGMENT_SHADER,
            access_mask: vk::AccessFlags2::SHADER_SAMPLED_READ,
            layout: vk::ImageLayout::READ_ONLY_OPTIMAL,
        },
        ImageUsageMode::ComputeSampled => ImageBarrierFlags {
            stage_mask: vk::PipelineStageFlags2::COMPUTE_SHADER,
            access_mask: vk::AccessFlags2::SHADER_SAMPLED_READ,
            layout: vk::ImageLayout::READ_ONLY_OPTIMAL,
        },
        ImageUsageMode::TransferSrc => ImageBarrierFlags {
            stage_mask: vk::PipelineStageFlags2::TRANSFER,
            access_mask: vk::AccessFlags2::TRANSFER_READ,
            layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        },
        ImageUsageMode::TransferDst => ImageBarrierFlags {
            stage_mask: vk::PipelineStageFlags2::TRANSFER,
            access_mask: vk::AccessFlags2::TRANSFER_WRITE,
            layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        },
        ImageUsageMode::ColorAttachment => ImageBarrierFlags {
            stage_mask: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            access_mask: vk::AccessFlags2::COLOR_ATTACHMENT_READ
                | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
            layout: vk::ImageLayout::ATTACHMENT_OPTIMAL,
        },
        ImageUsageMode::DepthAttachment => ImageBarrierFlags {
            stage_mask: vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
            access_mask: vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
            layout: vk::ImageLayout::ATTACHMENT_OPTIMAL,
        },
        ImageUsageMode::PresentSrc => ImageBarrierFlags {
            stage_mask: vk::PipelineStageFlags2::TOP_OF_PIPE,
            access_mask: vk::AccessFlags2::NONE,
            layout: vk::ImageLayout::PRESENT_SRC_KHR,
        },
        ImageUsageMode::GraphicsStorageRead => ImageBarrierFlags {
            stage_mask: vk::PipelineStageFlags2::VERTEX_SHADER
                | vk::PipelineStageFlags2::FRAGMENT_SHADER,
            access_mask: vk::AccessFlags2::SHADER_READ,
            layout: vk::ImageLayout::READ_ONLY_OPTIMAL,
        },
        ImageUsageMode::ComputeStorageRead => ImageBarrierFlags {
            stage_mask: vk::PipelineStageFlags2::COMPUTE_SHADER,
            access_mask: vk::AccessFlags2::SHADER_READ,
            layout: vk::ImageLayout::READ_ONLY_OPTIMAL,
        },
        ImageUsageMode::ComputeStorageReadWrite => ImageBarrierFlags {
            stage_mask: vk::PipelineStageFlags2::COMPUTE_SHADER,
            access_mask: vk::AccessFlags2::SHADER_READ | vk::AccessFlags2::SHADER_WRITE,
            layout: vk::ImageLayout::GENERAL,
        },
    }
}

fn buffer_barrier_flags(mode: BufferUsageMode) -> BufferBarrierFlags {
    match mode {
        BufferUsageMode::TransferSrc => BufferBarrierFlags {
            stage_mask: vk::PipelineStageFlags2::TRANSFER,
            access_mask: vk::AccessFlags2::TRANSFER_READ,
        },
        BufferUsageMode::TransferDst => BufferBarrierFlags {
            stage_mask: vk::PipelineStageFlags2::TRANSFER,
            access_mask: vk::AccessFlags2::TRANSFER_WRITE,
        },
        BufferUsageMode::VertexRead => BufferBarrierFlags {
            stage_mask: vk::PipelineStageFlags2::VERTEX_INPUT,
            access_mask: vk::AccessFlags2::VERTEX_ATTRIBUTE_READ,
        },
        BufferUsageMode::IndexRead => BufferBarrierFlags {
            stage_mask: vk::PipelineStageFlags2::INDEX_INPUT,
            access_mask: vk::AccessFlags2::INDEX_READ,
        },
        BufferUsageMode::IndirectRead => BufferBarrierFlags {
            stage_mask: vk::PipelineStageFlags2::DRAW_INDIRECT,
            access_mask: vk::AccessFlags2::INDIRECT_COMMAND_READ,
        },
        BufferUsageMode::GraphicsUniformRead | BufferUsageMode::GraphicsStorageRead => {
            BufferBarrierFlags {
                stage_mask: vk::PipelineStageFlags2::VERTEX_SHADER
                    | vk::PipelineStageFlags2::FRAGMENT_SHADER,
                access_mask: vk::AccessFlags2::SHADER_READ,
            }
        }
        BufferUsageMode::ComputeUniformRead | BufferUsageMode::ComputeStorageRead => {
            BufferBarrierFlags {
                stage_mask: vk::PipelineStageFlags2::COMPUTE_SHADER,
                access_mask: vk::AccessFlags2::SHADER_READ,
            }
        }
        BufferUsageMode::ComputeStorageReadWrite => BufferBarrierFlags {
            stage_mask: vk::PipelineStageFlags2::COMPUTE_SHADER,
            access_mask: vk::AccessFlags2::SHADER_READ | vk::AccessFlags2::SHADER_WRITE,
        },
    }
}

#[must_use]
pub fn source_buffer_barrier_flags(mode: BufferUsageMode) -> BufferBarrierFlags {
    buffer_barrier_flags(mode)
}

#[must_use]
pub fn dest_buffer_barrier_flags(mode: BufferUsageMode) -> BufferBarrierFlags {
    buffer_barrier_flags(mode)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_dst_image_flags() {
        let flags = dest_image_barrier_flags(ImageUsageMode::TransferDst);
        assert_eq!(flags.stage_mask, vk::PipelineStageFlags2::TRANSFER);
        assert_eq!(flags.access_mask, vk::AccessFlags2::TRANSFER_WRITE);
        assert_eq!(flags.layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
    }

    #[test]
    fn present_src_is_asymmetric() {
        // Presenting transitions into PRESENT_SRC_KHR but nothing ever
        // transitions out of it through the usage system.
        let src = source_image_barrier_flags(ImageUsageMode::PresentSrc);
        let dst = dest_image_barrier_flags(ImageUsageMode::PresentSrc);
        assert_eq!(src.layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(dst.layout, vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(dst.stage_mask, vk::PipelineStageFlags2::TOP_OF_PIPE);
    }

    #[test]
    fn storage_read_write_targets_general_layout() {
        let flags = dest_image_barrier_flags(ImageUsageMode::ComputeStorageReadWrite);
        assert_eq!(flags.layout, vk::ImageLayout::GENERAL);
        assert!(flags.access_mask.contains(vk::AccessFlags2::SHADER_WRITE));
    }

    #[test]
    fn uniform_and_storage_buffer_reads_share_flags() {
        let uniform = dest_buffer_barrier_flags(BufferUsageMode::GraphicsUniformRead);
        let storage = dest_buffer_barrier_flags(BufferUsageMode::GraphicsStorageRead);
        assert_eq!(uniform.stage_mask, storage.stage_mask);
        assert_eq!(uniform.access_mask, storage.access_mask);
    }
}
