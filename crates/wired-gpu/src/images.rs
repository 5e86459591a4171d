//! Image pool with deferred destruction and frame cycling.
//!
//! Mirrors the buffer pool's logical/physical split. Images additionally own
//! derived image views (one spanning the whole resource, plus one per layer
//! for multi-layer images) and may wrap externally owned swapchain images,
//! which are never destroyed here, only their views.

use crate::barriers::ImageUsageMode;
use crate::command::CommandBuffer;
use crate::context::DeviceContext;
use crate::error::{GpuError, Result};
use crate::ids::{Ids, ImageId};
use crate::memory::GpuImage;
use crate::types::{ImageCreateParams, ImageType, ImageUsageFlags};
use crate::usage::Usages;
use ash::vk;
use gpu_allocator::MemoryLocation;
use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;
use std::sync::Arc;

/// Everything needed to (re)create one physical image.
#[derive(Clone, Copy, Debug)]
pub struct ImageDef {
    pub vk_image_type: vk::ImageType,
    pub vk_format: vk::Format,
    pub vk_extent: vk::Extent3D,
    pub num_mip_levels: u32,
    pub num_layers: u32,
    pub cube_compatible: bool,
    pub vk_usage_flags: vk::ImageUsageFlags,
    pub dedicated: bool,
}

/// Everything needed to (re)create one image view.
#[derive(Clone, Copy, Debug)]
pub struct ImageViewDef {
    pub vk_view_type: vk::ImageViewType,
    pub vk_format: vk::Format,
    pub subresource_range: vk::ImageSubresourceRange,
}

/// One created view of a physical image.
#[derive(Clone, Copy, Debug)]
pub struct ImageViewInstance {
    pub vk_image_view: vk::ImageView,
    pub def: ImageViewDef,
}

/// A snapshot of one physical image and its views, handed out by lookups.
#[derive(Clone, Debug)]
pub struct ImageInstance {
    pub vk_image: vk::Image,
    pub default_usage_mode: ImageUsageMode,
    pub def: ImageDef,
    pub views: Vec<ImageViewInstance>,
    pub is_swapchain_image: bool,
}

impl ImageInstance {
    /// The aspect this image's operations address.
    #[must_use]
    pub fn aspect_flags(&self) -> vk::ImageAspectFlags {
        if self
            .def
            .vk_usage_flags
            .contains(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT)
        {
            vk::ImageAspectFlags::DEPTH
        } else {
            vk::ImageAspectFlags::COLOR
        }
    }

    /// A subresource range spanning every mip and layer.
    #[must_use]
    pub fn whole_subresource_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: self.aspect_flags(),
            base_mip_level: 0,
            level_count: self.def.num_mip_levels,
            base_array_layer: 0,
            layer_count: self.def.num_layers,
        }
    }

    /// The view spanning the whole resource. Always present; created first.
    #[must_use]
    pub fn whole_view(&self) -> Option<ImageViewInstance> {
        self.views.first().copied()
    }

    /// The single-layer view for `layer`, for render-target binding.
    ///
    /// For single-layer images this is the whole-resource view.
    #[must_use]
    pub fn layer_view(&self, layer: u32) -> Option<ImageViewInstance> {
        if self.def.num_layers == 1 {
            self.whole_view()
        } else {
            self.views.get(1 + layer as usize).copied()
        }
    }
}

struct PhysicalImage {
    vk_image: vk::Image,
    // None for swapchain images, whose memory the surface owns
    gpu: Option<GpuImage>,
    default_usage_mode: ImageUsageMode,
    def: ImageDef,
    views: Vec<ImageViewInstance>,
}

impl PhysicalImage {
    fn instance(&self, is_swapchain_image: bool) -> ImageInstance {
        ImageInstance {
            vk_image: self.vk_image,
            default_usage_mode: self.default_usage_mode,
            def: self.def,
            views: self.views.clone(),
            is_swapchain_image,
        }
    }
}

struct Image {
    id: ImageId,
    is_swapchain_image: bool,
    tag: String,
    active_index: usize,
    physical: Vec<PhysicalImage>,
}

#[derive(Default)]
struct ImagesState {
    images: HashMap<ImageId, Image>,
    marked_for_deletion: HashSet<ImageId>,
}

/// Pool of logical images.
pub struct Images {
    context: Arc<DeviceContext>,
    usages: Arc<Usages>,
    ids: Arc<Ids>,
    state: Mutex<ImagesState>,
}

impl Images {
    pub fn new(context: Arc<DeviceContext>, usages: Arc<Usages>, ids: Arc<Ids>) -> Self {
        Self {
            context,
            usages,
            ids,
            state: Mutex::new(ImagesState::default()),
        }
    }

    /// Create an image from public creation parameters.
    ///
    /// Records the initial layout transition into `cmd`, so the image reaches
    /// its default usage mode before first use.
    pub fn create_from_params(
        &self,
        cmd: &mut CommandBuffer,
        params: &ImageCreateParams,
        tag: &str,
    ) -> Result<ImageId> {
        if params.image_type == ImageType::ImageCube && params.num_layers < 6 {
            return Err(GpuError::InvalidParameters(format!(
                "Cubic images must have >= 6 layers: {tag}"
            )));
        }

        if params.image_type != ImageType::Image3D && params.size.d != 1 {
            return Err(GpuError::InvalidParameters(format!(
                "Non-3D images must have a depth of 1: {tag}"
            )));
        }

        let (def, default_usage_mode) = self.def_from_params(params, tag)?;
        let view_defs = view_defs_from_params(params, &def);

        let physical = self.create_physical(cmd, &def, default_usage_mode, &view_defs, tag)?;

        let mut state = self.state.lock();

        let id = ImageId(self.ids.image_ids.acquire());
        state.images.insert(
            id,
            Image {
                id,
                is_swapchain_image: false,
                tag: tag.to_string(),
                active_index: 0,
                physical: vec![physical],
            },
        );

        Ok(id)
    }

    /// Wrap a swapchain image the surface owns.
    ///
    /// Only a view is created; the native image is external and is never
    /// destroyed by this pool.
    pub fn create_from_swapchain_image(
        &self,
        swapchain_image_index: u32,
        vk_image: vk::Image,
        format: vk::Format,
        extent: vk::Extent2D,
    ) -> Result<ImageId> {
        let tag = format!("Swapchain-{swapchain_image_index}");

        // Only the fields consulted later are meaningful for external images
        let def = ImageDef {
            vk_image_type: vk::ImageType::TYPE_2D,
            vk_format: format,
            vk_extent: vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            },
            num_mip_levels: 1,
            num_layers: 1,
            cube_compatible: false,
            vk_usage_flags: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            dedicated: false,
        };

        let view_def = ImageViewDef {
            vk_view_type: vk::ImageViewType::TYPE_2D,
            vk_format: format,
            subresource_range: vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            },
        };

        let view = self.create_view(vk_image, &view_def, &tag, "ImageView")?;

        let physical = PhysicalImage {
            vk_image,
            gpu: None,
            default_usage_mode: ImageUsageMode::ColorAttachment,
            def,
            views: vec![view],
        };

        let mut state = self.state.lock();

        let id = ImageId(self.ids.image_ids.acquire());
        state.images.insert(
            id,
            Image {
                id,
                is_swapchain_image: true,
                tag,
                active_index: 0,
                physical: vec![physical],
            },
        );

        Ok(id)
    }

    fn def_from_params(
        &self,
        params: &ImageCreateParams,
        tag: &str,
    ) -> Result<(ImageDef, ImageUsageMode)> {
        let flags = params.usage_flags;

        // Order matters: the earliest matching flag decides the resting state
        let default_usage_mode = if flags
            .intersects(ImageUsageFlags::DEPTH_STENCIL_TARGET | ImageUsageFlags::COLOR_TARGET)
            || flags.contains(ImageUsageFlags::GRAPHICS_SAMPLED)
        {
            ImageUsageMode::GraphicsSampled
        } else if flags.contains(ImageUsageFlags::COMPUTE_SAMPLED) {
            ImageUsageMode::ComputeSampled
        } else if flags.intersects(
            ImageUsageFlags::COMPUTE_STORAGE_READ | ImageUsageFlags::COMPUTE_STORAGE_READ_WRITE,
        ) {
            ImageUsageMode::ComputeStorageRead
        } else if flags.contains(ImageUsageFlags::TRANSFER_SRC) {
            ImageUsageMode::TransferSrc
        } else {
            return Err(GpuError::InvalidParameters(format!(
                "Image has no supported usage flags: {tag}"
            )));
        };

        // Attachment formats are fixed; everything else follows color space
        let (vk_format, dedicated) = if flags.contains(ImageUsageFlags::DEPTH_STENCIL_TARGET) {
            let format = self.context.capabilities().depth_format;
            (format, true)
        } else if flags.intersects(ImageUsageFlags::COLOR_TARGET | ImageUsageFlags::POST_PROCESS) {
            (vk::Format::R16G16B16A16_SFLOAT, true)
        } else {
            let format = match params.color_space {
                crate::types::ColorSpace::Srgb => vk::Format::B8G8R8A8_SRGB,
                crate::types::ColorSpace::Linear => vk::Format::B8G8R8A8_UNORM,
            };
            (format, false)
        };

        let mut vk_usage_flags = vk::ImageUsageFlags::TRANSFER_DST;
        if flags.intersects(ImageUsageFlags::GRAPHICS_SAMPLED | ImageUsageFlags::COMPUTE_SAMPLED) {
            vk_usage_flags |= vk::ImageUsageFlags::SAMPLED;
        }
        if flags.contains(ImageUsageFlags::COLOR_TARGET) {
            vk_usage_flags |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
        }
        if flags.contains(ImageUsageFlags::DEPTH_STENCIL_TARGET) {
            vk_usage_flags |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
        }
        if flags.contains(ImageUsageFlags::TRANSFER_SRC) {
            vk_usage_flags |= vk::ImageUsageFlags::TRANSFER_SRC;
        }
        if flags.intersects(
            ImageUsageFlags::GRAPHICS_STORAGE_READ
                | ImageUsageFlags::COMPUTE_STORAGE_READ
                | ImageUsageFlags::COMPUTE_STORAGE_READ_WRITE,
        ) {
            vk_usage_flags |= vk::ImageUsageFlags::STORAGE;
        }
        if params.num_mip_levels > 1 {
            // Mip generation blits between levels
            vk_usage_flags |= vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST;
        }

        let def = ImageDef {
            vk_image_type: match params.image_type {
                ImageType::Image3D => vk::ImageType::TYPE_3D,
                _ => vk::ImageType::TYPE_2D,
            },
            vk_format,
            vk_extent: vk::Extent3D {
                width: params.size.w,
                height: params.size.h,
                depth: params.size.d,
            },
            num_mip_levels: params.num_mip_levels,
            num_layers: params.num_layers,
            cube_compatible: params.image_type == ImageType::ImageCube,
            vk_usage_flags,
            dedicated,
        };

        Ok((def, default_usage_mode))
    }

    fn create_physical(
        &self,
        cmd: &mut CommandBuffer,
        def: &ImageDef,
        default_usage_mode: ImageUsageMode,
        view_defs: &[ImageViewDef],
        tag: &str,
    ) -> Result<PhysicalImage> {
        let mut create_flags = vk::ImageCreateFlags::empty();
        if def.cube_compatible {
            if def.num_layers < 6 {
                tracing::error!(
                    tag,
                    "Image specified as cube compatible without six layers, ignoring"
                );
            } else {
                create_flags |= vk::ImageCreateFlags::CUBE_COMPATIBLE;
            }
        }

        let create_info = vk::ImageCreateInfo::default()
            .flags(create_flags)
            .image_type(def.vk_image_type)
            .format(def.vk_format)
            .extent(def.vk_extent)
            .mip_levels(def.num_mip_levels)
            .array_layers(def.num_layers)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(def.vk_usage_flags)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let gpu = self.context.allocator().lock().create_image(
            &create_info,
            MemoryLocation::GpuOnly,
            def.dedicated,
            tag,
        )?;

        self.context
            .set_object_name(gpu.image, &format!("Image-{tag}"));

        let mut physical = PhysicalImage {
            vk_image: gpu.image,
            gpu: Some(gpu),
            default_usage_mode,
            def: *def,
            views: Vec::with_capacity(view_defs.len()),
        };

        for (index, view_def) in view_defs.iter().enumerate() {
            let view =
                self.create_view(physical.vk_image, view_def, tag, &index.to_string())?;
            physical.views.push(view);
        }

        // Transition to the default usage state so first use never has to
        // care whether the image is still in Undefined layout. Two steps,
        // through TransferDst, since Undefined directly to a sampled state
        // has nothing to sample from.
        let instance = physical.instance(false);
        let range = instance.whole_subresource_range();
        cmd.cmd_image_pipeline_barrier(
            instance.vk_image,
            range,
            ImageUsageMode::Undefined,
            ImageUsageMode::TransferDst,
        );
        cmd.cmd_image_pipeline_barrier(
            instance.vk_image,
            range,
            ImageUsageMode::TransferDst,
            default_usage_mode,
        );

        Ok(physical)
    }

    fn create_view(
        &self,
        vk_image: vk::Image,
        view_def: &ImageViewDef,
        image_tag: &str,
        view_tag: &str,
    ) -> Result<ImageViewInstance> {
        let create_info = vk::ImageViewCreateInfo::default()
            .image(vk_image)
            .view_type(view_def.vk_view_type)
            .format(view_def.vk_format)
            .subresource_range(view_def.subresource_range);

        let vk_image_view = unsafe {
            self.context
                .device()
                .create_image_view(&create_info, None)
                .map_err(GpuError::from)?
        };

        self.context
            .set_object_name(vk_image_view, &format!("ImageView-{image_tag}-{view_tag}"));

        Ok(ImageViewInstance {
            vk_image_view,
            def: *view_def,
        })
    }

    /// Look up a logical image's active physical instance.
    ///
    /// Returns `None` when the ID is unknown or the image is marked for
    /// deletion. Cycling requires a command buffer (new physical images need
    /// their initial layout transition recorded) and is refused for
    /// swapchain images, whose physical instance is fixed.
    pub fn get_image(
        &self,
        image_id: ImageId,
        cycled: bool,
        cmd: Option<&mut CommandBuffer>,
    ) -> Option<ImageInstance> {
        let mut state = self.state.lock();

        if state.marked_for_deletion.contains(&image_id) {
            tracing::warn!(image_id = %image_id, "GetImage: image is marked for deletion");
            return None;
        }

        let image = state.images.get_mut(&image_id)?;

        if cycled {
            if image.is_swapchain_image {
                tracing::error!(image_id = %image_id, "GetImage: can't cycle a swapchain image");
                return None;
            }

            let Some(cmd) = cmd else {
                tracing::error!(image_id = %image_id, "GetImage: cycling requires a command buffer");
                return None;
            };

            if let Err(e) = self.cycle_if_needed(cmd, image) {
                tracing::error!(image_id = %image_id, error = %e, "GetImage: cycling failed");
                return None;
            }
        }

        Some(image.physical[image.active_index].instance(image.is_swapchain_image))
    }

    fn cycle_if_needed(&self, cmd: &mut CommandBuffer, image: &mut Image) -> Result<()> {
        let active = &image.physical[image.active_index];
        if self.usages.images.gpu_usage_count(&active.vk_image) == 0 {
            return Ok(());
        }

        for (index, physical) in image.physical.iter().enumerate() {
            if index == image.active_index {
                continue;
            }
            if self.usages.images.gpu_usage_count(&physical.vk_image) == 0 {
                image.active_index = index;
                return Ok(());
            }
        }

        let sample = &image.physical[0];
        let def = sample.def;
        let default_usage_mode = sample.default_usage_mode;
        let view_defs: Vec<ImageViewDef> = sample.views.iter().map(|view| view.def).collect();

        let physical =
            self.create_physical(cmd, &def, default_usage_mode, &view_defs, &image.tag)?;
        image.physical.push(physical);
        image.active_index = image.physical.len() - 1;

        Ok(())
    }

    /// Destroy a logical image, immediately or deferred to cleanup.
    pub fn destroy_image(&self, image_id: ImageId, destroy_immediately: bool) {
        let mut state = self.state.lock();
        self.destroy_image_locked(&mut state, image_id, destroy_immediately);
    }

    fn destroy_image_locked(
        &self,
        state: &mut ImagesState,
        image_id: ImageId,
        destroy_immediately: bool,
    ) {
        if !state.images.contains_key(&image_id) {
            tracing::warn!(image_id = %image_id, "DestroyImage: no such image");
            return;
        }

        if destroy_immediately {
            if let Some(image) = state.images.remove(&image_id) {
                self.free_physical_images(image);
            }
            state.marked_for_deletion.remove(&image_id);
            self.ids.image_ids.release(image_id.0);
        } else {
            state.marked_for_deletion.insert(image_id);
        }
    }

    fn free_physical_images(&self, image: Image) {
        tracing::debug!(image_id = %image.id, tag = %image.tag, "Destroying image objects");

        let device = self.context.device();
        for mut physical in image.physical {
            for view in &physical.views {
                unsafe {
                    device.destroy_image_view(view.vk_image_view, None);
                }
            }

            // Swapchain images have no allocation; the surface owns them
            if let Some(gpu) = physical.gpu.as_mut() {
                if let Err(e) = self.context.allocator().lock().free_image(gpu) {
                    tracing::error!(image_id = %image.id, error = %e, "Failed to free image");
                }
            }
        }
    }

    /// Sweep deletion-marked images whose physical instances are all
    /// unreferenced.
    pub fn run_cleanup(&self) {
        let mut state = self.state.lock();

        let marked: Vec<ImageId> = state.marked_for_deletion.iter().copied().collect();

        for image_id in marked {
            let Some(image) = state.images.get(&image_id) else {
                tracing::error!(image_id = %image_id, "RunCleanUp: marked image doesn't exist");
                state.marked_for_deletion.remove(&image_id);
                continue;
            };

            let all_unreferenced = image.physical.iter().all(|physical| {
                self.usages.images.gpu_usage_count(&physical.vk_image) == 0
                    && self.usages.images.lock_count(&physical.vk_image) == 0
            });

            if all_unreferenced {
                self.destroy_image_locked(&mut state, image_id, true);
            }
        }
    }

    /// Destroy every image, including live ones. Called at shutdown after
    /// the device has gone idle.
    pub fn destroy_all(&self) {
        tracing::info!("Images: destroying");

        let mut state = self.state.lock();
        let ids: Vec<ImageId> = state.images.keys().copied().collect();
        for image_id in ids {
            self.destroy_image_locked(&mut state, image_id, true);
        }
    }
}

/// Build the view set for an image: one whole-resource view, plus one
/// single-layer view per layer for multi-layer images.
fn view_defs_from_params(params: &ImageCreateParams, def: &ImageDef) -> Vec<ImageViewDef> {
    let aspect_mask = if params
        .usage_flags
        .contains(ImageUsageFlags::DEPTH_STENCIL_TARGET)
    {
        vk::ImageAspectFlags::DEPTH
    } else {
        vk::ImageAspectFlags::COLOR
    };

    let whole_view_type = match params.image_type {
        ImageType::Image2D => vk::ImageViewType::TYPE_2D,
        ImageType::Image2DArray => vk::ImageViewType::TYPE_2D_ARRAY,
        ImageType::Image3D => vk::ImageViewType::TYPE_3D,
        ImageType::ImageCube => vk::ImageViewType::CUBE,
    };

    let mut view_defs = vec![ImageViewDef {
        vk_view_type: whole_view_type,
        vk_format: def.vk_format,
        subresource_range: vk::ImageSubresourceRange {
            aspect_mask,
            base_mip_level: 0,
            level_count: params.num_mip_levels,
            base_array_layer: 0,
            layer_count: params.num_layers,
        },
    }];

    if params.num_layers > 1 {
        for layer_index in 0..params.num_layers {
            view_defs.push(ImageViewDef {
                vk_view_type: vk::ImageViewType::TYPE_2D,
                vk_format: def.vk_format,
                subresource_range: vk::ImageSubresourceRange {
                    aspect_mask,
                    base_mip_level: 0,
                    level_count: params.num_mip_levels,
                    base_array_layer: layer_index,
                    layer_count: 1,
                },
            });
        }
    }

    view_defs
}

#[cfg(test)]
mod tests {
    use super::*;
    use wired_core::Size3D;

    fn params(usage_flags: ImageUsageFlags) -> ImageCreateParams {
        ImageCreateParams {
            image_type: ImageType::Image2D,
            usage_flags,
            size: Size3D::new(64, 64, 1),
            color_space: crate::types::ColorSpace::Srgb,
            num_layers: 1,
            num_mip_levels: 1,
        }
    }

    #[test]
    fn single_layer_image_gets_one_view() {
        let p = params(ImageUsageFlags::GRAPHICS_SAMPLED);
        let def = ImageDef {
            vk_image_type: vk::ImageType::TYPE_2D,
            vk_format: vk::Format::B8G8R8A8_SRGB,
            vk_extent: vk::Extent3D {
                width: 64,
                height: 64,
                depth: 1,
            },
            num_mip_levels: 1,
            num_layers: 1,
            cube_compatible: false,
            vk_usage_flags: vk::ImageUsageFlags::SAMPLED,
            dedicated: false,
        };
        assert_eq!(view_defs_from_params(&p, &def).len(), 1);
    }

    #[test]
    fn layered_image_gets_per_layer_views() {
        let mut p = params(ImageUsageFlags::COLOR_TARGET);
        p.image_type = ImageType::Image2DArray;
        p.num_layers = 4;
        let def = ImageDef {
            vk_image_type: vk::ImageType::TYPE_2D,
            vk_format: vk::Format::R16G16B16A16_SFLOAT,
            vk_extent: vk::Extent3D {
                width: 64,
                height: 64,
                depth: 1,
            },
            num_mip_levels: 1,
            num_layers: 4,
            cube_compatible: false,
            vk_usage_flags: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            dedicated: false,
        };

        // One aggregate view plus one per layer
        let views = view_defs_from_params(&p, &def);
        assert_eq!(views.len(), 5);
        assert_eq!(views[0].subresource_range.layer_count, 4);
        assert_eq!(views[2].subresource_range.base_array_layer, 1);
        assert_eq!(views[2].subresource_range.layer_count, 1);
    }

    #[test]
    fn depth_target_views_use_depth_aspect() {
        let p = params(ImageUsageFlags::DEPTH_STENCIL_TARGET);
        let def = ImageDef {
            vk_image_type: vk::ImageType::TYPE_2D,
            vk_format: vk::Format::D32_SFLOAT,
            vk_extent: vk::Extent3D {
                width: 64,
                height: 64,
                depth: 1,
            },
            num_mip_levels: 1,
            num_layers: 1,
            cube_compatible: false,
            vk_usage_flags: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            dedicated: false,
        };
        let views = view_defs_from_params(&p, &def);
        assert_eq!(
            views[0].subresource_range.aspect_mask,
            vk::ImageAspectFlags::DEPTH
        );
    }
}
