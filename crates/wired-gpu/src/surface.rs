//! Surface management for windowed rendering.
//!
//! Hides the raw-window-handle plumbing behind a small context that
//! owns the surface and the extension loaders.

use crate::context::DeviceContext;
use crate::error::{GpuError, Result};
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

/// Surface context for windowed rendering.
pub struct SurfaceContext {
    /// The Vulkan surface handle.
    pub surface: vk::SurfaceKHR,
    /// Surface extension loader.
    pub surface_loader: ash::khr::surface::Instance,
    /// Swapchain extension loader.
    pub swapchain_loader: ash::khr::swapchain::Device,
    /// The Vulkan entry point (kept alive for surface_loader lifetime).
    #[allow(dead_code)]
    entry: ash::Entry,
}

impl SurfaceContext {
    /// Create a new surface context from a window.
    ///
    /// # Safety
    /// The device context must be valid and the window must have valid handles.
    pub unsafe fn from_window<W>(context: &DeviceContext, window: &W) -> Result<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let entry = ash::Entry::load()
            .map_err(|e| GpuError::Other(format!("Failed to load Vulkan entry: {e}")))?;

        let display = window
            .display_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get display handle: {e}")))?;
        let window_handle = window
            .window_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get window handle: {e}")))?;

        let surface = ash_window::create_surface(
            &entry,
            context.instance(),
            display.as_raw(),
            window_handle.as_raw(),
            None,
        )
        .map_err(|e| GpuError::SurfaceCreation(e.to_string()))?;

        let surface_loader = ash::khr::surface::Instance::new(&entry, context.instance());
        let swapchain_loader =
            ash::khr::swapchain::Device::new(context.instance(), context.device());

        Ok(Self {
            surface,
            surface_loader,
            swapchain_loader,
            entry,
        })
    }

    /// Query surface capabilities, formats, and present modes.
    pub fn capabilities(&self, context: &DeviceContext) -> Result<SurfaceCapabilities> {
        unsafe {
            let caps = self.surface_loader.get_physical_device_surface_capabilities(
                context.physical_device(),
                self.surface,
            )?;

            let formats = self
                .surface_loader
                .get_physical_device_surface_formats(context.physical_device(), self.surface)?;

            let present_modes = self.surface_loader.get_physical_device_surface_present_modes(
                context.physical_device(),
                self.surface,
            )?;

            Ok(SurfaceCapabilities {
                capabilities: caps,
                formats,
                present_modes,
            })
        }
    }

    /// Check that the device queue can present to this surface.
    pub fn supports_present(&self, context: &DeviceContext) -> Result<bool> {
        unsafe {
            Ok(self.surface_loader.get_physical_device_surface_support(
                context.physical_device(),
                context.queue_family(),
                self.surface,
            )?)
        }
    }

    /// Destroy the surface.
    ///
    /// # Safety
    /// The surface must not be in use.
    pub unsafe fn destroy(&self) {
        self.surface_loader.destroy_surface(self.surface, None);
    }
}

/// Surface capabilities query result.
pub struct SurfaceCapabilities {
    /// Raw surface capabilities.
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    /// Supported surface formats.
    pub formats: Vec<vk::SurfaceFormatKHR>,
    /// Supported present modes.
    pub present_modes: Vec<vk::PresentModeKHR>,
}
