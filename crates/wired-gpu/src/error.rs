//! GPU error types.

use ash::vk;
use thiserror::Error;

/// GPU-related errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// No suitable GPU found.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// Required extension not supported.
    #[error("Required extension not supported: {0}")]
    ExtensionNotSupported(String),

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Surface creation failed.
    #[error("Surface creation failed: {0}")]
    SurfaceCreation(String),

    /// Swapchain creation failed.
    #[error("Swapchain creation failed: {0}")]
    SwapchainCreation(String),

    /// Shader module creation failed.
    #[error("Shader creation failed: {0}")]
    ShaderCreation(String),

    /// Pipeline creation failed.
    #[error("Pipeline creation failed: {0}")]
    PipelineCreation(String),

    /// Resource not found for an ID (stale, never created, or marked for deletion).
    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    /// Invalid state for the requested operation.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Resource validation failure (bad parameters).
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    /// Presentation failed.
    #[error("Presentation failed: {0}")]
    Surface(#[from] SurfaceError),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;

/// Errors specific to the presentation surface.
///
/// Distinguishes a temporarily invalidated surface (recoverable by recreating
/// the swapchain) from a permanently lost one (requires re-acquiring the
/// surface from the windowing layer).
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceError {
    /// The surface is out of date or suboptimal; recreate the swapchain.
    #[error("surface invalidated")]
    Invalidated,

    /// The surface has been lost; re-acquire it from the windowing layer.
    #[error("surface lost")]
    Lost,

    /// Any other presentation failure.
    #[error("surface error")]
    Other,
}
