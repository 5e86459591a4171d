//! Runtime GPU settings.

/// Presentation mode requested for the swapchain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PresentMode {
    #[default]
    Immediate,
    Mailbox,
    Fifo,
    FifoRelaxed,
}

/// Sampler anisotropy level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SamplerAnisotropy {
    None,
    Low,
    #[default]
    Maximum,
}

/// Runtime-adjustable GPU settings.
///
/// Applied at startup and via [`crate::Gpu::on_settings_changed`]. Changing
/// `frames_in_flight` recreates the frame pool; changing `present_mode`
/// recreates the swapchain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuSettings {
    pub present_mode: PresentMode,
    pub frames_in_flight: u32,
    pub sampler_anisotropy: SamplerAnisotropy,
    /// Number of named GPU timestamp spans per frame. Zero disables timestamps.
    pub timestamp_count: u32,
}

impl Default for GpuSettings {
    fn default() -> Self {
        Self {
            present_mode: PresentMode::Immediate,
            frames_in_flight: 2,
            sampler_anisotropy: SamplerAnisotropy::Maximum,
            timestamp_count: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let settings = GpuSettings::default();
        assert_eq!(settings.frames_in_flight, 2);
        assert_eq!(settings.present_mode, PresentMode::Immediate);
        assert_eq!(settings.timestamp_count, 0);
    }
}
