//! Sampler pool with content deduplication.
//!
//! Samplers are immutable once created, so requests are deduplicated by a
//! content hash of their parameters. Requesting the same [`SamplerInfo`] twice
//! returns the same [`SamplerId`].

use std::hash::{Hash, Hasher};
use std::sync::Arc;

use ash::vk;
use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::context::DeviceContext;
use crate::error::Result;
use crate::ids::{Ids, SamplerId};
use crate::settings::{GpuSettings, SamplerAnisotropy};
use crate::types::{SamplerAddressMode, SamplerFilter, SamplerInfo, SamplerMipmapMode};
use crate::usage::Usages;

#[derive(Default)]
struct SamplersState {
    samplers: HashMap<SamplerId, vk::Sampler>,
    by_content: HashMap<u64, SamplerId>,
    marked_for_deletion: HashSet<SamplerId>,
}

pub struct Samplers {
    context: Arc<DeviceContext>,
    usages: Arc<Usages>,
    ids: Arc<Ids>,
    state: Mutex<SamplersState>,
}

impl Samplers {
    pub fn new(context: Arc<DeviceContext>, usages: Arc<Usages>, ids: Arc<Ids>) -> Self {
        Self {
            context,
            usages,
            ids,
            state: Mutex::new(SamplersState::default()),
        }
    }

    /// Returns an existing sampler with identical parameters, or creates one.
    pub fn get_or_create_sampler(
        &self,
        info: &SamplerInfo,
        settings: &GpuSettings,
        tag: &str,
    ) -> Result<SamplerId> {
        let key = content_key(info);

        let mut state = self.state.lock();
        if let Some(id) = state.by_content.get(&key) {
            if !state.marked_for_deletion.contains(id) {
                return Ok(*id);
            }
        }

        let create_info = self.sampler_create_info(info, settings);
        let sampler = unsafe { self.context.device().create_sampler(&create_info, None)? };
        self.context
            .set_object_name(sampler, &format!("Sampler-{tag}"));

        let id = SamplerId(self.ids.sampler_ids.acquire());
        debug!(id = id.0, tag, "created sampler");

        state.samplers.insert(id, sampler);
        state.by_content.insert(key, id);
        Ok(id)
    }

    #[must_use]
    pub fn get_sampler(&self, id: SamplerId) -> Option<vk::Sampler> {
        let state = self.state.lock();
        if state.marked_for_deletion.contains(&id) {
            warn!(id = id.0, "lookup of sampler marked for deletion");
            return None;
        }
        state.samplers.get(&id).copied()
    }

    pub fn destroy_sampler(&self, id: SamplerId, immediately: bool) {
        let mut state = self.state.lock();
        if !state.samplers.contains_key(&id) {
            warn!(id = id.0, "destroy requested for unknown sampler");
            return;
        }
        if immediately {
            self.destroy_sampler_locked(&mut state, id);
        } else {
            state.marked_for_deletion.insert(id);
        }
    }

    /// Frees marked samplers no command buffer or cached descriptor set still
    /// references.
    pub fn run_cleanup(&self) {
        let mut state = self.state.lock();
        let ready: Vec<SamplerId> = state
            .marked_for_deletion
            .iter()
            .filter(|id| {
                state.samplers.get(*id).is_none_or(|sampler| {
                    self.usages.samplers.gpu_usage_count(sampler) == 0
                        && self.usages.samplers.lock_count(sampler) == 0
                })
            })
            .copied()
            .collect();
        for id in ready {
            self.destroy_sampler_locked(&mut state, id);
        }
    }

    /// Frees every sampler unconditionally. Only valid after device idle.
    pub fn destroy_all(&self) {
        let mut state = self.state.lock();
        let ids: Vec<SamplerId> = state.samplers.keys().copied().collect();
        for id in ids {
            self.destroy_sampler_locked(&mut state, id);
        }
    }

    fn destroy_sampler_locked(&self, state: &mut SamplersState, id: SamplerId) {
        if let Some(sampler) = state.samplers.remove(&id) {
            unsafe {
                self.context.device().destroy_sampler(sampler, None);
            }
            self.ids.sampler_ids.release(id.0);
        }
        state.by_content.retain(|_, cached| *cached != id);
        state.marked_for_deletion.remove(&id);
    }

    fn sampler_create_info(
        &self,
        info: &SamplerInfo,
        settings: &GpuSettings,
    ) -> vk::SamplerCreateInfo<'static> {
        let capabilities = self.context.capabilities();

        let mut create_info = vk::SamplerCreateInfo::default()
            .mag_filter(vk_filter(info.mag_filter))
            .min_filter(vk_filter(info.min_filter))
            .mipmap_mode(vk_mipmap_mode(info.mipmap_mode))
            .address_mode_u(vk_address_mode(info.address_mode_u))
            .address_mode_v(vk_address_mode(info.address_mode_v))
            .address_mode_w(vk_address_mode(info.address_mode_w))
            .compare_enable(false)
            .compare_op(vk::CompareOp::ALWAYS)
            .mip_lod_bias(info.mip_lod_bias.unwrap_or(0.0))
            .min_lod(info.min_lod.unwrap_or(0.0))
            .max_lod(info.max_lod.unwrap_or(vk::LOD_CLAMP_NONE));

        // Anisotropy requires device support on top of the caller's request
        if info.anisotropy_enable && capabilities.max_sampler_anisotropy > 1.0 {
            let max_anisotropy = match settings.sampler_anisotropy {
                SamplerAnisotropy::None => 1.0,
                SamplerAnisotropy::Low => 2.0_f32.min(capabilities.max_sampler_anisotropy),
                SamplerAnisotropy::Maximum => capabilities.max_sampler_anisotropy,
            };
            create_info = create_info
                .anisotropy_enable(true)
                .max_anisotropy(max_anisotropy);
        }

        create_info
    }
}

impl Drop for Samplers {
    fn drop(&mut self) {
        self.destroy_all();
    }
}

/// Content hash covering every field of [`SamplerInfo`]. Optional LOD values
/// hash by exact bit pattern.
fn content_key(info: &SamplerInfo) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    (info.mag_filter as u32).hash(&mut hasher);
    (info.min_filter as u32).hash(&mut hasher);
    (info.mipmap_mode as u32).hash(&mut hasher);
    (info.address_mode_u as u32).hash(&mut hasher);
    (info.address_mode_v as u32).hash(&mut hasher);
    (info.address_mode_w as u32).hash(&mut hasher);
    info.anisotropy_enable.hash(&mut hasher);
    info.mip_lod_bias.map(f32::to_bits).hash(&mut hasher);
    info.min_lod.map(f32::to_bits).hash(&mut hasher);
    info.max_lod.map(f32::to_bits).hash(&mut hasher);
    hasher.finish()
}

fn vk_filter(filter: SamplerFilter) -> vk::Filter {
    match filter {
        SamplerFilter::Nearest => vk::Filter::NEAREST,
        SamplerFilter::Linear => vk::Filter::LINEAR,
    }
}

fn vk_mipmap_mode(mode: SamplerMipmapMode) -> vk::SamplerMipmapMode {
    match mode {
        SamplerMipmapMode::Nearest => vk::SamplerMipmapMode::NEAREST,
        SamplerMipmapMode::Linear => vk::SamplerMipmapMode::LINEAR,
    }
}

fn vk_address_mode(mode: SamplerAddressMode) -> vk::SamplerAddressMode {
    match mode {
        SamplerAddressMode::Clamp => vk::SamplerAddressMode::CLAMP_TO_EDGE,
        SamplerAddressMode::Repeat => vk::SamplerAddressMode::REPEAT,
        SamplerAddressMode::Mirrored => vk::SamplerAddressMode::MIRRORED_REPEAT,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_params_share_a_key() {
        let a = SamplerInfo::default();
        let b = SamplerInfo::default();
        assert_eq!(content_key(&a), content_key(&b));
    }

    #[test]
    fn every_field_changes_the_key() {
        let base = SamplerInfo::default();
        let variants = [
            SamplerInfo {
                mag_filter: SamplerFilter::Nearest,
                ..base
            },
            SamplerInfo {
                address_mode_w: SamplerAddressMode::Mirrored,
                ..base
            },
            SamplerInfo {
                anisotropy_enable: true,
                ..base
            },
            SamplerInfo {
                min_lod: Some(0.0),
                ..base
            },
            SamplerInfo {
                max_lod: Some(4.0),
                ..base
            },
        ];
        for variant in variants {
            assert_ne!(content_key(&base), content_key(&variant));
        }
    }

    #[test]
    fn absent_and_zero_lod_are_distinct() {
        let absent = SamplerInfo::default();
        let zero = SamplerInfo {
            mip_lod_bias: Some(0.0),
            ..absent
        };
        assert_ne!(content_key(&absent), content_key(&zero));
    }
}
