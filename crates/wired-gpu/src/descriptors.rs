//! Descriptor pool growth and content-addressed descriptor set reuse.
//!
//! Each recording thread owns a [`DescriptorSets`] instance. Sets are keyed
//! by their layout plus the exact resources bound into them, so a repeated
//! request returns the already-written set without touching the device.
//! Sets that go unused across enough cleanup flows drop their resource locks
//! and move to a per-layout free list for rebinding later.

use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use ash::vk;
use ash::vk::Handle;
use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::context::DeviceContext;
use crate::error::Result;
use crate::layouts::DescriptorSetLayout;
use crate::pass_state::SetBindings;
use crate::usage::Usages;

/// Cleanup flows a set can sit unused before it is unbound and cached.
const CLEANUPS_BEFORE_CACHING: u32 = 10;

/// What one cleanup flow decides for a single active set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CleanupStep {
    Keep,
    Cache,
}

/// Advances a set's unused-cleanup counter. In-use sets reset to zero. Idle
/// cleanup flows leave the counter untouched and never cache, so a
/// backgrounded app keeps its working set.
fn advance_cleanup_counter(
    cleanups_without_use: &mut u32,
    in_use: bool,
    is_idle_cleanup: bool,
) -> CleanupStep {
    if is_idle_cleanup {
        return CleanupStep::Keep;
    }
    if in_use {
        *cleanups_without_use = 0;
        return CleanupStep::Keep;
    }
    *cleanups_without_use += 1;
    if *cleanups_without_use >= CLEANUPS_BEFORE_CACHING {
        CleanupStep::Cache
    } else {
        CleanupStep::Keep
    }
}

/// An allocated, written descriptor set together with what is bound in it.
#[derive(Clone)]
pub struct DescriptorSet {
    pub vk_set: vk::DescriptorSet,
    pub bindings: SetBindings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolState {
    /// Allocation attempts should still be made against this pool.
    Untapped,
    /// A previous allocation from this pool ran out of pool memory.
    Tapped,
    /// A previous allocation from this pool failed with fragmentation.
    Fragmented,
}

struct DescriptorPool {
    vk_pool: vk::DescriptorPool,
    state: PoolState,
}

/// Grows descriptor pools on demand and routes allocations to whichever pool
/// still has room. Freeing a set returns its pool to the untapped state.
struct DescriptorPools {
    context: Arc<DeviceContext>,
    pools: HashMap<u64, DescriptorPool>,
    set_to_pool: HashMap<u64, vk::DescriptorPool>,
    active_pool: Option<vk::DescriptorPool>,
}

impl DescriptorPools {
    fn new(context: Arc<DeviceContext>) -> Self {
        Self {
            context,
            pools: HashMap::new(),
            set_to_pool: HashMap::new(),
            active_pool: None,
        }
    }

    fn allocate_descriptor_set(
        &mut self,
        layout: &DescriptorSetLayout,
        tag: &str,
    ) -> Result<vk::DescriptorSet> {
        if let Some(active) = self.active_pool {
            if let Ok(vk_set) = self.try_allocate(active, layout, tag) {
                return Ok(vk_set);
            }
        }

        let candidates: Vec<vk::DescriptorPool> = self
            .pools
            .values()
            .filter(|pool| {
                pool.state == PoolState::Untapped && Some(pool.vk_pool) != self.active_pool
            })
            .map(|pool| pool.vk_pool)
            .collect();
        for vk_pool in candidates {
            if let Ok(vk_set) = self.try_allocate(vk_pool, layout, tag) {
                self.active_pool = Some(vk_pool);
                return Ok(vk_set);
            }
        }

        // Every existing pool is exhausted, grow by one.
        let vk_pool = self.create_pool(tag)?;
        self.pools.insert(
            vk_pool.as_raw(),
            DescriptorPool {
                vk_pool,
                state: PoolState::Untapped,
            },
        );

        let vk_set = self.try_allocate(vk_pool, layout, tag)?;
        self.active_pool = Some(vk_pool);
        Ok(vk_set)
    }

    fn try_allocate(
        &mut self,
        vk_pool: vk::DescriptorPool,
        layout: &DescriptorSetLayout,
        tag: &str,
    ) -> Result<vk::DescriptorSet> {
        let layouts = [layout.layout];
        let allocate_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(vk_pool)
            .set_layouts(&layouts);

        let allocated = unsafe { self.context.device().allocate_descriptor_sets(&allocate_info) };
        match allocated {
            Ok(sets) => {
                let vk_set = sets[0];
                self.context
                    .set_object_name(vk_set, &format!("DescriptorSet-{tag}"));
                self.set_to_pool.insert(vk_set.as_raw(), vk_pool);
                Ok(vk_set)
            }
            Err(e) => {
                if let Some(pool) = self.pools.get_mut(&vk_pool.as_raw()) {
                    match e {
                        vk::Result::ERROR_OUT_OF_POOL_MEMORY => pool.state = PoolState::Tapped,
                        vk::Result::ERROR_FRAGMENTED_POOL => pool.state = PoolState::Fragmented,
                        _ => {}
                    }
                }
                Err(e.into())
            }
        }
    }

    fn create_pool(&self, tag: &str) -> Result<vk::DescriptorPool> {
        let pool_sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: 1000,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
                descriptor_count: 10,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: 1000,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                descriptor_count: 1000,
            },
        ];
        let create_info = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(1000)
            .pool_sizes(&pool_sizes);

        let vk_pool = unsafe { self.context.device().create_descriptor_pool(&create_info, None)? };
        self.context
            .set_object_name(vk_pool, &format!("DescriptorPool-{tag}"));
        Ok(vk_pool)
    }

    fn free_descriptor_set(&mut self, vk_set: vk::DescriptorSet) {
        let Some(vk_pool) = self.set_to_pool.remove(&vk_set.as_raw()) else {
            warn!("no pool mapping for freed descriptor set");
            return;
        };
        unsafe {
            let _ = self.context.device().free_descriptor_sets(vk_pool, &[vk_set]);
        }
        // A freed set makes the pool worth trying again.
        if let Some(pool) = self.pools.get_mut(&vk_pool.as_raw()) {
            pool.state = PoolState::Untapped;
        }
    }

    fn destroy(&mut self) {
        for pool in self.pools.values() {
            unsafe {
                self.context.device().destroy_descriptor_pool(pool.vk_pool, None);
            }
        }
        self.pools.clear();
        self.set_to_pool.clear();
        self.active_pool = None;
    }
}

struct ActiveSet {
    cleanups_without_use: u32,
    vk_layout: vk::DescriptorSetLayout,
    vk_set: vk::DescriptorSet,
    bindings: SetBindings,
}

struct DescriptorSetsState {
    pools: DescriptorPools,
    active: HashMap<u64, ActiveSet>,
    cached: HashMap<u64, (vk::DescriptorSetLayout, VecDeque<vk::DescriptorSet>)>,
}

pub struct DescriptorSets {
    context: Arc<DeviceContext>,
    usages: Arc<Usages>,
    tag: String,
    state: Mutex<DescriptorSetsState>,
}

impl DescriptorSets {
    pub fn new(context: Arc<DeviceContext>, usages: Arc<Usages>, tag: String) -> Self {
        let pools = DescriptorPools::new(Arc::clone(&context));
        Self {
            context,
            usages,
            tag,
            state: Mutex::new(DescriptorSetsState {
                pools,
                active: HashMap::new(),
                cached: HashMap::new(),
            }),
        }
    }

    /// Returns a descriptor set with exactly these bindings, reusing an
    /// already-written one when the same request was served before.
    pub fn get_descriptor_set(
        &self,
        layout: &DescriptorSetLayout,
        bindings: &SetBindings,
        tag: &str,
    ) -> Result<DescriptorSet> {
        let request_hash = request_hash(layout.layout, bindings);

        let mut state = self.state.lock();

        if let Some(active) = state.active.get_mut(&request_hash) {
            active.cleanups_without_use = 0;
            return Ok(DescriptorSet {
                vk_set: active.vk_set,
                bindings: active.bindings.clone(),
            });
        }

        // Prefer recycling a cached set of this layout over a fresh
        // allocation.
        let recycled = state
            .cached
            .get_mut(&layout.layout.as_raw())
            .and_then(|(_, queue)| queue.pop_front());
        let vk_set = match recycled {
            Some(vk_set) => vk_set,
            None => state.pools.allocate_descriptor_set(layout, tag)?,
        };

        self.write_descriptor_set(vk_set, bindings);
        self.lock_bound_resources(bindings);

        state.active.insert(
            request_hash,
            ActiveSet {
                cleanups_without_use: 0,
                vk_layout: layout.layout,
                vk_set,
                bindings: bindings.clone(),
            },
        );

        Ok(DescriptorSet {
            vk_set,
            bindings: bindings.clone(),
        })
    }

    fn write_descriptor_set(&self, vk_set: vk::DescriptorSet, bindings: &SetBindings) {
        let mut buffer_infos = Vec::new();
        let mut image_infos = Vec::new();

        let mut buffer_bindings: Vec<_> = bindings.buffers.iter().collect();
        buffer_bindings.sort_by_key(|(binding, _)| **binding);
        for (_, bound) in &buffer_bindings {
            buffer_infos.push(vk::DescriptorBufferInfo {
                buffer: bound.instance.vk_buffer,
                offset: bound.byte_offset,
                range: if bound.byte_size == 0 {
                    vk::WHOLE_SIZE
                } else {
                    bound.byte_size
                },
            });
        }

        let mut image_view_bindings: Vec<_> = bindings.image_views.iter().collect();
        image_view_bindings.sort_by_key(|(binding, _)| **binding);
        for (_, bound) in &image_view_bindings {
            let vk_view = bound
                .instance
                .views
                .get(bound.view_index as usize)
                .map_or(vk::ImageView::null(), |view| view.vk_image_view);
            image_infos.push(vk::DescriptorImageInfo {
                sampler: vk::Sampler::null(),
                image_view: vk_view,
                image_layout: if bound.shader_writeable {
                    vk::ImageLayout::GENERAL
                } else {
                    vk::ImageLayout::READ_ONLY_OPTIMAL
                },
            });
        }

        let mut sampler_bindings: Vec<(u32, u32, &crate::pass_state::BoundImageViewSampler)> =
            Vec::new();
        for (binding, array) in &bindings.image_view_samplers {
            for (array_index, bound) in array {
                sampler_bindings.push((*binding, *array_index, bound));
            }
        }
        sampler_bindings.sort_by_key(|(binding, array_index, _)| (*binding, *array_index));
        for (_, _, bound) in &sampler_bindings {
            let vk_view = bound
                .instance
                .views
                .get(bound.view_index as usize)
                .map_or(vk::ImageView::null(), |view| view.vk_image_view);
            image_infos.push(vk::DescriptorImageInfo {
                sampler: bound.sampler,
                image_view: vk_view,
                image_layout: vk::ImageLayout::READ_ONLY_OPTIMAL,
            });
        }

        let mut writes = Vec::new();
        let mut buffer_info_index = 0;
        let mut image_info_index = 0;

        for (binding, bound) in &buffer_bindings {
            writes.push(
                vk::WriteDescriptorSet::default()
                    .dst_set(vk_set)
                    .dst_binding(**binding)
                    .dst_array_element(0)
                    .descriptor_type(bound.descriptor_type)
                    .buffer_info(&buffer_infos[buffer_info_index..=buffer_info_index]),
            );
            buffer_info_index += 1;
        }

        for (binding, _) in &image_view_bindings {
            writes.push(
                vk::WriteDescriptorSet::default()
                    .dst_set(vk_set)
                    .dst_binding(**binding)
                    .dst_array_element(0)
                    .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                    .image_info(&image_infos[image_info_index..=image_info_index]),
            );
            image_info_index += 1;
        }

        for (binding, array_index, _) in &sampler_bindings {
            writes.push(
                vk::WriteDescriptorSet::default()
                    .dst_set(vk_set)
                    .dst_binding(*binding)
                    .dst_array_element(*array_index)
                    .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                    .image_info(&image_infos[image_info_index..=image_info_index]),
            );
            image_info_index += 1;
        }

        unsafe {
            self.context.device().update_descriptor_sets(&writes, &[]);
        }
    }

    /// A set holds locks on everything bound in it so those resources can't
    /// be destroyed out from under it.
    fn lock_bound_resources(&self, bindings: &SetBindings) {
        for bound in bindings.buffers.values() {
            self.usages.buffers.increment_lock(&bound.instance.vk_buffer);
        }
        for bound in bindings.image_views.values() {
            self.usages.images.increment_lock(&bound.instance.vk_image);
            if let Some(view) = bound.instance.views.get(bound.view_index as usize) {
                self.usages.image_views.increment_lock(&view.vk_image_view);
            }
        }
        for array in bindings.image_view_samplers.values() {
            for bound in array.values() {
                self.usages.images.increment_lock(&bound.instance.vk_image);
                if let Some(view) = bound.instance.views.get(bound.view_index as usize) {
                    self.usages.image_views.increment_lock(&view.vk_image_view);
                }
            }
        }
    }

    fn unlock_bound_resources(&self, bindings: &SetBindings) {
        for bound in bindings.buffers.values() {
            self.usages.buffers.decrement_lock(&bound.instance.vk_buffer);
        }
        for bound in bindings.image_views.values() {
            self.usages.images.decrement_lock(&bound.instance.vk_image);
            if let Some(view) = bound.instance.views.get(bound.view_index as usize) {
                self.usages.image_views.decrement_lock(&view.vk_image_view);
            }
        }
        for array in bindings.image_view_samplers.values() {
            for bound in array.values() {
                self.usages.images.decrement_lock(&bound.instance.vk_image);
                if let Some(view) = bound.instance.views.get(bound.view_index as usize) {
                    self.usages.image_views.decrement_lock(&view.vk_image_view);
                }
            }
        }
    }

    /// Moves sets that went unused long enough to the cache. Idle flows skip
    /// the caching step so a backgrounded app doesn't have to rebind its
    /// whole working set when it resumes.
    pub fn run_cleanup(&self, is_idle_cleanup: bool) {
        let mut state = self.state.lock();

        let mut to_cache = Vec::new();
        for (hash, active) in &mut state.active {
            let in_use = self.usages.descriptor_sets.gpu_usage_count(&active.vk_set) > 0;
            let step = advance_cleanup_counter(
                &mut active.cleanups_without_use,
                in_use,
                is_idle_cleanup,
            );
            if step == CleanupStep::Cache {
                to_cache.push(*hash);
            }
        }

        for hash in to_cache {
            if let Some(active) = state.active.remove(&hash) {
                // A cached set will get fresh resources bound before its
                // next use, so it holds no locks while cached.
                self.unlock_bound_resources(&active.bindings);
                state
                    .cached
                    .entry(active.vk_layout.as_raw())
                    .or_insert_with(|| (active.vk_layout, VecDeque::new()))
                    .1
                    .push_back(active.vk_set);
            }
        }

        state.cached.retain(|_, (_, queue)| !queue.is_empty());
    }

    pub fn destroy(&self) {
        info!(tag = %self.tag, "destroying descriptor sets");
        let mut state = self.state.lock();
        let active = std::mem::take(&mut state.active);
        for set in active.values() {
            self.unlock_bound_resources(&set.bindings);
        }
        state.cached.clear();
        state.pools.destroy();
        debug!(count = active.len(), "released active descriptor sets");
    }
}

impl Drop for DescriptorSets {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Content address for a request: the layout plus every binding's identity
/// and range, hashed in sorted binding order.
fn request_hash(vk_layout: vk::DescriptorSetLayout, bindings: &SetBindings) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    vk_layout.as_raw().hash(&mut hasher);

    1_u32.hash(&mut hasher);
    let mut buffer_bindings: Vec<_> = bindings.buffers.iter().collect();
    buffer_bindings.sort_by_key(|(binding, _)| **binding);
    for (binding, bound) in buffer_bindings {
        binding.hash(&mut hasher);
        bound.instance.vk_buffer.as_raw().hash(&mut hasher);
        bound.byte_offset.hash(&mut hasher);
        bound.byte_size.hash(&mut hasher);
    }

    2_u32.hash(&mut hasher);
    let mut image_view_bindings: Vec<_> = bindings.image_views.iter().collect();
    image_view_bindings.sort_by_key(|(binding, _)| **binding);
    for (binding, bound) in image_view_bindings {
        binding.hash(&mut hasher);
        bound.instance.vk_image.as_raw().hash(&mut hasher);
        bound.view_index.hash(&mut hasher);
    }

    3_u32.hash(&mut hasher);
    let mut sampler_bindings: Vec<_> = Vec::new();
    for (binding, array) in &bindings.image_view_samplers {
        for (array_index, bound) in array {
            sampler_bindings.push((*binding, *array_index, bound));
        }
    }
    sampler_bindings.sort_by_key(|(binding, array_index, _)| (*binding, *array_index));
    for (binding, array_index, bound) in sampler_bindings {
        binding.hash(&mut hasher);
        array_index.hash(&mut hasher);
        bound.instance.vk_image.as_raw().hash(&mut hasher);
        bound.view_index.hash(&mut hasher);
        bound.sampler.as_raw().hash(&mut hasher);
    }

    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::barriers::BufferUsageMode;
    use crate::buffers::{BufferDef, BufferInstance};
    use crate::pass_state::BoundBuffer;
    use gpu_allocator::MemoryLocation;

    fn bound_buffer(raw: u64, byte_offset: u64) -> BoundBuffer {
        BoundBuffer {
            instance: BufferInstance {
                vk_buffer: vk::Buffer::from_raw(raw),
                def: BufferDef {
                    is_transfer_buffer: false,
                    default_usage_mode: BufferUsageMode::GraphicsUniformRead,
                    byte_size: 256,
                    vk_usage_flags: vk::BufferUsageFlags::UNIFORM_BUFFER,
                    location: MemoryLocation::CpuToGpu,
                    host_visible: true,
                    dedicated: false,
                },
            },
            descriptor_type: vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
            shader_writeable: false,
            byte_offset,
            byte_size: 64,
            dynamic_byte_offset: None,
        }
    }

    #[test]
    fn identical_requests_share_a_hash() {
        let mut a = SetBindings::default();
        a.buffers.insert(0, bound_buffer(7, 0));
        a.buffers.insert(1, bound_buffer(8, 128));

        let mut b = SetBindings::default();
        b.buffers.insert(1, bound_buffer(8, 128));
        b.buffers.insert(0, bound_buffer(7, 0));

        let layout = vk::DescriptorSetLayout::from_raw(3);
        assert_eq!(request_hash(layout, &a), request_hash(layout, &b));
    }

    #[test]
    fn differing_offsets_hash_apart() {
        let mut a = SetBindings::default();
        a.buffers.insert(0, bound_buffer(7, 0));

        let mut b = SetBindings::default();
        b.buffers.insert(0, bound_buffer(7, 64));

        let layout = vk::DescriptorSetLayout::from_raw(3);
        assert_ne!(request_hash(layout, &a), request_hash(layout, &b));
    }

    #[test]
    fn layout_participates_in_the_hash() {
        let mut bindings = SetBindings::default();
        bindings.buffers.insert(0, bound_buffer(7, 0));

        assert_ne!(
            request_hash(vk::DescriptorSetLayout::from_raw(3), &bindings),
            request_hash(vk::DescriptorSetLayout::from_raw(4), &bindings),
        );
    }

    #[test]
    fn unused_set_caches_on_the_tenth_cleanup() {
        let mut counter = 0;
        for _ in 0..CLEANUPS_BEFORE_CACHING - 1 {
            assert_eq!(
                advance_cleanup_counter(&mut counter, false, false),
                CleanupStep::Keep,
            );
        }
        assert_eq!(
            advance_cleanup_counter(&mut counter, false, false),
            CleanupStep::Cache,
        );
        assert_eq!(counter, CLEANUPS_BEFORE_CACHING);
    }

    #[test]
    fn use_resets_the_cleanup_counter() {
        let mut counter = CLEANUPS_BEFORE_CACHING - 1;
        assert_eq!(
            advance_cleanup_counter(&mut counter, true, false),
            CleanupStep::Keep,
        );
        assert_eq!(counter, 0);
    }

    #[test]
    fn idle_cleanup_neither_counts_nor_caches() {
        let mut counter = CLEANUPS_BEFORE_CACHING - 1;
        for _ in 0..20 {
            assert_eq!(
                advance_cleanup_counter(&mut counter, false, true),
                CleanupStep::Keep,
            );
        }
        assert_eq!(counter, CLEANUPS_BEFORE_CACHING - 1);
    }
}
