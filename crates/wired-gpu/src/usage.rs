//! Reference counting for in-flight GPU resources.
//!
//! Every native handle carries two independent counters: GPU usage (the handle
//! is referenced by recorded-but-unretired command buffer work) and locks (a
//! CPU-side cache such as a cached descriptor set still references it). A
//! resource may only be physically destroyed once both counters are zero for
//! every physical instance it owns.

use crate::ids::CommandBufferId;
use ash::vk;
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::hash::Hash;

#[derive(Debug, Default, Clone, Copy)]
struct Counts {
    gpu_usages: u64,
    locks: u64,
}

/// Thread-safe dual reference counter keyed by a native handle.
#[derive(Debug)]
pub struct UsageTracker<K: Eq + Hash + Clone> {
    counts: Mutex<HashMap<K, Counts>>,
}

impl<K: Eq + Hash + Clone> Default for UsageTracker<K> {
    fn default() -> Self {
        Self {
            counts: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone> UsageTracker<K> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_gpu_usage(&self, key: &K) {
        let mut counts = self.counts.lock();
        counts.entry(key.clone()).or_default().gpu_usages += 1;
    }

    pub fn decrement_gpu_usage(&self, key: &K) {
        let mut counts = self.counts.lock();
        let entry = counts.entry(key.clone()).or_default();
        debug_assert!(entry.gpu_usages > 0, "gpu usage count double-decrement");
        entry.gpu_usages = entry.gpu_usages.saturating_sub(1);
    }

    pub fn increment_lock(&self, key: &K) {
        let mut counts = self.counts.lock();
        counts.entry(key.clone()).or_default().locks += 1;
    }

    pub fn decrement_lock(&self, key: &K) {
        let mut counts = self.counts.lock();
        let entry = counts.entry(key.clone()).or_default();
        debug_assert!(entry.locks > 0, "lock count double-decrement");
        entry.locks = entry.locks.saturating_sub(1);
    }

    /// GPU usage count for a handle; zero when the handle was never tracked.
    #[must_use]
    pub fn gpu_usage_count(&self, key: &K) -> u64 {
        self.counts.lock().get(key).map_or(0, |c| c.gpu_usages)
    }

    /// Lock count for a handle; zero when the handle was never tracked.
    #[must_use]
    pub fn lock_count(&self, key: &K) -> u64 {
        self.counts.lock().get(key).map_or(0, |c| c.locks)
    }

    /// Drops map entries whose counts are both zero, bounding memory use.
    pub fn forget_zero_count_entries(&self) {
        self.counts
            .lock()
            .retain(|_, c| c.gpu_usages != 0 || c.locks != 0);
    }

    /// Clears all state. Only valid at full shutdown.
    pub fn reset(&self) {
        self.counts.lock().clear();
    }
}

/// Usage trackers for every tracked resource kind.
#[derive(Debug, Default)]
pub struct Usages {
    pub buffers: UsageTracker<vk::Buffer>,
    pub images: UsageTracker<vk::Image>,
    pub image_views: UsageTracker<vk::ImageView>,
    pub samplers: UsageTracker<vk::Sampler>,
    pub pipelines: UsageTracker<vk::Pipeline>,
    /// Keyed by module handle; 1:1 with a registered shader name until freed.
    pub shaders: UsageTracker<vk::ShaderModule>,
    pub descriptor_sets: UsageTracker<vk::DescriptorSet>,
    pub command_buffers: UsageTracker<CommandBufferId>,
}

impl Usages {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Garbage-collects zero-count entries across all trackers.
    pub fn forget_zero_count_entries(&self) {
        self.buffers.forget_zero_count_entries();
        self.images.forget_zero_count_entries();
        self.image_views.forget_zero_count_entries();
        self.samplers.forget_zero_count_entries();
        self.pipelines.forget_zero_count_entries();
        self.shaders.forget_zero_count_entries();
        self.descriptor_sets.forget_zero_count_entries();
        self.command_buffers.forget_zero_count_entries();
    }

    /// Clears all trackers at shutdown.
    pub fn reset(&self) {
        self.buffers.reset();
        self.images.reset();
        self.image_views.reset();
        self.samplers.reset();
        self.pipelines.reset();
        self.shaders.reset();
        self.descriptor_sets.reset();
        self.command_buffers.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_track_independently() {
        let tracker: UsageTracker<u32> = UsageTracker::new();
        tracker.increment_gpu_usage(&7);
        tracker.increment_gpu_usage(&7);
        tracker.increment_lock(&7);

        assert_eq!(tracker.gpu_usage_count(&7), 2);
        assert_eq!(tracker.lock_count(&7), 1);

        tracker.decrement_gpu_usage(&7);
        assert_eq!(tracker.gpu_usage_count(&7), 1);
        assert_eq!(tracker.lock_count(&7), 1);
    }

    #[test]
    fn untracked_handles_report_zero() {
        let tracker: UsageTracker<u32> = UsageTracker::new();
        assert_eq!(tracker.gpu_usage_count(&1), 0);
        assert_eq!(tracker.lock_count(&1), 0);
    }

    #[test]
    fn balanced_sequences_stay_non_negative() {
        let tracker: UsageTracker<u32> = UsageTracker::new();
        for _ in 0..50 {
            tracker.increment_gpu_usage(&3);
        }
        for _ in 0..50 {
            tracker.decrement_gpu_usage(&3);
        }
        assert_eq!(tracker.gpu_usage_count(&3), 0);
    }

    #[test]
    fn forget_drops_only_zero_entries() {
        let tracker: UsageTracker<u32> = UsageTracker::new();
        tracker.increment_gpu_usage(&1);
        tracker.increment_gpu_usage(&2);
        tracker.decrement_gpu_usage(&2);
        tracker.increment_lock(&3);

        tracker.forget_zero_count_entries();

        assert_eq!(tracker.gpu_usage_count(&1), 1);
        assert_eq!(tracker.lock_count(&3), 1);
        // entry 2 is gone, which is indistinguishable from zero counts
        assert_eq!(tracker.gpu_usage_count(&2), 0);
    }

    #[test]
    fn locked_entries_survive_forget_with_zero_gpu_usage() {
        let tracker: UsageTracker<u32> = UsageTracker::new();
        tracker.increment_lock(&9);
        tracker.forget_zero_count_entries();
        assert_eq!(tracker.lock_count(&9), 1);
    }
}
