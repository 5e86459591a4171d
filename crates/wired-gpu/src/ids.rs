//! Typed resource identifiers and per-type free-list ID sources.
//!
//! Every externally visible resource is named by an opaque integer ID drawn
//! from a per-type [`IdSource`]. An ID is returned to its source only once the
//! resource is fully destroyed, so an ID is never re-issued while any
//! reference to the old resource remains outstanding.

use parking_lot::Mutex;

macro_rules! resource_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

resource_id!(
    /// Identifies a logical buffer.
    BufferId
);
resource_id!(
    /// Identifies a logical image.
    ImageId
);
resource_id!(
    /// Identifies a sampler.
    SamplerId
);
resource_id!(
    /// Identifies a pipeline.
    PipelineId
);
resource_id!(
    /// Identifies a live command buffer.
    CommandBufferId
);

/// A free-list source of integer IDs.
///
/// IDs start at 1 and are handed out in ascending order; released IDs are
/// recycled before new ones are minted.
#[derive(Debug, Default)]
pub struct IdSource {
    state: Mutex<IdSourceState>,
}

#[derive(Debug)]
struct IdSourceState {
    next: u64,
    free: Vec<u64>,
}

impl Default for IdSourceState {
    fn default() -> Self {
        Self {
            next: 1,
            free: Vec::new(),
        }
    }
}

impl IdSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires an ID, recycling a released one when available.
    pub fn acquire(&self) -> u64 {
        let mut state = self.state.lock();
        if let Some(id) = state.free.pop() {
            return id;
        }
        let id = state.next;
        state.next += 1;
        id
    }

    /// Returns an ID to the free list for future reuse.
    pub fn release(&self, id: u64) {
        let mut state = self.state.lock();
        debug_assert!(id < state.next, "released id was never acquired");
        state.free.push(id);
    }
}

/// The ID sources for every resource type.
#[derive(Debug, Default)]
pub struct Ids {
    pub buffer_ids: IdSource,
    pub image_ids: IdSource,
    pub sampler_ids: IdSource,
    pub pipeline_ids: IdSource,
    pub command_buffer_ids: IdSource,
}

impl Ids {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_ascend_from_one() {
        let source = IdSource::new();
        assert_eq!(source.acquire(), 1);
        assert_eq!(source.acquire(), 2);
        assert_eq!(source.acquire(), 3);
    }

    #[test]
    fn released_ids_are_recycled() {
        let source = IdSource::new();
        let a = source.acquire();
        let b = source.acquire();
        source.release(a);
        assert_eq!(source.acquire(), a);
        // b was never released, so a fresh id is minted next
        assert_eq!(source.acquire(), b + 1);
    }

    #[test]
    fn unreleased_ids_are_never_reissued() {
        let source = IdSource::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..100 {
            assert!(seen.insert(source.acquire()));
        }
    }
}
