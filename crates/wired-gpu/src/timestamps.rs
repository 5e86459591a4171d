//! Named GPU timestamp spans backed by a per-frame query pool.
//!
//! Each span reserves paired start/finish query slots. Results are pulled
//! down after the frame's fence sync, so no wait bit is needed on the query.

use std::sync::Arc;

use ash::vk;
use hashbrown::HashMap;
use tracing::error;

use crate::command::CommandBuffer;
use crate::context::DeviceContext;
use crate::error::Result;

/// Whether the submit queue family can record timestamp queries at all.
#[must_use]
pub fn queue_family_supports_timestamps(context: &DeviceContext) -> bool {
    if context.capabilities().timestamp_period == 0.0 {
        return false;
    }
    let properties = unsafe {
        context
            .instance()
            .get_physical_device_queue_family_properties(context.physical_device())
    };
    properties
        .get(context.queue_family() as usize)
        .is_some_and(|family| family.timestamp_valid_bits > 0)
}

#[derive(Debug, Clone, Copy)]
struct SpanSlots {
    index: u32,
    span: u32,
}

pub struct Timestamps {
    context: Arc<DeviceContext>,
    query_pool: vk::QueryPool,
    query_count: u32,
    timestamp_period: f32,
    initial_reset_done: bool,

    free_index: u32,
    spans: HashMap<String, SpanSlots>,
    raw_data: Vec<u64>,
}

impl Timestamps {
    /// A span needs a start and a finish slot, so the pool holds twice the
    /// configured span count.
    pub fn new(context: Arc<DeviceContext>, span_count: u32, tag: &str) -> Result<Self> {
        let query_count = span_count * 2;
        let create_info = vk::QueryPoolCreateInfo::default()
            .query_type(vk::QueryType::TIMESTAMP)
            .query_count(query_count);
        let query_pool = unsafe { context.device().create_query_pool(&create_info, None)? };
        context.set_object_name(query_pool, &format!("QueryPool-{tag}"));

        let timestamp_period = context.capabilities().timestamp_period;

        Ok(Self {
            context,
            query_pool,
            query_count,
            timestamp_period,
            initial_reset_done: false,
            free_index: 0,
            spans: HashMap::new(),
            raw_data: vec![0; query_count as usize],
        })
    }

    /// Pulls down results for every slot written so far. Callers must have
    /// fence-synced with the queries' command buffer first.
    pub fn sync_down(&mut self) {
        if !self.initial_reset_done || self.free_index == 0 {
            return;
        }
        let result = unsafe {
            self.context.device().get_query_pool_results(
                self.query_pool,
                0,
                &mut self.raw_data[..self.free_index as usize],
                vk::QueryResultFlags::TYPE_64,
            )
        };
        if let Err(e) = result {
            error!("failed to query timestamp results: {e}");
        }
    }

    /// Resets the pool at the head of a fresh recording and wipes the prior
    /// frame's span bookkeeping.
    pub fn reset_for_recording(&mut self, cmd: &CommandBuffer) {
        unsafe {
            self.context.device().cmd_reset_query_pool(
                cmd.vk_command_buffer(),
                self.query_pool,
                0,
                self.query_count,
            );
        }
        self.initial_reset_done = true;

        self.raw_data = vec![0; self.query_count as usize];
        self.free_index = 0;
        self.spans.clear();
    }

    pub fn write_start(&mut self, cmd: &CommandBuffer, name: &str, span: u32) {
        if self.free_index + span * 2 > self.query_count {
            error!(name, "ran out of timestamp slots");
            return;
        }

        unsafe {
            self.context.device().cmd_write_timestamp2(
                cmd.vk_command_buffer(),
                vk::PipelineStageFlags2::NONE,
                self.query_pool,
                self.free_index,
            );
        }

        self.spans.insert(
            name.to_string(),
            SpanSlots {
                index: self.free_index,
                span,
            },
        );
        self.free_index += span * 2;
    }

    pub fn write_finish(&mut self, cmd: &CommandBuffer, name: &str) {
        let Some(slots) = self.spans.get(name) else {
            error!(name, "no record of timestamp span");
            return;
        };

        unsafe {
            self.context.device().cmd_write_timestamp2(
                cmd.vk_command_buffer(),
                vk::PipelineStageFlags2::NONE,
                self.query_pool,
                slots.index + slots.span,
            );
        }
    }

    /// Milliseconds between a span's start and finish timestamps. `None` when
    /// the span never completed.
    #[must_use]
    pub fn diff_ms(&self, name: &str, offset: u32) -> Option<f32> {
        let slots = self.spans.get(name)?;
        if offset > slots.span {
            error!(name, "timestamp offset exceeds the span");
            return None;
        }

        let start = *self.raw_data.get((slots.index + offset) as usize)?;
        let finish = *self
            .raw_data
            .get((slots.index + slots.span + offset) as usize)?;

        // A bailed-out recording can leave a started span unfinished.
        if start == 0 || finish == 0 {
            return None;
        }

        #[allow(clippy::cast_precision_loss)]
        Some((finish - start) as f32 * (self.timestamp_period / 1_000_000.0))
    }

    pub fn destroy(&mut self) {
        unsafe {
            self.context.device().destroy_query_pool(self.query_pool, None);
        }
        self.query_pool = vk::QueryPool::null();
        self.initial_reset_done = false;
        self.free_index = 0;
        self.spans.clear();
        self.raw_data.clear();
    }
}
