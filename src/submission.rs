//! Queue submissions and their resolved data.

use ash::vk;
use std::sync::Arc;
use vkprof_commands::snapshot::CommandBufferSnapshot;

/// The command buffers of one queue submission call, grouped by the submit
/// infos they were given in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubmitBatch {
    pub queue: vk::Queue,
    pub submits: Vec<Vec<vk::CommandBuffer>>,
}

/// Snapshots of the command buffers of one submit info, in submission order.
#[derive(Clone, Debug, Default)]
pub struct SubmitData {
    pub command_buffers: Vec<Arc<CommandBufferSnapshot>>,
}

/// Resolved data of a [`SubmitBatch`].
#[derive(Clone, Debug)]
pub struct SubmitBatchData {
    pub queue: vk::Queue,
    pub submits: Vec<SubmitData>,
}

impl SubmitBatch {
    pub fn new(queue: vk::Queue) -> Self {
        Self {
            queue,
            submits: Vec::new(),
        }
    }

    /// Returns all command buffers of the batch in submission order.
    pub fn command_buffers(&self) -> impl Iterator<Item = vk::CommandBuffer> + '_ {
        self.submits.iter().flatten().copied()
    }
}

impl SubmitBatchData {
    /// Returns the snapshots of all command buffers of the batch in
    /// submission order.
    pub fn snapshots(&self) -> impl Iterator<Item = &Arc<CommandBufferSnapshot>> + '_ {
        self.submits
            .iter()
            .flat_map(|submit| submit.command_buffers.iter())
    }

    /// Returns the span between the first and last timestamp of the batch,
    /// or [`None`] if none of its command buffers were timed.
    pub fn ticks(&self) -> Option<(u64, u64)> {
        let mut begin = 0;
        let mut end = 0;
        for timestamps in self.snapshots().filter_map(|snapshot| snapshot.timestamps()) {
            if begin == 0 {
                begin = timestamps.begin;
            }
            end = end.max(timestamps.end);
        }
        (begin != 0 || end != 0).then_some((begin, end))
    }
}
