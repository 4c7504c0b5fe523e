//! Device-level registry of profiled command buffers.

use crate::{
    HashMap,
    command_buffer::ProfilerCommandBuffer,
    config::ProfilerConfig,
    submission::{SubmitBatch, SubmitBatchData, SubmitData},
};
use ash::vk;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use vkprof_commands::{
    command::Command, resolve::SecondarySnapshots, snapshot::CommandBufferSnapshot,
};
use vkprof_gpu::{
    device::DeviceDispatch,
    query_data::{QueryDataBuffer, QueryDataBufferError},
};

/// Profiler for the command buffers of one logical device.
///
/// Keeps a [`ProfilerCommandBuffer`] for every command buffer allocated
/// through the device and routes recording calls, submissions and data
/// requests to them. Command buffers may be recorded concurrently from
/// different threads, since each one is behind its own lock.
#[derive(Debug)]
pub struct DeviceProfiler {
    dispatch: Arc<dyn DeviceDispatch>,
    config: ProfilerConfig,
    command_pools: RwLock<HashMap<vk::CommandPool, vk::QueueFlags>>,
    command_buffers: RwLock<HashMap<vk::CommandBuffer, Arc<Mutex<ProfilerCommandBuffer>>>>,
}

/// [`SecondarySnapshots`] taking the timestamps of secondary command buffers
/// from a [`QueryDataBuffer`].
#[derive(Debug)]
struct BufferedSnapshots<'a> {
    profiler: &'a DeviceProfiler,
    query_data: &'a QueryDataBuffer,
}

impl DeviceProfiler {
    pub fn new(dispatch: Arc<dyn DeviceDispatch>, config: ProfilerConfig) -> Self {
        Self {
            dispatch,
            config,
            command_pools: RwLock::new(HashMap::default()),
            command_buffers: RwLock::new(HashMap::default()),
        }
    }

    pub fn config(&self) -> &ProfilerConfig {
        &self.config
    }

    /// Registers a command pool created for a queue family with the given
    /// capabilities.
    pub fn register_command_pool(&self, command_pool: vk::CommandPool, queue_flags: vk::QueueFlags) {
        self.command_pools.write().insert(command_pool, queue_flags);
    }

    /// Forgets a destroyed command pool together with every command buffer
    /// allocated from it.
    ///
    /// Command buffers are never locked while the registry is locked, since
    /// collecting the data of a primary command buffer looks up its
    /// secondaries in the registry while the primary is locked.
    pub fn unregister_command_pool(&self, command_pool: vk::CommandPool) {
        self.command_pools.write().remove(&command_pool);

        let command_buffers: Vec<_> = self
            .command_buffers
            .read()
            .iter()
            .map(|(&handle, command_buffer)| (handle, command_buffer.clone()))
            .collect();

        let freed: Vec<_> = command_buffers
            .into_iter()
            .filter(|(_, command_buffer)| command_buffer.lock().command_pool() == command_pool)
            .map(|(handle, _)| handle)
            .collect();

        self.free_command_buffers(&freed);
    }

    /// Resets every command buffer allocated from the given pool.
    pub fn reset_command_pool(&self, command_pool: vk::CommandPool) {
        let command_buffers: Vec<_> = self.command_buffers.read().values().cloned().collect();
        for command_buffer in command_buffers {
            let mut command_buffer = command_buffer.lock();
            if command_buffer.command_pool() == command_pool {
                command_buffer.reset();
            }
        }
    }

    /// Starts tracking command buffers allocated from a registered pool.
    /// Command buffers from unknown pools are tracked without being
    /// profiled.
    pub fn allocate_command_buffers(
        &self,
        command_pool: vk::CommandPool,
        level: vk::CommandBufferLevel,
        command_buffers: &[vk::CommandBuffer],
    ) {
        let queue_flags = self
            .command_pools
            .read()
            .get(&command_pool)
            .copied()
            .unwrap_or_else(|| {
                vkprof_log::warn!(
                    "Command buffers allocated from unknown {:?} will not be profiled",
                    command_pool
                );
                vk::QueueFlags::empty()
            });

        let mut registry = self.command_buffers.write();
        for &handle in command_buffers {
            registry.insert(
                handle,
                Arc::new(Mutex::new(ProfilerCommandBuffer::new(
                    self.dispatch.clone(),
                    handle,
                    command_pool,
                    level,
                    queue_flags,
                    &self.config,
                ))),
            );
        }
    }

    pub fn free_command_buffers(&self, command_buffers: &[vk::CommandBuffer]) {
        let mut registry = self.command_buffers.write();
        for handle in command_buffers {
            registry.remove(handle);
        }
    }

    pub fn command_buffer(
        &self,
        handle: vk::CommandBuffer,
    ) -> Option<Arc<Mutex<ProfilerCommandBuffer>>> {
        self.command_buffers.read().get(&handle).cloned()
    }

    pub fn begin_command_buffer(
        &self,
        handle: vk::CommandBuffer,
        usage: vk::CommandBufferUsageFlags,
    ) {
        self.with_command_buffer(handle, |command_buffer| command_buffer.begin(usage));
    }

    pub fn end_command_buffer(&self, handle: vk::CommandBuffer) {
        self.with_command_buffer(handle, ProfilerCommandBuffer::end);
    }

    pub fn reset_command_buffer(&self, handle: vk::CommandBuffer) {
        self.with_command_buffer(handle, ProfilerCommandBuffer::reset);
    }

    /// Records `command` into the shadow of the given command buffer around
    /// the call of `forward`. See [`ProfilerCommandBuffer::record_command`].
    /// Commands for unknown command buffers are only forwarded.
    pub fn record_command<R>(
        &self,
        handle: vk::CommandBuffer,
        command: Command,
        forward: impl FnOnce(vk::CommandBuffer) -> R,
    ) -> R {
        match self.command_buffer(handle) {
            Some(command_buffer) => command_buffer.lock().record_command(command, forward),
            None => forward(handle),
        }
    }

    /// Marks the submitted command buffers, and the secondary command
    /// buffers they execute, as having stale data. Returns the batch to pass
    /// to [`Self::collect_submit_batch`] once the submission has completed.
    pub fn submit(&self, queue: vk::Queue, submits: &[&[vk::CommandBuffer]]) -> SubmitBatch {
        let mut batch = SubmitBatch::new(queue);
        let mut pending = Vec::new();

        for &submit in submits {
            batch.submits.push(submit.to_vec());
            pending.extend_from_slice(submit);
        }

        while let Some(handle) = pending.pop() {
            let Some(command_buffer) = self.command_buffer(handle) else {
                vkprof_log::debug!("Submitted unknown {:?}", handle);
                continue;
            };
            pending.extend_from_slice(command_buffer.lock().submit());
        }

        batch
    }

    /// Returns the snapshot of the given command buffer. See
    /// [`ProfilerCommandBuffer::get_data`].
    pub fn command_buffer_data(
        &self,
        handle: vk::CommandBuffer,
    ) -> Option<Arc<CommandBufferSnapshot>> {
        let command_buffer = self.command_buffer(handle)?;
        let mut command_buffer = command_buffer.lock();
        Some(command_buffer.get_data(self))
    }

    /// Returns the snapshots of the command buffers of a completed
    /// submission, in submission order. Blocks until the query results are
    /// available.
    pub fn collect_submit_batch(&self, batch: &SubmitBatch) -> SubmitBatchData {
        self.collect_with(batch, |handle| self.command_buffer_data(handle))
    }

    /// Creates a buffer that the query results of many submissions can be
    /// copied into, sized according to the configuration.
    pub fn create_query_data_buffer(&self) -> QueryDataBuffer {
        QueryDataBuffer::new(
            self.dispatch.clone(),
            self.config.query_data_buffer_capacity,
        )
    }

    /// Records copies of the query results of every command buffer in the
    /// batch, and of the secondary command buffers they execute, into
    /// `query_data`. `copy_command_buffer` must execute after the batch.
    ///
    /// # Errors
    /// Returns an error if `query_data` has no room for the results. The
    /// command buffers recorded before the error keep their ranges.
    pub fn record_query_data_copies(
        &self,
        copy_command_buffer: vk::CommandBuffer,
        batch: &SubmitBatch,
        query_data: &mut QueryDataBuffer,
    ) -> Result<(), QueryDataBufferError> {
        let mut pending: Vec<_> = batch.command_buffers().collect();
        pending.reverse();

        while let Some(handle) = pending.pop() {
            let Some(command_buffer) = self.command_buffer(handle) else {
                continue;
            };
            let command_buffer = command_buffer.lock();
            command_buffer.record_query_data_copies(copy_command_buffer, query_data)?;
            pending.extend(command_buffer.secondary_command_buffers().iter().rev());
        }
        Ok(())
    }

    /// Like [`Self::collect_submit_batch`], but takes the timestamps from a
    /// fetched [`QueryDataBuffer`] that they were copied into with
    /// [`Self::record_query_data_copies`].
    pub fn collect_submit_batch_from(
        &self,
        batch: &SubmitBatch,
        query_data: &QueryDataBuffer,
    ) -> SubmitBatchData {
        let snapshots = BufferedSnapshots {
            profiler: self,
            query_data,
        };
        self.collect_with(batch, |handle| snapshots.secondary_snapshot(handle))
    }

    fn collect_with(
        &self,
        batch: &SubmitBatch,
        snapshot: impl Fn(vk::CommandBuffer) -> Option<Arc<CommandBufferSnapshot>>,
    ) -> SubmitBatchData {
        let submits = batch
            .submits
            .iter()
            .map(|command_buffers| SubmitData {
                command_buffers: command_buffers
                    .iter()
                    .filter_map(|&handle| snapshot(handle))
                    .collect(),
            })
            .collect();

        SubmitBatchData {
            queue: batch.queue,
            submits,
        }
    }

    fn with_command_buffer(
        &self,
        handle: vk::CommandBuffer,
        f: impl FnOnce(&mut ProfilerCommandBuffer),
    ) {
        match self.command_buffer(handle) {
            Some(command_buffer) => f(&mut command_buffer.lock()),
            None => vkprof_log::debug!("Ignoring call for unknown {:?}", handle),
        }
    }
}

impl SecondarySnapshots for DeviceProfiler {
    fn secondary_snapshot(
        &self,
        command_buffer: vk::CommandBuffer,
    ) -> Option<Arc<CommandBufferSnapshot>> {
        self.command_buffer_data(command_buffer)
    }
}

impl SecondarySnapshots for BufferedSnapshots<'_> {
    fn secondary_snapshot(
        &self,
        command_buffer: vk::CommandBuffer,
    ) -> Option<Arc<CommandBufferSnapshot>> {
        let command_buffer = self.profiler.command_buffer(command_buffer)?;
        let mut command_buffer = command_buffer.lock();
        Some(command_buffer.get_data_from(self.query_data, self))
    }
}
