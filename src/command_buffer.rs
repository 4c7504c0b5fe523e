//! Profiling state of individual command buffers.

mod injection;

use crate::config::{ProfilerConfig, SamplingMode};
use ash::vk;
use injection::{ProfilingPolicy, TimestampInjector, write_group_begin, write_group_end};
use std::sync::Arc;
use vkprof_commands::{
    builder::CommandTreeBuilder,
    command::Command,
    resolve::{self, SecondarySnapshots},
    snapshot::CommandBufferSnapshot,
    tree::CommandTree,
};
use vkprof_gpu::{
    device::DeviceDispatch,
    query::{CommandBufferQueryPool, QueryResetMode},
    query_data::{QueryDataBuffer, QueryDataBufferError, QueryDataContext},
};

/// Lifecycle state of a command buffer, as far as the profiler knows.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandBufferState {
    Initial,
    Recording,
    Executable,
    Submitted,
}

/// Shadow of an application command buffer.
///
/// Mirrors the commands recorded into the command buffer as a
/// [`CommandTree`], writes timestamp queries around the profiled commands,
/// and resolves the query results into a [`CommandBufferSnapshot`] after the
/// command buffer has been submitted and executed.
///
/// The snapshot is cached until the command buffer is submitted again or
/// re-recorded, so repeated calls to [`Self::get_data`] return the same
/// shared snapshot.
#[derive(Debug)]
pub struct ProfilerCommandBuffer {
    handle: vk::CommandBuffer,
    command_pool: vk::CommandPool,
    level: vk::CommandBufferLevel,
    profiling_enabled: bool,
    sampling_mode: SamplingMode,
    slab_growth_threshold: f32,
    state: CommandBufferState,
    dirty: bool,
    query_pool: Option<CommandBufferQueryPool>,
    builder: Option<CommandTreeBuilder>,
    recorded: Option<CommandTree>,
    secondary_command_buffers: Vec<vk::CommandBuffer>,
    snapshot: Arc<CommandBufferSnapshot>,
}

impl ProfilerCommandBuffer {
    /// Creates the shadow of a command buffer allocated from a command pool
    /// for a queue family with the given capabilities. Command buffers for
    /// queues without graphics or compute support are tracked but never
    /// profiled.
    pub fn new(
        dispatch: Arc<dyn DeviceDispatch>,
        handle: vk::CommandBuffer,
        command_pool: vk::CommandPool,
        level: vk::CommandBufferLevel,
        queue_flags: vk::QueueFlags,
        config: &ProfilerConfig,
    ) -> Self {
        let profiling_enabled =
            queue_flags.intersects(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE);

        if !profiling_enabled {
            vkprof_log::debug!(
                "Not profiling {:?}, its queue family supports neither graphics nor compute",
                handle
            );
        }

        let query_pool = profiling_enabled
            .then(|| CommandBufferQueryPool::new(dispatch, config.query_slab_capacity));

        Self {
            handle,
            command_pool,
            level,
            profiling_enabled,
            sampling_mode: config.sampling_mode,
            slab_growth_threshold: config.slab_growth_threshold,
            state: CommandBufferState::Initial,
            dirty: false,
            query_pool,
            builder: None,
            recorded: None,
            secondary_command_buffers: Vec::new(),
            snapshot: Arc::new(CommandBufferSnapshot::empty(handle, level)),
        }
    }

    pub fn handle(&self) -> vk::CommandBuffer {
        self.handle
    }

    pub fn command_pool(&self) -> vk::CommandPool {
        self.command_pool
    }

    pub fn level(&self) -> vk::CommandBufferLevel {
        self.level
    }

    pub fn state(&self) -> CommandBufferState {
        self.state
    }

    /// Whether timestamp queries are written into this command buffer.
    pub fn is_profiling_enabled(&self) -> bool {
        self.profiling_enabled
    }

    pub fn query_pool(&self) -> Option<&CommandBufferQueryPool> {
        self.query_pool.as_ref()
    }

    /// Returns the secondary command buffers executed by the latest
    /// recording, without duplicates.
    pub fn secondary_command_buffers(&self) -> &[vk::CommandBuffer] {
        &self.secondary_command_buffers
    }

    /// Returns the tree of commands of the latest completed recording.
    pub fn recorded_commands(&self) -> Option<&CommandTree> {
        self.recorded.as_ref()
    }

    /// Starts shadowing a new recording, discarding everything known about
    /// the previous one. Must be called after the command buffer has begun
    /// recording, since query resets may be recorded into it.
    pub fn begin(&mut self, usage: vk::CommandBufferUsageFlags) {
        self.discard_recording();
        self.state = CommandBufferState::Recording;

        let Some(query_pool) = &mut self.query_pool else {
            return;
        };

        let mut builder = CommandTreeBuilder::new(self.level, usage);
        let scope = builder.scope();

        let reset_mode = if scope.in_render_pass {
            QueryResetMode::Host
        } else {
            QueryResetMode::CommandBuffer
        };
        // A failure leaves the pool disabled for this recording, and the
        // commands are still recorded into the tree without timestamps.
        let _ = query_pool.begin(self.handle, reset_mode);
        query_pool.set_render_pass_open(scope.in_render_pass);

        if self.sampling_mode == SamplingMode::PerCommandBuffer
            && write_group_begin(query_pool, self.handle)
        {
            builder.set_root_profiled();
        }

        self.builder = Some(builder);
    }

    /// Records `command` into the shadow tree around the call of `forward`,
    /// which must record the command into the real command buffer. Timestamp
    /// queries are written before and after `forward` if the command is
    /// profiled.
    ///
    /// Returns the result of `forward`.
    ///
    /// # Panics
    /// In debug builds, if the command is not valid in the current recording
    /// state, for example when a render pass ends without having begun.
    pub fn record_command<R>(
        &mut self,
        command: Command,
        forward: impl FnOnce(vk::CommandBuffer) -> R,
    ) -> R {
        let (Some(builder), Some(query_pool)) = (&mut self.builder, &mut self.query_pool) else {
            return forward(self.handle);
        };

        let placement = match builder.plan(&command) {
            Ok(placement) => placement,
            Err(error) => {
                if cfg!(debug_assertions) {
                    panic!("Invalid command sequence in {:?}: {}", self.handle, error);
                }
                vkprof_log::error!(
                    "Invalid command sequence in {:?}, leaving command out: {}",
                    self.handle,
                    error
                );
                return forward(self.handle);
            }
        };

        if matches!(command, Command::BeginRenderPass(_)) {
            let _ = query_pool.grow_if_almost_full(self.handle, self.slab_growth_threshold);
        }

        let policy = ProfilingPolicy {
            mode: self.sampling_mode,
            scope: builder.scope(),
        };

        // Queries bracketing pipeline groups are written before the command
        // that seals or opens them.
        if let Some(group) = placement.sealed_pipeline_group()
            && builder.tree().node(group).is_profiled()
        {
            write_group_end(query_pool, self.handle);
        }
        let placement = if placement.opens_pipeline_group() && policy.profiles_pipeline_groups() {
            placement.with_profiled_pipeline_group(write_group_begin(query_pool, self.handle))
        } else {
            placement
        };

        let profiled =
            TimestampInjector::before_command(query_pool, self.handle, policy).inject(&command);

        let result = forward(self.handle);

        if let Command::ExecuteCommands(args) = &command {
            for &secondary in &args.command_buffers {
                if !self.secondary_command_buffers.contains(&secondary) {
                    self.secondary_command_buffers.push(secondary);
                }
            }
        }

        let post_command = profiled.then(|| command.clone());
        builder.insert(command, placement, profiled);
        query_pool.set_render_pass_open(builder.scope().in_render_pass);

        if let Some(command) = post_command {
            TimestampInjector::after_command(query_pool, self.handle, policy).inject(&command);
        }

        result
    }

    /// Completes the recording. Must be called before the command buffer
    /// ends recording, since the queries closing the open groups are
    /// recorded into it.
    pub fn end(&mut self) {
        if self.state != CommandBufferState::Recording {
            vkprof_log::debug!(
                "Ending {:?} in state {:?} without recording",
                self.handle,
                self.state
            );
        }
        if let (Some(builder), Some(query_pool)) = (&self.builder, &mut self.query_pool) {
            let tree = builder.tree();
            if builder
                .open_pipeline_group()
                .is_some_and(|group| tree.node(group).is_profiled())
            {
                write_group_end(query_pool, self.handle);
            }
            if tree.root().is_profiled() {
                write_group_end(query_pool, self.handle);
            }
        }

        self.recorded = self.builder.take().map(CommandTreeBuilder::finish);
        self.state = CommandBufferState::Executable;
    }

    /// Marks the cached snapshot as stale, since the queries will be
    /// written again when the command buffer executes. Returns the secondary
    /// command buffers executed by the recording, which will also execute
    /// again.
    pub fn submit(&mut self) -> &[vk::CommandBuffer] {
        if self.state == CommandBufferState::Recording {
            vkprof_log::warn!("Submitting {:?} while it is recording", self.handle);
        }
        self.state = CommandBufferState::Submitted;
        self.dirty = true;
        &self.secondary_command_buffers
    }

    /// Returns the command buffer to the initial state, discarding the
    /// latest recording and its snapshot. Query slabs are kept for reuse.
    pub fn reset(&mut self) {
        self.discard_recording();
        self.state = CommandBufferState::Initial;
    }

    /// Whether the cached snapshot is stale.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Returns the snapshot of the latest executed recording, reading back
    /// and resolving the timestamp queries if the command buffer has been
    /// submitted since the last call. Blocks until the query results are
    /// available, so the submission should be known to have completed.
    ///
    /// Secondary command buffers executed by the recording are looked up in
    /// `secondaries`.
    pub fn get_data<S>(&mut self, secondaries: &S) -> Arc<CommandBufferSnapshot>
    where
        S: SecondarySnapshots + ?Sized,
    {
        if self.dirty {
            let timestamps = self.read_back_timestamps();
            self.update_snapshot(timestamps.as_deref(), secondaries);
        }
        self.snapshot.clone()
    }

    /// Like [`Self::get_data`], but takes the timestamps from a
    /// [`QueryDataBuffer`] that the queries were copied into with
    /// [`Self::record_query_data_copies`]. Falls back to reading the queries
    /// directly if the buffer has no fetched data for this command buffer.
    pub fn get_data_from<S>(
        &mut self,
        query_data: &QueryDataBuffer,
        secondaries: &S,
    ) -> Arc<CommandBufferSnapshot>
    where
        S: SecondarySnapshots + ?Sized,
    {
        if !self.dirty {
            return self.snapshot.clone();
        }

        match query_data.context_data(self.query_data_context()) {
            Some(timestamps) => self.update_snapshot(Some(timestamps), secondaries),
            None => {
                if self.has_timestamps() {
                    vkprof_log::debug!(
                        "No query data fetched for {:?}, reading queries directly",
                        self.handle
                    );
                }
                let timestamps = self.read_back_timestamps();
                self.update_snapshot(timestamps.as_deref(), secondaries);
            }
        }
        self.snapshot.clone()
    }

    /// Records copies of the timestamp queries of the latest recording into
    /// `query_data`. Does nothing if no queries were written.
    ///
    /// # Errors
    /// See [`QueryDataBuffer::record_query_pool_copies`].
    pub fn record_query_data_copies(
        &self,
        copy_command_buffer: vk::CommandBuffer,
        query_data: &mut QueryDataBuffer,
    ) -> Result<(), QueryDataBufferError> {
        let context = self.query_data_context();
        match &self.query_pool {
            Some(query_pool) if self.has_timestamps() && !query_data.contains_context(context) => {
                query_data.record_query_pool_copies(copy_command_buffer, context, query_pool)
            }
            _ => Ok(()),
        }
    }

    pub fn query_data_context(&self) -> QueryDataContext {
        QueryDataContext::from_handle(self.handle)
    }

    fn discard_recording(&mut self) {
        self.builder = None;
        self.recorded = None;
        self.secondary_command_buffers.clear();
        self.dirty = false;
        self.snapshot = Arc::new(CommandBufferSnapshot::empty(self.handle, self.level));
    }

    /// Whether the latest recording wrote at least one complete pair of
    /// timestamps.
    fn has_timestamps(&self) -> bool {
        self.recorded.is_some()
            && self
                .query_pool
                .as_ref()
                .is_some_and(|query_pool| query_pool.query_count() > 1)
    }

    fn read_back_timestamps(&self) -> Option<Vec<u64>> {
        if !self.has_timestamps() {
            return None;
        }
        let query_pool = self.query_pool.as_ref()?;
        Some(vkprof_log::with_trace_logging!(
            "Reading {} timestamp queries of {:?}", query_pool.query_count(), self.handle;
            query_pool.read_back()
        ))
    }

    fn update_snapshot<S>(&mut self, timestamps: Option<&[u64]>, secondaries: &S)
    where
        S: SecondarySnapshots + ?Sized,
    {
        self.dirty = false;

        let Some(commands) = &self.recorded else {
            self.snapshot = Arc::new(CommandBufferSnapshot::empty(self.handle, self.level));
            return;
        };

        let timestamps = match timestamps {
            Some(timestamps) => timestamps,
            // Without timestamps of its own, the recording is only of
            // interest for the secondary command buffers it executes.
            None if !self.secondary_command_buffers.is_empty() => &[],
            None => {
                self.snapshot = Arc::new(CommandBufferSnapshot::empty(self.handle, self.level));
                return;
            }
        };

        let resolved = resolve::resolve_timestamps(commands, timestamps, secondaries);
        self.snapshot = Arc::new(resolved.into_snapshot(self.handle, self.level));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use vkprof_commands::{
        command::{BeginRenderPass, CommandKind, Dispatch, Draw, ExecuteCommands},
        resolve::NoSecondarySnapshots,
        tree::CommandTimestamps,
    };
    use vkprof_gpu::testing::{
        SIMULATED_CLOCK_START, SIMULATED_TICKS_PER_TIMESTAMP, SimulatedCommand, SimulatedDevice,
    };

    fn command_buffer(
        device: &Arc<SimulatedDevice>,
        queue_flags: vk::QueueFlags,
    ) -> ProfilerCommandBuffer {
        ProfilerCommandBuffer::new(
            device.clone(),
            device.allocate_command_buffer(),
            device.allocate_command_pool(),
            vk::CommandBufferLevel::PRIMARY,
            queue_flags,
            &ProfilerConfig::default(),
        )
    }

    fn dispatch() -> Command {
        Command::Dispatch(Dispatch {
            group_count_x: 1,
            group_count_y: 1,
            group_count_z: 1,
        })
    }

    fn draw() -> Command {
        Command::Draw(Draw {
            vertex_count: 3,
            instance_count: 1,
            first_vertex: 0,
            first_instance: 0,
        })
    }

    fn begin_render_pass() -> Command {
        Command::BeginRenderPass(BeginRenderPass {
            render_pass: vk::RenderPass::from_raw(1),
            framebuffer: vk::Framebuffer::from_raw(2),
            contents: vk::SubpassContents::INLINE,
        })
    }

    fn record(
        device: &SimulatedDevice,
        command_buffer: &mut ProfilerCommandBuffer,
        commands: impl IntoIterator<Item = Command>,
    ) {
        device.begin_command_buffer(command_buffer.handle());
        command_buffer.begin(vk::CommandBufferUsageFlags::empty());
        for command in commands {
            command_buffer.record_command(command, |_| {});
        }
        command_buffer.end();
    }

    fn timestamp(n_written_before: u64) -> u64 {
        SIMULATED_CLOCK_START + (n_written_before + 1) * SIMULATED_TICKS_PER_TIMESTAMP
    }

    #[test]
    fn profiled_command_is_surrounded_by_timestamp_writes() {
        let device = Arc::new(SimulatedDevice::new());
        let mut command_buffer = command_buffer(&device, vk::QueueFlags::COMPUTE);

        device.begin_command_buffer(command_buffer.handle());
        command_buffer.begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        let forwarded = command_buffer.record_command(dispatch(), |handle| {
            assert_eq!(device.recorded_commands(handle).len(), 2);
            42
        });
        command_buffer.end();

        assert_eq!(forwarded, 42);
        let recorded = device.recorded_commands(command_buffer.handle());
        assert!(matches!(recorded[0], SimulatedCommand::ResetQueries { .. }));
        assert!(matches!(
            recorded[1],
            SimulatedCommand::WriteTimestamp { query: 0, .. }
        ));
        assert!(matches!(
            recorded[2],
            SimulatedCommand::WriteTimestamp { query: 1, .. }
        ));
        assert_eq!(command_buffer.query_pool().unwrap().query_count(), 2);
    }

    #[test]
    fn resolved_snapshot_has_timestamps_of_executed_commands() {
        let device = Arc::new(SimulatedDevice::new());
        let mut command_buffer = command_buffer(&device, vk::QueueFlags::GRAPHICS);
        record(
            &device,
            &mut command_buffer,
            [begin_render_pass(), draw(), Command::EndRenderPass],
        );

        command_buffer.submit();
        device.execute(command_buffer.handle());
        let snapshot = command_buffer.get_data(&NoSecondarySnapshots);

        let leaves: Vec<_> = snapshot
            .commands()
            .leaves()
            .map(|node| (node.command().kind(), node.timestamps()))
            .collect();
        assert_eq!(
            leaves,
            vec![
                (
                    CommandKind::BeginRenderPass,
                    Some(CommandTimestamps::new(timestamp(0), timestamp(1)))
                ),
                (
                    CommandKind::Draw,
                    Some(CommandTimestamps::new(timestamp(2), timestamp(3)))
                ),
                (
                    CommandKind::EndRenderPass,
                    Some(CommandTimestamps::new(timestamp(4), timestamp(5)))
                ),
            ]
        );
        assert_eq!(
            snapshot.timestamps(),
            Some(CommandTimestamps::new(timestamp(0), timestamp(5)))
        );
        assert_eq!(snapshot.stats().draw_count, 1);
    }

    #[test]
    fn snapshot_is_empty_until_submitted() {
        let device = Arc::new(SimulatedDevice::new());
        let mut command_buffer = command_buffer(&device, vk::QueueFlags::COMPUTE);
        record(&device, &mut command_buffer, [dispatch()]);

        let snapshot = command_buffer.get_data(&NoSecondarySnapshots);

        assert!(snapshot.is_empty());
        assert!(!command_buffer.is_dirty());
        assert_eq!(device.result_read_count(), 0);
    }

    #[test]
    fn state_follows_lifecycle() {
        let device = Arc::new(SimulatedDevice::new());
        let mut command_buffer = command_buffer(&device, vk::QueueFlags::COMPUTE);
        assert_eq!(command_buffer.state(), CommandBufferState::Initial);

        command_buffer.begin(vk::CommandBufferUsageFlags::empty());
        assert_eq!(command_buffer.state(), CommandBufferState::Recording);
        command_buffer.end();
        assert_eq!(command_buffer.state(), CommandBufferState::Executable);
        command_buffer.submit();
        assert_eq!(command_buffer.state(), CommandBufferState::Submitted);
        assert!(command_buffer.is_dirty());
        command_buffer.reset();
        assert_eq!(command_buffer.state(), CommandBufferState::Initial);
        assert!(!command_buffer.is_dirty());
        assert!(command_buffer.recorded_commands().is_none());
    }

    #[test]
    fn executed_secondaries_are_tracked_without_duplicates() {
        let device = Arc::new(SimulatedDevice::new());
        let mut command_buffer = command_buffer(&device, vk::QueueFlags::GRAPHICS);
        let secondaries = [
            vk::CommandBuffer::from_raw(100),
            vk::CommandBuffer::from_raw(101),
        ];
        let execute = || {
            Command::ExecuteCommands(ExecuteCommands {
                command_buffers: secondaries.to_vec(),
                snapshots: Vec::new(),
            })
        };
        record(&device, &mut command_buffer, [execute(), execute()]);

        assert_eq!(command_buffer.secondary_command_buffers(), &secondaries);
        assert_eq!(command_buffer.submit(), &secondaries);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic]
    fn invalid_command_sequence_panics_in_debug_builds() {
        let device = Arc::new(SimulatedDevice::new());
        let mut command_buffer = command_buffer(&device, vk::QueueFlags::GRAPHICS);
        record(&device, &mut command_buffer, [Command::EndRenderPass]);
    }

    #[test]
    fn commands_outside_recording_are_only_forwarded() {
        let device = Arc::new(SimulatedDevice::new());
        let mut command_buffer = command_buffer(&device, vk::QueueFlags::GRAPHICS);

        let mut forwarded = false;
        command_buffer.record_command(draw(), |_| forwarded = true);

        assert!(forwarded);
        assert!(device.recorded_commands(command_buffer.handle()).is_empty());
    }
}
