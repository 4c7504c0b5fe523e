//! Injection of timestamp queries around recorded commands.

use crate::config::SamplingMode;
use ash::vk;
use vkprof_commands::{
    builder::RecordingScope,
    command::{BeginRenderPass, Command, NextSubpass},
    visitor::CommandVisitor,
};
use vkprof_gpu::query::CommandBufferQueryPool;

/// Decides whether a command gets timestamp queries written around it.
#[derive(Clone, Copy, Debug)]
pub(super) struct ProfilingPolicy {
    pub mode: SamplingMode,
    /// Recording scope before the command was recorded.
    pub scope: RecordingScope,
}

/// Writes a timestamp query into the command buffer if the visited command
/// is profiled under the given [`ProfilingPolicy`].
///
/// The pre-visitor ([`Self::before_command`]) writes at the top of the
/// pipeline before the command is forwarded to the driver, and the
/// post-visitor ([`Self::after_command`]) at the bottom of the pipeline
/// after the command has been forwarded. The post-visitor must only run for
/// commands that the pre-visitor wrote a query for, so that every profiled
/// command owns a consecutive pair of queries.
#[derive(Debug)]
pub(super) struct TimestampInjector<'a> {
    pool: &'a mut CommandBufferQueryPool,
    command_buffer: vk::CommandBuffer,
    stage: vk::PipelineStageFlags,
    policy: ProfilingPolicy,
    written: bool,
}

struct PolicyEvaluator {
    policy: ProfilingPolicy,
    profiled: bool,
}

impl ProfilingPolicy {
    pub(super) fn is_profiled(&self, command: &Command) -> bool {
        let mut evaluator = PolicyEvaluator {
            policy: *self,
            profiled: false,
        };
        command.accept(&mut evaluator);
        evaluator.profiled
    }

    /// Whether a pipeline group opened in the current scope gets queries
    /// bracketing all of its commands.
    pub(super) fn profiles_pipeline_groups(&self) -> bool {
        self.mode == SamplingMode::PerPipeline
            && self.scope.subpass_contents == vk::SubpassContents::INLINE
    }

    fn profiles_executing_commands(&self) -> bool {
        match self.mode {
            SamplingMode::PerCommand | SamplingMode::PerPipeline => true,
            SamplingMode::PerRenderPass => !self.scope.in_render_pass,
            SamplingMode::PerCommandBuffer => false,
        }
    }

    fn profiles_render_pass_transitions(&self) -> bool {
        self.mode != SamplingMode::PerCommandBuffer
    }
}

/// Writes the query that begins a group of commands, at the top of the
/// pipeline. Returns whether the query was written.
pub(super) fn write_group_begin(
    pool: &mut CommandBufferQueryPool,
    command_buffer: vk::CommandBuffer,
) -> bool {
    pool.write_timestamp(command_buffer, vk::PipelineStageFlags::TOP_OF_PIPE)
        .is_ok()
}

/// Writes the query that ends a group of commands, at the bottom of the
/// pipeline. Returns whether the query was written.
pub(super) fn write_group_end(
    pool: &mut CommandBufferQueryPool,
    command_buffer: vk::CommandBuffer,
) -> bool {
    pool.write_timestamp(command_buffer, vk::PipelineStageFlags::BOTTOM_OF_PIPE)
        .is_ok()
}

impl CommandVisitor for PolicyEvaluator {
    fn visit_command(&mut self, _command: &Command) {
        self.profiled = false;
    }

    fn visit_internal_pipeline_command(&mut self, _command: &Command) {
        self.profiled = self.policy.profiles_executing_commands();
    }

    // Timed through their pipeline group when sampling per pipeline.
    fn visit_pipeline_command(&mut self, _command: &Command) {
        self.profiled = self.policy.mode != SamplingMode::PerPipeline
            && self.policy.profiles_executing_commands();
    }

    // Timestamps can not be written in subpasses whose contents are recorded
    // in secondary command buffers.
    fn visit_begin_render_pass(&mut self, _command: &Command, args: &BeginRenderPass) {
        self.profiled = self.policy.profiles_render_pass_transitions()
            && args.contents == vk::SubpassContents::INLINE;
    }

    fn visit_end_render_pass(&mut self, _command: &Command) {
        self.profiled = self.policy.profiles_render_pass_transitions()
            && self.policy.scope.subpass_contents == vk::SubpassContents::INLINE;
    }

    fn visit_next_subpass(&mut self, _command: &Command, _args: &NextSubpass) {
        self.profiled = false;
    }
}

impl<'a> TimestampInjector<'a> {
    pub(super) fn before_command(
        pool: &'a mut CommandBufferQueryPool,
        command_buffer: vk::CommandBuffer,
        policy: ProfilingPolicy,
    ) -> Self {
        Self::new(pool, command_buffer, vk::PipelineStageFlags::TOP_OF_PIPE, policy)
    }

    pub(super) fn after_command(
        pool: &'a mut CommandBufferQueryPool,
        command_buffer: vk::CommandBuffer,
        policy: ProfilingPolicy,
    ) -> Self {
        Self::new(
            pool,
            command_buffer,
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            policy,
        )
    }

    fn new(
        pool: &'a mut CommandBufferQueryPool,
        command_buffer: vk::CommandBuffer,
        stage: vk::PipelineStageFlags,
        policy: ProfilingPolicy,
    ) -> Self {
        Self {
            pool,
            command_buffer,
            stage,
            policy,
            written: false,
        }
    }

    /// Visits the command and returns whether a query was written for it.
    pub(super) fn inject(mut self, command: &Command) -> bool {
        command.accept(&mut self);
        self.written
    }
}

impl CommandVisitor for TimestampInjector<'_> {
    fn visit_command(&mut self, command: &Command) {
        if !self.policy.is_profiled(command) {
            return;
        }
        // Failures are logged by the pool, which refuses writes for the rest
        // of the recording afterwards.
        self.written = self
            .pool
            .write_timestamp(self.command_buffer, self.stage)
            .is_ok();
    }
}
