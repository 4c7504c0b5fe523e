//! Resolution of raw GPU timestamps onto recorded command trees.

use crate::{
    command::{Command, ExecuteCommands},
    snapshot::CommandBufferSnapshot,
    stats::CommandStats,
    tree::{CommandNodeId, CommandTimestamps, CommandTree},
    visitor::CommandVisitor,
};
use ash::vk;
use std::sync::Arc;

/// Source of the resolved snapshots of secondary command buffers.
pub trait SecondarySnapshots {
    /// Returns the latest resolved snapshot of the given secondary command
    /// buffer, or [`None`] if it is unknown.
    fn secondary_snapshot(
        &self,
        command_buffer: vk::CommandBuffer,
    ) -> Option<Arc<CommandBufferSnapshot>>;
}

/// [`SecondarySnapshots`] that knows no secondary command buffers.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoSecondarySnapshots;

/// A command tree annotated with resolved timestamps.
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedCommands {
    pub commands: CommandTree,
    pub stats: CommandStats,
    /// Number of raw timestamps assigned to commands.
    pub consumed_timestamps: usize,
}

struct TimestampResolver<'a, S: ?Sized> {
    source: &'a CommandTree,
    timestamps: &'a [u64],
    secondaries: &'a S,
    output: CommandTree,
    stats: CommandStats,
    cursor: usize,
    current: CommandNodeId,
    resolved: Option<CommandTimestamps>,
}

/// Accumulates the timestamps of a group from those of its children. The
/// group begins at the first non-zero child begin and ends at the latest
/// non-zero child end.
#[derive(Clone, Copy, Debug, Default)]
struct GroupTimestamps {
    begin: u64,
    end: u64,
}

impl<F> SecondarySnapshots for F
where
    F: Fn(vk::CommandBuffer) -> Option<Arc<CommandBufferSnapshot>>,
{
    fn secondary_snapshot(
        &self,
        command_buffer: vk::CommandBuffer,
    ) -> Option<Arc<CommandBufferSnapshot>> {
        self(command_buffer)
    }
}

impl SecondarySnapshots for NoSecondarySnapshots {
    fn secondary_snapshot(
        &self,
        _command_buffer: vk::CommandBuffer,
    ) -> Option<Arc<CommandBufferSnapshot>> {
        None
    }
}

/// Produces a copy of `commands` where every profiled command is annotated
/// with timestamps taken from `timestamps`, and every group with timestamps
/// spanning its children.
///
/// The tree is walked in recording order, and each profiled command takes
/// the next two timestamps (begin and end). A profiled group takes the next
/// timestamp as its begin before its children are resolved, and the next
/// one after them as its end. Missing timestamps are taken as zero. Secondary command buffer executions get the already resolved
/// snapshots of the executed command buffers from `secondaries`, which also
/// contribute to the timestamps of the enclosing groups and to the returned
/// statistics.
pub fn resolve_timestamps<S>(
    commands: &CommandTree,
    timestamps: &[u64],
    secondaries: &S,
) -> ResolvedCommands
where
    S: SecondarySnapshots + ?Sized,
{
    let mut resolver = TimestampResolver {
        source: commands,
        timestamps,
        secondaries,
        output: commands.clone(),
        stats: CommandStats::default(),
        cursor: 0,
        current: CommandNodeId::ROOT,
        resolved: None,
    };
    resolver.resolve_node(CommandNodeId::ROOT);

    if resolver.cursor > timestamps.len() {
        vkprof_log::debug!(
            "Resolved {} timestamps, but only {} were available",
            resolver.cursor,
            timestamps.len()
        );
    }

    ResolvedCommands {
        commands: resolver.output,
        stats: resolver.stats,
        consumed_timestamps: resolver.cursor,
    }
}

impl ResolvedCommands {
    pub fn into_snapshot(
        self,
        command_buffer: vk::CommandBuffer,
        level: vk::CommandBufferLevel,
    ) -> CommandBufferSnapshot {
        CommandBufferSnapshot::new(command_buffer, level, self.commands, self.stats)
    }
}

impl<S: SecondarySnapshots + ?Sized> TimestampResolver<'_, S> {
    fn resolve_node(&mut self, id: CommandNodeId) -> Option<CommandTimestamps> {
        let source = self.source;
        self.current = id;
        self.resolved = None;
        source.node(id).command().accept(self);
        self.output.set_timestamps(id, self.resolved);
        self.resolved
    }

    fn next_timestamp(&mut self) -> u64 {
        let timestamp = self.timestamps.get(self.cursor).copied().unwrap_or(0);
        self.cursor += 1;
        timestamp
    }

    fn take_timestamps_if_profiled(&mut self) -> Option<CommandTimestamps> {
        if !self.source.node(self.current).is_profiled() {
            return None;
        }
        let begin = self.next_timestamp();
        let end = self.next_timestamp();
        Some(CommandTimestamps::new(begin, end))
    }
}

impl<S: SecondarySnapshots + ?Sized> CommandVisitor for TimestampResolver<'_, S> {
    fn visit_command(&mut self, command: &Command) {
        self.stats.record(command.kind());
        self.resolved = self.take_timestamps_if_profiled();
    }

    fn visit_group(&mut self, _command: &Command) {
        let source = self.source;
        let id = self.current;
        let own_begin = source.node(id).is_profiled().then(|| self.next_timestamp());
        let mut group_timestamps = GroupTimestamps::default();

        for &child in source.node(id).children() {
            if let Some(timestamps) = self.resolve_node(child) {
                group_timestamps.include(timestamps);
            }
        }

        self.current = id;
        self.resolved = match own_begin {
            Some(begin) => Some(CommandTimestamps::new(begin, self.next_timestamp())),
            None => group_timestamps.finish(),
        };
    }

    fn visit_execute_commands(&mut self, command: &Command, args: &ExecuteCommands) {
        self.stats.record(command.kind());
        let own_timestamps = self.take_timestamps_if_profiled();

        let mut group_timestamps = GroupTimestamps::default();
        let mut snapshots = Vec::with_capacity(args.command_buffers.len());

        for &command_buffer in &args.command_buffers {
            let Some(snapshot) = self.secondaries.secondary_snapshot(command_buffer) else {
                vkprof_log::debug!(
                    "No snapshot available for secondary command buffer {:?}",
                    command_buffer
                );
                continue;
            };
            if let Some(timestamps) = snapshot.timestamps() {
                group_timestamps.include(timestamps);
            }
            self.stats += *snapshot.stats();
            snapshots.push(snapshot);
        }

        self.output.replace_command(
            self.current,
            Command::ExecuteCommands(ExecuteCommands {
                command_buffers: args.command_buffers.clone(),
                snapshots,
            }),
        );
        self.resolved = own_timestamps.or_else(|| group_timestamps.finish());
    }
}

impl GroupTimestamps {
    fn include(&mut self, timestamps: CommandTimestamps) {
        if self.begin == 0 {
            self.begin = timestamps.begin;
        }
        self.end = self.end.max(timestamps.end);
    }

    fn finish(self) -> Option<CommandTimestamps> {
        (self.begin != 0 || self.end != 0).then_some(CommandTimestamps::new(self.begin, self.end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        builder::CommandTreeBuilder,
        command::{
            BeginRenderPass, BindPipeline, CommandKind, Dispatch, Draw, PipelineGroup, ShaderTuple,
        },
    };
    use ash::vk::Handle;
    use proptest::prelude::*;

    fn draw() -> Command {
        Command::Draw(Draw {
            vertex_count: 3,
            instance_count: 1,
            first_vertex: 0,
            first_instance: 0,
        })
    }

    fn dispatch() -> Command {
        Command::Dispatch(Dispatch {
            group_count_x: 4,
            group_count_y: 4,
            group_count_z: 1,
        })
    }

    fn graphics_group() -> Command {
        Command::PipelineGroup(PipelineGroup {
            bind_point: vk::PipelineBindPoint::GRAPHICS,
            bind: Some(BindPipeline {
                bind_point: vk::PipelineBindPoint::GRAPHICS,
                pipeline: vk::Pipeline::from_raw(1),
                shader_tuple: ShaderTuple::default(),
            }),
        })
    }

    fn execute(command_buffers: &[vk::CommandBuffer]) -> Command {
        Command::ExecuteCommands(ExecuteCommands {
            command_buffers: command_buffers.to_vec(),
            snapshots: Vec::new(),
        })
    }

    fn secondary_snapshot(command_buffer: vk::CommandBuffer) -> Arc<CommandBufferSnapshot> {
        let mut builder = CommandTreeBuilder::new(
            vk::CommandBufferLevel::SECONDARY,
            vk::CommandBufferUsageFlags::empty(),
        );
        builder.add(dispatch(), true).unwrap();
        builder.add(dispatch(), true).unwrap();
        let resolved = resolve_timestamps(&builder.finish(), &[100, 110, 120, 130], &NoSecondarySnapshots);
        Arc::new(resolved.into_snapshot(command_buffer, vk::CommandBufferLevel::SECONDARY))
    }

    #[test]
    fn group_begins_at_first_nonzero_begin_and_ends_at_latest_end() {
        let mut tree = CommandTree::new();
        let group = tree.push(CommandNodeId::ROOT, graphics_group(), false);
        for _ in 0..3 {
            tree.push(group, draw(), true);
        }

        let resolved = resolve_timestamps(&tree, &[0, 0, 10, 20, 5, 25], &NoSecondarySnapshots);

        assert_eq!(
            resolved.commands.node(group).timestamps(),
            Some(CommandTimestamps::new(10, 25))
        );
        assert_eq!(
            resolved.commands.root().timestamps(),
            Some(CommandTimestamps::new(10, 25))
        );
    }

    #[test]
    fn profiled_groups_take_timestamps_around_their_children() {
        let mut tree = CommandTree::new();
        tree.set_profiled(CommandNodeId::ROOT, true);
        let first_group = tree.push(CommandNodeId::ROOT, graphics_group(), true);
        let first_draw = tree.push(first_group, draw(), false);
        tree.push(first_group, draw(), false);
        let lone_dispatch = tree.push(CommandNodeId::ROOT, dispatch(), true);
        let second_group = tree.push(CommandNodeId::ROOT, graphics_group(), true);
        tree.push(second_group, draw(), false);

        let resolved =
            resolve_timestamps(&tree, &[1, 2, 3, 4, 5, 6, 7, 8], &NoSecondarySnapshots);

        assert_eq!(resolved.consumed_timestamps, 8);
        assert_eq!(
            resolved.commands.root().timestamps(),
            Some(CommandTimestamps::new(1, 8))
        );
        assert_eq!(
            resolved.commands.node(first_group).timestamps(),
            Some(CommandTimestamps::new(2, 3))
        );
        assert_eq!(resolved.commands.node(first_draw).timestamps(), None);
        assert_eq!(
            resolved.commands.node(lone_dispatch).timestamps(),
            Some(CommandTimestamps::new(4, 5))
        );
        assert_eq!(
            resolved.commands.node(second_group).timestamps(),
            Some(CommandTimestamps::new(6, 7))
        );
        assert_eq!(resolved.stats.draw_count, 3);
    }

    #[test]
    fn unprofiled_commands_take_no_timestamps() {
        let mut tree = CommandTree::new();
        let first = tree.push(CommandNodeId::ROOT, dispatch(), true);
        let skipped = tree.push(CommandNodeId::ROOT, dispatch(), false);
        let last = tree.push(CommandNodeId::ROOT, dispatch(), true);

        let resolved = resolve_timestamps(&tree, &[1, 2, 3, 4], &NoSecondarySnapshots);

        assert_eq!(resolved.consumed_timestamps, 4);
        assert_eq!(
            resolved.commands.node(first).timestamps(),
            Some(CommandTimestamps::new(1, 2))
        );
        assert_eq!(resolved.commands.node(skipped).timestamps(), None);
        assert_eq!(
            resolved.commands.node(last).timestamps(),
            Some(CommandTimestamps::new(3, 4))
        );
        assert_eq!(resolved.stats.dispatch_count, 3);
    }

    #[test]
    fn missing_timestamps_resolve_to_zero() {
        let mut tree = CommandTree::new();
        let first = tree.push(CommandNodeId::ROOT, dispatch(), true);
        let second = tree.push(CommandNodeId::ROOT, dispatch(), true);

        let resolved = resolve_timestamps(&tree, &[7, 9, 11], &NoSecondarySnapshots);

        assert_eq!(
            resolved.commands.node(first).timestamps(),
            Some(CommandTimestamps::new(7, 9))
        );
        assert_eq!(
            resolved.commands.node(second).timestamps(),
            Some(CommandTimestamps::new(11, 0))
        );
        assert_eq!(
            resolved.commands.root().timestamps(),
            Some(CommandTimestamps::new(7, 9))
        );
    }

    #[test]
    fn resolving_leaves_source_tree_untouched() {
        let mut tree = CommandTree::new();
        tree.push(CommandNodeId::ROOT, dispatch(), true);
        let original = tree.clone();

        let resolved = resolve_timestamps(&tree, &[1, 2], &NoSecondarySnapshots);

        assert_eq!(tree, original);
        assert_ne!(resolved.commands, original);
    }

    #[test]
    fn secondary_execution_contains_resolved_secondary_snapshot() {
        let secondary = vk::CommandBuffer::from_raw(20);
        let snapshot = secondary_snapshot(secondary);

        let mut builder = CommandTreeBuilder::new(
            vk::CommandBufferLevel::PRIMARY,
            vk::CommandBufferUsageFlags::empty(),
        );
        builder
            .add(
                Command::BeginRenderPass(BeginRenderPass {
                    render_pass: vk::RenderPass::from_raw(1),
                    framebuffer: vk::Framebuffer::from_raw(2),
                    contents: vk::SubpassContents::SECONDARY_COMMAND_BUFFERS,
                }),
                false,
            )
            .unwrap();
        let execute_node = builder.add(execute(&[secondary]), false).unwrap().unwrap();
        builder.add(Command::EndRenderPass, false).unwrap();
        let tree = builder.finish();

        let lookup = |command_buffer: vk::CommandBuffer| {
            (command_buffer == secondary).then(|| snapshot.clone())
        };
        let resolved = resolve_timestamps(&tree, &[], &lookup);

        let Command::ExecuteCommands(args) = resolved.commands.node(execute_node).command() else {
            panic!("Expected secondary command buffer execution");
        };
        assert_eq!(args.snapshots.len(), 1);
        assert!(Arc::ptr_eq(&args.snapshots[0], &snapshot));
        assert_eq!(
            args.snapshots[0].commands().node_count(),
            snapshot.commands().node_count()
        );
        assert_eq!(
            resolved.commands.node(execute_node).timestamps(),
            Some(CommandTimestamps::new(100, 130))
        );
        assert_eq!(
            resolved.commands.root().timestamps(),
            Some(CommandTimestamps::new(100, 130))
        );
        assert_eq!(resolved.stats.dispatch_count, 2);
        assert_eq!(resolved.consumed_timestamps, 0);
    }

    #[test]
    fn unknown_secondary_command_buffers_are_left_out() {
        let mut tree = CommandTree::new();
        let node = tree.push(
            CommandNodeId::ROOT,
            execute(&[vk::CommandBuffer::from_raw(5)]),
            false,
        );

        let resolved = resolve_timestamps(&tree, &[], &NoSecondarySnapshots);

        let Command::ExecuteCommands(args) = resolved.commands.node(node).command() else {
            panic!("Expected secondary command buffer execution");
        };
        assert_eq!(args.command_buffers.len(), 1);
        assert!(args.snapshots.is_empty());
        assert_eq!(resolved.commands.node(node).timestamps(), None);
        assert_eq!(
            resolved.commands.node(node).command().kind(),
            CommandKind::ExecuteCommands
        );
    }

    proptest! {
        #[test]
        fn profiled_commands_take_timestamp_pairs_in_recording_order(
            profiled in prop::collection::vec(any::<bool>(), 0..40),
        ) {
            let mut builder = CommandTreeBuilder::new(
                vk::CommandBufferLevel::PRIMARY,
                vk::CommandBufferUsageFlags::empty(),
            );
            for (idx, &is_profiled) in profiled.iter().enumerate() {
                let command = if idx % 3 == 0 { dispatch() } else { draw() };
                if idx % 3 == 0 {
                    builder.add(command, is_profiled).unwrap();
                } else {
                    if idx % 3 == 1 {
                        builder
                            .add(
                                Command::BeginRenderPass(BeginRenderPass {
                                    render_pass: vk::RenderPass::from_raw(1),
                                    framebuffer: vk::Framebuffer::from_raw(1),
                                    contents: vk::SubpassContents::INLINE,
                                }),
                                false,
                            )
                            .unwrap();
                    }
                    builder.add(command, is_profiled).unwrap();
                    if idx % 3 == 2 || idx + 1 == profiled.len() {
                        builder.add(Command::EndRenderPass, false).unwrap();
                    }
                }
            }
            let tree = builder.finish();

            let n_profiled = profiled.iter().filter(|&&is_profiled| is_profiled).count();
            let timestamps: Vec<u64> = (1..=2 * n_profiled as u64).collect();
            let resolved = resolve_timestamps(&tree, &timestamps, &NoSecondarySnapshots);

            prop_assert_eq!(resolved.consumed_timestamps, 2 * n_profiled);

            let leaf_timestamps: Vec<u64> = resolved
                .commands
                .leaves()
                .filter_map(|leaf| leaf.timestamps())
                .flat_map(|timestamps| [timestamps.begin, timestamps.end])
                .collect();
            prop_assert_eq!(leaf_timestamps, timestamps);
        }
    }
}
