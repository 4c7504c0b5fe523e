//! Incremental construction of command trees during recording.

use crate::{
    command::{
        BeginRenderPass, BindPipeline, Command, NextSubpass, PipelineGroup, RenderPassGroup,
        RenderPassScope, SubpassGroup,
    },
    tree::{CommandNodeId, CommandTree},
    visitor::CommandVisitor,
};
use ash::vk;
use thiserror::Error;

/// A command that is not valid in the current recording state of a
/// [`CommandTreeBuilder`].
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum CommandSequenceError {
    #[error("render pass begun while another render pass is active")]
    RenderPassAlreadyActive,
    #[error("{0} recorded without an active render pass")]
    NoActiveRenderPass(&'static str),
    #[error("{0} recorded inside a render pass")]
    InsideRenderPass(&'static str),
    #[error("{0} can not be recorded directly")]
    NotRecordable(&'static str),
}

/// Where and how a command will be inserted into the tree. Obtained from
/// [`CommandTreeBuilder::plan`] before the command is recorded, and consumed
/// by [`CommandTreeBuilder::insert`] afterwards.
///
/// The placement also tells which pipeline group transitions the insertion
/// causes, so that queries bracketing the groups can be written before the
/// command is recorded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommandPlacement {
    action: PlacementAction,
    sealed_pipeline_group: Option<CommandNodeId>,
    opens_pipeline_group: bool,
    profiled_pipeline_group: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PlacementAction {
    BeginRenderPass(BeginRenderPass),
    EndRenderPass,
    NextSubpass(NextSubpass),
    BindPipeline(BindPipeline),
    /// Appended to the pipeline group for the given bind point, which is
    /// opened if the currently bound pipeline differs from the open group.
    Pipeline(vk::PipelineBindPoint),
    /// Appended to the current subpass or root, sealing the open pipeline
    /// group.
    Sealing,
    /// Appended to the innermost open group, keeping any pipeline group open.
    Inline,
}

/// Whether the recording is currently inside a render pass, and how the
/// current subpass records its contents.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordingScope {
    pub in_render_pass: bool,
    pub subpass_contents: vk::SubpassContents,
}

/// Builds the [`CommandTree`] of a command buffer from the commands recorded
/// into it.
///
/// The builder tracks the render pass, subpass and bound pipelines of the
/// recording. Commands recorded inside a render pass are placed in a
/// subpass group under a render pass group. Commands executed by a bound
/// pipeline are batched in pipeline groups, which are only reopened when the
/// bound pipeline changes. Other commands executed by the GPU seal the
/// current pipeline group.
#[derive(Debug)]
pub struct CommandTreeBuilder {
    tree: CommandTree,
    render_pass: Option<CommandNodeId>,
    subpass: Option<CommandNodeId>,
    subpass_index: u32,
    subpass_contents: vk::SubpassContents,
    pipeline_group: Option<CommandNodeId>,
    graphics_pipeline: Option<BindPipeline>,
    compute_pipeline: Option<BindPipeline>,
}

impl CommandPlacement {
    /// Returns the open pipeline group that will be sealed when the command
    /// is inserted, if any.
    pub fn sealed_pipeline_group(&self) -> Option<CommandNodeId> {
        self.sealed_pipeline_group
    }

    /// Whether a new pipeline group will be opened for the command.
    pub fn opens_pipeline_group(&self) -> bool {
        self.opens_pipeline_group
    }

    /// Sets whether the pipeline group opened for the command gets timestamp
    /// queries of its own. Ignored if no group is opened.
    pub fn with_profiled_pipeline_group(mut self, profiled: bool) -> Self {
        self.profiled_pipeline_group = profiled && self.opens_pipeline_group;
        self
    }
}

struct PlacementPlanner<'a> {
    builder: &'a CommandTreeBuilder,
    result: Result<PlacementAction, CommandSequenceError>,
}

impl CommandTreeBuilder {
    /// Creates a builder for a recording with the given usage flags. If the
    /// recording continues a render pass, the root of the tree acts as the
    /// subpass the commands are recorded into.
    pub fn new(level: vk::CommandBufferLevel, usage: vk::CommandBufferUsageFlags) -> Self {
        let continues_render_pass = level == vk::CommandBufferLevel::SECONDARY
            && usage.contains(vk::CommandBufferUsageFlags::RENDER_PASS_CONTINUE);

        Self {
            tree: CommandTree::new(),
            render_pass: None,
            subpass: continues_render_pass.then_some(CommandNodeId::ROOT),
            subpass_index: 0,
            subpass_contents: vk::SubpassContents::INLINE,
            pipeline_group: None,
            graphics_pipeline: None,
            compute_pipeline: None,
        }
    }

    pub fn tree(&self) -> &CommandTree {
        &self.tree
    }

    /// Returns the pipeline group that new commands for the bound pipeline
    /// are appended to, if any.
    pub fn open_pipeline_group(&self) -> Option<CommandNodeId> {
        self.pipeline_group
    }

    /// Marks the root of the tree as having timestamp queries of its own,
    /// written at the beginning and end of the recording.
    pub fn set_root_profiled(&mut self) {
        self.tree.set_profiled(CommandNodeId::ROOT, true);
    }

    /// Returns the completed tree.
    pub fn finish(self) -> CommandTree {
        if self.render_pass.is_some() {
            vkprof_log::debug!("Command buffer recording ended inside a render pass");
        }
        self.tree
    }

    pub fn scope(&self) -> RecordingScope {
        RecordingScope {
            in_render_pass: self.subpass.is_some(),
            subpass_contents: self.subpass_contents,
        }
    }

    /// Determines where the command will be placed, without modifying the
    /// tree.
    ///
    /// # Errors
    /// Returns an error if the command is not valid in the current state,
    /// for example when a subpass is advanced outside of a render pass, a
    /// transfer is recorded inside one, or a group command is given.
    pub fn plan(&self, command: &Command) -> Result<CommandPlacement, CommandSequenceError> {
        let mut planner = PlacementPlanner {
            builder: self,
            result: Err(CommandSequenceError::NotRecordable(command.kind().name())),
        };
        command.accept(&mut planner);
        let action = planner.result?;

        let scope = command.render_pass_scope();
        if self.subpass.is_some() && !scope.contains(RenderPassScope::INSIDE) {
            return Err(CommandSequenceError::InsideRenderPass(
                command.kind().name(),
            ));
        }
        if self.subpass.is_none() && !scope.contains(RenderPassScope::OUTSIDE) {
            return Err(CommandSequenceError::NoActiveRenderPass(
                command.kind().name(),
            ));
        }

        let (sealed_pipeline_group, opens_pipeline_group) = match action {
            PlacementAction::Pipeline(bind_point) => {
                if self.open_pipeline_group_matches(bind_point) {
                    (None, false)
                } else {
                    (self.pipeline_group, true)
                }
            }
            PlacementAction::BeginRenderPass(_)
            | PlacementAction::EndRenderPass
            | PlacementAction::NextSubpass(_)
            | PlacementAction::Sealing => (self.pipeline_group, false),
            PlacementAction::BindPipeline(_) | PlacementAction::Inline => (None, false),
        };

        Ok(CommandPlacement {
            action,
            sealed_pipeline_group,
            opens_pipeline_group,
            profiled_pipeline_group: false,
        })
    }

    /// Inserts the command according to a placement obtained from
    /// [`Self::plan`] in the current state, and returns the ID of the
    /// inserted node. Commands that only change the recording state, like
    /// pipeline binds and subpass transitions, get no node of their own and
    /// [`None`] is returned.
    pub fn insert(
        &mut self,
        command: Command,
        placement: CommandPlacement,
        profiled: bool,
    ) -> Option<CommandNodeId> {
        match placement.action {
            PlacementAction::BeginRenderPass(args) => {
                let render_pass = self.tree.push(
                    CommandNodeId::ROOT,
                    Command::RenderPassGroup(RenderPassGroup {
                        render_pass: args.render_pass,
                    }),
                    false,
                );
                let begin = self.tree.push(render_pass, command, profiled);
                self.render_pass = Some(render_pass);
                self.pipeline_group = None;
                self.open_subpass(render_pass, 0, args.contents);
                Some(begin)
            }
            PlacementAction::EndRenderPass => {
                let render_pass = self.render_pass.take()?;
                let end = self.tree.push(render_pass, command, profiled);
                self.subpass = None;
                self.subpass_index = 0;
                self.subpass_contents = vk::SubpassContents::INLINE;
                self.pipeline_group = None;
                Some(end)
            }
            PlacementAction::NextSubpass(args) => {
                let render_pass = self.render_pass?;
                self.open_subpass(render_pass, self.subpass_index + 1, args.contents);
                None
            }
            PlacementAction::BindPipeline(bind) => {
                if bind.bind_point == vk::PipelineBindPoint::GRAPHICS {
                    self.graphics_pipeline = Some(bind);
                } else if bind.bind_point == vk::PipelineBindPoint::COMPUTE {
                    self.compute_pipeline = Some(bind);
                } else {
                    vkprof_log::debug!(
                        "Ignoring pipeline bound to unsupported bind point {:?}",
                        bind.bind_point
                    );
                }
                None
            }
            PlacementAction::Pipeline(bind_point) => {
                let group = self.pipeline_group_for(bind_point, placement.profiled_pipeline_group);
                Some(self.tree.push(group, command, profiled))
            }
            PlacementAction::Sealing => {
                self.pipeline_group = None;
                let container = self.container();
                Some(self.tree.push(container, command, profiled))
            }
            PlacementAction::Inline => {
                let parent = self.pipeline_group.unwrap_or_else(|| self.container());
                Some(self.tree.push(parent, command, profiled))
            }
        }
    }

    /// Plans and inserts the command in one step. See [`Self::plan`] and
    /// [`Self::insert`].
    ///
    /// # Errors
    /// Returns an error if the command is not valid in the current state, in
    /// which case the tree is left unchanged.
    pub fn add(
        &mut self,
        command: Command,
        profiled: bool,
    ) -> Result<Option<CommandNodeId>, CommandSequenceError> {
        let placement = self.plan(&command)?;
        Ok(self.insert(command, placement, profiled))
    }

    fn container(&self) -> CommandNodeId {
        self.subpass.unwrap_or(CommandNodeId::ROOT)
    }

    fn open_subpass(
        &mut self,
        render_pass: CommandNodeId,
        index: u32,
        contents: vk::SubpassContents,
    ) {
        let subpass = self.tree.push(
            render_pass,
            Command::SubpassGroup(SubpassGroup { index, contents }),
            false,
        );
        self.subpass = Some(subpass);
        self.subpass_index = index;
        self.subpass_contents = contents;
        self.pipeline_group = None;
    }

    fn bound_pipeline(&self, bind_point: vk::PipelineBindPoint) -> Option<&BindPipeline> {
        if bind_point == vk::PipelineBindPoint::GRAPHICS {
            self.graphics_pipeline.as_ref()
        } else if bind_point == vk::PipelineBindPoint::COMPUTE {
            self.compute_pipeline.as_ref()
        } else {
            None
        }
    }

    fn open_pipeline_group_matches(&self, bind_point: vk::PipelineBindPoint) -> bool {
        self.pipeline_group.is_some_and(|group| {
            matches!(
                self.tree.node(group).command(),
                Command::PipelineGroup(open) if open.matches(bind_point, self.bound_pipeline(bind_point))
            )
        })
    }

    fn pipeline_group_for(
        &mut self,
        bind_point: vk::PipelineBindPoint,
        profiled: bool,
    ) -> CommandNodeId {
        if let Some(group) = self.pipeline_group
            && self.open_pipeline_group_matches(bind_point)
        {
            return group;
        }

        let bound = self.bound_pipeline(bind_point).copied();
        let container = self.container();
        let group = self.tree.push(
            container,
            Command::PipelineGroup(PipelineGroup {
                bind_point,
                bind: bound,
            }),
            profiled,
        );
        self.pipeline_group = Some(group);
        group
    }
}

impl PlacementPlanner<'_> {
    fn require_render_pass(&mut self, command: &Command, action: PlacementAction) {
        self.result = if self.builder.render_pass.is_some() {
            Ok(action)
        } else {
            Err(CommandSequenceError::NoActiveRenderPass(
                command.kind().name(),
            ))
        };
    }
}

impl CommandVisitor for PlacementPlanner<'_> {
    fn visit_command(&mut self, _command: &Command) {
        self.result = Ok(PlacementAction::Sealing);
    }

    fn visit_group(&mut self, command: &Command) {
        self.result = Err(CommandSequenceError::NotRecordable(command.kind().name()));
    }

    fn visit_debug_command(&mut self, _command: &Command) {
        self.result = Ok(PlacementAction::Inline);
    }

    fn visit_internal_pipeline_command(&mut self, _command: &Command) {
        self.result = Ok(PlacementAction::Sealing);
    }

    fn visit_pipeline_command(&mut self, command: &Command) {
        self.result = Ok(match command.pipeline_bind_point() {
            Some(bind_point) => PlacementAction::Pipeline(bind_point),
            None => PlacementAction::Sealing,
        });
    }

    fn visit_begin_render_pass(&mut self, _command: &Command, args: &BeginRenderPass) {
        self.result = if self.builder.subpass.is_some() {
            Err(CommandSequenceError::RenderPassAlreadyActive)
        } else {
            Ok(PlacementAction::BeginRenderPass(*args))
        };
    }

    fn visit_end_render_pass(&mut self, command: &Command) {
        self.require_render_pass(command, PlacementAction::EndRenderPass);
    }

    fn visit_next_subpass(&mut self, command: &Command, args: &NextSubpass) {
        self.require_render_pass(command, PlacementAction::NextSubpass(*args));
    }

    fn visit_bind_pipeline(&mut self, _command: &Command, args: &BindPipeline) {
        self.result = Ok(PlacementAction::BindPipeline(*args));
    }
}
