//! Resolved command buffer data.

use crate::{
    stats::CommandStats,
    tree::{CommandTimestamps, CommandTree},
};
use ash::vk;

/// Immutable view of what a command buffer executed in its latest
/// submission, with resolved timestamps on its commands.
#[derive(Clone, Debug, PartialEq)]
pub struct CommandBufferSnapshot {
    command_buffer: vk::CommandBuffer,
    level: vk::CommandBufferLevel,
    commands: CommandTree,
    stats: CommandStats,
}

impl CommandBufferSnapshot {
    pub fn new(
        command_buffer: vk::CommandBuffer,
        level: vk::CommandBufferLevel,
        commands: CommandTree,
        stats: CommandStats,
    ) -> Self {
        Self {
            command_buffer,
            level,
            commands,
            stats,
        }
    }

    /// Creates a snapshot without any commands.
    pub fn empty(command_buffer: vk::CommandBuffer, level: vk::CommandBufferLevel) -> Self {
        Self::new(
            command_buffer,
            level,
            CommandTree::new(),
            CommandStats::default(),
        )
    }

    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    pub fn level(&self) -> vk::CommandBufferLevel {
        self.level
    }

    pub fn commands(&self) -> &CommandTree {
        &self.commands
    }

    pub fn stats(&self) -> &CommandStats {
        &self.stats
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Returns the timestamps of the whole command buffer, if any of its
    /// commands were timed.
    pub fn timestamps(&self) -> Option<CommandTimestamps> {
        self.commands.root().timestamps()
    }
}
