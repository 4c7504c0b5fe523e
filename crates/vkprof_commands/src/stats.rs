//! Counts of recorded commands.

use crate::command::CommandKind;
use std::ops::{Add, AddAssign};

/// Number of commands of each kind executed by a command buffer, including
/// those of the secondary command buffers it executes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CommandStats {
    pub draw_count: u32,
    pub draw_indirect_count: u32,
    pub dispatch_count: u32,
    pub dispatch_indirect_count: u32,
    pub copy_buffer_count: u32,
    pub copy_buffer_to_image_count: u32,
    pub copy_image_count: u32,
    pub copy_image_to_buffer_count: u32,
    pub clear_attachments_count: u32,
    pub clear_color_count: u32,
    pub clear_depth_stencil_count: u32,
    pub resolve_count: u32,
    pub blit_count: u32,
    pub fill_buffer_count: u32,
    pub update_buffer_count: u32,
    pub pipeline_barrier_count: u32,
    pub debug_label_count: u32,
}

impl CommandStats {
    /// Counts one command of the given kind. Kinds without a counter, like
    /// groups, are ignored.
    pub fn record(&mut self, kind: CommandKind) {
        let counter = match kind {
            CommandKind::Draw | CommandKind::DrawIndexed => &mut self.draw_count,
            CommandKind::DrawIndirect
            | CommandKind::DrawIndexedIndirect
            | CommandKind::DrawIndirectCount
            | CommandKind::DrawIndexedIndirectCount => &mut self.draw_indirect_count,
            CommandKind::Dispatch => &mut self.dispatch_count,
            CommandKind::DispatchIndirect => &mut self.dispatch_indirect_count,
            CommandKind::CopyBuffer => &mut self.copy_buffer_count,
            CommandKind::CopyBufferToImage => &mut self.copy_buffer_to_image_count,
            CommandKind::CopyImage => &mut self.copy_image_count,
            CommandKind::CopyImageToBuffer => &mut self.copy_image_to_buffer_count,
            CommandKind::ClearAttachments => &mut self.clear_attachments_count,
            CommandKind::ClearColorImage => &mut self.clear_color_count,
            CommandKind::ClearDepthStencilImage => &mut self.clear_depth_stencil_count,
            CommandKind::ResolveImage => &mut self.resolve_count,
            CommandKind::BlitImage => &mut self.blit_count,
            CommandKind::FillBuffer => &mut self.fill_buffer_count,
            CommandKind::UpdateBuffer => &mut self.update_buffer_count,
            CommandKind::PipelineBarrier => &mut self.pipeline_barrier_count,
            CommandKind::BeginDebugLabel | CommandKind::InsertDebugLabel => {
                &mut self.debug_label_count
            }
            CommandKind::RootGroup
            | CommandKind::RenderPassGroup
            | CommandKind::SubpassGroup
            | CommandKind::PipelineGroup
            | CommandKind::EndDebugLabel
            | CommandKind::BeginRenderPass
            | CommandKind::EndRenderPass
            | CommandKind::NextSubpass
            | CommandKind::BindPipeline
            | CommandKind::ExecuteCommands => return,
        };
        *counter += 1;
    }

    /// Returns the total number of draws of any kind.
    pub fn total_draw_count(&self) -> u32 {
        self.draw_count + self.draw_indirect_count
    }

    /// Returns the total number of dispatches of any kind.
    pub fn total_dispatch_count(&self) -> u32 {
        self.dispatch_count + self.dispatch_indirect_count
    }
}

impl AddAssign for CommandStats {
    fn add_assign(&mut self, other: Self) {
        self.draw_count += other.draw_count;
        self.draw_indirect_count += other.draw_indirect_count;
        self.dispatch_count += other.dispatch_count;
        self.dispatch_indirect_count += other.dispatch_indirect_count;
        self.copy_buffer_count += other.copy_buffer_count;
        self.copy_buffer_to_image_count += other.copy_buffer_to_image_count;
        self.copy_image_count += other.copy_image_count;
        self.copy_image_to_buffer_count += other.copy_image_to_buffer_count;
        self.clear_attachments_count += other.clear_attachments_count;
        self.clear_color_count += other.clear_color_count;
        self.clear_depth_stencil_count += other.clear_depth_stencil_count;
        self.resolve_count += other.resolve_count;
        self.blit_count += other.blit_count;
        self.fill_buffer_count += other.fill_buffer_count;
        self.update_buffer_count += other.update_buffer_count;
        self.pipeline_barrier_count += other.pipeline_barrier_count;
        self.debug_label_count += other.debug_label_count;
    }
}

impl Add for CommandStats {
    type Output = Self;

    fn add(mut self, other: Self) -> Self {
        self += other;
        self
    }
}
