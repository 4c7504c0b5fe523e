//! Visiting recorded commands by kind.

use crate::command::{
    BeginRenderPass, BindPipeline, ClearAttachments, ClearImage, Command, CopyBuffer,
    CopyBufferToImage, CopyImageToBuffer, DebugLabel, Dispatch, DispatchIndirect, Draw,
    DrawIndexed, DrawIndirect, DrawIndirectCount, ExecuteCommands, FillBuffer, ImageToImage,
    NextSubpass, PipelineBarrier, PipelineGroup, RenderPassGroup, SubpassGroup, UpdateBuffer,
};

/// Operation performed on commands depending on their kind.
///
/// [`Command::accept`] calls the method specific to the command's kind. By
/// default, each of these forwards to the method for the command's category,
/// which in turn forwards to more general categories until it reaches
/// [`Self::visit_command`], which does nothing. Implementors only override
/// the methods at the granularity they need. The categories are:
///
/// - groups: [`Self::visit_group`]
/// - debug labels: [`Self::visit_debug_label`], then
///   [`Self::visit_debug_command`]
/// - draws: [`Self::visit_graphics_command`], then
///   [`Self::visit_pipeline_command`]
/// - dispatches: [`Self::visit_compute_command`], then
///   [`Self::visit_pipeline_command`]
/// - clears: [`Self::visit_clear_command`], then
///   [`Self::visit_transfer_command`], then
///   [`Self::visit_internal_pipeline_command`]
/// - copies, blits, resolves, fills and updates:
///   [`Self::visit_transfer_command`], then
///   [`Self::visit_internal_pipeline_command`]
/// - render pass transitions and barriers:
///   [`Self::visit_internal_pipeline_command`]
/// - pipeline binds and secondary command buffer execution:
///   [`Self::visit_command`] directly
pub trait CommandVisitor {
    fn visit_command(&mut self, command: &Command) {
        let _ = command;
    }

    fn visit_group(&mut self, command: &Command) {
        self.visit_command(command);
    }

    fn visit_debug_command(&mut self, command: &Command) {
        self.visit_command(command);
    }

    fn visit_debug_label(&mut self, command: &Command) {
        self.visit_debug_command(command);
    }

    /// Commands executed by fixed-function parts of the GPU rather than by a
    /// bound pipeline.
    fn visit_internal_pipeline_command(&mut self, command: &Command) {
        self.visit_command(command);
    }

    /// Commands executed by the currently bound pipeline.
    fn visit_pipeline_command(&mut self, command: &Command) {
        self.visit_command(command);
    }

    fn visit_graphics_command(&mut self, command: &Command) {
        self.visit_pipeline_command(command);
    }

    fn visit_compute_command(&mut self, command: &Command) {
        self.visit_pipeline_command(command);
    }

    fn visit_transfer_command(&mut self, command: &Command) {
        self.visit_internal_pipeline_command(command);
    }

    fn visit_clear_command(&mut self, command: &Command) {
        self.visit_transfer_command(command);
    }

    fn visit_root_group(&mut self, command: &Command) {
        self.visit_group(command);
    }

    fn visit_render_pass_group(&mut self, command: &Command, group: &RenderPassGroup) {
        let _ = group;
        self.visit_group(command);
    }

    fn visit_subpass_group(&mut self, command: &Command, group: &SubpassGroup) {
        let _ = group;
        self.visit_group(command);
    }

    fn visit_pipeline_group(&mut self, command: &Command, group: &PipelineGroup) {
        let _ = group;
        self.visit_group(command);
    }

    fn visit_begin_debug_label(&mut self, command: &Command, label: &DebugLabel) {
        let _ = label;
        self.visit_debug_label(command);
    }

    fn visit_end_debug_label(&mut self, command: &Command) {
        self.visit_debug_label(command);
    }

    fn visit_insert_debug_label(&mut self, command: &Command, label: &DebugLabel) {
        let _ = label;
        self.visit_debug_label(command);
    }

    fn visit_begin_render_pass(&mut self, command: &Command, args: &BeginRenderPass) {
        let _ = args;
        self.visit_internal_pipeline_command(command);
    }

    fn visit_end_render_pass(&mut self, command: &Command) {
        self.visit_internal_pipeline_command(command);
    }

    fn visit_next_subpass(&mut self, command: &Command, args: &NextSubpass) {
        let _ = args;
        self.visit_internal_pipeline_command(command);
    }

    fn visit_bind_pipeline(&mut self, command: &Command, args: &BindPipeline) {
        let _ = args;
        self.visit_command(command);
    }

    fn visit_pipeline_barrier(&mut self, command: &Command, args: &PipelineBarrier) {
        let _ = args;
        self.visit_internal_pipeline_command(command);
    }

    fn visit_execute_commands(&mut self, command: &Command, args: &ExecuteCommands) {
        let _ = args;
        self.visit_command(command);
    }

    fn visit_draw(&mut self, command: &Command, args: &Draw) {
        let _ = args;
        self.visit_graphics_command(command);
    }

    fn visit_draw_indexed(&mut self, command: &Command, args: &DrawIndexed) {
        let _ = args;
        self.visit_graphics_command(command);
    }

    fn visit_draw_indirect(&mut self, command: &Command, args: &DrawIndirect) {
        let _ = args;
        self.visit_graphics_command(command);
    }

    fn visit_draw_indexed_indirect(&mut self, command: &Command, args: &DrawIndirect) {
        let _ = args;
        self.visit_graphics_command(command);
    }

    fn visit_draw_indirect_count(&mut self, command: &Command, args: &DrawIndirectCount) {
        let _ = args;
        self.visit_graphics_command(command);
    }

    fn visit_draw_indexed_indirect_count(&mut self, command: &Command, args: &DrawIndirectCount) {
        let _ = args;
        self.visit_graphics_command(command);
    }

    fn visit_dispatch(&mut self, command: &Command, args: &Dispatch) {
        let _ = args;
        self.visit_compute_command(command);
    }

    fn visit_dispatch_indirect(&mut self, command: &Command, args: &DispatchIndirect) {
        let _ = args;
        self.visit_compute_command(command);
    }

    fn visit_copy_buffer(&mut self, command: &Command, args: &CopyBuffer) {
        let _ = args;
        self.visit_transfer_command(command);
    }

    fn visit_copy_buffer_to_image(&mut self, command: &Command, args: &CopyBufferToImage) {
        let _ = args;
        self.visit_transfer_command(command);
    }

    fn visit_copy_image(&mut self, command: &Command, args: &ImageToImage) {
        let _ = args;
        self.visit_transfer_command(command);
    }

    fn visit_copy_image_to_buffer(&mut self, command: &Command, args: &CopyImageToBuffer) {
        let _ = args;
        self.visit_transfer_command(command);
    }

    fn visit_resolve_image(&mut self, command: &Command, args: &ImageToImage) {
        let _ = args;
        self.visit_transfer_command(command);
    }

    fn visit_blit_image(&mut self, command: &Command, args: &ImageToImage) {
        let _ = args;
        self.visit_transfer_command(command);
    }

    fn visit_update_buffer(&mut self, command: &Command, args: &UpdateBuffer) {
        let _ = args;
        self.visit_transfer_command(command);
    }

    fn visit_fill_buffer(&mut self, command: &Command, args: &FillBuffer) {
        let _ = args;
        self.visit_transfer_command(command);
    }

    fn visit_clear_attachments(&mut self, command: &Command, args: &ClearAttachments) {
        let _ = args;
        self.visit_clear_command(command);
    }

    fn visit_clear_color_image(&mut self, command: &Command, args: &ClearImage) {
        let _ = args;
        self.visit_clear_command(command);
    }

    fn visit_clear_depth_stencil_image(&mut self, command: &Command, args: &ClearImage) {
        let _ = args;
        self.visit_clear_command(command);
    }
}
