//! Recorded commands and their arguments.

use crate::{snapshot::CommandBufferSnapshot, visitor::CommandVisitor};
use ash::vk;
use bitflags::bitflags;
use std::sync::Arc;

bitflags! {
    /// Whether a command may be recorded inside a render pass, outside one,
    /// or both.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct RenderPassScope: u8 {
        const INSIDE = 1 << 0;
        const OUTSIDE = 1 << 1;
        const BOTH = Self::INSIDE.bits() | Self::OUTSIDE.bits();
    }
}

/// Identifies the kind of a [`Command`] without its arguments.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CommandKind {
    RootGroup,
    RenderPassGroup,
    SubpassGroup,
    PipelineGroup,
    BeginDebugLabel,
    EndDebugLabel,
    InsertDebugLabel,
    BeginRenderPass,
    EndRenderPass,
    NextSubpass,
    BindPipeline,
    PipelineBarrier,
    ExecuteCommands,
    Draw,
    DrawIndexed,
    DrawIndirect,
    DrawIndexedIndirect,
    DrawIndirectCount,
    DrawIndexedIndirectCount,
    Dispatch,
    DispatchIndirect,
    CopyBuffer,
    CopyBufferToImage,
    CopyImage,
    CopyImageToBuffer,
    ResolveImage,
    BlitImage,
    UpdateBuffer,
    FillBuffer,
    ClearAttachments,
    ClearColorImage,
    ClearDepthStencilImage,
}

/// A command recorded into a command buffer, or a group of such commands.
///
/// Groups are created by the [`CommandTreeBuilder`](crate::builder::CommandTreeBuilder)
/// to reflect the render pass, subpass and pipeline state that the commands
/// were recorded under. All other variants mirror a single API call.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    RootGroup,
    RenderPassGroup(RenderPassGroup),
    SubpassGroup(SubpassGroup),
    PipelineGroup(PipelineGroup),
    BeginDebugLabel(DebugLabel),
    EndDebugLabel,
    InsertDebugLabel(DebugLabel),
    BeginRenderPass(BeginRenderPass),
    EndRenderPass,
    NextSubpass(NextSubpass),
    BindPipeline(BindPipeline),
    PipelineBarrier(PipelineBarrier),
    ExecuteCommands(ExecuteCommands),
    Draw(Draw),
    DrawIndexed(DrawIndexed),
    DrawIndirect(DrawIndirect),
    DrawIndexedIndirect(DrawIndirect),
    DrawIndirectCount(DrawIndirectCount),
    DrawIndexedIndirectCount(DrawIndirectCount),
    Dispatch(Dispatch),
    DispatchIndirect(DispatchIndirect),
    CopyBuffer(CopyBuffer),
    CopyBufferToImage(CopyBufferToImage),
    CopyImage(ImageToImage),
    CopyImageToBuffer(CopyImageToBuffer),
    ResolveImage(ImageToImage),
    BlitImage(ImageToImage),
    UpdateBuffer(UpdateBuffer),
    FillBuffer(FillBuffer),
    ClearAttachments(ClearAttachments),
    ClearColorImage(ClearImage),
    ClearDepthStencilImage(ClearImage),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RenderPassGroup {
    pub render_pass: vk::RenderPass,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubpassGroup {
    pub index: u32,
    pub contents: vk::SubpassContents,
}

/// Commands recorded consecutively while the same pipeline was bound.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PipelineGroup {
    pub bind_point: vk::PipelineBindPoint,
    /// The bind command of the pipeline, or [`None`] if the commands were
    /// recorded without a pipeline bound in this command buffer.
    pub bind: Option<BindPipeline>,
}

/// Fingerprint of the shader modules making up a pipeline.
///
/// `hash` identifies the combination as a whole, while the per-stage fields
/// hold the hashes of the individual modules, or zero for unused stages.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ShaderTuple {
    pub hash: u32,
    pub vertex: u32,
    pub tessellation_control: u32,
    pub tessellation_evaluation: u32,
    pub geometry: u32,
    pub fragment: u32,
    pub compute: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DebugLabel {
    pub name: String,
    pub color: [f32; 4],
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BeginRenderPass {
    pub render_pass: vk::RenderPass,
    pub framebuffer: vk::Framebuffer,
    pub contents: vk::SubpassContents,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NextSubpass {
    pub contents: vk::SubpassContents,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BindPipeline {
    pub bind_point: vk::PipelineBindPoint,
    pub pipeline: vk::Pipeline,
    pub shader_tuple: ShaderTuple,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PipelineBarrier {
    pub src_stage_mask: vk::PipelineStageFlags,
    pub dst_stage_mask: vk::PipelineStageFlags,
    pub dependency_flags: vk::DependencyFlags,
    pub memory_barrier_count: u32,
    pub buffer_memory_barrier_count: u32,
    pub image_memory_barrier_count: u32,
}

/// Execution of secondary command buffers.
///
/// While recording, only the handles are known. Resolution fills in
/// `snapshots` with the resolved snapshot of each secondary command buffer,
/// in the same order as `command_buffers`, leaving out any that could not be
/// found.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExecuteCommands {
    pub command_buffers: Vec<vk::CommandBuffer>,
    pub snapshots: Vec<Arc<CommandBufferSnapshot>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Draw {
    pub vertex_count: u32,
    pub instance_count: u32,
    pub first_vertex: u32,
    pub first_instance: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DrawIndexed {
    pub index_count: u32,
    pub instance_count: u32,
    pub first_index: u32,
    pub vertex_offset: i32,
    pub first_instance: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DrawIndirect {
    pub buffer: vk::Buffer,
    pub offset: vk::DeviceSize,
    pub draw_count: u32,
    pub stride: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DrawIndirectCount {
    pub buffer: vk::Buffer,
    pub offset: vk::DeviceSize,
    pub count_buffer: vk::Buffer,
    pub count_buffer_offset: vk::DeviceSize,
    pub max_draw_count: u32,
    pub stride: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Dispatch {
    pub group_count_x: u32,
    pub group_count_y: u32,
    pub group_count_z: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DispatchIndirect {
    pub buffer: vk::Buffer,
    pub offset: vk::DeviceSize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CopyBuffer {
    pub src_buffer: vk::Buffer,
    pub dst_buffer: vk::Buffer,
    pub region_count: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CopyBufferToImage {
    pub src_buffer: vk::Buffer,
    pub dst_image: vk::Image,
    pub region_count: u32,
}

/// Arguments of copies, blits and resolves between images.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ImageToImage {
    pub src_image: vk::Image,
    pub dst_image: vk::Image,
    pub region_count: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CopyImageToBuffer {
    pub src_image: vk::Image,
    pub dst_buffer: vk::Buffer,
    pub region_count: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct UpdateBuffer {
    pub dst_buffer: vk::Buffer,
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FillBuffer {
    pub dst_buffer: vk::Buffer,
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
    pub data: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ClearAttachments {
    pub attachment_count: u32,
    pub rect_count: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ClearImage {
    pub image: vk::Image,
    pub range_count: u32,
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Self::RootGroup => CommandKind::RootGroup,
            Self::RenderPassGroup(_) => CommandKind::RenderPassGroup,
            Self::SubpassGroup(_) => CommandKind::SubpassGroup,
            Self::PipelineGroup(_) => CommandKind::PipelineGroup,
            Self::BeginDebugLabel(_) => CommandKind::BeginDebugLabel,
            Self::EndDebugLabel => CommandKind::EndDebugLabel,
            Self::InsertDebugLabel(_) => CommandKind::InsertDebugLabel,
            Self::BeginRenderPass(_) => CommandKind::BeginRenderPass,
            Self::EndRenderPass => CommandKind::EndRenderPass,
            Self::NextSubpass(_) => CommandKind::NextSubpass,
            Self::BindPipeline(_) => CommandKind::BindPipeline,
            Self::PipelineBarrier(_) => CommandKind::PipelineBarrier,
            Self::ExecuteCommands(_) => CommandKind::ExecuteCommands,
            Self::Draw(_) => CommandKind::Draw,
            Self::DrawIndexed(_) => CommandKind::DrawIndexed,
            Self::DrawIndirect(_) => CommandKind::DrawIndirect,
            Self::DrawIndexedIndirect(_) => CommandKind::DrawIndexedIndirect,
            Self::DrawIndirectCount(_) => CommandKind::DrawIndirectCount,
            Self::DrawIndexedIndirectCount(_) => CommandKind::DrawIndexedIndirectCount,
            Self::Dispatch(_) => CommandKind::Dispatch,
            Self::DispatchIndirect(_) => CommandKind::DispatchIndirect,
            Self::CopyBuffer(_) => CommandKind::CopyBuffer,
            Self::CopyBufferToImage(_) => CommandKind::CopyBufferToImage,
            Self::CopyImage(_) => CommandKind::CopyImage,
            Self::CopyImageToBuffer(_) => CommandKind::CopyImageToBuffer,
            Self::ResolveImage(_) => CommandKind::ResolveImage,
            Self::BlitImage(_) => CommandKind::BlitImage,
            Self::UpdateBuffer(_) => CommandKind::UpdateBuffer,
            Self::FillBuffer(_) => CommandKind::FillBuffer,
            Self::ClearAttachments(_) => CommandKind::ClearAttachments,
            Self::ClearColorImage(_) => CommandKind::ClearColorImage,
            Self::ClearDepthStencilImage(_) => CommandKind::ClearDepthStencilImage,
        }
    }

    /// Whether this is one of the group variants, which may have children.
    pub fn is_group(&self) -> bool {
        self.kind().is_group()
    }

    pub fn render_pass_scope(&self) -> RenderPassScope {
        self.kind().render_pass_scope()
    }

    /// Returns the bind point whose pipeline this command executes, if any.
    pub fn pipeline_bind_point(&self) -> Option<vk::PipelineBindPoint> {
        match self {
            Self::PipelineGroup(group) => Some(group.bind_point),
            Self::BindPipeline(bind) => Some(bind.bind_point),
            _ => self.kind().pipeline_bind_point(),
        }
    }

    /// Calls the most specific method of the visitor for this command. See
    /// [`CommandVisitor`] for how the methods fall back to more general
    /// ones.
    pub fn accept<V: CommandVisitor + ?Sized>(&self, visitor: &mut V) {
        match self {
            Self::RootGroup => visitor.visit_root_group(self),
            Self::RenderPassGroup(group) => visitor.visit_render_pass_group(self, group),
            Self::SubpassGroup(group) => visitor.visit_subpass_group(self, group),
            Self::PipelineGroup(group) => visitor.visit_pipeline_group(self, group),
            Self::BeginDebugLabel(label) => visitor.visit_begin_debug_label(self, label),
            Self::EndDebugLabel => visitor.visit_end_debug_label(self),
            Self::InsertDebugLabel(label) => visitor.visit_insert_debug_label(self, label),
            Self::BeginRenderPass(args) => visitor.visit_begin_render_pass(self, args),
            Self::EndRenderPass => visitor.visit_end_render_pass(self),
            Self::NextSubpass(args) => visitor.visit_next_subpass(self, args),
            Self::BindPipeline(args) => visitor.visit_bind_pipeline(self, args),
            Self::PipelineBarrier(args) => visitor.visit_pipeline_barrier(self, args),
            Self::ExecuteCommands(args) => visitor.visit_execute_commands(self, args),
            Self::Draw(args) => visitor.visit_draw(self, args),
            Self::DrawIndexed(args) => visitor.visit_draw_indexed(self, args),
            Self::DrawIndirect(args) => visitor.visit_draw_indirect(self, args),
            Self::DrawIndexedIndirect(args) => visitor.visit_draw_indexed_indirect(self, args),
            Self::DrawIndirectCount(args) => visitor.visit_draw_indirect_count(self, args),
            Self::DrawIndexedIndirectCount(args) => {
                visitor.visit_draw_indexed_indirect_count(self, args);
            }
            Self::Dispatch(args) => visitor.visit_dispatch(self, args),
            Self::DispatchIndirect(args) => visitor.visit_dispatch_indirect(self, args),
            Self::CopyBuffer(args) => visitor.visit_copy_buffer(self, args),
            Self::CopyBufferToImage(args) => visitor.visit_copy_buffer_to_image(self, args),
            Self::CopyImage(args) => visitor.visit_copy_image(self, args),
            Self::CopyImageToBuffer(args) => visitor.visit_copy_image_to_buffer(self, args),
            Self::ResolveImage(args) => visitor.visit_resolve_image(self, args),
            Self::BlitImage(args) => visitor.visit_blit_image(self, args),
            Self::UpdateBuffer(args) => visitor.visit_update_buffer(self, args),
            Self::FillBuffer(args) => visitor.visit_fill_buffer(self, args),
            Self::ClearAttachments(args) => visitor.visit_clear_attachments(self, args),
            Self::ClearColorImage(args) => visitor.visit_clear_color_image(self, args),
            Self::ClearDepthStencilImage(args) => {
                visitor.visit_clear_depth_stencil_image(self, args);
            }
        }
    }
}

impl CommandKind {
    pub fn is_group(self) -> bool {
        matches!(
            self,
            Self::RootGroup | Self::RenderPassGroup | Self::SubpassGroup | Self::PipelineGroup
        )
    }

    pub fn render_pass_scope(self) -> RenderPassScope {
        match self {
            Self::SubpassGroup
            | Self::EndRenderPass
            | Self::NextSubpass
            | Self::Draw
            | Self::DrawIndexed
            | Self::DrawIndirect
            | Self::DrawIndexedIndirect
            | Self::DrawIndirectCount
            | Self::DrawIndexedIndirectCount
            | Self::ClearAttachments => RenderPassScope::INSIDE,
            Self::RenderPassGroup
            | Self::BeginRenderPass
            | Self::Dispatch
            | Self::DispatchIndirect
            | Self::CopyBuffer
            | Self::CopyBufferToImage
            | Self::CopyImage
            | Self::CopyImageToBuffer
            | Self::ResolveImage
            | Self::BlitImage
            | Self::UpdateBuffer
            | Self::FillBuffer
            | Self::ClearColorImage
            | Self::ClearDepthStencilImage => RenderPassScope::OUTSIDE,
            Self::RootGroup
            | Self::PipelineGroup
            | Self::BeginDebugLabel
            | Self::EndDebugLabel
            | Self::InsertDebugLabel
            | Self::BindPipeline
            | Self::PipelineBarrier
            | Self::ExecuteCommands => RenderPassScope::BOTH,
        }
    }

    /// Returns the bind point of the pipeline that commands of this kind
    /// execute, or [`None`] for kinds that do not depend on a bound
    /// pipeline or whose bind point depends on their arguments.
    pub fn pipeline_bind_point(self) -> Option<vk::PipelineBindPoint> {
        match self {
            Self::Draw
            | Self::DrawIndexed
            | Self::DrawIndirect
            | Self::DrawIndexedIndirect
            | Self::DrawIndirectCount
            | Self::DrawIndexedIndirectCount => Some(vk::PipelineBindPoint::GRAPHICS),
            Self::Dispatch | Self::DispatchIndirect => Some(vk::PipelineBindPoint::COMPUTE),
            _ => None,
        }
    }

    /// Name of the API call that records commands of this kind, or of the
    /// group for group kinds.
    pub fn name(self) -> &'static str {
        match self {
            Self::RootGroup => "Command buffer",
            Self::RenderPassGroup => "Render pass",
            Self::SubpassGroup => "Subpass",
            Self::PipelineGroup => "Pipeline",
            Self::BeginDebugLabel => "vkCmdBeginDebugUtilsLabelEXT",
            Self::EndDebugLabel => "vkCmdEndDebugUtilsLabelEXT",
            Self::InsertDebugLabel => "vkCmdInsertDebugUtilsLabelEXT",
            Self::BeginRenderPass => "vkCmdBeginRenderPass",
            Self::EndRenderPass => "vkCmdEndRenderPass",
            Self::NextSubpass => "vkCmdNextSubpass",
            Self::BindPipeline => "vkCmdBindPipeline",
            Self::PipelineBarrier => "vkCmdPipelineBarrier",
            Self::ExecuteCommands => "vkCmdExecuteCommands",
            Self::Draw => "vkCmdDraw",
            Self::DrawIndexed => "vkCmdDrawIndexed",
            Self::DrawIndirect => "vkCmdDrawIndirect",
            Self::DrawIndexedIndirect => "vkCmdDrawIndexedIndirect",
            Self::DrawIndirectCount => "vkCmdDrawIndirectCount",
            Self::DrawIndexedIndirectCount => "vkCmdDrawIndexedIndirectCount",
            Self::Dispatch => "vkCmdDispatch",
            Self::DispatchIndirect => "vkCmdDispatchIndirect",
            Self::CopyBuffer => "vkCmdCopyBuffer",
            Self::CopyBufferToImage => "vkCmdCopyBufferToImage",
            Self::CopyImage => "vkCmdCopyImage",
            Self::CopyImageToBuffer => "vkCmdCopyImageToBuffer",
            Self::ResolveImage => "vkCmdResolveImage",
            Self::BlitImage => "vkCmdBlitImage",
            Self::UpdateBuffer => "vkCmdUpdateBuffer",
            Self::FillBuffer => "vkCmdFillBuffer",
            Self::ClearAttachments => "vkCmdClearAttachments",
            Self::ClearColorImage => "vkCmdClearColorImage",
            Self::ClearDepthStencilImage => "vkCmdClearDepthStencilImage",
        }
    }
}

impl PipelineGroup {
    /// Returns the shader fingerprint of the bound pipeline, or the default
    /// fingerprint if no pipeline was bound.
    pub fn shader_tuple(&self) -> ShaderTuple {
        self.bind
            .map(|bind| bind.shader_tuple)
            .unwrap_or_default()
    }

    /// Whether commands executed with the given pipeline bound belong to
    /// this group.
    pub fn matches(&self, bind_point: vk::PipelineBindPoint, bind: Option<&BindPipeline>) -> bool {
        self.bind_point == bind_point && self.bind.as_ref() == bind
    }
}
