//! Vulkan 后端使用的 barrier 翻译
//!
//! 把解析后的 [`ResolvedBarrier`] 翻译为 synchronization2 的 `vk::BufferMemoryBarrier2` /
//! `vk::ImageMemoryBarrier2`。具体的 `vk::Buffer` / `vk::Image` 由后端自己的资源表提供。

use ash::vk;

use crate::commands::barrier::{BarrierAccess, BarrierLayout, BarrierSync, ResolvedBarrier};

impl BarrierSync {
    pub fn to_vk(self) -> vk::PipelineStageFlags2 {
        const TABLE: &[(BarrierSync, vk::PipelineStageFlags2)] = &[
            (BarrierSync::ALL, vk::PipelineStageFlags2::ALL_COMMANDS),
            (BarrierSync::DRAW, vk::PipelineStageFlags2::ALL_GRAPHICS),
            (BarrierSync::INDEX_INPUT, vk::PipelineStageFlags2::INDEX_INPUT),
            (BarrierSync::VERTEX_SHADING, vk::PipelineStageFlags2::VERTEX_SHADER),
            (BarrierSync::PIXEL_SHADING, vk::PipelineStageFlags2::FRAGMENT_SHADER),
            (
                BarrierSync::DEPTH_STENCIL,
                vk::PipelineStageFlags2::from_raw(
                    vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS.as_raw()
                        | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS.as_raw(),
                ),
            ),
            (BarrierSync::RENDER_TARGET, vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT),
            (BarrierSync::COMPUTE_SHADING, vk::PipelineStageFlags2::COMPUTE_SHADER),
            (BarrierSync::RAYTRACING, vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR),
            (BarrierSync::COPY, vk::PipelineStageFlags2::COPY),
            (BarrierSync::RESOLVE, vk::PipelineStageFlags2::RESOLVE),
            (BarrierSync::EXECUTE_INDIRECT, vk::PipelineStageFlags2::DRAW_INDIRECT),
            (
                BarrierSync::ALL_SHADING,
                vk::PipelineStageFlags2::from_raw(
                    vk::PipelineStageFlags2::PRE_RASTERIZATION_SHADERS.as_raw()
                        | vk::PipelineStageFlags2::FRAGMENT_SHADER.as_raw()
                        | vk::PipelineStageFlags2::COMPUTE_SHADER.as_raw(),
                ),
            ),
        ];

        TABLE
            .iter()
            .filter(|(sync, _)| self.contains(*sync))
            .fold(vk::PipelineStageFlags2::NONE, |acc, (_, stage)| acc | *stage)
    }
}

impl BarrierAccess {
    pub fn to_vk(self) -> vk::AccessFlags2 {
        const TABLE: &[(BarrierAccess, vk::AccessFlags2)] = &[
            (BarrierAccess::VERTEX_BUFFER, vk::AccessFlags2::VERTEX_ATTRIBUTE_READ),
            (BarrierAccess::CONSTANT_BUFFER, vk::AccessFlags2::UNIFORM_READ),
            (BarrierAccess::INDEX_BUFFER, vk::AccessFlags2::INDEX_READ),
            (
                BarrierAccess::RENDER_TARGET,
                vk::AccessFlags2::from_raw(
                    vk::AccessFlags2::COLOR_ATTACHMENT_READ.as_raw() | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE.as_raw(),
                ),
            ),
            (
                BarrierAccess::UNORDERED_ACCESS,
                vk::AccessFlags2::from_raw(
                    vk::AccessFlags2::SHADER_STORAGE_READ.as_raw() | vk::AccessFlags2::SHADER_STORAGE_WRITE.as_raw(),
                ),
            ),
            (
                BarrierAccess::DEPTH_STENCIL_WRITE,
                vk::AccessFlags2::from_raw(
                    vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ.as_raw()
                        | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE.as_raw(),
                ),
            ),
            (BarrierAccess::DEPTH_STENCIL_READ, vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ),
            (BarrierAccess::SHADER_RESOURCE, vk::AccessFlags2::SHADER_SAMPLED_READ),
            (BarrierAccess::INDIRECT_ARGUMENT, vk::AccessFlags2::INDIRECT_COMMAND_READ),
            (BarrierAccess::COPY_DEST, vk::AccessFlags2::TRANSFER_WRITE),
            (BarrierAccess::COPY_SOURCE, vk::AccessFlags2::TRANSFER_READ),
            (BarrierAccess::RESOLVE_DEST, vk::AccessFlags2::TRANSFER_WRITE),
            (BarrierAccess::RESOLVE_SOURCE, vk::AccessFlags2::TRANSFER_READ),
        ];

        TABLE
            .iter()
            .filter(|(access, _)| self.contains(*access))
            .fold(vk::AccessFlags2::NONE, |acc, (_, flags)| acc | *flags)
    }
}

impl BarrierLayout {
    pub fn to_vk(self) -> vk::ImageLayout {
        match self {
            BarrierLayout::Undefined => vk::ImageLayout::UNDEFINED,
            BarrierLayout::Common | BarrierLayout::UnorderedAccess => vk::ImageLayout::GENERAL,
            BarrierLayout::Present => vk::ImageLayout::PRESENT_SRC_KHR,
            BarrierLayout::RenderTarget => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            BarrierLayout::DepthStencilWrite => vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            BarrierLayout::DepthStencilRead => vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
            BarrierLayout::ShaderResource => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            BarrierLayout::CopySource | BarrierLayout::ResolveSource => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            BarrierLayout::CopyDest | BarrierLayout::ResolveDest => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        }
    }
}

/// 一个 texture barrier 对应的 `vk::ImageMemoryBarrier2`，覆盖所有的 layer 和 miplevel
pub struct GfxImageBarrier {
    inner: vk::ImageMemoryBarrier2<'static>,
}

impl GfxImageBarrier {
    pub fn from_resolved(barrier: &ResolvedBarrier, image: vk::Image, aspect_mask: vk::ImageAspectFlags) -> Self {
        let old_layout = barrier.layout_before.unwrap_or(BarrierLayout::Undefined);
        let new_layout = barrier.layout_after.unwrap_or(old_layout);
        let range = vk::ImageSubresourceRange {
            aspect_mask,
            base_mip_level: 0,
            level_count: vk::REMAINING_MIP_LEVELS,
            base_array_layer: 0,
            layer_count: vk::REMAINING_ARRAY_LAYERS,
        };

        let (src, dst) = stage_access(barrier);
        Self {
            inner: vk::ImageMemoryBarrier2::default()
                .src_stage_mask(src.0)
                .src_access_mask(src.1)
                .dst_stage_mask(dst.0)
                .dst_access_mask(dst.1)
                .old_layout(old_layout.to_vk())
                .new_layout(new_layout.to_vk())
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(image)
                .subresource_range(range),
        }
    }

    #[inline]
    pub fn inner(&self) -> &vk::ImageMemoryBarrier2<'_> {
        &self.inner
    }
}

/// 一个 buffer barrier 对应的 `vk::BufferMemoryBarrier2`，覆盖整个 buffer
pub struct GfxBufferBarrier {
    inner: vk::BufferMemoryBarrier2<'static>,
}

impl GfxBufferBarrier {
    pub fn from_resolved(barrier: &ResolvedBarrier, buffer: vk::Buffer) -> Self {
        let (src, dst) = stage_access(barrier);
        Self {
            inner: vk::BufferMemoryBarrier2::default()
                .src_stage_mask(src.0)
                .src_access_mask(src.1)
                .dst_stage_mask(dst.0)
                .dst_access_mask(dst.1)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .buffer(buffer)
                .offset(0)
                .size(vk::WHOLE_SIZE),
        }
    }

    #[inline]
    pub fn inner(&self) -> &vk::BufferMemoryBarrier2<'_> {
        &self.inner
    }
}

type StageAccess = (vk::PipelineStageFlags2, vk::AccessFlags2);

fn stage_access(barrier: &ResolvedBarrier) -> (StageAccess, StageAccess) {
    (
        (barrier.sync_before.to_vk(), barrier.access_before.to_vk()),
        (barrier.sync_after.to_vk(), barrier.access_after.to_vk()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::barrier::{ResourceBarrierBatcher, ResourceBarrierRequest, ResourceState};
    use ash::vk::Handle;
    use crate::handles::ResourceHandle;
    use slotmap::SlotMap;

    #[test]
    fn test_empty_flags_map_to_none() {
        assert_eq!(BarrierSync::empty().to_vk(), vk::PipelineStageFlags2::NONE);
        assert_eq!(BarrierAccess::empty().to_vk(), vk::AccessFlags2::NONE);
    }

    #[test]
    fn test_combined_flags() {
        let stage = (BarrierSync::COPY | BarrierSync::COMPUTE_SHADING).to_vk();
        assert_eq!(stage, vk::PipelineStageFlags2::COPY | vk::PipelineStageFlags2::COMPUTE_SHADER);

        let access = BarrierAccess::DEPTH_STENCIL_READ.to_vk();
        assert_eq!(access, vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ);
    }

    #[test]
    fn test_image_barrier_from_resolved() {
        let mut handles: SlotMap<ResourceHandle, ()> = SlotMap::with_key();
        let texture = handles.insert(());

        let mut batcher = ResourceBarrierBatcher::new(4, 4, false);
        batcher.enqueue_barrier(
            ResourceBarrierRequest::texture(texture)
                .after(BarrierAccess::COPY_DEST)
                .after_layout(BarrierLayout::CopyDest),
        );
        let resolved = batcher.generate_barrier_commands(BarrierSync::COPY);

        let image = vk::Image::from_raw(0x42);
        let barrier = GfxImageBarrier::from_resolved(&resolved.textures[0], image, vk::ImageAspectFlags::COLOR);
        let inner = barrier.inner();
        assert_eq!(inner.image, image);
        assert_eq!(inner.subresource_range.aspect_mask, vk::ImageAspectFlags::COLOR);
        assert_eq!(inner.subresource_range.level_count, vk::REMAINING_MIP_LEVELS);
        assert_eq!(inner.old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(inner.new_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(inner.dst_stage_mask, vk::PipelineStageFlags2::COPY);
        assert_eq!(inner.dst_access_mask, vk::AccessFlags2::TRANSFER_WRITE);
        assert_eq!(inner.src_queue_family_index, vk::QUEUE_FAMILY_IGNORED);
    }

    #[test]
    fn test_buffer_barrier_from_resolved() {
        let mut handles: SlotMap<ResourceHandle, ()> = SlotMap::with_key();
        let buffer = handles.insert(());

        let mut batcher = ResourceBarrierBatcher::new(4, 4, false);
        batcher.import_state(buffer, ResourceState::buffer(BarrierSync::COPY, BarrierAccess::COPY_DEST));
        batcher.enqueue_barrier(ResourceBarrierRequest::buffer(buffer).after(BarrierAccess::VERTEX_BUFFER));
        let resolved = batcher.generate_barrier_commands(BarrierSync::VERTEX_SHADING);

        let native = vk::Buffer::from_raw(0x7);
        let barrier = GfxBufferBarrier::from_resolved(&resolved.buffers[0], native);
        let inner = barrier.inner();
        assert_eq!(inner.buffer, native);
        assert_eq!(inner.offset, 0);
        assert_eq!(inner.size, vk::WHOLE_SIZE);
        assert_eq!(inner.src_stage_mask, vk::PipelineStageFlags2::COPY);
        assert_eq!(inner.src_access_mask, vk::AccessFlags2::TRANSFER_WRITE);
        assert_eq!(inner.dst_stage_mask, vk::PipelineStageFlags2::VERTEX_SHADER);
        assert_eq!(inner.dst_access_mask, vk::AccessFlags2::VERTEX_ATTRIBUTE_READ);
    }
}
