//! Logical-access barrier translation.
//!
//! Pass code never touches raw stage/access/layout triples. It declares
//! barriers in terms of [`AccessType`] pairs ("this image was last written by
//! the color attachment output, the next pass samples it from a fragment
//! shader") and this module derives the Vulkan pipeline barrier from them.
//!
//! Barriers are submitted in batches: all image barriers for a pass boundary
//! plus an optional [`GlobalBarrier`] become a single `vkCmdPipelineBarrier`
//! call. Batching only reduces pipeline-stall overhead; correctness must hold
//! for any split of the same barriers.

use ash::vk;

/// Logical access descriptor: a pipeline stage paired with a direction.
///
/// Each variant expands to a (stage mask, access mask, image layout) triple.
/// Write variants must stand alone in a barrier's access set; combining a
/// write with any other access is a precondition violation and panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessType {
    /// No prior access. Only meaningful as a previous access (first use).
    None,
    /// Read as an indirect command buffer (draw/dispatch argument fetch).
    IndirectBuffer,
    /// Sampled read from the vertex shader stage.
    VertexShaderReadSampled,
    /// Sampled read from the fragment shader stage.
    FragmentShaderReadSampled,
    /// Sampled read from the compute shader stage.
    ComputeShaderReadSampled,
    /// Storage buffer/image read from the compute shader stage.
    ComputeShaderReadStorage,
    /// Storage buffer/image write from the compute shader stage.
    ComputeShaderWrite,
    /// Combined storage read + write from the compute shader stage, for
    /// atomically updated counter buffers.
    ComputeShaderReadWrite,
    /// Color attachment output write.
    ColorAttachmentWrite,
    /// Depth/stencil attachment write (early + late fragment tests).
    DepthStencilAttachmentWrite,
    /// Depth/stencil read-only attachment access.
    DepthStencilAttachmentRead,
    /// Transfer (copy/fill) source read.
    TransferRead,
    /// Transfer (copy/fill) destination write.
    TransferWrite,
    /// Host (CPU) write to mapped memory.
    HostWrite,
    /// Presentation engine access. Only meaningful as a next access.
    Present,
    /// Any stage, any access. A debugging hammer and the visibility side of
    /// barriers with many distinct consumers; costs a full pipeline flush.
    General,
}

/// Derived Vulkan state for one [`AccessType`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessInfo {
    pub stage_mask: vk::PipelineStageFlags,
    pub access_mask: vk::AccessFlags,
    pub image_layout: vk::ImageLayout,
}

impl AccessType {
    /// Expand to the stage/access/layout triple this access maps to.
    pub fn info(self) -> AccessInfo {
        match self {
            Self::None => AccessInfo {
                stage_mask: vk::PipelineStageFlags::TOP_OF_PIPE,
                access_mask: vk::AccessFlags::empty(),
                image_layout: vk::ImageLayout::UNDEFINED,
            },
            Self::IndirectBuffer => AccessInfo {
                stage_mask: vk::PipelineStageFlags::DRAW_INDIRECT,
                access_mask: vk::AccessFlags::INDIRECT_COMMAND_READ,
                image_layout: vk::ImageLayout::UNDEFINED,
            },
            Self::VertexShaderReadSampled => AccessInfo {
                stage_mask: vk::PipelineStageFlags::VERTEX_SHADER,
                access_mask: vk::AccessFlags::SHADER_READ,
                image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            },
            Self::FragmentShaderReadSampled => AccessInfo {
                stage_mask: vk::PipelineStageFlags::FRAGMENT_SHADER,
                access_mask: vk::AccessFlags::SHADER_READ,
                image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            },
            Self::ComputeShaderReadSampled => AccessInfo {
                stage_mask: vk::PipelineStageFlags::COMPUTE_SHADER,
                access_mask: vk::AccessFlags::SHADER_READ,
                image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            },
            Self::ComputeShaderReadStorage => AccessInfo {
                stage_mask: vk::PipelineStageFlags::COMPUTE_SHADER,
                access_mask: vk::AccessFlags::SHADER_READ,
                image_layout: vk::ImageLayout::GENERAL,
            },
            Self::ComputeShaderWrite => AccessInfo {
                stage_mask: vk::PipelineStageFlags::COMPUTE_SHADER,
                access_mask: vk::AccessFlags::SHADER_WRITE,
                image_layout: vk::ImageLayout::GENERAL,
            },
            Self::ComputeShaderReadWrite => AccessInfo {
                stage_mask: vk::PipelineStageFlags::COMPUTE_SHADER,
                access_mask: vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
                image_layout: vk::ImageLayout::GENERAL,
            },
            Self::ColorAttachmentWrite => AccessInfo {
                stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                image_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            },
            Self::DepthStencilAttachmentWrite => AccessInfo {
                stage_mask: vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                    | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
                access_mask: vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
                image_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            },
            Self::DepthStencilAttachmentRead => AccessInfo {
                stage_mask: vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                    | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
                access_mask: vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ,
                image_layout: vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
            },
            Self::TransferRead => AccessInfo {
                stage_mask: vk::PipelineStageFlags::TRANSFER,
                access_mask: vk::AccessFlags::TRANSFER_READ,
                image_layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            },
            Self::TransferWrite => AccessInfo {
                stage_mask: vk::PipelineStageFlags::TRANSFER,
                access_mask: vk::AccessFlags::TRANSFER_WRITE,
                image_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            },
            Self::HostWrite => AccessInfo {
                stage_mask: vk::PipelineStageFlags::HOST,
                access_mask: vk::AccessFlags::HOST_WRITE,
                image_layout: vk::ImageLayout::GENERAL,
            },
            Self::Present => AccessInfo {
                stage_mask: vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                access_mask: vk::AccessFlags::empty(),
                image_layout: vk::ImageLayout::PRESENT_SRC_KHR,
            },
            Self::General => AccessInfo {
                stage_mask: vk::PipelineStageFlags::ALL_COMMANDS,
                access_mask: vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
                image_layout: vk::ImageLayout::GENERAL,
            },
        }
    }

    /// Whether this access writes the resource.
    pub fn is_write(self) -> bool {
        matches!(
            self,
            Self::ComputeShaderWrite
                | Self::ComputeShaderReadWrite
                | Self::ColorAttachmentWrite
                | Self::DepthStencilAttachmentWrite
                | Self::TransferWrite
                | Self::HostWrite
                | Self::General
        )
    }

    /// Whether this access reads the resource.
    pub fn is_read(self) -> bool {
        !matches!(self, Self::None | Self::Present) && !self.is_write()
    }
}

/// Validate an access set. A write access must be the only member, `Present`
/// must be the only member, and `None` may not be combined with anything.
fn validate_access_set(accesses: &[AccessType]) {
    if accesses.len() <= 1 {
        return;
    }
    for access in accesses {
        assert!(
            !access.is_write(),
            "write access {access:?} may not be combined with other accesses"
        );
        assert!(
            !matches!(access, AccessType::Present | AccessType::None),
            "{access:?} may not be combined with other accesses"
        );
    }
}

/// Which image layout family a barrier side uses.
///
/// `Optimal` picks the per-access optimal layout; `General` forces
/// `VK_IMAGE_LAYOUT_GENERAL` (needed when the same image is both stored to
/// and sampled without intermediate transitions, e.g. swapchain storage
/// writes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImageLayoutKind {
    #[default]
    Optimal,
    General,
}

impl ImageLayoutKind {
    fn layout_for(self, access: AccessType) -> vk::ImageLayout {
        match self {
            Self::Optimal => access.info().image_layout,
            Self::General => vk::ImageLayout::GENERAL,
        }
    }
}

/// Subresource range covering one color image entirely.
pub const COLOR_SUBRESOURCE_RANGE: vk::ImageSubresourceRange = vk::ImageSubresourceRange {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    base_mip_level: 0,
    level_count: vk::REMAINING_MIP_LEVELS,
    base_array_layer: 0,
    layer_count: vk::REMAINING_ARRAY_LAYERS,
};

/// Subresource range covering one depth image entirely.
pub const DEPTH_SUBRESOURCE_RANGE: vk::ImageSubresourceRange = vk::ImageSubresourceRange {
    aspect_mask: vk::ImageAspectFlags::DEPTH,
    base_mip_level: 0,
    level_count: vk::REMAINING_MIP_LEVELS,
    base_array_layer: 0,
    layer_count: vk::REMAINING_ARRAY_LAYERS,
};

/// Declarative barrier for a single image.
///
/// `discard_contents` drops whatever the image held: the transition starts
/// from `UNDEFINED` regardless of `prev_layout`. Only legal when nothing
/// produced in this frame is read from the image afterwards; misuse is a
/// silent undefined read, which is why frame programs are replay-validated
/// (see `orchestrator::validate`).
#[derive(Debug, Clone)]
pub struct ImageBarrier {
    pub prev_access: AccessType,
    pub next_access: AccessType,
    pub prev_layout: ImageLayoutKind,
    pub next_layout: ImageLayoutKind,
    pub discard_contents: bool,
    pub src_queue_family: u32,
    pub dst_queue_family: u32,
    pub image: vk::Image,
    pub subresource_range: vk::ImageSubresourceRange,
}

impl ImageBarrier {
    /// Barrier on a color image, full subresource range, single queue family.
    pub fn new(
        prev_access: AccessType,
        next_access: AccessType,
        queue_family: u32,
        image: vk::Image,
    ) -> Self {
        Self {
            prev_access,
            next_access,
            prev_layout: ImageLayoutKind::Optimal,
            next_layout: ImageLayoutKind::Optimal,
            discard_contents: false,
            src_queue_family: queue_family,
            dst_queue_family: queue_family,
            image,
            subresource_range: COLOR_SUBRESOURCE_RANGE,
        }
    }

    pub fn with_subresource_range(mut self, range: vk::ImageSubresourceRange) -> Self {
        self.subresource_range = range;
        self
    }

    pub fn discard(mut self) -> Self {
        self.discard_contents = true;
        self
    }

    pub fn with_layouts(mut self, prev: ImageLayoutKind, next: ImageLayoutKind) -> Self {
        self.prev_layout = prev;
        self.next_layout = next;
        self
    }

    /// Transfer ownership to another queue family. The same barrier must be
    /// recorded on both the releasing and the acquiring queue.
    pub fn with_queue_transfer(mut self, src_family: u32, dst_family: u32) -> Self {
        self.src_queue_family = src_family;
        self.dst_queue_family = dst_family;
        self
    }

    /// Whether this barrier transfers queue family ownership.
    pub fn is_queue_transfer(&self) -> bool {
        self.src_queue_family != self.dst_queue_family
    }

    /// Translate to a raw Vulkan image barrier plus its stage masks.
    pub fn to_vk(&self) -> (vk::ImageMemoryBarrier<'static>, vk::PipelineStageFlags, vk::PipelineStageFlags) {
        let prev = self.prev_access.info();
        let next = self.next_access.info();

        assert!(
            self.next_access != AccessType::None,
            "a barrier's next access must name a real access"
        );

        let old_layout = if self.discard_contents {
            vk::ImageLayout::UNDEFINED
        } else {
            self.prev_layout.layout_for(self.prev_access)
        };
        let new_layout = self.next_layout.layout_for(self.next_access);

        // Read accesses need no availability operation; only flush writes.
        let src_access_mask = if self.prev_access.is_write() {
            prev.access_mask
        } else {
            vk::AccessFlags::empty()
        };

        let barrier = vk::ImageMemoryBarrier::default()
            .src_access_mask(src_access_mask)
            .dst_access_mask(next.access_mask)
            .old_layout(old_layout)
            .new_layout(new_layout)
            .src_queue_family_index(self.src_queue_family)
            .dst_queue_family_index(self.dst_queue_family)
            .image(self.image)
            .subresource_range(self.subresource_range);

        (barrier, prev.stage_mask, next.stage_mask)
    }
}

/// Barrier with no target image: orders all prior accesses of the listed
/// kinds before all subsequent ones. Used for buffer producer/consumer pairs
/// (a culling pass writing indirect counts before an indirect draw reads
/// them).
#[derive(Debug, Clone)]
pub struct GlobalBarrier {
    pub prev_accesses: Vec<AccessType>,
    pub next_accesses: Vec<AccessType>,
}

impl GlobalBarrier {
    pub fn new(prev_accesses: Vec<AccessType>, next_accesses: Vec<AccessType>) -> Self {
        validate_access_set(&prev_accesses);
        validate_access_set(&next_accesses);
        Self {
            prev_accesses,
            next_accesses,
        }
    }

    /// Translate to a raw Vulkan memory barrier plus its stage masks.
    pub fn to_vk(&self) -> (vk::MemoryBarrier<'static>, vk::PipelineStageFlags, vk::PipelineStageFlags) {
        let mut src_stage = vk::PipelineStageFlags::empty();
        let mut dst_stage = vk::PipelineStageFlags::empty();
        let mut src_access = vk::AccessFlags::empty();
        let mut dst_access = vk::AccessFlags::empty();

        for access in &self.prev_accesses {
            let info = access.info();
            src_stage |= info.stage_mask;
            if access.is_write() {
                src_access |= info.access_mask;
            }
        }
        for access in &self.next_accesses {
            let info = access.info();
            dst_stage |= info.stage_mask;
            dst_access |= info.access_mask;
        }

        if src_stage.is_empty() {
            src_stage = vk::PipelineStageFlags::TOP_OF_PIPE;
        }
        if dst_stage.is_empty() {
            dst_stage = vk::PipelineStageFlags::BOTTOM_OF_PIPE;
        }

        let barrier = vk::MemoryBarrier::default()
            .src_access_mask(src_access)
            .dst_access_mask(dst_access);

        (barrier, src_stage, dst_stage)
    }
}

/// Record one pipeline barrier covering a batch of image barriers and an
/// optional global barrier.
///
/// # Safety
///
/// `cmd` must be in the recording state and every image handle must be live.
pub unsafe fn pipeline_barrier(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    global: Option<&GlobalBarrier>,
    image_barriers: &[ImageBarrier],
) {
    if global.is_none() && image_barriers.is_empty() {
        return;
    }

    let mut src_stage = vk::PipelineStageFlags::empty();
    let mut dst_stage = vk::PipelineStageFlags::empty();

    let mut memory_barriers = Vec::new();
    if let Some(global) = global {
        let (barrier, src, dst) = global.to_vk();
        src_stage |= src;
        dst_stage |= dst;
        memory_barriers.push(barrier);
    }

    let vk_image_barriers: Vec<vk::ImageMemoryBarrier> = image_barriers
        .iter()
        .map(|barrier| {
            let (vk_barrier, src, dst) = barrier.to_vk();
            src_stage |= src;
            dst_stage |= dst;
            vk_barrier
        })
        .collect();

    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            src_stage,
            dst_stage,
            vk::DependencyFlags::empty(),
            &memory_barriers,
            &[],
            &vk_image_barriers,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn test_access_info_compute_write() {
        let info = AccessType::ComputeShaderWrite.info();
        assert_eq!(info.stage_mask, vk::PipelineStageFlags::COMPUTE_SHADER);
        assert_eq!(info.access_mask, vk::AccessFlags::SHADER_WRITE);
        assert_eq!(info.image_layout, vk::ImageLayout::GENERAL);
    }

    #[test]
    fn test_access_info_indirect() {
        let info = AccessType::IndirectBuffer.info();
        assert_eq!(info.stage_mask, vk::PipelineStageFlags::DRAW_INDIRECT);
        assert_eq!(info.access_mask, vk::AccessFlags::INDIRECT_COMMAND_READ);
    }

    #[test]
    fn test_read_write_classification() {
        assert!(AccessType::ColorAttachmentWrite.is_write());
        assert!(AccessType::TransferWrite.is_write());
        assert!(!AccessType::FragmentShaderReadSampled.is_write());
        assert!(AccessType::FragmentShaderReadSampled.is_read());
        assert!(!AccessType::None.is_read());
        assert!(!AccessType::Present.is_read());
        assert!(!AccessType::Present.is_write());
    }

    #[test]
    fn test_image_barrier_layout_transition() {
        let image = vk::Image::from_raw(0x1234);
        let barrier = ImageBarrier::new(
            AccessType::ColorAttachmentWrite,
            AccessType::FragmentShaderReadSampled,
            0,
            image,
        );
        let (vk_barrier, src_stage, dst_stage) = barrier.to_vk();

        assert_eq!(vk_barrier.old_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(vk_barrier.new_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(vk_barrier.src_access_mask, vk::AccessFlags::COLOR_ATTACHMENT_WRITE);
        assert_eq!(vk_barrier.dst_access_mask, vk::AccessFlags::SHADER_READ);
        assert_eq!(src_stage, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT);
        assert_eq!(dst_stage, vk::PipelineStageFlags::FRAGMENT_SHADER);
    }

    #[test]
    fn test_discard_starts_from_undefined() {
        let image = vk::Image::from_raw(0x1234);
        let barrier = ImageBarrier::new(
            AccessType::None,
            AccessType::DepthStencilAttachmentWrite,
            0,
            image,
        )
        .discard()
        .with_subresource_range(DEPTH_SUBRESOURCE_RANGE);

        let (vk_barrier, _, _) = barrier.to_vk();
        assert_eq!(vk_barrier.old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(
            vk_barrier.new_layout,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        );
        // Nothing to flush when discarding first use.
        assert_eq!(vk_barrier.src_access_mask, vk::AccessFlags::empty());
    }

    #[test]
    fn test_read_prev_access_has_no_availability_op() {
        let image = vk::Image::from_raw(0x1);
        let barrier = ImageBarrier::new(
            AccessType::FragmentShaderReadSampled,
            AccessType::ColorAttachmentWrite,
            0,
            image,
        );
        let (vk_barrier, _, _) = barrier.to_vk();
        assert_eq!(vk_barrier.src_access_mask, vk::AccessFlags::empty());
    }

    #[test]
    fn test_general_layout_override() {
        let image = vk::Image::from_raw(0x1);
        let barrier = ImageBarrier::new(
            AccessType::ColorAttachmentWrite,
            AccessType::Present,
            0,
            image,
        )
        .with_layouts(ImageLayoutKind::General, ImageLayoutKind::Optimal);

        let (vk_barrier, _, _) = barrier.to_vk();
        assert_eq!(vk_barrier.old_layout, vk::ImageLayout::GENERAL);
        assert_eq!(vk_barrier.new_layout, vk::ImageLayout::PRESENT_SRC_KHR);
    }

    #[test]
    fn test_queue_transfer_marked() {
        let image = vk::Image::from_raw(0x1);
        let barrier = ImageBarrier::new(
            AccessType::TransferWrite,
            AccessType::FragmentShaderReadSampled,
            0,
            image,
        )
        .with_queue_transfer(1, 2);

        assert!(barrier.is_queue_transfer());
        let (vk_barrier, _, _) = barrier.to_vk();
        assert_eq!(vk_barrier.src_queue_family_index, 1);
        assert_eq!(vk_barrier.dst_queue_family_index, 2);
    }

    #[test]
    fn test_global_barrier_mask_union() {
        let global = GlobalBarrier::new(
            vec![AccessType::ComputeShaderWrite],
            vec![AccessType::IndirectBuffer, AccessType::ComputeShaderReadStorage],
        );
        let (barrier, src_stage, dst_stage) = global.to_vk();

        assert_eq!(barrier.src_access_mask, vk::AccessFlags::SHADER_WRITE);
        assert_eq!(
            barrier.dst_access_mask,
            vk::AccessFlags::INDIRECT_COMMAND_READ | vk::AccessFlags::SHADER_READ
        );
        assert_eq!(src_stage, vk::PipelineStageFlags::COMPUTE_SHADER);
        assert_eq!(
            dst_stage,
            vk::PipelineStageFlags::DRAW_INDIRECT | vk::PipelineStageFlags::COMPUTE_SHADER
        );
    }

    #[test]
    #[should_panic(expected = "write access")]
    fn test_write_combined_with_read_panics() {
        GlobalBarrier::new(
            vec![AccessType::ComputeShaderWrite, AccessType::TransferRead],
            vec![AccessType::IndirectBuffer],
        );
    }

    #[test]
    #[should_panic(expected = "may not be combined")]
    fn test_present_combined_panics() {
        GlobalBarrier::new(
            vec![AccessType::ColorAttachmentWrite],
            vec![AccessType::Present, AccessType::FragmentShaderReadSampled],
        );
    }

    #[test]
    #[should_panic(expected = "next access must name a real access")]
    fn test_none_as_next_access_panics() {
        let image = vk::Image::from_raw(0x1);
        let barrier = ImageBarrier::new(AccessType::ColorAttachmentWrite, AccessType::None, 0, image);
        barrier.to_vk();
    }
}
