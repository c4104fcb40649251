//! The render orchestrator.
//!
//! One frame is a fixed, ordered program of fills, barriers, compute
//! dispatches and indirect draws. The program is built as data
//! ([`FrameProgram`]) before anything touches a command buffer: every step
//! declares which logical resources it reads and writes, so the whole frame
//! can be replayed on the CPU and checked for missing barriers or unsafe
//! discards without a GPU. Recording then walks the same step list and
//! translates it into Vulkan commands.
//!
//! The program shape never depends on scene occupancy. An empty scene runs
//! the same fills, barriers, dispatches and indirect draws as a full one;
//! the GPU-written counts simply come out zero.

use std::collections::{HashMap, HashSet};

use ash::vk;

use crate::barrier::{
    self, AccessType, GlobalBarrier, ImageBarrier, COLOR_SUBRESOURCE_RANGE,
    DEPTH_SUBRESOURCE_RANGE,
};
use crate::gpu_data::{
    bucket_capacity, dispatch_args_offset, draw_commands_offset, draw_count_offset, DrawBucket,
    DrawIndirectCommand, DrawPass, DRAW_COUNTS_OFFSET, MAX_DEPTH_OFFSET, MIN_DEPTH_OFFSET,
    MISC_BUFFER_SIZE, SHADOW_CASCADE_COUNT,
};
use crate::pipelines::{PipelineId, Pipelines};
use crate::resources::{FrameResources, ResizableTargets, SHADOW_MAP_SIZE};

/// Threads per instance/meshlet culling workgroup.
pub const CULL_WORKGROUP_SIZE: u32 = 64;
/// Tile edge of the full-screen compute passes.
pub const SHADING_TILE_SIZE: u32 = 8;
/// Tile edge of the depth-reduction pass.
pub const DEPTH_REDUCE_TILE_SIZE: u32 = 16;

/// Logical resources the frame program threads through read/write states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceId {
    Uniforms,
    Instances,
    CulledInstances,
    DrawCalls,
    Misc,
    DispatchArgs,
    MeshData,
    SceneColor,
    Depth,
    Visbuffer,
    ShadowMap,
    Swapchain,
}

impl ResourceId {
    pub fn is_buffer(self) -> bool {
        matches!(
            self,
            Self::Uniforms
                | Self::Instances
                | Self::CulledInstances
                | Self::DrawCalls
                | Self::Misc
                | Self::DispatchArgs
                | Self::MeshData
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
    ReadWrite,
}

impl AccessKind {
    fn reads(self) -> bool {
        matches!(self, Self::Read | Self::ReadWrite)
    }

    fn writes(self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite)
    }
}

/// One declared access of one step, used only for replay validation.
#[derive(Debug, Clone, Copy)]
pub struct StepAccess {
    pub resource: ResourceId,
    pub access: AccessType,
    pub kind: AccessKind,
}

impl StepAccess {
    pub fn read(resource: ResourceId, access: AccessType) -> Self {
        Self {
            resource,
            access,
            kind: AccessKind::Read,
        }
    }

    pub fn write(resource: ResourceId, access: AccessType) -> Self {
        Self {
            resource,
            access,
            kind: AccessKind::Write,
        }
    }

    pub fn read_write(resource: ResourceId, access: AccessType) -> Self {
        Self {
            resource,
            access,
            kind: AccessKind::ReadWrite,
        }
    }
}

/// Barrier on one image, in logical-resource terms.
#[derive(Debug, Clone)]
pub struct ImageBarrierDecl {
    pub resource: ResourceId,
    pub prev: AccessType,
    pub next: AccessType,
    pub discard: bool,
}

/// Execution/memory barrier over buffer accesses.
#[derive(Debug, Clone)]
pub struct GlobalBarrierDecl {
    pub prev: Vec<AccessType>,
    pub next: Vec<AccessType>,
}

/// Attachment set of one raster scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderTarget {
    /// Visibility id (color) + scene depth, both cleared.
    Visbuffer,
    /// One shadow cascade layer, depth only, cleared.
    ShadowCascade(u32),
}

/// One step of the frame program.
#[derive(Debug, Clone)]
pub enum FrameStep {
    FillBuffer {
        buffer: ResourceId,
        offset: u64,
        size: u64,
        value: u32,
    },
    Barrier {
        global: Option<GlobalBarrierDecl>,
        images: Vec<ImageBarrierDecl>,
    },
    /// Push the pass/cascade index constant for subsequent steps.
    PushIndex(u32),
    Dispatch {
        pipeline: PipelineId,
        groups: [u32; 3],
        accesses: Vec<StepAccess>,
    },
    DispatchIndirect {
        pipeline: PipelineId,
        pass: DrawPass,
        accesses: Vec<StepAccess>,
    },
    BeginRendering(RenderTarget),
    DrawIndirectCount {
        pipeline: PipelineId,
        pass: DrawPass,
        bucket: DrawBucket,
    },
    EndRendering,
    /// Load-preserving UI pass over the swapchain image; draw recording is
    /// delegated to the UI collaborator.
    UiPass,
}

impl FrameStep {
    /// Accesses this step performs, for replay validation. Barrier steps are
    /// interpreted structurally by the validator instead.
    fn accesses(&self) -> Vec<StepAccess> {
        match self {
            Self::FillBuffer { buffer, .. } => {
                vec![StepAccess::write(*buffer, AccessType::TransferWrite)]
            }
            Self::Barrier { .. } | Self::PushIndex(_) | Self::EndRendering => Vec::new(),
            Self::Dispatch { accesses, .. } => accesses.clone(),
            Self::DispatchIndirect { accesses, .. } => {
                let mut all = vec![StepAccess::read(
                    ResourceId::DispatchArgs,
                    AccessType::IndirectBuffer,
                )];
                all.extend_from_slice(accesses);
                all
            }
            Self::BeginRendering(target) => match target {
                RenderTarget::Visbuffer => vec![
                    StepAccess::write(ResourceId::Visbuffer, AccessType::ColorAttachmentWrite),
                    StepAccess::write(ResourceId::Depth, AccessType::DepthStencilAttachmentWrite),
                ],
                RenderTarget::ShadowCascade(_) => vec![StepAccess::write(
                    ResourceId::ShadowMap,
                    AccessType::DepthStencilAttachmentWrite,
                )],
            },
            Self::DrawIndirectCount { .. } => vec![
                StepAccess::read(ResourceId::DrawCalls, AccessType::IndirectBuffer),
                StepAccess::read(ResourceId::Misc, AccessType::IndirectBuffer),
                StepAccess::read(ResourceId::Instances, AccessType::VertexShaderReadSampled),
                StepAccess::read(ResourceId::CulledInstances, AccessType::VertexShaderReadSampled),
                StepAccess::read(ResourceId::MeshData, AccessType::VertexShaderReadSampled),
                StepAccess::read(ResourceId::Uniforms, AccessType::VertexShaderReadSampled),
            ],
            Self::UiPass => vec![StepAccess::read_write(
                ResourceId::Swapchain,
                AccessType::ColorAttachmentWrite,
            )],
        }
    }
}

/// One frame's step list, fixed at build time.
#[derive(Debug, Clone)]
pub struct FrameProgram {
    pub steps: Vec<FrameStep>,
    pub extent: vk::Extent2D,
}

fn group_count(items: u32, per_group: u32) -> u32 {
    items.div_ceil(per_group).max(1)
}

/// Accesses shared by both culling dispatch kinds.
fn cull_reads() -> Vec<StepAccess> {
    vec![
        StepAccess::read(ResourceId::Uniforms, AccessType::ComputeShaderReadStorage),
        StepAccess::read(ResourceId::Instances, AccessType::ComputeShaderReadStorage),
        StepAccess::read(ResourceId::MeshData, AccessType::ComputeShaderReadStorage),
    ]
}

fn instance_cull_step(instance_count: u32) -> FrameStep {
    let mut accesses = cull_reads();
    // Cascade culls read the light matrices out of the misc buffer; the main
    // cull reads nothing from it, declaring it anyway keeps one shape.
    accesses.push(StepAccess::read(
        ResourceId::Misc,
        AccessType::ComputeShaderReadStorage,
    ));
    accesses.push(StepAccess::read_write(
        ResourceId::CulledInstances,
        AccessType::ComputeShaderReadWrite,
    ));
    accesses.push(StepAccess::read_write(
        ResourceId::DispatchArgs,
        AccessType::ComputeShaderReadWrite,
    ));
    FrameStep::Dispatch {
        pipeline: PipelineId::InstanceCull,
        groups: [group_count(instance_count, CULL_WORKGROUP_SIZE), 1, 1],
        accesses,
    }
}

fn meshlet_cull_step(pass: DrawPass) -> FrameStep {
    let mut accesses = cull_reads();
    accesses.push(StepAccess::read(
        ResourceId::CulledInstances,
        AccessType::ComputeShaderReadStorage,
    ));
    accesses.push(StepAccess::read_write(
        ResourceId::DrawCalls,
        AccessType::ComputeShaderReadWrite,
    ));
    accesses.push(StepAccess::read_write(
        ResourceId::Misc,
        AccessType::ComputeShaderReadWrite,
    ));
    FrameStep::DispatchIndirect {
        pipeline: PipelineId::MeshletCull,
        pass,
        accesses,
    }
}

/// Barrier making culling-pass writes visible to every later consumer kind
/// (indirect reads, storage reads, further atomics).
fn cull_flush_barrier() -> FrameStep {
    FrameStep::Barrier {
        global: Some(GlobalBarrierDecl {
            prev: vec![AccessType::ComputeShaderReadWrite],
            next: vec![AccessType::General],
        }),
        images: Vec::new(),
    }
}

/// Build the fixed per-frame program.
///
/// `instance_count` only affects dispatch group counts, never which steps
/// exist; `extent` sizes the full-screen dispatches.
pub fn build_frame_program(extent: vk::Extent2D, instance_count: u32) -> FrameProgram {
    let mut steps = Vec::new();

    // 1. Reset counters: draw counts, depth min/max accumulators, and the
    // per-pass dispatch arguments (group count 0, height/depth 1).
    steps.push(FrameStep::FillBuffer {
        buffer: ResourceId::Misc,
        offset: DRAW_COUNTS_OFFSET,
        size: MISC_BUFFER_SIZE - DRAW_COUNTS_OFFSET,
        value: 0,
    });
    steps.push(FrameStep::FillBuffer {
        buffer: ResourceId::Misc,
        offset: MIN_DEPTH_OFFSET,
        size: 4,
        value: u32::MAX,
    });
    steps.push(FrameStep::FillBuffer {
        buffer: ResourceId::Misc,
        offset: MAX_DEPTH_OFFSET,
        size: 4,
        value: 0,
    });
    for pass in all_passes() {
        let base = dispatch_args_offset(pass);
        steps.push(FrameStep::FillBuffer {
            buffer: ResourceId::DispatchArgs,
            offset: base,
            size: 4,
            value: 0,
        });
        steps.push(FrameStep::FillBuffer {
            buffer: ResourceId::DispatchArgs,
            offset: base + 4,
            size: 8,
            value: 1,
        });
    }

    // 2. Move every image into its first write state, dropping last frame's
    // contents, and order the fills before everything that consumes them
    // (culling atomics, indirect reads, storage reads).
    steps.push(FrameStep::Barrier {
        global: Some(GlobalBarrierDecl {
            prev: vec![AccessType::TransferWrite],
            next: vec![AccessType::General],
        }),
        images: vec![
            ImageBarrierDecl {
                resource: ResourceId::Depth,
                prev: AccessType::None,
                next: AccessType::DepthStencilAttachmentWrite,
                discard: true,
            },
            ImageBarrierDecl {
                resource: ResourceId::Visbuffer,
                prev: AccessType::None,
                next: AccessType::ColorAttachmentWrite,
                discard: true,
            },
            ImageBarrierDecl {
                resource: ResourceId::SceneColor,
                prev: AccessType::None,
                next: AccessType::ComputeShaderWrite,
                discard: true,
            },
            ImageBarrierDecl {
                resource: ResourceId::ShadowMap,
                prev: AccessType::None,
                next: AccessType::DepthStencilAttachmentWrite,
                discard: true,
            },
            ImageBarrierDecl {
                resource: ResourceId::Swapchain,
                prev: AccessType::None,
                next: AccessType::ComputeShaderWrite,
                discard: true,
            },
        ],
    });

    // 3-7. Main-view culling: instances, then meshlets dispatched with the
    // GPU-computed group count, each write flushed before its consumer.
    steps.push(FrameStep::PushIndex(DrawPass::Main.index()));
    steps.push(instance_cull_step(instance_count));
    steps.push(cull_flush_barrier());
    steps.push(meshlet_cull_step(DrawPass::Main));
    steps.push(cull_flush_barrier());

    // 8. Visibility-buffer raster: opaque then alpha-clip, both indirect.
    steps.push(FrameStep::BeginRendering(RenderTarget::Visbuffer));
    steps.push(FrameStep::DrawIndirectCount {
        pipeline: PipelineId::VisbufferOpaque,
        pass: DrawPass::Main,
        bucket: DrawBucket::Opaque,
    });
    steps.push(FrameStep::DrawIndirectCount {
        pipeline: PipelineId::VisbufferAlphaClip,
        pass: DrawPass::Main,
        bucket: DrawBucket::AlphaClip,
    });
    steps.push(FrameStep::EndRendering);

    // 9-11. Depth readback: reduce min/max, then fit the cascade matrices.
    steps.push(FrameStep::Barrier {
        global: None,
        images: vec![
            ImageBarrierDecl {
                resource: ResourceId::Depth,
                prev: AccessType::DepthStencilAttachmentWrite,
                next: AccessType::ComputeShaderReadSampled,
                discard: false,
            },
            ImageBarrierDecl {
                resource: ResourceId::Visbuffer,
                prev: AccessType::ColorAttachmentWrite,
                next: AccessType::ComputeShaderReadStorage,
                discard: false,
            },
        ],
    });
    steps.push(FrameStep::Dispatch {
        pipeline: PipelineId::DepthReduce,
        groups: [
            group_count(extent.width, DEPTH_REDUCE_TILE_SIZE),
            group_count(extent.height, DEPTH_REDUCE_TILE_SIZE),
            1,
        ],
        accesses: vec![
            StepAccess::read(ResourceId::Depth, AccessType::ComputeShaderReadSampled),
            StepAccess::read_write(ResourceId::Misc, AccessType::ComputeShaderReadWrite),
        ],
    });
    steps.push(cull_flush_barrier());
    steps.push(FrameStep::Dispatch {
        pipeline: PipelineId::CascadeMatrices,
        groups: [1, 1, 1],
        accesses: vec![
            StepAccess::read(ResourceId::Uniforms, AccessType::ComputeShaderReadStorage),
            StepAccess::read_write(ResourceId::Misc, AccessType::ComputeShaderReadWrite),
        ],
    });
    steps.push(cull_flush_barrier());

    // 12-13. Per-cascade culling and depth-only indirect draws.
    for cascade in 0..SHADOW_CASCADE_COUNT {
        let pass = DrawPass::Cascade(cascade);
        steps.push(FrameStep::PushIndex(pass.index()));
        steps.push(instance_cull_step(instance_count));
        steps.push(cull_flush_barrier());
        steps.push(meshlet_cull_step(pass));
        steps.push(cull_flush_barrier());
        steps.push(FrameStep::BeginRendering(RenderTarget::ShadowCascade(cascade)));
        steps.push(FrameStep::DrawIndirectCount {
            pipeline: PipelineId::ShadowOpaque,
            pass,
            bucket: DrawBucket::Opaque,
        });
        steps.push(FrameStep::DrawIndirectCount {
            pipeline: PipelineId::ShadowAlphaClip,
            pass,
            bucket: DrawBucket::AlphaClip,
        });
        steps.push(FrameStep::EndRendering);
    }

    // 14-15. Shadow write→read, then deferred lighting into the scene buffer.
    steps.push(FrameStep::Barrier {
        global: None,
        images: vec![ImageBarrierDecl {
            resource: ResourceId::ShadowMap,
            prev: AccessType::DepthStencilAttachmentWrite,
            next: AccessType::ComputeShaderReadSampled,
            discard: false,
        }],
    });
    steps.push(FrameStep::Dispatch {
        pipeline: PipelineId::DeferredLighting,
        groups: [
            group_count(extent.width, SHADING_TILE_SIZE),
            group_count(extent.height, SHADING_TILE_SIZE),
            1,
        ],
        accesses: vec![
            StepAccess::read(ResourceId::Uniforms, AccessType::ComputeShaderReadStorage),
            StepAccess::read(ResourceId::Instances, AccessType::ComputeShaderReadStorage),
            StepAccess::read(ResourceId::MeshData, AccessType::ComputeShaderReadStorage),
            StepAccess::read(ResourceId::Misc, AccessType::ComputeShaderReadStorage),
            StepAccess::read(ResourceId::Visbuffer, AccessType::ComputeShaderReadStorage),
            StepAccess::read(ResourceId::Depth, AccessType::ComputeShaderReadSampled),
            StepAccess::read(ResourceId::ShadowMap, AccessType::ComputeShaderReadSampled),
            StepAccess::write(ResourceId::SceneColor, AccessType::ComputeShaderWrite),
        ],
    });

    // 16-17. Scene write→read, display transform into the swapchain image.
    steps.push(FrameStep::Barrier {
        global: None,
        images: vec![ImageBarrierDecl {
            resource: ResourceId::SceneColor,
            prev: AccessType::ComputeShaderWrite,
            next: AccessType::ComputeShaderReadStorage,
            discard: false,
        }],
    });
    steps.push(FrameStep::Dispatch {
        pipeline: PipelineId::DisplayTransform,
        groups: [
            group_count(extent.width, SHADING_TILE_SIZE),
            group_count(extent.height, SHADING_TILE_SIZE),
            1,
        ],
        accesses: vec![
            StepAccess::read(ResourceId::SceneColor, AccessType::ComputeShaderReadStorage),
            StepAccess::write(ResourceId::Swapchain, AccessType::ComputeShaderWrite),
        ],
    });

    // 18. UI over the tone-mapped image, preserving it.
    steps.push(FrameStep::Barrier {
        global: None,
        images: vec![ImageBarrierDecl {
            resource: ResourceId::Swapchain,
            prev: AccessType::ComputeShaderWrite,
            next: AccessType::ColorAttachmentWrite,
            discard: false,
        }],
    });
    steps.push(FrameStep::UiPass);

    // 19. Hand the image to the presentation engine.
    steps.push(FrameStep::Barrier {
        global: None,
        images: vec![ImageBarrierDecl {
            resource: ResourceId::Swapchain,
            prev: AccessType::ColorAttachmentWrite,
            next: AccessType::Present,
            discard: false,
        }],
    });

    FrameProgram { steps, extent }
}

fn all_passes() -> Vec<DrawPass> {
    let mut passes = vec![DrawPass::Main];
    for cascade in 0..SHADOW_CASCADE_COUNT {
        passes.push(DrawPass::Cascade(cascade));
    }
    passes
}

// ---------------------------------------------------------------------------
// Replay validation.
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ResourceState {
    /// Access of the most recent write this frame, surviving barrier clears.
    last_write: Option<AccessType>,
    /// True while that write has not been covered by a barrier.
    unguarded: bool,
    /// Accesses the last covering barrier made visible.
    visible: HashSet<AccessType>,
    read_this_frame: bool,
    written_this_frame: bool,
}

impl ResourceState {
    fn is_visible_to(&self, access: AccessType) -> bool {
        self.visible.contains(&AccessType::General) || self.visible.contains(&access)
    }
}

/// Replay the program's declared accesses and collect every hazard: reads of
/// unguarded writes, reads whose access no barrier made visible, discards of
/// already-read images, and barriers whose declared previous access does not
/// match what actually happened.
pub fn validate(program: &FrameProgram) -> Result<(), Vec<String>> {
    let mut states: HashMap<ResourceId, ResourceState> = HashMap::new();
    let mut errors = Vec::new();
    let mut rendering_depth = 0u32;

    for (index, step) in program.steps.iter().enumerate() {
        match step {
            FrameStep::Barrier { global, images } => {
                for decl in images {
                    let state = states.entry(decl.resource).or_default();
                    if decl.discard {
                        if state.read_this_frame {
                            errors.push(format!(
                                "step {index}: discard of {:?} after it was read this frame",
                                decl.resource
                            ));
                        }
                        if state.unguarded {
                            errors.push(format!(
                                "step {index}: discard of {:?} drops an unread write",
                                decl.resource
                            ));
                        }
                        state.last_write = None;
                        state.unguarded = false;
                        state.visible = HashSet::from([decl.next]);
                    } else if state.last_write == Some(decl.prev) {
                        state.unguarded = false;
                        state.visible.insert(decl.next);
                    } else if state.unguarded {
                        errors.push(format!(
                            "step {index}: barrier on {:?} declares previous access {:?} but the last write was {:?}",
                            decl.resource, decl.prev, state.last_write
                        ));
                    } else {
                        // Layout-only transition of an untouched image.
                        state.visible.insert(decl.next);
                    }
                }
                if let Some(global) = global {
                    for (resource, state) in states.iter_mut() {
                        if !resource.is_buffer() {
                            continue;
                        }
                        if let Some(write) = state.last_write {
                            if global.prev.contains(&write) {
                                state.unguarded = false;
                                state.visible.extend(global.next.iter().copied());
                            }
                        }
                    }
                }
            }
            other => {
                match other {
                    FrameStep::BeginRendering(_) => rendering_depth += 1,
                    FrameStep::EndRendering => {
                        if rendering_depth == 0 {
                            errors.push(format!("step {index}: end of rendering without begin"));
                        } else {
                            rendering_depth -= 1;
                        }
                    }
                    FrameStep::DrawIndirectCount { .. } => {
                        if rendering_depth == 0 {
                            errors.push(format!("step {index}: draw outside a rendering scope"));
                        }
                    }
                    _ => {}
                }
                for access in other.accesses() {
                    let state = states.entry(access.resource).or_default();
                    if access.kind.reads() {
                        if state.unguarded {
                            errors.push(format!(
                                "step {index}: read of {:?} as {:?} with an unguarded prior {:?} write",
                                access.resource,
                                access.access,
                                state.last_write.unwrap()
                            ));
                        } else if state.written_this_frame && !state.is_visible_to(access.access) {
                            errors.push(format!(
                                "step {index}: {:?} access of {:?} was not made visible by any barrier",
                                access.access, access.resource
                            ));
                        }
                        state.read_this_frame = true;
                    }
                    if access.kind.writes() {
                        state.last_write = Some(access.access);
                        state.unguarded = true;
                        state.written_this_frame = true;
                        state.visible.clear();
                    }
                }
            }
        }
    }

    if rendering_depth != 0 {
        errors.push("rendering scope left open at end of frame".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

// ---------------------------------------------------------------------------
// Recording.
// ---------------------------------------------------------------------------

/// Everything recording needs for one frame. Borrowed for the duration of
/// `record`; the orchestrator owns nothing.
pub struct RecordContext<'a> {
    pub device: &'a ash::Device,
    pub cmd: vk::CommandBuffer,
    pub pipelines: &'a Pipelines,
    pub frame_set: vk::DescriptorSet,
    pub bindless_set: vk::DescriptorSet,
    pub resources: &'a FrameResources,
    pub targets: &'a ResizableTargets,
    pub swapchain_image: vk::Image,
    pub swapchain_view: vk::ImageView,
    pub queue_family: u32,
    /// Records the UI collaborator's draws into the already-begun pass.
    pub ui_paint: &'a mut dyn FnMut(vk::CommandBuffer),
}

impl RecordContext<'_> {
    fn buffer(&self, id: ResourceId) -> vk::Buffer {
        match id {
            ResourceId::Uniforms => self.resources.uniform_buffer.buffer,
            ResourceId::Instances => self.resources.instance_buffer.buffer,
            ResourceId::CulledInstances => self.resources.culled_instance_buffer.buffer,
            ResourceId::DrawCalls => self.resources.draw_calls_buffer.buffer,
            ResourceId::Misc => self.resources.misc_buffer.buffer,
            ResourceId::DispatchArgs => self.resources.dispatch_buffer.buffer,
            other => panic!("{other:?} is not a frame buffer"),
        }
    }

    fn image(&self, id: ResourceId) -> (vk::Image, vk::ImageSubresourceRange) {
        match id {
            ResourceId::SceneColor => (self.targets.scene_color.image, COLOR_SUBRESOURCE_RANGE),
            ResourceId::Depth => (self.targets.depth.image, DEPTH_SUBRESOURCE_RANGE),
            ResourceId::Visbuffer => (self.targets.visbuffer.image, COLOR_SUBRESOURCE_RANGE),
            ResourceId::ShadowMap => (self.resources.shadow_map.image, DEPTH_SUBRESOURCE_RANGE),
            ResourceId::Swapchain => (self.swapchain_image, COLOR_SUBRESOURCE_RANGE),
            other => panic!("{other:?} is not an image"),
        }
    }
}

/// Record the frame program into the context's command buffer.
///
/// # Safety
///
/// The command buffer must be in the recording state and every handle in the
/// context must be live. The program must have passed [`validate`].
pub unsafe fn record(program: &FrameProgram, ctx: &mut RecordContext<'_>) {
    let device = ctx.device;
    let cmd = ctx.cmd;
    let sets = [ctx.frame_set, ctx.bindless_set];
    unsafe {
        for bind_point in [vk::PipelineBindPoint::COMPUTE, vk::PipelineBindPoint::GRAPHICS] {
            device.cmd_bind_descriptor_sets(cmd, bind_point, ctx.pipelines.layout, 0, &sets, &[]);
        }
    }

    for step in &program.steps {
        match step {
            FrameStep::FillBuffer {
                buffer,
                offset,
                size,
                value,
            } => unsafe {
                device.cmd_fill_buffer(cmd, ctx.buffer(*buffer), *offset, *size, *value);
            },
            FrameStep::Barrier { global, images } => {
                let global_barrier = global
                    .as_ref()
                    .map(|g| GlobalBarrier::new(g.prev.clone(), g.next.clone()));
                let image_barriers: Vec<ImageBarrier> = images
                    .iter()
                    .map(|decl| {
                        let (image, range) = ctx.image(decl.resource);
                        let mut b = ImageBarrier::new(decl.prev, decl.next, ctx.queue_family, image)
                            .with_subresource_range(range);
                        if decl.discard {
                            b = b.discard();
                        }
                        b
                    })
                    .collect();
                unsafe {
                    barrier::pipeline_barrier(device, cmd, global_barrier.as_ref(), &image_barriers);
                }
            }
            FrameStep::PushIndex(index) => unsafe {
                device.cmd_push_constants(
                    cmd,
                    ctx.pipelines.layout,
                    vk::ShaderStageFlags::COMPUTE
                        | vk::ShaderStageFlags::VERTEX
                        | vk::ShaderStageFlags::FRAGMENT,
                    0,
                    &index.to_ne_bytes(),
                );
            },
            FrameStep::Dispatch {
                pipeline, groups, ..
            } => unsafe {
                device.cmd_bind_pipeline(
                    cmd,
                    vk::PipelineBindPoint::COMPUTE,
                    ctx.pipelines.get(*pipeline),
                );
                device.cmd_dispatch(cmd, groups[0], groups[1], groups[2]);
            },
            FrameStep::DispatchIndirect { pipeline, pass, .. } => unsafe {
                device.cmd_bind_pipeline(
                    cmd,
                    vk::PipelineBindPoint::COMPUTE,
                    ctx.pipelines.get(*pipeline),
                );
                device.cmd_dispatch_indirect(
                    cmd,
                    ctx.resources.dispatch_buffer.buffer,
                    dispatch_args_offset(*pass),
                );
            },
            FrameStep::BeginRendering(target) => begin_rendering(ctx, *target, program.extent),
            FrameStep::DrawIndirectCount {
                pipeline,
                pass,
                bucket,
            } => unsafe {
                device.cmd_bind_pipeline(
                    cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    ctx.pipelines.get(*pipeline),
                );
                device.cmd_draw_indirect_count(
                    cmd,
                    ctx.resources.draw_calls_buffer.buffer,
                    draw_commands_offset(*pass, *bucket),
                    ctx.resources.misc_buffer.buffer,
                    draw_count_offset(*pass, *bucket),
                    bucket_capacity(*bucket),
                    std::mem::size_of::<DrawIndirectCommand>() as u32,
                );
            },
            FrameStep::EndRendering => unsafe {
                device.cmd_end_rendering(cmd);
            },
            FrameStep::UiPass => {
                record_ui_pass(ctx, program.extent);
            }
        }
    }
}

unsafe fn begin_rendering(ctx: &RecordContext<'_>, target: RenderTarget, extent: vk::Extent2D) {
    let device = ctx.device;
    let cmd = ctx.cmd;

    // Reverse-z throughout: depth clears to 0, far plane at infinity.
    let depth_clear = vk::ClearValue {
        depth_stencil: vk::ClearDepthStencilValue {
            depth: 0.0,
            stencil: 0,
        },
    };

    match target {
        RenderTarget::Visbuffer => {
            let color_attachments = [vk::RenderingAttachmentInfo::default()
                .image_view(ctx.targets.visbuffer.view)
                .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::STORE)
                .clear_value(vk::ClearValue {
                    // All-ones is the "no triangle" sentinel in the
                    // visibility encoding.
                    color: vk::ClearColorValue {
                        uint32: [u32::MAX; 4],
                    },
                })];
            let depth_attachment = vk::RenderingAttachmentInfo::default()
                .image_view(ctx.targets.depth.view)
                .image_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::STORE)
                .clear_value(depth_clear);
            let rendering_info = vk::RenderingInfo::default()
                .render_area(vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent,
                })
                .layer_count(1)
                .color_attachments(&color_attachments)
                .depth_attachment(&depth_attachment);
            unsafe {
                device.cmd_begin_rendering(cmd, &rendering_info);
            }
            set_viewport(ctx, extent);
        }
        RenderTarget::ShadowCascade(cascade) => {
            let shadow_extent = vk::Extent2D {
                width: SHADOW_MAP_SIZE,
                height: SHADOW_MAP_SIZE,
            };
            let depth_attachment = vk::RenderingAttachmentInfo::default()
                .image_view(ctx.resources.shadow_layer_views[cascade as usize])
                .image_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::STORE)
                .clear_value(depth_clear);
            let rendering_info = vk::RenderingInfo::default()
                .render_area(vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent: shadow_extent,
                })
                .layer_count(1)
                .depth_attachment(&depth_attachment);
            unsafe {
                device.cmd_begin_rendering(cmd, &rendering_info);
            }
            set_viewport(ctx, shadow_extent);
        }
    }
}

unsafe fn set_viewport(ctx: &RecordContext<'_>, extent: vk::Extent2D) {
    let viewport = vk::Viewport {
        x: 0.0,
        y: 0.0,
        width: extent.width as f32,
        height: extent.height as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    };
    let scissor = vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent,
    };
    unsafe {
        ctx.device.cmd_set_viewport(ctx.cmd, 0, &[viewport]);
        ctx.device.cmd_set_scissor(ctx.cmd, 0, &[scissor]);
    }
}

unsafe fn record_ui_pass(ctx: &mut RecordContext<'_>, extent: vk::Extent2D) {
    let color_attachments = [vk::RenderingAttachmentInfo::default()
        .image_view(ctx.swapchain_view)
        .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        .load_op(vk::AttachmentLoadOp::LOAD)
        .store_op(vk::AttachmentStoreOp::STORE)];
    let rendering_info = vk::RenderingInfo::default()
        .render_area(vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        })
        .layer_count(1)
        .color_attachments(&color_attachments);
    unsafe {
        ctx.device.cmd_begin_rendering(ctx.cmd, &rendering_info);
    }
    (ctx.ui_paint)(ctx.cmd);
    unsafe {
        ctx.device.cmd_end_rendering(ctx.cmd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    #[test]
    fn test_built_program_validates() {
        for (w, h, n) in [(640, 480, 0), (1920, 1080, 100), (800, 600, 4096)] {
            let program = build_frame_program(extent(w, h), n);
            if let Err(errors) = validate(&program) {
                panic!("program {w}x{h}/{n} instances invalid: {errors:#?}");
            }
        }
    }

    #[test]
    fn test_program_shape_is_occupancy_independent() {
        let empty = build_frame_program(extent(1280, 720), 0);
        let full = build_frame_program(extent(1280, 720), 4096);
        assert_eq!(empty.steps.len(), full.steps.len());
        for (a, b) in empty.steps.iter().zip(full.steps.iter()) {
            assert_eq!(std::mem::discriminant(a), std::mem::discriminant(b));
        }
    }

    #[test]
    fn test_program_draw_and_ui_structure() {
        let program = build_frame_program(extent(1280, 720), 16);
        let draw_count = program
            .steps
            .iter()
            .filter(|s| matches!(s, FrameStep::DrawIndirectCount { .. }))
            .count();
        // Opaque + alpha-clip for the main view and each of the 4 cascades.
        assert_eq!(draw_count, 10);

        let ui_position = program
            .steps
            .iter()
            .position(|s| matches!(s, FrameStep::UiPass))
            .expect("ui pass missing");
        assert_eq!(ui_position, program.steps.len() - 2);

        match program.steps.last().unwrap() {
            FrameStep::Barrier { images, .. } => {
                assert_eq!(images.len(), 1);
                assert_eq!(images[0].resource, ResourceId::Swapchain);
                assert_eq!(images[0].next, AccessType::Present);
            }
            other => panic!("last step is {other:?}, expected the present barrier"),
        }
    }

    #[test]
    fn test_first_use_transitions_are_batched() {
        let program = build_frame_program(extent(1280, 720), 16);
        let first_barrier = program
            .steps
            .iter()
            .find_map(|s| match s {
                FrameStep::Barrier { global, images } => Some((global, images)),
                _ => None,
            })
            .expect("no barrier in program");
        // All five images move to their write states in one call.
        assert_eq!(first_barrier.1.len(), 5);
        assert!(first_barrier.1.iter().all(|decl| decl.discard));
        assert!(first_barrier.0.is_some());
    }

    #[test]
    fn test_missing_barrier_between_write_and_read_is_flagged() {
        let program = FrameProgram {
            steps: vec![
                FrameStep::Dispatch {
                    pipeline: PipelineId::InstanceCull,
                    groups: [1, 1, 1],
                    accesses: vec![StepAccess::write(
                        ResourceId::DrawCalls,
                        AccessType::ComputeShaderWrite,
                    )],
                },
                FrameStep::Dispatch {
                    pipeline: PipelineId::MeshletCull,
                    groups: [1, 1, 1],
                    accesses: vec![StepAccess::read(
                        ResourceId::DrawCalls,
                        AccessType::ComputeShaderReadStorage,
                    )],
                },
            ],
            extent: extent(64, 64),
        };
        let errors = validate(&program).unwrap_err();
        assert!(errors[0].contains("unguarded"));
    }

    #[test]
    fn test_read_access_not_covered_by_barrier_is_flagged() {
        let program = FrameProgram {
            steps: vec![
                FrameStep::Dispatch {
                    pipeline: PipelineId::MeshletCull,
                    groups: [1, 1, 1],
                    accesses: vec![StepAccess::read_write(
                        ResourceId::Misc,
                        AccessType::ComputeShaderReadWrite,
                    )],
                },
                FrameStep::Barrier {
                    global: Some(GlobalBarrierDecl {
                        prev: vec![AccessType::ComputeShaderReadWrite],
                        next: vec![AccessType::IndirectBuffer],
                    }),
                    images: Vec::new(),
                },
                FrameStep::Dispatch {
                    pipeline: PipelineId::DepthReduce,
                    groups: [1, 1, 1],
                    accesses: vec![StepAccess::read(
                        ResourceId::Misc,
                        AccessType::ComputeShaderReadStorage,
                    )],
                },
            ],
            extent: extent(64, 64),
        };
        let errors = validate(&program).unwrap_err();
        assert!(errors[0].contains("not made visible"));
    }

    #[test]
    fn test_discard_after_read_is_flagged() {
        let program = FrameProgram {
            steps: vec![
                FrameStep::Dispatch {
                    pipeline: PipelineId::DeferredLighting,
                    groups: [1, 1, 1],
                    accesses: vec![StepAccess::read(
                        ResourceId::Visbuffer,
                        AccessType::ComputeShaderReadStorage,
                    )],
                },
                FrameStep::Barrier {
                    global: None,
                    images: vec![ImageBarrierDecl {
                        resource: ResourceId::Visbuffer,
                        prev: AccessType::None,
                        next: AccessType::ColorAttachmentWrite,
                        discard: true,
                    }],
                },
            ],
            extent: extent(64, 64),
        };
        let errors = validate(&program).unwrap_err();
        assert!(errors[0].contains("discard"));
    }

    #[test]
    fn test_barrier_previous_access_mismatch_is_flagged() {
        let program = FrameProgram {
            steps: vec![
                FrameStep::Dispatch {
                    pipeline: PipelineId::DeferredLighting,
                    groups: [1, 1, 1],
                    accesses: vec![StepAccess::write(
                        ResourceId::SceneColor,
                        AccessType::ComputeShaderWrite,
                    )],
                },
                FrameStep::Barrier {
                    global: None,
                    images: vec![ImageBarrierDecl {
                        resource: ResourceId::SceneColor,
                        prev: AccessType::ColorAttachmentWrite,
                        next: AccessType::FragmentShaderReadSampled,
                        discard: false,
                    }],
                },
            ],
            extent: extent(64, 64),
        };
        let errors = validate(&program).unwrap_err();
        assert!(errors[0].contains("previous access"));
    }

    #[test]
    fn test_draw_outside_rendering_scope_is_flagged() {
        let program = FrameProgram {
            steps: vec![FrameStep::DrawIndirectCount {
                pipeline: PipelineId::VisbufferOpaque,
                pass: DrawPass::Main,
                bucket: DrawBucket::Opaque,
            }],
            extent: extent(64, 64),
        };
        let errors = validate(&program).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("outside a rendering scope")));
    }

    #[test]
    fn test_group_count_never_zero() {
        assert_eq!(group_count(0, CULL_WORKGROUP_SIZE), 1);
        assert_eq!(group_count(64, 64), 1);
        assert_eq!(group_count(65, 64), 2);
    }
}
