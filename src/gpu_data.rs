//! CPU↔GPU shared data layouts.
//!
//! Everything here is `#[repr(C)]` + `bytemuck::Pod` and mirrors the GLSL
//! declarations byte for byte. Offsets into the misc storage buffer and the
//! draw-calls buffer are a committed binary layout: culling shaders write at
//! these offsets and `vkCmdDrawIndirectCount` reads at them, so changing any
//! constant is a shader-interface break.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec4};

/// Draw-command capacity of the opaque bucket, per pass.
pub const MAX_OPAQUE_DRAWS: u32 = 512;
/// Draw-command capacity of the alpha-clip bucket, per pass.
pub const MAX_ALPHA_CLIP_DRAWS: u32 = 512;
/// Number of shadow cascades.
pub const SHADOW_CASCADE_COUNT: u32 = 4;
/// Passes that consume draw commands: the main view plus each cascade.
pub const PASS_COUNT: u32 = 1 + SHADOW_CASCADE_COUNT;

/// Which draw bucket a command belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawBucket {
    Opaque,
    AlphaClip,
}

/// Which pass a draw-command region or counter belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawPass {
    Main,
    Cascade(u32),
}

impl DrawPass {
    pub fn index(self) -> u32 {
        match self {
            Self::Main => 0,
            Self::Cascade(i) => {
                assert!(i < SHADOW_CASCADE_COUNT, "cascade index {i} out of range");
                1 + i
            }
        }
    }
}

/// Matches `VkDrawIndirectCommand`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct DrawIndirectCommand {
    pub vertex_count: u32,
    pub instance_count: u32,
    pub first_vertex: u32,
    pub first_instance: u32,
}

/// Matches `VkDispatchIndirectCommand`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct DispatchIndirectCommand {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

/// Per-frame uniform block.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct Uniforms {
    pub view_proj: Mat4,
    pub inverse_view_proj: Mat4,
    pub view: Mat4,
    pub camera_position: Vec4,
    pub sun_direction: Vec4,
    pub framebuffer_extent: [u32; 2],
    pub instance_count: u32,
    pub _pad: u32,
}

const _: () = assert!(std::mem::size_of::<Uniforms>() == 240);

/// Instance flag: route draws through the alpha-clip bucket.
pub const INSTANCE_FLAG_ALPHA_CLIP: u32 = 1;

/// One renderable instance as seen by the instance-culling shader.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct Instance {
    pub transform: Mat4,
    /// Index into the registered-mesh table.
    pub mesh_index: u32,
    /// Bindless slot of the base color texture.
    pub base_color_slot: u32,
    pub flags: u32,
    pub _pad: u32,
}

const _: () = assert!(std::mem::size_of::<Instance>() == 80);

/// Device addresses of one registered mesh's buffers. Shaders chase these
/// pointers instead of binding per-mesh descriptor sets.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct MeshBufferAddresses {
    pub positions: u64,
    pub normals: u64,
    pub uvs: u64,
    pub indices: u64,
    pub micro_indices: u64,
    pub meshlets: u64,
    pub meshlet_count: u32,
    /// Nonzero when `indices` holds 32-bit values.
    pub index_width_32: u32,
}

const _: () = assert!(std::mem::size_of::<MeshBufferAddresses>() == 56);

// ---------------------------------------------------------------------------
// Misc storage buffer layout.
//
//   [0, 256)    4 cascade view-projection matrices
//   [256, 260)  min depth (u32 bits of f32, atomic)
//   [260, 264)  max depth (u32 bits of f32, atomic)
//   [264, 304)  draw counts: (opaque, alpha-clip) × (main + 4 cascades)
// ---------------------------------------------------------------------------

pub const CASCADE_MATRICES_OFFSET: u64 = 0;
pub const MIN_DEPTH_OFFSET: u64 =
    (SHADOW_CASCADE_COUNT as u64) * std::mem::size_of::<Mat4>() as u64;
pub const MAX_DEPTH_OFFSET: u64 = MIN_DEPTH_OFFSET + 4;
pub const DRAW_COUNTS_OFFSET: u64 = MAX_DEPTH_OFFSET + 4;
pub const MISC_BUFFER_SIZE: u64 = DRAW_COUNTS_OFFSET + (PASS_COUNT as u64) * 2 * 4;

/// Byte offset of one pass/bucket draw counter in the misc buffer.
pub fn draw_count_offset(pass: DrawPass, bucket: DrawBucket) -> u64 {
    let bucket_index = match bucket {
        DrawBucket::Opaque => 0,
        DrawBucket::AlphaClip => 1,
    };
    DRAW_COUNTS_OFFSET + ((pass.index() as u64) * 2 + bucket_index) * 4
}

// ---------------------------------------------------------------------------
// Draw-calls buffer layout: per pass, a fixed 512-command opaque region
// followed by a fixed 512-command alpha-clip region.
// ---------------------------------------------------------------------------

const DRAWS_PER_PASS: u64 = (MAX_OPAQUE_DRAWS + MAX_ALPHA_CLIP_DRAWS) as u64;
pub const DRAW_CALLS_BUFFER_SIZE: u64 =
    (PASS_COUNT as u64) * DRAWS_PER_PASS * std::mem::size_of::<DrawIndirectCommand>() as u64;

/// Byte offset of one pass/bucket draw-command region.
pub fn draw_commands_offset(pass: DrawPass, bucket: DrawBucket) -> u64 {
    let bucket_base = match bucket {
        DrawBucket::Opaque => 0,
        DrawBucket::AlphaClip => MAX_OPAQUE_DRAWS as u64,
    };
    ((pass.index() as u64) * DRAWS_PER_PASS + bucket_base)
        * std::mem::size_of::<DrawIndirectCommand>() as u64
}

// ---------------------------------------------------------------------------
// Dispatch-args buffer: one DispatchIndirectCommand per pass, written by the
// instance-culling pass and consumed by the indirect meshlet-culling dispatch.
// Culled-instances buffer: per pass, a fixed window of surviving instance
// indices appended by the instance-culling pass.
// ---------------------------------------------------------------------------

/// Instance capacity of the instance buffer and of each culled-instance
/// window.
pub const MAX_INSTANCES: u64 = 4096;

/// Capacity of the registered-mesh address table.
pub const MAX_MESHES: u64 = 1024;

pub const DISPATCH_BUFFER_SIZE: u64 =
    (PASS_COUNT as u64) * std::mem::size_of::<DispatchIndirectCommand>() as u64;

/// Byte offset of one pass's dispatch arguments.
pub fn dispatch_args_offset(pass: DrawPass) -> u64 {
    (pass.index() as u64) * std::mem::size_of::<DispatchIndirectCommand>() as u64
}

pub const CULLED_INSTANCES_BUFFER_SIZE: u64 = (PASS_COUNT as u64) * MAX_INSTANCES * 4;

/// Byte offset of one pass's culled-instance window.
pub fn culled_instances_offset(pass: DrawPass) -> u64 {
    (pass.index() as u64) * MAX_INSTANCES * 4
}

/// Maximum draw count for one bucket, as passed to `vkCmdDrawIndirectCount`.
pub fn bucket_capacity(bucket: DrawBucket) -> u32 {
    match bucket {
        DrawBucket::Opaque => MAX_OPAQUE_DRAWS,
        DrawBucket::AlphaClip => MAX_ALPHA_CLIP_DRAWS,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_misc_buffer_layout() {
        assert_eq!(MIN_DEPTH_OFFSET, 256);
        assert_eq!(MAX_DEPTH_OFFSET, 260);
        assert_eq!(DRAW_COUNTS_OFFSET, 264);
        assert_eq!(MISC_BUFFER_SIZE, 304);
    }

    #[test]
    fn test_draw_count_offsets_are_distinct_and_in_bounds() {
        let mut offsets = Vec::new();
        for pass in [
            DrawPass::Main,
            DrawPass::Cascade(0),
            DrawPass::Cascade(1),
            DrawPass::Cascade(2),
            DrawPass::Cascade(3),
        ] {
            for bucket in [DrawBucket::Opaque, DrawBucket::AlphaClip] {
                offsets.push(draw_count_offset(pass, bucket));
            }
        }
        for offset in &offsets {
            assert!(*offset >= DRAW_COUNTS_OFFSET);
            assert!(*offset + 4 <= MISC_BUFFER_SIZE);
        }
        let mut sorted = offsets.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), offsets.len());
    }

    #[test]
    fn test_draw_command_regions_do_not_overlap() {
        // Alpha-clip region of each pass starts exactly where the opaque
        // region's capacity ends.
        for i in 0..PASS_COUNT {
            let pass = if i == 0 {
                DrawPass::Main
            } else {
                DrawPass::Cascade(i - 1)
            };
            let opaque = draw_commands_offset(pass, DrawBucket::Opaque);
            let alpha = draw_commands_offset(pass, DrawBucket::AlphaClip);
            assert_eq!(
                alpha - opaque,
                (MAX_OPAQUE_DRAWS as u64) * std::mem::size_of::<DrawIndirectCommand>() as u64
            );
        }
        assert_eq!(draw_commands_offset(DrawPass::Main, DrawBucket::Opaque), 0);
        assert_eq!(
            draw_commands_offset(DrawPass::Cascade(0), DrawBucket::Opaque),
            1024 * 16
        );
        assert_eq!(DRAW_CALLS_BUFFER_SIZE, 5 * 1024 * 16);
    }

    #[test]
    fn test_dispatch_and_culled_instance_regions() {
        assert_eq!(DISPATCH_BUFFER_SIZE, 5 * 12);
        assert_eq!(dispatch_args_offset(DrawPass::Main), 0);
        assert_eq!(dispatch_args_offset(DrawPass::Cascade(3)), 4 * 12);
        assert_eq!(culled_instances_offset(DrawPass::Cascade(0)), MAX_INSTANCES * 4);
        assert_eq!(CULLED_INSTANCES_BUFFER_SIZE, 5 * MAX_INSTANCES * 4);
    }

    #[test]
    #[should_panic(expected = "cascade index")]
    fn test_cascade_out_of_range_panics() {
        DrawPass::Cascade(SHADOW_CASCADE_COUNT).index();
    }
}
