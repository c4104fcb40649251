//! Meshlet construction.
//!
//! Meshes are split into meshlets of at most [`MAX_MESHLET_TRIANGLES`]
//! triangles over at most [`MAX_MESHLET_VERTICES`] distinct vertices. The GPU
//! culling pass tests each meshlet's bounding sphere and normal cone and only
//! emits draw commands for survivors.
//!
//! Triangles inside a meshlet are stored as `u8` micro-indices into the
//! meshlet's vertex-index window, which in turn holds indices into the mesh's
//! vertex buffers. The vertex-index width (16 or 32 bit) mirrors the source
//! mesh so both can share one buffer upload path.

use bytemuck::{Pod, Zeroable};
use glam::Vec3;

/// Triangle capacity of one meshlet.
pub const MAX_MESHLET_TRIANGLES: u32 = 128;
/// Distinct-vertex capacity of one meshlet.
pub const MAX_MESHLET_VERTICES: u32 = 64;

/// One meshlet record as consumed by the culling shader.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct Meshlet {
    pub cone_apex: [f32; 3],
    /// Cosine of the cone half-angle; 1.0 disables cone culling.
    pub cone_cutoff: f32,
    pub cone_axis: [f32; 3],
    pub sphere_radius: f32,
    pub sphere_center: [f32; 3],
    /// Offset into the micro-index stream, in triangles (3 `u8` each).
    pub triangle_offset: u32,
    pub triangle_count: u32,
    /// Offset into the meshlet vertex-index stream.
    pub vertex_offset: u32,
    pub vertex_count: u32,
    pub _pad: u32,
}

const _: () = assert!(std::mem::size_of::<Meshlet>() == 64);

/// Meshlet vertex indices at the source mesh's index width.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshletIndices {
    U16(Vec<u16>),
    U32(Vec<u32>),
}

impl MeshletIndices {
    pub fn len(&self) -> usize {
        match self {
            Self::U16(v) => v.len(),
            Self::U32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, i: usize) -> u32 {
        match self {
            Self::U16(v) => v[i] as u32,
            Self::U32(v) => v[i],
        }
    }
}

/// Builder output: one mesh's meshlets plus the two index streams they
/// reference.
#[derive(Debug, Clone)]
pub struct MeshletData {
    pub meshlets: Vec<Meshlet>,
    /// Per-triangle local indices, 3 per triangle, each `< vertex_count` of
    /// its meshlet.
    pub micro_indices: Vec<u8>,
    pub indices: MeshletIndices,
}

impl MeshletData {
    pub fn triangle_count(&self) -> u32 {
        self.meshlets.iter().map(|m| m.triangle_count).sum()
    }
}

struct MeshletInProgress {
    triangle_offset: u32,
    vertex_offset: u32,
    /// Maps global vertex index to local micro-index.
    remap: Vec<(u32, u8)>,
    triangles: Vec<[u32; 3]>,
}

impl MeshletInProgress {
    fn new(triangle_offset: u32, vertex_offset: u32) -> Self {
        Self {
            triangle_offset,
            vertex_offset,
            remap: Vec::with_capacity(MAX_MESHLET_VERTICES as usize),
            triangles: Vec::with_capacity(MAX_MESHLET_TRIANGLES as usize),
        }
    }

    fn local_index(&self, global: u32) -> Option<u8> {
        self.remap.iter().find(|(g, _)| *g == global).map(|(_, l)| *l)
    }

    fn new_vertex_count(&self, tri: [u32; 3]) -> u32 {
        let mut fresh = 0;
        for (i, &v) in tri.iter().enumerate() {
            if self.local_index(v).is_none() && !tri[..i].contains(&v) {
                fresh += 1;
            }
        }
        fresh
    }

    fn fits(&self, tri: [u32; 3]) -> bool {
        self.triangles.len() < MAX_MESHLET_TRIANGLES as usize
            && self.remap.len() as u32 + self.new_vertex_count(tri) <= MAX_MESHLET_VERTICES
    }

    fn add(&mut self, tri: [u32; 3]) {
        for &v in &tri {
            if self.local_index(v).is_none() {
                let local = self.remap.len() as u8;
                self.remap.push((v, local));
            }
        }
        self.triangles.push(tri);
    }
}

/// Split `indices` (a triangle list) into meshlets.
///
/// Triangles are packed in input order: a meshlet is flushed when the next
/// triangle would exceed either capacity. Every input triangle lands in
/// exactly one meshlet.
///
/// When `use_32bit` is false the emitted vertex indices are `u16`; any source
/// index that does not fit 16 bits is a caller bug and panics here, so
/// loaders only choose the width and never re-validate.
///
/// Panics on a non-triangle-list index count and on degenerate meshlet
/// bounds (a zero-radius bounding sphere means the cull shader would treat
/// the meshlet as a point and drop geometry).
pub fn build_meshlets(indices: &[u32], positions: &[Vec3], use_32bit: bool) -> MeshletData {
    assert!(
        indices.len() % 3 == 0,
        "index count {} is not a triangle list",
        indices.len()
    );

    let mut meshlets = Vec::new();
    let mut micro_indices: Vec<u8> = Vec::new();
    let mut out_u16: Vec<u16> = Vec::new();
    let mut out_u32: Vec<u32> = Vec::new();
    let out_len = |u16s: &Vec<u16>, u32s: &Vec<u32>| {
        if use_32bit {
            u32s.len() as u32
        } else {
            u16s.len() as u32
        }
    };

    let mut current: Option<MeshletInProgress> = None;

    let mut flush = |mip: MeshletInProgress,
                     micro_indices: &mut Vec<u8>,
                     out_u16: &mut Vec<u16>,
                     out_u32: &mut Vec<u32>,
                     meshlets: &mut Vec<Meshlet>| {
        if mip.triangles.is_empty() {
            return;
        }
        for &(global, _) in &mip.remap {
            if use_32bit {
                out_u32.push(global);
            } else {
                assert!(
                    global < (1 << 16),
                    "vertex index {global} does not fit the 16-bit index stream"
                );
                out_u16.push(global as u16);
            }
        }
        for tri in &mip.triangles {
            for &v in tri {
                // Every vertex was remapped in add().
                micro_indices.push(mip.local_index(v).unwrap());
            }
        }
        let bounds = compute_bounds(&mip, positions);
        meshlets.push(Meshlet {
            cone_apex: bounds.sphere_center.to_array(),
            cone_cutoff: bounds.cone_cutoff,
            cone_axis: bounds.cone_axis.to_array(),
            sphere_radius: bounds.sphere_radius,
            sphere_center: bounds.sphere_center.to_array(),
            triangle_offset: mip.triangle_offset,
            triangle_count: mip.triangles.len() as u32,
            vertex_offset: mip.vertex_offset,
            vertex_count: mip.remap.len() as u32,
            _pad: 0,
        });
    };

    for tri_indices in indices.chunks_exact(3) {
        let tri = [tri_indices[0], tri_indices[1], tri_indices[2]];
        let needs_flush = current.as_ref().map(|m| !m.fits(tri)).unwrap_or(false);
        if needs_flush {
            let mip = current.take().unwrap();
            flush(mip, &mut micro_indices, &mut out_u16, &mut out_u32, &mut meshlets);
        }
        let mip = current.get_or_insert_with(|| {
            MeshletInProgress::new(
                micro_indices.len() as u32 / 3,
                out_len(&out_u16, &out_u32),
            )
        });
        mip.add(tri);
    }
    if let Some(mip) = current.take() {
        flush(mip, &mut micro_indices, &mut out_u16, &mut out_u32, &mut meshlets);
    }

    MeshletData {
        meshlets,
        micro_indices,
        indices: if use_32bit {
            MeshletIndices::U32(out_u32)
        } else {
            MeshletIndices::U16(out_u16)
        },
    }
}

struct MeshletBounds {
    sphere_center: Vec3,
    sphere_radius: f32,
    cone_axis: Vec3,
    cone_cutoff: f32,
}

fn compute_bounds(mip: &MeshletInProgress, positions: &[Vec3]) -> MeshletBounds {
    let mut min = Vec3::splat(f32::INFINITY);
    let mut max = Vec3::splat(f32::NEG_INFINITY);
    for &(global, _) in &mip.remap {
        let p = positions[global as usize];
        min = min.min(p);
        max = max.max(p);
    }
    let center = (min + max) * 0.5;
    let mut radius: f32 = 0.0;
    for &(global, _) in &mip.remap {
        radius = radius.max(positions[global as usize].distance(center));
    }
    assert!(
        radius > 0.0,
        "meshlet bounding sphere collapsed to a point at {center:?}"
    );

    // Area-weighted average of triangle normals. Cross product length is
    // twice the triangle area, so summing raw cross products weights by area.
    let mut axis_sum = Vec3::ZERO;
    let mut normals = Vec::with_capacity(mip.triangles.len());
    for tri in &mip.triangles {
        let a = positions[tri[0] as usize];
        let b = positions[tri[1] as usize];
        let c = positions[tri[2] as usize];
        let cross = (b - a).cross(c - a);
        axis_sum += cross;
        if cross.length_squared() > 0.0 {
            normals.push(cross.normalize());
        }
    }

    if axis_sum.length_squared() <= f32::EPSILON || normals.is_empty() {
        // No dominant direction; leave cone culling disabled.
        return MeshletBounds {
            sphere_center: center,
            sphere_radius: radius,
            cone_axis: Vec3::ZERO,
            cone_cutoff: 1.0,
        };
    }

    let axis = axis_sum.normalize();
    let min_dot = normals
        .iter()
        .map(|n| axis.dot(*n))
        .fold(f32::INFINITY, f32::min);

    MeshletBounds {
        sphere_center: center,
        sphere_radius: radius,
        cone_axis: axis,
        cone_cutoff: min_dot,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tri_positions() -> Vec<Vec3> {
        vec![
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(0.0, 1.0, 0.0),
        ]
    }

    /// Rebuild the global triangle list from meshlet windows + micro indices.
    fn reconstruct(data: &MeshletData) -> Vec<[u32; 3]> {
        let mut triangles = Vec::new();
        for m in &data.meshlets {
            for t in 0..m.triangle_count {
                let base = ((m.triangle_offset + t) * 3) as usize;
                let tri = [
                    data.indices
                        .get(m.vertex_offset as usize + data.micro_indices[base] as usize),
                    data.indices
                        .get(m.vertex_offset as usize + data.micro_indices[base + 1] as usize),
                    data.indices
                        .get(m.vertex_offset as usize + data.micro_indices[base + 2] as usize),
                ];
                triangles.push(tri);
            }
        }
        triangles
    }

    #[test]
    fn test_single_triangle_single_meshlet() {
        let data = build_meshlets(&[0, 1, 2], &tri_positions(), false);
        assert_eq!(data.meshlets.len(), 1);
        let m = &data.meshlets[0];
        assert_eq!(m.triangle_count, 1);
        assert_eq!(m.vertex_count, 3);
        assert!(m.sphere_radius > 0.0);
        assert_eq!(data.micro_indices, vec![0, 1, 2]);
        assert_eq!(data.indices, MeshletIndices::U16(vec![0, 1, 2]));
    }

    #[test]
    fn test_triangle_cap_splits_at_128() {
        // 130 triangles over 3 shared vertices: only the triangle cap binds.
        let mut indices = Vec::new();
        for _ in 0..130 {
            indices.extend_from_slice(&[0, 1, 2]);
        }
        let data = build_meshlets(&indices, &tri_positions(), false);
        assert_eq!(data.meshlets.len(), 2);
        assert_eq!(data.meshlets[0].triangle_count, 128);
        assert_eq!(data.meshlets[1].triangle_count, 2);
        assert_eq!(data.triangle_count(), 130);
    }

    #[test]
    fn test_vertex_cap_splits() {
        // 64 disconnected triangles, 3 unique vertices each. 21 triangles
        // reach 63 vertices; the 22nd would need 66, so meshlets hold 21.
        let mut indices = Vec::new();
        let mut positions = Vec::new();
        for t in 0..64u32 {
            let base = positions.len() as u32;
            positions.push(Vec3::new(t as f32, 0.0, 0.0));
            positions.push(Vec3::new(t as f32 + 1.0, 0.0, 0.0));
            positions.push(Vec3::new(t as f32, 1.0, 0.0));
            indices.extend_from_slice(&[base, base + 1, base + 2]);
        }
        let data = build_meshlets(&indices, &positions, true);
        assert_eq!(data.meshlets.len(), 4);
        for m in &data.meshlets[..3] {
            assert_eq!(m.triangle_count, 21);
            assert_eq!(m.vertex_count, 63);
        }
        assert_eq!(data.meshlets[3].triangle_count, 1);
        assert_eq!(data.triangle_count(), 64);
    }

    #[test]
    fn test_exact_cover_reconstruction() {
        // A grid strip with shared vertices, enough to split on both bounds.
        let mut positions = Vec::new();
        for i in 0..200u32 {
            positions.push(Vec3::new(i as f32, 0.0, 0.0));
            positions.push(Vec3::new(i as f32, 1.0, 0.0));
        }
        let mut indices = Vec::new();
        for i in 0..199u32 {
            let a = i * 2;
            indices.extend_from_slice(&[a, a + 1, a + 2]);
            indices.extend_from_slice(&[a + 2, a + 1, a + 3]);
        }
        let data = build_meshlets(&indices, &positions, true);

        let expected: Vec<[u32; 3]> = indices
            .chunks_exact(3)
            .map(|c| [c[0], c[1], c[2]])
            .collect();
        assert_eq!(reconstruct(&data), expected);

        for m in &data.meshlets {
            assert!(m.triangle_count <= MAX_MESHLET_TRIANGLES);
            assert!(m.vertex_count <= MAX_MESHLET_VERTICES);
            assert!(m.sphere_radius > 0.0);
        }
    }

    #[test]
    fn test_planar_meshlet_cone_is_tight() {
        let data = build_meshlets(&[0, 1, 2], &tri_positions(), false);
        let m = &data.meshlets[0];
        // A single flat triangle: axis equals the triangle normal, cutoff 1.
        assert!((Vec3::from(m.cone_axis).length() - 1.0).abs() < 1e-5);
        assert!((m.cone_cutoff - 1.0).abs() < 1e-5);
    }

    #[test]
    #[should_panic(expected = "bounding sphere collapsed")]
    fn test_degenerate_positions_panic() {
        let positions = vec![Vec3::ZERO; 3];
        build_meshlets(&[0, 1, 2], &positions, false);
    }

    #[test]
    #[should_panic(expected = "does not fit the 16-bit index stream")]
    fn test_index_overflow_in_16bit_mode_panics() {
        let mut positions = vec![Vec3::ZERO; 65537];
        positions[65534] = Vec3::X;
        positions[65535] = Vec3::Y;
        positions[65536] = Vec3::Z;
        build_meshlets(&[65534, 65535, 65536], &positions, false);
    }

    #[test]
    #[should_panic(expected = "not a triangle list")]
    fn test_non_triangle_list_panics() {
        build_meshlets(&[0, 1], &tri_positions(), false);
    }
}
