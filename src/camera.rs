//! Camera and per-frame uniform assembly.
//!
//! Projection is infinite reverse-z: depth 1.0 at the near plane falling to
//! 0.0 at infinity. Everything downstream assumes this convention — the depth
//! clear value is 0.0, depth tests are GREATER, and the depth reduction reads
//! min/max straight off the reversed range.

use glam::{Mat4, Vec3};

use crate::gpu_data::Uniforms;

/// A look-at camera with an infinite reverse-z projection.
#[derive(Debug, Clone)]
pub struct Camera {
    pub position: Vec3,
    pub target: Vec3,
    pub up: Vec3,
    /// Vertical field of view, radians.
    pub fov_y: f32,
    pub z_near: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 2.0, 5.0),
            target: Vec3::ZERO,
            up: Vec3::Y,
            fov_y: 60f32.to_radians(),
            z_near: 0.1,
        }
    }
}

impl Camera {
    pub fn view(&self) -> Mat4 {
        Mat4::look_at_rh(self.position, self.target, self.up)
    }

    /// Infinite reverse-z projection with the Y axis flipped for Vulkan's
    /// downward clip space.
    pub fn projection(&self, aspect: f32) -> Mat4 {
        let mut proj = Mat4::perspective_infinite_reverse_rh(self.fov_y, aspect, self.z_near);
        proj.y_axis.y *= -1.0;
        proj
    }

    /// Assemble the per-frame uniform block consumed by every pass.
    pub fn uniforms(
        &self,
        framebuffer_extent: (u32, u32),
        instance_count: u32,
        sun_direction: Vec3,
    ) -> Uniforms {
        let aspect = framebuffer_extent.0 as f32 / framebuffer_extent.1.max(1) as f32;
        let view = self.view();
        let view_proj = self.projection(aspect) * view;
        Uniforms {
            view_proj,
            inverse_view_proj: view_proj.inverse(),
            view,
            camera_position: self.position.extend(1.0),
            sun_direction: sun_direction.normalize().extend(0.0),
            framebuffer_extent: [framebuffer_extent.0, framebuffer_extent.1],
            instance_count,
            _pad: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec4;

    fn project(view_proj: Mat4, point: Vec3) -> Vec4 {
        let clip = view_proj * point.extend(1.0);
        clip / clip.w
    }

    fn camera_at_origin() -> Camera {
        Camera {
            position: Vec3::ZERO,
            target: Vec3::new(0.0, 0.0, -1.0),
            up: Vec3::Y,
            fov_y: 90f32.to_radians(),
            z_near: 0.1,
        }
    }

    #[test]
    fn test_depth_is_reversed() {
        let camera = camera_at_origin();
        let view_proj = camera.projection(1.0) * camera.view();

        let near = project(view_proj, Vec3::new(0.0, 0.0, -0.1));
        let far = project(view_proj, Vec3::new(0.0, 0.0, -10_000.0));

        // Near plane lands at depth 1, the far distance approaches 0.
        assert!((near.z - 1.0).abs() < 1e-4, "near depth was {}", near.z);
        assert!(far.z < 1e-3, "far depth was {}", far.z);
        assert!(far.z >= 0.0);
    }

    #[test]
    fn test_vulkan_y_flip() {
        let camera = camera_at_origin();
        let view_proj = camera.projection(1.0) * camera.view();

        // A point above the camera axis projects to negative clip y, which
        // Vulkan maps to the upper half of the viewport.
        let above = project(view_proj, Vec3::new(0.0, 1.0, -2.0));
        assert!(above.y < 0.0);
    }

    #[test]
    fn test_uniforms_assembly() {
        let camera = Camera::default();
        let uniforms = camera.uniforms((1920, 1080), 42, Vec3::new(0.3, -1.0, 0.2));

        assert_eq!(uniforms.framebuffer_extent, [1920, 1080]);
        assert_eq!(uniforms.instance_count, 42);
        // Sun direction is normalized with w = 0.
        let sun = uniforms.sun_direction;
        let len = (sun.x * sun.x + sun.y * sun.y + sun.z * sun.z).sqrt();
        assert!((len - 1.0).abs() < 1e-5);
        assert_eq!(sun.w, 0.0);

        // inverse_view_proj really is the inverse.
        let product = uniforms.view_proj * uniforms.inverse_view_proj;
        let identity = Mat4::IDENTITY;
        for col in 0..4 {
            let diff = product.col(col) - identity.col(col);
            assert!(diff.length() < 1e-4);
        }
    }
}
