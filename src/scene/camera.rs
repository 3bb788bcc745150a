//! Camera system
//!
//! Projections target Vulkan clip space: depth in `0..1`, y pointing down.

use glam::{EulerRot, Mat3, Mat4, Vec3, Vec4};

/// Camera for viewing the scene
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Camera {
    projection: Mat4,
    view: Mat4,
    inverse_view: Mat4,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            projection: Mat4::IDENTITY,
            view: Mat4::IDENTITY,
            inverse_view: Mat4::IDENTITY,
        }
    }
}

impl Camera {
    pub fn set_orthographic_projection(
        &mut self,
        left: f32,
        right: f32,
        top: f32,
        bottom: f32,
        near: f32,
        far: f32,
    ) {
        // Vulkan y points down, so our top edge is glam's bottom argument.
        self.projection = Mat4::orthographic_lh(left, right, top, bottom, near, far);
    }

    pub fn set_perspective_projection(&mut self, fov_y: f32, aspect: f32, near: f32, far: f32) {
        self.projection = Mat4::perspective_lh(fov_y, aspect, near, far);
    }

    pub fn set_view_direction(&mut self, position: Vec3, direction: Vec3, up: Vec3) {
        let w = direction.normalize();
        let u = w.cross(up).normalize();
        let v = w.cross(u);
        self.set_basis(position, u, v, w);
    }

    pub fn set_view_target(&mut self, position: Vec3, target: Vec3, up: Vec3) {
        self.set_view_direction(position, target - position, up);
    }

    /// View from `position` with Euler `rotation` applied Y, X, Z
    pub fn set_view_yxz(&mut self, position: Vec3, rotation: Vec3) {
        let basis = Mat3::from_euler(EulerRot::YXZ, rotation.y, rotation.x, rotation.z);
        self.set_basis(position, basis.x_axis, basis.y_axis, basis.z_axis);
    }

    fn set_basis(&mut self, position: Vec3, u: Vec3, v: Vec3, w: Vec3) {
        self.view = Mat4::from_cols(
            Vec4::new(u.x, v.x, w.x, 0.0),
            Vec4::new(u.y, v.y, w.y, 0.0),
            Vec4::new(u.z, v.z, w.z, 0.0),
            Vec4::new(-u.dot(position), -v.dot(position), -w.dot(position), 1.0),
        );
        self.inverse_view = Mat4::from_cols(
            u.extend(0.0),
            v.extend(0.0),
            w.extend(0.0),
            position.extend(1.0),
        );
    }

    pub fn projection(&self) -> Mat4 {
        self.projection
    }

    pub fn view(&self) -> Mat4 {
        self.view
    }

    pub fn inverse_view(&self) -> Mat4 {
        self.inverse_view
    }

    pub fn position(&self) -> Vec3 {
        self.inverse_view.w_axis.truncate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inverse_view_inverts_view() {
        let mut camera = Camera::default();
        camera.set_view_yxz(Vec3::new(1.0, -2.0, 3.0), Vec3::new(0.2, 1.3, -0.4));
        assert!((camera.inverse_view() * camera.view()).abs_diff_eq(Mat4::IDENTITY, 1e-5));

        camera.set_view_target(Vec3::new(0.0, -1.0, -5.0), Vec3::ZERO, Vec3::NEG_Y);
        assert!((camera.inverse_view() * camera.view()).abs_diff_eq(Mat4::IDENTITY, 1e-5));
        assert!(camera.position().abs_diff_eq(Vec3::new(0.0, -1.0, -5.0), 1e-6));
    }

    #[test]
    fn test_target_lands_on_view_axis() {
        let mut camera = Camera::default();
        camera.set_view_target(Vec3::new(0.0, 0.0, -5.0), Vec3::ZERO, Vec3::NEG_Y);
        let target = camera.view() * Vec4::new(0.0, 0.0, 0.0, 1.0);
        assert!(target.truncate().abs_diff_eq(Vec3::new(0.0, 0.0, 5.0), 1e-5));
    }

    #[test]
    fn test_perspective_depth_range() {
        let mut camera = Camera::default();
        camera.set_perspective_projection(50f32.to_radians(), 800.0 / 600.0, 0.1, 100.0);

        let near = camera.projection() * Vec4::new(0.0, 0.0, 0.1, 1.0);
        let far = camera.projection() * Vec4::new(0.0, 0.0, 100.0, 1.0);
        assert!((near.z / near.w).abs() < 1e-5);
        assert!((far.z / far.w - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_orthographic_top_edge() {
        let mut camera = Camera::default();
        camera.set_orthographic_projection(-1.0, 1.0, -1.0, 1.0, 0.0, 10.0);
        let top = camera.projection() * Vec4::new(0.0, -1.0, 0.0, 1.0);
        assert!((top.y + 1.0).abs() < 1e-5);
    }
}
