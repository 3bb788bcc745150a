//! Scene components

use bevy_ecs::prelude::*;
use glam::{EulerRot, Mat3, Mat4, Quat, Vec3};

use crate::assets::{INVALID_MODEL_INDEX, INVALID_TEXTURE_INDEX};

/// Human-readable entity name
#[derive(Component, Debug, Clone, PartialEq, Eq, Default)]
pub struct Tag(pub String);

/// Transform component with Euler rotation in radians, applied Y then X then Z
#[derive(Component, Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub translation: Vec3,
    pub rotation: Vec3,
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            translation: Vec3::ZERO,
            rotation: Vec3::ZERO,
            scale: Vec3::ONE,
        }
    }
}

impl Transform {
    pub fn new(translation: Vec3, rotation: Vec3, scale: Vec3) -> Self {
        Self {
            translation,
            rotation,
            scale,
        }
    }

    pub fn from_translation(translation: Vec3) -> Self {
        Self {
            translation,
            ..Default::default()
        }
    }

    pub fn quat(&self) -> Quat {
        Quat::from_euler(EulerRot::YXZ, self.rotation.y, self.rotation.x, self.rotation.z)
    }

    /// Translate * Ry * Rx * Rz * Scale
    pub fn mat4(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, self.quat(), self.translation)
    }

    /// Inverse transpose of the upper 3x3 of [`mat4`](Self::mat4)
    pub fn normal_matrix(&self) -> Mat4 {
        let inverse_scale = Mat3::from_diagonal(self.scale.recip());
        Mat4::from_mat3(Mat3::from_quat(self.quat()) * inverse_scale)
    }
}

/// Reference to a model in the model library
#[derive(Component, Debug, Clone, PartialEq, Eq)]
pub struct ModelComponent {
    pub path: String,
    /// Resolved library index, or [`INVALID_MODEL_INDEX`] until resolved
    pub model_index: u32,
    /// Used for meshes that bring no texture of their own
    pub fallback_texture: u32,
}

impl ModelComponent {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            model_index: INVALID_MODEL_INDEX,
            fallback_texture: INVALID_TEXTURE_INDEX,
        }
    }

    pub fn with_index(path: impl Into<String>, model_index: u32) -> Self {
        Self {
            model_index,
            ..Self::new(path)
        }
    }
}

/// Point light, positioned by the entity's transform
#[derive(Component, Debug, Clone, Copy, PartialEq)]
pub struct PointLightComponent {
    pub color: Vec3,
    pub intensity: f32,
    /// Billboard radius
    pub radius: f32,
}

impl Default for PointLightComponent {
    fn default() -> Self {
        Self {
            color: Vec3::ONE,
            intensity: 0.2,
            radius: 0.1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::FRAC_PI_2;

    #[test]
    fn test_transform_identity() {
        let transform = Transform::default();
        assert_eq!(transform.mat4(), Mat4::IDENTITY);
        assert_eq!(transform.normal_matrix(), Mat4::IDENTITY);
    }

    #[test]
    fn test_yxz_order() {
        let transform = Transform::new(Vec3::ZERO, Vec3::new(FRAC_PI_2, FRAC_PI_2, 0.0), Vec3::ONE);
        let expected = Mat4::from_rotation_y(FRAC_PI_2) * Mat4::from_rotation_x(FRAC_PI_2);
        assert!(transform.mat4().abs_diff_eq(expected, 1e-5));
    }

    #[test]
    fn test_normal_matrix_is_inverse_transpose() {
        let transform = Transform::new(
            Vec3::new(1.0, 2.0, 3.0),
            Vec3::new(0.3, -0.7, 1.1),
            Vec3::new(2.0, 0.5, 4.0),
        );
        let expected = Mat3::from_mat4(transform.mat4()).inverse().transpose();
        let actual = Mat3::from_mat4(transform.normal_matrix());
        assert!(actual.abs_diff_eq(expected, 1e-4));
    }

    #[test]
    fn test_model_component_starts_unresolved() {
        let model = ModelComponent::new("assets/models/cube.obj");
        assert_eq!(model.model_index, INVALID_MODEL_INDEX);
        assert_eq!(model.fallback_texture, INVALID_TEXTURE_INDEX);
    }
}
