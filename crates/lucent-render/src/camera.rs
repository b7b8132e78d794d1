//! Camera and the model-view-projection uniform it produces.

use glam::{Mat4, Vec3};

/// Perspective camera.
#[derive(Debug, Clone)]
pub struct Camera {
    pub position: Vec3,
    pub direction: Vec3,
    pub up: Vec3,
    pub fov: f32,
    pub aspect: f32,
    pub near: f32,
    pub far: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 0.0, 5.0),
            direction: Vec3::NEG_Z,
            up: Vec3::Y,
            fov: std::f32::consts::FRAC_PI_4,
            aspect: 4.0 / 3.0,
            near: 0.1,
            far: 100.0,
        }
    }
}

impl Camera {
    /// Camera at `position` looking at `target`.
    pub fn looking_at(position: Vec3, target: Vec3, aspect: f32) -> Self {
        Self {
            position,
            direction: (target - position).try_normalize().unwrap_or(Vec3::NEG_Z),
            aspect,
            ..Self::default()
        }
    }

    pub fn look_at(&mut self, target: Vec3) {
        self.direction = (target - self.position)
            .try_normalize()
            .unwrap_or(self.direction);
    }

    /// Match the aspect ratio to a surface size. Zero-sized surfaces are ignored.
    pub fn set_viewport(&mut self, width: u32, height: u32) {
        if width > 0 && height > 0 {
            self.aspect = width as f32 / height as f32;
        }
    }

    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_to_rh(self.position, self.direction, self.up)
    }

    /// Right-handed perspective with Y pointing down in clip space.
    pub fn projection_matrix(&self) -> Mat4 {
        let mut projection = Mat4::perspective_rh(self.fov, self.aspect, self.near, self.far);
        projection.y_axis.y *= -1.0;
        projection
    }

    pub fn view_projection_matrix(&self) -> Mat4 {
        self.projection_matrix() * self.view_matrix()
    }

    /// Transform uniform for an object placed by `model`.
    pub fn transform(&self, model: Mat4) -> Transform {
        Transform {
            model: model.to_cols_array_2d(),
            view: self.view_matrix().to_cols_array_2d(),
            projection: self.projection_matrix().to_cols_array_2d(),
        }
    }
}

/// Model, view and projection matrices as laid out in a std140 uniform block.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Transform {
    pub model: [[f32; 4]; 4],
    pub view: [[f32; 4]; 4],
    pub projection: [[f32; 4]; 4],
}

impl Default for Transform {
    fn default() -> Self {
        Camera::default().transform(Mat4::IDENTITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn projection_flips_y_for_vulkan() {
        let camera = Camera::default();
        let clip = camera.view_projection_matrix()
            * Vec3::new(0.0, 1.0, 0.0).extend(1.0);
        assert!(clip.y / clip.w < 0.0);
    }

    #[test]
    fn zero_viewport_keeps_aspect() {
        let mut camera = Camera::default();
        camera.set_viewport(1600, 800);
        assert!((camera.aspect - 2.0).abs() < f32::EPSILON);
        camera.set_viewport(0, 800);
        assert!((camera.aspect - 2.0).abs() < f32::EPSILON);
    }

    #[test]
    fn transform_is_three_matrices() {
        assert_eq!(std::mem::size_of::<Transform>(), 192);
        let transform = Camera::default().transform(Mat4::from_translation(Vec3::X));
        assert!((transform.model[3][0] - 1.0).abs() < f32::EPSILON);
    }
}
