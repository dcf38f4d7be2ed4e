//! Rigid transformations from world space to camera space.

pub use super::*;

use nalgebra::{Matrix3, Matrix4, Rotation3, UnitQuaternion, Vector3, Vector4};

/// A rigid transformation from world space to camera space.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Pose {
    /// $ R_v \in \mathbb{R}^{3 \times 3} $
    pub rotation: Matrix3<f32>,
    /// $ T_v \in \mathbb{R}^3 $
    pub translation: Vector3<f32>,
}

impl Pose {
    /// Splitting the 4x4 view matrix in **row-major order**.
    ///
    /// ```plaintext
    /// [R_v   | T_v]
    /// [0 0 0 | 1  ]
    /// ```
    #[inline]
    pub fn from_view(view: &[f32; 16]) -> Self {
        let view = Matrix4::from_row_slice(view);
        Self {
            rotation: view.fixed_view::<3, 3>(0, 0).into_owned(),
            translation: view.fixed_view::<3, 1>(0, 3).into_owned(),
        }
    }

    /// The 4x4 view matrix in **row-major order**.
    pub fn to_view(&self) -> [f32; 16] {
        let mut view = Matrix4::identity();
        view.fixed_view_mut::<3, 3>(0, 0).copy_from(&self.rotation);
        view.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.translation);
        std::array::from_fn(|index| view[(index / 4, index % 4)])
    }

    /// $ P_v = R_v P + T_v $
    #[inline]
    pub fn transform<R: Real>(
        &self,
        point: &Vector3<R>,
    ) -> Vector3<R> {
        self.rotation.map(R::constant) * point + self.translation.map(R::constant)
    }

    /// Blending from `self` at `0` to `end` at `1`.
    ///
    /// The translations are lerped and the rotations are slerped along the
    /// shorter arc.
    pub fn interpolate(
        &self,
        end: &Self,
        t: f32,
    ) -> Self {
        let rotation_start = unit_quaternion(&self.rotation);
        let mut rotation_end = unit_quaternion(&end.rotation);
        if rotation_start.coords.dot(&rotation_end.coords) < 0.0 {
            rotation_end = UnitQuaternion::new_unchecked(-rotation_end.into_inner());
        }

        // Nearly equal rotations are lerped
        let rotation = rotation_start
            .try_slerp(&rotation_end, t, 1e-4)
            .unwrap_or_else(|| rotation_start.nlerp(&rotation_end, t));

        Self {
            rotation: rotation.to_rotation_matrix().into_inner(),
            translation: self.translation.lerp(&end.translation, t),
        }
    }
}

/// The rotation of a quaternion `[w x y z]`, normalized first.
///
/// $$ R_s = 2 \cdot \begin{bmatrix}
///  \- y^2 - z^2 + \frac{1}{2} & x y - w z & x z + w y
/// \\\ x y + w z & - x^2 - z^2 + \frac{1}{2} & y z - w x
/// \\\ x z - w y & y z + w x & - x^2 - y^2 + \frac{1}{2}
/// \end{bmatrix} $$
pub fn rotation_matrix<R: Real>(quaternion: &Vector4<R>) -> Matrix3<R> {
    let quaternion = quaternion / quaternion.dot(quaternion).sqrt();
    let [w, x, y, z] = [quaternion[0], quaternion[1], quaternion[2], quaternion[3]];
    let one = R::one();

    Matrix3::new(
        one - (y * y + z * z).scale(2.0),
        (x * y - w * z).scale(2.0),
        (x * z + w * y).scale(2.0),
        (x * y + w * z).scale(2.0),
        one - (x * x + z * z).scale(2.0),
        (y * z - w * x).scale(2.0),
        (x * z - w * y).scale(2.0),
        (y * z + w * x).scale(2.0),
        one - (x * x + y * y).scale(2.0),
    )
}

/// The unit quaternion of a rotation matrix.
#[inline]
fn unit_quaternion(rotation: &Matrix3<f32>) -> UnitQuaternion<f32> {
    UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(*rotation))
}
