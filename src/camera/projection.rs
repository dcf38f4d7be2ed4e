//! Projecting world-space Gaussians onto the image plane.

pub use super::*;

use nalgebra::{Matrix2, Matrix2x3, Matrix3, RowVector3, SVector, Vector2, Vector3, Vector4};
use pose::rotation_matrix;

/// $ c_f $, the isotropic blur added to the 2D covariances.
pub(crate) const COVARIANCE_BLUR: f32 = 0.3;
/// The depth range seen by the cameras.
pub(crate) const DEPTH_RANGE: std::ops::Range<f32> = 0.01..1e10;

/// A Gaussian in world space.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Gaussian3d {
    /// $ P \in \mathbb{R}^3 $
    pub mean: [f32; 3],
    /// $ R = [w\ x\ y\ z] $, normalized before use.
    pub rotation: [f32; 4],
    /// $ S \in \mathbb{R}^3 $
    pub scaling: [f32; 3],
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Gaussian3dGrad {
    pub mean: [f32; 3],
    pub rotation: [f32; 4],
    pub scaling: [f32; 3],
}

/// The screen-space footprint of a Gaussian.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Footprint {
    /// $ P^' \in \mathbb{R}^2 $
    pub mean: [f32; 2],
    /// $ \Sigma^{'-1} $, the upper triangle.
    pub conic: [f32; 3],
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FootprintGrad {
    pub mean: [f32; 2],
    pub conic: [f32; 3],
}

/// Projecting Gaussians through cameras.
pub trait Projector: Sync {
    /// Checking that the camera can be projected through.
    fn supports(
        &self,
        camera: &Camera,
    ) -> Result<(), Error>;

    /// The footprint seen by `camera` at `pose`.
    ///
    /// `None` excludes the Gaussian.
    fn project(
        &self,
        gaussian: &Gaussian3d,
        camera: &Camera,
        pose: &Pose,
    ) -> Option<Footprint>;

    /// The vector-Jacobian product of [`Projector::project`].
    ///
    /// It is only called for footprints that `project` yields.
    fn project_backward(
        &self,
        gaussian: &Gaussian3d,
        camera: &Camera,
        pose: &Pose,
        grad: &FootprintGrad,
    ) -> Gaussian3dGrad;
}

/// The elliptical weighted average (EWA) projection.
///
/// 1. Transform the mean from world space to camera space:
/// $$ P_v = R_v P + T_v $$
///
/// 2. Exit if $ P_v.z $ is outside the depth range.
///
/// 3. Project the mean through the camera model $ \pi $:
/// $$ P^' = \pi(P_v) $$
///
/// 4. Compute the 3D covariance from the rotation $ R_s $ and scaling $ S_s $:
/// $$ \Sigma = (R_s S_s) (R_s S_s)^T $$
///
/// 5. Project the 3D covariance onto the image plane:
/// $$ J = d \pi / d P_v $$
/// $$ \Sigma^' = J R_v \Sigma (J R_v)^T + c_f I $$
///
/// 6. Exit unless $ |\Sigma^'| > 0 $, then invert it into the conic.
///
/// Both $ J $ and the backward pass are exact derivatives by [`Dual`] numbers.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct EwaProjector;

impl EwaProjector {
    /// Returns the projected mean and the conic.
    fn footprint<R: Real>(
        camera: &Camera,
        pose: &Pose,
        mean: &Vector3<R>,
        rotation: &Vector4<R>,
        scaling: &Vector3<R>,
    ) -> Option<(Vector2<R>, Matrix2<R>)> {
        let point = pose.transform(mean);
        if !DEPTH_RANGE.contains(&point.z.value()) {
            return None;
        }

        let point = Vector3::from(Dual::<R, 3>::variables(point.into()));
        let mean_2d = camera.project_point(&point)?;
        let jacobian = Matrix2x3::from_rows(&[
            RowVector3::from(mean_2d.x.grads),
            RowVector3::from(mean_2d.y.grads),
        ]);

        // J R_v R_s S_s
        let transform = jacobian
            * pose.rotation.map(R::constant)
            * rotation_matrix(rotation)
            * Matrix3::from_diagonal(scaling);
        let covariance = transform * transform.transpose()
            + Matrix2::from_diagonal_element(R::constant(COVARIANCE_BLUR));

        let det = covariance[(0, 0)] * covariance[(1, 1)]
            - covariance[(0, 1)] * covariance[(1, 0)];
        let det_value = det.value();
        if det_value.is_nan() || det_value <= 0.0 {
            return None;
        }

        // The adjugate over the determinant
        let conic = Matrix2::new(
            covariance[(1, 1)],
            -covariance[(0, 1)],
            -covariance[(1, 0)],
            covariance[(0, 0)],
        ) / det;

        Some((mean_2d.map(|m| m.value), conic))
    }
}

impl Projector for EwaProjector {
    fn supports(
        &self,
        camera: &Camera,
    ) -> Result<(), Error> {
        camera.validate()
    }

    fn project(
        &self,
        gaussian: &Gaussian3d,
        camera: &Camera,
        pose: &Pose,
    ) -> Option<Footprint> {
        let (mean, conic) = Self::footprint(
            camera,
            pose,
            &Vector3::from(gaussian.mean),
            &Vector4::from(gaussian.rotation),
            &Vector3::from(gaussian.scaling),
        )?;
        Some(Footprint {
            mean: mean.into(),
            conic: [conic[(0, 0)], conic[(0, 1)], conic[(1, 1)]],
        })
    }

    fn project_backward(
        &self,
        gaussian: &Gaussian3d,
        camera: &Camera,
        pose: &Pose,
        grad: &FootprintGrad,
    ) -> Gaussian3dGrad {
        let [m_x, m_y, m_z] = gaussian.mean;
        let [q_w, q_x, q_y, q_z] = gaussian.rotation;
        let [s_x, s_y, s_z] = gaussian.scaling;
        let x = Dual::<f32, 10>::variables([
            m_x, m_y, m_z, q_w, q_x, q_y, q_z, s_x, s_y, s_z,
        ]);

        let Some((mean, conic)) = Self::footprint(
            camera,
            pose,
            &Vector3::new(x[0], x[1], x[2]),
            &Vector4::new(x[3], x[4], x[5], x[6]),
            &Vector3::new(x[7], x[8], x[9]),
        ) else {
            return Gaussian3dGrad::default();
        };

        let outputs = [
            (mean.x, grad.mean[0]),
            (mean.y, grad.mean[1]),
            (conic[(0, 0)], grad.conic[0]),
            (conic[(0, 1)], grad.conic[1]),
            (conic[(1, 1)], grad.conic[2]),
        ];
        let v_x = outputs
            .iter()
            .fold(SVector::<f32, 10>::zeros(), |v_x, (output, v)| {
                v_x + SVector::from(output.grads) * *v
            });

        Gaussian3dGrad {
            mean: [v_x[0], v_x[1], v_x[2]],
            rotation: [v_x[3], v_x[4], v_x[5], v_x[6]],
            scaling: [v_x[7], v_x[8], v_x[9]],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rasterize::check_gradient;

    fn camera() -> Camera {
        let pose = Pose {
            rotation: rotation_matrix(&Vector4::new(0.95_f32, 0.05, -0.1, 0.2)),
            translation: Vector3::new(0.1, -0.2, 0.5),
        };
        Camera {
            model: CameraModel::Pinhole,
            focal: [20.0, 22.0],
            principal: [8.0, 6.0],
            image_size: [16, 12],
            view: pose.to_view(),
            ..Default::default()
        }
    }

    #[test]
    fn project_axis_aligned() {
        let camera = Camera {
            view: [
                1.0, 0.0, 0.0, 0.0, //
                0.0, 1.0, 0.0, 0.0, //
                0.0, 0.0, 1.0, 0.0, //
                0.0, 0.0, 0.0, 1.0,
            ],
            ..camera()
        };
        let gaussian = Gaussian3d {
            mean: [0.0, 0.0, 2.0],
            rotation: [1.0, 0.0, 0.0, 0.0],
            scaling: [0.1, 0.2, 0.3],
        };

        let footprint = EwaProjector
            .project(&gaussian, &camera, &camera.pose(0))
            .unwrap();

        assert_eq!(footprint.mean, [8.0, 6.0]);
        // diag(10^2 * 0.1^2, 11^2 * 0.2^2) + 0.3
        let target = [1.0 / 1.3, 0.0, 1.0 / 5.14];
        footprint.conic.iter().zip(target).for_each(|(output, target)| {
            assert!((output - target).abs() < 1e-5, "{output} != {target}");
        });

        // Behind the near plane
        let gaussian_near = Gaussian3d {
            mean: [0.0, 0.0, 0.005],
            ..gaussian
        };
        assert_eq!(
            EwaProjector.project(&gaussian_near, &camera, &camera.pose(0)),
            None
        );

        // Degenerate
        let gaussian_flat = Gaussian3d {
            scaling: [0.0, 0.0, 0.0],
            ..gaussian
        };
        assert!(EwaProjector
            .project(&gaussian_flat, &camera, &camera.pose(0))
            .is_some());
    }

    #[test]
    fn project_backward_matches_finite_differences() {
        let cameras = [
            Camera {
                distortion: Some(Distortion {
                    radial: vec![0.1, -0.05, 0.01, 0.02, 0.0, 0.01],
                    tangential: [0.01, -0.02],
                    thin_prism: [0.01, 0.0, -0.01, 0.005],
                }),
                ..camera()
            },
            Camera {
                distortion: Some(Distortion {
                    radial: vec![0.05, -0.02, 0.0, 0.0],
                    ..Default::default()
                }),
                ..camera()
            },
            Camera {
                model: CameraModel::Fisheye,
                distortion: Some(Distortion {
                    radial: vec![0.05, -0.01, 0.002, 0.0],
                    ..Default::default()
                }),
                ..camera()
            },
            Camera {
                model: CameraModel::FTheta,
                ftheta: Some(FThetaParameters {
                    coefficients: [0.0, 21.0, 0.5, -1.0, 0.0, 0.0],
                    max_angle: 1.2,
                }),
                ..camera()
            },
        ];
        let gaussian = Gaussian3d {
            mean: [0.3, -0.2, 2.5],
            rotation: [0.9, 0.1, -0.2, 0.3],
            scaling: [0.2, 0.1, 0.3],
        };
        let grad = FootprintGrad {
            mean: [0.1, -0.07],
            conic: [0.8, -0.5, 0.3],
        };

        cameras.iter().for_each(|camera| {
            assert!(EwaProjector.supports(camera).is_ok());
            let pose = camera.pose(0);
            let gaussian_grad =
                EwaProjector.project_backward(&gaussian, camera, &pose, &grad);
            let loss = |gaussian: &Gaussian3d| {
                let footprint = EwaProjector.project(gaussian, camera, &pose).unwrap();
                footprint
                    .mean
                    .iter()
                    .zip(&grad.mean)
                    .chain(footprint.conic.iter().zip(&grad.conic))
                    .map(|(&o, &v)| o as f64 * v as f64)
                    .sum::<f64>()
            };

            check_gradient(
                "mean",
                &gaussian.mean,
                &gaussian_grad.mean,
                5e-3,
                |values| {
                    loss(&Gaussian3d {
                        mean: [values[0], values[1], values[2]],
                        ..gaussian
                    })
                },
            );
            check_gradient(
                "rotation",
                &gaussian.rotation,
                &gaussian_grad.rotation,
                5e-3,
                |values| {
                    loss(&Gaussian3d {
                        rotation: [values[0], values[1], values[2], values[3]],
                        ..gaussian
                    })
                },
            );
            check_gradient(
                "scaling",
                &gaussian.scaling,
                &gaussian_grad.scaling,
                5e-3,
                |values| {
                    loss(&Gaussian3d {
                        scaling: [values[0], values[1], values[2]],
                        ..gaussian
                    })
                },
            );
        });
    }
}
