//! Cameras seeing world-space Gaussians.

pub mod pose;
pub mod projection;

pub use crate::{
    error::Error,
    function::dual::{Dual, Real},
};
pub use pose::Pose;
pub use projection::{
    EwaProjector, Footprint, FootprintGrad, Gaussian3d, Gaussian3dGrad, Projector,
};

use crate::error::ensure_len;
use nalgebra::{Vector2, Vector3};
use std::f32::consts::FRAC_PI_2;

/// The camera model.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum CameraModel {
    #[default]
    Pinhole,
    /// Equidistant fisheye.
    Fisheye,
    /// A polynomial of the angle from the optical axis to the pixel radius.
    FTheta,
}

/// The order in which the image lines are exposed.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum ShutterType {
    #[default]
    Global,
    RollingTopToBottom,
    RollingLeftToRight,
}

/// OpenCV lens distortion.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Distortion {
    /// `k1..k6` (rational) or `k1..k4` (polynomial).
    ///
    /// The fisheye model takes `k1..k4` of the angle.
    pub radial: Vec<f32>,
    /// `p1, p2`
    pub tangential: [f32; 2],
    /// `s1..s4`
    pub thin_prism: [f32; 4],
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FThetaParameters {
    /// `c0..c5`, mapping the angle in radians to the pixel radius.
    pub coefficients: [f32; 6],
    /// Points beyond this angle are not seen.
    pub max_angle: f32,
}

/// A camera for one image.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Camera {
    pub model: CameraModel,
    /// `[f_x, f_y]`
    pub focal: [f32; 2],
    /// `[c_x, c_y]`
    pub principal: [f32; 2],
    /// `[I_x, I_y]`
    pub image_size: [u32; 2],
    /// The world-to-camera transformation in **row-major order**.
    pub view: [f32; 16],
    /// The view at the end of a rolling exposure.
    pub view_end: Option<[f32; 16]>,
    pub shutter: ShutterType,
    pub distortion: Option<Distortion>,
    pub ftheta: Option<FThetaParameters>,
}

/// Exposure.
impl Camera {
    /// The shutter is rolling and the pose moves along the exposure.
    #[inline]
    pub fn is_rolling(&self) -> bool {
        self.shutter != ShutterType::Global && self.view_end.is_some()
    }

    /// The number of exposure lines.
    #[inline]
    pub const fn line_count(&self) -> u32 {
        match self.shutter {
            ShutterType::Global => 1,
            ShutterType::RollingTopToBottom => self.image_size[1],
            ShutterType::RollingLeftToRight => self.image_size[0],
        }
    }

    /// The exposure line of the pixel at `(x, y)`.
    #[inline]
    pub fn line(
        &self,
        x: u32,
        y: u32,
    ) -> u32 {
        if !self.is_rolling() {
            return 0;
        }
        match self.shutter {
            ShutterType::Global => 0,
            ShutterType::RollingTopToBottom => y,
            ShutterType::RollingLeftToRight => x,
        }
    }

    /// The pose exposing the line.
    pub fn pose(
        &self,
        line: u32,
    ) -> Pose {
        let start = Pose::from_view(&self.view);
        match self.view_end {
            Some(view_end) if self.is_rolling() => {
                let t = (line as f32 + 0.5) / self.line_count().max(1) as f32;
                start.interpolate(&Pose::from_view(&view_end), t)
            },
            _ => start,
        }
    }
}

/// Projection.
impl Camera {
    /// Checking that the parameters describe the camera model.
    pub fn validate(&self) -> Result<(), Error> {
        if self.model == CameraModel::FTheta && self.ftheta.is_none() {
            return Err(Error::MissingCameraParameters(self.model, "ftheta"));
        }

        if let Some(distortion) = &self.distortion {
            match self.model {
                CameraModel::Pinhole => {
                    let radial_count = distortion.radial.len();
                    if radial_count != 4 && radial_count != 6 {
                        return Err(Error::MismatchedShape(
                            format!("radial.len() ({radial_count})"),
                            "4 or 6".into(),
                        ));
                    }
                },
                CameraModel::Fisheye => {
                    ensure_len("radial", distortion.radial.len(), 4)?;
                },
                CameraModel::FTheta => {},
            }
        }

        Ok(())
    }

    /// Projecting the point in camera space onto the image plane.
    ///
    /// `None` if the camera model does not see the point.
    pub fn project_point<R: Real>(
        &self,
        point: &Vector3<R>,
    ) -> Option<Vector2<R>> {
        let (x, y, z) = (point.x, point.y, point.z);
        let depth = z.value();
        if depth.is_nan() || depth <= 0.0 {
            return None;
        }

        let [f_x, f_y] = self.focal;
        let [c_x, c_y] = self.principal;
        let r_square = x.square() + y.square();
        // Every model converges to the pinhole at the optical axis
        let is_on_axis = r_square.value() < 1e-12;

        match self.model {
            CameraModel::Pinhole => {
                let mut u = x / z;
                let mut v = y / z;
                if let Some(distortion) = &self.distortion {
                    [u, v] = distort(distortion, u, v);
                }
                Some(Vector2::new(
                    u.scale(f_x) + R::constant(c_x),
                    v.scale(f_y) + R::constant(c_y),
                ))
            },
            CameraModel::Fisheye => {
                let scale = if is_on_axis {
                    R::constant(1.0) / z
                } else {
                    let r = r_square.sqrt();
                    let theta = r.atan2(z);
                    let theta_distorted = match &self.distortion {
                        Some(distortion) => {
                            let theta_square = theta.square();
                            theta
                                * (R::constant(1.0)
                                    + theta_square
                                        * polynomial(&distortion.radial, theta_square))
                        },
                        None => theta,
                    };
                    theta_distorted / r
                };
                Some(Vector2::new(
                    (x * scale).scale(f_x) + R::constant(c_x),
                    (y * scale).scale(f_y) + R::constant(c_y),
                ))
            },
            CameraModel::FTheta => {
                let ftheta = self.ftheta.as_ref()?;
                let scale = if is_on_axis {
                    R::constant(ftheta.coefficients[1]) / z
                } else {
                    let r = r_square.sqrt();
                    let theta = r.atan2(z);
                    if theta.value() > ftheta.max_angle.min(FRAC_PI_2) {
                        return None;
                    }
                    polynomial(&ftheta.coefficients, theta) / r
                };
                Some(Vector2::new(
                    x * scale + R::constant(c_x),
                    y * scale + R::constant(c_y),
                ))
            },
        }
    }
}

/// OpenCV distortion of the normalized point `(u, v)`.
fn distort<R: Real>(
    distortion: &Distortion,
    u: R,
    v: R,
) -> [R; 2] {
    let k = &distortion.radial;
    let [p_1, p_2] = distortion.tangential;
    let [s_1, s_2, s_3, s_4] = distortion.thin_prism;
    let one = R::constant(1.0);
    let r_2 = u.square() + v.square();
    let r_4 = r_2.square();

    let radial = if k.len() == 6 {
        (one + r_2 * polynomial(&k[0..3], r_2))
            / (one + r_2 * polynomial(&k[3..6], r_2))
    } else {
        one + r_2 * polynomial(k, r_2)
    };
    let uv = u * v;

    [
        u * radial
            + uv.scale(2.0 * p_1)
            + (r_2 + u.square().scale(2.0)).scale(p_2)
            + r_2.scale(s_1)
            + r_4.scale(s_2),
        v * radial
            + (r_2 + v.square().scale(2.0)).scale(p_1)
            + uv.scale(2.0 * p_2)
            + r_2.scale(s_3)
            + r_4.scale(s_4),
    ]
}

/// `c[0] + c[1] x + c[2] x^2 + ...` by Horner's method.
fn polynomial<R: Real>(
    coefficients: &[f32],
    x: R,
) -> R {
    coefficients
        .iter()
        .rev()
        .fold(R::constant(0.0), |sum, &c| sum * x + R::constant(c))
}
