//! Tile-based compositing of Gaussian splats on the host.
//!
//! The compositors walk the depth-sorted primitives of every tile front to
//! back for each pixel. The sorted [`TileIntersections`] are built elsewhere.

pub mod channel;
pub mod compact;
pub mod contributor;
pub mod gaussian_2d;
pub mod gaussian_3d;
pub mod tile;
pub mod world;

pub use crate::error::Error;
pub use channel::{dispatch, ChannelCount, ChannelVisitor, CHANNEL_COUNTS};
pub use compact::{compact, scan_add_exclusive, Compaction};
pub use contributor::Contributor;
pub use tile::{Pixel, Tile, TileGrid, TileIntersections};

/// The last contributor of a pixel without any.
pub const LAST_ID_NONE: i32 = -1;

/// `T`
pub const TILE_SIZE: u32 = 16;

pub(crate) const ALPHA_MIN: f32 = 1.0 / 255.0;
pub(crate) const ALPHA_MAX: f32 = 0.999;
pub(crate) const FILTER_INV_SQUARE: f32 = 2.0;
pub(crate) const TRANSMITTANCE_MIN: f32 = 1e-4;

/// The cutoffs of the compositing walk.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct Thresholds {
    /// A step with lower alpha is skipped.
    pub alpha_min: f32,
    /// Alpha is clamped to it.
    pub alpha_max: f32,
    /// The screen-space low-pass weight of 2D splats.
    pub filter_inv_square: f32,
    /// The walk stops before the transmittance would fall to it.
    pub transmittance_min: f32,
}

impl Default for Thresholds {
    #[inline]
    fn default() -> Self {
        Self {
            alpha_min: ALPHA_MIN,
            alpha_max: ALPHA_MAX,
            filter_inv_square: FILTER_INV_SQUARE,
            transmittance_min: TRANSMITTANCE_MIN,
        }
    }
}

/// Adding `weight * source` to `target`.
#[inline]
pub(crate) fn add_scaled(
    target: &mut [f32],
    source: &[f32],
    weight: f32,
) {
    target
        .iter_mut()
        .zip(source)
        .for_each(|(t, s)| *t += weight * s);
}

#[inline]
pub(crate) fn dot(
    lhs: &[f32],
    rhs: &[f32],
) -> f32 {
    lhs.iter().zip(rhs).map(|(l, r)| l * r).sum()
}

/// Comparing `analytic` with the central differences of `loss` at `values`.
#[cfg(test)]
pub(crate) fn check_gradient<L>(
    name: &str,
    values: &[f32],
    analytic: &[f32],
    step: f32,
    loss: L,
) where
    L: Fn(&[f32]) -> f64,
{
    assert_eq!(values.len(), analytic.len(), "{name}");

    values.iter().enumerate().for_each(|(index, &value)| {
        let mut values_plus = values.to_vec();
        let mut values_minus = values.to_vec();
        values_plus[index] = value + step;
        values_minus[index] = value - step;
        let step_actual =
            values_plus[index] as f64 - values_minus[index] as f64;

        let numeric = ((loss(&values_plus) - loss(&values_minus))
            / step_actual) as f32;
        let target = analytic[index];
        assert!(
            (numeric - target).abs() <= 2e-3 * (1.0 + target.abs()),
            "{name}[{index}]: numeric {numeric}, analytic {target}",
        );
    });
}

/// `sum(outputs * weights)`
#[cfg(test)]
pub(crate) fn weighted_sum(
    outputs: &[f32],
    weights: &[f32],
) -> f64 {
    outputs
        .iter()
        .zip(weights)
        .map(|(&o, &w)| o as f64 * w as f64)
        .sum()
}

/// Deterministic pseudo-random weights in `[-1, 1]`.
#[cfg(test)]
pub(crate) fn test_weights(
    count: usize,
    seed: f32,
) -> Vec<f32> {
    (0..count)
        .map(|index| (index as f32 * 0.7373 + seed).sin())
        .collect()
}
