use super::*;
pub use bytemuck::{Pod, Zeroable};

use crate::rasterize::{add_scaled, dot, tile::TileSlots, Thresholds};

/// A projected Gaussian footprint.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Splat {
    /// `[2]`
    pub mean: [f32; 2],
    /// `[3]`, the upper triangle of the inverse 2D covariance.
    pub conic: [f32; 3],
    pub opacity: f32,
}

/// The evaluation of a splat at a pixel center.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Sample {
    pub alpha: f32,
    /// `exp(-sigma)`
    pub falloff: f32,
    /// `mean - center`
    pub delta: [f32; 2],
    /// `opacity * falloff` exceeds the maximum alpha.
    pub is_clamped: bool,
}

/// The primitives visited by the conic compositor.
pub trait SplatSource<const C: usize>: Sync {
    /// The footprint of the primitive `id` seen from `pixel`.
    ///
    /// `None` excludes the primitive from the pixel.
    fn splat(
        &self,
        tile: &Tile,
        pixel: Pixel,
        id: u32,
    ) -> Option<Splat>;

    fn color(
        &self,
        id: u32,
    ) -> &[f32; C];

    /// The number of gradient lanes per intersection slot.
    #[inline]
    fn lane_count(&self) -> usize {
        1
    }

    /// The gradient lane of the pixel.
    #[inline]
    fn lane(
        &self,
        _tile: &Tile,
        _pixel: Pixel,
    ) -> usize {
        0
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct PixelOutput<const C: usize> {
    pub color: [f32; C],
    pub alpha: f32,
    pub last_id: i32,
    pub contributor_count: u32,
}

/// The gradient of one splat at one intersection slot.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SplatGrad<const C: usize> {
    pub mean: [f32; 2],
    pub mean_abs: [f32; 2],
    pub conic: [f32; 3],
    pub opacity: f32,
    pub color: [f32; C],
}

/// The forward outputs anchoring the backward walk.
#[derive(Clone, Copy, Debug)]
pub(crate) struct PixelAnchors<'a> {
    /// `[I, I_y, I_x]`
    pub alphas: &'a [f32],
    /// `[I, I_y, I_x]`
    pub last_ids: &'a [i32],
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct PixelGrads<'a, const C: usize> {
    /// `[I, I_y, I_x, C]`
    pub colors: &'a [[f32; C]],
    /// `[I, I_y, I_x]`
    pub alphas: &'a [f32],
}

impl Splat {
    /// Evaluating the splat at `center`.
    ///
    /// `None` if the step is skipped.
    #[inline]
    pub(crate) fn sample(
        &self,
        center: [f32; 2],
        thresholds: &Thresholds,
    ) -> Option<Sample> {
        let delta = [self.mean[0] - center[0], self.mean[1] - center[1]];
        let [dx, dy] = delta;
        let [a, b, c] = self.conic;
        let sigma = 0.5 * (a * dx * dx + c * dy * dy) + b * dx * dy;
        if sigma < 0.0 || sigma.is_nan() {
            return None;
        }

        let falloff = (-sigma).exp();
        let alpha_raw = self.opacity * falloff;
        let alpha = alpha_raw.min(thresholds.alpha_max);
        if alpha < thresholds.alpha_min || alpha.is_nan() {
            return None;
        }

        Some(Sample {
            alpha,
            falloff,
            delta,
            is_clamped: alpha_raw > thresholds.alpha_max,
        })
    }
}

impl<const C: usize> SplatGrad<C> {
    pub const ZERO: Self = Self {
        mean: [0.0; 2],
        mean_abs: [0.0; 2],
        conic: [0.0; 3],
        opacity: 0.0,
        color: [0.0; C],
    };
}

/// Compositing every pixel front to back.
pub(crate) fn forward<const C: usize, S: SplatSource<C>>(
    grid: &TileGrid,
    intersections: &TileIntersections,
    source: &S,
    backgrounds: Option<&[[f32; C]]>,
    masks: Option<&[bool]>,
    thresholds: &Thresholds,
) -> Vec<PixelOutput<C>> {
    grid.map_pixels(|tile, pixel| {
        let mut color = [0.0; C];
        let mut contributor_count = 0;
        let mut last_id = LAST_ID_NONE;
        let mut transmittance = 1.0;

        if tile.is_rendered(masks) {
            let center = pixel.center();
            for index in intersections.range(tile.index) {
                let id = intersections.flatten_ids[index];
                let Some(sample) = source
                    .splat(&tile, pixel, id)
                    .and_then(|splat| splat.sample(center, thresholds))
                else {
                    continue;
                };

                let transmittance_next = transmittance * (1.0 - sample.alpha);
                if transmittance_next <= thresholds.transmittance_min {
                    break;
                }

                add_scaled(
                    &mut color,
                    source.color(id),
                    sample.alpha * transmittance,
                );
                contributor_count += 1;
                last_id = index as i32;
                transmittance = transmittance_next;
            }
        }

        if let Some(backgrounds) = backgrounds {
            add_scaled(
                &mut color,
                &backgrounds[tile.image as usize],
                transmittance,
            );
        }

        PixelOutput {
            color,
            alpha: 1.0 - transmittance,
            last_id,
            contributor_count,
        }
    })
}

/// Compositing every pixel back to front and collecting the gradients of
/// each tile by intersection slot.
#[allow(clippy::too_many_arguments)]
pub(crate) fn backward<const C: usize, S: SplatSource<C>>(
    grid: &TileGrid,
    intersections: &TileIntersections,
    source: &S,
    backgrounds: Option<&[[f32; C]]>,
    masks: Option<&[bool]>,
    anchors: &PixelAnchors,
    grads: &PixelGrads<C>,
    thresholds: &Thresholds,
) -> Vec<TileSlots<SplatGrad<C>>> {
    let lane_count = source.lane_count().max(1);

    grid.map_tiles(|tile| {
        let range = intersections.range(tile.index);
        let mut values = vec![SplatGrad::<C>::ZERO; range.len() * lane_count];

        if tile.is_rendered(masks) {
            let background = backgrounds.map(|b| &b[tile.image as usize]);

            tile.pixels().for_each(|pixel| {
                let pixel_index = grid.pixel_index(tile.image, pixel);
                let Ok(last_id) = usize::try_from(anchors.last_ids[pixel_index])
                else {
                    return;
                };

                let center = pixel.center();
                let lane = source.lane(&tile, pixel);
                let v_render = &grads.colors[pixel_index];
                let v_render_alpha = grads.alphas[pixel_index];
                let v_background =
                    background.map_or(0.0, |background| dot(background, v_render));
                let transmittance_final = 1.0 - anchors.alphas[pixel_index];
                let mut transmittance = transmittance_final;
                let mut behind = [0.0; C];

                let end = (last_id + 1).min(range.end);
                for index in (range.start..end).rev() {
                    let id = intersections.flatten_ids[index];
                    let Some(splat) = source.splat(&tile, pixel, id) else {
                        continue;
                    };
                    let Some(sample) = splat.sample(center, thresholds) else {
                        continue;
                    };

                    let ra = 1.0 / (1.0 - sample.alpha);
                    transmittance *= ra;
                    let weight = sample.alpha * transmittance;
                    let color = source.color(id);
                    let grad =
                        &mut values[(index - range.start) * lane_count + lane];

                    add_scaled(&mut grad.color, v_render, weight);

                    let v_alpha = color
                        .iter()
                        .zip(&behind)
                        .zip(v_render)
                        .map(|((c, b), v)| (c * transmittance - b * ra) * v)
                        .sum::<f32>()
                        + transmittance_final * ra * (v_render_alpha - v_background);

                    if !sample.is_clamped {
                        let [dx, dy] = sample.delta;
                        let [a, b, c] = splat.conic;
                        let v_sigma = -splat.opacity * sample.falloff * v_alpha;
                        let v_mean = [
                            v_sigma * (a * dx + b * dy),
                            v_sigma * (b * dx + c * dy),
                        ];

                        grad.conic[0] += 0.5 * v_sigma * dx * dx;
                        grad.conic[1] += v_sigma * dx * dy;
                        grad.conic[2] += 0.5 * v_sigma * dy * dy;
                        grad.mean[0] += v_mean[0];
                        grad.mean[1] += v_mean[1];
                        grad.mean_abs[0] += v_mean[0].abs();
                        grad.mean_abs[1] += v_mean[1].abs();
                        grad.opacity += sample.falloff * v_alpha;
                    }

                    add_scaled(&mut behind, color, weight);
                }
            });
        }

        TileSlots {
            tile,
            range,
            lane_count,
            values,
        }
    })
}
