use super::*;

use crate::rasterize::{add_scaled, dot, tile::TileSlots, Thresholds};

/// A 2D splat seen through its ray transform.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Surfel {
    /// `[2]`
    pub mean: [f32; 2],
    /// `[3, 3]`, the rows `u`, `v` and `w`.
    pub ray_transform: [[f32; 3]; 3],
    pub opacity: f32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SurfelSample {
    pub alpha: f32,
    /// `exp(-sigma)`
    pub falloff: f32,
    /// `mean - center`
    pub delta: [f32; 2],
    /// `px * w - u`
    pub h_u: [f32; 3],
    /// `py * w - v`
    pub h_v: [f32; 3],
    /// `h_u x h_v`
    pub k: [f32; 3],
    /// The intersection in the splat plane, `k.xy / k.z`.
    pub s: [f32; 2],
    /// The screen-space filter is smaller than the splat.
    pub is_filtered: bool,
    pub is_clamped: bool,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct PixelOutput<const C: usize> {
    pub color: [f32; C],
    pub normal: [f32; 3],
    pub alpha: f32,
    pub distortion: f32,
    pub median_depth: f32,
    pub median_id: i32,
    pub last_id: i32,
    pub contributor_count: u32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SurfelGrad<const C: usize> {
    pub color: [f32; C],
    pub densification: [f32; 2],
    pub mean: [f32; 2],
    pub mean_abs: [f32; 2],
    pub normal: [f32; 3],
    pub opacity: f32,
    pub ray_transform: [[f32; 3]; 3],
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct PixelAnchors<'a, const C: usize> {
    pub alphas: &'a [f32],
    pub colors: &'a [[f32; C]],
    pub last_ids: &'a [i32],
    pub median_ids: &'a [i32],
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct PixelGrads<'a, const C: usize> {
    pub alphas: &'a [f32],
    pub colors: &'a [[f32; C]],
    pub distortions: &'a [f32],
    pub median_depths: &'a [f32],
    pub normals: &'a [[f32; 3]],
}

#[inline]
fn cross(
    a: [f32; 3],
    b: [f32; 3],
) -> [f32; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

impl Surfel {
    /// Evaluating the surfel at `center`.
    ///
    /// `None` if the step is skipped.
    #[inline]
    pub(crate) fn sample(
        &self,
        center: [f32; 2],
        thresholds: &Thresholds,
    ) -> Option<SurfelSample> {
        let [u, v, w] = self.ray_transform;
        let [px, py] = center;
        let h_u = [px * w[0] - u[0], px * w[1] - u[1], px * w[2] - u[2]];
        let h_v = [py * w[0] - v[0], py * w[1] - v[1], py * w[2] - v[2]];
        let k = cross(h_u, h_v);
        if k[2] == 0.0 {
            return None;
        }

        let s = [k[0] / k[2], k[1] / k[2]];
        let delta = [self.mean[0] - px, self.mean[1] - py];
        let weight_3d = s[0] * s[0] + s[1] * s[1];
        let weight_2d = thresholds.filter_inv_square
            * (delta[0] * delta[0] + delta[1] * delta[1]);
        let is_filtered = weight_2d < weight_3d;
        let sigma = 0.5 * if is_filtered { weight_2d } else { weight_3d };
        if sigma < 0.0 || sigma.is_nan() {
            return None;
        }

        let falloff = (-sigma).exp();
        let alpha_raw = self.opacity * falloff;
        let alpha = alpha_raw.min(thresholds.alpha_max);
        if alpha < thresholds.alpha_min || alpha.is_nan() {
            return None;
        }

        Some(SurfelSample {
            alpha,
            falloff,
            delta,
            h_u,
            h_v,
            k,
            s,
            is_filtered,
            is_clamped: alpha_raw > thresholds.alpha_max,
        })
    }
}

impl<const C: usize> SurfelGrad<C> {
    pub const ZERO: Self = Self {
        color: [0.0; C],
        densification: [0.0; 2],
        mean: [0.0; 2],
        mean_abs: [0.0; 2],
        normal: [0.0; 3],
        opacity: 0.0,
        ray_transform: [[0.0; 3]; 3],
    };
}

/// Compositing every pixel front to back.
///
/// The last channel of the colors is the depth.
#[allow(clippy::too_many_arguments)]
pub(crate) fn forward<const C: usize>(
    grid: &TileGrid,
    intersections: &TileIntersections,
    surfels: &Surfels,
    colors: &[[f32; C]],
    normals: &[[f32; 3]],
    backgrounds: Option<&[[f32; C]]>,
    masks: Option<&[bool]>,
    thresholds: &Thresholds,
) -> Vec<PixelOutput<C>> {
    grid.map_pixels(|tile, pixel| {
        let mut output = PixelOutput {
            color: [0.0; C],
            normal: [0.0; 3],
            alpha: 0.0,
            distortion: 0.0,
            median_depth: 0.0,
            median_id: LAST_ID_NONE,
            last_id: LAST_ID_NONE,
            contributor_count: 0,
        };
        let mut depth_weighted = 0.0;
        let mut transmittance = 1.0;

        if tile.is_rendered(masks) {
            let center = pixel.center();
            for index in intersections.range(tile.index) {
                let id = intersections.flatten_ids[index];
                let Some(sample) = surfels.get(id).sample(center, thresholds)
                else {
                    continue;
                };

                let transmittance_next = transmittance * (1.0 - sample.alpha);
                if transmittance_next <= thresholds.transmittance_min {
                    break;
                }

                let weight = sample.alpha * transmittance;
                let color = &colors[id as usize];
                let depth = color[C - 1];
                add_scaled(&mut output.color, color, weight);
                add_scaled(&mut output.normal, &normals[id as usize], weight);

                output.distortion += 2.0
                    * (weight * depth * (1.0 - transmittance)
                        - weight * depth_weighted);
                depth_weighted += weight * depth;

                if transmittance > 0.5 {
                    output.median_depth = depth;
                    output.median_id = index as i32;
                }

                output.contributor_count += 1;
                output.last_id = index as i32;
                transmittance = transmittance_next;
            }
        }

        if let Some(backgrounds) = backgrounds {
            add_scaled(
                &mut output.color,
                &backgrounds[tile.image as usize],
                transmittance,
            );
        }
        output.alpha = 1.0 - transmittance;

        output
    })
}

/// Compositing every pixel back to front and collecting the gradients of
/// each tile by intersection slot.
#[allow(clippy::too_many_arguments)]
pub(crate) fn backward<const C: usize>(
    grid: &TileGrid,
    intersections: &TileIntersections,
    surfels: &Surfels,
    colors: &[[f32; C]],
    normals: &[[f32; 3]],
    backgrounds: Option<&[[f32; C]]>,
    masks: Option<&[bool]>,
    anchors: &PixelAnchors<C>,
    grads: &PixelGrads<C>,
    thresholds: &Thresholds,
) -> Vec<TileSlots<SurfelGrad<C>>> {
    grid.map_tiles(|tile| {
        let range = intersections.range(tile.index);
        let mut values = vec![SurfelGrad::<C>::ZERO; range.len()];

        if tile.is_rendered(masks) {
            let background = backgrounds.map(|b| &b[tile.image as usize]);

            tile.pixels().for_each(|pixel| {
                let pixel_index = grid.pixel_index(tile.image, pixel);
                let Ok(last_id) = usize::try_from(anchors.last_ids[pixel_index])
                else {
                    return;
                };

                let center = pixel.center();
                let median_id = anchors.median_ids[pixel_index];
                let v_render = &grads.colors[pixel_index];
                let v_render_alpha = grads.alphas[pixel_index];
                let v_render_normal = &grads.normals[pixel_index];
                let v_distortion = grads.distortions[pixel_index];
                let v_median_depth = grads.median_depths[pixel_index];
                let v_background =
                    background.map_or(0.0, |background| dot(background, v_render));
                let transmittance_final = 1.0 - anchors.alphas[pixel_index];
                let depth_total = anchors.colors[pixel_index][C - 1]
                    - background.map_or(0.0, |b| transmittance_final * b[C - 1]);

                let mut transmittance = transmittance_final;
                let mut behind = [0.0; C];
                let mut behind_normal = [0.0; 3];
                // The moments of the steps behind
                let mut weight_after = 0.0;
                let mut depth_after = 0.0;
                let mut distortion_after = 0.0;

                let end = (last_id + 1).min(range.end);
                for index in (range.start..end).rev() {
                    let id = intersections.flatten_ids[index];
                    let surfel = surfels.get(id);
                    let Some(sample) = surfel.sample(center, thresholds) else {
                        continue;
                    };

                    let ra = 1.0 / (1.0 - sample.alpha);
                    transmittance *= ra;
                    let weight = sample.alpha * transmittance;
                    let color = &colors[id as usize];
                    let normal = &normals[id as usize];
                    let depth = color[C - 1];
                    let grad = &mut values[index - range.start];

                    add_scaled(&mut grad.color, v_render, weight);
                    add_scaled(&mut grad.normal, v_render_normal, weight);

                    let mut v_alpha = color
                        .iter()
                        .zip(&behind)
                        .zip(v_render)
                        .map(|((c, b), v)| (c * transmittance - b * ra) * v)
                        .sum::<f32>()
                        + normal
                            .iter()
                            .zip(&behind_normal)
                            .zip(v_render_normal)
                            .map(|((n, b), v)| (n * transmittance - b * ra) * v)
                            .sum::<f32>()
                        + transmittance_final * ra * (v_render_alpha - v_background);

                    // Distortion

                    let weight_before = 1.0 - transmittance;
                    let depth_before = depth_total - depth_after - weight * depth;
                    let v_weight_distortion = 2.0
                        * (depth * weight_before - depth_before + depth_after
                            - depth * weight_after);
                    v_alpha += v_distortion
                        * (transmittance * v_weight_distortion
                            - distortion_after * ra);
                    grad.color[C - 1] += v_distortion
                        * 2.0
                        * weight
                        * (weight_before - weight_after);

                    distortion_after += weight * v_weight_distortion;
                    weight_after += weight;
                    depth_after += weight * depth;

                    // Median depth

                    if index as i32 == median_id {
                        grad.color[C - 1] += v_median_depth;
                    }

                    // Footprint

                    if !sample.is_clamped {
                        let v_sigma = -surfel.opacity * sample.falloff * v_alpha;

                        if sample.is_filtered {
                            let v_mean = [
                                v_sigma * thresholds.filter_inv_square * sample.delta[0],
                                v_sigma * thresholds.filter_inv_square * sample.delta[1],
                            ];
                            grad.mean[0] += v_mean[0];
                            grad.mean[1] += v_mean[1];
                            grad.mean_abs[0] += v_mean[0].abs();
                            grad.mean_abs[1] += v_mean[1].abs();
                            grad.densification[0] += v_mean[0];
                            grad.densification[1] += v_mean[1];
                        } else {
                            let [kx, ky, kz] = sample.k;
                            let v_s = [v_sigma * sample.s[0], v_sigma * sample.s[1]];
                            let v_k = [
                                v_s[0] / kz,
                                v_s[1] / kz,
                                -(v_s[0] * kx + v_s[1] * ky) / (kz * kz),
                            ];
                            let v_h_u = cross(sample.h_v, v_k);
                            let v_h_v = cross(v_k, sample.h_u);
                            let [px, py] = center;
                            let w = surfel.ray_transform[2];

                            (0..3).for_each(|axis| {
                                grad.ray_transform[0][axis] -= v_h_u[axis];
                                grad.ray_transform[1][axis] -= v_h_v[axis];
                                grad.ray_transform[2][axis] +=
                                    px * v_h_u[axis] + py * v_h_v[axis];
                            });

                            let v_translation = [-dot(&v_h_u, &w), -dot(&v_h_v, &w)];
                            grad.mean_abs[0] += v_translation[0].abs();
                            grad.mean_abs[1] += v_translation[1].abs();
                            grad.densification[0] += v_translation[0];
                            grad.densification[1] += v_translation[1];
                        }

                        grad.opacity += sample.falloff * v_alpha;
                    }

                    add_scaled(&mut behind, color, weight);
                    add_scaled(&mut behind_normal, normal, weight);
                }
            });
        }

        TileSlots {
            tile,
            range,
            lane_count: 1,
            values,
        }
    })
}

#[cfg(test)]
mod tests {
    #[test]
    fn sample_paths() {
        use super::*;

        let thresholds = Thresholds::default();
        let surfel = Surfel {
            mean: [1.0, 1.0],
            ray_transform: [[2.0, 0.0, 1.0], [0.0, 2.0, 1.0], [0.0, 0.0, 1.0]],
            opacity: 0.5,
        };

        // The splat is wider than the filter
        let sample = surfel.sample([2.0, 1.0], &thresholds).unwrap();
        assert_eq!(sample.s, [0.5, 0.0]);
        assert!(!sample.is_filtered);
        assert_eq!(sample.falloff, (-0.125_f32).exp());

        // The splat is narrower than the filter
        let surfel_narrow = Surfel {
            ray_transform: [[0.25, 0.0, 1.0], [0.0, 0.25, 1.0], [0.0, 0.0, 1.0]],
            ..surfel
        };
        let sample = surfel_narrow.sample([1.5, 1.0], &thresholds).unwrap();
        assert!(sample.is_filtered);
        assert_eq!(sample.falloff, (-0.25_f32).exp());

        // The ray is parallel to the splat
        let surfel_parallel = Surfel {
            ray_transform: [[1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0, 0.0, 0.0]],
            ..surfel
        };
        assert_eq!(surfel_parallel.sample([1.5, 1.0], &thresholds), None);
    }
}
