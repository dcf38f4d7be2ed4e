//! Compositing of 2D Gaussian splats given by their ray transforms.
//!
//! The last color channel carries the depth of each splat. It feeds the
//! depth distortion and the median depth of every pixel.

pub mod kernel;

pub use super::*;
pub use bytemuck::{Pod, Zeroable};
pub use kernel::{Surfel, SurfelGrad, SurfelSample};

use crate::{
    error::ensure_len,
    rasterize::{
        add_scaled,
        contributor::validate_window,
        Thresholds,
    },
};
use bytemuck::cast_slice;
use kernel::{PixelAnchors, PixelGrads};

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct Arguments {
    /// `I`
    pub image_count: u32,
    /// `I_x`
    pub image_size_x: u32,
    /// `I_y`
    pub image_size_y: u32,
    /// `T`
    pub tile_size: u32,
    /// `C`, including the depth.
    pub channel_count: u32,
}

#[derive(Clone, Copy, Debug)]
pub struct Surfels<'a> {
    /// `[P, 2]`
    pub means_2d: &'a [f32],
    /// `[P]`
    pub opacities: &'a [f32],
    /// `[P, 3, 3]`
    pub ray_transforms: &'a [f32],
}

#[derive(Clone, Copy, Debug)]
pub struct Inputs<'a> {
    pub surfels: Surfels<'a>,
    /// `[P, C]`
    pub colors: &'a [f32],
    /// `[P, 3]`
    pub normals: &'a [f32],
    /// `[I, C]`
    pub backgrounds: Option<&'a [f32]>,
    /// `[I, T_y, T_x]`
    pub masks: Option<&'a [bool]>,
    pub intersections: TileIntersections<'a>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Outputs {
    /// `[I, I_y, I_x, C]`
    pub colors: Vec<f32>,
    /// `[I, I_y, I_x]`
    pub alphas: Vec<f32>,
    /// `[I, I_y, I_x, 3]`
    pub normals: Vec<f32>,
    /// `[I, I_y, I_x]`
    pub distortions: Vec<f32>,
    /// `[I, I_y, I_x]`
    pub median_depths: Vec<f32>,
    /// `[I, I_y, I_x]`
    pub median_ids: Vec<i32>,
    /// `[I, I_y, I_x]`
    pub last_ids: Vec<i32>,
    /// `[I, I_y, I_x]`
    pub contributor_counts: Vec<u32>,
}

#[derive(Clone, Copy, Debug)]
pub struct BackwardState<'a> {
    /// `[I, I_y, I_x, C]`
    pub colors: &'a [f32],
    /// `[I, I_y, I_x]`
    pub alphas: &'a [f32],
    /// `[I, I_y, I_x]`
    pub last_ids: &'a [i32],
    /// `[I, I_y, I_x]`
    pub median_ids: &'a [i32],
}

#[derive(Clone, Copy, Debug)]
pub struct OutputGrads<'a> {
    /// `[I, I_y, I_x, C]`
    pub colors: &'a [f32],
    /// `[I, I_y, I_x]`
    pub alphas: &'a [f32],
    /// `[I, I_y, I_x, 3]`
    pub normals: &'a [f32],
    /// `[I, I_y, I_x]`
    pub distortions: &'a [f32],
    /// `[I, I_y, I_x]`
    pub median_depths: &'a [f32],
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Gradients {
    /// `[P, C]`
    pub colors_grad: Vec<f32>,
    /// `[P, 2]`, the gradient of a screen-space translation of each splat.
    pub densifications_grad: Vec<f32>,
    /// `[P, 2]`
    pub means_2d_grad: Vec<f32>,
    /// `[P, 2]`, the accumulated absolute translation gradients if requested.
    pub means_2d_grad_abs: Option<Vec<f32>>,
    /// `[P, 3]`
    pub normals_grad: Vec<f32>,
    /// `[P]`
    pub opacities_grad: Vec<f32>,
    /// `[P, 3, 3]`
    pub ray_transforms_grad: Vec<f32>,
}

impl Arguments {
    pub fn grid(&self) -> Result<TileGrid, Error> {
        TileGrid::new(
            self.image_count,
            self.image_size_x,
            self.image_size_y,
            self.tile_size,
        )
    }
}

impl Surfels<'_> {
    /// ## Returns
    ///
    /// `P`
    pub fn validate(&self) -> Result<usize, Error> {
        let point_count = self.opacities.len();
        ensure_len("means_2d", self.means_2d.len(), point_count * 2)?;
        ensure_len(
            "ray_transforms",
            self.ray_transforms.len(),
            point_count * 9,
        )?;
        Ok(point_count)
    }

    #[inline]
    pub(crate) fn get(
        &self,
        id: u32,
    ) -> Surfel {
        let id = id as usize;
        let m = &self.ray_transforms[id * 9..id * 9 + 9];
        Surfel {
            mean: [self.means_2d[id * 2], self.means_2d[id * 2 + 1]],
            ray_transform: [[m[0], m[1], m[2]], [m[3], m[4], m[5]], [m[6], m[7], m[8]]],
            opacity: self.opacities[id],
        }
    }
}

impl Inputs<'_> {
    /// ## Returns
    ///
    /// `P`
    pub fn validate(
        &self,
        grid: &TileGrid,
        channel_count: usize,
    ) -> Result<usize, Error> {
        if !channel::is_supported(channel_count) {
            return Err(Error::UnsupportedChannelCount(channel_count));
        }

        let point_count = self.surfels.validate()?;
        ensure_len("colors", self.colors.len(), point_count * channel_count)?;
        ensure_len("normals", self.normals.len(), point_count * 3)?;
        if let Some(backgrounds) = self.backgrounds {
            ensure_len(
                "backgrounds",
                backgrounds.len(),
                grid.image_count as usize * channel_count,
            )?;
        }
        if let Some(masks) = self.masks {
            ensure_len("masks", masks.len(), grid.tile_count())?;
        }
        self.intersections.validate(grid, point_count)?;

        Ok(point_count)
    }
}

/// Compositing the surfels into the images.
pub fn forward(
    arguments: &Arguments,
    inputs: &Inputs,
) -> Result<Outputs, Error> {
    forward_with(arguments, inputs, &Thresholds::default())
}

pub(crate) fn forward_with(
    arguments: &Arguments,
    inputs: &Inputs,
    thresholds: &Thresholds,
) -> Result<Outputs, Error> {
    #[cfg(debug_assertions)]
    log::debug!(
        target: "gausplat::rasterizer::gaussian_2d",
        "forward",
    );

    // Specifying the parameters

    let grid = arguments.grid()?;
    let channel_count = arguments.channel_count as usize;
    inputs.validate(&grid, channel_count)?;

    struct Visitor<'a> {
        grid: TileGrid,
        inputs: &'a Inputs<'a>,
        thresholds: &'a Thresholds,
    }

    impl ChannelVisitor for Visitor<'_> {
        type Output = Outputs;

        fn visit<const C: usize>(self) -> Outputs {
            let pixels = kernel::forward::<C>(
                &self.grid,
                &self.inputs.intersections,
                &self.inputs.surfels,
                cast_slice(self.inputs.colors),
                cast_slice(self.inputs.normals),
                self.inputs.backgrounds.map(cast_slice::<f32, [f32; C]>),
                self.inputs.masks,
                self.thresholds,
            );

            Outputs {
                colors: pixels.iter().flat_map(|p| p.color).collect(),
                alphas: pixels.iter().map(|p| p.alpha).collect(),
                normals: pixels.iter().flat_map(|p| p.normal).collect(),
                distortions: pixels.iter().map(|p| p.distortion).collect(),
                median_depths: pixels.iter().map(|p| p.median_depth).collect(),
                median_ids: pixels.iter().map(|p| p.median_id).collect(),
                last_ids: pixels.iter().map(|p| p.last_id).collect(),
                contributor_counts: pixels
                    .iter()
                    .map(|p| p.contributor_count)
                    .collect(),
            }
        }
    }

    // Compositing the pixels

    dispatch(
        channel_count,
        Visitor {
            grid,
            inputs,
            thresholds,
        },
    )
}

/// Computing the gradients of the surfels from the gradients of the images.
pub fn backward(
    arguments: &Arguments,
    inputs: &Inputs,
    state: &BackwardState,
    grads: &OutputGrads,
    absgrad: bool,
) -> Result<Gradients, Error> {
    backward_with(
        arguments,
        inputs,
        state,
        grads,
        absgrad,
        &Thresholds::default(),
    )
}

pub(crate) fn backward_with(
    arguments: &Arguments,
    inputs: &Inputs,
    state: &BackwardState,
    grads: &OutputGrads,
    absgrad: bool,
    thresholds: &Thresholds,
) -> Result<Gradients, Error> {
    #[cfg(debug_assertions)]
    log::debug!(
        target: "gausplat::rasterizer::gaussian_2d",
        "backward",
    );

    // Specifying the parameters

    let grid = arguments.grid()?;
    let channel_count = arguments.channel_count as usize;
    let point_count = inputs.validate(&grid, channel_count)?;
    let pixel_count = grid.pixel_count();
    ensure_len("colors", state.colors.len(), pixel_count * channel_count)?;
    ensure_len("alphas", state.alphas.len(), pixel_count)?;
    ensure_len("last_ids", state.last_ids.len(), pixel_count)?;
    ensure_len("median_ids", state.median_ids.len(), pixel_count)?;
    ensure_len("colors_grad", grads.colors.len(), pixel_count * channel_count)?;
    ensure_len("alphas_grad", grads.alphas.len(), pixel_count)?;
    ensure_len("normals_grad", grads.normals.len(), pixel_count * 3)?;
    ensure_len("distortions_grad", grads.distortions.len(), pixel_count)?;
    ensure_len("median_depths_grad", grads.median_depths.len(), pixel_count)?;

    struct Visitor<'a> {
        grid: TileGrid,
        inputs: &'a Inputs<'a>,
        state: &'a BackwardState<'a>,
        grads: &'a OutputGrads<'a>,
        gradients: Gradients,
        thresholds: &'a Thresholds,
    }

    impl ChannelVisitor for Visitor<'_> {
        type Output = Gradients;

        fn visit<const C: usize>(mut self) -> Gradients {
            let tiles = kernel::backward::<C>(
                &self.grid,
                &self.inputs.intersections,
                &self.inputs.surfels,
                cast_slice(self.inputs.colors),
                cast_slice(self.inputs.normals),
                self.inputs.backgrounds.map(cast_slice::<f32, [f32; C]>),
                self.inputs.masks,
                &PixelAnchors {
                    alphas: self.state.alphas,
                    colors: cast_slice(self.state.colors),
                    last_ids: self.state.last_ids,
                    median_ids: self.state.median_ids,
                },
                &PixelGrads {
                    alphas: self.grads.alphas,
                    colors: cast_slice(self.grads.colors),
                    distortions: self.grads.distortions,
                    median_depths: self.grads.median_depths,
                    normals: cast_slice(self.grads.normals),
                },
                self.thresholds,
            );

            // Reducing the slots in tile order

            let gradients = &mut self.gradients;
            tiles.iter().for_each(|tile| {
                tile.for_each(
                    self.inputs.intersections.flatten_ids,
                    |id, _, grad: &SurfelGrad<C>| {
                        let id = id as usize;
                        add_scaled(
                            &mut gradients.colors_grad[id * C..(id + 1) * C],
                            &grad.color,
                            1.0,
                        );
                        add_scaled(
                            &mut gradients.densifications_grad[id * 2..id * 2 + 2],
                            &grad.densification,
                            1.0,
                        );
                        add_scaled(
                            &mut gradients.means_2d_grad[id * 2..id * 2 + 2],
                            &grad.mean,
                            1.0,
                        );
                        if let Some(means_2d_grad_abs) =
                            gradients.means_2d_grad_abs.as_mut()
                        {
                            add_scaled(
                                &mut means_2d_grad_abs[id * 2..id * 2 + 2],
                                &grad.mean_abs,
                                1.0,
                            );
                        }
                        add_scaled(
                            &mut gradients.normals_grad[id * 3..id * 3 + 3],
                            &grad.normal,
                            1.0,
                        );
                        gradients.opacities_grad[id] += grad.opacity;
                        add_scaled(
                            &mut gradients.ray_transforms_grad[id * 9..id * 9 + 9],
                            grad.ray_transform.as_flattened(),
                            1.0,
                        );
                    },
                );
            });

            self.gradients
        }
    }

    // Compositing the pixels backward

    dispatch(
        channel_count,
        Visitor {
            grid,
            inputs,
            state,
            grads,
            gradients: Gradients {
                colors_grad: vec![0.0; point_count * channel_count],
                densifications_grad: vec![0.0; point_count * 2],
                means_2d_grad: vec![0.0; point_count * 2],
                means_2d_grad_abs: absgrad.then(|| vec![0.0; point_count * 2]),
                normals_grad: vec![0.0; point_count * 3],
                opacities_grad: vec![0.0; point_count],
                ray_transforms_grad: vec![0.0; point_count * 9],
            },
            thresholds,
        },
    )
}

/// Extracting the contributing pairs of surfels and pixels.
///
/// The walk of each pixel covers the steps `range_start..range_end` of its
/// tile and starts from its transmittance `[I, I_y, I_x]`.
pub fn indices(
    grid: &TileGrid,
    range_start: u32,
    range_end: u32,
    transmittances: &[f32],
    surfels: &Surfels,
    intersections: &TileIntersections,
) -> Result<Vec<Contributor>, Error> {
    #[cfg(debug_assertions)]
    log::debug!(
        target: "gausplat::rasterizer::gaussian_2d",
        "indices",
    );

    let window = validate_window(range_start, range_end)?;
    let point_count = surfels.validate()?;
    ensure_len("transmittances", transmittances.len(), grid.pixel_count())?;
    intersections.validate(grid, point_count)?;

    let thresholds = Thresholds::default();
    let compaction = contributor::extract(
        grid,
        intersections,
        transmittances,
        window,
        &thresholds,
        |_, pixel, id| {
            surfels
                .get(id)
                .sample(pixel.center(), &thresholds)
                .map(|sample| sample.alpha)
        },
    );

    #[cfg(debug_assertions)]
    log::debug!(
        target: "gausplat::rasterizer::gaussian_2d",
        "indices > contributors ({})",
        humansize::format_size(
            compaction.items.len() * std::mem::size_of::<Contributor>(),
            humansize::BINARY,
        ),
    );

    Ok(compaction.items)
}
