//! Compositing of projected 2D conic splats.

pub mod kernel;

pub use super::*;
pub use bytemuck::{Pod, Zeroable};
pub use kernel::{Sample, Splat, SplatGrad, SplatSource};

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
    /// `C`
    pub channel_count: u32,
}

/// The footprints of the primitives.
#[derive(Clone, Copy, Debug)]
pub struct Splats<'a> {
    /// `[P, 3]`
    pub conics: &'a [f32],
    /// `[P, 2]`
    pub means_2d: &'a [f32],
    /// `[P]`
    pub opacities: &'a [f32],
}

#[derive(Clone, Copy, Debug)]
pub struct Inputs<'a> {
    pub splats: Splats<'a>,
    /// `[P, C]`
    pub colors: &'a [f32],
    /// `[I, C]`, filling the residual transmittance if present.
    pub backgrounds: Option<&'a [f32]>,
    /// `[I, T_y, T_x]`, a `false` tile is not rendered.
    pub masks: Option<&'a [bool]>,
    pub intersections: TileIntersections<'a>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Outputs {
    /// `[I, I_y, I_x, C]`
    pub colors: Vec<f32>,
    /// `[I, I_y, I_x]`
    pub alphas: Vec<f32>,
    /// `[I, I_y, I_x]`
    pub last_ids: Vec<i32>,
    /// `[I, I_y, I_x]`
    pub contributor_counts: Vec<u32>,
}

/// The forward outputs the backward pass walks from.
#[derive(Clone, Copy, Debug)]
pub struct BackwardState<'a> {
    /// `[I, I_y, I_x]`
    pub alphas: &'a [f32],
    /// `[I, I_y, I_x]`
    pub last_ids: &'a [i32],
}

#[derive(Clone, Copy, Debug)]
pub struct OutputGrads<'a> {
    /// `[I, I_y, I_x, C]`
    pub colors: &'a [f32],
    /// `[I, I_y, I_x]`
    pub alphas: &'a [f32],
}

/// The sizes of the inputs that passed [`Arguments::check`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CheckedSizes {
    pub grid: TileGrid,
    pub channel_count: ChannelCount,
    /// `P`
    pub point_count: usize,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Gradients {
    /// `[P, C]`
    pub colors_grad: Vec<f32>,
    /// `[P, 3]`
    pub conics_grad: Vec<f32>,
    /// `[P, 2]`
    pub means_2d_grad: Vec<f32>,
    /// `[P, 2]`, present if requested.
    pub means_2d_grad_abs: Option<Vec<f32>>,
    /// `[P]`
    pub opacities_grad: Vec<f32>,
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

    /// Checking the inputs against the arguments.
    pub fn check(
        &self,
        inputs: &Inputs,
    ) -> Result<CheckedSizes, Error> {
        let grid = self.grid()?;
        let channel_count = ChannelCount::new(self.channel_count as usize)?;
        let point_count = inputs.validate(&grid, channel_count.get())?;

        Ok(CheckedSizes {
            grid,
            channel_count,
            point_count,
        })
    }
}

impl Splats<'_> {
    /// Checking the buffers against each other.
    ///
    /// ## Returns
    ///
    /// `P`
    pub fn validate(&self) -> Result<usize, Error> {
        let point_count = self.opacities.len();
        ensure_len("conics", self.conics.len(), point_count * 3)?;
        ensure_len("means_2d", self.means_2d.len(), point_count * 2)?;
        Ok(point_count)
    }

    #[inline]
    fn get(
        &self,
        id: u32,
    ) -> Splat {
        let id = id as usize;
        Splat {
            mean: [self.means_2d[id * 2], self.means_2d[id * 2 + 1]],
            conic: [
                self.conics[id * 3],
                self.conics[id * 3 + 1],
                self.conics[id * 3 + 2],
            ],
            opacity: self.opacities[id],
        }
    }
}

impl Inputs<'_> {
    /// Checking every buffer before compositing.
    ///
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

        let point_count = self.splats.validate()?;
        ensure_len("colors", self.colors.len(), point_count * channel_count)?;
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

impl Gradients {
    fn zeros(
        point_count: usize,
        channel_count: usize,
        absgrad: bool,
    ) -> Self {
        Self {
            colors_grad: vec![0.0; point_count * channel_count],
            conics_grad: vec![0.0; point_count * 3],
            means_2d_grad: vec![0.0; point_count * 2],
            means_2d_grad_abs: absgrad.then(|| vec![0.0; point_count * 2]),
            opacities_grad: vec![0.0; point_count],
        }
    }
}

struct ConicSource<'a, const C: usize> {
    splats: Splats<'a>,
    colors: &'a [[f32; C]],
}

impl<const C: usize> SplatSource<C> for ConicSource<'_, C> {
    #[inline]
    fn splat(
        &self,
        _tile: &Tile,
        _pixel: Pixel,
        id: u32,
    ) -> Option<Splat> {
        Some(self.splats.get(id))
    }

    #[inline]
    fn color(
        &self,
        id: u32,
    ) -> &[f32; C] {
        &self.colors[id as usize]
    }
}

/// Compositing the splats into the images.
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
        target: "gausplat::rasterizer::gaussian_3d",
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
            let source = ConicSource::<C> {
                splats: self.inputs.splats,
                colors: cast_slice(self.inputs.colors),
            };
            let backgrounds =
                self.inputs.backgrounds.map(cast_slice::<f32, [f32; C]>);

            let pixels = kernel::forward(
                &self.grid,
                &self.inputs.intersections,
                &source,
                backgrounds,
                self.inputs.masks,
                self.thresholds,
            );

            Outputs {
                colors: pixels.iter().flat_map(|p| p.color).collect(),
                alphas: pixels.iter().map(|p| p.alpha).collect(),
                last_ids: pixels.iter().map(|p| p.last_id).collect(),
                contributor_counts: pixels
                    .iter()
                    .map(|p| p.contributor_count)
                    .collect(),
            }
        }
    }

    // Compositing the pixels

    let outputs = dispatch(
        channel_count,
        Visitor {
            grid,
            inputs,
            thresholds,
        },
    )?;

    #[cfg(debug_assertions)]
    log::debug!(
        target: "gausplat::rasterizer::gaussian_3d",
        "forward > contributors ({})",
        outputs.contributor_counts.iter().map(|&c| c as u64).sum::<u64>(),
    );

    Ok(outputs)
}

/// Computing the gradients of the splats from the gradients of the images.
///
/// `absgrad` requests the accumulated absolute gradients of the means.
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
    // Specifying the parameters

    let sizes = arguments.check(inputs)?;
    let channel_count = sizes.channel_count.get();
    let pixel_count = sizes.grid.pixel_count();
    ensure_len("alphas", state.alphas.len(), pixel_count)?;
    ensure_len("last_ids", state.last_ids.len(), pixel_count)?;
    ensure_len("colors_grad", grads.colors.len(), pixel_count * channel_count)?;
    ensure_len("alphas_grad", grads.alphas.len(), pixel_count)?;

    Ok(backward_checked(
        &sizes, inputs, state, grads, absgrad, thresholds,
    ))
}

/// Computing the gradients from the buffers of the checked sizes.
///
/// `state` and `grads` should cover `sizes.grid.pixel_count()` pixels.
pub(crate) fn backward_checked(
    sizes: &CheckedSizes,
    inputs: &Inputs,
    state: &BackwardState,
    grads: &OutputGrads,
    absgrad: bool,
    thresholds: &Thresholds,
) -> Gradients {
    #[cfg(debug_assertions)]
    log::debug!(
        target: "gausplat::rasterizer::gaussian_3d",
        "backward",
    );

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
            let source = ConicSource::<C> {
                splats: self.inputs.splats,
                colors: cast_slice(self.inputs.colors),
            };

            let tiles = kernel::backward(
                &self.grid,
                &self.inputs.intersections,
                &source,
                self.inputs.backgrounds.map(cast_slice::<f32, [f32; C]>),
                self.inputs.masks,
                &PixelAnchors {
                    alphas: self.state.alphas,
                    last_ids: self.state.last_ids,
                },
                &PixelGrads {
                    colors: cast_slice(self.grads.colors),
                    alphas: self.grads.alphas,
                },
                self.thresholds,
            );

            // Reducing the slots in tile order

            let gradients = &mut self.gradients;
            tiles.iter().for_each(|tile| {
                tile.for_each(
                    self.inputs.intersections.flatten_ids,
                    |id, _, grad: &SplatGrad<C>| {
                        let id = id as usize;
                        add_scaled(
                            &mut gradients.colors_grad[id * C..(id + 1) * C],
                            &grad.color,
                            1.0,
                        );
                        add_scaled(
                            &mut gradients.conics_grad[id * 3..id * 3 + 3],
                            &grad.conic,
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
                        gradients.opacities_grad[id] += grad.opacity;
                    },
                );
            });

            self.gradients
        }
    }

    // Compositing the pixels backward

    sizes.channel_count.visit(Visitor {
        grid: sizes.grid,
        inputs,
        state,
        grads,
        gradients: Gradients::zeros(
            sizes.point_count,
            sizes.channel_count.get(),
            absgrad,
        ),
        thresholds,
    })
}

/// Extracting the contributing pairs of splats and pixels.
///
/// The walk of each pixel covers the steps `range_start..range_end` of its
/// tile and starts from its transmittance `[I, I_y, I_x]`.
/// The pairs are ordered by pixel and then by step.
pub fn indices(
    grid: &TileGrid,
    range_start: u32,
    range_end: u32,
    transmittances: &[f32],
    splats: &Splats,
    intersections: &TileIntersections,
) -> Result<Vec<Contributor>, Error> {
    indices_with(
        grid,
        range_start,
        range_end,
        transmittances,
        splats,
        intersections,
        &Thresholds::default(),
    )
    .map(|compaction| compaction.items)
}

pub(crate) fn indices_with(
    grid: &TileGrid,
    range_start: u32,
    range_end: u32,
    transmittances: &[f32],
    splats: &Splats,
    intersections: &TileIntersections,
    thresholds: &Thresholds,
) -> Result<Compaction<Contributor>, Error> {
    #[cfg(debug_assertions)]
    log::debug!(
        target: "gausplat::rasterizer::gaussian_3d",
        "indices",
    );

    // Specifying the parameters

    let window = validate_window(range_start, range_end)?;
    let point_count = splats.validate()?;
    ensure_len("transmittances", transmittances.len(), grid.pixel_count())?;
    intersections.validate(grid, point_count)?;

    // Extracting the contributors

    let compaction = contributor::extract(
        grid,
        intersections,
        transmittances,
        window,
        thresholds,
        |_, pixel, id| {
            splats
                .get(id)
                .sample(pixel.center(), thresholds)
                .map(|sample| sample.alpha)
        },
    );

    #[cfg(debug_assertions)]
    log::debug!(
        target: "gausplat::rasterizer::gaussian_3d",
        "indices > contributors ({}, {})",
        compaction.items.len(),
        humansize::format_size(
            compaction.items.len() * std::mem::size_of::<Contributor>(),
            humansize::BINARY,
        ),
    );

    Ok(compaction)
}
