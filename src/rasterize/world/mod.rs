//! Compositing of world-space Gaussians projected on the fly.
//!
//! The primitives are laid out densely: the id `image * N + point` refers to
//! the Gaussian `point` seen by the camera of `image`. Global-shutter cameras
//! project each Gaussian once. Rolling-shutter cameras project it per exposure
//! line, and the gradients are gathered per line before being pulled back
//! through the projection.

pub use super::gaussian_3d::{
    kernel::{self, Splat, SplatGrad, SplatSource},
    BackwardState, OutputGrads, Outputs,
};
pub use super::*;
pub use crate::camera::{
    Camera, EwaProjector, Footprint, FootprintGrad, Gaussian3d, Gaussian3dGrad, Pose,
    Projector, ShutterType,
};

use crate::{
    error::ensure_len,
    rasterize::{add_scaled, Thresholds},
};
use bytemuck::cast_slice;
use kernel::{PixelAnchors, PixelGrads};
use rayon::prelude::*;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Arguments {
    /// `I_x`
    pub image_size_x: u32,
    /// `I_y`
    pub image_size_y: u32,
    /// `T`
    pub tile_size: u32,
    /// `C`
    pub channel_count: u32,
}

#[derive(Clone, Copy, Debug)]
pub struct Gaussians<'a> {
    /// `[N, 3]`
    pub means: &'a [f32],
    /// `[N, 4]`, `[w, x, y, z]`
    pub rotations: &'a [f32],
    /// `[N, 3]`
    pub scalings: &'a [f32],
}

#[derive(Clone, Copy, Debug)]
pub struct Inputs<'a> {
    pub gaussians: Gaussians<'a>,
    /// `[I]`
    pub cameras: &'a [Camera],
    /// `[I, N]`
    pub opacities: &'a [f32],
    /// `[I, N, C]`
    pub colors: &'a [f32],
    /// `[I, C]`
    pub backgrounds: Option<&'a [f32]>,
    /// `[I, T_y, T_x]`
    pub masks: Option<&'a [bool]>,
    /// The ids are in `[0, I * N)`.
    pub intersections: TileIntersections<'a>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Gradients {
    /// `[I, N, C]`
    pub colors_grad: Vec<f32>,
    /// `[N, 3]`
    pub means_grad: Vec<f32>,
    /// `[I, N]`
    pub opacities_grad: Vec<f32>,
    /// `[N, 4]`
    pub rotations_grad: Vec<f32>,
    /// `[N, 3]`
    pub scalings_grad: Vec<f32>,
}

impl Arguments {
    pub fn grid(
        &self,
        image_count: usize,
    ) -> Result<TileGrid, Error> {
        TileGrid::new(
            image_count as u32,
            self.image_size_x,
            self.image_size_y,
            self.tile_size,
        )
    }
}

impl Gaussians<'_> {
    /// ## Returns
    ///
    /// `N`
    pub fn validate(&self) -> Result<usize, Error> {
        let point_count = self.means.len() / 3;
        ensure_len("means", self.means.len(), point_count * 3)?;
        ensure_len("rotations", self.rotations.len(), point_count * 4)?;
        ensure_len("scalings", self.scalings.len(), point_count * 3)?;
        Ok(point_count)
    }

    #[inline]
    pub fn get(
        &self,
        point: usize,
    ) -> Gaussian3d {
        let m = &self.means[point * 3..point * 3 + 3];
        let r = &self.rotations[point * 4..point * 4 + 4];
        let s = &self.scalings[point * 3..point * 3 + 3];
        Gaussian3d {
            mean: [m[0], m[1], m[2]],
            rotation: [r[0], r[1], r[2], r[3]],
            scaling: [s[0], s[1], s[2]],
        }
    }
}

impl Inputs<'_> {
    /// ## Returns
    ///
    /// `N`
    pub fn validate<P: Projector>(
        &self,
        arguments: &Arguments,
        grid: &TileGrid,
        projector: &P,
    ) -> Result<usize, Error> {
        let channel_count = arguments.channel_count as usize;
        if !channel::is_supported(channel_count) {
            return Err(Error::UnsupportedChannelCount(channel_count));
        }

        let point_count = self.gaussians.validate()?;
        let image_count = self.cameras.len();
        let primitive_count = image_count * point_count;
        for (image, camera) in self.cameras.iter().enumerate() {
            projector.supports(camera)?;
            let image_size = [arguments.image_size_x, arguments.image_size_y];
            if camera.image_size != image_size {
                return Err(Error::MismatchedShape(
                    format!("cameras[{image}].image_size ({:?})", camera.image_size),
                    format!("{image_size:?}"),
                ));
            }
        }
        ensure_len("opacities", self.opacities.len(), primitive_count)?;
        ensure_len(
            "colors",
            self.colors.len(),
            primitive_count * channel_count,
        )?;
        if let Some(backgrounds) = self.backgrounds {
            ensure_len("backgrounds", backgrounds.len(), image_count * channel_count)?;
        }
        if let Some(masks) = self.masks {
            ensure_len("masks", masks.len(), grid.tile_count())?;
        }
        self.intersections.validate(grid, primitive_count)?;

        Ok(point_count)
    }
}

/// The poses and the global-shutter footprints of every camera.
struct Projections {
    /// `[I, lines]`
    poses: Vec<Vec<Pose>>,
    /// `[I * N]`, empty for rolling cameras.
    footprints: Vec<Option<Footprint>>,
    /// `T` if any camera rolls.
    lane_count: usize,
}

impl Projections {
    fn new<P: Projector>(
        projector: &P,
        inputs: &Inputs,
        grid: &TileGrid,
        point_count: usize,
    ) -> Self {
        let poses = inputs
            .cameras
            .iter()
            .map(|camera| {
                if camera.is_rolling() {
                    (0..camera.line_count()).map(|line| camera.pose(line)).collect()
                } else {
                    vec![camera.pose(0)]
                }
            })
            .collect::<Vec<Vec<Pose>>>();

        let footprints = (0..inputs.cameras.len() * point_count)
            .into_par_iter()
            .map(|id| {
                let image = id / point_count;
                let camera = &inputs.cameras[image];
                if camera.is_rolling() {
                    return None;
                }
                projector.project(
                    &inputs.gaussians.get(id % point_count),
                    camera,
                    &poses[image][0],
                )
            })
            .collect();

        let lane_count = if inputs.cameras.iter().any(Camera::is_rolling) {
            grid.tile_size as usize
        } else {
            1
        };

        Self {
            poses,
            footprints,
            lane_count,
        }
    }

    /// The exposure line of a gradient lane.
    #[inline]
    fn line(
        camera: &Camera,
        tile: &Tile,
        lane: usize,
    ) -> u32 {
        if !camera.is_rolling() {
            return 0;
        }
        match camera.shutter {
            ShutterType::Global => 0,
            ShutterType::RollingTopToBottom => tile.y_min + lane as u32,
            ShutterType::RollingLeftToRight => tile.x_min + lane as u32,
        }
    }
}

struct WorldSource<'a, P, const C: usize> {
    projector: &'a P,
    inputs: &'a Inputs<'a>,
    colors: &'a [[f32; C]],
    point_count: usize,
    projections: &'a Projections,
}

impl<P: Projector, const C: usize> SplatSource<C> for WorldSource<'_, P, C> {
    #[inline]
    fn splat(
        &self,
        tile: &Tile,
        pixel: Pixel,
        id: u32,
    ) -> Option<Splat> {
        let id = id as usize;
        let image = tile.image as usize;
        let camera = &self.inputs.cameras[image];

        let footprint = if camera.is_rolling() {
            let line = camera.line(pixel.x, pixel.y) as usize;
            self.projector.project(
                &self.inputs.gaussians.get(id % self.point_count),
                camera,
                &self.projections.poses[image][line],
            )?
        } else {
            self.projections.footprints[id]?
        };

        Some(Splat {
            mean: footprint.mean,
            conic: footprint.conic,
            opacity: self.inputs.opacities[id],
        })
    }

    #[inline]
    fn color(
        &self,
        id: u32,
    ) -> &[f32; C] {
        &self.colors[id as usize]
    }

    #[inline]
    fn lane_count(&self) -> usize {
        self.projections.lane_count
    }

    #[inline]
    fn lane(
        &self,
        tile: &Tile,
        pixel: Pixel,
    ) -> usize {
        let camera = &self.inputs.cameras[tile.image as usize];
        if !camera.is_rolling() {
            return 0;
        }
        match camera.shutter {
            ShutterType::Global => 0,
            ShutterType::RollingTopToBottom => (pixel.y - tile.y_min) as usize,
            ShutterType::RollingLeftToRight => (pixel.x - tile.x_min) as usize,
        }
    }
}

/// Projecting and compositing the Gaussians into the images of the cameras.
pub fn forward<P: Projector>(
    arguments: &Arguments,
    inputs: &Inputs,
    projector: &P,
) -> Result<Outputs, Error> {
    forward_with(arguments, inputs, projector, &Thresholds::default())
}

pub(crate) fn forward_with<P: Projector>(
    arguments: &Arguments,
    inputs: &Inputs,
    projector: &P,
    thresholds: &Thresholds,
) -> Result<Outputs, Error> {
    #[cfg(debug_assertions)]
    log::debug!(
        target: "gausplat::rasterizer::world",
        "forward",
    );

    // Specifying the parameters

    let grid = arguments.grid(inputs.cameras.len())?;
    let point_count = inputs.validate(arguments, &grid, projector)?;
    let channel_count = arguments.channel_count as usize;

    // Projecting the global-shutter footprints

    let projections = Projections::new(projector, inputs, &grid, point_count);

    #[cfg(debug_assertions)]
    log::debug!(
        target: "gausplat::rasterizer::world",
        "forward > projections ({} lanes)",
        projections.lane_count,
    );

    struct Visitor<'a, P> {
        grid: TileGrid,
        inputs: &'a Inputs<'a>,
        point_count: usize,
        projections: &'a Projections,
        projector: &'a P,
        thresholds: &'a Thresholds,
    }

    impl<P: Projector> ChannelVisitor for Visitor<'_, P> {
        type Output = Outputs;

        fn visit<const C: usize>(self) -> Outputs {
            let source = WorldSource::<P, C> {
                projector: self.projector,
                inputs: self.inputs,
                colors: cast_slice(self.inputs.colors),
                point_count: self.point_count,
                projections: self.projections,
            };

            let pixels = kernel::forward(
                &self.grid,
                &self.inputs.intersections,
                &source,
                self.inputs.backgrounds.map(cast_slice::<f32, [f32; C]>),
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
            point_count,
            projections: &projections,
            projector,
            thresholds,
        },
    )?;

    #[cfg(debug_assertions)]
    log::debug!(
        target: "gausplat::rasterizer::world",
        "forward > contributors ({})",
        outputs.contributor_counts.iter().map(|&c| c as u64).sum::<u64>(),
    );

    Ok(outputs)
}

/// Computing the gradients of the Gaussians from the gradients of the images.
pub fn backward<P: Projector>(
    arguments: &Arguments,
    inputs: &Inputs,
    state: &BackwardState,
    grads: &OutputGrads,
    projector: &P,
) -> Result<Gradients, Error> {
    backward_with(
        arguments,
        inputs,
        state,
        grads,
        projector,
        &Thresholds::default(),
    )
}

pub(crate) fn backward_with<P: Projector>(
    arguments: &Arguments,
    inputs: &Inputs,
    state: &BackwardState,
    grads: &OutputGrads,
    projector: &P,
    thresholds: &Thresholds,
) -> Result<Gradients, Error> {
    #[cfg(debug_assertions)]
    log::debug!(
        target: "gausplat::rasterizer::world",
        "backward",
    );

    // Specifying the parameters

    let grid = arguments.grid(inputs.cameras.len())?;
    let point_count = inputs.validate(arguments, &grid, projector)?;
    let channel_count = arguments.channel_count as usize;
    let pixel_count = grid.pixel_count();
    ensure_len("alphas", state.alphas.len(), pixel_count)?;
    ensure_len("last_ids", state.last_ids.len(), pixel_count)?;
    ensure_len("colors_grad", grads.colors.len(), pixel_count * channel_count)?;
    ensure_len("alphas_grad", grads.alphas.len(), pixel_count)?;

    let projections = Projections::new(projector, inputs, &grid, point_count);

    struct Visitor<'a, P> {
        grid: TileGrid,
        inputs: &'a Inputs<'a>,
        state: &'a BackwardState<'a>,
        grads: &'a OutputGrads<'a>,
        point_count: usize,
        projections: &'a Projections,
        projector: &'a P,
        thresholds: &'a Thresholds,
    }

    impl<P: Projector> ChannelVisitor for Visitor<'_, P> {
        type Output = Gradients;

        fn visit<const C: usize>(self) -> Gradients {
            let source = WorldSource::<P, C> {
                projector: self.projector,
                inputs: self.inputs,
                colors: cast_slice(self.inputs.colors),
                point_count: self.point_count,
                projections: self.projections,
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

            // Pulling the footprint gradients back through the projection

            let flatten_ids = self.inputs.intersections.flatten_ids;
            let projected = tiles
                .par_iter()
                .map(|tile| {
                    let image = tile.tile.image as usize;
                    let camera = &self.inputs.cameras[image];
                    let mut gaussian_grads = Vec::new();
                    tile.for_each(flatten_ids, |id, lane, grad: &SplatGrad<C>| {
                        if grad.mean == [0.0; 2] && grad.conic == [0.0; 3] {
                            return;
                        }
                        let point = id as usize % self.point_count;
                        let line = Projections::line(camera, &tile.tile, lane);
                        let gaussian_grad = self.projector.project_backward(
                            &self.inputs.gaussians.get(point),
                            camera,
                            &self.projections.poses[image][line as usize],
                            &FootprintGrad {
                                mean: grad.mean,
                                conic: grad.conic,
                            },
                        );
                        gaussian_grads.push((point, gaussian_grad));
                    });
                    gaussian_grads
                })
                .collect::<Vec<_>>();

            // Reducing the slots in tile order

            let point_count = self.point_count;
            let mut gradients = Gradients {
                colors_grad: vec![0.0; self.inputs.colors.len()],
                means_grad: vec![0.0; point_count * 3],
                opacities_grad: vec![0.0; self.inputs.opacities.len()],
                rotations_grad: vec![0.0; point_count * 4],
                scalings_grad: vec![0.0; point_count * 3],
            };

            tiles.iter().for_each(|tile| {
                tile.for_each(flatten_ids, |id, _, grad: &SplatGrad<C>| {
                    let id = id as usize;
                    add_scaled(
                        &mut gradients.colors_grad[id * C..(id + 1) * C],
                        &grad.color,
                        1.0,
                    );
                    gradients.opacities_grad[id] += grad.opacity;
                });
            });
            projected.iter().flatten().for_each(|(point, grad)| {
                let point = *point;
                add_scaled(
                    &mut gradients.means_grad[point * 3..point * 3 + 3],
                    &grad.mean,
                    1.0,
                );
                add_scaled(
                    &mut gradients.rotations_grad[point * 4..point * 4 + 4],
                    &grad.rotation,
                    1.0,
                );
                add_scaled(
                    &mut gradients.scalings_grad[point * 3..point * 3 + 3],
                    &grad.scaling,
                    1.0,
                );
            });

            gradients
        }
    }

    // Compositing the pixels backward

    let gradients = dispatch(
        channel_count,
        Visitor {
            grid,
            inputs,
            state,
            grads,
            point_count,
            projections: &projections,
            projector,
            thresholds,
        },
    )?;

    #[cfg(debug_assertions)]
    log::debug!(
        target: "gausplat::rasterizer::world",
        "backward > points ({point_count})",
    );

    Ok(gradients)
}
