//! Differentiable compositing of conic splats on burn tensors.

pub mod backward;
pub mod forward;

pub use crate::{
    backend::{Autodiff, AutodiffBackend, Backend},
    error::Error,
    function::{TensorHostExtension, TensorHostWrite},
    rasterize::{gaussian_3d as host, TileIntersections, TILE_SIZE},
};
pub use burn::{
    config::Config,
    tensor::{Bool, Int, Tensor},
};

use burn::{
    backend::autodiff::{
        checkpoint::{base::Checkpointer, strategy::NoCheckpointing},
        grads::Gradients,
        ops::{Backward, Ops, OpsKind},
    },
    tensor::TensorPrimitive,
};
use std::{fmt, marker};

#[derive(Config, Debug)]
pub struct RasterizeOptions {
    /// `I_x`
    pub image_width: u32,
    /// `I_y`
    pub image_height: u32,
    #[config(default = "TILE_SIZE")]
    /// `T`
    pub tile_size: u32,
    #[config(default = false)]
    /// Accumulating the absolute gradients of the means.
    pub absgrad: bool,
}

#[derive(Clone, Debug)]
pub struct RasterizeInput<B: Backend> {
    /// `[P, 2]`
    pub means_2d: Tensor<B, 2>,
    /// `[P, 3]`
    pub conics: Tensor<B, 2>,
    /// `[P, C]`
    pub colors: Tensor<B, 2>,
    /// `[P]`
    pub opacities: Tensor<B, 1>,
    /// `[I, C]`
    pub backgrounds: Option<Tensor<B, 2>>,
    /// `[I, T_y, T_x]`
    pub masks: Option<Tensor<B, 3, Bool>>,
    /// `[I, T_y, T_x]`
    pub tile_offsets: Tensor<B, 3, Int>,
    /// `[N]`
    pub flatten_ids: Tensor<B, 1, Int>,
}

#[derive(Clone)]
pub struct RasterizeOutput<B: Backend> {
    /// `[I, I_y, I_x, C]`
    pub colors: Tensor<B, 4>,
    /// `[I, I_y, I_x]`
    pub alphas: Tensor<B, 3>,
    /// `[I, I_y, I_x]`
    pub last_ids: Tensor<B, 3, Int>,
}

#[derive(Clone)]
pub struct RasterizeOutputAutodiff<AB: AutodiffBackend> {
    /// `[I, I_y, I_x, C]`
    pub colors: Tensor<AB, 4>,
    /// `[I, I_y, I_x]`
    pub alphas: Tensor<AB, 3>,
    /// `[I, I_y, I_x]`
    pub last_ids: Tensor<AB::InnerBackend, 3, Int>,

    /// The shape of gradient is `[P, 2]`.
    ///
    /// It is present if [`RasterizeOptions::absgrad`] is set.
    ///
    /// ## Usage
    ///
    /// ```ignore
    /// use burn::backend::autodiff::grads::Gradients;
    ///
    /// let mut grads: Gradients = todo!();
    ///
    /// let means_2d_grad_abs =
    ///     means_2d_grad_abs_ref.grad_remove(&mut grads);
    /// ```
    pub means_2d_grad_abs_ref: Option<Tensor<AB, 2>>,
}

#[derive(Clone, Copy, Debug, Default)]
struct RasterizeBackward<B: Backend> {
    __: marker::PhantomData<B>,
}

impl<B: Backend> RasterizeInput<Autodiff<B>> {
    /// Detaching the tensors from the graph.
    pub fn inner(self) -> RasterizeInput<B> {
        RasterizeInput {
            means_2d: self.means_2d.inner(),
            conics: self.conics.inner(),
            colors: self.colors.inner(),
            opacities: self.opacities.inner(),
            backgrounds: self.backgrounds.map(Tensor::inner),
            masks: self.masks.map(Tensor::inner),
            tile_offsets: self.tile_offsets.inner(),
            flatten_ids: self.flatten_ids.inner(),
        }
    }
}

/// Compositing the splats into the images.
pub fn rasterize<B: Backend>(
    input: RasterizeInput<B>,
    options: &RasterizeOptions,
) -> Result<RasterizeOutput<B>, Error> {
    #[cfg(debug_assertions)]
    log::debug!(target: "gausplat::rasterizer::render", "rasterize");

    let device = input.colors.device();
    let input = forward::HostInput::read(input, options)?;
    let outputs = host::forward(&input.arguments, &input.inputs())?;
    let image_dims = input.image_dims();
    let [image_count, image_size_y, image_size_x] = image_dims;

    Ok(RasterizeOutput {
        colors: Tensor::from_host(
            outputs.colors,
            [image_count, image_size_y, image_size_x, input.channel_count()],
            &device,
        ),
        alphas: Tensor::from_host(outputs.alphas, image_dims, &device),
        last_ids: Tensor::from_host(outputs.last_ids, image_dims, &device),
    })
}

/// Compositing the splats into the images and tracking the gradients
/// of `means_2d`, `conics`, `colors` and `opacities`.
///
/// The backgrounds are not differentiated.
#[must_use = "The gradients should be used"]
pub fn rasterize_autodiff<B: Backend>(
    input: RasterizeInput<Autodiff<B>>,
    options: &RasterizeOptions,
) -> Result<RasterizeOutputAutodiff<Autodiff<B>>, Error> {
    #[cfg(debug_assertions)]
    log::debug!(target: "gausplat::rasterizer::render", "rasterize_autodiff");

    let device = input.colors.device();
    let means_2d = input.means_2d.to_owned().into_primitive().tensor();
    let conics = input.conics.to_owned().into_primitive().tensor();
    let colors = input.colors.to_owned().into_primitive().tensor();
    let opacities = input.opacities.to_owned().into_primitive().tensor();

    let means_2d_grad_abs_ref = options.absgrad.then(|| {
        Tensor::<Autodiff<B>, 2>::empty([1, 2], &device).require_grad()
    });
    let means_2d_grad_abs_ref_id = means_2d_grad_abs_ref
        .as_ref()
        .map(|tensor| tensor.to_owned().into_primitive().tensor().node.id);

    // Compositing the pixels

    let input = forward::HostInput::read(input.inner(), options)?;
    let sizes = input.arguments.check(&input.inputs())?;
    let outputs = host::forward(&input.arguments, &input.inputs())?;

    let channel_count = input.channel_count();
    let image_dims = input.image_dims();
    let [image_count, image_size_y, image_size_x] = image_dims;
    let last_ids = Tensor::from_host(outputs.last_ids.to_owned(), image_dims, &device);
    let output = Tensor::<B, 4>::from_host(
        forward::colors_with_alphas(&outputs, channel_count),
        [image_count, image_size_y, image_size_x, channel_count + 1],
        &device,
    )
    .into_primitive()
    .tensor();

    // Tracking the gradients

    let output = Tensor::<Autodiff<B>, 4>::new(TensorPrimitive::Float(
        match RasterizeBackward::<B>::default()
            .prepare::<NoCheckpointing>([
                means_2d.node,
                conics.node,
                colors.node,
                opacities.node,
            ])
            .compute_bound()
            .stateful()
        {
            OpsKind::Tracked(prep) => prep.finish(
                backward::RasterizeBackwardState {
                    device,
                    input,
                    sizes,
                    alphas: outputs.alphas,
                    last_ids: outputs.last_ids,
                    means_2d_grad_abs_ref_id,
                },
                output,
            ),
            OpsKind::UnTracked(prep) => prep.finish(output),
        },
    ));

    let colors = output.to_owned().slice([
        0..image_count,
        0..image_size_y,
        0..image_size_x,
        0..channel_count,
    ]);
    let alphas = output
        .slice([
            0..image_count,
            0..image_size_y,
            0..image_size_x,
            channel_count..channel_count + 1,
        ])
        .squeeze::<3>(3);

    Ok(RasterizeOutputAutodiff {
        colors,
        alphas,
        last_ids,
        means_2d_grad_abs_ref,
    })
}

impl<B: Backend> Backward<B, 4> for RasterizeBackward<B> {
    type State = backward::RasterizeBackwardState<B>;

    fn backward(
        self,
        ops: Ops<Self::State, 4>,
        grads: &mut Gradients,
        _checkpointer: &mut Checkpointer,
    ) {
        #[cfg(debug_assertions)]
        log::debug!(
            target: "gausplat::rasterizer::render",
            "RasterizeBackward::backward",
        );

        let output_grad = grads.consume::<B>(&ops.node);

        if ops.parents.iter().all(Option::is_none) {
            return;
        }

        let output = ops
            .state
            .backward(Tensor::new(TensorPrimitive::Float(output_grad)));

        if let Some(node) = &ops.parents[0] {
            grads.register::<B>(node.id, output.means_2d_grad);
        }
        if let Some(node) = &ops.parents[1] {
            grads.register::<B>(node.id, output.conics_grad);
        }
        if let Some(node) = &ops.parents[2] {
            grads.register::<B>(node.id, output.colors_grad);
        }
        if let Some(node) = &ops.parents[3] {
            grads.register::<B>(node.id, output.opacities_grad);
        }

        if let (Some(id), Some(grad)) =
            (ops.state.means_2d_grad_abs_ref_id, output.means_2d_grad_abs)
        {
            grads.register::<B>(id, grad);
        }
    }
}

impl<B: Backend> fmt::Debug for RasterizeOutput<B> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct(&format!("RasterizeOutput<{}>", B::name()))
            .field("colors.dims()", &self.colors.dims())
            .field("alphas.dims()", &self.alphas.dims())
            .field("last_ids.dims()", &self.last_ids.dims())
            .finish()
    }
}

impl<AB: AutodiffBackend> fmt::Debug for RasterizeOutputAutodiff<AB> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct(&format!("RasterizeOutputAutodiff<{}>", AB::name()))
            .field("colors.dims()", &self.colors.dims())
            .field("alphas.dims()", &self.alphas.dims())
            .field("last_ids.dims()", &self.last_ids.dims())
            .field(
                "means_2d_grad_abs_ref.is_some()",
                &self.means_2d_grad_abs_ref.is_some(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::NdArray,
        rasterize::{test_weights, tile::intersect_all},
    };
    use burn::tensor::TensorData;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use rand_distr::Uniform;

    const OPTIONS_SIZE: [u32; 2] = [8, 6];
    const POINT_COUNT: usize = 6;
    const CHANNEL_COUNT: usize = 3;

    fn options() -> RasterizeOptions {
        RasterizeOptions::new(OPTIONS_SIZE[0], OPTIONS_SIZE[1]).with_tile_size(4)
    }

    /// `(means_2d, conics, colors, opacities, offsets, flatten_ids)`
    #[allow(clippy::type_complexity)]
    fn scene(seed: u64) -> (Vec<f32>, Vec<f32>, Vec<f32>, Vec<f32>, Vec<i32>, Vec<i32>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let means_2d = (0..POINT_COUNT)
            .flat_map(|_| {
                [
                    rng.sample(Uniform::new(0.0, OPTIONS_SIZE[0] as f32)),
                    rng.sample(Uniform::new(0.0, OPTIONS_SIZE[1] as f32)),
                ]
            })
            .collect();
        let conics = (0..POINT_COUNT)
            .flat_map(|_| {
                let a = rng.sample(Uniform::new(1.5_f32, 3.0)).powi(-2);
                let c = rng.sample(Uniform::new(1.5_f32, 3.0)).powi(-2);
                [a, 0.1 * (a * c).sqrt(), c]
            })
            .collect();
        let colors = (0..POINT_COUNT * CHANNEL_COUNT)
            .map(|_| rng.sample(Uniform::new(0.0, 1.0)))
            .collect();
        let opacities = (0..POINT_COUNT)
            .map(|_| rng.sample(Uniform::new(0.2, 0.9)))
            .collect();

        let grid = host::Arguments {
            image_count: 1,
            image_size_x: OPTIONS_SIZE[0],
            image_size_y: OPTIONS_SIZE[1],
            tile_size: 4,
            channel_count: CHANNEL_COUNT as u32,
        }
        .grid()
        .unwrap();
        let (offsets, flatten_ids) =
            intersect_all(&grid, &[(0..POINT_COUNT as u32).collect()]);

        (
            means_2d,
            conics,
            colors,
            opacities,
            offsets.into_iter().map(|o| o as i32).collect(),
            flatten_ids.into_iter().map(|id| id as i32).collect(),
        )
    }

    fn input<B: Backend>(
        seed: u64,
        device: &B::Device,
    ) -> RasterizeInput<B> {
        let (means_2d, conics, colors, opacities, offsets, flatten_ids) = scene(seed);
        let flatten_id_count = flatten_ids.len();

        RasterizeInput {
            means_2d: Tensor::from_host(means_2d, [POINT_COUNT, 2], device),
            conics: Tensor::from_host(conics, [POINT_COUNT, 3], device),
            colors: Tensor::from_host(colors, [POINT_COUNT, CHANNEL_COUNT], device),
            opacities: Tensor::from_host(opacities, [POINT_COUNT], device),
            backgrounds: None,
            masks: None,
            tile_offsets: Tensor::from_host(offsets, [1, 2, 2], device),
            flatten_ids: Tensor::from_host(flatten_ids, [flatten_id_count], device),
        }
    }

    #[test]
    fn rasterize_matches_host() {
        type B = NdArray;
        let device = Default::default();
        let options = options();

        let output = rasterize(input::<B>(0x1, &device), &options).unwrap();
        assert_eq!(output.colors.dims(), [1, 6, 8, CHANNEL_COUNT]);
        assert_eq!(output.alphas.dims(), [1, 6, 8]);

        let host_input = forward::HostInput::read(input::<B>(0x1, &device), &options).unwrap();
        let target = host::forward(&host_input.arguments, &host_input.inputs()).unwrap();
        assert_eq!(output.colors.into_host("colors").unwrap(), target.colors);
        assert_eq!(output.alphas.into_host("alphas").unwrap(), target.alphas);
        let last_ids = output
            .last_ids
            .into_data()
            .convert::<i32>()
            .into_vec::<i32>()
            .unwrap();
        assert_eq!(last_ids, target.last_ids);
    }

    #[test]
    fn rasterize_validates_inputs() {
        type B = NdArray;
        let device = Default::default();

        let mut input_conics = input::<B>(0x2, &device);
        input_conics.conics = Tensor::zeros([POINT_COUNT, 2], &device);
        let error = rasterize(input_conics, &options()).unwrap_err();
        assert!(matches!(error, Error::MismatchedShape(..)));
        assert!(!error.is_configuration());

        let mut input_colors = input::<B>(0x2, &device);
        input_colors.colors = Tensor::zeros([POINT_COUNT, 6], &device);
        let error = rasterize(input_colors, &options()).unwrap_err();
        assert!(matches!(error, Error::UnsupportedChannelCount(6)));
        assert!(error.is_configuration());

        let error = rasterize(input::<B>(0x2, &device), &options().with_tile_size(0))
            .unwrap_err();
        assert!(matches!(error, Error::InvalidTileSize(0)));
    }

    #[test]
    fn rasterize_autodiff_matches_host() {
        type B = NdArray;
        type AB = Autodiff<B>;
        let device = Default::default();
        let options = options().with_absgrad(true);

        let input_inner = input::<B>(0x3, &device);
        let input = RasterizeInput::<AB> {
            means_2d: Tensor::from_inner(input_inner.means_2d.to_owned()).require_grad(),
            conics: Tensor::from_inner(input_inner.conics.to_owned()).require_grad(),
            colors: Tensor::from_inner(input_inner.colors.to_owned()).require_grad(),
            opacities: Tensor::from_inner(input_inner.opacities.to_owned())
                .require_grad(),
            backgrounds: None,
            masks: None,
            tile_offsets: Tensor::from_inner(input_inner.tile_offsets.to_owned()),
            flatten_ids: Tensor::from_inner(input_inner.flatten_ids.to_owned()),
        };

        let output = rasterize_autodiff(input.to_owned(), &options).unwrap();
        assert_eq!(output.colors.dims(), [1, 6, 8, CHANNEL_COUNT]);
        assert_eq!(output.alphas.dims(), [1, 6, 8]);
        assert!(format!("{output:?}").contains("means_2d_grad_abs_ref.is_some(): true"));

        let colors_weights = test_weights(6 * 8 * CHANNEL_COUNT, 0.3);
        let alphas_weights = test_weights(6 * 8, 1.1);
        let loss = (output.colors.to_owned()
            * Tensor::<AB, 4>::from_host(
                colors_weights.to_owned(),
                [1, 6, 8, CHANNEL_COUNT],
                &device,
            ))
        .sum()
            + (output.alphas.to_owned()
                * Tensor::<AB, 3>::from_host(alphas_weights.to_owned(), [1, 6, 8], &device))
            .sum();
        let mut grads = loss.backward();

        // Comparing with the host gradients

        let host_input = forward::HostInput::read(input_inner, &options).unwrap();
        let outputs = host::forward(&host_input.arguments, &host_input.inputs()).unwrap();
        let target = host::backward(
            &host_input.arguments,
            &host_input.inputs(),
            &host::BackwardState {
                alphas: &outputs.alphas,
                last_ids: &outputs.last_ids,
            },
            &host::OutputGrads {
                colors: &colors_weights,
                alphas: &alphas_weights,
            },
            true,
        )
        .unwrap();

        let assert_close = |name: &str, output: Vec<f32>, target: &[f32]| {
            assert_eq!(output.len(), target.len(), "{name}");
            output.iter().zip(target).for_each(|(o, t)| {
                assert!((o - t).abs() <= 1e-5 * (1.0 + t.abs()), "{name}: {o} != {t}");
            });
        };
        assert_close(
            "means_2d",
            input.means_2d.grad(&grads).unwrap().into_host("means_2d").unwrap(),
            &target.means_2d_grad,
        );
        assert_close(
            "conics",
            input.conics.grad(&grads).unwrap().into_host("conics").unwrap(),
            &target.conics_grad,
        );
        assert_close(
            "colors",
            input.colors.grad(&grads).unwrap().into_host("colors").unwrap(),
            &target.colors_grad,
        );
        assert_close(
            "opacities",
            input.opacities.grad(&grads).unwrap().into_host("opacities").unwrap(),
            &target.opacities_grad,
        );
        assert_close(
            "means_2d_grad_abs",
            output
                .means_2d_grad_abs_ref
                .unwrap()
                .grad_remove(&mut grads)
                .unwrap()
                .into_host("means_2d_grad_abs")
                .unwrap(),
            target.means_2d_grad_abs.as_deref().unwrap(),
        );
    }

    #[test]
    fn backward_state_matches_host() {
        type B = NdArray;
        let device = Default::default();
        let options = options();
        let backgrounds = [0.2, 0.5, 0.9];

        let mut input = input::<B>(0x5, &device);
        input.backgrounds = Some(Tensor::from_host(
            backgrounds.to_vec(),
            [1, CHANNEL_COUNT],
            &device,
        ));
        input.masks = Some(Tensor::from_data(
            TensorData::new(vec![true, false, true, true], [1, 2, 2]),
            &device,
        ));
        let host_input = forward::HostInput::read(input, &options).unwrap();
        let sizes = host_input.arguments.check(&host_input.inputs()).unwrap();
        let outputs = host::forward(&host_input.arguments, &host_input.inputs()).unwrap();

        // The second tile is masked out
        assert_eq!(outputs.colors[4 * CHANNEL_COUNT..5 * CHANNEL_COUNT], backgrounds);
        assert_eq!(outputs.alphas[4], 0.0);
        assert_eq!(outputs.last_ids[4], crate::rasterize::LAST_ID_NONE);

        let colors_weights = test_weights(6 * 8 * CHANNEL_COUNT, 0.7);
        let alphas_weights = test_weights(6 * 8, 0.2);
        let output_grad = Tensor::<B, 4>::from_host(
            forward::colors_with_alphas(
                &host::Outputs {
                    colors: colors_weights.to_owned(),
                    alphas: alphas_weights.to_owned(),
                    ..Default::default()
                },
                CHANNEL_COUNT,
            ),
            [1, 6, 8, CHANNEL_COUNT + 1],
            &device,
        );
        let target = host::backward(
            &host_input.arguments,
            &host_input.inputs(),
            &host::BackwardState {
                alphas: &outputs.alphas,
                last_ids: &outputs.last_ids,
            },
            &host::OutputGrads {
                colors: &colors_weights,
                alphas: &alphas_weights,
            },
            false,
        )
        .unwrap();

        let state = backward::RasterizeBackwardState::<B> {
            device,
            input: host_input,
            sizes,
            alphas: outputs.alphas,
            last_ids: outputs.last_ids,
            means_2d_grad_abs_ref_id: None,
        };
        let grads = state.backward(output_grad);
        assert!(grads.means_2d_grad_abs.is_none());

        let into_host = |name: &str, grad| {
            Tensor::<B, 2>::new(TensorPrimitive::Float(grad))
                .into_host(name)
                .unwrap()
        };
        assert_eq!(into_host("colors", grads.colors_grad), target.colors_grad);
        assert_eq!(into_host("conics", grads.conics_grad), target.conics_grad);
        assert_eq!(into_host("means_2d", grads.means_2d_grad), target.means_2d_grad);
        assert_eq!(
            Tensor::<B, 1>::new(TensorPrimitive::Float(grads.opacities_grad))
                .into_host("opacities")
                .unwrap(),
            target.opacities_grad
        );
    }

    #[test]
    fn rasterize_autodiff_untracked() {
        type AB = Autodiff<NdArray>;
        let device = Default::default();

        let output = rasterize_autodiff(input::<AB>(0x4, &device), &options()).unwrap();
        assert!(output.means_2d_grad_abs_ref.is_none());

        let target = rasterize(input::<NdArray>(0x4, &device), &options()).unwrap();
        assert_eq!(
            output.colors.inner().into_host("colors").unwrap(),
            target.colors.into_host("colors").unwrap()
        );
    }
}
