pub use super::*;

use burn::backend::autodiff::NodeID;

/// What the backward node keeps from the forward pass.
#[derive(Clone, Debug)]
pub struct RasterizeBackwardState<B: Backend> {
    pub device: B::Device,
    pub input: forward::HostInput,
    /// The sizes the forward pass checked `input` with.
    pub sizes: host::CheckedSizes,
    /// `[I, I_y, I_x]`
    pub alphas: Vec<f32>,
    /// `[I, I_y, I_x]`
    pub last_ids: Vec<i32>,
    pub means_2d_grad_abs_ref_id: Option<NodeID>,
}

#[derive(Clone, Debug)]
pub struct RasterizeGrads<B: Backend> {
    /// `[P, C]`
    pub colors_grad: B::FloatTensorPrimitive,
    /// `[P, 3]`
    pub conics_grad: B::FloatTensorPrimitive,
    /// `[P, 2]`
    pub means_2d_grad: B::FloatTensorPrimitive,
    /// `[P, 2]`
    pub means_2d_grad_abs: Option<B::FloatTensorPrimitive>,
    /// `[P]`
    pub opacities_grad: B::FloatTensorPrimitive,
}

impl<B: Backend> RasterizeBackwardState<B> {
    /// Computing the gradients of the splats.
    ///
    /// `output_grad` is `[I, I_y, I_x, C + 1]`, the colors followed by the
    /// alphas, as the forward pass produced it.
    pub fn backward(
        &self,
        output_grad: Tensor<B, 4>,
    ) -> RasterizeGrads<B> {
        // Specifying the parameters

        let point_count = self.sizes.point_count;
        let channel_count = self.sizes.channel_count.get();
        let pixel_count = self.sizes.grid.pixel_count();

        // Reading the output gradients

        let mut colors_grad = Vec::with_capacity(pixel_count * channel_count);
        let mut alphas_grad = Vec::with_capacity(pixel_count);
        output_grad
            .into_data()
            .iter::<f32>()
            .enumerate()
            .for_each(|(index, grad)| {
                if index % (channel_count + 1) == channel_count {
                    alphas_grad.push(grad);
                } else {
                    colors_grad.push(grad);
                }
            });

        // Compositing the pixels backward

        let gradients = host::backward_checked(
            &self.sizes,
            &self.input.inputs(),
            &host::BackwardState {
                alphas: &self.alphas,
                last_ids: &self.last_ids,
            },
            &host::OutputGrads {
                colors: &colors_grad,
                alphas: &alphas_grad,
            },
            self.means_2d_grad_abs_ref_id.is_some(),
            &Default::default(),
        );

        // Writing the tensors

        let device = &self.device;
        let tensor = |values: Vec<f32>, dims: [usize; 2]| {
            Tensor::<B, 2>::from_host(values, dims, device)
                .into_primitive()
                .tensor()
        };

        RasterizeGrads {
            colors_grad: tensor(gradients.colors_grad, [point_count, channel_count]),
            conics_grad: tensor(gradients.conics_grad, [point_count, 3]),
            means_2d_grad: tensor(gradients.means_2d_grad, [point_count, 2]),
            means_2d_grad_abs: gradients
                .means_2d_grad_abs
                .map(|grad| tensor(grad, [point_count, 2])),
            opacities_grad: Tensor::<B, 1>::from_host(
                gradients.opacities_grad,
                [point_count],
                device,
            )
            .into_primitive()
            .tensor(),
        }
    }
}
