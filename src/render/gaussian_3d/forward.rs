pub use super::*;

/// The host buffers read from a [`RasterizeInput`].
#[derive(Clone, Debug)]
pub struct HostInput {
    pub arguments: host::Arguments,
    /// `[I, C]`
    pub backgrounds: Option<Vec<f32>>,
    /// `[P, C]`
    pub colors: Vec<f32>,
    /// `[P, 3]`
    pub conics: Vec<f32>,
    /// `[N]`
    pub flatten_ids: Vec<u32>,
    /// `[I, T_y, T_x]`
    pub masks: Option<Vec<bool>>,
    /// `[P, 2]`
    pub means_2d: Vec<f32>,
    /// `[I, T_y, T_x]`
    pub offsets: Vec<u32>,
    /// `[P]`
    pub opacities: Vec<f32>,
}

impl HostInput {
    /// Reading the tensors and checking their shapes.
    pub fn read<B: Backend>(
        input: RasterizeInput<B>,
        options: &RasterizeOptions,
    ) -> Result<Self, Error> {
        // Specifying the parameters

        let [point_count, channel_count] = input.colors.dims();
        let [image_count, ..] = input.tile_offsets.dims();
        let arguments = host::Arguments {
            image_count: image_count as u32,
            image_size_x: options.image_width,
            image_size_y: options.image_height,
            tile_size: options.tile_size,
            channel_count: channel_count as u32,
        };
        let grid = arguments.grid()?;
        let tile_dims = [
            image_count,
            grid.tile_count_y as usize,
            grid.tile_count_x as usize,
        ];

        #[cfg(debug_assertions)]
        log::debug!(
            target: "gausplat::rasterizer::render",
            "read > ({point_count} points, {channel_count} channels)",
        );

        // Reading the tensors

        Ok(Self {
            arguments,
            backgrounds: input
                .backgrounds
                .map(|backgrounds| {
                    backgrounds
                        .into_host_with_dims("backgrounds", [image_count, channel_count])
                })
                .transpose()?,
            colors: input.colors.into_host("colors")?,
            conics: input
                .conics
                .into_host_with_dims("conics", [point_count, 3])?,
            flatten_ids: input.flatten_ids.into_host("flatten_ids")?,
            masks: input
                .masks
                .map(|masks| masks.into_host_with_dims("masks", tile_dims))
                .transpose()?,
            means_2d: input
                .means_2d
                .into_host_with_dims("means_2d", [point_count, 2])?,
            offsets: input
                .tile_offsets
                .into_host_with_dims("tile_offsets", tile_dims)?,
            opacities: input
                .opacities
                .into_host_with_dims("opacities", [point_count])?,
        })
    }

    pub fn inputs(&self) -> host::Inputs<'_> {
        host::Inputs {
            splats: host::Splats {
                conics: &self.conics,
                means_2d: &self.means_2d,
                opacities: &self.opacities,
            },
            colors: &self.colors,
            backgrounds: self.backgrounds.as_deref(),
            masks: self.masks.as_deref(),
            intersections: TileIntersections::new(&self.offsets, &self.flatten_ids),
        }
    }

    /// `[I, I_y, I_x]`
    #[inline]
    pub fn image_dims(&self) -> [usize; 3] {
        [
            self.arguments.image_count as usize,
            self.arguments.image_size_y as usize,
            self.arguments.image_size_x as usize,
        ]
    }

    /// `P`
    #[inline]
    pub fn point_count(&self) -> usize {
        self.opacities.len()
    }

    /// `C`
    #[inline]
    pub fn channel_count(&self) -> usize {
        self.arguments.channel_count as usize
    }
}

/// Interleaving the colors and the alphas into `[I, I_y, I_x, C + 1]`.
pub fn colors_with_alphas(
    outputs: &host::Outputs,
    channel_count: usize,
) -> Vec<f32> {
    outputs
        .colors
        .chunks_exact(channel_count)
        .zip(&outputs.alphas)
        .flat_map(|(color, &alpha)| color.iter().copied().chain([alpha]))
        .collect()
}
