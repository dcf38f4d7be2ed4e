//! ## Usage
//!
//! To run the benchmarks, execute the following command in the console:
//!
//! ```sh
//! cargo bench --bench rasterize
//! ```

use divan::Bencher;
use gausplat_rasterizer::rasterize::{
    gaussian_3d::{self, Arguments, BackwardState, Inputs, OutputGrads, Splats},
    scan_add_exclusive, TileIntersections,
};

fn main() {
    divan::main();
}

#[divan::bench(sample_count = 20, sample_size = 1)]
fn forward(bencher: Bencher) {
    let scene = data::Scene::random();

    bencher.bench_local(|| {
        gaussian_3d::forward(&data::ARGUMENTS, &scene.inputs())
    });
}

#[divan::bench(sample_count = 20, sample_size = 1)]
fn backward(bencher: Bencher) {
    let scene = data::Scene::random();
    let outputs = gaussian_3d::forward(&data::ARGUMENTS, &scene.inputs())
        .expect("forward");
    let colors_grad = vec![1.0; outputs.colors.len()];
    let alphas_grad = vec![1.0; outputs.alphas.len()];

    bencher.bench_local(|| {
        gaussian_3d::backward(
            &data::ARGUMENTS,
            &scene.inputs(),
            &BackwardState {
                alphas: &outputs.alphas,
                last_ids: &outputs.last_ids,
            },
            &OutputGrads {
                colors: &colors_grad,
                alphas: &alphas_grad,
            },
            true,
        )
    });
}

#[divan::bench(sample_count = 20, sample_size = 1)]
fn indices(bencher: Bencher) {
    let scene = data::Scene::random();
    let grid = data::ARGUMENTS.grid().expect("grid");
    let transmittances = vec![1.0; grid.pixel_count()];

    bencher.bench_local(|| {
        gaussian_3d::indices(
            &grid,
            0,
            data::POINT_COUNT as u32,
            &transmittances,
            &scene.inputs().splats,
            &scene.inputs().intersections,
        )
    });
}

#[divan::bench(sample_count = 100, sample_size = 1)]
fn scan_add(bencher: Bencher) {
    bencher
        .with_inputs(data::random_vec_u32())
        .bench_local_refs(|v| scan_add_exclusive(v));
}

mod data {
    use super::*;
    use rand::{distributions::Uniform, rngs::StdRng, Rng, SeedableRng};

    pub const ARGUMENTS: Arguments = Arguments {
        image_count: 1,
        image_size_x: 256,
        image_size_y: 256,
        tile_size: 16,
        channel_count: 3,
    };
    pub const POINT_COUNT: usize = 1 << 10;
    const SIZE: usize = 1 << 20;

    pub struct Scene {
        colors: Vec<f32>,
        conics: Vec<f32>,
        flatten_ids: Vec<u32>,
        means_2d: Vec<f32>,
        offsets: Vec<u32>,
        opacities: Vec<f32>,
    }

    impl Scene {
        /// Every splat covers its neighboring tiles.
        pub fn random() -> Self {
            let mut rng = StdRng::seed_from_u64(0);
            let size_x = ARGUMENTS.image_size_x as f32;
            let size_y = ARGUMENTS.image_size_y as f32;
            let tile_size = ARGUMENTS.tile_size;

            let means_2d = (0..POINT_COUNT)
                .flat_map(|_| {
                    [
                        rng.sample(Uniform::new(0.0, size_x)),
                        rng.sample(Uniform::new(0.0, size_y)),
                    ]
                })
                .collect::<Vec<f32>>();
            let conics = (0..POINT_COUNT)
                .flat_map(|_| {
                    let a = rng.sample(Uniform::new(2.0_f32, 8.0)).powi(-2);
                    let c = rng.sample(Uniform::new(2.0_f32, 8.0)).powi(-2);
                    [a, 0.0, c]
                })
                .collect();
            let opacities = (0..POINT_COUNT)
                .map(|_| rng.sample(Uniform::new(0.1, 0.9)))
                .collect();
            let colors = (0..POINT_COUNT * ARGUMENTS.channel_count as usize)
                .map(|_| rng.sample(Uniform::new(0.0, 1.0)))
                .collect();

            // Binning the splats by their tiles in id order

            let grid = ARGUMENTS.grid().expect("grid");
            let mut offsets = Vec::with_capacity(grid.tile_count());
            let mut flatten_ids = Vec::new();
            (0..grid.tile_count_y).for_each(|tile_y| {
                (0..grid.tile_count_x).for_each(|tile_x| {
                    offsets.push(flatten_ids.len() as u32);
                    flatten_ids.extend((0..POINT_COUNT as u32).filter(|&id| {
                        let x = means_2d[id as usize * 2] as u32 / tile_size;
                        let y = means_2d[id as usize * 2 + 1] as u32 / tile_size;
                        x.abs_diff(tile_x) <= 1 && y.abs_diff(tile_y) <= 1
                    }));
                });
            });

            Self {
                colors,
                conics,
                flatten_ids,
                means_2d,
                offsets,
                opacities,
            }
        }

        pub fn inputs(&self) -> Inputs<'_> {
            Inputs {
                splats: Splats {
                    conics: &self.conics,
                    means_2d: &self.means_2d,
                    opacities: &self.opacities,
                },
                colors: &self.colors,
                backgrounds: None,
                masks: None,
                intersections: TileIntersections::new(
                    &self.offsets,
                    &self.flatten_ids,
                ),
            }
        }
    }

    pub fn random_vec_u32() -> impl FnMut() -> Vec<u32> {
        || {
            StdRng::seed_from_u64(0)
                .sample_iter(Uniform::new_inclusive(0, 1 << 8))
                .take(SIZE)
                .collect()
        }
    }
}
