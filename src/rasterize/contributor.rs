pub use super::*;

use std::ops::Range;

/// An active pair of a primitive and a pixel.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Contributor {
    /// `image * I_y * I_x + y * I_x + x`
    pub pixel_id: u64,
    /// The value of `flatten_ids` at the step.
    pub primitive_id: u32,
}

/// Extracting the contributors of every pixel within the step window.
///
/// `window` is clamped to each tile's range, and `alpha(tile, pixel, id)`
/// returns the alpha of a step that passes the skip predicate.
/// The walk of each pixel starts from its entry in `transmittances`.
pub(crate) fn extract<A>(
    grid: &TileGrid,
    intersections: &TileIntersections,
    transmittances: &[f32],
    window: Range<u32>,
    thresholds: &Thresholds,
    alpha: A,
) -> Compaction<Contributor>
where
    A: Fn(&Tile, Pixel, u32) -> Option<f32> + Sync,
{
    if intersections.is_empty() {
        return Compaction {
            counts: vec![0; grid.pixel_count()],
            offsets: vec![0; grid.pixel_count()],
            items: vec![],
        };
    }

    let image_size_x = grid.image_size_x.max(1) as usize;
    let pixel_count_per_image = grid.pixel_count_per_image().max(1);

    compact(grid.pixel_count(), |key, emit| {
        let image = (key / pixel_count_per_image) as u32;
        let local = key % pixel_count_per_image;
        let pixel = Pixel {
            x: (local % image_size_x) as u32,
            y: (local / image_size_x) as u32,
        };
        let tile = grid.tile(
            image as usize * grid.tile_count_per_image()
                + (pixel.y / grid.tile_size) as usize
                    * grid.tile_count_x as usize
                + (pixel.x / grid.tile_size) as usize,
        );

        let range = intersections.range(tile.index);
        let start = (range.start + window.start as usize).min(range.end);
        let end = (range.start + window.end as usize).min(range.end);

        let mut transmittance = transmittances[key];
        for index in start..end {
            let id = intersections.flatten_ids[index];
            let Some(alpha) = alpha(&tile, pixel, id) else {
                continue;
            };

            let transmittance_next = transmittance * (1.0 - alpha);
            if transmittance_next <= thresholds.transmittance_min {
                break;
            }

            emit(Contributor {
                pixel_id: key as u64,
                primitive_id: id,
            });
            transmittance = transmittance_next;
        }
    })
}

/// Checking the iteration window.
pub(crate) fn validate_window(
    range_start: u32,
    range_end: u32,
) -> Result<Range<u32>, Error> {
    if range_start > range_end {
        return Err(Error::InvalidWindow(range_start, range_end));
    }
    Ok(range_start..range_end)
}

#[cfg(test)]
mod tests {
    #[test]
    fn extract_by_window() {
        use super::*;

        let grid = TileGrid::new(1, 2, 1, 2).unwrap();
        let offsets = [0];
        let flatten_ids = [3, 1, 4, 1, 5];
        let intersections = TileIntersections::new(&offsets, &flatten_ids);
        let thresholds = Thresholds::default();
        // The second pixel skips the primitive 4
        let alpha = |_: &Tile, pixel: Pixel, id: u32| {
            (pixel.x == 0 || id != 4).then_some(0.5)
        };

        let output = extract(
            &grid,
            &intersections,
            &[1.0, 1.0],
            1..4,
            &thresholds,
            alpha,
        );
        let pairs = output
            .items
            .iter()
            .map(|c| (c.pixel_id, c.primitive_id))
            .collect::<Vec<_>>();

        assert_eq!(output.counts, vec![3, 2]);
        assert_eq!(pairs, vec![(0, 1), (0, 4), (0, 1), (1, 1), (1, 1)]);

        let output = extract(
            &grid,
            &intersections,
            &[1.0, 1.0],
            4..16,
            &thresholds,
            alpha,
        );
        assert_eq!(output.counts, vec![1, 1]);
    }

    #[test]
    fn extract_until_cutoff() {
        use super::*;

        let grid = TileGrid::new(1, 1, 1, 16).unwrap();
        let offsets = [0];
        let flatten_ids = [0; 8];
        let intersections = TileIntersections::new(&offsets, &flatten_ids);

        // Only three halvings of 2^-10 stay above 1e-4
        let output = extract(
            &grid,
            &intersections,
            &[2.0_f32.powi(-10)],
            0..8,
            &Thresholds::default(),
            |_, _, _| Some(0.5),
        );

        assert_eq!(output.counts, vec![3]);
    }

    #[test]
    fn extract_nothing() {
        use super::*;

        let grid = TileGrid::new(2, 3, 3, 16).unwrap();
        let offsets = [0, 0];
        let intersections = TileIntersections::new(&offsets, &[]);

        let output = extract(
            &grid,
            &intersections,
            &[1.0; 18],
            0..4,
            &Thresholds::default(),
            |_, _, _| unreachable!(),
        );

        assert!(output.items.is_empty());
        assert_eq!(output.counts.len(), 18);
        assert!(matches!(
            validate_window(3, 2),
            Err(Error::InvalidWindow(3, 2))
        ));
    }
}
