pub use crate::error::Error;
pub use bytemuck::{Pod, Zeroable};

use rayon::prelude::*;
use std::ops::Range;

/// The images split into square tiles of pixels.
#[repr(C)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Pod, Zeroable)]
pub struct TileGrid {
    /// `I`
    pub image_count: u32,
    /// `I_x`
    pub image_size_x: u32,
    /// `I_y`
    pub image_size_y: u32,
    /// `T`
    pub tile_size: u32,
    /// `(I_x + T - 1) / T`
    pub tile_count_x: u32,
    /// `(I_y + T - 1) / T`
    pub tile_count_y: u32,
}

/// A tile of one image.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Tile {
    pub image: u32,
    /// The index over all tiles of all images.
    pub index: usize,
    pub x_min: u32,
    /// Exclusive.
    pub x_max: u32,
    pub y_min: u32,
    /// Exclusive.
    pub y_max: u32,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Pixel {
    pub x: u32,
    pub y: u32,
}

/// The sorted primitive references of every tile.
#[derive(Clone, Copy, Debug)]
pub struct TileIntersections<'a> {
    /// `[I, T_y, T_x]`
    pub offsets: &'a [u32],
    /// `[n_isects]`
    pub flatten_ids: &'a [u32],
}

/// Per-step values gathered by one tile, keyed by intersection slot and lane.
#[derive(Clone, Debug)]
pub(crate) struct TileSlots<G> {
    pub tile: Tile,
    pub range: Range<usize>,
    pub lane_count: usize,
    /// `[range.len() * lane_count]`
    pub values: Vec<G>,
}

impl TileGrid {
    pub fn new(
        image_count: u32,
        image_size_x: u32,
        image_size_y: u32,
        tile_size: u32,
    ) -> Result<Self, Error> {
        if tile_size == 0 {
            return Err(Error::InvalidTileSize(tile_size));
        }

        Ok(Self {
            image_count,
            image_size_x,
            image_size_y,
            tile_size,
            tile_count_x: image_size_x.div_ceil(tile_size),
            tile_count_y: image_size_y.div_ceil(tile_size),
        })
    }

    /// `I * T_y * T_x`
    #[inline]
    pub fn tile_count(&self) -> usize {
        self.image_count as usize * self.tile_count_per_image()
    }

    /// `T_y * T_x`
    #[inline]
    pub fn tile_count_per_image(&self) -> usize {
        self.tile_count_x as usize * self.tile_count_y as usize
    }

    /// `I_y * I_x`
    #[inline]
    pub fn pixel_count_per_image(&self) -> usize {
        self.image_size_x as usize * self.image_size_y as usize
    }

    /// `I * I_y * I_x`
    #[inline]
    pub fn pixel_count(&self) -> usize {
        self.image_count as usize * self.pixel_count_per_image()
    }

    /// The global pixel index `image * I_y * I_x + y * I_x + x`.
    #[inline]
    pub fn pixel_index(
        &self,
        image: u32,
        pixel: Pixel,
    ) -> usize {
        image as usize * self.pixel_count_per_image()
            + pixel.y as usize * self.image_size_x as usize
            + pixel.x as usize
    }

    pub fn tile(
        &self,
        index: usize,
    ) -> Tile {
        let tile_count_x = self.tile_count_x as usize;
        let tile_count_per_image = self.tile_count_per_image();
        let image = (index / tile_count_per_image) as u32;
        let local = index % tile_count_per_image;
        let x_min = (local % tile_count_x) as u32 * self.tile_size;
        let y_min = (local / tile_count_x) as u32 * self.tile_size;

        Tile {
            image,
            index,
            x_min,
            x_max: (x_min + self.tile_size).min(self.image_size_x),
            y_min,
            y_max: (y_min + self.tile_size).min(self.image_size_y),
        }
    }

    /// Running `f` on every tile in parallel.
    ///
    /// The results are in tile order.
    pub fn map_tiles<T, F>(
        &self,
        f: F,
    ) -> Vec<T>
    where
        T: Send,
        F: Fn(Tile) -> T + Send + Sync,
    {
        (0..self.tile_count())
            .into_par_iter()
            .map(|index| f(self.tile(index)))
            .collect()
    }

    /// Running `f` on every pixel in parallel.
    ///
    /// The results are in raster order, `[I, I_y, I_x]`.
    pub fn map_pixels<T, F>(
        &self,
        f: F,
    ) -> Vec<T>
    where
        T: Send,
        F: Fn(Tile, Pixel) -> T + Send + Sync,
    {
        let mut tiles = self.map_tiles(|tile| {
            let values = tile
                .pixels()
                .map(|pixel| f(tile, pixel))
                .collect::<Vec<_>>();
            (tile, values.into_iter())
        });

        // Interleaving the tile rows into image rows

        let mut values = Vec::with_capacity(self.pixel_count());
        tiles
            .chunks_mut(self.tile_count_x.max(1) as usize)
            .for_each(|row| {
                let height = row.first().map_or(0, |(tile, _)| tile.height());
                (0..height).for_each(|_| {
                    row.iter_mut().for_each(|(tile, pixels)| {
                        values.extend(pixels.by_ref().take(tile.width()));
                    });
                });
            });

        values
    }
}

impl<G> TileSlots<G> {
    /// Visiting every slot with its primitive id and lane.
    pub fn for_each<F>(
        &self,
        flatten_ids: &[u32],
        mut f: F,
    ) where
        F: FnMut(u32, usize, &G),
    {
        let lane_count = self.lane_count.max(1);
        self.values.iter().enumerate().for_each(|(slot, value)| {
            let index = self.range.start + slot / lane_count;
            f(flatten_ids[index], slot % lane_count, value);
        });
    }
}

impl Tile {
    #[inline]
    pub fn width(&self) -> usize {
        (self.x_max - self.x_min) as usize
    }

    #[inline]
    pub fn height(&self) -> usize {
        (self.y_max - self.y_min) as usize
    }

    /// The pixels of the tile in row-major order.
    pub fn pixels(&self) -> impl Iterator<Item = Pixel> {
        let Self {
            x_min,
            x_max,
            y_min,
            y_max,
            ..
        } = *self;
        (y_min..y_max).flat_map(move |y| (x_min..x_max).map(move |x| Pixel { x, y }))
    }

    /// Returns `true` if the tile is not masked out.
    #[inline]
    pub fn is_rendered(
        &self,
        masks: Option<&[bool]>,
    ) -> bool {
        masks.map_or(true, |masks| masks[self.index])
    }
}

impl Pixel {
    /// The pixel center.
    #[inline]
    pub fn center(&self) -> [f32; 2] {
        [self.x as f32 + 0.5, self.y as f32 + 0.5]
    }
}

impl<'a> TileIntersections<'a> {
    pub const fn new(
        offsets: &'a [u32],
        flatten_ids: &'a [u32],
    ) -> Self {
        Self {
            offsets,
            flatten_ids,
        }
    }

    /// `n_isects`
    #[inline]
    pub fn len(&self) -> usize {
        self.flatten_ids.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.flatten_ids.is_empty()
    }

    /// The intersection range of the tile.
    #[inline]
    pub fn range(
        &self,
        tile: usize,
    ) -> Range<usize> {
        let start = self.offsets[tile] as usize;
        let end = self
            .offsets
            .get(tile + 1)
            .map_or(self.len(), |&offset| offset as usize);
        start..end
    }

    /// Checking the offsets and ids against the grid and the primitive count.
    pub fn validate(
        &self,
        grid: &TileGrid,
        primitive_count: usize,
    ) -> Result<(), Error> {
        crate::error::ensure_len(
            "tile_offsets",
            self.offsets.len(),
            grid.tile_count(),
        )?;

        let intersection_count = self.len();
        if let Some(offset) =
            self.offsets.iter().find(|&&o| o as usize > intersection_count)
        {
            return Err(Error::InvalidIntersections(format!(
                "offset {offset} exceeds the intersection count {intersection_count}"
            )));
        }
        if let Some(tile) =
            self.offsets.windows(2).position(|pair| pair[0] > pair[1])
        {
            return Err(Error::InvalidIntersections(format!(
                "offsets decrease at tile {tile}"
            )));
        }
        if let Some(id) = self
            .flatten_ids
            .iter()
            .find(|&&id| id as usize >= primitive_count)
        {
            return Err(Error::InvalidIntersections(format!(
                "id {id} exceeds the primitive count {primitive_count}"
            )));
        }

        Ok(())
    }
}

/// Building intersections that assign every listed primitive to every tile
/// of its image, in the given order.
#[cfg(test)]
pub(crate) fn intersect_all(
    grid: &TileGrid,
    ids_per_image: &[Vec<u32>],
) -> (Vec<u32>, Vec<u32>) {
    let mut offsets = Vec::with_capacity(grid.tile_count());
    let mut flatten_ids = Vec::new();
    ids_per_image.iter().for_each(|ids| {
        (0..grid.tile_count_per_image()).for_each(|_| {
            offsets.push(flatten_ids.len() as u32);
            flatten_ids.extend_from_slice(ids);
        });
    });
    (offsets, flatten_ids)
}
