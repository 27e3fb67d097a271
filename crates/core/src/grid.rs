//! Image grid composition.
//!
//! Lays out a batch of images on a near-square grid of equally sized cells
//! (sized to the largest input) and encodes the result as PNG.

use std::io::Cursor;

use image::{imageops, DynamicImage, ImageFormat, RgbaImage};

use crate::error::CoreError;

/// Columns and rows for `count` cells: `ceil(sqrt(n))` columns.
pub fn grid_dimensions(count: usize) -> (u32, u32) {
    if count == 0 {
        return (0, 0);
    }
    let columns = (count as f64).sqrt().ceil() as usize;
    let rows = count.div_ceil(columns);
    (columns as u32, rows as u32)
}

/// Compose `images` into a single grid image.
///
/// Images are placed left-to-right, top-to-bottom, each anchored at the top
/// left of its cell. Unused cells stay transparent.
pub fn compose_grid(images: &[DynamicImage]) -> Result<RgbaImage, CoreError> {
    if images.is_empty() {
        return Err(CoreError::Validation(
            "Cannot compose a grid from zero images".into(),
        ));
    }

    let cell_width = images.iter().map(|i| i.width()).max().unwrap_or(0);
    let cell_height = images.iter().map(|i| i.height()).max().unwrap_or(0);
    let (columns, rows) = grid_dimensions(images.len());

    let mut canvas = RgbaImage::new(cell_width * columns, cell_height * rows);
    for (i, img) in images.iter().enumerate() {
        let i = i as u32;
        let x = (i % columns) * cell_width;
        let y = (i / columns) * cell_height;
        imageops::overlay(&mut canvas, &img.to_rgba8(), x as i64, y as i64);
    }
    Ok(canvas)
}

/// Decode every encoded buffer, compose them, and encode the grid as PNG.
pub fn compose_grid_png(encoded: &[Vec<u8>]) -> Result<Vec<u8>, CoreError> {
    let images = encoded
        .iter()
        .map(|bytes| image::load_from_memory(bytes))
        .collect::<Result<Vec<_>, _>>()?;

    let grid = compose_grid(&images)?;

    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgba8(grid).write_to(&mut out, ImageFormat::Png)?;
    Ok(out.into_inner())
}

#[cfg(test)]
mod tests {
    use image::Rgba;

    use super::*;

    fn solid(w: u32, h: u32, value: u8) -> DynamicImage {
        DynamicImage::ImageRgba8(RgbaImage::from_pixel(w, h, Rgba([value, value, value, 255])))
    }

    #[test]
    fn dimensions_are_near_square() {
        assert_eq!(grid_dimensions(1), (1, 1));
        assert_eq!(grid_dimensions(2), (2, 1));
        assert_eq!(grid_dimensions(3), (2, 2));
        assert_eq!(grid_dimensions(4), (2, 2));
        assert_eq!(grid_dimensions(5), (3, 2));
        assert_eq!(grid_dimensions(9), (3, 3));
        assert_eq!(grid_dimensions(10), (4, 3));
    }

    #[test]
    fn composes_in_row_major_order() {
        let grid = compose_grid(&[solid(2, 2, 10), solid(2, 2, 20), solid(2, 2, 30)]).unwrap();
        assert_eq!(grid.dimensions(), (4, 4));
        assert_eq!(grid.get_pixel(0, 0)[0], 10);
        assert_eq!(grid.get_pixel(2, 0)[0], 20);
        assert_eq!(grid.get_pixel(0, 2)[0], 30);
        // Empty fourth cell stays transparent.
        assert_eq!(grid.get_pixel(3, 3)[3], 0);
    }

    #[test]
    fn cells_fit_largest_image() {
        let grid = compose_grid(&[solid(4, 2, 1), solid(2, 6, 2)]).unwrap();
        assert_eq!(grid.dimensions(), (8, 6));
    }

    #[test]
    fn empty_input_is_rejected() {
        assert!(compose_grid(&[]).is_err());
    }

    #[test]
    fn png_round_trip() {
        let mut encoded = Vec::new();
        for v in [5, 6] {
            let mut buf = Cursor::new(Vec::new());
            solid(3, 3, v).write_to(&mut buf, ImageFormat::Png).unwrap();
            encoded.push(buf.into_inner());
        }
        let png = compose_grid_png(&encoded).unwrap();
        let decoded = image::load_from_memory(&png).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (6, 3));
    }
}
