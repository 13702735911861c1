//! Masking images with coverage polygons

use image::{Rgba, RgbaImage};
use tilekeep_grid::{BBox, Coverage, Srs};

use crate::error::Result;
use crate::opts::ImageOptions;
use crate::source::ImageSource;

/// Mask `source` so that pixels outside `coverage` become transparent.
///
/// `bbox` is the map extent of the image in `srs`; the coverage must be in
/// the same SRS.
pub fn mask_image_source_from_coverage(
    source: &ImageSource,
    bbox: &BBox,
    srs: Srs,
    coverage: &Coverage,
    opts: &ImageOptions,
) -> Result<ImageSource> {
    let mut img = source.as_image()?.to_rgba8();
    mask_image_in_place(&mut img, bbox, srs, coverage)?;
    Ok(ImageSource::from_image(
        image::DynamicImage::ImageRgba8(img),
        opts.format,
    ))
}

/// Clear all pixels of `img` that fall outside `coverage`
pub fn mask_image_in_place(
    img: &mut RgbaImage,
    bbox: &BBox,
    srs: Srs,
    coverage: &Coverage,
) -> Result<()> {
    // fast path: fully inside or fully outside
    if coverage.contains(bbox, srs)? {
        return Ok(());
    }
    if !coverage.intersects(bbox, srs)? {
        for pixel in img.pixels_mut() {
            *pixel = Rgba([255, 255, 255, 0]);
        }
        return Ok(());
    }

    let (w, h) = (img.width(), img.height());
    let mut inside = vec![false; (w * h) as usize];
    for polygon in &coverage.geom().0 {
        let rings: Vec<&geo::LineString<f64>> = std::iter::once(polygon.exterior())
            .chain(polygon.interiors().iter())
            .collect();
        mark_polygon(&mut inside, w, h, bbox, &rings);
    }

    for (i, pixel) in img.pixels_mut().enumerate() {
        if !inside[i] {
            *pixel = Rgba([255, 255, 255, 0]);
        }
    }
    Ok(())
}

/// Scanline fill with the even-odd rule; interior rings punch holes
fn mark_polygon(
    inside: &mut [bool],
    w: u32,
    h: u32,
    bbox: &BBox,
    rings: &[&geo::LineString<f64>],
) {
    let px_w = bbox.width() / w as f64;
    let px_h = bbox.height() / h as f64;

    for row in 0..h {
        // sample at the pixel center
        let map_y = bbox.maxy - (row as f64 + 0.5) * px_h;

        let mut crossings: Vec<f64> = Vec::new();
        for ring in rings {
            let coords = &ring.0;
            for edge in coords.windows(2) {
                let (p1, p2) = (edge[0], edge[1]);
                if (p1.y > map_y) != (p2.y > map_y) {
                    let t = (map_y - p1.y) / (p2.y - p1.y);
                    crossings.push(p1.x + t * (p2.x - p1.x));
                }
            }
        }
        crossings.sort_by(|a, b| a.partial_cmp(b).expect("finite coordinates"));

        for span in crossings.chunks_exact(2) {
            let x0 = ((span[0] - bbox.minx) / px_w - 0.5).ceil().max(0.0) as u32;
            let x1 = ((span[1] - bbox.minx) / px_w - 0.5).floor().min(w as f64 - 1.0);
            if x1 < 0.0 {
                continue;
            }
            for x in x0..=x1 as u32 {
                inside[(row * w + x) as usize] = true;
            }
        }
    }
}
