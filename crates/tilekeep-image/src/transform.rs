//! Same-SRS image transformation (crop and rescale)

use image::{imageops, DynamicImage, GenericImageView};
use tilekeep_grid::BBox;

use crate::error::Result;
use crate::opts::{ImageOptions, Resampling};
use crate::source::ImageSource;

/// Transforms an image from one bbox/size to another within the same SRS.
///
/// The transformation is a pixel-window crop followed by a resize; when
/// source and destination align exactly the image is passed through
/// untouched.
#[derive(Debug, Clone, Copy)]
pub struct ImageTransformer {
    resampling: Resampling,
}

impl ImageTransformer {
    pub fn new(resampling: Resampling) -> Self {
        Self { resampling }
    }

    /// Produce an image of `dst_size` pixels covering `dst_bbox` from
    /// `src_img` covering `src_bbox`.
    pub fn transform(
        &self,
        src_img: &ImageSource,
        src_bbox: &BBox,
        dst_size: (u32, u32),
        dst_bbox: &BBox,
        opts: &ImageOptions,
    ) -> Result<ImageSource> {
        let img = src_img.as_image()?;
        let src_size = (img.width(), img.height());

        if src_size == dst_size && bbox_aligned(src_bbox, dst_bbox, dst_size) {
            return Ok(src_img.clone());
        }

        // destination bbox in source pixel coordinates
        let px_w = src_bbox.width() / src_size.0 as f64;
        let px_h = src_bbox.height() / src_size.1 as f64;
        let sx0 = (dst_bbox.minx - src_bbox.minx) / px_w;
        let sy0 = (src_bbox.maxy - dst_bbox.maxy) / px_h;
        let sx1 = (dst_bbox.maxx - src_bbox.minx) / px_w;
        let sy1 = (src_bbox.maxy - dst_bbox.miny) / px_h;

        let x0 = sx0.round().clamp(0.0, src_size.0 as f64) as u32;
        let y0 = sy0.round().clamp(0.0, src_size.1 as f64) as u32;
        let x1 = sx1.round().clamp(x0 as f64, src_size.0 as f64) as u32;
        let y1 = sy1.round().clamp(y0 as f64, src_size.1 as f64) as u32;
        let (w, h) = ((x1 - x0).max(1), (y1 - y0).max(1));

        let window = img.crop_imm(x0, y0, w, h);
        let result = if (w, h) == dst_size {
            window
        } else {
            DynamicImage::ImageRgba8(imageops::resize(
                &window.to_rgba8(),
                dst_size.0,
                dst_size.1,
                self.resampling.filter(),
            ))
        };

        Ok(ImageSource::from_image(result, opts.format))
    }
}

/// True if both bboxes match within a tenth of a destination pixel
fn bbox_aligned(a: &BBox, b: &BBox, size: (u32, u32)) -> bool {
    let x_delta = b.width() / size.0 as f64 / 10.0;
    let y_delta = b.height() / size.1 as f64 / 10.0;
    a.approx_eq(b, x_delta, y_delta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opts::TileFormat;
    use image::{Rgba, RgbaImage};

    fn checker() -> ImageSource {
        // 8x8: west half red, east half blue
        let mut img = RgbaImage::from_pixel(8, 8, Rgba([255, 0, 0, 255]));
        for y in 0..8 {
            for x in 4..8 {
                img.put_pixel(x, y, Rgba([0, 0, 255, 255]));
            }
        }
        ImageSource::from_image(DynamicImage::ImageRgba8(img), TileFormat::Png)
    }

    #[test]
    fn test_passthrough() {
        let src = checker();
        let bbox = BBox::new(0.0, 0.0, 80.0, 80.0);
        let out = ImageTransformer::new(Resampling::Nearest)
            .transform(&src, &bbox, (8, 8), &bbox, &ImageOptions::default())
            .unwrap();
        assert_eq!(out.as_bytes(None).unwrap(), src.as_bytes(None).unwrap());
    }

    #[test]
    fn test_crop_half() {
        let src = checker();
        let src_bbox = BBox::new(0.0, 0.0, 80.0, 80.0);
        let dst_bbox = BBox::new(0.0, 0.0, 40.0, 80.0);
        let out = ImageTransformer::new(Resampling::Nearest)
            .transform(&src, &src_bbox, (4, 8), &dst_bbox, &ImageOptions::default())
            .unwrap();
        let img = out.as_image().unwrap().to_rgba8();
        assert_eq!(img.dimensions(), (4, 8));
        assert!(img.pixels().all(|p| p == &Rgba([255, 0, 0, 255])));
    }

    #[test]
    fn test_upscale_quarter() {
        let src = checker();
        let src_bbox = BBox::new(0.0, 0.0, 80.0, 80.0);
        // north-east quarter, upscaled to full tile size
        let dst_bbox = BBox::new(40.0, 40.0, 80.0, 80.0);
        let out = ImageTransformer::new(Resampling::Nearest)
            .transform(&src, &src_bbox, (8, 8), &dst_bbox, &ImageOptions::default())
            .unwrap();
        let img = out.as_image().unwrap().to_rgba8();
        assert_eq!(img.dimensions(), (8, 8));
        assert!(img.pixels().all(|p| p == &Rgba([0, 0, 255, 255])));
    }
}
