//! Layer and band merging

use image::{DynamicImage, GrayImage, RgbImage, Rgba, RgbaImage};
use tilekeep_grid::{BBox, Coverage, Srs};

use crate::error::{Error, Result};
use crate::mask::mask_image_in_place;
use crate::opts::{ColorMode, ImageOptions};
use crate::source::ImageSource;

/// One input of a [`LayerMerger`]
#[derive(Debug, Clone)]
pub struct MergeLayer {
    /// The layer image
    pub source: ImageSource,
    /// Opacity in `[0, 1]`; `None` means opaque
    pub opacity: Option<f32>,
    /// Clip coverage applied to this layer before compositing
    pub coverage: Option<Coverage>,
}

impl From<ImageSource> for MergeLayer {
    fn from(source: ImageSource) -> Self {
        Self {
            source,
            opacity: None,
            coverage: None,
        }
    }
}

/// Merges full-image layers bottom-to-top with per-pixel alpha
/// compositing and per-layer opacity.
#[derive(Debug, Default)]
pub struct LayerMerger {
    layers: Vec<MergeLayer>,
}

impl LayerMerger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one layer image to merge, bottom layers first
    pub fn add(&mut self, source: ImageSource) {
        self.layers.push(source.into());
    }

    /// Add a layer with opacity or clip coverage
    pub fn add_layer(&mut self, layer: MergeLayer) {
        self.layers.push(layer);
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Merge all layers into one image.
    ///
    /// `bbox` locates the image in map space and is only required when a
    /// layer carries a clip coverage.
    pub fn merge(
        &self,
        opts: &ImageOptions,
        size: Option<(u32, u32)>,
        bbox: Option<(&BBox, Srs)>,
    ) -> Result<ImageSource> {
        let size = match size {
            Some(size) => size,
            None => match self.layers.first() {
                Some(layer) => layer.source.size()?,
                None => (256, 256),
            },
        };
        if self.layers.is_empty() {
            return Ok(ImageSource::blank(size, opts));
        }

        let [r, g, b] = opts.bgcolor;
        let bg_alpha = if opts.transparent { 0 } else { 255 };
        let mut result = RgbaImage::from_pixel(size.0, size.1, Rgba([r, g, b, bg_alpha]));

        for layer in &self.layers {
            let mut img = layer.source.as_image()?.to_rgba8();

            if let Some(opacity) = layer.opacity {
                if opacity < 1.0 {
                    fade_alpha(&mut img, opacity.clamp(0.0, 1.0));
                }
            }

            if let Some(coverage) = &layer.coverage {
                if coverage.clip() {
                    if let Some((bbox, srs)) = bbox {
                        mask_image_in_place(&mut img, bbox, srs, coverage)?;
                    }
                }
            }

            composite_over(&mut result, &img);
        }

        Ok(finish(result, opts))
    }
}

/// Multiply the alpha channel with `opacity`
fn fade_alpha(img: &mut RgbaImage, opacity: f32) {
    for pixel in img.pixels_mut() {
        pixel.0[3] = (pixel.0[3] as f32 * opacity).round() as u8;
    }
}

/// Standard "over" compositing of `src` onto `dst`
fn composite_over(dst: &mut RgbaImage, src: &RgbaImage) {
    let (w, h) = (dst.width().min(src.width()), dst.height().min(src.height()));
    for y in 0..h {
        for x in 0..w {
            let s = src.get_pixel(x, y).0;
            let sa = s[3] as u32;
            if sa == 255 {
                dst.put_pixel(x, y, Rgba(s));
                continue;
            }
            if sa == 0 {
                continue;
            }
            let d = dst.get_pixel_mut(x, y);
            let da = d.0[3] as u32;
            let out_a = sa + da * (255 - sa) / 255;
            if out_a == 0 {
                continue;
            }
            for i in 0..3 {
                let sc = s[i] as u32;
                let dc = d.0[i] as u32;
                d.0[i] = ((sc * sa + dc * da * (255 - sa) / 255) / out_a) as u8;
            }
            d.0[3] = out_a as u8;
        }
    }
}

fn finish(result: RgbaImage, opts: &ImageOptions) -> ImageSource {
    let img = match opts.color_mode() {
        ColorMode::Rgba => DynamicImage::ImageRgba8(result),
        ColorMode::Rgb => DynamicImage::ImageRgb8(DynamicImage::ImageRgba8(result).to_rgb8()),
        ColorMode::L => DynamicImage::ImageLuma8(DynamicImage::ImageRgba8(result).to_luma8()),
    };
    ImageSource::from_image(img, opts.format)
}

/// Merge multiple images into one, bottom image first
pub fn merge_images(
    images: &[ImageSource],
    opts: &ImageOptions,
    size: Option<(u32, u32)>,
) -> Result<ImageSource> {
    let mut merger = LayerMerger::new();
    for img in images {
        merger.add(img.clone());
    }
    merger.merge(opts, size, None)
}

/// One band extraction step of a [`BandMerger`]
#[derive(Debug, Clone, Copy)]
pub struct BandOp {
    /// Destination band index
    pub dst_band: usize,
    /// Index into the source image list
    pub src_img: usize,
    /// Band index within the source image
    pub src_band: usize,
    /// Weight applied to the band values
    pub factor: f32,
}

/// Composes a destination image from selected bands of multiple source
/// images with per-band weighting.
#[derive(Debug)]
pub struct BandMerger {
    mode: ColorMode,
    ops: Vec<BandOp>,
}

impl BandMerger {
    /// New merger producing images in `mode`
    pub fn new(mode: ColorMode) -> Self {
        Self {
            mode,
            ops: Vec::new(),
        }
    }

    /// Register one band extraction; ops accumulate into the destination
    /// band with saturating addition.
    pub fn add_op(
        &mut self,
        dst_band: usize,
        src_img: usize,
        src_band: usize,
        factor: f32,
    ) -> Result<()> {
        if dst_band >= self.mode.bands() {
            return Err(Error::BandMapping(format!(
                "destination band {} out of range for {:?}",
                dst_band, self.mode
            )));
        }
        if src_band >= 4 {
            return Err(Error::BandMapping(format!(
                "source band {} out of range",
                src_band
            )));
        }
        self.ops.push(BandOp {
            dst_band,
            src_img,
            src_band,
            factor,
        });
        Ok(())
    }

    /// Number of source images the configured ops require
    pub fn required_sources(&self) -> usize {
        self.ops.iter().map(|op| op.src_img + 1).max().unwrap_or(0)
    }

    /// Merge the bands of `sources` into one image
    pub fn merge(
        &self,
        sources: &[ImageSource],
        opts: &ImageOptions,
        size: Option<(u32, u32)>,
    ) -> Result<ImageSource> {
        let size = match size {
            Some(size) => size,
            None => match sources.first() {
                Some(source) => source.size()?,
                None => (256, 256),
            },
        };
        if sources.len() < self.required_sources() {
            return Ok(ImageSource::blank(size, opts));
        }

        // split the referenced sources into band planes
        let mut src_planes: Vec<Option<[Vec<u8>; 4]>> = vec![None; sources.len()];
        for op in &self.ops {
            if src_planes[op.src_img].is_none() {
                let rgba = sources[op.src_img].as_image()?.to_rgba8();
                src_planes[op.src_img] = Some(split_bands(&rgba));
            }
        }

        let n = (size.0 * size.1) as usize;
        let mut result: Vec<Option<Vec<u8>>> = vec![None; self.mode.bands()];

        for op in &self.ops {
            let planes = src_planes[op.src_img].as_ref().expect("plane loaded above");
            let mut chan = planes[op.src_band].clone();
            chan.resize(n, 0);
            if op.factor != 1.0 {
                for v in chan.iter_mut() {
                    *v = (*v as f32 * op.factor).clamp(0.0, 255.0) as u8;
                }
            }
            match &mut result[op.dst_band] {
                Some(dst) => {
                    for (d, s) in dst.iter_mut().zip(chan) {
                        *d = d.saturating_add(s);
                    }
                }
                slot => *slot = Some(chan),
            }
        }

        let bands: Vec<Vec<u8>> = result
            .into_iter()
            .enumerate()
            .map(|(i, band)| {
                band.unwrap_or_else(|| {
                    // unreferenced alpha defaults to opaque
                    let fill = if self.mode == ColorMode::Rgba && i == 3 { 255 } else { 0 };
                    vec![fill; n]
                })
            })
            .collect();

        let img = assemble(self.mode, size, &bands);
        Ok(ImageSource::from_image(img, opts.format))
    }
}

fn split_bands(img: &RgbaImage) -> [Vec<u8>; 4] {
    let n = (img.width() * img.height()) as usize;
    let mut bands = [
        Vec::with_capacity(n),
        Vec::with_capacity(n),
        Vec::with_capacity(n),
        Vec::with_capacity(n),
    ];
    for pixel in img.pixels() {
        for (band, v) in bands.iter_mut().zip(pixel.0) {
            band.push(v);
        }
    }
    bands
}

fn assemble(mode: ColorMode, size: (u32, u32), bands: &[Vec<u8>]) -> DynamicImage {
    let n = (size.0 * size.1) as usize;
    let mut raw = Vec::with_capacity(n * mode.bands());
    for i in 0..n {
        for band in bands {
            raw.push(band[i]);
        }
    }
    match mode {
        ColorMode::L => {
            DynamicImage::ImageLuma8(GrayImage::from_raw(size.0, size.1, raw).expect("raw size"))
        }
        ColorMode::Rgb => {
            DynamicImage::ImageRgb8(RgbImage::from_raw(size.0, size.1, raw).expect("raw size"))
        }
        ColorMode::Rgba => {
            DynamicImage::ImageRgba8(RgbaImage::from_raw(size.0, size.1, raw).expect("raw size"))
        }
    }
}
