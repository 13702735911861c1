//! Image options: formats, resampling, color modes

use image::{DynamicImage, GrayImage, Rgb, RgbImage, Rgba, RgbaImage};
use std::fmt;

use crate::error::{Error, Result};

/// Encoded tile format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TileFormat {
    Png,
    Jpeg,
}

impl TileFormat {
    /// File extension without dot
    pub fn ext(&self) -> &'static str {
        match self {
            TileFormat::Png => "png",
            TileFormat::Jpeg => "jpeg",
        }
    }

    /// MIME type
    pub fn mime_type(&self) -> &'static str {
        match self {
            TileFormat::Png => "image/png",
            TileFormat::Jpeg => "image/jpeg",
        }
    }

    /// Parse from a file extension or MIME type
    pub fn from_ext(ext: &str) -> Result<Self> {
        let ext = ext.strip_prefix("image/").unwrap_or(ext);
        match ext {
            "png" => Ok(TileFormat::Png),
            "jpeg" | "jpg" => Ok(TileFormat::Jpeg),
            other => Err(Error::UnsupportedFormat(other.to_string())),
        }
    }

    /// Detect the format from magic bytes
    pub fn from_magic(data: &[u8]) -> Option<Self> {
        if data.starts_with(&[0x89, b'P', b'N', b'G']) {
            Some(TileFormat::Png)
        } else if data.starts_with(&[0xff, 0xd8]) {
            Some(TileFormat::Jpeg)
        } else {
            None
        }
    }

    pub(crate) fn codec(&self) -> image::ImageFormat {
        match self {
            TileFormat::Png => image::ImageFormat::Png,
            TileFormat::Jpeg => image::ImageFormat::Jpeg,
        }
    }
}

impl fmt::Display for TileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.ext())
    }
}

/// Resampling method for rescaling
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resampling {
    Nearest,
    Bilinear,
    Bicubic,
}

impl Resampling {
    pub(crate) fn filter(&self) -> image::imageops::FilterType {
        match self {
            Resampling::Nearest => image::imageops::FilterType::Nearest,
            Resampling::Bilinear => image::imageops::FilterType::Triangle,
            Resampling::Bicubic => image::imageops::FilterType::CatmullRom,
        }
    }
}

/// Color mode of produced images
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ColorMode {
    /// Single-band grayscale
    L,
    Rgb,
    Rgba,
}

impl ColorMode {
    /// Number of bands
    pub fn bands(&self) -> usize {
        match self {
            ColorMode::L => 1,
            ColorMode::Rgb => 3,
            ColorMode::Rgba => 4,
        }
    }
}

/// Options describing how tile images are produced and encoded
#[derive(Debug, Clone)]
pub struct ImageOptions {
    /// Produce transparent images
    pub transparent: bool,
    /// Opacity applied when this image is merged over others
    pub opacity: Option<f32>,
    /// Resampling method for rescaling
    pub resampling: Resampling,
    /// Encoded format
    pub format: TileFormat,
    /// Background color (RGB)
    pub bgcolor: [u8; 3],
    /// Color mode; derived from `transparent` when unset
    pub mode: Option<ColorMode>,
}

impl Default for ImageOptions {
    fn default() -> Self {
        Self {
            transparent: false,
            opacity: None,
            resampling: Resampling::Bicubic,
            format: TileFormat::Png,
            bgcolor: [255, 255, 255],
            mode: None,
        }
    }
}

impl ImageOptions {
    /// Transparent PNG options
    pub fn transparent_png() -> Self {
        Self {
            transparent: true,
            ..Default::default()
        }
    }

    /// The effective color mode
    pub fn color_mode(&self) -> ColorMode {
        self.mode.unwrap_or(if self.transparent {
            ColorMode::Rgba
        } else {
            ColorMode::Rgb
        })
    }
}

/// Create a new image compatible with `opts`: mode, transparency and
/// background color are honored.
pub fn create_image(size: (u32, u32), opts: &ImageOptions) -> DynamicImage {
    let [r, g, b] = opts.bgcolor;
    match opts.color_mode() {
        ColorMode::L => {
            let l = ((r as u32 + g as u32 + b as u32) / 3) as u8;
            DynamicImage::ImageLuma8(GrayImage::from_pixel(size.0, size.1, image::Luma([l])))
        }
        ColorMode::Rgb => {
            DynamicImage::ImageRgb8(RgbImage::from_pixel(size.0, size.1, Rgb([r, g, b])))
        }
        ColorMode::Rgba => {
            let a = if opts.transparent { 0 } else { 255 };
            DynamicImage::ImageRgba8(RgbaImage::from_pixel(size.0, size.1, Rgba([r, g, b, a])))
        }
    }
}
