//! Lazy byte/image payload carrier

use std::io::Cursor;
use std::sync::Arc;

use bytes::Bytes;
use image::{DynamicImage, GenericImageView};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::Result;
use crate::opts::{create_image, ImageOptions, TileFormat};

enum State {
    Encoded(Bytes),
    Decoded(Arc<DynamicImage>),
    Both(Bytes, Arc<DynamicImage>),
}

struct Inner {
    format: TileFormat,
    state: Mutex<State>,
}

/// A raster payload that converts lazily between encoded bytes and a
/// decoded image, memoizing both representations.
///
/// Cloning is cheap; all clones share the same memoized state.
#[derive(Clone)]
pub struct ImageSource {
    inner: Arc<Inner>,
}

impl ImageSource {
    /// Payload from encoded bytes in `format`
    pub fn from_bytes(data: impl Into<Bytes>, format: TileFormat) -> Self {
        Self {
            inner: Arc::new(Inner {
                format,
                state: Mutex::new(State::Encoded(data.into())),
            }),
        }
    }

    /// Payload from a decoded image; `format` is used when encoding
    pub fn from_image(img: DynamicImage, format: TileFormat) -> Self {
        Self {
            inner: Arc::new(Inner {
                format,
                state: Mutex::new(State::Decoded(Arc::new(img))),
            }),
        }
    }

    /// A blank (background-colored or transparent) payload
    pub fn blank(size: (u32, u32), opts: &ImageOptions) -> Self {
        Self::from_image(create_image(size, opts), opts.format)
    }

    /// Format of the encoded representation
    pub fn format(&self) -> TileFormat {
        self.inner.format
    }

    /// True if both handles share the same underlying payload
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Decoded image, decoding the stored bytes on first access
    pub fn as_image(&self) -> Result<Arc<DynamicImage>> {
        let mut state = self.inner.state.lock();
        if let State::Decoded(img) | State::Both(_, img) = &*state {
            return Ok(img.clone());
        }
        let buf = match &*state {
            State::Encoded(buf) => buf.clone(),
            _ => unreachable!(),
        };
        debug!(format = %self.inner.format, "decoding tile payload");
        let img = Arc::new(image::load_from_memory_with_format(
            &buf,
            self.inner.format.codec(),
        )?);
        *state = State::Both(buf, img.clone());
        Ok(img)
    }

    /// Encoded bytes, encoding the image on first access.
    ///
    /// Stored bytes are reused when `format` matches; requesting a
    /// different format re-encodes from the decoded image.
    pub fn as_bytes(&self, format: Option<TileFormat>) -> Result<Bytes> {
        let format = format.unwrap_or(self.inner.format);
        {
            let state = self.inner.state.lock();
            if format == self.inner.format {
                if let State::Encoded(buf) | State::Both(buf, _) = &*state {
                    return Ok(buf.clone());
                }
            }
        }
        let img = self.as_image()?;
        debug!(%format, "encoding tile payload");
        let buf = encode(&img, format)?;
        if format == self.inner.format {
            *self.inner.state.lock() = State::Both(buf.clone(), img);
        }
        Ok(buf)
    }

    /// Byte length of the encoded representation, if already available
    pub fn encoded_len(&self) -> Option<usize> {
        match &*self.inner.state.lock() {
            State::Encoded(buf) | State::Both(buf, _) => Some(buf.len()),
            State::Decoded(_) => None,
        }
    }

    /// Pixel dimensions of the image
    pub fn size(&self) -> Result<(u32, u32)> {
        let img = self.as_image()?;
        Ok((img.width(), img.height()))
    }
}

impl std::fmt::Debug for ImageSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &*self.inner.state.lock() {
            State::Encoded(buf) => format!("encoded({} bytes)", buf.len()),
            State::Decoded(img) => format!("decoded({}x{})", img.width(), img.height()),
            State::Both(buf, _) => format!("both({} bytes)", buf.len()),
        };
        write!(f, "ImageSource({}, {})", self.inner.format, state)
    }
}

fn encode(img: &DynamicImage, format: TileFormat) -> Result<Bytes> {
    let mut buf = Cursor::new(Vec::new());
    match format {
        TileFormat::Jpeg => {
            // JPEG has no alpha channel
            DynamicImage::ImageRgb8(img.to_rgb8()).write_to(&mut buf, format.codec())?
        }
        TileFormat::Png => img.write_to(&mut buf, format.codec())?,
    }
    Ok(Bytes::from(buf.into_inner()))
}

/// Color of an image that contains exactly one color
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolidColor {
    Rgb([u8; 3]),
    Rgba([u8; 4]),
}

impl SolidColor {
    /// Lowercase hex representation, `rrggbb` or `rrggbbaa`
    pub fn hex(&self) -> String {
        match self {
            SolidColor::Rgb([r, g, b]) => format!("{r:02x}{g:02x}{b:02x}"),
            SolidColor::Rgba([r, g, b, a]) => format!("{r:02x}{g:02x}{b:02x}{a:02x}"),
        }
    }
}

/// Returns the single color of `img` iff every pixel has the same value,
/// `None` otherwise. Images with an alpha channel yield an RGBA color.
pub fn single_color(img: &DynamicImage) -> Option<SolidColor> {
    match img {
        DynamicImage::ImageRgba8(buf) => {
            let mut pixels = buf.pixels();
            let first = pixels.next()?;
            pixels.all(|p| p == first).then_some(SolidColor::Rgba(first.0))
        }
        DynamicImage::ImageLumaA8(_) => {
            let buf = img.to_rgba8();
            let mut pixels = buf.pixels();
            let first = *pixels.next()?;
            pixels.all(|p| *p == first).then_some(SolidColor::Rgba(first.0))
        }
        _ => {
            let buf = img.to_rgb8();
            let mut pixels = buf.pixels();
            let first = *pixels.next()?;
            pixels.all(|p| *p == first).then_some(SolidColor::Rgb(first.0))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage, Rgba, RgbaImage};

    fn red_image(w: u32, h: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(w, h, Rgb([255, 0, 0])))
    }

    #[test]
    fn test_bytes_image_roundtrip() {
        let source = ImageSource::from_image(red_image(8, 8), TileFormat::Png);
        let bytes = source.as_bytes(None).unwrap();
        assert!(bytes.starts_with(b"\x89PNG"));

        let reloaded = ImageSource::from_bytes(bytes.clone(), TileFormat::Png);
        let img = reloaded.as_image().unwrap();
        assert_eq!(img.to_rgb8().get_pixel(3, 3), &Rgb([255, 0, 0]));

        // memoized bytes are returned as-is
        assert_eq!(reloaded.as_bytes(None).unwrap(), bytes);
    }

    #[test]
    fn test_reencode_to_jpeg() {
        let source = ImageSource::from_image(red_image(8, 8), TileFormat::Png);
        let jpeg = source.as_bytes(Some(TileFormat::Jpeg)).unwrap();
        assert!(jpeg.starts_with(&[0xff, 0xd8]));
    }

    #[test]
    fn test_blank_is_transparent() {
        let source = ImageSource::blank((4, 4), &ImageOptions::transparent_png());
        let img = source.as_image().unwrap();
        assert_eq!(img.to_rgba8().get_pixel(0, 0).0[3], 0);
    }

    #[test]
    fn test_single_color() {
        assert_eq!(
            single_color(&red_image(4, 4)),
            Some(SolidColor::Rgb([255, 0, 0]))
        );

        let rgba = DynamicImage::ImageRgba8(RgbaImage::from_pixel(
            4,
            4,
            Rgba([255, 1, 5, 255]),
        ));
        let color = single_color(&rgba).unwrap();
        assert_eq!(color, SolidColor::Rgba([255, 1, 5, 255]));
        assert_eq!(color.hex(), "ff0105ff");

        let mut mixed = RgbImage::from_pixel(4, 4, Rgb([255, 0, 0]));
        mixed.put_pixel(1, 1, Rgb([0, 255, 0]));
        assert_eq!(single_color(&DynamicImage::ImageRgb8(mixed)), None);
    }
}
