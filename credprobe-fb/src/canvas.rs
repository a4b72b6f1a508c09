use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder};
use tracing::warn;

use crate::{pixel, rle, FbError};

/// One rectangle of RGB8 pixels destined for absolute canvas coordinates.
#[derive(Debug, Clone)]
pub struct RectUpdate {
    pub x: u16,
    pub y: u16,
    pub width: u16,
    pub height: u16,
    pub rgb: Vec<u8>,
}

/// Screen-sized RGB8 buffer that rectangles are composited onto.
///
/// Built per capture and discarded once encoded. Updates outside the canvas
/// are clipped; the canvas never grows.
pub struct Canvas {
    width: u16,
    height: u16,
    pixels: Vec<u8>,
    updates: usize,
}

impl Canvas {
    pub fn new(width: u16, height: u16) -> Self {
        Self {
            width,
            height,
            pixels: vec![0; width as usize * height as usize * 3],
            updates: 0,
        }
    }

    pub fn width(&self) -> u16 {
        self.width
    }

    pub fn height(&self) -> u16 {
        self.height
    }

    /// Number of rectangles composited so far. Zero means the encoded image
    /// would be blank and a capture should be treated as empty.
    pub fn updates_applied(&self) -> usize {
        self.updates
    }

    /// Composite a converted rectangle, clipping whatever falls outside.
    pub fn apply(&mut self, update: &RectUpdate) {
        if update.rgb.is_empty() || update.width == 0 || update.height == 0 {
            return;
        }
        let cw = self.width as usize;
        let ch = self.height as usize;
        let rw = update.width as usize;

        let x0 = update.x as usize;
        let y0 = update.y as usize;
        if x0 >= cw || y0 >= ch {
            return;
        }
        let copy_w = rw.min(cw - x0);
        let copy_h = (update.height as usize).min(ch - y0);

        for row in 0..copy_h {
            let src = row * rw * 3;
            if src + copy_w * 3 > update.rgb.len() {
                break;
            }
            let dst = ((y0 + row) * cw + x0) * 3;
            self.pixels[dst..dst + copy_w * 3].copy_from_slice(&update.rgb[src..src + copy_w * 3]);
        }
        self.updates += 1;
    }

    /// Take a raw or RLE-compressed bitmap in the server's pixel format,
    /// convert it and composite it. Empty rects and depths the converter
    /// does not know are dropped with a warning rather than failing the
    /// whole capture.
    pub fn push_bitmap(
        &mut self,
        x: u16,
        y: u16,
        width: u16,
        height: u16,
        bpp: u8,
        data: &[u8],
        compressed: bool,
    ) -> Result<(), FbError> {
        if data.is_empty() || width == 0 || height == 0 {
            return Ok(());
        }
        let raw;
        let data = if compressed {
            raw = rle::decompress(data, width as usize, height as usize, bpp)?;
            &raw[..]
        } else {
            data
        };
        let rgb = match pixel::to_rgb8(data, bpp, width as usize, height as usize) {
            Ok(rgb) => rgb,
            Err(FbError::UnsupportedDepth(d)) => {
                warn!(bpp = d, "skipping rect with unsupported pixel depth");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        self.apply(&RectUpdate {
            x,
            y,
            width,
            height,
            rgb,
        });
        Ok(())
    }

    /// Encode the whole canvas as a base64 PNG.
    pub fn to_png_base64(&self) -> Result<String, FbError> {
        let mut png = Vec::new();
        PngEncoder::new(&mut png)
            .write_image(
                &self.pixels,
                self.width as u32,
                self.height as u32,
                ExtendedColorType::Rgb8,
            )
            .map_err(|e| FbError::Encode(e.to_string()))?;
        Ok(BASE64.encode(png))
    }

    #[cfg(test)]
    fn pixel(&self, x: usize, y: usize) -> [u8; 3] {
        let i = (y * self.width as usize + x) * 3;
        [self.pixels[i], self.pixels[i + 1], self.pixels[i + 2]]
    }
}
