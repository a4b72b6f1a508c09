//! Framebuffer reconstruction for probes that capture a remote desktop.
//!
//! A probe feeds rectangle updates (raw or RLE-compressed, in the server's
//! declared pixel format) into a [`Canvas`]; the canvas composites them at
//! absolute coordinates and encodes the final picture once as base64 PNG.

mod canvas;
mod pixel;
mod rle;

pub use canvas::{Canvas, RectUpdate};
pub use pixel::{bytes_per_pixel, to_rgb8};
pub use rle::decompress;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FbError {
    #[error("unsupported pixel depth: {0} bpp")]
    UnsupportedDepth(u8),
    #[error("malformed compressed bitmap: {0}")]
    Corrupt(&'static str),
    #[error("png encode failed: {0}")]
    Encode(String),
}
