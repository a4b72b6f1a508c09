use crate::FbError;

/// Bytes per pixel for a declared depth, for decompressed/raw rect data.
pub fn bytes_per_pixel(bpp: u8) -> Result<usize, FbError> {
    match bpp {
        15 | 16 => Ok(2),
        24 => Ok(3),
        32 => Ok(4),
        other => Err(FbError::UnsupportedDepth(other)),
    }
}

/// Widen a 5-bit channel to 8 bits, replicating the high bits into the low
/// ones so 0x1F maps to 0xFF rather than 0xF8.
fn expand5(v: u8) -> u8 {
    (v << 3) | (v >> 2)
}

fn expand6(v: u8) -> u8 {
    (v << 2) | (v >> 4)
}

/// Convert raw rect pixel data at `bpp` into packed RGB8.
///
/// 15/16-bit values are little-endian RGB555/RGB565; 24/32-bit data is
/// BGR(A) as both RDP and common VNC ServerInit formats send it. Trailing
/// partial pixels are ignored.
pub fn to_rgb8(data: &[u8], bpp: u8, width: usize, height: usize) -> Result<Vec<u8>, FbError> {
    let stride = bytes_per_pixel(bpp)?;
    let pixels = (data.len() / stride).min(width * height);
    let mut out = Vec::with_capacity(width * height * 3);

    for i in 0..pixels {
        let p = &data[i * stride..(i + 1) * stride];
        let (r, g, b) = match bpp {
            15 => {
                let v = u16::from_le_bytes([p[0], p[1]]);
                (
                    expand5(((v >> 10) & 0x1F) as u8),
                    expand5(((v >> 5) & 0x1F) as u8),
                    expand5((v & 0x1F) as u8),
                )
            }
            16 => {
                let v = u16::from_le_bytes([p[0], p[1]]);
                (
                    expand5(((v >> 11) & 0x1F) as u8),
                    expand6(((v >> 5) & 0x3F) as u8),
                    expand5((v & 0x1F) as u8),
                )
            }
            // BGR / BGRA; alpha dropped.
            _ => (p[2], p[1], p[0]),
        };
        out.extend_from_slice(&[r, g, b]);
    }

    // Short rects paint black for the missing tail.
    out.resize(width * height * 3, 0);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_bit_max_expands_to_full_white() {
        assert_eq!(expand5(0x1F), 0xFF);
        assert_eq!(expand6(0x3F), 0xFF);
        assert_eq!(expand5(0), 0);
    }

    #[test]
    fn rgb565_red_pixel() {
        // 0xF800 = pure red in RGB565, little-endian on the wire.
        let rgb = to_rgb8(&[0x00, 0xF8], 16, 1, 1).unwrap();
        assert_eq!(rgb, vec![0xFF, 0x00, 0x00]);
    }

    #[test]
    fn rgb555_green_pixel() {
        // 0x03E0 = pure green in RGB555.
        let rgb = to_rgb8(&[0xE0, 0x03], 15, 1, 1).unwrap();
        assert_eq!(rgb, vec![0x00, 0xFF, 0x00]);
    }

    #[test]
    fn bgra_drops_alpha() {
        let rgb = to_rgb8(&[0x01, 0x02, 0x03, 0x80], 32, 1, 1).unwrap();
        assert_eq!(rgb, vec![0x03, 0x02, 0x01]);
    }

    #[test]
    fn short_data_pads_black() {
        let rgb = to_rgb8(&[0x10, 0x20, 0x30], 24, 2, 1).unwrap();
        assert_eq!(rgb, vec![0x30, 0x20, 0x10, 0, 0, 0]);
    }

    #[test]
    fn unknown_depth_is_rejected() {
        assert!(to_rgb8(&[0], 8, 1, 1).is_err());
    }
}
