//! Interleaved RLE bitmap decompression (MS-RDPBCGR 2.2.9.1.1.3.1.2.4).
//!
//! Compressed rows arrive bottom-up; the output buffer is returned top-down
//! so callers can feed it straight to pixel conversion. Every input read and
//! output write is bounds-checked; malformed streams fail instead of
//! panicking.

use crate::FbError;

struct Input<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Input<'a> {
    fn has(&self) -> bool {
        self.pos < self.data.len()
    }

    fn u8(&mut self) -> Result<u8, FbError> {
        let b = *self
            .data
            .get(self.pos)
            .ok_or(FbError::Corrupt("truncated order"))?;
        self.pos += 1;
        Ok(b)
    }

    fn u16(&mut self) -> Result<usize, FbError> {
        let lo = self.u8()? as usize;
        let hi = self.u8()? as usize;
        Ok(lo | (hi << 8))
    }

    fn pixel(&mut self, ps: usize) -> Result<u32, FbError> {
        let mut v = 0u32;
        for i in 0..ps {
            v |= (self.u8()? as u32) << (8 * i);
        }
        Ok(v)
    }
}

/// Decompress an interleaved-RLE bitmap into raw little-endian pixel data
/// (`width * height * bytes_per_pixel` bytes, top-down rows).
pub fn decompress(data: &[u8], width: usize, height: usize, bpp: u8) -> Result<Vec<u8>, FbError> {
    let ps = match bpp {
        15 | 16 => 2,
        24 => 3,
        // 32-bit rects use the planar codec, which servers only send when
        // the client advertises it. We never do.
        other => return Err(FbError::UnsupportedDepth(other)),
    };
    if width == 0 || height == 0 {
        return Ok(Vec::new());
    }

    let white: u32 = (1u64 << (ps * 8)) as u32 - 1;
    let mut out = vec![0u32; width * height];
    let mut input = Input { data, pos: 0 };

    let mut rows_left = height;
    let mut x = width; // forces a row advance before the first write
    let mut line_start = 0usize;
    let mut prev_start: Option<usize> = None;
    let mut started = false;

    let mut mix = white;
    let mut colour1 = 0u32;
    let mut colour2 = 0u32;
    let mut insertmix = false;
    let mut bicolour = false;
    let mut last_opcode: i32 = -1;

    while input.has() {
        let code = input.u8()?;
        let mut opcode = (code >> 4) as u32;
        let mut fom_mask = 0u8;
        let mut mask = 0u8;
        let mut mixmask = 0u8;

        let (mut count, offset): (usize, usize) = match opcode {
            0xc..=0xe => {
                // lite form: 4-bit count
                opcode -= 6;
                ((code & 0x0f) as usize, 16)
            }
            0xf => {
                // mega form: 16-bit count (or fixed single-pixel orders)
                opcode = (code & 0x0f) as u32;
                let count = if opcode < 9 {
                    input.u16()?
                } else if opcode < 0xb {
                    8
                } else {
                    1
                };
                (count, 0)
            }
            _ => {
                // regular form: 3-bit opcode, 5-bit count
                opcode >>= 1;
                ((code & 0x1f) as usize, 32)
            }
        };

        if offset != 0 {
            let is_fill_or_mix = opcode == 2 || opcode == 7;
            if count == 0 {
                count = input.u8()? as usize + if is_fill_or_mix { 1 } else { offset };
            } else if is_fill_or_mix {
                count <<= 3;
            }
        }

        match opcode {
            0 => {
                // back-to-back fills insert one mixed pixel between runs
                if last_opcode == 0 && !(x == width && prev_start.is_none()) {
                    insertmix = true;
                }
            }
            3 => colour2 = input.pixel(ps)?,
            6 | 7 => {
                mix = input.pixel(ps)?;
                opcode -= 5;
            }
            8 => {
                colour1 = input.pixel(ps)?;
                colour2 = input.pixel(ps)?;
            }
            9 => {
                mask = 0x03;
                fom_mask = 0x03;
                opcode = 2;
            }
            0xa => {
                mask = 0x05;
                fom_mask = 0x05;
                opcode = 2;
            }
            _ => {}
        }
        last_opcode = opcode as i32;

        while count > 0 {
            if x >= width {
                if rows_left == 0 {
                    return Err(FbError::Corrupt("run extends past bitmap"));
                }
                x = 0;
                rows_left -= 1;
                prev_start = started.then_some(line_start);
                line_start = rows_left * width;
                started = true;
            }

            match opcode {
                0 => {
                    // fill: copy previous row (black on the first row)
                    if insertmix {
                        out[line_start + x] = match prev_start {
                            Some(p) => out[p + x] ^ mix,
                            None => mix,
                        };
                        insertmix = false;
                        count -= 1;
                        x += 1;
                    }
                    while count > 0 && x < width {
                        out[line_start + x] = prev_start.map_or(0, |p| out[p + x]);
                        count -= 1;
                        x += 1;
                    }
                }
                1 => {
                    while count > 0 && x < width {
                        out[line_start + x] = match prev_start {
                            Some(p) => out[p + x] ^ mix,
                            None => mix,
                        };
                        count -= 1;
                        x += 1;
                    }
                }
                2 => {
                    while count > 0 && x < width {
                        mixmask <<= 1;
                        if mixmask == 0 {
                            mask = if fom_mask != 0 { fom_mask } else { input.u8()? };
                            mixmask = 1;
                        }
                        out[line_start + x] = match prev_start {
                            Some(p) => {
                                if mask & mixmask != 0 {
                                    out[p + x] ^ mix
                                } else {
                                    out[p + x]
                                }
                            }
                            None => {
                                if mask & mixmask != 0 {
                                    mix
                                } else {
                                    0
                                }
                            }
                        };
                        count -= 1;
                        x += 1;
                    }
                }
                3 => {
                    while count > 0 && x < width {
                        out[line_start + x] = colour2;
                        count -= 1;
                        x += 1;
                    }
                }
                4 => {
                    while count > 0 && x < width {
                        out[line_start + x] = input.pixel(ps)?;
                        count -= 1;
                        x += 1;
                    }
                }
                8 => {
                    while count > 0 && x < width {
                        if bicolour {
                            out[line_start + x] = colour2;
                            bicolour = false;
                        } else {
                            out[line_start + x] = colour1;
                            bicolour = true;
                            count += 1;
                        }
                        count -= 1;
                        x += 1;
                    }
                }
                0xd => {
                    while count > 0 && x < width {
                        out[line_start + x] = white;
                        count -= 1;
                        x += 1;
                    }
                }
                0xe => {
                    while count > 0 && x < width {
                        out[line_start + x] = 0;
                        count -= 1;
                        x += 1;
                    }
                }
                _ => return Err(FbError::Corrupt("unknown order code")),
            }
        }
    }

    let mut bytes = Vec::with_capacity(out.len() * ps);
    for px in out {
        bytes.extend_from_slice(&px.to_le_bytes()[..ps]);
    }
    Ok(bytes)
}
