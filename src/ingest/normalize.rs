use anyhow::{anyhow, Result};

use crate::frame::rgb_len;

/// Pixel layouts a capture device may hand back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PixelFormat {
    Rgb24,
    Nv12,
}

/// Convert a device buffer into packed RGB8.
pub(crate) fn normalize_to_rgb(buf: &[u8], width: u32, height: u32, format: PixelFormat) -> Result<Vec<u8>> {
    match format {
        PixelFormat::Rgb24 => {
            let expected = rgb_len(width, height)?;
            // Some drivers pad the last buffer; anything shorter is a torn frame.
            if buf.len() < expected {
                return Err(anyhow!(
                    "short RGB buffer: expected {} bytes, got {}",
                    expected,
                    buf.len()
                ));
            }
            Ok(buf[..expected].to_vec())
        }
        PixelFormat::Nv12 => nv12_to_rgb(buf, width as usize, height as usize),
    }
}

fn nv12_to_rgb(buf: &[u8], w: usize, h: usize) -> Result<Vec<u8>> {
    let luma = w
        .checked_mul(h)
        .ok_or_else(|| anyhow!("NV12 frame dimensions overflow"))?;
    let expected = luma + luma / 2;
    if buf.len() < expected {
        return Err(anyhow!(
            "short NV12 buffer: expected {} bytes, got {}",
            expected,
            buf.len()
        ));
    }

    let (y_plane, uv_plane) = buf[..expected].split_at(luma);
    let mut rgb = Vec::with_capacity(luma * 3);
    for row in 0..h {
        for col in 0..w {
            let y = y_plane[row * w + col] as f32;
            let uv = (row / 2) * w + (col / 2) * 2;
            let u = uv_plane[uv] as f32 - 128.0;
            let v = uv_plane[uv + 1] as f32 - 128.0;
            rgb.push(to_u8(y + 1.402 * v));
            rgb.push(to_u8(y - 0.344_136 * u - 0.714_136 * v));
            rgb.push(to_u8(y + 1.772 * u));
        }
    }
    Ok(rgb)
}

fn to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}
