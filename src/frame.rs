//! Captured frames.
//!
//! A `Frame` is an RGB8 image plus its capture time. Frames are cloned only when
//! the orchestrator keeps the latest one for operator corrections.

use anyhow::{anyhow, Result};

use crate::Timestamp;

#[derive(Clone, Debug)]
pub struct Frame {
    pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub captured_at: Timestamp,
}

impl Frame {
    /// Build a frame from packed RGB8 pixels.
    pub fn from_rgb(pixels: Vec<u8>, width: u32, height: u32, captured_at: Timestamp) -> Result<Self> {
        let expected = rgb_len(width, height)?;
        if pixels.len() != expected {
            return Err(anyhow!(
                "expected {} RGB bytes for {}x{}, received {}",
                expected,
                width,
                height,
                pixels.len()
            ));
        }
        Ok(Self {
            pixels,
            width,
            height,
            captured_at,
        })
    }

    /// Uniform frame, mostly for tests and synthetic sources.
    pub fn solid(width: u32, height: u32, rgb: [u8; 3], captured_at: Timestamp) -> Result<Self> {
        let len = rgb_len(width, height)?;
        let mut pixels = Vec::with_capacity(len);
        for _ in 0..len / 3 {
            pixels.extend_from_slice(&rgb);
        }
        Self::from_rgb(pixels, width, height, captured_at)
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Copy into an `image` buffer for encoding.
    pub fn to_rgb_image(&self) -> Result<image::RgbImage> {
        image::RgbImage::from_raw(self.width, self.height, self.pixels.clone())
            .ok_or_else(|| anyhow!("frame buffer does not match {}x{}", self.width, self.height))
    }
}

pub(crate) fn rgb_len(width: u32, height: u32) -> Result<usize> {
    if width == 0 || height == 0 {
        return Err(anyhow!("frame dimensions must be non-zero"));
    }
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|v| v.checked_mul(3))
        .ok_or_else(|| anyhow!("frame dimensions overflow"))
}
