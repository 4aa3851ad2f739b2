use anyhow::{anyhow, Result};

use super::{CameraConfig, FrameSource, SourceStats};
use crate::frame::Frame;
use crate::Timestamp;

/// Frames per synthetic scene. Pixels are constant within a scene.
pub const SCENE_LENGTH: u64 = 50;

/// Synthetic scenes for `stub://` sources.
///
/// Each scene is a solid color, so detectors that key on pixels see the same
/// "object" for `SCENE_LENGTH` frames and then a new one. `?frames=N` makes
/// the stream finite.
pub struct SyntheticSource {
    name: String,
    width: u32,
    height: u32,
    frame_limit: Option<u64>,
    frame_count: u64,
}

impl SyntheticSource {
    pub fn new(config: &CameraConfig) -> Result<Self> {
        let (name, frame_limit) = parse_stub_uri(config.source.trim())?;
        if config.width == 0 || config.height == 0 {
            return Err(anyhow!("synthetic source needs a non-zero frame size"));
        }
        Ok(Self {
            name,
            width: config.width,
            height: config.height,
            frame_limit,
            frame_count: 0,
        })
    }

    fn scene_color(&self) -> [u8; 3] {
        let scene = self.frame_count / SCENE_LENGTH;
        [
            (scene.wrapping_mul(53) % 256) as u8,
            (scene.wrapping_mul(97).wrapping_add(40) % 256) as u8,
            (scene.wrapping_mul(151).wrapping_add(80) % 256) as u8,
        ]
    }
}

fn parse_stub_uri(uri: &str) -> Result<(String, Option<u64>)> {
    let rest = uri
        .strip_prefix("stub://")
        .ok_or_else(|| anyhow!("not a stub source: {}", uri))?;
    let (name, query) = match rest.split_once('?') {
        Some((name, query)) => (name, Some(query)),
        None => (rest, None),
    };
    let mut frame_limit = None;
    for pair in query.unwrap_or_default().split('&').filter(|p| !p.is_empty()) {
        match pair.split_once('=') {
            Some(("frames", value)) => {
                frame_limit = Some(
                    value
                        .parse::<u64>()
                        .map_err(|_| anyhow!("invalid frame count in {}", uri))?,
                );
            }
            _ => return Err(anyhow!("unknown stub option '{}' in {}", pair, uri)),
        }
    }
    Ok((name.to_string(), frame_limit))
}

impl FrameSource for SyntheticSource {
    fn connect(&mut self) -> Result<()> {
        log::info!("SyntheticSource: connected to stub://{}", self.name);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.frame_limit.is_some_and(|limit| self.frame_count >= limit) {
            return Ok(None);
        }
        let color = self.scene_color();
        self.frame_count += 1;
        Frame::solid(self.width, self.height, color, Timestamp::now()?).map(Some)
    }

    fn is_healthy(&self) -> bool {
        true
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            source: format!("stub://{}", self.name),
        }
    }
}
