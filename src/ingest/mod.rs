//! Frame sources.
//!
//! The configured source string selects a backend:
//! - `stub://<name>[?frames=N]`: synthetic scenes (testing, demos)
//! - `0`, `1`, ... or `/dev/videoN`: V4L2 devices (feature: ingest-v4l2)
//! - any other path: a directory of JPEG/PNG stills replayed in name order
//!
//! All sources produce RGB8 `Frame`s stamped at capture time. `Ok(None)` from
//! `next_frame` is end-of-stream.

mod directory;
#[cfg(feature = "ingest-v4l2")]
mod normalize;
mod synthetic;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

use anyhow::{anyhow, Result};

pub use directory::DirectorySource;
pub use synthetic::{SyntheticSource, SCENE_LENGTH};
#[cfg(feature = "ingest-v4l2")]
pub use v4l2::V4l2Source;

use crate::frame::Frame;

/// First video device when capture support is compiled in, otherwise the
/// synthetic belt.
#[cfg(feature = "ingest-v4l2")]
pub const DEFAULT_CAMERA_SOURCE: &str = "0";
#[cfg(not(feature = "ingest-v4l2"))]
pub const DEFAULT_CAMERA_SOURCE: &str = "stub://camera";
pub const DEFAULT_FRAME_WIDTH: u32 = 640;
pub const DEFAULT_FRAME_HEIGHT: u32 = 480;
pub const DEFAULT_TARGET_FPS: u32 = 10;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CameraConfig {
    pub source: String,
    pub width: u32,
    pub height: u32,
    /// Capture rate requested from devices; synthetic sources ignore it.
    pub target_fps: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            source: DEFAULT_CAMERA_SOURCE.to_string(),
            width: DEFAULT_FRAME_WIDTH,
            height: DEFAULT_FRAME_HEIGHT,
            target_fps: DEFAULT_TARGET_FPS,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub source: String,
}

pub trait FrameSource: Send {
    fn connect(&mut self) -> Result<()>;

    /// Next frame, `Ok(None)` at end of stream. Errors end the session.
    fn next_frame(&mut self) -> Result<Option<Frame>>;

    fn is_healthy(&self) -> bool;

    fn stats(&self) -> SourceStats;

    /// Give the device back. Called once when the session ends.
    fn release(&mut self) {}
}

/// Source selected from configuration.
pub enum CameraSource {
    Synthetic(SyntheticSource),
    Directory(DirectorySource),
    #[cfg(feature = "ingest-v4l2")]
    Device(V4l2Source),
}

impl CameraSource {
    pub fn open(config: &CameraConfig) -> Result<Self> {
        let source = config.source.trim();
        if source.is_empty() {
            return Err(anyhow!("camera source must not be empty"));
        }
        if source.starts_with("stub://") {
            return Ok(CameraSource::Synthetic(SyntheticSource::new(config)?));
        }
        if let Some(device) = device_path(source) {
            return open_device(config, device);
        }
        Ok(CameraSource::Directory(DirectorySource::new(source)))
    }

    fn inner(&self) -> &dyn FrameSource {
        match self {
            CameraSource::Synthetic(source) => source as &dyn FrameSource,
            CameraSource::Directory(source) => source,
            #[cfg(feature = "ingest-v4l2")]
            CameraSource::Device(source) => source,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn FrameSource {
        match self {
            CameraSource::Synthetic(source) => source as &mut dyn FrameSource,
            CameraSource::Directory(source) => source,
            #[cfg(feature = "ingest-v4l2")]
            CameraSource::Device(source) => source,
        }
    }
}

impl FrameSource for CameraSource {
    fn connect(&mut self) -> Result<()> {
        self.inner_mut().connect()
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        self.inner_mut().next_frame()
    }

    fn is_healthy(&self) -> bool {
        self.inner().is_healthy()
    }

    fn stats(&self) -> SourceStats {
        self.inner().stats()
    }

    fn release(&mut self) {
        self.inner_mut().release()
    }
}

/// Camera indices map to `/dev/video<index>`.
fn device_path(source: &str) -> Option<String> {
    if source.starts_with("/dev/video") {
        return Some(source.to_string());
    }
    source
        .parse::<u32>()
        .ok()
        .map(|index| format!("/dev/video{}", index))
}

#[cfg(feature = "ingest-v4l2")]
fn open_device(config: &CameraConfig, device: String) -> Result<CameraSource> {
    Ok(CameraSource::Device(V4l2Source::new(v4l2::V4l2Config {
        device,
        target_fps: config.target_fps,
        width: config.width,
        height: config.height,
    })))
}

#[cfg(not(feature = "ingest-v4l2"))]
fn open_device(_config: &CameraConfig, device: String) -> Result<CameraSource> {
    Err(anyhow!(crate::error::SortError::Capture(format!(
        "{}: built without feature 'ingest-v4l2'; set camera.source (or SMART_BIN_CAMERA) \
         to a frame directory or a stub:// source",
        device
    ))))
}
