//! V4L2 camera source.
//!
//! Requests RGB3 at the configured size and rate; devices that insist on NV12
//! are converted to RGB in `normalize`.

use anyhow::{anyhow, Context, Result};
use ouroboros::self_referencing;
use std::time::{Duration, Instant};

use super::normalize::{normalize_to_rgb, PixelFormat};
use super::{FrameSource, SourceStats};
use crate::error::SortError;
use crate::frame::Frame;
use crate::Timestamp;

#[derive(Clone, Debug)]
pub struct V4l2Config {
    /// Device path (e.g., "/dev/video0")
    pub device: String,
    pub target_fps: u32,
    pub width: u32,
    pub height: u32,
}

pub struct V4l2Source {
    config: V4l2Config,
    state: Option<DeviceState>,
    pixel_format: PixelFormat,
    frame_count: u64,
    last_frame_at: Option<Instant>,
    last_error: Option<String>,
    active_width: u32,
    active_height: u32,
}

#[self_referencing]
struct DeviceState {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

impl V4l2Source {
    pub fn new(config: V4l2Config) -> Self {
        Self {
            active_width: config.width,
            active_height: config.height,
            config,
            state: None,
            pixel_format: PixelFormat::Rgb24,
            frame_count: 0,
            last_frame_at: None,
            last_error: None,
        }
    }

    fn health_grace(&self) -> Duration {
        let base_ms = if self.config.target_fps == 0 {
            2_000
        } else {
            (1000 / self.config.target_fps).saturating_mul(6)
        };
        Duration::from_millis(base_ms.max(2_000) as u64)
    }

    fn capture_error(&mut self, err: impl std::fmt::Display) -> anyhow::Error {
        let message = format!("{}: {}", self.config.device, err);
        self.last_error = Some(message.clone());
        anyhow!(SortError::Capture(message))
    }
}

impl FrameSource for V4l2Source {
    fn connect(&mut self) -> Result<()> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let mut device = v4l::Device::with_path(&self.config.device)
            .map_err(|e| SortError::Capture(format!("{}: {}", self.config.device, e)))
            .with_context(|| format!("open v4l2 device {}", self.config.device))?;
        let mut format = device.format().context("read v4l2 format")?;
        format.width = self.config.width;
        format.height = self.config.height;
        format.fourcc = v4l::FourCC::new(b"RGB3");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!(
                    "V4l2Source: failed to set format on {}: {}",
                    self.config.device,
                    err
                );
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };
        self.pixel_format = match &format.fourcc.repr {
            b"RGB3" => PixelFormat::Rgb24,
            b"NV12" => PixelFormat::Nv12,
            other => {
                return Err(self.capture_error(format!(
                    "unsupported pixel format {}",
                    String::from_utf8_lossy(other)
                )))
            }
        };

        if self.config.target_fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(self.config.target_fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!(
                    "V4l2Source: failed to set fps on {}: {}",
                    self.config.device,
                    err
                );
            }
        }

        self.active_width = format.width;
        self.active_height = format.height;
        self.last_error = None;

        let state = DeviceStateBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()
        .map_err(|err| {
            self.last_error = Some(err.to_string());
            err
        })?;
        self.state = Some(state);

        log::info!(
            "V4l2Source: connected to {} ({}x{}, {:?})",
            self.config.device,
            self.active_width,
            self.active_height,
            self.pixel_format
        );
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        use v4l::io::traits::CaptureStream;

        let Some(state) = self.state.as_mut() else {
            return Err(anyhow!(SortError::Capture(format!(
                "{}: not connected",
                self.config.device
            ))));
        };
        let captured = state.with_mut(|fields| fields.stream.next().map(|(buf, _meta)| buf.to_vec()));
        let buf = match captured {
            Ok(buf) => buf,
            Err(err) => return Err(self.capture_error(err)),
        };

        let pixels = match normalize_to_rgb(&buf, self.active_width, self.active_height, self.pixel_format) {
            Ok(pixels) => pixels,
            Err(err) => return Err(self.capture_error(err)),
        };
        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());
        Frame::from_rgb(pixels, self.active_width, self.active_height, Timestamp::now()?).map(Some)
    }

    fn is_healthy(&self) -> bool {
        if self.last_error.is_some() {
            return false;
        }
        let Some(last_frame_at) = self.last_frame_at else {
            return true;
        };
        last_frame_at.elapsed() <= self.health_grace()
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            source: self.config.device.clone(),
        }
    }

    fn release(&mut self) {
        if self.state.take().is_some() {
            log::info!("V4l2Source: released {}", self.config.device);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconnected_device_reports_capture_error() {
        let mut source = V4l2Source::new(V4l2Config {
            device: "/dev/video-missing".to_string(),
            target_fps: 0,
            width: 640,
            height: 480,
        });
        let err = source.next_frame().unwrap_err();
        assert!(matches!(err.downcast_ref::<SortError>(), Some(SortError::Capture(_))));
        assert_eq!(source.health_grace(), Duration::from_millis(2_000));
    }
}
