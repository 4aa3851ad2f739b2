use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use super::{FrameSource, SourceStats};
use crate::error::SortError;
use crate::frame::Frame;
use crate::Timestamp;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

/// Replays the still images of a directory in file-name order.
pub struct DirectorySource {
    dir: PathBuf,
    queue: Vec<PathBuf>,
    position: usize,
    frame_count: u64,
    last_error: Option<String>,
}

impl DirectorySource {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self {
            dir: dir.into(),
            queue: Vec::new(),
            position: 0,
            frame_count: 0,
            last_error: None,
        }
    }

    fn load(&self, path: &Path) -> Result<Frame> {
        let image = image::open(path)
            .map_err(|e| SortError::Capture(format!("{}: {}", path.display(), e)))?
            .to_rgb8();
        let (width, height) = image.dimensions();
        Frame::from_rgb(image.into_raw(), width, height, Timestamp::now()?)
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

impl FrameSource for DirectorySource {
    fn connect(&mut self) -> Result<()> {
        let entries = fs::read_dir(&self.dir)
            .map_err(|e| SortError::Capture(format!("{}: {}", self.dir.display(), e)))
            .with_context(|| format!("open frame directory {}", self.dir.display()))?;
        let mut queue = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.is_file() && is_image(&path) {
                queue.push(path);
            }
        }
        queue.sort();
        log::info!(
            "DirectorySource: connected to {} ({} images)",
            self.dir.display(),
            queue.len()
        );
        self.queue = queue;
        self.position = 0;
        self.last_error = None;
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let Some(path) = self.queue.get(self.position).cloned() else {
            return Ok(None);
        };
        self.position += 1;
        match self.load(&path) {
            Ok(frame) => {
                self.frame_count += 1;
                Ok(Some(frame))
            }
            Err(err) => {
                self.last_error = Some(err.to_string());
                Err(err)
            }
        }
    }

    fn is_healthy(&self) -> bool {
        self.last_error.is_none()
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            source: self.dir.display().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_png(path: &Path, rgb: [u8; 3]) {
        image::RgbImage::from_pixel(4, 3, image::Rgb(rgb))
            .save(path)
            .unwrap();
    }

    #[test]
    fn replays_images_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        write_png(&dir.path().join("b.png"), [0, 255, 0]);
        write_png(&dir.path().join("a.png"), [255, 0, 0]);
        fs::write(dir.path().join("notes.txt"), "not an image").unwrap();

        let mut source = DirectorySource::new(dir.path());
        source.connect().unwrap();
        let first = source.next_frame().unwrap().unwrap();
        assert_eq!(&first.pixels()[..3], &[255, 0, 0]);
        assert_eq!((first.width, first.height), (4, 3));
        let second = source.next_frame().unwrap().unwrap();
        assert_eq!(&second.pixels()[..3], &[0, 255, 0]);
        assert!(source.next_frame().unwrap().is_none());
        assert_eq!(source.stats().frames_captured, 2);
    }

    #[test]
    fn undecodable_images_are_capture_errors() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("broken.jpg"), b"definitely not a jpeg").unwrap();
        let mut source = DirectorySource::new(dir.path());
        source.connect().unwrap();
        let err = source.next_frame().unwrap_err();
        assert!(matches!(err.downcast_ref::<SortError>(), Some(SortError::Capture(_))));
        assert!(!source.is_healthy());
    }

    #[test]
    fn missing_directory_fails_to_connect() {
        let mut source = DirectorySource::new("/nonexistent/smart-bin-frames");
        assert!(source.connect().is_err());
    }
}
